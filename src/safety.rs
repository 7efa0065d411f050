//! Software Soft Limits
//!
//! The validator is the last gate before a motion frame is built. It has no
//! hardware side effects: given a target and the current [`MachineState`] it
//! either approves the move or explains why not.
//!
//! Checks, in order:
//! 1. The machine must be homed and idle (`Homed` or `Idle`).
//! 2. Each axis must lie inside the [`TravelEnvelope`]. Bounds are inclusive,
//!    NaN is always out of bounds.
//!
//! Feed rates are not rejected, only clamped into [`FeedLimits`].

use crate::coordinates::PhysicalPosition;
use crate::error::{AppResult, Axis, GantryError, ValidationError};
use crate::motion::{MachineState, MachineStatus};
use tracing::warn;

/// Per-axis travel limits in millimetres (inclusive).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TravelEnvelope {
    x_min: f64,
    x_max: f64,
    y_min: f64,
    y_max: f64,
}

impl TravelEnvelope {
    /// Build an envelope.
    ///
    /// # Errors
    /// Returns [`GantryError::Configuration`] if any bound is non-finite or a
    /// minimum exceeds its maximum.
    pub fn new(x_min: f64, x_max: f64, y_min: f64, y_max: f64) -> AppResult<Self> {
        for (axis, min, max) in [(Axis::X, x_min, x_max), (Axis::Y, y_min, y_max)] {
            if !(min.is_finite() && max.is_finite()) || min > max {
                return Err(GantryError::Configuration(format!(
                    "Invalid {} travel range [{}, {}]",
                    axis, min, max
                )));
            }
        }
        Ok(Self {
            x_min,
            x_max,
            y_min,
            y_max,
        })
    }

    /// Limits for one axis as `(min, max)`.
    pub fn range(&self, axis: Axis) -> (f64, f64) {
        match axis {
            Axis::X => (self.x_min, self.x_max),
            Axis::Y => (self.y_min, self.y_max),
        }
    }

    /// True when both coordinates are within the envelope.
    pub fn contains(&self, position: PhysicalPosition) -> bool {
        self.check_axis(Axis::X, position.x).is_ok() && self.check_axis(Axis::Y, position.y).is_ok()
    }

    fn check_axis(&self, axis: Axis, value: f64) -> Result<(), ValidationError> {
        let (min, max) = self.range(axis);
        // Written so that NaN fails
        if value >= min && value <= max {
            Ok(())
        } else {
            Err(ValidationError::OutOfBounds {
                axis,
                value,
                min,
                max,
            })
        }
    }
}

/// Allowed commanded feed range in mm/min.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedLimits {
    min_mm_min: u32,
    max_mm_min: u32,
}

impl FeedLimits {
    /// Build feed limits.
    ///
    /// # Errors
    /// Returns [`GantryError::Configuration`] when `min` is zero or above `max`.
    pub fn new(min_mm_min: u32, max_mm_min: u32) -> AppResult<Self> {
        if min_mm_min == 0 || min_mm_min > max_mm_min {
            return Err(GantryError::Configuration(format!(
                "Invalid feed limits [{}, {}] mm/min",
                min_mm_min, max_mm_min
            )));
        }
        Ok(Self {
            min_mm_min,
            max_mm_min,
        })
    }

    /// Lowest permitted feed.
    pub fn min(&self) -> u32 {
        self.min_mm_min
    }

    /// Highest permitted feed.
    pub fn max(&self) -> u32 {
        self.max_mm_min
    }
}

impl Default for FeedLimits {
    fn default() -> Self {
        Self {
            min_mm_min: 100,
            max_mm_min: 5000,
        }
    }
}

/// Approves or rejects motion targets against the envelope and machine state.
#[derive(Debug, Clone)]
pub struct SafetyValidator {
    envelope: TravelEnvelope,
    feed_limits: FeedLimits,
}

impl SafetyValidator {
    /// Create a validator with default feed limits.
    pub fn new(envelope: TravelEnvelope) -> Self {
        Self {
            envelope,
            feed_limits: FeedLimits::default(),
        }
    }

    /// Replace the feed limits.
    pub fn with_feed_limits(mut self, feed_limits: FeedLimits) -> Self {
        self.feed_limits = feed_limits;
        self
    }

    /// Configured envelope.
    pub fn envelope(&self) -> &TravelEnvelope {
        &self.envelope
    }

    /// Configured feed limits.
    pub fn feed_limits(&self) -> FeedLimits {
        self.feed_limits
    }

    /// Full pre-motion check: state gate, then both axes.
    pub fn check(
        &self,
        target: PhysicalPosition,
        state: &MachineState,
    ) -> Result<(), ValidationError> {
        self.check_state(state.status)?;
        self.check_bounds(target)
    }

    /// Reject unless the machine is `Homed` or `Idle`.
    pub fn check_state(&self, status: MachineStatus) -> Result<(), ValidationError> {
        match status {
            MachineStatus::Homed | MachineStatus::Idle => Ok(()),
            other => Err(ValidationError::NotHomed { state: other }),
        }
    }

    /// Reject targets outside the envelope. X is checked first.
    pub fn check_bounds(&self, target: PhysicalPosition) -> Result<(), ValidationError> {
        self.envelope.check_axis(Axis::X, target.x)?;
        self.envelope.check_axis(Axis::Y, target.y)
    }

    /// Clamp a requested feed into the configured limits.
    pub fn clamp_feed(&self, requested_mm_min: u32) -> u32 {
        let clamped = requested_mm_min.clamp(self.feed_limits.min_mm_min, self.feed_limits.max_mm_min);
        if clamped != requested_mm_min {
            warn!(
                requested = requested_mm_min,
                clamped, "Feed rate limited to configured range"
            );
        }
        clamped
    }
}
