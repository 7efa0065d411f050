//! Configuration using Figment
//!
//! This module provides strongly-typed configuration loading for the gantry.
//! Configuration is loaded from:
//! 1. `config/gantry.toml` (base configuration, optional)
//! 2. Environment variables prefixed with `GANTRY_`, nested keys split on `__`
//!
//! Every field has a default matching the reference machine (400×400 mm board,
//! 8×8 cells, 115200 baud), so an empty file is a valid configuration.
//!
//! # Example
//! ```no_run
//! use gantry_motion::config::GantryConfig;
//!
//! let config = GantryConfig::load()?;
//! config.validate()?;
//! println!("Serial port: {}", config.serial.port);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use crate::coordinates::{CoordinateFrame, CoordinateTransformer, PhysicalPosition, MAX_FILES, MAX_RANKS};
use crate::error::{AppResult, GantryError};
use crate::hardware::{PortOpener, ProtocolController, ProtocolSettings};
use crate::motion::{MotionOrchestrator, MotionSettings};
use crate::safety::{FeedLimits, SafetyValidator, TravelEnvelope};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/gantry.toml";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GantryConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Serial link
    pub serial: SerialConfig,
    /// Board geometry
    pub board: BoardConfig,
    /// Soft limits
    pub envelope: EnvelopeConfig,
    /// Motion parameters
    pub motion: MotionConfig,
    /// Protocol and motion deadlines
    pub timeouts: TimeoutConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Serial link configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Port identifier, e.g. `/dev/ttyUSB0` or `COM3`
    #[serde(default = "default_port")]
    pub port: String,
    /// Baud rate
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
}

/// Board geometry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoardConfig {
    /// Physical width (mm)
    #[serde(default = "default_board_size")]
    pub width_mm: f64,
    /// Physical height (mm)
    #[serde(default = "default_board_size")]
    pub height_mm: f64,
    /// Cells along X
    #[serde(default = "default_cells")]
    pub files: u8,
    /// Cells along Y
    #[serde(default = "default_cells")]
    pub ranks: u8,
    /// Board corner X offset from machine origin (mm)
    #[serde(default)]
    pub origin_x_mm: f64,
    /// Board corner Y offset from machine origin (mm)
    #[serde(default)]
    pub origin_y_mm: f64,
}

/// Travel envelope (inclusive, mm)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvelopeConfig {
    /// Minimum X
    #[serde(default)]
    pub x_min: f64,
    /// Maximum X
    #[serde(default = "default_board_size")]
    pub x_max: f64,
    /// Minimum Y
    #[serde(default)]
    pub y_min: f64,
    /// Maximum Y
    #[serde(default = "default_board_size")]
    pub y_max: f64,
}

/// Motion parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MotionConfig {
    /// Feed rate for moves (mm/min)
    #[serde(default = "default_feed")]
    pub default_feed_mm_min: u32,
    /// Lowest permitted feed (mm/min)
    #[serde(default = "default_min_feed")]
    pub min_feed_mm_min: u32,
    /// Highest permitted feed (mm/min)
    #[serde(default = "default_max_feed")]
    pub max_feed_mm_min: u32,
    /// X reported after homing (mm)
    #[serde(default)]
    pub home_x_mm: f64,
    /// Y reported after homing (mm)
    #[serde(default)]
    pub home_y_mm: f64,
    /// Follow each move with a `G4 P0` dwell
    #[serde(default = "default_sync_after_move")]
    pub sync_after_move: bool,
    /// Default cadence for the `monitor` status poller
    #[serde(default, with = "humantime_serde")]
    pub poll_interval: Option<Duration>,
}

/// Deadlines, written as humantime strings (`"5s"`, `"250ms"`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Ordinary command
    #[serde(default = "default_command_timeout", with = "humantime_serde")]
    pub command: Duration,
    /// Motion frame and its sync dwell
    #[serde(default = "default_motion_timeout", with = "humantime_serde")]
    pub motion: Duration,
    /// Homing cycle
    #[serde(default = "default_homing_timeout", with = "humantime_serde")]
    pub homing: Duration,
    /// Status query
    #[serde(default = "default_status_timeout", with = "humantime_serde")]
    pub status: Duration,
    /// Wait for the startup banner
    #[serde(default = "default_startup_timeout", with = "humantime_serde")]
    pub startup: Duration,
    /// Silence that ends a banner drain
    #[serde(default = "default_quiet_period", with = "humantime_serde")]
    pub quiet: Duration,
}

// Default value functions
fn default_name() -> String {
    "Gantry".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_port() -> String {
    if cfg!(windows) {
        "COM3".to_string()
    } else {
        "/dev/ttyUSB0".to_string()
    }
}

fn default_baud_rate() -> u32 {
    115_200
}

fn default_board_size() -> f64 {
    400.0
}

fn default_cells() -> u8 {
    8
}

fn default_feed() -> u32 {
    2000
}

fn default_min_feed() -> u32 {
    100
}

fn default_max_feed() -> u32 {
    5000
}

fn default_sync_after_move() -> bool {
    true
}

fn default_command_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_motion_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_homing_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_status_timeout() -> Duration {
    Duration::from_secs(1)
}

fn default_startup_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_quiet_period() -> Duration {
    Duration::from_millis(100)
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
        }
    }
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            baud_rate: default_baud_rate(),
        }
    }
}

impl Default for BoardConfig {
    fn default() -> Self {
        Self {
            width_mm: default_board_size(),
            height_mm: default_board_size(),
            files: default_cells(),
            ranks: default_cells(),
            origin_x_mm: 0.0,
            origin_y_mm: 0.0,
        }
    }
}

impl Default for EnvelopeConfig {
    fn default() -> Self {
        Self {
            x_min: 0.0,
            x_max: default_board_size(),
            y_min: 0.0,
            y_max: default_board_size(),
        }
    }
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            default_feed_mm_min: default_feed(),
            min_feed_mm_min: default_min_feed(),
            max_feed_mm_min: default_max_feed(),
            home_x_mm: 0.0,
            home_y_mm: 0.0,
            sync_after_move: default_sync_after_move(),
            poll_interval: None,
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            command: default_command_timeout(),
            motion: default_motion_timeout(),
            homing: default_homing_timeout(),
            status: default_status_timeout(),
            startup: default_startup_timeout(),
            quiet: default_quiet_period(),
        }
    }
}

impl GantryConfig {
    /// Load configuration from `config/gantry.toml` and environment variables
    ///
    /// Environment variables override the file with prefix `GANTRY_`.
    /// Example: `GANTRY_SERIAL__PORT=/dev/ttyACM0`
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    ///
    /// A missing file is not an error; defaults and environment apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("GANTRY_").split("__"))
            .extract()
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.serial.baud_rate == 0 {
            return Err("Invalid baud_rate 0".to_string());
        }

        let board = &self.board;
        if !(board.width_mm.is_finite() && board.width_mm > 0.0)
            || !(board.height_mm.is_finite() && board.height_mm > 0.0)
        {
            return Err(format!(
                "Invalid board size {}x{} mm. Dimensions must be positive",
                board.width_mm, board.height_mm
            ));
        }
        if board.files == 0 || board.files > MAX_FILES {
            return Err(format!(
                "Invalid files {}. Must be 1-{}",
                board.files, MAX_FILES
            ));
        }
        if board.ranks == 0 || board.ranks > MAX_RANKS {
            return Err(format!(
                "Invalid ranks {}. Must be 1-{}",
                board.ranks, MAX_RANKS
            ));
        }

        let envelope = &self.envelope;
        if envelope.x_min > envelope.x_max || envelope.y_min > envelope.y_max {
            return Err(format!(
                "Inverted travel envelope X[{}, {}] Y[{}, {}]",
                envelope.x_min, envelope.x_max, envelope.y_min, envelope.y_max
            ));
        }

        let motion = &self.motion;
        if motion.min_feed_mm_min == 0 || motion.min_feed_mm_min > motion.max_feed_mm_min {
            return Err(format!(
                "Invalid feed limits [{}, {}] mm/min",
                motion.min_feed_mm_min, motion.max_feed_mm_min
            ));
        }
        if motion.default_feed_mm_min == 0 {
            return Err("Invalid default_feed_mm_min 0".to_string());
        }

        let timeouts = &self.timeouts;
        for (name, value) in [
            ("command", timeouts.command),
            ("motion", timeouts.motion),
            ("homing", timeouts.homing),
            ("status", timeouts.status),
        ] {
            if value.is_zero() {
                return Err(format!("Timeout '{}' must be greater than zero", name));
            }
        }

        Ok(())
    }

    /// Board geometry
    pub fn coordinate_frame(&self) -> AppResult<CoordinateFrame> {
        CoordinateFrame::new(
            self.board.width_mm,
            self.board.height_mm,
            self.board.files,
            self.board.ranks,
            PhysicalPosition::new(self.board.origin_x_mm, self.board.origin_y_mm),
        )
    }

    /// Soft limits
    pub fn travel_envelope(&self) -> AppResult<TravelEnvelope> {
        TravelEnvelope::new(
            self.envelope.x_min,
            self.envelope.x_max,
            self.envelope.y_min,
            self.envelope.y_max,
        )
    }

    /// Feed clamp range
    pub fn feed_limits(&self) -> AppResult<FeedLimits> {
        FeedLimits::new(self.motion.min_feed_mm_min, self.motion.max_feed_mm_min)
    }

    /// Protocol timing
    pub fn protocol_settings(&self) -> ProtocolSettings {
        ProtocolSettings {
            command_timeout: self.timeouts.command,
            status_timeout: self.timeouts.status,
            startup_timeout: self.timeouts.startup,
            quiet_period: self.timeouts.quiet,
        }
    }

    /// Motion parameters
    pub fn motion_settings(&self) -> MotionSettings {
        MotionSettings {
            default_feed_mm_min: self.motion.default_feed_mm_min,
            home_position: PhysicalPosition::new(self.motion.home_x_mm, self.motion.home_y_mm),
            sync_after_move: self.motion.sync_after_move,
            motion_timeout: self.timeouts.motion,
            homing_timeout: self.timeouts.homing,
        }
    }

    /// Validate and assemble the full motion stack around `opener`.
    pub fn build_orchestrator(&self, opener: Arc<dyn PortOpener>) -> AppResult<MotionOrchestrator> {
        self.validate().map_err(GantryError::Configuration)?;
        let transformer = CoordinateTransformer::new(self.coordinate_frame()?);
        let validator = SafetyValidator::new(self.travel_envelope()?).with_feed_limits(self.feed_limits()?);
        let controller = ProtocolController::new(opener, self.protocol_settings());
        Ok(MotionOrchestrator::new(
            controller,
            transformer,
            validator,
            self.motion_settings(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = GantryConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.serial.baud_rate, 115_200);
        assert_eq!(config.motion.default_feed_mm_min, 2000);
        assert_eq!(config.timeouts.command, Duration::from_secs(5));
    }

    #[test]
    fn test_load_partial_file() {
        let file = write_config(
            r#"
            [serial]
            port = "/dev/ttyACM0"

            [board]
            files = 10
            ranks = 10

            [motion]
            poll_interval = "750ms"

            [timeouts]
            motion = "45s"
            quiet = "250ms"
            "#,
        );

        let config = GantryConfig::load_from(file.path()).unwrap();
        assert_eq!(config.serial.port, "/dev/ttyACM0");
        assert_eq!(config.serial.baud_rate, 115_200);
        assert_eq!(config.board.files, 10);
        assert_eq!(config.board.width_mm, 400.0);
        assert_eq!(config.timeouts.motion, Duration::from_secs(45));
        assert_eq!(config.timeouts.quiet, Duration::from_millis(250));
        assert_eq!(config.motion.poll_interval, Some(Duration::from_millis(750)));
        assert_eq!(config.motion.max_feed_mm_min, 5000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = GantryConfig::load_from(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.board.files, 8);
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = GantryConfig::default();
        config.application.log_level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_geometry_and_limits() {
        let mut config = GantryConfig::default();
        config.board.files = 27;
        assert!(config.validate().is_err());

        let mut config = GantryConfig::default();
        config.envelope.x_min = 500.0;
        assert!(config.validate().unwrap_err().contains("Inverted"));

        let mut config = GantryConfig::default();
        config.motion.min_feed_mm_min = 6000;
        assert!(config.validate().is_err());

        let mut config = GantryConfig::default();
        config.board.width_mm = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_builders() {
        let config = GantryConfig::default();
        let frame = config.coordinate_frame().unwrap();
        assert_eq!(frame.pitch_x(), 50.0);
        assert_eq!(config.motion_settings().home_position, PhysicalPosition::ORIGIN);
        assert_eq!(config.protocol_settings().startup_timeout, Duration::from_secs(2));
        assert_eq!(config.feed_limits().unwrap().max(), 5000);
    }
}
