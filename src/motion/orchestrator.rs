//! Motion Orchestrator
//!
//! The single owner of [`MachineState`]. Every hardware interaction goes
//! through here:
//!
//! ```text
//! move_to_cell("C4") → parse_cell_id → to_physical → SafetyValidator::check
//!                    → Moving → ProtocolController::send_command → Idle | Alarm | Unknown
//! ```
//!
//! # Serialization
//!
//! - `link`: async mutex held for the whole of every protocol transaction
//!   (connect, home, move, reset, status refresh). Exactly one consumer reads
//!   response lines at a time.
//! - motion claim: an atomic flag taken by `home`/`move_to` before queueing on
//!   `link`. A second motion request fails fast with [`GantryError::Busy`]
//!   instead of waiting.
//! - [`emergency_stop`](MotionOrchestrator::emergency_stop) takes neither. It
//!   records `Hold` and writes the interrupt byte straight away.
//!
//! # Stop epochs
//!
//! Each emergency stop bumps an epoch counter. A command captures the epoch
//! when it starts and only applies its outcome if the epoch is unchanged, so a
//! late `ok` can never move the machine out of `Hold`. Alarms and connection
//! loss apply regardless.
//!
//! The epoch is also published on a watch channel. Homing and motion
//! transactions race their response against it and give up the link with
//! [`GantryError::Interrupted`] as soon as a stop lands; a held controller
//! never acknowledges the pending sync dwell.

use crate::coordinates::{CoordinateTransformer, PhysicalPosition};
use crate::error::{AppResult, GantryError, ValidationError};
use crate::hardware::{
    describe_alarm, describe_error, Command, ControllerState, ProtocolController, ResponseClass,
    StatusReport,
};
use crate::motion::state::{MachineState, MachineStatus, StateSnapshot};
use crate::safety::SafetyValidator;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, instrument, warn};

/// Motion parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct MotionSettings {
    /// Feed for moves, clamped by the validator (mm/min).
    pub default_feed_mm_min: u32,
    /// Position reported after a successful homing cycle.
    pub home_position: PhysicalPosition,
    /// Follow each move with a `G4 P0` dwell so `ok` means motion finished.
    pub sync_after_move: bool,
    /// Deadline for a motion frame and its sync dwell.
    pub motion_timeout: Duration,
    /// Deadline for the homing cycle.
    pub homing_timeout: Duration,
}

impl Default for MotionSettings {
    fn default() -> Self {
        Self {
            default_feed_mm_min: 2000,
            home_position: PhysicalPosition::ORIGIN,
            sync_after_move: true,
            motion_timeout: Duration::from_secs(30),
            homing_timeout: Duration::from_secs(60),
        }
    }
}

struct Shared {
    machine: MachineState,
    stop_epoch: u64,
}

/// How a failed command reflects on machine state.
#[derive(Clone, Copy)]
enum FailurePolicy {
    /// Rejections and unknown outcomes leave the state as it was.
    KeepState,
    /// Rejections enter `Alarm`; unknown outcomes enter `Unknown`.
    Motion,
}

/// Releases the motion claim on drop.
struct MotionClaim<'a>(&'a AtomicBool);

impl Drop for MotionClaim<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Canonical owner of machine state and sole user of the protocol controller.
pub struct MotionOrchestrator {
    controller: ProtocolController,
    transformer: CoordinateTransformer,
    validator: SafetyValidator,
    settings: MotionSettings,
    shared: Mutex<Shared>,
    link: tokio::sync::Mutex<()>,
    motion_claim: AtomicBool,
    snapshots: watch::Sender<StateSnapshot>,
    stops: watch::Sender<u64>,
}

impl std::fmt::Debug for MotionOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MotionOrchestrator")
            .field("controller", &self.controller)
            .field("state", &self.get_status())
            .finish()
    }
}

impl MotionOrchestrator {
    /// Assemble the stack. The machine starts `Disconnected`.
    pub fn new(
        controller: ProtocolController,
        transformer: CoordinateTransformer,
        validator: SafetyValidator,
        settings: MotionSettings,
    ) -> Self {
        let machine = MachineState::default();
        let (snapshots, _) = watch::channel(snapshot_of(&transformer, &machine));
        Self {
            controller,
            transformer,
            validator,
            settings,
            shared: Mutex::new(Shared {
                machine,
                stop_epoch: 0,
            }),
            link: tokio::sync::Mutex::new(()),
            motion_claim: AtomicBool::new(false),
            snapshots,
            stops: watch::channel(0).0,
        }
    }

    /// Cell mapping in use.
    pub fn transformer(&self) -> &CoordinateTransformer {
        &self.transformer
    }

    /// Soft limits in use.
    pub fn validator(&self) -> &SafetyValidator {
        &self.validator
    }

    /// Motion parameters in use.
    pub fn settings(&self) -> &MotionSettings {
        &self.settings
    }

    /// Current state.
    pub fn get_status(&self) -> StateSnapshot {
        snapshot_of(&self.transformer, &self.shared.lock().machine)
    }

    /// Receive a snapshot after every state change.
    pub fn subscribe(&self) -> watch::Receiver<StateSnapshot> {
        self.snapshots.subscribe()
    }

    /// True while a home or move request holds the motion claim.
    pub fn is_busy(&self) -> bool {
        self.motion_claim.load(Ordering::Acquire)
    }

    /// Open the link. Only valid while `Disconnected`.
    #[instrument(skip(self), err)]
    pub async fn connect(&self, port: &str, baud_rate: u32) -> AppResult<()> {
        let _link = self.link.lock().await;
        let (status, _) = self.current();
        if status != MachineStatus::Disconnected {
            return Err(GantryError::InvalidState {
                operation: "connect",
                state: status,
            });
        }

        match self.controller.connect(port, baud_rate).await {
            Ok(()) => {
                self.modify(|shared| {
                    shared.machine = MachineState {
                        status: MachineStatus::Connected,
                        ..MachineState::default()
                    };
                });
                Ok(())
            }
            Err(e) => {
                self.modify(|shared| shared.machine.last_error = Some(e.to_string()));
                Err(e)
            }
        }
    }

    /// Close the link and return to `Disconnected`.
    #[instrument(skip(self))]
    pub async fn disconnect(&self) {
        let _link = self.link.lock().await;
        self.controller.close().await;
        self.modify(|shared| {
            shared.machine.status = MachineStatus::Disconnected;
            shared.machine.homed = false;
        });
    }

    /// Run the homing cycle, then select millimetres and absolute positioning.
    ///
    /// Accepted from `Connected`, `Homed`, `Idle` and `Alarm`. On success the
    /// position is the configured home and the state is `Idle`. If `G21` or
    /// `G90` fails after the cycle, the machine is left `Connected` and
    /// un-homed.
    #[instrument(skip(self), err)]
    pub async fn home(&self) -> AppResult<PhysicalPosition> {
        let _claim = self.claim_motion()?;
        let _link = self.link.lock().await;
        let (status, epoch) = self.current();
        match status {
            MachineStatus::Connected
            | MachineStatus::Homed
            | MachineStatus::Idle
            | MachineStatus::Alarm => {}
            MachineStatus::Disconnected => return Err(GantryError::NotConnected),
            other => {
                return Err(GantryError::InvalidState {
                    operation: "home",
                    state: other,
                })
            }
        }

        let homing = Command::home().with_timeout(self.settings.homing_timeout);
        if let Err(e) = self.run_until_stopped(&homing, epoch).await {
            self.record_failure(epoch, &e, FailurePolicy::KeepState);
            return Err(e);
        }

        // The cycle cleared any lock and moved the head, but the machine is
        // not homed until units and distance mode are confirmed.
        let home = self.settings.home_position;
        let cycled = self.modify_if(epoch, |machine| {
            machine.status = MachineStatus::Connected;
            machine.homed = false;
            machine.position = home;
        });
        if !cycled {
            return Err(GantryError::Interrupted);
        }

        for setup in [Command::new("G21"), Command::new("G90")] {
            if let Err(e) = self.run_until_stopped(&setup, epoch).await {
                self.record_failure(epoch, &e, FailurePolicy::KeepState);
                return Err(e);
            }
        }

        let homed = self.modify_if(epoch, |machine| {
            machine.status = MachineStatus::Homed;
            machine.homed = true;
            machine.last_error = None;
        }) && self.modify_if(epoch, |machine| machine.status = MachineStatus::Idle);
        if homed {
            info!(position = %home, "Homing complete");
            Ok(home)
        } else {
            Err(GantryError::Interrupted)
        }
    }

    /// Move the tool head to the center of a board cell.
    ///
    /// The state gate runs first, then the cell id is parsed, then the target
    /// is validated. Nothing is sent unless all three pass.
    #[instrument(skip(self), err)]
    pub async fn move_to_cell(&self, cell_id: &str) -> AppResult<PhysicalPosition> {
        self.motion_gate()?;
        let cell = self.transformer.parse_cell_id(cell_id)?;
        let target = self.transformer.to_physical(cell);
        info!(%cell, %target, "Moving to cell");
        self.move_to(target).await
    }

    /// Move the tool head to a raw position, with the same checks as
    /// [`move_to_cell`](Self::move_to_cell).
    #[instrument(skip(self, target), fields(%target), err)]
    pub async fn move_to(&self, target: PhysicalPosition) -> AppResult<PhysicalPosition> {
        let _claim = self.claim_motion()?;
        {
            let shared = self.shared.lock();
            Self::check_motion(&self.validator, target, &shared.machine)?;
        }
        let feed = self.validator.clamp_feed(self.settings.default_feed_mm_min);

        let _link = self.link.lock().await;
        let epoch = self.begin_motion(target)?;

        let mut commands = vec![Command::linear_move(target.x, target.y, feed)
            .with_timeout(self.settings.motion_timeout)];
        if self.settings.sync_after_move {
            commands.push(Command::sync().with_timeout(self.settings.motion_timeout));
        }
        for command in &commands {
            if let Err(e) = self.run_until_stopped(command, epoch).await {
                self.record_failure(epoch, &e, FailurePolicy::Motion);
                return Err(e);
            }
        }

        let completed = self.modify_if(epoch, |machine| {
            machine.status = MachineStatus::Idle;
            machine.position = target;
            machine.last_error = None;
        });
        if completed {
            Ok(target)
        } else {
            warn!(%target, "Move acknowledged after emergency stop; position not updated");
            Err(GantryError::Interrupted)
        }
    }

    /// Enter `Hold` and send the feed-hold byte immediately.
    ///
    /// Never waits for an in-flight command; a pending home or move gives up
    /// the link and returns [`GantryError::Interrupted`]. `Hold` is recorded
    /// even when the link is down, in which case [`GantryError::NotConnected`]
    /// is returned.
    #[instrument(skip(self), err)]
    pub async fn emergency_stop(&self) -> AppResult<()> {
        self.modify(|shared| {
            shared.stop_epoch += 1;
            shared.machine.status = MachineStatus::Hold;
            shared.machine.last_error = Some("Emergency stop".into());
            self.stops.send_replace(shared.stop_epoch);
        });
        warn!("Emergency stop");
        self.controller.interrupt().await
    }

    /// Recover from `Alarm` or `Hold`: soft reset, then unlock.
    ///
    /// Leaves the machine `Connected` and un-homed; `home` must run again
    /// before any motion.
    #[instrument(skip(self), err)]
    pub async fn reset(&self) -> AppResult<()> {
        let _link = self.link.lock().await;
        let (status, epoch) = self.current();
        match status {
            MachineStatus::Alarm | MachineStatus::Hold => {}
            MachineStatus::Disconnected => return Err(GantryError::NotConnected),
            other => {
                return Err(GantryError::InvalidState {
                    operation: "reset",
                    state: other,
                })
            }
        }

        let result = async {
            self.controller.soft_reset().await?;
            self.run(&Command::unlock()).await
        }
        .await;
        if let Err(e) = result {
            self.record_failure(epoch, &e, FailurePolicy::KeepState);
            return Err(e);
        }

        if self.modify_if(epoch, |machine| {
            machine.status = MachineStatus::Connected;
            machine.homed = false;
            machine.last_error = None;
        }) {
            info!("Controller reset and unlocked");
            Ok(())
        } else {
            Err(GantryError::Interrupted)
        }
    }

    /// Query the controller and reconcile state with its report.
    ///
    /// `Alarm` and `Hold` are only left through [`reset`](Self::reset); a
    /// refresh updates their position but not their status.
    #[instrument(skip(self), err)]
    pub async fn refresh_status(&self) -> AppResult<StateSnapshot> {
        let _link = self.link.lock().await;
        let (status, epoch) = self.current();
        if status == MachineStatus::Disconnected {
            return Err(GantryError::NotConnected);
        }

        match self.controller.query_status().await {
            Ok(report) => {
                self.modify_if(epoch, |machine| reconcile(machine, &report));
                Ok(self.get_status())
            }
            Err(e) => {
                self.record_failure(epoch, &e, FailurePolicy::KeepState);
                Err(e)
            }
        }
    }

    fn claim_motion(&self) -> AppResult<MotionClaim<'_>> {
        self.motion_claim
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| MotionClaim(&self.motion_claim))
            .map_err(|_| GantryError::Busy)
    }

    fn motion_gate(&self) -> AppResult<()> {
        if self.is_busy() {
            return Err(GantryError::Busy);
        }
        match self.current().0 {
            MachineStatus::Moving => Err(GantryError::Busy),
            status if status.accepts_motion() => Ok(()),
            status => Err(ValidationError::NotHomed { state: status }.into()),
        }
    }

    fn check_motion(
        validator: &SafetyValidator,
        target: PhysicalPosition,
        machine: &MachineState,
    ) -> AppResult<()> {
        if machine.status == MachineStatus::Moving {
            return Err(GantryError::Busy);
        }
        validator.check(target, machine)?;
        Ok(())
    }

    /// Re-check under the state lock and enter `Moving`. Returns the stop
    /// epoch the move runs under.
    fn begin_motion(&self, target: PhysicalPosition) -> AppResult<u64> {
        let mut shared = self.shared.lock();
        Self::check_motion(&self.validator, target, &shared.machine)?;
        let before = shared.machine.status;
        shared.machine.status = MachineStatus::Moving;
        self.publish(&shared.machine, before);
        Ok(shared.stop_epoch)
    }

    /// [`run`](Self::run), abandoned as soon as an emergency stop moves the
    /// epoch past `epoch`.
    async fn run_until_stopped(&self, command: &Command, epoch: u64) -> AppResult<()> {
        let mut stops = self.stops.subscribe();
        tokio::select! {
            biased;
            _ = stops.wait_for(|current| *current != epoch) => {
                warn!(frame = command.frame(), "Abandoned after emergency stop");
                Err(GantryError::Interrupted)
            }
            result = self.run(command) => result,
        }
    }

    /// Send one command and turn rejections and alarms into errors.
    async fn run(&self, command: &Command) -> AppResult<()> {
        match self.controller.send_command(command).await? {
            ResponseClass::Ok => Ok(()),
            ResponseClass::Error(code) => {
                warn!(code, frame = command.frame(), reason = describe_error(code), "Command rejected");
                Err(GantryError::CommandRejected {
                    command: command.frame().to_string(),
                    code,
                })
            }
            ResponseClass::Alarm(code) => {
                error!(code, reason = describe_alarm(code), "Controller alarm");
                Err(GantryError::SafetyFault { code })
            }
        }
    }

    fn record_failure(&self, epoch: u64, err: &GantryError, policy: FailurePolicy) {
        let message = err.to_string();
        match err {
            GantryError::Connection(_) | GantryError::NotConnected => self.modify(|shared| {
                shared.machine.status = MachineStatus::Disconnected;
                shared.machine.homed = false;
                shared.machine.last_error = Some(message);
            }),
            GantryError::SafetyFault { .. } => self.modify(|shared| {
                shared.machine.status = MachineStatus::Alarm;
                shared.machine.last_error = Some(message);
            }),
            GantryError::CommandRejected { .. } if matches!(policy, FailurePolicy::Motion) => {
                self.modify(|shared| {
                    shared.machine.status = MachineStatus::Alarm;
                    shared.machine.last_error = Some(message);
                })
            }
            _ => {
                let unknown = err.outcome_unknown() && matches!(policy, FailurePolicy::Motion);
                self.modify_if(epoch, |machine| {
                    if unknown {
                        machine.status = MachineStatus::Unknown;
                    }
                    machine.last_error = Some(message);
                });
            }
        }
    }

    fn current(&self) -> (MachineStatus, u64) {
        let shared = self.shared.lock();
        (shared.machine.status, shared.stop_epoch)
    }

    fn modify<R>(&self, f: impl FnOnce(&mut Shared) -> R) -> R {
        let mut shared = self.shared.lock();
        let before = shared.machine.status;
        let result = f(&mut shared);
        self.publish(&shared.machine, before);
        result
    }

    /// Apply `f` only if no emergency stop happened since `epoch`.
    fn modify_if(&self, epoch: u64, f: impl FnOnce(&mut MachineState)) -> bool {
        self.modify(|shared| {
            if shared.stop_epoch != epoch {
                return false;
            }
            f(&mut shared.machine);
            true
        })
    }

    /// Called with the state lock held so snapshots are published in order.
    fn publish(&self, machine: &MachineState, before: MachineStatus) {
        if machine.status != before {
            info!(from = %before, to = %machine.status, "Machine state changed");
        }
        self.snapshots
            .send_replace(snapshot_of(&self.transformer, machine));
    }
}

fn snapshot_of(transformer: &CoordinateTransformer, machine: &MachineState) -> StateSnapshot {
    StateSnapshot {
        status: machine.status,
        position: machine.position,
        cell: machine
            .homed
            .then(|| transformer.to_logical(machine.position).to_string()),
        homed: machine.homed,
        last_error: machine.last_error.clone(),
    }
}

fn reconcile(machine: &mut MachineState, report: &StatusReport) {
    machine.position = report.position;
    let reported = match report.state {
        ControllerState::Idle if machine.homed => MachineStatus::Idle,
        ControllerState::Idle => MachineStatus::Connected,
        ControllerState::Run | ControllerState::Jog | ControllerState::Home => MachineStatus::Moving,
        ControllerState::Hold(_) | ControllerState::Door(_) => MachineStatus::Hold,
        ControllerState::Alarm => MachineStatus::Alarm,
        ControllerState::Check | ControllerState::Sleep => MachineStatus::Unknown,
    };
    match machine.status {
        MachineStatus::Alarm => {}
        MachineStatus::Hold if reported != MachineStatus::Alarm => {}
        _ => machine.status = reported,
    }
}
