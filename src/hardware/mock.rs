//! Simulated GRBL Controller
//!
//! Provides an in-process GRBL 1.1 simulator for testing without physical hardware.
//! Each connection is a `tokio::io::duplex` pair: the host half is handed to the
//! [`ProtocolController`](crate::hardware::ProtocolController), the device half is
//! served by a background task that speaks the controller side of the protocol.
//!
//! # Behaviour
//!
//! - Prints the `Grbl 1.1h` banner on connect and after a soft reset
//! - Answers `?`, `!`, `~` and `0x18` immediately, independent of line traffic
//! - Tracks X/Y position from `G0`/`G1` words; `$H` moves to the home position
//! - In `Alarm` only `$X`, `$H` and other `$` commands are accepted; G-code gets `error:9`
//! - Optional motion time delays the `ok` of motion commands (tokio time, not thread sleep)
//! - During a feed hold, acknowledgements of motion and dwell commands are
//!   withheld until `~` resumes; a soft reset discards them
//!
//! # Fault Injection
//!
//! [`MockFault`]s are queued with [`MockGrbl::inject`] and consumed by the next
//! command line, in order. [`MockGrbl::inject_for`] aims a fault at a specific
//! frame instead.

use crate::coordinates::PhysicalPosition;
use crate::error::{AppResult, GantryError};
use crate::hardware::response::ControllerState;
use crate::hardware::serial::{DynSerial, PortOpener};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};
use tracing::debug;

const BANNER: &str = "Grbl 1.1h ['$' for help]";
const UNLOCK_HINT: &str = "[MSG:'$H'|'$X' to unlock]";

/// Misbehaviour applied to the next command line.
#[derive(Debug, Clone, PartialEq)]
pub enum MockFault {
    /// Answer `error:<code>`.
    Error(u16),
    /// Answer `ALARM:<code>` and enter `Alarm`.
    Alarm(u16),
    /// Swallow the command without answering.
    Silent,
    /// Answer with an arbitrary line.
    Garbage(String),
    /// Close the link instead of answering.
    Hangup,
}

enum Outbound {
    Line(String),
    Hangup,
}

enum Reply {
    Lines(Vec<String>),
    Delayed(Duration, Vec<String>),
    Hangup,
}

struct SimState {
    controller: ControllerState,
    position: PhysicalPosition,
    home: PhysicalPosition,
    homing_lock: bool,
    motion_time: Duration,
    faults: VecDeque<MockFault>,
    targeted: Vec<(String, MockFault)>,
    received: Vec<String>,
    realtime: Vec<u8>,
    outbox: Option<mpsc::UnboundedSender<Outbound>>,
    unavailable: bool,
    /// Bumped on soft reset so delayed acknowledgements from before it are dropped.
    epoch: u64,
    /// Acknowledgements withheld by a feed hold.
    held: Vec<String>,
}

// =============================================================================
// MockGrbl - Simulated Motion Controller
// =============================================================================

/// Simulated GRBL controller.
///
/// Cloning shares the simulator, so a test can keep a handle for inspection
/// while the orchestrator owns another as its port opener.
///
/// # Example
///
/// ```rust,ignore
/// let grbl = MockGrbl::new();
/// let controller = ProtocolController::new(Arc::new(grbl.clone()), ProtocolSettings::default());
/// controller.connect("sim", 115_200).await?;
/// grbl.inject(MockFault::Error(9));
/// ```
#[derive(Clone)]
pub struct MockGrbl {
    state: Arc<Mutex<SimState>>,
}

impl Default for MockGrbl {
    fn default() -> Self {
        Self::new()
    }
}

impl MockGrbl {
    /// Idle controller at (0, 0) with homing at (0, 0) and instant motion.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                controller: ControllerState::Idle,
                position: PhysicalPosition::ORIGIN,
                home: PhysicalPosition::ORIGIN,
                homing_lock: false,
                motion_time: Duration::ZERO,
                faults: VecDeque::new(),
                targeted: Vec::new(),
                received: Vec::new(),
                realtime: Vec::new(),
                outbox: None,
                unavailable: false,
                epoch: 0,
                held: Vec::new(),
            })),
        }
    }

    /// Boot (and soft reset) into `Alarm`, as GRBL does with homing enabled.
    pub fn with_homing_lock(self) -> Self {
        {
            let mut state = self.state.lock();
            state.homing_lock = true;
            state.controller = ControllerState::Alarm;
        }
        self
    }

    /// Delay the `ok` of every motion command by `duration`.
    pub fn with_motion_time(self, duration: Duration) -> Self {
        self.state.lock().motion_time = duration;
        self
    }

    /// Start at `position` instead of the origin.
    pub fn with_position(self, position: PhysicalPosition) -> Self {
        self.state.lock().position = position;
        self
    }

    /// Queue a fault for the next command line.
    pub fn inject(&self, fault: MockFault) {
        self.state.lock().faults.push_back(fault);
    }

    /// Apply `fault` to the first command line equal to `frame`.
    pub fn inject_for(&self, frame: &str, fault: MockFault) {
        self.state.lock().targeted.push((frame.to_string(), fault));
    }

    /// Emit an unsolicited line, e.g. `ALARM:1`.
    pub fn push_line(&self, line: &str) {
        let mut state = self.state.lock();
        if line.to_ascii_uppercase().starts_with("ALARM:") {
            state.controller = ControllerState::Alarm;
        }
        if let Some(outbox) = &state.outbox {
            let _ = outbox.send(Outbound::Line(line.to_string()));
        }
    }

    /// Drop the current connection as if the cable were pulled.
    pub fn hangup(&self) {
        if let Some(outbox) = self.state.lock().outbox.take() {
            let _ = outbox.send(Outbound::Hangup);
        }
    }

    /// Make subsequent `open` calls fail.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unavailable = unavailable;
    }

    /// Every command line received, in order, without terminators.
    pub fn received(&self) -> Vec<String> {
        self.state.lock().received.clone()
    }

    /// Every real-time byte received, in order.
    pub fn realtime_bytes(&self) -> Vec<u8> {
        self.state.lock().realtime.clone()
    }

    /// Simulated machine position.
    pub fn position(&self) -> PhysicalPosition {
        self.state.lock().position
    }

    /// Simulated controller state.
    pub fn controller_state(&self) -> ControllerState {
        self.state.lock().controller
    }

    /// Start serving a fresh connection and return the host end.
    pub fn open_stream(&self) -> DynSerial {
        let (host, device) = tokio::io::duplex(4096);
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut state = self.state.lock();
            if let Some(previous) = state.outbox.replace(tx.clone()) {
                let _ = previous.send(Outbound::Hangup);
            }
        }
        tokio::spawn(serve(self.state.clone(), device, rx, tx));
        Box::new(host)
    }
}

#[async_trait]
impl PortOpener for MockGrbl {
    async fn open(&self, port: &str, baud_rate: u32) -> AppResult<DynSerial> {
        if self.state.lock().unavailable {
            return Err(GantryError::Connection(format!(
                "Failed to open serial port {} at {} baud: simulated port unavailable",
                port, baud_rate
            )));
        }
        debug!(port, baud_rate, "Opening simulated controller");
        Ok(self.open_stream())
    }
}

async fn serve(
    state: Arc<Mutex<SimState>>,
    device: DuplexStream,
    mut outbox: mpsc::UnboundedReceiver<Outbound>,
    tx: mpsc::UnboundedSender<Outbound>,
) {
    let (read, mut write) = tokio::io::split(device);
    let mut reader = BufReader::new(read);
    let mut line = Vec::new();

    let mut greeting = vec![String::new(), BANNER.to_string()];
    if state.lock().controller == ControllerState::Alarm {
        greeting.push(UNLOCK_HINT.to_string());
    }
    if write_lines(&mut write, &greeting).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            byte = reader.read_u8() => {
                let Ok(byte) = byte else { break };
                let reply = match byte {
                    b'?' | b'!' | b'~' | 0x18 => Reply::Lines(realtime(&mut state.lock(), byte)),
                    b'\n' => {
                        let text = String::from_utf8_lossy(&line).trim().to_string();
                        line.clear();
                        if text.is_empty() {
                            continue;
                        }
                        handle_line(&mut state.lock(), &text)
                    }
                    b'\r' => continue,
                    other => {
                        line.push(other);
                        continue;
                    }
                };
                match reply {
                    Reply::Lines(lines) => {
                        if write_lines(&mut write, &lines).await.is_err() {
                            break;
                        }
                    }
                    Reply::Delayed(after, lines) => {
                        let state = state.clone();
                        let tx = tx.clone();
                        let epoch = state.lock().epoch;
                        tokio::spawn(async move {
                            sleep(after).await;
                            let deliver = {
                                let mut sim = state.lock();
                                if sim.epoch != epoch {
                                    false
                                } else if matches!(sim.controller, ControllerState::Hold(_)) {
                                    sim.held.extend(lines.iter().cloned());
                                    false
                                } else {
                                    if sim.controller == ControllerState::Run {
                                        sim.controller = ControllerState::Idle;
                                    }
                                    true
                                }
                            };
                            if !deliver {
                                return;
                            }
                            for line in lines {
                                let _ = tx.send(Outbound::Line(line));
                            }
                        });
                    }
                    Reply::Hangup => break,
                }
            }
            message = outbox.recv() => match message {
                Some(Outbound::Line(text)) => {
                    if write_lines(&mut write, &[text]).await.is_err() {
                        break;
                    }
                }
                Some(Outbound::Hangup) | None => break,
            },
        }
    }
    debug!("Simulated controller connection closed");
}

async fn write_lines<W: AsyncWrite + Unpin>(write: &mut W, lines: &[String]) -> std::io::Result<()> {
    for line in lines {
        write.write_all(line.as_bytes()).await?;
        write.write_all(b"\r\n").await?;
    }
    write.flush().await
}

fn realtime(state: &mut SimState, byte: u8) -> Vec<String> {
    state.realtime.push(byte);
    match byte {
        b'?' => vec![status_line(state)],
        b'!' => {
            if matches!(state.controller, ControllerState::Idle | ControllerState::Run) {
                state.controller = ControllerState::Hold(0);
            }
            Vec::new()
        }
        b'~' => {
            if matches!(state.controller, ControllerState::Hold(_)) {
                state.controller = ControllerState::Idle;
            }
            std::mem::take(&mut state.held)
        }
        _ => {
            state.epoch += 1;
            state.held.clear();
            state.controller = if state.homing_lock {
                ControllerState::Alarm
            } else {
                ControllerState::Idle
            };
            let mut lines = vec![String::new(), BANNER.to_string()];
            if state.homing_lock {
                lines.push(UNLOCK_HINT.to_string());
            }
            lines
        }
    }
}

fn handle_line(state: &mut SimState, text: &str) -> Reply {
    state.received.push(text.to_string());

    let targeted = state
        .targeted
        .iter()
        .position(|(frame, _)| frame == text)
        .map(|index| state.targeted.remove(index).1);
    if let Some(fault) = targeted.or_else(|| state.faults.pop_front()) {
        return match fault {
            MockFault::Error(code) => Reply::Lines(vec![format!("error:{}", code)]),
            MockFault::Alarm(code) => {
                state.controller = ControllerState::Alarm;
                Reply::Lines(vec![format!("ALARM:{}", code)])
            }
            MockFault::Silent => Reply::Lines(Vec::new()),
            MockFault::Garbage(line) => Reply::Lines(vec![line]),
            MockFault::Hangup => Reply::Hangup,
        };
    }

    let ok = || vec!["ok".to_string()];
    match text {
        "$X" => {
            state.controller = ControllerState::Idle;
            Reply::Lines(vec!["[MSG:Caution: Unlocked]".into(), "ok".into()])
        }
        "$H" => {
            state.position = state.home;
            state.controller = ControllerState::Idle;
            motion_reply(state)
        }
        _ if text.starts_with('$') => Reply::Lines(ok()),
        _ if state.controller == ControllerState::Alarm => Reply::Lines(vec!["error:9".into()]),
        _ if is_dwell(text) => {
            if matches!(state.controller, ControllerState::Hold(_)) {
                state.held.push("ok".into());
                Reply::Lines(Vec::new())
            } else {
                Reply::Lines(ok())
            }
        }
        _ => match parse_linear_move(text) {
            Some((x, y)) => {
                state.position = PhysicalPosition::new(
                    x.unwrap_or(state.position.x),
                    y.unwrap_or(state.position.y),
                );
                if matches!(state.controller, ControllerState::Hold(_)) {
                    state.held.push("ok".into());
                    return Reply::Lines(Vec::new());
                }
                if state.controller == ControllerState::Idle && !state.motion_time.is_zero() {
                    state.controller = ControllerState::Run;
                }
                motion_reply(state)
            }
            None => Reply::Lines(ok()),
        },
    }
}

fn motion_reply(state: &SimState) -> Reply {
    if state.motion_time.is_zero() {
        Reply::Lines(vec!["ok".into()])
    } else {
        Reply::Delayed(state.motion_time, vec!["ok".into()])
    }
}

fn is_dwell(text: &str) -> bool {
    matches!(
        text.split_whitespace().next().map(str::to_ascii_uppercase).as_deref(),
        Some("G4" | "G04")
    )
}

/// X/Y words of a `G0`/`G1` block.
fn parse_linear_move(text: &str) -> Option<(Option<f64>, Option<f64>)> {
    let mut words = text.split_whitespace();
    match words.next()?.to_ascii_uppercase().as_str() {
        "G0" | "G00" | "G1" | "G01" => {}
        _ => return None,
    }
    let (mut x, mut y) = (None, None);
    for word in words {
        let (letter, value) = word.split_at(1);
        match letter.to_ascii_uppercase().as_str() {
            "X" => x = value.parse().ok(),
            "Y" => y = value.parse().ok(),
            _ => {}
        }
    }
    Some((x, y))
}

fn status_line(state: &SimState) -> String {
    let tag = match state.controller {
        ControllerState::Idle => "Idle".to_string(),
        ControllerState::Run => "Run".to_string(),
        ControllerState::Hold(sub) => format!("Hold:{}", sub),
        ControllerState::Jog => "Jog".to_string(),
        ControllerState::Alarm => "Alarm".to_string(),
        ControllerState::Door(sub) => format!("Door:{}", sub),
        ControllerState::Check => "Check".to_string(),
        ControllerState::Home => "Home".to_string(),
        ControllerState::Sleep => "Sleep".to_string(),
    };
    format!(
        "<{}|MPos:{:.3},{:.3},0.000|FS:0,0>",
        tag, state.position.x, state.position.y
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncBufReadExt;

    async fn next_line<R: AsyncBufReadExt + Unpin>(reader: &mut R) -> String {
        loop {
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            let line = line.trim().to_string();
            if !line.is_empty() {
                return line;
            }
        }
    }

    #[tokio::test]
    async fn test_banner_and_motion() {
        let grbl = MockGrbl::new();
        let (read, mut write) = tokio::io::split(grbl.open_stream());
        let mut reader = BufReader::new(read);

        assert_eq!(next_line(&mut reader).await, BANNER);

        write.write_all(b"G1 X12.5 Y30 F2000\n").await.unwrap();
        assert_eq!(next_line(&mut reader).await, "ok");
        assert_eq!(grbl.position(), PhysicalPosition::new(12.5, 30.0));

        write.write_all(b"?").await.unwrap();
        assert_eq!(
            next_line(&mut reader).await,
            "<Idle|MPos:12.500,30.000,0.000|FS:0,0>"
        );
        assert_eq!(grbl.received(), vec!["G1 X12.5 Y30 F2000"]);
        assert_eq!(grbl.realtime_bytes(), vec![b'?']);
    }

    #[tokio::test]
    async fn test_homing_lock_and_faults() {
        let grbl = MockGrbl::new().with_homing_lock();
        let (read, mut write) = tokio::io::split(grbl.open_stream());
        let mut reader = BufReader::new(read);
        assert_eq!(next_line(&mut reader).await, BANNER);
        assert_eq!(next_line(&mut reader).await, UNLOCK_HINT);

        write.write_all(b"G1 X1 Y1\n").await.unwrap();
        assert_eq!(next_line(&mut reader).await, "error:9");

        write.write_all(b"$X\n").await.unwrap();
        assert_eq!(next_line(&mut reader).await, "[MSG:Caution: Unlocked]");
        assert_eq!(next_line(&mut reader).await, "ok");

        grbl.inject(MockFault::Alarm(2));
        write.write_all(b"G1 X500\n").await.unwrap();
        assert_eq!(next_line(&mut reader).await, "ALARM:2");
        assert_eq!(grbl.controller_state(), ControllerState::Alarm);
    }

    #[tokio::test]
    async fn test_feed_hold_and_reset() {
        let grbl = MockGrbl::new();
        let (read, mut write) = tokio::io::split(grbl.open_stream());
        let mut reader = BufReader::new(read);
        assert_eq!(next_line(&mut reader).await, BANNER);

        write.write_all(b"!?").await.unwrap();
        assert!(next_line(&mut reader).await.starts_with("<Hold:0|"));

        write.write_all(&[0x18]).await.unwrap();
        assert_eq!(next_line(&mut reader).await, BANNER);
        assert_eq!(grbl.controller_state(), ControllerState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_feed_hold_withholds_acknowledgements() {
        let grbl = MockGrbl::new().with_motion_time(Duration::from_secs(1));
        let (read, mut write) = tokio::io::split(grbl.open_stream());
        let mut reader = BufReader::new(read);
        assert_eq!(next_line(&mut reader).await, BANNER);

        write.write_all(b"G1 X10 Y10 F2000\n!G4 P0\n").await.unwrap();
        let silent = tokio::time::timeout(Duration::from_secs(5), next_line(&mut reader)).await;
        assert!(silent.is_err(), "acknowledged during hold: {:?}", silent);
        assert_eq!(grbl.controller_state(), ControllerState::Hold(0));

        write.write_all(b"~").await.unwrap();
        assert_eq!(next_line(&mut reader).await, "ok");
        assert_eq!(next_line(&mut reader).await, "ok");
        assert_eq!(grbl.controller_state(), ControllerState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_soft_reset_discards_held_acknowledgements() {
        let grbl = MockGrbl::new().with_motion_time(Duration::from_secs(1));
        let (read, mut write) = tokio::io::split(grbl.open_stream());
        let mut reader = BufReader::new(read);
        assert_eq!(next_line(&mut reader).await, BANNER);

        write.write_all(b"G1 X10 Y10 F2000\n!").await.unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        write.write_all(&[0x18]).await.unwrap();
        assert_eq!(next_line(&mut reader).await, BANNER);

        write.write_all(b"~").await.unwrap();
        let silent = tokio::time::timeout(Duration::from_secs(5), next_line(&mut reader)).await;
        assert!(silent.is_err());
    }

    #[tokio::test]
    async fn test_unavailable_port() {
        let grbl = MockGrbl::new();
        grbl.set_unavailable(true);
        assert!(matches!(
            grbl.open("sim", 115_200).await,
            Err(GantryError::Connection(_))
        ));
    }

    #[test]
    fn test_parse_linear_move() {
        assert_eq!(parse_linear_move("G1 X1.5 Y2 F100"), Some((Some(1.5), Some(2.0))));
        assert_eq!(parse_linear_move("g0 y3"), Some((None, Some(3.0))));
        assert_eq!(parse_linear_move("G21"), None);
    }
}
