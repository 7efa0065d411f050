//! GRBL 1.1 protocol controller.
//!
//! Owns the serial link to the motion controller and runs the line-oriented
//! request/response protocol over it:
//!
//! - Command frames are newline terminated; the controller answers each with
//!   `ok`, `error:<n>` or (unsolicited) `ALARM:<n>`.
//! - Real-time bytes (`?`, `!`, `0x18`) are written without a newline and are
//!   acted on by the controller immediately.
//!
//! The transport is split into a read half and a write half, each behind its
//! own lock. A command transaction holds the read half for its whole duration
//! (one reader at a time) and the write half only while writing, so
//! [`ProtocolController::interrupt`] can always reach the wire even while a
//! command is blocked waiting for its response.

use crate::error::{AppResult, GantryError};
use crate::hardware::response::{Response, ResponseClass, StatusReport};
use crate::hardware::serial::{DynSerial, PortOpener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

/// Real-time status query.
const STATUS_QUERY: u8 = b'?';
/// Real-time feed hold, used as the interrupt.
const FEED_HOLD: u8 = b'!';
/// Real-time soft reset (Ctrl-X).
const SOFT_RESET: u8 = 0x18;

/// Timing parameters for the protocol controller.
#[derive(Debug, Clone, PartialEq)]
pub struct ProtocolSettings {
    /// Default deadline for a command without its own timeout.
    pub command_timeout: Duration,
    /// Deadline for a status query.
    pub status_timeout: Duration,
    /// How long to wait for the startup banner after opening the port.
    pub startup_timeout: Duration,
    /// Silence that ends a drain of banner or stale lines.
    pub quiet_period: Duration,
}

impl Default for ProtocolSettings {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(5),
            status_timeout: Duration::from_secs(1),
            startup_timeout: Duration::from_secs(2),
            quiet_period: Duration::from_millis(100),
        }
    }
}

/// One outgoing command frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    frame: String,
    timeout: Option<Duration>,
    is_motion: bool,
}

impl Command {
    /// Non-motion command with the default timeout.
    pub fn new(frame: impl Into<String>) -> Self {
        Self {
            frame: frame.into(),
            timeout: None,
            is_motion: false,
        }
    }

    /// Motion command. Motion commands are never retried.
    pub fn motion(frame: impl Into<String>) -> Self {
        Self {
            is_motion: true,
            ..Self::new(frame)
        }
    }

    /// Linear move at `feed_mm_min`, coordinates to three decimals.
    pub fn linear_move(x: f64, y: f64, feed_mm_min: u32) -> Self {
        Self::motion(format!("G1 X{:.3} Y{:.3} F{}", x, y, feed_mm_min))
    }

    /// Homing cycle (`$H`).
    pub fn home() -> Self {
        Self::motion("$H")
    }

    /// Clear an alarm lock (`$X`).
    pub fn unlock() -> Self {
        Self::new("$X")
    }

    /// Zero-length dwell. Acknowledged only once the planner is empty.
    pub fn sync() -> Self {
        Self::new("G4 P0")
    }

    /// Override the per-command deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Frame text without the line terminator.
    pub fn frame(&self) -> &str {
        &self.frame
    }

    /// Per-command deadline, if set.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// True for commands that move the machine.
    pub fn is_motion(&self) -> bool {
        self.is_motion
    }
}

/// Longest response line accepted before the link is considered garbled.
const MAX_LINE_LEN: usize = 256;

/// One read from the link.
#[derive(Debug, PartialEq)]
enum Line {
    Text(String),
    /// First [`MAX_LINE_LEN`] bytes of a line that never ended; the rest is skipped.
    Overlong(String),
    Eof,
}

/// Buffered line reader over the read half.
///
/// Partial lines survive a cancelled read, so a timed-out wait never loses
/// bytes that belong to the next line. `pending` never exceeds
/// `MAX_LINE_LEN + 1` bytes.
struct LineReader {
    inner: BufReader<ReadHalf<DynSerial>>,
    pending: Vec<u8>,
    discarding: bool,
}

impl LineReader {
    fn new(read: ReadHalf<DynSerial>) -> Self {
        Self {
            inner: BufReader::new(read),
            pending: Vec::with_capacity(128),
            discarding: false,
        }
    }

    /// Next non-empty line.
    async fn next_line(&mut self) -> std::io::Result<Line> {
        loop {
            let budget = (MAX_LINE_LEN + 1).saturating_sub(self.pending.len()) as u64;
            let n = (&mut self.inner)
                .take(budget)
                .read_until(b'\n', &mut self.pending)
                .await?;
            if n == 0 {
                return Ok(Line::Eof);
            }

            if self.pending.last() == Some(&b'\n') {
                let line = String::from_utf8_lossy(&self.pending).trim().to_string();
                self.pending.clear();
                if std::mem::take(&mut self.discarding) || line.is_empty() {
                    continue;
                }
                return Ok(Line::Text(line));
            }

            if self.pending.len() <= MAX_LINE_LEN {
                // EOF in the middle of a line
                return Ok(Line::Eof);
            }
            let head = String::from_utf8_lossy(&self.pending[..MAX_LINE_LEN]).into_owned();
            self.pending.clear();
            if !self.discarding {
                self.discarding = true;
                return Ok(Line::Overlong(head));
            }
        }
    }
}

/// Request/response protocol over a single serial link.
pub struct ProtocolController {
    opener: Arc<dyn PortOpener>,
    settings: ProtocolSettings,
    reader: Mutex<Option<LineReader>>,
    writer: Mutex<Option<WriteHalf<DynSerial>>>,
    connected: AtomicBool,
}

impl std::fmt::Debug for ProtocolController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolController")
            .field("settings", &self.settings)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl ProtocolController {
    /// Create a closed controller that opens ports through `opener`.
    pub fn new(opener: Arc<dyn PortOpener>, settings: ProtocolSettings) -> Self {
        Self {
            opener,
            settings,
            reader: Mutex::new(None),
            writer: Mutex::new(None),
            connected: AtomicBool::new(false),
        }
    }

    /// Timing parameters in use.
    pub fn settings(&self) -> &ProtocolSettings {
        &self.settings
    }

    /// True while a link is attached and has not failed.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Open `port` and drain the startup banner.
    ///
    /// An already open link is closed first.
    #[instrument(skip(self), err)]
    pub async fn connect(&self, port: &str, baud_rate: u32) -> AppResult<()> {
        self.close().await;
        let stream = self.opener.open(port, baud_rate).await?;
        self.attach(stream).await?;
        info!(port, baud_rate, "Motion controller link open");
        Ok(())
    }

    /// Adopt an already open transport.
    pub async fn attach(&self, stream: DynSerial) -> AppResult<()> {
        let (read, write) = tokio::io::split(stream);
        let mut reader = self.reader.lock().await;
        *reader = Some(LineReader::new(read));
        *self.writer.lock().await = Some(write);
        self.connected.store(true, Ordering::Release);

        if let Some(lines) = reader.as_mut() {
            if let Err(e) = self.drain_banner(lines).await {
                *reader = None;
                drop(reader);
                self.close().await;
                return Err(e);
            }
        }
        Ok(())
    }

    /// Close the link. Safe to call when already closed.
    pub async fn close(&self) {
        self.connected.store(false, Ordering::Release);
        self.reader.lock().await.take();
        if let Some(mut write) = self.writer.lock().await.take() {
            let _ = write.shutdown().await;
        }
    }

    /// Send one command and wait for its terminal response.
    ///
    /// `Ok`, `Error` and `Alarm` are all returned as [`ResponseClass`]; the
    /// caller decides what they mean. A stale `ALARM` already waiting on the
    /// link is returned without the frame being sent.
    ///
    /// # Errors
    /// - [`GantryError::Timeout`] when no terminal line arrives in time. The
    ///   command's physical effect is unknown.
    /// - [`GantryError::Protocol`] for an unrecognized line or a controller reset.
    /// - [`GantryError::Connection`] when the link fails; the controller is closed.
    /// - [`GantryError::NotConnected`] when no link is attached.
    #[instrument(skip(self, command), fields(frame = %command.frame, motion = command.is_motion), err)]
    pub async fn send_command(&self, command: &Command) -> AppResult<ResponseClass> {
        let mut guard = self.reader.lock().await;
        let reader = guard.as_mut().ok_or(GantryError::NotConnected)?;
        let outcome = self.transact(reader, command).await;

        if matches!(outcome, Err(GantryError::Connection(_))) {
            guard.take();
            drop(guard);
            self.close().await;
        }
        outcome
    }

    async fn transact(&self, reader: &mut LineReader, command: &Command) -> AppResult<ResponseClass> {
        if let Some(code) = self.drain_stale(reader).await? {
            warn!(code, "Stale alarm pending; command not sent");
            return Ok(ResponseClass::Alarm(code));
        }

        debug!(frame = %command.frame, "Sending frame");
        let mut bytes = command.frame.trim_end().as_bytes().to_vec();
        bytes.push(b'\n');
        self.write_raw(&bytes).await?;

        let deadline = command.timeout.unwrap_or(self.settings.command_timeout);
        match tokio::time::timeout(deadline, Self::await_terminal(reader)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(timeout = ?deadline, "No response before deadline");
                Err(GantryError::Timeout {
                    command: command.frame.clone(),
                    timeout: deadline,
                })
            }
        }
    }

    async fn await_terminal(reader: &mut LineReader) -> AppResult<ResponseClass> {
        loop {
            let line = read_line(reader).await?;
            let response = Response::parse(&line);
            debug!(line = %line, "Received line");
            if let Some(class) = response.terminal() {
                if let ResponseClass::Alarm(code) = class {
                    warn!(code, "Controller raised alarm");
                }
                return Ok(class);
            }
            match response {
                Response::Status(_) | Response::Feedback(_) => continue,
                Response::Welcome(version) => {
                    warn!(version = %version, "Controller reset while awaiting response");
                    return Err(GantryError::Protocol { line });
                }
                _ => {
                    warn!(line = %line, "Unrecognized response line");
                    return Err(GantryError::Protocol { line });
                }
            }
        }
    }

    /// Write the feed-hold byte immediately.
    ///
    /// Only the write half is locked, so this never waits behind a command
    /// that is blocked reading its response.
    #[instrument(skip(self), err)]
    pub async fn interrupt(&self) -> AppResult<()> {
        self.write_raw(&[FEED_HOLD]).await?;
        warn!("Feed hold sent");
        Ok(())
    }

    /// Soft-reset the controller and drain the banner it prints on reboot.
    #[instrument(skip(self), err)]
    pub async fn soft_reset(&self) -> AppResult<()> {
        let mut guard = self.reader.lock().await;
        let reader = guard.as_mut().ok_or(GantryError::NotConnected)?;
        self.write_raw(&[SOFT_RESET]).await?;
        reader.pending.clear();
        self.drain_banner(reader).await
    }

    /// Request a real-time status report and wait for it.
    ///
    /// Stale `ok`/`error` lines are skipped. An `ALARM` line is surfaced as
    /// [`GantryError::SafetyFault`].
    #[instrument(skip(self), err)]
    pub async fn query_status(&self) -> AppResult<StatusReport> {
        let mut guard = self.reader.lock().await;
        let reader = guard.as_mut().ok_or(GantryError::NotConnected)?;
        let outcome = self.status_transaction(reader).await;

        if matches!(outcome, Err(GantryError::Connection(_))) {
            guard.take();
            drop(guard);
            self.close().await;
        }
        outcome
    }

    async fn status_transaction(&self, reader: &mut LineReader) -> AppResult<StatusReport> {
        self.write_raw(&[STATUS_QUERY]).await?;

        let deadline = self.settings.status_timeout;
        let awaited = tokio::time::timeout(deadline, async {
            loop {
                let line = read_line(reader).await?;
                match Response::parse(&line) {
                    Response::Status(report) => return Ok(report),
                    Response::Alarm(code) => return Err(GantryError::SafetyFault { code }),
                    Response::Ok | Response::Error(_) | Response::Feedback(_) => {
                        debug!(line = %line, "Skipping line while awaiting status");
                    }
                    Response::Welcome(_) | Response::Unrecognized(_) => {
                        warn!(line = %line, "Unexpected line while awaiting status");
                        return Err(GantryError::Protocol { line });
                    }
                }
            }
        })
        .await;

        awaited.unwrap_or_else(|_| {
            Err(GantryError::Timeout {
                command: "?".into(),
                timeout: deadline,
            })
        })
    }

    async fn write_raw(&self, bytes: &[u8]) -> AppResult<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(GantryError::NotConnected)?;
        let result = async {
            writer.write_all(bytes).await?;
            writer.flush().await
        }
        .await;
        result.map_err(|e| {
            self.connected.store(false, Ordering::Release);
            guard.take();
            GantryError::Connection(format!("Write failed: {}", e))
        })
    }

    /// Wait up to the startup window for the first line, then keep reading
    /// until the link has been quiet for the quiet period.
    async fn drain_banner(&self, reader: &mut LineReader) -> AppResult<()> {
        let mut window = self.settings.startup_timeout;
        loop {
            match tokio::time::timeout(window, read_line(reader)).await {
                Ok(Ok(line)) => {
                    match Response::parse(&line) {
                        Response::Welcome(version) => info!(version = %version, "Controller banner"),
                        _ => debug!(line = %line, "Discarding startup line"),
                    }
                    window = self.settings.quiet_period;
                }
                Ok(Err(GantryError::Protocol { .. })) => window = self.settings.quiet_period,
                Ok(Err(e)) => return Err(e),
                Err(_) => return Ok(()),
            }
        }
    }

    /// Discard lines already waiting on the link. Returns the code of any
    /// stale alarm, which ends the drain.
    async fn drain_stale(&self, reader: &mut LineReader) -> AppResult<Option<u16>> {
        loop {
            match tokio::time::timeout(Duration::ZERO, read_line(reader)).await {
                Ok(Ok(line)) => match Response::parse(&line) {
                    Response::Alarm(code) => return Ok(Some(code)),
                    _ => debug!(line = %line, "Discarding stale line"),
                },
                Ok(Err(GantryError::Protocol { .. })) => continue,
                Ok(Err(e)) => return Err(e),
                Err(_) => return Ok(None),
            }
        }
    }
}

async fn read_line(reader: &mut LineReader) -> AppResult<String> {
    match reader.next_line().await {
        Ok(Line::Text(line)) => Ok(line),
        Ok(Line::Overlong(line)) => {
            warn!(limit = MAX_LINE_LEN, "Response line too long");
            Err(GantryError::Protocol { line })
        }
        Ok(Line::Eof) => Err(GantryError::Connection("Link closed by controller".into())),
        Err(e) => Err(GantryError::Connection(format!("Read failed: {}", e))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::response::ControllerState;
    use crate::hardware::serial::SerialPortOpener;
    use tokio::io::{AsyncReadExt, DuplexStream};
    use tracing_test::traced_test;

    async fn attached() -> (ProtocolController, DuplexStream) {
        let controller = ProtocolController::new(
            Arc::new(SerialPortOpener),
            ProtocolSettings {
                startup_timeout: Duration::from_millis(50),
                quiet_period: Duration::from_millis(10),
                ..ProtocolSettings::default()
            },
        );
        let (host, device) = tokio::io::duplex(1024);
        controller.attach(Box::new(host)).await.unwrap();
        (controller, device)
    }

    async fn read_exact_str(device: &mut DuplexStream, len: usize) -> String {
        let mut buf = vec![0u8; len];
        device.read_exact(&mut buf).await.unwrap();
        String::from_utf8(buf).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_command_is_framed_and_acknowledged() {
        let (controller, mut device) = attached().await;

        let cmd = Command::linear_move(25.0, 375.0, 2000);
        let send = controller.send_command(&cmd);
        let device_side = async {
            let frame = read_exact_str(&mut device, "G1 X25.000 Y375.000 F2000\n".len()).await;
            device.write_all(b"[MSG:Pgm End]\r\n<Run|MPos:1,2,0>\r\nok\r\n").await.unwrap();
            frame
        };
        let (result, frame) = tokio::join!(send, device_side);

        assert_eq!(frame, "G1 X25.000 Y375.000 F2000\n");
        assert_eq!(result.unwrap(), ResponseClass::Ok);
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_and_alarm_are_classified() {
        let (controller, mut device) = attached().await;

        let cmd = Command::new("G1 X1");
        let send = controller.send_command(&cmd);
        let reply = async {
            read_exact_str(&mut device, 6).await;
            device.write_all(b"error:9\r\n").await.unwrap();
        };
        let (result, _) = tokio::join!(send, reply);
        assert_eq!(result.unwrap(), ResponseClass::Error(9));

        let cmd = Command::new("G1 X2");
        let send = controller.send_command(&cmd);
        let reply = async {
            read_exact_str(&mut device, 6).await;
            device.write_all(b"ALARM:1\r\n").await.unwrap();
        };
        let (result, _) = tokio::join!(send, reply);
        assert_eq!(result.unwrap(), ResponseClass::Alarm(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silence_times_out() {
        let (controller, _device) = attached().await;
        let command = Command::motion("G1 X10 Y10 F2000").with_timeout(Duration::from_secs(5));

        let err = controller.send_command(&command).await.unwrap_err();
        match err {
            GantryError::Timeout { command, timeout } => {
                assert_eq!(command, "G1 X10 Y10 F2000");
                assert_eq!(timeout, Duration::from_secs(5));
            }
            other => panic!("expected timeout, got {}", other),
        }
        assert!(controller.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupt_bypasses_blocked_command() {
        let (controller, mut device) = attached().await;
        let controller = Arc::new(controller);

        let blocked = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.send_command(&Command::new("$H")).await })
        };

        assert_eq!(read_exact_str(&mut device, 3).await, "$H\n");
        controller.interrupt().await.unwrap();
        assert_eq!(read_exact_str(&mut device, 1).await, "!");

        device.write_all(b"ok\n").await.unwrap();
        assert_eq!(blocked.await.unwrap().unwrap(), ResponseClass::Ok);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_alarm_blocks_new_frame() {
        let (controller, mut device) = attached().await;
        device.write_all(b"ok\r\nALARM:2\r\n").await.unwrap();
        tokio::task::yield_now().await;

        let result = controller.send_command(&Command::new("G1 X5")).await.unwrap();
        assert_eq!(result, ResponseClass::Alarm(2));

        // Nothing was written
        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_millis(10), device.read(&mut buf)).await;
        assert!(read.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_link_is_connection_error() {
        let (controller, mut device) = attached().await;

        let cmd = Command::new("G90");
        let send = controller.send_command(&cmd);
        let hangup = async {
            read_exact_str(&mut device, 4).await;
            drop(device);
        };
        let (result, _) = tokio::join!(send, hangup);

        assert!(matches!(result, Err(GantryError::Connection(_))));
        assert!(!controller.is_connected());
        assert!(matches!(
            controller.send_command(&Command::new("G90")).await,
            Err(GantryError::NotConnected)
        ));
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_unrecognized_line_is_protocol_error() {
        let (controller, mut device) = attached().await;

        let cmd = Command::new("G21");
        let send = controller.send_command(&cmd);
        let reply = async {
            read_exact_str(&mut device, 4).await;
            device.write_all(b"garbage!\r\n").await.unwrap();
        };
        let (result, _) = tokio::join!(send, reply);

        assert!(matches!(result, Err(GantryError::Protocol { ref line }) if line == "garbage!"));
        assert!(logs_contain("Unrecognized response line"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_query_status_uses_realtime_byte() {
        let (controller, mut device) = attached().await;

        let query = controller.query_status();
        let reply = async {
            let byte = read_exact_str(&mut device, 1).await;
            device
                .write_all(b"ok\r\n<Idle|MPos:10.000,20.000,0.000|FS:0,0>\r\n")
                .await
                .unwrap();
            byte
        };
        let (report, byte) = tokio::join!(query, reply);

        assert_eq!(byte, "?");
        let report = report.unwrap();
        assert_eq!(report.state, ControllerState::Idle);
        assert_eq!(report.position.x, 10.0);
        assert_eq!(report.position.y, 20.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_banner_is_drained_on_attach() {
        let controller = ProtocolController::new(Arc::new(SerialPortOpener), ProtocolSettings::default());
        let (host, mut device) = tokio::io::duplex(1024);
        device
            .write_all(b"\r\nGrbl 1.1h ['$' for help]\r\n[MSG:'$H'|'$X' to unlock]\r\n")
            .await
            .unwrap();
        controller.attach(Box::new(host)).await.unwrap();

        let cmd = Command::unlock();
        let send = controller.send_command(&cmd);
        let reply = async {
            assert_eq!(read_exact_str(&mut device, 3).await, "$X\n");
            device.write_all(b"ok\r\n").await.unwrap();
        };
        let (result, _) = tokio::join!(send, reply);
        assert_eq!(result.unwrap(), ResponseClass::Ok);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlong_line_is_capped() {
        let (controller, mut device) = attached().await;

        let cmd = Command::new("G21");
        let send = controller.send_command(&cmd);
        let reply = async {
            read_exact_str(&mut device, 4).await;
            device.write_all(&[b'x'; 600]).await.unwrap();
            device.write_all(b"\r\n").await.unwrap();
        };
        let (result, _) = tokio::join!(send, reply);

        match result {
            Err(GantryError::Protocol { line }) => {
                assert_eq!(line.len(), MAX_LINE_LEN);
                assert!(line.bytes().all(|b| b == b'x'));
            }
            other => panic!("expected protocol error, got {:?}", other),
        }
        {
            let reader = controller.reader.lock().await;
            assert!(reader.as_ref().unwrap().pending.len() <= MAX_LINE_LEN + 1);
        }

        // The tail of the long line is skipped, not read as a response
        let cmd = Command::new("G90");
        let send = controller.send_command(&cmd);
        let reply = async {
            assert_eq!(read_exact_str(&mut device, 4).await, "G90\n");
            device.write_all(b"ok\r\n").await.unwrap();
        };
        let (result, _) = tokio::join!(send, reply);
        assert_eq!(result.unwrap(), ResponseClass::Ok);
        assert!(controller.is_connected());
    }
}
