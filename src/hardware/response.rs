//! GRBL 1.1 Response Grammar
//!
//! Every line received from the controller is parsed exactly once, here, into a
//! closed set of [`Response`] variants. Nothing downstream looks at raw text.
//!
//! | Line | Variant |
//! |------|---------|
//! | `ok` | [`Response::Ok`] |
//! | `error:9` | [`Response::Error`] |
//! | `ALARM:1` | [`Response::Alarm`] |
//! | `<Idle\|MPos:0.000,0.000,0.000\|FS:0,0>` | [`Response::Status`] |
//! | `[MSG:Caution: Unlocked]` | [`Response::Feedback`] |
//! | `Grbl 1.1h ['$' for help]` | [`Response::Welcome`] |
//! | anything else | [`Response::Unrecognized`] |

use crate::coordinates::PhysicalPosition;
use serde::Serialize;
use std::str::FromStr;

/// Machine state tag from a status report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ControllerState {
    /// Ready, nothing queued.
    Idle,
    /// Executing motion.
    Run,
    /// Feed hold, with GRBL sub-state (0 = complete, 1 = decelerating).
    Hold(u8),
    /// Jogging.
    Jog,
    /// Locked by an alarm.
    Alarm,
    /// Safety door open, with sub-state.
    Door(u8),
    /// G-code check mode.
    Check,
    /// Homing cycle running.
    Home,
    /// Sleep mode.
    Sleep,
}

impl FromStr for ControllerState {
    type Err = ();

    fn from_str(tag: &str) -> Result<Self, Self::Err> {
        let (name, sub) = match tag.split_once(':') {
            Some((name, sub)) => (name, Some(sub.parse::<u8>().map_err(|_| ())?)),
            None => (tag, None),
        };
        match (name, sub) {
            ("Idle", None) => Ok(Self::Idle),
            ("Run", None) => Ok(Self::Run),
            ("Hold", sub) => Ok(Self::Hold(sub.unwrap_or(0))),
            ("Jog", None) => Ok(Self::Jog),
            ("Alarm", None) => Ok(Self::Alarm),
            ("Door", sub) => Ok(Self::Door(sub.unwrap_or(0))),
            ("Check", None) => Ok(Self::Check),
            ("Home", None) => Ok(Self::Home),
            ("Sleep", None) => Ok(Self::Sleep),
            _ => Err(()),
        }
    }
}

/// Parsed `<...>` status report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    /// Controller state tag.
    pub state: ControllerState,
    /// X/Y position (mm).
    pub position: PhysicalPosition,
    /// Z position when the controller reports three axes.
    pub z: Option<f64>,
    /// Current feed (mm/min) from `FS:` or `F:`.
    pub feed_rate: Option<f64>,
    /// True when the position came from `WPos` rather than `MPos`.
    pub work_coordinates: bool,
}

impl StatusReport {
    fn parse(body: &str) -> Option<Self> {
        let mut fields = body.split('|');
        let state = fields.next()?.parse::<ControllerState>().ok()?;

        let mut position = None;
        let mut work_coordinates = false;
        let mut z = None;
        let mut feed_rate = None;

        for field in fields {
            let (key, value) = field.split_once(':')?;
            match key {
                "MPos" | "WPos" => {
                    let axes = parse_floats(value)?;
                    if axes.len() < 2 {
                        return None;
                    }
                    position = Some(PhysicalPosition::new(axes[0], axes[1]));
                    z = axes.get(2).copied();
                    work_coordinates = key == "WPos";
                }
                "FS" | "F" => {
                    feed_rate = parse_floats(value)?.first().copied();
                }
                // Buffer state, overrides, pins and offsets are not needed here
                _ => {}
            }
        }

        Some(Self {
            state,
            position: position?,
            z,
            feed_rate,
            work_coordinates,
        })
    }
}

fn parse_floats(value: &str) -> Option<Vec<f64>> {
    value
        .split(',')
        .map(|v| v.trim().parse::<f64>().ok().filter(|f| f.is_finite()))
        .collect()
}

/// One classified line from the controller.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// Command accepted.
    Ok,
    /// Command rejected with a GRBL error code.
    Error(u16),
    /// Alarm raised, possibly unsolicited.
    Alarm(u16),
    /// Real-time status report.
    Status(StatusReport),
    /// Bracketed informational message, e.g. `[MSG:...]`.
    Feedback(String),
    /// Startup banner; the controller has (re)booted.
    Welcome(String),
    /// Matches no known grammar.
    Unrecognized(String),
}

impl Response {
    /// Classify a single line. Surrounding whitespace and `\r` are ignored.
    pub fn parse(line: &str) -> Self {
        let line = line.trim();

        if line == "ok" {
            return Self::Ok;
        }
        if let Some(code) = strip_prefix_ignore_case(line, "error:") {
            return code
                .parse()
                .map(Self::Error)
                .unwrap_or_else(|_| Self::Unrecognized(line.to_string()));
        }
        if let Some(code) = strip_prefix_ignore_case(line, "alarm:") {
            return code
                .parse()
                .map(Self::Alarm)
                .unwrap_or_else(|_| Self::Unrecognized(line.to_string()));
        }
        if let Some(body) = line.strip_prefix('<').and_then(|l| l.strip_suffix('>')) {
            return StatusReport::parse(body)
                .map(Self::Status)
                .unwrap_or_else(|| Self::Unrecognized(line.to_string()));
        }
        if let Some(body) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            return Self::Feedback(body.to_string());
        }
        if let Some(version) = line.strip_prefix("Grbl ") {
            return Self::Welcome(version.to_string());
        }
        Self::Unrecognized(line.to_string())
    }

    /// Terminal classification for a command, if this line ends one.
    pub fn terminal(&self) -> Option<ResponseClass> {
        match self {
            Self::Ok => Some(ResponseClass::Ok),
            Self::Error(code) => Some(ResponseClass::Error(*code)),
            Self::Alarm(code) => Some(ResponseClass::Alarm(*code)),
            _ => None,
        }
    }
}

fn strip_prefix_ignore_case<'a>(line: &'a str, prefix: &str) -> Option<&'a str> {
    let head = line.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix).then(|| &line[prefix.len()..])
}

/// Outcome of a command that received a terminal line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseClass {
    /// `ok`
    Ok,
    /// `error:<code>`
    Error(u16),
    /// `ALARM:<code>`
    Alarm(u16),
}

/// Human-readable text for a GRBL 1.1 error code.
pub fn describe_error(code: u16) -> &'static str {
    match code {
        1 => "G-code words consist of a letter and a value. Letter was not found",
        2 => "Missing the expected G-code word value or numeric value format is not valid",
        3 => "Grbl '$' system command was not recognized or supported",
        4 => "Negative value received for an expected positive value",
        5 => "Homing cycle failure. Homing is not enabled via settings",
        6 => "Minimum step pulse time must be greater than 3usec",
        7 => "An EEPROM read failed. Auto-restoring affected EEPROM to default values",
        8 => "Grbl '$' command cannot be used unless Grbl is IDLE",
        9 => "G-code commands are locked out during alarm or jog state",
        10 => "Soft limits cannot be enabled without homing also enabled",
        11 => "Max characters per line exceeded. Received command line was not executed",
        12 => "Grbl '$' setting value cause the step rate to exceed the maximum supported",
        13 => "Safety door detected as opened and door state initiated",
        14 => "Build info or startup line exceeded EEPROM line length limit",
        15 => "Jog target exceeds machine travel. Jog command has been ignored",
        16 => "Jog command has no '=' or contains prohibited g-code",
        17 => "Laser mode requires PWM output",
        20 => "Unsupported or invalid g-code command found in block",
        21 => "More than one g-code command from same modal group found in block",
        22 => "Feed rate has not yet been set or is undefined",
        33 => "Motion command has an invalid target",
        _ => "Unknown error code",
    }
}

/// Human-readable text for a GRBL 1.1 alarm code.
pub fn describe_alarm(code: u16) -> &'static str {
    match code {
        1 => "Hard limit triggered. Position likely lost",
        2 => "Soft limit alarm. Motion target exceeds machine travel",
        3 => "Reset while in motion. Position likely lost",
        4 => "Probe fail. Probe not in expected initial state",
        5 => "Probe fail. Probe did not contact the workpiece",
        6 => "Homing fail. Reset during active homing cycle",
        7 => "Homing fail. Safety door was opened during homing cycle",
        8 => "Homing fail. Pull off travel failed to clear limit switch",
        9 => "Homing fail. Could not find limit switch within search distance",
        10 => "Homing fail. Second dual axis limit switch failed to trigger",
        _ => "Unknown alarm code",
    }
}
