//! Message vocabulary shared between the sweep engine and whatever console drives it.
//!
//! Nothing in here talks to hardware. The types describe what may be queued for an
//! instrument ([`Operation`]), what comes back ([`Response`]), what the operator console
//! may ask for ([`ConsoleCommand`]) and what it gets told ([`Event`]).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::convert::TryFrom;
use std::fmt::{self, Display, Formatter};
use std::path::PathBuf;

pub mod error;
mod util;

pub use crate::error::{Error, ProtocolError, TransportError};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Duration {
    pub micros: u32,
    pub seconds: u32,
}

impl Duration {
    /// Longest representable duration, anything longer saturates to it.
    pub const MAX: Duration = Duration {
        micros: 999_999,
        seconds: u32::MAX,
    };

    pub fn from_millis(millis: u64) -> Self {
        std::time::Duration::from_millis(millis).into()
    }

    /// Negative and NaN inputs give zero, too large ones [`Duration::MAX`].
    pub fn from_secs_f64(secs: f64) -> Self {
        if secs >= u32::MAX as f64 {
            return Self::MAX;
        }
        std::time::Duration::from_secs_f64(secs.max(0.0)).into()
    }
}

impl From<Duration> for std::time::Duration {
    fn from(x: Duration) -> Self {
        std::time::Duration::from_micros(x.micros as u64) + std::time::Duration::from_secs(x.seconds as u64)
    }
}

impl From<std::time::Duration> for Duration {
    fn from(x: std::time::Duration) -> Self {
        if x.as_secs() > u32::MAX as u64 {
            return Duration::MAX;
        }
        Duration {
            micros: x.subsec_micros(),
            seconds: x.as_secs() as u32,
        }
    }
}

/// One instrument operation, queued for serialized execution.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Operation {
    Write(String),
    Query(String),
    ReadRaw,
    Read,
    /// Read one message holding the given number of measurement records.
    ReadBuffer(usize),
    Clear,
}

impl Operation {
    pub fn write<T: Into<String>>(cmd: T) -> Self {
        Operation::Write(cmd.into())
    }

    pub fn query<T: Into<String>>(cmd: T) -> Self {
        Operation::Query(cmd.into())
    }

    pub fn verb(&self) -> &'static str {
        match self {
            Operation::Write(_) => "write",
            Operation::Query(_) => "query",
            Operation::ReadRaw => "read_raw",
            Operation::Read => "read",
            Operation::ReadBuffer(_) => "read_buffer",
            Operation::Clear => "clear",
        }
    }

    pub fn is_read(&self) -> bool {
        matches!(self, Operation::Read | Operation::ReadRaw | Operation::ReadBuffer(_))
    }
}

impl Display for Operation {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Write(cmd) | Operation::Query(cmd) => write!(f, "{}({})", self.verb(), cmd),
            Operation::ReadBuffer(n) => write!(f, "{}({})", self.verb(), n),
            _ => f.write_str(self.verb()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Response {
    Text(String),
    Binary {
        #[serde(
            serialize_with = "crate::util::to_base64",
            deserialize_with = "crate::util::from_base64"
        )]
        data: Vec<u8>,
    },
}

impl Response {
    pub fn binary(data: Vec<u8>) -> Self {
        Response::Binary { data }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Response::Text(x) => x.is_empty(),
            Response::Binary { data } => data.is_empty(),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Response::Text(x) => x.as_bytes(),
            Response::Binary { data } => data,
        }
    }

    /// Textual view of the payload, with trailing line termination removed.
    pub fn text(&self) -> String {
        let ret = match self {
            Response::Text(x) => x.clone(),
            Response::Binary { data } => String::from_utf8_lossy(data).to_string(),
        };
        ret.trim_end_matches(|c| c == '\n' || c == '\r').to_string()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceFunction {
    Voltage,
    Current,
}

impl SourceFunction {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceFunction::Voltage => "voltage",
            SourceFunction::Current => "current",
        }
    }

    /// The quantity measured against this source.
    pub fn sense(&self) -> SourceFunction {
        match self {
            SourceFunction::Voltage => SourceFunction::Current,
            SourceFunction::Current => SourceFunction::Voltage,
        }
    }

    pub fn unit(&self) -> &'static str {
        match self {
            SourceFunction::Voltage => "V",
            SourceFunction::Current => "A",
        }
    }
}

impl Default for SourceFunction {
    fn default() -> Self {
        SourceFunction::Voltage
    }
}

impl Display for SourceFunction {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Timed progression of the source value. Replaced wholesale between sweeps.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SweepPlan {
    pub step_interval: Duration,
    pub setpoints: Vec<f64>,
    #[serde(default)]
    pub source: SourceFunction,
}

impl SweepPlan {
    /// Evenly spaced setpoints from `start` to `end`, both inclusive.
    pub fn linear(start: f64, end: f64, points: usize, step_interval: Duration, source: SourceFunction) -> Self {
        let setpoints = match points {
            0 => Vec::new(),
            1 => vec![start],
            n => {
                let step = (end - start) / (n - 1) as f64;
                (0..n).map(|k| start + step * k as f64).collect()
            }
        };
        SweepPlan {
            step_interval,
            setpoints,
            source,
        }
    }

    pub fn len(&self) -> usize {
        self.setpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.setpoints.is_empty()
    }

    /// A plan sweeps up unless its last setpoint lies below its first.
    pub fn sweep_up(&self) -> bool {
        match (self.setpoints.first(), self.setpoints.last()) {
            (Some(first), Some(last)) => first <= last,
            _ => true,
        }
    }

    pub fn first(&self) -> Option<f64> {
        self.setpoints.first().cloned()
    }

    /// Total time the plan takes when every step dwells `step_interval`.
    pub fn total_time(&self) -> std::time::Duration {
        let dt: std::time::Duration = self.step_interval.into();
        u32::try_from(self.setpoints.len())
            .ok()
            .and_then(|n| dt.checked_mul(n))
            .unwrap_or(std::time::Duration::MAX)
    }
}

/// One decoded measurement record.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawSample {
    pub timestamp: f64,
    pub primary: f64,
    pub secondary: f64,
    pub status: f64,
}

impl RawSample {
    pub fn power(&self) -> f64 {
        self.primary * self.secondary
    }
}

/// How a started sweep acquires its data.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SweepMode {
    /// We step the source and poll readings as fast as possible, yielding I and V versus time.
    Timed,
    /// The instrument runs the sweep from its own trigger model and returns all readings at once.
    Hardware,
    /// Hold the device at its maximum power point, one dwell period per plan setpoint.
    MaxPower,
}

impl Default for SweepMode {
    fn default() -> Self {
        SweepMode::Timed
    }
}

impl SweepMode {
    pub fn parse(value: &str) -> Result<Self, Error> {
        match value.trim().to_lowercase().as_str() {
            "timed" => Ok(SweepMode::Timed),
            "hardware" => Ok(SweepMode::Hardware),
            "mpp" | "maxpower" => Ok(SweepMode::MaxPower),
            _ => Err(Error::argument(anyhow::anyhow!("Unknown sweep mode `{}`", value))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SweepState {
    Idle,
    Running,
    Aborting,
    Complete,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Terminals {
    Front,
    Rear,
}

/// Integration time presets, from fastest to most accurate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speed {
    Fast,
    Medium,
    Normal,
    Accurate,
}

impl Speed {
    pub fn nplc(&self) -> &'static str {
        match self {
            Speed::Fast => "0.01",
            Speed::Medium => "0.1",
            Speed::Normal => "1",
            Speed::Accurate => "10",
        }
    }

    pub fn digits(&self) -> u32 {
        match self {
            Speed::Fast => 4,
            Speed::Medium => 5,
            Speed::Normal => 6,
            Speed::Accurate => 7,
        }
    }
}

/// Instrument settings the operator console may change between sweeps.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Parameter {
    Output(bool),
    Source(SourceFunction),
    Terminals(Terminals),
    FourWire(bool),
    AutoZero(bool),
    Speed(Speed),
    Average(u32),
    /// Compliance limit of the sensed quantity, in base units.
    Compliance(f64),
    SourceRange(f64),
    SourceLevel(f64),
    Display(bool),
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "on" | "true" | "yes" => Some(true),
        "0" | "off" | "false" | "no" => Some(false),
        _ => None,
    }
}

impl Parameter {
    /// Build a parameter from a console `(name, value)` pair.
    pub fn parse(name: &str, value: &str) -> Result<Self, Error> {
        let invalid = || Error::argument(anyhow::anyhow!("Invalid value `{}` for parameter `{}`", value, name));
        let number = || value.trim().parse::<f64>().map_err(|_| invalid());
        let flag = || parse_bool(value).ok_or_else(invalid);
        let ret = match name.trim().to_lowercase().as_str() {
            "output" => Parameter::Output(flag()?),
            "source" => match value.trim().to_lowercase().as_str() {
                "voltage" | "v" => Parameter::Source(SourceFunction::Voltage),
                "current" | "i" => Parameter::Source(SourceFunction::Current),
                _ => return Err(invalid()),
            },
            "terminals" => match value.trim().to_lowercase().as_str() {
                "front" => Parameter::Terminals(Terminals::Front),
                "rear" => Parameter::Terminals(Terminals::Rear),
                _ => return Err(invalid()),
            },
            "wires" => match value.trim() {
                "2" => Parameter::FourWire(false),
                "4" => Parameter::FourWire(true),
                _ => return Err(invalid()),
            },
            "autozero" => Parameter::AutoZero(flag()?),
            "speed" => match value.trim().to_lowercase().as_str() {
                "fast" | "0" => Parameter::Speed(Speed::Fast),
                "medium" | "1" => Parameter::Speed(Speed::Medium),
                "normal" | "2" => Parameter::Speed(Speed::Normal),
                "accurate" | "3" => Parameter::Speed(Speed::Accurate),
                _ => return Err(invalid()),
            },
            "average" => Parameter::Average(value.trim().parse().map_err(|_| invalid())?),
            "compliance" => Parameter::Compliance(number()?),
            "range" => Parameter::SourceRange(number()?),
            "level" => Parameter::SourceLevel(number()?),
            "display" => Parameter::Display(flag()?),
            _ => return Err(Error::argument(anyhow::anyhow!("Unknown parameter `{}`", name))),
        };
        Ok(ret)
    }
}

/// A post-processing result entry: either a figure or an explanation why there is none.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ReportValue {
    Number(f64),
    Note(String),
}

impl ReportValue {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            ReportValue::Number(x) => Some(*x),
            ReportValue::Note(_) => None,
        }
    }
}

impl Display for ReportValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ReportValue::Number(x) => write!(f, "{:.6}", x),
            ReportValue::Note(x) => f.write_str(x),
        }
    }
}

pub type Report = BTreeMap<String, ReportValue>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionStatus {
    Ok,
    Failed,
}

/// Requests issued by the operator console.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ConsoleCommand {
    Connect { address: String },
    Disconnect,
    UpdateSweepPlan(SweepPlan),
    StartSweep,
    AbortSweep,
    SetParameter(Parameter),
    SetMode(SweepMode),
    ToggleShutter,
}

/// Updates delivered to the operator console.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Event {
    Progress(f64),
    SweepComplete {
        aborted: bool,
    },
    ConnectionStatus {
        status: ConnectionStatus,
        message: String,
    },
    MeasurementCount(usize),
    /// The device was held at `level` and generated `power` watts.
    MaxPowerPoint {
        source: SourceFunction,
        level: f64,
        power: f64,
    },
    ProcessingComplete {
        location: Option<PathBuf>,
        report: Report,
    },
    /// Transient message, e.g. a failed command or a recovery pause.
    Status(String),
}
