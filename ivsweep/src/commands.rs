//! SCPI command vocabulary of the sourcemeter.
//!
//! Everything here only builds strings or operations; nothing is sent from this module.

use serde::{Deserialize, Serialize};

use crate::instrument::TransferFormat;
use crate::{Error, Operation, Parameter, SourceFunction, SweepPlan};
use ivsweep_protocol::{Speed, Terminals};

pub const AUTOZERO_ONCE: &str = ":system:azero once";
pub const IDENTIFY: &str = "*idn?";
pub const RESET: &str = "*rst";
/// Reports `0` if the instrument speaks the 488.1 protocol, which binary reads depend on.
pub const PROTOCOL_STATE: &str = ":system:mep:state?";
pub const SHUTTER_STATE: &str = ":source2:ttl:actual?";
pub const SHUTTER_OPEN: u8 = 14;
pub const SHUTTER_CLOSED: u8 = 15;

/// Enter local mode so the front panel keeps updating.
pub const LOCAL: &str = ":system:key 23";
/// Size of the reading buffer of the 2400.
pub const MAX_SWEEP_POINTS: usize = 2500;

/// The command moving the source to `value`.
pub fn set_level(source: SourceFunction, value: f64) -> String {
    format!(":source:{} {:.4}", source, value)
}

pub fn output(on: bool) -> String {
    format!(":output {}", on_off(on))
}

pub fn display(enable: bool) -> String {
    format!(":display:enable {}", on_off(enable))
}

pub fn shutter(open: bool) -> String {
    format!(":source2:ttl {}", if open { SHUTTER_OPEN } else { SHUTTER_CLOSED })
}

/// Let the instrument step through `plan` on its own. Only start, stop and point count of the
/// plan are used, the instrument spaces the points linearly.
pub fn hardware_sweep(plan: &SweepPlan) -> crate::Result<Vec<String>> {
    let n = plan.len();
    if n < 2 || n > MAX_SWEEP_POINTS {
        return Err(Error::argument(anyhow::anyhow!(
            "Hardware sweeps need between 2 and {} points, got {}",
            MAX_SWEEP_POINTS,
            n
        )));
    }
    let (start, stop) = (plan.setpoints[0], plan.setpoints[n - 1]);
    let delay: std::time::Duration = plan.step_interval.into();
    Ok(vec![
        format!(":source:{}:start {:.4}", plan.source, start),
        format!(":source:{}:stop {:.4}", plan.source, stop),
        format!(":source:sweep:points {}", n),
        format!(":trigger:count {}", n),
        format!(":source:delay {:.3}", delay.as_secs_f64()),
        format!(":source:{}:mode sweep", plan.source),
    ])
}

/// Return to sourcing a single level with one reading per trigger.
pub fn fixed_mode(source: SourceFunction) -> Vec<String> {
    vec![
        format!(":source:{}:mode fixed", source),
        ":source:delay 0".to_string(),
        ":trigger:count 1".to_string(),
    ]
}

pub fn source_range(source: SourceFunction, range: f64) -> String {
    format!(":source:{}:range {:.3}", source, range.abs())
}

fn on_off(x: bool) -> &'static str {
    if x {
        "on"
    } else {
        "off"
    }
}

/// What the instrument is configured to, as far as we told it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstrumentSettings {
    pub source: SourceFunction,
    pub terminals: Terminals,
    pub four_wire: bool,
    pub autozero: bool,
    pub speed: Speed,
    pub average: u32,
    /// In base units of the sensed quantity
    pub compliance: f64,
    pub source_range: f64,
    pub level: f64,
    pub output: bool,
    pub display: bool,
}

impl Default for InstrumentSettings {
    fn default() -> Self {
        Self {
            source: SourceFunction::Voltage,
            terminals: Terminals::Front,
            four_wire: false,
            autozero: false,
            speed: Speed::Fast,
            average: 0,
            compliance: 0.1,
            source_range: 1.0,
            level: 0.0,
            output: false,
            display: true,
        }
    }
}

impl InstrumentSettings {
    fn source_commands(&self) -> Vec<String> {
        let sense_function = match self.source {
            SourceFunction::Voltage => r#":sense:function "current:dc", "voltage:dc""#,
            SourceFunction::Current => r#":sense:function "voltage:dc", "current:dc""#,
        };
        vec![
            format!(":source:function {}", self.source),
            sense_function.to_string(),
            format!(":source:{}:mode fixed", self.source),
        ]
    }

    fn compliance_commands(&self) -> Vec<String> {
        let sense = self.source.sense();
        vec![
            format!(":sense:{}:protection {:.3}", sense, self.compliance),
            format!(":sense:{}:range {:.3}", sense, self.compliance),
        ]
    }

    pub fn speed_commands(&self) -> Vec<String> {
        vec![
            format!(":sense:{}:nplcycles {}", self.source.sense(), self.speed.nplc()),
            format!(":display:digits {}", self.speed.digits()),
        ]
    }

    fn average_commands(&self) -> Vec<String> {
        if self.average == 0 {
            vec![":sense:average off".to_string()]
        } else {
            vec![
                ":sense:average on".to_string(),
                format!(":sense:average:count {}", self.average),
            ]
        }
    }

    fn terminal_commands(&self) -> Vec<String> {
        let x = match self.terminals {
            Terminals::Front => "front",
            Terminals::Rear => "rear",
        };
        vec![format!(":route:terminals {}", x)]
    }

    fn wire_commands(&self) -> Vec<String> {
        vec![format!(":system:rsense {}", on_off(self.four_wire))]
    }

    fn range_commands(&self) -> Vec<String> {
        vec![source_range(self.source, self.source_range)]
    }

    /// Full configuration sequence sent once after connecting.
    pub fn setup(&self, format: TransferFormat) -> Vec<String> {
        let mut ret: Vec<String> = format.commands().iter().map(|x| x.to_string()).collect();
        ret.push(":system:beeper:state 0".to_string());
        // always measure current and voltage
        ret.push(":sense:function:concurrent on".to_string());
        ret.extend(self.terminal_commands());
        ret.extend(self.wire_commands());
        // never buffer readings in the instrument, we poll them
        ret.push(":trace:feed:control never".to_string());
        ret.push(format!(":system:azero {}", on_off(self.autozero)));
        ret.push(":sense:average:tcontrol repeat".to_string());
        ret.extend(self.average_commands());
        ret.push(":format:elements time,voltage,current,status".to_string());
        ret.push(":trigger:delay 0".to_string());
        ret.push(":source:sweep:spacing linear".to_string());
        ret.push(":source:sweep:ranging best".to_string());
        ret.extend(self.source_commands());
        ret.extend(self.range_commands());
        ret.push(set_level(self.source, self.level));
        ret.extend(self.compliance_commands());
        ret.extend(self.speed_commands());
        ret.push(":source:delay 0".to_string());
        ret.push(":trigger:count 1".to_string());
        ret.push(output(self.output));
        ret
    }

    /// Apply `param` and return the commands that bring the instrument in line.
    ///
    /// Changes to the measurement path are made with the output switched off, it is switched
    /// back on afterwards if it was on before.
    pub fn apply(&mut self, param: &Parameter) -> crate::Result<Vec<String>> {
        let mut needs_output_off = true;
        let cmds = match param {
            Parameter::Output(on) => {
                self.output = *on;
                return Ok(vec![output(*on)]);
            }
            Parameter::Source(source) => {
                self.source = *source;
                let mut ret = self.source_commands();
                ret.extend(self.range_commands());
                ret.push(set_level(self.source, self.level));
                ret.extend(self.compliance_commands());
                ret.extend(self.speed_commands());
                ret
            }
            Parameter::Terminals(terminals) => {
                self.terminals = *terminals;
                self.terminal_commands()
            }
            Parameter::FourWire(four_wire) => {
                self.four_wire = *four_wire;
                self.wire_commands()
            }
            Parameter::Compliance(value) => {
                if *value <= 0.0 {
                    return Err(Error::argument(anyhow::anyhow!("Compliance must be positive")));
                }
                self.compliance = *value;
                self.compliance_commands()
            }
            Parameter::AutoZero(on) => {
                needs_output_off = false;
                self.autozero = *on;
                vec![format!(":system:azero {}", on_off(*on))]
            }
            Parameter::Speed(speed) => {
                needs_output_off = false;
                self.speed = *speed;
                self.speed_commands()
            }
            Parameter::Average(count) => {
                needs_output_off = false;
                if *count > 100 {
                    return Err(Error::argument(anyhow::anyhow!("Averaging count must be 100 or less")));
                }
                self.average = *count;
                self.average_commands()
            }
            Parameter::SourceRange(range) => {
                needs_output_off = false;
                self.source_range = range.abs();
                self.range_commands()
            }
            Parameter::SourceLevel(level) => {
                needs_output_off = false;
                self.level = *level;
                vec![set_level(self.source, *level)]
            }
            Parameter::Display(on) => {
                needs_output_off = false;
                self.display = *on;
                vec![display(*on)]
            }
        };
        if !(needs_output_off && self.output) {
            return Ok(cmds);
        }
        let mut ret = vec![":output off".to_string()];
        ret.extend(cmds);
        ret.push(":output on".to_string());
        Ok(ret)
    }
}

/// Best-effort sequence leaving the instrument in a friendly state before disconnecting.
pub fn reset_sequence() -> Vec<Operation> {
    let mut ret = vec![Operation::Clear];
    ret.extend(
        [
            ":abort",
            ":arm:count 1",
            ":display:enable on",
            ":display:window1:text:state off",
            ":display:window2:text:state off",
            "*rst",
            "*cls",
            LOCAL,
        ]
        .iter()
        .map(|x| Operation::write(*x)),
    );
    ret
}

/// Make sure `idn` names the expected model and firmware.
pub fn check_identity(idn: &str, model: &str, firmware: &str) -> crate::Result<()> {
    if !idn.contains(model) {
        return Err(Error::connection(format!(
            "Could not detect instrument with \"{}\"",
            model
        )));
    }
    if !idn.contains(firmware) {
        return Err(Error::connection(format!(
            "{} found, firmware {} not detected. Please upgrade firmware to continue.",
            model, firmware
        )));
    }
    Ok(())
}
