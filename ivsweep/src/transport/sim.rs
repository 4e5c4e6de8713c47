//! A simulated sourcemeter with an illuminated solar cell attached.
//!
//! Understands the subset of commands the sweep engine sends, answers identification queries
//! like a 2400 in 488.1 mode and produces binary measurement records with a configurable
//! conversion time. Hardware sweeps configured with the `:source:<function>:mode sweep` family of
//! commands are stepped through on the next buffer read.

use std::thread;
use std::time::{Duration, Instant};

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::instrument::{ConnectOptions, Instrument, TransferFormat};
use crate::{Error, SourceFunction};

pub const IDENTITY: &str = "KEITHLEY INSTRUMENTS INC.,MODEL 2400,1234567,C32   Oct  4 2010 14:20:11/A02  /S/K";

const THERMAL_VOLTAGE: f64 = 0.025852;
const IDEALITY: f64 = 1.5;
const SATURATION_CURRENT: f64 = 1e-9;
const PHOTO_CURRENT: f64 = 0.02;
const NOISE: f64 = 1e-4;
const DEFAULT_CURRENT_COMPLIANCE: f64 = 0.105;
const DEFAULT_VOLTAGE_COMPLIANCE: f64 = 21.0;
/// Status word bit signalling the compliance limit was hit.
const STATUS_COMPLIANCE: f64 = 8.0;
const MAX_SOURCE_DELAY: f64 = 60.0;

#[derive(Clone, Debug, Default, PartialEq)]
struct HardwareSweep {
    enabled: bool,
    start: f64,
    stop: f64,
    points: usize,
    delay: f64,
}

impl HardwareSweep {
    fn level(&self, idx: usize) -> f64 {
        if self.points < 2 {
            return self.start;
        }
        let idx = idx.min(self.points - 1);
        self.start + (self.stop - self.start) * idx as f64 / (self.points - 1) as f64
    }
}

pub struct Simulator {
    latency: Duration,
    format: TransferFormat,
    started: Instant,
    source: SourceFunction,
    level: f64,
    output: bool,
    current_compliance: f64,
    voltage_compliance: f64,
    ttl: u8,
    sweep: HardwareSweep,
    rng: StdRng,
}

impl Simulator {
    pub fn new(latency: Duration, options: ConnectOptions) -> Self {
        Self {
            latency,
            format: options.format,
            started: Instant::now(),
            source: SourceFunction::Voltage,
            level: 0.0,
            output: false,
            current_compliance: DEFAULT_CURRENT_COMPLIANCE,
            voltage_compliance: DEFAULT_VOLTAGE_COMPLIANCE,
            ttl: 15,
            sweep: HardwareSweep::default(),
            rng: StdRng::from_entropy(),
        }
    }

    fn reset(&mut self) {
        self.source = SourceFunction::Voltage;
        self.level = 0.0;
        self.output = false;
        self.current_compliance = DEFAULT_CURRENT_COMPLIANCE;
        self.voltage_compliance = DEFAULT_VOLTAGE_COMPLIANCE;
        self.sweep = HardwareSweep::default();
    }

    fn pause(&self, extra: f64) {
        let delay = self.latency + Duration::from_secs_f64(extra.max(0.0).min(MAX_SOURCE_DELAY));
        if delay > Duration::from_secs(0) {
            thread::sleep(delay);
        }
    }

    /// Current into the device at voltage `v`. Negative while the cell delivers power.
    fn current_at(v: f64) -> f64 {
        SATURATION_CURRENT * ((v / (IDEALITY * THERMAL_VOLTAGE)).exp() - 1.0) - PHOTO_CURRENT
    }

    fn voltage_at(i: f64) -> f64 {
        let arg = (i + PHOTO_CURRENT) / SATURATION_CURRENT + 1.0;
        if arg <= 0.0 {
            f64::NEG_INFINITY
        } else {
            IDEALITY * THERMAL_VOLTAGE * arg.ln()
        }
    }

    fn measure(&mut self) -> (f64, f64, f64) {
        if !self.output {
            return (0.0, 0.0, 0.0);
        }
        let noise = 1.0 + self.rng.gen_range(-NOISE..NOISE);
        match self.source {
            SourceFunction::Voltage => {
                let v = self.level;
                let i = Self::current_at(v) * noise;
                if i.abs() > self.current_compliance {
                    (v, self.current_compliance.copysign(i), STATUS_COMPLIANCE)
                } else {
                    (v, i, 0.0)
                }
            }
            SourceFunction::Current => {
                let i = self.level;
                let v = Self::voltage_at(i) * noise;
                if !v.is_finite() || v.abs() > self.voltage_compliance {
                    (self.voltage_compliance.copysign(v), i, STATUS_COMPLIANCE)
                } else {
                    (v, i, 0.0)
                }
            }
        }
    }

    fn payload(&mut self) -> [u8; 16] {
        let t = self.started.elapsed().as_secs_f64();
        let (v, i, status) = self.measure();
        let values = [t as f32, v as f32, i as f32, status as f32];
        let mut ret = [0_u8; 16];
        match self.format {
            TransferFormat::Real32BigEndian => BigEndian::write_f32_into(&values, &mut ret),
            TransferFormat::Real32LittleEndian => LittleEndian::write_f32_into(&values, &mut ret),
        }
        ret
    }
}

fn parse_arg(arg: Option<&str>) -> crate::Result<f64> {
    arg.and_then(|x| x.trim().parse::<f64>().ok())
        .ok_or_else(|| Error::unexpected(format!("Invalid numeric argument: {:?}", arg)))
}

impl Instrument for Simulator {
    fn write(&mut self, cmd: &str) -> crate::Result<()> {
        let cmd = cmd.trim().to_lowercase();
        let mut parts = cmd.splitn(2, char::is_whitespace);
        let header = parts.next().unwrap_or("").trim_start_matches(':');
        let arg = parts.next().map(|x| x.trim());
        match header {
            "*rst" => self.reset(),
            "output" => self.output = matches!(arg, Some("on") | Some("1")),
            "source:function" => {
                self.source = match arg {
                    Some("current") => SourceFunction::Current,
                    _ => SourceFunction::Voltage,
                }
            }
            "source:voltage" | "source:current" => self.level = parse_arg(arg)?,
            "source:voltage:mode" | "source:current:mode" => self.sweep.enabled = arg == Some("sweep"),
            "source:voltage:start" | "source:current:start" => self.sweep.start = parse_arg(arg)?,
            "source:voltage:stop" | "source:current:stop" => self.sweep.stop = parse_arg(arg)?,
            "source:sweep:points" => self.sweep.points = parse_arg(arg)? as usize,
            "source:delay" => self.sweep.delay = parse_arg(arg)?,
            "sense:current:protection" => self.current_compliance = parse_arg(arg)?,
            "sense:voltage:protection" => self.voltage_compliance = parse_arg(arg)?,
            "format:border" => {
                self.format = match arg {
                    Some("swapped") => TransferFormat::Real32LittleEndian,
                    _ => TransferFormat::Real32BigEndian,
                }
            }
            "source2:ttl" => self.ttl = parse_arg(arg)? as u8,
            _ => {}
        }
        Ok(())
    }

    fn query(&mut self, cmd: &str) -> crate::Result<String> {
        let header = cmd.trim().to_lowercase();
        match header.trim_start_matches(':') {
            "*idn?" => Ok(IDENTITY.to_string()),
            "system:mep:state?" => Ok("0".to_string()),
            "source2:ttl:actual?" => Ok(self.ttl.to_string()),
            "output?" => Ok(if self.output { "1" } else { "0" }.to_string()),
            _ => Err(Error::unexpected(format!("Undefined header: {}", cmd))),
        }
    }

    fn read_raw(&mut self) -> crate::Result<Vec<u8>> {
        self.read_buffer(1)
    }

    fn read_buffer(&mut self, records: usize) -> crate::Result<Vec<u8>> {
        let mut ret = b"#0".to_vec();
        if self.sweep.enabled {
            let bias = self.level;
            for idx in 0..records {
                self.level = self.sweep.level(idx);
                self.pause(self.sweep.delay);
                let payload = self.payload();
                ret.extend_from_slice(&payload);
            }
            self.level = bias;
        } else {
            self.pause(0.0);
            for _ in 0..records {
                let payload = self.payload();
                ret.extend_from_slice(&payload);
            }
        }
        ret.push(b'\n');
        Ok(ret)
    }

    fn clear(&mut self) -> crate::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collect::{decode, decode_buffer};

    fn sim() -> Simulator {
        Simulator::new(Duration::from_millis(0), ConnectOptions::default())
    }

    #[test]
    fn output_off_reads_zero() {
        let mut instr = sim();
        let sample = decode(&instr.read_raw().unwrap(), TransferFormat::Real32BigEndian).unwrap();
        assert_eq!(sample.primary, 0.0);
        assert_eq!(sample.secondary, 0.0);
    }

    #[test]
    fn solar_cell_quadrants() {
        let mut instr = sim();
        instr.write(":output on").unwrap();
        instr.write(":source:voltage 0.0000").unwrap();
        let short = decode(&instr.read_raw().unwrap(), TransferFormat::Real32BigEndian).unwrap();
        assert!((short.secondary + PHOTO_CURRENT).abs() < 1e-4);

        instr.write(":source:voltage 2.0000").unwrap();
        let forward = decode(&instr.read_raw().unwrap(), TransferFormat::Real32BigEndian).unwrap();
        assert_eq!(forward.status, STATUS_COMPLIANCE);
        assert!((forward.secondary - DEFAULT_CURRENT_COMPLIANCE).abs() < 1e-6);
    }

    #[test]
    fn current_source_and_byte_order() {
        let mut instr = sim();
        instr.write(":source:function current").unwrap();
        instr.write(":format:border swapped").unwrap();
        instr.write(":output on").unwrap();
        instr.write("source:current 0.000").unwrap();
        let sample = decode(&instr.read_raw().unwrap(), TransferFormat::Real32LittleEndian).unwrap();
        // open circuit voltage of the model is around 0.6 V
        assert!(sample.primary > 0.5 && sample.primary < 0.8);
        assert_eq!(sample.secondary, 0.0);
    }

    #[test]
    fn hardware_sweep_steps_through_range() {
        let mut instr = sim();
        for cmd in &[
            ":output on",
            ":source:voltage 0.1000",
            ":source:voltage:start 0.0000",
            ":source:voltage:stop 0.6000",
            ":source:sweep:points 4",
            ":trigger:count 4",
            ":source:delay 0.001",
            ":source:voltage:mode sweep",
        ] {
            instr.write(cmd).unwrap();
        }
        let raw = instr.read_buffer(4).unwrap();
        assert_eq!(raw.len(), 2 + 4 * 16 + 1);
        let samples = decode_buffer(&raw, TransferFormat::Real32BigEndian).unwrap();
        let levels: Vec<_> = samples.iter().map(|x| x.primary).collect();
        assert_eq!(levels, vec![0.0, 0.2_f32 as f64, 0.4_f32 as f64, 0.6_f32 as f64]);
        assert!(samples.windows(2).all(|x| x[0].timestamp <= x[1].timestamp));

        // back to the bias level once the sweep is over
        instr.write(":source:voltage:mode fixed").unwrap();
        let sample = decode(&instr.read_raw().unwrap(), TransferFormat::Real32BigEndian).unwrap();
        assert_eq!(sample.primary, 0.1_f32 as f64);
    }

    #[test]
    fn identification() {
        let mut instr = sim();
        assert_eq!(instr.query("*idn?").unwrap(), IDENTITY);
        assert_eq!(instr.query(":system:mep:state?").unwrap(), "0");
        instr.write(":source2:ttl 14").unwrap();
        assert_eq!(instr.query(":source2:ttl:actual?").unwrap(), "14");
        assert!(instr.query(":bogus?").is_err());
        assert!(instr.write(":source:voltage abc").is_err());
    }
}
