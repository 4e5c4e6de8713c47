//! Holds the device at its maximum power point.
//!
//! Every setpoint of the plan stands for one dwell period. A period starts with a search for the
//! source level at which the product of voltage and current is most negative, that is where the
//! device delivers the most power. The level is then held for the step interval and one reading
//! reports the power actually delivered.

use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::cancel::CancelToken;
use crate::channel::{CommandSender, ResultReceiver};
use crate::collect;
use crate::commands::{self, InstrumentSettings, LOCAL};
use crate::console::EventSender;
use crate::instrument::TransferFormat;
use crate::{Event, Operation, RawSample, SourceFunction, SweepPlan};
use ivsweep_protocol::{Duration as WireDuration, Speed};

const DWELL_POLL: Duration = Duration::from_millis(10);

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MppConfig {
    /// First level to search from, 0.7 V or 10 mA unless given
    pub guess: Option<f64>,
    /// Initial search step, 0.2 V or 5 mA unless given
    pub step: Option<f64>,
    /// Search ends once the step shrank below this fraction of the initial step
    pub tolerance: f64,
    /// Readings one search may take
    pub max_evaluations: usize,
    pub read_timeout: WireDuration,
}

impl Default for MppConfig {
    fn default() -> Self {
        Self {
            guess: None,
            step: None,
            tolerance: 0.005,
            max_evaluations: 40,
            read_timeout: WireDuration::from_millis(10_000),
        }
    }
}

/// Search start, step and source range for `source`.
fn search_defaults(source: SourceFunction) -> (f64, f64, f64) {
    match source {
        SourceFunction::Voltage => (0.7, 0.2, 3.0),
        SourceFunction::Current => (0.01, 0.005, 0.1),
    }
}

/// Minimize `f` over `[-bound, bound]` by compass search starting at `guess`.
///
/// Tries one step up and one step down, moves on improvement and halves the step otherwise,
/// until the step falls below `min_step` or `budget` evaluations are used. NaN counts as worse
/// than anything. Returns the best point and its value, or `None` as soon as `f` does.
pub fn pattern_search<F>(mut f: F, guess: f64, step: f64, min_step: f64, bound: f64, budget: usize) -> Option<(f64, f64)>
where
    F: FnMut(f64) -> Option<f64>,
{
    let bound = bound.abs();
    let clamp = |x: f64| x.max(-bound).min(bound);
    let mut eval = |x: f64| f(x).map(|y| if y.is_nan() { f64::INFINITY } else { y });

    let mut x = clamp(guess);
    let mut best = eval(x)?;
    let mut evaluations = 1;
    let mut step = step.abs();
    while step > 0.0 && step >= min_step && evaluations < budget {
        let mut moved = false;
        for candidate in &[x + step, x - step] {
            let candidate = clamp(*candidate);
            if candidate == x || evaluations >= budget {
                continue;
            }
            let y = eval(candidate)?;
            evaluations += 1;
            if y < best {
                x = candidate;
                best = y;
                moved = true;
                break;
            }
        }
        if !moved {
            step /= 2.0;
        }
    }
    Some((x, best))
}

pub struct MppTracker {
    commands: CommandSender,
    results: ResultReceiver,
    events: EventSender,
    format: TransferFormat,
    config: MppConfig,
}

impl MppTracker {
    pub fn new(
        commands: CommandSender,
        results: ResultReceiver,
        events: EventSender,
        format: TransferFormat,
        config: MppConfig,
    ) -> Self {
        Self {
            commands,
            results,
            events,
            format,
            config,
        }
    }

    /// Dwell once per setpoint of `plan`, then put `settings` back. Returns whether it was aborted.
    pub fn run(&self, plan: &SweepPlan, settings: &InstrumentSettings, cancel: &CancelToken) -> bool {
        let source = plan.source;
        let (guess, step, range) = search_defaults(source);
        let step = self.config.step.unwrap_or(step);
        let min_step = step.abs() * self.config.tolerance;
        let dwell: Duration = plan.step_interval.into();
        let total = plan.len();

        self.events.progress(0.0);
        self.results.discard_pending();
        let mut setup = vec![commands::source_range(source, range), commands::output(true)];
        setup.extend(
            InstrumentSettings {
                source,
                speed: Speed::Normal,
                ..settings.clone()
            }
            .speed_commands(),
        );
        let mut aborted = match self.commands.write_all(setup) {
            Ok(_) => false,
            Err(err) => {
                log::warn!("Cannot prepare maximum power tracking: {}", err);
                true
            }
        };

        let mut level = self.config.guess.unwrap_or(guess);
        for idx in 0..total {
            if aborted || cancel.is_cancelled() {
                aborted = true;
                break;
            }
            let found = pattern_search(
                |x| {
                    if cancel.is_cancelled() {
                        return None;
                    }
                    self.power_at(source, x)
                },
                level,
                step,
                min_step,
                range,
                self.config.max_evaluations,
            );
            level = match found {
                Some((x, _)) => x,
                None => {
                    aborted = true;
                    break;
                }
            };
            log::debug!("Maximum power point at {:.4} {}", level, source.unit());
            if let Err(err) = self
                .commands
                .write(commands::set_level(source, level))
                .and_then(|_| self.commands.write(LOCAL))
            {
                log::warn!("Cannot hold maximum power point: {}", err);
                aborted = true;
                break;
            }
            if !dwell_for(dwell, cancel) {
                aborted = true;
                break;
            }
            match self.sample() {
                Some(sample) => self.events.send(Event::MaxPowerPoint {
                    source,
                    level,
                    power: -sample.power(),
                }),
                None => {
                    aborted = true;
                    break;
                }
            }
            self.events.progress((idx + 1) as f64 / total as f64 * 100.0);
        }

        let mut restore = vec![commands::source_range(settings.source, settings.source_range)];
        restore.extend(settings.speed_commands());
        restore.push(commands::output(settings.output));
        if let Err(err) = self.commands.write_all(restore) {
            log::warn!("Cannot restore instrument settings: {}", err);
        }
        log::debug!("Maximum power tracking complete, aborted: {}", aborted);
        self.events.send(Event::SweepComplete { aborted });
        aborted
    }

    /// V * I at `level`, negative while the device generates power.
    fn power_at(&self, source: SourceFunction, level: f64) -> Option<f64> {
        if let Err(err) = self.commands.write(commands::set_level(source, level)) {
            log::warn!("Cannot set level: {}", err);
            return None;
        }
        self.sample().map(|x| x.power())
    }

    fn sample(&self) -> Option<RawSample> {
        self.results.discard_pending();
        let ret = self
            .commands
            .enqueue(Operation::ReadRaw)
            .and_then(|_| self.results.recv_timeout(self.config.read_timeout.into()))
            .and_then(|resp| collect::decode(resp.as_bytes(), self.format));
        match ret {
            Ok(x) => Some(x),
            Err(err) => {
                log::warn!("Reading failed while tracking: {}", err);
                None
            }
        }
    }
}

/// Sleep `dwell` unless cancelled first. Returns false if cancelled.
fn dwell_for(dwell: Duration, cancel: &CancelToken) -> bool {
    let start = Instant::now();
    while start.elapsed() < dwell {
        if cancel.is_cancelled() {
            return false;
        }
        thread::sleep(DWELL_POLL.min(dwell.saturating_sub(start.elapsed())));
    }
    !cancel.is_cancelled()
}
