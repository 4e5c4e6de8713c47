//! Sweeps run by the trigger model of the instrument.
//!
//! The plan is programmed as a linear staircase from its first to its last setpoint. The
//! instrument dwells the step interval at every point and hands back all readings with a single
//! buffer read, so no time series is recorded.
//!
//! A running buffer read cannot be interrupted. An abort is reported right away and the buffer
//! that arrives afterwards is thrown away, it never ends up in front of a later query.

use std::time::{Duration, Instant};

use crate::cancel::CancelToken;
use crate::channel::{CommandSender, ResultReceiver};
use crate::collect::{self, CollectorConfig};
use crate::commands;
use crate::console::EventSender;
use crate::instrument::TransferFormat;
use crate::{Error, Event, Operation, RawSample, Response, SweepPlan};

pub struct HardwareSweep {
    commands: CommandSender,
    results: ResultReceiver,
    events: EventSender,
    format: TransferFormat,
    config: CollectorConfig,
}

impl HardwareSweep {
    pub fn new(
        commands: CommandSender,
        results: ResultReceiver,
        events: EventSender,
        format: TransferFormat,
        config: CollectorConfig,
    ) -> Self {
        Self {
            commands,
            results,
            events,
            format,
            config,
        }
    }

    /// Run `plan` once. Returns whether it was aborted and the batch, if one survived.
    pub fn run(&self, plan: &SweepPlan, cancel: &CancelToken) -> (bool, Option<Vec<RawSample>>) {
        self.events.progress(0.0);
        let stale = self.results.discard_pending();
        if stale > 0 {
            log::debug!("Discarded {} stale results", stale);
        }
        if cancel.is_cancelled() {
            return self.finish(true, None);
        }
        let setup = match commands::hardware_sweep(plan) {
            Ok(x) => x,
            Err(err) => {
                log::warn!("Cannot run hardware sweep: {}", err);
                self.events.status(err.to_string());
                return self.finish(true, None);
            }
        };
        let queued = self
            .commands
            .write_all(setup)
            .and_then(|_| self.commands.enqueue(Operation::ReadBuffer(plan.len())));
        let ret = match queued {
            Ok(_) => self.wait(plan, cancel),
            Err(err) => {
                log::warn!("Cannot queue hardware sweep: {}", err);
                self.finish(true, None)
            }
        };
        if let Err(err) = self.commands.write_all(commands::fixed_mode(plan.source)) {
            log::warn!("Cannot restore fixed source mode: {}", err);
        }
        ret
    }

    fn wait(&self, plan: &SweepPlan, cancel: &CancelToken) -> (bool, Option<Vec<RawSample>>) {
        let poll: Duration = self.config.poll.into();
        let total = plan.total_time();
        let start = Instant::now();
        let deadline = self
            .config
            .idle_timeout
            .and_then(|x| total.checked_add(x.into()))
            .and_then(|x| start.checked_add(x));
        let mut aborted = false;
        let mut percent = 0;
        let resp = loop {
            if !aborted && cancel.is_cancelled() {
                log::info!("Hardware sweep aborted, waiting for the instrument to finish");
                aborted = true;
                self.events.send(Event::SweepComplete { aborted: true });
            }
            if deadline.map_or(false, |x| Instant::now() >= x) {
                log::warn!("No readings after {:.1} s", start.elapsed().as_secs_f64());
                break None;
            }
            match self.results.recv_timeout(poll) {
                Ok(resp) => break Some(resp),
                Err(Error::Disconnected) => break None,
                Err(_) => {}
            }
            if !aborted && total > Duration::from_secs(0) {
                let now = (start.elapsed().as_secs_f64() / total.as_secs_f64() * 100.0).min(99.0) as u32;
                if now > percent {
                    percent = now;
                    self.events.progress(percent as f64);
                }
            }
        };
        if aborted {
            if resp.is_some() {
                log::debug!("Dropped buffer of aborted hardware sweep");
            }
            return (true, None);
        }
        match resp {
            Some(resp) => {
                let batch = self.decode(&resp);
                self.events.progress(100.0);
                self.finish(false, batch)
            }
            None => self.finish(true, None),
        }
    }

    fn decode(&self, resp: &Response) -> Option<Vec<RawSample>> {
        match collect::decode_buffer(resp.as_bytes(), self.format) {
            Ok(samples) => {
                self.events.send(Event::MeasurementCount(samples.len()));
                collect::viable(samples, self.config.min_samples)
            }
            Err(err) => {
                log::warn!("Cannot decode sweep buffer: {}", err);
                None
            }
        }
    }

    fn finish(&self, aborted: bool, batch: Option<Vec<RawSample>>) -> (bool, Option<Vec<RawSample>>) {
        log::debug!("Hardware sweep complete, aborted: {}", aborted);
        self.events.send(Event::SweepComplete { aborted });
        (aborted, batch)
    }
}
