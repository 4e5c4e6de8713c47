//! Steps the source value through a [`SweepPlan`].
//!
//! The driver is a producer on the command queue like any other. Abort is level triggered and
//! polled once per step, so an abort takes effect within one step interval.

use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::anyhow;

use crate::cancel::CancelToken;
use crate::channel::CommandSender;
use crate::commands::{self, AUTOZERO_ONCE};
use crate::console::EventSender;
use crate::{Error, Event, SweepPlan, SweepState};

struct Inner {
    state: SweepState,
    plan: Option<SweepPlan>,
    abort: Option<CancelToken>,
}

#[derive(Clone)]
pub struct SweepDriver {
    inner: Arc<Mutex<Inner>>,
    commands: CommandSender,
    events: EventSender,
}

pub struct SweepHandle {
    handle: JoinHandle<bool>,
}

impl SweepHandle {
    /// Wait for the sweep to finish. Returns whether it was aborted.
    pub fn join(self) -> crate::Result<bool> {
        self.handle
            .join()
            .map_err(|_| Error::internal(anyhow!("Sweep thread panicked")))
    }
}

impl SweepDriver {
    pub fn new(commands: CommandSender, events: EventSender) -> Self {
        let inner = Inner {
            state: SweepState::Idle,
            plan: None,
            abort: None,
        };
        Self {
            inner: Arc::new(Mutex::new(inner)),
            commands,
            events,
        }
    }

    pub fn state(&self) -> SweepState {
        self.inner.lock().unwrap().state
    }

    pub fn plan(&self) -> Option<SweepPlan> {
        self.inner.lock().unwrap().plan.clone()
    }

    /// Replace the plan. Only possible while no sweep is running.
    pub fn update_plan(&self, plan: SweepPlan) -> crate::Result<()> {
        if plan.is_empty() {
            return Err(Error::argument(anyhow!("Sweep plan without setpoints")));
        }
        let mut inner = self.inner.lock().unwrap();
        if inner.state != SweepState::Idle {
            return Err(Error::Busy);
        }
        log::debug!("New sweep plan: {} points of {}", plan.len(), plan.source);
        inner.plan = Some(plan);
        Ok(())
    }

    pub fn start(&self) -> crate::Result<SweepHandle> {
        let (plan, abort) = {
            let mut inner = self.inner.lock().unwrap();
            if inner.state != SweepState::Idle {
                return Err(Error::Busy);
            }
            let plan = inner
                .plan
                .clone()
                .ok_or_else(|| Error::argument(anyhow!("No sweep plan configured")))?;
            let abort = CancelToken::new();
            inner.state = SweepState::Running;
            inner.abort = Some(abort.clone());
            (plan, abort)
        };
        let driver = self.clone();
        let handle = thread::spawn(move || driver.run(plan, abort));
        Ok(SweepHandle { handle })
    }

    /// Request an early end. Has no effect unless a sweep is running.
    pub fn abort(&self) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(abort) = &inner.abort {
            abort.cancel();
            inner.state = SweepState::Aborting;
        }
    }

    fn run(&self, plan: SweepPlan, abort: CancelToken) -> bool {
        let total = plan.len();
        let step: Duration = plan.step_interval.into();
        self.events.progress(0.0);
        let mut aborted = false;
        if let Err(err) = self.commands.write(AUTOZERO_ONCE) {
            log::warn!("Cannot start sweep: {}", err);
            aborted = true;
        }
        for (idx, value) in plan.setpoints.iter().enumerate() {
            if aborted || abort.is_cancelled() {
                aborted = true;
                break;
            }
            if let Err(err) = self.commands.write(commands::set_level(plan.source, *value)) {
                log::warn!("Sweep stopped at step {}: {}", idx, err);
                aborted = true;
                break;
            }
            thread::sleep(step);
            self.events.progress((idx + 1) as f64 / total as f64 * 100.0);
        }
        self.finish(aborted);
        aborted
    }

    fn finish(&self, aborted: bool) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.state = SweepState::Complete;
            inner.abort = None;
        }
        log::debug!("Sweep complete, aborted: {}", aborted);
        self.events.send(Event::SweepComplete { aborted });
        self.inner.lock().unwrap().state = SweepState::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{command_channel, CommandReceiver};
    use crate::console::event_channel;
    use crate::{Operation, SourceFunction};
    use ivsweep_protocol::Duration as WireDuration;
    use std::time::Instant;

    fn drain(mut rx: CommandReceiver, tx: &CommandSender) -> Vec<Operation> {
        tx.stop().unwrap();
        let mut ret = Vec::new();
        while let Some(op) = rx.dequeue() {
            ret.push(op);
        }
        ret
    }

    #[test]
    fn three_point_sweep() {
        let (tx, rx) = command_channel();
        let (etx, mut erx) = event_channel();
        let driver = SweepDriver::new(tx.clone(), etx);
        let plan = SweepPlan {
            step_interval: WireDuration::from_millis(10),
            setpoints: vec![0.0, 0.5, 1.0],
            source: SourceFunction::Voltage,
        };
        driver.update_plan(plan).unwrap();
        let aborted = driver.start().unwrap().join().unwrap();
        assert!(!aborted);
        assert_eq!(driver.state(), SweepState::Idle);

        assert_eq!(
            drain(rx, &tx),
            vec![
                Operation::write(":system:azero once"),
                Operation::write(":source:voltage 0.0000"),
                Operation::write(":source:voltage 0.5000"),
                Operation::write(":source:voltage 1.0000"),
            ]
        );
        let events = erx.drain();
        assert_eq!(events.first(), Some(&Event::Progress(0.0)));
        assert_eq!(events.last(), Some(&Event::SweepComplete { aborted: false }));
        let completions = events
            .iter()
            .filter(|x| matches!(x, Event::SweepComplete { .. }))
            .count();
        assert_eq!(completions, 1);
        assert!(events.contains(&Event::Progress(100.0)));
    }

    #[test]
    fn abort_within_one_step() {
        let (tx, rx) = command_channel();
        let (etx, mut erx) = event_channel();
        let driver = SweepDriver::new(tx.clone(), etx);
        let step = Duration::from_millis(20);
        let plan = SweepPlan::linear(0.0, 1.0, 100, step.into(), SourceFunction::Voltage);
        driver.update_plan(plan).unwrap();
        let handle = driver.start().unwrap();
        thread::sleep(Duration::from_millis(50));
        // autozero plus setpoints so far
        let enqueued = tx.size();
        let t0 = Instant::now();
        driver.abort();
        assert_eq!(driver.state(), SweepState::Aborting);
        assert!(handle.join().unwrap());
        assert!(t0.elapsed() < step + Duration::from_millis(50));

        let ops = drain(rx, &tx);
        assert!(ops.len() <= enqueued + 1);
        assert!(ops.len() < 101);
        assert_eq!(erx.drain().last(), Some(&Event::SweepComplete { aborted: true }));
        assert_eq!(driver.state(), SweepState::Idle);
    }

    #[test]
    fn plan_is_locked_while_running() {
        let (tx, _rx) = command_channel();
        let (etx, _erx) = event_channel();
        let driver = SweepDriver::new(tx, etx);
        assert!(matches!(driver.start(), Err(Error::Argument(_))));
        let empty = SweepPlan::linear(0.0, 1.0, 0, WireDuration::from_millis(1), SourceFunction::Voltage);
        assert!(driver.update_plan(empty).is_err());

        let plan = SweepPlan::linear(0.0, 1.0, 5, WireDuration::from_millis(10), SourceFunction::Current);
        driver.update_plan(plan.clone()).unwrap();
        let handle = driver.start().unwrap();
        assert!(matches!(driver.update_plan(plan.clone()), Err(Error::Busy)));
        assert!(matches!(driver.start(), Err(Error::Busy)));
        handle.join().unwrap();
        driver.update_plan(plan).unwrap();
    }

    #[test]
    fn abort_while_idle_does_not_stick() {
        let (tx, rx) = command_channel();
        let (etx, _erx) = event_channel();
        let driver = SweepDriver::new(tx.clone(), etx);
        driver.abort();
        let plan = SweepPlan::linear(0.0, 0.2, 3, WireDuration::from_millis(1), SourceFunction::Voltage);
        driver.update_plan(plan).unwrap();
        assert!(!driver.start().unwrap().join().unwrap());
        assert_eq!(drain(rx, &tx).len(), 4);
    }
}
