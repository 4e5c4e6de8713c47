//! One connected instrument and the sweep pipeline on top of it.
//!
//! A [`Session`] owns the instrument worker, the command and result queues and the drivers.
//! Sweeps run on a coordinator thread. In timed mode it starts the collector, the measurement
//! driver and the sweep driver, stops measuring once the sweep completed and hands the batch to
//! post-processing. Hardware sweeps and maximum power tracking replace that pipeline with
//! [`HardwareSweep`] and [`MppTracker`]. [`Controller`] maps console commands onto sessions.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::anyhow;
use serde::{Deserialize, Serialize};

use crate::address::Address;
use crate::analyzer::IvAnalyzer;
use crate::cancel::CancelToken;
use crate::channel::{command_channel, result_channel, CommandSender, ResultReceiver};
use crate::collect::{CollectMode, CollectTarget, CollectorConfig, SampleCollector};
use crate::commands::{self, InstrumentSettings, IDENTIFY, PROTOCOL_STATE, RESET, SHUTTER_OPEN, SHUTTER_STATE};
use crate::console::EventSender;
use crate::hardware::HardwareSweep;
use crate::instrument::{self, ConnectOptions, Instrument};
use crate::iotask::{InstrumentWorker, WorkerStats};
use crate::measure::{MeasurementConfig, MeasurementDriver};
use crate::mpp::{MppConfig, MppTracker};
use crate::postprocess::PostProcessor;
use crate::sink::{Metadata, Sink};
use crate::sweep::SweepDriver;
use crate::{ConsoleCommand, Error, Event, Operation, Parameter, RawSample, SweepMode, SweepPlan};
use ivsweep_protocol::{ConnectionStatus, Duration as WireDuration, Speed};

const RECOVERY_POLL: Duration = Duration::from_millis(10);

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ContinualConfig {
    /// Number of sweeps per start, 0 keeps sweeping until aborted
    pub sweeps: u32,
    /// Pause between two sweeps with the source back at its start value
    pub recovery: WireDuration,
}

impl Default for ContinualConfig {
    fn default() -> Self {
        Self {
            sweeps: 1,
            recovery: WireDuration::from_millis(0),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub connect: ConnectOptions,
    pub measurement: MeasurementConfig,
    pub collector: CollectorConfig,
    pub settings: InstrumentSettings,
    /// How long the instrument may take to identify itself
    pub handshake_timeout: WireDuration,
    pub model: String,
    pub firmware: String,
    pub metadata: Metadata,
    /// Run the curve analysis on each batch
    pub analyze: bool,
    /// Switch the front panel display off while sweeping
    pub blank_display: bool,
    pub continual: ContinualConfig,
    pub mode: SweepMode,
    pub mpp: MppConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect: ConnectOptions::default(),
            measurement: MeasurementConfig::default(),
            collector: CollectorConfig::default(),
            settings: InstrumentSettings::default(),
            handshake_timeout: WireDuration::from_millis(10_000),
            model: "MODEL 2400".to_string(),
            firmware: "C32".to_string(),
            metadata: Metadata::default(),
            analyze: true,
            blank_display: false,
            continual: ContinualConfig::default(),
            mode: SweepMode::Timed,
            mpp: MppConfig::default(),
        }
    }
}

impl SessionConfig {
    fn handshake_timeout(&self) -> Duration {
        self.handshake_timeout.into()
    }
}

/// Reset, identify and configure the instrument. Returns the identification string.
fn handshake<T: Instrument + ?Sized>(instr: &mut T, config: &SessionConfig) -> crate::Result<String> {
    instr.write(RESET)?;
    let idn = instr.query(IDENTIFY)?;
    commands::check_identity(&idn, &config.model, &config.firmware)?;
    let state = instr.query(PROTOCOL_STATE)?;
    if state.trim() != "0" {
        return Err(Error::connection(
            "SCPI comms mode detected, please switch the instrument to the 488.1 protocol",
        ));
    }
    for cmd in config.settings.setup(config.connect.format) {
        instr.write(&cmd)?;
    }
    Ok(idn.trim().to_string())
}

/// Run the handshake on its own thread so an instrument that never answers cannot block us.
fn handshake_with_timeout<T: Instrument + 'static>(instr: T, config: &SessionConfig) -> crate::Result<(T, String)> {
    let (tx, rx) = crossbeam::channel::bounded(1);
    let cfg = config.clone();
    thread::spawn(move || {
        let mut instr = instr;
        let ret = match handshake(&mut instr, &cfg) {
            Ok(idn) => Ok((instr, idn)),
            Err(err) => {
                if let Err(err) = instr.close() {
                    log::warn!("Closing instrument failed: {}", err);
                }
                Err(err)
            }
        };
        // receiver is gone if we timed out
        if let Err(err) = tx.send(ret) {
            if let Ok((mut instr, _)) = err.into_inner() {
                log::info!("Handshake finished after timeout, releasing instrument");
                if let Err(err) = instr.close() {
                    log::warn!("Closing instrument failed: {}", err);
                }
            }
        }
    });
    let ret = rx
        .recv_timeout(config.handshake_timeout())
        .map_err(|_| Error::connection("Instrument did not answer in time"))?;
    ret.map_err(|err| match err {
        Error::Connection(_) => err,
        err => Error::connection(format!("Handshake failed: {}", err)),
    })
}

/// Everything the coordinator thread needs for one start.
struct Run {
    plan: SweepPlan,
    mode: SweepMode,
    settings: InstrumentSettings,
    config: SessionConfig,
    commands: CommandSender,
    results: ResultReceiver,
    sweep: SweepDriver,
    measure: MeasurementDriver,
    postprocess: PostProcessor,
    events: EventSender,
    cancel: CancelToken,
    running: Arc<AtomicBool>,
}

impl Run {
    fn execute(self) {
        let mut processing = Vec::new();
        let mut n = 0;
        while !self.cancel.is_cancelled() {
            n += 1;
            let (aborted, batch) = match self.mode {
                SweepMode::Timed => self.sweep_once(),
                SweepMode::Hardware => self.hardware_once(),
                SweepMode::MaxPower => (self.track(), None),
            };
            if let Some(batch) = batch {
                let postprocess = self.postprocess.clone();
                let meta = Metadata {
                    sweep_up: self.plan.sweep_up(),
                    save_time_series: self.config.metadata.save_time_series && self.mode == SweepMode::Timed,
                    ..self.config.metadata.clone()
                };
                processing.push(thread::spawn(move || {
                    postprocess.process(batch, &meta);
                }));
            }
            let sweeps = self.config.continual.sweeps;
            if aborted || self.cancel.is_cancelled() || (sweeps > 0 && n >= sweeps) {
                break;
            }
            if self.mode == SweepMode::MaxPower || !self.recover() {
                break;
            }
        }
        if n == 0 {
            // aborted before the first sweep began
            self.events.send(Event::SweepComplete { aborted: true });
        }
        for x in processing {
            if x.join().is_err() {
                log::error!("Post-processing thread panicked");
            }
        }
        self.running.store(false, Ordering::SeqCst);
        log::debug!("Sweep run finished after {} sweeps", n);
    }

    fn sweep_once(&self) -> (bool, Option<Vec<RawSample>>) {
        let stale = self.results.discard_pending();
        if stale > 0 {
            log::debug!("Discarded {} stale results", stale);
        }
        if self.config.blank_display {
            self.write(commands::display(false));
        }
        let collector = SampleCollector::new(
            self.results.clone(),
            self.config.connect.format,
            self.config.collector.clone(),
        );
        let target = CollectTarget::new();
        let (streaming, fixed) = match self.config.collector.mode {
            CollectMode::Streaming => {
                let target = target.clone();
                (Some(thread::spawn(move || collector.collect_streaming(&target))), None)
            }
            CollectMode::FixedCount => (None, Some(collector)),
        };

        let measurement = match self.measure.start() {
            Ok(x) => Some(x),
            Err(err) => {
                log::warn!("Cannot start measurement: {}", err);
                None
            }
        };
        let ret = self.sweep.start().and_then(|handle| {
            // an abort between the loop check and the start has not reached the driver
            if self.cancel.is_cancelled() {
                self.sweep.abort();
            }
            handle.join()
        });
        let aborted = match ret {
            Ok(aborted) => aborted,
            Err(err) => {
                log::warn!("Sweep failed: {}", err);
                self.events.status(format!("Sweep failed: {}", err));
                self.events.send(Event::SweepComplete { aborted: true });
                true
            }
        };
        self.measure.time_to_die();
        let count = match measurement.map(|x| x.join()) {
            Some(Ok(count)) => count,
            Some(Err(err)) => {
                log::error!("{}", err);
                0
            }
            None => 0,
        };

        let batch = match (streaming, fixed) {
            (Some(handle), _) => {
                target.update_points(count);
                handle.join().unwrap_or_else(|_| {
                    log::error!("Collector thread panicked");
                    None
                })
            }
            (None, Some(collector)) => collector.collect_fixed(count),
            (None, None) => None,
        };

        if self.config.blank_display {
            self.write(commands::display(true));
        }
        if let Some(first) = self.plan.first() {
            self.write(commands::set_level(self.plan.source, first));
        }
        (aborted, batch)
    }

    fn hardware_once(&self) -> (bool, Option<Vec<RawSample>>) {
        let sweep = HardwareSweep::new(
            self.commands.clone(),
            self.results.clone(),
            self.events.clone(),
            self.config.connect.format,
            self.config.collector.clone(),
        );
        if self.config.blank_display {
            self.write(commands::display(false));
        }
        let ret = sweep.run(&self.plan, &self.cancel);
        if self.config.blank_display {
            self.write(commands::display(true));
        }
        if let Some(first) = self.plan.first() {
            self.write(commands::set_level(self.plan.source, first));
        }
        ret
    }

    fn track(&self) -> bool {
        let tracker = MppTracker::new(
            self.commands.clone(),
            self.results.clone(),
            self.events.clone(),
            self.config.connect.format,
            self.config.mpp.clone(),
        );
        tracker.run(&self.plan, &self.settings, &self.cancel)
    }

    /// Wait out the recovery delay. Returns false if aborted meanwhile.
    fn recover(&self) -> bool {
        let delay: Duration = self.config.continual.recovery.into();
        if delay > Duration::from_secs(0) {
            self.events.status(format!("Recovering for {:.1} s", delay.as_secs_f64()));
        }
        let start = Instant::now();
        while start.elapsed() < delay {
            if self.cancel.is_cancelled() {
                return false;
            }
            thread::sleep(RECOVERY_POLL.min(delay.saturating_sub(start.elapsed())));
        }
        !self.cancel.is_cancelled()
    }

    fn write(&self, cmd: String) {
        if let Err(err) = self.commands.write(cmd) {
            log::warn!("Cannot queue command: {}", err);
        }
    }
}

pub struct Session {
    address: String,
    idn: String,
    config: SessionConfig,
    settings: InstrumentSettings,
    mode: SweepMode,
    commands: CommandSender,
    results: ResultReceiver,
    worker: Option<InstrumentWorker>,
    sweep: SweepDriver,
    measure: MeasurementDriver,
    postprocess: PostProcessor,
    events: EventSender,
    run: Option<JoinHandle<()>>,
    cancel: CancelToken,
    running: Arc<AtomicBool>,
}

impl Session {
    /// Connect to `addr`. Failures are reported to the console as well.
    pub fn connect(addr: &Address, config: SessionConfig, sink: Arc<dyn Sink>, events: EventSender) -> crate::Result<Self> {
        let instr = match instrument::connect(addr, &config.connect) {
            Ok(x) => x,
            Err(err) => {
                events.send(Event::ConnectionStatus {
                    status: ConnectionStatus::Failed,
                    message: err.to_string(),
                });
                return Err(err);
            }
        };
        Self::with_instrument(addr.to_string(), instr, config, sink, events)
    }

    pub fn with_instrument<T: Instrument + 'static>(
        address: String,
        instr: T,
        config: SessionConfig,
        sink: Arc<dyn Sink>,
        events: EventSender,
    ) -> crate::Result<Self> {
        let (instr, idn) = match handshake_with_timeout(instr, &config) {
            Ok(x) => x,
            Err(err) => {
                log::warn!("Connecting to {} failed: {}", address, err);
                events.send(Event::ConnectionStatus {
                    status: ConnectionStatus::Failed,
                    message: err.to_string(),
                });
                return Err(err);
            }
        };
        log::info!("Connected to {}: {}", address, idn);

        let (commands, cmd_rx) = command_channel();
        let (result_tx, results) = result_channel();
        let worker = InstrumentWorker::spawn(instr, cmd_rx, result_tx);

        let mut postprocess = PostProcessor::new(sink, events.clone());
        if config.analyze {
            postprocess = postprocess.with_analyzer(Arc::new(IvAnalyzer::new(config.metadata.area)));
        }
        let sweep = SweepDriver::new(commands.clone(), events.clone());
        let measure = MeasurementDriver::new(commands.clone(), events.clone(), config.measurement.clone());
        events.send(Event::ConnectionStatus {
            status: ConnectionStatus::Ok,
            message: idn.clone(),
        });
        Ok(Self {
            address,
            idn,
            settings: config.settings.clone(),
            mode: config.mode,
            config,
            commands,
            results,
            worker: Some(worker),
            sweep,
            measure,
            postprocess,
            events,
            run: None,
            cancel: CancelToken::new(),
            running: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn identity(&self) -> &str {
        &self.idn
    }

    pub fn settings(&self) -> &InstrumentSettings {
        &self.settings
    }

    pub fn is_sweeping(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn mode(&self) -> SweepMode {
        self.mode
    }

    /// Select how the next sweep acquires data. Hardware sweeps integrate slowly with autozero on,
    /// timed sweeps read as fast as possible without it.
    pub fn set_mode(&mut self, mode: SweepMode) -> crate::Result<()> {
        self.ensure_idle()?;
        let params = match mode {
            SweepMode::Timed => vec![Parameter::Speed(Speed::Fast), Parameter::AutoZero(false)],
            SweepMode::Hardware => vec![Parameter::Speed(Speed::Accurate), Parameter::AutoZero(true)],
            SweepMode::MaxPower => Vec::new(),
        };
        for param in &params {
            let cmds = self.settings.apply(param)?;
            self.commands.write_all(cmds)?;
        }
        log::info!("Sweep mode {:?}", mode);
        self.mode = mode;
        Ok(())
    }

    fn ensure_idle(&self) -> crate::Result<()> {
        if self.is_sweeping() {
            Err(Error::Busy)
        } else {
            Ok(())
        }
    }

    pub fn update_plan(&self, plan: SweepPlan) -> crate::Result<()> {
        self.ensure_idle()?;
        self.sweep.update_plan(plan)
    }

    pub fn start_sweep(&mut self) -> crate::Result<()> {
        self.ensure_idle()?;
        let plan = self
            .sweep
            .plan()
            .ok_or_else(|| Error::argument(anyhow!("No sweep plan configured")))?;
        if let Some(run) = self.run.take() {
            // finished already, running is false
            let _ = run.join();
        }
        self.cancel = CancelToken::new();
        self.running.store(true, Ordering::SeqCst);
        log::info!("Starting {:?} sweep of {} points", self.mode, plan.len());
        let run = Run {
            plan,
            mode: self.mode,
            settings: self.settings.clone(),
            config: self.config.clone(),
            commands: self.commands.clone(),
            results: self.results.clone(),
            sweep: self.sweep.clone(),
            measure: self.measure.clone(),
            postprocess: self.postprocess.clone(),
            events: self.events.clone(),
            cancel: self.cancel.clone(),
            running: self.running.clone(),
        };
        self.run = Some(thread::spawn(move || run.execute()));
        Ok(())
    }

    /// Request the running sweep and any further continual sweeps to end.
    pub fn abort_sweep(&self) {
        self.cancel.cancel();
        self.sweep.abort();
    }

    /// Block until the current run, including its post-processing, is done.
    pub fn wait(&mut self) -> crate::Result<()> {
        match self.run.take() {
            Some(run) => run
                .join()
                .map_err(|_| Error::internal(anyhow!("Sweep coordinator panicked"))),
            None => Ok(()),
        }
    }

    pub fn set_parameter(&mut self, param: &Parameter) -> crate::Result<()> {
        self.ensure_idle()?;
        let cmds = self.settings.apply(param)?;
        self.commands.write_all(cmds)
    }

    /// Ad-hoc query. Not available while sweeping since the answer would end up between samples.
    pub fn query(&self, cmd: &str) -> crate::Result<String> {
        self.ensure_idle()?;
        self.results.discard_pending();
        self.commands.enqueue(Operation::query(cmd))?;
        let resp = self.results.recv_timeout(self.config.handshake_timeout())?;
        Ok(resp.text())
    }

    pub fn shutter_open(&self) -> crate::Result<bool> {
        let state = self.query(SHUTTER_STATE)?;
        let state: u8 = state
            .trim()
            .parse()
            .map_err(|_| Error::unexpected(format!("Invalid TTL state: {}", state)))?;
        Ok(state == SHUTTER_OPEN)
    }

    pub fn set_shutter(&self, open: bool) -> crate::Result<()> {
        self.ensure_idle()?;
        self.commands.write(commands::shutter(open))
    }

    /// Flip the shutter and return whether it is open now.
    pub fn toggle_shutter(&self) -> crate::Result<bool> {
        let open = !self.shutter_open()?;
        self.set_shutter(open)?;
        self.events.status(if open { "Shutter open" } else { "Shutter closed" });
        Ok(open)
    }

    /// Stop everything, reset the instrument and wait for the worker to release it.
    pub fn disconnect(mut self) -> crate::Result<WorkerStats> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> crate::Result<WorkerStats> {
        let worker = match self.worker.take() {
            Some(x) => x,
            None => return Ok(WorkerStats::default()),
        };
        self.abort_sweep();
        // the reset sequence must not race a live sweep
        if let Err(err) = self.wait() {
            log::error!("{}", err);
        }
        for op in commands::reset_sequence() {
            if let Err(err) = self.commands.enqueue(op) {
                log::warn!("Cannot queue reset sequence: {}", err);
                break;
            }
        }
        if let Err(err) = self.commands.stop() {
            log::warn!("Instrument worker already gone: {}", err);
        }
        let stats = worker.join()?;
        log::info!(
            "Disconnected from {}: {} operations, {} failed",
            self.address,
            stats.executed,
            stats.failed
        );
        Ok(stats)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            log::error!("Shutting down session failed: {}", err);
        }
    }
}

/// Applies console commands, owning the session while connected.
pub struct Controller {
    config: SessionConfig,
    sink: Arc<dyn Sink>,
    events: EventSender,
    session: Option<Session>,
}

impl Controller {
    pub fn new(config: SessionConfig, sink: Arc<dyn Sink>, events: EventSender) -> Self {
        Self {
            config,
            sink,
            events,
            session: None,
        }
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn session_mut(&mut self) -> Option<&mut Session> {
        self.session.as_mut()
    }

    fn connected(&mut self) -> crate::Result<&mut Session> {
        self.session.as_mut().ok_or(Error::Disconnected)
    }

    /// Apply `cmd`. Failures are also reported to the console as status messages.
    pub fn handle(&mut self, cmd: ConsoleCommand) -> crate::Result<()> {
        let ret = self.apply(cmd);
        if let Err(err) = &ret {
            self.events.status(err.to_string());
        }
        ret
    }

    fn apply(&mut self, cmd: ConsoleCommand) -> crate::Result<()> {
        match cmd {
            ConsoleCommand::Connect { address } => {
                let addr = Address::parse(&address)?;
                if let Some(session) = self.session.take() {
                    session.disconnect()?;
                }
                let session = Session::connect(&addr, self.config.clone(), self.sink.clone(), self.events.clone())?;
                self.session = Some(session);
                Ok(())
            }
            ConsoleCommand::Disconnect => match self.session.take() {
                Some(session) => session.disconnect().map(|_| ()),
                None => Ok(()),
            },
            ConsoleCommand::UpdateSweepPlan(plan) => self.connected()?.update_plan(plan),
            ConsoleCommand::StartSweep => self.connected()?.start_sweep(),
            ConsoleCommand::AbortSweep => {
                self.connected()?.abort_sweep();
                Ok(())
            }
            ConsoleCommand::SetParameter(param) => self.connected()?.set_parameter(&param),
            ConsoleCommand::SetMode(mode) => self.connected()?.set_mode(mode),
            ConsoleCommand::ToggleShutter => self.connected()?.toggle_shutter().map(|_| ()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::console::{event_channel, EventReceiver};
    use crate::sink::CsvSink;
    use crate::testing::{Call, CallLog, RecordingInstrument};
    use crate::SourceFunction;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;

    #[derive(Default)]
    struct MemorySink {
        batches: Mutex<Vec<usize>>,
    }

    impl Sink for MemorySink {
        fn store(&self, samples: &[crate::RawSample], _meta: &Metadata) -> crate::Result<PathBuf> {
            self.batches.lock().unwrap().push(samples.len());
            Ok(PathBuf::from("memory"))
        }
    }

    fn recording() -> (RecordingInstrument, CallLog) {
        let (mut instr, log) = RecordingInstrument::new();
        instr.set_reply(IDENTIFY, crate::transport::sim::IDENTITY);
        instr.set_reply(PROTOCOL_STATE, "0");
        instr.set_delay(Duration::from_millis(1));
        (instr, log)
    }

    fn config() -> SessionConfig {
        let mut ret = SessionConfig::default();
        ret.collector.idle_timeout = Some(WireDuration::from_millis(500));
        ret.analyze = false;
        ret
    }

    fn plan() -> SweepPlan {
        SweepPlan::linear(0.0, 0.6, 7, WireDuration::from_millis(5), SourceFunction::Voltage)
    }

    /// Wait for an event matching `pred`, returning all events seen so far.
    fn wait_for<F: Fn(&Event) -> bool>(rx: &mut EventReceiver, pred: F) -> Vec<Event> {
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut seen = Vec::new();
        while Instant::now() < deadline {
            match rx.try_recv() {
                Some(x) => {
                    let done = pred(&x);
                    seen.push(x);
                    if done {
                        return seen;
                    }
                }
                None => thread::sleep(Duration::from_millis(1)),
            }
        }
        panic!("event did not arrive, got {:?}", seen);
    }

    #[test]
    fn handshake_rejects_wrong_firmware() {
        let (mut instr, log) = recording();
        instr.set_reply(IDENTIFY, "KEITHLEY INSTRUMENTS INC.,MODEL 2400,1,C30");
        let (tx, mut rx) = event_channel();
        let ret = Session::with_instrument("test".into(), instr, config(), Arc::new(MemorySink::default()), tx);
        assert!(matches!(ret, Err(Error::Connection(_))));
        assert!(matches!(
            rx.try_recv(),
            Some(Event::ConnectionStatus {
                status: ConnectionStatus::Failed,
                ..
            })
        ));
        assert_eq!(log.calls()[0], Call::Write(RESET.to_string()));
        assert!(log.closed());
    }

    #[test]
    fn handshake_rejects_scpi_mode() {
        let (mut instr, _log) = recording();
        instr.set_reply(PROTOCOL_STATE, "1");
        let (tx, _rx) = event_channel();
        let err = Session::with_instrument("test".into(), instr, config(), Arc::new(MemorySink::default()), tx)
            .err()
            .unwrap();
        assert!(err.to_string().contains("SCPI comms mode"));
    }

    #[test]
    fn handshake_times_out() {
        let (mut instr, log) = recording();
        instr.set_delay(Duration::from_millis(20));
        let mut cfg = config();
        cfg.handshake_timeout = WireDuration::from_millis(50);
        let (tx, _rx) = event_channel();
        let ret = Session::with_instrument("test".into(), instr, cfg, Arc::new(MemorySink::default()), tx);
        assert!(matches!(ret, Err(Error::Connection(_))));
        // the handshake still succeeds later on, nobody takes the instrument then
        let deadline = Instant::now() + Duration::from_secs(10);
        while !log.closed() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(log.closed());
    }

    #[test]
    fn sweep_then_reset_on_disconnect() {
        let (instr, log) = recording();
        let (tx, mut rx) = event_channel();
        let sink = Arc::new(MemorySink::default());
        let mut session = Session::with_instrument("test".into(), instr, config(), sink.clone(), tx).unwrap();
        assert!(session.identity().contains("MODEL 2400"));
        session.update_plan(plan()).unwrap();
        session.start_sweep().unwrap();
        assert!(matches!(session.query("*idn?"), Err(Error::Busy)));
        assert!(matches!(session.update_plan(plan()), Err(Error::Busy)));

        let events = wait_for(&mut rx, |x| matches!(x, Event::ProcessingComplete { .. }));
        assert!(events.contains(&Event::SweepComplete { aborted: false }));
        let count = events
            .iter()
            .find_map(|x| match x {
                Event::MeasurementCount(n) => Some(*n),
                _ => None,
            })
            .unwrap();
        session.wait().unwrap();
        assert!(!session.is_sweeping());
        assert_eq!(sink.batches.lock().unwrap().clone(), vec![count]);

        let stats = session.disconnect().unwrap();
        // the recording instrument does not support device clear
        assert_eq!(stats.failed, 1);
        let writes = log.writes();
        let last_setpoint = writes.iter().rposition(|x| x == ":source:voltage 0.6000").unwrap();
        let reset = writes.iter().position(|x| x == ":abort").unwrap();
        assert!(last_setpoint < reset);
        // source back at the start value before the reset
        assert!(writes[last_setpoint + 1..reset].contains(&":source:voltage 0.0000".to_string()));
        assert_eq!(writes.last().unwrap(), commands::LOCAL);
        assert!(!log.overlapped());
        assert!(log.closed());
    }

    #[test]
    fn continual_sweeps_until_aborted() {
        let (instr, _log) = recording();
        let (tx, mut rx) = event_channel();
        let sink = Arc::new(MemorySink::default());
        let mut cfg = config();
        cfg.continual = ContinualConfig {
            sweeps: 0,
            recovery: WireDuration::from_millis(20),
        };
        cfg.blank_display = true;
        let mut session = Session::with_instrument("test".into(), instr, cfg, sink.clone(), tx).unwrap();
        session.update_plan(plan()).unwrap();
        session.start_sweep().unwrap();
        wait_for(&mut rx, |x| *x == Event::SweepComplete { aborted: false });
        wait_for(&mut rx, |x| *x == Event::SweepComplete { aborted: false });
        session.abort_sweep();
        session.wait().unwrap();
        assert!(sink.batches.lock().unwrap().len() >= 2);
        session.disconnect().unwrap();
    }

    fn completions(events: &[Event]) -> Vec<bool> {
        events
            .iter()
            .filter_map(|x| match x {
                Event::SweepComplete { aborted } => Some(*aborted),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn abort_mid_sweep_keeps_partial_batch() {
        let (instr, log) = recording();
        let (tx, mut rx) = event_channel();
        let sink = Arc::new(MemorySink::default());
        let mut cfg = config();
        cfg.continual.sweeps = 0;
        let mut session = Session::with_instrument("test".into(), instr, cfg, sink.clone(), tx).unwrap();
        session
            .update_plan(SweepPlan::linear(0.0, 1.0, 200, WireDuration::from_millis(5), SourceFunction::Voltage))
            .unwrap();
        session.start_sweep().unwrap();
        let mut events = wait_for(&mut rx, |x| matches!(x, Event::Progress(p) if *p >= 5.0));
        session.abort_sweep();
        events.extend(wait_for(&mut rx, |x| matches!(x, Event::ProcessingComplete { .. })));
        session.wait().unwrap();
        assert!(!session.is_sweeping());
        events.extend(rx.drain());

        assert_eq!(completions(&events), vec![true]);
        assert_eq!(sink.batches.lock().unwrap().len(), 1);
        drop(session);
        let setpoints = log
            .writes()
            .into_iter()
            .filter(|x| x.starts_with(":source:voltage "))
            .count();
        assert!(setpoints < 200);
    }

    #[test]
    fn abort_right_after_start_completes_once() {
        let (instr, _log) = recording();
        let (tx, mut rx) = event_channel();
        let mut session = Session::with_instrument("test".into(), instr, config(), Arc::new(MemorySink::default()), tx).unwrap();
        session.update_plan(plan()).unwrap();
        for _ in 0..20 {
            rx.drain();
            session.start_sweep().unwrap();
            session.abort_sweep();
            session.wait().unwrap();
            assert_eq!(completions(&rx.drain()), vec![true]);
        }
    }

    #[test]
    fn parameters_and_queries_when_idle() {
        let (mut instr, log) = recording();
        instr.set_reply(SHUTTER_STATE, "14");
        let (tx, _rx) = event_channel();
        let mut session = Session::with_instrument("test".into(), instr, config(), Arc::new(MemorySink::default()), tx).unwrap();
        session.set_parameter(&Parameter::Output(true)).unwrap();
        session.set_parameter(&Parameter::Compliance(0.02)).unwrap();
        assert!(session.settings().output);
        assert!(session.shutter_open().unwrap());
        assert_eq!(session.query(":output?").unwrap(), ":output?");
        drop(session);
        let writes = log.writes();
        let n = writes.iter().position(|x| x == ":sense:current:protection 0.020").unwrap();
        assert_eq!(writes[n - 1], ":output off");
        assert_eq!(writes[n + 2], ":output on");
        assert!(log.closed());
    }

    #[test]
    fn simulator_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = event_channel();
        let sink = Arc::new(CsvSink::new(dir.path().join("sim")));
        let mut cfg = config();
        cfg.analyze = true;
        cfg.settings.output = true;
        let mut controller = Controller::new(cfg, sink, tx);
        controller
            .handle(ConsoleCommand::Connect {
                address: "sim::1".to_string(),
            })
            .unwrap();
        // wide enough to cross both axes of the simulated cell
        let plan = SweepPlan::linear(-0.1, 0.8, 10, WireDuration::from_millis(5), SourceFunction::Voltage);
        controller.handle(ConsoleCommand::UpdateSweepPlan(plan)).unwrap();
        controller.handle(ConsoleCommand::StartSweep).unwrap();
        let events = wait_for(&mut rx, |x| matches!(x, Event::ProcessingComplete { .. }));
        match events.last().unwrap() {
            Event::ProcessingComplete { location, report } => {
                assert!(location.as_ref().unwrap().exists());
                assert!(report["00_nSamples"].as_number().unwrap() >= 3.0);
                assert!(report.contains_key("isc[A]"));
            }
            _ => unreachable!(),
        }
        controller.session_mut().unwrap().wait().unwrap();
        controller.handle(ConsoleCommand::Disconnect).unwrap();
        assert!(controller.session().is_none());
    }

    fn simulator(cfg: SessionConfig, dir: &Path) -> (Controller, EventReceiver) {
        let (tx, rx) = event_channel();
        let sink = Arc::new(CsvSink::new(dir.join("sim")));
        let mut controller = Controller::new(cfg, sink, tx);
        controller
            .handle(ConsoleCommand::Connect {
                address: "sim::1".to_string(),
            })
            .unwrap();
        (controller, rx)
    }

    #[test]
    fn shutter_toggles() {
        let dir = tempfile::tempdir().unwrap();
        let (mut controller, mut rx) = simulator(config(), dir.path());
        assert!(!controller.session().unwrap().shutter_open().unwrap());
        controller.handle(ConsoleCommand::ToggleShutter).unwrap();
        assert!(controller.session().unwrap().shutter_open().unwrap());
        assert!(controller.session().unwrap().toggle_shutter().is_ok());
        assert!(!controller.session().unwrap().shutter_open().unwrap());
        let status: Vec<_> = rx
            .drain()
            .into_iter()
            .filter_map(|x| match x {
                Event::Status(msg) => Some(msg),
                _ => None,
            })
            .collect();
        assert_eq!(status, vec!["Shutter open", "Shutter closed"]);
    }

    #[test]
    fn hardware_sweep_on_simulator() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config();
        cfg.analyze = true;
        cfg.settings.output = true;
        cfg.metadata.save_time_series = true;
        let (mut controller, mut rx) = simulator(cfg, dir.path());
        controller.handle(ConsoleCommand::SetMode(SweepMode::Hardware)).unwrap();
        assert_eq!(controller.session().unwrap().mode(), SweepMode::Hardware);
        assert_eq!(controller.session().unwrap().settings().speed, Speed::Accurate);
        assert!(controller.session().unwrap().settings().autozero);

        let plan = SweepPlan::linear(-0.1, 0.8, 10, WireDuration::from_millis(5), SourceFunction::Voltage);
        controller.handle(ConsoleCommand::UpdateSweepPlan(plan.clone())).unwrap();
        controller.handle(ConsoleCommand::StartSweep).unwrap();
        let events = wait_for(&mut rx, |x| matches!(x, Event::ProcessingComplete { .. }));
        assert_eq!(completions(&events), vec![false]);
        assert!(events.contains(&Event::MeasurementCount(10)));
        let location = match events.last().unwrap() {
            Event::ProcessingComplete { location, report } => {
                assert_eq!(report["00_nSamples"].as_number().unwrap(), 10.0);
                assert!(report.contains_key("isc[A]"));
                location.clone().unwrap()
            }
            _ => unreachable!(),
        };
        // no time series from a hardware sweep
        let text = std::fs::read_to_string(location).unwrap();
        assert!(text.contains("# I&V vs t = 0"));
        let rows: Vec<_> = text.lines().filter(|x| !x.starts_with('#')).collect();
        assert_eq!(rows.len(), 10);
        assert_eq!(rows[0].split(',').count(), 2);

        controller.session_mut().unwrap().wait().unwrap();
        controller.handle(ConsoleCommand::SetMode(SweepMode::Timed)).unwrap();
        assert_eq!(controller.session().unwrap().settings().speed, Speed::Fast);
        controller.handle(ConsoleCommand::Disconnect).unwrap();
    }

    #[test]
    fn maximum_power_tracking_on_simulator() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config();
        cfg.settings.output = false;
        let (mut controller, mut rx) = simulator(cfg, dir.path());
        controller.handle(ConsoleCommand::SetMode(SweepMode::MaxPower)).unwrap();
        let plan = SweepPlan::linear(0.0, 0.0, 3, WireDuration::from_millis(5), SourceFunction::Voltage);
        controller.handle(ConsoleCommand::UpdateSweepPlan(plan)).unwrap();
        controller.handle(ConsoleCommand::StartSweep).unwrap();
        let events = wait_for(&mut rx, |x| matches!(x, Event::SweepComplete { .. }));
        controller.session_mut().unwrap().wait().unwrap();

        assert_eq!(completions(&events), vec![false]);
        let points: Vec<_> = events
            .iter()
            .filter_map(|x| match x {
                Event::MaxPowerPoint { level, power, .. } => Some((*level, *power)),
                _ => None,
            })
            .collect();
        assert_eq!(points.len(), 3);
        for (level, power) in points {
            assert!(level > 0.45 && level < 0.62, "level {}", level);
            assert!(power > 0.009, "power {}", power);
        }
        assert!(events.contains(&Event::Progress(100.0)));
        // output is put back the way it was
        assert_eq!(controller.session().unwrap().query(":output?").unwrap(), "0");
        controller.handle(ConsoleCommand::Disconnect).unwrap();
    }

    #[test]
    fn commands_need_a_connection() {
        let (tx, mut rx) = event_channel();
        let mut controller = Controller::new(config(), Arc::new(MemorySink::default()), tx);
        let ret = controller.handle(ConsoleCommand::StartSweep);
        assert!(matches!(ret, Err(Error::Disconnected)));
        assert!(matches!(rx.try_recv(), Some(Event::Status(_))));
        let ret = controller.handle(ConsoleCommand::Connect {
            address: "serial::/dev/ttyUSB0".to_string(),
        });
        assert!(matches!(ret, Err(Error::Argument(_))));
    }
}
