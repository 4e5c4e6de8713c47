use std::fs::File;
use std::path::PathBuf;
use std::process::exit;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use clap::{crate_authors, crate_version, App as ClapApp, Arg, ArgMatches};
use crossbeam::channel::{self, Receiver, RecvTimeoutError};
use env_logger::Env;
use tokio::runtime::Runtime;

use ivsweep::console::{event_channel, EventReceiver};
use ivsweep::session::{Controller, SessionConfig};
use ivsweep::sink::CsvSink;
use ivsweep::{ConsoleCommand, Event, Parameter, SourceFunction, SweepMode, SweepPlan};
use ivsweep_protocol::Duration as WireDuration;

const POLL: Duration = Duration::from_millis(20);

fn value<T: FromStr>(matches: &ArgMatches, name: &str) -> Option<T> {
    matches.value_of(name).map(|x| match x.parse::<T>() {
        Ok(x) => x,
        Err(_) => {
            println!("Cannot parse `{}` given for --{}.", x, name);
            exit(1);
        }
    })
}

fn load_json<T: serde::de::DeserializeOwned>(path: &str) -> T {
    let ret = File::open(path)
        .map_err(|err| err.to_string())
        .and_then(|f| serde_json::from_reader(f).map_err(|err| err.to_string()));
    match ret {
        Ok(x) => x,
        Err(err) => {
            println!("Cannot load `{}`: {}", path, err);
            exit(1);
        }
    }
}

fn print_event(event: &Event, json: bool) {
    if json {
        match serde_json::to_string(event) {
            Ok(x) => println!("{}", x),
            Err(err) => log::error!("Cannot serialize event: {}", err),
        }
        return;
    }
    match event {
        Event::Progress(x) => println!("Progress: {:.0} %", x),
        Event::SweepComplete { aborted } => {
            println!("Sweep {}", if *aborted { "aborted" } else { "complete" })
        }
        Event::ConnectionStatus { status, message } => println!("Connection {:?}: {}", status, message),
        Event::MeasurementCount(n) => println!("Requested {} measurements", n),
        Event::MaxPowerPoint { source, level, power } => {
            println!("Maximum power {:.3} mW at {:.4} {}", power * 1e3, level, source.unit())
        }
        Event::ProcessingComplete { location, report } => {
            if let Some(x) = location {
                println!("Saved to {}", x.display());
            }
            for (k, v) in report {
                println!("  {:<20} {}", k, v);
            }
        }
        Event::Status(x) => println!("{}", x),
    }
}

/// Apply console commands until the started sweeps are done, then disconnect.
fn drive(mut controller: Controller, commands: Receiver<ConsoleCommand>) -> ivsweep::Result<()> {
    let mut started = false;
    loop {
        match commands.recv_timeout(POLL) {
            Ok(cmd) => {
                started |= cmd == ConsoleCommand::StartSweep;
                controller.handle(cmd)?;
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        let sweeping = controller.session().map(|x| x.is_sweeping()).unwrap_or(false);
        if started && !sweeping {
            break;
        }
    }
    if let Some(session) = controller.session_mut() {
        session.wait()?;
    }
    controller.handle(ConsoleCommand::Disconnect)
}

fn main() {
    let matches = ClapApp::new("IV sweep")
        .author(crate_authors!())
        .version(crate_version!())
        .about("Sweep a sourcemeter while sampling as fast as the instrument allows")
        .arg(
            Arg::new("address")
                .index(1)
                .default_value("sim::")
                .help("Instrument address, `tcp::<host>:<port>` or `sim::[<latency-ms>]`"),
        )
        .arg(Arg::new("config").long("config").takes_value(true).help("Session configuration as JSON"))
        .arg(
            Arg::new("plan")
                .long("plan")
                .takes_value(true)
                .help("Sweep plan as JSON, replaces start, end, points and dwell"),
        )
        .arg(
            Arg::new("source")
                .long("source")
                .takes_value(true)
                .possible_values(["voltage", "current"])
                .default_value("voltage"),
        )
        .arg(
            Arg::new("mode")
                .long("mode")
                .takes_value(true)
                .possible_values(["timed", "hardware", "mpp"])
                .help("Step and poll (timed), let the instrument sweep (hardware) or track maximum power (mpp)"),
        )
        .arg(Arg::new("start").long("start").takes_value(true).default_value("0").help("Start value in mV or mA"))
        .arg(Arg::new("end").long("end").takes_value(true).default_value("1000").help("End value in mV or mA"))
        .arg(Arg::new("points").long("points").takes_value(true).default_value("101"))
        .arg(
            Arg::new("dwell")
                .long("dwell")
                .takes_value(true)
                .default_value("20")
                .help("Time per setpoint in ms"),
        )
        .arg(Arg::new("area").long("area").takes_value(true).help("Device area in cm^2"))
        .arg(
            Arg::new("output")
                .long("output")
                .short('o')
                .takes_value(true)
                .default_value("iv")
                .help("Files are named <output>_<unix time>.csv"),
        )
        .arg(Arg::new("time-series").long("time-series").short('t').help("Also save time and status"))
        .arg(
            Arg::new("sweeps")
                .long("sweeps")
                .takes_value(true)
                .help("Number of consecutive sweeps, 0 sweeps until interrupted"),
        )
        .arg(Arg::new("recovery").long("recovery").takes_value(true).help("Pause between sweeps in s"))
        .arg(Arg::new("blank").long("blank-display").help("Turn off the display while sweeping"))
        .arg(Arg::new("output-on").long("output-on").help("Enable the source output after setup"))
        .arg(
            Arg::new("toggle-shutter")
                .long("toggle-shutter")
                .help("Toggle the shutter on the TTL port before sweeping"),
        )
        .arg(
            Arg::new("set")
                .long("set")
                .short('s')
                .takes_value(true)
                .multiple_occurrences(true)
                .help("Instrument parameter as <name>=<value>, e.g. speed=normal"),
        )
        .arg(Arg::new("json").long("json").help("Print events as JSON lines"))
        .arg(Arg::new("verbose").long("verbose").short('v').help("Log verbose output"))
        .get_matches();

    if matches.is_present("verbose") {
        env_logger::Builder::from_env(Env::default().default_filter_or("ivsweep=debug")).init();
    } else {
        env_logger::init();
    }

    let mut config: SessionConfig = matches.value_of("config").map(load_json::<SessionConfig>).unwrap_or_default();
    if let Some(area) = value(&matches, "area") {
        config.metadata.area = area;
    }
    if matches.is_present("time-series") {
        config.metadata.save_time_series = true;
    }
    if let Some(sweeps) = value(&matches, "sweeps") {
        config.continual.sweeps = sweeps;
    }
    if let Some(recovery) = value::<f64>(&matches, "recovery") {
        config.continual.recovery = WireDuration::from_secs_f64(recovery);
    }
    if matches.is_present("blank") {
        config.blank_display = true;
    }
    if matches.is_present("output-on") {
        config.settings.output = true;
    }

    let plan: SweepPlan = match matches.value_of("plan") {
        Some(path) => load_json(path),
        None => {
            let source = match matches.value_of("source") {
                Some("current") => SourceFunction::Current,
                _ => SourceFunction::Voltage,
            };
            let start: f64 = value(&matches, "start").unwrap_or(0.0);
            let end: f64 = value(&matches, "end").unwrap_or(1000.0);
            let points = value(&matches, "points").unwrap_or(101);
            let dwell = value(&matches, "dwell").unwrap_or(20);
            SweepPlan::linear(start / 1000.0, end / 1000.0, points, WireDuration::from_millis(dwell), source)
        }
    };
    config.settings.source = plan.source;
    if let Some(first) = plan.first() {
        config.settings.level = first;
    }

    let mut parameters = Vec::new();
    for x in matches.values_of("set").into_iter().flatten() {
        let ret = match x.split_once('=') {
            Some((name, value)) => Parameter::parse(name, value),
            None => Parameter::parse(x, ""),
        };
        match ret {
            Ok(param) => parameters.push(ConsoleCommand::SetParameter(param)),
            Err(err) => {
                println!("{}", err);
                exit(1);
            }
        }
    }

    let mode = matches.value_of("mode").map(|x| match SweepMode::parse(x) {
        Ok(x) => x,
        Err(err) => {
            println!("{}", err);
            exit(1);
        }
    });

    let address = matches.value_of("address").unwrap_or("sim::").to_string();
    let output = PathBuf::from(matches.value_of("output").unwrap_or("iv"));
    let json = matches.is_present("json");

    let (events_tx, events_rx) = event_channel();
    let controller = Controller::new(config, Arc::new(CsvSink::new(output)), events_tx);
    let (cmd_tx, cmd_rx) = channel::unbounded();
    let mut script = vec![ConsoleCommand::Connect { address }];
    script.extend(mode.map(ConsoleCommand::SetMode));
    if matches.is_present("toggle-shutter") {
        script.push(ConsoleCommand::ToggleShutter);
    }
    script.extend(parameters);
    script.push(ConsoleCommand::UpdateSweepPlan(plan));
    script.push(ConsoleCommand::StartSweep);
    for cmd in script {
        // the receiver is alive until drive() returns
        let _ = cmd_tx.send(cmd);
    }

    let rt = match Runtime::new() {
        Ok(x) => x,
        Err(err) => {
            println!("Cannot start runtime: {}", err);
            exit(1);
        }
    };
    let ret = rt.block_on(async move {
        let mut events: EventReceiver = events_rx;
        let mut driver = tokio::task::spawn_blocking(move || drive(controller, cmd_rx));
        let ret = loop {
            tokio::select! {
                ret = &mut driver => break ret,
                Some(event) = events.recv() => print_event(&event, json),
                _ = tokio::signal::ctrl_c() => {
                    log::info!("Interrupted, aborting sweep");
                    let _ = cmd_tx.send(ConsoleCommand::AbortSweep);
                }
            }
        };
        for event in events.drain() {
            print_event(&event, json);
        }
        ret
    });
    match ret {
        Ok(Ok(())) => log::debug!("Application quitting."),
        Ok(Err(err)) => {
            println!("Error: {}", err);
            exit(1);
        }
        Err(err) => {
            println!("Sweep driver failed: {}", err);
            exit(1);
        }
    }
}
