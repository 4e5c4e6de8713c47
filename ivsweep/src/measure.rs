//! Keeps a standing buffer of read requests in the command queue while a sweep runs.

use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};

use crate::cancel::CancelToken;
use crate::channel::CommandSender;
use crate::console::EventSender;
use crate::{Error, Event, Operation};
use ivsweep_protocol::Duration as WireDuration;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MeasurementConfig {
    /// Queue depth check period
    pub tick: WireDuration,
    /// Another read is queued whenever the queue holds fewer operations than this
    pub low_water_mark: usize,
}

impl Default for MeasurementConfig {
    fn default() -> Self {
        Self {
            tick: WireDuration::from_millis(1),
            low_water_mark: 5,
        }
    }
}

#[derive(Clone)]
pub struct MeasurementDriver {
    commands: CommandSender,
    events: EventSender,
    config: MeasurementConfig,
    stop: Arc<Mutex<Option<CancelToken>>>,
}

pub struct MeasurementHandle {
    handle: JoinHandle<usize>,
}

impl MeasurementHandle {
    /// Wait for the polling loop to exit and return the number of reads it queued.
    pub fn join(self) -> crate::Result<usize> {
        self.handle
            .join()
            .map_err(|_| Error::internal(anyhow!("Measurement thread panicked")))
    }
}

impl MeasurementDriver {
    pub fn new(commands: CommandSender, events: EventSender, config: MeasurementConfig) -> Self {
        Self {
            commands,
            events,
            config,
            stop: Arc::new(Mutex::new(None)),
        }
    }

    pub fn is_polling(&self) -> bool {
        self.stop.lock().unwrap().is_some()
    }

    pub fn start(&self) -> crate::Result<MeasurementHandle> {
        let token = {
            let mut stop = self.stop.lock().unwrap();
            if stop.is_some() {
                return Err(Error::Busy);
            }
            let token = CancelToken::new();
            *stop = Some(token.clone());
            token
        };
        let driver = self.clone();
        let handle = thread::spawn(move || driver.run(token));
        Ok(MeasurementHandle { handle })
    }

    /// Ask the polling loop to exit. Observed within one tick.
    pub fn time_to_die(&self) {
        if let Some(token) = self.stop.lock().unwrap().as_ref() {
            token.cancel();
        }
    }

    fn run(&self, stop: CancelToken) -> usize {
        let tick: Duration = self.config.tick.into();
        let mut count = 0;
        match self.commands.enqueue(Operation::ReadRaw) {
            Ok(()) => count += 1,
            Err(err) => {
                log::warn!("Cannot request measurements: {}", err);
                stop.cancel();
            }
        }
        while !stop.is_cancelled() {
            thread::sleep(tick);
            if stop.is_cancelled() {
                break;
            }
            if self.commands.size() < self.config.low_water_mark {
                if let Err(err) = self.commands.enqueue(Operation::Read) {
                    log::warn!("Measurement polling stopped: {}", err);
                    break;
                }
                count += 1;
            }
        }
        *self.stop.lock().unwrap() = None;
        log::debug!("Measurement polling done, {} reads requested", count);
        self.events.send(Event::MeasurementCount(count));
        count
    }
}
