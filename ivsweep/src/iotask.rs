//! The instrument worker: sole owner of the instrument connection.
//!
//! It drains the command queue in arrival order on a dedicated thread and pushes every
//! non-empty result onto the result queue. Failing operations produce no result at all,
//! producers never hear about them. They are counted in [`WorkerStats`] and logged.

use std::thread::{self, JoinHandle};

use anyhow::anyhow;

use crate::channel::{CommandReceiver, ResultSender};
use crate::instrument::Instrument;
use crate::{Error, Operation, Response};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub executed: usize,
    pub failed: usize,
    pub forwarded: usize,
}

pub struct InstrumentWorker {
    handle: JoinHandle<WorkerStats>,
}

impl InstrumentWorker {
    pub fn spawn<T: Instrument + 'static>(instr: T, commands: CommandReceiver, results: ResultSender) -> Self {
        let handle = thread::spawn(move || run(instr, commands, results));
        Self { handle }
    }

    /// Wait for the worker to exit. Only returns after the stop sentinel was dequeued.
    pub fn join(self) -> crate::Result<WorkerStats> {
        self.handle
            .join()
            .map_err(|_| Error::internal(anyhow!("Instrument worker panicked")))
    }
}

fn run<T: Instrument>(mut instr: T, mut commands: CommandReceiver, results: ResultSender) -> WorkerStats {
    let mut stats = WorkerStats::default();
    while let Some(op) = commands.dequeue() {
        stats.executed += 1;
        match execute(&mut instr, &op) {
            Ok(Some(resp)) => {
                if results.push(resp).is_ok() {
                    stats.forwarded += 1;
                } else {
                    log::debug!("Result channel closed, dropping result of {}", op);
                }
            }
            Ok(None) => {}
            Err(err) => {
                stats.failed += 1;
                log::warn!("{} failed: {}", op, err);
            }
        }
    }
    if let Err(err) = instr.close() {
        log::warn!("Closing instrument failed: {}", err);
    }
    log::debug!(
        "Instrument worker closed properly: {} executed, {} failed, {} results",
        stats.executed,
        stats.failed,
        stats.forwarded
    );
    stats
}

/// Run one operation. `Ok(None)` means the operation succeeded but there is nothing to report.
pub fn execute<T: Instrument + ?Sized>(instr: &mut T, op: &Operation) -> crate::Result<Option<Response>> {
    let ret = match op {
        Operation::Write(cmd) => {
            instr.write(cmd)?;
            None
        }
        Operation::Query(cmd) => Some(Response::Text(instr.query(cmd)?)),
        Operation::ReadRaw => Some(Response::binary(instr.read_raw()?)),
        Operation::Read => Some(Response::binary(instr.read()?)),
        Operation::ReadBuffer(records) => Some(Response::binary(instr.read_buffer(*records)?)),
        Operation::Clear => {
            instr.clear()?;
            None
        }
    };
    Ok(ret.filter(|x| !x.is_empty()))
}
