//! Test doubles shared by the unit tests of this crate.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use byteorder::{BigEndian, WriteBytesExt};

use crate::instrument::Instrument;
use crate::{Error, RawSample};

#[derive(Clone, Debug, PartialEq)]
pub enum Call {
    Write(String),
    Query(String),
    ReadRaw,
    ReadBuffer(usize),
    Clear,
}

#[derive(Default)]
struct Shared {
    calls: Mutex<Vec<(usize, Call)>>,
    sequence: AtomicUsize,
    busy: AtomicBool,
    overlapped: AtomicBool,
    closed: AtomicBool,
}

/// Handle to inspect what a [`RecordingInstrument`] saw, usable after the instrument moved
/// into a worker.
#[derive(Clone, Default)]
pub struct CallLog {
    inner: Arc<Shared>,
}

impl CallLog {
    pub fn calls(&self) -> Vec<Call> {
        self.sequenced().into_iter().map(|(_, call)| call).collect()
    }

    /// Calls together with the global sequence number assigned at execution time.
    pub fn sequenced(&self) -> Vec<(usize, Call)> {
        self.inner.calls.lock().unwrap().clone()
    }

    pub fn writes(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|x| match x {
                Call::Write(cmd) => Some(cmd),
                _ => None,
            })
            .collect()
    }

    /// Whether two calls were ever executing at the same time.
    pub fn overlapped(&self) -> bool {
        self.inner.overlapped.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

pub fn encode_record(sample: &RawSample) -> Vec<u8> {
    encode_buffer(std::slice::from_ref(sample))
}

/// Records back to back behind a single indefinite block header.
pub fn encode_buffer(samples: &[RawSample]) -> Vec<u8> {
    let mut ret = b"#0".to_vec();
    for sample in samples {
        for x in &[sample.timestamp, sample.primary, sample.secondary, sample.status] {
            ret.write_f32::<BigEndian>(*x as f32).unwrap();
        }
    }
    ret
}

/// Instrument double that records every call, asserts it is never re-entered and answers
/// reads with synthetic measurement records.
pub struct RecordingInstrument {
    log: CallLog,
    replies: HashMap<String, String>,
    failing: Vec<String>,
    delay: Duration,
    reads: usize,
}

impl RecordingInstrument {
    pub fn new() -> (Self, CallLog) {
        let log = CallLog::default();
        let ret = Self {
            log: log.clone(),
            replies: HashMap::new(),
            failing: Vec::new(),
            delay: Duration::from_millis(0),
            reads: 0,
        };
        (ret, log)
    }

    pub fn set_reply(&mut self, cmd: &str, reply: &str) {
        self.replies.insert(cmd.to_string(), reply.to_string());
    }

    pub fn fail_on(&mut self, cmd: &str) {
        self.failing.push(cmd.to_string());
    }

    pub fn set_delay(&mut self, delay: Duration) {
        self.delay = delay;
    }

    fn next_sample(&mut self) -> RawSample {
        self.reads += 1;
        let t = self.reads as f64 * 0.01;
        RawSample {
            timestamp: t,
            primary: t,
            secondary: -t,
            status: 0.0,
        }
    }

    fn enter(&self, call: Call) -> crate::Result<()> {
        let shared = &self.log.inner;
        if shared.busy.swap(true, Ordering::SeqCst) {
            shared.overlapped.store(true, Ordering::SeqCst);
        }
        let seq = shared.sequence.fetch_add(1, Ordering::SeqCst);
        let failing = match &call {
            Call::Write(cmd) | Call::Query(cmd) => self.failing.contains(cmd),
            _ => false,
        };
        shared.calls.lock().unwrap().push((seq, call));
        if self.delay > Duration::from_millis(0) {
            thread::sleep(self.delay);
        }
        shared.busy.store(false, Ordering::SeqCst);
        if failing {
            Err(Error::protocol_timeout())
        } else {
            Ok(())
        }
    }
}

impl Instrument for RecordingInstrument {
    fn write(&mut self, cmd: &str) -> crate::Result<()> {
        self.enter(Call::Write(cmd.to_string()))
    }

    fn query(&mut self, cmd: &str) -> crate::Result<String> {
        self.enter(Call::Query(cmd.to_string()))?;
        Ok(self.replies.get(cmd).cloned().unwrap_or_else(|| cmd.to_string()))
    }

    fn read_raw(&mut self) -> crate::Result<Vec<u8>> {
        self.enter(Call::ReadRaw)?;
        Ok(encode_record(&self.next_sample()))
    }

    fn read_buffer(&mut self, records: usize) -> crate::Result<Vec<u8>> {
        self.enter(Call::ReadBuffer(records))?;
        let samples: Vec<_> = (0..records).map(|_| self.next_sample()).collect();
        Ok(encode_buffer(&samples))
    }

    fn clear(&mut self) -> crate::Result<()> {
        self.enter(Call::Clear)?;
        Err(Error::NotSupported)
    }

    fn close(&mut self) -> crate::Result<()> {
        self.log.inner.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
