//! Consumer side of the result queue: turns raw measurement records into a sorted sample batch.

use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

use crate::channel::ResultReceiver;
use crate::instrument::TransferFormat;
use crate::scpi::{self, BlockHeader};
use crate::{Error, RawSample};
use ivsweep_protocol::Duration as WireDuration;

/// Framing bytes in front of every record, e.g. `#0`.
pub const HEADER_LEN: usize = 2;
pub const RECORD_LEN: usize = HEADER_LEN + 16;

/// Payload size of one record.
const VALUES_LEN: usize = RECORD_LEN - HEADER_LEN;

fn decode_values(payload: &[u8], format: TransferFormat) -> RawSample {
    let mut values = [0_f32; 4];
    match format {
        TransferFormat::Real32BigEndian => BigEndian::read_f32_into(payload, &mut values),
        TransferFormat::Real32LittleEndian => LittleEndian::read_f32_into(payload, &mut values),
    }
    RawSample {
        timestamp: values[0] as f64,
        primary: values[1] as f64,
        secondary: values[2] as f64,
        status: values[3] as f64,
    }
}

/// Decode one measurement record laid out as `[timestamp, primary, secondary, status]`.
pub fn decode(raw: &[u8], format: TransferFormat) -> crate::Result<RawSample> {
    if raw.len() < RECORD_LEN {
        return Err(Error::decode(format!(
            "Measurement record too short: {} bytes, expected {}",
            raw.len(),
            RECORD_LEN
        )));
    }
    Ok(decode_values(&raw[HEADER_LEN..RECORD_LEN], format))
}

/// Decode a binary block holding any number of records back to back.
///
/// Bytes after the last complete record, such as the message terminator, are ignored.
pub fn decode_buffer(raw: &[u8], format: TransferFormat) -> crate::Result<Vec<RawSample>> {
    let payload = match scpi::parse_binary_header(raw)? {
        BlockHeader::Indefinite => &raw[HEADER_LEN..],
        BlockHeader::Definite { offset, length } => {
            if raw.len() < offset + length {
                return Err(Error::decode(format!(
                    "Buffer announces {} bytes but holds {}",
                    length,
                    raw.len() - offset
                )));
            }
            &raw[offset..offset + length]
        }
    };
    Ok(payload
        .chunks_exact(VALUES_LEN)
        .map(|x| decode_values(x, format))
        .collect())
}

/// Sort `samples` into a batch, or `None` if there are fewer than `min_samples`.
pub fn viable(mut samples: Vec<RawSample>, min_samples: usize) -> Option<Vec<RawSample>> {
    if samples.len() < min_samples {
        log::info!("Discarding batch of {} samples", samples.len());
        return None;
    }
    sort_by_timestamp(&mut samples);
    Some(samples)
}

pub fn sort_by_timestamp(samples: &mut Vec<RawSample>) {
    samples.sort_by(|a, b| a.timestamp.partial_cmp(&b.timestamp).unwrap_or(CmpOrdering::Equal));
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectMode {
    /// The number of results is known once the measurement driver stopped.
    FixedCount,
    /// Acquisition with an unbounded point count until a target is supplied.
    Streaming,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    pub mode: CollectMode,
    /// Batches with fewer samples are discarded
    pub min_samples: usize,
    /// Give up waiting for the remaining results after this long without any result.
    /// Results of failed reads never show up. `None` waits forever.
    pub idle_timeout: Option<WireDuration>,
    /// How often the streaming collector re-checks its target
    pub poll: WireDuration,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            mode: CollectMode::Streaming,
            min_samples: 3,
            idle_timeout: Some(Duration::from_secs(10).into()),
            poll: Duration::from_millis(10).into(),
        }
    }
}

/// Number of results a streaming collection stops at, supplied while it is already running.
#[derive(Clone, Debug)]
pub struct CollectTarget {
    points: Arc<AtomicUsize>,
}

impl Default for CollectTarget {
    fn default() -> Self {
        Self {
            points: Arc::new(AtomicUsize::new(usize::MAX)),
        }
    }
}

impl CollectTarget {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update_points(&self, n: usize) {
        self.points.store(n, Ordering::SeqCst);
    }

    pub fn get(&self) -> Option<usize> {
        match self.points.load(Ordering::SeqCst) {
            usize::MAX => None,
            n => Some(n),
        }
    }
}

pub struct SampleCollector {
    results: ResultReceiver,
    format: TransferFormat,
    config: CollectorConfig,
}

impl SampleCollector {
    pub fn new(results: ResultReceiver, format: TransferFormat, config: CollectorConfig) -> Self {
        Self { results, format, config }
    }

    fn idle_timeout(&self) -> Option<Duration> {
        self.config.idle_timeout.map(Into::into)
    }

    /// Pull exactly `n` results. Returns `None` if too few samples survive decoding.
    pub fn collect_fixed(&self, n: usize) -> Option<Vec<RawSample>> {
        let mut samples = Vec::with_capacity(n);
        for k in 0..n {
            let ret = match self.idle_timeout() {
                Some(timeout) => self.results.recv_timeout(timeout),
                None => self.results.recv(),
            };
            match ret {
                Ok(resp) => self.push_decoded(&mut samples, resp.as_bytes()),
                Err(err) => {
                    log::warn!("Stopped collecting after {} of {} results: {}", k, n, err);
                    break;
                }
            }
        }
        self.finish(samples)
    }

    /// Pull results until `target` is known and reached.
    pub fn collect_streaming(&self, target: &CollectTarget) -> Option<Vec<RawSample>> {
        let poll: Duration = self.config.poll.into();
        let mut samples = Vec::new();
        let mut received = 0;
        let mut last = Instant::now();
        loop {
            let goal = target.get();
            if let Some(goal) = goal {
                if received >= goal {
                    break;
                }
            }
            match self.results.recv_timeout(poll) {
                Ok(resp) => {
                    received += 1;
                    last = Instant::now();
                    self.push_decoded(&mut samples, resp.as_bytes());
                }
                Err(Error::Disconnected) => {
                    log::warn!("Result queue closed after {} results", received);
                    break;
                }
                Err(_) => {
                    // only give up once nothing else is going to be requested
                    if let (Some(goal), Some(timeout)) = (goal, self.idle_timeout()) {
                        if last.elapsed() > timeout {
                            log::warn!("Gave up waiting for results: got {} of {}", received, goal);
                            break;
                        }
                    }
                }
            }
        }
        self.finish(samples)
    }

    fn push_decoded(&self, samples: &mut Vec<RawSample>, raw: &[u8]) {
        match decode(raw, self.format) {
            Ok(sample) => samples.push(sample),
            Err(err) => log::warn!("Dropping sample: {}", err),
        }
    }

    fn finish(&self, samples: Vec<RawSample>) -> Option<Vec<RawSample>> {
        viable(samples, self.config.min_samples)
    }
}
