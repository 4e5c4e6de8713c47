//! Statistics, analysis and persistence of a completed sample batch.

use std::sync::Arc;

use crate::analyzer::Analyzer;
use crate::console::EventSender;
use crate::sink::{Metadata, Sink};
use crate::{Event, RawSample};
use ivsweep_protocol::{Report, ReportValue};

pub const FIT_NOTE: &str = "fit_note";

/// Sample count, raw peak power and timing jitter of a batch sorted by timestamp.
pub fn statistics(samples: &[RawSample]) -> Report {
    let mut ret = Report::new();
    let mut put = |k: &str, v: f64| {
        ret.insert(k.to_string(), ReportValue::Number(v));
    };
    put("00_nSamples", samples.len() as f64);
    let pmax = samples.iter().map(RawSample::power).fold(f64::NEG_INFINITY, f64::max);
    if pmax.is_finite() {
        put("01_pMaxRaw[mW]", pmax * 1000.0);
    }
    let diffs: Vec<f64> = samples.windows(2).map(|w| w[1].timestamp - w[0].timestamp).collect();
    if diffs.is_empty() {
        return ret;
    }
    let mean = diffs.iter().sum::<f64>() / diffs.len() as f64;
    let max = diffs.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let min = diffs.iter().cloned().fold(f64::INFINITY, f64::min);
    put("02_worstSpeed[Hz]", 1.0 / max);
    put("03_worstSpeed[ms]", max * 1000.0);
    put("04_bestSpeed[Hz]", 1.0 / min);
    put("05_bestSpeed[ms]", min * 1000.0);
    put("06_meanSpeed[Hz]", 1.0 / mean);
    put("07_meanSpeed[ms]", mean * 1000.0);
    ret
}

#[derive(Clone)]
pub struct PostProcessor {
    sink: Arc<dyn Sink>,
    analyzer: Option<Arc<dyn Analyzer>>,
    events: EventSender,
}

impl PostProcessor {
    pub fn new(sink: Arc<dyn Sink>, events: EventSender) -> Self {
        Self {
            sink,
            analyzer: None,
            events,
        }
    }

    pub fn with_analyzer(mut self, analyzer: Arc<dyn Analyzer>) -> Self {
        self.analyzer = Some(analyzer);
        self
    }

    /// Consume `batch`: derive the parameter set, store the samples and report both.
    pub fn process(&self, batch: Vec<RawSample>, meta: &Metadata) -> Report {
        let mut report = statistics(&batch);
        if let Some(analyzer) = &self.analyzer {
            match analyzer.fit(&batch) {
                Ok(params) => report.extend(params),
                Err(err) => {
                    log::info!("Curve analysis failed: {}", err);
                    report.insert(FIT_NOTE.to_string(), ReportValue::Note(err.to_string()));
                }
            }
        }
        let location = match self.sink.store(&batch, meta) {
            Ok(x) => Some(x),
            Err(err) => {
                log::warn!("Storing {} samples failed: {}", batch.len(), err);
                self.events.status(format!("Saving data failed: {}", err));
                None
            }
        };
        self.events.send(Event::ProcessingComplete {
            location,
            report: report.clone(),
        });
        report
    }
}
