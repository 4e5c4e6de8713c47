//! Persistence of sample batches.

use std::fs;
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::{Error, RawSample};

const MAX_COLLISIONS: u32 = 1000;

/// What is written into the header block next to the samples.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Metadata {
    /// Device area in cm^2
    pub area: f64,
    /// Keep time and status columns
    pub save_time_series: bool,
    pub sweep_up: bool,
}

impl Default for Metadata {
    fn default() -> Self {
        Self {
            area: 1.0,
            save_time_series: false,
            sweep_up: true,
        }
    }
}

pub trait Sink: Send + Sync {
    /// Store one batch and return where it went.
    fn store(&self, samples: &[RawSample], meta: &Metadata) -> crate::Result<PathBuf>;
}

/// Writes comma separated files named `<base>_<unix seconds>.csv`.
///
/// Existing files are never replaced. A batch stored within the same second as an earlier one
/// goes to `<base>_<unix seconds>_<n>.csv`.
///
/// The file is written to a temporary file next to the destination first and moved in place
/// once complete, so a crash never leaves a truncated data file behind.
pub struct CsvSink {
    base: PathBuf,
}

impl CsvSink {
    pub fn new<P: Into<PathBuf>>(base: P) -> Self {
        Self { base: base.into() }
    }

    fn destination(&self, stamp: u64, n: u32) -> PathBuf {
        let mut name = self.base.file_name().map(|x| x.to_os_string()).unwrap_or_default();
        if n == 0 {
            name.push(format!("_{}.csv", stamp));
        } else {
            name.push(format!("_{}_{}.csv", stamp, n));
        }
        self.base.with_file_name(name)
    }

    fn directory(&self) -> &Path {
        match self.base.parent() {
            Some(x) if !x.as_os_str().is_empty() => x,
            _ => Path::new("."),
        }
    }
}

/// Scientific notation with 18 fractional digits and a signed two digit exponent.
pub fn format_value(x: f64) -> String {
    let formatted = format!("{:.18e}", x);
    match formatted.split_once('e') {
        Some((mantissa, exp)) => {
            let exp: i32 = exp.parse().unwrap_or(0);
            let sign = if exp < 0 { '-' } else { '+' };
            format!("{}e{}{:02}", mantissa, sign, exp.abs())
        }
        // inf and NaN
        None => formatted,
    }
}

pub fn write_csv<W: Write>(mut w: W, samples: &[RawSample], meta: &Metadata) -> std::io::Result<()> {
    writeln!(w, "# Area = {} [cm^2]", meta.area)?;
    writeln!(w, "# I&V vs t = {}", meta.save_time_series as u8)?;
    writeln!(w, "# sweepUp = {}", meta.sweep_up as u8)?;
    if meta.save_time_series {
        writeln!(w, "# Voltage [V],Current [A],Time[s],Status")?;
    } else {
        writeln!(w, "# Voltage [V],Current [A]")?;
    }
    for x in samples {
        if meta.save_time_series {
            writeln!(
                w,
                "{},{},{},{}",
                format_value(x.primary),
                format_value(x.secondary),
                format_value(x.timestamp),
                format_value(x.status)
            )?;
        } else {
            writeln!(w, "{},{}", format_value(x.primary), format_value(x.secondary))?;
        }
    }
    w.flush()
}

impl Sink for CsvSink {
    fn store(&self, samples: &[RawSample], meta: &Metadata) -> crate::Result<PathBuf> {
        let dir = self.directory();
        fs::create_dir_all(dir)?;
        let mut tmp = NamedTempFile::new_in(dir)?;
        write_csv(BufWriter::new(tmp.as_file_mut()), samples, meta)?;
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|err| Error::internal(anyhow!(err)))?
            .as_secs();
        let mut n = 0;
        loop {
            let dst = self.destination(stamp, n);
            match tmp.persist_noclobber(&dst) {
                Ok(_) => {
                    log::info!("Stored {} samples in {}", samples.len(), dst.display());
                    return Ok(dst);
                }
                Err(err) if err.error.kind() == ErrorKind::AlreadyExists && n < MAX_COLLISIONS => {
                    tmp = err.file;
                    n += 1;
                }
                Err(err) => return Err(Error::from(err.error)),
            }
        }
    }
}
