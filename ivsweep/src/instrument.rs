use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::address::Address;
use crate::scpi;
use crate::transport::sim::Simulator;
use crate::transport::tcp::TcpInstrument;
use crate::Error;
use ivsweep_protocol::Duration as WireDuration;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
/// Large enough to move a full 2500 point sample buffer in one transfer.
const DEFAULT_CHUNK_SIZE: usize = 102400;
const DEFAULT_ELEMENTS: usize = 4;

/// Byte layout of binary measurement records.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferFormat {
    Real32BigEndian,
    Real32LittleEndian,
}

impl TransferFormat {
    /// Commands switching the instrument to this format.
    pub fn commands(&self) -> [&'static str; 2] {
        match self {
            TransferFormat::Real32BigEndian => [":format:data sreal", ":format:border normal"],
            TransferFormat::Real32LittleEndian => [":format:data sreal", ":format:border swapped"],
        }
    }
}

impl Default for TransferFormat {
    fn default() -> Self {
        TransferFormat::Real32BigEndian
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectOptions {
    /// I/O timeout per call, `None` waits forever
    pub timeout: Option<WireDuration>,
    pub chunk_size: usize,
    /// Pause before each command goes out on the wire
    pub delay: WireDuration,
    pub format: TransferFormat,
    /// Number of values per measurement record, must match `:format:elements`
    pub elements: usize,
    pub termination: String,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            timeout: Some(DEFAULT_TIMEOUT.into()),
            chunk_size: DEFAULT_CHUNK_SIZE,
            delay: Duration::from_secs(0).into(),
            format: TransferFormat::default(),
            elements: DEFAULT_ELEMENTS,
            termination: "\n".to_string(),
        }
    }
}

impl ConnectOptions {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout.map(Into::into)
    }

    pub fn delay(&self) -> Duration {
        self.delay.into()
    }

    /// Size of the payload of one binary measurement record.
    pub fn record_len(&self) -> usize {
        self.elements * 4
    }
}

/// The capability of talking to one instrument.
///
/// Implementations are driven by exactly one thread at a time, the instrument worker. Every call
/// may fail and failures are per-call: the connection must stay usable afterwards if at all
/// possible.
pub trait Instrument: Send {
    fn write(&mut self, cmd: &str) -> crate::Result<()>;

    fn query(&mut self, cmd: &str) -> crate::Result<String>;

    /// Read one complete message, exactly as it came from the instrument.
    fn read_raw(&mut self) -> crate::Result<Vec<u8>>;

    /// Read one message with the message terminator removed. Binary blocks are returned as
    /// read.
    fn read(&mut self) -> crate::Result<Vec<u8>> {
        let mut ret = self.read_raw()?;
        scpi::strip_message_termination(&mut ret, scpi::DEFAULT_TERMINATION);
        Ok(ret)
    }

    /// Read one message carrying `records` measurement records, i.e. the buffer filled by a
    /// sweep the instrument ran on its own.
    fn read_buffer(&mut self, _records: usize) -> crate::Result<Vec<u8>> {
        self.read_raw()
    }

    /// Device clear.
    fn clear(&mut self) -> crate::Result<()> {
        Err(Error::NotSupported)
    }

    fn close(&mut self) -> crate::Result<()> {
        Ok(())
    }
}

impl<T: Instrument + ?Sized> Instrument for Box<T> {
    fn write(&mut self, cmd: &str) -> crate::Result<()> {
        (**self).write(cmd)
    }

    fn query(&mut self, cmd: &str) -> crate::Result<String> {
        (**self).query(cmd)
    }

    fn read_raw(&mut self) -> crate::Result<Vec<u8>> {
        (**self).read_raw()
    }

    fn read(&mut self) -> crate::Result<Vec<u8>> {
        (**self).read()
    }

    fn read_buffer(&mut self, records: usize) -> crate::Result<Vec<u8>> {
        (**self).read_buffer(records)
    }

    fn clear(&mut self) -> crate::Result<()> {
        (**self).clear()
    }

    fn close(&mut self) -> crate::Result<()> {
        (**self).close()
    }
}

/// Open a connection to the instrument behind `addr`.
pub fn connect(addr: &Address, options: &ConnectOptions) -> crate::Result<Box<dyn Instrument>> {
    log::debug!("Connecting to {}", addr);
    let ret: Box<dyn Instrument> = match addr {
        Address::Tcp { addr } => Box::new(TcpInstrument::connect(*addr, options.clone())?),
        Address::Sim { latency } => Box::new(Simulator::new(*latency, options.clone())),
    };
    Ok(ret)
}
