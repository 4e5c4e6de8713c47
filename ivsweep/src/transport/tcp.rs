//! SCPI over a plain TCP socket, e.g. a LAN to GPIB bridge in front of the sourcemeter.
//!
//! Blocking on purpose: the instrument worker is a dedicated thread and the instrument only
//! ever has one outstanding operation.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::thread;
use std::time::Duration;

use crate::instrument::{ConnectOptions, Instrument};
use crate::scpi::{self, BlockHeader};
use crate::Error;

const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

pub struct TcpInstrument {
    addr: SocketAddr,
    stream: TcpStream,
    options: ConnectOptions,
    /// bytes received beyond the message handed out last
    buf: Vec<u8>,
}

impl TcpInstrument {
    pub fn connect(addr: SocketAddr, options: ConnectOptions) -> crate::Result<Self> {
        let connection_timeout = options.timeout().unwrap_or(DEFAULT_CONNECTION_TIMEOUT);
        let stream = TcpStream::connect_timeout(&addr, connection_timeout)
            .map_err(|err| Error::connection(format!("Cannot connect to {}: {}", addr, err)))?;
        stream.set_read_timeout(options.timeout())?;
        stream.set_write_timeout(options.timeout())?;
        stream.set_nodelay(true)?;
        Ok(Self {
            addr,
            stream,
            options,
            buf: Vec::new(),
        })
    }

    fn send(&mut self, cmd: &str) -> crate::Result<()> {
        let delay = self.options.delay();
        if delay > Duration::from_secs(0) {
            thread::sleep(delay);
        }
        let mut data = cmd.as_bytes().to_vec();
        data.extend_from_slice(self.options.termination.as_bytes());
        self.stream.write_all(&data)?;
        Ok(())
    }

    fn fill(&mut self) -> crate::Result<()> {
        let mut chunk = vec![0_u8; self.options.chunk_size.max(64)];
        let n = self.stream.read(&mut chunk)?;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "Connection closed by instrument").into());
        }
        self.buf.extend_from_slice(&chunk[..n]);
        Ok(())
    }

    fn take(&mut self, len: usize) -> crate::Result<Vec<u8>> {
        while self.buf.len() < len {
            self.fill()?;
        }
        Ok(self.buf.drain(..len).collect())
    }

    fn read_line(&mut self) -> crate::Result<Vec<u8>> {
        let term = self.options.termination.as_bytes().last().cloned().unwrap_or(b'\n');
        loop {
            if let Some(pos) = self.buf.iter().position(|x| *x == term) {
                return self.take(pos + 1);
            }
            self.fill()?;
        }
    }

    /// Read one message. An indefinite binary block is taken to hold `records` records.
    fn read_message(&mut self, records: usize) -> crate::Result<Vec<u8>> {
        while self.buf.len() < 2 {
            self.fill()?;
        }
        if self.buf[0] != b'#' {
            return self.read_line();
        }
        // binary block, the payload may contain the terminator character
        let header_len = scpi::header_length(&self.buf[..2])?;
        while self.buf.len() < header_len {
            self.fill()?;
        }
        let len = match scpi::parse_binary_header(&self.buf[..header_len])? {
            BlockHeader::Indefinite => header_len + records * self.options.record_len(),
            BlockHeader::Definite { offset, length } => offset + length,
        };
        let mut ret = self.take(len)?;
        let term_len = self.options.termination.len();
        let term = self.take(term_len)?;
        if term != self.options.termination.as_bytes() {
            return Err(Error::unexpected(format!(
                "Binary block not followed by terminator, got {:?}",
                term
            )));
        }
        ret.extend_from_slice(&term);
        Ok(ret)
    }
}

impl Instrument for TcpInstrument {
    fn write(&mut self, cmd: &str) -> crate::Result<()> {
        self.send(cmd)
    }

    fn query(&mut self, cmd: &str) -> crate::Result<String> {
        self.send(cmd)?;
        let mut ret = self.read_line().map_err(|err| {
            self.buf.clear();
            err
        })?;
        scpi::strip_termination(&mut ret, self.options.termination.as_bytes());
        let ret = String::from_utf8_lossy(&ret);
        Ok(ret.trim_end_matches('\r').to_string())
    }

    fn read_raw(&mut self) -> crate::Result<Vec<u8>> {
        self.read_buffer(1)
    }

    fn read(&mut self) -> crate::Result<Vec<u8>> {
        let mut ret = self.read_raw()?;
        scpi::strip_message_termination(&mut ret, self.options.termination.as_bytes());
        Ok(ret)
    }

    fn read_buffer(&mut self, records: usize) -> crate::Result<Vec<u8>> {
        self.read_message(records).map_err(|err| {
            // whatever is left over belongs to a message we gave up on
            self.buf.clear();
            err
        })
    }

    fn clear(&mut self) -> crate::Result<()> {
        self.buf.clear();
        Ok(())
    }

    fn close(&mut self) -> crate::Result<()> {
        log::debug!("Closing connection to {}", self.addr);
        self.stream.shutdown(std::net::Shutdown::Both)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader};
    use std::net::TcpListener;

    fn serve<F>(handler: F) -> SocketAddr
    where
        F: FnOnce(BufReader<TcpStream>, TcpStream) + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let reader = BufReader::new(stream.try_clone().unwrap());
            handler(reader, stream);
        });
        addr
    }

    fn options() -> ConnectOptions {
        let mut ret = ConnectOptions::default();
        ret.timeout = Some(Duration::from_secs(2).into());
        ret
    }

    #[test]
    fn query_and_write() {
        let addr = serve(|mut reader, mut stream| {
            let mut line = String::new();
            reader.read_line(&mut line).unwrap();
            assert_eq!(line, ":output on\n");
            line.clear();
            reader.read_line(&mut line).unwrap();
            assert_eq!(line, "*idn?\n");
            stream.write_all(b"KEITHLEY INSTRUMENTS INC.,MODEL 2400\r\n").unwrap();
        });
        let mut instr = TcpInstrument::connect(addr, options()).unwrap();
        instr.write(":output on").unwrap();
        assert_eq!(instr.query("*idn?").unwrap(), "KEITHLEY INSTRUMENTS INC.,MODEL 2400");
    }

    #[test]
    fn binary_records_may_contain_newlines() {
        let addr = serve(|_reader, mut stream| {
            let mut first = b"#0".to_vec();
            first.extend_from_slice(&[0x0a; 16]);
            first.push(b'\n');
            let mut second = b"#216".to_vec();
            second.extend_from_slice(&[0x01; 16]);
            second.push(b'\n');
            // both messages in one segment
            first.extend_from_slice(&second);
            stream.write_all(&first).unwrap();
            thread::sleep(Duration::from_millis(100));
        });
        let mut instr = TcpInstrument::connect(addr, options()).unwrap();
        let first = instr.read_raw().unwrap();
        assert_eq!(first.len(), 2 + 16 + 1);
        assert_eq!(&first[2..18], &[0x0a; 16]);
        let second = instr.read().unwrap();
        // blocks keep their terminator, the payload could end in the same byte
        assert_eq!(second.len(), 4 + 16 + 1);
        assert_eq!(&second[..4], b"#216");
    }

    #[test]
    fn buffer_of_indefinite_records() {
        let addr = serve(|mut reader, mut stream| {
            let mut line = String::new();
            reader.read_line(&mut line).unwrap();
            let mut msg = b"#0".to_vec();
            msg.extend_from_slice(&[0x0a; 3 * 16]);
            msg.push(b'\n');
            stream.write_all(&msg).unwrap();
            stream.write_all(b"1\n").unwrap();
            thread::sleep(Duration::from_millis(100));
        });
        let mut instr = TcpInstrument::connect(addr, options()).unwrap();
        instr.write(":source:voltage:mode sweep").unwrap();
        let data = instr.read_buffer(3).unwrap();
        assert_eq!(data.len(), 2 + 3 * 16 + 1);
        assert_eq!(instr.read().unwrap(), b"1");
    }

    #[test]
    fn read_times_out() {
        let addr = serve(|_reader, _stream| {
            thread::sleep(Duration::from_millis(500));
        });
        let mut opts = options();
        opts.timeout = Some(Duration::from_millis(50).into());
        let mut instr = TcpInstrument::connect(addr, opts).unwrap();
        let err = instr.read_raw().unwrap_err();
        assert!(err.is_timeout());
    }

    #[test]
    fn connection_refused_is_a_connection_error() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let ret = TcpInstrument::connect(addr, options());
        assert!(matches!(ret, Err(Error::Connection(_))));
    }
}
