/// This module implements some base types and functions to interact with SCPI-based instruments
use crate::{Error, ProtocolError};

fn invalid_header() -> Error {
    Error::protocol(ProtocolError::InvalidBinaryHeader)
}

/// Layout of an IEEE 488.2 binary block as announced by its header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockHeader {
    /// `#0` followed by data up to the message terminator
    Indefinite,
    /// `#<n><len>`: the payload starts at `offset` and is `length` bytes long
    Definite { offset: usize, length: usize },
}

/// Number of header bytes needed before the block layout is known, given the first two bytes.
pub fn header_length(prefix: &[u8]) -> crate::Result<usize> {
    if prefix.len() < 2 || prefix[0] != b'#' {
        return Err(invalid_header());
    }
    let digits = (prefix[1] as char).to_digit(10).ok_or_else(invalid_header)? as usize;
    Ok(2 + digits)
}

/// Parse the header of a binary block starting at `rx[0]`.
pub fn parse_binary_header(rx: &[u8]) -> crate::Result<BlockHeader> {
    let offset = header_length(rx)?;
    if offset == 2 {
        return Ok(BlockHeader::Indefinite);
    }
    if offset > rx.len() {
        return Err(invalid_header());
    }
    let length = std::str::from_utf8(&rx[2..offset])
        .map_err(|_| invalid_header())?
        .parse::<usize>()
        .map_err(|_| invalid_header())?;
    Ok(BlockHeader::Definite { offset, length })
}

pub const DEFAULT_TERMINATION: &[u8] = b"\n";

/// Remove one trailing `term` if present.
pub fn strip_termination(data: &mut Vec<u8>, term: &[u8]) {
    if !term.is_empty() && data.ends_with(term) {
        data.truncate(data.len() - term.len());
    }
}

/// Like [`strip_termination`] but leaves binary blocks alone: their payload may end in bytes
/// that look like a terminator.
pub fn strip_message_termination(data: &mut Vec<u8>, term: &[u8]) {
    if data.first() != Some(&b'#') {
        strip_termination(data, term);
    }
}
