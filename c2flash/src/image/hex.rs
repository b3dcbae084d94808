//! Intel-HEX-style firmware images.
//!
//! One record per line, all fields fixed-width hexadecimal without
//! delimiters:
//!
//! ```text
//! :CCAAAATTDD..DDSS
//!  |  |   | |     +-- checksum (not validated)
//!  |  |   | +-------- CC data bytes
//!  |  |   +---------- record type
//!  |  +-------------- 16-bit address, big-endian
//!  +----------------- byte count
//! ```
//!
//! Parsing is lazy and restartable: [`records`] borrows the source text and
//! can be called again to re-derive the same sequence. A malformed line is
//! yielded as a [`LineError`] and parsing continues with the next line.
//!
//! The trailing checksum is ignored. Memory dumps produced by
//! [`format_record_line`] carry a plain additive sum rather than the Intel
//! two's complement, and they must parse back.

use std::fmt::Write as _;
use std::path::Path;

use log::{debug, warn};

use crate::error::{Error, LineError, Result};

/// Record start marker.
pub const START_CODE: char = ':';

/// Characters before the data field: marker, count, address, type.
const HEADER_LEN: usize = 9;

/// Record type field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RecordType {
    /// Data (0x00).
    Data,
    /// End of file (0x01).
    EndOfFile,
    /// Extended segment address (0x02).
    ExtendedSegmentAddress,
    /// Start segment address (0x03).
    StartSegmentAddress,
    /// Extended linear address (0x04).
    ExtendedLinearAddress,
    /// Start linear address (0x05).
    StartLinearAddress,
    /// Any other type code.
    Other(u8),
}

impl From<u8> for RecordType {
    fn from(value: u8) -> Self {
        match value {
            0x00 => Self::Data,
            0x01 => Self::EndOfFile,
            0x02 => Self::ExtendedSegmentAddress,
            0x03 => Self::StartSegmentAddress,
            0x04 => Self::ExtendedLinearAddress,
            0x05 => Self::StartLinearAddress,
            other => Self::Other(other),
        }
    }
}

impl RecordType {
    /// Numeric type code.
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Data => 0x00,
            Self::EndOfFile => 0x01,
            Self::ExtendedSegmentAddress => 0x02,
            Self::StartSegmentAddress => 0x03,
            Self::ExtendedLinearAddress => 0x04,
            Self::StartLinearAddress => 0x05,
            Self::Other(v) => v,
        }
    }
}

/// One parsed line.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct HexRecord {
    /// Declared number of data bytes.
    pub byte_count: u8,
    /// 16-bit load address.
    pub address: u16,
    /// Record type.
    pub record_type: RecordType,
    /// Payload, exactly `byte_count` bytes.
    pub data: Vec<u8>,
    /// 1-based line number in the source text.
    pub line: usize,
}

impl HexRecord {
    /// Whether this record carries bytes to program.
    pub fn is_payload(&self) -> bool {
        self.record_type == RecordType::Data && self.byte_count > 0
    }
}

fn hex_byte(text: &str, at: usize) -> Option<u8> {
    text.get(at..at + 2)
        .filter(|s| s.bytes().all(|b| b.is_ascii_hexdigit()))
        .and_then(|s| u8::from_str_radix(s, 16).ok())
}

fn parse_line(text: &str, line: usize) -> std::result::Result<HexRecord, LineError> {
    let fail = |reason: &str| LineError {
        line,
        reason: reason.to_string(),
    };

    if !text.starts_with(START_CODE) {
        return Err(fail("missing ':' start marker"));
    }
    if !text.is_ascii() {
        return Err(fail("non-ASCII characters"));
    }
    if text.len() < HEADER_LEN {
        return Err(fail("record header truncated"));
    }

    let byte_count = hex_byte(text, 1).ok_or_else(|| fail("invalid byte count"))?;
    let address = match (hex_byte(text, 3), hex_byte(text, 5)) {
        (Some(hi), Some(lo)) => u16::from_be_bytes([hi, lo]),
        _ => return Err(fail("invalid address")),
    };
    let record_type = hex_byte(text, 7).ok_or_else(|| fail("invalid record type"))?;

    let data_end = HEADER_LEN + usize::from(byte_count) * 2;
    if text.len() < data_end {
        return Err(LineError {
            line,
            reason: format!(
                "expected {byte_count} data bytes, found {}",
                (text.len() - HEADER_LEN) / 2
            ),
        });
    }
    let data = (HEADER_LEN..data_end)
        .step_by(2)
        .map(|at| hex_byte(text, at))
        .collect::<Option<Vec<u8>>>()
        .ok_or_else(|| fail("invalid data byte"))?;

    Ok(HexRecord {
        byte_count,
        address,
        record_type: record_type.into(),
        data,
        line,
    })
}

/// Lazy record iterator over borrowed source text.
///
/// Blank lines are skipped; every other line yields either a record or a
/// [`LineError`].
#[derive(Debug, Clone)]
pub struct HexRecords<'a> {
    lines: std::iter::Enumerate<std::str::Lines<'a>>,
}

impl Iterator for HexRecords<'_> {
    type Item = std::result::Result<HexRecord, LineError>;

    fn next(&mut self) -> Option<Self::Item> {
        for (index, raw) in self.lines.by_ref() {
            let text = raw.trim();
            if text.is_empty() {
                continue;
            }
            return Some(parse_line(text, index + 1));
        }
        None
    }
}

/// Parse `source` lazily, one record per line.
pub fn records(source: &str) -> HexRecords<'_> {
    HexRecords {
        lines: source.lines().enumerate(),
    }
}

/// A fully parsed image with its malformed lines.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HexImage {
    records: Vec<HexRecord>,
    errors: Vec<LineError>,
}

impl HexImage {
    /// Parse the whole of `source`, collecting every malformed line.
    pub fn parse(source: &str) -> Self {
        let mut image = Self::default();
        for item in records(source) {
            match item {
                Ok(record) => image.records.push(record),
                Err(e) => {
                    warn!("Skipping malformed HEX {e}");
                    image.errors.push(e);
                },
            }
        }
        debug!(
            "Parsed {} HEX records ({} malformed)",
            image.records.len(),
            image.errors.len()
        );
        image
    }

    /// Read and parse a file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let source = std::fs::read_to_string(path.as_ref())?;
        Ok(Self::parse(&source))
    }

    /// Well-formed records in file order.
    pub fn records(&self) -> &[HexRecord] {
        &self.records
    }

    /// Malformed lines in file order.
    pub fn errors(&self) -> &[LineError] {
        &self.errors
    }

    /// Whether every non-blank line parsed.
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Records that carry bytes to program.
    pub fn data_records(&self) -> impl Iterator<Item = &HexRecord> {
        self.records
            .iter()
            .filter(|r| r.is_payload())
    }

    /// Total number of payload bytes.
    pub fn data_len(&self) -> usize {
        self.data_records()
            .map(|r| r.data.len())
            .sum()
    }

    /// Refuse an image with malformed lines.
    pub fn into_valid(self) -> Result<Self> {
        if self.errors.is_empty() {
            Ok(self)
        } else {
            Err(Error::InvalidImage {
                errors: self.errors,
            })
        }
    }

    /// Flatten data records into a memory image starting at address 0.
    ///
    /// Gaps are filled with 0xFF (erased flash). Only the 16-bit address
    /// field is used; extended address records are ignored.
    pub fn to_binary(&self) -> Vec<u8> {
        let end = self
            .data_records()
            .map(|r| usize::from(r.address) + r.data.len())
            .max()
            .unwrap_or(0);
        let mut binary = vec![0xFF; end];
        for record in self.data_records() {
            let start = usize::from(record.address);
            binary[start..start + record.data.len()].copy_from_slice(&record.data);
        }
        binary
    }
}

/// Format one memory-dump line in lowercase hex.
///
/// The trailing byte is `(len + addrHi + addrLo + 0 + sum(data)) mod 256`.
#[allow(clippy::cast_possible_truncation)]
pub fn format_record_line(address: u32, data: &[u8]) -> String {
    let len = data.len() as u8;
    let [hi, lo] = (address as u16).to_be_bytes();
    let sum = data
        .iter()
        .fold(len.wrapping_add(hi).wrapping_add(lo), |sum, &b| sum.wrapping_add(b));

    let mut line = String::with_capacity(HEADER_LEN + 2 + data.len() * 2);
    line.push(START_CODE);
    let _ = write!(line, "{len:02x}{hi:02x}{lo:02x}00");
    for b in data {
        let _ = write!(line, "{b:02x}");
    }
    let _ = write!(line, "{sum:02x}");
    line
}

/// Format chunks as dump lines joined with `\n`, in the order given.
pub fn dump_chunks<'a, I>(chunks: I) -> String
where
    I: IntoIterator<Item = (u32, &'a [u8])>,
{
    chunks
        .into_iter()
        .map(|(address, data)| format_record_line(address, data))
        .collect::<Vec<_>>()
        .join("\n")
}
