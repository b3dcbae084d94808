//! Firmware image formats.

pub mod hex;

pub use hex::{HexImage, HexRecord, HexRecords, RecordType, dump_chunks, format_record_line};
