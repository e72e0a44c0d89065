// rust/fedsim-core/src/dataset/format.rs

//! Record formats: how a split file is cut into rows.

use std::fmt::Debug;
use std::ops::Range;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::{Result, SimError};

/// Describes how to find record boundaries.
pub trait RecordFormat: Send + Sync + Debug {
    /// Locates the record starting at `offset`.
    ///
    /// Returns the payload range and the offset just past the record, or
    /// `None` once `offset` reaches the end of `data`.
    ///
    /// # Errors
    ///
    /// Returns an error if the data ends inside a record.
    fn next_record(&self, data: &[u8], offset: usize) -> Result<Option<(Range<usize>, usize)>>;

    /// Name of this record format
    fn name(&self) -> &'static str;

    /// Cuts `data` into record payloads without copying.
    fn split_records(&self, data: &Bytes) -> Result<Vec<Bytes>> {
        let mut records = Vec::new();
        let mut offset = 0;
        while let Some((payload, end)) = self.next_record(data, offset)? {
            records.push(data.slice(payload));
            offset = end;
        }
        Ok(records)
    }
}

/// Fixed-size records
#[derive(Debug, Clone)]
pub struct FixedSizeFormat {
    pub record_size: usize,
}

impl FixedSizeFormat {
    pub fn new(record_size: usize) -> Self {
        Self { record_size }
    }
}

impl RecordFormat for FixedSizeFormat {
    fn next_record(&self, data: &[u8], offset: usize) -> Result<Option<(Range<usize>, usize)>> {
        if offset >= data.len() {
            return Ok(None);
        }
        let end = offset + self.record_size;
        if end > data.len() {
            return Err(SimError::serialization(format!(
                "trailing {} byte(s) do not form a full {}-byte record",
                data.len() - offset,
                self.record_size
            )));
        }
        Ok(Some((offset..end, end)))
    }

    fn name(&self) -> &'static str {
        "fixed-size"
    }
}

/// Newline-delimited records (JSONL, CSV, etc.). The newline is not part of
/// the payload, and a final line without one still counts.
#[derive(Debug, Clone, Default)]
pub struct NewlineDelimitedFormat;

impl NewlineDelimitedFormat {
    pub fn new() -> Self {
        Self
    }
}

impl RecordFormat for NewlineDelimitedFormat {
    fn next_record(&self, data: &[u8], offset: usize) -> Result<Option<(Range<usize>, usize)>> {
        if offset >= data.len() {
            return Ok(None);
        }

        match data[offset..].iter().position(|&b| b == b'\n') {
            Some(i) => {
                let mut payload_end = offset + i;
                // Tolerate CRLF
                if payload_end > offset && data[payload_end - 1] == b'\r' {
                    payload_end -= 1;
                }
                Ok(Some((offset..payload_end, offset + i + 1)))
            }
            None => Ok(Some((offset..data.len(), data.len()))),
        }
    }

    fn name(&self) -> &'static str {
        "newline-delimited"
    }
}

/// Length-prefixed records (4-byte big-endian length + data)
#[derive(Debug, Clone, Default)]
pub struct LengthPrefixedFormat;

impl LengthPrefixedFormat {
    pub fn new() -> Self {
        Self
    }
}

impl RecordFormat for LengthPrefixedFormat {
    fn next_record(&self, data: &[u8], offset: usize) -> Result<Option<(Range<usize>, usize)>> {
        if offset >= data.len() {
            return Ok(None);
        }

        let prefix: [u8; 4] = data
            .get(offset..offset + 4)
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| {
                SimError::serialization(format!("truncated length prefix at byte {offset}"))
            })?;
        let length = u32::from_be_bytes(prefix) as usize;

        let start = offset + 4;
        let end = start + length;
        if end > data.len() {
            return Err(SimError::serialization(format!(
                "record at byte {offset} declares {length} bytes but only {} remain",
                data.len() - start
            )));
        }
        Ok(Some((start..end, end)))
    }

    fn name(&self) -> &'static str {
        "length-prefixed"
    }
}

/// Parses a format string into a RecordFormat implementation.
///
/// Supported formats:
/// - "fixed:N" - Fixed-size records of N bytes
/// - "newline" - Newline-delimited records (JSONL, CSV, etc.)
/// - "length-prefixed" - 4-byte big-endian length prefix + data
pub fn parse_format(format: &str) -> Result<Arc<dyn RecordFormat>> {
    if let Some(size_str) = format.strip_prefix("fixed:") {
        let size: usize = size_str
            .parse()
            .map_err(|_| SimError::config(format!("invalid fixed record size: '{size_str}'")))?;
        if size == 0 {
            return Err(SimError::config("fixed record size must be > 0"));
        }
        Ok(Arc::new(FixedSizeFormat::new(size)))
    } else {
        match format {
            "newline" => Ok(Arc::new(NewlineDelimitedFormat::new())),
            "length-prefixed" => Ok(Arc::new(LengthPrefixedFormat::new())),
            _ => Err(SimError::config(format!(
                "unknown record format: '{format}'. Expected 'fixed:N', 'newline', or 'length-prefixed'"
            ))),
        }
    }
}
