//! Log record wire format
//!
//! `[timestamp:4 BE][sensor_index:1][length:1][payload:length]`, packed
//! back to back with no padding or checksums.

use crate::sensors::{Payload, SAMPLE_CAPACITY, Sample};

pub const RECORD_HEADER_LEN: usize = 6;

/// Largest encoded record.
pub const MAX_RECORD_LEN: usize = RECORD_HEADER_LEN + SAMPLE_CAPACITY;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub timestamp: u32,
    pub sensor_index: u8,
    pub payload: Payload,
}

impl LogRecord {
    pub fn from_sample(sensor_index: u8, sample: &Sample) -> Self {
        Self {
            timestamp: sample.timestamp,
            sensor_index,
            payload: sample.payload.clone(),
        }
    }

    pub fn encoded_len(&self) -> usize {
        RECORD_HEADER_LEN + self.payload.len()
    }

    pub fn header(&self) -> [u8; RECORD_HEADER_LEN] {
        let ts = self.timestamp.to_be_bytes();
        [
            ts[0],
            ts[1],
            ts[2],
            ts[3],
            self.sensor_index,
            self.payload.len() as u8,
        ]
    }

    /// Write the encoded record to the front of `out`; returns bytes written,
    /// or `None` if `out` is too small.
    pub fn encode_into(&self, out: &mut [u8]) -> Option<usize> {
        let len = self.encoded_len();
        let dst = out.get_mut(..len)?;
        dst[..RECORD_HEADER_LEN].copy_from_slice(&self.header());
        dst[RECORD_HEADER_LEN..].copy_from_slice(&self.payload);
        Some(len)
    }

    /// Parse one record from the front of `bytes`.
    ///
    /// Returns the record and its encoded length, or `None` if `bytes` holds
    /// only part of a record or the length byte exceeds the payload capacity.
    pub fn decode(bytes: &[u8]) -> Option<(Self, usize)> {
        let header = bytes.get(..RECORD_HEADER_LEN)?;
        let len = header[5] as usize;
        if len > SAMPLE_CAPACITY {
            return None;
        }
        let payload = bytes.get(RECORD_HEADER_LEN..RECORD_HEADER_LEN + len)?;
        let record = Self {
            timestamp: u32::from_be_bytes([header[0], header[1], header[2], header[3]]),
            sensor_index: header[4],
            payload: Payload::from_slice(payload).ok()?,
        };
        Some((record, RECORD_HEADER_LEN + len))
    }
}

/// Iterates records in a flat byte stream, e.g. an uploaded log.
///
/// Stops at the first incomplete or malformed record; [`RecordReader::rest`]
/// then holds the bytes that could not be parsed.
pub struct RecordReader<'a> {
    bytes: &'a [u8],
}

impl<'a> RecordReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    pub fn rest(&self) -> &'a [u8] {
        self.bytes
    }
}

impl Iterator for RecordReader<'_> {
    type Item = LogRecord;

    fn next(&mut self) -> Option<LogRecord> {
        let (record, used) = LogRecord::decode(self.bytes)?;
        self.bytes = &self.bytes[used..];
        Some(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(ts: u32, idx: u8, payload: &[u8]) -> LogRecord {
        LogRecord {
            timestamp: ts,
            sensor_index: idx,
            payload: Payload::from_slice(payload).unwrap(),
        }
    }

    #[test]
    fn test_header_layout_is_big_endian() {
        let r = record(0x0102_0304, 7, &[0xAA, 0xBB]);
        let mut buf = [0u8; 16];
        let n = r.encode_into(&mut buf).unwrap();
        assert_eq!(n, 8);
        assert_eq!(&buf[..8], &[0x01, 0x02, 0x03, 0x04, 7, 2, 0xAA, 0xBB]);
    }

    #[test]
    fn test_encode_into_short_buffer() {
        let r = record(1, 0, &[1, 2, 3]);
        let mut buf = [0u8; 8];
        assert_eq!(r.encode_into(&mut buf), None);
    }

    #[test]
    fn test_reader_walks_packed_stream() {
        let records = [record(10, 0, &[1]), record(20, 3, &[]), record(30, 1, &[9; 64])];
        let mut stream = std::vec::Vec::new();
        for r in &records {
            let mut buf = [0u8; MAX_RECORD_LEN];
            let n = r.encode_into(&mut buf).unwrap();
            stream.extend_from_slice(&buf[..n]);
        }
        // Partial trailing record
        stream.extend_from_slice(&[0, 0, 0, 40, 2, 5, 1]);

        let mut reader = RecordReader::new(&stream);
        let parsed: std::vec::Vec<_> = reader.by_ref().collect();
        assert_eq!(parsed, records);
        assert_eq!(reader.rest().len(), 7);
    }

    #[test]
    fn test_oversized_length_byte_stops_reader() {
        let stream = [0, 0, 0, 1, 0, 65];
        assert_eq!(LogRecord::decode(&stream), None);
        assert_eq!(RecordReader::new(&stream).count(), 0);
    }
}
