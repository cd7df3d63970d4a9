//! Chunk arithmetic and payload reassembly.
//!
//! A payload of P bytes travels as `ceil(P / chunk_size)` binary frames.
//! The transport is ordered and reliable, so reassembly is pure
//! accumulation: chunks are buffered in arrival order and concatenated
//! when the end-of-transfer control frame arrives.

pub mod transfer;

use bytes::{Bytes, BytesMut};

/// Number of chunks needed to cover `payload_len` bytes.
///
/// An empty payload has zero chunks: the transfer is just its start/end
/// control frames.
pub fn chunk_count(payload_len: usize, chunk_size: usize) -> u32 {
    payload_len.div_ceil(chunk_size) as u32
}

/// Split a payload into chunk-sized views (zero-copy).
pub fn chunks(payload: &Bytes, chunk_size: usize) -> impl Iterator<Item = Bytes> + '_ {
    (0..payload.len())
        .step_by(chunk_size.max(1))
        .map(move |start| payload.slice(start..(start + chunk_size).min(payload.len())))
}

/// Accumulates inbound chunks for one transfer.
#[derive(Debug)]
pub struct Reassembly {
    expected_chunks: u32,
    total_size: u64,
    received: Vec<Bytes>,
}

impl Reassembly {
    pub fn new(expected_chunks: u32, total_size: u64) -> Self {
        Self {
            expected_chunks,
            total_size,
            received: Vec::with_capacity(expected_chunks as usize),
        }
    }

    /// Buffer one chunk, in arrival order.
    pub fn push(&mut self, chunk: Bytes) {
        self.received.push(chunk);
    }

    pub fn received_chunks(&self) -> u32 {
        self.received.len() as u32
    }

    pub fn expected_chunks(&self) -> u32 {
        self.expected_chunks
    }

    /// Completion percentage, 0..=100.
    pub fn percent(&self) -> u8 {
        if self.expected_chunks == 0 {
            return 100;
        }
        ((self.received.len() as u64 * 100) / self.expected_chunks as u64).min(100) as u8
    }

    /// Concatenate everything received into the original payload.
    pub fn assemble(self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.total_size as usize);
        for chunk in self.received {
            buf.extend_from_slice(&chunk);
        }
        buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const C: usize = 16 * 1024;

    fn payload(len: usize) -> Bytes {
        Bytes::from((0..len).map(|i| (i % 251) as u8).collect::<Vec<u8>>())
    }

    fn roundtrip(len: usize) {
        let data = payload(len);
        let split: Vec<Bytes> = chunks(&data, C).collect();
        assert_eq!(split.len() as u32, chunk_count(len, C), "len = {len}");

        let mut re = Reassembly::new(split.len() as u32, len as u64);
        for chunk in split {
            assert!(chunk.len() <= C);
            re.push(chunk);
        }
        assert_eq!(re.percent(), 100);
        assert_eq!(re.assemble(), data, "len = {len}");
    }

    #[test]
    fn test_roundtrip_boundary_sizes() {
        // Empty, sub-chunk, exact chunk, one over, large multiple.
        for len in [0, 1, C - 1, C, C + 1, 8 * C] {
            roundtrip(len);
        }
    }

    #[test]
    fn test_chunk_count_is_ceil() {
        assert_eq!(chunk_count(0, C), 0);
        assert_eq!(chunk_count(1, C), 1);
        assert_eq!(chunk_count(C, C), 1);
        assert_eq!(chunk_count(C + 1, C), 2);
        assert_eq!(chunk_count(10 * C, C), 10);
    }

    #[test]
    fn test_percent_progression() {
        let mut re = Reassembly::new(4, 4 * C as u64);
        assert_eq!(re.percent(), 0);
        re.push(payload(C));
        assert_eq!(re.percent(), 25);
        re.push(payload(C));
        re.push(payload(C));
        assert_eq!(re.percent(), 75);
        re.push(payload(C));
        assert_eq!(re.percent(), 100);
    }

    #[test]
    fn test_empty_transfer_is_complete_immediately() {
        let re = Reassembly::new(0, 0);
        assert_eq!(re.percent(), 100);
        assert!(re.assemble().is_empty());
    }
}
