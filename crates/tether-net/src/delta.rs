//! Bit-flagged delta codec for fixed-size binary records.
//!
//! A record is split into 2-byte words. The encoded form is one flag bit per
//! word (`ceil(words / 8)` bytes, LSB first) followed by the bytes of every
//! changed word in order. A record of odd size ends in a 1-byte word.
//!
//! The codec knows nothing about the record's meaning; the client uses it to
//! shrink consecutive inputs, which rarely differ by more than a few bytes.

use crate::bytes::ByteReader;
use crate::error::WireError;

/// Number of 2-byte words (the last one possibly short) in a record.
fn word_count(size: usize) -> usize {
    size.div_ceil(2)
}

/// Byte range of word `index` in a record of `size` bytes.
fn word_range(index: usize, size: usize) -> std::ops::Range<usize> {
    let start = index * 2;
    start..(start + 2).min(size)
}

/// Delta codec with a persisted "last known full" record on the decoding
/// side.
#[derive(Debug, Clone)]
pub struct DeltaCompressor {
    last_full: Vec<u8>,
}

impl DeltaCompressor {
    /// Creates a codec for records of `record_size` bytes, primed with zeros.
    pub fn new(record_size: usize) -> Self {
        Self {
            last_full: vec![0; record_size],
        }
    }

    /// Size of the records this codec handles.
    pub fn record_size(&self) -> usize {
        self.last_full.len()
    }

    /// Size of the flag block that prefixes every encoded record.
    pub fn flag_bytes(&self) -> usize {
        word_count(self.record_size()).div_ceil(8)
    }

    /// The record the next [`decode`](Self::decode) applies changes to.
    pub fn last_full(&self) -> &[u8] {
        &self.last_full
    }

    /// Replaces the decoding reference with a fully transmitted record.
    pub fn prime(&mut self, full: &[u8]) {
        let n = full.len().min(self.last_full.len());
        self.last_full[..n].copy_from_slice(&full[..n]);
    }

    /// Encodes the changes from `prev` to `next`, appending to `out`.
    ///
    /// Both records must be `record_size` bytes. Returns the number of bytes
    /// appended.
    pub fn encode(&self, prev: &[u8], next: &[u8], out: &mut Vec<u8>) -> usize {
        let size = self.record_size();
        debug_assert_eq!(prev.len(), size);
        debug_assert_eq!(next.len(), size);

        let start = out.len();
        let flags_at = out.len();
        out.resize(flags_at + self.flag_bytes(), 0);

        for word in 0..word_count(size) {
            let range = word_range(word, size);
            if prev[range.clone()] != next[range.clone()] {
                out[flags_at + word / 8] |= 1 << (word % 8);
                out.extend_from_slice(&next[range]);
            }
        }
        out.len() - start
    }

    /// Decodes one record from the front of `input` into the persisted
    /// buffer and returns the number of bytes consumed.
    ///
    /// On error the persisted buffer is left untouched.
    pub fn decode(&mut self, input: &[u8]) -> Result<usize, WireError> {
        let size = self.record_size();
        let mut reader = ByteReader::new(input);
        let flags = reader.read_bytes(self.flag_bytes())?;
        let is_set = |word: usize| flags[word / 8] & (1 << (word % 8)) != 0;

        let changed: usize = (0..word_count(size))
            .filter(|&w| is_set(w))
            .map(|w| word_range(w, size).len())
            .sum();
        let mut data = ByteReader::new(reader.read_bytes(changed)?);

        for word in (0..word_count(size)).filter(|&w| is_set(w)) {
            let range = word_range(word, size);
            let bytes = data.read_bytes(range.len())?;
            self.last_full[range].copy_from_slice(bytes);
        }
        Ok(reader.position())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identical_records_encode_to_flags_only() {
        let codec = DeltaCompressor::new(24);
        let record = [5u8; 24];
        let mut out = Vec::new();
        let written = codec.encode(&record, &record, &mut out);
        // 12 words -> 2 flag bytes, all clear.
        assert_eq!(written, 2);
        assert_eq!(out, [0, 0]);
    }

    #[test]
    fn test_changed_words_roundtrip() {
        let prev: Vec<u8> = (0..24).collect();
        let mut next = prev.clone();
        next[0] = 99;
        next[9] = 200;
        next[23] = 7;

        let encoder = DeltaCompressor::new(24);
        let mut out = Vec::new();
        let written = encoder.encode(&prev, &next, &mut out);
        assert_eq!(written, 2 + 3 * 2);
        assert_eq!(out[0], 0b0001_0001);
        assert_eq!(out[1], 0b0000_1000);

        let mut decoder = DeltaCompressor::new(24);
        decoder.prime(&prev);
        assert_eq!(decoder.decode(&out).unwrap(), written);
        assert_eq!(decoder.last_full(), &next[..]);
    }

    #[test]
    fn test_odd_size_tail_byte() {
        let prev = [1u8, 2, 3, 4, 5];
        let next = [1u8, 2, 3, 4, 9];
        let encoder = DeltaCompressor::new(5);
        let mut out = Vec::new();
        encoder.encode(&prev, &next, &mut out);
        // One flag byte, then only the 1-byte tail word.
        assert_eq!(out, [0b100, 9]);

        let mut decoder = DeltaCompressor::new(5);
        decoder.prime(&prev);
        assert_eq!(decoder.decode(&out).unwrap(), 2);
        assert_eq!(decoder.last_full(), &next);
    }

    #[test]
    fn test_decode_consumes_only_its_record() {
        let encoder = DeltaCompressor::new(4);
        let mut out = Vec::new();
        encoder.encode(&[0; 4], &[0, 0, 1, 1], &mut out);
        out.extend_from_slice(&[0xAA, 0xBB]);

        let mut decoder = DeltaCompressor::new(4);
        assert_eq!(decoder.decode(&out).unwrap(), 3);
        assert_eq!(decoder.last_full(), &[0, 0, 1, 1]);
    }

    #[test]
    fn test_short_stream_leaves_buffer_untouched() {
        let mut decoder = DeltaCompressor::new(4);
        decoder.prime(&[1, 2, 3, 4]);
        // Flags claim both words changed but only two bytes follow.
        let err = decoder.decode(&[0b11, 9, 9]).unwrap_err();
        assert!(matches!(err, WireError::UnexpectedEnd { .. }));
        assert_eq!(decoder.last_full(), &[1, 2, 3, 4]);
    }

    #[test]
    fn test_sequence_of_records_tracks_reference() {
        let encoder = DeltaCompressor::new(8);
        let mut decoder = DeltaCompressor::new(8);
        let records: [[u8; 8]; 4] = [
            [0; 8],
            [1, 0, 0, 0, 0, 0, 0, 0],
            [1, 0, 0, 0, 0, 0, 3, 3],
            [2, 2, 2, 2, 2, 2, 2, 2],
        ];
        for pair in records.windows(2) {
            let mut out = Vec::new();
            encoder.encode(&pair[0], &pair[1], &mut out);
            decoder.decode(&out).unwrap();
            assert_eq!(decoder.last_full(), &pair[1]);
        }
    }
}
