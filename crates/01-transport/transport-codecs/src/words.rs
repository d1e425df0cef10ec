//! Little-endian 32-bit word views over byte buffers.
//!
//! Trailing bytes that do not fill a whole word are ignored.

use crate::{CodecError, CodecResult};

pub const WORD_BYTES: usize = 4;

/// Number of whole words in `bytes`.
pub fn word_count(bytes: &[u8]) -> usize {
    bytes.len() / WORD_BYTES
}

#[derive(Clone, Copy)]
pub struct Words<'a> {
    bytes: &'a [u8],
}

impl<'a> Words<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    pub fn len(&self) -> usize {
        word_count(self.bytes)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: usize) -> CodecResult<i32> {
        read(self.bytes, index)
    }

    /// Copies `count` words starting at `start`.
    pub fn range(&self, start: usize, count: usize) -> CodecResult<Vec<i32>> {
        let words = self.len();
        let end = start
            .checked_add(count)
            .filter(|&end| end <= words)
            .ok_or(CodecError::OutOfBounds {
                index: start.saturating_add(count),
                words,
            })?;
        Ok((start..end).map(|i| decode_at(self.bytes, i)).collect())
    }
}

pub struct WordsMut<'a> {
    bytes: &'a mut [u8],
}

impl<'a> WordsMut<'a> {
    pub fn new(bytes: &'a mut [u8]) -> Self {
        Self { bytes }
    }

    pub fn len(&self) -> usize {
        word_count(self.bytes)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: usize) -> CodecResult<i32> {
        read(self.bytes, index)
    }

    pub fn set(&mut self, index: usize, value: i32) -> CodecResult<()> {
        let words = self.len();
        if index >= words {
            return Err(CodecError::OutOfBounds { index, words });
        }
        let at = index * WORD_BYTES;
        self.bytes[at..at + WORD_BYTES].copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    /// Writes `values` into consecutive words starting at `start`.
    pub fn put(&mut self, start: usize, values: &[i32]) -> CodecResult<()> {
        let words = self.len();
        if start + values.len() > words {
            return Err(CodecError::OutOfBounds {
                index: start + values.len(),
                words,
            });
        }
        let dst = &mut self.bytes[start * WORD_BYTES..(start + values.len()) * WORD_BYTES];
        for (chunk, value) in dst.chunks_exact_mut(WORD_BYTES).zip(values) {
            chunk.copy_from_slice(&value.to_le_bytes());
        }
        Ok(())
    }
}

fn read(bytes: &[u8], index: usize) -> CodecResult<i32> {
    let words = word_count(bytes);
    if index >= words {
        return Err(CodecError::OutOfBounds { index, words });
    }
    Ok(decode_at(bytes, index))
}

fn decode_at(bytes: &[u8], index: usize) -> i32 {
    let at = index * WORD_BYTES;
    let mut word = [0u8; WORD_BYTES];
    word.copy_from_slice(&bytes[at..at + WORD_BYTES]);
    i32::from_le_bytes(word)
}
