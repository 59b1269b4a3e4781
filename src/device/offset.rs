//! Virtual byte offset
//!
//! Backends without a server-side cursor position every request explicitly.
//! `VirtualOffset` is the cursor they keep instead; backends with a native
//! cursor keep one too and move the native cursor to match it.

use super::Whence;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SeekError {
    #[error("object size unknown, cannot seek relative to end")]
    UnknownEnd,

    #[error("seek to negative offset {0}")]
    Negative(i128),

    #[error("seek offset overflows")]
    Overflow,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct VirtualOffset(u64);

impl VirtualOffset {
    pub fn new() -> Self {
        Self(0)
    }

    pub fn get(&self) -> u64 {
        self.0
    }

    pub fn set(&mut self, position: u64) {
        self.0 = position;
    }

    pub fn reset(&mut self) {
        self.0 = 0;
    }

    /// Move forward by the amount actually transferred.
    pub fn advance(&mut self, transferred: usize) {
        self.0 = self.0.saturating_add(transferred as u64);
    }

    /// Compute the target of a seek without moving.
    ///
    /// `end` is the current object size, if the backend can report it.
    pub fn resolve(&self, offset: i64, whence: Whence, end: Option<u64>) -> Result<u64, SeekError> {
        let base = match whence {
            Whence::Start => 0,
            Whence::Current => self.0,
            Whence::End => end.ok_or(SeekError::UnknownEnd)?,
        };
        let target = base as i128 + offset as i128;
        if target < 0 {
            return Err(SeekError::Negative(target));
        }
        u64::try_from(target).map_err(|_| SeekError::Overflow)
    }

    pub fn seek(&mut self, offset: i64, whence: Whence, end: Option<u64>) -> Result<u64, SeekError> {
        let target = self.resolve(offset, whence, end)?;
        self.0 = target;
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advance_and_reset() {
        let mut offset = VirtualOffset::new();
        offset.advance(100);
        offset.advance(28);
        assert_eq!(offset.get(), 128);
        offset.reset();
        assert_eq!(offset.get(), 0);
    }

    #[test]
    fn test_seek_start_and_current() {
        let mut offset = VirtualOffset::new();
        assert_eq!(offset.seek(512, Whence::Start, None), Ok(512));
        assert_eq!(offset.seek(-12, Whence::Current, None), Ok(500));
        assert_eq!(offset.get(), 500);
    }

    #[test]
    fn test_seek_end_needs_size() {
        let mut offset = VirtualOffset::new();
        assert_eq!(offset.seek(0, Whence::End, None), Err(SeekError::UnknownEnd));
        assert_eq!(offset.seek(-10, Whence::End, Some(4096)), Ok(4086));
    }

    #[test]
    fn test_seek_negative_rejected() {
        let mut offset = VirtualOffset::new();
        offset.set(10);
        assert_eq!(
            offset.seek(-11, Whence::Current, None),
            Err(SeekError::Negative(-1))
        );
        // failed seeks leave the position alone
        assert_eq!(offset.get(), 10);
    }
}
