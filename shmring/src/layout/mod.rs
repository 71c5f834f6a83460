//! In-segment layout: the control header and the word store behind it.
//!
//! Every positional value in shared memory is an [`Offset`] into the store, so
//! the same bytes mean the same thing in every attached process.

use std::convert::TryFrom;
use std::fmt;
use std::mem;

use thiserror::Error;

use crate::topology::Topology;

/// Unit of storage. Records and payloads are counted in words.
pub type Word = i32;

pub const WORD_SIZE: usize = mem::size_of::<Word>();

/// `[len][next]` in front of every payload.
pub const RECORD_OVERHEAD: usize = 2;

pub const MIN_CAPACITY: usize = RECORD_OVERHEAD + 1;
pub const MAX_CAPACITY: usize = i32::MAX as usize;

pub(crate) const RING_MAGIC: u64 = 0x5348_4d52_494e_4731; // "SHMRING1"

/// Words a payload of `payload_words` occupies once stored.
#[inline]
pub fn stored_len(payload_words: usize) -> usize {
    payload_words + RECORD_OVERHEAD
}

/// Word index into the record store.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Offset(usize);

impl Offset {
    pub const ORIGIN: Offset = Offset(0);

    #[inline]
    pub const fn new(words: usize) -> Offset {
        Offset(words)
    }

    #[inline]
    pub const fn get(self) -> usize {
        self.0
    }

    #[inline]
    pub fn is_origin(self) -> bool {
        self.0 == 0
    }

    /// Offset `words` further on, folded to the origin when it lands exactly on
    /// `capacity`.
    #[inline]
    pub(crate) fn advance(self, words: usize, capacity: usize) -> Offset {
        let end = self.0 + words;
        if end == capacity {
            Offset::ORIGIN
        } else {
            Offset(end)
        }
    }

    fn to_word(self) -> Word {
        // capacity <= i32::MAX is checked before any store is built
        self.0 as Word
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.0)
    }
}

/// Control block at the start of the segment.
///
/// Only ever touched through a `LockedRing`, i.e. with the segment mutex held.
#[derive(Debug)]
#[repr(C)]
pub struct RingHeader {
    pub(crate) magic: u64,
    pub(crate) capacity: usize,
    pub(crate) write: Offset,
    pub(crate) prev_write: Offset,
    pub(crate) read: Offset,
    pub(crate) queued: usize,
    // Raw so that a scribbled value is detected instead of being undefined behaviour.
    pub(crate) topology: u32,
    _reserved: u32,
    pub(crate) attached: usize,
    pub(crate) producers: usize,
    pub(crate) producers_seen: usize,
    pub(crate) enqueued_total: u64,
    pub(crate) dequeued_total: u64,
    pub(crate) corrupt_records: u64,
}

impl RingHeader {
    pub fn new(capacity: usize) -> RingHeader {
        RingHeader {
            magic: RING_MAGIC,
            capacity,
            write: Offset::ORIGIN,
            prev_write: Offset::ORIGIN,
            read: Offset::ORIGIN,
            queued: 0,
            topology: Topology::Linear as u32,
            _reserved: 0,
            attached: 0,
            producers: 0,
            producers_seen: 0,
            enqueued_total: 0,
            dequeued_total: 0,
            corrupt_records: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn queued(&self) -> usize {
        self.queued
    }

    pub fn write_offset(&self) -> Offset {
        self.write
    }

    pub fn prev_write_offset(&self) -> Offset {
        self.prev_write
    }

    pub fn read_offset(&self) -> Offset {
        self.read
    }

    pub fn topology(&self) -> Result<Topology, u32> {
        Topology::try_from(self.topology)
    }

    pub(crate) fn set_topology(&mut self, mode: Topology) {
        self.topology = mode as u32;
    }

    /// Offsets, queue count and mode back to a fresh ring. Lifetime totals,
    /// attach and producer counts survive.
    pub(crate) fn reset(&mut self) {
        self.write = Offset::ORIGIN;
        self.prev_write = Offset::ORIGIN;
        self.read = Offset::ORIGIN;
        self.queued = 0;
        self.set_topology(Topology::Linear);
    }

    pub(crate) fn check(&self) -> Result<(), String> {
        if self.magic != RING_MAGIC {
            return Err(format!("bad magic {:#x}", self.magic));
        }
        if self.capacity < MIN_CAPACITY || self.capacity > MAX_CAPACITY {
            return Err(format!("capacity {} out of range", self.capacity));
        }
        Ok(())
    }
}

/// Why a stored record could not be read back.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecordFault {
    #[error("record header at {at} runs past the end of the store")]
    HeaderOutOfBounds { at: Offset },
    #[error("record at {at} reports non-positive length {len}")]
    NonPositiveLength { at: Offset, len: Word },
    #[error("record at {at} of {len} words runs past the end of the store")]
    PayloadOutOfBounds { at: Offset, len: Word },
    #[error("record at {at} links to {next}, outside the store")]
    LinkOutOfRange { at: Offset, next: Word },
}

/// A record as found in the store.
#[derive(Debug)]
pub struct Record<'s> {
    pub at: Offset,
    pub next: Offset,
    pub payload: &'s [Word],
}

/// The words following the header: records back to back.
pub struct RecordStore<'a> {
    words: &'a mut [Word],
}

impl<'a> RecordStore<'a> {
    pub fn new(words: &'a mut [Word]) -> RecordStore<'a> {
        RecordStore { words }
    }

    pub fn capacity(&self) -> usize {
        self.words.len()
    }

    /// Writes `[len][next][payload]` at `at`. The caller has already chosen a
    /// free range; running past the end means that choice was wrong.
    pub fn put(&mut self, at: Offset, payload: &[Word], next: Offset) -> Result<(), RecordFault> {
        let start = at.get();
        let end = start + stored_len(payload.len());
        if end > self.words.len() {
            return Err(RecordFault::PayloadOutOfBounds {
                at,
                len: payload.len() as Word,
            });
        }
        self.words[start] = payload.len() as Word;
        self.words[start + 1] = next.to_word();
        self.words[start + RECORD_OVERHEAD..end].copy_from_slice(payload);
        Ok(())
    }

    /// Rewrites the forward link of the record at `at`.
    pub fn relink(&mut self, at: Offset, next: Offset) -> Result<(), RecordFault> {
        let slot = at.get() + 1;
        if slot >= self.words.len() {
            return Err(RecordFault::HeaderOutOfBounds { at });
        }
        self.words[slot] = next.to_word();
        Ok(())
    }

    pub fn get(&self, at: Offset) -> Result<Record<'_>, RecordFault> {
        let start = at.get();
        if start + RECORD_OVERHEAD > self.words.len() {
            return Err(RecordFault::HeaderOutOfBounds { at });
        }
        let len = self.words[start];
        let next = self.words[start + 1];
        if len <= 0 {
            return Err(RecordFault::NonPositiveLength { at, len });
        }
        let end = start + stored_len(len as usize);
        if end > self.words.len() {
            return Err(RecordFault::PayloadOutOfBounds { at, len });
        }
        if next < 0 || next as usize >= self.words.len() {
            return Err(RecordFault::LinkOutOfRange { at, next });
        }
        Ok(Record {
            at,
            next: Offset::new(next as usize),
            payload: &self.words[start + RECORD_OVERHEAD..end],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_folds_at_capacity() {
        assert_eq!(Offset::new(4).advance(6, 16), Offset::new(10));
        assert_eq!(Offset::new(10).advance(6, 16), Offset::ORIGIN);
    }

    #[test]
    fn put_then_get() {
        let mut words = vec![0; 16];
        let mut store = RecordStore::new(&mut words);
        store.put(Offset::new(3), &[7, 8, 9], Offset::new(8)).unwrap();
        let record = store.get(Offset::new(3)).unwrap();
        assert_eq!(record.payload, &[7, 8, 9]);
        assert_eq!(record.next, Offset::new(8));
        assert_eq!(&words[3..8], &[3, 8, 7, 8, 9]);
    }

    #[test]
    fn put_refuses_to_run_off_the_end() {
        let mut words = vec![0; 8];
        let mut store = RecordStore::new(&mut words);
        let fault = store.put(Offset::new(4), &[1, 2, 3], Offset::ORIGIN).unwrap_err();
        assert_eq!(fault, RecordFault::PayloadOutOfBounds { at: Offset::new(4), len: 3 });
    }

    #[test]
    fn relink_patches_only_the_link() {
        let mut words = vec![0; 8];
        let mut store = RecordStore::new(&mut words);
        store.put(Offset::ORIGIN, &[5, 6], Offset::new(4)).unwrap();
        store.relink(Offset::ORIGIN, Offset::ORIGIN).unwrap();
        assert_eq!(&words[..4], &[2, 0, 5, 6]);
    }

    #[test]
    fn get_detects_damage() {
        let mut words = vec![0; 8];
        let store = RecordStore::new(&mut words);
        assert_eq!(
            store.get(Offset::ORIGIN).unwrap_err(),
            RecordFault::NonPositiveLength { at: Offset::ORIGIN, len: 0 }
        );
        assert_eq!(
            store.get(Offset::new(7)).unwrap_err(),
            RecordFault::HeaderOutOfBounds { at: Offset::new(7) }
        );

        let mut words = vec![9, 0, 0, 0];
        let store = RecordStore::new(&mut words);
        assert!(matches!(
            store.get(Offset::ORIGIN),
            Err(RecordFault::PayloadOutOfBounds { len: 9, .. })
        ));

        let mut words = vec![1, 4, 0, 0];
        let store = RecordStore::new(&mut words);
        assert_eq!(
            store.get(Offset::ORIGIN).unwrap_err(),
            RecordFault::LinkOutOfRange { at: Offset::ORIGIN, next: 4 }
        );
    }

    #[test]
    fn header_reset_keeps_totals() {
        let mut header = RingHeader::new(16);
        header.write = Offset::new(12);
        header.read = Offset::new(6);
        header.queued = 1;
        header.enqueued_total = 2;
        header.dequeued_total = 1;
        header.set_topology(Topology::WrappedBehindReader);
        header.reset();
        assert_eq!(header.write_offset(), Offset::ORIGIN);
        assert_eq!(header.read_offset(), Offset::ORIGIN);
        assert_eq!(header.queued(), 0);
        assert_eq!(header.topology(), Ok(Topology::Linear));
        assert_eq!(header.enqueued_total, 2);
        assert_eq!(header.dequeued_total, 1);
    }

    #[test]
    fn header_check() {
        assert!(RingHeader::new(16).check().is_ok());
        assert!(RingHeader::new(2).check().is_err());
        let mut header = RingHeader::new(16);
        header.magic = 0;
        assert!(header.check().is_err());
    }
}
