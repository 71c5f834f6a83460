use tracing::error;

use crate::core::LockedRing;
use crate::errors::RingError;
use crate::layout::{Offset, Record, Word};
use crate::topology::Step;

impl<'a> LockedRing<'a> {
    /// The oldest record, or `None` when the ring is empty or the record at the
    /// read offset is damaged. Damage is logged and counted, never consumed.
    fn oldest(&mut self) -> Option<Record<'_>> {
        if self.header.queued == 0 {
            return None;
        }
        let read = self.header.read;
        match self.store.get(read) {
            Ok(record) => Some(record),
            Err(fault) => {
                self.header.corrupt_records += 1;
                error!(
                    %fault,
                    read = read.get(),
                    queued = self.header.queued,
                    corrupt_records = self.header.corrupt_records,
                    "skipping unreadable record"
                );
                None
            }
        }
    }

    /// Moves the reader past the record it just copied out. An undecodable
    /// mode is reported before anything changes.
    fn consume(&mut self, next: Offset) -> Result<(), RingError> {
        let mode = self.topology().map_err(|e| {
            error!(
                raw = self.header.topology,
                read = self.header.read.get(),
                queued = self.header.queued,
                "refusing to dequeue: {}",
                e
            );
            e
        })?;
        if next.is_origin() {
            let next_mode = mode
                .after(Step::ReaderWrapped)
                .ok_or_else(|| RingError::Corrupted(format!("no reader wrap from {}", mode)))?;
            self.header.set_topology(next_mode);
        }
        self.header.read = next;
        self.header.queued -= 1;
        self.header.dequeued_total += 1;
        Ok(())
    }

    /// Copies the oldest record into `out` and removes it.
    ///
    /// A buffer shorter than the record is an error and leaves the record queued.
    pub fn dequeue_into(&mut self, out: &mut [Word]) -> Result<Option<usize>, RingError> {
        let (len, next) = match self.oldest() {
            Some(record) => {
                let len = record.payload.len();
                if out.len() < len {
                    return Err(RingError::BufferTooSmall {
                        needed: len,
                        available: out.len(),
                    });
                }
                out[..len].copy_from_slice(record.payload);
                (len, record.next)
            }
            None => return Ok(None),
        };
        self.consume(next)?;
        Ok(Some(len))
    }

    /// Removes the oldest record and returns it as a fresh vector.
    pub fn take(&mut self) -> Result<Option<Vec<Word>>, RingError> {
        let (payload, next) = match self.oldest() {
            Some(record) => (record.payload.to_vec(), record.next),
            None => return Ok(None),
        };
        self.consume(next)?;
        Ok(Some(payload))
    }

    /// Copy of the oldest record; the ring is left as is.
    pub fn peek(&mut self) -> Option<Vec<Word>> {
        self.oldest().map(|record| record.payload.to_vec())
    }
}
