use tracing::error;

use crate::core::LockedRing;
use crate::errors::RingError;
use crate::layout::{stored_len, Offset, RecordFault, Word};
use crate::topology::{Step, Topology};

/// Where the next record goes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Placement {
    /// Ring is empty: start over at the origin.
    Restart,
    /// After the write offset, writer ahead of the reader.
    Append,
    /// At the origin, in front of the reader; the previous record gets relinked to 0.
    Wrap,
    /// After the write offset, writer behind the reader.
    AppendBehind,
}

impl<'a> LockedRing<'a> {
    /// Picks a free range of `stored` words without touching anything.
    pub(crate) fn place(&self, stored: usize) -> Result<Placement, RingError> {
        let header = self.header();
        if header.queued() == 0 {
            return Ok(Placement::Restart);
        }
        let mode = self.topology()?;
        let capacity = header.capacity();
        let write = header.write_offset().get();
        let read = header.read_offset().get();

        if write > read {
            if !mode.writer_ahead() {
                return Err(self.inconsistent(mode, "writer ahead of reader"));
            }
            // linear inserts wait until the reader has wrapped
            if mode == Topology::WrappedAtCapacity {
                return Err(RingError::Full { stored });
            }
            if capacity - write >= stored {
                return Ok(Placement::Append);
            }
            if read >= stored {
                return Ok(Placement::Wrap);
            }
            return Err(RingError::Full { stored });
        }

        if !mode.writer_behind() {
            return Err(self.inconsistent(mode, "writer at or behind reader"));
        }
        if read - write >= stored {
            Ok(Placement::AppendBehind)
        } else {
            Err(RingError::Full { stored })
        }
    }

    /// Stores `payload` as one record. Returns the payload length in words.
    ///
    /// `Full` is backpressure and may succeed after a dequeue; `Capacity` never will.
    pub fn enqueue(&mut self, payload: &[Word]) -> Result<usize, RingError> {
        if payload.is_empty() {
            return Err(RingError::EmptyPayload);
        }
        let capacity = self.header().capacity();
        let stored = stored_len(payload.len());
        if stored > capacity {
            return Err(RingError::Capacity { stored, capacity });
        }

        let placement = self.place(stored)?;
        let read = match placement {
            Placement::Restart => Offset::ORIGIN,
            _ => self.header.read,
        };
        let at = match placement {
            Placement::Restart | Placement::Wrap => Offset::ORIGIN,
            Placement::Append | Placement::AppendBehind => self.header.write,
        };
        let end = at.advance(stored, capacity);
        let step = match placement {
            Placement::Restart => Step::Restart { caught: end == read },
            Placement::Append if end.is_origin() => Step::Wrap { caught: read.is_origin() },
            Placement::Append => Step::Append,
            // ending on the reader leaves no room behind it, so the next one is Full anyway
            Placement::Wrap => Step::Wrap { caught: false },
            Placement::AppendBehind => Step::AppendBehind { caught: end >= read },
        };
        let from = match placement {
            Placement::Restart => Topology::Linear,
            _ => self.topology()?,
        };
        let next_mode = from
            .after(step)
            .ok_or_else(|| self.inconsistent(from, "no transition for enqueue"))?;

        self.store.put(at, payload, end).map_err(corrupted)?;
        if placement == Placement::Wrap {
            // the newest record used to end the chain; it now continues at the origin
            self.store
                .relink(self.header.prev_write, Offset::ORIGIN)
                .map_err(corrupted)?;
        }

        self.header.read = read;
        self.header.prev_write = at;
        self.header.write = end;
        self.header.set_topology(next_mode);
        self.header.queued += 1;
        self.header.enqueued_total += 1;
        Ok(payload.len())
    }

    fn inconsistent(&self, mode: Topology, what: &str) -> RingError {
        let header = self.header();
        error!(
            %mode,
            write = header.write_offset().get(),
            read = header.read_offset().get(),
            queued = header.queued(),
            "{}: mode does not match offsets",
            what
        );
        RingError::Corrupted(format!(
            "{} in mode {} (write {}, read {})",
            what,
            mode,
            header.write_offset(),
            header.read_offset()
        ))
    }
}

fn corrupted(fault: RecordFault) -> RingError {
    error!(%fault, "record store write out of bounds");
    RingError::Corrupted(fault.to_string())
}
