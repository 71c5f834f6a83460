use std::fmt;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::core::{RingConfig, RingId, SharedSegment};
use crate::errors::RingError;
use crate::layout::{Offset, Word};
use crate::topology::Topology;

/// Snapshot of the ring header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RingInfo {
    pub id: RingId,
    pub capacity: usize,
    pub write: Offset,
    pub prev_write: Offset,
    pub read: Offset,
    pub queued: usize,
    pub topology: Topology,
    pub attached: usize,
    pub producers: usize,
    pub enqueued_total: u64,
    pub dequeued_total: u64,
    pub corrupt_records: u64,
}

impl fmt::Display for RingInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ring {} capacity={} write={} prev_write={} read={} queued={} mode={} attached={} producers={} enqueued={} dequeued={} corrupt={}",
            self.id,
            self.capacity,
            self.write.get(),
            self.prev_write.get(),
            self.read.get(),
            self.queued,
            self.topology,
            self.attached,
            self.producers,
            self.enqueued_total,
            self.dequeued_total,
            self.corrupt_records,
        )
    }
}

/// A variable-length record queue in a shared memory segment.
///
/// Every operation takes the segment mutex for its whole duration. Nothing
/// waits for room or for data: `Full` and `None` come back at once and the
/// caller decides how to retry.
///
/// Dropping the handle detaches it. The creating handle also removes the OS
/// segment when dropped; peers that are still attached keep a valid mapping.
pub struct RingBuffer {
    segment: SharedSegment,
    detached: bool,
}

impl RingBuffer {
    /// Creates a ring named by `cfg`, so that peers can use [`RingBuffer::attach_linked`].
    pub fn create(cfg: &RingConfig) -> Result<RingBuffer, RingError> {
        let segment = SharedSegment::create_linked(cfg)?;
        Ok(RingBuffer::from_segment(segment))
    }

    /// Creates a ring known only by its [`RingId`].
    pub fn create_anonymous(capacity_words: usize) -> Result<RingBuffer, RingError> {
        let segment = SharedSegment::create_anonymous(capacity_words)?;
        Ok(RingBuffer::from_segment(segment))
    }

    /// Creates the named ring, or attaches to it when the link file already exists.
    pub fn create_or_attach(cfg: &RingConfig) -> Result<RingBuffer, RingError> {
        match SharedSegment::create_linked(cfg) {
            Ok(v) => Ok(RingBuffer::from_segment(v)),
            Err(RingError::SharedMemory(shared_memory::ShmemError::LinkExists)) => {
                RingBuffer::attach_linked(cfg)
            }
            Err(e) => Err(e),
        }
    }

    pub fn attach(id: &RingId) -> Result<RingBuffer, RingError> {
        let segment = SharedSegment::attach(id)?;
        Ok(RingBuffer::from_segment(segment))
    }

    pub fn attach_linked(cfg: &RingConfig) -> Result<RingBuffer, RingError> {
        let segment = SharedSegment::attach_linked(cfg)?;
        Ok(RingBuffer::from_segment(segment))
    }

    /// Keeps trying [`RingBuffer::attach_linked`] until `timeout` passes.
    ///
    /// The link file appears before the owner has written the header, so a
    /// missing link and a half-built segment are both retried.
    pub fn attach_linked_wait(cfg: &RingConfig, timeout: Duration) -> Result<RingBuffer, RingError> {
        let deadline = Instant::now() + timeout;
        let mut backoff = Backoff::new(Duration::from_millis(50));
        loop {
            match RingBuffer::attach_linked(cfg) {
                Err(e @ RingError::NotARing { .. }) | Err(e @ RingError::SharedMemory(_))
                    if Instant::now() < deadline =>
                {
                    debug!(error = %e, "ring not ready yet");
                    backoff.snooze();
                }
                other => return other,
            }
        }
    }

    fn from_segment(segment: SharedSegment) -> RingBuffer {
        RingBuffer {
            segment,
            detached: false,
        }
    }

    pub fn id(&self) -> RingId {
        self.segment.id()
    }

    pub fn link_path(&self) -> Option<&PathBuf> {
        self.segment.link_path()
    }

    pub fn is_owner(&self) -> bool {
        self.segment.is_owner()
    }

    pub fn capacity(&self) -> usize {
        self.segment.capacity()
    }

    /// Queues `payload`; returns its length in words.
    pub fn enqueue(&self, payload: &[Word]) -> Result<usize, RingError> {
        self.segment.locked(|ring| ring.enqueue(payload))
    }

    /// Copies the oldest record into `out`; `Ok(None)` means empty.
    pub fn dequeue_into(&self, out: &mut [Word]) -> Result<Option<usize>, RingError> {
        self.segment.locked(|ring| ring.dequeue_into(out))
    }

    pub fn dequeue(&self) -> Result<Option<Vec<Word>>, RingError> {
        self.segment.locked(|ring| ring.take())
    }

    pub fn peek(&self) -> Result<Option<Vec<Word>>, RingError> {
        self.segment.locked(|ring| Ok(ring.peek()))
    }

    pub fn count(&self) -> Result<usize, RingError> {
        self.segment.locked(|ring| Ok(ring.header().queued()))
    }

    /// Records queued since the ring was created; not reset by [`RingBuffer::clear`].
    pub fn enqueue_total(&self) -> Result<u64, RingError> {
        self.segment.locked(|ring| Ok(ring.header().enqueued_total))
    }

    /// Records dequeued since the ring was created; not reset by [`RingBuffer::clear`].
    pub fn dequeue_total(&self) -> Result<u64, RingError> {
        self.segment.locked(|ring| Ok(ring.header().dequeued_total))
    }

    pub fn attached(&self) -> Result<usize, RingError> {
        self.segment.locked(|ring| Ok(ring.header().attached))
    }

    /// Drops everything queued. Capacity and lifetime totals are kept.
    pub fn clear(&self) -> Result<(), RingError> {
        self.segment.locked(|ring| {
            ring.clear();
            Ok(())
        })
    }

    /// Clears only when nothing is queued; returns whether it did.
    pub fn try_clear(&self) -> Result<bool, RingError> {
        self.segment.locked(|ring| {
            if ring.header().queued() != 0 {
                return Ok(false);
            }
            ring.clear();
            Ok(true)
        })
    }

    pub fn info(&self) -> Result<RingInfo, RingError> {
        let id = self.id();
        self.segment.locked(|ring| {
            let topology = ring.topology()?;
            let h = ring.header();
            Ok(RingInfo {
                id,
                capacity: h.capacity(),
                write: h.write_offset(),
                prev_write: h.prev_write_offset(),
                read: h.read_offset(),
                queued: h.queued(),
                topology,
                attached: h.attached,
                producers: h.producers,
                enqueued_total: h.enqueued_total,
                dequeued_total: h.dequeued_total,
                corrupt_records: h.corrupt_records,
            })
        })
    }

    /// Registers a producer for as long as the guard lives.
    pub fn producer(&self) -> Result<ProducerGuard<'_>, RingError> {
        self.segment.locked(|ring| {
            ring.header.producers += 1;
            ring.header.producers_seen += 1;
            Ok(())
        })?;
        Ok(ProducerGuard { ring: self })
    }

    /// True once a producer has registered and all of them are gone.
    pub fn is_dead(&self) -> Result<bool, RingError> {
        self.segment.locked(|ring| {
            let h = ring.header();
            Ok(h.producers_seen > 0 && h.producers == 0)
        })
    }

    /// Detaches this handle and, for the owner, releases the OS segment.
    pub fn destroy(mut self) -> Result<(), RingError> {
        let remaining = self.detach()?;
        if self.is_owner() {
            if remaining > 0 {
                warn!(id = %self.id(), remaining, "destroying ring with peers still attached");
            }
            info!(id = %self.id(), "destroying ring");
        }
        Ok(())
    }

    fn detach(&mut self) -> Result<usize, RingError> {
        let remaining = self.segment.locked(|ring| {
            ring.header.attached = ring.header.attached.saturating_sub(1);
            Ok(ring.header.attached)
        })?;
        self.detached = true;
        debug!(id = %self.id(), remaining, "detached from ring");
        Ok(remaining)
    }
}

impl Drop for RingBuffer {
    fn drop(&mut self) {
        if self.detached {
            return;
        }
        if let Err(e) = self.detach() {
            warn!(error = %e, "failed to detach from ring");
        }
    }
}

impl fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingBuffer")
            .field("id", &self.id())
            .field("capacity", &self.capacity())
            .field("owner", &self.is_owner())
            .finish()
    }
}

/// Keeps a producer registered on its ring; see [`RingBuffer::is_dead`].
pub struct ProducerGuard<'r> {
    ring: &'r RingBuffer,
}

impl<'r> ProducerGuard<'r> {
    pub fn ring(&self) -> &RingBuffer {
        self.ring
    }
}

impl<'r> Drop for ProducerGuard<'r> {
    fn drop(&mut self) {
        let result = self.ring.segment.locked(|ring| {
            ring.header.producers = ring.header.producers.saturating_sub(1);
            Ok(())
        });
        if let Err(e) = result {
            warn!(error = %e, "failed to unregister producer");
        }
    }
}
