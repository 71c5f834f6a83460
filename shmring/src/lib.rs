//! Variable-length record queue in shared memory, for producers and consumers
//! living in separate processes.
//!
//! One process creates the ring and hands its id (or link file) to the others,
//! which attach. Records are `[len][next][payload]` word runs chained by
//! offsets, so nothing process-local is ever stored in the segment.

mod backoff;
pub mod core;
mod errors;
pub mod layout;
mod reader;
mod ring;
pub mod topology;
mod writer;


pub use crate::backoff::Backoff;
pub use crate::core::{LockedRing, RingConfig, RingId, SharedSegment, DEFAULT_CAPACITY};
pub use crate::errors::RingError;
pub use crate::layout::{Offset, Word, RECORD_OVERHEAD, WORD_SIZE};
pub use crate::ring::{ProducerGuard, RingBuffer, RingInfo};
pub use crate::topology::Topology;
