use std::io;

use shared_memory::ShmemError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RingError {
    #[error("Shared memory error: {0}")]
    SharedMemory(#[from] ShmemError),
    // raw_sync hands out Box<dyn Error> without Send/Sync, so only the message survives.
    #[error("Lock error: {0}")]
    Lock(String),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Segment {id} does not hold a ring: {reason}")]
    NotARing { id: String, reason: String },
    #[error("A record of {stored} words can never fit in a ring of {capacity} words")]
    Capacity { stored: usize, capacity: usize },
    #[error("Ring is full: no contiguous room for {stored} words")]
    Full { stored: usize },
    #[error("Empty payloads cannot be queued")]
    EmptyPayload,
    #[error("Output buffer holds {available} words but the record has {needed}")]
    BufferTooSmall { needed: usize, available: usize },
    #[error("Ring state is inconsistent: {0}")]
    Corrupted(String),
}

impl RingError {
    /// True only for backpressure: the same call may succeed after a dequeue.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RingError::Full { .. })
    }

    /// Segment, mutex or configuration failures surfaced while building a handle.
    pub fn is_resource(&self) -> bool {
        matches!(
            self,
            RingError::SharedMemory(_)
                | RingError::Lock(_)
                | RingError::Io(_)
                | RingError::InvalidConfig(_)
                | RingError::NotARing { .. }
        )
    }

    pub(crate) fn lock(err: Box<dyn std::error::Error>) -> Self {
        RingError::Lock(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_full_is_retryable() {
        assert!(RingError::Full { stored: 6 }.is_retryable());
        assert!(!RingError::Capacity { stored: 20, capacity: 16 }.is_retryable());
        assert!(!RingError::EmptyPayload.is_retryable());
        assert!(!RingError::Corrupted("mode".into()).is_retryable());
    }

    #[test]
    fn resource_family() {
        assert!(RingError::Lock("pthread_mutex_lock failed".into()).is_resource());
        assert!(RingError::InvalidConfig("capacity".into()).is_resource());
        assert!(!RingError::Full { stored: 6 }.is_resource());
    }
}
