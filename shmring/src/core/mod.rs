use std::env;
use std::fmt;
use std::io;
use std::mem;
use std::path::PathBuf;
use std::ptr;
use std::slice;
use std::thread;
use std::time::Duration;

use ::shared_memory::{Shmem, ShmemConf, ShmemError};
use raw_sync::locks::{LockGuard, LockImpl, LockInit, Mutex};
use serde_derive::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::RingError;
use crate::layout::{RecordStore, RingHeader, Word, MAX_CAPACITY, MIN_CAPACITY, WORD_SIZE};
use crate::topology::Topology;

pub const DEFAULT_CAPACITY: usize = 1 << 20;
pub static DEFAULT_RING_NAME: &str = "shmring";

const HEADER_ALIGN: usize = 64;
const LOCK_ATTEMPTS: u32 = 8;
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(1);

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RingConfig {
    /// Directory holding the link file that names the segment.
    pub data_dir: String,
    pub name: String,
    pub capacity_words: usize,
}

impl Default for RingConfig {
    fn default() -> Self {
        RingConfig {
            data_dir: env::temp_dir().to_string_lossy().into_owned(),
            name: DEFAULT_RING_NAME.to_string(),
            capacity_words: DEFAULT_CAPACITY,
        }
    }
}

impl RingConfig {
    pub fn new(data_dir: impl Into<String>, name: impl Into<String>, capacity_words: usize) -> Self {
        RingConfig {
            data_dir: data_dir.into(),
            name: name.into(),
            capacity_words,
        }
    }

    pub fn link_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join(&self.name)
    }

    pub fn validate(&self) -> Result<(), RingError> {
        if self.name.is_empty() {
            return Err(RingError::InvalidConfig("ring name is empty".into()));
        }
        validate_capacity(self.capacity_words)
    }
}

pub(crate) fn validate_capacity(capacity_words: usize) -> Result<(), RingError> {
    if capacity_words < MIN_CAPACITY || capacity_words > MAX_CAPACITY {
        return Err(RingError::InvalidConfig(format!(
            "capacity of {} words is outside {}..={}",
            capacity_words, MIN_CAPACITY, MAX_CAPACITY
        )));
    }
    Ok(())
}

/// OS identifier of a ring's segment, handed to peers out of band.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RingId(String);

impl RingId {
    pub fn new(os_id: impl Into<String>) -> Self {
        RingId(os_id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[inline]
const fn align_up(x: usize, a: usize) -> usize {
    (x + a - 1) & !(a - 1)
}

/// Byte positions inside the segment: `[mutex][pad][RingHeader][store words]`.
#[derive(Copy, Clone, Debug)]
struct SegmentLayout {
    header_at: usize,
    store_at: usize,
}

impl SegmentLayout {
    fn new() -> SegmentLayout {
        let header_at = align_up(Mutex::size_of(None), HEADER_ALIGN);
        SegmentLayout {
            header_at,
            store_at: header_at + mem::size_of::<RingHeader>(),
        }
    }

    fn size_for(&self, capacity_words: usize) -> usize {
        self.store_at + capacity_words * WORD_SIZE
    }
}

/// The only way to reach the header and the store: built while the segment
/// mutex is held and gone when it is released.
pub struct LockedRing<'a> {
    pub(crate) header: &'a mut RingHeader,
    pub(crate) store: RecordStore<'a>,
}

impl<'a> LockedRing<'a> {
    pub(crate) fn new(header: &'a mut RingHeader, words: &'a mut [Word]) -> LockedRing<'a> {
        debug_assert_eq!(header.capacity, words.len());
        LockedRing {
            header,
            store: RecordStore::new(words),
        }
    }

    pub fn header(&self) -> &RingHeader {
        self.header
    }

    pub(crate) fn topology(&self) -> Result<Topology, RingError> {
        self.header
            .topology()
            .map_err(|raw| RingError::Corrupted(format!("unknown topology value {}", raw)))
    }

    pub(crate) fn clear(&mut self) {
        self.header.reset();
    }
}

/// Shared memory segment with its process-shared mutex.
pub struct SharedSegment {
    // Declared before `shmem`: the lock lives inside the mapping.
    lock: Box<dyn LockImpl>,
    shmem: Shmem,
    layout: SegmentLayout,
    capacity: usize,
}

impl SharedSegment {
    /// Creates a segment named by a link file under `cfg.data_dir`.
    pub fn create_linked(cfg: &RingConfig) -> Result<SharedSegment, RingError> {
        cfg.validate()?;
        let layout = SegmentLayout::new();
        let shmem = ShmemConf::new()
            .size(layout.size_for(cfg.capacity_words))
            .flink(cfg.link_path())
            .create()?;
        SharedSegment::init(shmem, layout, cfg.capacity_words)
    }

    /// Creates a segment reachable only through its OS id.
    pub fn create_anonymous(capacity_words: usize) -> Result<SharedSegment, RingError> {
        validate_capacity(capacity_words)?;
        let layout = SegmentLayout::new();
        let shmem = ShmemConf::new()
            .size(layout.size_for(capacity_words))
            .create()?;
        SharedSegment::init(shmem, layout, capacity_words)
    }

    pub fn attach(id: &RingId) -> Result<SharedSegment, RingError> {
        let shmem = ShmemConf::new().os_id(id.as_str()).open()?;
        SharedSegment::open(shmem)
    }

    pub fn attach_linked(cfg: &RingConfig) -> Result<SharedSegment, RingError> {
        let shmem = match ShmemConf::new().flink(cfg.link_path()).open() {
            Ok(v) => v,
            Err(ShmemError::LinkOpenFailed(e)) if e.kind() == io::ErrorKind::NotFound => {
                return Err(RingError::NotARing {
                    id: cfg.link_path().display().to_string(),
                    reason: "no link file".into(),
                })
            }
            Err(e) => return Err(e.into()),
        };
        SharedSegment::open(shmem)
    }

    fn init(shmem: Shmem, layout: SegmentLayout, capacity: usize) -> Result<SharedSegment, RingError> {
        let base = shmem.as_ptr();
        let lock = unsafe {
            let header_ptr = base.add(layout.header_at);
            let (lock, _) = Mutex::new(base, header_ptr).map_err(RingError::lock)?;
            let mut header = RingHeader::new(capacity);
            header.attached = 1;
            ptr::write(header_ptr as *mut RingHeader, header);
            ptr::write_bytes(base.add(layout.store_at), 0, capacity * WORD_SIZE);
            lock
        };
        info!(
            os_id = shmem.get_os_id(),
            capacity_words = capacity,
            bytes = shmem.len(),
            "created ring segment"
        );
        Ok(SharedSegment {
            lock,
            shmem,
            layout,
            capacity,
        })
    }

    fn open(shmem: Shmem) -> Result<SharedSegment, RingError> {
        let layout = SegmentLayout::new();
        let os_id = shmem.get_os_id().to_string();
        if shmem.len() < layout.store_at {
            return Err(RingError::NotARing {
                id: os_id,
                reason: format!("segment of {} bytes is smaller than a header", shmem.len()),
            });
        }
        let base = shmem.as_ptr();
        // magic and capacity are written once by the owner before the id is handed out
        let capacity = unsafe {
            let header = &*(base.add(layout.header_at) as *const RingHeader);
            header.check().map_err(|reason| RingError::NotARing {
                id: os_id.clone(),
                reason,
            })?;
            header.capacity
        };
        if shmem.len() < layout.size_for(capacity) {
            return Err(RingError::NotARing {
                id: os_id,
                reason: format!("segment too small for {} words", capacity),
            });
        }
        let (lock, _) = unsafe { Mutex::from_existing(base, base.add(layout.header_at)) }
            .map_err(RingError::lock)?;
        let segment = SharedSegment {
            lock,
            shmem,
            layout,
            capacity,
        };
        let attached = segment.locked(|ring| {
            ring.header.attached += 1;
            Ok(ring.header.attached)
        })?;
        debug!(os_id = %os_id, attached, "attached to ring segment");
        Ok(segment)
    }

    pub fn id(&self) -> RingId {
        RingId::new(self.shmem.get_os_id())
    }

    pub fn link_path(&self) -> Option<&PathBuf> {
        self.shmem.get_flink_path()
    }

    pub fn is_owner(&self) -> bool {
        self.shmem.is_owner()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Blocks for the mutex. A failed lock call is retried a few times before
    /// the error is surfaced.
    fn acquire(&self) -> Result<LockGuard<'_>, RingError> {
        let mut attempt = 0;
        loop {
            match self.lock.lock() {
                Ok(guard) => return Ok(guard),
                Err(e) => {
                    attempt += 1;
                    if attempt >= LOCK_ATTEMPTS {
                        return Err(RingError::lock(e));
                    }
                    if attempt > 1 {
                        warn!(attempt, error = %e, "ring mutex lock failed, retrying");
                    }
                    thread::sleep(LOCK_RETRY_DELAY * attempt);
                }
            }
        }
    }

    /// Runs `f` with exclusive access to the header and the store.
    pub fn locked<R, F>(&self, f: F) -> Result<R, RingError>
    where
        F: FnOnce(&mut LockedRing<'_>) -> Result<R, RingError>,
    {
        let guard = self.acquire()?;
        let (header, words) = unsafe {
            let header = &mut *(*guard as *mut RingHeader);
            let store = self.shmem.as_ptr().add(self.layout.store_at) as *mut Word;
            (header, slice::from_raw_parts_mut(store, self.capacity))
        };
        let mut ring = LockedRing::new(header, words);
        let result = f(&mut ring);
        drop(guard);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_validate() {
        let cfg = RingConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.link_path(), env::temp_dir().join(DEFAULT_RING_NAME));
    }

    #[test]
    fn config_rejects_bad_capacity() {
        let cfg = RingConfig::new("/tmp", "r", 2);
        assert!(matches!(cfg.validate(), Err(RingError::InvalidConfig(_))));
        let cfg = RingConfig::new("/tmp", "", 16);
        assert!(matches!(cfg.validate(), Err(RingError::InvalidConfig(_))));
    }

    #[test]
    fn layout_keeps_header_aligned() {
        let layout = SegmentLayout::new();
        assert_eq!(layout.header_at % HEADER_ALIGN, 0);
        assert!(layout.header_at >= Mutex::size_of(None));
        assert_eq!(layout.size_for(16) - layout.store_at, 16 * WORD_SIZE);
    }

    #[test]
    fn anonymous_segment_round_trip() {
        let owner = SharedSegment::create_anonymous(32).unwrap();
        assert!(owner.is_owner());
        let peer = SharedSegment::attach(&owner.id()).unwrap();
        assert!(!peer.is_owner());
        assert_eq!(peer.capacity(), 32);
        let attached = owner.locked(|ring| Ok(ring.header().attached)).unwrap();
        assert_eq!(attached, 2);
    }
}
