//! In-flight buffer registry

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crossbeam::utils::CachePadded;

use crate::relay::buffer::{BufferHandle, BufferId};

/// Buffers forwarded to the encoder and not yet returned to the camera.
///
/// Holding the handle here keeps the buffer alive while the encoder owns
/// it. The lock is taken for exactly one insert, erase or clear and is
/// never held across a queue call.
#[derive(Default)]
pub struct InFlightRegistry {
    buffers: Mutex<HashMap<BufferId, BufferHandle>>,
    /// Mirror of `buffers.len()` so readers never take the lock
    len: CachePadded<AtomicUsize>,
}

impl InFlightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a forwarded buffer. Returns `false` without replacing anything
    /// if the identity is already in flight.
    pub fn insert(&self, buffer: BufferHandle) -> bool {
        let mut buffers = self.lock();
        if buffers.contains_key(&buffer.id()) {
            return false;
        }
        buffers.insert(buffer.id(), buffer);
        self.len.store(buffers.len(), Ordering::Release);
        true
    }

    /// Stop tracking `id`, handing back the held handle if it was in flight
    pub fn remove(&self, id: BufferId) -> Option<BufferHandle> {
        let mut buffers = self.lock();
        let removed = buffers.remove(&id);
        self.len.store(buffers.len(), Ordering::Release);
        removed
    }

    /// Drop every held handle, returning how many were released
    pub fn clear(&self) -> usize {
        let drained: Vec<BufferHandle> = {
            let mut buffers = self.lock();
            let drained = buffers.drain().map(|(_, handle)| handle).collect();
            self.len.store(0, Ordering::Release);
            drained
        };
        // handles are dropped outside the lock
        drained.len()
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<BufferId, BufferHandle>> {
        self.buffers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Relay counters
#[derive(Default)]
pub(crate) struct Stats {
    pub frames_forwarded: AtomicUsize,
    pub forward_failures: AtomicUsize,
    pub metadata_frames: AtomicUsize,
    pub buffers_returned: AtomicUsize,
    pub return_failures: AtomicUsize,
    pub detach_failures: AtomicUsize,
    pub ignored_releases: AtomicUsize,
}

impl Stats {
    pub fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, in_flight: usize) -> RelayStats {
        RelayStats {
            frames_forwarded: self.frames_forwarded.load(Ordering::Relaxed),
            forward_failures: self.forward_failures.load(Ordering::Relaxed),
            metadata_frames: self.metadata_frames.load(Ordering::Relaxed),
            buffers_returned: self.buffers_returned.load(Ordering::Relaxed),
            return_failures: self.return_failures.load(Ordering::Relaxed),
            detach_failures: self.detach_failures.load(Ordering::Relaxed),
            ignored_releases: self.ignored_releases.load(Ordering::Relaxed),
            in_flight,
        }
    }
}

/// Point-in-time view of the relay counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub frames_forwarded: usize,
    pub forward_failures: usize,
    pub metadata_frames: usize,
    pub buffers_returned: usize,
    pub return_failures: usize,
    pub detach_failures: usize,
    pub ignored_releases: usize,
    pub in_flight: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{BufferUsage, PixelFormat};
    use std::sync::Arc;

    fn buffer() -> BufferHandle {
        BufferHandle::allocate(8, 8, PixelFormat::Nv12, BufferUsage::CPU_READ)
    }

    #[test]
    fn insert_once_remove_once() {
        let registry = InFlightRegistry::new();
        let buf = buffer();
        assert!(registry.insert(buf.clone()));
        assert!(!registry.insert(buf.clone()));
        assert_eq!(registry.len(), 1);

        let removed = registry.remove(buf.id()).unwrap();
        assert!(removed.ptr_eq(&buf));
        assert!(registry.remove(buf.id()).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn registry_keeps_buffers_alive() {
        let registry = InFlightRegistry::new();
        let buf = buffer();
        registry.insert(buf.clone());
        assert_eq!(buf.ref_count(), 2);
        assert_eq!(registry.clear(), 1);
        assert_eq!(buf.ref_count(), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn concurrent_removal_yields_single_owner() {
        let registry = Arc::new(InFlightRegistry::new());
        let buf = buffer();
        registry.insert(buf.clone());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let id = buf.id();
                std::thread::spawn(move || registry.remove(id).is_some())
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn stats_snapshot() {
        let stats = Stats::default();
        Stats::bump(&stats.frames_forwarded);
        Stats::bump(&stats.frames_forwarded);
        Stats::bump(&stats.ignored_releases);
        let snap = stats.snapshot(3);
        assert_eq!(snap.frames_forwarded, 2);
        assert_eq!(snap.ignored_releases, 1);
        assert_eq!(snap.in_flight, 3);
    }
}
