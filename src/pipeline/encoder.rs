//! In-process encoder input surface

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crossbeam::utils::CachePadded;
use flume::{Receiver, Sender, TrySendError};
use tracing::{debug, warn};

use crate::capture::Rect;
use crate::relay::buffer::{BufferHandle, BufferId};
use crate::relay::error::QueueError;
use crate::relay::fence::Fence;
use crate::relay::surface::{EncoderSurface, FlushConfig, ReleaseCallback};

/// Buffer handed to the encoder for consumption
#[derive(Debug, Clone)]
pub struct EncoderFrame {
    pub buffer: BufferHandle,
    pub timestamp: i64,
    pub damage: Rect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Queued,
    Consuming,
    Released,
}

#[derive(Default)]
struct EncoderStats {
    attached: AtomicUsize,
    released: AtomicUsize,
    detached: AtomicUsize,
}

/// Encoder side of the loopback runtime.
///
/// Attached buffers are queued on a bounded channel for the encoder thread
/// ([`EncoderQueue::next_frame`]); once the encoder is done it calls
/// [`EncoderQueue::release_frame`], which fires the release callback.
pub struct EncoderQueue {
    capacity: usize,
    slots: Mutex<HashMap<BufferId, Slot>>,
    tx: Sender<EncoderFrame>,
    rx: Receiver<EncoderFrame>,
    release_listener: Mutex<Option<Arc<ReleaseCallback>>>,
    stats: CachePadded<EncoderStats>,
}

impl EncoderQueue {
    pub fn new(capacity: usize) -> Arc<Self> {
        let (tx, rx) = flume::bounded(capacity);
        Arc::new(Self {
            capacity,
            slots: Mutex::new(HashMap::new()),
            tx,
            rx,
            release_listener: Mutex::new(None),
            stats: CachePadded::new(EncoderStats::default()),
        })
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<BufferId, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Next attached buffer, waiting up to `timeout`
    pub fn next_frame(&self, timeout: Duration) -> Option<EncoderFrame> {
        let frame = self.rx.recv_timeout(timeout).ok()?;
        if let Some(slot) = self.slots().get_mut(&frame.buffer.id()) {
            *slot = Slot::Consuming;
        }
        Some(frame)
    }

    /// Next attached buffer if one is queued
    pub fn try_next_frame(&self) -> Option<EncoderFrame> {
        let frame = self.rx.try_recv().ok()?;
        if let Some(slot) = self.slots().get_mut(&frame.buffer.id()) {
            *slot = Slot::Consuming;
        }
        Some(frame)
    }

    /// Encoder finished with `buffer`; hand it back through the release
    /// callback
    pub fn release_frame(&self, buffer: BufferHandle, fence: Fence) -> Result<(), QueueError> {
        {
            let mut slots = self.slots();
            let slot = slots
                .get_mut(&buffer.id())
                .ok_or(QueueError::NotOwned(buffer.id()))?;
            if *slot == Slot::Released {
                return Err(QueueError::InvalidArgument("buffer already released"));
            }
            *slot = Slot::Released;
        }
        self.stats.released.fetch_add(1, Ordering::Relaxed);

        let listener = self
            .release_listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match listener {
            Some(callback) => callback(Some(buffer), fence),
            None => warn!(%buffer, "no release listener registered"),
        }
        Ok(())
    }

    /// Buffers currently attached (queued, consuming or awaiting detach)
    pub fn attached_count(&self) -> usize {
        self.slots().len()
    }

    pub fn pending_count(&self) -> usize {
        self.rx.len()
    }

    /// (attached, released, detached)
    pub fn stats(&self) -> (usize, usize, usize) {
        (
            self.stats.attached.load(Ordering::Relaxed),
            self.stats.released.load(Ordering::Relaxed),
            self.stats.detached.load(Ordering::Relaxed),
        )
    }
}

impl EncoderSurface for EncoderQueue {
    fn register_release_listener(&self, callback: ReleaseCallback) -> Result<(), QueueError> {
        *self
            .release_listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(callback));
        Ok(())
    }

    fn attach_and_flush(
        &self,
        buffer: &BufferHandle,
        fence: Fence,
        config: FlushConfig,
    ) -> Result<(), QueueError> {
        fence
            .wait()
            .map_err(|e| QueueError::Backend(e.to_string()))?;

        {
            let mut slots = self.slots();
            if slots.contains_key(&buffer.id()) {
                return Err(QueueError::InvalidArgument("buffer already attached"));
            }
            if slots.len() >= self.capacity {
                return Err(QueueError::Full);
            }
            slots.insert(buffer.id(), Slot::Queued);
        }

        let frame = EncoderFrame {
            buffer: buffer.clone(),
            timestamp: config.timestamp,
            damage: config.damage,
        };
        if let Err(e) = self.tx.try_send(frame) {
            self.slots().remove(&buffer.id());
            return Err(match e {
                TrySendError::Full(_) => QueueError::Full,
                TrySendError::Disconnected(_) => QueueError::Abandoned,
            });
        }
        self.stats.attached.fetch_add(1, Ordering::Relaxed);
        debug!(%buffer, "buffer attached to encoder queue");
        Ok(())
    }

    fn request_and_detach(&self, buffer: &BufferHandle, _fence: &Fence) -> Result<(), QueueError> {
        let mut slots = self.slots();
        match slots.get(&buffer.id()) {
            None => Err(QueueError::NotOwned(buffer.id())),
            Some(Slot::Released) => {
                slots.remove(&buffer.id());
                self.stats.detached.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Some(_) => Err(QueueError::InvalidArgument("buffer still in use by encoder")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{BufferUsage, PixelFormat};

    fn buffer() -> BufferHandle {
        BufferHandle::allocate(32, 32, PixelFormat::Nv12, BufferUsage::CPU_READ)
    }

    #[test]
    fn attach_consume_release_detach() {
        let encoder = EncoderQueue::new(2);
        let released = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&released);
        encoder
            .register_release_listener(Box::new(move |buffer: Option<BufferHandle>, _fence: Fence| {
                sink.lock().unwrap().push(buffer.map(|b| b.id()));
            }))
            .unwrap();

        let buf = buffer();
        let config = FlushConfig {
            damage: Rect::full(32, 32),
            timestamp: 42,
        };
        encoder.attach_and_flush(&buf, Fence::none(), config).unwrap();
        assert_eq!(encoder.attached_count(), 1);

        let frame = encoder.try_next_frame().unwrap();
        assert!(frame.buffer.ptr_eq(&buf));
        assert_eq!(frame.timestamp, 42);
        assert_eq!(frame.damage, Rect::full(32, 32));

        // still being consumed
        assert!(encoder.request_and_detach(&buf, &Fence::none()).is_err());

        encoder.release_frame(frame.buffer, Fence::none()).unwrap();
        assert_eq!(*released.lock().unwrap(), vec![Some(buf.id())]);

        encoder.request_and_detach(&buf, &Fence::none()).unwrap();
        assert_eq!(encoder.attached_count(), 0);
        assert_eq!(encoder.stats(), (1, 1, 1));
    }

    #[test]
    fn attach_beyond_capacity_is_full() {
        let encoder = EncoderQueue::new(1);
        encoder
            .attach_and_flush(&buffer(), Fence::none(), FlushConfig::default())
            .unwrap();
        assert_eq!(
            encoder
                .attach_and_flush(&buffer(), Fence::none(), FlushConfig::default())
                .unwrap_err(),
            QueueError::Full
        );
    }

    #[test]
    fn double_attach_is_rejected() {
        let encoder = EncoderQueue::new(4);
        let buf = buffer();
        encoder
            .attach_and_flush(&buf, Fence::none(), FlushConfig::default())
            .unwrap();
        assert!(encoder
            .attach_and_flush(&buf, Fence::none(), FlushConfig::default())
            .is_err());
        assert_eq!(encoder.pending_count(), 1);
    }

    #[test]
    fn unknown_buffers_cannot_be_released_or_detached() {
        let encoder = EncoderQueue::new(1);
        let buf = buffer();
        assert_eq!(
            encoder.release_frame(buf.clone(), Fence::none()).unwrap_err(),
            QueueError::NotOwned(buf.id())
        );
        assert_eq!(
            encoder.request_and_detach(&buf, &Fence::none()).unwrap_err(),
            QueueError::NotOwned(buf.id())
        );
    }
}
