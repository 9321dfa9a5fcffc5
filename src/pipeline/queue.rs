//! In-process buffer queue backing the camera side of the relay

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crossbeam::utils::CachePadded;
use tracing::{debug, info};

use crate::capture::{BufferUsage, PixelFormat};
use crate::relay::buffer::{BufferHandle, BufferId};
use crate::relay::error::QueueError;
use crate::relay::fence::Fence;
use crate::relay::surface::{
    AcquiredBuffer, BufferListener, ConsumerSurface, FlushConfig, ProducerSurface, SurfaceFactory,
};

/// Creates [`BufferQueue`]s with a fixed number of buffer slots
pub struct LoopbackRuntime {
    capacity: usize,
    queues: Mutex<Vec<Weak<BufferQueue>>>,
}

impl LoopbackRuntime {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            queues: Mutex::new(Vec::new()),
        })
    }

    /// Most recently created queue that is still alive
    pub fn last_queue(&self) -> Option<Arc<BufferQueue>> {
        let queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        queues.last().and_then(Weak::upgrade)
    }
}

impl SurfaceFactory for LoopbackRuntime {
    fn create_consumer(&self) -> Option<Arc<dyn ConsumerSurface>> {
        if self.capacity == 0 {
            return None;
        }
        let queue = Arc::new(BufferQueue::new(self.capacity));
        let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        queues.retain(|q| q.strong_count() > 0);
        queues.push(Arc::downgrade(&queue));
        Some(queue)
    }
}

struct QueueState {
    width: u32,
    height: u32,
    format: PixelFormat,
    usage: BufferUsage,
    allocated: usize,
    free: VecDeque<(BufferHandle, Fence)>,
    dequeued: HashMap<BufferId, BufferHandle>,
    queued: VecDeque<AcquiredBuffer>,
    acquired: HashMap<BufferId, BufferHandle>,
    abandoned: bool,
}

#[derive(Default)]
struct QueueStats {
    flushed: AtomicUsize,
    acquired: AtomicUsize,
    released: AtomicUsize,
}

struct QueueCore {
    capacity: usize,
    state: Mutex<QueueState>,
    listener: Mutex<Option<Arc<dyn BufferListener>>>,
    stats: CachePadded<QueueStats>,
}

impl QueueCore {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn listener(&self) -> Option<Arc<dyn BufferListener>> {
        self.listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_listener(&self, listener: Option<Arc<dyn BufferListener>>) {
        *self.listener.lock().unwrap_or_else(PoisonError::into_inner) = listener;
    }
}

/// Consumer end of a bounded producer/consumer buffer queue.
///
/// Buffers cycle free → dequeued (producer) → queued → acquired (consumer)
/// → free. Dropping the consumer abandons the queue; the producer end then
/// fails every request.
pub struct BufferQueue {
    core: Arc<QueueCore>,
}

impl BufferQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            core: Arc::new(QueueCore {
                capacity,
                state: Mutex::new(QueueState {
                    width: 0,
                    height: 0,
                    format: PixelFormat::Nv12,
                    usage: BufferUsage::default(),
                    allocated: 0,
                    free: VecDeque::new(),
                    dequeued: HashMap::new(),
                    queued: VecDeque::new(),
                    acquired: HashMap::new(),
                    abandoned: false,
                }),
                listener: Mutex::new(None),
                stats: CachePadded::new(QueueStats::default()),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.core.capacity
    }

    pub fn usage(&self) -> BufferUsage {
        self.core.lock().usage
    }

    pub fn has_listener(&self) -> bool {
        self.core.listener().is_some()
    }

    pub fn free_count(&self) -> usize {
        let state = self.core.lock();
        state.free.len() + (self.core.capacity - state.allocated)
    }

    pub fn queued_count(&self) -> usize {
        self.core.lock().queued.len()
    }

    pub fn acquired_count(&self) -> usize {
        self.core.lock().acquired.len()
    }

    /// (flushed, acquired, released)
    pub fn stats(&self) -> (usize, usize, usize) {
        (
            self.core.stats.flushed.load(Ordering::Relaxed),
            self.core.stats.acquired.load(Ordering::Relaxed),
            self.core.stats.released.load(Ordering::Relaxed),
        )
    }
}

impl Drop for BufferQueue {
    fn drop(&mut self) {
        self.core.set_listener(None);
        let mut state = self.core.lock();
        state.abandoned = true;
        state.free.clear();
        state.queued.clear();
        state.acquired.clear();
        debug!("buffer queue abandoned");
    }
}

impl ConsumerSurface for BufferQueue {
    fn set_default_size(&self, width: u32, height: u32) -> Result<(), QueueError> {
        if width == 0 || height == 0 {
            return Err(QueueError::InvalidArgument("zero buffer size"));
        }
        let mut state = self.core.lock();
        state.width = width;
        state.height = height;
        Ok(())
    }

    fn set_default_format(&self, format: PixelFormat) -> Result<(), QueueError> {
        self.core.lock().format = format;
        Ok(())
    }

    fn set_default_usage(&self, usage: BufferUsage) -> Result<(), QueueError> {
        self.core.lock().usage = usage;
        Ok(())
    }

    fn register_listener(&self, listener: Arc<dyn BufferListener>) -> Result<(), QueueError> {
        self.core.set_listener(Some(listener));
        Ok(())
    }

    fn unregister_listener(&self) {
        self.core.set_listener(None);
    }

    fn producer(&self) -> Option<Arc<dyn ProducerSurface>> {
        Some(Arc::new(QueueProducer {
            core: Arc::clone(&self.core),
        }))
    }

    fn acquire_buffer(&self) -> Result<AcquiredBuffer, QueueError> {
        let mut state = self.core.lock();
        let acquired = state.queued.pop_front().ok_or(QueueError::NoBuffer)?;
        state
            .acquired
            .insert(acquired.buffer.id(), acquired.buffer.clone());
        self.core.stats.acquired.fetch_add(1, Ordering::Relaxed);
        Ok(acquired)
    }

    fn release_buffer(&self, buffer: &BufferHandle, fence: Fence) -> Result<(), QueueError> {
        let mut state = self.core.lock();
        let buffer = state
            .acquired
            .remove(&buffer.id())
            .ok_or(QueueError::NotOwned(buffer.id()))?;
        state.free.push_back((buffer, fence));
        self.core.stats.released.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Producer end of a [`BufferQueue`]
pub struct QueueProducer {
    core: Arc<QueueCore>,
}

impl ProducerSurface for QueueProducer {
    fn request_buffer(&self) -> Result<(BufferHandle, Fence), QueueError> {
        let mut state = self.core.lock();
        if state.abandoned {
            return Err(QueueError::Abandoned);
        }

        let (width, height, format, usage) = (state.width, state.height, state.format, state.usage);
        let (buffer, fence) = loop {
            match state.free.pop_front() {
                Some((buffer, fence))
                    if buffer.width() == width
                        && buffer.height() == height
                        && buffer.format() == format =>
                {
                    break (buffer, fence)
                }
                // stale geometry, reallocate below
                Some(_) => state.allocated -= 1,
                None if state.allocated < self.core.capacity => {
                    state.allocated += 1;
                    let buffer = BufferHandle::allocate(width, height, format, usage);
                    info!(%buffer, "allocated queue buffer");
                    break (buffer, Fence::none());
                }
                None => return Err(QueueError::NoBuffer),
            }
        };
        state.dequeued.insert(buffer.id(), buffer.clone());
        Ok((buffer, fence))
    }

    fn flush_buffer(
        &self,
        buffer: &BufferHandle,
        fence: Fence,
        config: FlushConfig,
    ) -> Result<(), QueueError> {
        {
            let mut state = self.core.lock();
            if state.abandoned {
                return Err(QueueError::Abandoned);
            }
            let buffer = state
                .dequeued
                .remove(&buffer.id())
                .ok_or(QueueError::NotOwned(buffer.id()))?;
            state.queued.push_back(AcquiredBuffer {
                buffer,
                fence,
                timestamp: config.timestamp,
                damage: config.damage,
            });
        }
        self.core.stats.flushed.fetch_add(1, Ordering::Relaxed);

        if let Some(listener) = self.core.listener() {
            listener.on_buffer_available();
        }
        Ok(())
    }

    fn cancel_buffer(&self, buffer: &BufferHandle) -> Result<(), QueueError> {
        let mut state = self.core.lock();
        let buffer = state
            .dequeued
            .remove(&buffer.id())
            .ok_or(QueueError::NotOwned(buffer.id()))?;
        state.free.push_back((buffer, Fence::none()));
        Ok(())
    }
}
