//! Camera-to-encoder relay engine.
//!
//! Buffers produced by the camera are acquired from the relay's consumer
//! surface, inspected for sensor metadata and attached straight into the
//! encoder surface without copying. When the encoder releases a buffer it
//! is detached again and handed back to the camera queue.
//!
//! Two threads owned by the queue runtime drive the engine: the camera
//! side's "buffer available" notifications and the encoder side's release
//! callbacks. The in-flight registry is the only state both paths mutate.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use arc_swap::ArcSwapOption;
use bytes::Bytes;
use crossbeam::utils::CachePadded;
use tracing::{debug, error, info, instrument, warn};

use crate::capture::{BufferUsage, PixelFormat, Rect};
use crate::relay::buffer::BufferHandle;
use crate::relay::error::{BindError, InitError, QueueError, RelayError};
use crate::relay::fence::Fence;
use crate::relay::metadata::MetadataExtractor;
use crate::relay::registry::{InFlightRegistry, RelayStats, Stats};
use crate::relay::surface::{
    AcquiredBuffer, BufferListener, ConsumerSurface, EncoderSurface, FlushConfig, ProducerSurface,
    SurfaceFactory,
};
use crate::RelayConfig;

/// Per-frame counter; wraps at `u32::MAX`
pub type FrameIndex = u32;

/// Receives `(frame index, metadata blob)` for frames carrying sensor data
pub type MetadataCallback = Box<dyn Fn(FrameIndex, Bytes) + Send + Sync>;

/// Usage requested for camera buffers: CPU readable, DMA capable
pub const CAMERA_BUFFER_USAGE: BufferUsage = BufferUsage::CPU_READ.union(BufferUsage::MEM_DMA);

type Slot<T> = ArcSwapOption<Arc<T>>;

fn load<T: ?Sized>(slot: &Slot<T>) -> Option<Arc<T>> {
    slot.load().as_deref().cloned()
}

/// Relays camera buffers into an encoder surface.
///
/// An engine is single-use: `initialize`, optionally `bind_downstream`
/// and `set_metadata_callback`, operate, then `release`.
pub struct RelayEngine {
    this: Weak<RelayEngine>,
    factory: Arc<dyn SurfaceFactory>,
    extractor: MetadataExtractor,

    camera_consumer: Slot<dyn ConsumerSurface>,
    camera_producer: Slot<dyn ProducerSurface>,
    encoder: Slot<dyn EncoderSurface>,
    metadata_callback: ArcSwapOption<MetadataCallback>,

    registry: InFlightRegistry,
    frame_index: AtomicU32,
    claimed: AtomicBool,
    running: AtomicBool,
    stats: CachePadded<Stats>,
}

impl RelayEngine {
    pub fn new(factory: Arc<dyn SurfaceFactory>, config: &RelayConfig) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            factory,
            extractor: MetadataExtractor::new(config.metadata_tag, config.metadata_size),
            camera_consumer: ArcSwapOption::empty(),
            camera_producer: ArcSwapOption::empty(),
            encoder: ArcSwapOption::empty(),
            metadata_callback: ArcSwapOption::empty(),
            registry: InFlightRegistry::new(),
            frame_index: AtomicU32::new(0),
            claimed: AtomicBool::new(false),
            running: AtomicBool::new(false),
            stats: CachePadded::new(Stats::default()),
        })
    }

    /// Create the camera-facing consumer surface and start listening on it.
    ///
    /// The engine only starts running once every step succeeded; on failure
    /// anything created so far is dropped and the call may be retried.
    #[instrument(skip(self))]
    pub fn initialize(&self, width: u32, height: u32, format: PixelFormat) -> Result<(), InitError> {
        if width == 0 || height == 0 {
            return Err(InitError::InvalidGeometry { width, height });
        }
        if self
            .claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(InitError::AlreadyInitialized);
        }

        match self.open_camera_surface(width, height, format) {
            Ok((consumer, producer)) => {
                self.camera_consumer.store(Some(Arc::new(consumer)));
                self.camera_producer.store(Some(Arc::new(producer)));
                self.running.store(true, Ordering::Release);
                info!("relay engine initialized");
                Ok(())
            }
            Err(e) => {
                self.claimed.store(false, Ordering::Release);
                error!(error = %e, "relay engine initialization failed");
                Err(e)
            }
        }
    }

    fn open_camera_surface(
        &self,
        width: u32,
        height: u32,
        format: PixelFormat,
    ) -> Result<(Arc<dyn ConsumerSurface>, Arc<dyn ProducerSurface>), InitError> {
        let consumer = self
            .factory
            .create_consumer()
            .ok_or(InitError::SurfaceCreation)?;

        consumer
            .set_default_size(width, height)
            .map_err(InitError::Configure)?;
        consumer
            .set_default_format(format)
            .map_err(InitError::Configure)?;
        consumer
            .set_default_usage(CAMERA_BUFFER_USAGE)
            .map_err(InitError::Configure)?;

        let listener = Arc::new(EngineListener(self.this.clone()));
        consumer
            .register_listener(listener)
            .map_err(InitError::ListenerRegistration)?;

        match consumer.producer() {
            Some(producer) => Ok((consumer, producer)),
            None => {
                consumer.unregister_listener();
                Err(InitError::ProducerUnavailable)
            }
        }
    }

    /// Producer surface the camera should write frames into
    pub fn upstream_handle(&self) -> Option<Arc<dyn ProducerSurface>> {
        load(&self.camera_producer)
    }

    /// Attach the encoder input surface and route its releases back here
    #[instrument(skip_all)]
    pub fn bind_downstream(&self, encoder: Option<Arc<dyn EncoderSurface>>) -> Result<(), BindError> {
        let Some(encoder) = encoder else {
            error!("encoder surface is null");
            return Err(BindError::InvalidHandle);
        };

        let engine = self.this.clone();
        encoder
            .register_release_listener(Box::new(move |buffer: Option<BufferHandle>, fence: Fence| {
                let Some(engine) = engine.upgrade() else {
                    return;
                };
                if let Err(e) = engine.handle_release(buffer, fence) {
                    error!(error = %e, code = e.code().as_i32(), "encoder release handling failed");
                }
            }))
            .map_err(|e| {
                error!(error = %e, "register release listener failed");
                BindError::RegistrationFailed(e)
            })?;

        self.encoder.store(Some(Arc::new(encoder)));
        info!("encoder surface bound");
        Ok(())
    }

    pub fn set_metadata_callback<F>(&self, callback: F)
    where
        F: Fn(FrameIndex, Bytes) + Send + Sync + 'static,
    {
        self.metadata_callback
            .store(Some(Arc::new(Box::new(callback) as MetadataCallback)));
    }

    pub fn clear_metadata_callback(&self) {
        self.metadata_callback.store(None);
    }

    #[instrument(level = "debug", skip_all)]
    fn relay_from_camera(&self) {
        let (Some(camera), Some(encoder)) = (load(&self.camera_consumer), load(&self.encoder))
        else {
            debug!("surfaces not ready");
            return;
        };

        let AcquiredBuffer {
            buffer,
            fence,
            timestamp,
            damage,
        } = match camera.acquire_buffer() {
            Ok(acquired) => acquired,
            Err(e) => {
                debug!(error = %e, "acquire from camera failed");
                return;
            }
        };
        debug!(%buffer, timestamp, fence = fence.raw(), ?damage, "acquired buffer from camera");

        if let Err(e) = fence.wait() {
            warn!(%buffer, error = %e, "camera fence wait failed");
            self.return_unforwarded(camera.as_ref(), &buffer);
            return;
        }
        fence.close();

        let index = self.frame_index.load(Ordering::Acquire);
        if let Some(blob) = self.extractor.extract(&buffer) {
            Stats::bump(&self.stats.metadata_frames);
            debug!(frame = index, len = blob.len(), "extracted sensor metadata");
            if let Some(callback) = self.metadata_callback.load_full() {
                callback(index, blob);
            }
        }

        // Registered before the encoder can see it, so a fast release
        // always finds its entry.
        if !self.registry.insert(buffer.clone()) {
            error!(%buffer, "buffer is already in flight, not forwarding");
            self.return_unforwarded(camera.as_ref(), &buffer);
            return;
        }

        match self.attach_to_encoder(encoder.as_ref(), &buffer, timestamp) {
            Ok(()) => {
                self.frame_index.fetch_add(1, Ordering::AcqRel);
                Stats::bump(&self.stats.frames_forwarded);
                metrics::counter!("relay_frames_forwarded").increment(1);
            }
            Err(e) => {
                error!(error = %e, "attach buffer to encoder failed");
                self.registry.remove(buffer.id());
                Stats::bump(&self.stats.forward_failures);
                metrics::counter!("relay_forward_failures").increment(1);
                self.return_unforwarded(camera.as_ref(), &buffer);
            }
        }
    }

    fn attach_to_encoder(
        &self,
        encoder: &dyn EncoderSurface,
        buffer: &BufferHandle,
        timestamp: i64,
    ) -> Result<(), RelayError> {
        let config = FlushConfig {
            damage: Rect::full(buffer.width(), buffer.height()),
            timestamp,
        };
        encoder
            .attach_and_flush(buffer, Fence::none(), config)
            .map_err(|source| RelayError::ForwardFailed {
                id: buffer.id(),
                source,
            })?;
        debug!(%buffer, "buffer attached to encoder");
        Ok(())
    }

    fn return_unforwarded(&self, camera: &dyn ConsumerSurface, buffer: &BufferHandle) {
        if let Err(e) = camera.release_buffer(buffer, Fence::none()) {
            error!(%buffer, error = %e, "release buffer back to camera failed");
            Stats::bump(&self.stats.return_failures);
            metrics::counter!("relay_return_failures").increment(1);
        }
    }

    /// Take a buffer released by the encoder and give it back to the camera.
    ///
    /// A release for a buffer that is not in flight is ignored. Failing to
    /// return the buffer to the camera is reported, since the camera pool
    /// shrinks by one buffer; it is not retried.
    #[instrument(level = "debug", skip_all)]
    pub fn handle_release(&self, buffer: Option<BufferHandle>, fence: Fence) -> Result<(), RelayError> {
        if !self.is_running() {
            debug!("release after teardown ignored");
            return Ok(());
        }
        let Some(buffer) = buffer else {
            error!("released buffer is null");
            return Ok(());
        };
        debug!(%buffer, fence = fence.raw(), "encoder released buffer");

        let Some(buffer) = self.registry.remove(buffer.id()) else {
            warn!(%buffer, "release for buffer not in flight ignored");
            Stats::bump(&self.stats.ignored_releases);
            metrics::counter!("relay_ignored_releases").increment(1);
            return Ok(());
        };

        match load(&self.encoder) {
            Some(encoder) => {
                if let Err(e) = encoder.request_and_detach(&buffer, &fence) {
                    warn!(%buffer, error = %e, "detach from encoder failed");
                    Stats::bump(&self.stats.detach_failures);
                }
            }
            None => warn!(%buffer, "encoder surface gone before detach"),
        }

        self.return_to_camera(&buffer, fence)
    }

    fn return_to_camera(&self, buffer: &BufferHandle, fence: Fence) -> Result<(), RelayError> {
        let result = match load(&self.camera_consumer) {
            Some(camera) => camera.release_buffer(buffer, fence),
            None => Err(QueueError::Abandoned),
        };
        match result {
            Ok(()) => {
                Stats::bump(&self.stats.buffers_returned);
                metrics::counter!("relay_buffers_returned").increment(1);
                debug!(%buffer, "buffer returned to camera");
                Ok(())
            }
            Err(source) => {
                Stats::bump(&self.stats.return_failures);
                metrics::counter!("relay_return_failures").increment(1);
                Err(RelayError::ReturnFailed {
                    id: buffer.id(),
                    source,
                })
            }
        }
    }

    /// Stop relaying and drop both surfaces and every in-flight buffer.
    /// Safe to call more than once.
    pub fn release(&self) {
        let was_running = self.running.swap(false, Ordering::AcqRel);

        if let Some(camera) = self.camera_consumer.swap(None) {
            camera.unregister_listener();
        }
        self.camera_producer.store(None);
        self.encoder.store(None);

        let dropped = self.registry.clear();
        if was_running {
            info!(dropped, "relay engine released");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Index the next forwarded frame will carry
    pub fn frame_index(&self) -> FrameIndex {
        self.frame_index.load(Ordering::Acquire)
    }

    pub fn in_flight(&self) -> usize {
        self.registry.len()
    }

    pub fn stats(&self) -> RelayStats {
        self.stats.snapshot(self.registry.len())
    }

    pub fn extractor(&self) -> MetadataExtractor {
        self.extractor
    }
}

impl BufferListener for RelayEngine {
    fn on_buffer_available(&self) {
        if !self.is_running() {
            return;
        }
        self.relay_from_camera();
    }
}

impl Drop for RelayEngine {
    fn drop(&mut self) {
        self.release();
    }
}

/// Listener handed to the camera surface; does not keep the engine alive
struct EngineListener(Weak<RelayEngine>);

impl BufferListener for EngineListener {
    fn on_buffer_available(&self) {
        if let Some(engine) = self.0.upgrade() {
            engine.on_buffer_available();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex;

    use crate::pipeline::{EncoderQueue, LoopbackRuntime, SimulatedCamera};
    use crate::relay::metadata::SENSOR_METADATA_SIZE;
    use crate::CameraConfig;

    #[test]
    fn frame_index_wraps_at_u32_max() {
        let relay = RelayConfig {
            width: 32,
            height: 32,
            ..RelayConfig::default()
        };
        let engine = RelayEngine::new(LoopbackRuntime::new(2), &relay);
        engine
            .initialize(relay.width, relay.height, relay.format)
            .unwrap();
        engine
            .bind_downstream(Some(EncoderQueue::new(2) as Arc<dyn EncoderSurface>))
            .unwrap();
        engine.frame_index.store(FrameIndex::MAX, Ordering::Release);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        engine.set_metadata_callback(move |frame, blob| {
            sink.lock().unwrap().push((frame, blob.len()));
        });

        let mut camera = SimulatedCamera::new(
            engine.upstream_handle().unwrap(),
            CameraConfig::default(),
            &relay,
        );
        camera.capture_frame().unwrap();
        camera.capture_frame().unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![(u32::MAX, SENSOR_METADATA_SIZE), (0, SENSOR_METADATA_SIZE)]
        );
        assert_eq!(engine.frame_index(), 1);
        assert_eq!(engine.stats().frames_forwarded, 2);
    }

    #[test]
    fn camera_usage_is_cpu_read_and_dma() {
        assert!(CAMERA_BUFFER_USAGE.contains(BufferUsage::CPU_READ));
        assert!(CAMERA_BUFFER_USAGE.contains(BufferUsage::MEM_DMA));
        assert!(!CAMERA_BUFFER_USAGE.contains(BufferUsage::CPU_WRITE));
    }
}
