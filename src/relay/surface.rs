//! Interfaces of the buffer-queue runtime the relay sits between.
//!
//! The camera writes into a [`ProducerSurface`] whose frames surface on the
//! relay's [`ConsumerSurface`]; the relay forwards them into the encoder's
//! [`EncoderSurface`]. Implementations are expected to invoke listeners and
//! release callbacks without holding their own internal locks.

use std::sync::Arc;

use crate::capture::{BufferUsage, PixelFormat, Rect};
use crate::relay::buffer::BufferHandle;
use crate::relay::error::QueueError;
use crate::relay::fence::Fence;

/// Receives "buffer available" notifications from a consumer surface
pub trait BufferListener: Send + Sync {
    fn on_buffer_available(&self);
}

/// Invoked by an encoder surface for every buffer it releases
pub type ReleaseCallback = Box<dyn Fn(Option<BufferHandle>, Fence) + Send + Sync>;

/// Region and timestamp submitted along with a flushed buffer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushConfig {
    pub damage: Rect,
    pub timestamp: i64,
}

/// A buffer taken from a consumer surface
#[derive(Debug)]
pub struct AcquiredBuffer {
    pub buffer: BufferHandle,
    pub fence: Fence,
    pub timestamp: i64,
    pub damage: Rect,
}

/// Creates consumer surfaces; stands in for the queue runtime itself
pub trait SurfaceFactory: Send + Sync {
    /// `None` when the runtime cannot provide a surface
    fn create_consumer(&self) -> Option<Arc<dyn ConsumerSurface>>;
}

/// Consumer side of the camera's buffer queue
pub trait ConsumerSurface: Send + Sync {
    fn set_default_size(&self, width: u32, height: u32) -> Result<(), QueueError>;
    fn set_default_format(&self, format: PixelFormat) -> Result<(), QueueError>;
    fn set_default_usage(&self, usage: BufferUsage) -> Result<(), QueueError>;

    fn register_listener(&self, listener: Arc<dyn BufferListener>) -> Result<(), QueueError>;
    fn unregister_listener(&self);

    /// Producer endpoint feeding this surface
    fn producer(&self) -> Option<Arc<dyn ProducerSurface>>;

    fn acquire_buffer(&self) -> Result<AcquiredBuffer, QueueError>;
    fn release_buffer(&self, buffer: &BufferHandle, fence: Fence) -> Result<(), QueueError>;
}

/// Producer side of a buffer queue, written by the camera
pub trait ProducerSurface: Send + Sync {
    fn request_buffer(&self) -> Result<(BufferHandle, Fence), QueueError>;
    fn flush_buffer(
        &self,
        buffer: &BufferHandle,
        fence: Fence,
        config: FlushConfig,
    ) -> Result<(), QueueError>;
    fn cancel_buffer(&self, buffer: &BufferHandle) -> Result<(), QueueError>;
}

/// Input surface of the encoder
pub trait EncoderSurface: Send + Sync {
    fn register_release_listener(&self, callback: ReleaseCallback) -> Result<(), QueueError>;

    /// Hand a foreign buffer to the queue and queue it for consumption in
    /// one request
    fn attach_and_flush(
        &self,
        buffer: &BufferHandle,
        fence: Fence,
        config: FlushConfig,
    ) -> Result<(), QueueError>;

    /// Take back a released buffer that was attached with
    /// [`EncoderSurface::attach_and_flush`]
    fn request_and_detach(&self, buffer: &BufferHandle, fence: &Fence) -> Result<(), QueueError>;
}
