//! Shared image buffers handed between surfaces

use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;

use crate::capture::{BufferUsage, PixelFormat};

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

/// Stable identity of a buffer for its whole lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(u64);

impl BufferId {
    fn next() -> Self {
        BufferId(NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Image buffer allocated by a queue runtime.
///
/// The pixel memory belongs to the runtime that allocated it and is freed
/// when the last [`BufferHandle`] referencing it is dropped. Metadata
/// attributes are opaque byte blobs keyed by a numeric tag.
pub struct SurfaceBuffer {
    id: BufferId,
    width: u32,
    height: u32,
    stride: u32,
    format: PixelFormat,
    usage: BufferUsage,
    memory: Mutex<Box<[u8]>>,
    metadata: Mutex<HashMap<u32, Bytes>>,
}

impl SurfaceBuffer {
    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn stride(&self) -> u32 {
        self.stride
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn usage(&self) -> BufferUsage {
        self.usage
    }

    pub fn size(&self) -> usize {
        self.format.image_size(self.width, self.height)
    }

    /// Attach (or replace) a metadata attribute
    pub fn set_metadata(&self, tag: u32, value: impl Into<Bytes>) {
        self.lock_metadata().insert(tag, value.into());
    }

    /// Metadata attribute for `tag`, if present
    pub fn metadata(&self, tag: u32) -> Option<Bytes> {
        self.lock_metadata().get(&tag).cloned()
    }

    pub fn erase_metadata(&self, tag: u32) -> Option<Bytes> {
        self.lock_metadata().remove(&tag)
    }

    /// Run `f` with write access to the pixel memory
    pub fn with_pixels_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut memory = self.memory.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut memory)
    }

    /// Run `f` with read access to the pixel memory
    pub fn with_pixels<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let memory = self.memory.lock().unwrap_or_else(PoisonError::into_inner);
        f(&memory)
    }

    fn lock_metadata(&self) -> std::sync::MutexGuard<'_, HashMap<u32, Bytes>> {
        self.metadata.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for SurfaceBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SurfaceBuffer")
            .field("id", &self.id)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .finish_non_exhaustive()
    }
}

/// Reference-counted handle to a [`SurfaceBuffer`].
///
/// Cloning shares ownership; nothing in the relay frees buffer memory
/// directly.
#[derive(Clone, Debug)]
pub struct BufferHandle(Arc<SurfaceBuffer>);

impl BufferHandle {
    /// Allocate a zero-filled buffer with a fresh identity
    pub fn allocate(width: u32, height: u32, format: PixelFormat, usage: BufferUsage) -> Self {
        let size = format.image_size(width, height);
        Self(Arc::new(SurfaceBuffer {
            id: BufferId::next(),
            width,
            height,
            stride: format.row_stride(width) as u32,
            format,
            usage,
            memory: Mutex::new(vec![0u8; size].into_boxed_slice()),
            metadata: Mutex::new(HashMap::new()),
        }))
    }

    pub fn id(&self) -> BufferId {
        self.0.id
    }

    /// Number of live handles sharing this buffer
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    pub fn ptr_eq(&self, other: &BufferHandle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Deref for BufferHandle {
    type Target = SurfaceBuffer;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Display for BufferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}x{} {}",
            self.0.id, self.0.width, self.0.height, self.0.format
        )
    }
}
