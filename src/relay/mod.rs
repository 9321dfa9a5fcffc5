pub mod buffer;
pub mod engine;
pub mod error;
pub mod fence;
pub mod metadata;
pub mod registry;
pub mod surface;

pub use buffer::{BufferHandle, BufferId, SurfaceBuffer};
pub use engine::{FrameIndex, MetadataCallback, RelayEngine};
pub use error::{BindError, ErrorCode, InitError, QueueError, RelayError};
pub use fence::Fence;
pub use metadata::{MetadataExtractor, ATTRKEY_SENSOR_METADATA, SENSOR_METADATA_SIZE};
pub use registry::{InFlightRegistry, RelayStats};
pub use surface::{
    AcquiredBuffer, BufferListener, ConsumerSurface, EncoderSurface, FlushConfig, ProducerSurface,
    ReleaseCallback, SurfaceFactory,
};
