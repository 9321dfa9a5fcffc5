//! Loopback buffer-queue runtime: a camera queue, an encoder queue and a
//! simulated camera driving them, all in-process.

pub mod camera;
pub mod encoder;
pub mod queue;

pub use camera::SimulatedCamera;
pub use encoder::{EncoderFrame, EncoderQueue};
pub use queue::{BufferQueue, LoopbackRuntime, QueueProducer};
