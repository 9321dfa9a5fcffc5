//! Simulated camera writing frames into a producer surface

use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{instrument, warn};

use crate::capture::Rect;
use crate::relay::buffer::BufferId;
use crate::relay::error::QueueError;
use crate::relay::fence::Fence;
use crate::relay::surface::{FlushConfig, ProducerSurface};
use crate::{CameraConfig, RelayConfig};

/// Produces test-pattern frames, optionally tagged with sensor data
pub struct SimulatedCamera {
    producer: Arc<dyn ProducerSurface>,
    config: CameraConfig,
    metadata_tag: u32,
    metadata_size: usize,
    sequence: u64,
}

impl SimulatedCamera {
    pub fn new(producer: Arc<dyn ProducerSurface>, config: CameraConfig, relay: &RelayConfig) -> Self {
        Self {
            producer,
            config,
            metadata_tag: relay.metadata_tag,
            metadata_size: relay.metadata_size,
            sequence: 0,
        }
    }

    /// Frames produced so far
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs(1) / self.config.fps.max(1)
    }

    /// Presentation time of frame `sequence` in nanoseconds, saturating
    fn timestamp_of(&self, sequence: u64) -> i64 {
        let nanos = self
            .frame_interval()
            .as_nanos()
            .saturating_mul(u128::from(sequence));
        i64::try_from(nanos).unwrap_or(i64::MAX)
    }

    /// Fill and submit one frame
    #[instrument(level = "debug", skip(self), fields(sequence = self.sequence))]
    pub fn capture_frame(&mut self) -> Result<BufferId, QueueError> {
        let (buffer, fence) = self.producer.request_buffer()?;
        if let Err(e) = fence.wait() {
            warn!(%buffer, error = %e, "buffer fence wait failed");
            self.producer.cancel_buffer(&buffer)?;
            return Err(QueueError::Backend(e.to_string()));
        }

        let sequence = self.sequence;
        buffer.with_pixels_mut(|pixels| pixels.fill(sequence as u8));

        // buffers are recycled, so a frame without sensor data must not
        // carry the previous frame's blob
        let every = self.config.metadata_every;
        if every > 0 && sequence % every == 0 {
            buffer.set_metadata(self.metadata_tag, sensor_blob(sequence, self.metadata_size));
        } else {
            buffer.erase_metadata(self.metadata_tag);
        }

        let timestamp = self.timestamp_of(sequence);
        let config = FlushConfig {
            damage: Rect::full(buffer.width(), buffer.height()),
            timestamp,
        };
        self.producer.flush_buffer(&buffer, Fence::none(), config)?;
        self.sequence += 1;
        Ok(buffer.id())
    }
}

/// Sensor blob of `len` bytes starting with the little-endian sequence number
pub fn sensor_blob(sequence: u64, len: usize) -> Bytes {
    let mut blob = BytesMut::with_capacity(len);
    for byte in sequence.to_le_bytes().into_iter().take(len) {
        blob.put_u8(byte);
    }
    while blob.len() < len {
        blob.put_u8((blob.len() % 251) as u8);
    }
    blob.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::queue::BufferQueue;
    use crate::relay::surface::ConsumerSurface;

    fn camera(every: u64) -> (BufferQueue, SimulatedCamera) {
        let queue = BufferQueue::new(2);
        queue.set_default_size(16, 16).unwrap();
        let config = CameraConfig {
            buffer_count: 2,
            fps: 30,
            frames: 4,
            metadata_every: every,
        };
        let camera = SimulatedCamera::new(queue.producer().unwrap(), config, &RelayConfig::default());
        (queue, camera)
    }

    #[test]
    fn blob_has_requested_length_and_sequence_prefix() {
        let blob = sensor_blob(0x0102, 768);
        assert_eq!(blob.len(), 768);
        assert_eq!(&blob[..2], &[0x02, 0x01]);
        assert_eq!(sensor_blob(7, 4).len(), 4);
    }

    #[test]
    fn frames_carry_metadata_on_schedule() {
        let (queue, mut camera) = camera(2);
        camera.capture_frame().unwrap();
        let first = queue.acquire_buffer().unwrap();
        assert_eq!(first.buffer.metadata(4101).map(|b| b.len()), Some(768));
        queue.release_buffer(&first.buffer, Fence::none()).unwrap();

        camera.capture_frame().unwrap();
        let second = queue.acquire_buffer().unwrap();
        assert!(second.buffer.metadata(4101).is_none());
        assert!(second.timestamp > first.timestamp);
        assert_eq!(camera.sequence(), 2);
    }

    #[test]
    fn timestamps_keep_rising_past_u32_frames() {
        let (_queue, camera) = camera(1);
        let last_small = u64::from(u32::MAX);
        assert!(camera.timestamp_of(last_small + 1) > camera.timestamp_of(last_small));
        assert_eq!(camera.timestamp_of(u64::MAX), i64::MAX);
        assert_eq!(camera.timestamp_of(0), 0);
    }

    #[test]
    fn exhausted_pool_reports_no_buffer() {
        let (_queue, mut camera) = camera(1);
        camera.capture_frame().unwrap();
        camera.capture_frame().unwrap();
        assert_eq!(camera.capture_frame().unwrap_err(), QueueError::NoBuffer);
    }
}
