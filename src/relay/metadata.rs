//! Sensor metadata side-channel carried on camera buffers

use bytes::Bytes;
use tracing::{debug, warn};

use crate::relay::buffer::SurfaceBuffer;

/// Attribute tag under which the camera attaches per-frame sensor data
pub const ATTRKEY_SENSOR_METADATA: u32 = 4101;

/// Exact size of a well-formed sensor data blob
pub const SENSOR_METADATA_SIZE: usize = 768;

/// Pulls a fixed-size metadata blob out of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetadataExtractor {
    tag: u32,
    expected_len: usize,
}

impl Default for MetadataExtractor {
    fn default() -> Self {
        Self::new(ATTRKEY_SENSOR_METADATA, SENSOR_METADATA_SIZE)
    }
}

impl MetadataExtractor {
    pub const fn new(tag: u32, expected_len: usize) -> Self {
        Self { tag, expected_len }
    }

    pub const fn tag(&self) -> u32 {
        self.tag
    }

    pub const fn expected_len(&self) -> usize {
        self.expected_len
    }

    /// Blob attached under the configured tag, if present with the exact
    /// expected length. Anything else means "no metadata for this frame".
    pub fn extract(&self, buffer: &SurfaceBuffer) -> Option<Bytes> {
        let Some(blob) = buffer.metadata(self.tag) else {
            debug!(tag = self.tag, "no sensor metadata attached");
            return None;
        };
        if blob.len() != self.expected_len {
            warn!(
                tag = self.tag,
                len = blob.len(),
                expected = self.expected_len,
                "sensor metadata size mismatch"
            );
            return None;
        }
        Some(blob)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{BufferUsage, PixelFormat};
    use crate::relay::buffer::BufferHandle;

    fn buffer() -> BufferHandle {
        BufferHandle::allocate(64, 64, PixelFormat::Nv12, BufferUsage::CPU_READ)
    }

    #[test]
    fn exact_size_is_extracted() {
        let buf = buffer();
        let blob: Vec<u8> = (0..SENSOR_METADATA_SIZE).map(|i| i as u8).collect();
        buf.set_metadata(ATTRKEY_SENSOR_METADATA, blob.clone());
        let extracted = MetadataExtractor::default().extract(&buf).unwrap();
        assert_eq!(&extracted[..], &blob[..]);
    }

    #[test]
    fn absent_attribute_yields_nothing() {
        assert!(MetadataExtractor::default().extract(&buffer()).is_none());
    }

    #[test]
    fn wrong_length_yields_nothing() {
        let buf = buffer();
        buf.set_metadata(ATTRKEY_SENSOR_METADATA, vec![0u8; SENSOR_METADATA_SIZE - 1]);
        assert!(MetadataExtractor::default().extract(&buf).is_none());
        buf.set_metadata(ATTRKEY_SENSOR_METADATA, vec![0u8; SENSOR_METADATA_SIZE + 1]);
        assert!(MetadataExtractor::default().extract(&buf).is_none());
        buf.set_metadata(ATTRKEY_SENSOR_METADATA, Vec::<u8>::new());
        assert!(MetadataExtractor::default().extract(&buf).is_none());
    }

    #[test]
    fn other_tags_are_ignored() {
        let buf = buffer();
        buf.set_metadata(ATTRKEY_SENSOR_METADATA + 1, vec![0u8; SENSOR_METADATA_SIZE]);
        assert!(MetadataExtractor::default().extract(&buf).is_none());
    }

    #[test]
    fn custom_tag_and_size() {
        let buf = buffer();
        buf.set_metadata(9, vec![5u8; 16]);
        let extractor = MetadataExtractor::new(9, 16);
        assert_eq!(extractor.extract(&buf).map(|b| b.len()), Some(16));
    }
}
