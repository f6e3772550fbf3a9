//! Stream kinds and their fixed buffer geometry.
//!
//! Every subsystem is keyed by [`StreamKind`]: the buffer pool allocates per
//! kind, each sensor owns exactly one kind, and the wire protocol tags frame
//! records with it. The geometry of each stream is fixed by the device and
//! captured in [`BufferSpec`].

use serde::{Deserialize, Serialize};
use std::fmt;

/// Upper bound for a serialized body-frame payload. Body frames travel the
/// same pooled-buffer path as pixel frames; the body worker deserializes the
/// joint records out of the buffer.
pub const BODY_FRAME_CAPACITY: usize = 64 * 1024;

/// The four independent streams emitted by the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StreamKind {
    Depth,
    Color,
    Infrared,
    Body,
}

impl StreamKind {
    pub const ALL: [StreamKind; 4] = [
        StreamKind::Depth,
        StreamKind::Color,
        StreamKind::Infrared,
        StreamKind::Body,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Depth => "depth",
            StreamKind::Color => "color",
            StreamKind::Infrared => "infrared",
            StreamKind::Body => "body",
        }
    }

    /// Buffer geometry for this stream.
    ///
    /// Depth and infrared are 16-bit 512x424 rasters, color is RGBA 1920x1080,
    /// body is an opaque serialized region capped at [`BODY_FRAME_CAPACITY`].
    pub fn buffer_spec(self) -> BufferSpec {
        match self {
            StreamKind::Depth => BufferSpec {
                kind: self,
                width: 512,
                height: 424,
                bytes_per_element: 2,
                element_count: 512 * 424,
            },
            StreamKind::Infrared => BufferSpec {
                kind: self,
                width: 512,
                height: 424,
                bytes_per_element: 2,
                element_count: 512 * 424,
            },
            StreamKind::Color => BufferSpec {
                kind: self,
                width: 1920,
                height: 1080,
                bytes_per_element: 4,
                element_count: 1920 * 1080,
            },
            StreamKind::Body => BufferSpec {
                kind: self,
                width: 0,
                height: 0,
                bytes_per_element: 1,
                element_count: BODY_FRAME_CAPACITY,
            },
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Static buffer geometry for one stream kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferSpec {
    pub kind: StreamKind,
    pub width: u32,
    pub height: u32,
    pub bytes_per_element: usize,
    pub element_count: usize,
}

impl BufferSpec {
    pub fn byte_size(&self) -> usize {
        self.element_count * self.bytes_per_element
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_spec_sizes() {
        assert_eq!(StreamKind::Depth.buffer_spec().byte_size(), 512 * 424 * 2);
        assert_eq!(StreamKind::Infrared.buffer_spec().byte_size(), 512 * 424 * 2);
        assert_eq!(StreamKind::Color.buffer_spec().byte_size(), 1920 * 1080 * 4);
        assert_eq!(StreamKind::Body.buffer_spec().byte_size(), BODY_FRAME_CAPACITY);
    }

    #[test]
    fn test_serde_tags() {
        let json = serde_json::to_string(&StreamKind::Infrared).unwrap();
        assert_eq!(json, "\"infrared\"");
        let kind: StreamKind = serde_json::from_str("\"depth\"").unwrap();
        assert_eq!(kind, StreamKind::Depth);
    }
}
