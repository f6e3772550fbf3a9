//! Frame data types flowing through the pipeline.
//!
//! A [`RawFrame`] carries device bytes in a pooled buffer from the sensor to
//! its worker. The worker turns it into a [`ProcessedFrame`] whose payload is
//! kind-specific. The synchronizer assembles [`SyncBundle`]s from raw device
//! frames. Body tracking adds its own record types, which also serve as the
//! deserialization target for the driver's serialized body stream.

use crate::pool::BufferLease;
use crate::stream::StreamKind;
use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize, Serializer};
use std::collections::BTreeMap;

/// Wall-clock milliseconds, the timestamp base used across the pipeline.
pub fn now_ms() -> u64 {
    Utc::now().timestamp_millis() as u64
}

/// Opaque bytes from the driver plus the capture timestamp, held in a pooled
/// buffer. Dropping the frame returns the buffer.
#[derive(Debug)]
pub struct RawFrame {
    pub kind: StreamKind,
    pub timestamp_ms: u64,
    pub lease: BufferLease,
}

impl RawFrame {
    pub fn bytes(&self) -> &[u8] {
        self.lease.as_slice()
    }
}

/// A worker artifact annotated with sequencing and timing.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessedFrame {
    pub kind: StreamKind,
    pub seq: u64,
    pub captured_at_ms: u64,
    pub emitted_at_ms: u64,
    pub width: u32,
    pub height: u32,
    #[serde(flatten)]
    pub payload: FramePayload,
    pub process_time_ms: f64,
}

/// Kind-specific processed payload.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum FramePayload {
    Depth(DepthArtifact),
    Infrared(InfraredArtifact),
    Color(ColorArtifact),
    Body(BodyArtifact),
}

/// Depth worker output.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DepthArtifact {
    /// Filtered depth values, normalized to `[0, 1]` when normalization is
    /// enabled, raw millimeters otherwise. Unreliable pixels are zero.
    pub processed: Vec<f32>,
    /// Smallest reliable depth observed in the frame, in millimeters.
    pub min_depth: u16,
    /// Largest reliable depth observed in the frame, in millimeters.
    pub max_depth: u16,
    /// Packed `[x, y, z]` triplets for reliable pixels only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub point_cloud: Option<Vec<f32>>,
    /// Packed RGB triplets from the configured color map.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub colorized: Option<Vec<u8>>,
}

/// Infrared worker output.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InfraredArtifact {
    pub processed: Vec<f32>,
    pub format: &'static str,
}

/// Color worker output.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ColorArtifact {
    pub processed: Vec<u8>,
    pub format: &'static str,
    pub compressed: bool,
}

/// Body worker output.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BodyArtifact {
    pub bodies: Vec<TrackedBody>,
    pub timestamp_ms: u64,
}

/// A point in camera space, meters.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub fn add(self, other: Vec3) -> Vec3 {
        Vec3 {
            x: self.x + other.x,
            y: self.y + other.y,
            z: self.z + other.z,
        }
    }

    pub fn sub(self, other: Vec3) -> Vec3 {
        Vec3 {
            x: self.x - other.x,
            y: self.y - other.y,
            z: self.z - other.z,
        }
    }

    pub fn scale(self, factor: f32) -> Vec3 {
        Vec3 {
            x: self.x * factor,
            y: self.y * factor,
            z: self.z * factor,
        }
    }

    pub fn length(self) -> f32 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }
}

/// Hand state reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HandState {
    #[default]
    Unknown,
    NotTracked,
    Open,
    Closed,
    Lasso,
}

/// One joint as delivered by the driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawJoint {
    pub position: Vec3,
    pub tracking_state: u8,
    #[serde(default)]
    pub confidence: f32,
    #[serde(default)]
    pub previous_position: Option<Vec3>,
}

/// One body as delivered by the driver. Joint keys are canonical camelCase
/// names such as `spineMid` and `handRight`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawBody {
    pub tracking_id: u64,
    pub tracked: bool,
    #[serde(default)]
    pub joints: BTreeMap<String, RawJoint>,
    #[serde(default)]
    pub hand_left_state: HandState,
    #[serde(default)]
    pub hand_right_state: HandState,
}

/// A joint after smoothing.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackedJoint {
    pub position: Vec3,
    pub tracking_state: u8,
    pub confidence: f32,
}

/// Axis-aligned bounding box over tracked joints.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

/// One processed body.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackedBody {
    pub tracking_id: u64,
    pub joints: BTreeMap<String, TrackedJoint>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub velocities: Option<BTreeMap<String, Vec3>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub center_of_mass: Option<Vec3>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bounds: Option<Aabb>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    pub hand_left_state: HandState,
    pub hand_right_state: HandState,
}

/// Spine-relative movement vectors for one body between two frames.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MovementEvent {
    pub tracking_id: u64,
    pub joints: BTreeMap<String, Vec3>,
    pub timestamp_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Gesture {
    SwipeLeft,
    SwipeRight,
}

/// A detected swipe gesture.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GestureEvent {
    pub tracking_id: u64,
    pub gesture: Gesture,
    /// Spine-relative horizontal displacement of the right hand, meters.
    pub displacement: f32,
    pub timestamp_ms: u64,
}

/// One raw frame inside a sync bundle.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncedFrame {
    pub kind: StreamKind,
    pub timestamp_ms: u64,
    #[serde(serialize_with = "serialize_bytes")]
    pub data: Bytes,
}

fn serialize_bytes<S: Serializer>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_seq(bytes.iter())
}

/// Frames from different streams aligned within the sync window.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncBundle {
    pub timestamp_ms: u64,
    pub frames: BTreeMap<StreamKind, SyncedFrame>,
    /// `max(ts) - min(ts)` across the bundled frames, milliseconds.
    pub max_delay_ms: u64,
}
