//! Device driver abstraction.
//!
//! The service never talks to camera hardware directly; it holds an
//! `Arc<dyn DepthCamera>` and consumes the driver's event stream. Stream
//! open/close calls answer with plain booleans: a refused open is a
//! stopped-sensor outcome, not an error that tears anything down.

pub mod mock;

use crate::stream::StreamKind;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;

/// LED colors supported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedColor {
    Off,
    Green,
    Red,
    Yellow,
    BlinkGreen,
}

impl fmt::Display for LedColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LedColor::Off => "off",
            LedColor::Green => "green",
            LedColor::Red => "red",
            LedColor::Yellow => "yellow",
            LedColor::BlinkGreen => "blink_green",
        };
        f.write_str(name)
    }
}

/// One raw frame emitted by the driver.
#[derive(Debug, Clone)]
pub struct DeviceFrame {
    pub kind: StreamKind,
    pub timestamp_ms: u64,
    pub data: Bytes,
}

/// A combined emission carrying the latest frame of several streams.
#[derive(Debug, Clone)]
pub struct MultiSourceFrame {
    pub timestamp_ms: u64,
    pub frames: Vec<DeviceFrame>,
}

/// Events delivered on the driver's emission channel.
#[derive(Debug, Clone)]
pub enum DeviceEvent {
    Frame(DeviceFrame),
    MultiSource(MultiSourceFrame),
}

/// Static device identity reported to subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub model: String,
    pub serial: String,
    pub firmware: String,
    pub depth_width: u32,
    pub depth_height: u32,
    pub color_width: u32,
    pub color_height: u32,
}

/// Handle to a depth camera driver.
///
/// `open*` calls return `true` on success and `false` when the device
/// refuses; control calls can fail with a real error once a stream is up.
#[async_trait]
pub trait DepthCamera: Send + Sync {
    async fn open(&self) -> bool;
    async fn close(&self) -> bool;

    async fn open_stream(&self, kind: StreamKind) -> bool;
    async fn close_stream(&self, kind: StreamKind) -> bool;

    /// Start combined emissions for the given kinds.
    async fn open_multi_source(&self, kinds: &[StreamKind]) -> bool;
    async fn close_multi_source(&self) -> bool;

    /// Subscribe to the driver's emission channel.
    fn subscribe(&self) -> broadcast::Receiver<DeviceEvent>;

    async fn set_led(&self, color: LedColor) -> anyhow::Result<()>;
    async fn set_ir_emitter(&self, enabled: bool) -> anyhow::Result<()>;
    async fn set_tilt(&self, angle: f32) -> anyhow::Result<()>;

    fn info(&self) -> DeviceInfo;
}
