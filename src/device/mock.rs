//! Hardware-free camera implementation.
//!
//! Emits synthetic frames of the exact stream geometry on a configurable
//! cadence. Used by the default binary when no real camera SDK is linked and
//! by the test suites, which also rely on its failure injection and control
//! state getters.

use super::{DepthCamera, DeviceEvent, DeviceFrame, DeviceInfo, LedColor, MultiSourceFrame};
use crate::config::DeviceSettings;
use crate::frame::{now_ms, HandState, RawBody, RawJoint, Vec3};
use crate::stream::StreamKind;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info};

struct StreamTask {
    shutdown_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

struct MockInner {
    events: broadcast::Sender<DeviceEvent>,
    frame_interval: Duration,
    serial: String,
    opened: AtomicBool,
    refused: Mutex<HashSet<StreamKind>>,
    streams: AsyncMutex<HashMap<StreamKind, StreamTask>>,
    multi_source: AsyncMutex<Option<StreamTask>>,
    led: Mutex<LedColor>,
    ir_emitter: AtomicBool,
    tilt: Mutex<f32>,
}

/// Synthetic depth camera.
#[derive(Clone)]
pub struct MockCamera {
    inner: Arc<MockInner>,
}

impl MockCamera {
    pub fn new(settings: &DeviceSettings) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(MockInner {
                events,
                frame_interval: Duration::from_millis(settings.frame_interval_ms.max(1)),
                serial: settings
                    .serial
                    .clone()
                    .unwrap_or_else(|| "MOCK-0000".to_string()),
                opened: AtomicBool::new(false),
                refused: Mutex::new(HashSet::new()),
                streams: AsyncMutex::new(HashMap::new()),
                multi_source: AsyncMutex::new(None),
                led: Mutex::new(LedColor::Off),
                ir_emitter: AtomicBool::new(true),
                tilt: Mutex::new(0.0),
            }),
        }
    }

    /// Make subsequent opens of the given stream fail.
    pub fn refuse_stream(&self, kind: StreamKind) {
        self.inner.refused.lock().expect("mock lock").insert(kind);
    }

    pub fn allow_stream(&self, kind: StreamKind) {
        self.inner.refused.lock().expect("mock lock").remove(&kind);
    }

    pub fn led(&self) -> LedColor {
        *self.inner.led.lock().expect("mock lock")
    }

    pub fn ir_emitter(&self) -> bool {
        self.inner.ir_emitter.load(Ordering::Relaxed)
    }

    pub fn tilt(&self) -> f32 {
        *self.inner.tilt.lock().expect("mock lock")
    }

    /// Streams currently emitting, useful for asserting teardown.
    pub async fn open_streams(&self) -> Vec<StreamKind> {
        self.inner.streams.lock().await.keys().copied().collect()
    }

    fn is_refused(&self, kind: StreamKind) -> bool {
        self.inner.refused.lock().expect("mock lock").contains(&kind)
    }
}

#[async_trait]
impl DepthCamera for MockCamera {
    async fn open(&self) -> bool {
        self.inner.opened.store(true, Ordering::Relaxed);
        info!(serial = %self.inner.serial, "mock camera opened");
        true
    }

    async fn close(&self) -> bool {
        self.inner.opened.store(false, Ordering::Relaxed);
        for (_, task) in self.inner.streams.lock().await.drain() {
            let _ = task.shutdown_tx.send(());
            let _ = task.task.await;
        }
        if let Some(task) = self.inner.multi_source.lock().await.take() {
            let _ = task.shutdown_tx.send(());
            let _ = task.task.await;
        }
        info!("mock camera closed");
        true
    }

    async fn open_stream(&self, kind: StreamKind) -> bool {
        if !self.inner.opened.load(Ordering::Relaxed) || self.is_refused(kind) {
            return false;
        }
        let mut streams = self.inner.streams.lock().await;
        if streams.contains_key(&kind) {
            return true;
        }
        let events = self.inner.events.clone();
        let interval = self.inner.frame_interval;
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut phase = 0u64;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        phase += 1;
                        let frame = synthesize(kind, phase);
                        if events.send(DeviceEvent::Frame(frame)).is_err() {
                            debug!(%kind, "no receivers for mock stream");
                        }
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });
        streams.insert(kind, StreamTask { shutdown_tx, task });
        info!(%kind, "mock stream opened");
        true
    }

    async fn close_stream(&self, kind: StreamKind) -> bool {
        if let Some(task) = self.inner.streams.lock().await.remove(&kind) {
            let _ = task.shutdown_tx.send(());
            let _ = task.task.await;
            info!(%kind, "mock stream closed");
        }
        true
    }

    async fn open_multi_source(&self, kinds: &[StreamKind]) -> bool {
        if !self.inner.opened.load(Ordering::Relaxed) {
            return false;
        }
        if kinds.iter().any(|kind| self.is_refused(*kind)) {
            return false;
        }
        let mut slot = self.inner.multi_source.lock().await;
        if slot.is_some() {
            return true;
        }
        let events = self.inner.events.clone();
        let interval = self.inner.frame_interval;
        let kinds: Vec<StreamKind> = kinds.to_vec();
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut phase = 0u64;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        phase += 1;
                        let frames: Vec<DeviceFrame> =
                            kinds.iter().map(|kind| synthesize(*kind, phase)).collect();
                        let timestamp_ms = now_ms();
                        let _ = events.send(DeviceEvent::MultiSource(MultiSourceFrame {
                            timestamp_ms,
                            frames,
                        }));
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });
        *slot = Some(StreamTask { shutdown_tx, task });
        info!("mock multi-source stream opened");
        true
    }

    async fn close_multi_source(&self) -> bool {
        if let Some(task) = self.inner.multi_source.lock().await.take() {
            let _ = task.shutdown_tx.send(());
            let _ = task.task.await;
        }
        true
    }

    fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.inner.events.subscribe()
    }

    async fn set_led(&self, color: LedColor) -> anyhow::Result<()> {
        *self.inner.led.lock().expect("mock lock") = color;
        Ok(())
    }

    async fn set_ir_emitter(&self, enabled: bool) -> anyhow::Result<()> {
        self.inner.ir_emitter.store(enabled, Ordering::Relaxed);
        Ok(())
    }

    async fn set_tilt(&self, angle: f32) -> anyhow::Result<()> {
        if !(-27.0..=27.0).contains(&angle) {
            anyhow::bail!("tilt angle {angle} out of range");
        }
        *self.inner.tilt.lock().expect("mock lock") = angle;
        Ok(())
    }

    fn info(&self) -> DeviceInfo {
        let depth = StreamKind::Depth.buffer_spec();
        let color = StreamKind::Color.buffer_spec();
        DeviceInfo {
            model: "Mock ToF Camera".to_string(),
            serial: self.inner.serial.clone(),
            firmware: "0.0-mock".to_string(),
            depth_width: depth.width,
            depth_height: depth.height,
            color_width: color.width,
            color_height: color.height,
        }
    }
}

fn synthesize(kind: StreamKind, phase: u64) -> DeviceFrame {
    let data = match kind {
        StreamKind::Depth => synth_depth(phase),
        StreamKind::Infrared => synth_infrared(phase),
        StreamKind::Color => synth_color(phase),
        StreamKind::Body => synth_bodies(phase),
    };
    DeviceFrame {
        kind,
        timestamp_ms: now_ms(),
        data,
    }
}

/// A sweeping gradient that stays inside the default reliability band.
fn synth_depth(phase: u64) -> Bytes {
    let spec = StreamKind::Depth.buffer_spec();
    let mut out = Vec::with_capacity(spec.byte_size());
    for i in 0..spec.element_count {
        let value = 600 + ((i as u64 + phase * 7) % 3_500) as u16;
        out.extend_from_slice(&value.to_le_bytes());
    }
    Bytes::from(out)
}

fn synth_infrared(phase: u64) -> Bytes {
    let spec = StreamKind::Infrared.buffer_spec();
    let mut out = Vec::with_capacity(spec.byte_size());
    for i in 0..spec.element_count {
        let value = (((i as u64 * 13 + phase * 101) % 65_536) as u16).to_le_bytes();
        out.extend_from_slice(&value);
    }
    Bytes::from(out)
}

fn synth_color(phase: u64) -> Bytes {
    let spec = StreamKind::Color.buffer_spec();
    let mut out = vec![0u8; spec.byte_size()];
    for (i, px) in out.chunks_exact_mut(4).enumerate() {
        let shade = ((i as u64 + phase) % 256) as u8;
        px[0] = shade;
        px[1] = shade.wrapping_add(85);
        px[2] = shade.wrapping_add(170);
        px[3] = 200;
    }
    Bytes::from(out)
}

/// One tracked body whose right hand sweeps sideways, enough to drive the
/// smoothing, velocity and gesture paths downstream.
fn synth_bodies(phase: u64) -> Bytes {
    let t = phase as f32 * 0.05;
    let sway = (t.sin()) * 0.3;
    let joint = |x: f32, y: f32, z: f32, prev: Option<Vec3>| RawJoint {
        position: Vec3 { x, y, z },
        tracking_state: 2,
        confidence: 0.9,
        previous_position: prev,
    };
    let prev_sway = ((phase.saturating_sub(1)) as f32 * 0.05).sin() * 0.3;
    let mut joints = BTreeMap::new();
    joints.insert("spineBase".to_string(), joint(0.0, -0.3, 2.0, None));
    joints.insert("spineMid".to_string(), joint(0.0, 0.0, 2.0, None));
    joints.insert("neck".to_string(), joint(0.0, 0.25, 2.0, None));
    joints.insert("head".to_string(), joint(0.0, 0.4, 2.0, None));
    joints.insert(
        "handLeft".to_string(),
        joint(-0.4, 0.1, 2.0, Some(Vec3 { x: -0.4, y: 0.1, z: 2.0 })),
    );
    joints.insert(
        "handRight".to_string(),
        joint(
            0.4 + sway,
            0.2,
            2.0,
            Some(Vec3 {
                x: 0.4 + prev_sway,
                y: 0.2,
                z: 2.0,
            }),
        ),
    );
    let body = RawBody {
        tracking_id: 1,
        tracked: true,
        joints,
        hand_left_state: HandState::Open,
        hand_right_state: HandState::Closed,
    };
    Bytes::from(serde_json::to_vec(&vec![body]).expect("mock body serializes"))
}
