//! Multi-source frame synchronizer.
//!
//! Consumes the driver's combined emissions and keeps one slot per required
//! stream holding the latest frame. When every required stream has a slot
//! and the timestamp spread fits inside the sync window, the slots drain
//! into a [`SyncBundle`]. Slots that outlive `drop_after` are discarded and
//! counted; slots beyond `buffer_size` are refused.
//!
//! Bundling runs synchronously on each emission; only the task wrapper that
//! feeds it from the driver channel is asynchronous.

use crate::config::FrameSyncSettings;
use crate::device::{DepthCamera, DeviceEvent, MultiSourceFrame};
use crate::error::SyncError;
use crate::frame::{SyncBundle, SyncedFrame};
use crate::stream::StreamKind;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Streams that must all be present before a bundle is emitted.
    pub sources: Vec<StreamKind>,
    pub sync_window_ms: u64,
    pub drop_after_ms: u64,
    pub buffer_size: usize,
}

impl From<&FrameSyncSettings> for SyncConfig {
    fn from(settings: &FrameSyncSettings) -> Self {
        Self {
            sources: settings.sources.clone(),
            sync_window_ms: settings.sync_window_ms,
            drop_after_ms: settings.drop_after_ms,
            buffer_size: settings.buffer_size,
        }
    }
}

/// Counters kept while the synchronizer runs. Reset on stop.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStats {
    pub synced: u64,
    pub dropped: u64,
    pub last_sync_delay_ms: u64,
    pub max_sync_delay_ms: u64,
    /// Last observed age of each stream's frame at bundle time.
    pub frame_delays_ms: BTreeMap<StreamKind, u64>,
    pub buffer_overflows: u64,
    pub sync_attempts: u64,
    pub running: bool,
}

/// Results of feeding one emission into the synchronizer.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    Bundle(SyncBundle),
    FrameDropped { kind: StreamKind, delay_ms: u64 },
    BufferOverflow { kind: StreamKind, size: usize },
}

#[derive(Debug)]
pub struct FrameSynchronizer {
    config: SyncConfig,
    slots: HashMap<StreamKind, crate::device::DeviceFrame>,
    stats: SyncStats,
}

impl FrameSynchronizer {
    pub fn new(config: SyncConfig) -> Result<Self, SyncError> {
        if config.sources.is_empty() {
            return Err(SyncError::NoStreamsEnabled);
        }
        Ok(Self {
            config,
            slots: HashMap::new(),
            stats: SyncStats {
                running: true,
                ..SyncStats::default()
            },
        })
    }

    pub fn stats(&self) -> &SyncStats {
        &self.stats
    }

    /// Feed one combined emission; returns the events it produced.
    pub fn ingest(&mut self, emission: MultiSourceFrame) -> Vec<SyncEvent> {
        let now = emission.timestamp_ms;
        let mut events = Vec::new();

        for frame in emission.frames {
            if !self.config.sources.contains(&frame.kind) {
                continue;
            }
            if !self.slots.contains_key(&frame.kind) && self.slots.len() >= self.config.buffer_size
            {
                self.stats.buffer_overflows += 1;
                warn!(kind = %frame.kind, size = self.slots.len(), "synchronizer slot overflow");
                events.push(SyncEvent::BufferOverflow {
                    kind: frame.kind,
                    size: self.slots.len(),
                });
                continue;
            }
            self.slots.insert(frame.kind, frame);
        }

        self.stats.sync_attempts += 1;

        if let Some(bundle) = self.try_bundle(now) {
            events.push(SyncEvent::Bundle(bundle));
            return events;
        }

        // Expire slots that waited too long for their counterparts.
        let drop_after = self.config.drop_after_ms;
        let mut dropped = Vec::new();
        self.slots.retain(|kind, frame| {
            let age = now.saturating_sub(frame.timestamp_ms);
            if age > drop_after {
                dropped.push((*kind, age));
                false
            } else {
                true
            }
        });
        for (kind, delay_ms) in dropped {
            self.stats.dropped += 1;
            debug!(%kind, delay_ms, "synchronizer dropped a stale frame");
            events.push(SyncEvent::FrameDropped { kind, delay_ms });
        }

        events
    }

    fn try_bundle(&mut self, now: u64) -> Option<SyncBundle> {
        if !self
            .config
            .sources
            .iter()
            .all(|kind| self.slots.contains_key(kind))
        {
            return None;
        }
        let min_ts = self.slots.values().map(|f| f.timestamp_ms).min()?;
        let max_ts = self.slots.values().map(|f| f.timestamp_ms).max()?;
        let spread = max_ts - min_ts;
        if spread > self.config.sync_window_ms {
            return None;
        }

        let mut frames = BTreeMap::new();
        for (kind, frame) in self.slots.drain() {
            self.stats
                .frame_delays_ms
                .insert(kind, now.saturating_sub(frame.timestamp_ms));
            frames.insert(
                kind,
                SyncedFrame {
                    kind,
                    timestamp_ms: frame.timestamp_ms,
                    data: frame.data,
                },
            );
        }

        self.stats.synced += 1;
        self.stats.last_sync_delay_ms = spread;
        self.stats.max_sync_delay_ms = self.stats.max_sync_delay_ms.max(spread);

        Some(SyncBundle {
            timestamp_ms: now,
            frames,
            max_delay_ms: spread,
        })
    }

    /// Drop all slots and reset the counters.
    pub fn stop(&mut self) {
        self.slots.clear();
        self.stats = SyncStats::default();
    }
}

enum SyncCommand {
    Stats { reply: oneshot::Sender<SyncStats> },
    Stop { done: oneshot::Sender<()> },
}

/// Handle to the synchronizer task.
pub struct SyncHandle {
    command_tx: mpsc::Sender<SyncCommand>,
    task: JoinHandle<()>,
}

impl SyncHandle {
    pub async fn stats(&self) -> Option<SyncStats> {
        let (reply, rx) = oneshot::channel();
        self.command_tx.send(SyncCommand::Stats { reply }).await.ok()?;
        rx.await.ok()
    }

    pub async fn stop(self) {
        let (done, rx) = oneshot::channel();
        if self.command_tx.send(SyncCommand::Stop { done }).await.is_ok() {
            let _ = rx.await;
        }
        let _ = self.task.await;
    }
}

/// Open the driver's multi-source stream and run the synchronizer over it,
/// forwarding produced events to the supervisor.
pub async fn spawn(
    config: SyncConfig,
    driver: Arc<dyn DepthCamera>,
    events_tx: mpsc::Sender<SyncEvent>,
) -> Result<SyncHandle, SyncError> {
    let mut synchronizer = FrameSynchronizer::new(config.clone())?;
    if !driver.open_multi_source(&config.sources).await {
        return Err(SyncError::DriverRefused);
    }
    let mut device_rx = driver.subscribe();
    let (command_tx, mut command_rx) = mpsc::channel(8);

    let task = tokio::spawn(async move {
        info!(sources = ?config.sources, window_ms = config.sync_window_ms, "frame synchronizer started");
        loop {
            tokio::select! {
                event = device_rx.recv() => match event {
                    Ok(DeviceEvent::MultiSource(emission)) => {
                        for event in synchronizer.ingest(emission) {
                            if events_tx.send(event).await.is_err() {
                                return;
                            }
                        }
                    }
                    Ok(DeviceEvent::Frame(_)) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "synchronizer lagged behind the driver");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
                command = command_rx.recv() => match command {
                    Some(SyncCommand::Stats { reply }) => {
                        let _ = reply.send(synchronizer.stats().clone());
                    }
                    Some(SyncCommand::Stop { done }) => {
                        synchronizer.stop();
                        driver.close_multi_source().await;
                        let _ = done.send(());
                        break;
                    }
                    None => break,
                },
            }
        }
        info!("frame synchronizer stopped");
    });

    Ok(SyncHandle { command_tx, task })
}
