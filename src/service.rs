//! Top-level service supervisor.
//!
//! Owns the driver handle, buffer pool, sensors, synchronizer and
//! broadcaster, and routes events between them: sensor artifacts and
//! side-channel events fan out to subscribers, synchronizer bundles become
//! `frameSync` records, and subscriber control records dispatch to sensors
//! or the driver. Sensors start when the first subscriber identifies and
//! stop when the last one leaves.
//!
//! `launch` assembles everything and returns a handle; the caller decides
//! when to shut down (the binary wires this to process signals).

use crate::config::Settings;
use crate::device::DepthCamera;
use crate::error::SensorError;
use crate::network::{
    Broadcaster, BroadcasterConfig, ClientEvent, ClientMessage, ServerMessage,
};
use crate::pool::{BufferPool, PoolEvent};
use crate::sensor::{self, SensorEvent, SensorPolicy, SensorRuntimeConfig, SensorHandle};
use crate::stream::StreamKind;
use crate::sync::{self, SyncConfig, SyncEvent, SyncHandle};
use anyhow::Context;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Handle to a launched service.
pub struct ServiceHandle {
    port: u16,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ServiceHandle {
    /// Port the broadcaster actually bound.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Run the global cleanup and wait for the service to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let mut task = self.task;
        if timeout(Duration::from_secs(10), &mut task).await.is_err() {
            warn!("service did not stop in time, aborting");
            task.abort();
        }
    }
}

/// Build and start the whole pipeline.
///
/// Fails fast on invalid configuration or a device that will not open; every
/// later failure is handled inside the running service.
pub async fn launch(
    settings: Settings,
    driver: Arc<dyn DepthCamera>,
) -> anyhow::Result<ServiceHandle> {
    settings.validate().context("invalid configuration")?;
    if !driver.open().await {
        anyhow::bail!("device failed to open");
    }

    let pool = BufferPool::new(
        (&settings.base_sensor.buffer_pool).into(),
        &StreamKind::ALL,
    );
    let pool_events = pool.subscribe();

    let (client_tx, client_rx) = mpsc::channel(256);
    let broadcaster = Broadcaster::new(
        BroadcasterConfig::from_settings(&settings.network.websocket, &settings.service),
        client_tx,
    );
    let port = broadcaster.start().await?;

    let (sensor_tx, sensor_rx) = mpsc::channel(1024);
    let (sync_tx, sync_rx) = mpsc::channel(256);
    let synchronizer = if settings.frame_sync.enabled {
        let handle = sync::spawn(
            SyncConfig::from(&settings.frame_sync),
            Arc::clone(&driver),
            sync_tx,
        )
        .await
        .context("failed to start the frame synchronizer")?;
        Some(handle)
    } else {
        None
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let service = Service {
        settings,
        driver,
        pool,
        broadcaster,
        sensors: HashMap::new(),
        synchronizer,
        sensor_events_tx: sensor_tx,
        started_at: Instant::now(),
    };
    let task = tokio::spawn(service.run(sensor_rx, client_rx, sync_rx, pool_events, shutdown_rx));
    info!(port, "service started");

    Ok(ServiceHandle {
        port,
        shutdown_tx,
        task,
    })
}

struct Service {
    settings: Settings,
    driver: Arc<dyn DepthCamera>,
    pool: BufferPool,
    broadcaster: Broadcaster,
    sensors: HashMap<StreamKind, SensorHandle>,
    synchronizer: Option<SyncHandle>,
    sensor_events_tx: mpsc::Sender<SensorEvent>,
    started_at: Instant,
}

impl Service {
    async fn run(
        mut self,
        mut sensor_rx: mpsc::Receiver<SensorEvent>,
        mut client_rx: mpsc::Receiver<ClientEvent>,
        mut sync_rx: mpsc::Receiver<SyncEvent>,
        mut pool_events: broadcast::Receiver<PoolEvent>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let mut stats_interval =
            tokio::time::interval(Duration::from_millis(self.settings.service.stats_interval_ms.max(100)));
        stats_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                Some(event) = sensor_rx.recv() => self.on_sensor_event(event).await,
                Some(event) = client_rx.recv() => self.on_client_event(event).await,
                Some(event) = sync_rx.recv() => self.on_sync_event(event).await,
                event = pool_events.recv() => match event {
                    Ok(event) => self.on_pool_event(event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "pool event stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {}
                },
                _ = stats_interval.tick(), if self.settings.debug.performance => {
                    self.broadcast_stats().await;
                }
                _ = shutdown_rx.changed() => break,
                else => break,
            }
        }
        self.cleanup().await;
    }

    async fn on_sensor_event(&mut self, event: SensorEvent) {
        match event {
            SensorEvent::Frame(frame) => {
                self.broadcaster
                    .broadcast(&ServerMessage::Frame {
                        sensor_type: frame.kind,
                        data: frame,
                    })
                    .await;
            }
            SensorEvent::Movement(movement) => {
                self.broadcaster
                    .broadcast(&ServerMessage::Movement { data: movement })
                    .await;
            }
            SensorEvent::Gesture(gesture) => {
                info!(tracking_id = gesture.tracking_id, gesture = ?gesture.gesture, "gesture detected");
                self.broadcaster
                    .broadcast(&ServerMessage::Gesture { data: gesture })
                    .await;
            }
            SensorEvent::ProcessingError { kind, message } => {
                warn!(%kind, message, "sensor reported an error");
            }
            SensorEvent::Started { kind } => {
                self.broadcast_sensor_status(kind).await;
            }
            SensorEvent::Stopped { kind } => {
                debug!(%kind, "sensor stopped");
            }
            SensorEvent::Terminated { kind, message } => {
                error!(%kind, message, "sensor terminated");
                self.sensors.remove(&kind);
                self.broadcaster
                    .broadcast(&ServerMessage::Error {
                        error: message,
                    })
                    .await;
            }
        }
    }

    async fn on_client_event(&mut self, event: ClientEvent) {
        match event {
            ClientEvent::Connected { id, descriptor } => {
                info!(id, name = %descriptor.name, "subscriber ready");
                let _ = self
                    .broadcaster
                    .send(id, &ServerMessage::DeviceInfo {
                        info: self.driver.info(),
                    })
                    .await;
                let status = serde_json::json!({
                    "clientCount": self.broadcaster.client_count().await,
                    "sensorsRunning": self.running_kinds(),
                    "uptimeMs": self.started_at.elapsed().as_millis() as u64,
                });
                let _ = self
                    .broadcaster
                    .send(id, &ServerMessage::Status { status })
                    .await;

                if self.settings.service.auto_start_on_connect
                    && self.broadcaster.client_count().await == 1
                {
                    info!("first subscriber connected, starting enabled sensors");
                    self.start_enabled_sensors().await;
                }
            }
            ClientEvent::Disconnected { id, remaining } => {
                info!(id, remaining, "subscriber gone");
                if remaining == 0 && self.settings.service.stop_when_idle {
                    info!("last subscriber disconnected, stopping all sensors");
                    self.stop_all_sensors().await;
                }
            }
            ClientEvent::Message { id, message } => {
                self.on_client_message(id, message).await;
            }
        }
    }

    async fn on_client_message(&mut self, id: u32, message: ClientMessage) {
        match message {
            ClientMessage::Identify { .. } => {
                warn!(id, "unexpected identify after handshake");
            }
            ClientMessage::StartSensor { sensor_type } => {
                if let Err(err) = self.start_sensor(sensor_type).await {
                    warn!(id, %sensor_type, %err, "start request failed");
                    let _ = self
                        .broadcaster
                        .send(id, &ServerMessage::Error {
                            error: err.to_string(),
                        })
                        .await;
                } else {
                    self.broadcast_sensor_status(sensor_type).await;
                }
            }
            ClientMessage::StopSensor { sensor_type } => {
                self.stop_sensor(sensor_type).await;
            }
            ClientMessage::SetLed { color } => {
                if let Err(err) = self.driver.set_led(color).await {
                    warn!(id, %err, "set_led failed");
                    let _ = self
                        .broadcaster
                        .send(id, &ServerMessage::Error {
                            error: err.to_string(),
                        })
                        .await;
                }
            }
            ClientMessage::SetIrEmitter { enabled } => {
                if let Err(err) = self.driver.set_ir_emitter(enabled).await {
                    warn!(id, %err, "set_ir_emitter failed");
                    let _ = self
                        .broadcaster
                        .send(id, &ServerMessage::Error {
                            error: err.to_string(),
                        })
                        .await;
                }
            }
        }
    }

    async fn on_sync_event(&mut self, event: SyncEvent) {
        match event {
            SyncEvent::Bundle(bundle) => {
                self.broadcaster
                    .broadcast(&ServerMessage::FrameSync { frame: bundle })
                    .await;
            }
            SyncEvent::FrameDropped { kind, delay_ms } => {
                debug!(%kind, delay_ms, "synchronizer dropped a frame");
            }
            SyncEvent::BufferOverflow { kind, size } => {
                warn!(%kind, size, "synchronizer refused a frame");
            }
        }
    }

    fn on_pool_event(&self, event: PoolEvent) {
        match event {
            PoolEvent::Exhausted { kind, total, in_use } => {
                warn!(%kind, total, in_use, "buffer pool exhausted");
            }
            PoolEvent::Released { .. } => {}
            PoolEvent::Resized { max, total } => {
                info!(max, total, "buffer pool resized");
            }
        }
    }

    /// Idempotent when the sensor is already running.
    async fn start_sensor(&mut self, kind: StreamKind) -> Result<(), SensorError> {
        if !self.settings.sensor_enabled(kind) {
            return Err(SensorError::NotEnabled { kind });
        }
        match self.sensors.get(&kind) {
            Some(handle) if !handle.is_finished() => {
                debug!(%kind, "sensor already running");
                return Ok(());
            }
            Some(_) => {
                self.sensors.remove(&kind);
            }
            None => {}
        }

        let handle = sensor::start(
            SensorPolicy::for_kind(kind, &self.settings),
            SensorRuntimeConfig::from(&self.settings.base_sensor),
            self.pool.clone(),
            Arc::clone(&self.driver),
            self.sensor_events_tx.clone(),
        )
        .await?;
        self.sensors.insert(kind, handle);
        Ok(())
    }

    async fn stop_sensor(&mut self, kind: StreamKind) {
        if let Some(handle) = self.sensors.remove(&kind) {
            let status = handle.status().await;
            handle.stop().await;
            if let Some(mut status) = status {
                status.state = crate::sensor::SensorState::Stopped;
                status.running = false;
                status.queue_depth = 0;
                self.broadcaster
                    .broadcast(&ServerMessage::SensorStatus { status })
                    .await;
            }
        }
    }

    async fn start_enabled_sensors(&mut self) {
        for kind in self.settings.enabled_kinds() {
            if let Err(err) = self.start_sensor(kind).await {
                warn!(%kind, %err, "failed to start sensor");
            }
        }
    }

    async fn stop_all_sensors(&mut self) {
        let handles: Vec<SensorHandle> = self.sensors.drain().map(|(_, h)| h).collect();
        join_all(handles.into_iter().map(|handle| handle.stop())).await;
    }

    fn running_kinds(&self) -> Vec<StreamKind> {
        self.sensors
            .iter()
            .filter(|(_, handle)| !handle.is_finished())
            .map(|(kind, _)| *kind)
            .collect()
    }

    async fn broadcast_sensor_status(&self, kind: StreamKind) {
        if let Some(handle) = self.sensors.get(&kind) {
            if let Some(status) = handle.status().await {
                self.broadcaster
                    .broadcast(&ServerMessage::SensorStatus { status })
                    .await;
            }
        }
    }

    async fn broadcast_stats(&self) {
        let mut sensors = Vec::new();
        for handle in self.sensors.values() {
            if let Some(status) = handle.status().await {
                sensors.push(status);
            }
        }
        let sync_stats = match &self.synchronizer {
            Some(handle) => handle.stats().await,
            None => None,
        };
        let stats = serde_json::json!({
            "uptimeMs": self.started_at.elapsed().as_millis() as u64,
            "clients": self.broadcaster.client_count().await,
            "pool": self.pool.stats(),
            "sensors": sensors,
            "frameSync": sync_stats,
        });
        self.broadcaster
            .broadcast(&ServerMessage::Stats { stats })
            .await;
    }

    /// Global cleanup: sensors, broadcaster, synchronizer, pool, driver.
    async fn cleanup(&mut self) {
        info!("service shutting down");
        self.stop_all_sensors().await;
        self.broadcaster.stop().await;
        if let Some(handle) = self.synchronizer.take() {
            handle.stop().await;
        }
        if let Err(err) = self.pool.clear() {
            warn!(%err, "buffer pool not fully released at shutdown");
        }
        self.driver.close().await;
        info!("service stopped");
    }
}
