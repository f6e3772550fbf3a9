//! Per-stream sensors.
//!
//! One sensor owns one device stream: it validates incoming frames, copies
//! them into pooled buffers, feeds a bounded FIFO queue with head-drop on
//! overflow, keeps exactly one frame in flight to its worker, and supervises
//! the worker with periodic health checks and bounded restarts.
//!
//! Differences between stream kinds live in a [`SensorPolicy`]: the frame
//! validator and the worker factory. The sensor itself is one struct.

use crate::config::Settings;
use crate::device::{DepthCamera, DeviceEvent, DeviceFrame};
use crate::error::SensorError;
use crate::frame::{now_ms, GestureEvent, MovementEvent, ProcessedFrame, RawFrame};
use crate::pool::BufferPool;
use crate::processing::{
    body::{BodyParams, Smoothing},
    color::{ColorParams, Compression},
    depth::{Calibration, ColorMap, DepthParams},
    infrared::InfraredParams,
    spawn_worker, ProcessorParams, SideEvent, WorkerFactory, WorkerHandle, WorkerReply,
    WorkerRequest,
};
use crate::stream::StreamKind;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Sensor lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SensorState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Failed,
}

/// Supervision and queueing bounds shared by all sensors.
#[derive(Debug, Clone)]
pub struct SensorRuntimeConfig {
    pub max_queue_size: usize,
    pub health_check_interval: Duration,
    pub frame_timeout: Duration,
    pub max_restarts: u32,
}

impl From<&crate::config::BaseSensorSettings> for SensorRuntimeConfig {
    fn from(settings: &crate::config::BaseSensorSettings) -> Self {
        Self {
            max_queue_size: settings.max_queue_size,
            health_check_interval: settings.health_check_interval(),
            frame_timeout: settings.frame_timeout(),
            max_restarts: settings.max_restarts,
        }
    }
}

/// Raw-frame validation rule for one stream kind.
#[derive(Debug, Clone, Copy)]
pub enum FrameValidator {
    /// Pixel streams have an exact byte size.
    Exact(usize),
    /// Serialized streams only have an upper bound.
    AtMost(usize),
}

impl FrameValidator {
    pub fn check(&self, kind: StreamKind, actual: usize) -> Result<(), SensorError> {
        match *self {
            FrameValidator::Exact(expected) if actual != expected => {
                Err(SensorError::InvalidFrameSize {
                    kind,
                    expected,
                    actual,
                })
            }
            FrameValidator::AtMost(expected) if actual > expected => {
                Err(SensorError::InvalidFrameSize {
                    kind,
                    expected,
                    actual,
                })
            }
            _ => Ok(()),
        }
    }
}

/// Kind-specific behavior plugged into the sensor.
pub struct SensorPolicy {
    pub kind: StreamKind,
    pub validator: FrameValidator,
    pub worker_factory: WorkerFactory,
}

impl SensorPolicy {
    /// Build the production policy for a kind from the settings.
    pub fn for_kind(kind: StreamKind, settings: &Settings) -> Self {
        let spec = kind.buffer_spec();
        let validator = match kind {
            StreamKind::Body => FrameValidator::AtMost(spec.byte_size()),
            _ => FrameValidator::Exact(spec.byte_size()),
        };
        let params = processor_params(kind, settings);
        Self {
            kind,
            validator,
            worker_factory: Box::new(move |reply_tx| {
                spawn_worker(kind, params.clone(), reply_tx)
            }),
        }
    }
}

fn processor_params(kind: StreamKind, settings: &Settings) -> ProcessorParams {
    let spec = kind.buffer_spec();
    match kind {
        StreamKind::Depth => {
            let s = &settings.sensors.depth;
            ProcessorParams::Depth(DepthParams {
                width: spec.width,
                height: spec.height,
                min_distance: s.min_distance,
                max_distance: s.max_distance,
                normalize: s.normalize,
                gamma: s.gamma,
                point_cloud: s.point_cloud,
                colorize: s.colorize.as_deref().and_then(ColorMap::from_name),
                calibration: Calibration {
                    focal_x: s.calibration.focal_x,
                    focal_y: s.calibration.focal_y,
                    principal_x: s.calibration.principal_x,
                    principal_y: s.calibration.principal_y,
                },
            })
        }
        StreamKind::Infrared => ProcessorParams::Infrared(InfraredParams {
            width: spec.width,
            height: spec.height,
            gamma: settings.sensors.infrared.gamma,
        }),
        StreamKind::Color => {
            let s = &settings.sensors.color;
            ProcessorParams::Color(ColorParams {
                width: spec.width,
                height: spec.height,
                force_alpha: s.force_alpha,
                compression: s.compression.as_ref().map(|c| Compression {
                    format: c.format.clone(),
                    quality: c.quality,
                }),
            })
        }
        StreamKind::Body => {
            let s = &settings.sensors.body;
            ProcessorParams::Body(BodyParams {
                smoothing: Smoothing {
                    correction: s.smoothing.correction,
                    max_deviation: s.smoothing.max_deviation,
                    jitter_radius: s.smoothing.jitter_radius,
                },
                smooth_joints: s.joints.clone(),
                compute_velocity: s.compute_velocity,
                compute_bounds: s.compute_bounds,
                compute_confidence: s.compute_confidence,
                gesture_threshold: s.gesture_threshold,
            })
        }
    }
}

/// Events a sensor reports to the supervisor.
#[derive(Debug)]
pub enum SensorEvent {
    Frame(ProcessedFrame),
    Movement(MovementEvent),
    Gesture(GestureEvent),
    ProcessingError { kind: StreamKind, message: String },
    Started { kind: StreamKind },
    Stopped { kind: StreamKind },
    Terminated { kind: StreamKind, message: String },
}

/// Status snapshot for one sensor.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorStatus {
    pub kind: StreamKind,
    pub state: SensorState,
    pub running: bool,
    pub fps: f64,
    pub frames_processed: u64,
    pub missed_frames: u64,
    pub pool_drops: u64,
    pub last_process_time_ms: f64,
    pub min_process_time_ms: f64,
    pub max_process_time_ms: f64,
    pub avg_process_time_ms: f64,
    pub restart_attempts: u32,
    pub max_restarts: u32,
    pub queue_depth: usize,
}

enum SensorCommand {
    Status { reply: oneshot::Sender<SensorStatus> },
    Stop { done: oneshot::Sender<()> },
}

/// Handle to a running sensor task.
pub struct SensorHandle {
    kind: StreamKind,
    command_tx: mpsc::Sender<SensorCommand>,
    task: JoinHandle<()>,
}

impl SensorHandle {
    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    /// Whether the sensor task has exited (stopped or terminated).
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn status(&self) -> Option<SensorStatus> {
        let (reply, rx) = oneshot::channel();
        self.command_tx
            .send(SensorCommand::Status { reply })
            .await
            .ok()?;
        rx.await.ok()
    }

    /// Stop the sensor and wait for its task to finish.
    pub async fn stop(self) {
        let (done, rx) = oneshot::channel();
        if self
            .command_tx
            .send(SensorCommand::Stop { done })
            .await
            .is_ok()
        {
            let _ = tokio::time::timeout(Duration::from_secs(5), rx).await;
        }
        let mut task = self.task;
        if tokio::time::timeout(Duration::from_secs(5), &mut task)
            .await
            .is_err()
        {
            warn!(kind = %self.kind, "sensor task unresponsive, aborting");
            task.abort();
        }
    }
}

/// Open the device stream and spawn the sensor task.
///
/// A refused stream open fails the start without touching anything else; the
/// caller may retry. A successful start resets the restart counter.
pub async fn start(
    policy: SensorPolicy,
    config: SensorRuntimeConfig,
    pool: BufferPool,
    driver: Arc<dyn DepthCamera>,
    events_tx: mpsc::Sender<SensorEvent>,
) -> Result<SensorHandle, SensorError> {
    let kind = policy.kind;
    if !driver.open_stream(kind).await {
        return Err(SensorError::DriverRefused { kind });
    }

    let device_rx = driver.subscribe();
    let (reply_tx, reply_rx) = mpsc::unbounded_channel();
    let worker = (policy.worker_factory)(reply_tx.clone());
    let (command_tx, command_rx) = mpsc::channel(8);

    let task = SensorTask {
        kind,
        policy,
        config,
        pool,
        driver,
        events_tx: events_tx.clone(),
        reply_tx,
        worker: Some(worker),
        queue: VecDeque::new(),
        in_flight: false,
        seq: 0,
        state: SensorState::Running,
        restart_attempts: 0,
        health_nonce: 0,
        pending_health: None,
        metrics: SensorMetrics::new(),
    };

    let _ = events_tx.send(SensorEvent::Started { kind }).await;
    info!(%kind, "sensor started");
    let join = tokio::spawn(task.run(device_rx, reply_rx, command_rx));

    Ok(SensorHandle {
        kind,
        command_tx,
        task: join,
    })
}

struct SensorMetrics {
    frames_processed: u64,
    missed_frames: u64,
    pool_drops: u64,
    fps: f64,
    window_started: Instant,
    window_frames: u32,
    last_ms: f64,
    min_ms: f64,
    max_ms: f64,
    total_ms: f64,
}

impl SensorMetrics {
    fn new() -> Self {
        Self {
            frames_processed: 0,
            missed_frames: 0,
            pool_drops: 0,
            fps: 0.0,
            window_started: Instant::now(),
            window_frames: 0,
            last_ms: 0.0,
            min_ms: f64::INFINITY,
            max_ms: 0.0,
            total_ms: 0.0,
        }
    }

    /// Record one processed frame; fps rolls over one-second windows.
    fn record(&mut self, process_time_ms: f64) {
        self.frames_processed += 1;
        self.last_ms = process_time_ms;
        self.min_ms = self.min_ms.min(process_time_ms);
        self.max_ms = self.max_ms.max(process_time_ms);
        self.total_ms += process_time_ms;

        self.window_frames += 1;
        let elapsed = self.window_started.elapsed();
        if elapsed >= Duration::from_secs(1) {
            self.fps = f64::from(self.window_frames) / elapsed.as_secs_f64();
            self.window_frames = 0;
            self.window_started = Instant::now();
        }
    }

    fn avg_ms(&self) -> f64 {
        if self.frames_processed == 0 {
            0.0
        } else {
            self.total_ms / self.frames_processed as f64
        }
    }
}

struct SensorTask {
    kind: StreamKind,
    policy: SensorPolicy,
    config: SensorRuntimeConfig,
    pool: BufferPool,
    driver: Arc<dyn DepthCamera>,
    events_tx: mpsc::Sender<SensorEvent>,
    reply_tx: UnboundedSender<WorkerReply>,
    worker: Option<WorkerHandle>,
    queue: VecDeque<RawFrame>,
    in_flight: bool,
    seq: u64,
    state: SensorState,
    restart_attempts: u32,
    health_nonce: u64,
    pending_health: Option<(u64, Instant)>,
    metrics: SensorMetrics,
}

impl SensorTask {
    async fn run(
        mut self,
        mut device_rx: broadcast::Receiver<DeviceEvent>,
        mut reply_rx: UnboundedReceiver<WorkerReply>,
        mut command_rx: mpsc::Receiver<SensorCommand>,
    ) {
        let mut health = tokio::time::interval(self.config.health_check_interval);
        health.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                event = device_rx.recv() => match event {
                    Ok(DeviceEvent::Frame(frame)) if frame.kind == self.kind => {
                        if self.on_device_frame(frame).await.is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(kind = %self.kind, skipped, "sensor lagged behind the driver");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        // The driver is gone; there is no recovering from
                        // this inside the sensor.
                        error!(kind = %self.kind, "driver channel closed");
                        self.shutdown().await;
                        self.state = SensorState::Failed;
                        self.emit(SensorEvent::Terminated {
                            kind: self.kind,
                            message: "driver channel closed".to_string(),
                        })
                        .await;
                        break;
                    }
                },
                Some(reply) = reply_rx.recv() => {
                    if self.on_worker_reply(reply).await.is_err() {
                        break;
                    }
                },
                _ = health.tick() => {
                    if self.on_health_tick().await.is_err() {
                        break;
                    }
                },
                command = command_rx.recv() => match command {
                    Some(SensorCommand::Status { reply }) => {
                        let _ = reply.send(self.status());
                    }
                    Some(SensorCommand::Stop { done }) => {
                        self.shutdown().await;
                        let _ = done.send(());
                        break;
                    }
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
            }
        }
    }

    async fn emit(&self, event: SensorEvent) {
        let _ = self.events_tx.send(event).await;
    }

    /// Per-frame path: validate, head-drop on overflow, acquire, copy,
    /// enqueue, dispatch.
    async fn on_device_frame(&mut self, frame: DeviceFrame) -> Result<(), ()> {
        if let Err(err) = self.policy.validator.check(self.kind, frame.data.len()) {
            warn!(kind = %self.kind, %err, "rejecting malformed device frame");
            self.emit(SensorEvent::ProcessingError {
                kind: self.kind,
                message: err.to_string(),
            })
            .await;
            return Ok(());
        }

        if self.queue.len() >= self.config.max_queue_size {
            // Head-drop keeps the most recent frames; the dropped frame's
            // buffer returns to the pool here.
            self.queue.pop_front();
            self.metrics.missed_frames += 1;
            warn!(
                kind = %self.kind,
                missed = self.metrics.missed_frames,
                "queue full, dropping oldest frame"
            );
        }

        let mut lease = match self.pool.acquire(self.kind) {
            Ok(lease) => lease,
            Err(err) => {
                self.metrics.pool_drops += 1;
                warn!(kind = %self.kind, %err, "no buffer available, dropping frame");
                return Ok(());
            }
        };
        lease.copy_from_slice(&frame.data);
        self.queue.push_back(RawFrame {
            kind: self.kind,
            timestamp_ms: frame.timestamp_ms,
            lease,
        });
        self.dispatch_next().await
    }

    /// Hand the queue head to the worker unless one frame is already in
    /// flight.
    async fn dispatch_next(&mut self) -> Result<(), ()> {
        if self.in_flight {
            return Ok(());
        }
        let Some(frame) = self.queue.pop_front() else {
            return Ok(());
        };
        let Some(worker) = self.worker.as_ref() else {
            drop(frame);
            return Ok(());
        };
        match worker.post(WorkerRequest::Frame(frame)) {
            Ok(()) => {
                self.in_flight = true;
                Ok(())
            }
            Err(request) => {
                drop(request);
                self.handle_worker_failure("worker channel closed").await
            }
        }
    }

    async fn on_worker_reply(&mut self, reply: WorkerReply) -> Result<(), ()> {
        match reply {
            WorkerReply::Processed {
                captured_at_ms,
                process_time_ms,
                output,
            } => {
                self.in_flight = false;
                self.seq += 1;
                self.metrics.record(process_time_ms);
                self.emit(SensorEvent::Frame(ProcessedFrame {
                    kind: self.kind,
                    seq: self.seq,
                    captured_at_ms,
                    emitted_at_ms: now_ms(),
                    width: output.width,
                    height: output.height,
                    payload: output.payload,
                    process_time_ms,
                }))
                .await;
                for side in output.side_events {
                    match side {
                        SideEvent::Movement(movement) => {
                            self.emit(SensorEvent::Movement(movement)).await;
                        }
                        SideEvent::Gesture(gesture) => {
                            self.emit(SensorEvent::Gesture(gesture)).await;
                        }
                    }
                }
                self.dispatch_next().await
            }
            WorkerReply::Failed { error, .. } => {
                // Processing errors do not terminate the worker.
                self.in_flight = false;
                error!(kind = %self.kind, %error, "worker reported a processing error");
                self.emit(SensorEvent::ProcessingError {
                    kind: self.kind,
                    message: error.to_string(),
                })
                .await;
                self.dispatch_next().await
            }
            WorkerReply::Health { nonce } => {
                if self
                    .pending_health
                    .map_or(false, |(expected, _)| expected == nonce)
                {
                    self.pending_health = None;
                }
                Ok(())
            }
        }
    }

    async fn on_health_tick(&mut self) -> Result<(), ()> {
        if let Some((_, sent_at)) = self.pending_health {
            if sent_at.elapsed() >= self.config.frame_timeout {
                return self.handle_worker_failure("health check timed out").await;
            }
            return Ok(());
        }
        let Some(worker) = self.worker.as_ref() else {
            return Ok(());
        };
        self.health_nonce += 1;
        let nonce = self.health_nonce;
        match worker.post(WorkerRequest::HealthCheck { nonce }) {
            Ok(()) => {
                self.pending_health = Some((nonce, Instant::now()));
                Ok(())
            }
            Err(_) => self.handle_worker_failure("worker channel closed").await,
        }
    }

    /// Replace a crashed or unresponsive worker, up to `max_restarts`.
    async fn handle_worker_failure(&mut self, reason: &str) -> Result<(), ()> {
        self.restart_attempts += 1;
        self.in_flight = false;
        self.pending_health = None;
        self.worker = None;

        if self.restart_attempts > self.config.max_restarts {
            let err = SensorError::RestartLimitExceeded {
                kind: self.kind,
                attempts: self.restart_attempts,
            };
            error!(kind = %self.kind, attempts = self.restart_attempts, "worker restart limit exceeded");
            self.shutdown().await;
            self.emit(SensorEvent::Terminated {
                kind: self.kind,
                message: err.to_string(),
            })
            .await;
            return Err(());
        }

        warn!(
            kind = %self.kind,
            attempt = self.restart_attempts,
            max = self.config.max_restarts,
            reason,
            "restarting worker"
        );
        self.emit(SensorEvent::ProcessingError {
            kind: self.kind,
            message: format!(
                "worker restarted after {reason} (attempt {}/{})",
                self.restart_attempts, self.config.max_restarts
            ),
        })
        .await;
        self.worker = Some((self.policy.worker_factory)(self.reply_tx.clone()));
        Ok(())
    }

    /// Close the stream, drain queued buffers back to the pool, drop the
    /// worker. Idempotent.
    async fn shutdown(&mut self) {
        if self.state == SensorState::Stopped {
            return;
        }
        self.state = SensorState::Stopping;
        self.driver.close_stream(self.kind).await;
        self.queue.clear();
        self.worker = None;
        self.in_flight = false;
        self.pending_health = None;
        self.state = SensorState::Stopped;
        info!(kind = %self.kind, frames = self.metrics.frames_processed, "sensor stopped");
        self.emit(SensorEvent::Stopped { kind: self.kind }).await;
    }

    fn status(&self) -> SensorStatus {
        SensorStatus {
            kind: self.kind,
            state: self.state,
            running: self.state == SensorState::Running,
            fps: self.metrics.fps,
            frames_processed: self.metrics.frames_processed,
            missed_frames: self.metrics.missed_frames,
            pool_drops: self.metrics.pool_drops,
            last_process_time_ms: self.metrics.last_ms,
            min_process_time_ms: if self.metrics.min_ms.is_finite() {
                self.metrics.min_ms
            } else {
                0.0
            },
            max_process_time_ms: self.metrics.max_ms,
            avg_process_time_ms: self.metrics.avg_ms(),
            restart_attempts: self.restart_attempts,
            max_restarts: self.config.max_restarts,
            queue_depth: self.queue.len(),
        }
    }
}
