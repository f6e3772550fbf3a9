//! Per-stream processing workers.
//!
//! Each worker runs on its own OS thread and communicates with its sensor by
//! message passing: requests arrive on a synchronous channel with ownership
//! of the pooled frame buffer, replies return on an unbounded async channel.
//! Workers never share mutable state.
//!
//! The worker boundary is single-slot: the sensor keeps at most one frame in
//! flight, and any frame found queued behind a finished one (a frame that
//! arrived while the worker was busy) is discarded before the reply goes
//! out. The sensor-level queue is the only backpressure absorber. Health
//! checks are always answered, at worst right after the frame in progress.

pub mod body;
pub mod color;
pub mod depth;
pub mod infrared;

use crate::error::ProcessError;
use crate::frame::{FramePayload, GestureEvent, MovementEvent, RawFrame};
use crate::stream::StreamKind;
use self::body::{BodyParams, BodyProcessor};
use self::color::{ColorParams, ColorProcessor};
use self::depth::{DepthParams, DepthProcessor};
use self::infrared::{InfraredParams, InfraredProcessor};
use std::sync::mpsc;
use std::thread;
use std::time::Instant;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, trace, warn};

/// Messages accepted by a worker.
pub enum WorkerRequest {
    Frame(RawFrame),
    HealthCheck { nonce: u64 },
    Shutdown,
}

/// Messages produced by a worker.
#[derive(Debug)]
pub enum WorkerReply {
    Processed {
        captured_at_ms: u64,
        process_time_ms: f64,
        output: ProcessOutput,
    },
    Failed {
        captured_at_ms: u64,
        error: ProcessError,
    },
    Health {
        nonce: u64,
    },
}

/// A successful processing result.
#[derive(Debug)]
pub struct ProcessOutput {
    pub width: u32,
    pub height: u32,
    pub payload: FramePayload,
    pub side_events: Vec<SideEvent>,
}

/// Side-channel events emitted alongside the main artifact (body only).
#[derive(Debug)]
pub enum SideEvent {
    Movement(MovementEvent),
    Gesture(GestureEvent),
}

/// Kind-specific parameters handed to a worker at spawn.
#[derive(Debug, Clone)]
pub enum ProcessorParams {
    Depth(DepthParams),
    Infrared(InfraredParams),
    Color(ColorParams),
    Body(BodyParams),
}

enum KindProcessor {
    Depth(DepthProcessor),
    Infrared(InfraredProcessor),
    Color(ColorProcessor),
    Body(BodyProcessor),
}

impl KindProcessor {
    fn from_params(params: ProcessorParams) -> Self {
        match params {
            ProcessorParams::Depth(p) => KindProcessor::Depth(DepthProcessor::new(p)),
            ProcessorParams::Infrared(p) => KindProcessor::Infrared(InfraredProcessor::new(p)),
            ProcessorParams::Color(p) => KindProcessor::Color(ColorProcessor::new(p)),
            ProcessorParams::Body(p) => KindProcessor::Body(BodyProcessor::new(p)),
        }
    }

    fn process(&mut self, data: &[u8], timestamp_ms: u64) -> Result<ProcessOutput, ProcessError> {
        match self {
            KindProcessor::Depth(p) => p.process(data),
            KindProcessor::Infrared(p) => p.process(data),
            KindProcessor::Color(p) => p.process(data),
            KindProcessor::Body(p) => p.process(data, timestamp_ms),
        }
    }
}

/// Handle to a spawned worker thread.
///
/// Dropping the handle asks the worker to shut down; an in-flight frame is
/// abandoned and its buffer returns to the pool when the thread unwinds.
pub struct WorkerHandle {
    kind: StreamKind,
    tx: mpsc::Sender<WorkerRequest>,
}

impl WorkerHandle {
    /// Post a request to the worker. Fails when the worker thread is gone.
    pub fn post(&self, request: WorkerRequest) -> Result<(), WorkerRequest> {
        self.tx.send(request).map_err(|err| err.0)
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    /// Wrap an externally managed request channel, for tests that substitute
    /// hand-rolled workers.
    #[cfg(test)]
    pub(crate) fn from_parts(kind: StreamKind, tx: mpsc::Sender<WorkerRequest>) -> Self {
        Self { kind, tx }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        let _ = self.tx.send(WorkerRequest::Shutdown);
    }
}

/// Factory producing a worker wired to the given reply channel. Part of the
/// sensor's kind policy so tests can substitute slow or crashing workers.
pub type WorkerFactory =
    Box<dyn Fn(UnboundedSender<WorkerReply>) -> WorkerHandle + Send + Sync>;

/// Spawn a processing worker for the given kind.
pub fn spawn_worker(
    kind: StreamKind,
    params: ProcessorParams,
    reply_tx: UnboundedSender<WorkerReply>,
) -> WorkerHandle {
    let (tx, rx) = mpsc::channel();
    thread::Builder::new()
        .name(format!("{kind}-worker"))
        .spawn(move || worker_loop(kind, params, rx, reply_tx))
        .expect("worker thread spawn");
    WorkerHandle { kind, tx }
}

fn worker_loop(
    kind: StreamKind,
    params: ProcessorParams,
    rx: mpsc::Receiver<WorkerRequest>,
    reply_tx: UnboundedSender<WorkerReply>,
) {
    let mut processor = KindProcessor::from_params(params);
    debug!(%kind, "worker started");

    while let Ok(request) = rx.recv() {
        match request {
            WorkerRequest::Shutdown => break,
            WorkerRequest::HealthCheck { nonce } => {
                if reply_tx.send(WorkerReply::Health { nonce }).is_err() {
                    break;
                }
            }
            WorkerRequest::Frame(frame) => {
                let captured_at_ms = frame.timestamp_ms;
                let started = Instant::now();
                let result = processor.process(frame.bytes(), captured_at_ms);
                let process_time_ms = started.elapsed().as_secs_f64() * 1_000.0;
                drop(frame);

                // Anything queued behind the frame arrived while we were
                // busy; discard it before replying so the sensor's next
                // dispatch is the first frame the worker sees.
                let mut shutdown = false;
                loop {
                    match rx.try_recv() {
                        Ok(WorkerRequest::Frame(stale)) => {
                            trace!(%kind, "dropping frame received while processing");
                            drop(stale);
                        }
                        Ok(WorkerRequest::HealthCheck { nonce }) => {
                            let _ = reply_tx.send(WorkerReply::Health { nonce });
                        }
                        Ok(WorkerRequest::Shutdown) => {
                            shutdown = true;
                            break;
                        }
                        Err(_) => break,
                    }
                }

                let reply = match result {
                    Ok(output) => WorkerReply::Processed {
                        captured_at_ms,
                        process_time_ms,
                        output,
                    },
                    Err(error) => {
                        warn!(%kind, %error, "frame processing failed");
                        WorkerReply::Failed {
                            captured_at_ms,
                            error,
                        }
                    }
                };
                if shutdown || reply_tx.send(reply).is_err() {
                    break;
                }
            }
        }
    }
    debug!(%kind, "worker stopped");
}
