//! # depthcast
//!
//! Capture-to-broadcast service for a time-of-flight depth camera. The
//! device emits four independent streams (depth, infrared, color, body
//! tracking); each enabled stream is processed on a dedicated worker,
//! optionally synchronized across streams against a shared wall-clock
//! window, and fanned out to network subscribers over a framed message
//! protocol.
//!
//! ## Crate structure
//!
//! - **`stream`**: stream kinds and their fixed buffer geometry.
//! - **`pool`**: the per-kind reusable-buffer pool with leased buffers.
//! - **`frame`**: raw and processed frame types, body records, sync bundles.
//! - **`processing`**: the worker harness plus the four kind kernels.
//! - **`sensor`**: per-stream sensors with queueing and worker supervision.
//! - **`sync`**: the multi-source frame synchronizer.
//! - **`device`**: the `DepthCamera` driver seam and the mock camera.
//! - **`network`**: the subscriber wire protocol and broadcast fan-out.
//! - **`service`**: the supervisor wiring everything together.
//! - **`config`** / **`validation`**: settings loading and checking.
//! - **`logging`**: tracing subscriber setup.
//! - **`error`**: component error types.

pub mod config;
pub mod device;
pub mod error;
pub mod frame;
pub mod logging;
pub mod network;
pub mod pool;
pub mod processing;
pub mod sensor;
pub mod service;
pub mod stream;
pub mod sync;
pub mod validation;

pub use config::Settings;
pub use error::{PoolError, ProcessError, SensorError, SyncError};
pub use pool::{BufferLease, BufferPool, PoolConfig, PoolStats};
pub use service::{launch, ServiceHandle};
pub use stream::StreamKind;
