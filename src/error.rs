//! Custom error types for the service.
//!
//! Errors are recovered at the innermost boundary where recovery is
//! meaningful: pool errors make the caller drop a frame, processing errors
//! become sensor events, sensor errors surface to the supervisor. Only
//! configuration and device-open failures propagate out of `start` paths.

use crate::stream::StreamKind;
use thiserror::Error;

/// Errors reported by the buffer pool.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("buffer pool exhausted acquiring {kind}: {in_use} of {total} buffers in use")]
    Exhausted {
        kind: StreamKind,
        total: usize,
        in_use: usize,
    },

    #[error("released buffer is not tracked by the {kind} pool")]
    UntrackedBuffer { kind: StreamKind },

    #[error("cannot resize pool to {requested}: {in_use} buffers outstanding")]
    ShrinkBelowInUse { requested: usize, in_use: usize },

    #[error("cannot clear pool: {outstanding} buffers outstanding")]
    ClearWhileInUse { outstanding: usize },
}

/// Errors produced by the per-kind processing workers.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProcessError {
    #[error("invalid buffer length: expected {expected} bytes, got {actual}")]
    InvalidBufferLength { expected: usize, actual: usize },

    #[error("invalid calibration: {0}")]
    InvalidCalibration(String),

    #[error("malformed body record: {0}")]
    MalformedBody(String),
}

/// Errors surfaced by a sensor's public operations.
#[derive(Debug, Error)]
pub enum SensorError {
    #[error("device refused to open the {kind} stream")]
    DriverRefused { kind: StreamKind },

    #[error("{kind} frame size mismatch: expected {expected} bytes, got {actual}")]
    InvalidFrameSize {
        kind: StreamKind,
        expected: usize,
        actual: usize,
    },

    #[error("the {kind} sensor is not running")]
    NotRunning { kind: StreamKind },

    #[error("the {kind} sensor is not enabled in the configuration")]
    NotEnabled { kind: StreamKind },

    #[error("{kind} worker exceeded the restart limit after {attempts} attempts")]
    RestartLimitExceeded { kind: StreamKind, attempts: u32 },
}

/// Errors from the multi-source frame synchronizer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("frame synchronization requires at least one enabled stream")]
    NoStreamsEnabled,

    #[error("device refused to open the multi-source stream")]
    DriverRefused,
}
