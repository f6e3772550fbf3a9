//! Infrared stream processing.

use super::ProcessOutput;
use crate::error::ProcessError;
use crate::frame::{FramePayload, InfraredArtifact};

#[derive(Debug, Clone)]
pub struct InfraredParams {
    pub width: u32,
    pub height: u32,
    /// Normalize to `[0, 1]` and apply exponent 0.5.
    pub gamma: bool,
}

pub struct InfraredProcessor {
    params: InfraredParams,
}

impl InfraredProcessor {
    pub fn new(params: InfraredParams) -> Self {
        Self { params }
    }

    pub fn process(&self, data: &[u8]) -> Result<ProcessOutput, ProcessError> {
        let p = &self.params;
        let pixels = (p.width * p.height) as usize;
        let expected = pixels * 2;
        if data.len() != expected {
            return Err(ProcessError::InvalidBufferLength {
                expected,
                actual: data.len(),
            });
        }

        let mut processed = Vec::with_capacity(pixels);
        for raw in data.chunks_exact(2) {
            let value = u16::from_le_bytes([raw[0], raw[1]]);
            if p.gamma {
                processed.push((f32::from(value) / f32::from(u16::MAX)).powf(0.5));
            } else {
                processed.push(f32::from(value));
            }
        }

        Ok(ProcessOutput {
            width: p.width,
            height: p.height,
            payload: FramePayload::Infrared(InfraredArtifact {
                processed,
                format: if p.gamma { "float32" } else { "uint16" },
            }),
            side_events: Vec::new(),
        })
    }
}
