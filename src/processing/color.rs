//! Color stream processing.

use super::ProcessOutput;
use crate::error::ProcessError;
use crate::frame::{ColorArtifact, FramePayload};
use tracing::warn;

#[derive(Debug, Clone)]
pub struct Compression {
    pub format: String,
    pub quality: u8,
}

#[derive(Debug, Clone)]
pub struct ColorParams {
    pub width: u32,
    pub height: u32,
    /// Force every alpha byte to 255.
    pub force_alpha: bool,
    pub compression: Option<Compression>,
}

pub struct ColorProcessor {
    params: ColorParams,
    compression_warned: bool,
}

impl ColorProcessor {
    pub fn new(params: ColorParams) -> Self {
        Self {
            params,
            compression_warned: false,
        }
    }

    pub fn process(&mut self, data: &[u8]) -> Result<ProcessOutput, ProcessError> {
        let p = &self.params;
        let expected = (p.width * p.height) as usize * 4;
        if data.len() != expected {
            return Err(ProcessError::InvalidBufferLength {
                expected,
                actual: data.len(),
            });
        }

        let mut processed = data.to_vec();
        if p.force_alpha {
            for px in processed.chunks_exact_mut(4) {
                px[3] = 255;
            }
        }

        // No encoder is wired up yet; the payload stays raw and says so
        // rather than mislabeling itself as compressed.
        if let Some(compression) = &p.compression {
            if !self.compression_warned {
                warn!(
                    format = %compression.format,
                    quality = compression.quality,
                    "color compression requested but no encoder is available, sending raw frames"
                );
                self.compression_warned = true;
            }
        }

        Ok(ProcessOutput {
            width: p.width,
            height: p.height,
            payload: FramePayload::Color(ColorArtifact {
                processed,
                format: "rgba",
                compressed: false,
            }),
            side_events: Vec::new(),
        })
    }
}
