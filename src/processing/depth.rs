//! Depth stream processing.
//!
//! Applies the reliability filter, optional normalization with gamma,
//! optional point-cloud projection through the camera intrinsics, and
//! optional colorization through a named lookup table.

use super::ProcessOutput;
use crate::error::ProcessError;
use crate::frame::{DepthArtifact, FramePayload};
use serde::{Deserialize, Serialize};

/// Camera intrinsics for projecting depth pixels into camera space.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Calibration {
    pub focal_x: f32,
    pub focal_y: f32,
    pub principal_x: f32,
    pub principal_y: f32,
}

impl Default for Calibration {
    fn default() -> Self {
        Self {
            focal_x: 365.456,
            focal_y: 365.456,
            principal_x: 254.878,
            principal_y: 205.395,
        }
    }
}

impl Calibration {
    fn validate(&self) -> Result<(), ProcessError> {
        if self.focal_x <= 0.0 || self.focal_y <= 0.0 {
            return Err(ProcessError::InvalidCalibration(format!(
                "focal length must be positive (fx={}, fy={})",
                self.focal_x, self.focal_y
            )));
        }
        if !self.principal_x.is_finite() || !self.principal_y.is_finite() {
            return Err(ProcessError::InvalidCalibration(
                "principal point must be finite".to_string(),
            ));
        }
        Ok(())
    }
}

/// Named lookup tables for depth colorization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorMap {
    Grayscale,
    Jet,
    Thermal,
}

impl ColorMap {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "grayscale" => Some(ColorMap::Grayscale),
            "jet" => Some(ColorMap::Jet),
            "thermal" => Some(ColorMap::Thermal),
            _ => None,
        }
    }

    /// Map a normalized value in `[0, 1]` to an RGB triplet.
    fn lookup(self, value: f32) -> [u8; 3] {
        let v = value.clamp(0.0, 1.0);
        match self {
            ColorMap::Grayscale => {
                let g = (v * 255.0) as u8;
                [g, g, g]
            }
            ColorMap::Jet => {
                let r = ((1.5 - (4.0 * v - 3.0).abs()).clamp(0.0, 1.0) * 255.0) as u8;
                let g = ((1.5 - (4.0 * v - 2.0).abs()).clamp(0.0, 1.0) * 255.0) as u8;
                let b = ((1.5 - (4.0 * v - 1.0).abs()).clamp(0.0, 1.0) * 255.0) as u8;
                [r, g, b]
            }
            ColorMap::Thermal => {
                let r = ((v * 3.0).clamp(0.0, 1.0) * 255.0) as u8;
                let g = ((v * 3.0 - 1.0).clamp(0.0, 1.0) * 255.0) as u8;
                let b = ((v * 3.0 - 2.0).clamp(0.0, 1.0) * 255.0) as u8;
                [r, g, b]
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct DepthParams {
    pub width: u32,
    pub height: u32,
    /// Reliability band lower bound, millimeters.
    pub min_distance: u16,
    /// Reliability band upper bound, millimeters.
    pub max_distance: u16,
    pub normalize: bool,
    /// Apply exponent 0.5 to normalized values.
    pub gamma: bool,
    pub point_cloud: bool,
    pub colorize: Option<ColorMap>,
    pub calibration: Calibration,
}

pub struct DepthProcessor {
    params: DepthParams,
}

impl DepthProcessor {
    pub fn new(params: DepthParams) -> Self {
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
        if p.point_cloud {
            p.calibration.validate()?;
        }

        let range = f32::from(p.max_distance - p.min_distance);
        let mut processed = Vec::with_capacity(pixels);
        let mut min_depth = u16::MAX;
        let mut max_depth = 0u16;
        let mut point_cloud = p.point_cloud.then(Vec::new);
        let color_map = p.colorize;
        let mut colorized = color_map.map(|_| Vec::with_capacity(pixels * 3));

        for (i, raw) in data.chunks_exact(2).enumerate() {
            let depth = u16::from_le_bytes([raw[0], raw[1]]);
            let reliable = depth >= p.min_distance && depth <= p.max_distance;

            let normalized = if reliable {
                f32::from(depth - p.min_distance) / range
            } else {
                0.0
            };

            if reliable {
                min_depth = min_depth.min(depth);
                max_depth = max_depth.max(depth);

                if let Some(cloud) = point_cloud.as_mut() {
                    let x = (i as u32 % p.width) as f32;
                    let y = (i as u32 / p.width) as f32;
                    let z = f32::from(depth);
                    cloud.push((x - p.calibration.principal_x) * z / p.calibration.focal_x);
                    cloud.push((y - p.calibration.principal_y) * z / p.calibration.focal_y);
                    cloud.push(z);
                }
            }

            let value = if !reliable {
                0.0
            } else if p.normalize {
                if p.gamma {
                    normalized.powf(0.5)
                } else {
                    normalized
                }
            } else {
                f32::from(depth)
            };
            processed.push(value);

            if let (Some(lut), Some(map)) = (colorized.as_mut(), color_map) {
                lut.extend_from_slice(&map.lookup(normalized));
            }
        }

        if min_depth == u16::MAX {
            min_depth = 0;
        }

        Ok(ProcessOutput {
            width: p.width,
            height: p.height,
            payload: FramePayload::Depth(DepthArtifact {
                processed,
                min_depth,
                max_depth,
                point_cloud,
                colorized,
            }),
            side_events: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> DepthParams {
        DepthParams {
            width: 3,
            height: 1,
            min_distance: 500,
            max_distance: 4_500,
            normalize: true,
            gamma: true,
            point_cloud: false,
            colorize: None,
            calibration: Calibration::default(),
        }
    }

    fn encode(values: &[u16]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    fn artifact(output: ProcessOutput) -> DepthArtifact {
        match output.payload {
            FramePayload::Depth(a) => a,
            _ => panic!("expected depth payload"),
        }
    }

    #[test]
    fn test_filter_normalize_gamma() {
        let processor = DepthProcessor::new(params());
        let output = processor.process(&encode(&[100, 5_000, 2_000])).unwrap();
        let artifact = artifact(output);

        assert_eq!(artifact.processed[0], 0.0);
        assert_eq!(artifact.processed[1], 0.0);
        // 2000 normalizes to 0.375; gamma takes the square root.
        assert!((artifact.processed[2] - 0.612_37).abs() < 1e-4);
        assert_eq!(artifact.min_depth, 2_000);
        assert_eq!(artifact.max_depth, 2_000);
    }

    #[test]
    fn test_normalize_without_gamma() {
        let mut p = params();
        p.gamma = false;
        let processor = DepthProcessor::new(p);
        let output = processor.process(&encode(&[100, 5_000, 2_000])).unwrap();
        assert!((artifact(output).processed[2] - 0.375).abs() < 1e-6);
    }

    #[test]
    fn test_raw_passthrough() {
        let mut p = params();
        p.normalize = false;
        p.gamma = false;
        let processor = DepthProcessor::new(p);
        let output = processor.process(&encode(&[100, 5_000, 2_000])).unwrap();
        let artifact = artifact(output);
        assert_eq!(artifact.processed, vec![0.0, 0.0, 2_000.0]);
    }

    #[test]
    fn test_invalid_length() {
        let processor = DepthProcessor::new(params());
        let err = processor.process(&encode(&[100])).unwrap_err();
        assert_eq!(
            err,
            ProcessError::InvalidBufferLength {
                expected: 6,
                actual: 2
            }
        );
    }

    #[test]
    fn test_point_cloud_projection() {
        let mut p = params();
        p.point_cloud = true;
        p.calibration = Calibration {
            focal_x: 2.0,
            focal_y: 2.0,
            principal_x: 1.0,
            principal_y: 0.0,
        };
        let processor = DepthProcessor::new(p);
        let output = processor.process(&encode(&[100, 1_000, 2_000])).unwrap();
        let cloud = artifact(output).point_cloud.unwrap();
        // Only the two reliable pixels project; pixel index 1 sits on the
        // principal point so its x is zero.
        assert_eq!(cloud.len(), 6);
        assert_eq!(&cloud[0..3], &[0.0, 0.0, 1_000.0]);
        assert_eq!(&cloud[3..6], &[1_000.0, 0.0, 2_000.0]);
    }

    #[test]
    fn test_invalid_calibration() {
        let mut p = params();
        p.point_cloud = true;
        p.calibration.focal_x = 0.0;
        let processor = DepthProcessor::new(p);
        let err = processor.process(&encode(&[100, 1_000, 2_000])).unwrap_err();
        assert!(matches!(err, ProcessError::InvalidCalibration(_)));
    }

    #[test]
    fn test_colorize() {
        let mut p = params();
        p.colorize = Some(ColorMap::Grayscale);
        let processor = DepthProcessor::new(p);
        let output = processor.process(&encode(&[100, 4_500, 2_000])).unwrap();
        let lut = artifact(output).colorized.unwrap();
        assert_eq!(lut.len(), 9);
        // Filtered pixel maps to black, the top of the band to white.
        assert_eq!(&lut[0..3], &[0, 0, 0]);
        assert_eq!(&lut[3..6], &[255, 255, 255]);
    }

    #[test]
    fn test_color_map_names() {
        assert_eq!(ColorMap::from_name("jet"), Some(ColorMap::Jet));
        assert_eq!(ColorMap::from_name("grayscale"), Some(ColorMap::Grayscale));
        assert!(ColorMap::from_name("viridis").is_none());
    }
}
