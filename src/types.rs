use std::fmt;

use serde::Serialize;

pub const LANDMARKS_PER_HAND: usize = 21;
/// Values contributed by one hand to the raw landmark vector (x, y per point).
pub const VALUES_PER_HAND: usize = LANDMARKS_PER_HAND * 2;

#[derive(Clone, Debug)]
pub struct Frame {
    pub rgba: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// A hand keypoint in image-relative coordinates, both axes in `[0, 1]`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LandmarkPoint {
    pub x: f32,
    pub y: f32,
}

#[derive(Clone, Debug)]
pub struct HandLandmarks {
    pub points: Vec<LandmarkPoint>,
    pub confidence: f32,
    pub handedness: f32,
}

impl HandLandmarks {
    /// Builds a hand from pixel coordinates, normalizing by the frame size.
    pub fn from_pixels(
        pixels: &[(f32, f32)],
        width: u32,
        height: u32,
        confidence: f32,
        handedness: f32,
    ) -> Self {
        let w = width.max(1) as f32;
        let h = height.max(1) as f32;
        let points = pixels
            .iter()
            .take(LANDMARKS_PER_HAND)
            .map(|&(x, y)| LandmarkPoint {
                x: (x / w).clamp(0.0, 1.0),
                y: (y / h).clamp(0.0, 1.0),
            })
            .collect();

        Self {
            points,
            confidence,
            handedness,
        }
    }
}

/// The classifier's answer for one feature vector.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct PredictionLabel(pub String);

impl fmt::Display for PredictionLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
