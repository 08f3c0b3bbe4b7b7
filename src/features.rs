//! Fixed-width feature layout expected by the letter classifier.
//!
//! The classifier was trained on a two-hand layout of 84 values. A single
//! detected hand keeps its positions and the second hand's slots are zero.

use thiserror::Error;

use crate::types::{HandLandmarks, VALUES_PER_HAND};

pub const FEATURE_LEN: usize = VALUES_PER_HAND * 2;

#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("no hand detected in image")]
    NoHandDetected,
    #[error("unusable landmark count: got {len} values, expected {one} or {two}", one = VALUES_PER_HAND, two = FEATURE_LEN)]
    UnusableLandmarkCount { len: usize },
}

/// Exactly [`FEATURE_LEN`] values. Only constructed through [`normalize`].
#[derive(Clone, Debug, PartialEq)]
pub struct FeatureVector(Vec<f32>);

impl FeatureVector {
    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }
}

/// Flattens detected hands into `[x0, y0, x1, y1, ...]` in detection order.
pub fn flatten_hands(hands: &[HandLandmarks]) -> Vec<f32> {
    hands
        .iter()
        .flat_map(|hand| hand.points.iter().flat_map(|p| [p.x, p.y]))
        .collect()
}

pub fn normalize(raw: &[f32]) -> Result<FeatureVector, NormalizeError> {
    match raw.len() {
        0 => Err(NormalizeError::NoHandDetected),
        VALUES_PER_HAND => {
            let mut features = Vec::with_capacity(FEATURE_LEN);
            features.extend_from_slice(raw);
            features.resize(FEATURE_LEN, 0.0);
            Ok(FeatureVector(features))
        }
        FEATURE_LEN => Ok(FeatureVector(raw.to_vec())),
        len => Err(NormalizeError::UnusableLandmarkCount { len }),
    }
}
