mod common;
mod ort;
mod palm;

use crate::types::{Frame, HandLandmarks};

pub use self::ort::OrtHandDetector;

/// Finds hands in a frame. Implementations may keep internal buffers, so a
/// detector instance is owned by exactly one worker.
pub trait HandDetector: Send + 'static {
    /// Hands in detection order, each with 21 normalized landmarks.
    fn detect(&mut self, frame: &Frame) -> anyhow::Result<Vec<HandLandmarks>>;
}
