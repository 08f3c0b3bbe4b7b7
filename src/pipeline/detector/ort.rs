use std::path::Path;

use anyhow::{Context, Result, anyhow};
use ort::session::{Session, builder::GraphOptimizationLevel};
use ort::value::Tensor;

use super::{
    HandDetector,
    common::{self, HANDPOSE_INPUT_SIZE},
    palm::{PalmDetector, PalmDetectorConfig, PalmRegion, crop_from_palm},
};
use crate::{
    config::DetectorConfig,
    types::{Frame, HandLandmarks},
};

/// Palm detection followed by hand-pose estimation on each palm crop.
pub struct OrtHandDetector {
    handpose: Session,
    palm_detector: PalmDetector,
    max_hands: usize,
    min_confidence: f32,
}

struct HandposeOutput {
    pixels: Vec<(f32, f32)>,
    confidence: f32,
    handedness: f32,
}

impl OrtHandDetector {
    pub fn new(
        handpose_model_path: &Path,
        palm_detector_model_path: &Path,
        cfg: &DetectorConfig,
    ) -> Result<Self> {
        let handpose = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(1)?
            .commit_from_file(handpose_model_path)
            .with_context(|| {
                format!(
                    "failed to load handpose model from {}",
                    handpose_model_path.display()
                )
            })?;

        let palm_detector =
            PalmDetector::new(palm_detector_model_path, PalmDetectorConfig::from(cfg))?;

        Ok(Self {
            handpose,
            palm_detector,
            max_hands: cfg.max_hands,
            min_confidence: cfg.min_detection_confidence,
        })
    }

    fn estimate(&mut self, frame: &Frame, palm: &PalmRegion) -> Result<HandposeOutput> {
        let (center, side, angle) = crop_from_palm(palm);
        let (input, transform) =
            common::prepare_rotated_crop(frame, center, side, angle, HANDPOSE_INPUT_SIZE)?;
        let tensor = Tensor::from_array(input)?;
        let outputs = self
            .handpose
            .run(ort::inputs![tensor])
            .context("failed to run handpose session")?;

        if outputs.len() < 1 {
            return Err(anyhow!("handpose model returned no outputs"));
        }

        let coords = outputs[0].try_extract_array::<f32>()?;
        let flattened: Vec<f32> = coords.iter().copied().collect();
        let crop_landmarks = common::decode_landmarks(&flattened)?;

        let scalar_output = |idx: usize| -> f32 {
            if outputs.len() <= idx {
                return 0.0;
            }
            outputs[idx]
                .try_extract_array::<f32>()
                .ok()
                .and_then(|arr| arr.iter().next().copied())
                .unwrap_or(0.0)
        };
        let confidence = scalar_output(1);
        let handedness = scalar_output(2);

        Ok(HandposeOutput {
            pixels: transform.project_all(&crop_landmarks),
            confidence: (confidence * palm.score).clamp(0.0, 1.0),
            handedness,
        })
    }
}

impl HandDetector for OrtHandDetector {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<HandLandmarks>> {
        let palms = self.palm_detector.detect(frame)?;
        log::debug!("palm detector found {} candidate(s)", palms.len());

        let (max_hands, min_confidence) = (self.max_hands, self.min_confidence);
        let outputs = select_hands(&palms, max_hands, min_confidence, |palm| {
            self.estimate(frame, palm)
        })?;

        Ok(outputs
            .into_iter()
            .map(|output| {
                HandLandmarks::from_pixels(
                    &output.pixels,
                    frame.width,
                    frame.height,
                    output.confidence,
                    output.handedness,
                )
            })
            .collect())
    }
}

/// Walks palms best-first and keeps the first `max_hands` whose hand-pose
/// confidence clears `min_confidence`.
fn select_hands<F>(
    palms: &[PalmRegion],
    max_hands: usize,
    min_confidence: f32,
    mut estimate: F,
) -> Result<Vec<HandposeOutput>>
where
    F: FnMut(&PalmRegion) -> Result<HandposeOutput>,
{
    let mut hands = Vec::with_capacity(max_hands);
    for palm in palms {
        if hands.len() == max_hands {
            break;
        }
        let output = estimate(palm)?;
        if output.confidence < min_confidence {
            log::debug!(
                "dropping hand with confidence {:.3} below {:.3}",
                output.confidence,
                min_confidence
            );
            continue;
        }
        hands.push(output);
    }
    Ok(hands)
}
