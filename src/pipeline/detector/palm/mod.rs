mod anchors;

use std::{cmp::Ordering, f32::consts::PI, path::Path};

use anchors::{NUM_ANCHORS, anchors};
use anyhow::{Context, Result, anyhow};
use ort::session::{Session, builder::GraphOptimizationLevel};
use ort::value::Tensor;

use crate::{config::DetectorConfig, types::Frame};

use super::common::{LetterboxInfo, PALM_INPUT_SIZE, prepare_frame_with_size};

const PALM_LANDMARKS: usize = 7;
/// The hand-pose crop is this much larger than the palm so fingers fit.
const CROP_EXPANSION: f32 = 2.4;
const MIN_CROP_SIDE: f32 = 80.0;
const TOP_K: usize = 32;

#[derive(Clone, Debug)]
pub struct PalmDetectorConfig {
    pub score_threshold: f32,
    pub nms_threshold: f32,
    pub top_k: usize,
}

impl From<&DetectorConfig> for PalmDetectorConfig {
    fn from(cfg: &DetectorConfig) -> Self {
        Self {
            score_threshold: cfg.palm_score_threshold,
            nms_threshold: cfg.palm_nms_threshold,
            top_k: TOP_K,
        }
    }
}

/// A palm found by the SSD detector, in source-frame pixels.
#[derive(Clone, Debug)]
pub struct PalmRegion {
    pub bbox: [f32; 4],
    pub landmarks: Vec<(f32, f32)>,
    pub score: f32,
}

pub struct PalmDetector {
    session: Session,
    cfg: PalmDetectorConfig,
}

impl PalmDetector {
    pub fn new(model_path: &Path, cfg: PalmDetectorConfig) -> Result<Self> {
        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(1)?
            .commit_from_file(model_path)
            .with_context(|| {
                format!("failed to load palm detector from {}", model_path.display())
            })?;

        Ok(Self { session, cfg })
    }

    /// Palms sorted by descending score, at most `top_k`.
    pub fn detect(&mut self, frame: &Frame) -> Result<Vec<PalmRegion>> {
        let (input, letterbox) = prepare_frame_with_size(frame, PALM_INPUT_SIZE)?;
        let tensor = Tensor::from_array(input)?;

        let outputs = self
            .session
            .run(ort::inputs![tensor])
            .context("failed to run palm detector session")?;

        if outputs.len() < 2 {
            return Err(anyhow!(
                "palm detector returned {} outputs, expected at least 2",
                outputs.len()
            ));
        }

        let box_and_landmarks = outputs[0].try_extract_array::<f32>()?;
        let scores = outputs[1].try_extract_array::<f32>()?;

        let box_shape = box_and_landmarks.shape().to_vec();
        let score_shape = scores.shape().to_vec();

        decode_palm_outputs(
            box_and_landmarks
                .as_slice()
                .ok_or_else(|| anyhow!("palm boxes not contiguous"))?,
            &box_shape,
            scores
                .as_slice()
                .ok_or_else(|| anyhow!("palm scores not contiguous"))?,
            &score_shape,
            &letterbox,
            &self.cfg,
        )
    }
}

fn decode_palm_outputs(
    box_landmark: &[f32],
    box_shape: &[usize],
    scores: &[f32],
    score_shape: &[usize],
    letterbox: &LetterboxInfo,
    cfg: &PalmDetectorConfig,
) -> Result<Vec<PalmRegion>> {
    let [.., anchor_dim, feature_dim] = box_shape else {
        return Err(anyhow!(
            "unexpected palm box shape {box_shape:?}, need [batch, anchors, features]"
        ));
    };
    let [.., score_anchor_dim, score_feature_dim] = score_shape else {
        return Err(anyhow!(
            "unexpected palm score shape {score_shape:?}, need [batch, anchors, 1]"
        ));
    };
    let (anchor_dim, feature_dim) = (*anchor_dim, *feature_dim);
    let score_feature_dim = *score_feature_dim;

    if feature_dim < 4 + PALM_LANDMARKS * 2 {
        return Err(anyhow!(
            "palm box feature dimension too small: {feature_dim}"
        ));
    }
    if anchor_dim != *score_anchor_dim {
        return Err(anyhow!(
            "anchor dimension mismatch between boxes ({anchor_dim}) and scores ({score_anchor_dim})"
        ));
    }

    let anchor_table = anchors();
    let count = NUM_ANCHORS.min(anchor_dim);
    let pad_bias_x = letterbox.pad_x / letterbox.scale;
    let pad_bias_y = letterbox.pad_y / letterbox.scale;
    let scale = letterbox.orig_w.max(letterbox.orig_h) as f32;
    let target_input = PALM_INPUT_SIZE as f32;

    let mut candidates = Vec::new();
    for anchor_idx in 0..count {
        let raw_score = *scores
            .get(anchor_idx * score_feature_dim)
            .ok_or_else(|| anyhow!("missing score for palm anchor {anchor_idx}"))?;
        let score = sigmoid(raw_score);
        if score < cfg.score_threshold {
            continue;
        }

        let offset = anchor_idx * feature_dim;
        let features = box_landmark
            .get(offset..offset + 4 + PALM_LANDMARKS * 2)
            .ok_or_else(|| anyhow!("missing box features for palm anchor {anchor_idx}"))?;
        let anchor = anchor_table[anchor_idx];

        let cx = features[0] / target_input + anchor[0];
        let cy = features[1] / target_input + anchor[1];
        let hw = features[2] / target_input / 2.0;
        let hh = features[3] / target_input / 2.0;

        let mut bbox = [
            (cx - hw) * scale - pad_bias_x,
            (cy - hh) * scale - pad_bias_y,
            (cx + hw) * scale - pad_bias_x,
            (cy + hh) * scale - pad_bias_y,
        ];
        if bbox[2] <= bbox[0] || bbox[3] <= bbox[1] {
            continue;
        }
        clamp_box(&mut bbox, letterbox.orig_w, letterbox.orig_h);

        let landmarks = features[4..]
            .chunks_exact(2)
            .map(|pt| {
                (
                    (pt[0] / target_input + anchor[0]) * scale - pad_bias_x,
                    (pt[1] / target_input + anchor[1]) * scale - pad_bias_y,
                )
            })
            .collect();

        candidates.push(PalmRegion {
            bbox,
            landmarks,
            score,
        });
    }

    let kept = nms(&candidates, cfg.nms_threshold, cfg.top_k);
    Ok(kept
        .into_iter()
        .filter_map(|idx| candidates.get(idx).cloned())
        .collect())
}

/// Center, side and rotation of the square hand-pose crop around a palm.
pub fn crop_from_palm(region: &PalmRegion) -> ((f32, f32), f32, f32) {
    let center = if region.landmarks.is_empty() {
        (
            (region.bbox[0] + region.bbox[2]) * 0.5,
            (region.bbox[1] + region.bbox[3]) * 0.5,
        )
    } else {
        let (sum_x, sum_y) = region
            .landmarks
            .iter()
            .fold((0.0_f32, 0.0_f32), |acc, p| (acc.0 + p.0, acc.1 + p.1));
        (
            sum_x / region.landmarks.len() as f32,
            sum_y / region.landmarks.len() as f32,
        )
    };

    let base_w = (region.bbox[2] - region.bbox[0]).abs();
    let base_h = (region.bbox[3] - region.bbox[1]).abs();
    let landmark_span = if region.landmarks.is_empty() {
        0.0
    } else {
        let (min_x, max_x, min_y, max_y) = region
            .landmarks
            .iter()
            .fold((f32::MAX, f32::MIN, f32::MAX, f32::MIN), |acc, (x, y)| {
                (acc.0.min(*x), acc.1.max(*x), acc.2.min(*y), acc.3.max(*y))
            });
        (max_x - min_x).max(max_y - min_y)
    };
    let side = base_w.max(base_h).max(landmark_span).max(MIN_CROP_SIDE) * CROP_EXPANSION;

    (center, side, estimate_orientation(region))
}

fn estimate_orientation(region: &PalmRegion) -> f32 {
    let n = region.landmarks.len();
    if n < 2 {
        return 0.0;
    }

    // Principal axis of the palm keypoints.
    let (sx, sy) = region
        .landmarks
        .iter()
        .fold((0.0_f32, 0.0_f32), |acc, (x, y)| (acc.0 + x, acc.1 + y));
    let mean = (sx / n as f32, sy / n as f32);

    let (mut cov_xx, mut cov_xy, mut cov_yy) = (0.0_f32, 0.0_f32, 0.0_f32);
    for (x, y) in &region.landmarks {
        let dx = x - mean.0;
        let dy = y - mean.1;
        cov_xx += dx * dx;
        cov_xy += dx * dy;
        cov_yy += dy * dy;
    }
    cov_xx /= n as f32;
    cov_xy /= n as f32;
    cov_yy /= n as f32;

    let trace = cov_xx + cov_yy;
    let det = cov_xx * cov_yy - cov_xy * cov_xy;
    let lambda1 = (trace * 0.5 + ((trace * 0.5).powi(2) - det).max(0.0).sqrt()).max(1e-6);
    let (vx, vy) = if cov_xy.abs() > 1e-6 {
        (lambda1 - cov_yy, cov_xy)
    } else if cov_xx >= cov_yy {
        (1.0, 0.0)
    } else {
        (0.0, 1.0)
    };

    vy.atan2(vx) - PI * 0.5
}

fn nms(candidates: &[PalmRegion], threshold: f32, top_k: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..candidates.len()).collect();
    order.sort_by(|a, b| {
        candidates[*b]
            .score
            .partial_cmp(&candidates[*a].score)
            .unwrap_or(Ordering::Equal)
    });

    let mut keep: Vec<usize> = Vec::new();
    'outer: for &idx in &order {
        for &k in &keep {
            if iou(&candidates[idx].bbox, &candidates[k].bbox) >= threshold {
                continue 'outer;
            }
        }
        keep.push(idx);
        if keep.len() >= top_k {
            break;
        }
    }
    keep
}

fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let inter_w = (a[2].min(b[2]) - a[0].max(b[0])).max(0.0);
    let inter_h = (a[3].min(b[3]) - a[1].max(b[1])).max(0.0);
    let inter = inter_w * inter_h;
    if inter <= 0.0 {
        return 0.0;
    }

    let area_a = (a[2] - a[0]).max(0.0) * (a[3] - a[1]).max(0.0);
    let area_b = (b[2] - b[0]).max(0.0) * (b[3] - b[1]).max(0.0);
    let union = area_a + area_b - inter;
    if union <= 0.0 { 0.0 } else { inter / union }
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

fn clamp_box(bbox: &mut [f32; 4], w: u32, h: u32) {
    let max_w = (w.saturating_sub(1)) as f32;
    let max_h = (h.saturating_sub(1)) as f32;
    bbox[0] = bbox[0].clamp(0.0, max_w);
    bbox[1] = bbox[1].clamp(0.0, max_h);
    bbox[2] = bbox[2].clamp(0.0, max_w);
    bbox[3] = bbox[3].clamp(0.0, max_h);
}

#[cfg(test)]
mod tests {
    use super::*;

    const FEATURES: usize = 4 + PALM_LANDMARKS * 2;

    fn region(bbox: [f32; 4], score: f32) -> PalmRegion {
        PalmRegion {
            bbox,
            landmarks: Vec::new(),
            score,
        }
    }

    fn default_cfg() -> PalmDetectorConfig {
        PalmDetectorConfig::from(&DetectorConfig::default())
    }

    fn logit(p: f32) -> f32 {
        (p / (1.0 - p)).ln()
    }

    fn square_letterbox() -> LetterboxInfo {
        LetterboxInfo {
            scale: 1.0,
            pad_x: 0.0,
            pad_y: 0.0,
            orig_w: PALM_INPUT_SIZE,
            orig_h: PALM_INPUT_SIZE,
        }
    }

    #[test]
    fn iou_of_identical_boxes_is_one() {
        let b = [0.0, 0.0, 10.0, 10.0];
        assert!((iou(&b, &b) - 1.0).abs() < 1e-6);
        assert_eq!(iou(&b, &[20.0, 20.0, 30.0, 30.0]), 0.0);
    }

    #[test]
    fn nms_keeps_best_of_overlapping_boxes() {
        let candidates = vec![
            region([0.0, 0.0, 10.0, 10.0], 0.6),
            region([1.0, 1.0, 11.0, 11.0], 0.9),
            region([50.0, 50.0, 60.0, 60.0], 0.7),
        ];
        assert_eq!(nms(&candidates, 0.3, 10), vec![1, 2]);
        assert_eq!(nms(&candidates, 0.3, 1), vec![1]);
    }

    #[test]
    fn decode_skips_low_scores_and_maps_to_pixels() {
        let anchors = NUM_ANCHORS;
        let mut boxes = vec![0.0_f32; anchors * FEATURES];
        let mut scores = vec![-10.0_f32; anchors];

        // Anchor 0 sits at (4, 4) in a 192 input; give it a 20px box.
        boxes[2] = 20.0;
        boxes[3] = 20.0;
        scores[0] = 5.0;

        let palms = decode_palm_outputs(
            &boxes,
            &[1, anchors, FEATURES],
            &scores,
            &[1, anchors, 1],
            &square_letterbox(),
            &default_cfg(),
        )
        .unwrap();

        assert_eq!(palms.len(), 1);
        let palm = &palms[0];
        assert!(palm.score > 0.99);
        assert_eq!(palm.landmarks.len(), PALM_LANDMARKS);
        assert!((palm.bbox[0] - 0.0).abs() < 1e-3);
        assert!((palm.bbox[2] - 14.0).abs() < 1e-3);
        assert!((palm.landmarks[0].0 - 4.0).abs() < 1e-3);
    }

    #[test]
    fn weak_palm_passes_default_detection_gate() {
        let anchors = NUM_ANCHORS;
        let mut boxes = vec![0.0_f32; anchors * FEATURES];
        let mut scores = vec![-10.0_f32; anchors];
        boxes[2] = 20.0;
        boxes[3] = 20.0;
        scores[0] = logit(0.3);

        let cfg = default_cfg();
        let palms = decode_palm_outputs(
            &boxes,
            &[1, anchors, FEATURES],
            &scores,
            &[1, anchors, 1],
            &square_letterbox(),
            &cfg,
        )
        .unwrap();

        assert_eq!(cfg.score_threshold, DetectorConfig::default().min_detection_confidence);
        assert_eq!(palms.len(), 1);
        assert!((palms[0].score - 0.3).abs() < 1e-4);
    }

    #[test]
    fn decode_rejects_bad_shapes() {
        let err = decode_palm_outputs(
            &[0.0; 8],
            &[8],
            &[0.0; 8],
            &[1, 8, 1],
            &square_letterbox(),
            &default_cfg(),
        );
        assert!(err.is_err());

        let err = decode_palm_outputs(
            &[0.0; 4 * FEATURES],
            &[1, 4, FEATURES],
            &[0.0; 3],
            &[1, 3, 1],
            &square_letterbox(),
            &default_cfg(),
        );
        assert!(err.is_err());
    }

    #[test]
    fn crop_is_centered_on_palm_keypoints() {
        let palm = PalmRegion {
            bbox: [0.0, 0.0, 100.0, 100.0],
            landmarks: vec![(40.0, 60.0), (60.0, 60.0), (50.0, 40.0)],
            score: 0.9,
        };
        let (center, side, _angle) = crop_from_palm(&palm);

        assert!((center.0 - 50.0).abs() < 1e-3);
        assert!((center.1 - 53.333).abs() < 1e-2);
        assert!((side - 100.0 * CROP_EXPANSION).abs() < 1e-3);
    }

    #[test]
    fn horizontal_palm_is_rotated_upright() {
        let palm = PalmRegion {
            bbox: [0.0, 0.0, 10.0, 10.0],
            landmarks: vec![(0.0, 5.0), (10.0, 5.0)],
            score: 1.0,
        };
        assert!((estimate_orientation(&palm) + PI * 0.5).abs() < 1e-6);
    }
}
