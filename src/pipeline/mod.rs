pub mod decode;
pub mod detector;
pub mod worker;

use std::fmt;

use thiserror::Error;
use uuid::Uuid;

use crate::{
    classifier::LetterClassifier,
    features::{self, NormalizeError},
    types::PredictionLabel,
};

use self::detector::HandDetector;

pub use worker::{WorkerPool, WorkerPoolConfig};

/// Everything that can end a prediction request early.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum PredictError {
    #[error("no image file in upload")]
    MissingFile,
    #[error("could not decode image: {0}")]
    Decode(String),
    #[error("no hand detected in image")]
    NoHandDetected,
    #[error("unusable landmark count: got {len} values, expected 42 or 84")]
    UnusableLandmarkCount { len: usize },
    #[error("hand detection failed: {0}")]
    Detection(String),
    #[error("classification failed: {0}")]
    Classification(String),
    #[error("server is busy, try again later")]
    Overloaded,
    #[error("prediction workers are unavailable")]
    WorkerUnavailable,
    #[error("prediction timed out")]
    Timeout,
}

impl From<NormalizeError> for PredictError {
    fn from(err: NormalizeError) -> Self {
        match err {
            NormalizeError::NoHandDetected => PredictError::NoHandDetected,
            NormalizeError::UnusableLandmarkCount { len } => {
                PredictError::UnusableLandmarkCount { len }
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Received,
    Decoded,
    LandmarksExtracted,
    Normalized,
    Classified,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Received => "received",
            Stage::Decoded => "decoded",
            Stage::LandmarksExtracted => "landmarks-extracted",
            Stage::Normalized => "normalized",
            Stage::Classified => "classified",
        };
        f.write_str(name)
    }
}

/// Runs one upload through decode → detect → normalize → classify.
pub fn run_pipeline<D, C>(
    id: Uuid,
    bytes: &[u8],
    detector: &mut D,
    classifier: &mut C,
) -> Result<PredictionLabel, PredictError>
where
    D: HandDetector,
    C: LetterClassifier,
{
    let mut stage = Stage::Received;
    log::debug!("[{id}] {stage}: {} bytes", bytes.len());

    let frame = decode::decode_image(bytes)
        .map_err(|err| fail(id, stage, err, PredictError::Decode))?;
    stage = Stage::Decoded;
    log::debug!("[{id}] {stage}: {}x{}", frame.width, frame.height);

    let hands = detector
        .detect(&frame)
        .map_err(|err| fail(id, stage, err, PredictError::Detection))?;
    stage = Stage::LandmarksExtracted;
    for (idx, hand) in hands.iter().enumerate() {
        log::debug!(
            "[{id}] {stage}: hand {idx} confidence {:.3} handedness {:.2}",
            hand.confidence,
            hand.handedness
        );
    }

    let raw = features::flatten_hands(&hands);
    let features = features::normalize(&raw).map_err(|err| {
        log::debug!("[{id}] failed after {stage}: {err}");
        PredictError::from(err)
    })?;
    stage = Stage::Normalized;
    log::debug!("[{id}] {stage}");

    let label = classifier
        .classify(&features)
        .map_err(|err| fail(id, stage, err, PredictError::Classification))?;
    stage = Stage::Classified;
    log::debug!("[{id}] {stage}: {label}");

    Ok(label)
}

fn fail(
    id: Uuid,
    stage: Stage,
    err: anyhow::Error,
    wrap: fn(String) -> PredictError,
) -> PredictError {
    log::warn!("[{id}] failed after {stage}: {err:#}");
    wrap(format!("{err:#}"))
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::features::FEATURE_LEN;

    fn run(
        bytes: &[u8],
        detector: &mut FakeDetector,
        classifier: &mut RecordingClassifier,
    ) -> Result<PredictionLabel, PredictError> {
        run_pipeline(Uuid::new_v4(), bytes, detector, classifier)
    }

    #[test]
    fn one_hand_is_padded_before_classification() {
        let mut detector = FakeDetector {
            hands: vec![hand(0.25)],
            fail: false,
        };
        let mut classifier = RecordingClassifier::new("A");

        let label = run(&png_bytes(), &mut detector, &mut classifier).unwrap();

        assert_eq!(label, PredictionLabel("A".into()));
        let seen = classifier.seen.lock().unwrap();
        assert_eq!(seen[0].len(), FEATURE_LEN);
        assert!(seen[0][..42].iter().all(|v| *v == 0.25));
        assert!(seen[0][42..].iter().all(|v| *v == 0.0));
    }

    #[test]
    fn two_hands_reach_classifier_unchanged() {
        let mut detector = FakeDetector {
            hands: vec![hand(0.25), hand(0.75)],
            fail: false,
        };
        let mut classifier = RecordingClassifier::new("K");

        run(&png_bytes(), &mut detector, &mut classifier).unwrap();

        let seen = classifier.seen.lock().unwrap();
        let expected = features::flatten_hands(&detector.hands);
        assert_eq!(seen[0], expected);
    }

    #[test]
    fn no_hand_is_a_distinct_failure() {
        let mut detector = FakeDetector {
            hands: Vec::new(),
            fail: false,
        };
        let mut classifier = RecordingClassifier::new("A");

        let err = run(&png_bytes(), &mut detector, &mut classifier).unwrap_err();

        assert_eq!(err, PredictError::NoHandDetected);
        assert_eq!(classifier.calls(), 0);
    }

    #[test]
    fn three_hands_are_unusable() {
        let mut detector = FakeDetector {
            hands: vec![hand(0.1), hand(0.2), hand(0.3)],
            fail: false,
        };
        let mut classifier = RecordingClassifier::new("A");

        let err = run(&png_bytes(), &mut detector, &mut classifier).unwrap_err();

        assert_eq!(err, PredictError::UnusableLandmarkCount { len: 126 });
    }

    #[test]
    fn non_image_never_reaches_classifier() {
        let mut detector = FakeDetector {
            hands: vec![hand(0.5)],
            fail: false,
        };
        let mut classifier = RecordingClassifier::new("A");

        let err = run(b"hello", &mut detector, &mut classifier).unwrap_err();

        assert!(matches!(err, PredictError::Decode(_)));
        assert_eq!(classifier.calls(), 0);
    }

    #[test]
    fn detector_failure_is_reported() {
        let mut detector = FakeDetector {
            hands: Vec::new(),
            fail: true,
        };
        let mut classifier = RecordingClassifier::new("A");

        let err = run(&png_bytes(), &mut detector, &mut classifier).unwrap_err();

        assert!(matches!(err, PredictError::Detection(msg) if msg.contains("exploded")));
    }
}
