use std::{env, net::SocketAddr, path::PathBuf, str::FromStr, thread, time::Duration};

use anyhow::{Context, Result, anyhow};

use crate::model_download::{ModelKind, model_path_in};

const MAX_DEFAULT_WORKERS: usize = 4;

#[derive(Clone, Debug)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub allowed_origin: String,
    pub model_dir: PathBuf,
    pub classifier_model: PathBuf,
    pub classifier_labels: PathBuf,
    pub workers: usize,
    pub queue_depth: usize,
    pub request_timeout: Duration,
    pub max_upload_bytes: usize,
    pub detector: DetectorConfig,
    pub auto_download: bool,
}

/// Hand detection settings.
///
/// `min_detection_confidence` gates palm detection, and by default the palm
/// score threshold follows it. Hand-pose confidence is filtered with the same
/// value.
#[derive(Clone, Debug)]
pub struct DetectorConfig {
    pub max_hands: usize,
    pub min_detection_confidence: f32,
    pub palm_score_threshold: f32,
    pub palm_nms_threshold: f32,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            max_hands: 2,
            min_detection_confidence: 0.1,
            palm_score_threshold: 0.1,
            palm_nms_threshold: 0.3,
        }
    }
}

impl Config {
    /// Reads `.env` (if any) and then the process environment.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let model_dir = lookup("ASL_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("models"));
        let classifier_model = lookup("ASL_CLASSIFIER_MODEL")
            .map(PathBuf::from)
            .unwrap_or_else(|| model_path_in(&model_dir, ModelKind::AslClassifier));
        let classifier_labels = lookup("ASL_CLASSIFIER_LABELS")
            .map(PathBuf::from)
            .unwrap_or_else(|| model_dir.join("asl_labels.txt"));

        let defaults = DetectorConfig::default();
        let min_detection_confidence = parse_or(
            &lookup,
            "ASL_MIN_DETECTION_CONFIDENCE",
            defaults.min_detection_confidence,
        )?;
        let detector = DetectorConfig {
            max_hands: parse_or(&lookup, "ASL_MAX_HANDS", defaults.max_hands)?,
            min_detection_confidence,
            palm_score_threshold: parse_or(
                &lookup,
                "ASL_PALM_SCORE_THRESHOLD",
                min_detection_confidence,
            )?,
            palm_nms_threshold: defaults.palm_nms_threshold,
        };
        if detector.max_hands == 0 {
            return Err(anyhow!("ASL_MAX_HANDS must be at least 1"));
        }

        let workers = parse_or(&lookup, "ASL_WORKERS", default_workers())?;
        if workers == 0 {
            return Err(anyhow!("ASL_WORKERS must be at least 1"));
        }
        let queue_depth = parse_or(&lookup, "ASL_QUEUE_DEPTH", 16usize)?.max(1);

        Ok(Self {
            bind_addr: parse_or(
                &lookup,
                "ASL_BIND_ADDR",
                SocketAddr::from(([0, 0, 0, 0], 8000)),
            )?,
            allowed_origin: lookup("ASL_ALLOWED_ORIGIN")
                .unwrap_or_else(|| "http://localhost:3000".to_string()),
            model_dir,
            classifier_model,
            classifier_labels,
            workers,
            queue_depth,
            request_timeout: Duration::from_millis(parse_or(
                &lookup,
                "ASL_REQUEST_TIMEOUT_MS",
                10_000u64,
            )?),
            max_upload_bytes: parse_or(&lookup, "ASL_MAX_UPLOAD_BYTES", 10 * 1024 * 1024usize)?,
            detector,
            auto_download: parse_or(&lookup, "ASL_AUTO_DOWNLOAD", true)?,
        })
    }

    pub fn palm_detector_model(&self) -> PathBuf {
        model_path_in(&self.model_dir, ModelKind::PalmDetector)
    }

    pub fn handpose_estimator_model(&self) -> PathBuf {
        model_path_in(&self.model_dir, ModelKind::HandposeEstimator)
    }
}

fn default_workers() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(MAX_DEFAULT_WORKERS)
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {key}: {raw:?}")),
        None => Ok(default),
    }
}
