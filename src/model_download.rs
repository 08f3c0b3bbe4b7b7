use std::{
    fmt, fs,
    io::{Read, Write},
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, anyhow};
use indicatif::{ProgressBar, ProgressStyle};
use reqwest::blocking::Client;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModelKind {
    PalmDetector,
    HandposeEstimator,
    AslClassifier,
}

const PALM_DETECTOR_MODEL_URL: &str = "https://raw.githubusercontent.com/214zzl995/gesture-universe/refs/heads/main/models/palm_detection_mediapipe_2023feb.onnx";
const HANDPOSE_ESTIMATOR_MODEL_URL: &str = "https://raw.githubusercontent.com/214zzl995/gesture-universe/refs/heads/main/models/handpose_estimation_mediapipe_2023feb.onnx";

impl ModelKind {
    pub fn filename(self) -> &'static str {
        match self {
            ModelKind::PalmDetector => "palm_detection_mediapipe_2023feb.onnx",
            ModelKind::HandposeEstimator => "handpose_estimation_mediapipe_2023feb.onnx",
            ModelKind::AslClassifier => "asl_classifier.onnx",
        }
    }

    /// Public source of the artifact. The classifier is trained in-house and
    /// has to be provisioned by hand.
    pub fn url(self) -> Option<&'static str> {
        match self {
            ModelKind::PalmDetector => Some(PALM_DETECTOR_MODEL_URL),
            ModelKind::HandposeEstimator => Some(HANDPOSE_ESTIMATOR_MODEL_URL),
            ModelKind::AslClassifier => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ModelKind::PalmDetector => "palm detector",
            ModelKind::HandposeEstimator => "handpose estimator",
            ModelKind::AslClassifier => "ASL classifier",
        }
    }
}

pub fn model_path_in(dir: &Path, kind: ModelKind) -> PathBuf {
    dir.join(kind.filename())
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ModelDownloadEvent {
    AlreadyPresent {
        model: ModelKind,
    },
    Started {
        model: ModelKind,
        total: Option<u64>,
    },
    Progress {
        model: ModelKind,
        downloaded: u64,
        total: Option<u64>,
    },
    Finished {
        model: ModelKind,
    },
}

impl fmt::Display for ModelDownloadEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelDownloadEvent::AlreadyPresent { model } => {
                write!(f, "{} model already present", model.label())
            }
            ModelDownloadEvent::Started { model, total } => match total {
                Some(total) => write!(f, "{} model download started ({total} bytes)", model.label()),
                None => write!(f, "{} model download started (size unknown)", model.label()),
            },
            ModelDownloadEvent::Progress {
                model,
                downloaded,
                total,
            } => match total {
                Some(total) => write!(f, "{} model: {downloaded}/{total} bytes", model.label()),
                None => write!(f, "{} model: {downloaded} bytes", model.label()),
            },
            ModelDownloadEvent::Finished { model } => write!(f, "{} model ready", model.label()),
        }
    }
}

/// Makes sure `model_path` exists, fetching it when allowed and possible.
pub fn ensure_model_ready<F>(
    model: ModelKind,
    model_path: &Path,
    allow_download: bool,
    mut on_event: F,
) -> anyhow::Result<()>
where
    F: FnMut(ModelDownloadEvent),
{
    if model_path.exists() {
        on_event(ModelDownloadEvent::AlreadyPresent { model });
        on_event(ModelDownloadEvent::Finished { model });
        return Ok(());
    }

    let Some(url) = model.url() else {
        return Err(anyhow!(
            "{} model not found at {} and cannot be downloaded",
            model.label(),
            model_path.display()
        ));
    };
    if !allow_download {
        return Err(anyhow!(
            "{} model not found at {} and downloads are disabled",
            model.label(),
            model_path.display()
        ));
    }

    if let Some(parent) = model_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create model directory {}", parent.display()))?;
    }

    let mut progress: Option<ProgressBar> = None;
    download_to_path(model, url, model_path, &mut |event| {
        match &event {
            ModelDownloadEvent::Started { total, .. } => {
                progress = Some(create_progress_bar(*total));
            }
            ModelDownloadEvent::Progress { downloaded, .. } => {
                if let Some(pb) = progress.as_ref() {
                    pb.set_position(*downloaded);
                }
            }
            ModelDownloadEvent::Finished { model } => {
                if let Some(pb) = progress.take() {
                    pb.finish_with_message(format!("{} model ready", model.label()));
                }
            }
            ModelDownloadEvent::AlreadyPresent { .. } => {}
        }
        on_event(event);
    })
    .with_context(|| {
        format!(
            "failed to download {} model to {}",
            model.label(),
            model_path.display()
        )
    })
}

fn download_to_path<F>(
    model: ModelKind,
    url: &str,
    dest: &Path,
    on_event: &mut F,
) -> anyhow::Result<()>
where
    F: FnMut(ModelDownloadEvent),
{
    log::info!(
        "downloading {} model from {url} to {}",
        model.label(),
        dest.display()
    );

    let client = Client::new();
    let response = client
        .get(url)
        .send()
        .context("failed to start model download")?
        .error_for_status()
        .context("model download returned error status")?;

    let total_size = response.content_length();
    write_model(model, response, total_size, dest, on_event)
}

/// Streams `source` into `dest` through a sibling `.download` file that is
/// removed again if anything fails.
fn write_model<R, F>(
    model: ModelKind,
    mut source: R,
    total_size: Option<u64>,
    dest: &Path,
    on_event: &mut F,
) -> anyhow::Result<()>
where
    R: Read,
    F: FnMut(ModelDownloadEvent),
{
    on_event(ModelDownloadEvent::Started {
        model,
        total: total_size,
    });

    let tmp_path = dest.with_extension("download");
    let result = stream_to_file(model, &mut source, total_size, &tmp_path, on_event).and_then(
        |()| {
            fs::rename(&tmp_path, dest).with_context(|| {
                format!(
                    "failed to move temp model {} into place at {}",
                    tmp_path.display(),
                    dest.display()
                )
            })
        },
    );
    if result.is_err() && tmp_path.exists() {
        if let Err(err) = fs::remove_file(&tmp_path) {
            log::warn!("failed to remove {}: {err}", tmp_path.display());
        }
    }
    result?;

    on_event(ModelDownloadEvent::Finished { model });
    Ok(())
}

fn stream_to_file<R, F>(
    model: ModelKind,
    source: &mut R,
    total_size: Option<u64>,
    tmp_path: &Path,
    on_event: &mut F,
) -> anyhow::Result<()>
where
    R: Read,
    F: FnMut(ModelDownloadEvent),
{
    let mut file = fs::File::create(tmp_path)
        .with_context(|| format!("failed to create {}", tmp_path.display()))?;

    let mut downloaded: u64 = 0;
    let mut buffer = [0u8; 16 * 1024];
    loop {
        let bytes_read = source
            .read(&mut buffer)
            .context("failed while reading model bytes")?;
        if bytes_read == 0 {
            break;
        }

        file.write_all(&buffer[..bytes_read])
            .context("failed while writing model to disk")?;
        downloaded += bytes_read as u64;
        on_event(ModelDownloadEvent::Progress {
            model,
            downloaded,
            total: total_size,
        });
    }

    file.sync_all()
        .context("failed to flush downloaded model to disk")
}

fn create_progress_bar(total_size: Option<u64>) -> ProgressBar {
    match total_size {
        Some(total) if total > 0 => {
            let pb = ProgressBar::new(total);
            let style = ProgressStyle::with_template(
                "{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({eta})",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=>-");
            pb.set_style(style);
            pb
        }
        _ => {
            let pb = ProgressBar::new_spinner();
            let style = ProgressStyle::with_template("{spinner:.green} downloading model")
                .unwrap_or_else(|_| ProgressStyle::default_spinner());
            pb.set_style(style);
            pb.enable_steady_tick(Duration::from_millis(100));
            pb
        }
    }
}
