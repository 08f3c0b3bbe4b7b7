mod classifier;
mod config;
mod features;
mod model_download;
mod pipeline;
mod server;
mod types;

use anyhow::{Context, Result};
use env_logger::Env;

use classifier::OrtLetterClassifier;
use config::Config;
use model_download::{ModelDownloadEvent, ModelKind, ensure_model_ready};
use pipeline::{WorkerPool, WorkerPoolConfig, detector::OrtHandDetector};

fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let cfg = Config::from_env()?;
    log::info!("starting asl-predict with {} worker(s)", cfg.workers);

    // Model downloads use a blocking client, so they happen before the
    // async runtime exists.
    prepare_models(&cfg)?;
    let pool = start_workers(&cfg)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build async runtime")?;
    runtime.block_on(server::serve(&cfg, pool))
}

fn prepare_models(cfg: &Config) -> Result<()> {
    let models = [
        (ModelKind::PalmDetector, cfg.palm_detector_model()),
        (ModelKind::HandposeEstimator, cfg.handpose_estimator_model()),
        (ModelKind::AslClassifier, cfg.classifier_model.clone()),
    ];
    for (kind, path) in models {
        ensure_model_ready(kind, &path, cfg.auto_download, log_download_event)?;
        log::info!("{} model: {}", kind.label(), path.display());
    }
    Ok(())
}

fn log_download_event(evt: ModelDownloadEvent) {
    match evt {
        ModelDownloadEvent::Progress { .. } => log::trace!("{evt}"),
        ModelDownloadEvent::AlreadyPresent { .. } => log::debug!("{evt}"),
        ModelDownloadEvent::Started { .. } | ModelDownloadEvent::Finished { .. } => {
            log::info!("{evt}")
        }
    }
}

fn start_workers(cfg: &Config) -> Result<WorkerPool> {
    let palm_path = cfg.palm_detector_model();
    let handpose_path = cfg.handpose_estimator_model();
    let classifier_path = cfg.classifier_model.clone();
    let labels_path = cfg.classifier_labels.clone();
    let detector_cfg = cfg.detector.clone();

    WorkerPool::start(
        &WorkerPoolConfig {
            workers: cfg.workers,
            queue_depth: cfg.queue_depth,
            request_timeout: cfg.request_timeout,
        },
        move |_worker_idx| {
            let detector = OrtHandDetector::new(&handpose_path, &palm_path, &detector_cfg)?;
            let classifier = OrtLetterClassifier::new(&classifier_path, &labels_path)?;
            Ok((detector, classifier))
        },
    )
}
