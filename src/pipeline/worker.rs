use std::{
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use anyhow::{Context, Result, anyhow};
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use tokio::sync::oneshot;
use uuid::Uuid;

use super::{PredictError, detector::HandDetector, run_pipeline};
use crate::{classifier::LetterClassifier, types::PredictionLabel};

#[derive(Clone, Debug)]
pub struct WorkerPoolConfig {
    pub workers: usize,
    pub queue_depth: usize,
    pub request_timeout: Duration,
}

struct Job {
    id: Uuid,
    bytes: Vec<u8>,
    queued_at: Instant,
    reply: oneshot::Sender<Result<PredictionLabel, PredictError>>,
}

/// Fixed set of threads, each owning its own detector and classifier.
///
/// Inference is blocking and CPU bound, so it never runs on the async
/// runtime; handlers hand jobs over through a bounded queue.
#[derive(Clone)]
pub struct WorkerPool {
    job_tx: Sender<Job>,
    request_timeout: Duration,
    _threads: Arc<Vec<thread::JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawns `cfg.workers` threads and waits until each has built its
    /// engines with `make_engines`. The first construction error is returned.
    pub fn start<D, C, F>(cfg: &WorkerPoolConfig, make_engines: F) -> Result<Self>
    where
        D: HandDetector,
        C: LetterClassifier,
        F: Fn(usize) -> Result<(D, C)> + Send + Sync + 'static,
    {
        let (job_tx, job_rx) = bounded::<Job>(cfg.queue_depth.max(1));
        let (ready_tx, ready_rx) = bounded::<Result<usize>>(cfg.workers);
        let make_engines = Arc::new(make_engines);

        let mut threads = Vec::with_capacity(cfg.workers);
        for worker_idx in 0..cfg.workers {
            let job_rx = job_rx.clone();
            let ready_tx = ready_tx.clone();
            let make_engines = Arc::clone(&make_engines);

            let handle = thread::Builder::new()
                .name(format!("predict-worker-{worker_idx}"))
                .spawn(move || match make_engines(worker_idx) {
                    Ok((detector, classifier)) => {
                        let _ = ready_tx.send(Ok(worker_idx));
                        drop(ready_tx);
                        run_worker_loop(worker_idx, detector, classifier, job_rx);
                    }
                    Err(err) => {
                        let _ = ready_tx.send(Err(
                            err.context(format!("worker {worker_idx} failed to load models"))
                        ));
                    }
                })
                .context("failed to spawn prediction worker")?;
            threads.push(handle);
        }
        drop(ready_tx);

        for _ in 0..cfg.workers {
            let worker_idx = ready_rx
                .recv()
                .map_err(|_| anyhow!("prediction worker exited during startup"))??;
            log::info!("prediction worker {worker_idx} ready");
        }

        Ok(Self {
            job_tx,
            request_timeout: cfg.request_timeout,
            _threads: Arc::new(threads),
        })
    }

    /// Queues an upload and waits for its label, bounded by the request
    /// timeout. A job that times out keeps running to completion on its
    /// worker; only the answer is discarded.
    pub async fn predict(&self, bytes: Vec<u8>) -> Result<PredictionLabel, PredictError> {
        let id = Uuid::new_v4();
        let (reply_tx, reply_rx) = oneshot::channel();
        let job = Job {
            id,
            bytes,
            queued_at: Instant::now(),
            reply: reply_tx,
        };

        match self.job_tx.try_send(job) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                log::warn!("[{id}] rejected: prediction queue full");
                return Err(PredictError::Overloaded);
            }
            Err(TrySendError::Disconnected(_)) => return Err(PredictError::WorkerUnavailable),
        }

        match tokio::time::timeout(self.request_timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(PredictError::WorkerUnavailable),
            Err(_) => {
                log::warn!(
                    "[{id}] timed out after {} ms",
                    self.request_timeout.as_millis()
                );
                Err(PredictError::Timeout)
            }
        }
    }
}

fn run_worker_loop<D, C>(
    worker_idx: usize,
    mut detector: D,
    mut classifier: C,
    job_rx: Receiver<Job>,
) where
    D: HandDetector,
    C: LetterClassifier,
{
    while let Ok(job) = job_rx.recv() {
        if job.reply.is_closed() {
            log::debug!("[{}] requester gone, skipping", job.id);
            continue;
        }

        let waited = job.queued_at.elapsed();
        let started = Instant::now();
        let result = run_pipeline(job.id, &job.bytes, &mut detector, &mut classifier);
        log::debug!(
            "[{}] worker {worker_idx} finished in {} ms (queued {} ms)",
            job.id,
            started.elapsed().as_millis(),
            waited.as_millis()
        );

        let _ = job.reply.send(result);
    }
    log::debug!("prediction worker {worker_idx} shutting down");
}
