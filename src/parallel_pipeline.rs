// THEORY:
// Runs many analysis requests at once over a fixed pool of workers. Each worker
// owns nothing but a handle to the shared `AnalysisPipeline`; every request gets
// its own scoped `RuntimeContext`, so per-request buffers never mix and the memory
// ledger of one scan says nothing about another.
//
// Tasks travel over an mpsc channel that all workers pull from, and each task
// carries a oneshot sender for its report. The pool size is the bound on in-flight
// requests. Batch results come back in submission order regardless of which
// request finished first.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{Mutex, mpsc, oneshot};

use crate::core_modules::classifier::ModelLoader;
use crate::core_modules::runtime::RuntimeContext;
use crate::pipeline::{AnalysisPipeline, AnalysisReport};
use crate::record::ScanRecord;
use crate::storage::Storage;
use crate::{log_debug, log_warn};

const ENABLE_LOGS: bool = true;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkerPoolError {
    #[error("worker pool is shut down")]
    Closed,
    #[error("worker dropped the request for scan {0}")]
    Dropped(String),
}

pub struct AnalysisTask {
    pub scan_id: String,
    pub record: ScanRecord,
    pub result_sender: oneshot::Sender<AnalysisReport>,
}

struct Queued {
    scan_id: String,
    receiver: oneshot::Receiver<AnalysisReport>,
}

impl Queued {
    async fn wait(self) -> Result<AnalysisReport, WorkerPoolError> {
        self.receiver
            .await
            .map_err(|_| WorkerPoolError::Dropped(self.scan_id))
    }
}

pub struct WorkerPool {
    task_sender: mpsc::UnboundedSender<AnalysisTask>,
    workers: Vec<tokio::task::JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `size` workers onto the current tokio runtime.
    pub fn new<L, S>(pipeline: Arc<AnalysisPipeline<L, S>>, runtime: RuntimeContext, size: usize) -> Self
    where
        L: ModelLoader + 'static,
        L::Model: 'static,
        S: Storage + 'static,
    {
        let (task_sender, task_receiver) = mpsc::unbounded_channel::<AnalysisTask>();
        let task_receiver = Arc::new(Mutex::new(task_receiver));

        let workers = (0..size.max(1))
            .map(|worker_id| {
                let pipeline = Arc::clone(&pipeline);
                let receiver = Arc::clone(&task_receiver);
                let runtime = runtime.scoped(format!("worker-{worker_id}"));

                tokio::spawn(async move {
                    loop {
                        // Hold the lock only while waiting for the next task.
                        let task = receiver.lock().await.recv().await;
                        let Some(task) = task else { break };

                        let scoped = runtime.scoped(task.scan_id.clone());
                        let report = pipeline.analyze(&scoped, &task.scan_id, &task.record).await;
                        if task.result_sender.send(report).is_err() {
                            log_debug!("worker-{worker_id}: submitter for {} went away", task.scan_id);
                        }
                    }
                    log_debug!("worker-{worker_id}: channel closed, exiting");
                })
            })
            .collect();

        Self { task_sender, workers }
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Queues one request and waits for its report.
    pub async fn submit(&self, scan_id: impl Into<String>, record: ScanRecord) -> Result<AnalysisReport, WorkerPoolError> {
        self.enqueue(scan_id.into(), record)?.wait().await
    }

    fn enqueue(&self, scan_id: String, record: ScanRecord) -> Result<Queued, WorkerPoolError> {
        let (result_sender, receiver) = oneshot::channel();
        self.task_sender
            .send(AnalysisTask {
                scan_id: scan_id.clone(),
                record,
                result_sender,
            })
            .map_err(|_| WorkerPoolError::Closed)?;
        Ok(Queued { scan_id, receiver })
    }

    /// Stops accepting work and waits for queued requests to drain.
    pub async fn shutdown(self) {
        drop(self.task_sender);
        for worker in self.workers {
            if let Err(err) = worker.await {
                log_warn!("analysis worker panicked: {err}");
            }
        }
    }
}

/// Batch front end over a `WorkerPool`.
pub struct ParallelAnalyzer {
    worker_pool: WorkerPool,
}

impl ParallelAnalyzer {
    pub fn new<L, S>(pipeline: Arc<AnalysisPipeline<L, S>>, runtime: RuntimeContext) -> Self
    where
        L: ModelLoader + 'static,
        L::Model: 'static,
        S: Storage + 'static,
    {
        let size = pipeline.config().max_concurrent_requests;
        Self {
            worker_pool: WorkerPool::new(pipeline, runtime, size),
        }
    }

    pub fn worker_pool(&self) -> &WorkerPool {
        &self.worker_pool
    }

    pub async fn analyze(&self, scan_id: impl Into<String>, record: ScanRecord) -> Result<AnalysisReport, WorkerPoolError> {
        self.worker_pool.submit(scan_id, record).await
    }

    /// Analyses every request and returns the reports in input order. A request
    /// the pool could not run is reported as an `Err` in its slot.
    pub async fn analyze_batch(
        &self,
        requests: Vec<(String, ScanRecord)>,
    ) -> Vec<Result<AnalysisReport, WorkerPoolError>> {
        let pending: Vec<_> = requests
            .into_iter()
            .map(|(scan_id, record)| self.worker_pool.enqueue(scan_id, record))
            .collect();

        futures::future::join_all(pending.into_iter().map(|queued| async move {
            match queued {
                Ok(queued) => queued.wait().await,
                Err(err) => Err(err),
            }
        }))
        .await
    }

    pub async fn shutdown(self) {
        self.worker_pool.shutdown().await;
    }
}
