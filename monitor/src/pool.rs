use crate::config::{Backpressure, PoolConfig, ProcessingConfig};
use crate::errors::{Error, Result};
use crate::ingest::handle_telemetry;
use crate::metrics::{QUEUE_DEPTH, QUEUE_FULL_TOTAL, SHED_MESSAGES_TOTAL};
use crate::store::DeviceStore;
use prometheus::Gauge;
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// One telemetry publish waiting for a worker.
#[derive(Debug, Clone)]
pub struct Job {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl Job {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submitted {
    Queued,
    Shed,
}

/// Fixed set of workers draining a bounded telemetry queue.
pub struct WorkerPool {
    tx: mpsc::Sender<Job>,
    backpressure: Backpressure,
    depth: Gauge,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn start(
        store: Arc<dyn DeviceStore>,
        processing: ProcessingConfig,
        config: PoolConfig,
    ) -> Self {
        Self::start_with_depth(store, processing, config, QUEUE_DEPTH.clone())
    }

    fn start_with_depth(
        store: Arc<dyn DeviceStore>,
        processing: ProcessingConfig,
        config: PoolConfig,
        depth: Gauge,
    ) -> Self {
        info!(
            "Starting worker pool with workers={}, queue_capacity={}, backpressure={:?}",
            config.workers, config.queue_capacity, config.backpressure
        );

        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let processing = Arc::new(processing);

        let workers = (0..config.workers.max(1))
            .map(|id| {
                tokio::spawn(run_worker(
                    id,
                    Arc::clone(&rx),
                    Arc::clone(&store),
                    Arc::clone(&processing),
                    depth.clone(),
                ))
            })
            .collect();

        Self {
            tx,
            backpressure: config.backpressure,
            depth,
            workers,
        }
    }

    /// Hands a job to the pool. Never performs store I/O; with
    /// [`Backpressure::Block`] it waits for queue space.
    pub async fn submit(&self, job: Job) -> Result<Submitted> {
        // Counted before the send so a worker's decrement never runs first.
        self.depth.inc();
        match self.tx.try_send(job) {
            Ok(()) => Ok(Submitted::Queued),
            Err(TrySendError::Full(job)) => {
                QUEUE_FULL_TOTAL.inc();
                match self.backpressure {
                    Backpressure::Block => {
                        debug!("Work queue full, waiting for a free worker");
                        if self.tx.send(job).await.is_err() {
                            self.depth.dec();
                            return Err(Error::QueueClosed);
                        }
                        Ok(Submitted::Queued)
                    }
                    Backpressure::Shed => {
                        self.depth.dec();
                        SHED_MESSAGES_TOTAL.inc();
                        warn!("Work queue full, shedding telemetry from {}", job.topic);
                        Ok(Submitted::Shed)
                    }
                }
            }
            Err(TrySendError::Closed(_)) => {
                self.depth.dec();
                error!("Work queue closed, cannot submit telemetry");
                Err(Error::QueueClosed)
            }
        }
    }

    /// Closes the queue and waits for workers to finish everything already
    /// queued.
    pub async fn shutdown(self) {
        info!("Draining worker pool");
        drop(self.tx);
        for handle in self.workers {
            if let Err(e) = handle.await {
                error!("Worker task failed: {}", e);
            }
        }
        info!("Worker pool stopped");
    }
}

async fn run_worker(
    id: usize,
    rx: Arc<Mutex<mpsc::Receiver<Job>>>,
    store: Arc<dyn DeviceStore>,
    processing: Arc<ProcessingConfig>,
    depth: Gauge,
) {
    debug!("Worker {} started", id);
    loop {
        let job = {
            let mut rx = rx.lock().await;
            rx.recv().await
        };
        let Some(job) = job else {
            break;
        };
        depth.dec();

        // Outcome is logged inside; nothing else to do with it here.
        let _ = handle_telemetry(store.as_ref(), &processing, &job.topic, &job.payload).await;
    }
    debug!("Worker {} stopped", id);
}
