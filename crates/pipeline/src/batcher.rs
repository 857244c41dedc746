//! Vector write batching. Embeddings accumulate until `vector_batch_size`
//! or `vector_batch_timeout_ms`, whichever comes first; shutdown flushes
//! the final partial batch. The relational store is the authority, so a
//! batch that still fails after the client's failover retries is logged and
//! dropped rather than blocking the pipeline.

use sentinel_core::metrics::PipelineMetrics;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::vector::{VectorPoint, VectorStoreClient};

#[derive(Clone)]
pub struct VectorBatcher {
    tx: mpsc::Sender<VectorPoint>,
}

impl VectorBatcher {
    /// Spawn the batching task. The queue bound keeps producers from
    /// racing far ahead of a slow vector store.
    pub fn spawn(
        vector: Arc<VectorStoreClient>,
        batch_size: usize,
        batch_timeout: Duration,
        metrics: PipelineMetrics,
        cancel: CancellationToken,
    ) -> (Self, tokio::task::JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(batch_size.max(1) * 4);
        let handle = tokio::spawn(batch_loop(
            vector,
            rx,
            batch_size.max(1),
            batch_timeout,
            metrics,
            cancel,
        ));
        (Self { tx }, handle)
    }

    /// Enqueue a point; applies backpressure when the batcher is behind.
    pub async fn enqueue(&self, point: VectorPoint) {
        if self.tx.send(point).await.is_err() {
            warn!("vector batcher stopped; point discarded");
        }
    }
}

async fn batch_loop(
    vector: Arc<VectorStoreClient>,
    mut rx: mpsc::Receiver<VectorPoint>,
    batch_size: usize,
    batch_timeout: Duration,
    metrics: PipelineMetrics,
    cancel: CancellationToken,
) {
    let mut pending: Vec<VectorPoint> = Vec::with_capacity(batch_size);
    let mut flush_tick = tokio::time::interval(batch_timeout);
    flush_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = flush_tick.tick() => {
                flush(&vector, &mut pending, &metrics).await;
            }
            point = rx.recv() => {
                match point {
                    Some(point) => {
                        pending.push(point);
                        if pending.len() >= batch_size {
                            flush(&vector, &mut pending, &metrics).await;
                            flush_tick.reset();
                        }
                    }
                    None => break,
                }
            }
        }
    }

    // Final drain: whatever producers managed to enqueue, then the partial
    // batch.
    while let Ok(point) = rx.try_recv() {
        pending.push(point);
        if pending.len() >= batch_size {
            flush(&vector, &mut pending, &metrics).await;
        }
    }
    flush(&vector, &mut pending, &metrics).await;
    debug!("vector batcher stopped");
}

async fn flush(
    vector: &Arc<VectorStoreClient>,
    pending: &mut Vec<VectorPoint>,
    metrics: &PipelineMetrics,
) {
    if pending.is_empty() {
        return;
    }
    let batch: Vec<VectorPoint> = pending.drain(..).collect();
    let size = batch.len();

    match vector.upsert_batch(&batch).await {
        Ok(()) => debug!(size, "vector batch committed"),
        Err(e) => {
            warn!(size, error = %e, "vector batch failed after failover retries");
            metrics
                .stage_failures
                .with_label_values(&["vector_upsert", "dropped"])
                .inc_by(size as u64);
        }
    }
}
