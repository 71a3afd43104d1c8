//! The processing stage: workers consuming fetched-message announcements
//! from the shared queue, processing each message in its own transaction
//! and publishing the outcome on the result topic.
//!
//! Announcements cut the latency; a periodic database sweep picks up what
//! they miss, e.g. rows admitted before a restart or messages admitted
//! with their content already resolved.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use sqlx::PgPool;
use tokio::sync::{Mutex, Semaphore};

use crate::error::MessageProcessingError;
use crate::mq::{result_routing_key, Exchange, WorkQueue, PENDING_MESSAGES_QUEUE};

use super::message_handler::{MessageHandler, ProcessingResult};

/// Messages a single worker processes in parallel.
const WORKER_PARALLELISM: usize = 5;

const SWEEP_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Deserialize)]
struct WorkerPayload {
    message_id: i64,
    item_hash: String,
}

pub struct MessageWorker {
    pool: PgPool,
    handler: Arc<MessageHandler>,
    processing_queue: WorkQueue,
    result_exchange: Exchange,
    worker_id: String,
    semaphore: Arc<Semaphore>,
    in_flight: Mutex<HashSet<String>>,
}

impl MessageWorker {
    pub fn new(
        pool: PgPool,
        handler: Arc<MessageHandler>,
        processing_queue: WorkQueue,
        result_exchange: Exchange,
        worker_id: String,
    ) -> Self {
        MessageWorker {
            pool,
            handler,
            processing_queue,
            result_exchange,
            worker_id,
            semaphore: Arc::new(Semaphore::new(WORKER_PARALLELISM)),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Processes one announced message: load the pending row, run the full
    /// handler chain in a transaction, and fall back to the retry policy
    /// in a fresh transaction on failure.
    async fn process_message(&self, message_id: i64) -> Option<ProcessingResult> {
        let mut txn = match self.pool.begin().await {
            Ok(txn) => txn,
            Err(err) => {
                tracing::error!(%err, "could not open transaction");
                return None;
            }
        };

        let pending = match node_sql::pending_messages::get_pending_message(&mut txn, message_id)
            .await
        {
            Ok(Some(pending)) => pending,
            Ok(None) => {
                // Already handled by another worker; nothing to do.
                tracing::warn!(message_id, "pending message not found in database");
                return None;
            }
            Err(err) => {
                tracing::error!(%err, "could not load pending message");
                return None;
            }
        };

        let result = match self.handler.process(&mut txn, &pending).await {
            Ok(result) => match txn.commit().await {
                Ok(()) => result,
                Err(err) => {
                    tracing::error!(%err, item_hash = %pending.item_hash, "commit failed");
                    return None;
                }
            },
            Err(error) => {
                if let Err(err) = txn.rollback().await {
                    tracing::error!(%err, "rollback failed");
                }
                self.apply_error_policy(&pending, error).await?
            }
        };

        Some(result)
    }

    async fn apply_error_policy(
        &self,
        pending: &node_sql::pending_messages::PendingMessageRow,
        error: MessageProcessingError,
    ) -> Option<ProcessingResult> {
        let mut txn = match self.pool.begin().await {
            Ok(txn) => txn,
            Err(err) => {
                tracing::error!(%err, "could not open error transaction");
                return None;
            }
        };
        let result = match self
            .handler
            .handle_processing_error(&mut txn, pending, error)
            .await
        {
            Ok(result) => result,
            Err(err) => {
                tracing::error!(%err, item_hash = %pending.item_hash, "error handling failed");
                return None;
            }
        };
        if let Err(err) = txn.commit().await {
            tracing::error!(%err, "error-policy commit failed");
            return None;
        }
        Some(result)
    }

    fn publish_result(&self, result: &ProcessingResult) {
        let routing_key =
            result_routing_key(result.status_key(), result.item_hash(), result.sender());
        tracing::debug!(%routing_key, "publishing result");
        self.result_exchange.publish(
            &routing_key,
            serde_json::json!({"item_hash": result.item_hash()})
                .to_string()
                .into_bytes(),
        );
    }

    /// Spawns the processing of one message, bounded by the per-worker
    /// parallelism. Messages already in flight are skipped: the sweep and
    /// the announcements may both surface the same row.
    async fn spawn_processing(self: &Arc<Self>, message_id: i64, item_hash: String) {
        if !self.in_flight.lock().await.insert(item_hash.clone()) {
            return;
        }
        let permit = match self.semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                self.in_flight.lock().await.remove(&item_hash);
                return;
            }
        };

        let worker = self.clone();
        tokio::spawn(async move {
            let _permit = permit;
            tracing::debug!(item_hash = %item_hash, "processing message");
            if let Some(result) = worker.process_message(message_id).await {
                worker.publish_result(&result);
                tracing::info!(
                    item_hash = %item_hash,
                    status = result.status_key(),
                    "message processed"
                );
            }
            worker.in_flight.lock().await.remove(&item_hash);
        });
    }

    /// Picks up fetched rows nobody announced.
    async fn sweep(self: &Arc<Self>) -> sqlx::Result<()> {
        let excluded: Vec<String> = self.in_flight.lock().await.iter().cloned().collect();
        let batch = {
            let mut conn = self.pool.acquire().await?;
            node_sql::pending_messages::get_next_pending_messages(
                &mut conn,
                chrono::Utc::now(),
                WORKER_PARALLELISM as i64,
                &excluded,
                true,
            )
            .await?
        };
        for pending in batch {
            let item_hash = pending.item_hash.clone();
            self.spawn_processing(pending.id, item_hash).await;
        }
        Ok(())
    }

    /// The worker loop: announcement-driven with a periodic sweep.
    pub async fn run(self: Arc<Self>) {
        tracing::info!(
            worker_id = %self.worker_id,
            queue = PENDING_MESSAGES_QUEUE,
            "message worker started"
        );

        loop {
            tokio::select! {
                announcement = self.processing_queue.recv() => {
                    let Some(message) = announcement else {
                        break;
                    };
                    let payload: WorkerPayload = match serde_json::from_slice(&message.body) {
                        Ok(payload) => payload,
                        Err(err) => {
                            tracing::error!(%err, "error parsing worker payload");
                            continue;
                        }
                    };
                    self.spawn_processing(payload.message_id, payload.item_hash).await;
                }
                _ = tokio::time::sleep(SWEEP_DELAY) => {
                    if let Err(err) = self.sweep().await {
                        tracing::error!(%err, "error sweeping fetched messages");
                    }
                }
            }
        }
        tracing::info!(worker_id = %self.worker_id, "message worker stopped");
    }
}
