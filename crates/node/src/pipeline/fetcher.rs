//! The fetch stage: a bounded pool of workers hydrating pending messages.
//!
//! Each worker verifies the signature, resolves the message content
//! through the content store, and marks the row fetched. Failures go
//! through the shared retry policy.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use sqlx::PgPool;

use node_sql::pending_messages::PendingMessageRow;

use crate::error::MessageProcessingError;
use crate::mq::WorkQueue;

use super::message_handler::MessageHandler;

const IDLE_DELAY: Duration = Duration::from_secs(1);

struct FetchOutcome {
    item_hash: String,
    /// Set when the message is ready for the processing stage.
    announce: Option<(i64, String)>,
}

pub struct PendingMessageFetcher {
    pool: PgPool,
    handler: Arc<MessageHandler>,
    processing_queue: WorkQueue,
    max_concurrency: usize,
}

impl PendingMessageFetcher {
    pub fn new(
        pool: PgPool,
        handler: Arc<MessageHandler>,
        processing_queue: WorkQueue,
        max_concurrency: usize,
    ) -> Self {
        PendingMessageFetcher {
            pool,
            handler,
            processing_queue,
            max_concurrency,
        }
    }

    /// Fetches one pending message and marks it ready for processing.
    async fn fetch_one(&self, pending: PendingMessageRow) -> FetchOutcome {
        let item_hash = pending.item_hash.clone();
        let result: Result<(), MessageProcessingError> = async {
            self.handler.verify_signature(&pending).await?;
            let validated = self.handler.fetch_pending_message(&pending).await?;

            let mut conn = self.pool.acquire().await?;
            node_sql::pending_messages::mark_pending_message_fetched(
                &mut conn,
                pending.id,
                &validated.row.content.0,
            )
            .await?;
            Ok(())
        }
        .await;

        match result {
            Ok(()) => FetchOutcome {
                item_hash,
                announce: Some((pending.id, pending.sender.clone())),
            },
            Err(error) => {
                match self.pool.acquire().await {
                    Ok(mut conn) => {
                        if let Err(err) = self
                            .handler
                            .handle_processing_error(&mut conn, &pending, error)
                            .await
                        {
                            tracing::error!(%err, %item_hash, "fetch error handling failed");
                        }
                    }
                    Err(err) => tracing::error!(%err, "could not record fetch error"),
                }
                FetchOutcome {
                    item_hash,
                    announce: None,
                }
            }
        }
    }

    /// The fetch loop: keep up to `max_concurrency` messages in flight,
    /// topping the pool up from the database as tasks finish. Messages
    /// already in flight are excluded by item hash so confirmations of the
    /// same message cannot race each other.
    pub async fn run(self: Arc<Self>) {
        tracing::info!("starting fetch job");
        let mut in_flight: FuturesUnordered<tokio::task::JoinHandle<FetchOutcome>> =
            FuturesUnordered::new();
        let mut being_fetched: HashSet<String> = HashSet::new();

        loop {
            if !in_flight.is_empty() {
                match in_flight.next().await {
                    Some(Ok(outcome)) => {
                        being_fetched.remove(&outcome.item_hash);
                        if let Some((message_id, sender)) = outcome.announce {
                            self.processing_queue.publish(
                                "pending",
                                serde_json::json!({
                                    "message_id": message_id,
                                    "item_hash": outcome.item_hash,
                                    "sender": sender,
                                })
                                .to_string()
                                .into_bytes(),
                            );
                            tracing::info!(item_hash = %outcome.item_hash, "successfully fetched");
                        }
                    }
                    Some(Err(err)) => {
                        tracing::error!(%err, "fetch task panicked");
                        // The hash of a panicked task stays excluded until
                        // restart; the row itself will retry then.
                    }
                    None => {}
                }
            }

            if in_flight.len() < self.max_concurrency {
                let excluded: Vec<String> = being_fetched.iter().cloned().collect();
                let batch = match self.pool.acquire().await {
                    Ok(mut conn) => {
                        node_sql::pending_messages::get_next_pending_messages(
                            &mut conn,
                            chrono::Utc::now(),
                            (self.max_concurrency - in_flight.len()) as i64,
                            &excluded,
                            false,
                        )
                        .await
                    }
                    Err(err) => Err(err),
                };

                match batch {
                    Ok(batch) => {
                        for pending in batch {
                            if !being_fetched.insert(pending.item_hash.clone()) {
                                continue;
                            }
                            let fetcher = self.clone();
                            in_flight.push(tokio::spawn(
                                async move { fetcher.fetch_one(pending).await },
                            ));
                        }
                    }
                    Err(err) => {
                        tracing::error!(%err, "could not select pending messages");
                        tokio::time::sleep(IDLE_DELAY).await;
                    }
                }
            }

            if in_flight.is_empty() {
                tracing::debug!("waiting for new pending messages");
                tokio::time::sleep(IDLE_DELAY).await;
            }
        }
    }
}
