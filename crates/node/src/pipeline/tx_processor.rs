//! The pending-TX stage: turns one observed chain transaction into the
//! pending messages it carries.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use sqlx::PgPool;

use crate::chains::chain_data::ChainDataService;
use crate::error::MessageProcessingError;
use crate::mq::{Exchange, WorkQueue};

use super::message_handler::MessageHandler;

const SWEEP_DELAY: Duration = Duration::from_secs(5);

pub struct PendingTxProcessor {
    pool: PgPool,
    chain_data: Arc<ChainDataService>,
    handler: Arc<MessageHandler>,
    pending_tx_exchange: Exchange,
    processing_queue: WorkQueue,
    max_concurrency: usize,
}

impl PendingTxProcessor {
    pub fn new(
        pool: PgPool,
        chain_data: Arc<ChainDataService>,
        handler: Arc<MessageHandler>,
        pending_tx_exchange: Exchange,
        processing_queue: WorkQueue,
        max_concurrency: usize,
    ) -> Self {
        PendingTxProcessor {
            pool,
            chain_data,
            handler,
            pending_tx_exchange,
            processing_queue,
            max_concurrency,
        }
    }

    /// Materializes the messages of one TX and deletes its pending-TX row.
    /// Sub-millisecond nudges preserve the intra-TX message order under
    /// later time-based sorts.
    pub async fn handle_pending_tx(
        &self,
        tx_hash: &str,
        seen_ids: &tokio::sync::Mutex<HashSet<String>>,
    ) -> Result<(), MessageProcessingError> {
        let mut txn = self.pool.begin().await?;

        let Some(tx) = node_sql::chains::get_chain_tx(&mut txn, tx_hash).await? else {
            tracing::warn!(%tx_hash, "pending tx without chain tx row");
            node_sql::chains::delete_pending_tx(&mut txn, tx_hash).await?;
            txn.commit().await?;
            return Ok(());
        };
        tracing::info!(chain = %tx.chain, height = tx.height, "handling TX");

        let messages = self.chain_data.get_tx_messages(&mut txn, &tx, seen_ids).await?;

        let reception_time = Utc::now();
        let mut admitted = Vec::new();
        for (index, mut message_dict) in messages.into_iter().enumerate() {
            // Force the intra-TX order through the time field.
            let nudged_time = tx.datetime.timestamp() as f64
                + f64::from(tx.datetime.timestamp_subsec_micros()) / 1_000_000.0
                + index as f64 / 1000.0;
            if let Some(object) = message_dict.as_object_mut() {
                object.insert("time".to_string(), nudged_time.into());
            }

            match self
                .handler
                .add_pending_message(
                    &mut txn,
                    &message_dict,
                    reception_time,
                    Some(tx.hash.clone()),
                    false,
                )
                .await
            {
                Ok(Some(message)) => admitted.push(message),
                Ok(None) => {
                    tracing::warn!(tx_hash = %tx.hash, index, "skipping invalid message in TX");
                }
                Err(err) => {
                    tracing::warn!(%err, tx_hash = %tx.hash, index, "could not add message from TX");
                }
            }
        }

        node_sql::chains::delete_pending_tx(&mut txn, &tx.hash).await?;
        txn.commit().await?;

        // Announce once the rows are committed. Messages with unresolved
        // content go through the fetch stage first; the rest skip straight
        // to processing.
        for message in admitted {
            if message.fetched {
                self.processing_queue.publish(
                    "pending",
                    serde_json::json!({
                        "message_id": message.id,
                        "item_hash": message.item_hash,
                        "sender": message.sender,
                    })
                    .to_string()
                    .into_bytes(),
                );
            }
        }
        Ok(())
    }

    async fn sweep(&self) -> Result<(), MessageProcessingError> {
        let tx_hashes: Vec<(String,)> = {
            let mut conn = self.pool.acquire().await?;
            sqlx::query_as("select tx_hash from pending_txs")
                .fetch_all(&mut *conn)
                .await?
        };
        if tx_hashes.is_empty() {
            return Ok(());
        }

        // One shared dedup set per sweep: duplicated off-chain archives
        // across chains are fetched once.
        let seen_ids = Arc::new(tokio::sync::Mutex::new(HashSet::new()));
        let mut tasks = FuturesUnordered::new();

        for (tx_hash,) in tx_hashes {
            while tasks.len() >= self.max_concurrency {
                let _ = tasks.next().await;
            }
            let seen_ids = seen_ids.clone();
            tasks.push(async move {
                if let Err(err) = self.handle_pending_tx(&tx_hash, &seen_ids).await {
                    tracing::error!(%err, %tx_hash, "error in pending tx task");
                }
            });
        }
        while tasks.next().await.is_some() {}
        Ok(())
    }

    /// Announcement-driven handling plus a periodic sweep for anything the
    /// exchange missed (e.g. TXs persisted before a restart).
    pub async fn run(self: Arc<Self>) {
        let mut subscription = self.pending_tx_exchange.subscribe("#");
        loop {
            tokio::select! {
                announcement = subscription.recv() => {
                    let Some(message) = announcement else {
                        tracing::warn!("pending tx exchange closed");
                        return;
                    };
                    let tx_hash = String::from_utf8_lossy(&message.body).into_owned();
                    let seen_ids = tokio::sync::Mutex::new(HashSet::new());
                    if let Err(err) = self.handle_pending_tx(&tx_hash, &seen_ids).await {
                        tracing::error!(%err, %tx_hash, "error handling announced tx");
                    }
                }
                _ = tokio::time::sleep(SWEEP_DELAY) => {
                    if let Err(err) = self.sweep().await {
                        tracing::error!(%err, "error in pending txs sweep");
                    }
                }
            }
        }
    }
}
