//! Garbage collection of unpinned stored files.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sqlx::PgPool;

use models::item_hash::item_type_from_hash;
use models::ItemType;

use crate::storage::StorageService;

pub struct GarbageCollector {
    pool: PgPool,
    storage: Arc<StorageService>,
    period: Duration,
}

impl GarbageCollector {
    pub fn new(pool: PgPool, storage: Arc<StorageService>, period: Duration) -> Self {
        GarbageCollector {
            pool,
            storage,
            period,
        }
    }

    /// Rebuilds the aggregates a FORGET left dirty. Their projection is
    /// already refreshed in the forget transaction; this sweep only picks
    /// up rows left behind by an interrupted rebuild.
    async fn refresh_dirty_aggregates(&self) -> anyhow::Result<()> {
        let mut txn = self.pool.begin().await?;
        let dirty = node_sql::aggregates::get_dirty_aggregates(&mut txn, 100).await?;
        for (key, owner) in dirty {
            crate::handlers::aggregate::refresh_aggregate(&mut txn, &key, &owner)
                .await
                .map_err(|err| anyhow::anyhow!("refreshing {key}/{owner}: {err}"))?;
        }
        txn.commit().await?;
        Ok(())
    }

    /// One pass: expire grace-period pins, then delete every file nothing
    /// pins anymore, from the database, the local store, and IPFS.
    pub async fn collect(&self) -> anyhow::Result<()> {
        self.refresh_dirty_aggregates().await?;

        let mut conn = self.pool.acquire().await?;

        let expired =
            node_sql::files::delete_expired_grace_period_pins(&mut conn, Utc::now()).await?;
        if expired > 0 {
            tracing::info!(expired, "expired grace-period pins removed");
        }

        let unpinned = node_sql::files::get_unpinned_files(&mut conn).await?;
        for file in unpinned {
            tracing::debug!(hash = %file.hash, "garbage collecting");

            self.storage
                .storage_engine()
                .delete(&file.hash)
                .await
                .unwrap_or_else(|err| {
                    tracing::warn!(hash = %file.hash, %err, "could not delete blob");
                });

            if matches!(item_type_from_hash(&file.hash), Ok(ItemType::Ipfs)) {
                if let Some(ipfs) = self.storage.ipfs_client() {
                    if let Err(err) = ipfs.pin_rm(&file.hash).await {
                        tracing::warn!(hash = %file.hash, %err, "could not unpin from ipfs");
                    } else if let Err(err) = ipfs.repo_gc().await {
                        tracing::warn!(%err, "ipfs repo gc failed");
                    }
                }
            }

            node_sql::files::delete_file(&mut conn, &file.hash).await?;
            tracing::info!(hash = %file.hash, "deleted stored file");
        }
        Ok(())
    }

    pub async fn run(self: Arc<Self>) {
        loop {
            if let Err(err) = self.collect().await {
                tracing::error!(%err, "error in garbage collector job");
                // Short sleep to avoid flooding the logs on repeating
                // errors.
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            tokio::time::sleep(self.period).await;
        }
    }
}
