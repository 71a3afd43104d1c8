use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::types::Json;
use sqlx::PgConnection;

use models::sync::{ChainEventType, ChainSyncProtocol};
use models::Chain;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ChainTxRow {
    pub hash: String,
    pub chain: Chain,
    pub height: i64,
    pub datetime: DateTime<Utc>,
    pub publisher: String,
    pub protocol: ChainSyncProtocol,
    pub protocol_version: i32,
    pub content: Json<Value>,
}

pub async fn upsert_chain_tx(conn: &mut PgConnection, tx: &ChainTxRow) -> sqlx::Result<()> {
    sqlx::query(
        r#"insert into chain_txs
               (hash, chain, height, datetime, publisher, protocol, protocol_version, content)
           values ($1, $2, $3, $4, $5, $6, $7, $8)
           on conflict (hash) do nothing"#,
    )
    .bind(&tx.hash)
    .bind(tx.chain)
    .bind(tx.height)
    .bind(tx.datetime)
    .bind(&tx.publisher)
    .bind(tx.protocol)
    .bind(tx.protocol_version)
    .bind(&tx.content)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn get_chain_tx(
    conn: &mut PgConnection,
    tx_hash: &str,
) -> sqlx::Result<Option<ChainTxRow>> {
    sqlx::query_as::<_, ChainTxRow>(
        r#"select hash, chain, height, datetime, publisher, protocol, protocol_version,
                  content
           from chain_txs where hash = $1"#,
    )
    .bind(tx_hash)
    .fetch_optional(conn)
    .await
}

pub async fn upsert_pending_tx(conn: &mut PgConnection, tx_hash: &str) -> sqlx::Result<()> {
    sqlx::query(
        "insert into pending_txs (tx_hash) values ($1) on conflict (tx_hash) do nothing",
    )
    .bind(tx_hash)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn delete_pending_tx(conn: &mut PgConnection, tx_hash: &str) -> sqlx::Result<()> {
    sqlx::query("delete from pending_txs where tx_hash = $1")
        .bind(tx_hash)
        .execute(conn)
        .await?;
    Ok(())
}

pub async fn count_pending_txs(conn: &mut PgConnection) -> sqlx::Result<i64> {
    let (count,): (i64,) = sqlx::query_as("select count(*) from pending_txs")
        .fetch_one(conn)
        .await?;
    Ok(count)
}

/// Height-based cursor of simple block scanners.
pub async fn get_last_height(
    conn: &mut PgConnection,
    chain: Chain,
    sync_type: ChainEventType,
) -> sqlx::Result<Option<i64>> {
    let row: Option<(i64,)> =
        sqlx::query_as("select height from chains_sync_status where chain = $1 and type = $2")
            .bind(chain)
            .bind(sync_type)
            .fetch_optional(conn)
            .await?;
    Ok(row.map(|(height,)| height))
}

pub async fn upsert_chain_sync_status(
    conn: &mut PgConnection,
    chain: Chain,
    sync_type: ChainEventType,
    height: i64,
    update_datetime: DateTime<Utc>,
) -> sqlx::Result<()> {
    sqlx::query(
        r#"insert into chains_sync_status (chain, type, height, last_update)
           values ($1, $2, $3, $4)
           on conflict (chain, type) do update
           set height = excluded.height, last_update = excluded.last_update"#,
    )
    .bind(chain)
    .bind(sync_type)
    .bind(height)
    .bind(update_datetime)
    .execute(conn)
    .await?;
    Ok(())
}

/// The set of datetime windows already synced from an external indexer,
/// stored as JSON so the multirange survives schema-free.
pub async fn get_indexer_multirange(
    conn: &mut PgConnection,
    chain: Chain,
    event_type: ChainEventType,
) -> sqlx::Result<models::MultiRange<DateTime<Utc>>> {
    let row: Option<(Json<models::MultiRange<DateTime<Utc>>>,)> = sqlx::query_as(
        "select ranges from indexer_sync_status where chain = $1 and event_type = $2",
    )
    .bind(chain)
    .bind(event_type)
    .fetch_optional(conn)
    .await?;
    Ok(row.map(|(Json(ranges),)| ranges).unwrap_or_default())
}

pub async fn upsert_indexer_multirange(
    conn: &mut PgConnection,
    chain: Chain,
    event_type: ChainEventType,
    ranges: &models::MultiRange<DateTime<Utc>>,
    last_updated: DateTime<Utc>,
) -> sqlx::Result<()> {
    sqlx::query(
        r#"insert into indexer_sync_status (chain, event_type, ranges, last_updated)
           values ($1, $2, $3, $4)
           on conflict (chain, event_type) do update
           set ranges = excluded.ranges, last_updated = excluded.last_updated"#,
    )
    .bind(chain)
    .bind(event_type)
    .bind(Json(ranges))
    .bind(last_updated)
    .execute(conn)
    .await?;
    Ok(())
}
