use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::types::Json;
use sqlx::PgConnection;

use models::{Chain, ErrorCode, ItemType, MessageStatus, MessageType};

/// A processed and validated message.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MessageRow {
    pub item_hash: String,
    #[sqlx(rename = "type")]
    pub message_type: MessageType,
    pub chain: Chain,
    pub sender: String,
    pub signature: Option<String>,
    pub item_type: ItemType,
    pub item_content: Option<String>,
    pub content: Json<Value>,
    pub time: DateTime<Utc>,
    pub channel: Option<String>,
    pub size: i64,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MessageStatusRow {
    pub item_hash: String,
    pub status: MessageStatus,
    pub reception_time: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ForgottenMessageRow {
    pub item_hash: String,
    #[sqlx(rename = "type")]
    pub message_type: MessageType,
    pub chain: Chain,
    pub sender: String,
    pub signature: Option<String>,
    pub item_type: ItemType,
    pub time: DateTime<Utc>,
    pub channel: Option<String>,
    pub forgotten_by: Vec<String>,
}

pub async fn get_message(
    conn: &mut PgConnection,
    item_hash: &str,
) -> sqlx::Result<Option<MessageRow>> {
    sqlx::query_as::<_, MessageRow>(
        r#"select item_hash, type, chain, sender, signature, item_type, item_content,
                  content, time, channel, size
           from messages where item_hash = $1"#,
    )
    .bind(item_hash)
    .fetch_optional(conn)
    .await
}

/// Inserts a message. On replays the earliest declared time wins, so that
/// confirmations arriving late cannot move a message forward in time.
pub async fn upsert_message(conn: &mut PgConnection, message: &MessageRow) -> sqlx::Result<()> {
    sqlx::query(
        r#"insert into messages
               (item_hash, type, chain, sender, signature, item_type, item_content,
                content, time, channel, size)
           values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
           on conflict (item_hash) do update
           set time = least(messages.time, excluded.time)"#,
    )
    .bind(&message.item_hash)
    .bind(message.message_type)
    .bind(message.chain)
    .bind(&message.sender)
    .bind(&message.signature)
    .bind(message.item_type)
    .bind(&message.item_content)
    .bind(&message.content)
    .bind(message.time)
    .bind(&message.channel)
    .bind(message.size)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn delete_message(conn: &mut PgConnection, item_hash: &str) -> sqlx::Result<()> {
    sqlx::query("delete from messages where item_hash = $1")
        .bind(item_hash)
        .execute(conn)
        .await?;
    Ok(())
}

pub async fn get_message_status(
    conn: &mut PgConnection,
    item_hash: &str,
) -> sqlx::Result<Option<MessageStatusRow>> {
    sqlx::query_as::<_, MessageStatusRow>(
        "select item_hash, status, reception_time from message_status where item_hash = $1",
    )
    .bind(item_hash)
    .fetch_optional(conn)
    .await
}

/// Transitions the status of a message. Transitions are guarded so they
/// stay monotone: an existing row is only updated when its current status
/// is one of `allowed_current`. A fresh submission may resurrect a
/// REJECTED or FORGOTTEN message, but the pipeline itself never rewinds a
/// status.
pub async fn upsert_message_status(
    conn: &mut PgConnection,
    item_hash: &str,
    new_status: MessageStatus,
    reception_time: DateTime<Utc>,
    allowed_current: &[MessageStatus],
) -> sqlx::Result<()> {
    sqlx::query(
        r#"insert into message_status (item_hash, status, reception_time)
           values ($1, $2, $3)
           on conflict (item_hash) do update
           set status = excluded.status,
               reception_time = least(message_status.reception_time, excluded.reception_time)
           where message_status.status = any($4)"#,
    )
    .bind(item_hash)
    .bind(new_status)
    .bind(reception_time)
    .bind(allowed_current)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn upsert_message_confirmation(
    conn: &mut PgConnection,
    item_hash: &str,
    tx_hash: &str,
) -> sqlx::Result<()> {
    sqlx::query(
        r#"insert into message_confirmations (item_hash, tx_hash)
           values ($1, $2)
           on conflict (item_hash, tx_hash) do nothing"#,
    )
    .bind(item_hash)
    .bind(tx_hash)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn delete_message_confirmations(
    conn: &mut PgConnection,
    item_hash: &str,
) -> sqlx::Result<()> {
    sqlx::query("delete from message_confirmations where item_hash = $1")
        .bind(item_hash)
        .execute(conn)
        .await?;
    Ok(())
}

/// Records a rejection. The raw message dict is kept so operators can
/// replay it after a fix; the traceback is only set for internal errors.
pub async fn upsert_rejected_message(
    conn: &mut PgConnection,
    item_hash: &str,
    message: &Value,
    error_code: ErrorCode,
    details: Option<&Value>,
    traceback: Option<&str>,
) -> sqlx::Result<()> {
    sqlx::query(
        r#"insert into rejected_messages (item_hash, message, error_code, details, traceback)
           values ($1, $2, $3, $4, $5)
           on conflict (item_hash) do update
           set message = excluded.message,
               error_code = excluded.error_code,
               details = excluded.details,
               traceback = excluded.traceback"#,
    )
    .bind(item_hash)
    .bind(Json(message))
    .bind(error_code.code())
    .bind(details.map(Json))
    .bind(traceback)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn delete_rejected_message(conn: &mut PgConnection, item_hash: &str) -> sqlx::Result<()> {
    sqlx::query("delete from rejected_messages where item_hash = $1")
        .bind(item_hash)
        .execute(conn)
        .await?;
    Ok(())
}

pub async fn get_forgotten_message(
    conn: &mut PgConnection,
    item_hash: &str,
) -> sqlx::Result<Option<ForgottenMessageRow>> {
    sqlx::query_as::<_, ForgottenMessageRow>(
        r#"select item_hash, type, chain, sender, signature, item_type, time, channel,
                  forgotten_by
           from forgotten_messages where item_hash = $1"#,
    )
    .bind(item_hash)
    .fetch_optional(conn)
    .await
}

/// Tombstones a message. Re-forgetting through another FORGET appends to
/// `forgotten_by` instead of duplicating the row.
pub async fn upsert_forgotten_message(
    conn: &mut PgConnection,
    message: &MessageRow,
    forgotten_by: &str,
) -> sqlx::Result<()> {
    sqlx::query(
        r#"insert into forgotten_messages
               (item_hash, type, chain, sender, signature, item_type, time, channel,
                forgotten_by)
           values ($1, $2, $3, $4, $5, $6, $7, $8, array[$9])
           on conflict (item_hash) do update
           set forgotten_by = array_append(forgotten_messages.forgotten_by, $9)
           where not forgotten_messages.forgotten_by @> array[$9]"#,
    )
    .bind(&message.item_hash)
    .bind(message.message_type)
    .bind(message.chain)
    .bind(&message.sender)
    .bind(&message.signature)
    .bind(message.item_type)
    .bind(message.time)
    .bind(&message.channel)
    .bind(forgotten_by)
    .execute(conn)
    .await?;
    Ok(())
}

/// Messages not yet confirmed by any chain transaction, oldest first. Used
/// when packing an outbound sync archive.
pub async fn get_unconfirmed_messages(
    conn: &mut PgConnection,
    limit: i64,
) -> sqlx::Result<Vec<MessageRow>> {
    sqlx::query_as::<_, MessageRow>(
        r#"select m.item_hash, m.type, m.chain, m.sender, m.signature, m.item_type,
                  m.item_content, m.content, m.time, m.channel, m.size
           from messages m
           left join message_confirmations mc on mc.item_hash = m.item_hash
           where mc.item_hash is null
           order by m.time asc
           limit $1"#,
    )
    .bind(limit)
    .fetch_all(conn)
    .await
}

/// Messages of one sender ordered by the earliest confirmation time.
/// Unconfirmed messages sort last in ascending order and first when
/// descending, matching the API's "sort by tx time" mode.
pub async fn get_messages_by_tx_time(
    conn: &mut PgConnection,
    sender: &str,
    ascending: bool,
    limit: i64,
) -> sqlx::Result<Vec<MessageRow>> {
    let query = if ascending {
        r#"select m.item_hash, m.type, m.chain, m.sender, m.signature, m.item_type,
                  m.item_content, m.content, m.time, m.channel, m.size
           from messages m
           left join message_confirmations mc on mc.item_hash = m.item_hash
           left join chain_txs tx on tx.hash = mc.tx_hash
           where m.sender = $1
           group by m.item_hash
           order by min(tx.datetime) asc nulls last
           limit $2"#
    } else {
        r#"select m.item_hash, m.type, m.chain, m.sender, m.signature, m.item_type,
                  m.item_content, m.content, m.time, m.channel, m.size
           from messages m
           left join message_confirmations mc on mc.item_hash = m.item_hash
           left join chain_txs tx on tx.hash = mc.tx_hash
           where m.sender = $1
           group by m.item_hash
           order by min(tx.datetime) desc nulls first
           limit $2"#
    };
    sqlx::query_as::<_, MessageRow>(query)
        .bind(sender)
        .bind(limit)
        .fetch_all(conn)
        .await
}
