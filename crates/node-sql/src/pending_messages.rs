use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::types::Json;
use sqlx::PgConnection;

use models::{Chain, ItemType, MessageType};

/// A message awaiting fetch or processing. Several rows may exist for the
/// same item hash when a message is confirmed by multiple transactions;
/// they collapse into confirmations at processing time.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PendingMessageRow {
    pub id: i64,
    pub item_hash: String,
    #[sqlx(rename = "type")]
    pub message_type: MessageType,
    pub chain: Chain,
    pub sender: String,
    pub signature: Option<String>,
    pub item_type: ItemType,
    pub item_content: Option<String>,
    pub content: Option<Json<Value>>,
    pub time: DateTime<Utc>,
    pub channel: Option<String>,
    pub reception_time: DateTime<Utc>,
    pub check_message: bool,
    pub next_attempt: DateTime<Utc>,
    pub retries: i32,
    pub tx_hash: Option<String>,
    pub fetched: bool,
}

pub struct NewPendingMessage {
    pub item_hash: String,
    pub message_type: MessageType,
    pub chain: Chain,
    pub sender: String,
    pub signature: Option<String>,
    pub item_type: ItemType,
    pub item_content: Option<String>,
    pub content: Option<Value>,
    pub time: DateTime<Utc>,
    pub channel: Option<String>,
    pub reception_time: DateTime<Utc>,
    pub check_message: bool,
    pub tx_hash: Option<String>,
    pub fetched: bool,
}

const COLUMNS: &str = r#"id, item_hash, type, chain, sender, signature, item_type,
    item_content, content, time, channel, reception_time, check_message,
    next_attempt, retries, tx_hash, fetched"#;

pub async fn insert_pending_message(
    conn: &mut PgConnection,
    message: &NewPendingMessage,
) -> sqlx::Result<i64> {
    // Historical messages replay in declared order; future-dated messages
    // do not get to jump the queue.
    let (id,): (i64,) = sqlx::query_as(
        r#"insert into pending_messages
               (item_hash, type, chain, sender, signature, item_type, item_content,
                content, time, channel, reception_time, check_message, next_attempt,
                retries, tx_hash, fetched)
           values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12,
                   least($9, $11), 0, $13, $14)
           returning id"#,
    )
    .bind(&message.item_hash)
    .bind(message.message_type)
    .bind(message.chain)
    .bind(&message.sender)
    .bind(&message.signature)
    .bind(message.item_type)
    .bind(&message.item_content)
    .bind(message.content.as_ref().map(Json))
    .bind(message.time)
    .bind(&message.channel)
    .bind(message.reception_time)
    .bind(message.check_message)
    .bind(&message.tx_hash)
    .bind(message.fetched)
    .fetch_one(conn)
    .await?;
    Ok(id)
}

pub async fn get_pending_message(
    conn: &mut PgConnection,
    id: i64,
) -> sqlx::Result<Option<PendingMessageRow>> {
    sqlx::query_as::<_, PendingMessageRow>(&format!(
        "select {COLUMNS} from pending_messages where id = $1"
    ))
    .bind(id)
    .fetch_optional(conn)
    .await
}

/// Next batch of pending messages ready for an attempt, oldest first.
/// Rows already being worked on are excluded by hash so two workers never
/// race on the same message.
pub async fn get_next_pending_messages(
    conn: &mut PgConnection,
    current_time: DateTime<Utc>,
    limit: i64,
    exclude_item_hashes: &[String],
    fetched: bool,
) -> sqlx::Result<Vec<PendingMessageRow>> {
    sqlx::query_as::<_, PendingMessageRow>(&format!(
        r#"select {COLUMNS} from pending_messages
           where fetched = $1
             and next_attempt <= $2
             and item_hash != all($3)
           order by next_attempt asc
           limit $4"#
    ))
    .bind(fetched)
    .bind(current_time)
    .bind(exclude_item_hashes)
    .bind(limit)
    .fetch_all(conn)
    .await
}

pub async fn count_pending_messages(conn: &mut PgConnection, fetched: bool) -> sqlx::Result<i64> {
    let (count,): (i64,) =
        sqlx::query_as("select count(*) from pending_messages where fetched = $1")
            .bind(fetched)
            .fetch_one(conn)
            .await?;
    Ok(count)
}

/// Marks a pending message as fetched and stores the resolved content.
pub async fn mark_pending_message_fetched(
    conn: &mut PgConnection,
    id: i64,
    content: &Value,
) -> sqlx::Result<()> {
    sqlx::query(
        "update pending_messages set fetched = true, retries = 0, content = $2 where id = $1",
    )
    .bind(id)
    .bind(Json(content))
    .execute(conn)
    .await?;
    Ok(())
}

/// Reschedules a failed attempt.
pub async fn reschedule_pending_message(
    conn: &mut PgConnection,
    id: i64,
    retries: i32,
    next_attempt: DateTime<Utc>,
) -> sqlx::Result<()> {
    sqlx::query("update pending_messages set retries = $2, next_attempt = $3 where id = $1")
        .bind(id)
        .bind(retries)
        .bind(next_attempt)
        .execute(conn)
        .await?;
    Ok(())
}

pub async fn delete_pending_message(conn: &mut PgConnection, id: i64) -> sqlx::Result<()> {
    sqlx::query("delete from pending_messages where id = $1")
        .bind(id)
        .execute(conn)
        .await?;
    Ok(())
}

/// Deletes every pending row of an item hash, used on terminal rejection.
pub async fn delete_pending_messages_by_item_hash(
    conn: &mut PgConnection,
    item_hash: &str,
) -> sqlx::Result<()> {
    sqlx::query("delete from pending_messages where item_hash = $1")
        .bind(item_hash)
        .execute(conn)
        .await?;
    Ok(())
}
