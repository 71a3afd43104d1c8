use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::types::Json;
use sqlx::PgConnection;

/// One AGGREGATE message content, kept forever so the projection can be
/// rebuilt when elements arrive out of order or are forgotten.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AggregateElementRow {
    pub item_hash: String,
    pub key: String,
    pub owner: String,
    pub content: Json<Value>,
    pub creation_datetime: DateTime<Utc>,
}

/// The merged projection served to users.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AggregateRow {
    pub key: String,
    pub owner: String,
    pub content: Json<Value>,
    pub creation_datetime: DateTime<Utc>,
    pub last_revision_hash: String,
    pub dirty: bool,
}

pub async fn insert_aggregate_element(
    conn: &mut PgConnection,
    element: &AggregateElementRow,
) -> sqlx::Result<()> {
    sqlx::query(
        r#"insert into aggregate_elements (item_hash, key, owner, content, creation_datetime)
           values ($1, $2, $3, $4, $5)"#,
    )
    .bind(&element.item_hash)
    .bind(&element.key)
    .bind(&element.owner)
    .bind(&element.content)
    .bind(element.creation_datetime)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn delete_aggregate_element(
    conn: &mut PgConnection,
    item_hash: &str,
) -> sqlx::Result<()> {
    sqlx::query("delete from aggregate_elements where item_hash = $1")
        .bind(item_hash)
        .execute(conn)
        .await?;
    Ok(())
}

/// All elements of one `(key, owner)` pair, oldest first: the merge order.
pub async fn get_aggregate_elements(
    conn: &mut PgConnection,
    key: &str,
    owner: &str,
) -> sqlx::Result<Vec<AggregateElementRow>> {
    sqlx::query_as::<_, AggregateElementRow>(
        r#"select item_hash, key, owner, content, creation_datetime
           from aggregate_elements
           where key = $1 and owner = $2
           order by creation_datetime asc, item_hash asc"#,
    )
    .bind(key)
    .bind(owner)
    .fetch_all(conn)
    .await
}

/// Elements of one key across owners, oldest first. The pricing timeline
/// is built from the elements of the pricing key.
pub async fn get_aggregate_elements_by_key(
    conn: &mut PgConnection,
    key: &str,
    owner: &str,
    until: DateTime<Utc>,
) -> sqlx::Result<Vec<AggregateElementRow>> {
    sqlx::query_as::<_, AggregateElementRow>(
        r#"select item_hash, key, owner, content, creation_datetime
           from aggregate_elements
           where key = $1 and owner = $2 and creation_datetime <= $3
           order by creation_datetime asc, item_hash asc"#,
    )
    .bind(key)
    .bind(owner)
    .bind(until)
    .fetch_all(conn)
    .await
}

pub async fn get_aggregate(
    conn: &mut PgConnection,
    key: &str,
    owner: &str,
) -> sqlx::Result<Option<AggregateRow>> {
    sqlx::query_as::<_, AggregateRow>(
        r#"select key, owner, content, creation_datetime, last_revision_hash, dirty
           from aggregates where key = $1 and owner = $2"#,
    )
    .bind(key)
    .bind(owner)
    .fetch_optional(conn)
    .await
}

/// Locks the projection row of a `(key, owner)` pair for the rest of the
/// transaction. Two elements of the same aggregate may be processed
/// concurrently; without the lock a stale merge could overwrite a newer
/// one.
pub async fn lock_aggregate(
    conn: &mut PgConnection,
    key: &str,
    owner: &str,
) -> sqlx::Result<Option<AggregateRow>> {
    sqlx::query_as::<_, AggregateRow>(
        r#"select key, owner, content, creation_datetime, last_revision_hash, dirty
           from aggregates where key = $1 and owner = $2
           for update"#,
    )
    .bind(key)
    .bind(owner)
    .fetch_optional(conn)
    .await
}

pub async fn upsert_aggregate(
    conn: &mut PgConnection,
    aggregate: &AggregateRow,
) -> sqlx::Result<()> {
    sqlx::query(
        r#"insert into aggregates
               (key, owner, content, creation_datetime, last_revision_hash, dirty)
           values ($1, $2, $3, $4, $5, $6)
           on conflict (key, owner) do update
           set content = excluded.content,
               creation_datetime = excluded.creation_datetime,
               last_revision_hash = excluded.last_revision_hash,
               dirty = excluded.dirty"#,
    )
    .bind(&aggregate.key)
    .bind(&aggregate.owner)
    .bind(&aggregate.content)
    .bind(aggregate.creation_datetime)
    .bind(&aggregate.last_revision_hash)
    .bind(aggregate.dirty)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn mark_aggregate_dirty(
    conn: &mut PgConnection,
    key: &str,
    owner: &str,
) -> sqlx::Result<()> {
    sqlx::query("update aggregates set dirty = true where key = $1 and owner = $2")
        .bind(key)
        .bind(owner)
        .execute(conn)
        .await?;
    Ok(())
}

pub async fn delete_aggregate(
    conn: &mut PgConnection,
    key: &str,
    owner: &str,
) -> sqlx::Result<()> {
    sqlx::query("delete from aggregates where key = $1 and owner = $2")
        .bind(key)
        .bind(owner)
        .execute(conn)
        .await?;
    Ok(())
}

/// All aggregates of one owner, newest first. Dirty rows are served as-is;
/// the rebuild converges them in the background.
pub async fn get_aggregates_by_owner(
    conn: &mut PgConnection,
    owner: &str,
    keys: Option<&[String]>,
    limit: i64,
    offset: i64,
) -> sqlx::Result<Vec<AggregateRow>> {
    sqlx::query_as::<_, AggregateRow>(
        r#"select key, owner, content, creation_datetime, last_revision_hash, dirty
           from aggregates
           where owner = $1 and ($2::text[] is null or key = any($2))
           order by creation_datetime desc, key asc
           limit $3 offset $4"#,
    )
    .bind(owner)
    .bind(keys)
    .bind(limit)
    .bind(offset)
    .fetch_all(conn)
    .await
}

/// Aggregates flagged for a rebuild after a FORGET removed one of their
/// elements.
pub async fn get_dirty_aggregates(
    conn: &mut PgConnection,
    limit: i64,
) -> sqlx::Result<Vec<(String, String)>> {
    sqlx::query_as("select key, owner from aggregates where dirty limit $1")
        .bind(limit)
        .fetch_all(conn)
        .await
}
