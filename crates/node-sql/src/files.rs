use chrono::{DateTime, Utc};
use sqlx::PgConnection;

use models::{FilePinType, FileType};

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredFileRow {
    pub hash: String,
    pub size: i64,
    #[sqlx(rename = "type")]
    pub file_type: FileType,
}

/// One reason to keep a file around. A single relation holds all pin
/// variants; the nullable columns are read according to `type`.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct FilePinRow {
    pub id: i64,
    pub file_hash: String,
    pub created: DateTime<Utc>,
    #[sqlx(rename = "type")]
    pub pin_type: FilePinType,
    pub owner: Option<String>,
    pub item_hash: Option<String>,
    #[sqlx(rename = "ref")]
    pub ref_: Option<String>,
    pub tx_hash: Option<String>,
    pub delete_by: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct FileTagRow {
    pub tag: String,
    pub owner: String,
    pub file_hash: String,
    pub last_updated: DateTime<Utc>,
}

pub async fn upsert_stored_file(
    conn: &mut PgConnection,
    file_hash: &str,
    size: i64,
    file_type: FileType,
) -> sqlx::Result<()> {
    sqlx::query(
        r#"insert into files (hash, size, type) values ($1, $2, $3)
           on conflict (hash) do nothing"#,
    )
    .bind(file_hash)
    .bind(size)
    .bind(file_type)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn get_file(
    conn: &mut PgConnection,
    file_hash: &str,
) -> sqlx::Result<Option<StoredFileRow>> {
    sqlx::query_as::<_, StoredFileRow>("select hash, size, type from files where hash = $1")
        .bind(file_hash)
        .fetch_optional(conn)
        .await
}

pub async fn delete_file(conn: &mut PgConnection, file_hash: &str) -> sqlx::Result<()> {
    sqlx::query("delete from files where hash = $1")
        .bind(file_hash)
        .execute(conn)
        .await?;
    Ok(())
}

pub async fn is_pinned_file(conn: &mut PgConnection, file_hash: &str) -> sqlx::Result<bool> {
    let exists: Option<(i32,)> =
        sqlx::query_as("select 1 from file_pins where file_hash = $1 limit 1")
            .bind(file_hash)
            .fetch_optional(conn)
            .await?;
    Ok(exists.is_some())
}

/// Files no pin references anymore, candidates for garbage collection.
pub async fn get_unpinned_files(conn: &mut PgConnection) -> sqlx::Result<Vec<StoredFileRow>> {
    sqlx::query_as::<_, StoredFileRow>(
        r#"select f.hash, f.size, f.type
           from files f
           where not exists (select 1 from file_pins p where p.file_hash = f.hash)"#,
    )
    .fetch_all(conn)
    .await
}

pub async fn insert_content_file_pin(
    conn: &mut PgConnection,
    file_hash: &str,
    owner: &str,
    item_hash: &str,
    created: DateTime<Utc>,
) -> sqlx::Result<()> {
    sqlx::query(
        r#"insert into file_pins (file_hash, created, type, owner, item_hash)
           values ($1, $2, $3, $4, $5)
           on conflict (item_hash, type) do nothing"#,
    )
    .bind(file_hash)
    .bind(created)
    .bind(FilePinType::Content)
    .bind(owner)
    .bind(item_hash)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn insert_message_file_pin(
    conn: &mut PgConnection,
    file_hash: &str,
    owner: &str,
    item_hash: &str,
    ref_: Option<&str>,
    created: DateTime<Utc>,
) -> sqlx::Result<()> {
    sqlx::query(
        r#"insert into file_pins (file_hash, created, type, owner, item_hash, ref)
           values ($1, $2, $3, $4, $5, $6)
           on conflict (item_hash, type) do nothing"#,
    )
    .bind(file_hash)
    .bind(created)
    .bind(FilePinType::Message)
    .bind(owner)
    .bind(item_hash)
    .bind(ref_)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn upsert_tx_file_pin(
    conn: &mut PgConnection,
    file_hash: &str,
    tx_hash: &str,
    created: DateTime<Utc>,
) -> sqlx::Result<()> {
    sqlx::query(
        r#"insert into file_pins (file_hash, created, type, tx_hash)
           values ($1, $2, $3, $4)
           on conflict do nothing"#,
    )
    .bind(file_hash)
    .bind(created)
    .bind(FilePinType::Tx)
    .bind(tx_hash)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn insert_grace_period_file_pin(
    conn: &mut PgConnection,
    file_hash: &str,
    created: DateTime<Utc>,
    delete_by: DateTime<Utc>,
) -> sqlx::Result<()> {
    sqlx::query(
        r#"insert into file_pins (file_hash, created, type, delete_by)
           values ($1, $2, $3, $4)"#,
    )
    .bind(file_hash)
    .bind(created)
    .bind(FilePinType::GracePeriod)
    .bind(delete_by)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn delete_expired_grace_period_pins(
    conn: &mut PgConnection,
    current_time: DateTime<Utc>,
) -> sqlx::Result<u64> {
    let result = sqlx::query("delete from file_pins where type = $1 and delete_by < $2")
        .bind(FilePinType::GracePeriod)
        .bind(current_time)
        .execute(conn)
        .await?;
    Ok(result.rows_affected())
}

pub async fn get_message_file_pin(
    conn: &mut PgConnection,
    item_hash: &str,
) -> sqlx::Result<Option<FilePinRow>> {
    sqlx::query_as::<_, FilePinRow>(
        r#"select id, file_hash, created, type, owner, item_hash, ref, tx_hash, delete_by
           from file_pins where item_hash = $1 and type = $2"#,
    )
    .bind(item_hash)
    .bind(FilePinType::Message)
    .fetch_optional(conn)
    .await
}

/// Message pins resolving each of the given item hashes, used to check VM
/// volume dependencies in one query.
pub async fn find_message_file_pins(
    conn: &mut PgConnection,
    item_hashes: &[String],
) -> sqlx::Result<Vec<String>> {
    let rows: Vec<(String,)> = sqlx::query_as(
        "select item_hash from file_pins where type = $1 and item_hash = any($2)",
    )
    .bind(FilePinType::Message)
    .bind(item_hashes)
    .fetch_all(conn)
    .await?;
    Ok(rows.into_iter().map(|(hash,)| hash).collect())
}

pub async fn delete_message_file_pin(
    conn: &mut PgConnection,
    item_hash: &str,
) -> sqlx::Result<()> {
    sqlx::query("delete from file_pins where item_hash = $1 and type = $2")
        .bind(item_hash)
        .bind(FilePinType::Message)
        .execute(conn)
        .await?;
    Ok(())
}

/// Drops the pin holding the body of a non-inline message, when the
/// message itself is forgotten.
pub async fn delete_content_file_pin(
    conn: &mut PgConnection,
    item_hash: &str,
) -> sqlx::Result<()> {
    sqlx::query("delete from file_pins where item_hash = $1 and type = $2")
        .bind(item_hash)
        .bind(FilePinType::Content)
        .execute(conn)
        .await?;
    Ok(())
}

pub async fn get_file_tag(
    conn: &mut PgConnection,
    tag: &str,
) -> sqlx::Result<Option<FileTagRow>> {
    sqlx::query_as::<_, FileTagRow>(
        "select tag, owner, file_hash, last_updated from file_tags where tag = $1",
    )
    .bind(tag)
    .fetch_optional(conn)
    .await
}

pub async fn find_file_tags(
    conn: &mut PgConnection,
    tags: &[String],
) -> sqlx::Result<Vec<String>> {
    let rows: Vec<(String,)> = sqlx::query_as("select tag from file_tags where tag = any($1)")
        .bind(tags)
        .fetch_all(conn)
        .await?;
    Ok(rows.into_iter().map(|(tag,)| tag).collect())
}

/// Updates a tag with last-write-wins semantics on the message time, so
/// out-of-order STORE revisions converge on the newest file.
pub async fn upsert_file_tag(
    conn: &mut PgConnection,
    tag: &str,
    owner: &str,
    file_hash: &str,
    last_updated: DateTime<Utc>,
) -> sqlx::Result<()> {
    sqlx::query(
        r#"insert into file_tags (tag, owner, file_hash, last_updated)
           values ($1, $2, $3, $4)
           on conflict (tag) do update
           set file_hash = excluded.file_hash, last_updated = excluded.last_updated
           where file_tags.last_updated < excluded.last_updated"#,
    )
    .bind(tag)
    .bind(owner)
    .bind(file_hash)
    .bind(last_updated)
    .execute(conn)
    .await?;
    Ok(())
}

/// Rebuilds a tag from the message pins still alive, after a STORE was
/// forgotten. The tag disappears when no pin resolves it anymore. A pin
/// resolves the tag either directly (hash tags) or through its
/// owner-namespaced `<owner>/<ref>` form (user-defined tags).
pub async fn refresh_file_tag(conn: &mut PgConnection, tag: &str) -> sqlx::Result<()> {
    sqlx::query("delete from file_tags where tag = $1")
        .bind(tag)
        .execute(&mut *conn)
        .await?;
    sqlx::query(
        r#"insert into file_tags (tag, owner, file_hash, last_updated)
           select $1, p.owner, p.file_hash, p.created
           from file_pins p
           where p.type = 'message'
             and (coalesce(p.ref, p.item_hash) = $1 or p.owner || '/' || p.ref = $1)
           order by p.created desc
           limit 1
           on conflict (tag) do update
           set file_hash = excluded.file_hash, last_updated = excluded.last_updated"#,
    )
    .bind(tag)
    .execute(conn)
    .await?;
    Ok(())
}

/// Sum of pinned file sizes per owner, used by the storage admission check.
pub async fn get_address_files_size(conn: &mut PgConnection, owner: &str) -> sqlx::Result<i64> {
    let (size,): (Option<i64>,) = sqlx::query_as(
        r#"select sum(f.size)::bigint
           from file_pins p
           join files f on f.hash = p.file_hash
           where p.type = 'message' and p.owner = $1"#,
    )
    .bind(owner)
    .fetch_one(conn)
    .await?;
    Ok(size.unwrap_or(0))
}
