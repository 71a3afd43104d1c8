use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::types::Json;
use sqlx::PgConnection;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PostRow {
    pub item_hash: String,
    pub owner: String,
    #[sqlx(rename = "type")]
    pub post_type: Option<String>,
    #[sqlx(rename = "ref")]
    pub ref_: Option<String>,
    pub amends: Option<String>,
    pub channel: Option<String>,
    pub content: Json<Value>,
    pub creation_datetime: DateTime<Utc>,
    /// Hash of the newest amend of this post, kept up to date on insert
    /// and forget of amends.
    pub latest_amend: Option<String>,
}

pub async fn insert_post(conn: &mut PgConnection, post: &PostRow) -> sqlx::Result<()> {
    sqlx::query(
        r#"insert into posts
               (item_hash, owner, type, ref, amends, channel, content, creation_datetime,
                latest_amend)
           values ($1, $2, $3, $4, $5, $6, $7, $8, $9)"#,
    )
    .bind(&post.item_hash)
    .bind(&post.owner)
    .bind(&post.post_type)
    .bind(&post.ref_)
    .bind(&post.amends)
    .bind(&post.channel)
    .bind(&post.content)
    .bind(post.creation_datetime)
    .bind(&post.latest_amend)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn get_post(
    conn: &mut PgConnection,
    item_hash: &str,
) -> sqlx::Result<Option<PostRow>> {
    sqlx::query_as::<_, PostRow>(
        r#"select item_hash, owner, type, ref, amends, channel, content,
                  creation_datetime, latest_amend
           from posts where item_hash = $1"#,
    )
    .bind(item_hash)
    .fetch_optional(conn)
    .await
}

pub async fn delete_post(conn: &mut PgConnection, item_hash: &str) -> sqlx::Result<()> {
    sqlx::query("delete from posts where item_hash = $1")
        .bind(item_hash)
        .execute(conn)
        .await?;
    Ok(())
}

/// Non-amend posts matching the filters, newest first. Amends are reached
/// through `latest_amend` rather than listed on their own.
pub async fn get_posts(
    conn: &mut PgConnection,
    owners: Option<&[String]>,
    post_types: Option<&[String]>,
    channels: Option<&[String]>,
    limit: i64,
    offset: i64,
) -> sqlx::Result<Vec<PostRow>> {
    sqlx::query_as::<_, PostRow>(
        r#"select item_hash, owner, type, ref, amends, channel, content,
                  creation_datetime, latest_amend
           from posts
           where amends is null
             and ($1::text[] is null or owner = any($1))
             and ($2::text[] is null or type = any($2))
             and ($3::text[] is null or channel = any($3))
           order by creation_datetime desc, item_hash desc
           limit $4 offset $5"#,
    )
    .bind(owners)
    .bind(post_types)
    .bind(channels)
    .bind(limit)
    .bind(offset)
    .fetch_all(conn)
    .await
}

/// Recomputes the `latest_amend` pointer of an original post from its
/// remaining amends. Called after inserting or forgetting an amend, which
/// keeps the pointer correct under out-of-order arrival.
pub async fn refresh_latest_amend(conn: &mut PgConnection, item_hash: &str) -> sqlx::Result<()> {
    sqlx::query(
        r#"update posts
           set latest_amend = (
               select a.item_hash from posts a
               where a.amends = posts.item_hash
               order by a.creation_datetime desc, a.item_hash desc
               limit 1
           )
           where item_hash = $1"#,
    )
    .bind(item_hash)
    .execute(conn)
    .await?;
    Ok(())
}
