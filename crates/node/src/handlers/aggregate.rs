//! AGGREGATE messages: per-`(key, owner)` merged JSON documents.

use async_trait::async_trait;
use sqlx::PgConnection;

use models::merge::{merge_aggregate_elements, merge_json_objects};
use models::message::MessageContent;
use node_sql::aggregates::{AggregateElementRow, AggregateRow};
use node_sql::Json;

use crate::error::MessageProcessingError;

use super::{ContentHandler, ValidatedMessage};

pub struct AggregateHandler;

fn aggregate_content(
    message: &ValidatedMessage,
) -> Result<&models::AggregateContent, MessageProcessingError> {
    match &message.content {
        MessageContent::Aggregate(content) => Ok(content),
        _ => Err(MessageProcessingError::InvalidFormat(format!(
            "unexpected content type for aggregate message: {}",
            message.row.item_hash
        ))),
    }
}

/// Rebuilds the projection of a `(key, owner)` pair from its remaining
/// elements. Deletes the projection when no element is left.
pub async fn refresh_aggregate(
    conn: &mut PgConnection,
    key: &str,
    owner: &str,
) -> Result<(), MessageProcessingError> {
    let elements = node_sql::aggregates::get_aggregate_elements(conn, key, owner).await?;
    let Some(last) = elements.last() else {
        node_sql::aggregates::delete_aggregate(conn, key, owner).await?;
        return Ok(());
    };

    let contents: Vec<_> = elements
        .iter()
        .filter_map(|element| element.content.0.as_object())
        .collect();
    let merged = merge_aggregate_elements(contents.iter().copied());

    node_sql::aggregates::upsert_aggregate(
        conn,
        &AggregateRow {
            key: key.to_string(),
            owner: owner.to_string(),
            content: Json(serde_json::Value::Object(merged)),
            creation_datetime: last.creation_datetime,
            last_revision_hash: last.item_hash.clone(),
            dirty: false,
        },
    )
    .await?;
    Ok(())
}

#[async_trait]
impl ContentHandler for AggregateHandler {
    async fn process(
        &self,
        conn: &mut PgConnection,
        message: &ValidatedMessage,
    ) -> Result<(), MessageProcessingError> {
        let content = aggregate_content(message)?;
        let owner = content.address.clone();
        let key = content.key.clone();

        let element = AggregateElementRow {
            item_hash: message.row.item_hash.clone(),
            key: key.clone(),
            owner: owner.clone(),
            content: Json(serde_json::Value::Object(content.content.clone())),
            creation_datetime: message.row.time,
        };
        node_sql::aggregates::insert_aggregate_element(conn, &element).await?;

        // Take the row lock before reading the projection; a concurrent
        // element for the same pair would otherwise race the merge.
        let existing = node_sql::aggregates::lock_aggregate(conn, &key, &owner).await?;

        let updated = match existing {
            None => AggregateRow {
                key,
                owner,
                content: element.content.clone(),
                creation_datetime: element.creation_datetime,
                last_revision_hash: element.item_hash.clone(),
                dirty: false,
            },
            Some(current) if element.creation_datetime >= current.creation_datetime => {
                // In-order element: merge on top of the current projection.
                let mut merged = current.content.0.as_object().cloned().unwrap_or_default();
                merge_json_objects(&mut merged, &content.content);
                AggregateRow {
                    content: Json(serde_json::Value::Object(merged)),
                    creation_datetime: element.creation_datetime,
                    last_revision_hash: element.item_hash.clone(),
                    dirty: false,
                    ..current
                }
            }
            Some(_) => {
                // Out-of-order element: the merge order changed, rebuild
                // from history.
                refresh_aggregate(conn, &key, &owner).await?;
                return Ok(());
            }
        };

        node_sql::aggregates::upsert_aggregate(conn, &updated).await?;
        Ok(())
    }

    async fn forget_message(
        &self,
        conn: &mut PgConnection,
        message: &ValidatedMessage,
    ) -> Result<(), MessageProcessingError> {
        let content = aggregate_content(message)?;
        node_sql::aggregates::delete_aggregate_element(conn, &message.row.item_hash).await?;
        node_sql::aggregates::mark_aggregate_dirty(conn, &content.key, &content.address).await?;
        refresh_aggregate(conn, &content.key, &content.address).await?;
        Ok(())
    }
}
