//! FORGET messages: remove previously processed messages from the live
//! projections, leaving a tombstone behind.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::PgConnection;

use models::message::MessageContent;
use models::{ErrorCode, MessageStatus, MessageType};

use crate::error::MessageProcessingError;

use super::{ContentHandler, ValidatedMessage};

pub struct ForgetHandler {
    handlers: HashMap<MessageType, Arc<dyn ContentHandler>>,
}

impl ForgetHandler {
    pub fn new(handlers: HashMap<MessageType, Arc<dyn ContentHandler>>) -> Self {
        ForgetHandler { handlers }
    }
}

fn forget_content(
    message: &ValidatedMessage,
) -> Result<&models::ForgetContent, MessageProcessingError> {
    match &message.content {
        MessageContent::Forget(content) => Ok(content),
        _ => Err(MessageProcessingError::InvalidFormat(format!(
            "unexpected content type for forget message: {}",
            message.row.item_hash
        ))),
    }
}

#[async_trait]
impl ContentHandler for ForgetHandler {
    async fn check_dependencies(
        &self,
        conn: &mut PgConnection,
        message: &ValidatedMessage,
    ) -> Result<(), MessageProcessingError> {
        let content = forget_content(message)?;

        if content.hashes.is_empty() && content.aggregates.is_empty() {
            return Err(MessageProcessingError::Dependency {
                code: ErrorCode::ForgetNoTarget,
                details: format!("forget message {} targets nothing", message.row.item_hash),
            });
        }

        for target_hash in &content.hashes {
            let status = node_sql::messages::get_message_status(conn, target_hash).await?;
            match status.map(|row| row.status) {
                Some(MessageStatus::Processed) => {}
                _ => {
                    return Err(MessageProcessingError::Dependency {
                        code: ErrorCode::ForgetTargetNotFound,
                        details: format!("forget target {target_hash} is not processed"),
                    });
                }
            }

            let target = node_sql::messages::get_message(conn, target_hash)
                .await?
                .ok_or_else(|| MessageProcessingError::Dependency {
                    code: ErrorCode::ForgetTargetNotFound,
                    details: format!("forget target {target_hash} not found"),
                })?;

            if target.sender != content.address {
                return Err(MessageProcessingError::Dependency {
                    code: ErrorCode::ForgetNotAllowed,
                    details: format!(
                        "{} cannot forget a message from {}",
                        content.address, target.sender
                    ),
                });
            }
        }
        Ok(())
    }

    async fn check_permissions(
        &self,
        conn: &mut PgConnection,
        message: &ValidatedMessage,
    ) -> Result<(), MessageProcessingError> {
        if message.content.address() != message.row.sender {
            return Err(MessageProcessingError::PermissionDenied(format!(
                "sender {} cannot forget on behalf of {}",
                message.row.sender,
                message.content.address()
            )));
        }

        let content = forget_content(message)?;
        for target_hash in &content.hashes {
            if let Some(target) = node_sql::messages::get_message(conn, target_hash).await? {
                // Forgetting a FORGET would resurrect its targets.
                if target.message_type == MessageType::Forget {
                    return Err(MessageProcessingError::Dependency {
                        code: ErrorCode::ForgetForget,
                        details: format!("cannot forget forget message {target_hash}"),
                    });
                }
            }
        }
        Ok(())
    }

    async fn process(
        &self,
        conn: &mut PgConnection,
        message: &ValidatedMessage,
    ) -> Result<(), MessageProcessingError> {
        let content = forget_content(message)?;
        let forgotten_by = &message.row.item_hash;

        for target_hash in &content.hashes {
            let Some(target_row) = node_sql::messages::get_message(conn, target_hash).await? else {
                // Already gone, e.g. forgotten twice in the same batch.
                continue;
            };

            let target = ValidatedMessage::from_row(target_row)?;
            let handler = self.handlers.get(&target.row.message_type).ok_or_else(|| {
                MessageProcessingError::InvalidFormat(format!(
                    "no handler for type {}",
                    target.row.message_type
                ))
            })?;
            handler.forget_message(conn, &target).await?;

            node_sql::messages::upsert_forgotten_message(conn, &target.row, forgotten_by).await?;
            node_sql::messages::upsert_message_status(
                conn,
                target_hash,
                MessageStatus::Forgotten,
                message.row.time,
                &[MessageStatus::Processed],
            )
            .await?;
            node_sql::messages::delete_message_confirmations(conn, target_hash).await?;
            node_sql::costs::delete_costs_by_item_hash(conn, target_hash).await?;
            node_sql::files::delete_content_file_pin(conn, target_hash).await?;
            node_sql::messages::delete_message(conn, target_hash).await?;
        }

        // Whole-aggregate forgets: drop every element the sender wrote
        // under the listed keys and rebuild (to nothing, usually).
        for key in &content.aggregates {
            let elements =
                node_sql::aggregates::get_aggregate_elements(conn, key, &content.address).await?;
            for element in &elements {
                node_sql::aggregates::delete_aggregate_element(conn, &element.item_hash).await?;
            }
            super::aggregate::refresh_aggregate(conn, key, &content.address).await?;
        }

        Ok(())
    }

    async fn forget_message(
        &self,
        _conn: &mut PgConnection,
        message: &ValidatedMessage,
    ) -> Result<(), MessageProcessingError> {
        Err(MessageProcessingError::Dependency {
            code: ErrorCode::ForgetForget,
            details: format!("cannot forget forget message {}", message.row.item_hash),
        })
    }
}
