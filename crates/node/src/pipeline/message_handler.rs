//! Admission, fetching and processing of individual messages.
//!
//! All state changes of one message happen inside the caller's
//! transaction: the message row, its status, pins, projections and the
//! pending-row cleanup commit or roll back together.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgConnection;

use models::message::{
    parse_chain_message, parse_raw_message, MessageContent, ParsedMessage, RawMessage,
};
use models::{ErrorCode, FileType, ItemType, MessageStatus};
use node_sql::messages::MessageRow;
use node_sql::pending_messages::{NewPendingMessage, PendingMessageRow};
use node_sql::Json;

use crate::chains::{SignatureVerifier, SignedMessage};
use crate::error::MessageProcessingError;
use crate::handlers::{ContentHandlers, ValidatedMessage};
use crate::pipeline::backoff_delay;
use crate::storage::{StorageError, StorageService};

/// Outcome of one processing attempt, as published on the result topic.
#[derive(Debug, Clone)]
pub enum ProcessingResult {
    Processed { item_hash: String, sender: String },
    Rejected { item_hash: String, sender: String },
    WillRetry { item_hash: String, sender: String },
}

impl ProcessingResult {
    pub fn status_key(&self) -> &'static str {
        match self {
            ProcessingResult::Processed { .. } => "processed",
            ProcessingResult::Rejected { .. } => "rejected",
            ProcessingResult::WillRetry { .. } => "will-retry",
        }
    }

    pub fn item_hash(&self) -> &str {
        match self {
            ProcessingResult::Processed { item_hash, .. }
            | ProcessingResult::Rejected { item_hash, .. }
            | ProcessingResult::WillRetry { item_hash, .. } => item_hash,
        }
    }

    pub fn sender(&self) -> &str {
        match self {
            ProcessingResult::Processed { sender, .. }
            | ProcessingResult::Rejected { sender, .. }
            | ProcessingResult::WillRetry { sender, .. } => sender,
        }
    }
}

/// A message accepted into the pipeline. Rows admitted with their content
/// already resolved skip the fetch stage and go straight to processing.
#[derive(Debug, Clone)]
pub struct AdmittedMessage {
    pub id: i64,
    pub item_hash: String,
    pub sender: String,
    pub fetched: bool,
}

/// Converts an already-parsed chain message into a pending row. Chain
/// messages skip signature checks; the transaction they rode in vouches
/// for them.
pub fn pending_message_from_raw(
    raw: RawMessage,
    reception_time: DateTime<Utc>,
    tx_hash: Option<String>,
    check_message: bool,
) -> Result<NewPendingMessage, models::message::AdmissionError> {
    let parsed = parse_chain_message(raw)?;
    Ok(new_pending_message(
        parsed,
        reception_time,
        tx_hash,
        check_message,
        false,
    ))
}

fn new_pending_message(
    parsed: ParsedMessage,
    reception_time: DateTime<Utc>,
    tx_hash: Option<String>,
    check_message: bool,
    fetched: bool,
) -> NewPendingMessage {
    NewPendingMessage {
        item_hash: parsed.item_hash,
        message_type: parsed.message_type,
        chain: parsed.chain,
        sender: parsed.sender,
        signature: parsed.signature,
        item_type: parsed.item_type,
        item_content: parsed.item_content,
        content: parsed.content,
        time: parsed.time,
        channel: parsed.channel,
        reception_time,
        check_message,
        tx_hash,
        fetched,
    }
}

fn pending_message_dict(pending: &PendingMessageRow) -> Value {
    serde_json::json!({
        "chain": pending.chain,
        "item_hash": pending.item_hash,
        "sender": pending.sender,
        "type": pending.message_type,
        "channel": pending.channel,
        "item_type": pending.item_type,
        "item_content": pending.item_content,
        "signature": pending.signature,
        "time": pending.time.timestamp() as f64
            + f64::from(pending.time.timestamp_subsec_micros()) / 1_000_000.0,
    })
}

pub struct MessageHandler {
    verifier: Arc<SignatureVerifier>,
    storage: Arc<StorageService>,
    handlers: ContentHandlers,
    max_retries: i32,
}

impl MessageHandler {
    pub fn new(
        verifier: Arc<SignatureVerifier>,
        storage: Arc<StorageService>,
        handlers: ContentHandlers,
        max_retries: i32,
    ) -> Self {
        MessageHandler {
            verifier,
            storage,
            handlers,
            max_retries,
        }
    }

    /// Admits a raw message dict into the pipeline: schema validation,
    /// inline-content preloading, and the PENDING status plus pending row
    /// in one transaction. Returns `None` when the message was rejected at
    /// the door.
    #[tracing::instrument(skip_all, fields(tx_hash = ?tx_hash))]
    pub async fn add_pending_message(
        &self,
        conn: &mut PgConnection,
        message_dict: &Value,
        reception_time: DateTime<Utc>,
        tx_hash: Option<String>,
        check_message: bool,
    ) -> Result<Option<AdmittedMessage>, MessageProcessingError> {
        let raw: RawMessage = match serde_json::from_value(message_dict.clone()) {
            Ok(raw) => raw,
            Err(err) => {
                tracing::warn!(%err, "undecodable message dict");
                // Without an item hash there is nothing to key a status
                // or rejection on.
                if let Some(item_hash) =
                    message_dict.get("item_hash").and_then(Value::as_str)
                {
                    self.reject_new_message(
                        conn,
                        item_hash,
                        message_dict,
                        ErrorCode::InvalidFormat,
                        &err.to_string(),
                    )
                    .await?;
                }
                return Ok(None);
            }
        };

        let parsed = if check_message {
            parse_raw_message(raw, reception_time)
        } else {
            parse_chain_message(raw)
        };
        let parsed = match parsed {
            Ok(parsed) => parsed,
            Err(err) => {
                tracing::warn!(%err, "invalid message");
                if let Some(item_hash) =
                    message_dict.get("item_hash").and_then(Value::as_str)
                {
                    self.reject_new_message(
                        conn,
                        item_hash,
                        message_dict,
                        ErrorCode::InvalidFormat,
                        &err.to_string(),
                    )
                    .await?;
                }
                return Ok(None);
            }
        };

        // Inline content is already here: when the type handler confirms
        // its related content is local too, the fetch stage can be
        // skipped entirely.
        let mut fetched = false;
        if let Some(content) = &parsed.content {
            match MessageContent::parse(parsed.message_type, content, &parsed.sender, parsed.time)
            {
                Ok(message_content) => {
                    let probe = ValidatedMessage {
                        row: message_row_from_parsed(&parsed),
                        content: message_content,
                    };
                    let handler = self.handlers.get(parsed.message_type);
                    fetched = handler
                        .is_related_content_fetched(conn, &probe)
                        .await
                        .unwrap_or(false);
                }
                Err(err) => {
                    tracing::warn!(%err, item_hash = %parsed.item_hash, "invalid message content");
                    self.reject_new_message(
                        conn,
                        &parsed.item_hash,
                        message_dict,
                        ErrorCode::InvalidFormat,
                        &err.to_string(),
                    )
                    .await?;
                    return Ok(None);
                }
            }
        }

        let item_hash = parsed.item_hash.clone();
        let sender = parsed.sender.clone();
        // A fresh submission may resurrect a previously rejected or
        // forgotten message; its tombstone row stays around either way.
        node_sql::messages::delete_rejected_message(conn, &item_hash).await?;
        node_sql::messages::upsert_message_status(
            conn,
            &item_hash,
            MessageStatus::Pending,
            reception_time,
            &[MessageStatus::Rejected, MessageStatus::Forgotten],
        )
        .await?;

        let pending = new_pending_message(parsed, reception_time, tx_hash, check_message, fetched);
        let id = node_sql::pending_messages::insert_pending_message(conn, &pending).await?;
        Ok(Some(AdmittedMessage {
            id,
            item_hash,
            sender,
            fetched,
        }))
    }

    async fn reject_new_message(
        &self,
        conn: &mut PgConnection,
        item_hash: &str,
        message_dict: &Value,
        error_code: ErrorCode,
        details: &str,
    ) -> Result<(), MessageProcessingError> {
        node_sql::messages::upsert_rejected_message(
            conn,
            item_hash,
            message_dict,
            error_code,
            Some(&Value::String(details.to_string())),
            None,
        )
        .await?;
        node_sql::messages::upsert_message_status(
            conn,
            item_hash,
            MessageStatus::Rejected,
            Utc::now(),
            &[MessageStatus::Pending],
        )
        .await?;
        Ok(())
    }

    pub async fn verify_signature(
        &self,
        pending: &PendingMessageRow,
    ) -> Result<(), MessageProcessingError> {
        if !pending.check_message {
            return Ok(());
        }
        let signature = pending.signature.as_deref().ok_or_else(|| {
            MessageProcessingError::InvalidSignature(format!(
                "missing signature for {}",
                pending.item_hash
            ))
        })?;
        let message = SignedMessage {
            chain: pending.chain,
            sender: &pending.sender,
            message_type: pending.message_type,
            item_hash: &pending.item_hash,
            signature,
        };
        self.verifier.verify(&message).await
    }

    /// Verifies the signature and resolves the message content, returning
    /// the fully validated message.
    pub async fn verify_and_fetch(
        &self,
        conn: &mut PgConnection,
        pending: &PendingMessageRow,
    ) -> Result<ValidatedMessage, MessageProcessingError> {
        self.verify_signature(pending).await?;
        let validated = self.fetch_pending_message(pending).await?;
        let handler = self.handlers.get(validated.row.message_type);
        handler.fetch_related_content(conn, &validated).await?;
        Ok(validated)
    }

    /// Resolves and type-checks the content of a pending message.
    pub async fn fetch_pending_message(
        &self,
        pending: &PendingMessageRow,
    ) -> Result<ValidatedMessage, MessageProcessingError> {
        let (content_value, content_size) = match &pending.content {
            Some(Json(value)) => {
                let size = serde_json::to_vec(value).map(|raw| raw.len()).unwrap_or(0);
                (value.clone(), size)
            }
            None => {
                let content = self
                    .storage
                    .get_message_content(
                        pending.item_type,
                        &pending.item_hash,
                        pending.item_content.as_deref(),
                    )
                    .await
                    .map_err(|err| match err {
                        StorageError::InvalidContent(details) => {
                            MessageProcessingError::InvalidFormat(format!(
                                "invalid message content for {}: {details}",
                                pending.item_hash
                            ))
                        }
                        other => MessageProcessingError::ContentUnavailable(format!(
                            "could not fetch content for {}: {other}",
                            pending.item_hash
                        )),
                    })?;
                (content.value, content.raw_size)
            }
        };

        let message_content = MessageContent::parse(
            pending.message_type,
            &content_value,
            &pending.sender,
            pending.time,
        )
        .map_err(|err| MessageProcessingError::InvalidFormat(err.to_string()))?;

        let row = MessageRow {
            item_hash: pending.item_hash.clone(),
            message_type: pending.message_type,
            chain: pending.chain,
            sender: pending.sender.clone(),
            signature: pending.signature.clone(),
            item_type: pending.item_type,
            item_content: pending.item_content.clone(),
            content: Json(content_value),
            time: pending.time,
            channel: pending.channel.clone(),
            size: content_size as i64,
        };

        Ok(ValidatedMessage {
            row,
            content: message_content,
        })
    }

    async fn confirm_existing_message(
        &self,
        conn: &mut PgConnection,
        existing: &MessageRow,
        pending: &PendingMessageRow,
    ) -> Result<(), MessageProcessingError> {
        // The same item hash signed differently is an attack, not a
        // confirmation.
        if pending.signature != existing.signature {
            return Err(MessageProcessingError::InvalidSignature(format!(
                "invalid signature for {}",
                pending.item_hash
            )));
        }

        node_sql::pending_messages::delete_pending_message(conn, pending.id).await?;
        if let Some(tx_hash) = &pending.tx_hash {
            node_sql::messages::upsert_message_confirmation(conn, &pending.item_hash, tx_hash)
                .await?;
        }
        Ok(())
    }

    async fn insert_message(
        &self,
        conn: &mut PgConnection,
        pending: &PendingMessageRow,
        message: &MessageRow,
    ) -> Result<(), MessageProcessingError> {
        node_sql::messages::upsert_message(conn, message).await?;

        // The body of a non-inline message is itself a stored file, pinned
        // for as long as the message lives.
        if message.item_type != ItemType::Inline {
            node_sql::files::upsert_stored_file(
                conn,
                &message.item_hash,
                message.size,
                FileType::File,
            )
            .await?;
            node_sql::files::insert_content_file_pin(
                conn,
                &message.item_hash,
                &message.sender,
                &message.item_hash,
                message.time,
            )
            .await?;
        }

        node_sql::pending_messages::delete_pending_message(conn, pending.id).await?;
        node_sql::messages::upsert_message_status(
            conn,
            &message.item_hash,
            MessageStatus::Processed,
            pending.reception_time,
            &[MessageStatus::Pending],
        )
        .await?;

        if let Some(tx_hash) = &pending.tx_hash {
            node_sql::messages::upsert_message_confirmation(conn, &message.item_hash, tx_hash)
                .await?;
        }
        Ok(())
    }

    /// Processes one pending message to completion inside the caller's
    /// transaction. Replays of an already processed message become
    /// confirmations.
    #[tracing::instrument(skip_all, fields(item_hash = %pending.item_hash))]
    pub async fn process(
        &self,
        conn: &mut PgConnection,
        pending: &PendingMessageRow,
    ) -> Result<ProcessingResult, MessageProcessingError> {
        if let Some(existing) = node_sql::messages::get_message(conn, &pending.item_hash).await? {
            self.confirm_existing_message(conn, &existing, pending).await?;
            return Ok(ProcessingResult::Processed {
                item_hash: existing.item_hash,
                sender: existing.sender,
            });
        }

        let validated = self.verify_and_fetch(conn, pending).await?;
        let handler = self.handlers.get(validated.row.message_type);
        handler.check_dependencies(conn, &validated).await?;
        handler.check_permissions(conn, &validated).await?;
        self.insert_message(conn, pending, &validated.row).await?;
        handler.process(conn, &validated).await?;

        Ok(ProcessingResult::Processed {
            item_hash: validated.row.item_hash,
            sender: validated.row.sender,
        })
    }

    /// Applies the retry policy after a failed attempt. The caller already
    /// rolled back the processing transaction; this runs in a fresh one.
    pub async fn handle_processing_error(
        &self,
        conn: &mut PgConnection,
        pending: &PendingMessageRow,
        error: MessageProcessingError,
    ) -> Result<ProcessingResult, MessageProcessingError> {
        if error.is_retryable() && pending.retries < self.max_retries {
            let next_attempt = Utc::now() + backoff_delay(pending.retries);
            tracing::warn!(
                item_hash = %pending.item_hash,
                retries = pending.retries,
                %error,
                "transient error, rescheduling"
            );
            node_sql::pending_messages::reschedule_pending_message(
                conn,
                pending.id,
                pending.retries + 1,
                next_attempt,
            )
            .await?;
            return Ok(ProcessingResult::WillRetry {
                item_hash: pending.item_hash.clone(),
                sender: pending.sender.clone(),
            });
        }

        tracing::warn!(item_hash = %pending.item_hash, %error, "rejecting message");
        node_sql::messages::upsert_rejected_message(
            conn,
            &pending.item_hash,
            &pending_message_dict(pending),
            error.error_code(),
            Some(&Value::String(error.to_string())),
            error.traceback().as_deref(),
        )
        .await?;
        node_sql::messages::upsert_message_status(
            conn,
            &pending.item_hash,
            MessageStatus::Rejected,
            pending.reception_time,
            &[MessageStatus::Pending],
        )
        .await?;
        node_sql::pending_messages::delete_pending_messages_by_item_hash(
            conn,
            &pending.item_hash,
        )
        .await?;

        Ok(ProcessingResult::Rejected {
            item_hash: pending.item_hash.clone(),
            sender: pending.sender.clone(),
        })
    }
}

fn message_row_from_parsed(parsed: &ParsedMessage) -> MessageRow {
    MessageRow {
        item_hash: parsed.item_hash.clone(),
        message_type: parsed.message_type,
        chain: parsed.chain,
        sender: parsed.sender.clone(),
        signature: parsed.signature.clone(),
        item_type: parsed.item_type,
        item_content: parsed.item_content.clone(),
        content: Json(parsed.content.clone().unwrap_or(Value::Null)),
        time: parsed.time,
        channel: parsed.channel.clone(),
        size: parsed
            .item_content
            .as_ref()
            .map(|content| content.len() as i64)
            .unwrap_or(0),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use models::Chain;
    use models::MessageType;

    #[test]
    fn chain_messages_skip_the_reception_window() {
        // A message dated years in the past is fine when it comes from a
        // chain transaction.
        let item_content = r#"{"type": "blog", "content": {}}"#;
        let raw = RawMessage {
            chain: Chain::Ethereum,
            item_hash: models::sha256_hex(item_content.as_bytes()),
            sender: "0xabc".to_string(),
            message_type: MessageType::Post,
            channel: None,
            item_type: None,
            item_content: Some(item_content.to_string()),
            signature: None,
            time: 1_500_000_000.0,
        };
        let pending =
            pending_message_from_raw(raw, Utc::now(), Some("0xtx".to_string()), false).unwrap();
        assert!(!pending.check_message);
        assert!(!pending.fetched);
        assert_eq!(pending.tx_hash.as_deref(), Some("0xtx"));
    }

    #[test]
    fn processing_results_expose_their_routing_status() {
        let result = ProcessingResult::WillRetry {
            item_hash: "abc".to_string(),
            sender: "0xdef".to_string(),
        };
        assert_eq!(result.status_key(), "will-retry");
        assert_eq!(result.item_hash(), "abc");
    }
}
