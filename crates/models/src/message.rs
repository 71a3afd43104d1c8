//! The raw message wire format and its admission checks.
//!
//! Raw messages arrive as JSON dicts from the HTTP boundary or are
//! materialized from on-chain transactions. Admission validates the
//! envelope only; the content of non-inline messages is fetched and
//! validated later by the pipeline.

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::content::{AggregateContent, ForgetContent, PostContent, StoreContent};
use crate::execution::{InstanceContent, ProgramContent};
use crate::item_hash::{item_type_from_hash, sha256_hex};
use crate::{Chain, ItemType, MessageType};

/// Maximum size of inline item content, in bytes.
pub const MAX_INLINE_SIZE: usize = 200_000;

/// Messages dated earlier than this much before reception are rejected.
pub fn max_message_age() -> Duration {
    Duration::hours(24)
}

/// Tolerated clock drift for future-dated messages.
pub fn max_message_drift() -> Duration {
    Duration::minutes(5)
}

/// A message as serialized on the wire, before any validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawMessage {
    pub chain: Chain,
    pub item_hash: String,
    pub sender: String,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_type: Option<ItemType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_content: Option<String>,
    /// May be absent for messages materialized from on-chain events, which
    /// are trusted through the chain itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<Value>,
    /// Unix timestamp, seconds.
    pub time: f64,
}

/// An admitted message: envelope checks passed, the item type is resolved,
/// and inline content has been decoded.
#[derive(Debug, Clone)]
pub struct ParsedMessage {
    pub chain: Chain,
    pub item_hash: String,
    pub sender: String,
    pub message_type: MessageType,
    pub channel: Option<String>,
    pub item_type: ItemType,
    pub item_content: Option<String>,
    pub signature: Option<String>,
    pub time: DateTime<Utc>,
    /// Decoded content, set for inline items only at this stage.
    pub content: Option<Value>,
}

#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    #[error("unexpected hash type: '{0}'")]
    UnknownHashFormat(String),
    #[error("item content not specified for inline item type")]
    MissingInlineContent,
    #[error("{0} messages cannot define item_content")]
    UnexpectedInlineContent(ItemType),
    #[error("message too long: {0} bytes")]
    ContentTooLarge(usize),
    #[error("unsupported character in message: \\u0000")]
    NullCharacter,
    #[error("message content is not valid JSON data: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("item hash does not match content: expected {expected}, computed {computed}")]
    HashMismatch { expected: String, computed: String },
    #[error("invalid message time")]
    InvalidTime,
    #[error("time in past: {0}")]
    TimeInPast(DateTime<Utc>),
    #[error("time in future: {0}")]
    TimeInFuture(DateTime<Utc>),
    #[error("invalid message content: {0}")]
    InvalidContent(String),
}

/// Converts a float Unix timestamp to UTC with microsecond resolution.
pub fn timestamp_to_datetime(timestamp: f64) -> Option<DateTime<Utc>> {
    if !timestamp.is_finite() {
        return None;
    }
    let micros = (timestamp * 1_000_000.0).round();
    if micros < i64::MIN as f64 || micros > i64::MAX as f64 {
        return None;
    }
    Utc.timestamp_micros(micros as i64).single()
}

fn contains_null_character(item_content: &str) -> bool {
    item_content.contains('\u{0}') || item_content.contains("\\u0000")
}

/// Validates a raw message envelope and resolves its item type.
///
/// `now` is the reception time, against which the declared message time is
/// bounded to `[now - 24h, now + 5min]`.
pub fn parse_raw_message(
    raw: RawMessage,
    now: DateTime<Utc>,
) -> Result<ParsedMessage, AdmissionError> {
    parse_message_inner(raw, Some(now))
}

/// Parses a message materialized from an on-chain event. The chain anchors
/// these messages in time, so the reception window does not apply: history
/// must stay replayable years later.
pub fn parse_chain_message(raw: RawMessage) -> Result<ParsedMessage, AdmissionError> {
    parse_message_inner(raw, None)
}

fn parse_message_inner(
    raw: RawMessage,
    now: Option<DateTime<Utc>>,
) -> Result<ParsedMessage, AdmissionError> {
    let time = timestamp_to_datetime(raw.time).ok_or(AdmissionError::InvalidTime)?;
    if let Some(now) = now {
        if time < now - max_message_age() {
            return Err(AdmissionError::TimeInPast(time));
        }
        if time > now + max_message_drift() {
            return Err(AdmissionError::TimeInFuture(time));
        }
    }

    let default_item_type = if raw.item_content.is_some() {
        ItemType::Inline
    } else {
        item_type_from_hash(&raw.item_hash)
            .map_err(|_| AdmissionError::UnknownHashFormat(raw.item_hash.clone()))?
    };
    let item_type = raw.item_type.unwrap_or(default_item_type);

    let content = match item_type {
        ItemType::Inline => {
            let item_content = raw
                .item_content
                .as_deref()
                .ok_or(AdmissionError::MissingInlineContent)?;
            if item_content.len() > MAX_INLINE_SIZE {
                return Err(AdmissionError::ContentTooLarge(item_content.len()));
            }
            if contains_null_character(item_content) {
                return Err(AdmissionError::NullCharacter);
            }
            let computed = sha256_hex(item_content.as_bytes());
            if computed != raw.item_hash {
                return Err(AdmissionError::HashMismatch {
                    expected: raw.item_hash,
                    computed,
                });
            }
            Some(serde_json::from_str::<Value>(item_content)?)
        }
        ItemType::Storage | ItemType::Ipfs => {
            if raw.item_content.is_some() {
                return Err(AdmissionError::UnexpectedInlineContent(item_type));
            }
            None
        }
    };

    // Signatures come in as strings or as chain-specific JSON objects; we
    // keep the raw string form and let the per-chain verifier decode it.
    let signature = raw.signature.map(|sig| match sig {
        Value::String(s) => s,
        other => other.to_string(),
    });

    Ok(ParsedMessage {
        chain: raw.chain,
        item_hash: raw.item_hash,
        sender: raw.sender,
        message_type: raw.message_type,
        channel: raw.channel,
        item_type,
        item_content: raw.item_content,
        signature,
        time,
        content,
    })
}

/// Decoded, type-checked message content.
#[derive(Debug, Clone)]
pub enum MessageContent {
    Aggregate(AggregateContent),
    Post(PostContent),
    Store(StoreContent),
    Forget(ForgetContent),
    Instance(InstanceContent),
    Program(ProgramContent),
}

impl MessageContent {
    /// Validates a decoded content dict against the schema of the message
    /// type. `sender` and `time` fill in the `address`/`time` fields when
    /// the content omits them.
    pub fn parse(
        message_type: MessageType,
        content: &Value,
        sender: &str,
        time: DateTime<Utc>,
    ) -> Result<Self, AdmissionError> {
        let mut content = content.clone();
        if let Some(object) = content.as_object_mut() {
            object
                .entry("address")
                .or_insert_with(|| Value::String(sender.to_string()));
            if !object.contains_key("time") {
                let seconds = time.timestamp() as f64
                    + f64::from(time.timestamp_subsec_micros()) / 1_000_000.0;
                object.insert("time".to_string(), seconds.into());
            }
        } else {
            return Err(AdmissionError::InvalidContent(
                "content is not an object".to_string(),
            ));
        }

        let parsed = match message_type {
            MessageType::Aggregate => Self::Aggregate(serde_json::from_value(content)?),
            MessageType::Post => Self::Post(serde_json::from_value(content)?),
            MessageType::Store => Self::Store(serde_json::from_value(content)?),
            MessageType::Forget => Self::Forget(serde_json::from_value(content)?),
            MessageType::Instance => Self::Instance(serde_json::from_value(content)?),
            MessageType::Program => Self::Program(serde_json::from_value(content)?),
        };

        if timestamp_to_datetime(parsed.time()).is_none() {
            return Err(AdmissionError::InvalidTime);
        }
        Ok(parsed)
    }

    /// Address owning the content. Permission checks compare it to the
    /// message sender.
    pub fn address(&self) -> &str {
        match self {
            Self::Aggregate(c) => &c.address,
            Self::Post(c) => &c.address,
            Self::Store(c) => &c.address,
            Self::Forget(c) => &c.address,
            Self::Instance(c) => &c.address,
            Self::Program(c) => &c.address,
        }
    }

    pub fn time(&self) -> f64 {
        match self {
            Self::Aggregate(c) => c.time,
            Self::Post(c) => c.time,
            Self::Store(c) => c.time,
            Self::Forget(c) => c.time,
            Self::Instance(c) => c.time,
            Self::Program(c) => c.time,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn raw_inline(item_content: &str, time: f64) -> RawMessage {
        RawMessage {
            chain: Chain::Ethereum,
            item_hash: sha256_hex(item_content.as_bytes()),
            sender: "0xdeadbeef".to_string(),
            message_type: MessageType::Post,
            channel: Some("TEST".to_string()),
            item_type: None,
            item_content: Some(item_content.to_string()),
            signature: Some(Value::String("0xsig".to_string())),
            time,
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn admits_a_valid_inline_message() {
        let raw = raw_inline(r#"{"body": 1}"#, now().timestamp() as f64);
        let parsed = parse_raw_message(raw, now()).unwrap();
        assert_eq!(parsed.item_type, ItemType::Inline);
        assert_eq!(parsed.content.unwrap()["body"], 1);
    }

    #[test]
    fn infers_item_type_from_hash() {
        let mut raw = raw_inline("{}", now().timestamp() as f64);
        raw.item_content = None;
        raw.item_hash = "a".repeat(64);
        let parsed = parse_raw_message(raw, now()).unwrap();
        assert_eq!(parsed.item_type, ItemType::Storage);
        assert!(parsed.content.is_none());
    }

    #[test]
    fn rejects_inline_hash_mismatch() {
        let mut raw = raw_inline(r#"{"body": 1}"#, now().timestamp() as f64);
        raw.item_hash = "b".repeat(64);
        assert!(matches!(
            parse_raw_message(raw, now()),
            Err(AdmissionError::HashMismatch { .. })
        ));
    }

    #[test]
    fn enforces_the_time_window() {
        let now = now();

        let too_old = now - max_message_age() - Duration::seconds(1);
        let raw = raw_inline("{}", too_old.timestamp() as f64);
        assert!(matches!(
            parse_raw_message(raw, now),
            Err(AdmissionError::TimeInPast(_))
        ));

        let too_recent = now + max_message_drift() + Duration::seconds(1);
        let raw = raw_inline("{}", too_recent.timestamp() as f64);
        assert!(matches!(
            parse_raw_message(raw, now),
            Err(AdmissionError::TimeInFuture(_))
        ));

        // Exactly on both bounds is accepted.
        let raw = raw_inline("{}", (now - max_message_age()).timestamp() as f64);
        assert!(parse_raw_message(raw, now).is_ok());
    }

    #[test]
    fn enforces_the_inline_size_cap() {
        let at_cap = format!(r#"{{"pad": "{}"}}"#, "x".repeat(MAX_INLINE_SIZE - 11));
        assert_eq!(at_cap.len(), MAX_INLINE_SIZE);
        let raw = raw_inline(&at_cap, now().timestamp() as f64);
        assert!(parse_raw_message(raw, now()).is_ok());

        let over_cap = format!(r#"{{"pad": "{}"}}"#, "x".repeat(MAX_INLINE_SIZE - 10));
        let raw = raw_inline(&over_cap, now().timestamp() as f64);
        assert!(matches!(
            parse_raw_message(raw, now()),
            Err(AdmissionError::ContentTooLarge(_))
        ));
    }

    #[test]
    fn rejects_null_characters() {
        let raw = raw_inline(r#"{"pad": "\u0000"}"#, now().timestamp() as f64);
        assert!(matches!(
            parse_raw_message(raw, now()),
            Err(AdmissionError::NullCharacter)
        ));
    }

    #[test]
    fn content_coerces_missing_address_and_time() {
        let content = serde_json::json!({"type": "blog", "content": {"title": "hi"}});
        let parsed =
            MessageContent::parse(MessageType::Post, &content, "0xabc", now()).unwrap();
        assert_eq!(parsed.address(), "0xabc");
        assert_eq!(parsed.time(), now().timestamp() as f64);
    }
}
