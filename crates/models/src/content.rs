//! Decoded `content` schemas of the non-executable message types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ItemType;

/// Content of an AGGREGATE message: one element to merge into the
/// `(key, owner)` projection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateContent {
    pub address: String,
    pub time: f64,
    pub key: String,
    pub content: serde_json::Map<String, Value>,
}

/// Content of a POST message. A post with `type == "amend"` points at the
/// post it amends through `ref`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostContent {
    pub address: String,
    pub time: f64,
    #[serde(rename = "type")]
    pub post_type: String,
    #[serde(rename = "ref", default, skip_serializing_if = "Option::is_none")]
    pub ref_: Option<String>,
    #[serde(default)]
    pub content: Option<Value>,
}

impl PostContent {
    pub fn is_amend(&self) -> bool {
        self.post_type == "amend"
    }
}

/// Content of a STORE message, pinning a file by hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreContent {
    pub address: String,
    pub time: f64,
    pub item_type: ItemType,
    pub item_hash: String,
    #[serde(rename = "ref", default, skip_serializing_if = "Option::is_none")]
    pub ref_: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// Content of a FORGET message, targeting previously processed messages
/// and/or whole aggregate keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForgetContent {
    pub address: String,
    pub time: f64,
    #[serde(default)]
    pub hashes: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aggregates: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_amend_post() {
        let content: PostContent = serde_json::from_value(serde_json::json!({
            "address": "0xabc",
            "time": 1700000000.5,
            "type": "amend",
            "ref": "deadbeef",
            "content": {"body": "edited"},
        }))
        .unwrap();
        assert!(content.is_amend());
        assert_eq!(content.ref_.as_deref(), Some("deadbeef"));
    }

    #[test]
    fn store_content_round_trips() {
        let json = serde_json::json!({
            "address": "0xabc",
            "time": 1700000000.0,
            "item_type": "ipfs",
            "item_hash": "QmPZ9gcCEpqKTo6aq61g2nXGUhM4iCL3ewB6LDXZCtioEB",
        });
        let content: StoreContent = serde_json::from_value(json.clone()).unwrap();
        assert_eq!(content.item_type, ItemType::Ipfs);
        assert_eq!(serde_json::to_value(&content).unwrap(), json);
    }

    #[test]
    fn forget_defaults_to_empty_targets() {
        let content: ForgetContent = serde_json::from_value(serde_json::json!({
            "address": "0xabc",
            "time": 1700000000.0,
            "hashes": ["cafebabe"],
        }))
        .unwrap();
        assert_eq!(content.hashes, vec!["cafebabe"]);
        assert!(content.aggregates.is_empty());
    }
}
