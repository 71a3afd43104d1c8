//! Decoding of the three on-chain sync protocols, and encoding of the
//! node's own outbound archives.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use sqlx::PgConnection;

use models::item_hash::sha256_hex;
use models::message::RawMessage;
use models::sync::{
    ChainSyncProtocol, OffChainSyncEventPayload, OnChainContent, OnChainSyncEventPayload,
    SmartContractMessageEvent, SYNC_PROTOCOL_VERSION,
};
use models::{FileType, ItemType, MessageType, StoreContent};
use node_sql::chains::ChainTxRow;
use node_sql::messages::MessageRow;

use crate::error::MessageProcessingError;
use crate::mq::{pending_tx_routing_key, Exchange};
use crate::storage::{FetchOptions, StorageService};

const OFF_CHAIN_FETCH_TIMEOUT: Duration = Duration::from_secs(60);
const OFF_CHAIN_PIN_TIMEOUT: Duration = Duration::from_secs(120);

pub struct ChainDataService {
    storage: Arc<StorageService>,
}

impl ChainDataService {
    pub fn new(storage: Arc<StorageService>) -> Self {
        ChainDataService { storage }
    }

    /// Extracts the message dicts a chain TX carries, dispatching on the
    /// sync protocol and version. `seen_ids` is shared across the
    /// concurrent TXs of one batch.
    pub async fn get_tx_messages(
        &self,
        conn: &mut PgConnection,
        tx: &ChainTxRow,
        seen_ids: &tokio::sync::Mutex<HashSet<String>>,
    ) -> Result<Vec<Value>, MessageProcessingError> {
        match (tx.protocol, tx.protocol_version) {
            (ChainSyncProtocol::OnChainSync, 1) => self.get_tx_messages_on_chain(tx),
            (ChainSyncProtocol::OffChainSync, 1) => {
                self.get_tx_messages_off_chain(conn, tx, seen_ids).await
            }
            (ChainSyncProtocol::SmartContract, 1) => self.get_tx_messages_smart_contract(tx),
            (protocol, version) => Err(MessageProcessingError::InvalidContent(format!(
                "unknown protocol/version in tx {}/{}: {} v{}",
                tx.chain, tx.hash, protocol, version
            ))),
        }
    }

    fn get_tx_messages_on_chain(&self, tx: &ChainTxRow) -> Result<Vec<Value>, MessageProcessingError> {
        let messages = tx
            .content
            .0
            .get("messages")
            .and_then(Value::as_array)
            .ok_or_else(|| {
                MessageProcessingError::InvalidContent(format!(
                    "got bad data in tx {}/{}",
                    tx.chain, tx.hash
                ))
            })?;
        Ok(messages.clone())
    }

    async fn get_tx_messages_off_chain(
        &self,
        conn: &mut PgConnection,
        tx: &ChainTxRow,
        seen_ids: &tokio::sync::Mutex<HashSet<String>>,
    ) -> Result<Vec<Value>, MessageProcessingError> {
        let file_hash = tx.content.0.as_str().ok_or_else(|| {
            MessageProcessingError::InvalidContent(format!(
                "off-chain tx {}/{} does not carry a CID",
                tx.chain, tx.hash
            ))
        })?;

        // Archives are frequently announced by several chains in the same
        // batch; only the first occurrence does the fetch.
        if !seen_ids.lock().await.insert(file_hash.to_string()) {
            tracing::debug!(%file_hash, "already seen in this batch");
            return Ok(Vec::new());
        }

        let (raw, _) = self
            .storage
            .get_hash_content(
                file_hash,
                ItemType::Ipfs,
                FetchOptions {
                    timeout: OFF_CHAIN_FETCH_TIMEOUT,
                    ..FetchOptions::default()
                },
            )
            .await
            .map_err(|err| {
                MessageProcessingError::ContentUnavailable(format!(
                    "can't get content of offchain object {file_hash}: {err}"
                ))
            })?;

        let payload: Value = serde_json::from_slice(&raw).map_err(|err| {
            MessageProcessingError::InvalidContent(format!(
                "undecodable offchain archive {file_hash}: {err}"
            ))
        })?;
        let messages = payload
            .get("content")
            .and_then(|content| content.get("messages"))
            .and_then(Value::as_array)
            .ok_or_else(|| {
                MessageProcessingError::InvalidContent(format!(
                    "offchain archive {file_hash} carries no messages"
                ))
            })?
            .clone();

        tracing::info!(count = messages.len(), %file_hash, "got bulk sync data");

        node_sql::files::upsert_stored_file(conn, file_hash, raw.len() as i64, FileType::File)
            .await?;
        node_sql::files::upsert_tx_file_pin(conn, file_hash, &tx.hash, chrono::Utc::now()).await?;

        // Archive pins keep history replayable; a pin failure is only an
        // availability concern, not a processing error.
        if self.storage.ipfs_enabled() {
            if let Err(err) = self.storage.pin_hash(file_hash, OFF_CHAIN_PIN_TIMEOUT).await {
                tracing::warn!(%file_hash, %err, "can't pin archive hash");
            }
        }

        Ok(messages)
    }

    fn get_tx_messages_smart_contract(
        &self,
        tx: &ChainTxRow,
    ) -> Result<Vec<Value>, MessageProcessingError> {
        let event: SmartContractMessageEvent = serde_json::from_value(tx.content.0.clone())
            .map_err(|_| {
                MessageProcessingError::InvalidContent(format!(
                    "incompatible tx content for {}/{}",
                    tx.chain, tx.hash
                ))
            })?;

        let (message_type, item_content) = if event.event_type == "STORE_IPFS" {
            let content = StoreContent {
                address: event.address.clone(),
                time: event.timestamp,
                item_type: ItemType::Ipfs,
                item_hash: event.content.clone(),
                ref_: None,
                metadata: None,
                mime_type: None,
            };
            (
                MessageType::Store,
                serde_json::to_string(&content).expect("store content serializes"),
            )
        } else {
            let message_type = event.event_type.parse::<MessageType>().map_err(|_| {
                MessageProcessingError::InvalidContent(format!(
                    "unsupported message type in tx {}/{}: {}",
                    tx.chain, tx.hash, event.event_type
                ))
            })?;
            (message_type, event.content.clone())
        };

        let message = RawMessage {
            chain: tx.chain,
            item_hash: sha256_hex(item_content.as_bytes()),
            sender: event.address,
            message_type,
            channel: None,
            item_type: Some(ItemType::Inline),
            item_content: Some(item_content),
            signature: None,
            time: tx.datetime.timestamp() as f64
                + f64::from(tx.datetime.timestamp_subsec_micros()) / 1_000_000.0,
        };

        Ok(vec![serde_json::to_value(message).expect("raw message serializes")])
    }

    /// Packs messages into an archive, pushes it to IPFS and returns the
    /// off-chain sync payload to publish on-chain. The archive file is
    /// only pinned in the database by the caller once the TX is emitted,
    /// so failed emissions do not leave unused archives pinned.
    pub async fn prepare_sync_event_payload(
        &self,
        conn: &mut PgConnection,
        messages: &[MessageRow],
    ) -> anyhow::Result<OffChainSyncEventPayload> {
        let archive = OnChainSyncEventPayload {
            protocol: ChainSyncProtocol::OnChainSync,
            version: SYNC_PROTOCOL_VERSION,
            content: OnChainContent {
                messages: messages.iter().map(raw_message_from_row).collect(),
            },
        };
        let archive_content = serde_json::to_vec(&archive)?;
        let ipfs_cid = self
            .storage
            .add_file(conn, &archive_content, ItemType::Ipfs)
            .await?;
        Ok(OffChainSyncEventPayload {
            protocol: ChainSyncProtocol::OffChainSync,
            version: SYNC_PROTOCOL_VERSION,
            content: ipfs_cid,
        })
    }
}

fn raw_message_from_row(row: &MessageRow) -> RawMessage {
    RawMessage {
        chain: row.chain,
        item_hash: row.item_hash.clone(),
        sender: row.sender.clone(),
        message_type: row.message_type,
        channel: row.channel.clone(),
        item_type: Some(row.item_type),
        item_content: row.item_content.clone(),
        signature: row.signature.clone().map(Value::String),
        time: row.time.timestamp() as f64
            + f64::from(row.time.timestamp_subsec_micros()) / 1_000_000.0,
    }
}

/// Persists observed chain TXs and announces them on the pending-TX topic.
pub struct PendingTxPublisher {
    exchange: Exchange,
}

impl PendingTxPublisher {
    pub fn new(exchange: Exchange) -> Self {
        PendingTxPublisher { exchange }
    }

    pub async fn add_pending_tx(
        conn: &mut PgConnection,
        tx: &ChainTxRow,
    ) -> sqlx::Result<()> {
        node_sql::chains::upsert_chain_tx(conn, tx).await?;
        node_sql::chains::upsert_pending_tx(conn, &tx.hash).await?;
        Ok(())
    }

    pub fn publish_pending_tx(&self, tx: &ChainTxRow) {
        let routing_key = pending_tx_routing_key(tx.chain.as_str(), &tx.publisher, &tx.hash);
        self.exchange.publish(&routing_key, tx.hash.clone().into_bytes());
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::storage::engine::MemoryStorageEngine;
    use chrono::TimeZone;
    use models::Chain;
    use node_sql::Json;

    fn service() -> ChainDataService {
        let engine = Arc::new(MemoryStorageEngine::new());
        ChainDataService::new(Arc::new(StorageService::new(engine, None, Vec::new())))
    }

    fn tx_with(protocol: ChainSyncProtocol, version: i32, content: Value) -> ChainTxRow {
        ChainTxRow {
            hash: "0xtx".to_string(),
            chain: Chain::Ethereum,
            height: 123,
            datetime: chrono::Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap(),
            publisher: "0xpublisher".to_string(),
            protocol,
            protocol_version: version,
            content: Json(content),
        }
    }

    #[test]
    fn decodes_on_chain_sync_payloads() {
        let tx = tx_with(
            ChainSyncProtocol::OnChainSync,
            1,
            serde_json::json!({"messages": [{"item_hash": "abc"}, {"item_hash": "def"}]}),
        );
        let messages = service().get_tx_messages_on_chain(&tx).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["item_hash"], "abc");
    }

    #[test]
    fn rejects_sync_payloads_without_a_message_array() {
        let tx = tx_with(
            ChainSyncProtocol::OnChainSync,
            1,
            serde_json::json!({"messages": "not-an-array"}),
        );
        let err = service().get_tx_messages_on_chain(&tx).unwrap_err();
        assert!(matches!(err, MessageProcessingError::InvalidContent(_)));
    }

    #[test]
    fn smart_contract_store_ipfs_events_become_store_messages() {
        let tx = tx_with(
            ChainSyncProtocol::SmartContract,
            1,
            serde_json::json!({
                "address": "0xemitter",
                "timestamp": 1700000000.0,
                "type": "STORE_IPFS",
                "content": "QmPZ9gcCEpqKTo6aq61g2nXGUhM4iCL3ewB6LDXZCtioEB",
            }),
        );
        let messages = service().get_tx_messages_smart_contract(&tx).unwrap();
        assert_eq!(messages.len(), 1);
        let message = &messages[0];
        assert_eq!(message["type"], "STORE");
        assert_eq!(message["item_type"], "inline");
        // The item hash is the sha256 of the synthesized content.
        let item_content = message["item_content"].as_str().unwrap();
        assert_eq!(
            message["item_hash"].as_str().unwrap(),
            sha256_hex(item_content.as_bytes())
        );
        let content: StoreContent = serde_json::from_str(item_content).unwrap();
        assert_eq!(content.item_type, ItemType::Ipfs);
        assert_eq!(
            content.item_hash,
            "QmPZ9gcCEpqKTo6aq61g2nXGUhM4iCL3ewB6LDXZCtioEB"
        );
    }

    #[test]
    fn archive_round_trips_through_the_wire_format() {
        let archive = OnChainSyncEventPayload {
            protocol: ChainSyncProtocol::OnChainSync,
            version: SYNC_PROTOCOL_VERSION,
            content: OnChainContent {
                messages: vec![RawMessage {
                    chain: Chain::Ethereum,
                    item_hash: "abc".to_string(),
                    sender: "0xdef".to_string(),
                    message_type: MessageType::Post,
                    channel: Some("TEST".to_string()),
                    item_type: Some(ItemType::Inline),
                    item_content: Some("{}".to_string()),
                    signature: Some(Value::String("0xsig".to_string())),
                    time: 1700000000.5,
                }],
            },
        };
        let encoded = serde_json::to_string(&archive).unwrap();
        let decoded: OnChainSyncEventPayload = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.protocol, ChainSyncProtocol::OnChainSync);
        let message = &decoded.content.messages[0];
        assert_eq!(message.item_hash, "abc");
        assert_eq!(message.message_type, MessageType::Post);
        assert_eq!(message.time, 1700000000.5);
    }
}
