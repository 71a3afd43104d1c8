//! Resumable reader of external chain indexers (BSC, ETH, SOL).
//!
//! The indexer exposes the datetime windows it has itself processed; the
//! reader keeps its own synced multirange per `(chain, event type)` and
//! pages through the missing windows, materializing each event as a
//! pending message plus a synthetic chain TX.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::Value;
use sqlx::PgPool;

use models::item_hash::sha256_hex;
use models::message::{timestamp_to_datetime, RawMessage};
use models::sync::{ChainEventType, ChainSyncProtocol, TxContext};
use models::{Chain, ItemType, MessageType, MultiRange, StoreContent};
use models::range::Range;
use node_sql::chains::ChainTxRow;
use node_sql::Json;

use crate::pipeline::message_handler::pending_message_from_raw;

const EVENT_PAGE_LIMIT: usize = 1000;
const RETRY_DELAY: Duration = Duration::from_secs(10);
const IDLE_DELAY: Duration = Duration::from_secs(10);

pub struct IndexerClient {
    indexer_url: String,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct GraphqlResponse<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct AccountStateData {
    state: Vec<AccountState>,
}

#[derive(Debug, Deserialize)]
pub struct AccountState {
    pub account: String,
    /// Fully processed `[start, end]` millisecond timestamp pairs.
    pub processed: Vec<(f64, f64)>,
}

#[derive(Debug, Default, Deserialize)]
struct EventsData {
    #[serde(default, rename = "messageEvents")]
    message_events: Vec<MessageEvent>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessageEvent {
    /// Milliseconds.
    pub timestamp: f64,
    pub address: String,
    pub height: i64,
    pub transaction: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub content: String,
}

fn blockchain_name(chain: Chain) -> &'static str {
    match chain {
        Chain::Bsc => "bsc",
        Chain::Ethereum => "ethereum",
        Chain::Solana => "solana",
        other => other.as_str(),
    }
}

fn account_state_query(blockchain: &str, account: &str) -> String {
    format!(
        r#"{{
  state: accountState(blockchain: "{blockchain}", account: ["{account}"], type: log) {{
    account
    processed
  }}
}}"#
    )
}

fn events_query(blockchain: &str, start_ms: f64, end_ms: f64, limit: usize) -> String {
    format!(
        r#"{{
  messageEvents(blockchain: "{blockchain}", startDate: {start_ms}, endDate: {end_ms}, limit: {limit}, reverse: false) {{
    timestamp
    address
    height
    transaction
    type
    content
  }}
}}"#
    )
}

impl IndexerClient {
    pub fn new(indexer_url: &str) -> Self {
        IndexerClient {
            indexer_url: indexer_url.to_string(),
            http: reqwest::Client::new(),
        }
    }

    async fn query<T: serde::de::DeserializeOwned>(&self, query: String) -> anyhow::Result<T> {
        let response: GraphqlResponse<T> = self
            .http
            .post(&self.indexer_url)
            .json(&serde_json::json!({ "query": query }))
            .send()
            .await
            .context("indexer request")?
            .error_for_status()
            .context("indexer response")?
            .json()
            .await
            .context("decoding indexer response")?;
        Ok(response.data)
    }

    pub async fn fetch_account_state(
        &self,
        chain: Chain,
        account: &str,
    ) -> anyhow::Result<Option<AccountState>> {
        let data: AccountStateData = self
            .query(account_state_query(blockchain_name(chain), account))
            .await?;
        Ok(data.state.into_iter().next())
    }

    pub async fn fetch_events(
        &self,
        chain: Chain,
        range: &Range<DateTime<Utc>>,
        limit: usize,
    ) -> anyhow::Result<Vec<MessageEvent>> {
        let data: EventsData = self
            .query(events_query(
                blockchain_name(chain),
                range.lower.timestamp_millis() as f64,
                range.upper.timestamp_millis() as f64,
                limit,
            ))
            .await?;
        Ok(data.message_events)
    }
}

/// Converts one indexer event into the pending message dict and the TX
/// context of the transaction it came from. STORE_IPFS events synthesize
/// a full STORE message around the event content.
pub fn indexer_event_to_message(
    chain: Chain,
    event: &MessageEvent,
) -> anyhow::Result<(RawMessage, TxContext)> {
    let timestamp = event.timestamp / 1000.0;

    let (message_type, item_content) = if event.event_type == "STORE_IPFS" {
        let content = StoreContent {
            address: event.address.clone(),
            time: timestamp,
            item_type: ItemType::Ipfs,
            item_hash: event.content.clone(),
            ref_: None,
            metadata: None,
            mime_type: None,
        };
        (MessageType::Store, serde_json::to_string(&content)?)
    } else {
        let message_type = event
            .event_type
            .parse::<MessageType>()
            .map_err(|_| anyhow::anyhow!("unsupported message type: {}", event.event_type))?;
        (message_type, event.content.clone())
    };

    let message = RawMessage {
        chain,
        item_hash: sha256_hex(item_content.as_bytes()),
        sender: event.address.clone(),
        message_type,
        channel: None,
        item_type: Some(ItemType::Inline),
        item_content: Some(item_content),
        signature: None,
        time: timestamp,
    };

    let tx_context = TxContext {
        chain,
        hash: event.transaction.clone(),
        height: event.height,
        time: timestamp,
        publisher: event.address.clone(),
    };

    Ok((message, tx_context))
}

pub struct IndexerReader {
    chain: Chain,
    event_type: ChainEventType,
    pool: PgPool,
}

impl IndexerReader {
    pub fn new(chain: Chain, event_type: ChainEventType, pool: PgPool) -> Self {
        IndexerReader {
            chain,
            event_type,
            pool,
        }
    }

    /// Persists one page of events: pending messages, synthetic chain TXs
    /// and the extended sync range, all in one transaction.
    async fn persist_events(
        &self,
        events: &[MessageEvent],
        synced_range: Range<DateTime<Utc>>,
    ) -> anyhow::Result<()> {
        let mut txn = self.pool.begin().await?;
        let reception_time = Utc::now();

        for event in events {
            let (message, tx_context) = match indexer_event_to_message(self.chain, event) {
                Ok(converted) => converted,
                Err(err) => {
                    tracing::warn!(%err, "skipping unusable indexer event");
                    continue;
                }
            };

            let tx_row = ChainTxRow {
                hash: tx_context.hash.clone(),
                chain: self.chain,
                height: tx_context.height,
                datetime: timestamp_to_datetime(tx_context.time)
                    .unwrap_or_else(|| Utc.timestamp_opt(0, 0).unwrap()),
                publisher: tx_context.publisher.clone(),
                protocol: ChainSyncProtocol::SmartContract,
                protocol_version: 1,
                content: Json(Value::String(event.content.clone())),
            };
            node_sql::chains::upsert_chain_tx(&mut txn, &tx_row).await?;

            match pending_message_from_raw(
                message,
                reception_time,
                Some(tx_context.hash.clone()),
                false,
            ) {
                Ok(pending) => {
                    node_sql::pending_messages::insert_pending_message(&mut txn, &pending).await?;
                }
                Err(err) => {
                    tracing::warn!(%err, "skipping invalid indexer message");
                }
            }
        }

        let mut multirange =
            node_sql::chains::get_indexer_multirange(&mut txn, self.chain, self.event_type).await?;
        multirange.add(synced_range);
        node_sql::chains::upsert_indexer_multirange(
            &mut txn,
            self.chain,
            self.event_type,
            &multirange,
            Utc::now(),
        )
        .await?;

        txn.commit().await?;
        Ok(())
    }

    async fn fetch_range(
        &self,
        client: &IndexerClient,
        range: Range<DateTime<Utc>>,
    ) -> anyhow::Result<()> {
        let mut start = range.lower;

        loop {
            let page_range = Range {
                lower: start,
                upper: range.upper,
                lower_inc: true,
                upper_inc: range.upper_inc,
            };
            let events = client
                .fetch_events(self.chain, &page_range, EVENT_PAGE_LIMIT)
                .await?;
            tracing::info!(
                chain = %self.chain,
                event_type = %self.event_type,
                count = events.len(),
                "indexer events fetched"
            );

            // A full page means there may be more events at the tail; the
            // synced range then excludes the last timestamp so the next
            // page resumes from it.
            let full_page = events.len() >= EVENT_PAGE_LIMIT;
            let synced_range = if full_page {
                let last = events
                    .last()
                    .and_then(|event| timestamp_to_datetime(event.timestamp / 1000.0))
                    .unwrap_or(range.upper);
                Range {
                    lower: start,
                    upper: last,
                    lower_inc: true,
                    upper_inc: false,
                }
            } else {
                Range {
                    lower: start,
                    upper: range.upper,
                    lower_inc: true,
                    upper_inc: true,
                }
            };

            self.persist_events(&events, synced_range).await?;

            if !full_page {
                return Ok(());
            }
            start = synced_range.upper;
        }
    }

    pub async fn fetch_new_events(
        &self,
        indexer_url: &str,
        sync_contract: &str,
    ) -> anyhow::Result<()> {
        let client = IndexerClient::new(indexer_url);

        let Some(state) = client.fetch_account_state(self.chain, sync_contract).await? else {
            tracing::warn!(
                account = sync_contract,
                "no account data found, is the indexer up to date?"
            );
            return Ok(());
        };

        let mut indexer_multirange = MultiRange::new();
        for (start_ms, end_ms) in &state.processed {
            let (Some(lower), Some(upper)) = (
                timestamp_to_datetime(start_ms / 1000.0),
                timestamp_to_datetime(end_ms / 1000.0),
            ) else {
                continue;
            };
            indexer_multirange.add(Range::closed(lower, upper));
        }

        let local = {
            let mut conn = self.pool.acquire().await?;
            node_sql::chains::get_indexer_multirange(&mut conn, self.chain, self.event_type).await?
        };

        for range in indexer_multirange.difference(&local).ranges() {
            tracing::info!(
                chain = %self.chain,
                event_type = %self.event_type,
                ?range,
                "fetching missing indexer range"
            );
            self.fetch_range(&client, *range).await?;
        }
        Ok(())
    }

    /// Periodic loop: full passes with a fixed idle delay, retrying with
    /// the same delay on any failure.
    pub async fn run(&self, indexer_url: String, sync_contract: String) {
        loop {
            match self.fetch_new_events(&indexer_url, &sync_contract).await {
                Ok(()) => {
                    tracing::info!(
                        chain = %self.chain,
                        "indexer sync: processed all transactions, waiting"
                    );
                    tokio::time::sleep(IDLE_DELAY).await;
                }
                Err(err) => {
                    tracing::error!(chain = %self.chain, %err, "indexer sync failed, retrying");
                    tokio::time::sleep(RETRY_DELAY).await;
                }
            }
        }
    }
}

/// Chains with an external indexer deployment.
pub fn indexer_chains() -> HashMap<Chain, ChainEventType> {
    HashMap::from([
        (Chain::Bsc, ChainEventType::Message),
        (Chain::Ethereum, ChainEventType::Message),
        (Chain::Solana, ChainEventType::Message),
    ])
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn store_ipfs_events_synthesize_store_messages() {
        let event = MessageEvent {
            timestamp: 1_700_000_000_000.0,
            address: "0xemitter".to_string(),
            height: 42,
            transaction: "0xtx".to_string(),
            event_type: "STORE_IPFS".to_string(),
            content: "QmPZ9gcCEpqKTo6aq61g2nXGUhM4iCL3ewB6LDXZCtioEB".to_string(),
        };
        let (message, tx_context) = indexer_event_to_message(Chain::Ethereum, &event).unwrap();
        assert_eq!(message.message_type, MessageType::Store);
        assert_eq!(message.time, 1_700_000_000.0);
        assert_eq!(
            message.item_hash,
            sha256_hex(message.item_content.as_ref().unwrap().as_bytes())
        );
        assert_eq!(tx_context.hash, "0xtx");
        assert_eq!(tx_context.height, 42);
    }

    #[test]
    fn plain_events_carry_their_content_inline() {
        let event = MessageEvent {
            timestamp: 1_700_000_000_000.0,
            address: "0xemitter".to_string(),
            height: 42,
            transaction: "0xtx".to_string(),
            event_type: "POST".to_string(),
            content: r#"{"type": "blog", "content": {}}"#.to_string(),
        };
        let (message, _) = indexer_event_to_message(Chain::Ethereum, &event).unwrap();
        assert_eq!(message.message_type, MessageType::Post);
        assert_eq!(
            message.item_content.as_deref(),
            Some(r#"{"type": "blog", "content": {}}"#)
        );
    }

    #[test]
    fn unknown_event_types_are_errors() {
        let event = MessageEvent {
            timestamp: 0.0,
            address: "0xemitter".to_string(),
            height: 1,
            transaction: "0xtx".to_string(),
            event_type: "SOMETHING_ELSE".to_string(),
            content: String::new(),
        };
        assert!(indexer_event_to_message(Chain::Ethereum, &event).is_err());
    }
}
