//! On-chain synchronization envelopes.
//!
//! All three sync protocols share the `{protocol, version, content}`
//! envelope; `content` is either the inlined message archive, the CID of
//! the same archive stored on IPFS, or a smart-contract event.

use serde::{Deserialize, Serialize};

use crate::message::RawMessage;
use crate::Chain;

crate::text_enum! {
    ChainSyncProtocol {
        OnChainSync => "aleph",
        OffChainSync => "aleph-offchain",
        SmartContract => "smart-contract",
    }
}

crate::text_enum! {
    ChainEventType {
        Sync => "sync",
        Message => "message",
    }
}

pub const SYNC_PROTOCOL_VERSION: i32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OnChainContent {
    pub messages: Vec<RawMessage>,
}

/// Archive of messages inlined in a transaction (`protocol == "aleph"`).
/// Storing messages on-chain proved too expensive; the same payload is now
/// stored off-chain and referenced by CID, but archives keep this format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OnChainSyncEventPayload {
    pub protocol: ChainSyncProtocol,
    pub version: i32,
    pub content: OnChainContent,
}

/// Reference to an archive stored on IPFS (`protocol == "aleph-offchain"`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OffChainSyncEventPayload {
    pub protocol: ChainSyncProtocol,
    pub version: i32,
    pub content: String,
}

/// A message event emitted by a sync smart contract. The Tezos indexer uses
/// `addr` for the emitter address; other chains use `address`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmartContractMessageEvent {
    #[serde(alias = "addr")]
    pub address: String,
    /// Unix seconds.
    pub timestamp: f64,
    #[serde(rename = "type")]
    pub event_type: String,
    pub content: String,
}

/// Metadata of the transaction an event was observed in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxContext {
    pub chain: Chain,
    pub hash: String,
    pub height: i64,
    /// Unix seconds.
    pub time: f64,
    pub publisher: String,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sync_protocols_use_wire_names() {
        assert_eq!(ChainSyncProtocol::OnChainSync.as_str(), "aleph");
        assert_eq!(ChainSyncProtocol::OffChainSync.as_str(), "aleph-offchain");
        assert_eq!(
            "smart-contract".parse::<ChainSyncProtocol>().unwrap(),
            ChainSyncProtocol::SmartContract
        );
    }

    #[test]
    fn smart_contract_event_accepts_tezos_field_names() {
        let event: SmartContractMessageEvent = serde_json::from_value(serde_json::json!({
            "addr": "tz1foo",
            "timestamp": 1700000000.0,
            "type": "STORE_IPFS",
            "content": "QmPZ9gcCEpqKTo6aq61g2nXGUhM4iCL3ewB6LDXZCtioEB",
        }))
        .unwrap();
        assert_eq!(event.address, "tz1foo");
        assert_eq!(event.event_type, "STORE_IPFS");
    }
}
