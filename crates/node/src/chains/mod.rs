//! Per-chain signature verification and chain synchronization.

pub mod chain_data;
pub mod cosmos;
pub mod evm;
pub mod indexer;
pub mod nuls2;
pub mod solana;
pub mod substrate;
pub mod tezos;

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::MessageProcessingError;
use models::{Chain, MessageType};

/// The fields covered by a message signature.
#[derive(Debug, Clone, Copy)]
pub struct SignedMessage<'a> {
    pub chain: Chain,
    pub sender: &'a str,
    pub message_type: MessageType,
    pub item_hash: &'a str,
    pub signature: &'a str,
}

impl SignedMessage<'_> {
    /// The canonical buffer every chain family signs.
    pub fn verification_buffer(&self) -> Vec<u8> {
        format!(
            "{}\n{}\n{}\n{}",
            self.chain, self.sender, self.message_type, self.item_hash
        )
        .into_bytes()
    }
}

/// One verifier per chain family. Implementations return `false` on any
/// malformed or mismatching signature and reserve errors for infrastructure
/// failures.
#[async_trait]
pub trait ChainVerifier: Send + Sync {
    async fn verify_signature(&self, message: &SignedMessage<'_>) -> bool;
}

/// Registry dispatching signature checks by chain. Unknown chains fail
/// admission with an invalid-format error.
pub struct SignatureVerifier {
    verifiers: HashMap<Chain, Box<dyn ChainVerifier>>,
}

impl SignatureVerifier {
    pub fn new() -> Self {
        let mut verifiers: HashMap<Chain, Box<dyn ChainVerifier>> = HashMap::new();
        verifiers.insert(Chain::Ethereum, Box::new(evm::EvmVerifier));
        verifiers.insert(Chain::Avalanche, Box::new(evm::EvmVerifier));
        verifiers.insert(Chain::Bsc, Box::new(evm::EvmVerifier));
        verifiers.insert(Chain::Solana, Box::new(solana::SolanaVerifier));
        verifiers.insert(Chain::Tezos, Box::new(tezos::TezosVerifier));
        verifiers.insert(Chain::Substrate, Box::new(substrate::SubstrateVerifier));
        verifiers.insert(Chain::Cosmos, Box::new(cosmos::CosmosVerifier));
        verifiers.insert(Chain::Nuls, Box::new(nuls2::NulsVerifier));
        verifiers.insert(Chain::Nuls2, Box::new(nuls2::NulsVerifier));
        SignatureVerifier { verifiers }
    }

    pub async fn verify(&self, message: &SignedMessage<'_>) -> Result<(), MessageProcessingError> {
        let verifier = self.verifiers.get(&message.chain).ok_or_else(|| {
            MessageProcessingError::InvalidFormat(format!(
                "unknown chain for validation: {}",
                message.chain
            ))
        })?;

        if verifier.verify_signature(message).await {
            Ok(())
        } else {
            Err(MessageProcessingError::InvalidSignature(format!(
                "invalid signature for {}",
                message.item_hash
            )))
        }
    }
}

impl Default for SignatureVerifier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn verification_buffer_is_newline_separated() {
        let message = SignedMessage {
            chain: Chain::Ethereum,
            sender: "0xabc",
            message_type: MessageType::Post,
            item_hash: "cafebabe",
            signature: "unused",
        };
        assert_eq!(message.verification_buffer(), b"ETH\n0xabc\nPOST\ncafebabe");
    }

    #[tokio::test]
    async fn unknown_chains_are_rejected_as_invalid_format() {
        let registry = SignatureVerifier {
            verifiers: HashMap::new(),
        };
        let message = SignedMessage {
            chain: Chain::Ethereum,
            sender: "0xabc",
            message_type: MessageType::Post,
            item_hash: "cafebabe",
            signature: "sig",
        };
        let err = registry.verify(&message).await.unwrap_err();
        assert!(matches!(err, MessageProcessingError::InvalidFormat(_)));
    }
}
