//! Signature verification for the EVM chain family (ETH, BSC, AVAX).
//!
//! Signatures are EIP-191 personal-sign signatures over the verification
//! buffer; the signer address is recovered from the signature and compared
//! to the message sender.

use async_trait::async_trait;
use k256::ecdsa::{RecoveryId, Signature, VerifyingKey};
use sha3::{Digest, Keccak256};

use super::{ChainVerifier, SignedMessage};

pub struct EvmVerifier;

fn keccak256(data: &[u8]) -> [u8; 32] {
    Keccak256::digest(data).into()
}

/// EIP-191 "personal sign" digest of a message.
pub fn eip191_hash(message: &[u8]) -> [u8; 32] {
    let mut buffer = Vec::with_capacity(message.len() + 32);
    buffer.extend_from_slice(b"\x19Ethereum Signed Message:\n");
    buffer.extend_from_slice(message.len().to_string().as_bytes());
    buffer.extend_from_slice(message);
    keccak256(&buffer)
}

/// Checksum-free lowercase address of a public key.
pub fn public_key_to_address(key: &VerifyingKey) -> String {
    let encoded = key.to_encoded_point(false);
    let digest = keccak256(&encoded.as_bytes()[1..]);
    format!("0x{}", hex::encode(&digest[12..]))
}

/// Recovers the signer address from a 65-byte `r || s || v` signature.
pub fn recover_address(signature: &[u8], digest: &[u8; 32]) -> Option<String> {
    if signature.len() != 65 {
        return None;
    }
    let v = signature[64];
    let recovery_id = RecoveryId::try_from(if v >= 27 { v - 27 } else { v }).ok()?;
    let signature = Signature::from_slice(&signature[..64]).ok()?;
    let key = VerifyingKey::recover_from_prehash(digest, &signature, recovery_id).ok()?;
    Some(public_key_to_address(&key))
}

#[async_trait]
impl ChainVerifier for EvmVerifier {
    async fn verify_signature(&self, message: &SignedMessage<'_>) -> bool {
        let digest = eip191_hash(&message.verification_buffer());

        let raw_signature = match hex::decode(message.signature.trim_start_matches("0x")) {
            Ok(raw) => raw,
            Err(err) => {
                tracing::warn!(%err, sender = message.sender, "undecodable EVM signature");
                return false;
            }
        };

        // Recovery is CPU-bound; run it off the async workers.
        let sender = message.sender.to_lowercase();
        let recovered = tokio::task::spawn_blocking(move || recover_address(&raw_signature, &digest))
            .await
            .ok()
            .flatten();

        match recovered {
            Some(address) if address == sender => true,
            Some(address) => {
                tracing::warn!(recovered = %address, sender = %sender, "bad EVM signature");
                false
            }
            None => {
                tracing::warn!(sender = %sender, "EVM signature recovery failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use k256::ecdsa::SigningKey;
    use models::{Chain, MessageType};

    fn signing_key() -> SigningKey {
        SigningKey::from_slice(&[0x42; 32]).unwrap()
    }

    fn sign(message: &SignedMessage<'_>, key: &SigningKey) -> String {
        let digest = eip191_hash(&message.verification_buffer());
        let (signature, recovery_id) = key.sign_prehash_recoverable(&digest).unwrap();
        let mut raw = signature.to_bytes().to_vec();
        raw.push(recovery_id.to_byte() + 27);
        format!("0x{}", hex::encode(raw))
    }

    #[tokio::test]
    async fn accepts_a_signature_from_the_sender() {
        let key = signing_key();
        let sender = public_key_to_address(key.verifying_key());
        let unsigned = SignedMessage {
            chain: Chain::Ethereum,
            sender: &sender,
            message_type: MessageType::Post,
            item_hash: "cafebabe",
            signature: "",
        };
        let signature = sign(&unsigned, &key);
        let message = SignedMessage {
            signature: &signature,
            ..unsigned
        };
        assert!(EvmVerifier.verify_signature(&message).await);
    }

    #[tokio::test]
    async fn rejects_a_signature_from_another_key() {
        let key = signing_key();
        let other = SigningKey::from_slice(&[0x43; 32]).unwrap();
        let sender = public_key_to_address(key.verifying_key());
        let unsigned = SignedMessage {
            chain: Chain::Ethereum,
            sender: &sender,
            message_type: MessageType::Post,
            item_hash: "cafebabe",
            signature: "",
        };
        let signature = sign(&unsigned, &other);
        let message = SignedMessage {
            signature: &signature,
            ..unsigned
        };
        assert!(!EvmVerifier.verify_signature(&message).await);
    }

    #[tokio::test]
    async fn rejects_a_tampered_buffer() {
        let key = signing_key();
        let sender = public_key_to_address(key.verifying_key());
        let unsigned = SignedMessage {
            chain: Chain::Ethereum,
            sender: &sender,
            message_type: MessageType::Post,
            item_hash: "cafebabe",
            signature: "",
        };
        let signature = sign(&unsigned, &key);
        let tampered = SignedMessage {
            item_hash: "deadbeef",
            signature: &signature,
            ..unsigned
        };
        assert!(!EvmVerifier.verify_signature(&tampered).await);
    }

    #[tokio::test]
    async fn rejects_garbage_signatures() {
        let message = SignedMessage {
            chain: Chain::Ethereum,
            sender: "0xabc",
            message_type: MessageType::Post,
            item_hash: "cafebabe",
            signature: "not-hex",
        };
        assert!(!EvmVerifier.verify_signature(&message).await);
    }
}
