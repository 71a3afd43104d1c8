//! Cosmos-SDK (CSDK) signature verification.
//!
//! The wallet signs an amino sign-doc wrapping the verification buffer in
//! a `signutil/MsgSignText` message. The doc is serialized with sorted
//! keys and compact separators, hashed with sha256 and verified against
//! the secp256k1 public key, which must also hash to the sender address.

use async_trait::async_trait;
use bech32::{ToBase32, Variant};
use k256::ecdsa::signature::Verifier;
use ripemd::Ripemd160;
use serde::Deserialize;
use sha2::{Digest, Sha256};

use super::{ChainVerifier, SignedMessage};

pub struct CosmosVerifier;

#[derive(Deserialize)]
struct CosmosSignature {
    pub_key: CosmosPubKey,
    signature: String,
}

#[derive(Deserialize)]
struct CosmosPubKey {
    #[serde(rename = "type")]
    key_type: String,
    value: String,
}

/// The amino sign-doc for a plain-text message. serde_json keeps object
/// keys sorted, which matches the canonical encoding wallets produce.
pub fn sign_doc(buffer: &str, signer: &str) -> String {
    serde_json::json!({
        "chain_id": "signed-message-v1",
        "account_number": "0",
        "fee": {"amount": [], "gas": "0"},
        "memo": "",
        "sequence": "0",
        "msgs": [{
            "type": "signutil/MsgSignText",
            "value": {"message": buffer, "signer": signer},
        }],
    })
    .to_string()
}

/// Bech32 address of a compressed secp256k1 public key.
pub fn pubkey_to_address(public_key: &[u8], hrp: &str) -> Option<String> {
    let sha = Sha256::digest(public_key);
    let hash = Ripemd160::digest(sha);
    bech32::encode(hrp, hash.as_slice().to_base32(), Variant::Bech32).ok()
}

#[async_trait]
impl ChainVerifier for CosmosVerifier {
    async fn verify_signature(&self, message: &SignedMessage<'_>) -> bool {
        let signature: CosmosSignature = match serde_json::from_str(message.signature) {
            Ok(signature) => signature,
            Err(err) => {
                tracing::warn!(%err, "cosmos signature deserialization error");
                return false;
            }
        };

        if signature.pub_key.key_type != "tendermint/PubKeySecp256k1" {
            tracing::warn!(key_type = %signature.pub_key.key_type, "unsupported cosmos key type");
            return false;
        }

        let Ok(public_key) = base64::decode(&signature.pub_key.value) else {
            return false;
        };
        let Ok(raw_signature) = base64::decode(&signature.signature) else {
            return false;
        };

        // The sender address must be derivable from the public key.
        let Some((hrp, _)) = message.sender.split_once('1') else {
            tracing::warn!(sender = message.sender, "sender is not a bech32 address");
            return false;
        };
        match pubkey_to_address(&public_key, hrp) {
            Some(address) if address == message.sender => {}
            other => {
                tracing::warn!(?other, sender = message.sender, "cosmos address mismatch");
                return false;
            }
        }

        let buffer = String::from_utf8_lossy(&message.verification_buffer()).into_owned();
        let doc = sign_doc(&buffer, message.sender);

        let Ok(key) = k256::ecdsa::VerifyingKey::from_sec1_bytes(&public_key) else {
            return false;
        };
        let Ok(parsed_signature) = k256::ecdsa::Signature::from_slice(&raw_signature) else {
            return false;
        };

        // VerifyingKey::verify hashes the sign-doc with sha256 internally.
        key.verify(doc.as_bytes(), &parsed_signature).is_ok()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use k256::ecdsa::{signature::Signer, Signature, SigningKey};
    use models::{Chain, MessageType};

    fn keypair() -> (SigningKey, Vec<u8>, String) {
        let key = SigningKey::from_slice(&[0x11; 32]).unwrap();
        let public = key.verifying_key().to_encoded_point(true).as_bytes().to_vec();
        let address = pubkey_to_address(&public, "cosmos").unwrap();
        (key, public, address)
    }

    #[test]
    fn sign_doc_is_sorted_and_compact() {
        let doc = sign_doc("ETH\na\nPOST\nb", "cosmos1xyz");
        assert!(doc.starts_with(r#"{"account_number":"0","chain_id":"signed-message-v1""#));
        assert!(!doc.contains(": "));
    }

    #[tokio::test]
    async fn accepts_a_valid_secp256k1_signature() {
        let (key, public, address) = keypair();
        let unsigned = SignedMessage {
            chain: Chain::Cosmos,
            sender: &address,
            message_type: MessageType::Post,
            item_hash: "cafebabe",
            signature: "",
        };
        let buffer = String::from_utf8(unsigned.verification_buffer()).unwrap();
        let doc = sign_doc(&buffer, &address);
        let raw_signature: Signature = key.sign(doc.as_bytes());

        let signature = serde_json::json!({
            "pub_key": {
                "type": "tendermint/PubKeySecp256k1",
                "value": base64::encode(&public),
            },
            "signature": base64::encode(raw_signature.to_bytes()),
        })
        .to_string();
        let message = SignedMessage {
            signature: &signature,
            ..unsigned
        };
        assert!(CosmosVerifier.verify_signature(&message).await);
    }

    #[tokio::test]
    async fn rejects_a_mismatched_address() {
        let (key, public, _) = keypair();
        let other_address = pubkey_to_address(&[1; 33], "cosmos").unwrap();
        let unsigned = SignedMessage {
            chain: Chain::Cosmos,
            sender: &other_address,
            message_type: MessageType::Post,
            item_hash: "cafebabe",
            signature: "",
        };
        let buffer = String::from_utf8(unsigned.verification_buffer()).unwrap();
        let doc = sign_doc(&buffer, &other_address);
        let raw_signature: Signature = key.sign(doc.as_bytes());

        let signature = serde_json::json!({
            "pub_key": {
                "type": "tendermint/PubKeySecp256k1",
                "value": base64::encode(&public),
            },
            "signature": base64::encode(raw_signature.to_bytes()),
        })
        .to_string();
        let message = SignedMessage {
            signature: &signature,
            ..unsigned
        };
        assert!(!CosmosVerifier.verify_signature(&message).await);
    }
}
