//! Tezos signature verification.
//!
//! The signature field is a JSON object `{signature, publicKey}` where both
//! values are base58check-encoded with Tezos prefixes. The sender must be
//! the public key hash (tz1/tz2), and the signature covers the blake2b-256
//! digest of the verification buffer.

use async_trait::async_trait;
use blake2::digest::{Update, VariableOutput};
use blake2::Blake2bVar;
use ed25519_dalek::Verifier;
use k256::ecdsa::signature::hazmat::PrehashVerifier;
use serde::Deserialize;

use super::{ChainVerifier, SignedMessage};

pub struct TezosVerifier;

const PREFIX_EDPK: [u8; 4] = [13, 15, 37, 217];
const PREFIX_SPPK: [u8; 4] = [3, 254, 226, 86];
const PREFIX_TZ1: [u8; 3] = [6, 161, 159];
const PREFIX_TZ2: [u8; 3] = [6, 161, 161];
const PREFIX_EDSIG: [u8; 5] = [9, 245, 205, 134, 18];
const PREFIX_SPSIG: [u8; 5] = [13, 115, 101, 19, 63];
const PREFIX_SIG: [u8; 3] = [4, 130, 43];

#[derive(Deserialize)]
struct TezosSignature {
    signature: String,
    #[serde(rename = "publicKey")]
    public_key: String,
}

pub fn blake2b(data: &[u8], output_len: usize) -> Vec<u8> {
    let mut hasher = Blake2bVar::new(output_len).expect("output length is valid");
    hasher.update(data);
    let mut output = vec![0u8; output_len];
    hasher
        .finalize_variable(&mut output)
        .expect("output length matches");
    output
}

pub fn base58check_encode(prefix: &[u8], payload: &[u8]) -> String {
    let mut data = prefix.to_vec();
    data.extend_from_slice(payload);
    bs58::encode(data).with_check().into_string()
}

fn base58check_decode(value: &str, prefix: &[u8]) -> Option<Vec<u8>> {
    let decoded = bs58::decode(value).with_check(None).into_vec().ok()?;
    decoded.strip_prefix(prefix).map(|rest| rest.to_vec())
}

enum TezosPublicKey {
    Ed25519([u8; 32]),
    Secp256k1(Vec<u8>),
}

impl TezosPublicKey {
    fn decode(encoded: &str) -> Option<Self> {
        if let Some(raw) = base58check_decode(encoded, &PREFIX_EDPK) {
            return Some(TezosPublicKey::Ed25519(raw.try_into().ok()?));
        }
        if let Some(raw) = base58check_decode(encoded, &PREFIX_SPPK) {
            return Some(TezosPublicKey::Secp256k1(raw));
        }
        None
    }

    /// The tz address: base58check of the blake2b-160 digest of the raw key.
    fn public_key_hash(&self) -> String {
        match self {
            TezosPublicKey::Ed25519(raw) => base58check_encode(&PREFIX_TZ1, &blake2b(raw, 20)),
            TezosPublicKey::Secp256k1(raw) => base58check_encode(&PREFIX_TZ2, &blake2b(raw, 20)),
        }
    }

    fn verify(&self, digest: &[u8], signature: &[u8]) -> bool {
        match self {
            TezosPublicKey::Ed25519(raw) => {
                let Ok(key) = ed25519_dalek::VerifyingKey::from_bytes(raw) else {
                    return false;
                };
                let Ok(signature) = <[u8; 64]>::try_from(signature) else {
                    return false;
                };
                key.verify(digest, &ed25519_dalek::Signature::from_bytes(&signature))
                    .is_ok()
            }
            TezosPublicKey::Secp256k1(raw) => {
                let Ok(key) = k256::ecdsa::VerifyingKey::from_sec1_bytes(raw) else {
                    return false;
                };
                let Ok(signature) = k256::ecdsa::Signature::from_slice(signature) else {
                    return false;
                };
                key.verify_prehash(digest, &signature).is_ok()
            }
        }
    }
}

fn decode_signature(encoded: &str) -> Option<Vec<u8>> {
    base58check_decode(encoded, &PREFIX_EDSIG)
        .or_else(|| base58check_decode(encoded, &PREFIX_SPSIG))
        .or_else(|| base58check_decode(encoded, &PREFIX_SIG))
}

#[async_trait]
impl ChainVerifier for TezosVerifier {
    async fn verify_signature(&self, message: &SignedMessage<'_>) -> bool {
        let signature: TezosSignature = match serde_json::from_str(message.signature) {
            Ok(signature) => signature,
            Err(err) => {
                tracing::warn!(%err, "tezos signature field is not JSON deserializable");
                return false;
            }
        };

        let Some(key) = TezosPublicKey::decode(&signature.public_key) else {
            tracing::warn!(public_key = %signature.public_key, "undecodable tezos public key");
            return false;
        };

        if message.sender != key.public_key_hash() {
            tracing::warn!(
                sender = message.sender,
                hash = %key.public_key_hash(),
                "sender does not match tezos public key hash"
            );
            return false;
        }

        let Some(raw_signature) = decode_signature(&signature.signature) else {
            tracing::warn!("undecodable tezos signature");
            return false;
        };

        let digest = blake2b(&message.verification_buffer(), 32);
        key.verify(&digest, &raw_signature)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};
    use models::{Chain, MessageType};

    fn tezos_keypair() -> (SigningKey, String, String) {
        let key = SigningKey::from_bytes(&[9; 32]);
        let raw_public = key.verifying_key().to_bytes();
        let encoded_public = base58check_encode(&PREFIX_EDPK, &raw_public);
        let address = base58check_encode(&PREFIX_TZ1, &blake2b(&raw_public, 20));
        (key, encoded_public, address)
    }

    #[tokio::test]
    async fn accepts_a_valid_ed25519_signature() {
        let (key, public, address) = tezos_keypair();
        let unsigned = SignedMessage {
            chain: Chain::Tezos,
            sender: &address,
            message_type: MessageType::Post,
            item_hash: "cafebabe",
            signature: "",
        };
        let digest = blake2b(&unsigned.verification_buffer(), 32);
        let signature = serde_json::json!({
            "signature": base58check_encode(&PREFIX_EDSIG, &key.sign(&digest).to_bytes()),
            "publicKey": public,
        })
        .to_string();
        let message = SignedMessage {
            signature: &signature,
            ..unsigned
        };
        assert!(TezosVerifier.verify_signature(&message).await);
    }

    #[tokio::test]
    async fn rejects_a_sender_that_is_not_the_key_hash() {
        let (key, public, _) = tezos_keypair();
        let unsigned = SignedMessage {
            chain: Chain::Tezos,
            sender: "tz1VSUr8wwNhLAzempoch5d6hLRiTh8Cjcjb",
            message_type: MessageType::Post,
            item_hash: "cafebabe",
            signature: "",
        };
        let digest = blake2b(&unsigned.verification_buffer(), 32);
        let signature = serde_json::json!({
            "signature": base58check_encode(&PREFIX_EDSIG, &key.sign(&digest).to_bytes()),
            "publicKey": public,
        })
        .to_string();
        let message = SignedMessage {
            signature: &signature,
            ..unsigned
        };
        assert!(!TezosVerifier.verify_signature(&message).await);
    }

    #[test]
    fn address_derivation_produces_tz1_addresses() {
        let (_, _, address) = tezos_keypair();
        assert!(address.starts_with("tz1"));
    }
}
