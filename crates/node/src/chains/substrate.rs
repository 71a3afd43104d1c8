//! Substrate (DOT) signature verification: sr25519 over the verification
//! buffer, against the sender's SS58 address.

use async_trait::async_trait;
use blake2::digest::{Update, VariableOutput};
use blake2::Blake2bVar;
use schnorrkel::{PublicKey, Signature};
use serde::Deserialize;

use super::{ChainVerifier, SignedMessage};

pub struct SubstrateVerifier;

/// Signing context used by substrate wallets for raw payloads.
const SIGNING_CONTEXT: &[u8] = b"substrate";

const SS58_CHECKSUM_PREAMBLE: &[u8] = b"SS58PRE";

#[derive(Deserialize)]
struct SubstrateSignature {
    #[serde(default)]
    curve: Option<String>,
    data: String,
}

fn ss58_checksum(payload: &[u8]) -> [u8; 2] {
    let mut hasher = Blake2bVar::new(64).expect("valid output length");
    hasher.update(SS58_CHECKSUM_PREAMBLE);
    hasher.update(payload);
    let mut output = [0u8; 64];
    hasher
        .finalize_variable(&mut output)
        .expect("output length matches");
    [output[0], output[1]]
}

/// Extracts the 32-byte public key of a simple-prefix SS58 address.
pub fn decode_ss58(address: &str) -> Option<[u8; 32]> {
    let decoded = bs58::decode(address).into_vec().ok()?;
    // 1-byte network prefix + 32-byte key + 2-byte checksum.
    if decoded.len() != 35 {
        return None;
    }
    let checksum = ss58_checksum(&decoded[..33]);
    if checksum != decoded[33..] {
        return None;
    }
    decoded[1..33].try_into().ok()
}

/// Builds an SS58 address for a public key, used by tests and the chain
/// tooling.
pub fn encode_ss58(network: u8, public_key: &[u8; 32]) -> String {
    let mut payload = vec![network];
    payload.extend_from_slice(public_key);
    let checksum = ss58_checksum(&payload);
    payload.extend_from_slice(&checksum);
    bs58::encode(payload).into_string()
}

#[async_trait]
impl ChainVerifier for SubstrateVerifier {
    async fn verify_signature(&self, message: &SignedMessage<'_>) -> bool {
        let signature: SubstrateSignature = match serde_json::from_str(message.signature) {
            Ok(signature) => signature,
            Err(err) => {
                tracing::warn!(%err, "substrate signature deserialization error");
                return false;
            }
        };

        if let Some(curve) = &signature.curve {
            if curve != "sr25519" {
                tracing::warn!(%curve, "unsupported substrate curve");
                return false;
            }
        }

        let Ok(raw_signature) = hex::decode(signature.data.trim_start_matches("0x")) else {
            return false;
        };
        let Some(public_key) = decode_ss58(message.sender) else {
            tracing::warn!(sender = message.sender, "undecodable SS58 address");
            return false;
        };

        let Ok(public) = PublicKey::from_bytes(&public_key) else {
            return false;
        };
        let Ok(parsed_signature) = Signature::from_bytes(&raw_signature) else {
            return false;
        };

        public
            .verify_simple(
                SIGNING_CONTEXT,
                &message.verification_buffer(),
                &parsed_signature,
            )
            .is_ok()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use models::{Chain, MessageType};
    use schnorrkel::{ExpansionMode, MiniSecretKey};

    fn keypair() -> schnorrkel::Keypair {
        MiniSecretKey::from_bytes(&[5; 32])
            .unwrap()
            .expand_to_keypair(ExpansionMode::Ed25519)
    }

    #[test]
    fn ss58_round_trips() {
        let keypair = keypair();
        let public = keypair.public.to_bytes();
        let address = encode_ss58(42, &public);
        assert_eq!(decode_ss58(&address).unwrap(), public);
        // A corrupted character breaks the checksum.
        let mut corrupted = address.into_bytes();
        let last = corrupted.len() - 1;
        corrupted[last] = if corrupted[last] == b'a' { b'b' } else { b'a' };
        assert!(decode_ss58(std::str::from_utf8(&corrupted).unwrap()).is_none());
    }

    #[tokio::test]
    async fn accepts_a_valid_sr25519_signature() {
        let keypair = keypair();
        let address = encode_ss58(42, &keypair.public.to_bytes());
        let unsigned = SignedMessage {
            chain: Chain::Substrate,
            sender: &address,
            message_type: MessageType::Aggregate,
            item_hash: "cafebabe",
            signature: "",
        };
        let raw_signature = keypair
            .sign_simple(SIGNING_CONTEXT, &unsigned.verification_buffer())
            .to_bytes();
        let signature = serde_json::json!({
            "curve": "sr25519",
            "data": format!("0x{}", hex::encode(raw_signature)),
        })
        .to_string();
        let message = SignedMessage {
            signature: &signature,
            ..unsigned
        };
        assert!(SubstrateVerifier.verify_signature(&message).await);
    }

    #[tokio::test]
    async fn rejects_an_unsupported_curve() {
        let message = SignedMessage {
            chain: Chain::Substrate,
            sender: "5GrwvaEF5zXb26Fz9rcQpDWS57CtERHpNehXCPcNoHGKutQY",
            message_type: MessageType::Aggregate,
            item_hash: "cafebabe",
            signature: r#"{"curve": "ed25519", "data": "0x00"}"#,
        };
        assert!(!SubstrateVerifier.verify_signature(&message).await);
    }
}
