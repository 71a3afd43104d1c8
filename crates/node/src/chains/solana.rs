//! Solana signature verification: ed25519 over the verification buffer,
//! with the sender being the base58 public key itself.

use async_trait::async_trait;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde::Deserialize;

use super::{ChainVerifier, SignedMessage};

pub struct SolanaVerifier;

#[derive(Deserialize)]
struct SolanaSignature {
    signature: String,
    #[serde(rename = "publicKey")]
    public_key: String,
    #[serde(default)]
    version: Option<u32>,
}

#[async_trait]
impl ChainVerifier for SolanaVerifier {
    async fn verify_signature(&self, message: &SignedMessage<'_>) -> bool {
        let signature: SolanaSignature = match serde_json::from_str(message.signature) {
            Ok(signature) => signature,
            Err(err) => {
                tracing::warn!(%err, "solana signature deserialization error");
                return false;
            }
        };

        if let Some(version) = signature.version {
            if version != 1 {
                tracing::warn!(version, "unsupported solana signature version");
            }
        }

        if message.sender != signature.public_key {
            tracing::warn!(
                sender = message.sender,
                public_key = %signature.public_key,
                "solana signature source mismatch"
            );
            return false;
        }

        let Ok(raw_signature) = bs58::decode(&signature.signature).into_vec() else {
            return false;
        };
        let Ok(raw_key) = bs58::decode(&signature.public_key).into_vec() else {
            return false;
        };

        let Ok(key_bytes) = <[u8; 32]>::try_from(raw_key.as_slice()) else {
            return false;
        };
        let Ok(signature_bytes) = <[u8; 64]>::try_from(raw_signature.as_slice()) else {
            return false;
        };
        let Ok(key) = VerifyingKey::from_bytes(&key_bytes) else {
            return false;
        };

        key.verify(
            &message.verification_buffer(),
            &Signature::from_bytes(&signature_bytes),
        )
        .is_ok()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};
    use models::{Chain, MessageType};

    fn keypair() -> (SigningKey, String) {
        let key = SigningKey::from_bytes(&[7; 32]);
        let public = bs58::encode(key.verifying_key().to_bytes()).into_string();
        (key, public)
    }

    fn signed_json(key: &SigningKey, public: &str, buffer: &[u8]) -> String {
        let signature = key.sign(buffer);
        serde_json::json!({
            "signature": bs58::encode(signature.to_bytes()).into_string(),
            "publicKey": public,
        })
        .to_string()
    }

    #[tokio::test]
    async fn accepts_a_valid_ed25519_signature() {
        let (key, public) = keypair();
        let unsigned = SignedMessage {
            chain: Chain::Solana,
            sender: &public,
            message_type: MessageType::Store,
            item_hash: "cafebabe",
            signature: "",
        };
        let signature = signed_json(&key, &public, &unsigned.verification_buffer());
        let message = SignedMessage {
            signature: &signature,
            ..unsigned
        };
        assert!(SolanaVerifier.verify_signature(&message).await);
    }

    #[tokio::test]
    async fn rejects_when_sender_is_not_the_public_key() {
        let (key, public) = keypair();
        let unsigned = SignedMessage {
            chain: Chain::Solana,
            sender: "SomeoneElse1111111111111111111111",
            message_type: MessageType::Store,
            item_hash: "cafebabe",
            signature: "",
        };
        let signature = signed_json(&key, &public, &unsigned.verification_buffer());
        let message = SignedMessage {
            signature: &signature,
            ..unsigned
        };
        assert!(!SolanaVerifier.verify_signature(&message).await);
    }

    #[tokio::test]
    async fn rejects_non_json_signatures() {
        let message = SignedMessage {
            chain: Chain::Solana,
            sender: "whatever",
            message_type: MessageType::Store,
            item_hash: "cafebabe",
            signature: "0xdeadbeef",
        };
        assert!(!SolanaVerifier.verify_signature(&message).await);
    }
}
