//! Classification and verification helpers for item hashes.
//!
//! An item hash is either a 64-character lowercase sha256 digest (native
//! storage) or an IPFS CID (v0 base58 or v1 base32).

use cid::Cid;
use multihash_codetable::{Code, MultihashDigest};
use sha2::{Digest, Sha256};

use crate::ItemType;

#[derive(Debug, thiserror::Error)]
#[error("unknown hash format: '{0}'")]
pub struct UnknownHash(pub String);

pub fn sha256_hex(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content))
}

fn is_sha256_hex(value: &str) -> bool {
    value.len() == 64 && value.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Infers the storage engine of an item from the shape of its hash.
pub fn item_type_from_hash(item_hash: &str) -> Result<ItemType, UnknownHash> {
    if is_sha256_hex(item_hash) {
        return Ok(ItemType::Storage);
    }
    if item_hash.parse::<Cid>().is_ok() {
        return Ok(ItemType::Ipfs);
    }
    Err(UnknownHash(item_hash.to_string()))
}

/// Returns true when the string is a valid item hash of any supported kind.
pub fn is_item_hash(value: &str) -> bool {
    item_type_from_hash(value).is_ok()
}

/// CID version of an IPFS hash, used to decide how fetched content must be
/// re-hashed for verification.
pub fn cid_version(item_hash: &str) -> Result<u64, UnknownHash> {
    let cid = item_hash
        .parse::<Cid>()
        .map_err(|_| UnknownHash(item_hash.to_string()))?;
    Ok(match cid.version() {
        cid::Version::V0 => 0,
        cid::Version::V1 => 1,
    })
}

/// Computes the CIDv0 of a raw block. Only meaningful for content below the
/// IPFS chunking threshold, which is the only case where we verify IPFS
/// content without the daemon.
pub fn compute_cid_v0(content: &[u8]) -> String {
    let digest = Code::Sha2_256.digest(content);
    let cid = Cid::new_v0(digest).expect("sha2-256 multihash is always a valid CIDv0");
    cid.to_string()
}

#[cfg(test)]
mod test {
    use super::*;

    const STORAGE_HASH: &str = "a1b2c3d4e5f6a1b2c3d4e5f6a1b2c3d4e5f6a1b2c3d4e5f6a1b2c3d4e5f6a1b2";

    #[test]
    fn classifies_storage_hashes() {
        assert_eq!(item_type_from_hash(STORAGE_HASH).unwrap(), ItemType::Storage);
    }

    #[test]
    fn classifies_cid_v0() {
        let cid = compute_cid_v0(b"hello world");
        assert!(cid.starts_with("Qm"));
        assert_eq!(cid.len(), 46);
        assert_eq!(item_type_from_hash(&cid).unwrap(), ItemType::Ipfs);
        assert_eq!(cid_version(&cid).unwrap(), 0);
    }

    #[test]
    fn rejects_garbage() {
        assert!(item_type_from_hash("not-a-hash").is_err());
        // Uppercase hex is not a valid storage hash.
        assert!(item_type_from_hash(&STORAGE_HASH.to_uppercase()).is_err());
    }

    #[test]
    fn sha256_hex_matches_known_digest() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
