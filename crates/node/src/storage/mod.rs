//! The content store service: resolves item hashes to bytes across the
//! local blob store, peer HTTP APIs and IPFS, with hash verification and
//! optional store-back.

pub mod engine;
pub mod ipfs;
pub mod p2p;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde_json::Value;
use sqlx::PgConnection;
use tokio::sync::RwLock;

use models::item_hash::{cid_version, compute_cid_v0, sha256_hex};
use models::{FileType, ItemType};

use engine::StorageEngine;
use ipfs::IpfsClient;

pub const STREAM_CHUNK_SIZE: usize = 128 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The fetched bytes do not match the expected hash, or the payload is
    /// not decodable.
    #[error("invalid content: {0}")]
    InvalidContent(String),
    /// No source could provide the content right now.
    #[error("content currently unavailable: {0}")]
    ContentUnavailable(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentSource {
    Inline,
    Local,
    P2p,
    Ipfs,
}

#[derive(Debug, Clone)]
pub struct MessageContent {
    pub hash: String,
    pub source: ContentSource,
    pub value: Value,
    pub raw_size: usize,
}

#[derive(Clone, Copy)]
pub struct FetchOptions {
    pub timeout: Duration,
    pub use_network: bool,
    pub use_ipfs: bool,
    pub store_value: bool,
}

impl Default for FetchOptions {
    fn default() -> Self {
        FetchOptions {
            timeout: Duration::from_secs(2),
            use_network: true,
            use_ipfs: true,
            store_value: true,
        }
    }
}

pub struct StorageService {
    engine: Arc<dyn StorageEngine>,
    ipfs: Option<IpfsClient>,
    api_servers: RwLock<Vec<String>>,
    http: reqwest::Client,
}

impl StorageService {
    pub fn new(
        engine: Arc<dyn StorageEngine>,
        ipfs: Option<IpfsClient>,
        api_servers: Vec<String>,
    ) -> Self {
        StorageService {
            engine,
            ipfs,
            api_servers: RwLock::new(api_servers),
            http: reqwest::Client::new(),
        }
    }

    pub fn storage_engine(&self) -> &Arc<dyn StorageEngine> {
        &self.engine
    }

    pub fn ipfs_enabled(&self) -> bool {
        self.ipfs.is_some()
    }

    pub async fn set_api_servers(&self, servers: Vec<String>) {
        *self.api_servers.write().await = servers;
    }

    /// Returns the decoded content of a message: inline content directly,
    /// anything else through the hash lookup chain.
    pub async fn get_message_content(
        &self,
        item_type: ItemType,
        item_hash: &str,
        item_content: Option<&str>,
    ) -> Result<MessageContent, StorageError> {
        let (raw, source): (Vec<u8>, ContentSource) = match item_type {
            ItemType::Inline => {
                let inline = item_content.ok_or_else(|| {
                    StorageError::InvalidContent("inline message without item_content".to_string())
                })?;
                (inline.as_bytes().to_vec(), ContentSource::Inline)
            }
            ItemType::Storage | ItemType::Ipfs => {
                let (raw, source) = self
                    .get_hash_content(item_hash, item_type, FetchOptions::default())
                    .await?;
                (raw, source)
            }
        };

        if raw.windows(6).any(|window| window == b"\\u0000") || raw.contains(&0) {
            return Err(StorageError::InvalidContent(
                "unsupported character in message: \\u0000".to_string(),
            ));
        }

        let value = serde_json::from_slice(&raw)
            .map_err(|err| StorageError::InvalidContent(format!("can't decode JSON: {err}")))?;

        Ok(MessageContent {
            hash: item_hash.to_string(),
            source,
            value,
            raw_size: raw.len(),
        })
    }

    /// Resolves a hash to bytes: local store, then peer HTTP fan-out, then
    /// IPFS. Network hits are verified against the expected hash and
    /// written back to the local store.
    pub async fn get_hash_content(
        &self,
        content_hash: &str,
        engine: ItemType,
        options: FetchOptions,
    ) -> Result<(Vec<u8>, ContentSource), StorageError> {
        if let Some(content) = self.engine.read(content_hash).await? {
            return Ok((content, ContentSource::Local));
        }

        let mut fetched: Option<(Vec<u8>, ContentSource)> = None;

        if options.use_network {
            let api_servers = self.api_servers.read().await.clone();
            if let Some(content) =
                p2p::request_hash(&self.http, &api_servers, content_hash, options.timeout).await
            {
                self.verify_content_hash(&content, engine, content_hash).await?;
                fetched = Some((content, ContentSource::P2p));
            }
        }

        if fetched.is_none() && options.use_ipfs && engine == ItemType::Ipfs {
            if let Some(ipfs) = &self.ipfs {
                match ipfs.cat(content_hash, options.timeout.max(Duration::from_secs(5))).await {
                    Ok(content) => {
                        self.verify_content_hash(&content, engine, content_hash).await?;
                        fetched = Some((content, ContentSource::Ipfs));
                    }
                    Err(err) => {
                        tracing::debug!(%content_hash, %err, "ipfs lookup failed");
                    }
                }
            }
        }

        let (content, source) = fetched.ok_or_else(|| {
            StorageError::ContentUnavailable(format!(
                "could not fetch content for '{content_hash}'"
            ))
        })?;

        if options.store_value {
            self.engine.write(content_hash, &content).await?;
        }

        Ok((content, source))
    }

    /// Checks that fetched bytes hash to the expected value. sha256 for
    /// storage items; for IPFS, CIDv0 is recomputed locally and CIDv1 is
    /// delegated to the daemon.
    async fn verify_content_hash(
        &self,
        content: &[u8],
        engine: ItemType,
        expected_hash: &str,
    ) -> Result<(), StorageError> {
        let computed = match engine {
            ItemType::Storage => sha256_hex(content),
            ItemType::Ipfs => {
                let version = cid_version(expected_hash)
                    .map_err(|err| StorageError::InvalidContent(err.to_string()))?;
                if version == 0 {
                    compute_cid_v0(content)
                } else {
                    let ipfs = self.ipfs.as_ref().ok_or_else(|| {
                        StorageError::ContentUnavailable(format!(
                            "could not compute hash for '{expected_hash}'"
                        ))
                    })?;
                    ipfs.add_bytes(content.to_vec(), version, true)
                        .await
                        .map_err(|_| {
                            StorageError::ContentUnavailable(format!(
                                "could not compute hash for '{expected_hash}'"
                            ))
                        })?
                }
            }
            ItemType::Inline => {
                return Err(StorageError::InvalidContent(
                    "inline content does not go through hash verification".to_string(),
                ))
            }
        };

        if computed != expected_hash {
            return Err(StorageError::InvalidContent(format!(
                "got a bad hash: expected '{expected_hash}', computed '{computed}'"
            )));
        }
        Ok(())
    }

    /// Stores raw bytes and catalogs them, returning the content hash:
    /// the CID when the engine is IPFS, the sha256 digest otherwise.
    pub async fn add_file(
        &self,
        conn: &mut PgConnection,
        content: &[u8],
        engine: ItemType,
    ) -> anyhow::Result<String> {
        let file_hash = match engine {
            ItemType::Ipfs => {
                let ipfs = self
                    .ipfs
                    .as_ref()
                    .ok_or_else(|| anyhow::anyhow!("ipfs is disabled"))?;
                ipfs.add_bytes(content.to_vec(), 0, false).await?
            }
            ItemType::Storage => sha256_hex(content),
            ItemType::Inline => anyhow::bail!("cannot add a file with the inline engine"),
        };

        self.engine.write(&file_hash, content).await?;
        node_sql::files::upsert_stored_file(conn, &file_hash, content.len() as i64, FileType::File)
            .await?;
        Ok(file_hash)
    }

    pub async fn add_json(
        &self,
        conn: &mut PgConnection,
        value: &Value,
        engine: ItemType,
    ) -> anyhow::Result<String> {
        let content = serde_json::to_vec(value)?;
        self.add_file(conn, &content, engine).await
    }

    pub async fn pin_hash(&self, content_hash: &str, timeout: Duration) -> anyhow::Result<()> {
        let ipfs = self
            .ipfs
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("ipfs is disabled"))?;
        ipfs.pin_add(content_hash, timeout).await
    }

    pub fn ipfs_client(&self) -> Option<&IpfsClient> {
        self.ipfs.as_ref()
    }

    /// Lazy chunked read for large downloads: the local blob when present,
    /// the IPFS gateway otherwise.
    pub async fn get_hash_content_stream(
        &self,
        content_hash: &str,
        engine: ItemType,
    ) -> Result<impl Stream<Item = Result<Bytes, StorageError>> + '_, StorageError> {
        if let Some(content) = self.engine.read(content_hash).await? {
            let chunks: Vec<Result<Bytes, StorageError>> = content
                .chunks(STREAM_CHUNK_SIZE)
                .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
                .collect();
            return Ok(futures::stream::iter(chunks).boxed());
        }

        if engine == ItemType::Ipfs {
            if let Some(ipfs) = &self.ipfs {
                let stream = ipfs.cat_stream(content_hash).await.map_err(|err| {
                    StorageError::ContentUnavailable(format!(
                        "could not stream '{content_hash}': {err}"
                    ))
                })?;
                return Ok(stream
                    .map(|chunk| {
                        chunk.map_err(|err| {
                            StorageError::ContentUnavailable(format!("stream error: {err}"))
                        })
                    })
                    .boxed());
            }
        }

        Err(StorageError::ContentUnavailable(format!(
            "could not fetch content for '{content_hash}'"
        )))
    }
}

#[cfg(test)]
mod test {
    use super::engine::MemoryStorageEngine;
    use super::*;

    fn service_with_local(content: &[u8], hash: &str) -> StorageService {
        let engine = Arc::new(MemoryStorageEngine::new());
        let service = StorageService::new(engine.clone(), None, Vec::new());
        futures::executor::block_on(engine.write(hash, content)).unwrap();
        service
    }

    #[tokio::test]
    async fn local_content_wins_without_network() {
        let body = br#"{"key": "value"}"#;
        let hash = sha256_hex(body);
        let service = service_with_local(body, &hash);

        let (content, source) = service
            .get_hash_content(&hash, ItemType::Storage, FetchOptions::default())
            .await
            .unwrap();
        assert_eq!(source, ContentSource::Local);
        assert_eq!(content, body);
    }

    #[tokio::test]
    async fn missing_content_is_unavailable_not_invalid() {
        let engine = Arc::new(MemoryStorageEngine::new());
        let service = StorageService::new(engine, None, Vec::new());

        let options = FetchOptions {
            use_network: false,
            use_ipfs: false,
            ..FetchOptions::default()
        };
        let err = service
            .get_hash_content(&"a".repeat(64), ItemType::Storage, options)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::ContentUnavailable(_)));
    }

    #[tokio::test]
    async fn inline_message_content_is_decoded() {
        let engine = Arc::new(MemoryStorageEngine::new());
        let service = StorageService::new(engine, None, Vec::new());

        let content = service
            .get_message_content(ItemType::Inline, "irrelevant", Some(r#"{"a": 1}"#))
            .await
            .unwrap();
        assert_eq!(content.source, ContentSource::Inline);
        assert_eq!(content.value["a"], 1);
        assert_eq!(content.raw_size, 8);
    }

    #[tokio::test]
    async fn null_escape_in_fetched_content_is_rejected() {
        let engine = Arc::new(MemoryStorageEngine::new());
        let service = StorageService::new(engine, None, Vec::new());

        let err = service
            .get_message_content(ItemType::Inline, "irrelevant", Some(r#"{"a": "\u0000"}"#))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidContent(_)));
    }
}
