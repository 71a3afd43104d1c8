//! STORE messages: pin a file by hash and maintain its revision tag.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgConnection;

use models::item_hash::{is_item_hash, item_type_from_hash};
use models::message::{timestamp_to_datetime, MessageContent};
use models::{ErrorCode, FileType, ItemType, StoreContent};

use crate::error::MessageProcessingError;
use crate::storage::{FetchOptions, StorageService};

use super::{ContentHandler, ValidatedMessage};

/// IPFS files below this size are downloaded like native storage items
/// instead of being pinned through the daemon.
const IPFS_DOWNLOAD_THRESHOLD: u64 = 1024 * 1024;

const IPFS_STAT_TIMEOUT: Duration = Duration::from_secs(5);
const IPFS_PIN_TIMEOUT: Duration = Duration::from_secs(120);

pub struct StoreHandler {
    storage: Arc<StorageService>,
    store_files: bool,
    grace_period_hours: i64,
}

impl StoreHandler {
    pub fn new(storage: Arc<StorageService>, store_files: bool, grace_period_hours: i64) -> Self {
        StoreHandler {
            storage,
            store_files,
            grace_period_hours,
        }
    }
}

fn store_content(
    message: &ValidatedMessage,
) -> Result<&StoreContent, MessageProcessingError> {
    match &message.content {
        MessageContent::Store(content) => Ok(content),
        _ => Err(MessageProcessingError::InvalidFormat(format!(
            "unexpected content type for store message: {}",
            message.row.item_hash
        ))),
    }
}

/// The tag a STORE message resolves to.
///
/// Without a `ref` the tag is the message's own item hash. With a `ref`
/// that is itself an item hash, the tag is the ref. Any other ref is a
/// user-defined name, namespaced by the owner.
pub fn make_file_tag(owner: &str, ref_: Option<&str>, item_hash: &str) -> String {
    match ref_ {
        None => item_hash.to_string(),
        Some(ref_) if is_item_hash(ref_) => ref_.to_string(),
        Some(ref_) => format!("{owner}/{ref_}"),
    }
}

#[async_trait]
impl ContentHandler for StoreHandler {
    async fn is_related_content_fetched(
        &self,
        _conn: &mut PgConnection,
        message: &ValidatedMessage,
    ) -> Result<bool, MessageProcessingError> {
        let content = store_content(message)?;
        Ok(self
            .storage
            .storage_engine()
            .exists(&content.item_hash)
            .await
            .map_err(|err| MessageProcessingError::Internal(err.into()))?)
    }

    async fn fetch_related_content(
        &self,
        conn: &mut PgConnection,
        message: &ValidatedMessage,
    ) -> Result<(), MessageProcessingError> {
        if !self.store_files {
            return Ok(());
        }

        let content = store_content(message)?;
        let item_hash = content.item_hash.as_str();
        let engine = content.item_type;

        let mut is_folder = false;
        let mut size: Option<i64> = None;
        let mut do_standard_lookup = true;

        if engine == ItemType::Ipfs {
            if !matches!(item_type_from_hash(item_hash), Ok(ItemType::Ipfs)) {
                return Err(MessageProcessingError::InvalidFormat(format!(
                    "invalid IPFS hash: '{item_hash}'"
                )));
            }

            if let Some(ipfs) = self.storage.ipfs_client() {
                match ipfs.files_stat(item_hash, IPFS_STAT_TIMEOUT).await {
                    Ok(stats) => {
                        let small_file = stats.object_type == "file"
                            && stats.cumulative_size < IPFS_DOWNLOAD_THRESHOLD
                            && item_hash.len() == 46;
                        if !small_file {
                            // Large objects and directories stay in the
                            // daemon; we only record their metadata.
                            is_folder = stats.object_type == "directory";
                            size = Some(stats.cumulative_size as i64);
                            ipfs.pin_add(item_hash, IPFS_PIN_TIMEOUT).await.map_err(
                                |err| {
                                    MessageProcessingError::FileUnavailable(format!(
                                        "could not pin IPFS content at this time: {err}"
                                    ))
                                },
                            )?;
                            do_standard_lookup = false;
                        }
                    }
                    Err(err) => {
                        tracing::warn!(%item_hash, %err, "could not stat IPFS hash");
                    }
                }
            }
        }

        if do_standard_lookup {
            let (file_content, _) = self
                .storage
                .get_hash_content(
                    item_hash,
                    engine,
                    FetchOptions {
                        timeout: Duration::from_secs(2),
                        ..FetchOptions::default()
                    },
                )
                .await
                .map_err(|err| {
                    MessageProcessingError::FileUnavailable(format!(
                        "could not retrieve file from storage at this time: {err}"
                    ))
                })?;
            size = Some(file_content.len() as i64);
        }

        node_sql::files::upsert_stored_file(
            conn,
            item_hash,
            size.unwrap_or(0),
            if is_folder {
                FileType::Directory
            } else {
                FileType::File
            },
        )
        .await?;
        Ok(())
    }

    async fn check_dependencies(
        &self,
        conn: &mut PgConnection,
        message: &ValidatedMessage,
    ) -> Result<(), MessageProcessingError> {
        let content = store_content(message)?;
        let Some(ref_) = content.ref_.as_deref() else {
            return Ok(());
        };

        // A user-defined ref is a tag name: revisions may arrive in any
        // order and nothing guarantees the original exists yet. An item
        // hash ref, however, must point at a live, non-revision STORE.
        if !is_item_hash(ref_) {
            return Ok(());
        }

        let ref_pin = node_sql::files::get_message_file_pin(conn, ref_)
            .await?
            .ok_or_else(|| MessageProcessingError::Dependency {
                code: ErrorCode::StoreRefNotFound,
                details: format!("store ref {ref_} not found"),
            })?;

        if ref_pin.ref_.is_some() {
            return Err(MessageProcessingError::Dependency {
                code: ErrorCode::StoreCannotUpdateStoreWithRef,
                details: format!("store ref {ref_} is itself a revision"),
            });
        }
        Ok(())
    }

    async fn check_permissions(
        &self,
        conn: &mut PgConnection,
        message: &ValidatedMessage,
    ) -> Result<(), MessageProcessingError> {
        if message.content.address() != message.row.sender {
            return Err(MessageProcessingError::PermissionDenied(format!(
                "sender {} cannot store on behalf of {}",
                message.row.sender,
                message.content.address()
            )));
        }

        let content = store_content(message)?;
        let Some(ref_) = content.ref_.as_deref() else {
            return Ok(());
        };

        let tag = make_file_tag(&content.address, Some(ref_), &message.row.item_hash);
        if let Some(existing) = node_sql::files::get_file_tag(conn, &tag).await? {
            if existing.owner != content.address {
                return Err(MessageProcessingError::PermissionDenied(format!(
                    "{} attempts to update a file tag belonging to another user",
                    message.row.item_hash
                )));
            }
        }
        Ok(())
    }

    async fn process(
        &self,
        conn: &mut PgConnection,
        message: &ValidatedMessage,
    ) -> Result<(), MessageProcessingError> {
        let content = store_content(message)?;
        let created = timestamp_to_datetime(content.time).unwrap_or(message.row.time);

        // When file storage is disabled the fetch stage did not catalog
        // the file; the pin still needs a row to reference.
        node_sql::files::upsert_stored_file(conn, &content.item_hash, 0, FileType::File).await?;
        node_sql::files::insert_message_file_pin(
            conn,
            &content.item_hash,
            &content.address,
            &message.row.item_hash,
            content.ref_.as_deref(),
            created,
        )
        .await?;

        let tag = make_file_tag(&content.address, content.ref_.as_deref(), &message.row.item_hash);
        node_sql::files::upsert_file_tag(conn, &tag, &content.address, &content.item_hash, created)
            .await?;

        let cost_rows = crate::costs::message_costs(conn, message).await?;
        node_sql::costs::upsert_costs(conn, &cost_rows).await?;
        Ok(())
    }

    async fn forget_message(
        &self,
        conn: &mut PgConnection,
        message: &ValidatedMessage,
    ) -> Result<(), MessageProcessingError> {
        let content = store_content(message)?;

        node_sql::files::delete_message_file_pin(conn, &message.row.item_hash).await?;
        let tag = make_file_tag(&content.address, content.ref_.as_deref(), &message.row.item_hash);
        node_sql::files::refresh_file_tag(conn, &tag).await?;

        // Instead of deleting the blob right away, the last pin is replaced
        // by a grace-period pin: a re-announcement inside the window then
        // avoids a fetch round-trip. The GC sweeps expired grace pins.
        if !node_sql::files::is_pinned_file(conn, &content.item_hash).await? {
            let now = Utc::now();
            node_sql::files::insert_grace_period_file_pin(
                conn,
                &content.item_hash,
                now,
                now + chrono::Duration::hours(self.grace_period_hours),
            )
            .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const ITEM_HASH: &str = "24a1bd1737564e7d5ebbcdbca3eb1a21f04b40903a7b9ea1b73e0a6cc5e10a3e";
    const FILE_HASH: &str = "a1b2c3d4e5f6a1b2c3d4e5f6a1b2c3d4e5f6a1b2c3d4e5f6a1b2c3d4e5f6a1b2";

    #[test]
    fn tag_defaults_to_the_item_hash() {
        assert_eq!(make_file_tag("0xowner", None, ITEM_HASH), ITEM_HASH);
    }

    #[test]
    fn hash_refs_become_the_tag_directly() {
        assert_eq!(
            make_file_tag("0xowner", Some(FILE_HASH), ITEM_HASH),
            FILE_HASH
        );
    }

    #[test]
    fn user_defined_refs_are_namespaced_by_owner() {
        assert_eq!(
            make_file_tag("0xowner", Some("my-website"), ITEM_HASH),
            "0xowner/my-website"
        );
    }
}
