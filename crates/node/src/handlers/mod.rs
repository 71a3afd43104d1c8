//! Per-type content handlers.
//!
//! Each message type implements the same capability set: resolve related
//! content, check dependencies and permissions, apply the message to the
//! derived state, and undo it on FORGET. Handlers are dispatched from a
//! registry keyed by message type.

pub mod aggregate;
pub mod forget;
pub mod post;
pub mod store;
pub mod vm;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::PgConnection;

use crate::config::NodeConfig;
use crate::error::MessageProcessingError;
use crate::storage::StorageService;
use models::message::MessageContent;
use models::MessageType;
use node_sql::messages::MessageRow;

/// A message whose content has been fetched and type-checked.
#[derive(Debug, Clone)]
pub struct ValidatedMessage {
    pub row: MessageRow,
    pub content: MessageContent,
}

impl ValidatedMessage {
    /// Rebuilds the parsed view from a stored row, used when forgetting.
    pub fn from_row(row: MessageRow) -> Result<Self, MessageProcessingError> {
        let content =
            MessageContent::parse(row.message_type, &row.content.0, &row.sender, row.time)
                .map_err(|err| MessageProcessingError::InvalidFormat(err.to_string()))?;
        Ok(ValidatedMessage { row, content })
    }
}

#[async_trait]
pub trait ContentHandler: Send + Sync {
    /// Whether everything the message needs is already available locally.
    /// Used at admission to short-circuit the fetch stage for inline
    /// messages without remote dependencies.
    async fn is_related_content_fetched(
        &self,
        _conn: &mut PgConnection,
        _message: &ValidatedMessage,
    ) -> Result<bool, MessageProcessingError> {
        Ok(true)
    }

    /// Fetches the content the message references (e.g. the file of a
    /// STORE message).
    async fn fetch_related_content(
        &self,
        _conn: &mut PgConnection,
        _message: &ValidatedMessage,
    ) -> Result<(), MessageProcessingError> {
        Ok(())
    }

    /// Verifies that everything the message depends on has already been
    /// processed.
    async fn check_dependencies(
        &self,
        _conn: &mut PgConnection,
        _message: &ValidatedMessage,
    ) -> Result<(), MessageProcessingError> {
        Ok(())
    }

    /// Verifies the sender may perform this write. The base rule is that
    /// the content address must be the message sender.
    async fn check_permissions(
        &self,
        _conn: &mut PgConnection,
        message: &ValidatedMessage,
    ) -> Result<(), MessageProcessingError> {
        if message.content.address() != message.row.sender {
            return Err(MessageProcessingError::PermissionDenied(format!(
                "sender {} cannot write on behalf of {}",
                message.row.sender,
                message.content.address()
            )));
        }
        Ok(())
    }

    /// Applies the message to the derived state.
    async fn process(
        &self,
        conn: &mut PgConnection,
        message: &ValidatedMessage,
    ) -> Result<(), MessageProcessingError>;

    /// Undoes the effects of a previously processed message.
    async fn forget_message(
        &self,
        _conn: &mut PgConnection,
        _message: &ValidatedMessage,
    ) -> Result<(), MessageProcessingError> {
        Ok(())
    }
}

#[derive(Clone)]
pub struct ContentHandlers {
    handlers: HashMap<MessageType, Arc<dyn ContentHandler>>,
}

impl ContentHandlers {
    pub fn new(storage: Arc<StorageService>, config: &NodeConfig) -> Self {
        let mut base: HashMap<MessageType, Arc<dyn ContentHandler>> = HashMap::new();
        base.insert(
            MessageType::Aggregate,
            Arc::new(aggregate::AggregateHandler),
        );
        base.insert(
            MessageType::Post,
            Arc::new(post::PostHandler::new(
                config.aleph.balances.addresses.clone(),
                config.aleph.balances.post_type.clone(),
                config.aleph.credits.clone(),
            )),
        );
        base.insert(
            MessageType::Store,
            Arc::new(store::StoreHandler::new(
                storage.clone(),
                config.storage.store_files,
                config.storage.grace_period,
            )),
        );
        let vm_handler = Arc::new(vm::VmHandler);
        base.insert(MessageType::Instance, vm_handler.clone());
        base.insert(MessageType::Program, vm_handler);

        let forget = Arc::new(forget::ForgetHandler::new(base.clone()));
        let mut handlers = base;
        handlers.insert(MessageType::Forget, forget);

        ContentHandlers { handlers }
    }

    pub fn get(&self, message_type: MessageType) -> &Arc<dyn ContentHandler> {
        self.handlers
            .get(&message_type)
            .expect("every message type has a registered handler")
    }
}
