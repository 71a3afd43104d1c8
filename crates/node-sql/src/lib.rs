//! SQL accessors of the node.
//!
//! Every function takes a `&mut PgConnection` so that callers decide the
//! transaction boundaries: the message pipeline runs admission, projection
//! updates and status transitions of one message inside a single
//! transaction.

pub mod aggregates;
pub mod balances;
pub mod chains;
pub mod costs;
pub mod files;
pub mod messages;
pub mod pending_messages;
pub mod posts;
pub mod vms;

pub use sqlx::types::Json;
