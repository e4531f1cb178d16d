//! # Cannon Ledger
//!
//! Durable, ordered message channels for bot services, consumed through
//! consumer groups with acknowledgment and backlog reclaim.
//!
//! ## Features
//!
//! - **Per-service channels**: `log`, `data`, `inbox` and `taskback` streams under one namespace
//! - **Consumer groups**: a cursor per stream plus a pending-entries table per group
//! - **At-least-once delivery**: entries stay pending until acknowledged or claimed
//! - **Pluggable stores**: in-memory for a single process, PostgreSQL across hosts
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Ledger                              │
//! │  (channel -> stream key map, group cursor, write/read/ack)  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       StreamStore                            │
//! │  (append, group read, pending, claim: memory or PostgreSQL) │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use cannon_ledger::prelude::*;
//!
//! let store = Arc::new(PostgresStreamStore::new(pool));
//! let ledger = Ledger::open(store, LedgerConfig::from_env("demo-bot")).await?;
//!
//! ledger.write(Channel::Data, fields).await?;
//! for message in ledger.read(Channel::Data, Some(1), Block::from_millis(1000)).await? {
//!     // ...
//!     ledger.ack(message.channel, &[message.id]).await?;
//! }
//! ```

pub mod ledger;
pub mod message;
pub mod naming;
pub mod store;

/// Prelude for common imports
pub mod prelude {
    pub use crate::ledger::{CursorChange, Ledger, LedgerConfig, LedgerError, WriteOptions};
    pub use crate::message::{Block, Channel, Cursor, Fields, Message, MessageId};
    pub use crate::store::{
        InMemoryStreamStore, PendingEntry, PostgresStreamStore, StoreError, StreamStore,
    };
    pub use std::sync::Arc;
}

// Re-export key types at crate root
pub use ledger::{
    ChannelInfo, CursorChange, Ledger, LedgerConfig, LedgerError, LedgerInfo, WriteOptions,
    DEFAULT_GROUP, DEFAULT_NAMESPACE,
};
pub use message::{
    is_reserved_field, Block, Channel, Cursor, Fields, Message, MessageId, ParseIdError,
    StreamEntry, UnknownChannel, RESERVED_PREFIX, SERVICE_NAME_FIELD, STATUS_ERROR, STATUS_FIELD,
    STATUS_OK,
};
pub use naming::{NameError, StreamKey};
pub use store::{
    ConsumerInfo, GroupInfo, IdRequest, InMemoryStreamStore, PendingEntry, PollConfig,
    PostgresStreamStore, ReadFrom, StoreError, StreamBatch, StreamInfo, StreamStore,
};
