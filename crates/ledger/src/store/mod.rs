//! Persistence layer for streams and consumer groups
//!
//! This module provides:
//! - [`StreamStore`] trait for the stream primitives the ledger needs
//! - [`InMemoryStreamStore`] for single-process deployments and tests
//! - [`PostgresStreamStore`] for streams shared between hosts

mod memory;
mod postgres;
#[allow(clippy::module_inception)]
mod store;

pub use memory::InMemoryStreamStore;
pub use postgres::{PollConfig, PostgresStreamStore};
pub use store::{
    ConsumerInfo, GroupInfo, IdRequest, PendingEntry, ReadFrom, StoreError, StreamBatch,
    StreamInfo, StreamStore,
};
