//! StreamStore trait definition

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::message::{Block, Cursor, Fields, MessageId, StreamEntry};

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Stream does not exist
    #[error("no such stream: {0}")]
    NoSuchStream(String),

    /// Consumer group does not exist on the stream
    #[error("no consumer group {group:?} on stream {stream:?}")]
    NoGroup { stream: String, group: String },

    /// Requested id is not greater than the stream's last id
    #[error("requested id {requested} is not greater than last id {last}")]
    IdNotMonotonic {
        requested: MessageId,
        last: MessageId,
    },

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// How the id of a new entry is chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdRequest {
    /// Current time, with a sequence bump when the clock has not moved past the last id
    Auto,
    /// A specific millisecond timestamp; the store picks the sequence
    AtMillis(u64),
}

/// Choose the id for a new entry given the stream's last id
///
/// Ids only move forward: a timestamp at or behind the last id reuses its
/// millisecond with the next sequence, and an explicit timestamp strictly
/// behind the last id is rejected.
pub(crate) fn next_id(
    last: MessageId,
    request: IdRequest,
    now_ms: u64,
) -> Result<MessageId, StoreError> {
    let ms = match request {
        IdRequest::Auto => now_ms.max(last.ms),
        IdRequest::AtMillis(ms) => ms,
    };

    if ms > last.ms {
        Ok(MessageId::new(ms, 0))
    } else if ms == last.ms {
        Ok(last.next_in_ms())
    } else {
        Err(StoreError::IdNotMonotonic {
            requested: MessageId::new(ms, 0),
            last,
        })
    }
}

/// Per-stream limit of a group read; zero means no limit, like `COUNT 0`
pub(crate) fn read_limit(count: Option<usize>) -> Option<usize> {
    count.filter(|&n| n > 0)
}

/// Which entries a group read returns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadFrom {
    /// Entries never delivered to the group
    New,
    /// Entries already delivered to this consumer and still pending
    Backlog,
}

/// Entries read from one stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamBatch {
    pub stream: String,
    pub entries: Vec<StreamEntry>,
}

/// A delivered but unacknowledged entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingEntry {
    pub id: MessageId,
    /// Consumer currently owning the entry
    pub consumer: String,
    /// Time since the entry was last delivered or claimed
    pub idle: Duration,
    /// Number of times the entry has been delivered
    pub delivery_count: u64,
}

/// Stream metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamInfo {
    pub length: usize,
    pub first_id: Option<MessageId>,
    pub last_id: Option<MessageId>,
    pub last_generated_id: MessageId,
    pub groups: usize,
}

/// Consumer group metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupInfo {
    pub name: String,
    pub consumers: usize,
    pub pending: usize,
    pub last_delivered_id: MessageId,
}

/// Consumer metadata within a group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerInfo {
    pub name: String,
    pub pending: usize,
    pub idle: Duration,
}

/// Store of append-only streams with consumer groups
///
/// Implementations provide the atomicity of append, cursor advance and
/// pending-set mutation. They must be safe for concurrent use from many
/// workers.
#[async_trait]
pub trait StreamStore: Send + Sync + 'static {
    // =========================================================================
    // Stream Operations
    // =========================================================================

    /// Append an entry, creating the stream if needed
    async fn append(
        &self,
        stream: &str,
        fields: Fields,
        id: IdRequest,
    ) -> Result<MessageId, StoreError>;

    /// Entries with `start <= id <= end`, oldest first
    async fn range(
        &self,
        stream: &str,
        start: MessageId,
        end: MessageId,
        count: Option<usize>,
    ) -> Result<Vec<StreamEntry>, StoreError>;

    /// Stream metadata
    async fn stream_info(&self, stream: &str) -> Result<StreamInfo, StoreError>;

    // =========================================================================
    // Consumer Group Operations
    // =========================================================================

    /// Create a consumer group if absent, creating the stream if needed
    ///
    /// Returns whether the group was created.
    async fn create_group(
        &self,
        stream: &str,
        group: &str,
        cursor: Cursor,
    ) -> Result<bool, StoreError>;

    /// Move an existing group's cursor
    async fn set_group_cursor(
        &self,
        stream: &str,
        group: &str,
        cursor: Cursor,
    ) -> Result<(), StoreError>;

    /// Groups defined on a stream
    async fn groups(&self, stream: &str) -> Result<Vec<GroupInfo>, StoreError>;

    /// Consumers known to a group
    async fn consumers(&self, stream: &str, group: &str)
        -> Result<Vec<ConsumerInfo>, StoreError>;

    /// Read up to `count` entries per stream for `consumer`
    ///
    /// `Some(0)` reads without a limit. New entries are recorded as pending for the consumer. Backlog reads
    /// never block.
    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        streams: &[&str],
        from: ReadFrom,
        count: Option<usize>,
        block: Block,
    ) -> Result<Vec<StreamBatch>, StoreError>;

    /// Remove ids from the group's pending set, returning how many were pending
    async fn ack(&self, stream: &str, group: &str, ids: &[MessageId])
        -> Result<usize, StoreError>;

    /// Transfer pending ids idle for at least `min_idle` to `consumer`
    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[MessageId],
    ) -> Result<Vec<StreamEntry>, StoreError>;

    /// Up to `count` pending entries, oldest id first
    async fn pending(
        &self,
        stream: &str,
        group: &str,
        count: usize,
    ) -> Result<Vec<PendingEntry>, StoreError>;
}
