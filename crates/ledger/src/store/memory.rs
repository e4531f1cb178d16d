//! In-memory implementation of StreamStore

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::Notify;
use tracing::{debug, trace};

use super::store::*;
use crate::message::{Block, Cursor, Fields, MessageId, StreamEntry};

/// Internal pending-entry state
struct PendingState {
    consumer: String,
    delivery_count: u64,
    last_delivered_at: DateTime<Utc>,
}

/// Internal consumer group state
#[derive(Default)]
struct GroupState {
    last_delivered: MessageId,
    pending: BTreeMap<MessageId, PendingState>,
    /// Consumer name -> last time it read or claimed
    consumers: BTreeMap<String, DateTime<Utc>>,
}

impl GroupState {
    fn deliver(&mut self, id: MessageId, consumer: &str, now: DateTime<Utc>) {
        self.pending
            .entry(id)
            .and_modify(|p| {
                p.consumer = consumer.to_string();
                p.delivery_count += 1;
                p.last_delivered_at = now;
            })
            .or_insert_with(|| PendingState {
                consumer: consumer.to_string(),
                delivery_count: 1,
                last_delivered_at: now,
            });
    }
}

/// Internal stream state
#[derive(Default)]
struct StreamState {
    entries: BTreeMap<MessageId, Fields>,
    last_id: MessageId,
    groups: BTreeMap<String, GroupState>,
}

impl StreamState {
    fn position(&self, cursor: Cursor) -> MessageId {
        match cursor {
            Cursor::Latest => self.last_id,
            Cursor::After(id) => id,
        }
    }
}

fn now_millis() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

fn idle_since(at: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - at).to_std().unwrap_or_default()
}

fn no_group(stream: &str, group: &str) -> StoreError {
    StoreError::NoGroup {
        stream: stream.to_string(),
        group: group.to_string(),
    }
}

/// In-memory implementation of StreamStore
///
/// Streams live for the lifetime of the store. Blocking group reads wait on
/// a notification raised by every append, so a reader parked with
/// [`Block::Forever`] wakes as soon as any stream grows.
///
/// # Example
///
/// ```
/// use cannon_ledger::InMemoryStreamStore;
///
/// let store = InMemoryStreamStore::new();
/// assert_eq!(store.stream_count(), 0);
/// ```
pub struct InMemoryStreamStore {
    streams: RwLock<HashMap<String, StreamState>>,
    appended: Notify,
}

impl InMemoryStreamStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self {
            streams: RwLock::new(HashMap::new()),
            appended: Notify::new(),
        }
    }

    /// Get the number of streams
    pub fn stream_count(&self) -> usize {
        self.streams.read().len()
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        self.streams.write().clear();
    }

    fn try_read(
        &self,
        group: &str,
        consumer: &str,
        streams: &[&str],
        from: ReadFrom,
        count: Option<usize>,
    ) -> Result<Vec<StreamBatch>, StoreError> {
        let mut guard = self.streams.write();
        let now = Utc::now();
        let limit = read_limit(count).unwrap_or(usize::MAX);
        let mut batches = Vec::new();

        for stream in streams {
            let state = guard
                .get_mut(*stream)
                .ok_or_else(|| no_group(stream, group))?;
            let StreamState {
                entries, groups, ..
            } = state;
            let group_state = groups
                .get_mut(group)
                .ok_or_else(|| no_group(stream, group))?;
            group_state.consumers.insert(consumer.to_string(), now);

            let ids: Vec<MessageId> = match from {
                ReadFrom::New => entries
                    .range((Bound::Excluded(group_state.last_delivered), Bound::Unbounded))
                    .take(limit)
                    .map(|(id, _)| *id)
                    .collect(),
                ReadFrom::Backlog => group_state
                    .pending
                    .iter()
                    .filter(|(_, p)| p.consumer == consumer)
                    .take(limit)
                    .map(|(id, _)| *id)
                    .collect(),
            };

            let mut delivered = Vec::with_capacity(ids.len());
            for id in ids {
                group_state.deliver(id, consumer, now);
                if from == ReadFrom::New {
                    group_state.last_delivered = id;
                }
                if let Some(fields) = entries.get(&id) {
                    delivered.push(StreamEntry {
                        id,
                        fields: fields.clone(),
                    });
                }
            }

            if !delivered.is_empty() {
                trace!(stream = %stream, group, consumer, count = delivered.len(), "delivered entries");
                batches.push(StreamBatch {
                    stream: stream.to_string(),
                    entries: delivered,
                });
            }
        }

        Ok(batches)
    }
}

impl Default for InMemoryStreamStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StreamStore for InMemoryStreamStore {
    async fn append(
        &self,
        stream: &str,
        fields: Fields,
        id: IdRequest,
    ) -> Result<MessageId, StoreError> {
        let new_id = {
            let mut streams = self.streams.write();
            let state = streams.entry(stream.to_string()).or_default();
            let new_id = next_id(state.last_id, id, now_millis())?;
            state.entries.insert(new_id, fields);
            state.last_id = new_id;
            new_id
        };

        self.appended.notify_waiters();
        trace!(stream, id = %new_id, "appended entry");
        Ok(new_id)
    }

    async fn range(
        &self,
        stream: &str,
        start: MessageId,
        end: MessageId,
        count: Option<usize>,
    ) -> Result<Vec<StreamEntry>, StoreError> {
        if start > end {
            return Ok(vec![]);
        }

        let streams = self.streams.read();
        let Some(state) = streams.get(stream) else {
            return Ok(vec![]);
        };

        Ok(state
            .entries
            .range(start..=end)
            .take(count.unwrap_or(usize::MAX))
            .map(|(id, fields)| StreamEntry {
                id: *id,
                fields: fields.clone(),
            })
            .collect())
    }

    async fn stream_info(&self, stream: &str) -> Result<StreamInfo, StoreError> {
        let streams = self.streams.read();
        let state = streams
            .get(stream)
            .ok_or_else(|| StoreError::NoSuchStream(stream.to_string()))?;

        Ok(StreamInfo {
            length: state.entries.len(),
            first_id: state.entries.keys().next().copied(),
            last_id: state.entries.keys().next_back().copied(),
            last_generated_id: state.last_id,
            groups: state.groups.len(),
        })
    }

    async fn create_group(
        &self,
        stream: &str,
        group: &str,
        cursor: Cursor,
    ) -> Result<bool, StoreError> {
        let mut streams = self.streams.write();
        let state = streams.entry(stream.to_string()).or_default();
        if state.groups.contains_key(group) {
            return Ok(false);
        }

        let last_delivered = state.position(cursor);
        state.groups.insert(
            group.to_string(),
            GroupState {
                last_delivered,
                ..Default::default()
            },
        );
        debug!(stream, group, %cursor, "created consumer group");
        Ok(true)
    }

    async fn set_group_cursor(
        &self,
        stream: &str,
        group: &str,
        cursor: Cursor,
    ) -> Result<(), StoreError> {
        let mut streams = self.streams.write();
        let state = streams
            .get_mut(stream)
            .ok_or_else(|| no_group(stream, group))?;
        let position = state.position(cursor);
        let group_state = state
            .groups
            .get_mut(group)
            .ok_or_else(|| no_group(stream, group))?;

        group_state.last_delivered = position;
        Ok(())
    }

    async fn groups(&self, stream: &str) -> Result<Vec<GroupInfo>, StoreError> {
        let streams = self.streams.read();
        let state = streams
            .get(stream)
            .ok_or_else(|| StoreError::NoSuchStream(stream.to_string()))?;

        Ok(state
            .groups
            .iter()
            .map(|(name, g)| GroupInfo {
                name: name.clone(),
                consumers: g.consumers.len(),
                pending: g.pending.len(),
                last_delivered_id: g.last_delivered,
            })
            .collect())
    }

    async fn consumers(
        &self,
        stream: &str,
        group: &str,
    ) -> Result<Vec<ConsumerInfo>, StoreError> {
        let streams = self.streams.read();
        let group_state = streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .ok_or_else(|| no_group(stream, group))?;
        let now = Utc::now();

        Ok(group_state
            .consumers
            .iter()
            .map(|(name, seen_at)| ConsumerInfo {
                name: name.clone(),
                pending: group_state
                    .pending
                    .values()
                    .filter(|p| &p.consumer == name)
                    .count(),
                idle: idle_since(*seen_at, now),
            })
            .collect())
    }

    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        streams: &[&str],
        from: ReadFrom,
        count: Option<usize>,
        block: Block,
    ) -> Result<Vec<StreamBatch>, StoreError> {
        let deadline = match block {
            Block::For(timeout) => Some(tokio::time::Instant::now() + timeout),
            Block::Never | Block::Forever => None,
        };

        loop {
            // Register interest before checking so an append between the
            // check and the wait is not missed.
            let notified = self.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let batches = self.try_read(group, consumer, streams, from, count)?;
            if !batches.is_empty() || block == Block::Never || from == ReadFrom::Backlog {
                return Ok(batches);
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Ok(vec![]);
                    }
                }
                None => notified.await,
            }
        }
    }

    async fn ack(
        &self,
        stream: &str,
        group: &str,
        ids: &[MessageId],
    ) -> Result<usize, StoreError> {
        let mut streams = self.streams.write();
        let group_state = streams
            .get_mut(stream)
            .and_then(|s| s.groups.get_mut(group))
            .ok_or_else(|| no_group(stream, group))?;

        Ok(ids
            .iter()
            .filter(|id| group_state.pending.remove(id).is_some())
            .count())
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[MessageId],
    ) -> Result<Vec<StreamEntry>, StoreError> {
        let mut streams = self.streams.write();
        let state = streams
            .get_mut(stream)
            .ok_or_else(|| no_group(stream, group))?;
        let StreamState {
            entries, groups, ..
        } = state;
        let group_state = groups
            .get_mut(group)
            .ok_or_else(|| no_group(stream, group))?;
        let now = Utc::now();
        group_state.consumers.insert(consumer.to_string(), now);

        let mut claimed = Vec::new();
        for id in ids {
            let Some(pending) = group_state.pending.get_mut(id) else {
                continue;
            };
            if idle_since(pending.last_delivered_at, now) < min_idle {
                continue;
            }

            pending.consumer = consumer.to_string();
            pending.last_delivered_at = now;

            if let Some(fields) = entries.get(id) {
                claimed.push(StreamEntry {
                    id: *id,
                    fields: fields.clone(),
                });
            }
        }

        debug!(stream, group, consumer, count = claimed.len(), "claimed entries");
        Ok(claimed)
    }

    async fn pending(
        &self,
        stream: &str,
        group: &str,
        count: usize,
    ) -> Result<Vec<PendingEntry>, StoreError> {
        let streams = self.streams.read();
        let group_state = streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .ok_or_else(|| no_group(stream, group))?;
        let now = Utc::now();

        Ok(group_state
            .pending
            .iter()
            .take(count)
            .map(|(id, p)| PendingEntry {
                id: *id,
                consumer: p.consumer.clone(),
                idle: idle_since(p.last_delivered_at, now),
                delivery_count: p.delivery_count,
            })
            .collect())
    }
}
