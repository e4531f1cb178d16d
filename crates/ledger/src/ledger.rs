//! Per-service ledger over a fixed set of channels
//!
//! A [`Ledger`] binds one service's channels to their streams and to a single
//! consumer group, and is the only path through which producers and workers
//! touch the store.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::message::{
    is_reserved_field, Block, Channel, Cursor, Fields, Message, MessageId, RESERVED_PREFIX,
    SERVICE_NAME_FIELD, STATUS_FIELD, STATUS_OK,
};
use crate::naming::{NameError, StreamKey};
use crate::store::{
    ConsumerInfo, GroupInfo, IdRequest, PendingEntry, ReadFrom, StoreError, StreamInfo,
    StreamStore,
};

/// Default namespace for stream keys
pub const DEFAULT_NAMESPACE: &str = "DEFAULT";

/// Default consumer group shared by all workers of a service
pub const DEFAULT_GROUP: &str = "CANNON";

/// Error type for ledger operations
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// Channel is not part of this ledger's configuration
    #[error("channel {channel} is not configured for service {service:?}")]
    UnknownChannel { channel: Channel, service: String },

    /// Payload key lies in the ledger's metadata namespace
    #[error("payload field {key:?} uses the reserved prefix {prefix:?}")]
    ReservedField { key: String, prefix: &'static str },

    /// Invalid namespace or service name
    #[error(transparent)]
    Name(#[from] NameError),

    /// Store error
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Ledger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Namespace prefix of every stream key
    pub namespace: String,

    /// Service whose channels this ledger covers
    pub service_name: String,

    /// Consumer group name
    pub group: String,

    /// Consumer name used for reads, acks and claims
    pub consumer: String,

    /// Configured channels
    pub channels: Vec<Channel>,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            service_name: "cannon".to_string(),
            group: DEFAULT_GROUP.to_string(),
            consumer: "cannon".to_string(),
            channels: vec![Channel::Log, Channel::Data, Channel::Taskback],
        }
    }
}

impl LedgerConfig {
    /// Configuration for `service_name` with the default channels
    pub fn new(service_name: impl Into<String>) -> Self {
        let service_name = service_name.into();
        Self {
            consumer: service_name.clone(),
            service_name,
            ..Default::default()
        }
    }

    /// Read namespace, group and consumer overrides from the environment
    ///
    /// - `CANNON_NAMESPACE`
    /// - `CANNON_GROUP`
    /// - `CANNON_CONSUMER`
    pub fn from_env(service_name: impl Into<String>) -> Self {
        let mut config = Self::new(service_name);
        if let Ok(namespace) = std::env::var("CANNON_NAMESPACE") {
            config.namespace = namespace;
        }
        if let Ok(group) = std::env::var("CANNON_GROUP") {
            config.group = group;
        }
        if let Ok(consumer) = std::env::var("CANNON_CONSUMER") {
            config.consumer = consumer;
        }
        config
    }

    /// Set namespace
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Set consumer group
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    /// Set consumer name
    pub fn with_consumer(mut self, consumer: impl Into<String>) -> Self {
        self.consumer = consumer.into();
        self
    }

    /// Set channels
    pub fn with_channels(mut self, channels: impl IntoIterator<Item = Channel>) -> Self {
        self.channels = channels.into_iter().collect();
        self.channels.sort();
        self.channels.dedup();
        self
    }
}

/// Outcome of [`Ledger::init_cursor`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorChange {
    /// Groups were created or their cursor was moved
    Changed,
    /// The group already existed; existing cursors were left alone and
    /// only streams missing the group got one
    Unchanged,
}

/// Extra options for [`Ledger::write_with`]
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    /// Status stored with the entry ("OK" when unset)
    pub status: Option<String>,
    /// Requested timestamp for the entry id
    pub at: Option<DateTime<Utc>>,
}

impl WriteOptions {
    pub fn status(status: impl Into<String>) -> Self {
        Self {
            status: Some(status.into()),
            at: None,
        }
    }

    pub fn with_at(mut self, at: DateTime<Utc>) -> Self {
        self.at = Some(at);
        self
    }
}

/// Introspection for one channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub channel: Channel,
    pub stream: String,
    /// `None` when the stream has not been created yet
    pub stream_info: Option<StreamInfo>,
    pub groups: Vec<GroupInfo>,
    /// Consumers of this ledger's group
    pub consumers: Vec<ConsumerInfo>,
}

/// Introspection for a whole ledger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerInfo {
    pub service_name: String,
    pub group: String,
    pub channels: Vec<ChannelInfo>,
}

/// Per-service view of the stream store
///
/// Cloning is cheap; clones share the store and the channel map.
///
/// # Example
///
/// ```
/// # #[tokio::main]
/// # async fn main() {
/// use std::sync::Arc;
/// use cannon_ledger::{Block, Channel, Fields, InMemoryStreamStore, Ledger, LedgerConfig};
///
/// let store = Arc::new(InMemoryStreamStore::new());
/// let ledger = Ledger::open(store, LedgerConfig::new("demo-bot")).await.unwrap();
///
/// let mut data = Fields::new();
/// data.insert("text".into(), "hello".into());
/// ledger.write(Channel::Data, data).await.unwrap();
///
/// let messages = ledger.read(Channel::Data, Some(1), Block::Never).await.unwrap();
/// assert_eq!(messages[0].get("text"), Some("hello"));
/// # }
/// ```
#[derive(Clone)]
pub struct Ledger {
    store: Arc<dyn StreamStore>,
    config: Arc<LedgerConfig>,
    keys: Arc<BTreeMap<Channel, StreamKey>>,
    by_key: Arc<HashMap<String, Channel>>,
    consumer: String,
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger")
            .field("service_name", &self.config.service_name)
            .field("group", &self.config.group)
            .field("consumer", &self.consumer)
            .field("channels", &self.keys.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Ledger {
    /// Build a ledger without touching the store
    ///
    /// Fails when the namespace or service name cannot form stream keys.
    pub fn new(store: Arc<dyn StreamStore>, config: LedgerConfig) -> Result<Self, LedgerError> {
        let mut keys = BTreeMap::new();
        let mut by_key = HashMap::new();
        for channel in &config.channels {
            let key = StreamKey::new(&config.namespace, &config.service_name, *channel)?;
            by_key.insert(key.as_str().to_string(), *channel);
            keys.insert(*channel, key);
        }

        Ok(Self {
            store,
            consumer: config.consumer.clone(),
            config: Arc::new(config),
            keys: Arc::new(keys),
            by_key: Arc::new(by_key),
        })
    }

    /// Build a ledger and make sure its consumer groups exist
    pub async fn open(
        store: Arc<dyn StreamStore>,
        config: LedgerConfig,
    ) -> Result<Self, LedgerError> {
        let ledger = Self::new(store, config)?;
        ledger.init_cursor(false, Cursor::Latest).await?;
        Ok(ledger)
    }

    /// A handle on the same streams and group reading as `consumer`
    pub fn with_consumer(&self, consumer: impl Into<String>) -> Self {
        Self {
            consumer: consumer.into(),
            ..self.clone()
        }
    }

    pub fn service_name(&self) -> &str {
        &self.config.service_name
    }

    pub fn namespace(&self) -> &str {
        &self.config.namespace
    }

    pub fn group(&self) -> &str {
        &self.config.group
    }

    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    pub fn store(&self) -> &Arc<dyn StreamStore> {
        &self.store
    }

    /// Configured channels in order
    pub fn channels(&self) -> impl Iterator<Item = Channel> + '_ {
        self.keys.keys().copied()
    }

    pub fn has_channel(&self, channel: Channel) -> bool {
        self.keys.contains_key(&channel)
    }

    /// Stream key of a configured channel
    pub fn stream_key(&self, channel: Channel) -> Result<&StreamKey, LedgerError> {
        self.keys
            .get(&channel)
            .ok_or_else(|| LedgerError::UnknownChannel {
                channel,
                service: self.config.service_name.clone(),
            })
    }

    // =========================================================================
    // Cursor
    // =========================================================================

    /// Create the consumer group on every stream, or move its cursor
    ///
    /// When the group exists on at least one stream and `force` is not set,
    /// existing cursors stay where they are and the group is only created on
    /// streams that lack it. Errors while inspecting groups count as "absent".
    #[instrument(skip(self), fields(service = %self.config.service_name))]
    pub async fn init_cursor(
        &self,
        force: bool,
        cursor: Cursor,
    ) -> Result<CursorChange, LedgerError> {
        let group = &self.config.group;
        let mut missing = Vec::new();

        for key in self.keys.values() {
            match self.store.groups(key.as_str()).await {
                Ok(groups) if groups.iter().any(|g| &g.name == group) => {}
                Ok(_) => missing.push(key),
                Err(e) => {
                    debug!(stream = %key, error = %e, "group lookup failed, treating as absent");
                    missing.push(key);
                }
            }
        }

        let exists = missing.len() < self.keys.len();
        if exists && !force {
            for key in missing {
                if self.store.create_group(key.as_str(), group, cursor).await? {
                    info!(stream = %key, group = %group, %cursor, "created missing consumer group");
                }
            }
            return Ok(CursorChange::Unchanged);
        }

        for key in self.keys.values() {
            let created = self.store.create_group(key.as_str(), group, cursor).await?;
            if !created {
                self.store
                    .set_group_cursor(key.as_str(), group, cursor)
                    .await?;
            }
        }

        info!(group = %group, %cursor, force, "initialized consumer group cursor");
        Ok(CursorChange::Changed)
    }

    // =========================================================================
    // Write
    // =========================================================================

    /// Append `data` to `channel` with status "OK"
    pub async fn write(&self, channel: Channel, data: Fields) -> Result<MessageId, LedgerError> {
        self.write_with(channel, data, WriteOptions::default()).await
    }

    /// Append `data` to `channel` with an explicit status and/or timestamp
    ///
    /// A timestamp older than the stream's last entry is rejected with
    /// [`StoreError::IdNotMonotonic`].
    #[instrument(skip(self, data), fields(service = %self.config.service_name))]
    pub async fn write_with(
        &self,
        channel: Channel,
        mut data: Fields,
        options: WriteOptions,
    ) -> Result<MessageId, LedgerError> {
        let key = self.stream_key(channel)?;

        if let Some(reserved) = data.keys().find(|k| is_reserved_field(k)) {
            return Err(LedgerError::ReservedField {
                key: reserved.clone(),
                prefix: RESERVED_PREFIX,
            });
        }

        data.insert(
            SERVICE_NAME_FIELD.to_string(),
            self.config.service_name.clone(),
        );
        data.insert(
            STATUS_FIELD.to_string(),
            options.status.unwrap_or_else(|| STATUS_OK.to_string()),
        );

        let request = match options.at {
            Some(at) => IdRequest::AtMillis(at.timestamp_millis().max(0) as u64),
            None => IdRequest::Auto,
        };

        let id = self.store.append(key.as_str(), data, request).await?;
        debug!(stream = %key, %id, "wrote message");
        Ok(id)
    }

    // =========================================================================
    // Read
    // =========================================================================

    /// Read up to `count` undelivered messages from `channel`
    pub async fn read(
        &self,
        channel: Channel,
        count: Option<usize>,
        block: Block,
    ) -> Result<Vec<Message>, LedgerError> {
        let key = self.stream_key(channel)?;
        self.read_streams(&[key.as_str()], ReadFrom::New, count, block)
            .await
    }

    /// Re-read this consumer's own pending messages on `channel`
    pub async fn read_backlog(
        &self,
        channel: Channel,
        count: Option<usize>,
    ) -> Result<Vec<Message>, LedgerError> {
        let key = self.stream_key(channel)?;
        self.read_streams(&[key.as_str()], ReadFrom::Backlog, count, Block::Never)
            .await
    }

    /// Read undelivered messages from every configured channel
    pub async fn read_all(
        &self,
        count: Option<usize>,
        block: Block,
    ) -> Result<Vec<Message>, LedgerError> {
        let streams: Vec<&str> = self.keys.values().map(StreamKey::as_str).collect();
        self.read_streams(&streams, ReadFrom::New, count, block)
            .await
    }

    async fn read_streams(
        &self,
        streams: &[&str],
        from: ReadFrom,
        count: Option<usize>,
        block: Block,
    ) -> Result<Vec<Message>, LedgerError> {
        let batches = self
            .store
            .read_group(&self.config.group, &self.consumer, streams, from, count, block)
            .await?;

        let mut messages = Vec::new();
        for batch in batches {
            let Some(channel) = self.by_key.get(&batch.stream).copied() else {
                warn!(stream = %batch.stream, "read returned an unknown stream");
                continue;
            };
            messages.extend(
                batch
                    .entries
                    .into_iter()
                    .map(|entry| Message::from_entry(&batch.stream, channel, entry)),
            );
        }
        Ok(messages)
    }

    /// Time-window scan of `channel`, independent of any group
    pub async fn range(
        &self,
        channel: Channel,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<Message>, LedgerError> {
        let key = self.stream_key(channel)?;
        let start = MessageId::new(since.timestamp_millis().max(0) as u64, 0);
        let end = MessageId::new(until.timestamp_millis().max(0) as u64, u64::MAX);

        let entries = self.store.range(key.as_str(), start, end, None).await?;
        Ok(entries
            .into_iter()
            .map(|entry| Message::from_entry(key.as_str(), channel, entry))
            .collect())
    }

    /// Messages written to `channel` during the last `window`
    pub async fn recent(
        &self,
        channel: Channel,
        window: Duration,
    ) -> Result<Vec<Message>, LedgerError> {
        let until = Utc::now();
        let since = chrono::Duration::from_std(window)
            .ok()
            .and_then(|window| until.checked_sub_signed(window))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        self.range(channel, since, until).await
    }

    // =========================================================================
    // Acknowledge
    // =========================================================================

    /// Acknowledge `ids` on `channel`
    ///
    /// Returns `None` when the channel is not configured.
    pub async fn ack(
        &self,
        channel: Channel,
        ids: &[MessageId],
    ) -> Result<Option<usize>, LedgerError> {
        let Some(key) = self.keys.get(&channel) else {
            warn!(%channel, service = %self.config.service_name, "ack on unconfigured channel");
            return Ok(None);
        };
        let acked = self.store.ack(key.as_str(), &self.config.group, ids).await?;
        Ok(Some(acked))
    }

    /// Acknowledge `ids` on the stream with this exact key
    ///
    /// Returns `None` when the key is not one of this ledger's streams.
    pub async fn ack_stream(
        &self,
        stream: &str,
        ids: &[MessageId],
    ) -> Result<Option<usize>, LedgerError> {
        match self.by_key.get(stream) {
            Some(channel) => self.ack(*channel, ids).await,
            None => {
                warn!(stream, "ack on unknown stream");
                Ok(None)
            }
        }
    }

    // =========================================================================
    // Pending and claim
    // =========================================================================

    /// Up to `count` pending entries per channel
    pub async fn pending(
        &self,
        count: usize,
    ) -> Result<BTreeMap<Channel, Vec<PendingEntry>>, LedgerError> {
        let mut pending = BTreeMap::new();
        for (channel, key) in self.keys.iter() {
            let entries = self
                .store
                .pending(key.as_str(), &self.config.group, count)
                .await?;
            pending.insert(*channel, entries);
        }
        Ok(pending)
    }

    /// Every pending entry of every channel
    pub async fn list_pending(&self) -> Result<BTreeMap<Channel, Vec<PendingEntry>>, LedgerError> {
        self.pending(usize::MAX).await
    }

    /// Take over pending `ids` idle for at least `min_idle`
    #[instrument(skip(self, ids), fields(consumer = %self.consumer))]
    pub async fn claim(
        &self,
        channel: Channel,
        ids: &[MessageId],
        min_idle: Duration,
    ) -> Result<Vec<Message>, LedgerError> {
        let key = self.stream_key(channel)?;
        let entries = self
            .store
            .claim(key.as_str(), &self.config.group, &self.consumer, min_idle, ids)
            .await?;

        Ok(entries
            .into_iter()
            .map(|entry| Message::from_entry(key.as_str(), channel, entry))
            .collect())
    }

    /// Claim up to `count` pending entries on `channel` idle for at least `min_idle`
    pub async fn claim_pending(
        &self,
        channel: Channel,
        count: usize,
        min_idle: Duration,
    ) -> Result<Vec<Message>, LedgerError> {
        let key = self.stream_key(channel)?;
        let ids: Vec<MessageId> = self
            .store
            .pending(key.as_str(), &self.config.group, count)
            .await?
            .into_iter()
            .filter(|p| p.idle >= min_idle)
            .map(|p| p.id)
            .collect();

        if ids.is_empty() {
            return Ok(vec![]);
        }
        self.claim(channel, &ids, min_idle).await
    }

    /// Acknowledge up to `count` pending entries per channel without processing them
    pub async fn churn_pending(&self, count: usize) -> Result<usize, LedgerError> {
        let mut total = 0;
        for (channel, entries) in self.pending(count).await? {
            if entries.is_empty() {
                continue;
            }
            let ids: Vec<MessageId> = entries.iter().map(|p| p.id).collect();
            total += self.ack(channel, &ids).await?.unwrap_or(0);
        }

        if total > 0 {
            info!(count = total, service = %self.config.service_name, "churned pending entries");
        }
        Ok(total)
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    /// Stream, group and consumer details for every channel
    pub async fn info(&self) -> Result<LedgerInfo, LedgerError> {
        let mut channels = Vec::with_capacity(self.keys.len());

        for (channel, key) in self.keys.iter() {
            let stream_info = match self.store.stream_info(key.as_str()).await {
                Ok(info) => Some(info),
                Err(StoreError::NoSuchStream(_)) => None,
                Err(e) => return Err(e.into()),
            };
            let groups = match self.store.groups(key.as_str()).await {
                Ok(groups) => groups,
                Err(StoreError::NoSuchStream(_)) => vec![],
                Err(e) => return Err(e.into()),
            };
            let consumers = match self.store.consumers(key.as_str(), &self.config.group).await {
                Ok(consumers) => consumers,
                Err(StoreError::NoGroup { .. }) => vec![],
                Err(e) => return Err(e.into()),
            };

            channels.push(ChannelInfo {
                channel: *channel,
                stream: key.to_string(),
                stream_info,
                groups,
                consumers,
            });
        }

        Ok(LedgerInfo {
            service_name: self.config.service_name.clone(),
            group: self.config.group.clone(),
            channels,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStreamStore;

    fn fields(pairs: &[(&str, &str)]) -> Fields {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    async fn ledger(service: &str) -> Ledger {
        Ledger::open(Arc::new(InMemoryStreamStore::new()), LedgerConfig::new(service))
            .await
            .unwrap()
    }

    #[test]
    fn test_default_config() {
        let config = LedgerConfig::new("bot");
        assert_eq!(config.namespace, "DEFAULT");
        assert_eq!(config.group, "CANNON");
        assert_eq!(config.consumer, "bot");
        assert_eq!(
            config.channels,
            vec![Channel::Log, Channel::Data, Channel::Taskback]
        );
    }

    #[test]
    fn test_invalid_service_name() {
        let err = Ledger::new(
            Arc::new(InMemoryStreamStore::new()),
            LedgerConfig::new("bad:name"),
        )
        .unwrap_err();
        assert!(matches!(err, LedgerError::Name(_)));
    }

    #[tokio::test]
    async fn test_write_adds_reserved_fields() {
        let ledger = ledger("bot").await;
        ledger
            .write(Channel::Data, fields(&[("text", "hi")]))
            .await
            .unwrap();

        let messages = ledger.read(Channel::Data, None, Block::Never).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].service_name, "bot");
        assert_eq!(messages[0].status, "OK");
        assert_eq!(messages[0].channel, Channel::Data);
        assert_eq!(messages[0].stream, "DEFAULT|streams:bot:data");
    }

    #[tokio::test]
    async fn test_write_with_status_and_time() {
        let ledger = ledger("bot").await;
        let at = DateTime::from_timestamp_millis(1_000).unwrap();

        let id = ledger
            .write_with(
                Channel::Log,
                fields(&[("e", "boom")]),
                WriteOptions::status("ERROR").with_at(at),
            )
            .await
            .unwrap();
        assert_eq!(id, MessageId::new(1_000, 0));

        let err = ledger
            .write_with(
                Channel::Log,
                Fields::new(),
                WriteOptions::default().with_at(DateTime::from_timestamp_millis(500).unwrap()),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LedgerError::Store(StoreError::IdNotMonotonic { .. })
        ));
    }

    #[tokio::test]
    async fn test_user_status_and_service_name_fields_survive() {
        let ledger = ledger("bot").await;
        ledger
            .write_with(
                Channel::Taskback,
                fields(&[("status", "shipped"), ("service_name", "billing")]),
                WriteOptions::status("ERROR"),
            )
            .await
            .unwrap();

        let messages = ledger
            .read(Channel::Taskback, None, Block::Never)
            .await
            .unwrap();
        assert_eq!(messages[0].get("status"), Some("shipped"));
        assert_eq!(messages[0].get("service_name"), Some("billing"));
        assert_eq!(messages[0].status, "ERROR");
        assert_eq!(messages[0].service_name, "bot");
    }

    #[tokio::test]
    async fn test_write_rejects_reserved_keys() {
        let ledger = ledger("bot").await;
        let err = ledger
            .write(Channel::Data, fields(&[(STATUS_FIELD, "OK")]))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::ReservedField { ref key, .. } if key == STATUS_FIELD));

        // Nothing was appended
        let messages = ledger.read(Channel::Data, None, Block::Never).await.unwrap();
        assert!(messages.is_empty());
    }

    #[tokio::test]
    async fn test_write_unknown_channel_fails() {
        let ledger = ledger("bot").await;
        let err = ledger.write(Channel::Inbox, Fields::new()).await.unwrap_err();
        assert!(matches!(
            err,
            LedgerError::UnknownChannel {
                channel: Channel::Inbox,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_ack_unknown_channel_is_none() {
        let ledger = ledger("bot").await;
        assert_eq!(ledger.ack(Channel::Inbox, &[]).await.unwrap(), None);
        assert_eq!(ledger.ack_stream("nope", &[]).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_ack_stream_by_key() {
        let ledger = ledger("bot").await;
        ledger.write(Channel::Data, Fields::new()).await.unwrap();
        let messages = ledger.read(Channel::Data, None, Block::Never).await.unwrap();

        let acked = ledger
            .ack_stream(&messages[0].stream, &[messages[0].id])
            .await
            .unwrap();
        assert_eq!(acked, Some(1));
    }

    #[tokio::test]
    async fn test_init_cursor_idempotent() {
        let ledger = ledger("bot").await;
        assert_eq!(
            ledger.init_cursor(false, Cursor::Latest).await.unwrap(),
            CursorChange::Unchanged
        );
        assert_eq!(
            ledger.init_cursor(true, Cursor::Latest).await.unwrap(),
            CursorChange::Changed
        );
    }

    #[tokio::test]
    async fn test_forced_rewind_replays() {
        let ledger = ledger("bot").await;
        ledger.write(Channel::Data, fields(&[("n", "1")])).await.unwrap();
        ledger.read(Channel::Data, None, Block::Never).await.unwrap();

        ledger
            .init_cursor(true, Cursor::After(MessageId::ZERO))
            .await
            .unwrap();
        let again = ledger.read(Channel::Data, None, Block::Never).await.unwrap();
        assert_eq!(again.len(), 1);
    }

    #[tokio::test]
    async fn test_read_all_maps_channels() {
        let ledger = ledger("bot").await;
        ledger.write(Channel::Log, Fields::new()).await.unwrap();
        ledger.write(Channel::Taskback, Fields::new()).await.unwrap();

        let messages = ledger.read_all(None, Block::Never).await.unwrap();
        let mut channels: Vec<_> = messages.iter().map(|m| m.channel).collect();
        channels.sort();
        assert_eq!(channels, vec![Channel::Log, Channel::Taskback]);
    }

    #[tokio::test]
    async fn test_churn_pending() {
        let ledger = ledger("bot").await;
        for _ in 0..3 {
            ledger.write(Channel::Data, Fields::new()).await.unwrap();
        }
        ledger.read(Channel::Data, None, Block::Never).await.unwrap();

        assert_eq!(ledger.churn_pending(2).await.unwrap(), 2);
        let pending = ledger.list_pending().await.unwrap();
        assert_eq!(pending[&Channel::Data].len(), 1);
    }

    #[tokio::test]
    async fn test_info_reports_consumers() {
        let ledger = ledger("bot").await;
        ledger.write(Channel::Data, Fields::new()).await.unwrap();
        ledger.read(Channel::Data, None, Block::Never).await.unwrap();

        let info = ledger.info().await.unwrap();
        let data = info
            .channels
            .iter()
            .find(|c| c.channel == Channel::Data)
            .unwrap();
        assert_eq!(data.stream_info.as_ref().unwrap().length, 1);
        assert_eq!(data.groups[0].pending, 1);
        assert_eq!(data.consumers[0].name, "bot");
        assert_eq!(data.consumers[0].pending, 1);
    }

    #[tokio::test]
    async fn test_range_by_time() {
        let ledger = ledger("bot").await;
        for ms in [1_000, 2_000, 3_000] {
            ledger
                .write_with(
                    Channel::Log,
                    Fields::new(),
                    WriteOptions::default().with_at(DateTime::from_timestamp_millis(ms).unwrap()),
                )
                .await
                .unwrap();
        }

        let window = ledger
            .range(
                Channel::Log,
                DateTime::from_timestamp_millis(1_500).unwrap(),
                DateTime::from_timestamp_millis(3_000).unwrap(),
            )
            .await
            .unwrap();
        let ids: Vec<_> = window.iter().map(|m| m.id.ms).collect();
        assert_eq!(ids, vec![2_000, 3_000]);
    }

    #[tokio::test]
    async fn test_recent_sees_fresh_writes() {
        let ledger = ledger("bot").await;
        ledger.write(Channel::Log, Fields::new()).await.unwrap();
        let recent = ledger
            .recent(Channel::Log, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(recent.len(), 1);
    }
}
