//! Message model: ids, channels, read modes and messages

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Flat string map carried by every stream entry
pub type Fields = BTreeMap<String, String>;

/// Prefix of ledger metadata fields; payload keys may not start with it
pub const RESERVED_PREFIX: &str = "cannon:";

/// Field holding the name of the service that wrote an entry
pub const SERVICE_NAME_FIELD: &str = "cannon:service_name";

/// Field holding the status of an entry ("OK" unless a writer says otherwise)
pub const STATUS_FIELD: &str = "cannon:status";

/// Whether `key` lies in the ledger's metadata namespace
pub fn is_reserved_field(key: &str) -> bool {
    key.starts_with(RESERVED_PREFIX)
}

/// Default status for written entries
pub const STATUS_OK: &str = "OK";

/// Status used for failure records
pub const STATUS_ERROR: &str = "ERROR";

/// Stream entry id: milliseconds since the epoch plus a sequence number
///
/// Ids are totally ordered, first by timestamp and then by sequence.
///
/// # Example
///
/// ```
/// use cannon_ledger::MessageId;
///
/// let id: MessageId = "1526919030474-55".parse().unwrap();
/// assert_eq!(id.ms, 1526919030474);
/// assert_eq!(id.seq, 55);
/// assert_eq!(id.to_string(), "1526919030474-55");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct MessageId {
    pub ms: u64,
    pub seq: u64,
}

impl MessageId {
    /// The smallest possible id (`0-0`)
    pub const ZERO: MessageId = MessageId { ms: 0, seq: 0 };

    pub const fn new(ms: u64, seq: u64) -> Self {
        Self { ms, seq }
    }

    /// The id that follows this one within the same millisecond
    pub fn next_in_ms(&self) -> Self {
        Self {
            ms: self.ms,
            seq: self.seq + 1,
        }
    }

    /// Entry timestamp as a UTC datetime
    pub fn timestamp(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        chrono::DateTime::from_timestamp_millis(self.ms as i64)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

/// Error parsing a message id
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid message id: {0:?}")]
pub struct ParseIdError(pub String);

impl FromStr for MessageId {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ParseIdError(s.to_string());
        match s.split_once('-') {
            Some((ms, seq)) => Ok(Self {
                ms: ms.parse().map_err(|_| invalid())?,
                seq: seq.parse().map_err(|_| invalid())?,
            }),
            None => Ok(Self {
                ms: s.parse().map_err(|_| invalid())?,
                seq: 0,
            }),
        }
    }
}

impl Serialize for MessageId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MessageId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Position a consumer group starts delivering after
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Cursor {
    /// Only entries appended from now on (`$`)
    #[default]
    Latest,
    /// Entries strictly after this id (`0` rewinds to the beginning)
    After(MessageId),
}

impl FromStr for Cursor {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "$" {
            Ok(Cursor::Latest)
        } else {
            s.parse().map(Cursor::After)
        }
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cursor::Latest => write!(f, "$"),
            Cursor::After(id) => write!(f, "{id}"),
        }
    }
}

/// How long a group read may wait for new entries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Block {
    /// Return immediately with whatever is available
    Never,
    /// Wait at most this long
    For(Duration),
    /// Wait until at least one entry arrives
    Forever,
}

impl Block {
    /// Millisecond form where 0 means "wait forever"
    pub fn from_millis(ms: u64) -> Self {
        if ms == 0 {
            Block::Forever
        } else {
            Block::For(Duration::from_millis(ms))
        }
    }
}

/// The fixed channels a service ledger can carry
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Log,
    Data,
    Inbox,
    Taskback,
}

impl Channel {
    pub const ALL: [Channel; 4] = [Channel::Log, Channel::Data, Channel::Inbox, Channel::Taskback];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Log => "log",
            Channel::Data => "data",
            Channel::Inbox => "inbox",
            Channel::Taskback => "taskback",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error parsing a channel name
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown channel: {0:?}")]
pub struct UnknownChannel(pub String);

impl FromStr for Channel {
    type Err = UnknownChannel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Channel::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| UnknownChannel(s.to_string()))
    }
}

/// Raw entry as stored in a stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub id: MessageId,
    pub fields: Fields,
}

/// A message read from one of a ledger's channels
///
/// Messages are immutable once written. The reserved `service_name` and
/// `status` fields are split out of the payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    /// Full stream key the message was read from
    pub stream: String,
    pub channel: Channel,
    pub service_name: String,
    pub status: String,
    pub payload: Fields,
}

impl Message {
    /// Build a message from a raw stream entry
    pub fn from_entry(stream: &str, channel: Channel, entry: StreamEntry) -> Self {
        let mut payload = entry.fields;
        let service_name = payload.remove(SERVICE_NAME_FIELD).unwrap_or_default();
        let status = payload
            .remove(STATUS_FIELD)
            .unwrap_or_else(|| STATUS_OK.to_string());

        Self {
            id: entry.id,
            stream: stream.to_string(),
            channel,
            service_name,
            status,
            payload,
        }
    }

    /// Payload value for `key`
    pub fn get(&self, key: &str) -> Option<&str> {
        self.payload.get(key).map(String::as_str)
    }

    pub fn is_ok(&self) -> bool {
        self.status == STATUS_OK
    }
}
