//! Stream key naming
//!
//! Every channel of a service lives in its own stream named
//! `{namespace}|streams:{service_name}:{channel}`. The delimiters `|` and `:`
//! are rejected inside namespaces and service names so that two services in
//! one namespace can never produce the same key.

use std::fmt;

use crate::message::Channel;

/// Error building a stream key
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NameError {
    #[error("{kind} must not be empty")]
    Empty { kind: &'static str },

    #[error("{kind} {value:?} contains reserved character {reserved:?}")]
    ReservedCharacter {
        kind: &'static str,
        value: String,
        reserved: char,
    },
}

const RESERVED: [char; 2] = ['|', ':'];

fn validate(kind: &'static str, value: &str) -> Result<(), NameError> {
    if value.is_empty() {
        return Err(NameError::Empty { kind });
    }
    if let Some(reserved) = value.chars().find(|c| RESERVED.contains(c)) {
        return Err(NameError::ReservedCharacter {
            kind,
            value: value.to_string(),
            reserved,
        });
    }
    Ok(())
}

/// Fully qualified name of one channel's stream
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamKey(String);

impl StreamKey {
    /// Build the key for `channel` of `service_name` inside `namespace`
    ///
    /// # Example
    ///
    /// ```
    /// use cannon_ledger::{Channel, StreamKey};
    ///
    /// let key = StreamKey::new("DEFAULT", "demo-bot", Channel::Data).unwrap();
    /// assert_eq!(key.as_str(), "DEFAULT|streams:demo-bot:data");
    /// ```
    pub fn new(namespace: &str, service_name: &str, channel: Channel) -> Result<Self, NameError> {
        validate("namespace", namespace)?;
        validate("service name", service_name)?;
        Ok(Self(format!(
            "{namespace}|streams:{service_name}:{}",
            channel.as_str()
        )))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for StreamKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
