//! Addressing and wire envelope for the sync transport.
//!
//! Event names on the wire:
//! ```text
//! document backend:   <verb>-<databaseId>.<collection>
//! list backend:       <verb>-<databaseId>:<collection>
//! ```
//!
//! The separator differs between the two backends and paired servers rely
//! on it, so [`EventAddress`] is the only place that renders or parses the
//! string form. Everything inside the crate works with the structured tuple.
//!
//! Frames are JSON (`serde_json`), one [`Envelope`] per frame.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

static NULL: Value = Value::Null;

/// RPC method names.
pub mod method {
    pub const RETRIEVE: &str = "retrieve";
    pub const ADD: &str = "add";
    pub const REMOVE: &str = "remove";
    pub const UPDATE: &str = "update";
    pub const PUSH: &str = "push";
    pub const UNSHIFT: &str = "unshift";
    pub const POP: &str = "pop";
    pub const SHIFT: &str = "shift";
    pub const SPLICE: &str = "splice";
}

/// Persistence backend behind a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Unordered document store, identity by `_id`.
    Document,
    /// Ordered list store, identity by position.
    List,
}

impl Backend {
    /// RPC service name.
    pub fn service(self) -> &'static str {
        match self {
            Backend::Document => "sync",
            Backend::List => "sync-redis",
        }
    }

    /// Separator between database id and collection in event names.
    pub fn separator(self) -> char {
        match self {
            Backend::Document => '.',
            Backend::List => ':',
        }
    }

    /// Event verbs this backend publishes.
    pub fn verbs(self) -> &'static [Verb] {
        match self {
            Backend::Document => &[Verb::Inserted, Verb::Removed, Verb::Updated],
            Backend::List => &[Verb::Inserted, Verb::Removed, Verb::Updated, Verb::Spliced],
        }
    }

    fn from_separator(sep: char) -> Option<Self> {
        match sep {
            '.' => Some(Backend::Document),
            ':' => Some(Backend::List),
            _ => None,
        }
    }
}

/// Change verb carried in an event name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verb {
    Inserted,
    Removed,
    Updated,
    Spliced,
}

impl Verb {
    pub fn as_str(self) -> &'static str {
        match self {
            Verb::Inserted => "inserted",
            Verb::Removed => "removed",
            Verb::Updated => "updated",
            Verb::Spliced => "spliced",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "inserted" => Some(Verb::Inserted),
            "removed" => Some(Verb::Removed),
            "updated" => Some(Verb::Updated),
            "spliced" => Some(Verb::Spliced),
            _ => None,
        }
    }
}

/// Structured pub/sub address: (verb, backend, database id, collection).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventAddress {
    pub verb: Verb,
    pub backend: Backend,
    pub database_id: String,
    pub collection: String,
}

impl EventAddress {
    pub fn new(
        verb: Verb,
        backend: Backend,
        database_id: impl Into<String>,
        collection: impl Into<String>,
    ) -> Self {
        Self {
            verb,
            backend,
            database_id: database_id.into(),
            collection: collection.into(),
        }
    }

    /// Parse the wire form back into an address.
    ///
    /// The verb never contains `-`, so the first dash ends it. The first `.`
    /// or `:` after that picks the backend; the collection keeps any later
    /// separators.
    pub fn parse(name: &str) -> Result<Self, ProtocolError> {
        let invalid = || ProtocolError::InvalidEventName(name.to_string());

        let (verb, rest) = name.split_once('-').ok_or_else(invalid)?;
        let verb = Verb::parse(verb).ok_or_else(invalid)?;
        let sep_at = rest.find(['.', ':']).ok_or_else(invalid)?;
        let sep = rest[sep_at..].chars().next().ok_or_else(invalid)?;
        let backend = Backend::from_separator(sep).ok_or_else(invalid)?;

        Ok(Self {
            verb,
            backend,
            database_id: rest[..sep_at].to_string(),
            collection: rest[sep_at + 1..].to_string(),
        })
    }
}

impl fmt::Display for EventAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}{}{}",
            self.verb.as_str(),
            self.database_id,
            self.backend.separator(),
            self.collection
        )
    }
}

/// A request to `service.method(args...)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub service: String,
    pub method: String,
    pub args: Vec<Value>,
}

impl RpcRequest {
    pub fn new(backend: Backend, method: &str, args: Vec<Value>) -> Self {
        Self {
            service: backend.service().to_string(),
            method: method.to_string(),
            args,
        }
    }

    /// Argument at `index`, `Null` when absent.
    pub fn arg(&self, index: usize) -> &Value {
        self.args.get(index).unwrap_or(&NULL)
    }
}

/// A named broadcast with positional payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub event: String,
    pub args: Vec<Value>,
}

impl Notification {
    pub fn new(address: &EventAddress, args: Vec<Value>) -> Self {
        Self {
            event: address.to_string(),
            args,
        }
    }

    /// Argument at `index`, `Null` when absent.
    pub fn arg(&self, index: usize) -> &Value {
        self.args.get(index).unwrap_or(&NULL)
    }
}

/// One frame on the wire.
///
/// `Reply` keeps the `(error, result)` pair shape: a populated `error`
/// means the call failed regardless of `result`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    Request {
        id: u64,
        request: RpcRequest,
    },
    Reply {
        id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<Value>,
        #[serde(default)]
        result: Value,
    },
    Notification(Notification),
}

impl Envelope {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(bytes).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }
}

/// Protocol errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    SerializationError(String),
    #[error("deserialization error: {0}")]
    DeserializationError(String),
    #[error("invalid event name: {0}")]
    InvalidEventName(String),
    #[error("unexpected frame")]
    UnexpectedFrame,
}
