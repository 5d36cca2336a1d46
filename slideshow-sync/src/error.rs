//! Error types for synchronized collections.
//!
//! Two layers: [`RpcError`] is what a transport call reports, [`SyncError`]
//! is what collection operations hand back to callers.

use serde_json::Value;
use thiserror::Error;

use crate::protocol::ProtocolError;

/// Failure of a single remote procedure call.
#[derive(Error, Debug, Clone)]
pub enum RpcError {
    /// The remote side answered with a populated error slot.
    #[error("remote error: {0}")]
    Remote(Value),
    /// The transport went away before a reply arrived.
    #[error("transport closed")]
    TransportClosed,
    /// The subscriber fell behind and this many notifications were lost.
    #[error("notification stream lagged, {0} notifications lost")]
    Lagged(u64),
    /// A frame could not be encoded or decoded.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Error returned by collection operations.
#[derive(Error, Debug, Clone)]
pub enum SyncError {
    /// `synchronize` was asked for a persistence mode it does not know.
    #[error("unsupported persistence mode: {0}")]
    UnsupportedMode(String),
    /// An RPC issued by a mutator failed.
    #[error("{method} failed: {source}")]
    Rpc {
        method: &'static str,
        #[source]
        source: RpcError,
    },
    /// The initial retrieval failed; the collection never synchronized.
    #[error("initial retrieval of {collection} failed: {reason}")]
    RetrievalFailed { collection: String, reason: String },
    /// pop/shift on a collection with no records.
    #[error("collection is empty")]
    Empty,
    #[error("index {index} out of range for length {len}")]
    IndexOutOfRange { index: usize, len: usize },
    /// A document-backed record without an `_id` field.
    #[error("record has no _id")]
    MissingId,
    /// The task driving an RPC was cancelled or panicked.
    #[error("rpc task failed: {0}")]
    TaskFailed(String),
}
