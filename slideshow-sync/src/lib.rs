//! # slideshow-sync — Synchronized collections for the slideshow
//!
//! Mirrors a remote collection into a local ordered array that stays
//! consistent with every other client watching the same collection.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   call(service, method, args)   ┌──────────────┐
//! │ Collection   │ ──────────────────────────────► │ server       │
//! │ (per client) │                                 │ (authority)  │
//! └──────┬───────┘ ◄────────────────────────────── └──────┬───────┘
//!        │          <verb>-<db><sep><collection>          │
//!        ▼                                                ▼
//! ┌──────────────┐                                ┌──────────────┐
//! │ Mirror       │                                │ EventBus     │
//! │ + Notifier   │                                │ (fan-out)    │
//! └──────────────┘                                └──────────────┘
//! ```
//!
//! Mutators send RPCs and return an anticipated value right away. The
//! mirror changes only when the confirming notification comes back, so
//! every client applies the same changes in the same order.
//!
//! ## Modules
//!
//! - [`protocol`] — Event addressing and the JSON wire envelope
//! - [`transport`] — RPC + pub/sub seam
//! - [`notifier`] — Change events and observer fan-out
//! - [`array`] — Shared mirror, optimistic results, read-only operations
//! - [`merge`] — Deep merge for partial updates
//! - [`document`] — Collections on an unordered document store
//! - [`list`] — Collections on an ordered list store
//! - [`client`] — Configuration and the collection factory
//! - [`broadcast`] — Notification fan-out with per-subscriber filters
//! - [`server`] — In-memory backend for both stores

pub mod array;
pub mod broadcast;
pub mod client;
pub mod document;
pub mod error;
pub mod list;
pub mod merge;
pub mod notifier;
pub mod protocol;
pub mod server;
pub mod transport;

// Re-exports for convenience
pub use array::{Mirror, Optimistic, Pending, SyncState, SyncedArray};
pub use broadcast::{BroadcastStats, EventBus};
pub use client::{Collection, Mode, SyncClient, SyncConfig};
pub use document::DocumentArray;
pub use error::{RpcError, SyncError};
pub use list::ListArray;
pub use merge::merge;
pub use notifier::{Change, ChangeKind, Notifier, Observer};
pub use protocol::{
    Backend, Envelope, EventAddress, Notification, ProtocolError, RpcRequest, Verb,
};
pub use server::{MemoryServer, MemoryTransport, ServerConfig, ServerStats};
pub use transport::Transport;
