//! Entry point for opening synchronized collections.
//!
//! A [`SyncClient`] holds one transport and hands out [`Collection`]s. The
//! persistence mode picks the variant:
//!
//! | mode    | variant             | service      |
//! |---------|---------------------|--------------|
//! | `mongo` | [`DocumentArray`]   | `sync`       |
//! | `redis` | [`ListArray`]       | `sync-redis` |
//!
//! Any other mode name is rejected.

use std::env;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde_json::Value;

use crate::array::{Mirror, Optimistic, SyncedArray};
use crate::document::DocumentArray;
use crate::error::SyncError;
use crate::list::ListArray;
use crate::transport::Transport;

/// Persistence mode of a collection. Parses from and displays as its
/// wire name, `mongo` or `redis`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    #[default]
    Document,
    List,
}

impl FromStr for Mode {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mongo" => Ok(Mode::Document),
            "redis" => Ok(Mode::List),
            other => Err(SyncError::UnsupportedMode(other.to_string())),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Document => f.write_str("mongo"),
            Mode::List => f.write_str("redis"),
        }
    }
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Namespace prefix for every collection.
    pub database_id: String,
    /// Mode used when `synchronize` is given none.
    pub default_mode: Mode,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_id: "default".to_string(),
            default_mode: Mode::Document,
        }
    }
}

impl SyncConfig {
    /// Defaults overridden by `SLIDESHOW_DB_ID` and `SLIDESHOW_SYNC_MODE`.
    pub fn from_env() -> Result<Self, SyncError> {
        let mut config = Self::default();
        if let Ok(database_id) = env::var("SLIDESHOW_DB_ID") {
            config.database_id = database_id;
        }
        if let Ok(mode) = env::var("SLIDESHOW_SYNC_MODE") {
            config.default_mode = mode.parse()?;
        }
        Ok(config)
    }
}

/// Opens synchronized collections over one transport.
pub struct SyncClient {
    config: SyncConfig,
    transport: Arc<dyn Transport>,
}

impl SyncClient {
    pub fn new(config: SyncConfig, transport: Arc<dyn Transport>) -> Self {
        Self { config, transport }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Open `collection` in the named mode, or the configured default.
    ///
    /// An unknown mode fails here, before anything is subscribed. Must be
    /// called inside a tokio runtime.
    pub fn synchronize(&self, collection: &str, mode: Option<&str>) -> Result<Collection, SyncError> {
        let mode = match mode {
            Some(name) => name.parse()?,
            None => self.config.default_mode,
        };
        Ok(self.synchronize_with(collection, mode))
    }

    pub fn synchronize_with(&self, collection: &str, mode: Mode) -> Collection {
        log::info!("synchronizing {}/{collection} ({mode})", self.config.database_id);
        let transport = self.transport.clone();
        match mode {
            Mode::Document => Collection::Document(DocumentArray::open(
                transport,
                &self.config.database_id,
                collection,
            )),
            Mode::List => {
                Collection::List(ListArray::open(transport, &self.config.database_id, collection))
            }
        }
    }
}

/// A synchronized collection of either variant.
#[derive(Clone, Debug)]
pub enum Collection {
    Document(DocumentArray),
    List(ListArray),
}

impl Collection {
    pub fn mode(&self) -> Mode {
        match self {
            Collection::Document(_) => Mode::Document,
            Collection::List(_) => Mode::List,
        }
    }
}

/// Forward a call to whichever variant is inside.
macro_rules! delegate {
    ($collection:expr, $array:ident => $call:expr) => {
        match $collection {
            Collection::Document($array) => $call,
            Collection::List($array) => $call,
        }
    };
}

impl SyncedArray for Collection {
    fn mirror(&self) -> &Mirror {
        delegate!(self, array => array.mirror())
    }

    fn update_at(&self, index: usize, fragment: &Value) -> Result<Optimistic<Value>, SyncError> {
        delegate!(self, array => array.update_at(index, fragment))
    }

    fn push(&self, records: Vec<Value>) -> Result<Optimistic<usize>, SyncError> {
        delegate!(self, array => array.push(records))
    }

    fn unshift(&self, records: Vec<Value>) -> Result<Optimistic<usize>, SyncError> {
        delegate!(self, array => array.unshift(records))
    }

    fn pop(&self) -> Result<Optimistic<Value>, SyncError> {
        delegate!(self, array => array.pop())
    }

    fn shift(&self) -> Result<Optimistic<Value>, SyncError> {
        delegate!(self, array => array.shift())
    }

    fn splice(
        &self,
        index: isize,
        count: usize,
        records: Vec<Value>,
    ) -> Result<Optimistic<Vec<Value>>, SyncError> {
        delegate!(self, array => array.splice(index, count, records))
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::MemoryServer;

    #[test]
    fn test_mode_names() {
        assert_eq!("mongo".parse::<Mode>().unwrap(), Mode::Document);
        assert_eq!("redis".parse::<Mode>().unwrap(), Mode::List);
        assert_eq!(Mode::Document.to_string(), "mongo");
        assert_eq!(Mode::List.to_string().parse::<Mode>().unwrap(), Mode::List);
    }

    #[test]
    fn test_variant_names_are_not_modes() {
        for name in ["document", "list", "Mongo", ""] {
            assert!(matches!(name.parse::<Mode>(), Err(SyncError::UnsupportedMode(ref m)) if m == name));
        }
    }

    #[test]
    fn test_unknown_mode_rejected() {
        let err = "couchdb".parse::<Mode>().unwrap_err();
        assert!(matches!(err, SyncError::UnsupportedMode(ref m) if m == "couchdb"));
        assert_eq!(err.to_string(), "unsupported persistence mode: couchdb");
    }

    #[test]
    fn test_config_default() {
        let config = SyncConfig::default();
        assert_eq!(config.database_id, "default");
        assert_eq!(config.default_mode, Mode::Document);
    }

    #[tokio::test]
    async fn test_synchronize_picks_variant() {
        let server = MemoryServer::with_defaults();
        let client = SyncClient::new(SyncConfig::default(), Arc::new(server.transport()));

        let docs = client.synchronize("photos", None).unwrap();
        let list = client.synchronize("slides", Some("redis")).unwrap();

        assert_eq!(docs.mode(), Mode::Document);
        assert_eq!(list.mode(), Mode::List);
        assert!(matches!(list, Collection::List(_)));
    }

    #[tokio::test]
    async fn test_synchronize_unsupported_mode_fails_early() {
        let server = MemoryServer::with_defaults();
        let client = SyncClient::new(SyncConfig::default(), Arc::new(server.transport()));

        let result = client.synchronize("photos", Some("sqlite"));
        assert!(matches!(result, Err(SyncError::UnsupportedMode(_))));
        let result = client.synchronize("photos", Some("document"));
        assert!(matches!(result, Err(SyncError::UnsupportedMode(ref m)) if m == "document"));
        assert_eq!(server.stats().requests, 0);
        assert_eq!(server.stats().bus.active_subscribers, 0);
    }

    #[tokio::test]
    async fn test_collection_display() {
        let server = MemoryServer::with_defaults();
        server.seed_list("default", "slides", vec![serde_json::json!("a"), serde_json::json!("b")]);
        let client = SyncClient::new(SyncConfig::default(), Arc::new(server.transport()));

        let slides = client.synchronize_with("slides", Mode::List);
        slides.ready().await.unwrap();
        assert_eq!(slides.to_string(), "SynchronizedArray(slides):[a, b]");
    }
}
