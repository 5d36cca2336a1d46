//! In-memory sync backend.
//!
//! Serves both services over [`Envelope`] frames:
//!
//! ```text
//! MemoryTransport ── Request frame ──► MemoryServer::handle
//!        ▲                                   │
//!        │                                   ├── document stores  (db, collection) → Vec<record>
//!        │                                   ├── list stores      (db, collection) → VecDeque<record>
//!        │                                   │
//!        └──── Reply frame ◄─────────────────┤
//!                                            ▼
//!                                        EventBus ──► subscribers
//! ```
//!
//! Every committed operation publishes its notification while the store
//! lock is held, then replies, so subscribers see notifications in commit
//! order. Used by tests and the demo viewer; a networked deployment puts a
//! real transport behind the same [`Transport`] trait.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::future::{self, BoxFuture};
use futures_util::stream::BoxStream;
use futures_util::FutureExt;
use parking_lot::Mutex;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::broadcast::{BroadcastStats, EventBus};
use crate::error::RpcError;
use crate::protocol::{
    method, Backend, Envelope, EventAddress, Notification, ProtocolError, RpcRequest, Verb,
};
use crate::transport::Transport;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Notification frames buffered per subscriber, at least one. A
    /// subscriber that falls further behind is told how many it lost.
    pub broadcast_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            broadcast_capacity: 1024,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub requests: u64,
    pub failed_requests: u64,
    pub documents: usize,
    pub lists: usize,
    pub bus: BroadcastStats,
}

type StoreKey = (String, String);

#[derive(Default)]
struct Stores {
    documents: HashMap<StoreKey, Vec<Value>>,
    lists: HashMap<StoreKey, VecDeque<Value>>,
}

struct ServerInner {
    stores: Mutex<Stores>,
    bus: EventBus,
    /// (service, method) → error value returned instead of executing.
    faults: Mutex<HashMap<(String, String), Value>>,
    requests: AtomicU64,
    failed_requests: AtomicU64,
}

/// Shared handle to an in-memory backend.
#[derive(Clone)]
pub struct MemoryServer {
    inner: Arc<ServerInner>,
}

/// Outcome of one request: `Err` is the remote error slot.
type Outcome = Result<Value, Value>;

impl MemoryServer {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                stores: Mutex::new(Stores::default()),
                bus: EventBus::new(config.broadcast_capacity),
                faults: Mutex::new(HashMap::new()),
                requests: AtomicU64::new(0),
                failed_requests: AtomicU64::new(0),
            }),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// A transport connected to this server.
    pub fn transport(&self) -> MemoryTransport {
        MemoryTransport {
            server: self.clone(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Answer every `service.method` call with `message` as the remote
    /// error until [`clear_faults`](Self::clear_faults).
    pub fn fail_method(&self, service: &str, method: &str, message: &str) {
        self.inner.faults.lock().insert(
            (service.to_string(), method.to_string()),
            Value::String(message.to_string()),
        );
    }

    pub fn clear_faults(&self) {
        self.inner.faults.lock().clear();
    }

    /// Publish a notification that no request produced, as a peer server
    /// sharing the bus would.
    pub fn publish(&self, notification: Notification) -> Result<usize, ProtocolError> {
        let _stores = self.inner.stores.lock();
        self.inner.bus.publish(notification)
    }

    /// Seed a document collection without publishing anything.
    pub fn seed_documents(&self, database_id: &str, collection: &str, records: Vec<Value>) {
        let key = (database_id.to_string(), collection.to_string());
        let mut stores = self.inner.stores.lock();
        let store = stores.documents.entry(key).or_default();
        for mut record in records {
            assign_id(&mut record);
            store.push(record);
        }
    }

    /// Seed a list without publishing anything.
    pub fn seed_list(&self, database_id: &str, collection: &str, records: Vec<Value>) {
        let key = (database_id.to_string(), collection.to_string());
        self.inner
            .stores
            .lock()
            .lists
            .entry(key)
            .or_default()
            .extend(records);
    }

    /// Current server-side contents of a document collection.
    pub fn documents(&self, database_id: &str, collection: &str) -> Vec<Value> {
        let key = (database_id.to_string(), collection.to_string());
        self.inner.stores.lock().documents.get(&key).cloned().unwrap_or_default()
    }

    /// Current server-side contents of a list.
    pub fn list(&self, database_id: &str, collection: &str) -> Vec<Value> {
        let key = (database_id.to_string(), collection.to_string());
        self.inner
            .stores
            .lock()
            .lists
            .get(&key)
            .map(|list| list.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn stats(&self) -> ServerStats {
        let stores = self.inner.stores.lock();
        ServerStats {
            requests: self.inner.requests.load(Ordering::Relaxed),
            failed_requests: self.inner.failed_requests.load(Ordering::Relaxed),
            documents: stores.documents.values().map(Vec::len).sum(),
            lists: stores.lists.len(),
            bus: self.inner.bus.stats(),
        }
    }

    /// Handle one request frame, returning the reply frame.
    pub fn handle(&self, frame: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        let Envelope::Request { id, request } = Envelope::decode(frame)? else {
            return Err(ProtocolError::UnexpectedFrame);
        };

        self.inner.requests.fetch_add(1, Ordering::Relaxed);
        let reply = match self.dispatch(&request) {
            Ok(result) => Envelope::Reply { id, error: None, result },
            Err(error) => {
                self.inner.failed_requests.fetch_add(1, Ordering::Relaxed);
                log::debug!("{}.{} failed: {error}", request.service, request.method);
                Envelope::Reply {
                    id,
                    error: Some(error),
                    result: Value::Null,
                }
            }
        };
        reply.encode()
    }

    fn dispatch(&self, request: &RpcRequest) -> Outcome {
        let fault = self
            .inner
            .faults
            .lock()
            .get(&(request.service.clone(), request.method.clone()))
            .cloned();
        if let Some(error) = fault {
            return Err(error);
        }

        let database_id = string_arg(request, 0)?;
        let collection = string_arg(request, 1)?;
        let key = (database_id.to_string(), collection.to_string());

        let mut stores = self.inner.stores.lock();
        match request.service.as_str() {
            s if s == Backend::Document.service() => {
                let store = stores.documents.entry(key).or_default();
                let scope = Scope::new(&self.inner.bus, Backend::Document, database_id, collection);
                documents(store, &scope, request)
            }
            s if s == Backend::List.service() => {
                let list = stores.lists.entry(key).or_default();
                let scope = Scope::new(&self.inner.bus, Backend::List, database_id, collection);
                lists(list, &scope, request)
            }
            other => Err(json!(format!("unknown service {other}"))),
        }
    }
}

/// Publishing context for one collection.
struct Scope<'a> {
    bus: &'a EventBus,
    backend: Backend,
    database_id: &'a str,
    collection: &'a str,
}

impl<'a> Scope<'a> {
    fn new(bus: &'a EventBus, backend: Backend, database_id: &'a str, collection: &'a str) -> Self {
        Self {
            bus,
            backend,
            database_id,
            collection,
        }
    }

    fn publish(&self, verb: Verb, args: Vec<Value>) {
        let address = EventAddress::new(verb, self.backend, self.database_id, self.collection);
        if let Err(e) = self.bus.publish(Notification::new(&address, args)) {
            log::error!("failed to publish {address}: {e}");
        }
    }
}

fn string_arg(request: &RpcRequest, index: usize) -> Result<&str, Value> {
    request
        .arg(index)
        .as_str()
        .ok_or_else(|| json!(format!("argument {index} must be a string")))
}

fn index_arg(request: &RpcRequest, index: usize) -> Result<usize, Value> {
    request
        .arg(index)
        .as_u64()
        .and_then(|n| usize::try_from(n).ok())
        .ok_or_else(|| json!(format!("argument {index} must be an index")))
}

fn assign_id(record: &mut Value) {
    if let Value::Object(map) = record {
        map.entry("_id")
            .or_insert_with(|| Value::String(Uuid::new_v4().to_string()));
    }
}

fn documents(store: &mut Vec<Value>, scope: &Scope<'_>, request: &RpcRequest) -> Outcome {
    match request.method.as_str() {
        method::RETRIEVE => Ok(Value::Array(store.clone())),
        method::ADD => {
            let mut payload = request.arg(2).clone();
            let records: Vec<&mut Value> = match &mut payload {
                Value::Array(items) => items.iter_mut().collect(),
                single => vec![single],
            };
            if records.iter().any(|r| !r.is_object()) {
                return Err(json!("records must be objects"));
            }
            for record in records {
                assign_id(record);
                store.push(record.clone());
            }
            scope.publish(Verb::Inserted, vec![payload.clone()]);
            Ok(payload)
        }
        method::REMOVE => {
            let id = request.arg(2);
            match store.iter().position(|r| r.get("_id") == Some(id)) {
                Some(index) => {
                    store.remove(index);
                    scope.publish(Verb::Removed, vec![id.clone()]);
                    Ok(Value::Bool(true))
                }
                None => Ok(Value::Bool(false)),
            }
        }
        method::UPDATE => {
            let id = request.arg(2);
            let mut record = request.arg(3).clone();
            let Some(slot) = store.iter_mut().find(|r| r.get("_id") == Some(id)) else {
                return Err(json!(format!("no record with _id {id}")));
            };
            let Value::Object(map) = &mut record else {
                return Err(json!("record must be an object"));
            };
            map.insert("_id".to_string(), id.clone());
            *slot = record.clone();
            scope.publish(Verb::Updated, vec![record.clone()]);
            Ok(record)
        }
        other => Err(json!(format!("unknown method sync.{other}"))),
    }
}

fn lists(list: &mut VecDeque<Value>, scope: &Scope<'_>, request: &RpcRequest) -> Outcome {
    match request.method.as_str() {
        method::RETRIEVE => Ok(Value::Array(list.iter().cloned().collect())),
        method::PUSH => {
            let payload = request.arg(2).clone();
            list.extend(crate::array::batch_records(&payload));
            scope.publish(Verb::Inserted, vec![payload, json!(method::PUSH)]);
            Ok(json!(list.len()))
        }
        method::UNSHIFT => {
            let payload = request.arg(2).clone();
            for record in crate::array::batch_records(&payload).into_iter().rev() {
                list.push_front(record);
            }
            scope.publish(Verb::Inserted, vec![payload, json!(method::UNSHIFT)]);
            Ok(json!(list.len()))
        }
        method::POP => match list.pop_back() {
            Some(record) => {
                scope.publish(Verb::Removed, vec![record.clone(), json!(method::POP)]);
                Ok(record)
            }
            None => Ok(Value::Null),
        },
        method::SHIFT => match list.pop_front() {
            Some(record) => {
                scope.publish(Verb::Removed, vec![record.clone(), json!(method::SHIFT)]);
                Ok(record)
            }
            None => Ok(Value::Null),
        },
        method::SPLICE => {
            let start = index_arg(request, 2)?.min(list.len());
            let count = index_arg(request, 3)?;
            let end = start.saturating_add(count).min(list.len());
            let replacement = crate::array::batch_records(request.arg(4));

            let mut tail = list.split_off(end);
            let removed: Vec<Value> = list.drain(start..).collect();
            list.extend(replacement.iter().cloned());
            list.append(&mut tail);

            scope.publish(
                Verb::Spliced,
                vec![json!(start), json!(end - start), Value::Array(replacement)],
            );
            Ok(Value::Array(removed))
        }
        method::UPDATE => {
            let index = index_arg(request, 2)?;
            let record = request.arg(3).clone();
            let Some(slot) = list.get_mut(index) else {
                return Err(json!(format!("index {index} out of range")));
            };
            *slot = record.clone();
            scope.publish(Verb::Updated, vec![json!(index), record]);
            Ok(Value::Bool(true))
        }
        other => Err(json!(format!("unknown method sync-redis.{other}"))),
    }
}

/// [`Transport`] that talks to a [`MemoryServer`] in-process.
///
/// Each call is encoded, handled and answered before `call` returns; the
/// returned future is already complete.
pub struct MemoryTransport {
    server: MemoryServer,
    next_id: AtomicU64,
}

impl MemoryTransport {
    pub fn server(&self) -> &MemoryServer {
        &self.server
    }

    fn roundtrip(&self, request: RpcRequest) -> Result<Value, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = Envelope::Request { id, request }.encode()?;
        let reply = self.server.handle(&frame)?;

        match Envelope::decode(&reply)? {
            Envelope::Reply { id: reply_id, .. } if reply_id != id => {
                Err(RpcError::Protocol(ProtocolError::UnexpectedFrame))
            }
            Envelope::Reply { error: Some(error), .. } => Err(RpcError::Remote(error)),
            Envelope::Reply { result, .. } => Ok(result),
            _ => Err(RpcError::Protocol(ProtocolError::UnexpectedFrame)),
        }
    }
}

impl Transport for MemoryTransport {
    fn call(&self, request: RpcRequest) -> BoxFuture<'static, Result<Value, RpcError>> {
        future::ready(self.roundtrip(request)).boxed()
    }

    fn subscribe(&self, events: Vec<String>) -> BoxStream<'static, Result<Notification, RpcError>> {
        self.server.inner.bus.subscribe(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    fn call(transport: &MemoryTransport, backend: Backend, method: &str, extra: Vec<Value>) -> Result<Value, RpcError> {
        let mut args = vec![json!("db"), json!("photos")];
        args.extend(extra);
        transport.roundtrip(RpcRequest::new(backend, method, args))
    }

    #[test]
    fn test_add_assigns_ids() {
        let server = MemoryServer::with_defaults();
        let transport = server.transport();

        let added = call(&transport, Backend::Document, method::ADD, vec![json!([{"n": 1}, {"n": 2}])]).unwrap();
        let stored = server.documents("db", "photos");

        assert_eq!(stored.len(), 2);
        assert!(stored.iter().all(|r| r["_id"].is_string()));
        assert_eq!(added.as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_add_keeps_given_id() {
        let server = MemoryServer::with_defaults();
        let transport = server.transport();
        let added = call(&transport, Backend::Document, method::ADD, vec![json!({"_id": "mine"})]).unwrap();
        assert_eq!(added, json!({"_id": "mine"}));
    }

    #[test]
    fn test_update_unknown_id_errors() {
        let server = MemoryServer::with_defaults();
        let transport = server.transport();
        let err = call(&transport, Backend::Document, method::UPDATE, vec![json!("nope"), json!({})]).unwrap_err();
        assert!(matches!(err, RpcError::Remote(_)));
        assert_eq!(server.stats().failed_requests, 1);
    }

    #[test]
    fn test_list_splice_reply_and_state() {
        let server = MemoryServer::with_defaults();
        server.seed_list("db", "photos", vec![json!(0), json!(1), json!(2), json!(3)]);
        let transport = server.transport();

        let removed = call(&transport, Backend::List, method::SPLICE, vec![json!(1), json!(2), json!(["x"])]).unwrap();
        assert_eq!(removed, json!([1, 2]));
        assert_eq!(server.list("db", "photos"), vec![json!(0), json!("x"), json!(3)]);
    }

    #[test]
    fn test_list_pop_on_empty_is_null() {
        let server = MemoryServer::with_defaults();
        let transport = server.transport();
        assert_eq!(call(&transport, Backend::List, method::POP, vec![]).unwrap(), Value::Null);
        assert_eq!(server.stats().bus.notifications_published, 0);
    }

    #[test]
    fn test_fault_injection() {
        let server = MemoryServer::with_defaults();
        let transport = server.transport();
        server.fail_method("sync", "add", "quota exceeded");

        let err = call(&transport, Backend::Document, method::ADD, vec![json!({})]).unwrap_err();
        assert_eq!(err.to_string(), "remote error: \"quota exceeded\"");
        assert!(server.documents("db", "photos").is_empty());

        server.clear_faults();
        assert!(call(&transport, Backend::Document, method::ADD, vec![json!({})]).is_ok());
    }

    #[test]
    fn test_unknown_method_and_bad_args() {
        let server = MemoryServer::with_defaults();
        let transport = server.transport();
        assert!(call(&transport, Backend::List, "insertAt", vec![]).is_err());
        let bad = RpcRequest::new(Backend::List, method::RETRIEVE, vec![json!(1)]);
        assert!(transport.roundtrip(bad).is_err());
    }

    #[test]
    fn test_handle_rejects_non_request_frames() {
        let server = MemoryServer::with_defaults();
        let frame = Envelope::Reply { id: 1, error: None, result: Value::Null }.encode().unwrap();
        assert_eq!(server.handle(&frame), Err(ProtocolError::UnexpectedFrame));
    }

    #[tokio::test]
    async fn test_notifications_follow_commit_order() {
        let server = MemoryServer::with_defaults();
        let transport = server.transport();
        let mut events = transport.subscribe(vec![
            "inserted-db:photos".to_string(),
            "removed-db:photos".to_string(),
        ]);

        call(&transport, Backend::List, method::PUSH, vec![json!("a")]).unwrap();
        call(&transport, Backend::List, method::SHIFT, vec![]).unwrap();

        let first = events.next().await.unwrap().unwrap();
        let second = events.next().await.unwrap().unwrap();
        assert_eq!(first.event, "inserted-db:photos");
        assert_eq!(first.args, vec![json!("a"), json!("push")]);
        assert_eq!(second.event, "removed-db:photos");
        assert_eq!(second.args, vec![json!("a"), json!("shift")]);
    }
}
