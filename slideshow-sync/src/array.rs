//! Shared base of the two synchronized collection variants.
//!
//! Both [`DocumentArray`](crate::document::DocumentArray) and
//! [`ListArray`](crate::list::ListArray) hold:
//!
//! - a [`Mirror`]: the local record sequence, its sync state and notifier
//! - a [`Remote`]: RPC addressing for the collection
//! - a [`Driver`]: the task that performs the initial retrieval and then
//!   applies notifications in arrival order
//!
//! [`SyncedArray`] is the capability both expose. Read-only operations are
//! provided methods over the mirror; each variant supplies its mutators.
//!
//! Mutators never touch the mirror for structural changes. They issue RPCs
//! and return an [`Optimistic`] value; the mirror changes when the
//! confirming notification arrives through the driver.

use std::cmp::Ordering as CmpOrdering;
use std::collections::VecDeque;
use std::ops::{Bound, RangeBounds};
use std::sync::Arc;

use futures_util::future::{join_all, BoxFuture};
use futures_util::stream::BoxStream;
use futures_util::{FutureExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinHandle};

use crate::error::{RpcError, SyncError};
use crate::notifier::{Change, Notifier};
use crate::protocol::{method, Backend, EventAddress, Notification, RpcRequest, Verb};
use crate::transport::Transport;

/// Lifecycle of a collection's first retrieval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncState {
    /// Retrieval not answered yet.
    Unsynchronized,
    /// Retrieval answered; never leaves this state.
    Synchronized,
    /// A list collection's retrieval failed, or a resynchronization of
    /// either variant did; the mirror is no longer kept up to date.
    Failed(String),
}

/// Local ordered mirror of a remote collection.
pub struct Mirror {
    database_id: String,
    collection: String,
    records: Mutex<VecDeque<Value>>,
    notifier: Notifier,
    state: watch::Sender<SyncState>,
}

impl Mirror {
    pub fn new(database_id: impl Into<String>, collection: impl Into<String>) -> Self {
        let (state, _) = watch::channel(SyncState::Unsynchronized);
        Self {
            database_id: database_id.into(),
            collection: collection.into(),
            records: Mutex::new(VecDeque::new()),
            notifier: Notifier::new(),
            state,
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn database_id(&self) -> &str {
        &self.database_id
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    pub fn state(&self) -> SyncState {
        self.state.borrow().clone()
    }

    pub fn is_synchronized(&self) -> bool {
        *self.state.borrow() == SyncState::Synchronized
    }

    /// Length as of the last applied change.
    pub fn len(&self) -> usize {
        self.notifier.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: usize) -> Option<Value> {
        self.records.lock().get(index).cloned()
    }

    pub fn first(&self) -> Option<Value> {
        self.records.lock().front().cloned()
    }

    pub fn last(&self) -> Option<Value> {
        self.records.lock().back().cloned()
    }

    /// Copy of the current records. Not synchronized.
    pub fn snapshot(&self) -> Vec<Value> {
        self.records.lock().iter().cloned().collect()
    }

    /// Copy of a range, clamped to the current length.
    pub fn slice(&self, range: impl RangeBounds<usize>) -> Vec<Value> {
        let records = self.records.lock();
        let (start, end) = clamp_range(range, records.len());
        records.range(start..end).cloned().collect()
    }

    /// Wait for the first retrieval to settle.
    pub async fn ready(&self) -> Result<(), SyncError> {
        let mut rx = self.state.subscribe();
        let settled = rx
            .wait_for(|state| *state != SyncState::Unsynchronized)
            .await
            .map(|state| state.clone());

        match settled {
            Ok(SyncState::Failed(reason)) => Err(SyncError::RetrievalFailed {
                collection: self.collection.clone(),
                reason,
            }),
            Ok(_) => Ok(()),
            Err(_) => Err(SyncError::RetrievalFailed {
                collection: self.collection.clone(),
                reason: "state channel closed".to_string(),
            }),
        }
    }

    pub(crate) fn with<R>(&self, f: impl FnOnce(&VecDeque<Value>) -> R) -> R {
        f(&self.records.lock())
    }

    /// Mutate the records and publish the resulting change, if any.
    ///
    /// The records lock is released before observers run.
    pub(crate) fn apply(&self, f: impl FnOnce(&mut VecDeque<Value>) -> Option<Change>) -> bool {
        let (change, len) = {
            let mut records = self.records.lock();
            let change = f(&mut records);
            (change, records.len())
        };

        match change {
            Some(change) => {
                self.notifier.notify(&change, len);
                true
            }
            None => false,
        }
    }

    /// Edit one record in place without notifying.
    pub(crate) fn modify_at<R>(&self, index: usize, f: impl FnOnce(&mut Value) -> R) -> Option<R> {
        self.records.lock().get_mut(index).map(f)
    }

    /// Reorder locally without notifying.
    pub(crate) fn reorder(&self, f: impl FnOnce(&mut [Value])) {
        f(self.records.lock().make_contiguous());
    }

    pub(crate) fn synchronize(&self, records: Vec<Value>) {
        if self.state() != SyncState::Unsynchronized {
            log::debug!("{} already settled, ignoring second retrieval", self.collection);
            return;
        }

        let len = {
            let mut held = self.records.lock();
            *held = records.iter().cloned().collect();
            held.len()
        };
        self.state.send_replace(SyncState::Synchronized);
        log::info!("{} synchronized with {len} records", self.collection);
        self.notifier.notify(&Change::Synchronized { records }, len);
    }

    /// Replace every record after notifications were lost.
    pub(crate) fn reset(&self, records: Vec<Value>) {
        let len = {
            let mut held = self.records.lock();
            *held = records.iter().cloned().collect();
            held.len()
        };
        log::info!("{} resynchronized with {len} records", self.collection);
        self.notifier.notify(&Change::Reset { records }, len);
    }

    pub(crate) fn fail(&self, reason: String) {
        self.state.send_replace(SyncState::Failed(reason));
    }
}

/// Clamp a range to `[0, len]`.
pub(crate) fn clamp_range(range: impl RangeBounds<usize>, len: usize) -> (usize, usize) {
    let start = match range.start_bound() {
        Bound::Included(&s) => s,
        Bound::Excluded(&s) => s.saturating_add(1),
        Bound::Unbounded => 0,
    }
    .min(len);
    let end = match range.end_bound() {
        Bound::Included(&e) => e.saturating_add(1),
        Bound::Excluded(&e) => e,
        Bound::Unbounded => len,
    }
    .min(len);
    (start, end.max(start))
}

/// Resolve a possibly negative index (counted from the end) into `[0, len]`.
pub(crate) fn resolve_index(index: isize, len: usize) -> usize {
    if index < 0 {
        (len as isize + index).max(0) as usize
    } else {
        (index as usize).min(len)
    }
}

/// `_id` of a document record.
pub(crate) fn record_id(record: &Value) -> Option<&Value> {
    record.get("_id")
}

/// One record stays a record on the wire, several become an array.
pub(crate) fn batch_payload(mut records: Vec<Value>) -> Value {
    if records.len() == 1 {
        records.remove(0)
    } else {
        Value::Array(records)
    }
}

/// Inverse of [`batch_payload`]. `Null` yields nothing.
pub(crate) fn batch_records(payload: &Value) -> Vec<Value> {
    match payload {
        Value::Array(items) => items.clone(),
        Value::Null => Vec::new(),
        other => vec![other.clone()],
    }
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// RPCs in flight for one mutator call.
///
/// Dropping it does not cancel anything; failures are still logged when
/// they complete.
#[derive(Debug, Default)]
pub struct Pending {
    calls: Vec<JoinHandle<Result<Value, SyncError>>>,
}

impl Pending {
    pub(crate) fn new(calls: Vec<JoinHandle<Result<Value, SyncError>>>) -> Self {
        Self { calls }
    }

    /// Number of RPCs issued.
    pub fn rpc_count(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Wait for every reply. The first failure wins.
    pub async fn wait(self) -> Result<Vec<Value>, SyncError> {
        let mut replies = Vec::with_capacity(self.calls.len());
        for joined in join_all(self.calls).await {
            match joined {
                Ok(reply) => replies.push(reply?),
                Err(e) => return Err(SyncError::TaskFailed(e.to_string())),
            }
        }
        Ok(replies)
    }
}

/// Anticipated result of a mutator plus the RPCs that back it.
///
/// `value` is what the call reports without waiting for the server. No
/// rollback happens on failure; a caller that cares awaits
/// [`Optimistic::acknowledged`] and compensates.
#[derive(Debug)]
pub struct Optimistic<T> {
    pub value: T,
    pub pending: Pending,
}

impl<T> Optimistic<T> {
    pub(crate) fn new(value: T, pending: Pending) -> Self {
        Self { value, pending }
    }

    /// A result that needed no RPC.
    pub(crate) fn settled(value: T) -> Self {
        Self::new(value, Pending::default())
    }

    pub fn into_value(self) -> T {
        self.value
    }

    /// Wait for the server to accept every request, then yield the value.
    ///
    /// Acceptance is the RPC reply; the local mirror may still be waiting
    /// for the matching notification.
    pub async fn acknowledged(self) -> Result<T, SyncError> {
        self.pending.wait().await?;
        Ok(self.value)
    }
}

/// RPC addressing for one collection.
pub(crate) struct Remote {
    transport: Arc<dyn Transport>,
    backend: Backend,
    database_id: String,
    collection: String,
}

impl Remote {
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        backend: Backend,
        database_id: &str,
        collection: &str,
    ) -> Self {
        Self {
            transport,
            backend,
            database_id: database_id.to_string(),
            collection: collection.to_string(),
        }
    }

    fn request(&self, method: &str, extra: Vec<Value>) -> RpcRequest {
        let mut args = Vec::with_capacity(extra.len() + 2);
        args.push(Value::String(self.database_id.clone()));
        args.push(Value::String(self.collection.clone()));
        args.extend(extra);
        RpcRequest::new(self.backend, method, args)
    }

    /// Issue `method(db, collection, extra...)`.
    ///
    /// The request is handed to the transport before this returns. The
    /// reply is awaited on a spawned task so it completes even if nobody
    /// looks at the handle.
    pub(crate) fn call(
        &self,
        method: &'static str,
        extra: Vec<Value>,
    ) -> JoinHandle<Result<Value, SyncError>> {
        let reply = self.transport.call(self.request(method, extra));
        let service = self.backend.service();
        let collection = self.collection.clone();

        tokio::spawn(async move {
            reply.await.map_err(|source| {
                log::error!("{service}.{method} on {collection} failed: {source}");
                SyncError::Rpc { method, source }
            })
        })
    }

    fn retrieve(&self) -> BoxFuture<'static, Result<Value, RpcError>> {
        self.transport.call(self.request(method::RETRIEVE, Vec::new()))
    }

    fn subscribe(&self) -> BoxStream<'static, Result<Notification, RpcError>> {
        let events = self
            .backend
            .verbs()
            .iter()
            .map(|verb| {
                EventAddress::new(*verb, self.backend, &self.database_id, &self.collection)
                    .to_string()
            })
            .collect();
        self.transport.subscribe(events)
    }
}

/// Applies one notification to a mirror.
pub(crate) type ApplyFn = fn(&Mirror, Verb, &Notification);

/// Owns the notification task; aborts it when the last collection handle
/// goes away.
pub(crate) struct Driver {
    abort: AbortHandle,
}

impl Driver {
    /// Subscribe, request the initial retrieval, then spawn the apply loop.
    ///
    /// Subscription and retrieval are issued before anything is spawned, so
    /// every notification committed after the retrieval snapshot lands on
    /// the stream.
    pub(crate) fn spawn(remote: &Arc<Remote>, mirror: Arc<Mirror>, apply: ApplyFn) -> Self {
        let events = remote.subscribe();
        let retrieval = remote.retrieve();
        let handle = tokio::spawn(drive(remote.clone(), retrieval, events, mirror, apply));
        Self {
            abort: handle.abort_handle(),
        }
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        self.abort.abort();
    }
}

/// Records carried by a retrieval reply. `null` means none.
fn retrieved_records(mirror: &Mirror, reply: Value) -> Vec<Value> {
    match reply {
        Value::Array(records) => records,
        Value::Null => Vec::new(),
        other => {
            log::warn!(
                "retrieval of {} returned {other}, treating as empty",
                mirror.collection()
            );
            Vec::new()
        }
    }
}

async fn drive(
    remote: Arc<Remote>,
    retrieval: BoxFuture<'static, Result<Value, RpcError>>,
    mut events: BoxStream<'static, Result<Notification, RpcError>>,
    mirror: Arc<Mirror>,
    apply: ApplyFn,
) {
    let backend = remote.backend;
    match retrieval.await {
        Ok(reply) => mirror.synchronize(retrieved_records(&mirror, reply)),
        // Document notifications carry whole records and apply to an empty start.
        Err(e) if backend == Backend::Document => {
            log::error!("initial retrieval of {} failed: {e}", mirror.collection());
            mirror.synchronize(Vec::new());
        }
        Err(e) => {
            log::error!("initial retrieval of {} failed: {e}", mirror.collection());
            mirror.fail(e.to_string());
            return;
        }
    }

    while let Some(event) = events.next().await {
        let notification = match event {
            Ok(notification) => notification,
            Err(e) => {
                log::warn!("{}: {e}, resynchronizing", mirror.collection());
                events = remote.subscribe();
                match remote.retrieve().await {
                    Ok(reply) => mirror.reset(retrieved_records(&mirror, reply)),
                    Err(e) => {
                        log::error!("resynchronization of {} failed: {e}", mirror.collection());
                        mirror.fail(e.to_string());
                        return;
                    }
                }
                continue;
            }
        };

        match EventAddress::parse(&notification.event) {
            Ok(address) if address.backend == backend => apply(&mirror, address.verb, &notification),
            Ok(address) => log::warn!("{address} does not belong to a {backend:?} collection"),
            Err(e) => log::warn!("dropping notification: {e}"),
        }
    }

    log::debug!("notification stream for {} closed", mirror.collection());
}

/// Capability shared by both collection variants.
pub trait SyncedArray {
    fn mirror(&self) -> &Mirror;

    /// Deep-merge `fragment` into the record at `index` and send the merged
    /// record to the server.
    fn update_at(&self, index: usize, fragment: &Value) -> Result<Optimistic<Value>, SyncError>;

    /// Add records. Reports the anticipated new length.
    fn push(&self, records: Vec<Value>) -> Result<Optimistic<usize>, SyncError>;

    /// Add records at the front. Reports the anticipated new length.
    fn unshift(&self, records: Vec<Value>) -> Result<Optimistic<usize>, SyncError>;

    /// Remove the last record. Reports that record.
    fn pop(&self) -> Result<Optimistic<Value>, SyncError>;

    /// Remove the first record. Reports that record.
    fn shift(&self) -> Result<Optimistic<Value>, SyncError>;

    /// Replace `count` records starting at `index` (negative counts from the
    /// end) with `records`. Reports the records in that range at call time.
    fn splice(
        &self,
        index: isize,
        count: usize,
        records: Vec<Value>,
    ) -> Result<Optimistic<Vec<Value>>, SyncError>;

    fn collection(&self) -> &str {
        self.mirror().collection()
    }

    /// Register a change observer. It fires before every observer
    /// registered earlier and receives the length after the change.
    fn observe<F>(&self, observer: F) -> &Self
    where
        F: Fn(&Change, usize) + Send + Sync + 'static,
    {
        self.mirror().notifier().observe(Arc::new(observer));
        self
    }

    fn len(&self) -> usize {
        self.mirror().len()
    }

    fn is_empty(&self) -> bool {
        self.mirror().is_empty()
    }

    fn is_synchronized(&self) -> bool {
        self.mirror().is_synchronized()
    }

    /// Resolves once the initial retrieval has been applied.
    fn ready(&self) -> BoxFuture<'_, Result<(), SyncError>> {
        self.mirror().ready().boxed()
    }

    /// Record at `index`.
    fn at(&self, index: usize) -> Option<Value> {
        self.mirror().get(index)
    }

    fn index_of(&self, record: &Value) -> Option<usize> {
        self.mirror().with(|records| records.iter().position(|r| r == record))
    }

    fn last_index_of(&self, record: &Value) -> Option<usize> {
        self.mirror().with(|records| records.iter().rposition(|r| r == record))
    }

    fn join(&self, separator: &str) -> String {
        self.mirror().with(|records| {
            records
                .iter()
                .map(display_value)
                .collect::<Vec<_>>()
                .join(separator)
        })
    }

    /// Plain copy of a range; not synchronized.
    fn slice<R: RangeBounds<usize>>(&self, range: R) -> Vec<Value> {
        self.mirror().slice(range)
    }

    /// Reverse local order only. Never sent to the server.
    fn reverse(&self) -> &Self {
        self.mirror().reorder(|records| records.reverse());
        self
    }

    /// Sort local order only. Never sent to the server.
    fn sort_by<F>(&self, compare: F) -> &Self
    where
        F: FnMut(&Value, &Value) -> CmpOrdering,
    {
        self.mirror().reorder(|records| records.sort_by(compare));
        self
    }

    fn filter<F>(&self, mut predicate: F) -> Vec<Value>
    where
        F: FnMut(&Value, usize) -> bool,
    {
        self.mirror()
            .snapshot()
            .into_iter()
            .enumerate()
            .filter(|(i, record)| predicate(record, *i))
            .map(|(_, record)| record)
            .collect()
    }

    fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&Value, usize),
    {
        for (i, record) in self.mirror().snapshot().iter().enumerate() {
            f(record, i);
        }
    }

    fn every<F>(&self, mut predicate: F) -> bool
    where
        F: FnMut(&Value, usize) -> bool,
    {
        self.mirror()
            .snapshot()
            .iter()
            .enumerate()
            .all(|(i, record)| predicate(record, i))
    }

    fn some<F>(&self, mut predicate: F) -> bool
    where
        F: FnMut(&Value, usize) -> bool,
    {
        self.mirror()
            .snapshot()
            .iter()
            .enumerate()
            .any(|(i, record)| predicate(record, i))
    }

    fn reduce<B, F>(&self, init: B, mut f: F) -> B
    where
        F: FnMut(B, &Value, usize) -> B,
    {
        self.mirror()
            .snapshot()
            .iter()
            .enumerate()
            .fold(init, |acc, (i, record)| f(acc, record, i))
    }

    fn reduce_right<B, F>(&self, init: B, mut f: F) -> B
    where
        F: FnMut(B, &Value, usize) -> B,
    {
        self.mirror()
            .snapshot()
            .iter()
            .enumerate()
            .rev()
            .fold(init, |acc, (i, record)| f(acc, record, i))
    }

    /// Plain copy of every record.
    fn to_vec(&self) -> Vec<Value> {
        self.mirror().snapshot()
    }

    /// `SynchronizedArray(<collection>):[a, b, ...]`
    fn describe(&self) -> String {
        format!("SynchronizedArray({}):[{}]", self.collection(), self.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::ChangeKind;
    use serde_json::json;

    #[test]
    fn test_clamp_range() {
        assert_eq!(clamp_range(.., 4), (0, 4));
        assert_eq!(clamp_range(1..3, 4), (1, 3));
        assert_eq!(clamp_range(2..=9, 4), (2, 4));
        assert_eq!(clamp_range(6.., 4), (4, 4));
        assert_eq!(clamp_range(3..1, 4), (3, 3));
    }

    #[test]
    fn test_resolve_negative_index() {
        assert_eq!(resolve_index(-1, 5), 4);
        assert_eq!(resolve_index(-9, 5), 0);
        assert_eq!(resolve_index(2, 5), 2);
        assert_eq!(resolve_index(7, 5), 5);
    }

    #[test]
    fn test_batch_payload_shape() {
        assert_eq!(batch_payload(vec![json!({"a": 1})]), json!({"a": 1}));
        assert_eq!(batch_payload(vec![json!(1), json!(2)]), json!([1, 2]));
        assert_eq!(batch_records(&json!({"a": 1})), vec![json!({"a": 1})]);
        assert!(batch_records(&Value::Null).is_empty());
    }

    #[test]
    fn test_mirror_apply_notifies_with_length() {
        let mirror = Mirror::new("db", "photos");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        mirror
            .notifier()
            .observe(Arc::new(move |change: &Change, _: usize| s.lock().push(change.kind())));

        let applied = mirror.apply(|records| {
            records.push_back(json!({"_id": "a"}));
            Some(Change::Inserted { records: vec![json!({"_id": "a"})] })
        });

        assert!(applied);
        assert_eq!(mirror.len(), 1);
        assert_eq!(seen.lock().len(), 1);
        assert!(!mirror.apply(|_| None));
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn test_mirror_synchronizes_once() {
        let mirror = Mirror::new("db", "photos");
        mirror.synchronize(vec![json!(1), json!(2)]);
        mirror.synchronize(vec![json!(3)]);

        assert!(mirror.is_synchronized());
        assert_eq!(mirror.snapshot(), vec![json!(1), json!(2)]);
    }

    #[test]
    fn test_mirror_reset_replaces_records() {
        let mirror = Mirror::new("db", "slides");
        mirror.synchronize(vec![json!(3), json!(4)]);
        let seen = Arc::new(Mutex::new(None));
        let s = seen.clone();
        mirror
            .notifier()
            .observe(Arc::new(move |change: &Change, len: usize| *s.lock() = Some((change.kind(), len))));

        mirror.reset((0..5).map(|n| json!(n)).collect());

        assert_eq!(mirror.len(), 5);
        assert_eq!(mirror.first(), Some(json!(0)));
        assert_eq!(*seen.lock(), Some((ChangeKind::Reset, 5)));
        assert!(mirror.is_synchronized());
    }

    #[tokio::test]
    async fn test_ready_reports_failure() {
        let mirror = Mirror::new("db", "photos");
        mirror.fail("boom".to_string());
        let err = mirror.ready().await.unwrap_err();
        assert!(matches!(err, SyncError::RetrievalFailed { .. }));
    }

    #[tokio::test]
    async fn test_pending_wait_collects_replies() {
        let calls = vec![
            tokio::spawn(async { Ok(json!(1)) }),
            tokio::spawn(async { Ok(json!(2)) }),
        ];
        let replies = Pending::new(calls).wait().await.unwrap();
        assert_eq!(replies, vec![json!(1), json!(2)]);
    }

    #[tokio::test]
    async fn test_pending_wait_surfaces_failure() {
        let calls = vec![
            tokio::spawn(async { Ok(json!(1)) }),
            tokio::spawn(async {
                Err(SyncError::Rpc {
                    method: method::ADD,
                    source: RpcError::Remote(json!("disk full")),
                })
            }),
        ];
        let err = Pending::new(calls).wait().await.unwrap_err();
        assert!(matches!(err, SyncError::Rpc { method: "add", .. }));
    }
}
