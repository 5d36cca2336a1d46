//! List-backed synchronized collection.
//!
//! Mirrors an order-preserving server list. Identity is positional, so the
//! client never guesses: every mutation is a round-trip and the mirror only
//! replays what the server says it did, in arrival order.
//!
//! Notifications (`<verb>-<db>:<collection>`):
//!
//! | verb       | payload                      | local effect                |
//! |------------|------------------------------|-----------------------------|
//! | `inserted` | record or array, `push`/`unshift` | append / prepend       |
//! | `removed`  | record, `pop`/`shift`        | drop last / first           |
//! | `updated`  | index, record                | replace at index            |
//! | `spliced`  | index, count, records        | replace `[index, index+count)` |
//!
//! No identifier dedup or reconciliation happens here; correctness rests on
//! the store serializing operations and the transport keeping their order.

use std::fmt;
use std::sync::Arc;

use serde_json::{json, Value};

use crate::array::{
    batch_payload, batch_records, resolve_index, Driver, Mirror, Optimistic, Pending, Remote,
    SyncedArray,
};
use crate::error::SyncError;
use crate::merge::merge;
use crate::notifier::Change;
use crate::protocol::{method, Backend, Notification, Verb};
use crate::transport::Transport;

/// Synchronized mirror of a server-side list.
#[derive(Clone)]
pub struct ListArray {
    mirror: Arc<Mirror>,
    remote: Arc<Remote>,
    _driver: Arc<Driver>,
}

impl ListArray {
    /// Subscribe and start the initial retrieval. Needs a tokio runtime.
    pub fn open(transport: Arc<dyn Transport>, database_id: &str, collection: &str) -> Self {
        let remote = Arc::new(Remote::new(transport, Backend::List, database_id, collection));
        let mirror = Arc::new(Mirror::new(database_id, collection));
        let driver = Driver::spawn(&remote, mirror.clone(), apply_notification);
        log::debug!("opened list collection {database_id}:{collection}");

        Self {
            mirror,
            remote,
            _driver: Arc::new(driver),
        }
    }

    fn insert(&self, method: &'static str, records: Vec<Value>) -> Result<Optimistic<usize>, SyncError> {
        if records.is_empty() {
            return Ok(Optimistic::settled(self.len()));
        }
        let anticipated = self.len() + records.len();
        let call = self.remote.call(method, vec![batch_payload(records)]);
        Ok(Optimistic::new(anticipated, Pending::new(vec![call])))
    }
}

impl SyncedArray for ListArray {
    fn mirror(&self) -> &Mirror {
        &self.mirror
    }

    /// Sends the merged record. The mirror keeps the old one until the
    /// `updated` notification arrives.
    fn update_at(&self, index: usize, fragment: &Value) -> Result<Optimistic<Value>, SyncError> {
        let mut merged = self.mirror.get(index).ok_or(SyncError::IndexOutOfRange {
            index,
            len: self.len(),
        })?;
        merge(&mut merged, fragment);

        let call = self.remote.call(method::UPDATE, vec![json!(index), merged.clone()]);
        Ok(Optimistic::new(merged, Pending::new(vec![call])))
    }

    fn push(&self, records: Vec<Value>) -> Result<Optimistic<usize>, SyncError> {
        self.insert(method::PUSH, records)
    }

    fn unshift(&self, records: Vec<Value>) -> Result<Optimistic<usize>, SyncError> {
        self.insert(method::UNSHIFT, records)
    }

    fn pop(&self) -> Result<Optimistic<Value>, SyncError> {
        let last = self.mirror.last().ok_or(SyncError::Empty)?;
        let call = self.remote.call(method::POP, Vec::new());
        Ok(Optimistic::new(last, Pending::new(vec![call])))
    }

    fn shift(&self) -> Result<Optimistic<Value>, SyncError> {
        let first = self.mirror.first().ok_or(SyncError::Empty)?;
        let call = self.remote.call(method::SHIFT, Vec::new());
        Ok(Optimistic::new(first, Pending::new(vec![call])))
    }

    /// A single atomic `splice` RPC. The count sent is clamped to the
    /// records present at call time.
    fn splice(
        &self,
        index: isize,
        count: usize,
        records: Vec<Value>,
    ) -> Result<Optimistic<Vec<Value>>, SyncError> {
        let start = resolve_index(index, self.len());
        let removed = self.mirror.slice(start..start.saturating_add(count));

        let call = self.remote.call(
            method::SPLICE,
            vec![json!(start), json!(removed.len()), Value::Array(records)],
        );
        Ok(Optimistic::new(removed, Pending::new(vec![call])))
    }
}

impl fmt::Display for ListArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

impl fmt::Debug for ListArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListArray")
            .field("collection", &self.mirror.collection())
            .field("len", &self.mirror.len())
            .field("state", &self.mirror.state())
            .finish()
    }
}

pub(crate) fn apply_notification(mirror: &Mirror, verb: Verb, notification: &Notification) {
    match verb {
        Verb::Inserted => on_inserted(mirror, notification.arg(0), notification.arg(1)),
        Verb::Removed => on_removed(mirror, notification.arg(1)),
        Verb::Updated => on_updated(mirror, notification.arg(0), notification.arg(1)),
        Verb::Spliced => on_spliced(
            mirror,
            notification.arg(0),
            notification.arg(1),
            notification.arg(2),
        ),
    }
}

fn as_index(value: &Value) -> Option<usize> {
    value.as_u64().and_then(|n| usize::try_from(n).ok())
}

fn on_inserted(mirror: &Mirror, payload: &Value, mode: &Value) {
    let incoming = batch_records(payload);

    match mode.as_str() {
        Some(method::PUSH) => {
            mirror.apply(|records| {
                records.extend(incoming.iter().cloned());
                Some(Change::Pushed { records: incoming })
            });
        }
        Some(method::UNSHIFT) => {
            mirror.apply(|records| {
                for record in incoming.iter().rev() {
                    records.push_front(record.clone());
                }
                Some(Change::Unshifted { records: incoming })
            });
        }
        _ => log::warn!("{}: unknown insert mode {mode}", mirror.collection()),
    }
}

fn on_removed(mirror: &Mirror, mode: &Value) {
    let applied = match mode.as_str() {
        Some(method::POP) => mirror.apply(|records| {
            records.pop_back().map(|record| Change::Popped { record })
        }),
        Some(method::SHIFT) => mirror.apply(|records| {
            records.pop_front().map(|record| Change::Shifted { record })
        }),
        _ => {
            log::warn!("{}: unknown remove mode {mode}", mirror.collection());
            return;
        }
    };

    if !applied {
        log::warn!("{}: {mode} notification on an empty mirror", mirror.collection());
    }
}

fn on_updated(mirror: &Mirror, index: &Value, record: &Value) {
    let Some(index) = as_index(index) else {
        log::warn!("{}: updated notification with bad index {index}", mirror.collection());
        return;
    };

    let applied = mirror.apply(|records| {
        let slot = records.get_mut(index)?;
        *slot = record.clone();
        Some(Change::Updated {
            record: record.clone(),
            index: Some(index),
        })
    });

    if !applied {
        log::warn!("{}: updated index {index} out of range", mirror.collection());
    }
}

fn on_spliced(mirror: &Mirror, index: &Value, count: &Value, replacement: &Value) {
    let Some(index) = as_index(index) else {
        log::warn!("{}: spliced notification with bad index {index}", mirror.collection());
        return;
    };
    let count = as_index(count).unwrap_or(0);
    let incoming = batch_records(replacement);

    mirror.apply(|records| {
        let start = index.min(records.len());
        let end = start.saturating_add(count).min(records.len());

        let mut tail = records.split_off(end);
        records.truncate(start);
        records.extend(incoming.iter().cloned());
        records.append(&mut tail);

        Some(Change::Spliced {
            index: start,
            count: end - start,
            records: incoming,
        })
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn synced(records: Vec<Value>) -> Mirror {
        let mirror = Mirror::new("db", "slides");
        mirror.synchronize(records);
        mirror
    }

    fn apply(mirror: &Mirror, verb: Verb, args: Vec<Value>) {
        let n = Notification {
            event: format!("{}-db:slides", verb.as_str()),
            args,
        };
        apply_notification(mirror, verb, &n);
    }

    #[test]
    fn test_push_and_unshift_modes() {
        let mirror = synced(vec![json!("b")]);
        apply(&mirror, Verb::Inserted, vec![json!("c"), json!("push")]);
        apply(&mirror, Verb::Inserted, vec![json!(["x", "a"]), json!("unshift")]);

        assert_eq!(mirror.snapshot(), vec![json!("x"), json!("a"), json!("b"), json!("c")]);
        assert_eq!(mirror.len(), 4);
    }

    #[test]
    fn test_pop_and_shift_modes() {
        let mirror = synced(vec![json!(1), json!(2), json!(3)]);
        apply(&mirror, Verb::Removed, vec![json!(3), json!("pop")]);
        apply(&mirror, Verb::Removed, vec![json!(1), json!("shift")]);

        assert_eq!(mirror.snapshot(), vec![json!(2)]);
    }

    #[test]
    fn test_unknown_mode_is_ignored() {
        let mirror = synced(vec![json!(1)]);
        apply(&mirror, Verb::Inserted, vec![json!(2), json!("insertAt")]);
        apply(&mirror, Verb::Removed, vec![json!(1), json!("splice")]);
        assert_eq!(mirror.snapshot(), vec![json!(1)]);
    }

    #[test]
    fn test_updated_by_index() {
        let mirror = synced(vec![json!({"n": 1}), json!({"n": 2})]);
        apply(&mirror, Verb::Updated, vec![json!(1), json!({"n": 20})]);
        apply(&mirror, Verb::Updated, vec![json!(5), json!({"n": 50})]);

        assert_eq!(mirror.snapshot(), vec![json!({"n": 1}), json!({"n": 20})]);
    }

    #[test]
    fn test_splice_replaces_range_in_place() {
        let mirror = synced(vec![json!(0), json!(1), json!(2), json!(3), json!(4)]);
        apply(&mirror, Verb::Spliced, vec![json!(1), json!(2), json!(["a", "b", "c"])]);

        assert_eq!(
            mirror.snapshot(),
            vec![json!(0), json!("a"), json!("b"), json!("c"), json!(3), json!(4)]
        );
    }

    #[test]
    fn test_splice_without_replacement_removes() {
        let mirror = synced(vec![json!(0), json!(1), json!(2)]);
        apply(&mirror, Verb::Spliced, vec![json!(0), json!(2), Value::Null]);
        assert_eq!(mirror.snapshot(), vec![json!(2)]);
    }

    #[test]
    fn test_splice_past_end_is_clamped() {
        let mirror = synced(vec![json!(0), json!(1)]);
        let seen = Arc::new(parking_lot::Mutex::new(None));
        let s = seen.clone();
        mirror
            .notifier()
            .observe(Arc::new(move |change: &Change, _: usize| *s.lock() = Some(change.clone())));

        apply(&mirror, Verb::Spliced, vec![json!(1), json!(10), json!(["z"])]);

        assert_eq!(mirror.snapshot(), vec![json!(0), json!("z")]);
        assert_eq!(
            *seen.lock(),
            Some(Change::Spliced { index: 1, count: 1, records: vec![json!("z")] })
        );
    }
}
