//! Document-backed synchronized collection.
//!
//! Mirrors a collection held in a store with no intrinsic order. The `_id`
//! field is the only link between a local record and its remote copy, so:
//!
//! - `push`/`unshift` are the same `add`, `pop`/`shift` the same `remove`
//! - `reverse`/`sort_by` stay local
//! - inserts are deduplicated by `_id`
//!
//! Notifications (`<verb>-<db>.<collection>`):
//!
//! | verb       | payload             | local effect                         |
//! |------------|---------------------|--------------------------------------|
//! | `inserted` | record or array     | append records whose `_id` is new    |
//! | `removed`  | `_id`               | remove the matching record           |
//! | `updated`  | record              | replace the matching record          |

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::array::{
    batch_payload, batch_records, record_id, resolve_index, Driver, Mirror, Optimistic, Pending,
    Remote, SyncedArray,
};
use crate::error::SyncError;
use crate::merge::merge;
use crate::notifier::Change;
use crate::protocol::{method, Backend, Notification, Verb};
use crate::transport::Transport;

/// Synchronized mirror of a document collection.
///
/// Cloning yields another handle to the same mirror. The notification task
/// stops when the last handle is dropped.
#[derive(Clone)]
pub struct DocumentArray {
    mirror: Arc<Mirror>,
    remote: Arc<Remote>,
    _driver: Arc<Driver>,
}

impl DocumentArray {
    /// Subscribe and start the initial retrieval. Needs a tokio runtime.
    pub fn open(transport: Arc<dyn Transport>, database_id: &str, collection: &str) -> Self {
        let remote = Arc::new(Remote::new(transport, Backend::Document, database_id, collection));
        let mirror = Arc::new(Mirror::new(database_id, collection));
        let driver = Driver::spawn(&remote, mirror.clone(), apply_notification);
        log::debug!("opened document collection {database_id}.{collection}");

        Self {
            mirror,
            remote,
            _driver: Arc::new(driver),
        }
    }

    fn add(&self, records: Vec<Value>) -> Result<Optimistic<usize>, SyncError> {
        if records.is_empty() {
            return Ok(Optimistic::settled(self.len()));
        }
        let anticipated = self.len() + records.len();
        let call = self.remote.call(method::ADD, vec![batch_payload(records)]);
        Ok(Optimistic::new(anticipated, Pending::new(vec![call])))
    }

    fn remove(&self, record: Option<Value>) -> Result<Optimistic<Value>, SyncError> {
        let record = record.ok_or(SyncError::Empty)?;
        let id = record_id(&record).cloned().ok_or(SyncError::MissingId)?;
        let call = self.remote.call(method::REMOVE, vec![id]);
        Ok(Optimistic::new(record, Pending::new(vec![call])))
    }
}

impl SyncedArray for DocumentArray {
    fn mirror(&self) -> &Mirror {
        &self.mirror
    }

    /// The merge lands in the local record immediately; there is no
    /// rollback if the update RPC fails.
    fn update_at(&self, index: usize, fragment: &Value) -> Result<Optimistic<Value>, SyncError> {
        let len = self.len();
        let merged = self
            .mirror
            .modify_at(index, |record| {
                let id = record_id(record).cloned().ok_or(SyncError::MissingId)?;
                merge(record, fragment);
                Ok::<_, SyncError>((id, record.clone()))
            })
            .ok_or(SyncError::IndexOutOfRange { index, len })?;
        let (id, merged) = merged?;

        let call = self.remote.call(method::UPDATE, vec![id, merged.clone()]);
        Ok(Optimistic::new(merged, Pending::new(vec![call])))
    }

    fn push(&self, records: Vec<Value>) -> Result<Optimistic<usize>, SyncError> {
        self.add(records)
    }

    fn unshift(&self, records: Vec<Value>) -> Result<Optimistic<usize>, SyncError> {
        self.add(records)
    }

    fn pop(&self) -> Result<Optimistic<Value>, SyncError> {
        self.remove(self.mirror.last())
    }

    fn shift(&self) -> Result<Optimistic<Value>, SyncError> {
        self.remove(self.mirror.first())
    }

    /// One `remove` per record in the range and one `add` per new record.
    /// Nothing is sent if any record in the range lacks an `_id`.
    fn splice(
        &self,
        index: isize,
        count: usize,
        records: Vec<Value>,
    ) -> Result<Optimistic<Vec<Value>>, SyncError> {
        let start = resolve_index(index, self.len());
        let removed = self.mirror.slice(start..start.saturating_add(count));
        let ids = removed
            .iter()
            .map(|record| record_id(record).cloned().ok_or(SyncError::MissingId))
            .collect::<Result<Vec<_>, _>>()?;

        let mut calls = Vec::with_capacity(ids.len() + records.len());
        for id in ids {
            calls.push(self.remote.call(method::REMOVE, vec![id]));
        }
        for record in records {
            calls.push(self.remote.call(method::ADD, vec![record]));
        }

        Ok(Optimistic::new(removed, Pending::new(calls)))
    }
}

impl fmt::Display for DocumentArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

impl fmt::Debug for DocumentArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DocumentArray")
            .field("collection", &self.mirror.collection())
            .field("len", &self.mirror.len())
            .field("state", &self.mirror.state())
            .finish()
    }
}

pub(crate) fn apply_notification(mirror: &Mirror, verb: Verb, notification: &Notification) {
    let payload = notification.arg(0);
    match verb {
        Verb::Inserted => on_inserted(mirror, payload),
        Verb::Removed => on_removed(mirror, payload),
        Verb::Updated => on_updated(mirror, payload),
        Verb::Spliced => {
            log::warn!("{} is document-backed, ignoring spliced", mirror.collection());
        }
    }
}

fn on_inserted(mirror: &Mirror, payload: &Value) {
    let incoming = batch_records(payload);
    if incoming.is_empty() {
        return;
    }

    mirror.apply(|records| {
        let mut inserted = Vec::new();
        for record in incoming {
            let known = record_id(&record)
                .is_some_and(|id| records.iter().any(|held| record_id(held) == Some(id)));
            if known {
                continue;
            }
            records.push_back(record.clone());
            inserted.push(record);
        }
        (!inserted.is_empty()).then_some(Change::Inserted { records: inserted })
    });
}

fn on_removed(mirror: &Mirror, id: &Value) {
    let removed = mirror.apply(|records| {
        let index = records.iter().rposition(|held| record_id(held) == Some(id))?;
        if index == 0 {
            records.pop_front();
        } else if index == records.len() - 1 {
            records.pop_back();
        } else {
            records.remove(index);
        }
        Some(Change::Removed { id: id.clone() })
    });

    if !removed {
        log::info!("{}: removed notification for unknown _id {id}", mirror.collection());
    }
}

fn on_updated(mirror: &Mirror, record: &Value) {
    let Some(id) = record_id(record) else {
        return;
    };

    mirror.apply(|records| {
        let index = records.iter().rposition(|held| record_id(held) == Some(id))?;
        records[index] = record.clone();
        Some(Change::Updated {
            record: record.clone(),
            index: Some(index),
        })
    });
}
