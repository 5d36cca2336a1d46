//! Notification fan-out with per-subscriber event filters.
//!
//! One tokio broadcast channel carries every encoded notification frame.
//! Each subscriber gets its own receiver and keeps only the event names it
//! asked for, so ordering across names is the channel's publish order.
//!
//! A subscriber that falls more than `capacity` frames behind loses the
//! oldest ones. The stream reports that as [`RpcError::Lagged`] and then
//! carries on from the oldest frame still buffered.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use tokio::sync::broadcast::{self, error::RecvError};

use crate::error::RpcError;
use crate::protocol::{Envelope, Notification, ProtocolError};

/// Statistics for monitoring bus health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub notifications_published: u64,
    pub notifications_dropped: u64,
    pub active_subscribers: usize,
}

struct AtomicBroadcastStats {
    published: AtomicU64,
    dropped: AtomicU64,
}

/// Publish/subscribe bus for notification frames.
pub struct EventBus {
    sender: broadcast::Sender<Arc<Vec<u8>>>,
    capacity: usize,
    stats: Arc<AtomicBroadcastStats>,
}

impl EventBus {
    /// `capacity` frames are buffered per subscriber, at least one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            capacity,
            stats: Arc::new(AtomicBroadcastStats {
                published: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Encode and publish. Returns how many subscribers saw the frame.
    pub fn publish(&self, notification: Notification) -> Result<usize, ProtocolError> {
        let frame = Envelope::Notification(notification).encode()?;
        let receivers = self.sender.send(Arc::new(frame)).unwrap_or(0);
        self.stats.published.fetch_add(1, Ordering::Relaxed);
        Ok(receivers)
    }

    /// Ordered stream of notifications whose event name is in `events`.
    pub fn subscribe(&self, events: Vec<String>) -> BoxStream<'static, Result<Notification, RpcError>> {
        let receiver = self.sender.subscribe();
        let wanted: HashSet<String> = events.into_iter().collect();
        let stats = self.stats.clone();

        stream::unfold((receiver, wanted, stats), |(mut receiver, wanted, stats)| async move {
            loop {
                match receiver.recv().await {
                    Ok(frame) => match Envelope::decode(&frame) {
                        Ok(Envelope::Notification(n)) if wanted.contains(&n.event) => {
                            return Some((Ok(n), (receiver, wanted, stats)));
                        }
                        Ok(_) => continue,
                        Err(e) => log::warn!("undecodable frame on event bus: {e}"),
                    },
                    Err(RecvError::Lagged(n)) => {
                        stats.dropped.fetch_add(n, Ordering::Relaxed);
                        log::warn!("subscriber lagged by {n} notifications");
                        return Some((Err(RpcError::Lagged(n)), (receiver, wanted, stats)));
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        })
        .boxed()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            notifications_published: self.stats.published.load(Ordering::Relaxed),
            notifications_dropped: self.stats.dropped.load(Ordering::Relaxed),
            active_subscribers: self.subscriber_count(),
        }
    }
}
