//! The transport seam: request/response RPC plus ordered pub/sub.
//!
//! Collections never see frames or sockets. They hand an [`RpcRequest`] to
//! [`Transport::call`] and consume one ordered [`Notification`] stream from
//! [`Transport::subscribe`].

use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use serde_json::Value;

use crate::error::RpcError;
use crate::protocol::{Notification, RpcRequest};

/// RPC and broadcast channel shared by all collections of a client.
///
/// Contract:
/// - `call` enqueues the request before returning, so requests leave in
///   invocation order even if the returned futures are polled out of order.
///   The future resolves with the `(error, result)` pair folded into a
///   `Result`. There is no timeout: a reply that never comes leaves the
///   future pending.
/// - `subscribe` delivers every notification whose event name is listed,
///   on a single stream, in the order the transport received them. When
///   that cannot be honored the stream yields an error in place of the
///   lost notifications; the subscriber must treat its state as stale.
pub trait Transport: Send + Sync + 'static {
    fn call(&self, request: RpcRequest) -> BoxFuture<'static, Result<Value, RpcError>>;

    fn subscribe(&self, events: Vec<String>) -> BoxStream<'static, Result<Notification, RpcError>>;
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn call(&self, request: RpcRequest) -> BoxFuture<'static, Result<Value, RpcError>> {
        (**self).call(request)
    }

    fn subscribe(&self, events: Vec<String>) -> BoxStream<'static, Result<Notification, RpcError>> {
        (**self).subscribe(events)
    }
}
