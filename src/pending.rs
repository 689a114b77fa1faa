//! # Pending Requests and Response Futures
//!
//! Every outbound request registers an entry here keyed by its request ID.
//! The transport's receive loop hands inbound responses to
//! [`PendingRequests::complete`], which delivers to the matching
//! [`ResponseFuture`] at most once. Timeouts are driven by the caller:
//! wrap [`ResponseFuture::result`] in a deadline and cancel on expiry.
//!
//! Cancellation is idempotent, and a dropped future cancels its own entry,
//! so an abandoned lookup round cannot leave registrations behind. A
//! response arriving after cancellation finds no entry and is discarded.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;
use tracing::trace;

use crate::contact::Contact;
use crate::messages::{Message, RequestId};

struct Pending {
    expected: Contact,
    tx: oneshot::Sender<Message>,
}

/// Registry of outstanding requests, shared between the transport's send
/// path and its receive loop.
#[derive(Clone, Default)]
pub struct PendingRequests {
    inner: Arc<Mutex<HashMap<RequestId, Pending>>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an outstanding request addressed to `expected`.
    pub fn register(&self, request_id: RequestId, expected: Contact) -> ResponseFuture {
        let (tx, rx) = oneshot::channel();
        let mut map = self.inner.lock().expect("pending lock");
        map.insert(request_id, Pending { expected, tx });
        ResponseFuture {
            request_id,
            rx: Some(rx),
            registry: self.clone(),
        }
    }

    /// Deliver a response to its waiting future. Returns `false` when no
    /// matching registration exists or the response sender does not match
    /// the peer the request was addressed to (the entry is kept in that
    /// case; only a matching response consumes it).
    pub fn complete(&self, msg: Message) -> bool {
        let mut map = self.inner.lock().expect("pending lock");
        match map.get(&msg.request_id) {
            Some(pending) if sender_matches(&pending.expected, &msg.sender) => {}
            Some(_) => {
                trace!(kind = msg.payload.kind(), "response sender mismatch, dropping");
                return false;
            }
            None => return false,
        }
        let pending = map.remove(&msg.request_id).expect("entry checked above");
        drop(map);
        pending.tx.send(msg).is_ok()
    }

    /// Remove a registration, closing its future without a message.
    pub fn cancel(&self, request_id: &RequestId) -> bool {
        let mut map = self.inner.lock().expect("pending lock");
        map.remove(request_id).is_some()
    }

    /// Close every outstanding future. Used on transport shutdown.
    pub fn cancel_all(&self) {
        let mut map = self.inner.lock().expect("pending lock");
        map.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("pending lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A request was sent to a peer with an ID; the response must come back
/// under that ID. A request to a bare seed address matches by address.
fn sender_matches(expected: &Contact, sender: &Contact) -> bool {
    match (&expected.id, &sender.id) {
        (Some(expected_id), Some(sender_id)) => expected_id == sender_id,
        _ => expected.address == sender.address,
    }
}

/// One-shot handle to a response.
pub struct ResponseFuture {
    request_id: RequestId,
    rx: Option<oneshot::Receiver<Message>>,
    registry: PendingRequests,
}

impl ResponseFuture {
    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    /// Wait for the response. `None` means the future was cancelled (or the
    /// result already consumed); callers treat that as a closed channel.
    pub async fn result(&mut self) -> Option<Message> {
        let rx = self.rx.take()?;
        rx.await.ok()
    }

    /// Idempotent. Responses arriving afterwards are discarded.
    pub fn cancel(&self) {
        self.registry.cancel(&self.request_id);
    }
}

impl Drop for ResponseFuture {
    fn drop(&mut self) {
        self.registry.cancel(&self.request_id);
    }
}
