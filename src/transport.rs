//! # Datagram Transport
//!
//! The engine consumes the [`Transport`] trait: start/stop lifecycle, a
//! stream of inbound requests, and correlated request/response sending.
//! [`UdpTransport`] is the built-in implementation — one bincode frame per
//! UDP datagram.
//!
//! The receive loop splits traffic in two: response frames are resolved
//! against the pending-request registry and never reach the dispatcher;
//! request frames are forwarded to the inbound channel. Undecodable frames
//! are dropped where they land.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};

use crate::contact::Address;
use crate::error::TransportError;
use crate::id::ID_LENGTH;
use crate::messages::{self, Message, RequestId};
use crate::pending::{PendingRequests, ResponseFuture};

/// Receive buffer; matches the frame size cap in `messages`.
const RECV_BUFFER: usize = 64 * 1024 + 1;

/// Inbound requests queued ahead of the dispatcher.
const INBOUND_QUEUE: usize = 128;

/// Abstract datagram transport consumed by the DHT engine.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Run the receive loop. Blocks until [`stop`](Transport::stop) is
    /// called or the underlying socket fails.
    async fn start(&self) -> Result<(), TransportError>;

    /// Signal the receive loop (and everything watching
    /// [`stopped`](Transport::stopped)) to shut down.
    fn stop(&self);

    /// A watch that flips to `true` once the transport is stopping.
    fn stopped(&self) -> watch::Receiver<bool>;

    /// Release transport resources; closes all outstanding futures.
    fn close(&self);

    /// Attach a fresh request ID to `msg`, send it, and return the future
    /// its response will resolve.
    async fn send_request(&self, msg: Message) -> Result<ResponseFuture, TransportError>;

    /// Send a response frame correlated to `request_id`.
    async fn send_response(&self, request_id: RequestId, msg: Message)
        -> Result<(), TransportError>;

    /// The inbound request stream. Yields `Some` once; the dispatcher owns
    /// the receiver afterwards.
    fn take_inbound(&self) -> Option<mpsc::Receiver<Message>>;

    fn local_address(&self) -> Address;
}

/// UDP implementation of [`Transport`].
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    local: Address,
    pending: PendingRequests,
    inbound_tx: mpsc::Sender<Message>,
    inbound_rx: StdMutex<Option<mpsc::Receiver<Message>>>,
    stop_tx: watch::Sender<bool>,
}

impl UdpTransport {
    pub async fn bind(addr: &str) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(addr).await?;
        let local = Address::from(socket.local_addr()?);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
        let (stop_tx, _) = watch::channel(false);
        Ok(Self {
            socket: Arc::new(socket),
            local,
            pending: PendingRequests::new(),
            inbound_tx,
            inbound_rx: StdMutex::new(Some(inbound_rx)),
            stop_tx,
        })
    }

    /// The address the socket is bound to.
    pub fn local_address(&self) -> Address {
        self.local
    }

    fn fresh_request_id() -> RequestId {
        let mut id = [0u8; ID_LENGTH];
        if getrandom::getrandom(&mut id).is_err() {
            // Only reachable on targets without an entropy source.
            id[0] = 1;
        }
        id
    }

    async fn send_frame(&self, msg: &Message) -> Result<(), TransportError> {
        let bytes = messages::serialize_message(msg)?;
        self.socket
            .send_to(&bytes, msg.receiver.address.socket_addr())
            .await?;
        Ok(())
    }

    fn is_stopping(&self) -> bool {
        *self.stop_tx.borrow()
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn start(&self) -> Result<(), TransportError> {
        let mut stopped = self.stopped();
        let mut buf = vec![0u8; RECV_BUFFER];
        loop {
            tokio::select! {
                _ = stopped.changed() => {
                    if *stopped.borrow() {
                        break;
                    }
                }
                received = self.socket.recv_from(&mut buf) => {
                    let (len, from) = received?;
                    let msg = match messages::deserialize_message(&buf[..len]) {
                        Ok(msg) => msg,
                        Err(e) => {
                            debug!(%from, error = %e, "dropping undecodable frame");
                            continue;
                        }
                    };
                    if msg.payload.is_response() {
                        if !self.pending.complete(msg) {
                            trace!(%from, "dropping uncorrelated response");
                        }
                    } else if self.inbound_tx.send(msg).await.is_err() {
                        // Dispatcher is gone; nothing left to serve.
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    fn stopped(&self) -> watch::Receiver<bool> {
        self.stop_tx.subscribe()
    }

    fn close(&self) {
        self.pending.cancel_all();
    }

    async fn send_request(&self, mut msg: Message) -> Result<ResponseFuture, TransportError> {
        if self.is_stopping() {
            return Err(TransportError::Stopped);
        }
        msg.request_id = Self::fresh_request_id();
        let future = self.pending.register(msg.request_id, msg.receiver.clone());
        if let Err(e) = self.send_frame(&msg).await {
            future.cancel();
            return Err(e);
        }
        trace!(
            kind = msg.payload.kind(),
            to = %msg.receiver.address,
            "request sent"
        );
        Ok(future)
    }

    async fn send_response(
        &self,
        request_id: RequestId,
        mut msg: Message,
    ) -> Result<(), TransportError> {
        if self.is_stopping() {
            return Err(TransportError::Stopped);
        }
        msg.request_id = request_id;
        self.send_frame(&msg).await
    }

    fn take_inbound(&self) -> Option<mpsc::Receiver<Message>> {
        self.inbound_rx.lock().expect("inbound lock").take()
    }

    fn local_address(&self) -> Address {
        self.local
    }
}
