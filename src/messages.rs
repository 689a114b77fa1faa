//! # Wire Protocol Messages
//!
//! Every frame on the wire is one [`Message`]: a correlation ID, the sender
//! and receiver contacts, a tagged payload, and an optional error string.
//! Payloads come in request/response pairs:
//!
//! | Operation | Request | Response |
//! |-----------|---------|----------|
//! | Ping | `PingRequest` | `PingResponse` |
//! | FindNode | `FindNodeRequest { target }` | `FindNodeResponse { closest }` |
//! | FindValue | `FindValueRequest { target }` | `FindValueResponse { value, closest }` |
//! | Store | `StoreRequest { data }` | `StoreResponse` |
//! | RPC | `RpcRequest { method, args }` | `RpcResponse { success, result, error }` |
//!
//! Messages are serialized with bincode under a hard size limit; one
//! message per datagram. Oversized or malformed frames fail to decode and
//! are dropped by the transport.

use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::contact::{Contact, Origin};
use crate::id::{NodeId, ID_LENGTH};
use crate::storage::Key;

/// Correlates a response with its outstanding request. Random per request,
/// assigned by the transport when the request is sent.
pub type RequestId = [u8; ID_LENGTH];

/// Hard cap on an encoded message. Fits comfortably in one UDP datagram.
pub const MAX_MESSAGE_SIZE: u64 = 64 * 1024;

fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_MESSAGE_SIZE)
        .with_fixint_encoding()
}

pub fn serialize_message(msg: &Message) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(msg)
}

pub fn deserialize_message(bytes: &[u8]) -> Result<Message, bincode::Error> {
    deserialize_bounded(bytes)
}

/// Deserialize with the size limit enforced.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

/// Request and response bodies for every overlay operation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Payload {
    PingRequest,
    PingResponse,
    FindNodeRequest { target: NodeId },
    FindNodeResponse { closest: Vec<Contact> },
    FindValueRequest { target: Key },
    FindValueResponse {
        value: Option<Vec<u8>>,
        closest: Vec<Contact>,
    },
    StoreRequest { data: Vec<u8> },
    StoreResponse,
    RpcRequest {
        method: String,
        args: Vec<Vec<u8>>,
    },
    RpcResponse {
        success: bool,
        result: Vec<u8>,
        error: String,
    },
}

impl Payload {
    pub fn is_response(&self) -> bool {
        matches!(
            self,
            Payload::PingResponse
                | Payload::FindNodeResponse { .. }
                | Payload::FindValueResponse { .. }
                | Payload::StoreResponse
                | Payload::RpcResponse { .. }
        )
    }

    /// Short label for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::PingRequest => "ping",
            Payload::PingResponse => "ping-response",
            Payload::FindNodeRequest { .. } => "find-node",
            Payload::FindNodeResponse { .. } => "find-node-response",
            Payload::FindValueRequest { .. } => "find-value",
            Payload::FindValueResponse { .. } => "find-value-response",
            Payload::StoreRequest { .. } => "store",
            Payload::StoreResponse => "store-response",
            Payload::RpcRequest { .. } => "rpc",
            Payload::RpcResponse { .. } => "rpc-response",
        }
    }
}

/// One wire frame.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub request_id: RequestId,
    pub sender: Contact,
    pub receiver: Contact,
    pub payload: Payload,
    pub error: Option<String>,
}

impl Message {
    /// A request frame. The request ID is filled in by the transport.
    pub fn request(sender: Contact, receiver: Contact, payload: Payload) -> Self {
        Self {
            request_id: [0u8; ID_LENGTH],
            sender,
            receiver,
            payload,
            error: None,
        }
    }

    pub fn ping(sender: Contact, receiver: Contact) -> Self {
        Self::request(sender, receiver, Payload::PingRequest)
    }

    /// A response frame answering `inbound`, addressed back to its sender.
    pub fn response(inbound: &Message, sender: Contact, payload: Payload) -> Self {
        Self {
            request_id: inbound.request_id,
            sender,
            receiver: inbound.sender.clone(),
            payload,
            error: None,
        }
    }

    /// Whether this frame is addressed to one of `origin`'s identities.
    ///
    /// A frame carrying a receiver ID must name one of our identities; a
    /// frame without one (first contact with a seed) must name our address.
    pub fn is_for(&self, origin: &Origin) -> bool {
        match &self.receiver.id {
            Some(id) => origin.position(id).is_some(),
            None => self.receiver.address == origin.address(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contact::Address;

    fn addr(port: u16) -> Address {
        Address::new(&format!("127.0.0.1:{port}")).unwrap()
    }

    fn contact(seed: u8, port: u16) -> Contact {
        Contact::new(NodeId::from_bytes([seed; ID_LENGTH]), addr(port))
    }

    #[test]
    fn round_trip_all_payload_kinds() {
        let sender = contact(1, 4001);
        let receiver = contact(2, 4002);
        let target = NodeId::from_bytes([3; ID_LENGTH]);

        let payloads = vec![
            Payload::PingRequest,
            Payload::PingResponse,
            Payload::FindNodeRequest { target },
            Payload::FindNodeResponse {
                closest: vec![contact(4, 4004)],
            },
            Payload::FindValueRequest {
                target: *target.as_bytes(),
            },
            Payload::FindValueResponse {
                value: Some(b"data".to_vec()),
                closest: vec![],
            },
            Payload::StoreRequest {
                data: b"data".to_vec(),
            },
            Payload::StoreResponse,
            Payload::RpcRequest {
                method: "echo".into(),
                args: vec![b"x".to_vec(), b"y".to_vec()],
            },
            Payload::RpcResponse {
                success: true,
                result: b"ok".to_vec(),
                error: String::new(),
            },
        ];

        for payload in payloads {
            let mut msg = Message::request(sender.clone(), receiver.clone(), payload);
            msg.request_id = [9; ID_LENGTH];
            let bytes = serialize_message(&msg).expect("serialize");
            let decoded = deserialize_message(&bytes).expect("deserialize");
            assert_eq!(decoded.request_id, msg.request_id);
            assert_eq!(decoded.sender, msg.sender);
            assert_eq!(decoded.receiver, msg.receiver);
            assert_eq!(decoded.payload.kind(), msg.payload.kind());
        }
    }

    #[test]
    fn malformed_and_truncated_frames_rejected() {
        assert!(deserialize_message(&[0xff, 0xfe, 0xfd]).is_err());

        let msg = Message::ping(contact(1, 4001), contact(2, 4002));
        let bytes = serialize_message(&msg).unwrap();
        assert!(deserialize_message(&bytes[..bytes.len() / 2]).is_err());
    }

    #[test]
    fn response_classification() {
        assert!(!Payload::PingRequest.is_response());
        assert!(Payload::PingResponse.is_response());
        assert!(!Payload::StoreRequest { data: vec![] }.is_response());
        assert!(Payload::StoreResponse.is_response());
    }

    #[test]
    fn response_echoes_request_id_and_swaps_direction() {
        let mut inbound = Message::ping(contact(1, 4001), contact(2, 4002));
        inbound.request_id = [7; ID_LENGTH];

        let reply = Message::response(&inbound, contact(2, 4002), Payload::PingResponse);
        assert_eq!(reply.request_id, inbound.request_id);
        assert_eq!(reply.receiver, inbound.sender);
    }

    #[test]
    fn is_for_matches_identity_or_bare_address() {
        let our_id = NodeId::from_bytes([1; ID_LENGTH]);
        let origin = Origin::new(vec![our_id], addr(4001));
        let sender = contact(9, 4009);

        // Addressed to our identity.
        let msg = Message::ping(sender.clone(), Contact::new(our_id, addr(4001)));
        assert!(msg.is_for(&origin));

        // Addressed to a foreign identity at our address.
        let foreign = Contact::new(NodeId::from_bytes([2; ID_LENGTH]), addr(4001));
        let msg = Message::ping(sender.clone(), foreign);
        assert!(!msg.is_for(&origin));

        // No identity, our address (first contact with a seed).
        let msg = Message::ping(sender.clone(), Contact::seed(addr(4001)));
        assert!(msg.is_for(&origin));

        // No identity, wrong address.
        let msg = Message::ping(sender, Contact::seed(addr(4999)));
        assert!(!msg.is_for(&origin));
    }
}
