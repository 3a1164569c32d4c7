use std::net::SocketAddr;

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use tokio::time::Duration;

use crate::core::identifier::{Contact, Key, RpcId};
use crate::core::storage::Value;

pub mod dispatcher;
pub mod lookup;

/// How long an outbound request may wait for its reply.
pub const RPC_TIMEOUT: Duration = Duration::from_secs(2);

/// The five message kinds on the wire. Requests are everything but `OK`;
/// every reply is an `OK` reusing the request's ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcKind {
    #[serde(rename = "PING")]
    Ping,
    #[serde(rename = "STORE")]
    Store,
    #[serde(rename = "FIND_NODE")]
    FindNode,
    #[serde(rename = "FIND_VALUE")]
    FindValue,
    #[serde(rename = "OK")]
    Ok,
}

impl RpcKind {
    pub fn is_request(self) -> bool {
        !matches!(self, RpcKind::Ok)
    }
}

/// Accept `null` wherever a field may also be missing entirely.
fn nullable<'de, D, T>(d: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(d)?.unwrap_or_default())
}

/// The data an RPC carries. Every field is optional; a missing key and an
/// explicit `null` decode identically.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    #[serde(default)]
    pub key: Option<Key>,
    #[serde(default)]
    pub value: Option<Value>,
    #[serde(default)]
    pub contacts: Option<Vec<Contact>>,
}

impl Payload {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_key(key: Key) -> Self {
        Payload {
            key: Some(key),
            ..Self::default()
        }
    }

    pub fn with_key_value(key: Key, value: Value) -> Self {
        Payload {
            key: Some(key),
            value: Some(value),
            ..Self::default()
        }
    }

    pub fn with_value(value: Value) -> Self {
        Payload {
            value: Some(value),
            ..Self::default()
        }
    }

    pub fn with_contacts(contacts: Vec<Contact>) -> Self {
        Payload {
            contacts: Some(contacts),
            ..Self::default()
        }
    }
}

/// One datagram carries exactly one envelope, as self-describing JSON.
/// Unknown `type` strings are a decode error; everything else is tolerant of
/// absent fields, so peer misbehaviour can never panic the node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: RpcKind,
    #[serde(default, deserialize_with = "nullable")]
    pub payload: Payload,
    #[serde(default)]
    pub id: Option<RpcId>,
    #[serde(default)]
    pub sender: Option<Contact>,
}

impl Envelope {
    /// A reply to the request carrying `id`; replies are always `OK`.
    pub fn reply(id: RpcId, sender: Contact, payload: Payload) -> Self {
        Envelope {
            kind: RpcKind::Ok,
            payload,
            id: Some(id),
            sender: Some(sender),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("envelope serializes")
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, RpcError> {
        serde_json::from_slice(bytes).map_err(RpcError::Decode)
    }
}

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("request to {0} timed out")]
    Timeout(SocketAddr),
    #[error("datagram send to {addr} failed: {source}")]
    Send {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed envelope: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("{addr} answered a {sent:?} request with {got:?}")]
    TypeMismatch {
        addr: SocketAddr,
        sent: RpcKind,
        got: RpcKind,
    },
}
