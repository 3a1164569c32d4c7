use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::debug;

use super::{Envelope, Payload, RpcError, RpcKind, RPC_TIMEOUT};
use crate::core::identifier::{Contact, RpcId};

/// Binds outbound requests to their replies over the shared UDP socket.
///
/// Each request registers a one-shot waiter under its fresh [`RpcId`] before
/// the datagram leaves. The receive loop feeds everything it reads through
/// [`route`](Dispatcher::route): an envelope matching a waiter resolves it,
/// an unmatched request is handed back for the inbound handlers, and an
/// unmatched `OK` is a stale reply and is dropped.
#[derive(Debug)]
pub struct Dispatcher {
    socket: Arc<UdpSocket>,
    waiters: Mutex<HashMap<RpcId, oneshot::Sender<Envelope>>>,
}

/// Removes the waiter when the calling future completes or is cancelled, so
/// an abandoned call never leaves a dead entry behind.
struct Waiter<'a> {
    dispatcher: &'a Dispatcher,
    id: RpcId,
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        self.dispatcher.waiters.lock().unwrap().remove(&self.id);
    }
}

impl Dispatcher {
    pub fn new(socket: Arc<UdpSocket>) -> Self {
        Self {
            socket,
            waiters: Mutex::new(HashMap::new()),
        }
    }

    /// Send a request to `dest` and wait for the matching reply.
    ///
    /// The waiter either resolves with the reply or is removed on timeout,
    /// never both. A reply whose kind is not `OK` is a protocol violation
    /// and surfaces as [`RpcError::TypeMismatch`]; callers treat every error
    /// here as the peer being unreachable.
    pub async fn call(
        &self,
        dest: SocketAddr,
        kind: RpcKind,
        sender: Contact,
        payload: Payload,
    ) -> Result<Envelope, RpcError> {
        let id = RpcId::new_random();
        let request = Envelope {
            kind,
            payload,
            id: Some(id),
            sender: Some(sender),
        };

        let (tx, rx) = oneshot::channel();
        self.waiters.lock().unwrap().insert(id, tx);
        let _waiter = Waiter {
            dispatcher: self,
            id,
        };

        self.socket
            .send_to(&request.encode(), dest)
            .await
            .map_err(|source| RpcError::Send { addr: dest, source })?;

        let reply = match timeout(RPC_TIMEOUT, rx).await {
            Ok(Ok(reply)) => reply,
            // the waiter was dropped out from under us, or the clock ran out
            Ok(Err(_)) | Err(_) => return Err(RpcError::Timeout(dest)),
        };

        if reply.kind != RpcKind::Ok {
            return Err(RpcError::TypeMismatch {
                addr: dest,
                sent: kind,
                got: reply.kind,
            });
        }
        Ok(reply)
    }

    /// Route a received envelope. Returns the envelope back when it is an
    /// inbound request the caller should handle.
    pub fn route(&self, envelope: Envelope) -> Option<Envelope> {
        if let Some(id) = envelope.id {
            let waiter = self.waiters.lock().unwrap().remove(&id);
            if let Some(tx) = waiter {
                if tx.send(envelope).is_err() {
                    debug!("reply arrived after its caller gave up");
                }
                return None;
            }
        }
        if envelope.kind.is_request() {
            return Some(envelope);
        }
        debug!("stale reply dropped");
        None
    }

    /// Fire-and-forget transmit, used for replies.
    pub async fn send(&self, dest: SocketAddr, envelope: &Envelope) -> Result<(), RpcError> {
        self.socket
            .send_to(&envelope.encode(), dest)
            .await
            .map_err(|source| RpcError::Send { addr: dest, source })?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn waiter_count(&self) -> usize {
        self.waiters.lock().unwrap().len()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::core::identifier::NodeID;

    async fn dispatcher_on_ephemeral() -> (Dispatcher, SocketAddr) {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let addr = socket.local_addr().unwrap();
        (Dispatcher::new(socket), addr)
    }

    fn me(addr: SocketAddr) -> Contact {
        Contact::new(NodeID::random(), addr)
    }

    /// A peer task that answers every request with an `OK` reusing its id.
    fn spawn_echo_peer(socket: UdpSocket) -> SocketAddr {
        let addr = socket.local_addr().unwrap();
        let identity = me(addr);
        tokio::spawn(async move {
            let mut buf = [0u8; 8192];
            loop {
                let (len, src) = socket.recv_from(&mut buf).await.unwrap();
                let request = Envelope::decode(&buf[..len]).unwrap();
                let reply = Envelope::reply(request.id.unwrap(), identity, Payload::empty());
                socket.send_to(&reply.encode(), src).await.unwrap();
            }
        });
        addr
    }

    #[tokio::test]
    async fn call_correlates_request_and_reply() {
        let (dispatcher, our_addr) = dispatcher_on_ephemeral().await;
        let peer_addr = spawn_echo_peer(UdpSocket::bind("127.0.0.1:0").await.unwrap());

        // emulate the node's receive loop on the dispatcher's own socket
        let caller = me(our_addr);
        let call = dispatcher.call(peer_addr, RpcKind::Ping, caller, Payload::empty());
        let recv = async {
            let mut buf = [0u8; 8192];
            loop {
                let (len, _src) = dispatcher.socket.recv_from(&mut buf).await.unwrap();
                let envelope = Envelope::decode(&buf[..len]).unwrap();
                assert!(dispatcher.route(envelope).is_none(), "reply must match the waiter");
            }
        };

        let reply = tokio::select! {
            reply = call => reply.unwrap(),
            _ = recv => unreachable!("receive loop never returns"),
        };
        assert_eq!(reply.kind, RpcKind::Ok);
        assert_eq!(dispatcher.waiter_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn call_times_out_against_a_silent_peer() {
        let (dispatcher, our_addr) = dispatcher_on_ephemeral().await;
        // bound but never reads or replies
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let silent_addr = silent.local_addr().unwrap();

        let err = dispatcher
            .call(silent_addr, RpcKind::Ping, me(our_addr), Payload::empty())
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Timeout(addr) if addr == silent_addr));
        // the waiter was dropped exactly once, not leaked
        assert_eq!(dispatcher.waiter_count(), 0);
    }

    #[tokio::test]
    async fn stale_reply_is_dropped_and_requests_pass_through() {
        let (dispatcher, our_addr) = dispatcher_on_ephemeral().await;

        let stale = Envelope::reply(RpcId::new_random(), me(our_addr), Payload::empty());
        assert!(dispatcher.route(stale).is_none());

        let inbound = Envelope {
            kind: RpcKind::FindNode,
            payload: Payload::with_key(NodeID::random()),
            id: Some(RpcId::new_random()),
            sender: Some(me(our_addr)),
        };
        let routed = dispatcher.route(inbound.clone());
        assert_eq!(routed, Some(inbound));
    }

    #[tokio::test]
    async fn mismatched_reply_kind_is_an_error() {
        let (dispatcher, our_addr) = dispatcher_on_ephemeral().await;
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = peer.local_addr().unwrap();
        let peer_identity = me(peer_addr);
        // a confused peer that answers FIND_NODE with a STORE
        tokio::spawn(async move {
            let mut buf = [0u8; 8192];
            let (len, src) = peer.recv_from(&mut buf).await.unwrap();
            let request = Envelope::decode(&buf[..len]).unwrap();
            let mut reply = Envelope::reply(request.id.unwrap(), peer_identity, Payload::empty());
            reply.kind = RpcKind::Store;
            peer.send_to(&reply.encode(), src).await.unwrap();
        });

        let caller = me(our_addr);
        let call = dispatcher.call(peer_addr, RpcKind::FindNode, caller, Payload::empty());
        let recv = async {
            loop {
                let mut buf = [0u8; 8192];
                let (len, _src) = dispatcher.socket.recv_from(&mut buf).await.unwrap();
                let envelope = Envelope::decode(&buf[..len]).unwrap();
                dispatcher.route(envelope);
            }
        };

        let err = tokio::select! {
            result = call => result.unwrap_err(),
            _ = recv => unreachable!(),
        };
        assert!(matches!(
            err,
            RpcError::TypeMismatch { sent: RpcKind::FindNode, got: RpcKind::Store, .. }
        ));
    }
}
