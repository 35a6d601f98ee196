//! An in-process transport.
//!
//! Peers register on a shared [`MemoryNetwork`] and receive a [`MemoryTransport`] plus a channel of inbound streams.
//! Opening a stream hands the remote half to the target peer's inbound channel. Nothing leaves the process, which makes
//! this the transport of choice for tests and for embedding several nodes in one runtime.

use crate::errors::{StreamError, TransportError};
use crate::transport::{FrameStream, Transport};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use libp2p::{PeerId, StreamProtocol};
use log::*;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

pub type InboundStreams = mpsc::UnboundedReceiver<(PeerId, MemoryStream)>;

/// Adapts the inbound channel to a [`futures::Stream`], the shape [`crate::ContentProtocol::serve_incoming`] takes.
pub fn incoming(inbound: InboundStreams) -> BoxStream<'static, (PeerId, MemoryStream)> {
    futures::stream::unfold(inbound, |mut inbound| async move { inbound.recv().await.map(|item| (item, inbound)) })
        .boxed()
}

/// One end of an in-memory frame channel.
pub struct MemoryStream {
    outgoing: Option<mpsc::UnboundedSender<Vec<u8>>>,
    incoming: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl MemoryStream {
    /// Create a connected pair of streams.
    pub fn pair() -> (MemoryStream, MemoryStream) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (MemoryStream { outgoing: Some(a_tx), incoming: b_rx }, MemoryStream { outgoing: Some(b_tx), incoming: a_rx })
    }
}

#[async_trait]
impl FrameStream for MemoryStream {
    async fn read_frame(&mut self, max_len: usize) -> Result<Vec<u8>, StreamError> {
        match self.incoming.recv().await {
            Some(frame) if frame.len() > max_len => Err(StreamError::FrameTooLarge { len: frame.len(), max: max_len }),
            Some(frame) => Ok(frame),
            None => Err(StreamError::Closed),
        }
    }

    async fn write_frame(&mut self, frame: &[u8]) -> Result<(), StreamError> {
        let outgoing = self.outgoing.as_ref().ok_or(StreamError::Reset)?;
        outgoing.send(frame.to_vec()).map_err(|_| StreamError::Closed)
    }

    async fn reset(&mut self) {
        self.outgoing = None;
        self.incoming.close();
    }
}

struct PeerSlot {
    inbound: mpsc::UnboundedSender<(PeerId, MemoryStream)>,
    refusing: bool,
}

/// The shared hub that in-memory peers connect through.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    peers: Arc<RwLock<HashMap<PeerId, PeerSlot>>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a peer to the network. Streams other peers open to it arrive on the returned receiver.
    pub async fn register(&self, peer: PeerId) -> (MemoryTransport, InboundStreams) {
        let (inbound, receiver) = mpsc::unbounded_channel();
        self.peers.write().await.insert(peer, PeerSlot { inbound, refusing: false });
        (MemoryTransport { local: peer, network: self.clone() }, receiver)
    }

    /// Make `peer` refuse (or accept again) every new stream.
    pub async fn set_refusing(&self, peer: &PeerId, refusing: bool) {
        if let Some(slot) = self.peers.write().await.get_mut(peer) {
            slot.refusing = refusing;
        }
    }

    #[cfg(test)]
    async fn unregister(&self, peer: &PeerId) {
        self.peers.write().await.remove(peer);
    }
}

#[derive(Clone)]
pub struct MemoryTransport {
    local: PeerId,
    network: MemoryNetwork,
}

impl MemoryTransport {
    pub fn local_peer_id(&self) -> PeerId {
        self.local
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    type Stream = MemoryStream;

    async fn open_stream(&self, peer: PeerId, protocol: StreamProtocol) -> Result<MemoryStream, TransportError> {
        let peers = self.network.peers.read().await;
        let slot = match peers.get(&peer) {
            Some(slot) if !slot.refusing => slot,
            _ => return Err(TransportError::ConnectionRefused(peer)),
        };
        let (local, remote) = MemoryStream::pair();
        slot.inbound.send((self.local, remote)).map_err(|_| TransportError::ConnectionRefused(peer))?;
        trace!("Opened in-memory {protocol} stream from {} to {peer}", self.local);
        Ok(local)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::message_types::PROTOCOL_ID;

    #[tokio::test]
    async fn streams_reach_the_remote_peer() {
        let network = MemoryNetwork::new();
        let (alice, _) = network.register(PeerId::random()).await;
        let bob_id = PeerId::random();
        let (_bob, mut bob_inbound) = network.register(bob_id).await;

        let mut outbound = alice.open_stream(bob_id, PROTOCOL_ID).await.unwrap();
        let (from, mut inbound) = bob_inbound.recv().await.unwrap();
        assert_eq!(from, alice.local_peer_id());

        outbound.write_frame(b"ping").await.unwrap();
        assert_eq!(inbound.read_frame(16).await.unwrap(), b"ping");
        inbound.write_frame(b"pong").await.unwrap();
        assert_eq!(outbound.read_frame(16).await.unwrap(), b"pong");
    }

    #[tokio::test]
    async fn reset_is_seen_by_both_ends() {
        let (mut a, mut b) = MemoryStream::pair();
        a.reset().await;
        assert!(matches!(b.read_frame(16).await, Err(StreamError::Closed)));
        assert!(matches!(a.write_frame(b"late").await, Err(StreamError::Reset)));
        assert!(matches!(b.write_frame(b"late").await, Err(StreamError::Closed)));
    }

    #[tokio::test]
    async fn refusing_peers_and_unknown_peers_fail_to_open() {
        let network = MemoryNetwork::new();
        let (alice, _) = network.register(PeerId::random()).await;
        let bob_id = PeerId::random();
        let (_bob, _bob_inbound) = network.register(bob_id).await;
        network.set_refusing(&bob_id, true).await;
        assert!(matches!(alice.open_stream(bob_id, PROTOCOL_ID).await, Err(TransportError::ConnectionRefused(_))));
        let stranger = PeerId::random();
        assert!(matches!(alice.open_stream(stranger, PROTOCOL_ID).await, Err(TransportError::ConnectionRefused(_))));

        network.set_refusing(&bob_id, false).await;
        assert!(alice.open_stream(bob_id, PROTOCOL_ID).await.is_ok());
        network.unregister(&bob_id).await;
        assert!(matches!(alice.open_stream(bob_id, PROTOCOL_ID).await, Err(TransportError::ConnectionRefused(_))));
    }
}
