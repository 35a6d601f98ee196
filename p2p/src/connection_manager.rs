use crate::errors::{HandshakeError, StreamError};
use crate::message_types::Request;
use crate::stream_pool::StreamPool;
use crate::transport::{ConnectionEvent, FrameStream, Transport};
use libp2p::{PeerId, StreamProtocol};
use log::*;
use std::sync::Arc;

/// Keeps every connected peer's stream pool topped up.
///
/// The manager is the only component that grows a peer's pool. Growth for a given peer is serialised through the
/// pool's population lock, so two connection notifications for the same peer never race each other.
pub struct ConnectionManager<T: Transport> {
    transport: T,
    pool: Arc<StreamPool<T::Stream>>,
    protocol: StreamProtocol,
    max_frame_len: usize,
}

impl<T: Transport> Clone for ConnectionManager<T> {
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
            pool: Arc::clone(&self.pool),
            protocol: self.protocol.clone(),
            max_frame_len: self.max_frame_len,
        }
    }
}

impl<T: Transport> ConnectionManager<T> {
    pub fn new(transport: T, pool: Arc<StreamPool<T::Stream>>, protocol: StreamProtocol, max_frame_len: usize) -> Self {
        Self { transport, pool, protocol, max_frame_len }
    }

    /// React to a transport lifecycle notification. Never blocks: pool population runs on its own task.
    pub fn on_connection_event(&self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Connected(peer) => {
                let manager = self.clone();
                tokio::spawn(async move {
                    let size = manager.ensure_pool(peer).await;
                    debug!("Added new peer {peer} with {size} pooled streams");
                });
            }
            other => trace!("Ignoring connection event {other:?}"),
        }
    }

    /// Fill `peer`'s pool up to capacity. The first failure ends this attempt; it is logged, not returned.
    ///
    /// Returns the pool size for `peer` once the attempt is over.
    pub async fn ensure_pool(&self, peer: PeerId) -> usize {
        let population = self.pool.population_lock(peer).await;
        let pruned = self.pool.prune(&peer).await;
        if pruned > 0 {
            debug!("Dropped {pruned} retired streams of peer {peer}");
        }
        let current = self.pool.len(&peer).await;
        for _ in current..self.pool.capacity() {
            let stream = match self.open_pooled_stream(peer).await {
                Ok(stream) => stream,
                Err(err) => {
                    warn!("Failed to add stream to peer {peer}. {err}");
                    break;
                }
            };
            if let Err(mut surplus) = self.pool.try_insert(peer, stream).await {
                surplus.reset().await;
                break;
            }
        }
        drop(population);
        self.pool.release(&peer).await;
        self.pool.len(&peer).await
    }

    /// Open a new protocol stream and confirm the peer speaks our protocol with a `hello` exchange.
    async fn open_pooled_stream(&self, peer: PeerId) -> Result<T::Stream, HandshakeError> {
        let hello = Request::hello().to_frame()?;
        let mut stream = self.transport.open_stream(peer, self.protocol.clone()).await?;
        if let Err(err) = self.handshake(&mut stream, &hello).await {
            stream.reset().await;
            return Err(err.into());
        }
        Ok(stream)
    }

    async fn handshake(&self, stream: &mut T::Stream, hello: &[u8]) -> Result<(), StreamError> {
        stream.write_frame(hello).await?;
        let reply = stream.read_frame(self.max_frame_len).await?;
        trace!("Handshake reply ({} bytes) discarded", reply.len());
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::errors::TransportError;
    use crate::memory::{InboundStreams, MemoryNetwork, MemoryStream};
    use crate::message_types::{PROTOCOL_ID, MAX_READ_LEN};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Answers every frame on every inbound stream with an empty object.
    fn echo_peer(mut inbound: InboundStreams) {
        tokio::spawn(async move {
            while let Some((_, mut stream)) = inbound.recv().await {
                tokio::spawn(async move {
                    while stream.read_frame(MAX_READ_LEN).await.is_ok() {
                        if stream.write_frame(b"{}").await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
    }

    async fn manager_with_peer(capacity: usize) -> (ConnectionManager<crate::memory::MemoryTransport>, PeerId) {
        let network = MemoryNetwork::new();
        let (local, _) = network.register(PeerId::random()).await;
        let remote = PeerId::random();
        let (_, inbound) = network.register(remote).await;
        echo_peer(inbound);
        let pool = Arc::new(StreamPool::new(capacity));
        (ConnectionManager::new(local, pool, PROTOCOL_ID, MAX_READ_LEN), remote)
    }

    #[tokio::test]
    async fn fills_pool_to_capacity_and_no_further() {
        env_logger::try_init().ok();
        let (manager, remote) = manager_with_peer(5).await;
        assert_eq!(manager.ensure_pool(remote).await, 5);
        assert_eq!(manager.ensure_pool(remote).await, 5);
        assert_eq!(manager.pool.len(&remote).await, 5);
    }

    #[tokio::test]
    async fn concurrent_population_never_overfills() {
        let (manager, remote) = manager_with_peer(4).await;
        let attempts: Vec<_> = (0..8)
            .map(|_| {
                let manager = manager.clone();
                tokio::spawn(async move { manager.ensure_pool(remote).await })
            })
            .collect();
        for attempt in attempts {
            assert!(attempt.await.unwrap() <= 4);
        }
        assert_eq!(manager.pool.len(&remote).await, 4);
    }

    #[tokio::test]
    async fn refused_stream_aborts_population_quietly() {
        let network = MemoryNetwork::new();
        let (local, _) = network.register(PeerId::random()).await;
        let remote = PeerId::random();
        let (_, inbound) = network.register(remote).await;
        echo_peer(inbound);
        network.set_refusing(&remote, true).await;
        let manager = ConnectionManager::new(local, Arc::new(StreamPool::new(5)), PROTOCOL_ID, MAX_READ_LEN);
        assert_eq!(manager.ensure_pool(remote).await, 0);
        assert!(!manager.pool.has_active_streams(&remote).await);

        // The peer is still reachable on the next notification.
        network.set_refusing(&remote, false).await;
        assert_eq!(manager.ensure_pool(remote).await, 5);
    }

    /// Hands out streams whose remote end answers the handshake for the first `good` streams only.
    #[derive(Clone)]
    struct FlakyTransport {
        opened: Arc<AtomicUsize>,
        good: usize,
    }

    #[async_trait]
    impl Transport for FlakyTransport {
        type Stream = MemoryStream;

        async fn open_stream(&self, _peer: PeerId, _protocol: StreamProtocol) -> Result<MemoryStream, TransportError> {
            let n = self.opened.fetch_add(1, Ordering::SeqCst);
            let (local, mut remote) = MemoryStream::pair();
            if n < self.good {
                tokio::spawn(async move {
                    while remote.read_frame(MAX_READ_LEN).await.is_ok() {
                        let _ = remote.write_frame(b"{}").await;
                    }
                });
            } else {
                remote.reset().await;
            }
            Ok(local)
        }
    }

    #[tokio::test]
    async fn handshake_failure_stops_after_the_first_bad_stream() {
        let opened = Arc::new(AtomicUsize::new(0));
        let transport = FlakyTransport { opened: Arc::clone(&opened), good: 2 };
        let manager = ConnectionManager::new(transport, Arc::new(StreamPool::new(5)), PROTOCOL_ID, MAX_READ_LEN);
        let peer = PeerId::random();
        assert_eq!(manager.ensure_pool(peer).await, 2);
        // Two good streams, then one failed handshake, then nothing more.
        assert_eq!(opened.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn connected_event_populates_in_the_background() {
        let (manager, remote) = manager_with_peer(3).await;
        manager.on_connection_event(ConnectionEvent::Connected(remote));
        manager.on_connection_event(ConnectionEvent::Disconnected(remote));
        let mut waited = Duration::ZERO;
        while manager.pool.len(&remote).await < 3 && waited < Duration::from_secs(5) {
            tokio::time::sleep(Duration::from_millis(10)).await;
            waited += Duration::from_millis(10);
        }
        assert_eq!(manager.pool.len(&remote).await, 3);
    }
}
