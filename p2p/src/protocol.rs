use crate::connection_manager::ConnectionManager;
use crate::content::ContentStore;
use crate::dispatcher::Dispatcher;
use crate::inbound::InboundHandler;
use crate::message_types::{Request, Response, DEFAULT_STREAMS_PER_PEER, MAX_READ_LEN, PROTOCOL_ID};
use crate::stream_pool::StreamPool;
use crate::transport::{ConnectionEvent, FrameStream, Transport};
use futures::{Stream, StreamExt};
use libp2p::{PeerId, StreamProtocol};
use log::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

const POOL_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct ProtocolConfig {
    pub protocol: StreamProtocol,
    pub streams_per_peer: usize,
    pub max_frame_len: usize,
    pub lookup_timeout: Duration,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            protocol: PROTOCOL_ID,
            streams_per_peer: DEFAULT_STREAMS_PER_PEER,
            max_frame_len: MAX_READ_LEN,
            lookup_timeout: Duration::from_millis(200),
        }
    }
}

impl ProtocolConfig {
    pub fn with_protocol(mut self, protocol: StreamProtocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_streams_per_peer(mut self, streams: usize) -> Self {
        self.streams_per_peer = streams;
        self
    }

    pub fn with_max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }

    pub fn with_lookup_timeout(mut self, timeout: Duration) -> Self {
        self.lookup_timeout = timeout;
        self
    }
}

/// The content protocol for one node.
///
/// Owns the node's stream pool and wires the connection manager, dispatcher and inbound handler to it. Construct one
/// per node and hand clones to whoever needs to fetch content or react to connection events; clones share the pool.
pub struct ContentProtocol<T: Transport, C> {
    config: ProtocolConfig,
    pool: Arc<StreamPool<T::Stream>>,
    manager: ConnectionManager<T>,
    dispatcher: Dispatcher<T::Stream>,
    inbound: InboundHandler<C>,
}

impl<T: Transport, C> Clone for ContentProtocol<T, C> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            pool: Arc::clone(&self.pool),
            manager: self.manager.clone(),
            dispatcher: self.dispatcher.clone(),
            inbound: self.inbound.clone(),
        }
    }
}

impl<T: Transport, C: ContentStore> ContentProtocol<T, C> {
    pub fn new(transport: T, store: Arc<C>, config: ProtocolConfig) -> Self {
        let pool = Arc::new(StreamPool::new(config.streams_per_peer));
        let manager =
            ConnectionManager::new(transport, Arc::clone(&pool), config.protocol.clone(), config.max_frame_len);
        let dispatcher = Dispatcher::new(Arc::clone(&pool), config.max_frame_len);
        let inbound = InboundHandler::new(store, config.lookup_timeout, config.max_frame_len);
        Self { config, pool, manager, dispatcher, inbound }
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<StreamPool<T::Stream>> {
        &self.pool
    }

    /// Feed a transport lifecycle notification to the connection manager. Returns immediately.
    pub fn on_connection_event(&self, event: ConnectionEvent) {
        self.manager.on_connection_event(event);
    }

    pub async fn ensure_pool(&self, peer: PeerId) -> usize {
        self.manager.ensure_pool(peer).await
    }

    pub async fn has_active_streams(&self, peer: &PeerId) -> bool {
        self.pool.has_active_streams(peer).await
    }

    /// Wait until `peer` has at least one pooled stream. Returns false if that did not happen within `timeout`.
    pub async fn wait_for_streams(&self, peer: &PeerId, timeout: Duration) -> bool {
        let wait = async {
            while !self.pool.has_active_streams(peer).await {
                tokio::time::sleep(POOL_POLL_INTERVAL).await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }

    pub async fn dispatch(&self, request: &Request) -> Option<Response> {
        self.dispatcher.dispatch(request).await
    }

    pub async fn fetch_by_hash(&self, hash: &str) -> Option<Vec<u8>> {
        self.dispatcher.fetch_by_hash(hash).await
    }

    /// Start answering requests on a stream a peer opened to us.
    pub fn handle_inbound<S: FrameStream>(&self, peer: PeerId, stream: S) -> JoinHandle<()> {
        let handler = self.inbound.clone();
        tokio::spawn(async move {
            trace!("Serving inbound stream from {peer}");
            handler.serve(peer, stream).await;
        })
    }

    /// Hand every stream from `incoming` to its own inbound handler. Returns when `incoming` ends.
    pub async fn serve_incoming<S, I>(&self, incoming: I)
    where
        S: FrameStream,
        I: Stream<Item = (PeerId, S)> + Unpin,
    {
        let mut incoming = incoming;
        while let Some((peer, stream)) = incoming.next().await {
            let _ = self.handle_inbound(peer, stream);
        }
        debug!("Inbound stream source for {} closed", self.config.protocol);
    }
}
