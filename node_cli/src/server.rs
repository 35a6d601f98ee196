use crate::config::NodeConfig;
use crate::error::NodeError;
use crate::ingest::{JsonAdmission, StoreProcessor};
use futures::StreamExt;
use hashnet_p2p::network::{new_network, Libp2pTransport, NetworkClient};
use hashnet_p2p::{ContentProtocol, FileContentStore, IngestionPipeline, NodeIdentity, PeerDirectory, YamlPeerDirectory};
use libp2p::identity::Keypair;
use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId};
use log::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

const LISTEN_POLL_INTERVAL: Duration = Duration::from_millis(20);
const LISTEN_POLL_ATTEMPTS: usize = 100;

pub type NodeProtocol = ContentProtocol<Libp2pTransport, FileContentStore>;

/// A running node: the network event loop, the content protocol answering and pooling streams, and the tasks that
/// connect the two.
pub struct Node {
    client: NetworkClient,
    protocol: NodeProtocol,
    store: Arc<FileContentStore>,
    event_loop: JoinHandle<()>,
    event_handler: JoinHandle<()>,
    inbound: JoinHandle<()>,
}

impl Node {
    /// Build the network and start serving content from `config.content_dir`. Nothing is listened on or dialled yet.
    pub fn start(keypair: Keypair, config: &NodeConfig) -> Result<Self, NodeError> {
        let store = Arc::new(FileContentStore::new(&config.content_dir)?);
        let (client, mut events, event_loop, transport) = new_network(keypair)?;
        let event_loop = tokio::spawn(event_loop.run());

        let protocol = ContentProtocol::new(transport.clone(), Arc::clone(&store), config.protocol_config());
        let incoming = transport.accept(protocol.config().protocol.clone())?;
        let server = protocol.clone();
        let inbound = tokio::spawn(async move { server.serve_incoming(incoming).await });

        // Every new connection gets its stream pool from here.
        let manager = protocol.clone();
        let event_handler = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                trace!("Connection event: {event:?}");
                manager.on_connection_event(event);
            }
            debug!("Connection event stream closed");
        });

        Ok(Self { client, protocol, store, event_loop, event_handler, inbound })
    }

    pub fn client(&self) -> NetworkClient {
        self.client.clone()
    }

    pub fn protocol(&self) -> &NodeProtocol {
        &self.protocol
    }

    pub fn store(&self) -> Arc<FileContentStore> {
        Arc::clone(&self.store)
    }

    /// Start listening on `addr` and wait for the swarm to report the bound addresses.
    pub async fn listen(&mut self, addr: Multiaddr) -> Result<Vec<Multiaddr>, NodeError> {
        self.client.start_listening(addr).await?;
        for _ in 0..LISTEN_POLL_ATTEMPTS {
            let listeners = self.client.listeners().await?;
            if !listeners.is_empty() {
                return Ok(listeners);
            }
            tokio::time::sleep(LISTEN_POLL_INTERVAL).await;
        }
        warn!("No listen address was reported");
        Ok(vec![])
    }

    pub async fn connect(&mut self, addr: Multiaddr) -> Result<PeerId, NodeError> {
        info!("Dialing {addr}");
        Ok(self.client.dial(addr).await?)
    }

    /// Dial every directory peer matching `peer_type`, most recently seen first. Returns how many answered.
    pub async fn connect_known_peers<D: PeerDirectory>(&mut self, directory: &D, peer_type: Option<&str>) -> usize {
        let mut connected = 0;
        for addr in directory.peers(peer_type) {
            match self.client.dial(addr.clone()).await {
                Ok(peer) => {
                    debug!("Connected to {peer} at {addr}");
                    connected += 1;
                }
                Err(err) => warn!("Could not connect to {addr}. {err}"),
            }
        }
        connected
    }

    pub async fn shutdown(self) {
        self.inbound.abort();
        self.event_handler.abort();
        match self.client.shutdown().await {
            Ok(true) => debug!("Network event loop stopped"),
            Ok(false) => warn!("Network event loop did not acknowledge the shutdown"),
            Err(err) => warn!("Could not stop the network event loop. {err}"),
        }
        if let Err(err) = self.event_loop.await {
            error!("Network event loop ended abnormally. {err}");
        }
    }
}

/// Run a node until interrupted: listen, ingest the configured topic into the content store, and connect to the
/// peers in the directory.
pub async fn run_server(identity: NodeIdentity, config: NodeConfig) -> Result<(), NodeError> {
    info!("Starting node {identity}");
    let peer_id = identity.peer_id();
    let mut node = Node::start(identity.take_keypair(), &config)?;
    for addr in node.listen(config.listen_address.clone()).await? {
        println!("Listening on {}", addr.with(Protocol::P2p(peer_id)));
    }

    let pipeline =
        IngestionPipeline::new(node.client(), JsonAdmission, StoreProcessor::new(node.store()), config.ingestion_config());
    let topic = config.topic.clone();
    let ingestion = tokio::spawn(async move { pipeline.run(&topic).await });

    let directory = YamlPeerDirectory::load(&config.peers_path)?;
    if directory.is_empty() {
        info!("The peer directory at {} is empty. Waiting for peers to connect.", config.peers_path.display());
    } else {
        let connected = node.connect_known_peers(&directory, config.peer_type.as_deref()).await;
        info!("Connected to {connected} known peer(s)");
    }

    tokio::signal::ctrl_c().await?;
    info!("Interrupted. Shutting down.");
    ingestion.abort();
    node.shutdown().await;
    info!("Node has shut down.");
    Ok(())
}
