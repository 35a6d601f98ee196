use super::behaviour::NodeBehaviour;
use super::event_loop::{ClientCommand, EventLoop};
use super::transport::Libp2pTransport;
use crate::errors::{FeedError, PeerConnectionError};
use crate::ingestion::{MessageFeed, MessageStream, RawMessage};
use crate::transport::ConnectionEvent;
use async_trait::async_trait;
use futures::channel::{mpsc, oneshot};
use futures::{SinkExt, StreamExt};
use libp2p::identity::Keypair;
use libp2p::multiaddr::Protocol;
use libp2p::{gossipsub, identify, noise, tcp, yamux, Multiaddr, PeerId};
use log::*;
use std::time::Duration;

const IDENTIFY_PROTOCOL: &str = "/hashnet/id/0.1.0";

/// Creates the network components, namely:
///
/// - The [`NetworkClient`] to interact with the event loop from anywhere within your application.
/// - The stream of connection lifecycle events, to be fed to [`crate::ContentProtocol::on_connection_event`].
/// - The [`EventLoop`] driving the network itself. Spawn [`EventLoop::run`] on the runtime.
/// - The [`Libp2pTransport`] used by the content protocol to open and accept streams.
pub fn new_network(
    keypair: Keypair,
) -> Result<(NetworkClient, mpsc::UnboundedReceiver<ConnectionEvent>, EventLoop, Libp2pTransport), PeerConnectionError>
{
    let swarm = libp2p::SwarmBuilder::with_existing_identity(keypair)
        .with_tokio()
        .with_tcp(tcp::Config::default(), noise::Config::new, yamux::Config::default)
        .map_err(|e| PeerConnectionError::Setup(e.to_string()))?
        .with_behaviour(|key| -> Result<NodeBehaviour, Box<dyn std::error::Error + Send + Sync>> {
            let config = identify::Config::new(IDENTIFY_PROTOCOL.to_string(), key.public())
                .with_interval(Duration::from_secs(5 * 60));
            let identify = identify::Behaviour::new(config);
            let config = gossipsub::ConfigBuilder::default().heartbeat_interval(Duration::from_secs(1)).build()?;
            let gossipsub = gossipsub::Behaviour::new(gossipsub::MessageAuthenticity::Signed(key.clone()), config)?;
            let stream = libp2p_stream::Behaviour::new();
            Ok(NodeBehaviour { identify, gossipsub, stream })
        })
        .map_err(|e| PeerConnectionError::Setup(e.to_string()))?
        .with_swarm_config(|c| c.with_idle_connection_timeout(Duration::from_secs(60)))
        .build();

    let transport = Libp2pTransport::new(swarm.behaviour().stream.new_control());
    let (command_sender, command_receiver) = mpsc::channel(0);
    let (event_sender, event_receiver) = mpsc::unbounded();

    Ok((
        NetworkClient { sender: command_sender },
        event_receiver,
        EventLoop::new(swarm, command_receiver, event_sender),
        transport,
    ))
}

/// A sender interface to the network event loop. It can be cheaply cloned and shared among tasks.
///
/// Every method sends a [`ClientCommand`] carrying a one-shot sender to the [`EventLoop`] and waits for the answer. The
/// client itself does no work.
#[derive(Clone)]
pub struct NetworkClient {
    sender: mpsc::Sender<ClientCommand>,
}

impl NetworkClient {
    /// Listen for incoming connections on the given address.
    pub async fn start_listening(&mut self, addr: Multiaddr) -> Result<(), PeerConnectionError> {
        let (sender, receiver) = oneshot::channel();
        self.sender.send(ClientCommand::StartListening { addr, sender }).await?;
        receiver.await?
    }

    /// Dial the given peer at the given address. The address must end in the peer id, e.g.
    /// `/ip4/192.168.1.100/tcp/7740/p2p/12D3KooW...`.
    ///
    /// Returns once the connection is established.
    pub async fn dial(&mut self, peer_addr: Multiaddr) -> Result<PeerId, PeerConnectionError> {
        let peer_id = peer_id_of(&peer_addr).ok_or(PeerConnectionError::MissingPeerId)?;
        let (sender, receiver) = oneshot::channel();
        self.sender.send(ClientCommand::Dial { peer_id, peer_addr, sender }).await?;
        receiver.await??;
        Ok(peer_id)
    }

    pub async fn connected_peers(&mut self) -> Result<Vec<PeerId>, PeerConnectionError> {
        let (sender, receiver) = oneshot::channel();
        self.sender.send(ClientCommand::ConnectedPeers { sender }).await?;
        Ok(receiver.await?)
    }

    /// The addresses the swarm is currently listening on. Empty until the first listener is up.
    pub async fn listeners(&mut self) -> Result<Vec<Multiaddr>, PeerConnectionError> {
        let (sender, receiver) = oneshot::channel();
        self.sender.send(ClientCommand::Listeners { sender }).await?;
        Ok(receiver.await?)
    }

    /// Subscribe to a gossipsub topic. Messages arrive on the returned receiver until it is dropped.
    pub async fn subscribe_topic(&mut self, topic: &str) -> Result<mpsc::Receiver<RawMessage>, PeerConnectionError> {
        let (sender, receiver) = oneshot::channel();
        self.sender.send(ClientCommand::Subscribe { topic: topic.to_string(), sender }).await?;
        receiver.await?
    }

    pub async fn publish(&mut self, topic: &str, data: Vec<u8>) -> Result<(), PeerConnectionError> {
        let (sender, receiver) = oneshot::channel();
        self.sender.send(ClientCommand::Publish { topic: topic.to_string(), data, sender }).await?;
        receiver.await?
    }

    pub async fn shutdown(mut self) -> Result<bool, PeerConnectionError> {
        let (sender, receiver) = oneshot::channel();
        self.sender.send(ClientCommand::Shutdown(sender)).await?;
        Ok(receiver.await?)
    }
}

#[async_trait]
impl MessageFeed for NetworkClient {
    async fn subscribe(&self, topic: &str) -> Result<MessageStream, FeedError> {
        let mut client = self.clone();
        let receiver = client
            .subscribe_topic(topic)
            .await
            .map_err(|e| FeedError::Subscribe { topic: topic.to_string(), reason: e.to_string() })?;
        trace!("Gossipsub feed for {topic} opened");
        Ok(receiver.map(Ok).boxed())
    }
}

/// The peer id at the end of a dialable address, if there is one.
pub fn peer_id_of(addr: &Multiaddr) -> Option<PeerId> {
    match addr.iter().last() {
        Some(Protocol::P2p(peer_id)) => Some(peer_id),
        _ => None,
    }
}
