use super::behaviour::{NodeBehaviour, NodeBehaviourEvent};
use crate::errors::PeerConnectionError;
use crate::ingestion::RawMessage;
use crate::transport::ConnectionEvent;
use futures::channel::{mpsc, oneshot};
use futures::StreamExt;
use libp2p::gossipsub::{self, IdentTopic, TopicHash};
use libp2p::swarm::SwarmEvent;
use libp2p::{identify, Multiaddr, PeerId, Swarm};
use log::*;
use std::collections::HashMap;

/// Messages buffered per subscriber before new ones are dropped.
pub const SUBSCRIPTION_BUFFER: usize = 256;

pub type Reply<T> = oneshot::Sender<Result<T, PeerConnectionError>>;

/// Requests a [`super::NetworkClient`] sends to the [`EventLoop`].
pub enum ClientCommand {
    StartListening { addr: Multiaddr, sender: Reply<()> },
    Dial { peer_id: PeerId, peer_addr: Multiaddr, sender: Reply<()> },
    ConnectedPeers { sender: oneshot::Sender<Vec<PeerId>> },
    Listeners { sender: oneshot::Sender<Vec<Multiaddr>> },
    Subscribe { topic: String, sender: Reply<mpsc::Receiver<RawMessage>> },
    Publish { topic: String, data: Vec<u8>, sender: Reply<()> },
    Shutdown(oneshot::Sender<bool>),
}

struct Subscription {
    topic: String,
    subscribers: Vec<mpsc::Sender<RawMessage>>,
}

/// Owns the swarm. Drives it, executes client commands and reports connection lifecycle events.
pub struct EventLoop {
    swarm: Swarm<NodeBehaviour>,
    command_receiver: mpsc::Receiver<ClientCommand>,
    event_sender: mpsc::UnboundedSender<ConnectionEvent>,
    pending_dials: HashMap<PeerId, Vec<Reply<()>>>,
    subscriptions: HashMap<TopicHash, Subscription>,
}

impl EventLoop {
    pub fn new(
        swarm: Swarm<NodeBehaviour>,
        command_receiver: mpsc::Receiver<ClientCommand>,
        event_sender: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Self {
        Self { swarm, command_receiver, event_sender, pending_dials: HashMap::new(), subscriptions: HashMap::new() }
    }

    pub async fn run(mut self) {
        loop {
            tokio::select! {
                event = self.swarm.select_next_some() => self.handle_event(event),
                command = self.command_receiver.next() => match command {
                    Some(ClientCommand::Shutdown(sender)) => {
                        info!("Shutting down the network event loop");
                        let _ = sender.send(true);
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        debug!("All network clients dropped. Stopping the event loop.");
                        break;
                    }
                },
            }
        }
    }

    fn emit(&self, event: ConnectionEvent) {
        if self.event_sender.unbounded_send(event).is_err() {
            trace!("Nobody is listening for connection events");
        }
    }

    fn handle_event(&mut self, event: SwarmEvent<NodeBehaviourEvent>) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                info!("Listening on {address}");
                self.emit(ConnectionEvent::Listen(address));
            }
            SwarmEvent::ExpiredListenAddr { address, .. } => {
                debug!("No longer listening on {address}");
                self.emit(ConnectionEvent::ListenClosed(address));
            }
            SwarmEvent::ConnectionEstablished { peer_id, endpoint, .. } => {
                debug!("Connection established with {peer_id} at {}", endpoint.get_remote_address());
                for sender in self.pending_dials.remove(&peer_id).unwrap_or_default() {
                    let _ = sender.send(Ok(()));
                }
                self.emit(ConnectionEvent::Connected(peer_id));
            }
            SwarmEvent::ConnectionClosed { peer_id, num_established, cause, .. } => {
                debug!("Connection to {peer_id} closed. Remaining: {num_established}. Cause: {cause:?}");
                if num_established == 0 {
                    self.emit(ConnectionEvent::Disconnected(peer_id));
                }
            }
            SwarmEvent::OutgoingConnectionError { peer_id: Some(peer_id), error, .. } => {
                warn!("Could not connect to {peer_id}. {error}");
                for sender in self.pending_dials.remove(&peer_id).unwrap_or_default() {
                    let _ = sender.send(Err(PeerConnectionError::Dial(error.to_string())));
                }
            }
            SwarmEvent::Behaviour(NodeBehaviourEvent::Gossipsub(gossipsub::Event::Message { message, .. })) => {
                self.forward_message(message);
            }
            SwarmEvent::Behaviour(NodeBehaviourEvent::Identify(identify::Event::Received { peer_id, info, .. })) => {
                trace!("Identified {peer_id} running {}", info.agent_version);
            }
            other => trace!("Unhandled swarm event: {other:?}"),
        }
    }

    fn forward_message(&mut self, message: gossipsub::Message) {
        let Some(subscription) = self.subscriptions.get_mut(&message.topic) else {
            trace!("Message on a topic nobody subscribed to: {}", message.topic);
            return;
        };
        let raw = RawMessage { topic: subscription.topic.clone(), data: message.data, source: message.source };
        subscription.subscribers.retain_mut(|subscriber| match subscriber.try_send(raw.clone()) {
            Ok(()) => true,
            Err(err) if err.is_full() => {
                warn!("Subscriber to {} is falling behind. Message dropped.", raw.topic);
                true
            }
            Err(_) => false,
        });
    }

    fn handle_command(&mut self, command: ClientCommand) {
        match command {
            ClientCommand::StartListening { addr, sender } => {
                let result = self.swarm.listen_on(addr).map_err(|e| PeerConnectionError::Listen(e.to_string()));
                let _ = sender.send(result.map(|_| ()));
            }
            ClientCommand::Dial { peer_id, peer_addr, sender } => {
                if self.swarm.is_connected(&peer_id) {
                    trace!("Already connected to {peer_id}");
                    let _ = sender.send(Ok(()));
                    return;
                }
                if let Some(waiting) = self.pending_dials.get_mut(&peer_id) {
                    waiting.push(sender);
                    return;
                }
                match self.swarm.dial(peer_addr) {
                    Ok(()) => {
                        self.pending_dials.insert(peer_id, vec![sender]);
                    }
                    Err(err) => {
                        let _ = sender.send(Err(PeerConnectionError::Dial(err.to_string())));
                    }
                }
            }
            ClientCommand::ConnectedPeers { sender } => {
                let peers = self.swarm.connected_peers().cloned().collect();
                let _ = sender.send(peers);
            }
            ClientCommand::Listeners { sender } => {
                let _ = sender.send(self.swarm.listeners().cloned().collect());
            }
            ClientCommand::Subscribe { topic, sender } => {
                let _ = sender.send(self.subscribe(topic));
            }
            ClientCommand::Publish { topic, data, sender } => {
                let result = self
                    .swarm
                    .behaviour_mut()
                    .gossipsub
                    .publish(IdentTopic::new(topic), data)
                    .map(|_| ())
                    .map_err(|e| PeerConnectionError::Publish(e.to_string()));
                let _ = sender.send(result);
            }
            ClientCommand::Shutdown(sender) => {
                // Handled by the run loop.
                let _ = sender.send(false);
            }
        }
    }

    fn subscribe(&mut self, topic: String) -> Result<mpsc::Receiver<RawMessage>, PeerConnectionError> {
        let ident = IdentTopic::new(topic.clone());
        self.swarm
            .behaviour_mut()
            .gossipsub
            .subscribe(&ident)
            .map_err(|e| PeerConnectionError::Subscription(e.to_string()))?;
        let (subscriber, receiver) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let entry =
            self.subscriptions.entry(ident.hash()).or_insert_with(|| Subscription { topic, subscribers: vec![] });
        entry.subscribers.push(subscriber);
        debug!("{} subscriber(s) on {}", entry.subscribers.len(), entry.topic);
        Ok(receiver)
    }
}
