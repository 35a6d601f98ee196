//! The libp2p side of a node: a swarm running identify, gossipsub and raw protocol streams over TCP/noise/yamux.

mod behaviour;
mod client;
mod event_loop;
mod transport;

pub use behaviour::NodeBehaviour;
pub use client::{new_network, peer_id_of, NetworkClient};
pub use event_loop::{ClientCommand, EventLoop};
pub use transport::{Libp2pStream, Libp2pTransport};
