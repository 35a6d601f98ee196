use libp2p::swarm::NetworkBehaviour;
use libp2p::{gossipsub, identify};

#[derive(NetworkBehaviour)]
pub struct NodeBehaviour {
    pub(crate) identify: identify::Behaviour,
    pub(crate) gossipsub: gossipsub::Behaviour,
    pub(crate) stream: libp2p_stream::Behaviour,
}
