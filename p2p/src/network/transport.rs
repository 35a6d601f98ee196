use crate::errors::{PeerConnectionError, TransportError};
use crate::framing::FramedStream;
use crate::transport::Transport;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use libp2p::{PeerId, StreamProtocol};
use libp2p_stream::{Control, OpenStreamError};

pub type Libp2pStream = FramedStream<libp2p::Stream>;

/// Opens and accepts protocol streams on connections the swarm already holds.
#[derive(Clone)]
pub struct Libp2pTransport {
    control: Control,
}

impl Libp2pTransport {
    pub fn new(control: Control) -> Self {
        Self { control }
    }

    /// Streams remote peers open to us on `protocol`. Each protocol can only be accepted once.
    pub fn accept(
        &self,
        protocol: StreamProtocol,
    ) -> Result<BoxStream<'static, (PeerId, Libp2pStream)>, PeerConnectionError> {
        let incoming = self.control.clone().accept(protocol).map_err(|_| PeerConnectionError::AlreadyRegistered)?;
        Ok(incoming.map(|(peer, stream)| (peer, FramedStream::new(stream))).boxed())
    }
}

#[async_trait]
impl Transport for Libp2pTransport {
    type Stream = Libp2pStream;

    async fn open_stream(&self, peer: PeerId, protocol: StreamProtocol) -> Result<Libp2pStream, TransportError> {
        let mut control = self.control.clone();
        match control.open_stream(peer, protocol).await {
            Ok(stream) => Ok(FramedStream::new(stream)),
            Err(OpenStreamError::UnsupportedProtocol(_)) => Err(TransportError::UnsupportedProtocol(peer)),
            Err(err) => Err(TransportError::Other(err.to_string())),
        }
    }
}
