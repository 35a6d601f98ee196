//! The seam between the protocol core and whatever moves bytes between peers.
//!
//! The core only needs two things from a transport: a way to open a new stream to a peer for a given protocol tag, and
//! frame-oriented I/O on that stream. Connection establishment, encryption and multiplexing all live behind these
//! traits. [`crate::network`] implements them over libp2p; [`crate::memory`] implements them in-process.

use crate::errors::{StreamError, TransportError};
use async_trait::async_trait;
use libp2p::{Multiaddr, PeerId, StreamProtocol};

/// An ordered, reliable, bidirectional frame channel to a single peer.
#[async_trait]
pub trait FrameStream: Send + 'static {
    /// Read the next frame. Frames longer than `max_len` are rejected. A closed stream yields [`StreamError::Closed`].
    async fn read_frame(&mut self, max_len: usize) -> Result<Vec<u8>, StreamError>;

    /// Write one complete frame.
    async fn write_frame(&mut self, frame: &[u8]) -> Result<(), StreamError>;

    /// Abnormally close the stream. Errors are swallowed; the stream is unusable afterwards either way.
    async fn reset(&mut self);
}

/// Opens application-protocol streams to connected peers.
#[async_trait]
pub trait Transport: Clone + Send + Sync + 'static {
    type Stream: FrameStream;

    async fn open_stream(&self, peer: PeerId, protocol: StreamProtocol) -> Result<Self::Stream, TransportError>;
}

/// Lifecycle notifications delivered by the transport.
///
/// Only [`ConnectionEvent::Connected`] drives any behaviour. The physical connection, not the individual stream, is the
/// unit of lifecycle for this protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected(PeerId),
    Disconnected(PeerId),
    StreamOpened(PeerId),
    StreamClosed(PeerId),
    Listen(Multiaddr),
    ListenClosed(Multiaddr),
}
