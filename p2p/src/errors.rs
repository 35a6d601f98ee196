use futures::channel::{mpsc, oneshot};
use libp2p::PeerId;
use thiserror::Error;

/// A failure on an established stream. Any of these takes the stream out of service.
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("The stream was closed by the remote peer.")]
    Closed,
    #[error("The stream was reset.")]
    Reset,
    #[error("Frame of {len} bytes exceeds the read cap of {max} bytes.")]
    FrameTooLarge { len: usize, max: usize },
    #[error("Stream I/O error. {0}")]
    Io(#[from] std::io::Error),
}

impl StreamError {
    /// Maps an I/O error from the underlying byte stream onto the stream failure kinds.
    pub fn from_io(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof => StreamError::Closed,
            std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::BrokenPipe => StreamError::Reset,
            _ => StreamError::Io(err),
        }
    }
}

/// The transport could not give us a new stream to a peer.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Peer {0} refused the stream.")]
    ConnectionRefused(PeerId),
    #[error("Peer {0} does not support the protocol.")]
    UnsupportedProtocol(PeerId),
    #[error("Could not open a stream. {0}")]
    Other(String),
}

/// Setting up a new pooled stream failed. The peer stays reachable on the next connection event.
#[derive(Error, Debug)]
pub enum HandshakeError {
    #[error("Could not open a stream for the handshake. {0}")]
    Transport(#[from] TransportError),
    #[error("The handshake exchange failed. {0}")]
    Stream(#[from] StreamError),
    #[error("Could not encode the handshake frame. {0}")]
    Encoding(#[from] serde_json::Error),
}

/// A request frame we could not act on. These become `{status: "error"}` responses, never stream failures.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Frame is not valid UTF-8. {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),
    #[error("Frame is not a valid request. {0}")]
    MalformedFrame(#[from] serde_json::Error),
    #[error("Missing field '{0}'")]
    MissingField(&'static str),
    #[error("unknown command")]
    UnknownCommand(String),
    #[error("Content lookup failed. {0}")]
    Content(#[from] ContentError),
}

impl ProtocolError {
    /// The reason string sent back to the peer.
    pub fn reason(&self) -> String {
        self.to_string()
    }
}

#[derive(Error, Debug)]
pub enum ContentError {
    #[error("Content I/O error. {0}")]
    Io(#[from] std::io::Error),
    #[error("'{0}' is not a valid content hash.")]
    InvalidHash(String),
}

/// Subscription-level failures. The ingestion loop reconnects on any of these.
#[derive(Error, Debug)]
pub enum FeedError {
    #[error("Could not subscribe to topic {topic}. {reason}")]
    Subscribe { topic: String, reason: String },
    #[error("The subscription to {0} was dropped.")]
    Dropped(String),
    #[error("Feed error. {0}")]
    Other(String),
}

#[derive(Error, Debug)]
pub enum AdmissionError {
    #[error("Message is not valid JSON. {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("Message rejected. {0}")]
    Invalid(String),
}

#[derive(Error, Debug)]
pub enum ProcessingError {
    #[error("Could not store message. {0}")]
    Storage(#[from] ContentError),
    #[error("Could not process message. {0}")]
    Other(String),
}

#[derive(Error, Debug)]
pub enum PeerDirectoryError {
    #[error("Error reading/writing the peer directory: {0}")]
    Io(#[from] std::io::Error),
    #[error("Error de/encoding the peer directory: {0}")]
    Serde(#[from] serde_yml::Error),
}

/// Errors raised by the libp2p network adapter and its event loop.
#[derive(Error, Debug)]
pub enum PeerConnectionError {
    #[error("Could not build the network. {0}")]
    Setup(String),
    #[error("Could not listen on the given address. {0}")]
    Listen(String),
    #[error("Could not dial peer. {0}")]
    Dial(String),
    #[error("The peer address does not contain a peer id.")]
    MissingPeerId,
    #[error("Could not subscribe to topic. {0}")]
    Subscription(String),
    #[error("Could not publish message. {0}")]
    Publish(String),
    #[error("The protocol handler was already registered.")]
    AlreadyRegistered,
    #[error("The network event loop has stopped.")]
    EventLoopStopped(#[from] mpsc::SendError),
    #[error("The network event loop dropped the request.")]
    Cancelled(#[from] oneshot::Canceled),
}
