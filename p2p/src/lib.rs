//! Peer-to-peer content protocol for a content-addressed network.
//!
//! Every node keeps a small pool of persistent streams to each peer it is connected to, sends requests over whichever
//! pooled stream is free, answers `hash_content` requests from its local store, and drains a pub/sub feed into local
//! processing. [`ContentProtocol`] ties the pieces together for one node.

pub mod connection_manager;
pub mod content;
pub mod dispatcher;
pub mod errors;
pub mod framing;
mod identity;
pub mod inbound;
pub mod ingestion;
pub mod memory;
pub mod message_types;
pub mod network;
pub mod peer_directory;
mod protocol;
pub mod stream_pool;
pub mod task_group;
pub mod transport;

pub use content::{ContentStore, FileContentStore, MemoryContentStore};
pub use identity::{IdentityError, NodeIdentity};
pub use ingestion::{IngestionConfig, IngestionPipeline, MessageAdmission, MessageFeed, MessageProcessor, RawMessage};
pub use message_types::{Request, Response, Status, PROTOCOL_ID};
pub use peer_directory::{PeerDirectory, PeerRecord, YamlPeerDirectory};
pub use protocol::{ContentProtocol, ProtocolConfig};
pub use transport::{ConnectionEvent, FrameStream, Transport};
