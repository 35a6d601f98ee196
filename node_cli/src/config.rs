use crate::error::NodeError;
use clap::{Args, Parser, Subcommand};
use hashnet_p2p::message_types::DEFAULT_STREAMS_PER_PEER;
use hashnet_p2p::{IngestionConfig, ProtocolConfig};
use libp2p::multiaddr::Protocol;
use libp2p::Multiaddr;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_LISTEN_ADDRESS: &str = "/ip4/127.0.0.1/tcp/7740";
pub const DEFAULT_TOPIC: &str = "hashnet-messages";

/// Hashnet content network node.
///
/// Serves content to peers by hash, fetches content from them, and ingests messages published on the network.
#[derive(Parser, Debug)]
#[command(version, about)]
pub struct Config {
    /// Path to the node configuration file. The default is `$HOME/.hashnet/node.yml`.
    #[arg(long = "config-file", short = 'c', env = "HASHNET_CONFIG")]
    pub config_file: Option<PathBuf>,
    /// Identity name to use. If omitted, the first identity in the identities file is used.
    #[arg(long = "id")]
    pub id_name: Option<String>,
    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Debug, Subcommand)]
pub enum CliCommand {
    /// Add, list or delete local node identities.
    #[command(subcommand, name = "id")]
    Id(IdCommand),
    /// Run the node.
    #[command(name = "serve", alias = "start")]
    Serve(ServerCommand),
    /// Fetch content from a peer by its hash.
    #[command(name = "fetch", alias = "get")]
    Fetch(FetchCommand),
    /// Publish a message on a topic.
    #[command(name = "publish", alias = "pub")]
    Publish(PublishCommand),
    /// List or add entries in the peer directory.
    #[command(subcommand, name = "peers")]
    Peers(PeersCommand),
}

#[derive(Debug, Subcommand)]
pub enum IdCommand {
    /// Create a new node identity.
    #[command(name = "new", alias = "create")]
    Create {
        /// The name of the new identity. If omitted, a random name is generated.
        name: Option<String>,
    },
    /// List all node identities.
    #[command(name = "list", alias = "ls")]
    List,
    /// Delete a node identity.
    #[command(name = "delete", alias = "del", alias = "rm")]
    Delete {
        /// The name of the identity to delete.
        id: String,
    },
}

#[derive(Debug, Args)]
pub struct ServerCommand {
    /// The address to listen to. Overrides the configuration file.
    #[arg(long = "listen-address", short = 'a')]
    pub listen_address: Option<Multiaddr>,
    /// The topic to ingest messages from. Overrides the configuration file.
    #[arg(long = "topic", short = 't')]
    pub topic: Option<String>,
}

#[derive(Debug, Args)]
pub struct FetchCommand {
    /// The content hash to look up.
    pub hash: String,
    /// The peer to ask, e.g. `/ip4/127.0.0.1/tcp/7740/p2p/12D3KooW...`.
    #[arg(long = "peer", short = 'p')]
    pub peer: Multiaddr,
    /// Write the content to this file instead of stdout.
    #[arg(long = "output", short = 'o')]
    pub output: Option<PathBuf>,
    /// Seconds to wait for streams to the peer.
    #[arg(long = "timeout", default_value_t = 10)]
    pub timeout: u64,
}

#[derive(Debug, Args)]
pub struct PublishCommand {
    /// The topic to publish on.
    pub topic: String,
    /// The file holding the message body.
    pub file: PathBuf,
    /// Dial this peer before publishing. If omitted, the peers in the directory are dialled.
    #[arg(long = "peer", short = 'p')]
    pub peer: Option<Multiaddr>,
    /// Seconds to let the topic mesh form before publishing.
    #[arg(long = "wait", default_value_t = 3)]
    pub wait: u64,
}

#[derive(Debug, Subcommand)]
pub enum PeersCommand {
    /// List known peers, most recently seen first.
    #[command(name = "list", alias = "ls")]
    List {
        /// Only list peers of this type.
        #[arg(long = "type")]
        peer_type: Option<String>,
    },
    /// Add a peer or refresh an existing entry.
    #[command(name = "add")]
    Add {
        address: Multiaddr,
        #[arg(long = "type", default_value = "core")]
        peer_type: String,
    },
}

pub struct GlobalOptions {
    pub config_file: Option<PathBuf>,
    pub id_name: Option<String>,
}

impl Config {
    pub fn to_parts(self) -> (GlobalOptions, CliCommand) {
        let global = GlobalOptions { config_file: self.config_file, id_name: self.id_name };
        (global, self.command)
    }
}

impl GlobalOptions {
    pub fn node_config(&self) -> Result<NodeConfig, NodeError> {
        let path = self.config_file.clone().unwrap_or_else(default_config_path);
        NodeConfig::load(path)
    }
}

/// Node settings read from the YAML configuration file. Missing keys take their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub identities_path: PathBuf,
    pub content_dir: PathBuf,
    pub peers_path: PathBuf,
    #[serde(serialize_with = "addr_to_string", deserialize_with = "addr_from_string")]
    pub listen_address: Multiaddr,
    pub topic: String,
    /// Only dial directory peers of this type.
    pub peer_type: Option<String>,
    pub streams_per_peer: usize,
    pub lookup_timeout_ms: u64,
    pub checkpoint_interval: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        let base = hashnet_dir();
        Self {
            identities_path: base.join("identities.yml"),
            content_dir: base.join("content"),
            peers_path: base.join("peers.yml"),
            listen_address: Multiaddr::empty().with(Protocol::Ip4(Ipv4Addr::LOCALHOST)).with(Protocol::Tcp(7740)),
            topic: DEFAULT_TOPIC.to_string(),
            peer_type: None,
            streams_per_peer: DEFAULT_STREAMS_PER_PEER,
            lookup_timeout_ms: 200,
            checkpoint_interval: hashnet_p2p::ingestion::INGESTION_CHECKPOINT,
        }
    }
}

impl NodeConfig {
    /// Load the configuration at `path`. A missing file gives the default configuration.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, NodeError> {
        match std::fs::read_to_string(path) {
            Ok(text) => Ok(serde_yml::from_str(&text)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => Err(err.into()),
        }
    }

    pub fn protocol_config(&self) -> ProtocolConfig {
        ProtocolConfig::default()
            .with_streams_per_peer(self.streams_per_peer)
            .with_lookup_timeout(Duration::from_millis(self.lookup_timeout_ms))
    }

    pub fn ingestion_config(&self) -> IngestionConfig {
        IngestionConfig::default().with_checkpoint_interval(self.checkpoint_interval)
    }
}

pub fn hashnet_dir() -> PathBuf {
    let mut home = std::env::home_dir().unwrap_or_else(|| PathBuf::from("."));
    home.push(".hashnet");
    home
}

pub fn default_config_path() -> PathBuf {
    hashnet_dir().join("node.yml")
}

fn addr_to_string<S: Serializer>(addr: &Multiaddr, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&addr.to_string())
}

fn addr_from_string<'de, D: Deserializer<'de>>(d: D) -> Result<Multiaddr, D::Error> {
    let text = String::deserialize(d)?;
    text.parse().map_err(serde::de::Error::custom)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn partial_config_keeps_defaults() {
        let config: NodeConfig =
            serde_yml::from_str("topic: aleph\nstreams_per_peer: 3\nlisten_address: /ip4/0.0.0.0/tcp/4025\n").unwrap();
        assert_eq!(config.topic, "aleph");
        assert_eq!(config.streams_per_peer, 3);
        assert_eq!(config.listen_address.to_string(), "/ip4/0.0.0.0/tcp/4025");
        assert_eq!(config.lookup_timeout_ms, 200);
        assert_eq!(config.protocol_config().streams_per_peer, 3);
        assert_eq!(config.ingestion_config().checkpoint_interval, 1000);
    }

    #[test]
    fn missing_config_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = NodeConfig::load(dir.path().join("node.yml")).unwrap();
        assert_eq!(config, NodeConfig::default());
        assert_eq!(config.listen_address.to_string(), DEFAULT_LISTEN_ADDRESS);
    }

    #[test]
    fn bad_listen_address_is_rejected() {
        assert!(serde_yml::from_str::<NodeConfig>("listen_address: not-an-address\n").is_err());
    }

    #[test]
    fn command_line_parses() {
        let peer = format!("/ip4/127.0.0.1/tcp/7740/p2p/{}", libp2p::PeerId::random());
        let config = Config::try_parse_from(["hashnet", "--id", "alice", "fetch", "QmAbc", "--peer", &peer]).unwrap();
        let (options, command) = config.to_parts();
        assert_eq!(options.id_name.as_deref(), Some("alice"));
        match command {
            CliCommand::Fetch(fetch) => {
                assert_eq!(fetch.hash, "QmAbc");
                assert_eq!(fetch.timeout, 10);
                assert!(fetch.output.is_none());
            }
            other => panic!("unexpected command {other:?}"),
        }
        assert!(Config::try_parse_from(["hashnet", "peers", "add", "nonsense"]).is_err());
    }
}
