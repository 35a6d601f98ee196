use crate::errors::PeerDirectoryError;
use chrono::{DateTime, Utc};
use libp2p::Multiaddr;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::path::Path;

/// A known peer address, tagged with the kind of node behind it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    #[serde(serialize_with = "addr_to_string", deserialize_with = "addr_from_string")]
    pub address: Multiaddr,
    #[serde(rename = "type")]
    pub peer_type: String,
    pub last_seen: DateTime<Utc>,
}

impl PeerRecord {
    pub fn new(address: Multiaddr, peer_type: impl Into<String>) -> Self {
        Self { address, peer_type: peer_type.into(), last_seen: Utc::now() }
    }
}

/// Read-only source of peer addresses.
///
/// Each call to [`PeerDirectory::peers`] starts a fresh pass, most recently seen first, so callers can restart the
/// sequence whenever they like.
pub trait PeerDirectory {
    fn peers<'a>(&'a self, peer_type: Option<&'a str>) -> Box<dyn Iterator<Item = Multiaddr> + 'a>;
}

/// A peer directory kept in a YAML file. Addresses are unique; re-adding one refreshes its record.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct YamlPeerDirectory {
    peers: Vec<PeerRecord>,
}

impl YamlPeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the directory at `path`. A missing file is an empty directory.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, PeerDirectoryError> {
        match std::fs::read_to_string(path) {
            Ok(text) => Ok(serde_yml::from_str(&text)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => Err(err.into()),
        }
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), PeerDirectoryError> {
        std::fs::write(path, serde_yml::to_string(self)?)?;
        Ok(())
    }

    pub fn upsert(&mut self, record: PeerRecord) {
        match self.peers.iter_mut().find(|r| r.address == record.address) {
            Some(existing) => *existing = record,
            None => self.peers.push(record),
        }
    }

    pub fn records(&self) -> &[PeerRecord] {
        &self.peers
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

impl PeerDirectory for YamlPeerDirectory {
    fn peers<'a>(&'a self, peer_type: Option<&'a str>) -> Box<dyn Iterator<Item = Multiaddr> + 'a> {
        let mut matching: Vec<&PeerRecord> =
            self.peers.iter().filter(|r| peer_type.map_or(true, |t| r.peer_type == t)).collect();
        matching.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        Box::new(matching.into_iter().map(|r| r.address.clone()))
    }
}

fn addr_to_string<S: Serializer>(addr: &Multiaddr, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&addr.to_string())
}

fn addr_from_string<'de, D: Deserializer<'de>>(d: D) -> Result<Multiaddr, D::Error> {
    let text = String::deserialize(d)?;
    text.parse().map_err(serde::de::Error::custom)
}
