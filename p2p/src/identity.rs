use libp2p::identity::Keypair;
use libp2p::PeerId;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt::{Debug, Display};
use std::path::Path;
use thiserror::Error;

/// A node's long-lived network identity: a name for humans and an ed25519 keypair for the transport.
#[derive(Serialize, Deserialize)]
pub struct NodeIdentity {
    name: String,
    #[serde(serialize_with = "keypair_to_hex", deserialize_with = "keypair_from_hex")]
    keypair: Keypair,
    #[serde(serialize_with = "peer_id_to_hex", deserialize_with = "peer_id_from_hex")]
    peer_id: PeerId,
}

impl NodeIdentity {
    pub fn new(name: impl Into<String>) -> Self {
        let keypair = Keypair::generate_ed25519();
        let peer_id = keypair.public().to_peer_id();
        NodeIdentity { name: name.into(), keypair, peer_id }
    }

    /// A fresh identity with a generated `node-xxxxxxxx` name.
    pub fn random() -> Self {
        let suffix: [u8; 4] = rand::random();
        Self::new(format!("node-{}", hex::encode(suffix)))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    pub fn take_keypair(self) -> Keypair {
        self.keypair
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), IdentityError> {
        std::fs::write(path, self.to_yml()?)?;
        Ok(())
    }

    pub fn to_yml(&self) -> Result<String, IdentityError> {
        Ok(serde_yml::to_string(self)?)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, IdentityError> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_yml::from_str(&text)?)
    }

    /// Whether the stored peer id really belongs to the stored key.
    pub fn check(&self) -> bool {
        self.peer_id == self.keypair.public().to_peer_id()
    }
}

impl Display for NodeIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.name, self.peer_id)
    }
}

impl Debug for NodeIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NodeIdentity({self})")
    }
}

impl PartialEq for NodeIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.peer_id == other.peer_id && self.keypair.public() == other.keypair.public()
    }
}

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("Error reading/writing identity: {0}")]
    Io(#[from] std::io::Error),
    #[error("Error de/encoding identity: {0}")]
    Serde(#[from] serde_yml::Error),
}

fn keypair_to_hex<S: Serializer>(keypair: &Keypair, s: S) -> Result<S::Ok, S::Error> {
    let ed25519 = keypair.clone().try_into_ed25519().map_err(serde::ser::Error::custom)?;
    s.serialize_str(&hex::encode(ed25519.to_bytes()))
}

/// The encoded form is the 32-byte secret followed by the 32-byte public key; the two must agree.
fn keypair_from_hex<'de, D: Deserializer<'de>>(d: D) -> Result<Keypair, D::Error> {
    let encoded = String::deserialize(d)?;
    let mut bytes = hex::decode(encoded).map_err(serde::de::Error::custom)?;
    if bytes.len() != 64 {
        return Err(serde::de::Error::custom(format!("expected 64 key bytes, got {}", bytes.len())));
    }
    let public = bytes[32..].to_vec();
    let keypair = Keypair::ed25519_from_bytes(&mut bytes[..32]).map_err(serde::de::Error::custom)?;
    let derived = keypair.public().try_into_ed25519().map_err(serde::de::Error::custom)?.to_bytes();
    if derived[..] != public[..] {
        return Err(serde::de::Error::custom("public key mismatch"));
    }
    Ok(keypair)
}

fn peer_id_to_hex<S: Serializer>(id: &PeerId, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&hex::encode(id.to_bytes()))
}

fn peer_id_from_hex<'de, D: Deserializer<'de>>(d: D) -> Result<PeerId, D::Error> {
    let encoded = String::deserialize(d)?;
    let bytes = hex::decode(encoded).map_err(serde::de::Error::custom)?;
    PeerId::from_bytes(&bytes).map_err(serde::de::Error::custom)
}
