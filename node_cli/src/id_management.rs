use crate::error::NodeError;
use hashnet_p2p::NodeIdentity;
use log::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// The identities this machine can run a node as, keyed by name.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct LocalIdentitySet {
    pub identities: BTreeMap<String, NodeIdentity>,
}

impl LocalIdentitySet {
    pub fn try_load<P: AsRef<Path>>(path: P) -> Result<Self, NodeError> {
        let file = std::fs::File::open(path)?;
        let reader = std::io::BufReader::new(file);
        let ids = serde_yml::from_reader(reader)?;
        Ok(ids)
    }

    /// Like [`LocalIdentitySet::try_load`], but a missing file is an empty set.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, NodeError> {
        match Self::try_load(path.as_ref()) {
            Err(NodeError::IoError(err)) if err.kind() == std::io::ErrorKind::NotFound => {
                info!("No identities file found at {}", path.as_ref().display());
                Ok(Self::default())
            }
            result => result,
        }
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), NodeError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::File::create(path)?;
        let writer = std::io::BufWriter::new(file);
        serde_yml::to_writer(writer, self)?;
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.identities.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&NodeIdentity> {
        self.identities.get(name)
    }

    pub fn insert(&mut self, identity: NodeIdentity) -> Option<NodeIdentity> {
        self.identities.insert(identity.name().to_string(), identity)
    }

    pub fn remove<S: AsRef<str>>(&mut self, name: S) -> Option<NodeIdentity> {
        self.identities.remove(name.as_ref())
    }

    /// Take the named identity, or the first one by name if none is given.
    pub fn take(mut self, name: Option<&str>) -> Option<NodeIdentity> {
        match name {
            Some(name) => self.identities.remove(name),
            None => self.identities.into_values().next(),
        }
    }
}
