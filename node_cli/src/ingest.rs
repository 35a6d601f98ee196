//! Ingestion collaborators for a node: admit JSON messages that name their content hash, and keep them in the
//! content store so peers can fetch them by that hash.

use async_trait::async_trait;
use hashnet_p2p::content::validate_hash;
use hashnet_p2p::errors::{AdmissionError, ProcessingError};
use hashnet_p2p::{FileContentStore, MessageAdmission, MessageProcessor, RawMessage};
use log::*;
use serde_json::Value;
use std::sync::Arc;

pub const ITEM_HASH_FIELD: &str = "item_hash";

/// An admitted message: the raw body, keyed by the hash it announced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemMessage {
    pub item_hash: String,
    pub body: Vec<u8>,
}

/// Admits JSON objects carrying a usable `item_hash`. Anything else that parses is rejected quietly.
pub struct JsonAdmission;

#[async_trait]
impl MessageAdmission for JsonAdmission {
    type Message = ItemMessage;

    async fn admit(&self, raw: RawMessage) -> Result<Option<ItemMessage>, AdmissionError> {
        let value: Value = serde_json::from_slice(&raw.data)?;
        let Some(item_hash) = value.get(ITEM_HASH_FIELD).and_then(Value::as_str) else {
            debug!("Message on {} has no {ITEM_HASH_FIELD}. Rejected.", raw.topic);
            return Ok(None);
        };
        if let Err(err) = validate_hash(item_hash) {
            debug!("Message on {} rejected. {err}", raw.topic);
            return Ok(None);
        }
        Ok(Some(ItemMessage { item_hash: item_hash.to_string(), body: raw.data }))
    }
}

pub struct StoreProcessor {
    store: Arc<FileContentStore>,
}

impl StoreProcessor {
    pub fn new(store: Arc<FileContentStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl MessageProcessor<ItemMessage> for StoreProcessor {
    async fn process(&self, message: ItemMessage) -> Result<(), ProcessingError> {
        self.store.store(&message.item_hash, &message.body).await?;
        trace!("Ingested {}", message.item_hash);
        Ok(())
    }
}
