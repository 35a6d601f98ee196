use crate::errors::ProtocolError;
use base64::prelude::*;
use libp2p::StreamProtocol;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt::{Display, Formatter};

/// The protocol tag used to select this application protocol over the shared transport.
pub const PROTOCOL_ID: StreamProtocol = StreamProtocol::new("/hashnet/p2p/0.1.0");
/// The largest frame we will read off a stream.
pub const MAX_READ_LEN: usize = u32::MAX as usize;
/// Number of pooled streams kept open to every peer.
pub const DEFAULT_STREAMS_PER_PEER: usize = 5;

pub const HELLO_COMMAND: &str = "hello";
pub const HASH_CONTENT_COMMAND: &str = "hash_content";

/// A request frame. `command` selects the handler; every other key is command-specific.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub command: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Request {
    pub fn new(command: impl Into<String>) -> Self {
        Self { command: command.into(), fields: Map::new() }
    }

    /// The fixed greeting sent on every freshly opened pool stream.
    pub fn hello() -> Self {
        Self::new(HELLO_COMMAND)
    }

    pub fn hash_content(hash: impl Into<String>) -> Self {
        Self::new(HASH_CONTENT_COMMAND).with_field("hash", hash.into())
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn field_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }

    pub fn to_frame(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_frame(frame: &[u8]) -> Result<Self, ProtocolError> {
        let text = std::str::from_utf8(frame)?;
        let request = serde_json::from_str(text)?;
        Ok(request)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Error,
}

/// A response frame. A missing field means "null / not found", which is not the same as an error status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub status: Status,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Response {
    pub fn success() -> Self {
        Self { status: Status::Success, fields: Map::new() }
    }

    pub fn error(reason: impl Into<String>) -> Self {
        Self { status: Status::Error, fields: Map::new() }.with_field("reason", reason.into())
    }

    /// A successful `hash_content` answer carrying the encoded content.
    pub fn content_found(hash: impl Into<String>, content: &[u8]) -> Self {
        Self::success().with_field("hash", hash.into()).with_field("content", encode_content(content))
    }

    /// A successful `hash_content` answer for content we do not hold.
    pub fn content_missing() -> Self {
        Self::success().with_field("content", Value::Null)
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == Status::Success
    }

    pub fn reason(&self) -> Option<&str> {
        self.fields.get("reason").and_then(Value::as_str)
    }

    /// The encoded content, if present and not null.
    pub fn content(&self) -> Option<&str> {
        self.fields.get("content").and_then(Value::as_str)
    }

    pub fn to_frame(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_frame(frame: &[u8]) -> Result<Self, ProtocolError> {
        let text = std::str::from_utf8(frame)?;
        let response = serde_json::from_str(text)?;
        Ok(response)
    }
}

impl Display for Response {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match (self.status, self.reason(), self.content()) {
            (Status::Error, Some(reason), _) => write!(f, "Error: {reason}"),
            (Status::Error, None, _) => write!(f, "Error"),
            (Status::Success, _, Some(content)) => write!(f, "Success ({} encoded bytes)", content.len()),
            (Status::Success, _, None) => write!(f, "Success"),
        }
    }
}

pub fn encode_content(content: &[u8]) -> String {
    BASE64_STANDARD.encode(content)
}

/// Decodes content sent by a peer. MIME-style line breaks inside the payload are tolerated.
pub fn decode_content(encoded: &str) -> Result<Vec<u8>, base64::DecodeError> {
    if encoded.bytes().any(|b| b.is_ascii_whitespace()) {
        let compact: String = encoded.chars().filter(|c| !c.is_ascii_whitespace()).collect();
        BASE64_STANDARD.decode(compact)
    } else {
        BASE64_STANDARD.decode(encoded)
    }
}
