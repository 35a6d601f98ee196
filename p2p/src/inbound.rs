use crate::content::ContentStore;
use crate::errors::ProtocolError;
use crate::message_types::{Request, Response, HASH_CONTENT_COMMAND};
use crate::transport::FrameStream;
use futures::FutureExt;
use libp2p::PeerId;
use log::*;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

/// Used if a response somehow cannot be serialised, so the peer still gets exactly one frame back.
const INTERNAL_ERROR_FRAME: &[u8] = br#"{"status":"error","reason":"internal error"}"#;

/// Answers requests arriving on inbound protocol streams.
///
/// Each inbound stream gets its own [`InboundHandler::serve`] loop. Requests on a stream are handled strictly one at a
/// time: read, answer, then read the next. Content is only ever looked up locally.
pub struct InboundHandler<C> {
    store: Arc<C>,
    lookup_timeout: Duration,
    max_frame_len: usize,
}

impl<C> Clone for InboundHandler<C> {
    fn clone(&self) -> Self {
        Self { store: Arc::clone(&self.store), lookup_timeout: self.lookup_timeout, max_frame_len: self.max_frame_len }
    }
}

impl<C: ContentStore> InboundHandler<C> {
    pub fn new(store: Arc<C>, lookup_timeout: Duration, max_frame_len: usize) -> Self {
        Self { store, lookup_timeout, max_frame_len }
    }

    /// Serve `stream` until the peer closes it or it fails.
    pub async fn serve<S: FrameStream>(&self, peer: PeerId, mut stream: S) {
        loop {
            let frame = match stream.read_frame(self.max_frame_len).await {
                Ok(frame) => frame,
                Err(err) => {
                    debug!("Inbound stream from {peer} finished. {err}");
                    break;
                }
            };
            let response = self.handle_frame(&frame).await;
            trace!("Answering peer {peer}: {response}");
            let reply = response.to_frame().unwrap_or_else(|err| {
                error!("Could not encode response for {peer}. {err}");
                INTERNAL_ERROR_FRAME.to_vec()
            });
            if let Err(err) = stream.write_frame(&reply).await {
                debug!("Could not answer peer {peer}. {err}");
                break;
            }
        }
    }

    /// Produce the response for a single request frame. Never fails: every problem becomes an error response.
    pub async fn handle_frame(&self, frame: &[u8]) -> Response {
        match AssertUnwindSafe(self.answer(frame)).catch_unwind().await {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => {
                debug!("Rejecting request. {err}");
                Response::error(err.reason())
            }
            Err(_) => {
                error!("Request handler panicked");
                Response::error("internal error")
            }
        }
    }

    async fn answer(&self, frame: &[u8]) -> Result<Response, ProtocolError> {
        let request = Request::from_frame(frame)?;
        match request.command.as_str() {
            HASH_CONTENT_COMMAND => {
                let hash = request.field_str("hash").ok_or(ProtocolError::MissingField("hash"))?;
                self.hash_content(hash).await
            }
            other => Err(ProtocolError::UnknownCommand(other.to_string())),
        }
    }

    async fn hash_content(&self, hash: &str) -> Result<Response, ProtocolError> {
        let lookup = self.store.fetch_local(hash, self.lookup_timeout);
        match tokio::time::timeout(self.lookup_timeout, lookup).await {
            Ok(Ok(Some(content))) => Ok(Response::content_found(hash, &content)),
            Ok(Ok(None)) => Ok(Response::content_missing()),
            Ok(Err(err)) => Err(err.into()),
            Err(_) => {
                debug!("Local lookup of {hash} timed out");
                Ok(Response::content_missing())
            }
        }
    }
}
