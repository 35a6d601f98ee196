use crate::message_types::{decode_content, Request, Response};
use crate::stream_pool::{Acquire, StreamPool};
use crate::transport::FrameStream;
use log::*;
use rand::seq::SliceRandom;
use std::sync::Arc;

/// Sends application requests over whichever pooled stream is free first.
///
/// A single [`Dispatcher::dispatch`] call works through a shuffled snapshot of every pooled stream. Busy streams are
/// skipped and revisited on the next pass; streams that fail are evicted from the pool and dropped from the candidate
/// list. The call ends with the first answer, or with `None` once no candidates remain.
pub struct Dispatcher<S> {
    pool: Arc<StreamPool<S>>,
    max_frame_len: usize,
}

impl<S> Clone for Dispatcher<S> {
    fn clone(&self) -> Self {
        Self { pool: Arc::clone(&self.pool), max_frame_len: self.max_frame_len }
    }
}

impl<S: FrameStream> Dispatcher<S> {
    pub fn new(pool: Arc<StreamPool<S>>, max_frame_len: usize) -> Self {
        Self { pool, max_frame_len }
    }

    pub async fn dispatch(&self, request: &Request) -> Option<Response> {
        let frame = match request.to_frame() {
            Ok(frame) => frame,
            Err(err) => {
                warn!("Could not encode {} request. {err}", request.command);
                return None;
            }
        };
        let mut candidates = self.pool.snapshot().await;
        candidates.shuffle(&mut rand::rng());

        while !candidates.is_empty() {
            let mut index = 0;
            while index < candidates.len() {
                let mut lease = match candidates[index].try_acquire() {
                    Acquire::Acquired(lease) => lease,
                    Acquire::Busy => {
                        index += 1;
                        continue;
                    }
                    Acquire::Gone => {
                        let gone = candidates.remove(index);
                        self.pool.remove(&gone.peer(), gone.id()).await;
                        continue;
                    }
                };
                let peer = lease.peer();
                match lease.exchange(&frame, self.max_frame_len).await {
                    Ok(reply) => match Response::from_frame(&reply) {
                        Ok(response) => {
                            trace!("{} answered by peer {peer}: {response}", request.command);
                            return Some(response);
                        }
                        Err(err) => {
                            warn!("Peer {peer} sent an unreadable response. {err}");
                            candidates.remove(index);
                        }
                    },
                    Err(err) => {
                        debug!("Can't request {} from peer {peer}. {err}", request.command);
                        self.pool.evict(lease).await;
                        candidates.remove(index);
                    }
                }
            }
            tokio::task::yield_now().await;
        }
        None
    }

    /// Ask the network for the content stored under `hash`.
    ///
    /// `None` covers both "no peer holds it" and "no peer could be reached"; callers cannot tell the two apart.
    pub async fn fetch_by_hash(&self, hash: &str) -> Option<Vec<u8>> {
        let response = self.dispatch(&Request::hash_content(hash)).await;
        let encoded = match response.as_ref() {
            Some(response) if response.is_success() => response.content(),
            _ => None,
        };
        let Some(encoded) = encoded else {
            debug!("Can't get hash {hash}");
            return None;
        };
        match decode_content(encoded) {
            Ok(content) => Some(content),
            Err(err) => {
                warn!("Content for {hash} is not valid base64. {err}");
                None
            }
        }
    }
}
