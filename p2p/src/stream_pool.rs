//! The per-peer pool of persistent protocol streams.
//!
//! Every pooled stream sits behind its own one-slot lock, so at most one request/response exchange uses it at a time.
//! Dispatchers never check-then-lock: [`PooledStream::try_acquire`] is a single atomic attempt that answers
//! [`Acquire::Acquired`], [`Acquire::Busy`] or [`Acquire::Gone`].
//!
//! Membership changes go through exactly two operations. [`StreamPool::try_insert`] grows a peer's entry and is only
//! called by the connection manager while it holds the peer's population lock. [`StreamPool::evict`] retires a stream
//! that failed and removes it; removal is idempotent because several dispatches may detect failures on the same peer at
//! once.
//!
//! A lease dropped in the middle of an exchange (its dispatch was cancelled between the write and the read) takes the
//! stream with it: the slot is emptied so the unread reply can never be mistaken for the answer to a later request.

use crate::errors::StreamError;
use crate::transport::FrameStream;
use libp2p::PeerId;
use log::*;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

pub type StreamId = u64;

/// A stream owned by a peer's pool entry. The stream itself lives inside the lock; once it has been retired the slot is
/// empty and the stream can never be handed out again.
pub struct PooledStream<S> {
    id: StreamId,
    peer: PeerId,
    slot: Arc<Mutex<Option<S>>>,
}

/// Outcome of a single attempt to take a pooled stream.
pub enum Acquire<S> {
    Acquired(StreamLease<S>),
    Busy,
    Gone,
}

impl<S: FrameStream> PooledStream<S> {
    fn new(id: StreamId, peer: PeerId, stream: S) -> Self {
        Self { id, peer, slot: Arc::new(Mutex::new(Some(stream))) }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn try_acquire(&self) -> Acquire<S> {
        match Arc::clone(&self.slot).try_lock_owned() {
            Err(_) => Acquire::Busy,
            Ok(guard) if guard.is_none() => Acquire::Gone,
            Ok(guard) => Acquire::Acquired(StreamLease { id: self.id, peer: self.peer, guard, in_flight: false }),
        }
    }

    #[cfg(test)]
    fn is_available(&self) -> bool {
        self.slot.try_lock().map(|slot| slot.is_some()).unwrap_or(false)
    }

    /// The stream has been taken out of service. A stream that is in use is not retired.
    pub fn is_retired(&self) -> bool {
        self.slot.try_lock().map(|slot| slot.is_none()).unwrap_or(false)
    }
}

/// Exclusive use of a pooled stream. Dropping the lease releases the stream back to the pool.
pub struct StreamLease<S> {
    id: StreamId,
    peer: PeerId,
    guard: OwnedMutexGuard<Option<S>>,
    in_flight: bool,
}

impl<S: FrameStream> StreamLease<S> {
    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    /// One request/response cycle: write a frame, read exactly one frame back.
    pub async fn exchange(&mut self, frame: &[u8], max_len: usize) -> Result<Vec<u8>, StreamError> {
        let stream = self.guard.as_mut().ok_or(StreamError::Reset)?;
        self.in_flight = true;
        stream.write_frame(frame).await?;
        let reply = stream.read_frame(max_len).await?;
        self.in_flight = false;
        Ok(reply)
    }

    /// Take the stream out of service and reset it. Only the first retirement of a stream resets it.
    async fn retire(&mut self) -> bool {
        match self.guard.take() {
            Some(mut stream) => {
                stream.reset().await;
                true
            }
            None => false,
        }
    }
}

impl<S> Drop for StreamLease<S> {
    fn drop(&mut self) {
        if self.in_flight && self.guard.take().is_some() {
            debug!("Exchange on stream {} of peer {} was abandoned. Stream retired.", self.id, self.peer);
        }
    }
}

struct PeerEntry<S> {
    streams: Vec<Arc<PooledStream<S>>>,
    population: Arc<Mutex<()>>,
}

impl<S> Default for PeerEntry<S> {
    fn default() -> Self {
        Self { streams: Vec::new(), population: Arc::new(Mutex::new(())) }
    }
}

pub struct StreamPool<S> {
    capacity: usize,
    next_id: AtomicU64,
    peers: RwLock<HashMap<PeerId, PeerEntry<S>>>,
}

impl<S: FrameStream> StreamPool<S> {
    pub fn new(capacity: usize) -> Self {
        Self { capacity, next_id: AtomicU64::new(1), peers: RwLock::new(HashMap::new()) }
    }

    /// Maximum number of pooled streams per peer.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub async fn len(&self, peer: &PeerId) -> usize {
        self.peers.read().await.get(peer).map(|entry| entry.streams.len()).unwrap_or(0)
    }

    pub async fn has_active_streams(&self, peer: &PeerId) -> bool {
        self.len(peer).await > 0
    }

    /// Peers that currently have at least one pooled stream.
    pub async fn peers(&self) -> Vec<PeerId> {
        let peers = self.peers.read().await;
        peers.iter().filter(|(_, entry)| !entry.streams.is_empty()).map(|(peer, _)| *peer).collect()
    }

    /// Every pooled stream across all peers, flattened.
    pub async fn snapshot(&self) -> Vec<Arc<PooledStream<S>>> {
        let peers = self.peers.read().await;
        peers.values().flat_map(|entry| entry.streams.iter().cloned()).collect()
    }

    /// Serialises pool growth for one peer. Hold the guard for the whole population attempt.
    pub async fn population_lock(&self, peer: PeerId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut peers = self.peers.write().await;
            Arc::clone(&peers.entry(peer).or_default().population)
        };
        lock.lock_owned().await
    }

    /// Add a fully set-up stream to `peer`'s entry. If the entry is already at capacity the stream is handed back.
    pub async fn try_insert(&self, peer: PeerId, stream: S) -> Result<Arc<PooledStream<S>>, S> {
        let mut peers = self.peers.write().await;
        let entry = peers.entry(peer).or_default();
        if entry.streams.len() >= self.capacity {
            return Err(stream);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let pooled = Arc::new(PooledStream::new(id, peer, stream));
        entry.streams.push(Arc::clone(&pooled));
        trace!("Pooled stream {id} for peer {peer} ({}/{})", entry.streams.len(), self.capacity);
        Ok(pooled)
    }

    /// Remove a stream from its peer's entry. Returns false if it was not there (already removed, or peer unknown).
    pub async fn remove(&self, peer: &PeerId, id: StreamId) -> bool {
        let mut peers = self.peers.write().await;
        let Some(entry) = peers.get_mut(peer) else {
            return false;
        };
        let before = entry.streams.len();
        entry.streams.retain(|pooled| pooled.id != id);
        let removed = before != entry.streams.len();
        Self::forget_if_idle(&mut peers, peer);
        removed
    }

    /// Drop streams of `peer` that were retired without being removed, e.g. by an abandoned exchange.
    pub async fn prune(&self, peer: &PeerId) -> usize {
        let mut peers = self.peers.write().await;
        let Some(entry) = peers.get_mut(peer) else {
            return 0;
        };
        let before = entry.streams.len();
        entry.streams.retain(|pooled| !pooled.is_retired());
        before - entry.streams.len()
    }

    /// Forget `peer` entirely if it has no streams and nobody is populating it.
    pub async fn release(&self, peer: &PeerId) {
        Self::forget_if_idle(&mut *self.peers.write().await, peer);
    }

    fn forget_if_idle(peers: &mut HashMap<PeerId, PeerEntry<S>>, peer: &PeerId) {
        // A population in progress holds a second reference to the lock.
        let idle = peers
            .get(peer)
            .is_some_and(|entry| entry.streams.is_empty() && Arc::strong_count(&entry.population) == 1);
        if idle {
            peers.remove(peer);
            trace!("Forgot peer {peer}");
        }
    }

    /// Reset a failed stream and drop it from the pool. Safe to race with other evictions of the same stream.
    pub async fn evict(&self, mut lease: StreamLease<S>) -> bool {
        let retired = lease.retire().await;
        let (peer, id) = (lease.peer, lease.id);
        drop(lease);
        let removed = self.remove(&peer, id).await;
        debug!("Evicted stream {id} of peer {peer} (reset: {retired}, removed: {removed})");
        retired || removed
    }
}
