//! Peers of one stream's swarm.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use rand::Rng;
use rand::seq::IndexedRandom;

use super::{Peer, PeerContext, PeerId, PeerReaction, PeerSettings};
use crate::request::TimeoutCallback;
use crate::stream::StreamId;
use crate::transport::DataChannel;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Receives `(peer, connection, generation)` when a peer timer fires.
pub type PeerTimeoutNotifier = Arc<dyn Fn(PeerId, u64, u64) + Send + Sync>;

struct TentativeConnection {
    connection_id: u64,
    channel: Arc<dyn DataChannel>,
}

#[derive(Default)]
struct PeerSlot {
    peer: Option<Peer>,
    tentative: Vec<TentativeConnection>,
}

/// Membership of one swarm.
///
/// A remote may be offered several connections; the first to connect
/// becomes the peer and the others are closed.
pub struct Swarm {
    stream: StreamId,
    swarm_key: String,
    local_id: PeerId,
    settings: PeerSettings,
    slots: HashMap<PeerId, PeerSlot>,
    on_timeout: PeerTimeoutNotifier,
}

impl Swarm {
    pub fn new(
        stream: StreamId,
        swarm_key: String,
        local_id: PeerId,
        settings: PeerSettings,
        on_timeout: PeerTimeoutNotifier,
    ) -> Self {
        Self {
            stream,
            swarm_key,
            local_id,
            settings,
            slots: HashMap::new(),
            on_timeout,
        }
    }

    pub fn stream(&self) -> StreamId {
        self.stream
    }

    pub fn swarm_key(&self) -> &str {
        &self.swarm_key
    }

    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    /// Registers a connection offered by the rendezvous, returning its id.
    pub fn add_candidate(&mut self, remote_id: PeerId, channel: Arc<dyn DataChannel>) -> Option<u64> {
        if remote_id == self.local_id {
            channel.close();
            return None;
        }
        let connection_id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        self.slots
            .entry(remote_id)
            .or_default()
            .tentative
            .push(TentativeConnection {
                connection_id,
                channel,
            });
        Some(connection_id)
    }

    /// Promotes a connected candidate to the peer of its remote.
    ///
    /// Returns `None` when the remote already has a peer or the connection
    /// is unknown; the connection is then closed.
    pub fn on_connected(&mut self, remote_id: &PeerId, connection_id: u64) -> Option<&mut Peer> {
        let slot = self.slots.get_mut(remote_id)?;
        let position = slot
            .tentative
            .iter()
            .position(|candidate| candidate.connection_id == connection_id)?;
        let connected = slot.tentative.swap_remove(position);

        if slot.peer.is_some() {
            connected.channel.close();
            return None;
        }

        for duplicate in slot.tentative.drain(..) {
            duplicate.channel.close();
        }

        let on_timeout = Arc::clone(&self.on_timeout);
        let timer_peer = remote_id.clone();
        let peer = Peer::new(
            remote_id.clone(),
            self.stream,
            connection_id,
            connected.channel,
            self.settings.clone(),
            Arc::new(move |generation: u64| on_timeout(timer_peer.clone(), connection_id, generation))
                as TimeoutCallback,
        );
        tracing::info!(peer = %remote_id, stream = %self.stream, "Peer connected");
        slot.peer = Some(peer);
        slot.peer.as_mut()
    }

    /// Handles a closed connection; returns the reactions of the removed
    /// peer, or `None` for a tentative or stale connection.
    pub fn on_closed(
        &mut self,
        remote_id: &PeerId,
        connection_id: u64,
        ctx: &mut PeerContext<'_>,
    ) -> Option<Vec<PeerReaction>> {
        let slot = self.slots.get_mut(remote_id)?;
        let is_peer = slot
            .peer
            .as_ref()
            .is_some_and(|peer| peer.connection_id() == connection_id);
        if !is_peer {
            slot.tentative
                .retain(|candidate| candidate.connection_id != connection_id);
            if slot.peer.is_none() && slot.tentative.is_empty() {
                self.slots.remove(remote_id);
            }
            return None;
        }
        self.remove_peer(remote_id, ctx)
    }

    /// Destroys and forgets a peer.
    pub fn remove_peer(&mut self, remote_id: &PeerId, ctx: &mut PeerContext<'_>) -> Option<Vec<PeerReaction>> {
        let mut slot = self.slots.remove(remote_id)?;
        for candidate in slot.tentative.drain(..) {
            candidate.channel.close();
        }
        let mut peer = slot.peer.take()?;
        Some(peer.destroy(ctx))
    }

    /// Live peer of a remote, if `connection_id` is its connection.
    pub fn peer_mut(&mut self, remote_id: &PeerId, connection_id: u64) -> Option<&mut Peer> {
        self.slots
            .get_mut(remote_id)?
            .peer
            .as_mut()
            .filter(|peer| peer.connection_id() == connection_id)
    }

    pub fn peer_by_id_mut(&mut self, remote_id: &PeerId) -> Option<&mut Peer> {
        self.slots.get_mut(remote_id)?.peer.as_mut()
    }

    pub fn peers(&self) -> impl Iterator<Item = &Peer> {
        self.slots.values().filter_map(|slot| slot.peer.as_ref())
    }

    pub fn peers_mut(&mut self) -> impl Iterator<Item = &mut Peer> {
        self.slots.values_mut().filter_map(|slot| slot.peer.as_mut())
    }

    pub fn connected_count(&self) -> usize {
        self.peers().count()
    }

    /// Picks a random idle peer that announced the segment as loaded.
    pub fn peer_for_download<R: Rng>(&self, external_id: i64, rng: &mut R) -> Option<PeerId> {
        let mut candidates: Vec<&PeerId> = self
            .peers()
            .filter(|peer| !peer.is_downloading() && peer.has_segment(external_id))
            .map(Peer::id)
            .collect();
        // Map order is unspecified; sort so seeded runs are reproducible
        candidates.sort();
        candidates.choose(rng).map(|id| (*id).clone())
    }

    pub fn is_segment_loaded_by_someone(&self, external_id: i64) -> bool {
        self.peers().any(|peer| peer.has_segment(external_id))
    }

    pub fn is_segment_loading_or_loaded_by_someone(&self, external_id: i64) -> bool {
        self.peers().any(|peer| peer.is_loading_or_loaded(external_id))
    }

    /// Destroys every peer and closes pending connections.
    pub fn destroy(&mut self, ctx: &mut PeerContext<'_>) -> Vec<(PeerId, Vec<PeerReaction>)> {
        let remote_ids: Vec<PeerId> = self.slots.keys().cloned().collect();
        let mut destroyed = Vec::new();
        for remote_id in remote_ids {
            if let Some(reactions) = self.remove_peer(&remote_id, ctx) {
                destroyed.push((remote_id, reactions));
            }
        }
        destroyed
    }
}
