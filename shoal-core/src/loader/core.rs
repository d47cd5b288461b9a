//! Hybrid loader state and its reactions to commands and events.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::commands::LoaderEvent;
use super::{
    Collaborators, LoaderError, LoaderStats, SegmentResponder, SegmentResponse, SegmentValidator,
};
use crate::bandwidth::{BandwidthApproximator, BandwidthCalculators};
use crate::config::ShoalConfig;
use crate::events::{CoreEvent, EventBus};
use crate::peer::{PeerContext, PeerId, PeerReaction, PeerSettings, PeerTimeoutNotifier, Swarm};
use crate::request::{DownloadSource, RequestContainer, RequestError};
use crate::scheduler::segment_playback_statuses;
use crate::storage::SegmentCache;
use crate::stream::{
    Playback, Segment, SegmentKey, Stream, StreamId, swarm_id_for_stream, swarm_key,
};
use crate::transport::{
    ChannelEvent, HttpTransport, PeerCandidate, RendezvousEvent, SwarmRendezvous,
};

/// Loading-time window of the bandwidth reported with a segment.
const RESPONSE_BANDWIDTH_WINDOW: Duration = Duration::from_secs(3);

/// Share of an average segment duration the position may move before the
/// queue is re-evaluated without debounce.
const SIGNIFICANT_POSITION_SHIFT: f64 = 0.45;

/// Running HTTP transfer task of one request.
pub(super) struct HttpTask {
    pub attempt_id: u64,
    pub handle: JoinHandle<()>,
}

#[derive(Debug, Default, Clone, Copy)]
pub(super) struct Traffic {
    pub http_bytes: u64,
    pub p2p_bytes: u64,
    pub uploaded_bytes: u64,
}

/// State owned by the loader actor.
///
/// Every field is touched from the actor task only; transfer tasks and
/// timers report through `event_sender`.
pub(crate) struct HybridLoader {
    pub(super) config: ShoalConfig,
    pub(super) streams: HashMap<StreamId, Stream>,
    pub(super) playback: Arc<RwLock<Playback>>,
    /// Playback seen by the last pass
    pub(super) pass_playback: Playback,
    pub(super) last_requested: HashMap<StreamId, String>,
    pub(super) requests: RequestContainer,
    pub(super) cache: SegmentCache,
    pub(super) bandwidth: BandwidthCalculators,
    pub(super) approximator: BandwidthApproximator,
    pub(super) swarms: HashMap<StreamId, Swarm>,
    rendezvous_tasks: HashMap<StreamId, JoinHandle<()>>,
    channel_tasks: HashMap<u64, JoinHandle<()>>,
    pub(super) http: Arc<dyn HttpTransport>,
    rendezvous: Option<Arc<dyn SwarmRendezvous>>,
    validator: Option<Arc<dyn SegmentValidator>>,
    pub(super) events: EventBus,
    pub(super) event_sender: mpsc::UnboundedSender<LoaderEvent>,
    pub(super) http_tasks: HashMap<SegmentKey, HttpTask>,
    pub(super) rng: ChaCha8Rng,
    local_id: PeerId,
    pub(super) last_pass_at: Option<tokio::time::Instant>,
    pub(super) pass_deadline: Option<tokio::time::Instant>,
    /// Streams whose announcement must be broadcast after the pass
    pub(super) dirty_announcements: HashSet<StreamId>,
    pub(super) traffic: Traffic,
}

impl HybridLoader {
    pub(super) fn new(
        config: ShoalConfig,
        collaborators: Collaborators,
        events: EventBus,
        event_sender: mpsc::UnboundedSender<LoaderEvent>,
    ) -> Self {
        let mut rng = match config.random_seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_rng(&mut rand::rng()),
        };
        let local_id = PeerId::generate(&config.p2p.client_version_prefix, &mut rng);

        let timeout_sender = event_sender.clone();
        let requests = RequestContainer::new(Arc::new(move |key: SegmentKey, generation: u64| {
            let _ = timeout_sender.send(LoaderEvent::RequestTimeout { key, generation });
        }));

        Self {
            cache: SegmentCache::new(config.cache.clone()),
            config,
            streams: HashMap::new(),
            playback: Arc::new(RwLock::new(Playback::default())),
            pass_playback: Playback::default(),
            last_requested: HashMap::new(),
            requests,
            bandwidth: BandwidthCalculators::new(),
            approximator: BandwidthApproximator::new(),
            swarms: HashMap::new(),
            rendezvous_tasks: HashMap::new(),
            channel_tasks: HashMap::new(),
            http: collaborators.http,
            rendezvous: collaborators.rendezvous,
            validator: collaborators.validator,
            events,
            event_sender,
            http_tasks: HashMap::new(),
            rng,
            local_id,
            last_pass_at: None,
            pass_deadline: None,
            dirty_announcements: HashSet::new(),
            traffic: Traffic::default(),
        }
    }

    pub(super) fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    pub(super) fn random_http_interval(&self) -> Duration {
        self.config.timeouts.random_http_interval
    }

    /// When the debounced pass is due, if one is pending.
    pub(super) fn pass_deadline(&self) -> Option<tokio::time::Instant> {
        self.pass_deadline
    }

    /// Runs a pass now when forced or when the minimum interval elapsed;
    /// otherwise arms the debounce deadline.
    pub(super) fn schedule_pass(&mut self, force: bool) {
        let now = tokio::time::Instant::now();
        let earliest = self
            .last_pass_at
            .map_or(now, |at| at + self.config.timeouts.queue_min_interval);
        if force || earliest <= now {
            self.process_queue();
        } else if self.pass_deadline.is_none() {
            self.pass_deadline = Some(earliest);
        }
    }

    pub(super) fn load_segment(&mut self, key: SegmentKey, responder: SegmentResponder) {
        let Some(stream) = self.streams.get(&key.stream) else {
            let _ = responder.send(Err(LoaderError::UnknownStream { stream: key.stream }));
            return;
        };
        let Some(segment) = stream.segment(&key.local_id).cloned() else {
            let _ = responder.send(Err(LoaderError::UnknownSegment { key }));
            return;
        };

        self.last_requested
            .insert(key.stream, key.local_id.clone());

        let now = Instant::now();
        if let Some(data) = self.cache.get(&key, now) {
            tracing::debug!(segment = %key, "Serving segment from cache");
            let bandwidth_bps = self.response_bandwidth(now);
            let _ = responder.send(Ok(SegmentResponse {
                data,
                bandwidth_bps,
            }));
            self.schedule_pass(true);
            return;
        }

        let request = self.requests.get_or_create(&segment);
        if !request.is_loading() {
            // A new player request gets a fresh retry budget
            request.failed_attempts_mut().clear();
        }
        if let Some(previous) = request.replace_caller(responder) {
            let _ = previous.send(Err(LoaderError::Aborted));
        }
        self.schedule_pass(true);
    }

    pub(super) fn abort_segment_loading(&mut self, key: &SegmentKey) {
        if let Some(request) = self.requests.get_mut(key) {
            tracing::debug!(segment = %key, "Caller released");
            request.resolve_error(LoaderError::Aborted);
        }
        self.schedule_pass(true);
    }

    pub(super) fn update_playback(&mut self, position: f64, rate: f64) {
        if !position.is_finite() {
            tracing::warn!(position, "Ignoring non-finite playback position");
            return;
        }
        let playback = {
            let mut playback = self.playback.write();
            playback.position = position;
            if rate.is_finite() && rate > 0.0 {
                playback.rate = rate;
            }
            *playback
        };

        let threshold = self.average_segment_duration() * SIGNIFICANT_POSITION_SHIFT;
        let shift = (playback.position - self.pass_playback.position).abs();
        let significant = shift > threshold || playback.rate != self.pass_playback.rate;
        self.schedule_pass(significant);
    }

    pub(super) fn add_stream(&mut self, stream: Stream) -> Result<(), LoaderError> {
        let id = stream.id();
        if let Some(existing) = self.streams.get_mut(&id) {
            existing.append_segments(stream.segments().map(|segment| (**segment).clone()));
            return Ok(());
        }

        let playback = Arc::clone(&self.playback);
        let windows = self.config.windows.clone();
        self.cache.register_lock_predicate(
            id,
            Box::new(move |segment: &Segment| {
                segment_playback_statuses(segment, &playback.read(), &windows).is_actual()
            }),
        );
        self.join_swarm(&stream);

        tracing::info!(stream = %id, segments = stream.len(), "Stream added");
        self.streams.insert(id, stream);
        Ok(())
    }

    pub(super) fn update_stream(
        &mut self,
        id: StreamId,
        added: Vec<Segment>,
        removed: Vec<String>,
    ) -> Result<(), LoaderError> {
        let Some(stream) = self.streams.get_mut(&id) else {
            return Err(LoaderError::UnknownStream { stream: id });
        };
        stream.append_segments(added);
        let removed_count = stream.remove_segments(&removed);

        for local_id in removed {
            let key = SegmentKey::new(id, local_id);
            self.abort_attempt(&key);
            if let Some(mut request) = self.requests.remove(&key) {
                request.resolve_error(LoaderError::Aborted);
            }
        }

        tracing::debug!(stream = %id, removed = removed_count, "Stream updated");
        self.schedule_pass(false);
        Ok(())
    }

    pub(super) fn stats(&mut self) -> LoaderStats {
        let bandwidth_bps = self.response_bandwidth(Instant::now());
        LoaderStats {
            http_loading: self.requests.executing_http_count(),
            p2p_loading: self.requests.executing_p2p_count(),
            cached_segments: self.cache.len(),
            connected_peers: self.swarms.values().map(Swarm::connected_count).sum(),
            http_bytes: self.traffic.http_bytes,
            p2p_bytes: self.traffic.p2p_bytes,
            uploaded_bytes: self.traffic.uploaded_bytes,
            bandwidth_bps,
            cache: self.cache.stats(),
        }
    }

    /// Stops every transfer, closes peers, leaves swarms and resolves
    /// waiting callers with `Shutdown`.
    pub(super) async fn shutdown(&mut self) {
        for (_, task) in self.http_tasks.drain() {
            task.handle.abort();
        }

        let now = Instant::now();
        let mut swarms: Vec<Swarm> = self.swarms.drain().map(|(_, swarm)| swarm).collect();
        let mut ctx = PeerContext {
            requests: &mut self.requests,
            bandwidth: &mut self.bandwidth,
            now,
        };
        for swarm in &mut swarms {
            for (peer, _) in swarm.destroy(&mut ctx) {
                self.events.emit(CoreEvent::PeerClose {
                    peer,
                    stream: swarm.stream(),
                });
            }
        }
        self.requests.destroy(&mut self.bandwidth, now);

        for (_, task) in self.rendezvous_tasks.drain() {
            task.abort();
        }
        for (_, task) in self.channel_tasks.drain() {
            task.abort();
        }
        if let Some(rendezvous) = self.rendezvous.as_ref() {
            for swarm in &swarms {
                rendezvous.leave(swarm.swarm_key(), &self.local_id).await;
            }
        }

        self.pass_deadline = None;
        tracing::info!(peer = %self.local_id, "Hybrid loader shut down");
    }

    pub(super) fn handle_event(&mut self, event: LoaderEvent) {
        match event {
            LoaderEvent::RequestTimeout { key, generation } => {
                self.on_request_timeout(key, generation);
            }
            LoaderEvent::PeerTimeout {
                stream,
                peer,
                connection_id,
                generation,
            } => {
                let Some(session) = self
                    .swarms
                    .get_mut(&stream)
                    .and_then(|swarm| swarm.peer_mut(&peer, connection_id))
                else {
                    return;
                };
                let mut ctx = PeerContext {
                    requests: &mut self.requests,
                    bandwidth: &mut self.bandwidth,
                    now: Instant::now(),
                };
                let reactions = session.handle_timeout(generation, &mut ctx);
                self.apply_peer_reactions(stream, &peer, reactions);
            }
            LoaderEvent::HttpHeaders {
                key,
                attempt_id,
                verdict,
            } => self.on_http_headers(&key, attempt_id, verdict),
            LoaderEvent::HttpChunk {
                key,
                attempt_id,
                data,
            } => self.on_http_chunk(&key, attempt_id, data),
            LoaderEvent::HttpFinished { key, attempt_id } => self.on_http_finished(&key, attempt_id),
            LoaderEvent::HttpFailed {
                key,
                attempt_id,
                error,
            } => {
                if self.is_current_http(&key, attempt_id) {
                    self.fail_http(&key, error);
                }
            }
            LoaderEvent::Channel {
                stream,
                remote,
                connection_id,
                event,
            } => self.on_channel_event(stream, remote, connection_id, event),
            LoaderEvent::Rendezvous { stream, event } => self.on_rendezvous_event(stream, event),
        }
    }

    /// Aborts the running attempt of a request on scheduler decision.
    pub(super) fn abort_attempt(&mut self, key: &SegmentKey) {
        let now = Instant::now();
        let Some(request) = self.requests.get_mut(key) else {
            return;
        };
        if !request.is_loading() {
            return;
        }
        let source = request.current_source();
        let peer = request.current_peer().cloned();
        let loaded_percent = request.loaded_percent();
        if request.abort_from_queue(&mut self.bandwidth, now).is_err() {
            return;
        }
        tracing::debug!(segment = %key, ?source, ?loaded_percent, "Attempt aborted");

        if let Some(task) = self.http_tasks.remove(key) {
            task.handle.abort();
        }
        if let Some(peer_id) = peer.as_ref() {
            let session = self
                .swarms
                .get_mut(&key.stream)
                .and_then(|swarm| swarm.peer_by_id_mut(peer_id))
                .filter(|session| session.downloading_key() == Some(key));
            if let Some(session) = session {
                session.abort_download();
            }
        }
        if source == Some(DownloadSource::Http) {
            self.dirty_announcements.insert(key.stream);
        }

        self.events.emit(CoreEvent::SegmentAbort {
            key: key.clone(),
            source,
            peer,
        });
    }

    /// Validates, caches and delivers the bytes of a finished attempt.
    pub(super) fn finish_download(&mut self, key: &SegmentKey, source: DownloadSource) {
        let now = Instant::now();
        let Some(request) = self.requests.get_mut(key) else {
            return;
        };
        if !request.is_loading() {
            return;
        }
        let peer = request.current_peer().cloned();
        let segment = Arc::clone(request.segment());
        let data = request.assembled_data();

        let valid = self
            .validator
            .as_ref()
            .is_none_or(|validator| validator.validate(&segment, &data, source));
        if !valid {
            let error = match source {
                DownloadSource::Http => RequestError::HttpSegmentValidationFailed,
                DownloadSource::P2p => RequestError::P2pSegmentValidationFailed,
            };
            request.clear_loaded_bytes();
            let _ = request.abort_on_error(error.clone(), &mut self.bandwidth, now);
            self.http_tasks.remove(key);
            tracing::warn!(segment = %key, %source, "Segment failed validation");

            self.events.emit(CoreEvent::SegmentError {
                key: key.clone(),
                error,
                source,
                peer: peer.clone(),
            });
            if let Some(peer) = peer {
                self.destroy_peer(key.stream, &peer);
            }
            self.dirty_announcements.insert(key.stream);
            self.schedule_pass(false);
            return;
        }

        if let (Some(attempt_id), Some(progress)) = (request.attempt_id(), request.progress()) {
            self.approximator.record(attempt_id, progress);
        }
        let Some(mut request) = self.requests.remove(key) else {
            return;
        };
        let data = match request.complete_on_success(&mut self.bandwidth, now) {
            Ok(data) => data,
            Err(error) => {
                tracing::warn!(segment = %key, %error, "Could not complete request");
                return;
            }
        };
        self.http_tasks.remove(key);

        let bandwidth_bps = self.response_bandwidth(now);
        request.resolve_success(SegmentResponse {
            data: data.clone(),
            bandwidth_bps,
        });

        let bytes = data.len() as u64;
        let evicted = self.cache.store(segment, data, now);
        if !evicted.is_empty() {
            tracing::debug!(evicted = evicted.len(), "Evicted cached segments");
        }
        tracing::debug!(segment = %key, %source, bytes, "Segment loaded");

        self.events.emit(CoreEvent::SegmentLoaded {
            key: key.clone(),
            bytes,
            source,
            peer,
        });
        self.dirty_announcements.insert(key.stream);
        self.schedule_pass(false);
    }

    /// Loading-only estimate of the last seconds, else the approximator.
    pub(super) fn response_bandwidth(&mut self, now: Instant) -> f64 {
        let loading_only = self
            .bandwidth
            .all
            .bandwidth_loading_only(RESPONSE_BANDWIDTH_WINDOW, now);
        if loading_only > 0.0 {
            loading_only
        } else {
            self.approximator.bandwidth(now)
        }
    }

    /// Sorted `(loaded, http_loading)` external ids advertised for a stream.
    pub(super) fn announcement_for(&self, stream: StreamId) -> (Vec<i64>, Vec<i64>) {
        let mut loaded = self.cache.stored_external_ids(stream);
        let mut http_loading = self.requests.http_loading_external_ids(stream);
        loaded.sort_unstable();
        http_loading.sort_unstable();
        (loaded, http_loading)
    }

    fn average_segment_duration(&self) -> f64 {
        self.last_requested
            .keys()
            .filter_map(|id| self.streams.get(id))
            .map(Stream::average_segment_duration)
            .filter(|duration| *duration > 0.0)
            .fold(None, |min: Option<f64>, duration| {
                Some(min.map_or(duration, |min| min.min(duration)))
            })
            .unwrap_or(0.0)
    }

    fn join_swarm(&mut self, stream: &Stream) {
        if !self.config.p2p.enabled {
            return;
        }
        let Some(rendezvous) = self.rendezvous.clone() else {
            return;
        };
        let base = match (self.config.p2p.swarm_id.as_ref(), stream.manifest_url()) {
            (Some(swarm_id), _) => swarm_id.clone(),
            (None, Some(url)) => url.to_string(),
            (None, None) => {
                tracing::debug!(stream = %stream.id(), "No swarm identity, P2P disabled for stream");
                return;
            }
        };

        let id = stream.id();
        let key = swarm_key(&swarm_id_for_stream(&base, id));
        let timeout_sender = self.event_sender.clone();
        let on_timeout: PeerTimeoutNotifier =
            Arc::new(move |peer: PeerId, connection_id: u64, generation: u64| {
                let _ = timeout_sender.send(LoaderEvent::PeerTimeout {
                    stream: id,
                    peer,
                    connection_id,
                    generation,
                });
            });
        self.swarms.insert(
            id,
            Swarm::new(
                id,
                key.clone(),
                self.local_id.clone(),
                PeerSettings::from_config(&self.config),
                on_timeout,
            ),
        );

        tracing::debug!(stream = %id, swarm = %key, "Joining swarm");
        let sender = self.event_sender.clone();
        let local_id = self.local_id.clone();
        let task = tokio::spawn(async move {
            match rendezvous.join(&key, &local_id).await {
                Ok(mut events) => {
                    while let Some(event) = events.recv().await {
                        if sender
                            .send(LoaderEvent::Rendezvous { stream: id, event })
                            .is_err()
                        {
                            break;
                        }
                    }
                }
                Err(error) => {
                    let _ = sender.send(LoaderEvent::Rendezvous {
                        stream: id,
                        event: RendezvousEvent::Error(error.to_string()),
                    });
                }
            }
        });
        self.rendezvous_tasks.insert(id, task);
    }

    fn on_request_timeout(&mut self, key: SegmentKey, generation: u64) {
        let now = Instant::now();
        let Some(request) = self.requests.get_mut(&key) else {
            return;
        };
        let source = request.current_source().unwrap_or(DownloadSource::Http);
        let peer = request.current_peer().cloned();
        if !request.abort_on_timeout(generation, &mut self.bandwidth, now) {
            return;
        }
        if let Some(task) = self.http_tasks.remove(&key) {
            task.handle.abort();
        }
        tracing::warn!(segment = %key, %source, "No bytes received in time");

        self.dirty_announcements.insert(key.stream);
        self.events.emit(CoreEvent::SegmentError {
            key,
            error: RequestError::BytesReceivingTimeout,
            source,
            peer,
        });
        self.schedule_pass(false);
    }

    fn on_rendezvous_event(&mut self, stream: StreamId, event: RendezvousEvent) {
        match event {
            RendezvousEvent::Candidate(PeerCandidate {
                remote_id,
                channel,
                events,
            }) => {
                let Some(swarm) = self.swarms.get_mut(&stream) else {
                    channel.close();
                    return;
                };
                let Some(connection_id) = swarm.add_candidate(remote_id.clone(), channel) else {
                    return;
                };
                let task = tokio::spawn(forward_channel_events(
                    stream,
                    remote_id,
                    connection_id,
                    events,
                    self.event_sender.clone(),
                ));
                self.channel_tasks.insert(connection_id, task);
            }
            RendezvousEvent::Warning(reason) => {
                tracing::warn!(stream = %stream, %reason, "Rendezvous warning");
                self.events.emit(CoreEvent::TrackerWarning { reason });
            }
            RendezvousEvent::Error(reason) => {
                tracing::warn!(stream = %stream, %reason, "Rendezvous error");
                self.events.emit(CoreEvent::TrackerError { reason });
            }
        }
    }

    fn on_channel_event(
        &mut self,
        stream: StreamId,
        remote: PeerId,
        connection_id: u64,
        event: ChannelEvent,
    ) {
        let now = Instant::now();
        match event {
            ChannelEvent::Connected => {
                let (loaded, http_loading) = self.announcement_for(stream);
                let Some(peer) = self
                    .swarms
                    .get_mut(&stream)
                    .and_then(|swarm| swarm.on_connected(&remote, connection_id))
                else {
                    return;
                };
                if let Err(error) = peer.send_announcement(loaded, http_loading) {
                    tracing::warn!(peer = %remote, %error, "Failed to send announcement");
                }
                self.events.emit(CoreEvent::PeerConnect {
                    peer: remote,
                    stream,
                });
                self.schedule_pass(false);
            }
            ChannelEvent::Data(data) => {
                let Some(peer) = self
                    .swarms
                    .get_mut(&stream)
                    .and_then(|swarm| swarm.peer_mut(&remote, connection_id))
                else {
                    return;
                };
                let mut ctx = PeerContext {
                    requests: &mut self.requests,
                    bandwidth: &mut self.bandwidth,
                    now,
                };
                let reactions = peer.handle_data(data, &mut ctx);
                self.apply_peer_reactions(stream, &remote, reactions);
            }
            ChannelEvent::BufferedAmountLow => {
                let Some(peer) = self
                    .swarms
                    .get_mut(&stream)
                    .and_then(|swarm| swarm.peer_mut(&remote, connection_id))
                else {
                    return;
                };
                match peer.handle_buffered_amount_low() {
                    Ok(reactions) => self.apply_peer_reactions(stream, &remote, reactions),
                    Err(error) => {
                        tracing::warn!(peer = %remote, %error, "Upload failed");
                        self.destroy_peer(stream, &remote);
                    }
                }
            }
            ChannelEvent::Closed => {
                self.channel_tasks.remove(&connection_id);
                let Some(swarm) = self.swarms.get_mut(&stream) else {
                    return;
                };
                let mut ctx = PeerContext {
                    requests: &mut self.requests,
                    bandwidth: &mut self.bandwidth,
                    now,
                };
                let Some(reactions) = swarm.on_closed(&remote, connection_id, &mut ctx) else {
                    return;
                };
                self.apply_peer_reactions(stream, &remote, reactions);
                self.events.emit(CoreEvent::PeerClose {
                    peer: remote,
                    stream,
                });
                self.schedule_pass(false);
            }
            ChannelEvent::Error(reason) => {
                tracing::warn!(peer = %remote, %reason, "Data channel error");
                self.events.emit(CoreEvent::PeerError {
                    peer: remote,
                    stream,
                    reason,
                });
            }
        }
    }

    fn apply_peer_reactions(&mut self, stream: StreamId, peer: &PeerId, reactions: Vec<PeerReaction>) {
        for reaction in reactions {
            match reaction {
                PeerReaction::SegmentRequested {
                    external_id,
                    request_id,
                    byte_from,
                } => self.serve_segment_request(stream, peer, external_id, request_id, byte_from),
                PeerReaction::AnnouncementChanged => self.schedule_pass(false),
                PeerReaction::DownloadFinished { key } => {
                    self.finish_download(&key, DownloadSource::P2p);
                }
                PeerReaction::DownloadFailed { key, error } => {
                    self.events.emit(CoreEvent::SegmentError {
                        key,
                        error,
                        source: DownloadSource::P2p,
                        peer: Some(peer.clone()),
                    });
                    self.schedule_pass(false);
                }
                PeerReaction::ChunkDownloaded { bytes } => {
                    self.traffic.p2p_bytes += bytes;
                    self.record_peer_progress(stream, peer);
                    self.events.emit(CoreEvent::ChunkDownloaded {
                        bytes,
                        source: DownloadSource::P2p,
                        peer: Some(peer.clone()),
                    });
                }
                PeerReaction::ChunkUploaded { bytes } => {
                    self.traffic.uploaded_bytes += bytes;
                    self.events.emit(CoreEvent::ChunkUploaded {
                        bytes,
                        peer: peer.clone(),
                    });
                }
                PeerReaction::ProtocolViolation { reason } => {
                    self.events.emit(CoreEvent::PeerError {
                        peer: peer.clone(),
                        stream,
                        reason,
                    });
                }
                PeerReaction::Destroy => self.destroy_peer(stream, peer),
            }
        }
    }

    fn serve_segment_request(
        &mut self,
        stream: StreamId,
        peer_id: &PeerId,
        external_id: i64,
        request_id: i64,
        byte_from: Option<i64>,
    ) {
        let now = Instant::now();
        let key = self
            .streams
            .get(&stream)
            .and_then(|stream| stream.segment_by_external_id(external_id))
            .map(|segment| segment.key());
        let data = key.and_then(|key| self.cache.get(&key, now));

        let Some(peer) = self
            .swarms
            .get_mut(&stream)
            .and_then(|swarm| swarm.peer_by_id_mut(peer_id))
        else {
            return;
        };
        let result = match data {
            Some(data) => peer.upload_segment(external_id, request_id, data, byte_from),
            None => peer
                .send_segment_absent(external_id, request_id)
                .map(|()| Vec::new()),
        };
        match result {
            Ok(reactions) => self.apply_peer_reactions(stream, peer_id, reactions),
            Err(error) => {
                tracing::warn!(peer = %peer_id, segment = external_id, %error, "Failed to answer segment request");
            }
        }
    }

    fn record_peer_progress(&mut self, stream: StreamId, peer_id: &PeerId) {
        let key = self.swarms.get(&stream).and_then(|swarm| {
            swarm
                .peers()
                .find(|peer| peer.id() == peer_id)
                .and_then(|peer| peer.downloading_key().cloned())
        });
        let Some(request) = key.and_then(|key| self.requests.get(&key)) else {
            return;
        };
        if let (Some(attempt_id), Some(progress)) = (request.attempt_id(), request.progress()) {
            self.approximator.record(attempt_id, progress);
        }
    }

    fn destroy_peer(&mut self, stream: StreamId, peer_id: &PeerId) {
        let Some(swarm) = self.swarms.get_mut(&stream) else {
            return;
        };
        let mut ctx = PeerContext {
            requests: &mut self.requests,
            bandwidth: &mut self.bandwidth,
            now: Instant::now(),
        };
        let Some(reactions) = swarm.remove_peer(peer_id, &mut ctx) else {
            return;
        };
        self.apply_peer_reactions(stream, peer_id, reactions);
        self.events.emit(CoreEvent::PeerClose {
            peer: peer_id.clone(),
            stream,
        });
        self.schedule_pass(false);
    }
}

/// Forwards one data channel's events into the loader until it closes.
async fn forward_channel_events(
    stream: StreamId,
    remote: PeerId,
    connection_id: u64,
    mut events: mpsc::UnboundedReceiver<ChannelEvent>,
    sender: mpsc::UnboundedSender<LoaderEvent>,
) {
    while let Some(event) = events.recv().await {
        let closed = event == ChannelEvent::Closed;
        let forwarded = sender.send(LoaderEvent::Channel {
            stream,
            remote: remote.clone(),
            connection_id,
            event,
        });
        if forwarded.is_err() || closed {
            break;
        }
    }
}
