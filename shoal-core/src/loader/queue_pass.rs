//! Scheduling pass: which segment loads next, from where, and what gets
//! preempted.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use rand::Rng;
use rand::seq::IndexedRandom;

use super::core::HybridLoader;
use super::LoaderError;
use crate::events::CoreEvent;
use crate::peer::{PeerContext, PeerId, Swarm};
use crate::request::{DownloadSource, Request};
use crate::scheduler::{PlaybackStatuses, QueueItem, generate_queue};
use crate::stream::{Playback, Segment, StreamId, StreamType};

/// Upper bound of the random HTTP probability per tick.
const MAX_RANDOM_HTTP_PROBABILITY: f64 = 0.5;

impl HybridLoader {
    /// Runs one pass over every stream the player requested from, then
    /// broadcasts changed announcements.
    pub(super) fn process_queue(&mut self) {
        self.last_pass_at = Some(tokio::time::Instant::now());
        self.pass_deadline = None;
        let playback = *self.playback.read();
        self.pass_playback = playback;

        for stream in self.requested_streams() {
            let items = self.build_queue(stream, &playback);
            self.sweep_requests(stream, &items);
            self.walk_queue(&items);
        }
        self.broadcast_announcements();
    }

    /// Occasionally loads a queued segment no peer has over HTTP, so the
    /// swarm keeps receiving fresh data.
    pub(super) fn on_random_http_tick(&mut self) {
        if !self.config.p2p.enabled {
            return;
        }
        let playback = *self.playback.read();

        for stream in self.requested_streams() {
            if !self.has_free_slot(DownloadSource::Http) {
                break;
            }
            let connected = self.swarms.get(&stream).map_or(0, Swarm::connected_count);
            if connected == 0 {
                continue;
            }

            let items = self.build_queue(stream, &playback);
            let Some(swarm) = self.swarms.get(&stream) else {
                continue;
            };
            let candidates: Vec<Arc<Segment>> = items
                .iter()
                .filter(|item| {
                    let key = item.segment.key();
                    item.statuses.is_http_downloadable
                        && !self.requests.is_loading(&key)
                        && self.requests.get(&key).is_none_or(|request| self.http_allowed(request))
                        && !swarm.is_segment_loading_or_loaded_by_someone(item.segment.external_id)
                })
                .map(|item| Arc::clone(&item.segment))
                .collect();
            if candidates.is_empty() {
                continue;
            }

            let probability =
                (items.len() as f64 / (connected + 1) as f64).min(MAX_RANDOM_HTTP_PROBABILITY);
            if !self.rng.random_bool(probability) {
                continue;
            }
            if let Some(segment) = candidates.choose(&mut self.rng).cloned() {
                tracing::debug!(segment = %segment.key(), "Random HTTP download");
                self.start_http(&segment);
            }
        }
        self.broadcast_announcements();
    }

    /// Streams with a last requested segment, main renditions first.
    fn requested_streams(&self) -> Vec<StreamId> {
        let mut streams: Vec<StreamId> = self.last_requested.keys().copied().collect();
        streams.sort_by_key(|id| (id.stream_type == StreamType::Secondary, id.index));
        streams
    }

    /// Queue of a stream, led by player-requested segments the windows
    /// do not cover.
    fn build_queue(&self, stream: StreamId, playback: &Playback) -> Vec<QueueItem> {
        let (Some(segments), Some(last_requested)) =
            (self.streams.get(&stream), self.last_requested.get(&stream))
        else {
            return Vec::new();
        };
        let queue = generate_queue(segments, last_requested, playback, &self.config.windows, |segment| {
            self.cache.has(&segment.key())
        });

        let mut items: Vec<QueueItem> = self
            .requests
            .iter()
            .filter(|(key, request)| {
                key.stream == stream && request.has_caller() && !queue.contains(&key.local_id)
            })
            .map(|(_, request)| QueueItem {
                segment: Arc::clone(request.segment()),
                statuses: PlaybackStatuses {
                    is_high_demand: true,
                    is_http_downloadable: true,
                    is_p2p_downloadable: true,
                },
            })
            .collect();
        items.sort_by(|a, b| a.segment.start_time.total_cmp(&b.segment.start_time));
        items.extend(queue.items);
        items
    }

    /// Drops requests that left the queue and fails callers whose
    /// segment no source can deliver.
    fn sweep_requests(&mut self, stream: StreamId, items: &[QueueItem]) {
        let queued: HashSet<&str> = items
            .iter()
            .map(|item| item.segment.local_id.as_str())
            .collect();

        for key in self.requests.keys() {
            if key.stream != stream {
                continue;
            }
            let Some(request) = self.requests.get(&key) else {
                continue;
            };

            if request.has_caller() {
                if request.is_loading() || !self.is_exhausted(request) {
                    continue;
                }
                let reason = request
                    .failed_attempts()
                    .last()
                    .map_or_else(|| "no source available".to_string(), |attempt| attempt.error.to_string());
                tracing::warn!(segment = %key, %reason, "Segment failed on every source");
                // Kept with its failed attempts until the next load_segment
                if let Some(request) = self.requests.get_mut(&key) {
                    request.resolve_error(LoaderError::Failed {
                        key: key.clone(),
                        reason,
                    });
                }
                continue;
            }

            if queued.contains(key.local_id.as_str()) {
                continue;
            }
            if request.is_loading() {
                tracing::debug!(segment = %key, "Segment left the queue");
                self.abort_attempt(&key);
            }
            self.requests.remove(&key);
        }
    }

    /// Starts transfers in queue order within the concurrency caps.
    ///
    /// A high-demand item loading over P2P is moved to HTTP, resuming
    /// after the bytes the peer already sent.
    fn walk_queue(&mut self, items: &[QueueItem]) {
        for (index, item) in items.iter().enumerate() {
            let key = item.segment.key();
            let p2p_enabled =
                self.config.p2p.enabled && self.swarms.contains_key(&item.segment.stream);
            let request = self.requests.get(&key);
            let loading_source = request
                .filter(|request| request.is_loading())
                .and_then(Request::current_source);
            let http_allowed = request.is_none_or(|request| self.http_allowed(request));
            let p2p_allowed = request.is_none_or(|request| self.p2p_budget_left(request))
                && self.p2p_available(&item.segment);
            let last_failed_source = request
                .and_then(|request| request.failed_attempts().last())
                .map(|attempt| attempt.source);
            let PlaybackStatuses {
                is_high_demand,
                is_http_downloadable,
                is_p2p_downloadable,
            } = item.statuses;

            if is_high_demand {
                if loading_source == Some(DownloadSource::Http) {
                    continue;
                }
                if http_allowed && self.claim_slot(items, index, DownloadSource::Http) {
                    if loading_source == Some(DownloadSource::P2p) {
                        tracing::debug!(segment = %key, "High-demand segment moved to HTTP");
                        self.abort_attempt(&key);
                    }
                    if self.start_http(&item.segment) {
                        continue;
                    }
                    break;
                }
                if loading_source.is_some() {
                    continue;
                }
                let peer = if p2p_allowed {
                    self.pick_peer(&item.segment)
                } else {
                    None
                };
                if let Some(peer) = peer {
                    if self.claim_slot(items, index, DownloadSource::P2p) {
                        if self.start_p2p(&item.segment, &peer) {
                            continue;
                        }
                        break;
                    }
                }
                if !http_allowed && !p2p_allowed {
                    continue;
                }
                break;
            }

            if loading_source.is_some() {
                continue;
            }

            let http_first = last_failed_source == Some(DownloadSource::P2p) || !p2p_enabled;
            if is_http_downloadable
                && http_first
                && http_allowed
                && self.has_free_slot(DownloadSource::Http)
            {
                if self.start_http(&item.segment) {
                    continue;
                }
                break;
            }

            if is_p2p_downloadable && p2p_enabled {
                if !p2p_allowed {
                    continue;
                }
                // Every peer holding the segment is busy
                let Some(peer) = self.pick_peer(&item.segment) else {
                    continue;
                };
                if self.claim_slot(items, index, DownloadSource::P2p)
                    && self.start_p2p(&item.segment, &peer)
                {
                    continue;
                }
                break;
            }

            if is_http_downloadable {
                continue;
            }
            break;
        }
    }

    /// True when a slot of `source` is free or one was freed by aborting
    /// the most distant later transfer of that source.
    fn claim_slot(&mut self, items: &[QueueItem], index: usize, source: DownloadSource) -> bool {
        if self.has_free_slot(source) {
            return true;
        }
        let victim = items[index + 1..].iter().rev().find_map(|item| {
            let key = item.segment.key();
            self.requests
                .get(&key)
                .filter(|request| {
                    request.is_loading()
                        && request.current_source() == Some(source)
                        && !request.has_caller()
                })
                .map(|_| key)
        });
        let Some(victim) = victim else {
            return false;
        };
        tracing::debug!(segment = %victim, %source, "Preempting distant transfer");
        self.abort_attempt(&victim);
        true
    }

    pub(super) fn has_free_slot(&self, source: DownloadSource) -> bool {
        match source {
            DownloadSource::Http => {
                self.requests.executing_http_count()
                    < self.config.concurrency.simultaneous_http_downloads
            }
            DownloadSource::P2p => {
                self.requests.executing_p2p_count()
                    < self.config.concurrency.simultaneous_p2p_downloads
            }
        }
    }

    /// Idle connected peer that announced the segment as loaded.
    fn pick_peer(&mut self, segment: &Segment) -> Option<PeerId> {
        let swarm = self.swarms.get(&segment.stream)?;
        swarm.peer_for_download(segment.external_id, &mut self.rng)
    }

    fn start_p2p(&mut self, segment: &Arc<Segment>, peer_id: &PeerId) -> bool {
        let key = segment.key();
        let Some(peer) = self
            .swarms
            .get_mut(&segment.stream)
            .and_then(|swarm| swarm.peer_by_id_mut(peer_id))
        else {
            return false;
        };
        let mut ctx = PeerContext {
            requests: &mut self.requests,
            bandwidth: &mut self.bandwidth,
            now: Instant::now(),
        };
        match peer.download_segment(segment, &mut ctx, &mut self.rng) {
            Ok(_) => {
                self.events.emit(CoreEvent::SegmentStart {
                    key,
                    source: DownloadSource::P2p,
                    peer: Some(peer_id.clone()),
                });
                true
            }
            Err(error) => {
                tracing::warn!(segment = %key, peer = %peer_id, %error, "Could not start P2P download");
                false
            }
        }
    }

    fn http_allowed(&self, request: &Request) -> bool {
        request.failed_attempts().http_count() < self.config.retries.http_error_retries
    }

    fn p2p_budget_left(&self, request: &Request) -> bool {
        request.failed_attempts().p2p_count() < self.config.retries.p2p_error_retries
    }

    /// Some connected peer announced the segment as loaded.
    fn p2p_available(&self, segment: &Segment) -> bool {
        self.config.p2p.enabled
            && self
                .swarms
                .get(&segment.stream)
                .is_some_and(|swarm| swarm.is_segment_loaded_by_someone(segment.external_id))
    }

    fn is_exhausted(&self, request: &Request) -> bool {
        let p2p_exhausted = !self.p2p_budget_left(request) || !self.p2p_available(request.segment());
        !self.http_allowed(request) && p2p_exhausted
    }

    fn broadcast_announcements(&mut self) {
        let dirty: Vec<StreamId> = self.dirty_announcements.drain().collect();
        for stream in dirty {
            let (loaded, http_loading) = self.announcement_for(stream);
            let Some(swarm) = self.swarms.get(&stream) else {
                continue;
            };
            for peer in swarm.peers() {
                if let Err(error) = peer.send_announcement(loaded.clone(), http_loading.clone()) {
                    tracing::debug!(peer = %peer.id(), %error, "Failed to send announcement");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;
    use url::Url;

    use super::*;
    use crate::config::ShoalConfig;
    use crate::events::EventBus;
    use crate::loader::Collaborators;
    use crate::peer::PeerSettings;
    use crate::protocol::{PeerCommand, frame_command};
    use crate::transport::memory::{MemoryChannel, MemoryHttpTransport};

    fn p2p_item(index: i64) -> QueueItem {
        let url = Url::parse(&format!("https://cdn.example/seg{index}.ts")).unwrap();
        let start = index as f64 * 4.0;
        QueueItem {
            segment: Arc::new(Segment::new(format!("seg{index}"), index, url, start, start + 4.0)),
            statuses: PlaybackStatuses {
                is_high_demand: false,
                is_http_downloadable: false,
                is_p2p_downloadable: true,
            },
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_peer_does_not_preempt_later_p2p_transfer() {
        let mut config = ShoalConfig::for_testing();
        config.concurrency.simultaneous_p2p_downloads = 1;
        let (sender, _events) = mpsc::unbounded_channel();
        let mut loader = HybridLoader::new(
            config.clone(),
            Collaborators::new(Arc::new(MemoryHttpTransport::new())),
            EventBus::new(),
            sender,
        );

        let stream = StreamId::main(0);
        let mut swarm = Swarm::new(
            stream,
            "key".to_string(),
            loader.local_id().clone(),
            PeerSettings::from_config(&config),
            Arc::new(|_: PeerId, _: u64, _: u64| {}),
        );
        let remote = PeerId::from("-SH0001-remotexxxxxx");
        let ((channel, _rx), (_remote_end, _remote_rx)) = MemoryChannel::pair(0);
        let connection_id = swarm.add_candidate(remote.clone(), channel).unwrap();
        let peer = swarm.on_connected(&remote, connection_id).unwrap();
        let announcement = PeerCommand::SegmentsAnnouncement {
            loaded: vec![0, 1],
            http_loading: vec![],
        }
        .encode()
        .unwrap();
        let mut ctx = PeerContext {
            requests: &mut loader.requests,
            bandwidth: &mut loader.bandwidth,
            now: Instant::now(),
        };
        for chunk in frame_command(&announcement, 1024).unwrap() {
            peer.handle_data(chunk, &mut ctx);
        }
        loader.swarms.insert(stream, swarm);

        // The only peer is busy with the later segment and the cap is full
        let items = vec![p2p_item(0), p2p_item(1)];
        assert!(loader.start_p2p(&items[1].segment, &remote));

        loader.walk_queue(&items);

        assert!(
            loader
                .requests
                .get(&items[1].segment.key())
                .is_some_and(Request::is_loading)
        );
        assert!(loader.requests.get(&items[0].segment.key()).is_none());
        assert_eq!(loader.requests.executing_p2p_count(), 1);
    }
}
