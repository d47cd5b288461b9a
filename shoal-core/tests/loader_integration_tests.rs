//! Integration tests for the hybrid loader.
//!
//! These tests drive the public LoaderHandle API against in-memory HTTP and
//! rendezvous transports, covering scheduling caps, preemption, pass
//! debounce, caching and eviction, caller release, failure exhaustion and
//! peer-to-peer delivery.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use shoal_core::config::ShoalConfig;
use shoal_core::loader::{Collaborators, LoaderHandle, spawn_hybrid_loader};
use shoal_core::request::DownloadSource;
use shoal_core::tracing_setup::init_test_tracing;
use shoal_core::transport::memory::{MemoryHttpTransport, MemoryRendezvous, MemoryResource};
use shoal_core::{
    CoreEvent, EventKind, LoaderError, LoaderStats, RequestError, Segment, SegmentKey, Stream,
    StreamId,
};
use tokio::time::{sleep, timeout};
use tokio_test::{assert_err, assert_ok};
use url::Url;

const SEGMENT_DURATION: f64 = 4.0;

/// Test fixture wiring one loader to an in-memory origin.
struct LoaderTestFixture {
    handle: LoaderHandle,
    http: MemoryHttpTransport,
    stream: StreamId,
}

impl LoaderTestFixture {
    fn new(config: ShoalConfig) -> Self {
        let http = MemoryHttpTransport::new();
        let collaborators = Collaborators::new(Arc::new(http.clone()));
        Self::with_collaborators(config, http, collaborators)
    }

    /// Loader joining the shared test swarm through `rendezvous`.
    fn in_swarm(config: ShoalConfig, rendezvous: &MemoryRendezvous) -> Self {
        let http = MemoryHttpTransport::new();
        let collaborators = Collaborators::new(Arc::new(http.clone()))
            .with_rendezvous(Arc::new(rendezvous.clone()));
        Self::with_collaborators(config, http, collaborators)
    }

    fn with_collaborators(
        config: ShoalConfig,
        http: MemoryHttpTransport,
        collaborators: Collaborators,
    ) -> Self {
        init_test_tracing();
        let handle = spawn_hybrid_loader(config, collaborators).unwrap();
        Self {
            handle,
            http,
            stream: StreamId::main(0),
        }
    }

    /// Registers `count` segments and serves each from the origin.
    async fn add_stream(&self, count: usize) {
        let mut stream = Stream::new(self.stream);
        stream.append_segments((0..count).map(|index| {
            self.http
                .insert(segment_url(index), MemoryResource::new(segment_bytes(index)));
            segment(index)
        }));
        self.handle.add_stream(stream).await.unwrap();
    }

    fn key(&self, index: usize) -> SegmentKey {
        SegmentKey::new(self.stream, format!("s{index}"))
    }

    /// Waits until the origin saw `count` requests for a segment.
    async fn wait_for_requests(&self, index: usize, count: usize) {
        let url = segment_url(index);
        timeout(Duration::from_secs(5), async {
            while self.http.request_count(&url) < count {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("origin never received the request");
    }

    async fn stats(&self) -> LoaderStats {
        self.handle.stats().await.unwrap()
    }

    /// Polls stats until `check` holds.
    async fn wait_for_stats(&self, what: &str, check: impl Fn(&LoaderStats) -> bool) {
        timeout(Duration::from_secs(5), async {
            while !check(&self.stats().await) {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
    }

    /// Collects every emitted event of `kind`.
    fn record(&self, kind: EventKind) -> EventLog {
        let log = EventLog::default();
        let sink = log.clone();
        self.handle
            .subscribe(kind, move |event| sink.0.lock().push(event.clone()));
        log
    }
}

#[derive(Clone, Default)]
struct EventLog(Arc<Mutex<Vec<CoreEvent>>>);

impl EventLog {
    async fn wait_for(&self, what: &str, matches: impl Fn(&CoreEvent) -> bool) {
        timeout(Duration::from_secs(5), async {
            while !self.0.lock().iter().any(&matches) {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("never observed {what}"));
    }
}

fn segment_url(index: usize) -> Url {
    Url::parse(&format!("https://cdn.example/video/s{index}.ts")).unwrap()
}

fn segment_bytes(index: usize) -> Bytes {
    Bytes::from(vec![index as u8; 1000 + index * 10])
}

fn segment(index: usize) -> Segment {
    let start = index as f64 * SEGMENT_DURATION;
    Segment::new(
        format!("s{index}"),
        index as i64,
        segment_url(index),
        start,
        start + SEGMENT_DURATION,
    )
}

fn http_only_config() -> ShoalConfig {
    let mut config = ShoalConfig::for_testing();
    config.p2p.enabled = false;
    config
}

fn swarm_config(seed: u64) -> ShoalConfig {
    let mut config = ShoalConfig::for_testing();
    config.random_seed = Some(seed);
    config.p2p.swarm_id = Some("live-show".to_string());
    config
}

/// Windows of `high`, `http` and `p2p` segments from the position.
fn windows(config: &mut ShoalConfig, high: f64, http: f64, p2p: f64) {
    config.windows.high_demand = high * SEGMENT_DURATION;
    config.windows.http_download = http * SEGMENT_DURATION;
    config.windows.p2p_download = p2p * SEGMENT_DURATION;
}

/// Swarm member caching only `s1` of a two-segment stream.
async fn seeder_of_s1(rendezvous: &MemoryRendezvous) -> LoaderTestFixture {
    let seeder = LoaderTestFixture::in_swarm(swarm_config(1), rendezvous);
    seeder.add_stream(2).await;
    seeder.handle.load_segment(seeder.key(1)).await.unwrap();
    seeder
}

/// Waits until both loaders see each other, then lets announcements land.
async fn connect(first: &LoaderTestFixture, second: &LoaderTestFixture) {
    first
        .wait_for_stats("peer connection", |stats| stats.connected_peers >= 1)
        .await;
    second
        .wait_for_stats("peer connection", |stats| stats.connected_peers >= 1)
        .await;
    sleep(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn test_load_segment_over_http() {
    let fixture = LoaderTestFixture::new(http_only_config());
    fixture.add_stream(3).await;

    let response = timeout(Duration::from_secs(5), fixture.handle.load_segment(fixture.key(0)))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(response.data, segment_bytes(0));
    assert!(response.bandwidth_bps >= 0.0);
    let stats = fixture.handle.stats().await.unwrap();
    assert!(stats.http_bytes >= segment_bytes(0).len() as u64);
    assert!(stats.cached_segments >= 1);
}

#[tokio::test]
async fn test_second_load_served_from_cache() {
    let fixture = LoaderTestFixture::new(http_only_config());
    fixture.add_stream(1).await;

    let first = assert_ok!(fixture.handle.load_segment(fixture.key(0)).await);
    let second = assert_ok!(fixture.handle.load_segment(fixture.key(0)).await);

    assert_eq!(first.data, second.data);
    assert_eq!(fixture.http.request_count(&segment_url(0)), 1);
}

#[tokio::test]
async fn test_http_cap_limits_parallel_downloads() {
    let mut config = http_only_config();
    config.concurrency.simultaneous_http_downloads = 1;
    let fixture = LoaderTestFixture::new(config);
    fixture.http.gate(segment_url(0));
    fixture.add_stream(3).await;

    let handle = fixture.handle.clone();
    let key = fixture.key(0);
    let pending = tokio::spawn(async move { handle.load_segment(key).await });
    fixture.wait_for_requests(0, 1).await;

    let stats = fixture.handle.stats().await.unwrap();
    assert_eq!(stats.http_loading, 1);
    assert_eq!(fixture.http.request_count(&segment_url(1)), 0);

    fixture.http.release(&segment_url(0));
    let response = timeout(Duration::from_secs(5), pending)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(response.data, segment_bytes(0));

    // The freed slot moves on to the next queued segment
    fixture.wait_for_requests(1, 1).await;
}

#[tokio::test]
async fn test_missing_resource_fails_after_retries() {
    let fixture = LoaderTestFixture::new(http_only_config());
    let mut stream = Stream::new(fixture.stream);
    stream.append_segments([segment(0)]);
    fixture.handle.add_stream(stream).await.unwrap();

    let result = timeout(Duration::from_secs(5), fixture.handle.load_segment(fixture.key(0)))
        .await
        .unwrap();

    assert!(matches!(result, Err(LoaderError::Failed { .. })));
    assert_eq!(fixture.http.request_count(&segment_url(0)), 3);
}

#[tokio::test]
async fn test_rejecting_validator_fails_segment() {
    let http = MemoryHttpTransport::new();
    let validated = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&validated);
    let collaborators = Collaborators::new(Arc::new(http.clone())).with_validator(Arc::new(
        move |_: &Segment, _: &Bytes, source: DownloadSource| {
            assert_eq!(source, DownloadSource::Http);
            counter.fetch_add(1, Ordering::SeqCst);
            false
        },
    ));
    let fixture = LoaderTestFixture::with_collaborators(http_only_config(), http, collaborators);
    fixture.add_stream(1).await;

    let result = timeout(Duration::from_secs(5), fixture.handle.load_segment(fixture.key(0)))
        .await
        .unwrap();

    assert!(matches!(result, Err(LoaderError::Failed { .. })));
    assert_eq!(validated.load(Ordering::SeqCst), 3);
    assert_eq!(fixture.handle.stats().await.unwrap().cached_segments, 0);
}

#[tokio::test]
async fn test_abort_releases_waiting_caller() {
    let fixture = LoaderTestFixture::new(http_only_config());
    fixture.http.gate(segment_url(0));
    fixture.add_stream(1).await;

    let handle = fixture.handle.clone();
    let key = fixture.key(0);
    let pending = tokio::spawn(async move { handle.load_segment(key).await });
    fixture.wait_for_requests(0, 1).await;

    fixture
        .handle
        .abort_segment_loading(fixture.key(0))
        .await
        .unwrap();

    let result = timeout(Duration::from_secs(5), pending).await.unwrap().unwrap();
    assert_eq!(result.unwrap_err(), LoaderError::Aborted);
}

#[tokio::test]
async fn test_repeated_load_replaces_previous_caller() {
    let fixture = LoaderTestFixture::new(http_only_config());
    fixture.http.gate(segment_url(0));
    fixture.add_stream(1).await;

    let handle = fixture.handle.clone();
    let key = fixture.key(0);
    let first = tokio::spawn(async move { handle.load_segment(key).await });
    fixture.wait_for_requests(0, 1).await;

    let handle = fixture.handle.clone();
    let key = fixture.key(0);
    let second = tokio::spawn(async move { handle.load_segment(key).await });

    let first = timeout(Duration::from_secs(5), first).await.unwrap().unwrap();
    assert_eq!(first.unwrap_err(), LoaderError::Aborted);

    fixture.http.release(&segment_url(0));
    let second = timeout(Duration::from_secs(5), second)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(second.data, segment_bytes(0));
    assert_eq!(fixture.http.request_count(&segment_url(0)), 1);
}

#[tokio::test]
async fn test_unknown_keys_rejected() {
    let fixture = LoaderTestFixture::new(http_only_config());
    fixture.add_stream(1).await;

    let unknown_stream = SegmentKey::new(StreamId::main(7), "s0");
    assert_eq!(
        fixture.handle.load_segment(unknown_stream).await.unwrap_err(),
        LoaderError::UnknownStream {
            stream: StreamId::main(7)
        }
    );

    let unknown_segment = fixture.key(42);
    assert_eq!(
        fixture.handle.load_segment(unknown_segment.clone()).await.unwrap_err(),
        LoaderError::UnknownSegment {
            key: unknown_segment
        }
    );

    let result = fixture
        .handle
        .update_stream(StreamId::main(7), Vec::new(), Vec::new())
        .await;
    assert!(matches!(result, Err(LoaderError::UnknownStream { .. })));
}

#[tokio::test]
async fn test_removed_segment_aborts_caller() {
    let fixture = LoaderTestFixture::new(http_only_config());
    fixture.http.gate(segment_url(0));
    fixture.add_stream(2).await;

    let handle = fixture.handle.clone();
    let key = fixture.key(0);
    let pending = tokio::spawn(async move { handle.load_segment(key).await });
    fixture.wait_for_requests(0, 1).await;

    fixture
        .handle
        .update_stream(fixture.stream, Vec::new(), vec!["s0".to_string()])
        .await
        .unwrap();

    let result = timeout(Duration::from_secs(5), pending).await.unwrap().unwrap();
    assert_eq!(result.unwrap_err(), LoaderError::Aborted);
    assert!(matches!(
        fixture.handle.load_segment(fixture.key(0)).await,
        Err(LoaderError::UnknownSegment { .. })
    ));
}

#[tokio::test]
async fn test_shutdown_resolves_pending_callers() {
    let fixture = LoaderTestFixture::new(http_only_config());
    fixture.http.gate(segment_url(0));
    fixture.add_stream(1).await;

    let handle = fixture.handle.clone();
    let key = fixture.key(0);
    let pending = tokio::spawn(async move { handle.load_segment(key).await });
    fixture.wait_for_requests(0, 1).await;

    assert_ok!(fixture.handle.shutdown().await);

    let result = timeout(Duration::from_secs(5), pending).await.unwrap().unwrap();
    assert_eq!(assert_err!(result), LoaderError::Shutdown);
    assert_eq!(
        fixture.handle.stats().await.unwrap_err(),
        LoaderError::Shutdown
    );
    assert!(!fixture.handle.is_running());
}

#[tokio::test]
async fn test_events_reach_subscribers_until_unsubscribed() {
    let fixture = LoaderTestFixture::new(http_only_config());
    let loaded = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&loaded);
    let subscription = fixture.handle.subscribe(EventKind::SegmentLoaded, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    fixture.add_stream(1).await;

    fixture.handle.load_segment(fixture.key(0)).await.unwrap();
    assert_eq!(loaded.load(Ordering::SeqCst), 1);

    assert!(fixture.handle.unsubscribe(subscription));
    assert!(!fixture.handle.unsubscribe(subscription));
}

#[tokio::test]
async fn test_invalid_config_rejected_at_spawn() {
    let mut config = ShoalConfig::for_testing();
    config.concurrency.simultaneous_http_downloads = 0;

    let result = spawn_hybrid_loader(config, Collaborators::new(Arc::new(MemoryHttpTransport::new())));

    assert!(result.is_err_and(|error| error.is_user_error()));
}

#[tokio::test]
async fn test_segment_delivered_by_peer() {
    let rendezvous = MemoryRendezvous::new();
    let seeder = seeder_of_s1(&rendezvous).await;

    // The leecher has no origin copy and no high-demand window, so the
    // segment can only come from the seeder
    let mut config = swarm_config(2);
    config.windows.high_demand = 0.0;
    let leecher = LoaderTestFixture::in_swarm(config, &rendezvous);
    let mut stream = Stream::new(leecher.stream);
    stream.append_segments([segment(0), segment(1)]);
    leecher.handle.add_stream(stream).await.unwrap();
    connect(&seeder, &leecher).await;

    let response = timeout(Duration::from_secs(5), leecher.handle.load_segment(leecher.key(1)))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(response.data, segment_bytes(1));
    assert_eq!(leecher.stats().await.p2p_bytes, segment_bytes(1).len() as u64);
    assert_eq!(seeder.stats().await.uploaded_bytes, segment_bytes(1).len() as u64);
}

#[tokio::test]
async fn test_high_demand_segment_moves_from_stalled_peer_to_http() {
    let rendezvous = MemoryRendezvous::new();
    let seeder = seeder_of_s1(&rendezvous).await;

    // s1 starts out P2P-only and the peer timer outlasts the test
    let mut config = swarm_config(2);
    windows(&mut config, 1.0, 1.0, 15.0);
    config.timeouts.p2p_not_receiving_bytes = Duration::from_secs(30);
    let leecher = LoaderTestFixture::in_swarm(config, &rendezvous);
    leecher.add_stream(2).await;
    connect(&seeder, &leecher).await;

    rendezvous.set_holding(true);
    leecher.handle.load_segment(leecher.key(0)).await.unwrap();
    leecher
        .wait_for_stats("P2P download of s1", |stats| stats.p2p_loading == 1)
        .await;
    assert_eq!(leecher.http.request_count(&segment_url(1)), 0);

    leecher
        .handle
        .update_playback(SEGMENT_DURATION, 1.0)
        .await
        .unwrap();
    leecher.wait_for_requests(1, 1).await;

    let response = timeout(Duration::from_secs(2), leecher.handle.load_segment(leecher.key(1)))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response.data, segment_bytes(1));
    let stats = leecher.stats().await;
    assert_eq!(stats.p2p_loading, 0);
    assert_eq!(stats.p2p_bytes, 0);
    assert_eq!(stats.connected_peers, 1);
}

#[tokio::test]
async fn test_distant_transfer_preempted_for_high_demand_segment() {
    let mut config = http_only_config();
    config.concurrency.simultaneous_http_downloads = 1;
    windows(&mut config, 1.0, 4.0, 4.0);
    let fixture = LoaderTestFixture::new(config);
    for index in 3..6 {
        fixture.http.gate(segment_url(index));
    }
    fixture.add_stream(6).await;
    let aborts = fixture.record(EventKind::SegmentAbort);

    fixture
        .handle
        .update_playback(2.0 * SEGMENT_DURATION, 1.0)
        .await
        .unwrap();
    fixture.handle.load_segment(fixture.key(2)).await.unwrap();
    // The only slot goes to the prefetch of s3, which never answers
    fixture.wait_for_requests(3, 1).await;

    fixture.handle.update_playback(0.0, 1.0).await.unwrap();
    let response = timeout(Duration::from_secs(5), fixture.handle.load_segment(fixture.key(0)))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(response.data, segment_bytes(0));
    let distant = fixture.key(3);
    aborts
        .wait_for("abort of s3", move |event| {
            matches!(event, CoreEvent::SegmentAbort { key, source: Some(DownloadSource::Http), .. } if *key == distant)
        })
        .await;
}

#[tokio::test]
async fn test_non_forced_pass_waits_for_min_interval() {
    let mut config = http_only_config();
    config.concurrency.simultaneous_http_downloads = 1;
    config.timeouts.queue_min_interval = Duration::from_secs(2);
    let fixture = LoaderTestFixture::new(config);
    fixture.add_stream(3).await;

    fixture.handle.load_segment(fixture.key(0)).await.unwrap();
    // The pass requested by the completion is held back
    sleep(Duration::from_millis(200)).await;
    assert_eq!(fixture.http.request_count(&segment_url(1)), 0);

    // A player request forces a pass at once
    let response = timeout(Duration::from_secs(1), fixture.handle.load_segment(fixture.key(1)))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response.data, segment_bytes(1));
}

#[tokio::test]
async fn test_random_http_idle_without_peers() {
    let mut config = swarm_config(3);
    windows(&mut config, 1.0, 10.0, 10.0);
    let fixture = LoaderTestFixture::in_swarm(config, &MemoryRendezvous::new());
    fixture.add_stream(4).await;

    fixture.handle.load_segment(fixture.key(0)).await.unwrap();
    sleep(Duration::from_millis(500)).await;

    for index in 1..4 {
        assert_eq!(fixture.http.request_count(&segment_url(index)), 0);
    }
}

#[tokio::test]
async fn test_random_http_fetches_segments_no_peer_has() {
    let rendezvous = MemoryRendezvous::new();
    let seeder = seeder_of_s1(&rendezvous).await;

    let mut config = swarm_config(3);
    windows(&mut config, 1.0, 10.0, 10.0);
    let leecher = LoaderTestFixture::in_swarm(config, &rendezvous);
    leecher.add_stream(4).await;
    connect(&seeder, &leecher).await;

    leecher.handle.load_segment(leecher.key(0)).await.unwrap();
    // Only the random pick loads these over HTTP while a peer is connected
    leecher.wait_for_requests(2, 1).await;
    leecher.wait_for_requests(3, 1).await;

    let response = leecher.handle.load_segment(leecher.key(1)).await.unwrap();
    assert_eq!(response.data, segment_bytes(1));
    assert_eq!(leecher.http.request_count(&segment_url(1)), 0);
    assert_eq!(leecher.stats().await.p2p_bytes, segment_bytes(1).len() as u64);
}

#[tokio::test]
async fn test_stalled_peer_torn_down_after_timeout() {
    let rendezvous = MemoryRendezvous::new();
    let seeder = seeder_of_s1(&rendezvous).await;

    let mut config = swarm_config(4);
    windows(&mut config, 1.0, 10.0, 10.0);
    config.timeouts.p2p_not_receiving_bytes = Duration::from_millis(200);
    config.retries.p2p_error_retries = 1;
    let leecher = LoaderTestFixture::in_swarm(config, &rendezvous);
    let errors = leecher.record(EventKind::SegmentError);
    let closed = leecher.record(EventKind::PeerClose);
    leecher.add_stream(2).await;
    connect(&seeder, &leecher).await;

    rendezvous.set_holding(true);
    leecher.handle.load_segment(leecher.key(0)).await.unwrap();

    errors
        .wait_for("P2P timeout", |event| {
            matches!(
                event,
                CoreEvent::SegmentError {
                    error: RequestError::BytesReceivingTimeout,
                    source: DownloadSource::P2p,
                    ..
                }
            )
        })
        .await;
    closed
        .wait_for("peer teardown", |event| matches!(event, CoreEvent::PeerClose { .. }))
        .await;
    leecher
        .wait_for_stats("peer removal", |stats| stats.connected_peers == 0)
        .await;

    // The segment falls back to HTTP
    let response = timeout(Duration::from_secs(5), leecher.handle.load_segment(leecher.key(1)))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response.data, segment_bytes(1));
    assert_eq!(leecher.stats().await.p2p_bytes, 0);
}

#[tokio::test]
async fn test_segments_in_windows_survive_count_eviction() {
    let mut config = http_only_config();
    config.cache.cached_segments_count = 1;
    windows(&mut config, 1.0, 2.0, 2.0);
    let fixture = LoaderTestFixture::new(config);
    fixture.add_stream(4).await;

    fixture.handle.load_segment(fixture.key(0)).await.unwrap();
    fixture.handle.load_segment(fixture.key(1)).await.unwrap();
    let stats = fixture.stats().await;
    assert_eq!(stats.cached_segments, 2);
    assert_eq!(stats.cache.evictions, 0);

    // Once played, s0 and s1 lose their lock and go on the next store
    fixture
        .handle
        .update_playback(2.0 * SEGMENT_DURATION, 1.0)
        .await
        .unwrap();
    fixture.handle.load_segment(fixture.key(2)).await.unwrap();
    fixture
        .wait_for_stats("eviction of played segments", |stats| stats.cache.evictions == 2)
        .await;

    let reloaded = fixture.handle.load_segment(fixture.key(0)).await.unwrap();
    assert_eq!(reloaded.data, segment_bytes(0));
    assert_eq!(fixture.http.request_count(&segment_url(0)), 2);
}

#[tokio::test]
async fn test_segment_leaving_queue_is_aborted() {
    let mut config = http_only_config();
    windows(&mut config, 1.0, 2.0, 2.0);
    let fixture = LoaderTestFixture::new(config);
    fixture.http.gate(segment_url(1));
    fixture.add_stream(4).await;
    let aborts = fixture.record(EventKind::SegmentAbort);

    fixture.handle.load_segment(fixture.key(0)).await.unwrap();
    fixture.wait_for_requests(1, 1).await;
    assert_eq!(fixture.stats().await.http_loading, 1);

    // Seeking past s1 drops it from the queue
    fixture
        .handle
        .update_playback(3.0 * SEGMENT_DURATION, 1.0)
        .await
        .unwrap();

    let prefetched = fixture.key(1);
    aborts
        .wait_for("abort of s1", move |event| {
            matches!(event, CoreEvent::SegmentAbort { key, .. } if *key == prefetched)
        })
        .await;
    assert_eq!(fixture.stats().await.http_loading, 0);
}
