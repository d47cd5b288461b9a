//! In-memory transports for tests and simulations.
//!
//! `MemoryChannel` pairs deliver messages in order between two ends and can
//! hold outgoing data to exercise flow control. `MemoryRendezvous` connects
//! every member of a swarm with every other. `MemoryHttpTransport` serves
//! registered resources with range support.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{Semaphore, mpsc};
use url::Url;

use super::{
    ChannelEvent, DataChannel, HttpRequest, HttpResponse, HttpTransport, PeerCandidate,
    RendezvousEvent, SwarmRendezvous, TransportError,
};
use crate::peer::PeerId;

/// One end of an in-memory data channel.
pub struct MemoryChannel {
    local_events: mpsc::UnboundedSender<ChannelEvent>,
    remote_events: mpsc::UnboundedSender<ChannelEvent>,
    closed: Arc<AtomicBool>,
    holding: AtomicBool,
    held: Mutex<VecDeque<Bytes>>,
    buffered: AtomicUsize,
    low_threshold: usize,
}

/// A channel end with the receiver of its events.
pub type MemoryChannelEnd = (Arc<MemoryChannel>, mpsc::UnboundedReceiver<ChannelEvent>);

impl MemoryChannel {
    /// Creates two connected ends; both observe `Connected` first.
    pub fn pair(low_threshold: usize) -> (MemoryChannelEnd, MemoryChannelEnd) {
        let (first_tx, first_rx) = mpsc::unbounded_channel();
        let (second_tx, second_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));

        let first = Arc::new(Self::new(first_tx.clone(), second_tx.clone(), &closed, low_threshold));
        let second = Arc::new(Self::new(second_tx.clone(), first_tx.clone(), &closed, low_threshold));

        let _ = first_tx.send(ChannelEvent::Connected);
        let _ = second_tx.send(ChannelEvent::Connected);

        ((first, first_rx), (second, second_rx))
    }

    fn new(
        local_events: mpsc::UnboundedSender<ChannelEvent>,
        remote_events: mpsc::UnboundedSender<ChannelEvent>,
        closed: &Arc<AtomicBool>,
        low_threshold: usize,
    ) -> Self {
        Self {
            local_events,
            remote_events,
            closed: Arc::clone(closed),
            holding: AtomicBool::new(false),
            held: Mutex::new(VecDeque::new()),
            buffered: AtomicUsize::new(0),
            low_threshold,
        }
    }

    /// Holds outgoing messages in the buffer until `flush`.
    pub fn set_holding(&self, holding: bool) {
        self.holding.store(holding, Ordering::SeqCst);
    }

    /// Delivers held messages and signals `BufferedAmountLow`.
    pub fn flush(&self) {
        let held: Vec<Bytes> = self.held.lock().drain(..).collect();
        self.buffered.store(0, Ordering::SeqCst);
        for data in held {
            let _ = self.remote_events.send(ChannelEvent::Data(data));
        }
        let _ = self.local_events.send(ChannelEvent::BufferedAmountLow);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl DataChannel for MemoryChannel {
    fn send(&self, data: Bytes) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        if self.holding.load(Ordering::SeqCst) {
            self.buffered.fetch_add(data.len(), Ordering::SeqCst);
            self.held.lock().push_back(data);
            return Ok(());
        }
        self.remote_events
            .send(ChannelEvent::Data(data))
            .map_err(|_| TransportError::Closed)
    }

    fn buffered_amount(&self) -> usize {
        self.buffered.load(Ordering::SeqCst)
    }

    fn buffered_amount_low_threshold(&self) -> usize {
        self.low_threshold
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.local_events.send(ChannelEvent::Closed);
        let _ = self.remote_events.send(ChannelEvent::Closed);
    }
}

struct SwarmMember {
    id: PeerId,
    events: mpsc::UnboundedSender<RendezvousEvent>,
}

/// Rendezvous that connects all members of a swarm pairwise.
#[derive(Clone, Default)]
pub struct MemoryRendezvous {
    swarms: Arc<Mutex<HashMap<String, Vec<SwarmMember>>>>,
    /// Every channel end handed out, for `set_holding`
    channels: Arc<Mutex<Vec<Arc<MemoryChannel>>>>,
    low_threshold: usize,
}

impl MemoryRendezvous {
    pub fn new() -> Self {
        Self::default()
    }

    /// Low-water mark of the channels this rendezvous creates.
    pub fn with_low_threshold(mut self, low_threshold: usize) -> Self {
        self.low_threshold = low_threshold;
        self
    }

    pub fn member_count(&self, swarm_key: &str) -> usize {
        self.swarms.lock().get(swarm_key).map_or(0, Vec::len)
    }

    /// Holds (or stops holding) outgoing data on every channel created so
    /// far, so connected peers go silent without closing.
    pub fn set_holding(&self, holding: bool) {
        for channel in self.channels.lock().iter() {
            channel.set_holding(holding);
        }
    }
}

#[async_trait]
impl SwarmRendezvous for MemoryRendezvous {
    async fn join(
        &self,
        swarm_key: &str,
        local_id: &PeerId,
    ) -> Result<mpsc::UnboundedReceiver<RendezvousEvent>, TransportError> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mut swarms = self.swarms.lock();
        let members = swarms.entry(swarm_key.to_string()).or_default();

        if members.iter().any(|member| &member.id == local_id) {
            return Err(TransportError::Rendezvous {
                reason: format!("{local_id} already joined swarm {swarm_key}"),
            });
        }

        members.retain(|member| !member.events.is_closed());
        for member in members.iter() {
            let ((local_channel, local_rx), (remote_channel, remote_rx)) =
                MemoryChannel::pair(self.low_threshold);
            self.channels
                .lock()
                .extend([Arc::clone(&local_channel), Arc::clone(&remote_channel)]);
            let _ = events_tx.send(RendezvousEvent::Candidate(PeerCandidate {
                remote_id: member.id.clone(),
                channel: local_channel,
                events: local_rx,
            }));
            let _ = member.events.send(RendezvousEvent::Candidate(PeerCandidate {
                remote_id: local_id.clone(),
                channel: remote_channel,
                events: remote_rx,
            }));
        }

        members.push(SwarmMember {
            id: local_id.clone(),
            events: events_tx,
        });
        tracing::debug!(swarm = swarm_key, peer = %local_id, members = members.len(), "Joined memory swarm");
        Ok(events_rx)
    }

    async fn leave(&self, swarm_key: &str, local_id: &PeerId) {
        let mut swarms = self.swarms.lock();
        if let Some(members) = swarms.get_mut(swarm_key) {
            members.retain(|member| &member.id != local_id);
            if members.is_empty() {
                swarms.remove(swarm_key);
            }
        }
    }
}

/// Canned answer for one URL.
#[derive(Debug, Clone)]
pub struct MemoryResource {
    pub data: Bytes,
    /// Status override; `None` serves the data
    pub status: Option<u16>,
    /// Body chunk size
    pub chunk_size: usize,
    /// Body never yields bytes
    pub stall: bool,
}

impl MemoryResource {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            status: None,
            chunk_size: 16 * 1024,
            stall: false,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn stalled(mut self) -> Self {
        self.stall = true;
        self
    }
}

#[derive(Default)]
struct MemoryHttpState {
    resources: HashMap<Url, MemoryResource>,
    gates: HashMap<Url, Arc<Semaphore>>,
    requests: Vec<HttpRequest>,
}

/// HTTP transport serving registered resources.
///
/// Ranged requests are answered with `206` and a `Content-Range` header.
/// A gated URL holds its response until `release` is called.
#[derive(Clone, Default)]
pub struct MemoryHttpTransport {
    state: Arc<Mutex<MemoryHttpState>>,
}

impl MemoryHttpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, url: Url, resource: MemoryResource) {
        self.state.lock().resources.insert(url, resource);
    }

    /// Holds responses for `url` until released.
    pub fn gate(&self, url: Url) {
        self.state
            .lock()
            .gates
            .insert(url, Arc::new(Semaphore::new(0)));
    }

    /// Lets one held or future response for `url` through.
    pub fn release(&self, url: &Url) {
        if let Some(gate) = self.state.lock().gates.get(url) {
            gate.add_permits(1);
        }
    }

    /// Requests received so far, in order.
    pub fn requests(&self) -> Vec<HttpRequest> {
        self.state.lock().requests.clone()
    }

    pub fn request_count(&self, url: &Url) -> usize {
        self.state
            .lock()
            .requests
            .iter()
            .filter(|request| &request.url == url)
            .count()
    }
}

#[async_trait]
impl HttpTransport for MemoryHttpTransport {
    async fn fetch(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let (resource, gate) = {
            let mut state = self.state.lock();
            state.requests.push(request.clone());
            (
                state.resources.get(&request.url).cloned(),
                state.gates.get(&request.url).cloned(),
            )
        };

        if let Some(gate) = gate {
            let permit = gate.acquire().await.map_err(|_| TransportError::Http {
                reason: "gate closed".to_string(),
            })?;
            permit.forget();
        }

        let Some(resource) = resource else {
            return Ok(empty_response(404));
        };
        if let Some(status) = resource.status {
            return Ok(empty_response(status));
        }

        let total = resource.data.len() as u64;
        let (status, body, content_range) = match request.range {
            Some((from, to)) => {
                let to = to.unwrap_or(total.saturating_sub(1)).min(total.saturating_sub(1));
                if from > to {
                    return Ok(empty_response(416));
                }
                let body = resource.data.slice(from as usize..=to as usize);
                (206, body, Some(format!("bytes {from}-{to}/{total}")))
            }
            None => (200, resource.data.clone(), None),
        };

        let content_length = Some(body.len() as u64);
        let body = if resource.stall {
            futures::stream::pending().boxed()
        } else {
            let chunks: Vec<Result<Bytes, TransportError>> = (0..body.len())
                .step_by(resource.chunk_size)
                .map(|offset| Ok(body.slice(offset..(offset + resource.chunk_size).min(body.len()))))
                .collect();
            futures::stream::iter(chunks).boxed()
        };

        Ok(HttpResponse {
            status,
            content_length,
            content_range,
            body,
        })
    }
}

fn empty_response(status: u16) -> HttpResponse {
    HttpResponse {
        status,
        content_length: Some(0),
        content_range: None,
        body: futures::stream::empty().boxed(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(path: &str) -> Url {
        Url::parse(&format!("https://cdn.example/{path}")).unwrap()
    }

    async fn collect_body(response: HttpResponse) -> Vec<u8> {
        let chunks: Vec<_> = response.body.collect().await;
        chunks.into_iter().flat_map(|chunk| chunk.unwrap()).collect()
    }

    #[tokio::test]
    async fn test_channel_pair_delivers_in_order() {
        let ((first, mut first_rx), (_second, mut second_rx)) = MemoryChannel::pair(0);

        assert_eq!(first_rx.recv().await, Some(ChannelEvent::Connected));
        assert_eq!(second_rx.recv().await, Some(ChannelEvent::Connected));

        first.send(Bytes::from_static(b"one")).unwrap();
        first.send(Bytes::from_static(b"two")).unwrap();
        assert_eq!(
            second_rx.recv().await,
            Some(ChannelEvent::Data(Bytes::from_static(b"one")))
        );
        assert_eq!(
            second_rx.recv().await,
            Some(ChannelEvent::Data(Bytes::from_static(b"two")))
        );
    }

    #[tokio::test]
    async fn test_holding_channel_buffers_until_flush() {
        let ((first, mut first_rx), (_second, mut second_rx)) = MemoryChannel::pair(0);
        let _ = first_rx.recv().await;
        let _ = second_rx.recv().await;

        first.set_holding(true);
        first.send(Bytes::from_static(b"held")).unwrap();
        assert_eq!(first.buffered_amount(), 4);
        assert!(second_rx.try_recv().is_err());

        first.flush();
        assert_eq!(first.buffered_amount(), 0);
        assert_eq!(
            second_rx.recv().await,
            Some(ChannelEvent::Data(Bytes::from_static(b"held")))
        );
        assert_eq!(first_rx.recv().await, Some(ChannelEvent::BufferedAmountLow));
    }

    #[tokio::test]
    async fn test_close_notifies_both_ends_and_rejects_sends() {
        let ((first, mut first_rx), (second, mut second_rx)) = MemoryChannel::pair(0);
        let _ = first_rx.recv().await;
        let _ = second_rx.recv().await;

        second.close();
        assert_eq!(first_rx.recv().await, Some(ChannelEvent::Closed));
        assert_eq!(second_rx.recv().await, Some(ChannelEvent::Closed));
        assert_eq!(
            first.send(Bytes::from_static(b"late")),
            Err(TransportError::Closed)
        );
    }

    #[tokio::test]
    async fn test_rendezvous_connects_members_pairwise() {
        let rendezvous = MemoryRendezvous::new();
        let alice = PeerId::from("-SH0001-aaaaaaaaaaaa");
        let bob = PeerId::from("-SH0001-bbbbbbbbbbbb");

        let mut alice_events = rendezvous.join("swarm", &alice).await.unwrap();
        let mut bob_events = rendezvous.join("swarm", &bob).await.unwrap();

        let Some(RendezvousEvent::Candidate(for_alice)) = alice_events.recv().await else {
            panic!("alice expected a candidate");
        };
        let Some(RendezvousEvent::Candidate(for_bob)) = bob_events.recv().await else {
            panic!("bob expected a candidate");
        };
        assert_eq!(for_alice.remote_id, bob);
        assert_eq!(for_bob.remote_id, alice);
        assert_eq!(rendezvous.member_count("swarm"), 2);

        rendezvous.leave("swarm", &alice).await;
        assert_eq!(rendezvous.member_count("swarm"), 1);
        assert!(rendezvous.join("swarm", &bob).await.is_err());
    }

    #[tokio::test]
    async fn test_rendezvous_holding_silences_connected_peers() {
        let rendezvous = MemoryRendezvous::new();
        let alice = PeerId::from("-SH0001-aaaaaaaaaaaa");
        let bob = PeerId::from("-SH0001-bbbbbbbbbbbb");

        let mut alice_events = rendezvous.join("swarm", &alice).await.unwrap();
        let mut bob_events = rendezvous.join("swarm", &bob).await.unwrap();
        let Some(RendezvousEvent::Candidate(for_alice)) = alice_events.recv().await else {
            panic!("alice expected a candidate");
        };
        let Some(RendezvousEvent::Candidate(for_bob)) = bob_events.recv().await else {
            panic!("bob expected a candidate");
        };
        let mut at_alice = for_alice.events;
        assert_eq!(at_alice.recv().await, Some(ChannelEvent::Connected));

        rendezvous.set_holding(true);
        for_bob.channel.send(Bytes::from_static(b"quiet")).unwrap();

        assert_eq!(for_bob.channel.buffered_amount(), 5);
        assert!(at_alice.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_http_serves_ranges_and_missing_urls() {
        let transport = MemoryHttpTransport::new();
        transport.insert(url("a.ts"), MemoryResource::new(vec![7u8; 100]).with_chunk_size(30));

        let whole = transport
            .fetch(HttpRequest {
                url: url("a.ts"),
                range: None,
            })
            .await
            .unwrap();
        assert_eq!(whole.status, 200);
        assert_eq!(collect_body(whole).await.len(), 100);

        let ranged = transport
            .fetch(HttpRequest {
                url: url("a.ts"),
                range: Some((40, None)),
            })
            .await
            .unwrap();
        assert_eq!(ranged.status, 206);
        assert_eq!(ranged.content_range.as_deref(), Some("bytes 40-99/100"));
        assert_eq!(collect_body(ranged).await.len(), 60);

        let missing = transport
            .fetch(HttpRequest {
                url: url("b.ts"),
                range: None,
            })
            .await
            .unwrap();
        assert_eq!(missing.status, 404);
        assert_eq!(transport.requests().len(), 3);
    }
}
