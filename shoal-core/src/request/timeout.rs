//! Restartable single-shot timer owned by a request or a peer.

use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// Called with the generation of the timer that fired.
pub type TimeoutCallback = Arc<dyn Fn(u64) + Send + Sync>;

/// Cancelable "no bytes received" timer.
///
/// Every arm gets a fresh generation. A fire only counts while its
/// generation is current, so a fire racing a restart or a clear is stale.
/// Restart is cancel-then-arm; two live timers never coexist.
pub struct Timeout {
    duration: Duration,
    handle: Option<JoinHandle<()>>,
    generation: u64,
    on_fire: TimeoutCallback,
}

impl Timeout {
    pub fn new(on_fire: TimeoutCallback) -> Self {
        Self {
            duration: Duration::ZERO,
            handle: None,
            generation: 0,
            on_fire,
        }
    }

    /// Arms the timer, cancelling any previous one.
    pub fn start(&mut self, duration: Duration) {
        self.clear();
        self.duration = duration;
        self.arm();
    }

    /// Re-arms with the last duration; no-op when not armed.
    pub fn restart(&mut self) {
        if self.handle.is_none() {
            return;
        }
        self.clear();
        self.arm();
    }

    /// Cancels unconditionally, invalidating any pending fire.
    pub fn clear(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
        self.generation += 1;
    }

    pub fn is_armed(&self) -> bool {
        self.handle.is_some()
    }

    /// Whether a fire with this generation belongs to the armed timer.
    pub fn is_current(&self, generation: u64) -> bool {
        self.handle.is_some() && self.generation == generation
    }

    fn arm(&mut self) {
        let Ok(runtime) = Handle::try_current() else {
            tracing::debug!("No runtime available, timeout not armed");
            return;
        };
        let generation = self.generation;
        let duration = self.duration;
        let on_fire = Arc::clone(&self.on_fire);
        self.handle = Some(runtime.spawn(async move {
            tokio::time::sleep(duration).await;
            on_fire(generation);
        }));
    }
}

impl Drop for Timeout {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for Timeout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timeout")
            .field("duration", &self.duration)
            .field("armed", &self.is_armed())
            .field("generation", &self.generation)
            .finish()
    }
}
