//! Centralized configuration for Shoal.
//!
//! All tunable parameters of the hybrid loader are defined here to avoid
//! hard-coded values scattered throughout the codebase.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ShoalError;

/// Central configuration for the hybrid loader.
///
/// Groups related configuration settings into logical sections.
/// Supports environment variable overrides for runtime customization.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ShoalConfig {
    pub windows: TimeWindowConfig,
    pub concurrency: ConcurrencyConfig,
    pub timeouts: TimeoutConfig,
    pub retries: RetryConfig,
    pub cache: CacheConfig,
    pub p2p: P2pConfig,
    /// Seed for random scheduling decisions (None = entropy)
    pub random_seed: Option<u64>,
}

/// Look-ahead windows, in seconds of content, scaled by playback rate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeWindowConfig {
    /// Segments that must be fetched as fast as possible
    pub high_demand: f64,
    /// Segments eligible for opportunistic HTTP prefetch
    pub http_download: f64,
    /// Segments eligible for P2P prefetch
    pub p2p_download: f64,
}

impl Default for TimeWindowConfig {
    fn default() -> Self {
        Self {
            high_demand: 15.0,
            http_download: 3000.0,
            p2p_download: 6000.0,
        }
    }
}

/// Concurrency caps per source.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    pub simultaneous_http_downloads: usize,
    pub simultaneous_p2p_downloads: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            simultaneous_http_downloads: 2,
            simultaneous_p2p_downloads: 3,
        }
    }
}

/// Timers driving transfers and queue processing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// HTTP attempt fails when no bytes arrive within this interval
    pub http_not_receiving_bytes: Duration,
    /// P2P attempt fails when no bytes arrive within this interval
    pub p2p_not_receiving_bytes: Duration,
    /// Minimum interval between two non-forced queue passes
    pub queue_min_interval: Duration,
    /// Interval of the random HTTP pick
    pub random_http_interval: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            http_not_receiving_bytes: Duration::from_millis(3000),
            p2p_not_receiving_bytes: Duration::from_millis(2000),
            queue_min_interval: Duration::from_millis(1000),
            random_http_interval: Duration::from_millis(1500),
        }
    }
}

/// Which peer failures count towards tearing the connection down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PeerFailurePolicy {
    /// Only timeout-class failures count
    #[default]
    TimeoutsOnly,
    /// Timeout-class and transport-class failures count
    AllFailures,
}

/// Retry budgets per source.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub http_error_retries: usize,
    pub p2p_error_retries: usize,
    pub peer_failure_policy: PeerFailurePolicy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            http_error_retries: 3,
            p2p_error_retries: 3,
            peer_failure_policy: PeerFailurePolicy::default(),
        }
    }
}

/// Segment cache limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of cached segments before count eviction
    pub cached_segments_count: usize,
    /// Entries idle longer than this are evicted (None = never)
    pub cached_segment_expiration: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cached_segments_count: 50,
            cached_segment_expiration: Some(Duration::from_secs(120)),
        }
    }
}

/// Peer-to-peer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct P2pConfig {
    pub enabled: bool,
    /// Largest message the data channel accepts
    pub max_message_size: usize,
    /// Base of the swarm identity (defaults to the stream manifest URL)
    pub swarm_id: Option<String>,
    /// Peer id prefix identifying this client
    pub client_version_prefix: String,
    /// Rendezvous endpoints handed to the rendezvous collaborator
    pub announce_trackers: Vec<String>,
}

impl Default for P2pConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_message_size: 64 * 1024 - 1,
            swarm_id: None,
            client_version_prefix: "-SH0001-".to_string(),
            announce_trackers: Vec::new(),
        }
    }
}

impl ShoalConfig {
    /// Creates configuration with environment variable overrides.
    ///
    /// Checks for SHOAL_* environment variables and applies them
    /// over default values. Useful for runtime configuration without
    /// code changes.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(count) = env_parse::<usize>("SHOAL_HTTP_DOWNLOADS") {
            config.concurrency.simultaneous_http_downloads = count;
        }

        if let Some(count) = env_parse::<usize>("SHOAL_P2P_DOWNLOADS") {
            config.concurrency.simultaneous_p2p_downloads = count;
        }

        if let Some(seconds) = env_parse::<f64>("SHOAL_HIGH_DEMAND_WINDOW") {
            config.windows.high_demand = seconds;
        }

        if let Some(seconds) = env_parse::<f64>("SHOAL_HTTP_WINDOW") {
            config.windows.http_download = seconds;
        }

        if let Some(seconds) = env_parse::<f64>("SHOAL_P2P_WINDOW") {
            config.windows.p2p_download = seconds;
        }

        if let Ok(enabled) = std::env::var("SHOAL_P2P_ENABLED") {
            config.p2p.enabled = enabled.parse().unwrap_or(true);
        }

        if let Some(seed) = env_parse::<u64>("SHOAL_RANDOM_SEED") {
            config.random_seed = Some(seed);
        }

        config
    }

    /// Creates a configuration optimized for testing.
    ///
    /// Deterministic random decisions and short timers.
    pub fn for_testing() -> Self {
        Self {
            timeouts: TimeoutConfig {
                http_not_receiving_bytes: Duration::from_millis(500),
                p2p_not_receiving_bytes: Duration::from_millis(500),
                queue_min_interval: Duration::from_millis(50),
                random_http_interval: Duration::from_millis(100),
            },
            random_seed: Some(42),
            ..Default::default()
        }
    }

    /// Rejects records the loader cannot operate with.
    ///
    /// # Errors
    ///
    /// - `ShoalError::Configuration` - A cap, window or message size is unusable
    pub fn validate(&self) -> Result<(), ShoalError> {
        if self.concurrency.simultaneous_http_downloads == 0 {
            return Err(ShoalError::Configuration {
                reason: "simultaneous_http_downloads must be at least 1".to_string(),
            });
        }

        if self.p2p.enabled {
            if self.concurrency.simultaneous_p2p_downloads == 0 {
                return Err(ShoalError::Configuration {
                    reason: "simultaneous_p2p_downloads must be at least 1 when P2P is enabled"
                        .to_string(),
                });
            }
            // Framing markers take 8 bytes of every command chunk
            if self.p2p.max_message_size <= 8 {
                return Err(ShoalError::Configuration {
                    reason: format!(
                        "max_message_size {} leaves no room for command framing",
                        self.p2p.max_message_size
                    ),
                });
            }
        }

        let windows = [
            self.windows.high_demand,
            self.windows.http_download,
            self.windows.p2p_download,
        ];
        if windows.iter().any(|window| !window.is_finite() || *window < 0.0) {
            return Err(ShoalError::Configuration {
                reason: "time windows must be finite and non-negative".to_string(),
            });
        }

        if self.windows.p2p_download < self.windows.http_download {
            tracing::warn!(
                http_window = self.windows.http_download,
                p2p_window = self.windows.p2p_download,
                "P2P window is smaller than HTTP window, P2P ratio will suffer"
            );
        }

        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok()?.parse().ok()
}
