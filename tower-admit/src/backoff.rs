use std::time::Duration;

use dashmap::DashMap;
use quanta::Clock;
use quanta::Instant;
use rand::Rng;
use serde::Deserialize;

use crate::config::human_duration;

/// Parameters for [`AdaptiveBackoff`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackoffConfig {
    #[serde(deserialize_with = "human_duration::deserialize")]
    pub base: Duration,
    #[serde(deserialize_with = "human_duration::deserialize")]
    pub max: Duration,
    /// Clients not deferred for this long are forgotten.
    #[serde(deserialize_with = "human_duration::deserialize")]
    pub idle_eviction: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(60),
            idle_eviction: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct ClientRecord {
    deferrals: u32,
    last_seen: Instant,
}

/// Per-client retry hints that grow with repeated deferrals and pool load.
///
/// The hint for a client deferred `n` times before is
/// `base × 2^min(n, 6) × (1 + load) × jitter`, with jitter drawn from `[0.8, 1.2]`,
/// capped at `max`.
#[derive(Debug)]
pub struct AdaptiveBackoff {
    config: BackoffConfig,
    clients: DashMap<String, ClientRecord>,
    clock: Clock,
}

impl AdaptiveBackoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self::with_clock(config, Clock::new())
    }

    pub fn with_clock(config: BackoffConfig, clock: Clock) -> Self {
        Self {
            config,
            clients: DashMap::new(),
            clock,
        }
    }

    /// Record a deferral of `client` and return its retry hint.
    ///
    /// `load` is the pool occupancy, clamped to `[0, 1]`.
    pub fn next_delay(&self, client: &str, load: f64) -> Duration {
        let jitter = rand::rng().random_range(0.8..=1.2);
        self.delay_with_jitter(client, load, jitter)
    }

    fn delay_with_jitter(&self, client: &str, load: f64, jitter: f64) -> Duration {
        let now = self.clock.now();
        let deferrals = {
            let mut record = self
                .clients
                .entry(client.to_string())
                .or_insert(ClientRecord {
                    deferrals: 0,
                    last_seen: now,
                });
            let previous = record.deferrals;
            record.deferrals = previous.saturating_add(1);
            record.last_seen = now;
            previous
        };

        let growth = f64::from(1u32 << deferrals.min(6));
        let delay = self.config.base.as_secs_f64() * growth * (1.0 + load.clamp(0.0, 1.0)) * jitter;

        let delay = Duration::from_secs_f64(delay).min(self.config.max);
        tracing::debug!(
            client,
            deferrals = deferrals + 1,
            load,
            delay_ms = delay.as_millis() as u64,
            "adaptive retry hint"
        );
        delay
    }

    /// Forget `client`'s history, once its work has been admitted.
    pub fn reset(&self, client: &str) {
        self.clients.remove(client);
    }

    /// Drop clients idle for longer than `idle_eviction`. Returns how many were dropped.
    pub fn evict_idle(&self) -> usize {
        let now = self.clock.now();
        let before = self.clients.len();
        self.clients.retain(|_, record| {
            now.saturating_duration_since(record.last_seen) < self.config.idle_eviction
        });
        before.saturating_sub(self.clients.len())
    }

    pub fn tracked_clients(&self) -> usize {
        self.clients.len()
    }

    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }
}
