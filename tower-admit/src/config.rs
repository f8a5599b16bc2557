use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use admit_limit::SlidingWindow;
use admit_limit::Strategy;
use admit_limit::TokenBucket;
use quanta::Clock;
use serde::Deserialize;

use crate::backoff::BackoffConfig;
use crate::error::ConfigError;
use crate::scheduler::SchedulePolicy;

/// Which limiter a [`LimiterConfig`] builds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimiterKind {
    /// Never more than `max_requests` admissions in any `window`-long span.
    #[default]
    SlidingWindow,
    /// Averages `max_requests` per `window`, but may burst past it.
    ///
    /// A full bucket spends `max_requests` at once and then refills one token every
    /// `window / max_requests`, so a rolling window can see up to about twice the
    /// limit. Use [`LimiterKind::SlidingWindow`] when the limit must hold exactly.
    TokenBucket,
}

/// `max_requests` admissions per `window`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LimiterConfig {
    pub strategy: LimiterKind,
    pub max_requests: usize,
    #[serde(deserialize_with = "human_duration::deserialize")]
    pub window: Duration,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            strategy: LimiterKind::SlidingWindow,
            max_requests: 2,
            window: Duration::from_secs(60),
        }
    }
}

impl LimiterConfig {
    /// Build the configured limiter, reading time from `clock`.
    ///
    /// A token bucket holds `max_requests` tokens and regains one every
    /// `window / max_requests`, so both strategies average the same rate.
    pub fn build(&self, clock: Clock) -> Result<Arc<dyn Strategy + Send + Sync>, ConfigError> {
        let capacity = NonZeroUsize::new(self.max_requests).ok_or(ConfigError::Invalid {
            field: "limiter.max_requests",
            reason: "must be greater than zero".to_string(),
        })?;
        if self.window.is_zero() {
            return Err(ConfigError::Invalid {
                field: "limiter.window",
                reason: "must be greater than zero".to_string(),
            });
        }

        let limiter: Arc<dyn Strategy + Send + Sync> = match self.strategy {
            LimiterKind::SlidingWindow => {
                Arc::new(SlidingWindow::with_clock(capacity, self.window, clock))
            }
            LimiterKind::TokenBucket => {
                let interval = self.window / u32::try_from(capacity.get()).unwrap_or(u32::MAX);
                Arc::new(TokenBucket::with_clock(
                    capacity,
                    NonZeroUsize::MIN,
                    interval,
                    clock,
                ))
            }
        };
        Ok(limiter)
    }
}

/// How deferred work is promoted once capacity frees up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromotionMode {
    /// Callers promote their own work by calling `retry`.
    ///
    /// Whoever polls first after a slot frees wins it, regardless of priority.
    #[default]
    Poll,
    /// A background task promotes work in scheduling order.
    ///
    /// New submissions are deferred while anything is pending, so the scheduling
    /// order is also the admission order.
    Push,
}

/// Configuration for an [`AdmissionCoordinator`](crate::AdmissionCoordinator).
///
/// Durations are human readable ("60s", "250ms", "5m").
///
/// ```rust
/// use std::time::Duration;
/// use tower_admit::AdmissionConfig;
///
/// let config = AdmissionConfig::from_toml_str(
///     r#"
///     pool_capacity = 10
///     max_residency = "2m"
///
///     [limiter]
///     max_requests = 1
///     window = "1s"
///     "#,
/// )
/// .unwrap();
///
/// assert_eq!(config.pool_capacity, 10);
/// assert_eq!(config.max_residency, Duration::from_secs(120));
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AdmissionConfig {
    pub limiter: LimiterConfig,
    /// Maximum resident entries in the deferral pool.
    pub pool_capacity: usize,
    /// How long an entry may stay in the pool before it is expired or collected.
    #[serde(deserialize_with = "human_duration::deserialize")]
    pub max_residency: Duration,
    /// How long a terminal entry is kept after a caller has observed it.
    #[serde(deserialize_with = "human_duration::deserialize")]
    pub delivered_retention: Duration,
    /// Period of the background expiry sweep.
    #[serde(deserialize_with = "human_duration::deserialize")]
    pub sweep_interval: Duration,
    pub policy: SchedulePolicy,
    pub promotion: PromotionMode,
    pub backoff: Option<BackoffConfig>,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            limiter: LimiterConfig::default(),
            pool_capacity: 100,
            max_residency: Duration::from_secs(300),
            delivered_retention: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(10),
            policy: SchedulePolicy::default(),
            promotion: PromotionMode::default(),
            backoff: None,
        }
    }
}

impl AdmissionConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = |field: &'static str, ok: bool| {
            if ok {
                Ok(())
            } else {
                Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero".to_string(),
                })
            }
        };

        positive("limiter.max_requests", self.limiter.max_requests > 0)?;
        positive("limiter.window", !self.limiter.window.is_zero())?;
        positive("pool_capacity", self.pool_capacity > 0)?;
        positive("max_residency", !self.max_residency.is_zero())?;
        positive("sweep_interval", !self.sweep_interval.is_zero())?;
        if let Some(backoff) = &self.backoff {
            positive("backoff.base", !backoff.base.is_zero())?;
            if backoff.max < backoff.base {
                return Err(ConfigError::Invalid {
                    field: "backoff.max",
                    reason: "must not be less than backoff.base".to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn with_limiter(mut self, max_requests: usize, window: Duration) -> Self {
        self.limiter.max_requests = max_requests;
        self.limiter.window = window;
        self
    }

    pub fn with_limiter_kind(mut self, strategy: LimiterKind) -> Self {
        self.limiter.strategy = strategy;
        self
    }

    pub fn with_pool_capacity(mut self, pool_capacity: usize) -> Self {
        self.pool_capacity = pool_capacity;
        self
    }

    pub fn with_max_residency(mut self, max_residency: Duration) -> Self {
        self.max_residency = max_residency;
        self
    }

    pub fn with_delivered_retention(mut self, delivered_retention: Duration) -> Self {
        self.delivered_retention = delivered_retention;
        self
    }

    pub fn with_sweep_interval(mut self, sweep_interval: Duration) -> Self {
        self.sweep_interval = sweep_interval;
        self
    }

    pub fn with_policy(mut self, policy: SchedulePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_promotion(mut self, promotion: PromotionMode) -> Self {
        self.promotion = promotion;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = Some(backoff);
        self
    }
}

pub(crate) mod human_duration {
    use std::time::Duration;

    use serde::Deserialize;
    use serde::Deserializer;

    pub(crate) fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }

    pub(crate) fn option<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<String>::deserialize(deserializer)?
            .map(|raw| humantime::parse_duration(&raw).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_reference_deployment() {
        let config = AdmissionConfig::default();

        assert_eq!(config.limiter.max_requests, 2);
        assert_eq!(config.limiter.window, Duration::from_secs(60));
        assert_eq!(config.pool_capacity, 100);
        assert_eq!(config.max_residency, Duration::from_secs(300));
        assert_eq!(config.promotion, PromotionMode::Poll);
        assert!(config.validate().is_ok());
        assert_eq!(AdmissionConfig::from_toml_str("").unwrap(), config);
    }

    #[test]
    fn parses_every_section() {
        let config = AdmissionConfig::from_toml_str(
            r#"
            pool_capacity = 5
            max_residency = "90s"
            delivered_retention = "5s"
            sweep_interval = "250ms"
            promotion = "push"

            [limiter]
            strategy = "token_bucket"
            max_requests = 1
            window = "1s"

            [policy]
            kind = "priority"
            aging = "30s"

            [backoff]
            base = "1s"
            max = "1m"
            "#,
        )
        .unwrap();

        assert_eq!(config.limiter.strategy, LimiterKind::TokenBucket);
        assert_eq!(config.sweep_interval, Duration::from_millis(250));
        assert_eq!(config.promotion, PromotionMode::Push);
        assert_eq!(
            config.policy,
            SchedulePolicy::Priority {
                aging: Some(Duration::from_secs(30))
            }
        );
        let backoff = config.backoff.unwrap();
        assert_eq!(backoff.max, Duration::from_secs(60));
    }

    #[test]
    fn fifo_policy_needs_no_fields() {
        let config = AdmissionConfig::from_toml_str("[policy]\nkind = \"fifo\"\n").unwrap();
        assert_eq!(config.policy, SchedulePolicy::Fifo);
    }

    #[test]
    fn rejects_zero_capacity() {
        let err = AdmissionConfig::from_toml_str("pool_capacity = 0").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "pool_capacity",
                ..
            }
        ));
    }

    #[test]
    fn rejects_unparseable_durations_and_unknown_fields() {
        assert!(matches!(
            AdmissionConfig::from_toml_str("max_residency = \"soon\""),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            AdmissionConfig::from_toml_str("queue_size = 3"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn builds_both_limiters() {
        let (clock, _mock) = Clock::mock();

        let sliding = LimiterConfig::default().build(clock.clone()).unwrap();
        assert_eq!(sliding.name(), "sliding_window");
        assert_eq!(sliding.capacity(), 2);

        let bucket = LimiterConfig {
            strategy: LimiterKind::TokenBucket,
            max_requests: 4,
            window: Duration::from_secs(60),
        }
        .build(clock)
        .unwrap();
        assert_eq!(bucket.name(), "token_bucket");
        assert_eq!(bucket.period(), Duration::from_secs(60));
        assert_eq!(bucket.admission_interval(), Duration::from_secs(15));
    }

    #[test]
    fn only_the_sliding_window_holds_the_limit_exactly() {
        let (clock, mock) = Clock::mock();
        let limiter = |strategy| {
            LimiterConfig {
                strategy,
                max_requests: 2,
                window: Duration::from_secs(60),
            }
            .build(clock.clone())
            .unwrap()
        };
        let sliding = limiter(LimiterKind::SlidingWindow);
        let bucket = limiter(LimiterKind::TokenBucket);

        for _ in 0..2 {
            assert!(sliding.try_acquire(1).is_continue());
            assert!(bucket.try_acquire(1).is_continue());
        }

        // Half a window later the bucket has regained a token; the window has not moved.
        mock.increment(Duration::from_secs(30));
        assert!(sliding.try_acquire(1).is_break());
        assert!(bucket.try_acquire(1).is_continue());
    }
}
