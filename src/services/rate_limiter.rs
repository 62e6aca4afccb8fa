//! Per-endpoint request rate limiting for the storage API
//!
//! The provider enforces separate quotas for listing, rename, move and
//! delete calls, so each endpoint class gets its own gate. A gate admits at
//! most one call per `1/qps` seconds and never allows bursts, even after an
//! idle period.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use governor::{
    Quota, RateLimiter as GovernorLimiter,
    clock::MonotonicClock,
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
};
use serde::Serialize;
use tracing::trace;

/// Endpoint classes with independent quotas
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Endpoint {
    Listing,
    Detail,
    Rename,
    Move,
    Delete,
    CreateFolder,
}

impl Endpoint {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Listing => "listing",
            Self::Detail => "detail",
            Self::Rename => "rename",
            Self::Move => "move",
            Self::Delete => "delete",
            Self::CreateFolder => "create_folder",
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Queries per second for each endpoint class
#[derive(Debug, Clone, PartialEq)]
pub struct EndpointQuotas {
    pub listing: f64,
    pub rename: f64,
    pub move_files: f64,
    pub delete: f64,
    /// Shared by endpoints without a dedicated quota
    pub general: f64,
}

impl Default for EndpointQuotas {
    fn default() -> Self {
        Self {
            listing: 2.0,
            rename: 1.0,
            move_files: 1.0,
            delete: 1.0,
            general: 2.0,
        }
    }
}

impl EndpointQuotas {
    /// Same rate for every endpoint
    pub fn uniform(qps: f64) -> Self {
        Self {
            listing: qps,
            rename: qps,
            move_files: qps,
            delete: qps,
            general: qps,
        }
    }
}

/// Minimum-interval gate: one permit per `1/qps` seconds, burst of one
pub struct RateLimiter {
    limiter: GovernorLimiter<NotKeyed, InMemoryState, MonotonicClock, NoOpMiddleware<std::time::Instant>>,
    interval: Duration,
    name: String,
}

impl RateLimiter {
    /// Create a limiter. Non-positive or non-finite rates fall back to 1 qps.
    pub fn new(name: &str, qps: f64) -> Self {
        let qps = if qps.is_finite() && qps > 0.0 { qps } else { 1.0 };
        let interval = Duration::from_secs_f64(1.0 / qps);
        let quota = Quota::with_period(interval)
            .unwrap_or_else(|| Quota::per_second(NonZeroU32::MIN))
            .allow_burst(NonZeroU32::MIN);

        Self {
            // std Instant clock, so spacing holds when measured with Instant
            limiter: GovernorLimiter::direct_with_clock(quota, &MonotonicClock),
            interval,
            name: name.to_string(),
        }
    }

    /// Wait until the next call is permitted
    pub async fn acquire(&self) {
        self.limiter.until_ready().await;
        trace!(limiter = %self.name, "Rate limit permit acquired");
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// One limiter per endpoint class plus a shared general-purpose one
#[derive(Clone)]
pub struct EndpointLimiters {
    listing: Arc<RateLimiter>,
    rename: Arc<RateLimiter>,
    move_files: Arc<RateLimiter>,
    delete: Arc<RateLimiter>,
    general: Arc<RateLimiter>,
}

impl EndpointLimiters {
    pub fn new(quotas: &EndpointQuotas) -> Self {
        Self {
            listing: Arc::new(RateLimiter::new("listing", quotas.listing)),
            rename: Arc::new(RateLimiter::new("rename", quotas.rename)),
            move_files: Arc::new(RateLimiter::new("move", quotas.move_files)),
            delete: Arc::new(RateLimiter::new("delete", quotas.delete)),
            general: Arc::new(RateLimiter::new("general", quotas.general)),
        }
    }

    /// The limiter guarding calls to `endpoint`
    pub fn for_endpoint(&self, endpoint: Endpoint) -> &Arc<RateLimiter> {
        match endpoint {
            Endpoint::Listing => &self.listing,
            Endpoint::Rename => &self.rename,
            Endpoint::Move => &self.move_files,
            Endpoint::Delete => &self.delete,
            Endpoint::Detail | Endpoint::CreateFolder => &self.general,
        }
    }

    pub async fn acquire(&self, endpoint: Endpoint) {
        self.for_endpoint(endpoint).acquire().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_quota_defaults() {
        let quotas = EndpointQuotas::default();
        assert_eq!(quotas.listing, 2.0);
        assert_eq!(quotas.rename, 1.0);
    }

    #[test]
    fn test_invalid_rate_falls_back() {
        let limiter = RateLimiter::new("bad", 0.0);
        assert_eq!(limiter.interval(), Duration::from_secs(1));
        let limiter = RateLimiter::new("nan", f64::NAN);
        assert_eq!(limiter.interval(), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_ten_calls_at_five_qps_take_nine_intervals() {
        let limiter = RateLimiter::new("test", 5.0);
        let start = Instant::now();
        for _ in 0..10 {
            limiter.acquire().await;
        }
        // 9 x 200ms between the first and the last permit
        assert!(start.elapsed() >= Duration::from_millis(1800), "{:?}", start.elapsed());
    }

    #[tokio::test]
    async fn test_no_burst_after_idle() {
        let limiter = RateLimiter::new("idle", 10.0);
        limiter.acquire().await;
        tokio::time::sleep(Duration::from_millis(350)).await;

        let start = Instant::now();
        for _ in 0..3 {
            limiter.acquire().await;
        }
        // First call is free after idling, the next two must each wait 100ms
        assert!(start.elapsed() >= Duration::from_millis(190), "{:?}", start.elapsed());
    }

    #[test]
    fn test_endpoints_map_to_dedicated_limiters() {
        let limiters = EndpointLimiters::new(&EndpointQuotas::default());
        assert_eq!(limiters.for_endpoint(Endpoint::Listing).name(), "listing");
        assert_eq!(limiters.for_endpoint(Endpoint::Move).name(), "move");
        assert_eq!(limiters.for_endpoint(Endpoint::Detail).name(), "general");
        assert_eq!(limiters.for_endpoint(Endpoint::CreateFolder).name(), "general");
    }
}
