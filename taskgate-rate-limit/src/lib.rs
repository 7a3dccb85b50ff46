//! Fixed-window rate limiting over the shared store.
//!
//! Each (limit name, caller) pair gets one counter per window. The counter
//! is created with the window's TTL and atomically incremented on every
//! check; once the post-increment value exceeds the quota the request is
//! rejected. Bursts aligned to a window boundary may briefly admit up to
//! twice the quota — the accepted tradeoff for an O(1) atomic check.
//!
//! If the store is unreachable the limiter fails **open**: a soft quota is
//! not worth refusing service over infrastructure trouble. Session
//! validation makes the opposite call (fail closed); see taskgate-auth.

use std::sync::Arc;
use std::time::Duration;

use taskgate_store::KvStore;
use tracing::warn;

/// A parsed rate limit: at most `max` requests per `window`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Quota {
    pub max: u64,
    pub window: Duration,
}

impl Quota {
    /// Create a quota directly.
    pub fn new(max: u64, window: Duration) -> Self {
        Self { max, window }
    }

    /// Parse a limit string like `"100 per hour"` or `"5 per minute"`.
    ///
    /// Accepted periods: `second`, `minute`, `hour`, `day` (plural allowed).
    pub fn parse(limit: &str) -> Option<Self> {
        let mut parts = limit.split_whitespace();
        let max: u64 = parts.next()?.parse().ok()?;
        if parts.next()? != "per" {
            return None;
        }
        let secs = match parts.next()?.trim_end_matches('s') {
            "second" => 1,
            "minute" => 60,
            "hour" => 3600,
            "day" => 86_400,
            _ => return None,
        };
        if parts.next().is_some() {
            return None;
        }
        Some(Self {
            max,
            window: Duration::from_secs(secs),
        })
    }
}

impl std::fmt::Display for Quota {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} per {}s", self.max, self.window.as_secs())
    }
}

/// Fixed-window rate limiter.
///
/// Clonable handle; construct once at startup with the shared store and
/// hand it to whatever composes the request pipeline.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn KvStore>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    /// Check whether `caller` may make another request under the named limit.
    ///
    /// Returns `true` while the post-increment count stays within the quota,
    /// `false` once it exceeds it. A store failure admits the request.
    pub async fn allow(&self, name: &str, caller: &str, quota: Quota) -> bool {
        let key = format!("rate:{name}:{caller}");
        match self.store.incr(&key, quota.window).await {
            Ok(count) => count <= quota.max as i64,
            Err(err) => {
                warn!(limit = %name, error = %err, "rate limit check failed, failing open");
                true
            }
        }
    }
}
