//! Rate limiting and connection throttling
//!
//! Request limiter: per-IP, per-endpoint-category counters in Redis
//! (atomic INCR + EXPIRE per minute window) plus a cross-category global
//! cap. Redis being down fails open — availability beats strictness for an
//! operator-facing backend. Whitelisted IPs and requests carrying the
//! internal bypass header skip the limiter entirely.
//!
//! Connection throttle: plain in-process counters capping concurrent open
//! requests per IP and in total.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use redis::aio::MultiplexedConnection;
use tracing::{debug, info, warn};

use crate::config::{RateLimitConfig, ThrottleConfig};
use crate::error::CoreError;

/// Window width of the request limiter.
pub const WINDOW_SECS: u64 = 60;

/// Server-internal header that bypasses the request limiter.
pub const BYPASS_HEADER: &str = "x-internal-request";

// ============================================================================
// Endpoint Categories
// ============================================================================

/// Request budget classes. Budgets are per minute per IP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateCategory {
    /// Cheap, dashboard-critical reads (health, latest readings).
    Critical,
    /// Ordinary catalog/series/KPI reads.
    Normal,
    /// Training, detection and other engine-heavy calls.
    Heavy,
    /// Everything else.
    Default,
}

impl RateCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::Normal => "normal",
            Self::Heavy => "heavy",
            Self::Default => "default",
        }
    }

    pub fn limit(self, config: &RateLimitConfig) -> u32 {
        match self {
            Self::Critical => config.critical,
            Self::Normal => config.normal,
            Self::Heavy => config.heavy,
            Self::Default => config.default,
        }
    }

    /// Classify a request path (already stripped of the `/api/v1` prefix by
    /// the router nesting; a full path also matches).
    pub fn for_path(path: &str) -> Self {
        let p = path.strip_prefix("/api/v1").unwrap_or(path);
        if p == "/health" || p.starts_with("/timeseries/latest") || p.starts_with("/stats") {
            Self::Critical
        } else if p.starts_with("/baseline/train")
            || p.starts_with("/baseline/predict")
            || p.starts_with("/baseline/deviation")
            || p.starts_with("/anomaly/detect")
            || p.starts_with("/scheduler/trigger")
            || p.starts_with("/ovos/train-baseline")
        {
            Self::Heavy
        } else if p.starts_with("/machines")
            || p.starts_with("/seus")
            || p.starts_with("/energy-sources")
            || p.starts_with("/timeseries")
            || p.starts_with("/kpi")
            || p.starts_with("/anomaly")
            || p.starts_with("/baseline")
            || p.starts_with("/ovos")
        {
            Self::Normal
        } else {
            Self::Default
        }
    }
}

impl std::fmt::Display for RateCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Request Limiter
// ============================================================================

/// Outcome of one limiter check, also the source of the X-RateLimit headers.
#[derive(Debug, Clone)]
pub struct RateDecision {
    pub allowed: bool,
    pub category: RateCategory,
    pub limit: u32,
    /// Requests left in the current window (0 when denied).
    pub remaining: u32,
    /// Seconds until the window resets.
    pub reset_secs: u64,
    /// The cross-category cap tripped rather than the category budget.
    pub global_exceeded: bool,
}

impl RateDecision {
    fn bypass(category: RateCategory, limit: u32) -> Self {
        Self {
            allowed: true,
            category,
            limit,
            remaining: limit,
            reset_secs: WINDOW_SECS,
            global_exceeded: false,
        }
    }
}

/// Redis-backed sliding-window limiter.
pub struct RateLimiter {
    conn: Option<MultiplexedConnection>,
    config: RateLimitConfig,
}

impl RateLimiter {
    /// Connect the counter store; a failure degrades to fail-open.
    pub async fn connect(bus_url: &str, config: RateLimitConfig) -> Self {
        let conn = match redis::Client::open(bus_url) {
            Ok(client) => match client.get_multiplexed_async_connection().await {
                Ok(conn) => {
                    info!("Rate-limit counters connected");
                    Some(conn)
                }
                Err(e) => {
                    warn!(error = %e, "rate-limit counter store unreachable — limiter fails open");
                    None
                }
            },
            Err(e) => {
                warn!(error = %e, "invalid rate-limit store URL — limiter fails open");
                None
            }
        };
        Self { conn, config }
    }

    /// A limiter with no backing store (tests; always allows).
    pub fn disabled(config: RateLimitConfig) -> Self {
        Self { conn: None, config }
    }

    pub fn is_whitelisted(&self, ip: IpAddr) -> bool {
        self.config.whitelist.contains(&ip)
    }

    /// Check and count one request.
    pub async fn check(&self, ip: IpAddr, category: RateCategory) -> RateDecision {
        let limit = category.limit(&self.config);
        if self.is_whitelisted(ip) {
            return RateDecision::bypass(category, limit);
        }
        let Some(conn) = &self.conn else {
            return RateDecision::bypass(category, limit);
        };

        let now = Utc::now().timestamp() as u64;
        let window = now / WINDOW_SECS;
        let reset_secs = WINDOW_SECS - (now % WINDOW_SECS);

        let category_key = format!("ratelimit:{ip}:{category}:{window}");
        let global_key = format!("ratelimit:{ip}:global:{window}");

        // INCR + EXPIRE pipelined; the extra window of expiry tolerates
        // clock skew between callers.
        let mut conn = conn.clone();
        let counts: Result<(u32, u32), redis::RedisError> = redis::pipe()
            .atomic()
            .incr(&category_key, 1u32)
            .expire(&category_key, (WINDOW_SECS * 2) as i64)
            .ignore()
            .incr(&global_key, 1u32)
            .expire(&global_key, (WINDOW_SECS * 2) as i64)
            .ignore()
            .query_async(&mut conn)
            .await;

        match counts {
            Ok((category_count, global_count)) => {
                let over_category = category_count > limit;
                let over_global = global_count > self.config.global;
                let remaining = limit.saturating_sub(category_count);
                if over_category || over_global {
                    debug!(
                        ip = %ip,
                        category = %category,
                        category_count,
                        global_count,
                        "rate limit exceeded"
                    );
                }
                RateDecision {
                    allowed: !(over_category || over_global),
                    category,
                    limit,
                    remaining,
                    reset_secs,
                    global_exceeded: over_global && !over_category,
                }
            }
            Err(e) => {
                warn!(error = %e, "rate-limit counter update failed — allowing request");
                RateDecision::bypass(category, limit)
            }
        }
    }
}

// ============================================================================
// Connection Throttle
// ============================================================================

/// In-process cap on concurrently open requests.
pub struct ConnectionThrottle {
    per_ip: DashMap<IpAddr, usize>,
    total: AtomicUsize,
    config: ThrottleConfig,
}

impl ConnectionThrottle {
    pub fn new(config: ThrottleConfig) -> Self {
        Self {
            per_ip: DashMap::new(),
            total: AtomicUsize::new(0),
            config,
        }
    }

    /// Claim a slot for `ip`. The returned guard releases it on drop.
    pub fn acquire(self: &Arc<Self>, ip: IpAddr) -> Result<ConnectionGuard, CoreError> {
        let total = self.total.fetch_add(1, Ordering::SeqCst) + 1;
        if total > self.config.max_total {
            self.total.fetch_sub(1, Ordering::SeqCst);
            return Err(CoreError::TooManyConnections { retry_after: 5 });
        }

        let mut entry = self.per_ip.entry(ip).or_insert(0);
        if *entry >= self.config.max_per_ip {
            drop(entry);
            self.total.fetch_sub(1, Ordering::SeqCst);
            return Err(CoreError::TooManyConnections { retry_after: 5 });
        }
        *entry += 1;
        drop(entry);

        Ok(ConnectionGuard {
            throttle: Arc::clone(self),
            ip,
        })
    }

    pub fn total_open(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }

    /// Open connections per IP, for `/stats/connections`.
    pub fn snapshot(&self) -> HashMap<IpAddr, usize> {
        self.per_ip
            .iter()
            .filter(|e| *e.value() > 0)
            .map(|e| (*e.key(), *e.value()))
            .collect()
    }

    fn release(&self, ip: IpAddr) {
        self.total.fetch_sub(1, Ordering::SeqCst);
        if let Some(mut entry) = self.per_ip.get_mut(&ip) {
            *entry = entry.saturating_sub(1);
        }
    }
}

/// RAII slot holder; dropping it releases the connection.
pub struct ConnectionGuard {
    throttle: Arc<ConnectionThrottle>,
    ip: IpAddr,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.throttle.release(self.ip);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(last: u8) -> IpAddr {
        IpAddr::from([10, 0, 0, last])
    }

    #[test]
    fn path_categories() {
        assert_eq!(RateCategory::for_path("/api/v1/health"), RateCategory::Critical);
        assert_eq!(
            RateCategory::for_path("/api/v1/timeseries/latest/m1"),
            RateCategory::Critical
        );
        assert_eq!(
            RateCategory::for_path("/api/v1/baseline/train"),
            RateCategory::Heavy
        );
        assert_eq!(
            RateCategory::for_path("/api/v1/anomaly/detect"),
            RateCategory::Heavy
        );
        assert_eq!(
            RateCategory::for_path("/api/v1/anomaly/recent"),
            RateCategory::Normal
        );
        assert_eq!(RateCategory::for_path("/api/v1/machines"), RateCategory::Normal);
        assert_eq!(RateCategory::for_path("/docs"), RateCategory::Default);
    }

    #[tokio::test]
    async fn limiter_without_store_fails_open() {
        let limiter = RateLimiter::disabled(RateLimitConfig::default());
        for _ in 0..500 {
            let decision = limiter.check(ip(1), RateCategory::Heavy).await;
            assert!(decision.allowed);
        }
    }

    #[tokio::test]
    async fn whitelisted_ip_bypasses() {
        let mut config = RateLimitConfig::default();
        config.whitelist.insert(ip(9));
        let limiter = RateLimiter::disabled(config);
        assert!(limiter.is_whitelisted(ip(9)));
        assert!(!limiter.is_whitelisted(ip(8)));
        let decision = limiter.check(ip(9), RateCategory::Normal).await;
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 60);
    }

    #[test]
    fn throttle_enforces_per_ip_cap() {
        let throttle = Arc::new(ConnectionThrottle::new(ThrottleConfig {
            max_per_ip: 2,
            max_total: 100,
        }));

        let g1 = throttle.acquire(ip(1)).unwrap();
        let _g2 = throttle.acquire(ip(1)).unwrap();
        assert!(matches!(
            throttle.acquire(ip(1)),
            Err(CoreError::TooManyConnections { .. })
        ));
        // a different IP still gets in
        let _g3 = throttle.acquire(ip(2)).unwrap();

        // releasing frees the slot
        drop(g1);
        assert!(throttle.acquire(ip(1)).is_ok());
    }

    #[test]
    fn throttle_enforces_total_cap() {
        let throttle = Arc::new(ConnectionThrottle::new(ThrottleConfig {
            max_per_ip: 10,
            max_total: 3,
        }));
        let _g: Vec<_> = (0..3u8).map(|i| throttle.acquire(ip(i)).unwrap()).collect();
        assert_eq!(throttle.total_open(), 3);
        assert!(throttle.acquire(ip(99)).is_err());
        // the failed acquire must not leak a slot
        assert_eq!(throttle.total_open(), 3);
    }

    #[test]
    fn snapshot_reports_open_connections() {
        let throttle = Arc::new(ConnectionThrottle::new(ThrottleConfig::default()));
        let _a = throttle.acquire(ip(1)).unwrap();
        let _b = throttle.acquire(ip(1)).unwrap();
        let _c = throttle.acquire(ip(2)).unwrap();

        let snap = throttle.snapshot();
        assert_eq!(snap[&ip(1)], 2);
        assert_eq!(snap[&ip(2)], 1);
    }
}
