//! Service configuration — environment variables, defaults, validation
//!
//! Every recognized key is read once at startup by [`AppConfig::from_env`];
//! the resulting struct is immutable and travels inside `CoreContext`.
//!
//! ## Recognized keys
//!
//! | Key | Effect |
//! |-----|--------|
//! | `DATABASE_URL` / `DB_HOST..DB_POOL_SIZE` | Store location and pool size |
//! | `BUS_HOST/PORT/PASSWORD/DB` | Event bus endpoint |
//! | `BUS_PUBSUB_ENABLED` | Disable event delivery without disabling WS |
//! | `WEBSOCKET_ENABLED` | Toggle WS endpoints |
//! | `WEBSOCKET_HEARTBEAT_INTERVAL` | Seconds between server heartbeats |
//! | `WEBSOCKET_MAX_CONNECTIONS` | Total client cap |
//! | `RATE_LIMITS` | `critical=100,normal=60,heavy=20,default=30,global=120` |
//! | `WHITELIST` | Comma-separated IPs bypassing the rate limiter |
//! | `TARIFF_PEAK` / `TARIFF_OFF_PEAK` | Cost per kWh |
//! | `CARBON_FACTOR` | kg CO₂ per kWh |
//! | `SCHEDULER_ENABLED` | Toggle all periodic jobs |
//! | `MODEL_DIR` | On-disk blob path for baselines |

use std::collections::HashSet;
use std::net::IpAddr;
use std::path::PathBuf;

use tracing::warn;

/// Hard ceiling on the store pool regardless of configuration.
pub const MAX_POOL_SIZE: u32 = 30;

/// Store connection settings.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Full connection URL; assembled from `DB_*` parts when `DATABASE_URL`
    /// is not set.
    pub url: String,
    pub pool_size: u32,
}

/// Redis event-bus settings (pub/sub channels + rate-limit counters).
#[derive(Debug, Clone)]
pub struct BusConfig {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub db: i64,
    /// When false the subscriber never starts; WS endpoints still work but
    /// receive no events.
    pub pubsub_enabled: bool,
}

impl BusConfig {
    /// redis:// connection URL.
    pub fn url(&self) -> String {
        match &self.password {
            Some(pw) => format!("redis://:{}@{}:{}/{}", pw, self.host, self.port, self.db),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }
}

/// WebSocket fan-out settings.
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    pub enabled: bool,
    pub heartbeat_interval_secs: u64,
    pub max_connections: usize,
}

/// Per-category request budgets (requests per minute per IP).
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub critical: u32,
    pub normal: u32,
    pub heavy: u32,
    pub default: u32,
    /// Cross-category cap per IP.
    pub global: u32,
    /// IPs that skip the limiter entirely.
    pub whitelist: HashSet<IpAddr>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            critical: 100,
            normal: 60,
            heavy: 20,
            default: 30,
            global: 120,
            whitelist: HashSet::new(),
        }
    }
}

/// Concurrent-connection throttle caps.
#[derive(Debug, Clone)]
pub struct ThrottleConfig {
    pub max_per_ip: usize,
    pub max_total: usize,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            max_per_ip: 10,
            max_total: 100,
        }
    }
}

/// Time-of-use tariff rates (currency per kWh).
#[derive(Debug, Clone, Copy)]
pub struct TariffConfig {
    pub peak: f64,
    pub off_peak: f64,
}

/// Application configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// HTTP/WS bind address.
    pub bind_address: String,
    pub db: DbConfig,
    pub bus: BusConfig,
    pub websocket: WebSocketConfig,
    pub rate_limits: RateLimitConfig,
    pub throttle: ThrottleConfig,
    pub tariff: TariffConfig,
    /// Default emission factor, kg CO₂ per kWh.
    pub carbon_factor: f64,
    pub scheduler_enabled: bool,
    /// Directory for baseline model blobs.
    pub model_dir: PathBuf,
    /// Isolation-forest contamination (expected anomaly fraction).
    pub anomaly_contamination: f64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8000".to_string(),
            db: DbConfig {
                url: String::new(),
                pool_size: 20,
            },
            bus: BusConfig {
                host: "localhost".to_string(),
                port: 6379,
                password: None,
                db: 0,
                pubsub_enabled: true,
            },
            websocket: WebSocketConfig {
                enabled: true,
                heartbeat_interval_secs: 30,
                max_connections: 500,
            },
            rate_limits: RateLimitConfig::default(),
            throttle: ThrottleConfig::default(),
            tariff: TariffConfig {
                peak: 0.18,
                off_peak: 0.10,
            },
            carbon_factor: 0.4,
            scheduler_enabled: true,
            model_dir: PathBuf::from("models"),
            anomaly_contamination: 0.1,
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables with CLI overrides.
    ///
    /// Returns an error when no database location is configured at all;
    /// every other key falls back to a documented default.
    pub fn from_env(
        database_url: Option<String>,
        bind_address: Option<String>,
        port: Option<u16>,
    ) -> anyhow::Result<Self> {
        let mut config = Self::default();

        // Bind address: CLI --bind-address or --port
        if let Some(addr) = bind_address {
            config.bind_address = addr;
        } else if let Some(p) = port {
            config.bind_address = format!("0.0.0.0:{p}");
        } else if let Ok(addr) = std::env::var("ENMS_BIND_ADDRESS") {
            config.bind_address = addr;
        }

        // Database URL: CLI arg > DATABASE_URL > DB_* parts
        config.db.url = match database_url.or_else(|| std::env::var("DATABASE_URL").ok()) {
            Some(url) => url,
            None => assemble_db_url()?,
        };
        if let Some(n) = env_parse::<u32>("DB_POOL_SIZE") {
            config.db.pool_size = n.min(MAX_POOL_SIZE);
        }

        // Event bus
        if let Ok(host) = std::env::var("BUS_HOST") {
            config.bus.host = host;
        }
        if let Some(p) = env_parse::<u16>("BUS_PORT") {
            config.bus.port = p;
        }
        config.bus.password = std::env::var("BUS_PASSWORD").ok().filter(|p| !p.is_empty());
        if let Some(db) = env_parse::<i64>("BUS_DB") {
            config.bus.db = db;
        }
        if let Some(enabled) = env_parse::<bool>("BUS_PUBSUB_ENABLED") {
            config.bus.pubsub_enabled = enabled;
        }

        // WebSocket
        if let Some(enabled) = env_parse::<bool>("WEBSOCKET_ENABLED") {
            config.websocket.enabled = enabled;
        }
        if let Some(secs) = env_parse::<u64>("WEBSOCKET_HEARTBEAT_INTERVAL") {
            config.websocket.heartbeat_interval_secs = secs.max(1);
        }
        if let Some(n) = env_parse::<usize>("WEBSOCKET_MAX_CONNECTIONS") {
            config.websocket.max_connections = n;
        }

        // Rate limits + whitelist
        if let Ok(spec) = std::env::var("RATE_LIMITS") {
            parse_rate_limits(&spec, &mut config.rate_limits);
        }
        if let Ok(list) = std::env::var("WHITELIST") {
            config.rate_limits.whitelist = parse_whitelist(&list);
        }

        // Tariff + carbon
        if let Some(v) = env_parse::<f64>("TARIFF_PEAK") {
            config.tariff.peak = v;
        }
        if let Some(v) = env_parse::<f64>("TARIFF_OFF_PEAK") {
            config.tariff.off_peak = v;
        }
        if let Some(v) = env_parse::<f64>("CARBON_FACTOR") {
            config.carbon_factor = v;
        }

        // Scheduler + models + detection
        if let Some(enabled) = env_parse::<bool>("SCHEDULER_ENABLED") {
            config.scheduler_enabled = enabled;
        }
        if let Ok(dir) = std::env::var("MODEL_DIR") {
            config.model_dir = PathBuf::from(dir);
        }
        if let Some(v) = env_parse::<f64>("ANOMALY_CONTAMINATION") {
            if (0.0..0.5).contains(&v) {
                config.anomaly_contamination = v;
            } else {
                warn!(value = v, "ANOMALY_CONTAMINATION outside [0, 0.5) — keeping default");
            }
        }

        Ok(config)
    }
}

/// Assemble a postgres:// URL from the `DB_*` part variables.
fn assemble_db_url() -> anyhow::Result<String> {
    let host = std::env::var("DB_HOST").ok();
    let Some(host) = host else {
        anyhow::bail!(
            "no database configured: set DATABASE_URL or the DB_HOST/DB_PORT/DB_NAME/DB_USER/DB_PASSWORD variables"
        );
    };
    let port = std::env::var("DB_PORT").unwrap_or_else(|_| "5432".to_string());
    let name = std::env::var("DB_NAME").unwrap_or_else(|_| "enms".to_string());
    let user = std::env::var("DB_USER").unwrap_or_else(|_| "enms".to_string());
    let password = std::env::var("DB_PASSWORD").unwrap_or_default();
    Ok(format!("postgres://{user}:{password}@{host}:{port}/{name}"))
}

/// Parse one env var, warning (not failing) on malformed values.
fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key, value = %raw, "unparseable value — keeping default");
            None
        }
    }
}

/// Parse `critical=100,normal=60,heavy=20,default=30,global=120`.
/// Unknown categories and malformed entries are warned about and skipped.
fn parse_rate_limits(spec: &str, limits: &mut RateLimitConfig) {
    for entry in spec.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let Some((category, value)) = entry.split_once('=') else {
            warn!(entry, "RATE_LIMITS entry missing '=' — skipping");
            continue;
        };
        let Ok(n) = value.trim().parse::<u32>() else {
            warn!(entry, "RATE_LIMITS entry is not a number — skipping");
            continue;
        };
        match category.trim() {
            "critical" => limits.critical = n,
            "normal" => limits.normal = n,
            "heavy" => limits.heavy = n,
            "default" => limits.default = n,
            "global" => limits.global = n,
            other => warn!(category = other, "unknown RATE_LIMITS category — skipping"),
        }
    }
}

/// Parse a comma-separated IP whitelist, skipping unparseable entries.
fn parse_whitelist(list: &str) -> HashSet<IpAddr> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|s| match s.parse() {
            Ok(ip) => Some(ip),
            Err(_) => {
                warn!(entry = s, "WHITELIST entry is not an IP address — skipping");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_limits() {
        let limits = RateLimitConfig::default();
        assert_eq!(limits.critical, 100);
        assert_eq!(limits.normal, 60);
        assert_eq!(limits.heavy, 20);
        assert_eq!(limits.default, 30);
        assert_eq!(limits.global, 120);

        let throttle = ThrottleConfig::default();
        assert_eq!(throttle.max_per_ip, 10);
        assert_eq!(throttle.max_total, 100);
    }

    #[test]
    fn parse_rate_limits_overrides_selected_categories() {
        let mut limits = RateLimitConfig::default();
        parse_rate_limits("heavy=5, global=200", &mut limits);
        assert_eq!(limits.heavy, 5);
        assert_eq!(limits.global, 200);
        // untouched categories keep defaults
        assert_eq!(limits.normal, 60);
    }

    #[test]
    fn parse_rate_limits_skips_garbage() {
        let mut limits = RateLimitConfig::default();
        parse_rate_limits("nonsense,heavy=abc,unknown=7,critical=42", &mut limits);
        assert_eq!(limits.critical, 42);
        assert_eq!(limits.heavy, 20);
    }

    #[test]
    fn parse_whitelist_accepts_v4_and_v6() {
        let set = parse_whitelist("127.0.0.1, ::1, not-an-ip");
        assert_eq!(set.len(), 2);
        assert!(set.contains(&"127.0.0.1".parse::<IpAddr>().unwrap()));
        assert!(set.contains(&"::1".parse::<IpAddr>().unwrap()));
    }

    #[test]
    fn bus_url_with_and_without_password() {
        let mut bus = BusConfig {
            host: "redis.internal".to_string(),
            port: 6380,
            password: None,
            db: 2,
            pubsub_enabled: true,
        };
        assert_eq!(bus.url(), "redis://redis.internal:6380/2");
        bus.password = Some("s3cret".to_string());
        assert_eq!(bus.url(), "redis://:s3cret@redis.internal:6380/2");
    }
}
