//! Connection pool setup and health reporting.

use std::time::{Duration, Instant};

use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{debug, info, warn};

use termscope_core::{Error, Result};

pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;
pub const DEFAULT_MIN_CONNECTIONS: u32 = 1;
pub const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 600;
pub const DEFAULT_MAX_LIFETIME_SECS: u64 = 1_800;

/// Sizing and timeouts for the Postgres pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub max_connections: u32,
    pub min_connections: u32,
    /// How long a caller waits for a free connection.
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    /// `None` keeps connections open indefinitely.
    pub max_lifetime: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            min_connections: DEFAULT_MIN_CONNECTIONS,
            acquire_timeout: Duration::from_secs(DEFAULT_ACQUIRE_TIMEOUT_SECS),
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
            max_lifetime: Some(Duration::from_secs(DEFAULT_MAX_LIFETIME_SECS)),
        }
    }
}

impl PoolConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `DATABASE_MAX_CONNECTIONS` | `10` | Pool upper bound |
    /// | `DATABASE_MIN_CONNECTIONS` | `1` | Connections kept warm |
    /// | `DATABASE_ACQUIRE_TIMEOUT_SECS` | `30` | Wait for a free connection |
    /// | `DATABASE_IDLE_TIMEOUT_SECS` | `600` | Close idle connections after |
    /// | `DATABASE_MAX_LIFETIME_SECS` | `1800` | Recycle connections after; `0` disables |
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let base = Self::default();
        let number = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());
        let secs = |key: &str, fallback: Duration| {
            number(key).map(Duration::from_secs).unwrap_or(fallback)
        };

        let max_connections = number("DATABASE_MAX_CONNECTIONS")
            .and_then(|v| u32::try_from(v).ok())
            .filter(|v| *v > 0)
            .unwrap_or(base.max_connections);
        let min_connections = number("DATABASE_MIN_CONNECTIONS")
            .and_then(|v| u32::try_from(v).ok())
            .unwrap_or(base.min_connections)
            .min(max_connections);
        let max_lifetime = match number("DATABASE_MAX_LIFETIME_SECS") {
            Some(0) => None,
            Some(v) => Some(Duration::from_secs(v)),
            None => base.max_lifetime,
        };

        Self {
            max_connections,
            min_connections,
            acquire_timeout: secs("DATABASE_ACQUIRE_TIMEOUT_SECS", base.acquire_timeout),
            idle_timeout: secs("DATABASE_IDLE_TIMEOUT_SECS", base.idle_timeout),
            max_lifetime,
        }
    }

    pub fn with_max_connections(mut self, n: u32) -> Self {
        self.max_connections = n.max(1);
        self.min_connections = self.min_connections.min(self.max_connections);
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    fn options(&self) -> PgPoolOptions {
        PgPoolOptions::new()
            .max_connections(self.max_connections)
            .min_connections(self.min_connections)
            .acquire_timeout(self.acquire_timeout)
            .idle_timeout(self.idle_timeout)
            .max_lifetime(self.max_lifetime)
    }
}

/// Connect with [`PoolConfig::default`].
pub async fn create_pool(database_url: &str) -> Result<PgPool> {
    create_pool_with_config(database_url, PoolConfig::default()).await
}

pub async fn create_pool_with_config(database_url: &str, config: PoolConfig) -> Result<PgPool> {
    let start = Instant::now();
    let pool = config
        .options()
        .connect(database_url)
        .await
        .map_err(Error::Database)?;

    info!(
        subsystem = "db",
        component = "pool",
        op = "connect",
        max_connections = config.max_connections,
        min_connections = config.min_connections,
        acquire_timeout_secs = config.acquire_timeout.as_secs(),
        duration_ms = start.elapsed().as_millis() as u64,
        "Database pool ready"
    );
    Ok(pool)
}

/// Point-in-time pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub size: u32,
    pub idle: usize,
}

impl PoolStats {
    pub fn of(pool: &PgPool) -> Self {
        Self {
            size: pool.size(),
            idle: pool.num_idle(),
        }
    }

    /// Every open connection is checked out.
    pub fn is_saturated(&self) -> bool {
        self.size > 0 && self.idle == 0
    }
}

/// Log pool occupancy at DEBUG, or WARN when saturated.
pub fn log_pool_metrics(pool: &PgPool) -> PoolStats {
    let stats = PoolStats::of(pool);
    if stats.is_saturated() {
        warn!(
            subsystem = "db",
            component = "pool",
            pool_size = stats.size,
            "No idle database connections"
        );
    } else {
        debug!(
            subsystem = "db",
            component = "pool",
            pool_size = stats.size,
            pool_idle = stats.idle,
            "Pool occupancy"
        );
    }
    stats
}
