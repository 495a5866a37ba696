use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Broker REST endpoints and request bounds.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// AngelOne SmartAPI base URL.
    pub angel_one_base_url: String,
    /// Dhan v2 API base URL.
    pub dhan_base_url: String,
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
}

impl BrokerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            angel_one_base_url: "https://apiconnect.angelone.in".to_string(),
            dhan_base_url: "https://api.dhan.co/v2".to_string(),
            timeout_secs: 10,
        }
    }
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host address.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// SQLite database path.
    pub database_path: String,
    /// Scheduler tick interval in seconds (default: 60).
    pub scheduler_interval_secs: u64,
    /// Order queue drain interval in seconds (default: 5).
    pub dispatch_interval_secs: u64,
    /// Volatility (percent) applied to every underlying when set.
    pub default_volatility: Option<f64>,
    /// Re-register strategies persisted as active on startup.
    pub restore_active_on_startup: bool,
    pub broker: BrokerConfig,
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let broker = BrokerConfig {
            angel_one_base_url: env::var("ANGEL_ONE_BASE_URL")
                .unwrap_or(defaults.broker.angel_one_base_url),
            dhan_base_url: env::var("DHAN_BASE_URL").unwrap_or(defaults.broker.dhan_base_url),
            timeout_secs: env_or("BROKER_TIMEOUT_SECS", defaults.broker.timeout_secs),
        };

        Self {
            host: env::var("HOST").unwrap_or(defaults.host),
            port: env_or("PORT", defaults.port),
            database_path: env::var("DATABASE_PATH").unwrap_or(defaults.database_path),
            scheduler_interval_secs: env_or(
                "SCHEDULER_INTERVAL_SECS",
                defaults.scheduler_interval_secs,
            ),
            dispatch_interval_secs: env_or("DISPATCH_INTERVAL_SECS", defaults.dispatch_interval_secs),
            default_volatility: env::var("DEFAULT_VOLATILITY")
                .ok()
                .and_then(|v| v.trim().parse().ok())
                .filter(|v: &f64| *v > 0.0),
            restore_active_on_startup: env_or(
                "RESTORE_ACTIVE_ON_STARTUP",
                defaults.restore_active_on_startup,
            ),
            broker,
        }
    }

    pub fn scheduler_interval(&self) -> Duration {
        Duration::from_secs(self.scheduler_interval_secs.max(1))
    }

    pub fn dispatch_interval(&self) -> Duration {
        Duration::from_secs(self.dispatch_interval_secs.max(1))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3001,
            database_path: "data/algodesk.db".to_string(),
            scheduler_interval_secs: 60,
            dispatch_interval_secs: 5,
            default_volatility: None,
            restore_active_on_startup: true,
            broker: BrokerConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.scheduler_interval(), Duration::from_secs(60));
        assert_eq!(config.dispatch_interval(), Duration::from_secs(5));
        assert_eq!(config.broker.timeout(), Duration::from_secs(10));
        assert!(config.restore_active_on_startup);
        assert!(config.default_volatility.is_none());
    }

    #[test]
    fn test_zero_intervals_are_clamped() {
        let config = Config {
            scheduler_interval_secs: 0,
            dispatch_interval_secs: 0,
            ..Config::default()
        };
        assert_eq!(config.scheduler_interval(), Duration::from_secs(1));
        assert_eq!(config.dispatch_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_env_or_falls_back_on_garbage() {
        env::set_var("ALGODESK_TEST_PORT", "not-a-number");
        assert_eq!(env_or("ALGODESK_TEST_PORT", 8080u16), 8080);
        env::set_var("ALGODESK_TEST_PORT", " 9000 ");
        assert_eq!(env_or("ALGODESK_TEST_PORT", 8080u16), 9000);
        env::remove_var("ALGODESK_TEST_PORT");
    }
}
