use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Server configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Listen address (default: 0.0.0.0:3000).
    pub bind: SocketAddr,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Directory holding the face-api.js weights served under `/models`.
    pub model_dir: PathBuf,
    /// Static client assets served for every other path.
    pub static_dir: PathBuf,
    /// Lifetime of an issued session token.
    pub token_ttl: Duration,
    /// Maximum number of login records returned by `/history`.
    pub history_limit: usize,
}

impl Config {
    /// Load configuration from `FACEGATE_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let data_dir = facegate_models::user_data_dir();

        let db_path = std::env::var("FACEGATE_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("auth.db"));

        // Same resolution as `facegate setup`, so both agree on where weights live.
        let model_dir = facegate_models::default_model_dir();

        let bind = std::env::var("FACEGATE_BIND")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 3000)));

        Self {
            bind,
            db_path,
            model_dir,
            static_dir: std::env::var("FACEGATE_STATIC_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("public")),
            token_ttl: Duration::from_secs(
                env_u64("FACEGATE_TOKEN_TTL_DAYS", 30).saturating_mul(24 * 60 * 60),
            ),
            history_limit: env_usize("FACEGATE_HISTORY_LIMIT", 10),
        }
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_values_fall_back_to_defaults() {
        std::env::set_var("FACEGATE_BIND", "not-an-address");
        std::env::set_var("FACEGATE_HISTORY_LIMIT", "25");
        std::env::set_var("FACEGATE_DB_PATH", "/tmp/facegate-test.db");
        let config = Config::from_env();
        std::env::remove_var("FACEGATE_BIND");
        std::env::remove_var("FACEGATE_HISTORY_LIMIT");
        std::env::remove_var("FACEGATE_DB_PATH");

        assert_eq!(config.bind, SocketAddr::from(([0, 0, 0, 0], 3000)));
        assert_eq!(config.history_limit, 25);
        assert_eq!(config.db_path, PathBuf::from("/tmp/facegate-test.db"));
        assert_eq!(config.token_ttl, Duration::from_secs(30 * 86_400));
        assert_eq!(config.model_dir, facegate_models::default_model_dir());

        // Kept in the same test: the environment is process-wide.
        std::env::set_var("FACEGATE_TOKEN_TTL_DAYS", u64::MAX.to_string());
        let config = Config::from_env();
        std::env::remove_var("FACEGATE_TOKEN_TTL_DAYS");
        assert_eq!(config.token_ttl, Duration::from_secs(u64::MAX));
    }
}
