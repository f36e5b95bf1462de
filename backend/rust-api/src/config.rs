use serde::Deserialize;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub mongo_uri: String,
    pub redis_uri: String,
    pub mongo_database: String,
    pub bind_addr: String,
    pub progress: ProgressConfig,
    pub events: EventsConfig,
    pub lock_ttl_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProgressConfig {
    pub url: String,
    pub timeout_ms: u64,
}

impl ProgressConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventsConfig {
    pub stream_prefix: String,
    pub max_len: u64,
}

impl Config {
    pub fn load() -> Result<Self, config::ConfigError> {
        // Root .env first (two levels up), local .env as a fallback
        let skip_root_env = env::var("SKIP_ROOT_ENV").is_ok();
        if skip_root_env {
            dotenvy::dotenv().ok();
        } else if dotenvy::from_path("../../.env").is_err() {
            dotenvy::dotenv().ok();
        }

        let env = env::var("APP_ENV").unwrap_or_else(|_| "dev".to_string());

        // config/*.toml, then APP__ prefixed overrides
        let settings = config::Config::builder()
            .add_source(config::File::with_name(&format!("config/{}", env)).required(false))
            .add_source(config::Environment::with_prefix("APP").separator("__"))
            .build()?;

        let mongo_uri = settings
            .get_string("database.mongo_uri")
            .or_else(|_| env::var("MONGO_URI"))
            .unwrap_or_else(|_| {
                // Multi-document transactions require a replica set
                "mongodb://localhost:27017/?replicaSet=rs0".to_string()
            });

        let redis_uri = settings
            .get_string("redis.uri")
            .or_else(|_| env::var("REDIS_URI"))
            .unwrap_or_else(|_| {
                let host = env::var("REDIS_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
                let port = env::var("REDIS_PORT").unwrap_or_else(|_| "6379".to_string());
                match env::var("REDIS_PASSWORD") {
                    Ok(password) => format!("redis://:{}@{}:{}/0", password, host, port),
                    Err(_) => format!("redis://{}:{}/0", host, port),
                }
            });

        let mongo_database = settings
            .get_string("database.mongo_database")
            .or_else(|_| env::var("MONGO_DATABASE"))
            .unwrap_or_else(|_| "assessments".to_string());

        let bind_addr = settings
            .get_string("server.bind_addr")
            .or_else(|_| env::var("BIND_ADDR"))
            .unwrap_or_else(|_| "0.0.0.0:8081".to_string());

        let progress_url = settings
            .get_string("progress.url")
            .or_else(|_| env::var("PROGRESS_SERVICE_URL"))
            .unwrap_or_else(|_| "http://localhost:8082".to_string());

        let progress_timeout_ms =
            numeric_setting(&settings, "progress.timeout_ms", "PROGRESS_TIMEOUT_MS", 3000)?;

        let stream_prefix = settings
            .get_string("events.stream_prefix")
            .or_else(|_| env::var("EVENTS_STREAM_PREFIX"))
            .unwrap_or_else(|_| "domain-events".to_string());

        let max_len = numeric_setting(&settings, "events.max_len", "EVENTS_STREAM_MAXLEN", 100_000)?;

        let lock_ttl_ms = numeric_setting(&settings, "locks.ttl_ms", "ATTEMPT_LOCK_TTL_MS", 10_000)?;

        Ok(Config {
            mongo_uri,
            redis_uri,
            mongo_database,
            bind_addr,
            progress: ProgressConfig {
                url: progress_url.trim_end_matches('/').to_string(),
                timeout_ms: progress_timeout_ms,
            },
            events: EventsConfig {
                stream_prefix,
                max_len,
            },
            lock_ttl_ms,
        })
    }
}

/// Reads an unsigned setting from the layered config, then the plain env var.
/// A value that is present but not a positive integer is a configuration error.
fn numeric_setting(
    settings: &config::Config,
    key: &str,
    env_key: &str,
    default: u64,
) -> Result<u64, config::ConfigError> {
    let raw = match settings.get_string(key) {
        Ok(value) => Some(value),
        Err(_) => env::var(env_key).ok(),
    };

    match raw {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse::<u64>()
            .ok()
            .filter(|v| *v > 0)
            .ok_or_else(|| {
                config::ConfigError::Message(format!(
                    "{} must be a positive integer, got {:?}",
                    key, value
                ))
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn load_uses_defaults() {
        std::env::set_var("SKIP_ROOT_ENV", "1");
        std::env::remove_var("PROGRESS_TIMEOUT_MS");
        std::env::remove_var("PROGRESS_SERVICE_URL");
        std::env::remove_var("MONGO_DATABASE");

        let config = Config::load().unwrap();
        assert_eq!(config.progress.timeout_ms, 3000);
        assert_eq!(config.mongo_database, "assessments");
        assert_eq!(config.events.stream_prefix, "domain-events");
        assert_eq!(config.progress.timeout(), Duration::from_secs(3));
    }

    #[test]
    #[serial]
    fn progress_url_trailing_slash_is_trimmed() {
        std::env::set_var("SKIP_ROOT_ENV", "1");
        std::env::set_var("PROGRESS_SERVICE_URL", "http://progress.local/");

        let config = Config::load().unwrap();
        assert_eq!(config.progress.url, "http://progress.local");

        std::env::remove_var("PROGRESS_SERVICE_URL");
    }

    #[test]
    #[serial]
    fn invalid_timeout_is_rejected() {
        std::env::set_var("SKIP_ROOT_ENV", "1");
        std::env::set_var("PROGRESS_TIMEOUT_MS", "soon");

        assert!(Config::load().is_err());

        std::env::remove_var("PROGRESS_TIMEOUT_MS");
    }
}
