use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Result, SkeeError};

/// Process configuration, resolved from the environment.
///
/// Every service (`api`, `scheduler`, `executor`) loads the same config; each
/// one uses the subset it needs.
#[derive(Debug, Clone)]
pub struct Config {
    pub db_host: String,
    pub db_port: u16,
    pub db_user: String,
    pub db_password: String,
    pub db_name: String,
    pub scheduler_interval: Duration,
    pub reconcile_interval: Duration,
    pub leader_election_ttl: Duration,
    pub api_port: u16,
    pub ai_service_url: String,
    pub log_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_host: "localhost".to_string(),
            db_port: 5432,
            db_user: "skeenode".to_string(),
            db_password: "password".to_string(),
            db_name: "skeenode".to_string(),
            scheduler_interval: Duration::from_secs(10),
            reconcile_interval: Duration::from_secs(30),
            leader_election_ttl: Duration::from_secs(15),
            api_port: 8080,
            ai_service_url: "http://localhost:8000".to_string(),
            log_dir: PathBuf::from("/tmp/skeenode-logs"),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Config::default();
        Self {
            db_host: get_env("DB_HOST", &defaults.db_host),
            db_port: get_env_parsed("DB_PORT", defaults.db_port),
            db_user: get_env("DB_USER", &defaults.db_user),
            db_password: get_env("DB_PASSWORD", &defaults.db_password),
            db_name: get_env("DB_NAME", &defaults.db_name),
            scheduler_interval: get_env_duration(
                "SCHEDULER_INTERVAL",
                defaults.scheduler_interval,
            ),
            reconcile_interval: defaults.reconcile_interval,
            leader_election_ttl: Duration::from_secs(get_env_parsed("LEADER_ELECTION_TTL", 15)),
            api_port: get_env_parsed("API_PORT", defaults.api_port),
            ai_service_url: get_env("AI_SERVICE_URL", &defaults.ai_service_url),
            log_dir: PathBuf::from(get_env("LOG_DIR", "/tmp/skeenode-logs")),
        }
    }

    /// Connection string for the sqlx pool.
    pub fn database_url(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.db_user, self.db_password, self.db_host, self.db_port, self.db_name
        )
    }
}

fn get_env(key: &str, fallback: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| fallback.to_string())
}

fn get_env_parsed<T: std::str::FromStr>(key: &str, fallback: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(fallback)
}

fn get_env_duration(key: &str, fallback: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| parse_duration(&v).ok())
        .unwrap_or(fallback)
}

/// Parse a Go-style duration string: `500ms`, `10s`, `5m`, `1h`.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .ok_or_else(|| SkeeError::Config(format!("duration missing unit: {s:?}")))?;
    let (value, unit) = s.split_at(split);
    let value: f64 = value
        .parse()
        .map_err(|_| SkeeError::Config(format!("invalid duration value: {s:?}")))?;
    let millis = match unit {
        "ms" => value,
        "s" => value * 1_000.0,
        "m" => value * 60_000.0,
        "h" => value * 3_600_000.0,
        _ => return Err(SkeeError::Config(format!("invalid duration unit: {s:?}"))),
    };
    Ok(Duration::from_millis(millis as u64))
}
