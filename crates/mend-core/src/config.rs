use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Runtime configuration, assembled from environment variables.
///
/// Every field has a default so the server can boot in a development
/// environment with nothing set. Numeric variables that fail to parse fall
/// back to the default with a warning rather than aborting startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub repo: RepoConfig,
    #[serde(default)]
    pub tests: TestConfig,
    #[serde(default)]
    pub hosting: HostingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            model: ModelConfig::default(),
            db: DbConfig::default(),
            breaker: BreakerConfig::default(),
            repo: RepoConfig::default(),
            tests: TestConfig::default(),
            hosting: HostingConfig::default(),
        }
    }
}

impl Config {
    /// Assemble configuration from the process environment.
    pub fn from_env() -> Self {
        Self {
            server: ServerConfig {
                port: env_parse("PORT", default_port()),
                host: default_host(),
            },
            model: ModelConfig {
                api_key: std::env::var("MODEL_API_KEY").ok(),
                base_url: std::env::var("MODEL_BASE_URL").unwrap_or_else(|_| default_base_url()),
                model: std::env::var("MODEL_NAME").unwrap_or_else(|_| default_model()),
                timeout: Duration::from_millis(env_parse("MODEL_TIMEOUT_MS", 30_000)),
            },
            db: DbConfig {
                mode: match std::env::var("DB_MODE").as_deref() {
                    Ok("file") => DbMode::File,
                    _ => DbMode::Memory,
                },
                data_dir: std::env::var("DB_DATA_DIR")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| default_data_dir()),
            },
            breaker: BreakerConfig {
                max_daily_tokens: env_parse("MAX_DAILY_TOKENS", default_max_daily_tokens()),
                max_task_tokens: env_parse("MAX_TASK_TOKENS", default_max_task_tokens()),
                max_concurrent_tasks: env_parse(
                    "MAX_CONCURRENT_TASKS",
                    default_max_concurrent_tasks(),
                ),
                max_retries: env_parse("MAX_RETRIES", default_max_retries()),
                token_window: Duration::from_millis(env_parse(
                    "TOKEN_WINDOW_MS",
                    86_400_000u64,
                )),
                half_open_interval: Duration::from_millis(env_parse(
                    "HALF_OPEN_INTERVAL_MS",
                    600_000u64,
                )),
                trip_threshold: env_parse("TRIP_THRESHOLD", default_trip_threshold()),
            },
            repo: RepoConfig {
                url: std::env::var("REPO_URL").ok(),
                work_dir: std::env::var("WORK_DIR")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| default_work_dir()),
                snapshot_capacity: env_parse("SNAPSHOT_CAPACITY", default_snapshot_capacity()),
            },
            tests: TestConfig {
                chrome_path: std::env::var("CHROME_PATH").map(PathBuf::from).ok(),
                base_url: std::env::var("TEST_BASE_URL")
                    .unwrap_or_else(|_| default_test_base_url()),
                min_cases: env_parse("MIN_TEST_CASES", default_min_cases()),
                case_timeout: Duration::from_millis(env_parse("TEST_CASE_TIMEOUT_MS", 30_000)),
            },
            hosting: HostingConfig {
                token: std::env::var("GITHUB_TOKEN").ok(),
                owner: std::env::var("GITHUB_OWNER").ok(),
                repo: std::env::var("GITHUB_REPO").ok(),
            },
        }
    }
}

fn env_parse<T: std::str::FromStr + Copy + std::fmt::Display>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => match raw.parse::<T>() {
            Ok(v) => v,
            Err(_) => {
                tracing::warn!(%key, value = %raw, %default, "unparsable env var, using default");
                default
            }
        },
        Err(_) => default,
    }
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Bearer token for the model vendor. `None` means the server can only
    /// run with a mock provider (tests, dry runs).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// Hard per-call timeout.
    #[serde(default = "default_model_timeout", with = "duration_ms")]
    pub timeout: Duration,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: default_base_url(),
            model: default_model(),
            timeout: default_model_timeout(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DbMode {
    Memory,
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbConfig {
    #[serde(default = "default_db_mode")]
    pub mode: DbMode,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            mode: default_db_mode(),
            data_dir: default_data_dir(),
        }
    }
}

/// Admission-control thresholds. See `mend-harness` for semantics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    #[serde(default = "default_max_daily_tokens")]
    pub max_daily_tokens: u64,
    #[serde(default = "default_max_task_tokens")]
    pub max_task_tokens: u64,
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Rolling window for the daily token bucket.
    #[serde(default = "default_token_window", with = "duration_ms")]
    pub token_window: Duration,
    /// How long the circuit stays open before admitting a probe.
    #[serde(default = "default_half_open_interval", with = "duration_ms")]
    pub half_open_interval: Duration,
    /// Denials within 60 s that trip the circuit.
    #[serde(default = "default_trip_threshold")]
    pub trip_threshold: usize,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            max_daily_tokens: default_max_daily_tokens(),
            max_task_tokens: default_max_task_tokens(),
            max_concurrent_tasks: default_max_concurrent_tasks(),
            max_retries: default_max_retries(),
            token_window: default_token_window(),
            half_open_interval: default_half_open_interval(),
            trip_threshold: default_trip_threshold(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoConfig {
    /// Remote to clone. `None` leaves the working tree uninitialized until
    /// a local fixture is placed at `work_dir`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    #[serde(default = "default_snapshot_capacity")]
    pub snapshot_capacity: usize,
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self {
            url: None,
            work_dir: default_work_dir(),
            snapshot_capacity: default_snapshot_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestConfig {
    /// Explicit browser binary. When unset, well-known install locations
    /// are probed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chrome_path: Option<PathBuf>,
    #[serde(default = "default_test_base_url")]
    pub base_url: String,
    #[serde(default = "default_min_cases")]
    pub min_cases: usize,
    #[serde(default = "default_case_timeout", with = "duration_ms")]
    pub case_timeout: Duration,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            chrome_path: None,
            base_url: default_test_base_url(),
            min_cases: default_min_cases(),
            case_timeout: default_case_timeout(),
        }
    }
}

/// Git-hosting credentials for the pull-request adapter. All three must be
/// present for the real adapter; otherwise PRs are recorded locally.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostingConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo: Option<String>,
}

impl HostingConfig {
    pub fn is_configured(&self) -> bool {
        self.token.is_some() && self.owner.is_some() && self.repo.is_some()
    }
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

fn default_port() -> u16 {
    8787
}

fn default_host() -> String {
    "127.0.0.1".into()
}

fn default_base_url() -> String {
    "https://api.openai.com".into()
}

fn default_model() -> String {
    "gpt-4o-mini".into()
}

fn default_model_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_db_mode() -> DbMode {
    DbMode::Memory
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_max_daily_tokens() -> u64 {
    200_000
}

fn default_max_task_tokens() -> u64 {
    20_000
}

fn default_max_concurrent_tasks() -> usize {
    3
}

fn default_max_retries() -> u32 {
    3
}

fn default_token_window() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

fn default_half_open_interval() -> Duration {
    Duration::from_secs(10 * 60)
}

fn default_trip_threshold() -> usize {
    5
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("./workdir")
}

fn default_snapshot_capacity() -> usize {
    10
}

fn default_test_base_url() -> String {
    "http://127.0.0.1:8080".into()
}

fn default_min_cases() -> usize {
    3
}

fn default_case_timeout() -> Duration {
    Duration::from_secs(30)
}

/// Serialize `Duration` fields as integer milliseconds, matching the
/// `*_MS` environment variables they come from.
mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.server.port, 8787);
        assert_eq!(config.breaker.max_retries, 3);
        assert_eq!(config.breaker.trip_threshold, 5);
        assert_eq!(config.breaker.token_window, Duration::from_secs(86_400));
        assert_eq!(config.db.mode, DbMode::Memory);
        assert!(!config.hosting.is_configured());
    }

    #[test]
    fn hosting_requires_all_three_fields() {
        let hosting = HostingConfig {
            token: Some("t".into()),
            owner: Some("o".into()),
            repo: None,
        };
        assert!(!hosting.is_configured());

        let hosting = HostingConfig {
            token: Some("t".into()),
            owner: Some("o".into()),
            repo: Some("r".into()),
        };
        assert!(hosting.is_configured());
    }

    #[test]
    fn config_serialization_roundtrip() {
        let config = Config::default();
        let json = serde_json::to_string(&config).unwrap();
        let deser: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(deser.server.port, config.server.port);
        assert_eq!(deser.model.timeout, config.model.timeout);
        assert_eq!(deser.breaker.half_open_interval, Duration::from_secs(600));
    }

    #[test]
    fn duration_fields_serialize_as_millis() {
        let config = ModelConfig::default();
        let value = serde_json::to_value(&config).unwrap();
        assert_eq!(value["timeout"], 30_000);
    }
}
