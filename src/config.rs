use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

// DESIGN CHOICE: Every field has a default
// An empty (or missing) file yields a working local setup: listeners on
// 27077/27078, Elasticsearch on localhost:9200 and Redis on localhost:6379.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub listen: ListenConfig,
    pub elasticsearch: ElasticsearchConfig,
    pub redis: RedisConfig,
    pub backlog: BacklogConfig,
    pub stats: StatsConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ListenConfig {
    pub tcp: String,  // Line-oriented stream transport
    pub http: String, // One message per request body
    pub max_body_bytes: usize,
    pub max_line_bytes: usize, // Longer TCP lines are discarded
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            tcp: "0.0.0.0:27077".to_string(),
            http: "0.0.0.0:27078".to_string(),
            max_body_bytes: 1024 * 1024,
            max_line_bytes: 1024 * 1024,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ElasticsearchConfig {
    pub url: String,
    pub users_index: String, // Directory of tenants, searched by apiKey
    pub stats_index: String, // Where usage counters are flushed
    pub request_timeout_ms: u64,
}

impl Default for ElasticsearchConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:9200".to_string(),
            users_index: "users".to_string(),
            stats_index: "stats".to_string(),
            request_timeout_ms: 5_000,
        }
    }
}

impl ElasticsearchConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub channel_capacity: usize, // Pending publishes before events are dropped
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6379,
            channel_capacity: 1024,
        }
    }
}

impl RedisConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

// DESIGN CHOICE: Explicit retry policy
// The backlog is bounded in size and in attempts per message; retries back
// off exponentially from retry_backoff_base_ms up to retry_backoff_max_ms.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BacklogConfig {
    pub capacity: usize,
    pub max_attempts: u32,
    pub retry_interval_ms: u64,
    pub retry_backoff_base_ms: u64,
    pub retry_backoff_max_ms: u64,
}

impl Default for BacklogConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            max_attempts: 10,
            retry_interval_ms: 5_000,
            retry_backoff_base_ms: 1_000,
            retry_backoff_max_ms: 300_000,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StatsConfig {
    pub flush_interval_ms: u64,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: 60_000,
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        // serde_yaml turns an empty document into `null`, not an empty map
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    // Zero periods would spin the background loops (tokio intervals panic on it)
    fn validate(&self) -> anyhow::Result<()> {
        if self.backlog.retry_interval_ms == 0 {
            anyhow::bail!("backlog.retry_interval_ms must be greater than 0");
        }
        if self.stats.flush_interval_ms == 0 {
            anyhow::bail!("stats.flush_interval_ms must be greater than 0");
        }
        if self.listen.max_line_bytes == 0 {
            anyhow::bail!("listen.max_line_bytes must be greater than 0");
        }
        Ok(())
    }
}
