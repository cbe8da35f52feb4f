//! Service configuration, loaded from an optional TOML file and the environment.

use figment::Figment;
use figment::providers::{Env, Format, Toml};
use fundu::{DurationParser, TimeUnit};
use serde::{Deserialize, Deserializer};
use std::time::Duration;

/// Optional config file read from the working directory.
pub const CONFIG_FILE: &str = "inv-easy.toml";

/// What to do when the startup probe answers, but not with the expected value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DegradedPolicy {
    /// Log a warning and keep booting.
    #[default]
    Warn,
    /// Treat the unexpected answer like a failed query and abort startup.
    Abort,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Postgres connection URL.
    pub database_url: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_max_connections")]
    pub db_max_connections: u32,
    #[serde(
        default = "default_acquire_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub db_acquire_timeout: Duration,
    /// Upper bound on the startup probe query.
    #[serde(
        default = "default_probe_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub probe_timeout: Duration,
    #[serde(default)]
    pub degraded_policy: DegradedPolicy,
}

fn default_log_level() -> String {
    "info".to_owned()
}

fn default_max_connections() -> u32 {
    4
}

fn default_acquire_timeout() -> Duration {
    Duration::from_secs(4)
}

fn default_probe_timeout() -> Duration {
    Duration::from_secs(5)
}

impl Config {
    /// Config file first, then raw environment variables on top.
    pub fn figment() -> Figment {
        Figment::new()
            .merge(Toml::file(CONFIG_FILE))
            .merge(Env::raw().only(&[
                "DATABASE_URL",
                "LOG_LEVEL",
                "DB_MAX_CONNECTIONS",
                "DB_ACQUIRE_TIMEOUT",
                "PROBE_TIMEOUT",
                "DEGRADED_POLICY",
            ]))
    }

    pub fn load() -> Result<Self, figment::Error> {
        Self::figment().extract()
    }
}

/// Accepts either a bare number of seconds or a string such as `500ms`, `5s` or `2m`.
fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Seconds(u64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Seconds(secs) => Ok(Duration::from_secs(secs)),
        Raw::Text(text) => parse_duration(&text).map_err(serde::de::Error::custom),
    }
}

fn parse_duration(text: &str) -> Result<Duration, String> {
    let parser = DurationParser::with_time_units(&[
        TimeUnit::MilliSecond,
        TimeUnit::Second,
        TimeUnit::Minute,
    ]);

    let parsed = parser
        .parse(text.trim())
        .map_err(|e| format!("invalid duration {text:?}: {e}"))?;
    Duration::try_from(parsed).map_err(|e| format!("invalid duration {text:?}: {e}"))
}
