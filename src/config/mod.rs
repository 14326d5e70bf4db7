//! Typed configuration from environment variables or TOML.
//!
//! Loads once at startup, fails fast on malformed values. Every setting has
//! a default, so an empty environment yields a working configuration.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const DEFAULT_CONCURRENCY: usize = 15;
pub const DEFAULT_INACTIVITY_REFRESH: Duration = Duration::from_millis(100);

/// Whether an engine resolves eagerly or only when pulled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Resolves only while `next(Resolved)` demand is outstanding.
    Active,
    /// Resolves whenever the resolve gate allows.
    #[default]
    Passive,
}

impl FromStr for Mode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "active" => Ok(Mode::Active),
            "passive" => Ok(Mode::Passive),
            other => Err(Error::Config(format!("unknown mode: {other}"))),
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Mode::Active => "active",
            Mode::Passive => "passive",
        };
        write!(f, "{s}")
    }
}

/// Construction settings for one engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Label used in logs and metric attributes.
    pub name: String,
    /// Maximum simultaneous in-flight resolutions. Must be positive.
    pub concurrency: usize,
    pub mode: Mode,
    /// Idle period after which a refresh is forced. `None` disables it.
    #[serde(with = "inactivity_ms")]
    pub inactivity_refresh_period: Option<Duration>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            name: "resolveq".to_string(),
            concurrency: DEFAULT_CONCURRENCY,
            mode: Mode::default(),
            inactivity_refresh_period: Some(DEFAULT_INACTIVITY_REFRESH),
        }
    }
}

impl EngineConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    pub fn inactivity_refresh(mut self, period: Option<Duration>) -> Self {
        self.inactivity_refresh_period = period;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(Error::Config("concurrency must be a positive integer".to_string()));
        }
        if self.inactivity_refresh_period == Some(Duration::ZERO) {
            return Err(Error::Config(
                "inactivity refresh period must be positive; omit it to disable".to_string(),
            ));
        }
        Ok(())
    }

    /// Parse from a TOML document with the same field names. The
    /// inactivity period is given as `inactivity_refresh_period` in
    /// milliseconds; `0` disables it.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| Error::Config(format!("bad engine config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML file. See [`EngineConfig::from_toml_str`].
    pub fn from_toml_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }
}

mod inactivity_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(value.map(|d| d.as_millis() as u64).unwrap_or(0))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok((ms > 0).then(|| Duration::from_millis(ms)))
    }
}

/// Process-level configuration.
#[derive(Debug)]
pub struct Config {
    pub engine: EngineConfig,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let mut engine = EngineConfig::default();
        if let Ok(name) = std::env::var("RESOLVEQ_NAME") {
            engine.name = name;
        }
        if let Some(concurrency) = parsed_var::<usize>("RESOLVEQ_CONCURRENCY")? {
            engine.concurrency = concurrency;
        }
        if let Some(mode) = parsed_var::<Mode>("RESOLVEQ_MODE")? {
            engine.mode = mode;
        }
        if let Some(ms) = parsed_var::<u64>("RESOLVEQ_INACTIVITY_MS")? {
            engine.inactivity_refresh_period = (ms > 0).then(|| Duration::from_millis(ms));
        }
        engine.validate()?;

        Ok(Self {
            engine,
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }
}

fn parsed_var<V>(name: &str) -> Result<Option<V>>
where
    V: FromStr,
    V::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|e| Error::Config(format!("environment variable {name} is invalid: {e}"))),
        Err(_) => Ok(None),
    }
}
