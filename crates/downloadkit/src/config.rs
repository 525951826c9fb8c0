use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

use crate::caching::{ExpiryPolicy, StoreLimits};

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level for downloadkit.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
        }
    }
}

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "downloadkit".into(),
            custom_tags: BTreeMap::new(),
        }
    }
}

/// The tunables of the fetch engine.
///
/// These can be changed at runtime through
/// [`FetchCoordinator::configure`](crate::service::FetchCoordinator::configure). Changing them
/// never invalidates entries that are already cached.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct FetchSettings {
    /// Maximum number of entries kept in memory. `0` disables the limit.
    pub max_entries: usize,

    /// Maximum aggregate size (in bytes) of the values kept in memory. `0` disables the limit.
    pub max_cost: u64,

    /// Maximum number of fetches that are allowed to run at the same time.
    pub max_concurrent_fetches: usize,

    /// Timeout for a single fetch.
    #[serde(with = "humantime_serde")]
    pub fetch_timeout: Duration,

    /// Default expiration for freshly fetched entries.
    pub expiry: ExpiryPolicy,

    /// Whether entries are written through to the persistent store.
    ///
    /// This has no effect when no `cache_dir` is configured.
    pub persist_to_disk: bool,
}

impl FetchSettings {
    pub fn limits(&self) -> StoreLimits {
        StoreLimits {
            max_entries: self.max_entries,
            max_cost: self.max_cost,
        }
    }
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            max_entries: 100,
            max_cost: 30 * 1024 * 1024,
            max_concurrent_fetches: 10,
            fetch_timeout: Duration::from_secs(3),
            expiry: ExpiryPolicy::Weekly,
            persist_to_disk: false,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Which directory to use when persisting entries. Default is not to persist.
    pub cache_dir: Option<PathBuf>,

    /// Configuration for internal logging.
    pub logging: Logging,

    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,

    /// Tunables of the fetch engine.
    pub fetch: FetchSettings,

    /// The `User-Agent` sent along with HTTP fetches.
    pub user_agent: String,

    /// The timeout for establishing a connection in an HTTP fetch.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Interval of the background sweep removing expired entries.
    ///
    /// Expired entries are always treated as absent when read; the sweep only reclaims memory
    /// and disk space early. `None` disables the sweep.
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            cache_dir: None,
            logging: Logging::default(),
            metrics: Metrics::default(),
            fetch: FetchSettings::default(),
            user_agent: concat!("downloadkit/", env!("CARGO_PKG_VERSION")).to_owned(),
            connect_timeout: Duration::from_secs(1),
            sweep_interval: None,
        }
    }
}

impl Config {
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        serde_yaml::from_str(&config).context("failed to parse config YAML")
    }
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl de::Visitor<'_> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> std::fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "off" => Ok(LevelFilter::OFF),
            "error" => Ok(LevelFilter::ERROR),
            "warn" => Ok(LevelFilter::WARN),
            "info" => Ok(LevelFilter::INFO),
            "debug" => Ok(LevelFilter::DEBUG),
            "trace" => Ok(LevelFilter::TRACE),
            _ => Err(de::Error::unknown_variant(
                v,
                &["off", "error", "warn", "info", "debug", "trace"],
            )),
        }
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    deserializer.deserialize_str(LevelFilterVisitor)
}
