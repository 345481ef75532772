use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use sentry::types::Dsn;
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

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
    /// The log level.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
    /// When set to true, backtraces are forced on.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
            enable_backtraces: true,
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
    /// A tag name to report the hostname to, for each metric. Defaults to not sending such a tag.
    pub hostname_tag: Option<String>,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: match env::var("STATSD_SERVER") {
                Ok(metrics_statsd) => Some(metrics_statsd),
                Err(_) => None,
            },
            prefix: "serializator".into(),
            hostname_tag: None,
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Controls the worker pool running serialization tasks.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct WorkersConfig {
    /// The number of worker threads.
    pub threads: usize,
    /// Closes the pool after it has been idle for this long.
    ///
    /// The pool is only closed after it has run at least one task. `null` keeps the pool open
    /// until it is dropped.
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Option<Duration>,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            threads: 10,
            idle_timeout: Some(Duration::from_secs(30)),
        }
    }
}

/// Options for the in-memory layer of the cache.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct InMemoryConfig {
    /// The maximum number of loaded objects kept in memory.
    ///
    /// Objects are kept for the lifetime of the cache when this is not set.
    pub capacity: Option<u64>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// The directory holding the persisted objects.
    pub cache_dir: PathBuf,

    /// The file extension of persisted objects, without the leading dot.
    pub file_extension: String,

    /// Logging configuration.
    pub logging: Logging,

    /// Metrics configuration.
    pub metrics: Metrics,

    /// DSN to report internal errors to
    pub sentry_dsn: Option<Dsn>,

    /// The worker pool.
    pub workers: WorkersConfig,

    /// The in-memory cache of loaded objects.
    pub in_memory: InMemoryConfig,
}

impl Config {
    /// The directory for temporary files, next to the persisted objects.
    pub fn tmp_dir(&self) -> PathBuf {
        self.cache_dir.join("tmp")
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            cache_dir: PathBuf::from("."),
            file_extension: "properties".into(),
            logging: Logging::default(),
            metrics: Metrics::default(),
            sentry_dsn: None,
            workers: WorkersConfig::default(),
            in_memory: InMemoryConfig::default(),
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

    pub fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = Config::get(None).unwrap();
        assert_eq!(cfg.cache_dir, PathBuf::from("."));
        assert_eq!(cfg.file_extension, "properties");
        assert_eq!(cfg.workers.threads, 10);
        assert_eq!(cfg.workers.idle_timeout, Some(Duration::from_secs(30)));
        assert_eq!(cfg.in_memory.capacity, None);
        assert_eq!(cfg.logging.format, LogFormat::Auto);
        assert_eq!(cfg.metrics.prefix, "serializator");
        assert_eq!(cfg.tmp_dir(), PathBuf::from("./tmp"));
    }

    #[test]
    fn test_partial_config() {
        // Setting individual values keeps the defaults of their siblings.
        let yaml = r#"
            cache_dir: /var/lib/serializator
            workers:
              idle_timeout: 2m
            logging:
              level: debug
              format: json
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.cache_dir, PathBuf::from("/var/lib/serializator"));
        assert_eq!(cfg.workers.threads, 10);
        assert_eq!(cfg.workers.idle_timeout, Some(Duration::from_secs(120)));
        assert_eq!(cfg.logging.level, LevelFilter::DEBUG);
        assert_eq!(cfg.logging.format, LogFormat::Json);
        assert!(cfg.logging.enable_backtraces);
    }

    #[test]
    fn test_disabling_idle_timeout() {
        let yaml = r#"
            workers:
              threads: 2
              idle_timeout: null
            in_memory:
              capacity: 100
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(
            cfg.workers,
            WorkersConfig {
                threads: 2,
                idle_timeout: None,
            }
        );
        assert_eq!(cfg.in_memory.capacity, Some(100));
    }

    #[test]
    fn test_invalid_level() {
        let yaml = r#"
            logging:
              level: verbose
        "#;
        let err = Config::from_reader(yaml.as_bytes()).unwrap_err();
        assert!(format!("{err:#}").contains("unknown variant `verbose`"));
    }

    #[test]
    fn test_unknown_fields() {
        // Unknown fields should not cause failure
        let yaml = r#"
            not_an_option: 1h
            workers:
              not_a_worker_option: true
        "#;
        let cfg = Config::from_reader(yaml.as_bytes());
        assert!(cfg.is_ok());
    }

    #[test]
    fn test_empty_file() {
        // Empty files aren't supported
        let yaml = r#""#;
        let result = Config::from_reader(yaml.as_bytes());
        assert!(result.is_err());
    }
}
