use std::collections::{BTreeMap, BTreeSet};
use std::env;
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Url;
use sentry::types::Dsn;
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

use crate::endpoints::{EndpointClass, EndpointKind, QueryParams};

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
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "dashfeed".into(),
            hostname_tag: None,
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Fine-tuning of one [`EndpointClass`].
///
/// Unset values fall back to the defaults of the class.
#[derive(Debug, Clone, Copy, Default, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct ClassConfig {
    /// Age after which a payload is stale and gets revalidated.
    #[serde(with = "humantime_serde")]
    pub ttl: Option<Duration>,

    /// Maximum duration of a single fetch.
    #[serde(with = "humantime_serde")]
    pub timeout: Option<Duration>,

    /// Interval of the auto-refresh.
    #[serde(with = "humantime_serde")]
    pub refresh_interval: Option<Duration>,
}

/// The effective settings of one [`EndpointClass`].
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ClassSettings {
    pub ttl: Duration,
    pub timeout: Duration,
    pub refresh_interval: Duration,
}

/// Settings per endpoint class.
#[derive(Debug, Clone, Copy, Default, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct ClassConfigs {
    pub live: ClassConfig,
    pub daily: ClassConfig,
    #[serde(rename = "macro")]
    pub macro_: ClassConfig,
}

impl ClassConfigs {
    /// Returns the settings for `class`, with unset values replaced by the class defaults.
    pub fn resolve(&self, class: EndpointClass) -> ClassSettings {
        let config = match class {
            EndpointClass::Live => &self.live,
            EndpointClass::Daily => &self.daily,
            EndpointClass::Macro => &self.macro_,
        };

        ClassSettings {
            ttl: config.ttl.unwrap_or_else(|| class.default_ttl()),
            timeout: config.timeout.unwrap_or_else(|| class.default_timeout()),
            refresh_interval: config
                .refresh_interval
                .unwrap_or_else(|| class.default_refresh_interval()),
        }
    }
}

/// Controls the circuit breaker of the auto-refresh.
#[derive(Debug, Clone, Copy, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Number of consecutive failed refreshes after which the auto-refresh stops.
    pub max_errors: u32,
    /// Time after which a stopped auto-refresh resumes on its own.
    #[serde(with = "humantime_serde")]
    pub cooldown: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_errors: 3,
            cooldown: Duration::from_secs(5 * 60),
        }
    }
}

/// A named feed, one endpoint with a fixed set of parameters.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct FeedConfig {
    /// Unique name of the feed.
    pub name: String,
    /// The kind of endpoint, which determines how the payload is decoded.
    pub endpoint: EndpointKind,
    /// The path of the endpoint, if it differs from the default of the endpoint kind.
    #[serde(default)]
    pub path: Option<String>,
    /// The class of the endpoint, if it differs from the default of the endpoint kind.
    #[serde(default)]
    pub class: Option<EndpointClass>,
    /// Query parameters sent with every request.
    #[serde(default)]
    pub params: QueryParams,
}

impl FeedConfig {
    /// The path to request, either configured or the default of the endpoint kind.
    pub fn path(&self) -> Option<&str> {
        self.path.as_deref().or(self.endpoint.default_path())
    }

    pub fn class(&self) -> EndpointClass {
        self.class.unwrap_or(self.endpoint.class())
    }
}

/// The configuration of dashfeed.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// The base URL of the dashboard proxy.
    pub proxy_url: Url,

    /// The timeout for establishing a connection to the proxy.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Configuration for internal logging.
    pub logging: Logging,

    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,

    /// DSN to report internal errors to
    pub sentry_dsn: Option<Dsn>,

    /// Settings per endpoint class.
    pub classes: ClassConfigs,

    /// Settings of the auto-refresh.
    pub scheduler: SchedulerConfig,

    /// The feeds to serve.
    pub feeds: Vec<FeedConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            proxy_url: default_proxy_url(),
            connect_timeout: Duration::from_secs(2),
            logging: Logging::default(),
            metrics: Metrics::default(),
            sentry_dsn: None,
            classes: ClassConfigs::default(),
            scheduler: SchedulerConfig::default(),
            feeds: Vec::new(),
        }
    }
}

/// Default value for the "proxy_url" configuration.
fn default_proxy_url() -> Url {
    "http://127.0.0.1:8000/".parse().unwrap()
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
        let config: Self = serde_yaml::from_str(&config).context("failed to parse config YAML")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let mut names = BTreeSet::new();
        for feed in &self.feeds {
            if !names.insert(feed.name.as_str()) {
                anyhow::bail!("duplicate feed `{}`", feed.name);
            }
            if feed.path().is_none() {
                anyhow::bail!("feed `{}` needs a path for its {} endpoint", feed.name, feed.endpoint);
            }
        }

        for class in [EndpointClass::Live, EndpointClass::Daily, EndpointClass::Macro] {
            let settings = self.classes.resolve(class);
            if settings.timeout.is_zero() {
                anyhow::bail!("classes.{class}.timeout must not be zero");
            }
            if settings.refresh_interval.is_zero() {
                anyhow::bail!("classes.{class}.refresh_interval must not be zero");
            }
        }

        if self.scheduler.max_errors == 0 {
            anyhow::bail!("scheduler.max_errors must be at least 1");
        }

        Ok(())
    }

    /// Looks up a configured feed by name.
    pub fn feed(&self, name: &str) -> Option<&FeedConfig> {
        self.feeds.iter().find(|feed| feed.name == name)
    }
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl de::Visitor<'_> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
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
