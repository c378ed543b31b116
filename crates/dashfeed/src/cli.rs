//! Exposes the command line application.
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dashfeed_service::config::Config;
use dashfeed_service::{metric, metrics};
use tokio_util::sync::CancellationToken;

use crate::feeds;
use crate::logging;

/// Dashfeed commands.
#[derive(Debug, Subcommand)]
enum Command {
    /// Refresh all configured feeds until interrupted.
    Run,

    /// Fetch one feed and print its payload as JSON.
    Fetch {
        /// The name of the feed.
        feed: String,

        /// Wait for a fresh payload instead of accepting a stale one.
        #[arg(long)]
        fresh: bool,
    },

    /// List the configured feeds with their endpoint, class and cache key.
    Feeds,
}

/// Keeps the data behind a market dashboard warm.
#[derive(Debug, Parser)]
#[command(name = "dashfeed", version)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    /// Returns the path to the configuration file.
    fn config(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::get(cli.config()).context("failed loading config")?;

    let _sentry = sentry::init(sentry::ClientOptions {
        dsn: config.sentry_dsn.clone(),
        release: sentry::release_name!(),
        ..Default::default()
    });

    // SAFETY: The runtime has not been started, so there are no other threads reading the
    // environment.
    unsafe { logging::init_logging(&config) };

    if let Some(ref statsd) = config.metrics.statsd {
        let mut tags = config.metrics.custom_tags.clone();
        let hostname = config.metrics.hostname_tag.clone().and_then(|tag| {
            hostname::get()
                .ok()
                .and_then(|s| s.into_string().ok())
                .map(|name| (tag, name))
        });
        tags.extend(hostname);
        metrics::configure_statsd(&config.metrics.prefix, statsd.as_str(), tags)
            .context("failed to configure statsd")?;
    }

    match cli.command {
        Command::Run => run(config).context("failed to run the schedulers")?,
        Command::Fetch { feed, fresh } => fetch(config, &feed, fresh)?,
        Command::Feeds => list(&config)?,
    }

    Ok(())
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to create the runtime")
}

/// Resolves on Ctrl-C, or never if the signal cannot be observed.
async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!(
            error = &error as &dyn std::error::Error,
            "Failed to listen for Ctrl-C"
        );
        std::future::pending::<()>().await;
    }
}

fn run(config: Config) -> Result<()> {
    // Log this metric before creating the feeds. This allows to see restarts even if the
    // configuration turns out to be unusable.
    metric!(counter("dashfeed.starting") += 1);

    runtime()?.block_on(async {
        let feeds = feeds::build_feeds(&config)?;
        if feeds.is_empty() {
            tracing::warn!("No feeds configured");
        }
        for feed in &feeds {
            tracing::debug!(feed = feed.name(), "Scheduling feed");
        }

        feeds::run_schedulers(&config.scheduler, &feeds, shutdown_signal()).await;
        Ok::<_, anyhow::Error>(())
    })
}

fn fetch(config: Config, name: &str, fresh: bool) -> Result<()> {
    runtime()?.block_on(async {
        let feed = feeds::build_feed(&config, name)?;

        let cancel = CancellationToken::new();
        let guard = cancel.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            guard.cancel();
        });

        let payload = feed
            .fetch(fresh, &cancel)
            .await?
            .with_context(|| format!("fetching feed `{name}` was interrupted"))?;
        let json = serde_json::to_string_pretty(&payload).context("failed to serialize payload")?;
        println!("{json}");
        Ok::<_, anyhow::Error>(())
    })
}

fn list(config: &Config) -> Result<()> {
    for feed in feeds::build_feeds(config)? {
        println!("{}", feed.describe());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_fetch() {
        let args = ["dashfeed", "-c", "dashfeed.yml", "fetch", "btc-basis", "--fresh"];
        let cli = Cli::try_parse_from(args).unwrap();
        assert_eq!(cli.config(), Some(Path::new("dashfeed.yml")));
        match cli.command {
            Command::Fetch { feed, fresh } => {
                assert_eq!(feed, "btc-basis");
                assert!(fresh);
            }
            command => panic!("unexpected command {command:?}"),
        }
    }

    #[test]
    fn test_config_after_subcommand() {
        let cli = Cli::try_parse_from(["dashfeed", "feeds", "--config", "dashfeed.yml"]).unwrap();
        assert_eq!(cli.config(), Some(Path::new("dashfeed.yml")));
        assert!(matches!(cli.command, Command::Feeds));
    }

    #[test]
    fn test_fetch_needs_feed() {
        assert!(Cli::try_parse_from(["dashfeed", "fetch"]).is_err());
    }

    #[test]
    fn test_verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
