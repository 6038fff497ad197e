//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{
    num::{NonZeroU32, NonZeroUsize},
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use url::Url;

use crate::cache::CacheConfig;
use crate::domain::entities::Collection;

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "boardsync";
const DEFAULT_BASE_URL: &str = "http://127.0.0.1:3000/";
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;
const DEFAULT_PAGE_LIMIT: u32 = 20;

/// Command-line arguments for the boardsync binary.
#[derive(Debug, Parser)]
#[command(
    name = "boardsync",
    version,
    about = "Keep cached board pages consistent with a live data service"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "BOARDSYNC_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Watch board collections and keep their cached pages fresh.
    Watch(WatchArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct WatchArgs {
    #[command(flatten)]
    pub overrides: WatchOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct WatchOverrides {
    /// Override the data service base URL.
    #[arg(long = "base-url", value_name = "URL")]
    pub base_url: Option<String>,

    /// Board to watch; repeat for several boards.
    #[arg(long = "board", value_name = "KEY")]
    pub boards: Vec<String>,

    /// Override the page size used when priming boards.
    #[arg(long = "page-limit", value_name = "COUNT")]
    pub page_limit: Option<u32>,

    /// Override the per-request timeout.
    #[arg(long = "request-timeout-seconds", value_name = "SECONDS")]
    pub request_timeout_seconds: Option<u64>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Override the seconds before a cached page turns stale.
    #[arg(long = "cache-stale-after-seconds", value_name = "SECONDS")]
    pub cache_stale_after_seconds: Option<u64>,

    /// Override the auto-refresh coalescing window.
    #[arg(long = "cache-auto-refresh-ms", value_name = "MILLIS")]
    pub cache_auto_refresh_ms: Option<u64>,

    /// Override the polling safety-net interval.
    #[arg(long = "cache-poll-interval-seconds", value_name = "SECONDS")]
    pub cache_poll_interval_seconds: Option<u64>,
}

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub source: SourceSettings,
    pub cache: CacheSettings,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

/// Where the data service lives and what to watch on it.
#[derive(Debug, Clone)]
pub struct SourceSettings {
    pub base_url: Url,
    pub request_timeout: Duration,
    pub page_limit: NonZeroU32,
    pub boards: Vec<Collection>,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub enabled: bool,
    pub page_entry_limit: NonZeroUsize,
    pub detail_entry_limit: NonZeroUsize,
    pub stale_after: Duration,
    pub auto_refresh_min_interval: Duration,
    pub poll_interval: Duration,
    pub refetch_attempts: NonZeroU32,
    pub refetch_backoff: Duration,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix("BOARDSYNC").separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Watch(args)) => raw.apply_watch_overrides(&args.overrides),
        None => raw.apply_watch_overrides(&WatchOverrides::default()),
    }

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    source: RawSourceSettings,
    cache: RawCacheSettings,
}

impl RawSettings {
    fn apply_watch_overrides(&mut self, overrides: &WatchOverrides) {
        if let Some(url) = overrides.base_url.as_ref() {
            self.source.base_url = Some(url.clone());
        }
        if !overrides.boards.is_empty() {
            self.source.boards = Some(overrides.boards.clone());
        }
        if let Some(limit) = overrides.page_limit {
            self.source.page_limit = Some(limit);
        }
        if let Some(seconds) = overrides.request_timeout_seconds {
            self.source.request_timeout_seconds = Some(seconds);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(seconds) = overrides.cache_stale_after_seconds {
            self.cache.stale_after_secs = Some(seconds);
        }
        if let Some(millis) = overrides.cache_auto_refresh_ms {
            self.cache.auto_refresh_min_interval_ms = Some(millis);
        }
        if let Some(seconds) = overrides.cache_poll_interval_seconds {
            self.cache.poll_interval_secs = Some(seconds);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            logging,
            source,
            cache,
        } = raw;

        let logging = build_logging_settings(logging)?;
        let source = build_source_settings(source)?;
        let cache = build_cache_settings(cache)?;

        Ok(Self {
            logging,
            source,
            cache,
        })
    }
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_source_settings(source: RawSourceSettings) -> Result<SourceSettings, LoadError> {
    let raw_url = source
        .base_url
        .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
    let base_url = Url::parse(raw_url.trim())
        .and_then(|url| url.join("/"))
        .map_err(|err| LoadError::invalid("source.base_url", format!("`{raw_url}`: {err}")))?;
    if !matches!(base_url.scheme(), "http" | "https") {
        return Err(LoadError::invalid(
            "source.base_url",
            "scheme must be http or https",
        ));
    }

    let timeout_secs = source
        .request_timeout_seconds
        .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS);
    if timeout_secs == 0 {
        return Err(LoadError::invalid(
            "source.request_timeout_seconds",
            "must be greater than zero",
        ));
    }

    let page_limit = NonZeroU32::new(source.page_limit.unwrap_or(DEFAULT_PAGE_LIMIT))
        .ok_or_else(|| LoadError::invalid("source.page_limit", "must be greater than zero"))?;

    let mut boards = Vec::new();
    for board in source.boards.unwrap_or_default() {
        let board = board.trim();
        if board.is_empty() {
            continue;
        }
        if board.chars().any(char::is_whitespace) {
            return Err(LoadError::invalid(
                "source.boards",
                format!("board key `{board}` must not contain whitespace"),
            ));
        }
        let collection = Collection::posts(board);
        if !boards.contains(&collection) {
            boards.push(collection);
        }
    }

    Ok(SourceSettings {
        base_url,
        request_timeout: Duration::from_secs(timeout_secs),
        page_limit,
        boards,
    })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let defaults = CacheConfig::default();

    let page_entry_limit = non_zero_usize(
        cache.page_entry_limit.unwrap_or(defaults.page_entry_limit),
        "cache.page_entry_limit",
    )?;
    let detail_entry_limit = non_zero_usize(
        cache.detail_entry_limit.unwrap_or(defaults.detail_entry_limit),
        "cache.detail_entry_limit",
    )?;

    let poll_secs = cache.poll_interval_secs.unwrap_or(defaults.poll_interval_secs);
    if poll_secs == 0 {
        return Err(LoadError::invalid(
            "cache.poll_interval_secs",
            "must be greater than zero",
        ));
    }

    let refetch_attempts = NonZeroU32::new(
        cache.refetch_attempts.unwrap_or(defaults.refetch_attempts),
    )
    .ok_or_else(|| LoadError::invalid("cache.refetch_attempts", "must be greater than zero"))?;

    Ok(CacheSettings {
        enabled: cache.enabled.unwrap_or(defaults.enabled),
        page_entry_limit,
        detail_entry_limit,
        stale_after: Duration::from_secs(
            cache.stale_after_secs.unwrap_or(defaults.stale_after_secs),
        ),
        auto_refresh_min_interval: Duration::from_millis(
            cache
                .auto_refresh_min_interval_ms
                .unwrap_or(defaults.auto_refresh_min_interval_ms),
        ),
        poll_interval: Duration::from_secs(poll_secs),
        refetch_attempts,
        refetch_backoff: Duration::from_millis(
            cache.refetch_backoff_ms.unwrap_or(defaults.refetch_backoff_ms),
        ),
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSourceSettings {
    base_url: Option<String>,
    request_timeout_seconds: Option<u64>,
    page_limit: Option<u32>,
    boards: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    enabled: Option<bool>,
    page_entry_limit: Option<usize>,
    detail_entry_limit: Option<usize>,
    stale_after_secs: Option<u64>,
    auto_refresh_min_interval_ms: Option<u64>,
    poll_interval_secs: Option<u64>,
    refetch_attempts: Option<u32>,
    refetch_backoff_ms: Option<u64>,
}

fn non_zero_usize(value: usize, key: &'static str) -> Result<NonZeroUsize, LoadError> {
    NonZeroUsize::new(value).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}
