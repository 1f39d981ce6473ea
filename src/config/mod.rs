//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{path::PathBuf, str::FromStr};

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::domain::ConnectionId;

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "querycache";
const ENV_PREFIX: &str = "QUERYCACHE";
const DEFAULT_NAMESPACE: &str = "querycache";
const DEFAULT_MAX_ENTRIES: usize = 10_000;
const DEFAULT_CONNECTION_NAME: &str = "default";
const DEFAULT_DATABASE: &str = "main";

/// Command-line arguments for the querycache binary.
#[derive(Debug, Parser)]
#[command(
    name = "querycache",
    version,
    about = "Inspect query cache keys and settings"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "QUERYCACHE_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(flatten)]
    pub overrides: Overrides,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Derive the cache key, hashed key and tags for a query document.
    Key(KeyArgs),
    /// Print the resolved settings.
    Config,
}

#[derive(Debug, Args, Clone)]
pub struct KeyArgs {
    /// JSON document with `query`, `operation` and optional `relations`; `-` reads stdin.
    #[arg(long, value_name = "PATH", value_hint = ValueHint::FilePath, default_value = "-")]
    pub input: PathBuf,
}

#[derive(Debug, Args, Default, Clone)]
pub struct Overrides {
    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new(),
        global = true
    )]
    pub log_json: Option<bool>,

    /// Toggle the query cache.
    #[arg(
        long = "cache-enabled",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new(),
        global = true
    )]
    pub cache_enabled: Option<bool>,

    /// Override the key namespace.
    #[arg(long = "cache-namespace", value_name = "NAME", global = true)]
    pub cache_namespace: Option<String>,

    /// Override the custom key prefix.
    #[arg(long = "cache-prefix", value_name = "PREFIX", global = true)]
    pub cache_prefix: Option<String>,

    /// Override the default cooldown window in milliseconds.
    #[arg(long = "cache-cooldown-ms", value_name = "MILLIS", global = true)]
    pub cache_cooldown_ms: Option<u64>,

    /// Override the connection name used in keys and tags.
    #[arg(long = "connection-name", value_name = "NAME", global = true)]
    pub connection_name: Option<String>,

    /// Override the database name used in keys and tags.
    #[arg(long = "connection-database", value_name = "NAME", global = true)]
    pub connection_database: Option<String>,
}

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub cache: CacheSettings,
    pub connection: ConnectionSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheSettings {
    pub enabled: bool,
    pub namespace: String,
    pub prefix: Option<String>,
    pub use_database_keying: bool,
    pub cooldown_ms: u64,
    pub max_entries: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSettings {
    pub name: String,
    pub database: String,
}

impl ConnectionSettings {
    pub fn connection_id(&self) -> ConnectionId {
        ConnectionId::new(self.name.clone(), self.database.clone())
    }
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

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;
    raw.apply_overrides(&cli.overrides);

    Settings::from_raw(raw)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    cache: RawCacheSettings,
    connection: RawConnectionSettings,
    logging: RawLoggingSettings,
}

impl RawSettings {
    fn apply_overrides(&mut self, overrides: &Overrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(enabled) = overrides.cache_enabled {
            self.cache.enabled = Some(enabled);
        }
        if let Some(namespace) = overrides.cache_namespace.as_ref() {
            self.cache.namespace = Some(namespace.clone());
        }
        if let Some(prefix) = overrides.cache_prefix.as_ref() {
            self.cache.prefix = Some(prefix.clone());
        }
        if let Some(cooldown) = overrides.cache_cooldown_ms {
            self.cache.cooldown_ms = Some(cooldown);
        }
        if let Some(name) = overrides.connection_name.as_ref() {
            self.connection.name = Some(name.clone());
        }
        if let Some(database) = overrides.connection_database.as_ref() {
            self.connection.database = Some(database.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            cache,
            connection,
            logging,
        } = raw;

        Ok(Self {
            cache: build_cache_settings(cache)?,
            connection: build_connection_settings(connection)?,
            logging: build_logging_settings(logging)?,
        })
    }
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let namespace = cache
        .namespace
        .map(|value| value.trim().to_string())
        .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());
    key_segment(&namespace, "cache.namespace")?;

    let prefix = cache.prefix.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    });
    if let Some(prefix) = prefix.as_deref() {
        key_segment(prefix, "cache.prefix")?;
    }

    let max_entries = cache.max_entries.unwrap_or(DEFAULT_MAX_ENTRIES);
    if max_entries == 0 {
        return Err(LoadError::invalid(
            "cache.max_entries",
            "must be greater than zero",
        ));
    }

    Ok(CacheSettings {
        enabled: cache.enabled.unwrap_or(true),
        namespace,
        prefix,
        use_database_keying: cache.use_database_keying.unwrap_or(true),
        cooldown_ms: cache.cooldown_ms.unwrap_or(0),
        max_entries,
    })
}

fn build_connection_settings(
    connection: RawConnectionSettings,
) -> Result<ConnectionSettings, LoadError> {
    let name = connection
        .name
        .map(|value| value.trim().to_string())
        .unwrap_or_else(|| DEFAULT_CONNECTION_NAME.to_string());
    key_segment(&name, "connection.name")?;

    let database = connection
        .database
        .map(|value| value.trim().to_string())
        .unwrap_or_else(|| DEFAULT_DATABASE.to_string());
    if database.is_empty() {
        return Err(LoadError::invalid(
            "connection.database",
            "must not be empty",
        ));
    }

    Ok(ConnectionSettings { name, database })
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

/// Key segments are joined with `:`, so they must be non-empty and free of it.
fn key_segment(value: &str, key: &'static str) -> Result<(), LoadError> {
    if value.is_empty() {
        return Err(LoadError::invalid(key, "must not be empty"));
    }
    if value.contains(':') {
        return Err(LoadError::invalid(key, "must not contain `:`"));
    }
    Ok(())
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    enabled: Option<bool>,
    namespace: Option<String>,
    prefix: Option<String>,
    use_database_keying: Option<bool>,
    cooldown_ms: Option<u64>,
    max_entries: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawConnectionSettings {
    name: Option<String>,
    database: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}
