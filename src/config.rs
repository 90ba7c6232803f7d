use crate::config_validator::{validate_not_blank, validate_redis_url, validate_stream_url};
use crate::ingester::IngestSettings;
use clap::{Args, Parser, Subcommand};
use humantime_serde::re::humantime::parse_duration;
use std::ffi::OsString;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use validator::{Validate, ValidationErrors};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(#[from] ValidationErrors),

    #[error("cannot load config file {}: {source}", path.display())]
    EnvFile {
        path: PathBuf,
        #[source]
        source: dotenv::Error,
    },
}

/// Command line, with every option also readable from the environment
/// (and so from a `.env` file, or the file named by `--conf`).
#[derive(Debug, Parser)]
#[command(name = "hashtag-counter", version, about)]
pub struct Cli {
    /// Debug level logging
    #[arg(long, global = true, env = "DEBUG")]
    pub debug: bool,

    /// Alternative config file in `KEY=value` form, read instead of `.env`
    #[arg(long, global = true, value_name = "FILE")]
    pub conf: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Finds `--conf FILE` or `--conf=FILE` before clap runs, so the file's
/// values can feed the `env` fallbacks.
pub fn conf_path<I>(args: I) -> Option<PathBuf>
where
    I: IntoIterator<Item = OsString>,
{
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        if arg == "--" {
            break;
        }
        if arg == "--conf" {
            return args.next().map(PathBuf::from);
        }
        if let Some(path) = arg.to_str().and_then(|a| a.strip_prefix("--conf=")) {
            return Some(PathBuf::from(path));
        }
    }
    None
}

/// Loads the `--conf` file, or `.env` when none is named.
///
/// Variables already set in the environment win over file values. A named
/// file that cannot be read is an error; a missing `.env` is not.
pub fn load_env<I>(args: I) -> Result<Option<PathBuf>, ConfigError>
where
    I: IntoIterator<Item = OsString>,
{
    match conf_path(args) {
        Some(path) => {
            dotenv::from_path(&path).map_err(|source| ConfigError::EnvFile {
                path: path.clone(),
                source,
            })?;
            Ok(Some(path))
        }
        None => {
            dotenv::dotenv().ok();
            Ok(None)
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Consume the post stream and count hashtags for one filter
    Stream(StreamConfig),
    /// Serve the top-N and reset API
    Api(ApiConfig),
}

#[derive(Debug, Clone, Args, Validate)]
pub struct StreamConfig {
    /// Keyword filter for posts; also the counter bucket
    #[arg(long, env = "TWEET_FILTER")]
    #[validate(custom(function = "validate_not_blank"))]
    pub filter: String,

    /// Redis connection URL
    #[arg(long, env = "REDIS_URL", default_value = "redis://127.0.0.1:6379")]
    #[validate(custom(function = "validate_redis_url"))]
    pub redis_url: String,

    /// Upstream streaming endpoint
    #[arg(long, env = "STREAM_URL")]
    #[validate(custom(function = "validate_stream_url"))]
    pub stream_url: String,

    /// Bearer token for the upstream stream
    #[arg(long, env = "STREAM_TOKEN", hide_env_values = true)]
    #[validate(custom(function = "validate_not_blank"))]
    pub stream_token: String,

    /// Lock resource name; defaults to one lock per filter
    #[arg(long, env = "LOCK_KEY")]
    pub lock_key: Option<String>,

    #[arg(long, env = "LOCK_LEASE", default_value = "30s", value_parser = parse_duration)]
    pub lock_lease: Duration,

    /// Reconnect when no bytes arrive for this long
    #[arg(long, env = "STALL_TIMEOUT", default_value = "90s", value_parser = parse_duration)]
    pub stall_timeout: Duration,

    #[arg(long, env = "RECONNECT_INITIAL", default_value = "5s", value_parser = parse_duration)]
    pub reconnect_initial: Duration,

    #[arg(long, env = "RECONNECT_MAX", default_value = "320s", value_parser = parse_duration)]
    pub reconnect_max: Duration,

    /// Consecutive failed posts before the store is declared unavailable
    #[arg(long, env = "MAX_STORE_FAILURES", default_value_t = 10)]
    #[validate(range(min = 1))]
    pub max_store_failures: u32,
}

impl StreamConfig {
    pub fn validate_config(&self) -> Result<(), ConfigError> {
        self.validate()?;
        Ok(())
    }

    pub fn lock_name(&self) -> String {
        match self.lock_key.as_deref().map(str::trim) {
            Some(key) if !key.is_empty() => key.to_string(),
            _ => format!("hashtag-counter:lock:{}", self.filter),
        }
    }

    pub fn ingest_settings(&self) -> IngestSettings {
        IngestSettings {
            lock_lease: self.lock_lease,
            reconnect_initial: self.reconnect_initial,
            reconnect_max: self.reconnect_max,
            max_store_failures: self.max_store_failures,
            ..IngestSettings::default()
        }
    }
}

#[derive(Debug, Clone, Args, Validate)]
pub struct ApiConfig {
    /// Server bind address
    #[arg(long, env = "BIND_ADDR", default_value = "127.0.0.1:5000")]
    pub bind_addr: SocketAddr,

    /// Redis connection URL
    #[arg(long, env = "REDIS_URL", default_value = "redis://127.0.0.1:6379")]
    #[validate(custom(function = "validate_redis_url"))]
    pub redis_url: String,

    /// Bucket served by `/count` when no `filter` query parameter is given
    #[arg(long, env = "TWEET_FILTER", default_value = "charity")]
    #[validate(custom(function = "validate_not_blank"))]
    pub filter: String,

    /// How long `/count` results may be served from cache; 0 disables
    #[arg(long, env = "CACHE_TTL", default_value = "10s", value_parser = parse_duration)]
    pub cache_ttl: Duration,
}

impl ApiConfig {
    pub fn validate_config(&self) -> Result<(), ConfigError> {
        self.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Cli, clap::Error> {
        Cli::try_parse_from(std::iter::once("hashtag-counter").chain(args.iter().copied()))
    }

    fn stream_config(args: &[&str]) -> StreamConfig {
        match parse(args).unwrap().command {
            Command::Stream(config) => config,
            Command::Api(_) => panic!("expected stream command"),
        }
    }

    const STREAM_ARGS: &[&str] = &[
        "stream",
        "--filter",
        "charity",
        "--stream-url",
        "https://stream.example.com/posts",
        "--stream-token",
        "secret",
    ];

    #[test]
    fn test_stream_defaults() {
        let config = stream_config(STREAM_ARGS);
        assert!(config.validate_config().is_ok());
        assert_eq!(config.redis_url, "redis://127.0.0.1:6379");
        assert_eq!(config.lock_lease, Duration::from_secs(30));
        assert_eq!(config.stall_timeout, Duration::from_secs(90));
        assert_eq!(config.lock_name(), "hashtag-counter:lock:charity");

        let settings = config.ingest_settings();
        assert_eq!(settings.reconnect_initial, Duration::from_secs(5));
        assert_eq!(settings.reconnect_max, Duration::from_secs(320));
        assert_eq!(settings.max_store_failures, 10);
    }

    #[test]
    fn test_explicit_lock_key() {
        let mut args = STREAM_ARGS.to_vec();
        args.extend(["--lock-key", "ingest.lock", "--reconnect-max", "2m"]);
        let config = stream_config(&args);
        assert_eq!(config.lock_name(), "ingest.lock");
        assert_eq!(config.reconnect_max, Duration::from_secs(120));
    }

    #[test]
    fn test_blank_values_fail_validation() {
        let config = stream_config(&[
            "stream",
            "--filter",
            " ",
            "--stream-url",
            "https://stream.example.com/posts",
            "--stream-token",
            "",
        ]);
        let err = config.validate_config().unwrap_err();
        let ConfigError::Invalid(errors) = err else {
            panic!("expected validation errors");
        };
        let fields = errors.field_errors();
        assert!(fields.contains_key("filter"));
        assert!(fields.contains_key("stream_token"));
    }

    #[test]
    fn test_bad_redis_url_fails_validation() {
        let mut args = STREAM_ARGS.to_vec();
        args.extend(["--redis-url", "http://localhost:6379"]);
        assert!(stream_config(&args).validate_config().is_err());
    }

    #[test]
    fn test_api_defaults() {
        let cli = parse(&["api"]).unwrap();
        let Command::Api(config) = cli.command else {
            panic!("expected api command");
        };
        assert!(config.validate_config().is_ok());
        assert_eq!(config.bind_addr, "127.0.0.1:5000".parse().unwrap());
        assert_eq!(config.cache_ttl, Duration::from_secs(10));
        assert_eq!(config.filter, "charity");
    }

    fn os_args(args: &[&str]) -> Vec<OsString> {
        args.iter().map(OsString::from).collect()
    }

    #[test]
    fn test_conf_path_forms() {
        assert_eq!(
            conf_path(os_args(&["hashtag-counter", "--conf", "prod.conf", "api"])),
            Some(PathBuf::from("prod.conf"))
        );
        assert_eq!(
            conf_path(os_args(&["hashtag-counter", "api", "--conf=prod.conf"])),
            Some(PathBuf::from("prod.conf"))
        );
        assert_eq!(conf_path(os_args(&["hashtag-counter", "api"])), None);
        assert_eq!(conf_path(os_args(&["hashtag-counter", "--", "--conf", "x"])), None);
    }

    #[test]
    fn test_conf_flag_is_accepted_by_cli() {
        let cli = parse(&["--conf", "prod.conf", "api"]).unwrap();
        assert_eq!(cli.conf, Some(PathBuf::from("prod.conf")));
        assert!(matches!(cli.command, Command::Api(_)));
    }

    #[test]
    fn test_load_env_reads_named_file() {
        let path = std::env::temp_dir().join(format!("hashtag-counter-{}.conf", uuid::Uuid::new_v4()));
        std::fs::write(&path, "HASHTAG_COUNTER_CONF_SOURCE=from-file\n").unwrap();

        let loaded = load_env(os_args(&["hashtag-counter", "--conf", path.to_str().unwrap(), "api"])).unwrap();
        assert_eq!(loaded.as_deref(), Some(path.as_path()));
        assert_eq!(std::env::var("HASHTAG_COUNTER_CONF_SOURCE").unwrap(), "from-file");
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_load_env_missing_named_file_fails() {
        let path = std::env::temp_dir().join(format!("hashtag-counter-{}.missing", uuid::Uuid::new_v4()));
        let err = load_env(os_args(&["hashtag-counter", "--conf", path.to_str().unwrap()])).unwrap_err();
        assert!(matches!(err, ConfigError::EnvFile { .. }));
    }
}
