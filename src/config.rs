//! Shipper configuration.
//!
//! The configuration is a small JSON object; every field has a
//! default, so an empty object (or no configuration at all) yields a
//! production-shaped shipper.  The daemon accepts either inline JSON
//! or `@/path/to/file.json` on the command line, and falls back to
//! the `HSM_SHIPPER_CONFIG` environment variable.
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;

use crate::chain_error;
use crate::fresh_error;
use crate::result::Result;

/// Environment variable consulted when no `--config` flag is passed.
pub const CONFIG_ENV_VAR: &str = "HSM_SHIPPER_CONFIG";

fn default_mdt_watch_glob() -> String {
    "/sys/kernel/debug/lustre/mdt/*-MDT????/hsm/actions".to_owned()
}

fn default_cache_path() -> PathBuf {
    "/var/cache/hsm-action-shipper/cache.json".into()
}

fn default_poll_interval() -> u64 {
    20
}

fn default_reconcile_interval() -> u64 {
    21_600
}

fn default_redis_host() -> String {
    "localhost".to_owned()
}

fn default_redis_port() -> u16 {
    6379
}

fn default_stream_prefix() -> String {
    "hsm:actions".to_owned()
}

fn default_trim_chunk_size() -> usize {
    1_000
}

fn default_aggressive_trim_threshold() -> u64 {
    5_000
}

fn default_replay_chunk_size() -> usize {
    1_000
}

/// Everything the shipper daemon can be told about its environment.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Config {
    /// Glob matched against the kernel debugfs tree to find per-MDT
    /// `hsm/actions` files.
    #[serde(default = "default_mdt_watch_glob")]
    pub mdt_watch_glob: String,

    /// Location of the persistent action cache.
    #[serde(default = "default_cache_path")]
    pub cache_path: PathBuf,

    /// Seconds between shipper poll cycles.
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,

    /// Seconds between maintenance passes over the owned streams.
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval: u64,

    #[serde(default = "default_redis_host")]
    pub redis_host: String,

    #[serde(default = "default_redis_port")]
    pub redis_port: u16,

    #[serde(default)]
    pub redis_db: i64,

    #[serde(default)]
    pub redis_password: Option<String>,

    /// Stream key prefix; one stream per MDT at `prefix:mdt`.
    #[serde(default = "default_stream_prefix")]
    pub redis_stream_prefix: String,

    /// `XTRIM ... LIMIT` for each chunked trim call.
    #[serde(default = "default_trim_chunk_size")]
    pub trim_chunk_size: usize,

    /// A trim that removes more than this many entries is re-issued
    /// immediately instead of waiting for the next maintenance pass.
    #[serde(default = "default_aggressive_trim_threshold")]
    pub aggressive_trim_threshold: u64,

    /// `XRANGE ... COUNT` page size during stream replay.
    #[serde(default = "default_replay_chunk_size")]
    pub replay_chunk_size: usize,

    /// Diagnostic verbosity, in `RUST_LOG`/`EnvFilter` syntax.  The
    /// `--log` flag takes precedence, then this, then the
    /// environment.
    #[serde(default)]
    pub log_level: Option<String>,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            mdt_watch_glob: default_mdt_watch_glob(),
            cache_path: default_cache_path(),
            poll_interval: default_poll_interval(),
            reconcile_interval: default_reconcile_interval(),
            redis_host: default_redis_host(),
            redis_port: default_redis_port(),
            redis_db: 0,
            redis_password: None,
            redis_stream_prefix: default_stream_prefix(),
            trim_chunk_size: default_trim_chunk_size(),
            aggressive_trim_threshold: default_aggressive_trim_threshold(),
            replay_chunk_size: default_replay_chunk_size(),
            log_level: None,
        }
    }
}

impl Config {
    /// Parses a configuration string: either inline JSON, or
    /// `@/path/to/file.json` to read the JSON from that file.
    pub fn parse_configuration_string(config: &str) -> Result<Config> {
        let parsed: Config = if let Some(path) = config.strip_prefix('@') {
            let contents = std::fs::read_to_string(path)
                .map_err(|e| chain_error!(e, "failed to read configuration file", path))?;
            serde_json::from_str(&contents)
                .map_err(|e| chain_error!(e, "failed to parse configuration file", path))?
        } else {
            serde_json::from_str(config)
                .map_err(|e| chain_error!(e, "failed to parse configuration string", config))?
        };

        parsed.validate()?;
        Ok(parsed)
    }

    /// Resolves the effective configuration: the explicit string if
    /// any, the `HSM_SHIPPER_CONFIG` environment variable otherwise,
    /// and built-in defaults when neither is set.
    pub fn resolve(explicit: Option<&str>) -> Result<Config> {
        if let Some(config) = explicit {
            return Config::parse_configuration_string(config);
        }

        match std::env::var(CONFIG_ENV_VAR) {
            Ok(value) => Config::parse_configuration_string(&value),
            Err(std::env::VarError::NotPresent) => Ok(Config::default()),
            Err(e) => Err(chain_error!(e, "failed to read configuration env var")),
        }
    }

    /// Rejects configurations the daemon cannot run with.  Startup
    /// fails (non-zero exit) on any of these.
    pub fn validate(&self) -> Result<()> {
        glob::Pattern::new(&self.mdt_watch_glob)
            .map_err(|e| chain_error!(e, "invalid mdt_watch_glob", glob = %self.mdt_watch_glob))?;

        if self.poll_interval == 0 {
            return Err(fresh_error!("poll_interval must be at least 1 second"));
        }
        if self.redis_stream_prefix.is_empty() {
            return Err(fresh_error!("redis_stream_prefix must not be empty"));
        }
        if self.trim_chunk_size == 0 {
            return Err(fresh_error!("trim_chunk_size must be positive"));
        }
        if self.replay_chunk_size == 0 {
            return Err(fresh_error!("replay_chunk_size must be positive"));
        }
        if self.cache_path.parent().is_none() || self.cache_path.file_name().is_none() {
            return Err(fresh_error!("cache_path must name a file", path = ?self.cache_path));
        }

        Ok(())
    }
}

#[test]
fn empty_object_is_the_default_config() {
    let config = Config::parse_configuration_string("{}").expect("should parse");

    assert_eq!(config, Config::default());
    assert_eq!(config.poll_interval, 20);
    assert_eq!(config.reconcile_interval, 21_600);
    assert_eq!(config.redis_stream_prefix, "hsm:actions");
    assert_eq!(
        config.cache_path,
        PathBuf::from("/var/cache/hsm-action-shipper/cache.json")
    );
}

#[test]
fn overrides_and_defaults_mix() {
    let config = Config::parse_configuration_string(
        r#"{"redis_host": "mds-redis", "redis_db": 1, "poll_interval": 5,
            "redis_password": "hunter2", "trim_chunk_size": 250}"#,
    )
    .expect("should parse");

    assert_eq!(config.redis_host, "mds-redis");
    assert_eq!(config.redis_db, 1);
    assert_eq!(config.poll_interval, 5);
    assert_eq!(config.redis_password.as_deref(), Some("hunter2"));
    assert_eq!(config.trim_chunk_size, 250);
    // Untouched fields keep their defaults.
    assert_eq!(config.redis_port, 6379);
    assert_eq!(config.aggressive_trim_threshold, 5_000);
}

#[test]
fn at_file_configuration() {
    use std::io::Write;

    let mut file = tempfile::NamedTempFile::new().expect("should create temp file");
    write!(file, r#"{{"redis_stream_prefix": "hsm:test"}}"#).expect("should write");

    let config =
        Config::parse_configuration_string(&format!("@{}", file.path().display()))
            .expect("should parse");
    assert_eq!(config.redis_stream_prefix, "hsm:test");
}

#[test]
fn bad_configurations_are_rejected() {
    assert!(Config::parse_configuration_string("not json").is_err());
    assert!(Config::parse_configuration_string(r#"{"poll_interval": 0}"#).is_err());
    assert!(Config::parse_configuration_string(r#"{"mdt_watch_glob": "[oops"}"#).is_err());
    assert!(Config::parse_configuration_string(r#"{"trim_chunk_size": 0}"#).is_err());
}
