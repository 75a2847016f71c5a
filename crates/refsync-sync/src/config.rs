//! Run configuration: YAML file, then environment overrides, then validation.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use refsync_adapters::{FeedSchema, SchemaError};
use refsync_storage::RunKey;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_COMMIT_INTERVAL: usize = 500;
pub const DEFAULT_DELETE_THRESHOLD: f64 = 0.2;
pub const DEFAULT_COMMIT_RETRIES: usize = 2;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("missing required setting `{0}`")]
    Missing(&'static str),
    #[error("invalid value {value:?} for `{key}`: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error(transparent)]
    Schema(#[from] SchemaError),
}

/// Whether the pre-check gate runs, and how the feed is read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunMode {
    #[default]
    FullStreaming,
    TwoPass,
    InMemoryCompare,
}

impl RunMode {
    /// Only `two-pass` evaluates the delete-threshold gate.
    pub fn runs_precheck(&self) -> bool {
        matches!(self, Self::TwoPass)
    }

    /// `in-memory-compare` parses the whole cache before reconciling.
    pub fn materializes_rows(&self) -> bool {
        matches!(self, Self::InMemoryCompare)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FullStreaming => "full-streaming",
            Self::TwoPass => "two-pass",
            Self::InMemoryCompare => "in-memory-compare",
        }
    }
}

impl FromStr for RunMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full-streaming" => Ok(Self::FullStreaming),
            "two-pass" => Ok(Self::TwoPass),
            "in-memory-compare" => Ok(Self::InMemoryCompare),
            other => Err(format!(
                "unknown mode `{other}` (expected full-streaming, two-pass or in-memory-compare)"
            )),
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a row-level parse or transform error does to the run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorPolicy {
    #[default]
    StopOnError,
    BestEffort,
    /// Holds every mutation until the feed is exhausted, then commits once.
    AllOrNothing,
}

impl ErrorPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StopOnError => "stop-on-error",
            Self::BestEffort => "best-effort",
            Self::AllOrNothing => "all-or-nothing",
        }
    }
}

impl FromStr for ErrorPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stop-on-error" => Ok(Self::StopOnError),
            "best-effort" => Ok(Self::BestEffort),
            "all-or-nothing" => Ok(Self::AllOrNothing),
            other => Err(format!(
                "unknown error policy `{other}` (expected stop-on-error, best-effort or all-or-nothing)"
            )),
        }
    }
}

impl fmt::Display for ErrorPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happens to persisted entities the feed no longer mentions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StalePolicy {
    #[default]
    Keep,
    MarkStale,
    Delete,
}

impl FromStr for StalePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "keep" => Ok(Self::Keep),
            "mark-stale" => Ok(Self::MarkStale),
            "delete" => Ok(Self::Delete),
            other => Err(format!(
                "unknown stale policy `{other}` (expected keep, mark-stale or delete)"
            )),
        }
    }
}

/// On-disk shape; every key optional so env overrides can fill gaps.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunConfigFile {
    pub input_url: Option<String>,
    pub download_cache: Option<PathBuf>,
    pub checkpoint_path: Option<PathBuf>,
    pub commit_interval: Option<usize>,
    pub delete_threshold_fraction: Option<f64>,
    pub mode: Option<RunMode>,
    pub error_policy: Option<ErrorPolicy>,
    pub stale_policy: Option<StalePolicy>,
    pub commit_retries: Option<usize>,
    pub run_label: Option<String>,
    pub http_timeout_secs: Option<u64>,
    pub user_agent: Option<String>,
    pub database_url: Option<String>,
    pub reports_dir: Option<PathBuf>,
    pub schema: Option<FeedSchema>,
}

impl RunConfigFile {
    pub fn read(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub input_url: String,
    pub download_cache: PathBuf,
    pub checkpoint_path: PathBuf,
    pub commit_interval: usize,
    pub delete_threshold_fraction: f64,
    pub mode: RunMode,
    pub error_policy: ErrorPolicy,
    pub stale_policy: StalePolicy,
    pub commit_retries: usize,
    pub run_label: Option<String>,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub database_url: Option<String>,
    pub reports_dir: PathBuf,
    pub schema: FeedSchema,
}

fn default_checkpoint_path(download_cache: &Path) -> PathBuf {
    let mut name = download_cache
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".checkpoint.json");
    download_cache.with_file_name(name)
}

fn parse_env<T: FromStr>(key: &'static str, raw: String) -> Result<T, ConfigError>
where
    T::Err: fmt::Display,
{
    raw.parse::<T>().map_err(|err| ConfigError::Invalid {
        key,
        reason: err.to_string(),
        value: raw,
    })
}

impl RunConfig {
    /// Defaults for everything except the two required settings.
    pub fn new(input_url: impl Into<String>, download_cache: impl Into<PathBuf>) -> Self {
        let download_cache = download_cache.into();
        Self {
            input_url: input_url.into(),
            checkpoint_path: default_checkpoint_path(&download_cache),
            download_cache,
            commit_interval: DEFAULT_COMMIT_INTERVAL,
            delete_threshold_fraction: DEFAULT_DELETE_THRESHOLD,
            mode: RunMode::default(),
            error_policy: ErrorPolicy::default(),
            stale_policy: StalePolicy::default(),
            commit_retries: DEFAULT_COMMIT_RETRIES,
            run_label: None,
            http_timeout_secs: 60,
            user_agent: "refsync/0.1".to_string(),
            database_url: None,
            reports_dir: PathBuf::from("./reports"),
            schema: FeedSchema::default(),
        }
    }

    /// Load from an optional YAML file, then apply `REFSYNC_*` / `DATABASE_URL` overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let file = match path {
            Some(path) => RunConfigFile::read(path)?,
            None => RunConfigFile::default(),
        };
        Self::resolve(file, |key| std::env::var(key).ok())
    }

    pub fn resolve(
        file: RunConfigFile,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let input_url = env("REFSYNC_INPUT_URL")
            .or(file.input_url)
            .ok_or(ConfigError::Missing("input_url"))?;
        let download_cache = env("REFSYNC_DOWNLOAD_CACHE")
            .map(PathBuf::from)
            .or(file.download_cache)
            .ok_or(ConfigError::Missing("download_cache"))?;

        let mut config = Self::new(input_url, download_cache);

        if let Some(path) = env("REFSYNC_CHECKPOINT_PATH")
            .map(PathBuf::from)
            .or(file.checkpoint_path)
        {
            config.checkpoint_path = path;
        }
        config.commit_interval = match env("REFSYNC_COMMIT_INTERVAL") {
            Some(raw) => parse_env("commit_interval", raw)?,
            None => file.commit_interval.unwrap_or(config.commit_interval),
        };
        config.delete_threshold_fraction = match env("REFSYNC_DELETE_THRESHOLD") {
            Some(raw) => parse_env("delete_threshold_fraction", raw)?,
            None => file
                .delete_threshold_fraction
                .unwrap_or(config.delete_threshold_fraction),
        };
        config.mode = match env("REFSYNC_MODE") {
            Some(raw) => parse_env("mode", raw)?,
            None => file.mode.unwrap_or_default(),
        };
        config.error_policy = match env("REFSYNC_ERROR_POLICY") {
            Some(raw) => parse_env("error_policy", raw)?,
            None => file.error_policy.unwrap_or_default(),
        };
        config.stale_policy = match env("REFSYNC_STALE_POLICY") {
            Some(raw) => parse_env("stale_policy", raw)?,
            None => file.stale_policy.unwrap_or_default(),
        };
        config.commit_retries = match env("REFSYNC_COMMIT_RETRIES") {
            Some(raw) => parse_env("commit_retries", raw)?,
            None => file.commit_retries.unwrap_or(config.commit_retries),
        };
        config.run_label = env("REFSYNC_RUN_LABEL").or(file.run_label);
        config.http_timeout_secs = match env("REFSYNC_HTTP_TIMEOUT_SECS") {
            Some(raw) => parse_env("http_timeout_secs", raw)?,
            None => file.http_timeout_secs.unwrap_or(config.http_timeout_secs),
        };
        if let Some(user_agent) = env("REFSYNC_USER_AGENT").or(file.user_agent) {
            config.user_agent = user_agent;
        }
        config.database_url = env("DATABASE_URL").or(file.database_url);
        if let Some(dir) = env("REFSYNC_REPORTS_DIR")
            .map(PathBuf::from)
            .or(file.reports_dir)
        {
            config.reports_dir = dir;
        }
        if let Some(schema) = file.schema {
            config.schema = schema;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.input_url.trim().is_empty() {
            return Err(ConfigError::Missing("input_url"));
        }
        if self.download_cache.as_os_str().is_empty() {
            return Err(ConfigError::Missing("download_cache"));
        }
        if self.commit_interval == 0 {
            return Err(ConfigError::Invalid {
                key: "commit_interval",
                value: "0".to_string(),
                reason: "must be a positive number of rows".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.delete_threshold_fraction) {
            return Err(ConfigError::Invalid {
                key: "delete_threshold_fraction",
                value: self.delete_threshold_fraction.to_string(),
                reason: "must be within [0, 1]".to_string(),
            });
        }
        self.schema.validate()?;
        Ok(())
    }

    pub fn run_key(&self) -> RunKey {
        RunKey::derive(&self.input_url, self.run_label.as_deref())
    }
}
