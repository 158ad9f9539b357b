use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use camino::Utf8PathBuf;
use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::GrimError;
use crate::retry::RetryPolicy;

pub const CONFIG_FILE_NAME: &str = "grimperium.json";

pub const DEFAULT_CREST_KEYWORDS: &str = "--gfn2";
pub const DEFAULT_MOPAC_KEYWORDS: &str = "PM7 PRECISE XYZ";
pub const DEFAULT_REPOSITORY_PATH: &str = "repository";
pub const DEFAULT_CBS_DB_PATH: &str = "data/thermo_cbs.csv";
pub const DEFAULT_PM7_DB_PATH: &str = "data/thermo_pm7.csv";
pub const DEFAULT_LISTS_DIRECTORY: &str = "data/lists";

pub const CONFORMER_SEARCH_TIMEOUT_SECS: u64 = 3600;
pub const QUANTUM_TIMEOUT_SECS: u64 = 1800;
pub const CONVERSION_TIMEOUT_SECS: u64 = 60;
pub const EXECUTABLE_CHECK_TIMEOUT_SECS: u64 = 10;
pub const LOCK_WAIT_TIMEOUT_SECS: u64 = 30;

/// Whole-run attempts when neither the config nor `--retries` asks for more.
pub const DEFAULT_RUN_ATTEMPTS: u32 = 1;

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub executables: ExecutablesEntry,
    #[serde(default)]
    pub crest_keywords: Option<String>,
    #[serde(default)]
    pub mopac_keywords: Option<String>,
    #[serde(default)]
    pub repository_base_path: Option<String>,
    #[serde(default)]
    pub database: DatabaseEntry,
    #[serde(default)]
    pub general_settings: GeneralSettingsEntry,
    #[serde(default)]
    pub timeouts: TimeoutsEntry,
    #[serde(default)]
    pub retry: RetryEntry,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct ExecutablesEntry {
    #[serde(default)]
    pub crest: Option<String>,
    #[serde(default)]
    pub mopac: Option<String>,
    #[serde(default)]
    pub obabel: Option<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct DatabaseEntry {
    #[serde(default)]
    pub cbs_db_path: Option<String>,
    #[serde(default)]
    pub pm7_db_path: Option<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct GeneralSettingsEntry {
    #[serde(default)]
    pub verbose: Option<bool>,
    #[serde(default)]
    pub lists_directory: Option<String>,
}

/// Timeouts in seconds.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct TimeoutsEntry {
    #[serde(default)]
    pub conformer_search: Option<u64>,
    #[serde(default)]
    pub quantum: Option<u64>,
    #[serde(default)]
    pub conversion: Option<u64>,
    #[serde(default)]
    pub executable_check: Option<u64>,
    #[serde(default)]
    pub lock_wait: Option<u64>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct RetryEntry {
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub delay_ms: Option<u64>,
    #[serde(default)]
    pub backoff: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Executables {
    pub crest: String,
    pub mopac: String,
    pub obabel: String,
}

impl Default for Executables {
    fn default() -> Self {
        Self {
            crest: "crest".to_string(),
            mopac: "mopac".to_string(),
            obabel: "obabel".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub conformer_search: Duration,
    pub quantum: Duration,
    pub conversion: Duration,
    pub executable_check: Duration,
    pub lock_wait: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            conformer_search: Duration::from_secs(CONFORMER_SEARCH_TIMEOUT_SECS),
            quantum: Duration::from_secs(QUANTUM_TIMEOUT_SECS),
            conversion: Duration::from_secs(CONVERSION_TIMEOUT_SECS),
            executable_check: Duration::from_secs(EXECUTABLE_CHECK_TIMEOUT_SECS),
            lock_wait: Duration::from_secs(LOCK_WAIT_TIMEOUT_SECS),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub source: Option<PathBuf>,
    pub executables: Executables,
    pub crest_keywords: String,
    pub mopac_keywords: String,
    pub repository_base_path: Utf8PathBuf,
    pub cbs_db_path: Utf8PathBuf,
    pub pm7_db_path: Utf8PathBuf,
    pub verbose: bool,
    pub lists_directory: Utf8PathBuf,
    pub timeouts: Timeouts,
    pub retry: RetryPolicy,
}

impl ResolvedConfig {
    /// `path` itself when it exists, otherwise the same name under
    /// `lists_directory`, trying a `.txt` extension for bare names.
    pub fn resolve_list_path(&self, path: &Path) -> PathBuf {
        if path.exists() || path.is_absolute() {
            return path.to_path_buf();
        }
        let in_lists = self.lists_directory.as_std_path().join(path);
        if in_lists.is_file() {
            debug!(path = %in_lists.display(), "found list in lists directory");
            return in_lists;
        }
        if path.extension().is_none() {
            let with_txt = in_lists.with_extension("txt");
            if with_txt.is_file() {
                debug!(path = %with_txt.display(), "found list in lists directory");
                return with_txt;
            }
        }
        path.to_path_buf()
    }

    pub fn not_found_list_path(&self) -> Utf8PathBuf {
        self.repository_base_path
            .join("not-found")
            .join("not-found.txt")
    }
}

impl Default for ResolvedConfig {
    fn default() -> Self {
        Self {
            source: None,
            executables: Executables::default(),
            crest_keywords: DEFAULT_CREST_KEYWORDS.to_string(),
            mopac_keywords: DEFAULT_MOPAC_KEYWORDS.to_string(),
            repository_base_path: Utf8PathBuf::from(DEFAULT_REPOSITORY_PATH),
            cbs_db_path: Utf8PathBuf::from(DEFAULT_CBS_DB_PATH),
            pm7_db_path: Utf8PathBuf::from(DEFAULT_PM7_DB_PATH),
            verbose: false,
            lists_directory: Utf8PathBuf::from(DEFAULT_LISTS_DIRECTORY),
            timeouts: Timeouts::default(),
            retry: default_retry(),
        }
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Loads `path`, or `grimperium.json` from the working directory, or the
    /// user config directory; falls back to defaults when nothing is found.
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, GrimError> {
        let config_path = match path {
            Some(path) => Some(PathBuf::from(path)),
            None => Self::discover(),
        };

        let Some(config_path) = config_path else {
            info!("no {CONFIG_FILE_NAME} found, using built-in defaults");
            return Self::resolve_config(Config::default());
        };

        if !config_path.is_file() {
            return Err(GrimError::ConfigRead(config_path));
        }

        info!(path = %config_path.display(), "loading configuration");
        let content = fs::read_to_string(&config_path)
            .map_err(|_| GrimError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| GrimError::ConfigParse(err.to_string()))?;

        let mut resolved = Self::resolve_config(config)?;
        resolved.source = Some(config_path);
        Ok(resolved)
    }

    fn discover() -> Option<PathBuf> {
        let local = PathBuf::from(CONFIG_FILE_NAME);
        if local.is_file() {
            return Some(local);
        }
        let user = BaseDirs::new()
            .map(|dirs| dirs.config_dir().join("grimperium").join(CONFIG_FILE_NAME))?;
        debug!(path = %user.display(), "checking user configuration");
        user.is_file().then_some(user)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, GrimError> {
        let defaults = Executables::default();
        let executables = Executables {
            crest: non_empty("executables.crest", config.executables.crest)?
                .unwrap_or(defaults.crest),
            mopac: non_empty("executables.mopac", config.executables.mopac)?
                .unwrap_or(defaults.mopac),
            obabel: non_empty("executables.obabel", config.executables.obabel)?
                .unwrap_or(defaults.obabel),
        };

        let crest_keywords = config
            .crest_keywords
            .unwrap_or_else(|| DEFAULT_CREST_KEYWORDS.to_string());
        let mopac_keywords = non_empty("mopac_keywords", config.mopac_keywords)?
            .unwrap_or_else(|| DEFAULT_MOPAC_KEYWORDS.to_string());

        let repository_base_path = non_empty("repository_base_path", config.repository_base_path)?
            .unwrap_or_else(|| DEFAULT_REPOSITORY_PATH.to_string());
        let cbs_db_path = non_empty("database.cbs_db_path", config.database.cbs_db_path)?
            .unwrap_or_else(|| DEFAULT_CBS_DB_PATH.to_string());
        let pm7_db_path = non_empty("database.pm7_db_path", config.database.pm7_db_path)?
            .unwrap_or_else(|| DEFAULT_PM7_DB_PATH.to_string());
        let lists_directory = non_empty(
            "general_settings.lists_directory",
            config.general_settings.lists_directory,
        )?
        .unwrap_or_else(|| DEFAULT_LISTS_DIRECTORY.to_string());

        let defaults = Timeouts::default();
        let entry = config.timeouts;
        let timeouts = Timeouts {
            conformer_search: seconds(
                "timeouts.conformer_search",
                entry.conformer_search,
                defaults.conformer_search,
            )?,
            quantum: seconds("timeouts.quantum", entry.quantum, defaults.quantum)?,
            conversion: seconds("timeouts.conversion", entry.conversion, defaults.conversion)?,
            executable_check: seconds(
                "timeouts.executable_check",
                entry.executable_check,
                defaults.executable_check,
            )?,
            lock_wait: seconds("timeouts.lock_wait", entry.lock_wait, defaults.lock_wait)?,
        };

        let default_retry = default_retry();
        let retry = RetryPolicy::new(
            config.retry.max_attempts.unwrap_or(default_retry.max_attempts),
            config
                .retry
                .delay_ms
                .map(Duration::from_millis)
                .unwrap_or(default_retry.delay),
            config.retry.backoff.unwrap_or(default_retry.backoff),
        );

        Ok(ResolvedConfig {
            source: None,
            executables,
            crest_keywords,
            mopac_keywords,
            repository_base_path: Utf8PathBuf::from(repository_base_path),
            cbs_db_path: Utf8PathBuf::from(cbs_db_path),
            pm7_db_path: Utf8PathBuf::from(pm7_db_path),
            verbose: config.general_settings.verbose.unwrap_or(false),
            lists_directory: Utf8PathBuf::from(lists_directory),
            timeouts,
            retry,
        })
    }
}

fn default_retry() -> RetryPolicy {
    let base = RetryPolicy::default();
    RetryPolicy::new(DEFAULT_RUN_ATTEMPTS, base.delay, base.backoff)
}

fn non_empty(field: &str, value: Option<String>) -> Result<Option<String>, GrimError> {
    match value {
        Some(value) if value.trim().is_empty() => Err(GrimError::InvalidConfig(format!(
            "{field} must not be empty"
        ))),
        Some(value) => Ok(Some(value.trim().to_string())),
        None => Ok(None),
    }
}

fn seconds(field: &str, value: Option<u64>, default: Duration) -> Result<Duration, GrimError> {
    match value {
        Some(0) => Err(GrimError::InvalidConfig(format!(
            "{field} must be greater than zero"
        ))),
        Some(secs) => Ok(Duration::from_secs(secs)),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_resolves_to_defaults() {
        let resolved = ConfigLoader::resolve_config(Config::default()).unwrap();
        assert_eq!(resolved.executables, Executables::default());
        assert_eq!(resolved.crest_keywords, "--gfn2");
        assert_eq!(resolved.mopac_keywords, "PM7 PRECISE XYZ");
        assert_eq!(resolved.pm7_db_path, "data/thermo_pm7.csv");
        assert_eq!(resolved.timeouts, Timeouts::default());
        assert_eq!(resolved.retry.max_attempts, 1);
        assert_eq!(
            resolved.not_found_list_path(),
            "repository/not-found/not-found.txt"
        );
    }
}
