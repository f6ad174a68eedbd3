use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_RPC_URL: &str = "http://127.0.0.1:8545";
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 3;
pub const DEFAULT_STALL_THRESHOLD: u32 = 100;
pub const DEFAULT_RESTART_DELAY_SECS: u64 = 1;
/// Upper bound for every duration key. Larger values are clamped so timer
/// deadlines stay representable.
pub const MAX_DURATION_SECS: u64 = 365 * 24 * 60 * 60;

/// Configuration as read from heightwatch.toml.
///
/// Integer keys are signed so a negative value degrades to its default
/// instead of rejecting the whole file.
#[derive(Debug, Default)]
pub struct FileConfig {
    pub rpc_url: Option<String>,
    pub poll_interval_secs: Option<i64>,
    pub stall_threshold: Option<i64>,
    pub restart_delay_secs: Option<i64>,
    pub grace_period_secs: Option<i64>,
    pub log_file: Option<PathBuf>,
    pub status_file: Option<PathBuf>,
}

/// Command-line values that take precedence over the file.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub rpc_url: Option<String>,
    pub poll_interval_secs: Option<i64>,
    pub stall_threshold: Option<i64>,
    pub log_file: Option<PathBuf>,
    pub status_file: Option<PathBuf>,
}

/// Fully resolved, immutable watchdog settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub rpc_url: String,
    pub poll_interval: Duration,
    pub stall_threshold: u32,
    pub restart_delay: Duration,
    /// How long to wait for a graceful exit before forcing. `None` waits forever.
    pub grace_period: Option<Duration>,
    pub log_file: Option<PathBuf>,
    pub status_file: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        FileConfig::default().resolve(&Overrides::default())
    }
}

impl FileConfig {
    /// Merge CLI overrides and replace missing or non-positive values with defaults.
    pub fn resolve(self, overrides: &Overrides) -> Settings {
        let rpc_url = overrides
            .rpc_url
            .clone()
            .or(self.rpc_url)
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty())
            .unwrap_or_else(|| DEFAULT_RPC_URL.to_string());

        let poll_interval_secs = positive(overrides.poll_interval_secs.or(self.poll_interval_secs))
            .map(clamp_secs)
            .unwrap_or(DEFAULT_POLL_INTERVAL_SECS);
        let stall_threshold = positive(overrides.stall_threshold.or(self.stall_threshold))
            .map(|n| u32::try_from(n).unwrap_or(u32::MAX))
            .unwrap_or(DEFAULT_STALL_THRESHOLD);
        let restart_delay_secs = positive(self.restart_delay_secs)
            .map(clamp_secs)
            .unwrap_or(DEFAULT_RESTART_DELAY_SECS);
        let grace_period = positive(self.grace_period_secs)
            .map(clamp_secs)
            .map(Duration::from_secs);

        Settings {
            rpc_url,
            poll_interval: Duration::from_secs(poll_interval_secs),
            stall_threshold,
            restart_delay: Duration::from_secs(restart_delay_secs),
            grace_period,
            log_file: overrides.log_file.clone().or(self.log_file),
            status_file: overrides.status_file.clone().or(self.status_file),
        }
    }
}

fn positive(value: Option<i64>) -> Option<u64> {
    value.filter(|v| *v > 0).map(|v| v as u64)
}

fn clamp_secs(secs: u64) -> u64 {
    secs.min(MAX_DURATION_SECS)
}

/// A parsed config file plus the keys that were dropped while reading it.
#[derive(Debug, Default)]
pub struct LoadedConfig {
    pub config: FileConfig,
    /// One entry per unknown or wrongly typed key, ready to be logged.
    pub ignored: Vec<String>,
}

impl LoadedConfig {
    /// Parse TOML text one key at a time.
    ///
    /// Only a syntax error fails the whole file. A key with the wrong type
    /// is left unset (so it takes its default) and reported in `ignored`.
    pub fn parse(contents: &str) -> Result<Self, toml::de::Error> {
        let mut table: toml::Table = toml::from_str(contents)?;
        let mut ignored = Vec::new();

        let config = FileConfig {
            rpc_url: take(&mut table, "rpc_url", &mut ignored),
            poll_interval_secs: take(&mut table, "poll_interval_secs", &mut ignored),
            stall_threshold: take(&mut table, "stall_threshold", &mut ignored),
            restart_delay_secs: take(&mut table, "restart_delay_secs", &mut ignored),
            grace_period_secs: take(&mut table, "grace_period_secs", &mut ignored),
            log_file: take(&mut table, "log_file", &mut ignored),
            status_file: take(&mut table, "status_file", &mut ignored),
        };
        ignored.extend(table.keys().map(|key| format!("{key}: unknown key")));

        Ok(LoadedConfig { config, ignored })
    }
}

fn take<T: DeserializeOwned>(
    table: &mut toml::Table,
    key: &str,
    ignored: &mut Vec<String>,
) -> Option<T> {
    let value = table.remove(key)?;
    match value.try_into() {
        Ok(v) => Some(v),
        Err(e) => {
            ignored.push(format!("{key}: {}", e.message()));
            None
        }
    }
}

/// Load the config file at `path`.
///
/// A missing file is not an error and yields defaults. Read and syntax
/// failures are returned so the caller can log them after logging is up.
pub fn load_config(path: &Path) -> Result<LoadedConfig, ConfigError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(LoadedConfig::default()),
        Err(e) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source: e,
            })
        }
    };

    LoadedConfig::parse(&contents).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Errors from loading the config file.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn parse(contents: &str) -> FileConfig {
        let loaded = LoadedConfig::parse(contents).unwrap();
        assert!(loaded.ignored.is_empty(), "ignored: {:?}", loaded.ignored);
        loaded.config
    }

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.rpc_url, "http://127.0.0.1:8545");
        assert_eq!(settings.poll_interval, Duration::from_secs(3));
        assert_eq!(settings.stall_threshold, 100);
        assert_eq!(settings.restart_delay, Duration::from_secs(1));
        assert_eq!(settings.grace_period, None);
        assert!(settings.log_file.is_none());
        assert!(settings.status_file.is_none());
    }

    #[test]
    fn test_parse_full_file() {
        let cfg = parse(
            r#"
rpc_url = "http://10.0.0.5:8545"
poll_interval_secs = 10
stall_threshold = 20
restart_delay_secs = 5
grace_period_secs = 30
log_file = "heightwatch.log"
status_file = "heightwatch.status"
"#,
        );
        let settings = cfg.resolve(&Overrides::default());
        assert_eq!(settings.rpc_url, "http://10.0.0.5:8545");
        assert_eq!(settings.poll_interval, Duration::from_secs(10));
        assert_eq!(settings.stall_threshold, 20);
        assert_eq!(settings.restart_delay, Duration::from_secs(5));
        assert_eq!(settings.grace_period, Some(Duration::from_secs(30)));
        assert_eq!(settings.log_file, Some(PathBuf::from("heightwatch.log")));
        assert_eq!(settings.status_file, Some(PathBuf::from("heightwatch.status")));
    }

    #[test]
    fn test_non_positive_values_fall_back() {
        let cfg = parse(
            r#"
poll_interval_secs = 0
stall_threshold = -4
restart_delay_secs = -1
grace_period_secs = -10
"#,
        );
        let settings = cfg.resolve(&Overrides::default());
        assert_eq!(settings.poll_interval, Duration::from_secs(3));
        assert_eq!(settings.stall_threshold, 100);
        assert_eq!(settings.restart_delay, Duration::from_secs(1));
        assert_eq!(settings.grace_period, None);
    }

    #[test]
    fn test_blank_rpc_url_falls_back() {
        let cfg = parse(r#"rpc_url = "   ""#);
        assert_eq!(cfg.resolve(&Overrides::default()).rpc_url, DEFAULT_RPC_URL);
    }

    #[test]
    fn test_overrides_take_precedence() {
        let cfg = parse(
            r#"
rpc_url = "http://file:8545"
poll_interval_secs = 10
stall_threshold = 20
"#,
        );
        let overrides = Overrides {
            rpc_url: Some("http://cli:8545".to_string()),
            poll_interval_secs: Some(1),
            stall_threshold: Some(5),
            log_file: Some(PathBuf::from("cli.log")),
            status_file: None,
        };
        let settings = cfg.resolve(&overrides);
        assert_eq!(settings.rpc_url, "http://cli:8545");
        assert_eq!(settings.poll_interval, Duration::from_secs(1));
        assert_eq!(settings.stall_threshold, 5);
        assert_eq!(settings.log_file, Some(PathBuf::from("cli.log")));
    }

    #[test]
    fn test_invalid_override_uses_default_not_file() {
        let cfg = parse("stall_threshold = 20");
        let overrides = Overrides {
            stall_threshold: Some(0),
            ..Default::default()
        };
        assert_eq!(cfg.resolve(&overrides).stall_threshold, DEFAULT_STALL_THRESHOLD);
    }

    #[test]
    fn test_huge_threshold_saturates() {
        let cfg = parse("stall_threshold = 99999999999");
        assert_eq!(cfg.resolve(&Overrides::default()).stall_threshold, u32::MAX);
    }

    #[test]
    fn test_huge_durations_are_clamped() {
        let cfg = parse(
            r#"
poll_interval_secs = 9223372036854775807
restart_delay_secs = 9223372036854775807
grace_period_secs = 9223372036854775807
"#,
        );
        let settings = cfg.resolve(&Overrides::default());
        let max = Duration::from_secs(MAX_DURATION_SECS);
        assert_eq!(settings.poll_interval, max);
        assert_eq!(settings.restart_delay, max);
        assert_eq!(settings.grace_period, Some(max));
        assert!(tokio::time::Instant::now()
            .checked_add(settings.poll_interval)
            .is_some());
    }

    #[test]
    fn test_huge_interval_override_is_clamped() {
        let overrides = Overrides {
            poll_interval_secs: Some(i64::MAX),
            ..Default::default()
        };
        let settings = FileConfig::default().resolve(&overrides);
        assert_eq!(settings.poll_interval, Duration::from_secs(MAX_DURATION_SECS));
    }

    #[test]
    fn test_wrong_typed_key_keeps_the_others() {
        let loaded = LoadedConfig::parse(
            r#"
rpc_url = "http://10.0.0.5:8545"
stall_threshold = "5"
poll_interval_secs = 2.5
restart_delay_secs = 4
"#,
        )
        .unwrap();
        assert_eq!(loaded.ignored.len(), 2);
        assert!(loaded.ignored.iter().any(|m| m.starts_with("stall_threshold:")));
        assert!(loaded.ignored.iter().any(|m| m.starts_with("poll_interval_secs:")));

        let settings = loaded.config.resolve(&Overrides::default());
        assert_eq!(settings.rpc_url, "http://10.0.0.5:8545");
        assert_eq!(settings.restart_delay, Duration::from_secs(4));
        assert_eq!(settings.stall_threshold, DEFAULT_STALL_THRESHOLD);
        assert_eq!(settings.poll_interval, Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS));
    }

    #[test]
    fn test_unknown_key_is_reported() {
        let loaded = LoadedConfig::parse("stall_threshold = 9\nstall_treshold = 4\n").unwrap();
        assert_eq!(loaded.ignored, vec!["stall_treshold: unknown key".to_string()]);
        assert_eq!(loaded.config.stall_threshold, Some(9));
    }

    #[test]
    fn test_load_missing_file_is_default() {
        let dir = tempdir().unwrap();
        let loaded = load_config(&dir.path().join("absent.toml")).unwrap();
        assert!(loaded.ignored.is_empty());
        assert_eq!(loaded.config.resolve(&Overrides::default()), Settings::default());
    }

    #[test]
    fn test_load_malformed_file_is_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("heightwatch.toml");
        std::fs::write(&path, "poll_interval_secs = [3").unwrap();
        let err = load_config(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("failed to parse config"));
    }

    #[test]
    fn test_load_valid_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("heightwatch.toml");
        std::fs::write(&path, "stall_threshold = 7\nrpc_url = 8545\n").unwrap();
        let loaded = load_config(&path).unwrap();
        assert_eq!(loaded.ignored.len(), 1);
        assert_eq!(loaded.config.resolve(&Overrides::default()).stall_threshold, 7);
    }
}
