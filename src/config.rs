use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Tunables for the supervisor loop and background worker pool.
///
/// The poll interval lives here rather than in a module constant; tests
/// shrink it to single-digit milliseconds to make output races reproducible,
/// and callers embedding the runner in a larger driver load it from TOML
/// alongside their other settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// How often the supervisor wakes to drain worker output, in ms.
    pub poll_interval_ms: u64,
    /// Worker process count for the background task runner.
    pub processes: u32,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 50,
            processes: 1,
        }
    }
}

/// Errors from loading or validating a [`RunnerConfig`].
#[derive(Debug)]
pub enum ConfigError {
    /// Failed to read the config file.
    Read {
        path: std::path::PathBuf,
        source: std::io::Error,
    },
    /// The TOML did not parse.
    Parse { source: toml::de::Error },
    /// A value is out of range.
    Invalid { message: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(
                    f,
                    "failed to read config file {}: {}",
                    path.display(),
                    source
                )
            }
            ConfigError::Parse { source } => write!(f, "failed to parse config: {}", source),
            ConfigError::Invalid { message } => write!(f, "invalid config: {}", message),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source } => Some(source),
            ConfigError::Invalid { .. } => None,
        }
    }
}

impl RunnerConfig {
    /// The poll interval as a [`Duration`].
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Parse from a TOML string and validate.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s).map_err(|e| ConfigError::Parse { source: e })?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file and validate.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_toml_str(&contents)
    }

    /// Reject values the supervisor cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                message: "poll_interval_ms must be greater than 0".to_string(),
            });
        }
        if self.processes == 0 {
            return Err(ConfigError::Invalid {
                message: "processes must be greater than 0".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = RunnerConfig::default();
        assert_eq!(config.poll_interval_ms, 50);
        assert_eq!(config.processes, 1);
        config.validate().unwrap();
    }

    #[test]
    fn parses_partial_toml_with_defaults() {
        let config = RunnerConfig::from_toml_str("poll_interval_ms = 10").unwrap();
        assert_eq!(config.poll_interval_ms, 10);
        assert_eq!(config.processes, 1);
        assert_eq!(config.poll_interval(), Duration::from_millis(10));
    }

    #[test]
    fn parses_full_toml() {
        let config = RunnerConfig::from_toml_str("poll_interval_ms = 25\nprocesses = 4\n").unwrap();
        assert_eq!(config.poll_interval_ms, 25);
        assert_eq!(config.processes, 4);
    }

    #[test]
    fn rejects_zero_poll_interval() {
        let err = RunnerConfig::from_toml_str("poll_interval_ms = 0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
        assert!(err.to_string().contains("poll_interval_ms"));
    }

    #[test]
    fn rejects_zero_processes() {
        let err = RunnerConfig::from_toml_str("processes = 0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
        assert!(err.to_string().contains("processes"));
    }

    #[test]
    fn rejects_malformed_toml() {
        let err = RunnerConfig::from_toml_str("poll_interval_ms = \"fast\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn load_missing_file_reports_path() {
        let err = RunnerConfig::load(Path::new("/nonexistent/runner.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
        assert!(err.to_string().contains("/nonexistent/runner.toml"));
    }
}
