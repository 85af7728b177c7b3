use crate::runner::{
    RunnerOptions, DEFAULT_DRAIN_GRACE, DEFAULT_INACTIVITY_TIMEOUT, DEFAULT_POLL_INTERVAL,
};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration loaded from outdated.toml.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct OutdatedConfig {
    pub runner: RunnerConfig,
    pub graph: GraphConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Build tool executable.
    pub command: String,
    pub inactivity_timeout_secs: u64,
    pub poll_interval_ms: u64,
    /// Extra environment for the build tool, on top of the fixed MSBuild overrides.
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct GraphConfig {
    /// Runtime identifier passed as `RuntimeIdentifiers` (empty for none).
    pub runtime: String,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            command: "dotnet".to_string(),
            inactivity_timeout_secs: DEFAULT_INACTIVITY_TIMEOUT.as_secs(),
            poll_interval_ms: DEFAULT_POLL_INTERVAL.as_millis() as u64,
            env: BTreeMap::new(),
        }
    }
}

impl RunnerConfig {
    /// Reject settings the runner cannot work with.
    pub fn validate(&self) -> Result<(), String> {
        if self.command.trim().is_empty() {
            return Err("runner.command must not be empty".to_string());
        }
        // Zero would kill the tool on the first poll
        if self.inactivity_timeout_secs == 0 {
            return Err("runner.inactivity_timeout_secs must be at least 1".to_string());
        }
        Ok(())
    }

    pub fn options(&self) -> RunnerOptions {
        RunnerOptions {
            inactivity_timeout: Duration::from_secs(self.inactivity_timeout_secs),
            // A zero interval would spin
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(1)),
            drain_grace: DEFAULT_DRAIN_GRACE,
            env: self.env.clone(),
        }
    }
}

/// Errors loading the config file.
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
    Invalid {
        path: PathBuf,
        reason: String,
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
            ConfigError::Invalid { path, reason } => {
                write!(f, "invalid config {}: {}", path.display(), reason)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Invalid { .. } => None,
        }
    }
}

/// Load config from `path`. A missing file yields defaults; an unreadable,
/// malformed, or invalid one is an error.
pub fn load_config(path: &Path) -> Result<OutdatedConfig, ConfigError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(OutdatedConfig::default());
        }
        Err(e) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source: e,
            })
        }
    };
    let config: OutdatedConfig = toml::from_str(&contents).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        source: e,
    })?;
    config
        .runner
        .validate()
        .map_err(|reason| ConfigError::Invalid {
            path: path.to_path_buf(),
            reason,
        })?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = OutdatedConfig::default();
        assert_eq!(config.runner.command, "dotnet");
        assert_eq!(config.runner.inactivity_timeout_secs, 20);
        assert_eq!(config.runner.poll_interval_ms, 100);
        assert!(config.runner.env.is_empty());
        assert_eq!(config.graph.runtime, "");
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempdir().unwrap();
        let config = load_config(&dir.path().join("outdated.toml")).unwrap();
        assert_eq!(config.runner.command, "dotnet");
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("outdated.toml");
        std::fs::write(
            &path,
            r#"
[runner]
inactivity_timeout_secs = 60

[runner.env]
DOTNET_CLI_TELEMETRY_OPTOUT = "1"

[graph]
runtime = "linux-x64"
"#,
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.runner.command, "dotnet");
        assert_eq!(config.runner.inactivity_timeout_secs, 60);
        assert_eq!(config.runner.poll_interval_ms, 100);
        assert_eq!(config.runner.env["DOTNET_CLI_TELEMETRY_OPTOUT"], "1");
        assert_eq!(config.graph.runtime, "linux-x64");
    }

    #[test]
    fn test_malformed_file_is_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("outdated.toml");
        std::fs::write(&path, "[runner\ncommand = ").unwrap();

        let err = load_config(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("outdated.toml"));
    }

    #[test]
    fn test_zero_inactivity_timeout_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("outdated.toml");
        std::fs::write(&path, "[runner]\ninactivity_timeout_secs = 0\n").unwrap();

        let err = load_config(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
        assert!(err.to_string().contains("inactivity_timeout_secs"));
    }

    #[test]
    fn test_empty_command_rejected() {
        let config = RunnerConfig {
            command: "  ".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
        assert!(RunnerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_runner_options_conversion() {
        let config = RunnerConfig {
            inactivity_timeout_secs: 5,
            poll_interval_ms: 0,
            ..Default::default()
        };
        let options = config.options();
        assert_eq!(options.inactivity_timeout, Duration::from_secs(5));
        assert_eq!(options.poll_interval, Duration::from_millis(1));
    }
}
