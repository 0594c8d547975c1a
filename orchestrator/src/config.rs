use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::checkpoint::CheckpointConfig;
use crate::engine::SimulatedEngineConfig;
use crate::errors::{OrchestratorError, Result};
use crate::jobs::RunnerConfig;
use crate::model_manager::ModelManagerConfig;
use crate::orchestrator::OrchestratorConfig;

/// Main configuration for the orchestrator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub engine: EngineConfig,
    pub jobs: JobsConfig,
    pub logging: LoggingConfig,
}

/// HTTP listener
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
}

/// Where rows and checkpoints live
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    /// Defaults to `<data_dir>/orchestrator.db`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_path: Option<PathBuf>,
    /// Defaults to `<data_dir>/checkpoints`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_dir: Option<PathBuf>,
}

/// Engine selection and load behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub kind: String,
    pub load_timeout_secs: u64,
    pub retry_initial_secs: u64,
    pub retry_max_secs: u64,
    pub simulated: SimulatedEngineConfig,
}

/// Checkpoint cadence, recovery thresholds and watchdog
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsConfig {
    pub checkpoint_interval_secs: u64,
    pub checkpoint_progress_delta: f32,
    pub checkpoint_max_age_secs: u64,
    pub min_resume_progress: f32,
    pub watchdog_secs: u64,
    pub engine_stop_grace_secs: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub log_to_file: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                port: 8080,
            },
            storage: StorageConfig {
                data_dir: dirs::home_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join(".transcribe"),
                database_path: None,
                checkpoint_dir: None,
            },
            engine: EngineConfig {
                kind: "simulated".to_string(),
                load_timeout_secs: 300,
                retry_initial_secs: 5,
                retry_max_secs: 300,
                simulated: SimulatedEngineConfig::default(),
            },
            jobs: JobsConfig {
                checkpoint_interval_secs: 30,
                checkpoint_progress_delta: 0.05,
                checkpoint_max_age_secs: 24 * 60 * 60,
                min_resume_progress: 0.10,
                watchdog_secs: 30 * 60,
                engine_stop_grace_secs: 10,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                log_to_file: true,
                log_dir: None,
            },
        }
    }
}

impl Config {
    /// Get default configuration file path: `~/.transcribe/orchestrator.toml`
    pub fn default_path() -> Result<PathBuf> {
        let home = dirs::home_dir()
            .ok_or_else(|| OrchestratorError::Config("Cannot determine home directory".into()))?;
        Ok(home.join(".transcribe").join("orchestrator.toml"))
    }

    /// Load configuration from file
    pub fn load(path: &Path) -> Result<Self> {
        tracing::info!(path = %path.display(), "Loading configuration");

        let content = std::fs::read_to_string(path).map_err(|e| {
            tracing::error!(path = %path.display(), error = %e, "Failed to read config file");
            e
        })?;

        let config: Config = toml::from_str(&content)?;
        config.validate()?;

        tracing::info!("Configuration loaded successfully");
        Ok(config)
    }

    /// Load `path` if it exists, defaults otherwise
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::info!(path = %path.display(), "No config file, using defaults");
            Ok(Self::default())
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(OrchestratorError::Config("port must be non-zero".into()));
        }

        if self.engine.kind != "simulated" {
            return Err(OrchestratorError::Config(format!(
                "unknown engine kind '{}' (supported: simulated)",
                self.engine.kind
            )));
        }
        if self.engine.load_timeout_secs == 0 {
            return Err(OrchestratorError::Config(
                "load_timeout_secs must be at least 1".into(),
            ));
        }
        if self.engine.retry_initial_secs == 0
            || self.engine.retry_max_secs < self.engine.retry_initial_secs
        {
            return Err(OrchestratorError::Config(
                "retry_initial_secs must be >= 1 and <= retry_max_secs".into(),
            ));
        }
        if self.engine.simulated.steps == 0 {
            return Err(OrchestratorError::Config(
                "simulated.steps must be at least 1".into(),
            ));
        }

        if !(0.0..1.0).contains(&self.jobs.min_resume_progress) {
            return Err(OrchestratorError::Config(
                "min_resume_progress must be in [0.0, 1.0)".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.jobs.checkpoint_progress_delta) {
            return Err(OrchestratorError::Config(
                "checkpoint_progress_delta must be in [0.0, 1.0]".into(),
            ));
        }
        if self.jobs.watchdog_secs == 0 {
            return Err(OrchestratorError::Config(
                "watchdog_secs must be at least 1".into(),
            ));
        }
        if self.jobs.checkpoint_max_age_secs == 0 {
            return Err(OrchestratorError::Config(
                "checkpoint_max_age_secs must be at least 1".into(),
            ));
        }

        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => {
                return Err(OrchestratorError::Config(
                    "log level must be one of: trace, debug, info, warn, error".into(),
                ))
            }
        }

        Ok(())
    }

    /// Save configuration to file (atomic write)
    pub fn save(&self, path: &Path) -> Result<()> {
        tracing::info!(path = %path.display(), "Saving configuration");

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let toml_string = toml::to_string_pretty(self)?;

        let temp_path = path.with_extension("toml.tmp");
        std::fs::write(&temp_path, &toml_string)?;
        std::fs::rename(&temp_path, path).map_err(|e| {
            tracing::error!(
                from = %temp_path.display(),
                to = %path.display(),
                error = %e,
                "Failed to rename temp config file"
            );
            e
        })?;

        tracing::info!(path = %path.display(), "Configuration saved successfully");
        Ok(())
    }

    pub fn database_path(&self) -> PathBuf {
        self.storage
            .database_path
            .clone()
            .unwrap_or_else(|| self.storage.data_dir.join("orchestrator.db"))
    }

    pub fn checkpoint_dir(&self) -> PathBuf {
        self.storage
            .checkpoint_dir
            .clone()
            .unwrap_or_else(|| self.storage.data_dir.join("checkpoints"))
    }

    /// Runtime settings for [`Orchestrator`](crate::orchestrator::Orchestrator)
    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            checkpoint: CheckpointConfig {
                checkpoint_dir: self.checkpoint_dir(),
                max_age: Duration::from_secs(self.jobs.checkpoint_max_age_secs),
                min_resume_progress: self.jobs.min_resume_progress,
                save_interval: Duration::from_secs(self.jobs.checkpoint_interval_secs),
                save_progress_delta: self.jobs.checkpoint_progress_delta,
            },
            manager: ModelManagerConfig {
                load_timeout: Duration::from_secs(self.engine.load_timeout_secs),
                retry_initial: Duration::from_secs(self.engine.retry_initial_secs),
                retry_max: Duration::from_secs(self.engine.retry_max_secs),
            },
            runner: RunnerConfig {
                watchdog: Duration::from_secs(self.jobs.watchdog_secs),
                engine_stop_grace: Duration::from_secs(self.jobs.engine_stop_grace_secs),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.jobs.watchdog_secs, 1800);
        assert!(config.database_path().ends_with("orchestrator.db"));
        assert!(config.checkpoint_dir().ends_with("checkpoints"));
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("orchestrator.toml");

        let mut config = Config::default();
        config.server.port = 9191;
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.server.port, 9191);
        assert_eq!(loaded.engine.kind, "simulated");
    }

    #[test]
    fn test_load_or_default_without_file() {
        let temp_dir = TempDir::new().unwrap();
        let config = Config::load_or_default(&temp_dir.path().join("missing.toml")).unwrap();
        assert_eq!(config.server.port, 8080);
    }

    #[test]
    fn test_invalid_min_resume_progress() {
        let mut config = Config::default();
        config.jobs.min_resume_progress = 1.5;
        assert!(matches!(config.validate(), Err(OrchestratorError::Config(_))));
    }

    #[test]
    fn test_unknown_engine_kind() {
        let mut config = Config::default();
        config.engine.kind = "whisper-gpu".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = Config::default();
        config.logging.level = "verbose".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_storage_overrides() {
        let mut config = Config::default();
        config.storage.checkpoint_dir = Some(PathBuf::from("/var/lib/transcribe/ckpt"));
        assert_eq!(config.checkpoint_dir(), PathBuf::from("/var/lib/transcribe/ckpt"));

        let runtime = config.orchestrator_config();
        assert_eq!(runtime.checkpoint.checkpoint_dir, PathBuf::from("/var/lib/transcribe/ckpt"));
        assert_eq!(runtime.runner.watchdog, Duration::from_secs(1800));
    }
}
