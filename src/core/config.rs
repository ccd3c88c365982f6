//! Configuration management for Maaflow.
//!
//! Handles loading and saving configuration from TOML files.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::invoker::ProcessInvoker;

/// Application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// External engine settings
    pub engine: EngineConfig,

    /// Workflow behaviour
    pub workflow: WorkflowConfig,

    /// Logging settings
    pub logging: LoggingConfig,
}

/// How to reach the external engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Engine executable
    pub cli_path: String,

    /// Arguments placed before every engine command
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    /// Working directory for engine processes (defaults to the current directory)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,

    /// Timeout for short engine calls, in seconds
    pub timeout_secs: u64,

    /// Extra environment variables for engine processes
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
}

/// Workflow behaviour settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    /// Ask whether to execute a workflow right after creating it
    pub confirm_execute: bool,

    /// Show a desktop notification when an execution ends
    pub notify_on_finish: bool,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default log level when neither `--verbose` nor `RUST_LOG` is set
    pub level: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cli_path: "maahelper".to_string(),
            args: Vec::new(),
            working_dir: None,
            timeout_secs: 30,
            env: HashMap::new(),
        }
    }
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self { confirm_execute: true, notify_on_finish: true }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "warn".to_string() }
    }
}

impl EngineConfig {
    /// Engine executable with `~` and environment variables expanded.
    pub fn program(&self) -> String {
        expand(&self.cli_path)
    }

    /// Working directory with `~` and environment variables expanded.
    pub fn resolved_working_dir(&self) -> Option<PathBuf> {
        self.working_dir.as_deref().map(|dir| PathBuf::from(expand(dir)))
    }

    /// Timeout for short engine calls.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }

    /// Build the process invoker described by this configuration.
    pub fn invoker(&self) -> ProcessInvoker {
        let invoker = ProcessInvoker::new()
            .timeout(self.timeout())
            .envs(self.env.iter().map(|(k, v)| (k.clone(), expand(v))));

        match self.resolved_working_dir() {
            Some(dir) => invoker.working_dir(dir),
            None => invoker,
        }
    }
}

fn expand(value: &str) -> String {
    shellexpand::full(value).map(|v| v.into_owned()).unwrap_or_else(|_| value.to_string())
}

impl Config {
    /// Load configuration from the default location.
    ///
    /// Looks for config in:
    /// 1. `.maaflow.toml` in current directory
    /// 2. `~/.config/maaflow/config.toml`
    /// 3. Falls back to defaults
    pub fn load() -> anyhow::Result<Self> {
        // Try local config first
        let local_config = PathBuf::from(".maaflow.toml");
        if local_config.exists() {
            return Self::load_from_file(&local_config);
        }

        // Try global config
        if let Some(global_config) = Self::global_path() {
            if global_config.exists() {
                return Self::load_from_file(&global_config);
            }
        }

        // Return defaults
        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        tracing::debug!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Save configuration to the global config file.
    pub fn save(&self) -> anyhow::Result<PathBuf> {
        let config_path = Self::global_path()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        self.save_to(&config_path)?;
        Ok(config_path)
    }

    /// Save configuration to `path`, creating parent directories.
    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        tracing::debug!(path = %path.display(), "saved configuration");
        Ok(())
    }

    /// Get the config directory path.
    pub fn config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("maaflow"))
    }

    /// Path of the global config file.
    pub fn global_path() -> Option<PathBuf> {
        Self::config_dir().map(|d| d.join("config.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.engine.cli_path, "maahelper");
        assert_eq!(config.engine.timeout(), Duration::from_secs(30));
        assert!(config.workflow.confirm_execute);
        assert_eq!(config.logging.level, "warn");
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let toml_str = toml::to_string(&config).unwrap();
        assert!(toml_str.contains("[engine]"));
        assert!(toml_str.contains("[workflow]"));
        assert!(toml_str.contains("cli_path = \"maahelper\""));
    }

    #[test]
    fn test_config_deserialization() {
        let toml_str = r#"
            [engine]
            cli_path = "/opt/maahelper/bin/maahelper"
            args = ["--profile", "ci"]
            timeout_secs = 10

            [engine.env]
            MAAHELPER_MODEL = "local"

            [workflow]
            confirm_execute = false
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.engine.cli_path, "/opt/maahelper/bin/maahelper");
        assert_eq!(config.engine.args, vec!["--profile", "ci"]);
        assert_eq!(config.engine.timeout(), Duration::from_secs(10));
        assert_eq!(config.engine.env.get("MAAHELPER_MODEL").map(String::as_str), Some("local"));
        assert!(!config.workflow.confirm_execute);
        assert!(config.workflow.notify_on_finish);
        assert_eq!(config.logging.level, "warn");
    }

    #[test]
    fn test_zero_timeout_is_clamped() {
        let engine = EngineConfig { timeout_secs: 0, ..EngineConfig::default() };
        assert_eq!(engine.timeout(), Duration::from_secs(1));
    }

    #[test]
    fn test_invoker_from_config() {
        let engine = EngineConfig {
            working_dir: Some("/tmp".to_string()),
            timeout_secs: 5,
            ..EngineConfig::default()
        };

        let invoker = engine.invoker();
        assert_eq!(invoker.dir(), Some(Path::new("/tmp")));
        assert_eq!(invoker.timeout_duration(), Duration::from_secs(5));
    }

    #[test]
    #[serial_test::serial]
    fn test_paths_are_expanded() {
        std::env::set_var("MAAFLOW_TEST_ROOT", "/srv/engine");
        let engine = EngineConfig {
            cli_path: "$MAAFLOW_TEST_ROOT/bin/maahelper".to_string(),
            working_dir: Some("${MAAFLOW_TEST_ROOT}/work".to_string()),
            ..EngineConfig::default()
        };

        assert_eq!(engine.program(), "/srv/engine/bin/maahelper");
        assert_eq!(engine.resolved_working_dir(), Some(PathBuf::from("/srv/engine/work")));
        std::env::remove_var("MAAFLOW_TEST_ROOT");
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("maaflow").join("config.toml");

        let mut config = Config::default();
        config.engine.cli_path = "/opt/maahelper/bin/maahelper".to_string();
        config.engine.env.insert("MAAHELPER_MODEL".to_string(), "local".to_string());
        config.workflow.notify_on_finish = false;
        config.save_to(&path).unwrap();

        let loaded = Config::load_from_file(&path).unwrap();
        assert_eq!(loaded.engine.cli_path, "/opt/maahelper/bin/maahelper");
        assert_eq!(loaded.engine.env.get("MAAHELPER_MODEL").map(String::as_str), Some("local"));
        assert!(!loaded.workflow.notify_on_finish);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[logging]\nlevel = \"debug\"\n").unwrap();

        let config = Config::load_from_file(&path).unwrap();
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.engine.cli_path, "maahelper");
    }
}
