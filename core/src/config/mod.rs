// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Layered, validated configuration for the dispatcher.
//!
//! Loaded in priority order (highest wins): explicit path > `YGGDRASIL_CONFIG`
//! env var > environment-specific file (`config.{dev,staging,prod}.yaml`) >
//! default file > built-in defaults.

pub mod models;

use std::path::{Path, PathBuf};

use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde_valid::Validate;
use thiserror::Error;

pub use models::{BreakerOptions, CloudOptions, Config, HostConfig, ObservabilityConfig, RetryOptions};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "config.yaml";

/// Default configuration directory name.
const CONFIG_DIR_NAME: &str = "yggdrasil";

/// Environment variable prefix for configuration overrides
/// (e.g. `YGGDRASIL__RETRY__MAX_ATTEMPTS`).
pub const ENV_PREFIX: &str = "YGGDRASIL";

/// Separator for nested configuration keys in environment variables.
const ENV_SEPARATOR: &str = "__";

/// Path to an explicit config file.
pub const CONFIG_PATH_VAR: &str = "YGGDRASIL_CONFIG";

/// Selects the environment-specific config file (`dev`/`staging`/`prod`).
pub const CONFIG_ENV_VAR: &str = "YGGDRASIL_ENV";

/// Configuration load/validation failures. Maps to exit code 2 at the CLI
/// boundary.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The `config` crate failed to merge or parse a source.
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),

    /// Field-level validation (ranges, required strings) failed.
    #[error("configuration validation failed: {0}")]
    Invalid(String),

    /// No hosts are configured; the dispatcher has nothing to route to.
    #[error("no hosts configured: at least one entry is required under `hosts`")]
    NoHosts,

    /// Cloud fallback is enabled but its credential environment variable is
    /// unset.
    #[error("cloud fallback is enabled but ${0} is not set")]
    MissingCloudCredential(String),

    /// A host listed under `concurrency` is out of the permitted 1-16 range.
    #[error("concurrency.{host} = {value} is out of range (must be 1-16)")]
    ConcurrencyOutOfRange {
        /// The offending host name.
        host: String,
        /// The configured value.
        value: u32,
    },
}

/// Configuration loader with a builder-style API.
#[derive(Debug, Default)]
pub struct ConfigLoader {
    /// An explicit file path (e.g. from a CLI `--config` flag). Highest
    /// file-source precedence.
    explicit_path: Option<PathBuf>,
    /// Whether to skip loading any file at all (file-free tests).
    skip_files: bool,
    /// Whether to skip the generic `YGGDRASIL__...` environment overrides.
    skip_env: bool,
}

impl ConfigLoader {
    /// A loader with default settings: every source enabled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set an explicit configuration file path, overriding every other file
    /// source.
    pub fn with_file(mut self, path: impl AsRef<Path>) -> Self {
        self.explicit_path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Skip every file source (defaults and environment overrides only).
    pub fn skip_files(mut self) -> Self {
        self.skip_files = true;
        self
    }

    /// Skip the generic environment-variable override layer.
    pub fn skip_env(mut self) -> Self {
        self.skip_env = true;
        self
    }

    /// Load and validate the configuration from every enabled source.
    pub fn load(&self) -> Result<Config, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        let defaults = serde_json::to_value(Config::default()).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        builder = builder.add_source(config::Config::try_from(&defaults)?);

        if !self.skip_files {
            if let Some(path) = self.resolve_file() {
                tracing::debug!(path = %path.display(), "loading dispatcher config file");
                builder = builder.add_source(File::from(path).required(true).format(FileFormat::Yaml));
            } else {
                tracing::debug!("no dispatcher config file found; using defaults");
            }
        }

        if !self.skip_env {
            builder = builder.add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator(ENV_SEPARATOR)
                    .try_parsing(true)
                    .with_list_parse_key("cloud.qualifying_task_types")
                    .list_separator(","),
            );
        }

        let merged = builder.build()?;
        let parsed: Config = merged.try_deserialize()?;
        check_startup(&parsed)?;
        tracing::info!(hosts = parsed.hosts.len(), "dispatcher configuration loaded");
        Ok(parsed)
    }

    /// Resolve the single file source to load: explicit path, then
    /// `YGGDRASIL_CONFIG`, then the environment-specific file named by
    /// `YGGDRASIL_ENV`, then the default file location.
    fn resolve_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.explicit_path {
            return Some(path.clone());
        }
        if let Ok(path) = std::env::var(CONFIG_PATH_VAR) {
            return Some(PathBuf::from(path));
        }
        if let Ok(env_name) = std::env::var(CONFIG_ENV_VAR) {
            let candidate = Self::default_config_dir()
                .map(|dir| dir.join(format!("config.{env_name}.yaml")))
                .filter(|p| p.exists());
            if candidate.is_some() {
                return candidate;
            }
            let local = PathBuf::from(format!("config.{env_name}.yaml"));
            if local.exists() {
                return Some(local);
            }
        }
        Self::find_default_file()
    }

    /// Search the platform config directory, then the current directory,
    /// for the default file name.
    fn find_default_file() -> Option<PathBuf> {
        if let Some(config_dir) = Self::default_config_dir() {
            let path = config_dir.join(CONFIG_FILE_NAME);
            if path.exists() {
                return Some(path);
            }
        }
        let local = PathBuf::from(CONFIG_FILE_NAME);
        local.exists().then_some(local)
    }

    /// The platform-specific configuration directory (`~/.config/yggdrasil`
    /// on Linux, etc.).
    pub fn default_config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(CONFIG_DIR_NAME))
    }

    /// The default configuration file path.
    pub fn default_config_path() -> Option<PathBuf> {
        Self::default_config_dir().map(|dir| dir.join(CONFIG_FILE_NAME))
    }
}

/// Cross-field validation that field-level `serde_valid` attributes can't
/// express: zero configured hosts, cloud fallback without a credential, and
/// per-host concurrency bounds.
pub fn check_startup(config: &Config) -> Result<(), ConfigError> {
    config.validate().map_err(|e| ConfigError::Invalid(e.to_string()))?;

    if config.hosts.is_empty() {
        return Err(ConfigError::NoHosts);
    }

    for (host, limit) in &config.concurrency {
        if *limit == 0 || *limit > 16 {
            return Err(ConfigError::ConcurrencyOutOfRange { host: host.clone(), value: *limit });
        }
    }

    if config.cloud.enabled {
        let set = !config.cloud.credential_env.is_empty() && std::env::var(&config.cloud.credential_env).is_ok();
        if !set {
            return Err(ConfigError::MissingCloudCredential(config.cloud.credential_env.clone()));
        }
    }

    Ok(())
}

/// Write a default configuration file at the standard platform location.
/// Refuses to overwrite an existing file.
pub fn init_config_file() -> Result<PathBuf, ConfigError> {
    let dir = ConfigLoader::default_config_dir().ok_or_else(|| ConfigError::Invalid("could not determine config directory".to_string()))?;
    std::fs::create_dir_all(&dir).map_err(|e| ConfigError::Invalid(e.to_string()))?;

    let path = dir.join(CONFIG_FILE_NAME);
    if path.exists() {
        return Err(ConfigError::Invalid(format!("config file already exists at {}", path.display())));
    }

    let mut example = Config::default();
    example.hosts.push(HostConfig {
        name: "fenrir-chat".to_string(),
        url: "http://fenrir.local:5000".to_string(),
        model: Some("llama3".to_string()),
        capabilities: vec!["general".to_string()],
        priority: 1,
        timeout_seconds: 30,
    });

    let yaml = serde_yaml::to_string(&example).map_err(|e| ConfigError::Invalid(e.to_string()))?;
    std::fs::write(&path, yaml).map_err(|e| ConfigError::Invalid(e.to_string()))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn sample_host() -> HostConfig {
        HostConfig {
            name: "fenrir-chat".to_string(),
            url: "http://fenrir.local:5000".to_string(),
            model: None,
            capabilities: vec!["general".to_string()],
            priority: 1,
            timeout_seconds: 30,
        }
    }

    #[test]
    fn defaults_with_no_hosts_fail_startup_check() {
        let config = Config::default();
        let err = check_startup(&config).unwrap_err();
        assert!(matches!(err, ConfigError::NoHosts));
    }

    #[test]
    fn config_with_one_host_passes_startup_check() {
        let mut config = Config::default();
        config.hosts.push(sample_host());
        assert!(check_startup(&config).is_ok());
    }

    #[test]
    fn cloud_enabled_without_credential_fails() {
        let mut config = Config::default();
        config.hosts.push(sample_host());
        config.cloud.enabled = true;
        config.cloud.credential_env = "YGG_TEST_NONEXISTENT_VAR_XYZ".to_string();
        std::env::remove_var("YGG_TEST_NONEXISTENT_VAR_XYZ");
        let err = check_startup(&config).unwrap_err();
        assert!(matches!(err, ConfigError::MissingCloudCredential(_)));
    }

    #[test]
    fn out_of_range_concurrency_fails_startup_check() {
        let mut config = Config::default();
        config.hosts.push(sample_host());
        config.concurrency.insert("fenrir-chat".to_string(), 0);
        let err = check_startup(&config).unwrap_err();
        assert!(matches!(err, ConfigError::ConcurrencyOutOfRange { .. }));
    }

    #[test]
    fn loads_yaml_file_and_merges_over_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            r#"
poll_interval_seconds: 5
hosts:
  - name: fenrir-chat
    url: "http://fenrir.local:5000"
    capabilities: ["general"]
    priority: 1
    timeout_seconds: 30
"#,
        )
        .unwrap();

        let config = ConfigLoader::new().with_file(&path).skip_env().load().unwrap();
        assert_eq!(config.poll_interval_seconds, 5);
        assert_eq!(config.hosts.len(), 1);
        assert_eq!(config.hosts[0].name, "fenrir-chat");
    }

    #[test]
    fn env_override_takes_precedence_over_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            r#"
poll_interval_seconds: 5
hosts:
  - name: fenrir-chat
    url: "http://fenrir.local:5000"
    capabilities: ["general"]
    priority: 1
    timeout_seconds: 30
"#,
        )
        .unwrap();

        std::env::set_var("YGGDRASIL__POLL_INTERVAL_SECONDS", "9");
        let config = ConfigLoader::new().with_file(&path).load().unwrap();
        std::env::remove_var("YGGDRASIL__POLL_INTERVAL_SECONDS");

        assert_eq!(config.poll_interval_seconds, 9);
    }

    #[test]
    fn default_config_dir_contains_crate_name() {
        if let Some(dir) = ConfigLoader::default_config_dir() {
            assert!(dir.to_string_lossy().contains("yggdrasil"));
        }
    }

    #[test]
    fn concurrency_map_round_trips_through_yaml() {
        let mut config = Config::default();
        config.hosts.push(sample_host());
        let mut concurrency = HashMap::new();
        concurrency.insert("fenrir-chat".to_string(), 4u32);
        config.concurrency = concurrency;

        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.concurrency.get("fenrir-chat"), Some(&4));
    }
}
