//! Configuration Loader
//!
//! Environment-aware loading built on the `config` crate. Sources, lowest precedence first:
//!
//! 1. `api-toolkit.yaml` (or `.yml`) in the config directory
//! 2. `api-toolkit.<environment>.yaml` in the same directory, if present
//! 3. Environment variables `API_TOOLKIT__<SECTION>__<KEY>`
//!
//! A missing base file is not an error: defaults plus environment overrides still apply.

use super::error::{ConfigResult, ConfigurationError};
use super::ToolkitConfig;
use config::{Config, Environment, File, FileFormat};
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

const CONFIG_FILE_NAMES: [&str; 2] = ["api-toolkit.yaml", "api-toolkit.yml"];
const ENV_PREFIX: &str = "API_TOOLKIT";

/// Loaded, validated configuration
#[derive(Debug)]
pub struct ConfigManager {
    config: ToolkitConfig,
    environment: String,
    source_file: Option<PathBuf>,
}

impl ConfigManager {
    /// Load configuration with environment auto-detection
    pub fn load() -> ConfigResult<Arc<ConfigManager>> {
        Self::load_from_directory(None)
    }

    /// Load configuration from a specific directory
    pub fn load_from_directory(config_dir: Option<PathBuf>) -> ConfigResult<Arc<ConfigManager>> {
        let environment = Self::detect_environment();
        Self::load_from_directory_with_env(config_dir, &environment)
    }

    /// Load configuration from a specific directory with an explicit environment
    pub fn load_from_directory_with_env(
        config_dir: Option<PathBuf>,
        environment: &str,
    ) -> ConfigResult<Arc<ConfigManager>> {
        Self::load_with_env_prefix(config_dir, environment, ENV_PREFIX)
    }

    /// Load one explicit file; unlike directory loading the file must exist
    pub fn load_from_file(path: &Path) -> ConfigResult<Arc<ConfigManager>> {
        if !path.is_file() {
            return Err(ConfigurationError::config_file_not_found(vec![
                path.to_path_buf()
            ]));
        }
        let environment = Self::detect_environment();
        let config = Self::build(Some(path), None, ENV_PREFIX)?;
        Self::finish(config, environment, Some(path.to_path_buf()))
    }

    /// Wrap an already-built configuration, validating it
    pub fn from_config(config: ToolkitConfig) -> ConfigResult<Arc<ConfigManager>> {
        Self::finish(config, Self::detect_environment(), None)
    }

    pub(crate) fn load_with_env_prefix(
        config_dir: Option<PathBuf>,
        environment: &str,
        env_prefix: &str,
    ) -> ConfigResult<Arc<ConfigManager>> {
        let config_directory = config_dir.unwrap_or_else(Self::default_config_directory);

        debug!(
            environment = environment,
            directory = %config_directory.display(),
            "Loading api toolkit configuration"
        );

        let base_file = Self::find_config_file(&config_directory).ok();
        let env_file = config_directory.join(format!("api-toolkit.{environment}.yaml"));
        let env_file = env_file.is_file().then_some(env_file);

        let config = Self::build(base_file.as_deref(), env_file.as_deref(), env_prefix)?;
        Self::finish(config, environment.to_string(), base_file)
    }

    fn build(
        base_file: Option<&Path>,
        env_file: Option<&Path>,
        env_prefix: &str,
    ) -> ConfigResult<ToolkitConfig> {
        let mut builder = Config::builder();

        if let Some(path) = base_file {
            builder = builder.add_source(File::from(path).format(FileFormat::Yaml).required(true));
        }
        if let Some(path) = env_file {
            debug!(file = %path.display(), "Applying environment-specific overrides");
            builder = builder.add_source(File::from(path).format(FileFormat::Yaml).required(true));
        }
        builder = builder.add_source(
            Environment::with_prefix(env_prefix)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let source_name = base_file
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "defaults".to_string());

        builder
            .build()
            .and_then(|settings| settings.try_deserialize::<ToolkitConfig>())
            .map_err(|e| ConfigurationError::parse_error(source_name, e))
    }

    fn finish(
        config: ToolkitConfig,
        environment: String,
        source_file: Option<PathBuf>,
    ) -> ConfigResult<Arc<ConfigManager>> {
        config.validate()?;

        info!(
            environment = %environment,
            backend = ?config.store.backend,
            sites = config.sites.len(),
            source = ?source_file,
            "Configuration loaded successfully"
        );

        Ok(Arc::new(ConfigManager {
            config,
            environment,
            source_file,
        }))
    }

    /// Get the loaded configuration
    pub fn config(&self) -> &ToolkitConfig {
        &self.config
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    /// The base file the configuration was read from, if any
    pub fn source_file(&self) -> Option<&Path> {
        self.source_file.as_deref()
    }

    /// Detect current environment from environment variables
    pub(crate) fn detect_environment() -> String {
        env::var("API_TOOLKIT_ENV")
            .or_else(|_| env::var("APP_ENV"))
            .unwrap_or_else(|_| "development".to_string())
            .to_lowercase()
    }

    fn default_config_directory() -> PathBuf {
        if let Ok(dir) = env::var("API_TOOLKIT_CONFIG_DIR") {
            return PathBuf::from(dir);
        }

        for dir in [PathBuf::from("config"), PathBuf::from(".")] {
            if Self::find_config_file(&dir).is_ok() {
                debug!(directory = %dir.display(), "Found config directory");
                return dir;
            }
        }

        PathBuf::from("config")
    }

    fn find_config_file(config_directory: &Path) -> ConfigResult<PathBuf> {
        let mut searched_paths = Vec::new();

        for name in CONFIG_FILE_NAMES {
            let config_path = config_directory.join(name);
            searched_paths.push(config_path.clone());

            if config_path.is_file() {
                debug!(file = %config_path.display(), "Found configuration file");
                return Ok(config_path);
            }
        }

        Err(ConfigurationError::config_file_not_found(searched_paths))
    }
}
