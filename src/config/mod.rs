use crate::models::AppConfig;
use ::config::{Environment, File, FileFormat};
use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use std::collections::HashMap;
use std::fs;

/// Name of the configuration file inside the config directory
pub const CONFIG_FILE_NAME: &str = "fastreader.yaml";

/// Environment variable prefix for overrides (`FASTREADER_BATCH__CONCURRENCY=4`)
pub const ENV_PREFIX: &str = "FASTREADER";

/// Default configuration directory, relative to the working directory
pub const DEFAULT_CONFIG_DIR: &str = "fastReader Data";

/// Configuration manager for loading and saving the YAML configuration file.
///
/// `fastreader.yaml` holds the batch options together with the AI provider,
/// storage and logging settings. [`ConfigManager::load_layered`] additionally
/// applies `FASTREADER_*` environment overrides on top of the file.
#[derive(Debug, Clone)]
pub struct ConfigManager {
    config_dir: Utf8PathBuf,
    config_path: Utf8PathBuf,
}

impl ConfigManager {
    /// Create a new ConfigManager with the specified configuration directory.
    ///
    /// # Arguments
    /// * `config_dir` - Directory containing `fastreader.yaml` (e.g., "fastReader Data")
    pub fn new<P: AsRef<Utf8Path>>(config_dir: P) -> Result<Self> {
        let config_dir = config_dir.as_ref().to_path_buf();

        if !config_dir.exists() {
            fs::create_dir_all(&config_dir)
                .with_context(|| format!("Failed to create config directory: {}", config_dir))?;
        }

        Ok(Self {
            config_path: config_dir.join(CONFIG_FILE_NAME),
            config_dir,
        })
    }

    /// Load the configuration file.
    ///
    /// # Returns
    /// The loaded AppConfig, or defaults if the file doesn't exist
    pub fn load_config(&self) -> Result<AppConfig> {
        if !self.config_path.exists() {
            tracing::warn!("Config file not found at {}, using defaults", self.config_path);
            return Ok(AppConfig::default());
        }

        let file_contents = fs::read_to_string(&self.config_path)
            .with_context(|| format!("Failed to read config: {}", self.config_path))?;

        let config: AppConfig = serde_yaml_ng::from_str(&file_contents)
            .with_context(|| format!("Failed to parse config: {}", self.config_path))?;

        tracing::info!("Loaded config from {}", self.config_path);
        Ok(config)
    }

    /// Save the configuration file.
    ///
    /// # Arguments
    /// * `config` - The AppConfig to save
    pub fn save_config(&self, config: &AppConfig) -> Result<()> {
        let yaml_string =
            serde_yaml_ng::to_string(config).context("Failed to serialize config to YAML")?;

        fs::write(&self.config_path, yaml_string)
            .with_context(|| format!("Failed to write config: {}", self.config_path))?;

        tracing::info!("Saved config to {}", self.config_path);
        Ok(())
    }

    /// Load the file (if present) with process environment overrides on top
    pub fn load_layered(&self) -> Result<AppConfig> {
        self.build_layered(None)
    }

    /// Same as [`Self::load_layered`], reading overrides from `vars` instead
    /// of the process environment
    pub fn load_layered_with_env(&self, vars: HashMap<String, String>) -> Result<AppConfig> {
        self.build_layered(Some(vars))
    }

    fn build_layered(&self, vars: Option<HashMap<String, String>>) -> Result<AppConfig> {
        let settings = ::config::Config::builder()
            .add_source(
                File::from(self.config_path.as_std_path())
                    .format(FileFormat::Yaml)
                    .required(false),
            )
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .source(vars),
            )
            .build()
            .with_context(|| format!("Failed to load layered config from {}", self.config_path))?;

        let config: AppConfig = settings
            .try_deserialize()
            .context("Failed to deserialize layered config")?;

        tracing::debug!("Resolved layered config: {:?}", config.batch);
        Ok(config)
    }

    /// Get the configuration directory path.
    pub fn config_dir(&self) -> &Utf8Path {
        &self.config_dir
    }

    pub fn config_path(&self) -> &Utf8Path {
        &self.config_path
    }
}
