//! Configuration management for classmesh
//!
//! This crate handles loading, saving and accessing
//! client configuration.

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use session_core::Error;
use std::fs;
use std::path::{Path, PathBuf};

/// Prefix of environment variables overriding file settings
pub const ENV_PREFIX: &str = "CLASSMESH";

/// Client settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Name shown to other participants
    pub display_name: String,

    /// List of STUN/TURN servers for peer connectivity
    pub ice_servers: Vec<String>,

    /// Per-member buffer of the in-process relay
    pub relay_capacity: usize,

    /// How long a link may stay negotiating before it is retried
    pub negotiation_timeout_secs: u64,

    /// Consecutive negotiation timeouts before a link is abandoned
    pub max_negotiation_retries: u32,

    /// Interval of the teacher's authoritative timer broadcasts
    pub timer_resync_secs: u64,

    /// Delay between relay resubscription attempts while offline
    pub resubscribe_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            display_name: "Anonymous".to_string(),
            ice_servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:3478".to_string(),
                "stun:stun2.l.google.com:19302".to_string(),
            ],
            relay_capacity: 256,
            negotiation_timeout_secs: 15,
            max_negotiation_retries: 3,
            timer_resync_secs: 5,
            resubscribe_secs: 3,
        }
    }
}

impl Settings {
    /// Reject values the session core cannot run with
    pub fn validate(&self) -> Result<(), Error> {
        let zero = [
            ("relay_capacity", self.relay_capacity == 0),
            ("negotiation_timeout_secs", self.negotiation_timeout_secs == 0),
            ("timer_resync_secs", self.timer_resync_secs == 0),
            ("resubscribe_secs", self.resubscribe_secs == 0),
        ];
        if let Some((name, _)) = zero.iter().find(|(_, is_zero)| *is_zero) {
            return Err(Error::Config(format!("{} must be greater than zero", name)));
        }
        if self.display_name.trim().is_empty() {
            return Err(Error::Config("display_name must not be empty".to_string()));
        }
        Ok(())
    }
}

/// Configuration manager
pub struct ConfigManager {
    settings: Settings,
    config_file: PathBuf,
}

impl ConfigManager {
    /// Load the user's config file with environment overrides applied
    pub fn new() -> Result<Self, Error> {
        let mut config_dir = dirs::config_dir()
            .ok_or_else(|| Error::Config("Failed to determine config directory".to_string()))?;
        config_dir.push("classmesh");

        if !config_dir.exists() {
            fs::create_dir_all(&config_dir)
                .map_err(|e| Error::Config(format!("Failed to create config directory: {}", e)))?;
        }

        Self::with_env_overrides(config_dir.join("config.toml"))
    }

    /// Create a ConfigManager with a custom file path (mainly for testing)
    pub fn with_file<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let config_file = path.as_ref().to_path_buf();
        let settings = if config_file.exists() {
            Self::load_from_file(&config_file)?
        } else {
            debug!("Config file not found, using defaults");
            Settings::default()
        };
        settings.validate()?;

        Ok(Self {
            settings,
            config_file,
        })
    }

    /// Like [`ConfigManager::with_file`], with `CLASSMESH_*` variables on top
    pub fn with_env_overrides<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let config_file = path.as_ref().to_path_buf();
        let layered = config::Config::builder()
            .add_source(
                config::File::from(config_file.as_path())
                    .format(config::FileFormat::Toml)
                    .required(false),
            )
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("ice_servers"),
            )
            .build()
            .map_err(|e| Error::Config(format!("Failed to read configuration: {}", e)))?;

        let settings: Settings = layered
            .try_deserialize()
            .map_err(|e| Error::Config(format!("Failed to parse configuration: {}", e)))?;
        settings.validate()?;

        Ok(Self {
            settings,
            config_file,
        })
    }

    /// Load settings from a TOML file
    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Settings, Error> {
        let contents = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;

        toml::from_str(&contents)
            .map_err(|e| Error::Config(format!("Failed to parse config file: {}", e)))
    }

    /// Save settings to the config file
    pub fn save(&self) -> Result<(), Error> {
        self.settings.validate()?;
        let toml = toml::to_string_pretty(&self.settings)
            .map_err(|e| Error::Config(format!("Failed to serialize settings: {}", e)))?;

        if let Some(parent) = self.config_file.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent).map_err(|e| {
                    Error::Config(format!("Failed to create config directory: {}", e))
                })?;
            }
        }

        fs::write(&self.config_file, toml)
            .map_err(|e| Error::Config(format!("Failed to write config file: {}", e)))?;

        debug!("Saved config to {:?}", self.config_file);
        Ok(())
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn settings_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    /// Replace the settings, keeping the old ones if the new ones are invalid
    pub fn update_settings(&mut self, new_settings: Settings) -> Result<(), Error> {
        if let Err(e) = new_settings.validate() {
            warn!("Rejected settings update: {}", e);
            return Err(e);
        }
        self.settings = new_settings;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.display_name, "Anonymous");
        assert_eq!(settings.negotiation_timeout_secs, 15);
        assert_eq!(settings.max_negotiation_retries, 3);
        assert!(!settings.ice_servers.is_empty());
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn save_and_load() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("test_config.toml");

        let mut config = ConfigManager::with_file(&config_path).unwrap();
        config.settings_mut().display_name = "Ms. Rivera".to_string();
        config.settings_mut().timer_resync_secs = 10;

        config.save().unwrap();
        assert!(config_path.exists());

        let loaded_config = ConfigManager::with_file(&config_path).unwrap();
        assert_eq!(loaded_config.settings().display_name, "Ms. Rivera");
        assert_eq!(loaded_config.settings().timer_resync_secs, 10);
    }

    #[test]
    fn file_not_found_uses_defaults() {
        let temp_dir = tempdir().unwrap();
        let nonexistent_path = temp_dir.path().join("nonexistent.toml");

        let config = ConfigManager::with_file(&nonexistent_path).unwrap();
        assert_eq!(config.settings(), &Settings::default());
    }

    #[test]
    fn partial_file_keeps_remaining_defaults() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("partial.toml");
        fs::write(&config_path, "display_name = \"Sam\"\nresubscribe_secs = 7\n").unwrap();

        let config = ConfigManager::with_file(&config_path).unwrap();
        assert_eq!(config.settings().display_name, "Sam");
        assert_eq!(config.settings().resubscribe_secs, 7);
        assert_eq!(config.settings().relay_capacity, 256);
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("bad.toml");
        fs::write(&config_path, "negotiation_timeout_secs = 0\n").unwrap();

        let result = ConfigManager::with_file(&config_path);
        assert!(matches!(result, Err(Error::Config(msg)) if msg.contains("negotiation_timeout_secs")));
    }

    #[test]
    fn invalid_update_keeps_previous_settings() {
        let temp_dir = tempdir().unwrap();
        let mut config = ConfigManager::with_file(temp_dir.path().join("c.toml")).unwrap();

        let mut next = config.settings().clone();
        next.display_name = "  ".to_string();
        assert!(config.update_settings(next).is_err());
        assert_eq!(config.settings().display_name, "Anonymous");
    }

    #[test_log::test]
    fn environment_overrides_file() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("layered.toml");
        fs::write(&config_path, "display_name = \"File\"\nmax_negotiation_retries = 2\n").unwrap();

        std::env::set_var("CLASSMESH_MAX_NEGOTIATION_RETRIES", "5");
        let config = ConfigManager::with_env_overrides(&config_path);
        std::env::remove_var("CLASSMESH_MAX_NEGOTIATION_RETRIES");

        let config = config.unwrap();
        assert_eq!(config.settings().display_name, "File");
        assert_eq!(config.settings().max_negotiation_retries, 5);
    }
}
