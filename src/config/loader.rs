//! Configuration loading with hierarchy merging.
//!
//! Configuration is loaded from multiple sources and merged in order:
//!
//! 1. Embedded defaults (compiled into binary)
//! 2. System config: `/etc/tim-gateway/config.toml`
//! 3. User config: `~/.config/tim-gateway/config.toml`
//! 4. Additional config file (via `--config` flag)
//! 5. CLI flags (highest priority)
//!
//! Layers are merged as TOML tables before deserializing, so a later file
//! only overrides the keys it actually sets.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::error::ConfigError;
use super::schema::Config;
use crate::cli::Cli;

/// System-wide configuration path.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/tim-gateway/config.toml";

/// User configuration directory name.
pub const USER_CONFIG_DIR: &str = "tim-gateway";

/// User configuration filename.
pub const USER_CONFIG_FILE: &str = "config.toml";

/// Configuration loader with support for hierarchy merging.
pub struct ConfigLoader {
    /// Path to system-wide configuration.
    system_path: PathBuf,
    /// Path to user configuration.
    user_path: PathBuf,
}

impl ConfigLoader {
    /// Create a new ConfigLoader with default paths.
    #[must_use]
    pub fn new() -> Self {
        let user_config_dir = dirs::config_dir()
            .map(|p| p.join(USER_CONFIG_DIR))
            .unwrap_or_else(|| PathBuf::from(".config").join(USER_CONFIG_DIR));

        Self {
            system_path: PathBuf::from(SYSTEM_CONFIG_PATH),
            user_path: user_config_dir.join(USER_CONFIG_FILE),
        }
    }

    /// Create a ConfigLoader with custom paths (for testing).
    #[must_use]
    pub fn with_paths(system_path: PathBuf, user_path: PathBuf) -> Self {
        Self {
            system_path,
            user_path,
        }
    }

    /// Load, merge and validate configuration from all sources.
    ///
    /// Missing system/user files are skipped. A missing `--config` file,
    /// invalid TOML or an invalid merged result is an error.
    pub fn load(&self, cli: &Cli) -> Result<Config, ConfigError> {
        let mut merged = toml::Value::try_from(Config::default())?;
        debug!("Loaded embedded default configuration");

        for path in [&self.system_path, &self.user_path] {
            if let Some(layer) = self.load_file(path)? {
                merge_values(&mut merged, layer);
                debug!("Merged config from {:?}", path);
            } else {
                debug!("No config found at {:?}", path);
            }
        }

        if let Some(ref cli_config_path) = cli.config {
            match self.load_file(cli_config_path)? {
                Some(layer) => {
                    merge_values(&mut merged, layer);
                    debug!("Merged additional config from {:?}", cli_config_path);
                }
                None => {
                    return Err(ConfigError::ReadError {
                        path: cli_config_path.clone(),
                        source: std::io::Error::new(
                            std::io::ErrorKind::NotFound,
                            "Specified config file not found",
                        ),
                    });
                }
            }
        }

        let mut config: Config = merged.try_into().map_err(|e| ConfigError::ParseError {
            path: PathBuf::from("<merged>"),
            source: e,
        })?;

        apply_cli_overrides(&mut config, cli);
        config.validate()?;
        Ok(config)
    }

    /// Read a config file as a raw TOML table, returning None if it doesn't exist.
    fn load_file(&self, path: &Path) -> Result<Option<toml::Value>, ConfigError> {
        match fs::read_to_string(path) {
            Ok(contents) => {
                let value: toml::Value =
                    toml::from_str(&contents).map_err(|e| ConfigError::ParseError {
                        path: path.to_path_buf(),
                        source: e,
                    })?;
                Ok(Some(value))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ConfigError::ReadError {
                path: path.to_path_buf(),
                source: e,
            }),
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn apply_cli_overrides(config: &mut Config, cli: &Cli) {
    if cli.no_enforce {
        config.inbound.enforce_domain_list = false;
        config.outbound.enforce_domain_list = false;
        debug!("Domain list enforcement disabled by CLI flag");
    }
    if let Some(addr) = cli.inbound_listen {
        config.inbound.listen = addr;
    }
    if let Some(addr) = cli.outbound_listen {
        config.outbound.listen = addr;
    }
}

/// Recursively merge `overlay` into `base`. Tables merge per key, anything
/// else is replaced.
fn merge_values(base: &mut toml::Value, overlay: toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base), toml::Value::Table(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use tempfile::tempdir;

    fn create_test_cli() -> Cli {
        Cli::parse_from(["tim-gateway"])
    }

    fn loader_in(dir: &Path) -> ConfigLoader {
        ConfigLoader::with_paths(dir.join("system.toml"), dir.join("user.toml"))
    }

    #[test]
    fn test_missing_files_use_defaults() {
        let dir = tempdir().unwrap();
        let config = loader_in(dir.path()).load(&create_test_cli()).unwrap();

        assert_eq!(config.federation_list.refresh_interval_secs, 3600);
        assert!(config.inbound.enforce_domain_list);
    }

    #[test]
    fn test_user_config_overrides_system() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("system.toml"),
            r#"
            [federation_list]
            url = "http://system:8080/list"
            refresh_interval_secs = 600
            "#,
        )
        .unwrap();
        fs::write(
            dir.path().join("user.toml"),
            r#"
            [federation_list]
            url = "http://user:8080/list"
            "#,
        )
        .unwrap();

        let config = loader_in(dir.path()).load(&create_test_cli()).unwrap();

        assert_eq!(config.federation_list.url, "http://user:8080/list");
        // Keys the user file leaves alone keep the system value.
        assert_eq!(config.federation_list.refresh_interval_secs, 600);
    }

    #[test]
    fn test_false_overrides_true() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("user.toml"),
            "[outbound]\nenforce_domain_list = false\n",
        )
        .unwrap();

        let config = loader_in(dir.path()).load(&create_test_cli()).unwrap();

        assert!(!config.outbound.enforce_domain_list);
        assert!(config.inbound.enforce_domain_list);
    }

    #[test]
    fn test_cli_overrides_win() {
        let dir = tempdir().unwrap();
        let cli = Cli::parse_from([
            "tim-gateway",
            "--no-enforce",
            "--outbound-listen",
            "127.0.0.1:18093",
        ]);

        let config = loader_in(dir.path()).load(&cli).unwrap();

        assert!(!config.inbound.enforce_domain_list);
        assert!(!config.outbound.enforce_domain_list);
        assert_eq!(config.outbound.listen, "127.0.0.1:18093".parse().unwrap());
    }

    #[test]
    fn test_missing_cli_config_is_error() {
        let dir = tempdir().unwrap();
        let mut cli = create_test_cli();
        cli.config = Some(dir.path().join("absent.toml"));

        let result = loader_in(dir.path()).load(&cli);
        assert!(matches!(result, Err(ConfigError::ReadError { .. })));
    }

    #[test]
    fn test_invalid_toml_returns_error() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("system.toml"), "[inbound\nlisten = ").unwrap();

        let result = loader_in(dir.path()).load(&create_test_cli());
        assert!(matches!(result, Err(ConfigError::ParseError { .. })));
    }

    #[test]
    fn test_invalid_merged_result_rejected() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("user.toml"),
            "[federation_list]\nrefresh_interval_secs = 30\nerror_backoff_secs = 60\n",
        )
        .unwrap();

        let result = loader_in(dir.path()).load(&create_test_cli());
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }
}
