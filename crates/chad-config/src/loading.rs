//! Configuration loading.
//!
//! A missing config file is not an error (defaults apply); a parse error
//! (including any unknown key) fails loudly.

use std::fs;
use std::path::Path;

use tracing::{debug, info};

use crate::errors::ConfigError;
use crate::types::ChadConfig;
use crate::validation::validate_config;

/// Load and validate configuration from `~/.chad/config.toml`.
pub fn load() -> Result<ChadConfig, ConfigError> {
    let paths = chad_paths::ChadPaths::resolve().map_err(|e| ConfigError::InvalidConfiguration {
        message: e.to_string(),
    })?;
    load_from_path(&paths.user_config())
}

/// Load and validate configuration from an explicit path.
pub fn load_from_path(path: &Path) -> Result<ChadConfig, ConfigError> {
    let config = match fs::read_to_string(path) {
        Ok(content) => {
            let config: ChadConfig =
                toml::from_str(&content).map_err(|e| ConfigError::ConfigParseError {
                    message: e.to_string(),
                })?;
            info!(
                event = "config.load_completed",
                path = %path.display(),
                accounts = config.accounts.len(),
                rules = config.rules.len(),
            );
            config
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(event = "config.load_defaults", path = %path.display());
            ChadConfig::default()
        }
        Err(e) => return Err(e.into()),
    };

    validate_config(&config)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let config = load_from_path(&dir.path().join("config.toml")).unwrap();
        assert!(config.accounts.is_empty());
        assert_eq!(config.verification.max_attempts, 5);
    }

    #[test]
    fn test_load_full_config() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            r#"
            [[accounts]]
            name = "work"
            provider = "anthropic"
            model = "opus"
            role = "coding"

            [[accounts]]
            name = "backup"
            provider = "openai"
            role = "coding"

            [[rules]]
            event = "session_usage"
            threshold = 80.0
            action = "notify"

            [[rules]]
            event = "session_usage"
            threshold = 90.0
            action = "switch_provider"
            target_account = "backup"

            [verification]
            max_attempts = 3

            [timeouts]
            phase_secs = 1800
            "#,
        )
        .unwrap();

        let config = load_from_path(&path).unwrap();
        assert_eq!(config.accounts.len(), 2);
        assert_eq!(config.rules.len(), 2);
        assert_eq!(config.verification.max_attempts, 3);
        assert_eq!(config.timeouts.phase_secs, 1800);
        assert_eq!(config.timeouts.idle_thinking_secs, 60);
        assert_eq!(config.find_account("work").unwrap().model.as_deref(), Some("opus"));
    }

    #[test]
    fn test_load_unknown_key_fails() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "metrics_enabled = true\n").unwrap();
        let err = load_from_path(&path).unwrap_err();
        assert!(matches!(err, ConfigError::ConfigParseError { .. }));
    }

    #[test]
    fn test_load_invalid_rule_fails_validation() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            r#"
            [[rules]]
            event = "weekly_usage"
            threshold = 90.0
            action = "switch_provider"
            "#,
        )
        .unwrap();
        let err = load_from_path(&path).unwrap_err();
        assert!(err.to_string().contains("target_account"));
    }
}
