#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to parse config file: {message}")]
    ConfigParseError { message: String },

    #[error("Unknown account '{account}'. Configured accounts: {configured}")]
    UnknownAccount { account: String, configured: String },

    #[error("Invalid configuration: {message}")]
    InvalidConfiguration { message: String },

    #[error("IO error reading config: {source}")]
    IoError {
        #[from]
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_display() {
        let error = ConfigError::UnknownAccount {
            account: "missing".to_string(),
            configured: "work, personal".to_string(),
        };
        let msg = error.to_string();
        assert!(msg.contains("Unknown account 'missing'"));
        assert!(msg.contains("work, personal"));
    }

    #[test]
    fn test_invalid_configuration_display() {
        let error = ConfigError::InvalidConfiguration {
            message: "threshold out of range".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Invalid configuration: threshold out of range"
        );
    }
}
