//! Cross-field configuration validation.

use crate::errors::ConfigError;
use crate::types::{ChadConfig, RuleAction};

/// Validate a loaded configuration.
///
/// Checks the constraints the type system cannot express: unique non-empty
/// account names, thresholds within `[0, 100]`, `switch_provider` rules
/// naming a configured target account, and verification attempts in 1–20.
pub fn validate_config(config: &ChadConfig) -> Result<(), ConfigError> {
    let mut seen = std::collections::HashSet::new();
    for account in &config.accounts {
        if account.name.trim().is_empty() {
            return Err(ConfigError::InvalidConfiguration {
                message: "account name cannot be empty".to_string(),
            });
        }
        if !seen.insert(account.name.as_str()) {
            return Err(ConfigError::InvalidConfiguration {
                message: format!("duplicate account name '{}'", account.name),
            });
        }
    }

    for rule in &config.rules {
        if !(0.0..=100.0).contains(&rule.threshold) {
            return Err(ConfigError::InvalidConfiguration {
                message: format!(
                    "rule threshold {} out of range, must be between 0 and 100",
                    rule.threshold
                ),
            });
        }
        if rule.action == RuleAction::SwitchProvider {
            match &rule.target_account {
                None => {
                    return Err(ConfigError::InvalidConfiguration {
                        message: "switch_provider rule requires target_account".to_string(),
                    });
                }
                Some(target) if config.find_account(target).is_none() => {
                    return Err(ConfigError::UnknownAccount {
                        account: target.clone(),
                        configured: config.account_names(),
                    });
                }
                Some(_) => {}
            }
        }
    }

    if !(1..=20).contains(&config.verification.max_attempts) {
        return Err(ConfigError::InvalidConfiguration {
            message: format!(
                "verification.max_attempts {} out of range, must be between 1 and 20",
                config.verification.max_attempts
            ),
        });
    }

    Ok(())
}
