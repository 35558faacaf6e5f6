//! Configuration types for accounts, usage action rules, and engine tuning.
//!
//! Every struct denies unknown fields: a typo or an option added by a newer
//! version fails loudly at parse time instead of silently drifting.

use serde::{Deserialize, Serialize};

use chad_protocol::ProviderKind;

/// Role an account is assigned to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountRole {
    Coding,
    Verification,
}

/// A named, isolated credential profile for an agent CLI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Account {
    pub name: String,
    pub provider: ProviderKind,
    /// Preferred model, or `None` for the provider default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Reasoning effort hint passed through to the CLI where supported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<AccountRole>,
}

/// Usage metric a rule watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageEvent {
    SessionUsage,
    WeeklyUsage,
    ContextUsage,
}

impl UsageEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            UsageEvent::SessionUsage => "session_usage",
            UsageEvent::WeeklyUsage => "weekly_usage",
            UsageEvent::ContextUsage => "context_usage",
        }
    }
}

/// Action taken when a rule fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    Notify,
    SwitchProvider,
    AwaitReset,
}

/// A usage threshold rule.
///
/// Fires exactly on the edge where the previous reading was below the
/// threshold and the current reading is at or above it. Multiple rules for
/// the same event coexist and fire independently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ActionRule {
    pub event: UsageEvent,
    /// Percentage in `[0, 100]`.
    pub threshold: f64,
    pub action: RuleAction,
    /// Required for `switch_provider`; names the account to hand off to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_account: Option<String>,
}

/// Verification loop settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VerificationSettings {
    /// Maximum verification → revision cycles. Valid range 1–20.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_max_attempts() -> u32 {
    5
}

impl Default for VerificationSettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
        }
    }
}

/// Wall-clock and idle budgets for agent phases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimeoutSettings {
    /// Overall wall-clock bound per phase, seconds.
    #[serde(default = "default_phase_secs")]
    pub phase_secs: u64,
    /// Idle budget while the agent is thinking, seconds.
    #[serde(default = "default_idle_thinking_secs")]
    pub idle_thinking_secs: u64,
    /// Idle budget mid-thought for large models, seconds.
    #[serde(default = "default_idle_mid_thought_secs")]
    pub idle_mid_thought_secs: u64,
    /// Idle budget while a long-running command executes, seconds.
    #[serde(default = "default_idle_command_secs")]
    pub idle_command_secs: u64,
    /// Exploration commands allowed before the loop detector fails the task.
    #[serde(default = "default_exploration_command_limit")]
    pub exploration_command_limit: u32,
}

fn default_phase_secs() -> u64 {
    1500
}
fn default_idle_thinking_secs() -> u64 {
    60
}
fn default_idle_mid_thought_secs() -> u64 {
    240
}
fn default_idle_command_secs() -> u64 {
    420
}
fn default_exploration_command_limit() -> u32 {
    40
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            phase_secs: default_phase_secs(),
            idle_thinking_secs: default_idle_thinking_secs(),
            idle_mid_thought_secs: default_idle_mid_thought_secs(),
            idle_command_secs: default_idle_command_secs(),
            exploration_command_limit: default_exploration_command_limit(),
        }
    }
}

/// Root configuration document (`~/.chad/config.toml`).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChadConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub accounts: Vec<Account>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<ActionRule>,
    #[serde(default)]
    pub verification: VerificationSettings,
    #[serde(default)]
    pub timeouts: TimeoutSettings,
}

impl ChadConfig {
    /// Look up an account by name.
    pub fn find_account(&self, name: &str) -> Option<&Account> {
        self.accounts.iter().find(|a| a.name == name)
    }

    /// Comma-separated configured account names for error messages.
    pub fn account_names(&self) -> String {
        self.accounts
            .iter()
            .map(|a| a.name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ChadConfig::default();
        assert!(config.accounts.is_empty());
        assert!(config.rules.is_empty());
        assert_eq!(config.verification.max_attempts, 5);
        assert_eq!(config.timeouts.phase_secs, 1500);
        assert_eq!(config.timeouts.idle_thinking_secs, 60);
        assert_eq!(config.timeouts.idle_mid_thought_secs, 240);
        assert_eq!(config.timeouts.idle_command_secs, 420);
        assert_eq!(config.timeouts.exploration_command_limit, 40);
    }

    #[test]
    fn test_find_account() {
        let config = ChadConfig {
            accounts: vec![Account {
                name: "work".to_string(),
                provider: ProviderKind::Anthropic,
                model: None,
                reasoning: None,
                role: Some(AccountRole::Coding),
            }],
            ..Default::default()
        };
        assert!(config.find_account("work").is_some());
        assert!(config.find_account("missing").is_none());
    }

    #[test]
    fn test_rule_action_serde() {
        let rule: ActionRule = toml::from_str(
            r#"
            event = "session_usage"
            threshold = 90.0
            action = "switch_provider"
            target_account = "backup"
            "#,
        )
        .unwrap();
        assert_eq!(rule.event, UsageEvent::SessionUsage);
        assert_eq!(rule.action, RuleAction::SwitchProvider);
        assert_eq!(rule.target_account.as_deref(), Some("backup"));
    }

    #[test]
    fn test_unknown_key_is_hard_error() {
        let result: Result<ChadConfig, _> = toml::from_str(
            r#"
            [[accounts]]
            name = "work"
            provider = "anthropic"
            favourite_colour = "green"
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_unknown_top_level_key_is_hard_error() {
        let result: Result<ChadConfig, _> = toml::from_str("observability = true\n");
        assert!(result.is_err());
    }
}
