//! # chad-config
//!
//! TOML configuration types, loading, and validation for the chad
//! orchestrator: accounts, usage action rules, verification settings, and
//! phase timeout budgets.
//!
//! Unknown keys anywhere in the document are a hard error so new options
//! never drift silently. Depends only on `chad-paths` and `chad-protocol`.

mod loading;
mod validation;

pub mod errors;
pub mod types;

pub use errors::ConfigError;
pub use loading::{load, load_from_path};
pub use types::{
    Account, AccountRole, ActionRule, ChadConfig, RuleAction, TimeoutSettings, UsageEvent,
    VerificationSettings,
};
pub use validation::validate_config;
