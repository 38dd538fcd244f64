//! Error types for policy operations

use dse_node::DseError;
use thiserror::Error;

/// Errors raised by policy management and rule updates
#[derive(Debug, Error)]
pub enum PolicyError {
    /// A policy with this name already exists
    #[error("policy '{0}' already exists")]
    DuplicateName(String),

    /// No policy with this name exists
    #[error("policy '{0}' not found")]
    NotFound(String),

    /// A deletion named a rule the policy does not contain
    #[error("rule '{rule}' not found in policy '{policy}'")]
    RuleNotFound {
        /// Target policy
        policy: String,
        /// Rendered rule
        rule: String,
    },

    /// A head variable does not occur in the rule body
    #[error("rule '{rule}' is unsafe: variable {variable} does not occur in its body")]
    UnsafeRule {
        /// Rendered rule
        rule: String,
        /// Offending variable
        variable: String,
    },

    /// The rule is malformed
    #[error("invalid rule '{rule}': {reason}")]
    InvalidRule {
        /// Rendered rule
        rule: String,
        /// What is wrong with it
        reason: String,
    },

    /// The hosting node refused an operation
    #[error(transparent)]
    Dse(#[from] DseError),
}

/// Result type for policy operations
pub type PolicyResult<T> = Result<T, PolicyError>;
