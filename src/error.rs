//! Error taxonomy for permission resolution and mapping helpers.
//! Every fault raised while collecting rules or executing the composed query surfaces
//! as an `Err`; callers must never read a failed resolution as "allowed".

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PermError {
    #[error("unknown action: {0}")]
    UnknownAction(String),
    #[error("action already registered: {0}")]
    DuplicateAction(String),
    #[error("resource model already registered: {0}")]
    DuplicateResourceModel(String),
    #[error("unknown resource model: {0}")]
    UnknownResourceModel(String),
    #[error("registry is sealed; {0} must happen before the engine starts serving")]
    RegistrySealed(&'static str),
    #[error("parameter :{param} supplied by both '{first}' and '{second}'")]
    RuleParameterCollision { param: String, first: String, second: String },
    #[error("invalid rule fragment from '{source_name}': {message}")]
    InvalidRuleFragment { source_name: String, message: String },
    #[error("rule source '{source_name}' failed: {message}")]
    RuleSourceExecution { source_name: String, message: String },
    #[error("rule source '{source_name}' returned {level} rules for action '{action}' whose resources are {shape}")]
    RuleContractViolation { source_name: String, action: String, level: &'static str, shape: &'static str },
    #[error("resolution exceeded {timeout_ms}ms")]
    ResolutionTimeout { timeout_ms: u64 },
    #[error("forbidden: {action}")]
    Forbidden { action: String, reason: String },
    #[error("invalid resource for '{action}': {message}")]
    InvalidResource { action: String, message: String },
    #[error("invalid cursor: {0}")]
    InvalidCursor(String),
    #[error("limit must be between 1 and {max}, got {got}")]
    InvalidLimit { got: u32, max: u32 },
    #[error("config error: {0}")]
    Config(String),
    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),
    #[error("internal error: {0}")]
    Internal(String),
}

impl PermError {
    pub fn code_str(&self) -> &'static str {
        match self {
            PermError::UnknownAction(_) => "unknown_action",
            PermError::DuplicateAction(_) => "duplicate_action",
            PermError::DuplicateResourceModel(_) => "duplicate_resource_model",
            PermError::UnknownResourceModel(_) => "unknown_resource_model",
            PermError::RegistrySealed(_) => "registry_sealed",
            PermError::RuleParameterCollision { .. } => "rule_parameter_collision",
            PermError::InvalidRuleFragment { .. } => "invalid_rule_fragment",
            PermError::RuleSourceExecution { .. } => "rule_source_execution",
            PermError::RuleContractViolation { .. } => "rule_contract_violation",
            PermError::ResolutionTimeout { .. } => "resolution_timeout",
            PermError::Forbidden { .. } => "forbidden",
            PermError::InvalidResource { .. } => "invalid_resource",
            PermError::InvalidCursor(_) => "invalid_cursor",
            PermError::InvalidLimit { .. } => "invalid_limit",
            PermError::Config(_) => "config_error",
            PermError::Store(_) => "store_error",
            PermError::Internal(_) => "internal_error",
        }
    }

    /// Map to HTTP status code. Only `Forbidden` is meant to reach end users as-is;
    /// everything else is an operational fault.
    pub fn http_status(&self) -> u16 {
        match self {
            PermError::Forbidden { .. } => 403,
            PermError::UnknownAction(_) => 404,
            PermError::InvalidResource { .. }
            | PermError::InvalidCursor(_)
            | PermError::InvalidLimit { .. } => 400,
            PermError::ResolutionTimeout { .. } => 503,
            _ => 500,
        }
    }

    /// True for faults that denied access because something broke, as opposed to a
    /// legitimate negative decision or a caller mistake.
    pub fn is_fail_closed(&self) -> bool {
        matches!(
            self,
            PermError::RuleParameterCollision { .. }
                | PermError::InvalidRuleFragment { .. }
                | PermError::RuleSourceExecution { .. }
                | PermError::RuleContractViolation { .. }
                | PermError::ResolutionTimeout { .. }
                | PermError::Store(_)
                | PermError::Internal(_)
        )
    }

    pub fn source_failed<S: Into<String>, M: ToString>(source_name: S, err: M) -> Self {
        PermError::RuleSourceExecution { source_name: source_name.into(), message: err.to_string() }
    }
}

pub type PermResult<T> = Result<T, PermError>;

impl From<serde_json::Error> for PermError {
    fn from(err: serde_json::Error) -> Self {
        PermError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_status_mapping() {
        let forbidden = PermError::Forbidden { action: "view-table".into(), reason: "no matching rule".into() };
        assert_eq!(forbidden.http_status(), 403);
        assert_eq!(PermError::UnknownAction("nope".into()).http_status(), 404);
        assert_eq!(PermError::InvalidLimit { got: 0, max: 1000 }.http_status(), 400);
        assert_eq!(PermError::ResolutionTimeout { timeout_ms: 5 }.http_status(), 503);
        assert_eq!(PermError::source_failed("cfg", "boom").http_status(), 500);
    }

    #[test]
    fn fail_closed_classification() {
        assert!(PermError::ResolutionTimeout { timeout_ms: 1 }.is_fail_closed());
        assert!(PermError::source_failed("x", "y").is_fail_closed());
        assert!(!PermError::Forbidden { action: "a".into(), reason: "r".into() }.is_fail_closed());
        assert!(!PermError::UnknownAction("a".into()).is_fail_closed());
    }

    #[test]
    fn collision_message_names_both_sources() {
        let e = PermError::RuleParameterCollision { param: "team".into(), first: "alpha".into(), second: "beta".into() };
        let msg = e.to_string();
        assert!(msg.contains("alpha") && msg.contains("beta") && msg.contains(":team"));
        assert_eq!(e.code_str(), "rule_parameter_collision");
    }
}
