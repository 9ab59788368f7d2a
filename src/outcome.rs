use std::fmt;

use serde::Serialize;

/// Severity of a single sync outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Error,
    Information,
}

/// One structured result from a pipeline step. Failures never cross component
/// boundaries as panics; they are folded into outcomes carrying the action
/// name and the upstream cause.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Outcome {
    pub severity: Severity,
    pub diagnostics: String,
}

impl Outcome {
    pub fn error(action: &str, cause: impl fmt::Display) -> Self {
        Self {
            severity: Severity::Error,
            diagnostics: format!("{action}: {cause}"),
        }
    }

    pub fn info(diagnostics: impl Into<String>) -> Self {
        Self {
            severity: Severity::Information,
            diagnostics: diagnostics.into(),
        }
    }

    pub fn updated(attribute: &str, count: usize) -> Self {
        Self::info(format!("successful update of {count} {attribute} values"))
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

/// Wraps a single error outcome as a pipeline result.
pub fn error_outcomes(action: &str, cause: impl fmt::Display) -> Vec<Outcome> {
    vec![Outcome::error(action, cause)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_outcome_carries_action_and_cause() {
        let outcome = Outcome::error("collection size update", "connection refused");
        assert!(outcome.is_error());
        assert_eq!(
            outcome.diagnostics,
            "collection size update: connection refused"
        );
    }

    #[test]
    fn severity_serializes_upper_case() {
        let json = serde_json::to_string(&Severity::Error).unwrap();
        assert_eq!(json, "\"ERROR\"");
    }
}
