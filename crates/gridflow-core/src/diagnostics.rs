//! Diagnostics collected during validation and model construction.
//!
//! Warnings and errors are accumulated rather than thrown so that a single
//! bad element does not abort inspection of the rest of the network. The
//! collection serializes to JSON for offline inspection.

use serde::Serialize;

/// Severity level for diagnostic issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Unusual but the operation continued (e.g. defaulted value)
    Warning,
    /// The element or operation could not be processed
    Error,
}

/// A single issue encountered during an operation.
#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticIssue {
    pub severity: Severity,
    /// Category for grouping (e.g. "structure", "control", "limits")
    pub category: String,
    pub message: String,
    /// Optional entity reference (e.g. "Bus 14", "Branch 1-2")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity: Option<String>,
}

impl std::fmt::Display for DiagnosticIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let severity = match self.severity {
            Severity::Warning => "warning",
            Severity::Error => "error",
        };
        write!(f, "[{}:{}] {}", severity, self.category, self.message)?;
        if let Some(entity) = &self.entity {
            write!(f, " ({})", entity)?;
        }
        Ok(())
    }
}

/// Collection of diagnostic issues for an operation.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Diagnostics {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub issues: Vec<DiagnosticIssue>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_warning(&mut self, category: &str, message: &str) {
        self.issues.push(DiagnosticIssue {
            severity: Severity::Warning,
            category: category.to_string(),
            message: message.to_string(),
            entity: None,
        });
    }

    pub fn add_error(&mut self, category: &str, message: &str) {
        self.issues.push(DiagnosticIssue {
            severity: Severity::Error,
            category: category.to_string(),
            message: message.to_string(),
            entity: None,
        });
    }

    pub fn add_warning_with_entity(&mut self, category: &str, message: &str, entity: &str) {
        self.issues.push(DiagnosticIssue {
            severity: Severity::Warning,
            category: category.to_string(),
            message: message.to_string(),
            entity: Some(entity.to_string()),
        });
    }

    pub fn add_error_with_entity(&mut self, category: &str, message: &str, entity: &str) {
        self.issues.push(DiagnosticIssue {
            severity: Severity::Error,
            category: category.to_string(),
            message: message.to_string(),
            entity: Some(entity.to_string()),
        });
    }

    pub fn warnings(&self) -> impl Iterator<Item = &DiagnosticIssue> {
        self.issues
            .iter()
            .filter(|i| i.severity == Severity::Warning)
    }

    pub fn errors(&self) -> impl Iterator<Item = &DiagnosticIssue> {
        self.issues.iter().filter(|i| i.severity == Severity::Error)
    }

    pub fn warning_count(&self) -> usize {
        self.warnings().count()
    }

    pub fn error_count(&self) -> usize {
        self.errors().count()
    }

    pub fn has_errors(&self) -> bool {
        self.error_count() > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts() {
        let mut diag = Diagnostics::new();
        diag.add_warning("structure", "network has no loads");
        diag.add_error_with_entity("control", "conflicting voltage targets", "Bus 4");
        assert_eq!(diag.warning_count(), 1);
        assert_eq!(diag.error_count(), 1);
        assert!(diag.has_errors());
    }

    #[test]
    fn test_display() {
        let mut diag = Diagnostics::new();
        diag.add_error_with_entity("limits", "qmin above qmax", "Gen 2");
        let text = diag.issues[0].to_string();
        assert!(text.contains("[error:limits]"));
        assert!(text.contains("Gen 2"));
    }
}
