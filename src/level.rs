use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticLevel {
    Allow,
    Warn,
    Error,
}

impl DiagnosticLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiagnosticLevel::Allow => "allow",
            DiagnosticLevel::Warn => "warning",
            DiagnosticLevel::Error => "error",
        }
    }
}

impl Default for DiagnosticLevel {
    fn default() -> Self {
        Self::Error
    }
}
