//! Diagnostic model and the message-key registry.
//!
//! Checks never fail on a finding: they build a [`Diagnostic`] and hand it
//! to a [`Reporter`], so one method's leak cannot mask another. Severity is
//! configurable per message key through [`CheckSettings`].

use std::collections::HashMap;

use crate::cfg::ProgramPoint;
use crate::error::{Error, Result};
use crate::level::DiagnosticLevel;

/// Which layer of the checker produced a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MessageCategory {
    /// Declaration-level annotation validity.
    Declaration,
    /// Flow-sensitive consistency analysis.
    Consistency,
    /// Qualifier-level facts surfaced through the shared reporter.
    Qualifier,
    /// Analysis-internal failures; a bug in annotations or a collaborating
    /// framework, not in the program under analysis.
    Internal,
}

impl MessageCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageCategory::Declaration => "declaration",
            MessageCategory::Consistency => "consistency",
            MessageCategory::Qualifier => "qualifier",
            MessageCategory::Internal => "internal",
        }
    }
}

/// Static metadata describing one diagnostic message key.
#[derive(Debug)]
pub struct MessageDescriptor {
    pub key: &'static str,
    pub category: MessageCategory,
    pub description: &'static str,
}

/// An obligation was not discharged: a field, parameter, or local may leak.
pub static REQUIRED_METHOD_NOT_CALLED: MessageDescriptor = MessageDescriptor {
    key: "required.method.not.called",
    category: MessageCategory::Consistency,
    description: "A must-call obligation is not discharged on every path",
};

/// An overrider dropped an `@Owning` mark from a parameter.
pub static OWNING_OVERRIDE_PARAM: MessageDescriptor = MessageDescriptor {
    key: "owning.override.param",
    category: MessageCategory::Declaration,
    description: "Override removes an owning mark from a parameter",
};

/// An overrider dropped the not-owning mark from a return.
pub static OWNING_OVERRIDE_RETURN: MessageDescriptor = MessageDescriptor {
    key: "owning.override.return",
    category: MessageCategory::Declaration,
    description: "Override removes the not-owning mark from a return",
};

/// An overrider narrowed the creates-must-call target set.
pub static CREATES_MUSTCALL_FOR_OVERRIDE_INVALID: MessageDescriptor = MessageDescriptor {
    key: "creates.mustcall.for.override.invalid",
    category: MessageCategory::Declaration,
    description: "Override narrows the creates-must-call target set",
};

/// A creates-must-call target has no obligation to reinstate.
pub static CREATES_MUSTCALL_FOR_INVALID_TARGET: MessageDescriptor = MessageDescriptor {
    key: "creates.mustcall.for.invalid.target",
    category: MessageCategory::Declaration,
    description: "Creates-must-call target resolves to a type with an empty must-call set",
};

/// Type-qualifier mismatch on an assignment. Registered here so the shared
/// reporter covers it, but emitted by the qualifier collaborator, never by
/// this crate.
pub static ASSIGNMENT: MessageDescriptor = MessageDescriptor {
    key: "assignment",
    category: MessageCategory::Qualifier,
    description: "Type-qualifier mismatch on an assignment",
};

/// Distinct kind for analysis-internal failures so a driver may abort.
pub static INTERNAL_ERROR: MessageDescriptor = MessageDescriptor {
    key: "internal.error",
    category: MessageCategory::Internal,
    description: "The analyzer violated one of its own invariants",
};

/// Every message key this crate knows about.
static DESCRIPTORS: &[&MessageDescriptor] = &[
    &REQUIRED_METHOD_NOT_CALLED,
    &OWNING_OVERRIDE_PARAM,
    &OWNING_OVERRIDE_RETURN,
    &CREATES_MUSTCALL_FOR_OVERRIDE_INVALID,
    &CREATES_MUSTCALL_FOR_INVALID_TARGET,
    &ASSIGNMENT,
    &INTERNAL_ERROR,
];

/// Every message key this crate knows about.
pub fn descriptors() -> &'static [&'static MessageDescriptor] {
    DESCRIPTORS
}

/// Look up a message descriptor by key.
pub fn find_descriptor(key: &str) -> Option<&'static MessageDescriptor> {
    descriptors().iter().copied().find(|d| d.key == key)
}

/// A single finding.
#[derive(Debug, Clone)]
#[must_use]
pub struct Diagnostic {
    pub message: &'static MessageDescriptor,
    pub level: DiagnosticLevel,
    /// Dotted path of the offending element, e.g. `Pool.drain`.
    pub element: String,
    /// CFG coordinate for flow-sensitive findings.
    pub point: Option<ProgramPoint>,
    pub text: String,
    pub help: Option<String>,
}

impl Diagnostic {
    /// Machine-readable rendering.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "key": self.message.key,
            "category": self.message.category.as_str(),
            "level": self.level.as_str(),
            "element": self.element,
            "point": self.point.map(|p| p.to_string()),
            "message": self.text,
            "help": self.help,
        })
    }

    /// One-line human rendering.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = format!(
            "{}: [{}] {}: {}",
            self.level.as_str(),
            self.message.key,
            self.element,
            self.text
        );
        if let Some(point) = self.point {
            out.push_str(&format!(" (at {point})"));
        }
        out
    }
}

/// The diagnostic callback handed to the checkers.
pub trait Reporter {
    fn report(&mut self, diagnostic: Diagnostic);
}

impl Reporter for Vec<Diagnostic> {
    fn report(&mut self, diagnostic: Diagnostic) {
        self.push(diagnostic);
    }
}

/// Per-message-key severity configuration derived from `leakcheck.toml`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckSettings {
    levels: HashMap<String, DiagnosticLevel>,
}

impl CheckSettings {
    /// Store explicit levels, rejecting unknown keys.
    pub fn with_config_levels(
        mut self,
        levels: HashMap<String, DiagnosticLevel>,
    ) -> Result<Self> {
        for (key, level) in levels {
            if find_descriptor(&key).is_none() {
                return Err(Error::unknown_message_key(key));
            }
            self.levels.insert(key, level);
        }
        Ok(self)
    }

    /// Silence the given keys entirely.
    pub fn disable(mut self, disabled: impl IntoIterator<Item = String>) -> Result<Self> {
        for key in disabled {
            if find_descriptor(&key).is_none() {
                return Err(Error::unknown_message_key(key));
            }
            self.levels.insert(key, DiagnosticLevel::Allow);
        }
        Ok(self)
    }

    pub fn level_for(&self, key: &str) -> DiagnosticLevel {
        // Internal failures are never configurable away.
        if key == INTERNAL_ERROR.key {
            return DiagnosticLevel::Error;
        }
        self.levels.get(key).copied().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_lookup_by_key() {
        let d = find_descriptor("required.method.not.called").expect("known key");
        assert_eq!(d.category, MessageCategory::Consistency);
        assert!(find_descriptor("no.such.key").is_none());
    }

    #[test]
    fn settings_reject_unknown_keys() {
        let err = CheckSettings::default()
            .disable(["no.such.key".to_string()])
            .unwrap_err();
        assert!(err.to_string().contains("no.such.key"));
    }

    #[test]
    fn settings_level_resolution() {
        let settings = CheckSettings::default()
            .with_config_levels(HashMap::from([(
                "owning.override.param".to_string(),
                DiagnosticLevel::Warn,
            )]))
            .expect("known key")
            .disable(["assignment".to_string()])
            .expect("known key");

        assert_eq!(
            settings.level_for("owning.override.param"),
            DiagnosticLevel::Warn
        );
        assert_eq!(settings.level_for("assignment"), DiagnosticLevel::Allow);
        assert_eq!(
            settings.level_for("required.method.not.called"),
            DiagnosticLevel::Error
        );
    }

    #[test]
    fn internal_errors_cannot_be_silenced() {
        let settings = CheckSettings::default()
            .disable(["internal.error".to_string()])
            .expect("known key");
        assert_eq!(settings.level_for("internal.error"), DiagnosticLevel::Error);
    }
}
