use crate::error::{Error, Result};
use crate::level::DiagnosticLevel;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub const DEFAULT_CONFIG_FILE_NAME: &str = "leakcheck.toml";

#[derive(Debug, Default, Deserialize)]
pub struct LeakcheckConfig {
    #[serde(default)]
    pub checks: ChecksConfig,
}

impl FromStr for LeakcheckConfig {
    type Err = Error;

    fn from_str(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }
}

impl LeakcheckConfig {
    /// Parse one configuration file, attributing every failure to it.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|err| Error::config(path, format!("failed to read: {err}")))?;
        raw.parse()
            .map_err(|err: Error| Error::config(path, err.to_string()))
    }

    /// Load the configuration governing `start_dir`: an explicitly named
    /// file wins; otherwise the nearest `leakcheck.toml` on the way up to
    /// the filesystem root. `Ok(None)` means nothing governs it.
    pub fn discover(
        explicit: Option<&Path>,
        start_dir: &Path,
    ) -> Result<Option<(PathBuf, Self)>> {
        let governing = explicit.map(Path::to_path_buf).or_else(|| {
            start_dir
                .ancestors()
                .map(|dir| dir.join(DEFAULT_CONFIG_FILE_NAME))
                .find(|candidate| candidate.is_file())
        });
        governing
            .map(|path| Self::from_file(&path).map(|cfg| (path, cfg)))
            .transpose()
    }
}

/// Knobs for the declaration checker and the consistency analyzer.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ChecksConfig {
    /// Permit mutable static fields to carry an owning mark without
    /// destructor coverage.
    #[serde(default)]
    pub permit_static_owning: bool,

    /// Disable ownership inference on locals; only annotated parameters are
    /// tracked.
    #[serde(default)]
    pub no_lightweight_ownership: bool,

    /// Match destructor postcondition expressions against owning fields by
    /// exact canonical name instead of by substring.
    #[serde(default)]
    pub strict_field_matching: bool,

    /// Exception types whose exceptional edges are not propagated into the
    /// exceptional-exit analysis.
    #[serde(default = "default_ignored_exceptions")]
    pub ignored_exceptions: Vec<String>,

    /// Fields (as `Type.field` or bare names) exempted from the owning-field
    /// check.
    #[serde(default)]
    pub skipped_fields: Vec<String>,

    /// Message keys silenced entirely.
    #[serde(default)]
    pub disabled: Vec<String>,

    /// Per-key severity overrides.
    #[serde(flatten)]
    pub levels: HashMap<String, DiagnosticLevel>,
}

impl Default for ChecksConfig {
    fn default() -> Self {
        Self {
            permit_static_owning: false,
            no_lightweight_ownership: false,
            strict_field_matching: false,
            ignored_exceptions: default_ignored_exceptions(),
            skipped_fields: Vec::new(),
            disabled: Vec::new(),
            levels: HashMap::new(),
        }
    }
}

impl ChecksConfig {
    /// Whether an exception type's exceptional edges are suppressed.
    /// Accepts either simple or package-qualified names.
    pub fn is_ignored_exception(&self, exception: &str) -> bool {
        let simple = exception.rsplit('.').next().unwrap_or(exception);
        self.ignored_exceptions.iter().any(|ignored| {
            let ignored_simple = ignored.rsplit('.').next().unwrap_or(ignored);
            ignored_simple == simple
        })
    }

    /// Whether the per-user filter exempts `owner.field`.
    pub fn is_skipped_field(&self, owner: &str, field: &str) -> bool {
        let qualified = format!("{owner}.{field}");
        self.skipped_fields
            .iter()
            .any(|s| s == field || *s == qualified)
    }
}

/// Unrecoverable runtime faults: an exit through one of these indicates a
/// bug in the program rather than a state callers recover from, so their
/// edges are excluded from the exceptional-exit analysis by default.
pub fn default_ignored_exceptions() -> Vec<String> {
    [
        "NullPointerException",
        "ArithmeticException",
        "ArrayIndexOutOfBoundsException",
        "ClassCastException",
        "NegativeArraySizeException",
        "ArrayStoreException",
        "OutOfMemoryError",
        "StackOverflowError",
        "AssertionError",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ignored_exceptions_match_qualified_names() {
        let cfg = ChecksConfig::default();
        assert!(cfg.is_ignored_exception("NullPointerException"));
        assert!(cfg.is_ignored_exception("java.lang.NullPointerException"));
        assert!(!cfg.is_ignored_exception("IOException"));
    }

    #[test]
    fn skipped_field_filter_accepts_both_spellings() {
        let cfg = ChecksConfig {
            skipped_fields: vec!["Pool.conn".to_string(), "buf".to_string()],
            ..ChecksConfig::default()
        };
        assert!(cfg.is_skipped_field("Pool", "conn"));
        assert!(!cfg.is_skipped_field("Other", "conn"));
        assert!(cfg.is_skipped_field("Any", "buf"));
    }

    #[test]
    fn default_config_parses_from_empty_toml() {
        let cfg: LeakcheckConfig = "".parse().expect("empty config");
        assert!(!cfg.checks.permit_static_owning);
        assert!(cfg.checks.is_ignored_exception("AssertionError"));
    }

    #[test]
    fn malformed_toml_is_a_config_parse_error() {
        let err = "not = [valid".parse::<LeakcheckConfig>().unwrap_err();
        assert!(matches!(err, Error::ConfigParse(_)));
    }
}
