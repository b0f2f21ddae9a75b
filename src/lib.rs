//! Must-call consistency checker core.
//!
//! The crate exposes a [`CheckerEngine`] that runs two independent layers
//! over a front-end-supplied [`model::Program`]: declaration checks on
//! ownership annotations and a flow-sensitive consistency analysis over
//! each method body's CFG.

pub mod cfg;
pub mod config;
pub mod consistency;
pub mod decl_check;
pub mod diagnostics;
pub mod error;
pub mod level;
pub mod model;
pub mod obligation;
pub mod oracle;

use std::collections::HashMap;

use crate::cfg::{CalledMethodsOracle, NoCalledMethods};
use crate::config::{ChecksConfig, LeakcheckConfig};
use crate::consistency::ConsistencyAnalyzer;
use crate::decl_check::DeclChecker;
use crate::diagnostics::{CheckSettings, Diagnostic, INTERNAL_ERROR};
use crate::error::Result;
use crate::level::DiagnosticLevel;
use crate::model::Program;

/// Engine orchestrating the declaration checker and the consistency
/// analyzer over whole programs.
pub struct CheckerEngine {
    checks: ChecksConfig,
    settings: CheckSettings,
    called_methods: Box<dyn CalledMethodsOracle>,
}

impl std::fmt::Debug for CheckerEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckerEngine")
            .field("checks", &self.checks)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl CheckerEngine {
    /// Create an engine with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self {
            checks: ChecksConfig::default(),
            settings: CheckSettings::default(),
            called_methods: Box::new(NoCalledMethods),
        }
    }

    /// Create a builder for configuring a `CheckerEngine`.
    ///
    /// This is the preferred way to construct an engine with custom
    /// settings.
    ///
    /// # Examples
    ///
    /// ```
    /// use leakcheck::CheckerEngine;
    ///
    /// let engine = CheckerEngine::builder()
    ///     .permit_static_owning(true)
    ///     .build()
    ///     .expect("failed to build engine");
    /// ```
    #[must_use]
    pub fn builder() -> CheckerEngineBuilder {
        CheckerEngineBuilder::new()
    }

    /// Check every declaration and analyze every method body.
    ///
    /// The two layers are independent; a finding (or an internal failure)
    /// in one never suppresses the other. Per-method analyses are
    /// transactional: an internal failure discards that method's partial
    /// state and surfaces as a distinct `internal.error` diagnostic so a
    /// driver may choose to abort.
    #[must_use = "diagnostics should be processed or reported"]
    pub fn check_program(&self, program: &Program) -> Result<Vec<Diagnostic>> {
        #[cfg(feature = "telemetry")]
        let _span =
            tracing::info_span!("check_program", types = program.types.len()).entered();

        let mut diagnostics: Vec<Diagnostic> = Vec::new();

        let checker = DeclChecker::new(program, &self.checks, &self.settings);
        for decl in &program.types {
            checker.check_type(decl, &mut diagnostics);
        }
        #[cfg(feature = "telemetry")]
        tracing::debug!(
            findings = diagnostics.len(),
            "declaration checks complete"
        );

        let analyzer = ConsistencyAnalyzer::new(
            program,
            &self.checks,
            &self.settings,
            self.called_methods.as_ref(),
        );
        for decl in &program.types {
            for method in &decl.methods {
                match analyzer.analyze(decl, method) {
                    Ok(found) => diagnostics.extend(found),
                    Err(err) => {
                        #[cfg(feature = "telemetry")]
                        tracing::warn!(
                            element = %method.element_path(&decl.name),
                            error = %err,
                            "analysis aborted"
                        );
                        diagnostics.push(Diagnostic {
                            message: &INTERNAL_ERROR,
                            level: DiagnosticLevel::Error,
                            element: method.element_path(&decl.name),
                            point: None,
                            text: err.to_string(),
                            help: None,
                        });
                    }
                }
            }
        }

        diagnostics.sort_by(|a, b| {
            (&a.element, a.point, a.message.key).cmp(&(&b.element, b.point, b.message.key))
        });
        Ok(diagnostics)
    }
}

impl Default for CheckerEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for constructing a configured [`CheckerEngine`].
///
/// Use [`CheckerEngine::builder()`] to create a new builder.
#[derive(Default)]
pub struct CheckerEngineBuilder {
    checks: ChecksConfig,
    levels: HashMap<String, DiagnosticLevel>,
    disabled: Vec<String>,
    called_methods: Option<Box<dyn CalledMethodsOracle>>,
}

impl CheckerEngineBuilder {
    /// Create a new builder with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Absorb a loaded configuration file.
    #[must_use]
    pub fn config(mut self, config: LeakcheckConfig) -> Self {
        self.levels.extend(config.checks.levels.clone());
        self.disabled.extend(config.checks.disabled.clone());
        self.checks = config.checks;
        self
    }

    /// Permit mutable static owning fields without destructor coverage.
    #[must_use]
    pub fn permit_static_owning(mut self, enabled: bool) -> Self {
        self.checks.permit_static_owning = enabled;
        self
    }

    /// Disable ownership inference on locals.
    #[must_use]
    pub fn no_lightweight_ownership(mut self, enabled: bool) -> Self {
        self.checks.no_lightweight_ownership = enabled;
        self
    }

    /// Match destructor postconditions against fields by exact canonical
    /// name instead of by substring.
    #[must_use]
    pub fn strict_field_matching(mut self, enabled: bool) -> Self {
        self.checks.strict_field_matching = enabled;
        self
    }

    /// Replace the ignored-exceptions list.
    #[must_use]
    pub fn ignored_exceptions(mut self, exceptions: impl IntoIterator<Item = String>) -> Self {
        self.checks.ignored_exceptions = exceptions.into_iter().collect();
        self
    }

    /// Exempt fields from the owning-field check.
    #[must_use]
    pub fn skipped_fields(mut self, fields: impl IntoIterator<Item = String>) -> Self {
        self.checks.skipped_fields = fields.into_iter().collect();
        self
    }

    /// Override severity for specific message keys.
    #[must_use]
    pub fn levels(mut self, levels: HashMap<String, DiagnosticLevel>) -> Self {
        self.levels.extend(levels);
        self
    }

    /// Silence these message keys.
    #[must_use]
    pub fn disabled(mut self, keys: impl IntoIterator<Item = String>) -> Self {
        self.disabled.extend(keys);
        self
    }

    /// Supply the called-methods collaborator.
    #[must_use]
    pub fn called_methods(mut self, oracle: Box<dyn CalledMethodsOracle>) -> Self {
        self.called_methods = Some(oracle);
        self
    }

    /// Build the configured [`CheckerEngine`].
    ///
    /// # Errors
    ///
    /// Returns an error if any message key in the severity overrides or the
    /// disabled list is unknown.
    pub fn build(self) -> Result<CheckerEngine> {
        let settings = CheckSettings::default()
            .with_config_levels(self.levels)?
            .disable(self.disabled)?;
        Ok(CheckerEngine {
            checks: self.checks,
            settings,
            called_methods: self.called_methods.unwrap_or_else(|| Box::new(NoCalledMethods)),
        })
    }
}

/// Construct a `CheckerEngine` with default configuration.
#[must_use = "engine should be used for checking"]
pub fn create_default_engine() -> CheckerEngine {
    CheckerEngine::new()
}

/// Install the env-filtered log subscriber, once per process. A no-op
/// without the `telemetry` feature; embedders that bring their own
/// `tracing` subscriber should skip this.
pub fn init_tracing() {
    #[cfg(feature = "telemetry")]
    {
        use std::sync::Once;
        use tracing_subscriber::EnvFilter;

        static INSTALL: Once = Once::new();
        INSTALL.call_once(|| {
            let filter = EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("leakcheck=info"));
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .try_init();
        });
    }
}
