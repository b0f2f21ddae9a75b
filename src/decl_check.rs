//! Declaration-level checks for ownership and obligation annotations.
//!
//! Four independent checks run once per declaration: owning-field destructor
//! coverage, owning-parameter overrides, not-owning-return overrides, and
//! creates-must-call override covariance plus target validity. Each is
//! purely declarative — no control flow is consulted — and each reports and
//! continues, so one finding never masks another. Re-running on identical
//! input yields the identical diagnostic multiset.

use itertools::{Itertools, iproduct};

use crate::config::ChecksConfig;
use crate::diagnostics::{
    CREATES_MUSTCALL_FOR_INVALID_TARGET, CREATES_MUSTCALL_FOR_OVERRIDE_INVALID, CheckSettings,
    Diagnostic, OWNING_OVERRIDE_PARAM, OWNING_OVERRIDE_RETURN, REQUIRED_METHOD_NOT_CALLED,
    Reporter,
};
use crate::level::DiagnosticLevel;
use crate::model::{FieldDecl, MethodDecl, Program, TypeDecl};
use crate::obligation::{ExitKind, canonicalize};
use crate::oracle::AnnotationOracle;

/// Does a postcondition expression name this field?
///
/// The default is a substring match on the field's simple name, which
/// over-accepts when field names share a stem; the exact canonical matcher
/// sits behind `strict-field-matching`.
// TODO: flip the default to the strict matcher once destructor annotations
// in the supported corpora spell out `this.<field>` consistently.
fn expression_covers_field(expression: &str, field: &str, strict: bool) -> bool {
    if strict {
        canonicalize(expression) == field
    } else {
        expression.contains(field)
    }
}

/// Runs the declaration checks over whole types.
pub struct DeclChecker<'p> {
    oracle: AnnotationOracle<'p>,
    config: &'p ChecksConfig,
    settings: &'p CheckSettings,
}

impl<'p> DeclChecker<'p> {
    #[must_use]
    pub fn new(
        program: &'p Program,
        config: &'p ChecksConfig,
        settings: &'p CheckSettings,
    ) -> Self {
        Self {
            oracle: AnnotationOracle::new(program),
            config,
            settings,
        }
    }

    fn emit(
        &self,
        out: &mut dyn Reporter,
        message: &'static crate::diagnostics::MessageDescriptor,
        element: String,
        text: String,
    ) {
        let level = self.settings.level_for(message.key);
        if level == DiagnosticLevel::Allow {
            return;
        }
        out.report(Diagnostic {
            message,
            level,
            element,
            point: None,
            text,
            help: None,
        });
    }

    /// Run every declaration check on one type.
    pub fn check_type(&self, decl: &TypeDecl, out: &mut dyn Reporter) {
        for field in decl.owning_fields() {
            self.check_owning_field(decl, field, out);
        }
        for method in &decl.methods {
            if let Some((super_owner, overridden)) = self.overridden_method(decl, method) {
                self.check_owning_override_params(decl, method, super_owner, overridden, out);
                self.check_not_owning_return_override(decl, method, super_owner, overridden, out);
                self.check_cmcf_override(decl, method, super_owner, overridden, out);
            }
            self.check_cmcf_targets(decl, method, out);
        }
    }

    /// Owning-field validity: the enclosing type must promise, through the
    /// postconditions of its own must-call methods, that every obligation of
    /// the field is discharged on both exit kinds.
    fn check_owning_field(&self, decl: &TypeDecl, field: &FieldDecl, out: &mut dyn Reporter) {
        if self.config.is_skipped_field(&decl.name, &field.name) {
            return;
        }
        // A final static field is initialized once; releasing it is a
        // program-lifetime matter deliberately left to the runtime.
        if field.is_static && (self.config.permit_static_owning || field.is_final) {
            return;
        }

        let Some(field_mcs) = self.oracle.must_call_of(&field.ty).trackable().cloned() else {
            return;
        };

        let element = format!("{}.{}", decl.name, field.name);
        let Some(enclosing_mcs) = self
            .oracle
            .must_call_of(&decl.name)
            .trackable()
            .cloned()
        else {
            self.emit(
                out,
                &REQUIRED_METHOD_NOT_CALLED,
                element,
                format!(
                    "field `{}` carries obligations ({}) but `{}` declares no must-call \
                     method that could release them",
                    field.name,
                    field_mcs.iter().join(", "),
                    decl.name
                ),
            );
            return;
        };

        let destructors: Vec<&MethodDecl> = self.must_call_methods(decl, &enclosing_mcs);

        let unsatisfied: Vec<(ExitKind, &String)> = iproduct!(ExitKind::ALL, field_mcs.iter())
            .filter(|(exit, required)| {
                !destructors.iter().any(|d| {
                    self.oracle.ensures_called_methods(d).iter().any(|fact| {
                        fact.exit == *exit
                            && fact.methods.iter().any(|m| m == *required)
                            && expression_covers_field(
                                &fact.expression,
                                &field.name,
                                self.config.strict_field_matching,
                            )
                    })
                })
            })
            .collect();

        if !unsatisfied.is_empty() {
            let pairs = unsatisfied
                .iter()
                .map(|(exit, m)| format!("({}, {m})", exit.as_str()))
                .join(", ");
            self.emit(
                out,
                &REQUIRED_METHOD_NOT_CALLED,
                element,
                format!(
                    "no must-call method of `{}` guarantees release of field `{}`; \
                     uncovered: {pairs}",
                    decl.name, field.name
                ),
            );
        }
    }

    /// Methods of the type (own or inherited) whose name appears in the
    /// enclosing must-call set.
    fn must_call_methods(
        &self,
        decl: &TypeDecl,
        enclosing_mcs: &std::collections::BTreeSet<String>,
    ) -> Vec<&'p MethodDecl> {
        let program = self.oracle.program();
        let mut found = Vec::new();
        let Some(decl) = program.find_type(&decl.name) else {
            return found;
        };
        for m in &decl.methods {
            if enclosing_mcs.contains(&m.name) {
                found.push(m);
            }
        }
        for sup in program.supertypes(&decl.name) {
            for m in &sup.methods {
                if enclosing_mcs.contains(&m.name) && !m.is_constructor {
                    found.push(m);
                }
            }
        }
        found
    }

    /// The nearest supertype declaration this method overrides.
    fn overridden_method(
        &self,
        decl: &TypeDecl,
        method: &MethodDecl,
    ) -> Option<(&'p TypeDecl, &'p MethodDecl)> {
        if method.is_constructor || method.is_static {
            return None;
        }
        for sup in self.oracle.program().supertypes(&decl.name) {
            if let Some(overridden) = sup.find_method(&method.name, method.params.len())
                && !overridden.is_constructor
                && !overridden.is_static
            {
                return Some((sup, overridden));
            }
        }
        None
    }

    /// Behavioral subtyping for owned parameters: an overrider may not drop
    /// an owning mark the superclass promised to take.
    fn check_owning_override_params(
        &self,
        decl: &TypeDecl,
        method: &MethodDecl,
        super_owner: &TypeDecl,
        overridden: &MethodDecl,
        out: &mut dyn Reporter,
    ) {
        for (index, (sub, sup)) in method.params.iter().zip(&overridden.params).enumerate() {
            if sup.owning && !sub.owning {
                self.emit(
                    out,
                    &OWNING_OVERRIDE_PARAM,
                    method.element_path(&decl.name),
                    format!(
                        "parameter `{}` (index {index}) is owning in `{}` but not in the \
                         override; callers transferring ownership would leak",
                        sub.name,
                        overridden.element_path(&super_owner.name)
                    ),
                );
            }
        }
    }

    fn check_not_owning_return_override(
        &self,
        decl: &TypeDecl,
        method: &MethodDecl,
        super_owner: &TypeDecl,
        overridden: &MethodDecl,
        out: &mut dyn Reporter,
    ) {
        if self.oracle.not_owning_return(overridden) && !self.oracle.not_owning_return(method) {
            self.emit(
                out,
                &OWNING_OVERRIDE_RETURN,
                method.element_path(&decl.name),
                format!(
                    "`{}` declares a not-owning return but the override does not; callers \
                     dispatching through the supertype would not release the result",
                    overridden.element_path(&super_owner.name)
                ),
            );
        }
    }

    /// Covariance on creates-must-call effects: dynamic dispatch must not
    /// silently drop a reinstated obligation the caller relies on.
    fn check_cmcf_override(
        &self,
        decl: &TypeDecl,
        method: &MethodDecl,
        super_owner: &TypeDecl,
        overridden: &MethodDecl,
        out: &mut dyn Reporter,
    ) {
        let super_targets = self.oracle.creates_must_call_for(overridden);
        if super_targets.is_empty() {
            return;
        }
        let sub_targets: Vec<String> = self
            .oracle
            .creates_must_call_for(method)
            .iter()
            .map(|t| canonicalize(t))
            .collect();
        let missing: Vec<String> = super_targets
            .iter()
            .map(|t| canonicalize(t))
            .filter(|t| !sub_targets.contains(t))
            .collect();
        if !missing.is_empty() {
            self.emit(
                out,
                &CREATES_MUSTCALL_FOR_OVERRIDE_INVALID,
                method.element_path(&decl.name),
                format!(
                    "override drops creates-must-call target(s) {} declared by `{}`",
                    missing.iter().map(|t| format!("`{t}`")).join(", "),
                    overridden.element_path(&super_owner.name)
                ),
            );
        }
    }

    /// Every creates-must-call target must denote a value that can carry an
    /// obligation in the first place.
    fn check_cmcf_targets(&self, decl: &TypeDecl, method: &MethodDecl, out: &mut dyn Reporter) {
        if method.creates_must_call.is_none() {
            return;
        }
        for target in self.oracle.creates_must_call_for(method) {
            let resolved = self.oracle.cmcf_target_type(decl, method, &target);
            let valid = match resolved.as_deref() {
                // Top is fine: an unknown set may well be non-empty.
                Some(ty) => !self.oracle.must_call_of(ty).is_known_empty(),
                None => false,
            };
            if !valid {
                self.emit(
                    out,
                    &CREATES_MUSTCALL_FOR_INVALID_TARGET,
                    method.element_path(&decl.name),
                    format!(
                        "creates-must-call target `{target}` does not resolve to a value \
                         with a non-empty must-call set"
                    ),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ParamDecl;

    fn run(program: &Program) -> Vec<Diagnostic> {
        let config = ChecksConfig::default();
        let settings = CheckSettings::default();
        let checker = DeclChecker::new(program, &config, &settings);
        let mut out = Vec::new();
        for t in &program.types {
            checker.check_type(t, &mut out);
        }
        out
    }

    fn keys(diags: &[Diagnostic]) -> Vec<&'static str> {
        diags.iter().map(|d| d.message.key).collect()
    }

    fn sock() -> TypeDecl {
        TypeDecl::new("Sock").must_call(["close"])
    }

    #[test]
    fn covered_owning_field_is_accepted() {
        let program = Program::new(vec![
            sock(),
            TypeDecl::new("Holder")
                .must_call(["release"])
                .field(FieldDecl::new("sock", "Sock").owning())
                .method(
                    MethodDecl::new("release")
                        .ensures(["this.sock"], ["close"])
                        .ensures_on_exception(["this.sock"], ["close"]),
                ),
        ]);
        assert!(run(&program).is_empty());
    }

    #[test]
    fn missing_exceptional_coverage_is_reported_with_the_pair() {
        let program = Program::new(vec![
            sock(),
            TypeDecl::new("Holder")
                .must_call(["release"])
                .field(FieldDecl::new("sock", "Sock").owning())
                .method(MethodDecl::new("release").ensures(["this.sock"], ["close"])),
        ]);
        let diags = run(&program);
        assert_eq!(keys(&diags), vec!["required.method.not.called"]);
        assert!(diags[0].text.contains("(exceptional exit, close)"));
        assert!(!diags[0].text.contains("(normal return, close)"));
    }

    #[test]
    fn enclosing_type_without_must_call_is_reported() {
        let program = Program::new(vec![
            sock(),
            TypeDecl::new("Holder").field(FieldDecl::new("sock", "Sock").owning()),
        ]);
        let diags = run(&program);
        assert_eq!(keys(&diags), vec!["required.method.not.called"]);
        assert!(diags[0].text.contains("declares no must-call method"));
    }

    #[test]
    fn static_final_owning_field_is_skipped() {
        let program = Program::new(vec![
            sock(),
            TypeDecl::new("Holder").field(FieldDecl::new("sock", "Sock").owning().static_final()),
        ]);
        assert!(run(&program).is_empty());
    }

    #[test]
    fn mutable_static_owning_field_needs_the_option() {
        let program = Program::new(vec![
            sock(),
            TypeDecl::new("Holder").field(FieldDecl::new("sock", "Sock").owning().static_mut()),
        ]);
        assert_eq!(keys(&run(&program)), vec!["required.method.not.called"]);

        let config = ChecksConfig {
            permit_static_owning: true,
            ..ChecksConfig::default()
        };
        let settings = CheckSettings::default();
        let checker = DeclChecker::new(&program, &config, &settings);
        let mut out = Vec::new();
        for t in &program.types {
            checker.check_type(t, &mut out);
        }
        assert!(out.is_empty());
    }

    #[test]
    fn substring_matching_accepts_loose_expressions_and_strict_rejects() {
        let mk = || {
            Program::new(vec![
                sock(),
                TypeDecl::new("Holder")
                    .must_call(["release"])
                    .field(FieldDecl::new("sock", "Sock").owning())
                    .method(
                        MethodDecl::new("release")
                            .ensures(["this.sockWrapper"], ["close"])
                            .ensures_on_exception(["this.sockWrapper"], ["close"]),
                    ),
            ])
        };

        // `this.sockWrapper` contains `sock`: the default matcher accepts.
        assert!(run(&mk()).is_empty());

        let program = mk();
        let config = ChecksConfig {
            strict_field_matching: true,
            ..ChecksConfig::default()
        };
        let settings = CheckSettings::default();
        let checker = DeclChecker::new(&program, &config, &settings);
        let mut out = Vec::new();
        for t in &program.types {
            checker.check_type(t, &mut out);
        }
        assert_eq!(keys(&out), vec!["required.method.not.called"]);
    }

    #[test]
    fn self_referential_owning_field_is_checked_without_recursion() {
        let program = Program::new(vec![
            TypeDecl::new("Node")
                .must_call(["close"])
                .field(FieldDecl::new("next", "Node").owning())
                .method(
                    MethodDecl::new("close")
                        .ensures(["this.next"], ["close"])
                        .ensures_on_exception(["this.next"], ["close"]),
                ),
        ]);
        assert!(run(&program).is_empty());
    }

    #[test]
    fn override_dropping_owning_param_is_reported() {
        let program = Program::new(vec![
            sock(),
            TypeDecl::new("Base")
                .method(MethodDecl::new("take").param(ParamDecl::new("s", "Sock").owning())),
            TypeDecl::new("Sub")
                .extends("Base")
                .method(MethodDecl::new("take").param(ParamDecl::new("s", "Sock"))),
        ]);
        let diags = run(&program);
        assert_eq!(keys(&diags), vec!["owning.override.param"]);
        assert_eq!(diags[0].element, "Sub.take");
    }

    #[test]
    fn override_keeping_owning_param_is_accepted() {
        let program = Program::new(vec![
            sock(),
            TypeDecl::new("Base")
                .method(MethodDecl::new("take").param(ParamDecl::new("s", "Sock").owning())),
            TypeDecl::new("Sub")
                .extends("Base")
                .method(MethodDecl::new("take").param(ParamDecl::new("s", "Sock").owning())),
        ]);
        assert!(run(&program).is_empty());
    }

    #[test]
    fn override_dropping_not_owning_return_is_reported() {
        let program = Program::new(vec![
            sock(),
            TypeDecl::new("Base")
                .method(MethodDecl::new("peek").returns("Sock").not_owning_return()),
            TypeDecl::new("Sub")
                .extends("Base")
                .method(MethodDecl::new("peek").returns("Sock")),
        ]);
        assert_eq!(keys(&run(&program)), vec!["owning.override.return"]);
    }

    #[test]
    fn cmcf_override_must_cover_super_targets() {
        let program = Program::new(vec![
            TypeDecl::new("Res")
                .must_call(["close"])
                .method(MethodDecl::new("reopen").creates_must_call(["this"])),
            TypeDecl::new("SubRes")
                .extends("Res")
                .method(MethodDecl::new("reopen")),
        ]);
        let diags = run(&program);
        assert_eq!(keys(&diags), vec!["creates.mustcall.for.override.invalid"]);
    }

    #[test]
    fn cmcf_default_receiver_matches_explicit_this() {
        let program = Program::new(vec![
            TypeDecl::new("Res")
                .must_call(["close"])
                .method(MethodDecl::new("reopen").creates_must_call(Vec::<String>::new())),
            TypeDecl::new("SubRes")
                .extends("Res")
                .method(MethodDecl::new("reopen").creates_must_call(["this"])),
        ]);
        assert!(run(&program).is_empty());
    }

    #[test]
    fn cmcf_target_with_empty_must_call_is_reported() {
        let program = Program::new(vec![
            TypeDecl::new("Res")
                .must_call(["close"])
                .method(MethodDecl::new("rename").creates_must_call(["name"]))
                .field(FieldDecl::new("name", "String")),
        ]);
        let diags = run(&program);
        assert_eq!(keys(&diags), vec!["creates.mustcall.for.invalid.target"]);
    }

    #[test]
    fn rerunning_the_checker_is_idempotent() {
        let program = Program::new(vec![
            sock(),
            TypeDecl::new("Holder").field(FieldDecl::new("sock", "Sock").owning()),
        ]);
        let first: Vec<String> = run(&program).iter().map(Diagnostic::render).collect();
        let second: Vec<String> = run(&program).iter().map(Diagnostic::render).collect();
        assert_eq!(first, second);
    }
}
