//! Annotation oracle: pure queries against program elements.
//!
//! This is the single place where annotation payloads are interpreted —
//! must-call lattice resolution, contract flattening, creates-must-call
//! defaulting. Expression strings come back verbatim; binding `this`,
//! parameter names, and `#N` indices to call-site expressions is the
//! caller's duty.

use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};

use crate::model::{MethodDecl, Program, TypeDecl};
use crate::obligation::ExitKind;

/// Built-in immutable types with no obligations, regardless of annotation.
/// Kept in one place; extend here, nowhere else.
pub const IMMUTABLE_TYPES: &[&str] = &[
    "String",
    "Boolean",
    "Byte",
    "Character",
    "Short",
    "Integer",
    "Long",
    "Float",
    "Double",
    "Void",
    "BigInteger",
    "BigDecimal",
    "Duration",
    "Instant",
    "LocalDate",
    "LocalDateTime",
    "Optional",
    "URI",
    "UUID",
    "Pattern",
];

/// Result of a must-call query.
///
/// `Top` is the unknown/any point of the lattice: an unannotated user type
/// may carry obligations we cannot enumerate. `Known` carries an exact set;
/// the empty set means no obligation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MustCall {
    Known(BTreeSet<String>),
    Top,
}

impl MustCall {
    #[must_use]
    pub fn empty() -> Self {
        MustCall::Known(BTreeSet::new())
    }

    /// The exact set, when the lattice point is known.
    #[must_use]
    pub fn as_known(&self) -> Option<&BTreeSet<String>> {
        match self {
            MustCall::Known(set) => Some(set),
            MustCall::Top => None,
        }
    }

    /// True only for a known, empty obligation set.
    #[must_use]
    pub fn is_known_empty(&self) -> bool {
        matches!(self, MustCall::Known(set) if set.is_empty())
    }

    /// The set the consistency analyzer can actually track: known and
    /// non-empty.
    #[must_use]
    pub fn trackable(&self) -> Option<&BTreeSet<String>> {
        self.as_known().filter(|set| !set.is_empty())
    }
}

/// A flattened `EnsuresCalledMethods` fact: one expression, one exit kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractFact {
    pub expression: String,
    pub methods: Vec<String>,
    pub exit: ExitKind,
}

/// A flattened `RequiresCalledMethods` fact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreconditionFact {
    pub expression: String,
    pub methods: Vec<String>,
}

/// Queries against one [`Program`]'s annotations, with a memo cache for the
/// must-call lattice. The supertype walk is iterative and cycle-guarded:
/// recursive queries into the hierarchy never re-enter the oracle.
pub struct AnnotationOracle<'p> {
    program: &'p Program,
    mcs_cache: RefCell<HashMap<String, MustCall>>,
}

impl<'p> AnnotationOracle<'p> {
    #[must_use]
    pub fn new(program: &'p Program) -> Self {
        Self {
            program,
            mcs_cache: RefCell::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn program(&self) -> &'p Program {
        self.program
    }

    /// The must-call set of a type: the most specific annotation in its
    /// hierarchy, the empty set for built-in immutable types, `Top` for
    /// user types with no annotation anywhere (and for unknown names).
    pub fn must_call_of(&self, type_name: &str) -> MustCall {
        if let Some(cached) = self.mcs_cache.borrow().get(type_name) {
            return cached.clone();
        }

        let result = self.resolve_must_call(type_name);
        self.mcs_cache
            .borrow_mut()
            .insert(type_name.to_string(), result.clone());
        result
    }

    fn resolve_must_call(&self, type_name: &str) -> MustCall {
        let simple = type_name.rsplit('.').next().unwrap_or(type_name);
        if IMMUTABLE_TYPES.contains(&simple) {
            return MustCall::empty();
        }

        let Some(decl) = self.program.find_type(type_name) else {
            return MustCall::Top;
        };
        if let Some(methods) = &decl.must_call {
            return MustCall::Known(methods.iter().cloned().collect());
        }
        for sup in self.program.supertypes(type_name) {
            if let Some(methods) = &sup.must_call {
                return MustCall::Known(methods.iter().cloned().collect());
            }
        }
        MustCall::Top
    }

    /// Whether an overrider-visible return keeps ownership with the callee.
    pub fn not_owning_return(&self, method: &MethodDecl) -> bool {
        method.not_owning_return
    }

    /// Whether a method hands its caller an obligation through its return:
    /// the return type has a trackable must-call set and the method is not
    /// marked not-owning.
    pub fn owning_return(&self, method: &MethodDecl) -> bool {
        if method.not_owning_return {
            return false;
        }
        method
            .return_ty
            .as_deref()
            .is_some_and(|ty| self.must_call_of(ty).trackable().is_some())
    }

    /// Flatten both the repeatable and the list-wrapper annotation forms
    /// into per-expression facts tagged by exit kind. The on-exception form
    /// cannot name which exception type it covers: the collaborator's CFG
    /// has a single exceptional exit per method.
    pub fn ensures_called_methods(&self, method: &MethodDecl) -> Vec<ContractFact> {
        let mut facts = Vec::new();
        for contract in &method.ensures_called {
            let exit = if contract.on_exception {
                ExitKind::ExceptionalExit
            } else {
                ExitKind::NormalReturn
            };
            for expression in &contract.expressions {
                facts.push(ContractFact {
                    expression: expression.clone(),
                    methods: contract.methods.clone(),
                    exit,
                });
            }
        }
        facts
    }

    /// Flatten precondition annotations into per-expression facts.
    pub fn requires_called_methods(&self, method: &MethodDecl) -> Vec<PreconditionFact> {
        let mut facts = Vec::new();
        for contract in &method.requires_called {
            for expression in &contract.expressions {
                facts.push(PreconditionFact {
                    expression: expression.clone(),
                    methods: contract.methods.clone(),
                });
            }
        }
        facts
    }

    /// Target expressions whose must-call set is reinstated at call sites.
    /// Empty when unannotated; the bare annotation defaults to the receiver.
    pub fn creates_must_call_for(&self, method: &MethodDecl) -> Vec<String> {
        match &method.creates_must_call {
            None => Vec::new(),
            Some(targets) if targets.is_empty() => vec!["this".to_string()],
            Some(targets) => targets.clone(),
        }
    }

    /// Field lookup through the supertype chain.
    fn field_type_of(&self, type_name: &str, field: &str) -> Option<String> {
        let decl = self.program.find_type(type_name)?;
        if let Some(f) = decl.find_field(field) {
            return Some(f.ty.clone());
        }
        for sup in self.program.supertypes(type_name) {
            if let Some(f) = sup.find_field(field) {
                return Some(f.ty.clone());
            }
        }
        None
    }

    /// Declared type of a creates-must-call target expression, resolved on
    /// the callee side (before viewpoint adaptation): the receiver, a
    /// parameter, or a one-level field path on either.
    pub fn cmcf_target_type(
        &self,
        owner: &TypeDecl,
        method: &MethodDecl,
        target: &str,
    ) -> Option<String> {
        let target = target.trim();
        if target == "this" {
            return Some(owner.name.clone());
        }

        let (head, path) = match target.split_once('.') {
            Some((h, p)) => (h, Some(p)),
            None => (target, None),
        };

        match (head, path) {
            ("this", Some(field)) => self.field_type_of(&owner.name, field),
            (param, tail) if method.params.iter().any(|p| p.name == param) => {
                let ty = method
                    .params
                    .iter()
                    .find(|p| p.name == param)
                    .map(|p| p.ty.clone());
                match (ty, tail) {
                    (Some(ty), None) => Some(ty),
                    (Some(ty), Some(field)) => self.field_type_of(&ty, field),
                    (None, _) => None,
                }
            }
            // A bare field name is an implicit receiver access.
            (field, None) => self.field_type_of(&owner.name, field),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FieldDecl, ParamDecl, TypeDecl};

    fn program() -> Program {
        Program::new(vec![
            TypeDecl::new("Sock").must_call(["close"]),
            TypeDecl::new("TlsSock").extends("Sock"),
            TypeDecl::new("Plain"),
            TypeDecl::new("Wide").must_call(["close", "flush"]),
            TypeDecl::new("Holder")
                .must_call(["release"])
                .field(FieldDecl::new("sock", "Sock").owning()),
            TypeDecl::new("SelfLink")
                .must_call(["close"])
                .field(FieldDecl::new("next", "SelfLink").owning()),
        ])
    }

    #[test]
    fn immutable_types_have_empty_must_call() {
        let p = program();
        let oracle = AnnotationOracle::new(&p);
        assert!(oracle.must_call_of("String").is_known_empty());
        assert!(oracle.must_call_of("java.lang.Integer").is_known_empty());
    }

    #[test]
    fn must_call_is_inherited_from_the_nearest_annotation() {
        let p = program();
        let oracle = AnnotationOracle::new(&p);
        let mcs = oracle.must_call_of("TlsSock");
        assert_eq!(
            mcs.as_known().cloned(),
            Some(BTreeSet::from(["close".to_string()]))
        );
    }

    #[test]
    fn unannotated_user_types_are_top() {
        let p = program();
        let oracle = AnnotationOracle::new(&p);
        assert_eq!(oracle.must_call_of("Plain"), MustCall::Top);
        assert_eq!(oracle.must_call_of("Unknown"), MustCall::Top);
        assert!(oracle.must_call_of("Plain").trackable().is_none());
    }

    #[test]
    fn must_call_queries_are_memoized() {
        let p = program();
        let oracle = AnnotationOracle::new(&p);
        let first = oracle.must_call_of("SelfLink");
        let second = oracle.must_call_of("SelfLink");
        assert_eq!(first, second);
        assert_eq!(oracle.mcs_cache.borrow().len(), 1);
    }

    #[test]
    fn ensures_flattening_splits_expressions_and_tags_exits() {
        let method = MethodDecl::new("shutdown")
            .ensures(["this.sock", "this.log"], ["close"])
            .ensures_on_exception(["this.sock"], ["close"]);
        let p = program();
        let oracle = AnnotationOracle::new(&p);
        let facts = oracle.ensures_called_methods(&method);
        assert_eq!(facts.len(), 3);
        assert_eq!(facts[0].expression, "this.sock");
        assert_eq!(facts[0].exit, ExitKind::NormalReturn);
        assert_eq!(facts[2].exit, ExitKind::ExceptionalExit);
    }

    #[test]
    fn creates_must_call_defaults_to_the_receiver() {
        let p = program();
        let oracle = AnnotationOracle::new(&p);

        let unannotated = MethodDecl::new("poke");
        assert!(oracle.creates_must_call_for(&unannotated).is_empty());

        let bare = MethodDecl::new("reset").creates_must_call(Vec::<String>::new());
        assert_eq!(oracle.creates_must_call_for(&bare), vec!["this"]);

        let explicit = MethodDecl::new("reopen").creates_must_call(["this.sock"]);
        assert_eq!(oracle.creates_must_call_for(&explicit), vec!["this.sock"]);
    }

    #[test]
    fn cmcf_target_types_resolve_through_receiver_params_and_fields() {
        let p = program();
        let oracle = AnnotationOracle::new(&p);
        let holder = p.find_type("Holder").unwrap();
        let method = MethodDecl::new("swap").param(ParamDecl::new("other", "Wide"));

        assert_eq!(
            oracle.cmcf_target_type(holder, &method, "this"),
            Some("Holder".to_string())
        );
        assert_eq!(
            oracle.cmcf_target_type(holder, &method, "other"),
            Some("Wide".to_string())
        );
        assert_eq!(
            oracle.cmcf_target_type(holder, &method, "this.sock"),
            Some("Sock".to_string())
        );
        assert_eq!(
            oracle.cmcf_target_type(holder, &method, "sock"),
            Some("Sock".to_string())
        );
        assert_eq!(oracle.cmcf_target_type(holder, &method, "mystery"), None);
    }

    #[test]
    fn owning_return_requires_a_trackable_type() {
        let p = program();
        let oracle = AnnotationOracle::new(&p);

        let owning = MethodDecl::new("open").returns("Sock");
        assert!(oracle.owning_return(&owning));

        let marked = MethodDecl::new("peek").returns("Sock").not_owning_return();
        assert!(!oracle.owning_return(&marked));

        let plain = MethodDecl::new("name").returns("String");
        assert!(!oracle.owning_return(&plain));

        let unknown = MethodDecl::new("grab").returns("Plain");
        assert!(!oracle.owning_return(&unknown));
    }
}
