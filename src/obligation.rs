//! Value types for the must-call consistency analysis.
//!
//! Nothing here has behavior beyond equality, hashing, and the pending-set
//! arithmetic on [`ResourceSet`]; the transfer functions live in
//! [`crate::consistency`].

use std::collections::{BTreeSet, HashMap};

use crate::cfg::ProgramPoint;

/// Discriminator for the two ways a method can leave its body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ExitKind {
    NormalReturn,
    ExceptionalExit,
}

impl ExitKind {
    pub const ALL: [ExitKind; 2] = [ExitKind::NormalReturn, ExitKind::ExceptionalExit];

    pub fn as_str(&self) -> &'static str {
        match self {
            ExitKind::NormalReturn => "normal return",
            ExitKind::ExceptionalExit => "exceptional exit",
        }
    }
}

/// Canonical form of an expression string: trimmed, with an explicit
/// receiver prefix stripped so `this.f` and `f` denote the same location.
#[must_use]
pub fn canonicalize(expression: &str) -> String {
    let trimmed = expression.trim();
    if trimmed == "this" {
        return trimmed.to_string();
    }
    trimmed
        .strip_prefix("this.")
        .unwrap_or(trimmed)
        .to_string()
}

/// Index of an interned canonical expression.
pub type ExprId = u32;

/// Per-method expression interner. Alias-set membership is kept as indices
/// into one of these, built once per analyzed body.
#[derive(Debug, Default)]
pub struct ExprArena {
    exprs: Vec<String>,
    index: HashMap<String, ExprId>,
}

impl ExprArena {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Canonicalize and intern, returning a stable index.
    pub fn intern(&mut self, expression: &str) -> ExprId {
        let canonical = canonicalize(expression);
        if let Some(&id) = self.index.get(&canonical) {
            return id;
        }
        let id = self.exprs.len() as ExprId;
        self.exprs.push(canonical.clone());
        self.index.insert(canonical, id);
        id
    }

    /// Look up without interning.
    #[must_use]
    pub fn get(&self, expression: &str) -> Option<ExprId> {
        self.index.get(&canonicalize(expression)).copied()
    }

    #[must_use]
    pub fn resolve(&self, id: ExprId) -> &str {
        &self.exprs[id as usize]
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.exprs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.exprs.is_empty()
    }
}

/// A pending must-call fact: on paths leaving with `exit`, `method` must
/// have been invoked on `expression` first. Equality is structural; the
/// expression is stored canonicalized.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Obligation {
    pub expression: String,
    pub method: String,
    pub exit: ExitKind,
}

impl Obligation {
    #[must_use]
    pub fn new(expression: &str, method: impl Into<String>, exit: ExitKind) -> Self {
        Self {
            expression: canonicalize(expression),
            method: method.into(),
            exit,
        }
    }
}

impl std::fmt::Display for Obligation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}.{} on {}",
            self.expression,
            self.method,
            self.exit.as_str()
        )
    }
}

/// Where a tracked resource came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Provenance {
    Parameter,
    Allocation,
    FieldRead,
    MethodResult,
}

impl Provenance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provenance::Parameter => "parameter",
            Provenance::Allocation => "allocation",
            Provenance::FieldRead => "field read",
            Provenance::MethodResult => "method result",
        }
    }
}

/// An alias set: expressions known to refer to the same underlying
/// resource, with the bookkeeping the consistency analyzer needs.
///
/// Two live sets never share a member; merging on assignment unions
/// members and the analyzer keeps `called` per set, so the pending
/// obligations are always `must_call − called`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceSet {
    pub members: BTreeSet<ExprId>,
    pub must_call: BTreeSet<String>,
    pub called: BTreeSet<String>,
    pub provenance: Provenance,
    /// True when this procedure is responsible for the discharge.
    pub owning: bool,
    /// Where the set was born; leak diagnostics anchor here.
    pub origin: ProgramPoint,
}

impl ResourceSet {
    #[must_use]
    pub fn new(
        member: ExprId,
        must_call: BTreeSet<String>,
        owning: bool,
        provenance: Provenance,
        origin: ProgramPoint,
    ) -> Self {
        Self {
            members: BTreeSet::from([member]),
            must_call,
            called: BTreeSet::new(),
            provenance,
            owning,
            origin,
        }
    }

    /// Methods still owed on this resource.
    #[must_use]
    pub fn pending(&self) -> BTreeSet<String> {
        self.must_call.difference(&self.called).cloned().collect()
    }

    #[must_use]
    pub fn is_discharged(&self) -> bool {
        self.must_call.iter().all(|m| self.called.contains(m))
    }

    /// The member used to describe this set in diagnostics: the first
    /// interned alias, which is the earliest expression bound to it.
    #[must_use]
    pub fn representative<'a>(&self, arena: &'a ExprArena) -> &'a str {
        self.members
            .iter()
            .next()
            .map(|&id| arena.resolve(id))
            .unwrap_or("<unknown>")
    }

    /// The pending facts as obligation triples for one exit kind.
    #[must_use]
    pub fn obligations(&self, arena: &ExprArena, exit: ExitKind) -> Vec<Obligation> {
        let repr = self.representative(arena);
        self.pending()
            .into_iter()
            .map(|m| Obligation::new(repr, m, exit))
            .collect()
    }
}
