//! Program model consumed by the checker.
//!
//! The front end (parser + symbol resolver, external to this crate) lowers a
//! compilation unit into this representation: type declarations with their
//! ownership annotations attached as plain data, and per-method control-flow
//! graphs built with [`crate::cfg::CfgBuilder`]. Annotation payloads keep
//! their source shape (expression *lists*); flattening and defaulting is the
//! job of [`crate::oracle::AnnotationOracle`].

use crate::cfg::Cfg;

/// A compilation unit: the set of type declarations visible to the checker.
#[derive(Debug, Default)]
pub struct Program {
    pub types: Vec<TypeDecl>,
}

impl Program {
    #[must_use]
    pub fn new(types: Vec<TypeDecl>) -> Self {
        Self { types }
    }

    pub fn find_type(&self, name: &str) -> Option<&TypeDecl> {
        self.types.iter().find(|t| t.name == name)
    }

    /// The proper supertype chain of `name`, nearest first.
    ///
    /// Stops at the first cycle or unknown supertype rather than recursing.
    pub fn supertypes(&self, name: &str) -> Vec<&TypeDecl> {
        let mut chain = Vec::new();
        let mut seen = vec![name.to_string()];
        let mut cur = self.find_type(name).and_then(|t| t.extends.as_deref());
        while let Some(super_name) = cur {
            if seen.iter().any(|s| s == super_name) {
                break;
            }
            let Some(decl) = self.find_type(super_name) else {
                break;
            };
            seen.push(super_name.to_string());
            chain.push(decl);
            cur = decl.extends.as_deref();
        }
        chain
    }

    /// Resolve `method` with `arity` parameters on `owner` or its supertypes.
    ///
    /// Returns the declaring type together with the declaration. Constructors
    /// are never inherited.
    pub fn resolve_method(
        &self,
        owner: &str,
        method: &str,
        arity: usize,
    ) -> Option<(&TypeDecl, &MethodDecl)> {
        let decl = self.find_type(owner)?;
        if let Some(m) = decl.find_method(method, arity) {
            return Some((decl, m));
        }
        for sup in self.supertypes(owner) {
            if let Some(m) = sup.find_method(method, arity)
                && !m.is_constructor
            {
                return Some((sup, m));
            }
        }
        None
    }
}

/// A class-like type declaration.
#[derive(Debug, Default)]
pub struct TypeDecl {
    pub name: String,
    /// Declared must-call annotation. `None` means unannotated; `Some(vec![])`
    /// is an explicit empty obligation.
    pub must_call: Option<Vec<String>>,
    pub extends: Option<String>,
    pub fields: Vec<FieldDecl>,
    pub methods: Vec<MethodDecl>,
}

impl TypeDecl {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn must_call<I, S>(mut self, methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.must_call = Some(methods.into_iter().map(Into::into).collect());
        self
    }

    #[must_use]
    pub fn extends(mut self, super_name: impl Into<String>) -> Self {
        self.extends = Some(super_name.into());
        self
    }

    #[must_use]
    pub fn field(mut self, field: FieldDecl) -> Self {
        self.fields.push(field);
        self
    }

    #[must_use]
    pub fn method(mut self, method: MethodDecl) -> Self {
        self.methods.push(method);
        self
    }

    pub fn find_field(&self, name: &str) -> Option<&FieldDecl> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn find_method(&self, name: &str, arity: usize) -> Option<&MethodDecl> {
        self.methods
            .iter()
            .find(|m| m.name == name && m.params.len() == arity)
    }

    /// Fields this type is responsible for releasing.
    pub fn owning_fields(&self) -> impl Iterator<Item = &FieldDecl> {
        self.fields.iter().filter(|f| f.owning)
    }
}

/// A field declaration with its ownership marks.
#[derive(Debug, Default)]
pub struct FieldDecl {
    pub name: String,
    pub ty: String,
    pub owning: bool,
    pub is_static: bool,
    pub is_final: bool,
}

impl FieldDecl {
    #[must_use]
    pub fn new(name: impl Into<String>, ty: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ty: ty.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn owning(mut self) -> Self {
        self.owning = true;
        self
    }

    #[must_use]
    pub fn static_final(mut self) -> Self {
        self.is_static = true;
        self.is_final = true;
        self
    }

    #[must_use]
    pub fn static_mut(mut self) -> Self {
        self.is_static = true;
        self.is_final = false;
        self
    }
}

/// A formal parameter with its ownership mark.
#[derive(Debug, Default, Clone)]
pub struct ParamDecl {
    pub name: String,
    pub ty: String,
    pub owning: bool,
}

impl ParamDecl {
    #[must_use]
    pub fn new(name: impl Into<String>, ty: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ty: ty.into(),
            owning: false,
        }
    }

    #[must_use]
    pub fn owning(mut self) -> Self {
        self.owning = true;
        self
    }
}

/// Raw `EnsuresCalledMethods` payload: one annotation instance, possibly
/// naming several target expressions.
#[derive(Debug, Clone)]
pub struct EnsuresCalledMethods {
    pub expressions: Vec<String>,
    pub methods: Vec<String>,
    /// True for the on-exception form of the annotation.
    pub on_exception: bool,
}

/// Raw `RequiresCalledMethods` payload.
#[derive(Debug, Clone)]
pub struct RequiresCalledMethods {
    pub expressions: Vec<String>,
    pub methods: Vec<String>,
}

/// A method or constructor declaration.
#[derive(Debug, Default)]
pub struct MethodDecl {
    pub name: String,
    pub params: Vec<ParamDecl>,
    pub return_ty: Option<String>,
    /// True when the return value stays owned by the callee's receiver.
    pub not_owning_return: bool,
    pub is_constructor: bool,
    pub is_static: bool,
    pub ensures_called: Vec<EnsuresCalledMethods>,
    pub requires_called: Vec<RequiresCalledMethods>,
    /// `None` = unannotated. `Some(vec![])` is the bare annotation, which the
    /// oracle defaults to the receiver.
    pub creates_must_call: Option<Vec<String>>,
    pub body: Option<Cfg>,
}

impl MethodDecl {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn constructor(ty: impl Into<String>) -> Self {
        let ty = ty.into();
        Self {
            name: format!("<init:{ty}>"),
            return_ty: Some(ty),
            is_constructor: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn param(mut self, param: ParamDecl) -> Self {
        self.params.push(param);
        self
    }

    #[must_use]
    pub fn returns(mut self, ty: impl Into<String>) -> Self {
        self.return_ty = Some(ty.into());
        self
    }

    #[must_use]
    pub fn not_owning_return(mut self) -> Self {
        self.not_owning_return = true;
        self
    }

    #[must_use]
    pub fn ensures(
        mut self,
        expressions: impl IntoIterator<Item = impl Into<String>>,
        methods: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.ensures_called.push(EnsuresCalledMethods {
            expressions: expressions.into_iter().map(Into::into).collect(),
            methods: methods.into_iter().map(Into::into).collect(),
            on_exception: false,
        });
        self
    }

    #[must_use]
    pub fn ensures_on_exception(
        mut self,
        expressions: impl IntoIterator<Item = impl Into<String>>,
        methods: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.ensures_called.push(EnsuresCalledMethods {
            expressions: expressions.into_iter().map(Into::into).collect(),
            methods: methods.into_iter().map(Into::into).collect(),
            on_exception: true,
        });
        self
    }

    #[must_use]
    pub fn requires(
        mut self,
        expressions: impl IntoIterator<Item = impl Into<String>>,
        methods: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.requires_called.push(RequiresCalledMethods {
            expressions: expressions.into_iter().map(Into::into).collect(),
            methods: methods.into_iter().map(Into::into).collect(),
        });
        self
    }

    #[must_use]
    pub fn creates_must_call(
        mut self,
        targets: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.creates_must_call = Some(targets.into_iter().map(Into::into).collect());
        self
    }

    #[must_use]
    pub fn body(mut self, cfg: Cfg) -> Self {
        self.body = Some(cfg);
        self
    }

    /// `Owner.name`, the element path used in diagnostics.
    pub fn element_path(&self, owner: &str) -> String {
        format!("{owner}.{}", self.name)
    }
}
