//! Flow-sensitive must-call consistency analysis.
//!
//! One [`ConsistencyAnalyzer::analyze`] call covers one method or
//! constructor body: a forward worklist fixpoint over the collaborator's
//! CFG, tracking pending obligations per alias set across normal and
//! exceptional paths. The obligation lattice is finite (subsets of a finite
//! must-call set per creation site) and the transfer functions are
//! monotone, so the fixpoint is reached in finitely many steps.
//!
//! Each analysis is a pure function of (the CFG, the annotation oracle, the
//! called-methods collaborator, the configuration); it allocates its own
//! expression arena and alias sets and releases them once diagnostics are
//! out. On an internal invariant violation the whole per-method analysis is
//! discarded — partial results never escape.

use std::collections::{BTreeMap, BTreeSet};

use itertools::Itertools;

use crate::cfg::{
    BlockId, CalledMethodsOracle, Cfg, Instr, ProgramPoint, Terminator,
};
use crate::config::ChecksConfig;
use crate::diagnostics::{CheckSettings, Diagnostic, REQUIRED_METHOD_NOT_CALLED};
use crate::error::{Error, Result};
use crate::level::DiagnosticLevel;
use crate::model::{MethodDecl, ParamDecl, Program, TypeDecl};
use crate::obligation::{ExitKind, ExprArena, ExprId, Provenance, ResourceSet};
use crate::oracle::AnnotationOracle;

/// Bind callee-side contract expressions to call-site expressions: `this`
/// becomes the receiver, `#N` the N-th (1-based) argument, and parameter
/// names their arguments; one-level paths keep their tail.
pub(crate) fn adapt_expression(
    expression: &str,
    receiver: Option<&str>,
    params: &[ParamDecl],
    args: &[String],
) -> String {
    let e = expression.trim();
    if e == "this" {
        return receiver.unwrap_or(e).to_string();
    }
    if let Some(rest) = e.strip_prefix("this.") {
        return match receiver {
            Some(r) => format!("{r}.{rest}"),
            None => rest.to_string(),
        };
    }
    if let Some(rest) = e.strip_prefix('#')
        && let Ok(n) = rest.parse::<usize>()
        && n >= 1
        && n <= args.len()
    {
        return args[n - 1].clone();
    }
    let (head, tail) = match e.split_once('.') {
        Some((h, t)) => (h, Some(t)),
        None => (e, None),
    };
    if let Some(i) = params.iter().position(|p| p.name == head)
        && i < args.len()
    {
        return match tail {
            Some(t) => format!("{}.{}", args[i], t),
            None => args[i].clone(),
        };
    }
    e.to_string()
}

/// The abstract state at a program point: live alias sets, pairwise
/// disjoint in their members.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
struct State {
    sets: Vec<ResourceSet>,
}

impl State {
    fn find_member(&self, id: ExprId) -> Option<usize> {
        self.sets.iter().position(|s| s.members.contains(&id))
    }

    fn set_of(&self, id: ExprId) -> Option<&ResourceSet> {
        self.find_member(id).map(|i| &self.sets[i])
    }

    /// Two live sets never share a member.
    fn check_disjoint(&self) -> Result<()> {
        let mut seen: BTreeSet<ExprId> = BTreeSet::new();
        for set in &self.sets {
            for &id in &set.members {
                if !seen.insert(id) {
                    return Err(Error::internal(format!(
                        "alias sets share member #{id}"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Drop owning sets whose obligations are fully discharged; they have
    /// left scope and must not resurface at joins.
    fn sweep_discharged(&mut self) {
        self.sets.retain(|s| !(s.owning && s.is_discharged()));
    }

    /// Canonical set order, so fixpoint detection is order-insensitive.
    fn normalize(mut self) -> Self {
        self.sets
            .sort_by_key(|s| (s.members.iter().next().copied(), s.origin));
        self
    }
}

fn sets_overlap(a: &ResourceSet, b: &ResourceSet) -> bool {
    a.members.intersection(&b.members).next().is_some()
}

/// Join two predecessor states. Sets are matched transitively by member
/// overlap; matches merge with union members and intersected called sets
/// (pending obligations take the union). A set present on only one
/// predecessor rejoins with full obligations.
fn join(a: &State, b: &State) -> State {
    let items: Vec<(bool, &ResourceSet)> = a
        .sets
        .iter()
        .map(|s| (true, s))
        .chain(b.sets.iter().map(|s| (false, s)))
        .collect();

    let n = items.len();
    let mut parent: Vec<usize> = (0..n).collect();
    fn root(parent: &mut [usize], mut i: usize) -> usize {
        while parent[i] != i {
            parent[i] = parent[parent[i]];
            i = parent[i];
        }
        i
    }
    for i in 0..n {
        for j in (i + 1)..n {
            if sets_overlap(items[i].1, items[j].1) {
                let (ri, rj) = (root(&mut parent, i), root(&mut parent, j));
                if ri != rj {
                    parent[ri.max(rj)] = ri.min(rj);
                }
            }
        }
    }

    let mut groups: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for i in 0..n {
        let r = root(&mut parent, i);
        groups.entry(r).or_default().push(i);
    }

    let mut result = State::default();
    for members_of_group in groups.values() {
        let group: Vec<&(bool, &ResourceSet)> =
            members_of_group.iter().map(|&i| &items[i]).collect();
        let on_both = group.iter().any(|(from_a, _)| *from_a)
            && group.iter().any(|(from_a, _)| !*from_a);

        let mut merged = group[0].1.clone();
        for (_, set) in group.iter().skip(1) {
            merged.members.extend(set.members.iter().copied());
            merged.must_call.extend(set.must_call.iter().cloned());
            merged.owning |= set.owning;
            merged.origin = merged.origin.min(set.origin);
        }
        merged.called = if on_both {
            group
                .iter()
                .map(|(_, set)| set.called.clone())
                .reduce(|acc, c| acc.intersection(&c).cloned().collect())
                .unwrap_or_default()
        } else {
            BTreeSet::new()
        };
        result.sets.push(merged);
    }
    result.normalize()
}

/// Deduplicating collector for leak findings. Re-visits during the fixpoint
/// overwrite earlier records for the same site, so the report reflects the
/// final state.
struct LeakSink {
    records: BTreeMap<(ProgramPoint, String), String>,
}

impl LeakSink {
    fn new() -> Self {
        Self {
            records: BTreeMap::new(),
        }
    }

    fn record(&mut self, point: ProgramPoint, token: String, text: String) {
        self.records.insert((point, token), text);
    }

    fn finish(self, element: &str, settings: &CheckSettings) -> Vec<Diagnostic> {
        let level = settings.level_for(REQUIRED_METHOD_NOT_CALLED.key);
        if level == DiagnosticLevel::Allow {
            return Vec::new();
        }
        self.records
            .into_iter()
            .map(|((point, _), text)| Diagnostic {
                message: &REQUIRED_METHOD_NOT_CALLED,
                level,
                element: element.to_string(),
                point: Some(point),
                text,
                help: None,
            })
            .collect()
    }
}

struct Ctx<'a> {
    owner: &'a TypeDecl,
    method: &'a MethodDecl,
    cfg: &'a Cfg,
}

/// Per-method consistency analyzer.
pub struct ConsistencyAnalyzer<'p> {
    program: &'p Program,
    oracle: AnnotationOracle<'p>,
    config: &'p ChecksConfig,
    settings: &'p CheckSettings,
    called_methods: &'p dyn CalledMethodsOracle,
}

impl<'p> ConsistencyAnalyzer<'p> {
    #[must_use]
    pub fn new(
        program: &'p Program,
        config: &'p ChecksConfig,
        settings: &'p CheckSettings,
        called_methods: &'p dyn CalledMethodsOracle,
    ) -> Self {
        Self {
            program,
            oracle: AnnotationOracle::new(program),
            config,
            settings,
            called_methods,
        }
    }

    /// Analyze one body and report every distinct leak.
    pub fn analyze(&self, owner: &TypeDecl, method: &MethodDecl) -> Result<Vec<Diagnostic>> {
        let Some(cfg) = &method.body else {
            return Ok(Vec::new());
        };
        let element = method.element_path(&owner.name);
        cfg.validate(&element)?;

        #[cfg(feature = "telemetry")]
        tracing::debug!(target: "leakcheck", method = %element, blocks = cfg.blocks.len(), "analyzing body");

        let ctx = Ctx { owner, method, cfg };
        let mut arena = ExprArena::new();
        let mut sink = LeakSink::new();

        let mut init = State::default();
        for param in &method.params {
            if let Some(mcs) = self.oracle.must_call_of(&param.ty).trackable() {
                let id = arena.intern(&param.name);
                init.sets.push(ResourceSet::new(
                    id,
                    mcs.clone(),
                    param.owning,
                    Provenance::Parameter,
                    ProgramPoint::new(cfg.entry, 0),
                ));
            }
        }

        let mut inputs: Vec<Option<State>> = vec![None; cfg.blocks.len()];
        inputs[cfg.entry] = Some(init.normalize());
        let mut worklist: BTreeSet<BlockId> = BTreeSet::from([cfg.entry]);
        let mut fuel: usize = 4096 * cfg.blocks.len().max(1);

        while let Some(bb) = worklist.pop_first() {
            if bb == cfg.normal_exit || bb == cfg.exceptional_exit {
                continue;
            }
            fuel = fuel.checked_sub(1).ok_or_else(|| {
                Error::internal(format!("fixpoint did not converge for `{element}`"))
            })?;

            let Some(mut state) = inputs[bb].clone() else {
                continue;
            };
            let block = &cfg.blocks[bb];
            let mut edges: Vec<(BlockId, State)> = Vec::new();

            for (index, instr) in block.instrs.iter().enumerate() {
                let point = ProgramPoint::new(bb, index);
                self.transfer(&ctx, instr, point, &mut state, &mut arena, &mut edges, &mut sink)?;
            }

            let term_point = ProgramPoint::new(bb, block.instrs.len());
            match &block.term {
                Terminator::Goto(target) => edges.push((*target, state)),
                Terminator::Branch {
                    then_block,
                    else_block,
                } => {
                    edges.push((*then_block, state.clone()));
                    edges.push((*else_block, state));
                }
                Terminator::Return { value } => {
                    let mut out = state;
                    if let Some(v) = value
                        && self.oracle.owning_return(method)
                    {
                        let vid = arena.intern(v);
                        if let Some(i) = out.find_member(vid) {
                            out.sets.remove(i);
                        }
                    }
                    edges.push((cfg.normal_exit, out));
                }
                Terminator::Throw { exception, handler } => {
                    if self.config.is_ignored_exception(exception) {
                        // Unrecoverable fault: its edge is excused for
                        // downstream callers, but the state right here still
                        // has to be clean.
                        self.check_leaks_at(
                            &state,
                            term_point,
                            ExitKind::ExceptionalExit,
                            &arena,
                            &mut sink,
                        );
                    } else {
                        edges.push(((*handler).unwrap_or(cfg.exceptional_exit), state));
                    }
                }
                Terminator::Exit => {}
            }

            for (target, incoming) in edges {
                self.merge_into(&mut inputs, &mut worklist, target, incoming)?;
            }
        }

        if let Some(state) = &inputs[cfg.normal_exit] {
            self.check_exit(&ctx, state, ExitKind::NormalReturn, &arena, &mut sink);
        }
        if let Some(state) = &inputs[cfg.exceptional_exit] {
            self.check_exit(&ctx, state, ExitKind::ExceptionalExit, &arena, &mut sink);
        }

        Ok(sink.finish(&element, self.settings))
    }

    fn merge_into(
        &self,
        inputs: &mut [Option<State>],
        worklist: &mut BTreeSet<BlockId>,
        target: BlockId,
        incoming: State,
    ) -> Result<()> {
        incoming.check_disjoint()?;
        match &mut inputs[target] {
            slot @ None => {
                *slot = Some(incoming.normalize());
                worklist.insert(target);
            }
            Some(existing) => {
                let joined = join(existing, &incoming);
                if joined != *existing {
                    *existing = joined;
                    worklist.insert(target);
                }
            }
        }
        Ok(())
    }

    /// Any exceptional edge whose exception type is not on the ignored list
    /// escapes to the handler (or the method's exceptional exit).
    fn thrown_escapes(&self, thrown: &[String]) -> bool {
        thrown
            .iter()
            .any(|e| !self.config.is_ignored_exception(e))
    }

    fn transfer(
        &self,
        ctx: &Ctx<'_>,
        instr: &Instr,
        point: ProgramPoint,
        state: &mut State,
        arena: &mut ExprArena,
        edges: &mut Vec<(BlockId, State)>,
        sink: &mut LeakSink,
    ) -> Result<()> {
        match instr {
            Instr::Copy { lhs, rhs } => {
                let rhs_id = arena.intern(rhs);
                let lhs_id = arena.intern(lhs);
                if lhs_id == rhs_id {
                    return Ok(());
                }
                self.remove_alias(state, lhs_id, point, arena, sink);
                if let Some(i) = state.find_member(rhs_id) {
                    state.sets[i].members.insert(lhs_id);
                }
            }
            Instr::Opaque { lhs } => {
                let lhs_id = arena.intern(lhs);
                self.remove_alias(state, lhs_id, point, arena, sink);
            }
            Instr::Alloc {
                lhs,
                ty,
                thrown,
                handler,
            } => {
                // On the exceptional edge the object was never born.
                if self.thrown_escapes(thrown) {
                    let target = (*handler).unwrap_or(ctx.cfg.exceptional_exit);
                    edges.push((target, state.clone()));
                }
                let lhs_id = arena.intern(lhs);
                self.remove_alias(state, lhs_id, point, arena, sink);
                if !self.config.no_lightweight_ownership
                    && let Some(mcs) = self.oracle.must_call_of(ty).trackable()
                {
                    state.sets.push(ResourceSet::new(
                        lhs_id,
                        mcs.clone(),
                        true,
                        Provenance::Allocation,
                        point,
                    ));
                }
            }
            Instr::Call {
                lhs,
                receiver,
                owner,
                method,
                args,
                thrown,
                handler,
            } => {
                self.transfer_call(
                    ctx, point, state, arena, edges, sink, lhs.as_deref(),
                    receiver.as_deref(), owner.as_deref(), method, args, thrown, *handler,
                );
            }
        }
        state.sweep_discharged();
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn transfer_call(
        &self,
        ctx: &Ctx<'_>,
        point: ProgramPoint,
        state: &mut State,
        arena: &mut ExprArena,
        edges: &mut Vec<(BlockId, State)>,
        sink: &mut LeakSink,
        lhs: Option<&str>,
        receiver: Option<&str>,
        owner: Option<&str>,
        method: &str,
        args: &[String],
        thrown: &[String],
        handler: Option<BlockId>,
    ) {
        let decl = owner.and_then(|o| self.program.resolve_method(o, method, args.len()));

        // Preconditions are judged against the state before the call.
        if let Some((_, d)) = decl {
            for fact in self.oracle.requires_called_methods(d) {
                let target = adapt_expression(&fact.expression, receiver, &d.params, args);
                let target_id = arena.intern(&target);
                let mut already = state.set_of(target_id).map(|s| s.called.clone());
                if let Some(extra) = self.called_methods.called_methods_at(point, &target) {
                    already.get_or_insert_with(BTreeSet::new).extend(extra);
                }
                // An expression neither we nor the collaborator track is
                // trusted; the tracked path is checked exactly.
                if let Some(already) = already {
                    let missing: Vec<&String> = fact
                        .methods
                        .iter()
                        .filter(|m| !already.contains(*m))
                        .collect();
                    if !missing.is_empty() {
                        sink.record(
                            point,
                            format!("requires:{target}:{method}"),
                            format!(
                                "cannot call `{method}`: {} must already have been called on `{target}`",
                                missing.iter().map(|m| format!("`{m}`")).join(", ")
                            ),
                        );
                    }
                }
            }
        }

        // Exceptional continuation: the call may never have completed, so
        // ownership of owning arguments stays with the caller and only the
        // on-exception postconditions apply.
        if self.thrown_escapes(thrown) {
            let mut exc = state.clone();
            if let Some((_, d)) = decl {
                for fact in self.oracle.ensures_called_methods(d) {
                    if fact.exit == ExitKind::ExceptionalExit {
                        let adapted = adapt_expression(&fact.expression, receiver, &d.params, args);
                        let id = arena.intern(&adapted);
                        if let Some(i) = exc.find_member(id) {
                            exc.sets[i].called.extend(fact.methods.iter().cloned());
                        }
                    }
                }
                exc.sweep_discharged();
            }
            edges.push((handler.unwrap_or(ctx.cfg.exceptional_exit), exc));
        }

        // Normal continuation: the invoked method counts as called here.
        if let Some(r) = receiver {
            let rid = arena.intern(r);
            if let Some(i) = state.find_member(rid) {
                state.sets[i].called.insert(method.to_string());
            }
        }

        if let Some((decl_owner, d)) = decl {
            for fact in self.oracle.ensures_called_methods(d) {
                if fact.exit == ExitKind::NormalReturn {
                    let adapted = adapt_expression(&fact.expression, receiver, &d.params, args);
                    let id = arena.intern(&adapted);
                    if let Some(i) = state.find_member(id) {
                        state.sets[i].called.extend(fact.methods.iter().cloned());
                    }
                }
            }

            // Ownership of owning arguments transfers on the normal edge.
            for (i, param) in d.params.iter().enumerate() {
                if param.owning
                    && let Some(arg) = args.get(i)
                {
                    let aid = arena.intern(arg);
                    if let Some(si) = state.find_member(aid) {
                        state.sets.remove(si);
                    }
                }
            }

            // Reinstate obligations on creates-must-call targets.
            for target in self.oracle.creates_must_call_for(d) {
                let adapted = adapt_expression(&target, receiver, &d.params, args);
                let tid = arena.intern(&adapted);
                if let Some(si) = state.find_member(tid) {
                    state.sets[si].called.clear();
                    state.sets[si].owning = true;
                } else if let Some(ty) = self.oracle.cmcf_target_type(decl_owner, d, &target)
                    && let Some(mcs) = self.oracle.must_call_of(&ty).trackable()
                {
                    let provenance = if adapted.contains('.') {
                        Provenance::FieldRead
                    } else {
                        Provenance::MethodResult
                    };
                    state.sets.push(ResourceSet::new(
                        tid,
                        mcs.clone(),
                        true,
                        provenance,
                        point,
                    ));
                }
            }
        }

        if let Some(l) = lhs {
            let lid = arena.intern(l);
            self.remove_alias(state, lid, point, arena, sink);
            if !self.config.no_lightweight_ownership
                && let Some((_, d)) = decl
                && !d.not_owning_return
                && let Some(ret_ty) = d.return_ty.as_deref()
                && let Some(mcs) = self.oracle.must_call_of(ret_ty).trackable()
            {
                state.sets.push(ResourceSet::new(
                    lid,
                    mcs.clone(),
                    true,
                    Provenance::MethodResult,
                    point,
                ));
            }
        }
    }

    /// Drop one alias; losing the last alias of an owning, undischarged set
    /// is a leak at this point.
    fn remove_alias(
        &self,
        state: &mut State,
        id: ExprId,
        point: ProgramPoint,
        arena: &ExprArena,
        sink: &mut LeakSink,
    ) {
        let Some(i) = state.find_member(id) else {
            return;
        };
        state.sets[i].members.remove(&id);
        if state.sets[i].members.is_empty() {
            let set = state.sets.remove(i);
            if set.owning && !set.is_discharged() {
                let name = arena.resolve(id);
                sink.record(
                    point,
                    format!("overwrite:{name}"),
                    format!(
                        "the last alias of `{name}` is overwritten before {} called",
                        set.pending().iter().map(|m| format!("`{m}`")).join(", ")
                    ),
                );
            }
        }
    }

    /// Leak check for the state at an explicit throw of an ignored
    /// exception type; reported at the throw site.
    fn check_leaks_at(
        &self,
        state: &State,
        point: ProgramPoint,
        exit: ExitKind,
        arena: &ExprArena,
        sink: &mut LeakSink,
    ) {
        for set in &state.sets {
            if !set.owning || set.is_discharged() {
                continue;
            }
            let name = set.representative(arena).to_string();
            sink.record(
                point,
                format!("throw:{name}"),
                format!(
                    "`{name}` ({}) may leak on this {}: {} never called",
                    set.provenance.as_str(),
                    exit.as_str(),
                    set.pending().iter().map(|m| format!("`{m}`")).join(", ")
                ),
            );
        }
    }

    /// Leak check at one of the two exit blocks.
    fn check_exit(
        &self,
        ctx: &Ctx<'_>,
        state: &State,
        exit: ExitKind,
        arena: &ExprArena,
        sink: &mut LeakSink,
    ) {
        let owning_field_ids: BTreeSet<ExprId> = ctx
            .owner
            .owning_fields()
            .filter_map(|f| arena.get(&f.name))
            .collect();

        for set in &state.sets {
            if !set.owning {
                continue;
            }
            let pending = set.pending();
            if pending.is_empty() {
                continue;
            }
            let stored_in_owning_field = set
                .members
                .intersection(&owning_field_ids)
                .next()
                .is_some();
            let excused = match exit {
                // Stored into an owning field of `this`: the enclosing type
                // takes over (its coverage is a declaration-check concern).
                ExitKind::NormalReturn => stored_in_owning_field,
                // A constructor that exits exceptionally never hands the
                // receiver to the caller; its field stores are lost.
                ExitKind::ExceptionalExit => {
                    stored_in_owning_field && !ctx.method.is_constructor
                }
            };
            if excused {
                continue;
            }
            let obligations = set
                .obligations(arena, exit)
                .iter()
                .map(|o| format!("`{o}`"))
                .join(", ");
            sink.record(
                set.origin,
                format!("exit:{}:{}", exit.as_str(), set.representative(arena)),
                format!(
                    "`{}` ({}) may leak: missing {obligations}",
                    set.representative(arena),
                    set.provenance.as_str()
                ),
            );
        }
    }
}
