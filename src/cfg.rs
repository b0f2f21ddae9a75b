//! Control-flow graph input model.
//!
//! The dataflow collaborator lowers each method body into a [`Cfg`]:
//! straight-line blocks of instructions, a terminator per block, and three
//! distinguished blocks — entry, normal exit, and a *single* exceptional
//! exit aggregating all uncaught throws. Because there is one exceptional
//! exit per method, the analysis cannot distinguish which exception type
//! caused an exit once control reaches it; per-edge exception types exist
//! only where the edge originates (calls and explicit throws).
//!
//! Expressions are plain strings; the analyzer canonicalizes and interns
//! them per method (see [`crate::obligation`]).

use std::collections::BTreeSet;

use serde::Serialize;

use crate::error::{Error, Result};

pub type BlockId = usize;

/// A (block, instruction) coordinate inside one method's graph.
///
/// The index one past the last instruction addresses the terminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ProgramPoint {
    pub block: BlockId,
    pub index: usize,
}

impl ProgramPoint {
    #[must_use]
    pub fn new(block: BlockId, index: usize) -> Self {
        Self { block, index }
    }
}

impl std::fmt::Display for ProgramPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "bb{}:{}", self.block, self.index)
    }
}

/// One straight-line instruction.
#[derive(Debug, Clone)]
pub enum Instr {
    /// `lhs = rhs` where `rhs` is an existing expression: the two become
    /// aliases of the same underlying value.
    Copy { lhs: String, rhs: String },
    /// `lhs = new ty(...)`, a constructor invocation.
    Alloc {
        lhs: String,
        ty: String,
        /// Exception types the constructor may raise.
        thrown: Vec<String>,
        /// In-method catch target; `None` routes to the exceptional exit.
        handler: Option<BlockId>,
    },
    /// `[lhs =] receiver.method(args)` or `[lhs =] Owner.method(args)`.
    Call {
        lhs: Option<String>,
        /// Receiver expression; `None` for static calls.
        receiver: Option<String>,
        /// Static type declaring the callee, as resolved by the front end.
        /// `None` means the callee could not be resolved and the call is
        /// treated as opaque (no contracts, no ownership effects).
        owner: Option<String>,
        method: String,
        args: Vec<String>,
        /// Exception types the call may raise. Empty means the front end
        /// proved the call cannot throw.
        thrown: Vec<String>,
        handler: Option<BlockId>,
    },
    /// `lhs = <expression the analyzer does not model>`.
    Opaque { lhs: String },
}

/// Block terminator.
#[derive(Debug, Clone)]
pub enum Terminator {
    Goto(BlockId),
    /// Two-way branch; the condition is opaque to this analysis.
    Branch { then_block: BlockId, else_block: BlockId },
    Return { value: Option<String> },
    Throw {
        exception: String,
        handler: Option<BlockId>,
    },
    /// Used only by the two exit blocks.
    Exit,
}

#[derive(Debug, Clone, Default)]
pub struct Block {
    pub instrs: Vec<Instr>,
    pub term: Terminator,
}

impl Default for Terminator {
    fn default() -> Self {
        Terminator::Exit
    }
}

/// One method body's control-flow graph.
#[derive(Debug, Clone)]
pub struct Cfg {
    pub blocks: Vec<Block>,
    pub entry: BlockId,
    pub normal_exit: BlockId,
    pub exceptional_exit: BlockId,
}

impl Cfg {
    /// Structural validation; the analyzer fails fast on a malformed graph.
    pub fn validate(&self, method: &str) -> Result<()> {
        let bad = |message: String| Error::invalid_cfg(method, message);
        let in_range = |b: BlockId| b < self.blocks.len();

        if !in_range(self.entry) || !in_range(self.normal_exit) || !in_range(self.exceptional_exit)
        {
            return Err(bad("distinguished block out of range".to_string()));
        }
        if self.entry == self.normal_exit || self.entry == self.exceptional_exit {
            return Err(bad("entry block doubles as an exit block".to_string()));
        }

        for (id, block) in self.blocks.iter().enumerate() {
            let is_exit = id == self.normal_exit || id == self.exceptional_exit;
            if is_exit {
                if !block.instrs.is_empty() || !matches!(block.term, Terminator::Exit) {
                    return Err(bad(format!("exit block bb{id} must be empty")));
                }
                continue;
            }
            if matches!(block.term, Terminator::Exit) {
                return Err(bad(format!("bb{id} is unterminated")));
            }

            for instr in &block.instrs {
                let handler = match instr {
                    Instr::Alloc { handler, .. } | Instr::Call { handler, .. } => *handler,
                    _ => None,
                };
                if let Some(h) = handler
                    && !in_range(h)
                {
                    return Err(bad(format!("bb{id} has a handler edge out of range")));
                }
            }

            let targets: Vec<BlockId> = match &block.term {
                Terminator::Goto(t) => vec![*t],
                Terminator::Branch {
                    then_block,
                    else_block,
                } => vec![*then_block, *else_block],
                Terminator::Throw {
                    handler: Some(h), ..
                } => vec![*h],
                _ => vec![],
            };
            if let Some(t) = targets.iter().find(|t| !in_range(**t)) {
                return Err(bad(format!("bb{id} branches to missing bb{t}")));
            }
        }
        Ok(())
    }
}

/// Incremental [`Cfg`] construction, used by front ends and tests.
///
/// Blocks are allocated with [`CfgBuilder::block`]; the entry block exists
/// from the start. [`CfgBuilder::finish`] appends the two exit blocks.
#[derive(Debug)]
pub struct CfgBuilder {
    blocks: Vec<Block>,
}

impl Default for CfgBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CfgBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            blocks: vec![Block::default()],
        }
    }

    /// The entry block id.
    #[must_use]
    pub fn entry(&self) -> BlockId {
        0
    }

    /// Allocate a fresh, empty block.
    pub fn block(&mut self) -> BlockId {
        self.blocks.push(Block::default());
        self.blocks.len() - 1
    }

    pub fn push(&mut self, block: BlockId, instr: Instr) -> &mut Self {
        self.blocks[block].instrs.push(instr);
        self
    }

    /// `lhs = rhs` aliasing assignment.
    pub fn copy(&mut self, block: BlockId, lhs: impl Into<String>, rhs: impl Into<String>) {
        self.push(
            block,
            Instr::Copy {
                lhs: lhs.into(),
                rhs: rhs.into(),
            },
        );
    }

    /// `lhs = new ty()` that cannot throw.
    pub fn alloc(&mut self, block: BlockId, lhs: impl Into<String>, ty: impl Into<String>) {
        self.push(
            block,
            Instr::Alloc {
                lhs: lhs.into(),
                ty: ty.into(),
                thrown: Vec::new(),
                handler: None,
            },
        );
    }

    /// `receiver.method()` that cannot throw, discarding the result.
    pub fn call(
        &mut self,
        block: BlockId,
        receiver: impl Into<String>,
        owner: impl Into<String>,
        method: impl Into<String>,
    ) {
        self.push(
            block,
            Instr::Call {
                lhs: None,
                receiver: Some(receiver.into()),
                owner: Some(owner.into()),
                method: method.into(),
                args: Vec::new(),
                thrown: Vec::new(),
                handler: None,
            },
        );
    }

    pub fn terminate(&mut self, block: BlockId, term: Terminator) {
        self.blocks[block].term = term;
    }

    pub fn goto(&mut self, block: BlockId, target: BlockId) {
        self.terminate(block, Terminator::Goto(target));
    }

    pub fn branch(&mut self, block: BlockId, then_block: BlockId, else_block: BlockId) {
        self.terminate(
            block,
            Terminator::Branch {
                then_block,
                else_block,
            },
        );
    }

    pub fn ret(&mut self, block: BlockId) {
        self.terminate(block, Terminator::Return { value: None });
    }

    pub fn ret_value(&mut self, block: BlockId, value: impl Into<String>) {
        self.terminate(
            block,
            Terminator::Return {
                value: Some(value.into()),
            },
        );
    }

    pub fn throw(&mut self, block: BlockId, exception: impl Into<String>) {
        self.terminate(
            block,
            Terminator::Throw {
                exception: exception.into(),
                handler: None,
            },
        );
    }

    /// Append the exit blocks and produce the graph.
    #[must_use]
    pub fn finish(mut self) -> Cfg {
        self.blocks.push(Block::default());
        let normal_exit = self.blocks.len() - 1;
        self.blocks.push(Block::default());
        let exceptional_exit = self.blocks.len() - 1;
        Cfg {
            blocks: self.blocks,
            entry: 0,
            normal_exit,
            exceptional_exit,
        }
    }
}

/// Seam to the sub-analysis that tracks the set of methods already called on
/// a value. `None` means the collaborator has no result for the expression
/// at that point; the consistency analyzer then falls back to its own
/// tracking (or trusts the expression when it tracks nothing either).
pub trait CalledMethodsOracle {
    fn called_methods_at(&self, point: ProgramPoint, expression: &str) -> Option<BTreeSet<String>>;
}

/// Default collaborator with no results.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCalledMethods;

impl CalledMethodsOracle for NoCalledMethods {
    fn called_methods_at(
        &self,
        _point: ProgramPoint,
        _expression: &str,
    ) -> Option<BTreeSet<String>> {
        None
    }
}
