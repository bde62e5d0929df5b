//! Blocks, statements, operands and rvalues.
//!
//! The IR is in the normalized form the resolution pass guarantees:
//! every computed value lands in a symbol through a `Move`, calls and
//! effectful primitives appear as `Eval` statements, and control flow is
//! structured (nested blocks, conditionals, returns). Blocks carry parent
//! pointers so enclosing-scope queries are plain tree walks.

use crate::{impl_slabref, ir::{FuncRef, Prim, SymRef, TypeRef}};
use smallvec::SmallVec;
use smol_str::SmolStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockRef(pub usize);
impl_slabref!(BlockRef, BlockData);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StmtRef(pub usize);
impl_slabref!(StmtRef, StmtData);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Normal,
    /// Annotated `local`: proven to touch only same-locale memory.
    Local,
}

#[derive(Debug, Clone)]
pub struct BlockData {
    pub kind: BlockKind,
    pub parent: Option<BlockRef>,
    pub func: FuncRef,
    pub stmts: Vec<StmtRef>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Immediate {
    Int(i64),
    Bool(bool),
    Real(f64),
    Str(SmolStr),
}

/// A leaf value position inside a statement.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Sym(SymRef),
    Imm(Immediate),
    /// The `nil` literal; its type is the sentinel nil type until the
    /// widening pass normalizes it away.
    Nil,
    /// Unit value returned by void functions.
    Void,
    /// A type mention (cast targets, allocation requests).
    Type(TypeRef),
}

impl Operand {
    pub fn int(v: i64) -> Self {
        Operand::Imm(Immediate::Int(v))
    }
    pub fn str(s: impl Into<SmolStr>) -> Self {
        Operand::Imm(Immediate::Str(s.into()))
    }
    pub fn as_sym(&self) -> Option<SymRef> {
        match self {
            Operand::Sym(s) => Some(*s),
            _ => None,
        }
    }
    pub fn as_field_index(&self) -> usize {
        match self {
            Operand::Imm(Immediate::Int(i)) => *i as usize,
            other => panic!("Internal error: operand {other:?} is not a field index"),
        }
    }
}

/// The right-hand side of a `Move` or the payload of an `Eval`.
#[derive(Debug, Clone, PartialEq)]
pub enum Rvalue {
    Use(Operand),
    Prim(Prim, SmallVec<[Operand; 3]>),
    Call { func: FuncRef, args: Vec<Operand> },
}

impl Rvalue {
    pub fn prim(op: Prim, args: impl IntoIterator<Item = Operand>) -> Self {
        Rvalue::Prim(op, args.into_iter().collect())
    }

    pub fn called_func(&self) -> Option<FuncRef> {
        match self {
            Rvalue::Call { func, .. } => Some(*func),
            _ => None,
        }
    }

    /// All leaf operands, in evaluation order.
    pub fn operands(&self) -> SmallVec<[&Operand; 4]> {
        match self {
            Rvalue::Use(op) => SmallVec::from_iter([op]),
            Rvalue::Prim(_, args) => args.iter().collect(),
            Rvalue::Call { args, .. } => args.iter().collect(),
        }
    }

    pub fn operands_mut(&mut self) -> SmallVec<[&mut Operand; 4]> {
        match self {
            Rvalue::Use(op) => SmallVec::from_iter([op]),
            Rvalue::Prim(_, args) => args.iter_mut().collect(),
            Rvalue::Call { args, .. } => args.iter_mut().collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StmtKind {
    /// Declaration point of a symbol.
    Def(SymRef),
    Move { dst: SymRef, src: Rvalue },
    /// Call or primitive evaluated for effect.
    Eval(Rvalue),
    Return(Operand),
    /// Structured conditional; `then_blk` runs when `cond` is true.
    Cond { cond: Operand, then_blk: BlockRef },
    /// Nested block statement.
    Child(BlockRef),
}

#[derive(Debug, Clone)]
pub struct StmtData {
    pub block: BlockRef,
    pub kind: StmtKind,
}

impl StmtKind {
    pub fn rvalue(&self) -> Option<&Rvalue> {
        match self {
            StmtKind::Move { src, .. } => Some(src),
            StmtKind::Eval(rv) => Some(rv),
            _ => None,
        }
    }
    pub fn rvalue_mut(&mut self) -> Option<&mut Rvalue> {
        match self {
            StmtKind::Move { src, .. } => Some(src),
            StmtKind::Eval(rv) => Some(rv),
            _ => None,
        }
    }

    /// The function this statement calls, if it is a call statement.
    pub fn called_func(&self) -> Option<FuncRef> {
        self.rvalue().and_then(Rvalue::called_func)
    }

    /// Leaf operands read by this statement (the `Move` destination is a
    /// definition, not an operand).
    pub fn operands(&self) -> SmallVec<[&Operand; 4]> {
        match self {
            StmtKind::Move { src, .. } => src.operands(),
            StmtKind::Eval(rv) => rv.operands(),
            StmtKind::Return(op) => SmallVec::from_iter([op]),
            StmtKind::Cond { cond, .. } => SmallVec::from_iter([cond]),
            StmtKind::Def(_) | StmtKind::Child(_) => SmallVec::new(),
        }
    }

    pub fn operands_mut(&mut self) -> SmallVec<[&mut Operand; 4]> {
        match self {
            StmtKind::Move { src, .. } => src.operands_mut(),
            StmtKind::Eval(rv) => rv.operands_mut(),
            StmtKind::Return(op) => SmallVec::from_iter([op]),
            StmtKind::Cond { cond, .. } => SmallVec::from_iter([cond]),
            StmtKind::Def(_) | StmtKind::Child(_) => SmallVec::new(),
        }
    }
}
