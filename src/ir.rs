//! ## Pgas-Lower IR subsystem
//!
//! A whole-program, type-resolved AST/IR in the normalized form produced
//! by the front end's resolution pass: flat statements (defs, moves,
//! primitive evaluations, calls, returns, nested blocks) over symbols
//! addressed through slab handles. The lowering passes in [`crate::passes`]
//! mutate this representation in place.

mod func;
mod prim;
mod program;
mod stmt;
mod symbol;
mod types;

pub mod usedef;

pub use self::{
    func::{FnFlags, FuncData, FuncRef},
    prim::Prim,
    program::{Program, VerifyError},
    stmt::{BlockData, BlockKind, BlockRef, Immediate, Operand, Rvalue, StmtData, StmtKind, StmtRef},
    symbol::{FlagConflict, SymFlags, SymOwner, SymRef, SymbolData},
    types::{
        Builtins, ClassKind, Field, HEAP_FIELD_VALUE, TypeData, TypeFlags, TypeKind, TypeRef,
        TypeStore, WIDE_FIELD_ADDR, WIDE_FIELD_LOCALE, WIDE_FIELD_SIZE,
    },
};
