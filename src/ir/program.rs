//! The whole-program IR container and its rewrite utilities.
//!
//! `Program` owns one slab arena per node class, the type store with its
//! registries, and the whole-program tables the passes consult (globals in
//! declaration order, autoCopy/autoDestroy resolution, entry points). It
//! is passed explicitly into every stage, so tests can run isolated
//! pipelines without residual state.

use crate::{
    base::{INullableValue, SlabRef},
    ir::{
        BlockData, BlockKind, BlockRef, FnFlags, FuncData, FuncRef, Immediate, Operand, Rvalue,
        StmtData, StmtKind, StmtRef, SymFlags, SymOwner, SymRef, SymbolData, TypeRef,
        symbol::FlagConflict,
    },
};
use slab::Slab;
use smol_str::SmolStr;
use std::collections::{HashMap, HashSet};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error(transparent)]
    FlagConflict(#[from] FlagConflict),

    #[error("statement {0:?} is not listed in its own block")]
    StrayStatement(StmtRef),

    #[error("formal {sym:?} of function {func:?} is missing the ARG flag")]
    FormalNotArg { func: FuncRef, sym: SymRef },
}

#[derive(Debug)]
pub struct Program {
    pub types: crate::ir::TypeStore,
    pub syms: Slab<SymbolData>,
    pub funcs: Slab<FuncData>,
    pub blocks: Slab<BlockData>,
    pub stmts: Slab<StmtData>,

    /// Module-level variables in declaration-encounter order. Startup
    /// index assignment iterates this, so the order must be stable.
    pub globals: Vec<SymRef>,
    /// The program entry function; the end count is a true local here.
    pub entry_fn: Option<FuncRef>,
    /// Module initialization function; global initializers live in it.
    pub module_init_fn: Option<FuncRef>,
    /// Synthesized `heap-allocate-globals` startup function.
    pub startup_fn: Option<FuncRef>,

    /// Per-type autoCopy resolution (bumps refcounts / copies records).
    pub auto_copy: HashMap<TypeRef, FuncRef>,
    /// Per-type autoDestroy resolution.
    pub auto_destroy: HashMap<TypeRef, FuncRef>,
    /// Types with internal reference counting.
    pub ref_counted: HashSet<TypeRef>,

    next_temp: u32,
}

impl Program {
    pub fn new() -> Self {
        Self {
            types: crate::ir::TypeStore::new(),
            syms: Slab::new(),
            funcs: Slab::new(),
            blocks: Slab::new(),
            stmts: Slab::new(),
            globals: Vec::new(),
            entry_fn: None,
            module_init_fn: None,
            startup_fn: None,
            auto_copy: HashMap::new(),
            auto_destroy: HashMap::new(),
            ref_counted: HashSet::new(),
            next_temp: 0,
        }
    }

    // ---- node accessors ----

    pub fn sym(&self, s: SymRef) -> &SymbolData {
        s.to_data(&self.syms)
    }
    pub fn sym_mut(&mut self, s: SymRef) -> &mut SymbolData {
        s.to_data_mut(&mut self.syms)
    }
    pub fn func(&self, f: FuncRef) -> &FuncData {
        f.to_data(&self.funcs)
    }
    pub fn func_mut(&mut self, f: FuncRef) -> &mut FuncData {
        f.to_data_mut(&mut self.funcs)
    }
    pub fn block(&self, b: BlockRef) -> &BlockData {
        b.to_data(&self.blocks)
    }
    pub fn block_mut(&mut self, b: BlockRef) -> &mut BlockData {
        b.to_data_mut(&mut self.blocks)
    }
    pub fn stmt(&self, s: StmtRef) -> &StmtData {
        s.to_data(&self.stmts)
    }
    pub fn stmt_mut(&mut self, s: StmtRef) -> &mut StmtData {
        s.to_data_mut(&mut self.stmts)
    }

    /// A statement survives in its arena after removal so stale worklist
    /// entries stay addressable; detached statements answer false here.
    pub fn stmt_is_live(&self, s: StmtRef) -> bool {
        s.as_data(&self.stmts).is_some_and(|d| d.block.is_nonnull())
    }

    // ---- construction ----

    pub fn add_func(
        &mut self,
        name: impl Into<SmolStr>,
        ret_type: TypeRef,
        flags: FnFlags,
    ) -> FuncRef {
        let func = FuncRef(self.funcs.insert(FuncData {
            name: name.into(),
            formals: Vec::new(),
            ret_type,
            body: BlockRef::new_null(),
            flags,
        }));
        let body = BlockRef(self.blocks.insert(BlockData {
            kind: BlockKind::Normal,
            parent: None,
            func,
            stmts: Vec::new(),
        }));
        self.func_mut(func).body = body;
        func
    }

    pub fn add_block(&mut self, parent: BlockRef, kind: BlockKind) -> BlockRef {
        let func = self.block(parent).func;
        BlockRef(self.blocks.insert(BlockData {
            kind,
            parent: Some(parent),
            func,
            stmts: Vec::new(),
        }))
    }

    pub fn add_formal(
        &mut self,
        func: FuncRef,
        name: impl Into<SmolStr>,
        ty: TypeRef,
    ) -> SymRef {
        let sym = SymRef(self.syms.insert(SymbolData {
            name: name.into(),
            ty,
            flags: SymFlags::ARG,
            owner: SymOwner::Func(func),
        }));
        self.func_mut(func).formals.push(sym);
        sym
    }

    pub fn add_local(
        &mut self,
        func: FuncRef,
        name: impl Into<SmolStr>,
        ty: TypeRef,
        flags: SymFlags,
    ) -> SymRef {
        SymRef(self.syms.insert(SymbolData {
            name: name.into(),
            ty,
            flags,
            owner: SymOwner::Func(func),
        }))
    }

    pub fn add_global(
        &mut self,
        name: impl Into<SmolStr>,
        ty: TypeRef,
        flags: SymFlags,
    ) -> SymRef {
        let sym = SymRef(self.syms.insert(SymbolData {
            name: name.into(),
            ty,
            flags,
            owner: SymOwner::Module,
        }));
        self.globals.push(sym);
        sym
    }

    pub fn new_temp(&mut self, func: FuncRef, base: &str, ty: TypeRef) -> SymRef {
        let n = self.next_temp;
        self.next_temp += 1;
        self.add_local(
            func,
            smol_str::format_smolstr!("{base}_tmp{n}"),
            ty,
            SymFlags::TEMP,
        )
    }

    // ---- statement surgery ----

    pub fn push_stmt(&mut self, block: BlockRef, kind: StmtKind) -> StmtRef {
        let stmt = StmtRef(self.stmts.insert(StmtData { block, kind }));
        self.block_mut(block).stmts.push(stmt);
        stmt
    }

    fn position_in_block(&self, stmt: StmtRef) -> (BlockRef, usize) {
        let block = self.stmt(stmt).block;
        if block.is_null() {
            panic!("Internal error: statement {stmt:?} is detached from any block");
        }
        let pos = self
            .block(block)
            .stmts
            .iter()
            .position(|&s| s == stmt)
            .unwrap_or_else(|| {
                panic!("Internal error: statement {stmt:?} not found in its block")
            });
        (block, pos)
    }

    pub fn insert_before(&mut self, anchor: StmtRef, kind: StmtKind) -> StmtRef {
        let (block, pos) = self.position_in_block(anchor);
        let stmt = StmtRef(self.stmts.insert(StmtData { block, kind }));
        self.block_mut(block).stmts.insert(pos, stmt);
        stmt
    }

    pub fn insert_after(&mut self, anchor: StmtRef, kind: StmtKind) -> StmtRef {
        let (block, pos) = self.position_in_block(anchor);
        let stmt = StmtRef(self.stmts.insert(StmtData { block, kind }));
        self.block_mut(block).stmts.insert(pos + 1, stmt);
        stmt
    }

    pub fn insert_at_head(&mut self, block: BlockRef, kind: StmtKind) -> StmtRef {
        let stmt = StmtRef(self.stmts.insert(StmtData { block, kind }));
        self.block_mut(block).stmts.insert(0, stmt);
        stmt
    }

    /// Detaches a statement from its block. The arena entry stays live so
    /// handles held by not-yet-visited worklist entries cannot dangle.
    pub fn remove_stmt(&mut self, stmt: StmtRef) {
        let (block, pos) = self.position_in_block(stmt);
        self.block_mut(block).stmts.remove(pos);
        self.stmt_mut(stmt).block = BlockRef::new_null();
    }

    pub fn set_stmt_kind(&mut self, stmt: StmtRef, kind: StmtKind) {
        self.stmt_mut(stmt).kind = kind;
    }

    /// Substitutes symbol operands within one statement.
    pub fn replace_sym_operands(&mut self, stmt: StmtRef, from: SymRef, to: SymRef) {
        for op in self.stmt_mut(stmt).kind.operands_mut() {
            if *op == Operand::Sym(from) {
                *op = Operand::Sym(to);
            }
        }
    }

    // ---- traversal ----

    pub fn all_funcs(&self) -> Vec<FuncRef> {
        self.funcs.iter().map(|(h, _)| FuncRef(h)).collect()
    }

    fn collect_block_stmts(&self, block: BlockRef, out: &mut Vec<StmtRef>) {
        for &stmt in &self.block(block).stmts {
            out.push(stmt);
            match &self.stmt(stmt).kind {
                StmtKind::Cond { then_blk, .. } => self.collect_block_stmts(*then_blk, out),
                StmtKind::Child(b) => self.collect_block_stmts(*b, out),
                _ => {}
            }
        }
    }

    /// All statements in a block's subtree, pre-order.
    pub fn block_stmts(&self, block: BlockRef) -> Vec<StmtRef> {
        let mut out = Vec::new();
        self.collect_block_stmts(block, &mut out);
        out
    }

    pub fn fn_stmts(&self, func: FuncRef) -> Vec<StmtRef> {
        self.block_stmts(self.func(func).body)
    }

    /// Whole-program statement snapshot, function by function.
    pub fn all_stmts(&self) -> Vec<StmtRef> {
        let mut out = Vec::new();
        for (_, func) in self.funcs.iter() {
            self.collect_block_stmts(func.body, &mut out);
        }
        out
    }

    pub fn stmt_func(&self, stmt: StmtRef) -> FuncRef {
        self.block(self.stmt(stmt).block).func
    }

    pub fn returns_of(&self, func: FuncRef) -> Vec<StmtRef> {
        self.fn_stmts(func)
            .into_iter()
            .filter(|&s| matches!(self.stmt(s).kind, StmtKind::Return(_)))
            .collect()
    }

    /// Insertion anchors for per-task cleanup: before every call to a
    /// down-end-count routine when the function has one, otherwise before
    /// every return. Cleanup must reach every control-flow exit.
    pub fn cleanup_anchors(&self, func: FuncRef) -> Vec<StmtRef> {
        let down_calls: Vec<StmtRef> = self
            .fn_stmts(func)
            .into_iter()
            .filter(|&s| {
                self.stmt(s)
                    .kind
                    .called_func()
                    .is_some_and(|f| self.func(f).flags.contains(FnFlags::DOWN_END_COUNT))
            })
            .collect();
        if !down_calls.is_empty() {
            return down_calls;
        }
        self.returns_of(func)
    }

    /// All call sites of every function, in traversal order.
    pub fn compute_call_sites(&self) -> HashMap<FuncRef, Vec<StmtRef>> {
        let mut sites: HashMap<FuncRef, Vec<StmtRef>> = HashMap::new();
        for stmt in self.all_stmts() {
            if let Some(func) = self.stmt(stmt).kind.called_func() {
                sites.entry(func).or_default().push(stmt);
            }
        }
        sites
    }

    // ---- block nesting ----

    pub fn block_depth(&self, mut block: BlockRef) -> usize {
        let mut depth = 0;
        while let Some(parent) = self.block(block).parent {
            block = parent;
            depth += 1;
        }
        depth
    }

    /// Lowest common ancestor over the block-nesting tree, by parent
    /// pointers.
    pub fn block_lca(&self, a: BlockRef, b: BlockRef) -> BlockRef {
        let (mut a, mut b) = (a, b);
        let (mut da, mut db) = (self.block_depth(a), self.block_depth(b));
        while da > db {
            a = self.block(a).parent.expect("Internal error: depth underflow in block LCA");
            da -= 1;
        }
        while db > da {
            b = self.block(b).parent.expect("Internal error: depth underflow in block LCA");
            db -= 1;
        }
        while a != b {
            match (self.block(a).parent, self.block(b).parent) {
                (Some(pa), Some(pb)) => {
                    a = pa;
                    b = pb;
                }
                _ => panic!("Internal error: blocks {a:?} and {b:?} share no ancestor"),
            }
        }
        a
    }

    // ---- typing ----

    pub fn operand_ty(&self, op: &Operand) -> TypeRef {
        match op {
            Operand::Sym(s) => self.sym(*s).ty,
            Operand::Imm(Immediate::Int(_)) => self.types.builtins.int_,
            Operand::Imm(Immediate::Bool(_)) => self.types.builtins.bool_,
            Operand::Imm(Immediate::Real(_)) => self.types.builtins.real_,
            Operand::Imm(Immediate::Str(_)) => self.types.builtins.string,
            Operand::Nil => self.types.builtins.nil,
            Operand::Void => self.types.builtins.void_,
            Operand::Type(t) => *t,
        }
    }

    /// The value type of an operand, with reference and wideness stripped.
    pub fn operand_val_ty(&self, op: &Operand) -> TypeRef {
        self.types.value_type(self.operand_ty(op))
    }

    /// The formal a call actual lines up with.
    pub fn actual_to_formal(&self, rv: &Rvalue, index: usize) -> SymRef {
        let func = rv
            .called_func()
            .unwrap_or_else(|| panic!("Internal error: rvalue {rv:?} is not a call"));
        *self.func(func).formals.get(index).unwrap_or_else(|| {
            panic!(
                "Internal error: call to '{}' has no formal {index}",
                self.func(func).name
            )
        })
    }

    // ---- verification ----

    pub fn verify(&self) -> Result<(), VerifyError> {
        for (_, sym) in self.syms.iter() {
            sym.validate()?;
        }
        for (h, func) in self.funcs.iter() {
            let func_ref = FuncRef(h);
            for &formal in &func.formals {
                if !self.sym(formal).flags.contains(SymFlags::ARG) {
                    return Err(VerifyError::FormalNotArg { func: func_ref, sym: formal });
                }
            }
        }
        for stmt in self.all_stmts() {
            let block = self.stmt(stmt).block;
            if !self.block(block).stmts.contains(&stmt) {
                return Err(VerifyError::StrayStatement(stmt));
            }
        }
        Ok(())
    }
}

impl Default for Program {
    fn default() -> Self {
        Self::new()
    }
}
