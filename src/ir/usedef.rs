//! Whole-program def/use maps.
//!
//! Rebuilt at the start of any pass that needs them; the maps hold plain
//! statement handles, so they go stale as soon as the IR mutates and must
//! not be kept across rewrites.

use crate::ir::{Operand, Program, Rvalue, StmtKind, StmtRef, SymRef, TypeFlags};
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct DefUse {
    /// Statements that write a symbol: `Move` destinations, plus call
    /// actuals lining up with a reference-typed formal (the callee may
    /// update through the reference).
    pub defs: HashMap<SymRef, Vec<StmtRef>>,
    /// Statements that read a symbol anywhere in their operands.
    pub uses: HashMap<SymRef, Vec<StmtRef>>,
}

impl DefUse {
    pub fn build(prog: &Program) -> Self {
        let mut maps = DefUse::default();
        for stmt in prog.all_stmts() {
            maps.scan_stmt(prog, stmt);
        }
        maps
    }

    fn scan_stmt(&mut self, prog: &Program, stmt: StmtRef) {
        let kind = &prog.stmt(stmt).kind;
        if let StmtKind::Move { dst, .. } = kind {
            self.defs.entry(*dst).or_default().push(stmt);
        }
        for op in kind.operands() {
            if let Operand::Sym(sym) = op {
                self.uses.entry(*sym).or_default().push(stmt);
            }
        }
        // A by-ref actual is also a definition of the actual.
        if let Some(rv @ Rvalue::Call { args, .. }) = kind.rvalue() {
            for (i, arg) in args.iter().enumerate() {
                let Operand::Sym(sym) = arg else { continue };
                let formal = prog.actual_to_formal(rv, i);
                if prog.types.flags(prog.sym(formal).ty).contains(TypeFlags::REF) {
                    self.defs.entry(*sym).or_default().push(stmt);
                }
            }
        }
    }

    pub fn defs_of(&self, sym: SymRef) -> &[StmtRef] {
        self.defs.get(&sym).map_or(&[], Vec::as_slice)
    }
    pub fn uses_of(&self, sym: SymRef) -> &[StmtRef] {
        self.uses.get(&sym).map_or(&[], Vec::as_slice)
    }
}

#[cfg(test)]
mod testing {
    use super::*;
    use crate::ir::{FnFlags, Operand, Rvalue, StmtKind, SymFlags};

    #[test]
    fn ref_actual_counts_as_def() {
        let mut prog = Program::new();
        let int_ = prog.types.builtins.int_;
        let void_ = prog.types.builtins.void_;
        let ref_int = prog.types.ref_type(int_);

        let callee = prog.add_func("update", void_, FnFlags::empty());
        prog.add_formal(callee, "out", ref_int);

        let caller = prog.add_func("caller", void_, FnFlags::empty());
        let body = prog.func(caller).body;
        let r = prog.add_local(caller, "r", ref_int, SymFlags::empty());
        prog.push_stmt(body, StmtKind::Def(r));
        let call = prog.push_stmt(
            body,
            StmtKind::Eval(Rvalue::Call { func: callee, args: vec![Operand::Sym(r)] }),
        );

        let du = DefUse::build(&prog);
        assert_eq!(du.defs_of(r), &[call]);
        assert_eq!(du.uses_of(r), &[call]);
    }
}
