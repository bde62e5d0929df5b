//! Ready-made programs for exercising the lowering passes.
//!
//! Each builder returns the program plus handles to the nodes a test
//! wants to inspect afterwards. The shapes mirror what the front end
//! produces after resolution: an entry function, outlined task
//! functions, and normalized bodies.

use crate::ir::{
    ClassKind, Field, FnFlags, FuncRef, Immediate, Operand, Program, Rvalue, StmtKind, StmtRef,
    SymFlags, SymRef, TypeFlags, TypeRef,
};
use smol_str::format_smolstr;

/// A reference-semantics class with a single int field `f`.
pub fn class_with_int_field(prog: &mut Program, name: &str) -> TypeRef {
    let int_ = prog.types.builtins.int_;
    prog.types.add_class(
        name,
        ClassKind::Class,
        vec![Field { name: "f".into(), ty: int_ }],
        TypeFlags::empty(),
    )
}

/// A value-semantics record with a single int field `f`.
pub fn record_with_int_field(prog: &mut Program, name: &str) -> TypeRef {
    let int_ = prog.types.builtins.int_;
    prog.types.add_class(
        name,
        ClassKind::Record,
        vec![Field { name: "f".into(), ty: int_ }],
        TypeFlags::empty(),
    )
}

pub struct BeginTaskCase {
    pub prog: Program,
    pub entry: FuncRef,
    pub task_fn: FuncRef,
    pub calls: Vec<StmtRef>,
    pub actuals: Vec<SymRef>,
}

/// An entry function spawning `sites` copies of one `begin` task that
/// captures a single int.
pub fn begin_task_case(sites: usize) -> BeginTaskCase {
    let mut prog = Program::new();
    let void_ = prog.types.builtins.void_;
    let int_ = prog.types.builtins.int_;

    let task_fn = prog.add_func("begin_fn", void_, FnFlags::BEGIN);
    prog.add_formal(task_fn, "x", int_);
    prog.push_stmt(prog.func(task_fn).body, StmtKind::Return(Operand::Void));

    let entry = prog.add_func("chpl_gen_main", void_, FnFlags::empty());
    prog.entry_fn = Some(entry);
    let body = prog.func(entry).body;
    let mut calls = Vec::new();
    let mut actuals = Vec::new();
    for i in 0..sites {
        let t = prog.add_local(entry, format_smolstr!("t{i}"), int_, SymFlags::empty());
        prog.push_stmt(body, StmtKind::Def(t));
        prog.push_stmt(
            body,
            StmtKind::Move { dst: t, src: Rvalue::Use(Operand::int(i as i64)) },
        );
        calls.push(prog.push_stmt(
            body,
            StmtKind::Eval(Rvalue::Call { func: task_fn, args: vec![Operand::Sym(t)] }),
        ));
        actuals.push(t);
    }
    prog.push_stmt(body, StmtKind::Return(Operand::Void));

    BeginTaskCase { prog, entry, task_fn, calls, actuals }
}

pub struct RecordCaptureCase {
    pub prog: Program,
    pub entry: FuncRef,
    pub task_fn: FuncRef,
    pub auto_copy: FuncRef,
    pub auto_destroy: FuncRef,
    pub record: TypeRef,
    pub calls: Vec<StmtRef>,
}

/// A `begin` task capturing a record by value, with resolved
/// autoCopy/autoDestroy for the record type. With `early_return` the
/// task body has a conditional exit in addition to the tail return.
pub fn record_capture_case(sites: usize, early_return: bool) -> RecordCaptureCase {
    let mut prog = Program::new();
    let void_ = prog.types.builtins.void_;
    let bool_ = prog.types.builtins.bool_;
    let record = record_with_int_field(&mut prog, "R");

    let auto_copy = prog.add_func("auto_copy_R", record, FnFlags::empty());
    let copy_in = prog.add_formal(auto_copy, "x", record);
    prog.push_stmt(prog.func(auto_copy).body, StmtKind::Return(Operand::Sym(copy_in)));

    let auto_destroy = prog.add_func("auto_destroy_R", void_, FnFlags::AUTO_DESTROY_FN);
    prog.add_formal(auto_destroy, "x", record);
    prog.push_stmt(prog.func(auto_destroy).body, StmtKind::Return(Operand::Void));

    prog.auto_copy.insert(record, auto_copy);
    prog.auto_destroy.insert(record, auto_destroy);

    let task_fn = prog.add_func("begin_fn", void_, FnFlags::BEGIN);
    prog.add_formal(task_fn, "r", record);
    let tbody = prog.func(task_fn).body;
    if early_return {
        let done = prog.add_local(task_fn, "done", bool_, SymFlags::empty());
        prog.push_stmt(tbody, StmtKind::Def(done));
        prog.push_stmt(
            tbody,
            StmtKind::Move {
                dst: done,
                src: Rvalue::Use(Operand::Imm(Immediate::Bool(false))),
            },
        );
        let exit_blk = prog.add_block(tbody, crate::ir::BlockKind::Normal);
        prog.push_stmt(exit_blk, StmtKind::Return(Operand::Void));
        prog.push_stmt(
            tbody,
            StmtKind::Cond { cond: Operand::Sym(done), then_blk: exit_blk },
        );
    }
    prog.push_stmt(tbody, StmtKind::Return(Operand::Void));

    let entry = prog.add_func("chpl_gen_main", void_, FnFlags::empty());
    prog.entry_fn = Some(entry);
    let body = prog.func(entry).body;
    let mut calls = Vec::new();
    for i in 0..sites {
        let v = prog.add_local(entry, format_smolstr!("v{i}"), record, SymFlags::empty());
        prog.push_stmt(body, StmtKind::Def(v));
        calls.push(prog.push_stmt(
            body,
            StmtKind::Eval(Rvalue::Call { func: task_fn, args: vec![Operand::Sym(v)] }),
        ));
    }
    prog.push_stmt(body, StmtKind::Return(Operand::Void));

    RecordCaptureCase { prog, entry, task_fn, auto_copy, auto_destroy, record, calls }
}
