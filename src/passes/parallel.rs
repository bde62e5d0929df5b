//! Task/locale lowering.
//!
//! Runs in three steps over the resolved IR:
//!
//! 1. `make_heap_allocations` moves variables that outlive their stack
//!    frame (captures of `begin`, non-blocking `on` payloads, `coforall`
//!    index variables, shared globals) into heap boxes, rewriting every
//!    definition and use to go through the box.
//! 2. `insert_end_counts` replaces the end-count primitives with a
//!    per-function local and threads that local as a trailing formal
//!    through every caller up to the entry function.
//! 3. `pass_args_to_nested_fns` packs the actuals of every task-function
//!    call into a per-function argument bundle, synthesizes the wrapper
//!    the runtime's fork/task interface invokes, and inserts the
//!    autoCopy/autoDestroy pairs that keep captured values alive until
//!    the spawned task finishes.

use crate::{
    config::TargetConfig,
    ir::{
        ClassKind, Field, FnFlags, FuncRef, HEAP_FIELD_VALUE, Operand, Prim, Program, Rvalue,
        StmtKind, StmtRef, SymFlags, SymOwner, SymRef, TypeFlags, TypeRef, usedef::DefUse,
    },
    passes::WorkList,
};
use smol_str::format_smolstr;
use std::collections::HashMap;

pub fn parallel(prog: &mut Program, cfg: &TargetConfig) {
    let task_fns: Vec<FuncRef> = prog
        .all_funcs()
        .into_iter()
        .filter(|&f| prog.func(f).is_task_fn())
        .collect();
    log::debug!("lowering {} task functions", task_fns.len());
    make_heap_allocations(prog, cfg);
    insert_end_counts(prog);
    pass_args_to_nested_fns(prog, &task_fns);
}

// ---- step 1: heap promotion ----

fn make_heap_allocations(prog: &mut Program, cfg: &TargetConfig) {
    let du = DefUse::build(prog);
    let mut refs: WorkList<SymRef> = WorkList::new();
    let mut vars: WorkList<SymRef> = WorkList::new();
    find_block_ref_actuals(prog, cfg, &mut refs);
    find_heap_vars_and_refs(prog, cfg, &du, &mut refs, &mut vars);
    propagate_refs(prog, &du, &mut refs, &mut vars);
    let heap_allocated = promote_vars(prog, cfg, &mut vars);
    free_heap_allocated_vars(prog, heap_allocated);
}

/// Reference formals of functions whose body runs after the spawning
/// frame may have unwound. What those references point at must move to
/// the heap.
fn find_block_ref_actuals(prog: &Program, cfg: &TargetConfig, refs: &mut WorkList<SymRef>) {
    for func in prog.all_funcs() {
        let fd = prog.func(func);
        let outlives_frame = fd.flags.contains(FnFlags::BEGIN)
            || (fd.flags.contains(FnFlags::ON)
                && (cfg.need_heap_vars() || fd.flags.contains(FnFlags::NON_BLOCKING)));
        if !outlives_frame {
            continue;
        }
        for &formal in &fd.formals {
            if prog.types.flags(prog.sym(formal).ty).contains(TypeFlags::REF) {
                refs.insert(formal);
            }
        }
    }
}

/// Seeds the promotion sets with `coforall` index variables and with
/// module-level variables. Constant globals of value shape are broadcast
/// in place instead of heap-placed.
fn find_heap_vars_and_refs(
    prog: &mut Program,
    cfg: &TargetConfig,
    du: &DefUse,
    refs: &mut WorkList<SymRef>,
    vars: &mut WorkList<SymRef>,
) {
    // A coforall index variable is written by the spawning loop and read
    // by the spawned iterations.
    for stmt in prog.all_stmts() {
        let StmtKind::Def(sym) = prog.stmt(stmt).kind else { continue };
        let data = prog.sym(sym);
        if !data.flags.contains(SymFlags::COFORALL_INDEX) {
            continue;
        }
        if prog.types.flags(data.ty).contains(TypeFlags::REF) {
            refs.insert(sym);
        } else if !prog.types.is_primitive_value(data.ty) {
            vars.insert(sym);
        }
    }

    if !cfg.require_wide_refs() {
        return;
    }

    for global in prog.globals.clone() {
        let data = prog.sym(global).clone();
        if data.flags.intersects(SymFlags::PRIVATE | SymFlags::EXTERN) {
            continue;
        }
        let const_value = data.flags.contains(SymFlags::CONST)
            && (prog.types.is_primitive_value(data.ty)
                || (prog.types.is_record(data.ty)
                    && !data.flags.contains(SymFlags::RECORD_WRAPPED)));
        if const_value {
            let inits: Vec<StmtRef> = du
                .defs_of(global)
                .iter()
                .copied()
                .filter(|&d| prog.stmt_is_live(d))
                .collect();
            if inits.len() != 1 {
                panic!(
                    "Internal error: constant global '{}' has {} initializing definitions",
                    data.name,
                    inits.len()
                );
            }
            prog.insert_after(
                inits[0],
                StmtKind::Eval(Rvalue::prim(Prim::PrivateBroadcast, [Operand::Sym(global)])),
            );
        } else if data.flags.contains(SymFlags::RECORD_WRAPPED) {
            // Wrapper records (array/domain/distribution handles) are
            // replicated once their initializer has run.
            let last_init = du
                .defs_of(global)
                .iter()
                .copied()
                .filter(|&d| prog.stmt_is_live(d))
                .last()
                .unwrap_or_else(|| {
                    panic!(
                        "Internal error: record-wrapped global '{}' is never initialized",
                        data.name
                    )
                });
            prog.insert_after(
                last_init,
                StmtKind::Eval(Rvalue::prim(Prim::PrivateBroadcast, [Operand::Sym(global)])),
            );
        } else {
            vars.insert(global);
        }
    }
}

/// Chases each collected reference back to the variables it can point
/// at. Every shape a resolved-IR reference definition can take is
/// matched explicitly; anything else is a broken earlier pass.
fn propagate_refs(
    prog: &Program,
    du: &DefUse,
    refs: &mut WorkList<SymRef>,
    vars: &mut WorkList<SymRef>,
) {
    let sites = prog.compute_call_sites();
    let mut i = 0;
    while i < refs.len() {
        let r = refs.items[i];
        i += 1;
        let data = prog.sym(r);
        if data.is_formal() {
            let SymOwner::Func(func) = data.owner else {
                panic!("Internal error: formal '{}' has no owning function", data.name);
            };
            let pos = prog
                .func(func)
                .formals
                .iter()
                .position(|&f| f == r)
                .unwrap_or_else(|| {
                    panic!(
                        "Internal error: formal '{}' missing from '{}'",
                        data.name,
                        prog.func(func).name
                    )
                });
            for &call in sites.get(&func).map_or(&[][..], Vec::as_slice) {
                let Some(Rvalue::Call { args, .. }) = prog.stmt(call).kind.rvalue() else {
                    panic!("Internal error: call site of '{}' is not a call", prog.func(func).name);
                };
                let actual = args.get(pos).and_then(Operand::as_sym).unwrap_or_else(|| {
                    panic!(
                        "Internal error: non-symbol actual for reference formal '{}'",
                        data.name
                    )
                });
                refs.insert(actual);
            }
            continue;
        }
        for &def in du.defs_of(r) {
            if !prog.stmt_is_live(def) {
                continue;
            }
            let StmtKind::Move { dst, src } = &prog.stmt(def).kind else {
                // by-ref call actual: the callee establishes the reference
                continue;
            };
            if *dst != r {
                continue;
            }
            match src {
                Rvalue::Prim(Prim::AddrOf, args) => {
                    let v = args[0].as_sym().unwrap_or_else(|| {
                        panic!("Internal error: address taken of a non-symbol")
                    });
                    vars.insert(v);
                }
                Rvalue::Prim(
                    Prim::GetMember | Prim::GetMemberValue | Prim::ArrayGet,
                    args,
                ) => {
                    let base = args[0].as_sym().unwrap_or_else(|| {
                        panic!(
                            "Internal error: unexpected case around reference '{}'",
                            data.name
                        )
                    });
                    if prog.types.flags(prog.sym(base).ty).contains(TypeFlags::REF) {
                        refs.insert(base);
                    } else {
                        vars.insert(base);
                    }
                }
                Rvalue::Use(Operand::Sym(other)) => {
                    if !prog.types.flags(prog.sym(*other).ty).contains(TypeFlags::REF) {
                        panic!(
                            "Internal error: reference '{}' copied from non-reference '{}'",
                            data.name,
                            prog.sym(*other).name
                        );
                    }
                    refs.insert(*other);
                }
                Rvalue::Call { .. } => {}
                other => panic!(
                    "Internal error: unexpected case around reference '{}': {other:?}",
                    data.name
                ),
            }
        }
    }
}

/// Rewrites each collected variable to live in a heap box: its type
/// becomes the box type, definitions store into the box, uses read out
/// of it. Returns the locals that received an in-function allocation.
fn promote_vars(
    prog: &mut Program,
    cfg: &TargetConfig,
    vars: &mut WorkList<SymRef>,
) -> Vec<SymRef> {
    let mut heap_allocated = Vec::new();
    let mut du = DefUse::build(prog);
    let mut i = 0;
    while i < vars.len() {
        let var = vars.items[i];
        i += 1;
        let data = prog.sym(var).clone();
        if prog.types.flags(data.ty).contains(TypeFlags::REF) {
            panic!(
                "Internal error: reference '{}' reached the heap-promotion set",
                data.name
            );
        }
        if data.flags.contains(SymFlags::EXTERN) {
            continue;
        }
        if data.is_global() && !cfg.require_wide_refs() {
            continue;
        }

        if data.is_formal() {
            // A formal cannot change type without changing the callers;
            // promote a local copy instead.
            let SymOwner::Func(func) = data.owner else {
                panic!("Internal error: formal '{}' has no owning function", data.name);
            };
            let copy = prog.new_temp(func, "heaped", data.ty);
            let body = prog.func(func).body;
            let init = prog.insert_at_head(
                body,
                StmtKind::Move { dst: copy, src: Rvalue::Use(Operand::Sym(var)) },
            );
            prog.insert_at_head(body, StmtKind::Def(copy));
            for stmt in prog.fn_stmts(func) {
                if stmt == init {
                    continue;
                }
                prog.replace_sym_operands(stmt, var, copy);
                if let StmtKind::Move { dst, .. } = &mut prog.stmt_mut(stmt).kind
                    && *dst == var
                {
                    *dst = copy;
                }
            }
            vars.insert(copy);
            du = DefUse::build(prog);
            continue;
        }

        let heap_ty = prog.types.heap_type(data.ty);
        let accessed = du
            .defs_of(var)
            .iter()
            .chain(du.uses_of(var))
            .any(|&s| prog.stmt_is_live(s));
        if !data.is_global() && accessed {
            let SymOwner::Func(func) = data.owner else {
                panic!("Internal error: local '{}' has no owning function", data.name);
            };
            let decl = prog
                .fn_stmts(func)
                .into_iter()
                .find(|&s| prog.stmt(s).kind == StmtKind::Def(var))
                .unwrap_or_else(|| {
                    panic!("Internal error: no declaration point for '{}'", data.name)
                });
            prog.insert_after(
                decl,
                StmtKind::Move {
                    dst: var,
                    src: Rvalue::prim(Prim::HereAlloc, [Operand::Type(heap_ty)]),
                },
            );
            heap_allocated.push(var);
        }

        rewrite_defs_through_box(prog, var, &du, data.ty);
        rewrite_uses_through_box(prog, var, heap_ty, &du, data.ty);
        prog.sym_mut(var).ty = heap_ty;
        // the rewrites copy rvalues into fresh statements; a variable
        // promoted later must see those statements among its uses
        du = DefUse::build(prog);
    }
    heap_allocated
}

fn rewrite_defs_through_box(prog: &mut Program, var: SymRef, du: &DefUse, value_ty: TypeRef) {
    for def in du.defs_of(var).to_vec() {
        if !prog.stmt_is_live(def) {
            continue;
        }
        let func = prog.stmt_func(def);
        let kind = prog.stmt(def).kind.clone();
        match kind {
            StmtKind::Move { dst, src } if dst == var => {
                let tmp = prog.new_temp(func, "heapsrc", value_ty);
                prog.insert_before(def, StmtKind::Def(tmp));
                prog.insert_before(def, StmtKind::Move { dst: tmp, src });
                prog.set_stmt_kind(
                    def,
                    StmtKind::Eval(Rvalue::prim(
                        Prim::SetMember,
                        [
                            Operand::Sym(var),
                            Operand::int(HEAP_FIELD_VALUE as i64),
                            Operand::Sym(tmp),
                        ],
                    )),
                );
            }
            kind => {
                // The stack slot's autoDestroy is meaningless once the
                // value lives in a box; the box is freed explicitly.
                if let Some(callee) = kind.called_func()
                    && prog.func(callee).flags.contains(FnFlags::AUTO_DESTROY_FN)
                {
                    prog.remove_stmt(def);
                    continue;
                }
                // by-ref call actual: pass the boxed value through a temp
                let tmp = prog.new_temp(func, "heapval", value_ty);
                prog.insert_before(def, StmtKind::Def(tmp));
                prog.insert_before(
                    def,
                    StmtKind::Move {
                        dst: tmp,
                        src: Rvalue::prim(
                            Prim::GetMemberValue,
                            [Operand::Sym(var), Operand::int(HEAP_FIELD_VALUE as i64)],
                        ),
                    },
                );
                prog.replace_sym_operands(def, var, tmp);
            }
        }
    }
}

fn rewrite_uses_through_box(
    prog: &mut Program,
    var: SymRef,
    heap_ty: TypeRef,
    du: &DefUse,
    value_ty: TypeRef,
) {
    let field = Operand::int(HEAP_FIELD_VALUE as i64);
    for use_ in du.uses_of(var).to_vec() {
        if !prog.stmt_is_live(use_) {
            continue;
        }
        let func = prog.stmt_func(use_);
        let kind = prog.stmt(use_).kind.clone();

        // address-of folds into the box pointer or a field reference
        if let StmtKind::Move { dst, src: Rvalue::Prim(Prim::AddrOf, args) } = &kind
            && args.first() == Some(&Operand::Sym(var))
        {
            let dst = *dst;
            let src = if prog.sym(dst).ty == heap_ty {
                Rvalue::Use(Operand::Sym(var))
            } else {
                Rvalue::prim(Prim::GetMember, [Operand::Sym(var), field.clone()])
            };
            prog.set_stmt_kind(use_, StmtKind::Move { dst, src });
            continue;
        }

        // call actual: pass the box through when the formal expects it
        if let Some(rv @ Rvalue::Call { args, .. }) = kind.rvalue() {
            let mut wants_value = false;
            for (idx, arg) in args.iter().enumerate() {
                if *arg == Operand::Sym(var)
                    && prog.sym(prog.actual_to_formal(rv, idx)).ty != heap_ty
                {
                    wants_value = true;
                }
            }
            if wants_value {
                let tmp = prog.new_temp(func, "heapval", value_ty);
                prog.insert_before(use_, StmtKind::Def(tmp));
                prog.insert_before(
                    use_,
                    StmtKind::Move {
                        dst: tmp,
                        src: Rvalue::prim(
                            Prim::GetMemberValue,
                            [Operand::Sym(var), field.clone()],
                        ),
                    },
                );
                prog.replace_sym_operands(use_, var, tmp);
            }
            continue;
        }

        // base of a member access: the access needs a reference to the
        // boxed value, not a copy of it
        if let Some(Rvalue::Prim(p, args)) = kind.rvalue()
            && p.is_member_access()
            && args.first() == Some(&Operand::Sym(var))
        {
            let ref_ty = prog.types.ref_type(value_ty);
            let tmp = prog.new_temp(func, "heapref", ref_ty);
            prog.insert_before(use_, StmtKind::Def(tmp));
            prog.insert_before(
                use_,
                StmtKind::Move {
                    dst: tmp,
                    src: Rvalue::prim(Prim::GetMember, [Operand::Sym(var), field.clone()]),
                },
            );
            if let Some(Rvalue::Prim(_, args)) = prog.stmt_mut(use_).kind.rvalue_mut() {
                args[0] = Operand::Sym(tmp);
            }
            continue;
        }

        // plain value read
        let tmp = prog.new_temp(func, "heapval", value_ty);
        prog.insert_before(use_, StmtKind::Def(tmp));
        prog.insert_before(
            use_,
            StmtKind::Move {
                dst: tmp,
                src: Rvalue::prim(Prim::GetMemberValue, [Operand::Sym(var), field.clone()]),
            },
        );
        prog.replace_sym_operands(use_, var, tmp);
    }
}

/// Frees the boxes whose pointer provably never reaches a spawned task:
/// at the innermost block enclosing all uses, or before every return
/// when that block is the function body.
fn free_heap_allocated_vars(prog: &mut Program, heap_vars: Vec<SymRef>) {
    let mut task_reachable: WorkList<FuncRef> = WorkList::new();
    for f in prog.all_funcs() {
        if prog.func(f).is_task_fn() {
            task_reachable.insert(f);
        }
    }
    let sites = prog.compute_call_sites();
    let mut i = 0;
    while i < task_reachable.len() {
        let f = task_reachable.items[i];
        i += 1;
        for &call in sites.get(&f).map_or(&[][..], Vec::as_slice) {
            if prog.stmt_is_live(call) {
                task_reachable.insert(prog.stmt_func(call));
            }
        }
    }

    let du = DefUse::build(prog);
    'vars: for var in heap_vars {
        let defs: Vec<StmtRef> = du
            .defs_of(var)
            .iter()
            .copied()
            .filter(|&d| prog.stmt_is_live(d))
            .collect();
        if defs.len() != 1 {
            continue;
        }
        // follow copies of the box pointer; freeing is safe only when no
        // alias can reach a task function or one of its callers
        let mut tracked: WorkList<SymRef> = WorkList::new();
        tracked.insert(var);
        let mut j = 0;
        while j < tracked.len() {
            let v = tracked.items[j];
            j += 1;
            for &use_ in du.uses_of(v) {
                if !prog.stmt_is_live(use_) {
                    continue;
                }
                let kind = &prog.stmt(use_).kind;
                if let Some(callee) = kind.called_func() {
                    if task_reachable.contains(&callee) {
                        continue 'vars;
                    }
                    continue;
                }
                if let StmtKind::Move { dst, src } = kind {
                    let aliases = match src {
                        Rvalue::Use(Operand::Sym(s)) => *s == v,
                        Rvalue::Prim(
                            Prim::AddrOf
                            | Prim::GetMember
                            | Prim::GetMemberValue
                            | Prim::WideGetLocale
                            | Prim::WideGetNode,
                            args,
                        ) => args.first() == Some(&Operand::Sym(v)),
                        _ => false,
                    };
                    if aliases {
                        tracked.insert(*dst);
                    }
                }
            }
        }

        let uses: Vec<StmtRef> = du
            .uses_of(var)
            .iter()
            .copied()
            .filter(|&u| prog.stmt_is_live(u))
            .collect();
        let Some((&head, rest)) = uses.split_first() else {
            panic!(
                "Internal error: heap-allocated '{}' has no uses",
                prog.sym(var).name
            );
        };
        let mut lca = prog.stmt(head).block;
        for &u in rest {
            lca = prog.block_lca(lca, prog.stmt(u).block);
        }
        let func = prog.stmt_func(defs[0]);
        let free = StmtKind::Eval(Rvalue::prim(Prim::HereFree, [Operand::Sym(var)]));
        if lca == prog.func(func).body {
            for ret in prog.returns_of(func) {
                prog.insert_before(ret, free.clone());
            }
        } else {
            prog.push_stmt(lca, free.clone());
        }
    }
}

// ---- step 2: end counts ----

fn endcount_local(
    prog: &mut Program,
    locals: &mut HashMap<FuncRef, SymRef>,
    queue: &mut Vec<FuncRef>,
    func: FuncRef,
    ty: TypeRef,
) -> SymRef {
    if let Some(&ec) = locals.get(&func) {
        return ec;
    }
    let body = prog.func(func).body;
    let local = prog.add_local(func, "_endCount", ty, SymFlags::TEMP);
    if Some(func) == prog.entry_fn {
        // the root task owns its end count outright
        prog.insert_at_head(body, StmtKind::Def(local));
    } else {
        let formal = prog.add_formal(func, "_endCount", ty);
        prog.insert_at_head(
            body,
            StmtKind::Move { dst: local, src: Rvalue::Use(Operand::Sym(formal)) },
        );
        prog.insert_at_head(body, StmtKind::Def(local));
        queue.push(func);
    }
    locals.insert(func, local);
    local
}

fn insert_end_counts(prog: &mut Program) {
    let mut locals: HashMap<FuncRef, SymRef> = HashMap::new();
    let mut queue: Vec<FuncRef> = Vec::new();

    for stmt in prog.all_stmts() {
        let kind = prog.stmt(stmt).kind.clone();
        match kind {
            StmtKind::Move { dst, src: Rvalue::Prim(Prim::GetEndCount, _) } => {
                let func = prog.stmt_func(stmt);
                let ty = prog.sym(dst).ty;
                let ec = endcount_local(prog, &mut locals, &mut queue, func, ty);
                prog.set_stmt_kind(
                    stmt,
                    StmtKind::Move { dst, src: Rvalue::Use(Operand::Sym(ec)) },
                );
            }
            StmtKind::Eval(Rvalue::Prim(Prim::SetEndCount, args)) => {
                let func = prog.stmt_func(stmt);
                let val = args[0].clone();
                let ty = prog.operand_ty(&val);
                let ec = endcount_local(prog, &mut locals, &mut queue, func, ty);
                prog.set_stmt_kind(stmt, StmtKind::Move { dst: ec, src: Rvalue::Use(val) });
            }
            _ => {}
        }
    }

    // thread the new formal through every caller, transitively
    let sites = prog.compute_call_sites();
    let mut i = 0;
    while i < queue.len() {
        let func = queue[i];
        i += 1;
        let ty = prog.sym(locals[&func]).ty;
        for &call in sites.get(&func).map_or(&[][..], Vec::as_slice) {
            if !prog.stmt_is_live(call) {
                continue;
            }
            let caller = prog.stmt_func(call);
            let caller_ec = endcount_local(prog, &mut locals, &mut queue, caller, ty);
            if let Some(Rvalue::Call { args, .. }) = prog.stmt_mut(call).kind.rvalue_mut() {
                args.push(Operand::Sym(caller_ec));
            }
        }
    }
    log::debug!("threaded end counts through {} functions", locals.len());
}

// ---- step 3: argument bundling ----

/// Per-task-function bundling state. Both halves are created at the
/// first call site processed and shared by every later one.
#[derive(Default)]
struct BundleInfo {
    ctype: Option<TypeRef>,
    wrap_fn: Option<FuncRef>,
}

fn pass_args_to_nested_fns(prog: &mut Program, task_fns: &[FuncRef]) {
    let sites = prog.compute_call_sites();
    for &func in task_fns {
        let mut info = BundleInfo::default();
        for &call in sites.get(&func).map_or(&[][..], Vec::as_slice) {
            if !prog.stmt_is_live(call) {
                continue;
            }
            bundle_args(prog, call, func, &mut info);
        }
        if prog.func(func).flags.contains(FnFlags::ON) {
            strip_locale_formal(prog, func);
        }
    }
}

fn bundle_args(prog: &mut Program, call: StmtRef, func: FuncRef, info: &mut BundleInfo) {
    let first = info.ctype.is_none();
    let Some(Rvalue::Call { args, .. }) = prog.stmt(call).kind.rvalue() else {
        panic!("Internal error: task call site is not a call");
    };
    let args = args.clone();
    let ctype = match info.ctype {
        Some(t) => t,
        None => {
            let t = create_arg_bundle_class(prog, func, &args);
            info.ctype = Some(t);
            t
        }
    };

    let caller = prog.stmt_func(call);
    let fname = prog.func(func).name.clone();
    let tempc = prog.new_temp(caller, &format!("_args_for_{fname}"), ctype);
    prog.insert_before(call, StmtKind::Def(tempc));
    prog.insert_before(
        call,
        StmtKind::Move {
            dst: tempc,
            src: Rvalue::prim(Prim::HereAlloc, [Operand::Type(ctype)]),
        },
    );
    for (i, arg) in args.iter().enumerate() {
        let value = autocopy_task_arg(prog, call, func, i, arg, first);
        prog.insert_before(
            call,
            StmtKind::Eval(Rvalue::prim(
                Prim::SetMember,
                [Operand::Sym(tempc), Operand::int(i as i64), value],
            )),
        );
    }

    let wrap = match info.wrap_fn {
        Some(w) => w,
        None => {
            let w = create_block_fn_wrapper(prog, func, ctype);
            info.wrap_fn = Some(w);
            w
        }
    };

    if prog.func(func).flags.contains(FnFlags::ON) {
        let locale = args.first().cloned().unwrap_or_else(|| {
            panic!("Internal error: on-function '{fname}' call has no locale actual")
        });
        prog.insert_before(
            call,
            StmtKind::Eval(Rvalue::Call { func: wrap, args: vec![locale, Operand::Sym(tempc)] }),
        );
        // the fork primitive copies the bundle to the remote locale, so
        // the spawner's copy can go right away
        prog.insert_before(
            call,
            StmtKind::Eval(Rvalue::prim(Prim::HereFree, [Operand::Sym(tempc)])),
        );
    } else {
        prog.insert_before(
            call,
            StmtKind::Eval(Rvalue::Call { func: wrap, args: vec![Operand::Sym(tempc)] }),
        );
    }
    prog.remove_stmt(call);
}

/// One bundle class per task function, fields named `_<i>_<actual>` in
/// actual order.
fn create_arg_bundle_class(prog: &mut Program, func: FuncRef, args: &[Operand]) -> TypeRef {
    let mut fields = Vec::with_capacity(args.len());
    for (i, arg) in args.iter().enumerate() {
        let sym = arg.as_sym().unwrap_or_else(|| {
            panic!(
                "Internal error: task call to '{}' passes a non-symbol actual",
                prog.func(func).name
            )
        });
        prog.sym_mut(sym).flags |= SymFlags::CONCURRENTLY_ACCESSED;
        let data = prog.sym(sym);
        fields.push(Field { name: format_smolstr!("_{i}_{}", data.name), ty: data.ty });
    }
    let name = format_smolstr!("_class_locals_{}", prog.func(func).name);
    prog.types.add_class(
        name,
        ClassKind::Class,
        fields,
        TypeFlags::NO_OBJECT | TypeFlags::NO_WIDE_CLASS,
    )
}

/// Keeps a captured value alive until the spawned task is done with it.
/// Only `begin` and non-blocking `on` need this: every other task shape
/// blocks the spawning frame. Copies are inserted at every call site;
/// the matching destroys go into the task function once, at its cleanup
/// anchors.
fn autocopy_task_arg(
    prog: &mut Program,
    call: StmtRef,
    func: FuncRef,
    index: usize,
    arg: &Operand,
    first: bool,
) -> Operand {
    let Some(var) = arg.as_sym() else { return arg.clone() };
    let fflags = prog.func(func).flags;
    let outlives = fflags.contains(FnFlags::BEGIN)
        || (fflags.contains(FnFlags::ON) && fflags.contains(FnFlags::NON_BLOCKING));
    if !outlives {
        return arg.clone();
    }

    let arg_ty = prog.sym(var).ty;
    let base = prog.types.value_type(arg_ty);
    let caller = prog.stmt_func(call);

    if prog.ref_counted.contains(&base) {
        let copy_fn = *prog.auto_copy.get(&base).unwrap_or_else(|| {
            panic!(
                "Internal error: ref-counted type '{}' has no autoCopy",
                prog.types.name(base)
            )
        });
        let destroy_fn = *prog.auto_destroy.get(&base).unwrap_or_else(|| {
            panic!(
                "Internal error: ref-counted type '{}' has no autoDestroy",
                prog.types.name(base)
            )
        });
        let through_ref = arg_ty != base;
        let result = if through_ref {
            // bump the count through the reference; the bundle still
            // carries the reference itself
            let tmp = prog.new_temp(caller, "deref", base);
            prog.insert_before(call, StmtKind::Def(tmp));
            prog.insert_before(
                call,
                StmtKind::Move { dst: tmp, src: Rvalue::prim(Prim::Deref, [Operand::Sym(var)]) },
            );
            prog.insert_before(
                call,
                StmtKind::Eval(Rvalue::Call { func: copy_fn, args: vec![Operand::Sym(tmp)] }),
            );
            Operand::Sym(var)
        } else {
            let tmp = prog.new_temp(caller, "autocopy", base);
            prog.sym_mut(tmp).flags |= SymFlags::NECESSARY_AUTO_COPY;
            prog.insert_before(call, StmtKind::Def(tmp));
            prog.insert_before(
                call,
                StmtKind::Move {
                    dst: tmp,
                    src: Rvalue::Call { func: copy_fn, args: vec![Operand::Sym(var)] },
                },
            );
            Operand::Sym(tmp)
        };
        if first {
            insert_task_arg_destroys(prog, func, index, destroy_fn, through_ref, base);
        }
        return result;
    }

    if prog.types.is_record(base) && arg_ty == base {
        let Some(&copy_fn) = prog.auto_copy.get(&base) else { return arg.clone() };
        let tmp = prog.new_temp(caller, "autocopy", base);
        prog.insert_before(call, StmtKind::Def(tmp));
        prog.insert_before(
            call,
            StmtKind::Move {
                dst: tmp,
                src: Rvalue::Call { func: copy_fn, args: vec![Operand::Sym(var)] },
            },
        );
        if first {
            let destroy_fn = *prog.auto_destroy.get(&base).unwrap_or_else(|| {
                panic!(
                    "Internal error: record '{}' has autoCopy but no autoDestroy",
                    prog.types.name(base)
                )
            });
            insert_task_arg_destroys(prog, func, index, destroy_fn, false, base);
        }
        return Operand::Sym(tmp);
    }

    arg.clone()
}

fn insert_task_arg_destroys(
    prog: &mut Program,
    func: FuncRef,
    index: usize,
    destroy_fn: FuncRef,
    through_ref: bool,
    base: TypeRef,
) {
    let formal = prog.func(func).formals[index];
    for anchor in prog.cleanup_anchors(func) {
        if through_ref {
            let tmp = prog.new_temp(func, "deref", base);
            prog.insert_before(anchor, StmtKind::Def(tmp));
            prog.insert_before(
                anchor,
                StmtKind::Move {
                    dst: tmp,
                    src: Rvalue::prim(Prim::Deref, [Operand::Sym(formal)]),
                },
            );
            prog.insert_before(
                anchor,
                StmtKind::Eval(Rvalue::Call { func: destroy_fn, args: vec![Operand::Sym(tmp)] }),
            );
        } else {
            prog.insert_before(
                anchor,
                StmtKind::Eval(Rvalue::Call {
                    func: destroy_fn,
                    args: vec![Operand::Sym(formal)],
                }),
            );
        }
    }
}

/// Synthesizes `wrap_<fn>`: unpack every bundle field into a temp, call
/// the task function, free the bundle (spawner-side for `on`), return.
fn create_block_fn_wrapper(prog: &mut Program, func: FuncRef, ctype: TypeRef) -> FuncRef {
    let fflags = prog.func(func).flags;
    let fname = prog.func(func).name.clone();
    let mut wflags = FnFlags::empty();
    if fflags.contains(FnFlags::BEGIN) {
        wflags |= FnFlags::BEGIN_BLOCK;
    }
    if fflags.contains(FnFlags::COBEGIN_OR_COFORALL) {
        wflags |= FnFlags::COBEGIN_OR_COFORALL_BLOCK;
    }
    if fflags.contains(FnFlags::ON) {
        wflags |= FnFlags::ON_BLOCK;
    }
    if fflags.contains(FnFlags::NON_BLOCKING) {
        wflags |= FnFlags::NON_BLOCKING;
    }
    let void_ = prog.types.builtins.void_;
    let wrap = prog.add_func(format_smolstr!("wrap_{fname}"), void_, wflags);
    let on = fflags.contains(FnFlags::ON);
    if on {
        // the fork primitive consumes a leading locale formal; code
        // generation strips it from the wrapper's own signature
        let locale = prog.func(func).formals[0];
        let (lname, lty) = {
            let d = prog.sym(locale);
            (d.name.clone(), d.ty)
        };
        prog.add_formal(wrap, lname, lty);
    }
    let wrap_c = prog.add_formal(wrap, "c", ctype);
    let body = prog.func(wrap).body;
    let unpacked: Vec<(smol_str::SmolStr, TypeRef)> = prog
        .types
        .fields(ctype)
        .iter()
        .map(|f| (f.name.clone(), f.ty))
        .collect();
    let mut call_args = Vec::new();
    for (i, (field_name, field_ty)) in unpacked.into_iter().enumerate() {
        if on && i == 0 {
            // field 0 holds the target locale; the body already runs there
            continue;
        }
        let tmp = prog.add_local(wrap, field_name, field_ty, SymFlags::TEMP);
        prog.push_stmt(body, StmtKind::Def(tmp));
        prog.push_stmt(
            body,
            StmtKind::Move {
                dst: tmp,
                src: Rvalue::prim(
                    Prim::GetMemberValue,
                    [Operand::Sym(wrap_c), Operand::int(i as i64)],
                ),
            },
        );
        call_args.push(Operand::Sym(tmp));
    }
    prog.push_stmt(body, StmtKind::Eval(Rvalue::Call { func, args: call_args }));
    if !on {
        prog.push_stmt(
            body,
            StmtKind::Eval(Rvalue::prim(Prim::HereFree, [Operand::Sym(wrap_c)])),
        );
    }
    prog.push_stmt(body, StmtKind::Return(Operand::Void));
    wrap
}

/// After every call site moved to the wrapper, an on-function no longer
/// receives its target locale; drop the formal and whatever still
/// mentions it.
fn strip_locale_formal(prog: &mut Program, func: FuncRef) {
    let locale = prog.func(func).formals[0];
    for stmt in prog.fn_stmts(func) {
        let mentions = prog
            .stmt(stmt)
            .kind
            .operands()
            .iter()
            .any(|op| **op == Operand::Sym(locale));
        if mentions {
            prog.remove_stmt(stmt);
        }
    }
    prog.func_mut(func).formals.remove(0);
}

#[cfg(test)]
mod testing {
    use super::*;
    use crate::testing::{begin_task_case, record_capture_case};
    use crate::{config::TargetConfig, ir::BlockKind};

    fn bundle_types(prog: &Program) -> Vec<TypeRef> {
        prog.types
            .all_types()
            .into_iter()
            .filter(|&t| prog.types.name(t).starts_with("_class_locals_"))
            .collect()
    }

    fn wrapper_fns(prog: &Program) -> Vec<FuncRef> {
        prog.all_funcs()
            .into_iter()
            .filter(|&f| prog.func(f).name.starts_with("wrap_"))
            .collect()
    }

    #[test]
    fn one_bundle_and_wrapper_shared_by_all_spawn_sites() {
        let mut case = begin_task_case(3);
        parallel(&mut case.prog, &TargetConfig::default());
        let prog = &case.prog;

        let bundles = bundle_types(prog);
        assert_eq!(bundles.len(), 1);
        // one field per actual of the spawn
        assert_eq!(prog.types.fields(bundles[0]).len(), 1);

        let wrappers = wrapper_fns(prog);
        assert_eq!(wrappers.len(), 1);
        assert!(prog.func(wrappers[0]).flags.contains(FnFlags::BEGIN_BLOCK));

        // every original spawn site was swung over to the wrapper
        for &call in &case.calls {
            assert!(!prog.stmt_is_live(call));
        }
        let sites = prog.compute_call_sites();
        assert_eq!(sites.get(&wrappers[0]).map(Vec::len), Some(3));
    }

    #[test]
    fn wrapper_unpacks_frees_and_returns() {
        let mut case = begin_task_case(1);
        parallel(&mut case.prog, &TargetConfig::default());
        let prog = &case.prog;
        let wrap = wrapper_fns(prog)[0];

        let stmts = prog.fn_stmts(wrap);
        let mut saw_unpack = false;
        let mut saw_free = false;
        let mut saw_task_call = false;
        for &s in &stmts {
            match prog.stmt(s).kind.rvalue() {
                Some(Rvalue::Prim(Prim::GetMemberValue, _)) => saw_unpack = true,
                Some(Rvalue::Prim(Prim::HereFree, _)) => saw_free = true,
                Some(Rvalue::Call { func, .. }) if *func == case.task_fn => {
                    saw_task_call = true
                }
                _ => {}
            }
        }
        assert!(saw_unpack && saw_free && saw_task_call);
        assert!(matches!(
            prog.stmt(*stmts.last().unwrap()).kind,
            StmtKind::Return(Operand::Void)
        ));
    }

    #[test]
    fn record_capture_copies_per_site_and_destroys_once_per_exit() {
        // two spawn sites, task body with an early return: two copies in
        // the caller, one destroy per return path, inserted exactly once
        let mut case = record_capture_case(2, true);
        parallel(&mut case.prog, &TargetConfig::default());
        let prog = &case.prog;

        let copy_calls = prog
            .all_stmts()
            .into_iter()
            .filter(|&s| prog.stmt(s).kind.called_func() == Some(case.auto_copy))
            .count();
        assert_eq!(copy_calls, 2);

        let destroys: Vec<StmtRef> = prog
            .fn_stmts(case.task_fn)
            .into_iter()
            .filter(|&s| prog.stmt(s).kind.called_func() == Some(case.auto_destroy))
            .collect();
        let returns = prog.returns_of(case.task_fn);
        assert_eq!(destroys.len(), returns.len());
        assert_eq!(returns.len(), 2);

        // the record travels by value; nothing forces it into a heap box
        assert!(prog.types.heap_type_for(case.record).is_none());
    }

    #[test]
    fn coforall_index_is_promoted_to_a_heap_box() {
        let mut prog = Program::new();
        let void_ = prog.types.builtins.void_;
        let int_ = prog.types.builtins.int_;
        let rec = prog.types.add_class(
            "R",
            ClassKind::Record,
            vec![Field { name: "f".into(), ty: int_ }],
            TypeFlags::empty(),
        );

        let consume = prog.add_func("consume", void_, FnFlags::empty());
        prog.add_formal(consume, "v", rec);
        prog.push_stmt(prog.func(consume).body, StmtKind::Return(Operand::Void));

        let main = prog.add_func("chpl_gen_main", void_, FnFlags::empty());
        prog.entry_fn = Some(main);
        let body = prog.func(main).body;
        let src = prog.add_local(main, "src", rec, SymFlags::empty());
        prog.push_stmt(body, StmtKind::Def(src));
        let idx = prog.add_local(main, "i", rec, SymFlags::COFORALL_INDEX);
        prog.push_stmt(body, StmtKind::Def(idx));
        prog.push_stmt(
            body,
            StmtKind::Move { dst: idx, src: Rvalue::Use(Operand::Sym(src)) },
        );
        let call = prog.push_stmt(
            body,
            StmtKind::Eval(Rvalue::Call { func: consume, args: vec![Operand::Sym(idx)] }),
        );
        prog.push_stmt(body, StmtKind::Return(Operand::Void));

        parallel(&mut prog, &TargetConfig::default());

        let idx_ty = prog.sym(idx).ty;
        assert!(prog.types.flags(idx_ty).contains(TypeFlags::HEAP));
        assert_eq!(prog.types.heap_type_for(rec), Some(idx_ty));

        // the write goes through the box, the read comes back out of it
        let writes = prog
            .fn_stmts(main)
            .into_iter()
            .filter(|&s| {
                matches!(
                    prog.stmt(s).kind.rvalue(),
                    Some(Rvalue::Prim(Prim::SetMember, args))
                        if args.first() == Some(&Operand::Sym(idx))
                )
            })
            .count();
        assert_eq!(writes, 1);
        if let Some(Rvalue::Call { args, .. }) = prog.stmt(call).kind.rvalue() {
            assert_ne!(args[0], Operand::Sym(idx));
        } else {
            panic!("call was rewritten away");
        }
        // an allocation follows the declaration point
        let allocs = prog
            .fn_stmts(main)
            .into_iter()
            .filter(|&s| {
                matches!(
                    prog.stmt(s).kind,
                    StmtKind::Move { dst, src: Rvalue::Prim(Prim::HereAlloc, _) } if dst == idx
                )
            })
            .count();
        assert_eq!(allocs, 1);
    }

    #[test]
    fn end_count_becomes_a_threaded_formal() {
        let mut prog = Program::new();
        let void_ = prog.types.builtins.void_;
        let int_ = prog.types.builtins.int_;

        let helper = prog.add_func("spawn_helper", void_, FnFlags::empty());
        let hbody = prog.func(helper).body;
        let ec = prog.add_local(helper, "ec", int_, SymFlags::empty());
        prog.push_stmt(hbody, StmtKind::Def(ec));
        prog.push_stmt(
            hbody,
            StmtKind::Move { dst: ec, src: Rvalue::prim(Prim::GetEndCount, []) },
        );
        prog.push_stmt(hbody, StmtKind::Return(Operand::Void));

        let main = prog.add_func("chpl_gen_main", void_, FnFlags::empty());
        prog.entry_fn = Some(main);
        let body = prog.func(main).body;
        let call = prog.push_stmt(
            body,
            StmtKind::Eval(Rvalue::Call { func: helper, args: vec![] }),
        );
        prog.push_stmt(body, StmtKind::Return(Operand::Void));

        parallel(&mut prog, &TargetConfig::default());

        // the helper grew a trailing formal and the caller passes its own
        // local through it
        assert_eq!(prog.func(helper).formals.len(), 1);
        let formal = prog.func(helper).formals[0];
        assert_eq!(prog.sym(formal).name, "_endCount");
        if let Some(Rvalue::Call { args, .. }) = prog.stmt(call).kind.rvalue() {
            assert_eq!(args.len(), 1);
        } else {
            panic!("helper call lost its shape");
        }
        // the entry function owns its count without a formal
        assert!(prog.func(main).formals.is_empty());
    }

    #[test]
    fn constant_global_is_broadcast_not_heaped() {
        let mut prog = Program::new();
        let void_ = prog.types.builtins.void_;
        let int_ = prog.types.builtins.int_;

        let init = prog.add_func("chpl__init_M", void_, FnFlags::empty());
        prog.module_init_fn = Some(init);
        let body = prog.func(init).body;
        let g = prog.add_global("answer", int_, SymFlags::CONST);
        prog.push_stmt(
            body,
            StmtKind::Move { dst: g, src: Rvalue::Use(Operand::int(42)) },
        );
        prog.push_stmt(body, StmtKind::Return(Operand::Void));

        parallel(&mut prog, &TargetConfig::default());

        let broadcasts = prog
            .fn_stmts(init)
            .into_iter()
            .filter(|&s| {
                matches!(
                    prog.stmt(s).kind.rvalue(),
                    Some(Rvalue::Prim(Prim::PrivateBroadcast, args))
                        if args.first() == Some(&Operand::Sym(g))
                )
            })
            .count();
        assert_eq!(broadcasts, 1);
        assert_eq!(prog.sym(g).ty, int_);
    }

    #[test]
    fn global_initialized_from_another_global_reads_through_both_boxes() {
        // promoting `a` first copies its initializer into a fresh
        // statement still reading `b` directly; promoting `b` must pick
        // that statement up and route the read through b's box
        let mut prog = Program::new();
        let void_ = prog.types.builtins.void_;
        let int_ = prog.types.builtins.int_;
        let cls = prog.types.add_class(
            "C",
            ClassKind::Class,
            vec![Field { name: "f".into(), ty: int_ }],
            TypeFlags::empty(),
        );

        let init = prog.add_func("chpl__init_M", void_, FnFlags::empty());
        prog.module_init_fn = Some(init);
        let a = prog.add_global("a", cls, SymFlags::empty());
        let b = prog.add_global("b", cls, SymFlags::empty());
        let body = prog.func(init).body;
        prog.push_stmt(
            body,
            StmtKind::Move { dst: a, src: Rvalue::Use(Operand::Sym(b)) },
        );
        prog.push_stmt(body, StmtKind::Return(Operand::Void));

        parallel(&mut prog, &TargetConfig::default());

        assert!(prog.types.flags(prog.sym(a).ty).contains(TypeFlags::HEAP));
        assert!(prog.types.flags(prog.sym(b).ty).contains(TypeFlags::HEAP));

        // no surviving statement reads b's box pointer as a plain value
        let raw_reads = prog
            .all_stmts()
            .into_iter()
            .filter(|&s| {
                prog.stmt_is_live(s)
                    && matches!(
                        &prog.stmt(s).kind,
                        StmtKind::Move { src: Rvalue::Use(Operand::Sym(x)), .. } if *x == b
                    )
            })
            .count();
        assert_eq!(raw_reads, 0);
        let unboxed = prog
            .fn_stmts(init)
            .into_iter()
            .filter(|&s| {
                matches!(
                    prog.stmt(s).kind.rvalue(),
                    Some(Rvalue::Prim(Prim::GetMemberValue, args))
                        if args.first() == Some(&Operand::Sym(b))
                )
            })
            .count();
        assert_eq!(unboxed, 1);
    }

    #[test]
    fn on_fn_without_call_sites_still_loses_its_locale_formal() {
        let mut prog = Program::new();
        let void_ = prog.types.builtins.void_;
        let int_ = prog.types.builtins.int_;

        let on_fn = prog.add_func("on_fn", void_, FnFlags::ON);
        prog.add_formal(on_fn, "_dst_locale", int_);
        prog.add_formal(on_fn, "x", int_);
        prog.push_stmt(prog.func(on_fn).body, StmtKind::Return(Operand::Void));

        let main = prog.add_func("chpl_gen_main", void_, FnFlags::empty());
        prog.entry_fn = Some(main);
        prog.push_stmt(prog.func(main).body, StmtKind::Return(Operand::Void));

        parallel(&mut prog, &TargetConfig::default());

        let formals = &prog.func(on_fn).formals;
        assert_eq!(formals.len(), 1);
        assert_eq!(prog.sym(formals[0]).name, "x");
    }

    #[test]
    fn box_used_only_in_a_nested_block_is_freed_there() {
        let mut case = begin_task_case(1);
        let prog = &mut case.prog;
        let int_ = prog.types.builtins.int_;
        let rec = prog.types.add_class(
            "R",
            ClassKind::Record,
            vec![Field { name: "f".into(), ty: int_ }],
            TypeFlags::empty(),
        );
        // a coforall index only used inside a nested block of the entry fn
        let body = prog.func(case.entry).body;
        let ret = *prog.block(body).stmts.last().unwrap();
        let contained = prog.add_local(case.entry, "j", rec, SymFlags::COFORALL_INDEX);
        prog.insert_before(ret, StmtKind::Def(contained));
        let inner = prog.add_block(body, BlockKind::Normal);
        prog.insert_before(ret, StmtKind::Child(inner));
        let sink = prog.add_local(case.entry, "sink", rec, SymFlags::empty());
        prog.push_stmt(inner, StmtKind::Def(sink));
        prog.push_stmt(
            inner,
            StmtKind::Move { dst: sink, src: Rvalue::Use(Operand::Sym(contained)) },
        );

        parallel(&mut case.prog, &TargetConfig::default());
        let prog = &case.prog;

        // every use sits inside `inner`, so the free lands there
        let frees_in_inner = prog
            .block_stmts(inner)
            .into_iter()
            .filter(|&s| {
                matches!(
                    prog.stmt(s).kind.rvalue(),
                    Some(Rvalue::Prim(Prim::HereFree, args))
                        if args.first() == Some(&Operand::Sym(contained))
                )
            })
            .count();
        assert_eq!(frees_in_inner, 1);
    }
}
