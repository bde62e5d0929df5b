//! Wide reference construction.
//!
//! On multi-locale targets every class pointer and every reference may
//! name memory on another locale, so both are reshaped into wide records
//! carrying a locale half next to the address half. The pass builds the
//! wide counterpart types, retypes functions, symbols and fields, patches
//! the statement shapes the new representations invalidate, and emits the
//! startup function that places module-level heap boxes and exchanges
//! their addresses across locales.
//!
//! On single-locale targets only the startup stub is emitted and the IR
//! keeps its narrow types.

use crate::{
    config::TargetConfig,
    ir::{
        BlockKind, FnFlags, FuncRef, Immediate, Operand, Prim, Program, Rvalue, StmtKind, StmtRef,
        SymFlags, SymOwner, SymRef, TypeFlags, TypeKind, TypeRef, TypeStore,
    },
};

pub fn insert_wide_references(prog: &mut Program, cfg: &TargetConfig) {
    let startup = heap_allocate_globals_head(prog, cfg);
    if !cfg.require_wide_refs() {
        return;
    }
    // collected before widening obscures the heap flag behind wide types
    let heap_vars = get_heap_vars(prog);
    convert_nil_to_object(prog);
    build_wide_classes(prog);
    widen_classes(prog);
    build_wide_refs(prog);
    widen_refs(prog);
    insert_element_access_temps(prog);
    narrow_wide_classes_through_calls(prog, cfg);
    insert_wide_class_temps_for_nil(prog);
    insert_wide_cast_temps(prog);
    deref_wide_string_actuals(prog);
    deref_wide_refs_to_wide_classes(prog);
    heap_allocate_globals_tail(prog, startup, &heap_vars);
    move_address_sources_to_temp(prog);
}

// ---- startup function ----

fn heap_allocate_globals_head(prog: &mut Program, cfg: &TargetConfig) -> FuncRef {
    let void_ = prog.types.builtins.void_;
    let f = prog.add_func(
        "chpl__heapAllocateGlobals",
        void_,
        FnFlags::EXPORT | FnFlags::LOCAL_ARGS,
    );
    prog.startup_fn = Some(f);
    if !cfg.require_wide_refs() {
        prog.push_stmt(prog.func(f).body, StmtKind::Return(Operand::Void));
    }
    f
}

/// Globals whose type became a heap box during task lowering.
fn get_heap_vars(prog: &Program) -> Vec<SymRef> {
    prog.globals
        .iter()
        .copied()
        .filter(|&g| prog.types.flags(prog.sym(g).ty).contains(TypeFlags::HEAP))
        .collect()
}

/// Node 0 allocates every global's box, registers each under its
/// declaration-order index, and one collective broadcast hands the
/// addresses to every other locale.
fn heap_allocate_globals_tail(prog: &mut Program, startup: FuncRef, heap_vars: &[SymRef]) {
    let body = prog.func(startup).body;
    let int_ = prog.types.builtins.int_;
    let bool_ = prog.types.builtins.bool_;

    let node = prog.new_temp(startup, "node", int_);
    prog.push_stmt(body, StmtKind::Def(node));
    prog.push_stmt(
        body,
        StmtKind::Move { dst: node, src: Rvalue::prim(Prim::NodeId, []) },
    );
    let is_root = prog.new_temp(startup, "is_root", bool_);
    prog.push_stmt(body, StmtKind::Def(is_root));
    prog.push_stmt(
        body,
        StmtKind::Move {
            dst: is_root,
            src: Rvalue::prim(Prim::Equal, [Operand::Sym(node), Operand::int(0)]),
        },
    );

    let alloc_blk = prog.add_block(body, BlockKind::Normal);
    for &g in heap_vars {
        let gty = prog.sym(g).ty;
        let alloc_ty = if prog.types.is_wide(gty) {
            prog.types.wide_addr_type(gty)
        } else {
            gty
        };
        prog.push_stmt(
            alloc_blk,
            StmtKind::Move {
                dst: g,
                src: Rvalue::prim(Prim::HereAlloc, [Operand::Type(alloc_ty)]),
            },
        );
    }
    prog.push_stmt(
        body,
        StmtKind::Cond { cond: Operand::Sym(is_root), then_blk: alloc_blk },
    );
    for (i, &g) in heap_vars.iter().enumerate() {
        prog.push_stmt(
            body,
            StmtKind::Eval(Rvalue::prim(
                Prim::HeapRegisterGlobal,
                [Operand::int(i as i64), Operand::Sym(g)],
            )),
        );
    }
    prog.push_stmt(
        body,
        StmtKind::Eval(Rvalue::prim(
            Prim::HeapBroadcastGlobals,
            [Operand::int(heap_vars.len() as i64)],
        )),
    );
    prog.push_stmt(body, StmtKind::Return(Operand::Void));
    log::debug!("placed {} globals on the heap", heap_vars.len());
}

// ---- nil normalization ----

/// Variables of the sentinel nil type vanish: writes to them are
/// dropped, reads become the literal, and nil-typed returns become
/// object-typed.
fn convert_nil_to_object(prog: &mut Program) {
    let nil = prog.types.builtins.nil;
    let object = prog.types.builtins.object;
    for f in prog.all_funcs() {
        if prog.func(f).ret_type == nil {
            prog.func_mut(f).ret_type = object;
        }
    }
    let nil_syms: std::collections::HashSet<SymRef> = prog
        .syms
        .iter()
        .filter(|(_, d)| d.ty == nil)
        .map(|(h, _)| SymRef(h))
        .collect();
    for stmt in prog.all_stmts() {
        if !prog.stmt_is_live(stmt) {
            continue;
        }
        match &prog.stmt(stmt).kind {
            StmtKind::Def(s) if nil_syms.contains(s) => {
                prog.remove_stmt(stmt);
                continue;
            }
            StmtKind::Move { dst, .. } if nil_syms.contains(dst) => {
                prog.remove_stmt(stmt);
                continue;
            }
            _ => {}
        }
        for op in prog.stmt_mut(stmt).kind.operands_mut() {
            if let Operand::Sym(s) = op
                && nil_syms.contains(s)
            {
                *op = Operand::Nil;
            }
        }
    }
}

// ---- type graph widening ----

fn build_wide_classes(prog: &mut Program) {
    if prog.types.wide_class_count() != 0 {
        panic!("Internal error: wide classes built twice");
    }
    for t in prog.types.all_types() {
        let flags = prog.types.flags(t);
        if prog.types.is_class(t)
            && !flags.intersects(
                TypeFlags::REF
                    | TypeFlags::WIDE
                    | TypeFlags::WIDE_CLASS
                    | TypeFlags::NO_WIDE_CLASS,
            )
        {
            prog.types.make_wide_class(t);
        }
    }
    // the string payload lives on whichever locale built it
    let string = prog.types.builtins.string;
    prog.types.make_wide_class(string);
    log::debug!("built {} wide classes", prog.types.wide_class_count());
}

fn build_wide_refs(prog: &mut Program) {
    for t in prog.types.all_types() {
        let flags = prog.types.flags(t);
        if flags.contains(TypeFlags::REF) && !flags.contains(TypeFlags::WIDE) {
            prog.types.make_wide_ref(t);
        }
    }
    log::debug!("built {} wide references", prog.types.wide_ref_count());
}

/// True when a symbol must keep its narrow type: extern symbols and the
/// formals of extern functions belong to the C side of the fence.
fn keeps_narrow_type(prog: &Program, sym: SymRef) -> bool {
    let data = prog.sym(sym);
    if data.flags.contains(SymFlags::EXTERN) {
        return true;
    }
    if data.is_formal()
        && let SymOwner::Func(f) = data.owner
        && prog.func(f).flags.contains(FnFlags::EXTERN)
    {
        return true;
    }
    false
}

fn retype_with(prog: &mut Program, map: impl Fn(&TypeStore, TypeRef) -> Option<TypeRef>) {
    for f in prog.all_funcs() {
        let fd = prog.func(f);
        if fd.flags.intersects(FnFlags::EXTERN | FnFlags::LOCAL_ARGS) {
            continue;
        }
        if let Some(w) = map(&prog.types, fd.ret_type) {
            prog.func_mut(f).ret_type = w;
        }
    }
    let syms: Vec<SymRef> = prog.syms.iter().map(|(h, _)| SymRef(h)).collect();
    for s in syms {
        if keeps_narrow_type(prog, s) {
            continue;
        }
        if let Some(w) = map(&prog.types, prog.sym(s).ty) {
            prog.sym_mut(s).ty = w;
        }
    }
    // field types, except inside the wide records themselves: their
    // narrow halves are the whole point
    let mut updates: Vec<(TypeRef, usize, TypeRef)> = Vec::new();
    for t in prog.types.all_types() {
        if prog.types.is_wide(t) {
            continue;
        }
        let TypeKind::Class { fields, .. } = &prog.types.get(t).kind else { continue };
        for (i, field) in fields.iter().enumerate() {
            if let Some(w) = map(&prog.types, field.ty) {
                updates.push((t, i, w));
            }
        }
    }
    for (t, i, w) in updates {
        if let TypeKind::Class { fields, .. } = &mut prog.types.get_mut(t).kind {
            fields[i].ty = w;
        }
    }
}

fn widen_classes(prog: &mut Program) {
    retype_with(prog, |types, ty| types.wide_class_for(ty));
    // references now point at the wide form
    for t in prog.types.all_types() {
        if prog.types.flags(t).contains(TypeFlags::WIDE) {
            continue;
        }
        let TypeKind::Ref { value } = &prog.types.get(t).kind else { continue };
        let value = *value;
        if let Some(w) = prog.types.wide_class_for(value)
            && let TypeKind::Ref { value } = &mut prog.types.get_mut(t).kind
        {
            *value = w;
        }
    }
}

fn widen_refs(prog: &mut Program) {
    retype_with(prog, |types, ty| types.wide_ref_for(ty));
}

// ---- statement repair ----

fn set_rvalue_arg(prog: &mut Program, stmt: StmtRef, index: usize, op: Operand) {
    match prog.stmt_mut(stmt).kind.rvalue_mut() {
        Some(Rvalue::Call { args, .. }) => args[index] = op,
        Some(Rvalue::Prim(_, args)) => args[index] = op,
        _ => panic!("Internal error: statement has no arguments to rewrite"),
    }
}

fn hoist_literal(prog: &mut Program, stmt: StmtRef, lit: Operand, ty: TypeRef) -> SymRef {
    let func = prog.stmt_func(stmt);
    let tmp = prog.new_temp(func, "wide_str", ty);
    prog.insert_before(stmt, StmtKind::Def(tmp));
    prog.insert_before(stmt, StmtKind::Move { dst: tmp, src: Rvalue::Use(lit) });
    tmp
}

/// A string literal is a narrow value; wherever one flows into a
/// position that now expects the wide string record, it goes through a
/// temp first.
fn insert_element_access_temps(prog: &mut Program) {
    let wide_string = prog
        .types
        .wide_string()
        .unwrap_or_else(|| panic!("Internal error: wide string type was never built"));
    for stmt in prog.all_stmts() {
        if !prog.stmt_is_live(stmt) {
            continue;
        }
        let kind = prog.stmt(stmt).kind.clone();
        let Some(rv) = kind.rvalue() else { continue };
        match rv {
            Rvalue::Call { func: callee, args } => {
                if prog
                    .func(*callee)
                    .flags
                    .intersects(FnFlags::EXTERN | FnFlags::LOCAL_ARGS)
                {
                    continue;
                }
                for (i, arg) in args.iter().enumerate() {
                    if !matches!(arg, Operand::Imm(Immediate::Str(_))) {
                        continue;
                    }
                    let formal_ty = prog.sym(prog.actual_to_formal(rv, i)).ty;
                    if prog.types.is_wide_string(formal_ty) {
                        let tmp = hoist_literal(prog, stmt, arg.clone(), wide_string);
                        set_rvalue_arg(prog, stmt, i, Operand::Sym(tmp));
                    }
                }
            }
            Rvalue::Prim(Prim::SetMember, args) => {
                if !matches!(&args[2], Operand::Imm(Immediate::Str(_))) {
                    continue;
                }
                let base_ty = prog.operand_val_ty(&args[0]);
                let field_ty = prog.types.field(base_ty, args[1].as_field_index()).ty;
                if prog.types.is_wide_string(field_ty) {
                    let tmp = hoist_literal(prog, stmt, args[2].clone(), field_ty);
                    set_rvalue_arg(prog, stmt, 2, Operand::Sym(tmp));
                }
            }
            Rvalue::Prim(Prim::ArraySetFirst, args) => {
                if matches!(&args[1], Operand::Imm(Immediate::Str(_))) {
                    let tmp = hoist_literal(prog, stmt, args[1].clone(), wide_string);
                    set_rvalue_arg(prog, stmt, 1, Operand::Sym(tmp));
                }
            }
            _ => {}
        }
    }
}

/// Calls into the local-args surface (extern and exported functions)
/// take narrow values. Each wide actual is narrowed into a temp before
/// the call and written back after it; pointers whose representation
/// already matches are checked for locality and passed through.
fn narrow_wide_classes_through_calls(prog: &mut Program, cfg: &TargetConfig) {
    for stmt in prog.all_stmts() {
        if !prog.stmt_is_live(stmt) {
            continue;
        }
        let kind = prog.stmt(stmt).kind.clone();
        let Some(Rvalue::Call { func: callee, args }) = kind.rvalue() else { continue };
        if !prog.func(*callee).flags.contains(FnFlags::LOCAL_ARGS) {
            continue;
        }
        let caller = prog.stmt_func(stmt);
        for (i, arg) in args.iter().enumerate() {
            let Some(sym) = arg.as_sym() else { continue };
            let wide_ty = prog.sym(sym).ty;
            if !prog.types.is_wide(wide_ty) {
                continue;
            }
            let narrow_ty = prog.types.wide_addr_type(wide_ty);
            let narrow_flags = prog.types.flags(narrow_ty);
            let var = prog.new_temp(caller, "narrow", narrow_ty);
            prog.insert_before(stmt, StmtKind::Def(var));
            let same_repr = (prog.types.flags(wide_ty).contains(TypeFlags::WIDE_CLASS)
                && narrow_flags.contains(TypeFlags::EXTERN))
                || prog.types.is_ref_wide_string(narrow_ty);
            if same_repr {
                if !cfg.no_local_checks {
                    prog.insert_before(
                        stmt,
                        StmtKind::Eval(Rvalue::prim(Prim::LocalCheck, [Operand::Sym(sym)])),
                    );
                }
                prog.insert_before(
                    stmt,
                    StmtKind::Move { dst: var, src: Rvalue::Use(Operand::Sym(sym)) },
                );
            } else if narrow_flags.intersects(TypeFlags::REF | TypeFlags::DATA_CLASS) {
                prog.insert_before(
                    stmt,
                    StmtKind::Move { dst: var, src: Rvalue::Use(Operand::Sym(sym)) },
                );
            } else {
                prog.insert_before(
                    stmt,
                    StmtKind::Move {
                        dst: var,
                        src: Rvalue::prim(Prim::Deref, [Operand::Sym(sym)]),
                    },
                );
            }
            // the callee may have written through the narrow form
            prog.insert_after(
                stmt,
                StmtKind::Move { dst: sym, src: Rvalue::Use(Operand::Sym(var)) },
            );
            set_rvalue_arg(prog, stmt, i, Operand::Sym(var));
        }
    }
}

/// One step through the pointer graph: wide form to its address half,
/// reference to its value.
fn pointee_type(types: &TypeStore, ty: TypeRef) -> TypeRef {
    let t = if types.flags(ty).contains(TypeFlags::WIDE) {
        types.wide_addr_type(ty)
    } else {
        ty
    };
    match &types.get(t).kind {
        TypeKind::Ref { value } => *value,
        _ => t,
    }
}

/// The nil literal has no wide representation; positions that now hold
/// wide records receive it through a typed temp.
fn insert_wide_class_temps_for_nil(prog: &mut Program) {
    for stmt in prog.all_stmts() {
        if !prog.stmt_is_live(stmt) {
            continue;
        }
        let func = prog.stmt_func(stmt);
        let kind = prog.stmt(stmt).kind.clone();

        if let Some(rv @ Rvalue::Call { args, .. }) = kind.rvalue() {
            for (i, arg) in args.iter().enumerate() {
                if *arg != Operand::Nil {
                    continue;
                }
                let formal_ty = prog.sym(prog.actual_to_formal(rv, i)).ty;
                if prog.types.is_wide(formal_ty) {
                    let tmp = prog.new_temp(func, "nil", formal_ty);
                    prog.insert_before(stmt, StmtKind::Def(tmp));
                    prog.insert_before(
                        stmt,
                        StmtKind::Move { dst: tmp, src: Rvalue::Use(Operand::Nil) },
                    );
                    set_rvalue_arg(prog, stmt, i, Operand::Sym(tmp));
                }
            }
            continue;
        }

        match kind {
            // storing nil through a wide reference to a wide class needs
            // the wide-class shape on the right-hand side
            StmtKind::Move { dst, src: Rvalue::Use(Operand::Nil) } => {
                let dty = prog.sym(dst).ty;
                if !prog.types.flags(dty).contains(TypeFlags::WIDE) {
                    continue;
                }
                let vt = pointee_type(&prog.types, dty);
                if prog.types.flags(vt).contains(TypeFlags::WIDE_CLASS) {
                    let tmp = prog.new_temp(func, "nil", vt);
                    prog.insert_before(stmt, StmtKind::Def(tmp));
                    prog.insert_before(
                        stmt,
                        StmtKind::Move { dst: tmp, src: Rvalue::Use(Operand::Nil) },
                    );
                    prog.set_stmt_kind(
                        stmt,
                        StmtKind::Move { dst, src: Rvalue::Use(Operand::Sym(tmp)) },
                    );
                }
            }
            StmtKind::Eval(Rvalue::Prim(Prim::SetMember, args)) if args[2] == Operand::Nil => {
                let base_ty = prog.operand_val_ty(&args[0]);
                let field_ty = prog.types.field(base_ty, args[1].as_field_index()).ty;
                if prog.types.is_wide(field_ty) {
                    let tmp = prog.new_temp(func, "nil", field_ty);
                    prog.insert_before(stmt, StmtKind::Def(tmp));
                    prog.insert_before(
                        stmt,
                        StmtKind::Move { dst: tmp, src: Rvalue::Use(Operand::Nil) },
                    );
                    set_rvalue_arg(prog, stmt, 2, Operand::Sym(tmp));
                }
            }
            StmtKind::Return(Operand::Nil) => {
                let ret_ty = prog.func(func).ret_type;
                if prog.types.is_wide(ret_ty) {
                    let tmp = prog.new_temp(func, "nil", ret_ty);
                    prog.insert_before(stmt, StmtKind::Def(tmp));
                    prog.insert_before(
                        stmt,
                        StmtKind::Move { dst: tmp, src: Rvalue::Use(Operand::Nil) },
                    );
                    prog.set_stmt_kind(stmt, StmtKind::Return(Operand::Sym(tmp)));
                }
            }
            _ => {}
        }
    }
}

/// A cast produces the named target type; when the destination variable
/// was widened past it, the result lands in a temp of the cast's own
/// type first.
fn insert_wide_cast_temps(prog: &mut Program) {
    for stmt in prog.all_stmts() {
        if !prog.stmt_is_live(stmt) {
            continue;
        }
        let StmtKind::Move { dst, src: src @ Rvalue::Prim(Prim::Cast, _) } =
            prog.stmt(stmt).kind.clone()
        else {
            continue;
        };
        let Rvalue::Prim(_, args) = &src else { unreachable!() };
        let Operand::Type(target) = args[0] else { continue };
        if prog.sym(dst).ty == target {
            continue;
        }
        let func = prog.stmt_func(stmt);
        let tmp = prog.new_temp(func, "cast", target);
        prog.insert_before(stmt, StmtKind::Def(tmp));
        prog.insert_before(stmt, StmtKind::Move { dst: tmp, src });
        prog.set_stmt_kind(
            stmt,
            StmtKind::Move { dst, src: Rvalue::Use(Operand::Sym(tmp)) },
        );
    }
}

/// Cast machinery reads string payloads directly, so wide string actuals
/// of casts are dereferenced into narrow temps.
fn deref_wide_string_actuals(prog: &mut Program) {
    let string = prog.types.builtins.string;
    for stmt in prog.all_stmts() {
        if !prog.stmt_is_live(stmt) {
            continue;
        }
        let kind = prog.stmt(stmt).kind.clone();
        let Some(Rvalue::Prim(Prim::Cast, args)) = kind.rvalue() else { continue };
        let func = prog.stmt_func(stmt);
        for (i, arg) in args.iter().enumerate() {
            if let Some(s) = arg.as_sym()
                && prog.types.is_wide_string(prog.sym(s).ty)
            {
                let tmp = prog.new_temp(func, "narrow_str", string);
                prog.insert_before(stmt, StmtKind::Def(tmp));
                prog.insert_before(
                    stmt,
                    StmtKind::Move { dst: tmp, src: Rvalue::prim(Prim::Deref, [arg.clone()]) },
                );
                set_rvalue_arg(prog, stmt, i, Operand::Sym(tmp));
            }
        }
    }
}

/// Member access wants its base in a single representation. A wide
/// reference to a wide class is two indirections; collapse the outer one
/// into a temp first.
fn deref_wide_refs_to_wide_classes(prog: &mut Program) {
    for stmt in prog.all_stmts() {
        if !prog.stmt_is_live(stmt) {
            continue;
        }
        let kind = prog.stmt(stmt).kind.clone();
        let Some(Rvalue::Prim(p, args)) = kind.rvalue() else { continue };
        if !p.is_member_access() {
            continue;
        }
        let Some(base) = args.first().and_then(Operand::as_sym) else { continue };
        let base_ty = prog.sym(base).ty;
        if !prog.types.flags(base_ty).contains(TypeFlags::WIDE) {
            continue;
        }
        let vt = pointee_type(&prog.types, base_ty);
        if prog.types.flags(vt).contains(TypeFlags::WIDE_CLASS) {
            let func = prog.stmt_func(stmt);
            let tmp = prog.new_temp(func, "wide_obj", vt);
            prog.insert_before(stmt, StmtKind::Def(tmp));
            prog.insert_before(
                stmt,
                StmtKind::Move { dst: tmp, src: Rvalue::prim(Prim::Deref, [Operand::Sym(base)]) },
            );
            set_rvalue_arg(prog, stmt, 0, Operand::Sym(tmp));
        }
    }
}

/// Code generation builds a wide pointer out of an address it can take;
/// a source symbol that is exactly the narrow half moves through a temp
/// whose address is local.
fn move_address_sources_to_temp(prog: &mut Program) {
    for stmt in prog.all_stmts() {
        if !prog.stmt_is_live(stmt) {
            continue;
        }
        let StmtKind::Move { dst, src: Rvalue::Use(Operand::Sym(s)) } =
            prog.stmt(stmt).kind.clone()
        else {
            continue;
        };
        let dty = prog.sym(dst).ty;
        if !prog.types.flags(dty).intersects(TypeFlags::WIDE | TypeFlags::REF) {
            continue;
        }
        let vt = pointee_type(&prog.types, dty);
        if prog.types.flags(vt).contains(TypeFlags::WIDE_CLASS)
            && prog.sym(s).ty == prog.types.wide_addr_type(vt)
        {
            let func = prog.stmt_func(stmt);
            let tmp = prog.new_temp(func, "addr_src", prog.sym(s).ty);
            prog.insert_before(stmt, StmtKind::Def(tmp));
            prog.insert_before(
                stmt,
                StmtKind::Move { dst: tmp, src: Rvalue::Use(Operand::Sym(s)) },
            );
            prog.set_stmt_kind(
                stmt,
                StmtKind::Move { dst, src: Rvalue::Use(Operand::Sym(tmp)) },
            );
        }
    }
}

#[cfg(test)]
mod testing {
    use super::*;
    use crate::config::TargetConfig;
    use crate::passes::parallel::parallel;
    use crate::testing::class_with_int_field;

    fn multi() -> TargetConfig {
        TargetConfig::multi_locale()
    }

    fn single() -> TargetConfig {
        TargetConfig::single_locale()
    }

    #[test]
    fn single_locale_startup_is_a_stub() {
        let mut prog = Program::new();
        let void_ = prog.types.builtins.void_;
        let _c = class_with_int_field(&mut prog, "C");
        let main = prog.add_func("chpl_gen_main", void_, FnFlags::empty());
        prog.entry_fn = Some(main);
        prog.push_stmt(prog.func(main).body, StmtKind::Return(Operand::Void));

        insert_wide_references(&mut prog, &single());

        let startup = prog.startup_fn.expect("startup function missing");
        let stmts = prog.fn_stmts(startup);
        assert_eq!(stmts.len(), 1);
        assert!(matches!(prog.stmt(stmts[0]).kind, StmtKind::Return(Operand::Void)));
        assert_eq!(prog.types.wide_class_count(), 0);
        assert_eq!(prog.types.wide_ref_count(), 0);
    }

    #[test]
    fn class_vars_and_returns_are_widened_but_extern_stays_narrow() {
        let mut prog = Program::new();
        let c = class_with_int_field(&mut prog, "C");

        let getter = prog.add_func("get_c", c, FnFlags::empty());
        let v = prog.add_local(getter, "v", c, SymFlags::empty());
        let gbody = prog.func(getter).body;
        prog.push_stmt(gbody, StmtKind::Def(v));
        prog.push_stmt(gbody, StmtKind::Return(Operand::Sym(v)));

        let ext = prog.add_func("c_make", c, FnFlags::EXTERN);
        let ext_arg = prog.add_formal(ext, "p", c);

        insert_wide_references(&mut prog, &multi());

        let wide_c = prog.types.wide_class_for(c).expect("no wide class for C");
        assert_eq!(prog.func(getter).ret_type, wide_c);
        assert_eq!(prog.sym(v).ty, wide_c);
        assert_eq!(prog.func(ext).ret_type, c);
        assert_eq!(prog.sym(ext_arg).ty, c);
    }

    #[test]
    fn heap_globals_get_ordered_startup_allocation_and_one_broadcast() {
        let mut prog = Program::new();
        let void_ = prog.types.builtins.void_;
        let c = class_with_int_field(&mut prog, "C");

        let init = prog.add_func("chpl__init_M", void_, FnFlags::empty());
        prog.module_init_fn = Some(init);
        let a = prog.add_global("a", c, SymFlags::empty());
        let b = prog.add_global("b", c, SymFlags::empty());
        let body = prog.func(init).body;
        let seed = prog.add_local(init, "seed", c, SymFlags::empty());
        prog.push_stmt(body, StmtKind::Def(seed));
        prog.push_stmt(body, StmtKind::Move { dst: a, src: Rvalue::Use(Operand::Sym(seed)) });
        prog.push_stmt(body, StmtKind::Move { dst: b, src: Rvalue::Use(Operand::Sym(seed)) });
        prog.push_stmt(body, StmtKind::Return(Operand::Void));

        let cfg = multi();
        parallel(&mut prog, &cfg);
        // task lowering boxed both globals
        assert!(prog.types.flags(prog.sym(a).ty).contains(TypeFlags::HEAP));

        insert_wide_references(&mut prog, &cfg);

        let startup = prog.startup_fn.unwrap();
        let stmts = prog.fn_stmts(startup);
        let mut registers = Vec::new();
        let mut allocs = Vec::new();
        let mut broadcasts = Vec::new();
        for &s in &stmts {
            match prog.stmt(s).kind.rvalue() {
                Some(Rvalue::Prim(Prim::HeapRegisterGlobal, args)) => {
                    registers.push((args[0].clone(), args[1].clone()))
                }
                Some(Rvalue::Prim(Prim::HereAlloc, _)) => {
                    if let StmtKind::Move { dst, .. } = prog.stmt(s).kind {
                        allocs.push(dst);
                    }
                }
                Some(Rvalue::Prim(Prim::HeapBroadcastGlobals, args)) => {
                    broadcasts.push(args[0].clone())
                }
                _ => {}
            }
        }
        // declaration order fixes the registration indices
        assert_eq!(
            registers,
            vec![
                (Operand::int(0), Operand::Sym(a)),
                (Operand::int(1), Operand::Sym(b)),
            ]
        );
        assert_eq!(allocs, vec![a, b]);
        assert_eq!(broadcasts, vec![Operand::int(2)]);
        // allocations run under the node-0 guard only
        let top: Vec<StmtRef> = prog.block(prog.func(startup).body).stmts.clone();
        assert!(top.iter().all(|&s| {
            !matches!(prog.stmt(s).kind.rvalue(), Some(Rvalue::Prim(Prim::HereAlloc, _)))
        }));
        assert!(top.iter().any(|&s| matches!(prog.stmt(s).kind, StmtKind::Cond { .. })));
    }

    #[test]
    fn local_args_call_narrows_checks_and_writes_back() {
        let mut prog = Program::new();
        let void_ = prog.types.builtins.void_;
        let c = class_with_int_field(&mut prog, "C");
        prog.types.get_mut(c).flags |= TypeFlags::EXTERN;

        let ext = prog.add_func("c_consume", void_, FnFlags::EXTERN | FnFlags::LOCAL_ARGS);
        prog.add_formal(ext, "p", c);

        let main = prog.add_func("chpl_gen_main", void_, FnFlags::empty());
        prog.entry_fn = Some(main);
        let body = prog.func(main).body;
        let v = prog.add_local(main, "v", c, SymFlags::empty());
        prog.push_stmt(body, StmtKind::Def(v));
        let call = prog.push_stmt(
            body,
            StmtKind::Eval(Rvalue::Call { func: ext, args: vec![Operand::Sym(v)] }),
        );
        prog.push_stmt(body, StmtKind::Return(Operand::Void));

        insert_wide_references(&mut prog, &multi());

        // v itself was widened, the call actual was not
        assert!(prog.types.is_wide(prog.sym(v).ty));
        let Some(Rvalue::Call { args, .. }) = prog.stmt(call).kind.rvalue() else {
            panic!("call lost its shape");
        };
        let narrow = args[0].as_sym().expect("actual must be a symbol");
        assert_ne!(narrow, v);
        assert_eq!(prog.sym(narrow).ty, c);

        // locality check before, write-back after
        let stmts = prog.block(body).stmts.clone();
        let pos = stmts.iter().position(|&s| s == call).unwrap();
        assert!(stmts[..pos].iter().any(|&s| {
            matches!(
                prog.stmt(s).kind.rvalue(),
                Some(Rvalue::Prim(Prim::LocalCheck, args))
                    if args.first() == Some(&Operand::Sym(v))
            )
        }));
        assert!(matches!(
            &prog.stmt(stmts[pos + 1]).kind,
            StmtKind::Move { dst, src: Rvalue::Use(Operand::Sym(s)) }
                if *dst == v && *s == narrow
        ));
    }

    #[test]
    fn nil_typed_variables_collapse_to_the_literal() {
        let mut prog = Program::new();
        let void_ = prog.types.builtins.void_;
        let nil = prog.types.builtins.nil;
        let c = class_with_int_field(&mut prog, "C");

        let main = prog.add_func("chpl_gen_main", void_, FnFlags::empty());
        prog.entry_fn = Some(main);
        let body = prog.func(main).body;
        let n = prog.add_local(main, "n", nil, SymFlags::empty());
        let x = prog.add_local(main, "x", c, SymFlags::empty());
        let def_n = prog.push_stmt(body, StmtKind::Def(n));
        prog.push_stmt(body, StmtKind::Def(x));
        let mv = prog.push_stmt(
            body,
            StmtKind::Move { dst: x, src: Rvalue::Use(Operand::Sym(n)) },
        );
        prog.push_stmt(body, StmtKind::Return(Operand::Void));

        insert_wide_references(&mut prog, &multi());

        assert!(!prog.stmt_is_live(def_n));
        assert!(matches!(
            &prog.stmt(mv).kind,
            StmtKind::Move { src: Rvalue::Use(Operand::Nil), .. }
        ));
    }
}
