//! Locality narrowing.
//!
//! Inside a `local` block every wide pointer provably addresses
//! same-locale memory, so accesses can drop the locale half: the wide
//! operand is narrowed into a temp (after an optional runtime locality
//! check) and the access runs on the narrow form. Functions called from
//! a local context are cloned once into a `_local_` variant whose body
//! is narrowed the same way; the clone cache maps each original to its
//! clone and each clone to itself, so re-encountering either is a no-op.

use crate::{
    config::TargetConfig,
    ir::{
        BlockKind, BlockRef, FnFlags, FuncRef, Operand, Prim, Program, Rvalue, StmtKind, StmtRef,
        SymRef, TypeFlags,
    },
};
use smol_str::format_smolstr;
use std::collections::{HashMap, VecDeque};

pub fn handle_local_blocks(prog: &mut Program, cfg: &TargetConfig) {
    if !cfg.require_wide_refs() {
        return;
    }
    let mut queue: VecDeque<BlockRef> = prog
        .blocks
        .iter()
        .filter(|(_, b)| b.kind == BlockKind::Local)
        .map(|(h, _)| BlockRef(h))
        .collect();
    log::debug!("narrowing {} local blocks", queue.len());
    let mut cache: HashMap<FuncRef, FuncRef> = HashMap::new();
    while let Some(block) = queue.pop_front() {
        for stmt in prog.block_stmts(block) {
            if !prog.stmt_is_live(stmt) {
                continue;
            }
            localize_access(prog, cfg, stmt);
            let Some(callee) = prog.stmt(stmt).kind.called_func() else { continue };
            if let Some(&local) = cache.get(&callee) {
                set_called_func(prog, stmt, local);
                continue;
            }
            if prog
                .func(callee)
                .flags
                .intersects(FnFlags::EXTERN | FnFlags::LOCAL_ARGS)
            {
                continue;
            }
            let local = clone_function(prog, callee);
            let name = format_smolstr!("_local_{}", prog.func(callee).name);
            prog.func_mut(local).name = name;
            prog.func_mut(local).flags |= FnFlags::LOCAL_FN;
            cache.insert(callee, local);
            // a clone is its own local version
            cache.insert(local, local);
            set_called_func(prog, stmt, local);
            narrow_local_return(prog, cfg, local);
            queue.push_back(prog.func(local).body);
        }
    }
}

fn set_called_func(prog: &mut Program, stmt: StmtRef, func: FuncRef) {
    if let Some(Rvalue::Call { func: f, .. }) = prog.stmt_mut(stmt).kind.rvalue_mut() {
        *f = func;
    }
}

/// Narrows `sym` into a fresh temp right before `anchor`, preceded by a
/// runtime locality check unless checks are disabled.
fn insert_local_temp(prog: &mut Program, cfg: &TargetConfig, anchor: StmtRef, sym: SymRef) -> SymRef {
    let wide_ty = prog.sym(sym).ty;
    if !prog.types.is_wide(wide_ty) {
        panic!("Internal error: localizing non-wide '{}'", prog.sym(sym).name);
    }
    let narrow = prog.types.wide_addr_type(wide_ty);
    let func = prog.stmt_func(anchor);
    let name = format_smolstr!("local_{}", prog.sym(sym).name);
    let var = prog.new_temp(func, &name, narrow);
    if !cfg.no_local_checks {
        prog.insert_before(
            anchor,
            StmtKind::Eval(Rvalue::prim(Prim::LocalCheck, [Operand::Sym(sym)])),
        );
    }
    prog.insert_before(anchor, StmtKind::Def(var));
    prog.insert_before(
        anchor,
        StmtKind::Move { dst: var, src: Rvalue::Use(Operand::Sym(sym)) },
    );
    var
}

fn wide_sym(prog: &Program, op: &Operand) -> Option<SymRef> {
    let s = op.as_sym()?;
    prog.types.is_wide(prog.sym(s).ty).then_some(s)
}

fn set_prim_arg(prog: &mut Program, stmt: StmtRef, index: usize, op: Operand) {
    if let Some(Rvalue::Prim(_, args)) = prog.stmt_mut(stmt).kind.rvalue_mut() {
        args[index] = op;
    }
}

/// Rewrites one statement of a local context so its memory accesses run
/// on narrow pointers.
fn localize_access(prog: &mut Program, cfg: &TargetConfig, stmt: StmtRef) {
    let kind = prog.stmt(stmt).kind.clone();
    match kind {
        StmtKind::Eval(Rvalue::Prim(
            Prim::ArraySet
            | Prim::ArraySetFirst
            | Prim::SetMember
            | Prim::SetCid
            | Prim::UnionSetId,
            args,
        )) => {
            if let Some(base) = wide_sym(prog, &args[0]) {
                let tmp = insert_local_temp(prog, cfg, stmt, base);
                set_prim_arg(prog, stmt, 0, Operand::Sym(tmp));
            }
        }
        StmtKind::Move { dst, src } => match src {
            Rvalue::Prim(Prim::Deref, args) => {
                let Some(base) = wide_sym(prog, &args[0]) else { return };
                let tmp = insert_local_temp(prog, cfg, stmt, base);
                let narrow_ty = prog.sym(tmp).ty;
                if prog.types.flags(narrow_ty).contains(TypeFlags::REF) {
                    set_prim_arg(prog, stmt, 0, Operand::Sym(tmp));
                } else {
                    // the narrow half of a wide string is the payload
                    if narrow_ty != prog.types.builtins.string {
                        panic!(
                            "Internal error: dereference of non-reference '{}'",
                            prog.types.name(narrow_ty)
                        );
                    }
                    prog.set_stmt_kind(
                        stmt,
                        StmtKind::Move { dst, src: Rvalue::Use(Operand::Sym(tmp)) },
                    );
                }
            }
            Rvalue::Prim(
                Prim::GetMember
                | Prim::GetMemberValue
                | Prim::UnionGetId
                | Prim::GetCid
                | Prim::TestCid,
                args,
            ) => {
                if let Some(base) = wide_sym(prog, &args[0]) {
                    let tmp = insert_local_temp(prog, cfg, stmt, base);
                    set_prim_arg(prog, stmt, 0, Operand::Sym(tmp));
                }
            }
            Rvalue::Prim(p @ (Prim::ArrayGet | Prim::ArrayGetValue), args) => {
                let Some(base) = wide_sym(prog, &args[0]) else { return };
                let tmp = insert_local_temp(prog, cfg, stmt, base);
                set_prim_arg(prog, stmt, 0, Operand::Sym(tmp));
                let dst_ty = prog.sym(dst).ty;
                if !prog.types.is_wide(dst_ty) {
                    return;
                }
                // the narrow access produces a narrow result; land it in
                // a matching temp and widen into the destination after
                let res_ty = if p == Prim::ArrayGet {
                    prog.types.wide_addr_type(dst_ty)
                } else {
                    dst_ty
                };
                let func = prog.stmt_func(stmt);
                let res_name = format_smolstr!("local_{}", prog.sym(dst).name);
                let res = prog.new_temp(func, &res_name, res_ty);
                prog.insert_before(stmt, StmtKind::Def(res));
                prog.insert_after(
                    stmt,
                    StmtKind::Move { dst, src: Rvalue::Use(Operand::Sym(res)) },
                );
                if let StmtKind::Move { dst: d, .. } = &mut prog.stmt_mut(stmt).kind {
                    *d = res;
                }
            }
            Rvalue::Prim(Prim::DynamicCast, args) => {
                let Some(obj) = wide_sym(prog, &args[1]) else { return };
                let tmp = insert_local_temp(prog, cfg, stmt, obj);
                set_prim_arg(prog, stmt, 1, Operand::Sym(tmp));
                let dst_ty = prog.sym(dst).ty;
                if prog.types.is_wide(dst_ty) {
                    prog.sym_mut(dst).ty = prog.types.wide_addr_type(dst_ty);
                }
            }
            _ => {}
        },
        _ => {}
    }
}

/// A clone called only from local contexts returns a narrow value; each
/// return site narrows its wide result and the signature follows.
fn narrow_local_return(prog: &mut Program, cfg: &TargetConfig, func: FuncRef) {
    let ret_ty = prog.func(func).ret_type;
    if !prog.types.is_wide(ret_ty) {
        return;
    }
    let narrow = prog.types.wide_addr_type(ret_ty);
    for ret in prog.returns_of(func) {
        let StmtKind::Return(op) = prog.stmt(ret).kind.clone() else { unreachable!() };
        let sym = op.as_sym().unwrap_or_else(|| {
            panic!(
                "Internal error: wide return of '{}' is not a symbol",
                prog.func(func).name
            )
        });
        let tmp = insert_local_temp(prog, cfg, ret, sym);
        prog.set_stmt_kind(ret, StmtKind::Return(Operand::Sym(tmp)));
    }
    prog.func_mut(func).ret_type = narrow;
}

// ---- function cloning ----

/// Deep-copies a function: fresh formals and locals, block tree rebuilt
/// with parents intact, every symbol operand remapped.
pub(crate) fn clone_function(prog: &mut Program, src: FuncRef) -> FuncRef {
    let srcd = prog.func(src).clone();
    let clone = prog.add_func(srcd.name.clone(), srcd.ret_type, srcd.flags);
    let mut map: HashMap<SymRef, SymRef> = HashMap::new();
    for &formal in &srcd.formals {
        let fd = prog.sym(formal).clone();
        let nf = prog.add_formal(clone, fd.name, fd.ty);
        prog.sym_mut(nf).flags = fd.flags;
        map.insert(formal, nf);
    }
    for stmt in prog.fn_stmts(src) {
        if let StmtKind::Def(s) = prog.stmt(stmt).kind {
            let sd = prog.sym(s).clone();
            let ns = prog.add_local(clone, sd.name, sd.ty, sd.flags);
            map.insert(s, ns);
        }
    }
    let clone_body = prog.func(clone).body;
    clone_block_into(prog, srcd.body, clone_body, &map);
    clone
}

fn map_operand(map: &HashMap<SymRef, SymRef>, op: &Operand) -> Operand {
    match op {
        Operand::Sym(s) => Operand::Sym(*map.get(s).unwrap_or(s)),
        other => other.clone(),
    }
}

fn map_rvalue(map: &HashMap<SymRef, SymRef>, rv: &Rvalue) -> Rvalue {
    match rv {
        Rvalue::Use(op) => Rvalue::Use(map_operand(map, op)),
        Rvalue::Prim(p, args) => {
            Rvalue::Prim(*p, args.iter().map(|a| map_operand(map, a)).collect())
        }
        Rvalue::Call { func, args } => Rvalue::Call {
            func: *func,
            args: args.iter().map(|a| map_operand(map, a)).collect(),
        },
    }
}

fn clone_block_into(
    prog: &mut Program,
    from: BlockRef,
    into: BlockRef,
    map: &HashMap<SymRef, SymRef>,
) {
    for stmt in prog.block(from).stmts.clone() {
        let kind = prog.stmt(stmt).kind.clone();
        match kind {
            StmtKind::Def(s) => {
                let s = *map.get(&s).unwrap_or(&s);
                prog.push_stmt(into, StmtKind::Def(s));
            }
            StmtKind::Move { dst, src } => {
                let dst = *map.get(&dst).unwrap_or(&dst);
                let src = map_rvalue(map, &src);
                prog.push_stmt(into, StmtKind::Move { dst, src });
            }
            StmtKind::Eval(rv) => {
                let rv = map_rvalue(map, &rv);
                prog.push_stmt(into, StmtKind::Eval(rv));
            }
            StmtKind::Return(op) => {
                let op = map_operand(map, &op);
                prog.push_stmt(into, StmtKind::Return(op));
            }
            StmtKind::Cond { cond, then_blk } => {
                let nb = prog.add_block(into, prog.block(then_blk).kind);
                clone_block_into(prog, then_blk, nb, map);
                let cond = map_operand(map, &cond);
                prog.push_stmt(into, StmtKind::Cond { cond, then_blk: nb });
            }
            StmtKind::Child(b) => {
                let nb = prog.add_block(into, prog.block(b).kind);
                clone_block_into(prog, b, nb, map);
                prog.push_stmt(into, StmtKind::Child(nb));
            }
        }
    }
}

#[cfg(test)]
mod testing {
    use super::*;
    use crate::config::TargetConfig;
    use crate::ir::{ClassKind, Field, SymFlags};
    use crate::passes::widen::insert_wide_references;
    use crate::testing::class_with_int_field;

    fn multi() -> TargetConfig {
        TargetConfig::default()
    }

    /// Entry function with `blocks` local blocks, each calling `callee`
    /// with the given actuals.
    fn entry_with_local_calls(
        prog: &mut Program,
        callee: FuncRef,
        actuals: Vec<Operand>,
        blocks: usize,
    ) -> (FuncRef, Vec<StmtRef>) {
        let void_ = prog.types.builtins.void_;
        let main = prog.add_func("chpl_gen_main", void_, FnFlags::empty());
        prog.entry_fn = Some(main);
        let body = prog.func(main).body;
        let mut calls = Vec::new();
        for _ in 0..blocks {
            let blk = prog.add_block(body, BlockKind::Local);
            calls.push(prog.push_stmt(
                blk,
                StmtKind::Eval(Rvalue::Call { func: callee, args: actuals.clone() }),
            ));
            prog.push_stmt(body, StmtKind::Child(blk));
        }
        prog.push_stmt(body, StmtKind::Return(Operand::Void));
        (main, calls)
    }

    #[test]
    fn functions_called_from_local_blocks_are_cloned_once() {
        let mut prog = Program::new();
        let void_ = prog.types.builtins.void_;
        let c = class_with_int_field(&mut prog, "C");

        let touch = prog.add_func("touch", void_, FnFlags::empty());
        prog.add_formal(touch, "obj", c);
        prog.push_stmt(prog.func(touch).body, StmtKind::Return(Operand::Void));

        let (_main, calls) = entry_with_local_calls(&mut prog, touch, vec![Operand::Nil], 2);

        let cfg = multi();
        insert_wide_references(&mut prog, &cfg);
        handle_local_blocks(&mut prog, &cfg);

        let clones: Vec<FuncRef> = prog
            .all_funcs()
            .into_iter()
            .filter(|&f| prog.func(f).flags.contains(FnFlags::LOCAL_FN))
            .collect();
        assert_eq!(clones.len(), 1);
        assert_eq!(prog.func(clones[0]).name, "_local_touch");
        for &call in &calls {
            assert_eq!(prog.stmt(call).kind.called_func(), Some(clones[0]));
        }
        // the original keeps its wide signature, the clone shares it
        assert_eq!(prog.func(touch).formals.len(), prog.func(clones[0]).formals.len());
    }

    #[test]
    fn array_store_in_local_block_is_checked_and_narrowed() {
        let mut prog = Program::new();
        let void_ = prog.types.builtins.void_;
        let int_ = prog.types.builtins.int_;
        let data = prog.types.add_class(
            "_ddata_int",
            ClassKind::Class,
            vec![Field { name: "elt".into(), ty: int_ }],
            TypeFlags::DATA_CLASS,
        );

        let main = prog.add_func("chpl_gen_main", void_, FnFlags::empty());
        prog.entry_fn = Some(main);
        let body = prog.func(main).body;
        let arr = prog.add_local(main, "arr", data, SymFlags::empty());
        prog.push_stmt(body, StmtKind::Def(arr));
        let blk = prog.add_block(body, BlockKind::Local);
        let store = prog.push_stmt(
            blk,
            StmtKind::Eval(Rvalue::prim(
                Prim::ArraySet,
                [Operand::Sym(arr), Operand::int(0), Operand::int(7)],
            )),
        );
        prog.push_stmt(body, StmtKind::Child(blk));
        prog.push_stmt(body, StmtKind::Return(Operand::Void));

        let cfg = multi();
        insert_wide_references(&mut prog, &cfg);
        assert!(prog.types.is_wide(prog.sym(arr).ty));
        handle_local_blocks(&mut prog, &cfg);

        // the store now runs on a narrow temp, guarded by a check
        let stmts = prog.block(blk).stmts.clone();
        let pos = stmts.iter().position(|&s| s == store).unwrap();
        let Some(Rvalue::Prim(Prim::ArraySet, args)) = prog.stmt(store).kind.rvalue() else {
            panic!("store lost its shape");
        };
        let narrow = args[0].as_sym().unwrap();
        assert_ne!(narrow, arr);
        assert_eq!(prog.sym(narrow).ty, data);
        assert!(stmts[..pos].iter().any(|&s| {
            matches!(
                prog.stmt(s).kind.rvalue(),
                Some(Rvalue::Prim(Prim::LocalCheck, args))
                    if args.first() == Some(&Operand::Sym(arr))
            )
        }));
    }

    #[test]
    fn wide_array_read_lands_in_a_narrow_temp_then_widens_back() {
        let mut prog = Program::new();
        let void_ = prog.types.builtins.void_;
        let c = class_with_int_field(&mut prog, "C");
        let data = prog.types.add_class(
            "_ddata_C",
            ClassKind::Class,
            vec![Field { name: "elt".into(), ty: c }],
            TypeFlags::DATA_CLASS,
        );
        let ref_c = prog.types.ref_type(c);

        let main = prog.add_func("chpl_gen_main", void_, FnFlags::empty());
        prog.entry_fn = Some(main);
        let body = prog.func(main).body;
        let arr = prog.add_local(main, "arr", data, SymFlags::empty());
        prog.push_stmt(body, StmtKind::Def(arr));
        let r = prog.add_local(main, "r", ref_c, SymFlags::empty());
        prog.push_stmt(body, StmtKind::Def(r));
        let blk = prog.add_block(body, BlockKind::Local);
        let load = prog.push_stmt(
            blk,
            StmtKind::Move {
                dst: r,
                src: Rvalue::prim(Prim::ArrayGet, [Operand::Sym(arr), Operand::int(0)]),
            },
        );
        prog.push_stmt(body, StmtKind::Child(blk));
        prog.push_stmt(body, StmtKind::Return(Operand::Void));

        let cfg = multi();
        insert_wide_references(&mut prog, &cfg);
        assert!(prog.types.is_wide(prog.sym(arr).ty));
        assert!(prog.types.is_wide(prog.sym(r).ty));
        handle_local_blocks(&mut prog, &cfg);

        // the access itself runs narrow on both sides
        let StmtKind::Move { dst: res, src: Rvalue::Prim(Prim::ArrayGet, args) } =
            prog.stmt(load).kind.clone()
        else {
            panic!("array read lost its shape");
        };
        assert_ne!(res, r);
        assert!(!prog.types.is_wide(prog.sym(res).ty));
        assert_eq!(prog.sym(res).ty, ref_c);
        let base = args[0].as_sym().unwrap();
        assert_ne!(base, arr);
        assert!(!prog.types.is_wide(prog.sym(base).ty));

        // the narrow result is widened back into the original destination
        let stmts = prog.block(blk).stmts.clone();
        let pos = stmts.iter().position(|&s| s == load).unwrap();
        assert!(matches!(
            &prog.stmt(stmts[pos + 1]).kind,
            StmtKind::Move { dst, src: Rvalue::Use(Operand::Sym(s)) }
                if *dst == r && *s == res
        ));
        assert!(prog.types.is_wide(prog.sym(r).ty));
    }

    #[test]
    fn local_checks_can_be_disabled() {
        let mut prog = Program::new();
        let void_ = prog.types.builtins.void_;
        let c = class_with_int_field(&mut prog, "C");

        let main = prog.add_func("chpl_gen_main", void_, FnFlags::empty());
        prog.entry_fn = Some(main);
        let body = prog.func(main).body;
        let obj = prog.add_local(main, "obj", c, SymFlags::empty());
        prog.push_stmt(body, StmtKind::Def(obj));
        let blk = prog.add_block(body, BlockKind::Local);
        prog.push_stmt(
            blk,
            StmtKind::Eval(Rvalue::prim(
                Prim::SetMember,
                [Operand::Sym(obj), Operand::int(0), Operand::int(1)],
            )),
        );
        prog.push_stmt(body, StmtKind::Child(blk));
        prog.push_stmt(body, StmtKind::Return(Operand::Void));

        let cfg = TargetConfig { no_local_checks: true, ..TargetConfig::default() };
        insert_wide_references(&mut prog, &cfg);
        handle_local_blocks(&mut prog, &cfg);

        let checks = prog
            .all_stmts()
            .into_iter()
            .filter(|&s| {
                matches!(
                    prog.stmt(s).kind.rvalue(),
                    Some(Rvalue::Prim(Prim::LocalCheck, _))
                )
            })
            .count();
        assert_eq!(checks, 0);
    }

    #[test]
    fn wide_returning_clone_is_narrowed_at_every_return() {
        let mut prog = Program::new();
        let c = class_with_int_field(&mut prog, "C");

        let get = prog.add_func("get_obj", c, FnFlags::empty());
        let v = prog.add_local(get, "v", c, SymFlags::empty());
        let gbody = prog.func(get).body;
        prog.push_stmt(gbody, StmtKind::Def(v));
        prog.push_stmt(gbody, StmtKind::Return(Operand::Sym(v)));

        let void_ = prog.types.builtins.void_;
        let main = prog.add_func("chpl_gen_main", void_, FnFlags::empty());
        prog.entry_fn = Some(main);
        let body = prog.func(main).body;
        let x = prog.add_local(main, "x", c, SymFlags::empty());
        prog.push_stmt(body, StmtKind::Def(x));
        let blk = prog.add_block(body, BlockKind::Local);
        prog.push_stmt(
            blk,
            StmtKind::Move { dst: x, src: Rvalue::Call { func: get, args: vec![] } },
        );
        prog.push_stmt(body, StmtKind::Child(blk));
        prog.push_stmt(body, StmtKind::Return(Operand::Void));

        let cfg = multi();
        insert_wide_references(&mut prog, &cfg);
        let wide_c = prog.types.wide_class_for(c).unwrap();
        assert_eq!(prog.func(get).ret_type, wide_c);
        handle_local_blocks(&mut prog, &cfg);

        let clone = prog
            .all_funcs()
            .into_iter()
            .find(|&f| prog.func(f).flags.contains(FnFlags::LOCAL_FN))
            .expect("no local clone");
        assert_eq!(prog.func(clone).ret_type, c);
        for ret in prog.returns_of(clone) {
            let StmtKind::Return(Operand::Sym(s)) = prog.stmt(ret).kind else {
                panic!("clone return lost its symbol");
            };
            assert_eq!(prog.sym(s).ty, c);
        }
        // the original is untouched
        assert_eq!(prog.func(get).ret_type, wide_c);
    }
}
