//! Lowering passes of the distributed-memory compilation layer.
//!
//! The pipeline is strictly ordered: task/locale lowering first, wide
//! reference construction second, locality narrowing last. Each stage
//! consumes the IR the previous stage produced; no stage runs
//! concurrently with another.

pub mod localize;
pub mod parallel;
pub mod widen;

use crate::{config::TargetConfig, ir::Program};
use std::collections::HashSet;
use std::hash::Hash;

pub fn lower_program(prog: &mut Program, cfg: &TargetConfig) {
    log::info!("task/locale lowering");
    parallel::parallel(prog, cfg);
    log::info!("wide reference construction");
    widen::insert_wide_references(prog, cfg);
    log::info!("locality narrowing");
    localize::handle_local_blocks(prog, cfg);
    if let Err(err) = prog.verify() {
        panic!("Internal error: IR verification failed after lowering: {err}");
    }
}

/// Insertion-ordered worklist with exclusive membership. Iteration by
/// index tolerates growth while a pass walks it.
pub(crate) struct WorkList<T> {
    pub items: Vec<T>,
    seen: HashSet<T>,
}

impl<T: Copy + Eq + Hash> WorkList<T> {
    pub fn new() -> Self {
        Self { items: Vec::new(), seen: HashSet::new() }
    }

    /// Returns true when the item was not present yet.
    pub fn insert(&mut self, item: T) -> bool {
        if self.seen.insert(item) {
            self.items.push(item);
            true
        } else {
            false
        }
    }

    pub fn contains(&self, item: &T) -> bool {
        self.seen.contains(item)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }
}

#[cfg(test)]
mod testing {
    use super::*;
    use crate::ir::FnFlags;
    use crate::testing::record_capture_case;

    #[test]
    fn full_pipeline_leaves_a_verifiable_program() {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut case = record_capture_case(2, true);
        lower_program(&mut case.prog, &TargetConfig::multi_locale());
        assert!(case.prog.verify().is_ok());
        assert!(case.prog.startup_fn.is_some());
    }

    #[test]
    fn single_locale_still_lowers_tasks_but_keeps_narrow_types() {
        let mut case = record_capture_case(1, false);
        lower_program(&mut case.prog, &TargetConfig::single_locale());
        let wrappers = case
            .prog
            .all_funcs()
            .into_iter()
            .filter(|&f| case.prog.func(f).flags.contains(FnFlags::BEGIN_BLOCK))
            .count();
        assert_eq!(wrappers, 1);
        assert_eq!(case.prog.types.wide_class_count(), 0);
        assert_eq!(case.prog.types.wide_ref_count(), 0);
    }
}
