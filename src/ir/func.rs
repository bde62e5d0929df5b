//! Function symbols and their task/fork classification flags.

use crate::{impl_slabref, ir::{BlockRef, SymRef, TypeRef}};
use smol_str::SmolStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FuncRef(pub usize);
impl_slabref!(FuncRef, FuncData);

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FnFlags: u32 {
        /// Outlined from a `begin` statement (asynchronous task spawn).
        const BEGIN                     = 1 << 0;
        /// Outlined from a `cobegin`/`coforall` parallel block.
        const COBEGIN_OR_COFORALL       = 1 << 1;
        /// Outlined from an `on` statement (cross-locale jump).
        const ON                        = 1 << 2;
        /// The fork does not block the spawning task ('on' + 'begin').
        const NON_BLOCKING              = 1 << 3;
        /// Declared by the target C environment.
        const EXTERN                    = 1 << 4;
        /// All arguments are local narrow values (extern/exported surface).
        const LOCAL_ARGS                = 1 << 5;
        /// Entry point exported to the runtime startup sequence.
        const EXPORT                    = 1 << 6;
        /// Clone produced by the locality-narrowing pass.
        const LOCAL_FN                  = 1 << 7;
        /// Wrapper generated around a task/fork unit; the flags below
        /// steer code generation of the fork/task call itself.
        const BEGIN_BLOCK               = 1 << 8;
        const COBEGIN_OR_COFORALL_BLOCK = 1 << 9;
        const ON_BLOCK                  = 1 << 10;
        /// Runtime routine that decrements an end count; task-argument
        /// destroys land immediately before calls to it.
        const DOWN_END_COUNT            = 1 << 11;
        /// Runtime autoDestroy routine for some type.
        const AUTO_DESTROY_FN           = 1 << 12;
    }
}

#[derive(Debug, Clone)]
pub struct FuncData {
    pub name: SmolStr,
    pub formals: Vec<SymRef>,
    pub ret_type: TypeRef,
    pub body: BlockRef,
    pub flags: FnFlags,
}

impl FuncData {
    /// A function outlined from `begin`, `cobegin`/`coforall`, or `on`,
    /// callable only through the runtime's task/fork interface.
    pub fn is_task_fn(&self) -> bool {
        self.flags.intersects(
            FnFlags::BEGIN | FnFlags::COBEGIN_OR_COFORALL | FnFlags::ON | FnFlags::NON_BLOCKING,
        )
    }
}
