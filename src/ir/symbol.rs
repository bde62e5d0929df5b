//! Variable and argument symbols.

use crate::{impl_slabref, ir::{FuncRef, TypeRef}};
use smol_str::SmolStr;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SymRef(pub usize);
impl_slabref!(SymRef, SymbolData);

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SymFlags: u16 {
        /// Formal argument of a function.
        const ARG                   = 0b0000_0000_0001;
        /// Declared `const`.
        const CONST                 = 0b0000_0000_0010;
        /// Declared by the target C environment; exempt from promotion
        /// and widening.
        const EXTERN                = 0b0000_0000_0100;
        /// Module-private; never broadcast or heap-placed as a global.
        const PRIVATE               = 0b0000_0000_1000;
        /// Index variable of a `coforall` loop.
        const COFORALL_INDEX        = 0b0000_0001_0000;
        /// Compiler-introduced temporary.
        const TEMP                  = 0b0000_0010_0000;
        /// Record-wrapped value (array/domain/distribution handle).
        const RECORD_WRAPPED        = 0b0000_0100_0000;
        /// Captured into an argument bundle, so accessed from another task.
        const CONCURRENTLY_ACCESSED = 0b0000_1000_0000;
        /// An autoCopy inserted for this value must not be elided.
        const NECESSARY_AUTO_COPY   = 0b0001_0000_0000;
    }
}

/// Scope that owns a symbol's definition point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymOwner {
    /// Module level; the symbol is a global.
    Module,
    Func(FuncRef),
}

#[derive(Debug, Clone)]
pub struct SymbolData {
    pub name: SmolStr,
    pub ty: TypeRef,
    pub flags: SymFlags,
    pub owner: SymOwner,
}

/// Flag combinations that can never legitimately coexist. Catching them
/// centrally turns scattered "unexpected case" aborts into one checked
/// invariant.
const CONFLICTS: &[(SymFlags, SymFlags)] = &[
    (SymFlags::EXTERN, SymFlags::CONCURRENTLY_ACCESSED),
    (SymFlags::EXTERN, SymFlags::COFORALL_INDEX),
    (SymFlags::TEMP, SymFlags::PRIVATE),
];

#[derive(Debug, Clone, Error)]
#[error("symbol '{name}' carries conflicting flags {a:?} and {b:?}")]
pub struct FlagConflict {
    pub name: SmolStr,
    pub a: SymFlags,
    pub b: SymFlags,
}

impl SymbolData {
    pub fn is_global(&self) -> bool {
        self.owner == SymOwner::Module
    }
    pub fn is_formal(&self) -> bool {
        self.flags.contains(SymFlags::ARG)
    }

    pub fn validate(&self) -> Result<(), FlagConflict> {
        for &(a, b) in CONFLICTS {
            if self.flags.contains(a) && self.flags.contains(b) {
                return Err(FlagConflict { name: self.name.clone(), a, b });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod testing {
    use super::*;
    use crate::ir::TypeRef;

    #[test]
    fn conflicting_flags_are_rejected() {
        let sym = SymbolData {
            name: SmolStr::new("x"),
            ty: TypeRef(0),
            flags: SymFlags::EXTERN | SymFlags::CONCURRENTLY_ACCESSED,
            owner: SymOwner::Module,
        };
        assert!(sym.validate().is_err());

        let ok = SymbolData { flags: SymFlags::CONST, ..sym };
        assert!(ok.validate().is_ok());
    }
}
