//! Slab-handle infrastructure shared by every IR arena.
//!
//! IR nodes live in `slab::Slab` arenas and are addressed through small
//! `Copy` handle types. Handles stay valid while passes insert and remove
//! neighboring nodes, which is what makes in-place whole-program rewriting
//! safe with worklists that outlive individual mutations.

use slab::Slab;

pub trait INullableValue: Copy + Eq {
    fn new_null() -> Self;
    fn is_null(&self) -> bool;

    fn is_nonnull(&self) -> bool {
        !self.is_null()
    }
    fn from_option(opt: Option<Self>) -> Self {
        opt.unwrap_or_else(Self::new_null)
    }
    fn to_option(&self) -> Option<Self> {
        if self.is_null() { None } else { Some(*self) }
    }
}

pub trait SlabRef: Copy + Eq + INullableValue + std::fmt::Debug {
    type RefObject: Sized;

    fn from_handle(handle: usize) -> Self;
    fn get_handle(&self) -> usize;

    fn as_data<'a>(&self, slab: &'a Slab<Self::RefObject>) -> Option<&'a Self::RefObject> {
        slab.get(self.get_handle())
    }
    fn as_data_mut<'a>(
        &self,
        slab: &'a mut Slab<Self::RefObject>,
    ) -> Option<&'a mut Self::RefObject> {
        slab.get_mut(self.get_handle())
    }
    fn to_data<'a>(&self, slab: &'a Slab<Self::RefObject>) -> &'a Self::RefObject {
        if self.is_null() {
            panic!("Cannot convert null reference to data");
        }
        slab.get(self.get_handle())
            .unwrap_or_else(|| panic!("Invalid reference {} (use after free?)", self.get_handle()))
    }
    fn to_data_mut<'a>(&self, slab: &'a mut Slab<Self::RefObject>) -> &'a mut Self::RefObject {
        if self.is_null() {
            panic!("Cannot convert null reference to data");
        }
        slab.get_mut(self.get_handle())
            .unwrap_or_else(|| panic!("Invalid reference {} (use after free?)", self.get_handle()))
    }
}

impl<T: SlabRef> INullableValue for T {
    fn new_null() -> Self {
        Self::from_handle(usize::MAX)
    }
    fn is_null(&self) -> bool {
        self.get_handle() == usize::MAX
    }
}

/// Wires a tuple-struct handle type to its slab payload type.
#[macro_export]
macro_rules! impl_slabref {
    ($ref_typename:ident, $data_typename:ident) => {
        impl $crate::base::SlabRef for $ref_typename {
            type RefObject = $data_typename;

            fn from_handle(handle: usize) -> Self {
                Self(handle)
            }
            fn get_handle(&self) -> usize {
                self.0
            }
        }
    };
}
