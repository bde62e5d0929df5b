//! Type arena and the narrow-to-wide / narrow-to-heap registries.
//!
//! Wide and heap counterparts are records like any other aggregate; what
//! distinguishes them is their [`TypeFlags`] and their entry in the
//! corresponding registry. Each registry is append-only and write-once per
//! key: constructing a second wide form for one narrow type is a broken
//! earlier-pass invariant and aborts compilation.

use crate::{base::SlabRef, impl_slabref};
use slab::Slab;
use smol_str::{SmolStr, format_smolstr};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeRef(pub usize);
impl_slabref!(TypeRef, TypeData);

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TypeFlags: u16 {
        /// Reference (pointer-to-value) type.
        const REF           = 0b0000_0001;
        /// Wide reference record `{locale, addr}`.
        const WIDE          = 0b0000_0010;
        /// Wide class record `{locale, addr[, size]}`.
        const WIDE_CLASS    = 0b0000_0100;
        /// Heap box record `{value}` created for promoted variables.
        const HEAP          = 0b0000_1000;
        /// Never build a wide counterpart (argument bundles and the like).
        const NO_WIDE_CLASS = 0b0001_0000;
        /// Runtime array-of-elements class; its element type is widened
        /// in place of the class itself.
        const DATA_CLASS    = 0b0010_0000;
        /// Foreign type declared by the target C environment.
        const EXTERN        = 0b0100_0000;
        /// Synthesized helper aggregate, invisible to the object model.
        const NO_OBJECT     = 0b1000_0000;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassKind {
    /// Reference-semantics aggregate living on the heap.
    Class,
    /// Value-semantics aggregate.
    Record,
}

#[derive(Debug, Clone)]
pub struct Field {
    pub name: SmolStr,
    pub ty: TypeRef,
}

#[derive(Debug, Clone)]
pub enum TypeKind {
    Void,
    Bool,
    Int,
    Real,
    /// Runtime locale identifier carried in wide pointers.
    LocaleId,
    /// The sentinel type of the `nil` literal before normalization.
    Nil,
    /// Root object type `nil` collapses to.
    Object,
    String,
    Class { kind: ClassKind, fields: Vec<Field> },
    Ref { value: TypeRef },
}

#[derive(Debug, Clone)]
pub struct TypeData {
    pub name: SmolStr,
    pub kind: TypeKind,
    pub flags: TypeFlags,
}

/// Field indices of wide records; part of the ABI the code generator and
/// runtime agree on.
pub const WIDE_FIELD_LOCALE: usize = 0;
pub const WIDE_FIELD_ADDR: usize = 1;
pub const WIDE_FIELD_SIZE: usize = 2;

/// The single payload field of a heap box.
pub const HEAP_FIELD_VALUE: usize = 0;

/// Builtin types, created once per [`TypeStore`].
#[derive(Debug, Clone, Copy)]
pub struct Builtins {
    pub void_: TypeRef,
    pub bool_: TypeRef,
    pub int_: TypeRef,
    pub real_: TypeRef,
    pub locale_id: TypeRef,
    pub nil: TypeRef,
    pub object: TypeRef,
    pub string: TypeRef,
}

#[derive(Debug)]
pub struct TypeStore {
    pub arena: Slab<TypeData>,
    pub builtins: Builtins,
    wide_class_map: HashMap<TypeRef, TypeRef>,
    wide_ref_map: HashMap<TypeRef, TypeRef>,
    heap_type_map: HashMap<TypeRef, TypeRef>,
    ref_map: HashMap<TypeRef, TypeRef>,
    wide_string: Option<TypeRef>,
}

impl TypeStore {
    pub fn new() -> Self {
        let mut arena = Slab::new();
        let mut builtin = |name: &str, kind: TypeKind| -> TypeRef {
            TypeRef(arena.insert(TypeData {
                name: SmolStr::new(name),
                kind,
                flags: TypeFlags::empty(),
            }))
        };
        let builtins = Builtins {
            void_: builtin("void", TypeKind::Void),
            bool_: builtin("bool", TypeKind::Bool),
            int_: builtin("int", TypeKind::Int),
            real_: builtin("real", TypeKind::Real),
            locale_id: builtin("locale_id", TypeKind::LocaleId),
            nil: builtin("nil", TypeKind::Nil),
            object: builtin("object", TypeKind::Object),
            string: builtin("string", TypeKind::String),
        };
        Self {
            arena,
            builtins,
            wide_class_map: HashMap::new(),
            wide_ref_map: HashMap::new(),
            heap_type_map: HashMap::new(),
            ref_map: HashMap::new(),
            wide_string: None,
        }
    }

    pub fn get(&self, ty: TypeRef) -> &TypeData {
        ty.to_data(&self.arena)
    }
    pub fn get_mut(&mut self, ty: TypeRef) -> &mut TypeData {
        ty.to_data_mut(&mut self.arena)
    }
    pub fn name(&self, ty: TypeRef) -> &SmolStr {
        &self.get(ty).name
    }
    pub fn flags(&self, ty: TypeRef) -> TypeFlags {
        self.get(ty).flags
    }

    pub fn add_class(
        &mut self,
        name: impl Into<SmolStr>,
        kind: ClassKind,
        fields: Vec<Field>,
        flags: TypeFlags,
    ) -> TypeRef {
        TypeRef(self.arena.insert(TypeData {
            name: name.into(),
            kind: TypeKind::Class { kind, fields },
            flags,
        }))
    }

    /// Reference-semantics class, the shape widening applies to.
    pub fn is_class(&self, ty: TypeRef) -> bool {
        matches!(self.get(ty).kind, TypeKind::Class { kind: ClassKind::Class, .. })
    }
    pub fn is_record(&self, ty: TypeRef) -> bool {
        matches!(self.get(ty).kind, TypeKind::Class { kind: ClassKind::Record, .. })
    }
    pub fn is_primitive_value(&self, ty: TypeRef) -> bool {
        matches!(
            self.get(ty).kind,
            TypeKind::Bool | TypeKind::Int | TypeKind::Real
        )
    }
    pub fn is_wide(&self, ty: TypeRef) -> bool {
        self.flags(ty).intersects(TypeFlags::WIDE | TypeFlags::WIDE_CLASS)
    }

    pub fn fields(&self, ty: TypeRef) -> &[Field] {
        match &self.get(ty).kind {
            TypeKind::Class { fields, .. } => fields,
            _ => panic!("Internal error: type '{}' has no fields", self.name(ty)),
        }
    }
    pub fn field(&self, ty: TypeRef, index: usize) -> &Field {
        let fields = self.fields(ty);
        fields.get(index).unwrap_or_else(|| {
            panic!("Internal error: type '{}' has no field {index}", self.name(ty))
        })
    }

    /// The `addr` field type of a wide record, i.e. its narrow form.
    pub fn wide_addr_type(&self, ty: TypeRef) -> TypeRef {
        debug_assert!(self.is_wide(ty));
        self.field(ty, WIDE_FIELD_ADDR).ty
    }

    /// Strips reference and wideness wrappers down to the value type.
    pub fn value_type(&self, ty: TypeRef) -> TypeRef {
        if self.is_wide(ty) {
            return self.value_type(self.wide_addr_type(ty));
        }
        match self.get(ty).kind {
            TypeKind::Ref { value } => value,
            _ => ty,
        }
    }

    /// Get-or-make the reference type of `ty`.
    pub fn ref_type(&mut self, ty: TypeRef) -> TypeRef {
        if let Some(&r) = self.ref_map.get(&ty) {
            return r;
        }
        let name = format_smolstr!("_ref_{}", self.name(ty));
        let r = TypeRef(self.arena.insert(TypeData {
            name,
            kind: TypeKind::Ref { value: ty },
            flags: TypeFlags::REF | TypeFlags::NO_OBJECT,
        }));
        self.ref_map.insert(ty, r);
        r
    }

    // ---- wide-class registry ----

    pub fn wide_class_for(&self, narrow: TypeRef) -> Option<TypeRef> {
        self.wide_class_map.get(&narrow).copied()
    }

    /// Builds the paired wide class record for `narrow`. Strings get an
    /// extra `size` field. A duplicate construction is a fatal internal
    /// error.
    pub fn make_wide_class(&mut self, narrow: TypeRef) -> TypeRef {
        if self.wide_class_map.contains_key(&narrow) {
            panic!(
                "Internal error: created two wide class types for '{}'",
                self.name(narrow)
            );
        }
        let is_string = matches!(self.get(narrow).kind, TypeKind::String);
        let name = format_smolstr!("__wide_{}", self.name(narrow));
        let mut fields = vec![
            Field { name: SmolStr::new("locale"), ty: self.builtins.locale_id },
            Field { name: SmolStr::new("addr"), ty: narrow },
        ];
        if is_string {
            fields.push(Field { name: SmolStr::new("size"), ty: self.builtins.int_ });
        }
        let wide = self.add_class(name, ClassKind::Record, fields, TypeFlags::WIDE_CLASS);
        if is_string {
            if self.wide_string.is_some() {
                panic!("Internal error: created two wide string types");
            }
            self.wide_string = Some(wide);
        }
        self.wide_class_map.insert(narrow, wide);
        wide
    }

    pub fn wide_class_count(&self) -> usize {
        self.wide_class_map.len()
    }

    pub fn wide_string(&self) -> Option<TypeRef> {
        self.wide_string
    }
    pub fn is_wide_string(&self, ty: TypeRef) -> bool {
        self.wide_string == Some(ty)
    }
    /// A reference whose value type is the wide string record.
    pub fn is_ref_wide_string(&self, ty: TypeRef) -> bool {
        match self.get(ty).kind {
            TypeKind::Ref { value } => self.is_wide_string(value),
            _ => false,
        }
    }

    // ---- wide-ref registry ----

    pub fn wide_ref_for(&self, narrow: TypeRef) -> Option<TypeRef> {
        self.wide_ref_map.get(&narrow).copied()
    }

    pub fn make_wide_ref(&mut self, narrow: TypeRef) -> TypeRef {
        if self.wide_ref_map.contains_key(&narrow) {
            panic!(
                "Internal error: created two wide reference types for '{}'",
                self.name(narrow)
            );
        }
        let name = format_smolstr!("__wide_{}", self.name(narrow));
        let locale_id = self.builtins.locale_id;
        let wide = self.add_class(
            name,
            ClassKind::Record,
            vec![
                Field { name: SmolStr::new("locale"), ty: locale_id },
                Field { name: SmolStr::new("addr"), ty: narrow },
            ],
            TypeFlags::WIDE,
        );
        self.wide_ref_map.insert(narrow, wide);
        wide
    }

    pub fn wide_ref_count(&self) -> usize {
        self.wide_ref_map.len()
    }

    // ---- heap-box registry ----

    pub fn heap_type_for(&self, ty: TypeRef) -> Option<TypeRef> {
        self.heap_type_map.get(&ty).copied()
    }

    /// Get-or-make the heap box for `ty`; at most one box per type exists
    /// for the lifetime of the store.
    pub fn heap_type(&mut self, ty: TypeRef) -> TypeRef {
        if let Some(&heap) = self.heap_type_map.get(&ty) {
            return heap;
        }
        let name = format_smolstr!("heap_{}", self.name(ty));
        let heap = self.add_class(
            name,
            ClassKind::Class,
            vec![Field { name: SmolStr::new("value"), ty }],
            TypeFlags::HEAP | TypeFlags::NO_OBJECT,
        );
        self.heap_type_map.insert(ty, heap);
        heap
    }

    /// All type handles currently in the arena, in allocation order.
    pub fn all_types(&self) -> Vec<TypeRef> {
        self.arena.iter().map(|(h, _)| TypeRef(h)).collect()
    }
}

impl Default for TypeStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod testing {
    use super::*;

    #[test]
    fn wide_class_layout() {
        let mut ts = TypeStore::new();
        let c = ts.add_class("C", ClassKind::Class, vec![], TypeFlags::empty());
        let wide = ts.make_wide_class(c);
        assert_eq!(ts.field(wide, WIDE_FIELD_LOCALE).ty, ts.builtins.locale_id);
        assert_eq!(ts.field(wide, WIDE_FIELD_ADDR).ty, c);
        assert_eq!(ts.fields(wide).len(), 2);
        assert_eq!(ts.wide_class_for(c), Some(wide));
        assert_eq!(ts.value_type(wide), c);
    }

    #[test]
    fn wide_string_has_size_field() {
        let mut ts = TypeStore::new();
        let string = ts.builtins.string;
        let wide = ts.make_wide_class(string);
        assert_eq!(ts.fields(wide).len(), 3);
        assert_eq!(ts.field(wide, WIDE_FIELD_SIZE).ty, ts.builtins.int_);
        assert!(ts.is_wide_string(wide));
    }

    #[test]
    #[should_panic(expected = "two wide class types")]
    fn duplicate_wide_class_is_fatal() {
        let mut ts = TypeStore::new();
        let c = ts.add_class("C", ClassKind::Class, vec![], TypeFlags::empty());
        ts.make_wide_class(c);
        ts.make_wide_class(c);
    }

    #[test]
    fn heap_type_is_memoized() {
        let mut ts = TypeStore::new();
        let int_ = ts.builtins.int_;
        let h1 = ts.heap_type(int_);
        let h2 = ts.heap_type(int_);
        assert_eq!(h1, h2);
        assert!(ts.flags(h1).contains(TypeFlags::HEAP));
        assert_eq!(ts.field(h1, HEAP_FIELD_VALUE).ty, int_);
    }
}
