//! The closed vocabulary of low-level IR actions.
//!
//! The lowering passes pattern-match on these tags; introducing wide and
//! heap types changes which branch of a primitive's handling applies, but
//! the vocabulary itself is static.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Prim {
    /// Read the value a (possibly wide) reference points at.
    Deref,
    /// Take the address of a variable, producing a reference.
    AddrOf,
    /// `[obj, field-index]` -> reference to the field.
    GetMember,
    /// `[obj, field-index]` -> value of the field.
    GetMemberValue,
    /// `[obj, field-index, value]` store into the field.
    SetMember,
    /// `[array, index]` -> reference to the element.
    ArrayGet,
    /// `[array, index]` -> value of the element.
    ArrayGetValue,
    /// `[array, index, value]` store into the element.
    ArraySet,
    /// `[array, value]` store into element zero (literal initialization).
    ArraySetFirst,
    /// `[type, value]` static conversion.
    Cast,
    /// `[type, obj]` checked downcast.
    DynamicCast,
    /// `[union]` -> active variant tag.
    UnionGetId,
    /// `[union, tag]` set the active variant tag.
    UnionSetId,
    /// `[obj]` -> class id.
    GetCid,
    /// `[obj, type]` class-id test.
    TestCid,
    /// `[obj]` write the class id during initialization.
    SetCid,
    /// `[a, b]` equality on scalar values.
    Equal,
    /// `[wide]` -> locale id half of a wide pointer.
    WideGetLocale,
    /// `[wide]` -> node number of the locale half.
    WideGetNode,
    /// `[wide]` -> address half of a wide pointer.
    WideGetAddr,
    /// `[wide]` abort unless the wide pointer's locale is the
    /// current locale.
    LocalCheck,
    /// `[sym]` broadcast a global constant's value to all locales.
    PrivateBroadcast,
    /// `[type]` -> pointer to freshly allocated storage for `type`.
    HereAlloc,
    /// `[ptr]` free storage allocated by `HereAlloc`.
    HereFree,
    /// `[index, sym]` register a global's heap cell under a stable index.
    HeapRegisterGlobal,
    /// `[count]` collective exchange of all registered globals' addresses.
    HeapBroadcastGlobals,
    /// Current task's end count (rewritten to a local by lowering).
    GetEndCount,
    /// `[val]` set the current task's end count.
    SetEndCount,
    /// Node number of the executing process.
    NodeId,
}

impl Prim {
    /// Primitives whose first operand must be single-representation, so
    /// wide-ref-to-wide-class operands are dereferenced ahead of them.
    pub fn is_member_access(self) -> bool {
        matches!(
            self,
            Prim::GetMember
                | Prim::GetMemberValue
                | Prim::SetMember
                | Prim::WideGetLocale
                | Prim::WideGetNode
                | Prim::WideGetAddr
        )
    }
}
