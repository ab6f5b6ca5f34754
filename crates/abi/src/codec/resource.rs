//! Resource handle codecs.
//!
//! Every resource-shaped type marshals as a `u32` handle. Lowering asks
//! the resource table for the object's handle (registering it on first
//! crossing); lifting resolves the handle back to the object, which
//! constructs a proxy the first time a guest-owned resource is seen.
//! Copies transfer the handle verbatim, since handles are not
//! memory-relative.

use super::{CallContext, CanonicalType, TypeKind};
use crate::flat::{FlatReader, FlatType, FlatValue, FlatValues};
use crate::memory::{Alignment, Memory, MemoryRange, ReadonlyRange};
use crate::trap::Trap;
use crate::val::Val;

macro_rules! handle_codec {
    ($ty:ident, $kind:ident, $doc:literal) => {
        #[doc = $doc]
        #[derive(Debug)]
        pub struct $ty {
            resource: String,
        }

        impl $ty {
            /// A handle type for the named resource.
            pub fn new(resource: impl Into<String>) -> $ty {
                $ty {
                    resource: resource.into(),
                }
            }

            /// The resource type name.
            pub fn resource(&self) -> &str {
                &self.resource
            }

            fn resolve(&self, handle: u32, cx: &CallContext) -> Result<Val, Trap> {
                let table = cx.resources().table(&self.resource);
                let mut table = table.lock().unwrap_or_else(|e| e.into_inner());
                Ok(Val::Resource(table.get(handle)?))
            }

            fn handle_of(&self, value: &Val, cx: &CallContext) -> Result<u32, Trap> {
                let table = cx.resources().table(&self.resource);
                let mut table = table.lock().unwrap_or_else(|e| e.into_inner());
                table.handle_for(value.as_resource()?)
            }
        }

        impl CanonicalType for $ty {
            fn kind(&self) -> TypeKind {
                TypeKind::$kind
            }

            fn size(&self) -> u32 {
                4
            }

            fn alignment(&self) -> Alignment {
                Alignment::Four
            }

            fn flat_types(&self) -> &[FlatType] {
                &[FlatType::I32]
            }

            fn load(
                &self,
                range: &ReadonlyRange,
                offset: u32,
                cx: &CallContext,
            ) -> Result<Val, Trap> {
                self.resolve(range.get_u32(offset)?, cx)
            }

            fn lift_flat(
                &self,
                _memory: &Memory,
                src: &mut FlatReader<'_>,
                cx: &CallContext,
            ) -> Result<Val, Trap> {
                self.resolve(src.take()?.as_i32()?, cx)
            }

            fn store(
                &self,
                range: &MemoryRange,
                offset: u32,
                value: &Val,
                cx: &CallContext,
            ) -> Result<(), Trap> {
                range.set_u32(offset, self.handle_of(value, cx)?)
            }

            fn lower_flat(
                &self,
                out: &mut FlatValues,
                _memory: &Memory,
                value: &Val,
                cx: &CallContext,
            ) -> Result<(), Trap> {
                out.push(FlatValue::I32(self.handle_of(value, cx)?));
                Ok(())
            }

            fn copy(
                &self,
                dst: &MemoryRange,
                dst_offset: u32,
                src: &ReadonlyRange,
                src_offset: u32,
                _cx: &CallContext,
            ) -> Result<(), Trap> {
                dst.set_u32(dst_offset, src.get_u32(src_offset)?)
            }

            fn copy_flat(
                &self,
                out: &mut FlatValues,
                _dst: &Memory,
                src_vals: &mut FlatReader<'_>,
                _src: &Memory,
                _cx: &CallContext,
            ) -> Result<(), Trap> {
                out.push(FlatValue::I32(src_vals.take()?.as_i32()?));
                Ok(())
            }
        }
    };
}

handle_codec!(OwnType, Own, "An owned handle: the receiver takes over the resource.");
handle_codec!(
    BorrowType,
    Borrow,
    "A borrowed handle: the lender keeps ownership for the duration of the call."
);
handle_codec!(
    ResourceType,
    Resource,
    "The declared resource type itself, marshalled like an owned handle."
);

/// A raw resource handle with no table behind it; the `u32` passes through
/// untouched.
#[derive(Debug)]
pub struct ResourceHandleType;

impl CanonicalType for ResourceHandleType {
    fn kind(&self) -> TypeKind {
        TypeKind::ResourceHandle
    }

    fn size(&self) -> u32 {
        4
    }

    fn alignment(&self) -> Alignment {
        Alignment::Four
    }

    fn flat_types(&self) -> &[FlatType] {
        &[FlatType::I32]
    }

    fn load(&self, range: &ReadonlyRange, offset: u32, _cx: &CallContext) -> Result<Val, Trap> {
        Ok(Val::U32(range.get_u32(offset)?))
    }

    fn lift_flat(
        &self,
        _memory: &Memory,
        src: &mut FlatReader<'_>,
        _cx: &CallContext,
    ) -> Result<Val, Trap> {
        Ok(Val::U32(src.take()?.as_i32()?))
    }

    fn store(
        &self,
        range: &MemoryRange,
        offset: u32,
        value: &Val,
        _cx: &CallContext,
    ) -> Result<(), Trap> {
        match value {
            Val::U32(handle) => range.set_u32(offset, *handle),
            other => Err(other.mismatch("u32")),
        }
    }

    fn lower_flat(
        &self,
        out: &mut FlatValues,
        _memory: &Memory,
        value: &Val,
        _cx: &CallContext,
    ) -> Result<(), Trap> {
        match value {
            Val::U32(handle) => {
                out.push(FlatValue::I32(*handle));
                Ok(())
            }
            other => Err(other.mismatch("u32")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ty;
    use crate::val::ResourceAny;

    struct File(#[allow(dead_code)] &'static str);

    #[test]
    fn own_round_trip_preserves_identity() {
        let cx = CallContext::default();
        let memory = Memory::host();
        let own = ty::own("file");
        let object = Val::Resource(ResourceAny::new(File("a.txt")));

        let mut out = FlatValues::new();
        own.lower_flat(&mut out, &memory, &object, &cx).unwrap();
        // Lowering again reuses the handle minted on first crossing.
        let mut again = FlatValues::new();
        own.lower_flat(&mut again, &memory, &object, &cx).unwrap();
        assert_eq!(out.as_slice(), again.as_slice());

        let mut reader = FlatReader::new(&out);
        let back = own.lift_flat(&memory, &mut reader, &cx).unwrap();
        assert_eq!(back, object);
    }

    #[test]
    fn unknown_handle_traps() {
        let cx = CallContext::default();
        let memory = Memory::host();
        let own = ty::own("file");
        let flat = [FlatValue::I32(77)];
        let mut reader = FlatReader::new(&flat);
        let err = own.lift_flat(&memory, &mut reader, &cx).unwrap_err();
        assert!(matches!(err, Trap::UnknownHandle { handle: 77, .. }));
    }
}
