//! The typed codec: one implementation of [`CanonicalType`] per
//! component-model type.
//!
//! A codec fixes a type's byte layout (`size`/`alignment`), its shape on
//! the calling surface (`flat_types`), and six operations: `load`/`store`
//! move values through linear memory, `lift_flat`/`lower_flat` move them
//! through calling-surface values, and `copy`/`copy_flat` transplant a
//! stored value into another memory, re-allocating any out-of-line buffers
//! it references.

use crate::flat::{FlatReader, FlatType, FlatValues};
use crate::memory::{Alignment, Memory, MemoryRange, ReadonlyRange};
use crate::options::CanonicalOptions;
use crate::resources::ResourceRegistry;
use crate::trap::Trap;
use crate::val::Val;
use std::fmt;
use std::sync::Arc;

mod flags;
mod list;
mod primitive;
mod record;
mod resource;
mod string;
mod variant;

pub use flags::FlagsType;
pub use list::ListType;
pub use primitive::{
    BoolType, CharType, F32Type, F64Type, S16Type, S32Type, S64Type, S8Type, U16Type, U32Type,
    U64Type, U8Type,
};
pub use record::{RecordType, TupleType};
pub use resource::{BorrowType, OwnType, ResourceHandleType, ResourceType};
pub use string::StringType;
pub use variant::{EnumType, OptionType, ResultType, VariantType};

/// The closed set of type kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TypeKind {
    Bool,
    U8,
    U16,
    U32,
    U64,
    S8,
    S16,
    S32,
    S64,
    F32,
    F64,
    Char,
    String,
    List,
    Record,
    Tuple,
    Variant,
    Enum,
    Flags,
    Option,
    Result,
    Resource,
    ResourceHandle,
    Borrow,
    Own,
}

/// A shared, type-erased codec.
pub type TypeHandle = Arc<dyn CanonicalType>;

/// The ambient state codec operations may need: marshalling options and the
/// resource tables of the world the value belongs to.
#[derive(Clone)]
pub struct CallContext {
    options: Arc<CanonicalOptions>,
    resources: ResourceRegistry,
}

impl CallContext {
    /// A context over the given options and resource tables.
    pub fn new(options: CanonicalOptions, resources: ResourceRegistry) -> CallContext {
        CallContext {
            options: Arc::new(options),
            resources,
        }
    }

    /// The marshalling options in effect.
    pub fn options(&self) -> &CanonicalOptions {
        &self.options
    }

    /// The resource tables in effect.
    pub fn resources(&self) -> &ResourceRegistry {
        &self.resources
    }
}

impl Default for CallContext {
    fn default() -> CallContext {
        CallContext::new(CanonicalOptions::new(), ResourceRegistry::new())
    }
}

/// A component-model type.
///
/// Implementations are immutable; containers share their element codecs
/// through [`TypeHandle`]s.
pub trait CanonicalType: fmt::Debug + Send + Sync {
    /// This type's kind tag.
    fn kind(&self) -> TypeKind;

    /// The number of bytes a stored value occupies. Always a multiple of
    /// the alignment.
    fn size(&self) -> u32;

    /// The alignment a stored value requires.
    fn alignment(&self) -> Alignment;

    /// The calling-surface shape of a value of this type.
    fn flat_types(&self) -> &[FlatType];

    /// Reads a value from its linear-memory layout. `offset` is relative to
    /// `range` and must meet this type's alignment.
    fn load(&self, range: &ReadonlyRange, offset: u32, cx: &CallContext) -> Result<Val, Trap>;

    /// Reads a value from calling-surface values, consuming exactly
    /// `flat_types().len()` of them. `memory` resolves any indirections.
    fn lift_flat(
        &self,
        memory: &Memory,
        src: &mut FlatReader<'_>,
        cx: &CallContext,
    ) -> Result<Val, Trap>;

    /// Writes a value's linear-memory layout. Out-of-line buffers are
    /// allocated in the range's memory.
    fn store(
        &self,
        range: &MemoryRange,
        offset: u32,
        value: &Val,
        cx: &CallContext,
    ) -> Result<(), Trap>;

    /// Appends a value's calling-surface shape to `out`, exactly
    /// `flat_types().len()` values. Out-of-line buffers are allocated in
    /// `memory`.
    fn lower_flat(
        &self,
        out: &mut FlatValues,
        memory: &Memory,
        value: &Val,
        cx: &CallContext,
    ) -> Result<(), Trap>;

    /// Deep-copies a stored value into another memory, re-allocating
    /// referenced buffers in the destination.
    fn copy(
        &self,
        dst: &MemoryRange,
        dst_offset: u32,
        src: &ReadonlyRange,
        src_offset: u32,
        cx: &CallContext,
    ) -> Result<(), Trap> {
        let value = self.load(src, src_offset, cx)?;
        self.store(dst, dst_offset, &value, cx)
    }

    /// Deep-copies a value whose surface is flat: consumes this type's
    /// values from `src_vals` (resolving indirections in `src`) and appends
    /// the equivalent values for `dst` to `out`.
    fn copy_flat(
        &self,
        out: &mut FlatValues,
        dst: &Memory,
        src_vals: &mut FlatReader<'_>,
        src: &Memory,
        cx: &CallContext,
    ) -> Result<(), Trap> {
        let value = self.lift_flat(src, src_vals, cx)?;
        self.lower_flat(out, dst, &value, cx)
    }
}

/// Convenience constructors for type handles.
///
/// Primitive handles are shared singletons; compound constructors build a
/// fresh codec over their element handles.
pub mod ty {
    use super::*;
    use once_cell::sync::Lazy;

    macro_rules! primitive_handle {
        ($fn_name:ident, $ty:ident) => {
            /// A shared handle for this primitive type.
            pub fn $fn_name() -> TypeHandle {
                static HANDLE: Lazy<TypeHandle> = Lazy::new(|| Arc::new($ty));
                HANDLE.clone()
            }
        };
    }

    primitive_handle!(bool, BoolType);
    primitive_handle!(u8, U8Type);
    primitive_handle!(u16, U16Type);
    primitive_handle!(u32, U32Type);
    primitive_handle!(u64, U64Type);
    primitive_handle!(s8, S8Type);
    primitive_handle!(s16, S16Type);
    primitive_handle!(s32, S32Type);
    primitive_handle!(s64, S64Type);
    primitive_handle!(f32, F32Type);
    primitive_handle!(f64, F64Type);
    primitive_handle!(char, CharType);
    primitive_handle!(string, StringType);

    /// A list with the given element type.
    pub fn list(element: TypeHandle) -> TypeHandle {
        Arc::new(ListType::new(element))
    }

    /// A record with the given named fields, laid out in declaration order.
    pub fn record<N: Into<String>>(fields: impl IntoIterator<Item = (N, TypeHandle)>) -> TypeHandle {
        Arc::new(RecordType::new(fields))
    }

    /// A tuple with the given element types.
    pub fn tuple(elements: impl IntoIterator<Item = TypeHandle>) -> TypeHandle {
        Arc::new(TupleType::new(elements))
    }

    /// A variant with the given cases.
    pub fn variant<N: Into<String>>(
        cases: impl IntoIterator<Item = (N, Option<TypeHandle>)>,
    ) -> TypeHandle {
        Arc::new(VariantType::new(cases))
    }

    /// An enumeration over the given case names.
    pub fn enum_<N: Into<String>>(cases: impl IntoIterator<Item = N>) -> TypeHandle {
        Arc::new(EnumType::new(cases))
    }

    /// A flags type over the given field names.
    pub fn flags<N: Into<String>>(names: impl IntoIterator<Item = N>) -> TypeHandle {
        Arc::new(FlagsType::new(names))
    }

    /// An `option` of the given payload type.
    pub fn option(payload: TypeHandle) -> TypeHandle {
        Arc::new(OptionType::new(payload))
    }

    /// A `result` with optional `ok` and `error` payloads.
    pub fn result(ok: Option<TypeHandle>, err: Option<TypeHandle>) -> TypeHandle {
        Arc::new(ResultType::new(ok, err))
    }

    /// An owned handle to the named resource.
    pub fn own(resource: impl Into<String>) -> TypeHandle {
        Arc::new(OwnType::new(resource))
    }

    /// A borrowed handle to the named resource.
    pub fn borrow(resource: impl Into<String>) -> TypeHandle {
        Arc::new(BorrowType::new(resource))
    }

    /// The named resource type itself.
    pub fn resource(name: impl Into<String>) -> TypeHandle {
        Arc::new(ResourceType::new(name))
    }

    /// A raw resource handle, marshalled as a plain `u32`.
    pub fn resource_handle() -> TypeHandle {
        static HANDLE: Lazy<TypeHandle> = Lazy::new(|| Arc::new(ResourceHandleType));
        HANDLE.clone()
    }
}
