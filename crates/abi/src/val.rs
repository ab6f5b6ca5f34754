//! Host-side values for every marshallable type.

use crate::trap::Trap;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// A host-side value.
///
/// Each variant corresponds to one codec kind; the codecs validate shape
/// when a value is lowered, so constructing a `Val` can never fail.
#[derive(Debug, Clone, PartialEq)]
pub enum Val {
    Bool(bool),
    S8(i8),
    U8(u8),
    S16(i16),
    U16(u16),
    S32(i32),
    U32(u32),
    S64(i64),
    U64(u64),
    Float32(f32),
    Float64(f64),
    Char(char),
    String(Box<str>),
    List(Vec<Val>),
    Record(Vec<(String, Val)>),
    Tuple(Vec<Val>),
    Variant(String, Option<Box<Val>>),
    Enum(String),
    Option(Option<Box<Val>>),
    Result(Result<Option<Box<Val>>, Option<Box<Val>>>),
    Flags(Vec<String>),
    Resource(ResourceAny),
}

impl Val {
    /// The name of this value's shape, used in diagnostics.
    pub fn desc(&self) -> &'static str {
        match self {
            Val::Bool(_) => "bool",
            Val::S8(_) => "s8",
            Val::U8(_) => "u8",
            Val::S16(_) => "s16",
            Val::U16(_) => "u16",
            Val::S32(_) => "s32",
            Val::U32(_) => "u32",
            Val::S64(_) => "s64",
            Val::U64(_) => "u64",
            Val::Float32(_) => "f32",
            Val::Float64(_) => "f64",
            Val::Char(_) => "char",
            Val::String(_) => "string",
            Val::List(_) => "list",
            Val::Record(_) => "record",
            Val::Tuple(_) => "tuple",
            Val::Variant(..) => "variant",
            Val::Enum(_) => "enum",
            Val::Option(_) => "option",
            Val::Result(_) => "result",
            Val::Flags(_) => "flags",
            Val::Resource(_) => "resource",
        }
    }

    pub(crate) fn mismatch(&self, want: &'static str) -> Trap {
        Trap::ValueMismatch {
            want,
            got: self.desc(),
        }
    }

    /// Requires a string value.
    pub fn as_str(&self) -> Result<&str, Trap> {
        match self {
            Val::String(s) => Ok(s),
            other => Err(other.mismatch("string")),
        }
    }

    /// Requires a list value.
    pub fn as_list(&self) -> Result<&[Val], Trap> {
        match self {
            Val::List(items) => Ok(items),
            other => Err(other.mismatch("list")),
        }
    }

    /// Requires a record value.
    pub fn as_record(&self) -> Result<&[(String, Val)], Trap> {
        match self {
            Val::Record(fields) => Ok(fields),
            other => Err(other.mismatch("record")),
        }
    }

    /// Requires a tuple value.
    pub fn as_tuple(&self) -> Result<&[Val], Trap> {
        match self {
            Val::Tuple(items) => Ok(items),
            other => Err(other.mismatch("tuple")),
        }
    }

    /// Requires a resource value.
    pub fn as_resource(&self) -> Result<&ResourceAny, Trap> {
        match self {
            Val::Resource(r) => Ok(r),
            other => Err(other.mismatch("resource")),
        }
    }
}

impl From<&str> for Val {
    fn from(s: &str) -> Val {
        Val::String(s.into())
    }
}

impl From<String> for Val {
    fn from(s: String) -> Val {
        Val::String(s.into())
    }
}

/// An opaque reference to a host-side resource object.
///
/// Equality is identity: two values are equal when they refer to the same
/// allocation, which is also the identity the resource tables key on.
#[derive(Clone)]
pub struct ResourceAny {
    object: Arc<dyn Any + Send + Sync>,
}

impl ResourceAny {
    /// Wraps a host object.
    pub fn new<T: Any + Send + Sync>(object: T) -> ResourceAny {
        ResourceAny {
            object: Arc::new(object),
        }
    }

    /// Wraps an already shared host object.
    pub fn from_arc(object: Arc<dyn Any + Send + Sync>) -> ResourceAny {
        ResourceAny { object }
    }

    /// The shared object.
    pub fn object(&self) -> &Arc<dyn Any + Send + Sync> {
        &self.object
    }

    /// Downcasts to a concrete host type.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.object.downcast_ref()
    }

    /// A stable key for identity comparisons.
    pub fn identity(&self) -> usize {
        Arc::as_ptr(&self.object) as *const () as usize
    }
}

impl PartialEq for ResourceAny {
    fn eq(&self, other: &ResourceAny) -> bool {
        self.identity() == other.identity()
    }
}

impl fmt::Debug for ResourceAny {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResourceAny({:#x})", self.identity())
    }
}
