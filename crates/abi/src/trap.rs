use crate::val::Val;

/// A fatal marshalling failure.
///
/// Traps abort the call they occur in; they are never recovered locally.
/// Callers receive them through `anyhow::Error` and may use
/// [`anyhow::Error::downcast`] to inspect the precise cause.
#[derive(Debug, thiserror::Error)]
pub enum Trap {
    /// A multi-byte access at an offset that does not meet the required
    /// alignment.
    #[error("unaligned access at offset {offset:#x}, requires alignment {align}")]
    UnalignedAccess {
        /// Absolute offset of the attempted access.
        offset: u32,
        /// Alignment the access required.
        align: u32,
    },

    /// An access outside the bounds of a memory or range.
    #[error("access out of bounds: {offset:#x}+{len} exceeds {size}")]
    OutOfBounds { offset: u32, len: u32, size: u32 },

    /// An operation on the null memory.
    #[error("no memory is installed for this call")]
    NullMemory,

    /// `free` on a memory without allocator support.
    #[error("memory does not support `free`")]
    FreeUnsupported,

    /// The allocator could not satisfy a request.
    #[error("allocation of {size} bytes (align {align}) failed")]
    AllocationFailed { align: u32, size: u32 },

    /// A discriminant outside the declared case range.
    #[error("invalid discriminant {value} for {ty}")]
    InvalidDiscriminant { value: u32, ty: &'static str },

    /// A `char` code point in the surrogate range or above the Unicode
    /// maximum.
    #[error("invalid char code point {value:#x}")]
    InvalidChar { value: u32 },

    /// String contents that do not decode under the selected encoding.
    #[error("string contents are not valid {encoding}")]
    InvalidString { encoding: &'static str },

    /// An encoding that is accepted by configuration but has no
    /// implementation.
    #[error("string encoding {0:?} is not supported")]
    UnsupportedEncoding(&'static str),

    /// The flat value stream ended before the type consumed its share.
    #[error("flat value stream exhausted")]
    FlatStreamExhausted,

    /// A flat value whose type does not match the calling surface.
    #[error("flat value type mismatch: have {have}, want {want}")]
    FlatTypeMismatch {
        have: &'static str,
        want: &'static str,
    },

    /// An `i64` flat value narrowed to `i32` that does not fit.
    #[error("flat value {value} does not fit in i32")]
    NarrowingOverflow { value: u64 },

    /// A host value of the wrong shape handed to a codec.
    #[error("expected a {want} value, got {got}")]
    ValueMismatch {
        want: &'static str,
        got: &'static str,
    },

    /// A variant case or record field name that the type does not declare.
    #[error("{ty} has no member named `{name}`")]
    UnknownMember { ty: &'static str, name: String },

    /// A handle that is not present in the resource table.
    #[error("unknown {resource} handle {handle}")]
    UnknownHandle { resource: String, handle: u32 },

    /// A representation that is not present in the loop table.
    #[error("unknown loop representation {rep} for {resource}")]
    UnknownLoopRep { resource: String, rep: u32 },

    /// Registration with a handle that is already taken.
    #[error("{resource} handle {handle} is already registered")]
    DuplicateHandle { resource: String, handle: u32 },

    /// Registration with an explicit handle the allocator never issued.
    #[error("{resource} handle {handle} was never allocated")]
    HandleNotIssued { resource: String, handle: u32 },

    /// The 32-bit handle space is exhausted.
    #[error("handle space for {resource} is exhausted")]
    HandleSpaceExhausted { resource: String },

    /// A proxy whose host-side reference was already collected.
    #[error("{resource} proxy for handle {handle} was already collected")]
    ProxyCollected { resource: String, handle: u32 },

    /// Removal of a weak proxy entry, which only finalisation may do.
    #[error("{resource} handle {handle} is a proxy and cannot be removed")]
    RemoveProxy { resource: String, handle: u32 },

    /// No proxy constructor installed for a resource that needs one.
    #[error("no proxy constructor installed for {resource}")]
    NoProxyConstructor { resource: String },

    /// An object passed where a registered resource was expected.
    #[error("object is not registered with the {resource} table")]
    UnregisteredObject { resource: String },

    /// The futex wait on a bridged call expired.
    #[error("call timed out")]
    CallTimedOut,

    /// The lock word held a value the protocol never writes.
    #[error("corrupt lock word {0:#x}")]
    CorruptLockWord(u32),

    /// The main thread has no handler under the requested name.
    #[error("no handler registered for `{0}`")]
    NoHandler(String),

    /// The main-thread handler rejected the call.
    #[error("call `{0}` was rejected by the host")]
    Rejected(String),

    /// A second call issued while one is already in flight on the same
    /// connection.
    #[error("a call is already in flight on this connection")]
    CallInFlight,

    /// A result type the transfer header cannot carry.
    #[error("result of `{func}` cannot cross the transfer header")]
    UnbridgeableResult { func: String },
}

/// An error payload a host handler may raise to have it lowered as the
/// `error` arm of a `result<_, E>` return instead of aborting the call.
///
/// Only functions whose declared return is a `result` participate; for any
/// other signature the error propagates as a plain failure. The payload is
/// `None` when the error arm carries no type.
#[derive(Debug)]
pub struct ExpectedError(pub Option<Val>);

impl ExpectedError {
    /// An expected error with a payload.
    pub fn with(value: Val) -> ExpectedError {
        ExpectedError(Some(value))
    }

    /// An expected error without a payload.
    pub fn empty() -> ExpectedError {
        ExpectedError(None)
    }
}

impl std::fmt::Display for ExpectedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.0 {
            Some(value) => write!(f, "handler signalled an expected error: {value:?}"),
            None => write!(f, "handler signalled an expected error"),
        }
    }
}

impl std::error::Error for ExpectedError {}
