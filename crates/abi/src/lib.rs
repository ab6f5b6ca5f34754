//! Value marshalling for the component-model boundary.
//!
//! This crate implements the byte-exact contract for moving structured
//! values between a host and a WebAssembly guest: a linear-memory model
//! with alignment-checked accessors, flat calling-surface values with
//! their closed cast set, a typed codec per component-model type, and the
//! handle tables that carry resources across the boundary in both
//! directions.
//!
//! The runtime and bridge crates build call dispatch and cross-thread
//! transport on top of these pieces; nothing in here knows about modules,
//! instances or threads.

// Every layout in this crate is little-endian by contract.
#[cfg(target_endian = "big")]
compile_error!("this crate only supports little-endian targets");

pub mod codec;
mod flat;
mod memory;
mod options;
mod resources;
mod trap;
mod val;
pub mod world;

pub use codec::{ty, CallContext, CanonicalType, TypeHandle, TypeKind};
pub use flat::{
    CoercingReader, FlatReader, FlatType, FlatValue, FlatValues, MAX_FLAT_PARAMS, MAX_FLAT_RESULTS,
};
pub use memory::{Alignment, HostMemory, LinearMemory, Memory, MemoryRange, ReadonlyRange};
pub use options::{CanonicalOptions, StringEncoding};
pub use resources::{ProxyCore, ProxyHooks, ResourceRegistry, ResourceTable};
pub use trap::{ExpectedError, Trap};
pub use val::{ResourceAny, Val};
pub use world::{FuncKind, FuncType, Interface, ResourceDecl, World, WorldSide};
