//! Call dispatch and world binding for the component-model boundary.
//!
//! Built on the codecs from `wasmbridge-abi`, this crate turns a world
//! description into the two artefacts an embedding needs: an import table
//! that supplies host functionality (and resource shims) to a module at
//! instantiation, and a proxy over an instantiated module's exports that
//! the host can call with structured values.
//!
//! The WebAssembly engine itself stays behind the [`WasmEngine`] /
//! [`ModuleInstance`] traits; anything that can invoke named exports over
//! flat values and expose one linear memory can sit behind them.

mod bindings;
mod engine;
mod func;
pub mod testing;

pub use bindings::{
    bind_exports, bind_loop, create_imports, define_export_shims, GuestFunc, GuestInterface,
    GuestProxy, GuestResourceClass, HostDtor, HostInstance, HostResourceImpl, HostServices,
    ImportTable, ROOT_MODULE,
};
pub use engine::{GuestMemory, ModuleInstance, WasmEngine, CABI_REALLOC};
pub use func::{Callable, CoreFn, HostFn};
