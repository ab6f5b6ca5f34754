//! The engine seam: what this crate needs from a WebAssembly runtime.
//!
//! Instantiation itself lives elsewhere; dispatch and binding only consume
//! an instantiated module through [`ModuleInstance`]. A canonical guest
//! memory wraps an instance's exports so the codecs can allocate in guest
//! space through `cabi_realloc`.

use crate::bindings::ImportTable;
use std::sync::Arc;
use wasmbridge_abi::{Alignment, FlatValue, LinearMemory, Memory, Trap};

/// A WebAssembly engine capable of instantiating a module against an
/// import table.
pub trait WasmEngine: Send + Sync {
    /// Instantiates `module`, wiring its imports from `imports`.
    fn instantiate(
        &self,
        module: &[u8],
        imports: &ImportTable,
    ) -> anyhow::Result<Arc<dyn ModuleInstance>>;
}

/// An instantiated module: callable exports plus one linear memory.
pub trait ModuleInstance: Send + Sync {
    /// Invokes the named export with core calling-surface values.
    fn invoke(&self, name: &str, args: &[FlatValue]) -> anyhow::Result<Vec<FlatValue>>;

    /// Whether the named export exists.
    fn has_export(&self, name: &str) -> bool;

    /// The size of the exported linear memory in bytes.
    fn memory_size(&self) -> u32;

    /// Reads from the exported linear memory.
    fn memory_read(&self, offset: u32, out: &mut [u8]) -> Result<(), Trap>;

    /// Writes to the exported linear memory.
    fn memory_write(&self, offset: u32, bytes: &[u8]) -> Result<(), Trap>;
}

/// The name of the canonical guest allocator export.
pub const CABI_REALLOC: &str = "cabi_realloc";

/// A [`Memory`] over a module's exported linear memory whose allocator
/// delegates to the guest's `cabi_realloc`.
pub struct GuestMemory {
    instance: Arc<dyn ModuleInstance>,
}

impl GuestMemory {
    /// Wraps an instance's memory and allocator.
    pub fn new(instance: Arc<dyn ModuleInstance>) -> Memory {
        Memory::new(Arc::new(GuestMemory { instance }))
    }

    fn cabi_realloc(
        &self,
        ptr: u32,
        old_size: u32,
        align: Alignment,
        new_size: u32,
    ) -> Result<u32, Trap> {
        let args = [
            FlatValue::I32(ptr),
            FlatValue::I32(old_size),
            FlatValue::I32(align.bytes()),
            FlatValue::I32(new_size),
        ];
        let results = self.instance.invoke(CABI_REALLOC, &args).map_err(|err| {
            log::debug!("cabi_realloc failed: {err:#}");
            Trap::AllocationFailed {
                align: align.bytes(),
                size: new_size,
            }
        })?;
        match results.as_slice() {
            [FlatValue::I32(new_ptr)] => Ok(*new_ptr),
            _ => Err(Trap::AllocationFailed {
                align: align.bytes(),
                size: new_size,
            }),
        }
    }
}

impl LinearMemory for GuestMemory {
    fn byte_size(&self) -> u32 {
        self.instance.memory_size()
    }

    fn read(&self, offset: u32, out: &mut [u8]) -> Result<(), Trap> {
        self.instance.memory_read(offset, out)
    }

    fn write(&self, offset: u32, bytes: &[u8]) -> Result<(), Trap> {
        self.instance.memory_write(offset, bytes)
    }

    fn alloc(&self, align: Alignment, size: u32) -> Result<u32, Trap> {
        self.cabi_realloc(0, 0, align, size)
    }

    fn realloc(
        &self,
        ptr: u32,
        old_size: u32,
        align: Alignment,
        new_size: u32,
    ) -> Result<u32, Trap> {
        self.cabi_realloc(ptr, old_size, align, new_size)
    }
}
