//! In-process doubles for the engine seam, used by this workspace's test
//! suites.
//!
//! A [`MockInstance`] is a bag of named closures over a growable byte
//! memory with a built-in bump `cabi_realloc`. Closures registered as
//! exports receive the instance itself so they can touch memory or call
//! back through linked imports, which is enough to emulate the guest side
//! of every calling convention without a real engine.

use crate::bindings::ImportTable;
use crate::engine::{GuestMemory, ModuleInstance, WasmEngine, CABI_REALLOC};
use crate::func::CoreFn;
use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, Weak};
use wasmbridge_abi::{Alignment, FlatValue, Trap};

/// The linear memory of a [`MockInstance`].
pub struct MockMemory {
    state: Mutex<MockMemoryState>,
}

struct MockMemoryState {
    bytes: Vec<u8>,
    next: u32,
}

impl MockMemory {
    fn new() -> MockMemory {
        MockMemory {
            state: Mutex::new(MockMemoryState {
                bytes: vec![0; 64 * 1024],
                next: 8,
            }),
        }
    }

    /// Bump-allocates guest memory.
    pub fn alloc(&self, align: Alignment, size: u32) -> u32 {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let ptr = align.align_up(state.next);
        let end = (ptr + size) as usize;
        if end > state.bytes.len() {
            let grown = state.bytes.len().max(1).saturating_mul(2).max(end);
            state.bytes.resize(grown, 0);
        }
        state.next = ptr + size;
        ptr
    }

    /// Writes raw bytes.
    pub fn write_bytes(&self, offset: u32, bytes: &[u8]) -> Result<(), Trap> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let start = offset as usize;
        let end = start + bytes.len();
        if end > state.bytes.len() {
            return Err(Trap::OutOfBounds {
                offset,
                len: bytes.len() as u32,
                size: state.bytes.len() as u32,
            });
        }
        state.bytes[start..end].copy_from_slice(bytes);
        Ok(())
    }

    /// Reads raw bytes.
    pub fn read_bytes(&self, offset: u32, out: &mut [u8]) -> Result<(), Trap> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let start = offset as usize;
        let end = start + out.len();
        if end > state.bytes.len() {
            return Err(Trap::OutOfBounds {
                offset,
                len: out.len() as u32,
                size: state.bytes.len() as u32,
            });
        }
        out.copy_from_slice(&state.bytes[start..end]);
        Ok(())
    }

    /// Reads a little-endian `u32`.
    pub fn read_u32(&self, offset: u32) -> Result<u32, Trap> {
        let mut buf = [0u8; 4];
        self.read_bytes(offset, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    /// Writes a little-endian `u32`.
    pub fn write_u32(&self, offset: u32, value: u32) -> Result<(), Trap> {
        self.write_bytes(offset, &value.to_le_bytes())
    }

    fn size(&self) -> u32 {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).bytes.len() as u32
    }
}

type MockFn = Box<dyn Fn(&MockInstance, &[FlatValue]) -> Result<Vec<FlatValue>> + Send + Sync>;

/// A scriptable stand-in for an instantiated module.
pub struct MockInstance {
    memory: MockMemory,
    funcs: RwLock<HashMap<String, MockFn>>,
    imports: RwLock<HashMap<(String, String), CoreFn>>,
    weak_self: RwLock<Weak<MockInstance>>,
}

impl MockInstance {
    /// An instance with no exports beyond `cabi_realloc`.
    pub fn new() -> Arc<MockInstance> {
        let instance = Arc::new(MockInstance {
            memory: MockMemory::new(),
            funcs: RwLock::new(HashMap::new()),
            imports: RwLock::new(HashMap::new()),
            weak_self: RwLock::new(Weak::new()),
        });
        *instance.weak_self.write().unwrap_or_else(|e| e.into_inner()) =
            Arc::downgrade(&instance);
        instance
    }

    /// Registers an export.
    pub fn define<F>(&self, name: &str, f: F)
    where
        F: Fn(&MockInstance, &[FlatValue]) -> Result<Vec<FlatValue>> + Send + Sync + 'static,
    {
        self.funcs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), Box::new(f));
    }

    /// Wires the functions of an import table so exports can call back
    /// into the host.
    pub fn link_imports(&self, table: &ImportTable) {
        let mut imports = self.imports.write().unwrap_or_else(|e| e.into_inner());
        for (module, funcs) in table.modules() {
            for (name, func) in funcs {
                imports.insert((module.to_string(), name.clone()), func.clone());
            }
        }
    }

    /// Calls a linked import the way guest code would.
    pub fn call_import(
        &self,
        module: &str,
        name: &str,
        args: &[FlatValue],
    ) -> Result<Vec<FlatValue>> {
        let func = self
            .imports
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(module.to_string(), name.to_string()))
            .cloned()
            .with_context(|| format!("import `{module}::{name}` is not linked"))?;
        let this = self
            .weak_self
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .upgrade()
            .context("instance was dropped")?;
        let memory = GuestMemory::new(this);
        func(&memory, args)
    }

    /// The backing memory.
    pub fn memory(&self) -> &MockMemory {
        &self.memory
    }
}

impl ModuleInstance for MockInstance {
    fn invoke(&self, name: &str, args: &[FlatValue]) -> Result<Vec<FlatValue>> {
        if name == CABI_REALLOC {
            let (ptr, old_size, align, new_size) = match args {
                [FlatValue::I32(a), FlatValue::I32(b), FlatValue::I32(c), FlatValue::I32(d)] => {
                    (*a, *b, *c, *d)
                }
                _ => bail!("bad cabi_realloc arguments"),
            };
            let align = Alignment::from_bytes(align).context("bad alignment")?;
            if new_size <= old_size {
                return Ok(vec![FlatValue::I32(ptr)]);
            }
            let new_ptr = self.memory.alloc(align, new_size);
            if old_size > 0 {
                let mut buf = vec![0u8; old_size as usize];
                self.memory.read_bytes(ptr, &mut buf)?;
                self.memory.write_bytes(new_ptr, &buf)?;
            }
            return Ok(vec![FlatValue::I32(new_ptr)]);
        }
        let funcs = self.funcs.read().unwrap_or_else(|e| e.into_inner());
        let func = funcs
            .get(name)
            .with_context(|| format!("no export named `{name}`"))?;
        func(self, args)
    }

    fn has_export(&self, name: &str) -> bool {
        name == CABI_REALLOC
            || self
                .funcs
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .contains_key(name)
    }

    fn memory_size(&self) -> u32 {
        self.memory.size()
    }

    fn memory_read(&self, offset: u32, out: &mut [u8]) -> Result<(), Trap> {
        self.memory.read_bytes(offset, out)
    }

    fn memory_write(&self, offset: u32, bytes: &[u8]) -> Result<(), Trap> {
        self.memory.write_bytes(offset, bytes)
    }
}

/// An engine whose instantiation is a caller-provided closure.
pub struct MockEngine {
    build: Box<dyn Fn(&[u8], &ImportTable) -> Result<Arc<dyn ModuleInstance>> + Send + Sync>,
}

impl MockEngine {
    /// An engine that builds instances with `build`.
    pub fn new<F>(build: F) -> MockEngine
    where
        F: Fn(&[u8], &ImportTable) -> Result<Arc<dyn ModuleInstance>> + Send + Sync + 'static,
    {
        MockEngine {
            build: Box::new(build),
        }
    }
}

impl WasmEngine for MockEngine {
    fn instantiate(
        &self,
        module: &[u8],
        imports: &ImportTable,
    ) -> Result<Arc<dyn ModuleInstance>> {
        (self.build)(module, imports)
    }
}
