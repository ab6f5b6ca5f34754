//! Linear-memory model for value marshalling.
//!
//! A [`Memory`] is a cheaply clonable handle over an implementation of
//! [`LinearMemory`]: a 32-bit little-endian address space with an optional
//! bump allocator. Values are read and written through [`MemoryRange`] and
//! [`ReadonlyRange`], which carry a back-reference to their memory and
//! enforce bounds and alignment on every multi-byte access.

use crate::trap::Trap;
use once_cell::sync::Lazy;
use std::fmt;
use std::sync::{Arc, RwLock};

/// Byte alignment of a value or allocation.
///
/// Only the four alignments the canonical layouts use are representable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Alignment {
    /// 1-byte alignment.
    One = 1,
    /// 2-byte alignment.
    Two = 2,
    /// 4-byte alignment.
    Four = 4,
    /// 8-byte alignment.
    Eight = 8,
}

impl Alignment {
    /// Returns the alignment in bytes.
    pub fn bytes(self) -> u32 {
        self as u32
    }

    /// Rounds `offset` up to this alignment.
    pub fn align_up(self, offset: u32) -> u32 {
        let a = self.bytes();
        (offset + a - 1) & !(a - 1)
    }

    /// The largest representable alignment that `ptr` satisfies.
    pub fn of_ptr(ptr: u32) -> Alignment {
        if ptr % 8 == 0 {
            Alignment::Eight
        } else if ptr % 4 == 0 {
            Alignment::Four
        } else if ptr % 2 == 0 {
            Alignment::Two
        } else {
            Alignment::One
        }
    }

    /// Converts a byte count into an alignment, if it is one of the four
    /// representable values.
    pub fn from_bytes(bytes: u32) -> Option<Alignment> {
        match bytes {
            1 => Some(Alignment::One),
            2 => Some(Alignment::Two),
            4 => Some(Alignment::Four),
            8 => Some(Alignment::Eight),
            _ => None,
        }
    }
}

/// Backing storage for a [`Memory`].
///
/// All offsets address a 32-bit space; multi-byte values are little-endian.
/// Implementations provide interior mutability so that source and
/// destination views of the same memory can coexist during a deep copy.
pub trait LinearMemory: Send + Sync {
    /// The number of addressable bytes.
    fn byte_size(&self) -> u32;

    /// Reads `out.len()` bytes starting at `offset`.
    fn read(&self, offset: u32, out: &mut [u8]) -> Result<(), Trap>;

    /// Writes `bytes` starting at `offset`.
    fn write(&self, offset: u32, bytes: &[u8]) -> Result<(), Trap>;

    /// Allocates `size` bytes at the given alignment and returns the
    /// pointer.
    fn alloc(&self, align: Alignment, size: u32) -> Result<u32, Trap>;

    /// Grows (or shrinks) an earlier allocation, preserving its contents up
    /// to the smaller of the two sizes.
    fn realloc(
        &self,
        ptr: u32,
        old_size: u32,
        align: Alignment,
        new_size: u32,
    ) -> Result<u32, Trap>;

    /// Releases an allocation. Memories without allocator support trap.
    fn free(&self, _ptr: u32, _size: u32) -> Result<(), Trap> {
        Err(Trap::FreeUnsupported)
    }
}

/// A shared handle to a linear memory.
#[derive(Clone)]
pub struct Memory {
    inner: Arc<dyn LinearMemory>,
}

impl Memory {
    /// Wraps a [`LinearMemory`] implementation.
    pub fn new(inner: Arc<dyn LinearMemory>) -> Memory {
        Memory { inner }
    }

    /// A growable host-owned memory with a bump allocator.
    pub fn host() -> Memory {
        Memory::new(Arc::new(HostMemory::new()))
    }

    /// The null memory. Every operation on it traps; it stands in where no
    /// memory has been bound yet.
    pub fn null() -> Memory {
        static NULL: Lazy<Arc<NullMemory>> = Lazy::new(|| Arc::new(NullMemory));
        Memory::new(NULL.clone())
    }

    /// The number of addressable bytes.
    pub fn byte_size(&self) -> u32 {
        self.inner.byte_size()
    }

    /// Allocates a fresh range.
    pub fn alloc(&self, align: Alignment, size: u32) -> Result<MemoryRange, Trap> {
        let ptr = self.inner.alloc(align, size)?;
        Ok(MemoryRange::new(self.clone(), ptr, size))
    }

    /// Grows an allocated range, preserving its contents.
    pub fn realloc(&self, range: &MemoryRange, new_size: u32) -> Result<MemoryRange, Trap> {
        let ptr = self
            .inner
            .realloc(range.ptr(), range.len(), range.alignment(), new_size)?;
        Ok(MemoryRange::new(self.clone(), ptr, new_size))
    }

    /// A mutable view over bytes that were allocated elsewhere.
    pub fn preallocated(&self, ptr: u32, size: u32) -> MemoryRange {
        MemoryRange::new(self.clone(), ptr, size)
    }

    /// A read-only view over existing bytes.
    pub fn readonly(&self, ptr: u32, size: u32) -> ReadonlyRange {
        ReadonlyRange::new(self.clone(), ptr, size)
    }

    /// Releases a range on memories with allocator support.
    pub fn free(&self, range: MemoryRange) -> Result<(), Trap> {
        self.inner.free(range.ptr(), range.len())
    }

    /// Whether two handles refer to the same backing memory.
    pub fn same_memory(&self, other: &Memory) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn read(&self, offset: u32, out: &mut [u8]) -> Result<(), Trap> {
        self.inner.read(offset, out)
    }

    pub(crate) fn write(&self, offset: u32, bytes: &[u8]) -> Result<(), Trap> {
        self.inner.write(offset, bytes)
    }
}

impl fmt::Debug for Memory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Memory")
            .field("byte_size", &self.byte_size())
            .finish()
    }
}

macro_rules! range_getters {
    ($ty:ident) => {
        impl $ty {
            /// The absolute pointer this range starts at.
            pub fn ptr(&self) -> u32 {
                self.ptr
            }

            /// The length of the range in bytes.
            pub fn len(&self) -> u32 {
                self.size
            }

            /// Whether the range is empty.
            pub fn is_empty(&self) -> bool {
                self.size == 0
            }

            /// The alignment derived from the range's pointer.
            pub fn alignment(&self) -> Alignment {
                Alignment::of_ptr(self.ptr)
            }

            /// The memory this range reads from.
            pub fn memory(&self) -> &Memory {
                &self.memory
            }

            fn check(&self, offset: u32, width: u32) -> Result<u32, Trap> {
                let end = offset.checked_add(width).ok_or(Trap::OutOfBounds {
                    offset: self.ptr.wrapping_add(offset),
                    len: width,
                    size: self.size,
                })?;
                if end > self.size {
                    return Err(Trap::OutOfBounds {
                        offset: self.ptr.wrapping_add(offset),
                        len: width,
                        size: self.size,
                    });
                }
                let abs = self.ptr + offset;
                if width > 1 && abs % width != 0 {
                    return Err(Trap::UnalignedAccess {
                        offset: abs,
                        align: width,
                    });
                }
                Ok(abs)
            }

            fn load<const N: usize>(&self, offset: u32) -> Result<[u8; N], Trap> {
                let abs = self.check(offset, N as u32)?;
                let mut buf = [0u8; N];
                self.memory.read(abs, &mut buf)?;
                Ok(buf)
            }

            /// Reads an unsigned byte.
            pub fn get_u8(&self, offset: u32) -> Result<u8, Trap> {
                Ok(self.load::<1>(offset)?[0])
            }

            /// Reads a signed byte.
            pub fn get_s8(&self, offset: u32) -> Result<i8, Trap> {
                Ok(self.get_u8(offset)? as i8)
            }

            /// Reads a little-endian `u16`; the offset must be 2-aligned.
            pub fn get_u16(&self, offset: u32) -> Result<u16, Trap> {
                Ok(u16::from_le_bytes(self.load::<2>(offset)?))
            }

            /// Reads a little-endian `i16`; the offset must be 2-aligned.
            pub fn get_s16(&self, offset: u32) -> Result<i16, Trap> {
                Ok(i16::from_le_bytes(self.load::<2>(offset)?))
            }

            /// Reads a little-endian `u32`; the offset must be 4-aligned.
            pub fn get_u32(&self, offset: u32) -> Result<u32, Trap> {
                Ok(u32::from_le_bytes(self.load::<4>(offset)?))
            }

            /// Reads a little-endian `i32`; the offset must be 4-aligned.
            pub fn get_s32(&self, offset: u32) -> Result<i32, Trap> {
                Ok(i32::from_le_bytes(self.load::<4>(offset)?))
            }

            /// Reads a little-endian `u64`; the offset must be 8-aligned.
            pub fn get_u64(&self, offset: u32) -> Result<u64, Trap> {
                Ok(u64::from_le_bytes(self.load::<8>(offset)?))
            }

            /// Reads a little-endian `i64`; the offset must be 8-aligned.
            pub fn get_s64(&self, offset: u32) -> Result<i64, Trap> {
                Ok(i64::from_le_bytes(self.load::<8>(offset)?))
            }

            /// Reads a little-endian `f32`; the offset must be 4-aligned.
            pub fn get_f32(&self, offset: u32) -> Result<f32, Trap> {
                Ok(f32::from_bits(self.get_u32(offset)?))
            }

            /// Reads a little-endian `f64`; the offset must be 8-aligned.
            pub fn get_f64(&self, offset: u32) -> Result<f64, Trap> {
                Ok(f64::from_bits(self.get_u64(offset)?))
            }

            /// Reads `len` raw bytes starting at `offset`.
            pub fn get_bytes(&self, offset: u32, len: u32) -> Result<Vec<u8>, Trap> {
                let end = offset.checked_add(len).ok_or(Trap::OutOfBounds {
                    offset: self.ptr.wrapping_add(offset),
                    len,
                    size: self.size,
                })?;
                if end > self.size {
                    return Err(Trap::OutOfBounds {
                        offset: self.ptr.wrapping_add(offset),
                        len,
                        size: self.size,
                    });
                }
                let mut buf = vec![0u8; len as usize];
                self.memory.read(self.ptr + offset, &mut buf)?;
                Ok(buf)
            }
        }
    };
}

/// A read-only window into a memory.
#[derive(Clone)]
pub struct ReadonlyRange {
    memory: Memory,
    ptr: u32,
    size: u32,
}

impl ReadonlyRange {
    fn new(memory: Memory, ptr: u32, size: u32) -> ReadonlyRange {
        ReadonlyRange { memory, ptr, size }
    }

    /// A sub-window of this range.
    pub fn sub(&self, offset: u32, size: u32) -> ReadonlyRange {
        ReadonlyRange::new(self.memory.clone(), self.ptr + offset, size)
    }
}

range_getters!(ReadonlyRange);

/// A mutable window into a memory.
#[derive(Clone)]
pub struct MemoryRange {
    memory: Memory,
    ptr: u32,
    size: u32,
}

range_getters!(MemoryRange);

impl MemoryRange {
    fn new(memory: Memory, ptr: u32, size: u32) -> MemoryRange {
        MemoryRange { memory, ptr, size }
    }

    /// A mutable sub-window of this range.
    pub fn sub(&self, offset: u32, size: u32) -> MemoryRange {
        MemoryRange::new(self.memory.clone(), self.ptr + offset, size)
    }

    /// This range as a read-only window.
    pub fn as_readonly(&self) -> ReadonlyRange {
        ReadonlyRange::new(self.memory.clone(), self.ptr, self.size)
    }

    fn store(&self, offset: u32, bytes: &[u8]) -> Result<(), Trap> {
        let abs = self.check(offset, bytes.len() as u32)?;
        self.memory.write(abs, bytes)
    }

    /// Writes an unsigned byte.
    pub fn set_u8(&self, offset: u32, value: u8) -> Result<(), Trap> {
        self.store(offset, &[value])
    }

    /// Writes a signed byte.
    pub fn set_s8(&self, offset: u32, value: i8) -> Result<(), Trap> {
        self.set_u8(offset, value as u8)
    }

    /// Writes a little-endian `u16`; the offset must be 2-aligned.
    pub fn set_u16(&self, offset: u32, value: u16) -> Result<(), Trap> {
        self.store(offset, &value.to_le_bytes())
    }

    /// Writes a little-endian `i16`; the offset must be 2-aligned.
    pub fn set_s16(&self, offset: u32, value: i16) -> Result<(), Trap> {
        self.store(offset, &value.to_le_bytes())
    }

    /// Writes a little-endian `u32`; the offset must be 4-aligned.
    pub fn set_u32(&self, offset: u32, value: u32) -> Result<(), Trap> {
        self.store(offset, &value.to_le_bytes())
    }

    /// Writes a little-endian `i32`; the offset must be 4-aligned.
    pub fn set_s32(&self, offset: u32, value: i32) -> Result<(), Trap> {
        self.store(offset, &value.to_le_bytes())
    }

    /// Writes a little-endian `u64`; the offset must be 8-aligned.
    pub fn set_u64(&self, offset: u32, value: u64) -> Result<(), Trap> {
        self.store(offset, &value.to_le_bytes())
    }

    /// Writes a little-endian `i64`; the offset must be 8-aligned.
    pub fn set_s64(&self, offset: u32, value: i64) -> Result<(), Trap> {
        self.store(offset, &value.to_le_bytes())
    }

    /// Writes a little-endian `f32`; the offset must be 4-aligned.
    pub fn set_f32(&self, offset: u32, value: f32) -> Result<(), Trap> {
        self.set_u32(offset, value.to_bits())
    }

    /// Writes a little-endian `f64`; the offset must be 8-aligned.
    pub fn set_f64(&self, offset: u32, value: f64) -> Result<(), Trap> {
        self.set_u64(offset, value.to_bits())
    }

    /// Writes raw bytes starting at `offset`.
    pub fn set_bytes(&self, offset: u32, bytes: &[u8]) -> Result<(), Trap> {
        let end = offset
            .checked_add(bytes.len() as u32)
            .ok_or(Trap::OutOfBounds {
                offset: self.ptr.wrapping_add(offset),
                len: bytes.len() as u32,
                size: self.size,
            })?;
        if end > self.size {
            return Err(Trap::OutOfBounds {
                offset: self.ptr.wrapping_add(offset),
                len: bytes.len() as u32,
                size: self.size,
            });
        }
        self.memory.write(self.ptr + offset, bytes)
    }

    /// Bulk-copies the full contents of `src` to the start of this range.
    pub fn copy_from(&self, src: &ReadonlyRange) -> Result<(), Trap> {
        let bytes = src.get_bytes(0, src.len())?;
        self.set_bytes(0, &bytes)
    }
}

impl fmt::Debug for ReadonlyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadonlyRange")
            .field("ptr", &self.ptr)
            .field("size", &self.size)
            .finish()
    }
}

impl fmt::Debug for MemoryRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryRange")
            .field("ptr", &self.ptr)
            .field("size", &self.size)
            .finish()
    }
}

/// A growable host-owned memory with a bump allocator.
///
/// Offset zero is reserved so that a zero pointer never aliases a live
/// allocation. `free` is accepted and ignored; the bump space is reclaimed
/// when the memory is dropped.
pub struct HostMemory {
    state: RwLock<HostMemoryState>,
}

struct HostMemoryState {
    bytes: Vec<u8>,
    next: u32,
}

const HOST_MEMORY_INITIAL: usize = 64 * 1024;
const HOST_MEMORY_RESERVED: u32 = 8;

impl HostMemory {
    /// Creates an empty host memory.
    pub fn new() -> HostMemory {
        HostMemory {
            state: RwLock::new(HostMemoryState {
                bytes: vec![0; HOST_MEMORY_INITIAL],
                next: HOST_MEMORY_RESERVED,
            }),
        }
    }
}

impl Default for HostMemory {
    fn default() -> HostMemory {
        HostMemory::new()
    }
}

impl LinearMemory for HostMemory {
    fn byte_size(&self) -> u32 {
        self.state.read().unwrap_or_else(|e| e.into_inner()).bytes.len() as u32
    }

    fn read(&self, offset: u32, out: &mut [u8]) -> Result<(), Trap> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        let start = offset as usize;
        let end = start.checked_add(out.len()).ok_or(Trap::OutOfBounds {
            offset,
            len: out.len() as u32,
            size: state.bytes.len() as u32,
        })?;
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

    fn write(&self, offset: u32, bytes: &[u8]) -> Result<(), Trap> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let start = offset as usize;
        let end = start.checked_add(bytes.len()).ok_or(Trap::OutOfBounds {
            offset,
            len: bytes.len() as u32,
            size: state.bytes.len() as u32,
        })?;
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

    fn alloc(&self, align: Alignment, size: u32) -> Result<u32, Trap> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let ptr = align.align_up(state.next);
        let next = ptr
            .checked_add(size)
            .ok_or(Trap::AllocationFailed { align: align.bytes(), size })?;
        if next as usize > state.bytes.len() {
            let mut grown = state.bytes.len().max(HOST_MEMORY_INITIAL);
            while grown < next as usize {
                grown = grown.saturating_mul(2);
            }
            state.bytes.resize(grown, 0);
        }
        state.next = next;
        Ok(ptr)
    }

    fn realloc(
        &self,
        ptr: u32,
        old_size: u32,
        align: Alignment,
        new_size: u32,
    ) -> Result<u32, Trap> {
        if new_size <= old_size {
            return Ok(ptr);
        }
        let new_ptr = self.alloc(align, new_size)?;
        let mut buf = vec![0u8; old_size as usize];
        self.read(ptr, &mut buf)?;
        self.write(new_ptr, &buf)?;
        Ok(new_ptr)
    }

    fn free(&self, _ptr: u32, _size: u32) -> Result<(), Trap> {
        Ok(())
    }
}

/// The memory used before any real memory is bound. Every operation traps.
struct NullMemory;

impl LinearMemory for NullMemory {
    fn byte_size(&self) -> u32 {
        0
    }

    fn read(&self, _offset: u32, _out: &mut [u8]) -> Result<(), Trap> {
        Err(Trap::NullMemory)
    }

    fn write(&self, _offset: u32, _bytes: &[u8]) -> Result<(), Trap> {
        Err(Trap::NullMemory)
    }

    fn alloc(&self, _align: Alignment, _size: u32) -> Result<u32, Trap> {
        Err(Trap::NullMemory)
    }

    fn realloc(
        &self,
        _ptr: u32,
        _old_size: u32,
        _align: Alignment,
        _new_size: u32,
    ) -> Result<u32, Trap> {
        Err(Trap::NullMemory)
    }

    fn free(&self, _ptr: u32, _size: u32) -> Result<(), Trap> {
        Err(Trap::NullMemory)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up() {
        assert_eq!(Alignment::Four.align_up(0), 0);
        assert_eq!(Alignment::Four.align_up(1), 4);
        assert_eq!(Alignment::Four.align_up(4), 4);
        assert_eq!(Alignment::Eight.align_up(9), 16);
        assert_eq!(Alignment::One.align_up(13), 13);
    }

    #[test]
    fn host_memory_round_trip() {
        let memory = Memory::host();
        let range = memory.alloc(Alignment::Eight, 32).unwrap();
        range.set_u32(0, 0x1234_5678).unwrap();
        range.set_u64(8, u64::MAX).unwrap();
        range.set_f64(16, 6.25).unwrap();
        assert_eq!(range.get_u32(0).unwrap(), 0x1234_5678);
        assert_eq!(range.get_u64(8).unwrap(), u64::MAX);
        assert_eq!(range.get_f64(16).unwrap(), 6.25);
    }

    #[test]
    fn unaligned_access_traps() {
        let memory = Memory::host();
        let range = memory.alloc(Alignment::Eight, 16).unwrap();
        let err = range.get_u32(2).unwrap_err();
        assert!(matches!(err, Trap::UnalignedAccess { .. }), "{err}");
        let err = range.set_u64(4, 0).unwrap_err();
        assert!(matches!(err, Trap::UnalignedAccess { .. }), "{err}");
    }

    #[test]
    fn out_of_bounds_traps() {
        let memory = Memory::host();
        let range = memory.alloc(Alignment::Four, 4).unwrap();
        assert!(matches!(
            range.get_u32(4).unwrap_err(),
            Trap::OutOfBounds { .. }
        ));
        assert!(matches!(
            range.get_u64(0).unwrap_err(),
            Trap::OutOfBounds { .. }
        ));
    }

    #[test]
    fn null_memory_traps() {
        let memory = Memory::null();
        assert!(matches!(
            memory.alloc(Alignment::One, 1).unwrap_err(),
            Trap::NullMemory
        ));
        let range = memory.readonly(0, 4);
        assert!(matches!(range.get_u32(0).unwrap_err(), Trap::NullMemory));
    }

    #[test]
    fn realloc_preserves_contents() {
        let memory = Memory::host();
        let range = memory.alloc(Alignment::Four, 8).unwrap();
        range.set_u32(0, 7).unwrap();
        range.set_u32(4, 9).unwrap();
        let grown = memory.realloc(&range, 64).unwrap();
        assert_eq!(grown.len(), 64);
        assert_eq!(grown.get_u32(0).unwrap(), 7);
        assert_eq!(grown.get_u32(4).unwrap(), 9);
    }

    #[test]
    fn memory_grows_past_initial_capacity() {
        let memory = Memory::host();
        let big = memory.alloc(Alignment::Eight, 256 * 1024).unwrap();
        big.set_u8(256 * 1024 - 1, 0xaa).unwrap();
        assert_eq!(big.get_u8(256 * 1024 - 1).unwrap(), 0xaa);
    }
}
