//! The transfer buffer: a fixed header followed by a bump area.
//!
//! Header layout, relative to the start of the buffer:
//!
//! ```text
//!  off  size  field
//!    0     4  lock              (futex word; 0 = pending, 1 = done)
//!    4     4  error-code        (0 = none, 1 = no-handler, 2 = rejection)
//!    8     4  result-type-tag   (0 = void, 1 = float, 2 = signed, 3 = unsigned)
//!   12     8  result-value
//!   20     4  next-free         (bump pointer past the header)
//!   24     -  bump area
//! ```
//!
//! The buffer is written exclusively by the caller until the lock word is
//! released, and exclusively by the callee from observing a zero lock to
//! writing back one; the lock-word store orders everything else.

use crate::futex::{Futex, WaitOutcome};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use wasmbridge_abi::{Alignment, LinearMemory, Memory, Trap};

pub const LOCK_OFFSET: u32 = 0;
pub const ERROR_CODE_OFFSET: u32 = 4;
pub const RESULT_TYPE_OFFSET: u32 = 8;
pub const RESULT_VALUE_OFFSET: u32 = 12;
pub const NEXT_FREE_OFFSET: u32 = 20;
/// Where the bump area begins.
pub const HEADER_SIZE: u32 = 24;

/// Lock word value while the call is in flight.
pub const LOCK_PENDING: u32 = 0;
/// Lock word value once the callee has written its result.
pub const LOCK_DONE: u32 = 1;

/// What went wrong on the callee side, if anything.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BridgeErrorCode {
    /// The call completed.
    None,
    /// No handler was registered under the requested name.
    NoHandler,
    /// The handler failed or its promise rejected.
    Rejection,
}

impl BridgeErrorCode {
    /// The wire value.
    pub fn to_u32(self) -> u32 {
        match self {
            BridgeErrorCode::None => 0,
            BridgeErrorCode::NoHandler => 1,
            BridgeErrorCode::Rejection => 2,
        }
    }

    /// Decodes a wire value; unknown codes read as rejections.
    pub fn from_u32(value: u32) -> BridgeErrorCode {
        match value {
            0 => BridgeErrorCode::None,
            1 => BridgeErrorCode::NoHandler,
            _ => BridgeErrorCode::Rejection,
        }
    }
}

/// How the 8-byte result field is typed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResultTag {
    Void,
    Float,
    Signed,
    Unsigned,
}

impl ResultTag {
    /// The wire value.
    pub fn to_u32(self) -> u32 {
        match self {
            ResultTag::Void => 0,
            ResultTag::Float => 1,
            ResultTag::Signed => 2,
            ResultTag::Unsigned => 3,
        }
    }

    /// Decodes a wire value; unknown tags read as void.
    pub fn from_u32(value: u32) -> ResultTag {
        match value {
            1 => ResultTag::Float,
            2 => ResultTag::Signed,
            3 => ResultTag::Unsigned,
            _ => ResultTag::Void,
        }
    }
}

/// A shared transfer buffer: the header fields plus a bump-allocated data
/// area exposed to the codecs as a [`Memory`].
pub struct TransferBuffer {
    futex: Futex,
    error_code: AtomicU32,
    result_type: AtomicU32,
    result_value: AtomicU64,
    next_free: AtomicU32,
    data: Mutex<Box<[u8]>>,
    size: u32,
}

impl TransferBuffer {
    /// A buffer with `size` total bytes, header included.
    pub fn new(size: u32) -> Arc<TransferBuffer> {
        assert!(size > HEADER_SIZE, "buffer must fit more than the header");
        Arc::new(TransferBuffer {
            futex: Futex::new(LOCK_PENDING),
            error_code: AtomicU32::new(0),
            result_type: AtomicU32::new(0),
            result_value: AtomicU64::new(0),
            next_free: AtomicU32::new(HEADER_SIZE),
            data: Mutex::new(vec![0u8; size as usize].into_boxed_slice()),
            size,
        })
    }

    /// Rewinds the buffer for a fresh call: pending lock, no error, void
    /// result, empty bump area.
    pub fn reset(&self) {
        self.futex.store(LOCK_PENDING);
        self.error_code.store(0, Ordering::Relaxed);
        self.result_type.store(ResultTag::Void.to_u32(), Ordering::Relaxed);
        self.result_value.store(0, Ordering::Relaxed);
        self.next_free.store(HEADER_SIZE, Ordering::Relaxed);
    }

    /// The current lock word.
    pub fn lock_word(&self) -> u32 {
        self.futex.load()
    }

    /// Blocks until the lock word leaves [`LOCK_PENDING`].
    pub fn wait_done(&self, timeout: Option<Duration>) -> WaitOutcome {
        self.futex.wait(LOCK_PENDING, timeout)
    }

    /// Publishes the written result: releases the lock word and wakes the
    /// waiter.
    pub fn complete(&self) {
        self.futex.store_notify(LOCK_DONE);
    }

    /// The callee-reported error code.
    pub fn error_code(&self) -> BridgeErrorCode {
        BridgeErrorCode::from_u32(self.error_code.load(Ordering::Relaxed))
    }

    /// Records the callee-reported error code.
    pub fn set_error_code(&self, code: BridgeErrorCode) {
        self.error_code.store(code.to_u32(), Ordering::Relaxed);
    }

    /// The typed result field.
    pub fn result(&self) -> (ResultTag, u64) {
        (
            ResultTag::from_u32(self.result_type.load(Ordering::Relaxed)),
            self.result_value.load(Ordering::Relaxed),
        )
    }

    /// Writes the typed result field.
    pub fn set_result(&self, tag: ResultTag, bits: u64) {
        self.result_type.store(tag.to_u32(), Ordering::Relaxed);
        self.result_value.store(bits, Ordering::Relaxed);
    }

    /// This buffer as a codec-accessible memory.
    pub fn memory(self: &Arc<Self>) -> Memory {
        Memory::new(self.clone())
    }
}

impl LinearMemory for TransferBuffer {
    fn byte_size(&self) -> u32 {
        self.size
    }

    fn read(&self, offset: u32, out: &mut [u8]) -> Result<(), Trap> {
        let len = out.len() as u32;
        let end = offset.checked_add(len).ok_or(Trap::OutOfBounds {
            offset,
            len,
            size: self.size,
        })?;
        if end > self.size {
            return Err(Trap::OutOfBounds {
                offset,
                len,
                size: self.size,
            });
        }
        // Header fields live in their atomics; the data area is plain
        // bytes. Reads of the individual fields are allowed so the header
        // stays observable at its published offsets.
        match (offset, len) {
            _ if offset >= HEADER_SIZE => {
                let data = self.data.lock().unwrap_or_else(|e| e.into_inner());
                out.copy_from_slice(&data[offset as usize..end as usize]);
                Ok(())
            }
            (LOCK_OFFSET, 4) => {
                out.copy_from_slice(&self.futex.load().to_le_bytes());
                Ok(())
            }
            (ERROR_CODE_OFFSET, 4) => {
                out.copy_from_slice(&self.error_code.load(Ordering::Relaxed).to_le_bytes());
                Ok(())
            }
            (RESULT_TYPE_OFFSET, 4) => {
                out.copy_from_slice(&self.result_type.load(Ordering::Relaxed).to_le_bytes());
                Ok(())
            }
            (RESULT_VALUE_OFFSET, 8) => {
                out.copy_from_slice(&self.result_value.load(Ordering::Relaxed).to_le_bytes());
                Ok(())
            }
            (NEXT_FREE_OFFSET, 4) => {
                out.copy_from_slice(&self.next_free.load(Ordering::Relaxed).to_le_bytes());
                Ok(())
            }
            _ => Err(Trap::OutOfBounds {
                offset,
                len,
                size: HEADER_SIZE,
            }),
        }
    }

    fn write(&self, offset: u32, bytes: &[u8]) -> Result<(), Trap> {
        let len = bytes.len() as u32;
        let end = offset.checked_add(len).ok_or(Trap::OutOfBounds {
            offset,
            len,
            size: self.size,
        })?;
        if end > self.size {
            return Err(Trap::OutOfBounds {
                offset,
                len,
                size: self.size,
            });
        }
        if offset < HEADER_SIZE {
            // The codecs never address the header; field accessors do.
            return Err(Trap::OutOfBounds {
                offset,
                len,
                size: HEADER_SIZE,
            });
        }
        let mut data = self.data.lock().unwrap_or_else(|e| e.into_inner());
        data[offset as usize..end as usize].copy_from_slice(bytes);
        Ok(())
    }

    fn alloc(&self, align: Alignment, size: u32) -> Result<u32, Trap> {
        let mut current = self.next_free.load(Ordering::Relaxed);
        loop {
            let ptr = align.align_up(current);
            let next = ptr.checked_add(size).ok_or(Trap::AllocationFailed {
                align: align.bytes(),
                size,
            })?;
            if next > self.size {
                return Err(Trap::AllocationFailed {
                    align: align.bytes(),
                    size,
                });
            }
            match self.next_free.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(ptr),
                Err(observed) => current = observed,
            }
        }
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
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_fields_are_visible_at_their_offsets() {
        let buffer = TransferBuffer::new(256);
        buffer.set_error_code(BridgeErrorCode::NoHandler);
        buffer.set_result(ResultTag::Unsigned, 14);
        buffer.complete();

        let memory = buffer.memory();
        let header = memory.readonly(0, HEADER_SIZE);
        assert_eq!(header.get_u32(LOCK_OFFSET).unwrap(), LOCK_DONE);
        assert_eq!(header.get_u32(ERROR_CODE_OFFSET).unwrap(), 1);
        assert_eq!(header.get_u32(RESULT_TYPE_OFFSET).unwrap(), 3);
        assert_eq!(header.get_u32(NEXT_FREE_OFFSET).unwrap(), HEADER_SIZE);
    }

    #[test]
    fn bump_allocation_respects_alignment_and_bounds() {
        let buffer = TransferBuffer::new(64);
        let memory = buffer.memory();
        let a = memory.alloc(Alignment::One, 3).unwrap();
        assert_eq!(a.ptr(), HEADER_SIZE);
        let b = memory.alloc(Alignment::Eight, 8).unwrap();
        assert_eq!(b.ptr() % 8, 0);
        assert!(memory.alloc(Alignment::One, 64).is_err());
    }

    #[test]
    fn reset_rewinds_the_bump_pointer() {
        let buffer = TransferBuffer::new(64);
        let memory = buffer.memory();
        memory.alloc(Alignment::One, 16).unwrap();
        buffer.set_result(ResultTag::Signed, 5);
        buffer.complete();
        buffer.reset();
        assert_eq!(buffer.lock_word(), LOCK_PENDING);
        assert_eq!(buffer.result(), (ResultTag::Void, 0));
        assert_eq!(memory.alloc(Alignment::One, 1).unwrap().ptr(), HEADER_SIZE);
    }

    #[test]
    fn codec_writes_stay_out_of_the_header() {
        let buffer = TransferBuffer::new(64);
        let memory = buffer.memory();
        let range = memory.preallocated(4, 8);
        assert!(range.set_u32(0, 1).is_err());
    }
}
