//! Messages exchanged between the main thread and the worker.
//!
//! Flat values cross the message boundary as 32-bit numbers or strings:
//! 64-bit patterns travel as decimal strings so no range is lost in
//! environments without native 64-bit numbers, and `f32` travels as its
//! bit pattern.

use crate::buffer::TransferBuffer;
use std::sync::Arc;
use wasmbridge_abi::{CanonicalOptions, FlatType, FlatValue, Trap, Val};

/// One flat value in message form.
#[derive(Clone, Debug, PartialEq)]
pub enum MessageParam {
    /// A 32-bit pattern.
    I32(i32),
    /// A string: either payload text or a decimal-encoded 64-bit pattern.
    Str(String),
}

impl MessageParam {
    /// Encodes a flat value.
    pub fn from_flat(value: FlatValue) -> MessageParam {
        match value {
            FlatValue::I32(v) => MessageParam::I32(v as i32),
            FlatValue::F32(v) => MessageParam::I32(v.to_bits() as i32),
            FlatValue::I64(v) => MessageParam::Str(v.to_string()),
            FlatValue::F64(v) => MessageParam::Str(v.to_bits().to_string()),
        }
    }

    /// Decodes back into the flat type the signature expects.
    pub fn to_flat(&self, want: FlatType) -> Result<FlatValue, Trap> {
        match (self, want) {
            (MessageParam::I32(v), FlatType::I32) => Ok(FlatValue::I32(*v as u32)),
            (MessageParam::I32(v), FlatType::F32) => {
                Ok(FlatValue::F32(f32::from_bits(*v as u32)))
            }
            (MessageParam::Str(s), FlatType::I64) => {
                let bits = s.parse::<u64>().map_err(|_| Trap::FlatTypeMismatch {
                    have: "string",
                    want: "i64",
                })?;
                Ok(FlatValue::I64(bits))
            }
            (MessageParam::Str(s), FlatType::F64) => {
                let bits = s.parse::<u64>().map_err(|_| Trap::FlatTypeMismatch {
                    have: "string",
                    want: "f64",
                })?;
                Ok(FlatValue::F64(f64::from_bits(bits)))
            }
            (MessageParam::I32(_), want) => Err(Trap::FlatTypeMismatch {
                have: "i32",
                want: want.name(),
            }),
            (MessageParam::Str(_), want) => Err(Trap::FlatTypeMismatch {
                have: "string",
                want: want.name(),
            }),
        }
    }

    /// Encodes a simple host value for a worker call.
    pub fn from_val(value: &Val) -> Result<MessageParam, Trap> {
        match value {
            Val::S32(v) => Ok(MessageParam::I32(*v)),
            Val::U32(v) => Ok(MessageParam::I32(*v as i32)),
            Val::S64(v) => Ok(MessageParam::Str(v.to_string())),
            Val::U64(v) => Ok(MessageParam::Str(v.to_string())),
            Val::String(s) => Ok(MessageParam::Str(s.to_string())),
            other => Err(Trap::ValueMismatch {
                want: "i32 or string",
                got: other.desc(),
            }),
        }
    }
}

/// A handle to the memory a message's parameters point into.
#[derive(Clone)]
pub struct MemoryRef {
    /// The connection-scoped identifier of the buffer.
    pub id: u32,
    /// The buffer itself.
    pub buffer: Arc<TransferBuffer>,
}

/// The reply channel name used to report worker initialisation.
pub const INIT_CHANNEL: &str = "$initializeWorker";

/// A message between the two threads.
pub enum Message {
    /// Worker asks main to run a handler; the worker is parked on the
    /// buffer's lock word until the reply lands in the header.
    CallMain {
        name: String,
        params: Vec<MessageParam>,
        memory: MemoryRef,
    },
    /// Worker reports the outcome of a `CallWorker` (or initialisation,
    /// under [`INIT_CHANNEL`]).
    ReportResult {
        name: String,
        result: Option<MessageParam>,
        error: Option<String>,
    },
    /// Main asks the worker to invoke a guest export.
    CallWorker {
        name: String,
        params: Vec<MessageParam>,
    },
    /// Main asks the worker to instantiate and bind its module.
    InitializeWorker {
        module: Vec<u8>,
        options: CanonicalOptions,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sixty_four_bit_patterns_survive_as_strings() {
        let value = FlatValue::I64(u64::MAX - 7);
        let param = MessageParam::from_flat(value);
        assert_eq!(param, MessageParam::Str((u64::MAX - 7).to_string()));
        assert_eq!(param.to_flat(FlatType::I64).unwrap(), value);
    }

    #[test]
    fn f32_travels_as_bits() {
        let param = MessageParam::from_flat(FlatValue::F32(2.5));
        assert_eq!(param, MessageParam::I32(2.5f32.to_bits() as i32));
        assert_eq!(
            param.to_flat(FlatType::F32).unwrap(),
            FlatValue::F32(2.5)
        );
    }

    #[test]
    fn mismatched_shapes_trap() {
        let param = MessageParam::I32(1);
        assert!(param.to_flat(FlatType::I64).is_err());
        let param = MessageParam::Str("not a number".to_string());
        assert!(param.to_flat(FlatType::I64).is_err());
    }
}
