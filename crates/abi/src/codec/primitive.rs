//! Codecs for the fixed-size primitive types.
//!
//! Integers travel as the unsigned bit pattern of their `i32`/`i64`
//! carrier. On lift the pattern is reduced modulo the type's width and then
//! sign-adjusted, so a sign-extended carrier and a zero-extended one lift
//! to the same value.

use super::{CallContext, CanonicalType, TypeKind};
use crate::flat::{FlatReader, FlatType, FlatValue, FlatValues};
use crate::memory::{Alignment, Memory, MemoryRange, ReadonlyRange};
use crate::trap::Trap;
use crate::val::Val;

/// The canonical quiet-NaN bit pattern for `f32`.
pub const CANONICAL_NAN32: u32 = 0x7fc0_0000;
/// The canonical quiet-NaN bit pattern for `f64`.
pub const CANONICAL_NAN64: u64 = 0x7ff8_0000_0000_0000;

macro_rules! integer_codec {
    (
        $ty:ident, $kind:ident, $desc:literal, $rust:ty, $size:expr, $align:expr,
        $get:ident, $set:ident, $carrier:ident, $carrier_as:ident,
        lift: $lift:expr, lower: $lower:expr
    ) => {
        #[derive(Debug)]
        pub struct $ty;

        impl CanonicalType for $ty {
            fn kind(&self) -> TypeKind {
                TypeKind::$kind
            }

            fn size(&self) -> u32 {
                $size
            }

            fn alignment(&self) -> Alignment {
                $align
            }

            fn flat_types(&self) -> &[FlatType] {
                &[FlatType::$carrier]
            }

            fn load(
                &self,
                range: &ReadonlyRange,
                offset: u32,
                _cx: &CallContext,
            ) -> Result<Val, Trap> {
                Ok(Val::$kind(range.$get(offset)?))
            }

            fn lift_flat(
                &self,
                _memory: &Memory,
                src: &mut FlatReader<'_>,
                _cx: &CallContext,
            ) -> Result<Val, Trap> {
                let pattern = src.take()?.$carrier_as()?;
                let lifted: $rust = ($lift)(pattern);
                Ok(Val::$kind(lifted))
            }

            fn store(
                &self,
                range: &MemoryRange,
                offset: u32,
                value: &Val,
                _cx: &CallContext,
            ) -> Result<(), Trap> {
                match value {
                    Val::$kind(v) => range.$set(offset, *v),
                    other => Err(other.mismatch($desc)),
                }
            }

            fn lower_flat(
                &self,
                out: &mut FlatValues,
                _memory: &Memory,
                value: &Val,
                _cx: &CallContext,
            ) -> Result<(), Trap> {
                match value {
                    Val::$kind(v) => {
                        out.push(FlatValue::$carrier(($lower)(*v)));
                        Ok(())
                    }
                    other => Err(other.mismatch($desc)),
                }
            }
        }
    };
}

integer_codec!(
    U8Type, U8, "u8", u8, 1, Alignment::One, get_u8, set_u8, I32, as_i32,
    lift: |p: u32| p as u8,
    lower: |v| u32::from(v)
);

integer_codec!(
    S8Type, S8, "s8", i8, 1, Alignment::One, get_s8, set_s8, I32, as_i32,
    lift: |p: u32| p as u8 as i8,
    lower: |v| v as u8 as u32
);

integer_codec!(
    U16Type, U16, "u16", u16, 2, Alignment::Two, get_u16, set_u16, I32, as_i32,
    lift: |p: u32| p as u16,
    lower: |v| u32::from(v)
);

integer_codec!(
    S16Type, S16, "s16", i16, 2, Alignment::Two, get_s16, set_s16, I32, as_i32,
    lift: |p: u32| p as u16 as i16,
    lower: |v| v as u16 as u32
);

integer_codec!(
    U32Type, U32, "u32", u32, 4, Alignment::Four, get_u32, set_u32, I32, as_i32,
    lift: |p: u32| p,
    lower: |v| v
);

integer_codec!(
    S32Type, S32, "s32", i32, 4, Alignment::Four, get_s32, set_s32, I32, as_i32,
    lift: |p: u32| p as i32,
    lower: |v| v as u32
);

integer_codec!(
    U64Type, U64, "u64", u64, 8, Alignment::Eight, get_u64, set_u64, I64, as_i64,
    lift: |p: u64| p,
    lower: |v| v
);

integer_codec!(
    S64Type, S64, "s64", i64, 8, Alignment::Eight, get_s64, set_s64, I64, as_i64,
    lift: |p: u64| p as i64,
    lower: |v| v as u64
);

/// `bool`: stored as one byte; any non-zero pattern lifts to `true`.
#[derive(Debug)]
pub struct BoolType;

impl CanonicalType for BoolType {
    fn kind(&self) -> TypeKind {
        TypeKind::Bool
    }

    fn size(&self) -> u32 {
        1
    }

    fn alignment(&self) -> Alignment {
        Alignment::One
    }

    fn flat_types(&self) -> &[FlatType] {
        &[FlatType::I32]
    }

    fn load(&self, range: &ReadonlyRange, offset: u32, _cx: &CallContext) -> Result<Val, Trap> {
        Ok(Val::Bool(range.get_u8(offset)? != 0))
    }

    fn lift_flat(
        &self,
        _memory: &Memory,
        src: &mut FlatReader<'_>,
        _cx: &CallContext,
    ) -> Result<Val, Trap> {
        Ok(Val::Bool(src.take()?.as_i32()? != 0))
    }

    fn store(
        &self,
        range: &MemoryRange,
        offset: u32,
        value: &Val,
        _cx: &CallContext,
    ) -> Result<(), Trap> {
        match value {
            Val::Bool(v) => range.set_u8(offset, u8::from(*v)),
            other => Err(other.mismatch("bool")),
        }
    }

    fn lower_flat(
        &self,
        out: &mut FlatValues,
        _memory: &Memory,
        value: &Val,
        _cx: &CallContext,
    ) -> Result<(), Trap> {
        match value {
            Val::Bool(v) => {
                out.push(FlatValue::I32(u32::from(*v)));
                Ok(())
            }
            other => Err(other.mismatch("bool")),
        }
    }
}

/// `char`: stored as a `u32` Unicode scalar value. Surrogates and values
/// past the Unicode maximum trap.
#[derive(Debug)]
pub struct CharType;

impl CharType {
    fn decode(pattern: u32) -> Result<Val, Trap> {
        char::from_u32(pattern)
            .map(Val::Char)
            .ok_or(Trap::InvalidChar { value: pattern })
    }
}

impl CanonicalType for CharType {
    fn kind(&self) -> TypeKind {
        TypeKind::Char
    }

    fn size(&self) -> u32 {
        4
    }

    fn alignment(&self) -> Alignment {
        Alignment::Four
    }

    fn flat_types(&self) -> &[FlatType] {
        &[FlatType::I32]
    }

    fn load(&self, range: &ReadonlyRange, offset: u32, _cx: &CallContext) -> Result<Val, Trap> {
        CharType::decode(range.get_u32(offset)?)
    }

    fn lift_flat(
        &self,
        _memory: &Memory,
        src: &mut FlatReader<'_>,
        _cx: &CallContext,
    ) -> Result<Val, Trap> {
        CharType::decode(src.take()?.as_i32()?)
    }

    fn store(
        &self,
        range: &MemoryRange,
        offset: u32,
        value: &Val,
        _cx: &CallContext,
    ) -> Result<(), Trap> {
        match value {
            Val::Char(c) => range.set_u32(offset, *c as u32),
            other => Err(other.mismatch("char")),
        }
    }

    fn lower_flat(
        &self,
        out: &mut FlatValues,
        _memory: &Memory,
        value: &Val,
        _cx: &CallContext,
    ) -> Result<(), Trap> {
        match value {
            Val::Char(c) => {
                out.push(FlatValue::I32(*c as u32));
                Ok(())
            }
            other => Err(other.mismatch("char")),
        }
    }
}

fn canonical32(v: f32) -> f32 {
    if v.is_nan() {
        f32::from_bits(CANONICAL_NAN32)
    } else {
        v
    }
}

fn canonical64(v: f64) -> f64 {
    if v.is_nan() {
        f64::from_bits(CANONICAL_NAN64)
    } else {
        v
    }
}

macro_rules! float_codec {
    (
        $ty:ident, $kind:ident, $val:ident, $desc:literal, $size:expr, $align:expr,
        $get:ident, $set:ident, $carrier:ident, $carrier_as:ident, $canon:ident
    ) => {
        /// NaN payloads are replaced with the canonical quiet NaN on both
        /// lift and lower.
        #[derive(Debug)]
        pub struct $ty;

        impl CanonicalType for $ty {
            fn kind(&self) -> TypeKind {
                TypeKind::$kind
            }

            fn size(&self) -> u32 {
                $size
            }

            fn alignment(&self) -> Alignment {
                $align
            }

            fn flat_types(&self) -> &[FlatType] {
                &[FlatType::$carrier]
            }

            fn load(
                &self,
                range: &ReadonlyRange,
                offset: u32,
                _cx: &CallContext,
            ) -> Result<Val, Trap> {
                Ok(Val::$val($canon(range.$get(offset)?)))
            }

            fn lift_flat(
                &self,
                _memory: &Memory,
                src: &mut FlatReader<'_>,
                _cx: &CallContext,
            ) -> Result<Val, Trap> {
                Ok(Val::$val($canon(src.take()?.$carrier_as()?)))
            }

            fn store(
                &self,
                range: &MemoryRange,
                offset: u32,
                value: &Val,
                _cx: &CallContext,
            ) -> Result<(), Trap> {
                match value {
                    Val::$val(v) => range.$set(offset, $canon(*v)),
                    other => Err(other.mismatch($desc)),
                }
            }

            fn lower_flat(
                &self,
                out: &mut FlatValues,
                _memory: &Memory,
                value: &Val,
                _cx: &CallContext,
            ) -> Result<(), Trap> {
                match value {
                    Val::$val(v) => {
                        out.push(FlatValue::$carrier($canon(*v)));
                        Ok(())
                    }
                    other => Err(other.mismatch($desc)),
                }
            }
        }
    };
}

float_codec!(
    F32Type, F32, Float32, "f32", 4, Alignment::Four, get_f32, set_f32, F32, as_f32,
    canonical32
);

float_codec!(
    F64Type, F64, Float64, "f64", 8, Alignment::Eight, get_f64, set_f64, F64, as_f64,
    canonical64
);
