//! Flat values: the representation used on the host/guest calling surface.
//!
//! Every value crossing a call boundary is a sequence of core WebAssembly
//! stack values. Integers travel as their unsigned bit pattern; the typed
//! codecs apply signedness on top.

use crate::trap::Trap;
use smallvec::SmallVec;

/// The largest number of flat values a parameter list may occupy before it
/// is spilled to linear memory.
pub const MAX_FLAT_PARAMS: usize = 16;

/// The largest number of flat values a result may occupy before it is
/// returned through a caller-allocated region.
pub const MAX_FLAT_RESULTS: usize = 1;

/// A core calling-surface value type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FlatType {
    /// A 32-bit integer.
    I32,
    /// A 64-bit integer.
    I64,
    /// A 32-bit float.
    F32,
    /// A 64-bit float.
    F64,
}

impl FlatType {
    /// The name used in diagnostics.
    pub fn name(self) -> &'static str {
        match self {
            FlatType::I32 => "i32",
            FlatType::I64 => "i64",
            FlatType::F32 => "f32",
            FlatType::F64 => "f64",
        }
    }

    /// The pairwise join used when variant cases share flat slots: equal
    /// types stay, `i32` and `f32` join as `i32`, everything else widens to
    /// `i64`.
    pub fn join(self, other: FlatType) -> FlatType {
        use FlatType::*;
        match (self, other) {
            (a, b) if a == b => a,
            (I32, F32) | (F32, I32) => I32,
            _ => I64,
        }
    }
}

/// A core calling-surface value. Integer payloads hold the raw unsigned bit
/// pattern.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum FlatValue {
    /// A 32-bit integer bit pattern.
    I32(u32),
    /// A 64-bit integer bit pattern.
    I64(u64),
    /// A 32-bit float.
    F32(f32),
    /// A 64-bit float.
    F64(f64),
}

impl FlatValue {
    /// The type of this value.
    pub fn ty(self) -> FlatType {
        match self {
            FlatValue::I32(_) => FlatType::I32,
            FlatValue::I64(_) => FlatType::I64,
            FlatValue::F32(_) => FlatType::F32,
            FlatValue::F64(_) => FlatType::F64,
        }
    }

    /// The all-zero value of `ty`, used to pad unused variant slots.
    pub fn zero(ty: FlatType) -> FlatValue {
        match ty {
            FlatType::I32 => FlatValue::I32(0),
            FlatType::I64 => FlatValue::I64(0),
            FlatType::F32 => FlatValue::F32(0.0),
            FlatType::F64 => FlatValue::F64(0.0),
        }
    }

    /// Requires an `i32` bit pattern.
    pub fn as_i32(self) -> Result<u32, Trap> {
        match self {
            FlatValue::I32(v) => Ok(v),
            other => Err(Trap::FlatTypeMismatch {
                have: other.ty().name(),
                want: FlatType::I32.name(),
            }),
        }
    }

    /// Requires an `i64` bit pattern.
    pub fn as_i64(self) -> Result<u64, Trap> {
        match self {
            FlatValue::I64(v) => Ok(v),
            other => Err(Trap::FlatTypeMismatch {
                have: other.ty().name(),
                want: FlatType::I64.name(),
            }),
        }
    }

    /// Requires an `f32`.
    pub fn as_f32(self) -> Result<f32, Trap> {
        match self {
            FlatValue::F32(v) => Ok(v),
            other => Err(Trap::FlatTypeMismatch {
                have: other.ty().name(),
                want: FlatType::F32.name(),
            }),
        }
    }

    /// Requires an `f64`.
    pub fn as_f64(self) -> Result<f64, Trap> {
        match self {
            FlatValue::F64(v) => Ok(v),
            other => Err(Trap::FlatTypeMismatch {
                have: other.ty().name(),
                want: FlatType::F64.name(),
            }),
        }
    }

    /// Reinterprets this value as `want`, preserving the little-endian bit
    /// pattern.
    ///
    /// The closed cast set is: `i32`↔`f32`, `i64`↔`f64`, `i32`→`i64`
    /// (zero-extend), `i64`→`i32` (traps when the value exceeds `u32`),
    /// plus the compositions through `i32` that connect the 32-bit floats
    /// to `i64`.
    pub fn reinterpret(self, want: FlatType) -> Result<FlatValue, Trap> {
        use FlatType::*;
        if self.ty() == want {
            return Ok(self);
        }
        match (self, want) {
            (FlatValue::I32(v), F32) => Ok(FlatValue::F32(f32::from_bits(v))),
            (FlatValue::F32(v), I32) => Ok(FlatValue::I32(v.to_bits())),
            (FlatValue::I64(v), F64) => Ok(FlatValue::F64(f64::from_bits(v))),
            (FlatValue::F64(v), I64) => Ok(FlatValue::I64(v.to_bits())),
            (FlatValue::I32(v), I64) => Ok(FlatValue::I64(u64::from(v))),
            (FlatValue::I64(v), I32) => {
                let narrow =
                    u32::try_from(v).map_err(|_| Trap::NarrowingOverflow { value: v })?;
                Ok(FlatValue::I32(narrow))
            }
            // Casts that compose through the narrower integer.
            (FlatValue::I64(_), F32) => self.reinterpret(I32)?.reinterpret(F32),
            (FlatValue::F32(_), I64) => self.reinterpret(I32)?.reinterpret(I64),
            (value, want) => Err(Trap::FlatTypeMismatch {
                have: value.ty().name(),
                want: want.name(),
            }),
        }
    }
}

/// The flat value buffer used when lowering. The inline capacity covers the
/// largest non-spilled parameter list.
pub type FlatValues = SmallVec<[FlatValue; MAX_FLAT_PARAMS]>;

/// A cursor over the flat values of one call.
pub struct FlatReader<'a> {
    values: &'a [FlatValue],
    pos: usize,
}

impl<'a> FlatReader<'a> {
    /// Starts reading at the first value.
    pub fn new(values: &'a [FlatValue]) -> FlatReader<'a> {
        FlatReader { values, pos: 0 }
    }

    /// Takes the next value, trapping when the stream is exhausted.
    pub fn take(&mut self) -> Result<FlatValue, Trap> {
        let value = self
            .values
            .get(self.pos)
            .copied()
            .ok_or(Trap::FlatStreamExhausted)?;
        self.pos += 1;
        Ok(value)
    }

    /// The number of values not yet consumed.
    pub fn remaining(&self) -> usize {
        self.values.len() - self.pos
    }
}

/// A view over a [`FlatReader`] that coerces each value from the type the
/// stream actually carries (`have`) to the type the consumer wants.
///
/// The consumer must pull exactly `want.len()` values; [`drain_padding`]
/// then discards the slots the stream carries beyond that so the underlying
/// reader stays in lock-step with the call surface.
///
/// [`drain_padding`]: CoercingReader::drain_padding
pub struct CoercingReader<'r, 'a> {
    inner: &'r mut FlatReader<'a>,
    have: &'r [FlatType],
    want: &'r [FlatType],
    pos: usize,
}

impl<'r, 'a> CoercingReader<'r, 'a> {
    /// Wraps `inner`, coercing element-wise from `have` to `want`.
    pub fn new(
        inner: &'r mut FlatReader<'a>,
        have: &'r [FlatType],
        want: &'r [FlatType],
    ) -> CoercingReader<'r, 'a> {
        CoercingReader {
            inner,
            have,
            want,
            pos: 0,
        }
    }

    /// Takes and coerces the next value.
    pub fn take(&mut self) -> Result<FlatValue, Trap> {
        if self.pos >= self.want.len() {
            return Err(Trap::FlatStreamExhausted);
        }
        let value = self.inner.take()?;
        let have = self.have.get(self.pos).copied().unwrap_or(value.ty());
        let want = self.want[self.pos];
        self.pos += 1;
        // The stream is typed as `have`; verify, then reshape to `want`.
        if value.ty() != have {
            return Err(Trap::FlatTypeMismatch {
                have: value.ty().name(),
                want: have.name(),
            });
        }
        value.reinterpret(want)
    }

    /// Discards the stream slots beyond the values the consumer pulled.
    pub fn drain_padding(self) -> Result<(), Trap> {
        for _ in self.pos..self.have.len() {
            self.inner.take()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_rules() {
        use FlatType::*;
        assert_eq!(I32.join(I32), I32);
        assert_eq!(F32.join(I32), I32);
        assert_eq!(I32.join(F32), I32);
        assert_eq!(F32.join(F32), F32);
        assert_eq!(F32.join(F64), I64);
        assert_eq!(I32.join(I64), I64);
        assert_eq!(F64.join(F64), F64);
        assert_eq!(I64.join(F64), I64);
    }

    #[test]
    fn reinterpret_float_bits() {
        let v = FlatValue::F32(3.5).reinterpret(FlatType::I32).unwrap();
        assert_eq!(v, FlatValue::I32(3.5f32.to_bits()));
        let back = v.reinterpret(FlatType::F32).unwrap();
        assert_eq!(back, FlatValue::F32(3.5));
    }

    #[test]
    fn reinterpret_narrowing() {
        let ok = FlatValue::I64(7).reinterpret(FlatType::I32).unwrap();
        assert_eq!(ok, FlatValue::I32(7));
        let err = FlatValue::I64(u64::from(u32::MAX) + 1)
            .reinterpret(FlatType::I32)
            .unwrap_err();
        assert!(matches!(err, Trap::NarrowingOverflow { .. }));
    }

    #[test]
    fn reinterpret_f32_through_i64() {
        let wide = FlatValue::F32(1.5).reinterpret(FlatType::I64).unwrap();
        assert_eq!(wide, FlatValue::I64(u64::from(1.5f32.to_bits())));
        let back = wide.reinterpret(FlatType::F32).unwrap();
        assert_eq!(back, FlatValue::F32(1.5));
    }

    #[test]
    fn coercing_reader_stays_in_lock_step() {
        let values = [
            FlatValue::I32(3.5f32.to_bits()),
            FlatValue::I64(0),
            FlatValue::I32(9),
        ];
        let mut reader = FlatReader::new(&values);
        let have = [FlatType::I32, FlatType::I64];
        let want = [FlatType::F32];
        let mut coerced = CoercingReader::new(&mut reader, &have, &want);
        assert_eq!(coerced.take().unwrap(), FlatValue::F32(3.5));
        coerced.drain_padding().unwrap();
        // The trailing value belongs to the next parameter.
        assert_eq!(reader.take().unwrap(), FlatValue::I32(9));
    }
}
