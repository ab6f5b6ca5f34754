//! The string codec.
//!
//! Strings are stored as a `(data_ptr, code_units)` pair of `u32`s. The
//! data buffer lives out of line and is freshly allocated in the
//! destination memory whenever a string is stored, lowered or copied. The
//! unit count is the number of code units, not bytes: equal to the byte
//! length under UTF-8, half of it under UTF-16.

use super::{CallContext, CanonicalType, TypeKind};
use crate::flat::{FlatReader, FlatType, FlatValue, FlatValues};
use crate::memory::{Alignment, Memory, MemoryRange, ReadonlyRange};
use crate::options::StringEncoding;
use crate::trap::Trap;
use crate::val::Val;

#[derive(Debug)]
pub struct StringType;

fn unit_width(cx: &CallContext) -> Result<(u32, Alignment), Trap> {
    match cx.options().string_encoding() {
        StringEncoding::Utf8 => Ok((1, Alignment::One)),
        StringEncoding::Utf16 => Ok((2, Alignment::Two)),
        StringEncoding::Latin1Utf16 => Err(Trap::UnsupportedEncoding("latin1+utf-16")),
    }
}

fn encode(memory: &Memory, s: &str, cx: &CallContext) -> Result<(u32, u32), Trap> {
    match cx.options().string_encoding() {
        StringEncoding::Utf8 => {
            let bytes = s.as_bytes();
            let range = memory.alloc(Alignment::One, bytes.len() as u32)?;
            range.set_bytes(0, bytes)?;
            Ok((range.ptr(), bytes.len() as u32))
        }
        StringEncoding::Utf16 => {
            let mut bytes = Vec::with_capacity(s.len() * 2);
            let mut units = 0u32;
            for unit in s.encode_utf16() {
                bytes.extend_from_slice(&unit.to_le_bytes());
                units += 1;
            }
            let range = memory.alloc(Alignment::Two, bytes.len() as u32)?;
            range.set_bytes(0, &bytes)?;
            Ok((range.ptr(), units))
        }
        StringEncoding::Latin1Utf16 => Err(Trap::UnsupportedEncoding("latin1+utf-16")),
    }
}

fn decode(memory: &Memory, ptr: u32, units: u32, cx: &CallContext) -> Result<Val, Trap> {
    match cx.options().string_encoding() {
        StringEncoding::Utf8 => {
            let bytes = memory.readonly(ptr, units).get_bytes(0, units)?;
            let s = String::from_utf8(bytes).map_err(|_| Trap::InvalidString {
                encoding: "utf-8",
            })?;
            Ok(Val::String(s.into()))
        }
        StringEncoding::Utf16 => {
            let byte_len = units.checked_mul(2).ok_or(Trap::OutOfBounds {
                offset: ptr,
                len: u32::MAX,
                size: memory.byte_size(),
            })?;
            let bytes = memory.readonly(ptr, byte_len).get_bytes(0, byte_len)?;
            let mut code_units = Vec::with_capacity(units as usize);
            for pair in bytes.chunks_exact(2) {
                code_units.push(u16::from_le_bytes([pair[0], pair[1]]));
            }
            let s = String::from_utf16(&code_units).map_err(|_| Trap::InvalidString {
                encoding: "utf-16",
            })?;
            Ok(Val::String(s.into()))
        }
        StringEncoding::Latin1Utf16 => Err(Trap::UnsupportedEncoding("latin1+utf-16")),
    }
}

impl CanonicalType for StringType {
    fn kind(&self) -> TypeKind {
        TypeKind::String
    }

    fn size(&self) -> u32 {
        8
    }

    fn alignment(&self) -> Alignment {
        Alignment::Four
    }

    fn flat_types(&self) -> &[FlatType] {
        &[FlatType::I32, FlatType::I32]
    }

    fn load(&self, range: &ReadonlyRange, offset: u32, cx: &CallContext) -> Result<Val, Trap> {
        let ptr = range.get_u32(offset)?;
        let units = range.get_u32(offset + 4)?;
        decode(range.memory(), ptr, units, cx)
    }

    fn lift_flat(
        &self,
        memory: &Memory,
        src: &mut FlatReader<'_>,
        cx: &CallContext,
    ) -> Result<Val, Trap> {
        let ptr = src.take()?.as_i32()?;
        let units = src.take()?.as_i32()?;
        decode(memory, ptr, units, cx)
    }

    fn store(
        &self,
        range: &MemoryRange,
        offset: u32,
        value: &Val,
        cx: &CallContext,
    ) -> Result<(), Trap> {
        let (ptr, units) = encode(range.memory(), value.as_str()?, cx)?;
        range.set_u32(offset, ptr)?;
        range.set_u32(offset + 4, units)
    }

    fn lower_flat(
        &self,
        out: &mut FlatValues,
        memory: &Memory,
        value: &Val,
        cx: &CallContext,
    ) -> Result<(), Trap> {
        let (ptr, units) = encode(memory, value.as_str()?, cx)?;
        out.push(FlatValue::I32(ptr));
        out.push(FlatValue::I32(units));
        Ok(())
    }

    fn copy(
        &self,
        dst: &MemoryRange,
        dst_offset: u32,
        src: &ReadonlyRange,
        src_offset: u32,
        cx: &CallContext,
    ) -> Result<(), Trap> {
        let ptr = src.get_u32(src_offset)?;
        let units = src.get_u32(src_offset + 4)?;
        let (new_ptr, units) = transplant(dst.memory(), src.memory(), ptr, units, cx)?;
        dst.set_u32(dst_offset, new_ptr)?;
        dst.set_u32(dst_offset + 4, units)
    }

    fn copy_flat(
        &self,
        out: &mut FlatValues,
        dst: &Memory,
        src_vals: &mut FlatReader<'_>,
        src: &Memory,
        cx: &CallContext,
    ) -> Result<(), Trap> {
        let ptr = src_vals.take()?.as_i32()?;
        let units = src_vals.take()?.as_i32()?;
        let (new_ptr, units) = transplant(dst, src, ptr, units, cx)?;
        out.push(FlatValue::I32(new_ptr));
        out.push(FlatValue::I32(units));
        Ok(())
    }
}

/// Moves the raw data buffer into `dst` without re-validating its contents.
fn transplant(
    dst: &Memory,
    src: &Memory,
    ptr: u32,
    units: u32,
    cx: &CallContext,
) -> Result<(u32, u32), Trap> {
    let (width, align) = unit_width(cx)?;
    let byte_len = units.checked_mul(width).ok_or(Trap::OutOfBounds {
        offset: ptr,
        len: u32::MAX,
        size: src.byte_size(),
    })?;
    let data = src.readonly(ptr, byte_len);
    let target = dst.alloc(align, byte_len)?;
    target.copy_from(&data)?;
    Ok((target.ptr(), units))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ty;
    use crate::options::CanonicalOptions;
    use crate::resources::ResourceRegistry;

    #[test]
    fn utf8_round_trip() {
        let cx = CallContext::default();
        let memory = Memory::host();
        let range = memory.alloc(Alignment::Four, 8).unwrap();
        let value = Val::from("Grüße");
        ty::string().store(&range, 0, &value, &cx).unwrap();
        // The unit count is the UTF-8 byte length, not the char count.
        assert_eq!(range.get_u32(4).unwrap(), "Grüße".len() as u32);
        let back = ty::string().load(&range.as_readonly(), 0, &cx).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn utf16_code_units() {
        let cx = CallContext::new(
            CanonicalOptions::new().encoding(StringEncoding::Utf16),
            ResourceRegistry::new(),
        );
        let memory = Memory::host();
        let range = memory.alloc(Alignment::Four, 8).unwrap();
        ty::string()
            .store(&range, 0, &Val::from("Grüße"), &cx)
            .unwrap();
        // Five UTF-16 code units, ten bytes.
        assert_eq!(range.get_u32(4).unwrap(), 5);
        let back = ty::string().load(&range.as_readonly(), 0, &cx).unwrap();
        assert_eq!(back, Val::from("Grüße"));
    }

    #[test]
    fn latin1_traps() {
        let cx = CallContext::new(
            CanonicalOptions::new().encoding(StringEncoding::Latin1Utf16),
            ResourceRegistry::new(),
        );
        let memory = Memory::host();
        let range = memory.alloc(Alignment::Four, 8).unwrap();
        let err = ty::string()
            .store(&range, 0, &Val::from("x"), &cx)
            .unwrap_err();
        assert!(matches!(err, Trap::UnsupportedEncoding(_)));
    }

    #[test]
    fn invalid_utf8_traps() {
        let cx = CallContext::default();
        let memory = Memory::host();
        let data = memory.alloc(Alignment::One, 2).unwrap();
        data.set_bytes(0, &[0xff, 0xfe]).unwrap();
        let range = memory.alloc(Alignment::Four, 8).unwrap();
        range.set_u32(0, data.ptr()).unwrap();
        range.set_u32(4, 2).unwrap();
        let err = ty::string()
            .load(&range.as_readonly(), 0, &cx)
            .unwrap_err();
        assert!(matches!(err, Trap::InvalidString { encoding: "utf-8" }));
    }
}
