//! Variant-shaped codecs: `variant`, `enum`, `option` and `result`.
//!
//! All four share one layout: a discriminant sized to the case count
//! followed by the payload area, which starts at the largest case
//! alignment and is big enough for the largest case. On the calling
//! surface the cases share flat slots, joined pairwise; a lowered case
//! that is narrower than the joined shape is padded with zeroes, and a
//! lift drains the slots its case does not use so the stream stays in
//! lock-step.

use super::{CallContext, CanonicalType, TypeHandle, TypeKind};
use crate::flat::{CoercingReader, FlatReader, FlatType, FlatValue, FlatValues};
use crate::memory::{Alignment, Memory, MemoryRange, ReadonlyRange};
use crate::trap::Trap;
use crate::val::Val;

fn discriminant_width(case_count: usize) -> u32 {
    if case_count <= 0x100 {
        1
    } else if case_count <= 0x1_0000 {
        2
    } else {
        4
    }
}

/// The layout and surface shape shared by every variant-like type.
struct VariantShape {
    payloads: Vec<Option<TypeHandle>>,
    disc_width: u32,
    payload_offset: u32,
    size: u32,
    alignment: Alignment,
    flat: Vec<FlatType>,
    ty_name: &'static str,
}

impl VariantShape {
    fn new(payloads: Vec<Option<TypeHandle>>, ty_name: &'static str) -> VariantShape {
        let disc_width = discriminant_width(payloads.len());
        // 1, 2 and 4 are all representable alignments.
        let disc_align = Alignment::from_bytes(disc_width).unwrap_or(Alignment::One);
        let mut max_align = Alignment::One;
        let mut max_size = 0u32;
        let mut joined: Vec<FlatType> = Vec::new();
        for payload in payloads.iter().flatten() {
            max_align = max_align.max(payload.alignment());
            max_size = max_size.max(payload.size());
            for (index, ft) in payload.flat_types().iter().enumerate() {
                match joined.get_mut(index) {
                    Some(slot) => *slot = slot.join(*ft),
                    None => joined.push(*ft),
                }
            }
        }
        let payload_offset = max_align.align_up(disc_width);
        let alignment = disc_align.max(max_align);
        let size = alignment.align_up(payload_offset + max_size);
        let mut flat = vec![FlatType::I32];
        flat.extend(joined);
        VariantShape {
            payloads,
            disc_width,
            payload_offset,
            size,
            alignment,
            flat,
            ty_name,
        }
    }

    fn case(&self, disc: u32) -> Result<usize, Trap> {
        if (disc as usize) < self.payloads.len() {
            Ok(disc as usize)
        } else {
            Err(Trap::InvalidDiscriminant {
                value: disc,
                ty: self.ty_name,
            })
        }
    }

    fn read_discriminant(&self, range: &ReadonlyRange, offset: u32) -> Result<u32, Trap> {
        match self.disc_width {
            1 => Ok(u32::from(range.get_u8(offset)?)),
            2 => Ok(u32::from(range.get_u16(offset)?)),
            _ => range.get_u32(offset),
        }
    }

    fn write_discriminant(&self, range: &MemoryRange, offset: u32, disc: u32) -> Result<(), Trap> {
        match self.disc_width {
            1 => range.set_u8(offset, disc as u8),
            2 => range.set_u16(offset, disc as u16),
            _ => range.set_u32(offset, disc),
        }
    }

    fn payload_ty(&self, index: usize) -> Option<&TypeHandle> {
        self.payloads[index].as_ref()
    }

    fn load(
        &self,
        range: &ReadonlyRange,
        offset: u32,
        cx: &CallContext,
    ) -> Result<(usize, Option<Val>), Trap> {
        let index = self.case(self.read_discriminant(range, offset)?)?;
        let payload = match self.payload_ty(index) {
            Some(ty) => Some(ty.load(range, offset + self.payload_offset, cx)?),
            None => None,
        };
        Ok((index, payload))
    }

    fn store(
        &self,
        range: &MemoryRange,
        offset: u32,
        index: usize,
        payload: Option<&Val>,
        cx: &CallContext,
    ) -> Result<(), Trap> {
        self.write_discriminant(range, offset, index as u32)?;
        match (self.payload_ty(index), payload) {
            (Some(ty), Some(value)) => ty.store(range, offset + self.payload_offset, value, cx),
            (None, None) => Ok(()),
            (Some(_), None) => Err(Trap::ValueMismatch {
                want: self.ty_name,
                got: "case without its payload",
            }),
            (None, Some(value)) => Err(Trap::ValueMismatch {
                want: self.ty_name,
                got: value.desc(),
            }),
        }
    }

    /// Pulls the case's coerced flat values out of the stream and drains
    /// the slots the case does not occupy.
    fn case_values(
        &self,
        src: &mut FlatReader<'_>,
        index: usize,
    ) -> Result<FlatValues, Trap> {
        let case_flats = self
            .payload_ty(index)
            .map(|ty| ty.flat_types())
            .unwrap_or(&[]);
        let mut values = FlatValues::new();
        let mut coerced = CoercingReader::new(src, &self.flat[1..], case_flats);
        for _ in 0..case_flats.len() {
            values.push(coerced.take()?);
        }
        coerced.drain_padding()?;
        Ok(values)
    }

    fn lift_flat(
        &self,
        memory: &Memory,
        src: &mut FlatReader<'_>,
        cx: &CallContext,
    ) -> Result<(usize, Option<Val>), Trap> {
        let index = self.case(src.take()?.as_i32()?)?;
        let values = self.case_values(src, index)?;
        let payload = match self.payload_ty(index) {
            Some(ty) => {
                let mut reader = FlatReader::new(&values);
                Some(ty.lift_flat(memory, &mut reader, cx)?)
            }
            None => None,
        };
        Ok((index, payload))
    }

    /// Appends `case` flats to `out`, coercing to the joined shape and
    /// zero-padding the unused slots.
    fn emit_joined(&self, out: &mut FlatValues, case: &[FlatValue]) -> Result<(), Trap> {
        for (index, want) in self.flat[1..].iter().enumerate() {
            match case.get(index) {
                Some(value) => out.push(value.reinterpret(*want)?),
                None => out.push(FlatValue::zero(*want)),
            }
        }
        Ok(())
    }

    fn lower_flat(
        &self,
        out: &mut FlatValues,
        memory: &Memory,
        index: usize,
        payload: Option<&Val>,
        cx: &CallContext,
    ) -> Result<(), Trap> {
        out.push(FlatValue::I32(index as u32));
        let mut case = FlatValues::new();
        match (self.payload_ty(index), payload) {
            (Some(ty), Some(value)) => ty.lower_flat(&mut case, memory, value, cx)?,
            (None, None) => {}
            (Some(_), None) => {
                return Err(Trap::ValueMismatch {
                    want: self.ty_name,
                    got: "case without its payload",
                })
            }
            (None, Some(value)) => {
                return Err(Trap::ValueMismatch {
                    want: self.ty_name,
                    got: value.desc(),
                })
            }
        }
        self.emit_joined(out, &case)
    }

    fn copy(
        &self,
        dst: &MemoryRange,
        dst_offset: u32,
        src: &ReadonlyRange,
        src_offset: u32,
        cx: &CallContext,
    ) -> Result<(), Trap> {
        let disc = self.read_discriminant(src, src_offset)?;
        let index = self.case(disc)?;
        self.write_discriminant(dst, dst_offset, disc)?;
        if let Some(ty) = self.payload_ty(index) {
            ty.copy(
                dst,
                dst_offset + self.payload_offset,
                src,
                src_offset + self.payload_offset,
                cx,
            )?;
        }
        Ok(())
    }

    fn copy_flat(
        &self,
        out: &mut FlatValues,
        dst: &Memory,
        src_vals: &mut FlatReader<'_>,
        src: &Memory,
        cx: &CallContext,
    ) -> Result<(), Trap> {
        let disc = src_vals.take()?.as_i32()?;
        let index = self.case(disc)?;
        out.push(FlatValue::I32(disc));
        let values = self.case_values(src_vals, index)?;
        let mut case = FlatValues::new();
        if let Some(ty) = self.payload_ty(index) {
            let mut reader = FlatReader::new(&values);
            ty.copy_flat(&mut case, dst, &mut reader, src, cx)?;
        }
        self.emit_joined(out, &case)
    }
}

macro_rules! delegate_shape {
    () => {
        fn size(&self) -> u32 {
            self.shape.size
        }

        fn alignment(&self) -> Alignment {
            self.shape.alignment
        }

        fn flat_types(&self) -> &[FlatType] {
            &self.shape.flat
        }

        fn copy(
            &self,
            dst: &MemoryRange,
            dst_offset: u32,
            src: &ReadonlyRange,
            src_offset: u32,
            cx: &CallContext,
        ) -> Result<(), Trap> {
            self.shape.copy(dst, dst_offset, src, src_offset, cx)
        }

        fn copy_flat(
            &self,
            out: &mut FlatValues,
            dst: &Memory,
            src_vals: &mut FlatReader<'_>,
            src: &Memory,
            cx: &CallContext,
        ) -> Result<(), Trap> {
            self.shape.copy_flat(out, dst, src_vals, src, cx)
        }
    };
}

/// A variant with named, optionally payload-carrying cases.
pub struct VariantType {
    names: Vec<String>,
    shape: VariantShape,
}

impl VariantType {
    /// A variant over the given cases, in declaration order.
    pub fn new<N: Into<String>>(
        cases: impl IntoIterator<Item = (N, Option<TypeHandle>)>,
    ) -> VariantType {
        let (names, payloads): (Vec<String>, Vec<Option<TypeHandle>>) = cases
            .into_iter()
            .map(|(name, payload)| (name.into(), payload))
            .unzip();
        VariantType {
            names,
            shape: VariantShape::new(payloads, "variant"),
        }
    }

    fn index_of(&self, name: &str) -> Result<usize, Trap> {
        self.names
            .iter()
            .position(|n| n == name)
            .ok_or_else(|| Trap::UnknownMember {
                ty: "variant",
                name: name.to_string(),
            })
    }
}

impl std::fmt::Debug for VariantType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VariantType")
            .field("cases", &self.names)
            .finish()
    }
}

impl CanonicalType for VariantType {
    fn kind(&self) -> TypeKind {
        TypeKind::Variant
    }

    delegate_shape!();

    fn load(&self, range: &ReadonlyRange, offset: u32, cx: &CallContext) -> Result<Val, Trap> {
        let (index, payload) = self.shape.load(range, offset, cx)?;
        Ok(Val::Variant(
            self.names[index].clone(),
            payload.map(Box::new),
        ))
    }

    fn lift_flat(
        &self,
        memory: &Memory,
        src: &mut FlatReader<'_>,
        cx: &CallContext,
    ) -> Result<Val, Trap> {
        let (index, payload) = self.shape.lift_flat(memory, src, cx)?;
        Ok(Val::Variant(
            self.names[index].clone(),
            payload.map(Box::new),
        ))
    }

    fn store(
        &self,
        range: &MemoryRange,
        offset: u32,
        value: &Val,
        cx: &CallContext,
    ) -> Result<(), Trap> {
        match value {
            Val::Variant(name, payload) => {
                let index = self.index_of(name)?;
                self.shape
                    .store(range, offset, index, payload.as_deref(), cx)
            }
            other => Err(other.mismatch("variant")),
        }
    }

    fn lower_flat(
        &self,
        out: &mut FlatValues,
        memory: &Memory,
        value: &Val,
        cx: &CallContext,
    ) -> Result<(), Trap> {
        match value {
            Val::Variant(name, payload) => {
                let index = self.index_of(name)?;
                self.shape
                    .lower_flat(out, memory, index, payload.as_deref(), cx)
            }
            other => Err(other.mismatch("variant")),
        }
    }
}

/// An enumeration: a variant whose cases carry no payload, stored as just
/// the discriminant.
pub struct EnumType {
    names: Vec<String>,
    shape: VariantShape,
}

impl EnumType {
    /// An enumeration over the given case names.
    pub fn new<N: Into<String>>(cases: impl IntoIterator<Item = N>) -> EnumType {
        let names: Vec<String> = cases.into_iter().map(Into::into).collect();
        let payloads = vec![None; names.len()];
        EnumType {
            names,
            shape: VariantShape::new(payloads, "enum"),
        }
    }

    fn index_of(&self, name: &str) -> Result<usize, Trap> {
        self.names
            .iter()
            .position(|n| n == name)
            .ok_or_else(|| Trap::UnknownMember {
                ty: "enum",
                name: name.to_string(),
            })
    }
}

impl std::fmt::Debug for EnumType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnumType")
            .field("cases", &self.names)
            .finish()
    }
}

impl CanonicalType for EnumType {
    fn kind(&self) -> TypeKind {
        TypeKind::Enum
    }

    delegate_shape!();

    fn load(&self, range: &ReadonlyRange, offset: u32, cx: &CallContext) -> Result<Val, Trap> {
        let (index, _) = self.shape.load(range, offset, cx)?;
        Ok(Val::Enum(self.names[index].clone()))
    }

    fn lift_flat(
        &self,
        memory: &Memory,
        src: &mut FlatReader<'_>,
        cx: &CallContext,
    ) -> Result<Val, Trap> {
        let (index, _) = self.shape.lift_flat(memory, src, cx)?;
        Ok(Val::Enum(self.names[index].clone()))
    }

    fn store(
        &self,
        range: &MemoryRange,
        offset: u32,
        value: &Val,
        cx: &CallContext,
    ) -> Result<(), Trap> {
        match value {
            Val::Enum(name) => {
                let index = self.index_of(name)?;
                self.shape.store(range, offset, index, None, cx)
            }
            other => Err(other.mismatch("enum")),
        }
    }

    fn lower_flat(
        &self,
        out: &mut FlatValues,
        memory: &Memory,
        value: &Val,
        cx: &CallContext,
    ) -> Result<(), Trap> {
        match value {
            Val::Enum(name) => {
                let index = self.index_of(name)?;
                self.shape.lower_flat(out, memory, index, None, cx)
            }
            other => Err(other.mismatch("enum")),
        }
    }
}

/// `option<T>`: a two-case variant of `none` and `some(T)`.
pub struct OptionType {
    shape: VariantShape,
}

impl OptionType {
    /// An option over the given payload type.
    pub fn new(payload: TypeHandle) -> OptionType {
        OptionType {
            shape: VariantShape::new(vec![None, Some(payload)], "option"),
        }
    }

    /// Splits a host value into discriminant and payload. A bare non-option
    /// value is accepted as `some` unless the options require the wrapped
    /// form.
    fn split<'v>(&self, value: &'v Val, cx: &CallContext) -> Result<(usize, Option<&'v Val>), Trap> {
        match value {
            Val::Option(None) => Ok((0, None)),
            Val::Option(Some(payload)) => Ok((1, Some(payload))),
            other if !cx.options().keeps_option() => Ok((1, Some(other))),
            other => Err(other.mismatch("option")),
        }
    }
}

impl std::fmt::Debug for OptionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OptionType").finish()
    }
}

impl CanonicalType for OptionType {
    fn kind(&self) -> TypeKind {
        TypeKind::Option
    }

    delegate_shape!();

    fn load(&self, range: &ReadonlyRange, offset: u32, cx: &CallContext) -> Result<Val, Trap> {
        let (index, payload) = self.shape.load(range, offset, cx)?;
        match index {
            0 => Ok(Val::Option(None)),
            _ => Ok(Val::Option(payload.map(Box::new))),
        }
    }

    fn lift_flat(
        &self,
        memory: &Memory,
        src: &mut FlatReader<'_>,
        cx: &CallContext,
    ) -> Result<Val, Trap> {
        let (index, payload) = self.shape.lift_flat(memory, src, cx)?;
        match index {
            0 => Ok(Val::Option(None)),
            _ => Ok(Val::Option(payload.map(Box::new))),
        }
    }

    fn store(
        &self,
        range: &MemoryRange,
        offset: u32,
        value: &Val,
        cx: &CallContext,
    ) -> Result<(), Trap> {
        let (index, payload) = self.split(value, cx)?;
        self.shape.store(range, offset, index, payload, cx)
    }

    fn lower_flat(
        &self,
        out: &mut FlatValues,
        memory: &Memory,
        value: &Val,
        cx: &CallContext,
    ) -> Result<(), Trap> {
        let (index, payload) = self.split(value, cx)?;
        self.shape.lower_flat(out, memory, index, payload, cx)
    }
}

/// `result<O, E>`: a two-case variant of `ok(O)` and `error(E)`, either
/// payload optional.
pub struct ResultType {
    shape: VariantShape,
}

impl ResultType {
    /// A result over the given payload types.
    pub fn new(ok: Option<TypeHandle>, err: Option<TypeHandle>) -> ResultType {
        ResultType {
            shape: VariantShape::new(vec![ok, err], "result"),
        }
    }

    fn split<'v>(&self, value: &'v Val) -> Result<(usize, Option<&'v Val>), Trap> {
        match value {
            Val::Result(Ok(payload)) => Ok((0, payload.as_deref())),
            Val::Result(Err(payload)) => Ok((1, payload.as_deref())),
            other => Err(other.mismatch("result")),
        }
    }

    fn join(&self, index: usize, payload: Option<Val>) -> Val {
        let payload = payload.map(Box::new);
        match index {
            0 => Val::Result(Ok(payload)),
            _ => Val::Result(Err(payload)),
        }
    }
}

impl std::fmt::Debug for ResultType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultType").finish()
    }
}

impl CanonicalType for ResultType {
    fn kind(&self) -> TypeKind {
        TypeKind::Result
    }

    delegate_shape!();

    fn load(&self, range: &ReadonlyRange, offset: u32, cx: &CallContext) -> Result<Val, Trap> {
        let (index, payload) = self.shape.load(range, offset, cx)?;
        Ok(self.join(index, payload))
    }

    fn lift_flat(
        &self,
        memory: &Memory,
        src: &mut FlatReader<'_>,
        cx: &CallContext,
    ) -> Result<Val, Trap> {
        let (index, payload) = self.shape.lift_flat(memory, src, cx)?;
        Ok(self.join(index, payload))
    }

    fn store(
        &self,
        range: &MemoryRange,
        offset: u32,
        value: &Val,
        cx: &CallContext,
    ) -> Result<(), Trap> {
        let (index, payload) = self.split(value)?;
        self.shape.store(range, offset, index, payload, cx)
    }

    fn lower_flat(
        &self,
        out: &mut FlatValues,
        memory: &Memory,
        value: &Val,
        cx: &CallContext,
    ) -> Result<(), Trap> {
        let (index, payload) = self.split(value)?;
        self.shape.lower_flat(out, memory, index, payload, cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ty;
    use crate::options::CanonicalOptions;
    use crate::resources::ResourceRegistry;

    #[test]
    fn variant_joins_f32_and_i32_slots() {
        let variant = ty::variant([
            ("a", Some(ty::f32())),
            ("b", Some(ty::s32())),
        ]);
        assert_eq!(variant.flat_types(), &[FlatType::I32, FlatType::I32]);

        let cx = CallContext::default();
        let memory = Memory::host();
        let mut out = FlatValues::new();
        let value = Val::Variant("a".to_string(), Some(Box::new(Val::Float32(3.5))));
        variant.lower_flat(&mut out, &memory, &value, &cx).unwrap();
        assert_eq!(
            out.as_slice(),
            &[FlatValue::I32(0), FlatValue::I32(3.5f32.to_bits())]
        );

        let mut reader = FlatReader::new(&out);
        let back = variant.lift_flat(&memory, &mut reader, &cx).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn variant_layout() {
        // Discriminant byte, padding to the payload alignment, payload.
        let variant = ty::variant([
            ("none", None),
            ("big", Some(ty::u64())),
            ("small", Some(ty::u8())),
        ]);
        assert_eq!(variant.alignment(), Alignment::Eight);
        assert_eq!(variant.size(), 16);
        assert_eq!(variant.size() % variant.alignment().bytes(), 0);
    }

    #[test]
    fn variant_memory_round_trip() {
        let cx = CallContext::default();
        let memory = Memory::host();
        let variant = ty::variant([
            ("num", Some(ty::u32())),
            ("text", Some(ty::string())),
            ("nothing", None),
        ]);
        let range = memory.alloc(variant.alignment(), variant.size()).unwrap();
        for value in [
            Val::Variant("num".into(), Some(Box::new(Val::U32(9)))),
            Val::Variant("text".into(), Some(Box::new(Val::from("hallo")))),
            Val::Variant("nothing".into(), None),
        ] {
            variant.store(&range, 0, &value, &cx).unwrap();
            assert_eq!(variant.load(&range.as_readonly(), 0, &cx).unwrap(), value);
        }
    }

    #[test]
    fn out_of_range_discriminant_traps() {
        let cx = CallContext::default();
        let memory = Memory::host();
        let variant = ty::variant([("only", None)]);
        let flat = [FlatValue::I32(3)];
        let mut reader = FlatReader::new(&flat);
        let err = variant.lift_flat(&memory, &mut reader, &cx).unwrap_err();
        assert!(matches!(
            err,
            Trap::InvalidDiscriminant { value: 3, ty: "variant" }
        ));
    }

    #[test]
    fn enum_is_bare_discriminant() {
        let cx = CallContext::default();
        let memory = Memory::host();
        let colours = ty::enum_(["red", "green", "blue"]);
        assert_eq!(colours.size(), 1);
        assert_eq!(colours.flat_types(), &[FlatType::I32]);
        let range = memory.alloc(colours.alignment(), colours.size()).unwrap();
        colours
            .store(&range, 0, &Val::Enum("blue".into()), &cx)
            .unwrap();
        assert_eq!(range.get_u8(0).unwrap(), 2);
        assert_eq!(
            colours.load(&range.as_readonly(), 0, &cx).unwrap(),
            Val::Enum("blue".into())
        );
    }

    #[test]
    fn option_accepts_bare_payload_by_default() {
        let cx = CallContext::default();
        let memory = Memory::host();
        let option = ty::option(ty::u32());
        let range = memory.alloc(option.alignment(), option.size()).unwrap();
        option.store(&range, 0, &Val::U32(17), &cx).unwrap();
        assert_eq!(
            option.load(&range.as_readonly(), 0, &cx).unwrap(),
            Val::Option(Some(Box::new(Val::U32(17))))
        );

        let strict = CallContext::new(
            CanonicalOptions::new().keep_option(true),
            ResourceRegistry::new(),
        );
        let err = option.store(&range, 0, &Val::U32(17), &strict).unwrap_err();
        assert!(matches!(err, Trap::ValueMismatch { want: "option", .. }));
    }

    #[test]
    fn result_round_trip() {
        let cx = CallContext::default();
        let memory = Memory::host();
        let result = ty::result(Some(ty::u32()), Some(ty::string()));
        let range = memory.alloc(result.alignment(), result.size()).unwrap();
        for value in [
            Val::Result(Ok(Some(Box::new(Val::U32(1))))),
            Val::Result(Err(Some(Box::new(Val::from("kaputt"))))),
        ] {
            result.store(&range, 0, &value, &cx).unwrap();
            assert_eq!(result.load(&range.as_readonly(), 0, &cx).unwrap(), value);
        }
    }

    #[test]
    fn result_without_payloads() {
        let cx = CallContext::default();
        let memory = Memory::host();
        let result = ty::result(None, None);
        assert_eq!(result.flat_types(), &[FlatType::I32]);
        let mut out = FlatValues::new();
        result
            .lower_flat(&mut out, &memory, &Val::Result(Err(None)), &cx)
            .unwrap();
        assert_eq!(out.as_slice(), &[FlatValue::I32(1)]);
    }
}
