//! Record and tuple codecs.
//!
//! Fields are laid out in declaration order; each field starts at its own
//! alignment, and the whole layout is padded out to the largest field
//! alignment.

use super::{CallContext, CanonicalType, TypeHandle, TypeKind};
use crate::flat::{FlatReader, FlatType, FlatValues};
use crate::memory::{Alignment, Memory, MemoryRange, ReadonlyRange};
use crate::trap::Trap;
use crate::val::Val;

struct FieldLayout {
    ty: TypeHandle,
    offset: u32,
}

struct StructLayout {
    fields: Vec<FieldLayout>,
    size: u32,
    alignment: Alignment,
    flat: Vec<FlatType>,
}

fn layout(types: impl IntoIterator<Item = TypeHandle>) -> StructLayout {
    let mut fields = Vec::new();
    let mut alignment = Alignment::One;
    let mut end = 0u32;
    let mut flat = Vec::new();
    for ty in types {
        let offset = ty.alignment().align_up(end);
        end = offset + ty.size();
        alignment = alignment.max(ty.alignment());
        flat.extend_from_slice(ty.flat_types());
        fields.push(FieldLayout { ty, offset });
    }
    StructLayout {
        fields,
        size: alignment.align_up(end),
        alignment,
        flat,
    }
}

/// A record with named fields.
pub struct RecordType {
    names: Vec<String>,
    layout: StructLayout,
}

impl RecordType {
    /// A record over the given fields, in declaration order.
    pub fn new<N: Into<String>>(fields: impl IntoIterator<Item = (N, TypeHandle)>) -> RecordType {
        let (names, types): (Vec<String>, Vec<TypeHandle>) = fields
            .into_iter()
            .map(|(name, ty)| (name.into(), ty))
            .unzip();
        RecordType {
            names,
            layout: layout(types),
        }
    }

    /// The offset of the named field, if declared.
    pub fn field_offset(&self, name: &str) -> Option<u32> {
        let index = self.names.iter().position(|n| n == name)?;
        Some(self.layout.fields[index].offset)
    }

    fn field_value<'v>(&self, value: &'v Val, index: usize) -> Result<&'v Val, Trap> {
        let fields = value.as_record()?;
        let name = &self.names[index];
        fields
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
            .ok_or_else(|| Trap::UnknownMember {
                ty: "record",
                name: name.clone(),
            })
    }
}

impl std::fmt::Debug for RecordType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordType")
            .field("fields", &self.names)
            .finish()
    }
}

impl CanonicalType for RecordType {
    fn kind(&self) -> TypeKind {
        TypeKind::Record
    }

    fn size(&self) -> u32 {
        self.layout.size
    }

    fn alignment(&self) -> Alignment {
        self.layout.alignment
    }

    fn flat_types(&self) -> &[FlatType] {
        &self.layout.flat
    }

    fn load(&self, range: &ReadonlyRange, offset: u32, cx: &CallContext) -> Result<Val, Trap> {
        let mut fields = Vec::with_capacity(self.names.len());
        for (name, field) in self.names.iter().zip(&self.layout.fields) {
            let value = field.ty.load(range, offset + field.offset, cx)?;
            fields.push((name.clone(), value));
        }
        Ok(Val::Record(fields))
    }

    fn lift_flat(
        &self,
        memory: &Memory,
        src: &mut FlatReader<'_>,
        cx: &CallContext,
    ) -> Result<Val, Trap> {
        let mut fields = Vec::with_capacity(self.names.len());
        for (name, field) in self.names.iter().zip(&self.layout.fields) {
            fields.push((name.clone(), field.ty.lift_flat(memory, src, cx)?));
        }
        Ok(Val::Record(fields))
    }

    fn store(
        &self,
        range: &MemoryRange,
        offset: u32,
        value: &Val,
        cx: &CallContext,
    ) -> Result<(), Trap> {
        for (index, field) in self.layout.fields.iter().enumerate() {
            let v = self.field_value(value, index)?;
            field.ty.store(range, offset + field.offset, v, cx)?;
        }
        Ok(())
    }

    fn lower_flat(
        &self,
        out: &mut FlatValues,
        memory: &Memory,
        value: &Val,
        cx: &CallContext,
    ) -> Result<(), Trap> {
        for (index, field) in self.layout.fields.iter().enumerate() {
            let v = self.field_value(value, index)?;
            field.ty.lower_flat(out, memory, v, cx)?;
        }
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
        for field in &self.layout.fields {
            field.ty.copy(
                dst,
                dst_offset + field.offset,
                src,
                src_offset + field.offset,
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
        for field in &self.layout.fields {
            field.ty.copy_flat(out, dst, src_vals, src, cx)?;
        }
        Ok(())
    }
}

/// A tuple; a record with positional fields.
pub struct TupleType {
    layout: StructLayout,
}

impl TupleType {
    /// A tuple over the given element types.
    pub fn new(elements: impl IntoIterator<Item = TypeHandle>) -> TupleType {
        TupleType {
            layout: layout(elements),
        }
    }

    /// The number of elements.
    pub fn arity(&self) -> usize {
        self.layout.fields.len()
    }

    /// The offset of the element at `index`.
    pub fn element_offset(&self, index: usize) -> Option<u32> {
        self.layout.fields.get(index).map(|f| f.offset)
    }

    fn elements<'v>(&self, value: &'v Val) -> Result<&'v [Val], Trap> {
        let items = value.as_tuple()?;
        if items.len() != self.layout.fields.len() {
            return Err(Trap::ValueMismatch {
                want: "tuple of matching arity",
                got: value.desc(),
            });
        }
        Ok(items)
    }
}

impl std::fmt::Debug for TupleType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TupleType")
            .field("arity", &self.arity())
            .finish()
    }
}

impl CanonicalType for TupleType {
    fn kind(&self) -> TypeKind {
        TypeKind::Tuple
    }

    fn size(&self) -> u32 {
        self.layout.size
    }

    fn alignment(&self) -> Alignment {
        self.layout.alignment
    }

    fn flat_types(&self) -> &[FlatType] {
        &self.layout.flat
    }

    fn load(&self, range: &ReadonlyRange, offset: u32, cx: &CallContext) -> Result<Val, Trap> {
        let mut items = Vec::with_capacity(self.layout.fields.len());
        for field in &self.layout.fields {
            items.push(field.ty.load(range, offset + field.offset, cx)?);
        }
        Ok(Val::Tuple(items))
    }

    fn lift_flat(
        &self,
        memory: &Memory,
        src: &mut FlatReader<'_>,
        cx: &CallContext,
    ) -> Result<Val, Trap> {
        let mut items = Vec::with_capacity(self.layout.fields.len());
        for field in &self.layout.fields {
            items.push(field.ty.lift_flat(memory, src, cx)?);
        }
        Ok(Val::Tuple(items))
    }

    fn store(
        &self,
        range: &MemoryRange,
        offset: u32,
        value: &Val,
        cx: &CallContext,
    ) -> Result<(), Trap> {
        let items = self.elements(value)?;
        for (field, item) in self.layout.fields.iter().zip(items) {
            field.ty.store(range, offset + field.offset, item, cx)?;
        }
        Ok(())
    }

    fn lower_flat(
        &self,
        out: &mut FlatValues,
        memory: &Memory,
        value: &Val,
        cx: &CallContext,
    ) -> Result<(), Trap> {
        let items = self.elements(value)?;
        for (field, item) in self.layout.fields.iter().zip(items) {
            field.ty.lower_flat(out, memory, item, cx)?;
        }
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
        for field in &self.layout.fields {
            field.ty.copy(
                dst,
                dst_offset + field.offset,
                src,
                src_offset + field.offset,
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
        for field in &self.layout.fields {
            field.ty.copy_flat(out, dst, src_vals, src, cx)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ty;

    #[test]
    fn field_offsets_respect_alignment() {
        // u8 at 0, padding, u32 at 4, u16 at 8; size rounds up to 12.
        let record = RecordType::new([
            ("a", ty::u8()),
            ("b", ty::u32()),
            ("c", ty::u16()),
        ]);
        assert_eq!(record.field_offset("a"), Some(0));
        assert_eq!(record.field_offset("b"), Some(4));
        assert_eq!(record.field_offset("c"), Some(8));
        assert_eq!(record.size(), 12);
        assert_eq!(record.alignment(), Alignment::Four);
        assert_eq!(record.size() % record.alignment().bytes(), 0);
    }

    #[test]
    fn record_round_trip_out_of_order_fields() {
        let cx = CallContext::default();
        let memory = Memory::host();
        let record = ty::record([("x", ty::u32()), ("y", ty::string())]);
        let range = memory.alloc(record.alignment(), record.size()).unwrap();
        // Field order in the value does not need to match declaration order.
        let value = Val::Record(vec![
            ("y".to_string(), Val::from("hi")),
            ("x".to_string(), Val::U32(5)),
        ]);
        record.store(&range, 0, &value, &cx).unwrap();
        let back = record.load(&range.as_readonly(), 0, &cx).unwrap();
        assert_eq!(
            back,
            Val::Record(vec![
                ("x".to_string(), Val::U32(5)),
                ("y".to_string(), Val::from("hi")),
            ])
        );
    }

    #[test]
    fn missing_field_traps() {
        let cx = CallContext::default();
        let memory = Memory::host();
        let record = ty::record([("x", ty::u32())]);
        let range = memory.alloc(record.alignment(), record.size()).unwrap();
        let err = record
            .store(&range, 0, &Val::Record(vec![]), &cx)
            .unwrap_err();
        assert!(matches!(err, Trap::UnknownMember { ty: "record", .. }));
    }

    #[test]
    fn tuple_arity_is_checked() {
        let cx = CallContext::default();
        let memory = Memory::host();
        let tuple = ty::tuple([ty::u32(), ty::u32()]);
        let range = memory.alloc(tuple.alignment(), tuple.size()).unwrap();
        let err = tuple
            .store(&range, 0, &Val::Tuple(vec![Val::U32(1)]), &cx)
            .unwrap_err();
        assert!(matches!(err, Trap::ValueMismatch { .. }));
    }
}
