//! The list codec.
//!
//! A list is stored as a `(data_ptr, length)` pair of `u32`s with the
//! elements laid out contiguously at the element type's size and
//! alignment. Copies of lists with fixed-width numeric elements skip the
//! per-element walk and move the bytes in bulk.

use super::{CallContext, CanonicalType, TypeHandle, TypeKind};
use crate::flat::{FlatReader, FlatType, FlatValue, FlatValues};
use crate::memory::{Alignment, Memory, MemoryRange, ReadonlyRange};
use crate::trap::Trap;
use crate::val::Val;

#[derive(Debug)]
pub struct ListType {
    element: TypeHandle,
}

impl ListType {
    /// A list over the given element type.
    pub fn new(element: TypeHandle) -> ListType {
        ListType { element }
    }

    /// The element type.
    pub fn element(&self) -> &TypeHandle {
        &self.element
    }

    fn byte_len(&self, length: u32) -> Result<u32, Trap> {
        length
            .checked_mul(self.element.size())
            .ok_or(Trap::AllocationFailed {
                align: self.element.alignment().bytes(),
                size: u32::MAX,
            })
    }

    /// Whether elements are fixed-width numerics whose layout equals their
    /// in-memory representation, making a bulk byte copy equivalent to a
    /// per-element one.
    fn bulk_copyable(&self) -> bool {
        matches!(
            self.element.kind(),
            TypeKind::U8
                | TypeKind::S8
                | TypeKind::U16
                | TypeKind::S16
                | TypeKind::U32
                | TypeKind::S32
                | TypeKind::U64
                | TypeKind::S64
                | TypeKind::F32
                | TypeKind::F64
        )
    }

    fn store_elements(
        &self,
        memory: &Memory,
        items: &[Val],
        cx: &CallContext,
    ) -> Result<(u32, u32), Trap> {
        let length = items.len() as u32;
        let data = memory.alloc(self.element.alignment(), self.byte_len(length)?)?;
        for (index, item) in items.iter().enumerate() {
            self.element
                .store(&data, index as u32 * self.element.size(), item, cx)?;
        }
        Ok((data.ptr(), length))
    }

    fn load_elements(
        &self,
        memory: &Memory,
        ptr: u32,
        length: u32,
        cx: &CallContext,
    ) -> Result<Val, Trap> {
        let data = memory.readonly(ptr, self.byte_len(length)?);
        let mut items = Vec::with_capacity(length as usize);
        for index in 0..length {
            items.push(self.element.load(&data, index * self.element.size(), cx)?);
        }
        Ok(Val::List(items))
    }

    fn transplant(
        &self,
        dst: &Memory,
        src: &Memory,
        ptr: u32,
        length: u32,
        cx: &CallContext,
    ) -> Result<u32, Trap> {
        let byte_len = self.byte_len(length)?;
        let src_data = src.readonly(ptr, byte_len);
        let dst_data = dst.alloc(self.element.alignment(), byte_len)?;
        if self.bulk_copyable() {
            dst_data.copy_from(&src_data)?;
        } else {
            for index in 0..length {
                let offset = index * self.element.size();
                self.element.copy(&dst_data, offset, &src_data, offset, cx)?;
            }
        }
        Ok(dst_data.ptr())
    }
}

impl CanonicalType for ListType {
    fn kind(&self) -> TypeKind {
        TypeKind::List
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
        let length = range.get_u32(offset + 4)?;
        self.load_elements(range.memory(), ptr, length, cx)
    }

    fn lift_flat(
        &self,
        memory: &Memory,
        src: &mut FlatReader<'_>,
        cx: &CallContext,
    ) -> Result<Val, Trap> {
        let ptr = src.take()?.as_i32()?;
        let length = src.take()?.as_i32()?;
        self.load_elements(memory, ptr, length, cx)
    }

    fn store(
        &self,
        range: &MemoryRange,
        offset: u32,
        value: &Val,
        cx: &CallContext,
    ) -> Result<(), Trap> {
        let (ptr, length) = self.store_elements(range.memory(), value.as_list()?, cx)?;
        range.set_u32(offset, ptr)?;
        range.set_u32(offset + 4, length)
    }

    fn lower_flat(
        &self,
        out: &mut FlatValues,
        memory: &Memory,
        value: &Val,
        cx: &CallContext,
    ) -> Result<(), Trap> {
        let (ptr, length) = self.store_elements(memory, value.as_list()?, cx)?;
        out.push(FlatValue::I32(ptr));
        out.push(FlatValue::I32(length));
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
        let length = src.get_u32(src_offset + 4)?;
        let new_ptr = self.transplant(dst.memory(), src.memory(), ptr, length, cx)?;
        dst.set_u32(dst_offset, new_ptr)?;
        dst.set_u32(dst_offset + 4, length)
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
        let length = src_vals.take()?.as_i32()?;
        let new_ptr = self.transplant(dst, src, ptr, length, cx)?;
        out.push(FlatValue::I32(new_ptr));
        out.push(FlatValue::I32(length));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ty;

    #[test]
    fn list_of_u16_round_trip() {
        let cx = CallContext::default();
        let memory = Memory::host();
        let list = ty::list(ty::u16());
        let range = memory.alloc(Alignment::Four, 8).unwrap();
        let value = Val::List(vec![Val::U16(1), Val::U16(513), Val::U16(65535)]);
        list.store(&range, 0, &value, &cx).unwrap();
        assert_eq!(list.load(&range.as_readonly(), 0, &cx).unwrap(), value);
    }

    #[test]
    fn list_of_strings_copies_deeply() {
        let cx = CallContext::default();
        let src = Memory::host();
        let dst = Memory::host();
        let list = ty::list(ty::string());
        let src_range = src.alloc(Alignment::Four, 8).unwrap();
        let value = Val::List(vec![Val::from("eins"), Val::from("zwei")]);
        list.store(&src_range, 0, &value, &cx).unwrap();
        let dst_range = dst.alloc(Alignment::Four, 8).unwrap();
        list.copy(&dst_range, 0, &src_range.as_readonly(), 0, &cx)
            .unwrap();
        assert_eq!(list.load(&dst_range.as_readonly(), 0, &cx).unwrap(), value);
    }

    #[test]
    fn element_shape_is_validated() {
        let cx = CallContext::default();
        let memory = Memory::host();
        let list = ty::list(ty::u8());
        let range = memory.alloc(Alignment::Four, 8).unwrap();
        let err = list
            .store(&range, 0, &Val::List(vec![Val::U16(1)]), &cx)
            .unwrap_err();
        assert!(matches!(err, Trap::ValueMismatch { .. }));
    }
}
