//! The flags codec: a set of named booleans packed into bits.
//!
//! Bit `i` lives in word `i / 32` under mask `1 << (i % 32)`. Up to 32
//! fields the stored form is a single unsigned integer sized to the field
//! count; beyond that it is a sequence of `u32` words.

use super::{CallContext, CanonicalType, TypeKind};
use crate::flat::{FlatReader, FlatType, FlatValue, FlatValues};
use crate::memory::{Alignment, Memory, MemoryRange, ReadonlyRange};
use crate::trap::Trap;
use crate::val::Val;

pub struct FlagsType {
    names: Vec<String>,
    size: u32,
    alignment: Alignment,
    flat: Vec<FlatType>,
}

impl FlagsType {
    /// A flags type over the given field names, in declaration order.
    pub fn new<N: Into<String>>(names: impl IntoIterator<Item = N>) -> FlagsType {
        let names: Vec<String> = names.into_iter().map(Into::into).collect();
        let n = names.len();
        let words = ((n + 31) / 32) as u32;
        let (size, alignment) = match n {
            0 => (0, Alignment::One),
            1..=8 => (1, Alignment::One),
            9..=16 => (2, Alignment::Two),
            _ => (4 * words, Alignment::Four),
        };
        FlagsType {
            names,
            size,
            alignment,
            flat: vec![FlatType::I32; words as usize],
        }
    }

    fn word_count(&self) -> u32 {
        self.flat.len() as u32
    }

    fn words_of(&self, value: &Val) -> Result<Vec<u32>, Trap> {
        let set = match value {
            Val::Flags(set) => set,
            other => return Err(other.mismatch("flags")),
        };
        let mut words = vec![0u32; self.word_count() as usize];
        for name in set {
            let index = self
                .names
                .iter()
                .position(|n| n == name)
                .ok_or_else(|| Trap::UnknownMember {
                    ty: "flags",
                    name: name.clone(),
                })?;
            words[index / 32] |= 1 << (index % 32);
        }
        Ok(words)
    }

    fn value_of(&self, words: &[u32]) -> Val {
        let mut set = Vec::new();
        for (index, name) in self.names.iter().enumerate() {
            if words[index / 32] & (1 << (index % 32)) != 0 {
                set.push(name.clone());
            }
        }
        Val::Flags(set)
    }
}

impl std::fmt::Debug for FlagsType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlagsType")
            .field("fields", &self.names)
            .finish()
    }
}

impl CanonicalType for FlagsType {
    fn kind(&self) -> TypeKind {
        TypeKind::Flags
    }

    fn size(&self) -> u32 {
        self.size
    }

    fn alignment(&self) -> Alignment {
        self.alignment
    }

    fn flat_types(&self) -> &[FlatType] {
        &self.flat
    }

    fn load(&self, range: &ReadonlyRange, offset: u32, _cx: &CallContext) -> Result<Val, Trap> {
        let words = match self.size {
            0 => Vec::new(),
            1 => vec![u32::from(range.get_u8(offset)?)],
            2 => vec![u32::from(range.get_u16(offset)?)],
            _ => {
                let mut words = Vec::with_capacity(self.word_count() as usize);
                for word in 0..self.word_count() {
                    words.push(range.get_u32(offset + word * 4)?);
                }
                words
            }
        };
        Ok(self.value_of(&words))
    }

    fn lift_flat(
        &self,
        _memory: &Memory,
        src: &mut FlatReader<'_>,
        _cx: &CallContext,
    ) -> Result<Val, Trap> {
        let mut words = Vec::with_capacity(self.word_count() as usize);
        for _ in 0..self.word_count() {
            words.push(src.take()?.as_i32()?);
        }
        Ok(self.value_of(&words))
    }

    fn store(
        &self,
        range: &MemoryRange,
        offset: u32,
        value: &Val,
        _cx: &CallContext,
    ) -> Result<(), Trap> {
        let words = self.words_of(value)?;
        match self.size {
            0 => Ok(()),
            1 => range.set_u8(offset, words[0] as u8),
            2 => range.set_u16(offset, words[0] as u16),
            _ => {
                for (index, word) in words.iter().enumerate() {
                    range.set_u32(offset + index as u32 * 4, *word)?;
                }
                Ok(())
            }
        }
    }

    fn lower_flat(
        &self,
        out: &mut FlatValues,
        _memory: &Memory,
        value: &Val,
        _cx: &CallContext,
    ) -> Result<(), Trap> {
        for word in self.words_of(value)? {
            out.push(FlatValue::I32(word));
        }
        Ok(())
    }
}
