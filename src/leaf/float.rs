//! Float / double leaf family: values stored as their IEEE-754 bit pattern
//! inside a width-32/64 integer leaf (§4.5).

use crate::arena::Arena;
use crate::leaf::integer::IntegerColumn;
use crate::error::Result;

pub struct FloatColumn {
    inner: IntegerColumn,
}

impl FloatColumn {
    pub fn new() -> Self {
        FloatColumn { inner: IntegerColumn::new() }
    }

    pub fn len(&self, arena: &mut Arena) -> Result<u64> {
        self.inner.len(arena)
    }

    pub fn append_f32(&mut self, arena: &mut Arena, v: f32) -> Result<()> {
        self.inner.append(arena, v.to_bits() as i64)
    }

    pub fn get_f32(&self, arena: &mut Arena, i: u64) -> Result<f32> {
        Ok(f32::from_bits(self.inner.get(arena, i)? as u32))
    }

    pub fn append_f64(&mut self, arena: &mut Arena, v: f64) -> Result<()> {
        self.inner.append(arena, v.to_bits() as i64)
    }

    pub fn get_f64(&self, arena: &mut Arena, i: u64) -> Result<f64> {
        Ok(f64::from_bits(self.inner.get(arena, i)? as u64))
    }
}

impl Default for FloatColumn {
    fn default() -> Self {
        Self::new()
    }
}
