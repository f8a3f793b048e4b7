//! Timestamp leaf family: a pair of columns `{seconds: i64 (nullable),
//! nanoseconds: u32}` compared lexicographically (§4.5).

use crate::arena::Arena;
use crate::error::{EngineError, Result};
use crate::leaf::integer::IntegerColumn;

/// Sentinel marking a null row in the seconds column. Nanoseconds is
/// always present and forced to zero for null rows.
pub const NULL_SECONDS: i64 = i64::MIN;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timestamp {
    pub seconds: i64,
    pub nanos: i64,
}

impl Timestamp {
    /// Normalizes so the nanosecond component's sign matches the seconds
    /// component's sign, giving a canonical representation of time points
    /// on both sides of the epoch (§4.5).
    pub fn new(seconds: i64, nanos_magnitude: u32) -> Self {
        let nanos = nanos_magnitude as i64;
        let nanos = if seconds < 0 { -nanos } else { nanos };
        Timestamp { seconds, nanos }
    }
}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.seconds, self.nanos).cmp(&(other.seconds, other.nanos))
    }
}

pub struct TimestampColumn {
    seconds: IntegerColumn,
    nanos: IntegerColumn,
}

impl TimestampColumn {
    pub fn new() -> Self {
        TimestampColumn {
            seconds: IntegerColumn::new(),
            nanos: IntegerColumn::new(),
        }
    }

    pub fn len(&self, arena: &mut Arena) -> Result<u64> {
        self.seconds.len(arena)
    }

    pub fn append(&mut self, arena: &mut Arena, ts: Option<Timestamp>) -> Result<()> {
        match ts {
            None => {
                self.seconds.append(arena, NULL_SECONDS)?;
                self.nanos.append(arena, 0)?;
            }
            Some(t) => {
                if t.seconds == NULL_SECONDS {
                    return Err(EngineError::LogicError(
                        "seconds value collides with the null sentinel".into(),
                    ));
                }
                self.seconds.append(arena, t.seconds)?;
                self.nanos.append(arena, t.nanos)?;
            }
        }
        Ok(())
    }

    pub fn get(&self, arena: &mut Arena, i: u64) -> Result<Option<Timestamp>> {
        let seconds = self.seconds.get(arena, i)?;
        if seconds == NULL_SECONDS {
            return Ok(None);
        }
        let nanos = self.nanos.get(arena, i)?;
        Ok(Some(Timestamp { seconds, nanos }))
    }
}

impl Default for TimestampColumn {
    fn default() -> Self {
        Self::new()
    }
}
