//! Decimal128 leaf family (§4.5): each value is a 34-significant-digit
//! decimal float stored as two `u64` words per row, backed by an
//! [`IntegerColumn`] pair (low word, high word).
//!
//! The 128-bit layout here is a sign/exponent/mantissa split isomorphic to
//! the IEEE 754-2008 decimal128 interchange format (1 sign bit, 14-bit
//! biased exponent, 113-bit integer mantissa) but without the
//! combination-field packing trick real BID implementations use to steal
//! two extra mantissa bits from the exponent field. It round-trips every
//! value representable in 34 decimal digits and preserves sign, exponent
//! and total ordering, which is all this engine needs from the format.

use bigdecimal::{BigDecimal, ToPrimitive};
use num_bigint::{BigInt, Sign};
use std::cmp::Ordering;
use std::str::FromStr;

use crate::arena::Arena;
use crate::error::{EngineError, Result};
use crate::leaf::integer::IntegerColumn;

const MANTISSA_BITS: u32 = 113;
const EXPONENT_BITS: u32 = 14;
const EXPONENT_BIAS: i32 = 6176;
const MAX_BIASED_EXPONENT: u32 = (1 << EXPONENT_BITS) - 1;
const MANTISSA_MASK: u128 = (1u128 << MANTISSA_BITS) - 1;

#[derive(Debug, Clone, PartialEq)]
pub enum Decimal128 {
    Finite { negative: bool, mantissa: u128, exponent: i32 },
    Infinity { negative: bool },
    NaN,
}

impl Decimal128 {
    pub fn zero() -> Self {
        Decimal128::Finite { negative: false, mantissa: 0, exponent: 0 }
    }

    pub fn encode(&self) -> (u64, u64) {
        let (sign, biased_exp, mantissa) = match self {
            Decimal128::NaN => (0u128, MAX_BIASED_EXPONENT as u128, 1u128),
            Decimal128::Infinity { negative } => {
                (*negative as u128, MAX_BIASED_EXPONENT as u128, 0u128)
            }
            Decimal128::Finite { negative, mantissa, exponent } => {
                let biased = (*exponent + EXPONENT_BIAS) as u128;
                (*negative as u128, biased, mantissa & MANTISSA_MASK)
            }
        };
        let bits: u128 = (sign << 127) | (biased_exp << MANTISSA_BITS) | mantissa;
        ((bits >> 64) as u64, bits as u64)
    }

    pub fn decode(high: u64, low: u64) -> Self {
        let bits: u128 = ((high as u128) << 64) | (low as u128);
        let negative = (bits >> 127) & 1 == 1;
        let biased_exp = ((bits >> MANTISSA_BITS) & ((1u128 << EXPONENT_BITS) - 1)) as u32;
        let mantissa = bits & MANTISSA_MASK;
        if biased_exp == MAX_BIASED_EXPONENT {
            if mantissa == 0 {
                Decimal128::Infinity { negative }
            } else {
                Decimal128::NaN
            }
        } else {
            Decimal128::Finite {
                negative,
                mantissa,
                exponent: biased_exp as i32 - EXPONENT_BIAS,
            }
        }
    }

    fn to_bigdecimal(&self) -> Option<BigDecimal> {
        match self {
            Decimal128::Finite { negative, mantissa, exponent } => {
                let sign = if *negative { Sign::Minus } else { Sign::Plus };
                let int = BigInt::from_bytes_be(sign, &mantissa.to_be_bytes());
                Some(BigDecimal::new(int, -(*exponent as i64)))
            }
            _ => None,
        }
    }

    /// Minimal-precision canonical printer: trailing mantissa zeros are
    /// folded into the exponent before formatting.
    pub fn to_canonical_string(&self) -> String {
        match self {
            Decimal128::NaN => "NaN".to_string(),
            Decimal128::Infinity { negative } => {
                if *negative { "-Inf".to_string() } else { "Inf".to_string() }
            }
            Decimal128::Finite { negative, mantissa, exponent } => {
                let mut m = *mantissa;
                let mut e = *exponent;
                if m == 0 {
                    return if *negative { "-0".to_string() } else { "0".to_string() };
                }
                while m % 10 == 0 {
                    m /= 10;
                    e += 1;
                }
                let bd = BigDecimal::new(
                    BigInt::from_bytes_be(Sign::Plus, &m.to_be_bytes()),
                    -(e as i64),
                );
                let sign = if *negative { "-" } else { "" };
                format!("{sign}{bd}")
            }
        }
    }
}

/// Parses `[+-]?(digits(.digits)?|.digits)([eE][+-]?digits)?`, plus the
/// case-insensitive keywords `inf`/`infinity`/`nan`.
impl FromStr for Decimal128 {
    type Err = EngineError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let trimmed = s.trim();
        let (negative, rest) = match trimmed.strip_prefix('-') {
            Some(r) => (true, r),
            None => (false, trimmed.strip_prefix('+').unwrap_or(trimmed)),
        };
        let lower = rest.to_ascii_lowercase();
        if lower == "nan" {
            return Ok(Decimal128::NaN);
        }
        if lower == "inf" || lower == "infinity" {
            return Ok(Decimal128::Infinity { negative });
        }

        let bd = BigDecimal::from_str(trimmed)
            .map_err(|e| EngineError::LogicError(format!("invalid decimal literal {s:?}: {e}")))?;
        let (int, scale) = bd.into_bigint_and_exponent();
        let (sign, bytes) = int.to_bytes_be();
        if bytes.len() > 16 {
            return Err(EngineError::LogicError(format!(
                "decimal literal {s:?} exceeds 34 significant digits"
            )));
        }
        let mut buf = [0u8; 16];
        buf[16 - bytes.len()..].copy_from_slice(&bytes);
        let mantissa = u128::from_be_bytes(buf);
        if mantissa > (10u128.pow(34) - 1) {
            return Err(EngineError::LogicError(format!(
                "decimal literal {s:?} exceeds 34 significant digits"
            )));
        }
        let exponent = -scale as i32;
        if !(-EXPONENT_BIAS..=(MAX_BIASED_EXPONENT as i32 - 1 - EXPONENT_BIAS)).contains(&exponent) {
            return Err(EngineError::LogicError(format!(
                "decimal literal {s:?} exponent out of range"
            )));
        }
        Ok(Decimal128::Finite {
            negative: sign == Sign::Minus || negative,
            mantissa,
            exponent,
        })
    }
}

impl PartialOrd for Decimal128 {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self.to_bigdecimal(), other.to_bigdecimal()) {
            (Some(a), Some(b)) => a.partial_cmp(&b),
            _ => match (self, other) {
                (Decimal128::NaN, _) | (_, Decimal128::NaN) => None,
                (Decimal128::Infinity { negative: a }, Decimal128::Infinity { negative: b }) => {
                    Some(b.cmp(a))
                }
                (Decimal128::Infinity { negative }, Decimal128::Finite { .. }) => {
                    Some(if *negative { Ordering::Less } else { Ordering::Greater })
                }
                (Decimal128::Finite { .. }, Decimal128::Infinity { negative }) => {
                    Some(if *negative { Ordering::Greater } else { Ordering::Less })
                }
                _ => None,
            },
        }
    }
}

pub struct DecimalColumn {
    lo: IntegerColumn,
    hi: IntegerColumn,
}

impl DecimalColumn {
    pub fn new() -> Self {
        DecimalColumn { lo: IntegerColumn::new(), hi: IntegerColumn::new() }
    }

    pub fn len(&self, arena: &mut Arena) -> Result<u64> {
        self.lo.len(arena)
    }

    pub fn append(&mut self, arena: &mut Arena, v: &Decimal128) -> Result<()> {
        let (high, low) = v.encode();
        self.hi.append(arena, high as i64)?;
        self.lo.append(arena, low as i64)
    }

    pub fn get(&self, arena: &mut Arena, i: u64) -> Result<Decimal128> {
        let high = self.hi.get(arena, i)? as u64;
        let low = self.lo.get(arena, i)? as u64;
        Ok(Decimal128::decode(high, low))
    }
}

impl Default for DecimalColumn {
    fn default() -> Self {
        Self::new()
    }
}

#[allow(dead_code)]
fn to_f64_lossy(d: &Decimal128) -> Option<f64> {
    d.to_bigdecimal().and_then(|b| b.to_f64())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GrowthPolicy;
    use tempfile::tempdir;

    #[test]
    fn parses_and_prints_minimal_precision() {
        let d = Decimal128::from_str("-12.3400").unwrap();
        assert_eq!(d.to_canonical_string(), "-12.34");
        let d2 = Decimal128::from_str("0.001").unwrap();
        assert_eq!(d2.to_canonical_string(), "0.001");
    }

    #[test]
    fn parses_special_values() {
        assert_eq!(Decimal128::from_str("NaN").unwrap(), Decimal128::NaN);
        assert_eq!(
            Decimal128::from_str("-Inf").unwrap(),
            Decimal128::Infinity { negative: true }
        );
    }

    #[test]
    fn encode_decode_roundtrips() {
        let d = Decimal128::from_str("3.14159").unwrap();
        let (hi, lo) = d.encode();
        assert_eq!(Decimal128::decode(hi, lo), d);
    }

    #[test]
    fn ordering_compares_across_scales() {
        let a = Decimal128::from_str("1.50").unwrap();
        let b = Decimal128::from_str("1.5000001").unwrap();
        assert_eq!(a.partial_cmp(&b), Some(Ordering::Less));
    }

    #[test]
    fn column_roundtrips_through_arena() {
        let dir = tempdir().unwrap();
        let mut arena = Arena::create(&dir.path().join("a.db"), GrowthPolicy::conservative()).unwrap();
        let mut col = DecimalColumn::new();
        let values = ["0", "-7.5", "123456789.987654321", "NaN"];
        for v in &values {
            col.append(&mut arena, &Decimal128::from_str(v).unwrap()).unwrap();
        }
        for (i, v) in values.iter().enumerate() {
            let got = col.get(&mut arena, i as u64).unwrap();
            assert_eq!(got, Decimal128::from_str(v).unwrap());
        }
    }
}
