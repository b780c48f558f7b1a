//! Primitive element types and scalar values.

use std::fmt;
use std::str::FromStr;

use ordered_float::OrderedFloat;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DType {
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float32,
    Float64,
}

impl DType {
    pub const ALL: [DType; 11] = [
        DType::Bool,
        DType::Int8,
        DType::Int16,
        DType::Int32,
        DType::Int64,
        DType::UInt8,
        DType::UInt16,
        DType::UInt32,
        DType::UInt64,
        DType::Float32,
        DType::Float64,
    ];

    pub fn name(self) -> &'static str {
        match self {
            DType::Bool => "bool",
            DType::Int8 => "int8",
            DType::Int16 => "int16",
            DType::Int32 => "int32",
            DType::Int64 => "int64",
            DType::UInt8 => "uint8",
            DType::UInt16 => "uint16",
            DType::UInt32 => "uint32",
            DType::UInt64 => "uint64",
            DType::Float32 => "float32",
            DType::Float64 => "float64",
        }
    }

    /// Kind letter plus item size, e.g. `f8`; used in default buffer names.
    pub fn code(self) -> &'static str {
        match self {
            DType::Bool => "b1",
            DType::Int8 => "i1",
            DType::Int16 => "i2",
            DType::Int32 => "i4",
            DType::Int64 => "i8",
            DType::UInt8 => "u1",
            DType::UInt16 => "u2",
            DType::UInt32 => "u4",
            DType::UInt64 => "u8",
            DType::Float32 => "f4",
            DType::Float64 => "f8",
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, DType::Float32 | DType::Float64)
    }

    pub fn is_signed(self) -> bool {
        matches!(self, DType::Int8 | DType::Int16 | DType::Int32 | DType::Int64)
    }

    pub fn is_unsigned(self) -> bool {
        matches!(self, DType::UInt8 | DType::UInt16 | DType::UInt32 | DType::UInt64)
    }

    /// Inclusive integer range, `None` for bool and floats.
    pub fn int_range(self) -> Option<(i128, i128)> {
        Some(match self {
            DType::Int8 => (i8::MIN as i128, i8::MAX as i128),
            DType::Int16 => (i16::MIN as i128, i16::MAX as i128),
            DType::Int32 => (i32::MIN as i128, i32::MAX as i128),
            DType::Int64 => (i64::MIN as i128, i64::MAX as i128),
            DType::UInt8 => (0, u8::MAX as i128),
            DType::UInt16 => (0, u16::MAX as i128),
            DType::UInt32 => (0, u32::MAX as i128),
            DType::UInt64 => (0, u64::MAX as i128),
            _ => return None,
        })
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DType {
    type Err = Error;

    /// Accepts full names (`float64`) and array-protocol codes (`f8`, `<i4`, `|b1`).
    fn from_str(s: &str) -> Result<Self> {
        if let Some(dt) = DType::ALL.iter().find(|d| d.name() == s) {
            return Ok(*dt);
        }
        let code = s.trim_start_matches(['<', '|', '=']);
        if code.starts_with('>') || code.starts_with('!') {
            return Err(Error::unsupported(format!("big-endian dtype {s:?}")));
        }
        match code {
            "?" | "b1" => Ok(DType::Bool),
            "bool_" => Ok(DType::Bool),
            _ => DType::ALL
                .iter()
                .find(|d| d.code() == code)
                .copied()
                .ok_or_else(|| Error::invalid(format!("unrecognized dtype {s:?}"))),
        }
    }
}

// ------------------------------- Scalars ---------------------------------- //

/// One element of a primitive buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Scalar {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(OrderedFloat<f64>),
}

impl Scalar {
    pub fn float(x: f64) -> Self {
        Scalar::Float(OrderedFloat(x))
    }

    pub fn as_f64(self) -> f64 {
        match self {
            Scalar::Bool(b) => b as u8 as f64,
            Scalar::Int(i) => i as f64,
            Scalar::UInt(u) => u as f64,
            Scalar::Float(x) => x.0,
        }
    }

    pub fn as_i64(self) -> i64 {
        match self {
            Scalar::Bool(b) => b as i64,
            Scalar::Int(i) => i,
            Scalar::UInt(u) => u as i64,
            Scalar::Float(x) => x.0 as i64,
        }
    }

    pub fn as_bool(self) -> bool {
        match self {
            Scalar::Bool(b) => b,
            Scalar::Int(i) => i != 0,
            Scalar::UInt(u) => u != 0,
            Scalar::Float(x) => x.0 != 0.0,
        }
    }

    pub fn is_nan(self) -> bool {
        matches!(self, Scalar::Float(x) if x.0.is_nan())
    }

    /// The dtype a dynamically typed result of this scalar is stored as.
    pub fn natural_dtype(self) -> DType {
        match self {
            Scalar::Bool(_) => DType::Bool,
            Scalar::Int(_) | Scalar::UInt(_) => DType::Int64,
            Scalar::Float(_) => DType::Float64,
        }
    }
}

impl From<bool> for Scalar {
    fn from(v: bool) -> Self {
        Scalar::Bool(v)
    }
}

impl From<i32> for Scalar {
    fn from(v: i32) -> Self {
        Scalar::Int(v as i64)
    }
}

impl From<i64> for Scalar {
    fn from(v: i64) -> Self {
        Scalar::Int(v)
    }
}

impl From<u64> for Scalar {
    fn from(v: u64) -> Self {
        Scalar::UInt(v)
    }
}

impl From<f32> for Scalar {
    fn from(v: f32) -> Self {
        Scalar::float(v as f64)
    }
}

impl From<f64> for Scalar {
    fn from(v: f64) -> Self {
        Scalar::float(v)
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Bool(b) => write!(f, "{b}"),
            Scalar::Int(i) => write!(f, "{i}"),
            Scalar::UInt(u) => write!(f, "{u}"),
            Scalar::Float(x) => write!(f, "{}", x.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_names_and_codes() {
        assert_eq!("float64".parse::<DType>().unwrap(), DType::Float64);
        assert_eq!("f8".parse::<DType>().unwrap(), DType::Float64);
        assert_eq!("<i4".parse::<DType>().unwrap(), DType::Int32);
        assert_eq!("|b1".parse::<DType>().unwrap(), DType::Bool);
        assert_eq!("u1".parse::<DType>().unwrap(), DType::UInt8);
        assert!(matches!(">f8".parse::<DType>(), Err(Error::Unsupported(_))));
        assert!(matches!("complex128".parse::<DType>(), Err(Error::InvalidProperty(_))));
    }

    #[test]
    fn nan_scalars_compare_equal_to_themselves() {
        let a = Scalar::float(f64::NAN);
        assert!(a.is_nan());
        assert_eq!(a, a);
        assert_eq!(Scalar::from(3i64).natural_dtype(), DType::Int64);
    }
}
