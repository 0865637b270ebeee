use std::fmt;

use super::{EngineError, Result};

/// Element types, numbered the way LibTorch numbers `ScalarType`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[repr(i32)]
pub enum DType {
    Byte = 0,
    Char = 1,
    Short = 2,
    Int = 3,
    Long = 4,
    Half = 5,
    Float = 6,
    Double = 7,
    ComplexHalf = 8,
    ComplexFloat = 9,
    ComplexDouble = 10,
    Bool = 11,
    QInt8 = 12,
    QUInt8 = 13,
    QInt32 = 14,
    BFloat16 = 15,
}

impl Default for DType {
    fn default() -> Self {
        Self::Float
    }
}

impl DType {
    pub fn from_code(code: i32) -> Result<Self> {
        let dtype = match code {
            0 => Self::Byte,
            1 => Self::Char,
            2 => Self::Short,
            3 => Self::Int,
            4 => Self::Long,
            5 => Self::Half,
            6 => Self::Float,
            7 => Self::Double,
            8 => Self::ComplexHalf,
            9 => Self::ComplexFloat,
            10 => Self::ComplexDouble,
            11 => Self::Bool,
            12 => Self::QInt8,
            13 => Self::QUInt8,
            14 => Self::QInt32,
            15 => Self::BFloat16,
            other => return Err(EngineError::UnknownDType(other)),
        };
        Ok(dtype)
    }

    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn is_floating(self) -> bool {
        matches!(self, Self::Half | Self::Float | Self::Double | Self::BFloat16)
    }

    pub fn is_integral(self) -> bool {
        matches!(
            self,
            Self::Byte | Self::Char | Self::Short | Self::Int | Self::Long
        )
    }

    pub fn is_complex(self) -> bool {
        matches!(
            self,
            Self::ComplexHalf | Self::ComplexFloat | Self::ComplexDouble
        )
    }

    pub fn is_quantized(self) -> bool {
        matches!(self, Self::QInt8 | Self::QUInt8 | Self::QInt32)
    }

    pub fn elem_size(self) -> usize {
        match self {
            Self::Byte | Self::Char | Self::Bool | Self::QInt8 | Self::QUInt8 => 1,
            Self::Short | Self::Half | Self::BFloat16 => 2,
            Self::Int | Self::Float | Self::QInt32 | Self::ComplexHalf => 4,
            Self::Long | Self::Double | Self::ComplexFloat => 8,
            Self::ComplexDouble => 16,
        }
    }

    fn rank(self) -> u8 {
        match self {
            Self::Bool => 0,
            Self::Byte => 1,
            Self::Char => 2,
            Self::Short => 3,
            Self::Int => 4,
            Self::Long => 5,
            Self::Half | Self::BFloat16 => 6,
            Self::Float => 7,
            Self::Double => 8,
            _ => 9,
        }
    }

    /// Result type of a binary operation between `self` and `other`.
    pub fn promote(self, other: Self) -> Self {
        if self == other {
            return self;
        }
        match (self, other) {
            (Self::Half, Self::BFloat16) | (Self::BFloat16, Self::Half) => Self::Float,
            (Self::Byte, Self::Char) | (Self::Char, Self::Byte) => Self::Short,
            _ if self.rank() >= other.rank() => self,
            _ => other,
        }
    }

    /// The type a floating-point result takes for an input of this type.
    pub fn to_floating(self) -> Self {
        if self.is_floating() {
            self
        } else {
            Self::Float
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Byte => "uint8",
            Self::Char => "int8",
            Self::Short => "int16",
            Self::Int => "int32",
            Self::Long => "int64",
            Self::Half => "float16",
            Self::Float => "float32",
            Self::Double => "float64",
            Self::ComplexHalf => "complex32",
            Self::ComplexFloat => "complex64",
            Self::ComplexDouble => "complex128",
            Self::Bool => "bool",
            Self::QInt8 => "qint8",
            Self::QUInt8 => "quint8",
            Self::QInt32 => "qint32",
            Self::BFloat16 => "bfloat16",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip_and_reject_unknown() {
        for code in 0..16 {
            assert_eq!(DType::from_code(code).unwrap().code(), code);
        }
        assert!(DType::from_code(16).is_err());
        assert!(DType::from_code(-1).is_err());
    }

    #[test]
    fn promotion_prefers_wider_and_floating() {
        assert_eq!(DType::Long.promote(DType::Float), DType::Float);
        assert_eq!(DType::Bool.promote(DType::Int), DType::Int);
        assert_eq!(DType::Half.promote(DType::BFloat16), DType::Float);
        assert_eq!(DType::Byte.promote(DType::Char), DType::Short);
        assert_eq!(DType::Float.promote(DType::Double), DType::Double);
    }
}
