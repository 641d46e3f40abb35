use std::fmt;

// DType — element types
//
//   F32  default for parameters and activations
//   F64  high-precision work (gradient checks, tests)
//   I64  integer indices produced by argmax

/// Element data type carried by every tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    F32,
    F64,
    I64,
}

impl DType {
    /// Size of one element in bytes.
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DType::F32 => 4,
            DType::F64 | DType::I64 => 8,
        }
    }

    /// Floating-point types are the only ones that carry gradients.
    pub fn is_float(&self) -> bool {
        matches!(self, DType::F32 | DType::F64)
    }

    /// Stable one-byte tag used by the parameter checkpoint format.
    pub fn tag(&self) -> u8 {
        match self {
            DType::F32 => 0,
            DType::F64 => 1,
            DType::I64 => 2,
        }
    }

    pub fn from_tag(tag: u8) -> Option<DType> {
        match tag {
            0 => Some(DType::F32),
            1 => Some(DType::F64),
            2 => Some(DType::I64),
            _ => None,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DType::F32 => "f32",
            DType::F64 => "f64",
            DType::I64 => "i64",
        };
        write!(f, "{}", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_roundtrip() {
        for dt in [DType::F32, DType::F64, DType::I64] {
            assert_eq!(DType::from_tag(dt.tag()), Some(dt));
        }
        assert_eq!(DType::from_tag(9), None);
    }

    #[test]
    fn test_is_float() {
        assert!(DType::F32.is_float());
        assert!(!DType::I64.is_float());
    }
}
