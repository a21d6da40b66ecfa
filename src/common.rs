use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt::Display;

pub type DimSize = i64;
pub type Shape = SmallVec<[DimSize; 8]>;

/// Marks a dimension whose size is unknown at compile time.
pub const UNKNOWN_DIM: DimSize = -1;

/// Granularity, in bytes, of UB accesses and of multi-core output writes.
pub const BLOCK_BYTES: i64 = 32;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, strum::EnumString,
)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Dtype {
    Bool,
    Int8,
    Uint8,
    Int16,
    Uint16,
    Float16,
    Bfloat16,
    Int32,
    Uint32,
    Float32,
    Int64,
    Uint64,
    Float64,
}

#[allow(clippy::upper_case_acronyms)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Format {
    #[default]
    ND,
    NCHW,
    NHWC,
    NC1HWC0,
}

impl Dtype {
    /// The bytes required to represent a value of this Dtype.
    pub fn size(&self) -> u8 {
        match self {
            Dtype::Bool | Dtype::Int8 | Dtype::Uint8 => 1,
            Dtype::Int16 | Dtype::Uint16 | Dtype::Float16 | Dtype::Bfloat16 => 2,
            Dtype::Int32 | Dtype::Uint32 | Dtype::Float32 => 4,
            Dtype::Int64 | Dtype::Uint64 | Dtype::Float64 => 8,
        }
    }

    /// Number of values of this Dtype in one 32-byte block.
    pub fn elements_per_block(&self) -> i64 {
        elements_per_block(self.size())
    }
}

impl Display for Dtype {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Dtype::Bool => write!(f, "bool"),
            Dtype::Int8 => write!(f, "i8"),
            Dtype::Uint8 => write!(f, "u8"),
            Dtype::Int16 => write!(f, "i16"),
            Dtype::Uint16 => write!(f, "u16"),
            Dtype::Float16 => write!(f, "f16"),
            Dtype::Bfloat16 => write!(f, "bf16"),
            Dtype::Int32 => write!(f, "i32"),
            Dtype::Uint32 => write!(f, "u32"),
            Dtype::Float32 => write!(f, "f32"),
            Dtype::Int64 => write!(f, "i64"),
            Dtype::Uint64 => write!(f, "u64"),
            Dtype::Float64 => write!(f, "f64"),
        }
    }
}

pub fn elements_per_block(dtype_bytes: u8) -> i64 {
    debug_assert!(dtype_bytes > 0);
    (BLOCK_BYTES / i64::from(dtype_bytes)).max(1)
}

#[macro_export]
macro_rules! shape {
    ($($dim:expr),*$(,)*) => {{
        // Bind to a variable with an explicit type to help out type inference.
        let sv: $crate::common::Shape = $crate::smallvec::smallvec![ $( ($dim) as $crate::common::DimSize ),* ];
        sv
    }};
}
