use serde::{Deserialize, Serialize};

use std::fmt::{self, Display};

use crate::common::DimSize;
use crate::compile_info::ConfigError;
use crate::dispatch::UnsupportedCase;
use crate::shapes::ShapeError;

/// The outcome of one tiling invocation, before serialization.
///
/// Axis indices refer to the shape the algorithm worked on (fused, merged or
/// reordered), not necessarily to the operator's original input shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct TilingDecision {
    pub block_axis: usize,
    pub block_factor: DimSize,
    pub block_dims: u32,
    pub ub: UbSplit,
    pub tiling_key: i64,
    pub need_multi_core: bool,
    pub need_double_buffer: bool,
}

/// Where the UB tile was cut.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum UbSplit {
    Single {
        axis: usize,
        factor: DimSize,
    },
    /// Two independent cuts: one on the input side and one on the output side.
    Pair {
        low_axis: usize,
        low_factor: DimSize,
        high_axis: usize,
        high_factor: DimSize,
    },
}

#[derive(thiserror::Error, Debug)]
#[cfg_attr(test, derive(PartialEq))]
pub enum TilingError {
    #[error("Invalid compile info: {0}")]
    Config(#[from] ConfigError),
    #[error("Invalid shape: {0}")]
    Shape(#[from] ShapeError),
    #[error("No tiling fits in the unified buffer: {0}")]
    ResourceExhausted(String),
    #[error("Lookup failed: {0}")]
    Lookup(#[from] LookupError),
    #[error("Unsupported case: {0}")]
    UnsupportedCase(#[from] UnsupportedCase),
    #[error("Dtype of {0} bytes has no split factor")]
    UnsupportedDtype(u8),
    #[error("Size {0} does not fit the tiling data format")]
    ShapeTooLarge(i64),
    #[error("Tiling data has {actual} fields; the variable list declares {expected}")]
    FieldCountMismatch { expected: usize, actual: usize },
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum LookupError {
    #[error("No tiling key for block axis {block_axis} and UB axis {ub_axis} in {table}")]
    TilingKeyNotFound {
        table: String,
        block_axis: usize,
        ub_axis: usize,
    },
    #[error("No variable list for tiling key {0}")]
    VarsNotFound(i64),
    #[error("No constant-shape entry matches {0}")]
    ConstShapeNotFound(String),
    #[error("No compile info for reduce layout {0}")]
    PatternNotFound(String),
    #[error("No base info for pattern code {0}")]
    BaseInfoNotFound(u32),
    #[error("Tiling variable {0} has no value for this shape")]
    UnresolvableVar(String),
}

impl TilingDecision {
    /// A decision that runs the whole shape on one core with a single UB tile.
    pub fn single_core(tiling_key: i64, axis: usize, size: DimSize) -> Self {
        TilingDecision {
            block_axis: axis,
            block_factor: size,
            block_dims: 1,
            ub: UbSplit::Single { axis, factor: size },
            tiling_key,
            need_multi_core: false,
            need_double_buffer: false,
        }
    }

    pub fn ub_factor(&self) -> DimSize {
        match self.ub {
            UbSplit::Single { factor, .. } => factor,
            UbSplit::Pair { high_factor, .. } => high_factor,
        }
    }

    pub fn ub_axis(&self) -> usize {
        match self.ub {
            UbSplit::Single { axis, .. } => axis,
            UbSplit::Pair { high_axis, .. } => high_axis,
        }
    }
}

impl Display for TilingDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "key={} block(axis={}, factor={}, dims={}) ",
            self.tiling_key, self.block_axis, self.block_factor, self.block_dims
        )?;
        match self.ub {
            UbSplit::Single { axis, factor } => write!(f, "ub(axis={axis}, factor={factor})"),
            UbSplit::Pair {
                low_axis,
                low_factor,
                high_axis,
                high_factor,
            } => write!(
                f,
                "ub(low={low_axis}:{low_factor}, high={high_axis}:{high_factor})"
            ),
        }
    }
}

/// Converts a dimension or factor into the 4-byte slot used by the tiling data.
pub fn to_i32(value: i64) -> Result<i32, TilingError> {
    i32::try_from(value).map_err(|_| TilingError::ShapeTooLarge(value))
}

/// Converts a computed core count into a block dimension.
pub fn to_block_dims(value: i64) -> Result<u32, TilingError> {
    u32::try_from(value).map_err(|_| TilingError::ShapeTooLarge(value))
}
