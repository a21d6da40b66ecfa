//! Normalizes operand shapes before tiling.
//!
//! Inputs of different ranks are left-padded with 1s to a common rank, and the broadcast
//! output shape is computed from them. Every algorithm starts from a [ShapeAdapter].

use smallvec::smallvec;

use crate::common::{DimSize, Shape, UNKNOWN_DIM};
use crate::utils::{checked_product, join_into_string};

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ShapeError {
    #[error("Dimensions {left} and {right} conflict at axis {axis}")]
    BroadcastConflict {
        axis: usize,
        left: DimSize,
        right: DimSize,
    },
    #[error("Shape [{0}] has a dimension unknown at tiling time")]
    UnknownDim(String),
    #[error("Expected rank {expected}; got {actual}")]
    RankMismatch { expected: usize, actual: usize },
    #[error("Axis {axis} is out of range for rank {rank}")]
    AxisOutOfRange { axis: i64, rank: usize },
    #[error("Permutation [{0}] is not a permutation of its axes")]
    InvalidPermutation(String),
    #[error("Operator has no {0}")]
    MissingOperand(&'static str),
    #[error("Element count of [{0}] overflows")]
    Overflow(String),
    #[error("Rank {rank} exceeds the supported maximum of {max}")]
    RankTooLarge { rank: usize, max: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShapeAdapter {
    dim_len: usize,
    inputs: Vec<Shape>,
    output: Shape,
}

impl ShapeAdapter {
    /// Pads `inputs` to a common rank and computes their broadcast shape.
    ///
    /// `outputs` are only checked for unknown dimensions; the broadcast of the inputs is
    /// authoritative for tiling.
    pub fn new(inputs: &[Shape], outputs: &[Shape]) -> Result<Self, ShapeError> {
        if inputs.is_empty() {
            return Err(ShapeError::MissingOperand("inputs"));
        }
        for s in inputs.iter().chain(outputs) {
            if s.iter().any(|&d| d == UNKNOWN_DIM || d < 0) {
                return Err(ShapeError::UnknownDim(join_into_string(s, ", ")));
            }
        }

        let dim_len = inputs.iter().map(|s| s.len()).max().unwrap_or(0).max(1);
        let padded = inputs
            .iter()
            .map(|s| {
                let mut p: Shape = smallvec![1; dim_len - s.len()];
                p.extend_from_slice(s);
                p
            })
            .collect::<Vec<_>>();

        let mut output: Shape = smallvec![1; dim_len];
        for (axis, out_dim) in output.iter_mut().enumerate() {
            for s in &padded {
                let d = s[axis];
                if d == 1 || d == *out_dim {
                    continue;
                }
                if *out_dim == 1 {
                    *out_dim = d;
                } else {
                    return Err(ShapeError::BroadcastConflict {
                        axis,
                        left: *out_dim,
                        right: d,
                    });
                }
            }
        }

        Ok(ShapeAdapter {
            dim_len,
            inputs: padded,
            output,
        })
    }

    pub fn dim_len(&self) -> usize {
        self.dim_len
    }

    pub fn inputs(&self) -> &[Shape] {
        &self.inputs
    }

    pub fn output(&self) -> &Shape {
        &self.output
    }

    /// Returns `true` if no input is broadcast along any axis.
    pub fn is_pure_elementwise(&self) -> bool {
        self.inputs.iter().all(|s| *s == self.output)
    }

    /// Number of output elements. Zero-size dimensions yield 0.
    pub fn output_total(&self) -> Result<DimSize, ShapeError> {
        checked_product(self.output.iter())
            .ok_or_else(|| ShapeError::Overflow(join_into_string(&self.output, ", ")))
    }

    /// Returns whether input `input_idx` is broadcast along `axis`.
    pub fn is_broadcast(&self, input_idx: usize, axis: usize) -> bool {
        self.inputs[input_idx][axis] == 1 && self.output[axis] != 1
    }
}

/// Normalizes possibly-negative axis indices against `rank`, returning them sorted and deduplicated.
pub fn normalize_axes(axes: &[i64], rank: usize) -> Result<Vec<usize>, ShapeError> {
    let rank_i = i64::try_from(rank).map_err(|_| ShapeError::AxisOutOfRange { axis: 0, rank })?;
    let mut result = axes
        .iter()
        .map(|&a| {
            let n = if a < 0 { a + rank_i } else { a };
            if n < 0 || n >= rank_i {
                Err(ShapeError::AxisOutOfRange { axis: a, rank })
            } else {
                Ok(n as usize)
            }
        })
        .collect::<Result<Vec<_>, _>>()?;
    result.sort_unstable();
    result.dedup();
    Ok(result)
}
