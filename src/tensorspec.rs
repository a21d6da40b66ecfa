use serde::{Deserialize, Serialize};

use std::fmt::Display;

use crate::common::{DimSize, Dtype, Format, Shape, UNKNOWN_DIM};
use crate::utils::{checked_product, join_into_string};

/// One operand of an operator, as produced by shape inference.
#[derive(Clone, PartialEq, Eq, Debug, Hash, Deserialize, Serialize)]
pub struct TensorDesc {
    pub shape: Shape,
    pub dtype: Dtype,
    #[serde(default)]
    pub format: Format,
}

/// An operator instance handed to tiling: its type name plus input and output descriptors.
#[derive(Clone, PartialEq, Eq, Debug, Deserialize, Serialize)]
pub struct OpDesc {
    pub op_type: String,
    pub inputs: Vec<TensorDesc>,
    pub outputs: Vec<TensorDesc>,
}

impl TensorDesc {
    pub fn new(shape: Shape, dtype: Dtype) -> Self {
        TensorDesc {
            shape,
            dtype,
            format: Format::ND,
        }
    }

    pub fn with_format(mut self, format: Format) -> Self {
        self.format = format;
        self
    }

    pub fn shape(&self) -> &[DimSize] {
        &self.shape
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Returns `true` if every dimension is known.
    pub fn is_static(&self) -> bool {
        self.shape.iter().all(|&d| d != UNKNOWN_DIM)
    }

    /// Number of elements, or `None` if a dimension is unknown or the product overflows.
    pub fn volume(&self) -> Option<DimSize> {
        if !self.is_static() {
            return None;
        }
        checked_product(self.shape.iter())
    }
}

impl OpDesc {
    pub fn new(op_type: impl Into<String>, inputs: Vec<TensorDesc>, outputs: Vec<TensorDesc>) -> Self {
        OpDesc {
            op_type: op_type.into(),
            inputs,
            outputs,
        }
    }

    pub fn input_shapes(&self) -> Vec<Shape> {
        self.inputs.iter().map(|t| t.shape.clone()).collect()
    }

    pub fn output_shapes(&self) -> Vec<Shape> {
        self.outputs.iter().map(|t| t.shape.clone()).collect()
    }

    /// The dtype tiling computes in: the first output's, falling back to the first input's.
    pub fn out_dtype(&self) -> Option<Dtype> {
        self.outputs
            .first()
            .or_else(|| self.inputs.first())
            .map(|t| t.dtype)
    }

    pub fn in_dtype(&self) -> Option<Dtype> {
        self.inputs.first().map(|t| t.dtype)
    }
}

impl Display for TensorDesc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[{}]", self.dtype, join_into_string(&self.shape, ", "))
    }
}

impl Display for OpDesc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}({}) -> ({})",
            self.op_type,
            join_into_string(&self.inputs, ", "),
            join_into_string(&self.outputs, ", ")
        )
    }
}
