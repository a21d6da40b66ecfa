//! Routes an operator to the tiling algorithm its compile info selects.
//!
//! Parsed handlers are kept in a [TilingCache] owned by the caller, so a compile-info document
//! is validated once per operator type no matter how many shapes are tiled against it.

use enum_dispatch::enum_dispatch;
use log::{debug, error};
use serde_json::Value;

use std::collections::HashMap;
use std::sync::Arc;

use crate::common::{DimSize, Dtype, Shape};
use crate::compile_info::{CompileInfo, ConfigError, Pattern};
use crate::elementwise::ElementwiseTiling;
use crate::norm::NormTiling;
use crate::reduce::ReduceTiling;
use crate::serialize::RunInfo;
use crate::shapes::ShapeError;
use crate::tensorspec::OpDesc;
use crate::tiling::TilingError;
use crate::transpose::TransposeTiling;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum UnsupportedCase {
    #[error("Pattern {0:?} has no tiling algorithm")]
    UnknownPattern(String),
    #[error("{0} tiling does not accept caller-supplied shapes")]
    ShapeOverride(Pattern),
}

/// Input shapes (and, for reductions, axes) that replace the ones carried by the [OpDesc].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShapeOverride {
    pub input_shapes: Vec<Shape>,
    pub reduce_axes: Option<Vec<i64>>,
}

#[enum_dispatch]
pub trait AutoTiling {
    fn do_tiling(&self, op: &OpDesc, run_info: &mut RunInfo) -> Result<(), TilingError>;

    fn do_tiling_with_shapes(
        &self,
        op: &OpDesc,
        shapes: &ShapeOverride,
        run_info: &mut RunInfo,
    ) -> Result<(), TilingError>;
}

#[enum_dispatch(AutoTiling)]
#[derive(Debug, Clone)]
pub enum TilingHandler {
    ElementwiseTiling,
    ReduceTiling,
    NormTiling,
    TransposeTiling,
}

/// Parsed tiling handlers, keyed by operator type and then by the full compile-info text.
///
/// A lookup hashes and compares the text; JSON is only parsed on a miss.
#[derive(Debug, Default)]
pub struct TilingCache {
    handlers: HashMap<String, HashMap<String, Arc<TilingHandler>>>,
}

impl From<CompileInfo> for TilingHandler {
    fn from(info: CompileInfo) -> Self {
        match info {
            CompileInfo::ElemWise(i) | CompileInfo::Broadcast(i) => ElementwiseTiling::new(i).into(),
            CompileInfo::CommReduce(i) => ReduceTiling::new(i).into(),
            CompileInfo::Norm(i) => NormTiling::new(i).into(),
            CompileInfo::Transpose(i) => TransposeTiling::new(i).into(),
        }
    }
}

impl TilingCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.handlers.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn clear(&mut self) {
        self.handlers.clear();
    }

    /// Returns the handler for `compile_info`, parsing and caching it on first use.
    pub fn handler(
        &mut self,
        op_type: &str,
        compile_info: &str,
    ) -> Result<Arc<TilingHandler>, TilingError> {
        if let Some(handler) = self
            .handlers
            .get(op_type)
            .and_then(|by_info| by_info.get(compile_info))
        {
            return Ok(Arc::clone(handler));
        }

        let value: Value = serde_json::from_str(compile_info).map_err(ConfigError::from)?;
        let pattern = Pattern::of(&value).map_err(|e| match e {
            ConfigError::UnknownPattern(tag) => {
                TilingError::from(UnsupportedCase::UnknownPattern(tag))
            }
            e => e.into(),
        })?;
        debug!("Parsing {} compile info for {}", pattern, op_type);
        let handler = Arc::new(TilingHandler::from(CompileInfo::from_value(pattern, value)?));
        self.handlers
            .entry(op_type.to_string())
            .or_default()
            .insert(compile_info.to_string(), Arc::clone(&handler));
        Ok(handler)
    }
}

/// Tiles `op` against `compile_info`, writing the result into `run_info`.
///
/// Returns `false` and leaves `run_info` untouched if tiling fails; the cause is logged.
pub fn do_auto_tiling(
    cache: &mut TilingCache,
    op: &OpDesc,
    compile_info: &str,
    run_info: &mut RunInfo,
) -> bool {
    let result = cache
        .handler(&op.op_type, compile_info)
        .and_then(|h| h.do_tiling(op, run_info));
    report(op, result)
}

/// Like [do_auto_tiling], but tiles `shapes` in place of the shapes carried by `op`.
pub fn do_auto_tiling_with_shapes(
    cache: &mut TilingCache,
    op: &OpDesc,
    shapes: &ShapeOverride,
    compile_info: &str,
    run_info: &mut RunInfo,
) -> bool {
    let result = cache
        .handler(&op.op_type, compile_info)
        .and_then(|h| h.do_tiling_with_shapes(op, shapes, run_info));
    report(op, result)
}

fn report(op: &OpDesc, result: Result<(), TilingError>) -> bool {
    match result {
        Ok(()) => true,
        Err(e) => {
            error!("Tiling {} failed: {}", op, e);
            false
        }
    }
}

fn first_input(inputs: &[Shape]) -> Result<&[DimSize], ShapeError> {
    inputs
        .first()
        .map(|s| s.as_slice())
        .ok_or(ShapeError::MissingOperand("inputs"))
}

fn dtypes(op: &OpDesc) -> Result<(Dtype, Dtype), ShapeError> {
    let in_dtype = op.in_dtype().ok_or(ShapeError::MissingOperand("input dtype"))?;
    Ok((in_dtype, op.out_dtype().unwrap_or(in_dtype)))
}

impl AutoTiling for ElementwiseTiling {
    fn do_tiling(&self, op: &OpDesc, run_info: &mut RunInfo) -> Result<(), TilingError> {
        self.tile(&op.input_shapes(), &op.output_shapes(), run_info)
    }

    fn do_tiling_with_shapes(
        &self,
        op: &OpDesc,
        shapes: &ShapeOverride,
        run_info: &mut RunInfo,
    ) -> Result<(), TilingError> {
        self.tile(&shapes.input_shapes, &op.output_shapes(), run_info)
    }
}

impl AutoTiling for ReduceTiling {
    fn do_tiling(&self, op: &OpDesc, run_info: &mut RunInfo) -> Result<(), TilingError> {
        let (in_dtype, out_dtype) = dtypes(op)?;
        let inputs = op.input_shapes();
        self.tile(
            first_input(&inputs)?,
            &self.info().axes,
            in_dtype,
            out_dtype,
            run_info,
        )
    }

    fn do_tiling_with_shapes(
        &self,
        op: &OpDesc,
        shapes: &ShapeOverride,
        run_info: &mut RunInfo,
    ) -> Result<(), TilingError> {
        let (in_dtype, out_dtype) = dtypes(op)?;
        let axes = shapes.reduce_axes.as_deref().unwrap_or(&self.info().axes);
        self.tile(
            first_input(&shapes.input_shapes)?,
            axes,
            in_dtype,
            out_dtype,
            run_info,
        )
    }
}

impl AutoTiling for NormTiling {
    fn do_tiling(&self, op: &OpDesc, run_info: &mut RunInfo) -> Result<(), TilingError> {
        let (in_dtype, out_dtype) = dtypes(op)?;
        let inputs = op.input_shapes();
        self.tile(
            first_input(&inputs)?,
            &self.info().reduce_axes,
            in_dtype,
            out_dtype,
            run_info,
        )
    }

    fn do_tiling_with_shapes(
        &self,
        op: &OpDesc,
        shapes: &ShapeOverride,
        run_info: &mut RunInfo,
    ) -> Result<(), TilingError> {
        let (in_dtype, out_dtype) = dtypes(op)?;
        let axes = shapes
            .reduce_axes
            .as_deref()
            .unwrap_or(&self.info().reduce_axes);
        self.tile(
            first_input(&shapes.input_shapes)?,
            axes,
            in_dtype,
            out_dtype,
            run_info,
        )
    }
}

impl AutoTiling for TransposeTiling {
    fn do_tiling(&self, op: &OpDesc, run_info: &mut RunInfo) -> Result<(), TilingError> {
        let (dtype, _) = dtypes(op)?;
        let inputs = op.input_shapes();
        self.tile(first_input(&inputs)?, dtype, run_info)
    }

    fn do_tiling_with_shapes(
        &self,
        _op: &OpDesc,
        _shapes: &ShapeOverride,
        _run_info: &mut RunInfo,
    ) -> Result<(), TilingError> {
        Err(UnsupportedCase::ShapeOverride(Pattern::Transpose).into())
    }
}
