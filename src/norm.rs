//! Norm tiling: reduce-then-broadcast operators such as layer norm and softmax.
//!
//! The reduced rows are reused by the broadcast back into the output, so every reduce axis
//! has to stay resident in UB. Blocking follows normal reduce tiling.

use log::debug;

use crate::common::{DimSize, Dtype, Shape, UNKNOWN_DIM};
use crate::compile_info::{KeyEntry, NormInfo};
use crate::elementwise::EMPTY_TENSOR_KEY;
use crate::reduce::{block_split, split_decision, suffix_footprint, ub_suffix_split, ReduceShape};
use crate::serialize::{FieldValue, RunInfo, TilingDataWriter, VarId};
use crate::shapes::{normalize_axes, ShapeError};
use crate::tiling::{to_i32, LookupError, TilingDecision, TilingError};
use crate::utils::join_into_string;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NormOutcome {
    Empty,
    Tiled {
        decision: TilingDecision,
        shape: ReduceShape,
        vars: Vec<VarId>,
        ub_elements: DimSize,
    },
}

#[derive(Debug, Clone)]
pub struct NormTiling {
    info: NormInfo,
}

impl NormTiling {
    pub fn new(info: NormInfo) -> Self {
        NormTiling { info }
    }

    pub fn info(&self) -> &NormInfo {
        &self.info
    }

    pub fn compute(
        &self,
        input: &[DimSize],
        axes: &[i64],
        in_dtype: Dtype,
        out_dtype: Dtype,
    ) -> Result<NormOutcome, TilingError> {
        if input.iter().any(|&d| d == UNKNOWN_DIM || d < 0) {
            return Err(ShapeError::UnknownDim(join_into_string(input, ", ")).into());
        }
        let axes = normalize_axes(axes, input.len())?;
        if input.contains(&0) {
            debug!("Norm input is empty; skipping tiling");
            return Ok(NormOutcome::Empty);
        }
        let shape = ReduceShape::new(input, &axes)
            .ok_or_else(|| ShapeError::Overflow(join_into_string(input, ", ")))?;

        let core_num = i64::from(self.info.core_num);
        let epb = in_dtype
            .elements_per_block()
            .max(out_dtype.elements_per_block());
        let max_ub = self.info.max_ub_count;

        let (block_axis, block_factor, block_dims) =
            block_split(&shape, shape.kept_axes(), core_num, epb, true)
                .unwrap_or((0, shape.fused[0], 1));
        let (start, window) = norm_window(&shape, block_axis, block_factor);
        let exhausted = || {
            TilingError::ResourceExhausted(format!(
                "norm {} keeping every reduce axis within {} elements",
                shape, max_ub
            ))
        };
        let (pos, factor) = ub_suffix_split(&window, max_ub, epb).ok_or_else(exhausted)?;
        let ub_axis = start + pos;
        if !keeps_reduce_axes(&shape, ub_axis, factor, block_axis, block_factor) {
            return Err(exhausted());
        }

        let mut decision = split_decision(block_axis, block_factor, block_dims, ub_axis, factor)
            .ok_or(TilingError::ShapeTooLarge(block_dims))?;
        let entry = find_key(&self.info.tiling_keys, &decision)?;
        decision.tiling_key = entry.key;
        debug!("Norm {}: {}", shape, decision);
        Ok(NormOutcome::Tiled {
            decision,
            ub_elements: suffix_footprint(&window, pos, factor, epb),
            vars: entry.vars.clone(),
            shape,
        })
    }

    pub fn write(&self, outcome: &NormOutcome, run_info: &mut RunInfo) -> Result<(), TilingError> {
        let NormOutcome::Tiled {
            decision,
            shape,
            vars,
            ..
        } = outcome
        else {
            return TilingDataWriter::expecting(0).commit(1, EMPTY_TENSOR_KEY, run_info);
        };
        let mut writer = TilingDataWriter::expecting(vars.len());
        writer.write_vars(vars, |var| {
            let value = match var {
                VarId::Dim { input: 0, axis } => shape
                    .fused
                    .get(usize::from(axis))
                    .copied()
                    .ok_or_else(|| LookupError::UnresolvableVar(var.to_string()))?,
                VarId::BlockFactor => decision.block_factor,
                VarId::UbFactor(0) => decision.ub_factor(),
                _ => return Err(LookupError::UnresolvableVar(var.to_string()).into()),
            };
            Ok(FieldValue::I32(to_i32(value)?))
        })?;
        writer.commit(decision.block_dims, decision.tiling_key, run_info)
    }

    pub fn tile(
        &self,
        input: &[DimSize],
        axes: &[i64],
        in_dtype: Dtype,
        out_dtype: Dtype,
        run_info: &mut RunInfo,
    ) -> Result<(), TilingError> {
        let outcome = self.compute(input, axes, in_dtype, out_dtype)?;
        self.write(&outcome, run_info)
    }
}

/// The fused dims from the outermost of the block axis and the first reduce axis inward, with
/// the block axis clipped to its factor. Norm keeps the natural axis order.
fn norm_window(shape: &ReduceShape, block_axis: usize, block_factor: DimSize) -> (usize, Shape) {
    let first_reduce = shape.reduce_axes().next().unwrap_or(block_axis);
    let start = block_axis.min(first_reduce);
    let dims = (start..shape.rank())
        .map(|a| {
            if a == block_axis {
                block_factor
            } else {
                shape.fused[a]
            }
        })
        .collect();
    (start, dims)
}

/// Whether a UB tile cut at `ub_axis` by `factor` holds every reduce axis whole.
fn keeps_reduce_axes(
    shape: &ReduceShape,
    ub_axis: usize,
    factor: DimSize,
    block_axis: usize,
    block_factor: DimSize,
) -> bool {
    shape.reduce_axes().all(|a| {
        let full = if a == block_axis {
            block_factor
        } else {
            shape.fused[a]
        };
        a > ub_axis || (a == ub_axis && factor == full)
    })
}

fn find_key<'a>(table: &'a [KeyEntry], decision: &TilingDecision) -> Result<&'a KeyEntry, LookupError> {
    table
        .iter()
        .find(|e| e.block_axis == decision.block_axis && e.ub_axis == decision.ub_axis())
        .ok_or_else(|| LookupError::TilingKeyNotFound {
            table: "norm keys".to_string(),
            block_axis: decision.block_axis,
            ub_axis: decision.ub_axis(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile_info::CompileInfo;
    use crate::tiling::UbSplit;
    use proptest::prelude::*;

    const NORM_INFO: &str = r#"{
        "_pattern": "Norm",
        "core_num": 32,
        "max_ub_count": 16384,
        "reduce_axes": [-1],
        "tiling_keys": [
            {"block_axis": 0, "ub_axis": 0, "key": 500, "vars": [10000, 10001, 20000, 30000]},
            {"block_axis": 0, "ub_axis": 1, "key": 501, "vars": [10000, 10001, 20000, 30000]},
            {"block_axis": 1, "ub_axis": 0, "key": 510, "vars": [10000, 10001, 20000, 30000]}
        ]
    }"#;

    fn handler() -> NormTiling {
        match CompileInfo::from_json_str(NORM_INFO).unwrap() {
            CompileInfo::Norm(info) => NormTiling::new(info),
            _ => panic!("expected norm compile info"),
        }
    }

    #[test]
    fn test_layer_norm_rows() {
        let mut run_info = RunInfo::default();
        handler()
            .tile(&[1024, 4096], &[-1], Dtype::Float16, Dtype::Float16, &mut run_info)
            .unwrap();
        assert_eq!(run_info.tiling_key, 500);
        assert_eq!(run_info.block_dim, 32);
        assert_eq!(run_info.data_as_i32(), vec![1024, 4096, 32, 4]);
    }

    #[test]
    fn test_row_that_does_not_fit_is_exhausted() {
        assert!(matches!(
            handler().compute(&[64, 40000], &[-1], Dtype::Float16, Dtype::Float16),
            Err(TilingError::ResourceExhausted(_))
        ));
    }

    #[test]
    fn test_leading_reduce_axis_stays_resident() {
        // "RA": softmax over axis 0, blocked on the kept axis.
        let outcome = handler()
            .compute(&[16, 4096], &[0], Dtype::Float32, Dtype::Float32)
            .unwrap();
        let NormOutcome::Tiled { decision, ub_elements, .. } = outcome else {
            panic!("expected a tiled outcome");
        };
        assert_eq!((decision.block_axis, decision.block_factor), (1, 128));
        // The whole reduce axis and the core's slice of columns fit together.
        assert_eq!(decision.ub, UbSplit::Single { axis: 0, factor: 16 });
        assert_eq!(decision.tiling_key, 510);
        assert_eq!(ub_elements, 16 * 128);
    }

    #[test]
    fn test_missing_key() {
        let mut h = handler();
        h.info.tiling_keys.retain(|e| e.ub_axis != 0);
        assert_eq!(
            h.compute(&[1024, 4096], &[-1], Dtype::Float16, Dtype::Float16),
            Err(TilingError::Lookup(LookupError::TilingKeyNotFound {
                table: "norm keys".to_string(),
                block_axis: 0,
                ub_axis: 0
            }))
        );
    }

    proptest! {
        #[test]
        fn test_reduce_axes_always_resident(
            rows in 1i64..4096,
            cols in 1i64..20000,
        ) {
            match handler().compute(&[rows, cols], &[-1], Dtype::Float16, Dtype::Float16) {
                Ok(NormOutcome::Tiled { decision, shape, ub_elements, .. }) => {
                    prop_assert!(ub_elements <= 16384);
                    prop_assert!(decision.block_dims <= 32);
                    if shape.is_last_axis_reduce && shape.rank() == 2 {
                        prop_assert_eq!(decision.ub_axis(), 0);
                    }
                }
                Ok(NormOutcome::Empty) => prop_assert!(false, "inputs are never empty"),
                Err(TilingError::ResourceExhausted(_)) => prop_assert!(cols > 16384),
                Err(TilingError::Lookup(_)) => {}
                Err(e) => prop_assert!(false, "unexpected error {e}"),
            }
        }
    }
}
