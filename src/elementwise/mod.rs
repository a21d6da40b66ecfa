mod fusion;

pub use fusion::{fuse, BroadcastPattern, FusedShape};

use log::debug;
use smallvec::smallvec;

use crate::common::{elements_per_block, DimSize, Shape};
use crate::compile_info::{BaseInfo, ElementwiseInfo};
use crate::serialize::{FieldValue, RunInfo, TilingDataWriter, VarId};
use crate::shapes::{ShapeAdapter, ShapeError};
use crate::tiling::{to_block_dims, to_i32, LookupError, TilingDecision, TilingError, UbSplit};
use crate::utils::{align_down, align_up, ceil_div, checked_product};
use fusion::inner_size;

/// Tiling key reported for operators that produce no elements.
pub const EMPTY_TENSOR_KEY: i64 = i32::MIN as i64;

const CONST_SHAPE_KEY_BASE: i64 = 100_000_000;
const PATTERN_KEY_BASE: i64 = 200_000_000;
const PATTERN_CODE_STRIDE: i64 = 100_000;
const DOUBLE_BUFFER_KEY: i64 = 10_000;

/// Fused broadcast axes are encoded as single decimal digits of the tiling key.
pub const MAX_BROADCAST_RANK: usize = 8;

/// Largest UB factor a single vector instruction sequence accepts, per dtype width.
pub fn max_split_factor(dtype_bytes: u8) -> Option<i64> {
    match dtype_bytes {
        1 | 2 => Some(32767),
        4 => Some(16383),
        8 => Some(8191),
        _ => None,
    }
}

#[derive(Debug, Clone)]
pub struct ElementwiseTiling {
    info: ElementwiseInfo,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElementwiseOutcome {
    Empty,
    ConstShape {
        key: i64,
        block_dims: u32,
    },
    Tiled {
        decision: TilingDecision,
        pattern: BroadcastPattern,
        /// Input dims in the fused shape the decision's axes index into.
        fused_inputs: Vec<Shape>,
    },
}

impl ElementwiseTiling {
    pub fn new(info: ElementwiseInfo) -> Self {
        ElementwiseTiling { info }
    }

    pub fn info(&self) -> &ElementwiseInfo {
        &self.info
    }

    /// Computes a tiling for `inputs`, broadcasting them to a common shape.
    pub fn compute(
        &self,
        inputs: &[Shape],
        outputs: &[Shape],
    ) -> Result<ElementwiseOutcome, TilingError> {
        let adapter = ShapeAdapter::new(inputs, outputs)?;
        if adapter.output().contains(&0) || outputs.iter().any(|s| s.contains(&0)) {
            debug!("Output is empty; skipping tiling");
            return Ok(ElementwiseOutcome::Empty);
        }

        if self.info.is_const_shapes {
            return self.lookup_const_shape(&adapter);
        }

        if adapter.is_pure_elementwise() {
            let total = adapter.output_total()?;
            let decision = self.tile_pure(total)?;
            return Ok(ElementwiseOutcome::Tiled {
                decision,
                pattern: BroadcastPattern::Common,
                fused_inputs: vec![smallvec![total]; inputs.len()],
            });
        }

        let fused = fuse(&adapter)?;
        if fused.rank() > MAX_BROADCAST_RANK {
            return Err(ShapeError::RankTooLarge {
                rank: fused.rank(),
                max: MAX_BROADCAST_RANK,
            }
            .into());
        }
        let pattern = self.resolve_pattern(&fused);
        let decision = self.tile_broadcast(&fused, pattern)?;
        debug!("Broadcast {} as {:?}: {}", fused, pattern, decision);
        Ok(ElementwiseOutcome::Tiled {
            decision,
            pattern,
            fused_inputs: fused.inputs,
        })
    }

    fn lookup_const_shape(&self, adapter: &ShapeAdapter) -> Result<ElementwiseOutcome, TilingError> {
        let idx = self
            .info
            .const_shapes
            .iter()
            .position(|case| case.as_slice() == adapter.inputs())
            .ok_or_else(|| LookupError::ConstShapeNotFound(format!("{:?}", adapter.inputs())))?;
        Ok(ElementwiseOutcome::ConstShape {
            key: CONST_SHAPE_KEY_BASE + idx as i64,
            block_dims: self.info.const_block_dims[idx],
        })
    }

    /// Selects the pattern code; special codes need a matching base-info entry.
    fn resolve_pattern(&self, fused: &FusedShape) -> BroadcastPattern {
        if self.info.is_unknown_rank {
            return BroadcastPattern::UnknownUnknown;
        }
        let pattern = fused.classify();
        if self.info.use_special_pattern && self.info.base_info.contains_key(&pattern.code()) {
            pattern
        } else {
            BroadcastPattern::Original
        }
    }

    fn base_info(&self, code: u32) -> Result<&BaseInfo, TilingError> {
        Ok(self
            .info
            .base_info_for(code)
            .ok_or(LookupError::BaseInfoNotFound(code))?)
    }

    /// Tiles a shape whose inputs are identical, fused into one dimension of `total` elements.
    pub fn tile_pure(&self, total: DimSize) -> Result<TilingDecision, TilingError> {
        to_i32(total)?;
        let base = self.base_info(BroadcastPattern::Common.code())?;
        let split_factor = max_split_factor(base.max_dtype_bytes)
            .ok_or(TilingError::UnsupportedDtype(base.max_dtype_bytes))?;
        let epb = elements_per_block(base.max_dtype_bytes);
        let core_num = i64::from(base.core_num);

        let need_multi_core = total >= core_num * epb * 2;
        let (block_factor, block_dims) = if need_multi_core {
            let factor = align_up(ceil_div(total, core_num), epb);
            (factor, ceil_div(total, factor))
        } else {
            (total, 1)
        };

        let (need_double_buffer, limit) = ub_limit(base, block_factor, split_factor);
        let ub_factor = if block_factor <= limit {
            block_factor
        } else {
            let up = align_up(limit, epb);
            if up <= limit {
                up
            } else {
                align_down(limit, epb)
            }
        };

        Ok(TilingDecision {
            block_axis: 0,
            block_factor,
            block_dims: to_block_dims(block_dims)?,
            ub: UbSplit::Single {
                axis: 0,
                factor: ub_factor,
            },
            tiling_key: pattern_key(BroadcastPattern::Common, need_double_buffer, 0, 0),
            need_multi_core,
            need_double_buffer,
        })
    }

    fn tile_broadcast(
        &self,
        fused: &FusedShape,
        pattern: BroadcastPattern,
    ) -> Result<TilingDecision, TilingError> {
        let output = &fused.output;
        let total = checked_product(output.iter()).ok_or(TilingError::ShapeTooLarge(i64::MAX))?;
        to_i32(total)?;
        let base = self.base_info(pattern.code())?;
        let split_factor = max_split_factor(base.max_dtype_bytes)
            .ok_or(TilingError::UnsupportedDtype(base.max_dtype_bytes))?;
        let epb = elements_per_block(base.max_dtype_bytes);
        let core_num = i64::from(base.core_num);
        let need_multi_core = total >= core_num * epb * 2;

        let (block_axis, block_factor, block_dims) = if need_multi_core {
            block_tiling(output, core_num, epb)
        } else {
            (0, output[0], 1)
        };

        let block_elems = block_factor * inner_size(output, block_axis);
        let (need_double_buffer, limit) = ub_limit(base, block_elems, split_factor);
        let last_broadcast = fused.last_axis_broadcast();

        let mut ub_axis = block_axis;
        let mut ub_factor = block_factor;
        for axis in (block_axis..output.len()).rev() {
            let dim = if axis == block_axis {
                block_factor
            } else {
                output[axis]
            };
            if ub_footprint(output, axis, dim, last_broadcast, epb) <= limit {
                continue;
            }
            ub_axis = axis;
            ub_factor = if axis == output.len() - 1 {
                align_down(limit, epb)
            } else if last_broadcast {
                limit / ub_footprint(output, axis, 1, true, epb)
            } else {
                limit / epb * epb / inner_size(output, axis)
            }
            .clamp(1, dim);
            break;
        }

        Ok(TilingDecision {
            block_axis,
            block_factor,
            block_dims: to_block_dims(block_dims)?,
            ub: UbSplit::Single {
                axis: ub_axis,
                factor: ub_factor,
            },
            tiling_key: pattern_key(pattern, need_double_buffer, block_axis, ub_axis),
            need_multi_core,
            need_double_buffer,
        })
    }

    /// Serializes `outcome` into `run_info`.
    pub fn write(
        &self,
        outcome: &ElementwiseOutcome,
        run_info: &mut RunInfo,
    ) -> Result<(), TilingError> {
        match outcome {
            ElementwiseOutcome::Empty => {
                TilingDataWriter::expecting(0).commit(1, EMPTY_TENSOR_KEY, run_info)
            }
            ElementwiseOutcome::ConstShape { key, block_dims } => {
                TilingDataWriter::expecting(0).commit(*block_dims, *key, run_info)
            }
            ElementwiseOutcome::Tiled { decision, .. } if self.info.only_const_tiling => {
                let mut writer = TilingDataWriter::expecting(4);
                writer.push_flag("need_multi_core", decision.need_multi_core);
                writer.push_flag("need_double_buffer", decision.need_double_buffer);
                writer.push_i64(VarId::BlockFactor.to_string(), decision.block_factor)?;
                writer.push_i64(VarId::UbFactor(0).to_string(), decision.ub_factor())?;
                writer.commit(decision.block_dims, decision.tiling_key, run_info)
            }
            ElementwiseOutcome::Tiled {
                decision,
                fused_inputs,
                ..
            } => {
                let vars = self
                    .info
                    .elewise_vars
                    .get(&decision.tiling_key)
                    .ok_or(LookupError::VarsNotFound(decision.tiling_key))?;
                let mut writer = TilingDataWriter::expecting(vars.len());
                writer.write_vars(vars, |var| {
                    let value = match var {
                        VarId::Dim { input, axis } => fused_inputs
                            .get(usize::from(input))
                            .and_then(|s| s.get(usize::from(axis)))
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
        }
    }

    /// Tiles and serializes in one step.
    pub fn tile(
        &self,
        inputs: &[Shape],
        outputs: &[Shape],
        run_info: &mut RunInfo,
    ) -> Result<(), TilingError> {
        let outcome = self.compute(inputs, outputs)?;
        self.write(&outcome, run_info)
    }
}

/// Returns whether double buffering is needed for a block of `block_elems` elements and the
/// resulting UB element limit.
fn ub_limit(base: &BaseInfo, block_elems: DimSize, split_factor: i64) -> (bool, i64) {
    let need_double_buffer = block_elems > base.max_available_ub;
    let available = if need_double_buffer {
        base.max_available_ub_db
    } else {
        base.max_available_ub
    };
    (need_double_buffer, available.min(split_factor))
}

/// Picks the outermost fused axis that exhausts the core budget.
///
/// Returns `(block_axis, block_factor, block_dims)`. Each core's output run covers at
/// least one aligned block unless the axis is too small to allow it.
fn block_tiling(output: &[DimSize], core_num: i64, epb: i64) -> (usize, DimSize, i64) {
    let mut remaining = core_num;
    let mut outer = 1;
    for (axis, &dim) in output.iter().enumerate() {
        if dim > remaining || axis == output.len() - 1 {
            let inner = inner_size(output, axis);
            let mut factor = ceil_div(dim, remaining);
            if factor * inner < epb {
                factor = ceil_div(epb, inner).min(dim);
            }
            return (axis, factor, outer * ceil_div(dim, factor));
        }
        remaining /= dim;
        outer *= dim;
    }
    unreachable!("output has at least one axis")
}

/// Elements of UB a tile occupies when it spans `factor` units of `axis` plus every axis
/// inside it.
///
/// A broadcast last axis is padded to a block per row; a common one is packed.
fn ub_footprint(
    output: &[DimSize],
    axis: usize,
    factor: DimSize,
    last_broadcast: bool,
    epb: i64,
) -> DimSize {
    let last = output.len() - 1;
    if axis == last {
        return align_up(factor, epb);
    }
    let rows = factor * output[axis + 1..last].iter().product::<DimSize>();
    if last_broadcast {
        rows * align_up(output[last], epb)
    } else {
        align_up(rows * output[last], epb)
    }
}

pub fn pattern_key(
    pattern: BroadcastPattern,
    need_double_buffer: bool,
    block_axis: usize,
    ub_axis: usize,
) -> i64 {
    PATTERN_KEY_BASE
        + i64::from(pattern.code()) * PATTERN_CODE_STRIDE
        + if need_double_buffer { DOUBLE_BUFFER_KEY } else { 0 }
        + block_axis as i64 * 10
        + ub_axis as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile_info::CompileInfo;
    use crate::shape;
    use proptest::prelude::*;

    fn handler(json: &str) -> ElementwiseTiling {
        match CompileInfo::from_json_str(json).unwrap() {
            CompileInfo::ElemWise(info) | CompileInfo::Broadcast(info) => ElementwiseTiling::new(info),
            _ => panic!("expected elementwise compile info"),
        }
    }

    fn fp16_handler() -> ElementwiseTiling {
        handler(
            r#"{
            "_pattern": "ElemWise",
            "base_info": {"100": [32, 2, 43680, 21840], "000": [32, 2, 43680, 21840]},
            "elewise_vars": {
                "210000000": [10000, 20000, 30000],
                "210010000": [10000, 20000, 30000],
                "200000000": [10000, 10001, 10100, 10101, 20000, 30000]
            }
        }"#,
        )
    }

    fn tiled(outcome: ElementwiseOutcome) -> TilingDecision {
        match outcome {
            ElementwiseOutcome::Tiled { decision, .. } => decision,
            other => panic!("expected a tiled outcome, got {other:?}"),
        }
    }

    #[test]
    fn test_pure_elementwise_multi_core() {
        let h = fp16_handler();
        let mut run_info = RunInfo::default();
        h.tile(&[shape![1024, 1024], shape![1024, 1024]], &[], &mut run_info)
            .unwrap();
        assert_eq!(run_info.tiling_key, 210000000);
        assert_eq!(run_info.block_dim, 32);
        assert_eq!(run_info.data_as_i32(), vec![1048576, 32768, 32752]);
    }

    #[test]
    fn test_pure_elementwise_small_is_single_core() {
        let d = fp16_handler().tile_pure(100).unwrap();
        assert!(!d.need_multi_core);
        assert_eq!((d.block_factor, d.block_dims, d.ub_factor()), (100, 1, 100));
    }

    #[test]
    fn test_pure_elementwise_double_buffer() {
        let d = fp16_handler().tile_pure(3_000_000).unwrap();
        assert!(d.need_double_buffer);
        assert_eq!(d.block_factor, 93760);
        assert_eq!(d.block_dims, 32);
        assert_eq!(d.ub_factor(), 21840);
        assert_eq!(d.tiling_key, 210010000);
    }

    #[test]
    fn test_pure_elementwise_too_large() {
        assert_eq!(
            fp16_handler().tile_pure(1 << 32),
            Err(TilingError::ShapeTooLarge(1 << 32))
        );
    }

    #[test]
    fn test_unsupported_dtype_width() {
        let h = handler(r#"{"_pattern": "ElemWise", "base_info": {"100": [32, 3, 4096, 2048]}}"#);
        assert_eq!(h.tile_pure(4096), Err(TilingError::UnsupportedDtype(3)));
    }

    #[test]
    fn test_empty_output() {
        let mut run_info = RunInfo::default();
        fp16_handler()
            .tile(&[shape![0, 16], shape![1, 16]], &[shape![0, 16]], &mut run_info)
            .unwrap();
        assert_eq!(run_info.tiling_key, EMPTY_TENSOR_KEY);
        assert_eq!(run_info.block_dim, 1);
        assert!(run_info.tiling_data.is_empty());
    }

    #[test]
    fn test_broadcast_last_axis_pads_rows() {
        let h = fp16_handler();
        let mut run_info = RunInfo::default();
        h.tile(&[shape![4, 3000, 100], shape![4, 3000, 1]], &[], &mut run_info)
            .unwrap();
        assert_eq!(run_info.tiling_key, 200000000);
        assert_eq!(run_info.block_dim, 32);
        // 32767 / align_up(100, 16) rows fit.
        assert_eq!(run_info.data_as_i32(), vec![12000, 100, 12000, 1, 375, 292]);
    }

    #[test]
    fn test_broadcast_fused_extent_overflow() {
        let mut run_info = RunInfo::default();
        assert_eq!(
            fp16_handler().tile(
                &[shape![2, 1i64 << 32, 1i64 << 32], shape![1, 1i64 << 32, 1i64 << 32]],
                &[],
                &mut run_info
            ),
            Err(TilingError::ShapeTooLarge(i64::MAX))
        );
        assert_eq!(run_info, RunInfo::default());
    }

    #[test]
    fn test_broadcast_rank_is_bounded_by_key_digits() {
        // Alternating broadcast axes cannot be fused, leaving ten distinct axes.
        let a = (0..10).map(|i| if i % 2 == 0 { 2 } else { 1 }).collect::<Shape>();
        let b = (0..10).map(|i| if i % 2 == 0 { 1 } else { 2 }).collect::<Shape>();
        assert_eq!(
            fp16_handler().compute(&[a.clone(), b], &[]),
            Err(ShapeError::RankTooLarge { rank: 10, max: 8 }.into())
        );
        // The same rank with identical inputs fuses to one axis and tiles.
        assert!(fp16_handler().compute(&[a.clone(), a], &[]).is_ok());
    }

    #[test]
    fn test_broadcast_common_tail_fits_whole_block() {
        let d = tiled(
            fp16_handler()
                .compute(&[shape![64, 1024], shape![1024]], &[])
                .unwrap(),
        );
        assert_eq!((d.block_axis, d.block_factor, d.block_dims), (0, 2, 32));
        assert_eq!(d.ub, UbSplit::Single { axis: 0, factor: 2 });
        assert_eq!(d.tiling_key, 200000000);
    }

    #[test]
    fn test_special_pattern_needs_base_info() {
        let h = handler(
            r#"{
            "_pattern": "Broadcast",
            "use_special_pattern": true,
            "base_info": {"000": [32, 2, 43680, 21840], "210": [32, 2, 43680, 21840]}
        }"#,
        );
        let outcome = h.compute(&[shape![64, 1024], shape![1024]], &[]).unwrap();
        let ElementwiseOutcome::Tiled { pattern, decision, .. } = outcome else {
            panic!("expected a tiled outcome");
        };
        assert_eq!(pattern, BroadcastPattern::BroadcastCommon);
        assert_eq!(decision.tiling_key, 221000000);

        // No "120" entry, so the common-broadcast shape falls back to the original code.
        let outcome = h.compute(&[shape![64, 1024], shape![64, 1]], &[]).unwrap();
        let ElementwiseOutcome::Tiled { pattern, .. } = outcome else {
            panic!("expected a tiled outcome");
        };
        assert_eq!(pattern, BroadcastPattern::Original);
    }

    #[test]
    fn test_const_shape_lookup() {
        let h = handler(
            r#"{
            "_pattern": "ElemWise",
            "is_const_shapes": true,
            "const_shapes": [[[2, 16], [2, 16]], [[4, 16], [1, 16]]],
            "const_block_dims": [2, 4]
        }"#,
        );
        let mut run_info = RunInfo::default();
        h.tile(&[shape![4, 16], shape![16]], &[], &mut run_info).unwrap();
        assert_eq!((run_info.tiling_key, run_info.block_dim), (100000001, 4));
        assert!(matches!(
            h.compute(&[shape![8, 16], shape![16]], &[]),
            Err(TilingError::Lookup(LookupError::ConstShapeNotFound(_)))
        ));
    }

    #[test]
    fn test_missing_var_list() {
        let h = handler(r#"{"_pattern": "ElemWise", "base_info": {"100": [32, 4, 21840, 10920]}}"#);
        let mut run_info = RunInfo::default();
        assert_eq!(
            h.tile(&[shape![64]], &[], &mut run_info),
            Err(TilingError::Lookup(LookupError::VarsNotFound(210000000)))
        );
        assert_eq!(run_info, RunInfo::default());
    }

    #[test]
    fn test_const_tiling_writes_flags() {
        let h = handler(
            r#"{"_pattern": "ElemWise", "only_const_tiling": true,
                "base_info": {"100": [32, 4, 21840, 10920]}}"#,
        );
        let mut run_info = RunInfo::default();
        h.tile(&[shape![8192]], &[], &mut run_info).unwrap();
        assert_eq!(run_info.data_as_i32(), vec![1, 0, 256, 256]);
        assert_eq!(run_info.block_dim, 32);
    }

    proptest! {
        #[test]
        fn test_pure_tiling_covers_output(total in 1i64..50_000_000) {
            let d = fp16_handler().tile_pure(total).unwrap();
            prop_assert!(d.block_factor > 0);
            prop_assert!(i64::from(d.block_dims) * d.block_factor >= total);
            prop_assert!(d.block_dims <= 32);
            prop_assert!(d.ub_factor() > 0);
            prop_assert!(d.ub_factor() <= d.block_factor);
            prop_assert!(d.ub_factor() <= 43680);
        }

        #[test]
        fn test_broadcast_tiling_fits_ub(
            rows in 1i64..5000,
            cols in 1i64..5000,
            broadcast_last in any::<bool>(),
        ) {
            let other = if broadcast_last { shape![rows, 1] } else { shape![1, cols] };
            let inputs = [shape![rows, cols], other];
            let h = fp16_handler();
            let outcome = h.compute(&inputs, &[]).unwrap();
            let first = h.compute(&inputs, &[]).unwrap();
            prop_assert_eq!(&outcome, &first);
            if let ElementwiseOutcome::Tiled { decision: d, .. } = outcome {
                prop_assert!(d.block_dims >= 1 && d.block_dims <= 32);
                prop_assert!(d.block_factor > 0);
                prop_assert!(d.ub_factor() > 0);
                if d.ub_axis() == d.block_axis {
                    prop_assert!(d.ub_factor() <= d.block_factor);
                }
            }
        }
    }
}
