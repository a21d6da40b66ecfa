//! Reduce tiling.
//!
//! Three strategies are tried in order. Atomic tiling splits a reduce axis across cores and
//! relies on an atomic-add epilogue. Normal tiling splits a non-reduce axis. The default
//! strategy runs on a single core with independent input and output UB splits. Every result
//! is resolved to a tiling key through the compile-info table of the strategy that produced
//! it.

mod atomic;
mod fallback;
mod normal;
mod shape;

pub use shape::ReduceShape;

use log::{debug, warn};
use smallvec::SmallVec;

use crate::common::{DimSize, Dtype, Shape, UNKNOWN_DIM};
use crate::compile_info::{KeyEntry, ReduceInfo, ReducePatternInfo};
use crate::elementwise::EMPTY_TENSOR_KEY;
use crate::serialize::{FieldValue, RunInfo, TilingDataWriter, VarId};
use crate::shapes::{normalize_axes, ShapeError};
use crate::tiling::{to_block_dims, to_i32, LookupError, TilingDecision, TilingError, UbSplit};
use crate::utils::{align_down, align_up, ceil_div, join_into_string};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum ReduceStrategy {
    Atomic,
    Normal,
    Default,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReduceOutcome {
    Empty,
    Tiled {
        strategy: ReduceStrategy,
        decision: TilingDecision,
        shape: ReduceShape,
        vars: Vec<VarId>,
        /// Input elements one UB tile occupies, alignment padding included.
        ub_elements: DimSize,
    },
}

#[derive(Debug, Clone)]
pub struct ReduceTiling {
    info: ReduceInfo,
}

impl ReduceTiling {
    pub fn new(info: ReduceInfo) -> Self {
        ReduceTiling { info }
    }

    pub fn info(&self) -> &ReduceInfo {
        &self.info
    }

    /// Tiles a reduction of `input` over `axes`.
    ///
    /// Alignment follows whichever of `in_dtype` and `out_dtype` has more elements per block.
    pub fn compute(
        &self,
        input: &[DimSize],
        axes: &[i64],
        in_dtype: Dtype,
        out_dtype: Dtype,
    ) -> Result<ReduceOutcome, TilingError> {
        if input.iter().any(|&d| d == UNKNOWN_DIM || d < 0) {
            return Err(ShapeError::UnknownDim(join_into_string(input, ", ")).into());
        }
        let axes = normalize_axes(axes, input.len())?;
        if input.contains(&0) {
            debug!("Reduce input is empty; skipping tiling");
            return Ok(ReduceOutcome::Empty);
        }

        let shape = ReduceShape::new(input, &axes)
            .ok_or_else(|| ShapeError::Overflow(join_into_string(input, ", ")))?;
        let pattern = pattern_info(&self.info, &shape.layout)?;

        let core_num = i64::from(self.info.core_num);
        let in_epb = in_dtype.elements_per_block();
        let out_epb = out_dtype.elements_per_block();
        let epb = in_epb.max(out_epb);
        let max_ub = pattern.max_ub_count;

        if atomic::is_eligible(&shape, self.info.atomic, pattern, core_num, epb) {
            if let Some(tiled) = atomic::tile(&shape, core_num, max_ub, epb) {
                return self.resolve(ReduceStrategy::Atomic, &pattern.atomic_keys, shape, tiled);
            }
            debug!("No atomic split for {}; trying normal tiling", shape);
        }

        if let Some(tiled) = normal::tile(&shape, core_num, max_ub, epb) {
            return self.resolve(ReduceStrategy::Normal, &pattern.tiling_keys, shape, tiled);
        }

        warn!("No core-parallel split for {}; using single-core default tiling", shape);
        match fallback::tile(&shape, max_ub, in_epb, out_epb) {
            Some(tiled) => {
                self.resolve(ReduceStrategy::Default, &pattern.default_keys, shape, tiled)
            }
            None => Err(TilingError::ResourceExhausted(format!(
                "reduce {} with max_ub_count {}",
                shape, max_ub
            ))),
        }
    }

    fn resolve(
        &self,
        strategy: ReduceStrategy,
        table: &[KeyEntry],
        shape: ReduceShape,
        (mut decision, ub_elements): (TilingDecision, DimSize),
    ) -> Result<ReduceOutcome, TilingError> {
        let entry = find_key(table, strategy, &decision)?;
        decision.tiling_key = entry.key;
        debug!("{} reduce {}: {}", strategy, shape, decision);
        Ok(ReduceOutcome::Tiled {
            strategy,
            decision,
            shape,
            vars: entry.vars.clone(),
            ub_elements,
        })
    }

    pub fn write(
        &self,
        outcome: &ReduceOutcome,
        run_info: &mut RunInfo,
    ) -> Result<(), TilingError> {
        let ReduceOutcome::Tiled {
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
            let value = match (var, decision.ub) {
                (VarId::Dim { input: 0, axis }, _) => shape
                    .fused
                    .get(usize::from(axis))
                    .copied()
                    .ok_or_else(|| LookupError::UnresolvableVar(var.to_string()))?,
                (VarId::BlockFactor, _) => decision.block_factor,
                (VarId::UbFactor(0), UbSplit::Single { factor, .. }) => factor,
                (VarId::UbFactor(0), UbSplit::Pair { low_factor, .. }) => low_factor,
                (VarId::UbFactor(1), UbSplit::Pair { high_factor, .. }) => high_factor,
                (VarId::ReduceMeanCof, _) => return Ok(self.reduce_mean_cof(shape.total_reduce)),
                _ => return Err(LookupError::UnresolvableVar(var.to_string()).into()),
            };
            Ok(FieldValue::I32(to_i32(value)?))
        })?;
        writer.commit(decision.block_dims, decision.tiling_key, run_info)
    }

    /// `1 / total_reduce`, encoded as the compile info asks.
    pub fn reduce_mean_cof(&self, total_reduce: DimSize) -> FieldValue {
        let cof = 1.0 / total_reduce as f64;
        match self.info.reduce_mean_cof_dtype {
            Some(Dtype::Float16) => FieldValue::F16(half::f16::from_f64(cof)),
            _ => FieldValue::F32(cof as f32),
        }
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

fn find_key<'a>(
    table: &'a [KeyEntry],
    strategy: ReduceStrategy,
    decision: &TilingDecision,
) -> Result<&'a KeyEntry, TilingError> {
    let found = match decision.ub {
        UbSplit::Single { axis, .. } => table
            .iter()
            .find(|e| e.block_axis == decision.block_axis && e.ub_axis == axis),
        UbSplit::Pair {
            low_axis,
            high_axis,
            ..
        } => table.iter().find(|e| {
            e.ub_axis == low_axis && e.out_ub_axis.map_or(true, |a| a == high_axis)
        }),
    };
    found.ok_or_else(|| {
        LookupError::TilingKeyNotFound {
            table: format!("{strategy} keys"),
            block_axis: decision.block_axis,
            ub_axis: decision.ub_axis(),
        }
        .into()
    })
}

/// Splits the outermost of `axes` that exhausts the core budget.
///
/// Returns `(block_axis, block_factor, block_dims)`. With `align_output`, each core's
/// contiguous output run is kept at least one block long where the axis allows it.
pub(crate) fn block_split(
    shape: &ReduceShape,
    axes: impl IntoIterator<Item = usize>,
    core_num: i64,
    epb: i64,
    align_output: bool,
) -> Option<(usize, DimSize, i64)> {
    let axes = axes.into_iter().collect::<SmallVec<[usize; 8]>>();
    let &last = axes.last()?;
    let mut remaining = core_num;
    let mut outer = 1;
    for &axis in &axes {
        let dim = shape.fused[axis];
        if dim >= remaining || axis == last {
            let mut factor = ceil_div(dim, remaining);
            if align_output {
                let inner = shape.output_inner(axis);
                if factor * inner < epb {
                    factor = ceil_div(epb, inner).min(dim);
                }
            }
            return Some((axis, factor, outer * ceil_div(dim, factor)));
        }
        remaining /= dim;
        outer *= dim;
    }
    None
}

/// The reordered dims a core may hold in UB: the suffix of the reordered shape starting at the
/// block axis, with the block axis clipped to its factor. Axes ordered before the block axis
/// are iterated outside UB.
///
/// Returns the reordered position the window starts at and its dims.
pub(crate) fn ub_window(
    shape: &ReduceShape,
    block_axis: usize,
    block_factor: DimSize,
) -> (usize, Shape) {
    let start = shape
        .reorder
        .iter()
        .position(|&a| a == block_axis)
        .unwrap_or(0);
    let dims = shape.reorder[start..]
        .iter()
        .map(|&a| {
            if a == block_axis {
                block_factor
            } else {
                shape.fused[a]
            }
        })
        .collect();
    (start, dims)
}

/// Finds the outermost UB split of `dims` whose footprint fits `limit` elements.
///
/// Axes are taken whole from the innermost out; the innermost is padded to a block. Returns
/// the split position and factor, or `None` if not even one block fits.
pub(crate) fn ub_suffix_split(dims: &[DimSize], limit: i64, epb: i64) -> Option<(usize, DimSize)> {
    let (&last_dim, outer) = dims.split_last()?;
    if limit < epb {
        return None;
    }
    let last = outer.len();
    let mut acc = align_up(last_dim, epb);
    if acc > limit {
        return Some((last, align_down(limit, epb)));
    }
    for (pos, &dim) in outer.iter().enumerate().rev() {
        if acc * dim > limit {
            return Some((pos, (limit / acc).clamp(1, dim)));
        }
        acc *= dim;
    }
    Some((0, dims[0]))
}

/// Elements occupied by a UB tile holding `factor` units at `pos` of `dims` and everything
/// inside it.
pub(crate) fn suffix_footprint(dims: &[DimSize], pos: usize, factor: DimSize, epb: i64) -> DimSize {
    let last = dims.len() - 1;
    if pos == last {
        return align_up(factor, epb);
    }
    factor * dims[pos + 1..last].iter().product::<DimSize>() * align_up(dims[last], epb)
}

/// Builds a single-UB-axis decision; the tiling key is filled in by the key lookup.
pub(crate) fn split_decision(
    block_axis: usize,
    block_factor: DimSize,
    block_dims: i64,
    ub_axis: usize,
    ub_factor: DimSize,
) -> Option<TilingDecision> {
    Some(TilingDecision {
        block_axis,
        block_factor,
        block_dims: to_block_dims(block_dims).ok()?,
        ub: UbSplit::Single {
            axis: ub_axis,
            factor: ub_factor,
        },
        tiling_key: 0,
        need_multi_core: block_dims > 1,
        need_double_buffer: false,
    })
}

pub(crate) fn pattern_info<'a>(
    info: &'a ReduceInfo,
    layout: &str,
) -> Result<&'a ReducePatternInfo, LookupError> {
    info.patterns
        .get(layout)
        .ok_or_else(|| LookupError::PatternNotFound(layout.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile_info::CompileInfo;
    use proptest::prelude::*;

    const REDUCE_INFO: &str = r#"{
        "_pattern": "CommReduce",
        "core_num": 32,
        "atomic": true,
        "reduce_mean_cof_dtype": "float16",
        "patterns": {
            "AR": {
                "max_ub_count": 16384,
                "tiling_keys": [
                    {"block_axis": 0, "ub_axis": 0, "key": 100, "vars": [10000, 10001, 20000, 30000]},
                    {"block_axis": 0, "ub_axis": 1, "key": 101, "vars": [10000, 10001, 20000, 30000]}
                ],
                "atomic_keys": [
                    {"block_axis": 1, "ub_axis": 1, "key": 1011, "vars": [10000, 10001, 20000, 30000, 40000]}
                ],
                "default_keys": [
                    {"block_axis": 0, "ub_axis": 1, "out_ub_axis": 0, "key": 2010, "vars": [10000, 10001, 30000, 30001]}
                ]
            },
            "ARA": {
                "max_ub_count": 8192,
                "tiling_keys": [
                    {"block_axis": 0, "ub_axis": 0, "key": 300, "vars": [10000, 10001, 10002, 20000, 30000]}
                ]
            }
        }
    }"#;

    fn handler(json: &str) -> ReduceTiling {
        match CompileInfo::from_json_str(json).unwrap() {
            CompileInfo::CommReduce(info) => ReduceTiling::new(info),
            _ => panic!("expected reduce compile info"),
        }
    }

    fn without_atomic() -> ReduceTiling {
        let mut h = handler(REDUCE_INFO);
        h.info.atomic = false;
        h
    }

    fn tiled(outcome: ReduceOutcome) -> (ReduceStrategy, TilingDecision) {
        match outcome {
            ReduceOutcome::Tiled {
                strategy, decision, ..
            } => (strategy, decision),
            ReduceOutcome::Empty => panic!("expected a tiled outcome"),
        }
    }

    #[test]
    fn test_normal_last_axis_reduce() {
        let mut run_info = RunInfo::default();
        handler(REDUCE_INFO)
            .tile(&[1024, 4096], &[-1], Dtype::Float16, Dtype::Float16, &mut run_info)
            .unwrap();
        assert_eq!(run_info.tiling_key, 100);
        assert_eq!(run_info.block_dim, 32);
        assert_eq!(run_info.data_as_i32(), vec![1024, 4096, 32, 4]);
    }

    #[test]
    fn test_atomic_for_small_output() {
        let h = handler(REDUCE_INFO);
        let (strategy, d) = tiled(
            h.compute(&[8, 4096], &[1], Dtype::Float16, Dtype::Float16)
                .unwrap(),
        );
        assert_eq!(strategy, ReduceStrategy::Atomic);
        assert_eq!((d.block_axis, d.block_factor, d.block_dims), (1, 128, 32));
        assert_eq!(d.ub, UbSplit::Single { axis: 1, factor: 128 });
        assert_eq!(d.tiling_key, 1011);

        let mut run_info = RunInfo::default();
        h.tile(&[8, 4096], &[1], Dtype::Float16, Dtype::Float16, &mut run_info)
            .unwrap();
        assert_eq!(run_info.tiling_data.len(), 20);
        let cof = half::f16::from_le_bytes([run_info.tiling_data[16], run_info.tiling_data[17]]);
        assert_eq!(cof, half::f16::from_f64(1.0 / 4096.0));
    }

    #[test]
    fn test_default_when_row_does_not_fit() {
        let (strategy, d) = tiled(
            without_atomic()
                .compute(&[2, 100000], &[1], Dtype::Float16, Dtype::Float16)
                .unwrap(),
        );
        assert_eq!(strategy, ReduceStrategy::Default);
        assert_eq!(d.block_dims, 1);
        assert_eq!(
            d.ub,
            UbSplit::Pair {
                low_axis: 1,
                low_factor: 16384,
                high_axis: 0,
                high_factor: 2
            }
        );
        assert_eq!(d.tiling_key, 2010);
    }

    #[test]
    fn test_reduce_middle_axis() {
        let (strategy, d) = tiled(
            handler(REDUCE_INFO)
                .compute(&[64, 128, 256], &[1], Dtype::Float32, Dtype::Float32)
                .unwrap(),
        );
        assert_eq!(strategy, ReduceStrategy::Normal);
        assert_eq!((d.block_axis, d.block_factor, d.block_dims), (0, 2, 32));
        // The reduce axis is ordered before the block axis, so UB holds only the kept axes.
        assert_eq!(d.ub, UbSplit::Single { axis: 0, factor: 2 });
        assert_eq!(d.tiling_key, 300);
    }

    #[test]
    fn test_missing_key_is_an_error() {
        // A 2048-row input blocks on axis 0 and the whole 64-wide row block fits in UB, so the
        // UB split lands on axis 0; drop that entry.
        let mut h = without_atomic();
        h.info
            .patterns
            .get_mut("AR")
            .unwrap()
            .tiling_keys
            .retain(|e| e.ub_axis != 0);
        assert_eq!(
            h.compute(&[2048, 64], &[1], Dtype::Float16, Dtype::Float16),
            Err(TilingError::Lookup(LookupError::TilingKeyNotFound {
                table: "Normal keys".to_string(),
                block_axis: 0,
                ub_axis: 0
            }))
        );
    }

    #[test]
    fn test_unknown_layout_and_bad_axis() {
        let h = handler(REDUCE_INFO);
        assert_eq!(
            h.compute(&[4, 5], &[0], Dtype::Float16, Dtype::Float16),
            Err(TilingError::Lookup(LookupError::PatternNotFound("RA".to_string())))
        );
        assert_eq!(
            h.compute(&[4, 5], &[2], Dtype::Float16, Dtype::Float16),
            Err(TilingError::Shape(ShapeError::AxisOutOfRange { axis: 2, rank: 2 }))
        );
    }

    #[test]
    fn test_nothing_fits() {
        let json = r#"{"_pattern": "CommReduce", "core_num": 32,
                       "patterns": {"AR": {"max_ub_count": 8}}}"#;
        assert!(matches!(
            handler(json).compute(&[2, 100], &[1], Dtype::Float16, Dtype::Float16),
            Err(TilingError::ResourceExhausted(_))
        ));
    }

    #[test]
    fn test_suffix_split() {
        assert_eq!(ub_suffix_split(&[32, 4096], 16384, 16), Some((0, 4)));
        assert_eq!(ub_suffix_split(&[2, 100000], 16384, 16), Some((1, 16384)));
        assert_eq!(ub_suffix_split(&[2, 100], 16384, 16), Some((0, 2)));
        assert_eq!(ub_suffix_split(&[2, 100], 8, 16), None);
    }

    proptest! {
        #[test]
        fn test_ub_tile_fits_max_ub_count(
            dims in prop::collection::vec(1i64..300, 2..4),
            reduce_last in any::<bool>(),
        ) {
            let h = handler(REDUCE_INFO);
            let axes: Vec<i64> = if reduce_last { vec![-1] } else { vec![1] };
            match h.compute(&dims, &axes, Dtype::Float16, Dtype::Float16) {
                Ok(ReduceOutcome::Tiled { ub_elements, shape, decision, .. }) => {
                    let max_ub = pattern_info(h.info(), &shape.layout).unwrap().max_ub_count;
                    prop_assert!(ub_elements <= max_ub);
                    prop_assert!(decision.block_dims <= 32);
                    prop_assert!(decision.block_factor > 0);
                    let again = h.compute(&dims, &axes, Dtype::Float16, Dtype::Float16).unwrap();
                    let ReduceOutcome::Tiled { decision: d2, .. } = again else {
                        panic!("expected a tiled outcome");
                    };
                    prop_assert_eq!(decision, d2);
                }
                Ok(ReduceOutcome::Empty) => prop_assert!(false, "inputs are never empty"),
                // Layouts and keys outside the small table above.
                Err(TilingError::Lookup(_)) => {}
                Err(e) => prop_assert!(false, "unexpected error {e}"),
            }
        }
    }
}
