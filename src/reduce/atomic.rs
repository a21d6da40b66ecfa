use crate::common::DimSize;
use crate::compile_info::ReducePatternInfo;
use crate::tiling::TilingDecision;
use crate::utils::align_up;

use super::{block_split, split_decision, suffix_footprint, ub_suffix_split, ub_window, ReduceShape};

/// Below this many input elements a reduction is too shallow to split across cores.
const SMALL_SHAPE_THRESHOLD: DimSize = 1024;

/// Whether splitting the reduction itself across cores is allowed and worthwhile.
pub(super) fn is_eligible(
    shape: &ReduceShape,
    enabled: bool,
    pattern: &ReducePatternInfo,
    core_num: i64,
    epb: i64,
) -> bool {
    enabled
        && !pattern.atomic_keys.is_empty()
        && shape.reduce_axes().next().is_some()
        && align_up(shape.total_output, epb) <= pattern.max_ub_count
        && shape.total_reduce.saturating_mul(shape.total_output) > SMALL_SHAPE_THRESHOLD
        && shape.total_output < core_num * epb / 2
}

/// Blocks on a reduce axis. Returns `None` if that leaves a single core or nothing fits.
pub(super) fn tile(
    shape: &ReduceShape,
    core_num: i64,
    max_ub: i64,
    epb: i64,
) -> Option<(TilingDecision, DimSize)> {
    let (block_axis, block_factor, block_dims) =
        block_split(shape, shape.reduce_axes(), core_num, epb, false)?;
    if block_dims < 2 {
        return None;
    }
    let (start, window) = ub_window(shape, block_axis, block_factor);
    let (pos, factor) = ub_suffix_split(&window, max_ub, epb)?;
    let decision = split_decision(
        block_axis,
        block_factor,
        block_dims,
        shape.reorder[start + pos],
        factor,
    )?;
    Some((decision, suffix_footprint(&window, pos, factor, epb)))
}
