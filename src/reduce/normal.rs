use crate::common::DimSize;
use crate::tiling::TilingDecision;

use super::{block_split, split_decision, suffix_footprint, ub_suffix_split, ub_window, ReduceShape};

/// Blocks on a non-reduce axis and fits the largest suffix of the reordered shape in UB.
///
/// Returns `None` if there is no non-reduce axis, or if a last-axis reduce would need its
/// innermost row split.
pub(super) fn tile(
    shape: &ReduceShape,
    core_num: i64,
    max_ub: i64,
    epb: i64,
) -> Option<(TilingDecision, DimSize)> {
    let (block_axis, block_factor, block_dims) =
        block_split(shape, shape.kept_axes(), core_num, epb, true)?;
    let (start, window) = ub_window(shape, block_axis, block_factor);
    let (pos, factor) = ub_suffix_split(&window, max_ub, epb)?;
    let last = window.len() - 1;
    if shape.is_last_axis_reduce && pos == last && factor < window[last] {
        return None;
    }
    let decision = split_decision(
        block_axis,
        block_factor,
        block_dims,
        shape.reorder[start + pos],
        factor,
    )?;
    Some((decision, suffix_footprint(&window, pos, factor, epb)))
}
