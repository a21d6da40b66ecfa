use smallvec::SmallVec;

use crate::common::{DimSize, Shape};
use crate::tiling::{TilingDecision, UbSplit};

use super::{suffix_footprint, ub_suffix_split, ReduceShape};

/// Single-core tiling with independent UB splits of the input and output spaces.
///
/// The low UB axis indexes the input, the high one the output; each side is padded to its
/// own dtype's block. A full reduce has a one-element output, split on axis 0.
pub(super) fn tile(
    shape: &ReduceShape,
    max_ub: i64,
    in_epb: i64,
    out_epb: i64,
) -> Option<(TilingDecision, DimSize)> {
    let (in_axis, in_factor) = ub_suffix_split(&shape.fused, max_ub, in_epb)?;
    let kept = shape.kept_axes().collect::<SmallVec<[usize; 8]>>();
    let (out_axis, out_factor) = if kept.is_empty() {
        (0, 1)
    } else {
        let dims = kept.iter().map(|&a| shape.fused[a]).collect::<Shape>();
        let (pos, factor) = ub_suffix_split(&dims, max_ub, out_epb)?;
        (kept[pos], factor)
    };
    let decision = TilingDecision {
        block_axis: 0,
        block_factor: shape.fused[0],
        block_dims: 1,
        ub: UbSplit::Pair {
            low_axis: in_axis,
            low_factor: in_factor,
            high_axis: out_axis,
            high_factor: out_factor,
        },
        tiling_key: 0,
        need_multi_core: false,
        need_double_buffer: false,
    };
    Some((
        decision,
        suffix_footprint(&shape.fused, in_axis, in_factor, in_epb),
    ))
}
