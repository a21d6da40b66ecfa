use smallvec::smallvec;

use super::{split_factor, PermutedShape, UbTile};
use crate::common::DimSize;

/// Grows the tile over output order from the last axis, which stays in place and is padded to
/// a block, and cuts the first axis that overflows `budget`.
pub(super) fn ub_tiling(shape: &PermutedShape, budget: DimSize) -> UbTile {
    let mut resident = smallvec![false; shape.rank()];
    let last = shape.in_last();
    let mut acc = shape.extent(last, shape.dims[last]);
    if acc > budget {
        return UbTile::single(last, split_factor(shape, last, budget), resident);
    }
    resident[last] = true;

    for &axis in shape.perm[..shape.rank() - 1].iter().rev() {
        let size = shape.dims[axis];
        if acc * size > budget {
            return UbTile::single(axis, split_factor(shape, axis, budget / acc), resident);
        }
        acc *= size;
        resident[axis] = true;
    }

    let outer = shape.perm[0];
    resident[outer] = false;
    UbTile::single(outer, shape.dims[outer], resident)
}
