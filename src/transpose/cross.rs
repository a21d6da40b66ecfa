//! UB tiling for a last-axis transpose.
//!
//! The tile is modelled as input rows times output rows. The input side claims input axes from
//! the innermost out, the output side claims output axes the same way, and the product of both
//! sides' extents has to stay within the budget.

use log::debug;
use smallvec::{smallvec, SmallVec};

use super::{split_factor, PermutedShape, UbTile};
use crate::common::DimSize;
use crate::utils::isqrt;

pub(super) fn ub_tiling(shape: &PermutedShape, budget: DimSize) -> UbTile {
    let mut tile = ub_tiling_no_cross(shape, budget).unwrap_or_else(|| {
        debug!("Both sides of {} need the same strided axis; balancing the cut", shape);
        ub_tiling_cross(shape, budget)
    });
    adjust_ub_tiling(shape, budget, &mut tile);
    tile
}

/// Gives each side the square root of the budget. Once the input side has to cut an axis the
/// output side gets whatever that leaves.
///
/// Returns `None` when the output side reaches the input side's cut on an axis that is not
/// contiguous in the input.
fn ub_tiling_no_cross(shape: &PermutedShape, budget: DimSize) -> Option<UbTile> {
    let avail = isqrt(budget);
    let mut resident: SmallVec<[bool; 8]> = smallvec![false; shape.rank()];

    let mut in_part = 1;
    let mut low = None;
    for axis in (0..shape.rank()).rev() {
        let full = shape.extent(axis, shape.dims[axis]);
        if in_part * full <= avail {
            in_part *= full;
            resident[axis] = true;
            continue;
        }
        let factor = split_factor(shape, axis, avail / in_part);
        in_part *= shape.extent(axis, factor);
        low = Some((axis, factor));
        break;
    }
    let Some(low) = low else {
        return Some(UbTile::whole(shape));
    };

    let out_avail = budget / in_part;
    let mut out_part = 1;
    for &axis in shape.perm.iter().rev() {
        if resident[axis] {
            continue;
        }
        if axis == low.0 {
            return cross_update_same_axis(shape, low, resident);
        }
        let full = shape.extent(axis, shape.dims[axis]);
        if out_part * full <= out_avail {
            out_part *= full;
            resident[axis] = true;
            continue;
        }
        let factor = split_factor(shape, axis, out_avail / out_part);
        return Some(UbTile {
            low,
            high: (axis, factor),
            resident_axes: resident,
        });
    }
    None
}

/// Both sides stopped on the input side's cut. On the contiguous input axis the cut is already
/// block aligned and serves both sides.
fn cross_update_same_axis(
    shape: &PermutedShape,
    low: (usize, DimSize),
    resident_axes: SmallVec<[bool; 8]>,
) -> Option<UbTile> {
    (low.0 == shape.in_last()).then(|| UbTile {
        low,
        high: low,
        resident_axes,
    })
}

/// Claims whole axes for the two sides in turn while the joint footprint fits, then cuts the
/// axes each side stopped on from what is left of the budget.
fn ub_tiling_cross(shape: &PermutedShape, budget: DimSize) -> UbTile {
    let mut resident: SmallVec<[bool; 8]> = smallvec![false; shape.rank()];
    let mut in_axes = (0..shape.rank()).rev();
    let mut out_axes = shape.perm.iter().copied().rev();
    let (mut in_part, mut out_part) = (1, 1);
    let (mut in_pending, mut out_pending) = (None, None);
    let (mut in_full, mut out_full) = (None, None);

    loop {
        let mut moved = false;
        if in_pending.is_none() {
            if let Some(axis) = in_axes.find(|&a| !resident[a]) {
                moved = true;
                let full = shape.extent(axis, shape.dims[axis]);
                if out_pending != Some(axis) && in_part * full * out_part <= budget {
                    in_part *= full;
                    resident[axis] = true;
                    in_full = Some(axis);
                } else {
                    in_pending = Some(axis);
                }
            }
        }
        if out_pending.is_none() {
            if let Some(axis) = out_axes.find(|&a| !resident[a]) {
                moved = true;
                let full = shape.extent(axis, shape.dims[axis]);
                if in_pending != Some(axis) && in_part * out_part * full <= budget {
                    out_part *= full;
                    resident[axis] = true;
                    out_full = Some(axis);
                } else {
                    out_pending = Some(axis);
                }
            }
        }
        if !moved {
            break;
        }
    }

    let rem = budget / (in_part * out_part);
    let whole = |axis: usize| (axis, shape.dims[axis]);
    match (in_pending, out_pending) {
        (Some(a), Some(b)) if a == b => ub_split_same_axis(shape, a, rem, in_full, resident),
        (Some(a), Some(b)) => {
            let fa = split_factor(shape, a, isqrt(rem));
            let fb = split_factor(shape, b, rem / shape.extent(a, fa));
            let fa = split_factor(shape, a, rem / shape.extent(b, fb));
            UbTile {
                low: (a, fa),
                high: (b, fb),
                resident_axes: resident,
            }
        }
        (Some(a), None) => {
            let cut = (a, split_factor(shape, a, rem));
            UbTile {
                low: cut,
                high: out_full.map_or(cut, whole),
                resident_axes: resident,
            }
        }
        (None, Some(b)) => {
            let cut = (b, split_factor(shape, b, rem));
            UbTile {
                low: in_full.map_or(cut, whole),
                high: cut,
                resident_axes: resident,
            }
        }
        (None, None) => UbTile::whole(shape),
    }
}

/// One axis is cut for both sides. The input side's boundary is its outermost whole axis.
fn ub_split_same_axis(
    shape: &PermutedShape,
    axis: usize,
    rem: DimSize,
    in_full: Option<usize>,
    resident_axes: SmallVec<[bool; 8]>,
) -> UbTile {
    let high = (axis, split_factor(shape, axis, rem));
    UbTile {
        low: in_full.map_or(high, |a| (a, shape.dims[a])),
        high,
        resident_axes,
    }
}

/// A side left with a factor of 1 takes whatever budget the rest of the tile leaves.
fn adjust_ub_tiling(shape: &PermutedShape, budget: DimSize, tile: &mut UbTile) {
    adjust_input_factor(shape, budget, tile);
    adjust_output_factor(shape, budget, tile);
}

fn adjust_input_factor(shape: &PermutedShape, budget: DimSize, tile: &mut UbTile) {
    if let Some(factor) = grown_factor(shape, budget, tile, tile.low) {
        if tile.high.0 == tile.low.0 {
            tile.high.1 = factor;
        }
        tile.low.1 = factor;
    }
}

fn adjust_output_factor(shape: &PermutedShape, budget: DimSize, tile: &mut UbTile) {
    if let Some(factor) = grown_factor(shape, budget, tile, tile.high) {
        if tile.low.0 == tile.high.0 {
            tile.low.1 = factor;
        }
        tile.high.1 = factor;
    }
}

fn grown_factor(
    shape: &PermutedShape,
    budget: DimSize,
    tile: &UbTile,
    (axis, factor): (usize, DimSize),
) -> Option<DimSize> {
    if factor != 1 || shape.dims[axis] == 1 {
        return None;
    }
    let rest = tile.footprint(shape) / shape.extent(axis, 1);
    let grown = split_factor(shape, axis, budget / rest.max(1));
    (grown > 1).then_some(grown)
}
