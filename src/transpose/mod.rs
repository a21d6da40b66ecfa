//! Transpose tiling.
//!
//! The merged input shape is classified once. A pure copy is tiled as a flat buffer. When the
//! last axis stays in place, whole output rows are staged in UB and a single UB axis is cut
//! (see [aligned]). A last-axis transpose stages a 2-D tile whose input-order and output-order
//! extents both have to fit (see [cross]).

mod aligned;
mod cross;

use log::debug;
use smallvec::{smallvec, SmallVec};

use std::fmt::{self, Display};

use crate::common::{DimSize, Dtype, Shape, UNKNOWN_DIM};
use crate::compile_info::TransposeInfo;
use crate::elementwise::EMPTY_TENSOR_KEY;
use crate::serialize::{RunInfo, TilingDataWriter, VarId};
use crate::shapes::ShapeError;
use crate::tiling::{to_block_dims, TilingDecision, TilingError, UbSplit};
use crate::utils::{align_down, align_up, ceil_div, checked_product, join_into_string};

const CONST_KEY: i64 = 1_000_000;
const PURE_COPY_KEY: i64 = 3_000_000;

/// Bytes kept free for the boundary block a store-align kernel overwrites.
const STORE_ALIGN_RESERVE: i64 = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum TransposeClass {
    PureCopy,
    /// Last axis in place and a whole number of blocks long.
    NoConv,
    /// Last axis in place, at least one block long but ragged.
    StoreAlign,
    /// The last axis moves.
    Cross,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransposeOutcome {
    Empty,
    Const {
        block_dims: u32,
    },
    Tiled {
        class: TransposeClass,
        decision: TilingDecision,
        /// The merged input dims.
        dims: Shape,
        /// The whole shape runs on one core in one UB tile; no factors are serialized.
        whole_shape: bool,
        ub_elements: DimSize,
    },
}

/// A merged input shape together with the permutation applied to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermutedShape {
    pub dims: Shape,
    /// The input axis written at each output position.
    pub perm: SmallVec<[usize; 8]>,
    /// The output position of each input axis.
    position: SmallVec<[usize; 8]>,
    pub epb: i64,
}

/// What one UB tile holds.
///
/// `low` is the cut on the input side and `high` the cut on the output side. Both are the same
/// axis when a single cut suffices. Boundary factors take precedence over `resident_axes`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct UbTile {
    pub low: (usize, DimSize),
    pub high: (usize, DimSize),
    /// Axes held in UB in full.
    pub resident_axes: SmallVec<[bool; 8]>,
}

#[derive(Debug, Clone)]
pub struct TransposeTiling {
    info: TransposeInfo,
}

impl TransposeClass {
    fn key_base(self) -> i64 {
        match self {
            TransposeClass::PureCopy => PURE_COPY_KEY,
            TransposeClass::NoConv => 20_000,
            TransposeClass::StoreAlign => 10_000,
            TransposeClass::Cross => 0,
        }
    }

    fn single_core_key(self) -> i64 {
        match self {
            TransposeClass::PureCopy => PURE_COPY_KEY,
            TransposeClass::NoConv => 2_020_000,
            TransposeClass::StoreAlign => 2_030_000,
            TransposeClass::Cross => 2_000_000,
        }
    }

    /// UB budget in elements.
    fn budget(self, ub_size: i64, dtype_bytes: i64) -> DimSize {
        match self {
            TransposeClass::StoreAlign => (ub_size - STORE_ALIGN_RESERVE) / dtype_bytes,
            _ => ub_size / 2 / dtype_bytes,
        }
    }
}

impl PermutedShape {
    pub fn new(dims: Shape, perm: &[usize], epb: i64) -> Self {
        let mut position = smallvec![0; perm.len()];
        for (p, &axis) in perm.iter().enumerate() {
            position[axis] = p;
        }
        PermutedShape {
            dims,
            perm: perm.iter().copied().collect(),
            position,
            epb,
        }
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn in_last(&self) -> usize {
        self.rank() - 1
    }

    /// The input axis that becomes the innermost output axis.
    pub fn out_last(&self) -> usize {
        self.perm[self.rank() - 1]
    }

    pub fn position(&self, axis: usize) -> usize {
        self.position[axis]
    }

    pub fn is_contiguous(&self, axis: usize) -> bool {
        axis == self.in_last() || axis == self.out_last()
    }

    /// Elements `n` units of `axis` take up in UB.
    pub fn extent(&self, axis: usize, n: DimSize) -> DimSize {
        if self.is_contiguous(axis) {
            align_up(n, self.epb)
        } else {
            n
        }
    }

    pub fn output_dims(&self) -> Shape {
        self.perm.iter().map(|&a| self.dims[a]).collect()
    }

    /// UB elements for a tile holding `resident(axis)` units of every axis.
    pub fn footprint(&self, resident: impl Fn(usize) -> DimSize) -> DimSize {
        (0..self.rank()).fold(1i64, |acc, a| acc.saturating_mul(self.extent(a, resident(a))))
    }

    pub fn classify(&self, total: DimSize) -> TransposeClass {
        let last = self.dims[self.in_last()];
        if self.dims.iter().any(|&d| d == total) {
            TransposeClass::PureCopy
        } else if self.out_last() != self.in_last() {
            TransposeClass::Cross
        } else if last % self.epb == 0 {
            TransposeClass::NoConv
        } else if last >= self.epb {
            TransposeClass::StoreAlign
        } else {
            TransposeClass::Cross
        }
    }
}

impl Display for PermutedShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] -> [{}]",
            join_into_string(&self.dims, ", "),
            join_into_string(self.output_dims(), ", ")
        )
    }
}

impl UbTile {
    pub fn single(axis: usize, factor: DimSize, resident_axes: SmallVec<[bool; 8]>) -> Self {
        UbTile {
            low: (axis, factor),
            high: (axis, factor),
            resident_axes,
        }
    }

    /// Every axis resident; the outermost input axis is the nominal boundary.
    pub fn whole(shape: &PermutedShape) -> Self {
        UbTile::single(0, shape.dims[0], smallvec![true; shape.rank()])
    }

    pub fn is_boundary(&self, axis: usize) -> bool {
        axis == self.low.0 || axis == self.high.0
    }

    /// Units of `axis` held in UB.
    pub fn resident(&self, shape: &PermutedShape, axis: usize) -> DimSize {
        if axis == self.high.0 {
            self.high.1
        } else if axis == self.low.0 {
            self.low.1
        } else if self.resident_axes[axis] {
            shape.dims[axis]
        } else {
            1
        }
    }

    pub fn footprint(&self, shape: &PermutedShape) -> DimSize {
        shape.footprint(|a| self.resident(shape, a))
    }
}

impl TransposeTiling {
    pub fn new(info: TransposeInfo) -> Self {
        TransposeTiling { info }
    }

    pub fn info(&self) -> &TransposeInfo {
        &self.info
    }

    pub fn compute(&self, input: &[DimSize], dtype: Dtype) -> Result<TransposeOutcome, TilingError> {
        if self.info.is_const {
            return Ok(TransposeOutcome::Const {
                block_dims: self.info.const_block_dims,
            });
        }
        if input.iter().any(|&d| d == UNKNOWN_DIM || d < 0) {
            return Err(ShapeError::UnknownDim(join_into_string(input, ", ")).into());
        }
        if input.is_empty() || input.len() != self.info.permute.len() {
            return Err(ShapeError::RankMismatch {
                expected: self.info.permute.len().max(1),
                actual: input.len(),
            }
            .into());
        }
        if input.contains(&0) {
            debug!("Transpose input is empty; skipping tiling");
            return Ok(TransposeOutcome::Empty);
        }

        let overflow = || ShapeError::Overflow(join_into_string(input, ", "));
        let dims = self.info.merge_shape(input).ok_or_else(overflow)?;
        let total = checked_product(&dims).ok_or_else(overflow)?;
        let shape = PermutedShape::new(dims, self.info.merged_permute(), dtype.elements_per_block());
        let core_num = i64::from(self.info.core_num);
        let bytes = i64::from(dtype.size());
        let class = shape.classify(total);
        let budget = class.budget(self.info.ub_size, bytes);
        if budget < shape.epb {
            return Err(TilingError::ResourceExhausted(format!(
                "transpose {} with a budget of {} elements",
                shape, budget
            )));
        }

        if class == TransposeClass::PureCopy {
            let (decision, ub_elements) = pure_copy(&shape, total, core_num, budget)?;
            debug!("{} transpose {}: {}", class, shape, decision);
            return Ok(TransposeOutcome::Tiled {
                class,
                decision,
                dims: shape.dims,
                whole_shape: false,
                ub_elements,
            });
        }

        let whole_footprint = shape.footprint(|a| shape.dims[a]);
        if total < core_num * shape.epb * shape.epb && whole_footprint <= budget {
            let decision = TilingDecision::single_core(class.single_core_key(), 0, shape.dims[0]);
            debug!("{} transpose {} fits one core: {}", class, shape, decision);
            return Ok(TransposeOutcome::Tiled {
                class,
                decision,
                dims: shape.dims,
                whole_shape: true,
                ub_elements: whole_footprint,
            });
        }

        let mut tile = match class {
            TransposeClass::NoConv | TransposeClass::StoreAlign => aligned::ub_tiling(&shape, budget),
            _ => cross::ub_tiling(&shape, budget),
        };
        ub_no_overlap(&shape, &mut tile);
        let ub_elements = tile.footprint(&shape);
        if ub_elements > budget {
            return Err(TilingError::ResourceExhausted(format!(
                "transpose {} needs {} elements of a {} element budget",
                shape, ub_elements, budget
            )));
        }

        let (block_axis, block_factor, block_dims) = block_tiling(&shape, &tile, core_num);
        let (ub, ub_key) = match class {
            TransposeClass::Cross => (
                UbSplit::Pair {
                    low_axis: tile.low.0,
                    low_factor: tile.low.1,
                    high_axis: tile.high.0,
                    high_factor: tile.high.1,
                },
                tile.low.0 * 10 + tile.high.0,
            ),
            _ => (
                UbSplit::Single {
                    axis: tile.high.0,
                    factor: tile.high.1,
                },
                tile.high.0,
            ),
        };
        let decision = TilingDecision {
            block_axis,
            block_factor,
            block_dims: to_block_dims(block_dims)?,
            ub,
            tiling_key: class.key_base() + (block_axis * 100 + ub_key) as i64,
            need_multi_core: block_dims > 1,
            need_double_buffer: false,
        };
        debug!("{} transpose {}: {}", class, shape, decision);
        Ok(TransposeOutcome::Tiled {
            class,
            decision,
            dims: shape.dims,
            whole_shape: false,
            ub_elements,
        })
    }

    /// Serializes the merged dims selected by `transpose_vars`, then the block factor and the
    /// UB factors. A shared UB cut is written once.
    pub fn write(&self, outcome: &TransposeOutcome, run_info: &mut RunInfo) -> Result<(), TilingError> {
        let (decision, dims, whole_shape) = match outcome {
            TransposeOutcome::Empty => {
                return TilingDataWriter::expecting(0).commit(1, EMPTY_TENSOR_KEY, run_info)
            }
            TransposeOutcome::Const { block_dims } => {
                return TilingDataWriter::expecting(0).commit(*block_dims, CONST_KEY, run_info)
            }
            TransposeOutcome::Tiled {
                decision,
                dims,
                whole_shape,
                ..
            } => (decision, dims, *whole_shape),
        };

        let factors: SmallVec<[(VarId, DimSize); 3]> = if whole_shape {
            SmallVec::new()
        } else {
            let mut factors = smallvec![(VarId::BlockFactor, decision.block_factor)];
            match decision.ub {
                UbSplit::Single { factor, .. } => factors.push((VarId::UbFactor(0), factor)),
                UbSplit::Pair {
                    low_axis,
                    low_factor,
                    high_axis,
                    high_factor,
                } => {
                    factors.push((VarId::UbFactor(0), low_factor));
                    if high_axis != low_axis {
                        factors.push((VarId::UbFactor(1), high_factor));
                    }
                }
            }
            factors
        };

        let declared = self.info.transpose_vars.iter().filter(|&&v| v).count();
        let mut writer = TilingDataWriter::expecting(declared + factors.len());
        for (axis, (&dim, _)) in dims
            .iter()
            .zip(&self.info.transpose_vars)
            .enumerate()
            .filter(|(_, (_, &v))| v)
        {
            let var = VarId::Dim {
                input: 0,
                axis: axis as u8,
            };
            writer.push_i64(var.to_string(), dim)?;
        }
        for (var, value) in factors {
            writer.push_i64(var.to_string(), value)?;
        }
        writer.commit(decision.block_dims, decision.tiling_key, run_info)
    }

    pub fn tile(&self, input: &[DimSize], dtype: Dtype, run_info: &mut RunInfo) -> Result<(), TilingError> {
        let outcome = self.compute(input, dtype)?;
        self.write(&outcome, run_info)
    }
}

/// Tiles an effectively one-dimensional copy. The block factor counts UB tiles.
fn pure_copy(
    shape: &PermutedShape,
    total: DimSize,
    core_num: i64,
    budget: DimSize,
) -> Result<(TilingDecision, DimSize), TilingError> {
    let axis = shape.dims.iter().position(|&d| d == total).unwrap_or(0);
    let ub_factor = align_down(budget, shape.epb)
        .min(align_up(ceil_div(total, core_num), shape.epb))
        .min(total);
    let tiles = ceil_div(total, ub_factor);
    let block_factor = ceil_div(tiles, core_num);
    let block_dims = ceil_div(tiles, block_factor);
    let decision = TilingDecision {
        block_axis: axis,
        block_factor,
        block_dims: to_block_dims(block_dims)?,
        ub: UbSplit::Single {
            axis,
            factor: ub_factor,
        },
        tiling_key: PURE_COPY_KEY,
        need_multi_core: block_dims > 1,
        need_double_buffer: false,
    };
    Ok((decision, align_up(ub_factor, shape.epb)))
}

/// Largest factor of `axis` not above `limit`; a partial contiguous axis is cut on a block
/// boundary.
fn split_factor(shape: &PermutedShape, axis: usize, limit: DimSize) -> DimSize {
    let size = shape.dims[axis];
    let factor = limit.clamp(1, size);
    if factor < size && shape.is_contiguous(axis) {
        align_down(factor, shape.epb)
    } else {
        factor
    }
}

/// Shrinks the output-side factor until its last partial tile, times the resident output
/// run inside it, is empty or at least one block.
fn ub_no_overlap(shape: &PermutedShape, tile: &mut UbTile) {
    let (axis, mut factor) = tile.high;
    let size = shape.dims[axis];
    let inner = inner_run(shape, tile, axis);
    loop {
        let tail = size % factor;
        if factor == 1 || tail == 0 || tail * inner >= shape.epb {
            break;
        }
        factor -= if shape.is_contiguous(axis) && factor > shape.epb {
            shape.epb
        } else {
            1
        };
    }
    if factor != tile.high.1 {
        debug!("Shrank UB factor of axis {} to {} to avoid a partial block", axis, factor);
    }
    if tile.low.0 == axis {
        tile.low.1 = factor;
    }
    tile.high.1 = factor;
}

/// Units of the output-order axes after `axis` held in the tile.
fn inner_run(shape: &PermutedShape, tile: &UbTile, axis: usize) -> DimSize {
    shape.perm[shape.position(axis) + 1..]
        .iter()
        .map(|&a| tile.resident(shape, a))
        .product()
}

/// Picks the block axis from the output-order axes outside the tile, falling back to the
/// tile's own cuts. Returns `(axis, factor, block_dims)`; on a cut axis the factor counts UB
/// tiles.
fn block_tiling(shape: &PermutedShape, tile: &UbTile, core_num: i64) -> (usize, DimSize, i64) {
    let mut outer = 1;
    let mut last_walked = None;
    for &axis in &shape.perm {
        if tile.resident_axes[axis] || tile.is_boundary(axis) {
            continue;
        }
        let size = shape.dims[axis];
        if outer * size >= core_num {
            let factor = ceil_div(size, core_num / outer);
            return (axis, factor, outer * ceil_div(size, factor));
        }
        outer *= size;
        last_walked = Some(axis);
    }

    let mut cuts: SmallVec<[(usize, DimSize); 2]> = smallvec![tile.low];
    if tile.high.0 != tile.low.0 {
        cuts.push(tile.high);
    }
    for (axis, factor) in cuts {
        let tiles = ceil_div(shape.dims[axis], factor);
        if tiles > 1 {
            let per_core = ceil_div(tiles, core_num / outer);
            return (axis, per_core, outer * ceil_div(tiles, per_core));
        }
    }
    match last_walked {
        Some(axis) => (axis, 1, outer),
        None => (tile.high.0, 1, 1),
    }
}
