use smallvec::SmallVec;

use std::fmt::{self, Display};

use crate::common::{DimSize, Shape};
use crate::utils::{checked_product, join_into_string};

/// A reduce input after size-1 axes are dropped and runs of reduce / non-reduce axes are fused.
///
/// Axis indices used by reduce and norm decisions index into `fused`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReduceShape {
    pub fused: Shape,
    pub is_reduce: SmallVec<[bool; 8]>,
    /// One `A` or `R` per fused axis.
    pub layout: String,
    /// `fused` with reduce axes set to 0.
    pub output_shape: Shape,
    pub is_last_axis_reduce: bool,
    /// Fused axis at each position of the reordered shape.
    pub reorder: SmallVec<[usize; 8]>,
    pub total_reduce: DimSize,
    pub total_output: DimSize,
}

impl ReduceShape {
    /// Fuses `input` given normalized, sorted `axes`.
    ///
    /// Returns `None` if an element count overflows.
    pub fn new(input: &[DimSize], axes: &[usize]) -> Option<Self> {
        let mut fused = Shape::new();
        let mut is_reduce = SmallVec::<[bool; 8]>::new();
        for (i, &d) in input.iter().enumerate() {
            if d == 1 {
                continue;
            }
            let r = axes.contains(&i);
            if is_reduce.last() == Some(&r) {
                let last = fused.last_mut()?;
                *last = last.checked_mul(d)?;
            } else {
                fused.push(d);
                is_reduce.push(r);
            }
        }
        if fused.is_empty() {
            // Everything was size 1: keep one axis so there is something to tile.
            fused.push(1);
            is_reduce.push(!axes.is_empty() && axes.len() == input.len());
        }

        let layout = is_reduce
            .iter()
            .map(|&r| if r { 'R' } else { 'A' })
            .collect::<String>();
        let output_shape = fused
            .iter()
            .zip(&is_reduce)
            .map(|(&d, &r)| if r { 0 } else { d })
            .collect::<Shape>();
        let is_last_axis_reduce = is_reduce.last().copied().unwrap_or(false);

        let (reduce_axes, kept_axes): (SmallVec<[usize; 8]>, SmallVec<[usize; 8]>) =
            (0..fused.len()).partition(|&i| is_reduce[i]);
        let reorder = if is_last_axis_reduce {
            kept_axes.into_iter().chain(reduce_axes).collect()
        } else {
            reduce_axes.into_iter().chain(kept_axes).collect()
        };

        let total_of = |reduce: bool| {
            checked_product(
                fused
                    .iter()
                    .zip(&is_reduce)
                    .filter(|&(_, &r)| r == reduce)
                    .map(|(d, _)| d),
            )
        };
        let total_reduce = total_of(true)?;
        let total_output = total_of(false)?;

        Some(ReduceShape {
            fused,
            is_reduce,
            layout,
            output_shape,
            is_last_axis_reduce,
            reorder,
            total_reduce,
            total_output,
        })
    }

    pub fn rank(&self) -> usize {
        self.fused.len()
    }

    /// The fused dims in reordered position order.
    pub fn reordered(&self) -> Shape {
        self.reorder.iter().map(|&a| self.fused[a]).collect()
    }

    /// Indices of non-reduce fused axes, outermost first.
    pub fn kept_axes(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.rank()).filter(|&i| !self.is_reduce[i])
    }

    /// Indices of reduce fused axes, outermost first.
    pub fn reduce_axes(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.rank()).filter(|&i| self.is_reduce[i])
    }

    /// Product of the non-reduce dims after `axis`: the contiguous output run below it.
    pub fn output_inner(&self, axis: usize) -> DimSize {
        self.output_shape[axis + 1..]
            .iter()
            .filter(|&&d| d != 0)
            .product()
    }
}

impl Display for ReduceShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.layout, join_into_string(&self.fused, ", "))
    }
}
