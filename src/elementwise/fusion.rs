use smallvec::SmallVec;

use std::fmt::{self, Display};

use crate::common::{DimSize, Shape};
use crate::shapes::ShapeAdapter;
use crate::tiling::TilingError;
use crate::utils::join_into_string;

/// Broadcast shape classes, named by the sequence of fused axes from outermost to innermost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::EnumIter)]
pub enum BroadcastPattern {
    Original,
    Common,
    CommonBroadcast,
    CommonBroadcastCommon,
    Broadcast,
    BroadcastCommon,
    BroadcastScalar,
    ScalarBroadcast,
    UnknownUnknown,
}

/// A broadcast shape after size-1 output axes are dropped and runs of axes with identical
/// per-input broadcast signatures are collapsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FusedShape {
    pub output: Shape,
    pub inputs: Vec<Shape>,
    /// Whether any input is broadcast along each fused axis.
    pub broadcast: SmallVec<[bool; 8]>,
}

impl BroadcastPattern {
    pub fn code(&self) -> u32 {
        match self {
            BroadcastPattern::Original => 0,
            BroadcastPattern::Common => 100,
            BroadcastPattern::CommonBroadcast => 120,
            BroadcastPattern::CommonBroadcastCommon => 121,
            BroadcastPattern::Broadcast => 200,
            BroadcastPattern::BroadcastCommon => 210,
            BroadcastPattern::BroadcastScalar => 230,
            BroadcastPattern::ScalarBroadcast => 320,
            BroadcastPattern::UnknownUnknown => 999,
        }
    }
}

impl FusedShape {
    pub fn rank(&self) -> usize {
        self.output.len()
    }

    pub fn last_axis_broadcast(&self) -> bool {
        self.broadcast.last().copied().unwrap_or(false)
    }

    /// Classifies the fused shape. Returns [BroadcastPattern::Original] for anything outside
    /// the special classes.
    pub fn classify(&self) -> BroadcastPattern {
        if self.rank() == 1 && self.inputs.len() == 2 {
            match (self.inputs[0][0], self.inputs[1][0]) {
                (a, 1) if a != 1 => return BroadcastPattern::BroadcastScalar,
                (1, b) if b != 1 => return BroadcastPattern::ScalarBroadcast,
                _ => {}
            }
        }
        match self.broadcast.as_slice() {
            [false] => BroadcastPattern::Common,
            [false, true] => BroadcastPattern::CommonBroadcast,
            [false, true, false] => BroadcastPattern::CommonBroadcastCommon,
            [true] => BroadcastPattern::Broadcast,
            [true, false] => BroadcastPattern::BroadcastCommon,
            _ => BroadcastPattern::Original,
        }
    }
}

/// Fuses the padded shapes of `adapter`.
///
/// An all-ones output fuses to a single axis of size 1. Fails if a fused extent overflows.
pub fn fuse(adapter: &ShapeAdapter) -> Result<FusedShape, TilingError> {
    let inputs = adapter.inputs();
    let mut fused = FusedShape {
        output: Shape::new(),
        inputs: vec![Shape::new(); inputs.len()],
        broadcast: SmallVec::new(),
    };
    let mut last_signature: Option<SmallVec<[bool; 8]>> = None;

    for (axis, &out_dim) in adapter.output().iter().enumerate() {
        if out_dim == 1 {
            continue;
        }
        let signature = (0..inputs.len())
            .map(|i| adapter.is_broadcast(i, axis))
            .collect::<SmallVec<[bool; 8]>>();
        if last_signature.as_ref() == Some(&signature) {
            if let Some(d) = fused.output.last_mut() {
                *d = d.checked_mul(out_dim).ok_or(TilingError::ShapeTooLarge(i64::MAX))?;
            }
            for (fused_input, input) in fused.inputs.iter_mut().zip(inputs) {
                if let Some(d) = fused_input.last_mut() {
                    *d = d
                        .checked_mul(input[axis])
                        .ok_or(TilingError::ShapeTooLarge(i64::MAX))?;
                }
            }
        } else {
            fused.output.push(out_dim);
            for (fused_input, input) in fused.inputs.iter_mut().zip(inputs) {
                fused_input.push(input[axis]);
            }
            fused.broadcast.push(signature.iter().any(|&b| b));
            last_signature = Some(signature);
        }
    }

    if fused.output.is_empty() {
        fused.output.push(1);
        for fused_input in &mut fused.inputs {
            fused_input.push(1);
        }
        fused.broadcast.push(false);
    }
    Ok(fused)
}

/// Product of the fused output dims after `axis`.
pub fn inner_size(output: &[DimSize], axis: usize) -> DimSize {
    output[axis + 1..].iter().product()
}

impl Display for FusedShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] <- {}",
            join_into_string(&self.output, ", "),
            join_into_string(
                self.inputs
                    .iter()
                    .map(|s| format!("[{}]", join_into_string(s, ", "))),
                " "
            )
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shape;
    use std::collections::HashSet;
    use strum::IntoEnumIterator;

    fn fused(inputs: &[Shape]) -> FusedShape {
        fuse(&ShapeAdapter::new(inputs, &[]).unwrap()).unwrap()
    }

    #[test]
    fn test_fuses_runs_with_equal_signatures() {
        let f = fused(&[shape![2, 3, 4, 5], shape![2, 3, 1, 1]]);
        assert_eq!(f.output.as_slice(), &[6, 20]);
        assert_eq!(f.inputs[0].as_slice(), &[6, 20]);
        assert_eq!(f.inputs[1].as_slice(), &[6, 1]);
        assert_eq!(f.broadcast.as_slice(), &[false, true]);
        assert_eq!(f.classify(), BroadcastPattern::CommonBroadcast);
    }

    #[test]
    fn test_drops_unit_output_axes() {
        let f = fused(&[shape![4, 1, 8], shape![1, 1, 8]]);
        assert_eq!(f.output.as_slice(), &[4, 8]);
        assert_eq!(f.classify(), BroadcastPattern::BroadcastCommon);
    }

    #[test]
    fn test_common_broadcast_common() {
        let f = fused(&[shape![3, 4, 5], shape![3, 1, 5]]);
        assert_eq!(f.classify(), BroadcastPattern::CommonBroadcastCommon);
        assert!(!f.last_axis_broadcast());
    }

    #[test]
    fn test_scalar_operands() {
        assert_eq!(
            fused(&[shape![16, 16], shape![1]]).classify(),
            BroadcastPattern::BroadcastScalar
        );
        assert_eq!(
            fused(&[shape![1, 1], shape![16, 16]]).classify(),
            BroadcastPattern::ScalarBroadcast
        );
    }

    #[test]
    fn test_mixed_signatures_are_original() {
        // Input 0 broadcasts on axis 0 and input 1 on axis 1.
        let f = fused(&[shape![1, 7, 9], shape![5, 1, 9]]);
        assert_eq!(f.rank(), 3);
        assert_eq!(f.classify(), BroadcastPattern::Original);
    }

    #[test]
    fn test_pattern_codes_are_distinct() {
        let codes = BroadcastPattern::iter().map(|p| p.code()).collect::<HashSet<_>>();
        assert_eq!(codes.len(), BroadcastPattern::iter().count());
    }

    #[test]
    fn test_overflowing_run_is_rejected() {
        let adapter =
            ShapeAdapter::new(&[shape![2, 1i64 << 32, 1i64 << 32], shape![1, 1i64 << 32, 1i64 << 32]], &[])
                .unwrap();
        assert_eq!(fuse(&adapter), Err(TilingError::ShapeTooLarge(i64::MAX)));
    }

    #[test]
    fn test_all_ones() {
        let f = fused(&[shape![1, 1], shape![1]]);
        assert_eq!(f.output.as_slice(), &[1]);
        assert_eq!(inner_size(&f.output, 0), 1);
    }
}
