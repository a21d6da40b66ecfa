use divrem::DivCeil;

use crate::common::DimSize;

/// Integer division rounding towards positive infinity.
///
/// # Examples
/// ```
/// # use autotile::utils::ceil_div;
/// assert_eq!(ceil_div(7, 2), 4);
/// assert_eq!(ceil_div(8, 2), 4);
/// assert_eq!(ceil_div(0, 3), 0);
/// ```
pub fn ceil_div(n: i64, d: i64) -> i64 {
    debug_assert!(n >= 0 && d > 0, "ceil_div({n}, {d})");
    DivCeil::div_ceil(n, d)
}

/// Rounds `n` up to the next multiple of `align`.
pub fn align_up(n: i64, align: i64) -> i64 {
    ceil_div(n, align) * align
}

/// Rounds `n` down to a multiple of `align`.
///
/// Unlike a plain truncation this never returns zero for positive `n`: a
/// value smaller than `align` is returned unchanged.
pub fn align_down(n: i64, align: i64) -> i64 {
    debug_assert!(align > 0);
    if n < align {
        n
    } else {
        n / align * align
    }
}

/// Product of a sequence of dimensions, or `None` on overflow.
pub fn checked_product<'a>(dims: impl IntoIterator<Item = &'a DimSize>) -> Option<DimSize> {
    dims.into_iter()
        .try_fold(1i64, |acc, &d| acc.checked_mul(d))
}

/// Largest integer whose square is at most `n`.
pub fn isqrt(n: i64) -> i64 {
    debug_assert!(n >= 0);
    let mut r = (n as f64).sqrt() as i64;
    while r * r > n {
        r -= 1;
    }
    while (r + 1) * (r + 1) <= n {
        r += 1;
    }
    r
}

pub fn join_into_string(c: impl IntoIterator<Item = impl ToString>, separator: &str) -> String {
    c.into_iter()
        .map(|d| d.to_string())
        .collect::<Vec<_>>()
        .join(separator)
}
