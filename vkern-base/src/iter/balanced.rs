use std::ops::Range;

use rayon::prelude::*;

use super::{ParIter, SplitIterator};

/// Return the sub-range of `0..total` assigned to part `part` when the range
/// is divided into `n_parts` contiguous pieces of near-equal size.
///
/// The first `total % n_parts` parts get one extra item, so sizes differ by
/// at most one and the parts, taken in order, cover `0..total` exactly. When
/// `total < n_parts` the trailing parts are empty.
///
/// Panics if `n_parts` is zero or `part >= n_parts`.
#[inline]
pub fn balanced_range_split(total: usize, n_parts: usize, part: usize) -> Range<usize> {
    assert!(n_parts > 0, "cannot split a range into zero parts");
    assert!(
        part < n_parts,
        "part {} out of range for {} parts",
        part,
        n_parts
    );

    let base = total / n_parts;
    let n_larger = total % n_parts;
    let start = part * base + part.min(n_larger);
    let len = base + usize::from(part < n_larger);
    start..start + len
}

/// Iterator returned by [`balanced_ranges`].
#[derive(Clone, Debug)]
pub struct BalancedRanges {
    total: usize,
    n_parts: usize,

    /// Part indices that have not yet been yielded.
    parts: Range<usize>,
}

impl Iterator for BalancedRanges {
    type Item = Range<usize>;

    #[inline]
    fn next(&mut self) -> Option<Range<usize>> {
        let part = self.parts.next()?;
        Some(balanced_range_split(self.total, self.n_parts, part))
    }

    #[inline]
    fn size_hint(&self) -> (usize, Option<usize>) {
        self.parts.size_hint()
    }
}

impl DoubleEndedIterator for BalancedRanges {
    #[inline]
    fn next_back(&mut self) -> Option<Range<usize>> {
        let part = self.parts.next_back()?;
        Some(balanced_range_split(self.total, self.n_parts, part))
    }
}

impl ExactSizeIterator for BalancedRanges {}

impl std::iter::FusedIterator for BalancedRanges {}

impl SplitIterator for BalancedRanges {
    fn split_at(self, index: usize) -> (Self, Self) {
        assert!(index <= self.parts.len());
        let mid = self.parts.start + index;
        (
            BalancedRanges {
                parts: self.parts.start..mid,
                ..self
            },
            BalancedRanges {
                parts: mid..self.parts.end,
                ..self
            },
        )
    }
}

impl IntoParallelIterator for BalancedRanges {
    type Iter = ParIter<Self>;
    type Item = Range<usize>;

    fn into_par_iter(self) -> Self::Iter {
        self.into()
    }
}

/// Return an iterator over all `n_parts` ranges produced by
/// [`balanced_range_split`], in order.
pub fn balanced_ranges(total: usize, n_parts: usize) -> BalancedRanges {
    assert!(n_parts > 0, "cannot split a range into zero parts");
    BalancedRanges {
        total,
        n_parts,
        parts: 0..n_parts,
    }
}
