use std::ops::Range;

use rayon::prelude::*;

use super::{ParIter, SplitIterator};

/// Iterator returned by [`range_chunks`].
#[derive(Clone, Debug)]
pub struct RangeChunks {
    remainder: Range<usize>,
    chunk_size: usize,
}

impl Iterator for RangeChunks {
    type Item = Range<usize>;

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        if self.remainder.is_empty() {
            return None;
        }
        let start = self.remainder.start;
        let end = (start + self.chunk_size).min(self.remainder.end);
        self.remainder.start = end;
        Some(start..end)
    }

    #[inline]
    fn size_hint(&self) -> (usize, Option<usize>) {
        let len = self.remainder.len().div_ceil(self.chunk_size);
        (len, Some(len))
    }
}

impl ExactSizeIterator for RangeChunks {}

impl std::iter::FusedIterator for RangeChunks {}

impl DoubleEndedIterator for RangeChunks {
    fn next_back(&mut self) -> Option<Self::Item> {
        if self.remainder.is_empty() {
            return None;
        }

        // The last chunk is the short one, so its start is found by rounding
        // down relative to the start of the remainder.
        let n_full = (self.remainder.len() - 1) / self.chunk_size;
        let start = self.remainder.start + n_full * self.chunk_size;
        let end = self.remainder.end;
        self.remainder.end = start;
        Some(start..end)
    }
}

impl SplitIterator for RangeChunks {
    fn split_at(self, index: usize) -> (Self, Self) {
        let len = self.len();
        assert!(
            index <= len,
            "split index {} out of bounds for iterator of length {}",
            index,
            len
        );

        let mid = self.remainder.start + (index * self.chunk_size).min(self.remainder.len());
        (
            RangeChunks {
                remainder: self.remainder.start..mid,
                chunk_size: self.chunk_size,
            },
            RangeChunks {
                remainder: mid..self.remainder.end,
                chunk_size: self.chunk_size,
            },
        )
    }
}

impl IntoParallelIterator for RangeChunks {
    type Iter = ParIter<Self>;
    type Item = Range<usize>;

    fn into_par_iter(self) -> Self::Iter {
        self.into()
    }
}

/// Split `range` into consecutive sub-ranges of `chunk_size` items.
///
/// The final chunk is shorter if `range.len()` is not a multiple of
/// `chunk_size`. This is how channel dimensions are cut into blocks that fit
/// in per-thread buffers.
#[inline]
pub fn range_chunks(range: Range<usize>, chunk_size: usize) -> RangeChunks {
    assert!(chunk_size > 0, "chunk size must be positive");
    RangeChunks {
        remainder: range,
        chunk_size,
    }
}

#[cfg(test)]
mod tests {
    use rayon::prelude::*;

    use super::range_chunks;
    use crate::iter::SplitIterator;

    #[test]
    fn test_range_chunks() {
        let chunks: Vec<_> = range_chunks(0..15, 5).collect();
        assert_eq!(chunks, [0..5, 5..10, 10..15]);

        let mut chunks = range_chunks(3..16, 5);
        assert_eq!(chunks.size_hint(), (3, Some(3)));
        assert_eq!(chunks.next(), Some(3..8));
        assert_eq!(chunks.next(), Some(8..13));
        assert_eq!(chunks.next(), Some(13..16));
        assert_eq!(chunks.next(), None);

        assert_eq!(range_chunks(4..4, 3).count(), 0);
    }

    #[test]
    fn test_range_chunks_rev() {
        let chunks: Vec<_> = range_chunks(0..13, 5).rev().collect();
        assert_eq!(chunks, [10..13, 5..10, 0..5]);

        // Mixing front and back iteration.
        let mut chunks = range_chunks(0..13, 5);
        assert_eq!(chunks.next_back(), Some(10..13));
        assert_eq!(chunks.next(), Some(0..5));
        assert_eq!(chunks.next_back(), Some(5..10));
        assert_eq!(chunks.next(), None);
    }

    #[test]
    fn test_range_chunks_split_at() {
        let (left, right) = range_chunks(0..13, 5).split_at(1);
        assert_eq!(left.collect::<Vec<_>>(), [0..5]);
        assert_eq!(right.collect::<Vec<_>>(), [5..10, 10..13]);

        let (left, right) = range_chunks(0..13, 5).split_at(3);
        assert_eq!(left.len(), 3);
        assert_eq!(right.len(), 0);
    }

    #[test]
    fn test_range_chunks_par_iter() {
        let total: usize = range_chunks(0..1000, 7)
            .into_par_iter()
            .map(|r| r.len())
            .sum();
        assert_eq!(total, 1000);
    }
}
