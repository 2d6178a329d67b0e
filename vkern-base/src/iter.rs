//! Range-splitting iterators and their Rayon adapters.

use rayon::iter::plumbing::{Consumer, Producer, ProducerCallback, UnindexedConsumer, bridge};
use rayon::prelude::*;

mod balanced;
mod range;

pub use balanced::{BalancedRanges, balanced_range_split, balanced_ranges};
pub use range::{RangeChunks, range_chunks};

/// An exact-size iterator which can be cut in two at any position.
///
/// Iterators implementing this trait get a Rayon [`IndexedParallelIterator`]
/// for free by using [`ParIter`] as their [`IntoParallelIterator::Iter`]
/// type. Rayon uses `split_at` to divide work between threads, so the halves
/// must together yield exactly the items of the original iterator, in the
/// same order.
pub trait SplitIterator: DoubleEndedIterator + ExactSizeIterator {
    /// Split the iterator so that the left half yields the first `index`
    /// items and the right half yields the rest.
    ///
    /// Panics if `index > self.len()`.
    fn split_at(self, index: usize) -> (Self, Self)
    where
        Self: Sized;
}

/// Parallel iterator over the items of a [`SplitIterator`].
pub struct ParIter<I: SplitIterator>(I);

impl<I: SplitIterator> From<I> for ParIter<I> {
    fn from(val: I) -> Self {
        ParIter(val)
    }
}

impl<I: SplitIterator + Send> ParallelIterator for ParIter<I>
where
    <I as Iterator>::Item: Send,
{
    type Item = I::Item;

    fn drive_unindexed<C>(self, consumer: C) -> C::Result
    where
        C: UnindexedConsumer<Self::Item>,
    {
        bridge(self, consumer)
    }

    fn opt_len(&self) -> Option<usize> {
        Some(ExactSizeIterator::len(&self.0))
    }
}

impl<I: SplitIterator + Send> IndexedParallelIterator for ParIter<I>
where
    <I as Iterator>::Item: Send,
{
    fn drive<C>(self, consumer: C) -> C::Result
    where
        C: Consumer<Self::Item>,
    {
        bridge(self, consumer)
    }

    fn len(&self) -> usize {
        ExactSizeIterator::len(&self.0)
    }

    fn with_producer<CB>(self, callback: CB) -> CB::Output
    where
        CB: ProducerCallback<Self::Item>,
    {
        callback.callback(self)
    }
}

impl<I: SplitIterator + Send> Producer for ParIter<I> {
    type Item = I::Item;
    type IntoIter = I;

    fn into_iter(self) -> Self::IntoIter {
        self.0
    }

    fn split_at(self, index: usize) -> (Self, Self) {
        let (left, right) = SplitIterator::split_at(self.0, index);
        (Self(left), Self(right))
    }
}
