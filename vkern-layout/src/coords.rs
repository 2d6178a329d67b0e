use std::ops::Range;

use smallvec::{smallvec, SmallVec};

use crate::desc::{Dims, MAX_DIMS};

/// Maximum number of coordinates in a [`CoordBatch`].
///
/// This is the vector length that batched offset calculations are written
/// for. It is larger than any hardware SIMD width so that the compiler can
/// unroll and vectorize loops over a batch freely.
pub const MAX_VL: usize = 256;

/// A batch of up to [`MAX_VL`] coordinates, stored as one column per dim.
///
/// Storing coordinates column-wise means that per-dim arithmetic over a
/// batch, such as computing offsets or deriving source coordinates from
/// output coordinates, is a loop over a contiguous slice.
#[derive(Clone, Debug)]
pub struct CoordBatch {
    /// Column `d` occupies `cols[d * MAX_VL..d * MAX_VL + len]`.
    cols: Vec<usize>,
    ndim: usize,
    len: usize,

    /// Linear position of the first coordinate within the range that
    /// produced this batch.
    start: usize,
}

impl CoordBatch {
    /// Create an empty batch for coordinates with `ndim` dims.
    pub fn new(ndim: usize) -> CoordBatch {
        assert!(ndim <= MAX_DIMS);
        CoordBatch {
            cols: vec![0; ndim.max(1) * MAX_VL],
            ndim,
            len: 0,
            start: 0,
        }
    }

    pub fn ndim(&self) -> usize {
        self.ndim
    }

    /// Number of valid coordinates in the batch.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Linear position of the first coordinate within the range being
    /// iterated.
    pub fn start(&self) -> usize {
        self.start
    }

    /// Set the number of valid coordinates. Column entries past the previous
    /// length are left with whatever values they had.
    pub fn set_len(&mut self, len: usize) {
        assert!(len <= MAX_VL);
        self.len = len;
    }

    /// Return the values of dim `dim` for each coordinate in the batch.
    #[inline]
    pub fn column(&self, dim: usize) -> &[usize] {
        let start = dim * MAX_VL;
        &self.cols[start..start + self.len]
    }

    /// Mutable version of [`column`](Self::column).
    #[inline]
    pub fn column_mut(&mut self, dim: usize) -> &mut [usize] {
        let start = dim * MAX_VL;
        &mut self.cols[start..start + self.len]
    }

    /// Return the `i`th coordinate in the batch.
    pub fn coord(&self, i: usize) -> Dims {
        assert!(i < self.len);
        (0..self.ndim).map(|d| self.cols[d * MAX_VL + i]).collect()
    }

    /// Replace the contents of the batch with the coordinates of row-major
    /// linear `indices` into a tensor with shape `dims`.
    pub fn fill_from_linear(&mut self, dims: &[usize], indices: &[usize]) {
        assert_eq!(dims.len(), self.ndim);
        self.set_len(indices.len());
        self.start = indices.first().copied().unwrap_or(0);

        let mut inner = 1;
        for d in (0..self.ndim).rev() {
            let size = dims[d];
            for (c, &idx) in self.column_mut(d).iter_mut().zip(indices) {
                *c = (idx / inner) % size;
            }
            inner *= size;
        }
    }
}

/// Iterates over a multi-dimensional index range in batches of coordinates.
///
/// The range is either a box given by per-dim `[lo, hi)` bounds
/// ([`from_ranges`](Self::from_ranges)) or a sub-range of the row-major
/// linear indices of a full tensor ([`from_linear`](Self::from_linear)),
/// which is how work is split between threads. Coordinates are produced in
/// row-major order, each exactly once, in chunks of at most the chunk length
/// (default [`MAX_VL`]). Only the last chunk may be shorter.
///
/// The current chunk is available via [`batch`](Self::batch) until
/// [`advance`](Self::advance) is called. The usual loop is:
///
/// ```
/// use vkern_layout::CoordChunks;
///
/// let mut chunks = CoordChunks::from_ranges(&[0..2, 1..4]);
/// let mut count = 0;
/// while let Some(batch) = chunks.next_batch() {
///     count += batch.len();
/// }
/// assert_eq!(count, 6);
/// ```
#[derive(Clone, Debug)]
pub struct CoordChunks {
    lo: Dims,
    extent: Dims,

    /// Product of `extent` for dims after each dim.
    inner: Dims,

    /// Linear position of the current chunk.
    pos: usize,

    /// Linear position at which iteration ends.
    end: usize,

    chunk_len: usize,
    batch: CoordBatch,

    /// True if the current chunk has not yet been returned by
    /// [`next_batch`](Self::next_batch).
    primed: bool,
}

impl CoordChunks {
    /// Iterate over all coordinates whose value for each dim lies in the
    /// corresponding range.
    pub fn from_ranges(ranges: &[Range<usize>]) -> CoordChunks {
        let mut chunks = CoordChunks::empty(ranges.len());
        chunks.reset(ranges);
        chunks
    }

    /// Iterate over the coordinates of a tensor with shape `dims` whose
    /// row-major linear indices lie in `range`.
    pub fn from_linear(dims: &[usize], range: Range<usize>) -> CoordChunks {
        let mut chunks = CoordChunks::empty(dims.len());
        chunks.reset_linear(dims, range);
        chunks
    }

    fn empty(ndim: usize) -> CoordChunks {
        CoordChunks {
            lo: smallvec![0; ndim],
            extent: smallvec![0; ndim],
            inner: smallvec![0; ndim],
            pos: 0,
            end: 0,
            chunk_len: MAX_VL,
            batch: CoordBatch::new(ndim),
            primed: false,
        }
    }

    /// Set the maximum number of coordinates per chunk.
    ///
    /// Panics if `chunk_len` is zero or greater than [`MAX_VL`].
    pub fn with_chunk_len(mut self, chunk_len: usize) -> CoordChunks {
        assert!(chunk_len > 0 && chunk_len <= MAX_VL);
        self.chunk_len = chunk_len;
        self.fill();
        self
    }

    /// Restart iteration over a new box of coordinates with the same number
    /// of dims. This reuses the coordinate buffer.
    pub fn reset(&mut self, ranges: &[Range<usize>]) {
        assert_eq!(ranges.len(), self.batch.ndim());
        let mut size = 1;
        for (d, r) in ranges.iter().enumerate().rev() {
            self.lo[d] = r.start;
            self.extent[d] = r.end.saturating_sub(r.start);
            self.inner[d] = size;
            size *= self.extent[d];
        }
        self.pos = 0;
        self.end = size;
        self.fill();
    }

    /// Restart iteration over a linear sub-range of a tensor with the same
    /// number of dims.
    pub fn reset_linear(&mut self, dims: &[usize], range: Range<usize>) {
        assert_eq!(dims.len(), self.batch.ndim());
        let mut size = 1;
        for d in (0..dims.len()).rev() {
            self.lo[d] = 0;
            self.extent[d] = dims[d];
            self.inner[d] = size;
            size *= dims[d];
        }
        assert!(range.end <= size, "range {:?} exceeds size {}", range, size);
        self.pos = range.start;
        self.end = range.end.max(range.start);
        self.fill();
    }

    /// Total number of coordinates remaining, including the current chunk.
    pub fn remaining(&self) -> usize {
        self.end.saturating_sub(self.pos)
    }

    /// Return true once all chunks have been visited.
    pub fn is_done(&self) -> bool {
        self.pos >= self.end
    }

    /// Length of the current chunk.
    pub fn vl(&self) -> usize {
        self.batch.len()
    }

    /// The current chunk.
    pub fn batch(&self) -> &CoordBatch {
        &self.batch
    }

    /// The current chunk, for callers which adjust coordinates in place
    /// before computing offsets.
    pub fn batch_mut(&mut self) -> &mut CoordBatch {
        &mut self.batch
    }

    /// Move to the next chunk.
    pub fn advance(&mut self) {
        self.pos += self.batch.len();
        self.fill();
    }

    /// Return the next chunk, or `None` when iteration is complete.
    ///
    /// The first call returns the chunk prepared when the iterator was
    /// created or reset, later calls advance first.
    pub fn next_batch(&mut self) -> Option<&mut CoordBatch> {
        if self.primed {
            self.primed = false;
        } else {
            self.advance();
        }
        if self.is_done() {
            None
        } else {
            Some(&mut self.batch)
        }
    }

    /// Compute the coordinates of the chunk starting at `pos`.
    fn fill(&mut self) {
        self.primed = true;
        let vl = self.chunk_len.min(self.remaining());
        self.batch.set_len(vl);
        self.batch.start = self.pos;

        let pos = self.pos;
        for d in 0..self.batch.ndim() {
            let (lo, extent, inner) = (self.lo[d], self.extent[d], self.inner[d]);
            for (i, c) in self.batch.column_mut(d).iter_mut().enumerate() {
                *c = lo + ((pos + i) / inner) % extent;
            }
        }
    }
}

/// Return the number of coordinates in a box of per-dim ranges.
pub fn range_volume(ranges: &[Range<usize>]) -> usize {
    ranges.iter().map(|r| r.len()).product()
}

/// Per-dim ranges covering a whole tensor.
pub fn full_ranges(dims: &[usize]) -> SmallVec<[Range<usize>; MAX_DIMS]> {
    dims.iter().map(|&d| 0..d).collect()
}
