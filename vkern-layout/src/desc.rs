use smallvec::{smallvec, SmallVec};

use crate::data_type::DataType;
use crate::errors::LayoutError;

/// Maximum number of dimensions of a memory descriptor.
pub const MAX_DIMS: usize = 6;

/// Dims, strides or coordinates of a memory descriptor.
pub type Dims = SmallVec<[usize; MAX_DIMS]>;

/// Named memory formats.
///
/// Dimension 0 is the batch (or group/output channel for weights) and
/// dimension 1 is the channel dimension, following the usual `N, C, spatial`
/// convention.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FormatTag {
    /// Format chosen by the primitive. Currently always resolves to
    /// [`FormatTag::RowMajor`].
    Any,

    /// Dims stored outermost-first (`nc`, `ncw`, `nchw`, `ncdhw`, `goihw`).
    RowMajor,

    /// Channel dim stored innermost (`nwc`, `nhwc`, `ndhwc`).
    ChannelLast,

    /// Channel dim split into blocks of the given size, with the block stored
    /// innermost (`nChw8c`, `nChw16c`). The channel count is padded up to a
    /// multiple of the block size.
    ChannelBlocked(usize),
}

/// One level of inner blocking of a dimension.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct InnerBlock {
    pub dim: usize,
    pub size: usize,
}

/// Describes the shape of a tensor and how logical coordinates map to
/// element offsets in its buffer.
///
/// A coordinate `pos` maps to an offset by first splitting off the inner
/// blocks, innermost first (`p = pos[d] % size; pos[d] /= size`, with `p`
/// weighted by the product of all more-inner block sizes), and then adding
/// `pos[d] * strides[d]` for the remaining outer block index of each dim.
/// Unblocked layouts have no inner blocks and `strides` are ordinary
/// element strides.
///
/// A blocked dim is padded to a multiple of its blocking factor. Elements
/// in the padded region exist in the buffer but are not part of the logical
/// tensor.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MemoryDesc {
    data_type: DataType,
    dims: Dims,
    padded_dims: Dims,

    /// Stride of the outer block index of each dim.
    strides: Dims,

    /// Inner blocks, outermost first.
    inner_blocks: SmallVec<[InnerBlock; 4]>,

    /// Offset of the element with coordinate zero.
    offset0: usize,
}

impl MemoryDesc {
    /// Create a descriptor for a tensor with a named format.
    pub fn new(dims: &[usize], data_type: DataType, tag: FormatTag) -> Result<Self, LayoutError> {
        let (order, blocks) = tag_order_and_blocks(dims.len(), tag)?;
        Self::build(dims, None, data_type, &order, &blocks)
    }

    /// Create a descriptor with a named format where dims are padded to
    /// `padded_dims`.
    ///
    /// Padding must be at least the logical size and, for blocked dims, a
    /// multiple of the block size.
    pub fn with_padded_dims(
        dims: &[usize],
        padded_dims: &[usize],
        data_type: DataType,
        tag: FormatTag,
    ) -> Result<Self, LayoutError> {
        let (order, blocks) = tag_order_and_blocks(dims.len(), tag)?;
        Self::build(dims, Some(padded_dims), data_type, &order, &blocks)
    }

    /// Create a descriptor with arbitrary blocking.
    ///
    /// `order` lists the dims from outermost to innermost for the outer block
    /// indices, and `blocks` lists `(dim, size)` inner blocks from outermost
    /// to innermost. For example OIhw8i16o2i weights for a 4D tensor use
    /// `order = [0, 1, 2, 3]` and `blocks = [(1, 8), (0, 16), (1, 2)]`.
    pub fn with_blocking(
        dims: &[usize],
        data_type: DataType,
        order: &[usize],
        blocks: &[(usize, usize)],
    ) -> Result<Self, LayoutError> {
        Self::build(dims, None, data_type, order, blocks)
    }

    /// Create an unblocked descriptor with explicit element strides.
    ///
    /// This covers permuted layouts as well as layouts with gaps between rows
    /// or planes. Strides are not checked for overlap here, since overlapping
    /// layouts (eg. broadcasts with a zero stride) are valid inputs. Use
    /// [`MemoryDesc::check_writable`] before writing through a descriptor.
    pub fn with_strides(
        dims: &[usize],
        data_type: DataType,
        strides: &[usize],
    ) -> Result<Self, LayoutError> {
        check_ndim(dims.len())?;
        if strides.len() != dims.len() {
            return Err(LayoutError::DimCountMismatch);
        }
        Ok(MemoryDesc {
            data_type,
            dims: dims.into(),
            padded_dims: dims.into(),
            strides: strides.into(),
            inner_blocks: SmallVec::new(),
            offset0: 0,
        })
    }

    fn build(
        dims: &[usize],
        padded_dims: Option<&[usize]>,
        data_type: DataType,
        order: &[usize],
        blocks: &[(usize, usize)],
    ) -> Result<Self, LayoutError> {
        let ndim = dims.len();
        check_ndim(ndim)?;

        if order.len() != ndim {
            return Err(LayoutError::DimCountMismatch);
        }
        let is_permutation = (0..ndim).all(|d| order.iter().filter(|&&o| o == d).count() == 1);
        if !is_permutation {
            return Err(LayoutError::InvalidBlocking);
        }
        if blocks.iter().any(|&(dim, size)| dim >= ndim || size == 0) {
            return Err(LayoutError::InvalidBlocking);
        }

        let mut block_prod: Dims = smallvec![1; ndim];
        for &(dim, size) in blocks {
            block_prod[dim] *= size;
        }

        let padded_dims: Dims = match padded_dims {
            Some(padded) if padded.len() != ndim => return Err(LayoutError::DimCountMismatch),
            Some(padded) => padded.into(),
            None => dims
                .iter()
                .zip(&block_prod)
                .map(|(&size, &blk)| size.next_multiple_of(blk))
                .collect(),
        };
        for ((&size, &padded), &blk) in dims.iter().zip(&padded_dims).zip(&block_prod) {
            if padded < size || padded % blk != 0 {
                return Err(LayoutError::InvalidPadding);
            }
        }

        let inner_size: usize = blocks.iter().map(|&(_, size)| size).product();
        let mut strides: Dims = smallvec![0; ndim];
        let mut stride = inner_size;
        for &dim in order.iter().rev() {
            strides[dim] = stride;
            stride *= padded_dims[dim] / block_prod[dim];
        }

        Ok(MemoryDesc {
            data_type,
            dims: dims.into(),
            padded_dims,
            strides,
            inner_blocks: blocks
                .iter()
                .map(|&(dim, size)| InnerBlock { dim, size })
                .collect(),
            offset0: 0,
        })
    }

    /// Return a copy of this descriptor whose elements start at `offset0`
    /// within the buffer.
    pub fn with_offset(mut self, offset0: usize) -> Self {
        self.offset0 = offset0;
        self
    }

    /// Return a copy of this descriptor with a different element type.
    pub fn with_data_type(mut self, data_type: DataType) -> Self {
        self.data_type = data_type;
        self
    }

    pub fn ndim(&self) -> usize {
        self.dims.len()
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    /// Size of dim `dim`.
    pub fn dim(&self, dim: usize) -> usize {
        self.dims[dim]
    }

    pub fn padded_dims(&self) -> &[usize] {
        &self.padded_dims
    }

    /// Strides of the outer block index of each dim. For unblocked layouts
    /// these are ordinary element strides.
    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    pub fn inner_blocks(&self) -> &[InnerBlock] {
        &self.inner_blocks
    }

    pub fn offset0(&self) -> usize {
        self.offset0
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    /// Number of logical elements.
    pub fn nelems(&self) -> usize {
        self.dims.iter().product()
    }

    /// Number of elements including padding.
    pub fn padded_nelems(&self) -> usize {
        self.padded_dims.iter().product()
    }

    /// Return true if there are no inner blocks.
    pub fn is_plain(&self) -> bool {
        self.inner_blocks.is_empty()
    }

    /// Return true if any dim is padded.
    pub fn is_padded(&self) -> bool {
        self.dims != self.padded_dims
    }

    /// Product of block sizes applied to `dim`.
    pub fn block_size(&self, dim: usize) -> usize {
        self.inner_blocks
            .iter()
            .filter(|blk| blk.dim == dim)
            .map(|blk| blk.size)
            .product()
    }

    /// Product of all inner block sizes.
    pub fn inner_size(&self) -> usize {
        self.inner_blocks.iter().map(|blk| blk.size).product()
    }

    /// Number of outer blocks along `dim`.
    pub fn outer_dim(&self, dim: usize) -> usize {
        self.padded_dims[dim] / self.block_size(dim)
    }

    /// Minimum buffer length, in elements, needed to hold every element
    /// (including padding) addressed by this descriptor.
    pub fn size(&self) -> usize {
        if self.padded_dims.contains(&0) {
            return 0;
        }
        let outer_span: usize = (0..self.ndim())
            .map(|d| (self.outer_dim(d) - 1) * self.strides[d])
            .sum();
        self.offset0 + outer_span + self.inner_size()
    }

    /// Return true if the buffer has no gaps, ie. every element of the
    /// buffer (including padding) is addressed by exactly one padded
    /// coordinate.
    pub fn is_dense(&self) -> bool {
        self.offset0 == 0 && self.size() == self.padded_nelems()
    }

    /// Return true if distinct coordinates may map to the same offset.
    ///
    /// This is conservative. After sorting the outer dims by stride, each
    /// stride must step over every offset reachable through the inner blocks
    /// and the dims with smaller strides. Some unusual non-overlapping
    /// strides (eg. dims `[4, 4]` with strides `[3, 4]`) are reported as
    /// overlapping.
    pub fn may_overlap(&self) -> bool {
        if self.padded_dims.contains(&0) {
            return false;
        }

        let mut stride_size: SmallVec<[(usize, usize); MAX_DIMS]> = (0..self.ndim())
            .map(|d| (self.strides[d], self.outer_dim(d)))
            .filter(|&(_, size)| size > 1)
            .collect();
        stride_size.sort_unstable();

        let mut max_offset = self.inner_size() - 1;
        for (stride, size) in stride_size {
            if stride <= max_offset {
                return true;
            }
            max_offset += (size - 1) * stride;
        }
        false
    }

    /// Return an error if the descriptor cannot be used for an output, ie.
    /// if two coordinates may share an offset.
    pub fn check_writable(&self) -> Result<(), LayoutError> {
        if self.may_overlap() {
            Err(LayoutError::Overlapping)
        } else {
            Ok(())
        }
    }

    /// Return true if this descriptor has exactly the layout described by a
    /// named format.
    pub fn matches_tag(&self, tag: FormatTag) -> bool {
        match MemoryDesc::new(&self.dims, self.data_type, tag) {
            Ok(expected) => expected == *self,
            Err(_) => false,
        }
    }

    /// Return the offset of the element at `coord`.
    ///
    /// This is the straightforward decomposition against the blocking
    /// metadata. Kernels use [`OffsetEngine`](crate::OffsetEngine), which
    /// selects a cheaper formula once and has a batched form.
    pub fn offset(&self, coord: &[usize]) -> usize {
        debug_assert_eq!(coord.len(), self.ndim());
        debug_assert!(
            coord.iter().zip(&self.dims).all(|(c, d)| c < d),
            "coord {:?} out of bounds for dims {:?}",
            coord,
            self.dims
        );

        let mut pos: Dims = coord.into();
        let mut offset = self.offset0;
        let mut blk_stride = 1;
        for blk in self.inner_blocks.iter().rev() {
            let p = pos[blk.dim] % blk.size;
            pos[blk.dim] /= blk.size;
            offset += p * blk_stride;
            blk_stride *= blk.size;
        }
        offset
            + pos
                .iter()
                .zip(&self.strides)
                .map(|(p, s)| p * s)
                .sum::<usize>()
    }

    /// Return the offset of the element at the logical row-major `index`.
    pub fn offset_linear(&self, index: usize) -> usize {
        let coord = unravel_index(&self.dims, index);
        self.offset(&coord)
    }
}

/// Convert a row-major linear `index` into a coordinate within `dims`.
pub fn unravel_index(dims: &[usize], mut index: usize) -> Dims {
    let mut coord: Dims = smallvec![0; dims.len()];
    for (c, &size) in coord.iter_mut().zip(dims).rev() {
        *c = index % size;
        index /= size;
    }
    coord
}

fn check_ndim(ndim: usize) -> Result<(), LayoutError> {
    if ndim == 0 || ndim > MAX_DIMS {
        Err(LayoutError::TooManyDims)
    } else {
        Ok(())
    }
}

type Blocks = SmallVec<[(usize, usize); 4]>;

fn tag_order_and_blocks(ndim: usize, tag: FormatTag) -> Result<(Dims, Blocks), LayoutError> {
    check_ndim(ndim)?;
    let row_major: Dims = (0..ndim).collect();
    match tag {
        FormatTag::Any | FormatTag::RowMajor => Ok((row_major, SmallVec::new())),
        FormatTag::ChannelLast if ndim < 2 => Ok((row_major, SmallVec::new())),
        FormatTag::ChannelLast => {
            let order = std::iter::once(0)
                .chain(2..ndim)
                .chain(std::iter::once(1))
                .collect();
            Ok((order, SmallVec::new()))
        }
        FormatTag::ChannelBlocked(_) if ndim < 2 => Err(LayoutError::UnsupportedTag),
        FormatTag::ChannelBlocked(0) => Err(LayoutError::InvalidBlocking),
        FormatTag::ChannelBlocked(block) => Ok((row_major, smallvec![(1, block)])),
    }
}

#[cfg(test)]
mod tests {
    use vkern_testing::TestCases;

    use super::{unravel_index, FormatTag, MemoryDesc};
    use crate::{DataType, LayoutError};

    #[test]
    fn test_row_major_offset() {
        let desc = MemoryDesc::new(&[2, 3, 4], DataType::F32, FormatTag::RowMajor).unwrap();
        assert_eq!(desc.strides(), &[12, 4, 1]);
        assert_eq!(desc.offset(&[1, 2, 3]), 23);
        assert_eq!(desc.offset_linear(23), 23);
        assert!(desc.is_dense());
        assert!(desc.is_plain());
        assert_eq!(desc.size(), 24);
    }

    #[test]
    fn test_channel_last_strides() {
        let desc = MemoryDesc::new(&[2, 3, 4, 5], DataType::F32, FormatTag::ChannelLast).unwrap();
        assert_eq!(desc.strides(), &[60, 1, 15, 3]);
        assert_eq!(desc.offset(&[1, 2, 3, 4]), 60 + 2 + 45 + 12);
        assert!(desc.is_dense());
    }

    #[test]
    fn test_channel_blocked_padding() {
        // nChw8c with 10 channels is padded to 16.
        let desc =
            MemoryDesc::new(&[2, 10, 3, 3], DataType::F32, FormatTag::ChannelBlocked(8)).unwrap();
        assert_eq!(desc.padded_dims(), &[2, 16, 3, 3]);
        assert_eq!(desc.strides(), &[144, 72, 24, 8]);
        assert_eq!(desc.size(), 288);
        assert!(desc.is_dense());
        assert!(desc.is_padded());

        // Channel 9 is in the second block, at position 1 within it.
        assert_eq!(desc.offset(&[0, 9, 0, 0]), 72 + 1);
        assert_eq!(desc.offset(&[1, 9, 2, 1]), 144 + 72 + 2 * 24 + 8 + 1);
    }

    #[test]
    fn test_multi_level_blocking() {
        // OIhw2i4o2i for a 4x4x1x1 tensor.
        let desc =
            MemoryDesc::with_blocking(&[4, 4, 1, 1], DataType::F32, &[0, 1, 2, 3], &[
                (1, 2),
                (0, 4),
                (1, 2),
            ])
            .unwrap();
        assert_eq!(desc.inner_size(), 16);
        assert_eq!(desc.strides(), &[16, 16, 16, 16]);

        // o = 3, i = 3 -> outer i block 0, i block 1 (3 / 2 % 2), o 3, i 1.
        assert_eq!(desc.offset(&[3, 3, 0, 0]), 8 + 3 * 2 + 1);
        assert_eq!(desc.size(), 16);
    }

    #[test]
    fn test_strided_layout() {
        // Row-major with a row pitch larger than the row length.
        let desc = MemoryDesc::with_strides(&[3, 4], DataType::F32, &[6, 1]).unwrap();
        assert_eq!(desc.offset(&[2, 3]), 15);
        assert_eq!(desc.size(), 16);
        assert!(!desc.is_dense());

        let desc = desc.with_offset(5);
        assert_eq!(desc.offset(&[0, 0]), 5);
    }

    #[test]
    fn test_may_overlap() {
        #[derive(Debug)]
        struct Case {
            dims: Vec<usize>,
            strides: Vec<usize>,
            expected: bool,
        }

        let cases = [
            Case {
                dims: vec![64, 512],
                strides: vec![0, 1],
                expected: true,
            },
            Case {
                dims: vec![2, 2],
                strides: vec![1, 1],
                expected: true,
            },
            // Non-overlapping, but not detected as such.
            Case {
                dims: vec![4, 4],
                strides: vec![3, 4],
                expected: true,
            },
            Case {
                dims: vec![3, 4],
                strides: vec![6, 1],
                expected: false,
            },
            Case {
                dims: vec![1, 8, 2, 2],
                strides: vec![32, 1, 16, 8],
                expected: false,
            },
            // Size-1 dims never overlap, whatever their stride.
            Case {
                dims: vec![1, 512],
                strides: vec![0, 1],
                expected: false,
            },
            Case {
                dims: vec![0, 4],
                strides: vec![0, 1],
                expected: false,
            },
        ];

        cases.test_each(|case| {
            let desc = MemoryDesc::with_strides(&case.dims, DataType::F32, &case.strides).unwrap();
            assert_eq!(desc.may_overlap(), case.expected);
            let expected = if case.expected {
                Err(LayoutError::Overlapping)
            } else {
                Ok(())
            };
            assert_eq!(desc.check_writable(), expected);
        });

        let blocked =
            MemoryDesc::new(&[2, 10, 3, 3], DataType::F32, FormatTag::ChannelBlocked(8)).unwrap();
        assert!(!blocked.may_overlap());

        let weights = MemoryDesc::with_blocking(
            &[20, 12, 3, 3],
            DataType::F32,
            &[0, 1, 2, 3],
            &[(1, 8), (0, 16), (1, 2)],
        )
        .unwrap();
        assert!(!weights.may_overlap());
    }

    #[test]
    fn test_matches_tag() {
        let nhwc = MemoryDesc::new(&[1, 8, 2, 2], DataType::F32, FormatTag::ChannelLast).unwrap();
        assert!(nhwc.matches_tag(FormatTag::ChannelLast));
        assert!(!nhwc.matches_tag(FormatTag::RowMajor));

        let permuted = MemoryDesc::with_strides(&[1, 8, 2, 2], DataType::F32, &[32, 1, 16, 8])
            .unwrap();
        assert!(permuted.matches_tag(FormatTag::ChannelLast));
    }

    #[test]
    fn test_invalid_descs() {
        #[derive(Debug)]
        struct Case {
            dims: Vec<usize>,
            tag: FormatTag,
            expected: LayoutError,
        }

        let cases = [
            Case {
                dims: vec![],
                tag: FormatTag::RowMajor,
                expected: LayoutError::TooManyDims,
            },
            Case {
                dims: vec![1; 7],
                tag: FormatTag::RowMajor,
                expected: LayoutError::TooManyDims,
            },
            Case {
                dims: vec![4],
                tag: FormatTag::ChannelBlocked(8),
                expected: LayoutError::UnsupportedTag,
            },
            Case {
                dims: vec![1, 4],
                tag: FormatTag::ChannelBlocked(0),
                expected: LayoutError::InvalidBlocking,
            },
        ];

        cases.test_each(|case| {
            let result = MemoryDesc::new(&case.dims, DataType::F32, case.tag);
            assert_eq!(result, Err(case.expected.clone()));
        });

        let result = MemoryDesc::with_padded_dims(
            &[1, 10, 2, 2],
            &[1, 12, 2, 2],
            DataType::F32,
            FormatTag::ChannelBlocked(8),
        );
        assert_eq!(result, Err(LayoutError::InvalidPadding));
    }

    #[test]
    fn test_unravel_index() {
        assert_eq!(unravel_index(&[2, 3, 4], 23).as_slice(), &[1, 2, 3]);
        assert_eq!(unravel_index(&[2, 3, 4], 0).as_slice(), &[0, 0, 0]);
        assert_eq!(unravel_index(&[5], 3).as_slice(), &[3]);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_serde_round_trip() {
        let desc = MemoryDesc::with_padded_dims(
            &[2, 10, 3, 3],
            &[2, 16, 3, 3],
            DataType::S8,
            FormatTag::ChannelBlocked(8),
        )
        .unwrap();
        let json = serde_json::to_string(&desc).unwrap();
        let parsed: MemoryDesc = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, desc);
        assert_eq!(parsed.offset(&[1, 9, 2, 1]), desc.offset(&[1, 9, 2, 1]));
    }
}
