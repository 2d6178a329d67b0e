use smallvec::SmallVec;

use crate::coords::{CoordBatch, MAX_VL};
use crate::desc::{Dims, MemoryDesc, MAX_DIMS};

/// Offset formula selected for a memory descriptor.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OffsetKind {
    /// Dense, unpadded, dims stored outermost-first.
    RowMajor,

    /// Dense, unpadded, channel dim (1) stored innermost.
    ChannelLast,

    /// Dense with only the channel dim blocked, outer dims stored
    /// outermost-first. The channel dim may be padded up to a multiple of
    /// the block.
    ChannelBlocked { block: usize },

    /// Any other unblocked layout: permuted dims, gaps between rows or a
    /// non-zero base offset.
    Strided,

    /// Any other blocked layout, including multiple levels of blocking.
    Blocked,
}

#[derive(Copy, Clone, Debug)]
struct BlockLevel {
    dim: usize,
    size: usize,

    /// Product of the sizes of all more-inner blocks.
    stride: usize,
}

/// Computes buffer offsets of logical coordinates for a memory descriptor.
///
/// The layout is classified once, on construction, into one of the
/// [`OffsetKind`] formulas. The unblocked kinds and the channel-blocked kind
/// are affine in each coordinate (the channel-blocked one after a division
/// by a constant block size), so their batched form is a sequence of
/// branch-free multiply-adds over coordinate columns. The general blocked
/// form first builds per-dim block index columns and then does the same
/// affine combination.
///
/// Coordinates are not bounds checked outside of debug builds.
#[derive(Clone, Debug)]
pub struct OffsetEngine {
    kind: OffsetKind,
    dims: Dims,
    strides: Dims,
    offset0: usize,

    /// Inner block levels, innermost first.
    levels: SmallVec<[BlockLevel; 4]>,
}

impl OffsetEngine {
    pub fn new(desc: &MemoryDesc) -> OffsetEngine {
        let mut levels = SmallVec::<[BlockLevel; 4]>::new();
        let mut stride = 1;
        for blk in desc.inner_blocks().iter().rev() {
            levels.push(BlockLevel {
                dim: blk.dim,
                size: blk.size,
                stride,
            });
            stride *= blk.size;
        }

        OffsetEngine {
            kind: classify(desc),
            dims: desc.dims().into(),
            strides: desc.strides().into(),
            offset0: desc.offset0(),
            levels,
        }
    }

    /// Return the formula this engine uses.
    pub fn kind(&self) -> OffsetKind {
        self.kind
    }

    pub fn ndim(&self) -> usize {
        self.dims.len()
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    /// Return the buffer offset of a single coordinate.
    #[inline]
    pub fn offset(&self, coord: &[usize]) -> usize {
        debug_assert_eq!(coord.len(), self.ndim());
        debug_assert!(coord.iter().zip(&self.dims).all(|(c, d)| c < d));

        match self.kind {
            OffsetKind::RowMajor | OffsetKind::ChannelLast | OffsetKind::Strided => {
                self.offset0 + affine(coord, &self.strides)
            }
            OffsetKind::ChannelBlocked { block } => {
                let c = coord[1];
                let mut offset = self.offset0 + (c / block) * self.strides[1] + c % block;
                for d in (0..self.ndim()).filter(|&d| d != 1) {
                    offset += coord[d] * self.strides[d];
                }
                offset
            }
            OffsetKind::Blocked => {
                let mut pos: Dims = coord.into();
                let mut offset = self.offset0;
                for level in &self.levels {
                    let p = pos[level.dim] % level.size;
                    pos[level.dim] /= level.size;
                    offset += p * level.stride;
                }
                offset + affine(&pos, &self.strides)
            }
        }
    }

    /// Return the buffer offset of the element at row-major linear index
    /// `index` of the logical tensor.
    #[inline]
    pub fn offset_linear(&self, mut index: usize) -> usize {
        let mut coord = [0usize; MAX_DIMS];
        let ndim = self.ndim();
        for d in (0..ndim).rev() {
            coord[d] = index % self.dims[d];
            index /= self.dims[d];
        }
        self.offset(&coord[..ndim])
    }

    /// Compute offsets for every coordinate in `batch`, writing them to the
    /// first `batch.len()` entries of `offsets`.
    ///
    /// The results match [`offset`](Self::offset) element-wise.
    pub fn vector_offset(&self, batch: &CoordBatch, offsets: &mut [usize]) {
        debug_assert_eq!(batch.ndim(), self.ndim());
        let n = batch.len();
        let offsets = &mut offsets[..n];
        offsets.fill(self.offset0);

        match self.kind {
            OffsetKind::RowMajor | OffsetKind::ChannelLast | OffsetKind::Strided => {
                for d in 0..self.ndim() {
                    add_scaled(offsets, batch.column(d), self.strides[d]);
                }
            }
            OffsetKind::ChannelBlocked { block } => {
                for d in 0..self.ndim() {
                    if d == 1 {
                        let stride = self.strides[1];
                        for (off, &c) in offsets.iter_mut().zip(batch.column(1)) {
                            *off += (c / block) * stride + c % block;
                        }
                    } else {
                        add_scaled(offsets, batch.column(d), self.strides[d]);
                    }
                }
            }
            OffsetKind::Blocked => {
                let mut pos = [0usize; MAX_VL];
                for d in 0..self.ndim() {
                    let pos = &mut pos[..n];
                    pos.copy_from_slice(batch.column(d));
                    for level in self.levels.iter().filter(|l| l.dim == d) {
                        for (off, p) in offsets.iter_mut().zip(pos.iter_mut()) {
                            *off += (*p % level.size) * level.stride;
                            *p /= level.size;
                        }
                    }
                    add_scaled(offsets, pos, self.strides[d]);
                }
            }
        }
    }

    /// Compute offsets for a list of row-major linear indices into the
    /// logical tensor.
    ///
    /// `offsets` must be at least as long as `indices`.
    pub fn vector_offset_linear(&self, indices: &[usize], offsets: &mut [usize]) {
        let mut batch = CoordBatch::new(self.ndim());
        for (chunk, out) in indices.chunks(MAX_VL).zip(offsets.chunks_mut(MAX_VL)) {
            batch.fill_from_linear(&self.dims, chunk);
            self.vector_offset(&batch, out);
        }
    }
}

#[inline]
fn affine(coord: &[usize], strides: &[usize]) -> usize {
    coord.iter().zip(strides).map(|(c, s)| c * s).sum()
}

#[inline]
fn add_scaled(offsets: &mut [usize], coords: &[usize], stride: usize) {
    for (off, &c) in offsets.iter_mut().zip(coords) {
        *off += c * stride;
    }
}

fn classify(desc: &MemoryDesc) -> OffsetKind {
    let ndim = desc.ndim();
    let dense = desc.is_dense();

    if desc.is_plain() {
        if dense && !desc.is_padded() {
            let row_major = (0..ndim).all(|d| {
                desc.strides()[d] == desc.padded_dims()[d + 1..].iter().product::<usize>()
            });
            if row_major {
                return OffsetKind::RowMajor;
            }
            if ndim >= 2 {
                let spatial: usize = desc.dims()[2..].iter().product();
                let channels = desc.dim(1);
                let channel_last = desc.strides()[1] == 1
                    && (2..ndim).all(|d| {
                        desc.strides()[d]
                            == channels * desc.dims()[d + 1..].iter().product::<usize>()
                    })
                    && desc.strides()[0] == channels * spatial;
                if channel_last {
                    return OffsetKind::ChannelLast;
                }
            }
        }
        return OffsetKind::Strided;
    }

    if let [blk] = desc.inner_blocks() {
        let only_channel_padded = (0..ndim).all(|d| d == 1 || desc.dims()[d] == desc.padded_dims()[d]);
        if blk.dim == 1 && dense && only_channel_padded {
            // Outer dims must be stored outermost-first.
            let mut stride = blk.size;
            let outer_row_major = (0..ndim).rev().all(|d| {
                let ok = desc.strides()[d] == stride;
                stride *= desc.outer_dim(d);
                ok
            });
            if outer_row_major {
                return OffsetKind::ChannelBlocked { block: blk.size };
            }
        }
    }

    OffsetKind::Blocked
}

#[cfg(test)]
mod tests {
    use vkern_testing::TestCases;

    use super::{OffsetEngine, OffsetKind};
    use crate::{CoordChunks, DataType, FormatTag, MemoryDesc};

    /// Check that the engine agrees with the reference decomposition in
    /// [`MemoryDesc::offset`], in both scalar and batched form.
    fn check_engine(desc: &MemoryDesc) {
        let engine = OffsetEngine::new(desc);
        let mut chunks = CoordChunks::from_ranges(&desc.dims().iter().map(|&d| 0..d).collect::<Vec<_>>())
            .with_chunk_len(37);
        let mut offsets = vec![0; 37];
        let mut count = 0;
        while let Some(batch) = chunks.next_batch() {
            engine.vector_offset(batch, &mut offsets);
            for i in 0..batch.len() {
                let coord = batch.coord(i);
                let expected = desc.offset(&coord);
                assert_eq!(engine.offset(&coord), expected, "coord {:?}", coord);
                assert_eq!(offsets[i], expected, "coord {:?}", coord);
                assert!(expected < desc.size());
            }
            count += batch.len();
        }
        assert_eq!(count, desc.nelems());

        // Linear form.
        let indices: Vec<usize> = (0..desc.nelems()).collect();
        let mut offsets = vec![0; indices.len()];
        engine.vector_offset_linear(&indices, &mut offsets);
        for (&index, &off) in indices.iter().zip(&offsets) {
            assert_eq!(off, desc.offset_linear(index));
            assert_eq!(engine.offset_linear(index), off);
        }
    }

    #[test]
    fn test_offset_engine_kinds() {
        #[derive(Debug)]
        struct Case {
            desc: MemoryDesc,
            kind: OffsetKind,
        }

        let f32 = DataType::F32;
        let cases = [
            Case {
                desc: MemoryDesc::new(&[2, 3, 4], f32, FormatTag::RowMajor).unwrap(),
                kind: OffsetKind::RowMajor,
            },
            Case {
                desc: MemoryDesc::new(&[2, 5, 3, 4], f32, FormatTag::ChannelLast).unwrap(),
                kind: OffsetKind::ChannelLast,
            },
            Case {
                desc: MemoryDesc::new(&[2, 5, 2, 3, 2], f32, FormatTag::ChannelLast).unwrap(),
                kind: OffsetKind::ChannelLast,
            },
            Case {
                desc: MemoryDesc::new(&[2, 10, 3, 3], f32, FormatTag::ChannelBlocked(8)).unwrap(),
                kind: OffsetKind::ChannelBlocked { block: 8 },
            },
            Case {
                desc: MemoryDesc::new(&[1, 17, 2, 2, 2], f32, FormatTag::ChannelBlocked(16))
                    .unwrap(),
                kind: OffsetKind::ChannelBlocked { block: 16 },
            },
            Case {
                desc: MemoryDesc::with_strides(&[3, 4, 5], f32, &[1, 15, 3]).unwrap(),
                kind: OffsetKind::Strided,
            },
            Case {
                desc: MemoryDesc::with_strides(&[3, 4], f32, &[6, 1]).unwrap().with_offset(3),
                kind: OffsetKind::Strided,
            },
            Case {
                desc: MemoryDesc::with_padded_dims(&[2, 3, 4], &[2, 3, 6], f32, FormatTag::RowMajor)
                    .unwrap(),
                kind: OffsetKind::Strided,
            },
            Case {
                desc: MemoryDesc::with_blocking(&[6, 5, 3, 3], f32, &[0, 1, 2, 3], &[
                    (1, 2),
                    (0, 4),
                    (1, 2),
                ])
                .unwrap(),
                kind: OffsetKind::Blocked,
            },
            Case {
                // Channel-blocked with spatial dims stored before channel
                // blocks.
                desc: MemoryDesc::with_blocking(&[2, 12, 3, 2], f32, &[0, 2, 3, 1], &[(1, 4)])
                    .unwrap(),
                kind: OffsetKind::Blocked,
            },
            Case {
                desc: MemoryDesc::new(&[2, 10, 3, 3], f32, FormatTag::ChannelBlocked(8))
                    .unwrap()
                    .with_offset(7),
                kind: OffsetKind::Blocked,
            },
        ];

        cases.test_each(|case| {
            let engine = OffsetEngine::new(&case.desc);
            assert_eq!(engine.kind(), case.kind);
            check_engine(&case.desc);
        });
    }

    #[test]
    fn test_row_major_offset() {
        let desc = MemoryDesc::new(&[2, 3, 4], DataType::F32, FormatTag::RowMajor).unwrap();
        let engine = OffsetEngine::new(&desc);
        assert_eq!(engine.offset(&[1, 2, 3]), 1 * 3 * 4 + 2 * 4 + 3);
    }
}
