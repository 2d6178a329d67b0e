//! Memory layout descriptors and offset calculation for the vkern kernels.
//!
//! A [`MemoryDesc`] describes the logical dims of a tensor together with how
//! its elements are arranged in a flat buffer: plain row-major,
//! channel-last, blocked along one or more dims (eg. `nChw16c`), padded, or
//! with arbitrary strides.
//!
//! Kernels never index buffers with coordinates directly. Instead they build
//! an [`OffsetEngine`] from the descriptor once per call, which picks the
//! cheapest offset formula for the layout, and then either compute single
//! offsets or offsets for a whole [`CoordBatch`] at a time. Batches of
//! coordinates come from a [`CoordChunks`] iterator, which walks a box of
//! coordinates or a linear slice of a tensor in chunks of up to
//! [`MAX_VL`] coordinates:
//!
//! ```
//! use vkern_layout::{CoordChunks, DataType, FormatTag, MemoryDesc, OffsetEngine};
//!
//! let desc = MemoryDesc::new(&[1, 10, 2, 2], DataType::F32, FormatTag::ChannelBlocked(8)).unwrap();
//! let engine = OffsetEngine::new(&desc);
//!
//! let mut offsets = [0; 4];
//! let mut chunks = CoordChunks::from_ranges(&[0..1, 8..10, 1..2, 0..2]);
//! while let Some(batch) = chunks.next_batch() {
//!     engine.vector_offset(batch, &mut offsets);
//! }
//! assert_eq!(offsets, [48, 56, 49, 57]);
//! ```

mod coords;
mod data_type;
mod desc;
mod engine;
mod errors;

pub use coords::{full_ranges, range_volume, CoordBatch, CoordChunks, MAX_VL};
pub use data_type::{DataType, Element};
pub use desc::{unravel_index, Dims, FormatTag, InnerBlock, MemoryDesc, MAX_DIMS};
pub use engine::{OffsetEngine, OffsetKind};
pub use errors::LayoutError;
