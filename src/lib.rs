//! vkern is a library of reference CPU kernels for neural network primitives
//! which operate on tensors in arbitrary memory layouts.
//!
//! A primitive is created once for a fixed problem, described by
//! [`MemoryDesc`]s for each argument plus operator attributes. Creation
//! validates the problem and selects an execution strategy, failing with an
//! [`OpError`] if the problem is not supported. The primitive can then be
//! executed any number of times with an [`ExecCtx`] holding the caller's
//! buffers:
//!
//! ```
//! use vkern::ops::{Softmax, SoftmaxParams};
//! use vkern::{Arg, DataType, ExecCtx, FormatTag, MemoryDesc, Primitive};
//!
//! let desc = MemoryDesc::new(&[1, 3], DataType::F32, FormatTag::RowMajor).unwrap();
//! let softmax = Softmax::new(&desc, &desc, SoftmaxParams::softmax(1)).unwrap();
//!
//! let src = vec![1f32, 2., 3.];
//! let mut dst = vec![0f32; 3];
//! softmax
//!     .execute(
//!         &mut ExecCtx::new()
//!             .with_input(Arg::Src, &src)
//!             .with_output(Arg::Dst, &mut dst),
//!     )
//!     .unwrap();
//! assert!((dst[2] - 0.6652).abs() < 1e-4);
//! ```
//!
//! Work is distributed over a Rayon thread pool, see [`thread_pool`].
//! Primitives which need temporary storage declare it via
//! [`Primitive::scratchpad_registry`] and the caller provides a
//! [`Scratchpad`] in the context.

mod env;
mod exec_ctx;
mod operator;
mod shared_slice;

pub mod ops;
pub mod scratchpad;
pub mod threading;

#[cfg(test)]
mod test_util;

pub use env::{force_generic, FORCE_GENERIC_VAR};
pub use exec_ctx::{Arg, BufferElement, ExecCtx, TensorMut, TensorRef};
pub use operator::{OpError, Primitive};
pub use scratchpad::{Scratchpad, ScratchpadKey, ScratchpadRegistry};
pub use threading::{max_threads, thread_pool, ThreadPool};

pub use vkern_layout::{
    CoordBatch, CoordChunks, DataType, Element, FormatTag, LayoutError, MemoryDesc, OffsetEngine,
    OffsetKind, MAX_VL,
};
