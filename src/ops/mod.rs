//! Operator primitives.
//!
//! Each operator has a parameter struct and one or more primitive types
//! implementing [`Primitive`](crate::Primitive). Primitives are created from
//! memory descriptors and parameters, at which point the problem is
//! validated and an execution strategy is chosen.

use vkern_layout::{DataType, FormatTag, MemoryDesc};

use crate::operator::OpError;

mod batch_norm;
mod conv;
mod lrn;
mod post_ops;
mod reorder;
mod softmax;

pub use batch_norm::{BatchNormBackward, BatchNormForward, BatchNormParams};
pub use conv::{
    kernel_window, ConvBackwardData, ConvBackwardWeights, ConvForward, ConvParams, OutputScales,
};
pub use lrn::{
    fast_negative_powf, stack_friendly_blksz, stack_friendly_blksz_for_work, LrnAlg,
    LrnBackward, LrnForward, LrnParams, LrnStrategy, STACK_CHANNELS,
};
pub use post_ops::{eltwise, EltwiseAlg, PostOp, PostOps};
pub use reorder::Reorder;
pub use softmax::{
    Softmax, SoftmaxAlg, SoftmaxBackward, SoftmaxParams, SoftmaxStrategy, MEDIUM,
};

/// Return an error unless `desc` has element type `data_type`.
fn check_data_type(desc: &MemoryDesc, data_type: DataType) -> Result<(), OpError> {
    if desc.data_type() == data_type {
        Ok(())
    } else {
        Err(OpError::UnsupportedType)
    }
}

/// Return an error unless two descriptors have the same logical dims.
fn check_same_dims(a: &MemoryDesc, b: &MemoryDesc, details: &'static str) -> Result<(), OpError> {
    if a.dims() == b.dims() {
        Ok(())
    } else {
        Err(OpError::IncompatibleInputShapes(details))
    }
}

/// Return true if `desc` is dense row-major, ie. a linear index into the
/// logical tensor is also the buffer offset.
fn is_dense_row_major(desc: &MemoryDesc) -> bool {
    desc.matches_tag(FormatTag::RowMajor)
}

/// Product of `dims[range]`.
fn dims_product(dims: &[usize]) -> usize {
    dims.iter().product()
}
