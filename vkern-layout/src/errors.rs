//! Errors reported when constructing memory descriptors.

use std::error::Error;
use std::fmt::{Display, Formatter};

/// Reasons why a [`MemoryDesc`](crate::MemoryDesc) could not be created.
#[derive(Clone, Debug, PartialEq)]
pub enum LayoutError {
    /// The dimension count is zero or exceeds [`MAX_DIMS`](crate::MAX_DIMS).
    TooManyDims,

    /// Dims, padded dims and strides (or a dimension order) have different
    /// lengths.
    DimCountMismatch,

    /// A block refers to a dimension which does not exist, or has size zero.
    InvalidBlocking,

    /// A padded dim is smaller than the logical dim, or not a multiple of the
    /// blocking factor for that dim.
    InvalidPadding,

    /// The format tag cannot describe a tensor of this rank, eg. a
    /// channel-blocked format for a 1D tensor.
    UnsupportedTag,

    /// Distinct coordinates map to the same offset, so the layout cannot be
    /// written to.
    Overlapping,
}

impl Display for LayoutError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            LayoutError::TooManyDims => write!(f, "dim count is zero or too large"),
            LayoutError::DimCountMismatch => write!(f, "dim counts do not match"),
            LayoutError::InvalidBlocking => write!(f, "invalid blocking"),
            LayoutError::InvalidPadding => write!(f, "invalid padding"),
            LayoutError::UnsupportedTag => write!(f, "format tag not valid for rank"),
            LayoutError::Overlapping => write!(f, "layout has overlapping elements"),
        }
    }
}

impl Error for LayoutError {}
