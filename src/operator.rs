use std::error::Error;
use std::fmt;
use std::fmt::{Debug, Display};

use vkern_layout::LayoutError;

use crate::exec_ctx::{Arg, ExecCtx};
use crate::scratchpad::{ScratchpadKey, ScratchpadRegistry};

/// Possible reasons why a primitive cannot be created or executed.
///
/// Errors returned when a primitive is created mean that this
/// implementation does not support the problem, and the caller should fall
/// back to another one. Errors returned by [`Primitive::execute`] indicate
/// that the execution context does not match what the primitive was created
/// for. Neither kind is produced by the numeric kernels themselves.
#[derive(Clone, Debug, PartialEq)]
pub enum OpError {
    /// A tensor has an unsupported type.
    UnsupportedType,

    /// A descriptor or attribute has a value that is valid, but not
    /// supported by this implementation.
    UnsupportedValue(&'static str),

    /// Descriptor shapes are not compatible with each other or with the
    /// primitive's attributes.
    IncompatibleInputShapes(&'static str),

    /// An attribute has a value that is incorrect.
    InvalidValue(&'static str),

    /// A memory descriptor could not be constructed.
    InvalidLayout(LayoutError),

    /// A required input buffer was not provided.
    MissingInput(Arg),

    /// A required output buffer was not provided, or was already taken.
    MissingOutput(Arg),

    /// A buffer has a different element type than its descriptor.
    TypeMismatch(Arg),

    /// A buffer is too short for its descriptor.
    BufferTooShort(Arg),

    /// The scratchpad is missing, or has no region for a key.
    MissingScratchpad(ScratchpadKey),

    /// The scratchpad region for a key is shorter than the primitive booked,
    /// eg. because it was reserved for a different primitive.
    ScratchpadTooShort(ScratchpadKey),
}

impl From<LayoutError> for OpError {
    fn from(err: LayoutError) -> OpError {
        OpError::InvalidLayout(err)
    }
}

impl Display for OpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpError::UnsupportedType => write!(f, "unsupported data type"),
            OpError::UnsupportedValue(details) => {
                write!(f, "unsupported input or attribute value: {}", details)
            }
            OpError::IncompatibleInputShapes(details) => {
                write!(f, "incompatible input shapes: {}", details)
            }
            OpError::InvalidValue(details) => {
                write!(f, "input or attribute has invalid value: {}", details)
            }
            OpError::InvalidLayout(err) => write!(f, "invalid layout: {}", err),
            OpError::MissingInput(arg) => write!(f, "missing input {:?}", arg),
            OpError::MissingOutput(arg) => write!(f, "missing output {:?}", arg),
            OpError::TypeMismatch(arg) => write!(f, "buffer type mismatch for {:?}", arg),
            OpError::BufferTooShort(arg) => write!(f, "buffer too short for {:?}", arg),
            OpError::MissingScratchpad(key) => write!(f, "missing scratchpad region {}", key),
            OpError::ScratchpadTooShort(key) => {
                write!(f, "scratchpad region {} is too short", key)
            }
        }
    }
}

impl Error for OpError {}

/// A primitive is an operator specialized for fixed memory descriptors and
/// attributes.
///
/// Primitives are created once, which validates the problem and selects an
/// execution strategy, and can then be executed any number of times,
/// including concurrently from different threads.
pub trait Primitive: Debug + Send + Sync {
    /// Name of the implementation, including the selected strategy.
    fn name(&self) -> &str;

    /// Scratch space the caller must provide via
    /// [`ExecCtx::with_scratchpad`].
    fn scratchpad_registry(&self) -> &ScratchpadRegistry {
        static EMPTY: ScratchpadRegistry = ScratchpadRegistry::new();
        &EMPTY
    }

    /// Run the primitive on the buffers in `ctx`.
    fn execute(&self, ctx: &mut ExecCtx) -> Result<(), OpError>;
}
