use smallvec::SmallVec;
use vkern_layout::{DataType, Element, MemoryDesc};

use crate::operator::OpError;
use crate::scratchpad::Scratchpad;

/// Names of primitive arguments.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Arg {
    Src,
    Dst,
    Weights,
    Bias,
    Mean,
    Variance,
    ScaleShift,
    Workspace,
    DiffDst,
    DiffSrc,
    DiffWeights,
    DiffBias,
    DiffScaleShift,
}

/// Borrowed input buffer of any supported element type.
#[derive(Copy, Clone, Debug)]
pub enum TensorRef<'a> {
    F32(&'a [f32]),
    S32(&'a [i32]),
    S8(&'a [i8]),
    U8(&'a [u8]),
}

/// Borrowed output buffer of any supported element type.
#[derive(Debug)]
pub enum TensorMut<'a> {
    F32(&'a mut [f32]),
    S32(&'a mut [i32]),
    S8(&'a mut [i8]),
    U8(&'a mut [u8]),
}

impl TensorRef<'_> {
    pub fn data_type(&self) -> DataType {
        match self {
            TensorRef::F32(_) => DataType::F32,
            TensorRef::S32(_) => DataType::S32,
            TensorRef::S8(_) => DataType::S8,
            TensorRef::U8(_) => DataType::U8,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            TensorRef::F32(x) => x.len(),
            TensorRef::S32(x) => x.len(),
            TensorRef::S8(x) => x.len(),
            TensorRef::U8(x) => x.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read element `offset` converted to `f32`.
    #[inline]
    pub fn get_f32(&self, offset: usize) -> f32 {
        match self {
            TensorRef::F32(x) => x[offset],
            TensorRef::S32(x) => x[offset] as f32,
            TensorRef::S8(x) => x[offset] as f32,
            TensorRef::U8(x) => x[offset] as f32,
        }
    }
}

impl TensorMut<'_> {
    pub fn data_type(&self) -> DataType {
        match self {
            TensorMut::F32(_) => DataType::F32,
            TensorMut::S32(_) => DataType::S32,
            TensorMut::S8(_) => DataType::S8,
            TensorMut::U8(_) => DataType::U8,
        }
    }
}

/// Element types which can be passed in an [`ExecCtx`].
pub trait BufferElement: Element {
    fn wrap(data: &[Self]) -> TensorRef<'_>;
    fn wrap_mut(data: &mut [Self]) -> TensorMut<'_>;
    fn unwrap(buf: TensorRef<'_>) -> Option<&[Self]>;
    fn unwrap_mut(buf: TensorMut<'_>) -> Option<&mut [Self]>;
}

macro_rules! impl_buffer_element {
    ($type:ty, $variant:ident) => {
        impl BufferElement for $type {
            fn wrap(data: &[Self]) -> TensorRef<'_> {
                TensorRef::$variant(data)
            }

            fn wrap_mut(data: &mut [Self]) -> TensorMut<'_> {
                TensorMut::$variant(data)
            }

            fn unwrap(buf: TensorRef<'_>) -> Option<&[Self]> {
                match buf {
                    TensorRef::$variant(data) => Some(data),
                    _ => None,
                }
            }

            fn unwrap_mut(buf: TensorMut<'_>) -> Option<&mut [Self]> {
                match buf {
                    TensorMut::$variant(data) => Some(data),
                    _ => None,
                }
            }
        }

        impl<'a> From<&'a [$type]> for TensorRef<'a> {
            fn from(data: &'a [$type]) -> Self {
                TensorRef::$variant(data)
            }
        }

        impl<'a> From<&'a Vec<$type>> for TensorRef<'a> {
            fn from(data: &'a Vec<$type>) -> Self {
                TensorRef::$variant(data)
            }
        }

        impl<'a> From<&'a mut [$type]> for TensorMut<'a> {
            fn from(data: &'a mut [$type]) -> Self {
                TensorMut::$variant(data)
            }
        }

        impl<'a> From<&'a mut Vec<$type>> for TensorMut<'a> {
            fn from(data: &'a mut Vec<$type>) -> Self {
                TensorMut::$variant(data)
            }
        }
    };
}

impl_buffer_element!(f32, F32);
impl_buffer_element!(i32, S32);
impl_buffer_element!(i8, S8);
impl_buffer_element!(u8, U8);

/// Buffers and scratch space for one execution of a primitive.
///
/// The context borrows all buffers for the duration of the call. Outputs
/// are moved out of the context by the primitive when it runs, so a context
/// is used for a single call.
///
/// ```
/// use vkern::{Arg, ExecCtx};
///
/// let src = vec![1f32, 2., 3.];
/// let mut dst = vec![0f32; 3];
/// let ctx = ExecCtx::new()
///     .with_input(Arg::Src, &src)
///     .with_output(Arg::Dst, &mut dst);
/// # drop(ctx);
/// ```
#[derive(Debug, Default)]
pub struct ExecCtx<'a> {
    inputs: SmallVec<[(Arg, TensorRef<'a>); 6]>,
    outputs: SmallVec<[(Arg, Option<TensorMut<'a>>); 3]>,
    scratchpad: Option<&'a mut Scratchpad>,
}

impl<'a> ExecCtx<'a> {
    pub fn new() -> ExecCtx<'a> {
        ExecCtx::default()
    }

    /// Add an input buffer.
    pub fn with_input(mut self, arg: Arg, buf: impl Into<TensorRef<'a>>) -> Self {
        self.inputs.retain(|(a, _)| *a != arg);
        self.inputs.push((arg, buf.into()));
        self
    }

    /// Add an output buffer.
    pub fn with_output(mut self, arg: Arg, buf: impl Into<TensorMut<'a>>) -> Self {
        self.outputs.retain(|(a, _)| *a != arg);
        self.outputs.push((arg, Some(buf.into())));
        self
    }

    /// Set the scratchpad. It must have been reserved for the primitive's
    /// [`scratchpad_registry`](crate::Primitive::scratchpad_registry).
    pub fn with_scratchpad(mut self, scratchpad: &'a mut Scratchpad) -> Self {
        self.scratchpad = Some(scratchpad);
        self
    }

    /// Return the input `arg`, if present.
    pub fn optional_input(&self, arg: Arg) -> Option<TensorRef<'a>> {
        self.inputs
            .iter()
            .find(|(a, _)| *a == arg)
            .map(|(_, buf)| *buf)
    }

    /// Return the input `arg`, checked against its descriptor.
    pub fn input<T: BufferElement>(&self, arg: Arg, desc: &MemoryDesc) -> Result<&'a [T], OpError> {
        let buf = self.optional_input(arg).ok_or(OpError::MissingInput(arg))?;
        check_type::<T>(arg, desc, buf.data_type())?;
        let data = T::unwrap(buf).ok_or(OpError::TypeMismatch(arg))?;
        if data.len() < desc.size() {
            return Err(OpError::BufferTooShort(arg));
        }
        Ok(data)
    }

    /// Return true if the output `arg` is present and has not been taken.
    pub fn has_output(&self, arg: Arg) -> bool {
        self.outputs
            .iter()
            .any(|(a, buf)| *a == arg && buf.is_some())
    }

    /// Move the output `arg` out of the context, checked against its
    /// descriptor.
    pub fn take_output<T: BufferElement>(
        &mut self,
        arg: Arg,
        desc: &MemoryDesc,
    ) -> Result<&'a mut [T], OpError> {
        let buf = self
            .outputs
            .iter_mut()
            .find(|(a, _)| *a == arg)
            .and_then(|(_, buf)| buf.take())
            .ok_or(OpError::MissingOutput(arg))?;
        check_type::<T>(arg, desc, buf.data_type())?;
        let data = T::unwrap_mut(buf).ok_or(OpError::TypeMismatch(arg))?;
        if data.len() < desc.size() {
            return Err(OpError::BufferTooShort(arg));
        }
        Ok(data)
    }

    /// Move the scratchpad out of the context.
    pub fn take_scratchpad(&mut self) -> Option<&'a mut Scratchpad> {
        self.scratchpad.take()
    }
}

fn check_type<T: Element>(arg: Arg, desc: &MemoryDesc, buf_type: DataType) -> Result<(), OpError> {
    if buf_type != T::DATA_TYPE || desc.data_type() != T::DATA_TYPE {
        Err(OpError::TypeMismatch(arg))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use vkern_layout::{DataType, FormatTag, MemoryDesc};

    use super::{Arg, ExecCtx, TensorRef};
    use crate::operator::OpError;

    #[test]
    fn test_input_checks() {
        let desc = MemoryDesc::new(&[2, 3], DataType::F32, FormatTag::RowMajor).unwrap();
        let src = vec![0f32; 6];
        let short = vec![0f32; 5];
        let ints = vec![0i8; 6];

        let ctx = ExecCtx::new()
            .with_input(Arg::Src, &src)
            .with_input(Arg::Weights, &short)
            .with_input(Arg::Bias, &ints);

        assert_eq!(ctx.input::<f32>(Arg::Src, &desc).unwrap().len(), 6);
        assert_eq!(
            ctx.input::<f32>(Arg::Weights, &desc),
            Err(OpError::BufferTooShort(Arg::Weights))
        );
        assert_eq!(
            ctx.input::<f32>(Arg::Bias, &desc),
            Err(OpError::TypeMismatch(Arg::Bias))
        );
        assert_eq!(
            ctx.input::<f32>(Arg::DiffDst, &desc),
            Err(OpError::MissingInput(Arg::DiffDst))
        );
        assert!(matches!(ctx.optional_input(Arg::Bias), Some(TensorRef::S8(_))));
    }

    #[test]
    fn test_take_output() {
        let desc = MemoryDesc::new(&[4], DataType::F32, FormatTag::RowMajor).unwrap();
        let mut dst = vec![0f32; 4];
        let mut ctx = ExecCtx::new().with_output(Arg::Dst, &mut dst);

        assert!(ctx.has_output(Arg::Dst));
        let out = ctx.take_output::<f32>(Arg::Dst, &desc).unwrap();
        out[0] = 1.;
        assert!(!ctx.has_output(Arg::Dst));
        assert_eq!(
            ctx.take_output::<f32>(Arg::Dst, &desc),
            Err(OpError::MissingOutput(Arg::Dst))
        );
        drop(ctx);
        assert_eq!(dst[0], 1.);
    }
}
