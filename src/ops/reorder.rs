use rayon::prelude::*;
use vkern_layout::{CoordChunks, DataType, Element, MemoryDesc, OffsetEngine, MAX_VL};

use crate::env::force_generic;
use crate::exec_ctx::{Arg, BufferElement, ExecCtx};
use crate::operator::{OpError, Primitive};
use crate::ops::check_same_dims;
use crate::shared_slice::SharedSliceMut;
use crate::threading::{in_pool, parallel_for_ranges};

/// How a [`Reorder`] maps source elements to destination elements.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ReorderStrategy {
    /// Source and destination share a dense, unpadded layout and differ at
    /// most in element type. Elements are converted in buffer order.
    Direct,

    /// Offsets of both tensors are computed for each logical coordinate.
    Generic,
}

/// Copy a tensor into a different layout and/or element type.
///
/// Conversions to integer types round to nearest and saturate. Padding of
/// the destination is zero-filled.
#[derive(Debug)]
pub struct Reorder {
    src: MemoryDesc,
    dst: MemoryDesc,
    strategy: ReorderStrategy,
    name: String,
}

impl Reorder {
    pub fn new(src: &MemoryDesc, dst: &MemoryDesc) -> Result<Reorder, OpError> {
        check_same_dims(src, dst, "reorder source and destination dims differ")?;
        dst.check_writable()?;
        if !src.data_type().is_defined() || !dst.data_type().is_defined() {
            return Err(OpError::UnsupportedType);
        }

        let same_layout = src.clone().with_data_type(dst.data_type()) == *dst;
        let strategy = if !force_generic() && same_layout && dst.is_dense() && !dst.is_padded() {
            ReorderStrategy::Direct
        } else {
            ReorderStrategy::Generic
        };

        let name = format!(
            "reorder:{}:{}{}",
            match strategy {
                ReorderStrategy::Direct => "direct",
                ReorderStrategy::Generic => "generic",
            },
            src.data_type(),
            dst.data_type()
        );
        tracing::debug!(name, dims = ?src.dims(), "created reorder primitive");

        Ok(Reorder {
            src: src.clone(),
            dst: dst.clone(),
            strategy,
            name,
        })
    }

    pub fn strategy(&self) -> ReorderStrategy {
        self.strategy
    }

    fn run<S, D, F>(&self, ctx: &mut ExecCtx, convert: F) -> Result<(), OpError>
    where
        S: BufferElement,
        D: BufferElement,
        F: Fn(S) -> D + Send + Sync,
    {
        let src = ctx.input::<S>(Arg::Src, &self.src)?;
        let dst = ctx.take_output::<D>(Arg::Dst, &self.dst)?;

        if self.dst.is_padded() {
            dst[..self.dst.size()].fill(D::default());
        }

        match self.strategy {
            ReorderStrategy::Direct => {
                let len = self.dst.size();
                in_pool(|| {
                    dst[..len]
                        .par_iter_mut()
                        .zip(src[..len].par_iter())
                        .for_each(|(y, &x)| *y = convert(x))
                });
            }
            ReorderStrategy::Generic => self.reorder_generic(src, &SharedSliceMut::new(dst), convert),
        }
        Ok(())
    }

    fn reorder_generic<S, D, F>(&self, src: &[S], dst: &SharedSliceMut<D>, convert: F)
    where
        S: Element,
        D: Element,
        F: Fn(S) -> D + Send + Sync,
    {
        let src_engine = OffsetEngine::new(&self.src);
        let dst_engine = OffsetEngine::new(&self.dst);

        parallel_for_ranges(self.src.nelems(), |range| {
            let mut chunks = CoordChunks::from_linear(self.src.dims(), range);
            let mut src_off = [0; MAX_VL];
            let mut dst_off = [0; MAX_VL];

            while let Some(batch) = chunks.next_batch() {
                let vl = batch.len();
                src_engine.vector_offset(batch, &mut src_off);
                dst_engine.vector_offset(batch, &mut dst_off);
                for (&so, &d_off) in src_off[..vl].iter().zip(&dst_off[..vl]) {
                    // Safety: Each coordinate is visited by one thread, and
                    // output layouts map distinct coordinates to distinct
                    // offsets within the buffer.
                    unsafe { dst.write(d_off, convert(src[so])) };
                }
            }
        });
    }
}

/// Convert between element types via `f32`, saturating integers.
fn saturating_convert<S: Element, D: Element>(x: S) -> D {
    D::saturate_from_f32(x.to_f32())
}

fn identity<T>(x: T) -> T {
    x
}

impl Primitive for Reorder {
    fn name(&self) -> &str {
        &self.name
    }

    #[tracing::instrument(level = "trace", skip_all, fields(name = %self.name))]
    fn execute(&self, ctx: &mut ExecCtx) -> Result<(), OpError> {
        use DataType::{F32, S32, S8, U8};

        match (self.src.data_type(), self.dst.data_type()) {
            (F32, F32) => self.run::<f32, f32, _>(ctx, identity),
            (S32, S32) => self.run::<i32, i32, _>(ctx, identity),
            (S8, S8) => self.run::<i8, i8, _>(ctx, identity),
            (U8, U8) => self.run::<u8, u8, _>(ctx, identity),

            (F32, S32) => self.run::<f32, i32, _>(ctx, saturating_convert),
            (F32, S8) => self.run::<f32, i8, _>(ctx, saturating_convert),
            (F32, U8) => self.run::<f32, u8, _>(ctx, saturating_convert),
            (S32, F32) => self.run::<i32, f32, _>(ctx, saturating_convert),
            (S8, F32) => self.run::<i8, f32, _>(ctx, saturating_convert),
            (U8, F32) => self.run::<u8, f32, _>(ctx, saturating_convert),

            (S32, S8) => self.run::<i32, i8, _>(ctx, |x| x.clamp(-128, 127) as i8),
            (S32, U8) => self.run::<i32, u8, _>(ctx, |x| x.clamp(0, 255) as u8),
            (S8, S32) => self.run::<i8, i32, _>(ctx, i32::from),
            (U8, S32) => self.run::<u8, i32, _>(ctx, i32::from),
            (S8, U8) => self.run::<i8, u8, _>(ctx, |x| x.max(0) as u8),
            (U8, S8) => self.run::<u8, i8, _>(ctx, |x| x.min(127) as i8),

            _ => Err(OpError::UnsupportedType),
        }
    }
}
