//! Reference convolution for tensors in any memory layout.
//!
//! Tensors use the `N, C, spatial` convention. Source and destination are
//! `[MB, G * IC, I...]` and `[MB, G * OC, O...]`. Weights are either grouped,
//! `[G, OC, IC, K...]`, or, when there is a single group, `[OC, IC, K...]`.
//! Up to three spatial dims are supported.
//!
//! The kernels iterate over output coordinates in batches and, for each
//! output element, over the coordinates of the weights which contribute to
//! it. Source coordinates are derived from weight coordinates, so all
//! offsets are computed in batches by the layouts' [`OffsetEngine`]s.

use std::ops::Range;

use smallvec::SmallVec;
use vkern_layout::{CoordBatch, CoordChunks, DataType, MemoryDesc, OffsetEngine, MAX_VL};

use crate::exec_ctx::{Arg, BufferElement, ExecCtx, TensorRef};
use crate::operator::{OpError, Primitive};
use crate::ops::PostOps;
use crate::shared_slice::SharedSliceMut;
use crate::threading::parallel_for_ranges;

mod backward;

pub use backward::{ConvBackwardData, ConvBackwardWeights};

/// Spatial attributes of a convolution, one entry per spatial dim.
type SpatialDims = SmallVec<[usize; 3]>;

/// Scales applied to convolution results before post-ops.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum OutputScales {
    /// One scale for all output channels.
    Common(f32),

    /// One scale per output channel (`G * OC` entries).
    PerChannel(Vec<f32>),
}

impl OutputScales {
    #[inline]
    pub fn get(&self, channel: usize) -> f32 {
        match self {
            OutputScales::Common(scale) => *scale,
            OutputScales::PerChannel(scales) => scales[channel],
        }
    }

    /// Return true if applying the scales is a no-op.
    pub fn is_identity(&self) -> bool {
        match self {
            OutputScales::Common(scale) => *scale == 1.,
            OutputScales::PerChannel(scales) => scales.iter().all(|&s| s == 1.),
        }
    }
}

impl Default for OutputScales {
    fn default() -> Self {
        OutputScales::Common(1.)
    }
}

#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ConvParams {
    pub groups: usize,
    pub strides: SpatialDims,

    /// Distance between kernel taps. 1 is a dense kernel.
    pub dilations: SpatialDims,
    pub pad_begin: SpatialDims,
    pub pad_end: SpatialDims,
    pub output_scales: OutputScales,
    pub post_ops: PostOps,
}

impl ConvParams {
    /// Create parameters for an ungrouped, unpadded, unit-stride convolution
    /// with `n_spatial` spatial dims.
    pub fn new(n_spatial: usize) -> ConvParams {
        ConvParams {
            groups: 1,
            strides: SmallVec::from_elem(1, n_spatial),
            dilations: SmallVec::from_elem(1, n_spatial),
            pad_begin: SmallVec::from_elem(0, n_spatial),
            pad_end: SmallVec::from_elem(0, n_spatial),
            output_scales: OutputScales::default(),
            post_ops: PostOps::new(),
        }
    }
}

/// Return the values of `t` in `0..n` for which `a + b * t` lies in
/// `0..limit`. `b` must be positive.
fn affine_valid_range(a: isize, b: usize, n: usize, limit: usize) -> Range<usize> {
    let b = b as isize;
    let ceil_div = |x: isize| (x + b - 1).div_euclid(b);
    let start = ceil_div(-a).max(0) as usize;
    let end = (ceil_div(limit as isize - a).max(0) as usize).min(n);
    start..end.max(start)
}

/// Return the range of kernel positions which read from inside the input
/// (ie. not from padding) for output position `out`.
///
/// The input position read by kernel position `k` is
/// `out * stride - pad + k * dilation`.
pub fn kernel_window(
    out: usize,
    stride: usize,
    pad: usize,
    dilation: usize,
    kernel: usize,
    input: usize,
) -> Range<usize> {
    affine_valid_range(
        out as isize * stride as isize - pad as isize,
        dilation,
        kernel,
        input,
    )
}

/// Return the range of output positions which read input position
/// `k * dilation - pad + out * stride` from inside the input for kernel
/// position `k`.
fn output_window(
    k: usize,
    stride: usize,
    pad: usize,
    dilation: usize,
    output: usize,
    input: usize,
) -> Range<usize> {
    affine_valid_range(
        k as isize * dilation as isize - pad as isize,
        stride,
        output,
        input,
    )
}

/// Validated shape of a convolution problem.
#[derive(Clone, Debug)]
struct ConvGeometry {
    groups: usize,
    mb: usize,

    /// Input channels per group.
    ic: usize,

    /// Output channels per group.
    oc: usize,

    input: SpatialDims,
    output: SpatialDims,
    kernel: SpatialDims,
    strides: SpatialDims,
    dilations: SpatialDims,
    pad_begin: SpatialDims,

    /// True if weights have a leading groups dim.
    grouped: bool,
}

impl ConvGeometry {
    fn new(
        src: &MemoryDesc,
        weights: &MemoryDesc,
        dst: &MemoryDesc,
        params: &ConvParams,
    ) -> Result<ConvGeometry, OpError> {
        let ndim = src.ndim();
        if !(3..=5).contains(&ndim) {
            return Err(OpError::UnsupportedValue(
                "convolution supports 1 to 3 spatial dims",
            ));
        }
        if dst.ndim() != ndim {
            return Err(OpError::IncompatibleInputShapes(
                "source and destination ranks differ",
            ));
        }
        let n_spatial = ndim - 2;

        if params.groups == 0 {
            return Err(OpError::InvalidValue("groups must be at least 1"));
        }
        let grouped = match weights.ndim() {
            n if n == ndim + 1 => true,
            n if n == ndim && params.groups == 1 => false,
            _ => {
                return Err(OpError::IncompatibleInputShapes(
                    "weights rank does not match source rank and groups",
                ))
            }
        };
        let wdims = weights.dims();
        if grouped && wdims[0] != params.groups {
            return Err(OpError::IncompatibleInputShapes(
                "weights groups dim does not match groups",
            ));
        }
        let wdims = if grouped { &wdims[1..] } else { wdims };
        let (oc, ic) = (wdims[0], wdims[1]);

        if src.dim(1) != params.groups * ic {
            return Err(OpError::IncompatibleInputShapes(
                "source channels do not match weights",
            ));
        }
        if dst.dim(1) != params.groups * oc {
            return Err(OpError::IncompatibleInputShapes(
                "destination channels do not match weights",
            ));
        }
        if dst.dim(0) != src.dim(0) {
            return Err(OpError::IncompatibleInputShapes(
                "source and destination batch sizes differ",
            ));
        }

        let attrs = [
            &params.strides,
            &params.dilations,
            &params.pad_begin,
            &params.pad_end,
        ];
        if attrs.iter().any(|attr| attr.len() != n_spatial) {
            return Err(OpError::InvalidValue(
                "strides, dilations and padding must have one entry per spatial dim",
            ));
        }
        if params.strides.contains(&0) {
            return Err(OpError::InvalidValue("strides must be at least 1"));
        }
        if params.dilations.contains(&0) {
            return Err(OpError::InvalidValue("dilations must be at least 1"));
        }

        let input: SpatialDims = src.dims()[2..].into();
        let kernel: SpatialDims = wdims[2..].into();
        let output: SpatialDims = dst.dims()[2..].into();
        for d in 0..n_spatial {
            let padded = input[d] + params.pad_begin[d] + params.pad_end[d];
            if kernel[d] == 0 {
                return Err(OpError::InvalidValue("kernel size must be at least 1"));
            }
            let dilated = (kernel[d] - 1) * params.dilations[d] + 1;
            if padded < dilated {
                return Err(OpError::IncompatibleInputShapes(
                    "padded input is smaller than the kernel",
                ));
            }
            if output[d] != (padded - dilated) / params.strides[d] + 1 {
                return Err(OpError::IncompatibleInputShapes(
                    "destination size does not match input, kernel and padding",
                ));
            }
        }

        Ok(ConvGeometry {
            groups: params.groups,
            mb: src.dim(0),
            ic,
            oc,
            input,
            output,
            kernel,
            strides: params.strides.clone(),
            dilations: params.dilations.clone(),
            pad_begin: params.pad_begin.clone(),
            grouped,
        })
    }

    fn n_spatial(&self) -> usize {
        self.input.len()
    }

    /// Number of dims of the weights.
    fn weights_ndim(&self) -> usize {
        self.n_spatial() + 2 + self.grouped as usize
    }

    /// Coordinate ranges covering the weights for group `g`, with `oc` and
    /// `ic` ranges given and the kernel ranges given by `kernel_range`.
    fn weight_ranges(
        &self,
        g: usize,
        oc: Range<usize>,
        ic: Range<usize>,
        kernel_range: impl Fn(usize) -> Range<usize>,
    ) -> SmallVec<[Range<usize>; 6]> {
        let mut ranges = SmallVec::new();
        if self.grouped {
            ranges.push(g..g + 1);
        }
        ranges.push(oc);
        ranges.push(ic);
        ranges.extend((0..self.n_spatial()).map(kernel_range));
        ranges
    }

    /// Index of the output channel column in weight coordinates.
    fn oc_col(&self) -> usize {
        self.grouped as usize
    }

    /// Index of the input channel column in weight coordinates.
    fn ic_col(&self) -> usize {
        self.grouped as usize + 1
    }

    /// Index of the first kernel column in weight coordinates.
    fn kernel_col(&self) -> usize {
        self.grouped as usize + 2
    }
}

/// Coordinate ranges which cover nothing, for creating iterators which are
/// reset before use.
fn empty_ranges(ndim: usize) -> SmallVec<[Range<usize>; 6]> {
    (0..ndim).map(|_| 0..0).collect()
}

/// Source and weight element types of a convolution, with the type their
/// products are accumulated in.
trait ConvInput: BufferElement {
    type Acc: Accumulator;

    fn widen(self) -> Self::Acc;
}

trait Accumulator: Copy + Default + Send + Sync {
    fn mul_add(self, a: Self, b: Self) -> Self;
    fn into_f32(self) -> f32;
}

impl Accumulator for f32 {
    #[inline]
    fn mul_add(self, a: f32, b: f32) -> f32 {
        self + a * b
    }

    #[inline]
    fn into_f32(self) -> f32 {
        self
    }
}

impl Accumulator for i32 {
    #[inline]
    fn mul_add(self, a: i32, b: i32) -> i32 {
        self.wrapping_add(a.wrapping_mul(b))
    }

    #[inline]
    fn into_f32(self) -> f32 {
        self as f32
    }
}

impl ConvInput for f32 {
    type Acc = f32;

    #[inline]
    fn widen(self) -> f32 {
        self
    }
}

impl ConvInput for u8 {
    type Acc = i32;

    #[inline]
    fn widen(self) -> i32 {
        self as i32
    }
}

impl ConvInput for i8 {
    type Acc = i32;

    #[inline]
    fn widen(self) -> i32 {
        self as i32
    }
}

/// Return the bias input, checked against its descriptor, or `None` if the
/// descriptor is [`DataType::Undef`].
fn bias_input<'a>(ctx: &ExecCtx<'a>, desc: &MemoryDesc) -> Result<Option<TensorRef<'a>>, OpError> {
    if !desc.data_type().is_defined() {
        return Ok(None);
    }
    let bias = ctx
        .optional_input(Arg::Bias)
        .ok_or(OpError::MissingInput(Arg::Bias))?;
    if bias.data_type() != desc.data_type() {
        return Err(OpError::TypeMismatch(Arg::Bias));
    }
    if bias.len() < desc.size() {
        return Err(OpError::BufferTooShort(Arg::Bias));
    }
    Ok(Some(bias))
}

/// Check a bias descriptor for `channels` output channels.
fn check_bias(bias: &MemoryDesc, channels: usize) -> Result<(), OpError> {
    if !bias.data_type().is_defined() {
        return Ok(());
    }
    if bias.dims() != [channels] {
        return Err(OpError::IncompatibleInputShapes(
            "bias must be a vector with one entry per output channel",
        ));
    }
    Ok(())
}

/// Forward convolution.
///
/// Arguments are `Arg::Src`, `Arg::Weights`, `Arg::Bias` (if the bias
/// descriptor is defined) and `Arg::Dst`. If the post-ops include a sum,
/// `Arg::Dst` must hold the values to accumulate onto.
///
/// Supported data types (source / weights / destination) are
/// `f32 / f32 / f32` and `u8 or s8 / s8 / f32, s32, s8 or u8`. The bias may
/// have any type. Integer products are accumulated in `i32` and the result
/// is converted to the destination type with rounding and saturation.
#[derive(Debug)]
pub struct ConvForward {
    src: MemoryDesc,
    weights: MemoryDesc,
    bias: MemoryDesc,
    dst: MemoryDesc,
    params: ConvParams,
    geom: ConvGeometry,
    name: String,
}

impl ConvForward {
    /// Create a forward convolution. `bias` may be a descriptor with type
    /// [`DataType::Undef`] if there is no bias.
    pub fn new(
        src: &MemoryDesc,
        weights: &MemoryDesc,
        bias: &MemoryDesc,
        dst: &MemoryDesc,
        params: ConvParams,
    ) -> Result<Self, OpError> {
        let geom = ConvGeometry::new(src, weights, dst, &params)?;
        dst.check_writable()?;

        let supported_types = match (src.data_type(), weights.data_type()) {
            (DataType::F32, DataType::F32) => dst.data_type() == DataType::F32,
            (DataType::U8 | DataType::S8, DataType::S8) => matches!(
                dst.data_type(),
                DataType::F32 | DataType::S32 | DataType::S8 | DataType::U8
            ),
            _ => false,
        };
        if !supported_types {
            return Err(OpError::UnsupportedType);
        }

        let channels = geom.groups * geom.oc;
        check_bias(bias, channels)?;
        if let OutputScales::PerChannel(scales) = &params.output_scales {
            if scales.len() != channels {
                return Err(OpError::InvalidValue(
                    "output scales must have 1 entry or one per output channel",
                ));
            }
        }

        let name = format!(
            "conv_fwd:ref:{}{}{}",
            src.data_type(),
            weights.data_type(),
            dst.data_type()
        );
        tracing::debug!(
            name,
            groups = geom.groups,
            ic = geom.ic,
            oc = geom.oc,
            grouped = geom.grouped,
            has_bias = bias.data_type().is_defined(),
            post_ops = params.post_ops.ops().len(),
            "created convolution primitive"
        );

        Ok(ConvForward {
            src: src.clone(),
            weights: weights.clone(),
            bias: bias.clone(),
            dst: dst.clone(),
            params,
            geom,
            name,
        })
    }

    fn run<S, W, D>(&self, ctx: &mut ExecCtx) -> Result<(), OpError>
    where
        S: ConvInput,
        W: ConvInput<Acc = S::Acc>,
        D: BufferElement,
    {
        let src = ctx.input::<S>(Arg::Src, &self.src)?;
        let weights = ctx.input::<W>(Arg::Weights, &self.weights)?;
        let bias = bias_input(ctx, &self.bias)?;
        let dst = ctx.take_output::<D>(Arg::Dst, &self.dst)?;
        self.forward(src, weights, bias, &SharedSliceMut::new(dst));
        Ok(())
    }

    fn forward<S, W, D>(
        &self,
        src: &[S],
        weights: &[W],
        bias: Option<TensorRef>,
        dst: &SharedSliceMut<D>,
    ) where
        S: ConvInput,
        W: ConvInput<Acc = S::Acc>,
        D: BufferElement,
    {
        let geom = &self.geom;
        let src_engine = OffsetEngine::new(&self.src);
        let wei_engine = OffsetEngine::new(&self.weights);
        let dst_engine = OffsetEngine::new(&self.dst);
        let has_sum = self.params.post_ops.has_sum();
        let n_spatial = geom.n_spatial();

        parallel_for_ranges(self.dst.nelems(), |range| {
            let mut dst_chunks = CoordChunks::from_linear(self.dst.dims(), range);
            let mut wei_chunks = CoordChunks::from_ranges(&empty_ranges(geom.weights_ndim()));
            let mut src_batch = CoordBatch::new(self.src.ndim());
            let mut dst_off = [0; MAX_VL];
            let mut wei_off = [0; MAX_VL];
            let mut src_off = [0; MAX_VL];

            while let Some(batch) = dst_chunks.next_batch() {
                dst_engine.vector_offset(batch, &mut dst_off);

                for (i, &off) in dst_off[..batch.len()].iter().enumerate() {
                    let mb = batch.column(0)[i];
                    let channel = batch.column(1)[i];
                    let (g, oc) = (channel / geom.oc, channel % geom.oc);
                    let out: SpatialDims = (0..n_spatial)
                        .map(|d| batch.column(2 + d)[i])
                        .collect();

                    let ranges = geom.weight_ranges(g, oc..oc + 1, 0..geom.ic, |d| {
                        kernel_window(
                            out[d],
                            geom.strides[d],
                            geom.pad_begin[d],
                            geom.dilations[d],
                            geom.kernel[d],
                            geom.input[d],
                        )
                    });
                    wei_chunks.reset(&ranges);

                    let mut acc = S::Acc::default();
                    while let Some(wb) = wei_chunks.next_batch() {
                        let vl = wb.len();
                        wei_engine.vector_offset(wb, &mut wei_off);

                        src_batch.set_len(vl);
                        src_batch.column_mut(0).fill(mb);
                        for (c, &ic) in src_batch
                            .column_mut(1)
                            .iter_mut()
                            .zip(wb.column(geom.ic_col()))
                        {
                            *c = g * geom.ic + ic;
                        }
                        for d in 0..n_spatial {
                            let base = out[d] * geom.strides[d];
                            let (dil, pad) = (geom.dilations[d], geom.pad_begin[d]);
                            for (c, &k) in src_batch
                                .column_mut(2 + d)
                                .iter_mut()
                                .zip(wb.column(geom.kernel_col() + d))
                            {
                                *c = base + k * dil - pad;
                            }
                        }
                        src_engine.vector_offset(&src_batch, &mut src_off);

                        for (&so, &wo) in src_off[..vl].iter().zip(&wei_off[..vl]) {
                            acc = acc.mul_add(src[so].widen(), weights[wo].widen());
                        }
                    }

                    let mut value = acc.into_f32();
                    if let Some(bias) = &bias {
                        value += bias.get_f32(self.bias.offset(&[channel]));
                    }
                    value *= self.params.output_scales.get(channel);
                    if !self.params.post_ops.is_empty() {
                        let prior = if has_sum {
                            // Safety: Each output element belongs to exactly
                            // one thread's range.
                            unsafe { dst.read(off) }.to_f32()
                        } else {
                            0.
                        };
                        value = self.params.post_ops.apply(value, prior);
                    }

                    // Safety: Each output element belongs to exactly one
                    // thread's range.
                    unsafe { dst.write(off, D::saturate_from_f32(value)) };
                }
            }
        });
    }
}

impl Primitive for ConvForward {
    fn name(&self) -> &str {
        &self.name
    }

    #[tracing::instrument(level = "trace", skip_all, fields(name = %self.name))]
    fn execute(&self, ctx: &mut ExecCtx) -> Result<(), OpError> {
        use DataType::{F32, S32, S8, U8};

        match (self.src.data_type(), self.dst.data_type()) {
            (F32, _) => self.run::<f32, f32, f32>(ctx),
            (U8, F32) => self.run::<u8, i8, f32>(ctx),
            (U8, S32) => self.run::<u8, i8, i32>(ctx),
            (U8, S8) => self.run::<u8, i8, i8>(ctx),
            (U8, U8) => self.run::<u8, i8, u8>(ctx),
            (S8, F32) => self.run::<i8, i8, f32>(ctx),
            (S8, S32) => self.run::<i8, i8, i32>(ctx),
            (S8, S8) => self.run::<i8, i8, i8>(ctx),
            (S8, U8) => self.run::<i8, i8, u8>(ctx),
            _ => Err(OpError::UnsupportedType),
        }
    }
}
