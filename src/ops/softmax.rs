use rayon::prelude::*;
use vkern_base::iter::range_chunks;
use vkern_layout::{DataType, MemoryDesc, OffsetEngine, MAX_VL};

use crate::env::force_generic;
use crate::exec_ctx::{Arg, ExecCtx};
use crate::operator::{OpError, Primitive};
use crate::ops::{check_data_type, check_same_dims, dims_product, is_dense_row_major};
use crate::scratchpad::{ScratchpadKey, ScratchpadRegistry};
use crate::shared_slice::SharedSliceMut;
use crate::threading::in_pool;

/// Maximum number of channels whose offsets are computed at once by the
/// generic strategy. Slices with at most this many channels compute offsets
/// once and reuse them for every pass over the slice.
pub const MEDIUM: usize = 16 * MAX_VL;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SoftmaxAlg {
    Softmax,
    LogSoftmax,
}

#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SoftmaxParams {
    /// Dim along which values are normalized.
    pub axis: usize,
    pub alg: SoftmaxAlg,
}

impl SoftmaxParams {
    pub fn softmax(axis: usize) -> SoftmaxParams {
        SoftmaxParams {
            axis,
            alg: SoftmaxAlg::Softmax,
        }
    }

    pub fn log_softmax(axis: usize) -> SoftmaxParams {
        SoftmaxParams {
            axis,
            alg: SoftmaxAlg::LogSoftmax,
        }
    }
}

/// Execution strategy of a softmax primitive.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SoftmaxStrategy {
    /// Each outer slice is a contiguous run of channels in every buffer.
    Dense,

    /// Offsets are computed by the offset engine.
    Generic,
}

/// The tensor viewed as `[outer, channels, inner]` around the softmax axis.
#[derive(Copy, Clone, Debug, PartialEq)]
struct SoftmaxShape {
    outer: usize,
    channels: usize,
    inner: usize,
}

impl SoftmaxShape {
    fn new(desc: &MemoryDesc, axis: usize) -> Result<SoftmaxShape, OpError> {
        let dims = desc.dims();
        if axis >= dims.len() {
            return Err(OpError::InvalidValue("axis is out of range"));
        }
        Ok(SoftmaxShape {
            outer: dims_product(&dims[..axis]),
            channels: dims[axis],
            inner: dims_product(&dims[axis + 1..]),
        })
    }

    /// Logical linear index of channel 0 for outer index `ou` and inner
    /// index `inn`.
    fn base_index(&self, ou: usize, inn: usize) -> usize {
        ou * self.channels * self.inner + inn
    }
}

fn choose_strategy(shape: &SoftmaxShape, descs: &[&MemoryDesc]) -> SoftmaxStrategy {
    if !force_generic() && shape.inner == 1 && descs.iter().all(|d| is_dense_row_major(d)) {
        SoftmaxStrategy::Dense
    } else {
        SoftmaxStrategy::Generic
    }
}

/// Buffer offsets for a block of channels of one `(outer, inner)` slice, in
/// two layouts.
///
/// Offsets are only recomputed when a different block is requested, so a
/// slice with at most [`MEDIUM`] channels computes them once.
struct ChannelOffsets {
    indices: Vec<usize>,
    a: Vec<usize>,
    b: Vec<usize>,

    /// `(base_index, c0, len)` of the block currently loaded.
    loaded: Option<(usize, usize, usize)>,
}

impl ChannelOffsets {
    fn new() -> ChannelOffsets {
        ChannelOffsets {
            indices: vec![0; MEDIUM],
            a: vec![0; MEDIUM],
            b: vec![0; MEDIUM],
            loaded: None,
        }
    }

    /// Load offsets of channels `c0..c0 + len` of the slice starting at
    /// logical index `base`, and return `(offsets_in_a, offsets_in_b)`.
    fn load(
        &mut self,
        engine_a: &OffsetEngine,
        engine_b: &OffsetEngine,
        base: usize,
        inner: usize,
        c0: usize,
        len: usize,
    ) -> (&[usize], &[usize]) {
        if self.loaded != Some((base, c0, len)) {
            let indices = &mut self.indices[..len];
            for (c, idx) in indices.iter_mut().enumerate() {
                *idx = base + (c0 + c) * inner;
            }
            engine_a.vector_offset_linear(indices, &mut self.a);
            engine_b.vector_offset_linear(indices, &mut self.b);
            self.loaded = Some((base, c0, len));
        }
        (&self.a[..len], &self.b[..len])
    }
}

/// Iterate over the `(start, len)` blocks of `channels` channels.
fn channel_blocks(channels: usize) -> impl Iterator<Item = (usize, usize)> {
    range_chunks(0..channels, MEDIUM).map(|block| (block.start, block.len()))
}

/// Forward softmax or log-softmax over any layout.
#[derive(Debug)]
pub struct Softmax {
    src: MemoryDesc,
    dst: MemoryDesc,
    alg: SoftmaxAlg,
    shape: SoftmaxShape,
    strategy: SoftmaxStrategy,
    scratchpad: ScratchpadRegistry,
    name: String,
}

impl Softmax {
    pub fn new(
        src: &MemoryDesc,
        dst: &MemoryDesc,
        params: SoftmaxParams,
    ) -> Result<Softmax, OpError> {
        check_data_type(src, DataType::F32)?;
        check_data_type(dst, DataType::F32)?;
        check_same_dims(src, dst, "src and dst dims differ")?;
        dst.check_writable()?;
        let shape = SoftmaxShape::new(src, params.axis)?;
        let strategy = choose_strategy(&shape, &[src, dst]);

        let mut scratchpad = ScratchpadRegistry::new();
        if strategy == SoftmaxStrategy::Generic && shape.inner > 1 {
            scratchpad.book(
                ScratchpadKey::SoftmaxReduction,
                shape.outer * 2 * shape.inner,
            );
        }

        let name = match strategy {
            SoftmaxStrategy::Dense => "softmax_fwd:dense",
            SoftmaxStrategy::Generic => "softmax_fwd:generic",
        };
        tracing::debug!(
            name,
            alg = ?params.alg,
            outer = shape.outer,
            channels = shape.channels,
            inner = shape.inner,
            "created softmax primitive"
        );

        Ok(Softmax {
            src: src.clone(),
            dst: dst.clone(),
            alg: params.alg,
            shape,
            strategy,
            scratchpad,
            name: name.to_string(),
        })
    }

    pub fn strategy(&self) -> SoftmaxStrategy {
        self.strategy
    }

    fn execute_dense(&self, src: &[f32], dst: &mut [f32]) {
        let SoftmaxShape {
            outer, channels, ..
        } = self.shape;
        let alg = self.alg;
        in_pool(|| {
            src[..outer * channels]
                .par_chunks(channels)
                .zip(dst[..outer * channels].par_chunks_mut(channels))
                .for_each(|(src, dst)| {
                    let max = src.iter().fold(f32::MIN, |m, &x| if x > m { x } else { m });
                    let mut denom = 0.;
                    for (y, &x) in dst.iter_mut().zip(src) {
                        let d = x - max;
                        match alg {
                            SoftmaxAlg::Softmax => {
                                *y = d.exp();
                                denom += *y;
                            }
                            SoftmaxAlg::LogSoftmax => {
                                *y = d;
                                denom += d.exp();
                            }
                        }
                    }
                    match alg {
                        SoftmaxAlg::Softmax => {
                            let scale = if denom == 0. { 1. } else { 1. / denom };
                            dst.iter_mut().for_each(|y| *y *= scale);
                        }
                        SoftmaxAlg::LogSoftmax => {
                            let log_denom = denom.ln();
                            dst.iter_mut().for_each(|y| *y -= log_denom);
                        }
                    }
                });
        });
    }

    /// Normalize one `(outer, inner)` slice, storing its max and
    /// denominator in `space_max` and `space_denom`.
    fn normalize_slice(
        &self,
        engines: &(OffsetEngine, OffsetEngine),
        offsets: &mut ChannelOffsets,
        src: &[f32],
        dst: &SharedSliceMut<f32>,
        base: usize,
        space_max: &mut f32,
        space_denom: &mut f32,
    ) {
        let (src_engine, dst_engine) = engines;
        let SoftmaxShape {
            channels, inner, ..
        } = self.shape;

        let mut max = f32::MIN;
        for (c0, len) in channel_blocks(channels) {
            let (src_off, _) = offsets.load(src_engine, dst_engine, base, inner, c0, len);
            for &off in src_off {
                if src[off] > max {
                    max = src[off];
                }
            }
        }

        let mut denom = 0.;
        for (c0, len) in channel_blocks(channels) {
            let (src_off, dst_off) = offsets.load(src_engine, dst_engine, base, inner, c0, len);
            for (&so, &doff) in src_off.iter().zip(dst_off) {
                let d = src[so] - max;
                let y = match self.alg {
                    SoftmaxAlg::Softmax => {
                        let e = d.exp();
                        denom += e;
                        e
                    }
                    SoftmaxAlg::LogSoftmax => {
                        denom += d.exp();
                        d
                    }
                };
                // Safety: Each logical index belongs to one slice, and
                // distinct logical indices have distinct offsets.
                unsafe { dst.write(doff, y) };
            }
        }

        let (scale, shift) = match self.alg {
            SoftmaxAlg::Softmax => (if denom == 0. { 1. } else { 1. / denom }, 0.),
            SoftmaxAlg::LogSoftmax => {
                denom = denom.ln();
                (1., denom)
            }
        };
        *space_max = max;
        *space_denom = denom;

        for (c0, len) in channel_blocks(channels) {
            let (_, dst_off) = offsets.load(src_engine, dst_engine, base, inner, c0, len);
            for &doff in dst_off {
                // Safety: As above.
                unsafe { dst.write(doff, dst.read(doff) * scale - shift) };
            }
        }
    }

    fn execute_generic(
        &self,
        src: &[f32],
        dst: &mut [f32],
        space: Option<&mut [f32]>,
    ) {
        let SoftmaxShape { outer, inner, .. } = self.shape;
        let engines = (OffsetEngine::new(&self.src), OffsetEngine::new(&self.dst));
        let dst = SharedSliceMut::new(dst);

        let base_index = |slice: usize| self.shape.base_index(slice / inner, slice % inner);

        in_pool(|| match space {
            Some(space) => space[..outer * inner * 2]
                .par_chunks_mut(2)
                .enumerate()
                .for_each_init(ChannelOffsets::new, |offsets, (slice, space)| {
                    let [max, denom] = space else {
                        return;
                    };
                    self.normalize_slice(
                        &engines,
                        offsets,
                        src,
                        &dst,
                        base_index(slice),
                        max,
                        denom,
                    );
                }),
            None => (0..outer * inner)
                .into_par_iter()
                .for_each_init(ChannelOffsets::new, |offsets, slice| {
                    let (mut max, mut denom) = (0., 0.);
                    self.normalize_slice(
                        &engines,
                        offsets,
                        src,
                        &dst,
                        base_index(slice),
                        &mut max,
                        &mut denom,
                    );
                }),
        });
    }
}

impl Primitive for Softmax {
    fn name(&self) -> &str {
        &self.name
    }

    fn scratchpad_registry(&self) -> &ScratchpadRegistry {
        &self.scratchpad
    }

    #[tracing::instrument(level = "trace", skip_all, fields(name = %self.name))]
    fn execute(&self, ctx: &mut ExecCtx) -> Result<(), OpError> {
        let src = ctx.input::<f32>(Arg::Src, &self.src)?;
        let dst = ctx.take_output::<f32>(Arg::Dst, &self.dst)?;
        if self.shape.channels == 0 {
            return Ok(());
        }

        match self.strategy {
            SoftmaxStrategy::Dense => self.execute_dense(src, dst),
            SoftmaxStrategy::Generic => {
                let space = if self.shape.inner > 1 {
                    let scratchpad = ctx
                        .take_scratchpad()
                        .ok_or(OpError::MissingScratchpad(ScratchpadKey::SoftmaxReduction))?;
                    Some(scratchpad.get(&self.scratchpad, ScratchpadKey::SoftmaxReduction)?)
                } else {
                    None
                };
                self.execute_generic(src, dst, space);
            }
        }
        Ok(())
    }
}

/// Backward pass of softmax or log-softmax.
///
/// Takes the forward output (`Arg::Dst`) and its gradient (`Arg::DiffDst`)
/// and produces the gradient of the forward input (`Arg::DiffSrc`). The
/// forward output and the gradients may use different layouts.
#[derive(Debug)]
pub struct SoftmaxBackward {
    data: MemoryDesc,
    diff: MemoryDesc,
    alg: SoftmaxAlg,
    shape: SoftmaxShape,
    strategy: SoftmaxStrategy,
    name: String,
}

impl SoftmaxBackward {
    /// Create a backward primitive. `data` describes the forward output and
    /// `diff` describes both `diff_dst` and `diff_src`.
    pub fn new(
        data: &MemoryDesc,
        diff: &MemoryDesc,
        params: SoftmaxParams,
    ) -> Result<SoftmaxBackward, OpError> {
        check_data_type(data, DataType::F32)?;
        check_data_type(diff, DataType::F32)?;
        check_same_dims(data, diff, "data and diff dims differ")?;
        diff.check_writable()?;
        let shape = SoftmaxShape::new(data, params.axis)?;
        let strategy = choose_strategy(&shape, &[data, diff]);

        let name = match strategy {
            SoftmaxStrategy::Dense => "softmax_bwd:dense",
            SoftmaxStrategy::Generic => "softmax_bwd:generic",
        };
        tracing::debug!(
            name,
            alg = ?params.alg,
            outer = shape.outer,
            channels = shape.channels,
            inner = shape.inner,
            "created softmax backward primitive"
        );

        Ok(SoftmaxBackward {
            data: data.clone(),
            diff: diff.clone(),
            alg: params.alg,
            shape,
            strategy,
            name: name.to_string(),
        })
    }

    pub fn strategy(&self) -> SoftmaxStrategy {
        self.strategy
    }

    fn execute_dense(&self, dst: &[f32], diff_dst: &[f32], diff_src: &mut [f32]) {
        let SoftmaxShape {
            outer, channels, ..
        } = self.shape;
        let n = outer * channels;
        let alg = self.alg;
        in_pool(|| {
            diff_src[..n]
                .par_chunks_mut(channels)
                .zip(dst[..n].par_chunks(channels))
                .zip(diff_dst[..n].par_chunks(channels))
                .for_each(|((ds, y), dd)| match alg {
                    SoftmaxAlg::Softmax => {
                        let sbr: f32 = dd.iter().zip(y).map(|(dd, y)| dd * y).sum();
                        for ((ds, y), dd) in ds.iter_mut().zip(y).zip(dd) {
                            *ds = y * (dd - sbr);
                        }
                    }
                    SoftmaxAlg::LogSoftmax => {
                        let sbr: f32 = dd.iter().sum();
                        for ((ds, y), dd) in ds.iter_mut().zip(y).zip(dd) {
                            *ds = dd - y.exp() * sbr;
                        }
                    }
                });
        });
    }

    fn execute_generic(&self, dst: &[f32], diff_dst: &[f32], diff_src: &mut [f32]) {
        let SoftmaxShape {
            outer,
            channels,
            inner,
        } = self.shape;
        let data_engine = OffsetEngine::new(&self.data);
        let diff_engine = OffsetEngine::new(&self.diff);
        let diff_src = SharedSliceMut::new(diff_src);

        in_pool(|| {
            (0..outer * inner)
                .into_par_iter()
                .for_each_init(ChannelOffsets::new, |offsets, ou_in| {
                    let base = self.shape.base_index(ou_in / inner, ou_in % inner);

                    let mut sbr = 0.;
                    for (c0, len) in channel_blocks(channels) {
                        let (data_off, diff_off) =
                            offsets.load(&data_engine, &diff_engine, base, inner, c0, len);
                        for (&yo, &dofs) in data_off.iter().zip(diff_off) {
                            sbr += match self.alg {
                                SoftmaxAlg::Softmax => diff_dst[dofs] * dst[yo],
                                SoftmaxAlg::LogSoftmax => diff_dst[dofs],
                            };
                        }
                    }

                    for (c0, len) in channel_blocks(channels) {
                        let (data_off, diff_off) =
                            offsets.load(&data_engine, &diff_engine, base, inner, c0, len);
                        for (&yo, &dofs) in data_off.iter().zip(diff_off) {
                            let ds = match self.alg {
                                SoftmaxAlg::Softmax => dst[yo] * (diff_dst[dofs] - sbr),
                                SoftmaxAlg::LogSoftmax => diff_dst[dofs] - dst[yo].exp() * sbr,
                            };
                            // Safety: Each logical index belongs to one
                            // `(outer, inner)` slice.
                            unsafe { diff_src.write(dofs, ds) };
                        }
                    }
                });
        });
    }
}

impl Primitive for SoftmaxBackward {
    fn name(&self) -> &str {
        &self.name
    }

    #[tracing::instrument(level = "trace", skip_all, fields(name = %self.name))]
    fn execute(&self, ctx: &mut ExecCtx) -> Result<(), OpError> {
        let dst = ctx.input::<f32>(Arg::Dst, &self.data)?;
        let diff_dst = ctx.input::<f32>(Arg::DiffDst, &self.diff)?;
        let diff_src = ctx.take_output::<f32>(Arg::DiffSrc, &self.diff)?;
        if self.shape.channels == 0 {
            return Ok(());
        }

        match self.strategy {
            SoftmaxStrategy::Dense => self.execute_dense(dst, diff_dst, diff_src),
            SoftmaxStrategy::Generic => self.execute_generic(dst, diff_dst, diff_src),
        }
        Ok(())
    }
}
