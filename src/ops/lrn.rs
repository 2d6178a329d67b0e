//! Local response normalization.
//!
//! The forward pass computes, for each element `x_i`:
//!
//! ```text
//! omega_i = k + alpha / n * sum(x_j^2 for j in window(i))
//! y_i = x_i * omega_i^-beta
//! ```
//!
//! The window spans `local_size` channels centered on `i` (across-channel
//! mode) or a `local_size^s` box of spatial positions at the same channel
//! (within-channel mode, `s` being the number of spatial dims), clipped to
//! the tensor. `n` is the configured window size, even where the window is
//! clipped.
//!
//! Work is split into items of one batch index, spatial position and block
//! of channels. Each thread owns bounded buffers sized when it starts for
//! the largest block plus the overlap ("lap") of neighboring channels that
//! window sums read.

use std::ops::Range;

use smallvec::SmallVec;
use vkern_layout::{CoordChunks, DataType, MemoryDesc, OffsetEngine, OffsetKind, MAX_VL};

use crate::env::force_generic;
use crate::exec_ctx::{Arg, ExecCtx};
use crate::operator::{OpError, Primitive};
use crate::ops::{check_data_type, check_same_dims};
use crate::shared_slice::SharedSliceMut;
use crate::threading::{max_threads, parallel_for_ranges};

/// Upper bound on the channel block size, which bounds the per-thread
/// buffers.
pub const STACK_CHANNELS: usize = 4096;

/// Compute `omega^-beta`, with a faster path for the common `beta = 0.75`.
#[inline]
pub fn fast_negative_powf(omega: f32, beta: f32) -> f32 {
    if beta == 0.75 {
        // omega^(-3/4) = sqrt(1 / (sqrt(omega) * omega))
        (1. / (omega.sqrt() * omega)).sqrt()
    } else {
        1. / omega.powf(beta)
    }
}

fn round_up(x: usize, multiple: usize) -> usize {
    x.div_ceil(multiple) * multiple
}

/// Choose a block size for splitting `channels` into blocks of at most
/// [`STACK_CHANNELS`].
///
/// Channel counts that fit are a single block. Larger counts use full-size
/// blocks unless that would leave a small remainder, in which case the
/// blocks are evened out and rounded up to a multiple of [`MAX_VL`]. The
/// result is at least 1.
pub fn stack_friendly_blksz(channels: usize) -> usize {
    if channels <= STACK_CHANNELS {
        return channels.max(1);
    }
    let n_full = channels / STACK_CHANNELS;
    let rem = channels % STACK_CHANNELS;
    if rem >= STACK_CHANNELS / 4 {
        return STACK_CHANNELS;
    }
    let n_blocks = n_full + (rem != 0) as usize;
    let blksz = channels.div_ceil(n_blocks);
    if blksz < STACK_CHANNELS - MAX_VL {
        round_up(blksz, MAX_VL)
    } else {
        blksz
    }
}

/// Variant of [`stack_friendly_blksz`] for problems where the other work
/// dims (eg. the batch size) alone may not provide enough items to occupy
/// `n_threads` threads.
///
/// The block size is limited so that `other_work * channels / n_threads`
/// channels are available per thread, but not below [`MAX_VL`].
pub fn stack_friendly_blksz_for_work(
    channels: usize,
    other_work: usize,
    n_threads: usize,
) -> usize {
    let per_thread = other_work * channels / n_threads.max(1);
    let limit = round_up(per_thread.max(MAX_VL), MAX_VL).min(STACK_CHANNELS);
    if channels <= limit {
        return channels.max(1);
    }

    let mut blksz = round_up(limit, 32);
    let n_full = channels / limit;
    let rem = channels % limit;
    if rem < MAX_VL / 4 {
        let n_blocks = n_full + (rem != 0) as usize;
        blksz = channels.div_ceil(n_blocks);
        if blksz < limit - MAX_VL {
            blksz = round_up(blksz, MAX_VL);
        }
    }
    round_up(blksz, 32)
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum LrnAlg {
    AcrossChannels,
    WithinChannel,
}

#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LrnParams {
    pub alg: LrnAlg,

    /// Window size along each normalized dim.
    pub local_size: usize,
    pub alpha: f32,
    pub beta: f32,
    pub k: f32,
}

/// How channel offsets are computed.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LrnStrategy {
    /// Closed-form offsets for dense `ncX`, `nXc` and `nCX8c`/`nCX16c`
    /// layouts.
    Formula,

    /// Offsets computed by the offset engine from coordinate batches.
    Generic,
}

/// Tensor shape viewed as `[MB, C, D, H, W]` plus the blocking of channels.
#[derive(Clone, Debug)]
struct LrnGeometry {
    ndim: usize,
    mb: usize,
    channels: usize,

    /// `[D, H, W]`, with 1 for dims the tensor does not have.
    spatial: [usize; 3],

    half: usize,

    /// Divisor of the window sum.
    summands: f32,

    blksz: usize,
    n_blocks: usize,
}

/// One unit of parallel work.
struct LrnItem {
    mb: usize,
    chans: Range<usize>,
    sp: [usize; 3],
}

impl LrnGeometry {
    fn new(desc: &MemoryDesc, params: &LrnParams) -> Result<LrnGeometry, OpError> {
        let dims = desc.dims();
        let ndim = dims.len();
        if !(2..=5).contains(&ndim) {
            return Err(OpError::UnsupportedValue("LRN supports 2 to 5 dims"));
        }
        if params.local_size == 0 {
            return Err(OpError::InvalidValue("local_size must be at least 1"));
        }

        let mut spatial = [1; 3];
        spatial[5 - ndim..].copy_from_slice(&dims[2..]);

        let summands = match params.alg {
            LrnAlg::AcrossChannels => params.local_size,
            LrnAlg::WithinChannel => params.local_size.pow(ndim as u32 - 2),
        } as f32;

        let channels = dims[1];
        let blksz = if ndim == 2 {
            stack_friendly_blksz_for_work(channels, dims[0], max_threads())
        } else {
            stack_friendly_blksz(channels)
        };

        Ok(LrnGeometry {
            ndim,
            mb: dims[0],
            channels,
            spatial,
            half: (params.local_size - 1) / 2,
            summands,
            blksz,
            n_blocks: channels.div_ceil(blksz),
        })
    }

    fn n_items(&self) -> usize {
        self.mb * self.n_blocks * self.spatial.iter().product::<usize>()
    }

    /// Decode a row-major index over `(mb, channel block, d, h, w)`.
    fn item(&self, mut index: usize) -> LrnItem {
        let mut sp = [0; 3];
        for i in (0..3).rev() {
            sp[i] = index % self.spatial[i];
            index /= self.spatial[i];
        }
        let blk = index % self.n_blocks;
        let mb = index / self.n_blocks;
        let clo = blk * self.blksz;
        LrnItem {
            mb,
            chans: clo..(clo + self.blksz).min(self.channels),
            sp,
        }
    }

    /// Number of channels the per-thread buffers must hold: a block plus
    /// the lap on each side read by the backward pass.
    fn capacity(&self) -> usize {
        self.blksz + 4 * self.half + 1
    }

    /// Channels within `lap` window radii of `chans`, clipped to the tensor.
    fn lapped(&self, chans: &Range<usize>, lap: usize) -> Range<usize> {
        chans.start.saturating_sub(lap * self.half)
            ..(chans.end + lap * self.half).min(self.channels)
    }

    /// Window of spatial positions centered at `center`.
    fn spatial_window(&self, center: [usize; 3]) -> [Range<usize>; 3] {
        std::array::from_fn(|i| {
            center[i].saturating_sub(self.half)..(center[i] + self.half + 1).min(self.spatial[i])
        })
    }

    /// Logical coordinate ranges covering channels `chans` at one spatial
    /// position.
    fn ranges(
        &self,
        mb: usize,
        chans: Range<usize>,
        sp: [usize; 3],
    ) -> SmallVec<[Range<usize>; 5]> {
        let mut ranges = SmallVec::new();
        ranges.push(mb..mb + 1);
        ranges.push(chans);
        for &p in &sp[5 - self.ndim..] {
            ranges.push(p..p + 1);
        }
        ranges
    }
}

/// Add `vals[c + l]` to `out[c]` for each `l` in `-half..=half` and each
/// channel `c` covered by `out`, skipping channels `c + l` outside
/// `0..channels`.
///
/// `out[0]` corresponds to channel `out_lo` and `vals[0]` to channel
/// `vals_lo`. `vals` must cover every in-range channel in the windows.
fn accumulate_window(
    out: &mut [f32],
    out_lo: usize,
    vals: &[f32],
    vals_lo: usize,
    half: usize,
    channels: usize,
) {
    let (out_lo, vals_lo) = (out_lo as isize, vals_lo as isize);
    let out_hi = out_lo + out.len() as isize;
    let half = half as isize;
    for l in -half..=half {
        let c_lo = out_lo.max(-l);
        let c_hi = out_hi.min(channels as isize - l);
        for c in c_lo..c_hi {
            out[(c - out_lo) as usize] += vals[(c + l - vals_lo) as usize];
        }
    }
}

/// Computes buffer offsets of runs of channels.
#[derive(Clone, Debug)]
enum ChannelAddr {
    Formula {
        offset0: usize,

        /// Strides of `[MB, C, D, H, W]`, with 0 for missing dims. The
        /// channel stride is that of a block of `block` channels.
        strides: [usize; 5],
        block: usize,
    },
    Generic(OffsetEngine),
}

/// Channel block size of layouts with closed-form channel offsets.
fn formula_block(kind: OffsetKind) -> Option<usize> {
    match kind {
        OffsetKind::RowMajor | OffsetKind::ChannelLast => Some(1),
        OffsetKind::ChannelBlocked { block } if block == 8 || block == 16 => Some(block),
        _ => None,
    }
}

impl ChannelAddr {
    fn new(desc: &MemoryDesc, generic: bool) -> ChannelAddr {
        let engine = OffsetEngine::new(desc);
        let block = match formula_block(engine.kind()) {
            Some(block) if !generic => block,
            _ => return ChannelAddr::Generic(engine),
        };

        let ndim = desc.ndim();
        let mut strides = [0; 5];
        strides[..2].copy_from_slice(&desc.strides()[..2]);
        strides[5 - ndim + 2..].copy_from_slice(&desc.strides()[2..]);
        ChannelAddr::Formula {
            offset0: desc.offset0(),
            strides,
            block,
        }
    }

    /// Write the offsets of channels `chans` at `(mb, sp)` to `out`.
    fn channel_offsets(
        &self,
        geom: &LrnGeometry,
        chunks: &mut CoordChunks,
        mb: usize,
        chans: Range<usize>,
        sp: [usize; 3],
        out: &mut [usize],
    ) {
        debug_assert!(out.len() >= chans.len());
        match self {
            ChannelAddr::Formula {
                offset0,
                strides,
                block,
            } => {
                let base = offset0
                    + mb * strides[0]
                    + sp[0] * strides[2]
                    + sp[1] * strides[3]
                    + sp[2] * strides[4];
                for (off, c) in out.iter_mut().zip(chans) {
                    *off = base + (c / block) * strides[1] + c % block;
                }
            }
            ChannelAddr::Generic(engine) => {
                chunks.reset(&geom.ranges(mb, chans, sp));
                while let Some(batch) = chunks.next_batch() {
                    engine.vector_offset(batch, &mut out[batch.start()..]);
                }
            }
        }
    }
}

/// Per-thread buffers. Each holds up to `capacity` channels.
struct LrnBuffers {
    chunks: CoordChunks,
    off_a: Vec<usize>,
    off_b: Vec<usize>,
    x: Vec<f32>,
    sq: Vec<f32>,
    omega: Vec<f32>,
    dd: Vec<f32>,
    tmp: Vec<f32>,
    acc: Vec<f32>,
}

impl LrnBuffers {
    fn new(geom: &LrnGeometry) -> LrnBuffers {
        let cap = geom.capacity();
        let empty: SmallVec<[Range<usize>; 5]> = (0..geom.ndim).map(|_| 0..0).collect();
        LrnBuffers {
            chunks: CoordChunks::from_ranges(&empty),
            off_a: vec![0; cap],
            off_b: vec![0; cap],
            x: vec![0f32; cap],
            sq: vec![0f32; cap],
            omega: vec![0f32; cap],
            dd: vec![0f32; cap],
            tmp: vec![0f32; cap],
            acc: vec![0f32; cap],
        }
    }
}

/// State shared by the forward and backward primitives.
#[derive(Clone, Debug)]
struct LrnKernel {
    params: LrnParams,
    geom: LrnGeometry,
    strategy: LrnStrategy,

    /// Addressing of the forward input (`src`).
    data: ChannelAddr,

    /// Addressing of the output (`dst` or `diff_dst` / `diff_src`).
    out: ChannelAddr,
}

impl LrnKernel {
    fn new(
        data: &MemoryDesc,
        out: &MemoryDesc,
        params: LrnParams,
        generic: bool,
    ) -> Result<LrnKernel, OpError> {
        check_data_type(data, DataType::F32)?;
        check_data_type(out, DataType::F32)?;
        check_same_dims(data, out, "data and output dims differ")?;
        out.check_writable()?;
        let geom = LrnGeometry::new(data, &params)?;

        let formula = !generic
            && [data, out]
                .iter()
                .all(|desc| formula_block(OffsetEngine::new(desc).kind()).is_some());
        let strategy = if formula {
            LrnStrategy::Formula
        } else {
            LrnStrategy::Generic
        };
        let data = ChannelAddr::new(data, !formula);
        let out = ChannelAddr::new(out, !formula);

        Ok(LrnKernel {
            params,
            geom,
            strategy,
            data,
            out,
        })
    }

    fn omega(&self, window_sum: f32) -> f32 {
        self.params.k + self.params.alpha * window_sum / self.geom.summands
    }

    /// Run `f` for each work item, in parallel, with per-thread buffers.
    fn for_each_item<F>(&self, f: F)
    where
        F: Fn(&mut LrnBuffers, LrnItem) + Send + Sync,
    {
        parallel_for_ranges(self.geom.n_items(), |range| {
            let mut bufs = LrnBuffers::new(&self.geom);
            for index in range {
                f(&mut bufs, self.geom.item(index));
            }
        });
    }

    fn forward(&self, src: &[f32], dst: &SharedSliceMut<f32>) {
        match self.params.alg {
            LrnAlg::AcrossChannels => {
                self.for_each_item(|bufs, item| self.forward_across(bufs, src, dst, item))
            }
            LrnAlg::WithinChannel => {
                self.for_each_item(|bufs, item| self.forward_within(bufs, src, dst, item))
            }
        }
    }

    fn forward_across(
        &self,
        bufs: &mut LrnBuffers,
        src: &[f32],
        dst: &SharedSliceMut<f32>,
        item: LrnItem,
    ) {
        let geom = &self.geom;
        let LrnItem { mb, chans, sp } = item;
        let lapped = geom.lapped(&chans, 1);
        let (span, cspan) = (lapped.len(), chans.len());
        debug_assert!(span <= geom.capacity());

        self.data
            .channel_offsets(geom, &mut bufs.chunks, mb, lapped.clone(), sp, &mut bufs.off_a);
        self.out
            .channel_offsets(geom, &mut bufs.chunks, mb, chans.clone(), sp, &mut bufs.off_b);

        for i in 0..span {
            let x = src[bufs.off_a[i]];
            bufs.x[i] = x;
            bufs.sq[i] = x * x;
        }

        let sum = &mut bufs.acc[..cspan];
        sum.fill(0.);
        accumulate_window(
            sum,
            chans.start,
            &bufs.sq[..span],
            lapped.start,
            geom.half,
            geom.channels,
        );

        let central = chans.start - lapped.start;
        for i in 0..cspan {
            let y = bufs.x[central + i] * fast_negative_powf(self.omega(sum[i]), self.params.beta);
            // Safety: Each output element belongs to exactly one work item.
            unsafe { dst.write(bufs.off_b[i], y) };
        }
    }

    fn forward_within(
        &self,
        bufs: &mut LrnBuffers,
        src: &[f32],
        dst: &SharedSliceMut<f32>,
        item: LrnItem,
    ) {
        let geom = &self.geom;
        let LrnItem { mb, chans, sp } = item;
        let cspan = chans.len();

        bufs.acc[..cspan].fill(0.);
        let [wd, wh, ww] = geom.spatial_window(sp);
        for d in wd {
            for h in wh.clone() {
                for w in ww.clone() {
                    self.data.channel_offsets(
                        geom,
                        &mut bufs.chunks,
                        mb,
                        chans.clone(),
                        [d, h, w],
                        &mut bufs.off_a,
                    );
                    for i in 0..cspan {
                        let x = src[bufs.off_a[i]];
                        bufs.acc[i] += x * x;
                    }
                }
            }
        }

        self.data
            .channel_offsets(geom, &mut bufs.chunks, mb, chans.clone(), sp, &mut bufs.off_a);
        self.out
            .channel_offsets(geom, &mut bufs.chunks, mb, chans, sp, &mut bufs.off_b);
        for i in 0..cspan {
            let omega = self.omega(bufs.acc[i]);
            let y = src[bufs.off_a[i]] * fast_negative_powf(omega, self.params.beta);
            // Safety: Each output element belongs to exactly one work item.
            unsafe { dst.write(bufs.off_b[i], y) };
        }
    }

    fn backward(&self, src: &[f32], diff_dst: &[f32], diff_src: &SharedSliceMut<f32>) {
        match self.params.alg {
            LrnAlg::AcrossChannels => self.for_each_item(|bufs, item| {
                self.backward_across(bufs, src, diff_dst, diff_src, item)
            }),
            LrnAlg::WithinChannel => self.for_each_item(|bufs, item| {
                self.backward_within(bufs, src, diff_dst, diff_src, item)
            }),
        }
    }

    /// Scale factor of the second term of the gradient.
    fn grad_coeff(&self) -> f32 {
        2. * self.params.alpha * self.params.beta / self.geom.summands
    }

    fn backward_across(
        &self,
        bufs: &mut LrnBuffers,
        src: &[f32],
        diff_dst: &[f32],
        diff_src: &SharedSliceMut<f32>,
        item: LrnItem,
    ) {
        let geom = &self.geom;
        let LrnItem { mb, chans, sp } = item;

        // Channels whose window overlaps the block, and the channels their
        // own windows read.
        let js = geom.lapped(&chans, 1);
        let xs = geom.lapped(&chans, 2);
        debug_assert!(xs.len() <= geom.capacity());

        self.data
            .channel_offsets(geom, &mut bufs.chunks, mb, xs.clone(), sp, &mut bufs.off_a);
        for i in 0..xs.len() {
            let x = src[bufs.off_a[i]];
            bufs.x[i] = x;
            bufs.sq[i] = x * x;
        }

        let jspan = js.len();
        let omega = &mut bufs.omega[..jspan];
        omega.fill(0.);
        accumulate_window(
            omega,
            js.start,
            &bufs.sq[..xs.len()],
            xs.start,
            geom.half,
            geom.channels,
        );

        self.out
            .channel_offsets(geom, &mut bufs.chunks, mb, js.clone(), sp, &mut bufs.off_b);
        let j_in_x = js.start - xs.start;
        for j in 0..jspan {
            let om = self.omega(omega[j]);
            let tmp = fast_negative_powf(om, self.params.beta) * diff_dst[bufs.off_b[j]];
            bufs.tmp[j] = tmp;
            bufs.dd[j] = bufs.x[j_in_x + j] * tmp / om;
        }

        let cspan = chans.len();
        let b = &mut bufs.acc[..cspan];
        b.fill(0.);
        accumulate_window(
            b,
            chans.start,
            &bufs.dd[..jspan],
            js.start,
            geom.half,
            geom.channels,
        );

        let i_in_j = chans.start - js.start;
        let i_in_x = chans.start - xs.start;
        let coeff = self.grad_coeff();
        for i in 0..cspan {
            let ds = bufs.tmp[i_in_j + i] - coeff * b[i] * bufs.x[i_in_x + i];
            // Safety: Each output element belongs to exactly one work item.
            unsafe { diff_src.write(bufs.off_b[i_in_j + i], ds) };
        }
    }

    fn backward_within(
        &self,
        bufs: &mut LrnBuffers,
        src: &[f32],
        diff_dst: &[f32],
        diff_src: &SharedSliceMut<f32>,
        item: LrnItem,
    ) {
        let geom = &self.geom;
        let LrnItem { mb, chans, sp } = item;
        let cspan = chans.len();

        // `acc` accumulates B, `tmp` receives A at the central point.
        bufs.acc[..cspan].fill(0.);
        let [pd, ph, pw] = geom.spatial_window(sp);
        for d in pd {
            for h in ph.clone() {
                for w in pw.clone() {
                    let p = [d, h, w];

                    // omega at `p` needs the window sum around `p`.
                    bufs.omega[..cspan].fill(0.);
                    let [wd, wh, ww] = geom.spatial_window(p);
                    for qd in wd {
                        for qh in wh.clone() {
                            for qw in ww.clone() {
                                self.data.channel_offsets(
                                    geom,
                                    &mut bufs.chunks,
                                    mb,
                                    chans.clone(),
                                    [qd, qh, qw],
                                    &mut bufs.off_a,
                                );
                                for i in 0..cspan {
                                    let x = src[bufs.off_a[i]];
                                    bufs.omega[i] += x * x;
                                }
                            }
                        }
                    }

                    self.data.channel_offsets(
                        geom,
                        &mut bufs.chunks,
                        mb,
                        chans.clone(),
                        p,
                        &mut bufs.off_a,
                    );
                    self.out.channel_offsets(
                        geom,
                        &mut bufs.chunks,
                        mb,
                        chans.clone(),
                        p,
                        &mut bufs.off_b,
                    );
                    let is_center = p == sp;
                    for i in 0..cspan {
                        let om = self.omega(bufs.omega[i]);
                        let tmp =
                            fast_negative_powf(om, self.params.beta) * diff_dst[bufs.off_b[i]];
                        bufs.acc[i] += src[bufs.off_a[i]] * tmp / om;
                        if is_center {
                            bufs.tmp[i] = tmp;
                        }
                    }
                }
            }
        }

        self.data
            .channel_offsets(geom, &mut bufs.chunks, mb, chans.clone(), sp, &mut bufs.off_a);
        self.out
            .channel_offsets(geom, &mut bufs.chunks, mb, chans, sp, &mut bufs.off_b);
        let coeff = self.grad_coeff();
        for i in 0..cspan {
            let ds = bufs.tmp[i] - coeff * bufs.acc[i] * src[bufs.off_a[i]];
            // Safety: Each output element belongs to exactly one work item.
            unsafe { diff_src.write(bufs.off_b[i], ds) };
        }
    }
}

fn strategy_name(prefix: &str, strategy: LrnStrategy) -> String {
    let strategy = match strategy {
        LrnStrategy::Formula => "formula",
        LrnStrategy::Generic => "generic",
    };
    format!("{}:{}", prefix, strategy)
}

/// Forward local response normalization.
#[derive(Debug)]
pub struct LrnForward {
    src: MemoryDesc,
    dst: MemoryDesc,
    kernel: LrnKernel,
    name: String,
}

impl LrnForward {
    pub fn new(src: &MemoryDesc, dst: &MemoryDesc, params: LrnParams) -> Result<Self, OpError> {
        Self::with_generic(src, dst, params, force_generic())
    }

    /// Create a primitive, optionally forcing generic offset calculation.
    fn with_generic(
        src: &MemoryDesc,
        dst: &MemoryDesc,
        params: LrnParams,
        generic: bool,
    ) -> Result<Self, OpError> {
        let kernel = LrnKernel::new(src, dst, params, generic)?;
        let name = strategy_name("lrn_fwd", kernel.strategy);
        tracing::debug!(
            name,
            alg = ?params.alg,
            local_size = params.local_size,
            blksz = kernel.geom.blksz,
            "created LRN primitive"
        );
        Ok(LrnForward {
            src: src.clone(),
            dst: dst.clone(),
            kernel,
            name,
        })
    }

    pub fn strategy(&self) -> LrnStrategy {
        self.kernel.strategy
    }

    /// Channel block size.
    pub fn block_size(&self) -> usize {
        self.kernel.geom.blksz
    }
}

impl Primitive for LrnForward {
    fn name(&self) -> &str {
        &self.name
    }

    #[tracing::instrument(level = "trace", skip_all, fields(name = %self.name))]
    fn execute(&self, ctx: &mut ExecCtx) -> Result<(), OpError> {
        let src = ctx.input::<f32>(Arg::Src, &self.src)?;
        let dst = ctx.take_output::<f32>(Arg::Dst, &self.dst)?;
        self.kernel.forward(src, &SharedSliceMut::new(dst));
        Ok(())
    }
}

/// Backward local response normalization.
///
/// Takes the forward input (`Arg::Src`) and the output gradient
/// (`Arg::DiffDst`) and writes the input gradient (`Arg::DiffSrc`).
#[derive(Debug)]
pub struct LrnBackward {
    data: MemoryDesc,
    diff: MemoryDesc,
    kernel: LrnKernel,
    name: String,
}

impl LrnBackward {
    /// Create a backward primitive. `data` describes the forward input and
    /// `diff` describes both gradients.
    pub fn new(data: &MemoryDesc, diff: &MemoryDesc, params: LrnParams) -> Result<Self, OpError> {
        Self::with_generic(data, diff, params, force_generic())
    }

    fn with_generic(
        data: &MemoryDesc,
        diff: &MemoryDesc,
        params: LrnParams,
        generic: bool,
    ) -> Result<Self, OpError> {
        let kernel = LrnKernel::new(data, diff, params, generic)?;
        let name = strategy_name("lrn_bwd", kernel.strategy);
        tracing::debug!(
            name,
            alg = ?params.alg,
            local_size = params.local_size,
            blksz = kernel.geom.blksz,
            "created LRN backward primitive"
        );
        Ok(LrnBackward {
            data: data.clone(),
            diff: diff.clone(),
            kernel,
            name,
        })
    }

    pub fn strategy(&self) -> LrnStrategy {
        self.kernel.strategy
    }

    /// Channel block size.
    pub fn block_size(&self) -> usize {
        self.kernel.geom.blksz
    }
}

impl Primitive for LrnBackward {
    fn name(&self) -> &str {
        &self.name
    }

    #[tracing::instrument(level = "trace", skip_all, fields(name = %self.name))]
    fn execute(&self, ctx: &mut ExecCtx) -> Result<(), OpError> {
        let src = ctx.input::<f32>(Arg::Src, &self.data)?;
        let diff_dst = ctx.input::<f32>(Arg::DiffDst, &self.diff)?;
        let diff_src = ctx.take_output::<f32>(Arg::DiffSrc, &self.diff)?;
        self.kernel
            .backward(src, diff_dst, &SharedSliceMut::new(diff_src));
        Ok(())
    }
}
