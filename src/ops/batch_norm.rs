//! Batch normalization for `ncsp` tensors (`nc`, `ncw`, `nchw`, `ncdhw`).
//!
//! Statistics are per channel, over the batch and spatial dims. Reductions
//! are done in two steps: each thread sums a contiguous range of
//! `(n, c)` rows into its own region of the `BnormReduction` scratchpad,
//! then the per-thread partial sums are added up.

use rayon::prelude::*;
use vkern_base::iter::balanced_range_split;
use vkern_layout::{DataType, FormatTag, MemoryDesc};

use crate::exec_ctx::{Arg, ExecCtx};
use crate::operator::{OpError, Primitive};
use crate::ops::{check_data_type, check_same_dims, dims_product, is_dense_row_major};
use crate::scratchpad::{ScratchpadKey, ScratchpadRegistry};
use crate::threading::{in_pool, max_threads};

#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BatchNormParams {
    pub epsilon: f32,

    /// Use caller-provided mean and variance instead of computing them.
    pub use_global_stats: bool,

    /// Apply a per-channel scale (gamma) and shift (beta), passed as a
    /// `[2, C]` tensor.
    pub use_scale_shift: bool,

    /// Clamp the output at zero. In training, a `u8` workspace records
    /// which outputs were positive for the backward pass.
    pub fuse_norm_relu: bool,

    /// Output the computed mean and variance, and the ReLU workspace.
    pub is_training: bool,
}

impl Default for BatchNormParams {
    fn default() -> Self {
        BatchNormParams {
            epsilon: 1e-5,
            use_global_stats: false,
            use_scale_shift: false,
            fuse_norm_relu: false,
            is_training: false,
        }
    }
}

/// Shape of an `ncsp` tensor viewed as `[N, C, SP]`, plus the descriptors
/// of the per-channel arguments.
#[derive(Clone, Debug)]
struct BnormShape {
    mb: usize,
    channels: usize,
    spatial: usize,

    /// Descriptor of the mean and variance.
    stats: MemoryDesc,

    /// Descriptor of the scale-shift and its gradient.
    scale_shift: MemoryDesc,

    /// Descriptor of the ReLU workspace.
    workspace: MemoryDesc,
}

impl BnormShape {
    fn new(data: &MemoryDesc) -> Result<BnormShape, OpError> {
        check_data_type(data, DataType::F32)?;
        data.check_writable()?;
        let ndim = data.ndim();
        if !(2..=5).contains(&ndim) {
            return Err(OpError::UnsupportedValue(
                "batch normalization supports 2 to 5 dims",
            ));
        }
        if !is_dense_row_major(data) {
            return Err(OpError::UnsupportedValue(
                "batch normalization requires a dense ncsp layout",
            ));
        }

        let channels = data.dim(1);
        Ok(BnormShape {
            mb: data.dim(0),
            channels,
            spatial: dims_product(&data.dims()[2..]),
            stats: MemoryDesc::new(&[channels], DataType::F32, FormatTag::RowMajor)?,
            scale_shift: MemoryDesc::new(&[2, channels], DataType::F32, FormatTag::RowMajor)?,
            workspace: MemoryDesc::new(data.dims(), DataType::U8, FormatTag::RowMajor)?,
        })
    }

    /// Number of `(n, c)` rows.
    fn rows(&self) -> usize {
        self.mb * self.channels
    }

    /// Number of elements each channel's statistics are computed over.
    fn reduce_size(&self) -> f32 {
        (self.mb * self.spatial) as f32
    }

    fn is_empty(&self) -> bool {
        self.rows() == 0 || self.spatial == 0
    }
}

/// Split the rows `0..rows` over threads and call `f(row, part)` for each,
/// where `part` is the calling thread's zero-initialized region of
/// `reduction`, of length `width`.
fn reduce_rows<F>(rows: usize, reduction: &mut [f32], width: usize, f: F)
where
    F: Fn(usize, &mut [f32]) + Send + Sync,
{
    let n_parts = reduction.len() / width;
    in_pool(|| {
        reduction
            .par_chunks_mut(width)
            .enumerate()
            .for_each(|(ithr, part)| {
                part.fill(0.);
                for row in balanced_range_split(rows, n_parts, ithr) {
                    f(row, part);
                }
            })
    });
}

/// Sum entries `offset..offset + out.len()` of each `width`-sized region of
/// `reduction` into `out`, then multiply by `scale`.
fn sum_partials(reduction: &[f32], width: usize, offset: usize, scale: f32, out: &mut [f32]) {
    for (ch, out) in out.iter_mut().enumerate() {
        let sum: f32 = reduction
            .chunks_exact(width)
            .map(|part| part[offset + ch])
            .sum();
        *out = sum * scale;
    }
}

/// Return the scale and shift of `channel`.
#[inline]
fn gamma_beta(scale_shift: Option<&[f32]>, channels: usize, channel: usize) -> (f32, f32) {
    match scale_shift {
        Some(ss) => (ss[channel], ss[channels + channel]),
        None => (1., 0.),
    }
}

/// Forward batch normalization.
///
/// Arguments:
///
/// - `Arg::Src` and output `Arg::Dst`, with the same `ncsp` layout.
/// - `Arg::Mean` and `Arg::Variance`: inputs with global stats, outputs in
///   training, otherwise unused.
/// - `Arg::ScaleShift`: `[2, C]` input if scale-shift is enabled.
/// - `Arg::Workspace`: `u8` output with the same dims as `Arg::Dst`, if
///   ReLU is fused in training.
#[derive(Debug)]
pub struct BatchNormForward {
    data: MemoryDesc,
    params: BatchNormParams,
    shape: BnormShape,
    scratchpad: ScratchpadRegistry,
    name: String,
}

impl BatchNormForward {
    pub fn new(data: &MemoryDesc, params: BatchNormParams) -> Result<Self, OpError> {
        let shape = BnormShape::new(data)?;

        let mut scratchpad = ScratchpadRegistry::new();
        if !params.use_global_stats {
            scratchpad.book(
                ScratchpadKey::BnormReduction,
                shape.channels * max_threads(),
            );
            if !params.is_training {
                scratchpad.book(ScratchpadKey::BnormTmpMean, shape.channels);
                scratchpad.book(ScratchpadKey::BnormTmpVar, shape.channels);
            }
        }

        let name = "bnorm_fwd:ncsp".to_string();
        tracing::debug!(
            name,
            channels = shape.channels,
            spatial = shape.spatial,
            global_stats = params.use_global_stats,
            training = params.is_training,
            relu = params.fuse_norm_relu,
            "created batch normalization primitive"
        );

        Ok(BatchNormForward {
            data: data.clone(),
            params,
            shape,
            scratchpad,
            name,
        })
    }

    /// Descriptor of the ReLU workspace, if this primitive writes one.
    pub fn workspace_desc(&self) -> Option<&MemoryDesc> {
        self.has_workspace().then_some(&self.shape.workspace)
    }

    fn has_workspace(&self) -> bool {
        self.params.fuse_norm_relu && self.params.is_training
    }

    /// Compute per-channel mean and variance of `src`.
    fn compute_stats(&self, src: &[f32], reduction: &mut [f32], mean: &mut [f32], var: &mut [f32]) {
        let shape = &self.shape;
        let (c, sp) = (shape.channels, shape.spatial);
        let scale = 1. / shape.reduce_size();
        let (mean, var) = (&mut mean[..c], &mut var[..c]);

        reduce_rows(shape.rows(), reduction, c, |row, part| {
            part[row % c] += src[row * sp..(row + 1) * sp].iter().sum::<f32>();
        });
        sum_partials(reduction, c, 0, scale, mean);

        let mean = &*mean;
        reduce_rows(shape.rows(), reduction, c, |row, part| {
            let m = mean[row % c];
            part[row % c] += src[row * sp..(row + 1) * sp]
                .iter()
                .map(|&x| (x - m) * (x - m))
                .sum::<f32>();
        });
        sum_partials(reduction, c, 0, scale, var);
    }

    fn normalize(
        &self,
        src: &[f32],
        mean: &[f32],
        var: &[f32],
        scale_shift: Option<&[f32]>,
        dst: &mut [f32],
        workspace: Option<&mut [u8]>,
    ) {
        let (c, sp) = (self.shape.channels, self.shape.spatial);
        let relu = self.params.fuse_norm_relu;
        let eps = self.params.epsilon;

        let normalize_row = |row: usize, y: &mut [f32], ws: Option<&mut [u8]>| {
            let ch = row % c;
            let (gamma, beta) = gamma_beta(scale_shift, c, ch);
            let inv_std = 1. / (var[ch] + eps).sqrt();
            let (alpha, shift) = (gamma * inv_std, beta - gamma * inv_std * mean[ch]);

            let x = &src[row * sp..(row + 1) * sp];
            for (y, &x) in y.iter_mut().zip(x) {
                *y = alpha * x + shift;
                if relu {
                    *y = y.max(0.);
                }
            }
            if let Some(ws) = ws {
                for (ws, &y) in ws.iter_mut().zip(y.iter()) {
                    *ws = (y > 0.) as u8;
                }
            }
        };

        let dst = &mut dst[..self.shape.rows() * sp];
        in_pool(|| match workspace {
            Some(ws) => dst
                .par_chunks_mut(sp)
                .zip(ws[..self.shape.rows() * sp].par_chunks_mut(sp))
                .enumerate()
                .for_each(|(row, (y, ws))| normalize_row(row, y, Some(ws))),
            None => dst
                .par_chunks_mut(sp)
                .enumerate()
                .for_each(|(row, y)| normalize_row(row, y, None)),
        });
    }
}

impl Primitive for BatchNormForward {
    fn name(&self) -> &str {
        &self.name
    }

    fn scratchpad_registry(&self) -> &ScratchpadRegistry {
        &self.scratchpad
    }

    #[tracing::instrument(level = "trace", skip_all, fields(name = %self.name))]
    fn execute(&self, ctx: &mut ExecCtx) -> Result<(), OpError> {
        let shape = &self.shape;
        let src = ctx.input::<f32>(Arg::Src, &self.data)?;
        let scale_shift = if self.params.use_scale_shift {
            Some(ctx.input::<f32>(Arg::ScaleShift, &shape.scale_shift)?)
        } else {
            None
        };
        let dst = ctx.take_output::<f32>(Arg::Dst, &self.data)?;
        let workspace = if self.has_workspace() {
            Some(ctx.take_output::<u8>(Arg::Workspace, &shape.workspace)?)
        } else {
            None
        };

        if self.params.use_global_stats {
            let mean = ctx.input::<f32>(Arg::Mean, &shape.stats)?;
            let var = ctx.input::<f32>(Arg::Variance, &shape.stats)?;
            if !shape.is_empty() {
                self.normalize(src, mean, var, scale_shift, dst, workspace);
            }
            return Ok(());
        }

        let scratchpad = ctx
            .take_scratchpad()
            .ok_or(OpError::MissingScratchpad(ScratchpadKey::BnormReduction))?;

        if self.params.is_training {
            let mean = ctx.take_output::<f32>(Arg::Mean, &shape.stats)?;
            let var = ctx.take_output::<f32>(Arg::Variance, &shape.stats)?;
            let reduction = scratchpad.get(&self.scratchpad, ScratchpadKey::BnormReduction)?;
            if !shape.is_empty() {
                self.compute_stats(src, reduction, mean, var);
                self.normalize(src, mean, var, scale_shift, dst, workspace);
            }
        } else {
            let [reduction, mean, var] = scratchpad.get_many(
                &self.scratchpad,
                [
                    ScratchpadKey::BnormReduction,
                    ScratchpadKey::BnormTmpMean,
                    ScratchpadKey::BnormTmpVar,
                ],
            )?;
            if !shape.is_empty() {
                self.compute_stats(src, reduction, mean, var);
                self.normalize(src, mean, var, scale_shift, dst, workspace);
            }
        }
        Ok(())
    }
}

/// Backward batch normalization.
///
/// Arguments:
///
/// - `Arg::Src`, `Arg::Mean`, `Arg::Variance` from the forward pass.
/// - `Arg::DiffDst` and output `Arg::DiffSrc`.
/// - `Arg::ScaleShift` input and `Arg::DiffScaleShift` output, if
///   scale-shift is enabled.
/// - `Arg::Workspace` from the forward pass, if ReLU is fused.
#[derive(Debug)]
pub struct BatchNormBackward {
    data: MemoryDesc,
    diff: MemoryDesc,
    params: BatchNormParams,
    shape: BnormShape,
    scratchpad: ScratchpadRegistry,
    name: String,
}

impl BatchNormBackward {
    /// Create a backward primitive. `data` describes the forward source and
    /// `diff` both gradients.
    pub fn new(
        data: &MemoryDesc,
        diff: &MemoryDesc,
        params: BatchNormParams,
    ) -> Result<Self, OpError> {
        let shape = BnormShape::new(data)?;
        BnormShape::new(diff)?;
        check_same_dims(data, diff, "data and gradient dims differ")?;

        let mut scratchpad = ScratchpadRegistry::new();
        scratchpad.book(
            ScratchpadKey::BnormReduction,
            2 * shape.channels * max_threads(),
        );
        if !params.use_scale_shift {
            scratchpad.book(ScratchpadKey::BnormTmpDiffScaleShift, 2 * shape.channels);
        }

        let name = "bnorm_bwd:ncsp".to_string();
        tracing::debug!(
            name,
            channels = shape.channels,
            spatial = shape.spatial,
            global_stats = params.use_global_stats,
            relu = params.fuse_norm_relu,
            "created batch normalization backward primitive"
        );

        Ok(BatchNormBackward {
            data: data.clone(),
            diff: diff.clone(),
            params,
            shape,
            scratchpad,
            name,
        })
    }

    /// Compute the gradients. `diff_ss` receives the gradients of the scale
    /// (first `C` entries) and shift (last `C` entries).
    #[allow(clippy::too_many_arguments)]
    fn backward(
        &self,
        src: &[f32],
        mean: &[f32],
        var: &[f32],
        diff_dst: &[f32],
        scale_shift: Option<&[f32]>,
        workspace: Option<&[u8]>,
        diff_src: &mut [f32],
        diff_ss: &mut [f32],
        reduction: &mut [f32],
    ) {
        let shape = &self.shape;
        let (c, sp) = (shape.channels, shape.spatial);
        let eps = self.params.epsilon;

        // Output gradient with the ReLU mask applied.
        let masked = |i: usize| match workspace {
            Some(ws) if ws[i] == 0 => 0.,
            _ => diff_dst[i],
        };

        reduce_rows(shape.rows(), reduction, 2 * c, |row, part| {
            let ch = row % c;
            let m = mean[ch];
            let (mut gamma_sum, mut beta_sum) = (0., 0.);
            for i in row * sp..(row + 1) * sp {
                let dd = masked(i);
                gamma_sum += (src[i] - m) * dd;
                beta_sum += dd;
            }
            part[ch] += gamma_sum;
            part[c + ch] += beta_sum;
        });

        let inv_std: Vec<f32> = var.iter().map(|v| 1. / (v + eps).sqrt()).collect();
        let (diff_gamma, diff_beta) = diff_ss[..2 * c].split_at_mut(c);
        sum_partials(reduction, 2 * c, 0, 1., diff_gamma);
        for (dg, is) in diff_gamma.iter_mut().zip(&inv_std) {
            *dg *= is;
        }
        sum_partials(reduction, 2 * c, c, 1., diff_beta);

        let (diff_gamma, diff_beta) = (&*diff_gamma, &*diff_beta);
        let global_stats = self.params.use_global_stats;
        let size = shape.reduce_size();
        let diff_src = &mut diff_src[..shape.rows() * sp];
        in_pool(|| {
            diff_src
                .par_chunks_mut(sp)
                .enumerate()
                .for_each(|(row, ds)| {
                    let ch = row % c;
                    let (gamma, _) = gamma_beta(scale_shift, c, ch);
                    let (m, is) = (mean[ch], inv_std[ch]);
                    for (j, ds) in ds.iter_mut().enumerate() {
                        let i = row * sp + j;
                        let mut v = masked(i);
                        if !global_stats {
                            v -= diff_beta[ch] / size + (src[i] - m) * is * diff_gamma[ch] / size;
                        }
                        *ds = gamma * is * v;
                    }
                })
        });
    }
}

impl Primitive for BatchNormBackward {
    fn name(&self) -> &str {
        &self.name
    }

    fn scratchpad_registry(&self) -> &ScratchpadRegistry {
        &self.scratchpad
    }

    #[tracing::instrument(level = "trace", skip_all, fields(name = %self.name))]
    fn execute(&self, ctx: &mut ExecCtx) -> Result<(), OpError> {
        let shape = &self.shape;
        let src = ctx.input::<f32>(Arg::Src, &self.data)?;
        let mean = ctx.input::<f32>(Arg::Mean, &shape.stats)?;
        let var = ctx.input::<f32>(Arg::Variance, &shape.stats)?;
        let diff_dst = ctx.input::<f32>(Arg::DiffDst, &self.diff)?;
        let workspace = if self.params.fuse_norm_relu {
            Some(ctx.input::<u8>(Arg::Workspace, &shape.workspace)?)
        } else {
            None
        };
        let diff_src = ctx.take_output::<f32>(Arg::DiffSrc, &self.diff)?;

        let scratchpad = ctx
            .take_scratchpad()
            .ok_or(OpError::MissingScratchpad(ScratchpadKey::BnormReduction))?;

        let (scale_shift, reduction, diff_ss) = if self.params.use_scale_shift {
            let scale_shift = ctx.input::<f32>(Arg::ScaleShift, &shape.scale_shift)?;
            let diff_ss = ctx.take_output::<f32>(Arg::DiffScaleShift, &shape.scale_shift)?;
            let reduction = scratchpad.get(&self.scratchpad, ScratchpadKey::BnormReduction)?;
            (Some(scale_shift), reduction, diff_ss)
        } else {
            let [reduction, diff_ss] = scratchpad.get_many(
                &self.scratchpad,
                [
                    ScratchpadKey::BnormReduction,
                    ScratchpadKey::BnormTmpDiffScaleShift,
                ],
            )?;
            (None, reduction, diff_ss)
        };

        if !shape.is_empty() {
            self.backward(
                src,
                mean,
                var,
                diff_dst,
                scale_shift,
                workspace,
                diff_src,
                diff_ss,
                reduction,
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use vkern_layout::{DataType, FormatTag, LayoutError, MemoryDesc};
    use vkern_testing::TestCases;

    use super::{BatchNormBackward, BatchNormForward, BatchNormParams};
    use crate::exec_ctx::{Arg, ExecCtx};
    use crate::operator::{OpError, Primitive};
    use crate::scratchpad::{Scratchpad, ScratchpadKey};
    use crate::test_util::{expect_equal, expect_equal_with_tolerance, rand_vec};

    /// Per-channel mean and (biased) variance of a `[N, C, SP]` tensor.
    fn reference_stats(x: &[f32], n: usize, c: usize, sp: usize) -> (Vec<f32>, Vec<f32>) {
        let count = (n * sp) as f64;
        let values = |ch: usize| {
            (0..n).flat_map(move |i| {
                let row = i * c + ch;
                x[row * sp..(row + 1) * sp].iter().map(|&v| v as f64)
            })
        };
        let mean: Vec<f64> = (0..c).map(|ch| values(ch).sum::<f64>() / count).collect();
        let var: Vec<f64> = (0..c)
            .map(|ch| values(ch).map(|v| (v - mean[ch]).powi(2)).sum::<f64>() / count)
            .collect();
        (
            mean.iter().map(|&m| m as f32).collect(),
            var.iter().map(|&v| v as f32).collect(),
        )
    }

    fn reference_forward(
        x: &[f32],
        c: usize,
        sp: usize,
        mean: &[f32],
        var: &[f32],
        scale_shift: Option<&[f32]>,
        params: &BatchNormParams,
    ) -> Vec<f32> {
        x.iter()
            .enumerate()
            .map(|(i, &x)| {
                let ch = (i / sp) % c;
                let (gamma, beta) = scale_shift.map(|ss| (ss[ch], ss[c + ch])).unwrap_or((1., 0.));
                let xhat = (x as f64 - mean[ch] as f64) / (var[ch] as f64 + params.epsilon as f64).sqrt();
                let y = (gamma as f64 * xhat + beta as f64) as f32;
                if params.fuse_norm_relu {
                    y.max(0.)
                } else {
                    y
                }
            })
            .collect()
    }

    #[test]
    fn test_batch_norm_forward() {
        #[derive(Debug)]
        struct Case {
            dims: Vec<usize>,
            params: BatchNormParams,
        }

        let mut cases = Vec::new();
        for dims in [vec![3, 4], vec![2, 3, 7], vec![3, 4, 2, 5], vec![2, 2, 2, 3, 2]] {
            for use_scale_shift in [false, true] {
                for is_training in [false, true] {
                    for fuse_norm_relu in [false, true] {
                        cases.push(Case {
                            dims: dims.clone(),
                            params: BatchNormParams {
                                use_scale_shift,
                                is_training,
                                fuse_norm_relu,
                                ..Default::default()
                            },
                        });
                    }
                }
            }
        }

        cases.test_each(|case| {
            let desc = MemoryDesc::new(&case.dims, DataType::F32, FormatTag::RowMajor).unwrap();
            let (n, c) = (case.dims[0], case.dims[1]);
            let sp = desc.nelems() / (n * c);

            let mut rng = fastrand::Rng::with_seed(5);
            let x = rand_vec(&mut rng, desc.nelems(), -3., 5.);
            let ss = rand_vec(&mut rng, 2 * c, 0.5, 1.5);

            let bn = BatchNormForward::new(&desc, case.params).unwrap();
            let mut scratchpad = Scratchpad::for_registry(bn.scratchpad_registry());
            let mut y = vec![0f32; x.len()];
            let mut mean = vec![0f32; c];
            let mut var = vec![0f32; c];
            let mut ws = vec![0u8; x.len()];

            let mut ctx = ExecCtx::new()
                .with_input(Arg::Src, &x)
                .with_input(Arg::ScaleShift, &ss)
                .with_output(Arg::Dst, &mut y)
                .with_output(Arg::Mean, &mut mean)
                .with_output(Arg::Variance, &mut var)
                .with_output(Arg::Workspace, &mut ws)
                .with_scratchpad(&mut scratchpad);
            bn.execute(&mut ctx).unwrap();
            drop(ctx);

            let (expected_mean, expected_var) = reference_stats(&x, n, c, sp);
            if case.params.is_training {
                expect_equal_with_tolerance(&mean, &expected_mean, 1e-5, 1e-4).unwrap();
                expect_equal_with_tolerance(&var, &expected_var, 1e-5, 1e-4).unwrap();
            }

            let scale_shift = case.params.use_scale_shift.then_some(ss.as_slice());
            let expected = reference_forward(
                &x,
                c,
                sp,
                &expected_mean,
                &expected_var,
                scale_shift,
                &case.params,
            );
            expect_equal_with_tolerance(&y, &expected, 1e-4, 1e-4).unwrap();

            if case.params.is_training && case.params.fuse_norm_relu {
                let expected_ws: Vec<u8> = y.iter().map(|&y| (y > 0.) as u8).collect();
                expect_equal(&ws, &expected_ws).unwrap();
            } else {
                assert!(ws.iter().all(|&w| w == 0));
            }
        });
    }

    #[test]
    fn test_batch_norm_normalizes() -> Result<(), Box<dyn Error>> {
        let desc = MemoryDesc::new(&[4, 3, 6, 6], DataType::F32, FormatTag::RowMajor)?;
        let params = BatchNormParams {
            epsilon: 0.,
            is_training: true,
            ..Default::default()
        };
        let bn = BatchNormForward::new(&desc, params)?;
        assert_eq!(bn.workspace_desc(), None);

        let mut rng = fastrand::Rng::with_seed(6);
        let x = rand_vec(&mut rng, desc.nelems(), 10., 20.);
        let mut y = vec![0f32; x.len()];
        let mut mean = vec![0f32; 3];
        let mut var = vec![0f32; 3];
        let mut scratchpad = Scratchpad::for_registry(bn.scratchpad_registry());
        bn.execute(
            &mut ExecCtx::new()
                .with_input(Arg::Src, &x)
                .with_output(Arg::Dst, &mut y)
                .with_output(Arg::Mean, &mut mean)
                .with_output(Arg::Variance, &mut var)
                .with_scratchpad(&mut scratchpad),
        )?;

        let (y_mean, y_var) = reference_stats(&y, 4, 3, 36);
        expect_equal_with_tolerance(&y_mean, &[0.; 3], 1e-4, 0.)?;
        expect_equal_with_tolerance(&y_var, &[1.; 3], 1e-4, 1e-4)?;
        Ok(())
    }

    #[test]
    fn test_batch_norm_global_stats() -> Result<(), Box<dyn Error>> {
        let desc = MemoryDesc::new(&[2, 2, 3], DataType::F32, FormatTag::RowMajor)?;
        let params = BatchNormParams {
            use_global_stats: true,
            epsilon: 0.,
            ..Default::default()
        };
        let bn = BatchNormForward::new(&desc, params)?;
        assert!(bn.scratchpad_registry().is_empty());

        let x: Vec<f32> = (1..=12).map(|x| x as f32).collect();
        let mean = vec![1f32, 2.];
        let var = vec![4f32, 16.];
        let mut y = vec![0f32; 12];
        bn.execute(
            &mut ExecCtx::new()
                .with_input(Arg::Src, &x)
                .with_input(Arg::Mean, &mean)
                .with_input(Arg::Variance, &var)
                .with_output(Arg::Dst, &mut y),
        )?;
        let expected = [
            0., 0.5, 1., 0.5, 0.75, 1., 3., 3.5, 4., 2., 2.25, 2.5,
        ];
        expect_equal(&y, &expected)?;
        Ok(())
    }

    #[test]
    fn test_batch_norm_inference_scratchpad() -> Result<(), Box<dyn Error>> {
        let desc = MemoryDesc::new(&[2, 5, 4], DataType::F32, FormatTag::RowMajor)?;
        let bn = BatchNormForward::new(&desc, BatchNormParams::default())?;
        let registry = bn.scratchpad_registry();
        assert_eq!(registry.len_of(ScratchpadKey::BnormTmpMean), Some(5));
        assert_eq!(registry.len_of(ScratchpadKey::BnormTmpVar), Some(5));

        let x = vec![1f32; desc.nelems()];
        let mut y = vec![0f32; desc.nelems()];
        let result = bn.execute(
            &mut ExecCtx::new()
                .with_input(Arg::Src, &x)
                .with_output(Arg::Dst, &mut y),
        );
        assert_eq!(
            result,
            Err(OpError::MissingScratchpad(ScratchpadKey::BnormReduction))
        );

        // Scratchpad reserved for a problem with fewer channels.
        let small_desc = MemoryDesc::new(&[2, 2, 4], DataType::F32, FormatTag::RowMajor)?;
        let small = BatchNormForward::new(&small_desc, BatchNormParams::default())?;
        let mut scratchpad = Scratchpad::for_registry(small.scratchpad_registry());
        let result = bn.execute(
            &mut ExecCtx::new()
                .with_input(Arg::Src, &x)
                .with_output(Arg::Dst, &mut y)
                .with_scratchpad(&mut scratchpad),
        );
        assert_eq!(
            result,
            Err(OpError::ScratchpadTooShort(ScratchpadKey::BnormReduction))
        );

        scratchpad.reserve(registry);
        bn.execute(
            &mut ExecCtx::new()
                .with_input(Arg::Src, &x)
                .with_output(Arg::Dst, &mut y)
                .with_scratchpad(&mut scratchpad),
        )?;
        assert!(y.iter().all(|&v| v == 0.));
        Ok(())
    }

    #[test]
    fn test_batch_norm_invalid() {
        let nhwc = MemoryDesc::new(&[1, 3, 2, 2], DataType::F32, FormatTag::ChannelLast).unwrap();
        assert!(matches!(
            BatchNormForward::new(&nhwc, BatchNormParams::default()),
            Err(OpError::UnsupportedValue(_))
        ));

        let ints = MemoryDesc::new(&[1, 3, 2], DataType::S8, FormatTag::RowMajor).unwrap();
        assert_eq!(
            BatchNormForward::new(&ints, BatchNormParams::default()).err(),
            Some(OpError::UnsupportedType)
        );

        let data = MemoryDesc::new(&[2, 3, 2], DataType::F32, FormatTag::RowMajor).unwrap();
        let overlapping = MemoryDesc::with_strides(&[2, 3, 2], DataType::F32, &[0, 2, 1]).unwrap();
        assert_eq!(
            BatchNormForward::new(&overlapping, BatchNormParams::default()).err(),
            Some(OpError::InvalidLayout(LayoutError::Overlapping))
        );
        assert_eq!(
            BatchNormBackward::new(&data, &overlapping, BatchNormParams::default()).err(),
            Some(OpError::InvalidLayout(LayoutError::Overlapping))
        );
    }

    /// Naive batch norm backward in f64.
    #[allow(clippy::too_many_arguments)]
    fn reference_backward(
        x: &[f32],
        dd: &[f32],
        ws: Option<&[u8]>,
        c: usize,
        sp: usize,
        mean: &[f32],
        var: &[f32],
        scale_shift: Option<&[f32]>,
        params: &BatchNormParams,
    ) -> (Vec<f32>, Vec<f32>) {
        let count = (x.len() / c) as f64;
        let dd: Vec<f64> = dd
            .iter()
            .enumerate()
            .map(|(i, &d)| match ws {
                Some(ws) if ws[i] == 0 => 0.,
                _ => d as f64,
            })
            .collect();
        let inv_std: Vec<f64> = var
            .iter()
            .map(|&v| 1. / (v as f64 + params.epsilon as f64).sqrt())
            .collect();
        let channel = |i: usize| (i / sp) % c;

        let mut diff_gamma = vec![0f64; c];
        let mut diff_beta = vec![0f64; c];
        for (i, &x) in x.iter().enumerate() {
            let ch = channel(i);
            diff_gamma[ch] += (x as f64 - mean[ch] as f64) * dd[i] * inv_std[ch];
            diff_beta[ch] += dd[i];
        }

        let ds = x
            .iter()
            .enumerate()
            .map(|(i, &x)| {
                let ch = channel(i);
                let gamma = scale_shift.map(|ss| ss[ch] as f64).unwrap_or(1.);
                let mut v = dd[i];
                if !params.use_global_stats {
                    v -= diff_beta[ch] / count
                        + (x as f64 - mean[ch] as f64) * inv_std[ch] * diff_gamma[ch] / count;
                }
                (gamma * inv_std[ch] * v) as f32
            })
            .collect();
        let diff_ss = diff_gamma
            .iter()
            .chain(&diff_beta)
            .map(|&v| v as f32)
            .collect();
        (ds, diff_ss)
    }

    #[test]
    fn test_batch_norm_backward() {
        #[derive(Debug)]
        struct Case {
            dims: Vec<usize>,
            params: BatchNormParams,
        }

        let mut cases = Vec::new();
        for dims in [vec![4, 3], vec![2, 3, 4, 5]] {
            for use_scale_shift in [false, true] {
                for use_global_stats in [false, true] {
                    for fuse_norm_relu in [false, true] {
                        cases.push(Case {
                            dims: dims.clone(),
                            params: BatchNormParams {
                                use_scale_shift,
                                use_global_stats,
                                fuse_norm_relu,
                                is_training: true,
                                ..Default::default()
                            },
                        });
                    }
                }
            }
        }

        cases.test_each(|case| {
            let desc = MemoryDesc::new(&case.dims, DataType::F32, FormatTag::RowMajor).unwrap();
            let (n, c) = (case.dims[0], case.dims[1]);
            let sp = desc.nelems() / (n * c);

            let mut rng = fastrand::Rng::with_seed(17);
            let x = rand_vec(&mut rng, desc.nelems(), -2., 2.);
            let dd = rand_vec(&mut rng, desc.nelems(), -1., 1.);
            let ss = rand_vec(&mut rng, 2 * c, 0.5, 1.5);
            let ws: Vec<u8> = (0..desc.nelems()).map(|_| rng.bool() as u8).collect();
            let (mean, var) = reference_stats(&x, n, c, sp);

            let bn = BatchNormBackward::new(&desc, &desc, case.params).unwrap();
            let mut scratchpad = Scratchpad::for_registry(bn.scratchpad_registry());
            let mut diff_src = vec![0f32; x.len()];
            let mut diff_ss = vec![0f32; 2 * c];
            let mut ctx = ExecCtx::new()
                .with_input(Arg::Src, &x)
                .with_input(Arg::Mean, &mean)
                .with_input(Arg::Variance, &var)
                .with_input(Arg::DiffDst, &dd)
                .with_input(Arg::ScaleShift, &ss)
                .with_input(Arg::Workspace, &ws)
                .with_output(Arg::DiffSrc, &mut diff_src)
                .with_output(Arg::DiffScaleShift, &mut diff_ss)
                .with_scratchpad(&mut scratchpad);
            bn.execute(&mut ctx).unwrap();
            drop(ctx);

            let (expected_ds, expected_dss) = reference_backward(
                &x,
                &dd,
                case.params.fuse_norm_relu.then_some(ws.as_slice()),
                c,
                sp,
                &mean,
                &var,
                case.params.use_scale_shift.then_some(ss.as_slice()),
                &case.params,
            );
            expect_equal_with_tolerance(&diff_src, &expected_ds, 1e-4, 1e-3).unwrap();
            if case.params.use_scale_shift {
                expect_equal_with_tolerance(&diff_ss, &expected_dss, 1e-4, 1e-3).unwrap();
            } else {
                assert!(diff_ss.iter().all(|&v| v == 0.));
            }
        });
    }
}
