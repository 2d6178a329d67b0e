//! Backward convolution passes, computing gradients with respect to the
//! source and the weights.

use smallvec::SmallVec;
use vkern_layout::{CoordBatch, CoordChunks, DataType, MemoryDesc, OffsetEngine, MAX_VL};

use super::{check_bias, empty_ranges, output_window, ConvGeometry, ConvParams};
use crate::exec_ctx::{Arg, ExecCtx};
use crate::operator::{OpError, Primitive};
use crate::ops::check_data_type;
use crate::shared_slice::SharedSliceMut;
use crate::threading::{parallel_for, parallel_for_ranges};

/// Check that `params` has nothing a backward pass cannot apply.
fn check_backward_params(params: &ConvParams) -> Result<(), OpError> {
    if !params.post_ops.is_empty() || !params.output_scales.is_identity() {
        return Err(OpError::UnsupportedValue(
            "backward convolution does not support output scales or post-ops",
        ));
    }
    Ok(())
}

/// Return the output position which reads input position `pos` through
/// kernel position `k`, if any.
#[inline]
fn source_output(
    pos: usize,
    k: usize,
    stride: usize,
    pad: usize,
    dilation: usize,
    output: usize,
) -> Option<usize> {
    let shifted = (pos + pad).checked_sub(k * dilation)?;
    if shifted % stride != 0 {
        return None;
    }
    let out = shifted / stride;
    (out < output).then_some(out)
}

/// Gradient of a convolution with respect to its source.
///
/// Arguments are `Arg::Weights` and `Arg::DiffDst`, and the output
/// `Arg::DiffSrc`. Only `f32` is supported.
#[derive(Debug)]
pub struct ConvBackwardData {
    diff_src: MemoryDesc,
    weights: MemoryDesc,
    diff_dst: MemoryDesc,
    geom: ConvGeometry,
    name: String,
}

impl ConvBackwardData {
    pub fn new(
        diff_src: &MemoryDesc,
        weights: &MemoryDesc,
        diff_dst: &MemoryDesc,
        params: ConvParams,
    ) -> Result<Self, OpError> {
        for desc in [diff_src, weights, diff_dst] {
            check_data_type(desc, DataType::F32)?;
        }
        check_backward_params(&params)?;
        let geom = ConvGeometry::new(diff_src, weights, diff_dst, &params)?;
        diff_src.check_writable()?;

        let name = "conv_bwd_data:ref".to_string();
        tracing::debug!(
            name,
            groups = geom.groups,
            ic = geom.ic,
            oc = geom.oc,
            "created convolution backward data primitive"
        );

        Ok(ConvBackwardData {
            diff_src: diff_src.clone(),
            weights: weights.clone(),
            diff_dst: diff_dst.clone(),
            geom,
            name,
        })
    }

    fn backward(&self, weights: &[f32], diff_dst: &[f32], diff_src: &SharedSliceMut<f32>) {
        let geom = &self.geom;
        let n_spatial = geom.n_spatial();
        let src_engine = OffsetEngine::new(&self.diff_src);
        let wei_engine = OffsetEngine::new(&self.weights);
        let dst_engine = OffsetEngine::new(&self.diff_dst);

        parallel_for_ranges(self.diff_src.nelems(), |range| {
            let mut src_chunks = CoordChunks::from_linear(self.diff_src.dims(), range);
            let mut wei_chunks = CoordChunks::from_ranges(&empty_ranges(geom.weights_ndim()));
            let mut dst_batch = CoordBatch::new(self.diff_dst.ndim());
            let mut src_off = [0; MAX_VL];
            let mut wei_off = [0; MAX_VL];
            let mut dst_off = [0; MAX_VL];

            // Weight offsets of the taps which contribute, in the same
            // order as `dst_batch`.
            let mut tap_wei_off = [0; MAX_VL];

            while let Some(batch) = src_chunks.next_batch() {
                src_engine.vector_offset(batch, &mut src_off);

                for (i, &off) in src_off[..batch.len()].iter().enumerate() {
                    let mb = batch.column(0)[i];
                    let channel = batch.column(1)[i];
                    let (g, ic) = (channel / geom.ic, channel % geom.ic);

                    let ranges =
                        geom.weight_ranges(g, 0..geom.oc, ic..ic + 1, |d| 0..geom.kernel[d]);
                    wei_chunks.reset(&ranges);

                    let mut acc = 0.;
                    while let Some(wb) = wei_chunks.next_batch() {
                        let vl = wb.len();
                        wei_engine.vector_offset(wb, &mut wei_off);

                        // Keep only the taps which map to an output position.
                        dst_batch.set_len(vl);
                        let mut n_taps = 0;
                        'taps: for j in 0..vl {
                            for d in 0..n_spatial {
                                let Some(out) = source_output(
                                    batch.column(2 + d)[i],
                                    wb.column(geom.kernel_col() + d)[j],
                                    geom.strides[d],
                                    geom.pad_begin[d],
                                    geom.dilations[d],
                                    geom.output[d],
                                ) else {
                                    continue 'taps;
                                };
                                dst_batch.column_mut(2 + d)[n_taps] = out;
                            }
                            dst_batch.column_mut(0)[n_taps] = mb;
                            dst_batch.column_mut(1)[n_taps] =
                                g * geom.oc + wb.column(geom.oc_col())[j];
                            tap_wei_off[n_taps] = wei_off[j];
                            n_taps += 1;
                        }
                        dst_batch.set_len(n_taps);
                        dst_engine.vector_offset(&dst_batch, &mut dst_off);

                        for (&dof, &wof) in dst_off[..n_taps].iter().zip(&tap_wei_off[..n_taps])
                        {
                            acc += diff_dst[dof] * weights[wof];
                        }
                    }

                    // Safety: Each output element belongs to exactly one
                    // thread's range.
                    unsafe { diff_src.write(off, acc) };
                }
            }
        });
    }
}

impl Primitive for ConvBackwardData {
    fn name(&self) -> &str {
        &self.name
    }

    #[tracing::instrument(level = "trace", skip_all, fields(name = %self.name))]
    fn execute(&self, ctx: &mut ExecCtx) -> Result<(), OpError> {
        let weights = ctx.input::<f32>(Arg::Weights, &self.weights)?;
        let diff_dst = ctx.input::<f32>(Arg::DiffDst, &self.diff_dst)?;
        let diff_src = ctx.take_output::<f32>(Arg::DiffSrc, &self.diff_src)?;
        self.backward(weights, diff_dst, &SharedSliceMut::new(diff_src));
        Ok(())
    }
}

/// Gradient of a convolution with respect to its weights and bias.
///
/// Arguments are `Arg::Src` and `Arg::DiffDst`, and the outputs
/// `Arg::DiffWeights` and, if the bias descriptor is defined,
/// `Arg::DiffBias`. Only `f32` is supported.
#[derive(Debug)]
pub struct ConvBackwardWeights {
    src: MemoryDesc,
    diff_weights: MemoryDesc,
    diff_bias: MemoryDesc,
    diff_dst: MemoryDesc,
    geom: ConvGeometry,
    name: String,
}

impl ConvBackwardWeights {
    /// Create a backward weights primitive. `diff_bias` may be a descriptor
    /// with type [`DataType::Undef`] if no bias gradient is wanted.
    pub fn new(
        src: &MemoryDesc,
        diff_weights: &MemoryDesc,
        diff_bias: &MemoryDesc,
        diff_dst: &MemoryDesc,
        params: ConvParams,
    ) -> Result<Self, OpError> {
        for desc in [src, diff_weights, diff_dst] {
            check_data_type(desc, DataType::F32)?;
        }
        if diff_bias.data_type().is_defined() {
            check_data_type(diff_bias, DataType::F32)?;
        }
        check_backward_params(&params)?;
        let geom = ConvGeometry::new(src, diff_weights, diff_dst, &params)?;
        check_bias(diff_bias, geom.groups * geom.oc)?;
        diff_weights.check_writable()?;
        if diff_bias.data_type().is_defined() {
            diff_bias.check_writable()?;
        }

        let name = "conv_bwd_weights:ref".to_string();
        tracing::debug!(
            name,
            groups = geom.groups,
            ic = geom.ic,
            oc = geom.oc,
            has_bias = diff_bias.data_type().is_defined(),
            "created convolution backward weights primitive"
        );

        Ok(ConvBackwardWeights {
            src: src.clone(),
            diff_weights: diff_weights.clone(),
            diff_bias: diff_bias.clone(),
            diff_dst: diff_dst.clone(),
            geom,
            name,
        })
    }

    fn backward_weights(&self, src: &[f32], diff_dst: &[f32], diff_wei: &SharedSliceMut<f32>) {
        let geom = &self.geom;
        let n_spatial = geom.n_spatial();
        let src_engine = OffsetEngine::new(&self.src);
        let wei_engine = OffsetEngine::new(&self.diff_weights);
        let dst_engine = OffsetEngine::new(&self.diff_dst);

        parallel_for_ranges(self.diff_weights.nelems(), |range| {
            let mut wei_chunks = CoordChunks::from_linear(self.diff_weights.dims(), range);
            let mut dst_chunks = CoordChunks::from_ranges(&empty_ranges(self.diff_dst.ndim()));
            let mut src_batch = CoordBatch::new(self.src.ndim());
            let mut wei_off = [0; MAX_VL];
            let mut dst_off = [0; MAX_VL];
            let mut src_off = [0; MAX_VL];

            while let Some(batch) = wei_chunks.next_batch() {
                wei_engine.vector_offset(batch, &mut wei_off);

                for (i, &off) in wei_off[..batch.len()].iter().enumerate() {
                    let g = if geom.grouped { batch.column(0)[i] } else { 0 };
                    let oc = batch.column(geom.oc_col())[i];
                    let ic = batch.column(geom.ic_col())[i];
                    let k: SmallVec<[usize; 3]> = (0..n_spatial)
                        .map(|d| batch.column(geom.kernel_col() + d)[i])
                        .collect();

                    let mut ranges = empty_ranges(0);
                    ranges.push(0..geom.mb);
                    let channel = g * geom.oc + oc;
                    ranges.push(channel..channel + 1);
                    for d in 0..n_spatial {
                        ranges.push(output_window(
                            k[d],
                            geom.strides[d],
                            geom.pad_begin[d],
                            geom.dilations[d],
                            geom.output[d],
                            geom.input[d],
                        ));
                    }
                    dst_chunks.reset(&ranges);

                    let mut acc = 0.;
                    while let Some(db) = dst_chunks.next_batch() {
                        let vl = db.len();
                        dst_engine.vector_offset(db, &mut dst_off);

                        src_batch.set_len(vl);
                        src_batch.column_mut(0).copy_from_slice(db.column(0));
                        src_batch.column_mut(1).fill(g * geom.ic + ic);
                        for d in 0..n_spatial {
                            let tap = k[d] * geom.dilations[d];
                            let (stride, pad) = (geom.strides[d], geom.pad_begin[d]);
                            for (c, &out) in src_batch
                                .column_mut(2 + d)
                                .iter_mut()
                                .zip(db.column(2 + d))
                            {
                                *c = out * stride + tap - pad;
                            }
                        }
                        src_engine.vector_offset(&src_batch, &mut src_off);

                        for (&dof, &sof) in dst_off[..vl].iter().zip(&src_off[..vl]) {
                            acc += diff_dst[dof] * src[sof];
                        }
                    }

                    // Safety: Each output element belongs to exactly one
                    // thread's range.
                    unsafe { diff_wei.write(off, acc) };
                }
            }
        });
    }

    fn backward_bias(&self, diff_dst: &[f32], diff_bias: &SharedSliceMut<f32>) {
        let geom = &self.geom;
        let dst_engine = OffsetEngine::new(&self.diff_dst);

        parallel_for(geom.groups * geom.oc, |channel| {
            let mut ranges = empty_ranges(0);
            ranges.push(0..geom.mb);
            ranges.push(channel..channel + 1);
            ranges.extend(geom.output.iter().map(|&size| 0..size));

            let mut chunks = CoordChunks::from_ranges(&ranges);
            let mut dst_off = [0; MAX_VL];
            let mut acc = 0.;
            while let Some(batch) = chunks.next_batch() {
                dst_engine.vector_offset(batch, &mut dst_off);
                acc += dst_off[..batch.len()]
                    .iter()
                    .map(|&off| diff_dst[off])
                    .sum::<f32>();
            }

            // Safety: Each channel is handled by one task.
            unsafe { diff_bias.write(self.diff_bias.offset(&[channel]), acc) };
        });
    }
}

impl Primitive for ConvBackwardWeights {
    fn name(&self) -> &str {
        &self.name
    }

    #[tracing::instrument(level = "trace", skip_all, fields(name = %self.name))]
    fn execute(&self, ctx: &mut ExecCtx) -> Result<(), OpError> {
        let src = ctx.input::<f32>(Arg::Src, &self.src)?;
        let diff_dst = ctx.input::<f32>(Arg::DiffDst, &self.diff_dst)?;
        let diff_wei = ctx.take_output::<f32>(Arg::DiffWeights, &self.diff_weights)?;
        let diff_bias = if self.diff_bias.data_type().is_defined() {
            Some(ctx.take_output::<f32>(Arg::DiffBias, &self.diff_bias)?)
        } else {
            None
        };

        if self.diff_weights.is_padded() {
            diff_wei[..self.diff_weights.size()].fill(0.);
        }

        self.backward_weights(src, diff_dst, &SharedSliceMut::new(diff_wei));
        if let Some(diff_bias) = diff_bias {
            self.backward_bias(diff_dst, &SharedSliceMut::new(diff_bias));
        }
        Ok(())
    }
}
