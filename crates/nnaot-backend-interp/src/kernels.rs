//! Reference kernels.
//!
//! Fixed-point kernels follow the shared scalar arithmetic in
//! [`nnaot::quantization`]: products accumulate in i32 over zero-point
//! corrected operands, everything else is computed on dequantized values and
//! quantized once on store.

use nnaot::backend::{BackendError, BackendResult};
use nnaot::graph::Window;
use nnaot::ir::{InstrKind, PoolKind, UnaryOp};
use nnaot::quantization::{self, accumulate_range};
use nnaot::tensor::contiguous_strides;

use crate::memory::{Memory, Operand};
use crate::program::Step;

fn operands<const N: usize>(step: &Step) -> BackendResult<&[Operand; N]> {
    step.operands.as_slice().try_into().map_err(|_| {
        BackendError::execution(format!(
            "`{}` expects {N} operands, got {}",
            step.instr.name(),
            step.operands.len()
        ))
    })
}

fn mismatch(step: &Step) -> BackendError {
    BackendError::execution(format!(
        "kernel dispatched for the wrong instruction `{}`",
        step.instr.name()
    ))
}

fn window(step: &Step) -> BackendResult<Window> {
    match &step.instr.kind {
        InstrKind::Convolution { window, .. } | InstrKind::Pool { window, .. } => Ok(*window),
        _ => Err(mismatch(step)),
    }
}

/// Input coordinate under a window tap, or `None` inside the padding.
fn tap(out: usize, k: usize, window: Window, extent: usize) -> Option<usize> {
    let pos = (out * window.stride + k).checked_sub(window.pad)?;
    (pos < extent).then_some(pos)
}

pub(crate) fn alloc(step: &Step, memory: &mut Memory) -> BackendResult<()> {
    // Fresh storage holds no value until something writes it.
    let [dest] = operands(step)?;
    memory.poison(dest)
}

pub(crate) fn dealloc(step: &Step, memory: &mut Memory) -> BackendResult<()> {
    let [src] = operands(step)?;
    memory.poison(src)
}

pub(crate) fn tensor_view(_step: &Step, _memory: &mut Memory) -> BackendResult<()> {
    Ok(())
}

pub(crate) fn copy(step: &Step, memory: &mut Memory) -> BackendResult<()> {
    let [dest, src] = operands(step)?;
    let bytes = memory.bytes(src)?.to_vec();
    let out = memory.bytes_mut(dest)?;
    if out.len() != bytes.len() {
        return Err(BackendError::execution(format!(
            "copy of {} bytes into `{}` of {} bytes",
            bytes.len(),
            dest.name,
            out.len()
        )));
    }
    out.copy_from_slice(&bytes);
    Ok(())
}

pub(crate) fn transpose(step: &Step, memory: &mut Memory) -> BackendResult<()> {
    let InstrKind::Transpose { shuffle, .. } = &step.instr.kind else {
        return Err(mismatch(step));
    };
    let [dest, src] = operands(step)?;
    let size = src.elem().size_in_bytes();
    let src_strides = contiguous_strides(src.dims());
    let input = memory.bytes(src)?.to_vec();
    let dims = dest.dims().to_vec();
    let out = memory.bytes_mut(dest)?;

    let mut coord = vec![0usize; dims.len()];
    for index in 0..out.len() / size {
        let mut rest = index;
        for axis in (0..dims.len()).rev() {
            coord[axis] = rest % dims[axis];
            rest /= dims[axis];
        }
        let from: usize = coord
            .iter()
            .zip(shuffle)
            .map(|(c, axis)| c * src_strides[*axis])
            .sum();
        out[index * size..(index + 1) * size]
            .copy_from_slice(&input[from * size..(from + 1) * size]);
    }
    Ok(())
}

pub(crate) fn element_binary(step: &Step, memory: &mut Memory) -> BackendResult<()> {
    let InstrKind::ElementBinary { op, .. } = &step.instr.kind else {
        return Err(mismatch(step));
    };
    let [dest, lhs, rhs] = operands(step)?;
    let a = memory.load_real(lhs)?;
    let b = memory.load_real(rhs)?;
    let out: Vec<f32> = a.iter().zip(&b).map(|(x, y)| op.apply(*x, *y)).collect();
    memory.store_real(dest, &out)
}

pub(crate) fn element_unary(step: &Step, memory: &mut Memory) -> BackendResult<()> {
    let InstrKind::ElementUnary { op, .. } = &step.instr.kind else {
        return Err(mismatch(step));
    };
    let [dest, src] = operands(step)?;
    let values = memory.load_real(src)?;
    let out: Vec<f32> = match op {
        UnaryOp::Relu => values
            .iter()
            .map(|&x| if x > 0.0 { x } else { 0.0 })
            .collect(),
        UnaryOp::Sigmoid => values.iter().map(|&x| 1.0 / (1.0 + (-x).exp())).collect(),
        UnaryOp::Tanh => values.iter().map(|&x| x.tanh()).collect(),
    };
    memory.store_real(dest, &out)
}

pub(crate) fn matmul_f32(step: &Step, memory: &mut Memory) -> BackendResult<()> {
    let [dest, lhs, rhs] = operands(step)?;
    let (m, k, n) = (lhs.dims()[0], lhs.dims()[1], rhs.dims()[1]);
    let a = memory.load_f32(lhs)?;
    let b = memory.load_f32(rhs)?;
    let mut out = vec![0.0f32; m * n];
    for i in 0..m {
        for j in 0..n {
            let mut acc = 0.0f32;
            for p in 0..k {
                acc += a[i * k + p] * b[p * n + j];
            }
            out[i * n + j] = acc;
        }
    }
    memory.store_f32(dest, &out)
}

pub(crate) fn matmul_quantized(step: &Step, memory: &mut Memory) -> BackendResult<()> {
    let [dest, lhs, rhs] = operands(step)?;
    let (m, k, n) = (lhs.dims()[0], lhs.dims()[1], rhs.dims()[1]);
    let (a, ap) = memory.load_quantized(lhs)?;
    let (b, bp) = memory.load_quantized(rhs)?;
    let scale = ap.scale * bp.scale;
    let mut out = vec![0.0f32; m * n];
    for i in 0..m {
        for j in 0..n {
            let mut acc = 0i64;
            for p in 0..k {
                acc += i64::from(a[i * k + p] - ap.offset) * i64::from(b[p * n + j] - bp.offset);
            }
            out[i * n + j] = acc as f32 * scale;
        }
    }
    memory.store_real(dest, &out)
}

pub(crate) fn fully_connected_f32(step: &Step, memory: &mut Memory) -> BackendResult<()> {
    let [dest, src, weights, bias] = operands(step)?;
    let (k, m) = (weights.dims()[0], weights.dims()[1]);
    let batch = dest.dims()[0];
    let x = memory.load_f32(src)?;
    let w = memory.load_f32(weights)?;
    let b = memory.load_f32(bias)?;
    let mut out = vec![0.0f32; batch * m];
    for n in 0..batch {
        for j in 0..m {
            let mut acc = 0.0f32;
            for p in 0..k {
                acc += x[n * k + p] * w[p * m + j];
            }
            out[n * m + j] = acc + b[j];
        }
    }
    memory.store_f32(dest, &out)
}

pub(crate) fn fully_connected_quantized(step: &Step, memory: &mut Memory) -> BackendResult<()> {
    let [dest, src, weights, bias] = operands(step)?;
    let (k, m) = (weights.dims()[0], weights.dims()[1]);
    let batch = dest.dims()[0];
    let (x, xp) = memory.load_quantized(src)?;
    let (w, wp) = memory.load_quantized(weights)?;
    let (b, bp) = memory.load_quantized(bias)?;
    let scale = xp.scale * wp.scale;
    let mut out = vec![0.0f32; batch * m];
    for n in 0..batch {
        for j in 0..m {
            let mut acc = 0i64;
            for p in 0..k {
                acc += i64::from(x[n * k + p] - xp.offset) * i64::from(w[p * m + j] - wp.offset);
            }
            out[n * m + j] = acc as f32 * scale + quantization::dequantize(b[j], bp);
        }
    }
    memory.store_real(dest, &out)
}

/// NCHW geometry shared by convolution and pooling.
struct Geometry {
    batch: usize,
    channels: usize,
    height: usize,
    width: usize,
    out_height: usize,
    out_width: usize,
}

impl Geometry {
    fn new(src: &Operand, dest: &Operand) -> Self {
        let (s, d) = (src.dims(), dest.dims());
        Self {
            batch: s[0],
            channels: s[1],
            height: s[2],
            width: s[3],
            out_height: d[2],
            out_width: d[3],
        }
    }

    fn input_index(&self, n: usize, c: usize, y: usize, x: usize) -> usize {
        ((n * self.channels + c) * self.height + y) * self.width + x
    }
}

pub(crate) fn convolution_f32(step: &Step, memory: &mut Memory) -> BackendResult<()> {
    let window = window(step)?;
    let [dest, src, filter, bias] = operands(step)?;
    let g = Geometry::new(src, dest);
    let out_channels = filter.dims()[0];
    let kk = window.kernel;
    let input = memory.load_f32(src)?;
    let f = memory.load_f32(filter)?;
    let b = memory.load_f32(bias)?;

    let mut out = Vec::with_capacity(dest.len());
    for n in 0..g.batch {
        for o in 0..out_channels {
            for oy in 0..g.out_height {
                for ox in 0..g.out_width {
                    let mut acc = 0.0f32;
                    for c in 0..g.channels {
                        for ky in 0..kk {
                            let Some(y) = tap(oy, ky, window, g.height) else {
                                continue;
                            };
                            for kx in 0..kk {
                                let Some(x) = tap(ox, kx, window, g.width) else {
                                    continue;
                                };
                                acc += input[g.input_index(n, c, y, x)]
                                    * f[((o * g.channels + c) * kk + ky) * kk + kx];
                            }
                        }
                    }
                    out.push(acc + b[o]);
                }
            }
        }
    }
    memory.store_f32(dest, &out)
}

pub(crate) fn convolution_quantized(step: &Step, memory: &mut Memory) -> BackendResult<()> {
    let window = window(step)?;
    let [dest, src, filter, bias] = operands(step)?;
    let g = Geometry::new(src, dest);
    let out_channels = filter.dims()[0];
    let kk = window.kernel;
    let (input, ip) = memory.load_quantized(src)?;
    let (f, fp) = memory.load_quantized(filter)?;
    let (b, bp) = memory.load_quantized(bias)?;
    let scale = ip.scale * fp.scale;

    let mut out = Vec::with_capacity(dest.len());
    for n in 0..g.batch {
        for o in 0..out_channels {
            for oy in 0..g.out_height {
                for ox in 0..g.out_width {
                    let mut acc = 0i64;
                    for c in 0..g.channels {
                        for ky in 0..kk {
                            let Some(y) = tap(oy, ky, window, g.height) else {
                                continue;
                            };
                            for kx in 0..kk {
                                let Some(x) = tap(ox, kx, window, g.width) else {
                                    continue;
                                };
                                acc += i64::from(input[g.input_index(n, c, y, x)] - ip.offset)
                                    * i64::from(
                                        f[((o * g.channels + c) * kk + ky) * kk + kx] - fp.offset,
                                    );
                            }
                        }
                    }
                    out.push(acc as f32 * scale + quantization::dequantize(b[o], bp));
                }
            }
        }
    }
    memory.store_real(dest, &out)
}

/// Max pooling skips padding; average pooling divides by the full window.
pub(crate) fn pool(step: &Step, memory: &mut Memory) -> BackendResult<()> {
    let InstrKind::Pool { kind, .. } = &step.instr.kind else {
        return Err(mismatch(step));
    };
    let window = window(step)?;
    let [dest, src] = operands(step)?;
    let g = Geometry::new(src, dest);
    let input = memory.load_real(src)?;
    let area = (window.kernel * window.kernel) as f32;

    let mut out = Vec::with_capacity(dest.len());
    for n in 0..g.batch {
        for c in 0..g.channels {
            for oy in 0..g.out_height {
                for ox in 0..g.out_width {
                    let mut max = f32::NEG_INFINITY;
                    let mut sum = 0.0f32;
                    let mut seen = false;
                    for ky in 0..window.kernel {
                        let Some(y) = tap(oy, ky, window, g.height) else {
                            continue;
                        };
                        for kx in 0..window.kernel {
                            let Some(x) = tap(ox, kx, window, g.width) else {
                                continue;
                            };
                            let value = input[g.input_index(n, c, y, x)];
                            if value > max {
                                max = value;
                            }
                            sum += value;
                            seen = true;
                        }
                    }
                    out.push(match kind {
                        PoolKind::Max if seen => max,
                        PoolKind::Max => 0.0,
                        PoolKind::Avg => sum / area,
                    });
                }
            }
        }
    }
    memory.store_real(dest, &out)
}

/// Row-wise softmax over the last axis of a rank-2 input.
pub(crate) fn softmax(step: &Step, memory: &mut Memory) -> BackendResult<()> {
    let [dest, src] = operands(step)?;
    let cols = src.dims()[1];
    let input = memory.load_f32(src)?;
    let mut out = vec![0.0f32; input.len()];
    for (row, result) in input.chunks(cols).zip(out.chunks_mut(cols)) {
        let mut max = f32::NEG_INFINITY;
        for &x in row {
            if x > max {
                max = x;
            }
        }
        let mut sum = 0.0f32;
        for (o, &x) in result.iter_mut().zip(row) {
            *o = (x - max).exp();
            sum += *o;
        }
        for o in result.iter_mut() {
            *o /= sum;
        }
    }
    memory.store_f32(dest, &out)
}

pub(crate) fn splat(step: &Step, memory: &mut Memory) -> BackendResult<()> {
    let InstrKind::Splat { value, .. } = &step.instr.kind else {
        return Err(mismatch(step));
    };
    let [dest] = operands(step)?;
    memory.store_real(dest, &vec![*value; dest.len()])
}

pub(crate) fn quantize(step: &Step, memory: &mut Memory) -> BackendResult<()> {
    let [dest, src] = operands(step)?;
    let values = memory.load_f32(src)?;
    memory.store_real(dest, &values)
}

pub(crate) fn dequantize(step: &Step, memory: &mut Memory) -> BackendResult<()> {
    let [dest, src] = operands(step)?;
    let values = memory.load_real(src)?;
    memory.store_f32(dest, &values)
}

pub(crate) fn rescale(step: &Step, memory: &mut Memory) -> BackendResult<()> {
    let [dest, src] = operands(step)?;
    let values = memory.load_real(src)?;
    memory.store_real(dest, &values)
}

pub(crate) fn quantization_profile(step: &Step, memory: &mut Memory) -> BackendResult<()> {
    let [stats, src] = operands(step)?;
    let values = memory.load_f32(src)?;
    let mut range = memory.load_f32(stats)?;
    accumulate_range(&mut range, &values);
    memory.store_f32(stats, &range)
}
