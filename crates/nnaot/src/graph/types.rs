//! Per-kind shape and element checks.
//!
//! `infer_type` produces the float-style output type builders use; `check_type`
//! accepts any explicitly typed node (including fixed-point rewrites) whose
//! shape agrees with its operands.

use super::node::NodeKind;
use crate::tensor::{ElemKind, Layout, Type};

type Check<T> = std::result::Result<T, String>;

fn arity(kind: &NodeKind) -> usize {
    match kind {
        NodeKind::Variable { .. } | NodeKind::Splat { .. } => 0,
        NodeKind::Relu
        | NodeKind::Sigmoid
        | NodeKind::Tanh
        | NodeKind::Transpose { .. }
        | NodeKind::Reshape { .. }
        | NodeKind::Softmax
        | NodeKind::MaxPool { .. }
        | NodeKind::AvgPool { .. }
        | NodeKind::Quantize
        | NodeKind::Dequantize
        | NodeKind::RescaleQuantized => 1,
        NodeKind::FullyConnected | NodeKind::Convolution { .. } => 3,
        _ => 2,
    }
}

fn same_dims(a: &Type, b: &Type, what: &str) -> Check<()> {
    if a.dims() != b.dims() {
        return Err(format!("{what}: shapes {a} and {b} differ"));
    }
    Ok(())
}

fn expect_rank(ty: &Type, rank: usize, what: &str) -> Check<()> {
    if ty.rank() != rank {
        return Err(format!("{what} must have rank {rank}, got {ty}"));
    }
    Ok(())
}

fn merged_layout(a: Layout, b: Layout) -> Layout {
    if a == Layout::Any {
        b
    } else {
        a
    }
}

/// Output dims and layout of a node, or `None` for sinks.
fn expected_shape(kind: &NodeKind, inputs: &[&Type]) -> Check<Option<(Vec<usize>, Layout)>> {
    if inputs.len() != arity(kind) {
        return Err(format!(
            "{} expects {} operands, got {}",
            kind.name(),
            arity(kind),
            inputs.len()
        ));
    }
    let shape = match kind {
        NodeKind::Variable { payload, .. } => {
            (payload.ty().dims().to_vec(), payload.ty().layout())
        }
        NodeKind::Splat { .. } => return Err("splat needs an explicit output type".to_string()),
        NodeKind::Save => {
            same_dims(inputs[0], inputs[1], "save destination")?;
            if inputs[0].elem() != inputs[1].elem() {
                return Err(format!(
                    "save destination {} does not match value {}",
                    inputs[1], inputs[0]
                ));
            }
            return Ok(None);
        }
        NodeKind::QuantizationProfile => {
            if !inputs[0].is_float() {
                return Err(format!("can only profile float values, got {}", inputs[0]));
            }
            if *inputs[1] != Type::f32(vec![2]) {
                return Err(format!("statistics variable must be f32<2>, got {}", inputs[1]));
            }
            return Ok(None);
        }
        k if k.is_elementwise_binary() => {
            same_dims(inputs[0], inputs[1], k.name())?;
            (
                inputs[0].dims().to_vec(),
                merged_layout(inputs[0].layout(), inputs[1].layout()),
            )
        }
        k if k.is_elementwise_unary() => (inputs[0].dims().to_vec(), inputs[0].layout()),
        NodeKind::Softmax => {
            expect_rank(inputs[0], 2, "softmax input")?;
            (inputs[0].dims().to_vec(), inputs[0].layout())
        }
        NodeKind::MatMul => {
            expect_rank(inputs[0], 2, "matmul lhs")?;
            expect_rank(inputs[1], 2, "matmul rhs")?;
            let (m, k) = (inputs[0].dims()[0], inputs[0].dims()[1]);
            let (k2, n) = (inputs[1].dims()[0], inputs[1].dims()[1]);
            if k != k2 {
                return Err(format!(
                    "matmul contraction mismatch: {} x {}",
                    inputs[0], inputs[1]
                ));
            }
            (vec![m, n], Layout::Any)
        }
        NodeKind::FullyConnected => {
            let data = inputs[0];
            if data.rank() < 2 {
                return Err(format!("fully connected input must have rank >= 2, got {data}"));
            }
            let batch = data.dims()[0];
            let k: usize = data.dims()[1..].iter().product();
            expect_rank(inputs[1], 2, "fully connected weights")?;
            let (wk, m) = (inputs[1].dims()[0], inputs[1].dims()[1]);
            if wk != k {
                return Err(format!(
                    "fully connected weights {} do not match flattened input width {k}",
                    inputs[1]
                ));
            }
            if inputs[2].dims() != [m] {
                return Err(format!("fully connected bias must be <{m}>, got {}", inputs[2]));
            }
            (vec![batch, m], Layout::Nc)
        }
        NodeKind::Transpose { shuffle } => {
            let dims = inputs[0].dims();
            let mut seen = vec![false; dims.len()];
            if shuffle.len() != dims.len() {
                return Err(format!("shuffle {shuffle:?} does not match rank of {}", inputs[0]));
            }
            for &axis in shuffle {
                if axis >= dims.len() || seen[axis] {
                    return Err(format!("shuffle {shuffle:?} is not a permutation"));
                }
                seen[axis] = true;
            }
            (shuffle.iter().map(|&axis| dims[axis]).collect(), Layout::Any)
        }
        NodeKind::Reshape { dims } => {
            if dims.iter().product::<usize>() != inputs[0].num_elements() {
                return Err(format!(
                    "cannot reshape {} to {dims:?}: element counts differ",
                    inputs[0]
                ));
            }
            (dims.clone(), Layout::Any)
        }
        NodeKind::Convolution { window } => {
            let data = inputs[0];
            expect_rank(data, 4, "convolution input")?;
            expect_rank(inputs[1], 4, "convolution filter")?;
            let (n, c, h, w) = (data.dims()[0], data.dims()[1], data.dims()[2], data.dims()[3]);
            let filter = inputs[1].dims();
            if filter[1] != c || filter[2] != window.kernel || filter[3] != window.kernel {
                return Err(format!(
                    "filter {} does not match input channels {c} and kernel {}",
                    inputs[1], window.kernel
                ));
            }
            if inputs[2].dims() != [filter[0]] {
                return Err(format!(
                    "convolution bias must be <{}>, got {}",
                    filter[0], inputs[2]
                ));
            }
            let oh = window
                .output_extent(h)
                .ok_or_else(|| format!("window does not fit input {data}"))?;
            let ow = window
                .output_extent(w)
                .ok_or_else(|| format!("window does not fit input {data}"))?;
            (vec![n, filter[0], oh, ow], Layout::Nchw)
        }
        NodeKind::MaxPool { window } | NodeKind::AvgPool { window } => {
            let data = inputs[0];
            expect_rank(data, 4, "pooling input")?;
            let d = data.dims();
            let oh = window
                .output_extent(d[2])
                .ok_or_else(|| format!("window does not fit input {data}"))?;
            let ow = window
                .output_extent(d[3])
                .ok_or_else(|| format!("window does not fit input {data}"))?;
            (vec![d[0], d[1], oh, ow], Layout::Nchw)
        }
        NodeKind::Quantize | NodeKind::Dequantize | NodeKind::RescaleQuantized => {
            (inputs[0].dims().to_vec(), inputs[0].layout())
        }
        _ => return Err(format!("unhandled operator {}", kind.name())),
    };
    Ok(Some(shape))
}

fn check_elems(kind: &NodeKind, inputs: &[&Type], out: &Type) -> Check<()> {
    let out_elem = out.elem();
    let fail = || {
        let operands: Vec<String> = inputs.iter().map(|t| t.to_string()).collect();
        Err(format!(
            "{} cannot produce {out} from [{}]",
            kind.name(),
            operands.join(", ")
        ))
    };
    match kind {
        NodeKind::Variable { payload, .. } => {
            if payload.ty() != out {
                return fail();
            }
        }
        NodeKind::Splat { .. } => {
            if matches!(out_elem, ElemKind::I64) {
                return fail();
            }
        }
        NodeKind::Quantize => {
            if !inputs[0].is_float() || !out_elem.is_quantized() {
                return fail();
            }
        }
        NodeKind::Dequantize => {
            if !inputs[0].elem().is_quantized() || !out.is_float() {
                return fail();
            }
        }
        NodeKind::RescaleQuantized => {
            if !inputs[0].elem().is_quantized() || !out_elem.is_quantized() {
                return fail();
            }
        }
        NodeKind::Transpose { .. } | NodeKind::Reshape { .. } => {
            if inputs[0].elem() != out_elem {
                return fail();
            }
        }
        NodeKind::Div | NodeKind::Sigmoid | NodeKind::Tanh | NodeKind::Softmax => {
            if !out.is_float() || inputs.iter().any(|t| !t.is_float()) {
                return fail();
            }
        }
        _ => {
            // Float in, float out; or fixed point throughout. Bias operands of
            // fixed-point fully connected / convolution may be 32-bit.
            let float = out.is_float();
            if matches!(out_elem, ElemKind::I64 | ElemKind::I32Q { .. }) {
                return fail();
            }
            for ty in inputs {
                let ok = if float {
                    ty.is_float()
                } else {
                    ty.elem().is_quantized()
                };
                if !ok {
                    return fail();
                }
            }
        }
    }
    Ok(())
}

/// Float-style output type of a node built from `inputs`.
pub(crate) fn infer_type(kind: &NodeKind, inputs: &[&Type]) -> Check<Option<Type>> {
    let Some((dims, layout)) = expected_shape(kind, inputs)? else {
        return Ok(None);
    };
    let elem = match kind {
        NodeKind::Variable { payload, .. } => payload.ty().elem(),
        NodeKind::Dequantize => ElemKind::F32,
        _ => inputs.first().map(|t| t.elem()).unwrap_or(ElemKind::F32),
    };
    let ty = Type::new(elem, dims).with_layout(layout);
    check_elems(kind, inputs, &ty)?;
    Ok(Some(ty))
}

/// Validates an explicitly provided output type.
pub(crate) fn check_type(kind: &NodeKind, inputs: &[&Type], out: Option<&Type>) -> Check<()> {
    if let NodeKind::Splat { .. } = kind {
        if !inputs.is_empty() {
            return Err("splat takes no operands".to_string());
        }
        let out = out.ok_or_else(|| "splat needs an explicit output type".to_string())?;
        return check_elems(kind, inputs, out);
    }
    let expected = expected_shape(kind, inputs)?;
    match (expected, out) {
        (None, None) => Ok(()),
        (None, Some(_)) => Err(format!("{} does not produce a value", kind.name())),
        (Some(_), None) => Err(format!("{} needs an output type", kind.name())),
        (Some((dims, _)), Some(out)) => {
            if out.dims() != dims.as_slice() {
                return Err(format!(
                    "{} output {out} does not match expected dims {dims:?}",
                    kind.name()
                ));
            }
            check_elems(kind, inputs, out)
        }
    }
}
