//! Scalar kernel bodies shared by the native and GPU code generators.
//!
//! Every compute instruction becomes an [`ElementKernel`]: a body computing
//! work item `i` (one output element, one softmax row, ...) for `i` in
//! `0..count`. The native backend wraps bodies in a loop, the GPU backend in
//! a thread-index guard. Fixed-point arithmetic goes through the `nn_*`
//! helpers of [`prelude`], which mirror `nnaot::quantization` exactly when
//! compiled without floating-point contraction.

use nnaot::backend::{BackendError, BackendResult};
use nnaot::graph::Window;
use nnaot::ir::{BinaryOp, BufferId, InstrKind, Instruction, IrFunction, PoolKind, UnaryOp};
use nnaot::tensor::{contiguous_strides, ElemKind, Type};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    C,
    Cuda,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelParam {
    pub name: String,
    pub buffer: BufferId,
    pub ctype: &'static str,
    pub writes: bool,
}

impl KernelParam {
    pub fn declaration(&self) -> String {
        if self.writes {
            format!("{}* {}", self.ctype, self.name)
        } else {
            format!("const {}* {}", self.ctype, self.name)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementKernel {
    /// C identifier, unique within the module.
    pub name: String,
    pub node: String,
    /// One parameter per instruction operand, destination first.
    pub params: Vec<KernelParam>,
    /// Number of independent work items.
    pub count: usize,
    /// Statements computing work item `i` (a `long long`).
    pub body: String,
}

pub fn c_type(elem: ElemKind) -> &'static str {
    match elem {
        ElemKind::F32 => "float",
        ElemKind::I8Q { .. } => "int8_t",
        ElemKind::I32Q { .. } => "int32_t",
        ElemKind::I64 => "int64_t",
    }
}

/// Exact C literal for an f32.
pub fn format_f32(value: f32) -> String {
    if value.is_nan() {
        "NAN".to_string()
    } else if value.is_infinite() {
        if value.is_sign_negative() {
            "NN_NEG_INF".to_string()
        } else {
            "(-NN_NEG_INF)".to_string()
        }
    } else {
        let base = value.to_string();
        let needs_decimal = !base.contains('.') && !base.contains('e') && !base.contains('E');
        let suffix = if needs_decimal { ".0f" } else { "f" };
        format!("{base}{suffix}")
    }
}

/// Type definitions and fixed-point helpers every generated module starts with.
pub fn prelude(dialect: Dialect) -> String {
    let header = match dialect {
        Dialect::C => {
            "#include <math.h>\n\
             #include <stdint.h>\n\
             #define NN_FN static inline\n\
             #define NN_NEG_INF (-INFINITY)\n"
        }
        Dialect::Cuda => {
            "typedef signed char int8_t;\n\
             typedef int int32_t;\n\
             typedef long long int64_t;\n\
             typedef unsigned char uint8_t;\n\
             #define NN_FN static __device__ __forceinline__\n\
             #define NN_NEG_INF (-__int_as_float(0x7f800000))\n\
             #define NAN __int_as_float(0x7fffffff)\n"
        }
    };
    let helpers = "
NN_FN int8_t nn_q8(float v, float s, int32_t o) {
  float r = roundf(v / s + (float)o);
  if (r < -128.0f) r = -128.0f;
  if (r > 127.0f) r = 127.0f;
  return (int8_t)r;
}

NN_FN int32_t nn_q32(float v, float s, int32_t o) {
  float r = roundf(v / s + (float)o);
  if (r < -2147483648.0f) r = -2147483648.0f;
  if (r > 2147483520.0f) r = 2147483520.0f;
  return (int32_t)r;
}

NN_FN float nn_deq(int32_t q, float s, int32_t o) { return s * (float)(q - o); }
NN_FN float nn_max(float a, float b) { return a > b ? a : b; }
NN_FN float nn_min(float a, float b) { return a < b ? a : b; }
NN_FN float nn_relu(float x) { return x > 0.0f ? x : 0.0f; }
NN_FN float nn_sigmoid(float x) { return 1.0f / (1.0f + expf(-x)); }
";
    format!("{header}{helpers}")
}

/// Appends `block` re-indented by `indent` levels, dropping blank edge lines.
pub fn push_block(out: &mut String, indent: usize, block: &str) {
    let pad = "  ".repeat(indent);
    let mut lines: Vec<&str> = block.lines().collect();
    while matches!(lines.first(), Some(line) if line.trim().is_empty()) {
        lines.remove(0);
    }
    while matches!(lines.last(), Some(line) if line.trim().is_empty()) {
        lines.pop();
    }
    let min_indent = lines
        .iter()
        .filter(|line| !line.trim().is_empty())
        .map(|line| line.len() - line.trim_start().len())
        .min()
        .unwrap_or(0);
    for line in lines {
        if line.trim().is_empty() {
            out.push('\n');
            continue;
        }
        out.push_str(&pad);
        out.push_str(&line[min_indent..]);
        out.push('\n');
    }
}

/// Typed view of one operand inside a kernel body.
struct Arg<'a> {
    ptr: String,
    ty: &'a Type,
}

impl Arg<'_> {
    /// Real value at `index`, dequantizing fixed point.
    fn real(&self, index: &str) -> String {
        match self.ty.elem() {
            ElemKind::I8Q { scale, offset } | ElemKind::I32Q { scale, offset } => format!(
                "nn_deq((int32_t){}[{index}], {}, {offset})",
                self.ptr,
                format_f32(scale)
            ),
            _ => format!("{}[{index}]", self.ptr),
        }
    }

    /// Zero-point corrected integer at `index`.
    fn centered(&self, index: &str) -> String {
        let offset = self.ty.elem().quant_params().map_or(0, |p| p.offset);
        format!("((int64_t){}[{index}] - {offset})", self.ptr)
    }

    fn scale(&self) -> f32 {
        self.ty.elem().quant_params().map_or(1.0, |p| p.scale)
    }

    /// Stores a real value, quantizing for fixed-point destinations.
    fn store(&self, index: &str, value: &str) -> String {
        match self.ty.elem() {
            ElemKind::F32 => format!("{}[{index}] = {value};", self.ptr),
            ElemKind::I8Q { scale, offset } => format!(
                "{}[{index}] = nn_q8({value}, {}, {offset});",
                self.ptr,
                format_f32(scale)
            ),
            ElemKind::I32Q { scale, offset } => format!(
                "{}[{index}] = nn_q32({value}, {}, {offset});",
                self.ptr,
                format_f32(scale)
            ),
            ElemKind::I64 => format!("{}[{index}] = (int64_t)({value});", self.ptr),
        }
    }
}

/// Instruction and element kind pairs with a kernel. Mirrors the reference
/// interpreter's dispatch table so that all backends accept the same programs.
fn supported(kind: &InstrKind, key: ElemKind) -> bool {
    let float = matches!(key, ElemKind::F32);
    let int8 = matches!(key, ElemKind::I8Q { .. });
    let int32 = matches!(key, ElemKind::I32Q { .. });
    match kind {
        InstrKind::AllocActivation { .. }
        | InstrKind::DeallocActivation { .. }
        | InstrKind::TensorView { .. }
        | InstrKind::Copy { .. }
        | InstrKind::Transpose { .. } => true,
        InstrKind::ElementBinary {
            op: BinaryOp::Div, ..
        }
        | InstrKind::ElementUnary {
            op: UnaryOp::Sigmoid | UnaryOp::Tanh,
            ..
        }
        | InstrKind::Softmax { .. }
        | InstrKind::QuantizationProfile { .. } => float,
        InstrKind::ElementBinary { .. }
        | InstrKind::ElementUnary { .. }
        | InstrKind::MatMul { .. }
        | InstrKind::FullyConnected { .. }
        | InstrKind::Convolution { .. }
        | InstrKind::Pool { .. } => float || int8,
        InstrKind::Splat { .. } => float || int8 || int32,
        InstrKind::Quantize { .. }
        | InstrKind::Dequantize { .. }
        | InstrKind::RescaleQuantized { .. } => int8 || int32,
    }
}

fn key_operand(kind: &InstrKind) -> usize {
    match kind {
        InstrKind::Dequantize { .. } | InstrKind::QuantizationProfile { .. } => 1,
        _ => 0,
    }
}

/// Kernel for the instruction at `position`, or `None` for instructions that
/// only manage storage.
pub fn emit_kernel(
    backend: &str,
    function: &IrFunction,
    position: usize,
    instr: &Instruction,
) -> BackendResult<Option<ElementKernel>> {
    if instr.is_memory_management() {
        return Ok(None);
    }
    let operands = instr.operands();
    let types: Vec<&Type> = operands
        .iter()
        .map(|(id, _)| &function.buffer(*id).ty)
        .collect();
    let key = types[key_operand(&instr.kind)].elem();
    if !supported(&instr.kind, key) {
        return Err(BackendError::unsupported(
            backend,
            instr.name(),
            &instr.node,
            format!("no kernel for {key} operands"),
        ));
    }

    let byte_copy = matches!(instr.kind, InstrKind::Copy { .. });
    let params: Vec<KernelParam> = operands
        .iter()
        .zip(&types)
        .enumerate()
        .map(|(idx, ((id, role), ty))| KernelParam {
            name: format!("p{idx}"),
            buffer: *id,
            ctype: if byte_copy { "uint8_t" } else { c_type(ty.elem()) },
            writes: role.writes(),
        })
        .collect();
    let args: Vec<Arg<'_>> = params
        .iter()
        .zip(&types)
        .map(|(param, ty)| Arg {
            ptr: param.name.clone(),
            ty,
        })
        .collect();

    let (count, body) = match &instr.kind {
        InstrKind::Copy { .. } => (types[0].byte_len(), "p0[i] = p1[i];".to_string()),
        InstrKind::Transpose { shuffle, .. } => {
            (types[0].num_elements(), transpose_body(types[0], types[1], shuffle))
        }
        InstrKind::ElementBinary { op, .. } => {
            let (lhs, rhs) = (args[1].real("i"), args[2].real("i"));
            let value = match op {
                BinaryOp::Add => format!("{lhs} + {rhs}"),
                BinaryOp::Sub => format!("{lhs} - {rhs}"),
                BinaryOp::Mul => format!("{lhs} * {rhs}"),
                BinaryOp::Div => format!("{lhs} / {rhs}"),
                BinaryOp::Max => format!("nn_max({lhs}, {rhs})"),
                BinaryOp::Min => format!("nn_min({lhs}, {rhs})"),
            };
            (types[0].num_elements(), args[0].store("i", &value))
        }
        InstrKind::ElementUnary { op, .. } => {
            let src = args[1].real("i");
            let value = match op {
                UnaryOp::Relu => format!("nn_relu({src})"),
                UnaryOp::Sigmoid => format!("nn_sigmoid({src})"),
                UnaryOp::Tanh => format!("tanhf({src})"),
            };
            (types[0].num_elements(), args[0].store("i", &value))
        }
        InstrKind::MatMul { .. } => {
            let (m, k, n) = (types[1].dims()[0], types[1].dims()[1], types[2].dims()[1]);
            (m * n, product_body(&args, k, n, None))
        }
        InstrKind::FullyConnected { .. } => {
            let (k, m) = (types[2].dims()[0], types[2].dims()[1]);
            (types[0].num_elements(), product_body(&args, k, m, Some(&args[3])))
        }
        InstrKind::Convolution { window, .. } => {
            (types[0].num_elements(), convolution_body(&args, *window))
        }
        InstrKind::Pool { kind, window, .. } => {
            (types[0].num_elements(), pool_body(&args, *kind, *window))
        }
        InstrKind::Softmax { .. } => {
            let cols = types[1].dims()[1];
            (types[1].dims()[0], softmax_body(cols))
        }
        InstrKind::Splat { value, .. } => {
            (types[0].num_elements(), args[0].store("i", &format_f32(*value)))
        }
        InstrKind::Quantize { .. } | InstrKind::RescaleQuantized { .. } => {
            (types[0].num_elements(), args[0].store("i", &args[1].real("i")))
        }
        InstrKind::Dequantize { .. } => (
            types[0].num_elements(),
            format!("p0[i] = {};", args[1].real("i")),
        ),
        InstrKind::QuantizationProfile { .. } => (1, profile_body(types[1].num_elements())),
        InstrKind::AllocActivation { .. }
        | InstrKind::DeallocActivation { .. }
        | InstrKind::TensorView { .. } => return Ok(None),
    };

    Ok(Some(ElementKernel {
        name: format!("k{position}_{}", instr.name()),
        node: instr.node.clone(),
        params,
        count,
        body,
    }))
}

fn transpose_body(dest: &Type, src: &Type, shuffle: &[usize]) -> String {
    let strides = contiguous_strides(src.dims());
    let mut body = String::from("long long rest = i;\nlong long from = 0;\n");
    for axis in (0..dest.rank()).rev() {
        let extent = dest.dims()[axis];
        let stride = strides[shuffle[axis]];
        body.push_str(&format!(
            "from += (rest % {extent}) * {stride};\nrest /= {extent};\n"
        ));
    }
    body.push_str("p0[i] = p1[from];");
    body
}

/// Matrix product of `args[1]` (rows of `k`) with `args[2]` (`k` x `n`),
/// plus an optional bias over `n`.
fn product_body(args: &[Arg<'_>], k: usize, n: usize, bias: Option<&Arg<'_>>) -> String {
    let (dest, lhs, rhs) = (&args[0], &args[1], &args[2]);
    if dest.ty.is_float() {
        let result = match bias {
            Some(bias) => format!("acc + {}", bias.real("col")),
            None => "acc".to_string(),
        };
        format!(
            "long long row = i / {n};
long long col = i % {n};
float acc = 0.0f;
for (long long p = 0; p < {k}; ++p) {{
  acc += {} * {};
}}
{}",
            lhs.real(&format!("row * {k} + p")),
            rhs.real(&format!("p * {n} + col")),
            dest.store("i", &result)
        )
    } else {
        let scale = format_f32(lhs.scale() * rhs.scale());
        let result = match bias {
            Some(bias) => format!("(float)acc * {scale} + {}", bias.real("col")),
            None => format!("(float)acc * {scale}"),
        };
        format!(
            "long long row = i / {n};
long long col = i % {n};
int64_t acc = 0;
for (long long p = 0; p < {k}; ++p) {{
  acc += {} * {};
}}
{}",
            lhs.centered(&format!("row * {k} + p")),
            rhs.centered(&format!("p * {n} + col")),
            dest.store("i", &result)
        )
    }
}

/// Decodes `i` into NCHW output coordinates `n`, `ch`, `oy`, `ox`.
fn decode_nchw(dest: &Type) -> String {
    let d = dest.dims();
    format!(
        "long long ox = i % {w};
long long oy = (i / {w}) % {h};
long long ch = (i / ({w} * {h})) % {c};
long long n = i / ({w} * {h} * {c});
",
        w = d[3],
        h = d[2],
        c = d[1]
    )
}

fn window_loops(window: Window, height: usize, width: usize, inner: &str) -> String {
    let mut inner_block = String::new();
    push_block(&mut inner_block, 2, inner);
    format!(
        "for (long long ky = 0; ky < {k}; ++ky) {{
  long long y = oy * {s} + ky - {p};
  if (y < 0 || y >= {height}) continue;
  for (long long kx = 0; kx < {k}; ++kx) {{
    long long x = ox * {s} + kx - {p};
    if (x < 0 || x >= {width}) continue;
{inner_block}  }}
}}
",
        k = window.kernel,
        s = window.stride,
        p = window.pad
    )
}

fn convolution_body(args: &[Arg<'_>], window: Window) -> String {
    let (dest, src, filter, bias) = (&args[0], &args[1], &args[2], &args[3]);
    let s = src.ty.dims();
    let (channels, height, width) = (s[1], s[2], s[3]);
    let kk = window.kernel;
    let input_index = format!("((n * {channels} + c) * {height} + y) * {width} + x");
    let filter_index = format!("((ch * {channels} + c) * {kk} + ky) * {kk} + kx");
    let (acc_decl, update, result) = if dest.ty.is_float() {
        (
            "float acc = 0.0f;".to_string(),
            format!(
                "acc += {} * {};",
                src.real(&input_index),
                filter.real(&filter_index)
            ),
            format!("acc + {}", bias.real("ch")),
        )
    } else {
        let scale = format_f32(src.scale() * filter.scale());
        (
            "int64_t acc = 0;".to_string(),
            format!(
                "acc += {} * {};",
                src.centered(&input_index),
                filter.centered(&filter_index)
            ),
            format!("(float)acc * {scale} + {}", bias.real("ch")),
        )
    };
    let mut loops = String::new();
    push_block(&mut loops, 1, &window_loops(window, height, width, &update));
    format!(
        "{}{acc_decl}
for (long long c = 0; c < {channels}; ++c) {{
{loops}}}
{}",
        decode_nchw(dest.ty),
        dest.store("i", &result)
    )
}

fn pool_body(args: &[Arg<'_>], kind: PoolKind, window: Window) -> String {
    let (dest, src) = (&args[0], &args[1]);
    let s = src.ty.dims();
    let (channels, height, width) = (s[1], s[2], s[3]);
    let value = src.real(&format!("((n * {channels} + ch) * {height} + y) * {width} + x"));
    let (decl, update, result) = match kind {
        PoolKind::Max => (
            "float m = NN_NEG_INF;\nint seen = 0;",
            format!("float v = {value};\nif (v > m) m = v;\nseen = 1;"),
            "seen ? m : 0.0f".to_string(),
        ),
        PoolKind::Avg => (
            "float sum = 0.0f;",
            format!("sum += {value};"),
            format!(
                "sum / {}",
                format_f32((window.kernel * window.kernel) as f32)
            ),
        ),
    };
    format!(
        "{}{decl}
{}{}",
        decode_nchw(dest.ty),
        window_loops(window, height, width, &update),
        dest.store("i", &result)
    )
}

fn softmax_body(cols: usize) -> String {
    format!(
        "const float* row = p1 + i * {cols};
float* out = p0 + i * {cols};
float mx = NN_NEG_INF;
for (long long j = 0; j < {cols}; ++j) {{
  if (row[j] > mx) mx = row[j];
}}
float sum = 0.0f;
for (long long j = 0; j < {cols}; ++j) {{
  out[j] = expf(row[j] - mx);
  sum += out[j];
}}
for (long long j = 0; j < {cols}; ++j) {{
  out[j] /= sum;
}}"
    )
}

fn profile_body(len: usize) -> String {
    format!(
        "float lo = p0[0];
float hi = p0[1];
for (long long j = 0; j < {len}; ++j) {{
  float v = p1[j];
  if (v < lo) lo = v;
  if (v > hi) hi = v;
}}
p0[0] = lo;
p0[1] = hi;"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn float_literals_round_trip() {
        assert_eq!(format_f32(1.0), "1.0f");
        assert_eq!(format_f32(0.1), "0.1f");
        assert_eq!(format_f32(-2.5e-8), "-0.000000025f");
        assert_eq!(format_f32(f32::NEG_INFINITY), "NN_NEG_INF");
    }

    #[test]
    fn blocks_are_reindented() {
        let mut out = String::new();
        push_block(&mut out, 1, "\n    a;\n      b;\n");
        assert_eq!(out, "  a;\n    b;\n");
    }

    #[test]
    fn transpose_decodes_destination_coordinates() {
        let body = transpose_body(&Type::f32(vec![3, 2]), &Type::f32(vec![2, 3]), &[1, 0]);
        assert!(body.contains("from += (rest % 2) * 3;"));
        assert!(body.contains("from += (rest % 3) * 1;"));
    }

    #[test]
    fn prelude_differs_only_in_header() {
        let c = prelude(Dialect::C);
        let cuda = prelude(Dialect::Cuda);
        assert!(c.contains("#include <math.h>"));
        assert!(cuda.contains("__device__"));
        let helpers = |s: &str| s[s.find("NN_FN int8_t").unwrap_or(0)..].to_string();
        assert_eq!(helpers(&c), helpers(&cuda));
    }
}
