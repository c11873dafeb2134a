use super::replace_value;
use crate::error::{CompileError, Result};
use crate::graph::{Function, NodeId, NodeKind, Visibility};
use crate::optimizer::{FunctionPass, OptimizeContext, PassResult};
use crate::quantization::{quantize_i32, quantize_i8, QuantParams};
use crate::tensor::{ElemKind, Tensor, TensorData, Type};

/// Cleans up fixed-point boundaries:
///
/// - `quantize(dequantize(q))` becomes `q`, or a rescale when the types differ;
/// - rescales to the operand's own type vanish and rescale chains collapse;
/// - quantizing a private constant or a splat is folded at compile time.
#[derive(Default)]
pub struct QuantizationFoldPass;

impl QuantizationFoldPass {
    const NAME: &'static str = "quantization-fold";
}

fn quantize_payload(payload: &Tensor, ty: &Type) -> Result<Tensor> {
    let values = payload.as_f32().ok_or_else(|| {
        CompileError::type_mismatch("<constant>", "only float constants can be quantized")
    })?;
    let data = match ty.elem() {
        ElemKind::I8Q { scale, offset } => {
            let p = QuantParams::new(scale, offset);
            TensorData::I8(values.iter().map(|v| quantize_i8(*v, p)).collect())
        }
        ElemKind::I32Q { scale, offset } => {
            let p = QuantParams::new(scale, offset);
            TensorData::I32(values.iter().map(|v| quantize_i32(*v, p)).collect())
        }
        other => {
            return Err(CompileError::type_mismatch(
                "<constant>",
                format!("{other} is not a fixed-point kind"),
            ))
        }
    };
    Tensor::new(ty.clone(), data)
}

impl FunctionPass for QuantizationFoldPass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(&self, function: &mut Function, _cx: &mut OptimizeContext) -> Result<PassResult> {
        let mut stats = PassResult::default();
        for id in function.topological_order()? {
            let Some(node) = function.try_node(id) else {
                continue;
            };
            if !matches!(node.kind(), NodeKind::Quantize | NodeKind::RescaleQuantized) {
                continue;
            }
            stats.iterations += 1;
            let is_rescale = matches!(node.kind(), NodeKind::RescaleQuantized);
            let src = node.inputs()[0];
            let ty = function.output_type(id)?.clone();
            let src_node = function.node(src)?;
            let src_kind = src_node.kind().clone();
            let src_name = src_node.name().to_string();
            let src_input: Option<NodeId> = src_node.input(0);

            match (is_rescale, src_kind) {
                (false, NodeKind::Dequantize) | (true, NodeKind::RescaleQuantized) => {
                    let Some(base) = src_input else { continue };
                    if function.output_type(base)? == &ty {
                        replace_value(function, id, base, &mut stats)?;
                    } else {
                        function.mutate_node(id, NodeKind::RescaleQuantized, &[base])?;
                        stats.changed = true;
                        stats.rewrites_applied += 1;
                    }
                }
                (true, _) => {
                    if function.output_type(src)? == &ty {
                        replace_value(function, id, src, &mut stats)?;
                    }
                    continue;
                }
                (
                    false,
                    NodeKind::Variable {
                        visibility: Visibility::Private,
                        payload,
                    },
                ) => {
                    let folded = quantize_payload(&payload, &ty)?;
                    let constant =
                        function.create_constant(&format!("{src_name}__quantized"), folded)?;
                    replace_value(function, id, constant, &mut stats)?;
                }
                (false, NodeKind::Splat { value }) => {
                    let splat = function.create_splat(&format!("{src_name}__quantized"), ty, value)?;
                    replace_value(function, id, splat, &mut stats)?;
                }
                _ => continue,
            }
            if function.contains(src) && !function.has_users(src) && function.node(src)?.kind().is_pure() {
                function.erase_node(src)?;
                stats.erased_nodes += 1;
            }
        }
        Ok(stats)
    }
}
