use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use super::info::NodeQuantizationInfo;
use super::params::{choose_quantization_params, QuantParams};
use crate::backend::CompilationMode;
use crate::error::{CompileError, Result};
use crate::graph::{Function, NodeId, NodeKind};
use crate::optimizer::{optimize, OptimizerConfig};
use crate::tensor::ElemKind;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuantizationOptions {
    /// Treat a floating-point value without a record as a profile mismatch
    /// instead of leaving it in floating point.
    pub strict_coverage: bool,
}

/// Outcome of the quantization rewrite.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QuantizationReport {
    /// Operators converted to fixed point.
    pub quantized: Vec<String>,
    /// Quantizable operators left in floating point for lack of statistics.
    pub gaps: Vec<String>,
}

impl QuantizationReport {
    pub fn gap_count(&self) -> usize {
        self.gaps.len()
    }
}

/// Operator kinds with a fixed-point implementation in every backend.
pub fn is_quantizable(kind: &NodeKind) -> bool {
    matches!(
        kind,
        NodeKind::Add
            | NodeKind::Sub
            | NodeKind::Mul
            | NodeKind::Max
            | NodeKind::Min
            | NodeKind::Relu
            | NodeKind::MatMul
            | NodeKind::FullyConnected
            | NodeKind::Convolution { .. }
            | NodeKind::MaxPool { .. }
            | NodeKind::AvgPool { .. }
            | NodeKind::Transpose { .. }
            | NodeKind::Reshape { .. }
    )
}

/// Data movement keeps its operand's parameters instead of its own record.
fn inherits_operand_params(kind: &NodeKind) -> bool {
    matches!(kind, NodeKind::Transpose { .. } | NodeKind::Reshape { .. })
}

fn has_bias(kind: &NodeKind) -> bool {
    matches!(kind, NodeKind::FullyConnected | NodeKind::Convolution { .. })
}

/// Resolves every record against the graph, failing on any drift.
fn match_profile(
    function: &Function,
    infos: &[NodeQuantizationInfo],
    options: &QuantizationOptions,
) -> Result<HashMap<NodeId, QuantParams>> {
    if function
        .node_ids()
        .into_iter()
        .any(|id| matches!(function.try_node(id).map(|n| n.kind()), Some(NodeKind::QuantizationProfile)))
    {
        return Err(CompileError::profile_mismatch(format!(
            "`{}` is still instrumented for profiling",
            function.name()
        )));
    }

    let mut params = HashMap::with_capacity(infos.len());
    let mut seen = HashSet::new();
    let mut unknown = Vec::new();
    for info in infos {
        if !seen.insert(info.name.as_str()) {
            return Err(CompileError::profile_mismatch(format!(
                "duplicate record for `{}`",
                info.name
            )));
        }
        let Ok(id) = function.node_by_name(&info.name) else {
            unknown.push(info.name.clone());
            continue;
        };
        match function.node(id)?.ty() {
            Some(ty) if ty.is_float() => {}
            _ => {
                return Err(CompileError::profile_mismatch(format!(
                    "record `{}` names a value that is not floating point",
                    info.name
                )))
            }
        }
        params.insert(id, choose_quantization_params(info.min, info.max));
    }
    if !unknown.is_empty() {
        return Err(CompileError::profile_mismatch(format!(
            "{} record(s) name values absent from `{}`: {}",
            unknown.len(),
            function.name(),
            preview(&unknown)
        )));
    }

    if options.strict_coverage {
        let missing: Vec<String> = function
            .node_ids()
            .into_iter()
            .filter_map(|id| function.try_node(id).map(|n| (id, n)))
            .filter(|(id, n)| {
                n.ty().is_some_and(|t| t.is_float())
                    && !params.contains_key(id)
                    && !is_output_variable(function, *id)
            })
            .map(|(_, n)| n.name().to_string())
            .collect();
        if !missing.is_empty() {
            return Err(CompileError::profile_mismatch(format!(
                "{} value(s) of `{}` have no record: {}",
                missing.len(),
                function.name(),
                preview(&missing)
            )));
        }
    }
    Ok(params)
}

/// Public variables written by a save are results, never profiled.
fn is_output_variable(function: &Function, id: NodeId) -> bool {
    let users = function.users(id);
    !users.is_empty()
        && users.iter().all(|user| {
            function
                .try_node(*user)
                .is_some_and(|n| matches!(n.kind(), NodeKind::Save) && n.input(1) == Some(id))
        })
}

fn preview(names: &[String]) -> String {
    const SHOWN: usize = 8;
    let mut text = names.iter().take(SHOWN).cloned().collect::<Vec<_>>().join(", ");
    if names.len() > SHOWN {
        text.push_str(&format!(", ... ({} more)", names.len() - SHOWN));
    }
    text
}

/// Replaces floating-point operators with fixed-point ones using `infos`.
///
/// Every quantizable operator whose output and floating-point operands all
/// have a record is rebuilt on int8 values; the rest stay in floating point
/// and are reported as gaps. Quantize/Dequantize boundaries are inserted
/// around each converted operator and then folded by the optimizer, so only
/// the transitions between fixed-point and floating-point regions remain.
///
/// The graph must have been built and optimized exactly like the profiled
/// one: names are the only link between records and values. The boundary
/// cleanup runs under `optimizer`'s bounds.
pub fn generate_quantized_graph(
    function: &mut Function,
    infos: &[NodeQuantizationInfo],
    options: &QuantizationOptions,
    optimizer: &OptimizerConfig,
) -> Result<QuantizationReport> {
    let mut params = match_profile(function, infos, options)?;
    let mut report = QuantizationReport::default();

    for id in function.topological_order()? {
        let node = function.node(id)?;
        if !is_quantizable(node.kind()) || !node.ty().is_some_and(|t| t.is_float()) {
            continue;
        }
        let name = node.name().to_string();
        let kind = node.kind().clone();
        let inputs = node.inputs().to_vec();
        let out_ty = function.output_type(id)?.clone();

        let data_inputs = if has_bias(&kind) {
            &inputs[..2]
        } else {
            &inputs[..]
        };
        let operand_params: Option<Vec<QuantParams>> =
            data_inputs.iter().map(|i| params.get(i).copied()).collect();
        let own = params.get(&id).copied();
        let (Some(operand_params), Some(own)) = (operand_params, own) else {
            log::warn!("`{name}` has no quantization statistics; keeping it in floating point");
            report.gaps.push(name);
            continue;
        };

        let mut quantized_inputs = Vec::with_capacity(inputs.len());
        for (slot, &input) in inputs.iter().enumerate() {
            let input_ty = function.output_type(input)?.clone();
            let elem = if slot == 2 && has_bias(&kind) {
                ElemKind::I32Q {
                    scale: operand_params[0].scale * operand_params[1].scale,
                    offset: 0,
                }
            } else {
                ElemKind::i8q(operand_params[slot])
            };
            let input_name = function.name_of(input);
            let q = function.create_quantize(
                &format!("{input_name}__quantize"),
                input,
                input_ty.with_elem(elem),
            )?;
            quantized_inputs.push(q);
        }

        let out_elem = if inherits_operand_params(&kind) {
            ElemKind::i8q(operand_params[0])
        } else {
            ElemKind::i8q(own)
        };
        let quantized = function.create_node(
            &format!("{name}__q"),
            kind,
            &quantized_inputs,
            Some(out_ty.with_elem(out_elem)),
        )?;
        let boundary = function.create_dequantize(&format!("{name}__dequantize"), quantized)?;
        function.replace_all_uses_with(id, boundary)?;
        function.erase_node(id)?;
        if let Some(p) = out_elem.quant_params() {
            params.insert(boundary, p);
        }
        report.quantized.push(name);
    }

    if !report.quantized.is_empty() {
        optimize(function, CompilationMode::Infer, optimizer)?;
    }
    log::info!(
        "quantized {} operators of `{}`; {} left in floating point",
        report.quantized.len(),
        function.name(),
        report.gap_count()
    );
    Ok(report)
}

