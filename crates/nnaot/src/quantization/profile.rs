use std::collections::HashMap;

use super::info::NodeQuantizationInfo;
use crate::error::Result;
use crate::graph::{Function, NodeId, NodeKind, Visibility};
use crate::tensor::Tensor;

/// Suffix of the statistics variable attached to a profiled value.
pub const PROFILE_STATS_SUFFIX: &str = "__profile";

/// True for variables that receive results or statistics rather than feed
/// computation.
fn is_destination_variable(function: &Function, id: NodeId) -> bool {
    function.users(id).iter().any(|user| {
        function.try_node(*user).is_some_and(|node| {
            matches!(node.kind(), NodeKind::Save | NodeKind::QuantizationProfile)
                && node.input(1) == Some(id)
        })
    })
}

fn is_profiled(function: &Function, id: NodeId) -> bool {
    function.users(id).iter().any(|user| {
        function.try_node(*user).is_some_and(|node| {
            matches!(node.kind(), NodeKind::QuantizationProfile) && node.input(0) == Some(id)
        })
    })
}

/// Attaches a statistics collector to every floating-point value.
///
/// Each collector owns a private `f32<2>` variable holding `[min, max]`,
/// initialised to `[+inf, -inf]` and widened by every execution. Values that
/// already carry a collector are skipped, so the pass is idempotent. Returns
/// the number of collectors added.
pub fn profile_quantization(function: &mut Function) -> Result<usize> {
    let mut added = 0usize;
    for id in function.topological_order()? {
        let node = function.node(id)?;
        let Some(ty) = node.ty() else {
            continue;
        };
        if !ty.is_float() || is_profiled(function, id) || is_destination_variable(function, id) {
            continue;
        }
        let name = node.name().to_string();
        let stats = Tensor::from_f32(vec![2], vec![f32::INFINITY, f32::NEG_INFINITY])?;
        let stats_var = function.create_variable(
            &format!("{name}{PROFILE_STATS_SUFFIX}"),
            Visibility::Private,
            stats,
        )?;
        function.create_node(
            &format!("{name}__collect"),
            NodeKind::QuantizationProfile,
            &[id, stats_var],
            None,
        )?;
        added += 1;
    }
    log::info!(
        "instrumented {added} values of `{}` for quantization profiling",
        function.name()
    );
    Ok(added)
}

/// Folds an observed tensor into `[min, max]` statistics.
pub fn accumulate_range(stats: &mut [f32], values: &[f32]) {
    for &value in values {
        if value < stats[0] {
            stats[0] = value;
        }
        if value > stats[1] {
            stats[1] = value;
        }
    }
}

/// Extracts the observed ranges, ordered like the profiled values in the graph.
///
/// Collectors that never ran (min > max) are skipped with a warning.
pub fn generate_node_quantization_infos(function: &Function) -> Result<Vec<NodeQuantizationInfo>> {
    let order = function.topological_order()?;
    let position: HashMap<NodeId, usize> =
        order.iter().enumerate().map(|(pos, id)| (*id, pos)).collect();

    let mut collected: Vec<(usize, NodeQuantizationInfo)> = Vec::new();
    for &id in &order {
        let node = function.node(id)?;
        if !matches!(node.kind(), NodeKind::QuantizationProfile) {
            continue;
        }
        let (observed, stats_var) = (node.inputs()[0], node.inputs()[1]);
        let stats = function.variable_payload(stats_var)?;
        let range = stats.as_f32().unwrap_or(&[]);
        let name = function.name_of(observed);
        let [min, max] = range else {
            log::warn!("statistics of `{name}` are malformed; skipping");
            continue;
        };
        if min > max {
            log::warn!("no statistics were recorded for `{name}`; run the program before extracting");
            continue;
        }
        collected.push((
            position[&observed],
            NodeQuantizationInfo::new(name, *min, *max),
        ));
    }
    collected.sort_by_key(|(pos, _)| *pos);
    Ok(collected.into_iter().map(|(_, info)| info).collect())
}
