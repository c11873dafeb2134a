use std::collections::HashMap;

use super::replace_value;
use crate::error::Result;
use crate::graph::{Function, NodeId};
use crate::optimizer::{FunctionPass, OptimizeContext, PassResult};

/// Common-subexpression elimination for pure operators.
///
/// Hashes `(kind, inputs, output type)` for every pure node in topological
/// order and replaces later duplicates with the first occurrence.
#[derive(Default)]
pub struct CommonSubexpressionEliminationPass;

impl CommonSubexpressionEliminationPass {
    const NAME: &'static str = "cse";
}

impl FunctionPass for CommonSubexpressionEliminationPass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(&self, function: &mut Function, _cx: &mut OptimizeContext) -> Result<PassResult> {
        let mut seen: HashMap<Vec<u8>, NodeId> = HashMap::new();
        let mut stats = PassResult::default();

        for id in function.topological_order()? {
            let Some(node) = function.try_node(id) else {
                continue;
            };
            stats.iterations += 1;
            if !node.kind().is_pure() {
                continue;
            }
            let Some(key) = node.structural_key() else {
                continue;
            };
            if let Some(existing) = seen.get(&key).copied() {
                replace_value(function, id, existing, &mut stats)?;
                continue;
            }
            seen.insert(key, id);
        }

        Ok(stats)
    }
}
