use std::collections::HashSet;

use crate::error::Result;
use crate::graph::{Function, NodeId};
use crate::optimizer::{FunctionPass, OptimizeContext, PassResult};

/// Removes every node with no path to a sink. Public variables are always kept.
#[derive(Default)]
pub struct DeadCodeEliminationPass;

impl DeadCodeEliminationPass {
    const NAME: &'static str = "dce";
}

impl FunctionPass for DeadCodeEliminationPass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(&self, function: &mut Function, _cx: &mut OptimizeContext) -> Result<PassResult> {
        let mut worklist: Vec<NodeId> = Vec::new();
        for id in function.node_ids() {
            let node = function.node(id)?;
            if node.kind().is_sink() || node.is_public_variable() {
                worklist.push(id);
            }
        }

        let mut live: HashSet<NodeId> = HashSet::new();
        while let Some(id) = worklist.pop() {
            if !live.insert(id) {
                continue;
            }
            worklist.extend(function.node(id)?.inputs().iter().copied());
        }

        let order = function.topological_order()?;
        let mut stats = PassResult {
            iterations: order.len(),
            ..PassResult::default()
        };
        for id in order.into_iter().rev() {
            if live.contains(&id) {
                continue;
            }
            function.erase_node(id)?;
            stats.erased_nodes += 1;
        }
        stats.changed = stats.erased_nodes > 0;
        Ok(stats)
    }
}
