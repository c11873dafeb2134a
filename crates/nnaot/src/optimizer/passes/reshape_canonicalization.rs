use super::replace_value;
use crate::error::Result;
use crate::graph::{Function, NodeKind};
use crate::optimizer::{FunctionPass, OptimizeContext, PassResult};

/// Removes reshapes to the input's own shape and folds reshape chains.
#[derive(Default)]
pub struct ReshapeCanonicalizationPass;

impl ReshapeCanonicalizationPass {
    const NAME: &'static str = "reshape-canonicalize";
}

impl FunctionPass for ReshapeCanonicalizationPass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(&self, function: &mut Function, _cx: &mut OptimizeContext) -> Result<PassResult> {
        let mut stats = PassResult::default();
        for id in function.topological_order()? {
            let Some(node) = function.try_node(id) else {
                continue;
            };
            let NodeKind::Reshape { dims } = node.kind() else {
                continue;
            };
            stats.iterations += 1;
            let dims = dims.clone();
            let src = node.inputs()[0];
            let src_node = function.node(src)?;
            let inner_base = match src_node.kind() {
                NodeKind::Reshape { .. } => Some(src_node.inputs()[0]),
                _ => None,
            };

            if function.output_type(src)?.dims() == dims.as_slice() {
                replace_value(function, id, src, &mut stats)?;
                continue;
            }

            if let Some(base) = inner_base {
                function.mutate_node(id, NodeKind::Reshape { dims }, &[base])?;
                stats.changed = true;
                stats.rewrites_applied += 1;
                if !function.has_users(src) {
                    function.erase_node(src)?;
                    stats.erased_nodes += 1;
                }
            }
        }
        Ok(stats)
    }
}
