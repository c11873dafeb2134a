mod cse;
mod dce;
mod quantization_fold;
mod reshape_canonicalization;
mod transpose_canonicalization;

pub use cse::CommonSubexpressionEliminationPass;
pub use dce::DeadCodeEliminationPass;
pub use quantization_fold::QuantizationFoldPass;
pub use reshape_canonicalization::ReshapeCanonicalizationPass;
pub use transpose_canonicalization::TransposeCanonicalizationPass;

use super::PassResult;
use crate::error::Result;
use crate::graph::{Function, NodeId};

/// Rewires consumers of `from` to `to` and drops `from` once unreferenced.
fn replace_value(
    function: &mut Function,
    from: NodeId,
    to: NodeId,
    stats: &mut PassResult,
) -> Result<()> {
    if from == to {
        return Ok(());
    }
    function.replace_all_uses_with(from, to)?;
    if !function.has_users(from) {
        function.erase_node(from)?;
        stats.erased_nodes += 1;
    }
    stats.changed = true;
    stats.rewrites_applied += 1;
    Ok(())
}
