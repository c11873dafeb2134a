//! Graph optimizer: semantics-preserving rewrites run to a bounded fixed point.
//!
//! Passes are independent and individually idempotent. The pipeline is
//! re-runnable: a second [`optimize`] over an already optimized function makes
//! no change, which the quantization flow relies on to rebuild the same graph
//! shape in the profiling and the rewrite invocation.

mod passes;
mod pipeline;

use serde::{Deserialize, Serialize};

use crate::backend::CompilationMode;
use crate::error::Result;
use crate::graph::Function;

pub use passes::{
    CommonSubexpressionEliminationPass, DeadCodeEliminationPass, QuantizationFoldPass,
    ReshapeCanonicalizationPass, TransposeCanonicalizationPass,
};
pub use pipeline::{PipelineBuilder, PipelineOptimizer, Step};

/// Result returned by a [`FunctionPass`] after it runs.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassResult {
    /// Whether the pass changed the graph.
    pub changed: bool,
    /// Number of nodes visited.
    pub iterations: usize,
    /// Number of rewrites applied.
    pub rewrites_applied: usize,
    /// Nodes removed by the pass.
    pub erased_nodes: usize,
}

impl PassResult {
    /// Merges two run results, accumulating statistics.
    pub fn merge(self, other: PassResult) -> PassResult {
        PassResult {
            changed: self.changed || other.changed,
            iterations: self.iterations + other.iterations,
            rewrites_applied: self.rewrites_applied + other.rewrites_applied,
            erased_nodes: self.erased_nodes + other.erased_nodes,
        }
    }
}

/// State shared by the passes of one pipeline run.
#[derive(Debug, Clone, Copy)]
pub struct OptimizeContext {
    pub mode: CompilationMode,
}

/// Interface implemented by rewrites over a single function.
pub trait FunctionPass: Send + Sync {
    fn name(&self) -> &'static str;
    fn run(&self, function: &mut Function, cx: &mut OptimizeContext) -> Result<PassResult>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    /// Upper bound on fixed-point iterations.
    pub max_iters: usize,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self { max_iters: 16 }
    }
}

/// Runs the declared pass order for `mode` on `function`.
pub fn optimize(
    function: &mut Function,
    mode: CompilationMode,
    config: &OptimizerConfig,
) -> Result<PassResult> {
    let optimizer = PipelineOptimizer::new(mode, config);
    let result = optimizer.optimize(function)?;
    log::debug!(
        target: "nnaot::optimizer",
        "optimized `{}`: {} rewrites, {} nodes erased, {} nodes left",
        function.name(),
        result.rewrites_applied,
        result.erased_nodes,
        function.len()
    );
    Ok(result)
}
