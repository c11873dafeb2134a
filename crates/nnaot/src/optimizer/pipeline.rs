use std::sync::Arc;

use super::passes::{
    CommonSubexpressionEliminationPass, DeadCodeEliminationPass, QuantizationFoldPass,
    ReshapeCanonicalizationPass, TransposeCanonicalizationPass,
};
use super::{FunctionPass, OptimizeContext, OptimizerConfig, PassResult};
use crate::backend::CompilationMode;
use crate::error::Result;
use crate::graph::Function;

pub enum Step {
    Pass(Arc<dyn FunctionPass>),
    FixedPoint { max_iters: usize, steps: Vec<Step> },
}

pub struct PipelineBuilder {
    steps: Vec<Step>,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self { steps: Vec::new() }
    }

    pub fn pass(&mut self, pass: Arc<dyn FunctionPass>) {
        self.steps.push(Step::Pass(pass));
    }

    pub fn fixed_point<F>(&mut self, max_iters: usize, build: F)
    where
        F: FnOnce(&mut PipelineBuilder),
    {
        let mut inner = PipelineBuilder::new();
        build(&mut inner);
        self.steps.push(Step::FixedPoint {
            max_iters: max_iters.max(1),
            steps: inner.steps,
        });
    }

    pub fn finish(self) -> Vec<Step> {
        self.steps
    }
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// The fixed pass order for one compilation mode.
pub struct PipelineOptimizer {
    mode: CompilationMode,
    steps: Vec<Step>,
}

impl PipelineOptimizer {
    pub fn new(mode: CompilationMode, config: &OptimizerConfig) -> Self {
        let mut builder = PipelineBuilder::new();

        fn canonicalize(p: &mut PipelineBuilder, mode: CompilationMode) {
            p.pass(Arc::new(TransposeCanonicalizationPass));
            p.pass(Arc::new(ReshapeCanonicalizationPass));
            if mode == CompilationMode::Infer {
                p.pass(Arc::new(QuantizationFoldPass));
            }
        }

        builder.fixed_point(config.max_iters, |p| {
            canonicalize(p, mode);
            p.pass(Arc::new(CommonSubexpressionEliminationPass));
            p.pass(Arc::new(DeadCodeEliminationPass));
        });

        Self {
            mode,
            steps: builder.finish(),
        }
    }

    pub fn from_steps(mode: CompilationMode, steps: Vec<Step>) -> Self {
        Self { mode, steps }
    }

    pub fn optimize(&self, function: &mut Function) -> Result<PassResult> {
        let mut cx = OptimizeContext { mode: self.mode };
        let mut result = PassResult::default();
        run_steps(&self.steps, function, &mut cx, &mut result)?;
        Ok(result)
    }
}

fn run_steps(
    steps: &[Step],
    function: &mut Function,
    cx: &mut OptimizeContext,
    totals: &mut PassResult,
) -> Result<bool> {
    let mut changed_any = false;
    for step in steps {
        match step {
            Step::Pass(pass) => {
                let stats = pass.run(function, cx)?;
                changed_any |= stats.changed;
                *totals = totals.merge(stats);
                if stats.changed {
                    log::debug!(
                        target: "nnaot::optimizer",
                        "{}: pass `{}` rewrites={} erased={} nodes={}",
                        function.name(),
                        pass.name(),
                        stats.rewrites_applied,
                        stats.erased_nodes,
                        function.len()
                    );
                }
            }
            Step::FixedPoint { max_iters, steps } => {
                let mut iter = 0usize;
                loop {
                    if iter >= *max_iters {
                        log::debug!(
                            target: "nnaot::optimizer",
                            "{}: fixed point not reached after {max_iters} iterations",
                            function.name()
                        );
                        break;
                    }
                    iter += 1;
                    let mut local = PassResult::default();
                    let changed = run_steps(steps, function, cx, &mut local)?;
                    *totals = totals.merge(local);
                    changed_any |= changed;
                    if !changed {
                        break;
                    }
                }
            }
        }
    }
    Ok(changed_any)
}
