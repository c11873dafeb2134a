//! Execution engine: owns one graph, its lowered program and the compiled
//! artifact, and drives them through the configured flow.

use std::path::Path;
use std::sync::Arc;

use crate::backend::registry;
use crate::backend::{Backend, BundleManifest, CompilationMode, CompiledFunction, IoBindings};
use crate::config::EngineConfig;
use crate::dump::write_dot;
use crate::error::{CompileError, Result};
use crate::graph::Function;
use crate::ir::{lower, IrFunction, WeightRole};
use crate::optimizer::optimize;
use crate::quantization::{
    deserialize_from_file, generate_node_quantization_infos, generate_quantized_graph,
    profile_quantization, serialize_to_file, QuantizationReport,
};
use crate::tensor::Tensor;

pub struct ExecutionEngine {
    config: EngineConfig,
    function: Function,
    prepared: bool,
    /// Profiling instrumentation or quantization has been applied.
    instrumented: bool,
    report: Option<QuantizationReport>,
    lowered: Option<IrFunction>,
    compiled: Option<Box<dyn CompiledFunction>>,
}

impl ExecutionEngine {
    /// Validates `config` and creates an engine around an empty graph.
    pub fn new(config: EngineConfig) -> Result<Self> {
        Self::with_function(config, Function::new("main"))
    }

    pub fn with_function(config: EngineConfig, function: Function) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            function,
            prepared: false,
            instrumented: false,
            report: None,
            lowered: None,
            compiled: None,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn function(&self) -> &Function {
        &self.function
    }

    /// Mutable graph access; drops any prepared or compiled state.
    ///
    /// Profiling instrumentation and quantization are applied once per
    /// engine: after they ran, the next `prepare` only re-optimizes the edited
    /// graph and leaves its precision as it is.
    pub fn function_mut(&mut self) -> &mut Function {
        self.prepared = false;
        self.lowered = None;
        self.compiled = None;
        &mut self.function
    }

    pub fn lowered(&self) -> Option<&IrFunction> {
        self.lowered.as_ref()
    }

    pub fn quantization_report(&self) -> Option<&QuantizationReport> {
        self.report.as_ref()
    }

    /// Optimizes the graph, then instruments it for profiling or quantizes it
    /// from a statistics file, as configured. Runs at most once per graph.
    pub fn prepare(&mut self) -> Result<()> {
        if self.prepared {
            return Ok(());
        }
        self.function.verify()?;
        let stats = optimize(&mut self.function, self.config.mode, &self.config.optimizer)?;
        log::info!(
            "optimized `{}`: {} rewrites, {} nodes erased",
            self.function.name(),
            stats.rewrites_applied,
            stats.erased_nodes
        );

        if self.instrumented {
            log::debug!(
                "`{}` is already instrumented or quantized; keeping it as is",
                self.function.name()
            );
        } else if self.config.dump_profile.is_some() {
            profile_quantization(&mut self.function)?;
            self.instrumented = true;
        } else if let Some(path) = self.config.load_profile.clone() {
            let infos = deserialize_from_file(&path)?;
            let report = generate_quantized_graph(
                &mut self.function,
                &infos,
                &self.config.quantization,
                &self.config.optimizer,
            )?;
            self.report = Some(report);
            self.instrumented = true;
        }

        if self.config.dumps.graph {
            log::info!("graph dump:\n{}", self.function.dump()?);
        }
        if let Some(path) = &self.config.dumps.graph_dot {
            write_dot(path, &self.function.dump_dot()?)?;
        }
        self.prepared = true;
        Ok(())
    }

    fn lower(&mut self) -> Result<&IrFunction> {
        self.prepare()?;
        let ir = lower(&self.function)?;
        if self.config.dumps.ir {
            log::info!("lowered program:\n{ir}");
        }
        if let Some(path) = &self.config.dumps.ir_dot {
            write_dot(path, &ir.dump_dot())?;
        }
        Ok(self.lowered.insert(ir))
    }

    fn backend(&self) -> Result<Arc<dyn Backend>> {
        Ok(registry::create_backend(self.config.backend)?)
    }

    /// Lowers and compiles the graph for the configured backend.
    pub fn compile(&mut self, mode: CompilationMode) -> Result<()> {
        let backend = self.backend()?;
        let ir = self.lower()?;
        log::info!("compiling `{}` with the {} backend ({mode})", ir.name(), backend.name());
        let compiled = backend.compile(ir, mode)?;
        self.compiled = Some(compiled);
        Ok(())
    }

    /// Writes a standalone bundle into `output_dir` without executing anything.
    pub fn save(&mut self, mode: CompilationMode, output_dir: &Path) -> Result<BundleManifest> {
        let backend = self.backend()?;
        std::fs::create_dir_all(output_dir).map_err(|err| CompileError::io(output_dir, err))?;
        let ir = self.lower()?;
        let manifest = backend.save(ir, mode, output_dir)?;
        log::info!(
            "saved bundle `{}` to {} ({} files)",
            manifest.name,
            output_dir.display(),
            manifest.files.len()
        );
        Ok(manifest)
    }

    /// Binds `inputs` to public variables and executes the compiled program.
    ///
    /// Every binding is checked before the backend is invoked. Inputs that
    /// are not rebound keep their last value. Outputs and quantization
    /// statistics are copied back into the graph's variables.
    pub fn run(&mut self, inputs: &[(&str, &Tensor)]) -> Result<()> {
        let (Some(ir), Some(compiled)) = (self.lowered.as_ref(), self.compiled.as_mut()) else {
            return Err(CompileError::Config(
                "compile must succeed before run".to_string(),
            ));
        };

        for (name, tensor) in inputs {
            let weight = match ir.weight(name) {
                Some((_, weight)) if weight.role == WeightRole::Input => weight,
                _ => return Err(CompileError::NotFound(format!("input `{name}`"))),
            };
            if tensor.ty() != &weight.ty {
                return Err(CompileError::type_mismatch(
                    *name,
                    format!("bound {} but the graph declares {}", tensor.ty(), weight.ty),
                ));
            }
        }
        for (name, tensor) in inputs {
            let id = self.function.node_by_name(name)?;
            self.function.set_variable_payload(id, (*tensor).clone())?;
        }

        let mut io = IoBindings::new();
        for weight in ir.weights() {
            if weight.role == WeightRole::Constant {
                continue;
            }
            let id = self.function.node_by_name(&weight.name)?;
            io.insert(
                weight.name.clone(),
                self.function.variable_payload(id)?.clone(),
            );
        }

        compiled.execute(&mut io)?;

        for weight in ir.weights() {
            if !weight.role.is_writable() {
                continue;
            }
            let tensor = io.take(&weight.name).ok_or_else(|| {
                CompileError::NotFound(format!("result `{}` after execution", weight.name))
            })?;
            let id = self.function.node_by_name(&weight.name)?;
            self.function.set_variable_payload(id, tensor)?;
        }
        Ok(())
    }

    /// Current tensor of an output (or any) variable.
    pub fn output(&self, name: &str) -> Result<&Tensor> {
        let id = self.function.node_by_name(name)?;
        self.function.variable_payload(id)
    }

    /// Writes the statistics collected so far to the configured profile path.
    pub fn write_profile(&self) -> Result<usize> {
        let path = self.config.dump_profile.as_ref().ok_or_else(|| {
            CompileError::Config("no dump-profile path is configured".to_string())
        })?;
        let infos = generate_node_quantization_infos(&self.function)?;
        serialize_to_file(path, &infos)?;
        Ok(infos.len())
    }
}
