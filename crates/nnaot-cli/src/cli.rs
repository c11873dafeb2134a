use std::path::PathBuf;

use clap::Parser;
use nnaot::{BackendKind, EngineConfig};

use crate::tensors::InputArg;

#[derive(Debug, Clone, Parser)]
#[command(name = "nnaot")]
#[command(version)]
#[command(about = "Compile a neural network ahead of time and run it")]
#[command(long_about = "
Loads a JSON graph description, optimizes it, optionally profiles or
quantizes it, lowers it and compiles it for the selected backend. The
compiled program then runs on the given inputs, or is written out as a
standalone bundle with --emit-bundle.
")]
pub struct Cli {
    /// JSON graph description
    #[arg(long)]
    pub model: PathBuf,

    /// Input tensor as NAME=FILE.json (repeatable)
    #[arg(long = "input", value_name = "NAME=FILE")]
    pub inputs: Vec<InputArg>,

    /// Execution backend (interpreter, native, gpu)
    #[arg(long)]
    pub backend: Option<BackendKind>,

    /// Instrument the graph and write quantization statistics to FILE
    #[arg(long, value_name = "FILE", conflicts_with = "load_profile")]
    pub dump_profile: Option<PathBuf>,

    /// Quantize the graph with statistics read from FILE
    #[arg(long, value_name = "FILE")]
    pub load_profile: Option<PathBuf>,

    /// Write a standalone bundle into DIR instead of running
    #[arg(long, value_name = "DIR")]
    pub emit_bundle: Option<PathBuf>,

    /// Log the optimized graph
    #[arg(long)]
    pub dump_graph: bool,

    /// Write the optimized graph as Graphviz to FILE
    #[arg(long, value_name = "FILE")]
    pub dump_graph_dag: Option<PathBuf>,

    /// Log the lowered program
    #[arg(long)]
    pub dump_ir: bool,

    /// Write the lowered program as Graphviz to FILE
    #[arg(long, value_name = "FILE")]
    pub dump_ir_dag: Option<PathBuf>,

    /// Number of times to run the compiled program
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..))]
    pub iterations: u32,

    /// Print wall time per iteration
    #[arg(long)]
    pub time: bool,

    /// Debug logging (RUST_LOG takes precedence)
    #[arg(short, long)]
    pub verbose: bool,

    /// JSON engine configuration, applied before environment and flags
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,
}

impl Cli {
    /// Configuration file, then `NNAOT_*` environment overrides, then flags.
    pub fn engine_config(&self) -> nnaot::Result<EngineConfig> {
        let mut config = match &self.config {
            Some(path) => EngineConfig::from_file(path)?,
            None => EngineConfig::default(),
        };
        config.apply_env_overrides()?;

        if let Some(backend) = self.backend {
            config.backend = backend;
        }
        if let Some(path) = &self.dump_profile {
            config.dump_profile = Some(path.clone());
        }
        if let Some(path) = &self.load_profile {
            config.load_profile = Some(path.clone());
        }
        if let Some(dir) = &self.emit_bundle {
            config.emit_bundle = Some(dir.clone());
        }
        config.dumps.graph |= self.dump_graph;
        config.dumps.ir |= self.dump_ir;
        if let Some(path) = &self.dump_graph_dag {
            config.dumps.graph_dot = Some(path.clone());
        }
        if let Some(path) = &self.dump_ir_dag {
            config.dumps.ir_dot = Some(path.clone());
        }
        config.validate()?;
        Ok(config)
    }

    /// Default log filter when `RUST_LOG` is unset.
    pub fn log_filter(&self) -> &'static str {
        if self.verbose {
            "debug"
        } else if self.dump_graph || self.dump_ir || self.time {
            "info"
        } else {
            "warn"
        }
    }
}
