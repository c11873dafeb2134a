//! Command line driver: JSON model import, input files, the compile/run flow
//! and result reporting. `main.rs` only parses arguments and sets up logging.

pub mod cli;
pub mod model;
pub mod report;
pub mod tensors;

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use nnaot::backend::BundleManifest;
use nnaot::graph::Function;
use nnaot::import::ModelImporter;
use nnaot::{ExecutionEngine, Tensor};

pub use cli::Cli;
pub use model::{JsonImporter, ModelDescription};
pub use report::OutputReport;
pub use tensors::{load_inputs, InputArg, TensorFile};

/// Registers every backend this binary ships with.
pub fn register_backends() {
    nnaot_backend_interp::register();
    nnaot_backend_c::register();
    nnaot_backend_cuda::register();
}

/// What one invocation produced.
#[derive(Debug)]
pub enum Outcome {
    Ran {
        outputs: Vec<OutputReport>,
        timings: Vec<Duration>,
        /// Statistics written in profiling mode, and where.
        profiled: Option<(usize, PathBuf)>,
    },
    Bundle(BundleManifest),
}

/// Imports the model, prepares and compiles it, then runs it or saves a bundle.
pub fn execute(cli: &Cli) -> anyhow::Result<Outcome> {
    let config = cli.engine_config().context("building the engine configuration")?;
    let model = ModelDescription::from_file(&cli.model)
        .with_context(|| format!("loading model {}", cli.model.display()))?;
    let inputs = load_inputs(&cli.inputs)?;
    let bindings: Vec<(&str, &Tensor)> = inputs
        .iter()
        .map(|(name, tensor)| (name.as_str(), tensor))
        .collect();

    let declared: Vec<String> = model.input_names().into_iter().map(str::to_string).collect();
    for name in &declared {
        if !bindings.iter().any(|(bound, _)| *bound == name.as_str()) {
            bail!("model `{}` needs input `{name}`; pass --input {name}=FILE", model.name);
        }
    }
    let output_names: Vec<String> = model.outputs.iter().map(|o| o.name.clone()).collect();

    let mode = config.mode;
    let bundle_dir = config.emit_bundle.clone();
    let profile_path = config.dump_profile.clone();
    let importer = JsonImporter::new(model);
    let mut engine =
        ExecutionEngine::with_function(config, Function::new(importer.model().name.clone()))?;
    let imported = importer
        .import(engine.function_mut(), &bindings)
        .context("importing the model")?;
    let requested: Vec<&str> = declared.iter().map(String::as_str).collect();
    imported.check_inputs(engine.function(), &requested)?;

    engine.prepare().context("preparing the graph")?;
    if let Some(report) = engine.quantization_report() {
        log::info!(
            "quantized {} operators, {} left in floating point",
            report.quantized.len(),
            report.gap_count()
        );
    }

    if let Some(dir) = bundle_dir {
        let manifest = engine
            .save(mode, &dir)
            .with_context(|| format!("saving a bundle into {}", dir.display()))?;
        return Ok(Outcome::Bundle(manifest));
    }

    engine.compile(mode).context("compiling the graph")?;
    let mut timings = Vec::with_capacity(cli.iterations as usize);
    for iteration in 0..cli.iterations {
        let start = Instant::now();
        engine
            .run(&bindings)
            .with_context(|| format!("running iteration {iteration}"))?;
        timings.push(start.elapsed());
    }

    let profiled = match profile_path {
        Some(path) => {
            let count = engine
                .write_profile()
                .context("writing the quantization profile")?;
            Some((count, path))
        }
        None => None,
    };

    let outputs = output_names
        .iter()
        .map(|name| {
            let tensor = engine.output(name)?;
            OutputReport::new(name, tensor)
        })
        .collect::<nnaot::Result<Vec<_>>>()?;
    Ok(Outcome::Ran {
        outputs,
        timings,
        profiled,
    })
}

/// Prints `outcome` to stdout the way the binary reports it.
pub fn print_outcome(cli: &Cli, outcome: &Outcome) {
    match outcome {
        Outcome::Bundle(manifest) => {
            println!(
                "bundle `{}` ({} backend, entry `{}`): {} activation bytes, {} weight bytes",
                manifest.name,
                manifest.backend,
                manifest.entry,
                manifest.activation_bytes,
                manifest.weights_bytes
            );
            for file in &manifest.files {
                println!("  {file}");
            }
        }
        Outcome::Ran {
            outputs,
            timings,
            profiled,
        } => {
            if cli.time {
                for (iteration, elapsed) in timings.iter().enumerate() {
                    println!("iteration {iteration}: {:.3} ms", elapsed.as_secs_f64() * 1e3);
                }
            }
            if let Some((count, path)) = profiled {
                println!("wrote {count} quantization entries to {}", path.display());
            }
            for output in outputs {
                print!("{output}");
            }
        }
    }
}
