use std::cell::Cell;
use std::path::PathBuf;
use std::sync::Arc;

use nnaot::backend::registry::{create_backend, has_backend, register_backend};
use nnaot::backend::{
    Backend, BackendError, BackendKind, BackendResult, CompilationMode, CompiledFunction,
    IoBindings,
};
use nnaot::config::EngineConfig;
use nnaot::ir::{BufferKind, InstrKind, IrFunction};
use nnaot::quantization::QuantizationOptions;
use nnaot::tensor::{Tensor, Type};
use nnaot::{CompileError, ExecutionEngine};

thread_local! {
    static EXECUTIONS: Cell<usize> = const { Cell::new(0) };
}

/// Executes programs made only of copies between weights.
struct CopyBackend;

struct CopyProgram {
    copies: Vec<(String, String)>,
    mode: CompilationMode,
}

impl Backend for CopyBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Interpreter
    }

    fn compile(
        &self,
        function: &IrFunction,
        mode: CompilationMode,
    ) -> BackendResult<Box<dyn CompiledFunction>> {
        let weight_name = |id| match function.buffer(function.root(id)).kind {
            BufferKind::Weight(index) => Ok(function.weights()[index].name.clone()),
            _ => Err(BackendError::execution("copy backend only moves weights")),
        };
        let mut copies = Vec::new();
        for instr in function.instructions() {
            match instr.kind {
                InstrKind::Copy { dest, src } => copies.push((weight_name(src)?, weight_name(dest)?)),
                _ => {
                    return Err(BackendError::unsupported(
                        self.name(),
                        instr.name(),
                        &instr.node,
                        "only copies are supported",
                    ))
                }
            }
        }
        Ok(Box::new(CopyProgram { copies, mode }))
    }
}

impl CompiledFunction for CopyProgram {
    fn kind(&self) -> BackendKind {
        BackendKind::Interpreter
    }

    fn mode(&self) -> CompilationMode {
        self.mode
    }

    fn execute(&mut self, io: &mut IoBindings) -> BackendResult<()> {
        EXECUTIONS.with(|count| count.set(count.get() + 1));
        for (src, dest) in &self.copies {
            let value = io.require(src)?.clone();
            io.insert(dest.clone(), value);
        }
        Ok(())
    }
}

fn register() {
    register_backend(BackendKind::Interpreter, || Ok(Arc::new(CopyBackend)));
}

fn executions() -> usize {
    EXECUTIONS.with(|count| count.get())
}

fn passthrough_engine() -> ExecutionEngine {
    register();
    let mut engine = ExecutionEngine::new(EngineConfig::default()).unwrap();
    let f = engine.function_mut();
    let x = f.create_input("x", Type::f32(vec![4])).unwrap();
    f.create_save("y", x).unwrap();
    engine
}

#[test]
fn run_copies_results_back_and_supports_repeated_calls() {
    let mut engine = passthrough_engine();
    engine.compile(CompilationMode::Infer).unwrap();

    let first = Tensor::from_f32(vec![4], vec![1.0, 2.0, 3.0, 4.0]).unwrap();
    engine.run(&[("x", &first)]).unwrap();
    assert_eq!(engine.output("y").unwrap(), &first);

    let second = Tensor::from_f32(vec![4], vec![-1.0, 0.0, 0.5, 8.0]).unwrap();
    engine.run(&[("x", &second)]).unwrap();
    assert_eq!(engine.output("y").unwrap(), &second);
    assert_eq!(executions(), 2);
}

#[test]
fn unknown_binding_fails_before_execution() {
    let mut engine = passthrough_engine();
    engine.compile(CompilationMode::Infer).unwrap();
    let before = executions();
    let tensor = Tensor::from_f32(vec![4], vec![0.0; 4]).unwrap();
    let err = engine.run(&[("nope", &tensor)]).unwrap_err();
    assert!(matches!(err, CompileError::NotFound(_)), "{err}");
    // Outputs are not bindable inputs either.
    let err = engine.run(&[("y", &tensor)]).unwrap_err();
    assert!(matches!(err, CompileError::NotFound(_)), "{err}");
    assert_eq!(executions(), before);
}

#[test]
fn mistyped_binding_fails_before_execution() {
    let mut engine = passthrough_engine();
    engine.compile(CompilationMode::Infer).unwrap();
    let before = executions();
    let wrong = Tensor::from_f32(vec![2, 2], vec![0.0; 4]).unwrap();
    let err = engine.run(&[("x", &wrong)]).unwrap_err();
    assert!(matches!(err, CompileError::TypeMismatch { ref node, .. } if node == "x"), "{err}");
    assert_eq!(executions(), before);
}

#[test]
fn run_requires_compile() {
    let mut engine = passthrough_engine();
    let tensor = Tensor::from_f32(vec![4], vec![0.0; 4]).unwrap();
    assert!(matches!(
        engine.run(&[("x", &tensor)]),
        Err(CompileError::Config(_))
    ));
}

#[test]
fn unsupported_instruction_reports_backend_and_node() {
    register();
    let mut engine = ExecutionEngine::new(EngineConfig::default()).unwrap();
    let f = engine.function_mut();
    let x = f.create_input("x", Type::f32(vec![4])).unwrap();
    let r = f.create_relu("act", x).unwrap();
    f.create_save("y", r).unwrap();
    let err = engine.compile(CompilationMode::Infer).unwrap_err();
    match err {
        CompileError::BackendCompilation {
            backend,
            instruction,
            node,
            ..
        } => {
            assert_eq!(backend, "interpreter");
            assert_eq!(instruction, "alloc");
            assert_eq!(node, "act");
        }
        other => panic!("unexpected error {other}"),
    }
}

#[test]
fn bundles_are_refused_by_backends_without_support() {
    let mut engine = passthrough_engine();
    let dir = std::env::temp_dir().join(format!("nnaot-bundle-{}", std::process::id()));
    let err = engine.save(CompilationMode::Infer, &dir).unwrap_err();
    assert!(matches!(err, CompileError::BackendCompilation { .. }), "{err}");
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn contradictory_profile_settings_are_rejected_up_front() {
    let config = EngineConfig {
        dump_profile: Some(PathBuf::from("a.json")),
        load_profile: Some(PathBuf::from("b.json")),
        ..EngineConfig::default()
    };
    assert!(matches!(
        ExecutionEngine::new(config),
        Err(CompileError::Config(_))
    ));

    let mut config = EngineConfig::default();
    config.optimizer.max_iters = 0;
    assert!(matches!(config.validate(), Err(CompileError::Config(_))));
}

#[test]
fn environment_overrides_are_explicit() {
    std::env::set_var("NNAOT_BACKEND", "native");
    std::env::set_var("NNAOT_OPT_MAX_ITERS", "3");
    std::env::set_var("NNAOT_STRICT_PROFILE", "yes");
    let untouched = EngineConfig::default();
    let mut config = EngineConfig::default();
    config.apply_env_overrides().unwrap();
    std::env::set_var("NNAOT_OPT_MAX_ITERS", "many");
    let mut broken = EngineConfig::default();
    let bad = broken.apply_env_overrides();
    std::env::set_var("NNAOT_OPT_MAX_ITERS", "3");
    std::env::set_var("NNAOT_STRICT_PROFILE", "maybe");
    let mut unsure = EngineConfig::default();
    let unrecognised = unsure.apply_env_overrides();
    std::env::set_var("NNAOT_STRICT_PROFILE", "Off");
    let mut relaxed = EngineConfig {
        quantization: QuantizationOptions {
            strict_coverage: true,
        },
        ..EngineConfig::default()
    };
    relaxed.apply_env_overrides().unwrap();
    std::env::remove_var("NNAOT_BACKEND");
    std::env::remove_var("NNAOT_OPT_MAX_ITERS");
    std::env::remove_var("NNAOT_STRICT_PROFILE");

    assert_eq!(untouched.backend, BackendKind::Interpreter);
    assert_eq!(config.backend, BackendKind::Native);
    assert_eq!(config.optimizer.max_iters, 3);
    assert!(config.quantization.strict_coverage);
    assert!(matches!(bad, Err(CompileError::Config(_))));
    match unrecognised {
        Err(CompileError::Config(message)) => {
            assert!(message.contains("NNAOT_STRICT_PROFILE=`maybe`"), "{message}")
        }
        other => panic!("expected a configuration error, got {other:?}"),
    }
    assert!(!unsure.quantization.strict_coverage);
    assert!(!relaxed.quantization.strict_coverage);
}

#[test]
fn registry_resolves_registered_kinds_only() {
    register();
    assert!(has_backend(BackendKind::Interpreter));
    assert!(create_backend(BackendKind::Interpreter).is_ok());
    assert!(matches!(
        create_backend(BackendKind::Gpu),
        Err(BackendError::Unavailable { .. })
    ));
}
