use nnaot::backend::{CompilationMode, CompiledFunction, IoBindings};
use nnaot::config::EngineConfig;
use nnaot::graph::{Function, NodeKind, Window};
use nnaot::ir::lower;
use nnaot::optimizer::{optimize, OptimizerConfig};
use nnaot::quantization::{serialize_to_file, NodeQuantizationInfo};
use nnaot::tensor::{Tensor, Type};
use nnaot::ExecutionEngine;
use nnaot_backend_interp::{register, InterpreterBackend, InterpreterOptions};

fn engine_for(config: EngineConfig, build: impl FnOnce(&mut Function)) -> ExecutionEngine {
    register();
    let mut engine = ExecutionEngine::new(config).unwrap();
    build(engine.function_mut());
    engine
}

fn run_once(build: impl FnOnce(&mut Function), inputs: &[(&str, &Tensor)], output: &str) -> Tensor {
    let mut engine = engine_for(EngineConfig::default(), build);
    engine.compile(CompilationMode::Infer).unwrap();
    engine.run(inputs).unwrap();
    engine.output(output).unwrap().clone()
}

fn temp_path(name: &str) -> std::path::PathBuf {
    std::env::temp_dir().join(format!("nnaot-interp-{}-{name}", std::process::id()))
}

#[test]
fn passthrough_returns_its_input() {
    let input = Tensor::from_f32(vec![4], vec![1.0, 2.0, 3.0, 4.0]).unwrap();
    let out = run_once(
        |f| {
            let x = f.create_input("x", Type::f32(vec![4])).unwrap();
            f.create_save("y", x).unwrap();
        },
        &[("x", &input)],
        "y",
    );
    assert_eq!(out.as_f32(), Some(&[1.0, 2.0, 3.0, 4.0][..]));
}

#[test]
fn transpose_moves_elements_exactly() {
    let input = Tensor::from_f32(vec![2, 3], vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]).unwrap();
    let out = run_once(
        |f| {
            let x = f.create_input("x", Type::f32(vec![2, 3])).unwrap();
            let t = f.create_transpose("t", x, vec![1, 0]).unwrap();
            f.create_save("y", t).unwrap();
        },
        &[("x", &input)],
        "y",
    );
    assert_eq!(out.ty().dims(), &[3, 2]);
    assert_eq!(out.as_f32(), Some(&[0.0, 3.0, 1.0, 4.0, 2.0, 5.0][..]));
}

#[test]
fn fully_connected_relu_and_reshape() {
    let input = Tensor::from_f32(vec![1, 2], vec![1.0, 1.0]).unwrap();
    let out = run_once(
        |f| {
            let x = f.create_input("x", Type::f32(vec![1, 2])).unwrap();
            let w = f
                .create_constant("w", Tensor::from_f32(vec![2, 2], vec![1.0, 2.0, 3.0, 4.0]).unwrap())
                .unwrap();
            let b = f
                .create_constant("b", Tensor::from_f32(vec![2], vec![0.5, -10.0]).unwrap())
                .unwrap();
            let fc = f.create_fully_connected("fc", x, w, b).unwrap();
            let relu = f.create_relu("relu", fc).unwrap();
            let flat = f.create_reshape("flat", relu, vec![2]).unwrap();
            f.create_save("y", flat).unwrap();
        },
        &[("x", &input)],
        "y",
    );
    assert_eq!(out.as_f32(), Some(&[4.5, 0.0][..]));
}

#[test]
fn softmax_rows_are_normalized() {
    let input = Tensor::from_f32(vec![2, 3], vec![1.0, 2.0, 3.0, -5.0, 0.0, 5.0]).unwrap();
    let out = run_once(
        |f| {
            let x = f.create_input("x", Type::f32(vec![2, 3])).unwrap();
            let s = f.create_softmax("s", x).unwrap();
            f.create_save("y", s).unwrap();
        },
        &[("x", &input)],
        "y",
    );
    let values = out.as_f32().unwrap();
    for row in values.chunks(3) {
        assert!((row.iter().sum::<f32>() - 1.0).abs() < 1e-6);
        assert!(row[0] < row[1] && row[1] < row[2]);
    }
}

#[test]
fn convolution_with_padding_counts_valid_taps() {
    let input = Tensor::from_f32(vec![1, 1, 3, 3], vec![1.0; 9]).unwrap();
    let out = run_once(
        |f| {
            let x = f
                .create_input("x", Type::f32(vec![1, 1, 3, 3]))
                .unwrap();
            let k = f
                .create_constant("k", Tensor::from_f32(vec![1, 1, 3, 3], vec![1.0; 9]).unwrap())
                .unwrap();
            let kb = f
                .create_constant("kb", Tensor::from_f32(vec![1], vec![0.0]).unwrap())
                .unwrap();
            let conv = f
                .create_convolution("conv", x, k, kb, Window::new(3, 1, 1))
                .unwrap();
            f.create_save("y", conv).unwrap();
        },
        &[("x", &input)],
        "y",
    );
    assert_eq!(
        out.as_f32(),
        Some(&[4.0, 6.0, 4.0, 6.0, 9.0, 6.0, 4.0, 6.0, 4.0][..])
    );
}

#[test]
fn pooling_reduces_windows() {
    let input = Tensor::from_f32(vec![1, 1, 2, 2], vec![1.0, 2.0, 3.0, 4.0]).unwrap();
    let build = |f: &mut Function| {
        let x = f
            .create_input("x", Type::f32(vec![1, 1, 2, 2]))
            .unwrap();
        let max = f.create_max_pool("max", x, Window::new(2, 2, 0)).unwrap();
        let avg = f.create_avg_pool("avg", x, Window::new(2, 2, 0)).unwrap();
        f.create_save("max_out", max).unwrap();
        f.create_save("avg_out", avg).unwrap();
    };
    let mut engine = engine_for(EngineConfig::default(), build);
    engine.compile(CompilationMode::Infer).unwrap();
    engine.run(&[("x", &input)]).unwrap();
    assert_eq!(engine.output("max_out").unwrap().as_f32(), Some(&[4.0][..]));
    assert_eq!(engine.output("avg_out").unwrap().as_f32(), Some(&[2.5][..]));
}

fn fanout(f: &mut Function) {
    let x = f.create_input("x", Type::f32(vec![3, 5])).unwrap();
    let a = f.create_relu("a", x).unwrap();
    let b = f.create_tanh("b", x).unwrap();
    let c = f.create_sigmoid("c", a).unwrap();
    let d = f.create_add("d", b, c).unwrap();
    let e = f.create_mul("e", d, a).unwrap();
    let g = f.create_sub("g", e, x).unwrap();
    f.create_save("out", g).unwrap();
}

fn execute(options: InterpreterOptions, input: &Tensor) -> Vec<Tensor> {
    let mut f = Function::new("fanout");
    fanout(&mut f);
    let ir = lower(&f).unwrap();
    let backend = InterpreterBackend::with_options(options);
    let mut program = backend.compile_program(&ir, CompilationMode::Infer).unwrap();
    (0..2)
        .map(|_| {
            let mut io = IoBindings::new();
            io.insert("x", input.clone());
            program.execute(&mut io).unwrap();
            io.take("out").unwrap()
        })
        .collect()
}

#[test]
fn poisoning_released_buffers_does_not_change_results() {
    let values: Vec<f32> = (0..15).map(|i| (i as f32 - 7.0) * 0.3).collect();
    let input = Tensor::from_f32(vec![3, 5], values).unwrap();
    let plain = execute(
        InterpreterOptions {
            poison_dead_buffers: false,
        },
        &input,
    );
    let poisoned = execute(
        InterpreterOptions {
            poison_dead_buffers: true,
        },
        &input,
    );
    assert_eq!(plain, poisoned);
    assert_eq!(plain[0], plain[1], "repeated runs agree");
}

#[test]
fn repeated_runs_see_new_inputs() {
    let mut engine = engine_for(EngineConfig::default(), fanout);
    engine.compile(CompilationMode::Infer).unwrap();
    let zeros = Tensor::from_f32(vec![3, 5], vec![0.0; 15]).unwrap();
    let ones = Tensor::from_f32(vec![3, 5], vec![1.0; 15]).unwrap();
    engine.run(&[("x", &zeros)]).unwrap();
    let first = engine.output("out").unwrap().clone();
    engine.run(&[("x", &ones)]).unwrap();
    let second = engine.output("out").unwrap().clone();
    assert_eq!(first.as_f32().unwrap()[0], 0.0);
    assert_ne!(first, second);
}

/// Runs `f` as built, without the optimizer.
fn evaluate(f: &Function, name: &str, input: &Tensor) -> Tensor {
    let ir = lower(f).unwrap();
    let mut program = InterpreterBackend::new()
        .compile_program(&ir, CompilationMode::Infer)
        .unwrap();
    let mut io = IoBindings::new();
    io.insert(name, input.clone());
    program.execute(&mut io).unwrap();
    io.take("out").unwrap()
}

fn transposes(f: &Function) -> Vec<Vec<usize>> {
    f.node_ids()
        .into_iter()
        .filter_map(|id| match f.try_node(id).map(|n| n.kind()) {
            Some(NodeKind::Transpose { shuffle }) => Some(shuffle.clone()),
            _ => None,
        })
        .collect()
}

/// Optimizes a copy of `build`'s graph and checks both run to the same bits.
fn assert_optimization_preserves(
    build: impl Fn(&mut Function),
    input: &Tensor,
) -> (Function, Function) {
    let mut plain = Function::new("plain");
    build(&mut plain);
    let mut optimized = Function::new("optimized");
    build(&mut optimized);
    optimize(&mut optimized, CompilationMode::Infer, &OptimizerConfig::default()).unwrap();
    assert_eq!(evaluate(&optimized, "x", input), evaluate(&plain, "x", input));
    (plain, optimized)
}

#[test]
fn cancelling_transposes_are_removed_without_changing_results() {
    let input = Tensor::from_f32(vec![2, 3], vec![0.5, -1.0, 2.0, 3.5, -0.25, 1.0]).unwrap();
    let (plain, optimized) = assert_optimization_preserves(
        |f| {
            let x = f.create_input("x", Type::f32(vec![2, 3])).unwrap();
            let t = f.create_transpose("t", x, vec![1, 0]).unwrap();
            let back = f.create_transpose("back", t, vec![1, 0]).unwrap();
            let sum = f.create_add("sum", back, x).unwrap();
            f.create_save("out", sum).unwrap();
        },
        &input,
    );
    assert_eq!(transposes(&plain).len(), 2);
    assert!(transposes(&optimized).is_empty());
}

#[test]
fn composed_transpose_chain_matches_the_original_pair() {
    let values: Vec<f32> = (0..24).map(|i| i as f32 * 0.5 - 6.0).collect();
    let input = Tensor::from_f32(vec![2, 3, 4], values).unwrap();
    let (_, optimized) = assert_optimization_preserves(
        |f| {
            let x = f.create_input("x", Type::f32(vec![2, 3, 4])).unwrap();
            let a = f.create_transpose("a", x, vec![1, 2, 0]).unwrap();
            let b = f.create_transpose("b", a, vec![0, 2, 1]).unwrap();
            let act = f.create_tanh("act", b).unwrap();
            f.create_save("out", act).unwrap();
        },
        &input,
    );
    assert_eq!(transposes(&optimized), vec![vec![1, 0, 2]]);
}

fn mlp(f: &mut Function) {
    let x = f.create_input("x", Type::f32(vec![1, 4])).unwrap();
    let weights: Vec<f32> = (0..12).map(|i| (i as f32 - 6.0) * 0.1).collect();
    let w = f
        .create_constant("w", Tensor::from_f32(vec![4, 3], weights).unwrap())
        .unwrap();
    let b = f
        .create_constant("b", Tensor::from_f32(vec![3], vec![0.1, -0.2, 0.3]).unwrap())
        .unwrap();
    let fc = f.create_fully_connected("fc", x, w, b).unwrap();
    let relu = f.create_relu("relu", fc).unwrap();
    f.create_save("out", relu).unwrap();
}

#[test]
fn profile_then_quantize_tracks_the_float_result() {
    let input = Tensor::from_f32(vec![1, 4], vec![0.5, -0.25, 1.0, -1.0]).unwrap();
    let other = Tensor::from_f32(vec![1, 4], vec![-0.5, 0.25, 0.75, 0.0]).unwrap();
    let profile = temp_path("mlp-profile.json");

    let mut reference = engine_for(EngineConfig::default(), mlp);
    reference.compile(CompilationMode::Infer).unwrap();
    reference.run(&[("x", &input)]).unwrap();
    let expected = reference.output("out").unwrap().clone();

    let config = EngineConfig {
        dump_profile: Some(profile.clone()),
        ..EngineConfig::default()
    };
    let mut profiling = engine_for(config, mlp);
    profiling.compile(CompilationMode::Infer).unwrap();
    profiling.run(&[("x", &input)]).unwrap();
    profiling.run(&[("x", &other)]).unwrap();
    // Instrumentation does not disturb the computed values.
    profiling.run(&[("x", &input)]).unwrap();
    assert!(profiling.output("out").unwrap().is_equal(&expected, 0.0));
    let stats = profiling.output("x__profile").unwrap();
    assert_eq!(stats.as_f32(), Some(&[-1.0, 1.0][..]));
    assert_eq!(profiling.write_profile().unwrap(), 5);

    let config = EngineConfig {
        load_profile: Some(profile.clone()),
        ..EngineConfig::default()
    };
    let mut quantized = engine_for(config, mlp);
    quantized.compile(CompilationMode::Infer).unwrap();
    let report = quantized.quantization_report().unwrap();
    assert_eq!(report.quantized, ["fc", "relu"]);
    quantized.run(&[("x", &input)]).unwrap();
    let actual = quantized.output("out").unwrap();
    assert!(
        actual.is_equal(&expected, 0.05),
        "{:?} vs {:?}",
        actual.as_f32(),
        expected.as_f32()
    );
    let _ = std::fs::remove_file(&profile);
}

#[test]
fn editing_a_quantized_graph_keeps_its_quantization() {
    let input = Tensor::from_f32(vec![1, 4], vec![0.5, -0.25, 1.0, -1.0]).unwrap();
    let profile = temp_path("edit-profile.json");
    let records = [
        NodeQuantizationInfo::new("x", -1.0, 1.0),
        NodeQuantizationInfo::new("w", -0.6, 0.5),
        NodeQuantizationInfo::new("b", -0.2, 0.3),
        NodeQuantizationInfo::new("fc", -1.5, 1.5),
        NodeQuantizationInfo::new("relu", 0.0, 1.5),
    ];
    serialize_to_file(&profile, &records).unwrap();
    let config = EngineConfig {
        load_profile: Some(profile.clone()),
        ..EngineConfig::default()
    };
    let mut engine = engine_for(config, mlp);
    engine.compile(CompilationMode::Infer).unwrap();
    engine.run(&[("x", &input)]).unwrap();
    let before = engine.output("out").unwrap().clone();

    let f = engine.function_mut();
    let x = f.node_by_name("x").unwrap();
    f.create_save("echo", x).unwrap();
    engine.compile(CompilationMode::Infer).unwrap();
    assert_eq!(engine.quantization_report().unwrap().quantized, ["fc", "relu"]);
    engine.run(&[("x", &input)]).unwrap();
    assert_eq!(engine.output("out").unwrap(), &before);
    assert_eq!(engine.output("echo").unwrap(), &input);
    let _ = std::fs::remove_file(&profile);
}

const DEEP: usize = 40_000;

/// One dot product long enough that int8 products overflow an `i32` sum.
fn deep_dot(f: &mut Function) {
    let x = f.create_input("x", Type::f32(vec![1, DEEP])).unwrap();
    let w = f
        .create_constant("w", Tensor::from_f32(vec![DEEP, 1], vec![1.0; DEEP]).unwrap())
        .unwrap();
    let mm = f.create_matmul("mm", x, w).unwrap();
    f.create_save("out", mm).unwrap();
}

#[test]
fn quantized_matmul_accumulates_long_rows_without_overflow() {
    let profile = temp_path("deep-profile.json");
    let records = [
        NodeQuantizationInfo::new("x", 0.0, 1.0),
        NodeQuantizationInfo::new("w", 0.0, 1.0),
        NodeQuantizationInfo::new("mm", 0.0, DEEP as f32),
    ];
    serialize_to_file(&profile, &records).unwrap();

    let config = EngineConfig {
        load_profile: Some(profile.clone()),
        ..EngineConfig::default()
    };
    let mut engine = engine_for(config, deep_dot);
    engine.compile(CompilationMode::Infer).unwrap();
    assert_eq!(engine.quantization_report().unwrap().quantized, ["mm"]);
    let ones = Tensor::from_f32(vec![1, DEEP], vec![1.0; DEEP]).unwrap();
    engine.run(&[("x", &ones)]).unwrap();
    let sum = engine.output("out").unwrap().as_f32().unwrap()[0];
    assert!((sum - DEEP as f32).abs() < 200.0, "{sum}");
    let _ = std::fs::remove_file(&profile);
}
