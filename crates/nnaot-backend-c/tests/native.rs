use nnaot::backend::{BackendKind, BundleManifest, CompilationMode};
use nnaot::config::EngineConfig;
use nnaot::graph::{Function, Window};
use nnaot::ir::lower;
use nnaot::quantization::{serialize_to_file, NodeQuantizationInfo};
use nnaot::tensor::{ElemKind, QuantParams, Tensor, Type};
use nnaot::ExecutionEngine;
use nnaot_backend_c::{compiler_available, generate};

fn engine_for(config: EngineConfig, build: impl FnOnce(&mut Function)) -> ExecutionEngine {
    nnaot_backend_interp::register();
    nnaot_backend_c::register();
    let mut engine = ExecutionEngine::new(config).unwrap();
    build(engine.function_mut());
    engine
}

fn temp_path(name: &str) -> std::path::PathBuf {
    std::env::temp_dir().join(format!("nnaot-native-{}-{name}", std::process::id()))
}

macro_rules! require_compiler {
    () => {
        if !compiler_available() {
            eprintln!("skipping: no C compiler");
            return;
        }
    };
}

/// Conv, pooling, transpose, FC, activations and softmax in one graph.
fn network(f: &mut Function) {
    let x = f
        .create_input("x", Type::f32(vec![1, 1, 4, 4]))
        .unwrap();
    let filter: Vec<f32> = (0..18).map(|i| ((i % 7) as f32 - 3.0) * 0.25).collect();
    let k = f
        .create_constant("k", Tensor::from_f32(vec![2, 1, 3, 3], filter).unwrap())
        .unwrap();
    let kb = f
        .create_constant("kb", Tensor::from_f32(vec![2], vec![0.1, -0.1]).unwrap())
        .unwrap();
    let conv = f
        .create_convolution("conv", x, k, kb, Window::new(3, 1, 1))
        .unwrap();
    let act = f.create_tanh("act", conv).unwrap();
    let pool = f.create_max_pool("pool", act, Window::new(2, 2, 0)).unwrap();
    let avg = f.create_avg_pool("avg", pool, Window::new(2, 1, 1)).unwrap();
    let flat = f.create_reshape("flat", avg, vec![2, 9]).unwrap();
    let t = f.create_transpose("t", flat, vec![1, 0]).unwrap();
    let row = f.create_reshape("row", t, vec![1, 18]).unwrap();
    let weights: Vec<f32> = (0..54).map(|i| ((i * 5 % 11) as f32 - 5.0) * 0.1).collect();
    let w = f
        .create_constant("w", Tensor::from_f32(vec![18, 3], weights).unwrap())
        .unwrap();
    let b = f
        .create_constant("b", Tensor::from_f32(vec![3], vec![0.0, 0.5, -0.5]).unwrap())
        .unwrap();
    let fc = f.create_fully_connected("fc", row, w, b).unwrap();
    let sig = f.create_sigmoid("sig", fc).unwrap();
    let gate = f.create_max("gate", sig, fc).unwrap();
    let probs = f.create_softmax("probs", gate).unwrap();
    f.create_save("out", probs).unwrap();
}

fn network_input(seed: f32) -> Tensor {
    let values = (0..16).map(|i| (i as f32 * 0.37 + seed).sin()).collect();
    Tensor::from_f32(vec![1, 1, 4, 4], values).unwrap()
}

#[test]
fn generated_module_exposes_one_entry_point() {
    let mut f = Function::new("tiny-net");
    let x = f.create_input("x", Type::f32(vec![2, 2])).unwrap();
    let r = f.create_relu("r", x).unwrap();
    let s = f.create_softmax("s", r).unwrap();
    f.create_save("y", s).unwrap();
    let ir = lower(&f).unwrap();

    let module = generate(&ir).unwrap();
    assert_eq!(module.symbol, "nnaot_tiny_net");
    assert!(module
        .source
        .contains("int nnaot_tiny_net(uint8_t* const* weights, uint8_t* activations)"));
    assert!(module.source.contains("nn_relu("));
    assert!(module.source.contains("expf(row[j] - mx)"));
    assert!(module.source.contains("/* node `s` */"));
    assert!(module.header.contains("#define TINY_NET_ACTIVATION_BYTES"));
    assert!(module.header.contains("#define TINY_NET_WEIGHT_X "));
    // Generation is deterministic, which keeps the on-disk cache effective.
    assert_eq!(module, generate(&lower(&f).unwrap()).unwrap());
}

#[test]
fn native_matches_interpreter_on_float_network() {
    require_compiler!();
    let mut reference = engine_for(EngineConfig::default(), network);
    let mut native = engine_for(EngineConfig::new(BackendKind::Native), network);
    reference.compile(CompilationMode::Infer).unwrap();
    native.compile(CompilationMode::Infer).unwrap();

    for seed in [0.0, 1.5, -2.0] {
        let input = network_input(seed);
        reference.run(&[("x", &input)]).unwrap();
        native.run(&[("x", &input)]).unwrap();
        let expected = reference.output("out").unwrap();
        let actual = native.output("out").unwrap();
        assert!(
            actual.is_equal(expected, 1e-5),
            "{:?} vs {:?}",
            actual.as_f32(),
            expected.as_f32()
        );
    }
}

#[test]
fn fixed_point_conversions_are_bit_exact() {
    require_compiler!();
    let build = |f: &mut Function| {
        let x = f.create_input("x", Type::f32(vec![1, 6])).unwrap();
        let narrow = Type::new(ElemKind::i8q(QuantParams::new(0.05, 0)), vec![1, 6]);
        let wide = Type::new(ElemKind::i8q(QuantParams::new(0.1, -3)), vec![1, 6]);
        let q = f.create_quantize("q", x, narrow).unwrap();
        let r = f.create_rescale_quantized("r", q, wide).unwrap();
        let d = f.create_dequantize("d", r).unwrap();
        f.create_save("raw", q).unwrap();
        f.create_save("real", d).unwrap();
    };
    // Includes saturating values and exact rounding ties.
    let input = Tensor::from_f32(vec![1, 6], vec![0.025, -0.075, 9.0, -9.0, 0.33, 0.0]).unwrap();

    let mut reference = engine_for(EngineConfig::default(), build);
    let mut native = engine_for(EngineConfig::new(BackendKind::Native), build);
    reference.compile(CompilationMode::Infer).unwrap();
    native.compile(CompilationMode::Infer).unwrap();
    reference.run(&[("x", &input)]).unwrap();
    native.run(&[("x", &input)]).unwrap();

    let raw = native.output("raw").unwrap();
    assert_eq!(raw.as_i8(), reference.output("raw").unwrap().as_i8());
    assert_eq!(raw.as_i8().unwrap()[2..4], [127, -128]);
    assert_eq!(
        native.output("real").unwrap(),
        reference.output("real").unwrap()
    );
}

fn mlp(f: &mut Function) {
    let x = f.create_input("x", Type::f32(vec![2, 4])).unwrap();
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
fn profiling_and_quantized_execution_agree_with_the_interpreter() {
    require_compiler!();
    let input = Tensor::from_f32(vec![2, 4], vec![0.5, -0.25, 1.0, -1.0, 0.2, 0.4, -0.6, 0.8])
        .unwrap();
    let profile = temp_path("mlp-profile.json");

    let config = EngineConfig {
        backend: BackendKind::Native,
        dump_profile: Some(profile.clone()),
        ..EngineConfig::default()
    };
    let mut profiling = engine_for(config, mlp);
    profiling.compile(CompilationMode::Infer).unwrap();
    profiling.run(&[("x", &input)]).unwrap();
    profiling.run(&[("x", &input)]).unwrap();
    assert_eq!(
        profiling.output("x__profile").unwrap().as_f32(),
        Some(&[-1.0, 1.0][..])
    );
    profiling.write_profile().unwrap();

    let quantized_config = |backend| EngineConfig {
        backend,
        load_profile: Some(profile.clone()),
        ..EngineConfig::default()
    };
    let mut reference = engine_for(quantized_config(BackendKind::Interpreter), mlp);
    let mut native = engine_for(quantized_config(BackendKind::Native), mlp);
    reference.compile(CompilationMode::Infer).unwrap();
    native.compile(CompilationMode::Infer).unwrap();
    reference.run(&[("x", &input)]).unwrap();
    native.run(&[("x", &input)]).unwrap();
    assert_eq!(
        native.output("out").unwrap(),
        reference.output("out").unwrap(),
        "fixed-point results must match exactly"
    );
    let _ = std::fs::remove_file(&profile);
}

const DEEP: usize = 40_000;

fn deep_dot(f: &mut Function) {
    let x = f.create_input("x", Type::f32(vec![1, DEEP])).unwrap();
    let w = f
        .create_constant("w", Tensor::from_f32(vec![DEEP, 1], vec![1.0; DEEP]).unwrap())
        .unwrap();
    let mm = f.create_matmul("mm", x, w).unwrap();
    f.create_save("out", mm).unwrap();
}

#[test]
fn long_fixed_point_dot_products_match_the_interpreter() {
    let profile = temp_path("deep-profile.json");
    let records = [
        NodeQuantizationInfo::new("x", 0.0, 1.0),
        NodeQuantizationInfo::new("w", 0.0, 1.0),
        NodeQuantizationInfo::new("mm", 0.0, DEEP as f32),
    ];
    serialize_to_file(&profile, &records).unwrap();
    let quantized_config = |backend| EngineConfig {
        backend,
        load_profile: Some(profile.clone()),
        ..EngineConfig::default()
    };

    let mut reference = engine_for(quantized_config(BackendKind::Interpreter), deep_dot);
    reference.prepare().unwrap();
    let module = generate(&lower(reference.function()).unwrap()).unwrap();
    assert!(module.source.contains("int64_t acc = 0;"));
    assert!(!module.source.contains("int32_t acc"));

    if compiler_available() {
        let mut native = engine_for(quantized_config(BackendKind::Native), deep_dot);
        reference.compile(CompilationMode::Infer).unwrap();
        native.compile(CompilationMode::Infer).unwrap();
        let ones = Tensor::from_f32(vec![1, DEEP], vec![1.0; DEEP]).unwrap();
        reference.run(&[("x", &ones)]).unwrap();
        native.run(&[("x", &ones)]).unwrap();
        let expected = reference.output("out").unwrap();
        assert_eq!(native.output("out").unwrap(), expected);
        assert!((expected.as_f32().unwrap()[0] - DEEP as f32).abs() < 200.0);
    }
    let _ = std::fs::remove_file(&profile);
}

#[test]
fn bundle_contains_sources_weights_and_manifest() {
    require_compiler!();
    let dir = temp_path("bundle");
    let mut engine = engine_for(EngineConfig::new(BackendKind::Native), mlp);
    let manifest = engine.save(CompilationMode::Infer, &dir).unwrap();

    assert_eq!(manifest.entry, "nnaot_main");
    assert_eq!(manifest.backend, "native");
    for file in &manifest.files {
        assert!(dir.join(file).is_file(), "missing {file}");
    }
    assert!(manifest.files.contains(&"main.o".to_string()));
    let weights = std::fs::read(dir.join(&manifest.weights_file)).unwrap();
    assert_eq!(weights.len(), manifest.weights_bytes);

    let constants: Vec<_> = manifest
        .buffers
        .iter()
        .filter(|b| b.weights_offset.is_some())
        .collect();
    assert_eq!(constants.len(), 2);
    let w = constants.iter().find(|b| b.name == "w").unwrap();
    let offset = w.weights_offset.unwrap();
    let first = f32::from_le_bytes(weights[offset..offset + 4].try_into().unwrap());
    assert_eq!(first, (0.0f32 - 6.0) * 0.1);

    let reread = BundleManifest::read(&dir.join("main.manifest.json")).unwrap();
    assert_eq!(reread, manifest);
    let header = std::fs::read_to_string(dir.join("main.h")).unwrap();
    assert!(header.contains("int nnaot_main(uint8_t* const* weights, uint8_t* activations);"));
    let _ = std::fs::remove_dir_all(&dir);
}
