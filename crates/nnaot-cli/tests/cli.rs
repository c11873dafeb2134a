use std::path::{Path, PathBuf};

use clap::Parser;
use nnaot::graph::Function;
use nnaot::import::ModelImporter;
use nnaot::{BackendKind, CompileError, Tensor};
use nnaot_cli::{execute, register_backends, Cli, JsonImporter, ModelDescription, Outcome};

const MLP: &str = r#"{
  "name": "mlp",
  "nodes": [
    {"op": "input", "name": "x"},
    {"op": "constant", "name": "w", "dims": [3, 2], "values": [1, 0, 0, 1, 0, 3]},
    {"op": "constant", "name": "b", "dims": [2], "values": [0, 0]},
    {"op": "fully_connected", "name": "fc", "input": "x", "weights": "w", "bias": "b"},
    {"op": "relu", "name": "act", "input": "fc"},
    {"op": "softmax", "name": "probs", "input": "act"}
  ],
  "outputs": [{"name": "y", "node": "probs"}]
}"#;

const X: &str = r#"{"dims": [2, 3], "values": [1, 0, 0, 0, 0, 2]}"#;

fn scratch(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("nnaot-cli-{}-{name}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn write(dir: &Path, file: &str, text: &str) -> String {
    let path = dir.join(file);
    std::fs::write(&path, text).unwrap();
    path.display().to_string()
}

fn mlp_args(dir: &Path) -> Vec<String> {
    let model = write(dir, "mlp.json", MLP);
    let x = write(dir, "x.json", X);
    vec![
        "nnaot".to_string(),
        "--model".to_string(),
        model,
        "--input".to_string(),
        format!("x={x}"),
        "--backend".to_string(),
        "interpreter".to_string(),
    ]
}

fn parse(args: &[String], extra: &[&str]) -> Cli {
    let all = args
        .iter()
        .cloned()
        .chain(extra.iter().map(|s| s.to_string()));
    Cli::try_parse_from(all).unwrap()
}

#[test]
fn runs_a_model_and_reports_argmax_per_row() {
    register_backends();
    let dir = scratch("run");
    let cli = parse(&mlp_args(&dir), &["--iterations", "3", "--time"]);
    assert_eq!(cli.backend, Some(BackendKind::Interpreter));

    match execute(&cli).unwrap() {
        Outcome::Ran {
            outputs,
            timings,
            profiled,
        } => {
            assert_eq!(timings.len(), 3);
            assert!(profiled.is_none());
            assert_eq!(outputs.len(), 1);
            let y = &outputs[0];
            assert_eq!(y.name, "y");
            assert_eq!(y.argmax, vec![0, 1]);
            for row in y.values.chunks(2) {
                assert!((row.iter().sum::<f32>() - 1.0).abs() < 1e-5, "{row:?}");
            }
        }
        Outcome::Bundle(_) => panic!("expected a run"),
    }
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn profile_then_quantize_keeps_the_prediction() {
    register_backends();
    let dir = scratch("profile");
    let args = mlp_args(&dir);
    let profile = dir.join("profile.json").display().to_string();

    let profiling = parse(&args, &["--dump-profile", &profile]);
    match execute(&profiling).unwrap() {
        Outcome::Ran { profiled, .. } => {
            let (count, path) = profiled.unwrap();
            assert!(count > 0);
            assert_eq!(path, PathBuf::from(&profile));
        }
        Outcome::Bundle(_) => panic!("expected a run"),
    }
    assert!(Path::new(&profile).exists());

    let quantized = parse(&args, &["--load-profile", &profile]);
    match execute(&quantized).unwrap() {
        Outcome::Ran { outputs, .. } => assert_eq!(outputs[0].argmax, vec![0, 1]),
        Outcome::Bundle(_) => panic!("expected a run"),
    }
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn native_bundles_are_written_instead_of_running() {
    register_backends();
    if !nnaot_backend_c::compiler_available() {
        eprintln!("skipping: no C compiler");
        return;
    }
    let dir = scratch("bundle");
    let out = dir.join("bundle").display().to_string();
    let mut args = mlp_args(&dir);
    args.truncate(args.len() - 2);
    let cli = parse(&args, &["--backend", "native", "--emit-bundle", &out]);
    match execute(&cli).unwrap() {
        Outcome::Bundle(manifest) => {
            assert_eq!(manifest.name, "mlp");
            assert_eq!(manifest.backend, "native");
            assert!(manifest.files.contains(&"mlp.manifest.json".to_string()));
        }
        Outcome::Ran { .. } => panic!("expected a bundle"),
    }
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn missing_inputs_are_reported_by_name() {
    register_backends();
    let dir = scratch("missing");
    let model = write(&dir, "mlp.json", MLP);
    let cli = Cli::try_parse_from(["nnaot", "--model", model.as_str()]).unwrap();
    let err = execute(&cli).unwrap_err();
    assert!(err.to_string().contains("needs input `x`"), "{err:#}");
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn flags_override_the_configuration_file() {
    let dir = scratch("config");
    let config = write(
        &dir,
        "config.json",
        r#"{"backend": "native", "optimizer": {"max_iters": 4}}"#,
    );
    let dag = dir.join("graph.dot").display().to_string();
    let cli = Cli::try_parse_from([
        "nnaot",
        "--model",
        "unused.json",
        "--config",
        config.as_str(),
        "--backend",
        "interp",
        "--dump-graph-dag",
        dag.as_str(),
        "--dump-ir",
    ])
    .unwrap();
    let engine = cli.engine_config().unwrap();
    assert_eq!(engine.backend, BackendKind::Interpreter);
    assert_eq!(engine.optimizer.max_iters, 4);
    assert_eq!(engine.dumps.graph_dot, Some(PathBuf::from(&dag)));
    assert!(engine.dumps.ir);
    assert!(!engine.dumps.graph);
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn invalid_command_lines_are_rejected() {
    let base = ["nnaot", "--model", "m.json"];
    let with = |extra: &[&str]| {
        Cli::try_parse_from(base.iter().chain(extra.iter()).copied()).is_err()
    };
    assert!(with(&["--iterations", "0"]));
    assert!(with(&["--backend", "tpu"]));
    assert!(with(&["--input", "x"]));
    assert!(with(&["--dump-profile", "a.json", "--load-profile", "b.json"]));
    assert!(!with(&["--input", "x=a.json", "--input", "y=b.json"]));
}

#[test]
fn importer_rejects_tensors_for_undeclared_inputs() {
    let model = ModelDescription::from_json_str(MLP).unwrap();
    let x = Tensor::from_f32(vec![2, 3], vec![0.0; 6]).unwrap();
    let z = Tensor::from_f32(vec![1], vec![0.0]).unwrap();
    let mut function = Function::new("mlp");
    let err = JsonImporter::new(model)
        .import(&mut function, &[("x", &x), ("z", &z)])
        .unwrap_err();
    assert!(matches!(err, CompileError::NotFound(_)), "{err}");
}

#[test]
fn importer_builds_outputs_in_declaration_order() {
    let model = ModelDescription::from_json_str(
        r#"{"nodes": [
            {"op": "input", "name": "a"},
            {"op": "tanh", "name": "t", "input": "a"},
            {"op": "sigmoid", "name": "s", "input": "a"}
        ], "outputs": [{"name": "second", "node": "s"}, {"name": "first", "node": "t"}]}"#,
    )
    .unwrap();
    let a = Tensor::from_f32(vec![4], vec![0.0; 4]).unwrap();
    let mut function = Function::new("two");
    let imported = JsonImporter::new(model)
        .import(&mut function, &[("a", &a)])
        .unwrap();
    imported.check_inputs(&function, &["a"]).unwrap();
    let saved: Vec<String> = imported
        .outputs
        .iter()
        .map(|id| function.name_of(function.save_output(*id).unwrap()))
        .collect();
    assert_eq!(saved, vec!["second", "first"]);
    assert_eq!(imported.root(), imported.outputs.first().copied());
}
