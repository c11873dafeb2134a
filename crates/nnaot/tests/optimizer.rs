use nnaot::graph::{Function, NodeId, NodeKind};
use nnaot::ir::lower;
use nnaot::optimizer::{optimize, OptimizerConfig};
use nnaot::quantization::QuantParams;
use nnaot::tensor::{ElemKind, Tensor, Type};
use nnaot::CompilationMode;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn count(f: &Function, pred: impl Fn(&NodeKind) -> bool) -> usize {
    f.node_ids()
        .into_iter()
        .filter(|id| pred(f.node(*id).unwrap().kind()))
        .count()
}

fn saved_value(f: &Function, output: &str) -> NodeId {
    let save = f.node_by_name(&format!("{output}_save")).unwrap();
    f.node(save).unwrap().inputs()[0]
}

fn run(f: &mut Function, mode: CompilationMode) -> nnaot::optimizer::PassResult {
    optimize(f, mode, &OptimizerConfig::default()).unwrap()
}

#[test]
fn transpose_pair_cancels() {
    let mut f = Function::new("transpose");
    let x = f.create_input("x", Type::f32(vec![2, 3])).unwrap();
    let t1 = f.create_transpose("t1", x, vec![1, 0]).unwrap();
    let t2 = f.create_transpose("t2", t1, vec![1, 0]).unwrap();
    f.create_save("out", t2).unwrap();

    let stats = run(&mut f, CompilationMode::Infer);
    assert!(stats.changed);
    assert_eq!(count(&f, |k| matches!(k, NodeKind::Transpose { .. })), 0);
    assert_eq!(saved_value(&f, "out"), x);
    f.verify().unwrap();
}

#[test]
fn transpose_chain_folds_into_one() {
    let mut f = Function::new("chain");
    let x = f.create_input("x", Type::f32(vec![2, 3, 4])).unwrap();
    let t1 = f.create_transpose("t1", x, vec![1, 2, 0]).unwrap();
    let t2 = f.create_transpose("t2", t1, vec![1, 2, 0]).unwrap();
    f.create_save("out", t2).unwrap();
    let expected = f.output_type(t2).unwrap().clone();

    run(&mut f, CompilationMode::Infer);
    assert_eq!(count(&f, |k| matches!(k, NodeKind::Transpose { .. })), 1);
    let folded = saved_value(&f, "out");
    assert_eq!(
        f.node(folded).unwrap().kind(),
        &NodeKind::Transpose {
            shuffle: vec![2, 0, 1]
        }
    );
    assert_eq!(f.output_type(folded).unwrap().dims(), expected.dims());
}

#[test]
fn reshape_chain_back_to_source_disappears() {
    let mut f = Function::new("reshape");
    let x = f.create_input("x", Type::f32(vec![2, 3])).unwrap();
    let r1 = f.create_reshape("flat", x, vec![6]).unwrap();
    let r2 = f.create_reshape("back", r1, vec![2, 3]).unwrap();
    let r3 = f.create_reshape("again", r2, vec![3, 2]).unwrap();
    f.create_save("out", r3).unwrap();

    run(&mut f, CompilationMode::Infer);
    assert_eq!(count(&f, |k| matches!(k, NodeKind::Reshape { .. })), 1);
    let value = saved_value(&f, "out");
    assert_eq!(f.node(value).unwrap().inputs(), &[x]);
}

#[test]
fn cse_merges_duplicates_and_dce_drops_dead_nodes() {
    let mut f = Function::new("cse");
    let x = f.create_input("x", Type::f32(vec![4])).unwrap();
    let a = f.create_relu("a", x).unwrap();
    let b = f.create_relu("b", x).unwrap();
    let sum = f.create_add("sum", a, b).unwrap();
    f.create_tanh("dead", sum).unwrap();
    f.create_constant("unused", Tensor::from_f32(vec![1], vec![1.0]).unwrap())
        .unwrap();
    f.create_input("unused_input", Type::f32(vec![1])).unwrap();
    f.create_save("out", sum).unwrap();

    run(&mut f, CompilationMode::Infer);
    assert_eq!(count(&f, |k| matches!(k, NodeKind::Relu)), 1);
    assert!(!f.has_node("dead"));
    assert!(!f.has_node("unused"));
    assert!(f.has_node("unused_input"), "public variables are roots");
    let sum = f.node(saved_value(&f, "out")).unwrap();
    assert_eq!(sum.inputs()[0], sum.inputs()[1]);
}

fn quantized(dims: Vec<usize>, scale: f32, offset: i32) -> Type {
    Type::new(ElemKind::i8q(QuantParams::new(scale, offset)), dims)
}

#[test]
fn quantize_dequantize_round_trip_folds_in_infer_mode_only() {
    let build = || {
        let mut f = Function::new("qdq");
        let x = f.create_input("x", Type::f32(vec![4])).unwrap();
        let q1 = f.create_quantize("q1", x, quantized(vec![4], 0.1, 0)).unwrap();
        let d1 = f.create_dequantize("d1", q1).unwrap();
        let q2 = f.create_quantize("q2", d1, quantized(vec![4], 0.1, 0)).unwrap();
        let d2 = f.create_dequantize("d2", q2).unwrap();
        f.create_save("out", d2).unwrap();
        f
    };

    let mut infer = build();
    run(&mut infer, CompilationMode::Infer);
    assert_eq!(count(&infer, |k| matches!(k, NodeKind::Quantize)), 1);
    assert_eq!(count(&infer, |k| matches!(k, NodeKind::Dequantize)), 1);

    let mut train = build();
    run(&mut train, CompilationMode::Train);
    assert_eq!(count(&train, |k| matches!(k, NodeKind::Quantize)), 2);
}

#[test]
fn mismatched_round_trip_becomes_a_rescale() {
    let mut f = Function::new("rescale");
    let x = f.create_input("x", Type::f32(vec![4])).unwrap();
    let q1 = f.create_quantize("q1", x, quantized(vec![4], 0.1, 0)).unwrap();
    let d1 = f.create_dequantize("d1", q1).unwrap();
    let q2 = f.create_quantize("q2", d1, quantized(vec![4], 0.2, 3)).unwrap();
    let d2 = f.create_dequantize("d2", q2).unwrap();
    f.create_save("out", d2).unwrap();

    run(&mut f, CompilationMode::Infer);
    assert_eq!(count(&f, |k| matches!(k, NodeKind::RescaleQuantized)), 1);
    assert_eq!(count(&f, |k| matches!(k, NodeKind::Quantize)), 1);
    f.verify().unwrap();
}

#[test]
fn quantized_constant_is_folded_at_compile_time() {
    let mut f = Function::new("fold");
    let x = f.create_input("x", Type::f32(vec![2])).unwrap();
    let c = f
        .create_constant("c", Tensor::from_f32(vec![2], vec![0.5, -0.25]).unwrap())
        .unwrap();
    let ty = quantized(vec![2], 0.25, 0);
    let qx = f.create_quantize("qx", x, ty.clone()).unwrap();
    let qc = f.create_quantize("qc", c, ty.clone()).unwrap();
    let sum = f
        .create_node("sum", NodeKind::Add, &[qx, qc], Some(ty))
        .unwrap();
    let out = f.create_dequantize("deq", sum).unwrap();
    f.create_save("out", out).unwrap();

    run(&mut f, CompilationMode::Infer);
    assert!(!f.has_node("c"));
    let folded = f.node_by_name("c__quantized").unwrap();
    let payload = f.variable_payload(folded).unwrap();
    assert_eq!(payload.as_i8(), Some(&[2i8, -1][..]));
    assert_eq!(count(&f, |k| matches!(k, NodeKind::Quantize)), 1);
}

/// Random elementwise graph over one shape, with redundant transposes,
/// reshapes, duplicates and dead values.
fn random_graph(seed: u64) -> Function {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut f = Function::new(format!("random_{seed}"));
    let mut values = vec![
        f.create_input("a", Type::f32(vec![2, 3])).unwrap(),
        f.create_input("b", Type::f32(vec![2, 3])).unwrap(),
    ];
    for step in 0..24 {
        let name = format!("v{step}");
        let pick = |rng: &mut StdRng, values: &[NodeId]| values[rng.gen_range(0..values.len())];
        let lhs = pick(&mut rng, &values);
        let rhs = pick(&mut rng, &values);
        let id = match rng.gen_range(0..8) {
            0 => f.create_add(&name, lhs, rhs).unwrap(),
            1 => f.create_mul(&name, lhs, rhs).unwrap(),
            2 => f.create_max(&name, lhs, rhs).unwrap(),
            3 => f.create_relu(&name, lhs).unwrap(),
            4 => f.create_tanh(&name, lhs).unwrap(),
            5 => {
                let t = f.create_transpose(&format!("{name}_t"), lhs, vec![1, 0]).unwrap();
                f.create_transpose(&name, t, vec![1, 0]).unwrap()
            }
            6 => {
                let r = f.create_reshape(&format!("{name}_r"), lhs, vec![6]).unwrap();
                f.create_reshape(&name, r, vec![2, 3]).unwrap()
            }
            _ => {
                // Same operator over the same operands as an existing value.
                f.create_sub(&name, lhs, rhs).unwrap();
                f.create_sub(&format!("{name}_dup"), lhs, rhs).unwrap()
            }
        };
        values.push(id);
    }
    let n = values.len();
    f.create_save("out0", values[n - 1]).unwrap();
    f.create_save("out1", values[n - 3]).unwrap();
    f
}

#[test]
fn optimize_is_idempotent_on_random_graphs() {
    for seed in 0..16 {
        let mut f = random_graph(seed);
        run(&mut f, CompilationMode::Infer);
        f.verify().unwrap();
        let first = lower(&f).unwrap().to_string();

        let again = run(&mut f, CompilationMode::Infer);
        assert!(!again.changed, "seed {seed}: second optimize changed the graph");
        let second = lower(&f).unwrap().to_string();
        assert_eq!(first, second, "seed {seed}");
    }
}

#[test]
fn optimizing_identical_graphs_yields_identical_programs() {
    for seed in [3u64, 11, 29] {
        let mut a = random_graph(seed);
        let mut b = random_graph(seed);
        run(&mut a, CompilationMode::Infer);
        run(&mut b, CompilationMode::Infer);
        assert_eq!(lower(&a).unwrap(), lower(&b).unwrap());
    }
}
