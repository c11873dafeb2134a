use nnaot::graph::Function;
use nnaot::ir::{lower, verify_ir, BufferKind, InstrKind, Location, WeightRole};
use nnaot::quantization::profile_quantization;
use nnaot::tensor::{Tensor, Type};

fn mlp() -> Function {
    let mut f = Function::new("mlp");
    let x = f.create_input("x", Type::f32(vec![2, 4])).unwrap();
    let w = f
        .create_constant("w", Tensor::from_f32(vec![4, 3], vec![0.5; 12]).unwrap())
        .unwrap();
    let b = f
        .create_constant("b", Tensor::from_f32(vec![3], vec![0.1, 0.2, 0.3]).unwrap())
        .unwrap();
    let fc = f.create_fully_connected("fc", x, w, b).unwrap();
    let relu = f.create_relu("relu", fc).unwrap();
    let flat = f.create_reshape("flat", relu, vec![6]).unwrap();
    f.create_save("out", flat).unwrap();
    f
}

#[test]
fn variables_become_weights_with_roles() {
    let ir = lower(&mlp()).unwrap();
    let role = |name: &str| ir.weight(name).unwrap().1.role;
    assert_eq!(role("x"), WeightRole::Input);
    assert_eq!(role("w"), WeightRole::Constant);
    assert_eq!(role("b"), WeightRole::Constant);
    assert_eq!(role("out"), WeightRole::Output);
    assert!(ir.weight("w").unwrap().1.payload.is_some());
    assert!(ir.weight("x").unwrap().1.payload.is_none());
}

#[test]
fn reshape_is_a_view_and_save_is_a_copy() {
    let ir = lower(&mlp()).unwrap();
    let names: Vec<&str> = ir.instructions().iter().map(|i| i.name()).collect();
    assert_eq!(
        names,
        [
            "alloc",
            "fully_connected",
            "alloc",
            "relu",
            "dealloc",
            "tensor_view",
            "copy",
            "dealloc",
        ]
    );
    let view = ir
        .buffers()
        .iter()
        .position(|b| b.name == "flat")
        .unwrap();
    let relu = ir.buffers().iter().position(|b| b.name == "relu").unwrap();
    assert!(matches!(ir.buffers()[view].kind, BufferKind::View { of } if of.index() == relu));
    // The view resolves to the storage of its root.
    let view_id = nnaot::ir::BufferId(view as u32);
    let relu_id = nnaot::ir::BufferId(relu as u32);
    assert_eq!(ir.location(view_id), ir.location(relu_id));
    assert!(matches!(ir.location(relu_id), Some(Location::Activation { .. })));
}

#[test]
fn activations_share_arena_bytes_when_lifetimes_allow() {
    let mut f = Function::new("chain");
    let mut value = f.create_input("x", Type::f32(vec![16])).unwrap();
    for i in 0..4 {
        value = f.create_relu(&format!("r{i}"), value).unwrap();
    }
    f.create_save("out", value).unwrap();

    let ir = lower(&f).unwrap();
    assert_eq!(ir.memory().segments.len(), 4);
    // Each activation is 64 bytes; at most two are live at once.
    assert_eq!(ir.memory().activation_bytes, 128);
    verify_ir(&ir).unwrap();
}

#[test]
fn simultaneously_live_activations_never_overlap() {
    let mut f = Function::new("fanout");
    let x = f.create_input("x", Type::f32(vec![3, 5])).unwrap();
    let a = f.create_relu("a", x).unwrap();
    let b = f.create_tanh("b", x).unwrap();
    let c = f.create_sigmoid("c", a).unwrap();
    let d = f.create_add("d", b, c).unwrap();
    let e = f.create_mul("e", d, a).unwrap();
    f.create_save("out", e).unwrap();

    let ir = lower(&f).unwrap();
    let plan = ir.memory();
    let ids: Vec<_> = plan.live_ranges.keys().copied().collect();
    for (i, left) in ids.iter().enumerate() {
        for right in &ids[i + 1..] {
            if plan.live_ranges[left].overlaps(&plan.live_ranges[right]) {
                assert!(
                    !plan.segments[left].overlaps(&plan.segments[right]),
                    "{left} and {right} overlap"
                );
            }
        }
    }
    for segment in plan.segments.values() {
        assert_eq!(segment.offset % nnaot::ir::ARENA_ALIGNMENT, 0);
        assert!(segment.end() <= plan.activation_bytes);
    }
}

#[test]
fn every_activation_is_released_after_its_last_use() {
    let ir = lower(&mlp()).unwrap();
    let allocs = ir
        .instructions()
        .iter()
        .filter(|i| matches!(i.kind, InstrKind::AllocActivation { .. }))
        .count();
    let deallocs = ir
        .instructions()
        .iter()
        .filter(|i| matches!(i.kind, InstrKind::DeallocActivation { .. }))
        .count();
    assert_eq!(allocs, deallocs);
    for (id, range) in &ir.memory().live_ranges {
        let release = ir
            .instructions()
            .iter()
            .position(|i| matches!(i.kind, InstrKind::DeallocActivation { src } if src == *id))
            .unwrap();
        assert_eq!(release, range.last_use + 1);
    }
}

#[test]
fn lowering_is_deterministic() {
    let first = lower(&mlp()).unwrap();
    let second = lower(&mlp()).unwrap();
    assert_eq!(first, second);
    assert_eq!(first.to_string(), second.to_string());
    assert_eq!(first.dump_dot(), second.dump_dot());
}

#[test]
fn statistics_variables_are_profile_weights() {
    let mut f = mlp();
    let added = profile_quantization(&mut f).unwrap();
    // x, w, b, fc, relu and the reshape.
    assert_eq!(added, 6);
    assert_eq!(profile_quantization(&mut f).unwrap(), 0);

    let ir = lower(&f).unwrap();
    let (_, stats) = ir.weight("relu__profile").unwrap();
    assert_eq!(stats.role, WeightRole::Profile);
    assert_eq!(
        ir.instructions()
            .iter()
            .filter(|i| matches!(i.kind, InstrKind::QuantizationProfile { .. }))
            .count(),
        6
    );
}

#[test]
fn text_dump_lists_weights_and_code() {
    let ir = lower(&mlp()).unwrap();
    let text = ir.to_string();
    assert!(text.starts_with("function mlp\n"));
    assert!(text.contains("input \"x\""));
    assert!(text.contains("constant \"w\""));
    assert!(text.contains("fully_connected"));
    assert!(text.contains("; relu"));
    assert!(ir.dump_dot().contains("digraph \"mlp\""));
}
