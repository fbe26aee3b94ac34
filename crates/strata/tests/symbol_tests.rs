// Symbol tests — Composition, naming, shape inference and gradient graphs

use strata::prelude::*;

fn kv(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn op(name: &str, params: &[(&str, &str)]) -> Symbol {
    let registry = OpRegistry::with_builtins();
    Symbol::create(registry.create(name, &kv(params)).unwrap())
}

fn fc(input: &Symbol, num_hidden: &str, name: &str) -> Symbol {
    let mut s = op("FullyConnected", &[("num_hidden", num_hidden)]);
    s.compose_named(&[("data", input)], Some(name)).unwrap();
    s
}

fn binary(kind: &str, lhs: &Symbol, rhs: &Symbol, name: &str) -> Symbol {
    let mut s = op(kind, &[]);
    s.compose(&[lhs, rhs], Some(name)).unwrap();
    s
}

fn mlp() -> Symbol {
    let data = Symbol::variable("data");
    let h = fc(&data, "8", "fc1");
    let mut act = op("Activation", &[("act_type", "relu")]);
    act.compose(&[&h], Some("relu1")).unwrap();
    fc(&act, "3", "fc2")
}

// Composition

#[test]
fn test_named_compose_creates_default_variables() {
    let s = fc(&Symbol::variable("data"), "10", "fc1");
    assert_eq!(s.list_arguments(), vec!["data", "fc1_weight", "fc1_bias"]);
    assert_eq!(s.list_outputs(), vec!["fc1_output"]);
}

#[test]
fn test_positional_compose_binds_in_order() {
    let a = Symbol::variable("a");
    let b = Symbol::variable("b");
    let s = binary("_Minus", &b, &a, "diff");
    assert_eq!(s.list_arguments(), vec!["b", "a"]);
}

#[test]
fn test_unknown_keyword_is_rejected() {
    let mut s = op("FullyConnected", &[("num_hidden", "4")]);
    let err = s
        .compose_named(&[("input", &Symbol::variable("x"))], Some("fc"))
        .unwrap_err();
    assert!(matches!(err, Error::UnknownArgument { ref name, .. } if name == "input"));
}

#[test]
fn test_multi_output_argument_is_rejected() {
    let group = Symbol::group(&[Symbol::variable("x"), Symbol::variable("y")]);
    let mut s = op("Activation", &[("act_type", "tanh")]);
    assert!(matches!(
        s.compose(&[&group], None),
        Err(Error::ArgumentCount { got: 2, .. })
    ));
}

#[test]
fn test_compose_replaces_free_variables() {
    let net = fc(&Symbol::variable("data"), "4", "fc1");
    let mut act = op("Activation", &[("act_type", "sigmoid")]);
    act.compose(&[&Symbol::variable("x")], Some("pre")).unwrap();

    let mut composed = net.clone();
    composed.compose_named(&[("data", &act)], None).unwrap();
    assert_eq!(
        composed.list_arguments(),
        vec!["x", "fc1_weight", "fc1_bias"]
    );
    // The composed-from symbol is untouched.
    assert_eq!(net.list_arguments(), vec!["data", "fc1_weight", "fc1_bias"]);

    let mut positional = net.clone();
    let w = Symbol::variable("w");
    let b = Symbol::variable("b");
    positional.compose(&[&act, &w, &b], None).unwrap();
    assert_eq!(positional.list_arguments(), vec!["x", "w", "b"]);
    assert!(matches!(
        net.clone().compose(&[&act], None),
        Err(Error::ArgumentCount { expected: 3, got: 1, .. })
    ));
}

#[test]
fn test_group_concatenates_outputs() {
    let data = Symbol::variable("data");
    let a = fc(&data, "2", "fa");
    let b = fc(&data, "3", "fb");
    let g = Symbol::group(&[a, b, data]);
    assert_eq!(g.list_outputs(), vec!["fa_output", "fb_output", "data"]);
    assert_eq!(
        g.list_arguments(),
        vec!["data", "fa_weight", "fa_bias", "fb_weight", "fb_bias"]
    );
    assert_eq!(g.output(1).unwrap().list_outputs(), vec!["fb_output"]);
    assert!(g.output(3).is_err());
}

#[test]
fn test_auxiliary_state_names() {
    let mut bn = op("BatchNorm", &[]);
    bn.compose_named(&[("data", &Symbol::variable("x"))], Some("bn"))
        .unwrap();
    assert_eq!(
        bn.list_auxiliary_states(),
        vec!["bn_moving_mean", "bn_moving_var"]
    );
    assert_eq!(bn.list_arguments(), vec!["x", "bn_gamma", "bn_beta"]);
}

#[test]
fn test_display_lists_nodes() {
    let text = mlp().to_string();
    assert!(text.starts_with("Symbol Outputs:"));
    assert!(text.contains("Variable:data"));
    assert!(text.contains("Op:FullyConnected, Name=fc1"));
    assert!(text.contains("Op:Activation, Name=relu1"));
    assert!(text.contains("num_hidden=3"));
}

// Shape inference

#[test]
fn test_infer_is_idempotent() {
    let net = mlp();
    let first = net.infer_shape_named(&[("data", Shape::from((4, 10)))]).unwrap();
    let second = net.infer_shape_named(&[("data", Shape::from((4, 10)))]).unwrap();
    assert!(first.complete);
    assert_eq!(first, second);
    assert_eq!(
        first.arg_shapes,
        vec![
            Shape::from((4, 10)),
            Shape::from((8, 10)),
            Shape::from(8),
            Shape::from((3, 8)),
            Shape::from(3),
        ]
    );
    assert_eq!(first.out_shapes, vec![Shape::from((4, 3))]);
}

#[test]
fn test_infer_positional_matches_named() {
    let net = mlp();
    let mut shapes = vec![Shape::none(); net.list_arguments().len()];
    shapes[0] = Shape::from((4, 10));
    let positional = net.infer_shape(&shapes).unwrap();
    let named = net.infer_shape_named(&[("data", Shape::from((4, 10)))]).unwrap();
    assert_eq!(positional, named);
    assert!(matches!(
        net.infer_shape(&shapes[..2]),
        Err(Error::ArgumentCount { .. })
    ));
}

#[test]
fn test_infer_incomplete_is_not_an_error() {
    let net = mlp();
    let result = net.infer_shape_named(&[]).unwrap();
    assert!(!result.complete);
    // What the parameters alone imply is still reported.
    assert_eq!(result.arg_shapes[1], Shape::from((8, 0)));
    assert_eq!(result.out_shapes[0], Shape::from((0, 3)));
}

#[test]
fn test_infer_resolves_missing_leaf_from_consumer() {
    let x = Symbol::variable("x");
    let y = Symbol::variable("y");
    let s = binary("_Plus", &x, &y, "sum");
    let result = s.infer_shape_named(&[("y", Shape::from((2, 5)))]).unwrap();
    assert!(result.complete);
    assert_eq!(result.arg_shapes[0], Shape::from((2, 5)));
}

#[test]
fn test_infer_batch_size_flows_backwards() {
    let data = Symbol::variable("data");
    let h = fc(&data, "4", "fc");
    let loss = binary("_Mul", &h, &Symbol::variable("scale"), "scaled");
    let result = loss
        .infer_shape_named(&[("data", Shape::from((0, 6))), ("scale", Shape::from((5, 4)))])
        .unwrap();
    assert!(result.complete);
    assert_eq!(result.arg_shapes[0], Shape::from((5, 6)));
}

#[test]
fn test_infer_contradiction() {
    let x = Symbol::variable("x");
    let y = Symbol::variable("y");
    let s = binary("_Plus", &x, &y, "sum");
    let err = s
        .infer_shape_named(&[("x", Shape::from(3)), ("y", Shape::from(4))])
        .unwrap_err();
    assert!(matches!(err, Error::ShapeMismatch { .. }));
    assert!(matches!(
        s.infer_shape_named(&[("z", Shape::from(3))]),
        Err(Error::UnknownArgument { .. })
    ));
}

// Gradient graphs

#[test]
fn test_grad_symbol_arguments() {
    let net = mlp();
    let g = net.grad(&["fc1_weight", "fc2_bias"]).unwrap();
    assert_eq!(g.num_outputs(), 2);
    let args = g.list_arguments();
    assert!(args.contains(&"fc2_output_head_grad".to_string()));
    assert!(args.contains(&"data".to_string()));
    assert!(matches!(
        net.grad(&["nope"]),
        Err(Error::UnknownArgument { .. })
    ));
}

#[test]
fn test_grad_of_fan_out_sums_branches() {
    // z = (x + y) + x * y, so dz/dx = 1 + y and dz/dy = 1 + x.
    let x = Symbol::variable("x");
    let y = Symbol::variable("y");
    let a = binary("_Plus", &x, &y, "a");
    let b = binary("_Mul", &x, &y, "b");
    let z = binary("_Plus", &a, &b, "z");
    let g = z.grad(&["x", "y"]).unwrap();

    let engine = Engine::synchronous().unwrap();
    let xs = vec![1.0, -2.0, 0.5];
    let ys = vec![3.0, 4.0, -1.5];
    let args: Vec<Array> = g
        .list_arguments()
        .iter()
        .map(|name| {
            let data = match name.as_str() {
                "x" => xs.clone(),
                "y" => ys.clone(),
                "z_output_head_grad" => vec![1.0; 3],
                other => panic!("unexpected argument {other}"),
            };
            Array::from_vec(data, 3, &engine).unwrap()
        })
        .collect();
    let n = args.len();
    let mut exec = Executor::bind(
        &engine,
        &g,
        Context::cpu(),
        args,
        vec![Array::none(); n],
        vec![GradReq::Null; n],
        vec![],
    )
    .unwrap();
    exec.forward(false).unwrap();
    let outputs = exec.outputs();
    let dx = outputs[0].to_vec().unwrap();
    let dy = outputs[1].to_vec().unwrap();
    for i in 0..3 {
        assert!((dx[i] - (1.0 + ys[i])).abs() < 1e-6);
        assert!((dy[i] - (1.0 + xs[i])).abs() < 1e-6);
    }
}

#[test]
fn test_grad_of_gradient_is_rejected() {
    let x = Symbol::variable("x");
    let y = Symbol::variable("y");
    let g = binary("_Mul", &x, &y, "m").grad(&["x"]).unwrap();
    assert!(g.grad(&["x"]).is_err());
}
