// Symbol — Immutable, composable computation graphs
//
// A Symbol is a list of output entries ("heads") into a DAG of nodes. Nodes
// are shared behind `Arc` and never mutated: composing a symbol builds new
// nodes and leaves every other symbol that shares the old ones untouched.
//
// NODE KINDS:
//
//   variable  — op = None, a named leaf (argument of the graph)
//   atomic    — op = Some, no inputs attached yet (fresh from `Symbol::create`)
//   operation — op = Some, one input entry per operator argument
//
// NAMING:
//
//   Variables are listed under their own name. Outputs of operation nodes are
//   named "{node}_{output}", aux states "{node}_{aux}". A node composed
//   without a name gets "{op type in lower case}{n}" from a process counter.
//
// Usage:
//   let registry = OpRegistry::with_builtins();
//   let mut fc = Symbol::create(registry.create("FullyConnected", &kwargs)?);
//   fc.compose_named(&[("data", &Symbol::variable("data"))], Some("fc1"))?;
//   fc.list_arguments();   // ["data", "fc1_weight", "fc1_bias"]

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use strata_core::{Error, Result, Shape};

use crate::graph::StaticGraph;
use crate::operator::OperatorProperty;

static NAME_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// One graph node. Immutable once built.
#[derive(Debug)]
pub(crate) struct Node {
    pub(crate) op: Option<Arc<dyn OperatorProperty>>,
    pub(crate) name: String,
    pub(crate) inputs: Vec<DataEntry>,
    /// For gradient nodes: the forward node they differentiate.
    pub(crate) backward_source: Option<Arc<Node>>,
}

impl Node {
    pub(crate) fn is_variable(&self) -> bool {
        self.op.is_none()
    }

    /// An operator node that still waits for its inputs.
    pub(crate) fn is_atomic(&self) -> bool {
        match &self.op {
            Some(op) => self.inputs.is_empty() && !op.list_arguments().is_empty(),
            None => false,
        }
    }

    pub(crate) fn num_outputs(&self) -> usize {
        self.op.as_ref().map_or(1, |op| op.list_outputs().len())
    }

    /// Name of output `index`.
    pub(crate) fn output_name(&self, index: usize) -> String {
        match &self.op {
            None => self.name.clone(),
            Some(op) => {
                let outputs = op.list_outputs();
                let output = outputs.get(index).map_or("output", String::as_str);
                format!("{}_{}", self.name, output)
            }
        }
    }

    /// The `i`-th node this one depends on, in walk order.
    fn child(&self, i: usize) -> Option<&Arc<Node>> {
        if i < self.inputs.len() {
            Some(&self.inputs[i].node)
        } else if i == self.inputs.len() {
            self.backward_source.as_ref()
        } else {
            None
        }
    }
}

/// Output `index` of `node`.
#[derive(Debug, Clone)]
pub(crate) struct DataEntry {
    pub(crate) node: Arc<Node>,
    pub(crate) index: usize,
}

/// Every node reachable from `heads`, inputs before their consumers.
///
/// Iterative post-order DFS; inputs are visited in argument order, so the
/// variables come out in the graph's canonical argument order.
pub(crate) fn topo_order(heads: &[DataEntry]) -> Vec<Arc<Node>> {
    let mut order = Vec::new();
    let mut visited: HashSet<*const Node> = HashSet::new();
    for head in heads {
        if !visited.insert(Arc::as_ptr(&head.node)) {
            continue;
        }
        let mut stack: Vec<(Arc<Node>, usize)> = vec![(head.node.clone(), 0)];
        while let Some(top) = stack.last_mut() {
            let node = top.0.clone();
            let next = top.1;
            top.1 += 1;
            match node.child(next).cloned() {
                Some(child) => {
                    if visited.insert(Arc::as_ptr(&child)) {
                        stack.push((child, 0));
                    }
                }
                None => {
                    stack.pop();
                    order.push(node);
                }
            }
        }
    }
    order
}

/// Result of shape inference over a symbol.
#[derive(Debug, Clone, PartialEq)]
pub struct ShapeInference {
    /// In `list_arguments()` order.
    pub arg_shapes: Vec<Shape>,
    /// In `list_outputs()` order.
    pub out_shapes: Vec<Shape>,
    /// In `list_auxiliary_states()` order.
    pub aux_shapes: Vec<Shape>,
    /// True when every shape above is fully known.
    pub complete: bool,
}

/// A symbolic computation graph.
#[derive(Debug, Clone, Default)]
pub struct Symbol {
    pub(crate) heads: Vec<DataEntry>,
}

impl Symbol {
    // Construction

    /// A named leaf.
    pub fn variable(name: &str) -> Symbol {
        let node = Arc::new(Node {
            op: None,
            name: name.to_string(),
            inputs: Vec::new(),
            backward_source: None,
        });
        Symbol {
            heads: vec![DataEntry { node, index: 0 }],
        }
    }

    /// An atomic symbol: one operator node with no inputs attached yet.
    pub fn create(op: Box<dyn OperatorProperty>) -> Symbol {
        let num_outputs = op.list_outputs().len();
        let node = Arc::new(Node {
            op: Some(Arc::from(op)),
            name: String::new(),
            inputs: Vec::new(),
            backward_source: None,
        });
        Symbol {
            heads: (0..num_outputs)
                .map(|index| DataEntry {
                    node: node.clone(),
                    index,
                })
                .collect(),
        }
    }

    /// A symbol whose outputs are the outputs of `symbols`, in order.
    pub fn group(symbols: &[Symbol]) -> Symbol {
        Symbol {
            heads: symbols.iter().flat_map(|s| s.heads.iter().cloned()).collect(),
        }
    }

    /// The single-output symbol selecting output `index`.
    pub fn output(&self, index: usize) -> Result<Symbol> {
        let head = self.heads.get(index).ok_or_else(|| {
            Error::msg(format!(
                "output {index} out of range for a symbol with {} outputs",
                self.heads.len()
            ))
        })?;
        Ok(Symbol {
            heads: vec![head.clone()],
        })
    }

    /// Deep copy: same structure, no node shared with `self`.
    pub fn copy(&self) -> Symbol {
        let mut rebuilt: HashMap<*const Node, Arc<Node>> = HashMap::new();
        for node in topo_order(&self.heads) {
            let copied = Arc::new(Node {
                op: node.op.as_ref().map(|op| Arc::from(op.copy())),
                name: node.name.clone(),
                inputs: node
                    .inputs
                    .iter()
                    .map(|e| DataEntry {
                        node: lookup(&rebuilt, &e.node),
                        index: e.index,
                    })
                    .collect(),
                backward_source: node.backward_source.as_ref().map(|s| lookup(&rebuilt, s)),
            });
            rebuilt.insert(Arc::as_ptr(&node), copied);
        }
        Symbol {
            heads: self
                .heads
                .iter()
                .map(|e| DataEntry {
                    node: lookup(&rebuilt, &e.node),
                    index: e.index,
                })
                .collect(),
        }
    }

    // Composition

    /// Attach `args` positionally.
    ///
    /// An atomic symbol takes exactly one argument per operator argument and
    /// gets `name` (or a generated one). Any other symbol takes one argument
    /// per free variable, in `list_arguments()` order, and keeps its names.
    pub fn compose(&mut self, args: &[&Symbol], name: Option<&str>) -> Result<()> {
        for arg in args {
            check_single_output(arg)?;
        }
        if let Some(node) = self.atomic_node() {
            let op = atomic_op(&node)?;
            let arguments = op.list_arguments();
            if args.len() != arguments.len() {
                return Err(Error::ArgumentCount {
                    what: "compose arguments",
                    expected: arguments.len(),
                    got: args.len(),
                });
            }
            let inputs = args.iter().map(|a| a.heads[0].clone()).collect();
            self.attach(op, name, inputs);
            return Ok(());
        }

        let variables = self.variables();
        if args.len() != variables.len() {
            return Err(Error::ArgumentCount {
                what: "compose arguments",
                expected: variables.len(),
                got: args.len(),
            });
        }
        let replace: HashMap<*const Node, DataEntry> = variables
            .iter()
            .zip(args)
            .map(|(v, a)| (Arc::as_ptr(v), a.heads[0].clone()))
            .collect();
        self.replace_variables(&replace);
        Ok(())
    }

    /// Attach `args` by argument name.
    ///
    /// On an atomic symbol arguments left out become new variables named
    /// "{name}_{argument}". On any other symbol the keywords name free
    /// variables to replace.
    pub fn compose_named(&mut self, args: &[(&str, &Symbol)], name: Option<&str>) -> Result<()> {
        for (_, arg) in args {
            check_single_output(arg)?;
        }
        if let Some(node) = self.atomic_node() {
            let op = atomic_op(&node)?;
            let arguments = op.list_arguments();
            for (key, _) in args {
                if !arguments.iter().any(|a| a.as_str() == *key) {
                    return Err(Error::UnknownArgument {
                        name: key.to_string(),
                        target: op.type_name().to_string(),
                    });
                }
            }
            let node_name = resolve_name(op.as_ref(), name);
            let inputs = arguments
                .iter()
                .map(|arg| match args.iter().find(|(key, _)| *key == arg.as_str()) {
                    Some((_, sym)) => sym.heads[0].clone(),
                    None => Symbol::variable(&format!("{node_name}_{arg}")).heads[0].clone(),
                })
                .collect();
            self.attach(op, Some(&node_name), inputs);
            return Ok(());
        }

        let variables = self.variables();
        let mut replace: HashMap<*const Node, DataEntry> = HashMap::new();
        for (key, sym) in args {
            let matched: Vec<&Arc<Node>> = variables.iter().filter(|v| v.name == *key).collect();
            if matched.is_empty() {
                return Err(Error::UnknownArgument {
                    name: key.to_string(),
                    target: "symbol".to_string(),
                });
            }
            for v in matched {
                replace.insert(Arc::as_ptr(v), sym.heads[0].clone());
            }
        }
        self.replace_variables(&replace);
        Ok(())
    }

    fn atomic_node(&self) -> Option<Arc<Node>> {
        let first = self.heads.first()?;
        let same = self.heads.iter().all(|h| Arc::ptr_eq(&h.node, &first.node));
        (same && first.node.is_atomic()).then(|| first.node.clone())
    }

    fn attach(&mut self, op: Arc<dyn OperatorProperty>, name: Option<&str>, inputs: Vec<DataEntry>) {
        let name = resolve_name(op.as_ref(), name);
        let num_outputs = op.list_outputs().len();
        let node = Arc::new(Node {
            op: Some(op),
            name,
            inputs,
            backward_source: None,
        });
        self.heads = (0..num_outputs)
            .map(|index| DataEntry {
                node: node.clone(),
                index,
            })
            .collect();
    }

    /// Rebuild the graph with some variable nodes swapped for other entries.
    /// Untouched subgraphs stay shared.
    fn replace_variables(&mut self, replace: &HashMap<*const Node, DataEntry>) {
        let mut rebuilt: HashMap<*const Node, DataEntry> = HashMap::new();
        let translate = |rebuilt: &HashMap<*const Node, DataEntry>, e: &DataEntry| -> DataEntry {
            match rebuilt.get(&Arc::as_ptr(&e.node)) {
                Some(r) if e.node.is_variable() => r.clone(),
                Some(r) => DataEntry {
                    node: r.node.clone(),
                    index: e.index,
                },
                None => e.clone(),
            }
        };
        for node in topo_order(&self.heads) {
            let key = Arc::as_ptr(&node);
            if let Some(entry) = replace.get(&key) {
                rebuilt.insert(key, entry.clone());
                continue;
            }
            let inputs: Vec<DataEntry> = node.inputs.iter().map(|e| translate(&rebuilt, e)).collect();
            let changed = inputs
                .iter()
                .zip(&node.inputs)
                .any(|(new, old)| !Arc::ptr_eq(&new.node, &old.node) || new.index != old.index);
            if changed {
                let source = node
                    .backward_source
                    .as_ref()
                    .map(|s| rebuilt.get(&Arc::as_ptr(s)).map_or(s.clone(), |r| r.node.clone()));
                let fresh = Arc::new(Node {
                    op: node.op.clone(),
                    name: node.name.clone(),
                    inputs,
                    backward_source: source,
                });
                rebuilt.insert(key, DataEntry { node: fresh, index: 0 });
            }
        }
        self.heads = self.heads.iter().map(|h| translate(&rebuilt, h)).collect();
    }

    fn variables(&self) -> Vec<Arc<Node>> {
        topo_order(&self.heads)
            .into_iter()
            .filter(|n| n.is_variable())
            .collect()
    }

    // Introspection

    /// Names of the free variables, in canonical order.
    pub fn list_arguments(&self) -> Vec<String> {
        self.variables().into_iter().map(|n| n.name.clone()).collect()
    }

    pub fn list_outputs(&self) -> Vec<String> {
        self.heads.iter().map(|h| h.node.output_name(h.index)).collect()
    }

    pub fn list_auxiliary_states(&self) -> Vec<String> {
        let mut names = Vec::new();
        for node in topo_order(&self.heads) {
            if let Some(op) = &node.op {
                for aux in op.list_auxiliary_states() {
                    names.push(format!("{}_{}", node.name, aux));
                }
            }
        }
        names
    }

    pub fn num_outputs(&self) -> usize {
        self.heads.len()
    }

    // Graph transformations

    /// Symbol computing the gradient of the outputs with respect to the
    /// variables named in `wrt`, one output per name.
    ///
    /// The result takes one extra argument per output of `self`,
    /// "{output}_head_grad", holding the gradient flowing into that output.
    pub fn grad(&self, wrt: &[&str]) -> Result<Symbol> {
        let mut graph = StaticGraph::from_symbol(self)?;
        let wrt_nodes = wrt
            .iter()
            .map(|name| graph.find_argument(name))
            .collect::<Result<Vec<_>>>()?;
        let pass = graph.make_backward_pass(&wrt_nodes)?;
        Ok(graph.to_symbol(&pass.arg_grads))
    }

    /// Infer shapes from one shape per argument, in `list_arguments()` order.
    /// Unknown argument shapes are passed as `Shape::none()`.
    pub fn infer_shape(&self, arg_shapes: &[Shape]) -> Result<ShapeInference> {
        let graph = StaticGraph::from_symbol(self)?;
        if arg_shapes.len() != graph.arg_nodes.len() {
            return Err(Error::ArgumentCount {
                what: "argument shapes",
                expected: graph.arg_nodes.len(),
                got: arg_shapes.len(),
            });
        }
        graph.infer_summary(arg_shapes)
    }

    /// Infer shapes from the shapes of some arguments, given by name.
    pub fn infer_shape_named(&self, known: &[(&str, Shape)]) -> Result<ShapeInference> {
        let graph = StaticGraph::from_symbol(self)?;
        let mut arg_shapes = vec![Shape::none(); graph.arg_nodes.len()];
        for (name, shape) in known {
            let positions: Vec<usize> = graph
                .arg_nodes
                .iter()
                .enumerate()
                .filter(|(_, n)| graph.nodes[**n].name == *name)
                .map(|(j, _)| j)
                .collect();
            if positions.is_empty() {
                return Err(Error::UnknownArgument {
                    name: name.to_string(),
                    target: "shape inference".to_string(),
                });
            }
            for j in positions {
                arg_shapes[j] = shape.clone();
            }
        }
        graph.infer_summary(&arg_shapes)
    }
}

fn lookup(map: &HashMap<*const Node, Arc<Node>>, node: &Arc<Node>) -> Arc<Node> {
    map.get(&Arc::as_ptr(node)).cloned().unwrap_or_else(|| node.clone())
}

fn atomic_op(node: &Node) -> Result<Arc<dyn OperatorProperty>> {
    node.op
        .clone()
        .ok_or_else(|| Error::msg("a variable cannot be composed"))
}

fn check_single_output(sym: &Symbol) -> Result<()> {
    if sym.heads.len() != 1 {
        return Err(Error::ArgumentCount {
            what: "outputs of a composed argument",
            expected: 1,
            got: sym.heads.len(),
        });
    }
    Ok(())
}

fn resolve_name(op: &dyn OperatorProperty, name: Option<&str>) -> String {
    match name {
        Some(name) => name.to_string(),
        None => {
            let n = NAME_COUNTER.fetch_add(1, Ordering::Relaxed);
            format!("{}{}", op.type_name().to_lowercase(), n)
        }
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Symbol Outputs:")?;
        for (i, head) in self.heads.iter().enumerate() {
            writeln!(f, "\toutput[{i}]={}({})", head.node.name, head.index)?;
        }
        for node in topo_order(&self.heads) {
            let Some(op) = &node.op else {
                writeln!(f, "Variable:{}", node.name)?;
                continue;
            };
            writeln!(f, "--------------------")?;
            writeln!(f, "Op:{}, Name={}", op.type_name(), node.name)?;
            writeln!(f, "Inputs:")?;
            for (i, input) in node.inputs.iter().enumerate() {
                writeln!(f, "\targ[{i}]={}({})", input.node.name, input.index)?;
            }
            let params = op.params();
            if !params.is_empty() {
                writeln!(f, "Params:")?;
                for (key, value) in params {
                    writeln!(f, "\t{key}={value}")?;
                }
            }
            if let Some(source) = &node.backward_source {
                writeln!(f, "BackwardOf:{}", source.name)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operator::{ElementWiseBinary, ElementWiseKind, FullyConnected};

    fn fc(num_hidden: usize) -> Symbol {
        Symbol::create(Box::new(FullyConnected {
            num_hidden,
            no_bias: false,
        }))
    }

    #[test]
    fn test_variable() {
        let x = Symbol::variable("x");
        assert_eq!(x.list_arguments(), vec!["x"]);
        assert_eq!(x.list_outputs(), vec!["x"]);
        assert!(x.list_auxiliary_states().is_empty());
    }

    #[test]
    fn test_positional_compose_count() {
        let x = Symbol::variable("x");
        let mut s = fc(3);
        let err = s.compose(&[&x], Some("fc")).unwrap_err();
        assert!(matches!(
            err,
            Error::ArgumentCount {
                expected: 3,
                got: 1,
                ..
            }
        ));
        // Unchanged after the failed call.
        assert!(s.atomic_node().is_some());
    }

    #[test]
    fn test_generated_names_are_distinct() {
        let x = Symbol::variable("x");
        let y = Symbol::variable("y");
        let mut a = Symbol::create(Box::new(ElementWiseBinary::new(ElementWiseKind::Plus)));
        let mut b = a.clone();
        a.compose(&[&x, &y], None).unwrap();
        b.compose(&[&x, &y], None).unwrap();
        let (na, nb) = (&a.heads[0].node.name, &b.heads[0].node.name);
        assert!(na.starts_with("_plus"));
        assert_ne!(na, nb);
    }

    #[test]
    fn test_topo_order_shares_nodes() {
        let x = Symbol::variable("x");
        let mut a = Symbol::create(Box::new(ElementWiseBinary::new(ElementWiseKind::Mul)));
        a.compose(&[&x, &x], Some("sq")).unwrap();
        assert_eq!(a.list_arguments(), vec!["x"]);
        assert_eq!(topo_order(&a.heads).len(), 2);
    }

    #[test]
    fn test_copy_is_deep() {
        let mut s = fc(2);
        s.compose_named(&[("data", &Symbol::variable("data"))], Some("fc"))
            .unwrap();
        let c = s.copy();
        assert_eq!(c.list_arguments(), s.list_arguments());
        assert!(!Arc::ptr_eq(&c.heads[0].node, &s.heads[0].node));
    }
}
