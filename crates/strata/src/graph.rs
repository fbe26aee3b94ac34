// StaticGraph — Index-addressed form of a Symbol
//
// Shape inference, gradient construction and binding all work on this flat
// form: nodes live in a Vec in topological order and refer to each other by
// index, so every pass is a plain loop instead of a pointer walk.
//
// BACKWARD PASS:
//
//   For each head a variable "{output}_head_grad" carries the incoming
//   gradient. Forward nodes that depend on a differentiated variable are
//   visited in reverse order and each emits one gradient node:
//
//     inputs  = out_grad[..] ++ in_data[..] ++ out_data[..]
//     outputs = one gradient per forward argument
//
//   An entry that receives more than one gradient contribution gets an
//   explicit ElementWiseSum node. An entry that receives none gets a
//   _zeros_like node.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use strata_core::{bail, Error, Result, Shape};

use crate::operator::{ElementWiseSum, OperatorProperty, ZerosLike};
use crate::symbol::{topo_order, DataEntry, Node, ShapeInference, Symbol};

/// Output `index` of node `node`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryRef {
    pub node: usize,
    pub index: usize,
}

impl EntryRef {
    pub fn new(node: usize, index: usize) -> Self {
        EntryRef { node, index }
    }
}

/// A node of a static graph. `op == None` marks a variable.
#[derive(Debug, Clone)]
pub struct StaticNode {
    pub op: Option<Arc<dyn OperatorProperty>>,
    pub name: String,
    pub inputs: Vec<EntryRef>,
    pub backward_source: Option<usize>,
}

impl StaticNode {
    pub fn is_variable(&self) -> bool {
        self.op.is_none()
    }

    pub fn num_outputs(&self) -> usize {
        self.op.as_ref().map_or(1, |op| op.list_outputs().len())
    }

    pub fn num_aux(&self) -> usize {
        self.op
            .as_ref()
            .map_or(0, |op| op.list_auxiliary_states().len())
    }
}

/// What `make_backward_pass` added to the graph.
#[derive(Debug, Clone)]
pub struct BackwardPass {
    /// Nodes `[0, num_forward)` are the forward graph.
    pub num_forward: usize,
    /// Head-gradient variable nodes, parallel to `heads`.
    pub head_grads: Vec<usize>,
    /// Final gradient entry of each differentiated variable.
    pub arg_grads: Vec<EntryRef>,
}

/// Shapes of every entry and aux state of a graph.
#[derive(Debug, Clone)]
pub struct GraphShapes {
    pub entries: Vec<Vec<Shape>>,
    pub aux: Vec<Vec<Shape>>,
}

impl GraphShapes {
    pub fn entry(&self, e: EntryRef) -> &Shape {
        &self.entries[e.node][e.index]
    }
}

/// A graph in topological order.
#[derive(Debug, Clone, Default)]
pub struct StaticGraph {
    pub nodes: Vec<StaticNode>,
    pub heads: Vec<EntryRef>,
    /// Variable nodes in canonical argument order.
    pub arg_nodes: Vec<usize>,
}

impl StaticGraph {
    /// Flatten a symbol. Operator nodes must have their inputs attached.
    pub fn from_symbol(symbol: &Symbol) -> Result<StaticGraph> {
        let order = topo_order(&symbol.heads);
        let index: HashMap<*const Node, usize> = order
            .iter()
            .enumerate()
            .map(|(i, n)| (Arc::as_ptr(n), i))
            .collect();
        let entry = |e: &DataEntry| EntryRef::new(index[&Arc::as_ptr(&e.node)], e.index);

        let mut graph = StaticGraph::default();
        for (i, node) in order.iter().enumerate() {
            if node.is_atomic() {
                bail!("operator node '{}' has no inputs attached", node.name);
            }
            if node.is_variable() {
                graph.arg_nodes.push(i);
            }
            graph.nodes.push(StaticNode {
                op: node.op.clone(),
                name: node.name.clone(),
                inputs: node.inputs.iter().map(entry).collect(),
                backward_source: node
                    .backward_source
                    .as_ref()
                    .map(|s| index[&Arc::as_ptr(s)]),
            });
        }
        graph.heads = symbol.heads.iter().map(entry).collect();
        Ok(graph)
    }

    /// Rebuild a symbol with `heads` as outputs.
    pub fn to_symbol(&self, heads: &[EntryRef]) -> Symbol {
        let mut built: Vec<Arc<Node>> = Vec::with_capacity(self.nodes.len());
        for node in &self.nodes {
            let inputs = node
                .inputs
                .iter()
                .map(|e| DataEntry {
                    node: built[e.node].clone(),
                    index: e.index,
                })
                .collect();
            built.push(Arc::new(Node {
                op: node.op.clone(),
                name: node.name.clone(),
                inputs,
                backward_source: node.backward_source.map(|s| built[s].clone()),
            }));
        }
        Symbol {
            heads: heads
                .iter()
                .map(|e| DataEntry {
                    node: built[e.node].clone(),
                    index: e.index,
                })
                .collect(),
        }
    }

    /// Index of the variable named `name`.
    pub fn find_argument(&self, name: &str) -> Result<usize> {
        self.arg_nodes
            .iter()
            .copied()
            .find(|&n| self.nodes[n].name == name)
            .ok_or_else(|| Error::UnknownArgument {
                name: name.to_string(),
                target: "gradient".to_string(),
            })
    }

    pub fn entry_name(&self, e: EntryRef) -> String {
        let node = &self.nodes[e.node];
        match &node.op {
            None => node.name.clone(),
            Some(op) => match op.list_outputs().get(e.index) {
                Some(output) => format!("{}_{}", node.name, output),
                None => format!("{}_{}", node.name, e.index),
            },
        }
    }

    // Shape inference

    /// Propagate shapes to a fixed point.
    ///
    /// `arg_shapes` and `aux_shapes` seed the variables (in `arg_nodes` order)
    /// and the aux states (in node order); missing seeds are unknown. Each
    /// sweep asks every operator to refine its inputs and outputs; the loop
    /// stops when a sweep changes nothing.
    pub fn infer_shapes(&self, arg_shapes: &[Shape], aux_shapes: &[Shape]) -> Result<GraphShapes> {
        let mut entries: Vec<Vec<Shape>> = self
            .nodes
            .iter()
            .map(|n| vec![Shape::none(); n.num_outputs()])
            .collect();
        let mut aux: Vec<Vec<Shape>> = self
            .nodes
            .iter()
            .map(|n| vec![Shape::none(); n.num_aux()])
            .collect();
        for (&node, shape) in self.arg_nodes.iter().zip(arg_shapes) {
            entries[node][0] = shape.clone();
        }
        let mut seeds = aux_shapes.iter();
        for slot in aux.iter_mut().flatten() {
            if let Some(shape) = seeds.next() {
                *slot = shape.clone();
            }
        }

        let mut sweeps = 0;
        loop {
            sweeps += 1;
            let mut progress = false;
            for (i, node) in self.nodes.iter().enumerate() {
                let Some(op) = &node.op else { continue };
                let mut ins: Vec<Shape> = node
                    .inputs
                    .iter()
                    .map(|e| entries[e.node][e.index].clone())
                    .collect();
                let mut outs = entries[i].clone();
                let mut node_aux = aux[i].clone();
                op.infer_shape(&mut ins, &mut outs, &mut node_aux)?;

                for (e, shape) in node.inputs.iter().zip(&ins) {
                    progress |= entries[e.node][e.index].refine(shape)?;
                }
                for (slot, shape) in entries[i].iter_mut().zip(&outs) {
                    progress |= slot.refine(shape)?;
                }
                for (slot, shape) in aux[i].iter_mut().zip(&node_aux) {
                    progress |= slot.refine(shape)?;
                }
            }
            if !progress {
                break;
            }
        }
        log::trace!("graph: shape inference settled after {sweeps} sweeps");
        Ok(GraphShapes { entries, aux })
    }

    /// Shape inference summarized per argument, output and aux state.
    pub(crate) fn infer_summary(&self, arg_shapes: &[Shape]) -> Result<ShapeInference> {
        let shapes = self.infer_shapes(arg_shapes, &[])?;
        let arg_shapes: Vec<Shape> = self
            .arg_nodes
            .iter()
            .map(|&n| shapes.entries[n][0].clone())
            .collect();
        let out_shapes: Vec<Shape> = self.heads.iter().map(|&h| shapes.entry(h).clone()).collect();
        let aux_shapes: Vec<Shape> = shapes.aux.into_iter().flatten().collect();
        let complete = arg_shapes
            .iter()
            .chain(&out_shapes)
            .chain(&aux_shapes)
            .all(Shape::is_known);
        Ok(ShapeInference {
            arg_shapes,
            out_shapes,
            aux_shapes,
            complete,
        })
    }

    // Gradient construction

    fn push_node(
        &mut self,
        op: Option<Arc<dyn OperatorProperty>>,
        name: String,
        inputs: Vec<EntryRef>,
        backward_source: Option<usize>,
    ) -> usize {
        self.nodes.push(StaticNode {
            op,
            name,
            inputs,
            backward_source,
        });
        self.nodes.len() - 1
    }

    /// One entry holding the total gradient of `target`.
    fn total_gradient(&mut self, target: EntryRef, contributions: Vec<EntryRef>) -> EntryRef {
        match contributions.len() {
            0 => {
                let name = format!("{}_zeros", self.entry_name(target));
                let node = self.push_node(Some(Arc::new(ZerosLike)), name, vec![target], None);
                EntryRef::new(node, 0)
            }
            1 => contributions[0],
            n => {
                let name = format!("{}_grad_sum", self.entry_name(target));
                let node = self.push_node(
                    Some(Arc::new(ElementWiseSum::new(n))),
                    name,
                    contributions,
                    None,
                );
                EntryRef::new(node, 0)
            }
        }
    }

    /// Append the gradient graph of the heads with respect to the variable
    /// nodes `wrt`.
    ///
    /// The returned entries are always produced by operator nodes, so they
    /// can be bound directly to gradient storage.
    pub fn make_backward_pass(&mut self, wrt: &[usize]) -> Result<BackwardPass> {
        let num_forward = self.nodes.len();
        for &w in wrt {
            if w >= num_forward || !self.nodes[w].is_variable() {
                bail!("node {w} is not a variable and cannot be differentiated");
            }
        }

        // Which forward nodes sit downstream of a differentiated variable.
        let mut depends = vec![false; num_forward];
        for &w in wrt {
            depends[w] = true;
        }
        for i in 0..num_forward {
            if !depends[i] {
                depends[i] = self.nodes[i].inputs.iter().any(|e| depends[e.node]);
            }
        }

        let mut grads: BTreeMap<EntryRef, Vec<EntryRef>> = BTreeMap::new();
        let mut head_grads = Vec::with_capacity(self.heads.len());
        for head in self.heads.clone() {
            let name = format!("{}_head_grad", self.entry_name(head));
            let node = self.push_node(None, name, Vec::new(), None);
            head_grads.push(node);
            grads.entry(head).or_default().push(EntryRef::new(node, 0));
        }

        for i in (0..num_forward).rev() {
            let Some(op) = self.nodes[i].op.clone() else { continue };
            if !depends[i] {
                continue;
            }
            let num_outputs = op.list_outputs().len();
            let received: Vec<Vec<EntryRef>> = (0..num_outputs)
                .map(|k| grads.remove(&EntryRef::new(i, k)).unwrap_or_default())
                .collect();
            if received.iter().all(Vec::is_empty) {
                continue;
            }

            let mut inputs = Vec::new();
            for (k, contributions) in received.into_iter().enumerate() {
                inputs.push(self.total_gradient(EntryRef::new(i, k), contributions));
            }
            let forward_inputs = self.nodes[i].inputs.clone();
            inputs.extend(forward_inputs.iter().copied());
            inputs.extend((0..num_outputs).map(|k| EntryRef::new(i, k)));

            let backward_op: Arc<dyn OperatorProperty> = Arc::from(op.backward_property()?);
            let name = format!("{}_backward", self.nodes[i].name);
            let node = self.push_node(Some(backward_op), name, inputs, Some(i));
            for (j, input) in forward_inputs.into_iter().enumerate() {
                grads.entry(input).or_default().push(EntryRef::new(node, j));
            }
        }

        let mut arg_grads = Vec::with_capacity(wrt.len());
        for &w in wrt {
            let target = EntryRef::new(w, 0);
            let contributions = grads.remove(&target).unwrap_or_default();
            let mut total = self.total_gradient(target, contributions);
            // A bare head-gradient variable cannot be bound to gradient
            // storage; copy it through a one-input sum.
            if self.nodes[total.node].is_variable() {
                let name = format!("{}_grad_copy", self.entry_name(target));
                let node = self.push_node(
                    Some(Arc::new(ElementWiseSum::new(1))),
                    name,
                    vec![total],
                    None,
                );
                total = EntryRef::new(node, 0);
            }
            arg_grads.push(total);
        }

        log::debug!(
            "graph: backward pass for {} variables added {} nodes",
            wrt.len(),
            self.nodes.len() - num_forward
        );
        Ok(BackwardPass {
            num_forward,
            head_grads,
            arg_grads,
        })
    }
}

impl fmt::Display for StaticGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, node) in self.nodes.iter().enumerate() {
            match &node.op {
                None => writeln!(f, "{i:>4}  variable {}", node.name)?,
                Some(op) => {
                    let inputs: Vec<String> = node
                        .inputs
                        .iter()
                        .map(|e| format!("{}:{}", e.node, e.index))
                        .collect();
                    write!(f, "{i:>4}  {} {} ({})", op.type_name(), node.name, inputs.join(", "))?;
                    if let Some(source) = node.backward_source {
                        write!(f, " grad of {source}")?;
                    }
                    writeln!(f)?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operator::{ElementWiseBinary, ElementWiseKind, FullyConnected};

    fn binary(kind: ElementWiseKind, lhs: &Symbol, rhs: &Symbol, name: &str) -> Symbol {
        let mut s = Symbol::create(Box::new(ElementWiseBinary::new(kind)));
        s.compose(&[lhs, rhs], Some(name)).unwrap();
        s
    }

    #[test]
    fn test_from_symbol_order() {
        let x = Symbol::variable("x");
        let y = Symbol::variable("y");
        let s = binary(ElementWiseKind::Plus, &x, &y, "add");
        let g = StaticGraph::from_symbol(&s).unwrap();
        assert_eq!(g.nodes.len(), 3);
        assert_eq!(g.arg_nodes, vec![0, 1]);
        assert_eq!(g.heads, vec![EntryRef::new(2, 0)]);
        assert_eq!(g.entry_name(g.heads[0]), "add_output");
    }

    #[test]
    fn test_uncomposed_rejected() {
        let s = Symbol::create(Box::new(FullyConnected {
            num_hidden: 2,
            no_bias: false,
        }));
        assert!(StaticGraph::from_symbol(&s).is_err());
    }

    #[test]
    fn test_fan_out_gets_sum() {
        let x = Symbol::variable("x");
        let y = Symbol::variable("y");
        let a = binary(ElementWiseKind::Plus, &x, &y, "a");
        let b = binary(ElementWiseKind::Mul, &x, &y, "b");
        let mut g = StaticGraph::from_symbol(&Symbol::group(&[a, b])).unwrap();
        let x_node = g.find_argument("x").unwrap();
        let pass = g.make_backward_pass(&[x_node]).unwrap();
        assert_eq!(pass.head_grads.len(), 2);
        let sum = &g.nodes[pass.arg_grads[0].node];
        assert_eq!(sum.op.as_ref().unwrap().type_name(), "ElementWiseSum");
        assert_eq!(sum.inputs.len(), 2);
    }

    #[test]
    fn test_identity_gradient_is_copied() {
        let x = Symbol::variable("x");
        let mut g = StaticGraph::from_symbol(&x).unwrap();
        let pass = g.make_backward_pass(&[0]).unwrap();
        assert_eq!(g.nodes[pass.head_grads[0]].name, "x_head_grad");
        let node = &g.nodes[pass.arg_grads[0].node];
        assert!(!node.is_variable());
        assert_eq!(node.inputs, vec![EntryRef::new(pass.head_grads[0], 0)]);
    }

    #[test]
    fn test_head_variable_gradient() {
        let x = Symbol::variable("x");
        let y = Symbol::variable("y");
        let a = binary(ElementWiseKind::Plus, &x, &x, "a");
        let mut g = StaticGraph::from_symbol(&Symbol::group(&[a, y])).unwrap();
        let y_node = g.find_argument("y").unwrap();
        let x_node = g.find_argument("x").unwrap();
        let pass = g.make_backward_pass(&[x_node, y_node]).unwrap();
        // y is itself a head: its gradient is the head gradient, copied.
        let y_grad = &g.nodes[pass.arg_grads[1].node];
        assert_eq!(y_grad.op.as_ref().unwrap().type_name(), "ElementWiseSum");
        assert!(g.make_backward_pass(&[pass.arg_grads[0].node]).is_err());
    }

    #[test]
    fn test_infer_fixed_point() {
        let x = Symbol::variable("x");
        let y = Symbol::variable("y");
        let a = binary(ElementWiseKind::Plus, &x, &y, "a");
        let g = StaticGraph::from_symbol(&a).unwrap();
        // Only y is known; x is resolved from its sibling.
        let shapes = g
            .infer_shapes(&[Shape::none(), Shape::from((2, 3))], &[])
            .unwrap();
        assert_eq!(shapes.entries[0][0], Shape::from((2, 3)));
        assert_eq!(shapes.entry(g.heads[0]), &Shape::from((2, 3)));
        assert!(g
            .infer_shapes(&[Shape::from(4), Shape::from(5)], &[])
            .is_err());
    }
}
