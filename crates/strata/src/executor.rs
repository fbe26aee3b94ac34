// Executor — A symbol bound to concrete arrays
//
// Binding flattens the symbol, appends the gradient graph when any argument
// asks for a gradient, runs shape inference with the bound shapes and gives
// every graph entry its array:
//
//   variable entries        → the bound argument arrays
//   final gradient entries  → the bound gradient targets, with their GradReq
//   consumed or head entries → executor-owned arrays (allocated on first use)
//   everything else         → none-state, OpReq::Null
//
// STATE MACHINE:
//
//   bind → Bound ──forward──→ Forwarded ──backward──→ Forwarded ...
//
//   forward may run any number of times; backward needs at least one forward
//   and reuses its is_train flag. Both only submit engine operations, so they
//   return before the work is done. Wait on the arrays to read results.
//
// Usage:
//   let mut exec = Executor::bind(&engine, &net, Context::cpu(), args, grads, reqs, aux)?;
//   exec.forward(true)?;
//   exec.backward(&[head_grad])?;
//   let dw = exec.grad_arrays()[1].to_vec()?;

use std::fmt;

use strata_core::{Array, Context, Engine, Error, Result, Shape};

use crate::graph::{EntryRef, StaticGraph};
use crate::operator::{
    GradReq, OpContext, OpReq, Operator, Resource, ResourceRequest, TempSpace,
};
use crate::symbol::Symbol;

/// A bound, runnable graph.
pub struct Executor {
    context: Context,
    graph: StaticGraph,
    num_forward: usize,
    head_grad_nodes: Vec<usize>,
    operators: Vec<Option<Box<dyn Operator>>>,
    resources: Vec<Vec<Resource>>,
    /// Array of every entry, indexed by node then output.
    entries: Vec<Vec<Array>>,
    reqs: Vec<Vec<OpReq>>,
    /// Aux arrays each node runs with.
    node_aux: Vec<Vec<Array>>,
    args: Vec<Array>,
    arg_grads: Vec<Array>,
    grad_reqs: Vec<GradReq>,
    aux_states: Vec<Array>,
    /// Entries that must be computed but whose shape stayed unknown.
    unresolved: Vec<String>,
    /// is_train of the last forward, None before the first one.
    last_forward: Option<bool>,
}

impl Executor {
    /// Bind `symbol` to arrays on `context`.
    ///
    /// `args`, `arg_grads` and `grad_reqs` line up with
    /// `symbol.list_arguments()`, `aux_states` with
    /// `symbol.list_auxiliary_states()`. An argument without gradient storage
    /// must use `GradReq::Null`. A none-state aux array is replaced by a
    /// zero-initialized one when its shape can be inferred.
    #[allow(clippy::too_many_arguments)]
    pub fn bind(
        engine: &Engine,
        symbol: &Symbol,
        context: Context,
        args: Vec<Array>,
        arg_grads: Vec<Array>,
        grad_reqs: Vec<GradReq>,
        aux_states: Vec<Array>,
    ) -> Result<Executor> {
        let mut graph = StaticGraph::from_symbol(symbol)?;
        let num_args = graph.arg_nodes.len();
        let num_aux: usize = graph.nodes.iter().map(|n| n.num_aux()).sum();
        check_len("bound arguments", num_args, args.len())?;
        check_len("gradient targets", num_args, arg_grads.len())?;
        check_len("gradient requests", num_args, grad_reqs.len())?;
        check_len("auxiliary states", num_aux, aux_states.len())?;

        for (j, (grad, &req)) in arg_grads.iter().zip(&grad_reqs).enumerate() {
            if grad.is_none() && req != OpReq::Null {
                return Err(Error::InvalidGradReq {
                    arg: graph.nodes[graph.arg_nodes[j]].name.clone(),
                });
            }
        }
        for array in args.iter().chain(&arg_grads).chain(&aux_states) {
            check_placement(array, context, engine)?;
        }

        // Gradient graph.
        let wrt: Vec<usize> = (0..num_args)
            .filter(|&j| grad_reqs[j] != OpReq::Null)
            .map(|j| graph.arg_nodes[j])
            .collect();
        let mut num_forward = graph.nodes.len();
        let mut head_grad_nodes = Vec::new();
        let mut grad_targets: Vec<(EntryRef, usize)> = Vec::new();
        if !wrt.is_empty() {
            let pass = graph.make_backward_pass(&wrt)?;
            num_forward = pass.num_forward;
            head_grad_nodes = pass.head_grads;
            let requested = (0..num_args).filter(|&j| grad_reqs[j] != OpReq::Null);
            grad_targets = pass.arg_grads.into_iter().zip(requested).collect();
        }

        // Shapes, seeded with everything that is bound.
        let mut arg_shapes = Vec::with_capacity(num_args);
        for (arg, grad) in args.iter().zip(&arg_grads) {
            let mut shape = arg.shape().clone();
            shape.refine(grad.shape())?;
            arg_shapes.push(shape);
        }
        let aux_shapes: Vec<Shape> = aux_states.iter().map(|a| a.shape().clone()).collect();
        let shapes = graph.infer_shapes(&arg_shapes, &aux_shapes)?;

        // Who reads what.
        let mut consumed: Vec<Vec<bool>> = graph
            .nodes
            .iter()
            .map(|n| vec![false; n.num_outputs()])
            .collect();
        for node in &graph.nodes {
            for e in &node.inputs {
                consumed[e.node][e.index] = true;
            }
        }
        for h in &graph.heads {
            consumed[h.node][h.index] = true;
        }

        // Entry arrays.
        let mut unresolved = Vec::new();
        let mut entries: Vec<Vec<Array>> = Vec::with_capacity(graph.nodes.len());
        let mut reqs: Vec<Vec<OpReq>> = Vec::with_capacity(graph.nodes.len());
        for (i, node) in graph.nodes.iter().enumerate() {
            if node.is_variable() {
                let array = match graph.arg_nodes.iter().position(|&n| n == i) {
                    Some(j) => args[j].clone(),
                    None => {
                        // Head gradient: shaped like its head.
                        let e = EntryRef::new(i, 0);
                        let mut shape = shapes.entry(e).clone();
                        if let Some(k) = head_grad_nodes.iter().position(|&n| n == i) {
                            shape.refine(shapes.entry(graph.heads[k]))?;
                        }
                        allocate(&shape, &graph.entry_name(e), context, engine, &mut unresolved)
                    }
                };
                entries.push(vec![array]);
                reqs.push(vec![OpReq::Write]);
                continue;
            }
            let mut node_entries = Vec::with_capacity(node.num_outputs());
            let mut node_reqs = Vec::with_capacity(node.num_outputs());
            for k in 0..node.num_outputs() {
                let e = EntryRef::new(i, k);
                if let Some(&(_, j)) = grad_targets.iter().find(|(g, _)| *g == e) {
                    node_entries.push(arg_grads[j].clone());
                    node_reqs.push(grad_reqs[j]);
                } else if consumed[i][k] {
                    node_entries.push(allocate(
                        shapes.entry(e),
                        &graph.entry_name(e),
                        context,
                        engine,
                        &mut unresolved,
                    ));
                    node_reqs.push(OpReq::Write);
                } else {
                    node_entries.push(Array::none());
                    node_reqs.push(OpReq::Null);
                }
            }
            entries.push(node_entries);
            reqs.push(node_reqs);
        }

        // Aux arrays: bound ones, or fresh ones where only the shape is known.
        let aux_names: Vec<String> = graph
            .nodes
            .iter()
            .flat_map(|n| {
                let aux = n.op.as_ref().map(|op| op.list_auxiliary_states()).unwrap_or_default();
                aux.into_iter().map(move |a| format!("{}_{}", n.name, a))
            })
            .collect();
        let inferred_aux: Vec<&Shape> = shapes.aux.iter().flatten().collect();
        let mut aux_states = aux_states;
        for (k, array) in aux_states.iter_mut().enumerate() {
            if array.is_none() {
                *array = allocate(inferred_aux[k], &aux_names[k], context, engine, &mut unresolved);
            }
        }
        let mut node_aux: Vec<Vec<Array>> = Vec::with_capacity(graph.nodes.len());
        let mut next_aux = 0;
        for node in &graph.nodes {
            let n = node.num_aux();
            node_aux.push(aux_states[next_aux..next_aux + n].to_vec());
            next_aux += n;
        }
        for i in 0..graph.nodes.len() {
            if let Some(source) = graph.nodes[i].backward_source {
                node_aux[i] = node_aux[source].clone();
            }
        }

        // Operators and their resources.
        let temp = TempSpace::new(context, engine);
        let mut operators = Vec::with_capacity(graph.nodes.len());
        let mut resources = Vec::with_capacity(graph.nodes.len());
        for node in &graph.nodes {
            match &node.op {
                Some(op) => {
                    operators.push(Some(op.create_operator(context)?));
                    resources.push(
                        op.forward_resource()
                            .into_iter()
                            .map(|r| match r {
                                ResourceRequest::TempSpace => Resource::TempSpace(temp.clone()),
                            })
                            .collect(),
                    );
                }
                None => {
                    operators.push(None);
                    resources.push(Vec::new());
                }
            }
        }

        log::debug!(
            "executor: bound {} nodes ({} forward, {} backward) on {}, {} unresolved entries",
            graph.nodes.len(),
            num_forward,
            graph.nodes.len() - num_forward,
            context,
            unresolved.len()
        );

        Ok(Executor {
            context,
            graph,
            num_forward,
            head_grad_nodes,
            operators,
            resources,
            entries,
            reqs,
            node_aux,
            args,
            arg_grads,
            grad_reqs,
            aux_states,
            unresolved,
            last_forward: None,
        })
    }

    /// Submit the forward phase.
    pub fn forward(&mut self, is_train: bool) -> Result<()> {
        if !self.unresolved.is_empty() {
            return Err(Error::IncompleteShapes(self.unresolved.join(", ")));
        }
        for (j, arg) in self.args.iter().enumerate() {
            if arg.is_none() {
                let name = &self.graph.nodes[self.graph.arg_nodes[j]].name;
                return Err(Error::NoneArray(format!("argument '{name}' is not bound")));
            }
        }
        self.run(0..self.num_forward, is_train)?;
        self.last_forward = Some(is_train);
        Ok(())
    }

    /// Submit the backward phase with one gradient per output.
    pub fn backward(&mut self, head_grads: &[Array]) -> Result<()> {
        let is_train = self.last_forward.ok_or(Error::NotForwarded)?;
        let heads = &self.graph.heads;
        if head_grads.len() != heads.len() {
            return Err(Error::HeadGradCount {
                expected: heads.len(),
                got: head_grads.len(),
            });
        }
        for (grad, h) in head_grads.iter().zip(heads) {
            let expected = self.entries[h.node][h.index].shape();
            if grad.shape() != expected {
                return Err(Error::ShapeMismatch {
                    expected: expected.clone(),
                    got: grad.shape().clone(),
                });
            }
        }
        if self.num_forward == self.graph.nodes.len() {
            return Ok(());
        }
        for (grad, &node) in head_grads.iter().zip(&self.head_grad_nodes) {
            let target = &self.entries[node][0];
            if !target.is_none() {
                target.copy_from(grad)?;
            }
        }
        self.run(self.num_forward..self.graph.nodes.len(), is_train)
    }

    fn run(&self, nodes: std::ops::Range<usize>, is_train: bool) -> Result<()> {
        for i in nodes {
            let Some(op) = &self.operators[i] else { continue };
            let node = &self.graph.nodes[i];
            let inputs: Vec<Array> = node
                .inputs
                .iter()
                .map(|e| self.entries[e.node][e.index].clone())
                .collect();
            let ctx = OpContext {
                is_train,
                requested: self.resources[i].clone(),
            };
            log::trace!("executor: submit {}", node.name);
            op.forward(&ctx, &inputs, &self.reqs[i], &self.entries[i], &self.node_aux[i])?;
        }
        Ok(())
    }

    // Accessors

    /// Output arrays. They share storage with the executor, so a later
    /// forward changes what they hold.
    pub fn outputs(&self) -> Vec<Array> {
        self.graph
            .heads
            .iter()
            .map(|h| self.entries[h.node][h.index].clone())
            .collect()
    }

    pub fn arg_arrays(&self) -> &[Array] {
        &self.args
    }

    pub fn grad_arrays(&self) -> &[Array] {
        &self.arg_grads
    }

    pub fn grad_reqs(&self) -> &[GradReq] {
        &self.grad_reqs
    }

    pub fn aux_arrays(&self) -> &[Array] {
        &self.aux_states
    }

    pub fn context(&self) -> Context {
        self.context
    }
}

fn check_len(what: &'static str, expected: usize, got: usize) -> Result<()> {
    if expected != got {
        return Err(Error::ArgumentCount { what, expected, got });
    }
    Ok(())
}

fn check_placement(array: &Array, context: Context, engine: &Engine) -> Result<()> {
    if array.is_none() {
        return Ok(());
    }
    if array.context() != context {
        return Err(Error::ContextMismatch {
            expected: context,
            got: array.context(),
        });
    }
    match array.engine() {
        Some(e) if !e.same(engine) => Err(Error::msg(
            "bound array belongs to a different engine",
        )),
        _ => Ok(()),
    }
}

/// Delayed array for an internal entry, or none-state if the shape is unknown.
fn allocate(
    shape: &Shape,
    name: &str,
    context: Context,
    engine: &Engine,
    unresolved: &mut Vec<String>,
) -> Array {
    if shape.is_known() {
        Array::new(shape.clone(), context, true, engine)
    } else {
        unresolved.push(format!("{name} {shape}"));
        Array::none()
    }
}

impl fmt::Display for Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Executor on {}: {} forward nodes, {} backward nodes",
            self.context,
            self.num_forward,
            self.graph.nodes.len() - self.num_forward
        )?;
        for (i, node) in self.graph.nodes.iter().enumerate() {
            let kind = node.op.as_ref().map_or("variable", |op| op.type_name());
            write!(f, "{i:>4}  {kind} {}", node.name)?;
            for (array, req) in self.entries[i].iter().zip(&self.reqs[i]) {
                write!(f, "  {}:{}", array.shape(), req)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executor")
            .field("context", &self.context)
            .field("nodes", &self.graph.nodes.len())
            .field("num_forward", &self.num_forward)
            .field("forwarded", &self.last_forward.is_some())
            .finish()
    }
}
