// Ops — Submitting kernels against array storage
//
// `launch` is the one way kernels touch array data. It derives the engine
// read/write sets from the arrays it is given and submits a closure that, once
// scheduled, locks each chunk and hands the kernel plain slices:
//
//   kernel(&[&[f32]], &mut [&mut [f32]])
//
// Each slice covers exactly the array's view (offset + shape size) of its chunk.
// An input that lives in the same chunk as an output is copied out before the
// kernel runs, so `a = a + b` reads the old value of `a`. Two outputs may not
// share a chunk.
//
// A kernel that also reads what it writes (accumulation, running averages)
// goes through `launch_updating` so the engine sees those outputs as read.

use std::ops::Range;
use std::sync::{Arc, RwLockReadGuard};

use crate::array::{Array, Chunk};
use crate::engine::Var;
use crate::bail;
use crate::error::{Error, Result};

/// Elementwise binary operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl BinaryOp {
    pub fn name(self) -> &'static str {
        match self {
            BinaryOp::Add => "add",
            BinaryOp::Sub => "sub",
            BinaryOp::Mul => "mul",
            BinaryOp::Div => "div",
        }
    }

    #[inline]
    pub fn apply(self, a: f32, b: f32) -> f32 {
        match self {
            BinaryOp::Add => a + b,
            BinaryOp::Sub => a - b,
            BinaryOp::Mul => a * b,
            BinaryOp::Div => a / b,
        }
    }
}

/// Array-scalar operation. `Rsub`/`Rdiv` put the scalar on the left.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarOp {
    Add,
    Sub,
    Rsub,
    Mul,
    Div,
    Rdiv,
}

impl ScalarOp {
    pub fn name(self) -> &'static str {
        match self {
            ScalarOp::Add => "add_scalar",
            ScalarOp::Sub => "sub_scalar",
            ScalarOp::Rsub => "rsub_scalar",
            ScalarOp::Mul => "mul_scalar",
            ScalarOp::Div => "div_scalar",
            ScalarOp::Rdiv => "rdiv_scalar",
        }
    }

    #[inline]
    pub fn apply(self, a: f32, s: f32) -> f32 {
        match self {
            ScalarOp::Add => a + s,
            ScalarOp::Sub => a - s,
            ScalarOp::Rsub => s - a,
            ScalarOp::Mul => a * s,
            ScalarOp::Div => a / s,
            ScalarOp::Rdiv => s / a,
        }
    }
}

/// Where a kernel input is read from.
enum Slot {
    /// Index into the read guards.
    Guard(usize),
    /// Copy of an input that shares a chunk with an output.
    Snapshot(Vec<f32>),
}

type Binding = (Arc<Chunk>, Range<usize>);

fn bind(what: &str, array: &Array) -> Result<Binding> {
    let chunk = array
        .chunk()
        .ok_or_else(|| Error::NoneArray(format!("{what} of a kernel")))?;
    Ok((Arc::clone(chunk), array.storage_range()))
}

/// Submit `kernel` to the engine shared by `inputs` and `outputs`.
///
/// Returns once the kernel is queued. Errors returned by the kernel surface
/// through the next wait on any output.
pub fn launch<F>(name: &str, inputs: &[&Array], outputs: &[&Array], kernel: F) -> Result<()>
where
    F: FnOnce(&[&[f32]], &mut [&mut [f32]]) -> Result<()> + Send + 'static,
{
    launch_updating(name, inputs, outputs, &[], kernel)
}

/// `launch` for kernels that read the current value of some outputs.
///
/// `updated[i]` marks output `i` as read-modify-write; missing entries count
/// as plain writes. A failure recorded on an updated output is inherited
/// instead of being overwritten.
pub fn launch_updating<F>(
    name: &str,
    inputs: &[&Array],
    outputs: &[&Array],
    updated: &[bool],
    kernel: F,
) -> Result<()>
where
    F: FnOnce(&[&[f32]], &mut [&mut [f32]]) -> Result<()> + Send + 'static,
{
    let inputs: Vec<Binding> = inputs.iter().map(|a| bind("input", a)).collect::<Result<_>>()?;
    let outputs: Vec<Binding> = outputs.iter().map(|a| bind("output", a)).collect::<Result<_>>()?;

    let engine = match outputs.first().or(inputs.first()) {
        Some((chunk, _)) => chunk.engine().clone(),
        None => bail!("kernel '{name}' has no arrays"),
    };
    for (chunk, _) in inputs.iter().chain(&outputs) {
        if !chunk.engine().same(&engine) {
            bail!("kernel '{name}' mixes arrays from different engines");
        }
    }
    for (i, (a, _)) in outputs.iter().enumerate() {
        if outputs[..i].iter().any(|(b, _)| Arc::ptr_eq(a, b)) {
            bail!("kernel '{name}' writes the same storage through two outputs");
        }
    }

    let reads: Vec<Var> = inputs
        .iter()
        .map(|(c, _)| c.var())
        .chain(
            outputs
                .iter()
                .zip(updated)
                .filter(|(_, u)| **u)
                .map(|((c, _), _)| c.var()),
        )
        .collect();
    let writes: Vec<Var> = outputs.iter().map(|(c, _)| c.var()).collect();
    let op_name = name.to_string();

    engine.push(name, &reads, &writes, move || {
        let mut out_guards = outputs
            .iter()
            .map(|(chunk, _)| chunk.write())
            .collect::<Result<Vec<_>>>()?;

        // One read guard per distinct chunk that is only read.
        let mut read_guards: Vec<(&Arc<Chunk>, RwLockReadGuard<'_, Vec<f32>>)> = Vec::new();
        let mut slots = Vec::with_capacity(inputs.len());
        for (chunk, range) in &inputs {
            if let Some(k) = outputs.iter().position(|(o, _)| Arc::ptr_eq(o, chunk)) {
                slots.push(Slot::Snapshot(out_guards[k][range.clone()].to_vec()));
            } else if let Some(g) = read_guards.iter().position(|(c, _)| Arc::ptr_eq(c, chunk)) {
                slots.push(Slot::Guard(g));
            } else {
                read_guards.push((chunk, chunk.read()?));
                slots.push(Slot::Guard(read_guards.len() - 1));
            }
        }
        let in_slices: Vec<&[f32]> = slots
            .iter()
            .zip(&inputs)
            .map(|(slot, (_, range))| match slot {
                Slot::Guard(g) => &read_guards[*g].1[range.clone()],
                Slot::Snapshot(data) => data.as_slice(),
            })
            .collect();
        let mut out_slices: Vec<&mut [f32]> = out_guards
            .iter_mut()
            .zip(&outputs)
            .map(|(guard, (_, range))| &mut guard[range.clone()])
            .collect();

        kernel(&in_slices, &mut out_slices).map_err(|e| match e {
            e @ Error::OperationFailed { .. } => e,
            other => Error::op_failed(op_name, other.to_string()),
        })
    })
}
