// Operator — Graph operation descriptors and their runtime kernels
//
// Two traits split an operation into what the graph needs and what the
// executor runs:
//
//   OperatorProperty — parameters, argument/output/aux names, shape inference,
//                      resource requests, gradient property. Held by graph nodes.
//   Operator         — forward/backward kernels for one binding, created by
//                      `OperatorProperty::create_operator` at bind time.
//
// Kernels never touch array data directly: they go through `launch` below,
// so the dependency engine orders them. An output requested with Add is
// declared as read too.
//
// WRITE REQUESTS:
//
//   Every output comes with an OpReq:
//     Null  — nobody needs it; the array may be none-state, skip it
//     Write — overwrite
//     Add   — accumulate into the existing value

use std::fmt;
use std::sync::{Arc, Mutex};

use strata_core::{ops, Array, Context, Engine, Error, Result, Shape};

mod activation;
mod backward;
mod batch_norm;
mod elementwise;
mod fully_connected;
mod params;
mod softmax;
mod sum;

pub use activation::{ActType, Activation};
pub use backward::BackwardProperty;
pub use batch_norm::BatchNorm;
pub use elementwise::{ElementWiseBinary, ElementWiseKind};
pub use fully_connected::FullyConnected;
pub use softmax::Softmax;
pub use sum::{ElementWiseSum, ZerosLike};

/// How an operator writes one of its outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OpReq {
    /// Do not compute.
    #[default]
    Null,
    /// Overwrite.
    Write,
    /// Accumulate.
    Add,
}

/// Gradient request kind of a bound argument: none / write / accumulate.
pub type GradReq = OpReq;

impl OpReq {
    /// Store `value` into `dst` according to the request.
    #[inline]
    pub fn assign(self, dst: &mut f32, value: f32) {
        match self {
            OpReq::Null => {}
            OpReq::Write => *dst = value,
            OpReq::Add => *dst += value,
        }
    }
}

impl fmt::Display for OpReq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpReq::Null => write!(f, "null"),
            OpReq::Write => write!(f, "write"),
            OpReq::Add => write!(f, "add"),
        }
    }
}

/// Extra resources an operator asks the executor for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceRequest {
    /// Scratch memory shared by every node of a binding.
    TempSpace,
}

/// Executor-wide scratch memory.
///
/// Every `get` hands out a view of the same storage, so kernels using it are
/// serialized by the engine.
#[derive(Clone)]
pub struct TempSpace {
    buffer: Arc<Mutex<Array>>,
    context: Context,
    engine: Engine,
}

impl TempSpace {
    pub fn new(context: Context, engine: &Engine) -> Self {
        TempSpace {
            buffer: Arc::new(Mutex::new(Array::none())),
            context,
            engine: engine.clone(),
        }
    }

    /// A scratch array of `shape`, growing the buffer if needed.
    pub fn get(&self, shape: impl Into<Shape>) -> Result<Array> {
        let shape = shape.into();
        let mut buffer = self
            .buffer
            .lock()
            .map_err(|_| Error::msg("temp space lock poisoned"))?;
        if buffer.size() < shape.size() {
            log::trace!("temp space: growing to {} elements", shape.size());
            *buffer = Array::new(shape.size(), self.context, true, &self.engine);
        }
        buffer.slice(0, shape.size())?.reshape(shape)
    }
}

impl fmt::Debug for TempSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TempSpace({})", self.context)
    }
}

/// A granted resource.
#[derive(Debug, Clone)]
pub enum Resource {
    TempSpace(TempSpace),
}

/// Per-call context handed to kernels.
#[derive(Debug, Clone, Default)]
pub struct OpContext {
    pub is_train: bool,
    /// Resources in the order of the operator's request list.
    pub requested: Vec<Resource>,
}

impl OpContext {
    pub fn temp_space(&self) -> Result<&TempSpace> {
        self.requested
            .iter()
            .map(|Resource::TempSpace(t)| t)
            .next()
            .ok_or_else(|| Error::msg("operator did not request temp space"))
    }
}

/// Descriptor of one graph operation.
pub trait OperatorProperty: Send + Sync + fmt::Debug {
    /// Registered type name, e.g. `"FullyConnected"`.
    fn type_name(&self) -> &str;

    /// Set parameters from string key/value pairs.
    fn init(&mut self, kwargs: &[(String, String)]) -> Result<()>;

    /// Current parameters, for printing.
    fn params(&self) -> Vec<(String, String)> {
        Vec::new()
    }

    fn list_arguments(&self) -> Vec<String> {
        vec!["data".to_string()]
    }

    fn list_outputs(&self) -> Vec<String> {
        vec!["output".to_string()]
    }

    fn list_auxiliary_states(&self) -> Vec<String> {
        Vec::new()
    }

    /// Refine the shapes in place, in either direction.
    ///
    /// The slices are sized to the argument, output and aux lists. Returns
    /// false when not enough is known yet; contradictions are errors.
    fn infer_shape(
        &self,
        in_shapes: &mut [Shape],
        out_shapes: &mut [Shape],
        aux_shapes: &mut [Shape],
    ) -> Result<bool>;

    fn forward_resource(&self) -> Vec<ResourceRequest> {
        Vec::new()
    }

    fn backward_resource(&self) -> Vec<ResourceRequest> {
        Vec::new()
    }

    /// Property computing the gradient of this one.
    fn backward_property(&self) -> Result<Box<dyn OperatorProperty>> {
        Ok(Box::new(BackwardProperty::new(Arc::from(self.copy()))))
    }

    fn create_operator(&self, ctx: Context) -> Result<Box<dyn Operator>>;

    fn copy(&self) -> Box<dyn OperatorProperty>;
}

/// Kernels of one bound operation.
pub trait Operator: Send + Sync {
    fn forward(
        &self,
        ctx: &OpContext,
        in_data: &[Array],
        req: &[OpReq],
        out_data: &[Array],
        aux: &[Array],
    ) -> Result<()>;

    /// `req` and `in_grad` line up with the arguments.
    #[allow(clippy::too_many_arguments)]
    fn backward(
        &self,
        ctx: &OpContext,
        out_grad: &[Array],
        in_data: &[Array],
        out_data: &[Array],
        req: &[OpReq],
        in_grad: &[Array],
        aux: &[Array],
    ) -> Result<()>;
}

/// Check the counts an operator was called with.
pub(crate) fn check_count(what: &'static str, expected: usize, got: usize) -> Result<()> {
    if expected != got {
        return Err(Error::ArgumentCount { what, expected, got });
    }
    Ok(())
}

/// Submit a kernel writing `outputs[i]` under `reqs[i]`.
pub(crate) fn launch<F>(
    name: &str,
    inputs: &[&Array],
    outputs: &[&Array],
    reqs: &[OpReq],
    kernel: F,
) -> Result<()>
where
    F: FnOnce(&[&[f32]], &mut [&mut [f32]]) -> Result<()> + Send + 'static,
{
    let updated: Vec<bool> = reqs.iter().map(|&r| r == OpReq::Add).collect();
    ops::launch_updating(name, inputs, outputs, &updated, kernel)
}

/// Merge `shape` into `slot`, ignoring the result flag.
pub(crate) fn refine(slot: &mut Shape, shape: &Shape) -> Result<()> {
    slot.refine(shape).map(|_| ())
}

/// Make every shape in `shapes` agree.
pub(crate) fn unify(shapes: &mut [&mut Shape]) -> Result<bool> {
    let mut merged = Shape::none();
    for s in shapes.iter() {
        merged.refine(s)?;
    }
    for s in shapes.iter_mut() {
        s.refine(&merged)?;
    }
    Ok(merged.is_known())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assign_honours_request() {
        let mut v = 1.0;
        OpReq::Null.assign(&mut v, 5.0);
        assert_eq!(v, 1.0);
        OpReq::Add.assign(&mut v, 5.0);
        assert_eq!(v, 6.0);
        OpReq::Write.assign(&mut v, 2.0);
        assert_eq!(v, 2.0);
    }

    #[test]
    fn test_unify() {
        let mut a = Shape::from((2, 0));
        let mut b = Shape::none();
        let mut c = Shape::from((0, 3));
        assert!(unify(&mut [&mut a, &mut b, &mut c]).unwrap());
        assert_eq!(b, Shape::from((2, 3)));
        let mut d = Shape::from(4);
        assert!(unify(&mut [&mut a, &mut d]).is_err());
    }

    #[test]
    fn test_temp_space_grows() {
        let engine = Engine::synchronous().unwrap();
        let temp = TempSpace::new(Context::cpu(), &engine);
        let small = temp.get(4).unwrap();
        let big = temp.get((2, 8)).unwrap();
        assert_eq!(big.shape(), &Shape::from((2, 8)));
        assert!(!small.shares_storage(&big));
        let again = temp.get(3).unwrap();
        assert!(again.shares_storage(&big));
    }

    #[test]
    fn test_accumulating_kernel_keeps_failure() {
        let engine = Engine::synchronous().unwrap();
        let grad = Array::from_vec(vec![1.0, 1.0], 2, &engine).unwrap();
        let src = Array::from_vec(vec![0.5, 0.5], 2, &engine).unwrap();
        let var = grad.var().unwrap();
        engine
            .push("bad grad", &[], &[var], || Err(Error::msg("overflow")))
            .unwrap();

        launch("accumulate", &[&src], &[&grad], &[OpReq::Add], |inp, out| {
            for (o, &v) in out[0].iter_mut().zip(inp[0]) {
                OpReq::Add.assign(o, v);
            }
            Ok(())
        })
        .unwrap();
        assert!(matches!(
            grad.wait_to_read(),
            Err(Error::OperationFailed { ref op, .. }) if op == "bad grad"
        ));

        launch("overwrite", &[&src], &[&grad], &[OpReq::Write], |inp, out| {
            out[0].copy_from_slice(inp[0]);
            Ok(())
        })
        .unwrap();
        assert_eq!(grad.to_vec().unwrap(), vec![0.5, 0.5]);
    }
}
