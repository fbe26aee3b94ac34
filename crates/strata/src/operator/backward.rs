// BackwardProperty — Gradient of another operator, as a graph operation
//
// A backward node takes
//
//   inputs  = out_grad[0..O] ++ in_data[0..A] ++ out_data[0..O]
//   outputs = one gradient per forward argument
//
// and runs the forward operator's `backward` kernel. It owns no aux states:
// the executor hands it the aux arrays of the forward node it differentiates.

use std::sync::Arc;

use strata_core::{Array, Context, Error, Result, Shape};

use super::{refine, OpContext, OpReq, Operator, OperatorProperty, ResourceRequest};

/// Property evaluating the gradient of a wrapped forward property.
#[derive(Debug, Clone)]
pub struct BackwardProperty {
    forward: Arc<dyn OperatorProperty>,
}

impl BackwardProperty {
    pub fn new(forward: Arc<dyn OperatorProperty>) -> Self {
        BackwardProperty { forward }
    }

    /// The property being differentiated.
    pub fn forward(&self) -> &Arc<dyn OperatorProperty> {
        &self.forward
    }

    fn counts(&self) -> (usize, usize) {
        (
            self.forward.list_outputs().len(),
            self.forward.list_arguments().len(),
        )
    }
}

impl OperatorProperty for BackwardProperty {
    fn type_name(&self) -> &str {
        "_backward"
    }

    fn init(&mut self, kwargs: &[(String, String)]) -> Result<()> {
        if kwargs.is_empty() {
            Ok(())
        } else {
            Err(Error::msg("backward operators take no parameters"))
        }
    }

    fn params(&self) -> Vec<(String, String)> {
        vec![("forward".into(), self.forward.type_name().to_string())]
    }

    fn list_arguments(&self) -> Vec<String> {
        let outputs = self.forward.list_outputs();
        let mut args: Vec<String> = outputs.iter().map(|o| format!("{o}_grad")).collect();
        args.extend(self.forward.list_arguments());
        args.extend(outputs);
        args
    }

    fn list_outputs(&self) -> Vec<String> {
        self.forward
            .list_arguments()
            .into_iter()
            .map(|a| format!("{a}_grad"))
            .collect()
    }

    fn infer_shape(
        &self,
        in_shapes: &mut [Shape],
        out_shapes: &mut [Shape],
        _aux_shapes: &mut [Shape],
    ) -> Result<bool> {
        let (num_out, num_args) = self.counts();
        let (out_grads, rest) = in_shapes.split_at_mut(num_out);
        let (in_data, out_data) = rest.split_at_mut(num_args);

        for (g, y) in out_grads.iter_mut().zip(out_data.iter_mut()) {
            refine(g, y)?;
            refine(y, g)?;
        }
        for (dx, x) in out_shapes.iter_mut().zip(in_data.iter_mut()) {
            refine(dx, x)?;
            refine(x, dx)?;
        }
        Ok(out_shapes.iter().all(Shape::is_known))
    }

    fn forward_resource(&self) -> Vec<ResourceRequest> {
        self.forward.backward_resource()
    }

    fn backward_property(&self) -> Result<Box<dyn OperatorProperty>> {
        Err(Error::msg(format!(
            "higher-order gradients are not supported ({} backward)",
            self.forward.type_name()
        )))
    }

    fn create_operator(&self, ctx: Context) -> Result<Box<dyn Operator>> {
        let (num_out, num_args) = self.counts();
        Ok(Box::new(BackwardOp {
            inner: self.forward.create_operator(ctx)?,
            num_out,
            num_args,
        }))
    }

    fn copy(&self) -> Box<dyn OperatorProperty> {
        Box::new(BackwardProperty::new(Arc::from(self.forward.copy())))
    }
}

struct BackwardOp {
    inner: Box<dyn Operator>,
    num_out: usize,
    num_args: usize,
}

impl Operator for BackwardOp {
    fn forward(
        &self,
        ctx: &OpContext,
        in_data: &[Array],
        req: &[OpReq],
        out_data: &[Array],
        aux: &[Array],
    ) -> Result<()> {
        super::check_count(
            "backward node inputs",
            2 * self.num_out + self.num_args,
            in_data.len(),
        )?;
        let (out_grad, rest) = in_data.split_at(self.num_out);
        let (fwd_in, fwd_out) = rest.split_at(self.num_args);
        self.inner
            .backward(ctx, out_grad, fwd_in, fwd_out, req, out_data, aux)
    }

    fn backward(
        &self,
        _ctx: &OpContext,
        _out_grad: &[Array],
        _in_data: &[Array],
        _out_data: &[Array],
        _req: &[OpReq],
        _in_grad: &[Array],
        _aux: &[Array],
    ) -> Result<()> {
        Err(Error::msg("higher-order gradients are not supported"))
    }
}
