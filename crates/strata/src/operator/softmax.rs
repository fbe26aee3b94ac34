// Softmax — Softmax output layer with integrated cross-entropy gradient
//
// Forward normalizes each row of data[N, K] (trailing dims flattened):
//   y[n, k] = exp(x[n, k] - max) / Σ_j exp(x[n, j] - max)
//
// Backward ignores the incoming head gradient and emits the gradient of the
// cross-entropy loss against the class indices in `label[N]`:
//   d_data[n, k] = grad_scale · (y[n, k] - [k == label[n]])
// The label gets a zero gradient.

use strata_core::{bail, Array, Context, Result, Shape};

use super::params::Kwargs;
use super::{launch, refine, OpContext, OpReq, Operator, OperatorProperty};

/// Property of the `Softmax` operator.
#[derive(Debug, Clone)]
pub struct Softmax {
    pub grad_scale: f32,
}

impl Default for Softmax {
    fn default() -> Self {
        Softmax { grad_scale: 1.0 }
    }
}

impl OperatorProperty for Softmax {
    fn type_name(&self) -> &str {
        "Softmax"
    }

    fn init(&mut self, kwargs: &[(String, String)]) -> Result<()> {
        let kw = Kwargs::new("Softmax", kwargs, &["grad_scale"])?;
        self.grad_scale = kw.get("grad_scale")?.unwrap_or(1.0);
        Ok(())
    }

    fn params(&self) -> Vec<(String, String)> {
        vec![("grad_scale".into(), self.grad_scale.to_string())]
    }

    fn list_arguments(&self) -> Vec<String> {
        vec!["data".into(), "label".into()]
    }

    fn infer_shape(
        &self,
        in_shapes: &mut [Shape],
        out_shapes: &mut [Shape],
        _aux_shapes: &mut [Shape],
    ) -> Result<bool> {
        refine(&mut in_shapes[0], &out_shapes[0])?;
        refine(&mut out_shapes[0], &in_shapes[0])?;
        if let Some(&n) = in_shapes[0].dims().first() {
            refine(&mut in_shapes[1], &Shape::from(n))?;
        }
        Ok(in_shapes[0].is_known() && in_shapes[1].is_known())
    }

    fn create_operator(&self, _ctx: Context) -> Result<Box<dyn Operator>> {
        Ok(Box::new(SoftmaxOp {
            grad_scale: self.grad_scale,
        }))
    }

    fn copy(&self) -> Box<dyn OperatorProperty> {
        Box::new(self.clone())
    }
}

struct SoftmaxOp {
    grad_scale: f32,
}

impl Operator for SoftmaxOp {
    fn forward(
        &self,
        _ctx: &OpContext,
        in_data: &[Array],
        req: &[OpReq],
        out_data: &[Array],
        _aux: &[Array],
    ) -> Result<()> {
        let r = req[0];
        if r == OpReq::Null {
            return Ok(());
        }
        let (n, k) = in_data[0].shape().flat_2d();
        launch("Softmax", &[&in_data[0]], &[&out_data[0]], &[r], move |inp, out| {
            let x = inp[0];
            for i in 0..n {
                let row = &x[i * k..(i + 1) * k];
                let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                let denom: f32 = row.iter().map(|v| (v - max).exp()).sum();
                for (j, &v) in row.iter().enumerate() {
                    r.assign(&mut out[0][i * k + j], (v - max).exp() / denom);
                }
            }
            Ok(())
        })
    }

    fn backward(
        &self,
        _ctx: &OpContext,
        _out_grad: &[Array],
        in_data: &[Array],
        out_data: &[Array],
        req: &[OpReq],
        in_grad: &[Array],
        _aux: &[Array],
    ) -> Result<()> {
        let (n, k) = in_data[0].shape().flat_2d();
        let scale = self.grad_scale;

        let r = req[0];
        if r != OpReq::Null {
            launch(
                "Softmax.backward",
                &[&out_data[0], &in_data[1]],
                &[&in_grad[0]],
                &[r],
                move |inp, out| {
                    let (y, label) = (inp[0], inp[1]);
                    for i in 0..n {
                        let target = label[i];
                        if target < 0.0 || target as usize >= k || target.fract() != 0.0 {
                            bail!("label {target} out of range for {k} classes");
                        }
                        let target = target as usize;
                        for j in 0..k {
                            let hot = if j == target { 1.0 } else { 0.0 };
                            r.assign(&mut out[0][i * k + j], scale * (y[i * k + j] - hot));
                        }
                    }
                    Ok(())
                },
            )?;
        }

        if req[1] == OpReq::Write {
            launch("Softmax.backward_label", &[], &[&in_grad[1]], &[OpReq::Write], |_, out| {
                out[0].fill(0.0);
                Ok(())
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::Engine;

    #[test]
    fn test_infer_label() {
        let p = Softmax::default();
        let mut ins = vec![Shape::from((5, 3)), Shape::none()];
        let mut outs = vec![Shape::none()];
        assert!(p.infer_shape(&mut ins, &mut outs, &mut []).unwrap());
        assert_eq!(ins[1], Shape::from(5));
        assert_eq!(outs[0], Shape::from((5, 3)));
    }

    #[test]
    fn test_rows_sum_to_one_and_gradient() {
        let engine = Engine::synchronous().unwrap();
        let op = Softmax::default().create_operator(Context::cpu()).unwrap();
        let x = Array::from_vec(vec![1.0, 2.0, 3.0, 0.0, 0.0, 0.0], (2, 3), &engine).unwrap();
        let label = Array::from_vec(vec![2.0, 0.0], 2, &engine).unwrap();
        let y = Array::new((2, 3), Context::cpu(), false, &engine);
        let ctx = OpContext::default();
        op.forward(&ctx, &[x.clone(), label.clone()], &[OpReq::Write], &[y.clone()], &[])
            .unwrap();
        let probs = y.to_vec().unwrap();
        assert!((probs[0..3].iter().sum::<f32>() - 1.0).abs() < 1e-5);
        assert!((probs[3] - 1.0 / 3.0).abs() < 1e-5);

        let dx = Array::new((2, 3), Context::cpu(), false, &engine);
        op.backward(
            &ctx,
            &[Array::none()],
            &[x, label],
            &[y],
            &[OpReq::Write, OpReq::Null],
            &[dx.clone(), Array::none()],
            &[],
        )
        .unwrap();
        let g = dx.to_vec().unwrap();
        assert!((g[2] - (probs[2] - 1.0)).abs() < 1e-6);
        assert!((g[3] - (probs[3] - 1.0)).abs() < 1e-6);
        assert!(g.iter().sum::<f32>().abs() < 1e-5);
    }
}
