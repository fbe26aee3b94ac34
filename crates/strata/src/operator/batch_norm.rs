// BatchNorm — Batch normalization over the channel axis
//
// FORMULA:
//   x_hat = (x - mean) / sqrt(var + eps)
//   y     = gamma * x_hat + beta
//
// Data is [N, C, ...]; statistics are taken per channel over N and every
// trailing dimension. Training uses batch statistics and updates the moving
// averages held in the aux states:
//
//   moving = moving * momentum + batch * (1 - momentum)
//
// Inference uses the moving averages and leaves them untouched.
//
// BACKWARD:
//   Per-channel mean and 1/std are recomputed into temp space first. With
//   m elements per channel:
//     d_beta  = Σ g
//     d_gamma = Σ g · x_hat
//     d_x     = gamma / std · (g - d_beta/m - x_hat · d_gamma/m)   (training)
//     d_x     = gamma / std · g                                     (inference)

use strata_core::{bail, Array, Context, Error, Result, Shape};

use super::params::Kwargs;
use super::{
    launch, refine, OpContext, OpReq, Operator, OperatorProperty, ResourceRequest,
};

/// Property of the `BatchNorm` operator.
#[derive(Debug, Clone)]
pub struct BatchNorm {
    pub eps: f32,
    pub momentum: f32,
}

impl Default for BatchNorm {
    fn default() -> Self {
        BatchNorm {
            eps: 1e-5,
            momentum: 0.9,
        }
    }
}

impl OperatorProperty for BatchNorm {
    fn type_name(&self) -> &str {
        "BatchNorm"
    }

    fn init(&mut self, kwargs: &[(String, String)]) -> Result<()> {
        let kw = Kwargs::new("BatchNorm", kwargs, &["eps", "momentum"])?;
        let eps = kw.get::<f32>("eps")?.unwrap_or(self.eps);
        let momentum = kw.get::<f32>("momentum")?.unwrap_or(self.momentum);
        if eps <= 0.0 {
            return Err(kw.invalid("eps", &eps.to_string(), "must be positive"));
        }
        if !(0.0..=1.0).contains(&momentum) {
            return Err(kw.invalid("momentum", &momentum.to_string(), "must be in [0, 1]"));
        }
        self.eps = eps;
        self.momentum = momentum;
        Ok(())
    }

    fn params(&self) -> Vec<(String, String)> {
        vec![
            ("eps".into(), self.eps.to_string()),
            ("momentum".into(), self.momentum.to_string()),
        ]
    }

    fn list_arguments(&self) -> Vec<String> {
        vec!["data".into(), "gamma".into(), "beta".into()]
    }

    fn list_auxiliary_states(&self) -> Vec<String> {
        vec!["moving_mean".into(), "moving_var".into()]
    }

    fn infer_shape(
        &self,
        in_shapes: &mut [Shape],
        out_shapes: &mut [Shape],
        aux_shapes: &mut [Shape],
    ) -> Result<bool> {
        refine(&mut in_shapes[0], &out_shapes[0])?;
        refine(&mut out_shapes[0], &in_shapes[0])?;

        let data = &in_shapes[0];
        if data.ndim() == 1 {
            bail!("BatchNorm needs data with a channel axis, got {data}");
        }
        let channels = if data.ndim() >= 2 { data.dims()[1] } else { 0 };
        if channels != 0 {
            let c = Shape::from(channels);
            refine(&mut in_shapes[1], &c)?;
            refine(&mut in_shapes[2], &c)?;
            refine(&mut aux_shapes[0], &c)?;
            refine(&mut aux_shapes[1], &c)?;
        }
        Ok(in_shapes[0].is_known())
    }

    fn backward_resource(&self) -> Vec<ResourceRequest> {
        vec![ResourceRequest::TempSpace]
    }

    fn create_operator(&self, _ctx: Context) -> Result<Box<dyn Operator>> {
        Ok(Box::new(BatchNormOp {
            eps: self.eps,
            momentum: self.momentum,
        }))
    }

    fn copy(&self) -> Box<dyn OperatorProperty> {
        Box::new(self.clone())
    }
}

struct BatchNormOp {
    eps: f32,
    momentum: f32,
}

/// (batch, channels, spatial) of a [N, C, ...] shape.
fn layout(shape: &Shape) -> Result<(usize, usize, usize)> {
    match shape.dims() {
        [n, c, rest @ ..] => Ok((*n, *c, rest.iter().product())),
        _ => Err(Error::msg(format!(
            "BatchNorm needs data with a channel axis, got {shape}"
        ))),
    }
}

/// Per-channel mean and (biased) variance.
fn channel_stats(x: &[f32], (n, c, s): (usize, usize, usize)) -> (Vec<f32>, Vec<f32>) {
    let m = (n * s) as f32;
    let mut mean = vec![0.0f32; c];
    let mut var = vec![0.0f32; c];
    for b in 0..n {
        for ch in 0..c {
            let base = (b * c + ch) * s;
            mean[ch] += x[base..base + s].iter().sum::<f32>();
        }
    }
    mean.iter_mut().for_each(|v| *v /= m);
    for b in 0..n {
        for ch in 0..c {
            let base = (b * c + ch) * s;
            var[ch] += x[base..base + s]
                .iter()
                .map(|v| (v - mean[ch]).powi(2))
                .sum::<f32>();
        }
    }
    var.iter_mut().for_each(|v| *v /= m);
    (mean, var)
}

impl Operator for BatchNormOp {
    fn forward(
        &self,
        ctx: &OpContext,
        in_data: &[Array],
        req: &[OpReq],
        out_data: &[Array],
        aux: &[Array],
    ) -> Result<()> {
        let dims = layout(in_data[0].shape())?;
        let (n, c, s) = dims;
        let (eps, momentum, r) = (self.eps, self.momentum, req[0]);
        let (data, gamma, beta) = (&in_data[0], &in_data[1], &in_data[2]);
        let (moving_mean, moving_var) = (&aux[0], &aux[1]);

        if ctx.is_train {
            if r != OpReq::Null {
                launch(
                    "BatchNorm",
                    &[data, gamma, beta],
                    &[&out_data[0]],
                    &[r],
                    move |inp, out| {
                        let (x, g, b) = (inp[0], inp[1], inp[2]);
                        let (mean, var) = channel_stats(x, dims);
                        for i in 0..n * c * s {
                            let ch = (i / s) % c;
                            let x_hat = (x[i] - mean[ch]) / (var[ch] + eps).sqrt();
                            r.assign(&mut out[0][i], g[ch] * x_hat + b[ch]);
                        }
                        Ok(())
                    },
                )?;
            }
            launch(
                "BatchNorm.update_moving",
                &[data],
                &[moving_mean, moving_var],
                &[OpReq::Add, OpReq::Add],
                move |inp, out| {
                    let (mean, var) = channel_stats(inp[0], dims);
                    for ch in 0..c {
                        out[0][ch] = out[0][ch] * momentum + mean[ch] * (1.0 - momentum);
                        out[1][ch] = out[1][ch] * momentum + var[ch] * (1.0 - momentum);
                    }
                    Ok(())
                },
            )
        } else {
            if r == OpReq::Null {
                return Ok(());
            }
            launch(
                "BatchNorm.inference",
                &[data, gamma, beta, moving_mean, moving_var],
                &[&out_data[0]],
                &[r],
                move |inp, out| {
                    let (x, g, b, mm, mv) = (inp[0], inp[1], inp[2], inp[3], inp[4]);
                    for i in 0..n * c * s {
                        let ch = (i / s) % c;
                        let x_hat = (x[i] - mm[ch]) / (mv[ch] + eps).sqrt();
                        r.assign(&mut out[0][i], g[ch] * x_hat + b[ch]);
                    }
                    Ok(())
                },
            )
        }
    }

    fn backward(
        &self,
        ctx: &OpContext,
        out_grad: &[Array],
        in_data: &[Array],
        _out_data: &[Array],
        req: &[OpReq],
        in_grad: &[Array],
        aux: &[Array],
    ) -> Result<()> {
        let dims = layout(in_data[0].shape())?;
        let (n, c, s) = dims;
        let m = (n * s) as f32;
        let eps = self.eps;
        let is_train = ctx.is_train;
        let (grad, data, gamma) = (&out_grad[0], &in_data[0], &in_data[1]);

        // [mean | inv_std] per channel.
        let stats = ctx.temp_space()?.get(2 * c)?;
        launch(
            "BatchNorm.backward_stats",
            &[data, &aux[0], &aux[1]],
            &[&stats],
            &[OpReq::Write],
            move |inp, out| {
                let (mean, var) = if is_train {
                    channel_stats(inp[0], dims)
                } else {
                    (inp[1].to_vec(), inp[2].to_vec())
                };
                let (mean_out, inv_std_out) = out[0].split_at_mut(c);
                mean_out.copy_from_slice(&mean);
                for (o, v) in inv_std_out.iter_mut().zip(&var) {
                    *o = 1.0 / (v + eps).sqrt();
                }
                Ok(())
            },
        )?;

        // d_beta and d_gamma per channel.
        let sums = move |g: &[f32], x: &[f32], st: &[f32]| {
            let mut d_beta = vec![0.0f32; c];
            let mut d_gamma = vec![0.0f32; c];
            for i in 0..n * c * s {
                let ch = (i / s) % c;
                let x_hat = (x[i] - st[ch]) * st[c + ch];
                d_beta[ch] += g[i];
                d_gamma[ch] += g[i] * x_hat;
            }
            (d_beta, d_gamma)
        };

        let r = req[0];
        if r != OpReq::Null {
            launch(
                "BatchNorm.backward_data",
                &[grad, data, gamma, &stats],
                &[&in_grad[0]],
                &[r],
                move |inp, out| {
                    let (g, x, gm, st) = (inp[0], inp[1], inp[2], inp[3]);
                    let (d_beta, d_gamma) = sums(g, x, st);
                    for i in 0..n * c * s {
                        let ch = (i / s) % c;
                        let inv_std = st[c + ch];
                        let v = if is_train {
                            let x_hat = (x[i] - st[ch]) * inv_std;
                            gm[ch] * inv_std * (g[i] - d_beta[ch] / m - x_hat * d_gamma[ch] / m)
                        } else {
                            gm[ch] * inv_std * g[i]
                        };
                        r.assign(&mut out[0][i], v);
                    }
                    Ok(())
                },
            )?;
        }

        for (k, pick_gamma) in [(1usize, true), (2, false)] {
            let r = req[k];
            if r == OpReq::Null {
                continue;
            }
            launch(
                "BatchNorm.backward_affine",
                &[grad, data, &stats],
                &[&in_grad[k]],
                &[r],
                move |inp, out| {
                    let (d_beta, d_gamma) = sums(inp[0], inp[1], inp[2]);
                    let src = if pick_gamma { d_gamma } else { d_beta };
                    for (o, v) in out[0].iter_mut().zip(src) {
                        r.assign(o, v);
                    }
                    Ok(())
                },
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operator::{Resource, TempSpace};
    use strata_core::Engine;

    #[test]
    fn test_infer_channels() {
        let p = BatchNorm::default();
        let mut ins = vec![Shape::from((4, 3, 2)), Shape::none(), Shape::none()];
        let mut outs = vec![Shape::none()];
        let mut aux = vec![Shape::none(), Shape::none()];
        assert!(p.infer_shape(&mut ins, &mut outs, &mut aux).unwrap());
        assert_eq!(ins[1], Shape::from(3));
        assert_eq!(aux[1], Shape::from(3));
        assert_eq!(outs[0], Shape::from((4, 3, 2)));
    }

    #[test]
    fn test_channel_stats() {
        // n=2, c=1, s=2
        let (mean, var) = channel_stats(&[1.0, 3.0, 5.0, 7.0], (2, 1, 2));
        assert_eq!(mean, vec![4.0]);
        assert_eq!(var, vec![5.0]);
    }

    #[test]
    fn test_training_normalizes_and_updates_moving_stats() {
        let engine = Engine::synchronous().unwrap();
        let p = BatchNorm {
            eps: 1e-5,
            momentum: 0.5,
        };
        let op = p.create_operator(Context::cpu()).unwrap();
        let x = Array::from_vec(vec![1.0, 2.0, 3.0, 4.0], (2, 2), &engine).unwrap();
        let gamma = Array::from_vec(vec![1.0, 1.0], 2, &engine).unwrap();
        let beta = Array::from_vec(vec![0.0, 0.0], 2, &engine).unwrap();
        let mm = Array::from_vec(vec![0.0, 0.0], 2, &engine).unwrap();
        let mv = Array::from_vec(vec![1.0, 1.0], 2, &engine).unwrap();
        let y = Array::new((2, 2), Context::cpu(), false, &engine);
        let ctx = OpContext {
            is_train: true,
            requested: vec![Resource::TempSpace(TempSpace::new(Context::cpu(), &engine))],
        };
        op.forward(
            &ctx,
            &[x, gamma, beta],
            &[OpReq::Write],
            &[y.clone()],
            &[mm.clone(), mv.clone()],
        )
        .unwrap();
        let y = y.to_vec().unwrap();
        assert!((y[0] + 1.0).abs() < 1e-3 && (y[2] - 1.0).abs() < 1e-3);
        // batch mean [2, 3], var [1, 1]
        assert_eq!(mm.to_vec().unwrap(), vec![1.0, 1.5]);
        assert_eq!(mv.to_vec().unwrap(), vec![1.0, 1.0]);
    }
}
