// FullyConnected — Affine layer
//
//   output[N, H] = data[N, K] · weight[H, K]ᵀ + bias[H]
//
// Inputs with more than two dimensions are flattened to [N, K] with
// K = product of the trailing dimensions. Shape inference runs both ways: the
// weight and bias shapes follow from the data shape, and the batch size of
// the data follows from a known output.
//
// BACKWARD:
//   d_data[N, K]   = grad[N, H] · weight[H, K]
//   d_weight[H, K] = grad[N, H]ᵀ · data[N, K]
//   d_bias[H]      = Σ_n grad[n, :]

use strata_core::{Array, Context, Result, Shape};

use super::params::Kwargs;
use super::{check_count, launch, refine, OpContext, OpReq, Operator, OperatorProperty};

/// Property of the `FullyConnected` operator.
#[derive(Debug, Clone, Default)]
pub struct FullyConnected {
    pub num_hidden: usize,
    pub no_bias: bool,
}

impl OperatorProperty for FullyConnected {
    fn type_name(&self) -> &str {
        "FullyConnected"
    }

    fn init(&mut self, kwargs: &[(String, String)]) -> Result<()> {
        let kw = Kwargs::new("FullyConnected", kwargs, &["num_hidden", "no_bias"])?;
        let num_hidden: usize = kw.required("num_hidden")?;
        if num_hidden == 0 {
            return Err(kw.invalid("num_hidden", "0", "must be positive"));
        }
        self.num_hidden = num_hidden;
        self.no_bias = kw.get_bool("no_bias")?.unwrap_or(false);
        Ok(())
    }

    fn params(&self) -> Vec<(String, String)> {
        vec![
            ("num_hidden".into(), self.num_hidden.to_string()),
            ("no_bias".into(), self.no_bias.to_string()),
        ]
    }

    fn list_arguments(&self) -> Vec<String> {
        let mut args = vec!["data".to_string(), "weight".to_string()];
        if !self.no_bias {
            args.push("bias".to_string());
        }
        args
    }

    fn infer_shape(
        &self,
        in_shapes: &mut [Shape],
        out_shapes: &mut [Shape],
        _aux_shapes: &mut [Shape],
    ) -> Result<bool> {
        let h = self.num_hidden;
        let data = in_shapes[0].clone();

        // Unknown stays 0.
        let (n, k) = match data.dims().split_first() {
            None => (0, 0),
            Some((&n, rest)) if rest.contains(&0) => (n, 0),
            Some((&n, rest)) => (n, rest.iter().product()),
        };

        refine(&mut in_shapes[1], &Shape::from((h, k)))?;
        if !self.no_bias {
            refine(&mut in_shapes[2], &Shape::from(h))?;
        }
        refine(&mut out_shapes[0], &Shape::from((n, h)))?;

        // Batch size flows back from the output.
        if data.ndim() > 0 && n == 0 {
            let rows = out_shapes[0].dims()[0];
            if rows != 0 {
                let mut dims = data.dims().to_vec();
                dims[0] = rows;
                refine(&mut in_shapes[0], &Shape::new(dims))?;
            }
        }
        // A 2-D data shape can take K from a known weight.
        if data.ndim() == 2 && k == 0 {
            let w = in_shapes[1].dims()[1];
            if w != 0 {
                refine(&mut in_shapes[0], &Shape::from((data.dims()[0], w)))?;
            }
        }

        Ok(in_shapes.iter().all(Shape::is_known) && out_shapes[0].is_known())
    }

    fn create_operator(&self, _ctx: Context) -> Result<Box<dyn Operator>> {
        Ok(Box::new(FullyConnectedOp {
            num_hidden: self.num_hidden,
            no_bias: self.no_bias,
        }))
    }

    fn copy(&self) -> Box<dyn OperatorProperty> {
        Box::new(self.clone())
    }
}

struct FullyConnectedOp {
    num_hidden: usize,
    no_bias: bool,
}

impl FullyConnectedOp {
    fn num_args(&self) -> usize {
        if self.no_bias {
            2
        } else {
            3
        }
    }
}

impl Operator for FullyConnectedOp {
    fn forward(
        &self,
        _ctx: &OpContext,
        in_data: &[Array],
        req: &[OpReq],
        out_data: &[Array],
        _aux: &[Array],
    ) -> Result<()> {
        check_count("FullyConnected inputs", self.num_args(), in_data.len())?;
        let r = req[0];
        if r == OpReq::Null {
            return Ok(());
        }
        let (n, k) = in_data[0].shape().flat_2d();
        let h = self.num_hidden;
        let inputs: Vec<&Array> = in_data.iter().collect();

        launch("FullyConnected", &inputs, &[&out_data[0]], &[r], move |inp, out| {
            let (x, w) = (inp[0], inp[1]);
            let bias = inp.get(2).copied();
            let y = &mut out[0];
            for i in 0..n {
                let row = &x[i * k..(i + 1) * k];
                for j in 0..h {
                    let wrow = &w[j * k..(j + 1) * k];
                    let mut acc = bias.map_or(0.0, |b| b[j]);
                    for (a, b) in row.iter().zip(wrow) {
                        acc += a * b;
                    }
                    r.assign(&mut y[i * h + j], acc);
                }
            }
            Ok(())
        })
    }

    fn backward(
        &self,
        _ctx: &OpContext,
        out_grad: &[Array],
        in_data: &[Array],
        _out_data: &[Array],
        req: &[OpReq],
        in_grad: &[Array],
        _aux: &[Array],
    ) -> Result<()> {
        check_count("FullyConnected gradients", self.num_args(), in_grad.len())?;
        let (n, k) = in_data[0].shape().flat_2d();
        let h = self.num_hidden;
        let grad = &out_grad[0];

        let r = req[0];
        if r != OpReq::Null {
            launch(
                "FullyConnected.backward_data",
                &[grad, &in_data[1]],
                &[&in_grad[0]],
                &[r],
                move |inp, out| {
                    let (g, w) = (inp[0], inp[1]);
                    for i in 0..n {
                        for p in 0..k {
                            let mut acc = 0.0;
                            for j in 0..h {
                                acc += g[i * h + j] * w[j * k + p];
                            }
                            r.assign(&mut out[0][i * k + p], acc);
                        }
                    }
                    Ok(())
                },
            )?;
        }

        let r = req[1];
        if r != OpReq::Null {
            launch(
                "FullyConnected.backward_weight",
                &[grad, &in_data[0]],
                &[&in_grad[1]],
                &[r],
                move |inp, out| {
                    let (g, x) = (inp[0], inp[1]);
                    for j in 0..h {
                        for p in 0..k {
                            let mut acc = 0.0;
                            for i in 0..n {
                                acc += g[i * h + j] * x[i * k + p];
                            }
                            r.assign(&mut out[0][j * k + p], acc);
                        }
                    }
                    Ok(())
                },
            )?;
        }

        if !self.no_bias && req[2] != OpReq::Null {
            let r = req[2];
            launch(
                "FullyConnected.backward_bias",
                &[grad],
                &[&in_grad[2]],
                &[r],
                move |inp, out| {
                    let g = inp[0];
                    for j in 0..h {
                        let acc: f32 = (0..n).map(|i| g[i * h + j]).sum();
                        r.assign(&mut out[0][j], acc);
                    }
                    Ok(())
                },
            )?;
        }
        Ok(())
    }
}
