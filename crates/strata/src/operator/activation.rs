// Activation — Elementwise nonlinearity
//
//   relu(x)    = max(x, 0)         d = (y > 0)
//   sigmoid(x) = 1 / (1 + e^-x)    d = y (1 - y)
//   tanh(x)                        d = 1 - y²
//
// The derivative is computed from the output, so backward reads out_data.

use std::fmt;
use std::str::FromStr;

use strata_core::{Array, Context, Error, Result, Shape};

use super::params::Kwargs;
use super::{launch, unify, OpContext, OpReq, Operator, OperatorProperty};

/// Nonlinearity applied by [`Activation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ActType {
    #[default]
    Relu,
    Sigmoid,
    Tanh,
}

impl ActType {
    #[inline]
    fn apply(self, x: f32) -> f32 {
        match self {
            ActType::Relu => x.max(0.0),
            ActType::Sigmoid => 1.0 / (1.0 + (-x).exp()),
            ActType::Tanh => x.tanh(),
        }
    }

    /// Derivative expressed through the output `y`.
    #[inline]
    fn grad(self, y: f32) -> f32 {
        match self {
            ActType::Relu => {
                if y > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            ActType::Sigmoid => y * (1.0 - y),
            ActType::Tanh => 1.0 - y * y,
        }
    }
}

impl FromStr for ActType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "relu" => Ok(ActType::Relu),
            "sigmoid" => Ok(ActType::Sigmoid),
            "tanh" => Ok(ActType::Tanh),
            other => Err(Error::msg(format!("unknown activation '{other}'"))),
        }
    }
}

impl fmt::Display for ActType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActType::Relu => write!(f, "relu"),
            ActType::Sigmoid => write!(f, "sigmoid"),
            ActType::Tanh => write!(f, "tanh"),
        }
    }
}

/// Property of the `Activation` operator.
#[derive(Debug, Clone, Default)]
pub struct Activation {
    pub act_type: ActType,
}

impl OperatorProperty for Activation {
    fn type_name(&self) -> &str {
        "Activation"
    }

    fn init(&mut self, kwargs: &[(String, String)]) -> Result<()> {
        let kw = Kwargs::new("Activation", kwargs, &["act_type"])?;
        self.act_type = kw.required("act_type")?;
        Ok(())
    }

    fn params(&self) -> Vec<(String, String)> {
        vec![("act_type".into(), self.act_type.to_string())]
    }

    fn infer_shape(
        &self,
        in_shapes: &mut [Shape],
        out_shapes: &mut [Shape],
        _aux_shapes: &mut [Shape],
    ) -> Result<bool> {
        let (data, out) = (&mut in_shapes[0], &mut out_shapes[0]);
        unify(&mut [data, out])
    }

    fn create_operator(&self, _ctx: Context) -> Result<Box<dyn Operator>> {
        Ok(Box::new(ActivationOp {
            act: self.act_type,
        }))
    }

    fn copy(&self) -> Box<dyn OperatorProperty> {
        Box::new(self.clone())
    }
}

struct ActivationOp {
    act: ActType,
}

impl Operator for ActivationOp {
    fn forward(
        &self,
        _ctx: &OpContext,
        in_data: &[Array],
        req: &[OpReq],
        out_data: &[Array],
        _aux: &[Array],
    ) -> Result<()> {
        let (act, r) = (self.act, req[0]);
        if r == OpReq::Null {
            return Ok(());
        }
        launch("Activation", &[&in_data[0]], &[&out_data[0]], &[r], move |inp, out| {
            for (y, &x) in out[0].iter_mut().zip(inp[0]) {
                r.assign(y, act.apply(x));
            }
            Ok(())
        })
    }

    fn backward(
        &self,
        _ctx: &OpContext,
        out_grad: &[Array],
        _in_data: &[Array],
        out_data: &[Array],
        req: &[OpReq],
        in_grad: &[Array],
        _aux: &[Array],
    ) -> Result<()> {
        let (act, r) = (self.act, req[0]);
        if r == OpReq::Null {
            return Ok(());
        }
        launch(
            "Activation.backward",
            &[&out_grad[0], &out_data[0]],
            &[&in_grad[0]],
            &[r],
            move |inp, out| {
                for ((dx, &g), &y) in out[0].iter_mut().zip(inp[0]).zip(inp[1]) {
                    r.assign(dx, g * act.grad(y));
                }
                Ok(())
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_act_type() {
        let mut p = Activation::default();
        p.init(&[("act_type".into(), "tanh".into())]).unwrap();
        assert_eq!(p.act_type, ActType::Tanh);
        assert!(matches!(
            p.init(&[("act_type".into(), "gelu".into())]),
            Err(Error::InvalidParam { .. })
        ));
    }

    #[test]
    fn test_values_and_derivatives() {
        assert_eq!(ActType::Relu.apply(-1.0), 0.0);
        assert_eq!(ActType::Relu.grad(2.0), 1.0);
        let y = ActType::Sigmoid.apply(0.0);
        assert!((y - 0.5).abs() < 1e-6);
        assert!((ActType::Sigmoid.grad(y) - 0.25).abs() < 1e-6);
        assert!((ActType::Tanh.grad(ActType::Tanh.apply(0.0)) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_infer_both_ways() {
        let p = Activation::default();
        let mut ins = vec![Shape::none()];
        let mut outs = vec![Shape::from((3, 2))];
        assert!(p.infer_shape(&mut ins, &mut outs, &mut []).unwrap());
        assert_eq!(ins[0], Shape::from((3, 2)));
    }
}
