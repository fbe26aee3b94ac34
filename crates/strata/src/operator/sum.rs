// ElementWiseSum and _zeros_like
//
// The gradient builder relies on both: ElementWiseSum adds up the gradient
// contributions of an entry with several consumers, and _zeros_like stands in
// for the gradient of an entry nobody differentiates through.

use strata_core::{Array, Context, Result, Shape};

use super::params::Kwargs;
use super::{check_count, launch, unify, OpContext, OpReq, Operator, OperatorProperty};

/// Property of `ElementWiseSum`: output = arg0 + arg1 + ... + arg{num_args-1}.
#[derive(Debug, Clone)]
pub struct ElementWiseSum {
    pub num_args: usize,
}

impl Default for ElementWiseSum {
    fn default() -> Self {
        ElementWiseSum { num_args: 1 }
    }
}

impl ElementWiseSum {
    pub fn new(num_args: usize) -> Self {
        ElementWiseSum { num_args }
    }
}

impl OperatorProperty for ElementWiseSum {
    fn type_name(&self) -> &str {
        "ElementWiseSum"
    }

    fn init(&mut self, kwargs: &[(String, String)]) -> Result<()> {
        let kw = Kwargs::new("ElementWiseSum", kwargs, &["num_args"])?;
        let num_args: usize = kw.required("num_args")?;
        if num_args == 0 {
            return Err(kw.invalid("num_args", "0", "must be positive"));
        }
        self.num_args = num_args;
        Ok(())
    }

    fn params(&self) -> Vec<(String, String)> {
        vec![("num_args".into(), self.num_args.to_string())]
    }

    fn list_arguments(&self) -> Vec<String> {
        (0..self.num_args).map(|i| format!("arg{i}")).collect()
    }

    fn infer_shape(
        &self,
        in_shapes: &mut [Shape],
        out_shapes: &mut [Shape],
        _aux_shapes: &mut [Shape],
    ) -> Result<bool> {
        let mut all: Vec<&mut Shape> = in_shapes.iter_mut().collect();
        all.push(&mut out_shapes[0]);
        unify(&mut all)
    }

    fn create_operator(&self, _ctx: Context) -> Result<Box<dyn Operator>> {
        Ok(Box::new(SumOp {
            num_args: self.num_args,
        }))
    }

    fn copy(&self) -> Box<dyn OperatorProperty> {
        Box::new(self.clone())
    }
}

struct SumOp {
    num_args: usize,
}

impl Operator for SumOp {
    fn forward(
        &self,
        _ctx: &OpContext,
        in_data: &[Array],
        req: &[OpReq],
        out_data: &[Array],
        _aux: &[Array],
    ) -> Result<()> {
        check_count("ElementWiseSum inputs", self.num_args, in_data.len())?;
        let r = req[0];
        if r == OpReq::Null {
            return Ok(());
        }
        let inputs: Vec<&Array> = in_data.iter().collect();
        launch("ElementWiseSum", &inputs, &[&out_data[0]], &[r], move |inp, out| {
            for (i, y) in out[0].iter_mut().enumerate() {
                let v: f32 = inp.iter().map(|x| x[i]).sum();
                r.assign(y, v);
            }
            Ok(())
        })
    }

    fn backward(
        &self,
        _ctx: &OpContext,
        out_grad: &[Array],
        _in_data: &[Array],
        _out_data: &[Array],
        req: &[OpReq],
        in_grad: &[Array],
        _aux: &[Array],
    ) -> Result<()> {
        for (dx, &r) in in_grad.iter().zip(req) {
            if r == OpReq::Null {
                continue;
            }
            launch("ElementWiseSum.backward", &[&out_grad[0]], &[dx], &[r], move |inp, out| {
                for (d, &g) in out[0].iter_mut().zip(inp[0]) {
                    r.assign(d, g);
                }
                Ok(())
            })?;
        }
        Ok(())
    }
}

/// Property of `_zeros_like`: an array of zeros shaped like its input.
#[derive(Debug, Clone, Default)]
pub struct ZerosLike;

impl OperatorProperty for ZerosLike {
    fn type_name(&self) -> &str {
        "_zeros_like"
    }

    fn init(&mut self, kwargs: &[(String, String)]) -> Result<()> {
        Kwargs::new("_zeros_like", kwargs, &[])?;
        Ok(())
    }

    fn infer_shape(
        &self,
        in_shapes: &mut [Shape],
        out_shapes: &mut [Shape],
        _aux_shapes: &mut [Shape],
    ) -> Result<bool> {
        unify(&mut [&mut in_shapes[0], &mut out_shapes[0]])
    }

    fn create_operator(&self, _ctx: Context) -> Result<Box<dyn Operator>> {
        Ok(Box::new(ZerosLikeOp))
    }

    fn copy(&self) -> Box<dyn OperatorProperty> {
        Box::new(self.clone())
    }
}

struct ZerosLikeOp;

fn write_zeros(name: &str, target: &Array, r: OpReq) -> Result<()> {
    // Adding zero is a no-op.
    if r != OpReq::Write {
        return Ok(());
    }
    launch(name, &[], &[target], &[r], |_, out| {
        out[0].fill(0.0);
        Ok(())
    })
}

impl Operator for ZerosLikeOp {
    fn forward(
        &self,
        _ctx: &OpContext,
        _in_data: &[Array],
        req: &[OpReq],
        out_data: &[Array],
        _aux: &[Array],
    ) -> Result<()> {
        write_zeros("_zeros_like", &out_data[0], req[0])
    }

    fn backward(
        &self,
        _ctx: &OpContext,
        _out_grad: &[Array],
        _in_data: &[Array],
        _out_data: &[Array],
        req: &[OpReq],
        in_grad: &[Array],
        _aux: &[Array],
    ) -> Result<()> {
        write_zeros("_zeros_like.backward", &in_grad[0], req[0])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::Engine;

    #[test]
    fn test_sum_arguments() {
        let mut p = ElementWiseSum::default();
        p.init(&[("num_args".into(), "3".into())]).unwrap();
        assert_eq!(p.list_arguments(), vec!["arg0", "arg1", "arg2"]);
    }

    #[test]
    fn test_sum_forward() {
        let engine = Engine::synchronous().unwrap();
        let op = ElementWiseSum::new(3).create_operator(Context::cpu()).unwrap();
        let xs: Vec<Array> = (1..=3)
            .map(|k| Array::from_vec(vec![k as f32; 2], 2, &engine).unwrap())
            .collect();
        let y = Array::new(2, Context::cpu(), false, &engine);
        op.forward(&OpContext::default(), &xs, &[OpReq::Write], &[y.clone()], &[])
            .unwrap();
        assert_eq!(y.to_vec().unwrap(), vec![6.0, 6.0]);
    }

    #[test]
    fn test_zeros_like_shape() {
        let p = ZerosLike;
        let mut ins = vec![Shape::from((4, 1))];
        let mut outs = vec![Shape::none()];
        assert!(p.infer_shape(&mut ins, &mut outs, &mut []).unwrap());
        assert_eq!(outs[0], Shape::from((4, 1)));
    }
}
