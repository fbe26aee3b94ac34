// Elementwise binary operators: _Plus, _Minus, _Mul
//
// Both arguments and the output share one shape.

use strata_core::{Array, Context, Result, Shape};

use super::params::Kwargs;
use super::{launch, unify, OpContext, OpReq, Operator, OperatorProperty};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementWiseKind {
    Plus,
    Minus,
    Mul,
}

/// Property of `_Plus`, `_Minus` and `_Mul`.
#[derive(Debug, Clone)]
pub struct ElementWiseBinary {
    kind: ElementWiseKind,
}

impl ElementWiseBinary {
    pub fn new(kind: ElementWiseKind) -> Self {
        ElementWiseBinary { kind }
    }

    pub fn kind(&self) -> ElementWiseKind {
        self.kind
    }
}

impl OperatorProperty for ElementWiseBinary {
    fn type_name(&self) -> &str {
        match self.kind {
            ElementWiseKind::Plus => "_Plus",
            ElementWiseKind::Minus => "_Minus",
            ElementWiseKind::Mul => "_Mul",
        }
    }

    fn init(&mut self, kwargs: &[(String, String)]) -> Result<()> {
        Kwargs::new(self.type_name(), kwargs, &[])?;
        Ok(())
    }

    fn list_arguments(&self) -> Vec<String> {
        vec!["lhs".to_string(), "rhs".to_string()]
    }

    fn infer_shape(
        &self,
        in_shapes: &mut [Shape],
        out_shapes: &mut [Shape],
        _aux_shapes: &mut [Shape],
    ) -> Result<bool> {
        let [lhs, rhs] = in_shapes else {
            return Ok(false);
        };
        unify(&mut [lhs, rhs, &mut out_shapes[0]])
    }

    fn create_operator(&self, _ctx: Context) -> Result<Box<dyn Operator>> {
        Ok(Box::new(ElementWiseOp { kind: self.kind }))
    }

    fn copy(&self) -> Box<dyn OperatorProperty> {
        Box::new(self.clone())
    }
}

struct ElementWiseOp {
    kind: ElementWiseKind,
}

impl Operator for ElementWiseOp {
    fn forward(
        &self,
        _ctx: &OpContext,
        in_data: &[Array],
        req: &[OpReq],
        out_data: &[Array],
        _aux: &[Array],
    ) -> Result<()> {
        let (kind, r) = (self.kind, req[0]);
        if r == OpReq::Null {
            return Ok(());
        }
        launch(
            "ElementWise",
            &[&in_data[0], &in_data[1]],
            &[&out_data[0]],
            &[r],
            move |inp, out| {
                for ((y, &a), &b) in out[0].iter_mut().zip(inp[0]).zip(inp[1]) {
                    let v = match kind {
                        ElementWiseKind::Plus => a + b,
                        ElementWiseKind::Minus => a - b,
                        ElementWiseKind::Mul => a * b,
                    };
                    r.assign(y, v);
                }
                Ok(())
            },
        )
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
        let grad = &out_grad[0];
        for side in 0..2 {
            let r = req[side];
            if r == OpReq::Null {
                continue;
            }
            match self.kind {
                ElementWiseKind::Plus | ElementWiseKind::Minus => {
                    let sign = if side == 1 && self.kind == ElementWiseKind::Minus {
                        -1.0
                    } else {
                        1.0
                    };
                    launch("ElementWise.backward", &[grad], &[&in_grad[side]], &[r], move |inp, out| {
                        for (dx, &g) in out[0].iter_mut().zip(inp[0]) {
                            r.assign(dx, sign * g);
                        }
                        Ok(())
                    })?;
                }
                ElementWiseKind::Mul => {
                    // d lhs = g * rhs, d rhs = g * lhs
                    let other = &in_data[1 - side];
                    launch(
                        "ElementWise.backward",
                        &[grad, other],
                        &[&in_grad[side]],
                        &[r],
                        move |inp, out| {
                            for ((dx, &g), &o) in out[0].iter_mut().zip(inp[0]).zip(inp[1]) {
                                r.assign(dx, g * o);
                            }
                            Ok(())
                        },
                    )?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::Engine;

    #[test]
    fn test_type_names() {
        assert_eq!(ElementWiseBinary::new(ElementWiseKind::Plus).type_name(), "_Plus");
        assert_eq!(ElementWiseBinary::new(ElementWiseKind::Mul).type_name(), "_Mul");
    }

    #[test]
    fn test_infer_from_output() {
        let p = ElementWiseBinary::new(ElementWiseKind::Minus);
        let mut ins = vec![Shape::none(), Shape::from((0, 3))];
        let mut outs = vec![Shape::from((2, 3))];
        assert!(p.infer_shape(&mut ins, &mut outs, &mut []).unwrap());
        assert_eq!(ins[0], Shape::from((2, 3)));
        assert_eq!(ins[1], Shape::from((2, 3)));
    }

    #[test]
    fn test_mul_backward_accumulates() {
        let engine = Engine::synchronous().unwrap();
        let op = ElementWiseBinary::new(ElementWiseKind::Mul)
            .create_operator(Context::cpu())
            .unwrap();
        let a = Array::from_vec(vec![2.0, 3.0], 2, &engine).unwrap();
        let b = Array::from_vec(vec![5.0, 7.0], 2, &engine).unwrap();
        let g = Array::from_vec(vec![1.0, 1.0], 2, &engine).unwrap();
        let da = Array::from_vec(vec![1.0, 1.0], 2, &engine).unwrap();
        op.backward(
            &OpContext::default(),
            &[g],
            &[a, b],
            &[],
            &[OpReq::Add, OpReq::Null],
            &[da.clone(), Array::none()],
            &[],
        )
        .unwrap();
        assert_eq!(da.to_vec().unwrap(), vec![6.0, 8.0]);
    }
}
