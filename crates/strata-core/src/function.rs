// Function — Registry of array-level functions
//
// An ArrayFunction is a named imperative routine over arrays:
//
//   body(use_vars, scalars, mutate_vars)
//
// `use_vars` are read, `mutate_vars` are written, `scalars` are plain f32
// parameters. Each function declares how many of each it takes and `invoke`
// checks the counts before running the body. Bodies only submit engine work;
// nothing here blocks.
//
// The registry is an explicit value: build one with `with_builtins()` and pass
// it where it is needed.

use std::collections::BTreeMap;

use crate::array::Array;
use crate::error::{Error, Result};
use crate::ops::BinaryOp;

/// Signature of an array function body.
pub type FunctionBody = fn(&[Array], &[f32], &[Array]) -> Result<()>;

/// A registered array function.
#[derive(Clone)]
pub struct ArrayFunction {
    pub name: String,
    pub description: String,
    pub num_use_vars: usize,
    pub num_scalars: usize,
    pub num_mutate_vars: usize,
    pub body: FunctionBody,
}

impl std::fmt::Debug for ArrayFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArrayFunction")
            .field("name", &self.name)
            .field("num_use_vars", &self.num_use_vars)
            .field("num_scalars", &self.num_scalars)
            .field("num_mutate_vars", &self.num_mutate_vars)
            .finish()
    }
}

impl ArrayFunction {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        (num_use_vars, num_scalars, num_mutate_vars): (usize, usize, usize),
        body: FunctionBody,
    ) -> Self {
        ArrayFunction {
            name: name.into(),
            description: description.into(),
            num_use_vars,
            num_scalars,
            num_mutate_vars,
            body,
        }
    }

    /// Check the argument counts, then run the body.
    pub fn invoke(&self, use_vars: &[Array], scalars: &[f32], mutate_vars: &[Array]) -> Result<()> {
        let checks = [
            ("use_vars", self.num_use_vars, use_vars.len()),
            ("scalars", self.num_scalars, scalars.len()),
            ("mutate_vars", self.num_mutate_vars, mutate_vars.len()),
        ];
        for (what, expected, got) in checks {
            if expected != got {
                return Err(Error::ArgumentCount { what, expected, got });
            }
        }
        (self.body)(use_vars, scalars, mutate_vars)
    }
}

/// Name → function table.
#[derive(Debug, Clone, Default)]
pub struct FunctionRegistry {
    functions: BTreeMap<String, ArrayFunction>,
}

impl FunctionRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in functions.
    pub fn with_builtins() -> Self {
        let mut reg = Self::new();
        reg.register(ArrayFunction::new("_plus", "out = lhs + rhs", (2, 0, 1), plus));
        reg.register(ArrayFunction::new("_minus", "out = lhs - rhs", (2, 0, 1), minus));
        reg.register(ArrayFunction::new("_mul", "out = lhs * rhs", (2, 0, 1), mul));
        reg.register(ArrayFunction::new("_div", "out = lhs / rhs", (2, 0, 1), div));
        reg.register(ArrayFunction::new("_copyto", "copy src into out", (1, 0, 1), copyto));
        reg.register(ArrayFunction::new(
            "_set_value",
            "fill out with a scalar",
            (0, 1, 1),
            set_value,
        ));
        reg.register(ArrayFunction::new(
            "_random_uniform",
            "fill out with U(low, high)",
            (0, 2, 1),
            random_uniform,
        ));
        reg.register(ArrayFunction::new(
            "_random_gaussian",
            "fill out with N(mean, std^2)",
            (0, 2, 1),
            random_gaussian,
        ));
        reg
    }

    /// Add or replace a function.
    pub fn register(&mut self, function: ArrayFunction) {
        self.functions.insert(function.name.clone(), function);
    }

    pub fn get(&self, name: &str) -> Option<&ArrayFunction> {
        self.functions.get(name)
    }

    /// Registered functions in name order.
    pub fn list(&self) -> Vec<&ArrayFunction> {
        self.functions.values().collect()
    }

    /// Look up `name` and invoke it.
    pub fn invoke(
        &self,
        name: &str,
        use_vars: &[Array],
        scalars: &[f32],
        mutate_vars: &[Array],
    ) -> Result<()> {
        self.get(name)
            .ok_or_else(|| Error::UnknownOperator(name.to_string()))?
            .invoke(use_vars, scalars, mutate_vars)
    }
}

// Built-in bodies

fn plus(u: &[Array], _: &[f32], m: &[Array]) -> Result<()> {
    u[0].binary_into(&u[1], BinaryOp::Add, &m[0])
}

fn minus(u: &[Array], _: &[f32], m: &[Array]) -> Result<()> {
    u[0].binary_into(&u[1], BinaryOp::Sub, &m[0])
}

fn mul(u: &[Array], _: &[f32], m: &[Array]) -> Result<()> {
    u[0].binary_into(&u[1], BinaryOp::Mul, &m[0])
}

fn div(u: &[Array], _: &[f32], m: &[Array]) -> Result<()> {
    u[0].binary_into(&u[1], BinaryOp::Div, &m[0])
}

fn copyto(u: &[Array], _: &[f32], m: &[Array]) -> Result<()> {
    m[0].copy_from(&u[0])
}

fn set_value(_: &[Array], s: &[f32], m: &[Array]) -> Result<()> {
    m[0].fill(s[0])
}

fn random_uniform(_: &[Array], s: &[f32], m: &[Array]) -> Result<()> {
    m[0].random_uniform(s[0], s[1])
}

fn random_gaussian(_: &[Array], s: &[f32], m: &[Array]) -> Result<()> {
    m[0].random_gaussian(s[0], s[1])
}
