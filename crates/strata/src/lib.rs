//! # Strata
//!
//! Symbolic computation graphs on top of the asynchronous array engine.
//!
//! ## Usage
//!
//! ```rust
//! use strata::prelude::*;
//! ```
//!
//! ## Architecture
//!
//! | Crate | Purpose |
//! |-------|----------|
//! | `strata-core` | Engine, Array, Shape, Context, array serialization, array functions |
//! | `strata` | Symbol, shape inference, gradient graphs, Executor, operators |
//!
//! ## Modules
//!
//! - [`symbol`] — Composable, immutable symbolic graphs
//! - [`graph`] — Index-addressed graphs: shape inference and the backward pass
//! - [`executor`] — Binding a graph to arrays; forward and backward evaluation
//! - [`operator`] — Operator properties and kernels
//! - [`registry`] — Operators by name

/// Re-export core types.
pub use strata_core::{
    bail, io, ops, Array, ArrayFunction, BinaryOp, Context, DeviceKind, Engine, EngineConfig,
    Error, FunctionRegistry, HostData, Result, ScalarOp, Shape, Var,
};

/// Symbol — graph construction and composition.
pub mod symbol;

/// Static graph — shape inference and gradient construction.
pub mod graph;

/// Executor — bound graphs.
pub mod executor;

/// Operators — properties, kernels and the built-in set.
pub mod operator;

/// Registry — operator lookup by name.
pub mod registry;

pub use executor::Executor;
pub use symbol::{ShapeInference, Symbol};

/// Prelude: import this for the most common types.
pub mod prelude {
    pub use crate::executor::Executor;
    pub use crate::operator::{GradReq, OpReq, OperatorProperty};
    pub use crate::registry::OpRegistry;
    pub use crate::symbol::{ShapeInference, Symbol};
    pub use crate::{Array, Context, Engine, EngineConfig, Error, Result, Shape};
}
