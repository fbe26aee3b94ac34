//! # strata-core
//!
//! Arrays and the dependency engine that schedules every operation on them.
//!
//! This crate provides:
//! - [`Engine`] — asynchronous scheduler ordering operations by the storage they read and write
//! - [`Array`] — n-dimensional f32 array handle whose operations run on an engine
//! - [`Shape`] / [`Context`] — dimension sizes and device placement
//! - [`ops::launch`] / [`ops::launch_updating`] — the entry points for kernels touching array data
//! - [`FunctionRegistry`] — named imperative array functions
//! - [`io`] — single array and array list serialization
// - Shape, Context: value types shared by every layer
// - Engine: per-variable FIFO scheduling on a rayon pool
// - Array: storage chunks, views, host transfer, arithmetic
// - Function: array-level function table

pub mod array;
pub mod context;
pub mod engine;
pub mod error;
pub mod function;
pub mod io;
pub mod ops;
pub mod shape;

pub use array::{Array, HostData};
pub use context::{Context, DeviceKind};
pub use engine::{Engine, EngineConfig, Var};
pub use error::{Error, Result};
pub use function::{ArrayFunction, FunctionRegistry};
pub use ops::{BinaryOp, ScalarOp};
pub use shape::Shape;
