use crate::context::Context;
use crate::shape::Shape;

/// All errors that can occur within Strata.
///
/// The variants fall into four groups:
/// - malformed serialized streams (`Format`, `Io`),
/// - contract violations detected by the call that received bad input,
/// - failures of scheduled operations (`OperationFailed`), reported by a later wait,
/// - engine construction failures (`ThreadPool`).
///
/// Incomplete shape inference is not an error; see `ShapeInference::complete`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A serialized array or array list is malformed or truncated.
    #[error("invalid array serialization format: {0}")]
    Format(String),

    /// Underlying reader/writer failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Two shapes that must agree do not.
    #[error("shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: Shape, got: Shape },

    /// A host buffer does not have the number of elements the array holds.
    #[error("size mismatch: array holds {expected} elements, buffer has {got}")]
    SizeMismatch { expected: usize, got: usize },

    /// Wrong number of positional arguments, arrays or request kinds.
    #[error("{what}: expected {expected} entries, got {got}")]
    ArgumentCount {
        what: &'static str,
        expected: usize,
        got: usize,
    },

    /// A keyword argument names nothing the receiver knows about.
    #[error("unknown argument '{name}' for {target}")]
    UnknownArgument { name: String, target: String },

    /// No operator or function is registered under this name.
    #[error("'{0}' is not registered")]
    UnknownOperator(String),

    /// An operator parameter is missing, unknown or cannot be parsed.
    #[error("invalid parameter for {op}: {key}={value} ({reason})")]
    InvalidParam {
        op: String,
        key: String,
        value: String,
        reason: String,
    },

    /// A gradient target and its request kind are inconsistent.
    #[error("argument '{arg}' has no gradient storage but requests a gradient")]
    InvalidGradReq { arg: String },

    /// An array does not live on the context it is bound to.
    #[error("context mismatch: expected {expected}, got {got}")]
    ContextMismatch { expected: Context, got: Context },

    /// Raw host data was requested for an array living elsewhere.
    #[error("array lives on {context}, host data is only available for cpu arrays")]
    NotHostMemory { context: Context },

    /// The operation needs storage but the array is in the none state.
    #[error("array is in the none state: {0}")]
    NoneArray(String),

    /// `backward` was called on a binding that never ran `forward`.
    #[error("backward called before forward")]
    NotForwarded,

    /// The number of head gradients does not match the number of outputs.
    #[error("expected {expected} head gradients, got {got}")]
    HeadGradCount { expected: usize, got: usize },

    /// The graph still has unresolved shapes where concrete storage is required.
    #[error("shapes are not fully resolved: {0}")]
    IncompleteShapes(String),

    /// A scheduled operation failed; every later wait on the data it wrote sees this.
    #[error("operation '{op}' failed: {reason}")]
    OperationFailed { op: String, reason: String },

    /// The engine worker pool could not be started.
    #[error("could not start engine workers: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    /// Generic message for cases not covered above.
    #[error("{0}")]
    Msg(String),
}

impl Error {
    /// Create an error from any string message.
    pub fn msg(s: impl Into<String>) -> Self {
        Error::Msg(s.into())
    }

    /// Create a format error.
    pub fn format(s: impl Into<String>) -> Self {
        Error::Format(s.into())
    }

    /// Wrap a failure coming out of a scheduled operation.
    pub fn op_failed(op: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::OperationFailed {
            op: op.into(),
            reason: reason.into(),
        }
    }
}

/// Convenience Result type used throughout Strata.
pub type Result<T> = std::result::Result<T, Error>;

/// Macro for early return with a formatted error message.
/// Usage: `bail!("something went wrong: {}", detail)`
#[macro_export]
macro_rules! bail {
    ($($arg:tt)*) => {
        return Err($crate::Error::Msg(format!($($arg)*)))
    };
}
