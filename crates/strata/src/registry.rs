// Registry — Name → operator property factory
//
// The registry is an explicit value, not a global: build one with
// `OpRegistry::with_builtins()` and pass it by reference. Each entry carries
// the metadata a front end needs to describe the operator (arguments,
// description, which keyword sets a variable argument count).
//
// Usage:
//   let registry = OpRegistry::with_builtins();
//   let prop = registry.create("FullyConnected", &[("num_hidden".into(), "10".into())])?;
//   let mut fc = Symbol::create(prop);

use std::collections::BTreeMap;

use strata_core::{Error, Result};

use crate::operator::{
    Activation, BatchNorm, ElementWiseBinary, ElementWiseKind, ElementWiseSum, FullyConnected,
    OperatorProperty, Softmax, ZerosLike,
};

/// Documentation of one operator argument or parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgInfo {
    pub name: String,
    pub type_info: String,
    pub description: String,
}

impl ArgInfo {
    pub fn new(name: &str, type_info: &str, description: &str) -> Self {
        ArgInfo {
            name: name.to_string(),
            type_info: type_info.to_string(),
            description: description.to_string(),
        }
    }
}

/// A registered operator.
#[derive(Clone)]
pub struct OpEntry {
    pub name: String,
    pub description: String,
    pub arguments: Vec<ArgInfo>,
    /// Keyword holding the number of positional arguments, for variadic operators.
    pub key_var_num_args: Option<String>,
    pub factory: fn() -> Box<dyn OperatorProperty>,
}

impl std::fmt::Debug for OpEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpEntry")
            .field("name", &self.name)
            .field("arguments", &self.arguments.len())
            .field("key_var_num_args", &self.key_var_num_args)
            .finish()
    }
}

fn factory<T: OperatorProperty + Default + 'static>() -> Box<dyn OperatorProperty> {
    Box::new(T::default())
}

fn plus() -> Box<dyn OperatorProperty> {
    Box::new(ElementWiseBinary::new(ElementWiseKind::Plus))
}

fn minus() -> Box<dyn OperatorProperty> {
    Box::new(ElementWiseBinary::new(ElementWiseKind::Minus))
}

fn mul() -> Box<dyn OperatorProperty> {
    Box::new(ElementWiseBinary::new(ElementWiseKind::Mul))
}

/// Operator registry.
#[derive(Debug, Clone, Default)]
pub struct OpRegistry {
    entries: BTreeMap<String, OpEntry>,
}

impl OpRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every built-in operator.
    pub fn with_builtins() -> Self {
        let mut reg = Self::new();
        let ndarray = "Symbol";
        reg.register(OpEntry {
            name: "FullyConnected".into(),
            description: "Affine transformation of the flattened input".into(),
            arguments: vec![
                ArgInfo::new("data", ndarray, "Input, [N, ...]"),
                ArgInfo::new("weight", ndarray, "Weight matrix, [num_hidden, K]"),
                ArgInfo::new("bias", ndarray, "Bias vector, [num_hidden]"),
                ArgInfo::new("num_hidden", "int, required", "Number of hidden units"),
                ArgInfo::new("no_bias", "boolean, optional, default=False", "Drop the bias"),
            ],
            key_var_num_args: None,
            factory: factory::<FullyConnected>,
        });
        reg.register(OpEntry {
            name: "Activation".into(),
            description: "Elementwise activation function".into(),
            arguments: vec![
                ArgInfo::new("data", ndarray, "Input"),
                ArgInfo::new("act_type", "{'relu', 'sigmoid', 'tanh'}, required", "Activation"),
            ],
            key_var_num_args: None,
            factory: factory::<Activation>,
        });
        for (name, kind, description) in [
            ("_Plus", ElementWiseKind::Plus, "lhs + rhs"),
            ("_Minus", ElementWiseKind::Minus, "lhs - rhs"),
            ("_Mul", ElementWiseKind::Mul, "lhs * rhs"),
        ] {
            reg.register(OpEntry {
                name: name.into(),
                description: format!("Elementwise {description}"),
                arguments: vec![
                    ArgInfo::new("lhs", ndarray, "Left operand"),
                    ArgInfo::new("rhs", ndarray, "Right operand"),
                ],
                key_var_num_args: None,
                factory: match kind {
                    ElementWiseKind::Plus => plus,
                    ElementWiseKind::Minus => minus,
                    ElementWiseKind::Mul => mul,
                },
            });
        }
        reg.register(OpEntry {
            name: "ElementWiseSum".into(),
            description: "Sum of all arguments".into(),
            arguments: vec![ArgInfo::new(
                "num_args",
                "int, required",
                "Number of arguments",
            )],
            key_var_num_args: Some("num_args".into()),
            factory: factory::<ElementWiseSum>,
        });
        reg.register(OpEntry {
            name: "_zeros_like".into(),
            description: "Zeros shaped like the input".into(),
            arguments: vec![ArgInfo::new("data", ndarray, "Input")],
            key_var_num_args: None,
            factory: factory::<ZerosLike>,
        });
        reg.register(OpEntry {
            name: "BatchNorm".into(),
            description: "Batch normalization over the channel axis".into(),
            arguments: vec![
                ArgInfo::new("data", ndarray, "Input, [N, C, ...]"),
                ArgInfo::new("gamma", ndarray, "Scale, [C]"),
                ArgInfo::new("beta", ndarray, "Shift, [C]"),
                ArgInfo::new("eps", "float, optional, default=1e-5", "Variance epsilon"),
                ArgInfo::new(
                    "momentum",
                    "float, optional, default=0.9",
                    "Moving average momentum",
                ),
            ],
            key_var_num_args: None,
            factory: factory::<BatchNorm>,
        });
        reg.register(OpEntry {
            name: "Softmax".into(),
            description: "Softmax output with cross-entropy gradient".into(),
            arguments: vec![
                ArgInfo::new("data", ndarray, "Input, [N, K]"),
                ArgInfo::new("label", ndarray, "Class indices, [N]"),
                ArgInfo::new("grad_scale", "float, optional, default=1", "Gradient scale"),
            ],
            key_var_num_args: None,
            factory: factory::<Softmax>,
        });
        reg
    }

    /// Add or replace an entry.
    pub fn register(&mut self, entry: OpEntry) {
        log::trace!("registry: register '{}'", entry.name);
        self.entries.insert(entry.name.clone(), entry);
    }

    pub fn get(&self, name: &str) -> Option<&OpEntry> {
        self.entries.get(name)
    }

    /// Entries in name order.
    pub fn list(&self) -> Vec<&OpEntry> {
        self.entries.values().collect()
    }

    /// Construct the property registered as `name` and initialize it.
    pub fn create(&self, name: &str, kwargs: &[(String, String)]) -> Result<Box<dyn OperatorProperty>> {
        let entry = self
            .get(name)
            .ok_or_else(|| Error::UnknownOperator(name.to_string()))?;
        let mut prop = (entry.factory)();
        prop.init(kwargs)?;
        Ok(prop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kv(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_builtins() {
        let reg = OpRegistry::with_builtins();
        let names: Vec<&str> = reg.list().iter().map(|e| e.name.as_str()).collect();
        for expected in [
            "Activation",
            "BatchNorm",
            "ElementWiseSum",
            "FullyConnected",
            "Softmax",
            "_Minus",
            "_Mul",
            "_Plus",
            "_zeros_like",
        ] {
            assert!(names.contains(&expected), "missing {expected}");
        }
        assert_eq!(
            reg.get("ElementWiseSum").unwrap().key_var_num_args.as_deref(),
            Some("num_args")
        );
    }

    #[test]
    fn test_create_initializes() {
        let reg = OpRegistry::with_builtins();
        let fc = reg
            .create("FullyConnected", &kv(&[("num_hidden", "8"), ("no_bias", "true")]))
            .unwrap();
        assert_eq!(fc.list_arguments(), vec!["data", "weight"]);
        let minus = reg.create("_Minus", &[]).unwrap();
        assert_eq!(minus.type_name(), "_Minus");
    }

    #[test]
    fn test_create_errors() {
        let reg = OpRegistry::with_builtins();
        assert!(matches!(
            reg.create("Conv9d", &[]),
            Err(Error::UnknownOperator(_))
        ));
        assert!(matches!(
            reg.create("FullyConnected", &[]),
            Err(Error::InvalidParam { .. })
        ));
        assert!(OpRegistry::new().list().is_empty());
    }
}
