//! Parameter values and solve-time inputs.
//!
//! Models are written against named [`Expr::parameter`] and
//! [`Expr::function_parameter`] placeholders. A [`ParameterValues`] set resolves
//! them before discretisation, producing a new model in which every
//! placeholder has been replaced by a concrete expression. Values that should
//! stay adjustable between solves are mapped to [`Expr::input`] nodes instead
//! and supplied through [`Inputs`] when solving.
//!
//! # Example
//!
//! ```ignore
//! let values = ParameterValues::new()
//!     .with_constant("Diffusivity", 1e-3)
//!     .with_input("Applied current")
//!     .with_function("Exchange current", |args| 2.0 * args[0].sqrt());
//!
//! let processed = values.process_model(&model)?;
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::expression::{Expr, Kind};
use crate::model::Model;

/// Input parameter values supplied at solve time, keyed by name.
pub type Inputs = BTreeMap<String, f64>;

/// Errors raised while resolving parameters.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ParameterError {
    /// A parameter appears in the model but has no value
    #[error("No value given for parameter '{0}'")]
    Missing(String),
    /// A plain parameter was given a function value or vice versa
    #[error("Parameter '{name}' is used as {used} but was given {given}")]
    WrongKind {
        /// Parameter name
        name: String,
        /// How the model uses it
        used: &'static str,
        /// What the value set holds
        given: &'static str,
    },
    /// Substitution produced a parameter that refers back to itself
    #[error("Parameter '{0}' is defined in terms of itself")]
    Recursive(String),
}

/// Function parameter body: builds an expression from the argument expressions.
pub type ParameterFunction = Arc<dyn Fn(&[Expr]) -> Expr + Send + Sync>;

/// The value bound to one parameter name.
#[derive(Clone)]
pub enum ParameterValue {
    /// A number
    Constant(f64),
    /// An expression, which may itself reference other parameters
    Expression(Expr),
    /// A callable of the argument expressions
    Function(ParameterFunction),
    /// Left open and supplied at solve time under the same name
    Input,
}

impl ParameterValue {
    fn describe(&self) -> &'static str {
        match self {
            ParameterValue::Constant(_) => "a constant",
            ParameterValue::Expression(_) => "an expression",
            ParameterValue::Function(_) => "a function",
            ParameterValue::Input => "an input",
        }
    }
}

impl fmt::Debug for ParameterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParameterValue::Constant(v) => write!(f, "Constant({})", v),
            ParameterValue::Expression(e) => write!(f, "Expression({})", e),
            ParameterValue::Function(_) => write!(f, "Function(..)"),
            ParameterValue::Input => write!(f, "Input"),
        }
    }
}

/// Named parameter values.
#[derive(Debug, Clone, Default)]
pub struct ParameterValues {
    values: BTreeMap<String, ParameterValue>,
}

/// Nesting depth at which substitution gives up and reports recursion.
const MAX_DEPTH: usize = 32;

impl ParameterValues {
    /// Creates an empty set.
    pub fn new() -> Self {
        ParameterValues { values: BTreeMap::new() }
    }

    /// Binds `name` to a constant.
    pub fn with_constant(mut self, name: &str, value: f64) -> Self {
        self.insert(name, ParameterValue::Constant(value));
        self
    }

    /// Binds `name` to an expression.
    pub fn with_expression(mut self, name: &str, value: impl Into<Expr>) -> Self {
        self.insert(name, ParameterValue::Expression(value.into()));
        self
    }

    /// Binds `name` to a function of its arguments.
    pub fn with_function<F>(mut self, name: &str, f: F) -> Self
    where
        F: Fn(&[Expr]) -> Expr + Send + Sync + 'static,
    {
        self.insert(name, ParameterValue::Function(Arc::new(f)));
        self
    }

    /// Leaves `name` open as a solve-time input.
    pub fn with_input(mut self, name: &str) -> Self {
        self.insert(name, ParameterValue::Input);
        self
    }

    /// Binds `name`, replacing any previous value.
    pub fn insert(&mut self, name: &str, value: ParameterValue) {
        self.values.insert(name.to_string(), value);
    }

    /// Value bound to `name`.
    pub fn get(&self, name: &str) -> Option<&ParameterValue> {
        self.values.get(name)
    }

    /// Number of bound names.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true if nothing is bound.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Replaces every parameter and function parameter in `expr`.
    pub fn process_symbol(&self, expr: &Expr) -> Result<Expr, ParameterError> {
        self.process_at_depth(expr, 0)
    }

    fn process_at_depth(&self, expr: &Expr, depth: usize) -> Result<Expr, ParameterError> {
        expr.replace(&mut |node: &Expr| -> Result<Option<Expr>, ParameterError> {
            let (name, is_function) = match node.kind() {
                Kind::Parameter(name) => (name.clone(), false),
                Kind::FunctionParameter(name) => (name.clone(), true),
                _ => return Ok(None),
            };
            if depth >= MAX_DEPTH {
                return Err(ParameterError::Recursive(name.to_string()));
            }
            let value = self.get(&name).ok_or_else(|| ParameterError::Missing(name.to_string()))?;
            let wrong_kind = |used| ParameterError::WrongKind {
                name: name.to_string(),
                used,
                given: value.describe(),
            };
            let resolved = match (value, is_function) {
                (ParameterValue::Function(f), true) => {
                    let args = node
                        .children()
                        .iter()
                        .map(|a| self.process_at_depth(a, depth + 1))
                        .collect::<Result<Vec<_>, _>>()?;
                    f(&args)
                }
                (ParameterValue::Constant(v), false) => Expr::scalar(*v),
                (ParameterValue::Expression(e), false) => e.clone(),
                (ParameterValue::Input, false) => Expr::input(&name),
                (_, true) => return Err(wrong_kind("a function")),
                (_, false) => return Err(wrong_kind("a parameter")),
            };
            // Values may reference further parameters
            self.process_at_depth(&resolved, depth + 1).map(Some)
        })
    }

    /// Returns a copy of `model` with every parameter resolved.
    pub fn process_model(&self, model: &Model) -> Result<Model, ParameterError> {
        log::debug!("Processing parameters of model '{}'", model.name());
        model.map_expressions(|e| self.process_symbol(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// Electrolyte diffusivity as a function of concentration and temperature,
    /// shaped like the Landesfeind 2019 fit.
    fn electrolyte_diffusivity(args: &[Expr]) -> Expr {
        let c = &args[0] / 1000.0;
        let t = &args[1];
        let p = [1.01e3, 1.01, -1.56e3, -4.87e2];
        let exponent = p[1] * &c + (p[2] + p[3] * &c) / t;
        p[0] * exponent.exp() * 1e-10
    }

    #[test]
    fn test_constants_and_expressions() {
        let a = Expr::parameter("a");
        let b = Expr::parameter("b");
        let values = ParameterValues::new()
            .with_constant("a", 2.0)
            .with_expression("b", Expr::parameter("a") * 3.0);

        let processed = values.process_symbol(&(&a + &b)).unwrap();
        assert!(processed.is_constant());
        assert_eq!(processed.evaluate_constant().unwrap(), vec![8.0]);
    }

    #[test]
    fn test_inputs_stay_open() {
        let k = Expr::parameter("k");
        let values = ParameterValues::new().with_input("k");
        let processed = values.process_symbol(&(&k * 2.0)).unwrap();

        assert_eq!(processed.input_names().into_iter().collect::<Vec<_>>(), vec!["k".to_string()]);
        let mut inputs = Inputs::new();
        inputs.insert("k".to_string(), 3.0);
        assert_eq!(processed.evaluate(0.0, &[], &inputs).unwrap(), vec![6.0]);
    }

    #[test]
    fn test_function_parameter() {
        let c = Expr::parameter("c");
        let temperature = Expr::parameter("T");
        let d = Expr::function_parameter("D_e", vec![c, temperature]);
        let values = ParameterValues::new()
            .with_constant("c", 1000.0)
            .with_constant("T", 298.15)
            .with_function("D_e", electrolyte_diffusivity);

        let processed = values.process_symbol(&d).unwrap();
        let value = processed.evaluate_constant().unwrap()[0];

        let expected = 1.01e3 * (1.01 + (-1.56e3 - 4.87e2) / 298.15_f64).exp() * 1e-10;
        assert_relative_eq!(value, expected, max_relative = 1e-12);
    }

    #[test]
    fn test_missing_and_wrong_kind() {
        let values = ParameterValues::new().with_constant("a", 1.0);

        let err = values.process_symbol(&Expr::parameter("b")).unwrap_err();
        assert_eq!(err, ParameterError::Missing("b".to_string()));

        let err = values
            .process_symbol(&Expr::function_parameter("a", vec![Expr::scalar(1.0)]))
            .unwrap_err();
        assert!(matches!(err, ParameterError::WrongKind { used: "a function", .. }));
    }

    #[test]
    fn test_self_reference_is_reported() {
        let values = ParameterValues::new().with_expression("a", Expr::parameter("a") + 1.0);
        let err = values.process_symbol(&Expr::parameter("a")).unwrap_err();
        assert_eq!(err, ParameterError::Recursive("a".to_string()));
    }

    #[test]
    fn test_process_model() {
        let mut model = Model::new("decay");
        let x = model.create_differential("x", None).unwrap();
        model.set_rhs(&x, -Expr::parameter("rate") * x.expr()).unwrap();
        model.set_initial_condition(&x, Expr::parameter("x0")).unwrap();

        let values = ParameterValues::new().with_constant("rate", 0.5).with_constant("x0", 2.0);
        let processed = values.process_model(&model).unwrap();

        assert_eq!(processed.initial_condition("x"), Some(&Expr::scalar(2.0)));
        assert_eq!(processed.rhs("x"), Some(&(-0.5 * x.expr())));
        // The original model keeps its placeholders
        assert_eq!(model.initial_condition("x"), Some(&Expr::parameter("x0")));
    }
}
