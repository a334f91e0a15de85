//! Symbolic models.
//!
//! A [`Model`] owns the equations of a system before discretisation:
//!
//! - a right-hand side for every differential unknown, `du/dt = f(...)`
//! - an equation for every algebraic unknown, `0 = g(...)`
//! - an initial condition for every unknown
//! - boundary conditions for spatial unknowns
//! - named output expressions
//! - events
//!
//! Unknowns carry their role in the type. Only an [`Unknown<Differential>`]
//! accepts a right-hand side and only an [`Unknown<Algebraic>`] accepts an
//! algebraic equation:
//!
//! ```
//! use symdae::model::Model;
//!
//! let mut model = Model::new("decay");
//! let x = model.create_differential("x", None).unwrap();
//! model.set_rhs(&x, -x.expr()).unwrap();
//! model.set_initial_condition(&x, 1.0).unwrap();
//! ```
//!
//! The following does not compile, since algebraic unknowns have no time derivative:
//!
//! ```compile_fail
//! use symdae::model::Model;
//!
//! let mut model = Model::new("constraint");
//! let v = model.create_algebraic("v", None).unwrap();
//! model.set_rhs(&v, 1.0).unwrap();
//! ```

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::ops::Deref;

use crate::expression::{Expr, ExpressionError, Shape, Side};

/// Result type for model construction.
pub type ModelResult<T> = Result<T, ModelError>;

/// Errors raised while building a model.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ModelError {
    /// An unknown was declared twice with a different role or domain
    #[error("Unknown '{name}' is already declared as {existing}, cannot redeclare it as {requested}")]
    DuplicateSymbol {
        /// Unknown name
        name: String,
        /// Description of the existing declaration
        existing: String,
        /// Description of the rejected declaration
        requested: String,
    },
    /// An expression refers to an unknown the model never declared
    #[error("Expression for '{context}' refers to undeclared unknown '{name}'")]
    UndeclaredVariable {
        /// Where the reference was found
        context: String,
        /// Name of the undeclared unknown
        name: String,
    },
    /// A differential unknown has no right-hand side or an algebraic unknown has no equation
    #[error("Unknown '{0}' has no equation")]
    MissingEquation(String),
    /// An unknown has no initial condition
    #[error("Unknown '{0}' has no initial condition")]
    MissingInitialCondition(String),
    /// Boundary conditions only apply to unknowns on a spatial domain
    #[error("Unknown '{0}' has no spatial domain, so it cannot take boundary conditions")]
    NotSpatial(String),
    /// An equation has a shape the unknown cannot hold
    #[error("Equation for '{name}' has shape {found}, but the unknown has shape {expected}")]
    EquationShape {
        /// Unknown name
        name: String,
        /// Shape of the unknown
        expected: Shape,
        /// Shape of the equation
        found: Shape,
    },
    /// Two events share a name
    #[error("An event named '{0}' already exists")]
    DuplicateEvent(String),
    /// Malformed expression
    #[error(transparent)]
    Expression(#[from] ExpressionError),
}

/// Marker trait for the role an unknown plays in a model.
pub trait Role {
    /// Human-readable role name.
    const NAME: &'static str;
}

/// Role of unknowns governed by a time derivative.
#[derive(Debug, Clone, Copy)]
pub struct Differential;
impl Role for Differential {
    const NAME: &'static str = "differential";
}

/// Role of unknowns governed by an instantaneous constraint.
#[derive(Debug, Clone, Copy)]
pub struct Algebraic;
impl Role for Algebraic {
    const NAME: &'static str = "algebraic";
}

/// A typed handle to a model unknown.
///
/// Dereferences to the underlying variable [`Expr`] so it can be used directly
/// in expressions.
#[derive(Debug, Clone)]
pub struct Unknown<R: Role> {
    expr: Expr,
    _role: PhantomData<R>,
}

impl<R: Role> Unknown<R> {
    fn new(name: &str, domain: Option<&str>) -> Self {
        Unknown { expr: Expr::variable(name, domain), _role: PhantomData }
    }

    /// The variable expression.
    pub fn expr(&self) -> &Expr {
        &self.expr
    }

    /// Unknown name.
    pub fn name(&self) -> &str {
        self.expr.name().unwrap_or_default()
    }

    /// Spatial domain, if any.
    pub fn domain(&self) -> Option<&str> {
        self.expr.domain()
    }
}

impl<R: Role> Deref for Unknown<R> {
    type Target = Expr;

    fn deref(&self) -> &Expr {
        &self.expr
    }
}

impl<R: Role> From<&Unknown<R>> for Expr {
    fn from(value: &Unknown<R>) -> Self {
        value.expr.clone()
    }
}

/// Declaration of an unknown, in declaration order.
#[derive(Debug, Clone, PartialEq)]
pub struct Declaration {
    /// Unknown name
    pub name: String,
    /// Spatial domain, `None` for lumped unknowns
    pub domain: Option<String>,
    /// Role name, `"differential"` or `"algebraic"`
    pub role: &'static str,
}

impl Declaration {
    /// Returns true for differential unknowns.
    pub fn is_differential(&self) -> bool {
        self.role == Differential::NAME
    }

    fn describe(&self) -> String {
        match &self.domain {
            Some(d) => format!("{} on '{}'", self.role, d),
            None => self.role.to_string(),
        }
    }
}

/// Boundary condition on one end of a spatial unknown's domain.
#[derive(Debug, Clone, PartialEq)]
pub enum BoundaryCondition {
    /// Prescribed value
    Dirichlet(Expr),
    /// Prescribed derivative `du/dx`
    Neumann(Expr),
    /// `alpha * u + beta * du/dn = gamma`, with `n` the outward normal
    Robin {
        /// Weight of the value
        alpha: f64,
        /// Weight of the outward normal derivative
        beta: f64,
        /// Right-hand side
        gamma: Expr,
    },
}

impl BoundaryCondition {
    /// Prescribed value.
    pub fn dirichlet(value: impl Into<Expr>) -> Self {
        BoundaryCondition::Dirichlet(value.into())
    }

    /// Prescribed derivative along the domain coordinate.
    pub fn neumann(value: impl Into<Expr>) -> Self {
        BoundaryCondition::Neumann(value.into())
    }

    /// Mixed condition `alpha * u + beta * du/dn = gamma`.
    pub fn robin(alpha: f64, beta: f64, gamma: impl Into<Expr>) -> Self {
        BoundaryCondition::Robin { alpha, beta, gamma: gamma.into() }
    }

    /// The expression carried by the condition.
    pub fn value(&self) -> &Expr {
        match self {
            BoundaryCondition::Dirichlet(v) | BoundaryCondition::Neumann(v) => v,
            BoundaryCondition::Robin { gamma, .. } => gamma,
        }
    }

    /// Same condition with a new expression.
    pub fn with_value(&self, value: Expr) -> Self {
        match self {
            BoundaryCondition::Dirichlet(_) => BoundaryCondition::Dirichlet(value),
            BoundaryCondition::Neumann(_) => BoundaryCondition::Neumann(value),
            BoundaryCondition::Robin { alpha, beta, .. } => {
                BoundaryCondition::Robin { alpha: *alpha, beta: *beta, gamma: value }
            }
        }
    }
}

/// What happens when an event expression crosses zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Integration stops at the crossing
    Terminating,
    /// The crossing is recorded and integration continues
    NonTerminating,
}

/// A named scalar expression whose zero crossings are tracked during integration.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// Event name
    pub name: String,
    /// Scalar expression
    pub expression: Expr,
    /// Termination class
    pub kind: EventKind,
}

impl Event {
    /// Event that stops integration.
    pub fn terminating(name: &str, expression: impl Into<Expr>) -> Self {
        Event { name: name.to_string(), expression: expression.into(), kind: EventKind::Terminating }
    }

    /// Event that is only recorded.
    pub fn non_terminating(name: &str, expression: impl Into<Expr>) -> Self {
        Event {
            name: name.to_string(),
            expression: expression.into(),
            kind: EventKind::NonTerminating,
        }
    }
}

/// A symbolic model.
#[derive(Debug, Clone)]
pub struct Model {
    name: String,
    declarations: Vec<Declaration>,
    rhs: Vec<(String, Expr)>,
    algebraic: Vec<(String, Expr)>,
    initial_conditions: Vec<(String, Expr)>,
    boundary_conditions: BTreeMap<String, BTreeMap<Side, BoundaryCondition>>,
    outputs: Vec<(String, Expr)>,
    events: Vec<Event>,
}

fn upsert(entries: &mut Vec<(String, Expr)>, name: &str, expr: Expr) {
    match entries.iter_mut().find(|(n, _)| n == name) {
        Some(entry) => entry.1 = expr,
        None => entries.push((name.to_string(), expr)),
    }
}

fn lookup<'a>(entries: &'a [(String, Expr)], name: &str) -> Option<&'a Expr> {
    entries.iter().find(|(n, _)| n == name).map(|(_, e)| e)
}

impl Model {
    /// Creates an empty model.
    pub fn new(name: &str) -> Self {
        Model {
            name: name.to_string(),
            declarations: Vec::new(),
            rhs: Vec::new(),
            algebraic: Vec::new(),
            initial_conditions: Vec::new(),
            boundary_conditions: BTreeMap::new(),
            outputs: Vec::new(),
            events: Vec::new(),
        }
    }

    /// Model name.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn declare<R: Role>(&mut self, name: &str, domain: Option<&str>) -> ModelResult<Unknown<R>> {
        let requested = Declaration {
            name: name.to_string(),
            domain: domain.map(str::to_string),
            role: R::NAME,
        };
        if let Some(existing) = self.declarations.iter().find(|d| d.name == name) {
            if *existing != requested {
                return Err(ModelError::DuplicateSymbol {
                    name: name.to_string(),
                    existing: existing.describe(),
                    requested: requested.describe(),
                });
            }
        } else {
            self.declarations.push(requested);
        }
        Ok(Unknown::new(name, domain))
    }

    /// Declares an unknown governed by a time derivative.
    ///
    /// Declaring the same name again with the same domain returns a new handle
    /// to the same unknown.
    pub fn create_differential(
        &mut self,
        name: &str,
        domain: Option<&str>,
    ) -> ModelResult<Unknown<Differential>> {
        self.declare(name, domain)
    }

    /// Declares an unknown governed by an algebraic constraint.
    pub fn create_algebraic(
        &mut self,
        name: &str,
        domain: Option<&str>,
    ) -> ModelResult<Unknown<Algebraic>> {
        self.declare(name, domain)
    }

    fn check_equation<R: Role>(&self, unknown: &Unknown<R>, expr: &Expr) -> ModelResult<()> {
        let found = expr.shape()?;
        let expected = unknown.expr.shape()?;
        // Plain vectors on a field are sized by the mesh, so their length is checked on discretisation
        let fits = found.is_scalar()
            || found == expected
            || matches!((found, expected), (Shape::Vector(_), Shape::Field { .. }))
            || matches!((found, expected), (Shape::Vector(n), Shape::Vector(m)) if n == m);
        if !fits {
            return Err(ModelError::EquationShape {
                name: unknown.name().to_string(),
                expected: expected.clone(),
                found: found.clone(),
            });
        }
        self.check_declared(unknown.name(), expr)
    }

    fn check_declared(&self, context: &str, expr: &Expr) -> ModelResult<()> {
        for name in expr.variable_names() {
            if !self.declarations.iter().any(|d| d.name == name) {
                return Err(ModelError::UndeclaredVariable { context: context.to_string(), name });
            }
        }
        Ok(())
    }

    /// Sets `du/dt = rhs`.
    pub fn set_rhs(&mut self, unknown: &Unknown<Differential>, rhs: impl Into<Expr>) -> ModelResult<()> {
        let rhs = rhs.into();
        self.check_equation(unknown, &rhs)?;
        upsert(&mut self.rhs, unknown.name(), rhs);
        Ok(())
    }

    /// Sets `0 = equation`.
    pub fn set_algebraic(
        &mut self,
        unknown: &Unknown<Algebraic>,
        equation: impl Into<Expr>,
    ) -> ModelResult<()> {
        let equation = equation.into();
        self.check_equation(unknown, &equation)?;
        upsert(&mut self.algebraic, unknown.name(), equation);
        Ok(())
    }

    /// Sets the initial condition of an unknown.
    ///
    /// For algebraic unknowns this is an initial guess that the solver makes
    /// consistent with the constraints.
    pub fn set_initial_condition<R: Role>(
        &mut self,
        unknown: &Unknown<R>,
        value: impl Into<Expr>,
    ) -> ModelResult<()> {
        let value = value.into();
        self.check_equation(unknown, &value)?;
        upsert(&mut self.initial_conditions, unknown.name(), value);
        Ok(())
    }

    /// Sets the boundary condition on one side of a spatial unknown.
    pub fn set_boundary_condition<R: Role>(
        &mut self,
        unknown: &Unknown<R>,
        side: Side,
        condition: BoundaryCondition,
    ) -> ModelResult<()> {
        if unknown.domain().is_none() {
            return Err(ModelError::NotSpatial(unknown.name().to_string()));
        }
        let value = condition.value();
        if !value.shape()?.is_scalar() {
            return Err(ModelError::EquationShape {
                name: format!("{} {} boundary", unknown.name(), side),
                expected: Shape::Scalar,
                found: value.shape()?.clone(),
            });
        }
        self.check_declared(unknown.name(), value)?;
        self.boundary_conditions
            .entry(unknown.name().to_string())
            .or_default()
            .insert(side, condition);
        Ok(())
    }

    /// Adds (or replaces) a named output expression.
    pub fn add_output(&mut self, name: &str, expr: impl Into<Expr>) -> ModelResult<()> {
        let expr = expr.into();
        expr.check()?;
        self.check_declared(name, &expr)?;
        upsert(&mut self.outputs, name, expr);
        Ok(())
    }

    /// Adds an event. Event expressions must be scalar.
    pub fn add_event(&mut self, event: Event) -> ModelResult<()> {
        let shape = event.expression.shape()?;
        if !shape.is_scalar() {
            return Err(ModelError::EquationShape {
                name: event.name.clone(),
                expected: Shape::Scalar,
                found: shape.clone(),
            });
        }
        if self.events.iter().any(|e| e.name == event.name) {
            return Err(ModelError::DuplicateEvent(event.name));
        }
        self.check_declared(&event.name, &event.expression)?;
        self.events.push(event);
        Ok(())
    }

    /// Declared unknowns, in declaration order.
    pub fn declarations(&self) -> &[Declaration] {
        &self.declarations
    }

    /// Differential unknowns, in declaration order.
    pub fn differential_unknowns(&self) -> impl Iterator<Item = &Declaration> {
        self.declarations.iter().filter(|d| d.is_differential())
    }

    /// Algebraic unknowns, in declaration order.
    pub fn algebraic_unknowns(&self) -> impl Iterator<Item = &Declaration> {
        self.declarations.iter().filter(|d| !d.is_differential())
    }

    /// Right-hand side of a differential unknown.
    pub fn rhs(&self, name: &str) -> Option<&Expr> {
        lookup(&self.rhs, name)
    }

    /// Equation of an algebraic unknown.
    pub fn algebraic(&self, name: &str) -> Option<&Expr> {
        lookup(&self.algebraic, name)
    }

    /// Initial condition of an unknown.
    pub fn initial_condition(&self, name: &str) -> Option<&Expr> {
        lookup(&self.initial_conditions, name)
    }

    /// Boundary conditions of a spatial unknown.
    pub fn boundary_conditions(&self, name: &str) -> Option<&BTreeMap<Side, BoundaryCondition>> {
        self.boundary_conditions.get(name)
    }

    /// Named outputs, in insertion order.
    pub fn outputs(&self) -> &[(String, Expr)] {
        &self.outputs
    }

    /// Events, in declaration order.
    pub fn events(&self) -> &[Event] {
        &self.events
    }

    /// Checks that every unknown has an equation and an initial condition.
    pub fn check_well_posedness(&self) -> ModelResult<()> {
        for decl in &self.declarations {
            let equation = if decl.is_differential() {
                self.rhs(&decl.name)
            } else {
                self.algebraic(&decl.name)
            };
            if equation.is_none() {
                return Err(ModelError::MissingEquation(decl.name.clone()));
            }
            if self.initial_condition(&decl.name).is_none() {
                return Err(ModelError::MissingInitialCondition(decl.name.clone()));
            }
        }
        Ok(())
    }

    /// Returns a copy of the model with `f` applied to every expression.
    ///
    /// Unknown declarations are kept as they are.
    pub fn map_expressions<E>(&self, mut f: impl FnMut(&Expr) -> Result<Expr, E>) -> Result<Model, E> {
        let mut map_all = |entries: &[(String, Expr)]| -> Result<Vec<(String, Expr)>, E> {
            entries.iter().map(|(n, e)| Ok((n.clone(), f(e)?))).collect()
        };
        let rhs = map_all(&self.rhs)?;
        let algebraic = map_all(&self.algebraic)?;
        let initial_conditions = map_all(&self.initial_conditions)?;
        let outputs = map_all(&self.outputs)?;

        let mut boundary_conditions = BTreeMap::new();
        for (name, sides) in &self.boundary_conditions {
            let mut mapped = BTreeMap::new();
            for (side, bc) in sides {
                mapped.insert(*side, bc.with_value(f(bc.value())?));
            }
            boundary_conditions.insert(name.clone(), mapped);
        }

        let events = self
            .events
            .iter()
            .map(|e| Ok(Event { name: e.name.clone(), expression: f(&e.expression)?, kind: e.kind }))
            .collect::<Result<Vec<_>, E>>()?;

        Ok(Model {
            name: self.name.clone(),
            declarations: self.declarations.clone(),
            rhs,
            algebraic,
            initial_conditions,
            boundary_conditions,
            outputs,
            events,
        })
    }
}
