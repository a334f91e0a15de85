//! Discretisation of symbolic models.
//!
//! The [`Discretiser`] binds a [`Model`] to a [`Mesh`] and a spatial method
//! per domain, and produces a [`DiscretisedSystem`]:
//!
//! 1. Every unknown gets a range of the flat state vector, in declaration
//!    order. Equation rows follow the same layout, so row `i` belongs to the
//!    unknown owning state entry `i`.
//! 2. Every variable node is replaced by a state-vector slice and every
//!    spatial operator by the discrete operator of its domain.
//! 3. The mass matrix is assembled: identity on differential rows, zero on
//!    algebraic rows.
//! 4. Equations, events, initial conditions and outputs are compiled into
//!    evaluation tapes. Initial conditions that need no inputs are evaluated
//!    once, at `t = 0`.
//!
//! The model is never modified, so the same model can be discretised against
//! several meshes.
//!
//! # Example
//!
//! ```ignore
//! let disc = Discretiser::new(mesh).with_spatial_method("rod", FiniteVolume::new());
//! let system = disc.process(&model)?;
//!
//! let f = system.rhs(0.0, &system.initial_state(&Inputs::new())?, &Inputs::new())?;
//! ```

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use nalgebra::DMatrix;
use nalgebra_sparse::{CooMatrix, CsrMatrix};
use num_dual::DualNum;

use crate::autodiff::{compute_jacobian, compute_jacobian_columns};
use crate::expression::{Expr, ExpressionError, ExpressionResult, Kind, Location, Shape, SpatialOp, Tape};
use crate::mesh::{Mesh, MeshError, Submesh1D};
use crate::model::{EventKind, Model, ModelError};
use crate::parameters::Inputs;
use crate::registry::MethodRegistry;
use crate::spatial::{BoundaryConditions, SpatialError, SpatialMethod};
use crate::symbols::{StateVectorMapping, SymbolError};

/// Result type for discretisation.
pub type DiscretisationResult<T> = Result<T, DiscretisationError>;

/// Errors raised while discretising a model.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DiscretisationError {
    /// An unknown has an equation but no initial condition
    #[error("Unknown '{0}' has no initial condition")]
    MissingInitialCondition(String),
    /// An initial condition refers to unknowns
    #[error("Initial condition of '{0}' must not depend on the state")]
    StatefulInitialCondition(String),
    /// A spatial operator acts on a domain without a submesh or a spatial method
    #[error("Cannot discretise '{op}' on domain '{domain}': no submesh or spatial method for it")]
    UndiscretisedSpatialOperator {
        /// Operator name
        op: String,
        /// Domain name
        domain: String,
    },
    /// A spatial unknown lives on a domain the mesh does not cover
    #[error("Unknown '{variable}' lives on domain '{domain}', which has no submesh")]
    MissingSubmesh {
        /// Unknown name
        variable: String,
        /// Domain name
        domain: String,
    },
    /// A discretised equation does not match the size of its unknown
    #[error("Discretised expression for '{name}' has {found} entries, expected {expected}")]
    ShapeMismatch {
        /// Unknown, output or event name
        name: String,
        /// Size of the unknown
        expected: usize,
        /// Size of the expression
        found: usize,
    },
    /// The model declares no unknowns
    #[error("Model '{0}' has no unknowns")]
    EmptyModel(String),
    /// Invalid model
    #[error(transparent)]
    Model(#[from] ModelError),
    /// Invalid expression
    #[error(transparent)]
    Expression(#[from] ExpressionError),
    /// Inconsistent state-vector layout
    #[error(transparent)]
    Symbol(#[from] SymbolError),
    /// Invalid mesh
    #[error(transparent)]
    Mesh(#[from] MeshError),
    /// Spatial operator failure
    #[error(transparent)]
    Spatial(#[from] SpatialError),
}

/// A discretised output expression.
#[derive(Debug, Clone)]
pub struct OutputVariable {
    name: String,
    expression: Expr,
    tape: Tape,
    domain: Option<String>,
    positions: Option<Vec<f64>>,
    bounds: Option<(f64, f64)>,
}

impl OutputVariable {
    /// Output name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Discretised expression.
    pub fn expression(&self) -> &Expr {
        &self.expression
    }

    /// Domain of a spatial output.
    pub fn domain(&self) -> Option<&str> {
        self.domain.as_deref()
    }

    /// Positions of the values of a spatial output (cell centres or edges).
    pub fn positions(&self) -> Option<&[f64]> {
        self.positions.as_deref()
    }

    /// First and last mesh edge of a spatial output's domain.
    pub fn bounds(&self) -> Option<(f64, f64)> {
        self.bounds
    }

    /// Returns true for outputs with one value per position.
    pub fn is_spatial(&self) -> bool {
        self.positions.is_some()
    }

    /// Number of values.
    pub fn len(&self) -> usize {
        self.tape.output_len()
    }

    /// Returns true if the output has no values.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Input names the output reads.
    pub fn required_inputs(&self) -> &BTreeSet<String> {
        self.tape.required_inputs()
    }

    /// Evaluates the output on a state vector.
    pub fn evaluate(&self, t: f64, y: &[f64], inputs: &Inputs) -> ExpressionResult<Vec<f64>> {
        self.tape.evaluate_flat(t, y, inputs)
    }
}

/// Discretised outputs by name, in insertion order.
#[derive(Debug, Clone, Default)]
pub struct OutputTable {
    variables: Vec<OutputVariable>,
    index: HashMap<String, usize>,
}

impl OutputTable {
    fn push(&mut self, variable: OutputVariable) {
        if !self.index.contains_key(&variable.name) {
            self.index.insert(variable.name.clone(), self.variables.len());
            self.variables.push(variable);
        }
    }

    /// Output called `name`.
    pub fn get(&self, name: &str) -> Option<&OutputVariable> {
        self.index.get(name).map(|&i| &self.variables[i])
    }

    /// Output names, in insertion order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.variables.iter().map(|v| v.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.variables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }
}

/// Name and class of a discretised event.
#[derive(Debug, Clone, PartialEq)]
pub struct EventInfo {
    /// Event name
    pub name: String,
    /// Termination class
    pub kind: EventKind,
}

#[derive(Debug, Clone)]
enum InitialState {
    Evaluated(Vec<f64>),
    Deferred(Tape),
}

/// A model bound to a mesh: `M * dy/dt = F(t, y, inputs)`.
///
/// Differential and algebraic rows interleave as their unknowns were
/// declared; [`DiscretisedSystem::differential_mask`] tells them apart.
#[derive(Debug, Clone)]
pub struct DiscretisedSystem {
    name: String,
    mapping: StateVectorMapping,
    differential: Vec<bool>,
    differential_rows: Vec<usize>,
    algebraic_rows: Vec<usize>,
    equations: Tape,
    mass_matrix: CsrMatrix<f64>,
    initial_state: InitialState,
    events: Vec<EventInfo>,
    event_tape: Tape,
    outputs: Arc<OutputTable>,
    required_inputs: BTreeSet<String>,
}

impl DiscretisedSystem {
    /// Model name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Length of the state vector.
    pub fn len(&self) -> usize {
        self.mapping.len()
    }

    /// Returns true if the system has no unknowns.
    pub fn is_empty(&self) -> bool {
        self.mapping.is_empty()
    }

    /// Number of differential entries.
    pub fn n_differential(&self) -> usize {
        self.differential_rows.len()
    }

    /// Number of algebraic entries.
    pub fn n_algebraic(&self) -> usize {
        self.algebraic_rows.len()
    }

    /// `true` for every row (and state entry) with a time derivative.
    pub fn differential_mask(&self) -> &[bool] {
        &self.differential
    }

    /// Indices of the differential rows, increasing.
    pub fn differential_rows(&self) -> &[usize] {
        &self.differential_rows
    }

    /// Indices of the algebraic rows, increasing.
    pub fn algebraic_rows(&self) -> &[usize] {
        &self.algebraic_rows
    }

    /// State-vector layout.
    pub fn mapping(&self) -> &StateVectorMapping {
        &self.mapping
    }

    /// Mass matrix `M`.
    pub fn mass_matrix(&self) -> &CsrMatrix<f64> {
        &self.mass_matrix
    }

    /// Discretised outputs, shared with every solution of this system.
    pub fn outputs(&self) -> &Arc<OutputTable> {
        &self.outputs
    }

    /// Events, in declaration order.
    pub fn events(&self) -> &[EventInfo] {
        &self.events
    }

    /// Input names needed to evaluate the system and its outputs.
    pub fn required_inputs(&self) -> &BTreeSet<String> {
        &self.required_inputs
    }

    /// Fails with [`ExpressionError::MissingInput`] for the first required input not in `inputs`.
    pub fn check_inputs(&self, inputs: &Inputs) -> ExpressionResult<()> {
        match self.required_inputs.iter().find(|name| !inputs.contains_key(*name)) {
            Some(name) => Err(ExpressionError::MissingInput(name.clone())),
            None => Ok(()),
        }
    }

    /// All equations, one row per state entry.
    pub fn equations<T: DualNum<f64>>(
        &self,
        t: f64,
        y: &[T],
        inputs: &Inputs,
    ) -> ExpressionResult<Vec<T>> {
        self.equations.evaluate_flat(t, y, inputs)
    }

    /// Right-hand side `f` of the differential rows.
    pub fn rhs<T: DualNum<f64>>(&self, t: f64, y: &[T], inputs: &Inputs) -> ExpressionResult<Vec<T>> {
        let f = self.equations(t, y, inputs)?;
        Ok(self.differential_rows.iter().map(|&i| f[i].clone()).collect())
    }

    /// Algebraic residuals `g`.
    pub fn algebraic<T: DualNum<f64>>(
        &self,
        t: f64,
        y: &[T],
        inputs: &Inputs,
    ) -> ExpressionResult<Vec<T>> {
        let f = self.equations(t, y, inputs)?;
        Ok(self.algebraic_rows.iter().map(|&i| f[i].clone()).collect())
    }

    /// Implicit residual `M * ydot - F(t, y)`.
    pub fn residual(
        &self,
        t: f64,
        y: &[f64],
        ydot: &[f64],
        inputs: &Inputs,
    ) -> ExpressionResult<Vec<f64>> {
        let f = self.equations(t, y, inputs)?;
        Ok(self
            .mass_matrix
            .row_iter()
            .zip(f)
            .map(|(row, fi)| {
                let m_ydot: f64 =
                    row.col_indices().iter().zip(row.values()).map(|(&j, &v)| v * ydot[j]).sum();
                m_ydot - fi
            })
            .collect())
    }

    /// Dense Jacobian `dF/dy`.
    pub fn jacobian(&self, t: f64, y: &[f64], inputs: &Inputs) -> ExpressionResult<DMatrix<f64>> {
        compute_jacobian(|yd| self.equations(t, yd, inputs), y).map(|j| j.to_dmatrix())
    }

    /// Jacobian `dF/dy` restricted to the state entries in `columns`.
    pub fn jacobian_columns(
        &self,
        t: f64,
        y: &[f64],
        inputs: &Inputs,
        columns: &[usize],
    ) -> ExpressionResult<DMatrix<f64>> {
        compute_jacobian_columns(|yd| self.equations(t, yd, inputs), y, columns).map(|j| j.to_dmatrix())
    }

    /// Sparse Jacobian `dF/dy`.
    pub fn jacobian_sparse(
        &self,
        t: f64,
        y: &[f64],
        inputs: &Inputs,
    ) -> ExpressionResult<CsrMatrix<f64>> {
        compute_jacobian(|yd| self.equations(t, yd, inputs), y).map(|j| j.to_csr())
    }

    /// Initial state vector, before any consistency correction.
    pub fn initial_state(&self, inputs: &Inputs) -> ExpressionResult<Vec<f64>> {
        match &self.initial_state {
            InitialState::Evaluated(y0) => Ok(y0.clone()),
            InitialState::Deferred(tape) => tape.evaluate_flat(0.0, &[] as &[f64], inputs),
        }
    }

    /// Values of every event expression, in declaration order.
    pub fn event_values(&self, t: f64, y: &[f64], inputs: &Inputs) -> ExpressionResult<Vec<f64>> {
        self.event_tape.evaluate_flat(t, y, inputs)
    }
}

/// Binds models to a mesh and spatial methods.
#[derive(Clone)]
pub struct Discretiser {
    mesh: Mesh,
    spatial_methods: BTreeMap<String, Arc<dyn SpatialMethod>>,
    registry: Option<MethodRegistry>,
}

impl std::fmt::Debug for Discretiser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Discretiser")
            .field("mesh", &self.mesh)
            .field("spatial_methods", &self.spatial_methods.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Default for Discretiser {
    /// Discretiser over an empty mesh, for models without spatial unknowns.
    fn default() -> Self {
        Self::new(Mesh::new())
    }
}

/// Per-run state of a discretisation pass.
struct Pass<'a> {
    discretiser: &'a Discretiser,
    model: &'a Model,
    mapping: &'a StateVectorMapping,
    cache: RefCell<HashMap<Expr, Expr>>,
    used_methods: RefCell<BTreeSet<String>>,
}

impl Discretiser {
    /// Creates a discretiser over `mesh` with no spatial methods.
    pub fn new(mesh: Mesh) -> Self {
        Discretiser { mesh, spatial_methods: BTreeMap::new(), registry: None }
    }

    /// Uses `method` for spatial operators on `domain`.
    pub fn with_spatial_method(mut self, domain: &str, method: impl SpatialMethod + 'static) -> Self {
        self.spatial_methods.insert(domain.to_string(), Arc::new(method));
        self
    }

    /// Records the spatial methods used into `registry`.
    pub fn with_registry(mut self, registry: MethodRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn mesh(&self) -> &Mesh {
        &self.mesh
    }

    fn submesh(&self, domain: &str) -> Option<&Submesh1D> {
        self.mesh.get(domain)
    }

    /// Discretises `model`.
    pub fn process(&self, model: &Model) -> DiscretisationResult<DiscretisedSystem> {
        model.check_well_posedness().map_err(|e| match e {
            ModelError::MissingInitialCondition(name) => DiscretisationError::MissingInitialCondition(name),
            other => other.into(),
        })?;
        if model.declarations().is_empty() {
            return Err(DiscretisationError::EmptyModel(model.name().to_string()));
        }

        let ordered = model.declarations();
        let mut mapping = StateVectorMapping::new();
        let mut differential = Vec::new();
        for decl in ordered {
            let size = match &decl.domain {
                None => 1,
                Some(domain) => self
                    .submesh(domain)
                    .ok_or_else(|| DiscretisationError::MissingSubmesh {
                        variable: decl.name.clone(),
                        domain: domain.clone(),
                    })?
                    .npts(),
            };
            let range = mapping.register(&decl.name, size)?;
            log::debug!("'{}' ({}) -> y[{}..{}]", decl.name, decl.role, range.start, range.end);
            differential.resize(range.end, decl.is_differential());
        }
        let (differential_rows, algebraic_rows): (Vec<usize>, Vec<usize>) =
            (0..differential.len()).partition(|&i| differential[i]);

        let pass = Pass {
            discretiser: self,
            model,
            mapping: &mapping,
            cache: RefCell::new(HashMap::new()),
            used_methods: RefCell::new(BTreeSet::new()),
        };

        let mut equations = Vec::with_capacity(ordered.len());
        let mut initial = Vec::with_capacity(ordered.len());
        for decl in ordered {
            let size = mapping.slice_of(&decl.name).map_or(0, |r| r.len());
            let equation = if decl.is_differential() {
                model.rhs(&decl.name)
            } else {
                model.algebraic(&decl.name)
            }
            .ok_or_else(|| ModelError::MissingEquation(decl.name.clone()))?;
            equations.push(pass.sized(&decl.name, &pass.discretise(equation)?, size)?);

            let ic = model
                .initial_condition(&decl.name)
                .ok_or_else(|| DiscretisationError::MissingInitialCondition(decl.name.clone()))?;
            if !ic.variable_names().is_empty() {
                return Err(DiscretisationError::StatefulInitialCondition(decl.name.clone()));
            }
            initial.push(pass.sized(&decl.name, &pass.discretise(ic)?, size)?);
        }
        let equations = Tape::compile(&equations)?;

        let initial_tape = Tape::compile(&initial)?;
        let initial_state = if initial_tape.required_inputs().is_empty() {
            InitialState::Evaluated(initial_tape.evaluate_flat(0.0, &[] as &[f64], &Inputs::new())?)
        } else {
            InitialState::Deferred(initial_tape.clone())
        };

        let mut event_exprs = Vec::with_capacity(model.events().len());
        let mut events = Vec::with_capacity(model.events().len());
        for event in model.events() {
            event_exprs.push(pass.sized(&event.name, &pass.discretise(&event.expression)?, 1)?);
            events.push(EventInfo { name: event.name.clone(), kind: event.kind });
        }
        let event_tape = Tape::compile(&event_exprs)?;

        let mut outputs = OutputTable::default();
        for (name, expr) in model.outputs() {
            outputs.push(pass.output(name, expr)?);
        }
        for decl in ordered {
            let variable = Expr::variable(&decl.name, decl.domain.as_deref());
            outputs.push(pass.output(&decl.name, &variable)?);
        }

        let mut required_inputs = BTreeSet::new();
        required_inputs.extend(equations.required_inputs().iter().cloned());
        required_inputs.extend(initial_tape.required_inputs().iter().cloned());
        required_inputs.extend(event_tape.required_inputs().iter().cloned());
        for variable in &outputs.variables {
            required_inputs.extend(variable.required_inputs().iter().cloned());
        }

        let n = mapping.len();
        let mut coo = CooMatrix::new(n, n);
        for &i in &differential_rows {
            coo.push(i, i, 1.0);
        }

        if let Some(registry) = &self.registry {
            for method in pass.used_methods.borrow().iter() {
                registry.register(method);
            }
        }
        log::debug!(
            "Discretised '{}': {} differential and {} algebraic entries, {} events",
            model.name(),
            differential_rows.len(),
            algebraic_rows.len(),
            events.len()
        );

        Ok(DiscretisedSystem {
            name: model.name().to_string(),
            mapping,
            differential,
            differential_rows,
            algebraic_rows,
            equations,
            mass_matrix: CsrMatrix::from(&coo),
            initial_state,
            events,
            event_tape,
            outputs: Arc::new(outputs),
            required_inputs,
        })
    }
}

impl Pass<'_> {
    /// Replaces variables and spatial operators in `expr`.
    fn discretise(&self, expr: &Expr) -> DiscretisationResult<Expr> {
        if let Some(done) = self.cache.borrow().get(expr) {
            return Ok(done.clone());
        }
        let result = expr.replace(&mut |node: &Expr| -> DiscretisationResult<Option<Expr>> {
            match node.kind() {
                Kind::Variable { name, .. } => {
                    let range = self
                        .mapping
                        .slice_of(name)
                        .ok_or_else(|| ExpressionError::UnboundVariable(name.to_string()))?;
                    Ok(Some(Expr::state_vector_slice(name, range.start, range.end)))
                }
                Kind::SpatialCoordinate(domain) => {
                    let (submesh, method) = self.method_for("x", domain)?;
                    Ok(Some(method.spatial_coordinate(submesh)))
                }
                Kind::Spatial(op) => self.spatial(op, node).map(Some),
                _ => Ok(None),
            }
        })?;
        self.cache.borrow_mut().insert(expr.clone(), result.clone());
        Ok(result)
    }

    fn method_for(
        &self,
        op: &str,
        domain: &str,
    ) -> DiscretisationResult<(&Submesh1D, &Arc<dyn SpatialMethod>)> {
        let submesh = self.discretiser.submesh(domain);
        let method = self.discretiser.spatial_methods.get(domain);
        match (submesh, method) {
            (Some(submesh), Some(method)) => {
                self.used_methods.borrow_mut().insert(method.name().to_string());
                Ok((submesh, method))
            }
            _ => Err(DiscretisationError::UndiscretisedSpatialOperator {
                op: op.to_string(),
                domain: domain.to_string(),
            }),
        }
    }

    /// Discretised boundary conditions of `child`, if it is an unknown.
    fn boundary_conditions(&self, child: &Expr) -> DiscretisationResult<Option<BoundaryConditions>> {
        let name = match child.kind() {
            Kind::Variable { name, .. } => name,
            _ => return Ok(None),
        };
        let Some(conditions) = self.model.boundary_conditions(name) else {
            return Ok(None);
        };
        let mut discretised = BoundaryConditions::new();
        for (side, bc) in conditions {
            discretised.insert(*side, bc.with_value(self.discretise(bc.value())?));
        }
        Ok(Some(discretised))
    }

    fn spatial(&self, op: &SpatialOp, node: &Expr) -> DiscretisationResult<Expr> {
        let child = &node.children()[0];
        let domain = match op {
            SpatialOp::Broadcast(domain) => domain.to_string(),
            _ => child.domain().unwrap_or_default().to_string(),
        };
        let (submesh, method) = self.method_for(&op.name(), &domain)?;
        let operand = self.discretise(child)?;
        let expr = match op {
            SpatialOp::Gradient => {
                let bcs = self.boundary_conditions(child)?;
                method.gradient(submesh, &operand, bcs.as_ref())?
            }
            SpatialOp::Divergence => method.divergence(submesh, &operand)?,
            SpatialOp::Integral => method.integral(submesh, &operand)?,
            SpatialOp::BoundaryValue(side) => {
                let bcs = self.boundary_conditions(child)?;
                method.boundary_value(submesh, &operand, *side, bcs.as_ref())?
            }
            SpatialOp::Broadcast(_) => method.broadcast(submesh, &operand)?,
            SpatialOp::FaceAverage => method.face_average(submesh, &operand)?,
        };
        Ok(expr)
    }

    /// Checks that `expr` has `size` entries, broadcasting scalars.
    fn sized(&self, name: &str, expr: &Expr, size: usize) -> DiscretisationResult<Expr> {
        let found = match expr.shape()? {
            Shape::Scalar | Shape::Vector(1) if size > 1 => {
                return Ok(Expr::vector(vec![1.0; size]) * expr);
            }
            shape => shape.len().unwrap_or(0),
        };
        if found != size {
            return Err(DiscretisationError::ShapeMismatch { name: name.to_string(), expected: size, found });
        }
        Ok(expr.clone())
    }

    fn output(&self, name: &str, expr: &Expr) -> DiscretisationResult<OutputVariable> {
        let discretised = self.discretise(expr)?;
        let tape = Tape::compile(std::slice::from_ref(&discretised))?;

        let (domain, positions, bounds) = match expr.shape()? {
            Shape::Field { domain, location } => {
                let submesh = self.discretiser.submesh(domain).ok_or_else(|| {
                    DiscretisationError::MissingSubmesh {
                        variable: name.to_string(),
                        domain: domain.to_string(),
                    }
                })?;
                let positions = match location {
                    Location::Cells => submesh.nodes().to_vec(),
                    Location::Edges => submesh.edges().to_vec(),
                };
                if positions.len() != tape.output_len() {
                    return Err(DiscretisationError::ShapeMismatch {
                        name: name.to_string(),
                        expected: positions.len(),
                        found: tape.output_len(),
                    });
                }
                let edges = submesh.edges();
                let bounds = (edges[0], edges[edges.len() - 1]);
                (Some(domain.to_string()), Some(positions), Some(bounds))
            }
            _ => (None, None, None),
        };
        Ok(OutputVariable {
            name: name.to_string(),
            expression: discretised,
            tape,
            domain,
            positions,
            bounds,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::{broadcast, div, grad, integral, Side};
    use crate::model::{BoundaryCondition, Event};
    use crate::spatial::FiniteVolume;
    use approx::assert_relative_eq;

    fn inputs() -> Inputs {
        Inputs::new()
    }

    fn lumped_model() -> Model {
        let mut model = Model::new("lumped");
        let x = model.create_differential("x", None).unwrap();
        let y = model.create_differential("y", None).unwrap();
        model.set_rhs(&x, 4.0 * x.expr() - 2.0 * y.expr()).unwrap();
        model.set_rhs(&y, 3.0 * x.expr() - y.expr()).unwrap();
        model.set_initial_condition(&x, 1.0).unwrap();
        model.set_initial_condition(&y, 2.0).unwrap();
        model.add_output("z", x.expr() + 4.0 * y.expr()).unwrap();
        model
    }

    fn diffusion_model() -> Model {
        let mut model = Model::new("diffusion");
        let c = model.create_differential("c", Some("rod")).unwrap();
        model.set_rhs(&c, div(&grad(&c))).unwrap();
        model.set_initial_condition(&c, 1.0).unwrap();
        model.set_boundary_condition(&c, Side::Left, BoundaryCondition::neumann(0.0)).unwrap();
        model.set_boundary_condition(&c, Side::Right, BoundaryCondition::dirichlet(0.0)).unwrap();
        model.add_output("total", integral(&c)).unwrap();
        model
    }

    fn rod(npts: usize) -> Discretiser {
        let mesh = Mesh::new().with_submesh("rod", Submesh1D::uniform(0.0, 1.0, npts).unwrap());
        Discretiser::new(mesh).with_spatial_method("rod", FiniteVolume::new())
    }

    #[test]
    fn test_default_discretisation_is_identity() {
        let system = Discretiser::default().process(&lumped_model()).unwrap();
        assert_eq!(system.len(), 2);
        assert_eq!(system.n_differential(), 2);
        assert_eq!(system.mapping().slice_of("x"), Some(0..1));

        let mass = DMatrix::from(system.mass_matrix());
        assert_eq!(mass, DMatrix::identity(2, 2));

        let y0 = system.initial_state(&inputs()).unwrap();
        assert_eq!(y0, vec![1.0, 2.0]);
        assert_eq!(system.rhs(0.0, &y0, &inputs()).unwrap(), vec![0.0, 1.0]);
    }

    #[test]
    fn test_residual_and_jacobian() {
        let system = Discretiser::default().process(&lumped_model()).unwrap();
        let y = [1.0, 2.0];
        let r = system.residual(0.0, &y, &[0.5, 1.0], &inputs()).unwrap();
        assert_eq!(r, vec![0.5, 0.0]);

        let jac = system.jacobian(0.0, &y, &inputs()).unwrap();
        assert_eq!(jac, DMatrix::from_row_slice(2, 2, &[4.0, -2.0, 3.0, -1.0]));
        let sparse = system.jacobian_sparse(0.0, &y, &inputs()).unwrap();
        assert_eq!(sparse.nnz(), 4);
    }

    #[test]
    fn test_outputs_include_unknowns() {
        let system = Discretiser::default().process(&lumped_model()).unwrap();
        let names: Vec<&str> = system.outputs().names().collect();
        assert_eq!(names, vec!["z", "x", "y"]);
        let z = system.outputs().get("z").unwrap();
        assert_eq!(z.evaluate(0.0, &[1.0, 2.0], &inputs()).unwrap(), vec![9.0]);
        assert!(!z.is_spatial());
    }

    #[test]
    fn test_algebraic_rows_have_zero_mass() {
        let mut model = Model::new("dae");
        let v = model.create_algebraic("v", None).unwrap();
        let x = model.create_differential("x", None).unwrap();
        model.set_rhs(&x, -x.expr()).unwrap();
        model.set_algebraic(&v, v.expr() - 2.0 * x.expr()).unwrap();
        model.set_initial_condition(&x, 1.0).unwrap();
        model.set_initial_condition(&v, 0.0).unwrap();

        let system = Discretiser::default().process(&model).unwrap();
        // Layout follows declaration order, so the algebraic row comes first
        assert_eq!(system.mapping().slice_of("v"), Some(0..1));
        assert_eq!(system.mapping().slice_of("x"), Some(1..2));
        assert_eq!(system.differential_mask(), &[false, true]);
        assert_eq!(system.algebraic_rows(), &[0]);
        assert_eq!(system.differential_rows(), &[1]);
        assert_eq!(DMatrix::from(system.mass_matrix()), DMatrix::from_row_slice(2, 2, &[0.0, 0.0, 0.0, 1.0]));

        let y = [0.0, 1.0];
        assert_eq!(system.initial_state(&inputs()).unwrap(), vec![0.0, 1.0]);
        assert_eq!(system.algebraic(0.0, &y, &inputs()).unwrap(), vec![-2.0]);
        assert_eq!(system.rhs(0.0, &y, &inputs()).unwrap(), vec![-1.0]);
        assert_eq!(system.residual(0.0, &y, &[5.0, 0.5], &inputs()).unwrap(), vec![2.0, 1.5]);
    }

    #[test]
    fn test_missing_initial_condition() {
        let mut model = Model::new("m");
        let x = model.create_differential("x", None).unwrap();
        model.set_rhs(&x, 1.0).unwrap();
        assert_eq!(
            Discretiser::default().process(&model).unwrap_err(),
            DiscretisationError::MissingInitialCondition("x".to_string())
        );
    }

    #[test]
    fn test_undiscretised_spatial_operator() {
        let model = diffusion_model();
        // Submesh but no spatial method
        let mesh = Mesh::new().with_submesh("rod", Submesh1D::uniform(0.0, 1.0, 4).unwrap());
        let err = Discretiser::new(mesh).process(&model).unwrap_err();
        assert!(matches!(err, DiscretisationError::UndiscretisedSpatialOperator { ref domain, .. } if domain == "rod"));

        // No submesh at all
        let err = Discretiser::default().process(&model).unwrap_err();
        assert_eq!(
            err,
            DiscretisationError::MissingSubmesh { variable: "c".to_string(), domain: "rod".to_string() }
        );
    }

    #[test]
    fn test_diffusion_system() {
        let registry = MethodRegistry::new();
        let system = rod(4).with_registry(registry.clone()).process(&diffusion_model()).unwrap();
        assert_eq!(system.len(), 4);
        assert!(registry.contains("finite volume"));

        // Scalar initial condition broadcast onto every cell
        let y0 = system.initial_state(&inputs()).unwrap();
        assert_eq!(y0, vec![1.0; 4]);

        // Only the cell next to the Dirichlet boundary feels it
        let f = system.rhs(0.0, &y0, &inputs()).unwrap();
        assert_eq!(&f[..3], &[0.0, 0.0, 0.0]);
        assert_relative_eq!(f[3], -(1.0 / 0.125) / 0.25, epsilon = 1e-12);

        let total = system.outputs().get("total").unwrap();
        assert_relative_eq!(total.evaluate(0.0, &y0, &inputs()).unwrap()[0], 1.0, epsilon = 1e-12);
        let c = system.outputs().get("c").unwrap();
        assert_eq!(c.positions().map(|p| p.len()), Some(4));
    }

    #[test]
    fn test_same_model_on_two_meshes() {
        let model = diffusion_model();
        let coarse = rod(3).process(&model).unwrap();
        let fine = rod(12).process(&model).unwrap();
        assert_eq!(coarse.len(), 3);
        assert_eq!(fine.len(), 12);
        // The model keeps its undiscretised operators
        assert!(model.rhs("c").unwrap().has_spatial_operator());
    }

    #[test]
    fn test_shape_mismatch() {
        let mut model = Model::new("m");
        let c = model.create_differential("c", Some("rod")).unwrap();
        model.set_rhs(&c, Expr::vector(vec![1.0, 2.0])).unwrap();
        model.set_initial_condition(&c, 0.0).unwrap();
        let err = rod(4).process(&model).unwrap_err();
        assert_eq!(
            err,
            DiscretisationError::ShapeMismatch { name: "c".to_string(), expected: 4, found: 2 }
        );
    }

    #[test]
    fn test_inputs_and_deferred_initial_state() {
        let mut model = Model::new("m");
        let x = model.create_differential("x", None).unwrap();
        model.set_rhs(&x, -Expr::input("k") * x.expr()).unwrap();
        model.set_initial_condition(&x, Expr::input("x0")).unwrap();

        let system = Discretiser::default().process(&model).unwrap();
        let names: Vec<&str> = system.required_inputs().iter().map(String::as_str).collect();
        assert_eq!(names, vec!["k", "x0"]);
        assert_eq!(
            system.check_inputs(&inputs()),
            Err(ExpressionError::MissingInput("k".to_string()))
        );

        let mut values = inputs();
        values.insert("k".to_string(), 2.0);
        values.insert("x0".to_string(), 3.0);
        assert_eq!(system.initial_state(&values).unwrap(), vec![3.0]);
        assert_eq!(system.rhs(0.0, &[3.0], &values).unwrap(), vec![-6.0]);
    }

    #[test]
    fn test_events_and_spatial_coordinate() {
        let mut model = Model::new("m");
        let c = model.create_differential("c", Some("rod")).unwrap();
        let x = Expr::spatial_coordinate("rod");
        model.set_rhs(&c, broadcast(&Expr::scalar(0.0), "rod")).unwrap();
        model.set_initial_condition(&c, 2.0 * &x).unwrap();
        model.add_event(Event::terminating("low", integral(&c) - 0.5)).unwrap();

        let system = rod(2).process(&model).unwrap();
        let y0 = system.initial_state(&inputs()).unwrap();
        assert_eq!(y0, vec![0.5, 1.5]);
        assert_eq!(system.events()[0].name, "low");
        let g = system.event_values(0.0, &y0, &inputs()).unwrap();
        assert_relative_eq!(g[0], 0.5, epsilon = 1e-12);
    }

    #[test]
    fn test_stateful_initial_condition() {
        let mut model = Model::new("m");
        let x = model.create_differential("x", None).unwrap();
        let y = model.create_differential("y", None).unwrap();
        model.set_rhs(&x, 0.0).unwrap();
        model.set_rhs(&y, 0.0).unwrap();
        model.set_initial_condition(&x, 1.0).unwrap();
        model.set_initial_condition(&y, x.expr() * 2.0).unwrap();
        assert_eq!(
            Discretiser::default().process(&model).unwrap_err(),
            DiscretisationError::StatefulInitialCondition("y".to_string())
        );
    }
}
