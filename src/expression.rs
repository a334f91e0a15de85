//! Symbolic expression trees.
//!
//! An [`Expr`] is a cheap, reference-counted handle to an immutable [`Node`].
//! Nodes form a directed acyclic graph: the same subexpression may be shared by
//! any number of parents. Each node caches its output [`Shape`], a structural
//! hash, and whether it is constant (independent of time, state and inputs).
//!
//! Expressions are built with ordinary operator syntax:
//!
//! ```ignore
//! use symdae::expression::Expr;
//!
//! let x = Expr::variable("x", None);
//! let y = Expr::variable("y", None);
//! let z = &x + 4.0 * &y;
//! assert!(z.check().is_ok());
//! ```
//!
//! # Shapes and broadcasting
//!
//! Scalars broadcast against anything. Two arrays must agree exactly. Fields
//! live on a named spatial domain, either at cell centres or on cell edges;
//! combining a cell field with an edge field of the same domain averages the
//! cell operand onto the faces. Every other mismatch is recorded on the node as
//! a [`ExpressionError::Shape`] and reported by [`Expr::check`], so an invalid
//! tree is rejected as soon as it is handed to a model.
//!
//! # Evaluation
//!
//! Trees are compiled into a [`Tape`], a topologically ordered instruction list
//! in which structurally identical subexpressions occupy a single slot and
//! constant subtrees are folded once. A tape is generic over
//! [`num_dual::DualNum`] scalars, so the same tape produces values (`f64`) and
//! Jacobian columns (`Dual64`).

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::{Add, Div, Mul, Neg, Sub};
use std::sync::Arc;

use nalgebra_sparse::CsrMatrix;
use num_dual::DualNum;

use crate::parameters::Inputs;

/// Result type for expression construction and evaluation.
pub type ExpressionResult<T> = Result<T, ExpressionError>;

/// Errors raised while building or evaluating expressions.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExpressionError {
    /// Two operands cannot be broadcast together
    #[error("Shape error in '{op}': cannot combine {left} with {right}")]
    Shape {
        /// Operation being built
        op: &'static str,
        /// Shape of the left operand
        left: Shape,
        /// Shape of the right operand
        right: Shape,
    },
    /// A single operand has a shape the operation does not accept
    #[error("Shape error in '{op}': operand of shape {operand} is not allowed")]
    InvalidOperand {
        /// Operation being built
        op: &'static str,
        /// Offending operand shape
        operand: Shape,
    },
    /// A spatial operator was evaluated before discretisation
    #[error("Spatial operator '{0}' must be discretised before it can be evaluated")]
    NotDiscretised(String),
    /// A named unknown was evaluated before being mapped onto the state vector
    #[error("Variable '{0}' is not bound to the state vector")]
    UnboundVariable(String),
    /// An input parameter was not supplied at evaluation time
    #[error("Input parameter '{0}' was not supplied")]
    MissingInput(String),
    /// A parameter was never given a value
    #[error("Parameter '{0}' has not been given a value")]
    UnresolvedParameter(String),
    /// A state-vector slice reaches past the end of the supplied state
    #[error("State slice {start}..{end} is out of range for a state vector of length {len}")]
    StateOutOfRange {
        /// Slice start
        start: usize,
        /// Slice end (exclusive)
        end: usize,
        /// Length of the supplied state vector
        len: usize,
    },
}

/// Where the values of a spatial field live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Location {
    /// One value per cell centre
    Cells,
    /// One value per cell edge (face)
    Edges,
}

/// Boundary of a one-dimensional domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Side {
    /// Lower end of the domain
    Left,
    /// Upper end of the domain
    Right,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Left => write!(f, "left"),
            Side::Right => write!(f, "right"),
        }
    }
}

/// Output shape of an expression node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Shape {
    /// A single value
    Scalar,
    /// A flat array of known length
    Vector(usize),
    /// A field on a named domain whose length is fixed by the mesh
    Field {
        /// Spatial domain
        domain: Arc<str>,
        /// Cell centres or edges
        location: Location,
    },
    /// A constant linear operator
    Matrix(usize, usize),
}

impl Shape {
    /// Creates a cell-centred field shape on `domain`.
    pub fn cells(domain: &str) -> Self {
        Shape::Field { domain: Arc::from(domain), location: Location::Cells }
    }

    /// Returns true for scalars and length-one arrays.
    pub fn is_scalar(&self) -> bool {
        matches!(self, Shape::Scalar | Shape::Vector(1))
    }

    /// Number of values, when known without a mesh.
    pub fn len(&self) -> Option<usize> {
        match self {
            Shape::Scalar => Some(1),
            Shape::Vector(n) => Some(*n),
            _ => None,
        }
    }

    /// Domain of a field shape.
    pub fn domain(&self) -> Option<&str> {
        match self {
            Shape::Field { domain, .. } => Some(domain),
            _ => None,
        }
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Shape::Scalar => write!(f, "scalar"),
            Shape::Vector(n) => write!(f, "vector[{}]", n),
            Shape::Field { domain, location: Location::Cells } => {
                write!(f, "field on '{}' cells", domain)
            }
            Shape::Field { domain, location: Location::Edges } => {
                write!(f, "field on '{}' edges", domain)
            }
            Shape::Matrix(m, n) => write!(f, "matrix[{}x{}]", m, n),
        }
    }
}

/// Elementwise single-argument operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Neg,
    Abs,
    Exp,
    Log,
    Sqrt,
    Sin,
    Cos,
    Tanh,
    Sign,
}

impl UnaryOp {
    fn symbol(&self) -> &'static str {
        match self {
            UnaryOp::Neg => "-",
            UnaryOp::Abs => "abs",
            UnaryOp::Exp => "exp",
            UnaryOp::Log => "log",
            UnaryOp::Sqrt => "sqrt",
            UnaryOp::Sin => "sin",
            UnaryOp::Cos => "cos",
            UnaryOp::Tanh => "tanh",
            UnaryOp::Sign => "sign",
        }
    }

    fn apply_f64(&self, x: f64) -> f64 {
        match self {
            UnaryOp::Neg => -x,
            UnaryOp::Abs => x.abs(),
            UnaryOp::Exp => x.exp(),
            UnaryOp::Log => x.ln(),
            UnaryOp::Sqrt => x.sqrt(),
            UnaryOp::Sin => x.sin(),
            UnaryOp::Cos => x.cos(),
            UnaryOp::Tanh => x.tanh(),
            UnaryOp::Sign => sign(x),
        }
    }
}

/// Elementwise two-argument operations with broadcasting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    Min,
    Max,
}

impl BinaryOp {
    fn symbol(&self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Pow => "**",
            BinaryOp::Min => "minimum",
            BinaryOp::Max => "maximum",
        }
    }

    fn apply_f64(&self, a: f64, b: f64) -> f64 {
        match self {
            BinaryOp::Add => a + b,
            BinaryOp::Sub => a - b,
            BinaryOp::Mul => a * b,
            BinaryOp::Div => a / b,
            BinaryOp::Pow => a.powf(b),
            BinaryOp::Min => a.min(b),
            BinaryOp::Max => a.max(b),
        }
    }
}

/// Mesh-independent spatial operators, replaced during discretisation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SpatialOp {
    /// Gradient of a cell field, evaluated on edges
    Gradient,
    /// Divergence of an edge field, evaluated on cells
    Divergence,
    /// Integral of a cell field over its domain
    Integral,
    /// Value of a cell field at one end of its domain
    BoundaryValue(Side),
    /// Broadcast of a scalar onto every cell of a domain
    Broadcast(Arc<str>),
    /// Average of a cell field onto edges
    FaceAverage,
}

impl SpatialOp {
    /// Operator name used in messages.
    pub fn name(&self) -> String {
        match self {
            SpatialOp::Gradient => "grad".to_string(),
            SpatialOp::Divergence => "div".to_string(),
            SpatialOp::Integral => "integral".to_string(),
            SpatialOp::BoundaryValue(side) => format!("boundary_value[{}]", side),
            SpatialOp::Broadcast(domain) => format!("broadcast[{}]", domain),
            SpatialOp::FaceAverage => "face_average".to_string(),
        }
    }
}

/// A constant sparse linear operator embedded in an expression.
#[derive(Debug, Clone)]
pub struct SparseOperator {
    matrix: CsrMatrix<f64>,
    fingerprint: u64,
}

impl SparseOperator {
    /// Wraps a CSR matrix, fingerprinting its structure and values.
    pub fn new(matrix: CsrMatrix<f64>) -> Self {
        let mut hasher = DefaultHasher::new();
        matrix.nrows().hash(&mut hasher);
        matrix.ncols().hash(&mut hasher);
        matrix.row_offsets().hash(&mut hasher);
        matrix.col_indices().hash(&mut hasher);
        for v in matrix.values() {
            v.to_bits().hash(&mut hasher);
        }
        SparseOperator { matrix, fingerprint: hasher.finish() }
    }

    /// Borrows the underlying matrix.
    pub fn matrix(&self) -> &CsrMatrix<f64> {
        &self.matrix
    }

    /// Applies the operator to a vector of (possibly dual) numbers.
    pub fn apply<T: DualNum<f64>>(&self, x: &[T]) -> Vec<T> {
        self.matrix
            .row_iter()
            .map(|row| {
                let mut acc = T::from(0.0);
                for (&j, &v) in row.col_indices().iter().zip(row.values()) {
                    acc += x[j].clone() * T::from(v);
                }
                acc
            })
            .collect()
    }

    fn same_as(&self, other: &SparseOperator) -> bool {
        self.fingerprint == other.fingerprint
            && self.matrix.nrows() == other.matrix.nrows()
            && self.matrix.ncols() == other.matrix.ncols()
            && self.matrix.row_offsets() == other.matrix.row_offsets()
            && self.matrix.col_indices() == other.matrix.col_indices()
            && self.matrix.values() == other.matrix.values()
    }
}

/// The tag of an expression node.
#[derive(Debug, Clone)]
pub enum Kind {
    /// Constant scalar
    Scalar(f64),
    /// Constant array
    Vector(Arc<[f64]>),
    /// Simulation time
    Time,
    /// Cell-centre coordinate of a spatial domain
    SpatialCoordinate(Arc<str>),
    /// Named unknown, optionally living on a spatial domain
    Variable {
        /// Unknown name
        name: Arc<str>,
        /// Spatial domain, `None` for lumped unknowns
        domain: Option<Arc<str>>,
    },
    /// Named constant resolved by a parameter provider
    Parameter(Arc<str>),
    /// Named function of the child expressions, resolved by a parameter provider
    FunctionParameter(Arc<str>),
    /// Named value supplied at solve time
    InputParameter(Arc<str>),
    /// Elementwise unary operation
    Unary(UnaryOp),
    /// Elementwise binary operation
    Binary(BinaryOp),
    /// Undiscretised spatial operator
    Spatial(SpatialOp),
    /// Children stacked end to end
    Concatenation,
    /// Contiguous range of the flat state vector
    StateVectorSlice {
        /// Unknown the slice belongs to
        name: Arc<str>,
        /// First index
        start: usize,
        /// One past the last index
        end: usize,
    },
    /// Constant sparse matrix
    Matrix(Arc<SparseOperator>),
    /// Matrix-vector product; children are `[matrix, vector]`
    MatMul,
    /// Weighted harmonic mean of cell values onto edges.
    /// Holds the left weight of every interior face.
    FaceHarmonicMean(Arc<[f64]>),
}

impl Kind {
    fn hash_into<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Kind::Scalar(v) => v.to_bits().hash(state),
            Kind::Vector(values) | Kind::FaceHarmonicMean(values) => {
                for v in values.iter() {
                    v.to_bits().hash(state);
                }
            }
            Kind::Time | Kind::Concatenation | Kind::MatMul => {}
            Kind::Variable { name, domain } => {
                name.hash(state);
                domain.hash(state);
            }
            Kind::Parameter(name)
            | Kind::FunctionParameter(name)
            | Kind::InputParameter(name)
            | Kind::SpatialCoordinate(name) => name.hash(state),
            Kind::Unary(op) => op.hash(state),
            Kind::Binary(op) => op.hash(state),
            Kind::Spatial(op) => op.hash(state),
            Kind::StateVectorSlice { name, start, end } => {
                name.hash(state);
                start.hash(state);
                end.hash(state);
            }
            Kind::Matrix(op) => op.fingerprint.hash(state),
        }
    }

    fn same_as(&self, other: &Kind) -> bool {
        match (self, other) {
            (Kind::Scalar(a), Kind::Scalar(b)) => a.to_bits() == b.to_bits(),
            (Kind::Vector(a), Kind::Vector(b))
            | (Kind::FaceHarmonicMean(a), Kind::FaceHarmonicMean(b)) => {
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.to_bits() == y.to_bits())
            }
            (Kind::Time, Kind::Time)
            | (Kind::Concatenation, Kind::Concatenation)
            | (Kind::MatMul, Kind::MatMul) => true,
            (
                Kind::Variable { name: n1, domain: d1 },
                Kind::Variable { name: n2, domain: d2 },
            ) => n1 == n2 && d1 == d2,
            (Kind::Parameter(a), Kind::Parameter(b))
            | (Kind::FunctionParameter(a), Kind::FunctionParameter(b))
            | (Kind::InputParameter(a), Kind::InputParameter(b))
            | (Kind::SpatialCoordinate(a), Kind::SpatialCoordinate(b)) => a == b,
            (Kind::Unary(a), Kind::Unary(b)) => a == b,
            (Kind::Binary(a), Kind::Binary(b)) => a == b,
            (Kind::Spatial(a), Kind::Spatial(b)) => a == b,
            (
                Kind::StateVectorSlice { name: n1, start: s1, end: e1 },
                Kind::StateVectorSlice { name: n2, start: s2, end: e2 },
            ) => n1 == n2 && s1 == s2 && e1 == e2,
            (Kind::Matrix(a), Kind::Matrix(b)) => Arc::ptr_eq(a, b) || a.same_as(b),
            _ => false,
        }
    }
}

/// An immutable expression node.
pub struct Node {
    kind: Kind,
    children: Vec<Expr>,
    shape: ExpressionResult<Shape>,
    constant: bool,
    hash: u64,
}

/// Shared handle to an expression node.
///
/// Cloning is cheap. Equality and hashing are structural, so two independently
/// built copies of `x + 1` compare equal and collapse to one slot in a [`Tape`].
#[derive(Clone)]
pub struct Expr(Arc<Node>);

fn sign(x: f64) -> f64 {
    if x > 0.0 {
        1.0
    } else if x < 0.0 {
        -1.0
    } else {
        0.0
    }
}

fn broadcast_shapes(op: &'static str, left: &Shape, right: &Shape) -> ExpressionResult<Shape> {
    let mismatch =
        || ExpressionError::Shape { op, left: left.clone(), right: right.clone() };

    if matches!(left, Shape::Matrix(..)) || matches!(right, Shape::Matrix(..)) {
        return Err(mismatch());
    }
    if left.is_scalar() && right.is_scalar() {
        return Ok(if left == right { left.clone() } else { Shape::Scalar });
    }
    if left.is_scalar() {
        return Ok(right.clone());
    }
    if right.is_scalar() {
        return Ok(left.clone());
    }
    match (left, right) {
        (Shape::Vector(a), Shape::Vector(b)) if a == b => Ok(left.clone()),
        (
            Shape::Field { domain: d1, location: l1 },
            Shape::Field { domain: d2, location: l2 },
        ) if d1 == d2 => {
            if l1 == l2 {
                Ok(left.clone())
            } else {
                Ok(Shape::Field { domain: d1.clone(), location: Location::Edges })
            }
        }
        _ => Err(mismatch()),
    }
}

impl Expr {
    fn build(kind: Kind, children: Vec<Expr>, shape: ExpressionResult<Shape>) -> Expr {
        let constant = match &kind {
            Kind::Scalar(_) | Kind::Vector(_) | Kind::Matrix(_) => true,
            Kind::Time
            | Kind::Variable { .. }
            | Kind::SpatialCoordinate(_)
            | Kind::Parameter(_)
            | Kind::FunctionParameter(_)
            | Kind::InputParameter(_)
            | Kind::StateVectorSlice { .. }
            | Kind::Spatial(_) => false,
            _ => children.iter().all(|c| c.is_constant()),
        };
        let mut hasher = DefaultHasher::new();
        kind.hash_into(&mut hasher);
        for child in &children {
            child.0.hash.hash(&mut hasher);
        }
        let hash = hasher.finish();
        Expr(Arc::new(Node { kind, children, shape, constant, hash }))
    }

    fn child_error(children: &[Expr]) -> Option<ExpressionError> {
        children.iter().find_map(|c| c.0.shape.as_ref().err().cloned())
    }

    /// Creates a constant scalar.
    pub fn scalar(value: f64) -> Expr {
        Expr::build(Kind::Scalar(value), Vec::new(), Ok(Shape::Scalar))
    }

    /// Creates a constant array.
    pub fn vector(values: Vec<f64>) -> Expr {
        let n = values.len();
        Expr::build(Kind::Vector(Arc::from(values)), Vec::new(), Ok(Shape::Vector(n)))
    }

    /// The simulation time.
    pub fn time() -> Expr {
        Expr::build(Kind::Time, Vec::new(), Ok(Shape::Scalar))
    }

    /// Creates a named unknown. Unknowns with a domain are cell fields.
    ///
    /// Models normally create unknowns through
    /// [`Model::create_differential`](crate::model::Model::create_differential)
    /// and [`Model::create_algebraic`](crate::model::Model::create_algebraic).
    pub fn variable(name: &str, domain: Option<&str>) -> Expr {
        let shape = match domain {
            Some(d) => Shape::cells(d),
            None => Shape::Scalar,
        };
        Expr::build(
            Kind::Variable { name: Arc::from(name), domain: domain.map(Arc::from) },
            Vec::new(),
            Ok(shape),
        )
    }

    /// The position of every cell centre of `domain`.
    pub fn spatial_coordinate(domain: &str) -> Expr {
        Expr::build(Kind::SpatialCoordinate(Arc::from(domain)), Vec::new(), Ok(Shape::cells(domain)))
    }

    /// A named constant to be supplied by a parameter provider.
    pub fn parameter(name: &str) -> Expr {
        Expr::build(Kind::Parameter(Arc::from(name)), Vec::new(), Ok(Shape::Scalar))
    }

    /// A named function of `args`, to be supplied by a parameter provider.
    ///
    /// The result has the broadcast shape of its arguments.
    pub fn function_parameter(name: &str, args: Vec<Expr>) -> Expr {
        let shape = match Expr::child_error(&args) {
            Some(e) => Err(e),
            None => args.iter().try_fold(Shape::Scalar, |acc, a| match a.0.shape.as_ref() {
                Ok(s) => broadcast_shapes("function parameter", &acc, s),
                Err(e) => Err(e.clone()),
            }),
        };
        Expr::build(Kind::FunctionParameter(Arc::from(name)), args, shape)
    }

    /// A named value supplied when solving.
    pub fn input(name: &str) -> Expr {
        Expr::build(Kind::InputParameter(Arc::from(name)), Vec::new(), Ok(Shape::Scalar))
    }

    /// A contiguous slice `[start, end)` of the flat state vector.
    pub fn state_vector_slice(name: &str, start: usize, end: usize) -> Expr {
        Expr::build(
            Kind::StateVectorSlice { name: Arc::from(name), start, end },
            Vec::new(),
            Ok(Shape::Vector(end.saturating_sub(start))),
        )
    }

    /// Embeds a constant sparse matrix.
    pub fn matrix(matrix: CsrMatrix<f64>) -> Expr {
        let shape = Shape::Matrix(matrix.nrows(), matrix.ncols());
        Expr::build(Kind::Matrix(Arc::new(SparseOperator::new(matrix))), Vec::new(), Ok(shape))
    }

    /// Matrix-vector product. `matrix` must be a [`Expr::matrix`] node.
    pub fn matmul(matrix: &Expr, vector: &Expr) -> Expr {
        let children = vec![matrix.clone(), vector.clone()];
        let shape = match Expr::child_error(&children) {
            Some(e) => Err(e),
            None => match (matrix.shape_unchecked(), vector.shape_unchecked()) {
                (Shape::Matrix(m, n), rhs) if rhs.len() == Some(*n) => Ok(Shape::Vector(*m)),
                (lhs, rhs) => {
                    Err(ExpressionError::Shape { op: "@", left: lhs.clone(), right: rhs.clone() })
                }
            },
        };
        Expr::build(Kind::MatMul, children, shape)
    }

    /// Stacks arrays end to end.
    pub fn concatenate(parts: Vec<Expr>) -> Expr {
        let shape = match Expr::child_error(&parts) {
            Some(e) => Err(e),
            None => parts.iter().try_fold(0usize, |acc, p| match p.shape_unchecked().len() {
                Some(n) => Ok(acc + n),
                None => Err(ExpressionError::InvalidOperand {
                    op: "concatenation",
                    operand: p.shape_unchecked().clone(),
                }),
            }),
        }
        .map(Shape::Vector);
        Expr::build(Kind::Concatenation, parts, shape)
    }

    /// Applies an elementwise unary operation.
    pub fn unary(op: UnaryOp, child: &Expr) -> Expr {
        if let (Kind::Scalar(v), Ok(_)) = (&child.0.kind, &child.0.shape) {
            return Expr::scalar(op.apply_f64(*v));
        }
        if op == UnaryOp::Neg {
            if let Kind::Unary(UnaryOp::Neg) = child.0.kind {
                return child.0.children[0].clone();
            }
        }
        let shape = match &child.0.shape {
            Err(e) => Err(e.clone()),
            Ok(s @ Shape::Matrix(..)) => {
                Err(ExpressionError::InvalidOperand { op: op.symbol(), operand: s.clone() })
            }
            Ok(s) => Ok(s.clone()),
        };
        Expr::build(Kind::Unary(op), vec![child.clone()], shape)
    }

    /// Applies an elementwise binary operation with broadcasting.
    ///
    /// A cell field combined with an edge field of the same domain is averaged
    /// onto edges first.
    pub fn binary(op: BinaryOp, left: &Expr, right: &Expr) -> Expr {
        let (l, r) = (&left.0, &right.0);
        if let (Kind::Scalar(a), Kind::Scalar(b)) = (&l.kind, &r.kind) {
            return Expr::scalar(op.apply_f64(*a, *b));
        }
        if let (Ok(ls), Ok(rs)) = (&l.shape, &r.shape) {
            let is = |e: &Node, v: f64| matches!(e.kind, Kind::Scalar(x) if x == v);
            let keeps_shape = |other: &Shape| broadcast_shapes("", ls, rs).ok().as_ref() == Some(other);
            match op {
                BinaryOp::Add if is(r, 0.0) && keeps_shape(ls) => return left.clone(),
                BinaryOp::Add if is(l, 0.0) && keeps_shape(rs) => return right.clone(),
                BinaryOp::Sub if is(r, 0.0) && keeps_shape(ls) => return left.clone(),
                BinaryOp::Mul if is(r, 1.0) && keeps_shape(ls) => return left.clone(),
                BinaryOp::Mul if is(l, 1.0) && keeps_shape(rs) => return right.clone(),
                BinaryOp::Div if is(r, 1.0) && keeps_shape(ls) => return left.clone(),
                _ => {}
            }
        }

        let mut children = vec![left.clone(), right.clone()];
        let shape = match Expr::child_error(&children) {
            Some(e) => Err(e),
            None => {
                let (ls, rs) = (left.shape_unchecked(), right.shape_unchecked());
                let shape = broadcast_shapes(op.symbol(), ls, rs);
                if let (
                    Shape::Field { location: ll, .. },
                    Shape::Field { location: rl, .. },
                    Ok(_),
                ) = (ls, rs, &shape)
                {
                    if ll != rl {
                        let idx = if *ll == Location::Cells { 0 } else { 1 };
                        children[idx] = Expr::spatial(SpatialOp::FaceAverage, &children[idx]);
                    }
                }
                shape
            }
        };
        Expr::build(Kind::Binary(op), children, shape)
    }

    /// Applies a spatial operator.
    pub fn spatial(op: SpatialOp, child: &Expr) -> Expr {
        let shape = match &child.0.shape {
            Err(e) => Err(e.clone()),
            Ok(s) => {
                let invalid = || ExpressionError::InvalidOperand {
                    op: match &op {
                        SpatialOp::Gradient => "grad",
                        SpatialOp::Divergence => "div",
                        SpatialOp::Integral => "integral",
                        SpatialOp::BoundaryValue(_) => "boundary_value",
                        SpatialOp::Broadcast(_) => "broadcast",
                        SpatialOp::FaceAverage => "face_average",
                    },
                    operand: s.clone(),
                };
                match (&op, s) {
                    (SpatialOp::Gradient, Shape::Field { domain, location: Location::Cells })
                    | (SpatialOp::FaceAverage, Shape::Field { domain, location: Location::Cells }) => {
                        Ok(Shape::Field { domain: domain.clone(), location: Location::Edges })
                    }
                    (SpatialOp::Divergence, Shape::Field { domain, location: Location::Edges }) => {
                        Ok(Shape::Field { domain: domain.clone(), location: Location::Cells })
                    }
                    (SpatialOp::Integral, Shape::Field { location: Location::Cells, .. })
                    | (SpatialOp::BoundaryValue(_), Shape::Field { location: Location::Cells, .. }) => {
                        Ok(Shape::Scalar)
                    }
                    (SpatialOp::Broadcast(domain), s) if s.is_scalar() => {
                        Ok(Shape::Field { domain: domain.clone(), location: Location::Cells })
                    }
                    _ => Err(invalid()),
                }
            }
        };
        Expr::build(Kind::Spatial(op), vec![child.clone()], shape)
    }

    /// Weighted harmonic mean of a cell vector onto its edges.
    ///
    /// `left_weights[i]` is the fraction of the distance between the centres
    /// adjacent to interior face `i + 1` that lies on the left of that face.
    pub fn face_harmonic_mean(child: &Expr, left_weights: Vec<f64>) -> Expr {
        let shape = match &child.0.shape {
            Err(e) => Err(e.clone()),
            Ok(s) => match s.len() {
                Some(n) if n == left_weights.len() + 1 => Ok(Shape::Vector(n + 1)),
                _ => Err(ExpressionError::InvalidOperand { op: "harmonic_mean", operand: s.clone() }),
            },
        };
        Expr::build(Kind::FaceHarmonicMean(Arc::from(left_weights)), vec![child.clone()], shape)
    }

    /// Rebuilds a node of the given kind over new children, re-deriving its shape.
    pub fn rebuild(kind: &Kind, children: Vec<Expr>) -> Expr {
        match kind {
            Kind::Unary(op) => Expr::unary(*op, &children[0]),
            Kind::Binary(op) => Expr::binary(*op, &children[0], &children[1]),
            Kind::Spatial(op) => Expr::spatial(op.clone(), &children[0]),
            Kind::Concatenation => Expr::concatenate(children),
            Kind::MatMul => Expr::matmul(&children[0], &children[1]),
            Kind::FaceHarmonicMean(w) => Expr::face_harmonic_mean(&children[0], w.to_vec()),
            Kind::FunctionParameter(name) => Expr::function_parameter(name, children),
            leaf => {
                let shape = match leaf {
                    Kind::Vector(v) => Shape::Vector(v.len()),
                    Kind::Variable { domain: Some(d), .. } | Kind::SpatialCoordinate(d) => {
                        Shape::cells(d)
                    }
                    Kind::StateVectorSlice { start, end, .. } => Shape::Vector(end - start),
                    Kind::Matrix(op) => Shape::Matrix(op.matrix.nrows(), op.matrix.ncols()),
                    _ => Shape::Scalar,
                };
                Expr::build(leaf.clone(), Vec::new(), Ok(shape))
            }
        }
    }

    /// Raises this expression to a power.
    pub fn pow(&self, exponent: impl Into<Expr>) -> Expr {
        Expr::binary(BinaryOp::Pow, self, &exponent.into())
    }

    /// Elementwise minimum.
    pub fn min(&self, other: impl Into<Expr>) -> Expr {
        Expr::binary(BinaryOp::Min, self, &other.into())
    }

    /// Elementwise maximum.
    pub fn max(&self, other: impl Into<Expr>) -> Expr {
        Expr::binary(BinaryOp::Max, self, &other.into())
    }

    pub fn exp(&self) -> Expr {
        Expr::unary(UnaryOp::Exp, self)
    }

    pub fn log(&self) -> Expr {
        Expr::unary(UnaryOp::Log, self)
    }

    pub fn sqrt(&self) -> Expr {
        Expr::unary(UnaryOp::Sqrt, self)
    }

    pub fn sin(&self) -> Expr {
        Expr::unary(UnaryOp::Sin, self)
    }

    pub fn cos(&self) -> Expr {
        Expr::unary(UnaryOp::Cos, self)
    }

    pub fn tanh(&self) -> Expr {
        Expr::unary(UnaryOp::Tanh, self)
    }

    pub fn abs(&self) -> Expr {
        Expr::unary(UnaryOp::Abs, self)
    }

    pub fn sign(&self) -> Expr {
        Expr::unary(UnaryOp::Sign, self)
    }

    /// Node tag.
    pub fn kind(&self) -> &Kind {
        &self.0.kind
    }

    /// Child expressions.
    pub fn children(&self) -> &[Expr] {
        &self.0.children
    }

    /// Returns the output shape, or the error recorded while building the tree.
    pub fn shape(&self) -> ExpressionResult<&Shape> {
        self.0.shape.as_ref().map_err(|e| e.clone())
    }

    /// Fails with the first shape error recorded anywhere in the tree.
    pub fn check(&self) -> ExpressionResult<()> {
        self.shape().map(|_| ())
    }

    fn shape_unchecked(&self) -> &Shape {
        match &self.0.shape {
            Ok(s) => s,
            Err(_) => &Shape::Scalar,
        }
    }

    /// Returns true if the value depends on neither time, state nor inputs.
    pub fn is_constant(&self) -> bool {
        self.0.constant
    }

    /// Structural hash, stable for the lifetime of the process.
    pub fn structural_hash(&self) -> u64 {
        self.0.hash
    }

    /// Returns true if both handles point at the same node.
    pub fn ptr_eq(&self, other: &Expr) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Name of a variable, parameter, input or state slice node.
    pub fn name(&self) -> Option<&str> {
        match &self.0.kind {
            Kind::Variable { name, .. }
            | Kind::Parameter(name)
            | Kind::FunctionParameter(name)
            | Kind::InputParameter(name)
            | Kind::StateVectorSlice { name, .. } => Some(name),
            _ => None,
        }
    }

    /// Domain of this expression, if it is a spatial field.
    pub fn domain(&self) -> Option<&str> {
        self.shape_unchecked().domain()
    }

    fn visit(&self, seen: &mut HashSet<Expr>, f: &mut dyn FnMut(&Expr)) {
        if !seen.insert(self.clone()) {
            return;
        }
        for child in &self.0.children {
            child.visit(seen, f);
        }
        f(self);
    }

    /// Calls `f` once on every distinct node, children before parents.
    pub fn for_each_node(&self, mut f: impl FnMut(&Expr)) {
        self.visit(&mut HashSet::new(), &mut f);
    }

    /// Names of all unknowns referenced by the tree, sorted.
    pub fn variable_names(&self) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        self.for_each_node(|e| {
            if let Kind::Variable { name, .. } = &e.0.kind {
                names.insert(name.to_string());
            }
        });
        names
    }

    /// Names of all input parameters referenced by the tree, sorted.
    pub fn input_names(&self) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        self.for_each_node(|e| {
            if let Kind::InputParameter(name) = &e.0.kind {
                names.insert(name.to_string());
            }
        });
        names
    }

    /// Returns true if any undiscretised spatial operator or coordinate remains in the tree.
    pub fn has_spatial_operator(&self) -> bool {
        let mut found = false;
        self.for_each_node(|e| {
            found |= matches!(e.0.kind, Kind::Spatial(_) | Kind::SpatialCoordinate(_))
        });
        found
    }

    /// Rewrites the tree top-down.
    ///
    /// `f` is offered every node before its children. Returning `Some` replaces
    /// the node without descending into it. Shared subtrees are rewritten once.
    /// The original tree is untouched.
    pub fn replace<E>(
        &self,
        f: &mut impl FnMut(&Expr) -> Result<Option<Expr>, E>,
    ) -> Result<Expr, E> {
        let mut memo = HashMap::new();
        self.replace_memo(f, &mut memo)
    }

    fn replace_memo<E>(
        &self,
        f: &mut impl FnMut(&Expr) -> Result<Option<Expr>, E>,
        memo: &mut HashMap<Expr, Expr>,
    ) -> Result<Expr, E> {
        if let Some(done) = memo.get(self) {
            return Ok(done.clone());
        }
        let result = match f(self)? {
            Some(replacement) => replacement,
            None if self.0.children.is_empty() => self.clone(),
            None => {
                let children = self
                    .0
                    .children
                    .iter()
                    .map(|c| c.replace_memo(f, memo))
                    .collect::<Result<Vec<_>, E>>()?;
                if children.iter().zip(&self.0.children).all(|(a, b)| a.ptr_eq(b)) {
                    self.clone()
                } else {
                    Expr::rebuild(&self.0.kind, children)
                }
            }
        };
        memo.insert(self.clone(), result.clone());
        Ok(result)
    }

    /// Evaluates the expression once.
    ///
    /// Convenience wrapper that compiles a throwaway [`Tape`]. Use a tape
    /// directly for repeated evaluation.
    pub fn evaluate(&self, t: f64, y: &[f64], inputs: &Inputs) -> ExpressionResult<Vec<f64>> {
        let tape = Tape::compile(std::slice::from_ref(self))?;
        let mut values = tape.evaluate(t, y, inputs)?;
        Ok(values.swap_remove(0))
    }

    /// Evaluates a constant expression.
    pub fn evaluate_constant(&self) -> ExpressionResult<Vec<f64>> {
        self.evaluate(0.0, &[], &Inputs::new())
    }
}

impl PartialEq for Expr {
    fn eq(&self, other: &Self) -> bool {
        if Arc::ptr_eq(&self.0, &other.0) {
            return true;
        }
        self.0.hash == other.0.hash
            && self.0.kind.same_as(&other.0.kind)
            && self.0.children.len() == other.0.children.len()
            && self.0.children.iter().zip(&other.0.children).all(|(a, b)| a == b)
    }
}

impl Eq for Expr {}

impl Hash for Expr {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.0.hash);
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = &self.0.children;
        match &self.0.kind {
            Kind::Scalar(v) => write!(f, "{}", v),
            Kind::Vector(v) => write!(f, "vector[{}]", v.len()),
            Kind::Time => write!(f, "t"),
            Kind::SpatialCoordinate(domain) => write!(f, "x[{}]", domain),
            Kind::Variable { name, .. } | Kind::Parameter(name) | Kind::InputParameter(name) => {
                write!(f, "{}", name)
            }
            Kind::FunctionParameter(name) => {
                write!(f, "{}(", name)?;
                for (i, arg) in c.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", arg)?;
                }
                write!(f, ")")
            }
            Kind::Unary(UnaryOp::Neg) => write!(f, "-{}", c[0]),
            Kind::Unary(op) => write!(f, "{}({})", op.symbol(), c[0]),
            Kind::Binary(op @ (BinaryOp::Min | BinaryOp::Max)) => {
                write!(f, "{}({}, {})", op.symbol(), c[0], c[1])
            }
            Kind::Binary(op) => write!(f, "({} {} {})", c[0], op.symbol(), c[1]),
            Kind::Spatial(op) => write!(f, "{}({})", op.name(), c[0]),
            Kind::Concatenation => {
                write!(f, "concat(")?;
                for (i, part) in c.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", part)?;
                }
                write!(f, ")")
            }
            Kind::StateVectorSlice { start, end, .. } => write!(f, "y[{}:{}]", start, end),
            Kind::Matrix(op) => write!(f, "matrix[{}x{}]", op.matrix.nrows(), op.matrix.ncols()),
            Kind::MatMul => write!(f, "{} @ {}", c[0], c[1]),
            Kind::FaceHarmonicMean(_) => write!(f, "harmonic_mean({})", c[0]),
        }
    }
}

impl fmt::Debug for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Expr({})", self)
    }
}

impl From<f64> for Expr {
    fn from(value: f64) -> Self {
        Expr::scalar(value)
    }
}

impl From<&Expr> for Expr {
    fn from(value: &Expr) -> Self {
        value.clone()
    }
}

macro_rules! impl_binary_operator {
    ($trait:ident, $method:ident, $op:expr) => {
        impl $trait<Expr> for Expr {
            type Output = Expr;
            fn $method(self, rhs: Expr) -> Expr {
                Expr::binary($op, &self, &rhs)
            }
        }

        impl $trait<&Expr> for Expr {
            type Output = Expr;
            fn $method(self, rhs: &Expr) -> Expr {
                Expr::binary($op, &self, rhs)
            }
        }

        impl $trait<Expr> for &Expr {
            type Output = Expr;
            fn $method(self, rhs: Expr) -> Expr {
                Expr::binary($op, self, &rhs)
            }
        }

        impl $trait<&Expr> for &Expr {
            type Output = Expr;
            fn $method(self, rhs: &Expr) -> Expr {
                Expr::binary($op, self, rhs)
            }
        }

        impl $trait<f64> for Expr {
            type Output = Expr;
            fn $method(self, rhs: f64) -> Expr {
                Expr::binary($op, &self, &Expr::scalar(rhs))
            }
        }

        impl $trait<f64> for &Expr {
            type Output = Expr;
            fn $method(self, rhs: f64) -> Expr {
                Expr::binary($op, self, &Expr::scalar(rhs))
            }
        }

        impl $trait<Expr> for f64 {
            type Output = Expr;
            fn $method(self, rhs: Expr) -> Expr {
                Expr::binary($op, &Expr::scalar(self), &rhs)
            }
        }

        impl $trait<&Expr> for f64 {
            type Output = Expr;
            fn $method(self, rhs: &Expr) -> Expr {
                Expr::binary($op, &Expr::scalar(self), rhs)
            }
        }
    };
}

impl_binary_operator!(Add, add, BinaryOp::Add);
impl_binary_operator!(Sub, sub, BinaryOp::Sub);
impl_binary_operator!(Mul, mul, BinaryOp::Mul);
impl_binary_operator!(Div, div, BinaryOp::Div);

impl Neg for Expr {
    type Output = Expr;
    fn neg(self) -> Expr {
        Expr::unary(UnaryOp::Neg, &self)
    }
}

impl Neg for &Expr {
    type Output = Expr;
    fn neg(self) -> Expr {
        Expr::unary(UnaryOp::Neg, self)
    }
}

/// Gradient of a cell field.
pub fn grad(expr: &Expr) -> Expr {
    Expr::spatial(SpatialOp::Gradient, expr)
}

/// Divergence of an edge field.
pub fn div(expr: &Expr) -> Expr {
    Expr::spatial(SpatialOp::Divergence, expr)
}

/// Integral of a cell field over its domain.
pub fn integral(expr: &Expr) -> Expr {
    Expr::spatial(SpatialOp::Integral, expr)
}

/// Value of a cell field at one end of its domain.
pub fn boundary_value(expr: &Expr, side: Side) -> Expr {
    Expr::spatial(SpatialOp::BoundaryValue(side), expr)
}

/// Broadcasts a scalar onto every cell of `domain`.
pub fn broadcast(expr: &Expr, domain: &str) -> Expr {
    Expr::spatial(SpatialOp::Broadcast(Arc::from(domain)), expr)
}

/// One compiled instruction: a node kind applied to earlier slots.
#[derive(Debug, Clone)]
struct Instruction {
    kind: Kind,
    args: Vec<usize>,
}

/// A compiled, deduplicated evaluation order for a set of root expressions.
///
/// # Example
///
/// ```ignore
/// let tape = Tape::compile(&[rhs_x, rhs_y])?;
/// let values = tape.evaluate(0.0, &y, &Inputs::new())?;
/// ```
#[derive(Debug, Clone)]
pub struct Tape {
    instructions: Vec<Instruction>,
    folded: Vec<Option<Vec<f64>>>,
    roots: Vec<usize>,
    root_lengths: Vec<usize>,
    inputs: BTreeSet<String>,
}

impl Tape {
    /// Compiles `roots` into a single tape.
    ///
    /// Fails if any root has a shape error or still contains an undiscretised
    /// spatial operator, an unbound variable or an unresolved parameter.
    pub fn compile(roots: &[Expr]) -> ExpressionResult<Tape> {
        let mut tape = Tape {
            instructions: Vec::new(),
            folded: Vec::new(),
            roots: Vec::new(),
            root_lengths: Vec::new(),
            inputs: BTreeSet::new(),
        };
        let mut slots: HashMap<Expr, usize> = HashMap::new();
        for root in roots {
            let shape = root.shape()?;
            let slot = tape.push(root, &mut slots)?;
            tape.roots.push(slot);
            tape.root_lengths.push(shape.len().unwrap_or(1));
        }
        tape.fold_constants()?;
        Ok(tape)
    }

    fn push(&mut self, expr: &Expr, slots: &mut HashMap<Expr, usize>) -> ExpressionResult<usize> {
        if let Some(&slot) = slots.get(expr) {
            return Ok(slot);
        }
        match &expr.0.kind {
            Kind::Spatial(op) => return Err(ExpressionError::NotDiscretised(op.name())),
            Kind::SpatialCoordinate(domain) => {
                return Err(ExpressionError::NotDiscretised(format!("x[{}]", domain)))
            }
            Kind::Variable { name, .. } => {
                return Err(ExpressionError::UnboundVariable(name.to_string()))
            }
            Kind::Parameter(name) | Kind::FunctionParameter(name) => {
                return Err(ExpressionError::UnresolvedParameter(name.to_string()))
            }
            Kind::InputParameter(name) => {
                self.inputs.insert(name.to_string());
            }
            _ => {}
        }
        let args = expr
            .0
            .children
            .iter()
            .map(|c| self.push(c, slots))
            .collect::<ExpressionResult<Vec<_>>>()?;
        let slot = self.instructions.len();
        self.instructions.push(Instruction { kind: expr.0.kind.clone(), args });
        self.folded.push(None);
        slots.insert(expr.clone(), slot);
        Ok(slot)
    }

    fn fold_constants(&mut self) -> ExpressionResult<()> {
        for i in 0..self.instructions.len() {
            let inst = &self.instructions[i];
            let foldable = match &inst.kind {
                Kind::Scalar(_) | Kind::Vector(_) => true,
                Kind::Matrix(_) => false,
                Kind::Time | Kind::InputParameter(_) | Kind::StateVectorSlice { .. } => false,
                Kind::MatMul => inst.args[1..].iter().all(|&a| self.folded[a].is_some()),
                _ => inst.args.iter().all(|&a| self.folded[a].is_some()),
            };
            if foldable {
                let args: Vec<&[f64]> =
                    inst.args.iter().map(|&a| self.folded[a].as_deref().unwrap_or(&[])).collect();
                let value = self.apply::<f64>(i, &args, 0.0, &[], &Inputs::new())?;
                self.folded[i] = Some(value);
            }
        }
        Ok(())
    }

    /// Number of root expressions.
    pub fn len(&self) -> usize {
        self.roots.len()
    }

    /// Returns true if the tape has no roots.
    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    /// Number of distinct nodes after deduplication.
    pub fn instruction_count(&self) -> usize {
        self.instructions.len()
    }

    /// Output length of each root.
    pub fn root_lengths(&self) -> &[usize] {
        &self.root_lengths
    }

    /// Sum of all root lengths.
    pub fn output_len(&self) -> usize {
        self.root_lengths.iter().sum()
    }

    /// Input parameter names the tape reads.
    pub fn required_inputs(&self) -> &BTreeSet<String> {
        &self.inputs
    }

    /// Returns true if every root folded to a constant.
    pub fn is_constant(&self) -> bool {
        self.roots.iter().all(|&r| self.folded[r].is_some())
    }

    fn apply<T: DualNum<f64>>(
        &self,
        index: usize,
        args: &[&[T]],
        t: f64,
        y: &[T],
        inputs: &Inputs,
    ) -> ExpressionResult<Vec<T>> {
        let inst = &self.instructions[index];
        let value = match &inst.kind {
            Kind::Scalar(v) => vec![T::from(*v)],
            Kind::Vector(values) => values.iter().map(|&v| T::from(v)).collect(),
            Kind::Time => vec![T::from(t)],
            Kind::InputParameter(name) => match inputs.get(name.as_ref()) {
                Some(&v) => vec![T::from(v)],
                None => return Err(ExpressionError::MissingInput(name.to_string())),
            },
            Kind::StateVectorSlice { start, end, .. } => {
                if *end > y.len() {
                    return Err(ExpressionError::StateOutOfRange {
                        start: *start,
                        end: *end,
                        len: y.len(),
                    });
                }
                y[*start..*end].to_vec()
            }
            Kind::Unary(op) => args[0].iter().map(|x| unary_dual(*op, x)).collect(),
            Kind::Binary(op) => {
                let (a, b) = (args[0], args[1]);
                let exponent = match op {
                    BinaryOp::Pow => self.folded[inst.args[1]].as_ref().filter(|v| v.len() == 1),
                    _ => None,
                };
                // An empty operand broadcasts to an empty result
                let n = if a.is_empty() || b.is_empty() { 0 } else { a.len().max(b.len()) };
                (0..n)
                    .map(|i| {
                        let x = &a[if a.len() == 1 { 0 } else { i }];
                        let z = &b[if b.len() == 1 { 0 } else { i }];
                        binary_dual(*op, x, z, exponent.map(|e| e[0]))
                    })
                    .collect()
            }
            Kind::Concatenation => args.iter().flat_map(|a| a.iter().cloned()).collect(),
            Kind::Matrix(_) => Vec::new(),
            Kind::MatMul => match &self.instructions[inst.args[0]].kind {
                Kind::Matrix(op) => op.apply(args[1]),
                _ => {
                    return Err(ExpressionError::InvalidOperand {
                        op: "@",
                        operand: Shape::Vector(args[0].len()),
                    })
                }
            },
            Kind::FaceHarmonicMean(weights) => harmonic_mean(args[0], weights),
            Kind::Spatial(op) => return Err(ExpressionError::NotDiscretised(op.name())),
            Kind::SpatialCoordinate(domain) => {
                return Err(ExpressionError::NotDiscretised(format!("x[{}]", domain)))
            }
            Kind::Variable { name, .. } => {
                return Err(ExpressionError::UnboundVariable(name.to_string()))
            }
            Kind::Parameter(name) | Kind::FunctionParameter(name) => {
                return Err(ExpressionError::UnresolvedParameter(name.to_string()))
            }
        };
        Ok(value)
    }

    /// Evaluates every root at `(t, y, inputs)`.
    ///
    /// Works for plain `f64` states as well as dual numbers.
    pub fn evaluate<T: DualNum<f64>>(
        &self,
        t: f64,
        y: &[T],
        inputs: &Inputs,
    ) -> ExpressionResult<Vec<Vec<T>>> {
        let mut values: Vec<Vec<T>> = Vec::with_capacity(self.instructions.len());
        for i in 0..self.instructions.len() {
            let value = match &self.folded[i] {
                Some(c) => c.iter().map(|&v| T::from(v)).collect(),
                None => {
                    let inst = &self.instructions[i];
                    let args: Vec<&[T]> = inst.args.iter().map(|&a| values[a].as_slice()).collect();
                    self.apply(i, &args, t, y, inputs)?
                }
            };
            values.push(value);
        }
        Ok(self.roots.iter().map(|&r| values[r].clone()).collect())
    }

    /// Evaluates every root and stacks the results into one flat vector.
    pub fn evaluate_flat<T: DualNum<f64>>(
        &self,
        t: f64,
        y: &[T],
        inputs: &Inputs,
    ) -> ExpressionResult<Vec<T>> {
        Ok(self.evaluate(t, y, inputs)?.into_iter().flatten().collect())
    }
}

fn unary_dual<T: DualNum<f64>>(op: UnaryOp, x: &T) -> T {
    match op {
        UnaryOp::Neg => -x.clone(),
        UnaryOp::Abs => x.abs(),
        UnaryOp::Exp => x.exp(),
        UnaryOp::Log => x.ln(),
        UnaryOp::Sqrt => x.sqrt(),
        UnaryOp::Sin => x.sin(),
        UnaryOp::Cos => x.cos(),
        UnaryOp::Tanh => x.tanh(),
        UnaryOp::Sign => T::from(sign(x.re())),
    }
}

fn binary_dual<T: DualNum<f64>>(op: BinaryOp, a: &T, b: &T, constant_exponent: Option<f64>) -> T {
    match op {
        BinaryOp::Add => a.clone() + b.clone(),
        BinaryOp::Sub => a.clone() - b.clone(),
        BinaryOp::Mul => a.clone() * b.clone(),
        BinaryOp::Div => a.clone() / b.clone(),
        BinaryOp::Pow => match constant_exponent {
            Some(e) if e.fract() == 0.0 && e.abs() < i32::MAX as f64 => a.powi(e as i32),
            Some(e) => a.powf(e),
            None => a.powd(b.clone()),
        },
        BinaryOp::Min => {
            if a.re() <= b.re() {
                a.clone()
            } else {
                b.clone()
            }
        }
        BinaryOp::Max => {
            if a.re() >= b.re() {
                a.clone()
            } else {
                b.clone()
            }
        }
    }
}

fn harmonic_mean<T: DualNum<f64>>(cells: &[T], left_weights: &[f64]) -> Vec<T> {
    let n = cells.len();
    let mut edges = Vec::with_capacity(n + 1);
    edges.push(cells[0].clone());
    for (i, &w) in left_weights.iter().enumerate() {
        let (a, b) = (&cells[i], &cells[i + 1]);
        if a.re() * b.re() <= 0.0 {
            edges.push(T::from(0.0));
        } else {
            let denom = b.clone() * T::from(w) + a.clone() * T::from(1.0 - w);
            edges.push(a.clone() * b.clone() / denom);
        }
    }
    edges.push(cells[n - 1].clone());
    edges
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra_sparse::CooMatrix;
    use num_dual::Dual64;

    fn no_inputs() -> Inputs {
        Inputs::new()
    }

    #[test]
    fn test_scalar_folding() {
        let e = Expr::scalar(2.0) * Expr::scalar(3.0) + 1.0;
        assert!(matches!(e.kind(), Kind::Scalar(v) if *v == 7.0));
        assert!(e.is_constant());
    }

    #[test]
    fn test_structural_equality_and_hash() {
        let a = Expr::state_vector_slice("x", 0, 1) + 1.0;
        let b = Expr::state_vector_slice("x", 0, 1) + 1.0;
        assert!(!a.ptr_eq(&b));
        assert_eq!(a, b);
        assert_eq!(a.structural_hash(), b.structural_hash());

        let c = Expr::state_vector_slice("x", 0, 1) + 2.0;
        assert_ne!(a, c);
    }

    #[test]
    fn test_broadcast_scalar_with_vector() {
        let v = Expr::vector(vec![1.0, 2.0, 3.0]);
        let e = &v * 2.0 + Expr::time();
        assert_eq!(e.shape().unwrap(), &Shape::Vector(3));
        let value = e.evaluate(1.0, &[], &no_inputs()).unwrap();
        assert_eq!(value, vec![3.0, 5.0, 7.0]);
    }

    #[test]
    fn test_empty_vector_broadcasts_to_empty() {
        let e = Expr::vector(vec![]) + 1.0;
        assert_eq!(e.shape().unwrap(), &Shape::Vector(0));
        assert!(e.evaluate(0.0, &[], &no_inputs()).unwrap().is_empty());
        assert!(e.evaluate_constant().unwrap().is_empty());

        let e = 2.0 * Expr::vector(vec![]) - Expr::time();
        assert!(e.evaluate(1.0, &[], &no_inputs()).unwrap().is_empty());
    }

    #[test]
    fn test_mismatched_vectors_fail_at_construction() {
        let a = Expr::vector(vec![1.0, 2.0]);
        let b = Expr::vector(vec![1.0, 2.0, 3.0]);
        let e = &a + &b;
        match e.check() {
            Err(ExpressionError::Shape { op, left, right }) => {
                assert_eq!(op, "+");
                assert_eq!(left, Shape::Vector(2));
                assert_eq!(right, Shape::Vector(3));
            }
            other => panic!("Expected a shape error, got {:?}", other),
        }

        // The error survives further construction
        let bigger = e.exp() * 3.0;
        assert!(matches!(bigger.check(), Err(ExpressionError::Shape { .. })));
    }

    #[test]
    fn test_fields_on_different_domains_do_not_mix() {
        let c = Expr::variable("c", Some("electrolyte"));
        let phi = Expr::variable("phi", Some("particle"));
        assert!(matches!((&c + &phi).check(), Err(ExpressionError::Shape { .. })));
        assert!((&c * 2.0).check().is_ok());
    }

    #[test]
    fn test_spatial_shapes() {
        let c = Expr::variable("c", Some("x"));
        let flux = grad(&c);
        assert_eq!(
            flux.shape().unwrap(),
            &Shape::Field { domain: Arc::from("x"), location: Location::Edges }
        );
        assert_eq!(div(&flux).shape().unwrap(), &Shape::cells("x"));
        assert_eq!(integral(&c).shape().unwrap(), &Shape::Scalar);

        // Divergence of a cell field is a modelling error
        assert!(matches!(div(&c).check(), Err(ExpressionError::InvalidOperand { op: "div", .. })));
    }

    #[test]
    fn test_cell_times_edge_inserts_face_average() {
        let c = Expr::variable("c", Some("x"));
        let flux = &c * grad(&c);
        assert!(flux.check().is_ok());
        assert!(matches!(flux.children()[0].kind(), Kind::Spatial(SpatialOp::FaceAverage)));
    }

    #[test]
    fn test_spatial_operator_not_discretised() {
        let c = Expr::variable("c", Some("x"));
        let e = div(&grad(&c));
        // Variables are rejected only once spatial operators have been dealt with
        match e.evaluate(0.0, &[], &no_inputs()) {
            Err(ExpressionError::NotDiscretised(name)) => assert_eq!(name, "div"),
            other => panic!("Expected NotDiscretised, got {:?}", other),
        }
    }

    #[test]
    fn test_unbound_variable() {
        let x = Expr::variable("x", None);
        assert_eq!(
            (&x + 1.0).evaluate(0.0, &[], &no_inputs()),
            Err(ExpressionError::UnboundVariable("x".to_string()))
        );
    }

    #[test]
    fn test_inputs() {
        let k = Expr::input("k");
        let y = Expr::state_vector_slice("x", 0, 1);
        let e = &k * &y;
        let mut inputs = Inputs::new();
        assert_eq!(
            e.evaluate(0.0, &[2.0], &inputs),
            Err(ExpressionError::MissingInput("k".to_string()))
        );
        inputs.insert("k".to_string(), 3.0);
        assert_eq!(e.evaluate(0.0, &[2.0], &inputs).unwrap(), vec![6.0]);
    }

    #[test]
    fn test_state_slice_out_of_range() {
        let y = Expr::state_vector_slice("x", 2, 4);
        assert!(matches!(
            y.evaluate(0.0, &[1.0, 2.0, 3.0], &no_inputs()),
            Err(ExpressionError::StateOutOfRange { start: 2, end: 4, len: 3 })
        ));
    }

    #[test]
    fn test_tape_deduplicates_shared_subexpressions() {
        let y = Expr::state_vector_slice("x", 0, 1);
        let a = (&y * 2.0).exp();
        let b = (&y * 2.0).exp();
        let tape = Tape::compile(&[&a + &b, a.clone()]).unwrap();
        // y, 2.0, y*2, exp, sum
        assert_eq!(tape.instruction_count(), 5);
        let values = tape.evaluate(0.0, &[0.5], &no_inputs()).unwrap();
        assert!((values[0][0] - 2.0 * 1.0_f64.exp()).abs() < 1e-12);
        assert!((values[1][0] - 1.0_f64.exp()).abs() < 1e-12);
    }

    #[test]
    fn test_constant_folding_on_tape() {
        let c = Expr::vector(vec![1.0, 4.0]).sqrt();
        let tape = Tape::compile(&[c]).unwrap();
        assert!(tape.is_constant());
        assert_eq!(tape.evaluate::<f64>(3.0, &[], &no_inputs()).unwrap()[0], vec![1.0, 2.0]);
    }

    #[test]
    fn test_matmul() {
        let mut coo = CooMatrix::new(2, 3);
        coo.push(0, 0, 1.0);
        coo.push(0, 2, -1.0);
        coo.push(1, 1, 2.0);
        let m = Expr::matrix(CsrMatrix::from(&coo));
        let y = Expr::state_vector_slice("u", 0, 3);
        let e = Expr::matmul(&m, &y);
        assert_eq!(e.shape().unwrap(), &Shape::Vector(2));
        assert_eq!(e.evaluate(0.0, &[1.0, 2.0, 3.0], &no_inputs()).unwrap(), vec![-2.0, 4.0]);

        let bad = Expr::matmul(&m, &Expr::state_vector_slice("u", 0, 2));
        assert!(matches!(bad.check(), Err(ExpressionError::Shape { op: "@", .. })));
    }

    #[test]
    fn test_dual_evaluation_gives_derivatives() {
        // d/dy [y^3 + sin(y)] = 3y^2 + cos(y)
        let y = Expr::state_vector_slice("x", 0, 1);
        let e = y.pow(3.0) + y.sin();
        let tape = Tape::compile(&[e]).unwrap();
        let x = 0.7;
        let value = tape.evaluate(0.0, &[Dual64::from(x).derivative()], &no_inputs()).unwrap();
        assert!((value[0][0].re - (x.powi(3) + x.sin())).abs() < 1e-12);
        assert!((value[0][0].eps - (3.0 * x * x + x.cos())).abs() < 1e-12);
    }

    #[test]
    fn test_min_max_and_sign() {
        let y = Expr::state_vector_slice("x", 0, 2);
        let e = Expr::concatenate(vec![y.min(0.0), y.max(0.0), y.sign()]);
        let value = e.evaluate(0.0, &[-1.5, 2.0], &no_inputs()).unwrap();
        assert_eq!(value, vec![-1.5, 0.0, 0.0, 2.0, -1.0, 1.0]);
    }

    #[test]
    fn test_harmonic_mean() {
        let y = Expr::state_vector_slice("d", 0, 3);
        let e = Expr::face_harmonic_mean(&y, vec![0.5, 0.5]);
        let value = e.evaluate(0.0, &[1.0, 3.0, 0.0], &no_inputs()).unwrap();
        assert_eq!(value.len(), 4);
        assert!((value[0] - 1.0).abs() < 1e-12);
        assert!((value[1] - 1.5).abs() < 1e-12);
        assert_eq!(value[2], 0.0);
        assert_eq!(value[3], 0.0);
    }

    #[test]
    fn test_replace_rewrites_without_mutation() {
        let x = Expr::variable("x", None);
        let e = (&x + 1.0) * (&x + 1.0);
        let rewritten = e
            .replace(&mut |node: &Expr| -> Result<Option<Expr>, ()> {
                Ok(match node.kind() {
                    Kind::Variable { .. } => Some(Expr::state_vector_slice("x", 0, 1)),
                    _ => None,
                })
            })
            .unwrap();
        assert_eq!(rewritten.evaluate(0.0, &[2.0], &no_inputs()).unwrap(), vec![9.0]);
        // Original still refers to the unknown
        assert_eq!(e.variable_names().into_iter().collect::<Vec<_>>(), vec!["x".to_string()]);
    }

    #[test]
    fn test_display() {
        let x = Expr::variable("x", None);
        let y = Expr::variable("y", None);
        assert_eq!(format!("{}", &x + 4.0 * &y), "(x + (4 * y))");
    }
}
