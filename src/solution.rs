//! Solver output and post-processing.
//!
//! A [`Solution`] stores the state vector at each output time, together with
//! the inputs used and the discretised outputs of the system it came from.
//! [`Solution::variable`] turns a named output into a [`ProcessedVariable`]
//! that can be evaluated at arbitrary times (and positions, for spatial
//! outputs) by linear interpolation of the state.
//!
//! ```ignore
//! let solution = dispatcher.solve(&system, &t_eval, &inputs)?;
//! let voltage = solution.variable("Terminal voltage")?;
//! let v = voltage.evaluate(120.0)?;
//! let c = solution.variable("c")?.evaluate_at(120.0, 0.5)?;
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use crate::discretisation::{OutputTable, OutputVariable};
use crate::expression::ExpressionError;
use crate::parameters::Inputs;

/// Result type for post-processing.
pub type SolutionResult<T> = Result<T, SolutionError>;

/// Errors raised while querying a solution.
#[derive(Debug, thiserror::Error)]
pub enum SolutionError {
    /// No output with this name
    #[error("Unknown variable '{0}'")]
    UnknownVariable(String),
    /// The solution holds no samples
    #[error("Solution has no samples")]
    Empty,
    /// A scalar query on a vector-valued output
    #[error("Variable '{name}' has {len} values; use evaluate_field")]
    NotScalar {
        /// Output name
        name: String,
        /// Number of values
        len: usize,
    },
    /// A positional query on a non-spatial output
    #[error("Variable '{0}' is not defined on a spatial domain")]
    NotSpatial(String),
    /// Concatenating solutions of different systems
    #[error("Solutions come from different discretised systems")]
    IncompatibleOutputs,
    /// Concatenating solutions that overlap in time
    #[error("Cannot append a solution starting at t = {start} to one ending at t = {end}")]
    NonMonotonic {
        /// Last time of the first solution
        end: f64,
        /// First time of the second solution
        start: f64,
    },
    /// Output evaluation failed
    #[error(transparent)]
    Expression(#[from] ExpressionError),
}

/// An event hit during a solve.
#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    /// Event name
    pub name: String,
    /// Located crossing time
    pub time: f64,
    /// Whether the event ended the solve
    pub terminating: bool,
}

/// Why a solve stopped.
#[derive(Debug, Clone, PartialEq)]
pub enum Termination {
    /// Reached the last requested time
    FinalTime,
    /// A terminating event fired
    Event {
        /// Event name
        name: String,
        /// Crossing time
        time: f64,
    },
    /// Stopped by a failure or a limit; see the accompanying error
    Incomplete,
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Termination::FinalTime => write!(f, "final time"),
            Termination::Event { name, time } => write!(f, "event '{}' at t = {}", name, time),
            Termination::Incomplete => write!(f, "incomplete"),
        }
    }
}

#[derive(Debug)]
struct Samples {
    t: Vec<f64>,
    y: Vec<Vec<f64>>,
    /// `(first sample index, inputs)`, sorted by index
    segments: Vec<(usize, Inputs)>,
}

impl Samples {
    fn inputs_at(&self, k: usize) -> &Inputs {
        let i = self.segments.partition_point(|(start, _)| *start <= k);
        &self.segments[i.saturating_sub(1)].1
    }

    /// Indices of the two samples used to interpolate at `t`, or a single
    /// sample when `t` is on the grid or no bracket exists.
    fn bracket(&self, t: f64) -> Bracket {
        let ts = &self.t;
        let n = ts.len();
        let idx = ts.partition_point(|&s| s < t);
        if idx < n && ts[idx] == t {
            return Bracket::Exact(idx);
        }
        if idx == 0 {
            return match ts.iter().position(|&s| s > ts[0]) {
                Some(j) => Bracket::Between(0, j),
                None => Bracket::Exact(0),
            };
        }
        if idx == n {
            return match ts.iter().rposition(|&s| s < ts[n - 1]) {
                Some(i) => Bracket::Between(i, n - 1),
                None => Bracket::Exact(n - 1),
            };
        }
        Bracket::Between(idx - 1, idx)
    }
}

enum Bracket {
    Exact(usize),
    Between(usize, usize),
}

/// States at the output times of a solve.
#[derive(Debug)]
pub struct Solution {
    samples: Arc<Samples>,
    outputs: Arc<OutputTable>,
    events: Vec<EventRecord>,
    termination: Termination,
    cache: Mutex<HashMap<String, Arc<ProcessedVariable>>>,
}

impl Solution {
    pub(crate) fn new(outputs: Arc<OutputTable>, t: Vec<f64>, y: Vec<Vec<f64>>, inputs: Inputs) -> Self {
        Solution {
            samples: Arc::new(Samples { t, y, segments: vec![(0, inputs)] }),
            outputs,
            events: Vec::new(),
            termination: Termination::FinalTime,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn with_events(mut self, events: Vec<EventRecord>) -> Self {
        self.events = events;
        self
    }

    pub(crate) fn with_termination(mut self, termination: Termination) -> Self {
        self.termination = termination;
        self
    }

    /// Output times, non-decreasing.
    pub fn t(&self) -> &[f64] {
        &self.samples.t
    }

    /// State vector at each output time.
    pub fn y(&self) -> &[Vec<f64>] {
        &self.samples.y
    }

    /// Number of samples.
    pub fn len(&self) -> usize {
        self.samples.t.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.t.is_empty()
    }

    pub fn last_time(&self) -> Option<f64> {
        self.samples.t.last().copied()
    }

    pub fn last_state(&self) -> Option<&[f64]> {
        self.samples.y.last().map(Vec::as_slice)
    }

    /// Inputs of the last segment.
    pub fn inputs(&self) -> &Inputs {
        self.samples.inputs_at(self.len().saturating_sub(1))
    }

    /// Inputs used for sample `k`.
    pub fn inputs_at(&self, k: usize) -> &Inputs {
        self.samples.inputs_at(k)
    }

    /// Events hit, in time order.
    pub fn events(&self) -> &[EventRecord] {
        &self.events
    }

    pub fn termination(&self) -> &Termination {
        &self.termination
    }

    /// Names of the outputs available through [`Solution::variable`].
    pub fn output_names(&self) -> impl Iterator<Item = &str> {
        self.outputs.names()
    }

    /// Outputs shared with the system that produced this solution.
    pub fn outputs(&self) -> &Arc<OutputTable> {
        &self.outputs
    }

    /// Linearly interpolated state at `t`.
    pub fn state_at(&self, t: f64) -> SolutionResult<Vec<f64>> {
        if self.is_empty() {
            return Err(SolutionError::Empty);
        }
        Ok(match self.samples.bracket(t) {
            Bracket::Exact(k) => self.samples.y[k].clone(),
            Bracket::Between(a, b) => interpolate_state(&self.samples, a, b, t),
        })
    }

    /// Post-processed output called `name`, computed once and cached.
    pub fn variable(&self, name: &str) -> SolutionResult<Arc<ProcessedVariable>> {
        if let Some(cached) = self.cache.lock().ok().and_then(|c| c.get(name).cloned()) {
            return Ok(cached);
        }
        let output = self
            .outputs
            .get(name)
            .ok_or_else(|| SolutionError::UnknownVariable(name.to_string()))?;
        let processed = Arc::new(ProcessedVariable::new(output.clone(), Arc::clone(&self.samples))?);
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(name.to_string(), Arc::clone(&processed));
        }
        Ok(processed)
    }

    /// Appends `other`, which must come from the same system and start no
    /// earlier than this solution ends.
    ///
    /// The junction sample is kept twice, so `t` stays strictly increasing
    /// except at the join.
    pub fn concat(&self, other: &Solution) -> SolutionResult<Solution> {
        if !Arc::ptr_eq(&self.outputs, &other.outputs) {
            return Err(SolutionError::IncompatibleOutputs);
        }
        if let (Some(end), Some(&start)) = (self.last_time(), other.t().first()) {
            if start < end {
                return Err(SolutionError::NonMonotonic { end, start });
            }
        }

        let offset = self.len();
        let t = self.t().iter().chain(other.t()).copied().collect();
        let y = self.y().iter().chain(other.y()).cloned().collect();
        let segments = self
            .samples
            .segments
            .iter()
            .cloned()
            .chain(other.samples.segments.iter().map(|(start, inputs)| (start + offset, inputs.clone())))
            .collect();
        let events = self.events.iter().chain(&other.events).cloned().collect();

        Ok(Solution {
            samples: Arc::new(Samples { t, y, segments }),
            outputs: Arc::clone(&self.outputs),
            events,
            termination: other.termination.clone(),
            cache: Mutex::new(HashMap::new()),
        })
    }
}

fn interpolate_state(samples: &Samples, a: usize, b: usize, t: f64) -> Vec<f64> {
    let (ta, tb) = (samples.t[a], samples.t[b]);
    let w = (t - ta) / (tb - ta);
    samples.y[a].iter().zip(&samples.y[b]).map(|(ya, yb)| ya + w * (yb - ya)).collect()
}

/// An output evaluated over a solution.
///
/// Values at the output times are computed up front; other times are served
/// by interpolating the state linearly and evaluating the output on it.
/// Queries outside the solved range log a warning and extrapolate.
#[derive(Debug)]
pub struct ProcessedVariable {
    output: OutputVariable,
    samples: Arc<Samples>,
    entries: Vec<Vec<f64>>,
}

impl ProcessedVariable {
    fn new(output: OutputVariable, samples: Arc<Samples>) -> SolutionResult<Self> {
        let entries = samples
            .t
            .iter()
            .zip(&samples.y)
            .enumerate()
            .map(|(k, (&t, y))| output.evaluate(t, y, samples.inputs_at(k)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ProcessedVariable { output, samples, entries })
    }

    pub fn name(&self) -> &str {
        self.output.name()
    }

    /// Output times.
    pub fn times(&self) -> &[f64] {
        &self.samples.t
    }

    /// Values at each output time.
    pub fn entries(&self) -> &[Vec<f64>] {
        &self.entries
    }

    pub fn is_spatial(&self) -> bool {
        self.output.is_spatial()
    }

    /// Positions of the values of a spatial output.
    pub fn positions(&self) -> Option<&[f64]> {
        self.output.positions()
    }

    /// Value of a scalar output at `t`.
    pub fn evaluate(&self, t: f64) -> SolutionResult<f64> {
        let values = self.evaluate_field(t)?;
        match values.as_slice() {
            [value] => Ok(*value),
            _ => Err(SolutionError::NotScalar { name: self.name().to_string(), len: values.len() }),
        }
    }

    /// Values of a scalar output at each of `times`.
    pub fn evaluate_many(&self, times: &[f64]) -> SolutionResult<Vec<f64>> {
        times.iter().map(|&t| self.evaluate(t)).collect()
    }

    /// All values of the output at `t`.
    pub fn evaluate_field(&self, t: f64) -> SolutionResult<Vec<f64>> {
        let ts = &self.samples.t;
        let (first, last) = match (ts.first(), ts.last()) {
            (Some(&first), Some(&last)) => (first, last),
            _ => return Err(SolutionError::Empty),
        };
        if t < first || t > last {
            log::warn!(
                "Evaluating '{}' at t = {} outside the solved range [{}, {}]; extrapolating",
                self.name(),
                t,
                first,
                last
            );
        }

        match self.samples.bracket(t) {
            Bracket::Exact(k) => Ok(self.entries[k].clone()),
            Bracket::Between(a, b) => {
                let y = interpolate_state(&self.samples, a, b, t);
                Ok(self.output.evaluate(t, &y, self.samples.inputs_at(a))?)
            }
        }
    }

    /// Value of a spatial output at time `t` and position `x`.
    pub fn evaluate_at(&self, t: f64, x: f64) -> SolutionResult<f64> {
        let positions = self
            .output
            .positions()
            .ok_or_else(|| SolutionError::NotSpatial(self.name().to_string()))?;
        let values = self.evaluate_field(t)?;

        if let Some((min, max)) = self.output.bounds() {
            if x < min || x > max {
                log::warn!(
                    "Evaluating '{}' at x = {} outside its domain [{}, {}]; extrapolating",
                    self.name(),
                    x,
                    min,
                    max
                );
            }
        }

        if positions.len() < 2 {
            return values.first().copied().ok_or(SolutionError::Empty);
        }
        let i = positions.partition_point(|&p| p < x).saturating_sub(1).min(positions.len() - 2);
        let w = (x - positions[i]) / (positions[i + 1] - positions[i]);
        Ok(values[i] + w * (values[i + 1] - values[i]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discretisation::{DiscretisedSystem, Discretiser};
    use crate::expression::{Expr, Side};
    use crate::mesh::{Mesh, Submesh1D};
    use crate::model::{BoundaryCondition, Model};
    use crate::spatial::FiniteVolume;
    use approx::assert_relative_eq;

    fn ramp() -> DiscretisedSystem {
        let mut model = Model::new("ramp");
        let x = model.create_differential("x", None).unwrap();
        model.set_rhs(&x, 1.0).unwrap();
        model.set_initial_condition(&x, 0.0).unwrap();
        model.add_output("x squared", x.expr() * x.expr()).unwrap();
        model.add_output("scaled", x.expr() * Expr::input("k")).unwrap();
        Discretiser::default().process(&model).unwrap()
    }

    fn ramp_solution(system: &DiscretisedSystem, k: f64) -> Solution {
        let inputs = Inputs::from([("k".to_string(), k)]);
        Solution::new(
            Arc::clone(system.outputs()),
            vec![0.0, 1.0, 2.0],
            vec![vec![0.0], vec![1.0], vec![2.0]],
            inputs,
        )
    }

    #[test]
    fn test_exact_and_interpolated_values() {
        let system = ramp();
        let solution = ramp_solution(&system, 3.0);
        let x2 = solution.variable("x squared").unwrap();

        assert_eq!(x2.entries(), &[vec![0.0], vec![1.0], vec![4.0]]);
        // State is interpolated, then squared
        assert_relative_eq!(x2.evaluate(1.5).unwrap(), 2.25);
        assert_relative_eq!(solution.variable("scaled").unwrap().evaluate(0.5).unwrap(), 1.5);
        assert_eq!(x2.evaluate_many(&[0.0, 2.0]).unwrap(), vec![0.0, 4.0]);
    }

    #[test]
    fn test_extrapolation() {
        let system = ramp();
        let solution = ramp_solution(&system, 1.0);
        let x = solution.variable("x").unwrap();
        assert_relative_eq!(x.evaluate(3.0).unwrap(), 3.0);
        assert_relative_eq!(x.evaluate(-1.0).unwrap(), -1.0);
    }

    #[test]
    fn test_unknown_variable() {
        let system = ramp();
        let solution = ramp_solution(&system, 1.0);
        assert!(matches!(solution.variable("nope"), Err(SolutionError::UnknownVariable(_))));
    }

    #[test]
    fn test_variables_are_cached() {
        let system = ramp();
        let solution = ramp_solution(&system, 1.0);
        let a = solution.variable("x").unwrap();
        let b = solution.variable("x").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_concat() {
        let system = ramp();
        let first = ramp_solution(&system, 1.0);
        let second = Solution::new(
            Arc::clone(system.outputs()),
            vec![2.0, 3.0],
            vec![vec![2.0], vec![3.0]],
            Inputs::from([("k".to_string(), 10.0)]),
        );
        let joined = first.concat(&second).unwrap();

        assert_eq!(joined.t(), &[0.0, 1.0, 2.0, 2.0, 3.0]);
        assert_eq!(joined.last_state(), Some(&[3.0][..]));
        assert_eq!(joined.inputs_at(1)["k"], 1.0);
        assert_eq!(joined.inputs_at(3)["k"], 10.0);

        // Each segment is post-processed with its own inputs
        let scaled = joined.variable("scaled").unwrap();
        assert_eq!(scaled.entries()[2], vec![2.0]);
        assert_eq!(scaled.entries()[3], vec![20.0]);
        assert_relative_eq!(scaled.evaluate(2.5).unwrap(), 25.0);
    }

    #[test]
    fn test_concat_rejects_overlap_and_foreign_outputs() {
        let system = ramp();
        let first = ramp_solution(&system, 1.0);
        let early = Solution::new(Arc::clone(system.outputs()), vec![1.5], vec![vec![1.5]], Inputs::new());
        assert!(matches!(first.concat(&early), Err(SolutionError::NonMonotonic { .. })));

        let other = ramp();
        let foreign = ramp_solution(&other, 1.0);
        assert!(matches!(first.concat(&foreign), Err(SolutionError::IncompatibleOutputs)));
    }

    #[test]
    fn test_spatial_variable() {
        let mut model = Model::new("profile");
        let c = model.create_differential("c", Some("rod")).unwrap();
        model.set_rhs(&c, 0.0).unwrap();
        model.set_initial_condition(&c, Expr::spatial_coordinate("rod")).unwrap();
        model.set_boundary_condition(&c, Side::Left, BoundaryCondition::neumann(0.0)).unwrap();
        model.set_boundary_condition(&c, Side::Right, BoundaryCondition::neumann(0.0)).unwrap();
        let mesh = Mesh::new().with_submesh("rod", Submesh1D::uniform(0.0, 1.0, 4).unwrap());
        let system =
            Discretiser::new(mesh).with_spatial_method("rod", FiniteVolume::new()).process(&model).unwrap();

        let y0 = system.initial_state(&Inputs::new()).unwrap();
        let solution = Solution::new(Arc::clone(system.outputs()), vec![0.0], vec![y0], Inputs::new());
        let c = solution.variable("c").unwrap();

        assert!(c.is_spatial());
        assert_eq!(c.positions().map(|p| p.len()), Some(4));
        assert!(matches!(c.evaluate(0.0), Err(SolutionError::NotScalar { len: 4, .. })));
        // Linear profile is reproduced between and beyond the cell centres
        assert_relative_eq!(c.evaluate_at(0.0, 0.3).unwrap(), 0.3, epsilon = 1e-12);
        assert_relative_eq!(c.evaluate_at(0.0, 1.0).unwrap(), 1.0, epsilon = 1e-12);
        // A single sample is constant in time
        assert_relative_eq!(c.evaluate_at(5.0, 0.5).unwrap(), 0.5, epsilon = 1e-12);
    }

    #[test]
    fn test_termination_display() {
        let event = Termination::Event { name: "empty".to_string(), time: 2.5 };
        assert_eq!(event.to_string(), "event 'empty' at t = 2.5");
        assert_eq!(Termination::FinalTime.to_string(), "final time");
    }
}
