//! Driving a backend over a discretised system.
//!
//! The [`Dispatcher`] owns every concern that is the same for all backends:
//!
//! - checking that the backend can handle the system (capabilities, inputs,
//!   output times) before any work is done
//! - projecting the initial state onto the algebraic constraints
//! - scanning accepted steps for event crossings and locating them by
//!   bisection
//! - enforcing the step and wall-clock budget
//! - packaging samples, events and failures into a [`Solution`]
//!
//! # Simultaneous events
//!
//! Every event whose value changes sign over an accepted step is located by
//! bisection to within [`SolverConfig::event_tolerance`]. The earliest
//! terminating crossing ends the solve; terminating crossings within the
//! tolerance of the earliest are tied and the one declared first wins.
//! Non-terminating crossings up to that time are logged and recorded.

use std::fmt;
use std::sync::Arc;

use crate::discretisation::DiscretisedSystem;
use crate::expression::ExpressionError;
use crate::model::EventKind;
use crate::parameters::Inputs;
use crate::registry::MethodRegistry;
use crate::solution::{EventRecord, Solution, Termination};
use crate::solvers::algebraic::solve_algebraic;
use crate::solvers::{required_capabilities, Backend, Budget, SolverConfig, SolverError, SolverResult};

/// Bisection iterations allowed per event.
const MAX_BISECTIONS: usize = 200;

fn crosses(before: f64, after: f64) -> bool {
    (before > 0.0 && after <= 0.0) || (before < 0.0 && after >= 0.0)
}

/// Samples collected so far, used to build partial solutions.
struct Progress<'a> {
    system: &'a DiscretisedSystem,
    inputs: &'a Inputs,
    times: Vec<f64>,
    states: Vec<Vec<f64>>,
    events: Vec<EventRecord>,
}

impl Progress<'_> {
    fn push(&mut self, t: f64, y: Vec<f64>) {
        self.times.push(t);
        self.states.push(y);
    }

    fn into_solution(self, termination: Termination) -> Solution {
        Solution::new(Arc::clone(self.system.outputs()), self.times, self.states, self.inputs.clone())
            .with_events(self.events)
            .with_termination(termination)
    }

    /// Attaches the samples reached so far to a failure at `(t, y)`.
    fn fail(&self, error: SolverError, t: f64, y: &[f64]) -> SolverError {
        let partial = |t: f64, y: &[f64]| {
            if self.times.is_empty() {
                return None;
            }
            let mut times = self.times.clone();
            let mut states = self.states.clone();
            if times.last().is_some_and(|&last| t > last) {
                times.push(t);
                states.push(y.to_vec());
            }
            let solution = Solution::new(Arc::clone(self.system.outputs()), times, states, self.inputs.clone())
                .with_events(self.events.clone())
                .with_termination(Termination::Incomplete);
            Some(Box::new(solution))
        };

        match error {
            SolverError::IntegrationFailed { message, t, y, .. } => {
                let partial = partial(t, &y);
                SolverError::IntegrationFailed { message, t, y, partial }
            }
            SolverError::Timeout { reason, t, y, .. } => {
                let partial = partial(t, &y);
                SolverError::Timeout { reason, t, y, partial }
            }
            SolverError::ODESolverFailed(_)
            | SolverError::MaxIterationsExceeded
            | SolverError::SingularJacobian
            | SolverError::Diverged => SolverError::IntegrationFailed {
                message: error.to_string(),
                t,
                y: y.to_vec(),
                partial: partial(t, y),
            },
            other => other,
        }
    }
}

/// A located event crossing.
struct Crossing {
    index: usize,
    time: f64,
    state: Vec<f64>,
}

/// Runs one backend over discretised systems.
///
/// # Examples
///
/// ```ignore
/// use symdae::solvers::{AlgebraicSolver, Dispatcher, SolverError};
///
/// let result = Dispatcher::new(AlgebraicSolver::new()).solve(&system, &[0.0], &Inputs::new());
/// match result {
///     Ok(solution) => println!("x = {:?}", solution.last_state()),
///     Err(SolverError::IncompatibleSolver { required, .. }) => println!("needs {}", required),
///     Err(e) => return Err(e.into()),
/// }
/// ```
pub struct Dispatcher {
    backend: Box<dyn Backend>,
    config: SolverConfig,
    registry: Option<MethodRegistry>,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("backend", &self.backend.name())
            .field("config", &self.config)
            .finish()
    }
}

impl Dispatcher {
    /// Creates a dispatcher with the default [`SolverConfig`].
    pub fn new(backend: impl Backend + 'static) -> Self {
        Dispatcher { backend: Box::new(backend), config: SolverConfig::default(), registry: None }
    }

    pub fn with_config(mut self, config: SolverConfig) -> Self {
        self.config = config;
        self
    }

    /// Records the backend name into `registry` on every solve, and Newton
    /// whenever an initial state has to be made consistent.
    pub fn with_registry(mut self, registry: MethodRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn config(&self) -> &SolverConfig {
        &self.config
    }

    pub fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    /// Fails with [`SolverError::IncompatibleSolver`] unless the backend
    /// covers every capability `system` requires.
    pub fn check_compatibility(&self, system: &DiscretisedSystem) -> SolverResult<()> {
        let required = required_capabilities(system);
        let provided = self.backend.capabilities();
        if provided.is_superset_of(required) {
            Ok(())
        } else {
            Err(SolverError::IncompatibleSolver { solver: self.backend.name(), required, provided })
        }
    }

    fn prepare(&self, system: &DiscretisedSystem, inputs: &Inputs) -> SolverResult<()> {
        self.check_compatibility(system)?;
        system.check_inputs(inputs).map_err(|e| match e {
            ExpressionError::MissingInput(name) => SolverError::MissingInput(name),
            other => SolverError::Expression(other),
        })?;
        if let Some(registry) = &self.registry {
            registry.register(&self.backend.name());
        }
        Ok(())
    }

    fn check_times(&self, system: &DiscretisedSystem, t_eval: &[f64]) -> SolverResult<()> {
        if t_eval.is_empty() {
            return Err(SolverError::InvalidTimePoints("no output times given".to_string()));
        }
        if let Some(t) = t_eval.iter().find(|t| !t.is_finite()) {
            return Err(SolverError::InvalidTimePoints(format!("{} is not finite", t)));
        }
        if let Some(w) = t_eval.windows(2).find(|w| w[1] <= w[0]) {
            return Err(SolverError::InvalidTimePoints(format!(
                "times must increase strictly, found {} after {}",
                w[1], w[0]
            )));
        }
        if system.n_differential() > 0 && t_eval.len() < 2 {
            return Err(SolverError::InvalidTimePoints(
                "time integration needs at least two output times".to_string(),
            ));
        }
        Ok(())
    }

    /// Solves `system` from its own initial state, reporting at `t_eval`.
    pub fn solve(&self, system: &DiscretisedSystem, t_eval: &[f64], inputs: &Inputs) -> SolverResult<Solution> {
        self.prepare(system, inputs)?;
        let y0 = system.initial_state(inputs)?;
        self.run(system, &y0, t_eval, inputs)
    }

    /// Solves `system` from the state `y0`, reporting at `t_eval`.
    pub fn solve_from(
        &self,
        system: &DiscretisedSystem,
        y0: &[f64],
        t_eval: &[f64],
        inputs: &Inputs,
    ) -> SolverResult<Solution> {
        self.prepare(system, inputs)?;
        self.run(system, y0, t_eval, inputs)
    }

    /// Advances by `dt` from the end of `previous` (or from the initial
    /// state at `t = 0`), returning `previous` extended by the new segment.
    ///
    /// The segment has [`SolverConfig::step_points`] evenly spaced samples
    /// and may use different inputs from earlier segments.
    pub fn step(
        &self,
        system: &DiscretisedSystem,
        previous: Option<&Solution>,
        dt: f64,
        inputs: &Inputs,
    ) -> SolverResult<Solution> {
        if !(dt.is_finite() && dt > 0.0) {
            return Err(SolverError::InvalidTimePoints(format!("step of {} is not positive", dt)));
        }
        if let Some(Termination::Event { name, .. }) = previous.map(Solution::termination) {
            return Err(SolverError::AlreadyTerminated(name.clone()));
        }
        self.prepare(system, inputs)?;

        let start = previous.and_then(|p| Some((p.last_time()?, p.last_state()?.to_vec())));
        let (t0, y0) = match start {
            Some(start) => start,
            None => (0.0, system.initial_state(inputs)?),
        };
        let n = self.config.step_points.max(2);
        let t_eval: Vec<f64> = (0..n).map(|i| t0 + dt * i as f64 / (n - 1) as f64).collect();

        let previous = match previous {
            Some(previous) => previous,
            None => return self.run(system, &y0, &t_eval, inputs),
        };
        match self.run(system, &y0, &t_eval, inputs) {
            Ok(segment) => Ok(previous.concat(&segment)?),
            Err(SolverError::IntegrationFailed { message, t, y, partial }) => {
                let partial = partial.and_then(|p| previous.concat(&p).ok()).map(Box::new);
                Err(SolverError::IntegrationFailed { message, t, y, partial })
            }
            Err(SolverError::Timeout { reason, t, y, partial }) => {
                let partial = partial.and_then(|p| previous.concat(&p).ok()).map(Box::new);
                Err(SolverError::Timeout { reason, t, y, partial })
            }
            Err(e) => Err(e),
        }
    }

    /// Solves the algebraic rows for the algebraic entries of `y0`, holding
    /// the differential entries fixed.
    ///
    /// A state that already satisfies every algebraic row to within the root
    /// tolerance is returned unchanged.
    pub fn consistent_initial_conditions(
        &self,
        system: &DiscretisedSystem,
        t0: f64,
        y0: &[f64],
        inputs: &Inputs,
    ) -> SolverResult<Vec<f64>> {
        if y0.len() != system.len() {
            return Err(SolverError::InvalidInitialConditions(format!(
                "expected {} state entries, found {}",
                system.len(),
                y0.len()
            )));
        }
        if system.n_algebraic() == 0 {
            return Ok(y0.to_vec());
        }

        let g = system.algebraic(t0, y0, inputs)?;
        let tolerance = self.config.root_tolerance;
        if g.iter().all(|v| v.abs() <= tolerance) {
            return Ok(y0.to_vec());
        }
        let violation = g.iter().map(|v| v.abs()).fold(0.0, f64::max);
        log::warn!(
            "Initial state of '{}' violates its algebraic equations by {:.3e}; solving for consistent values",
            system.name(),
            violation
        );
        if let Some(registry) = &self.registry {
            registry.register("newton");
        }
        solve_algebraic(system, t0, y0, inputs, &self.config.newton())
    }

    fn run(
        &self,
        system: &DiscretisedSystem,
        y0: &[f64],
        t_eval: &[f64],
        inputs: &Inputs,
    ) -> SolverResult<Solution> {
        self.check_times(system, t_eval)?;
        if y0.len() != system.len() {
            return Err(SolverError::InvalidInitialConditions(format!(
                "expected {} state entries, found {}",
                system.len(),
                y0.len()
            )));
        }

        let progress =
            Progress { system, inputs, times: Vec::new(), states: Vec::new(), events: Vec::new() };
        if system.n_differential() == 0 {
            self.run_algebraic(progress, y0, t_eval)
        } else {
            self.run_differential(progress, y0, t_eval)
        }
    }

    fn run_algebraic(&self, mut progress: Progress<'_>, y0: &[f64], t_eval: &[f64]) -> SolverResult<Solution> {
        let (system, inputs) = (progress.system, progress.inputs);
        if !system.events().is_empty() {
            log::debug!("Events of '{}' are ignored without differential unknowns", system.name());
        }

        let mut budget = Budget::new(&self.config);
        let mut guess = y0.to_vec();
        for &t in t_eval {
            let y = match self.backend.root_find(system, t, &guess, inputs, &self.config) {
                Ok(y) => y,
                Err(e) => {
                    let (reached, y_reached) = match (progress.times.last(), progress.states.last()) {
                        (Some(&reached), Some(y)) => (reached, y.clone()),
                        _ => (t, guess),
                    };
                    return Err(progress.fail(e, reached, &y_reached));
                }
            };
            if let Err(e) = budget.charge(t, &y) {
                return Err(progress.fail(e, t, &y));
            }
            progress.push(t, y.clone());
            guess = y;
        }

        log::info!("Solved '{}' at {} times with {}", system.name(), t_eval.len(), self.backend.name());
        Ok(progress.into_solution(Termination::FinalTime))
    }

    fn run_differential(&self, mut progress: Progress<'_>, y0: &[f64], t_eval: &[f64]) -> SolverResult<Solution> {
        let (system, inputs) = (progress.system, progress.inputs);
        let mut budget = Budget::new(&self.config);

        let t_start = t_eval[0];
        let mut y = self.consistent_initial_conditions(system, t_start, y0, inputs)?;
        let mut g = system.event_values(t_start, &y, inputs)?;
        progress.push(t_start, y.clone());

        for window in t_eval.windows(2) {
            let (ta, tb) = (window[0], window[1]);
            let trajectory =
                match self.backend.advance(system, ta, &y, tb, inputs, &self.config, &mut budget) {
                    Ok(trajectory) => trajectory,
                    Err(e) => return Err(progress.fail(e, ta, &y)),
                };

            let mut t_prev = ta;
            for (t_k, y_k) in trajectory.t.into_iter().zip(trajectory.y) {
                let g_k = system.event_values(t_k, &y_k, inputs)?;
                let step = (t_prev, y.as_slice(), g.as_slice());
                let winner = match self.scan_events(system, step, (t_k, y_k.as_slice(), g_k.as_slice()), inputs, &mut budget) {
                    Ok(crossings) => self.record_events(&mut progress, crossings),
                    Err(e) => return Err(progress.fail(e, t_prev, &y)),
                };
                if let Some(crossing) = winner {
                    let name = system.events()[crossing.index].name.clone();
                    let time = crossing.time;
                    progress.push(time, crossing.state);
                    log::info!("Solve of '{}' stopped by event '{}' at t = {}", system.name(), name, time);
                    return Ok(progress.into_solution(Termination::Event { name, time }));
                }
                t_prev = t_k;
                y = y_k;
                g = g_k;
            }
            progress.push(tb, y.clone());
        }

        log::info!(
            "Solved '{}' to t = {} in {} steps with {}",
            system.name(),
            t_eval[t_eval.len() - 1],
            budget.steps(),
            self.backend.name()
        );
        Ok(progress.into_solution(Termination::FinalTime))
    }

    /// Locates every event crossing over one accepted step.
    fn scan_events(
        &self,
        system: &DiscretisedSystem,
        (t0, y0, g0): (f64, &[f64], &[f64]),
        (t1, y1, g1): (f64, &[f64], &[f64]),
        inputs: &Inputs,
        budget: &mut Budget,
    ) -> SolverResult<Vec<Crossing>> {
        let mut crossings = Vec::new();
        for (index, (&before, &after)) in g0.iter().zip(g1).enumerate() {
            if !crosses(before, after) {
                continue;
            }
            let (mut lo, mut g_lo) = (t0, before);
            let (mut hi, mut y_hi) = (t1, y1.to_vec());
            for _ in 0..MAX_BISECTIONS {
                if hi - lo <= self.config.event_tolerance * (1.0 + hi.abs()) {
                    break;
                }
                let mid = 0.5 * (lo + hi);
                let trajectory = self.backend.advance(system, t0, y0, mid, inputs, &self.config, budget)?;
                let y_mid = trajectory.y.last().cloned().unwrap_or_else(|| y0.to_vec());
                let g_mid = system.event_values(mid, &y_mid, inputs)?[index];
                if crosses(g_lo, g_mid) {
                    hi = mid;
                    y_hi = y_mid;
                } else {
                    lo = mid;
                    g_lo = g_mid;
                }
            }
            crossings.push(Crossing { index, time: hi, state: y_hi });
        }
        Ok(crossings)
    }

    /// Picks the terminating winner and records the events up to it.
    fn record_events(&self, progress: &mut Progress<'_>, crossings: Vec<Crossing>) -> Option<Crossing> {
        let events = progress.system.events();
        let terminating = |c: &Crossing| events[c.index].kind == EventKind::Terminating;

        let earliest = crossings.iter().filter(|&c| terminating(c)).map(|c| c.time).fold(f64::INFINITY, f64::min);
        let tolerance = self.config.event_tolerance * (1.0 + earliest.abs());
        let (mut winners, rest): (Vec<Crossing>, Vec<Crossing>) =
            crossings.into_iter().partition(|c| terminating(c) && c.time <= earliest + tolerance);
        winners.sort_by_key(|c| c.index);
        let winner = winners.into_iter().next();
        let horizon = winner.as_ref().map_or(f64::INFINITY, |w| w.time);

        let mut notes: Vec<Crossing> =
            rest.into_iter().filter(|c| !terminating(c) && c.time <= horizon).collect();
        notes.sort_by(|a, b| a.time.total_cmp(&b.time).then(a.index.cmp(&b.index)));
        for note in notes {
            let name = &events[note.index].name;
            log::info!("Event '{}' crossed zero at t = {}", name, note.time);
            progress.events.push(EventRecord { name: name.clone(), time: note.time, terminating: false });
        }

        if let Some(w) = &winner {
            progress.events.push(EventRecord {
                name: events[w.index].name.clone(),
                time: w.time,
                terminating: true,
            });
        }
        winner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discretisation::Discretiser;
    use crate::model::{Event, Model};
    use crate::solvers::{AlgebraicSolver, ImplicitDaeSolver};

    fn falling(events: Vec<Event>) -> DiscretisedSystem {
        // dh/dt = -1, h(0) = 1
        let mut model = Model::new("falling");
        let h = model.create_differential("h", None).unwrap();
        model.set_rhs(&h, -1.0).unwrap();
        model.set_initial_condition(&h, 1.0).unwrap();
        for event in events {
            model.add_event(event).unwrap();
        }
        Discretiser::default().process(&model).unwrap()
    }

    fn h() -> crate::expression::Expr {
        crate::expression::Expr::variable("h", None)
    }

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(ImplicitDaeSolver::new())
    }

    #[test]
    fn test_crossing_rule() {
        assert!(crosses(1.0, -1.0));
        assert!(crosses(1.0, 0.0));
        assert!(crosses(-1.0, 0.5));
        assert!(!crosses(0.0, -1.0));
        assert!(!crosses(1.0, 2.0));
    }

    #[test]
    fn test_terminating_event() {
        let system = falling(vec![Event::terminating("ground", h() - 0.25)]);
        let solution = dispatcher().solve(&system, &[0.0, 0.5, 1.0], &Inputs::new()).unwrap();

        let t_end = solution.last_time().unwrap();
        assert!((t_end - 0.75).abs() < 1e-8);
        assert_eq!(solution.t().len(), 3);
        match solution.termination() {
            Termination::Event { name, time } => {
                assert_eq!(name, "ground");
                assert_eq!(*time, t_end);
            }
            other => panic!("unexpected termination {:?}", other),
        }
        assert_eq!(solution.events().len(), 1);
    }

    #[test]
    fn test_simultaneous_events_prefer_first_declared() {
        let system = falling(vec![
            Event::terminating("first", h() - 0.5),
            Event::terminating("second", 2.0 * h() - 1.0),
        ]);
        let solution = dispatcher().solve(&system, &[0.0, 1.0], &Inputs::new()).unwrap();
        assert!(matches!(solution.termination(), Termination::Event { name, .. } if name == "first"));
    }

    #[test]
    fn test_earliest_event_wins() {
        let system = falling(vec![
            Event::terminating("late", h() - 0.2),
            Event::terminating("early", h() - 0.6),
        ]);
        let solution = dispatcher().solve(&system, &[0.0, 1.0], &Inputs::new()).unwrap();
        assert!(matches!(solution.termination(), Termination::Event { name, .. } if name == "early"));
        assert!((solution.last_time().unwrap() - 0.4).abs() < 1e-8);
    }

    #[test]
    fn test_non_terminating_events_are_recorded() {
        let system = falling(vec![
            Event::non_terminating("halfway", h() - 0.5),
            Event::non_terminating("after end", h() + 5.0),
        ]);
        let solution = dispatcher().solve(&system, &[0.0, 1.0], &Inputs::new()).unwrap();

        assert_eq!(solution.termination(), &Termination::FinalTime);
        assert_eq!(solution.events().len(), 1);
        let event = &solution.events()[0];
        assert_eq!(event.name, "halfway");
        assert!(!event.terminating);
        assert!((event.time - 0.5).abs() < 1e-8);
    }

    #[test]
    fn test_invalid_time_points() {
        let system = falling(Vec::new());
        let d = dispatcher();
        assert!(matches!(d.solve(&system, &[], &Inputs::new()), Err(SolverError::InvalidTimePoints(_))));
        assert!(matches!(d.solve(&system, &[0.0], &Inputs::new()), Err(SolverError::InvalidTimePoints(_))));
        assert!(matches!(
            d.solve(&system, &[0.0, 1.0, 1.0], &Inputs::new()),
            Err(SolverError::InvalidTimePoints(_))
        ));
    }

    #[test]
    fn test_missing_input() {
        let mut model = Model::new("driven");
        let x = model.create_differential("x", None).unwrap();
        model.set_rhs(&x, crate::expression::Expr::input("rate")).unwrap();
        model.set_initial_condition(&x, 0.0).unwrap();
        let system = Discretiser::default().process(&model).unwrap();

        let result = dispatcher().solve(&system, &[0.0, 1.0], &Inputs::new());
        assert!(matches!(result, Err(SolverError::MissingInput(name)) if name == "rate"));
    }

    #[test]
    fn test_registry_records_backend() {
        let registry = MethodRegistry::new();
        let system = falling(Vec::new());
        dispatcher().with_registry(registry.clone()).solve(&system, &[0.0, 0.1], &Inputs::new()).unwrap();
        assert!(registry.contains("backward-euler"));
    }

    #[test]
    fn test_incompatible_backend() {
        let system = falling(Vec::new());
        let result = Dispatcher::new(AlgebraicSolver::new()).solve(&system, &[0.0, 1.0], &Inputs::new());
        assert!(matches!(result, Err(SolverError::IncompatibleSolver { .. })));
    }

    #[test]
    fn test_step_after_terminating_event() {
        let system = falling(vec![Event::terminating("ground", h())]);
        let d = dispatcher();
        let first = d.step(&system, None, 2.0, &Inputs::new()).unwrap();
        assert!(matches!(first.termination(), Termination::Event { .. }));
        let result = d.step(&system, Some(&first), 1.0, &Inputs::new());
        assert!(matches!(result, Err(SolverError::AlreadyTerminated(name)) if name == "ground"));
    }
}
