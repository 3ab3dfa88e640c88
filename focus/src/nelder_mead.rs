//! Bounded Nelder-Mead simplex search
//!
//! Derivative-free minimization of a black-box objective over a box. Every
//! candidate vertex is clipped into the bounds. The objective and the
//! per-iteration callback can both end the search early; that is reported as
//! [`Status::Cancelled`] with the best vertex found so far rather than as an
//! error.
//!
//! Coefficients are the standard ones: reflection 1, expansion 2, contraction
//! 0.5, shrink 0.5. The initial simplex steps 5 % along each axis from `x0`,
//! or 0.00025 for zero coordinates.
//!
//! Not-a-number objective values rank behind every number and never compare
//! as an improvement.

use std::cmp::Ordering;
use std::fmt;
use std::ops::ControlFlow;

use nalgebra::SVector;
use thiserror::Error;
use tracing::warn;

const REFLECTION: f64 = 1.0;
const EXPANSION: f64 = 2.0;
const CONTRACTION: f64 = 0.5;
const SHRINK: f64 = 0.5;

const NONZERO_STEP: f64 = 0.05;
const ZERO_STEP: f64 = 0.00025;

/// Iteration and evaluation cap per dimension when neither limit is given.
const DEFAULT_LIMIT_PER_DIMENSION: usize = 200;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum OptimizeError {
    #[error("lower bound {lower} exceeds upper bound {upper} for parameter {index}")]
    InvalidBounds { index: usize, lower: f64, upper: f64 },
}

/// Inclusive box constraints.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds<const N: usize> {
    pub lower: [f64; N],
    pub upper: [f64; N],
}

impl<const N: usize> Bounds<N> {
    pub fn new(pairs: [(f64, f64); N]) -> Self {
        Self {
            lower: pairs.map(|(lower, _)| lower),
            upper: pairs.map(|(_, upper)| upper),
        }
    }

    pub fn validate(&self) -> Result<(), OptimizeError> {
        for index in 0..N {
            let (lower, upper) = (self.lower[index], self.upper[index]);
            if !(lower <= upper) {
                return Err(OptimizeError::InvalidBounds {
                    index,
                    lower,
                    upper,
                });
            }
        }
        Ok(())
    }

    pub fn contains(&self, x: &[f64; N]) -> bool {
        (0..N).all(|i| self.lower[i] <= x[i] && x[i] <= self.upper[i])
    }

    fn clip(&self, mut x: SVector<f64, N>) -> SVector<f64, N> {
        for i in 0..N {
            x[i] = x[i].clamp(self.lower[i], self.upper[i]);
        }
        x
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Options {
    /// Largest vertex distance from the best vertex at convergence
    pub xatol: f64,
    /// Largest objective spread across the simplex at convergence
    pub fatol: f64,
    /// `None` is unlimited, unless `maxfev` is also `None`
    pub maxiter: Option<usize>,
    /// `None` is unlimited, unless `maxiter` is also `None`
    pub maxfev: Option<usize>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            xatol: 1e-4,
            fatol: 1e-4,
            maxiter: None,
            maxfev: None,
        }
    }
}

impl Options {
    /// Effective (iteration, evaluation) caps.
    ///
    /// With neither limit set both default to 200 per dimension, so a
    /// search never runs forever by accident.
    fn limits(&self, dimension: usize) -> (usize, usize) {
        let default = DEFAULT_LIMIT_PER_DIMENSION * dimension;
        match (self.maxiter, self.maxfev) {
            (None, None) => (default, default),
            (None, Some(maxfev)) => (usize::MAX, maxfev),
            (Some(maxiter), None) => (maxiter, usize::MAX),
            (Some(maxiter), Some(maxfev)) => (maxiter, maxfev),
        }
    }
}

/// Why a search ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Converged,
    MaxEvaluations,
    MaxIterations,
    Cancelled,
}

impl Status {
    /// Numeric code: 0, 1, 2, or 99 for an early stop.
    pub fn code(&self) -> i32 {
        match self {
            Status::Converged => 0,
            Status::MaxEvaluations => 1,
            Status::MaxIterations => 2,
            Status::Cancelled => 99,
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            Status::Converged => "Optimization terminated successfully.",
            Status::MaxEvaluations => "Maximum number of function evaluations has been exceeded.",
            Status::MaxIterations => "Maximum number of iterations has been exceeded.",
            Status::Cancelled => "Ended manually.",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OptimizeResult<const N: usize> {
    /// Best vertex; NaN when nothing was evaluated
    pub x: [f64; N],
    pub fun: f64,
    pub nit: usize,
    pub nfev: usize,
    pub status: Status,
}

impl<const N: usize> OptimizeResult<N> {
    pub fn is_cancelled(&self) -> bool {
        self.status == Status::Cancelled
    }
}

/// Returned by an objective to end the search early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

/// Best vertex after an iteration, handed to the callback.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Iterate<const N: usize> {
    pub x: [f64; N],
    pub fun: f64,
    pub nit: usize,
    pub nfev: usize,
}

enum Halt {
    MaxEvaluations,
    Cancelled,
}

enum Stop {
    Converged,
    LimitReached,
    Cancelled,
}

struct Evaluator<F> {
    objective: F,
    nfev: usize,
    maxfev: usize,
}

impl<F> Evaluator<F> {
    fn eval<const N: usize>(&mut self, x: &SVector<f64, N>) -> Result<f64, Halt>
    where
        F: FnMut(&[f64; N]) -> Result<f64, Cancelled>,
    {
        if self.nfev >= self.maxfev {
            return Err(Halt::MaxEvaluations);
        }
        let point: [f64; N] = (*x).into();
        let value = (self.objective)(&point).map_err(|Cancelled| Halt::Cancelled)?;
        // only completed evaluations count
        self.nfev += 1;
        Ok(value)
    }
}

fn rank(value: f64) -> f64 {
    if value.is_nan() {
        f64::INFINITY
    } else {
        value
    }
}

struct Simplex<const N: usize> {
    vertices: Vec<SVector<f64, N>>,
    values: Vec<f64>,
}

impl<const N: usize> Simplex<N> {
    fn initial(x0: SVector<f64, N>, bounds: &Bounds<N>) -> Self {
        let mut vertices = Vec::with_capacity(N + 1);
        vertices.push(x0);
        for k in 0..N {
            let mut y = x0;
            y[k] = if y[k] != 0.0 {
                (1.0 + NONZERO_STEP) * y[k]
            } else {
                ZERO_STEP
            };
            vertices.push(y);
        }

        // Steps that leave the box are mirrored back in before clipping, so a
        // start on the upper bound still spans a proper simplex.
        for vertex in vertices.iter_mut() {
            for i in 0..N {
                if vertex[i] > bounds.upper[i] {
                    vertex[i] = 2.0 * bounds.upper[i] - vertex[i];
                }
            }
            *vertex = bounds.clip(*vertex);
        }

        Self {
            vertices,
            values: vec![f64::INFINITY; N + 1],
        }
    }

    fn sort(&mut self) {
        let mut order: Vec<usize> = (0..=N).collect();
        order.sort_by(|&a, &b| {
            rank(self.values[a])
                .partial_cmp(&rank(self.values[b]))
                .unwrap_or(Ordering::Equal)
        });
        self.vertices = order.iter().map(|&i| self.vertices[i]).collect();
        self.values = order.iter().map(|&i| self.values[i]).collect();
    }

    fn replace_worst(&mut self, vertex: SVector<f64, N>, value: f64) {
        self.vertices[N] = vertex;
        self.values[N] = value;
    }

    fn converged(&self, xatol: f64, fatol: f64) -> bool {
        let best = &self.vertices[0];
        let x_spread = self.vertices[1..]
            .iter()
            .map(|v| (v - best).abs().max())
            .fold(0.0, f64::max);
        let f_spread = self.values[1..]
            .iter()
            .map(|f| (self.values[0] - f).abs())
            .fold(0.0, |acc: f64, d| if d.is_nan() { f64::NAN } else { acc.max(d) });
        x_spread <= xatol && f_spread <= fatol
    }

    fn best(&self) -> ([f64; N], f64) {
        (self.vertices[0].into(), self.values[0])
    }
}

struct Search<'b, F, const N: usize> {
    simplex: Simplex<N>,
    evaluator: Evaluator<F>,
    bounds: &'b Bounds<N>,
    nit: usize,
}

impl<F, const N: usize> Search<'_, F, N>
where
    F: FnMut(&[f64; N]) -> Result<f64, Cancelled>,
{
    fn run<C>(
        &mut self,
        options: &Options,
        maxiter: usize,
        callback: &mut C,
    ) -> Result<Stop, Halt>
    where
        C: FnMut(&Iterate<N>) -> ControlFlow<()>,
    {
        for k in 0..=N {
            let vertex = self.simplex.vertices[k];
            self.simplex.values[k] = self.evaluator.eval(&vertex)?;
        }
        self.simplex.sort();
        self.nit = 1;

        while self.evaluator.nfev < self.evaluator.maxfev && self.nit < maxiter {
            if self.simplex.converged(options.xatol, options.fatol) {
                return Ok(Stop::Converged);
            }

            self.step()?;
            self.nit += 1;
            self.simplex.sort();

            let (x, fun) = self.simplex.best();
            let iterate = Iterate {
                x,
                fun,
                nit: self.nit,
                nfev: self.evaluator.nfev,
            };
            if callback(&iterate).is_break() {
                return Ok(Stop::Cancelled);
            }
        }
        Ok(Stop::LimitReached)
    }

    fn step(&mut self) -> Result<(), Halt> {
        let centroid = self.simplex.vertices[..N]
            .iter()
            .fold(SVector::<f64, N>::zeros(), |acc, v| acc + v)
            / N as f64;
        let worst = self.simplex.vertices[N];
        let f_best = self.simplex.values[0];
        let f_second_worst = self.simplex.values[N - 1];
        let f_worst = self.simplex.values[N];

        let xr = self
            .bounds
            .clip(centroid * (1.0 + REFLECTION) - worst * REFLECTION);
        let fxr = self.evaluator.eval(&xr)?;

        if fxr < f_best {
            let xe = self.bounds.clip(
                centroid * (1.0 + REFLECTION * EXPANSION) - worst * (REFLECTION * EXPANSION),
            );
            let fxe = self.evaluator.eval(&xe)?;
            if fxe < fxr {
                self.simplex.replace_worst(xe, fxe);
            } else {
                self.simplex.replace_worst(xr, fxr);
            }
            return Ok(());
        }

        if fxr < f_second_worst {
            self.simplex.replace_worst(xr, fxr);
            return Ok(());
        }

        let shrink = if fxr < f_worst {
            let xc = self.bounds.clip(
                centroid * (1.0 + CONTRACTION * REFLECTION) - worst * (CONTRACTION * REFLECTION),
            );
            let fxc = self.evaluator.eval(&xc)?;
            if fxc <= fxr {
                self.simplex.replace_worst(xc, fxc);
                false
            } else {
                true
            }
        } else {
            let xcc = self
                .bounds
                .clip(centroid * (1.0 - CONTRACTION) + worst * CONTRACTION);
            let fxcc = self.evaluator.eval(&xcc)?;
            if fxcc < f_worst {
                self.simplex.replace_worst(xcc, fxcc);
                false
            } else {
                true
            }
        };

        if shrink {
            let best = self.simplex.vertices[0];
            for j in 1..=N {
                let vertex = self
                    .bounds
                    .clip(best + (self.simplex.vertices[j] - best) * SHRINK);
                let value = self.evaluator.eval(&vertex)?;
                self.simplex.vertices[j] = vertex;
                self.simplex.values[j] = value;
            }
        }
        Ok(())
    }
}

/// Minimize `objective` inside `bounds` starting from `x0`.
///
/// `callback` runs after every iteration with the best vertex and may return
/// [`ControlFlow::Break`] to stop. Inverted bounds fail before any
/// evaluation. A start outside the box is clipped into it.
pub fn minimize<const N: usize, F, C>(
    objective: F,
    x0: [f64; N],
    bounds: &Bounds<N>,
    options: &Options,
    mut callback: C,
) -> Result<OptimizeResult<N>, OptimizeError>
where
    F: FnMut(&[f64; N]) -> Result<f64, Cancelled>,
    C: FnMut(&Iterate<N>) -> ControlFlow<()>,
{
    bounds.validate()?;
    let (maxiter, maxfev) = options.limits(N);

    if !bounds.contains(&x0) {
        warn!("Initial guess {x0:?} is outside the bounds, clipping");
    }
    let start = bounds.clip(SVector::from(x0));

    let mut search = Search {
        simplex: Simplex::initial(start, bounds),
        evaluator: Evaluator {
            objective,
            nfev: 0,
            maxfev,
        },
        bounds,
        nit: 0,
    };

    let stop = search.run(options, maxiter, &mut callback);
    search.simplex.sort();
    let nfev = search.evaluator.nfev;
    let nit = search.nit;

    let status = match stop {
        Ok(Stop::Cancelled) | Err(Halt::Cancelled) => Status::Cancelled,
        Ok(Stop::Converged) | Ok(Stop::LimitReached) | Err(Halt::MaxEvaluations) => {
            if nfev >= maxfev {
                Status::MaxEvaluations
            } else if nit >= maxiter {
                Status::MaxIterations
            } else {
                Status::Converged
            }
        }
    };

    let (x, fun) = if nfev == 0 {
        ([f64::NAN; N], f64::NAN)
    } else {
        search.simplex.best()
    };

    Ok(OptimizeResult {
        x,
        fun,
        nit,
        nfev,
        status,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn bowl(x: &[f64; 2]) -> Result<f64, Cancelled> {
        Ok((x[0] - 3.0).powi(2) + 2.0 * (x[1] + 1.0).powi(2) + 0.5)
    }

    fn tight() -> Options {
        Options {
            xatol: 1e-6,
            fatol: 1e-9,
            ..Default::default()
        }
    }

    fn no_callback(_: &Iterate<2>) -> ControlFlow<()> {
        ControlFlow::Continue(())
    }

    #[test]
    fn test_converges_on_quadratic_bowl() {
        let bounds = Bounds::new([(-10.0, 10.0), (-10.0, 10.0)]);
        let result = minimize(bowl, [0.0, 0.0], &bounds, &tight(), no_callback).unwrap();

        assert_eq!(result.status, Status::Converged);
        assert_eq!(result.status.code(), 0);
        assert_abs_diff_eq!(result.x[0], 3.0, epsilon = 1e-4);
        assert_abs_diff_eq!(result.x[1], -1.0, epsilon = 1e-4);
        assert_abs_diff_eq!(result.fun, 0.5, epsilon = 1e-8);
        assert!(result.nfev < 400);
    }

    #[test]
    fn test_repeated_runs_are_identical() {
        let bounds = Bounds::new([(-10.0, 10.0), (-10.0, 10.0)]);
        let a = minimize(bowl, [1.0, 1.0], &bounds, &tight(), no_callback).unwrap();
        let b = minimize(bowl, [1.0, 1.0], &bounds, &tight(), no_callback).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_minimum_outside_box_lands_on_bound() {
        let bounds = Bounds::new([(0.0, 2.0), (0.0, 5.0)]);
        let result = minimize(bowl, [1.0, 1.0], &bounds, &tight(), no_callback).unwrap();

        assert_abs_diff_eq!(result.x[0], 2.0, epsilon = 1e-4);
        assert_abs_diff_eq!(result.x[1], 0.0, epsilon = 1e-4);
    }

    #[test]
    fn test_every_evaluation_is_inside_bounds() {
        let bounds = Bounds::new([(0.0, 100.0), (0.0, 100.0)]);
        let mut outside = 0;
        let objective = |x: &[f64; 2]| {
            if !bounds.contains(x) {
                outside += 1;
            }
            Ok((x[0] - 99.0).powi(2) + (x[1] - 1.0).powi(2))
        };
        minimize(objective, [100.0, 0.0], &bounds, &tight(), no_callback).unwrap();
        assert_eq!(outside, 0);
    }

    #[test]
    fn test_inverted_bounds_rejected_before_evaluating() {
        let bounds = Bounds::new([(0.0, 10.0), (5.0, 1.0)]);
        let mut calls = 0;
        let objective = |_: &[f64; 2]| {
            calls += 1;
            Ok(0.0)
        };
        let err = minimize(objective, [0.0, 0.0], &bounds, &tight(), no_callback).unwrap_err();

        assert_eq!(
            err,
            OptimizeError::InvalidBounds {
                index: 1,
                lower: 5.0,
                upper: 1.0
            }
        );
        assert_eq!(calls, 0);
    }

    #[test]
    fn test_objective_cancellation() {
        let bounds = Bounds::new([(-10.0, 10.0), (-10.0, 10.0)]);
        let mut calls = 0;
        let objective = |x: &[f64; 2]| {
            calls += 1;
            if calls > 10 {
                Err(Cancelled)
            } else {
                bowl(x)
            }
        };
        let result = minimize(objective, [0.0, 0.0], &bounds, &tight(), no_callback).unwrap();

        assert_eq!(result.status, Status::Cancelled);
        assert_eq!(result.status.code(), 99);
        assert_eq!(result.nfev, 10);
        assert!(result.fun.is_finite());
    }

    #[test]
    fn test_callback_cancellation() {
        let bounds = Bounds::new([(-10.0, 10.0), (-10.0, 10.0)]);
        let mut seen = Vec::new();
        let callback = |iterate: &Iterate<2>| {
            seen.push(iterate.nit);
            if iterate.nit >= 4 {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        };
        let result = minimize(bowl, [0.0, 0.0], &bounds, &tight(), callback).unwrap();

        assert!(result.is_cancelled());
        assert_eq!(result.nit, 4);
        assert_eq!(seen, vec![2, 3, 4]);
    }

    #[test]
    fn test_evaluation_limit() {
        let bounds = Bounds::new([(-10.0, 10.0), (-10.0, 10.0)]);
        let options = Options {
            maxfev: Some(12),
            ..tight()
        };
        let result = minimize(bowl, [0.0, 0.0], &bounds, &options, no_callback).unwrap();

        assert_eq!(result.status, Status::MaxEvaluations);
        assert_eq!(result.nfev, 12);
    }

    #[test]
    fn test_iteration_limit() {
        let bounds = Bounds::new([(-10.0, 10.0), (-10.0, 10.0)]);
        let options = Options {
            maxiter: Some(5),
            ..tight()
        };
        let result = minimize(bowl, [0.0, 0.0], &bounds, &options, no_callback).unwrap();

        assert_eq!(result.status, Status::MaxIterations);
        assert_eq!(result.nit, 5);
    }

    #[test]
    fn test_nan_region_is_never_preferred() {
        let bounds = Bounds::new([(0.0, 10.0), (0.0, 10.0)]);
        let objective = |x: &[f64; 2]| {
            if x[0] > 5.0 {
                Ok(f64::NAN)
            } else {
                Ok((x[0] - 4.5).powi(2) + (x[1] - 1.0).powi(2))
            }
        };
        let result = minimize(objective, [1.0, 1.0], &bounds, &tight(), no_callback).unwrap();

        assert!(result.fun.is_finite());
        assert_abs_diff_eq!(result.x[0], 4.5, epsilon = 1e-3);
        assert_abs_diff_eq!(result.x[1], 1.0, epsilon = 1e-3);
    }

    #[test]
    fn test_limits_follow_defaults() {
        assert_eq!(Options::default().limits(2), (400, 400));
        let only_fev = Options {
            maxfev: Some(50),
            ..Default::default()
        };
        assert_eq!(only_fev.limits(2), (usize::MAX, 50));
    }
}
