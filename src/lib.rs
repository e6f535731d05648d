//! Adaptive step-size control for batched ODE integration.
//!
//! This crate implements a PID step-size controller for solvers that advance many
//! independent initial-value problems in lock-step. Given an attempted step and its
//! estimated local truncation error, the controller decides per batch element
//! whether to accept the step and what step size to try next. The growth-factor
//! formula is the digital-filter law of Söderlind, with the filter coefficients
//! normalized by the stepping method's convergence order.
//!
//! The controller does not take steps itself: the stepping formula, the vector-field
//! evaluation, and the outer solve loop are the caller's responsibility. The caller
//! feeds each [`StepResult`] to [`PidController::adapt_step_size`] and threads the
//! returned [`PidState`] through the loop. When batch elements finish at different
//! iteration counts, [`PidController::merge_states`] freezes the history of finished
//! elements while live ones continue updating.
//!
//! All quantities are batched: per-element scalars (times, step sizes, error ratios)
//! are [`ndarray`] rank-1 arrays, states and derivatives are rank-2 arrays of shape
//! `(batch, components)`. Every conditional — accept/reject, bounds present/absent —
//! is an elementwise select, so the cost of a call does not depend on the data.
//!
//! The implementation follows:
//! * Söderlind, G. "Digital Filters in Adaptive Time-Stepping." ACM Transactions on
//!   Mathematical Software 29 (2003): 1-26. Eq. (34), with the safety factor pulled
//!   out and the error ratio inverted relative to the paper.
//! * Hairer, E., S. P. Nørsett, and G. Wanner. Solving Ordinary Differential
//!   Equations I: Nonstiff Problems. 2nd edition, Sec. II.4 (the initial step size
//!   estimate, adapted to norm-based tolerances).
//!
//! As an example, consider exponential decay solved for a batch of one:
//!
//! ```
//! use ndarray::array;
//!
//! struct Decay;
//!
//! impl stepctrl::VectorField for Decay {
//!     type Float = f64;
//!
//!     fn evaluate(
//!         &self,
//!         _t: stepctrl::ArrayView1<f64>,
//!         y: stepctrl::ArrayView2<f64>,
//!         mut dydt: stepctrl::ArrayViewMut2<f64>,
//!     ) {
//!         dydt.assign(&y.mapv(|v| -v));
//!     }
//! }
//!
//! let controller = stepctrl::PidController::new(1e-6, 1e-3, 0.2, 0.2, 0.0);
//! let problem = stepctrl::Problem {
//!     t_start: array![0.0],
//!     t_end: array![10.0],
//!     y0: array![[1.0, 2.0]],
//! };
//!
//! // No explicit dt0, so `init` runs the empirical initial-step estimate, which
//! // costs two vector-field evaluations and also returns f(t0, y0) for reuse.
//! let mut stats = stepctrl::Stats::default();
//! let (dt0, state, f0) = controller
//!     .init(Some(&Decay), &problem, 5, None, &mut stats)
//!     .unwrap();
//! assert!(dt0[0] > 0.0);
//! assert!(f0.is_some());
//! assert_eq!(stats.num_vf_evals, 2);
//!
//! // Suppose the stepper took a step and produced a tiny error estimate.
//! let result = stepctrl::StepResult {
//!     y1: array![[0.9, 1.8]],
//!     error_estimate: Some(array![[1e-8, 1e-8]]),
//! };
//! let (accept, dt_next, state, status) = controller.adapt_step_size(
//!     &problem.t_start,
//!     &dt0,
//!     problem.y0.view(),
//!     &result,
//!     &state,
//!     &mut stats,
//! );
//! assert!(accept[0]);
//! assert!(dt_next[0] > dt0[0]);
//! assert_eq!(status.unwrap()[0], stepctrl::Status::Success);
//!
//! // The accepted error ratio moved into the controller's history.
//! assert!(state.prev_error_ratio()[0] < 1.0);
//! ```

pub use nd::ArrayView1;
pub use nd::ArrayView2;
pub use nd::ArrayViewMut2;
use nd::{Array1, Array2, Axis, Zip};
use ndarray as nd;
use num_traits::cast;

pub trait Float:
    num_traits::Float
    + core::iter::Sum
    + core::ops::AddAssign
    + core::fmt::Debug
    + nd::ScalarOperand
{
}

impl Float for f32 {}
impl Float for f64 {}

/// A norm reduction collapsing per-component values into one scalar per batch element.
pub type NormFn<F> = fn(ArrayView2<F>) -> Array1<F>;

/// Root-mean-square norm along the component axis. The default norm reduction.
pub fn rms_norm<F: Float>(values: ArrayView2<F>) -> Array1<F> {
    let n: F = cast(values.ncols()).unwrap();
    values.map_axis(Axis(1), |row| {
        (row.iter().map(|&v| v * v).sum::<F>() / n).sqrt()
    })
}

/// Maximum-magnitude norm along the component axis.
pub fn max_norm<F: Float>(values: ArrayView2<F>) -> Array1<F> {
    values.map_axis(Axis(1), |row| {
        row.iter().fold(F::zero(), |m, &v| m.max(v.abs()))
    })
}

/// An absolute or relative tolerance, either one value for all state components or
/// one value per component.
///
/// Converts from a plain float or from a rank-1 array, so callers can pass either
/// without naming this type.
#[derive(Clone, Debug)]
pub enum Tolerance<F: Float> {
    Scalar(F),
    PerComponent(Array1<F>),
}

impl<F: Float> From<F> for Tolerance<F> {
    fn from(val: F) -> Self {
        Tolerance::Scalar(val)
    }
}

impl<F: Float> From<Array1<F>> for Tolerance<F> {
    fn from(val: Array1<F>) -> Self {
        Tolerance::PerComponent(val)
    }
}

impl<F: Float> core::ops::Index<usize> for Tolerance<F> {
    type Output = F;

    fn index(&self, index: usize) -> &Self::Output {
        match self {
            Tolerance::Scalar(v) => v,
            Tolerance::PerComponent(vs) => &vs[index],
        }
    }
}

/// The right-hand side of the ODE system, `dy/dt = f(t, y)`, evaluated for the whole
/// batch at once.
///
/// `t` holds one time per batch element, `y` one state row per batch element, and
/// the derivative is written into `dydt` row by row. Problem parameters belong in
/// fields of the implementing type.
pub trait VectorField {
    /// The floating point type.
    type Float: Float;

    /// Evaluate the vector field and store the derivative in `dydt`.
    fn evaluate(
        &self,
        t: ArrayView1<Self::Float>,
        y: ArrayView2<Self::Float>,
        dydt: ArrayViewMut2<Self::Float>,
    );
}

/// A batch of initial-value problems advanced in lock-step.
#[derive(Clone, Debug)]
pub struct Problem<F: Float> {
    /// Integration start time, one per batch element.
    pub t_start: Array1<F>,
    /// Integration end time, one per batch element.
    pub t_end: Array1<F>,
    /// Initial states, shape `(batch, components)`.
    pub y0: Array2<F>,
}

impl<F: Float> Problem<F> {
    /// Number of batch elements.
    pub fn batch_size(&self) -> usize {
        self.y0.nrows()
    }

    /// Sign of `t_end - t_start` per batch element, so forward and backward
    /// integrations can share a batch.
    pub fn time_direction(&self) -> Array1<F> {
        Zip::from(&self.t_end)
            .and(&self.t_start)
            .map_collect(|&e, &s| (e - s).signum())
    }
}

/// A candidate step produced by the external stepping method.
#[derive(Clone, Debug)]
pub struct StepResult<F: Float> {
    /// The proposed state at the end of the step, shape `(batch, components)`.
    pub y1: Array2<F>,
    /// The stepper's local truncation error estimate. `None` means the method could
    /// not provide one; the controller then accepts the step without changing the
    /// step size.
    pub error_estimate: Option<Array2<F>>,
}

/// Per-batch-element outcome of an error-controlled step attempt.
///
/// `InfiniteNorm` flags a non-finite error ratio for that element. It is fatal for
/// the element but not for the batch; whether to stop the affected element is the
/// solve loop's decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Success,
    InfiniteNorm,
}

/// Instrumentation counters threaded through the controller.
#[derive(Clone, Debug, Default)]
pub struct Stats {
    /// Number of vector-field evaluations.
    pub num_vf_evals: usize,
}

/// Configuration and precondition errors. Numerical failures are never reported
/// here; they surface per batch element as [`Status::InfiniteNorm`].
#[derive(Debug, Clone)]
pub enum Error {
    /// The initial-step estimate needs a vector field, but none was passed to `init`
    /// and none was configured on the controller.
    MissingVectorField,
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::MissingVectorField => write!(
                f,
                "no vector field available: pass one to init or configure a default with with_term"
            ),
        }
    }
}

impl std::error::Error for Error {}

/// Controller memory threaded through the solve loop, one instance per in-flight
/// batch.
///
/// Holds the two most recent *accepted* error ratios per batch element (the PID
/// filter's memory), the stepping method's convergence order, and the resolved step
/// size bounds. History slots start at the neutral ratio 1.0 and move only when a
/// step is accepted; a rejected step leaves the state untouched.
#[derive(Clone, Debug, PartialEq)]
pub struct PidState<F: Float> {
    method_order: usize,
    prev_error_ratio: Array1<F>,
    prev_prev_error_ratio: Array1<F>,
    dt_min: Option<F>,
    dt_max: Option<F>,
    almost_zero: F,
}

impl<F: Float> PidState<F> {
    /// Fresh state with both history slots at the neutral ratio 1.0.
    pub fn initial(
        method_order: usize,
        batch_size: usize,
        dt_min: Option<F>,
        dt_max: Option<F>,
    ) -> Self {
        Self {
            method_order,
            prev_error_ratio: Array1::ones(batch_size),
            prev_prev_error_ratio: Array1::ones(batch_size),
            dt_min,
            dt_max,
            // Lower bound on stored error ratios; keeps the filter's power-law
            // exponentiation away from division by zero.
            almost_zero: F::epsilon(),
        }
    }

    /// Copy of this state with only the two history slots replaced.
    pub fn update_error_ratios(
        &self,
        prev_error_ratio: Array1<F>,
        prev_prev_error_ratio: Array1<F>,
    ) -> Self {
        Self {
            prev_error_ratio,
            prev_prev_error_ratio,
            ..self.clone()
        }
    }

    /// The stepping method's convergence order, fixed for the life of a solve.
    pub fn method_order(&self) -> usize {
        self.method_order
    }

    /// Most recent accepted error ratio per batch element.
    pub fn prev_error_ratio(&self) -> &Array1<F> {
        &self.prev_error_ratio
    }

    /// Second most recent accepted error ratio per batch element.
    pub fn prev_prev_error_ratio(&self) -> &Array1<F> {
        &self.prev_prev_error_ratio
    }
}

/// A PID step-size controller.
///
/// Construct with [`PidController::new`], refine with the `with_*` builders, then
/// drive through [`init`](PidController::init),
/// [`adapt_step_size`](PidController::adapt_step_size), and
/// [`merge_states`](PidController::merge_states) from the solve loop.
pub struct PidController<F: Float> {
    atol: Tolerance<F>,
    rtol: Tolerance<F>,
    pcoeff: F,
    icoeff: F,
    dcoeff: F,
    safety: F,
    factor_min: F,
    factor_max: F,
    dt_min: Option<F>,
    dt_max: Option<F>,
    norm: NormFn<F>,
    term: Option<Box<dyn VectorField<Float = F>>>,
    force_monotonic_solve: bool,
}

impl<F: Float> PidController<F> {
    /// Make a controller with the given tolerances and PID gains.
    ///
    /// Defaults: safety factor 0.9, growth factor clamped to `[0.2, 10.0]`, no hard
    /// step size bounds, RMS norm, no default vector field.
    pub fn new(
        atol: impl Into<Tolerance<F>>,
        rtol: impl Into<Tolerance<F>>,
        pcoeff: F,
        icoeff: F,
        dcoeff: F,
    ) -> Self {
        Self {
            atol: atol.into(),
            rtol: rtol.into(),
            pcoeff,
            icoeff,
            dcoeff,
            safety: cast(0.9).unwrap(),
            factor_min: cast(0.2).unwrap(),
            factor_max: cast(10.0).unwrap(),
            dt_min: None,
            dt_max: None,
            norm: rms_norm::<F>,
            term: None,
            force_monotonic_solve: true,
        }
    }

    /// Set the safety factor applied to the raw growth factor.
    pub fn with_safety(self, safety: F) -> Self {
        Self { safety, ..self }
    }

    /// Set the clamp bounds for the step size growth factor.
    pub fn with_factor_bounds(self, factor_min: F, factor_max: F) -> Self {
        Self {
            factor_min,
            factor_max,
            ..self
        }
    }

    /// Set a hard minimum step size.
    pub fn with_dt_min(self, dt_min: F) -> Self {
        Self {
            dt_min: Some(dt_min),
            ..self
        }
    }

    /// Set a hard maximum step size.
    pub fn with_dt_max(self, dt_max: F) -> Self {
        Self {
            dt_max: Some(dt_max),
            ..self
        }
    }

    /// Set the norm reduction used for error ratios and the initial-step estimate.
    pub fn with_norm(self, norm: NormFn<F>) -> Self {
        Self { norm, ..self }
    }

    /// Set a default vector field, used by [`init`](PidController::init) when the
    /// caller does not pass one per call.
    pub fn with_term(self, term: Box<dyn VectorField<Float = F>>) -> Self {
        Self {
            term: Some(term),
            ..self
        }
    }

    /// Set whether the solve loop should keep each element's time strictly
    /// monotonic. Advisory: stored here, read by the outer loop.
    pub fn with_force_monotonic_solve(self, force_monotonic_solve: bool) -> Self {
        Self {
            force_monotonic_solve,
            ..self
        }
    }

    /// Whether the solve loop should keep each element's time strictly monotonic.
    pub fn force_monotonic_solve(&self) -> bool {
        self.force_monotonic_solve
    }

    /// Set up the controller for a solve.
    ///
    /// Returns the first step size, the initial controller state, and — when the
    /// initial step had to be estimated — the vector field at the start time, so the
    /// caller can reuse it instead of re-evaluating.
    ///
    /// If `dt0` is given, the estimate is skipped and no vector field is needed.
    /// Otherwise the Hairer-Nørsett-Wanner estimate runs, using `term` if passed,
    /// falling back to the controller's configured default, and failing with
    /// [`Error::MissingVectorField`] if neither exists.
    pub fn init<V: VectorField<Float = F>>(
        &self,
        term: Option<&V>,
        problem: &Problem<F>,
        method_order: usize,
        dt0: Option<Array1<F>>,
        stats: &mut Stats,
    ) -> Result<(Array1<F>, PidState<F>, Option<Array2<F>>), Error> {
        let (dt0, f0) = match dt0 {
            Some(dt0) => (dt0, None),
            None => {
                let term = term
                    .map(|t| t as &dyn VectorField<Float = F>)
                    .or(self.term.as_deref())
                    .ok_or(Error::MissingVectorField)?;
                // The remaining integration interval caps the first step.
                let dt_max = Zip::from(&problem.t_end)
                    .and(&problem.t_start)
                    .map_collect(|&e, &s| (e - s).abs());
                let (dt0, f0) = self.select_initial_step(
                    term,
                    &problem.t_start,
                    problem.y0.view(),
                    &problem.time_direction(),
                    &dt_max,
                    method_order,
                    stats,
                );
                (dt0, Some(f0))
            }
        };
        let state = PidState::initial(
            method_order,
            problem.batch_size(),
            self.dt_min,
            self.dt_max,
        );
        Ok((dt0, state, f0))
    }

    /// Decide acceptance of an attempted step and compute the next step size.
    ///
    /// Returns per batch element: the acceptance flag, the next step size, the
    /// updated controller state, and a [`Status`]. The status is `None` when the
    /// stepper provided no error estimate; the step is then accepted unconditionally
    /// with the step size unchanged, and the history is updated with the neutral
    /// ratio 1.0.
    ///
    /// The caller interprets the status vector; a non-finite error ratio yields
    /// [`Status::InfiniteNorm`] for exactly the affected elements while the rest of
    /// the batch proceeds.
    pub fn adapt_step_size(
        &self,
        _t0: &Array1<F>,
        dt: &Array1<F>,
        y0: ArrayView2<F>,
        step_result: &StepResult<F>,
        state: &PidState<F>,
        _stats: &mut Stats,
    ) -> (Array1<bool>, Array1<F>, PidState<F>, Option<Array1<Status>>) {
        let Some(error_estimate) = step_result.error_estimate.as_ref() else {
            let accept = Array1::from_elem(dt.len(), true);
            let next_state = self.update_state(state, None);
            return (accept, dt.to_owned(), next_state, None);
        };

        // Scale the error estimate by atol + rtol * max(|y0|, |y1|) componentwise,
        // then reduce to one ratio per batch element. The ratio is floored at
        // `almost_zero` so the filter never divides by zero; the floor is written so
        // that a NaN ratio stays NaN and lands in the status vector below.
        let mut scaled = Zip::from(&y0)
            .and(&step_result.y1)
            .map_collect(|&a, &b| a.abs().max(b.abs()));
        Zip::indexed(&mut scaled)
            .and(error_estimate)
            .for_each(|(_, j), m, &e| {
                let bound = self.atol[j] + self.rtol[j] * *m;
                *m = e.abs() / bound;
            });
        let floor = state.almost_zero;
        let error_ratio =
            (self.norm)(scaled.view()).mapv(|r| if r < floor { floor } else { r });
        let accept = error_ratio.mapv(|r| r < F::one());

        let mut dt_next = dt * &self.dt_factor(state, &error_ratio);

        let status = error_ratio.mapv(|r| {
            if r.is_finite() {
                Status::Success
            } else {
                Status::InfiniteNorm
            }
        });

        if state.dt_min.is_some() || state.dt_max.is_some() {
            let lo = state.dt_min.unwrap_or_else(F::neg_infinity);
            let hi = state.dt_max.unwrap_or_else(F::infinity);
            dt_next.mapv_inplace(|h| h.max(lo).min(hi));
        }

        let next_state = self.update_state(state, Some((&error_ratio, &accept)));
        (accept, dt_next, next_state, Some(status))
    }

    /// Reconcile controller state across a partially finished batch.
    ///
    /// Elements where `running` is true keep `current`'s history; finished elements
    /// keep `previous`'s, freezing them while live elements continue updating. An
    /// elementwise select with no cross-contamination between elements.
    pub fn merge_states(
        &self,
        running: &Array1<bool>,
        current: &PidState<F>,
        previous: &PidState<F>,
    ) -> PidState<F> {
        current.update_error_ratios(
            Zip::from(running)
                .and(&current.prev_error_ratio)
                .and(&previous.prev_error_ratio)
                .map_collect(|&run, &c, &p| if run { c } else { p }),
            Zip::from(running)
                .and(&current.prev_prev_error_ratio)
                .and(&previous.prev_prev_error_ratio)
                .map_collect(|&run, &c, &p| if run { c } else { p }),
        )
    }

    /// Compute the growth factor of the step size.
    ///
    /// Söderlind's Eq. (34) with the safety coefficient factored out and the PID
    /// coefficients divided by the method order. Our error ratio is the reciprocal
    /// of Söderlind's, so the exponents have the opposite sign from the paper.
    fn dt_factor(&self, state: &PidState<F>, error_ratio: &Array1<F>) -> Array1<F> {
        let order: F = cast(state.method_order).unwrap();
        let two: F = cast(2.0).unwrap();
        let k_i = self.icoeff / order;
        let k_p = self.pcoeff / order;
        let k_d = self.dcoeff / order;

        Zip::from(error_ratio)
            .and(&state.prev_error_ratio)
            .and(&state.prev_prev_error_ratio)
            .map_collect(|&ratio, &prev, &prev_prev| {
                let factor = self.safety
                    * ratio.powf(-(k_i + k_p + k_d))
                    * prev.powf(k_p + two * k_d)
                    * prev_prev.powf(-k_d);
                factor.max(self.factor_min).min(self.factor_max)
            })
    }

    /// Roll the two-slot error-ratio history.
    ///
    /// With no error ratio (the stepper gave no estimate) the history takes the
    /// neutral ratio 1.0. Otherwise accepted elements shift `prev` into `prev_prev`
    /// and the fresh ratio into `prev`; rejected elements keep both slots,
    /// discarding the rejected ratio.
    fn update_state(
        &self,
        state: &PidState<F>,
        outcome: Option<(&Array1<F>, &Array1<bool>)>,
    ) -> PidState<F> {
        match outcome {
            None => state.update_error_ratios(
                Array1::ones(state.prev_error_ratio.len()),
                state.prev_error_ratio.clone(),
            ),
            Some((error_ratio, accept)) => state.update_error_ratios(
                Zip::from(accept)
                    .and(error_ratio)
                    .and(&state.prev_error_ratio)
                    .map_collect(|&acc, &r, &p| if acc { r } else { p }),
                Zip::from(accept)
                    .and(&state.prev_error_ratio)
                    .and(&state.prev_prev_error_ratio)
                    .map_collect(|&acc, &p, &pp| if acc { p } else { pp }),
            ),
        }
    }

    /// Empirically select a good initial step.
    ///
    /// An adaptation of the algorithm in Hairer, Nørsett, Wanner, Sec. II.4, changed
    /// so that the tolerances apply to norms instead of the components of `y`.
    #[allow(clippy::too_many_arguments)]
    fn select_initial_step(
        &self,
        term: &dyn VectorField<Float = F>,
        t0: &Array1<F>,
        y0: ArrayView2<F>,
        direction: &Array1<F>,
        dt_max: &Array1<F>,
        convergence_order: usize,
        stats: &mut Stats,
    ) -> (Array1<F>, Array2<F>) {
        let norm = self.norm;

        let mut f0 = Array2::zeros(y0.raw_dim());
        term.evaluate(t0.view(), y0, f0.view_mut());
        stats.num_vf_evals += 1;

        let mut inv_scale = y0.to_owned();
        Zip::indexed(&mut inv_scale).for_each(|(_, j), v| {
            *v = (self.atol[j] + self.rtol[j] * v.abs()).recip();
        });

        let d0 = norm((&y0 * &inv_scale).view());
        let d1 = norm((&f0 * &inv_scale).view());

        let hundredth: F = cast(0.01).unwrap();
        let rough: F = cast(1e-5).unwrap();
        let small: F = cast(1e-6).unwrap();
        let mut dt0 = Zip::from(&d0).and(&d1).map_collect(|&d0, &d1| {
            if d0 < rough || d1 < rough {
                small
            } else {
                hundredth * d0 / d1
            }
        });

        // Don't step out of the integration bounds.
        Zip::from(&mut dt0).and(dt_max).for_each(|h, &m| *h = h.min(m));

        // Trial explicit Euler step, then estimate the second derivative from the
        // difference quotient of the vector field.
        let signed_dt0 = Zip::from(direction).and(&dt0).map_collect(|&s, &h| s * h);
        let y1 = &y0 + &(&f0 * &signed_dt0.view().insert_axis(Axis(1)));
        let t1 = t0 + &signed_dt0;
        let mut f1 = Array2::zeros(y0.raw_dim());
        term.evaluate(t1.view(), y1.view(), f1.view_mut());
        stats.num_vf_evals += 1;

        let d2 = Zip::from(&norm(((&f1 - &f0) * &inv_scale).view()))
            .and(&dt0)
            .map_collect(|&d, &h| d / h);

        let negligible: F = cast(1e-15).unwrap();
        let thousandth: F = cast(1e-3).unwrap();
        let order_root = F::one() / cast(convergence_order).unwrap();
        let dt1 = Zip::from(&d1).and(&d2).map_collect(|&d1, &d2| {
            let d = d1.max(d2);
            if d <= negligible {
                small.max(thousandth * d1)
            } else {
                (hundredth / d).powf(order_root)
            }
        });

        // The interval cap applies to the final choice as well, so short solves
        // never start with a step past their end time.
        let hundred: F = cast(100.0).unwrap();
        let dt = Zip::from(direction)
            .and(&dt0)
            .and(&dt1)
            .and(dt_max)
            .map_collect(|&s, &h0, &h1, &m| s * (hundred * h0).min(h1).min(m));
        (dt, f0)
    }
}
