//! The Levenberg-Marquardt driver (spec §4.8/§4.9): the one engine this
//! crate ships, consuming a [`FitData`] and producing a converged (or
//! abandoned) packed parameter vector plus an [`EndingReason`] for the
//! trajectory log. Every call pushes exactly one outcome, even on
//! failure — there is no bare `panic!`/`unwrap` path out of `run_lm`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use lazy_static::lazy_static;
use nalgebra::DVector;

use crate::abd_matrix::ABDMatrix;
use crate::errors::FitError;
use crate::fit_data::FitData;
use crate::fit_model::FitStorage;
use crate::reporter::Reporter;
use crate::sparse_jacobian::SparseJacobian;
use crate::trajectory::EndingReason;

/// Tuning knobs for `run_lm`; defaults match spec §4.8/§4.9.
#[derive(Debug, Clone)]
pub struct LmConfig {
    pub lambda0: f64,
    /// `s`: the factor λ is multiplied/divided by at each trial.
    pub step_factor: f64,
    /// Relative residual-sum-of-squares decrease below which the fit
    /// is considered to have stalled on that axis.
    pub residuals_threshold: f64,
    /// Per-parameter relative-change threshold for the other
    /// convergence axis.
    pub end_threshold: f64,
    /// Floor added to `|p_i|` in the per-parameter relative-change test,
    /// so a parameter crossing zero doesn't divide by zero.
    pub relative_min: f64,
    pub max_tries: usize,
    pub max_tries_first_iteration: usize,
    pub iteration_limit: usize,
    /// §4.9: scale each jacobian column by `1/‖column‖` before forming
    /// `jTj`, un-scaling the solved step and covariance afterwards.
    pub scale_by_magnitude: bool,
    /// Extra power-of-dataset-count factor folded into a global
    /// parameter's scale, `0` disables it.
    pub global_scaling_order: i32,
    /// Caps the λ decay after a streak of immediately-accepted λ/s
    /// steps, so λ can't collapse to zero after a long run of easy
    /// iterations.
    pub max_lambda_decay: f64,
}

impl Default for LmConfig {
    fn default() -> Self {
        LmConfig {
            lambda0: 1e-4,
            step_factor: 2.0,
            residuals_threshold: 1e-5,
            end_threshold: 1e-5,
            relative_min: 1e-3,
            max_tries: 30,
            max_tries_first_iteration: 40,
            iteration_limit: 50,
            scale_by_magnitude: false,
            global_scaling_order: 0,
            max_lambda_decay: 10.0,
        }
    }
}

/// Everything a caller needs to build a trajectory record and continue
/// (or abandon) the fit.
#[derive(Debug, Clone)]
pub struct EngineOutcome {
    pub packed: Vec<f64>,
    pub ending: EndingReason,
    pub iterations: usize,
    pub evaluations: usize,
    pub residual_norm_sq: f64,
    /// The last accepted `jTj`, reused by covariance computation
    /// (spec §4.11) without a redundant jacobian pass. Only populated
    /// when `ending == Converged`, since that is the only point the
    /// engine recomputes the jacobian at the final accepted parameters.
    pub jtj: Option<ABDMatrix>,
    /// The last iteration's relative residual change, the `delta`
    /// field of the trajectory record (spec §4.12).
    pub last_delta: f64,
}

enum TrialOutcome {
    Evaluated {
        delta_p: Vec<f64>,
        new_p: Vec<f64>,
        residual_norm_sq: f64,
    },
    /// A range error, or a singular trial solve: rejected, not fatal.
    Rejected,
    Fatal(FitError),
}

fn sum_sq(r: &[f64]) -> f64 {
    r.iter().map(|v| v * v).sum()
}

/// Spec §4.8 step 7's pair of convergence tests (relative residual
/// change, per-parameter relative change), applied to a *prospective*
/// step rather than an accepted one. Used to recognise a step that
/// didn't strictly improve the residual but is already within both
/// tolerances — the idempotence case of spec §8, where the fit starts
/// at (or within float noise of) its own optimum.
fn already_converged(current_r: f64, candidate_r: f64, delta_p: &[f64], new_p: &[f64], config: &LmConfig) -> bool {
    let rel_residual_change = if current_r.abs() > 0.0 {
        ((current_r - candidate_r) / current_r).abs()
    } else {
        0.0
    };
    let any_param_moving = delta_p
        .iter()
        .zip(new_p.iter())
        .any(|(d, pi)| d.abs() / (config.relative_min + pi.abs()) > config.end_threshold);
    rel_residual_change < config.residuals_threshold && !any_param_moving
}

fn ending_for_error(e: &FitError) -> EndingReason {
    match e {
        FitError::Range { .. } => EndingReason::Error,
        FitError::Runtime { .. } => EndingReason::Error,
        FitError::Internal { .. } => EndingReason::Exception,
        FitError::Cancelled => EndingReason::Cancelled,
    }
}

/// Per-fit-index scale vector for §4.9. All ones when
/// `scale_by_magnitude` is off, so callers don't need two code paths.
fn compute_scale(jac: &SparseJacobian, data: &FitData, config: &LmConfig) -> Vec<f64> {
    let k = jac.free_count();
    let mut scale = vec![1.0; k];
    if !config.scale_by_magnitude {
        return scale;
    }
    for (fi, s) in scale.iter_mut().enumerate() {
        let norm = jac.columns[fi].full_length(&data.layout).norm();
        *s = if norm > 0.0 { 1.0 / norm } else { 1.0 };
    }
    if config.global_scaling_order != 0 {
        let factor = (data.num_datasets() as f64).powi(config.global_scaling_order);
        for &fi in &data.parameters.plan.global_free {
            scale[fi] *= factor;
        }
    }
    scale
}

/// One trial step at a given `lambda`: solve `(jTj + λI) Δy = -g`,
/// un-scale to `Δp`, evaluate residuals at `p + Δp`. Range errors are
/// rejections, everything else is fatal.
#[allow(clippy::too_many_arguments)]
fn trial_step(
    jtj: &ABDMatrix,
    g: &DVector<f64>,
    lambda: f64,
    scale: &[f64],
    p: &[f64],
    data: &FitData,
    storage: &mut dyn FitStorage,
    evaluations: &mut usize,
) -> TrialOutcome {
    let mut damped = jtj.clone();
    damped.add_to_diagonal(lambda);
    let neg_g = -g;

    let delta_scaled = match damped.solve(&neg_g) {
        Ok(d) => d,
        Err(_) => return TrialOutcome::Rejected,
    };

    let mut delta_p = vec![0.0; p.len()];
    let mut new_p = p.to_vec();
    for i in 0..p.len() {
        delta_p[i] = scale[i] * delta_scaled[i];
        new_p[i] += delta_p[i];
    }

    *evaluations += 1;
    match data.residuals(&new_p, storage) {
        Ok(r) => TrialOutcome::Evaluated {
            delta_p,
            new_p,
            residual_norm_sq: sum_sq(&r),
        },
        Err(e) if e.is_range() => TrialOutcome::Rejected,
        Err(e) => TrialOutcome::Fatal(e),
    }
}

/// Runs Levenberg-Marquardt from `initial_packed` to convergence,
/// timeout, cancellation, or failure (spec §4.8). Never panics on a
/// recoverable condition; a `Range`/`Runtime`/`Internal` error is
/// folded into the matching `EndingReason` so the caller always gets
/// exactly one outcome to log.
pub fn run_lm(
    data: &FitData,
    storage: &mut dyn FitStorage,
    initial_packed: Vec<f64>,
    config: &LmConfig,
    reporter: &mut dyn Reporter,
    cancel: &AtomicBool,
) -> EngineOutcome {
    reporter.fit_started("lm");
    let mut p = initial_packed;
    let mut evaluations = 0usize;

    let (mut r, mut jac) = match data.fdf(&p, storage) {
        Ok(v) => v,
        Err(e) => {
            let ending = ending_for_error(&e);
            reporter.fit_ended(ending.as_str(), f64::INFINITY, 0, 1);
            return EngineOutcome {
                packed: p,
                ending,
                iterations: 0,
                evaluations: 1,
                residual_norm_sq: f64::INFINITY,
                jtj: None,
                last_delta: 0.0,
            };
        }
    };
    evaluations += 1;
    let mut current_r = sum_sq(&r);

    let mut lambda = config.lambda0;
    let mut success_streak = 0usize;
    let mut iterations = 0usize;
    let mut last_jtj: Option<ABDMatrix> = None;
    let mut last_delta = 0.0f64;

    let ending = loop {
        if cancel.load(Ordering::Relaxed) {
            break EndingReason::Cancelled;
        }

        let scale = compute_scale(&jac, data, config);
        let g = jac.gradient_scaled(&DVector::from_vec(r.clone()), &data.layout, &scale);
        let jtj = jac.jtj_scaled(&data.parameters.plan, &data.layout, &scale);

        let max_tries = if iterations == 0 {
            config.max_tries_first_iteration
        } else {
            config.max_tries
        };

        // Accepted step for this outer iteration, found by retrying
        // with a larger λ until one of the two trial steps improves on
        // the current residual, or we give up.
        let mut tries = 0usize;
        let accepted = loop {
            let trial_plus = trial_step(&jtj, &g, lambda, &scale, &p, data, storage, &mut evaluations);
            if let TrialOutcome::Fatal(e) = trial_plus {
                break Err(ending_for_error(&e));
            }
            let trial_plus_plus = trial_step(
                &jtj,
                &g,
                lambda / config.step_factor,
                &scale,
                &p,
                data,
                storage,
                &mut evaluations,
            );
            if let TrialOutcome::Fatal(e) = trial_plus_plus {
                break Err(ending_for_error(&e));
            }

            // R++ (the more aggressive, lower-λ step) wins whenever it
            // improves on the current residual; otherwise fall back to
            // R+; otherwise both are rejected and λ grows (spec §4.8 step 6).
            if let TrialOutcome::Evaluated {
                delta_p,
                new_p,
                residual_norm_sq,
            } = &trial_plus_plus
            {
                if *residual_norm_sq < current_r {
                    success_streak = (success_streak + 1).min(usize::MAX);
                    let decay = config.step_factor.powi(success_streak as i32).min(config.max_lambda_decay);
                    lambda = (lambda / config.step_factor) / decay;
                    break Ok((delta_p.clone(), new_p.clone(), *residual_norm_sq));
                }
                // Spec §8's idempotence property: starting at (or very
                // near) a stationary point, no trial can strictly
                // improve on the current residual, so the retry below
                // would exhaust max_tries and misreport
                // ConvergenceError. If this prospective step already
                // satisfies both convergence tests, accept it rather
                // than retrying with a larger λ.
                if already_converged(current_r, *residual_norm_sq, delta_p, new_p, config) {
                    success_streak = 0;
                    break Ok((delta_p.clone(), new_p.clone(), *residual_norm_sq));
                }
            }
            if let TrialOutcome::Evaluated {
                delta_p,
                new_p,
                residual_norm_sq,
            } = &trial_plus
            {
                if *residual_norm_sq < current_r {
                    success_streak = 0;
                    break Ok((delta_p.clone(), new_p.clone(), *residual_norm_sq));
                }
                if already_converged(current_r, *residual_norm_sq, delta_p, new_p, config) {
                    success_streak = 0;
                    break Ok((delta_p.clone(), new_p.clone(), *residual_norm_sq));
                }
            }

            tries += 1;
            if tries >= max_tries {
                break Err(EndingReason::ConvergenceError);
            }
            lambda *= config.step_factor;
        };

        let (delta_p, new_p, new_r_sq) = match accepted {
            Ok(v) => v,
            Err(ending) => break ending,
        };

        let rel_residual_change = if current_r.abs() > 0.0 {
            (current_r - new_r_sq) / current_r
        } else {
            0.0
        };
        last_delta = rel_residual_change;
        let any_param_moving = delta_p.iter().zip(new_p.iter()).any(|(d, pi)| {
            d.abs() / (config.relative_min + pi.abs()) > config.end_threshold
        });

        p = new_p;
        current_r = new_r_sq;
        iterations += 1;
        reporter.iteration(iterations, current_r.sqrt());

        if rel_residual_change < config.residuals_threshold && !any_param_moving {
            // Recompute jacobian once more at the accepted point so the
            // returned `jtj` reflects the final parameters, for covariance.
            match data.fdf(&p, storage) {
                Ok((r_final, jac_final)) => {
                    evaluations += 1;
                    r = r_final;
                    jac = jac_final;
                    last_jtj = Some(jac.jtj(&data.parameters.plan, &data.layout));
                }
                Err(e) => break ending_for_error(&e),
            }
            break EndingReason::Converged;
        }
        if iterations >= config.iteration_limit {
            break EndingReason::TimeOut;
        }

        match data.fdf(&p, storage) {
            Ok((r_next, jac_next)) => {
                evaluations += 1;
                r = r_next;
                jac = jac_next;
            }
            Err(e) => break ending_for_error(&e),
        }
    };

    reporter.fit_ended(ending.as_str(), current_r, iterations, evaluations);
    EngineOutcome {
        packed: p,
        ending,
        iterations,
        evaluations,
        residual_norm_sq: current_r,
        jtj: last_jtj,
        last_delta,
    }
}

/// The engine contract (spec §9's "additional engines can register
/// themselves in a global factory table"). This crate ships exactly
/// one engine, [`LmEngine`], but the registry follows the same pattern
/// as [`crate::fit_model::FIT_REGISTRY`] so a caller could add another
/// without touching this crate.
pub trait FitEngine: Send + Sync {
    fn name(&self) -> &str;

    #[allow(clippy::too_many_arguments)]
    fn run(
        &self,
        data: &FitData,
        storage: &mut dyn FitStorage,
        initial_packed: Vec<f64>,
        config: &LmConfig,
        reporter: &mut dyn Reporter,
        cancel: &AtomicBool,
    ) -> EngineOutcome;
}

/// The one engine this crate ships: a thin `FitEngine` wrapper over `run_lm`.
struct LmEngine;

impl FitEngine for LmEngine {
    fn name(&self) -> &str {
        "lm"
    }

    fn run(
        &self,
        data: &FitData,
        storage: &mut dyn FitStorage,
        initial_packed: Vec<f64>,
        config: &LmConfig,
        reporter: &mut dyn Reporter,
        cancel: &AtomicBool,
    ) -> EngineOutcome {
        run_lm(data, storage, initial_packed, config, reporter, cancel)
    }
}

type EngineFactory = Box<dyn Fn() -> Box<dyn FitEngine> + Send + Sync>;

lazy_static! {
    /// Mirrors `fit_model::FIT_REGISTRY`, pre-seeded with the one engine
    /// this crate ships.
    static ref ENGINE_REGISTRY: Mutex<HashMap<String, EngineFactory>> = {
        let mut m: HashMap<String, EngineFactory> = HashMap::new();
        m.insert("lm".to_string(), Box::new(|| Box::new(LmEngine) as Box<dyn FitEngine>));
        Mutex::new(m)
    };
}

pub fn register_engine(name: impl Into<String>, factory: EngineFactory) {
    ENGINE_REGISTRY.lock().unwrap().insert(name.into(), factory);
}

pub fn create_engine(name: &str) -> Result<Box<dyn FitEngine>, FitError> {
    ENGINE_REGISTRY
        .lock()
        .unwrap()
        .get(name)
        .map(|f| f())
        .ok_or_else(|| FitError::runtime(format!("no such engine: '{name}'")))
}

pub fn registered_engine_names() -> Vec<String> {
    let mut names: Vec<String> = ENGINE_REGISTRY.lock().unwrap().keys().cloned().collect();
    names.sort();
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Dataset;
    use crate::fit_data::FitData;
    use crate::fit_model::Fit;
    use crate::parameter_definition::ParameterDefinition;
    use crate::reporter::{NullReporter, RecordingReporter};
    use std::sync::Arc;

    struct ExpFit;

    impl Fit for ExpFit {
        fn name(&self) -> &str {
            "exp"
        }

        fn parameters(&self, _data: &FitData) -> Vec<ParameterDefinition> {
            vec![
                ParameterDefinition::new("a").global(),
                ParameterDefinition::new("k").global(),
            ]
        }

        fn initial_guess(&self, _data: &FitData, expanded_out: &mut [f64]) -> Result<(), FitError> {
            expanded_out[0] = 1.0;
            expanded_out[1] = 1.0;
            Ok(())
        }

        fn function(
            &self,
            packed: &[f64],
            data: &FitData,
            _storage: &mut dyn FitStorage,
            residual_out: &mut [f64],
        ) -> Result<(), FitError> {
            let a = packed[0];
            let k = packed[1];
            let mut i = 0;
            for ds in &data.datasets {
                for (x, y) in ds.x.iter().zip(ds.y.iter()) {
                    residual_out[i] = a * (-k * x).exp() - y;
                    i += 1;
                }
            }
            Ok(())
        }
    }

    fn exp_dataset(a: f64, k: f64) -> Dataset {
        let x: Vec<f64> = (0..20).map(|i| i as f64 * 0.5).collect();
        let y: Vec<f64> = x.iter().map(|&xi| a * (-k * xi).exp()).collect();
        Dataset::new(x, y)
    }

    #[test]
    fn test_converges_on_a_noiseless_exponential() {
        let fit: Arc<dyn Fit> = Arc::new(ExpFit);
        let data = FitData::new(fit, vec![exp_dataset(3.0, 0.4)]).unwrap();
        let mut storage = ();
        let initial = data.initial_guess().unwrap();
        let config = LmConfig::default();
        let cancel = AtomicBool::new(false);
        let mut reporter = NullReporter;

        let outcome = run_lm(&data, &mut storage, initial, &config, &mut reporter, &cancel);
        assert_eq!(outcome.ending, EndingReason::Converged);
        assert!((outcome.packed[0] - 3.0).abs() < 1e-4);
        assert!((outcome.packed[1] - 0.4).abs() < 1e-4);
        assert!(outcome.residual_norm_sq < 1e-10);
    }

    #[test]
    fn test_reporter_sees_started_and_ended() {
        let fit: Arc<dyn Fit> = Arc::new(ExpFit);
        let data = FitData::new(fit, vec![exp_dataset(3.0, 0.4)]).unwrap();
        let mut storage = ();
        let initial = data.initial_guess().unwrap();
        let config = LmConfig::default();
        let cancel = AtomicBool::new(false);
        let mut reporter = RecordingReporter::default();

        run_lm(&data, &mut storage, initial, &config, &mut reporter, &cancel);
        assert!(reporter.lines.first().unwrap().starts_with("started"));
        assert!(reporter.lines.last().unwrap().starts_with("ended"));
    }

    #[test]
    fn test_cancellation_flag_stops_the_loop() {
        let fit: Arc<dyn Fit> = Arc::new(ExpFit);
        let data = FitData::new(fit, vec![exp_dataset(3.0, 0.4)]).unwrap();
        let mut storage = ();
        let initial = data.initial_guess().unwrap();
        let config = LmConfig::default();
        let cancel = AtomicBool::new(true);
        let mut reporter = NullReporter;

        let outcome = run_lm(&data, &mut storage, initial, &config, &mut reporter, &cancel);
        assert_eq!(outcome.ending, EndingReason::Cancelled);
        assert_eq!(outcome.iterations, 0);
    }

    #[test]
    fn test_lm_engine_is_preregistered_and_runnable() {
        assert!(registered_engine_names().contains(&"lm".to_string()));
        let engine = create_engine("lm").unwrap();
        assert_eq!(engine.name(), "lm");

        let fit: Arc<dyn Fit> = Arc::new(ExpFit);
        let data = FitData::new(fit, vec![exp_dataset(3.0, 0.4)]).unwrap();
        let mut storage = ();
        let initial = data.initial_guess().unwrap();
        let config = LmConfig::default();
        let cancel = AtomicBool::new(false);
        let mut reporter = NullReporter;

        let outcome = engine.run(&data, &mut storage, initial, &config, &mut reporter, &cancel);
        assert_eq!(outcome.ending, EndingReason::Converged);
    }

    #[test]
    fn test_unknown_engine_name_errors() {
        assert!(create_engine("does-not-exist-xyz").is_err());
    }

    #[test]
    fn test_scale_by_magnitude_still_converges() {
        let fit: Arc<dyn Fit> = Arc::new(ExpFit);
        let data = FitData::new(fit, vec![exp_dataset(3.0, 0.4)]).unwrap();
        let mut storage = ();
        let initial = data.initial_guess().unwrap();
        let mut config = LmConfig::default();
        config.scale_by_magnitude = true;
        let cancel = AtomicBool::new(false);
        let mut reporter = NullReporter;

        let outcome = run_lm(&data, &mut storage, initial, &config, &mut reporter, &cancel);
        assert_eq!(outcome.ending, EndingReason::Converged);
        assert!((outcome.packed[0] - 3.0).abs() < 1e-3);
        assert!((outcome.packed[1] - 0.4).abs() < 1e-3);
    }
}
