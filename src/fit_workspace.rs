//! `FitWorkspace`: the session-level orchestrator around a [`FitData`]
//! (spec §2's component table, §4.10/§4.11). Drives one `run_lm` call
//! (or, when every free parameter is per-dataset, a sequential
//! subdivision into independent single-dataset sub-fits), then builds
//! the residual summaries, parameter standard errors and confidence
//! intervals the trajectory log records.
//!
//! The workspace never reads the clock itself in its core algorithms
//! ([`crate::trajectory`]'s rule), but it does need *a* timestamp to
//! stamp a finished run — that one concession is behind the [`Clock`]
//! trait, injected the same way [`crate::reporter::Reporter`] is, so
//! tests can supply a fixed value.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use itertools::izip;
use nalgebra::DMatrix;

use crate::abd_matrix::ABDMatrix;
use crate::dataset_layout::DatasetLayout;
use crate::errors::FitError;
use crate::fit_data::FitData;
use crate::fit_engine::{self, EngineOutcome, LmConfig};
use crate::fit_model::FitStorage;
use crate::fit_parameter::GLOBAL_DATASET;
use crate::packing::ParameterSet;
use crate::reporter::Reporter;
use crate::stats;
use crate::trajectory::{EndingReason, FitTrajectories, FitTrajectory};

/// Two-sided confidence level used for the half-widths in
/// [`FitRunResult::confidence_half_widths`] (spec §4.11).
pub const CONFIDENCE_LEVEL: f64 = 0.95;

/// Supplies the timestamp a finished run is stamped with.
pub trait Clock {
    fn now(&self) -> i64;
}

/// The real wall clock, for production use.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0)
    }
}

/// A caller-supplied timestamp, for reproducible tests.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub i64);

impl Clock for FixedClock {
    fn now(&self) -> i64 {
        self.0
    }
}

/// Weighted point/relative residuals plus the two scalar summaries
/// (spec §4.11), alongside the raw sum-of-squares the engine itself
/// optimizes (`internal_residuals` — the same quantity as
/// `EngineOutcome::residual_norm_sq`, kept distinct since it is not on
/// the same scale as `overall_residuals`).
#[derive(Debug, Clone)]
pub struct ResidualSummary {
    pub point_residuals: Vec<f64>,
    pub relative_residuals: Vec<f64>,
    pub overall_residuals: f64,
    pub overall_relative_residuals: f64,
    pub internal_residuals: f64,
}

/// Everything a caller needs after one `run_fit` call, mirroring what
/// gets pushed onto `trajectories` but in an directly-usable shape.
#[derive(Debug, Clone)]
pub struct FitRunResult {
    pub ending: EndingReason,
    pub packed: Vec<f64>,
    pub expanded: Vec<f64>,
    pub parameter_errors: Vec<f64>,
    pub confidence_half_widths: Vec<f64>,
    pub residual_summary: ResidualSummary,
}

/// The session-level fit orchestrator (spec §2).
pub struct FitWorkspace {
    pub data: FitData,
    pub config: LmConfig,
    pub trajectories: FitTrajectories,
    cancel: Arc<AtomicBool>,
    force_error: Arc<AtomicBool>,
}

impl FitWorkspace {
    /// Takes ownership of an already-bound `FitData` and wires its
    /// cooperative cancellation/throw flags in.
    pub fn new(mut data: FitData, config: LmConfig) -> Self {
        let cancel = Arc::new(AtomicBool::new(false));
        let force_error = Arc::new(AtomicBool::new(false));
        data.force_error = Some(Arc::clone(&force_error));
        FitWorkspace {
            data,
            config,
            trajectories: FitTrajectories::new(),
            cancel,
            force_error,
        }
    }

    /// A clonable handle another thread can use to request cancellation
    /// mid-fit (spec §5).
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn request_cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    /// Arms the "abandon this fit" flag: the next residual evaluation
    /// raises `FitError::Internal`, which the engine reports as
    /// `EndingReason::Exception` (spec §5's "throw flag").
    pub fn request_throw(&self) {
        self.force_error.store(true, Ordering::Relaxed);
    }

    /// Runs the fit from `initial_packed` to convergence/abandonment,
    /// updates `self.data.packed`, and pushes a [`FitTrajectory`] (spec
    /// §4.10/§4.11/§4.12). A fit that ends in `Error`/`Exception`/
    /// `ConvergenceError` rolls back to the parameters the workspace
    /// held before the call; `Converged`, `TimeOut` and `Cancelled`
    /// keep whatever the engine last accepted.
    pub fn run_fit(
        &mut self,
        initial_packed: Vec<f64>,
        storage: &mut dyn FitStorage,
        reporter: &mut dyn Reporter,
        clock: &dyn Clock,
    ) -> Result<FitRunResult, FitError> {
        let start_time = clock.now();
        let snapshot = self.data.packed.clone();
        let initial_expanded = self.data.expand(&initial_packed)?;

        let outcome = if self.can_subdivide() {
            self.run_subdivided(initial_packed, reporter)
        } else {
            fit_engine::run_lm(
                &self.data,
                storage,
                initial_packed,
                &self.config,
                reporter,
                &self.cancel,
            )
        };

        let rollback = matches!(
            outcome.ending,
            EndingReason::Error | EndingReason::Exception | EndingReason::ConvergenceError
        );
        let final_packed = if rollback { snapshot } else { outcome.packed.clone() };
        self.data.packed = final_packed.clone();

        let expanded = self.data.expand(&final_packed)?;
        let summary = self.residual_summary(&final_packed, storage)?;
        let errors = self.parameter_errors(outcome.jtj.as_ref(), outcome.residual_norm_sq);
        let half_widths = self.confidence_half_widths(&errors);
        let end_time = clock.now();

        self.trajectories.push(FitTrajectory {
            start_time,
            end_time,
            engine_name: "lm".to_string(),
            initial_parameters: initial_expanded,
            final_parameters: expanded.clone(),
            parameter_errors: errors.clone(),
            weights: self.data.weights_per_buffer.clone(),
            point_residuals: summary.point_residuals.clone(),
            relative_residuals: summary.relative_residuals.clone(),
            overall_residuals: summary.overall_residuals,
            overall_relative_residuals: summary.overall_relative_residuals,
            internal_residuals: summary.internal_residuals,
            iterations: outcome.iterations,
            evaluations: outcome.evaluations,
            delta: outcome.last_delta,
            ending: outcome.ending,
            flags: Default::default(),
            extra_fields: Default::default(),
        });

        Ok(FitRunResult {
            ending: outcome.ending,
            packed: final_packed,
            expanded,
            parameter_errors: errors,
            confidence_half_widths: half_widths,
            residual_summary: summary,
        })
    }

    /// Spec §4.10: subdivision is only valid once every free parameter
    /// is per-dataset — a single global free parameter couples every
    /// dataset together and rules it out.
    fn can_subdivide(&self) -> bool {
        self.data.parameters.plan.global_free.is_empty() && self.data.num_datasets() > 1
    }

    /// Runs one independent `FitData` per dataset, sequentially (spec
    /// §5: subordinate fits "are run sequentially but each can use its
    /// own worker pool"), and reassembles the per-dataset results into
    /// one combined [`EngineOutcome`] so `run_fit` can treat this
    /// exactly like a direct `run_lm` call.
    fn run_subdivided(&self, initial_packed: Vec<f64>, reporter: &mut dyn Reporter) -> EngineOutcome {
        let plan = self.data.parameters.plan.clone();
        let n_datasets = self.data.num_datasets();

        let mut combined_packed = initial_packed.clone();
        let mut total_iterations = 0usize;
        let mut total_evaluations = 0usize;
        let mut total_residual_sq = 0.0f64;
        let mut last_delta = 0.0f64;
        let mut diagonal_blocks: Vec<DMatrix<f64>> = Vec::with_capacity(n_datasets);
        let mut all_converged = true;
        let mut overall_ending = EndingReason::Converged;

        for (ds, locals) in plan.per_dataset_free.iter().enumerate() {
            if self.cancel.load(Ordering::Relaxed) {
                overall_ending = EndingReason::Cancelled;
                all_converged = false;
                break;
            }

            let sub_data = match self.build_subordinate(ds) {
                Ok(d) => d,
                Err(_) => {
                    overall_ending = EndingReason::Exception;
                    all_converged = false;
                    break;
                }
            };
            let sub_initial: Vec<f64> = locals.iter().map(|&fi| initial_packed[fi]).collect();
            let mut sub_storage = self.data.fit.allocate_storage();

            let sub_outcome = fit_engine::run_lm(
                &sub_data,
                sub_storage.as_mut(),
                sub_initial,
                &self.config,
                reporter,
                &self.cancel,
            );

            for (&fi, &value) in izip!(locals.iter(), sub_outcome.packed.iter()) {
                combined_packed[fi] = value;
            }
            total_iterations += sub_outcome.iterations;
            total_evaluations += sub_outcome.evaluations;
            total_residual_sq += sub_outcome.residual_norm_sq;
            last_delta = sub_outcome.last_delta;

            if sub_outcome.ending != EndingReason::Converged {
                all_converged = false;
                overall_ending = sub_outcome.ending;
                break;
            }
            match sub_outcome.jtj {
                Some(jtj) => diagonal_blocks.push(jtj.diagonal_block(0).clone()),
                None => all_converged = false,
            }
        }

        let jtj = if all_converged && diagonal_blocks.len() == n_datasets {
            let border_blocks = plan
                .per_dataset_free
                .iter()
                .map(|locals| DMatrix::zeros(locals.len(), 0))
                .collect();
            Some(ABDMatrix::new(
                diagonal_blocks,
                border_blocks,
                DMatrix::zeros(0, 0),
                plan.per_dataset_free.clone(),
                vec![],
                plan.free_count,
            ))
        } else {
            None
        };

        EngineOutcome {
            packed: combined_packed,
            ending: if all_converged { EndingReason::Converged } else { overall_ending },
            iterations: total_iterations,
            evaluations: total_evaluations,
            residual_norm_sq: total_residual_sq,
            jtj,
            last_delta,
        }
    }

    /// Builds a single-dataset `FitData` scoped to dataset `ds`: its own
    /// per-dataset entries (remapped to dataset `0`) plus any global
    /// fixed/formula entries, which still apply to every sub-fit.
    fn build_subordinate(&self, ds: usize) -> Result<FitData, FitError> {
        let definitions = self.data.parameters.definitions.clone();
        let mut entries = Vec::new();
        for e in &self.data.parameters.entries {
            if e.ds_index == ds as i64 {
                let mut remapped = e.clone();
                remapped.ds_index = 0;
                entries.push(remapped);
            } else if e.ds_index == GLOBAL_DATASET {
                entries.push(e.clone());
            }
        }
        let parameters = ParameterSet::initialize(definitions, entries, 1)?;
        let free_count = parameters.free_count();

        let point_errors = self.data.point_errors.as_ref().map(|errors| {
            let range = self.data.layout.range(ds);
            errors[range].to_vec()
        });

        Ok(FitData {
            fit: Arc::clone(&self.data.fit),
            datasets: vec![self.data.datasets[ds].clone()],
            layout: DatasetLayout::new(vec![self.data.layout.row_count(ds)]),
            weights_per_buffer: vec![self.data.weights_per_buffer[ds]],
            point_errors,
            parameters,
            packed: vec![0.0; free_count],
            debug_level: self.data.debug_level,
            extra_parameter_names: self.data.extra_parameter_names.clone(),
            threads: self.data.threads,
            relative_step: self.data.relative_step,
            force_error: self.data.force_error.clone(),
        })
    }

    /// Per-dataset point/relative residuals and their two overall
    /// scalar summaries (spec §3/§4.11 glossary): `point_residuals[ds]
    /// = sqrt(Σ_i w_ds (y_i-f_i)² / Σ_i w_ds)` and `relative_residuals[ds]
    /// = sqrt(Σ(y-f)²/Σy²)`, read off the raw (unweighted) difference,
    /// one value per dataset — not the full per-point vector. The two
    /// overall scalars pool the same sums across every dataset;
    /// `internal_residuals` stays the solver's own weighted
    /// sum-of-squares, the quantity `run_lm` actually minimizes.
    fn residual_summary(
        &self,
        packed: &[f64],
        storage: &mut dyn FitStorage,
    ) -> Result<ResidualSummary, FitError> {
        let weighted = self.data.residuals(packed, storage)?;
        let raw = self.data.raw_residuals(packed, storage)?;
        let internal_residuals: f64 = weighted.iter().map(|v| v * v).sum();

        let n_datasets = self.data.num_datasets();
        let mut point_residuals = vec![0.0; n_datasets];
        let mut relative_residuals = vec![0.0; n_datasets];
        let mut total_weighted_sq = 0.0;
        let mut total_weight = 0.0;
        let mut total_sq = 0.0;
        let mut total_y_sq = 0.0;

        for ds in 0..n_datasets {
            let w = self.data.weights_per_buffer[ds];
            let range = self.data.layout.range(ds);
            let mut weighted_sq = 0.0;
            let mut sq = 0.0;
            let mut y_sq = 0.0;
            for (&r, &y) in raw[range].iter().zip(self.data.datasets[ds].y.iter()) {
                weighted_sq += w * r * r;
                sq += r * r;
                y_sq += y * y;
            }
            let count = self.data.layout.row_count(ds) as f64;
            let weight_sum = w * count;
            point_residuals[ds] = if weight_sum > 0.0 { (weighted_sq / weight_sum).sqrt() } else { 0.0 };
            relative_residuals[ds] = if y_sq > 0.0 { (sq / y_sq).sqrt() } else { 0.0 };

            total_weighted_sq += weighted_sq;
            total_weight += weight_sum;
            total_sq += sq;
            total_y_sq += y_sq;
        }

        let overall_residuals = if total_weight > 0.0 { (total_weighted_sq / total_weight).sqrt() } else { 0.0 };
        let overall_relative_residuals = if total_y_sq > 0.0 { (total_sq / total_y_sq).sqrt() } else { 0.0 };

        Ok(ResidualSummary {
            point_residuals,
            relative_residuals,
            overall_residuals,
            overall_relative_residuals,
            internal_residuals,
        })
    }

    /// Standard error per declared-parameter × dataset slot (spec
    /// §4.11): `sqrt(sigma^2 * (J^T J)^-1_ii)` with `sigma^2 =
    /// residual_norm_sq / dof` taken unconditionally (this crate's
    /// resolution of an Open Question — see DESIGN.md). Zero for
    /// fixed/formula entries and whenever no converged jacobian is
    /// available.
    fn parameter_errors(&self, jtj: Option<&ABDMatrix>, residual_norm_sq: f64) -> Vec<f64> {
        let mut errors = vec![0.0; self.data.parameters.entries.len()];
        let Some(jtj) = jtj else {
            return errors;
        };
        let dof = self.data.total_points() as isize - self.data.free_count() as isize;
        if dof <= 0 {
            return errors;
        }
        let sigma2 = residual_norm_sq / dof as f64;
        let Ok(inverse) = jtj.invert() else {
            return errors;
        };
        for (idx, entry) in self.data.parameters.entries.iter().enumerate() {
            if let Some(fi) = entry.fit_index() {
                errors[idx] = (inverse[(fi, fi)] * sigma2).max(0.0).sqrt();
            }
        }
        errors
    }

    /// `errors[i] * t_{(1+CONFIDENCE_LEVEL)/2, dof}` — the 95%
    /// confidence interval half-width (spec §4.11). `NaN` for every
    /// entry when `dof <= 0`.
    fn confidence_half_widths(&self, errors: &[f64]) -> Vec<f64> {
        let dof = self.data.total_points() as isize - self.data.free_count() as isize;
        if dof <= 0 {
            return vec![f64::NAN; errors.len()];
        }
        let t = stats::student_t_quantile(0.5 + CONFIDENCE_LEVEL / 2.0, dof as f64);
        errors.iter().map(|&e| e * t).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Dataset;
    use crate::fit_model::Fit;
    use crate::parameter_definition::ParameterDefinition;
    use crate::reporter::NullReporter;

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

    /// `y = a_k * exp(-k_rate * x)`, with `a` and `rate` both per-dataset
    /// (no globals) so the workspace should subdivide.
    struct PerDatasetExpFit;

    impl Fit for PerDatasetExpFit {
        fn name(&self) -> &str {
            "per-dataset-exp"
        }

        fn parameters(&self, _data: &FitData) -> Vec<ParameterDefinition> {
            vec![ParameterDefinition::new("a"), ParameterDefinition::new("k")]
        }

        fn initial_guess(&self, _data: &FitData, expanded_out: &mut [f64]) -> Result<(), FitError> {
            expanded_out.fill(1.0);
            Ok(())
        }

        fn function(
            &self,
            _packed: &[f64],
            _data: &FitData,
            _storage: &mut dyn FitStorage,
            _residual_out: &mut [f64],
        ) -> Result<(), FitError> {
            Ok(())
        }

        fn function_for_dataset(
            &self,
            packed: &[f64],
            data: &FitData,
            ds: usize,
            _storage: &mut dyn FitStorage,
            residual_out: &mut [f64],
        ) -> Option<Result<(), FitError>> {
            let locals = &data.parameters.plan.per_dataset_free[ds];
            let a = packed[locals[0]];
            let k = packed[locals[1]];
            for (out, (x, y)) in residual_out
                .iter_mut()
                .zip(data.datasets[ds].x.iter().zip(data.datasets[ds].y.iter()))
            {
                *out = a * (-k * x).exp() - y;
            }
            Some(Ok(()))
        }
    }

    fn exp_dataset(a: f64, k: f64) -> Dataset {
        let x: Vec<f64> = (0..20).map(|i| i as f64 * 0.5).collect();
        let y: Vec<f64> = x.iter().map(|&xi| a * (-k * xi).exp()).collect();
        Dataset::new(x, y)
    }

    #[test]
    fn test_run_fit_converges_and_pushes_trajectory() {
        let fit: Arc<dyn crate::fit_model::Fit> = Arc::new(ExpFit);
        let data = FitData::new(fit, vec![exp_dataset(3.0, 0.4)]).unwrap();
        let mut workspace = FitWorkspace::new(data, LmConfig::default());
        let initial = workspace.data.initial_guess().unwrap();
        let mut storage = ();
        let mut reporter = NullReporter;
        let clock = FixedClock(1_000);

        let result = workspace
            .run_fit(initial, &mut storage, &mut reporter, &clock)
            .unwrap();

        assert_eq!(result.ending, EndingReason::Converged);
        assert!((result.expanded[0] - 3.0).abs() < 1e-4);
        assert!((result.expanded[1] - 0.4).abs() < 1e-4);
        assert_eq!(workspace.trajectories.len(), 1);
        assert_eq!(workspace.trajectories.get(0).unwrap().start_time, 1_000);
        assert!(result.parameter_errors.iter().all(|e| e.is_finite()));
        assert!(result.confidence_half_widths.iter().all(|w| w.is_finite()));
    }

    #[test]
    fn test_subdivision_runs_independent_per_dataset_fits() {
        let fit: Arc<dyn crate::fit_model::Fit> = Arc::new(PerDatasetExpFit);
        let data = FitData::new(
            fit,
            vec![exp_dataset(3.0, 0.4), exp_dataset(5.0, 0.2)],
        )
        .unwrap();
        let mut workspace = FitWorkspace::new(data, LmConfig::default());
        assert!(workspace.can_subdivide());

        let initial = workspace.data.initial_guess().unwrap();
        let mut storage = ();
        let mut reporter = NullReporter;
        let clock = FixedClock(0);

        let result = workspace
            .run_fit(initial, &mut storage, &mut reporter, &clock)
            .unwrap();

        assert_eq!(result.ending, EndingReason::Converged);
        // 2 datasets x (a, k) = 4 expanded slots
        assert_eq!(result.expanded.len(), 4);
        assert!((result.expanded[0] - 3.0).abs() < 1e-3);
        assert!((result.expanded[1] - 5.0).abs() < 1e-3);
        assert!((result.expanded[2] - 0.4).abs() < 1e-3);
        assert!((result.expanded[3] - 0.2).abs() < 1e-3);
    }

    #[test]
    fn test_cancellation_rolls_back_nothing_but_marks_cancelled() {
        let fit: Arc<dyn crate::fit_model::Fit> = Arc::new(ExpFit);
        let data = FitData::new(fit, vec![exp_dataset(3.0, 0.4)]).unwrap();
        let mut workspace = FitWorkspace::new(data, LmConfig::default());
        workspace.request_cancel();
        let initial = workspace.data.initial_guess().unwrap();
        let mut storage = ();
        let mut reporter = NullReporter;
        let clock = FixedClock(5);

        let result = workspace
            .run_fit(initial, &mut storage, &mut reporter, &clock)
            .unwrap();
        assert_eq!(result.ending, EndingReason::Cancelled);
    }

    #[test]
    fn test_request_throw_forces_exception_and_rolls_back() {
        let fit: Arc<dyn crate::fit_model::Fit> = Arc::new(ExpFit);
        let data = FitData::new(fit, vec![exp_dataset(3.0, 0.4)]).unwrap();
        let mut workspace = FitWorkspace::new(data, LmConfig::default());
        let initial = workspace.data.initial_guess().unwrap();
        let previous_packed = workspace.data.packed.clone();
        workspace.request_throw();
        let mut storage = ();
        let mut reporter = NullReporter;
        let clock = FixedClock(7);

        let result = workspace
            .run_fit(initial, &mut storage, &mut reporter, &clock)
            .unwrap();
        assert_eq!(result.ending, EndingReason::Exception);
        assert_eq!(workspace.data.packed, previous_packed);
    }
}
