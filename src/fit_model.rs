//! The model contract consumed from concrete fit providers (spec §4.1).
//!
//! A model is a capability record rather than a class hierarchy (§9's
//! "small capability record (vtable struct)" guidance): [`Fit`] is a
//! trait object exposing `parameters`, `initial_guess`, `function`, and
//! a handful of optional hooks (`function_for_dataset`,
//! `compute_sub_functions`, hard/soft option parsing, thread-safety).
//! Per-model scratch storage is likewise type-erased behind
//! [`FitStorage`] so the core never needs to know what a concrete model
//! keeps around between evaluations (lookup tables, cached splines...).

use std::any::Any;
use std::collections::HashMap;
use std::sync::Mutex;

use lazy_static::lazy_static;

use crate::errors::FitError;
use crate::fit_data::FitData;
use crate::parameter_definition::ParameterDefinition;

/// Type-erased per-model scratch storage (§9 "thread-local scratch").
/// Models that need no scratch can use `()`, which already implements
/// this via the blanket impl below.
pub trait FitStorage: Any + Send {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
    /// Duplicate this storage for a new worker thread. Implemented in
    /// terms of the concrete type, since `FitStorage` itself cannot be
    /// `Clone` (it is used as a trait object).
    fn duplicate(&self) -> Box<dyn FitStorage>;
}

impl<T: Any + Send + Clone> FitStorage for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn duplicate(&self) -> Box<dyn FitStorage> {
        Box::new(self.clone())
    }
}

/// The per-model contract (spec §4.1).
///
/// `function`/`function_for_dataset` write `model(x_i) - y_i` into the
/// residual buffer, in dataset order; they may return
/// `FitError::Range` to signal a domain violation, which the engine
/// treats as "reject this trial step" (or, during the very first
/// evaluation, as fatal — see `fit_engine`).
pub trait Fit: Send + Sync {
    /// Stable identifier used in the engine/fit factory registries and
    /// in parameter-file `# Fit used:` headers.
    fn name(&self) -> &str;

    /// Declares the parameters this model exposes. May depend on hard
    /// options already parsed into `data`; computed once per `FitData`.
    fn parameters(&self, data: &FitData) -> Vec<ParameterDefinition>;

    /// Writes one value per declared-parameter × dataset slot (the
    /// expanded vector) as a starting point for the fit.
    fn initial_guess(&self, data: &FitData, expanded_out: &mut [f64]) -> Result<(), FitError>;

    /// Writes `model(x_i) - y_i` for every point, in dataset order.
    fn function(
        &self,
        packed: &[f64],
        data: &FitData,
        storage: &mut dyn FitStorage,
        residual_out: &mut [f64],
    ) -> Result<(), FitError>;

    /// Narrow per-dataset variant; when present, the core dispatches
    /// per-dataset rather than recomputing and slicing the full
    /// residual vector. Default: not provided.
    fn function_for_dataset(
        &self,
        _packed: &[f64],
        _data: &FitData,
        _ds: usize,
        _storage: &mut dyn FitStorage,
        _residual_out: &mut [f64],
    ) -> Option<Result<(), FitError>> {
        None
    }

    /// Analytic jacobian, when the model can provide one; `columns`
    /// has one entry per free parameter in fit-index order, each
    /// pre-sized to its support (global = full length, per-dataset =
    /// that dataset's row count). Default: no analytic derivative;
    /// the engine falls back to finite differences (§4.4).
    fn compute_analytic_jacobian(
        &self,
        _packed: &[f64],
        _data: &FitData,
        _storage: &mut dyn FitStorage,
        _columns: &mut [Vec<f64>],
    ) -> Option<Result<(), FitError>> {
        None
    }

    fn has_sub_functions(&self) -> bool {
        false
    }

    /// Per-point decomposition for display only (§4.1); must not
    /// affect fitting. `sub_functions_out[k]` is the k-th sub-function's
    /// contribution, one residual-length vector each.
    fn compute_sub_functions(
        &self,
        _packed: &[f64],
        _data: &FitData,
        _storage: &mut dyn FitStorage,
        _sub_functions_out: &mut Vec<Vec<f64>>,
    ) -> Result<(), FitError> {
        Ok(())
    }

    /// Parse hard options (affect the parameter list; re-parsing
    /// requires rebuilding `FitData`'s parameter set) and soft options
    /// (applied on the fly, do not change `parameters()`'s output).
    /// Default: no model-specific options.
    fn parse_hard_options(&self, _options: &HashMap<String, String>) -> Result<(), FitError> {
        Ok(())
    }

    fn parse_soft_options(&self, _options: &HashMap<String, String>) -> Result<(), FitError> {
        Ok(())
    }

    /// When true, the core may call derivative computations from
    /// multiple workers concurrently, each with its own scratch
    /// obtained via `allocate_storage`/`copy_storage`. Default: false
    /// (conservative).
    fn thread_safe(&self) -> bool {
        false
    }

    fn allocate_storage(&self) -> Box<dyn FitStorage> {
        Box::new(())
    }

    fn copy_storage(&self, src: &dyn FitStorage) -> Box<dyn FitStorage> {
        src.duplicate()
    }
}

type FitFactory = Box<dyn Fn() -> Box<dyn Fit> + Send + Sync>;

lazy_static! {
    /// Global link-time registration table mapping fit names to
    /// factory closures (§9 "additional engines can register
    /// themselves in a global factory table"; applied here to models
    /// too, mirroring the original's `Fit::fitsByName` registry).
    static ref FIT_REGISTRY: Mutex<HashMap<String, FitFactory>> = Mutex::new(HashMap::new());
}

/// Registers a model factory under `name`. Intended to be called once
/// per concrete model, typically from that model crate's own
/// initialization path (a `ctor`-style hook or an explicit call from
/// `main`); re-registering the same name overwrites the previous entry.
pub fn register_fit(name: impl Into<String>, factory: FitFactory) {
    FIT_REGISTRY.lock().unwrap().insert(name.into(), factory);
}

/// Looks up a registered model by name and instantiates it.
pub fn create_fit(name: &str) -> Result<Box<dyn Fit>, FitError> {
    FIT_REGISTRY
        .lock()
        .unwrap()
        .get(name)
        .map(|f| f())
        .ok_or_else(|| FitError::runtime(format!("no such fit: '{name}'")))
}

pub fn registered_fit_names() -> Vec<String> {
    let mut names: Vec<String> = FIT_REGISTRY.lock().unwrap().keys().cloned().collect();
    names.sort();
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone)]
    struct NoopStorage;

    struct ConstantFit;

    impl Fit for ConstantFit {
        fn name(&self) -> &str {
            "constant"
        }

        fn parameters(&self, _data: &FitData) -> Vec<ParameterDefinition> {
            vec![ParameterDefinition::new("c")]
        }

        fn initial_guess(&self, _data: &FitData, expanded_out: &mut [f64]) -> Result<(), FitError> {
            expanded_out.fill(0.0);
            Ok(())
        }

        fn function(
            &self,
            packed: &[f64],
            _data: &FitData,
            _storage: &mut dyn FitStorage,
            residual_out: &mut [f64],
        ) -> Result<(), FitError> {
            residual_out.fill(packed[0]);
            Ok(())
        }
    }

    #[test]
    fn test_storage_blanket_impl_duplicates() {
        let storage: Box<dyn FitStorage> = Box::new(NoopStorage);
        let dup = storage.duplicate();
        assert!(dup.as_any().downcast_ref::<NoopStorage>().is_some());
    }

    #[test]
    fn test_register_and_create_fit() {
        register_fit("constant-test", Box::new(|| Box::new(ConstantFit)));
        let fit = create_fit("constant-test").unwrap();
        assert_eq!(fit.name(), "constant");
    }

    #[test]
    fn test_create_unknown_fit_errors() {
        assert!(create_fit("does-not-exist-xyz").is_err());
    }
}
