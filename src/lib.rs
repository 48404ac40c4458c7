//! Non-linear least-squares fitting core: block-sparse Levenberg-Marquardt
//! with per-dataset and global free parameters.
//!
//! The pieces compose top-down: a [`fit_model::Fit`] declares its
//! parameters and residual function; a [`fit_data::FitData`] binds one
//! such model to a set of datasets and turns evaluations into a
//! [`sparse_jacobian::SparseJacobian`]/residual pair (`fdf`); an
//! [`abd_matrix::ABDMatrix`] solves the resulting normal equations in
//! block-sparse form; [`fit_engine::run_lm`] drives the
//! Levenberg-Marquardt loop to convergence; and
//! [`fit_workspace::FitWorkspace`] is the session-level orchestrator
//! that also builds residual summaries, parameter standard errors,
//! confidence intervals, and the [`trajectory::FitTrajectories`] log.

pub mod abd_matrix;
pub mod dataset;
pub mod dataset_layout;
pub mod derivative_queue;
pub mod errors;
pub mod expression;
pub mod fit_data;
pub mod fit_engine;
pub mod fit_model;
pub mod fit_options;
pub mod fit_parameter;
pub mod fit_workspace;
pub mod packing;
pub mod parameter_definition;
pub mod parameter_file;
pub mod reporter;
pub mod sparse_jacobian;
pub mod stats;
pub mod trajectory;

pub use abd_matrix::ABDMatrix;
pub use dataset::Dataset;
pub use dataset_layout::DatasetLayout;
pub use errors::{FitError, ParameterFileError, TrajectoryFileError};
pub use fit_data::FitData;
pub use fit_engine::{
    create_engine, register_engine, registered_engine_names, run_lm, EngineOutcome, FitEngine, LmConfig,
};
pub use fit_model::{create_fit, register_fit, registered_fit_names, Fit, FitStorage};
pub use fit_options::FitOptions;
pub use fit_parameter::{FitParameter, ParameterKind, GLOBAL_DATASET};
pub use fit_workspace::{Clock, FitRunResult, FitWorkspace, ResidualSummary, SystemClock};
pub use packing::{PackingPlan, ParameterSet};
pub use parameter_definition::ParameterDefinition;
pub use reporter::{NullReporter, RecordingReporter, Reporter};
pub use sparse_jacobian::{JacobianColumn, SparseJacobian};
pub use trajectory::{EndingReason, FitTrajectories, FitTrajectory};
