//! Infer strain genotypes and community composition from pooled,
//! allele-resolved sequencing counts.
//!
//! A [`Structure`] declares a generative model over the dimensions
//! `strain`, `sample`, `position` and `allele`. Bound to coordinates it
//! becomes a [`ParameterizedModel`] which can simulate worlds or, once
//! conditioned on observed counts, be fit with [`estimate_parameters`].
//! The [`workflow`] module strings these together, including chunked
//! refinement of genotypes with a fixed community.

pub mod config;
pub mod data;
pub mod estimation;
pub mod evaluation;
pub mod labeled;
pub mod laplace;
pub(crate) mod math;
pub mod model;
pub mod model_zoo;
pub mod nmf;
pub mod optim;
pub mod scheduler;
pub mod structure;
pub mod workflow;

pub use config::{ConfigError, WorkflowConfig};
pub use data::{Community, DataError, Genotype, Metagenotype, World};
pub use estimation::{
    estimate_parameters, Elbo, EstimationError, EstimationSettings, FitHistory, FitStatus,
    InterruptFlag, ParamStore,
};
pub use labeled::{Coords, LabeledArray, LabeledError};
pub use model::ParameterizedModel;
pub use model_zoo::SIMPLE;
pub use nmf::{NmfError, NmfSettings};
pub use optim::{OptimizerKwargs, OptimizerName};
pub use scheduler::{PlateauOptions, ReduceLrOnPlateau};
pub use structure::{DType, Data, Device, Hyperparameters, ModelError, Program, Structure, Values};
pub use workflow::{
    chunk_start_end_iterator, evaluate_fit_against_simulation, fit_metagenotype,
    iteratively_fit_genotype_conditioned_on_community, simulate_world, ChunkedFit, Fit,
    FitOptions, SimulationSizes,
};
