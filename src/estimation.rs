//! Maximum a posteriori fitting of a parameterized model with a Laplace
//! approximation guide.
//!
//! The loss is the negative log joint density of the conditioned program in
//! unconstrained space, which is the ELBO of a point-mass guide up to a
//! constant. The mode is moved by one of the optimizers in [`crate::optim`]
//! while [`ReduceLrOnPlateau`] anneals the learning rate. A fit converges
//! once the learning rate has dropped below [`CONVERGED_LEARNING_RATE`].

use std::{
    collections::BTreeMap,
    io::IsTerminal,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    data::World,
    laplace::LaplaceApproximation,
    model::{seeded_rng, ParameterizedModel},
    optim::{Optimizer, OptimizerKwargs, OptimizerName},
    scheduler::{PlateauOptions, ReduceLrOnPlateau},
    structure::{ModelError, Program, Values},
};

pub const CONVERGED_LEARNING_RATE: f64 = 1e-6;

/// Name of the mode parameter in the [`ParamStore`].
const LOC: &str = "loc";

#[non_exhaustive]
#[derive(Error, Debug)]
pub enum EstimationError {
    #[error("ELBO NaN? (best loss {best:.5e} after {steps} steps)")]
    NanElbo { best: f64, steps: usize },
    #[error("interrupted after {steps} steps")]
    Interrupted { steps: usize },
    #[error("parameter `{0}` is not in the parameter store")]
    MissingParameter(&'static str),
    #[error("could not compute the posterior curvature: {0}")]
    Curvature(String),
    #[error(transparent)]
    Model(#[from] ModelError),
}

/// A cooperative stop request, checked between optimization steps.
#[derive(Debug, Clone, Default)]
pub struct InterruptFlag(Arc<AtomicBool>);

impl InterruptFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Clear the flag, returning whether it was set.
    fn take(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }
}

/// Named parameters of one estimation call.
#[derive(Debug, Default)]
pub struct ParamStore {
    params: BTreeMap<String, Vec<f64>>,
}

impl ParamStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, values: Vec<f64>) {
        self.params.insert(name.into(), values);
    }

    pub fn get(&self, name: &str) -> Option<&[f64]> {
        self.params.get(name).map(Vec::as_slice)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut [f64]> {
        self.params.get_mut(name).map(Vec::as_mut_slice)
    }

    pub fn remove(&mut self, name: &str) -> Option<Vec<f64>> {
        self.params.remove(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.params.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }
}

/// How the loss is evaluated at each step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Elbo {
    /// Re-instantiate the program from the model at every step.
    Trace,
    /// Instantiate once and reuse the program and its buffers.
    JitTrace,
}

impl Elbo {
    pub fn new(jit: bool) -> Self {
        if jit {
            Elbo::JitTrace
        } else {
            Elbo::Trace
        }
    }
}

struct LossFunction<'model> {
    elbo: Elbo,
    model: &'model ParameterizedModel,
    program: Box<dyn Program>,
    gradient: Vec<f64>,
}

impl<'model> LossFunction<'model> {
    fn new(elbo: Elbo, model: &'model ParameterizedModel) -> Result<Self, EstimationError> {
        let program = model.program()?;
        let gradient = vec![0.; program.dim()];
        Ok(Self {
            elbo,
            model,
            program,
            gradient,
        })
    }

    fn dim(&self) -> usize {
        self.gradient.len()
    }

    /// Negative log density at `position`, with its gradient in `grad`.
    fn evaluate(&mut self, position: &[f64], grad: &mut [f64]) -> Result<f64, EstimationError> {
        if let Elbo::Trace = self.elbo {
            self.program = self.model.program()?;
        }
        let logp = self.program.logp(position, &mut self.gradient)?;
        grad.iter_mut()
            .zip(&self.gradient)
            .for_each(|(out, g)| *out = -g);
        Ok(-logp)
    }

    fn into_program(self) -> Box<dyn Program> {
        self.program
    }
}

/// Settings for [`estimate_parameters`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimationSettings {
    pub optimizer: OptimizerName,
    pub optimizer_kwargs: OptimizerKwargs,
    pub maxiter: u64,
    /// Short reporting window; also how often convergence is checked.
    #[serde(rename = "lagA")]
    pub lag_a: u64,
    /// Long reporting window.
    #[serde(rename = "lagB")]
    pub lag_b: u64,
    pub patience: u64,
    pub cooldown: u64,
    pub factor: f64,
    pub jit: bool,
    pub seed: Option<u64>,
    pub quiet: bool,
    /// Accept an interrupt as an early stopping point instead of failing.
    pub catch_interrupt: bool,
    /// Posterior draws averaged into the estimate; zero predicts at the mode.
    pub posterior_samples: usize,
    #[serde(skip)]
    pub interrupt: Option<InterruptFlag>,
}

impl Default for EstimationSettings {
    fn default() -> Self {
        Self {
            optimizer: OptimizerName::default(),
            optimizer_kwargs: OptimizerKwargs::default(),
            maxiter: 10_000,
            lag_a: 20,
            lag_b: 100,
            patience: 100,
            cooldown: 100,
            factor: 0.5,
            jit: true,
            seed: None,
            quiet: false,
            catch_interrupt: false,
            posterior_samples: 0,
            interrupt: None,
        }
    }
}

impl EstimationSettings {
    pub fn plateau_options(&self) -> PlateauOptions {
        PlateauOptions {
            patience: self.patience,
            cooldown: self.cooldown,
            factor: self.factor,
            min_lr: 0.,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FitStatus {
    Converged,
    Interrupted,
    MaxIter,
}

/// Per-step losses (negative ELBO) of one fit and how it ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitHistory {
    pub losses: Vec<f64>,
    pub status: FitStatus,
    /// Learning rate when the loop stopped.
    pub learning_rate: f64,
}

impl FitHistory {
    pub fn len(&self) -> usize {
        self.losses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.losses.is_empty()
    }

    pub fn last(&self) -> Option<f64> {
        self.losses.last().copied()
    }

    pub fn best(&self) -> Option<f64> {
        self.losses.iter().copied().reduce(f64::min)
    }
}

fn create_progress_bar(len: u64, message: &str, quiet: bool) -> ProgressBar {
    let draw_target = if !quiet && std::io::stderr().is_terminal() {
        ProgressDrawTarget::stderr_with_hz(20)
    } else {
        ProgressDrawTarget::hidden()
    };

    let pb = ProgressBar::with_draw_target(Some(len), draw_target);
    if let Ok(style) = ProgressStyle::with_template(
        "\n> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
    ) {
        pb.set_style(style.progress_chars("█▉▊▋▌▍▎▏  "));
    }
    pb.set_message(message.to_string());
    pb
}

/// Average improvement per step over the last `lag` steps.
fn lagged_delta(history: &[f64], step: u64, lag: u64) -> f64 {
    let lag = lag as usize;
    if step as usize > lag && lag > 0 {
        (history[history.len() - lag] - history[history.len() - 1]) / lag as f64
    } else {
        f64::NAN
    }
}

fn progress_message(history: &[f64], step: u64, settings: &EstimationSettings, lr: f64) -> String {
    let delta = if step > 2 {
        history[history.len() - 2] - history[history.len() - 1]
    } else {
        f64::NAN
    };
    format!(
        "ELBO={:.5e} delta={:.2e} lag{}={:.2e} lag{}={:.2e} lr={:.2e}",
        -history[history.len() - 1],
        delta,
        settings.lag_a,
        lagged_delta(history, step, settings.lag_a),
        settings.lag_b,
        lagged_delta(history, step, settings.lag_b),
        lr
    )
}

/// Fit the free latent variables of `model` to its conditioned data.
///
/// Latent variables present in `init` start at those values. Returns the
/// estimate as a [`World`] together with the loss history.
pub fn estimate_parameters(
    model: &ParameterizedModel,
    init: &Values,
    settings: &EstimationSettings,
) -> Result<(World, FitHistory), EstimationError> {
    let quiet = settings.quiet;
    let mut rng = seeded_rng(settings.seed, !quiet);

    let mut loss = LossFunction::new(Elbo::new(settings.jit), model)?;
    let dim = loss.dim();

    let dtype = model.dtype();
    let init: Values = init
        .iter()
        .map(|(name, values)| (name.clone(), values.mapv(|x| dtype.cast(x))))
        .collect();
    let mut loc = vec![0.; dim];
    loss.program.init_position(&init, &mut rng, &mut loc)?;

    let mut store = ParamStore::new();
    store.insert(LOC, loc);

    let mut optimizer = Optimizer::new(settings.optimizer, &settings.optimizer_kwargs, dim);
    let mut scheduler = ReduceLrOnPlateau::new(settings.plateau_options());
    if !quiet {
        log::info!(
            "Optimizing {} parameters with {}({:?})",
            dim,
            optimizer.name(),
            optimizer.options()
        );
    }

    let lag_a = settings.lag_a.max(1);
    let pb = create_progress_bar(settings.maxiter, "Fitting", quiet);
    let mut history: Vec<f64> = Vec::new();
    let mut status = FitStatus::MaxIter;
    let mut grad = vec![0.; dim];

    for step in 0..settings.maxiter {
        if settings.interrupt.as_ref().is_some_and(InterruptFlag::take) {
            pb.finish_and_clear();
            if !quiet {
                log::info!(
                    "Interrupted: ELBO={:.5e}",
                    history.last().map_or(f64::NAN, |loss| -loss)
                );
            }
            if settings.catch_interrupt {
                status = FitStatus::Interrupted;
                break;
            }
            return Err(EstimationError::Interrupted {
                steps: history.len(),
            });
        }

        let params = store
            .get_mut(LOC)
            .ok_or(EstimationError::MissingParameter(LOC))?;
        let value = loss.evaluate(params, &mut grad)?;
        if value.is_nan() {
            pb.finish_and_clear();
            log::error!("ELBO NaN? Best ELBO={:.5e}", -scheduler.best());
            return Err(EstimationError::NanElbo {
                best: scheduler.best(),
                steps: history.len(),
            });
        }
        optimizer.step(params, &grad);

        let learning_rate = scheduler.step(value, optimizer.learning_rate());
        optimizer.set_learning_rate(learning_rate);
        history.push(value);
        pb.inc(1);

        if step % lag_a == 0 {
            pb.set_message(progress_message(&history, step, settings, learning_rate));
            if learning_rate < CONVERGED_LEARNING_RATE {
                pb.finish_and_clear();
                if !quiet {
                    log::info!("Converged: ELBO={:.5e}", -value);
                }
                status = FitStatus::Converged;
                break;
            }
        }
    }
    if status == FitStatus::MaxIter {
        pb.finish_and_clear();
        if !quiet {
            log::info!(
                "Reached maxiter={}: ELBO={:.5e}",
                settings.maxiter,
                history.last().map_or(f64::NAN, |loss| -loss)
            );
        }
    }

    let loc = store
        .remove(LOC)
        .ok_or(EstimationError::MissingParameter(LOC))?;
    let mut laplace = LaplaceApproximation::new(loc);
    let mut program = loss.into_program();
    let raw = posterior_estimate(&mut laplace, program.as_mut(), settings, &mut rng)?;

    let world = model.format_world(&raw)?;
    let history = FitHistory {
        losses: history,
        status,
        learning_rate: optimizer.learning_rate(),
    };
    Ok((world, history))
}

/// Mean of posterior predictive draws, or the prediction at the mode.
fn posterior_estimate<R: rand::RngCore>(
    laplace: &mut LaplaceApproximation,
    program: &mut dyn Program,
    settings: &EstimationSettings,
    rng: &mut R,
) -> Result<Values, EstimationError> {
    if settings.posterior_samples == 0 {
        return Ok(program.predict(laplace.loc(), rng)?);
    }

    laplace.fit_curvature(program)?;
    let mut position = vec![0.; laplace.dim()];
    let mut total = Values::new();
    for _ in 0..settings.posterior_samples {
        laplace.sample(rng, &mut position);
        for (name, draw) in program.predict(&position, rng)? {
            match total.get_mut(&name) {
                Some(acc) => *acc += &draw,
                None => {
                    total.insert(name, draw);
                }
            }
        }
    }
    let n = settings.posterior_samples as f64;
    total.values_mut().for_each(|acc| *acc /= n);
    Ok(total)
}
