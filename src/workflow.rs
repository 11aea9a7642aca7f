//! End-to-end fitting procedures built from models, estimation and
//! evaluation.

use std::{collections::BTreeMap, time::Instant};

use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};

use crate::{
    data::{Community, Genotype, Metagenotype, World, ALLELES},
    estimation::{estimate_parameters, EstimationSettings, FitHistory},
    evaluation::{
        braycurtis_error, community_entropy_error, discretized_weighted_genotype_error,
        metagenotype_error, unifrac_error,
    },
    labeled::Coords,
    model::ParameterizedModel,
    nmf::{nmf_approximation, NmfSettings},
    structure::{DType, Data, Device, Hyperparameters, Structure, Values},
};

/// Logs the start and (on drop) the end of a workflow phase.
struct Phase {
    name: String,
    start: Instant,
    quiet: bool,
}

impl Phase {
    fn start(name: impl Into<String>, quiet: bool) -> Self {
        let name = name.into();
        if !quiet {
            log::info!("START: {}", name);
        }
        Self {
            name,
            start: Instant::now(),
            quiet,
        }
    }
}

impl Drop for Phase {
    fn drop(&mut self) {
        if !self.quiet {
            log::info!(
                "END: {} ({:.2}s)",
                self.name,
                self.start.elapsed().as_secs_f64()
            );
        }
    }
}

/// Half-open `[start, end)` ranges of `per` items covering `0..total`; the
/// last range holds the remainder.
///
/// # Panics
///
/// If `per` is zero.
pub fn chunk_start_end_iterator(total: usize, per: usize) -> impl Iterator<Item = (usize, usize)> {
    assert!(per > 0, "chunk size must be positive");
    let full = total / per;
    let remainder = (full * per < total).then_some((full * per, total));
    (0..full)
        .map(move |i| (per * i, per * (i + 1)))
        .chain(remainder)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulationSizes {
    pub strain: usize,
    pub sample: usize,
    pub position: usize,
}

/// Draw one world from `structure` with alleles labeled `[alt, ref]`.
#[allow(clippy::too_many_arguments)]
pub fn simulate_world(
    structure: Structure,
    sizes: SimulationSizes,
    hyperparameters: Hyperparameters,
    seed: Option<u64>,
    data: Data,
    dtype: DType,
    device: Device,
    quiet: bool,
) -> Result<(ParameterizedModel, World)> {
    let coords = BTreeMap::from([
        ("strain".to_string(), Coords::range(sizes.strain)),
        ("sample".to_string(), Coords::range(sizes.sample)),
        ("position".to_string(), Coords::range(sizes.position)),
        ("allele".to_string(), Coords::from(ALLELES)),
    ]);
    let model = ParameterizedModel::new(structure, coords)?
        .with_hyperparameters(hyperparameters)
        .with_dtype(dtype)
        .with_device(device)
        .condition(data);
    let world = model
        .simulate_world(seed, quiet)
        .context("Failed to simulate a world")?;
    Ok((model, world))
}

/// Options shared by the fitting workflows.
#[derive(Debug, Clone, Default)]
pub struct FitOptions {
    /// Overrides of the structure's default hyperparameters.
    pub hyperparameters: Hyperparameters,
    /// Extra fixed data besides the observed counts.
    pub condition_on: Data,
    pub dtype: DType,
    pub device: Device,
    pub quiet: bool,
    /// Warm start from an NMF approximation when set.
    pub nmf_init: Option<NmfSettings>,
    pub estimation: EstimationSettings,
}

impl FitOptions {
    fn estimation_settings(&self) -> EstimationSettings {
        EstimationSettings {
            quiet: self.quiet || self.estimation.quiet,
            ..self.estimation.clone()
        }
    }
}

#[derive(Debug, Clone)]
pub struct Fit {
    pub world: World,
    pub history: FitHistory,
}

#[derive(Debug, Clone)]
pub struct ChunkedFit {
    /// Concatenated genotype, fixed community and the full metagenotype.
    pub world: World,
    pub chunk_worlds: Vec<World>,
    pub histories: Vec<FitHistory>,
}

/// Fit `nstrain` strains to an observed metagenotype in one pass.
pub fn fit_metagenotype(
    structure: Structure,
    metagenotype: &Metagenotype,
    nstrain: usize,
    options: &FitOptions,
) -> Result<Fit> {
    ensure!(nstrain > 0, "number of strains must be positive");
    let quiet = options.quiet;
    let _phase = Phase::start(
        format!(
            "Fitting {} strains with data shape {:?}",
            nstrain,
            metagenotype.sizes()
        ),
        quiet,
    );

    let init = match &options.nmf_init {
        Some(settings) => {
            let _phase = Phase::start("Initializing with NMF", quiet);
            if !quiet {
                log::info!("(This may take a while if data dimensions are large.)");
            }
            let approx = nmf_approximation(metagenotype, nstrain, settings)
                .context("NMF initialization failed")?;
            Values::from([
                (
                    "genotype".to_string(),
                    approx.genotype()?.data().values().clone(),
                ),
                (
                    "community".to_string(),
                    approx.community()?.data().values().clone(),
                ),
            ])
        }
        None => Values::new(),
    };

    let (world, history) = {
        let _phase = Phase::start("Fitting model parameters", quiet);
        let coords = BTreeMap::from([
            ("sample".to_string(), metagenotype.sample().clone()),
            ("position".to_string(), metagenotype.position().clone()),
            ("allele".to_string(), metagenotype.allele().clone()),
            ("strain".to_string(), Coords::range(nstrain)),
        ]);
        let model = ParameterizedModel::new(structure, coords)?
            .with_hyperparameters(options.hyperparameters.clone())
            .with_dtype(options.dtype)
            .with_device(options.device)
            .condition(options.condition_on.clone())
            .condition(metagenotype.to_counts_and_totals());
        estimate_parameters(&model, &init, &options.estimation_settings())
            .context("Failed to estimate model parameters")?
    };

    if !quiet {
        let (error, _) = metagenotype_error(&world, metagenotype)?;
        log::info!("Average metagenotype error: {}", error);
    }
    Ok(Fit { world, history })
}

/// Refit genotypes chunk by chunk along `position`, holding the community
/// fixed, and reassemble the full-length genotype.
pub fn iteratively_fit_genotype_conditioned_on_community(
    structure: Structure,
    metagenotype: &Metagenotype,
    community: &Community,
    nposition: usize,
    options: &FitOptions,
) -> Result<ChunkedFit> {
    let quiet = options.quiet;
    let nposition_full = metagenotype.position().len();
    ensure!(nposition > 0, "positions per chunk must be positive");
    ensure!(nposition_full > 0, "metagenotype has no positions");

    let _phase = Phase::start(format!("Fitting genotypes for {} positions", nposition_full), quiet);
    if !quiet {
        log::info!(
            "Conditioned on provided communities with {} strains and {} samples.",
            community.strain().len(),
            community.sample().len()
        );
    }
    let nposition = nposition.min(nposition_full);
    let metagenotype = Metagenotype::new(metagenotype.data().sel("sample", community.sample())?)
        .context("Metagenotype samples do not match the community")?;

    let coords = BTreeMap::from([
        ("sample".to_string(), community.sample().clone()),
        ("position".to_string(), Coords::range(nposition)),
        ("allele".to_string(), metagenotype.allele().clone()),
        ("strain".to_string(), community.strain().clone()),
    ]);
    let base = ParameterizedModel::new(structure, coords)?
        .with_hyperparameters(options.hyperparameters.clone())
        .with_dtype(options.dtype)
        .with_device(options.device)
        .condition(options.condition_on.clone())
        .condition(Data::from([(
            "community".to_string(),
            community.data().values().clone(),
        )]));
    let settings = options.estimation_settings();

    if !quiet {
        log::info!("Iteratively fitting genotypes by chunks.");
    }
    let mut genotype_chunks = Vec::new();
    let mut chunk_worlds = Vec::new();
    let mut histories = Vec::new();
    for (start, end) in chunk_start_end_iterator(nposition_full, nposition) {
        let _phase = Phase::start(format!("Chunk [{}, {})", start, end), quiet);
        let chunk = metagenotype.isel_positions(start..end)?;
        let model = base
            .with_amended_coords(BTreeMap::from([(
                "position".to_string(),
                chunk.position().clone(),
            )]))
            .condition(chunk.to_counts_and_totals());
        let (world, history) = estimate_parameters(&model, &Values::new(), &settings)
            .with_context(|| format!("Failed to fit chunk [{}, {})", start, end))?;
        genotype_chunks.push(world.genotype()?);
        chunk_worlds.push(world);
        histories.push(history);
    }

    let world = {
        let _phase = Phase::start("Concatenating chunks", quiet);
        let genotype = Genotype::concat_positions(&genotype_chunks)?;
        let last = chunk_worlds
            .last()
            .context("No chunks were fit")?;
        last.drop_dims(&["position", "allele"])
            .assign("genotype", genotype.data().clone())
            .assign("metagenotype", metagenotype.data().clone())
    };
    Ok(ChunkedFit {
        world,
        chunk_worlds,
        histories,
    })
}

/// Score a fit against the simulated world it was fit to, restricted to the
/// samples and positions that were fit.
pub fn evaluate_fit_against_simulation(sim: &World, fit: &World) -> Result<BTreeMap<String, f64>> {
    let observed = fit.metagenotype()?;
    let sim = sim
        .sel_positions(observed.position())?
        .sel_samples(observed.sample())
        .context("Simulation does not cover the fitted samples and positions")?;

    Ok(BTreeMap::from([
        ("mgen_error".to_string(), metagenotype_error(fit, &observed)?.0),
        (
            "fwd_genotype_error".to_string(),
            discretized_weighted_genotype_error(&sim, fit)?.0,
        ),
        (
            "rev_genotype_error".to_string(),
            discretized_weighted_genotype_error(fit, &sim)?.0,
        ),
        ("bc_error".to_string(), braycurtis_error(&sim, fit)?.0),
        ("unifrac_error".to_string(), unifrac_error(&sim, fit)?.0),
        ("entropy_error".to_string(), community_entropy_error(&sim, fit)?.0),
    ]))
}
