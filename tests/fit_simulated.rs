use std::collections::BTreeMap;

use anyhow::Result;
use approx::assert_abs_diff_eq;
use strainfacts::{
    evaluate_fit_against_simulation, fit_metagenotype,
    iteratively_fit_genotype_conditioned_on_community, simulate_world, Data, DType, Device,
    EstimationSettings, FitOptions, FitStatus, NmfSettings, SimulationSizes, World, SIMPLE,
};

const SIZES: SimulationSizes = SimulationSizes {
    strain: 3,
    sample: 5,
    position: 50,
};

fn simulate() -> Result<World> {
    let _ = env_logger::builder().is_test(true).try_init();
    let hyperparameters = BTreeMap::from([("mu_depth".to_string(), 400.)]);
    let (_, world) = simulate_world(
        SIMPLE,
        SIZES,
        hyperparameters,
        Some(0),
        Data::new(),
        DType::Float64,
        Device::Cpu,
        true,
    )?;
    Ok(world)
}

fn options() -> FitOptions {
    FitOptions {
        dtype: DType::Float64,
        quiet: true,
        estimation: EstimationSettings {
            maxiter: 20000,
            patience: 50,
            cooldown: 50,
            seed: Some(0),
            ..Default::default()
        },
        ..Default::default()
    }
}

#[test]
fn fit_recovers_simulated_metagenotype() -> Result<()> {
    let sim = simulate()?;
    let metagenotype = sim.metagenotype()?;
    assert_eq!(metagenotype.position().len(), SIZES.position);

    let options = FitOptions {
        nmf_init: Some(NmfSettings {
            seed: Some(0),
            ..Default::default()
        }),
        ..options()
    };
    let fit = fit_metagenotype(SIMPLE, &metagenotype, SIZES.strain, &options)?;
    assert!(!fit.history.is_empty());
    assert!(fit.history.losses.iter().all(|loss| loss.is_finite()));
    assert_eq!(fit.history.status, FitStatus::Converged);
    assert!(fit.history.learning_rate < 1e-6);
    assert!(fit.history.len() < 20000);

    let scores = evaluate_fit_against_simulation(&sim, &fit.world)?;
    for key in [
        "mgen_error",
        "fwd_genotype_error",
        "rev_genotype_error",
        "bc_error",
        "unifrac_error",
        "entropy_error",
    ] {
        let score = scores[key];
        assert!(score.is_finite() && score >= 0., "{} = {}", key, score);
    }
    assert!(scores["mgen_error"] < 0.05, "{:?}", scores);
    Ok(())
}

#[test]
fn chunked_fit_reassembles_positions() -> Result<()> {
    let sim = simulate()?;
    let metagenotype = sim.metagenotype()?;
    let community = sim.community()?;

    let options = FitOptions {
        estimation: EstimationSettings {
            maxiter: 5000,
            ..options().estimation
        },
        ..options()
    };
    let fit = iteratively_fit_genotype_conditioned_on_community(
        SIMPLE,
        &metagenotype,
        &community,
        20,
        &options,
    )?;
    assert_eq!(fit.chunk_worlds.len(), 3);
    assert_eq!(fit.histories.len(), 3);
    for history in &fit.histories {
        assert!(history.losses.iter().all(|loss| loss.is_finite()));
    }

    let genotype = fit.world.genotype()?;
    assert_eq!(genotype.position(), metagenotype.position());
    assert_eq!(genotype.strain(), community.strain());
    assert!(genotype.values().iter().all(|g| (0. ..=1.).contains(g)));

    let fitted_community = fit.world.community()?;
    for (a, b) in fitted_community.values().iter().zip(community.values().iter()) {
        assert_abs_diff_eq!(a, b, epsilon = 1e-9);
    }
    assert_eq!(fit.world.metagenotype()?.position(), metagenotype.position());

    let scores = evaluate_fit_against_simulation(&sim, &fit.world)?;
    assert!(scores["mgen_error"] < 0.05, "{:?}", scores);
    Ok(())
}
