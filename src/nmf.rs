//! Non-negative matrix factorization of metagenotype counts, used to warm
//! start a fit.

use ndarray::{Array2, Axis, Zip};
use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    data::{DataError, Metagenotype, World},
    labeled::{Coords, LabeledArray, LabeledError},
    model::seeded_rng,
};

const EPSILON: f64 = f64::EPSILON;

#[non_exhaustive]
#[derive(Error, Debug)]
pub enum NmfError {
    #[error("input matrix has negative entries")]
    Negative,
    #[error("number of components must be positive")]
    NoComponents,
    #[error("input matrix is empty")]
    Empty,
    #[error(transparent)]
    Data(#[from] DataError),
    #[error(transparent)]
    Labeled(#[from] LabeledError),
}

/// Which factor the elementwise penalty applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Regularization {
    Community,
    Genotype,
    #[default]
    Both,
}

/// Settings for [`nmf`]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NmfSettings {
    /// Overall penalty strength; zero disables regularization.
    pub alpha: f64,
    /// Share of the penalty that is L1 rather than L2.
    pub l1_ratio: f64,
    pub regularization: Regularization,
    /// Relative decrease in reconstruction error below which iteration stops.
    pub tol: f64,
    pub max_iter: usize,
    pub seed: Option<u64>,
}

impl Default for NmfSettings {
    fn default() -> Self {
        Self {
            alpha: 0.,
            l1_ratio: 1.,
            regularization: Regularization::default(),
            tol: 1e-3,
            max_iter: 10_000,
            seed: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NmfFactors {
    /// `[row, component]`
    pub w: Array2<f64>,
    /// `[component, column]`
    pub h: Array2<f64>,
    pub n_iter: usize,
}

fn reconstruction_error(x: &Array2<f64>, w: &Array2<f64>, h: &Array2<f64>) -> f64 {
    let approx = w.dot(h);
    x.iter()
        .zip(approx.iter())
        .map(|(a, b)| (a - b).powi(2))
        .sum::<f64>()
        .sqrt()
}

/// Factor `x ~ w h` with multiplicative updates.
pub fn nmf(x: &Array2<f64>, ncomponents: usize, settings: &NmfSettings) -> Result<NmfFactors, NmfError> {
    if ncomponents == 0 {
        return Err(NmfError::NoComponents);
    }
    if x.is_empty() {
        return Err(NmfError::Empty);
    }
    if x.iter().any(|&val| val < 0.) {
        return Err(NmfError::Negative);
    }
    let (nrows, ncols) = x.dim();

    let mut rng = seeded_rng(settings.seed, false);
    let scale = (x.mean().unwrap_or(0.) / ncomponents as f64).sqrt();
    let mut draw = || scale * rng.sample::<f64, _>(StandardNormal).abs();
    let mut w = Array2::from_shape_simple_fn((nrows, ncomponents), &mut draw);
    let mut h = Array2::from_shape_simple_fn((ncomponents, ncols), &mut draw);

    let (l1, l2) = (
        settings.alpha * settings.l1_ratio,
        settings.alpha * (1. - settings.l1_ratio),
    );
    let (l1_w, l2_w) = match settings.regularization {
        Regularization::Genotype | Regularization::Both => (l1, l2),
        Regularization::Community => (0., 0.),
    };
    let (l1_h, l2_h) = match settings.regularization {
        Regularization::Community | Regularization::Both => (l1, l2),
        Regularization::Genotype => (0., 0.),
    };

    let error_at_init = reconstruction_error(x, &w, &h);
    let mut previous_error = error_at_init;
    let mut n_iter = settings.max_iter;

    for iter in 1..=settings.max_iter {
        let numerator = x.dot(&h.t());
        let denominator = w.dot(&h.dot(&h.t()));
        Zip::from(&mut w)
            .and(&numerator)
            .and(&denominator)
            .for_each(|w, &num, &den| *w *= num / (den + l1_w + l2_w * *w + EPSILON));

        let numerator = w.t().dot(x);
        let denominator = w.t().dot(&w).dot(&h);
        Zip::from(&mut h)
            .and(&numerator)
            .and(&denominator)
            .for_each(|h, &num, &den| *h *= num / (den + l1_h + l2_h * *h + EPSILON));

        if iter % 10 == 0 {
            let error = reconstruction_error(x, &w, &h);
            if error_at_init > 0. && (previous_error - error) / error_at_init < settings.tol {
                n_iter = iter;
                break;
            }
            previous_error = error;
        }
    }
    log::debug!("NMF stopped after {} iterations.", n_iter);
    Ok(NmfFactors { w, h, n_iter })
}

/// Warm start estimates of genotype and community from an NMF of the
/// `[position x allele, sample]` count matrix.
///
/// Factors are rebalanced so that each strain's mean (alt + ref) loading
/// is 1, then genotypes are normalized over alleles (0.5 where a strain
/// has no loading at a position) and communities over strains.
pub fn nmf_approximation(
    metagenotype: &Metagenotype,
    nstrain: usize,
    settings: &NmfSettings,
) -> Result<World, NmfError> {
    let counts = metagenotype.data().values();
    let shape = counts.shape();
    let (nsample, nposition, nallele) = (shape[0], shape[1], shape[2]);

    let x = Array2::from_shape_fn((nposition * nallele, nsample), |(row, n)| {
        counts[[n, row / nallele, row % nallele]]
    });
    let NmfFactors { w, h, .. } = nmf(&x, nstrain, settings)?;

    // Mean over positions of the summed allele loadings.
    let factor: Vec<f64> = (0..nstrain)
        .map(|s| w.column(s).sum() / nposition.max(1) as f64)
        .collect();

    let alt = metagenotype.allele().position("alt").unwrap_or(0);
    let mut genotype = Array2::zeros((nstrain, nposition));
    for ((s, l), out) in genotype.indexed_iter_mut() {
        let total: f64 = (0..nallele).map(|k| w[[l * nallele + k, s]] / factor[s]).sum();
        let value = w[[l * nallele + alt, s]] / factor[s] / total;
        *out = if value.is_finite() { value } else { 0.5 };
    }

    let mut community = Array2::from_shape_fn((nsample, nstrain), |(n, s)| h[[s, n]] * factor[s]);
    for mut row in community.axis_iter_mut(Axis(0)) {
        let total = row.sum();
        if total > 0. && total.is_finite() {
            row /= total;
        } else {
            row.fill(1. / nstrain as f64);
        }
    }

    let strain = Coords::range(nstrain);
    let genotype = LabeledArray::new(
        ["strain", "position"],
        vec![strain.clone(), metagenotype.position().clone()],
        genotype.into_dyn(),
    )?;
    let community = LabeledArray::new(
        ["sample", "strain"],
        vec![metagenotype.sample().clone(), strain],
        community.into_dyn(),
    )?;
    Ok(metagenotype
        .to_world()
        .assign("genotype", genotype)
        .assign("community", community))
}
