//! Scores comparing a fitted world against observations or ground truth.
//!
//! Every metric returns its overall value together with the per-sample (or
//! per-strain) values it was aggregated from.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, Ix2};
use rayon::prelude::*;
use thiserror::Error;

use crate::data::{DataError, Metagenotype, World};

#[non_exhaustive]
#[derive(Error, Debug)]
pub enum EvaluationError {
    #[error("cannot compare {what}: {left} vs {right}")]
    Mismatch {
        what: &'static str,
        left: usize,
        right: usize,
    },
    #[error(transparent)]
    Data(#[from] DataError),
}

fn check_len(what: &'static str, left: usize, right: usize) -> Result<(), EvaluationError> {
    if left == right {
        Ok(())
    } else {
        Err(EvaluationError::Mismatch { what, left, right })
    }
}

/// The expected alt allele fraction per `[sample, position]`.
///
/// Worlds without a `mixture` variable (for example after chunked genotype
/// refinement) fall back to the noise-free mixture of community and genotype.
pub fn expected_alt_fraction(world: &World) -> Result<Array2<f64>, EvaluationError> {
    if let Ok(mixture) = world.get("mixture") {
        if let Ok(mixture) = mixture.values().view().into_dimensionality::<Ix2>() {
            return Ok(mixture.to_owned());
        }
    }
    let community = world.community()?;
    let genotype = world.genotype()?;
    Ok(community.values().dot(&genotype.values()))
}

/// Depth-weighted mean absolute difference between observed alt fractions
/// and the fit's expected alt fraction, overall and per sample.
pub fn metagenotype_error(
    fit: &World,
    observed: &Metagenotype,
) -> Result<(f64, Array1<f64>), EvaluationError> {
    let expected = expected_alt_fraction(fit)?;
    let total = observed.totals();
    let alt = observed.alt_counts();
    check_len("samples", expected.nrows(), total.nrows())?;
    check_len("positions", expected.ncols(), total.ncols())?;

    let mut per_sample = Array1::zeros(total.nrows());
    let (mut weighted, mut depth) = (0., 0.);
    for (n, out) in per_sample.iter_mut().enumerate() {
        let (mut sample_err, mut sample_depth) = (0., 0.);
        for l in 0..total.ncols() {
            let m = total[[n, l]];
            if m > 0. {
                sample_err += m * (alt[[n, l]] / m - expected[[n, l]]).abs();
                sample_depth += m;
            }
        }
        *out = if sample_depth > 0. {
            sample_err / sample_depth
        } else {
            f64::NAN
        };
        weighted += sample_err;
        depth += sample_depth;
    }
    Ok((weighted / depth, per_sample))
}

/// For every strain of `reference`, the smallest fraction of discretized
/// alleles that disagree with any strain of `other`; the overall value is
/// weighted by each reference strain's total abundance.
pub fn discretized_weighted_genotype_error(
    reference: &World,
    other: &World,
) -> Result<(f64, Array1<f64>), EvaluationError> {
    let reference_genotype = reference.genotype()?;
    let other_genotype = other.sel_positions(reference_genotype.position())?.genotype()?;
    let a = reference_genotype.discretized();
    let b = other_genotype.discretized();
    check_len("positions", a.ncols(), b.ncols())?;

    let npos = a.ncols().max(1) as f64;
    let per_strain: Array1<f64> = a
        .rows()
        .into_iter()
        .map(|row_a| {
            b.rows()
                .into_iter()
                .map(|row_b| {
                    row_a
                        .iter()
                        .zip(row_b.iter())
                        .filter(|(x, y)| x != y)
                        .count() as f64
                        / npos
                })
                .fold(f64::INFINITY, f64::min)
        })
        .collect();

    let abundance = reference.community()?.values().sum_axis(Axis(0));
    let total = abundance.sum();
    let error = if total > 0. {
        per_strain.dot(&abundance) / total
    } else {
        per_strain.mean().unwrap_or(f64::NAN)
    };
    Ok((error, per_strain))
}

fn pairwise<F>(n: usize, dist: F) -> Array2<f64>
where
    F: Fn(usize, usize) -> f64 + Sync,
{
    let rows: Vec<Vec<f64>> = (0..n)
        .into_par_iter()
        .map(|i| (0..n).map(|j| if i == j { 0. } else { dist(i, j) }).collect())
        .collect();
    Array2::from_shape_fn((n, n), |(i, j)| rows[i][j])
}

/// Mean absolute difference between two sample distance matrices, overall
/// (over distinct pairs) and per sample.
fn compare_distances(a: &Array2<f64>, b: &Array2<f64>) -> (f64, Array1<f64>) {
    let n = a.nrows();
    let diff = (a - b).mapv(f64::abs);
    let per_sample = if n > 1 {
        diff.sum_axis(Axis(1)) / (n - 1) as f64
    } else {
        Array1::zeros(n)
    };
    let npairs = n * n.saturating_sub(1) / 2;
    let overall = if npairs > 0 {
        diff.sum() / 2. / npairs as f64
    } else {
        0.
    };
    (overall, per_sample)
}

fn braycurtis(u: ArrayView1<'_, f64>, v: ArrayView1<'_, f64>) -> f64 {
    let num: f64 = u.iter().zip(v.iter()).map(|(a, b)| (a - b).abs()).sum();
    let den: f64 = u.iter().zip(v.iter()).map(|(a, b)| (a + b).abs()).sum();
    if den > 0. {
        num / den
    } else {
        0.
    }
}

fn braycurtis_matrix(community: ArrayView2<'_, f64>) -> Array2<f64> {
    pairwise(community.nrows(), |i, j| {
        braycurtis(community.row(i), community.row(j))
    })
}

/// Disagreement between the Bray-Curtis sample dissimilarities of two
/// worlds' communities.
pub fn braycurtis_error(sim: &World, fit: &World) -> Result<(f64, Array1<f64>), EvaluationError> {
    let sim_community = sim.community()?;
    let fit_community = fit.community()?;
    check_len(
        "samples",
        sim_community.values().nrows(),
        fit_community.values().nrows(),
    )?;
    Ok(compare_distances(
        &braycurtis_matrix(sim_community.values()),
        &braycurtis_matrix(fit_community.values()),
    ))
}

/// Branches of a UPGMA tree as `(length, leaves below)`.
fn upgma_branches(dist: &Array2<f64>) -> Vec<(f64, Vec<usize>)> {
    struct Cluster {
        leaves: Vec<usize>,
        height: f64,
    }

    let n = dist.nrows();
    let mut clusters: Vec<Cluster> = (0..n)
        .map(|i| Cluster {
            leaves: vec![i],
            height: 0.,
        })
        .collect();
    let mut active: Vec<usize> = (0..n).collect();
    let mut branches = Vec::with_capacity(2 * n);

    let average = |a: &Cluster, b: &Cluster| {
        let sum: f64 = a
            .leaves
            .iter()
            .flat_map(|&i| b.leaves.iter().map(move |&j| dist[[i, j]]))
            .sum();
        sum / (a.leaves.len() * b.leaves.len()) as f64
    };

    while active.len() > 1 {
        let mut best = (f64::INFINITY, 0, 1);
        for (x, &i) in active.iter().enumerate() {
            for (y, &j) in active.iter().enumerate().skip(x + 1) {
                let d = average(&clusters[i], &clusters[j]);
                if d < best.0 {
                    best = (d, x, y);
                }
            }
        }
        let (d, x, y) = best;
        let (i, j) = (active[x], active[y]);
        let height = (d / 2.).max(clusters[i].height).max(clusters[j].height);
        for &child in &[i, j] {
            branches.push((height - clusters[child].height, clusters[child].leaves.clone()));
        }
        let mut leaves = clusters[i].leaves.clone();
        leaves.extend(clusters[j].leaves.iter().copied());
        clusters.push(Cluster { leaves, height });
        active.remove(y);
        active.remove(x);
        active.push(clusters.len() - 1);
    }
    branches
}

fn genotype_distance(genotype: ArrayView2<'_, f64>) -> Array2<f64> {
    let npos = genotype.ncols().max(1) as f64;
    pairwise(genotype.nrows(), |i, j| {
        genotype
            .row(i)
            .iter()
            .zip(genotype.row(j).iter())
            .map(|(a, b)| (a - b).abs())
            .sum::<f64>()
            / npos
    })
}

fn unifrac_matrix(world: &World) -> Result<Array2<f64>, EvaluationError> {
    let genotype = world.genotype()?;
    let community = world.community()?;
    let branches = upgma_branches(&genotype_distance(genotype.values()));
    let community = community.values();
    Ok(pairwise(community.nrows(), |i, j| {
        branches
            .iter()
            .map(|(length, leaves)| {
                let below_i: f64 = leaves.iter().map(|&s| community[[i, s]]).sum();
                let below_j: f64 = leaves.iter().map(|&s| community[[j, s]]).sum();
                length * (below_i - below_j).abs()
            })
            .sum()
    }))
}

/// Disagreement between the weighted UniFrac sample distances of two
/// worlds, each over a UPGMA tree of its own strain genotypes.
pub fn unifrac_error(sim: &World, fit: &World) -> Result<(f64, Array1<f64>), EvaluationError> {
    let a = unifrac_matrix(sim)?;
    let b = unifrac_matrix(fit)?;
    check_len("samples", a.nrows(), b.nrows())?;
    Ok(compare_distances(&a, &b))
}

fn entropy(p: ArrayView1<'_, f64>) -> f64 {
    -p.iter().filter(|&&x| x > 0.).map(|&x| x * x.ln()).sum::<f64>()
}

/// Per-sample absolute difference in community Shannon entropy.
pub fn community_entropy_error(
    sim: &World,
    fit: &World,
) -> Result<(f64, Array1<f64>), EvaluationError> {
    let sim_community = sim.community()?;
    let fit_community = fit.community()?;
    let a = sim_community.values();
    let b = fit_community.values();
    check_len("samples", a.nrows(), b.nrows())?;
    let per_sample: Array1<f64> = a
        .rows()
        .into_iter()
        .zip(b.rows())
        .map(|(x, y)| (entropy(x) - entropy(y)).abs())
        .collect();
    Ok((per_sample.mean().unwrap_or(f64::NAN), per_sample))
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::labeled::{Coords, LabeledArray};

    fn world(genotype: Array2<f64>, community: Array2<f64>) -> World {
        let strain = Coords::range(genotype.nrows());
        let genotype = LabeledArray::new(
            ["strain", "position"],
            vec![strain.clone(), Coords::range(genotype.ncols())],
            genotype.into_dyn(),
        )
        .unwrap();
        let community = LabeledArray::new(
            ["sample", "strain"],
            vec![Coords::range(community.nrows()), strain],
            community.into_dyn(),
        )
        .unwrap();
        World::default()
            .assign("genotype", genotype)
            .assign("community", community)
    }

    fn truth() -> World {
        world(
            array![[1., 1., 0., 0.], [0., 1., 1., 0.], [0., 0., 0., 1.]],
            array![[0.5, 0.5, 0.], [0.1, 0.2, 0.7], [0., 0., 1.]],
        )
    }

    #[test]
    fn identical_worlds_score_zero() {
        let sim = truth();
        let fit = truth();
        assert_eq!(discretized_weighted_genotype_error(&sim, &fit).unwrap().0, 0.);
        assert_eq!(braycurtis_error(&sim, &fit).unwrap().0, 0.);
        assert_abs_diff_eq!(unifrac_error(&sim, &fit).unwrap().0, 0.);
        assert_eq!(community_entropy_error(&sim, &fit).unwrap().0, 0.);
    }

    #[test]
    fn genotype_error_weights_by_abundance() {
        let sim = truth();
        // Strain 2 has one of four alleles flipped.
        let fit = world(
            array![[1., 1., 0., 0.], [0., 1., 1., 0.], [0., 0., 1., 1.]],
            array![[0.5, 0.5, 0.], [0.1, 0.2, 0.7], [0., 0., 1.]],
        );
        let (error, per_strain) = discretized_weighted_genotype_error(&sim, &fit).unwrap();
        assert_eq!(per_strain, array![0., 0., 0.25]);
        assert_abs_diff_eq!(error, 0.25 * 1.7 / 3., epsilon = 1e-12);
    }

    #[test]
    fn metagenotype_error_is_depth_weighted() {
        let fit = world(array![[1., 0.]], array![[1.], [1.]]);
        let alt = array![[10., 0.], [1., 0.]];
        let total = array![[10., 10.], [2., 0.]];
        let mgen =
            Metagenotype::from_counts(&alt, &total, Coords::range(2), Coords::range(2)).unwrap();
        let (error, per_sample) = metagenotype_error(&fit, &mgen).unwrap();
        assert_eq!(per_sample, array![0., 0.5]);
        assert_abs_diff_eq!(error, 1. / 22., epsilon = 1e-12);
    }

    #[test]
    fn upgma_tree_spans_all_leaves() {
        let dist = array![[0., 2., 6.], [2., 0., 6.], [6., 6., 0.]];
        let branches = upgma_branches(&dist);
        assert_eq!(branches.len(), 4);
        assert_eq!(branches[0], (1., vec![0]));
        assert_eq!(branches[1], (1., vec![1]));
        assert_eq!(branches[2], (3., vec![2]));
        assert_eq!(branches[3], (2., vec![0, 1]));
    }

    #[test]
    fn entropy_of_even_split() {
        let sim = world(array![[1.], [0.]], array![[0.5, 0.5]]);
        let fit = world(array![[1.], [0.]], array![[1., 0.]]);
        let (error, _) = community_entropy_error(&sim, &fit).unwrap();
        assert_abs_diff_eq!(error, 2f64.ln(), epsilon = 1e-12);
        let (bc, _) = braycurtis_error(&sim, &fit).unwrap();
        assert_eq!(bc, 0.);
    }
}
