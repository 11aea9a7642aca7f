//! Concrete generative models of metagenotype counts.

use ndarray::{Array2, Array3, ArrayD, Ix2};
use rand::{Rng, RngCore};
use rand_distr::{Beta, Binomial, Distribution, Gamma, Poisson};
use statrs::function::{beta::ln_beta, factorial::ln_binomial, gamma::ln_gamma};

use crate::{
    data::{ALT_COUNT, TOTAL_COUNT},
    math::{ln_sigmoid, log_softmax, logit, sigmoid},
    structure::{Data, Hyperparameters, ModelError, Program, Structure, Unit, Values},
};

const DIMS: &[&str] = &["strain", "sample", "position", "allele"];
const STRAIN_POSITION: &[&str] = &["strain", "position"];
const SAMPLE_STRAIN: &[&str] = &["sample", "strain"];
const SAMPLE_POSITION: &[&str] = &["sample", "position"];
const SAMPLE_POSITION_ALLELE: &[&str] = &["sample", "position", "allele"];

const DESCRIPTION: &[(&str, &[&str])] = &[
    ("genotype", STRAIN_POSITION),
    ("community", SAMPLE_STRAIN),
    ("mixture", SAMPLE_POSITION),
    (TOTAL_COUNT, SAMPLE_POSITION),
    (ALT_COUNT, SAMPLE_POSITION),
    ("metagenotype", SAMPLE_POSITION_ALLELE),
];

const DEFAULT_HYPERPARAMETERS: &[(&str, f64)] = &[
    ("gamma_hyper", 0.5),
    ("pi_hyper", 0.5),
    ("epsilon", 0.01),
    ("mu_depth", 10.),
];

/// Strains with relaxed (Beta) genotypes mixed by Dirichlet community
/// proportions; alt counts are binomial given sequencing depth and a
/// symmetric sequencing error rate.
///
/// ```text
/// genotype[strain, position]   ~ Beta(gamma_hyper, gamma_hyper)
/// community[sample, :]         ~ Dirichlet(pi_hyper)
/// mixture                      = epsilon + (1 - 2 epsilon) * community @ genotype
/// total_count[sample, position] ~ Poisson(mu_depth)
/// alt_count                    ~ Binomial(total_count, mixture)
/// ```
pub static SIMPLE: Structure =
    Structure::new("simple", simple, DIMS, DESCRIPTION, DEFAULT_HYPERPARAMETERS);

fn hyperparameter(
    hyperparameters: &Hyperparameters,
    name: &'static str,
    unit: Unit,
    valid: impl Fn(f64) -> bool,
) -> Result<f64, ModelError> {
    let value = *hyperparameters
        .get(name)
        .ok_or(ModelError::MissingHyperparameter(name))?;
    let value = unit.cast(value);
    if valid(value) {
        Ok(value)
    } else {
        Err(ModelError::InvalidHyperparameter { name, value })
    }
}

fn matrix(name: &str, values: ArrayD<f64>, expected: [usize; 2]) -> Result<Array2<f64>, ModelError> {
    if values.shape() != expected {
        return Err(ModelError::DataShape {
            name: name.to_string(),
            expected: expected.to_vec(),
            found: values.shape().to_vec(),
        });
    }
    Ok(values
        .into_dimensionality::<Ix2>()
        .expect("shape checked above"))
}

#[inline]
fn xlogy(x: f64, y: f64) -> f64 {
    if x == 0. {
        0.
    } else {
        x * y.ln()
    }
}

fn simple(
    shape: &[usize],
    hyperparameters: &Hyperparameters,
    data: Data,
    unit: Unit,
) -> Result<Box<dyn Program>, ModelError> {
    let &[nstrain, nsample, nposition, nallele] = shape else {
        return Err(ModelError::ShapeMismatch {
            expected: DIMS.len(),
            found: shape.len(),
        });
    };
    if nallele != 2 {
        return Err(ModelError::AlleleDimension(nallele));
    }
    if nstrain == 0 {
        return Err(ModelError::EmptyDimension("strain"));
    }

    let gamma_hyper = hyperparameter(hyperparameters, "gamma_hyper", unit, |v| v > 0.)?;
    let pi_hyper = hyperparameter(hyperparameters, "pi_hyper", unit, |v| v > 0.)?;
    let epsilon = hyperparameter(hyperparameters, "epsilon", unit, |v| (0. ..0.5).contains(&v))?;
    let mu_depth = hyperparameter(hyperparameters, "mu_depth", unit, |v| v > 0.)?;

    let mut program = SimpleProgram {
        nstrain,
        nsample,
        nposition,
        gamma_hyper,
        pi_hyper,
        epsilon,
        mu_depth,
        genotype: None,
        community: None,
        total: None,
        alt: None,
        log_binom: 0.,
    };

    for (name, values) in data {
        match name.as_str() {
            "genotype" => {
                program.genotype = Some(matrix(&name, values, [nstrain, nposition])?);
            }
            "community" => {
                program.community = Some(matrix(&name, values, [nsample, nstrain])?);
            }
            TOTAL_COUNT => {
                program.total = Some(matrix(&name, values, [nsample, nposition])?);
            }
            ALT_COUNT => {
                program.alt = Some(matrix(&name, values, [nsample, nposition])?);
            }
            _ => return Err(ModelError::UnknownVariable(name)),
        }
    }

    if let (Some(total), Some(alt)) = (&program.total, &program.alt) {
        let mut log_binom = 0.;
        for (&m, &y) in total.iter().zip(alt.iter()) {
            if !(y >= 0. && m >= y && y.fract() == 0. && m.fract() == 0.) {
                return Err(ModelError::InvalidCounts(format!("alt={} total={}", y, m)));
            }
            log_binom += ln_binomial(m as u64, y as u64);
        }
        program.log_binom = log_binom;
    }

    Ok(Box::new(program))
}

struct SimpleProgram {
    nstrain: usize,
    nsample: usize,
    nposition: usize,
    gamma_hyper: f64,
    pi_hyper: f64,
    epsilon: f64,
    mu_depth: f64,
    genotype: Option<Array2<f64>>,
    community: Option<Array2<f64>>,
    total: Option<Array2<f64>>,
    alt: Option<Array2<f64>>,
    log_binom: f64,
}

impl SimpleProgram {
    fn genotype_len(&self) -> usize {
        match self.genotype {
            Some(_) => 0,
            None => self.nstrain * self.nposition,
        }
    }

    fn community_len(&self) -> usize {
        match self.community {
            Some(_) => 0,
            None => self.nsample * self.nstrain.saturating_sub(1),
        }
    }

    fn check_position(&self, position: &[f64]) -> Result<(), ModelError> {
        if position.len() != self.dim() {
            return Err(ModelError::PositionLength {
                expected: self.dim(),
                found: position.len(),
            });
        }
        Ok(())
    }

    fn genotype_at(&self, position: &[f64]) -> Array2<f64> {
        match &self.genotype {
            Some(genotype) => genotype.clone(),
            None => {
                let logits = &position[..self.genotype_len()];
                Array2::from_shape_fn((self.nstrain, self.nposition), |(s, l)| {
                    sigmoid(logits[s * self.nposition + l])
                })
            }
        }
    }

    /// Per-sample log proportions, with the last strain as the reference
    /// coordinate of the additive log-ratio transform.
    fn log_community_at(&self, position: &[f64]) -> Array2<f64> {
        match &self.community {
            Some(community) => community.mapv(f64::ln),
            None => {
                let free = self.nstrain - 1;
                let ratios = &position[self.genotype_len()..];
                let mut out = Array2::zeros((self.nsample, self.nstrain));
                let mut logits = vec![0.; self.nstrain];
                let mut log_pi = vec![0.; self.nstrain];
                for (n, mut row) in out.rows_mut().into_iter().enumerate() {
                    logits[..free].copy_from_slice(&ratios[n * free..(n + 1) * free]);
                    logits[free] = 0.;
                    log_softmax(&logits, &mut log_pi);
                    row.iter_mut().zip(&log_pi).for_each(|(out, &v)| *out = v);
                }
                out
            }
        }
    }

    fn mixture(&self, genotype: &Array2<f64>, community: &Array2<f64>) -> Array2<f64> {
        let scale = 1. - 2. * self.epsilon;
        community.dot(genotype).mapv(|p| self.epsilon + scale * p)
    }

    fn draw_observables(
        &self,
        genotype: Array2<f64>,
        community: Array2<f64>,
        rng: &mut dyn RngCore,
    ) -> Result<Values, ModelError> {
        let mixture = self.mixture(&genotype, &community);

        let total = match &self.total {
            Some(total) => total.clone(),
            None => {
                let depth = Poisson::new(self.mu_depth)
                    .map_err(|err| ModelError::Distribution(err.to_string()))?;
                Array2::from_shape_simple_fn((self.nsample, self.nposition), || {
                    depth.sample(rng)
                })
            }
        };

        let alt = match &self.alt {
            Some(alt) => alt.clone(),
            None => {
                let mut alt = Array2::zeros((self.nsample, self.nposition));
                for ((out, &m), &q) in alt.iter_mut().zip(total.iter()).zip(mixture.iter()) {
                    let draw = Binomial::new(m as u64, q)
                        .map_err(|err| ModelError::Distribution(err.to_string()))?;
                    *out = draw.sample(rng) as f64;
                }
                alt
            }
        };

        let metagenotype = Array3::from_shape_fn((self.nsample, self.nposition, 2), |(n, l, k)| {
            if k == 0 {
                alt[[n, l]]
            } else {
                total[[n, l]] - alt[[n, l]]
            }
        });

        let mut out = Values::new();
        out.insert("genotype".to_string(), genotype.into_dyn());
        out.insert("community".to_string(), community.into_dyn());
        out.insert("mixture".to_string(), mixture.into_dyn());
        out.insert(TOTAL_COUNT.to_string(), total.into_dyn());
        out.insert(ALT_COUNT.to_string(), alt.into_dyn());
        out.insert("metagenotype".to_string(), metagenotype.into_dyn());
        Ok(out)
    }
}

impl Program for SimpleProgram {
    fn dim(&self) -> usize {
        self.genotype_len() + self.community_len()
    }

    fn latent_names(&self) -> Vec<&'static str> {
        let mut names = vec![];
        if self.genotype.is_none() {
            names.push("genotype");
        }
        if self.community.is_none() {
            names.push("community");
        }
        names
    }

    fn init_position(
        &self,
        init: &Values,
        rng: &mut dyn RngCore,
        position: &mut [f64],
    ) -> Result<(), ModelError> {
        self.check_position(position)?;
        position
            .iter_mut()
            .for_each(|x| *x = -2. + 4. * rng.random::<f64>());

        let (genotype_part, community_part) = position.split_at_mut(self.genotype_len());

        if self.genotype.is_none() {
            if let Some(values) = init.get("genotype") {
                let values = matrix("genotype", values.clone(), [self.nstrain, self.nposition])?;
                genotype_part
                    .iter_mut()
                    .zip(values.iter())
                    .for_each(|(out, &g)| *out = logit(g.clamp(1e-4, 1. - 1e-4)));
            }
        }

        if self.community.is_none() && self.nstrain > 1 {
            if let Some(values) = init.get("community") {
                let values = matrix("community", values.clone(), [self.nsample, self.nstrain])?;
                let free = self.nstrain - 1;
                for (n, row) in values.rows().into_iter().enumerate() {
                    let reference = row[free].max(1e-6).ln();
                    community_part[n * free..(n + 1) * free]
                        .iter_mut()
                        .zip(row.iter())
                        .for_each(|(out, &pi)| *out = pi.max(1e-6).ln() - reference);
                }
            }
        }
        Ok(())
    }

    fn logp(&mut self, position: &[f64], gradient: &mut [f64]) -> Result<f64, ModelError> {
        self.check_position(position)?;
        assert!(gradient.len() == position.len());
        let total = self
            .total
            .as_ref()
            .ok_or(ModelError::MissingObservation(TOTAL_COUNT))?;
        let alt = self
            .alt
            .as_ref()
            .ok_or(ModelError::MissingObservation(ALT_COUNT))?;

        let genotype = self.genotype_at(position);
        let log_community = self.log_community_at(position);
        let community = log_community.mapv(f64::exp);
        let mixture = self.mixture(&genotype, &community);
        let scale = 1. - 2. * self.epsilon;

        let mut logp = self.log_binom;

        // Derivative of the likelihood with respect to the mixed alt fraction.
        let mut dmixture = Array2::zeros(mixture.raw_dim());
        for (((d, &q), &m), &y) in dmixture
            .iter_mut()
            .zip(mixture.iter())
            .zip(total.iter())
            .zip(alt.iter())
        {
            if m == 0. {
                continue;
            }
            logp += xlogy(y, q) + xlogy(m - y, 1. - q);
            *d = scale * (y / q - (m - y) / (1. - q));
        }

        gradient.fill(0.);
        let (genotype_grad, community_grad) = gradient.split_at_mut(self.genotype_len());

        if self.genotype.is_none() {
            let a = self.gamma_hyper;
            let norm = ln_beta(a, a);
            let through_mixture = community.t().dot(&dmixture);
            for (((grad, &u), &g), &dl) in genotype_grad
                .iter_mut()
                .zip(&position[..self.genotype_len()])
                .zip(genotype.iter())
                .zip(through_mixture.iter())
            {
                logp += a * (ln_sigmoid(u) + ln_sigmoid(-u)) - norm;
                *grad = a * (1. - 2. * g) + g * (1. - g) * dl;
            }
        }

        if self.community.is_none() && self.nstrain > 1 {
            let b = self.pi_hyper;
            let k = self.nstrain as f64;
            let norm = ln_gamma(k * b) - k * ln_gamma(b);
            let free = self.nstrain - 1;
            let through_mixture = dmixture.dot(&genotype.t());
            for n in 0..self.nsample {
                let pi = community.row(n);
                let dl = through_mixture.row(n);
                logp += b * log_community.row(n).sum() + norm;
                let mean: f64 = pi.iter().zip(dl.iter()).map(|(p, d)| p * d).sum();
                for j in 0..free {
                    community_grad[n * free + j] = b * (1. - k * pi[j]) + pi[j] * (dl[j] - mean);
                }
            }
        }

        Ok(logp)
    }

    fn sample(&self, rng: &mut dyn RngCore) -> Result<Values, ModelError> {
        let genotype = match &self.genotype {
            Some(genotype) => genotype.clone(),
            None => {
                let prior = Beta::new(self.gamma_hyper, self.gamma_hyper)
                    .map_err(|err| ModelError::Distribution(err.to_string()))?;
                Array2::from_shape_simple_fn((self.nstrain, self.nposition), || prior.sample(rng))
            }
        };

        let community = match &self.community {
            Some(community) => community.clone(),
            None => {
                let prior = Gamma::new(self.pi_hyper, 1.)
                    .map_err(|err| ModelError::Distribution(err.to_string()))?;
                let mut community = Array2::zeros((self.nsample, self.nstrain));
                for mut row in community.rows_mut() {
                    row.iter_mut().for_each(|x| *x = prior.sample(rng));
                    let sum = row.sum();
                    if sum > 0. {
                        row /= sum;
                    } else {
                        row.fill(1. / self.nstrain as f64);
                    }
                }
                community
            }
        };

        self.draw_observables(genotype, community, rng)
    }

    fn predict(&self, position: &[f64], rng: &mut dyn RngCore) -> Result<Values, ModelError> {
        self.check_position(position)?;
        let genotype = self.genotype_at(position);
        let community = self.log_community_at(position).mapv(f64::exp);
        self.draw_observables(genotype, community, rng)
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use pretty_assertions::assert_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    use super::*;
    use crate::structure::DType;

    fn observed(shape: &[usize]) -> Data {
        let unit = Unit::new(DType::Float64);
        let program = SIMPLE
            .instantiate(shape, Data::new(), &SIMPLE.default_hyperparameters(), unit)
            .unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let draw = program.sample(&mut rng).unwrap();
        let mut data = Data::new();
        data.insert(TOTAL_COUNT.to_string(), draw[TOTAL_COUNT].clone());
        data.insert(ALT_COUNT.to_string(), draw[ALT_COUNT].clone());
        data
    }

    #[test]
    fn sample_matches_description() {
        let unit = Unit::new(DType::Float64);
        let program = SIMPLE
            .instantiate(&[3, 4, 5, 2], Data::new(), &SIMPLE.default_hyperparameters(), unit)
            .unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let draw = program.sample(&mut rng).unwrap();
        assert_eq!(draw["genotype"].shape(), &[3, 5]);
        assert_eq!(draw["community"].shape(), &[4, 3]);
        assert_eq!(draw["metagenotype"].shape(), &[4, 5, 2]);
        for row in draw["community"].rows() {
            assert_abs_diff_eq!(row.sum(), 1., epsilon = 1e-9);
        }
        assert_eq!(program.dim(), 3 * 5 + 4 * 2);
        assert_eq!(program.latent_names(), vec!["genotype", "community"]);
    }

    #[test]
    fn gradient_matches_finite_differences() {
        let shape = [3, 4, 6, 2];
        let unit = Unit::new(DType::Float64);
        let mut program = SIMPLE
            .instantiate(&shape, observed(&shape), &SIMPLE.default_hyperparameters(), unit)
            .unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let dim = program.dim();
        let mut position = vec![0.; dim];
        program
            .init_position(&Values::new(), &mut rng, &mut position)
            .unwrap();

        let mut grad = vec![0.; dim];
        let logp = program.logp(&position, &mut grad).unwrap();
        assert!(logp.is_finite());

        let mut scratch = vec![0.; dim];
        let h = 1e-6;
        for i in 0..dim {
            let mut up = position.clone();
            up[i] += h;
            let mut down = position.clone();
            down[i] -= h;
            let numeric = (program.logp(&up, &mut scratch).unwrap()
                - program.logp(&down, &mut scratch).unwrap())
                / (2. * h);
            assert_abs_diff_eq!(grad[i], numeric, epsilon = 1e-4 * (1. + numeric.abs()));
        }
    }

    #[test]
    fn fixed_community_removes_latents() {
        let shape = [2, 3, 4, 2];
        let mut data = observed(&shape);
        data.insert(
            "community".to_string(),
            array![[0.5, 0.5], [0.9, 0.1], [0.2, 0.8]].into_dyn(),
        );
        let unit = Unit::new(DType::Float64);
        let program = SIMPLE
            .instantiate(&shape, data, &SIMPLE.default_hyperparameters(), unit)
            .unwrap();
        assert_eq!(program.dim(), 2 * 4);
        assert_eq!(program.latent_names(), vec!["genotype"]);
    }

    #[test]
    fn rejects_bad_conditioning() {
        let unit = Unit::new(DType::Float64);
        let hyper = SIMPLE.default_hyperparameters();

        let mut data = Data::new();
        data.insert("gamma".to_string(), ArrayD::zeros(ndarray::IxDyn(&[2, 4])));
        let err = SIMPLE.instantiate(&[2, 3, 4, 2], data, &hyper, unit);
        assert!(matches!(err, Err(ModelError::UnknownVariable(_))));

        let mut data = Data::new();
        data.insert("genotype".to_string(), ArrayD::zeros(ndarray::IxDyn(&[4, 2])));
        let err = SIMPLE.instantiate(&[2, 3, 4, 2], data, &hyper, unit);
        assert!(matches!(err, Err(ModelError::DataShape { .. })));

        let err = SIMPLE.instantiate(&[2, 3, 4, 3], Data::new(), &hyper, unit);
        assert!(matches!(err, Err(ModelError::AlleleDimension(3))));

        let err = SIMPLE.instantiate(&[0, 3, 4, 2], Data::new(), &hyper, unit);
        assert!(matches!(err, Err(ModelError::EmptyDimension("strain"))));

        let mut data = Data::new();
        data.insert(TOTAL_COUNT.to_string(), array![[4.5]].into_dyn());
        data.insert(ALT_COUNT.to_string(), array![[1.]].into_dyn());
        let err = SIMPLE.instantiate(&[1, 1, 1, 2], data, &hyper, unit);
        assert!(matches!(err, Err(ModelError::InvalidCounts(_))));
    }

    #[test]
    fn likelihood_is_binomial_with_error_rate() {
        let mut data = Data::new();
        data.insert("genotype".to_string(), array![[1.]].into_dyn());
        data.insert("community".to_string(), array![[1.]].into_dyn());
        data.insert(TOTAL_COUNT.to_string(), array![[10.]].into_dyn());
        data.insert(ALT_COUNT.to_string(), array![[3.]].into_dyn());
        let unit = Unit::new(DType::Float64);
        let mut program = SIMPLE
            .instantiate(&[1, 1, 1, 2], data, &SIMPLE.default_hyperparameters(), unit)
            .unwrap();
        assert_eq!(program.dim(), 0);
        let logp = program.logp(&[], &mut []).unwrap();
        // q = epsilon + (1 - 2 epsilon) * 1 with epsilon = 0.01
        let q: f64 = 0.99;
        let expected = 120f64.ln() + 3. * q.ln() + 7. * (1. - q).ln();
        assert_abs_diff_eq!(logp, expected, epsilon = 1e-9);
    }

    #[test]
    fn likelihood_needs_observations() {
        let unit = Unit::new(DType::Float64);
        let mut program = SIMPLE
            .instantiate(&[2, 2, 2, 2], Data::new(), &SIMPLE.default_hyperparameters(), unit)
            .unwrap();
        let position = vec![0.; program.dim()];
        let mut grad = vec![0.; program.dim()];
        assert!(matches!(
            program.logp(&position, &mut grad),
            Err(ModelError::MissingObservation(_))
        ));
    }

    #[test]
    fn init_from_values_round_trips() {
        let shape = [2, 2, 3, 2];
        let unit = Unit::new(DType::Float64);
        let program = SIMPLE
            .instantiate(&shape, observed(&shape), &SIMPLE.default_hyperparameters(), unit)
            .unwrap();
        let genotype = array![[0.1, 0.5, 0.9], [0.3, 0.7, 0.2]];
        let community = array![[0.25, 0.75], [0.6, 0.4]];
        let mut init = Values::new();
        init.insert("genotype".to_string(), genotype.clone().into_dyn());
        init.insert("community".to_string(), community.clone().into_dyn());

        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let mut position = vec![0.; program.dim()];
        program.init_position(&init, &mut rng, &mut position).unwrap();
        let out = program.predict(&position, &mut rng).unwrap();
        out["genotype"]
            .iter()
            .zip(genotype.iter())
            .for_each(|(a, b)| assert_abs_diff_eq!(a, b, epsilon = 1e-9));
        out["community"]
            .iter()
            .zip(community.iter())
            .for_each(|(a, b)| assert_abs_diff_eq!(a, b, epsilon = 1e-9));
    }
}
