//! Gaussian approximation of the posterior around an optimized mode.
//!
//! During optimization only the mode is tracked, so draws are the mode
//! itself. Once the curvature has been computed, draws come from
//! `N(loc, H^-1)` where `H` is the Hessian of the negative log density.

use faer::{Col, Mat, MatRef};
use rand::Rng;
use rand_distr::StandardNormal;

use crate::{estimation::EstimationError, structure::Program};

/// Smallest curvature eigenvalue kept when inverting the Hessian.
pub const EIGENVALUE_FLOOR: f64 = 1e-6;

const FINITE_DIFFERENCE_STEP: f64 = 1e-5;

fn mat_is_finite(mat: &MatRef<f64>) -> bool {
    let mut ok = true;
    faer::zip!(mat).for_each(|faer::unzip!(val)| ok &= val.is_finite());
    ok
}

#[derive(Debug, Clone)]
pub struct LaplaceApproximation {
    loc: Vec<f64>,
    /// `U diag(s^-1/2)` from the eigendecomposition of the Hessian.
    scale: Option<Mat<f64>>,
}

impl LaplaceApproximation {
    pub fn new(loc: Vec<f64>) -> Self {
        Self { loc, scale: None }
    }

    pub fn dim(&self) -> usize {
        self.loc.len()
    }

    pub fn loc(&self) -> &[f64] {
        &self.loc
    }

    pub fn loc_mut(&mut self) -> &mut [f64] {
        // Moving the mode invalidates the curvature.
        self.scale = None;
        &mut self.loc
    }

    pub fn has_curvature(&self) -> bool {
        self.scale.is_some()
    }

    /// Hessian of `-logp` at the mode by central differences of the gradient.
    fn hessian(&self, program: &mut dyn Program) -> Result<Mat<f64>, EstimationError> {
        let dim = self.dim();
        let mut hessian: Mat<f64> = Mat::zeros(dim, dim);
        let mut point = self.loc.clone();
        let mut grad_up = vec![0.; dim];
        let mut grad_down = vec![0.; dim];
        for j in 0..dim {
            let h = FINITE_DIFFERENCE_STEP * (1. + self.loc[j].abs());
            point[j] = self.loc[j] + h;
            program.logp(&point, &mut grad_up)?;
            point[j] = self.loc[j] - h;
            program.logp(&point, &mut grad_down)?;
            point[j] = self.loc[j];
            hessian
                .col_as_slice_mut(j)
                .iter_mut()
                .zip(grad_up.iter().zip(&grad_down))
                .for_each(|(out, (up, down))| *out = -(up - down) / (2. * h));
        }
        let symmetric = Mat::from_fn(dim, dim, |i, j| 0.5 * (hessian[(i, j)] + hessian[(j, i)]));
        if !mat_is_finite(&symmetric.as_ref()) {
            return Err(EstimationError::Curvature("non-finite Hessian".to_string()));
        }
        Ok(symmetric)
    }

    /// Compute the posterior covariance from the local curvature.
    pub fn fit_curvature(&mut self, program: &mut dyn Program) -> Result<(), EstimationError> {
        let hessian = self.hessian(program)?;
        let eig = hessian
            .self_adjoint_eigen(faer::Side::Lower)
            .map_err(|err| EstimationError::Curvature(format!("{:?}", err)))?;

        let mut inv_sqrt: Col<f64> = eig.S().column_vector().to_owned();
        let mut clipped = 0;
        inv_sqrt.iter_mut().for_each(|val| {
            if *val < EIGENVALUE_FLOOR {
                clipped += 1;
            }
            *val = val.max(EIGENVALUE_FLOOR).sqrt().recip();
        });
        if clipped > 0 {
            log::debug!("Raised {} curvature eigenvalues to {:e}.", clipped, EIGENVALUE_FLOOR);
        }

        let u = eig.U();
        self.scale = Some(Mat::from_fn(self.dim(), self.dim(), |i, j| u[(i, j)] * inv_sqrt[j]));
        Ok(())
    }

    /// One draw of the latent position.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R, out: &mut [f64]) {
        assert!(out.len() == self.dim());
        out.copy_from_slice(&self.loc);
        if let Some(scale) = &self.scale {
            let z: Vec<f64> = (0..self.dim()).map(|_| rng.sample(StandardNormal)).collect();
            for (i, out) in out.iter_mut().enumerate() {
                *out += z.iter().enumerate().map(|(j, z)| scale[(i, j)] * z).sum::<f64>();
            }
        }
    }
}
