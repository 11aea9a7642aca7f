//! First-order optimizers over a flat parameter vector.
//!
//! The update rules and default constants follow the usual deep learning
//! conventions for each method, with a shared default learning rate of 0.1.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::structure::ModelError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OptimizerName {
    Adam,
    #[default]
    Adamax,
    Adadelta,
    Adagrad,
    AdamW,
    #[serde(rename = "RMSprop")]
    RmsProp,
}

impl OptimizerName {
    pub const ALL: [OptimizerName; 6] = [
        OptimizerName::Adam,
        OptimizerName::Adamax,
        OptimizerName::Adadelta,
        OptimizerName::Adagrad,
        OptimizerName::AdamW,
        OptimizerName::RmsProp,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OptimizerName::Adam => "Adam",
            OptimizerName::Adamax => "Adamax",
            OptimizerName::Adadelta => "Adadelta",
            OptimizerName::Adagrad => "Adagrad",
            OptimizerName::AdamW => "AdamW",
            OptimizerName::RmsProp => "RMSprop",
        }
    }
}

impl fmt::Display for OptimizerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OptimizerName {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OptimizerName::ALL
            .into_iter()
            .find(|name| name.as_str() == s)
            .ok_or_else(|| ModelError::Parse {
                kind: "optimizer",
                value: s.to_string(),
            })
    }
}

/// Caller overrides of the per-optimizer defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerKwargs {
    pub lr: Option<f64>,
    pub betas: Option<(f64, f64)>,
    pub eps: Option<f64>,
    pub weight_decay: Option<f64>,
    pub rho: Option<f64>,
    pub alpha: Option<f64>,
}

/// Fully resolved optimizer constants.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OptimizerOptions {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    pub weight_decay: f64,
    /// Running average decay for Adadelta.
    pub rho: f64,
    /// Smoothing constant for RMSprop.
    pub alpha: f64,
}

impl OptimizerOptions {
    pub fn defaults(name: OptimizerName) -> Self {
        let base = Self {
            learning_rate: 0.1,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay: 0.,
            rho: 0.9,
            alpha: 0.99,
        };
        match name {
            OptimizerName::Adam | OptimizerName::Adamax | OptimizerName::RmsProp => base,
            OptimizerName::Adadelta => Self {
                epsilon: 1e-6,
                ..base
            },
            OptimizerName::Adagrad => Self {
                epsilon: 1e-10,
                ..base
            },
            OptimizerName::AdamW => Self {
                weight_decay: 0.01,
                ..base
            },
        }
    }

    pub fn with_kwargs(self, kwargs: &OptimizerKwargs) -> Self {
        let (beta1, beta2) = kwargs.betas.unwrap_or((self.beta1, self.beta2));
        Self {
            learning_rate: kwargs.lr.unwrap_or(self.learning_rate),
            beta1,
            beta2,
            epsilon: kwargs.eps.unwrap_or(self.epsilon),
            weight_decay: kwargs.weight_decay.unwrap_or(self.weight_decay),
            rho: kwargs.rho.unwrap_or(self.rho),
            alpha: kwargs.alpha.unwrap_or(self.alpha),
        }
    }
}

/// Optimizer state for one parameter vector. Minimizes.
#[derive(Debug, Clone)]
pub struct Optimizer {
    name: OptimizerName,
    options: OptimizerOptions,
    learning_rate: f64,
    t: u64,
    /// First moment (Adam family) or accumulated squared updates (Adadelta).
    m: Vec<f64>,
    /// Second moment, infinity norm or accumulated squared gradients.
    v: Vec<f64>,
}

impl Optimizer {
    pub fn new(name: OptimizerName, kwargs: &OptimizerKwargs, dim: usize) -> Self {
        let options = OptimizerOptions::defaults(name).with_kwargs(kwargs);
        Self {
            name,
            options,
            learning_rate: options.learning_rate,
            t: 0,
            m: vec![0.; dim],
            v: vec![0.; dim],
        }
    }

    pub fn name(&self) -> OptimizerName {
        self.name
    }

    pub fn options(&self) -> &OptimizerOptions {
        &self.options
    }

    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    pub fn set_learning_rate(&mut self, learning_rate: f64) {
        self.learning_rate = learning_rate;
    }

    /// Move `params` against `grad`, the gradient of the loss.
    pub fn step(&mut self, params: &mut [f64], grad: &[f64]) {
        assert!(params.len() == grad.len());
        assert!(params.len() == self.m.len());
        self.t += 1;
        let opts = self.options;
        let lr = self.learning_rate;
        let t = self.t as i32;

        if let OptimizerName::AdamW = self.name {
            params
                .iter_mut()
                .for_each(|p| *p *= 1. - lr * opts.weight_decay);
        }

        let iter = params
            .iter_mut()
            .zip(grad)
            .zip(self.m.iter_mut().zip(self.v.iter_mut()));

        match self.name {
            OptimizerName::Adam | OptimizerName::AdamW => {
                let decay = if let OptimizerName::Adam = self.name {
                    opts.weight_decay
                } else {
                    0.
                };
                let bias1 = 1. - opts.beta1.powi(t);
                let bias2 = 1. - opts.beta2.powi(t);
                for ((p, &g), (m, v)) in iter {
                    let g = g + decay * *p;
                    *m = opts.beta1 * *m + (1. - opts.beta1) * g;
                    *v = opts.beta2 * *v + (1. - opts.beta2) * g * g;
                    let denom = (*v / bias2).sqrt() + opts.epsilon;
                    *p -= lr / bias1 * *m / denom;
                }
            }
            OptimizerName::Adamax => {
                let bias1 = 1. - opts.beta1.powi(t);
                for ((p, &g), (m, u)) in iter {
                    let g = g + opts.weight_decay * *p;
                    *m = opts.beta1 * *m + (1. - opts.beta1) * g;
                    *u = (opts.beta2 * *u).max(g.abs() + opts.epsilon);
                    *p -= lr / bias1 * *m / *u;
                }
            }
            OptimizerName::Adadelta => {
                for ((p, &g), (acc_delta, square_avg)) in iter {
                    let g = g + opts.weight_decay * *p;
                    *square_avg = opts.rho * *square_avg + (1. - opts.rho) * g * g;
                    let delta = (*acc_delta + opts.epsilon).sqrt()
                        / (*square_avg + opts.epsilon).sqrt()
                        * g;
                    *acc_delta = opts.rho * *acc_delta + (1. - opts.rho) * delta * delta;
                    *p -= lr * delta;
                }
            }
            OptimizerName::Adagrad => {
                for ((p, &g), (_, sum)) in iter {
                    let g = g + opts.weight_decay * *p;
                    *sum += g * g;
                    *p -= lr * g / (sum.sqrt() + opts.epsilon);
                }
            }
            OptimizerName::RmsProp => {
                for ((p, &g), (_, square_avg)) in iter {
                    let g = g + opts.weight_decay * *p;
                    *square_avg = opts.alpha * *square_avg + (1. - opts.alpha) * g * g;
                    *p -= lr * g / (square_avg.sqrt() + opts.epsilon);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use pretty_assertions::assert_eq;

    use super::*;

    fn quadratic_grad(params: &[f64], target: &[f64], grad: &mut [f64]) {
        grad.iter_mut()
            .zip(params.iter().zip(target))
            .for_each(|(g, (p, t))| *g = 2. * (p - t));
    }

    #[test]
    fn every_optimizer_descends() {
        let target = [1.5, -2., 0.3];
        for name in OptimizerName::ALL {
            let mut opt = Optimizer::new(name, &OptimizerKwargs::default(), 3);
            let mut params = vec![0.; 3];
            let mut grad = vec![0.; 3];
            let start: f64 = target.iter().map(|t| t * t).sum();
            for _ in 0..500 {
                quadratic_grad(&params, &target, &mut grad);
                opt.step(&mut params, &grad);
            }
            let end: f64 = params
                .iter()
                .zip(&target)
                .map(|(p, t)| (p - t) * (p - t))
                .sum();
            let required = match name {
                OptimizerName::Adadelta => start,
                _ => start * 0.5,
            };
            assert!(end < required, "{} did not descend: {} -> {}", name, start, end);
        }
    }

    #[test]
    fn first_adam_step_has_learning_rate_size() {
        let mut opt = Optimizer::new(OptimizerName::Adam, &OptimizerKwargs::default(), 2);
        let mut params = vec![0., 0.];
        opt.step(&mut params, &[3., -0.01]);
        assert_abs_diff_eq!(params[0], -0.1, epsilon = 1e-6);
        assert_abs_diff_eq!(params[1], 0.1, epsilon = 1e-4);

        let mut opt = Optimizer::new(OptimizerName::Adamax, &OptimizerKwargs::default(), 1);
        let mut params = vec![0.];
        opt.step(&mut params, &[5.]);
        assert_abs_diff_eq!(params[0], -0.1, epsilon = 1e-6);
    }

    #[test]
    fn kwargs_override_defaults() {
        let kwargs = OptimizerKwargs {
            lr: Some(0.01),
            betas: Some((0.8, 0.9)),
            ..Default::default()
        };
        let opt = Optimizer::new(OptimizerName::AdamW, &kwargs, 1);
        assert_eq!(opt.learning_rate(), 0.01);
        assert_eq!(opt.options().beta1, 0.8);
        assert_eq!(opt.options().weight_decay, 0.01);
        assert_eq!(OptimizerOptions::defaults(OptimizerName::Adagrad).epsilon, 1e-10);
    }

    #[test]
    fn names_parse() {
        for name in OptimizerName::ALL {
            assert_eq!(name.as_str().parse::<OptimizerName>().unwrap(), name);
        }
        assert_eq!(OptimizerName::default(), OptimizerName::Adamax);
        assert!("SGD".parse::<OptimizerName>().is_err());
    }
}
