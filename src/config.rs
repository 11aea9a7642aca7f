//! TOML configuration for the fitting workflows.
//!
//! ```toml
//! dtype = "float64"
//! quiet = true
//!
//! [hyperparameters]
//! epsilon = 0.001
//!
//! [estimation]
//! optimizer = "Adam"
//! maxiter = 2000
//! seed = 0
//!
//! [estimation.optimizer_kwargs]
//! lr = 0.05
//!
//! [nmf]
//! tol = 1e-4
//! ```

use std::{fs, path::Path};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    estimation::EstimationSettings,
    nmf::NmfSettings,
    structure::{DType, Device, Hyperparameters},
    workflow::FitOptions,
};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read or write config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse TOML config: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Failed to serialize config to TOML: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
    #[error("Invalid setting `{name}`: {reason}")]
    Invalid { name: &'static str, reason: String },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    pub dtype: DType,
    pub device: Device,
    pub quiet: bool,
    pub hyperparameters: Hyperparameters,
    pub estimation: EstimationSettings,
    /// NMF warm start; absent disables it.
    pub nmf: Option<NmfSettings>,
}

impl WorkflowConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let est = &self.estimation;
        if est.lag_a == 0 || est.lag_b == 0 {
            return Err(ConfigError::Invalid {
                name: "lagA/lagB",
                reason: "reporting windows must be positive".to_string(),
            });
        }
        if !(est.factor > 0. && est.factor < 1.) {
            return Err(ConfigError::Invalid {
                name: "factor",
                reason: format!("{} is not in (0, 1)", est.factor),
            });
        }
        if let Some(lr) = est.optimizer_kwargs.lr {
            if lr <= 0. || !lr.is_finite() {
                return Err(ConfigError::Invalid {
                    name: "lr",
                    reason: format!("{} is not a positive learning rate", lr),
                });
            }
        }
        Ok(())
    }

    pub fn fit_options(&self) -> FitOptions {
        FitOptions {
            hyperparameters: self.hyperparameters.clone(),
            dtype: self.dtype,
            device: self.device,
            quiet: self.quiet,
            nmf_init: self.nmf,
            estimation: self.estimation.clone(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::optim::OptimizerName;

    #[test]
    fn parses_partial_config() {
        let config = WorkflowConfig::from_toml_str(
            r#"
            dtype = "float64"
            device = "cpu"

            [hyperparameters]
            epsilon = 0.001

            [estimation]
            optimizer = "RMSprop"
            maxiter = 500
            lagA = 10
            seed = 7

            [estimation.optimizer_kwargs]
            lr = 0.05
            betas = [0.8, 0.99]

            [nmf]
            regularization = "genotype"
            "#,
        )
        .unwrap();
        assert_eq!(config.dtype, DType::Float64);
        assert_eq!(config.hyperparameters["epsilon"], 0.001);
        assert_eq!(config.estimation.optimizer, OptimizerName::RmsProp);
        assert_eq!(config.estimation.maxiter, 500);
        assert_eq!(config.estimation.lag_a, 10);
        assert_eq!(config.estimation.lag_b, 100);
        assert_eq!(config.estimation.seed, Some(7));
        assert_eq!(config.estimation.optimizer_kwargs.betas, Some((0.8, 0.99)));
        let nmf = config.nmf.unwrap();
        assert_eq!(nmf.tol, 1e-3);

        let options = config.fit_options();
        assert!(options.nmf_init.is_some());
        assert!(options.condition_on.is_empty());
    }

    #[test]
    fn defaults_round_trip() {
        let config = WorkflowConfig::default();
        assert!(config.nmf.is_none());
        let text = config.to_toml_string().unwrap();
        let parsed = WorkflowConfig::from_toml_str(&text).unwrap();
        assert_eq!(parsed.estimation.maxiter, 10_000);
        assert_eq!(parsed.device, Device::Cpu);
    }

    #[test]
    fn rejects_invalid_values() {
        assert!(matches!(
            WorkflowConfig::from_toml_str("[estimation]\nfactor = 1.5"),
            Err(ConfigError::Invalid { name: "factor", .. })
        ));
        assert!(matches!(
            WorkflowConfig::from_toml_str("device = \"tpu\""),
            Err(ConfigError::TomlParse(_))
        ));
        assert!(matches!(
            WorkflowConfig::from_toml_str("[estimation]\noptimizer = \"SGD\""),
            Err(ConfigError::TomlParse(_))
        ));
    }
}
