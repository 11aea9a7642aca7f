//! Generative model structures and the programs they instantiate.
//!
//! A [`Structure`] binds a generative function to the names of the
//! dimensions it is shaped by, the dimensions each of its variables spans,
//! and default hyperparameter values. Instantiating it with a concrete shape
//! yields a [`Program`]: an object that can draw joint samples and evaluate
//! the log density of its conditioned latent variables.

use std::{collections::BTreeMap, fmt, str::FromStr};

use itertools::Itertools;
use ndarray::ArrayD;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{data::DataError, labeled::LabeledError};

/// Raw numeric arrays keyed by variable name.
pub type Values = BTreeMap<String, ArrayD<f64>>;

/// Observed or fixed values a program is conditioned on.
pub type Data = Values;

pub type Hyperparameters = BTreeMap<String, f64>;

#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("shape has {found} entries but the structure declares {expected} dimensions")]
    ShapeMismatch { expected: usize, found: usize },
    #[error("no coordinates given for dimension `{0}`")]
    MissingCoords(String),
    #[error("`{0}` is not a conditionable variable of this model")]
    UnknownVariable(String),
    #[error("`{name}` has shape {found:?}, expected {expected:?}")]
    DataShape {
        name: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },
    #[error("`{0}` must be observed to evaluate the likelihood")]
    MissingObservation(&'static str),
    #[error("hyperparameter `{0}` is not set")]
    MissingHyperparameter(&'static str),
    #[error("hyperparameter `{name}` has invalid value {value}")]
    InvalidHyperparameter { name: &'static str, value: f64 },
    #[error("counts must be non-negative integers with alt <= total (`{0}`)")]
    InvalidCounts(String),
    #[error("the allele dimension must have exactly 2 labels, found {0}")]
    AlleleDimension(usize),
    #[error("dimension `{0}` must not be empty")]
    EmptyDimension(&'static str),
    #[error("device `{0}` is not supported; only the cpu backend is available")]
    UnsupportedDevice(Device),
    #[error("position has {found} entries but the program has {expected} latent coordinates")]
    PositionLength { expected: usize, found: usize },
    #[error("invalid distribution parameter: {0}")]
    Distribution(String),
    #[error("raw estimate is missing variable `{0}`")]
    MissingEstimate(String),
    #[error("could not parse {kind} from `{value}`")]
    Parse { kind: &'static str, value: String },
    #[error(transparent)]
    Labeled(#[from] LabeledError),
    #[error(transparent)]
    Data(#[from] DataError),
}

/// Floating point precision that data and hyperparameters are cast to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DType {
    #[default]
    #[serde(rename = "float32")]
    Float32,
    #[serde(rename = "float64")]
    Float64,
}

impl DType {
    #[inline]
    pub fn cast(self, value: f64) -> f64 {
        match self {
            DType::Float32 => value as f32 as f64,
            DType::Float64 => value,
        }
    }
}

impl FromStr for DType {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "float32" | "f32" => Ok(DType::Float32),
            "float64" | "f64" => Ok(DType::Float64),
            _ => Err(ModelError::Parse {
                kind: "dtype",
                value: s.to_string(),
            }),
        }
    }
}

/// Where a program is evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Device {
    #[default]
    Cpu,
    Cuda(usize),
}

impl Device {
    pub fn is_accelerator(&self) -> bool {
        !matches!(self, Device::Cpu)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Cuda(idx) => write!(f, "cuda:{}", idx),
        }
    }
}

impl FromStr for Device {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ModelError::Parse {
            kind: "device",
            value: s.to_string(),
        };
        match s {
            "cpu" => Ok(Device::Cpu),
            "cuda" => Ok(Device::Cuda(0)),
            _ => {
                let idx = s.strip_prefix("cuda:").ok_or_else(err)?;
                Ok(Device::Cuda(idx.parse().map_err(|_| err())?))
            }
        }
    }
}

impl TryFrom<String> for Device {
    type Error = ModelError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Device> for String {
    fn from(value: Device) -> Self {
        value.to_string()
    }
}

/// The constant `1.0` in the configured precision.
///
/// Passed to every generative function so that program definitions can
/// refer to a dtype-consistent constant and cast their own literals.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Unit {
    dtype: DType,
}

impl Unit {
    pub fn new(dtype: DType) -> Self {
        Self { dtype }
    }

    pub fn value(&self) -> f64 {
        self.dtype.cast(1.)
    }

    pub fn cast(&self, value: f64) -> f64 {
        self.dtype.cast(value)
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }
}

/// A generative model instantiated for one concrete shape.
///
/// Latent variables are exposed to inference as one flat vector of
/// unconstrained coordinates; variables that were given as data are fixed
/// and take no coordinates.
pub trait Program {
    /// Number of unconstrained latent coordinates.
    fn dim(&self) -> usize;

    /// Names of the latent variables that are not fixed by data.
    fn latent_names(&self) -> Vec<&'static str>;

    /// Fill `position` with an initial point.
    ///
    /// Latent variables present in `init` start at those (constrained)
    /// values, all others uniformly on `(-2, 2)` in unconstrained space.
    fn init_position(
        &self,
        init: &Values,
        rng: &mut dyn RngCore,
        position: &mut [f64],
    ) -> Result<(), ModelError>;

    /// Log joint density of the conditioned program at `position`,
    /// including the Jacobian of the unconstraining transforms.
    fn logp(&mut self, position: &[f64], gradient: &mut [f64]) -> Result<f64, ModelError>;

    /// One joint draw of every described variable from the prior,
    /// respecting fixed data.
    fn sample(&self, rng: &mut dyn RngCore) -> Result<Values, ModelError>;

    /// Every described variable at the latent point `position`, with
    /// unobserved observables drawn from their likelihood.
    fn predict(&self, position: &[f64], rng: &mut dyn RngCore) -> Result<Values, ModelError>;
}

pub type Generative =
    fn(&[usize], &Hyperparameters, Data, Unit) -> Result<Box<dyn Program>, ModelError>;

/// An immutable generative model declaration.
#[derive(Clone, Copy)]
pub struct Structure {
    name: &'static str,
    generative: Generative,
    dims: &'static [&'static str],
    description: &'static [(&'static str, &'static [&'static str])],
    default_hyperparameters: &'static [(&'static str, f64)],
}

impl Structure {
    pub const fn new(
        name: &'static str,
        generative: Generative,
        dims: &'static [&'static str],
        description: &'static [(&'static str, &'static [&'static str])],
        default_hyperparameters: &'static [(&'static str, f64)],
    ) -> Self {
        Self {
            name,
            generative,
            dims,
            description,
            default_hyperparameters,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn dims(&self) -> &'static [&'static str] {
        self.dims
    }

    pub fn description(&self) -> &'static [(&'static str, &'static [&'static str])] {
        self.description
    }

    pub fn variable_dims(&self, name: &str) -> Option<&'static [&'static str]> {
        self.description
            .iter()
            .find(|(var, _)| *var == name)
            .map(|(_, dims)| *dims)
    }

    pub fn default_hyperparameters(&self) -> Hyperparameters {
        self.default_hyperparameters
            .iter()
            .map(|&(k, v)| (k.to_string(), v))
            .collect()
    }

    pub fn instantiate(
        &self,
        shape: &[usize],
        data: Data,
        hyperparameters: &Hyperparameters,
        unit: Unit,
    ) -> Result<Box<dyn Program>, ModelError> {
        if shape.len() != self.dims.len() {
            return Err(ModelError::ShapeMismatch {
                expected: self.dims.len(),
                found: shape.len(),
            });
        }
        (self.generative)(shape, hyperparameters, data, unit)
    }

    /// Describe the concrete shape of every variable for `shape`
    /// (by default `1, 2, 3, ...` along the declared dims, and 2 alleles).
    pub fn explain_shapes(&self, shape: Option<&[usize]>) -> Result<String, ModelError> {
        let dummy = self
            .dims
            .iter()
            .enumerate()
            .map(|(i, &dim)| if dim == "allele" { 2 } else { i + 1 })
            .collect_vec();
        let shape = shape.unwrap_or(&dummy);
        let program = self.instantiate(
            shape,
            Data::new(),
            &self.default_hyperparameters(),
            Unit::new(DType::Float64),
        )?;
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let draw = program.sample(&mut rng)?;

        let sizes = self
            .dims
            .iter()
            .zip(shape)
            .map(|(dim, size)| format!("{}={}", dim, size))
            .join(", ");
        let mut out = format!("{{{}}}\n", sizes);
        for (name, dims) in self.description {
            let found = draw.get(*name).map(|arr| arr.shape().to_vec());
            out.push_str(&format!("  {}: {:?} {:?}\n", name, dims, found));
        }
        Ok(out)
    }
}

impl fmt::Debug for Structure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Structure")
            .field("generative", &self.name)
            .field("dims", &self.dims)
            .field("description", &self.description)
            .field("default_hyperparameters", &self.default_hyperparameters)
            .finish()
    }
}

impl fmt::Display for Structure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Structure(")?;
        writeln!(f, "  generative={},", self.name)?;
        writeln!(f, "  dims={:?},", self.dims)?;
        writeln!(f, "  description={{")?;
        for (name, dims) in self.description {
            writeln!(f, "    {}: {:?},", name, dims)?;
        }
        writeln!(f, "  }},")?;
        writeln!(
            f,
            "  default_hyperparameters={{{}}},",
            self.default_hyperparameters
                .iter()
                .map(|(k, v)| format!("{}: {}", k, v))
                .join(", ")
        )?;
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::model_zoo::SIMPLE;

    #[test]
    fn shape_length_must_match_dims() {
        let hyper = SIMPLE.default_hyperparameters();
        let unit = Unit::new(DType::Float64);
        for shape in [vec![], vec![2, 3], vec![2, 3, 4, 2, 1]] {
            let err = SIMPLE.instantiate(&shape, Data::new(), &hyper, unit);
            assert!(matches!(err, Err(ModelError::ShapeMismatch { expected: 4, .. })));
        }
        assert!(SIMPLE.instantiate(&[2, 3, 4, 2], Data::new(), &hyper, unit).is_ok());
    }

    #[test]
    fn parse_device_and_dtype() {
        assert_eq!("cpu".parse::<Device>().unwrap(), Device::Cpu);
        assert_eq!("cuda".parse::<Device>().unwrap(), Device::Cuda(0));
        assert_eq!("cuda:3".parse::<Device>().unwrap(), Device::Cuda(3));
        assert!("tpu".parse::<Device>().is_err());
        assert_eq!("float64".parse::<DType>().unwrap(), DType::Float64);
        assert_eq!(Unit::new(DType::Float32).value(), 1.);
        assert_ne!(DType::Float32.cast(0.1), 0.1);
    }

    #[test]
    fn explain_default_shapes() {
        let text = SIMPLE.explain_shapes(None).unwrap();
        assert!(text.contains("strain=1"));
        assert!(text.contains("metagenotype"));
    }
}
