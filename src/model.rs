//! A generative structure bound to concrete coordinates, precision,
//! hyperparameters and fixed data.
//!
//! Every derivation (`condition`, `with_hyperparameters`,
//! `with_amended_coords`, ...) returns a new model and leaves the receiver
//! untouched, so one base model can be shared across independent fits.

use std::{collections::BTreeMap, fmt};

use itertools::Itertools;
use ndarray::ArrayD;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::{
    data::World,
    labeled::{Coords, LabeledArray},
    structure::{DType, Data, Device, Hyperparameters, ModelError, Program, Structure, Unit, Values},
};

/// A reproducible random stream, or a fresh one when no seed is given.
pub(crate) fn seeded_rng(seed: Option<u64>, warn: bool) -> ChaCha8Rng {
    match seed {
        Some(seed) => ChaCha8Rng::seed_from_u64(seed),
        None => {
            if warn {
                log::warn!("No random seed given; results will not be reproducible.");
            }
            ChaCha8Rng::from_rng(&mut rand::rng())
        }
    }
}

fn warn_on_allele_order(coords: &BTreeMap<String, Coords>) {
    if let Some(allele) = coords.get("allele") {
        if allele.position("alt").is_some_and(|idx| idx > 0) {
            log::warn!(
                "Weird things can happen if binary (alt/ref) allele coordinates are passed as [ref, alt]."
            );
        }
    }
}

#[derive(Debug, Clone)]
pub struct ParameterizedModel {
    structure: Structure,
    coords: BTreeMap<String, Coords>,
    dtype: DType,
    device: Device,
    hyperparameters: Hyperparameters,
    data: Data,
}

impl ParameterizedModel {
    /// Binds `structure` to coordinates for each of its dims.
    ///
    /// Coordinates for dims the structure does not declare are ignored.
    pub fn new(
        structure: Structure,
        coords: BTreeMap<String, Coords>,
    ) -> Result<Self, ModelError> {
        warn_on_allele_order(&coords);
        let coords = structure
            .dims()
            .iter()
            .map(|&dim| {
                coords
                    .get(dim)
                    .cloned()
                    .map(|c| (dim.to_string(), c))
                    .ok_or_else(|| ModelError::MissingCoords(dim.to_string()))
            })
            .collect::<Result<_, _>>()?;
        Ok(Self {
            structure,
            coords,
            dtype: DType::default(),
            device: Device::default(),
            hyperparameters: structure.default_hyperparameters(),
            data: Data::new(),
        })
    }

    pub fn structure(&self) -> &Structure {
        &self.structure
    }

    pub fn coords(&self) -> &BTreeMap<String, Coords> {
        &self.coords
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn device(&self) -> Device {
        self.device
    }

    /// Defaults merged with every override applied so far.
    pub fn hyperparameters(&self) -> &Hyperparameters {
        &self.hyperparameters
    }

    pub fn data(&self) -> &Data {
        &self.data
    }

    /// Dimension sizes in the structure's dim order.
    pub fn sizes(&self) -> Vec<(&'static str, usize)> {
        self.structure
            .dims()
            .iter()
            .map(|&dim| (dim, self.coords.get(dim).map_or(0, Coords::len)))
            .collect()
    }

    pub fn shape(&self) -> Vec<usize> {
        self.sizes().into_iter().map(|(_, size)| size).collect()
    }

    pub fn with_dtype(&self, dtype: DType) -> Self {
        Self {
            dtype,
            ..self.clone()
        }
    }

    pub fn with_device(&self, device: Device) -> Self {
        Self {
            device,
            ..self.clone()
        }
    }

    pub fn with_hyperparameters(&self, hyperparameters: Hyperparameters) -> Self {
        let mut new = self.clone();
        new.hyperparameters.extend(hyperparameters);
        new
    }

    pub fn with_amended_coords(&self, coords: BTreeMap<String, Coords>) -> Self {
        warn_on_allele_order(&coords);
        let mut new = self.clone();
        for (dim, labels) in coords {
            if let Some(slot) = new.coords.get_mut(&dim) {
                *slot = labels;
            }
        }
        new
    }

    /// A copy with additional (or replaced) fixed data.
    pub fn condition(&self, data: Data) -> Self {
        let mut new = self.clone();
        new.data.extend(data);
        new
    }

    /// Instantiate the conditioned program for the current coordinates.
    ///
    /// Data and hyperparameters are cast to the configured dtype.
    pub fn program(&self) -> Result<Box<dyn Program>, ModelError> {
        if self.device.is_accelerator() {
            return Err(ModelError::UnsupportedDevice(self.device));
        }
        let unit = Unit::new(self.dtype);
        let data = self
            .data
            .iter()
            .map(|(name, values)| (name.clone(), values.mapv(|x| unit.cast(x))))
            .collect();
        let hyperparameters = self
            .hyperparameters
            .iter()
            .map(|(name, &value)| (name.clone(), unit.cast(value)))
            .collect();
        self.structure
            .instantiate(&self.shape(), data, &hyperparameters, unit)
    }

    /// Attach declared dims and current coordinates to raw arrays.
    pub fn format_world(&self, raw: &Values) -> Result<World, ModelError> {
        let mut variables = BTreeMap::new();
        for &(name, dims) in self.structure.description() {
            let values = raw
                .get(name)
                .ok_or_else(|| ModelError::MissingEstimate(name.to_string()))?;
            let coords = dims
                .iter()
                .map(|&dim| {
                    self.coords
                        .get(dim)
                        .cloned()
                        .ok_or_else(|| ModelError::MissingCoords(dim.to_string()))
                })
                .collect::<Result<Vec<_>, _>>()?;
            let array = LabeledArray::new(dims.iter().copied(), coords, values.clone())?;
            variables.insert(name.to_string(), array);
        }
        Ok(World::new(variables))
    }

    /// Mean of `n` independent joint draws. Without a seed the draws use OS
    /// entropy and a warning is logged unless `quiet`.
    pub fn simulate(
        &self,
        n: usize,
        seed: Option<u64>,
        quiet: bool,
    ) -> Result<Values, ModelError> {
        let n = n.max(1);
        let mut rng = seeded_rng(seed, !quiet);
        let program = self.program()?;
        let mut total: Values = program.sample(&mut rng)?;
        for _ in 1..n {
            for (name, draw) in program.sample(&mut rng)? {
                if let Some(acc) = total.get_mut(&name) {
                    *acc += &draw;
                }
            }
        }
        if n > 1 {
            total.values_mut().for_each(|acc: &mut ArrayD<f64>| *acc /= n as f64);
        }
        Ok(total)
    }

    pub fn simulate_world(&self, seed: Option<u64>, quiet: bool) -> Result<World, ModelError> {
        self.format_world(&self.simulate(1, seed, quiet)?)
    }
}

impl fmt::Display for ParameterizedModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "ParameterizedModel(")?;
        writeln!(f, " structure={},", self.structure.name())?;
        writeln!(
            f,
            " coords={{{}}},",
            self.coords
                .iter()
                .map(|(dim, labels)| format!("{}: {}", dim, labels))
                .join(", ")
        )?;
        writeln!(f, " dtype={:?},", self.dtype)?;
        writeln!(f, " device={},", self.device)?;
        writeln!(
            f,
            " hyperparameters={{{}}},",
            self.hyperparameters
                .iter()
                .map(|(name, value)| format!("{}: {}", name, value))
                .join(", ")
        )?;
        writeln!(
            f,
            " data={{{}}},",
            self.data
                .iter()
                .map(|(name, values)| format!("{}: {:?}", name, values.shape()))
                .join(", ")
        )?;
        write!(f, ")")
    }
}
