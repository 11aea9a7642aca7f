//! Labeled domain entities: metagenotypes, genotypes, communities and
//! the `World` bundle that ties them together.

use std::{collections::BTreeMap, ops::Range};

use ndarray::{Array2, ArrayView2, Axis, Ix2};
use thiserror::Error;

use crate::{
    labeled::{Coords, LabeledArray, LabeledError},
    structure::Data,
};

/// Binary allele labels, alt first.
pub const ALLELES: [&str; 2] = ["alt", "ref"];

pub const ALT_COUNT: &str = "alt_count";
pub const TOTAL_COUNT: &str = "total_count";

#[non_exhaustive]
#[derive(Error, Debug)]
pub enum DataError {
    #[error("world has no variable `{0}`")]
    MissingVariable(String),
    #[error("`{name}` must span dimensions {expected:?}, found {found:?}")]
    WrongDims {
        name: &'static str,
        expected: &'static [&'static str],
        found: Vec<String>,
    },
    #[error("alt counts have shape {alt:?} but totals have shape {total:?}")]
    ShapeMismatch {
        alt: (usize, usize),
        total: (usize, usize),
    },
    #[error(transparent)]
    Labeled(#[from] LabeledError),
}

fn check_dims(
    name: &'static str,
    expected: &'static [&'static str],
    array: &LabeledArray,
) -> Result<(), DataError> {
    if array.dims().iter().map(String::as_str).eq(expected.iter().copied()) {
        Ok(())
    } else {
        Err(DataError::WrongDims {
            name,
            expected,
            found: array.dims().to_vec(),
        })
    }
}

fn as_matrix(array: &LabeledArray) -> ArrayView2<'_, f64> {
    array
        .values()
        .view()
        .into_dimensionality::<Ix2>()
        .expect("rank checked on construction")
}

/// Per-sample, per-position alt/ref read counts.
#[derive(Debug, Clone, PartialEq)]
pub struct Metagenotype(LabeledArray);

impl Metagenotype {
    pub const DIMS: &'static [&'static str] = &["sample", "position", "allele"];

    pub fn new(array: LabeledArray) -> Result<Self, DataError> {
        check_dims("metagenotype", Self::DIMS, &array)?;
        Ok(Self(array))
    }

    /// Builds a metagenotype from alt and total counts shaped `[sample, position]`.
    pub fn from_counts(
        alt: &Array2<f64>,
        total: &Array2<f64>,
        sample: Coords,
        position: Coords,
    ) -> Result<Self, DataError> {
        if alt.dim() != total.dim() {
            return Err(DataError::ShapeMismatch {
                alt: alt.dim(),
                total: total.dim(),
            });
        }
        let (nsample, nposition) = alt.dim();
        let values = ndarray::Array3::from_shape_fn((nsample, nposition, 2), |(i, j, k)| {
            if k == 0 {
                alt[[i, j]]
            } else {
                total[[i, j]] - alt[[i, j]]
            }
        });
        let array = LabeledArray::new(
            Self::DIMS.iter().copied(),
            vec![sample, position, Coords::from(ALLELES)],
            values.into_dyn(),
        )?;
        Self::new(array)
    }

    pub fn data(&self) -> &LabeledArray {
        &self.0
    }

    pub fn sample(&self) -> &Coords {
        self.0.coords("sample").expect("dims checked on construction")
    }

    pub fn position(&self) -> &Coords {
        self.0.coords("position").expect("dims checked on construction")
    }

    pub fn allele(&self) -> &Coords {
        self.0.coords("allele").expect("dims checked on construction")
    }

    pub fn sizes(&self) -> BTreeMap<String, usize> {
        self.0.sizes()
    }

    fn alt_index(&self) -> usize {
        self.allele().position("alt").unwrap_or(0)
    }

    /// Total depth per `[sample, position]`.
    pub fn totals(&self) -> Array2<f64> {
        self.0
            .values()
            .sum_axis(Axis(2))
            .into_dimensionality::<Ix2>()
            .expect("rank checked on construction")
    }

    /// Alt allele counts per `[sample, position]`.
    pub fn alt_counts(&self) -> Array2<f64> {
        self.0
            .values()
            .index_axis(Axis(2), self.alt_index())
            .to_owned()
            .into_dimensionality::<Ix2>()
            .expect("rank checked on construction")
    }

    /// The two arrays a generative model conditions on.
    pub fn to_counts_and_totals(&self) -> Data {
        let mut data = Data::new();
        data.insert(ALT_COUNT.to_string(), self.alt_counts().into_dyn());
        data.insert(TOTAL_COUNT.to_string(), self.totals().into_dyn());
        data
    }

    pub fn isel_positions(&self, range: Range<usize>) -> Result<Self, DataError> {
        Self::new(self.0.isel("position", range)?)
    }

    pub fn to_world(&self) -> World {
        World::default().assign("metagenotype", self.0.clone())
    }
}

/// Per-strain, per-position alt allele state in `[0, 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Genotype(LabeledArray);

impl Genotype {
    pub const DIMS: &'static [&'static str] = &["strain", "position"];

    pub fn new(array: LabeledArray) -> Result<Self, DataError> {
        check_dims("genotype", Self::DIMS, &array)?;
        Ok(Self(array))
    }

    pub fn data(&self) -> &LabeledArray {
        &self.0
    }

    pub fn strain(&self) -> &Coords {
        self.0.coords("strain").expect("dims checked on construction")
    }

    pub fn position(&self) -> &Coords {
        self.0.coords("position").expect("dims checked on construction")
    }

    pub fn values(&self) -> ArrayView2<'_, f64> {
        as_matrix(&self.0)
    }

    pub fn discretized(&self) -> Array2<f64> {
        self.values().mapv(f64::round)
    }

    pub fn concat_positions(parts: &[Genotype]) -> Result<Self, DataError> {
        let arrays: Vec<LabeledArray> = parts.iter().map(|g| g.0.clone()).collect();
        Self::new(LabeledArray::concat("position", &arrays)?)
    }
}

/// Per-sample mixing proportions over strains.
#[derive(Debug, Clone, PartialEq)]
pub struct Community(LabeledArray);

impl Community {
    pub const DIMS: &'static [&'static str] = &["sample", "strain"];

    pub fn new(array: LabeledArray) -> Result<Self, DataError> {
        check_dims("community", Self::DIMS, &array)?;
        Ok(Self(array))
    }

    pub fn data(&self) -> &LabeledArray {
        &self.0
    }

    pub fn sample(&self) -> &Coords {
        self.0.coords("sample").expect("dims checked on construction")
    }

    pub fn strain(&self) -> &Coords {
        self.0.coords("strain").expect("dims checked on construction")
    }

    pub fn values(&self) -> ArrayView2<'_, f64> {
        as_matrix(&self.0)
    }
}

/// A bundle of labeled result arrays keyed by variable name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct World {
    variables: BTreeMap<String, LabeledArray>,
}

impl World {
    pub fn new(variables: BTreeMap<String, LabeledArray>) -> Self {
        Self { variables }
    }

    pub fn get(&self, name: &str) -> Result<&LabeledArray, DataError> {
        self.variables
            .get(name)
            .ok_or_else(|| DataError::MissingVariable(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.variables.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.variables.keys().map(String::as_str)
    }

    pub fn variables(&self) -> impl Iterator<Item = (&str, &LabeledArray)> {
        self.variables.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn genotype(&self) -> Result<Genotype, DataError> {
        Genotype::new(self.get("genotype")?.clone())
    }

    pub fn community(&self) -> Result<Community, DataError> {
        Community::new(self.get("community")?.clone())
    }

    pub fn metagenotype(&self) -> Result<Metagenotype, DataError> {
        Metagenotype::new(self.get("metagenotype")?.clone())
    }

    /// Dimension sizes across all variables.
    pub fn sizes(&self) -> BTreeMap<String, usize> {
        self.variables
            .values()
            .flat_map(|arr| arr.sizes())
            .collect()
    }

    /// Removes every variable spanning any of `dims`.
    pub fn drop_dims(&self, dims: &[&str]) -> World {
        let variables = self
            .variables
            .iter()
            .filter(|(_, arr)| !dims.iter().any(|dim| arr.spans(dim)))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        World { variables }
    }

    pub fn assign(mut self, name: impl Into<String>, array: LabeledArray) -> World {
        self.variables.insert(name.into(), array);
        self
    }

    /// Selects `labels` along `dim` in every variable that spans it.
    pub fn sel(&self, dim: &str, labels: &Coords) -> Result<World, DataError> {
        let variables = self
            .variables
            .iter()
            .map(|(k, arr)| {
                let arr = if arr.spans(dim) {
                    arr.sel(dim, labels)?
                } else {
                    arr.clone()
                };
                Ok((k.clone(), arr))
            })
            .collect::<Result<_, DataError>>()?;
        Ok(World { variables })
    }

    pub fn sel_positions(&self, labels: &Coords) -> Result<World, DataError> {
        self.sel("position", labels)
    }

    pub fn sel_samples(&self, labels: &Coords) -> Result<World, DataError> {
        self.sel("sample", labels)
    }
}

#[cfg(test)]
mod tests {
    use ndarray::array;
    use pretty_assertions::assert_eq;

    use super::*;

    fn metagenotype() -> Metagenotype {
        let alt = array![[1., 0., 5.], [2., 2., 0.]];
        let total = array![[4., 0., 5.], [2., 3., 1.]];
        Metagenotype::from_counts(
            &alt,
            &total,
            Coords::new(["s1", "s2"]),
            Coords::new(["p1", "p2", "p3"]),
        )
        .unwrap()
    }

    #[test]
    fn counts_and_totals() {
        let mgen = metagenotype();
        let data = mgen.to_counts_and_totals();
        assert_eq!(data[ALT_COUNT][[0, 2]], 5.);
        assert_eq!(data[TOTAL_COUNT][[1, 1]], 3.);
        assert_eq!(mgen.allele(), &Coords::from(ALLELES));
        assert_eq!(mgen.sizes()["position"], 3);
    }

    #[test]
    fn position_subset() {
        let mgen = metagenotype();
        let sub = mgen.isel_positions(1..3).unwrap();
        assert_eq!(sub.position(), &Coords::new(["p2", "p3"]));
        assert_eq!(sub.totals(), array![[0., 5.], [3., 1.]]);
    }

    #[test]
    fn mismatched_counts_are_rejected() {
        let alt = array![[1., 0.], [2., 2.]];
        let total = array![[4., 0., 5.], [2., 3., 1.]];
        let err = Metagenotype::from_counts(
            &alt,
            &total,
            Coords::new(["s1", "s2"]),
            Coords::range(2),
        );
        assert!(matches!(err, Err(DataError::ShapeMismatch { .. })));
        assert!(metagenotype().isel_positions(2..4).is_err());
    }

    #[test]
    fn drop_dims_removes_spanning_variables() {
        let world = metagenotype().to_world();
        assert!(world.contains("metagenotype"));
        let dropped = world.drop_dims(&["allele"]);
        assert_eq!(dropped.names().count(), 0);
    }

    #[test]
    fn wrong_dims_are_rejected() {
        let mgen = metagenotype();
        assert!(Genotype::new(mgen.data().clone()).is_err());
    }
}
