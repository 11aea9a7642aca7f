//! Arrays whose axes carry a dimension name and coordinate labels.

use std::{collections::BTreeMap, fmt, ops::Range};

use itertools::Itertools;
use ndarray::{ArrayD, ArrayViewD, Axis, Slice};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[non_exhaustive]
#[derive(Error, Debug)]
pub enum LabeledError {
    #[error("array has {found} axes but {expected} dimension names were given")]
    Rank { expected: usize, found: usize },
    #[error("dimension `{dim}` has {labels} coordinate labels but its axis has length {len}")]
    CoordLength {
        dim: String,
        labels: usize,
        len: usize,
    },
    #[error("no dimension named `{0}`")]
    MissingDim(String),
    #[error("label `{label}` not found along dimension `{dim}`")]
    MissingLabel { dim: String, label: String },
    #[error("cannot concatenate arrays along `{0}`: dimensions or coordinates disagree")]
    Incompatible(String),
    #[error("range {start}..{end} is out of bounds for dimension `{dim}` of length {len}")]
    OutOfBounds {
        dim: String,
        start: usize,
        end: usize,
        len: usize,
    },
    #[error("nothing to concatenate")]
    Empty,
    #[error(transparent)]
    Shape(#[from] ndarray::ShapeError),
}

/// Ordered coordinate labels of one dimension.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Coords(Vec<String>);

impl Coords {
    pub fn new<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Coords(labels.into_iter().map(Into::into).collect())
    }

    /// Labels `"0"`, `"1"`, ... for a dimension that only has a size.
    pub fn range(n: usize) -> Self {
        Coords((0..n).map(|i| i.to_string()).collect())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn labels(&self) -> &[String] {
        &self.0
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn position(&self, label: &str) -> Option<usize> {
        self.0.iter().position(|val| val == label)
    }

    /// `None` if `range` is not within the labels.
    pub fn slice(&self, range: Range<usize>) -> Option<Coords> {
        self.0.get(range).map(|labels| Coords(labels.to_vec()))
    }

    pub fn concat<'a>(parts: impl IntoIterator<Item = &'a Coords>) -> Coords {
        Coords(parts.into_iter().flat_map(|c| c.0.iter().cloned()).collect())
    }
}

impl From<usize> for Coords {
    fn from(n: usize) -> Self {
        Coords::range(n)
    }
}

impl From<Vec<String>> for Coords {
    fn from(labels: Vec<String>) -> Self {
        Coords(labels)
    }
}

impl From<&[&str]> for Coords {
    fn from(labels: &[&str]) -> Self {
        Coords::new(labels.iter().copied())
    }
}

impl<const N: usize> From<[&str; N]> for Coords {
    fn from(labels: [&str; N]) -> Self {
        Coords::new(labels)
    }
}

impl fmt::Display for Coords {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const SHOWN: usize = 6;
        if self.len() <= SHOWN {
            write!(f, "[{}]", self.0.iter().join(", "))
        } else {
            write!(
                f,
                "[{}, ... {}] ({} labels)",
                self.0[..SHOWN - 1].iter().join(", "),
                self.0[self.len() - 1],
                self.len()
            )
        }
    }
}

/// A dense `f64` array with one name and one set of coordinate labels per axis.
#[derive(Debug, Clone, PartialEq)]
pub struct LabeledArray {
    dims: Vec<String>,
    coords: Vec<Coords>,
    values: ArrayD<f64>,
}

impl LabeledArray {
    pub fn new<S: Into<String>>(
        dims: impl IntoIterator<Item = S>,
        coords: Vec<Coords>,
        values: ArrayD<f64>,
    ) -> Result<Self, LabeledError> {
        let dims: Vec<String> = dims.into_iter().map(Into::into).collect();
        if dims.len() != values.ndim() || coords.len() != values.ndim() {
            return Err(LabeledError::Rank {
                expected: dims.len(),
                found: values.ndim(),
            });
        }
        for ((dim, coord), &len) in dims.iter().zip(coords.iter()).zip(values.shape()) {
            if coord.len() != len {
                return Err(LabeledError::CoordLength {
                    dim: dim.clone(),
                    labels: coord.len(),
                    len,
                });
            }
        }
        Ok(Self {
            dims,
            coords,
            values,
        })
    }

    pub fn dims(&self) -> &[String] {
        &self.dims
    }

    pub fn spans(&self, dim: &str) -> bool {
        self.dims.iter().any(|d| d == dim)
    }

    pub fn axis(&self, dim: &str) -> Result<usize, LabeledError> {
        self.dims
            .iter()
            .position(|d| d == dim)
            .ok_or_else(|| LabeledError::MissingDim(dim.to_string()))
    }

    pub fn coords(&self, dim: &str) -> Result<&Coords, LabeledError> {
        Ok(&self.coords[self.axis(dim)?])
    }

    pub fn sizes(&self) -> BTreeMap<String, usize> {
        self.dims
            .iter()
            .cloned()
            .zip(self.values.shape().iter().copied())
            .collect()
    }

    pub fn values(&self) -> &ArrayD<f64> {
        &self.values
    }

    pub fn view(&self) -> ArrayViewD<'_, f64> {
        self.values.view()
    }

    pub fn into_values(self) -> ArrayD<f64> {
        self.values
    }

    /// Positional sub-selection along one dimension.
    pub fn isel(&self, dim: &str, range: Range<usize>) -> Result<Self, LabeledError> {
        let axis = self.axis(dim)?;
        let out_of_bounds = || LabeledError::OutOfBounds {
            dim: dim.to_string(),
            start: range.start,
            end: range.end,
            len: self.coords[axis].len(),
        };
        let labels = self.coords[axis]
            .slice(range.clone())
            .ok_or_else(out_of_bounds)?;
        let values = self
            .values
            .slice_axis(Axis(axis), Slice::from(range.clone()))
            .to_owned();
        let mut coords = self.coords.clone();
        coords[axis] = labels;
        LabeledArray::new(self.dims.clone(), coords, values)
    }

    /// Label-based selection (and reordering) along one dimension.
    pub fn sel(&self, dim: &str, labels: &Coords) -> Result<Self, LabeledError> {
        let axis = self.axis(dim)?;
        let indices = labels
            .iter()
            .map(|label| {
                self.coords[axis]
                    .position(label)
                    .ok_or_else(|| LabeledError::MissingLabel {
                        dim: dim.to_string(),
                        label: label.to_string(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let values = self.values.select(Axis(axis), &indices);
        let mut coords = self.coords.clone();
        coords[axis] = labels.clone();
        LabeledArray::new(self.dims.clone(), coords, values)
    }

    /// Joins arrays end to end along `dim`; every other dimension must agree.
    pub fn concat(dim: &str, parts: &[LabeledArray]) -> Result<Self, LabeledError> {
        let first = parts.first().ok_or(LabeledError::Empty)?;
        let axis = first.axis(dim)?;
        let compatible = parts.iter().all(|part| {
            part.dims == first.dims
                && part
                    .coords
                    .iter()
                    .zip(first.coords.iter())
                    .enumerate()
                    .all(|(i, (a, b))| i == axis || a == b)
        });
        if !compatible {
            return Err(LabeledError::Incompatible(dim.to_string()));
        }
        let views = parts.iter().map(|part| part.values.view()).collect_vec();
        let values = ndarray::concatenate(Axis(axis), &views)?;
        let mut coords = first.coords.clone();
        coords[axis] = Coords::concat(parts.iter().map(|part| &part.coords[axis]));
        LabeledArray::new(first.dims.clone(), coords, values)
    }
}

#[cfg(test)]
mod tests {
    use ndarray::{Array, IxDyn};
    use pretty_assertions::assert_eq;

    use super::*;

    fn grid() -> LabeledArray {
        let values = Array::from_shape_fn(IxDyn(&[2, 5]), |idx| (idx[0] * 10 + idx[1]) as f64);
        LabeledArray::new(
            ["strain", "position"],
            vec![Coords::range(2), Coords::new(["a", "b", "c", "d", "e"])],
            values,
        )
        .unwrap()
    }

    #[test]
    fn rejects_mislabeled_axes() {
        let values = ArrayD::zeros(IxDyn(&[2, 3]));
        let err = LabeledArray::new(
            ["strain", "position"],
            vec![Coords::range(2), Coords::range(4)],
            values,
        );
        assert!(matches!(err, Err(LabeledError::CoordLength { .. })));
    }

    #[test]
    fn isel_then_concat_restores() {
        let arr = grid();
        let left = arr.isel("position", 0..2).unwrap();
        let right = arr.isel("position", 2..5).unwrap();
        assert_eq!(left.coords("position").unwrap(), &Coords::new(["a", "b"]));
        let joined = LabeledArray::concat("position", &[left, right]).unwrap();
        assert_eq!(joined, arr);
    }

    #[test]
    fn isel_out_of_range_is_an_error() {
        let arr = grid();
        assert!(matches!(
            arr.isel("position", 3..7),
            Err(LabeledError::OutOfBounds { len: 5, .. })
        ));
        #[allow(clippy::reversed_empty_ranges)]
        let reversed = 4..2;
        assert!(arr.isel("position", reversed).is_err());
        assert_eq!(arr.isel("position", 5..5).unwrap().sizes()["position"], 0);
        assert_eq!(Coords::range(3).slice(2..4), None);
    }

    #[test]
    fn sel_reorders_by_label() {
        let arr = grid();
        let picked = arr.sel("position", &Coords::new(["e", "a"])).unwrap();
        assert_eq!(picked.values()[[1, 0]], 14.);
        assert_eq!(picked.values()[[1, 1]], 10.);
        assert!(arr.sel("position", &Coords::new(["z"])).is_err());
    }
}
