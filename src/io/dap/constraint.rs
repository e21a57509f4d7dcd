//! DAP2 constraint expressions built from dimension subsets.

use super::dds::FlatVariable;
use super::DapError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A half-open selection along one dimension, `start..stop` every `step`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimSlice {
    #[serde(default)]
    pub start: usize,

    /// Exclusive; `None` runs to the end of the dimension
    #[serde(default)]
    pub stop: Option<usize>,

    #[serde(default = "default_step")]
    pub step: usize,
}

fn default_step() -> usize {
    1
}

impl DimSlice {
    pub fn new(start: usize, stop: Option<usize>, step: usize) -> Self {
        Self { start, stop, step }
    }

    /// Resolve against a dimension length as `(start, step, inclusive stop, count)`.
    pub fn resolve(&self, dim: &str, len: usize) -> Result<(usize, usize, usize, usize), DapError> {
        if self.step == 0 {
            return Err(DapError::InvalidSubset(format!("step for {:?} must be > 0", dim)));
        }
        let stop = self.stop.unwrap_or(len).min(len);
        if self.start >= stop {
            return Err(DapError::InvalidSubset(format!(
                "selection {}..{} of {:?} (length {}) is empty",
                self.start, stop, dim, len
            )));
        }
        let count = (stop - self.start).div_ceil(self.step);
        let last = self.start + (count - 1) * self.step;
        Ok((self.start, self.step, last, count))
    }

    /// Length of the selection along a dimension of length `len`.
    pub fn selected_len(&self, dim: &str, len: usize) -> Result<usize, DapError> {
        self.resolve(dim, len).map(|(_, _, _, count)| count)
    }
}

/// Dimension name → selection.
pub type Subset = BTreeMap<String, DimSlice>;

/// Build the projection for `variables` under `subset`.
///
/// An empty subset selects everything and yields an empty expression.
/// Otherwise every variable is listed, with a hyperslab for each of its
/// dimensions when any of them is subset.
pub fn build_constraint(variables: &[FlatVariable], subset: &Subset) -> Result<String, DapError> {
    if subset.is_empty() {
        return Ok(String::new());
    }

    for dim in subset.keys() {
        if !variables.iter().any(|v| v.dims.contains(dim)) {
            return Err(DapError::InvalidSubset(format!(
                "dimension {:?} does not exist in the dataset",
                dim
            )));
        }
    }

    let mut projections = Vec::with_capacity(variables.len());
    for var in variables {
        let mut projection = var.name.clone();
        if var.dims.iter().any(|d| subset.contains_key(d)) {
            for (dim, &len) in var.dims.iter().zip(&var.shape) {
                let (start, step, stop, _) = match subset.get(dim) {
                    Some(slice) => slice.resolve(dim, len)?,
                    None => DimSlice::new(0, None, 1).resolve(dim, len)?,
                };
                projection.push_str(&format!("[{}:{}:{}]", start, step, stop));
            }
        }
        projections.push(projection);
    }
    Ok(projections.join(","))
}

/// Shape of a variable after subsetting.
pub fn subset_shape(var: &FlatVariable, subset: &Subset) -> Result<Vec<usize>, DapError> {
    var.dims
        .iter()
        .zip(&var.shape)
        .map(|(dim, &len)| match subset.get(dim) {
            Some(slice) => slice.selected_len(dim, len),
            None => Ok(len),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::dap::dds::{parse_dds, tests::NARR_DDS};

    fn narr_vars() -> Vec<FlatVariable> {
        parse_dds(NARR_DDS).unwrap().variables().unwrap()
    }

    #[test]
    fn test_empty_subset() {
        assert_eq!(build_constraint(&narr_vars(), &Subset::new()).unwrap(), "");
    }

    #[test]
    fn test_time_subset() {
        let subset = Subset::from([("time".to_string(), DimSlice::new(1, None, 1))]);
        let ce = build_constraint(&narr_vars(), &subset).unwrap();
        assert_eq!(
            ce,
            "time[1:1:1],y,x,air[1:1:1][0:1:2][0:1:3],Lambert_Conformal"
        );

        let air = &narr_vars()[3];
        assert_eq!(subset_shape(air, &subset).unwrap(), vec![1, 3, 4]);
    }

    #[test]
    fn test_strided_subset() {
        let slice = DimSlice::new(0, Some(4), 3);
        assert_eq!(slice.resolve("x", 4).unwrap(), (0, 3, 3, 2));
        // Stop past the end is clamped.
        assert_eq!(DimSlice::new(1, Some(100), 1).selected_len("x", 4).unwrap(), 3);
    }

    #[test]
    fn test_invalid_subsets() {
        let vars = narr_vars();
        let unknown = Subset::from([("level".to_string(), DimSlice::new(0, None, 1))]);
        assert!(build_constraint(&vars, &unknown).is_err());

        assert!(DimSlice::new(0, None, 0).resolve("x", 4).is_err());
        assert!(DimSlice::new(4, None, 1).resolve("x", 4).is_err());
        assert!(DimSlice::new(2, Some(2), 1).resolve("x", 4).is_err());
    }
}
