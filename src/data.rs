use faer::{Col, Mat};

use crate::error::{Result, VcmError};

/// Response, fixed-effects design and group membership of one model.
///
/// `delta` maps each of the `N` observations to one of the `J` groups;
/// its rows are expected to be one-hot. Centering, scaling and building
/// `delta` from group labels happen before the data reach this type.
#[derive(Debug, Clone)]
pub struct Observations {
    y: Col<f64>,
    x: Mat<f64>,
    delta: Mat<f64>,
}

impl Observations {
    pub fn new(y: Col<f64>, x: Mat<f64>, delta: Mat<f64>) -> Result<Self> {
        let n = y.nrows();
        if x.nrows() != n {
            return Err(VcmError::shape(
                "design matrix X",
                format!("{n} rows"),
                format!("{} rows", x.nrows()),
            ));
        }
        if delta.nrows() != n {
            return Err(VcmError::shape(
                "membership matrix Delta",
                format!("{n} rows"),
                format!("{} rows", delta.nrows()),
            ));
        }
        Ok(Self { y, x, delta })
    }

    /// Build from row-major slices, the layout most tabular readers produce.
    pub fn from_row_major(y: &[f64], x: &[f64], p: usize, delta: &[f64], j: usize) -> Result<Self> {
        let n = y.len();
        if x.len() != n * p {
            return Err(VcmError::shape(
                "design matrix X",
                format!("{} values ({n}x{p})", n * p),
                x.len(),
            ));
        }
        if delta.len() != n * j {
            return Err(VcmError::shape(
                "membership matrix Delta",
                format!("{} values ({n}x{j})", n * j),
                delta.len(),
            ));
        }
        Self::new(
            Col::from_fn(n, |i| y[i]),
            Mat::from_fn(n, p, |i, k| x[i * p + k]),
            Mat::from_fn(n, j, |i, k| delta[i * j + k]),
        )
    }

    pub fn y(&self) -> &Col<f64> {
        &self.y
    }

    pub fn x(&self) -> &Mat<f64> {
        &self.x
    }

    pub fn delta(&self) -> &Mat<f64> {
        &self.delta
    }

    /// Number of observations.
    pub fn n(&self) -> usize {
        self.y.nrows()
    }

    /// Number of fixed effects.
    pub fn p(&self) -> usize {
        self.x.ncols()
    }

    /// Number of groups.
    pub fn j(&self) -> usize {
        self.delta.ncols()
    }
}
