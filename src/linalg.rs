//! Dense linear algebra and random variates used by the conditional updates.
//!
//! Everything here works on `faer` matrices. Factorization failures and
//! non-finite input are reported as [`VcmError::SingularMatrix`] so that a
//! chain stops instead of silently producing NaN draws.

use faer::linalg::solvers::{Llt, Solve};
use faer::{Col, ColRef, Mat, MatRef, Side};
use rand::Rng;
use rand_distr::{Distribution, Gamma, StandardNormal};

use crate::error::{Result, VcmError};

fn mat_all_finite(mat: MatRef<'_, f64>) -> bool {
    mat.col_iter().all(|col| col.iter().all(|val| val.is_finite()))
}

fn col_all_finite(col: ColRef<'_, f64>) -> bool {
    col.iter().all(|val| val.is_finite())
}

fn cholesky(mat: MatRef<'_, f64>, what: &'static str) -> Result<Llt<f64>> {
    if mat.nrows() != mat.ncols() {
        return Err(VcmError::shape(
            what,
            "square matrix",
            format!("{}x{}", mat.nrows(), mat.ncols()),
        ));
    }
    if !mat_all_finite(mat) {
        return Err(VcmError::singular(what));
    }
    Llt::new(mat, Side::Lower).map_err(|_| VcmError::singular(what))
}

/// Inverse of a symmetric positive definite matrix.
///
/// The result is symmetrized, so it can be factorized again by
/// [`sample_mvn`] without drifting away from symmetry.
pub fn invert(mat: MatRef<'_, f64>, what: &'static str) -> Result<Mat<f64>> {
    let dim = mat.nrows();
    if dim == 0 && mat.ncols() == 0 {
        return Ok(Mat::zeros(0, 0));
    }
    let llt = cholesky(mat, what)?;
    let identity = Mat::<f64>::identity(dim, dim);
    let inv = llt.solve(identity.as_ref());
    if !mat_all_finite(inv.as_ref()) {
        return Err(VcmError::singular(what));
    }
    Ok(Mat::from_fn(dim, dim, |i, j| 0.5 * (inv[(i, j)] + inv[(j, i)])))
}

/// Draw from `N(mean, covariance)` as `mean + L z` where `L Lᵗ = covariance`.
pub fn sample_mvn<R: Rng + ?Sized>(
    rng: &mut R,
    mean: ColRef<'_, f64>,
    covariance: MatRef<'_, f64>,
    what: &'static str,
) -> Result<Col<f64>> {
    let dim = mean.nrows();
    if covariance.nrows() != dim || covariance.ncols() != dim {
        return Err(VcmError::shape(
            what,
            format!("{dim}x{dim} covariance"),
            format!("{}x{}", covariance.nrows(), covariance.ncols()),
        ));
    }
    if dim == 0 {
        return Ok(Col::zeros(0));
    }
    if !col_all_finite(mean) {
        return Err(VcmError::singular(what));
    }
    let llt = cholesky(covariance, what)?;

    let normals: Vec<f64> = (0..dim).map(|_| StandardNormal.sample(rng)).collect();
    let z = Col::from_fn(dim, |i| normals[i]);
    let shift = llt.L() * z.as_ref();

    Ok(Col::from_fn(dim, |i| mean[i] + shift[i]))
}

/// Draw from an inverse gamma distribution with density proportional to
/// `x^(-shape - 1) exp(-scale / x)`.
pub fn sample_invgamma<R: Rng + ?Sized>(
    rng: &mut R,
    shape: f64,
    scale: f64,
    what: &'static str,
) -> Result<f64> {
    let invalid = || VcmError::InvalidDistribution { what, shape, scale };
    if !(shape > 0.0 && shape.is_finite() && scale > 0.0 && scale.is_finite()) {
        return Err(invalid());
    }
    let gamma = Gamma::new(shape, scale.recip()).map_err(|_| invalid())?;
    Ok(gamma.sample(rng).recip())
}

/// `scalar * I(dimension)` as a dense matrix.
pub fn diag_covariance(dimension: usize, scalar: f64) -> Mat<f64> {
    Mat::from_fn(dimension, dimension, |i, j| if i == j { scalar } else { 0f64 })
}

/// Scaled identity `scale * I(dim)`.
///
/// The independence structures of both levels are of this form, so
/// there is no need to hold an `N x N` matrix for the residual covariance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScaledIdentity {
    dim: usize,
    scale: f64,
}

impl ScaledIdentity {
    pub fn new(dim: usize, scale: f64) -> Self {
        Self { dim, scale }
    }

    pub fn identity(dim: usize) -> Self {
        Self::new(dim, 1f64)
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    /// Fails unless both `scale` and its reciprocal are finite and positive.
    pub fn try_inverse(&self, what: &'static str) -> Result<Self> {
        let inv = self.scale.recip();
        if !(self.scale > 0.0 && self.scale.is_finite() && inv.is_finite()) {
            return Err(VcmError::singular(what));
        }
        Ok(Self::new(self.dim, inv))
    }

    /// `vᵗ (scale I) v`
    pub fn quad_form(&self, v: ColRef<'_, f64>) -> f64 {
        self.scale * v.iter().map(|x| x * x).sum::<f64>()
    }

    pub fn to_dense(&self) -> Mat<f64> {
        diag_covariance(self.dim, self.scale)
    }
}
