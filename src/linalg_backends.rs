// src/linalg_backends.rs

use crate::error::BackendError;
use ndarray::{Array1, Array2, ArrayView2};
use ndarray_linalg::{Eigh as NdLinalgEigh, JobSvd, SVDDCInto as NdLinalgSVDDCInto, QR as NdLinalgQR, UPLO};
use std::marker::PhantomData;

/// Output of a symmetric eigendecomposition.
#[derive(Debug)]
pub struct EighOutput {
    /// Eigenvalues in ascending order.
    pub eigenvalues: Array1<f64>,
    /// eigenvectors.column(i) corresponds to eigenvalues[i].
    pub eigenvectors: Array2<f64>,
}

/// Output of a Singular Value Decomposition.
#[derive(Debug)]
pub struct SVDOutput {
    pub u: Option<Array2<f64>>,
    /// Singular values, descending.
    pub s: Array1<f64>,
    pub vt: Option<Array2<f64>>,
}

/// Symmetric eigendecomposition (LAPACK DSYEVD family). `matrix` must be symmetric.
pub trait BackendEigh {
    fn eigh_upper(&self, matrix: &Array2<f64>) -> Result<EighOutput, BackendError>;
}

/// QR decomposition, keeping only the (reduced) Q factor.
pub trait BackendQR {
    fn qr_q_factor(&self, matrix: &Array2<f64>) -> Result<Array2<f64>, BackendError>;
}

/// Singular Value Decomposition.
pub trait BackendSVD {
    /// Economy SVD: U is m×k and Vᵀ is k×n with k = min(m, n).
    fn svd_thin(&self, matrix: Array2<f64>) -> Result<SVDOutput, BackendError>;
}

// --- ndarray-linalg (LAPACK) implementation ---

#[derive(Debug, Default, Copy, Clone)]
pub struct NdarrayLinAlgBackend;

fn to_dyn_error<E: std::error::Error + Send + Sync + 'static>(e: E) -> BackendError {
    Box::new(e)
}

impl BackendEigh for NdarrayLinAlgBackend {
    fn eigh_upper(&self, matrix: &Array2<f64>) -> Result<EighOutput, BackendError> {
        let (eigenvalues, eigenvectors) = matrix.eigh(UPLO::Upper).map_err(to_dyn_error)?;
        Ok(EighOutput { eigenvalues, eigenvectors })
    }
}

impl BackendQR for NdarrayLinAlgBackend {
    fn qr_q_factor(&self, matrix: &Array2<f64>) -> Result<Array2<f64>, BackendError> {
        let (q_factor, _r) = matrix.qr().map_err(to_dyn_error)?;
        Ok(q_factor)
    }
}

impl BackendSVD for NdarrayLinAlgBackend {
    fn svd_thin(&self, matrix: Array2<f64>) -> Result<SVDOutput, BackendError> {
        let (u, s, vt) = matrix.svddc_into(JobSvd::Some).map_err(to_dyn_error)?;
        Ok(SVDOutput { u, s, vt })
    }
}

/// Dispatches to the linear algebra backend selected at compile time.
///
/// Every LAPACK provider feature (`backend_openblas`, `backend_mkl`, ...) is
/// reached through `ndarray-linalg`, so the provider forwards to
/// [`NdarrayLinAlgBackend`].
#[derive(Debug, Default, Copy, Clone)]
pub struct LinAlgBackendProvider<F: 'static + Copy + Send + Sync> {
    _phantom: PhantomData<F>,
}

impl<F: 'static + Copy + Send + Sync> LinAlgBackendProvider<F> {
    pub fn new() -> Self {
        Self { _phantom: PhantomData }
    }
}

impl BackendEigh for LinAlgBackendProvider<f64> {
    fn eigh_upper(&self, matrix: &Array2<f64>) -> Result<EighOutput, BackendError> {
        NdarrayLinAlgBackend.eigh_upper(matrix)
    }
}

impl BackendQR for LinAlgBackendProvider<f64> {
    fn qr_q_factor(&self, matrix: &Array2<f64>) -> Result<Array2<f64>, BackendError> {
        NdarrayLinAlgBackend.qr_q_factor(matrix)
    }
}

impl BackendSVD for LinAlgBackendProvider<f64> {
    fn svd_thin(&self, matrix: Array2<f64>) -> Result<SVDOutput, BackendError> {
        NdarrayLinAlgBackend.svd_thin(matrix)
    }
}

/// Moore–Penrose pseudo-inverse via SVD, `A⁺ = V Σ⁺ Uᵀ`.
///
/// Singular values below `rcond · σ_max` are treated as zero.
pub fn pseudo_inverse<B: BackendSVD>(backend: &B, matrix: ArrayView2<f64>, rcond: f64) -> Result<Array2<f64>, BackendError> {
    let (m, n) = matrix.dim();
    if m == 0 || n == 0 {
        return Ok(Array2::zeros((n, m)));
    }
    let svd = backend.svd_thin(matrix.to_owned())?;
    let u = svd.u.ok_or("SVD did not return U for pseudo-inverse")?;
    let vt = svd.vt.ok_or("SVD did not return Vᵀ for pseudo-inverse")?;
    let cutoff = rcond * svd.s.iter().cloned().fold(0.0_f64, f64::max);
    let s_inv = svd.s.mapv(|s| if s > cutoff { 1.0 / s } else { 0.0 });
    // V Σ⁺ Uᵀ, with Σ⁺ applied to the columns of V.
    let v_scaled = vt.t().to_owned() * &s_inv;
    Ok(v_scaled.dot(&u.t()))
}
