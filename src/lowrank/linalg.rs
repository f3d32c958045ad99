//! Dense linear algebra on the factor matrices
//!
//! Factors live in `nalgebra` matrices; tensors hand over row-major data.

use crate::error::{Error, Result};
use nalgebra::DMatrix;

pub type Matrix = DMatrix<f32>;

/// Build a matrix from row-major data
pub fn from_row_major(data: &[f32], rows: usize, cols: usize) -> Matrix {
    DMatrix::from_row_slice(rows, cols, data)
}

/// Flatten a matrix into row-major order
pub fn to_row_major(m: &Matrix) -> Vec<f32> {
    m.transpose().as_slice().to_vec()
}

fn ensure_finite(m: &Matrix, what: &str) -> Result<()> {
    if m.iter().all(|x| x.is_finite()) {
        Ok(())
    } else {
        Err(Error::Linalg(format!("{what}: matrix contains non-finite entries")))
    }
}

/// Thin QR decomposition with a non-negative diagonal on `R`
///
/// `Q` is `rows × min(rows, cols)` with orthonormal columns. Fixing the signs
/// makes the factorization unique for full-rank inputs, so re-orthonormalizing
/// an already orthonormal basis returns it unchanged.
pub fn qr(a: &Matrix) -> Result<(Matrix, Matrix)> {
    ensure_finite(a, "qr")?;
    let qr = a.clone().qr();
    let mut q = qr.q();
    let mut r = qr.r();
    for i in 0..r.nrows().min(r.ncols()) {
        if r[(i, i)] < 0.0 {
            q.column_mut(i).neg_mut();
            r.row_mut(i).neg_mut();
        }
    }
    Ok((q, r))
}

/// Singular value decomposition `A = U · diag(σ) · Vᵀ` with σ descending
#[derive(Debug, Clone)]
pub struct Svd {
    pub u: Matrix,
    pub singular_values: Vec<f32>,
    pub v: Matrix,
}

pub fn svd(a: &Matrix) -> Result<Svd> {
    ensure_finite(a, "svd")?;
    let decomposition = a
        .clone()
        .try_svd(true, true, f32::EPSILON, 0)
        .ok_or_else(|| Error::Linalg("svd did not converge".to_string()))?;
    let (Some(u), Some(v_t)) = (decomposition.u, decomposition.v_t) else {
        return Err(Error::Linalg("svd returned no singular vectors".to_string()));
    };
    let sigma = decomposition.singular_values;

    let mut order: Vec<usize> = (0..sigma.len()).collect();
    order.sort_by(|&a, &b| sigma[b].total_cmp(&sigma[a]));

    Ok(Svd {
        u: Matrix::from_fn(u.nrows(), order.len(), |i, j| u[(i, order[j])]),
        singular_values: order.iter().map(|&i| sigma[i]).collect(),
        v: Matrix::from_fn(v_t.ncols(), order.len(), |i, j| v_t[(order[j], i)]),
    })
}

impl Svd {
    /// Keep the leading `rank` triplets as `(U, S, V)` with `S` diagonal
    pub fn truncate(&self, rank: usize) -> (Matrix, Matrix, Matrix) {
        let rank = rank.min(self.singular_values.len());
        let s = Matrix::from_diagonal(&nalgebra::DVector::from_column_slice(
            &self.singular_values[..rank],
        ));
        (
            self.u.columns(0, rank).into_owned(),
            s,
            self.v.columns(0, rank).into_owned(),
        )
    }
}

/// Largest deviation of `QᵀQ` from the identity
pub fn orthonormality_error(q: &Matrix) -> f32 {
    let gram = q.transpose() * q;
    let n = gram.nrows();
    (gram - Matrix::identity(n, n)).amax()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample(rows: usize, cols: usize) -> Matrix {
        Matrix::from_fn(rows, cols, |i, j| ((i * 7 + j * 3) % 5) as f32 - 2.0 + 0.1 * i as f32)
    }

    #[test]
    fn test_row_major_round_trip() {
        let data = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let m = from_row_major(&data, 2, 3);
        assert_eq!(m[(0, 2)], 3.0);
        assert_eq!(m[(1, 0)], 4.0);
        assert_eq!(to_row_major(&m), data);
    }

    #[test]
    fn test_qr_reconstructs_and_is_orthonormal() {
        let a = sample(6, 3);
        let (q, r) = qr(&a).unwrap();
        assert_eq!(q.shape(), (6, 3));
        assert!(orthonormality_error(&q) < 1e-5);
        assert!((q * &r - &a).amax() < 1e-4);
        for i in 0..3 {
            assert!(r[(i, i)] >= 0.0);
        }
    }

    #[test]
    fn test_qr_of_orthonormal_basis_is_identity_map() {
        let (q, _) = qr(&sample(5, 2)).unwrap();
        let (q2, r2) = qr(&q).unwrap();
        assert!((q2 - &q).amax() < 1e-5);
        assert!((r2 - Matrix::identity(2, 2)).amax() < 1e-5);
    }

    #[test]
    fn test_qr_wide_matrix() {
        let (q, r) = qr(&sample(3, 5)).unwrap();
        assert_eq!(q.shape(), (3, 3));
        assert_eq!(r.shape(), (3, 5));
    }

    #[test]
    fn test_svd_sorted_and_reconstructs() {
        let a = sample(4, 4);
        let svd = svd(&a).unwrap();
        for w in svd.singular_values.windows(2) {
            assert!(w[0] >= w[1]);
        }
        let (u, s, v) = svd.truncate(4);
        assert!((u * s * v.transpose() - &a).amax() < 1e-4);
    }

    #[test]
    fn test_svd_truncate_shapes() {
        let svd = svd(&sample(5, 3)).unwrap();
        let (u, s, v) = svd.truncate(2);
        assert_eq!(u.shape(), (5, 2));
        assert_eq!(s.shape(), (2, 2));
        assert_eq!(v.shape(), (3, 2));
        assert_relative_eq!(s[(0, 0)], svd.singular_values[0]);
    }

    #[test]
    fn test_non_finite_input_is_an_error() {
        let mut a = sample(2, 2);
        a[(0, 0)] = f32::NAN;
        assert!(matches!(svd(&a), Err(Error::Linalg(_))));
        assert!(matches!(qr(&a), Err(Error::Linalg(_))));
    }
}
