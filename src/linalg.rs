//! small dense linear algebra on ndarray - enough for newton steps and
//! variance matrices of a few dozen parameters

use ndarray::{Array1, Array2};
use crate::error::{SurvError, Result};

const PIVOT_EPS: f64 = 1e-12;

/// Solve linear system Ax = b (partial pivoting)
pub fn solve(a: &Array2<f64>, b: &Array1<f64>) -> Result<Array1<f64>> {
    let n = a.nrows();
    if n != a.ncols() || n != b.len() {
        return Err(SurvError::invalid_dimensions("Matrix dimensions mismatch"));
    }

    let mut a_copy = a.clone();
    let mut b_copy = b.clone();

    // Forward elimination
    for i in 0..n {
        let mut max_row = i;
        for k in i + 1..n {
            if a_copy[[k, i]].abs() > a_copy[[max_row, i]].abs() {
                max_row = k;
            }
        }

        if a_copy[[max_row, i]].abs() < PIVOT_EPS {
            return Err(SurvError::numerical_error("Matrix is singular"));
        }

        if max_row != i {
            for j in 0..n {
                a_copy.swap([i, j], [max_row, j]);
            }
            b_copy.swap(i, max_row);
        }

        for k in i + 1..n {
            let factor = a_copy[[k, i]] / a_copy[[i, i]];
            for j in i..n {
                a_copy[[k, j]] -= factor * a_copy[[i, j]];
            }
            b_copy[k] -= factor * b_copy[i];
        }
    }

    // Back substitution
    let mut x = Array1::zeros(n);
    for i in (0..n).rev() {
        x[i] = b_copy[i];
        for j in i + 1..n {
            x[i] -= a_copy[[i, j]] * x[j];
        }
        x[i] /= a_copy[[i, i]];
    }

    Ok(x)
}

/// Gauss-Jordan inverse
pub fn inverse(a: &Array2<f64>) -> Result<Array2<f64>> {
    let n = a.nrows();
    if n != a.ncols() {
        return Err(SurvError::invalid_dimensions("can only invert square matrices"));
    }

    let mut work = a.clone();
    let mut inv = Array2::eye(n);

    for i in 0..n {
        let mut max_row = i;
        for k in i + 1..n {
            if work[[k, i]].abs() > work[[max_row, i]].abs() {
                max_row = k;
            }
        }
        if work[[max_row, i]].abs() < PIVOT_EPS {
            return Err(SurvError::numerical_error("Matrix is singular"));
        }
        if max_row != i {
            for j in 0..n {
                work.swap([i, j], [max_row, j]);
                inv.swap([i, j], [max_row, j]);
            }
        }

        let pivot = work[[i, i]];
        for j in 0..n {
            work[[i, j]] /= pivot;
            inv[[i, j]] /= pivot;
        }

        for k in 0..n {
            if k == i {
                continue;
            }
            let factor = work[[k, i]];
            if factor == 0.0 {
                continue;
            }
            for j in 0..n {
                work[[k, j]] -= factor * work[[i, j]];
                inv[[k, j]] -= factor * inv[[i, j]];
            }
        }
    }

    Ok(inv)
}

/// log determinant of a symmetric positive definite matrix via cholesky
pub fn log_det_spd(a: &Array2<f64>) -> Result<f64> {
    let n = a.nrows();
    if n != a.ncols() {
        return Err(SurvError::invalid_dimensions("log det needs a square matrix"));
    }

    let mut l = Array2::<f64>::zeros((n, n));
    let mut log_det = 0.0;

    for j in 0..n {
        let mut diag = a[[j, j]];
        for k in 0..j {
            diag -= l[[j, k]] * l[[j, k]];
        }
        if diag <= 0.0 || !diag.is_finite() {
            return Err(SurvError::numerical_error(
                format!("matrix not positive definite at column {}", j)
            ));
        }
        let d = diag.sqrt();
        l[[j, j]] = d;
        log_det += 2.0 * d.ln();

        for i in j + 1..n {
            let mut s = a[[i, j]];
            for k in 0..j {
                s -= l[[i, k]] * l[[j, k]];
            }
            l[[i, j]] = s / d;
        }
    }

    Ok(log_det)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    #[test]
    fn test_solve() {
        let a = array![[4.0, 1.0], [1.0, 3.0]];
        let b = array![1.0, 2.0];
        let x = solve(&a, &b).unwrap();
        assert_relative_eq!(x[0], 1.0 / 11.0, epsilon = 1e-12);
        assert_relative_eq!(x[1], 7.0 / 11.0, epsilon = 1e-12);
    }

    #[test]
    fn test_solve_needs_pivoting() {
        let a = array![[0.0, 1.0], [1.0, 0.0]];
        let b = array![2.0, 3.0];
        let x = solve(&a, &b).unwrap();
        assert_relative_eq!(x[0], 3.0, epsilon = 1e-12);
        assert_relative_eq!(x[1], 2.0, epsilon = 1e-12);
    }

    #[test]
    fn test_inverse_round_trips_to_identity() {
        let a = array![[2.0, -1.0, 0.0], [-1.0, 2.0, -1.0], [0.0, -1.0, 2.0]];
        let inv = inverse(&a).unwrap();
        let eye = a.dot(&inv);
        for i in 0..3 {
            for j in 0..3 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert_relative_eq!(eye[[i, j]], expected, epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn test_singular() {
        let a = array![[1.0, 2.0], [2.0, 4.0]];
        assert!(inverse(&a).is_err());
        assert!(solve(&a, &array![1.0, 1.0]).is_err());
    }

    #[test]
    fn test_log_det() {
        let a = array![[4.0, 2.0], [2.0, 3.0]];
        assert_relative_eq!(log_det_spd(&a).unwrap(), 8.0_f64.ln(), epsilon = 1e-12);
        assert!(log_det_spd(&array![[1.0, 2.0], [2.0, 1.0]]).is_err());
    }
}
