//! distribution helpers shared by the estimators

use statrs::distribution::{ChiSquared, ContinuousCDF, Normal};
use crate::error::{SurvError, Result};

fn standard_normal() -> Normal {
    // mean 0, sd 1 is always a valid normal
    Normal::new(0.0, 1.0).unwrap_or_else(|_| unreachable!())
}

/// z such that P(|Z| <= z) = conf_level
pub fn normal_critical(conf_level: f64) -> Result<f64> {
    if !(conf_level > 0.0 && conf_level < 1.0) {
        return Err(SurvError::invalid_parameter("conf_level", conf_level));
    }
    Ok(standard_normal().inverse_cdf(1.0 - (1.0 - conf_level) / 2.0))
}

/// two-sided p-value of a wald statistic
pub fn two_sided_p(z: f64) -> f64 {
    if !z.is_finite() {
        return if z.is_nan() { f64::NAN } else { 0.0 };
    }
    2.0 * standard_normal().sf(z.abs())
}

/// upper tail of chi-squared(df)
pub fn chi_squared_sf(x: f64, df: f64) -> f64 {
    if x <= 0.0 {
        return 1.0;
    }
    match ChiSquared::new(df) {
        Ok(dist) => dist.sf(x),
        Err(_) => f64::NAN,
    }
}

/// linear-interpolated quantile of already sorted values
pub fn quantile_sorted(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return f64::NAN;
    }
    let q = q.clamp(0.0, 1.0);
    let pos = q * (sorted.len() as f64 - 1.0);
    let i0 = pos.floor() as usize;
    let i1 = pos.ceil() as usize;
    if i0 == i1 {
        return sorted[i0];
    }
    let f = pos - i0 as f64;
    sorted[i0] * (1.0 - f) + sorted[i1] * f
}

/// mean and sample standard deviation
pub fn mean_sd(values: &[f64]) -> (f64, f64) {
    let n = values.len();
    if n == 0 {
        return (f64::NAN, f64::NAN);
    }
    let mean = values.iter().sum::<f64>() / n as f64;
    if n < 2 {
        return (mean, f64::NAN);
    }
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n as f64 - 1.0);
    (mean, var.sqrt())
}
