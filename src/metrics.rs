use ndarray::{array, ArrayView1, Axis};
use serde::Serialize;
use crate::error::{SurvError, Result};
use crate::optimization::{Objective, PartialLikelihood, Ties};

/// Harrell's C-index with tie handling - how often does the host with the
/// higher risk score die first?
pub fn harrell_c_index(
    risk_scores: ArrayView1<f64>,
    times: ArrayView1<f64>,
    events: ArrayView1<bool>,
) -> Result<f64> {
    let n = risk_scores.len();
    if n != times.len() || n != events.len() {
        return Err(SurvError::invalid_dimensions(
            "risk scores, times, and events must have same length"
        ));
    }
    if n < 2 {
        return Err(SurvError::invalid_dimensions(
            "need at least 2 samples for concordance"
        ));
    }

    let mut concordant = 0.0;
    let mut discordant = 0.0;
    let mut tied_risk = 0.0;

    for i in 0..n {
        if !events[i] {
            continue; // censored hosts can't anchor a pair
        }

        for j in 0..n {
            if i == j {
                continue;
            }

            // j outlived i, or was censored no earlier than i died
            if times[j] > times[i] || (!events[j] && times[j] >= times[i]) {
                if risk_scores[i] > risk_scores[j] {
                    concordant += 1.0;
                } else if risk_scores[i] < risk_scores[j] {
                    discordant += 1.0;
                } else {
                    tied_risk += 1.0;
                }
            }
        }
    }

    let total_pairs = concordant + discordant + tied_risk;
    if total_pairs == 0.0 {
        return Err(SurvError::numerical_error(
            "no comparable pairs for C-index calculation"
        ));
    }

    Ok((concordant + 0.5 * tied_risk) / total_pairs)
}

/// log partial likelihood of fixed risk scores (breslow ties)
pub fn log_partial_likelihood(
    risk_scores: ArrayView1<f64>,
    times: ArrayView1<f64>,
    events: ArrayView1<bool>,
) -> Result<f64> {
    let scores = risk_scores.insert_axis(Axis(1)).to_owned();
    let likelihood = PartialLikelihood::new(times, events, scores, Ties::Breslow)?;
    Ok(likelihood.evaluate(&array![1.0])?.value)
}

/// AIC (Akaike Information Criterion)
pub fn aic(log_likelihood: f64, n_parameters: usize) -> f64 {
    2.0 * n_parameters as f64 - 2.0 * log_likelihood
}

/// BIC with the number of deaths as the effective sample size, as is usual
/// for partial likelihoods
pub fn bic(log_likelihood: f64, n_parameters: usize, n_events: usize) -> f64 {
    (n_parameters as f64) * (n_events.max(1) as f64).ln() - 2.0 * log_likelihood
}

/// comparison row for one fitted model
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelMetrics {
    pub model: String,
    pub log_likelihood: Option<f64>,
    pub n_parameters: usize,
    pub aic: Option<f64>,
    pub bic: Option<f64>,
    pub c_index: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::Array1;

    #[test]
    fn test_perfect_concordance() {
        let times = Array1::from(vec![1.0, 2.0, 3.0, 4.0]);
        let events = Array1::from(vec![true, true, true, true]);
        let risk_scores = Array1::from(vec![4.0, 3.0, 2.0, 1.0]);

        let c = harrell_c_index(risk_scores.view(), times.view(), events.view()).unwrap();
        assert_relative_eq!(c, 1.0, epsilon = 1e-10);

        let reversed = risk_scores.mapv(|r| -r);
        let c = harrell_c_index(reversed.view(), times.view(), events.view()).unwrap();
        assert_relative_eq!(c, 0.0, epsilon = 1e-10);
    }

    #[test]
    fn test_ties_count_half() {
        let times = Array1::from(vec![1.0, 2.0]);
        let events = Array1::from(vec![true, true]);
        let risk_scores = Array1::from(vec![0.5, 0.5]);
        let c = harrell_c_index(risk_scores.view(), times.view(), events.view()).unwrap();
        assert_relative_eq!(c, 0.5, epsilon = 1e-10);
    }

    #[test]
    fn test_all_censored_has_no_pairs() {
        let times = Array1::from(vec![1.0, 2.0]);
        let events = Array1::from(vec![false, false]);
        let risk_scores = Array1::from(vec![0.1, 0.2]);
        assert!(harrell_c_index(risk_scores.view(), times.view(), events.view()).is_err());
    }

    #[test]
    fn test_dimension_mismatch_error() {
        let risk_scores = Array1::from(vec![1.0, 2.0]);
        let times = Array1::from(vec![1.0, 2.0, 3.0]);
        let events = Array1::from(vec![true, false]);
        assert!(harrell_c_index(risk_scores.view(), times.view(), events.view()).is_err());
    }

    #[test]
    fn test_log_partial_likelihood() {
        // no ties, zero scores: -sum ln(risk set size)
        let times = Array1::from(vec![1.0, 2.0, 3.0]);
        let events = Array1::from(vec![true, true, true]);
        let flat = Array1::zeros(3);
        let ll = log_partial_likelihood(flat.view(), times.view(), events.view()).unwrap();
        assert_relative_eq!(ll, -(3.0_f64.ln() + 2.0_f64.ln()), epsilon = 1e-12);

        // ordering risk with death order beats reversing it
        let good = Array1::from(vec![2.0, 1.0, 0.0]);
        let bad = Array1::from(vec![0.0, 1.0, 2.0]);
        let ll_good = log_partial_likelihood(good.view(), times.view(), events.view()).unwrap();
        let ll_bad = log_partial_likelihood(bad.view(), times.view(), events.view()).unwrap();
        assert!(ll_good > ll_bad);
    }

    #[test]
    fn test_aic_bic() {
        let aic_score = aic(-10.0, 3);
        let bic_score = bic(-10.0, 3, 100);
        assert_relative_eq!(aic_score, 26.0);
        assert_relative_eq!(bic_score, 3.0 * 100.0_f64.ln() + 20.0);
        assert!(bic_score > aic_score);
    }
}
