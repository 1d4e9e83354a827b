//! piecewise-exponential model fitted as a poisson glm on split episodes
//!
//! Each host is split at the cut points into per-interval episodes with an
//! exposure and a 0/1 death indicator. The interval log-hazards have a
//! closed-form maximiser given beta (`exp(alpha_k) = d_k / S0_k(beta)`) so
//! they are profiled out and newton-raphson only runs over beta.

use log::info;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use serde::Serialize;
use crate::{
    analysis::{FitStatistics, SurvivalFit},
    data::SurvivalData,
    error::{SurvError, Result},
    linalg,
    metrics,
    optimization::{Derivatives, NewtonRaphson, Objective},
    report::TermEstimate,
    stats,
};

/// one host's stay in one interval
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Episode {
    pub subject: usize,
    pub interval: usize,
    pub start: f64,
    pub end: f64,
    pub exposure: f64,
    pub status: bool, // died in this interval
}

/// expand hosts into episodes at `cuts` (sorted, positive); time past the
/// last cut is dropped
pub fn split_episodes(data: &SurvivalData, cuts: &[f64]) -> Result<Vec<Episode>> {
    validate_cuts(cuts)?;
    let mut episodes = Vec::new();
    for i in 0..data.n_samples() {
        let t = data.times()[i];
        let mut start = 0.0;
        for (k, &end) in cuts.iter().enumerate() {
            if t <= start {
                break;
            }
            let stop = t.min(end);
            episodes.push(Episode {
                subject: i,
                interval: k,
                start,
                end,
                exposure: stop - start,
                status: data.events()[i] && t <= end,
            });
            start = end;
        }
    }
    Ok(episodes)
}

fn validate_cuts(cuts: &[f64]) -> Result<()> {
    if cuts.is_empty() {
        return Err(SurvError::invalid_parameter("cuts", "[]"));
    }
    if cuts.iter().any(|c| !c.is_finite() || *c <= 0.0) {
        return Err(SurvError::invalid_parameter("cuts", format!("{:?}", cuts)));
    }
    if cuts.windows(2).any(|w| w[0] >= w[1]) {
        return Err(SurvError::invalid_parameter("cuts", "not strictly increasing"));
    }
    Ok(())
}

/// profile poisson log-likelihood in beta
struct ProfileLikelihood<'a> {
    covariates: ArrayView2<'a, f64>,
    episodes: &'a [Episode],
    n_intervals: usize,
}

impl ProfileLikelihood<'_> {
    /// per interval: deaths, S0, S1, S2 at beta
    fn interval_sums(&self, beta: &Array1<f64>) -> (Vec<f64>, Vec<f64>, Vec<Array1<f64>>, Vec<Array2<f64>>) {
        let p = beta.len();
        let risk = self.covariates.dot(beta).mapv(f64::exp);
        let mut deaths = vec![0.0; self.n_intervals];
        let mut s0 = vec![0.0; self.n_intervals];
        let mut s1 = vec![Array1::<f64>::zeros(p); self.n_intervals];
        let mut s2 = vec![Array2::<f64>::zeros((p, p)); self.n_intervals];

        for ep in self.episodes {
            let k = ep.interval;
            let x = self.covariates.row(ep.subject);
            let w = ep.exposure * risk[ep.subject];
            if ep.status {
                deaths[k] += 1.0;
            }
            s0[k] += w;
            s1[k].scaled_add(w, &x);
            for a in 0..p {
                for b in 0..p {
                    s2[k][[a, b]] += w * x[a] * x[b];
                }
            }
        }
        (deaths, s0, s1, s2)
    }
}

impl Objective for ProfileLikelihood<'_> {
    fn dim(&self) -> usize {
        self.covariates.ncols()
    }

    fn evaluate(&self, beta: &Array1<f64>) -> Result<Derivatives> {
        let p = beta.len();
        let (deaths, s0, s1, s2) = self.interval_sums(beta);

        let mut value = 0.0;
        let mut gradient = Array1::<f64>::zeros(p);
        let mut hessian = Array2::<f64>::zeros((p, p));

        for ep in self.episodes.iter().filter(|e| e.status) {
            let x = self.covariates.row(ep.subject);
            value += x.dot(beta) + ep.exposure.ln();
            gradient += &x;
        }

        for k in 0..self.n_intervals {
            let d = deaths[k];
            if d == 0.0 {
                continue;
            }
            if s0[k] <= 0.0 || !s0[k].is_finite() {
                return Err(SurvError::numerical_error("interval exposure sum is non-positive"));
            }
            value += d * d.ln() - d * s0[k].ln() - d;
            let mean = &s1[k] / s0[k];
            gradient.scaled_add(-d, &mean);
            for a in 0..p {
                for b in 0..p {
                    hessian[[a, b]] -= d * (s2[k][[a, b]] / s0[k] - mean[a] * mean[b]);
                }
            }
        }

        Ok(Derivatives { value, gradient, hessian })
    }
}

/// piecewise-exponential (poisson) survival model
#[derive(Debug, Clone)]
pub struct PiecewiseExponentialModel {
    cuts: Option<Vec<f64>>,
    max_iterations: usize,
    tolerance: f64,
    conf_level: f64,
}

impl Default for PiecewiseExponentialModel {
    fn default() -> Self {
        Self {
            cuts: None,
            max_iterations: 50,
            tolerance: 1e-9,
            conf_level: 0.95,
        }
    }
}

impl PiecewiseExponentialModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// interval end points; without them every distinct observed time is a
    /// cut, which makes beta coincide with the breslow cox estimate
    pub fn with_cuts(mut self, cuts: Vec<f64>) -> Self {
        self.cuts = Some(cuts);
        self
    }

    pub fn with_max_iterations(mut self, max_iter: usize) -> Self {
        self.max_iterations = max_iter;
        self
    }

    pub fn with_tolerance(mut self, tol: f64) -> Self {
        self.tolerance = tol;
        self
    }

    pub fn with_conf_level(mut self, conf_level: f64) -> Self {
        self.conf_level = conf_level;
        self
    }

    pub fn fit(&self, data: &SurvivalData) -> Result<PiecewiseFit> {
        let critical = stats::normal_critical(self.conf_level)?;
        if data.n_events() == 0 {
            return Err(SurvError::invalid_survival_data("no deaths observed - nothing to fit"));
        }

        let cuts = match &self.cuts {
            Some(cuts) => cuts.clone(),
            None => {
                let mut times = data.times().to_vec();
                times.sort_by(f64::total_cmp);
                times.dedup();
                times
            }
        };
        let episodes = split_episodes(data, &cuts)?;

        let objective = ProfileLikelihood {
            covariates: data.covariates(),
            episodes: &episodes,
            n_intervals: cuts.len(),
        };
        let p = objective.dim();
        let solver = NewtonRaphson::new(self.max_iterations, self.tolerance);
        let result = solver.maximize(&objective, Array1::zeros(p))?;

        let information = result.derivatives.hessian.mapv(|h| -h);
        let variance = linalg::inverse(&information)?;

        let (deaths, s0, _, _) = objective.interval_sums(&result.params);
        let mut intervals = Vec::with_capacity(cuts.len());
        let mut start = 0.0;
        for (k, &end) in cuts.iter().enumerate() {
            let exposure: f64 = episodes
                .iter()
                .filter(|e| e.interval == k)
                .map(|e| e.exposure)
                .sum();
            intervals.push(IntervalHazard {
                start,
                end,
                deaths: deaths[k] as usize,
                exposure,
                hazard: if deaths[k] > 0.0 { deaths[k] / s0[k] } else { 0.0 },
            });
            start = end;
        }

        let n_parameters = p + intervals.iter().filter(|iv| iv.deaths > 0).count();
        let log_likelihood = result.derivatives.value;

        info!(
            "pwe: {} intervals, {} episodes, loglik {:.4} after {} iterations",
            cuts.len(), episodes.len(), log_likelihood, result.iterations
        );

        Ok(PiecewiseFit {
            coefficients: result.params,
            variance,
            term_names: data.term_names().to_vec(),
            intervals,
            log_likelihood,
            n_parameters,
            n_episodes: episodes.len(),
            n_samples: data.n_samples(),
            n_events: data.n_events(),
            critical,
        })
    }
}

/// baseline hazard rate in one interval (covariates at zero)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IntervalHazard {
    pub start: f64,
    pub end: f64,
    pub deaths: usize,
    pub exposure: f64,
    pub hazard: f64,
}

/// fitted piecewise-exponential model
#[derive(Debug, Clone)]
pub struct PiecewiseFit {
    coefficients: Array1<f64>,
    variance: Array2<f64>,
    term_names: Vec<String>,
    intervals: Vec<IntervalHazard>,
    log_likelihood: f64,
    n_parameters: usize,
    n_episodes: usize,
    n_samples: usize,
    n_events: usize,
    critical: f64,
}

impl PiecewiseFit {
    pub fn coefficients(&self) -> ArrayView1<'_, f64> {
        self.coefficients.view()
    }

    pub fn standard_errors(&self) -> Array1<f64> {
        self.variance.diag().mapv(|v| v.max(0.0).sqrt())
    }

    pub fn intervals(&self) -> &[IntervalHazard] {
        &self.intervals
    }

    /// full poisson log-likelihood (interval hazards at their mle)
    pub fn log_likelihood(&self) -> f64 {
        self.log_likelihood
    }

    pub fn n_episodes(&self) -> usize {
        self.n_episodes
    }

    pub fn aic(&self) -> f64 {
        metrics::aic(self.log_likelihood, self.n_parameters)
    }

    /// S(t) for covariates x: exp(-sum hazard_k * exposure_k(t) * exp(x beta))
    pub fn predict_survival(&self, x: ArrayView1<f64>, t: f64) -> Result<f64> {
        if x.len() != self.coefficients.len() {
            return Err(SurvError::invalid_dimensions(
                format!("expected {} covariates, got {}", self.coefficients.len(), x.len())
            ));
        }
        let risk = x.dot(&self.coefficients).exp();
        let cumulative: f64 = self.intervals
            .iter()
            .filter(|iv| t > iv.start)
            .map(|iv| iv.hazard * (t.min(iv.end) - iv.start))
            .sum();
        Ok((-cumulative * risk).exp())
    }
}

impl SurvivalFit for PiecewiseFit {
    fn model_name(&self) -> &str {
        "pwe"
    }

    fn tidy(&self) -> Vec<TermEstimate> {
        let se = self.standard_errors();
        self.term_names
            .iter()
            .enumerate()
            .map(|(j, term)| {
                let estimate = self.coefficients[j];
                let z = estimate / se[j];
                TermEstimate {
                    model: "pwe".to_string(),
                    term: term.clone(),
                    estimate,
                    std_error: se[j],
                    statistic: Some(z),
                    p_value: Some(stats::two_sided_p(z)),
                    conf_low: estimate - self.critical * se[j],
                    conf_high: estimate + self.critical * se[j],
                }
            })
            .collect()
    }

    fn fit_statistics(&self) -> FitStatistics {
        FitStatistics {
            model: "pwe".to_string(),
            log_likelihood: Some(self.log_likelihood),
            n_parameters: self.n_parameters,
            n_samples: self.n_samples,
            n_events: self.n_events,
        }
    }

    fn risk_scores(&self, covariates: ArrayView2<f64>) -> Option<Array1<f64>> {
        (covariates.ncols() == self.coefficients.len()).then(|| covariates.dot(&self.coefficients))
    }
}
