//! mixed-effects cox: gaussian random intercept per clone
//!
//! For a fixed frailty variance theta the penalised partial likelihood
//! `PL(beta, b) - b'b / (2 theta)` is maximised by newton-raphson over the
//! fixed effects and the clone effects jointly. theta itself maximises the
//! laplace-approximated integrated likelihood
//! `PPL - (G/2) ln theta - 0.5 ln det(H_bb)`, found by golden-section search
//! on ln theta.

use log::{debug, info};
use ndarray::{s, Array1, Array2, ArrayView1, ArrayView2};
use crate::{
    analysis::{FitStatistics, SurvivalFit},
    data::SurvivalData,
    error::{SurvError, Result},
    linalg,
    model::CoxModel,
    optimization::{Derivatives, NewtonRaphson, Objective, PartialLikelihood, Ties},
    report::TermEstimate,
    stats,
};

const GOLDEN: f64 = 0.618_033_988_749_895;

/// partial likelihood over [X | Z] with a ridge penalty on the Z block
struct PenalizedLikelihood {
    inner: PartialLikelihood,
    n_fixed: usize,
    theta: f64,
}

impl Objective for PenalizedLikelihood {
    fn dim(&self) -> usize {
        self.inner.dim()
    }

    fn evaluate(&self, params: &Array1<f64>) -> Result<Derivatives> {
        let mut d = self.inner.evaluate(params)?;
        for j in self.n_fixed..params.len() {
            d.value -= params[j] * params[j] / (2.0 * self.theta);
            d.gradient[j] -= params[j] / self.theta;
            d.hessian[[j, j]] -= 1.0 / self.theta;
        }
        Ok(d)
    }
}

/// one inner fit at fixed theta
#[derive(Debug, Clone)]
struct InnerFit {
    theta: f64,
    params: Array1<f64>,
    derivatives: Derivatives, // of the penalised objective
    integrated: f64,
    iterations: usize,
}

/// shared-frailty cox model (coxme style)
#[derive(Debug, Clone)]
pub struct FrailtyCoxModel {
    ties: Ties,
    max_iterations: usize,
    tolerance: f64,
    conf_level: f64,
    theta_bounds: (f64, f64), // search range for the frailty variance
    theta_tolerance: f64,     // on ln theta
}

impl Default for FrailtyCoxModel {
    fn default() -> Self {
        Self {
            ties: Ties::Efron,
            max_iterations: 50,
            tolerance: 1e-9,
            conf_level: 0.95,
            theta_bounds: (1e-5, 10.0),
            theta_tolerance: 1e-3,
        }
    }
}

impl FrailtyCoxModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ties(mut self, ties: Ties) -> Self {
        self.ties = ties;
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

    /// range searched for the clone variance
    pub fn with_theta_bounds(mut self, lower: f64, upper: f64) -> Self {
        self.theta_bounds = (lower, upper);
        self
    }

    pub fn fit(&self, data: &SurvivalData) -> Result<FrailtyFit> {
        let critical = stats::normal_critical(self.conf_level)?;
        let (lower, upper) = self.theta_bounds;
        if !(lower > 0.0 && upper > lower && upper.is_finite()) {
            return Err(SurvError::invalid_parameter(
                "theta_bounds", format!("({}, {})", lower, upper)
            ));
        }
        let clusters = data.clusters().ok_or_else(|| {
            SurvError::invalid_survival_data("frailty model needs clone clusters")
        })?;
        let n_groups = clusters.n_clusters();
        if n_groups < 2 {
            return Err(SurvError::invalid_survival_data(
                "frailty model needs at least two clones"
            ));
        }

        // the theta -> 0 limit of the integrated likelihood is the plain cox fit
        let cox = CoxModel::new()
            .with_ties(self.ties)
            .with_max_iterations(self.max_iterations)
            .with_tolerance(self.tolerance)
            .with_conf_level(self.conf_level)
            .fit(data)?;

        let p = data.n_features();
        let design = augmented_design(data, clusters.index(), n_groups);
        let inner = PartialLikelihood::new(data.times(), data.events(), design, self.ties)?;
        let mut objective = PenalizedLikelihood { inner, n_fixed: p, theta: upper };

        let mut start = Array1::zeros(p + n_groups);
        start.slice_mut(s![..p]).assign(&cox.coefficients());

        let mut evaluate = |log_theta: f64, start: &mut Array1<f64>| -> Result<InnerFit> {
            objective.theta = log_theta.exp();
            let fit = self.inner_fit(&objective, start.clone())?;
            start.assign(&fit.params);
            debug!("coxme theta {:.6}: integrated loglik {:.6}", fit.theta, fit.integrated);
            Ok(fit)
        };

        // golden section on ln theta - the integrated likelihood is unimodal in practice
        let (mut a, mut b) = (lower.ln(), upper.ln());
        let mut c = b - GOLDEN * (b - a);
        let mut d = a + GOLDEN * (b - a);
        let mut fc = evaluate(c, &mut start)?;
        let mut fd = evaluate(d, &mut start)?;
        while (b - a).abs() > self.theta_tolerance {
            if fc.integrated > fd.integrated {
                b = d;
                d = c;
                fd = fc;
                c = b - GOLDEN * (b - a);
                fc = evaluate(c, &mut start)?;
            } else {
                a = c;
                c = d;
                fc = fd;
                d = a + GOLDEN * (b - a);
                fd = evaluate(d, &mut start)?;
            }
        }
        let best = if fc.integrated > fd.integrated { fc } else { fd };

        let information = best.derivatives.hessian.mapv(|h| -h);
        let variance = linalg::inverse(&information)?;

        let lrt = (2.0 * (best.integrated - cox.log_likelihood())).max(0.0);
        // theta = 0 sits on the boundary: half chi-squared(1)
        let lrt_p = 0.5 * stats::chi_squared_sf(lrt, 1.0);

        info!(
            "coxme: theta {:.5} (sd {:.4}), integrated loglik {:.4}, cox loglik {:.4}",
            best.theta, best.theta.sqrt(), best.integrated, cox.log_likelihood()
        );

        Ok(FrailtyFit {
            coefficients: best.params.slice(s![..p]).to_owned(),
            clone_effects: best.params.slice(s![p..]).to_owned(),
            clone_labels: clusters.labels().to_vec(),
            variance: variance.slice(s![..p, ..p]).to_owned(),
            term_names: data.term_names().to_vec(),
            theta: best.theta,
            integrated_log_likelihood: best.integrated,
            penalized_log_likelihood: best.derivatives.value,
            cox_log_likelihood: cox.log_likelihood(),
            lrt_statistic: lrt,
            lrt_p_value: lrt_p,
            iterations: best.iterations,
            n_samples: data.n_samples(),
            n_events: data.n_events(),
            critical,
        })
    }

    fn inner_fit(&self, objective: &PenalizedLikelihood, start: Array1<f64>) -> Result<InnerFit> {
        let solver = NewtonRaphson::new(self.max_iterations, self.tolerance);
        let result = solver.maximize(objective, start)?;

        let p = objective.n_fixed;
        let h_bb = result.derivatives.hessian.slice(s![p.., p..]).mapv(|h| -h);
        let n_groups = h_bb.nrows() as f64;
        let log_det = linalg::log_det_spd(&h_bb)?;
        let integrated = result.derivatives.value - 0.5 * n_groups * objective.theta.ln() - 0.5 * log_det;

        Ok(InnerFit {
            theta: objective.theta,
            params: result.params,
            derivatives: result.derivatives,
            integrated,
            iterations: result.iterations,
        })
    }
}

fn augmented_design(data: &SurvivalData, index: &[usize], n_groups: usize) -> Array2<f64> {
    let n = data.n_samples();
    let p = data.n_features();
    let mut design = Array2::zeros((n, p + n_groups));
    design.slice_mut(s![.., ..p]).assign(&data.covariates());
    for (i, &g) in index.iter().enumerate() {
        design[[i, p + g]] = 1.0;
    }
    design
}

/// fitted mixed-effects cox model
#[derive(Debug, Clone)]
pub struct FrailtyFit {
    coefficients: Array1<f64>,
    clone_effects: Array1<f64>, // BLUPs
    clone_labels: Vec<String>,
    variance: Array2<f64>,
    term_names: Vec<String>,
    theta: f64,
    integrated_log_likelihood: f64,
    penalized_log_likelihood: f64,
    cox_log_likelihood: f64,
    lrt_statistic: f64,
    lrt_p_value: f64,
    iterations: usize,
    n_samples: usize,
    n_events: usize,
    critical: f64,
}

impl FrailtyFit {
    pub fn coefficients(&self) -> ArrayView1<'_, f64> {
        self.coefficients.view()
    }

    pub fn standard_errors(&self) -> Array1<f64> {
        self.variance.diag().mapv(|v| v.max(0.0).sqrt())
    }

    /// variance of the clone random intercept
    pub fn theta(&self) -> f64 {
        self.theta
    }

    /// predicted log-hazard shift of each clone, with its label
    pub fn clone_effects(&self) -> Vec<(&str, f64)> {
        self.clone_labels
            .iter()
            .map(String::as_str)
            .zip(self.clone_effects.iter().copied())
            .collect()
    }

    pub fn integrated_log_likelihood(&self) -> f64 {
        self.integrated_log_likelihood
    }

    pub fn penalized_log_likelihood(&self) -> f64 {
        self.penalized_log_likelihood
    }

    pub fn cox_log_likelihood(&self) -> f64 {
        self.cox_log_likelihood
    }

    /// test of theta > 0 against the ordinary cox model: (statistic, p)
    pub fn likelihood_ratio_test(&self) -> (f64, f64) {
        (self.lrt_statistic, self.lrt_p_value)
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }
}

impl SurvivalFit for FrailtyFit {
    fn model_name(&self) -> &str {
        "coxme"
    }

    fn tidy(&self) -> Vec<TermEstimate> {
        let se = self.standard_errors();
        let mut rows: Vec<TermEstimate> = self.term_names
            .iter()
            .enumerate()
            .map(|(j, term)| {
                let estimate = self.coefficients[j];
                let z = estimate / se[j];
                TermEstimate {
                    model: "coxme".to_string(),
                    term: term.clone(),
                    estimate,
                    std_error: se[j],
                    statistic: Some(z),
                    p_value: Some(stats::two_sided_p(z)),
                    conf_low: estimate - self.critical * se[j],
                    conf_high: estimate + self.critical * se[j],
                }
            })
            .collect();

        let sd = self.theta.sqrt();
        rows.push(TermEstimate {
            model: "coxme".to_string(),
            term: "sd(clone)".to_string(),
            estimate: sd,
            std_error: f64::NAN,
            statistic: None,
            p_value: Some(self.lrt_p_value),
            conf_low: f64::NAN,
            conf_high: f64::NAN,
        });
        rows
    }

    fn fit_statistics(&self) -> FitStatistics {
        FitStatistics {
            model: "coxme".to_string(),
            log_likelihood: Some(self.integrated_log_likelihood),
            n_parameters: self.coefficients.len() + 1,
            n_samples: self.n_samples,
            n_events: self.n_events,
        }
    }

    fn risk_scores(&self, covariates: ArrayView2<f64>) -> Option<Array1<f64>> {
        (covariates.ncols() == self.coefficients.len()).then(|| covariates.dot(&self.coefficients))
    }
}
