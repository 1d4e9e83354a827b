use log::info;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use crate::{
    analysis::{FitStatistics, SurvivalFit},
    data::SurvivalData,
    error::{SurvError, Result},
    linalg,
    optimization::{NewtonRaphson, Objective, PartialLikelihood, Ties},
    report::TermEstimate,
    stats,
};

/// cox proportional hazards model - configure, then fit
#[derive(Debug, Clone)]
pub struct CoxModel {
    ties: Ties,
    max_iterations: usize,
    tolerance: f64,
    conf_level: f64,
    robust: bool, // sandwich variance clustered on clone
}

impl Default for CoxModel {
    fn default() -> Self {
        Self {
            ties: Ties::Efron,
            max_iterations: 50,
            tolerance: 1e-9,
            conf_level: 0.95,
            robust: false,
        }
    }
}

impl CoxModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ties(mut self, ties: Ties) -> Self {
        self.ties = ties;
        self
    }

    /// max newton iterations before giving up
    pub fn with_max_iterations(mut self, max_iter: usize) -> Self {
        self.max_iterations = max_iter;
        self
    }

    /// relative change in log-likelihood that counts as converged
    pub fn with_tolerance(mut self, tol: f64) -> Self {
        self.tolerance = tol;
        self
    }

    pub fn with_conf_level(mut self, conf_level: f64) -> Self {
        self.conf_level = conf_level;
        self
    }

    /// report cluster-robust standard errors (needs clone clusters on the data)
    pub fn with_robust_variance(mut self, robust: bool) -> Self {
        self.robust = robust;
        self
    }

    /// fit the model to data - this does the actual work
    pub fn fit(&self, data: &SurvivalData) -> Result<CoxFit> {
        let z = stats::normal_critical(self.conf_level)?;
        if data.n_events() == 0 {
            return Err(SurvError::invalid_survival_data("no deaths observed - nothing to fit"));
        }
        if self.robust && data.clusters().is_none() {
            return Err(SurvError::invalid_parameter("robust", "true without clone clusters"));
        }

        let objective = PartialLikelihood::from_data(data, self.ties)?;
        let p = objective.dim();
        let null = objective.evaluate(&Array1::zeros(p))?;

        let solver = NewtonRaphson::new(self.max_iterations, self.tolerance);
        let result = solver.maximize(&objective, Array1::zeros(p))?;

        let information = result.derivatives.hessian.mapv(|h| -h);
        let variance = linalg::inverse(&information)?;

        let robust_variance = if self.robust {
            let clusters = data.clusters().map(|c| c.index()).unwrap_or(&[]);
            let scores = score_residuals(data, &result.params, self.ties)?;
            Some(sandwich(&variance, &scores, clusters))
        } else {
            None
        };

        let baseline = BaselineHazard::estimate(data, &result.params, self.ties)?;

        info!(
            "coxph converged in {} iterations: loglik {:.4} (null {:.4})",
            result.iterations, result.derivatives.value, null.value
        );

        Ok(CoxFit {
            coefficients: result.params,
            variance,
            robust_variance,
            term_names: data.term_names().to_vec(),
            log_likelihood: result.derivatives.value,
            null_log_likelihood: null.value,
            iterations: result.iterations,
            n_samples: data.n_samples(),
            n_events: data.n_events(),
            baseline,
            critical: z,
            model_name: if self.robust { "coxph_robust" } else { "coxph" },
        })
    }
}

/// one term of the risk-set sum at a death time. breslow keeps a single
/// term counted `d` times; efron splits it into `d` terms with the tied
/// deaths' share shrinking by `1/d` each step
#[derive(Debug, Clone)]
struct TieStep {
    s0: f64,
    mean: Array1<f64>,
    tied_weight: f64, // risk weight of the hosts dying at this time
    count: f64,
}

/// (time, deaths, steps) at each distinct death time
fn tie_steps(
    data: &SurvivalData,
    risk: &Array1<f64>,
    ties: Ties,
) -> Result<Vec<(f64, f64, Vec<TieStep>)>> {
    let x = data.covariates();
    let times = data.times();
    let events = data.events();
    let p = data.n_features();

    let mut out = Vec::new();
    for t in data.event_times() {
        let mut s0 = 0.0;
        let mut s1 = Array1::<f64>::zeros(p);
        let mut tied_s0 = 0.0;
        let mut tied_s1 = Array1::<f64>::zeros(p);
        let mut deaths = 0.0;
        for i in 0..data.n_samples() {
            if times[i] >= t {
                s0 += risk[i];
                s1.scaled_add(risk[i], &x.row(i));
                if times[i] == t && events[i] {
                    deaths += 1.0;
                    tied_s0 += risk[i];
                    tied_s1.scaled_add(risk[i], &x.row(i));
                }
            }
        }

        let steps = match ties {
            Ties::Breslow => vec![TieStep { s0, mean: &s1 / s0, tied_weight: 1.0, count: deaths }],
            Ties::Efron => (0..deaths as usize)
                .map(|k| {
                    let f = k as f64 / deaths;
                    let s0_k = s0 - f * tied_s0;
                    let s1_k = &s1 - &(&tied_s1 * f);
                    TieStep { s0: s0_k, mean: s1_k / s0_k, tied_weight: 1.0 - f, count: 1.0 }
                })
                .collect(),
        };
        if steps.iter().any(|st| !(st.s0 > 0.0)) {
            return Err(SurvError::numerical_error("Risk set sum is non-positive"));
        }
        out.push((t, deaths, steps));
    }
    Ok(out)
}

/// cumulative baseline hazard at the distinct death times. the increments
/// follow the ties rule of the fit: `d / S0` for breslow, `sum_k 1 / S0_k`
/// for efron
#[derive(Debug, Clone)]
pub struct BaselineHazard {
    pub times: Vec<f64>,
    pub cumulative_hazard: Vec<f64>,
}

impl BaselineHazard {
    pub fn estimate(data: &SurvivalData, beta: &Array1<f64>, ties: Ties) -> Result<Self> {
        let risk = data.covariates().dot(beta).mapv(f64::exp);
        let mut times = Vec::new();
        let mut cumulative_hazard = Vec::new();
        let mut total = 0.0;

        for (t, _, steps) in tie_steps(data, &risk, ties)? {
            total += steps.iter().map(|st| st.count / st.s0).sum::<f64>();
            times.push(t);
            cumulative_hazard.push(total);
        }

        Ok(Self { times, cumulative_hazard })
    }

    /// step function lookup, zero before the first death
    pub fn at(&self, t: f64) -> f64 {
        match self.times.partition_point(|&s| s <= t) {
            0 => 0.0,
            k => self.cumulative_hazard[k - 1],
        }
    }
}

/// fitted cox model
#[derive(Debug, Clone)]
pub struct CoxFit {
    coefficients: Array1<f64>,
    variance: Array2<f64>,
    robust_variance: Option<Array2<f64>>,
    term_names: Vec<String>,
    log_likelihood: f64,
    null_log_likelihood: f64,
    iterations: usize,
    n_samples: usize,
    n_events: usize,
    baseline: BaselineHazard,
    critical: f64,
    model_name: &'static str,
}

impl CoxFit {
    /// the betas
    pub fn coefficients(&self) -> ArrayView1<'_, f64> {
        self.coefficients.view()
    }

    /// the variance used for inference - robust if requested
    pub fn variance(&self) -> &Array2<f64> {
        self.robust_variance.as_ref().unwrap_or(&self.variance)
    }

    /// inverse observed information, whatever was requested
    pub fn model_variance(&self) -> &Array2<f64> {
        &self.variance
    }

    pub fn standard_errors(&self) -> Array1<f64> {
        self.variance().diag().mapv(|v| v.max(0.0).sqrt())
    }

    pub fn hazard_ratios(&self) -> Array1<f64> {
        self.coefficients.mapv(f64::exp)
    }

    pub fn log_likelihood(&self) -> f64 {
        self.log_likelihood
    }

    pub fn null_log_likelihood(&self) -> f64 {
        self.null_log_likelihood
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }

    /// likelihood ratio test against beta = 0: (statistic, df, p)
    pub fn likelihood_ratio_test(&self) -> (f64, usize, f64) {
        let statistic = (2.0 * (self.log_likelihood - self.null_log_likelihood)).max(0.0);
        let df = self.coefficients.len();
        (statistic, df, stats::chi_squared_sf(statistic, df as f64))
    }

    pub fn baseline_hazard(&self) -> &BaselineHazard {
        &self.baseline
    }

    /// linear predictors for new hosts
    pub fn predict(&self, covariates: ArrayView2<f64>) -> Result<Array1<f64>> {
        if covariates.ncols() != self.coefficients.len() {
            return Err(SurvError::invalid_dimensions(
                format!("feature count mismatch: expected {}, got {}",
                       self.coefficients.len(), covariates.ncols())
            ));
        }
        Ok(covariates.dot(&self.coefficients))
    }

    pub fn predict_hazard_ratios(&self, covariates: ArrayView2<f64>) -> Result<Array1<f64>> {
        Ok(self.predict(covariates)?.mapv(f64::exp))
    }

    /// S(t | x) = exp(-H0(t) exp(x beta)) on a grid of times
    pub fn predict_survival(&self, covariates: ArrayView2<f64>, times: ArrayView1<f64>) -> Result<Array2<f64>> {
        let risk = self.predict_hazard_ratios(covariates)?;
        let mut survival = Array2::zeros((covariates.nrows(), times.len()));
        for (k, &t) in times.iter().enumerate() {
            let h0 = self.baseline.at(t);
            for i in 0..covariates.nrows() {
                survival[[i, k]] = (-h0 * risk[i]).exp();
            }
        }
        Ok(survival)
    }
}

impl SurvivalFit for CoxFit {
    fn model_name(&self) -> &str {
        self.model_name
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
                    model: self.model_name.to_string(),
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
            model: self.model_name.to_string(),
            log_likelihood: Some(self.log_likelihood),
            n_parameters: self.coefficients.len(),
            n_samples: self.n_samples,
            n_events: self.n_events,
        }
    }

    fn risk_scores(&self, covariates: ArrayView2<f64>) -> Option<Array1<f64>> {
        (covariates.ncols() == self.coefficients.len()).then(|| covariates.dot(&self.coefficients))
    }
}

/// per-host score residuals in the form of the given ties rule, n x p.
/// columns sum to the partial-likelihood score at `beta`
pub fn score_residuals(data: &SurvivalData, beta: &Array1<f64>, ties: Ties) -> Result<Array2<f64>> {
    let n = data.n_samples();
    let p = data.n_features();
    let x = data.covariates();
    let times = data.times();
    let events = data.events();

    let eta = x.dot(beta);
    let shift = eta.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let risk = eta.mapv(|e| (e - shift).exp());
    let risk_sets = tie_steps(data, &risk, ties)?;

    let mut residuals = Array2::zeros((n, p));
    for i in 0..n {
        let xi = x.row(i);
        let mut r = Array1::<f64>::zeros(p);
        for (t, deaths, steps) in &risk_sets {
            if *t > times[i] {
                break;
            }
            let tied = events[i] && *t == times[i];
            if tied {
                r += &xi;
                for st in steps {
                    r.scaled_add(-st.count / deaths, &st.mean);
                }
            }
            for st in steps {
                let w = if tied { st.tied_weight } else { 1.0 };
                let centred = &xi - &st.mean;
                r.scaled_add(-risk[i] * w * st.count / st.s0, &centred);
            }
        }
        residuals.row_mut(i).assign(&r);
    }
    Ok(residuals)
}

/// V U'U V with scores summed within each cluster
fn sandwich(variance: &Array2<f64>, scores: &Array2<f64>, clusters: &[usize]) -> Array2<f64> {
    let p = scores.ncols();
    let n_groups = clusters.iter().copied().max().map_or(0, |m| m + 1);
    let mut summed = Array2::<f64>::zeros((n_groups, p));
    for (i, &g) in clusters.iter().enumerate() {
        let mut row = summed.row_mut(g);
        row += &scores.row(i);
    }
    let meat = summed.t().dot(&summed);
    variance.dot(&meat).dot(variance)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Clusters;
    use approx::assert_relative_eq;
    use ndarray::{Array2, Axis};

    fn create_test_data() -> SurvivalData {
        let times = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0];
        let events = vec![true, false, true, true, false, true, true, false];
        let covariates = Array2::from_shape_vec((8, 1), vec![
            1.0, 0.0, 1.0, 0.0, 1.0, 0.0, 1.0, 0.0,
        ]).unwrap();

        SurvivalData::new(times, events, covariates)
            .unwrap()
            .with_term_names(vec!["treatmentB".into()])
            .unwrap()
            .with_clusters(Clusters::from_labels(&["a", "a", "b", "b", "c", "c", "d", "d"]))
            .unwrap()
    }

    #[test]
    fn test_model_configuration() {
        let model = CoxModel::new()
            .with_ties(Ties::Breslow)
            .with_max_iterations(10)
            .with_conf_level(0.9);
        assert_eq!(model.ties, Ties::Breslow);
        assert_eq!(model.max_iterations, 10);
        assert_eq!(model.conf_level, 0.9);
    }

    #[test]
    fn test_score_is_zero_at_the_fit() {
        let data = create_test_data();
        let fit = CoxModel::new().fit(&data).unwrap();
        let pl = PartialLikelihood::from_data(&data, Ties::Efron).unwrap();
        let d = pl.evaluate(&fit.coefficients().to_owned()).unwrap();
        assert!(d.gradient[0].abs() < 1e-6);
        assert!(fit.log_likelihood() >= fit.null_log_likelihood());
    }

    #[test]
    fn test_breslow_score_residuals_sum_to_score() {
        let data = create_test_data();
        let beta = Array1::from(vec![0.3]);
        let residuals = score_residuals(&data, &beta, Ties::Breslow).unwrap();
        let pl = PartialLikelihood::from_data(&data, Ties::Breslow).unwrap();
        let d = pl.evaluate(&beta).unwrap();
        assert_relative_eq!(residuals.column(0).sum(), d.gradient[0], epsilon = 1e-10);
    }

    fn create_tied_data() -> SurvivalData {
        // deaths recorded at fixed checks, so most times are shared
        let times = vec![12.0, 12.0, 12.0, 24.0, 24.0, 24.0, 36.0, 36.0, 48.0, 48.0, 48.0, 48.0];
        let events = vec![true, true, false, true, true, true, true, false, true, true, false, false];
        let covariates = Array2::from_shape_vec((12, 2), vec![
            1.0, 0.0, 1.0, 1.0, 0.0, 0.0, 1.0, 1.0, 0.0, 1.0, 0.0, 0.0,
            1.0, 0.0, 0.0, 1.0, 1.0, 1.0, 0.0, 0.0, 1.0, 0.0, 0.0, 1.0,
        ]).unwrap();

        SurvivalData::new(times, events, covariates)
            .unwrap()
            .with_clusters(Clusters::from_labels(&[
                "a", "a", "a", "b", "b", "b", "c", "c", "c", "d", "d", "d",
            ]))
            .unwrap()
    }

    #[test]
    fn test_efron_score_residuals_vanish_at_the_fit() {
        let data = create_tied_data();
        let fit = CoxModel::new().with_tolerance(1e-12).fit(&data).unwrap();
        let residuals = score_residuals(&data, &fit.coefficients().to_owned(), Ties::Efron).unwrap();
        for total in residuals.sum_axis(Axis(0)).iter() {
            assert!(total.abs() < 1e-6, "residual sum {}", total);
        }

        // away from the fit they still add up to the efron score
        let beta = Array1::from(vec![0.4, -0.2]);
        let residuals = score_residuals(&data, &beta, Ties::Efron).unwrap();
        let pl = PartialLikelihood::from_data(&data, Ties::Efron).unwrap();
        let d = pl.evaluate(&beta).unwrap();
        for (a, b) in residuals.sum_axis(Axis(0)).iter().zip(d.gradient.iter()) {
            assert_relative_eq!(a, b, epsilon = 1e-10);
        }
    }

    #[test]
    fn test_robust_variance_follows_ties() {
        let data = create_tied_data();
        for ties in [Ties::Breslow, Ties::Efron] {
            let fit = CoxModel::new()
                .with_ties(ties)
                .with_robust_variance(true)
                .fit(&data)
                .unwrap();
            let scores = score_residuals(&data, &fit.coefficients().to_owned(), ties).unwrap();
            let clusters = data.clusters().unwrap().index();
            let expected = sandwich(fit.model_variance(), &scores, clusters);
            assert_relative_eq!(fit.variance()[[0, 0]], expected[[0, 0]], epsilon = 1e-12);
            assert!(scores.sum_axis(Axis(0)).iter().all(|u| u.abs() < 1e-6));
        }
    }

    #[test]
    fn test_tidy_interval_is_wald() {
        let data = create_test_data();
        let fit = CoxModel::new().fit(&data).unwrap();
        let row = &fit.tidy()[0];
        assert_eq!(row.term, "treatmentB");
        assert_eq!(row.model, "coxph");
        assert_relative_eq!(row.conf_high - row.estimate, 1.959964 * row.std_error, epsilon = 1e-5);
        assert_relative_eq!(row.statistic.unwrap(), row.estimate / row.std_error, epsilon = 1e-12);
    }

    #[test]
    fn test_robust_needs_clusters() {
        let data = SurvivalData::new(
            vec![1.0, 2.0, 3.0],
            vec![true, true, false],
            Array2::from_shape_vec((3, 1), vec![1.0, 0.0, 1.0]).unwrap(),
        ).unwrap();
        assert!(CoxModel::new().with_robust_variance(true).fit(&data).is_err());

        let fit = CoxModel::new().with_robust_variance(true).fit(&create_test_data()).unwrap();
        assert_eq!(fit.model_name(), "coxph_robust");
        assert!(fit.standard_errors()[0].is_finite());
    }

    #[test]
    fn test_no_deaths_is_an_error() {
        let data = SurvivalData::new(
            vec![1.0, 2.0],
            vec![false, false],
            Array2::zeros((2, 1)),
        ).unwrap();
        assert!(CoxModel::new().fit(&data).is_err());
    }

    #[test]
    fn test_baseline_hazard_steps() {
        let data = SurvivalData::new(
            vec![1.0, 2.0, 3.0],
            vec![true, true, false],
            Array2::zeros((3, 1)),
        ).unwrap();
        let baseline = BaselineHazard::estimate(&data, &Array1::zeros(1), Ties::Breslow).unwrap();
        assert_eq!(baseline.at(0.5), 0.0);
        assert_relative_eq!(baseline.at(1.0), 1.0 / 3.0);
        assert_relative_eq!(baseline.at(2.5), 1.0 / 3.0 + 0.5);
        assert_relative_eq!(baseline.at(10.0), 1.0 / 3.0 + 0.5);
    }

    #[test]
    fn test_efron_baseline_splits_tied_deaths() {
        let data = SurvivalData::new(
            vec![1.0, 1.0, 2.0],
            vec![true, true, true],
            Array2::zeros((3, 1)),
        ).unwrap();
        let zero = Array1::zeros(1);

        let breslow = BaselineHazard::estimate(&data, &zero, Ties::Breslow).unwrap();
        assert_relative_eq!(breslow.at(1.0), 2.0 / 3.0);

        // 1/3 for the first tied death, 1/(3 - 1) for the second
        let efron = BaselineHazard::estimate(&data, &zero, Ties::Efron).unwrap();
        assert_relative_eq!(efron.at(1.0), 1.0 / 3.0 + 0.5);
        assert_relative_eq!(efron.at(2.0), 1.0 / 3.0 + 0.5 + 1.0);
    }

    #[test]
    fn test_prediction_dimension_mismatch() {
        let fit = CoxModel::new().fit(&create_test_data()).unwrap();
        let wrong = Array2::zeros((5, 2));
        assert!(fit.predict(wrong.view()).is_err());
    }
}
