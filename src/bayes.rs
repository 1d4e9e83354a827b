//! bayesian weibull proportional hazards with an optional clone intercept
//!
//! `h(t) = k lambda t^(k-1) exp(x beta + sigma z_clone)` sampled with
//! componentwise adaptive random-walk metropolis, one chain per rayon task.

use log::{debug, info, warn};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use crate::{
    analysis::{FitStatistics, SurvivalFit},
    data::SurvivalData,
    error::{SurvError, Result},
    report::TermEstimate,
    stats,
};

const TARGET_ACCEPTANCE: f64 = 0.44;
const ADAPT_BATCH: usize = 50;
const LOG_SCALE_PRIOR_SD: f64 = 10.0;

/// sampler settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BayesConfig {
    pub chains: usize,
    pub warmup: usize,
    pub draws: usize,   // kept draws per chain
    pub seed: u64,
    pub prior_sd: f64,  // sd of the normal prior on each log hazard ratio
    pub hierarchical: bool,
}

impl Default for BayesConfig {
    fn default() -> Self {
        Self {
            chains: 4,
            warmup: 1000,
            draws: 1000,
            seed: 42,
            prior_sd: 2.5,
            hierarchical: true,
        }
    }
}

impl BayesConfig {
    pub fn validate(&self) -> Result<()> {
        if self.chains == 0 {
            return Err(SurvError::invalid_parameter("bayes.chains", self.chains));
        }
        if self.warmup < ADAPT_BATCH {
            return Err(SurvError::invalid_parameter("bayes.warmup", self.warmup));
        }
        if self.draws < 4 {
            return Err(SurvError::invalid_parameter("bayes.draws", self.draws));
        }
        if !(self.prior_sd > 0.0 && self.prior_sd.is_finite()) {
            return Err(SurvError::invalid_parameter("bayes.prior_sd", self.prior_sd));
        }
        Ok(())
    }
}

/// unnormalised log posterior over
/// `[ln lambda, ln k, beta.., (ln sigma, z..)]`
struct WeibullPosterior<'a> {
    times: ArrayView1<'a, f64>,
    log_times: Array1<f64>,
    events: ArrayView1<'a, bool>,
    covariates: ArrayView2<'a, f64>,
    clusters: Option<(&'a [usize], usize)>,
    prior_sd: f64,
}

impl<'a> WeibullPosterior<'a> {
    fn n_features(&self) -> usize {
        self.covariates.ncols()
    }

    fn dim(&self) -> usize {
        2 + self.n_features() + self.clusters.map_or(0, |(_, g)| 1 + g)
    }

    fn log_density(&self, theta: &[f64]) -> f64 {
        let p = self.n_features();
        let log_lambda = theta[0];
        let log_k = theta[1];
        let k = log_k.exp();
        let beta = &theta[2..2 + p];

        let mut lp = -0.5 * (log_lambda / LOG_SCALE_PRIOR_SD).powi(2) - 0.5 * log_k * log_k;
        lp -= beta.iter().map(|b| b * b).sum::<f64>() / (2.0 * self.prior_sd * self.prior_sd);

        let mut sigma = 0.0;
        let mut z: &[f64] = &[];
        if self.clusters.is_some() {
            let log_sigma = theta[2 + p];
            sigma = log_sigma.exp();
            z = &theta[3 + p..];
            // half-normal(0, 1) on sigma, plus the log jacobian
            lp += -0.5 * sigma * sigma + log_sigma;
            lp -= 0.5 * z.iter().map(|v| v * v).sum::<f64>();
        }

        for i in 0..self.times.len() {
            let row = self.covariates.row(i);
            let mut eta = log_lambda + row.iter().zip(beta).map(|(x, b)| x * b).sum::<f64>();
            if let Some((index, _)) = self.clusters {
                eta += sigma * z[index[i]];
            }
            let log_t = self.log_times[i];
            if self.events[i] {
                lp += log_k + (k - 1.0) * log_t + eta;
            }
            lp -= (eta + k * log_t).exp();
        }

        if lp.is_finite() { lp } else { f64::NEG_INFINITY }
    }

    /// exponential-model starting point
    fn initial(&self) -> Vec<f64> {
        let deaths = self.events.iter().filter(|&&e| e).count().max(1) as f64;
        let exposure: f64 = self.times.sum();
        let mut theta = vec![0.0; self.dim()];
        theta[0] = (deaths / exposure).ln();
        if self.clusters.is_some() {
            theta[2 + self.n_features()] = 0.5_f64.ln();
        }
        theta
    }
}

struct ChainOutput {
    draws: Array2<f64>, // kept draws x dim, on the sampling scale
    acceptance: Vec<f64>,
}

fn run_chain(
    posterior: &WeibullPosterior<'_>,
    config: &BayesConfig,
    seed: u64,
) -> Result<ChainOutput> {
    let mut rng = StdRng::seed_from_u64(seed);
    let dim = posterior.dim();

    // jitter the start so chains disagree until they mix
    let mut theta = posterior.initial();
    for v in theta.iter_mut() {
        *v += rng.gen_range(-0.5..0.5);
    }
    let mut current = posterior.log_density(&theta);
    if !current.is_finite() {
        return Err(SurvError::numerical_error(format!(
            "chain seeded {} starts at a point with zero posterior density", seed
        )));
    }

    let mut log_step = vec![0.1_f64.ln(); dim];
    let mut batch_accepts = vec![0usize; dim];
    let mut kept_accepts = vec![0usize; dim];
    let mut draws = Array2::zeros((config.draws, dim));

    for iter in 0..config.warmup + config.draws {
        for j in 0..dim {
            let old = theta[j];
            let step: f64 = rng.sample(StandardNormal);
            theta[j] = old + log_step[j].exp() * step;
            let proposed = posterior.log_density(&theta);
            let accept = proposed - current >= rng.gen::<f64>().ln();
            if accept {
                current = proposed;
                if iter < config.warmup {
                    batch_accepts[j] += 1;
                } else {
                    kept_accepts[j] += 1;
                }
            } else {
                theta[j] = old;
            }
        }

        if iter < config.warmup && (iter + 1) % ADAPT_BATCH == 0 {
            let batch = (iter + 1) / ADAPT_BATCH;
            let delta = (1.0 / (batch as f64).sqrt()).min(0.1);
            for j in 0..dim {
                let rate = batch_accepts[j] as f64 / ADAPT_BATCH as f64;
                if rate > TARGET_ACCEPTANCE {
                    log_step[j] += delta;
                } else {
                    log_step[j] -= delta;
                }
                batch_accepts[j] = 0;
            }
        }

        if iter >= config.warmup {
            draws
                .row_mut(iter - config.warmup)
                .assign(&ArrayView1::from(&theta[..]));
        }
    }

    let acceptance = kept_accepts
        .iter()
        .map(|&a| a as f64 / config.draws as f64)
        .collect();
    debug!("chain seeded {} finished, log density {:.3}", seed, current);
    Ok(ChainOutput { draws, acceptance })
}

/// split R-hat for one parameter; NaN when chains are too short
pub fn split_r_hat(chains: &[Vec<f64>]) -> f64 {
    let mut halves: Vec<&[f64]> = Vec::with_capacity(chains.len() * 2);
    for chain in chains {
        if chain.len() < 4 {
            return f64::NAN;
        }
        let (a, b) = chain.split_at(chain.len() / 2);
        halves.push(a);
        halves.push(b);
    }
    let n = halves.iter().map(|h| h.len()).min().unwrap_or(0);
    if halves.len() < 2 || n < 2 {
        return f64::NAN;
    }

    let moments: Vec<(f64, f64)> = halves
        .iter()
        .map(|h| {
            let (mean, sd) = stats::mean_sd(&h[..n]);
            (mean, sd * sd)
        })
        .collect();
    let m = moments.len() as f64;
    let n = n as f64;
    let grand = moments.iter().map(|s| s.0).sum::<f64>() / m;
    let between = n / (m - 1.0) * moments.iter().map(|s| (s.0 - grand).powi(2)).sum::<f64>();
    let within = moments.iter().map(|s| s.1).sum::<f64>() / m;
    if within < 1e-30 {
        return f64::NAN;
    }
    (((n - 1.0) / n * within + between / n) / within).sqrt()
}

/// marginal posterior of one reported quantity
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PosteriorSummary {
    pub parameter: String,
    pub mean: f64,
    pub sd: f64,
    pub q025: f64,
    pub q50: f64,
    pub q975: f64,
    pub r_hat: f64,
    pub acceptance: f64,
}

/// bayesian weibull model - configure, then fit
#[derive(Debug, Clone)]
pub struct BayesWeibullModel {
    config: BayesConfig,
    conf_level: f64,
}

impl Default for BayesWeibullModel {
    fn default() -> Self {
        Self::new(BayesConfig::default())
    }
}

impl BayesWeibullModel {
    pub fn new(config: BayesConfig) -> Self {
        Self { config, conf_level: 0.95 }
    }

    /// width of the equal-tailed credible intervals in tidy output
    pub fn with_conf_level(mut self, conf_level: f64) -> Self {
        self.conf_level = conf_level;
        self
    }

    pub fn fit(&self, data: &SurvivalData) -> Result<BayesFit> {
        self.config.validate()?;
        stats::normal_critical(self.conf_level)?;
        if data.n_events() == 0 {
            return Err(SurvError::invalid_survival_data("no deaths observed"));
        }

        let clusters = match (self.config.hierarchical, data.clusters()) {
            (false, _) => None,
            (true, Some(c)) => Some((c.index(), c.n_clusters())),
            (true, None) => {
                return Err(SurvError::invalid_parameter(
                    "hierarchical", "true (data has no clone grouping)"
                ));
            }
        };

        let times = data.times();
        let posterior = WeibullPosterior {
            times,
            log_times: times.mapv(f64::ln),
            events: data.events(),
            covariates: data.covariates(),
            clusters,
            prior_sd: self.config.prior_sd,
        };

        info!(
            "sampling weibull model: {} chains x ({} warmup + {} draws), {} parameters",
            self.config.chains, self.config.warmup, self.config.draws, posterior.dim()
        );

        let chains = (0..self.config.chains)
            .into_par_iter()
            .map(|c| run_chain(&posterior, &self.config, self.config.seed.wrapping_add(c as u64)))
            .collect::<Result<Vec<_>>>()?;

        let p = data.n_features();
        let mut names = vec!["log(scale)".to_string(), "shape".to_string()];
        names.extend(data.term_names().iter().cloned());
        if clusters.is_some() {
            names.push("sd(clone)".to_string());
        }

        // reported quantities per chain: shape and sigma on the natural scale
        let reported: Vec<Vec<Vec<f64>>> = (0..names.len())
            .map(|j| {
                chains
                    .iter()
                    .map(|c| {
                        let col = c.draws.column(j);
                        if j == 1 || j == 2 + p { col.mapv(f64::exp).to_vec() } else { col.to_vec() }
                    })
                    .collect()
            })
            .collect();

        let summaries: Vec<PosteriorSummary> = names
            .iter()
            .zip(&reported)
            .enumerate()
            .map(|(j, (name, per_chain))| {
                let mut pooled: Vec<f64> = per_chain.iter().flatten().copied().collect();
                let (mean, sd) = stats::mean_sd(&pooled);
                pooled.sort_by(f64::total_cmp);
                let acceptance = chains.iter().map(|c| c.acceptance[j]).sum::<f64>()
                    / chains.len() as f64;
                PosteriorSummary {
                    parameter: name.clone(),
                    mean,
                    sd,
                    q025: stats::quantile_sorted(&pooled, 0.025),
                    q50: stats::quantile_sorted(&pooled, 0.5),
                    q975: stats::quantile_sorted(&pooled, 0.975),
                    r_hat: split_r_hat(per_chain),
                    acceptance,
                }
            })
            .collect();

        let worst = summaries.iter().map(|s| s.r_hat).filter(|r| r.is_finite()).fold(1.0, f64::max);
        if worst > 1.05 {
            warn!("weibull sampler has not mixed, max split R-hat {:.3}", worst);
        }

        let clone_effects = match (clusters, data.clusters()) {
            (Some(_), Some(c)) => {
                let offset = 3 + p;
                c.labels()
                    .iter()
                    .enumerate()
                    .map(|(g, label)| {
                        let total: f64 = chains
                            .iter()
                            .flat_map(|ch| {
                                ch.draws
                                    .axis_iter(Axis(0))
                                    .map(move |d| d[offset - 1].exp() * d[offset + g])
                            })
                            .sum();
                        let count = (chains.len() * self.config.draws) as f64;
                        (label.clone(), total / count)
                    })
                    .collect()
            }
            _ => Vec::new(),
        };

        Ok(BayesFit {
            summaries,
            reported,
            clone_effects,
            n_features: p,
            conf_level: self.conf_level,
            n_samples: data.n_samples(),
            n_events: data.n_events(),
        })
    }
}

/// posterior from a weibull fit
#[derive(Debug, Clone)]
pub struct BayesFit {
    summaries: Vec<PosteriorSummary>,
    reported: Vec<Vec<Vec<f64>>>, // parameter x chain x draw
    clone_effects: Vec<(String, f64)>,
    n_features: usize,
    conf_level: f64,
    n_samples: usize,
    n_events: usize,
}

impl BayesFit {
    pub fn summaries(&self) -> &[PosteriorSummary] {
        &self.summaries
    }

    pub fn summary(&self, parameter: &str) -> Option<&PosteriorSummary> {
        self.summaries.iter().find(|s| s.parameter == parameter)
    }

    /// pooled draws of one reported quantity, chain after chain
    pub fn draws(&self, parameter: &str) -> Option<Vec<f64>> {
        let j = self.summaries.iter().position(|s| s.parameter == parameter)?;
        Some(self.reported[j].iter().flatten().copied().collect())
    }

    /// posterior mean of sigma * z per clone
    pub fn clone_effects(&self) -> &[(String, f64)] {
        &self.clone_effects
    }

    pub fn max_r_hat(&self) -> f64 {
        self.summaries.iter().map(|s| s.r_hat).fold(f64::NAN, f64::max)
    }

    /// posterior mean of each log hazard ratio
    pub fn coefficients(&self) -> Array1<f64> {
        self.summaries[2..2 + self.n_features].iter().map(|s| s.mean).collect()
    }
}

impl SurvivalFit for BayesFit {
    fn model_name(&self) -> &str {
        "weibull_bayes"
    }

    fn tidy(&self) -> Vec<TermEstimate> {
        let tail = (1.0 - self.conf_level) / 2.0;
        self.summaries[1..]
            .iter()
            .zip(&self.reported[1..])
            .map(|(s, per_chain)| {
                let mut pooled: Vec<f64> = per_chain.iter().flatten().copied().collect();
                pooled.sort_by(f64::total_cmp);
                TermEstimate {
                    model: "weibull_bayes".to_string(),
                    term: s.parameter.clone(),
                    estimate: s.mean,
                    std_error: s.sd,
                    statistic: None,
                    p_value: None,
                    conf_low: stats::quantile_sorted(&pooled, tail),
                    conf_high: stats::quantile_sorted(&pooled, 1.0 - tail),
                }
            })
            .collect()
    }

    fn fit_statistics(&self) -> FitStatistics {
        FitStatistics {
            model: "weibull_bayes".to_string(),
            log_likelihood: None,
            n_parameters: self.summaries.len(),
            n_samples: self.n_samples,
            n_events: self.n_events,
        }
    }

    fn risk_scores(&self, covariates: ArrayView2<f64>) -> Option<Array1<f64>> {
        let beta = self.coefficients();
        (covariates.ncols() == beta.len()).then(|| covariates.dot(&beta))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Clusters;
    use rand_distr::{Distribution, Normal};

    fn weibull_assay(seed: u64, n_clones: usize, per_clone: usize, clone_sd: f64) -> SurvivalData {
        let mut rng = StdRng::seed_from_u64(seed);
        let shape: f64 = 1.5;
        let scale: f64 = 0.05;
        let effect: f64 = 1.0;
        let noise = Normal::new(0.0, clone_sd).unwrap();

        let mut times = Vec::new();
        let mut events = Vec::new();
        let mut x = Vec::new();
        let mut labels = Vec::new();
        for c in 0..n_clones {
            let treated = (c % 2) as f64;
            let b = noise.sample(&mut rng);
            for _ in 0..per_clone {
                let u: f64 = rng.gen();
                let rate = scale * (effect * treated + b).exp();
                let t = (-u.ln() / rate).powf(1.0 / shape);
                times.push(t.min(20.0));
                events.push(t < 20.0);
                x.push(treated);
                labels.push(format!("c{}", c));
            }
        }
        SurvivalData::new(times, events, Array2::from_shape_vec((x.len(), 1), x).unwrap())
            .unwrap()
            .with_term_names(vec!["treated".into()])
            .unwrap()
            .with_clusters(Clusters::from_labels(&labels))
            .unwrap()
    }

    fn quick() -> BayesConfig {
        BayesConfig { chains: 2, warmup: 500, draws: 500, ..Default::default() }
    }

    #[test]
    fn test_recovers_weibull_parameters() {
        let data = weibull_assay(3, 8, 40, 0.0);
        let config = BayesConfig { hierarchical: false, ..quick() };
        let fit = BayesWeibullModel::new(config).fit(&data).unwrap();

        let beta = fit.summary("treated").unwrap();
        assert!((beta.mean - 1.0).abs() < 0.4, "beta {}", beta.mean);
        let shape = fit.summary("shape").unwrap();
        assert!((shape.mean - 1.5).abs() < 0.3, "shape {}", shape.mean);
        assert!(fit.summary("sd(clone)").is_none());
        assert!(fit.max_r_hat() < 1.1);
        for s in fit.summaries() {
            assert!(s.acceptance > 0.15 && s.acceptance < 0.8, "{:?}", s);
            assert!(s.q025 <= s.q50 && s.q50 <= s.q975);
        }
    }

    #[test]
    fn test_hierarchical_rows() {
        let data = weibull_assay(5, 6, 15, 0.5);
        let fit = BayesWeibullModel::new(quick()).fit(&data).unwrap();
        let rows = fit.tidy();
        let terms: Vec<&str> = rows.iter().map(|r| r.term.as_str()).collect();
        assert_eq!(terms, vec!["shape", "treated", "sd(clone)"]);
        assert!(rows.iter().all(|r| r.conf_low < r.conf_high));
        assert!(rows[2].estimate > 0.0);
        assert_eq!(fit.clone_effects().len(), 6);
        assert!(fit.fit_statistics().log_likelihood.is_none());
    }

    #[test]
    fn test_same_seed_same_draws() {
        let data = weibull_assay(9, 4, 10, 0.3);
        let config = BayesConfig { chains: 2, warmup: 100, draws: 50, ..Default::default() };
        let a = BayesWeibullModel::new(config.clone()).fit(&data).unwrap();
        let b = BayesWeibullModel::new(config).fit(&data).unwrap();
        assert_eq!(a.draws("treated"), b.draws("treated"));
    }

    #[test]
    fn test_needs_clusters_and_deaths() {
        let x = Array2::zeros((3, 1));
        let plain = SurvivalData::new(vec![1.0, 2.0, 3.0], vec![true, false, true], x.clone()).unwrap();
        assert!(BayesWeibullModel::new(quick()).fit(&plain).is_err());

        let censored = SurvivalData::new(vec![1.0, 2.0, 3.0], vec![false; 3], x).unwrap();
        let config = BayesConfig { hierarchical: false, ..quick() };
        assert!(BayesWeibullModel::new(config).fit(&censored).is_err());
    }

    #[test]
    fn test_split_r_hat() {
        let mut rng = StdRng::seed_from_u64(1);
        let mixed: Vec<Vec<f64>> = (0..4)
            .map(|_| (0..500).map(|_| rng.sample::<f64, _>(StandardNormal)).collect())
            .collect();
        assert!(split_r_hat(&mixed) < 1.05);

        let stuck = vec![vec![0.0, 0.1, 0.0, 0.1, 0.0, 0.1], vec![5.0, 5.1, 5.0, 5.1, 5.0, 5.1]];
        assert!(split_r_hat(&stuck) > 1.5);
        assert!(split_r_hat(&[vec![1.0, 2.0]]).is_nan());
    }
}
