//! replicate study - simulate clone-structured assays, refit, score bias and coverage

use log::{info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use crate::{
    analysis::{self, ModelKind, ModelSettings},
    assay::{AssayRecord, AssayTable},
    design::{self, DesignSpec},
    error::{SurvError, Result},
    stats,
};

pub const REFERENCE_LEVEL: &str = "ancestor";
pub const TREATED_LEVEL: &str = "evolved";

/// what to simulate and which models to refit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub n_clones: usize,
    pub hosts_per_clone: usize,
    pub effect: f64,       // true log hazard ratio of evolved vs ancestor
    pub clone_sd: f64,     // sd of the clone log-hazard intercepts
    pub shape: f64,        // weibull baseline
    pub scale: f64,
    pub assay_end: f64,    // hosts alive then are censored
    pub replicates: usize,
    pub seed: u64,
    pub models: Vec<ModelKind>,
    pub threads: usize,    // 0 = rayon's global pool
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            n_clones: 10,
            hosts_per_clone: 10,
            effect: 2.0_f64.ln(),
            clone_sd: 0.5,
            shape: 1.5,
            scale: 0.05,
            assay_end: 10.0,
            replicates: 200,
            seed: 2024,
            models: vec![ModelKind::Cox, ModelKind::CoxRobust, ModelKind::Frailty],
            threads: 0,
        }
    }
}

impl SimulationConfig {
    pub fn validate(&self) -> Result<()> {
        if self.n_clones < 2 {
            return Err(SurvError::invalid_parameter("simulation.n_clones", self.n_clones));
        }
        if self.hosts_per_clone == 0 {
            return Err(SurvError::invalid_parameter("simulation.hosts_per_clone", self.hosts_per_clone));
        }
        if self.replicates == 0 {
            return Err(SurvError::invalid_parameter("simulation.replicates", self.replicates));
        }
        if self.models.is_empty() {
            return Err(SurvError::invalid_parameter("simulation.models", "[]"));
        }
        for (name, value) in [("shape", self.shape), ("scale", self.scale), ("assay_end", self.assay_end)] {
            if !(value > 0.0 && value.is_finite()) {
                return Err(SurvError::invalid_parameter(format!("simulation.{}", name), value));
            }
        }
        if !(self.clone_sd >= 0.0 && self.clone_sd.is_finite()) {
            return Err(SurvError::invalid_parameter("simulation.clone_sd", self.clone_sd));
        }
        if !self.effect.is_finite() {
            return Err(SurvError::invalid_parameter("simulation.effect", self.effect));
        }
        Ok(())
    }

    /// name of the coefficient every replicate reports
    pub fn treatment_term(&self) -> String {
        format!("treatment{}", TREATED_LEVEL)
    }
}

/// one synthetic assay: clones alternate between ancestor and evolved,
/// every host of a clone shares its frailty
pub fn simulate_assay<R: Rng + ?Sized>(config: &SimulationConfig, rng: &mut R) -> Result<AssayTable> {
    let frailty = Normal::new(0.0, config.clone_sd)
        .map_err(|_| SurvError::invalid_parameter("simulation.clone_sd", config.clone_sd))?;

    let mut records = Vec::with_capacity(config.n_clones * config.hosts_per_clone);
    for c in 0..config.n_clones {
        let evolved = c % 2 == 1;
        let level = if evolved { TREATED_LEVEL } else { REFERENCE_LEVEL };
        let b = frailty.sample(rng);
        let eta = b + if evolved { config.effect } else { 0.0 };
        let clone = format!("clone{:02}", c + 1);

        for _ in 0..config.hosts_per_clone {
            // inverse of S(t) = exp(-scale exp(eta) t^shape)
            let u: f64 = 1.0 - rng.gen::<f64>();
            let t = (-u.ln() / (config.scale * eta.exp())).powf(1.0 / config.shape);
            let (time, event) = if t < config.assay_end { (t, true) } else { (config.assay_end, false) };
            records.push(AssayRecord::new(clone.as_str(), vec![level.to_string()], time, event));
        }
    }
    AssayTable::new(vec!["treatment".to_string()], records)
}

/// the treatment row of one model on one replicate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicateEstimate {
    pub replicate: usize,
    pub model: String,
    pub estimate: f64,
    pub std_error: f64,
    pub p_value: Option<f64>,
    pub conf_low: f64,
    pub conf_high: f64,
}

/// a model that could not be fitted on a replicate
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplicateFailure {
    pub replicate: usize,
    pub model: String,
    pub message: String,
}

#[derive(Debug, Clone, Default)]
pub struct SimulationResults {
    pub models: Vec<ModelKind>,
    pub estimates: Vec<ReplicateEstimate>,
    pub failures: Vec<ReplicateFailure>,
    pub conf_level: f64,
}

fn run_replicate(
    replicate: usize,
    config: &SimulationConfig,
    settings: &ModelSettings,
) -> Result<(Vec<ReplicateEstimate>, Vec<ReplicateFailure>)> {
    let mut rng = StdRng::seed_from_u64(config.seed.wrapping_add(replicate as u64));
    let table = simulate_assay(config, &mut rng)?;

    let mut spec = DesignSpec::default();
    spec.reference_levels.insert("treatment".into(), REFERENCE_LEVEL.into());
    let data = match design::model_frame(&table, &spec) {
        Ok(data) => data,
        Err(e) => {
            // every model fails together when the replicate itself is unusable
            warn!("replicate {}: {}", replicate, e);
            let failures = config.models.iter().map(|m| ReplicateFailure {
                replicate,
                model: m.name().to_string(),
                message: e.to_string(),
            });
            return Ok((Vec::new(), failures.collect()));
        }
    };

    let term = config.treatment_term();
    let mut estimates = Vec::new();
    let mut failures = Vec::new();
    for &kind in &config.models {
        match analysis::fit(kind, &data, settings) {
            Ok(fitted) => {
                match fitted.tidy().into_iter().find(|row| row.term == term) {
                    Some(row) => estimates.push(ReplicateEstimate {
                        replicate,
                        model: row.model,
                        estimate: row.estimate,
                        std_error: row.std_error,
                        p_value: row.p_value,
                        conf_low: row.conf_low,
                        conf_high: row.conf_high,
                    }),
                    None => failures.push(ReplicateFailure {
                        replicate,
                        model: kind.name().to_string(),
                        message: format!("no {} term in the fit", term),
                    }),
                }
            }
            Err(e) => {
                warn!("replicate {} model {}: {}", replicate, kind, e);
                failures.push(ReplicateFailure {
                    replicate,
                    model: kind.name().to_string(),
                    message: e.to_string(),
                });
            }
        }
    }
    Ok((estimates, failures))
}

/// run every replicate; output order does not depend on the thread count
pub fn run(config: &SimulationConfig, settings: &ModelSettings) -> Result<SimulationResults> {
    config.validate()?;
    stats::normal_critical(settings.conf_level)?;
    info!(
        "simulating {} replicates of {} clones x {} hosts, models {:?}",
        config.replicates, config.n_clones, config.hosts_per_clone,
        config.models.iter().map(ModelKind::name).collect::<Vec<_>>()
    );

    let run_all = || -> Result<Vec<_>> {
        (0..config.replicates)
            .into_par_iter()
            .map(|r| run_replicate(r, config, settings))
            .collect()
    };

    let per_replicate = if config.threads > 0 {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.threads)
            .build()
            .map_err(|e| SurvError::invalid_parameter("simulation.threads", e))?;
        pool.install(run_all)?
    } else {
        run_all()?
    };

    let mut results = SimulationResults {
        models: config.models.clone(),
        conf_level: settings.conf_level,
        ..Default::default()
    };
    for (estimates, failures) in per_replicate {
        results.estimates.extend(estimates);
        results.failures.extend(failures);
    }
    if !results.failures.is_empty() {
        warn!("{} fits failed across {} replicates", results.failures.len(), config.replicates);
    }
    info!("simulation done: {} estimates", results.estimates.len());
    Ok(results)
}

/// operating characteristics of one model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationSummary {
    pub model: String,
    pub replicates: usize,     // fits that produced an estimate
    pub failures: usize,
    pub mean_estimate: f64,
    pub bias: f64,
    pub rmse: f64,
    pub mean_se: f64,
    pub empirical_sd: f64,
    pub coverage: f64,         // share of intervals containing the truth
    pub rejection_rate: f64,   // share rejecting beta = 0 at 1 - conf_level
}

/// per-model bias, precision and coverage against the true effect
pub fn summarize(results: &SimulationResults, truth: f64) -> Vec<SimulationSummary> {
    let alpha = 1.0 - results.conf_level;
    results
        .models
        .iter()
        .map(|kind| {
            let name = kind.name();
            let rows: Vec<&ReplicateEstimate> = results.estimates.iter().filter(|e| e.model == name).collect();
            let failures = results.failures.iter().filter(|f| f.model == name).count();
            let share = |pred: &dyn Fn(&ReplicateEstimate) -> bool| {
                if rows.is_empty() {
                    f64::NAN
                } else {
                    rows.iter().filter(|r| pred(r)).count() as f64 / rows.len() as f64
                }
            };

            let estimates: Vec<f64> = rows.iter().map(|r| r.estimate).collect();
            let std_errors: Vec<f64> = rows.iter().map(|r| r.std_error).collect();
            let (mean_estimate, empirical_sd) = stats::mean_sd(&estimates);
            let (mean_se, _) = stats::mean_sd(&std_errors);
            let rmse = if rows.is_empty() {
                f64::NAN
            } else {
                (estimates.iter().map(|e| (e - truth).powi(2)).sum::<f64>() / rows.len() as f64).sqrt()
            };

            SimulationSummary {
                model: name.to_string(),
                replicates: rows.len(),
                failures,
                mean_estimate,
                bias: mean_estimate - truth,
                rmse,
                mean_se,
                empirical_sd,
                coverage: share(&|r| r.conf_low <= truth && truth <= r.conf_high),
                rejection_rate: share(&|r| match r.p_value {
                    Some(p) => p < alpha,
                    None => r.conf_low > 0.0 || r.conf_high < 0.0,
                }),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bayes::BayesConfig;
    use approx::assert_relative_eq;

    fn small() -> SimulationConfig {
        SimulationConfig {
            n_clones: 6,
            hosts_per_clone: 8,
            replicates: 12,
            models: vec![ModelKind::Cox, ModelKind::CoxRobust],
            ..Default::default()
        }
    }

    #[test]
    fn test_simulated_assay_layout() {
        let config = small();
        let mut rng = StdRng::seed_from_u64(7);
        let table = simulate_assay(&config, &mut rng).unwrap();
        assert_eq!(table.len(), 48);
        assert_eq!(table.clones().len(), 6);
        assert_eq!(table.levels(0), vec![REFERENCE_LEVEL, TREATED_LEVEL]);
        // clones are nested in treatment
        for clone in table.clones() {
            let mut levels: Vec<&str> = table
                .records()
                .iter()
                .filter(|r| r.clone == clone)
                .map(|r| r.factors[0].as_str())
                .collect();
            levels.dedup();
            assert_eq!(levels.len(), 1);
        }
        assert!(table.records().iter().all(|r| r.time <= config.assay_end));
        assert!(table.records().iter().filter(|r| !r.event).all(|r| r.time == config.assay_end));
    }

    #[test]
    fn test_results_ignore_thread_count() {
        let one = SimulationConfig { threads: 1, ..small() };
        let three = SimulationConfig { threads: 3, ..small() };
        let a = run(&one, &ModelSettings::default()).unwrap();
        let b = run(&three, &ModelSettings::default()).unwrap();
        assert_eq!(a.estimates, b.estimates);
        assert_eq!(a.estimates.len(), 24);
        assert!(a.failures.is_empty());
    }

    #[test]
    fn test_failed_fits_are_counted() {
        // nobody dies before the assay ends
        let config = SimulationConfig { assay_end: 1e-9, replicates: 3, ..small() };
        let results = run(&config, &ModelSettings::default()).unwrap();
        assert!(results.estimates.is_empty());
        assert_eq!(results.failures.len(), 6);

        let summary = summarize(&results, config.effect);
        assert_eq!(summary[0].replicates, 0);
        assert_eq!(summary[0].failures, 3);
        assert!(summary[0].coverage.is_nan());
    }

    #[test]
    fn test_summarize_by_hand() {
        let row = |replicate, estimate: f64, p: f64| ReplicateEstimate {
            replicate,
            model: "coxph".into(),
            estimate,
            std_error: 0.2,
            p_value: Some(p),
            conf_low: estimate - 0.4,
            conf_high: estimate + 0.4,
        };
        let results = SimulationResults {
            models: vec![ModelKind::Cox],
            estimates: vec![row(0, 0.5, 0.01), row(1, 1.0, 0.001), row(2, 1.5, 0.2)],
            failures: vec![ReplicateFailure { replicate: 3, model: "coxph".into(), message: "x".into() }],
            conf_level: 0.95,
        };
        let s = &summarize(&results, 1.0)[0];
        assert_eq!(s.replicates, 3);
        assert_eq!(s.failures, 1);
        assert_relative_eq!(s.mean_estimate, 1.0);
        assert_relative_eq!(s.bias, 0.0);
        assert_relative_eq!(s.rmse, (0.5_f64 / 3.0).sqrt());
        assert_relative_eq!(s.empirical_sd, 0.5);
        assert_relative_eq!(s.mean_se, 0.2);
        assert_relative_eq!(s.coverage, 1.0 / 3.0);
        assert_relative_eq!(s.rejection_rate, 2.0 / 3.0);
    }

    #[test]
    fn test_interval_rejection_without_p_values() {
        let row = |replicate, model: &str, p_value, conf_low, conf_high| ReplicateEstimate {
            replicate,
            model: model.into(),
            estimate: 0.5 * (conf_low + conf_high),
            std_error: 0.3,
            p_value,
            conf_low,
            conf_high,
        };
        let results = SimulationResults {
            models: vec![ModelKind::Cox, ModelKind::Weibull],
            estimates: vec![
                // p-value decides even though the interval holds zero
                row(0, "coxph", Some(0.01), -0.1, 1.0),
                row(1, "coxph", Some(0.3), 0.2, 1.0),
                row(0, "weibull_bayes", None, 0.1, 1.0),   // wholly above zero
                row(1, "weibull_bayes", None, -1.0, -0.2), // wholly below zero
                row(2, "weibull_bayes", None, -0.3, 0.5),
                row(3, "weibull_bayes", None, 0.0, 0.8),   // touches zero
            ],
            failures: vec![],
            conf_level: 0.95,
        };
        let summaries = summarize(&results, 0.3);

        assert_relative_eq!(summaries[0].rejection_rate, 0.5);
        let bayes = &summaries[1];
        assert_eq!(bayes.model, "weibull_bayes");
        assert_eq!(bayes.replicates, 4);
        assert_relative_eq!(bayes.rejection_rate, 0.5);
        assert_relative_eq!(bayes.coverage, 0.75);
    }

    #[test]
    fn test_bayes_replicates() {
        let config = SimulationConfig {
            n_clones: 4,
            hosts_per_clone: 6,
            replicates: 2,
            models: vec![ModelKind::Weibull],
            ..Default::default()
        };
        let settings = ModelSettings {
            bayes: BayesConfig { chains: 2, warmup: 100, draws: 100, ..Default::default() },
            ..Default::default()
        };
        let results = run(&config, &settings).unwrap();
        assert_eq!(results.estimates.len() + results.failures.len(), 2);
        for e in &results.estimates {
            assert_eq!(e.model, "weibull_bayes");
            assert!(e.p_value.is_none());
            assert!(e.conf_low < e.estimate && e.estimate < e.conf_high);
        }

        let summary = &summarize(&results, config.effect)[0];
        assert_eq!(summary.replicates + summary.failures, 2);
    }

    #[test]
    fn test_invalid_config() {
        assert!(SimulationConfig { n_clones: 1, ..small() }.validate().is_err());
        assert!(SimulationConfig { models: vec![], ..small() }.validate().is_err());
        assert!(SimulationConfig { shape: 0.0, ..small() }.validate().is_err());
    }
}
