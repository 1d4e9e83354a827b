//! one entry point over every model, plus side-by-side comparison

use std::fmt;
use std::str::FromStr;
use log::info;
use ndarray::{Array1, ArrayView2};
use serde::{Deserialize, Serialize};
use crate::{
    bayes::{BayesConfig, BayesWeibullModel},
    data::SurvivalData,
    error::{SurvError, Result},
    frailty::FrailtyCoxModel,
    metrics::{self, ModelMetrics},
    model::CoxModel,
    optimization::Ties,
    piecewise::PiecewiseExponentialModel,
    report::TermEstimate,
};

/// size of a fitted model, for information criteria
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FitStatistics {
    pub model: String,
    pub log_likelihood: Option<f64>, // None when there is no likelihood to report
    pub n_parameters: usize,
    pub n_samples: usize,
    pub n_events: usize,
}

/// anything fitted that can be tidied
pub trait SurvivalFit: Send {
    fn model_name(&self) -> &str;

    /// one row per reported term
    fn tidy(&self) -> Vec<TermEstimate>;

    fn fit_statistics(&self) -> FitStatistics;

    /// higher = dies sooner; None when the model has no such score
    fn risk_scores(&self, _covariates: ArrayView2<f64>) -> Option<Array1<f64>> {
        None
    }
}

/// the models this crate can fit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelKind {
    #[serde(rename = "coxph")]
    Cox,
    #[serde(rename = "coxph_robust")]
    CoxRobust,
    #[serde(rename = "coxme")]
    Frailty,
    #[serde(rename = "pwe")]
    Piecewise,
    #[serde(rename = "weibull_bayes")]
    Weibull,
}

impl ModelKind {
    pub const ALL: [ModelKind; 5] = [
        ModelKind::Cox,
        ModelKind::CoxRobust,
        ModelKind::Frailty,
        ModelKind::Piecewise,
        ModelKind::Weibull,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ModelKind::Cox => "coxph",
            ModelKind::CoxRobust => "coxph_robust",
            ModelKind::Frailty => "coxme",
            ModelKind::Piecewise => "pwe",
            ModelKind::Weibull => "weibull_bayes",
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ModelKind {
    type Err = SurvError;

    fn from_str(s: &str) -> Result<Self> {
        ModelKind::ALL
            .into_iter()
            .find(|k| k.name() == s)
            .ok_or_else(|| SurvError::invalid_parameter("model", s))
    }
}

/// knobs shared by all models
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSettings {
    pub conf_level: f64,
    pub ties: Ties,
    pub max_iterations: usize,
    pub tolerance: f64,
    pub piecewise_cuts: Option<Vec<f64>>,
    pub bayes: BayesConfig,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            conf_level: 0.95,
            ties: Ties::default(),
            max_iterations: 50,
            tolerance: 1e-9,
            piecewise_cuts: None,
            bayes: BayesConfig::default(),
        }
    }
}

/// fit one model by name
pub fn fit(kind: ModelKind, data: &SurvivalData, settings: &ModelSettings) -> Result<Box<dyn SurvivalFit>> {
    let cox = || {
        CoxModel::new()
            .with_ties(settings.ties)
            .with_max_iterations(settings.max_iterations)
            .with_tolerance(settings.tolerance)
            .with_conf_level(settings.conf_level)
    };

    let fitted: Box<dyn SurvivalFit> = match kind {
        ModelKind::Cox => Box::new(cox().fit(data)?),
        ModelKind::CoxRobust => Box::new(cox().with_robust_variance(true).fit(data)?),
        ModelKind::Frailty => Box::new(
            FrailtyCoxModel::new()
                .with_ties(settings.ties)
                .with_max_iterations(settings.max_iterations)
                .with_tolerance(settings.tolerance)
                .with_conf_level(settings.conf_level)
                .fit(data)?,
        ),
        ModelKind::Piecewise => {
            let mut model = PiecewiseExponentialModel::new()
                .with_max_iterations(settings.max_iterations)
                .with_tolerance(settings.tolerance)
                .with_conf_level(settings.conf_level);
            if let Some(cuts) = &settings.piecewise_cuts {
                model = model.with_cuts(cuts.clone());
            }
            Box::new(model.fit(data)?)
        }
        ModelKind::Weibull => Box::new(
            BayesWeibullModel::new(settings.bayes.clone())
                .with_conf_level(settings.conf_level)
                .fit(data)?,
        ),
    };
    Ok(fitted)
}

/// tidy rows and fit metrics of several models on the same data
#[derive(Debug, Clone, Default)]
pub struct Comparison {
    pub estimates: Vec<TermEstimate>,
    pub metrics: Vec<ModelMetrics>,
}

pub fn compare(data: &SurvivalData, kinds: &[ModelKind], settings: &ModelSettings) -> Result<Comparison> {
    if kinds.is_empty() {
        return Err(SurvError::invalid_parameter("models", "[] (nothing to compare)"));
    }

    let mut comparison = Comparison::default();
    for &kind in kinds {
        let fitted = fit(kind, data, settings)?;
        let stats = fitted.fit_statistics();

        let c_index = fitted
            .risk_scores(data.covariates())
            .map(|risk| metrics::harrell_c_index(risk.view(), data.times(), data.events()))
            .transpose()?;

        comparison.metrics.push(ModelMetrics {
            model: stats.model.clone(),
            log_likelihood: stats.log_likelihood,
            n_parameters: stats.n_parameters,
            aic: stats.log_likelihood.map(|ll| metrics::aic(ll, stats.n_parameters)),
            bic: stats.log_likelihood.map(|ll| metrics::bic(ll, stats.n_parameters, stats.n_events)),
            c_index,
        });
        comparison.estimates.extend(fitted.tidy());
        info!("fitted {} ({} terms)", kind, comparison.estimates.len());
    }
    Ok(comparison)
}
