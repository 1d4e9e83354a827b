//! analysis settings, loaded from json - every section is optional

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use log::info;
use serde::{Deserialize, Serialize};
use crate::{
    analysis::ModelSettings,
    assay::ColumnSpec,
    bayes::BayesConfig,
    design::DesignSpec,
    error::{SurvError, Result},
    optimization::Ties,
    simulation::SimulationConfig,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub columns: ColumnSpec,
    pub design: DesignSpec,
    pub conf_level: f64,
    pub ties: Ties,
    pub max_iterations: usize,
    pub tolerance: f64,
    pub piecewise_cuts: Option<Vec<f64>>,
    pub bayes: BayesConfig,
    pub simulation: SimulationConfig,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        let settings = ModelSettings::default();
        Self {
            columns: ColumnSpec::default(),
            design: DesignSpec::default(),
            conf_level: settings.conf_level,
            ties: settings.ties,
            max_iterations: settings.max_iterations,
            tolerance: settings.tolerance,
            piecewise_cuts: None,
            bayes: BayesConfig::default(),
            simulation: SimulationConfig::default(),
        }
    }
}

impl AnalysisConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let config: Self = serde_json::from_reader(BufReader::new(File::open(path)?))?;
        config.validate()?;
        info!("loaded config from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.conf_level > 0.0 && self.conf_level < 1.0) {
            return Err(SurvError::invalid_parameter("conf_level", self.conf_level));
        }
        if self.max_iterations == 0 {
            return Err(SurvError::invalid_parameter("max_iterations", self.max_iterations));
        }
        if !(self.tolerance > 0.0 && self.tolerance.is_finite()) {
            return Err(SurvError::invalid_parameter("tolerance", self.tolerance));
        }
        if let Some(cuts) = &self.piecewise_cuts {
            if cuts.is_empty() || cuts.iter().any(|c| !(c.is_finite() && *c > 0.0)) {
                return Err(SurvError::invalid_parameter("piecewise_cuts", format!("{:?}", cuts)));
            }
        }
        self.columns.validate()?;
        self.bayes.validate()?;
        self.simulation.validate()
    }

    /// the per-fit knobs
    pub fn model_settings(&self) -> ModelSettings {
        ModelSettings {
            conf_level: self.conf_level,
            ties: self.ties,
            max_iterations: self.max_iterations,
            tolerance: self.tolerance,
            piecewise_cuts: self.piecewise_cuts.clone(),
            bayes: self.bayes.clone(),
        }
    }
}
