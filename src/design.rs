//! model frame - treatment contrasts from assay factors

use std::collections::BTreeMap;
use log::debug;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use crate::{
    assay::AssayTable,
    data::{Clusters, SurvivalData},
    error::{SurvError, Result},
};

/// how factors become covariate columns
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DesignSpec {
    /// factor -> baseline level; missing factors use their first sorted level
    pub reference_levels: BTreeMap<String, String>,
    /// add product columns when there are two factors
    pub interaction: bool,
}

/// indicator columns for one factor
#[derive(Debug, Clone, PartialEq)]
pub struct Contrast {
    pub factor: String,
    pub reference: String,
    pub levels: Vec<String>, // non-reference levels, one column each
}

impl Contrast {
    pub fn column_names(&self) -> Vec<String> {
        self.levels.iter().map(|l| format!("{}{}", self.factor, l)).collect()
    }
}

/// treatment contrast for the factor at `position`
pub fn treatment_contrast(table: &AssayTable, position: usize, spec: &DesignSpec) -> Result<Contrast> {
    let factor = table
        .factor_names()
        .get(position)
        .ok_or_else(|| SurvError::invalid_parameter("factor", position))?
        .clone();
    let levels = table.levels(position);
    if levels.len() < 2 {
        return Err(SurvError::invalid_survival_data(format!(
            "factor {} has a single level ({}) - nothing to contrast",
            factor,
            levels.join(", ")
        )));
    }

    let reference = match spec.reference_levels.get(&factor) {
        Some(level) if levels.contains(level) => level.clone(),
        Some(level) => {
            return Err(SurvError::invalid_parameter(
                format!("reference_levels.{}", factor), level
            ));
        }
        None => levels[0].clone(),
    };
    let levels = levels.into_iter().filter(|l| *l != reference).collect();
    Ok(Contrast { factor, reference, levels })
}

/// covariates, term names and clone clusters for an assay
pub fn model_frame(table: &AssayTable, spec: &DesignSpec) -> Result<SurvivalData> {
    for factor in spec.reference_levels.keys() {
        if table.factor_position(factor).is_none() {
            return Err(SurvError::invalid_parameter("reference_levels", factor));
        }
    }

    let contrasts = (0..table.factor_names().len())
        .map(|f| treatment_contrast(table, f, spec))
        .collect::<Result<Vec<_>>>()?;

    let mut names: Vec<String> = contrasts.iter().flat_map(Contrast::column_names).collect();
    let main_effects = names.len();
    let with_interaction = spec.interaction && contrasts.len() == 2;
    if with_interaction {
        let left = contrasts[0].column_names();
        let right = contrasts[1].column_names();
        for a in &left {
            for b in &right {
                names.push(format!("{}:{}", a, b));
            }
        }
    }

    let n = table.len();
    let mut x = Array2::zeros((n, names.len()));
    for (i, record) in table.records().iter().enumerate() {
        let mut col = 0;
        for (f, contrast) in contrasts.iter().enumerate() {
            for level in &contrast.levels {
                if record.factors[f] == *level {
                    x[[i, col]] = 1.0;
                }
                col += 1;
            }
        }
        if with_interaction {
            let left = contrasts[0].levels.len();
            let right = contrasts[1].levels.len();
            for a in 0..left {
                for b in 0..right {
                    x[[i, col]] = x[[i, a]] * x[[i, left + b]];
                    col += 1;
                }
            }
        }
    }
    debug!("model frame: {} hosts, {} main effects, terms {:?}", n, main_effects, names);

    let times = table.records().iter().map(|r| r.time).collect();
    let events = table.records().iter().map(|r| r.event).collect();
    let clones: Vec<&str> = table.records().iter().map(|r| r.clone.as_str()).collect();

    SurvivalData::new(times, events, x)?
        .with_term_names(names)?
        .with_clusters(Clusters::from_labels(&clones))
}
