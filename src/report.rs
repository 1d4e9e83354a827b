//! tidy result tables - one row per model term, writable as csv, json or text

use std::fmt::Write as _;
use std::io::Write;
use serde::{Deserialize, Serialize};
use crate::{
    error::Result,
    km::StratifiedCurves,
    metrics::ModelMetrics,
    simulation::SimulationSummary,
};

/// one term of one fitted model, on the log-hazard scale
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TermEstimate {
    pub model: String,
    pub term: String,
    pub estimate: f64,
    pub std_error: f64,
    pub statistic: Option<f64>, // wald z where one exists
    pub p_value: Option<f64>,
    pub conf_low: f64,
    pub conf_high: f64,
}

impl TermEstimate {
    pub fn hazard_ratio(&self) -> f64 {
        self.estimate.exp()
    }

    /// does the interval cover `value`
    pub fn covers(&self, value: f64) -> bool {
        self.conf_low <= value && value <= self.conf_high
    }
}

/// write any rows as csv with a header
pub fn write_csv<W: Write, T: Serialize>(rows: &[T], out: W) -> Result<()> {
    let mut writer = csv::Writer::from_writer(out);
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

/// write any rows as a pretty json array
pub fn write_json<W: Write, T: Serialize>(rows: &[T], out: W) -> Result<()> {
    serde_json::to_writer_pretty(out, rows)?;
    Ok(())
}

fn fmt_opt(value: Option<f64>, precision: usize) -> String {
    match value {
        Some(v) if v.is_finite() => format!("{:.*}", precision, v),
        _ => "-".to_string(),
    }
}

/// aligned text table of term estimates with hazard ratios
pub fn render_estimates(rows: &[TermEstimate]) -> String {
    let term_width = rows.iter().map(|r| r.term.len()).max().unwrap_or(4).max(4);
    let model_width = rows.iter().map(|r| r.model.len()).max().unwrap_or(5).max(5);

    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<mw$} {:<tw$} {:>10} {:>10} {:>8} {:>10} {:>10} {:>10} {:>10}",
        "model", "term", "estimate", "std.error", "z", "p.value", "conf.low", "conf.high", "HR",
        mw = model_width, tw = term_width,
    );
    let _ = writeln!(out, "{:-<w$}", "", w = model_width + term_width + 82);
    for r in rows {
        let _ = writeln!(
            out,
            "{:<mw$} {:<tw$} {:>10.4} {:>10.4} {:>8} {:>10} {:>10.4} {:>10.4} {:>10.4}",
            r.model, r.term, r.estimate, r.std_error,
            fmt_opt(r.statistic, 3), fmt_opt(r.p_value, 4),
            r.conf_low, r.conf_high, r.hazard_ratio(),
            mw = model_width, tw = term_width,
        );
    }
    out
}

/// one line per model: fit size, information criteria, concordance
pub fn render_metrics(rows: &[ModelMetrics]) -> String {
    let model_width = rows.iter().map(|r| r.model.len()).max().unwrap_or(5).max(5);
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<mw$} {:>12} {:>6} {:>12} {:>12} {:>8}",
        "model", "logLik", "df", "AIC", "BIC", "C",
        mw = model_width,
    );
    for r in rows {
        let _ = writeln!(
            out,
            "{:<mw$} {:>12} {:>6} {:>12} {:>12} {:>8}",
            r.model, fmt_opt(r.log_likelihood, 3), r.n_parameters,
            fmt_opt(r.aic, 2), fmt_opt(r.bic, 2), fmt_opt(r.c_index, 3),
            mw = model_width,
        );
    }
    out
}

/// bias and coverage per model
pub fn render_summaries(rows: &[SimulationSummary]) -> String {
    let model_width = rows.iter().map(|r| r.model.len()).max().unwrap_or(5).max(5);
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<mw$} {:>5} {:>5} {:>9} {:>9} {:>9} {:>9} {:>9} {:>9} {:>9}",
        "model", "n", "fail", "mean", "bias", "rmse", "mean.se", "emp.sd", "coverage", "power",
        mw = model_width,
    );
    for r in rows {
        let _ = writeln!(
            out,
            "{:<mw$} {:>5} {:>5} {:>9.4} {:>9.4} {:>9.4} {:>9.4} {:>9.4} {:>9.3} {:>9.3}",
            r.model, r.replicates, r.failures, r.mean_estimate, r.bias, r.rmse,
            r.mean_se, r.empirical_sd, r.coverage, r.rejection_rate,
            mw = model_width,
        );
    }
    out
}

/// per-stratum counts and medians, then the log-rank test
pub fn render_curves(curves: &StratifiedCurves) -> String {
    let width = curves.strata.iter().map(|(l, _)| l.len()).max().unwrap_or(6).max(6);
    let mut out = String::new();
    let _ = writeln!(out, "{:<w$} {:>6} {:>6} {:>10}", "strata", "n", "deaths", "median", w = width);
    for (label, km) in &curves.strata {
        let _ = writeln!(
            out,
            "{:<w$} {:>6} {:>6} {:>10}",
            label, km.n, km.n_events, fmt_opt(km.median, 2),
            w = width,
        );
    }
    if let Some(test) = &curves.log_rank {
        let _ = writeln!(
            out,
            "\nlog-rank: chisq = {:.3} on {} df, p = {}",
            test.chi_squared, test.df, fmt_opt(Some(test.p_value), 4),
        );
    }
    out
}
