//! kaplan-meier curves and the log-rank test

use std::collections::BTreeMap;
use ndarray::Array2;
use serde::Serialize;
use crate::{
    assay::AssayTable,
    error::{SurvError, Result},
    linalg,
    stats,
};

/// one step of a survival curve
#[derive(Debug, Clone, PartialEq)]
pub struct KaplanMeierStep {
    pub time: f64,
    pub n_risk: usize,     // just before time
    pub n_events: usize,
    pub n_censored: usize,
    pub survival: f64,     // just after time
    pub std_error: f64,    // greenwood
    pub ci_lower: f64,
    pub ci_upper: f64,
}

/// a kaplan-meier curve with one step per distinct death time
#[derive(Debug, Clone)]
pub struct KaplanMeierEstimate {
    pub steps: Vec<KaplanMeierStep>,
    /// first time S(t) < 0.5; when the curve sits at exactly 0.5 the
    /// midpoint to the next death time, as R's survfit reports it
    pub median: Option<f64>,
    pub conf_level: f64,
    pub n: usize,
    pub n_events: usize,
}

impl KaplanMeierEstimate {
    /// S(t), right-continuous step function
    pub fn survival_at(&self, t: f64) -> f64 {
        match self.steps.partition_point(|s| s.time <= t) {
            0 => 1.0,
            k => self.steps[k - 1].survival,
        }
    }
}

fn validate(times: &[f64], events: &[bool]) -> Result<()> {
    if times.is_empty() {
        return Err(SurvError::invalid_survival_data("times must be non-empty"));
    }
    if times.len() != events.len() {
        return Err(SurvError::invalid_dimensions(
            format!("times len ({}) != events len ({})", times.len(), events.len())
        ));
    }
    if times.iter().any(|t| !t.is_finite() || *t < 0.0) {
        return Err(SurvError::invalid_survival_data("times must be finite and >= 0"));
    }
    Ok(())
}

/// product-limit estimate with greenwood variance and log-log intervals
pub fn kaplan_meier(times: &[f64], events: &[bool], conf_level: f64) -> Result<KaplanMeierEstimate> {
    validate(times, events)?;
    let z = stats::normal_critical(conf_level)?;

    let n = times.len();
    let total_events = events.iter().filter(|&&e| e).count();

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| times[a].total_cmp(&times[b]));

    let mut steps = Vec::new();
    let mut n_risk = n;
    let mut s = 1.0_f64;
    let mut greenwood = 0.0_f64;

    let mut i = 0;
    while i < n {
        let t = times[order[i]];
        let mut d = 0usize;
        let mut c = 0usize;
        while i < n && times[order[i]] == t {
            if events[order[i]] {
                d += 1;
            } else {
                c += 1;
            }
            i += 1;
        }

        if d > 0 {
            let nj = n_risk as f64;
            let dj = d as f64;
            s *= 1.0 - dj / nj;
            if nj > dj {
                greenwood += dj / (nj * (nj - dj));
            }

            let (ci_lower, ci_upper) = if s > 0.0 && s < 1.0 {
                let log_h = (-s.ln()).ln();
                let se = greenwood.sqrt() / s.ln().abs();
                let lo = (-(log_h + z * se).exp()).exp();
                let hi = (-(log_h - z * se).exp()).exp();
                (lo.clamp(0.0, 1.0), hi.clamp(0.0, 1.0))
            } else if s <= 0.0 {
                (0.0, 0.0)
            } else {
                (1.0, 1.0)
            };

            steps.push(KaplanMeierStep {
                time: t,
                n_risk,
                n_events: d,
                n_censored: c,
                survival: s,
                std_error: s * greenwood.sqrt(),
                ci_lower,
                ci_upper,
            });
        }
        n_risk -= d + c;
    }

    let median = median_time(&steps);

    Ok(KaplanMeierEstimate { steps, median, conf_level, n, n_events: total_events })
}

fn median_time(steps: &[KaplanMeierStep]) -> Option<f64> {
    let k = steps.iter().position(|st| st.survival <= 0.5 + 1e-12)?;
    if (steps[k].survival - 0.5).abs() <= 1e-12 {
        if let Some(next) = steps.get(k + 1) {
            return Some(0.5 * (steps[k].time + next.time));
        }
    }
    Some(steps[k].time)
}

/// one plotting row of a stratified curve
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CurvePoint {
    pub strata: String,
    pub time: f64,
    pub n_risk: usize,
    pub n_event: usize,
    pub n_censor: usize,
    pub survival: f64,
    pub conf_low: f64,
    pub conf_high: f64,
}

/// curves per stratum, strata in sorted order
#[derive(Debug, Clone)]
pub struct StratifiedCurves {
    pub strata: Vec<(String, KaplanMeierEstimate)>,
    pub log_rank: Option<LogRankResult>,
}

impl StratifiedCurves {
    /// long-format rows, each curve starting at (0, 1)
    pub fn points(&self) -> Vec<CurvePoint> {
        let mut rows = Vec::new();
        for (label, km) in &self.strata {
            rows.push(CurvePoint {
                strata: label.clone(),
                time: 0.0,
                n_risk: km.n,
                n_event: 0,
                n_censor: 0,
                survival: 1.0,
                conf_low: 1.0,
                conf_high: 1.0,
            });
            rows.extend(km.steps.iter().map(|st| CurvePoint {
                strata: label.clone(),
                time: st.time,
                n_risk: st.n_risk,
                n_event: st.n_events,
                n_censor: st.n_censored,
                survival: st.survival,
                conf_low: st.ci_lower,
                conf_high: st.ci_upper,
            }));
        }
        rows
    }
}

/// kaplan-meier curves of an assay split by the given factor columns
/// (no factors = one pooled curve); log-rank across strata when there are
/// at least two
pub fn survfit(table: &AssayTable, by: &[String], conf_level: f64) -> Result<StratifiedCurves> {
    let mut positions = Vec::with_capacity(by.len());
    for name in by {
        let pos = table.factor_position(name).ok_or_else(|| {
            SurvError::invalid_parameter("by", name)
        })?;
        positions.push(pos);
    }

    let mut groups: BTreeMap<String, (Vec<f64>, Vec<bool>)> = BTreeMap::new();
    let mut labels = Vec::with_capacity(table.len());
    for record in table.records() {
        let label = if positions.is_empty() {
            "all".to_string()
        } else {
            by.iter()
                .zip(&positions)
                .map(|(name, &p)| format!("{}={}", name, record.factors[p]))
                .collect::<Vec<_>>()
                .join(", ")
        };
        let entry = groups.entry(label.clone()).or_default();
        entry.0.push(record.time);
        entry.1.push(record.event);
        labels.push(label);
    }

    let mut strata = Vec::with_capacity(groups.len());
    for (label, (times, events)) in &groups {
        strata.push((label.clone(), kaplan_meier(times, events, conf_level)?));
    }

    let log_rank = if strata.len() >= 2 {
        let index: BTreeMap<&str, usize> = groups.keys().enumerate().map(|(i, k)| (k.as_str(), i)).collect();
        let group_ids: Vec<usize> = labels.iter().map(|l| index[l.as_str()]).collect();
        let times: Vec<f64> = table.records().iter().map(|r| r.time).collect();
        let events: Vec<bool> = table.records().iter().map(|r| r.event).collect();
        Some(log_rank_test(&times, &events, &group_ids)?)
    } else {
        None
    };

    Ok(StratifiedCurves { strata, log_rank })
}

/// log-rank (mantel-cox) test
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogRankResult {
    pub chi_squared: f64,
    pub df: usize,
    pub p_value: f64,
    pub observed: Vec<f64>, // per group id, zero for empty ids
    pub expected: Vec<f64>,
}

/// compare survival across groups `0..G`; chi-squared with one df fewer
/// than the number of groups at risk at some death time. ids with no hosts
/// are allowed and count as empty groups
pub fn log_rank_test(times: &[f64], events: &[bool], groups: &[usize]) -> Result<LogRankResult> {
    validate(times, events)?;
    let n = times.len();
    if groups.len() != n {
        return Err(SurvError::invalid_dimensions(
            format!("groups length ({}) != times length ({})", groups.len(), n)
        ));
    }
    let g_count = groups.iter().copied().max().map_or(0, |m| m + 1);
    if g_count < 2 {
        return Err(SurvError::invalid_parameter("groups", "log-rank needs at least 2 groups"));
    }

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| times[a].total_cmp(&times[b]));

    let mut n_risk = vec![0.0_f64; g_count];
    for &g in groups {
        n_risk[g] += 1.0;
    }

    let mut observed = vec![0.0_f64; g_count];
    let mut expected = vec![0.0_f64; g_count];
    let mut v = Array2::<f64>::zeros((g_count, g_count));

    let mut i = 0;
    while i < n {
        let t = times[order[i]];
        let mut d_total = 0.0;
        let mut d_g = vec![0.0_f64; g_count];
        let mut c_g = vec![0.0_f64; g_count];
        while i < n && times[order[i]] == t {
            let g = groups[order[i]];
            if events[order[i]] {
                d_total += 1.0;
                d_g[g] += 1.0;
            } else {
                c_g[g] += 1.0;
            }
            i += 1;
        }

        let n_total: f64 = n_risk.iter().sum();
        if d_total > 0.0 && n_total >= 1.0 {
            for k in 0..g_count {
                observed[k] += d_g[k];
                expected[k] += d_total * n_risk[k] / n_total;
            }
            if n_total > 1.0 {
                // hypergeometric variance-covariance
                let factor = d_total * (n_total - d_total) / (n_total * n_total * (n_total - 1.0));
                for j in 0..g_count {
                    for k in 0..g_count {
                        let cell = if j == k {
                            n_risk[j] * (n_total - n_risk[j])
                        } else {
                            -n_risk[j] * n_risk[k]
                        };
                        v[[j, k]] += factor * cell;
                    }
                }
            }
        }

        for k in 0..g_count {
            n_risk[k] -= d_g[k] + c_g[k];
        }
    }

    // groups never at risk at a death carry no information; of the rest,
    // drop the last - the full matrix is singular
    let informative: Vec<usize> = (0..g_count).filter(|&k| v[[k, k]] > 0.0).collect();
    if informative.len() < 2 {
        return Err(SurvError::numerical_error(
            "log-rank needs at least 2 groups at risk at some death time",
        ));
    }
    let kept = &informative[..informative.len() - 1];
    let m = kept.len();
    let diff = ndarray::Array1::from_iter(kept.iter().map(|&k| observed[k] - expected[k]));
    let v_sub = Array2::from_shape_fn((m, m), |(a, b)| v[[kept[a], kept[b]]]);
    let v_inv = linalg::inverse(&v_sub)?;
    let chi_squared = diff.dot(&v_inv.dot(&diff)).max(0.0);

    Ok(LogRankResult {
        chi_squared,
        df: m,
        p_value: stats::chi_squared_sf(chi_squared, m as f64),
        observed,
        expected,
    })
}
