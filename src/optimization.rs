use log::{debug, warn};
use ndarray::{Array1, Array2, ArrayView1};
use serde::{Deserialize, Serialize};
use crate::{
    data::SurvivalData,
    error::{SurvError, Result},
    linalg,
};

/// how tied death times are handled in the partial likelihood
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Ties {
    Breslow,
    #[default]
    Efron,
}

/// value, gradient and hessian of an objective at one parameter point
#[derive(Debug, Clone)]
pub struct Derivatives {
    pub value: f64,
    pub gradient: Array1<f64>,
    pub hessian: Array2<f64>,
}

/// something newton-raphson can maximize
pub trait Objective {
    fn dim(&self) -> usize;
    fn evaluate(&self, params: &Array1<f64>) -> Result<Derivatives>;
}

/// Cox log partial likelihood over a fixed design
#[derive(Debug, Clone)]
pub struct PartialLikelihood {
    times: Vec<f64>,
    events: Vec<bool>,
    covariates: Array2<f64>,
    order: Vec<usize>, // descending time
    ties: Ties,
}

impl PartialLikelihood {
    pub fn new(
        times: ArrayView1<f64>,
        events: ArrayView1<bool>,
        covariates: Array2<f64>,
        ties: Ties,
    ) -> Result<Self> {
        let n = times.len();
        if events.len() != n || covariates.nrows() != n {
            return Err(SurvError::invalid_dimensions(
                "times, events and covariates must have the same number of rows"
            ));
        }

        let times: Vec<f64> = times.to_vec();
        let mut order: Vec<usize> = (0..n).collect();
        order.sort_by(|&a, &b| times[b].total_cmp(&times[a]));

        Ok(Self {
            times,
            events: events.to_vec(),
            covariates,
            order,
            ties,
        })
    }

    pub fn from_data(data: &SurvivalData, ties: Ties) -> Result<Self> {
        Self::new(data.times(), data.events(), data.covariates().to_owned(), ties)
    }

    pub fn covariates(&self) -> &Array2<f64> {
        &self.covariates
    }
}

impl Objective for PartialLikelihood {
    fn dim(&self) -> usize {
        self.covariates.ncols()
    }

    /// one sweep from the latest time backwards, growing the risk set
    fn evaluate(&self, beta: &Array1<f64>) -> Result<Derivatives> {
        let p = self.dim();
        if beta.len() != p {
            return Err(SurvError::invalid_dimensions(
                format!("expected {} coefficients, got {}", p, beta.len())
            ));
        }
        let n = self.times.len();

        let eta = self.covariates.dot(beta);
        let shift = eta.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let shift = if shift.is_finite() { shift } else { 0.0 };
        let w = eta.mapv(|e| (e - shift).exp());

        let mut s0 = 0.0;
        let mut s1 = Array1::<f64>::zeros(p);
        let mut s2 = Array2::<f64>::zeros((p, p));

        let mut value = 0.0;
        let mut gradient = Array1::<f64>::zeros(p);
        let mut hessian = Array2::<f64>::zeros((p, p));

        let mut k = 0;
        while k < n {
            let t = self.times[self.order[k]];
            let mut end = k;
            while end < n && self.times[self.order[end]] == t {
                end += 1;
            }

            let mut deaths = 0usize;
            let mut e0 = 0.0;
            let mut e1 = Array1::<f64>::zeros(p);
            let mut e2 = Array2::<f64>::zeros((p, p));

            for &i in &self.order[k..end] {
                let x = self.covariates.row(i);
                let wi = w[i];
                s0 += wi;
                for a in 0..p {
                    s1[a] += wi * x[a];
                    for b in 0..p {
                        s2[[a, b]] += wi * x[a] * x[b];
                    }
                }

                if self.events[i] {
                    deaths += 1;
                    value += eta[i] - shift;
                    gradient += &x;
                    e0 += wi;
                    for a in 0..p {
                        e1[a] += wi * x[a];
                        for b in 0..p {
                            e2[[a, b]] += wi * x[a] * x[b];
                        }
                    }
                }
            }

            if deaths > 0 {
                let fractions: Vec<f64> = match self.ties {
                    Ties::Breslow => vec![0.0; deaths],
                    Ties::Efron => (0..deaths).map(|r| r as f64 / deaths as f64).collect(),
                };

                for f in fractions {
                    let d0 = s0 - f * e0;
                    if d0 <= 0.0 || !d0.is_finite() {
                        return Err(SurvError::numerical_error("Risk set sum is non-positive"));
                    }
                    let d1 = &s1 - &(f * &e1);
                    let mean = &d1 / d0;

                    value -= d0.ln();
                    gradient -= &mean;
                    for a in 0..p {
                        for b in 0..p {
                            let d2 = s2[[a, b]] - f * e2[[a, b]];
                            hessian[[a, b]] -= d2 / d0 - mean[a] * mean[b];
                        }
                    }
                }
            }

            k = end;
        }

        if !value.is_finite() {
            return Err(SurvError::numerical_error("partial likelihood is not finite"));
        }

        Ok(Derivatives { value, gradient, hessian })
    }
}

/// Configuration for newton-raphson maximization
#[derive(Debug, Clone)]
pub struct NewtonRaphson {
    pub max_iterations: usize,
    pub tolerance: f64,         // relative change in objective
    pub max_step_halvings: usize,
}

impl Default for NewtonRaphson {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            tolerance: 1e-9,
            max_step_halvings: 30,
        }
    }
}

/// where newton-raphson ended up
#[derive(Debug, Clone)]
pub struct NewtonResult {
    pub params: Array1<f64>,
    pub derivatives: Derivatives, // at params
    pub iterations: usize,
}

impl NewtonRaphson {
    pub fn new(max_iterations: usize, tolerance: f64) -> Self {
        Self {
            max_iterations,
            tolerance,
            ..Default::default()
        }
    }

    /// maximize the objective starting from `init`
    pub fn maximize<O: Objective + ?Sized>(&self, objective: &O, init: Array1<f64>) -> Result<NewtonResult> {
        if init.len() != objective.dim() {
            return Err(SurvError::invalid_dimensions(
                format!("start has {} params, objective has {}", init.len(), objective.dim())
            ));
        }
        if self.max_iterations == 0 {
            return Err(SurvError::invalid_parameter("max_iterations", 0));
        }

        let mut params = init;
        let mut current = objective.evaluate(&params)?;

        for iteration in 1..=self.max_iterations {
            let information = current.hessian.mapv(|h| -h);
            let step = match linalg::solve(&information, &current.gradient) {
                Ok(step) => step,
                Err(_) => {
                    // singular information - fall back to a small gradient step
                    warn!("singular information at iteration {}, taking gradient step", iteration);
                    0.01 * &current.gradient
                }
            };

            let mut scale = 1.0;
            let mut accepted = None;
            for _ in 0..=self.max_step_halvings {
                let candidate = &params + &(scale * &step);
                match objective.evaluate(&candidate) {
                    Ok(next) if next.value.is_finite() && next.value >= current.value - 1e-12 => {
                        accepted = Some((candidate, next));
                        break;
                    }
                    _ => scale *= 0.5,
                }
            }

            let Some((candidate, next)) = accepted else {
                // no ascent direction left - we're sitting on the maximum
                debug!("newton: no improving step at iteration {}, stopping", iteration);
                return Ok(NewtonResult { params, derivatives: current, iterations: iteration });
            };

            let change = (next.value - current.value).abs();
            debug!("newton iteration {}: objective {:.8} (step scale {})", iteration, next.value, scale);

            let converged = change <= self.tolerance * (1.0 + current.value.abs());
            params = candidate;
            current = next;

            if converged {
                return Ok(NewtonResult { params, derivatives: current, iterations: iteration });
            }
        }

        Err(SurvError::optimization_failed(
            format!("Newton-Raphson failed to converge in {} iterations", self.max_iterations)
        ))
    }
}
