use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use crate::error::{SurvError, Result};

/// which clone each host belongs to
#[derive(Debug, Clone, PartialEq)]
pub struct Clusters {
    index: Vec<usize>,   // per-sample position into labels
    labels: Vec<String>, // clone names
}

impl Clusters {
    pub fn new(index: Vec<usize>, labels: Vec<String>) -> Result<Self> {
        if let Some(&bad) = index.iter().find(|&&i| i >= labels.len()) {
            return Err(SurvError::invalid_dimensions(
                format!("cluster index {} out of range for {} labels", bad, labels.len())
            ));
        }
        Ok(Self { index, labels })
    }

    /// build from raw per-sample labels, labels sorted
    pub fn from_labels<S: AsRef<str>>(raw: &[S]) -> Self {
        let mut labels: Vec<String> = raw.iter().map(|s| s.as_ref().to_string()).collect();
        labels.sort();
        labels.dedup();
        let index = raw
            .iter()
            .map(|s| labels.binary_search_by(|l| l.as_str().cmp(s.as_ref())).unwrap_or(0))
            .collect();
        Self { index, labels }
    }

    pub fn index(&self) -> &[usize] {
        &self.index
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn n_clusters(&self) -> usize {
        self.labels.len()
    }

    /// samples per cluster
    pub fn sizes(&self) -> Vec<usize> {
        let mut sizes = vec![0; self.labels.len()];
        for &g in &self.index {
            sizes[g] += 1;
        }
        sizes
    }

    fn subset(&self, indices: &[usize]) -> Self {
        Self {
            index: indices.iter().map(|&i| self.index[i]).collect(),
            labels: self.labels.clone(),
        }
    }
}

/// survival data - times, events, host covariates and optional clone grouping
#[derive(Debug, Clone)]
pub struct SurvivalData {
    times: Array1<f64>,          // time to death/censoring
    events: Array1<bool>,        // true = death, false = censored
    covariates: Array2<f64>,     // design matrix (n_samples x n_features)
    term_names: Vec<String>,     // one per covariate column
    clusters: Option<Clusters>,  // clone membership
}

impl SurvivalData {
    /// make new survival data from raw vecs/arrays
    pub fn new(
        times: Vec<f64>,
        events: Vec<bool>,
        covariates: Array2<f64>,
    ) -> Result<Self> {
        let n_samples = times.len();

        if n_samples == 0 {
            return Err(SurvError::invalid_survival_data("no observations"));
        }

        if events.len() != n_samples {
            return Err(SurvError::invalid_dimensions(
                format!("times len ({}) != events len ({})", n_samples, events.len())
            ));
        }

        if covariates.nrows() != n_samples {
            return Err(SurvError::invalid_dimensions(
                format!("covariates rows ({}) != n_samples ({})", covariates.nrows(), n_samples)
            ));
        }

        if times.iter().any(|&t| t <= 0.0 || !t.is_finite()) {
            return Err(SurvError::invalid_survival_data(
                "survival times must be positive & finite"
            ));
        }

        if covariates.iter().any(|x| !x.is_finite()) {
            return Err(SurvError::invalid_survival_data("covariates must be finite"));
        }

        let term_names = (0..covariates.ncols()).map(|j| format!("x{}", j)).collect();

        Ok(Self {
            times: Array1::from(times),
            events: Array1::from(events),
            covariates,
            term_names,
            clusters: None,
        })
    }

    /// label the covariate columns
    pub fn with_term_names(mut self, names: Vec<String>) -> Result<Self> {
        if names.len() != self.n_features() {
            return Err(SurvError::invalid_dimensions(
                format!("{} term names for {} covariates", names.len(), self.n_features())
            ));
        }
        self.term_names = names;
        Ok(self)
    }

    /// attach clone membership
    pub fn with_clusters(mut self, clusters: Clusters) -> Result<Self> {
        if clusters.index().len() != self.n_samples() {
            return Err(SurvError::invalid_dimensions(
                format!("cluster index len ({}) != n_samples ({})",
                        clusters.index().len(), self.n_samples())
            ));
        }
        self.clusters = Some(clusters);
        Ok(self)
    }

    pub fn n_samples(&self) -> usize {
        self.times.len()
    }

    pub fn n_features(&self) -> usize {
        self.covariates.ncols()
    }

    pub fn n_events(&self) -> usize {
        self.events.iter().filter(|&&e| e).count()
    }

    pub fn times(&self) -> ArrayView1<'_, f64> {
        self.times.view()
    }

    /// event indicators (true = death, false = censored)
    pub fn events(&self) -> ArrayView1<'_, bool> {
        self.events.view()
    }

    pub fn covariates(&self) -> ArrayView2<'_, f64> {
        self.covariates.view()
    }

    pub fn term_names(&self) -> &[String] {
        &self.term_names
    }

    pub fn clusters(&self) -> Option<&Clusters> {
        self.clusters.as_ref()
    }

    /// unique event times in order
    pub fn event_times(&self) -> Vec<f64> {
        let mut times: Vec<f64> = self.times
            .iter()
            .zip(self.events.iter())
            .filter_map(|(time, event)| if *event { Some(*time) } else { None })
            .collect();

        times.sort_by(f64::total_cmp);
        times.dedup();
        times
    }

    /// grab a subset of hosts by indices
    pub fn subset(&self, indices: &[usize]) -> Result<Self> {
        if indices.iter().any(|&i| i >= self.n_samples()) {
            return Err(SurvError::invalid_dimensions("subset index out of bounds"));
        }

        let times: Vec<f64> = indices.iter().map(|&i| self.times[i]).collect();
        let events: Vec<bool> = indices.iter().map(|&i| self.events[i]).collect();
        let covariates = self.covariates.select(Axis(0), indices);

        let mut data = Self::new(times, events, covariates)?
            .with_term_names(self.term_names.clone())?;
        if let Some(clusters) = &self.clusters {
            data = data.with_clusters(clusters.subset(indices))?;
        }
        Ok(data)
    }
}
