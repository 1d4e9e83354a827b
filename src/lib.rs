//! # virulence survival
//!
//! survival analysis for virulence assays - hosts infected with bacterial
//! clones, followed until death or the end of the assay
//!
//! ## what you get
//!
//! - kaplan-meier curves + log-rank tests
//! - cox regression w/ model-based or clone-robust standard errors
//! - mixed-effects (shared frailty) cox for clone structure
//! - piecewise exponential / poisson fits
//! - bayesian weibull model w/ a clone intercept
//! - simulation studies of bias and coverage, replicates run in parallel
//!
//! ## quick start
//!
//! ```rust
//! use virulence_survival::{AssayTable, ColumnSpec, CoxModel, DesignSpec, SurvivalFit};
//! use virulence_survival::design::model_frame;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let csv = "\
//! clone,treatment,time,status
//! A1,ancestor,40,1
//! A1,ancestor,72,0
//! A2,ancestor,55,1
//! E1,evolved,12,1
//! E1,evolved,20,1
//! E2,evolved,31,1
//! E2,evolved,72,0
//! ";
//! let table = AssayTable::from_reader(csv.as_bytes(), &ColumnSpec::default())?;
//! let data = model_frame(&table, &DesignSpec::default())?;
//!
//! // clones are the unit of replication - cluster on them
//! let fit = CoxModel::new().with_robust_variance(true).fit(&data)?;
//! for row in fit.tidy() {
//!     println!("{} HR = {:.2}", row.term, row.hazard_ratio());
//! }
//! # Ok(())
//! # }
//! ```

pub mod analysis;
pub mod assay;
pub mod bayes;
pub mod config;
pub mod data;
pub mod design;
pub mod error;
pub mod frailty;
pub mod km;
pub mod linalg;
pub mod metrics;
pub mod model;
pub mod optimization;
pub mod piecewise;
pub mod report;
pub mod simulation;
pub mod stats;

pub use analysis::{ModelKind, ModelSettings, SurvivalFit};
pub use assay::{AssayTable, ColumnSpec};
pub use bayes::{BayesConfig, BayesWeibullModel};
pub use config::AnalysisConfig;
pub use data::{Clusters, SurvivalData};
pub use design::DesignSpec;
pub use error::{SurvError, Result};
pub use frailty::FrailtyCoxModel;
pub use model::CoxModel;
pub use optimization::Ties;
pub use piecewise::PiecewiseExponentialModel;
pub use report::TermEstimate;
pub use simulation::SimulationConfig;
