use thiserror::Error;

pub type Result<T> = std::result::Result<T, SurvError>;

#[derive(Error, Debug)]
pub enum SurvError {
    #[error("dimensions don't match: {message}")]
    InvalidDimensions { message: String },

    #[error("optimization blew up: {message}")]
    OptimizationFailed { message: String },

    #[error("bad parameter: {parameter} = {value}")]
    InvalidParameter { parameter: String, value: String },

    #[error("numerical issues: {message}")]
    NumericalError { message: String },

    #[error("survival data is broken: {message}")]
    InvalidSurvivalData { message: String },

    #[error("assay data row {row}: {message}")]
    InvalidAssayData { row: usize, message: String },

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("csv: {0}")]
    Csv(#[from] csv::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

impl SurvError {
    pub fn invalid_dimensions(message: impl Into<String>) -> Self {
        Self::InvalidDimensions { message: message.into() }
    }

    pub fn optimization_failed(message: impl Into<String>) -> Self {
        Self::OptimizationFailed { message: message.into() }
    }

    pub fn invalid_parameter(parameter: impl Into<String>, value: impl ToString) -> Self {
        Self::InvalidParameter {
            parameter: parameter.into(),
            value: value.to_string(),
        }
    }

    pub fn numerical_error(message: impl Into<String>) -> Self {
        Self::NumericalError { message: message.into() }
    }

    pub fn invalid_survival_data(message: impl Into<String>) -> Self {
        Self::InvalidSurvivalData { message: message.into() }
    }

    /// `row` is 1-based, counting data rows after the header
    pub fn invalid_assay_data(row: usize, message: impl Into<String>) -> Self {
        Self::InvalidAssayData { row, message: message.into() }
    }
}
