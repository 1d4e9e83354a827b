//! virulence assay tables - one row per infected host

use std::fs::File;
use std::io::Read;
use std::path::Path;
use log::info;
use serde::{Deserialize, Serialize};
use crate::error::{SurvError, Result};

/// which csv columns hold what
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ColumnSpec {
    pub clone: String,
    pub factors: Vec<String>, // one or two treatment factors
    pub time: String,
    pub event: String,
}

impl Default for ColumnSpec {
    fn default() -> Self {
        Self {
            clone: "clone".to_string(),
            factors: vec!["treatment".to_string()],
            time: "time".to_string(),
            event: "status".to_string(),
        }
    }
}

impl ColumnSpec {
    pub fn validate(&self) -> Result<()> {
        if self.factors.is_empty() || self.factors.len() > 2 {
            return Err(SurvError::invalid_parameter(
                "columns.factors", format!("{:?} (need one or two)", self.factors)
            ));
        }
        Ok(())
    }
}

/// one host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssayRecord {
    pub clone: String,
    pub factors: Vec<String>, // levels, in ColumnSpec::factors order
    pub time: f64,
    pub event: bool,          // true = died, false = censored
}

impl AssayRecord {
    pub fn new(clone: impl Into<String>, factors: Vec<String>, time: f64, event: bool) -> Self {
        Self { clone: clone.into(), factors, time, event }
    }
}

/// a whole assay, read once
#[derive(Debug, Clone, PartialEq)]
pub struct AssayTable {
    factor_names: Vec<String>,
    records: Vec<AssayRecord>,
}

impl AssayTable {
    pub fn new(factor_names: Vec<String>, records: Vec<AssayRecord>) -> Result<Self> {
        if records.is_empty() {
            return Err(SurvError::invalid_survival_data("assay has no rows"));
        }
        for (row, record) in records.iter().enumerate() {
            if record.factors.len() != factor_names.len() {
                return Err(SurvError::invalid_assay_data(
                    row + 1,
                    format!("{} factor levels for {} factors", record.factors.len(), factor_names.len()),
                ));
            }
            if !(record.time.is_finite() && record.time > 0.0) {
                return Err(SurvError::invalid_assay_data(
                    row + 1,
                    format!("time must be positive and finite, got {}", record.time),
                ));
            }
        }
        Ok(Self { factor_names, records })
    }

    pub fn from_path(path: impl AsRef<Path>, columns: &ColumnSpec) -> Result<Self> {
        let path = path.as_ref();
        let table = Self::from_reader(File::open(path)?, columns)?;
        info!("read {} hosts from {}", table.len(), path.display());
        Ok(table)
    }

    pub fn from_reader<R: Read>(reader: R, columns: &ColumnSpec) -> Result<Self> {
        columns.validate()?;
        let mut csv = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(reader);

        let headers = csv.headers()?.clone();
        let find = |name: &str| -> Result<usize> {
            headers.iter().position(|h| h == name).ok_or_else(|| {
                SurvError::invalid_parameter("column", format!("{} (not in header)", name))
            })
        };
        let clone_col = find(&columns.clone)?;
        let time_col = find(&columns.time)?;
        let event_col = find(&columns.event)?;
        let factor_cols = columns
            .factors
            .iter()
            .map(|f| find(f))
            .collect::<Result<Vec<_>>>()?;

        let mut records = Vec::new();
        for (i, row) in csv.records().enumerate() {
            let row_no = i + 1;
            let row = row?;
            let cell = |col: usize| -> Result<&str> {
                match row.get(col) {
                    Some(v) if !v.is_empty() && v != "NA" => Ok(v),
                    _ => Err(SurvError::invalid_assay_data(row_no, format!("missing value in column {}", col + 1))),
                }
            };

            let time: f64 = cell(time_col)?.parse().map_err(|_| {
                SurvError::invalid_assay_data(row_no, format!("time {:?} is not a number", row.get(time_col)))
            })?;
            let event = parse_event(cell(event_col)?).ok_or_else(|| {
                SurvError::invalid_assay_data(row_no, format!("status {:?} is not 0/1", row.get(event_col)))
            })?;
            let factors = factor_cols
                .iter()
                .map(|&c| cell(c).map(str::to_string))
                .collect::<Result<Vec<_>>>()?;

            records.push(AssayRecord::new(cell(clone_col)?, factors, time, event));
        }

        Self::new(columns.factors.clone(), records)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[AssayRecord] {
        &self.records
    }

    pub fn factor_names(&self) -> &[String] {
        &self.factor_names
    }

    pub fn factor_position(&self, name: &str) -> Option<usize> {
        self.factor_names.iter().position(|f| f == name)
    }

    /// sorted distinct levels of a factor
    pub fn levels(&self, factor: usize) -> Vec<String> {
        let mut levels: Vec<String> = self.records.iter().map(|r| r.factors[factor].clone()).collect();
        levels.sort();
        levels.dedup();
        levels
    }

    /// sorted distinct clones
    pub fn clones(&self) -> Vec<String> {
        let mut clones: Vec<String> = self.records.iter().map(|r| r.clone.clone()).collect();
        clones.sort();
        clones.dedup();
        clones
    }

    pub fn n_deaths(&self) -> usize {
        self.records.iter().filter(|r| r.event).count()
    }
}

fn parse_event(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "dead" | "yes" => Some(true),
        "0" | "false" | "alive" | "no" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CSV: &str = "\
clone,treatment,host,time,status
A1, ancestor ,galleria,24,1
A1,ancestor,galleria,72,0
E3,evolved,galleria,12.5,dead
E3,evolved,galleria,30,alive
";

    #[test]
    fn test_reads_assay() {
        let table = AssayTable::from_reader(CSV.as_bytes(), &ColumnSpec::default()).unwrap();
        assert_eq!(table.len(), 4);
        assert_eq!(table.n_deaths(), 2);
        assert_eq!(table.records()[0].factors, vec!["ancestor".to_string()]);
        assert_eq!(table.records()[2].time, 12.5);
        assert_eq!(table.levels(0), vec!["ancestor", "evolved"]);
        assert_eq!(table.clones(), vec!["A1", "E3"]);
    }

    #[test]
    fn test_two_factors() {
        let columns = ColumnSpec {
            factors: vec!["treatment".into(), "host".into()],
            ..Default::default()
        };
        let table = AssayTable::from_reader(CSV.as_bytes(), &columns).unwrap();
        assert_eq!(table.factor_position("host"), Some(1));
        assert_eq!(table.levels(1), vec!["galleria"]);
    }

    #[test]
    fn test_missing_column() {
        let columns = ColumnSpec { time: "hours".into(), ..Default::default() };
        let err = AssayTable::from_reader(CSV.as_bytes(), &columns).unwrap_err();
        assert!(err.to_string().contains("hours"));
    }

    #[test]
    fn test_bad_rows_name_the_row() {
        let bad_status = "clone,treatment,time,status\nA,x,1,1\nA,x,2,maybe\n";
        match AssayTable::from_reader(bad_status.as_bytes(), &ColumnSpec::default()) {
            Err(SurvError::InvalidAssayData { row, .. }) => assert_eq!(row, 2),
            other => panic!("expected row error, got {:?}", other),
        }

        let bad_time = "clone,treatment,time,status\nA,x,-3,1\n";
        assert!(AssayTable::from_reader(bad_time.as_bytes(), &ColumnSpec::default()).is_err());

        let missing = "clone,treatment,time,status\nA,,3,1\n";
        assert!(AssayTable::from_reader(missing.as_bytes(), &ColumnSpec::default()).is_err());
    }

    #[test]
    fn test_empty_and_too_many_factors() {
        let header_only = "clone,treatment,time,status\n";
        assert!(AssayTable::from_reader(header_only.as_bytes(), &ColumnSpec::default()).is_err());

        let columns = ColumnSpec {
            factors: vec!["a".into(), "b".into(), "c".into()],
            ..Default::default()
        };
        assert!(columns.validate().is_err());
    }
}
