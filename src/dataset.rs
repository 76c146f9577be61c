//! Tabular dataset
//!
//! Loads a delimited file with a header row into named columns and derives
//! the per-run projection: only the referenced columns, with the treatment
//! coerced to a boolean flag.

use std::collections::HashSet;
use std::fmt::Write as _;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use csv::{ReaderBuilder, Trim};
use log::debug;
use serde::Serialize;

use crate::params::AnalysisParams;
use crate::CausalError;

const MISSING_MARKERS: [&str; 5] = ["", "na", "nan", "null", "none"];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ColumnData {
    Numeric(Vec<f64>),
    Text(Vec<String>),
}

impl ColumnData {
    pub fn len(&self) -> usize {
        match self {
            ColumnData::Numeric(v) => v.len(),
            ColumnData::Text(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn cell(&self, row: usize) -> String {
        match self {
            ColumnData::Numeric(v) => v[row].to_string(),
            ColumnData::Text(v) => v[row].clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Column {
    pub name: String,
    pub data: ColumnData,
}

impl Column {
    pub fn numeric(name: impl Into<String>, values: Vec<f64>) -> Self {
        Self {
            name: name.into(),
            data: ColumnData::Numeric(values),
        }
    }

    pub fn text(name: impl Into<String>, values: Vec<String>) -> Self {
        Self {
            name: name.into(),
            data: ColumnData::Text(values),
        }
    }
}

/// Named columns of equal length
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    columns: Vec<Column>,
    rows: usize,
}

impl Dataset {
    pub fn from_columns(columns: Vec<Column>) -> Result<Self, CausalError> {
        let rows = columns.first().map(|c| c.data.len()).unwrap_or(0);
        let mut names = HashSet::new();
        for column in &columns {
            if column.name.is_empty() {
                return Err(CausalError::parse("dataset", "empty column name in header"));
            }
            if !names.insert(column.name.as_str()) {
                return Err(CausalError::parse(
                    "dataset",
                    format!("duplicate column name '{}'", column.name),
                ));
            }
            if column.data.len() != rows {
                return Err(CausalError::parse(
                    "dataset",
                    format!(
                        "column '{}' has {} rows, expected {rows}",
                        column.name,
                        column.data.len()
                    ),
                ));
            }
        }
        Ok(Self { columns, rows })
    }

    pub fn from_csv_path(path: &Path) -> Result<Self, CausalError> {
        let file = File::open(path)?;
        Self::from_reader(file)
    }

    /// Parse comma-separated values with a header row.
    ///
    /// A column is numeric when every non-missing cell parses as a number;
    /// missing cells (`""`, `NA`, `NaN`, `null`, `None`) become `NaN` there.
    pub fn from_reader<R: Read>(reader: R) -> Result<Self, CausalError> {
        let mut reader = ReaderBuilder::new()
            .has_headers(true)
            .trim(Trim::All)
            .from_reader(reader);

        let headers: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
        if headers.is_empty() || headers.iter().all(|h| h.is_empty()) {
            return Err(CausalError::parse("dataset", "missing header row"));
        }

        let mut raw: Vec<Vec<String>> = vec![Vec::new(); headers.len()];
        for record in reader.records() {
            let record = record?;
            for (idx, cell) in record.iter().enumerate() {
                raw[idx].push(cell.to_string());
            }
        }

        let columns = headers
            .into_iter()
            .zip(raw)
            .map(|(name, cells)| Column {
                name,
                data: infer_column(cells),
            })
            .collect();

        let dataset = Self::from_columns(columns)?;
        debug!(
            "loaded dataset with {} rows and {} columns",
            dataset.n_rows(),
            dataset.n_columns()
        );
        Ok(dataset)
    }

    pub fn n_rows(&self) -> usize {
        self.rows
    }

    pub fn n_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c.name == name)
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Keep only the referenced columns and coerce the treatment to bool.
    ///
    /// Fails with [`CausalError::MissingColumns`] before touching any data
    /// when a referenced column is absent.
    pub fn project(&self, params: &AnalysisParams) -> Result<ProjectedData, CausalError> {
        params.validate_against(self)?;

        let treatment_column = self
            .column(&params.treatment)
            .ok_or_else(|| CausalError::MissingColumns(vec![params.treatment.clone()]))?;
        let (treatment, levels) = coerce_binary(treatment_column)?;

        let outcome = self.numeric_values(&params.outcome)?;

        let mut covariates = Vec::new();
        for name in params.columns() {
            if name == params.treatment || name == params.outcome {
                continue;
            }
            let values = self.numeric_values(&name)?;
            covariates.push((name, values));
        }

        Ok(ProjectedData {
            treatment_name: params.treatment.clone(),
            outcome_name: params.outcome.clone(),
            treatment,
            treatment_levels: levels,
            outcome,
            covariates,
        })
    }

    fn numeric_values(&self, name: &str) -> Result<Vec<f64>, CausalError> {
        let column = self
            .column(name)
            .ok_or_else(|| CausalError::MissingColumns(vec![name.to_string()]))?;
        match &column.data {
            ColumnData::Numeric(values) => {
                let missing = values.iter().filter(|v| v.is_nan()).count();
                if missing > 0 {
                    return Err(CausalError::Config(format!(
                        "column '{name}' has {missing} missing value(s)"
                    )));
                }
                Ok(values.clone())
            }
            ColumnData::Text(_) => Err(CausalError::Config(format!(
                "column '{name}' is not numeric"
            ))),
        }
    }

    /// Markdown table of the first `rows` rows, followed by the shape.
    pub fn preview(&self, rows: usize) -> String {
        let mut out = String::new();
        let header: Vec<&str> = self.column_names();
        let _ = writeln!(out, "| {} |", header.join(" | "));
        let _ = writeln!(out, "|{}", " --- |".repeat(header.len()));
        for row in 0..rows.min(self.rows) {
            let cells: Vec<String> = self.columns.iter().map(|c| c.data.cell(row)).collect();
            let _ = writeln!(out, "| {} |", cells.join(" | "));
        }
        let _ = write!(
            out,
            "\n_{} rows × {} columns_\n",
            self.rows,
            self.columns.len()
        );
        out
    }
}

fn infer_column(cells: Vec<String>) -> ColumnData {
    let mut values = Vec::with_capacity(cells.len());
    for cell in &cells {
        if is_missing(cell) {
            values.push(f64::NAN);
            continue;
        }
        match cell.parse::<f64>() {
            Ok(v) => values.push(v),
            Err(_) => return ColumnData::Text(cells),
        }
    }
    if !cells.is_empty() && values.iter().all(|v| v.is_nan()) {
        return ColumnData::Text(cells);
    }
    ColumnData::Numeric(values)
}

fn is_missing(cell: &str) -> bool {
    MISSING_MARKERS
        .iter()
        .any(|marker| cell.eq_ignore_ascii_case(marker))
}

/// Raw values that were mapped to `false` and `true`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BinaryLevels {
    pub false_value: Option<String>,
    pub true_value: Option<String>,
}

/// Label of the `true` level when several nonzero values collapse onto it
pub const NONZERO_LEVEL: &str = "nonzero";

/// Map a treatment column onto `{false, true}`.
///
/// Numeric columns map `0` to `false`; without a `0` the smaller value is
/// `false`. A numeric column with more than two values is accepted only when
/// it contains `0`, and then every nonzero value is `true`. Text columns understand `true/false`, `yes/no`, `t/f`, `y/n`
/// (any case), otherwise the lexicographically smaller value is `false`.
pub fn coerce_binary(column: &Column) -> Result<(Vec<bool>, BinaryLevels), CausalError> {
    match &column.data {
        ColumnData::Numeric(values) => {
            if values.iter().any(|v| v.is_nan()) {
                return Err(CausalError::Config(format!(
                    "treatment column '{}' has missing values",
                    column.name
                )));
            }
            let mut distinct: Vec<f64> = values.clone();
            distinct.sort_by(|a, b| a.total_cmp(b));
            distinct.dedup();

            if distinct.len() > 2 && distinct.contains(&0.0) {
                debug!(
                    "treatment '{}' has {} distinct values, mapping nonzero to true",
                    column.name,
                    distinct.len()
                );
                return Ok((
                    values.iter().map(|&v| v != 0.0).collect(),
                    BinaryLevels {
                        false_value: Some("0".to_string()),
                        true_value: Some(NONZERO_LEVEL.to_string()),
                    },
                ));
            }
            check_two_valued(&column.name, distinct.len())?;

            let false_value = if distinct.contains(&0.0) {
                Some(0.0)
            } else if distinct.len() == 2 {
                Some(distinct[0])
            } else {
                None
            };
            let flags: Vec<bool> = values.iter().map(|&v| Some(v) != false_value).collect();
            let true_value = distinct.iter().copied().find(|&v| Some(v) != false_value);
            Ok((
                flags,
                BinaryLevels {
                    false_value: false_value.map(|v| v.to_string()),
                    true_value: true_value.map(|v| v.to_string()),
                },
            ))
        }
        ColumnData::Text(values) => {
            if values.iter().any(|v| is_missing(v)) {
                return Err(CausalError::Config(format!(
                    "treatment column '{}' has missing values",
                    column.name
                )));
            }
            let mut distinct: Vec<&str> = values.iter().map(String::as_str).collect();
            distinct.sort_unstable();
            distinct.dedup();
            check_two_valued(&column.name, distinct.len())?;

            let words: Vec<Option<bool>> = distinct.iter().map(|v| bool_word(v)).collect();
            let natural = match words.as_slice() {
                [Some(a), Some(b)] => a != b,
                [Some(_)] => true,
                _ => false,
            };
            let false_value: Option<&str> = if natural {
                distinct
                    .iter()
                    .zip(&words)
                    .find(|(_, w)| **w == Some(false))
                    .map(|(v, _)| *v)
            } else if distinct.len() == 2 {
                Some(distinct[0])
            } else {
                None
            };
            let flags: Vec<bool> = values
                .iter()
                .map(|v| Some(v.as_str()) != false_value)
                .collect();
            let true_value = distinct.iter().copied().find(|&v| Some(v) != false_value);
            Ok((
                flags,
                BinaryLevels {
                    false_value: false_value.map(str::to_string),
                    true_value: true_value.map(str::to_string),
                },
            ))
        }
    }
}

fn check_two_valued(name: &str, distinct: usize) -> Result<(), CausalError> {
    if distinct > 2 {
        return Err(CausalError::Config(format!(
            "treatment column '{name}' must be binary, found {distinct} distinct values"
        )));
    }
    Ok(())
}

fn bool_word(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "t" | "y" => Some(true),
        "false" | "no" | "f" | "n" => Some(false),
        _ => None,
    }
}

/// The referenced columns of one run; treatment is a boolean flag and every
/// other column is numeric.
#[derive(Debug, Clone)]
pub struct ProjectedData {
    treatment_name: String,
    outcome_name: String,
    treatment: Vec<bool>,
    treatment_levels: BinaryLevels,
    outcome: Vec<f64>,
    covariates: Vec<(String, Vec<f64>)>,
}

impl ProjectedData {
    pub fn n_rows(&self) -> usize {
        self.outcome.len()
    }

    pub fn treatment_name(&self) -> &str {
        &self.treatment_name
    }

    pub fn outcome_name(&self) -> &str {
        &self.outcome_name
    }

    pub fn treatment(&self) -> &[bool] {
        &self.treatment
    }

    pub fn treatment_levels(&self) -> &BinaryLevels {
        &self.treatment_levels
    }

    pub fn outcome(&self) -> &[f64] {
        &self.outcome
    }

    pub fn covariate(&self, name: &str) -> Option<&[f64]> {
        self.covariates
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_slice())
    }

    /// Treatment, outcome, then the remaining columns in role order
    pub fn column_names(&self) -> Vec<&str> {
        let mut names = vec![self.treatment_name.as_str(), self.outcome_name.as_str()];
        names.extend(self.covariates.iter().map(|(n, _)| n.as_str()));
        names
    }

    pub fn has_column(&self, name: &str) -> bool {
        name == self.treatment_name || name == self.outcome_name || self.covariate(name).is_some()
    }

    pub fn n_treated(&self) -> usize {
        self.treatment.iter().filter(|&&t| t).count()
    }

    pub fn n_control(&self) -> usize {
        self.n_rows() - self.n_treated()
    }

    /// Copy with the treatment assignment replaced
    pub fn with_treatment(&self, treatment: Vec<bool>) -> Result<ProjectedData, CausalError> {
        if treatment.len() != self.n_rows() {
            return Err(CausalError::Config(format!(
                "treatment has {} rows, expected {}",
                treatment.len(),
                self.n_rows()
            )));
        }
        Ok(ProjectedData {
            treatment,
            ..self.clone()
        })
    }

    /// Copy with an extra numeric column appended
    pub fn with_covariate(
        &self,
        name: impl Into<String>,
        values: Vec<f64>,
    ) -> Result<ProjectedData, CausalError> {
        let name = name.into();
        if values.len() != self.n_rows() {
            return Err(CausalError::Config(format!(
                "column '{name}' has {} rows, expected {}",
                values.len(),
                self.n_rows()
            )));
        }
        if self.has_column(&name) {
            return Err(CausalError::Config(format!("column '{name}' already exists")));
        }
        let mut copy = self.clone();
        copy.covariates.push((name, values));
        Ok(copy)
    }

    /// Copy restricted to the given row indices
    pub fn subset(&self, rows: &[usize]) -> ProjectedData {
        ProjectedData {
            treatment_name: self.treatment_name.clone(),
            outcome_name: self.outcome_name.clone(),
            treatment: rows.iter().map(|&r| self.treatment[r]).collect(),
            treatment_levels: self.treatment_levels.clone(),
            outcome: rows.iter().map(|&r| self.outcome[r]).collect(),
            covariates: self
                .covariates
                .iter()
                .map(|(n, v)| (n.clone(), rows.iter().map(|&r| v[r]).collect()))
                .collect(),
        }
    }
}
