//! Flat fact rows loaded from CSV.
//!
//! Every column named as a metric must parse as a number; every other column
//! is a dimension that rows can be grouped by.

use std::collections::BTreeMap;
use std::io;
use std::path::Path;

use csv::{ReaderBuilder, StringRecord};
use thiserror::Error;

use crate::types::Dimension;

/// Errors raised while loading a dataset.
#[derive(Error, Debug)]
pub enum DatasetError {
    /// Reading the file failed.
    #[error(transparent)]
    Io(#[from] io::Error),
    /// The CSV could not be parsed.
    #[error(transparent)]
    Csv(#[from] csv::Error),
    /// A requested metric column is not in the header.
    #[error("column '{0}' not found")]
    MissingColumn(String),
    /// A metric cell is not numeric.
    #[error("line {line}: value '{value}' in metric column '{column}' is not a number")]
    InvalidMetric {
        /// Metric column.
        column: String,
        /// 1-based line in the file, header included.
        line: u64,
        /// Offending cell.
        value: String,
    },
    /// No metric columns were requested.
    #[error("at least one metric column is required")]
    NoMetrics,
}

/// One input row: dimension values plus numeric metrics.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Fact {
    /// Dimension name to value.
    pub dimensions: BTreeMap<String, String>,
    /// Metric name to value.
    pub metrics: BTreeMap<String, f64>,
}

impl Fact {
    /// Creates an empty fact.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a dimension value.
    pub fn dimension(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.dimensions.insert(name.into(), value.into());
        self
    }

    /// Sets a metric value.
    pub fn metric(mut self, name: impl Into<String>, value: f64) -> Self {
        self.metrics.insert(name.into(), value);
        self
    }

    /// Value of `dimension`; missing dimensions read as empty.
    pub fn dimension_value(&self, dimension: &Dimension) -> &str {
        self.dimensions
            .get(dimension.as_str())
            .map(String::as_str)
            .unwrap_or("")
    }
}

/// Fact rows plus the names of their dimensions and metrics.
#[derive(Clone, Debug, Default)]
pub struct Dataset {
    dimensions: Vec<Dimension>,
    metrics: Vec<String>,
    facts: Vec<Fact>,
}

impl Dataset {
    /// Creates an empty dataset with the given columns.
    pub fn new(dimensions: Vec<Dimension>, metrics: Vec<String>) -> Self {
        Self {
            dimensions,
            metrics,
            facts: Vec::new(),
        }
    }

    /// Appends a fact.
    pub fn push(&mut self, fact: Fact) {
        self.facts.push(fact);
    }

    /// Builder form of [`Self::push`].
    pub fn with_fact(mut self, fact: Fact) -> Self {
        self.push(fact);
        self
    }

    /// Loads a CSV file whose header names every column.
    pub fn from_csv_path(path: impl AsRef<Path>, metrics: &[String]) -> Result<Self, DatasetError> {
        let reader = ReaderBuilder::new()
            .flexible(true)
            .trim(csv::Trim::All)
            .from_path(path)?;
        Self::from_csv(reader, metrics)
    }

    /// Loads CSV from any reader.
    pub fn from_reader<R: io::Read>(input: R, metrics: &[String]) -> Result<Self, DatasetError> {
        let reader = ReaderBuilder::new()
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(input);
        Self::from_csv(reader, metrics)
    }

    fn from_csv<R: io::Read>(mut reader: csv::Reader<R>, metrics: &[String]) -> Result<Self, DatasetError> {
        if metrics.is_empty() {
            return Err(DatasetError::NoMetrics);
        }
        let headers = reader.headers()?.clone();
        let mut metric_columns = Vec::with_capacity(metrics.len());
        for metric in metrics {
            metric_columns.push((find_column(&headers, metric)?, metric.clone()));
        }
        let dimension_columns: Vec<(usize, Dimension)> = headers
            .iter()
            .enumerate()
            .filter(|(idx, _)| metric_columns.iter().all(|(metric_idx, _)| metric_idx != idx))
            .map(|(idx, name)| (idx, Dimension::new(name)))
            .collect();

        let mut dataset = Dataset::new(
            dimension_columns.iter().map(|(_, dim)| dim.clone()).collect(),
            metrics.to_vec(),
        );
        for result in reader.records() {
            let record = result?;
            let line = record.position().map(|pos| pos.line()).unwrap_or_default();
            let mut fact = Fact::new();
            for (idx, dimension) in &dimension_columns {
                fact.dimensions.insert(
                    dimension.as_str().to_string(),
                    record.get(*idx).unwrap_or("").to_string(),
                );
            }
            for (idx, metric) in &metric_columns {
                fact.metrics.insert(metric.clone(), parse_metric(&record, *idx, metric, line)?);
            }
            dataset.push(fact);
        }
        Ok(dataset)
    }

    /// Dimension columns in header order.
    pub fn dimensions(&self) -> &[Dimension] {
        &self.dimensions
    }

    /// Metric columns in the order they were requested.
    pub fn metrics(&self) -> &[String] {
        &self.metrics
    }

    /// All facts in input order.
    pub fn facts(&self) -> &[Fact] {
        &self.facts
    }

    /// Number of facts.
    pub fn len(&self) -> usize {
        self.facts.len()
    }

    /// Returns `true` when there are no facts.
    pub fn is_empty(&self) -> bool {
        self.facts.is_empty()
    }
}

fn find_column(headers: &StringRecord, name: &str) -> Result<usize, DatasetError> {
    headers
        .iter()
        .position(|header| header.eq_ignore_ascii_case(name))
        .ok_or_else(|| DatasetError::MissingColumn(name.to_string()))
}

fn parse_metric(record: &StringRecord, idx: usize, column: &str, line: u64) -> Result<f64, DatasetError> {
    let raw = record.get(idx).unwrap_or("");
    if raw.is_empty() {
        return Ok(0.0);
    }
    raw.parse::<f64>().map_err(|_| DatasetError::InvalidMetric {
        column: column.to_string(),
        line,
        value: raw.to_string(),
    })
}
