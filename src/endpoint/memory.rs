//! In-process [`Endpoint`] that aggregates a [`Dataset`].
//!
//! Rows at level `L` group facts by the first `L` dimensions of the request
//! path and sum every metric. A row id joins the grouped values with `/`, so
//! the id of a parent is a prefix of its children's ids. Separators and
//! backslashes inside a value are escaped with a backslash, so distinct
//! groups never share an id.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

use async_trait::async_trait;
use parking_lot::Mutex;
use time::macros::format_description;
use time::Date;
use tracing::debug;

use super::{
    BreakdownRequest, CellEdit, Column, Dataset, Endpoint, EndpointError, Fact, MetaData, Page,
    PagePagination, Row,
};
use crate::tree::{StatValue, Stats};
use crate::types::{BreakdownId, DateRange, Dimension, Direction, Filter, Order};

/// Separator between grouped values in a row id.
pub const ID_SEPARATOR: char = '/';

const ID_ESCAPE: char = '\\';

type OverrideKey = (Vec<Dimension>, String, String);

/// Serves breakdown pages from facts held in memory.
pub struct MemoryEndpoint {
    dataset: Dataset,
    date_dimension: Option<Dimension>,
    editable: BTreeSet<String>,
    report_counts: bool,
    overrides: Mutex<BTreeMap<OverrideKey, f64>>,
    requests: AtomicUsize,
}

struct Group {
    id: String,
    parent: String,
    label: String,
    sums: BTreeMap<String, f64>,
}

impl MemoryEndpoint {
    /// Creates an endpoint over `dataset` that reports exact row counts.
    pub fn new(dataset: Dataset) -> Self {
        Self {
            dataset,
            date_dimension: None,
            editable: BTreeSet::new(),
            report_counts: true,
            overrides: Mutex::new(BTreeMap::new()),
            requests: AtomicUsize::new(0),
        }
    }

    /// Dimension holding `YYYY-MM-DD` dates that date ranges apply to.
    pub fn date_dimension(mut self, dimension: impl Into<Dimension>) -> Self {
        self.date_dimension = Some(dimension.into());
        self
    }

    /// Allows edits of a metric column.
    pub fn editable(mut self, metric: impl Into<String>) -> Self {
        self.editable.insert(metric.into());
        self
    }

    /// When set, pages carry no row count and the caller has to infer it.
    pub fn unknown_counts(mut self, unknown: bool) -> Self {
        self.report_counts = !unknown;
        self
    }

    /// The underlying dataset.
    pub fn dataset(&self) -> &Dataset {
        &self.dataset
    }

    /// Number of fetch requests served so far.
    pub fn request_count(&self) -> usize {
        self.requests.load(AtomicOrdering::Relaxed)
    }

    fn describe(&self) -> MetaData {
        let mut columns: Vec<Column> = self
            .dataset
            .dimensions()
            .iter()
            .map(|dim| Column {
                key: dim.as_str().to_string(),
                name: dim.as_str().to_string(),
                editable: false,
            })
            .collect();
        columns.extend(self.dataset.metrics().iter().map(|metric| Column {
            key: metric.clone(),
            name: metric.clone(),
            editable: self.editable.contains(metric),
        }));
        MetaData {
            columns,
            breakdown_groups: self.dataset.dimensions().to_vec(),
            base_level: 1,
        }
    }

    fn serve(&self, request: &BreakdownRequest) -> Result<Vec<Page>, EndpointError> {
        let level = request.level;
        let dims = request
            .breakdown_path
            .dimensions()
            .get(..level)
            .filter(|_| level > 0)
            .ok_or_else(|| {
                EndpointError::request(format!(
                    "level {level} is outside breakdown path '{}'",
                    request.breakdown_path
                ))
            })?;
        for dim in dims {
            if !self.dataset.dimensions().contains(dim) {
                return Err(EndpointError::request(format!("unknown dimension '{dim}'")));
            }
        }
        let facts = self.matching(request.date_range.as_ref(), &request.filters)?;

        let parents: Vec<Option<&BreakdownId>> = if level == 1 {
            vec![None]
        } else {
            request.breakdown_page.iter().map(Some).collect()
        };
        let wanted: BTreeSet<&str> = parents.iter().flatten().map(|id| id.as_str()).collect();
        let mut by_parent: BTreeMap<String, Vec<Group>> = BTreeMap::new();
        let grouped = self.group(&facts, dims, |fact| {
            level == 1 || wanted.contains(row_id(fact, &dims[..level - 1]).as_str())
        });
        for group in grouped {
            by_parent.entry(group.parent.clone()).or_default().push(group);
        }

        let metrics = self.dataset.metrics();
        let dimension = &dims[level - 1];
        let totals = (level == 1).then(|| {
            let mut sums = BTreeMap::new();
            for fact in &facts {
                for (metric, value) in &fact.metrics {
                    *sums.entry(metric.clone()).or_insert(0.0) += value;
                }
            }
            self.stats(&sums, None)
        });

        let mut pages = Vec::with_capacity(parents.len());
        for parent in parents {
            let key = parent.map(|id| id.as_str().to_string()).unwrap_or_default();
            let mut groups = by_parent.remove(&key).unwrap_or_default();
            sort_groups(&mut groups, request.order.as_ref(), metrics);
            let count = groups.len();
            let rows = groups
                .into_iter()
                .skip(request.offset)
                .take(request.limit)
                .map(|group| Row {
                    breakdown_id: BreakdownId::new(group.id.clone()),
                    stats: self.stats(&group.sums, Some((dimension, &group.label))),
                })
                .collect();
            pages.push(Page {
                breakdown_id: parent.cloned(),
                level,
                rows,
                pagination: PagePagination {
                    offset: request.offset,
                    limit: request.limit,
                    count: self.report_counts.then_some(count as i64),
                },
                totals: totals.clone(),
            });
        }
        Ok(pages)
    }

    fn apply_edit(&self, edit: &CellEdit) -> Result<Page, EndpointError> {
        let invalid = |message: &str| EndpointError::Validation {
            field: edit.field.clone(),
            message: message.to_string(),
        };
        if !self.dataset.metrics().contains(&edit.field) {
            return Err(invalid("unknown column"));
        }
        if !self.editable.contains(&edit.field) {
            return Err(invalid("column is read-only"));
        }
        let value = edit
            .value
            .as_f64()
            .filter(|value| value.is_finite())
            .ok_or_else(|| invalid("expected a number"))?;

        let dims = edit
            .context
            .path
            .dimensions()
            .get(..edit.level)
            .filter(|_| edit.level > 0)
            .ok_or_else(|| EndpointError::request(format!("level {} is outside the path", edit.level)))?;
        let facts = self.matching(edit.context.date_range.as_ref(), &edit.context.filters)?;
        let target = edit.breakdown_id.as_str();
        let mut group = self
            .group(&facts, dims, |fact| row_id(fact, dims) == target)
            .into_iter()
            .next()
            .ok_or_else(|| EndpointError::request(format!("no row '{target}'")))?;
        let key = (dims.to_vec(), target.to_string(), edit.field.clone());
        self.overrides.lock().insert(key, value);
        group.sums.insert(edit.field.clone(), value);
        debug!(row = target, field = %edit.field, value, "stored cell override");

        let dimension = &dims[edit.level - 1];
        Ok(Page {
            breakdown_id: None,
            level: edit.level,
            rows: vec![Row {
                breakdown_id: edit.breakdown_id.clone(),
                stats: self.stats(&group.sums, Some((dimension, &group.label))),
            }],
            pagination: PagePagination {
                offset: 0,
                limit: 1,
                count: Some(1),
            },
            totals: None,
        })
    }

    fn matching(&self, range: Option<&DateRange>, filters: &[Filter]) -> Result<Vec<&Fact>, EndpointError> {
        let date_dimension = match (range, self.date_dimension.as_ref()) {
            (Some(_), None) => {
                return Err(EndpointError::request("date range given but no date dimension is configured"))
            }
            (_, dim) => dim,
        };
        let format = format_description!("[year]-[month]-[day]");
        Ok(self
            .dataset
            .facts()
            .iter()
            .filter(|fact| {
                filters.iter().all(|filter| {
                    let value = fact.dimension_value(&filter.dimension);
                    filter.values.iter().any(|allowed| allowed == value)
                })
            })
            .filter(|fact| match (range, date_dimension) {
                (Some(range), Some(dim)) => Date::parse(fact.dimension_value(dim), format)
                    .map(|date| range.contains(date))
                    .unwrap_or(false),
                _ => true,
            })
            .collect())
    }

    /// Groups `facts` by `dims`, keeping first-seen order, with overrides applied.
    fn group<F>(&self, facts: &[&Fact], dims: &[Dimension], keep: F) -> Vec<Group>
    where
        F: Fn(&Fact) -> bool,
    {
        let mut index: BTreeMap<String, usize> = BTreeMap::new();
        let mut groups: Vec<Group> = Vec::new();
        let parent_dims = &dims[..dims.len().saturating_sub(1)];
        for fact in facts.iter().copied().filter(|fact| keep(*fact)) {
            let id = row_id(fact, dims);
            let slot = *index.entry(id.clone()).or_insert_with(|| {
                groups.push(Group {
                    label: dims
                        .last()
                        .map(|dim| fact.dimension_value(dim).to_string())
                        .unwrap_or_default(),
                    id,
                    parent: row_id(fact, parent_dims),
                    sums: BTreeMap::new(),
                });
                groups.len() - 1
            });
            for (metric, value) in &fact.metrics {
                *groups[slot].sums.entry(metric.clone()).or_insert(0.0) += value;
            }
        }

        let overrides = self.overrides.lock();
        if !overrides.is_empty() {
            for group in &mut groups {
                for (metric, sum) in group.sums.iter_mut() {
                    let key = (dims.to_vec(), group.id.clone(), metric.clone());
                    if let Some(value) = overrides.get(&key) {
                        *sum = *value;
                    }
                }
            }
        }
        groups
    }

    fn stats(&self, sums: &BTreeMap<String, f64>, label: Option<(&Dimension, &String)>) -> Stats {
        let mut stats = Stats::new();
        if let Some((dimension, value)) = label {
            stats.insert(dimension.as_str().to_string(), StatValue::new(value.clone()));
        }
        for metric in self.dataset.metrics() {
            let sum = sums.get(metric).copied().unwrap_or(0.0);
            let value = if self.editable.contains(metric) {
                StatValue::editable(metric_value(sum))
            } else {
                StatValue::new(metric_value(sum))
            };
            stats.insert(metric.clone(), value);
        }
        stats
    }
}

fn row_id(fact: &Fact, dims: &[Dimension]) -> String {
    let mut id = String::new();
    for (idx, dim) in dims.iter().enumerate() {
        if idx > 0 {
            id.push(ID_SEPARATOR);
        }
        for ch in fact.dimension_value(dim).chars() {
            if ch == ID_SEPARATOR || ch == ID_ESCAPE {
                id.push(ID_ESCAPE);
            }
            id.push(ch);
        }
    }
    id
}

fn metric_value(value: f64) -> serde_json::Value {
    if value.fract() == 0.0 && value.abs() < 9.0e15 {
        serde_json::Value::from(value as i64)
    } else {
        serde_json::Value::from(value)
    }
}

fn sort_groups(groups: &mut [Group], order: Option<&Order>, metrics: &[String]) {
    let by_metric = order.filter(|order| metrics.contains(&order.field));
    groups.sort_by(|a, b| {
        let ordering = match by_metric {
            Some(order) => {
                let lhs = a.sums.get(&order.field).copied().unwrap_or(0.0);
                let rhs = b.sums.get(&order.field).copied().unwrap_or(0.0);
                lhs.partial_cmp(&rhs).unwrap_or(Ordering::Equal)
            }
            None => a.label.cmp(&b.label),
        };
        let ordering = match order.map(|order| order.direction) {
            Some(Direction::Descending) => ordering.reverse(),
            _ => ordering,
        };
        ordering.then_with(|| a.id.cmp(&b.id))
    });
}

#[async_trait]
impl Endpoint for MemoryEndpoint {
    async fn metadata(&self) -> Result<MetaData, EndpointError> {
        Ok(self.describe())
    }

    async fn fetch(&self, request: &BreakdownRequest) -> Result<Vec<Page>, EndpointError> {
        self.requests.fetch_add(1, AtomicOrdering::Relaxed);
        self.serve(request)
    }

    async fn save(&self, edit: &CellEdit) -> Result<Page, EndpointError> {
        self.apply_edit(edit)
    }
}
