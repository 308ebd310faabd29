//! Identifiers and query configuration shared by the tree, the endpoint
//! contract, and the data source.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::Date;

mod error;

pub use error::{EngineError, Result};

/// Opaque identifier of the entity a row aggregates.
///
/// Endpoints compose ids so they are unique across the whole tree (for
/// example by joining the ids of every ancestor), which lets a page name its
/// parent with a single id.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BreakdownId(pub String);

impl BreakdownId {
    /// Creates an id from anything string-like.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrows the raw id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BreakdownId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BreakdownId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for BreakdownId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Names the node a merge or a page request is about.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum NodeRef {
    /// The synthetic level-0 totals row.
    Root,
    /// A materialized row identified by its breakdown id.
    Node(BreakdownId),
}

impl NodeRef {
    /// Returns the breakdown id, or `None` for the root.
    pub fn id(&self) -> Option<&BreakdownId> {
        match self {
            NodeRef::Root => None,
            NodeRef::Node(id) => Some(id),
        }
    }
}

impl fmt::Display for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRef::Root => f.write_str("<root>"),
            NodeRef::Node(id) => write!(f, "'{id}'"),
        }
    }
}

impl From<BreakdownId> for NodeRef {
    fn from(id: BreakdownId) -> Self {
        NodeRef::Node(id)
    }
}

impl From<&str> for NodeRef {
    fn from(id: &str) -> Self {
        NodeRef::Node(BreakdownId::from(id))
    }
}

/// A grouping dimension such as `account`, `campaign`, or `day`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Dimension(pub String);

impl Dimension {
    /// Creates a dimension from anything string-like.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Borrows the dimension name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Dimension {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Ordered dimensions, one per tree level; index 0 groups level 1.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BreakdownPath(Vec<Dimension>);

impl BreakdownPath {
    /// Creates a path from dimensions in level order.
    pub fn new(dimensions: Vec<Dimension>) -> Self {
        Self(dimensions)
    }

    /// Number of configured levels.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` when no level is configured.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Dimension grouping `level` (1-based).
    pub fn dimension_for_level(&self, level: usize) -> Option<&Dimension> {
        level.checked_sub(1).and_then(|idx| self.0.get(idx))
    }

    /// Dimensions in level order.
    pub fn dimensions(&self) -> &[Dimension] {
        &self.0
    }

    /// Iterates dimensions in level order.
    pub fn iter(&self) -> impl Iterator<Item = &Dimension> {
        self.0.iter()
    }

    /// Checks that the path names at least one level and no dimension twice.
    pub fn validate(&self) -> Result<()> {
        if self.0.is_empty() {
            return Err(EngineError::InvalidPath("path has no levels".into()));
        }
        for (idx, dim) in self.0.iter().enumerate() {
            if dim.as_str().trim().is_empty() {
                return Err(EngineError::InvalidPath(format!(
                    "level {} has an empty dimension",
                    idx + 1
                )));
            }
            if self.0[..idx].contains(dim) {
                return Err(EngineError::InvalidPath(format!(
                    "dimension '{dim}' appears more than once"
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Display for BreakdownPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, dim) in self.0.iter().enumerate() {
            if idx > 0 {
                f.write_str(" > ")?;
            }
            write!(f, "{dim}")?;
        }
        Ok(())
    }
}

impl<D: Into<Dimension>> FromIterator<D> for BreakdownPath {
    fn from_iter<I: IntoIterator<Item = D>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

impl FromStr for BreakdownPath {
    type Err = EngineError;

    /// Parses a comma-separated list such as `account,campaign,day`.
    fn from_str(s: &str) -> Result<Self> {
        let path: BreakdownPath = s
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(Dimension::from)
            .collect();
        path.validate()?;
        Ok(path)
    }
}

/// Sort direction for an [`Order`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Smallest first.
    Ascending,
    /// Largest first.
    Descending,
}

/// Sort order applied to every level of the tree.
///
/// The textual form uses a leading `-` for descending order, e.g. `-clicks`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Order {
    /// Column or metric key to sort by.
    pub field: String,
    /// Sort direction.
    pub direction: Direction,
}

impl Order {
    /// Ascending order on `field`.
    pub fn ascending(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: Direction::Ascending,
        }
    }

    /// Descending order on `field`.
    pub fn descending(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: Direction::Descending,
        }
    }
}

impl fmt::Display for Order {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.direction {
            Direction::Ascending => write!(f, "{}", self.field),
            Direction::Descending => write!(f, "-{}", self.field),
        }
    }
}

impl FromStr for Order {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim();
        let (field, direction) = match s.strip_prefix('-') {
            Some(rest) => (rest, Direction::Descending),
            None => (s.strip_prefix('+').unwrap_or(s), Direction::Ascending),
        };
        if field.is_empty() {
            return Err(format!("order '{s}' names no field"));
        }
        Ok(Self {
            field: field.to_string(),
            direction,
        })
    }
}

/// Inclusive calendar date range.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DateRange {
    start: Date,
    end: Date,
}

impl DateRange {
    /// Creates a range, rejecting `start > end`.
    pub fn new(start: Date, end: Date) -> std::result::Result<Self, String> {
        if start > end {
            return Err(format!("date range starts after it ends ({start} > {end})"));
        }
        Ok(Self { start, end })
    }

    /// First day included.
    pub fn start(&self) -> Date {
        self.start
    }

    /// Last day included.
    pub fn end(&self) -> Date {
        self.end
    }

    /// Returns `true` when `date` falls inside the range.
    pub fn contains(&self, date: Date) -> bool {
        self.start <= date && date <= self.end
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..={}", self.start, self.end)
    }
}

/// Restricts the aggregated facts to those whose `dimension` takes one of `values`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Filter {
    /// Dimension the filter applies to.
    pub dimension: Dimension,
    /// Accepted values.
    pub values: Vec<String>,
}

impl Filter {
    /// Creates a filter accepting `values` for `dimension`.
    pub fn new(dimension: impl Into<Dimension>, values: Vec<String>) -> Self {
        Self {
            dimension: dimension.into(),
            values,
        }
    }
}

impl FromStr for Filter {
    type Err = String;

    /// Parses `dimension=v1,v2`.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (dimension, values) = s
            .split_once('=')
            .ok_or_else(|| format!("filter '{s}' must look like dimension=value[,value]"))?;
        let dimension = dimension.trim();
        if dimension.is_empty() {
            return Err(format!("filter '{s}' names no dimension"));
        }
        let values: Vec<String> = values
            .split(',')
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .collect();
        if values.is_empty() {
            return Err(format!("filter '{s}' lists no values"));
        }
        Ok(Filter::new(dimension, values))
    }
}

/// Everything besides pagination that shapes a breakdown request.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueryConfig {
    /// Dimensions per level.
    pub path: BreakdownPath,
    /// Sort order, or endpoint default when `None`.
    pub order: Option<Order>,
    /// Reporting window, or endpoint default when `None`.
    pub date_range: Option<DateRange>,
    /// Global filters.
    pub filters: Vec<Filter>,
}

impl QueryConfig {
    /// Returns `true` when both configs agree on everything except the path.
    pub fn same_basis(&self, other: &QueryConfig) -> bool {
        self.order == other.order
            && self.date_range == other.date_range
            && self.filters == other.filters
    }
}

/// Monotonic configuration version used to discard superseded responses.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Epoch(pub u64);

impl Epoch {
    /// The epoch following this one.
    pub fn next(self) -> Self {
        Epoch(self.0.saturating_add(1))
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "e{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::date;

    #[test]
    fn parses_orders() {
        assert_eq!("-clicks".parse::<Order>().unwrap(), Order::descending("clicks"));
        assert_eq!("cost".parse::<Order>().unwrap(), Order::ascending("cost"));
        assert_eq!("+cost".parse::<Order>().unwrap(), Order::ascending("cost"));
        assert!("-".parse::<Order>().is_err());
        assert_eq!(Order::descending("clicks").to_string(), "-clicks");
    }

    #[test]
    fn path_validation_rejects_duplicates_and_empty() {
        assert!("account,campaign".parse::<BreakdownPath>().is_ok());
        assert!(matches!(
            "account,account".parse::<BreakdownPath>(),
            Err(EngineError::InvalidPath(_))
        ));
        assert!(matches!(
            "".parse::<BreakdownPath>(),
            Err(EngineError::InvalidPath(_))
        ));
    }

    #[test]
    fn dimension_for_level_is_one_based() {
        let path: BreakdownPath = ["account", "campaign"].into_iter().collect();
        assert_eq!(path.dimension_for_level(0), None);
        assert_eq!(path.dimension_for_level(1), Some(&Dimension::from("account")));
        assert_eq!(path.dimension_for_level(2), Some(&Dimension::from("campaign")));
        assert_eq!(path.dimension_for_level(3), None);
    }

    #[test]
    fn date_range_rejects_inverted_bounds() {
        assert!(DateRange::new(date!(2026 - 02 - 01), date!(2026 - 01 - 01)).is_err());
        let range = DateRange::new(date!(2026 - 01 - 01), date!(2026 - 01 - 31)).unwrap();
        assert!(range.contains(date!(2026 - 01 - 15)));
        assert!(!range.contains(date!(2026 - 02 - 01)));
    }

    #[test]
    fn parses_filters() {
        let filter: Filter = "account=a1, a2".parse().unwrap();
        assert_eq!(filter.dimension, Dimension::from("account"));
        assert_eq!(filter.values, vec!["a1".to_string(), "a2".to_string()]);
        assert!("account".parse::<Filter>().is_err());
        assert!("account=".parse::<Filter>().is_err());
    }
}
