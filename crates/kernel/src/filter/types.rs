//! Filter model types.
//!
//! Provides the typed representation of one request-level filter:
//! - Filter: the closed set of filter variants, each with a fixed precedence
//! - FieldPath: dotted field references crossing relations
//! - Operator: comparison operators accepted in `where` clauses
//! - RelationSpec: include targets with optional nested scopes

use std::fmt;

use serde_json::Value;

use super::boolean::BooleanNode;
use crate::error::{ApiError, ApiResult, FilterError};

/// Dotted reference to a field, e.g. `title` or `facility.name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldPath {
    segments: Vec<String>,
}

impl FieldPath {
    /// Parse a dotted path. Empty segments are rejected.
    pub fn parse(raw: &str) -> Result<Self, FilterError> {
        let segments: Vec<String> = raw.split('.').map(|s| s.trim().to_string()).collect();
        if segments.iter().any(String::is_empty) {
            return Err(FilterError::InvalidField(raw.to_string()));
        }
        Ok(Self { segments })
    }

    /// Build a path from already-split segments.
    pub fn from_segments(segments: Vec<String>) -> Result<Self, FilterError> {
        if segments.is_empty() || segments.iter().any(String::is_empty) {
            return Err(FilterError::InvalidField(segments.join(".")));
        }
        Ok(Self { segments })
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// The relation segments, i.e. everything but the final field.
    pub fn relations(&self) -> &[String] {
        &self.segments[..self.segments.len() - 1]
    }

    /// The final segment.
    pub fn field(&self) -> &str {
        &self.segments[self.segments.len() - 1]
    }

    /// Number of relation boundaries crossed.
    pub fn hops(&self) -> usize {
        self.segments.len() - 1
    }

    /// This path followed by `other`.
    pub fn join(&self, other: &FieldPath) -> FieldPath {
        let mut segments = self.segments.clone();
        segments.extend(other.segments.iter().cloned());
        FieldPath { segments }
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.segments.join("."))
    }
}

/// Comparison operators for `where` clauses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    Eq,
    Ne,
    Like,
    Ilike,
    Nlike,
    Nilike,
    Lt,
    Lte,
    Gt,
    Gte,
    /// Accepted as `in` or `inq`.
    In,
    Nin,
    Between,
    Regexp,
}

impl Operator {
    pub fn parse(raw: &str) -> Result<Self, FilterError> {
        Ok(match raw {
            "eq" => Operator::Eq,
            "ne" | "neq" => Operator::Ne,
            "like" => Operator::Like,
            "ilike" => Operator::Ilike,
            "nlike" => Operator::Nlike,
            "nilike" => Operator::Nilike,
            "lt" => Operator::Lt,
            "lte" => Operator::Lte,
            "gt" => Operator::Gt,
            "gte" => Operator::Gte,
            "in" | "inq" => Operator::In,
            "nin" => Operator::Nin,
            "between" => Operator::Between,
            "regexp" => Operator::Regexp,
            other => return Err(FilterError::InvalidOperator(other.to_string())),
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Operator::Eq => "eq",
            Operator::Ne => "ne",
            Operator::Like => "like",
            Operator::Ilike => "ilike",
            Operator::Nlike => "nlike",
            Operator::Nilike => "nilike",
            Operator::Lt => "lt",
            Operator::Lte => "lte",
            Operator::Gt => "gt",
            Operator::Gte => "gte",
            Operator::In => "in",
            Operator::Nin => "nin",
            Operator::Between => "between",
            Operator::Regexp => "regexp",
        }
    }
}

/// A single `field <op> value` condition.
#[derive(Debug, Clone, PartialEq)]
pub struct WhereFilter {
    pub field: FieldPath,
    pub value: Value,
    pub operation: Operator,
}

impl WhereFilter {
    /// Build a condition, checking that the value has the shape the
    /// operator needs.
    pub fn new(field: FieldPath, value: Value, operation: Operator) -> ApiResult<Self> {
        match operation {
            Operator::Between => {
                between_bounds(&value)?;
            }
            Operator::In | Operator::Nin => {
                list_values(&value, operation)?;
            }
            _ => {
                if value.is_array() || value.is_object() {
                    return Err(ApiError::bad_request(format!(
                        "'{}' expects a single value for '{field}'",
                        operation.as_str()
                    )));
                }
            }
        }
        Ok(Self {
            field,
            value,
            operation,
        })
    }

    /// Same condition on `prefix.field`.
    pub fn prefixed(&self, prefix: &FieldPath) -> Self {
        Self {
            field: prefix.join(&self.field),
            value: self.value.clone(),
            operation: self.operation,
        }
    }
}

/// Leaf of a boolean `where` tree.
#[derive(Debug, Clone, PartialEq)]
pub enum WhereLeaf {
    Condition(WhereFilter),
    /// Free-text search, expanded over an entity's text fields.
    Text(String),
}

/// The two bounds of a `between` value.
pub fn between_bounds(value: &Value) -> ApiResult<(&Value, &Value)> {
    match value.as_array().map(Vec::as_slice) {
        Some([low, high]) => Ok((low, high)),
        Some(items) => Err(ApiError::bad_request(format!(
            "'between' takes exactly 2 values, got {}",
            items.len()
        ))),
        None => Err(ApiError::bad_request("'between' expects a list of 2 values")),
    }
}

/// The elements of an `in`/`nin` value.
pub fn list_values(value: &Value, operation: Operator) -> ApiResult<&[Value]> {
    value.as_array().map(Vec::as_slice).ok_or_else(|| {
        ApiError::bad_request(format!("'{}' expects a list of values", operation.as_str()))
    })
}

/// Sort direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Direction {
    #[default]
    Asc,
    Desc,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Asc => "ASC",
            Direction::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderFilter {
    pub field: FieldPath,
    pub direction: Direction,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DistinctFilter {
    pub fields: Vec<FieldPath>,
}

/// Row limit. `skip` is only set when a skip filter has been merged in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitFilter {
    pub count: u64,
    pub skip: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IncludeFilter {
    pub relations: Vec<RelationSpec>,
}

/// Relation to eager-load, optionally with a scope of its own filters.
#[derive(Debug, Clone, PartialEq)]
pub struct RelationSpec {
    pub name: String,
    pub scope: Option<Scope>,
}

impl RelationSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            scope: None,
        }
    }

    /// Filters of the scope other than nested includes.
    pub fn scope_filters(&self) -> impl Iterator<Item = &Filter> {
        self.scope
            .iter()
            .flat_map(|s| s.filters.iter())
            .filter(|f| !matches!(f, Filter::Include(_)))
    }

    /// Relations included from inside this relation's scope.
    pub fn nested(&self) -> impl Iterator<Item = &RelationSpec> {
        self.scope
            .iter()
            .flat_map(|s| s.filters.iter())
            .filter_map(|f| match f {
                Filter::Include(include) => Some(include.relations.iter()),
                _ => None,
            })
            .flatten()
    }

    /// Dotted include paths for this relation and everything nested below it.
    pub fn include_paths(&self) -> Vec<String> {
        let mut paths = vec![self.name.clone()];
        for child in self.nested() {
            for path in child.include_paths() {
                paths.push(format!("{}.{path}", self.name));
            }
        }
        paths
    }
}

/// Filters nested under an include. Never contains skip or limit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Scope {
    pub filters: Vec<Filter>,
}

/// One request-level filter.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Distinct(DistinctFilter),
    Where(WhereFilter),
    /// A `where` clause built from `and`/`or`/`text` nesting.
    NestedWhere(BooleanNode<WhereLeaf>),
    Order(OrderFilter),
    Skip(u64),
    Limit(LimitFilter),
    Include(IncludeFilter),
}

impl Filter {
    /// Fixed application order; lower runs first.
    pub const fn precedence(&self) -> u8 {
        match self {
            Filter::Distinct(_) => 0,
            Filter::Where(_) | Filter::NestedWhere(_) => 1,
            Filter::Order(_) => 2,
            Filter::Skip(_) => 3,
            Filter::Limit(_) => 4,
            Filter::Include(_) => 5,
        }
    }

    pub const fn kind(&self) -> &'static str {
        match self {
            Filter::Distinct(_) => "distinct",
            Filter::Where(_) => "where",
            Filter::NestedWhere(_) => "nested_where",
            Filter::Order(_) => "order",
            Filter::Skip(_) => "skip",
            Filter::Limit(_) => "limit",
            Filter::Include(_) => "include",
        }
    }

    pub fn limit(count: u64) -> Self {
        Filter::Limit(LimitFilter { count, skip: None })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn field_path_parts() {
        let path = FieldPath::parse("investigation.facility.name").unwrap();
        assert_eq!(path.hops(), 2);
        assert_eq!(path.field(), "name");
        assert_eq!(path.relations(), ["investigation", "facility"]);
        assert_eq!(path.to_string(), "investigation.facility.name");
    }

    #[test]
    fn field_path_rejects_empty_segments() {
        assert!(FieldPath::parse("").is_err());
        assert!(FieldPath::parse("facility..name").is_err());
        assert!(FieldPath::parse("title.").is_err());
    }

    #[test]
    fn operator_aliases() {
        assert_eq!(Operator::parse("neq").unwrap(), Operator::Ne);
        assert_eq!(Operator::parse("inq").unwrap(), Operator::In);
        assert_eq!(
            Operator::parse("approx").unwrap_err(),
            FilterError::InvalidOperator("approx".to_string())
        );
    }

    #[test]
    fn precedence_order() {
        let filters = [
            Filter::Distinct(DistinctFilter { fields: vec![] }),
            Filter::Where(
                WhereFilter::new(FieldPath::parse("id").unwrap(), json!(1), Operator::Eq).unwrap(),
            ),
            Filter::Order(OrderFilter {
                field: FieldPath::parse("id").unwrap(),
                direction: Direction::Desc,
            }),
            Filter::Skip(5),
            Filter::limit(10),
            Filter::Include(IncludeFilter { relations: vec![] }),
        ];
        let precedences: Vec<u8> = filters.iter().map(Filter::precedence).collect();
        assert_eq!(precedences, [0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn between_arity() {
        let field = FieldPath::parse("fileSize").unwrap();
        assert!(WhereFilter::new(field.clone(), json!([1, 5]), Operator::Between).is_ok());
        for bad in [json!([]), json!([1]), json!([1, 2, 3]), json!(4)] {
            let err = WhereFilter::new(field.clone(), bad, Operator::Between).unwrap_err();
            assert!(matches!(err, ApiError::BadRequest(_)), "{err}");
        }
    }

    #[test]
    fn in_requires_list_but_allows_empty() {
        let field = FieldPath::parse("id").unwrap();
        assert!(WhereFilter::new(field.clone(), json!([]), Operator::In).is_ok());
        assert!(WhereFilter::new(field.clone(), json!([]), Operator::Nin).is_ok());
        let err = WhereFilter::new(field, json!(3), Operator::In).unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(_)));
    }

    #[test]
    fn include_paths_flatten_scopes() {
        let spec = RelationSpec {
            name: "datasets".to_string(),
            scope: Some(Scope {
                filters: vec![Filter::Include(IncludeFilter {
                    relations: vec![RelationSpec::new("datafiles"), RelationSpec::new("sample")],
                })],
            }),
        };
        assert_eq!(
            spec.include_paths(),
            ["datasets", "datasets.datafiles", "datasets.sample"]
        );
    }
}
