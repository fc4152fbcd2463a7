//! The catalog's native object query.
//!
//! Queries render as
//! `SELECT o FROM Investigation o JOIN o.facility a1 WHERE a1.name = 'ISIS'
//! ORDER BY o.id DESC INCLUDE o.datasets AS i1 LIMIT 0, 10`.
//! Relation paths are joined through aliases allocated once per distinct
//! path, so any number of hops is possible.

use std::collections::BTreeMap;
use std::fmt;

use serde_json::Value;

use crate::error::{ApiError, ApiResult};
use crate::filter::{Direction, FieldPath, Operator, between_bounds, list_values, parse_datetime};

/// Alias of the queried entity.
pub const BASE_ALIAS: &str = "o";

/// Path-keyed join aliases for one query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JoinAliases {
    /// `(relation path, alias)` in allocation order.
    joins: Vec<(String, String)>,
}

impl JoinAliases {
    /// Alias for the entity reached through `relations`, allocating one per
    /// path prefix not seen before. The empty path is the base alias.
    pub fn alias_for(&mut self, relations: &[String]) -> String {
        let mut alias = BASE_ALIAS.to_string();
        for depth in 1..=relations.len() {
            let path = relations[..depth].join(".");
            alias = match self.joins.iter().find(|(p, _)| *p == path) {
                Some((_, existing)) => existing.clone(),
                None => {
                    let fresh = format!("a{}", self.joins.len() + 1);
                    self.joins.push((path, fresh.clone()));
                    fresh
                }
            };
        }
        alias
    }

    /// `alias.field` for a dotted field path.
    pub fn qualify(&mut self, path: &FieldPath) -> String {
        format!("{}.{}", self.alias_for(path.relations()), path.field())
    }

    pub fn len(&self) -> usize {
        self.joins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.joins.is_empty()
    }

    /// `JOIN o.facility a1 JOIN a1.instruments a2 ...`
    fn render(&self) -> String {
        self.joins
            .iter()
            .map(|(path, alias)| {
                let (parent, relation) = match path.rsplit_once('.') {
                    Some((parent, relation)) => (self.alias_of(parent), relation),
                    None => (BASE_ALIAS, path.as_str()),
                };
                format!(" JOIN {parent}.{relation} {alias}")
            })
            .collect()
    }

    fn alias_of(&self, path: &str) -> &str {
        self.joins
            .iter()
            .find(|(p, _)| p == path)
            .map_or(BASE_ALIAS, |(_, alias)| alias.as_str())
    }
}

/// One condition on an attribute, without the attribute itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    predicate: String,
    /// Compare upper-cased attribute values.
    upper: bool,
    /// Marks an attribute requested by a distinct filter.
    sentinel: bool,
}

impl Fragment {
    fn new(predicate: impl Into<String>) -> Self {
        Self {
            predicate: predicate.into(),
            upper: false,
            sentinel: false,
        }
    }

    fn upper_cased(predicate: impl Into<String>) -> Self {
        Self {
            upper: true,
            ..Self::new(predicate)
        }
    }

    /// `IS NOT NULL`, recording that the attribute was asked for distinct.
    pub fn sentinel() -> Self {
        Self {
            sentinel: true,
            ..Self::new("IS NOT NULL")
        }
    }

    pub fn is_sentinel(&self) -> bool {
        self.sentinel
    }

    pub fn render(&self, attribute: &str) -> String {
        if self.upper {
            format!("UPPER({attribute}) {}", self.predicate)
        } else {
            format!("{attribute} {}", self.predicate)
        }
    }

    /// Build the fragment for `operation` against `value`. `None` means the
    /// condition constrains nothing (an empty `nin`).
    pub fn build(operation: Operator, value: &Value) -> ApiResult<Option<Fragment>> {
        let fragment = match operation {
            Operator::Eq if value.is_null() => Fragment::new("IS NULL"),
            Operator::Ne if value.is_null() => Fragment::new("IS NOT NULL"),
            Operator::Eq => Fragment::new(format!("= {}", literal(value)?)),
            Operator::Ne => Fragment::new(format!("<> {}", literal(value)?)),
            Operator::Like => Fragment::new(format!("LIKE {}", like_literal(value)?)),
            Operator::Nlike => Fragment::new(format!("NOT LIKE {}", like_literal(value)?)),
            Operator::Ilike => {
                Fragment::upper_cased(format!("LIKE UPPER({})", like_literal(value)?))
            }
            Operator::Nilike => {
                Fragment::upper_cased(format!("NOT LIKE UPPER({})", like_literal(value)?))
            }
            Operator::Lt => Fragment::new(format!("< {}", comparison_literal(value)?)),
            Operator::Lte => Fragment::new(format!("<= {}", comparison_literal(value)?)),
            Operator::Gt => Fragment::new(format!("> {}", comparison_literal(value)?)),
            Operator::Gte => Fragment::new(format!(">= {}", comparison_literal(value)?)),
            Operator::In => {
                let items = list_values(value, operation)?;
                if items.is_empty() {
                    Fragment::new("IN (NULL)")
                } else {
                    Fragment::new(format!("IN ({})", literal_list(items)?))
                }
            }
            Operator::Nin => {
                let items = list_values(value, operation)?;
                if items.is_empty() {
                    return Ok(None);
                }
                Fragment::new(format!("NOT IN ({})", literal_list(items)?))
            }
            Operator::Between => {
                let (low, high) = between_bounds(value)?;
                Fragment::new(format!(
                    "BETWEEN {} AND {}",
                    comparison_literal(low)?,
                    comparison_literal(high)?
                ))
            }
            Operator::Regexp => Fragment::new(format!("REGEXP {}", literal(value)?)),
        };
        Ok(Some(fragment))
    }
}

/// Render a scalar as a query literal.
pub fn literal(value: &Value) -> ApiResult<String> {
    match value {
        Value::Null => Ok("NULL".to_string()),
        Value::Bool(true) => Ok("TRUE".to_string()),
        Value::Bool(false) => Ok("FALSE".to_string()),
        Value::Number(n) => Ok(n.to_string()),
        Value::String(s) => Ok(quote(s)),
        Value::Array(_) | Value::Object(_) => Err(ApiError::bad_request(format!(
            "expected a single value, got {value}"
        ))),
    }
}

/// Like [`literal`], but date-parseable strings become timestamps.
fn comparison_literal(value: &Value) -> ApiResult<String> {
    if let Some(dt) = value.as_str().and_then(parse_datetime) {
        return Ok(format!("{{ts {}}}", dt.format("%Y-%m-%d %H:%M:%S")));
    }
    literal(value)
}

fn like_literal(value: &Value) -> ApiResult<String> {
    let text = match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        other => {
            return Err(ApiError::bad_request(format!(
                "'like' expects a string, got {other}"
            )));
        }
    };
    Ok(quote(&format!("%{text}%")))
}

fn literal_list(items: &[Value]) -> ApiResult<String> {
    Ok(items
        .iter()
        .map(literal)
        .collect::<ApiResult<Vec<_>>>()?
        .join(", "))
}

fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateFunction {
    Count,
    Avg,
    Sum,
    Min,
    Max,
}

impl AggregateFunction {
    pub fn as_str(self) -> &'static str {
        match self {
            AggregateFunction::Count => "COUNT",
            AggregateFunction::Avg => "AVG",
            AggregateFunction::Sum => "SUM",
            AggregateFunction::Min => "MIN",
            AggregateFunction::Max => "MAX",
        }
    }
}

/// Aggregate applied to the selected attributes. Written `COUNT`,
/// `DISTINCT` or `COUNT:DISTINCT`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Aggregate {
    pub function: Option<AggregateFunction>,
    pub distinct: bool,
}

impl Aggregate {
    pub fn function(function: AggregateFunction) -> Self {
        Self {
            function: Some(function),
            distinct: false,
        }
    }

    /// This aggregate with `DISTINCT` folded in.
    pub fn with_distinct(self) -> Self {
        Self {
            distinct: true,
            ..self
        }
    }

    fn select(self, target: &str) -> String {
        match (self.function, self.distinct) {
            (None, false) => target.to_string(),
            (None, true) => format!("DISTINCT {target}"),
            (Some(f), false) => format!("{}({target})", f.as_str()),
            (Some(f), true) => format!("{}(DISTINCT {target})", f.as_str()),
        }
    }
}

impl fmt::Display for Aggregate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.function, self.distinct) {
            (None, false) => Ok(()),
            (None, true) => f.write_str("DISTINCT"),
            (Some(func), false) => f.write_str(func.as_str()),
            (Some(func), true) => write!(f, "{}:DISTINCT", func.as_str()),
        }
    }
}

/// A selected attribute and the field path it was requested as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub qualified: String,
    pub label: String,
}

/// Native catalog query under construction.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogQuery {
    entity: String,
    aliases: JoinAliases,
    conditions: BTreeMap<String, Vec<Fragment>>,
    raw_conditions: Vec<String>,
    attributes: Vec<Attribute>,
    aggregate: Option<Aggregate>,
    order: Vec<(String, Direction)>,
    limit: Option<(u64, u64)>,
    includes: Vec<String>,
}

impl CatalogQuery {
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            aliases: JoinAliases::default(),
            conditions: BTreeMap::new(),
            raw_conditions: Vec::new(),
            attributes: Vec::new(),
            aggregate: None,
            order: Vec::new(),
            limit: None,
            includes: Vec::new(),
        }
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub fn aliases(&self) -> &JoinAliases {
        &self.aliases
    }

    /// Qualified attribute for `path`, joining its relations.
    pub fn qualify(&mut self, path: &FieldPath) -> String {
        self.aliases.qualify(path)
    }

    /// Add a condition; several on one attribute are ANDed.
    pub fn add_condition(&mut self, attribute: String, fragment: Fragment) {
        self.conditions.entry(attribute).or_default().push(fragment);
    }

    /// Add an already-rendered condition.
    pub fn add_raw_condition(&mut self, condition: String) {
        self.raw_conditions.push(condition);
    }

    pub fn conditions(&self) -> &BTreeMap<String, Vec<Fragment>> {
        &self.conditions
    }

    pub fn add_attribute(&mut self, attribute: Attribute) {
        if !self.attributes.contains(&attribute) {
            self.attributes.push(attribute);
        }
    }

    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    pub fn aggregate(&self) -> Option<Aggregate> {
        self.aggregate
    }

    pub fn set_aggregate(&mut self, aggregate: Aggregate) {
        self.aggregate = Some(aggregate);
    }

    /// Replace the whole order list.
    pub fn set_order(&mut self, order: Vec<(String, Direction)>) {
        self.order = order;
    }

    pub fn order(&self) -> &[(String, Direction)] {
        &self.order
    }

    /// Set the single `(offset, count)` pair.
    pub fn set_limit(&mut self, offset: u64, count: u64) {
        self.limit = Some((offset, count));
    }

    pub fn limit(&self) -> Option<(u64, u64)> {
        self.limit
    }

    /// Eager-load a dotted relation path, e.g. `datasets.datafiles`.
    pub fn add_include(&mut self, path: String) {
        if !self.includes.contains(&path) {
            self.includes.push(path);
        }
    }

    pub fn includes(&self) -> &[String] {
        &self.includes
    }

    /// Labels of attributes requested by a distinct filter, in select order.
    pub fn distinct_fields(&self) -> Vec<String> {
        self.attributes
            .iter()
            .filter(|a| {
                self.conditions
                    .get(&a.qualified)
                    .is_some_and(|frags| frags.iter().any(Fragment::is_sentinel))
            })
            .map(|a| a.label.clone())
            .collect()
    }

    fn render_where(&self) -> Option<String> {
        let mut parts: Vec<String> = self
            .conditions
            .iter()
            .flat_map(|(attribute, fragments)| fragments.iter().map(|f| f.render(attribute)))
            .collect();
        parts.extend(self.raw_conditions.iter().cloned());
        (!parts.is_empty()).then(|| parts.join(" AND "))
    }

    /// `INCLUDE o.datasets AS i1, i1.datafiles AS i2`
    fn render_includes(&self) -> Option<String> {
        let mut paths = self.includes.clone();
        // Parents before children.
        paths.sort_by_key(|p| p.matches('.').count());

        let mut aliases: Vec<(String, String)> = Vec::new();
        let mut parts = Vec::new();
        for path in paths {
            let mut parent_alias = BASE_ALIAS.to_string();
            let mut prefix = String::new();
            for segment in path.split('.') {
                if !prefix.is_empty() {
                    prefix.push('.');
                }
                prefix.push_str(segment);
                match aliases.iter().find(|(p, _)| *p == prefix) {
                    Some((_, alias)) => parent_alias = alias.clone(),
                    None => {
                        let alias = format!("i{}", aliases.len() + 1);
                        parts.push(format!("{parent_alias}.{segment} AS {alias}"));
                        aliases.push((prefix.clone(), alias.clone()));
                        parent_alias = alias;
                    }
                }
            }
        }
        (!parts.is_empty()).then(|| parts.join(", "))
    }
}

impl fmt::Display for CatalogQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let target = if self.attributes.is_empty() {
            BASE_ALIAS.to_string()
        } else {
            self.attributes
                .iter()
                .map(|a| a.qualified.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        };
        let select = self.aggregate.unwrap_or_default().select(&target);
        write!(
            f,
            "SELECT {select} FROM {} {BASE_ALIAS}{}",
            self.entity,
            self.aliases.render()
        )?;
        if let Some(conditions) = self.render_where() {
            write!(f, " WHERE {conditions}")?;
        }
        if !self.order.is_empty() {
            let order: Vec<String> = self
                .order
                .iter()
                .map(|(attribute, direction)| format!("{attribute} {}", direction.as_str()))
                .collect();
            write!(f, " ORDER BY {}", order.join(", "))?;
        }
        if let Some(includes) = self.render_includes() {
            write!(f, " INCLUDE {includes}")?;
        }
        if let Some((offset, count)) = self.limit {
            write!(f, " LIMIT {offset}, {count}")?;
        }
        Ok(())
    }
}
