//! Relational query builder using SeaQuery.
//!
//! Applies request filters to a `SELECT` over one catalog entity:
//! - dotted field paths become aliased inner joins (at most two hops)
//! - operators become SQL predicates, nested trees become `Cond` groups
//! - distinct switches to a labelled column projection
//! - include only records which relations the executor must load

use std::collections::BTreeSet;

use sea_query::{
    Alias, BinOper, Cond, Expr, Func, JoinType, LikeExpr, Order, Query, SelectStatement,
    SimpleExpr,
};
use serde_json::Value;

use super::Dialect;
use crate::error::{ApiError, ApiResult, FilterError};
use crate::filter::{
    BooleanNode, BooleanOperator, Direction, FieldPath, Filter, FilterSet, FilterTarget,
    Operator, RelationSpec, WhereFilter, WhereLeaf, between_bounds, list_values, parse_datetime,
};
use crate::schema::{Cardinality, EntityDef, FieldDef, FieldKind, Schema};

/// Joins allowed per field path.
const MAX_HOPS: usize = 2;

/// A selected column: its output label and how to decode it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectedColumn {
    pub label: String,
    pub kind: FieldKind,
}

/// Output of compiling a filter set for the relational backend.
#[derive(Debug, Clone)]
pub struct CompiledSql {
    pub entity: String,
    pub sql: String,
    pub projection: Vec<ProjectedColumn>,
    pub includes: Vec<RelationSpec>,
    pub distinct: bool,
}

/// Compile `filters` into a `SELECT` over `entity`.
pub fn compile_sql(entity: &str, filters: &FilterSet, dialect: Dialect) -> ApiResult<CompiledSql> {
    let mut query = RelationalQuery::new(crate::schema::catalog(), entity, dialect)?;
    filters.apply(&mut query)?;
    let compiled = query.finish();
    tracing::debug!(entity, sql = %compiled.sql, "compiled relational query");
    Ok(compiled)
}

/// Compile a `COUNT(*)` over `entity` honouring only the `where` filters.
pub fn compile_count_sql(entity: &str, filters: &FilterSet, dialect: Dialect) -> ApiResult<String> {
    let mut query = RelationalQuery::new(crate::schema::catalog(), entity, dialect)?;
    filters.where_only().apply(&mut query)?;
    let sql = query.finish_count();
    tracing::debug!(entity, %sql, "compiled relational count");
    Ok(sql)
}

/// Query context for one relational compilation.
pub struct RelationalQuery<'s> {
    schema: &'s Schema,
    entity: &'s EntityDef,
    dialect: Dialect,
    select: SelectStatement,
    joined: BTreeSet<String>,
    /// Set once a one-to-many join may repeat base rows.
    fans_out: bool,
    projection: Vec<ProjectedColumn>,
    distinct: bool,
    /// Joined order columns appended after the projection.
    order_columns: usize,
    includes: Option<Vec<RelationSpec>>,
}

impl<'s> RelationalQuery<'s> {
    pub fn new(schema: &'s Schema, entity: &str, dialect: Dialect) -> ApiResult<Self> {
        let entity = schema.entity(entity)?;
        let mut select = Query::select();
        select.from(Alias::new(&entity.table));

        let mut projection = Vec::with_capacity(entity.fields.len());
        for field in &entity.fields {
            select.expr_as(
                Expr::col((Alias::new(&entity.table), Alias::new(&field.column))),
                Alias::new(&field.name),
            );
            projection.push(ProjectedColumn {
                label: field.name.clone(),
                kind: field.kind,
            });
        }

        Ok(Self {
            schema,
            entity,
            dialect,
            select,
            joined: BTreeSet::new(),
            fans_out: false,
            projection,
            distinct: false,
            order_columns: 0,
            includes: None,
        })
    }

    /// Render the row query.
    pub fn finish(mut self) -> CompiledSql {
        if self.fans_out && !self.distinct {
            self.select.distinct();
        }
        CompiledSql {
            entity: self.entity.name.clone(),
            sql: self.dialect.render(&self.select),
            projection: self.projection,
            includes: self.includes.unwrap_or_default(),
            distinct: self.distinct,
        }
    }

    /// Render a count of the matching base rows. Only meaningful after
    /// `where` filters alone have been applied.
    pub fn finish_count(mut self) -> String {
        let base_id = Expr::col((
            Alias::new(&self.entity.table),
            Alias::new(self.entity.primary_key()),
        ));
        let count = if self.fans_out {
            base_id.count_distinct()
        } else {
            base_id.count()
        };
        self.select
            .clear_selects()
            .expr_as(count, Alias::new("count"));
        self.dialect.render(&self.select)
    }

    /// Join every relation on `path` and return the owning table alias and
    /// field.
    fn resolve(&mut self, path: &FieldPath) -> ApiResult<(String, &'s FieldDef)> {
        if path.hops() > MAX_HOPS {
            return Err(FilterError::TooManyHops(path.to_string()).into());
        }
        let hops = self.schema.walk(&self.entity.name, path.relations())?;

        let mut alias = self.entity.table.clone();
        let mut owner = self.entity;
        for (depth, hop) in hops.iter().enumerate() {
            let join_alias = join_alias(&path.relations()[..=depth]);
            if self.joined.insert(join_alias.clone()) {
                let on = match hop.relation.cardinality {
                    Cardinality::ManyToOne => {
                        let key = hop.from.require_field(&hop.relation.key)?;
                        Expr::col((Alias::new(&alias), Alias::new(&key.column)))
                            .equals((Alias::new(&join_alias), Alias::new(hop.to.primary_key())))
                    }
                    Cardinality::OneToMany => {
                        let key = hop.to.require_field(&hop.relation.key)?;
                        Expr::col((Alias::new(&alias), Alias::new(hop.from.primary_key())))
                            .equals((Alias::new(&join_alias), Alias::new(&key.column)))
                    }
                };
                self.select.join_as(
                    JoinType::InnerJoin,
                    Alias::new(&hop.to.table),
                    Alias::new(&join_alias),
                    on,
                );
            }
            if hop.relation.cardinality == Cardinality::OneToMany {
                self.fans_out = true;
            }
            alias = join_alias;
            owner = hop.to;
        }

        let field = owner.require_field(path.field())?;
        Ok((alias, field))
    }

    fn predicate(&mut self, filter: &WhereFilter) -> ApiResult<SimpleExpr> {
        let (alias, field) = self.resolve(&filter.field)?;
        let column = Expr::col((Alias::new(&alias), Alias::new(&field.column)));
        let value = &filter.value;

        Ok(match filter.operation {
            Operator::Eq if value.is_null() => column.is_null(),
            Operator::Ne if value.is_null() => column.is_not_null(),
            Operator::Eq => column.eq(sql_value(field, value)?),
            Operator::Ne => column.ne(sql_value(field, value)?),
            Operator::Like => column.like(like_pattern(value, false)),
            Operator::Nlike => column.not_like(like_pattern(value, false)),
            Operator::Ilike => Expr::expr(Func::upper(column)).like(like_pattern(value, true)),
            Operator::Nilike => {
                Expr::expr(Func::upper(column)).not_like(like_pattern(value, true))
            }
            Operator::Lt => column.lt(sql_value(field, value)?),
            Operator::Lte => column.lte(sql_value(field, value)?),
            Operator::Gt => column.gt(sql_value(field, value)?),
            Operator::Gte => column.gte(sql_value(field, value)?),
            Operator::In | Operator::Nin => {
                let items = list_values(value, filter.operation)?;
                let negate = filter.operation == Operator::Nin;
                if items.is_empty() {
                    // Empty IN matches nothing; empty NOT IN matches everything.
                    return Ok(Expr::cust(if negate { "1 = 1" } else { "1 = 0" }));
                }
                let values = items
                    .iter()
                    .map(|v| sql_value(field, v))
                    .collect::<ApiResult<Vec<_>>>()?;
                if negate {
                    column.is_not_in(values)
                } else {
                    column.is_in(values)
                }
            }
            Operator::Between => {
                let (low, high) = between_bounds(value)?;
                column.between(sql_value(field, low)?, sql_value(field, high)?)
            }
            Operator::Regexp => {
                let pattern = value.as_str().ok_or_else(|| {
                    ApiError::bad_request(format!("'regexp' expects a string for '{}'", filter.field))
                })?;
                SimpleExpr::from(column).binary(
                    BinOper::Custom(self.dialect.regexp_operator()),
                    Expr::val(pattern),
                )
            }
        })
    }

    fn condition(&mut self, node: &BooleanNode<WhereLeaf>) -> ApiResult<Option<Cond>> {
        match node {
            BooleanNode::Leaf(WhereLeaf::Condition(filter)) => {
                Ok(Some(Cond::all().add(self.predicate(filter)?)))
            }
            BooleanNode::Leaf(WhereLeaf::Text(_)) => Err(FilterError::Unsupported(
                "'text' search is not available on the relational backend".to_string(),
            )
            .into()),
            BooleanNode::Branch { lhs, rhs, operator } => {
                let mut cond = match operator {
                    BooleanOperator::And => Cond::all(),
                    BooleanOperator::Or => Cond::any(),
                };
                let mut empty = true;
                for child in lhs.iter().chain(rhs) {
                    if let Some(c) = self.condition(child)? {
                        cond = cond.add(c);
                        empty = false;
                    }
                }
                Ok((!empty).then_some(cond))
            }
        }
    }

    fn apply_distinct(&mut self, fields: &[FieldPath]) -> ApiResult<()> {
        if fields.is_empty() {
            return Err(ApiError::bad_request("'distinct' needs at least one field"));
        }
        self.select.clear_selects();
        self.projection.clear();
        for path in fields {
            let (alias, field) = self.resolve(path)?;
            let label = path.to_string();
            self.select.expr_as(
                Expr::col((Alias::new(&alias), Alias::new(&field.column))),
                Alias::new(&label),
            );
            self.projection.push(ProjectedColumn {
                label,
                kind: field.kind,
            });
        }
        self.select.distinct();
        self.distinct = true;
        Ok(())
    }

    /// Order by `path`. Under `DISTINCT` every ORDER BY expression must be
    /// selected: distinct queries may only order by their own fields, and
    /// to-one columns of a fanned-out query are selected after the
    /// projection, where row decoding never reads them.
    fn apply_order(&mut self, path: &FieldPath, direction: Direction) -> ApiResult<()> {
        if self.distinct {
            if !self.projection.iter().any(|c| c.label == path.to_string()) {
                return Err(ApiError::bad_request(format!(
                    "cannot order by '{path}': it is not one of the distinct fields"
                )));
            }
        } else {
            let hops = self.schema.walk(&self.entity.name, path.relations())?;
            if hops
                .iter()
                .any(|hop| hop.relation.cardinality == Cardinality::OneToMany)
            {
                return Err(ApiError::bad_request(format!(
                    "cannot order by '{path}' across a to-many relation"
                )));
            }
        }

        let (alias, field) = self.resolve(path)?;
        let column = (Alias::new(&alias), Alias::new(&field.column));
        if !self.distinct && !path.relations().is_empty() {
            self.order_columns += 1;
            self.select.expr_as(
                Expr::col(column.clone()),
                Alias::new(format!("order_{}", self.order_columns)),
            );
        }
        let order = match direction {
            Direction::Asc => Order::Asc,
            Direction::Desc => Order::Desc,
        };
        self.select.order_by(column, order);
        Ok(())
    }

    fn apply_include(&mut self, relations: &[RelationSpec]) -> ApiResult<()> {
        if self.includes.is_some() {
            return Err(ApiError::MultipleInclude);
        }
        if self.distinct {
            return Err(ApiError::bad_request(
                "'include' cannot be combined with 'distinct'",
            ));
        }
        for relation in relations {
            validate_include(self.schema, self.entity, relation)?;
        }
        self.includes = Some(relations.to_vec());
        Ok(())
    }
}

impl FilterTarget for RelationalQuery<'_> {
    fn apply_filter(&mut self, filter: &Filter) -> ApiResult<()> {
        match filter {
            Filter::Distinct(distinct) => self.apply_distinct(&distinct.fields),
            Filter::Where(condition) => {
                let predicate = self.predicate(condition)?;
                self.select.and_where(predicate);
                Ok(())
            }
            Filter::NestedWhere(node) => {
                if let Some(cond) = self.condition(node)? {
                    self.select.cond_where(cond);
                }
                Ok(())
            }
            Filter::Order(order) => self.apply_order(&order.field, order.direction),
            Filter::Skip(n) => {
                self.select.offset(*n);
                Ok(())
            }
            Filter::Limit(limit) => {
                self.select.limit(limit.count);
                if let Some(skip) = limit.skip {
                    self.select.offset(skip);
                }
                Ok(())
            }
            Filter::Include(include) => self.apply_include(&include.relations),
        }
    }
}

/// Check an include relation, its scope and everything nested below it.
fn validate_include(schema: &Schema, entity: &EntityDef, relation: &RelationSpec) -> ApiResult<()> {
    let def = entity.require_relation(&relation.name)?;
    let target = schema.entity(&def.target)?;
    for filter in relation.scope_filters() {
        if !matches!(
            filter,
            Filter::Where(_) | Filter::NestedWhere(_) | Filter::Order(_)
        ) {
            return Err(ApiError::bad_request(format!(
                "'{}' is not allowed inside an include scope",
                filter.kind()
            )));
        }
    }
    for nested in relation.nested() {
        validate_include(schema, target, nested)?;
    }
    Ok(())
}

/// `["investigation", "facility"]` -> `j_investigation_facility`.
fn join_alias(relations: &[String]) -> String {
    format!("j_{}", relations.join("_"))
}

/// Convert a JSON filter value into a SQL value for `field`.
fn sql_value(field: &FieldDef, value: &Value) -> ApiResult<sea_query::Value> {
    Ok(match value {
        Value::Bool(b) => (*b).into(),
        Value::Number(n) => match n.as_i64() {
            Some(i) => i.into(),
            None => n.as_f64().unwrap_or_default().into(),
        },
        Value::String(s) if field.kind == FieldKind::DateTime => match parse_datetime(s) {
            Some(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string().into(),
            None => s.clone().into(),
        },
        Value::String(s) => s.clone().into(),
        Value::Null => sea_query::Value::String(None),
        Value::Array(_) | Value::Object(_) => {
            return Err(ApiError::bad_request(format!(
                "'{}' cannot be compared with {value}",
                field.name
            )));
        }
    })
}

/// `%value%` with LIKE wildcards in the value escaped.
fn like_pattern(value: &Value, upper: bool) -> LikeExpr {
    let text = crate::filter::value_as_text(value);
    let pattern = format!("%{}%", escape_like_wildcards(&text));
    let pattern = if upper {
        pattern.to_uppercase()
    } else {
        pattern
    };
    LikeExpr::new(pattern).escape('\\')
}

/// Escape SQL LIKE wildcard characters in user input.
fn escape_like_wildcards(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}
