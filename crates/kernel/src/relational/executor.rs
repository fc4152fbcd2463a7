//! Runs compiled relational queries and shapes rows into JSON.
//!
//! Rows come back flat; distinct projections are nested by their dotted
//! labels and includes are resolved with batched `IN` queries per
//! relation, recursing into nested includes. The child cap applies to each
//! parent's to-many list, never to the batched query.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use sqlx::{PgPool, Row, SqlitePool};

use super::Dialect;
use super::query_builder::{ProjectedColumn, compile_count_sql, compile_sql};
use crate::error::{ApiError, ApiResult};
use crate::filter::{FieldPath, Filter, FilterSet, Operator, RelationSpec, WhereFilter};
use crate::schema::{Cardinality, EntityDef, FieldKind, catalog};

/// Nested includes deeper than this are skipped.
const MAX_INCLUDE_DEPTH: u8 = 3;

/// Parent keys per batched `IN` query.
const INCLUDE_KEY_BATCH: usize = 500;

/// Runs SQL and decodes rows by the projection the compiler produced.
#[async_trait]
pub trait RowFetcher: Send + Sync {
    fn dialect(&self) -> Dialect;

    /// One JSON object per row, keyed by projection label.
    async fn fetch_rows(
        &self,
        sql: &str,
        projection: &[ProjectedColumn],
    ) -> ApiResult<Vec<Map<String, Value>>>;

    /// The single integer a count query returns.
    async fn fetch_count(&self, sql: &str) -> ApiResult<u64>;
}

macro_rules! decode_row {
    ($row:expr, $projection:expr) => {{
        let mut map = Map::with_capacity($projection.len());
        for (index, column) in $projection.iter().enumerate() {
            // Columns are decoded by the schema's kind rather than driver
            // metadata so SQLite's loose typing decodes the same as Postgres.
            let value = match column.kind {
                FieldKind::Integer => $row
                    .try_get_unchecked::<Option<i64>, _>(index)?
                    .map_or(Value::Null, |v| Value::Number(v.into())),
                FieldKind::Float => $row
                    .try_get_unchecked::<Option<f64>, _>(index)?
                    .and_then(serde_json::Number::from_f64)
                    .map_or(Value::Null, Value::Number),
                FieldKind::Boolean => $row
                    .try_get_unchecked::<Option<bool>, _>(index)?
                    .map_or(Value::Null, Value::Bool),
                FieldKind::DateTime => $row
                    .try_get_unchecked::<Option<chrono::NaiveDateTime>, _>(index)?
                    .map_or(Value::Null, |v| {
                        Value::String(v.format("%Y-%m-%dT%H:%M:%S").to_string())
                    }),
                FieldKind::Text => $row
                    .try_get_unchecked::<Option<String>, _>(index)?
                    .map_or(Value::Null, Value::String),
            };
            map.insert(column.label.clone(), value);
        }
        map
    }};
}

#[async_trait]
impl RowFetcher for PgPool {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    async fn fetch_rows(
        &self,
        sql: &str,
        projection: &[ProjectedColumn],
    ) -> ApiResult<Vec<Map<String, Value>>> {
        let rows = sqlx::query(sql).fetch_all(self).await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            out.push(decode_row!(row, projection));
        }
        Ok(out)
    }

    async fn fetch_count(&self, sql: &str) -> ApiResult<u64> {
        let count: i64 = sqlx::query_scalar(sql).fetch_one(self).await?;
        Ok(u64::try_from(count).unwrap_or_default())
    }
}

#[async_trait]
impl RowFetcher for SqlitePool {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    async fn fetch_rows(
        &self,
        sql: &str,
        projection: &[ProjectedColumn],
    ) -> ApiResult<Vec<Map<String, Value>>> {
        let rows = sqlx::query(sql).fetch_all(self).await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            out.push(decode_row!(row, projection));
        }
        Ok(out)
    }

    async fn fetch_count(&self, sql: &str) -> ApiResult<u64> {
        let count: i64 = sqlx::query_scalar(sql).fetch_one(self).await?;
        Ok(u64::try_from(count).unwrap_or_default())
    }
}

/// Read operations over the relational backend.
#[derive(Clone)]
pub struct RelationalService {
    fetcher: Arc<dyn RowFetcher>,
    include_child_limit: u64,
}

impl RelationalService {
    pub fn new(fetcher: Arc<dyn RowFetcher>, include_child_limit: u64) -> Self {
        Self {
            fetcher,
            include_child_limit,
        }
    }

    /// All matching records, with includes resolved.
    pub async fn get_with_filters(&self, entity: &str, filters: &FilterSet) -> ApiResult<Vec<Value>> {
        let compiled = compile_sql(entity, filters, self.fetcher.dialect())?;
        let rows = self
            .fetcher
            .fetch_rows(&compiled.sql, &compiled.projection)
            .await?;

        if compiled.distinct {
            return Ok(rows.into_iter().map(nest_dotted).collect());
        }

        let mut items: Vec<Value> = rows.into_iter().map(Value::Object).collect();
        if !compiled.includes.is_empty() {
            let def = catalog().entity(entity)?;
            self.execute_includes(&mut items, def, &compiled.includes, 0)
                .await?;
        }
        Ok(items)
    }

    /// The first matching record.
    pub async fn get_one_with_filters(&self, entity: &str, filters: &FilterSet) -> ApiResult<Value> {
        let mut limited = filters.clone();
        if !filters.filters().iter().any(|f| matches!(f, Filter::Limit(_))) {
            limited.add_filter(Filter::limit(1));
        }
        self.get_with_filters(entity, &limited)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| ApiError::MissingRecord(format!("{entity} matching the given filters")))
    }

    /// The record with primary key `id`.
    pub async fn get_with_id(&self, entity: &str, id: i64, filters: &FilterSet) -> ApiResult<Value> {
        let mut by_id = filters.clone();
        by_id.add_filter(Filter::Where(WhereFilter::new(
            FieldPath::parse("id")?,
            json!(id),
            Operator::Eq,
        )?));
        self.get_one_with_filters(entity, &by_id)
            .await
            .map_err(|e| match e {
                ApiError::MissingRecord(_) => {
                    ApiError::MissingRecord(format!("{entity} with id {id}"))
                }
                other => other,
            })
    }

    /// Number of records matching the `where` filters.
    pub async fn count_with_filters(&self, entity: &str, filters: &FilterSet) -> ApiResult<u64> {
        let sql = compile_count_sql(entity, filters, self.fetcher.dialect())?;
        self.fetcher.fetch_count(&sql).await
    }

    /// Load `includes` for `parents` with batched queries per relation and
    /// attach the results under the relation name.
    fn execute_includes<'a>(
        &'a self,
        parents: &'a mut [Value],
        entity: &'a EntityDef,
        includes: &'a [RelationSpec],
        depth: u8,
    ) -> Pin<Box<dyn Future<Output = ApiResult<()>> + Send + 'a>> {
        Box::pin(async move {
            if depth >= MAX_INCLUDE_DEPTH {
                tracing::warn!(
                    depth,
                    "include depth limit ({}) reached, skipping nested includes",
                    MAX_INCLUDE_DEPTH
                );
                return Ok(());
            }

            let child_limit = usize::try_from(self.include_child_limit).unwrap_or(usize::MAX);
            for include in includes {
                let relation = entity.require_relation(&include.name)?;
                let target = catalog().entity(&relation.target)?;
                let (parent_key, child_key) = match relation.cardinality {
                    Cardinality::ManyToOne => (relation.key.as_str(), target.primary_key()),
                    Cardinality::OneToMany => (entity.primary_key(), relation.key.as_str()),
                };

                let mut seen = HashSet::new();
                let keys: Vec<Value> = parents
                    .iter()
                    .filter_map(|p| p.get(parent_key))
                    .filter(|v| !v.is_null() && seen.insert(v.to_string()))
                    .cloned()
                    .collect();

                let mut children = Vec::new();
                for batch in keys.chunks(INCLUDE_KEY_BATCH) {
                    let mut child_filters: FilterSet = include.scope_filters().cloned().collect();
                    child_filters.add_filter(Filter::Where(WhereFilter::new(
                        FieldPath::parse(child_key)?,
                        Value::Array(batch.to_vec()),
                        Operator::In,
                    )?));

                    let compiled = compile_sql(&target.name, &child_filters, self.fetcher.dialect())?;
                    let rows = self
                        .fetcher
                        .fetch_rows(&compiled.sql, &compiled.projection)
                        .await?;
                    children.extend(rows.into_iter().map(Value::Object));
                }

                let nested: Vec<RelationSpec> = include.nested().cloned().collect();
                if !nested.is_empty() && !children.is_empty() {
                    self.execute_includes(&mut children, target, &nested, depth + 1)
                        .await?;
                }

                let mut by_key: HashMap<String, Vec<Value>> = HashMap::new();
                for child in children {
                    let Some(key) = child
                        .get(child_key)
                        .filter(|k| !k.is_null())
                        .map(Value::to_string)
                    else {
                        continue;
                    };
                    by_key.entry(key).or_default().push(child);
                }

                for parent in parents.iter_mut() {
                    let matching = parent
                        .get(parent_key)
                        .filter(|k| !k.is_null())
                        .and_then(|k| by_key.get(&k.to_string()));
                    let attached = match relation.cardinality {
                        Cardinality::ManyToOne => matching
                            .and_then(|m| m.first())
                            .cloned()
                            .unwrap_or(Value::Null),
                        Cardinality::OneToMany => {
                            let mut items = matching.cloned().unwrap_or_default();
                            if items.len() > child_limit {
                                tracing::warn!(
                                    include = %include.name,
                                    loaded = items.len(),
                                    limit = child_limit,
                                    "include children truncated for one record"
                                );
                                items.truncate(child_limit);
                            }
                            Value::Array(items)
                        }
                    };
                    if let Some(object) = parent.as_object_mut() {
                        object.insert(include.name.clone(), attached);
                    }
                }
            }
            Ok(())
        })
    }
}

/// `{"facility.id": 1, "title": "x"}` -> `{"facility": {"id": 1}, "title": "x"}`.
fn nest_dotted(flat: Map<String, Value>) -> Value {
    let mut root = Map::new();
    for (label, value) in flat {
        let segments: Vec<&str> = label.split('.').collect();
        insert_path(&mut root, &segments, value);
    }
    Value::Object(root)
}

fn insert_path(map: &mut Map<String, Value>, segments: &[&str], value: Value) {
    match segments {
        [] => {}
        [last] => {
            map.insert((*last).to_string(), value);
        }
        [first, rest @ ..] => {
            let entry = map
                .entry((*first).to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            if let Value::Object(child) = entry {
                insert_path(child, rest, value);
            }
        }
    }
}
