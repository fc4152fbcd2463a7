//! Read operations over the catalog backend.

use std::sync::Arc;

use serde_json::{Map, Value, json};

use super::compiler::{compile_catalog, compile_catalog_count};
use super::session::CatalogSession;
use crate::error::{ApiError, ApiResult};
use crate::filter::{FieldPath, Filter, FilterSet, Operator, WhereFilter};

#[derive(Clone)]
pub struct CatalogService {
    session: Arc<dyn CatalogSession>,
    max_entities: u64,
}

impl CatalogService {
    pub fn new(session: Arc<dyn CatalogSession>, max_entities: u64) -> Self {
        Self {
            session,
            max_entities,
        }
    }

    pub fn max_entities(&self) -> u64 {
        self.max_entities
    }

    pub async fn get_with_filters(&self, entity: &str, filters: &FilterSet) -> ApiResult<Vec<Value>> {
        let query = compile_catalog(entity, filters, self.max_entities)?;
        let results = self.session.search(&query.to_string()).await?;

        let distinct = query.distinct_fields();
        if distinct.is_empty() {
            Ok(results)
        } else {
            Ok(project_distinct(results, &distinct))
        }
    }

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

    pub async fn count_with_filters(&self, entity: &str, filters: &FilterSet) -> ApiResult<u64> {
        let query = compile_catalog_count(entity, filters, self.max_entities)?;
        let results = self.session.search(&query.to_string()).await?;
        results
            .first()
            .and_then(Value::as_u64)
            .ok_or_else(|| ApiError::Catalog(format!("count for {entity} returned no number")))
    }
}

/// Shape distinct results as objects keyed by the requested fields.
///
/// One field comes back as a list of scalars, several as a list of tuples.
/// Dotted labels nest, so `facility.id` becomes `{"facility": {"id": ..}}`.
pub fn project_distinct(results: Vec<Value>, fields: &[String]) -> Vec<Value> {
    results
        .into_iter()
        .map(|row| {
            let values = match row {
                Value::Array(items) if fields.len() > 1 => items,
                other => vec![other],
            };
            let mut object = Map::new();
            for (field, value) in fields.iter().zip(values) {
                let segments: Vec<&str> = field.split('.').collect();
                insert_nested(&mut object, &segments, value);
            }
            Value::Object(object)
        })
        .collect()
}

fn insert_nested(object: &mut Map<String, Value>, segments: &[&str], value: Value) {
    match segments {
        [] => {}
        [last] => {
            object.insert((*last).to_string(), value);
        }
        [first, rest @ ..] => {
            let entry = object
                .entry((*first).to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(child) = entry {
                insert_nested(child, rest, value);
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn single_field_scalars() {
        let projected = project_distinct(vec![json!("a"), json!("b")], &["title".to_string()]);
        assert_eq!(projected, [json!({"title": "a"}), json!({"title": "b"})]);
    }

    #[test]
    fn tuples_nest_dotted_fields() {
        let fields = ["title".to_string(), "facility.id".to_string()];
        let projected = project_distinct(vec![json!(["a", 1]), json!(["b", 2])], &fields);
        assert_eq!(
            projected,
            [
                json!({"title": "a", "facility": {"id": 1}}),
                json!({"title": "b", "facility": {"id": 2}})
            ]
        );
    }
}
