//! Search service: compiles search filters, queries the catalog and projects results.

use std::sync::Arc;

use serde_json::Value;

use super::compiler::{compile_search, compile_search_count};
use super::mapping::MappingTable;
use super::projection::project;
use crate::catalog::CatalogSession;
use crate::error::{ApiError, ApiResult};
use crate::filter::{FieldPath, Filter, FilterSet, Operator, WhereFilter};

/// Search-vocabulary reads served from the catalog.
#[derive(Clone)]
pub struct SearchService {
    session: Arc<dyn CatalogSession>,
    mapping: Arc<MappingTable>,
    max_entities: u64,
}

impl SearchService {
    pub fn new(session: Arc<dyn CatalogSession>, mapping: Arc<MappingTable>, max_entities: u64) -> Self {
        Self {
            session,
            mapping,
            max_entities,
        }
    }

    pub fn mapping(&self) -> &MappingTable {
        &self.mapping
    }

    pub async fn search(&self, entity: &str, filters: &FilterSet) -> ApiResult<Vec<Value>> {
        let query = compile_search(entity, filters, &self.mapping, self.max_entities)?;
        let results = self.session.search(&query.to_string()).await?;
        tracing::debug!(entity, results = results.len(), "search results");
        results
            .iter()
            .map(|native| project(&self.mapping, entity, native).map_err(ApiError::from))
            .collect()
    }

    pub async fn count(&self, entity: &str, filters: &FilterSet) -> ApiResult<u64> {
        let query = compile_search_count(entity, filters, &self.mapping, self.max_entities)?;
        let results = self.session.search(&query.to_string()).await?;
        results
            .first()
            .and_then(Value::as_u64)
            .ok_or_else(|| ApiError::Catalog(format!("count for {entity} returned no number")))
    }

    pub async fn get_by_pid(&self, entity: &str, pid: &str, filters: &FilterSet) -> ApiResult<Value> {
        let mut by_pid = filters.clone();
        by_pid.add_filter(Filter::Where(WhereFilter::new(
            FieldPath::parse("pid")?,
            Value::String(pid.to_string()),
            Operator::Eq,
        )?));
        by_pid.add_filter(Filter::limit(1));

        self.search(entity, &by_pid)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| ApiError::MissingRecord(format!("{entity} with pid {pid}")))
    }
}
