//! Query handles for the remote catalog.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{ApiError, ApiResult};

/// An authenticated handle able to run native catalog queries.
#[async_trait]
pub trait CatalogSession: Send + Sync {
    /// Run `query` and return its results. Entity results are returned as
    /// plain objects; aggregate results as scalars or tuples.
    async fn search(&self, query: &str) -> ApiResult<Vec<Value>>;
}

/// Catalog session over the catalog's REST entity manager.
#[derive(Clone)]
pub struct RestCatalogSession {
    client: reqwest::Client,
    base_url: String,
    session_id: String,
}

impl RestCatalogSession {
    pub fn new(base_url: impl Into<String>, session_id: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .unwrap_or_default();

        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            session_id: session_id.into(),
        }
    }
}

#[async_trait]
impl CatalogSession for RestCatalogSession {
    async fn search(&self, query: &str) -> ApiResult<Vec<Value>> {
        tracing::debug!(query, "catalog search");
        let response = self
            .client
            .get(format!("{}/entityManager", self.base_url))
            .query(&[("sessionId", self.session_id.as_str()), ("query", query)])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body: Value = response.json().await.unwrap_or_default();
            let message = body
                .get("message")
                .and_then(Value::as_str)
                .map_or_else(|| format!("catalog returned {status}"), str::to_string);
            tracing::warn!(%status, %message, "catalog search failed");
            return Err(ApiError::Catalog(message));
        }

        let results: Vec<Value> = response.json().await?;
        Ok(results.into_iter().map(unwrap_entity).collect())
    }
}

/// The catalog wraps each entity as `{"Investigation": {...}}`; return the
/// inner object. Anything else is returned unchanged.
pub fn unwrap_entity(value: Value) -> Value {
    match value {
        Value::Object(mut map) if map.len() == 1 => {
            let is_wrapper = map
                .values()
                .next()
                .is_some_and(Value::is_object);
            let key = map.keys().next().cloned();
            match key {
                Some(key) if is_wrapper && key.starts_with(char::is_uppercase) => {
                    map.remove(&key).unwrap_or(Value::Null)
                }
                _ => Value::Object(map),
            }
        }
        other => other,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unwraps_entity_objects() {
        assert_eq!(
            unwrap_entity(json!({"Investigation": {"id": 1}})),
            json!({"id": 1})
        );
        assert_eq!(unwrap_entity(json!({"id": 1})), json!({"id": 1}));
        assert_eq!(unwrap_entity(json!({"facility": {"id": 1}})), json!({"facility": {"id": 1}}));
        assert_eq!(unwrap_entity(json!(3)), json!(3));
        assert_eq!(unwrap_entity(json!(["a", 1])), json!(["a", 1]));
    }

    #[test]
    fn base_url_trailing_slash_trimmed() {
        let session = RestCatalogSession::new("https://catalog.example/icat/", "abc");
        assert_eq!(session.base_url, "https://catalog.example/icat");
    }
}
