//! Filter, compilation and execution error types.

use thiserror::Error;

/// Problems with what a filter refers to: fields, operators, nesting and
/// mappings. Always a client input problem.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FilterError {
    #[error("unknown entity: {0}")]
    UnknownEntity(String),

    #[error("unknown field '{field}' on {entity}")]
    UnknownField { entity: String, field: String },

    #[error("invalid field reference: '{0}'")]
    InvalidField(String),

    #[error("field '{0}' crosses more than two relations")]
    TooManyHops(String),

    #[error("unsupported operator: {0}")]
    InvalidOperator(String),

    #[error("invalid boolean nesting: {0}")]
    InvalidNesting(String),

    #[error("no mapping for '{field}' on {entity}")]
    UnresolvedMapping { entity: String, field: String },

    #[error("{0}")]
    Unsupported(String),
}

impl FilterError {
    pub(crate) fn unknown_field(entity: &str, field: &str) -> Self {
        Self::UnknownField {
            entity: entity.to_string(),
            field: field.to_string(),
        }
    }

    pub(crate) fn unresolved(entity: &str, field: &str) -> Self {
        Self::UnresolvedMapping {
            entity: entity.to_string(),
            field: field.to_string(),
        }
    }
}

/// Errors surfaced to whoever asked for a query to be compiled or run.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("filter error: {0}")]
    Filter(#[from] FilterError),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("only one include filter may be given per request")]
    MultipleInclude,

    #[error("no record found: {0}")]
    MissingRecord(String),

    #[error("database error")]
    Database(#[from] sqlx::Error),

    #[error("catalog error: {0}")]
    Catalog(String),

    #[error("catalog transport error")]
    CatalogTransport(#[from] reqwest::Error),
}

impl ApiError {
    pub(crate) fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    /// HTTP status a transport layer should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            ApiError::Filter(_) | ApiError::BadRequest(_) | ApiError::MultipleInclude => 400,
            ApiError::MissingRecord(_) => 404,
            ApiError::Database(e) => {
                tracing::error!(error = %e, "database error");
                500
            }
            ApiError::Catalog(_) | ApiError::CatalogTransport(_) => 502,
        }
    }
}

/// Result type alias using ApiError.
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn client_errors_map_to_400() {
        let err: ApiError = FilterError::InvalidOperator("approx".to_string()).into();
        assert_eq!(err.status_code(), 400);
        assert_eq!(ApiError::MultipleInclude.status_code(), 400);
        assert_eq!(ApiError::bad_request("x").status_code(), 400);
    }

    #[test]
    fn missing_record_is_404() {
        let err = ApiError::MissingRecord("Investigation with id 7".to_string());
        assert_eq!(err.status_code(), 404);
        assert_eq!(err.to_string(), "no record found: Investigation with id 7");
    }
}
