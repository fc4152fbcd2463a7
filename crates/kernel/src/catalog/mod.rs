//! Catalog backend: filters compiled to the remote catalog's object query.
//!
//! The catalog differs from SQL in three ways the compiler absorbs: a
//! single `(offset, count)` limit, order lists that replace rather than
//! append, and distinct expressed as an aggregate over selected attributes.

mod compiler;
mod query;
mod service;
mod session;

pub use compiler::{CatalogContext, OrderState, compile_catalog, compile_catalog_count};
pub use query::{
    Aggregate, AggregateFunction, Attribute, BASE_ALIAS, CatalogQuery, Fragment, JoinAliases,
    literal,
};
pub use service::{CatalogService, project_distinct};
pub use session::{CatalogSession, RestCatalogSession, unwrap_entity};
