//! Backend-agnostic request filters.
//!
//! Filters arrive as small JSON documents, are parsed into the closed
//! [`Filter`] enum and applied to a backend context in fixed precedence
//! order through [`FilterSet::apply`].

mod boolean;
mod handler;
mod parse;
mod types;
mod value;

pub use boolean::{BooleanNode, BooleanOperator};
pub use handler::{FilterSet, FilterTarget};
pub use parse::{parse_filter, parse_filter_document, parse_filters};
pub use types::{
    Direction, DistinctFilter, FieldPath, Filter, IncludeFilter, LimitFilter, Operator,
    OrderFilter, RelationSpec, Scope, WhereFilter, WhereLeaf, between_bounds, list_values,
};
pub use value::{ValueType, parse_datetime, value_as_text};
