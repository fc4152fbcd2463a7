//! Search surface: an external entity vocabulary served from the catalog
//! through a declarative field mapping.

mod compiler;
mod mapping;
mod projection;
mod service;

pub use compiler::{SearchContext, compile_search, compile_search_count};
pub use mapping::{
    EntityMapping, MappingEntry, MappingLoadError, MappingTable, Resolved, ResolvedPath,
};
pub use projection::project;
pub use service::SearchService;
