//! Datagate kernel library.
//!
//! A backend-agnostic filter language compiled into relational SQL, the
//! facility catalog's native object query and, through a field mapping, an
//! external search vocabulary. The `datagate` binary drives it from the
//! command line.

pub mod catalog;
pub mod config;
pub mod error;
pub mod filter;
pub mod relational;
pub mod schema;
pub mod search;
