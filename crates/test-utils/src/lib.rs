//! Datagate test utilities.
//!
//! Helpers for integration testing: a seeded SQLite fixture database, a
//! catalog session that records queries and replays canned results, and
//! assertion helpers for compiled query text.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;

use datagate_kernel::catalog::CatalogSession;
use datagate_kernel::error::{ApiError, ApiResult};
use datagate_kernel::relational::Dialect;
use datagate_kernel::schema::{catalog, ddl};
use datagate_kernel::search::{MappingLoadError, MappingTable};

const SEED: &[&str] = &[
    "INSERT INTO facility (id, name, full_name, create_time) VALUES
        (1, 'ISIS', 'ISIS Neutron and Muon Source', '2020-01-01 00:00:00')",
    "INSERT INTO instrument (id, name, full_name, pid, facility_id) VALUES
        (1, 'SANS2D', 'Small Angle Diffractometer', 'pid:inst:1', 1)",
    "INSERT INTO investigation (id, name, title, summary, doi, start_date, create_time, facility_id) VALUES
        (1, 'INV-1', 'Beam study', 'Flux measurements', '10.5286/inv.1', '2021-03-04 09:00:00', '2021-03-01 00:00:00', 1),
        (2, 'INV-2', 'Calibration', 'Detector calibration runs', '10.5286/inv.2', '2021-06-10 09:00:00', '2021-06-01 00:00:00', 1),
        (3, 'INV-3', 'Survey', NULL, '10.5286/inv.3', NULL, '2022-01-01 00:00:00', 1)",
    "INSERT INTO dataset (id, name, description, doi, complete, create_time, investigation_id) VALUES
        (1, 'Dataset 1', 'first run', '10.5286/ds.1', 1, '2021-03-04 10:00:00', 1),
        (2, 'Dataset 2', 'second run', '10.5286/ds.2', 0, '2021-03-05 10:00:00', 1),
        (3, 'Dataset 3', NULL, '10.5286/ds.3', 1, '2021-06-11 10:00:00', 2)",
    "INSERT INTO datafile (id, name, location, file_size, create_time, dataset_id) VALUES
        (1, 'a.nxs', '/data/a.nxs', 100, '2021-03-04 10:05:00', 1),
        (2, 'b.nxs', '/data/b.nxs', 200, '2021-03-04 10:06:00', 1),
        (3, 'c.nxs', '/data/c.nxs', 300, '2021-03-05 10:05:00', 2)",
    "INSERT INTO dataset_instrument (id, dataset_id, instrument_id) VALUES (1, 1, 1), (2, 3, 1)",
];

/// In-memory SQLite database with the catalog schema and a small data set:
/// one facility, three investigations (the third without datasets), three
/// datasets named `Dataset 1` to `Dataset 3` and three datafiles.
pub async fn fixture_pool() -> Result<SqlitePool, sqlx::Error> {
    // One connection: every connection to `sqlite::memory:` is its own database.
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;

    for statement in ddl::create_all(catalog(), Dialect::Sqlite) {
        sqlx::query(&statement).execute(&pool).await?;
    }
    for statement in SEED {
        sqlx::query(statement).execute(&pool).await?;
    }
    Ok(pool)
}

/// The bundled search mapping.
pub fn bundled_mapping() -> Result<Arc<MappingTable>, MappingLoadError> {
    MappingTable::bundled().map(Arc::new)
}

/// A catalog session that records every query and answers from a queue of
/// canned responses. An empty queue answers with no results.
#[derive(Debug, Default)]
pub struct RecordingSession {
    responses: Mutex<VecDeque<Result<Vec<Value>, String>>>,
    queries: Mutex<Vec<String>>,
}

impl RecordingSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue results for the next unanswered query.
    pub fn with_response(self, results: Vec<Value>) -> Self {
        self.responses.lock().push_back(Ok(results));
        self
    }

    /// Queue a catalog failure for the next unanswered query.
    pub fn with_failure(self, message: &str) -> Self {
        self.responses.lock().push_back(Err(message.to_string()));
        self
    }

    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().clone()
    }

    pub fn last_query(&self) -> Option<String> {
        self.queries.lock().last().cloned()
    }
}

#[async_trait]
impl CatalogSession for RecordingSession {
    async fn search(&self, query: &str) -> ApiResult<Vec<Value>> {
        self.queries.lock().push(query.to_string());
        match self.responses.lock().pop_front() {
            Some(Ok(results)) => Ok(results),
            Some(Err(message)) => Err(ApiError::Catalog(message)),
            None => Ok(Vec::new()),
        }
    }
}

/// Assertion helpers for compiled queries.
pub mod assert {
    /// Assert that a string contains a substring.
    pub fn contains(haystack: &str, needle: &str) {
        assert!(
            haystack.contains(needle),
            "Expected query to contain '{needle}'\nActual: {haystack}"
        );
    }

    /// Assert that a string does not contain a substring.
    pub fn not_contains(haystack: &str, needle: &str) {
        assert!(
            !haystack.contains(needle),
            "Expected query to NOT contain '{needle}'\nActual: {haystack}"
        );
    }

    /// Assert that `needles` appear in `haystack` in the given order.
    pub fn in_order(haystack: &str, needles: &[&str]) {
        let mut from = 0;
        for needle in needles {
            match haystack[from..].find(needle) {
                Some(at) => from += at + needle.len(),
                None => panic!("Expected '{needle}' after position {from}\nActual: {haystack}"),
            }
        }
    }
}
