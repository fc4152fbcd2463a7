//! Relational backend: filters compiled to SQL against the catalog schema.

mod executor;
mod query_builder;

use std::fmt;
use std::str::FromStr;

use sea_query::{PostgresQueryBuilder, SelectStatement, SqliteQueryBuilder, TableCreateStatement};

pub use executor::{RelationalService, RowFetcher};
pub use query_builder::{
    CompiledSql, ProjectedColumn, RelationalQuery, compile_count_sql, compile_sql,
};

/// SQL dialect a compiled query is rendered for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Dialect {
    #[default]
    Postgres,
    Sqlite,
}

impl Dialect {
    pub fn render(self, query: &SelectStatement) -> String {
        match self {
            Dialect::Postgres => query.to_string(PostgresQueryBuilder),
            Dialect::Sqlite => query.to_string(SqliteQueryBuilder),
        }
    }

    pub fn render_table(self, table: &TableCreateStatement) -> String {
        match self {
            Dialect::Postgres => table.to_string(PostgresQueryBuilder),
            Dialect::Sqlite => table.to_string(SqliteQueryBuilder),
        }
    }

    /// Infix operator for regular-expression matches.
    pub fn regexp_operator(self) -> &'static str {
        match self {
            Dialect::Postgres => "~",
            Dialect::Sqlite => "REGEXP",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Dialect::Postgres => "postgres",
            Dialect::Sqlite => "sqlite",
        }
    }
}

impl FromStr for Dialect {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" | "pg" => Ok(Dialect::Postgres),
            "sqlite" => Ok(Dialect::Sqlite),
            other => Err(format!("unknown SQL dialect '{other}'")),
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
