//! Table DDL for the catalog schema, used to build fixture databases.

use sea_query::{Alias, ColumnDef, Table, TableCreateStatement};

use super::{EntityDef, FieldKind, Schema};
use crate::relational::Dialect;

/// `CREATE TABLE` for one entity. Foreign keys are plain integer columns.
pub fn create_table(entity: &EntityDef) -> TableCreateStatement {
    let mut table = Table::create();
    table.table(Alias::new(&entity.table)).if_not_exists();
    for field in &entity.fields {
        let mut column = ColumnDef::new(Alias::new(&field.column));
        match field.kind {
            FieldKind::Integer => column.big_integer(),
            FieldKind::Float => column.double(),
            FieldKind::Text => column.text(),
            FieldKind::DateTime => column.timestamp(),
            FieldKind::Boolean => column.boolean(),
        };
        if field.name == entity.primary_key() {
            column.not_null().primary_key();
        }
        table.col(&mut column);
    }
    table
}

/// DDL statements for every entity, rendered for `dialect`.
pub fn create_all(schema: &Schema, dialect: Dialect) -> Vec<String> {
    schema
        .entities()
        .map(|entity| dialect.render_table(&create_table(entity)))
        .collect()
}
