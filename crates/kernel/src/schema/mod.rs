//! The facility catalog's normalized entity schema.
//!
//! Both compilers validate field references against this schema: the
//! relational compiler to find tables, columns and join keys, the catalog
//! compiler to check relation paths before aliasing them.

pub mod ddl;

use std::collections::BTreeMap;
use std::sync::OnceLock;

use crate::error::FilterError;
use crate::filter::FieldPath;

/// Storage kind of a field; drives row decoding and literal rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Integer,
    Float,
    Text,
    DateTime,
    Boolean,
}

impl FieldKind {
    pub fn is_numeric(self) -> bool {
        matches!(self, FieldKind::Integer | FieldKind::Float)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDef {
    /// Name used in filters, e.g. `fileSize`.
    pub name: String,
    /// Column in the relational table, e.g. `file_size`.
    pub column: String,
    pub kind: FieldKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cardinality {
    ManyToOne,
    OneToMany,
}

/// A navigable relation.
///
/// For `ManyToOne` the key is the foreign-key field on the owning entity;
/// for `OneToMany` it is the foreign-key field on the target pointing back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationDef {
    pub name: String,
    pub target: String,
    pub cardinality: Cardinality,
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityDef {
    pub name: String,
    pub table: String,
    pub fields: Vec<FieldDef>,
    pub relations: Vec<RelationDef>,
}

impl EntityDef {
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn relation(&self, name: &str) -> Option<&RelationDef> {
        self.relations.iter().find(|r| r.name == name)
    }

    pub fn require_field(&self, name: &str) -> Result<&FieldDef, FilterError> {
        self.field(name)
            .ok_or_else(|| FilterError::unknown_field(&self.name, name))
    }

    pub fn require_relation(&self, name: &str) -> Result<&RelationDef, FilterError> {
        self.relation(name)
            .ok_or_else(|| FilterError::unknown_field(&self.name, name))
    }

    /// Every entity is keyed by an integer `id`.
    pub fn primary_key(&self) -> &str {
        "id"
    }
}

/// One relation hop resolved against the schema.
#[derive(Debug, Clone, Copy)]
pub struct Hop<'a> {
    pub relation: &'a RelationDef,
    pub from: &'a EntityDef,
    pub to: &'a EntityDef,
}

#[derive(Debug, Clone, Default)]
pub struct Schema {
    entities: BTreeMap<String, EntityDef>,
}

impl Schema {
    pub fn entity(&self, name: &str) -> Result<&EntityDef, FilterError> {
        self.entities
            .get(name)
            .ok_or_else(|| FilterError::UnknownEntity(name.to_string()))
    }

    pub fn entities(&self) -> impl Iterator<Item = &EntityDef> {
        self.entities.values()
    }

    /// Follow `relations` from `entity`, returning each hop in order.
    pub fn walk<'a>(
        &'a self,
        entity: &str,
        relations: &[String],
    ) -> Result<Vec<Hop<'a>>, FilterError> {
        let mut current = self.entity(entity)?;
        let mut hops = Vec::with_capacity(relations.len());
        for name in relations {
            let relation = current.require_relation(name)?;
            let target = self.entity(&relation.target)?;
            hops.push(Hop {
                relation,
                from: current,
                to: target,
            });
            current = target;
        }
        Ok(hops)
    }

    /// The entity a relation path ends on.
    pub fn target_of<'a>(
        &'a self,
        entity: &str,
        relations: &[String],
    ) -> Result<&'a EntityDef, FilterError> {
        match self.walk(entity, relations)?.last() {
            Some(hop) => Ok(hop.to),
            None => self.entity(entity),
        }
    }

    /// Resolve a dotted field path to its owning entity and field.
    pub fn resolve_field<'a>(
        &'a self,
        entity: &str,
        path: &FieldPath,
    ) -> Result<(&'a EntityDef, &'a FieldDef), FilterError> {
        let owner = self.target_of(entity, path.relations())?;
        Ok((owner, owner.require_field(path.field())?))
    }

    fn insert(&mut self, entity: EntityDef) {
        self.entities.insert(entity.name.clone(), entity);
    }
}

/// The facility catalog schema shared by every backend.
pub fn catalog() -> &'static Schema {
    static SCHEMA: OnceLock<Schema> = OnceLock::new();
    SCHEMA.get_or_init(build_catalog)
}

/// `fileSize` -> `file_size`.
pub(crate) fn snake_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for c in name.chars() {
        if c.is_ascii_uppercase() {
            if !out.is_empty() {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

struct EntityBuilder {
    entity: EntityDef,
}

impl EntityBuilder {
    fn new(name: &str) -> Self {
        let mut table = snake_case(name);
        // `user` is reserved in Postgres.
        if table == "user" {
            table.push('_');
        }
        Self {
            entity: EntityDef {
                name: name.to_string(),
                table,
                fields: Vec::new(),
                relations: Vec::new(),
            },
        }
        .field("id", FieldKind::Integer)
    }

    fn field(mut self, name: &str, kind: FieldKind) -> Self {
        self.entity.fields.push(FieldDef {
            name: name.to_string(),
            column: snake_case(name),
            kind,
        });
        self
    }

    fn text(self, names: &[&str]) -> Self {
        names
            .iter()
            .fold(self, |b, name| b.field(name, FieldKind::Text))
    }

    fn dates(self, names: &[&str]) -> Self {
        names
            .iter()
            .fold(self, |b, name| b.field(name, FieldKind::DateTime))
    }

    /// Many-to-one relation through a new `<name>Id` foreign key field.
    fn belongs_to(self, name: &str, target: &str) -> Self {
        let key = format!("{name}Id");
        let mut builder = self.field(&key, FieldKind::Integer);
        builder.entity.relations.push(RelationDef {
            name: name.to_string(),
            target: target.to_string(),
            cardinality: Cardinality::ManyToOne,
            key,
        });
        builder
    }

    /// One-to-many relation; `key` is the foreign key field on `target`.
    fn has_many(mut self, name: &str, target: &str, key: &str) -> Self {
        self.entity.relations.push(RelationDef {
            name: name.to_string(),
            target: target.to_string(),
            cardinality: Cardinality::OneToMany,
            key: key.to_string(),
        });
        self
    }

    fn build(self) -> EntityDef {
        self.entity
    }
}

fn build_catalog() -> Schema {
    use FieldKind::*;

    let mut schema = Schema::default();

    schema.insert(
        EntityBuilder::new("Facility")
            .text(&["name", "fullName", "description", "url"])
            .dates(&["createTime"])
            .has_many("investigations", "Investigation", "facilityId")
            .has_many("instruments", "Instrument", "facilityId")
            .has_many("parameterTypes", "ParameterType", "facilityId")
            .build(),
    );
    schema.insert(
        EntityBuilder::new("Instrument")
            .text(&["name", "fullName", "description", "type", "pid"])
            .belongs_to("facility", "Facility")
            .has_many("investigationInstruments", "InvestigationInstrument", "instrumentId")
            .has_many("datasetInstruments", "DatasetInstrument", "instrumentId")
            .build(),
    );
    schema.insert(
        EntityBuilder::new("Investigation")
            .text(&["name", "title", "summary", "doi", "visitId"])
            .dates(&["startDate", "endDate", "releaseDate", "createTime"])
            .belongs_to("facility", "Facility")
            .has_many("datasets", "Dataset", "investigationId")
            .has_many("investigationInstruments", "InvestigationInstrument", "investigationId")
            .has_many("investigationUsers", "InvestigationUser", "investigationId")
            .has_many("keywords", "Keyword", "investigationId")
            .has_many("samples", "Sample", "investigationId")
            .has_many("parameters", "InvestigationParameter", "investigationId")
            .build(),
    );
    schema.insert(
        EntityBuilder::new("InvestigationInstrument")
            .belongs_to("investigation", "Investigation")
            .belongs_to("instrument", "Instrument")
            .build(),
    );
    schema.insert(
        EntityBuilder::new("InvestigationUser")
            .text(&["role"])
            .belongs_to("investigation", "Investigation")
            .belongs_to("user", "User")
            .build(),
    );
    schema.insert(
        EntityBuilder::new("User")
            .text(&["name", "fullName", "email", "orcidId", "affiliation"])
            .has_many("investigationUsers", "InvestigationUser", "userId")
            .build(),
    );
    schema.insert(
        EntityBuilder::new("Keyword")
            .text(&["name"])
            .belongs_to("investigation", "Investigation")
            .build(),
    );
    schema.insert(
        EntityBuilder::new("Sample")
            .text(&["name", "pid", "description"])
            .belongs_to("investigation", "Investigation")
            .has_many("datasets", "Dataset", "sampleId")
            .build(),
    );
    schema.insert(
        EntityBuilder::new("Dataset")
            .text(&["name", "description", "doi", "location"])
            .field("complete", Boolean)
            .dates(&["startDate", "endDate", "createTime"])
            .belongs_to("investigation", "Investigation")
            .belongs_to("sample", "Sample")
            .has_many("datafiles", "Datafile", "datasetId")
            .has_many("datasetInstruments", "DatasetInstrument", "datasetId")
            .has_many("datasetTechniques", "DatasetTechnique", "datasetId")
            .has_many("parameters", "DatasetParameter", "datasetId")
            .build(),
    );
    schema.insert(
        EntityBuilder::new("DatasetInstrument")
            .belongs_to("dataset", "Dataset")
            .belongs_to("instrument", "Instrument")
            .build(),
    );
    schema.insert(
        EntityBuilder::new("DatasetTechnique")
            .belongs_to("dataset", "Dataset")
            .belongs_to("technique", "Technique")
            .build(),
    );
    schema.insert(
        EntityBuilder::new("Technique")
            .text(&["name", "pid", "description"])
            .has_many("datasetTechniques", "DatasetTechnique", "techniqueId")
            .build(),
    );
    schema.insert(
        EntityBuilder::new("Datafile")
            .text(&["name", "location", "checksum"])
            .field("fileSize", Integer)
            .dates(&["createTime"])
            .belongs_to("dataset", "Dataset")
            .build(),
    );
    schema.insert(
        EntityBuilder::new("ParameterType")
            .text(&["name", "units", "valueType"])
            .belongs_to("facility", "Facility")
            .build(),
    );
    schema.insert(
        EntityBuilder::new("DatasetParameter")
            .field("numericValue", Float)
            .text(&["stringValue"])
            .dates(&["dateTimeValue"])
            .field("error", Float)
            .belongs_to("dataset", "Dataset")
            .belongs_to("type", "ParameterType")
            .build(),
    );
    schema.insert(
        EntityBuilder::new("InvestigationParameter")
            .field("numericValue", Float)
            .text(&["stringValue"])
            .dates(&["dateTimeValue"])
            .field("error", Float)
            .belongs_to("investigation", "Investigation")
            .belongs_to("type", "ParameterType")
            .build(),
    );

    schema
}
