//! Declarative mapping from the search vocabulary onto the catalog schema.
//!
//! Each search entity names the native entity it is stored as, the native
//! fields free-text search covers, and one entry per search field:
//!
//! ```json
//! "title": "name"                                        // scalar
//! "facility": "facility.name"                            // scalar across a relation
//! "value": ["numericValue", "stringValue", "dateTimeValue"]  // polymorphic
//! "files": {"File": "datafiles"}                         // relation
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::error::FilterError;
use crate::filter::{FieldPath, ValueType};
use crate::schema::{Schema, catalog};

/// Problems found while loading a mapping table. Always fatal at startup.
#[derive(Debug, Error)]
pub enum MappingLoadError {
    #[error("failed to read mapping file {path}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed mapping document")]
    Parse(#[from] serde_json::Error),

    #[error("{entity}: native entity '{native}' is not in the catalog schema")]
    UnknownNativeEntity { entity: String, native: String },

    #[error("{entity}.{field}: relation target '{target}' is not a mapped entity")]
    UnknownTarget {
        entity: String,
        field: String,
        target: String,
    },

    #[error("{entity}.{field}: {reason}")]
    Malformed {
        entity: String,
        field: String,
        reason: String,
    },

    #[error("{entity}.{field}: native path '{path}' does not resolve")]
    UnresolvablePath {
        entity: String,
        field: String,
        path: String,
        #[source]
        source: FilterError,
    },
}

/// How one search field is stored natively.
#[derive(Debug, Clone, PartialEq)]
pub enum MappingEntry {
    Scalar(FieldPath),
    /// Another search entity, reached through `native_path` relations.
    Relation { entity: String, native_path: FieldPath },
    /// One logical field stored in a different column per value type.
    Polymorphic {
        numeric: FieldPath,
        string: FieldPath,
        datetime: FieldPath,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct EntityMapping {
    pub native_entity: String,
    pub text_fields: Vec<FieldPath>,
    pub fields: BTreeMap<String, MappingEntry>,
}

/// Result of resolving one search field.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Resolved<'m> {
    Field {
        native: &'m FieldPath,
        polymorphic: bool,
    },
    Relation {
        entity: &'m str,
        native_path: &'m FieldPath,
    },
}

/// A dotted search path resolved all the way to a native field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPath {
    pub native: FieldPath,
    /// The final field was chosen by value type.
    pub polymorphic: bool,
}

#[derive(Deserialize)]
struct RawTable {
    entities: BTreeMap<String, RawEntity>,
}

#[derive(Deserialize)]
struct RawEntity {
    native_entity: String,
    #[serde(default)]
    text_fields: Vec<String>,
    fields: BTreeMap<String, RawEntry>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawEntry {
    Scalar(String),
    Polymorphic(Vec<String>),
    Relation(BTreeMap<String, String>),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MappingTable {
    entities: BTreeMap<String, EntityMapping>,
}

impl MappingTable {
    /// The mapping shipped with the crate.
    pub fn bundled() -> Result<Self, MappingLoadError> {
        Self::from_json(include_str!("../../assets/search_mapping.json"))
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, MappingLoadError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| MappingLoadError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, MappingLoadError> {
        let table: RawTable = serde_json::from_str(raw)?;
        Self::validate(table, catalog())
    }

    fn validate(raw: RawTable, schema: &Schema) -> Result<Self, MappingLoadError> {
        let mut entities = BTreeMap::new();

        for (name, entity) in &raw.entities {
            if schema.entity(&entity.native_entity).is_err() {
                return Err(MappingLoadError::UnknownNativeEntity {
                    entity: name.clone(),
                    native: entity.native_entity.clone(),
                });
            }

            let check_field = |field: &str, path: &str| -> Result<FieldPath, MappingLoadError> {
                let unresolvable = |source| MappingLoadError::UnresolvablePath {
                    entity: name.clone(),
                    field: field.to_string(),
                    path: path.to_string(),
                    source,
                };
                let parsed = FieldPath::parse(path).map_err(unresolvable)?;
                schema
                    .resolve_field(&entity.native_entity, &parsed)
                    .map_err(unresolvable)?;
                Ok(parsed)
            };

            let text_fields = entity
                .text_fields
                .iter()
                .map(|path| check_field("text_fields", path))
                .collect::<Result<Vec<_>, _>>()?;

            let mut fields = BTreeMap::new();
            for (field, entry) in &entity.fields {
                let malformed = |reason: &str| MappingLoadError::Malformed {
                    entity: name.clone(),
                    field: field.clone(),
                    reason: reason.to_string(),
                };
                let resolved = match entry {
                    RawEntry::Scalar(path) => MappingEntry::Scalar(check_field(field, path)?),
                    RawEntry::Polymorphic(paths) => match paths.as_slice() {
                        [numeric, string, datetime] => MappingEntry::Polymorphic {
                            numeric: check_field(field, numeric)?,
                            string: check_field(field, string)?,
                            datetime: check_field(field, datetime)?,
                        },
                        _ => {
                            return Err(malformed(
                                "polymorphic fields list exactly [numeric, string, datetime]",
                            ));
                        }
                    },
                    RawEntry::Relation(target) => {
                        let mut pairs = target.iter();
                        let (Some((target, path)), None) = (pairs.next(), pairs.next()) else {
                            return Err(malformed("relation entries name exactly one entity"));
                        };
                        let Some(target_entity) = raw.entities.get(target) else {
                            return Err(MappingLoadError::UnknownTarget {
                                entity: name.clone(),
                                field: field.clone(),
                                target: target.clone(),
                            });
                        };
                        let native_path = FieldPath::parse(path).map_err(|source| {
                            MappingLoadError::UnresolvablePath {
                                entity: name.clone(),
                                field: field.clone(),
                                path: path.clone(),
                                source,
                            }
                        })?;
                        let reached = schema
                            .target_of(&entity.native_entity, native_path.segments())
                            .map_err(|source| MappingLoadError::UnresolvablePath {
                                entity: name.clone(),
                                field: field.clone(),
                                path: path.clone(),
                                source,
                            })?;
                        if reached.name != target_entity.native_entity {
                            return Err(malformed(&format!(
                                "'{path}' reaches {} but {target} is stored as {}",
                                reached.name, target_entity.native_entity
                            )));
                        }
                        MappingEntry::Relation {
                            entity: target.clone(),
                            native_path,
                        }
                    }
                };
                fields.insert(field.clone(), resolved);
            }

            entities.insert(
                name.clone(),
                EntityMapping {
                    native_entity: entity.native_entity.clone(),
                    text_fields,
                    fields,
                },
            );
        }

        tracing::debug!(entities = entities.len(), "loaded search mapping");
        Ok(Self { entities })
    }

    pub fn entity(&self, name: &str) -> Result<&EntityMapping, FilterError> {
        self.entities
            .get(name)
            .ok_or_else(|| FilterError::UnknownEntity(name.to_string()))
    }

    pub fn entities(&self) -> impl Iterator<Item = (&str, &EntityMapping)> {
        self.entities.iter().map(|(name, mapping)| (name.as_str(), mapping))
    }

    pub fn native_entity(&self, entity: &str) -> Result<&str, FilterError> {
        Ok(&self.entity(entity)?.native_entity)
    }

    pub fn text_fields(&self, entity: &str) -> Result<&[FieldPath], FilterError> {
        Ok(&self.entity(entity)?.text_fields)
    }

    /// Resolve one search field of `entity`. `value` picks the column of a
    /// polymorphic field; lists are decided by their first element.
    pub fn resolve(&self, entity: &str, field: &str, value: &Value) -> Result<Resolved<'_>, FilterError> {
        let entry = self
            .entity(entity)?
            .fields
            .get(field)
            .ok_or_else(|| FilterError::unresolved(entity, field))?;

        Ok(match entry {
            MappingEntry::Scalar(native) => Resolved::Field {
                native,
                polymorphic: false,
            },
            MappingEntry::Polymorphic {
                numeric,
                string,
                datetime,
            } => Resolved::Field {
                native: match ValueType::of(value) {
                    ValueType::Numeric => numeric,
                    ValueType::DateTime => datetime,
                    ValueType::Text => string,
                },
                polymorphic: true,
            },
            MappingEntry::Relation {
                entity,
                native_path,
            } => Resolved::Relation {
                entity,
                native_path,
            },
        })
    }

    /// Resolve a dotted search path such as `datasets.files.size` into the
    /// native path from `entity`'s native entity.
    pub fn resolve_path(&self, entity: &str, path: &FieldPath, value: &Value) -> Result<ResolvedPath, FilterError> {
        let segments = path.segments();
        let mut current = entity;
        let mut prefix: Option<FieldPath> = None;

        for (index, segment) in segments.iter().enumerate() {
            let last = index + 1 == segments.len();
            match (self.resolve(current, segment, value)?, last) {
                (
                    Resolved::Field {
                        native,
                        polymorphic,
                    },
                    true,
                ) => {
                    return Ok(ResolvedPath {
                        native: join_prefix(prefix.as_ref(), native),
                        polymorphic,
                    });
                }
                (
                    Resolved::Relation {
                        entity: next,
                        native_path,
                    },
                    false,
                ) => {
                    prefix = Some(join_prefix(prefix.as_ref(), native_path));
                    current = next;
                }
                _ => break,
            }
        }

        Err(FilterError::unresolved(entity, &path.to_string()))
    }

    /// Resolve a dotted chain of relation names to the search entity it
    /// ends on and the native relation path.
    pub fn resolve_relation<'a>(
        &'a self,
        entity: &'a str,
        relations: &[String],
    ) -> Result<(&'a str, FieldPath), FilterError> {
        let mut current = entity;
        let mut prefix: Option<FieldPath> = None;
        for name in relations {
            match self.resolve(current, name, &Value::Null)? {
                Resolved::Relation {
                    entity: next,
                    native_path,
                } => {
                    prefix = Some(join_prefix(prefix.as_ref(), native_path));
                    current = next;
                }
                Resolved::Field { .. } => return Err(FilterError::unresolved(current, name)),
            }
        }
        match prefix {
            Some(native) => Ok((current, native)),
            None => Err(FilterError::InvalidField(relations.join("."))),
        }
    }
}

fn join_prefix(prefix: Option<&FieldPath>, path: &FieldPath) -> FieldPath {
    match prefix {
        Some(prefix) => prefix.join(path),
        None => path.clone(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bundled() -> MappingTable {
        MappingTable::bundled().unwrap()
    }

    fn path(raw: &str) -> FieldPath {
        FieldPath::parse(raw).unwrap()
    }

    #[test]
    fn bundled_mapping_loads() {
        let mapping = bundled();
        assert_eq!(mapping.native_entity("Document").unwrap(), "Investigation");
        assert_eq!(mapping.text_fields("Dataset").unwrap().len(), 2);
        assert!(mapping.text_fields("Parameter").unwrap().is_empty());
    }

    #[test]
    fn scalar_fields_resolve_in_place() {
        let mapping = bundled();
        let resolved = mapping
            .resolve_path("Dataset", &path("title"), &json!("x"))
            .unwrap();
        assert_eq!(resolved.native, path("name"));
        assert!(!resolved.polymorphic);
    }

    #[test]
    fn polymorphic_field_follows_value_type() {
        let mapping = bundled();
        let field = |value: Value| {
            mapping
                .resolve_path("Parameter", &path("value"), &value)
                .unwrap()
                .native
                .to_string()
        };
        assert_eq!(field(json!(12.5)), "numericValue");
        assert_eq!(field(json!("2021-03-04")), "dateTimeValue");
        assert_eq!(field(json!("dog")), "stringValue");
        assert_eq!(field(json!(true)), "stringValue");
        assert_eq!(field(json!([1, 5])), "numericValue");
    }

    #[test]
    fn relation_hops_chain_native_paths() {
        let mapping = bundled();
        let resolved = mapping
            .resolve_path("Dataset", &path("techniques.name"), &json!("x"))
            .unwrap();
        assert_eq!(resolved.native, path("datasetTechniques.technique.name"));

        let resolved = mapping
            .resolve_path("Document", &path("datasets.parameters.value"), &json!(3))
            .unwrap();
        assert_eq!(resolved.native, path("datasets.parameters.numericValue"));
        assert!(resolved.polymorphic);
    }

    #[test]
    fn unmapped_fields_are_filter_errors() {
        let mapping = bundled();
        let err = mapping
            .resolve_path("Dataset", &path("colour"), &json!("x"))
            .unwrap_err();
        assert!(matches!(err, FilterError::UnresolvedMapping { .. }));

        // A relation cannot be compared directly.
        assert!(mapping.resolve_path("Dataset", &path("files"), &json!(1)).is_err());
        // Nor can a scalar be traversed.
        assert!(mapping.resolve_path("Dataset", &path("title.x"), &json!(1)).is_err());
    }

    #[test]
    fn relation_chain_resolves_to_target() {
        let mapping = bundled();
        let (entity, native) = mapping
            .resolve_relation("Document", &["datasets".to_string(), "files".to_string()])
            .unwrap();
        assert_eq!(entity, "File");
        assert_eq!(native, path("datasets.datafiles"));

        let owner = String::from("Dataset");
        let (entity, native) = mapping
            .resolve_relation(&owner, &["documents".to_string()])
            .unwrap();
        assert_eq!(entity, "Document");
        assert_eq!(native, path("investigation"));
        assert!(mapping.resolve_relation(&owner, &[]).is_err());
    }

    #[test]
    fn rejects_unknown_native_entity() {
        let raw = r#"{"entities": {"Thing": {"native_entity": "Nope", "fields": {}}}}"#;
        assert!(matches!(
            MappingTable::from_json(raw),
            Err(MappingLoadError::UnknownNativeEntity { .. })
        ));
    }

    #[test]
    fn rejects_unresolvable_native_path() {
        let raw = r#"{"entities": {"Doc": {"native_entity": "Investigation",
            "fields": {"title": "headline"}}}}"#;
        assert!(matches!(
            MappingTable::from_json(raw),
            Err(MappingLoadError::UnresolvablePath { .. })
        ));
    }

    #[test]
    fn rejects_relation_to_unmapped_entity() {
        let raw = r#"{"entities": {"Doc": {"native_entity": "Investigation",
            "fields": {"datasets": {"Set": "datasets"}}}}}"#;
        assert!(matches!(
            MappingTable::from_json(raw),
            Err(MappingLoadError::UnknownTarget { .. })
        ));
    }

    #[test]
    fn rejects_relation_reaching_wrong_entity() {
        let raw = r#"{"entities": {
            "Doc": {"native_entity": "Investigation", "fields": {"sets": {"Set": "samples"}}},
            "Set": {"native_entity": "Dataset", "fields": {}}}}"#;
        assert!(matches!(
            MappingTable::from_json(raw),
            Err(MappingLoadError::Malformed { .. })
        ));
    }

    #[test]
    fn rejects_short_polymorphic_list() {
        let raw = r#"{"entities": {"P": {"native_entity": "DatasetParameter",
            "fields": {"value": ["numericValue", "stringValue"]}}}}"#;
        assert!(matches!(
            MappingTable::from_json(raw),
            Err(MappingLoadError::Malformed { .. })
        ));
    }
}
