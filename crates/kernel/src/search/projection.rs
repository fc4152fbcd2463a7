//! Maps native catalog objects back into the search vocabulary.

use serde_json::{Map, Value};

use super::mapping::{MappingEntry, MappingTable};
use crate::error::FilterError;
use crate::filter::FieldPath;

/// Project a native object of `entity`'s native entity into a search
/// object. Fields whose native data was not loaded are left out.
pub fn project(mapping: &MappingTable, entity: &str, native: &Value) -> Result<Value, FilterError> {
    let entity_mapping = mapping.entity(entity)?;
    let mut out = Map::new();

    for (field, entry) in &entity_mapping.fields {
        let value = match entry {
            MappingEntry::Scalar(path) => read_path(native, path),
            MappingEntry::Polymorphic {
                numeric,
                string,
                datetime,
            } => [numeric, string, datetime]
                .into_iter()
                .filter_map(|path| read_path(native, path))
                .find(|value| !value.is_null()),
            MappingEntry::Relation {
                entity: target,
                native_path,
            } => match read_path(native, native_path) {
                Some(related) => Some(project_related(mapping, target, &related)?),
                None => None,
            },
        };
        if let Some(value) = value {
            out.insert(field.clone(), value);
        }
    }

    Ok(Value::Object(out))
}

fn project_related(mapping: &MappingTable, entity: &str, related: &Value) -> Result<Value, FilterError> {
    match related {
        Value::Array(items) => Ok(Value::Array(
            items
                .iter()
                .map(|item| project_related(mapping, entity, item))
                .collect::<Result<_, _>>()?,
        )),
        Value::Object(_) => project(mapping, entity, related),
        _ => Ok(Value::Null),
    }
}

/// Read `path` through nested objects. Arrays met on the way are mapped
/// over, so a path through a to-many relation yields a list.
fn read_path(value: &Value, path: &FieldPath) -> Option<Value> {
    read_segments(value, path.segments())
}

fn read_segments(value: &Value, segments: &[String]) -> Option<Value> {
    let Some((first, rest)) = segments.split_first() else {
        return Some(value.clone());
    };
    match value {
        Value::Object(map) => read_segments(map.get(first)?, rest),
        Value::Array(items) => Some(Value::Array(
            items
                .iter()
                .filter_map(|item| read_segments(item, segments))
                .collect(),
        )),
        _ => None,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn mapping() -> MappingTable {
        MappingTable::bundled().unwrap()
    }

    #[test]
    fn scalar_and_cross_relation_fields() {
        let native = json!({
            "id": 4,
            "pid": "pid:4",
            "fullName": "Small Angle Diffractometer",
            "facility": {"id": 1, "name": "ISIS"}
        });
        let projected = project(&mapping(), "Instrument", &native).unwrap();
        assert_eq!(
            projected,
            json!({"pid": "pid:4", "name": "Small Angle Diffractometer", "facility": "ISIS"})
        );
    }

    #[test]
    fn polymorphic_takes_first_non_null() {
        let native = json!({
            "id": 9,
            "numericValue": null,
            "stringValue": "blue",
            "dateTimeValue": null,
            "type": {"name": "colour", "units": "n/a"}
        });
        let projected = project(&mapping(), "Parameter", &native).unwrap();
        assert_eq!(projected["value"], json!("blue"));
        assert_eq!(projected["name"], json!("colour"));
        assert_eq!(projected["unit"], json!("n/a"));
    }

    #[test]
    fn loaded_relations_project_recursively() {
        let native = json!({
            "id": 1,
            "doi": "10.5286/1",
            "title": "Beam study",
            "datasets": [
                {"id": 10, "name": "run 1", "datafiles": [{"id": 100, "name": "a.nxs", "fileSize": 12}]},
                {"id": 11, "name": "run 2"}
            ]
        });
        let projected = project(&mapping(), "Document", &native).unwrap();
        assert_eq!(projected["pid"], json!("10.5286/1"));
        assert_eq!(projected["datasets"][0]["title"], json!("run 1"));
        assert_eq!(projected["datasets"][0]["files"][0]["size"], json!(12));
        assert!(projected["datasets"][1].get("files").is_none());
        assert!(projected.get("members").is_none());
    }

    #[test]
    fn two_hop_relations_flatten_link_entities() {
        let native = json!({
            "id": 10,
            "name": "run 1",
            "datasetTechniques": [
                {"id": 1, "technique": {"id": 3, "pid": "t:3", "name": "SANS"}}
            ]
        });
        let projected = project(&mapping(), "Dataset", &native).unwrap();
        assert_eq!(
            projected["techniques"],
            json!([{"pid": "t:3", "name": "SANS"}])
        );
    }
}
