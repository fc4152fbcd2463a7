//! JSON filter DSL parsing.
//!
//! Each request filter is a small JSON object:
//!
//! ```text
//! {"where": {"title": {"like": "Dataset"}}}
//! {"order": "id DESC"}
//! {"skip": 5}            {"limit": 10}
//! {"distinct": ["title", "facility.id"]}
//! {"include": [{"relation": "datasets", "scope": {"where": {"title": "x"}}}]}
//! {"where": {"and": [{"title": "x"}, {"or": [{"size": {"gt": 10}}, {"text": "dog"}]}]}}
//! ```

use serde_json::{Map, Value};

use super::boolean::{BooleanNode, BooleanOperator};
use super::types::{
    DistinctFilter, FieldPath, Filter, IncludeFilter, OrderFilter, Direction, Operator,
    RelationSpec, Scope, WhereFilter, WhereLeaf,
};
use crate::error::{ApiError, ApiResult, FilterError};

/// Parse a list of filter objects, in the order given.
pub fn parse_filters(values: &[Value]) -> ApiResult<Vec<Filter>> {
    let mut filters = Vec::new();
    for value in values {
        filters.extend(parse_filter(value)?);
    }
    Ok(filters)
}

/// Parse a JSON document holding either one filter object or a list of them.
pub fn parse_filter_document(raw: &str) -> ApiResult<Vec<Filter>> {
    let value: Value = serde_json::from_str(raw)
        .map_err(|e| ApiError::bad_request(format!("filters are not valid JSON: {e}")))?;
    match value {
        Value::Array(items) => parse_filters(&items),
        other => parse_filter(&other),
    }
}

/// Parse one filter object. An object may carry several filter keys.
pub fn parse_filter(value: &Value) -> ApiResult<Vec<Filter>> {
    let object = value
        .as_object()
        .ok_or_else(|| ApiError::bad_request(format!("filter must be an object: {value}")))?;

    let mut filters = Vec::new();
    for (key, body) in object {
        match key.as_str() {
            "where" => filters.extend(parse_where(body)?),
            "order" => filters.extend(parse_order(body)?),
            "skip" => filters.push(Filter::Skip(parse_count("skip", body)?)),
            "limit" => filters.push(Filter::limit(parse_count("limit", body)?)),
            "distinct" => filters.push(Filter::Distinct(DistinctFilter {
                fields: parse_field_list(body)?,
            })),
            "include" => filters.push(Filter::Include(IncludeFilter {
                relations: parse_include(body)?,
            })),
            other => {
                return Err(ApiError::bad_request(format!("unknown filter: '{other}'")));
            }
        }
    }
    Ok(filters)
}

/// A `where` object. Plain field keys become one `Where` each; `and`, `or`
/// and `text` keys become nested trees.
fn parse_where(body: &Value) -> ApiResult<Vec<Filter>> {
    let object = where_object(body)?;
    let mut filters = Vec::new();
    for (key, value) in object {
        if is_boolean_key(key) {
            let mut single = Map::new();
            single.insert(key.clone(), value.clone());
            let mut nodes = parse_nodes(&single)?;
            if let Some(node) = nodes.pop() {
                filters.push(Filter::NestedWhere(node));
            }
        } else {
            for condition in parse_conditions(key, value)? {
                filters.push(Filter::Where(condition));
            }
        }
    }
    Ok(filters)
}

fn is_boolean_key(key: &str) -> bool {
    key == "text" || BooleanOperator::parse(key).is_some()
}

fn where_object(body: &Value) -> ApiResult<&Map<String, Value>> {
    body.as_object()
        .ok_or_else(|| ApiError::bad_request(format!("'where' must be an object: {body}")))
}

/// Parse every key of one node object into tree nodes. Child lists of
/// `and`/`or` are flattened then folded left-associatively.
fn parse_nodes(object: &Map<String, Value>) -> ApiResult<Vec<BooleanNode<WhereLeaf>>> {
    let mut nodes = Vec::new();
    for (key, value) in object {
        if let Some(operator) = BooleanOperator::parse(key) {
            let items = value.as_array().ok_or_else(|| {
                FilterError::InvalidNesting(format!("'{key}' must hold a list of conditions"))
            })?;
            let mut children = Vec::new();
            for item in items {
                let child = item.as_object().ok_or_else(|| {
                    FilterError::InvalidNesting(format!("'{key}' conditions must be objects"))
                })?;
                children.extend(parse_nodes(child)?);
            }
            nodes.push(BooleanNode::fold(children, operator)?);
        } else if key == "text" {
            let text = value.as_str().ok_or_else(|| {
                ApiError::bad_request(format!("'text' expects a string, got {value}"))
            })?;
            nodes.push(BooleanNode::Leaf(WhereLeaf::Text(text.to_string())));
        } else {
            for condition in parse_conditions(key, value)? {
                nodes.push(BooleanNode::Leaf(WhereLeaf::Condition(condition)));
            }
        }
    }
    Ok(nodes)
}

/// `{"field": value}` means equality; `{"field": {"op": value, ...}}`
/// yields one condition per operator.
fn parse_conditions(field: &str, value: &Value) -> ApiResult<Vec<WhereFilter>> {
    let path = FieldPath::parse(field)?;
    match value {
        Value::Object(ops) => {
            if ops.is_empty() {
                return Err(ApiError::bad_request(format!(
                    "no operator given for '{field}'"
                )));
            }
            ops.iter()
                .map(|(op, operand)| {
                    WhereFilter::new(path.clone(), operand.clone(), Operator::parse(op)?)
                })
                .collect()
        }
        other => Ok(vec![WhereFilter::new(path, other.clone(), Operator::Eq)?]),
    }
}

fn parse_order(body: &Value) -> ApiResult<Vec<Filter>> {
    match body {
        Value::String(s) => Ok(vec![Filter::Order(parse_order_item(s)?)]),
        Value::Array(items) => items
            .iter()
            .map(|item| {
                let s = item.as_str().ok_or_else(|| {
                    ApiError::bad_request(format!("order entries must be strings: {item}"))
                })?;
                Ok(Filter::Order(parse_order_item(s)?))
            })
            .collect(),
        other => Err(ApiError::bad_request(format!(
            "'order' must be a string or list: {other}"
        ))),
    }
}

fn parse_order_item(raw: &str) -> ApiResult<OrderFilter> {
    let mut parts = raw.split_whitespace();
    let field = parts
        .next()
        .ok_or_else(|| ApiError::bad_request("empty order"))?;
    let direction = match parts.next().map(str::to_ascii_uppercase).as_deref() {
        None | Some("ASC") => Direction::Asc,
        Some("DESC") => Direction::Desc,
        Some(other) => {
            return Err(ApiError::bad_request(format!(
                "order direction must be ASC or DESC, got '{other}'"
            )));
        }
    };
    if parts.next().is_some() {
        return Err(ApiError::bad_request(format!("malformed order: '{raw}'")));
    }
    Ok(OrderFilter {
        field: FieldPath::parse(field)?,
        direction,
    })
}

fn parse_count(name: &str, body: &Value) -> ApiResult<u64> {
    let parsed = match body {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| {
        ApiError::bad_request(format!("'{name}' must be a non-negative integer, got {body}"))
    })
}

fn parse_field_list(body: &Value) -> ApiResult<Vec<FieldPath>> {
    match body {
        Value::String(s) => Ok(vec![FieldPath::parse(s)?]),
        Value::Array(items) => items
            .iter()
            .map(|item| {
                let s = item.as_str().ok_or_else(|| {
                    ApiError::bad_request(format!("'distinct' fields must be strings: {item}"))
                })?;
                Ok(FieldPath::parse(s)?)
            })
            .collect(),
        other => Err(ApiError::bad_request(format!(
            "'distinct' must be a string or list: {other}"
        ))),
    }
}

/// Accepts `"rel"`, `["a", "b"]`, `{"rel": "sub"}`, `{"rel": ["a", "b"]}`,
/// `{"rel": {"sub": "x"}}` and `{"relation": "rel", "scope": {...}}`.
fn parse_include(body: &Value) -> ApiResult<Vec<RelationSpec>> {
    match body {
        Value::String(name) => Ok(vec![RelationSpec::new(name.clone())]),
        Value::Array(items) => {
            let mut relations = Vec::new();
            for item in items {
                relations.extend(parse_include(item)?);
            }
            Ok(relations)
        }
        Value::Object(object) if object.contains_key("relation") => {
            let name = object
                .get("relation")
                .and_then(Value::as_str)
                .ok_or_else(|| ApiError::bad_request("'relation' must be a string"))?;
            if let Some(key) = object.keys().find(|k| *k != "relation" && *k != "scope") {
                return Err(ApiError::bad_request(format!(
                    "unexpected key '{key}' in include"
                )));
            }
            let scope = object.get("scope").map(parse_scope).transpose()?;
            Ok(vec![RelationSpec {
                name: name.to_string(),
                scope,
            }])
        }
        Value::Object(object) => object
            .iter()
            .map(|(name, nested)| {
                Ok(RelationSpec {
                    name: name.clone(),
                    scope: Some(Scope {
                        filters: vec![Filter::Include(IncludeFilter {
                            relations: parse_include(nested)?,
                        })],
                    }),
                })
            })
            .collect(),
        other => Err(ApiError::bad_request(format!("malformed include: {other}"))),
    }
}

fn parse_scope(body: &Value) -> ApiResult<Scope> {
    let filters = parse_filter(body)?;
    if let Some(bad) = filters
        .iter()
        .find(|f| matches!(f, Filter::Skip(_) | Filter::Limit(_) | Filter::Distinct(_)))
    {
        return Err(ApiError::bad_request(format!(
            "'{}' is not allowed inside an include scope",
            bad.kind()
        )));
    }
    Ok(Scope { filters })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(values: Value) -> ApiResult<Vec<Filter>> {
        parse_filters(values.as_array().unwrap())
    }

    #[test]
    fn where_with_operator() {
        let filters = parse(json!([{"where": {"title": {"like": "Dataset"}}}])).unwrap();
        let [Filter::Where(w)] = filters.as_slice() else {
            panic!("expected one where filter: {filters:?}");
        };
        assert_eq!(w.field.to_string(), "title");
        assert_eq!(w.operation, Operator::Like);
        assert_eq!(w.value, json!("Dataset"));
    }

    #[test]
    fn scalar_where_means_eq() {
        let filters = parse(json!([{"where": {"title": "x", "facility.name": "ISIS"}}])).unwrap();
        assert_eq!(filters.len(), 2);
        assert!(
            filters
                .iter()
                .all(|f| matches!(f, Filter::Where(w) if w.operation == Operator::Eq))
        );
    }

    #[test]
    fn unknown_operator_is_filter_error() {
        let err = parse(json!([{"where": {"title": {"approx": "x"}}}])).unwrap_err();
        assert!(matches!(err, ApiError::Filter(FilterError::InvalidOperator(_))));
    }

    #[test]
    fn order_skip_limit() {
        let filters = parse(json!([{"order": ["name ASC", "id desc"]}, {"skip": 5}, {"limit": "10"}]))
            .unwrap();
        assert_eq!(filters.len(), 4);
        assert!(matches!(&filters[1], Filter::Order(o) if o.direction == Direction::Desc));
        assert_eq!(filters[2], Filter::Skip(5));
        assert_eq!(filters[3], Filter::limit(10));
    }

    #[test]
    fn negative_skip_is_bad_request() {
        let err = parse(json!([{"skip": -1}])).unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(_)));
        let err = parse(json!([{"limit": 2.5}])).unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(_)));
    }

    #[test]
    fn bad_order_direction() {
        assert!(parse(json!([{"order": "id SIDEWAYS"}])).is_err());
    }

    #[test]
    fn distinct_fields() {
        let filters = parse(json!([{"distinct": ["title", "facility.id"]}])).unwrap();
        let [Filter::Distinct(d)] = filters.as_slice() else {
            panic!("expected distinct");
        };
        assert_eq!(d.fields.len(), 2);
        assert_eq!(d.fields[1].hops(), 1);
    }

    #[test]
    fn include_shapes() {
        let filters = parse(json!([
            {"include": "facility"},
            {"include": {"datasets": ["datafiles", "sample"]}},
            {"include": [{"relation": "datasets", "scope": {"where": {"name": "x"}, "include": "datafiles"}}]}
        ]))
        .unwrap();
        let paths: Vec<Vec<String>> = filters
            .iter()
            .map(|f| match f {
                Filter::Include(i) => i.relations.iter().flat_map(RelationSpec::include_paths).collect(),
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(paths[0], ["facility"]);
        assert_eq!(paths[1], ["datasets", "datasets.datafiles", "datasets.sample"]);
        assert_eq!(paths[2], ["datasets", "datasets.datafiles"]);
        let Filter::Include(scoped) = &filters[2] else {
            unreachable!()
        };
        assert_eq!(scoped.relations[0].scope_filters().count(), 1);
    }

    #[test]
    fn scope_rejects_paging() {
        let err = parse(json!([{"include": [{"relation": "datasets", "scope": {"limit": 2}}]}]))
            .unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(_)));
    }

    #[test]
    fn nested_where_folds_left() {
        let filters = parse(json!([{"where": {"and": [
            {"title": "x"},
            {"or": [{"size": {"gt": 10}}, {"text": "dog"}]}
        ]}}]))
        .unwrap();
        let [Filter::NestedWhere(node)] = filters.as_slice() else {
            panic!("expected nested where: {filters:?}");
        };
        let BooleanNode::Branch { lhs, rhs, operator } = node else {
            panic!("expected branch");
        };
        assert_eq!(*operator, BooleanOperator::And);
        assert_eq!(lhs.len(), 1);
        assert!(matches!(&rhs[0], BooleanNode::Branch { operator: BooleanOperator::Or, .. }));
        assert_eq!(node.leaves().len(), 3);
    }

    #[test]
    fn empty_boolean_list_is_nesting_error() {
        let err = parse(json!([{"where": {"or": []}}])).unwrap_err();
        assert!(matches!(err, ApiError::Filter(FilterError::InvalidNesting(_))));
        let err = parse(json!([{"where": {"and": {"title": "x"}}}])).unwrap_err();
        assert!(matches!(err, ApiError::Filter(FilterError::InvalidNesting(_))));
    }

    #[test]
    fn unknown_filter_key() {
        let err = parse(json!([{"group": "x"}])).unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(_)));
    }

    #[test]
    fn filter_document_accepts_object_or_list() {
        assert_eq!(parse_filter_document(r#"{"limit": 3}"#).unwrap(), [Filter::limit(3)]);
        assert_eq!(parse_filter_document(r#"[{"skip": 1}]"#).unwrap(), [Filter::Skip(1)]);
        assert!(parse_filter_document("{").is_err());
    }
}
