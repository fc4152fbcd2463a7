//! Applies search-vocabulary filters to a native catalog query.
//!
//! Every field is translated through the [`MappingTable`] and the resulting
//! native filter is handed to a [`CatalogContext`], so the catalog's limit,
//! order and alias handling apply unchanged.

use serde_json::Value;

use super::mapping::{MappingEntry, MappingTable};
use crate::catalog::{Aggregate, AggregateFunction, CatalogContext, CatalogQuery};
use crate::error::{ApiError, ApiResult};
use crate::filter::{
    BooleanNode, BooleanOperator, FieldPath, Filter, FilterSet, FilterTarget, IncludeFilter,
    Operator, OrderFilter, RelationSpec, WhereFilter, WhereLeaf,
};
use crate::schema::catalog;

pub struct SearchContext<'m> {
    mapping: &'m MappingTable,
    entity: String,
    inner: CatalogContext<'static>,
}

impl<'m> SearchContext<'m> {
    pub fn new(mapping: &'m MappingTable, entity: &str, max_entities: u64) -> ApiResult<Self> {
        let native = mapping.native_entity(entity)?;
        Ok(Self {
            mapping,
            entity: entity.to_string(),
            inner: CatalogContext::new(catalog(), native, max_entities)?,
        })
    }

    /// Start from an existing native query, e.g. one with an aggregate set.
    pub fn with_query(mut self, query: CatalogQuery) -> Self {
        self.inner = self.inner.with_query(query);
        self
    }

    pub fn into_query(self) -> CatalogQuery {
        self.inner.into_query()
    }

    /// `chain.field` as a search path from the root entity.
    fn scoped_path(chain: &[String], field: &FieldPath) -> ApiResult<FieldPath> {
        if chain.is_empty() {
            return Ok(field.clone());
        }
        Ok(FieldPath::from_segments(chain.to_vec())?.join(field))
    }

    fn native_condition(&self, chain: &[String], condition: &WhereFilter) -> ApiResult<WhereFilter> {
        let path = Self::scoped_path(chain, &condition.field)?;
        let resolved = self
            .mapping
            .resolve_path(&self.entity, &path, &condition.value)?;
        let value = if resolved.polymorphic {
            coerce_text(&condition.value)
        } else {
            condition.value.clone()
        };
        WhereFilter::new(resolved.native, value, condition.operation)
    }

    /// `text` over the text fields of the entity `chain` leads to, as an
    /// `or` group of `like` conditions. No text fields gives an empty group.
    fn text_condition(&self, chain: &[String], text: &str) -> ApiResult<BooleanNode<WhereLeaf>> {
        let (entity, prefix) = if chain.is_empty() {
            (self.entity.as_str(), None)
        } else {
            let (entity, native) = self.mapping.resolve_relation(&self.entity, chain)?;
            (entity, Some(native))
        };

        let children = self
            .mapping
            .text_fields(entity)?
            .iter()
            .map(|field| {
                let native = match &prefix {
                    Some(prefix) => prefix.join(field),
                    None => field.clone(),
                };
                WhereFilter::new(native, Value::String(text.to_string()), Operator::Like)
                    .map(|c| BooleanNode::Leaf(WhereLeaf::Condition(c)))
            })
            .collect::<ApiResult<Vec<_>>>()?;

        if children.is_empty() {
            return Ok(BooleanNode::empty());
        }
        Ok(BooleanNode::fold(children, BooleanOperator::Or)?)
    }

    fn native_tree(&self, chain: &[String], node: &BooleanNode<WhereLeaf>) -> ApiResult<BooleanNode<WhereLeaf>> {
        node.clone()
            .try_map(&mut |leaf: WhereLeaf| -> ApiResult<BooleanNode<WhereLeaf>> {
                match leaf {
                    WhereLeaf::Condition(condition) => Ok(BooleanNode::Leaf(WhereLeaf::Condition(
                        self.native_condition(chain, &condition)?,
                    ))),
                    WhereLeaf::Text(text) => self.text_condition(chain, &text),
                }
            })
    }

    fn apply_include(&mut self, chain: &[String], relations: &[RelationSpec]) -> ApiResult<()> {
        for relation in relations {
            let mut path = chain.to_vec();
            path.push(relation.name.clone());

            let (_, native) = self.mapping.resolve_relation(&self.entity, &path)?;
            self.inner.apply_filter(&Filter::Include(IncludeFilter {
                relations: vec![RelationSpec::new(native.to_string())],
            }))?;

            for filter in relation.scope_filters() {
                let native = match filter {
                    Filter::Where(condition) => Filter::Where(self.native_condition(&path, condition)?),
                    Filter::NestedWhere(node) => Filter::NestedWhere(self.native_tree(&path, node)?),
                    other => {
                        return Err(ApiError::bad_request(format!(
                            "'{}' inside an include scope is not supported by search",
                            other.kind()
                        )));
                    }
                };
                self.inner.apply_filter(&native)?;
            }

            let nested: Vec<RelationSpec> = relation.nested().cloned().collect();
            self.apply_include(&path, &nested)?;
        }
        Ok(())
    }
}

impl FilterTarget for SearchContext<'_> {
    fn apply_filter(&mut self, filter: &Filter) -> ApiResult<()> {
        match filter {
            Filter::Where(condition) => {
                let native = self.native_condition(&[], condition)?;
                self.inner.apply_filter(&Filter::Where(native))
            }
            Filter::NestedWhere(node) => {
                let native = self.native_tree(&[], node)?;
                self.inner.apply_filter(&Filter::NestedWhere(native))
            }
            Filter::Order(order) => {
                let resolved = self
                    .mapping
                    .resolve_path(&self.entity, &order.field, &Value::Null)?;
                self.inner.apply_filter(&Filter::Order(OrderFilter {
                    field: resolved.native,
                    direction: order.direction,
                }))
            }
            Filter::Skip(_) | Filter::Limit(_) => self.inner.apply_filter(filter),
            Filter::Distinct(_) => Err(ApiError::bad_request(
                "'distinct' is not available on the search surface",
            )),
            Filter::Include(include) => self.apply_include(&[], &include.relations),
        }
    }
}

/// Booleans compared against a polymorphic string column are compared as
/// their text form.
fn coerce_text(value: &Value) -> Value {
    match value {
        Value::Bool(b) => Value::String(b.to_string()),
        Value::Array(items) => Value::Array(items.iter().map(coerce_text).collect()),
        other => other.clone(),
    }
}

/// Native relation paths that must be loaded to project `entity`'s mapped
/// fields, e.g. `facility` for a field mapped to `facility.name`.
fn projection_includes(mapping: &MappingTable, entity: &str) -> ApiResult<Vec<String>> {
    let mut paths = Vec::new();
    for entry in mapping.entity(entity)?.fields.values() {
        let natives: Vec<&FieldPath> = match entry {
            MappingEntry::Scalar(native) => vec![native],
            MappingEntry::Polymorphic {
                numeric,
                string,
                datetime,
            } => vec![numeric, string, datetime],
            MappingEntry::Relation { .. } => Vec::new(),
        };
        for native in natives {
            if native.hops() > 0 {
                let path = native.relations().join(".");
                if !paths.contains(&path) {
                    paths.push(path);
                }
            }
        }
    }
    Ok(paths)
}

/// Compile search filters over `entity` into a native catalog query.
pub fn compile_search(
    entity: &str,
    filters: &FilterSet,
    mapping: &MappingTable,
    max_entities: u64,
) -> ApiResult<CatalogQuery> {
    let mut merged = filters.clone();
    merged.merge_skip_limit();

    let mut context = SearchContext::new(mapping, entity, max_entities)?;
    merged.apply(&mut context)?;

    let mut query = context.into_query();
    for path in projection_includes(mapping, entity)? {
        query.add_include(path);
    }
    tracing::debug!(entity, query = %query, "compiled search query");
    Ok(query)
}

/// Compile a `COUNT` of search `entity` rows matching the `where` filters.
pub fn compile_search_count(
    entity: &str,
    filters: &FilterSet,
    mapping: &MappingTable,
    max_entities: u64,
) -> ApiResult<CatalogQuery> {
    let native = mapping.native_entity(entity)?;
    let mut query = CatalogQuery::new(native);
    query.set_aggregate(Aggregate::function(AggregateFunction::Count));

    let mut context = SearchContext::new(mapping, entity, max_entities)?.with_query(query);
    filters.where_only().apply(&mut context)?;

    let query = context.into_query();
    tracing::debug!(entity, query = %query, "compiled search count");
    Ok(query)
}
