//! Applies request filters to a native catalog query.

use super::query::{Aggregate, AggregateFunction, Attribute, CatalogQuery, Fragment};
use crate::error::{ApiError, ApiResult, FilterError};
use crate::filter::{
    BooleanNode, Direction, FieldPath, Filter, FilterSet, FilterTarget, RelationSpec, WhereFilter,
    WhereLeaf,
};
use crate::schema::{EntityDef, Schema, catalog};

/// Orders applied so far in one compilation.
///
/// The native query replaces its order list whenever one is set, so the
/// compiler accumulates here and hands over the whole list each time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrderState {
    entries: Vec<(String, Direction)>,
}

impl OrderState {
    pub fn reset(&mut self) {
        self.entries.clear();
    }

    pub fn push(&mut self, attribute: String, direction: Direction) -> Vec<(String, Direction)> {
        self.entries.push((attribute, direction));
        self.entries.clone()
    }
}

/// Query context for one catalog compilation.
pub struct CatalogContext<'s> {
    schema: &'s Schema,
    entity: &'s EntityDef,
    query: CatalogQuery,
    order: OrderState,
    max_entities: u64,
}

impl<'s> CatalogContext<'s> {
    pub fn new(schema: &'s Schema, entity: &str, max_entities: u64) -> ApiResult<Self> {
        let entity = schema.entity(entity)?;
        Ok(Self {
            schema,
            entity,
            query: CatalogQuery::new(entity.name.clone()),
            order: OrderState::default(),
            max_entities,
        })
    }

    /// Start from an existing query, e.g. one with an aggregate already set.
    pub fn with_query(mut self, query: CatalogQuery) -> Self {
        self.query = query;
        self
    }

    pub fn query(&self) -> &CatalogQuery {
        &self.query
    }

    pub fn into_query(self) -> CatalogQuery {
        self.query
    }

    /// Check `path` against the schema and return its qualified attribute.
    fn attribute(&mut self, path: &FieldPath) -> ApiResult<String> {
        self.schema.resolve_field(&self.entity.name, path)?;
        Ok(self.query.qualify(path))
    }

    fn leaf(&mut self, filter: &WhereFilter) -> ApiResult<String> {
        let attribute = self.attribute(&filter.field)?;
        Ok(Fragment::build(filter.operation, &filter.value)?
            .map_or_else(|| "1 = 1".to_string(), |f| f.render(&attribute)))
    }

    fn apply_distinct(&mut self, fields: &[FieldPath]) -> ApiResult<()> {
        if fields.is_empty() {
            return Err(ApiError::bad_request("'distinct' needs at least one field"));
        }
        for path in fields {
            let qualified = self.attribute(path)?;
            self.query.add_condition(qualified.clone(), Fragment::sentinel());
            self.query.add_attribute(Attribute {
                qualified,
                label: path.to_string(),
            });
        }
        let aggregate = self.query.aggregate().unwrap_or_default().with_distinct();
        self.query.set_aggregate(aggregate);
        Ok(())
    }

    fn apply_include(&mut self, relations: &[RelationSpec]) -> ApiResult<()> {
        for relation in relations {
            if let Some(filter) = relation.scope_filters().next() {
                return Err(ApiError::bad_request(format!(
                    "'{}' inside an include scope is not supported by the catalog",
                    filter.kind()
                )));
            }
            for path in relation.include_paths() {
                let segments: Vec<String> = path.split('.').map(str::to_string).collect();
                self.schema.walk(&self.entity.name, &segments)?;
                self.query.add_include(path);
            }
        }
        Ok(())
    }
}

impl FilterTarget for CatalogContext<'_> {
    fn apply_filter(&mut self, filter: &Filter) -> ApiResult<()> {
        match filter {
            Filter::Distinct(distinct) => self.apply_distinct(&distinct.fields),
            Filter::Where(condition) => {
                let attribute = self.attribute(&condition.field)?;
                if let Some(fragment) = Fragment::build(condition.operation, &condition.value)? {
                    self.query.add_condition(attribute, fragment);
                }
                Ok(())
            }
            Filter::NestedWhere(node) => {
                let rendered = node.clone().try_map(
                    &mut |leaf: WhereLeaf| -> ApiResult<BooleanNode<String>> {
                        match leaf {
                            WhereLeaf::Condition(condition) => {
                                Ok(BooleanNode::Leaf(self.leaf(&condition)?))
                            }
                            WhereLeaf::Text(_) => Err(FilterError::Unsupported(
                                "'text' search needs a search mapping".to_string(),
                            )
                            .into()),
                        }
                    },
                )?;
                if let Some(condition) = rendered.render() {
                    self.query.add_raw_condition(condition);
                }
                Ok(())
            }
            Filter::Order(order) => {
                let attribute = self.attribute(&order.field)?;
                let entries = self.order.push(attribute, order.direction);
                self.query.set_order(entries);
                Ok(())
            }
            Filter::Skip(skip) => {
                self.query.set_limit(*skip, self.max_entities);
                Ok(())
            }
            Filter::Limit(limit) => {
                self.query
                    .set_limit(limit.skip.unwrap_or_default(), limit.count);
                Ok(())
            }
            Filter::Include(include) => self.apply_include(&include.relations),
        }
    }
}

/// Compile `filters` into a native query over `entity`. Skip and limit are
/// merged first; a lone skip is bounded by `max_entities`.
pub fn compile_catalog(entity: &str, filters: &FilterSet, max_entities: u64) -> ApiResult<CatalogQuery> {
    let mut merged = filters.clone();
    merged.merge_skip_limit();

    let mut context = CatalogContext::new(catalog(), entity, max_entities)?;
    context.order.reset();
    merged.apply(&mut context)?;

    let query = context.into_query();
    tracing::debug!(entity, query = %query, "compiled catalog query");
    Ok(query)
}

/// Compile a `COUNT` over `entity`. Only `where` and `distinct` filters
/// take part; distinct turns the count into `COUNT:DISTINCT`.
pub fn compile_catalog_count(entity: &str, filters: &FilterSet, max_entities: u64) -> ApiResult<CatalogQuery> {
    let counted: FilterSet = filters
        .filters()
        .iter()
        .filter(|f| matches!(f, Filter::Where(_) | Filter::NestedWhere(_) | Filter::Distinct(_)))
        .cloned()
        .collect();

    let mut query = CatalogQuery::new(entity);
    query.set_aggregate(Aggregate::function(AggregateFunction::Count));
    let mut context = CatalogContext::new(catalog(), entity, max_entities)?.with_query(query);
    counted.apply(&mut context)?;

    let query = context.into_query();
    tracing::debug!(entity, query = %query, "compiled catalog count");
    Ok(query)
}
