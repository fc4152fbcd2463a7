//! Precedence-ordered application of filters to a query context.

use super::types::{Filter, LimitFilter};
use crate::error::ApiResult;

/// A backend query context that filters can be applied to.
///
/// Each backend matches exhaustively over [`Filter`], so adding a variant
/// fails to build until every backend handles it.
pub trait FilterTarget {
    fn apply_filter(&mut self, filter: &Filter) -> ApiResult<()>;
}

/// An ordered collection of filters for one request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterSet {
    filters: Vec<Filter>,
}

impl FilterSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_filter(&mut self, filter: Filter) {
        self.filters.push(filter);
    }

    pub fn add_filters(&mut self, filters: impl IntoIterator<Item = Filter>) {
        self.filters.extend(filters);
    }

    /// Filters in arrival order.
    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Apply every filter to `target`, lowest precedence first. Filters of
    /// equal precedence keep their arrival order. The first error aborts
    /// the remaining filters.
    pub fn apply<T: FilterTarget + ?Sized>(&self, target: &mut T) -> ApiResult<()> {
        let mut ordered: Vec<&Filter> = self.filters.iter().collect();
        ordered.sort_by_key(|f| f.precedence());
        for filter in ordered {
            tracing::debug!(kind = filter.kind(), "applying filter");
            target.apply_filter(filter)?;
        }
        Ok(())
    }

    /// Fold skip into limit for backends with a single offset+count
    /// primitive. The last skip wins and every `Skip` is removed; with no
    /// limit present a lone skip is kept for the backend to bound.
    pub fn merge_skip_limit(&mut self) {
        let skip = self.filters.iter().rev().find_map(|f| match f {
            Filter::Skip(n) => Some(*n),
            _ => None,
        });
        let Some(skip) = skip else {
            return;
        };
        let has_limit = self.filters.iter().any(|f| matches!(f, Filter::Limit(_)));
        if !has_limit {
            return;
        }
        self.filters.retain(|f| !matches!(f, Filter::Skip(_)));
        for filter in &mut self.filters {
            if let Filter::Limit(LimitFilter { skip: merged, .. }) = filter {
                *merged = Some(skip);
            }
        }
    }

    /// Only the `where` filters of this set.
    pub fn where_only(&self) -> FilterSet {
        FilterSet {
            filters: self
                .filters
                .iter()
                .filter(|f| matches!(f, Filter::Where(_) | Filter::NestedWhere(_)))
                .cloned()
                .collect(),
        }
    }
}

impl From<Vec<Filter>> for FilterSet {
    fn from(filters: Vec<Filter>) -> Self {
        Self { filters }
    }
}

impl FromIterator<Filter> for FilterSet {
    fn from_iter<I: IntoIterator<Item = Filter>>(iter: I) -> Self {
        Self {
            filters: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::error::ApiError;
    use crate::filter::types::{
        DistinctFilter, Direction, FieldPath, IncludeFilter, OrderFilter, Operator, WhereFilter,
    };
    use proptest::prelude::*;
    use serde_json::json;

    #[derive(Default)]
    struct Recorder {
        seen: Vec<u8>,
        fail_on: Option<u8>,
    }

    impl FilterTarget for Recorder {
        fn apply_filter(&mut self, filter: &Filter) -> ApiResult<()> {
            if self.fail_on == Some(filter.precedence()) {
                return Err(ApiError::bad_request("refused"));
            }
            self.seen.push(filter.precedence());
            Ok(())
        }
    }

    fn sample(index: usize) -> Filter {
        let field = FieldPath::parse("id").unwrap();
        match index % 6 {
            0 => Filter::Distinct(DistinctFilter {
                fields: vec![field],
            }),
            1 => Filter::Where(WhereFilter::new(field, json!(index), Operator::Eq).unwrap()),
            2 => Filter::Order(OrderFilter {
                field,
                direction: Direction::Asc,
            }),
            3 => Filter::Skip(index as u64),
            4 => Filter::limit(index as u64),
            _ => Filter::Include(IncludeFilter { relations: vec![] }),
        }
    }

    proptest! {
        #[test]
        fn applies_in_precedence_order(indices in prop::collection::vec(0usize..60, 0..24)) {
            let set: FilterSet = indices.iter().map(|i| sample(*i)).collect();
            let mut recorder = Recorder::default();
            set.apply(&mut recorder).unwrap();

            prop_assert_eq!(recorder.seen.len(), indices.len());
            prop_assert!(recorder.seen.windows(2).all(|w| w[0] <= w[1]));
        }

        #[test]
        fn merged_limit_carries_last_skip(skip in 0u64..10_000, count in 0u64..10_000) {
            let mut set = FilterSet::from(vec![Filter::limit(count), Filter::Skip(skip)]);
            set.merge_skip_limit();
            prop_assert_eq!(
                set.filters(),
                &[Filter::Limit(LimitFilter { count, skip: Some(skip) })]
            );
        }
    }

    #[test]
    fn ties_keep_arrival_order() {
        let set = FilterSet::from(vec![
            Filter::Order(OrderFilter {
                field: FieldPath::parse("b").unwrap(),
                direction: Direction::Asc,
            }),
            Filter::Order(OrderFilter {
                field: FieldPath::parse("a").unwrap(),
                direction: Direction::Desc,
            }),
            Filter::Distinct(DistinctFilter { fields: vec![] }),
        ]);

        struct Names(Vec<String>);
        impl FilterTarget for Names {
            fn apply_filter(&mut self, filter: &Filter) -> ApiResult<()> {
                self.0.push(match filter {
                    Filter::Order(o) => o.field.to_string(),
                    other => other.kind().to_string(),
                });
                Ok(())
            }
        }

        let mut names = Names(Vec::new());
        set.apply(&mut names).unwrap();
        assert_eq!(names.0, ["distinct", "b", "a"]);
    }

    #[test]
    fn failure_stops_later_filters() {
        let set = FilterSet::from(vec![Filter::limit(3), Filter::Skip(1), sample(1)]);
        let mut recorder = Recorder {
            fail_on: Some(3),
            ..Default::default()
        };
        assert!(set.apply(&mut recorder).is_err());
        assert_eq!(recorder.seen, [1]);
    }

    #[test]
    fn lone_skip_is_left_alone() {
        let mut set = FilterSet::from(vec![Filter::Skip(4)]);
        set.merge_skip_limit();
        assert_eq!(set.filters(), [Filter::Skip(4)]);
    }

    #[test]
    fn where_only_drops_paging() {
        let set = FilterSet::from(vec![sample(1), Filter::limit(3), sample(2)]);
        assert_eq!(set.where_only().filters().len(), 1);
    }
}
