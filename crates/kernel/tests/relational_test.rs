#![allow(clippy::unwrap_used, clippy::expect_used)]
//! Relational backend integration tests against the SQLite fixture.

use std::collections::BTreeSet;
use std::sync::Arc;

use datagate_kernel::error::ApiError;
use datagate_kernel::filter::{FilterSet, parse_filter_document};
use datagate_kernel::relational::{RelationalService, RowFetcher};
use datagate_test_utils::fixture_pool;
use serde_json::{Value, json};

async fn service() -> RelationalService {
    service_with_child_limit(1000).await
}

async fn service_with_child_limit(limit: u64) -> RelationalService {
    let pool = fixture_pool().await.unwrap();
    let fetcher: Arc<dyn RowFetcher> = Arc::new(pool);
    RelationalService::new(fetcher, limit)
}

fn filters(raw: &str) -> FilterSet {
    FilterSet::from(parse_filter_document(raw).unwrap())
}

fn names(rows: &[Value]) -> Vec<&str> {
    rows.iter().map(|r| r["name"].as_str().unwrap()).collect()
}

// -------------------------------------------------------------------------
// Filtering and paging
// -------------------------------------------------------------------------

#[tokio::test]
async fn like_with_limit_returns_the_matching_row() {
    let service = service().await;
    let rows = service
        .get_with_filters(
            "Dataset",
            &filters(r#"[{"where": {"name": {"like": "Dataset 1"}}}, {"limit": 1}]"#),
        )
        .await
        .unwrap();

    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["id"], json!(1));
    assert_eq!(rows[0]["name"], json!("Dataset 1"));
    assert_eq!(rows[0]["complete"], json!(true));
    assert_eq!(rows[0]["createTime"], json!("2021-03-04T10:00:00"));
    assert_eq!(rows[0]["sampleId"], Value::Null);
}

#[tokio::test]
async fn filters_apply_in_precedence_order_regardless_of_arrival() {
    let service = service().await;
    let rows = service
        .get_with_filters(
            "Dataset",
            &filters(r#"[{"limit": 1}, {"skip": 1}, {"order": "name DESC"}]"#),
        )
        .await
        .unwrap();
    assert_eq!(names(&rows), ["Dataset 2"]);
}

#[tokio::test]
async fn relation_fields_join() {
    let service = service().await;
    let rows = service
        .get_with_filters(
            "Dataset",
            &filters(r#"[{"where": {"investigation.title": "Beam study"}}, {"order": "id"}]"#),
        )
        .await
        .unwrap();
    assert_eq!(names(&rows), ["Dataset 1", "Dataset 2"]);

    let rows = service
        .get_with_filters(
            "Datafile",
            &filters(r#"{"where": {"dataset.investigation.name": "INV-1"}}"#),
        )
        .await
        .unwrap();
    assert_eq!(rows.len(), 3);
}

#[tokio::test]
async fn to_many_joins_do_not_repeat_rows() {
    let service = service().await;
    let rows = service
        .get_with_filters(
            "Investigation",
            &filters(r#"{"where": {"datasets.datafiles.fileSize": {"gte": 100}}}"#),
        )
        .await
        .unwrap();
    assert_eq!(names(&rows), ["INV-1"]);
}

#[tokio::test]
async fn empty_lists() {
    let service = service().await;
    let none = service
        .get_with_filters("Dataset", &filters(r#"{"where": {"id": {"in": []}}}"#))
        .await
        .unwrap();
    assert!(none.is_empty());

    let all = service
        .get_with_filters("Dataset", &filters(r#"{"where": {"id": {"nin": []}}}"#))
        .await
        .unwrap();
    assert_eq!(all.len(), 3);
}

#[tokio::test]
async fn between_dates() {
    let service = service().await;
    let rows = service
        .get_with_filters(
            "Dataset",
            &filters(
                r#"[{"where": {"createTime": {"between": ["2021-03-04", "2021-03-05T23:59:59"]}}},
                    {"order": "id"}]"#,
            ),
        )
        .await
        .unwrap();
    assert_eq!(names(&rows), ["Dataset 1", "Dataset 2"]);
}

#[tokio::test]
async fn null_comparisons() {
    let service = service().await;
    let rows = service
        .get_with_filters("Investigation", &filters(r#"{"where": {"summary": null}}"#))
        .await
        .unwrap();
    assert_eq!(names(&rows), ["INV-3"]);

    let rows = service
        .get_with_filters(
            "Investigation",
            &filters(r#"{"where": {"summary": {"neq": null}}}"#),
        )
        .await
        .unwrap();
    assert_eq!(rows.len(), 2);
}

#[tokio::test]
async fn nested_boolean_where() {
    let service = service().await;
    let rows = service
        .get_with_filters(
            "Datafile",
            &filters(
                r#"[{"where": {"or": [
                        {"name": "a.nxs"},
                        {"and": [{"fileSize": {"gt": 150}}, {"dataset.name": "Dataset 2"}]}
                    ]}},
                    {"order": "id"}]"#,
            ),
        )
        .await
        .unwrap();
    assert_eq!(names(&rows), ["a.nxs", "c.nxs"]);
}

#[tokio::test]
async fn order_by_to_one_column_under_fan_out() {
    let service = service().await;
    let rows = service
        .get_with_filters(
            "Investigation",
            &filters(
                r#"[{"where": {"datasets.name": {"like": "Dataset"}}},
                    {"order": ["facility.name", "id DESC"]}]"#,
            ),
        )
        .await
        .unwrap();
    assert_eq!(names(&rows), ["INV-2", "INV-1"]);

    let err = service
        .get_with_filters(
            "Investigation",
            &filters(r#"[{"where": {"datasets.name": "Dataset 1"}}, {"order": "datasets.name"}]"#),
        )
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), 400);
}

// -------------------------------------------------------------------------
// Distinct
// -------------------------------------------------------------------------

#[tokio::test]
async fn distinct_returns_only_requested_fields() {
    let service = service().await;
    let rows = service
        .get_with_filters("Dataset", &filters(r#"{"distinct": "complete"}"#))
        .await
        .unwrap();
    let values: BTreeSet<String> = rows.iter().map(ToString::to_string).collect();
    assert_eq!(
        values,
        BTreeSet::from([
            json!({"complete": false}).to_string(),
            json!({"complete": true}).to_string()
        ])
    );
}

#[tokio::test]
async fn distinct_nests_dotted_fields() {
    let service = service().await;
    let rows = service
        .get_with_filters(
            "Dataset",
            &filters(r#"[{"distinct": ["investigation.name"]}, {"order": "investigation.name"}]"#),
        )
        .await
        .unwrap();
    assert_eq!(
        rows,
        [
            json!({"investigation": {"name": "INV-1"}}),
            json!({"investigation": {"name": "INV-2"}})
        ]
    );
}

// -------------------------------------------------------------------------
// Includes
// -------------------------------------------------------------------------

#[tokio::test]
async fn include_one_to_many_and_many_to_one() {
    let service = service().await;
    let rows = service
        .get_with_filters(
            "Dataset",
            &filters(r#"[{"include": ["datafiles", "investigation"]}, {"order": "id"}]"#),
        )
        .await
        .unwrap();

    assert_eq!(rows.len(), 3);
    assert_eq!(rows[0]["datafiles"].as_array().unwrap().len(), 2);
    assert_eq!(rows[1]["datafiles"].as_array().unwrap().len(), 1);
    assert_eq!(rows[2]["datafiles"], json!([]));
    assert_eq!(rows[0]["investigation"]["name"], json!("INV-1"));
    assert_eq!(rows[2]["investigation"]["name"], json!("INV-2"));
}

#[tokio::test]
async fn include_scope_filters_children() {
    let service = service().await;
    let row = service
        .get_with_id(
            "Dataset",
            1,
            &filters(
                r#"{"include": [{"relation": "datafiles",
                                 "scope": {"where": {"fileSize": {"gt": 150}}}}]}"#,
            ),
        )
        .await
        .unwrap();
    assert_eq!(names(row["datafiles"].as_array().unwrap()), ["b.nxs"]);
}

#[tokio::test]
async fn nested_includes() {
    let service = service().await;
    let row = service
        .get_with_id(
            "Investigation",
            1,
            &filters(r#"{"include": {"datasets": "datafiles"}}"#),
        )
        .await
        .unwrap();
    let datasets = row["datasets"].as_array().unwrap();
    assert_eq!(datasets.len(), 2);
    let files: usize = datasets
        .iter()
        .map(|d| d["datafiles"].as_array().unwrap().len())
        .sum();
    assert_eq!(files, 3);
}

#[tokio::test]
async fn child_limit_never_drops_existing_parents() {
    let service = service_with_child_limit(1).await;
    let rows = service
        .get_with_filters(
            "Dataset",
            &filters(r#"[{"include": "investigation"}, {"order": "id"}]"#),
        )
        .await
        .unwrap();
    let investigations: Vec<&Value> = rows.iter().map(|r| &r["investigation"]["name"]).collect();
    assert_eq!(investigations, [&json!("INV-1"), &json!("INV-1"), &json!("INV-2")]);
}

#[tokio::test]
async fn child_limit_caps_each_parent_separately() {
    let service = service_with_child_limit(1).await;
    let rows = service
        .get_with_filters(
            "Dataset",
            &filters(
                r#"[{"include": [{"relation": "datafiles",
                                  "scope": {"order": "fileSize DESC"}}]},
                    {"order": "id"}]"#,
            ),
        )
        .await
        .unwrap();
    assert_eq!(names(rows[0]["datafiles"].as_array().unwrap()), ["b.nxs"]);
    assert_eq!(names(rows[1]["datafiles"].as_array().unwrap()), ["c.nxs"]);
    assert_eq!(rows[2]["datafiles"], json!([]));
}

#[tokio::test]
async fn missing_many_to_one_is_null() {
    let service = service().await;
    let row = service
        .get_with_id("Dataset", 1, &filters(r#"{"include": "sample"}"#))
        .await
        .unwrap();
    assert_eq!(row["sample"], Value::Null);
}

// -------------------------------------------------------------------------
// Single records and counts
// -------------------------------------------------------------------------

#[tokio::test]
async fn missing_record() {
    let service = service().await;
    let err = service
        .get_with_id("Dataset", 99, &FilterSet::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::MissingRecord(_)));
    assert_eq!(err.status_code(), 404);

    let err = service
        .get_one_with_filters("Dataset", &filters(r#"{"where": {"name": "nope"}}"#))
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::MissingRecord(_)));
}

#[tokio::test]
async fn counts_ignore_paging_and_fan_out() {
    let service = service().await;
    let count = service
        .count_with_filters(
            "Dataset",
            &filters(r#"[{"where": {"investigation.title": "Beam study"}}, {"limit": 1}]"#),
        )
        .await
        .unwrap();
    assert_eq!(count, 2);

    let count = service
        .count_with_filters(
            "Investigation",
            &filters(r#"{"where": {"datasets.name": {"like": "Dataset"}}}"#),
        )
        .await
        .unwrap();
    assert_eq!(count, 2);
}

#[tokio::test]
async fn invalid_filters_are_client_errors() {
    let service = service().await;
    let err = service
        .get_with_filters(
            "Datafile",
            &filters(r#"{"where": {"dataset.investigation.facility.name": "ISIS"}}"#),
        )
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), 400);

    let err = service
        .get_with_filters(
            "Dataset",
            &filters(r#"[{"include": "datafiles"}, {"include": "investigation"}]"#),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::MultipleInclude));
}
