#![allow(missing_docs)]

mod common;

use dyncore::query::{compile_find, CompileError, CompileOptions, FindRequest};
use dyncore::Error;
use serde_json::{json, Value};

fn ids(data: &[Value]) -> Vec<i64> {
    data.iter()
        .map(|row| row["id"].as_i64().expect("id"))
        .collect()
}

fn find(table: &str, request: FindRequest) -> dyncore::query::FindResult {
    let (registry, _) = common::registry();
    registry
        .repository(table)
        .expect("repository")
        .find(&request)
        .expect("find")
}

#[test]
fn eq_set_matches_permutations_but_not_subsets() {
    let result = find(
        "posts",
        FindRequest::new()
            .with_fields("id")
            .with_sort("id")
            .with_filter(json!({"tags": {"eq_set": [2, 1]}})),
    );
    // 10 has {1, 2}, 12 has {2, 1}; 11 and 13 hold strict subsets.
    assert_eq!(ids(&result.data), vec![10, 12]);
}

#[test]
fn nested_combinators_keep_their_grouping() {
    let filter = json!({"and": [
        {"id": {"eq": 1}},
        {"or": [{"name": {"eq": "ann"}}, {"name": {"eq": "bob"}}]}
    ]});
    let result = find("users", FindRequest::new().with_fields("name").with_filter(filter));
    assert_eq!(result.data, vec![json!({"id": 1, "name": "ann"})]);

    let filter = json!({"or": [
        {"id": {"eq": 3}},
        {"and": [{"name": {"eq": "bob"}}, {"email": {"is_null": true}}]}
    ]});
    let result = find("users", FindRequest::new().with_fields("id").with_filter(filter));
    assert_eq!(ids(&result.data), vec![2, 3]);
}

#[test]
fn filter_and_projection_share_one_join() {
    let catalog = common::catalog();
    let request = FindRequest::new()
        .with_fields("title,author.name")
        .with_sort("id")
        .with_filter(json!({"author": {"name": {"eq": "ann"}}}));
    let plan = compile_find(&catalog, "posts", &request, &CompileOptions::default()).expect("compile");
    assert_eq!(plan.data.sql.matches("LEFT JOIN \"users\"").count(), 1);

    let result = find("posts", request);
    assert_eq!(
        result.data,
        vec![
            json!({"id": 10, "title": "Café culture", "author": {"id": 1, "name": "ann"}}),
            json!({"id": 11, "title": "Rust tips", "author": {"id": 1, "name": "ann"}}),
        ]
    );
}

#[test]
fn pagination_and_meta_counts() {
    let result = find(
        "posts",
        FindRequest::new()
            .with_fields("id")
            .with_sort("id")
            .with_limit(2)
            .with_page(2)
            .with_meta("*")
            .with_filter(json!({"score": {"gte": 1}})),
    );
    assert_eq!(ids(&result.data), vec![12]);
    let meta = result.meta.expect("meta");
    assert_eq!(meta.total_count, Some(4));
    assert_eq!(meta.filter_count, Some(3));

    let unbounded = find("posts", FindRequest::new().with_fields("id").with_limit(0));
    assert_eq!(unbounded.data.len(), 4);
}

#[test]
fn to_many_pages_count_records() {
    let result = find(
        "posts",
        FindRequest::new()
            .with_fields("title,tags")
            .with_sort("-score")
            .with_limit(2),
    );
    assert_eq!(
        result.data,
        vec![
            json!({"id": 10, "title": "Café culture", "tags": [1, 2]}),
            json!({"id": 11, "title": "Rust tips", "tags": [2]}),
        ]
    );
}

#[test]
fn relation_counts_and_empty_lists() {
    let result = find(
        "users",
        FindRequest::new()
            .with_fields("id")
            .with_filter(json!({"posts": {"count": {"gte": 2}}})),
    );
    assert_eq!(ids(&result.data), vec![1]);

    let (registry, _) = common::registry();
    let users = registry.repository("users").expect("users");
    users.create(&json!({"name": "dee"})).expect("create");
    let by_count = |cmp: Value| {
        let request = FindRequest::new()
            .with_fields("id")
            .with_sort("id")
            .with_filter(json!({"posts": {"count": cmp}}));
        ids(&users.find(&request).expect("find").data)
    };
    // dee has no posts; cy has exactly one.
    assert_eq!(by_count(json!({"eq": 0})), vec![4]);
    assert_eq!(by_count(json!({"eq": 1})), vec![2, 3]);
    assert_eq!(by_count(json!({"lt": 2})), vec![2, 3, 4]);

    let none = find("users", FindRequest::new().with_filter(json!({"id": {"in": []}})));
    assert!(none.data.is_empty());
    let all = find("users", FindRequest::new().with_filter(json!({"id": {"not_in": []}})));
    assert_eq!(all.data.len(), 3);
}

#[test]
fn sorts_follow_to_one_chains() {
    let result = find(
        "posts",
        FindRequest::new().with_fields("id").with_sort("-author.name,id"),
    );
    assert_eq!(ids(&result.data), vec![13, 12, 10, 11]);

    let catalog = common::catalog();
    let err = compile_find(
        &catalog,
        "users",
        &FindRequest::new().with_sort("posts.title"),
        &CompileOptions::default(),
    )
    .expect_err("to-many sort");
    assert!(matches!(err, CompileError::InvalidSort { .. }));
}

#[test]
fn accent_insensitive_text_operators() {
    let result = find(
        "posts",
        FindRequest::new()
            .with_fields("title")
            .with_filter(json!({"title": {"starts_with": "cafe"}})),
    );
    assert_eq!(result.data, vec![json!({"id": 10, "title": "Café culture"})]);

    for wildcard in ["%", "_", "c_fe"] {
        let result = find(
            "posts",
            FindRequest::new()
                .with_fields("id")
                .with_filter(json!({"title": {"contains": wildcard}})),
        );
        assert!(result.data.is_empty(), "{wildcard}");
    }
}

#[test]
fn bare_finds_load_to_many_keys_without_joining() {
    let catalog = common::catalog();
    let plan = compile_find(&catalog, "users", &FindRequest::new().with_sort("id"), &CompileOptions::default())
        .expect("compile");
    assert!(!plan.data.sql.contains("\"posts\""));
    assert_eq!(plan.projection.deferred.len(), 1);

    let result = find("users", FindRequest::new().with_sort("id").with_limit(2));
    assert_eq!(
        result.data,
        vec![
            json!({"id": 1, "name": "ann", "email": "ann@example.com", "roleId": 1, "role": 1, "posts": [10, 11]}),
            json!({"id": 2, "name": "bob", "email": null, "roleId": 2, "role": 2, "posts": [12]}),
        ]
    );

    let posts = find("posts", FindRequest::new().with_sort("id").with_limit(0));
    let tags: Vec<_> = posts.data.iter().map(|p| p["tags"].clone()).collect();
    assert_eq!(tags, vec![json!([1, 2]), json!([2]), json!([1, 2]), json!([1])]);
}

#[test]
fn unresolved_paths_follow_the_policy() {
    let catalog = common::catalog();
    let request = FindRequest::new().with_filter(json!({"titel": {"eq": "x"}}));
    let lenient = compile_find(&catalog, "posts", &request, &CompileOptions::default()).expect("lenient");
    assert_eq!(lenient.skipped, vec!["titel".to_string()]);
    assert!(lenient.data.params.is_empty());
    assert!(!lenient.data.sql.contains("titel"));

    let err = compile_find(&catalog, "posts", &request, &CompileOptions::strict()).expect_err("strict");
    assert!(matches!(err, CompileError::UnresolvedPath { .. }));

    let (registry, _) = common::registry();
    let strict = registry.with_options(CompileOptions::strict());
    let err = strict
        .repository("posts")
        .expect("repository")
        .find(&request)
        .expect_err("strict find");
    assert!(matches!(err, Error::Compile(CompileError::UnresolvedPath { .. })));
    assert_eq!(err.status_code(), 400);
}

#[test]
fn aggregates_count_each_filtered_record_once() {
    let result = find(
        "users",
        FindRequest::new()
            .with_fields("id")
            .with_sort("id")
            .with_filter(json!({"posts": {"score": {"gte": 0}}}))
            .with_aggregate(json!({"sum": "id", "count": "posts", "max": "posts.score"})),
    );
    assert_eq!(ids(&result.data), vec![1, 2, 3]);
    let aggregate = result.meta.and_then(|m| m.aggregate).expect("aggregate");
    assert_eq!(
        Value::Object(aggregate),
        json!({"sum": {"id": 6}, "count": {"posts": 4}, "max": {"posts.score": 4.5}})
    );

    let result = find(
        "users",
        FindRequest::new().with_fields("id").with_aggregate(json!({
            "count": {"field": "id", "condition": {"posts": {"score": {"gte": 1}}}, "as": "active"}
        })),
    );
    let aggregate = result.meta.and_then(|m| m.aggregate).expect("aggregate");
    // ann's two qualifying posts still count her once.
    assert_eq!(Value::Object(aggregate), json!({"count": {"active": 2}}));
}

#[test]
fn conditioned_aggregates_reach_through_relations() {
    let result = find(
        "posts",
        FindRequest::new().with_fields("id").with_aggregate(json!({
            "count": {"field": "id", "condition": {"author": {"name": {"eq": "ann"}}}, "as": "byAnn"},
            "max": "score",
            "avg": {"field": "score", "condition": {"score": {"lt": 2}}, "as": "low"}
        })),
    );
    let aggregate = result.meta.and_then(|m| m.aggregate).expect("aggregate");
    assert_eq!(
        Value::Object(aggregate),
        json!({"count": {"byAnn": 2}, "max": {"score": 4.5}, "avg": {"low": 0.75}})
    );
}
