#![allow(missing_docs)]

mod common;

use dyncore::query::{CompileOptions, FindRequest};
use dyncore::repository::{CacheService, ProtectionViolation};
use dyncore::Error;
use serde_json::{json, Value};

fn protection(err: Error) -> ProtectionViolation {
    match err {
        Error::Protection(violation) => violation,
        other => panic!("expected a protection violation, got {other:?}"),
    }
}

#[test]
fn system_records_only_accept_exempt_fields() {
    let (registry, _) = common::registry();
    let roles = registry.repository("roles").expect("roles");

    let updated = roles
        .update(&json!(1), &json!({"description": "built in", "name": "admin"}))
        .expect("exempt field and unchanged name");
    assert_eq!(updated["description"], json!("built in"));

    let err = roles.update(&json!(1), &json!({"name": "root"})).expect_err("rename");
    assert_eq!(err.status_code(), 403);
    let violation = protection(err);
    assert_eq!(violation.code(), "SystemField");
    assert!(matches!(violation, ProtectionViolation::Field { ref field, .. } if field == "name"));

    let err = roles.update(&json!(1), &json!({"isSystem": false})).expect_err("unflag");
    assert!(matches!(protection(err), ProtectionViolation::Field { .. }));

    let unchanged = roles.find_one(&json!(1)).expect("find").expect("row");
    assert_eq!(unchanged["name"], json!("admin"));
}

#[test]
fn system_records_cannot_be_created_or_deleted() {
    let (registry, _) = common::registry();
    let roles = registry.repository("roles").expect("roles");

    let err = roles
        .create(&json!({"name": "ghost", "isSystem": true}))
        .expect_err("system create");
    assert!(matches!(protection(err), ProtectionViolation::Create { .. }));

    let err = roles.delete(&json!(1)).expect_err("system delete");
    assert!(matches!(protection(err), ProtectionViolation::Delete { .. }));

    let created = roles
        .create(&json!({"name": "guest", "isSystem": false}))
        .expect("plain create");
    assert_eq!(created["name"], json!("guest"));
    roles.delete(&created["id"]).expect("plain delete");
    assert!(roles.find_one(&created["id"]).expect("find").is_none());
}

#[test]
fn system_targets_cannot_be_linked_or_unlinked() {
    let (registry, _) = common::registry();
    let posts = registry.repository("posts").expect("posts");

    let err = posts.update(&json!(11), &json!({"tags": [2, 3]})).expect_err("attach pinned");
    let violation = protection(err);
    assert!(matches!(
        violation,
        ProtectionViolation::Relation { action: "attach", ref relation, .. } if relation == "tags"
    ));

    let err = posts
        .create(&json!({"title": "Pinned", "score": 1, "tags": [3]}))
        .expect_err("create linked to pinned");
    assert!(matches!(protection(err), ProtectionViolation::Relation { .. }));

    // ann belongs to the system admin role; moving her detaches it.
    let users = registry.repository("users").expect("users");
    let err = users.update(&json!(1), &json!({"role": 2})).expect_err("leave admin");
    assert!(matches!(
        protection(err),
        ProtectionViolation::Relation { action: "detach", .. }
    ));
    let err = users.update(&json!(2), &json!({"role": {"id": 1}})).expect_err("join admin");
    assert!(matches!(
        protection(err),
        ProtectionViolation::Relation { action: "attach", .. }
    ));

    let bob = users.update(&json!(2), &json!({"role": null, "email": "bob@example.com"})).expect("clear role");
    assert_eq!(bob["roleId"], json!(null));
    assert_eq!(bob["email"], json!("bob@example.com"));
}

#[test]
fn junction_links_are_rewritten_as_a_set() {
    let (registry, _) = common::registry();
    let posts = registry.repository("posts").expect("posts");

    let post = posts.update(&json!(10), &json!({"tags": [2]})).expect("detach news");
    assert_eq!(post["tags"], json!([2]));

    let post = posts.update(&json!(13), &json!({"tags": [{"id": 2}, 1, 2]})).expect("attach tech");
    assert_eq!(post["tags"], json!([1, 2]));

    let created = posts
        .create(&json!({"title": "New", "score": 2.5, "author": 3, "tags": [1]}))
        .expect("create with links");
    assert_eq!(created["authorId"], json!(3));
    assert_eq!(created["tags"], json!([1]));

    let tagged = posts
        .find(
            &FindRequest::new()
                .with_fields("id")
                .with_sort("id")
                .with_filter(json!({"tags": {"eq_set": [1]}})),
        )
        .expect("find");
    let ids: Vec<_> = tagged.data.iter().map(|row| row["id"].clone()).collect();
    // 13 now carries {1, 2}; only the new post holds exactly {1}.
    assert_eq!(ids, vec![created["id"].clone()]);
}

#[test]
fn direct_to_many_links_move_foreign_keys() {
    let (registry, _) = common::registry();
    let roles = registry.repository("roles").expect("roles");

    let editor = roles.update(&json!(2), &json!({"users": [3]})).expect("drop bob");
    assert_eq!(editor["users"], json!([3]));
    let users = registry.repository("users").expect("users");
    let bob = users.find_one(&json!(2)).expect("find").expect("bob");
    assert_eq!(bob["roleId"], json!(null));

    // The admin role is a system record and its users relation is not exempt.
    let err = roles.update(&json!(1), &json!({"users": [1, 2]})).expect_err("grow admin");
    assert!(matches!(protection(err), ProtectionViolation::Field { ref field, .. } if field == "users"));
    roles.update(&json!(1), &json!({"users": [1]})).expect("same set is a no-op");
}

#[test]
fn mutations_invalidate_the_table_cache_scope() {
    let (registry, cache) = common::registry();
    let loaded = cache
        .get_or_load("routes", "GET /roles", &mut || -> dyncore::Result<Value> { Ok(json!({"cached": true})) })
        .expect("load");
    assert_eq!(*loaded, json!({"cached": true}));
    assert_eq!(cache.len("routes"), 1);
    assert_eq!(cache.generation("routes"), 0);

    registry
        .repository("users")
        .expect("users")
        .update(&json!(3), &json!({"name": "cyd"}))
        .expect("update user");
    assert_eq!(cache.generation("routes"), 0);

    registry
        .repository("roles")
        .expect("roles")
        .update(&json!(2), &json!({"name": "writer"}))
        .expect("update role");
    assert_eq!(cache.generation("routes"), 1);
    assert_eq!(cache.len("routes"), 0);
}

#[test]
fn unknown_payload_fields_follow_the_policy() {
    let (registry, _) = common::registry();
    let users = registry.repository("users").expect("users");
    let user = users
        .update(&json!(3), &json!({"name": "cy", "nickname": "c"}))
        .expect("lenient update");
    assert_eq!(user["name"], json!("cy"));

    let strict = registry.with_options(CompileOptions::strict());
    let err = strict
        .repository("users")
        .expect("users")
        .update(&json!(3), &json!({"nickname": "c"}))
        .expect_err("strict update");
    assert!(matches!(err, Error::InvalidArgument(_)));
    assert_eq!(err.status_code(), 400);

    let err = users.update(&json!(99), &json!({"name": "x"})).expect_err("missing");
    assert!(matches!(err, Error::NotFound { .. }));
    assert_eq!(err.status_code(), 404);
}
