//! Blog-shaped catalog shared by the query unit tests.

use crate::catalog::{RelationDef, ScalarType, SchemaCatalog, TableDef};

pub(crate) fn blog_catalog() -> SchemaCatalog {
    SchemaCatalog::new(vec![
        TableDef::new("users")
            .with_column("name", ScalarType::Text)
            .with_nullable("email", ScalarType::Text)
            .with_column("age", ScalarType::Int)
            .with_column("active", ScalarType::Bool)
            .with_relation(RelationDef::many("posts", "posts", "id", "authorId")),
        TableDef::new("posts")
            .with_column("title", ScalarType::Text)
            .with_column("authorId", ScalarType::Int)
            .with_column("score", ScalarType::Float)
            .with_nullable("createdAt", ScalarType::DateTime)
            .with_relation(RelationDef::one("author", "users", "authorId", "id"))
            .with_relation(RelationDef::many_through(
                "tags", "tags", "post_tags", "postId", "tagId",
            )),
        TableDef::new("tags").with_column("label", ScalarType::Text),
    ])
    .expect("blog catalog is valid")
}
