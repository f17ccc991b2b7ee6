#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dyncore::catalog::{SchemaCatalog, StaticCatalog};
use dyncore::repository::{RepositoryRegistry, ScopedCache};
use dyncore::store::SqliteStore;
use tempfile::TempDir;

pub const CATALOG: &str = r#"{
  "tables": [
    {
      "name": "roles",
      "columns": [
        {"name": "id", "type": "int"},
        {"name": "name", "type": "text"},
        {"name": "description", "type": "text", "nullable": true},
        {"name": "isSystem", "type": "bool"}
      ],
      "relations": [
        {"name": "users", "cardinality": "many", "targetTable": "users", "joinKey": "id", "inverseJoinKey": "roleId"}
      ],
      "systemFlag": "isSystem",
      "exemptFields": ["description"],
      "cacheScope": "routes"
    },
    {
      "name": "users",
      "columns": [
        {"name": "id", "type": "int"},
        {"name": "name", "type": "text"},
        {"name": "email", "type": "text", "nullable": true},
        {"name": "roleId", "type": "int", "nullable": true}
      ],
      "relations": [
        {"name": "role", "cardinality": "one", "targetTable": "roles", "joinKey": "roleId", "inverseJoinKey": "id"},
        {"name": "posts", "cardinality": "many", "targetTable": "posts", "joinKey": "id", "inverseJoinKey": "authorId"}
      ]
    },
    {
      "name": "posts",
      "columns": [
        {"name": "id", "type": "int"},
        {"name": "title", "type": "text"},
        {"name": "authorId", "type": "int", "nullable": true},
        {"name": "score", "type": "float"}
      ],
      "relations": [
        {"name": "author", "cardinality": "one", "targetTable": "users", "joinKey": "authorId", "inverseJoinKey": "id"},
        {"name": "tags", "cardinality": "many", "targetTable": "tags", "joinKey": "id", "inverseJoinKey": "id",
         "junction": {"table": "post_tags", "sourceKey": "postId", "targetKey": "tagId"}}
      ]
    },
    {
      "name": "tags",
      "columns": [
        {"name": "id", "type": "int"},
        {"name": "label", "type": "text"},
        {"name": "isSystem", "type": "bool"}
      ],
      "systemFlag": "isSystem"
    }
  ]
}"#;

const SCHEMA: &str = "
CREATE TABLE roles (id INTEGER PRIMARY KEY, name TEXT NOT NULL, description TEXT, isSystem INTEGER NOT NULL DEFAULT 0);
CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT NOT NULL, email TEXT, roleId INTEGER REFERENCES roles(id));
CREATE TABLE posts (id INTEGER PRIMARY KEY, title TEXT NOT NULL, authorId INTEGER REFERENCES users(id), score REAL NOT NULL DEFAULT 0);
CREATE TABLE tags (id INTEGER PRIMARY KEY, label TEXT NOT NULL, isSystem INTEGER NOT NULL DEFAULT 0);
CREATE TABLE post_tags (postId INTEGER NOT NULL REFERENCES posts(id), tagId INTEGER NOT NULL REFERENCES tags(id), PRIMARY KEY (postId, tagId));

INSERT INTO roles VALUES (1, 'admin', NULL, 1), (2, 'editor', NULL, 0);
INSERT INTO users VALUES (1, 'ann', 'ann@example.com', 1), (2, 'bob', NULL, 2), (3, 'cy', NULL, 2);
INSERT INTO posts VALUES (10, 'Café culture', 1, 4.5), (11, 'Rust tips', 1, 3.0), (12, 'Hello', 2, 1.0), (13, 'Draft', 3, 0.5);
INSERT INTO tags VALUES (1, 'news', 0), (2, 'tech', 0), (3, 'pinned', 1);
INSERT INTO post_tags VALUES (10, 1), (10, 2), (11, 2), (12, 2), (12, 1), (13, 1);
";

pub fn catalog() -> SchemaCatalog {
    SchemaCatalog::from_json(CATALOG).expect("catalog parses")
}

pub fn seeded_store() -> SqliteStore {
    let store = SqliteStore::open_in_memory().expect("open store");
    store.execute_batch(SCHEMA).expect("seed schema");
    store
}

pub fn registry() -> (RepositoryRegistry, Arc<ScopedCache>) {
    let cache = Arc::new(ScopedCache::default());
    let registry = RepositoryRegistry::new(
        Arc::new(StaticCatalog::new(catalog())),
        Arc::new(seeded_store()),
    )
    .with_cache(cache.clone());
    (registry, cache)
}

/// Writes the catalog and a seeded database file into a fresh temp dir.
pub fn on_disk() -> (TempDir, PathBuf, PathBuf) {
    let dir = TempDir::new().expect("tempdir");
    let catalog = dir.path().join("catalog.json");
    std::fs::write(&catalog, CATALOG).expect("write catalog");
    let db = dir.path().join("app.db");
    seed_file(&db);
    (dir, catalog, db)
}

fn seed_file(path: &Path) {
    let store = SqliteStore::open(path).expect("open file store");
    store.execute_batch(SCHEMA).expect("seed schema");
}
