#![allow(missing_docs)]

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use dyncore::executor::{
    ExecutionError, ExecutionRequest, ExecutorOptions, HandlerExecutor, HostCapabilities,
    PoolOptions, ProcessSpawner, ScriptContext, WorkerPool,
};
use serde_json::json;

fn executor(size: usize) -> HandlerExecutor {
    let pool = WorkerPool::new(
        Arc::new(ProcessSpawner::new(env!("CARGO_BIN_EXE_dyncore"))),
        PoolOptions {
            size,
            prewarm: 1,
            ..PoolOptions::default()
        },
    );
    let (registry, _) = common::registry();
    HandlerExecutor::new(
        pool,
        Arc::new(HostCapabilities::new(registry)),
        ExecutorOptions::default(),
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn process_workers_serve_repository_calls() {
    let executor = executor(1);
    assert_eq!(executor.pool().prewarm().await.expect("prewarm"), 1);

    let context = ScriptContext {
        params: json!({"id": 10}),
        main_table: Some("posts".into()),
        ..ScriptContext::default()
    };
    let script = r#"
        let post = repos.main.find_one(params.id);
        print(`loaded ${post.title}`);
        #{ title: post.title, tags: post.tags, slug: helpers::slugify(post.title) }
    "#;
    let value = executor
        .run(ExecutionRequest::new(script).with_context(context))
        .await
        .expect("run");
    assert_eq!(
        value,
        json!({"title": "Café culture", "tags": [1, 2], "slug": "cafe-culture"})
    );

    let err = executor
        .run(ExecutionRequest::new(r#"errors::throw403("members only")"#))
        .await
        .expect_err("forbidden");
    assert_eq!(err, ExecutionError::Forbidden("members only".into()));
    assert_eq!(executor.pool().live_count(), 1);
    executor.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn process_workers_are_killed_on_timeout() {
    let executor = executor(1);
    let started = Instant::now();
    let request = ExecutionRequest::new("let n = 0; loop { n += 1; }")
        .with_timeout(Duration::from_millis(200));
    let mut options = ExecutorOptions::default();
    options.limits.max_operations = 0;
    let err = HandlerExecutor::new(
        executor.pool().clone(),
        Arc::new(HostCapabilities::new(common::registry().0)),
        options,
    )
    .run(request)
    .await
    .expect_err("runaway");
    assert_eq!(err, ExecutionError::Timeout { timeout_ms: 200 });
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(executor.pool().live_count(), 0);

    let value = executor
        .run(ExecutionRequest::new("21 * 2"))
        .await
        .expect("replacement worker");
    assert_eq!(value, json!(42));
    executor.shutdown();
}
