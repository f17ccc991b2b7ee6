#![allow(missing_docs)]

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dyncore::executor::{
    CallError, Capabilities, ExecutionError, ExecutionRequest, ExecutorOptions, HandlerExecutor,
    HostCapabilities, PoolOptions, ScriptContext, ThreadSpawner, WorkerPool,
};
use serde_json::{json, Value};
use tokio::task::JoinSet;

/// Helpers that record how many calls overlap.
#[derive(Default)]
struct Gauge {
    current: AtomicUsize,
    peak: AtomicUsize,
}

#[async_trait]
impl Capabilities for Gauge {
    fn tables(&self) -> Vec<String> {
        Vec::new()
    }

    fn helper_names(&self) -> Vec<String> {
        vec!["hold".into(), "stall".into()]
    }

    async fn invoke(&self, _context: &ScriptContext, path: &str, args: Vec<Value>) -> Result<Value, CallError> {
        match path {
            "helpers.hold" => {
                let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(40)).await;
                self.current.fetch_sub(1, Ordering::SeqCst);
                Ok(args.into_iter().next().unwrap_or(Value::Null))
            }
            "helpers.stall" => std::future::pending().await,
            other => Err(CallError::status(400, format!("unknown capability '{other}'"))),
        }
    }
}

fn pool(size: usize) -> Arc<WorkerPool> {
    WorkerPool::new(
        Arc::new(ThreadSpawner),
        PoolOptions {
            size,
            ..PoolOptions::default()
        },
    )
}

fn host_executor(size: usize) -> HandlerExecutor {
    let (registry, _) = common::registry();
    HandlerExecutor::new(
        pool(size),
        Arc::new(HostCapabilities::new(registry)),
        ExecutorOptions::default(),
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrency_never_exceeds_the_pool_size() {
    let gauge = Arc::new(Gauge::default());
    let executor = Arc::new(HandlerExecutor::new(
        pool(2),
        gauge.clone(),
        ExecutorOptions::default(),
    ));

    let mut runs = JoinSet::new();
    for i in 0..6 {
        let executor = Arc::clone(&executor);
        runs.spawn(async move {
            let context = ScriptContext {
                args: json!({"n": i}),
                ..ScriptContext::default()
            };
            executor
                .run(ExecutionRequest::new("helpers::hold(args.n) * 10").with_context(context))
                .await
        });
    }
    let mut results = Vec::new();
    while let Some(joined) = runs.join_next().await {
        results.push(joined.expect("join").expect("run"));
    }
    results.sort_by_key(|v| v.as_i64());
    assert_eq!(results, (0..6).map(|i| json!(i * 10)).collect::<Vec<_>>());
    let peak = gauge.peak.load(Ordering::SeqCst);
    assert!((1..=2).contains(&peak), "peak {peak}");
    assert!(executor.pool().live_count() <= 2);
    assert_eq!(executor.pool().busy_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn timeouts_kill_the_worker_and_free_the_slot() {
    let executor = HandlerExecutor::new(pool(1), Arc::new(Gauge::default()), ExecutorOptions::default());

    let started = Instant::now();
    let err = executor
        .run(ExecutionRequest::new("helpers::stall()").with_timeout(Duration::from_millis(150)))
        .await
        .expect_err("stalled");
    assert_eq!(err, ExecutionError::Timeout { timeout_ms: 150 });
    assert_eq!(err.status_code(), 504);
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(executor.pool().idle_count(), 0);
    assert_eq!(executor.pool().live_count(), 0);

    let err = executor
        .run(ExecutionRequest::new("loop { let x = 1; }").with_timeout(Duration::from_millis(100)))
        .await
        .expect_err("runaway");
    assert!(matches!(
        err,
        ExecutionError::Timeout { .. } | ExecutionError::Internal { .. }
    ));

    let value = executor
        .run(ExecutionRequest::new("helpers::hold(7)"))
        .await
        .expect("fresh worker");
    assert_eq!(value, json!(7));
    assert_eq!(executor.pool().live_count(), 1);
}

#[tokio::test]
async fn script_failures_map_to_statuses() {
    let executor = host_executor(1);
    let cases = [
        (r#"errors::throw400("bad input")"#, 400, "BadRequest"),
        (r#"errors::throw401("log in")"#, 401, "Unauthorized"),
        (r#"throw #{ statusCode: 403, message: "nope" }"#, 403, "Forbidden"),
        (r#"throw "boom""#, 500, "ScriptRuntimeError"),
        ("repos.users.delete(99)", 500, "ScriptRuntimeError"),
        ("helpers::missing()", 500, "ScriptRuntimeError"),
    ];
    for (script, status, code) in cases {
        let err = executor
            .run(ExecutionRequest::new(script))
            .await
            .expect_err(script);
        assert_eq!(err.status_code(), status, "{script}");
        assert_eq!(err.code(), code, "{script}");
    }
    let err = executor
        .run(ExecutionRequest::new(r#"errors::throw400("bad input")"#))
        .await
        .expect_err("400");
    assert_eq!(err, ExecutionError::BadRequest("bad input".into()));

    // Script failures leave the worker healthy.
    assert_eq!(executor.pool().live_count(), 1);
    assert_eq!(executor.pool().idle_count(), 1);
}

#[tokio::test]
async fn scripts_reach_repositories_through_the_host() {
    let executor = host_executor(2);
    let context = ScriptContext {
        body: json!({"name": "Dee Dee"}),
        params: json!({"role": 2}),
        main_table: Some("users".into()),
        ..ScriptContext::default()
    };
    let script = r#"
        let user = repos.main.create(#{ name: helpers::slugify(body.name), role: params.role });
        let page = repos.users.find(#{
            fields: "name",
            filter: #{ role: #{ id: #{ eq: params.role } } },
            sort: "id"
        });
        let names = [];
        for row in page.data { names.push(row.name); }
        #{ created: user.id, names: names, missing: repos.users.find_one(99) }
    "#;
    let value = executor
        .run(ExecutionRequest::new(script).with_context(context))
        .await
        .expect("run");
    assert_eq!(
        value,
        json!({"created": 4, "names": ["bob", "cy", "dee-dee"], "missing": null})
    );

    let err = executor
        .run(ExecutionRequest::new("repos.main.find()"))
        .await
        .expect_err("no main table");
    assert_eq!(err.status_code(), 500);
}

#[tokio::test]
async fn workers_are_reused_and_acquire_can_time_out() {
    let gauge = Arc::new(Gauge::default());
    let pool = WorkerPool::new(
        Arc::new(ThreadSpawner),
        PoolOptions {
            size: 1,
            acquire_timeout: Some(Duration::from_millis(50)),
            ..PoolOptions::default()
        },
    );
    let executor = HandlerExecutor::new(pool.clone(), gauge, ExecutorOptions::default());

    for n in 0..3 {
        let value = executor
            .run(ExecutionRequest::new(format!("{n} + 1")))
            .await
            .expect("run");
        assert_eq!(value, json!(n + 1));
    }
    assert_eq!(pool.live_count(), 1);
    assert_eq!(pool.idle_count(), 1);

    let held = pool.acquire().await.expect("lease");
    let err = executor
        .run(ExecutionRequest::new("1"))
        .await
        .expect_err("exhausted");
    assert_eq!(err, ExecutionError::AcquireTimeout);
    assert_eq!(err.status_code(), 503);
    held.release();

    executor.shutdown();
    let err = executor.run(ExecutionRequest::new("1")).await.expect_err("closed");
    assert_eq!(err, ExecutionError::PoolClosed);
}
