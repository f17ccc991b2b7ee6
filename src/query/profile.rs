use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Instant;

/// A snapshot of find profiling metrics.
///
/// Profiling is enabled via the `DYNCORE_PROFILE` environment variable and
/// tracks time spent in each phase of a find.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryProfileSnapshot {
    /// Total nanoseconds spent compiling requests into statements.
    pub compile_ns: u64,
    /// Number of compilations.
    pub compile_count: u64,
    /// Total nanoseconds spent running data statements.
    pub execute_ns: u64,
    /// Number of data statements run.
    pub execute_count: u64,
    /// Total nanoseconds spent hydrating rows into records.
    pub hydrate_ns: u64,
    /// Number of hydrations.
    pub hydrate_count: u64,
    /// Total nanoseconds spent on count and aggregate statements.
    pub count_ns: u64,
    /// Number of count and aggregate statements run.
    pub count_count: u64,
}

#[derive(Default)]
struct QueryProfileCounters {
    compile_ns: AtomicU64,
    compile_count: AtomicU64,
    execute_ns: AtomicU64,
    execute_count: AtomicU64,
    hydrate_ns: AtomicU64,
    hydrate_count: AtomicU64,
    count_ns: AtomicU64,
    count_count: AtomicU64,
}

static PROFILE_ENABLED: OnceLock<bool> = OnceLock::new();
static PROFILE_COUNTERS: OnceLock<QueryProfileCounters> = OnceLock::new();

fn profiling_enabled() -> bool {
    *PROFILE_ENABLED.get_or_init(|| std::env::var_os("DYNCORE_PROFILE").is_some())
}

fn counters() -> Option<&'static QueryProfileCounters> {
    profiling_enabled().then(|| PROFILE_COUNTERS.get_or_init(QueryProfileCounters::default))
}

pub(crate) fn profile_timer() -> Option<Instant> {
    profiling_enabled().then(Instant::now)
}

pub(crate) enum QueryProfileKind {
    /// Request compilation.
    Compile,
    /// Data statement execution.
    Execute,
    /// Row hydration.
    Hydrate,
    /// Count and aggregate statements.
    Count,
}

pub(crate) fn record_profile_timer(kind: QueryProfileKind, start: Option<Instant>) {
    let Some(start) = start else {
        return;
    };
    let Some(counters) = counters() else {
        return;
    };
    let nanos = start.elapsed().as_nanos().min(u64::MAX as u128) as u64;
    let (ns, count) = match kind {
        QueryProfileKind::Compile => (&counters.compile_ns, &counters.compile_count),
        QueryProfileKind::Execute => (&counters.execute_ns, &counters.execute_count),
        QueryProfileKind::Hydrate => (&counters.hydrate_ns, &counters.hydrate_count),
        QueryProfileKind::Count => (&counters.count_ns, &counters.count_count),
    };
    ns.fetch_add(nanos, Ordering::Relaxed);
    count.fetch_add(1, Ordering::Relaxed);
}

/// Retrieves a snapshot of current find profiling metrics.
///
/// Returns `None` unless `DYNCORE_PROFILE` is set. With `reset`, counters
/// are zeroed as they are read.
///
/// ```no_run
/// use dyncore::query::profile::profile_snapshot;
///
/// if let Some(snapshot) = profile_snapshot(false) {
///     println!("compile time: {}ns", snapshot.compile_ns);
/// }
/// ```
pub fn profile_snapshot(reset: bool) -> Option<QueryProfileSnapshot> {
    let counters = counters()?;
    let load = |counter: &AtomicU64| {
        if reset {
            counter.swap(0, Ordering::Relaxed)
        } else {
            counter.load(Ordering::Relaxed)
        }
    };
    Some(QueryProfileSnapshot {
        compile_ns: load(&counters.compile_ns),
        compile_count: load(&counters.compile_count),
        execute_ns: load(&counters.execute_ns),
        execute_count: load(&counters.execute_count),
        hydrate_ns: load(&counters.hydrate_ns),
        hydrate_count: load(&counters.hydrate_count),
        count_ns: load(&counters.count_ns),
        count_count: load(&counters.count_count),
    })
}
