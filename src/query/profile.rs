use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Instant;

/// A snapshot of link-engine profiling metrics.
///
/// Profiling is enabled via the `LINKGRAPH_PROFILE` environment variable and
/// tracks time spent in each phase of query resolution and cascade handling.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryProfileSnapshot {
    /// Total nanoseconds spent turning query specs into plans.
    pub plan_ns: u64,
    /// Number of plans built.
    pub plan_count: u64,
    /// Total nanoseconds spent waiting on store fetches.
    pub fetch_ns: u64,
    /// Number of store fetches.
    pub fetch_count: u64,
    /// Total nanoseconds spent attaching children to parents.
    pub assemble_ns: u64,
    /// Number of assembly passes.
    pub assemble_count: u64,
    /// Total nanoseconds spent building cascade plans.
    pub cascade_plan_ns: u64,
    /// Number of cascade plans built.
    pub cascade_plan_count: u64,
    /// Total nanoseconds spent applying cascade plans.
    pub cascade_apply_ns: u64,
    /// Number of cascade plans applied.
    pub cascade_apply_count: u64,
}

#[derive(Default)]
struct QueryProfileCounters {
    plan_ns: AtomicU64,
    plan_count: AtomicU64,
    fetch_ns: AtomicU64,
    fetch_count: AtomicU64,
    assemble_ns: AtomicU64,
    assemble_count: AtomicU64,
    cascade_plan_ns: AtomicU64,
    cascade_plan_count: AtomicU64,
    cascade_apply_ns: AtomicU64,
    cascade_apply_count: AtomicU64,
}

static PROFILE_ENABLED: OnceLock<bool> = OnceLock::new();
static PROFILE_COUNTERS: OnceLock<QueryProfileCounters> = OnceLock::new();

fn profiling_enabled() -> bool {
    *PROFILE_ENABLED.get_or_init(|| std::env::var_os("LINKGRAPH_PROFILE").is_some())
}

fn counters() -> Option<&'static QueryProfileCounters> {
    profiling_enabled().then(|| PROFILE_COUNTERS.get_or_init(QueryProfileCounters::default))
}

pub(crate) fn profile_timer() -> Option<Instant> {
    profiling_enabled().then(Instant::now)
}

pub(crate) enum QueryProfileKind {
    /// Spec parsing and plan construction.
    Plan,
    /// One store fetch.
    Fetch,
    /// Attaching fetched documents to their parents.
    Assemble,
    /// Walking the dependent-link index into a cascade plan.
    CascadePlan,
    /// Replaying a cascade plan against the store.
    CascadeApply,
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
        QueryProfileKind::Plan => (&counters.plan_ns, &counters.plan_count),
        QueryProfileKind::Fetch => (&counters.fetch_ns, &counters.fetch_count),
        QueryProfileKind::Assemble => (&counters.assemble_ns, &counters.assemble_count),
        QueryProfileKind::CascadePlan => {
            (&counters.cascade_plan_ns, &counters.cascade_plan_count)
        }
        QueryProfileKind::CascadeApply => {
            (&counters.cascade_apply_ns, &counters.cascade_apply_count)
        }
    };
    ns.fetch_add(nanos, Ordering::Relaxed);
    count.fetch_add(1, Ordering::Relaxed);
}

/// Retrieves a snapshot of current profiling metrics.
///
/// Returns `None` when `LINKGRAPH_PROFILE` is unset. With `reset` the
/// counters are zeroed as they are read.
///
/// ```no_run
/// use linkgraph::query::profile::profile_snapshot;
///
/// if let Some(snapshot) = profile_snapshot(false) {
///     println!("fetches: {} in {}ns", snapshot.fetch_count, snapshot.fetch_ns);
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
        plan_ns: load(&counters.plan_ns),
        plan_count: load(&counters.plan_count),
        fetch_ns: load(&counters.fetch_ns),
        fetch_count: load(&counters.fetch_count),
        assemble_ns: load(&counters.assemble_ns),
        assemble_count: load(&counters.assemble_count),
        cascade_plan_ns: load(&counters.cascade_plan_ns),
        cascade_plan_count: load(&counters.cascade_plan_count),
        cascade_apply_ns: load(&counters.cascade_apply_ns),
        cascade_apply_count: load(&counters.cascade_apply_count),
    })
}
