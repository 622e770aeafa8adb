//! Process-wide session and command counters, updated lock-free on the
//! command paths. Per-queue set latency sits behind a mutex since `set`
//! already pays for a journal append.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant};

#[derive(Debug, Default, Clone, Copy)]
struct LatencyAgg {
    count: u64,
    total_us: u64,
    max_us: u64,
}

impl LatencyAgg {
    fn record(&mut self, us: u64) {
        self.count += 1;
        self.total_us += us;
        self.max_us = self.max_us.max(us);
    }
}

struct SessionStats {
    next_session_id: AtomicU64,
    sessions: AtomicUsize,
    total_sessions: AtomicU64,
    cmd_get: AtomicU64,
    cmd_set: AtomicU64,
    cmd_peek: AtomicU64,
    cmd_monitor: AtomicU64,
    protocol_errors: AtomicU64,
    unavailable_errors: AtomicU64,
    items_opened_after_finish: AtomicU64,
    get_latency_count: AtomicU64,
    get_latency_total_us: AtomicU64,
    get_latency_max_us: AtomicU64,
    set_latency_count: AtomicU64,
    set_latency_total_us: AtomicU64,
    set_latency_max_us: AtomicU64,
    set_latency_by_queue: Mutex<BTreeMap<String, LatencyAgg>>,
}

impl SessionStats {
    const fn new() -> Self {
        Self {
            next_session_id: AtomicU64::new(0),
            sessions: AtomicUsize::new(0),
            total_sessions: AtomicU64::new(0),
            cmd_get: AtomicU64::new(0),
            cmd_set: AtomicU64::new(0),
            cmd_peek: AtomicU64::new(0),
            cmd_monitor: AtomicU64::new(0),
            protocol_errors: AtomicU64::new(0),
            unavailable_errors: AtomicU64::new(0),
            items_opened_after_finish: AtomicU64::new(0),
            get_latency_count: AtomicU64::new(0),
            get_latency_total_us: AtomicU64::new(0),
            get_latency_max_us: AtomicU64::new(0),
            set_latency_count: AtomicU64::new(0),
            set_latency_total_us: AtomicU64::new(0),
            set_latency_max_us: AtomicU64::new(0),
            set_latency_by_queue: Mutex::new(BTreeMap::new()),
        }
    }
}

static SESSION_STATS: SessionStats = SessionStats::new();
static STARTED_AT: OnceLock<Instant> = OnceLock::new();

fn as_us(dur: Duration) -> u64 {
    dur.as_micros().min(u128::from(u64::MAX)) as u64
}

/// Stamps the node start time; the first caller wins.
pub fn mark_started() {
    let _ = STARTED_AT.set(Instant::now());
}

pub fn uptime() -> Duration {
    STARTED_AT
        .get()
        .map(|at| at.elapsed())
        .unwrap_or(Duration::ZERO)
}

pub fn next_session_id() -> u64 {
    SESSION_STATS.next_session_id.fetch_add(1, Ordering::Relaxed) + 1
}

/// Registers a new session and returns the session count including it.
pub fn session_opened() -> usize {
    SESSION_STATS.total_sessions.fetch_add(1, Ordering::Relaxed);
    SESSION_STATS.sessions.fetch_add(1, Ordering::AcqRel) + 1
}

pub fn session_closed() {
    let _ = SESSION_STATS
        .sessions
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1));
}

pub fn current_sessions() -> usize {
    SESSION_STATS.sessions.load(Ordering::Acquire)
}

pub fn record_cmd_get() {
    SESSION_STATS.cmd_get.fetch_add(1, Ordering::Relaxed);
}

pub fn record_cmd_set() {
    SESSION_STATS.cmd_set.fetch_add(1, Ordering::Relaxed);
}

pub fn record_cmd_peek() {
    SESSION_STATS.cmd_peek.fetch_add(1, Ordering::Relaxed);
}

pub fn record_cmd_monitor() {
    SESSION_STATS.cmd_monitor.fetch_add(1, Ordering::Relaxed);
}

pub fn record_protocol_error() {
    SESSION_STATS.protocol_errors.fetch_add(1, Ordering::Relaxed);
}

pub fn record_unavailable() {
    SESSION_STATS.unavailable_errors.fetch_add(1, Ordering::Relaxed);
}

pub fn record_item_opened_after_finish() {
    SESSION_STATS
        .items_opened_after_finish
        .fetch_add(1, Ordering::Relaxed);
}

pub fn record_get_latency(dur: Duration) {
    let us = as_us(dur);
    SESSION_STATS.get_latency_count.fetch_add(1, Ordering::Relaxed);
    SESSION_STATS
        .get_latency_total_us
        .fetch_add(us, Ordering::Relaxed);
    SESSION_STATS
        .get_latency_max_us
        .fetch_max(us, Ordering::Relaxed);
}

pub fn record_set_latency(queue: &str, dur: Duration) {
    let us = as_us(dur);
    SESSION_STATS.set_latency_count.fetch_add(1, Ordering::Relaxed);
    SESSION_STATS
        .set_latency_total_us
        .fetch_add(us, Ordering::Relaxed);
    SESSION_STATS
        .set_latency_max_us
        .fetch_max(us, Ordering::Relaxed);
    let mut by_queue = SESSION_STATS
        .set_latency_by_queue
        .lock()
        .unwrap_or_else(|p| p.into_inner());
    by_queue.entry(queue.to_string()).or_default().record(us);
}

/// `STAT` lines for the session side of the `stats` command.
pub fn stat_lines() -> Vec<(String, String)> {
    let s = &SESSION_STATS;
    let mut lines = vec![
        (
            "curr_connections".to_string(),
            s.sessions.load(Ordering::Acquire).to_string(),
        ),
        (
            "total_connections".to_string(),
            s.total_sessions.load(Ordering::Relaxed).to_string(),
        ),
        (
            "cmd_get".to_string(),
            s.cmd_get.load(Ordering::Relaxed).to_string(),
        ),
        (
            "cmd_set".to_string(),
            s.cmd_set.load(Ordering::Relaxed).to_string(),
        ),
        (
            "cmd_peek".to_string(),
            s.cmd_peek.load(Ordering::Relaxed).to_string(),
        ),
        (
            "cmd_monitor".to_string(),
            s.cmd_monitor.load(Ordering::Relaxed).to_string(),
        ),
        (
            "protocol_errors".to_string(),
            s.protocol_errors.load(Ordering::Relaxed).to_string(),
        ),
        (
            "unavailable_errors".to_string(),
            s.unavailable_errors.load(Ordering::Relaxed).to_string(),
        ),
        (
            "items_opened_after_finish".to_string(),
            s.items_opened_after_finish.load(Ordering::Relaxed).to_string(),
        ),
        (
            "get_latency_usec_total".to_string(),
            s.get_latency_total_us.load(Ordering::Relaxed).to_string(),
        ),
        (
            "get_latency_usec_max".to_string(),
            s.get_latency_max_us.load(Ordering::Relaxed).to_string(),
        ),
        (
            "set_latency_usec_total".to_string(),
            s.set_latency_total_us.load(Ordering::Relaxed).to_string(),
        ),
        (
            "set_latency_usec_max".to_string(),
            s.set_latency_max_us.load(Ordering::Relaxed).to_string(),
        ),
    ];
    let by_queue = s
        .set_latency_by_queue
        .lock()
        .unwrap_or_else(|p| p.into_inner());
    for (queue, agg) in by_queue.iter() {
        lines.push((
            format!("set_latency_usec_total_{queue}"),
            agg.total_us.to_string(),
        ));
        lines.push((format!("set_latency_usec_max_{queue}"), agg.max_us.to_string()));
    }
    lines
}
