//! Read/write admission: connect-time policy from the session count plus the
//! optional shared server status.

use std::sync::atomic::{AtomicU8, Ordering};

/// Operator-visible server state. `ReadOnly` blocks writes, `Quiescent`
/// blocks both directions so the server can drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Up,
    ReadOnly,
    Quiescent,
}

impl Status {
    pub fn parse(raw: &str) -> Option<Status> {
        match raw.to_ascii_lowercase().as_str() {
            "up" => Some(Status::Up),
            "readonly" => Some(Status::ReadOnly),
            "quiescent" => Some(Status::Quiescent),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Up => "UP",
            Status::ReadOnly => "READONLY",
            Status::Quiescent => "QUIESCENT",
        }
    }

    pub fn blocks_reads(&self) -> bool {
        matches!(self, Status::Quiescent)
    }

    pub fn blocks_writes(&self) -> bool {
        matches!(self, Status::ReadOnly | Status::Quiescent)
    }
}

/// Shared, atomically updated status. Present only when the operator enabled
/// the `status` command.
#[derive(Debug)]
pub struct ServerStatus {
    state: AtomicU8,
}

impl ServerStatus {
    pub fn new(initial: Status) -> Self {
        ServerStatus {
            state: AtomicU8::new(initial as u8),
        }
    }

    pub fn current(&self) -> Status {
        match self.state.load(Ordering::Acquire) {
            x if x == Status::ReadOnly as u8 => Status::ReadOnly,
            x if x == Status::Quiescent as u8 => Status::Quiescent,
            _ => Status::Up,
        }
    }

    pub fn set(&self, status: Status) {
        self.state.store(status as u8, Ordering::Release);
        tracing::info!(status = status.as_str(), "server status changed");
    }

    pub fn mark_up(&self) {
        self.set(Status::Up);
    }

    pub fn mark_read_only(&self) {
        self.set(Status::ReadOnly);
    }

    pub fn mark_quiescent(&self) {
        self.set(Status::Quiescent);
    }
}

/// Session-count thresholds; zero disables a limit.
#[derive(Debug, Clone, Copy, Default)]
pub struct AvailabilityPolicy {
    pub max_sessions_for_reads: usize,
    pub max_sessions_for_writes: usize,
}

/// Flags derived once per session at connect time.
#[derive(Debug, Clone, Copy, Default)]
pub struct Availability {
    pub refuse_reads: bool,
    pub refuse_writes: bool,
}

impl AvailabilityPolicy {
    pub fn at_connect(&self, sessions: usize) -> Availability {
        Availability {
            refuse_reads: self.max_sessions_for_reads > 0
                && sessions > self.max_sessions_for_reads,
            refuse_writes: self.max_sessions_for_writes > 0
                && sessions > self.max_sessions_for_writes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thresholds_refuse_beyond_limit() {
        let policy = AvailabilityPolicy {
            max_sessions_for_reads: 2,
            max_sessions_for_writes: 1,
        };
        let a = policy.at_connect(1);
        assert!(!a.refuse_reads && !a.refuse_writes);
        let b = policy.at_connect(2);
        assert!(!b.refuse_reads && b.refuse_writes);
        let c = policy.at_connect(3);
        assert!(c.refuse_reads && c.refuse_writes);
    }

    #[test]
    fn zero_disables_limits() {
        let policy = AvailabilityPolicy::default();
        let a = policy.at_connect(1_000_000);
        assert!(!a.refuse_reads && !a.refuse_writes);
    }

    #[test]
    fn status_transitions_and_blocking() {
        let status = ServerStatus::new(Status::Up);
        assert!(!status.current().blocks_reads());
        status.mark_read_only();
        assert!(status.current().blocks_writes());
        assert!(!status.current().blocks_reads());
        status.mark_quiescent();
        assert!(status.current().blocks_reads());
        assert!(status.current().blocks_writes());
        status.mark_up();
        assert_eq!(status.current(), Status::Up);
    }

    #[test]
    fn parse_round_trips() {
        for s in [Status::Up, Status::ReadOnly, Status::Quiescent] {
            assert_eq!(Status::parse(&s.as_str().to_ascii_lowercase()), Some(s));
        }
        assert_eq!(Status::parse("sideways"), None);
    }
}
