//! The staleness-aware, debounced "both ready" predicate. This module is
//! pure: it consumes whatever `NodeStatus` rows the caller already fetched
//! and a `now` timestamp, and never touches the database itself. The
//! database row is the only authority on readiness; see [`crate::advisory`]
//! for the explicitly-non-authoritative in-memory cache.

use chrono::{DateTime, Duration, Utc};
use disp_schemas::NodeStatus;

/// Per-node explanation of why (or why not) a node counts as ready, used for
/// the diagnostic log line the dispatcher emits when it declines to
/// dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadinessDiagnostic {
    pub node_id: i64,
    pub known: bool,
    pub online: bool,
    pub ready: bool,
    pub stale: bool,
    pub flapping: bool,
}

impl ReadinessDiagnostic {
    pub fn is_ready(&self) -> bool {
        self.known && self.online && self.ready && !self.stale && !self.flapping
    }
}

fn diagnose_one(
    node_id: i64,
    status: Option<&NodeStatus>,
    now: DateTime<Utc>,
    max_age_ms: i64,
    debounce_ms: i64,
) -> ReadinessDiagnostic {
    let Some(status) = status else {
        return ReadinessDiagnostic {
            node_id,
            known: false,
            online: false,
            ready: false,
            stale: true,
            flapping: true,
        };
    };
    let stale = now - status.last_seen > Duration::milliseconds(max_age_ms);
    let flapping = now - status.last_ready_change < Duration::milliseconds(debounce_ms);
    ReadinessDiagnostic {
        node_id,
        known: true,
        online: status.online,
        ready: status.ready,
        stale,
        flapping,
    }
}

/// Diagnoses both nodes against `now` and the configured `max_age`/`debounce`
/// windows. Callers pass `now` explicitly (rather than calling `Utc::now()`
/// internally) so the predicate is reproducible in tests.
pub fn diagnose(
    node1: Option<&NodeStatus>,
    node2: Option<&NodeStatus>,
    now: DateTime<Utc>,
    max_age_ms: i64,
    debounce_ms: i64,
) -> (ReadinessDiagnostic, ReadinessDiagnostic) {
    (
        diagnose_one(1, node1, now, max_age_ms, debounce_ms),
        diagnose_one(2, node2, now, max_age_ms, debounce_ms),
    )
}

/// `BothReady(max_age, debounce)`: true iff both nodes are online, ready,
/// seen within `max_age`, and have been ready for at least `debounce`.
pub fn both_ready(
    node1: Option<&NodeStatus>,
    node2: Option<&NodeStatus>,
    now: DateTime<Utc>,
    max_age_ms: i64,
    debounce_ms: i64,
) -> bool {
    let (d1, d2) = diagnose(node1, node2, now, max_age_ms, debounce_ms);
    d1.is_ready() && d2.is_ready()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(online: bool, ready: bool, last_seen: DateTime<Utc>, last_ready_change: DateTime<Utc>) -> NodeStatus {
        NodeStatus {
            node_id: 1,
            online,
            ready,
            uptime: None,
            last_seen,
            last_ready_change,
            last_online_change: last_ready_change,
        }
    }

    #[test]
    fn both_ready_true_when_both_fresh_and_stable() {
        let now = Utc::now();
        let since = now - Duration::seconds(5);
        let n1 = status(true, true, now, since);
        let n2 = status(true, true, now, since);
        assert!(both_ready(Some(&n1), Some(&n2), now, 10_000, 500));
    }

    #[test]
    fn missing_node_is_never_ready() {
        let now = Utc::now();
        let n1 = status(true, true, now, now - Duration::seconds(5));
        assert!(!both_ready(Some(&n1), None, now, 10_000, 500));
    }

    #[test]
    fn stale_last_seen_fails_even_if_flags_are_set() {
        let now = Utc::now();
        let stale_seen = now - Duration::seconds(11);
        let n1 = status(true, true, stale_seen, stale_seen);
        let n2 = status(true, true, now, now - Duration::seconds(5));
        assert!(!both_ready(Some(&n1), Some(&n2), now, 10_000, 500));
    }

    #[test]
    fn recent_ready_flip_fails_the_debounce_window() {
        let now = Utc::now();
        let just_flipped = now - Duration::milliseconds(200);
        let n1 = status(true, true, now, just_flipped);
        let n2 = status(true, true, now, now - Duration::seconds(5));
        assert!(!both_ready(Some(&n1), Some(&n2), now, 10_000, 500));

        let later = now + Duration::milliseconds(400);
        assert!(both_ready(Some(&n1), Some(&n2), later, 10_000, 500));
    }

    #[test]
    fn offline_or_not_ready_flag_fails_regardless_of_timestamps() {
        let now = Utc::now();
        let since = now - Duration::seconds(5);
        let offline = status(false, true, now, since);
        let not_ready = status(true, false, now, since);
        let ok = status(true, true, now, since);
        assert!(!both_ready(Some(&offline), Some(&ok), now, 10_000, 500));
        assert!(!both_ready(Some(&not_ready), Some(&ok), now, 10_000, 500));
    }
}
