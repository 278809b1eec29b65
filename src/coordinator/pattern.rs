//! Repeated-failure pattern detection
//!
//! Two independent triggers, either of which requests a system pause:
//! - the last `same_kind` reports all share one kind
//! - at least `window_count` reports arrived within `window`
//!
//! The detector only sees reports accepted while the system is running and is
//! reset on resume.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

use crate::model::ErrorKind;

/// Why the detector fired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternTrigger {
    SameKind { kind: ErrorKind, count: usize },
    Burst { count: usize, window: Duration },
}

impl fmt::Display for PatternTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PatternTrigger::SameKind { kind, count } => {
                write!(f, "{} consecutive {} errors", count, kind)
            }
            PatternTrigger::Burst { count, window } => {
                write!(f, "{} errors within {}s", count, window.as_secs())
            }
        }
    }
}

#[derive(Debug)]
pub struct PatternDetector {
    same_kind: usize,
    window_count: usize,
    window: Duration,
    recent_kinds: VecDeque<ErrorKind>,
    arrivals: VecDeque<Instant>,
}

impl PatternDetector {
    pub fn new(same_kind: usize, window_count: usize, window: Duration) -> Self {
        Self {
            same_kind: same_kind.max(1),
            window_count: window_count.max(1),
            window,
            recent_kinds: VecDeque::new(),
            arrivals: VecDeque::new(),
        }
    }

    /// Record one report; returns the first trigger that fires
    pub fn record(&mut self, kind: ErrorKind) -> Option<PatternTrigger> {
        self.record_at(kind, Instant::now())
    }

    pub fn record_at(&mut self, kind: ErrorKind, now: Instant) -> Option<PatternTrigger> {
        self.recent_kinds.push_back(kind);
        while self.recent_kinds.len() > self.same_kind {
            self.recent_kinds.pop_front();
        }

        self.arrivals.push_back(now);
        while let Some(&oldest) = self.arrivals.front() {
            if now.duration_since(oldest) > self.window {
                self.arrivals.pop_front();
            } else {
                break;
            }
        }

        if self.recent_kinds.len() == self.same_kind && self.recent_kinds.iter().all(|k| *k == kind) {
            return Some(PatternTrigger::SameKind {
                kind,
                count: self.same_kind,
            });
        }

        if self.arrivals.len() >= self.window_count {
            return Some(PatternTrigger::Burst {
                count: self.arrivals.len(),
                window: self.window,
            });
        }

        None
    }

    pub fn reset(&mut self) {
        self.recent_kinds.clear();
        self.arrivals.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector() -> PatternDetector {
        PatternDetector::new(5, 10, Duration::from_secs(300))
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_kind_trigger() {
        let mut d = detector();
        for _ in 0..4 {
            assert_eq!(d.record(ErrorKind::ProxyFailure), None);
        }
        assert_eq!(
            d.record(ErrorKind::ProxyFailure),
            Some(PatternTrigger::SameKind {
                kind: ErrorKind::ProxyFailure,
                count: 5
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_interleaved_kinds_do_not_trigger_same_kind() {
        let mut d = detector();
        let kinds = [ErrorKind::ProxyFailure, ErrorKind::VpnFailure];
        for i in 0..9 {
            assert_eq!(d.record(kinds[i % 2]), None);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_trigger() {
        let mut d = detector();
        let kinds = [ErrorKind::ProxyFailure, ErrorKind::VpnFailure, ErrorKind::NetworkError];
        for i in 0..9 {
            assert_eq!(d.record(kinds[i % 3]), None);
            tokio::time::advance(Duration::from_secs(10)).await;
        }
        assert!(matches!(
            d.record(ErrorKind::RateLimited),
            Some(PatternTrigger::Burst { count: 10, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_expires_old_reports() {
        let mut d = detector();
        let kinds = [ErrorKind::ProxyFailure, ErrorKind::VpnFailure];
        for i in 0..9 {
            d.record(kinds[i % 2]);
        }
        tokio::time::advance(Duration::from_secs(301)).await;
        assert_eq!(d.record(ErrorKind::NetworkError), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_clears_history() {
        let mut d = detector();
        for _ in 0..4 {
            d.record(ErrorKind::LinkLost);
        }
        d.reset();
        for _ in 0..4 {
            assert_eq!(d.record(ErrorKind::LinkLost), None);
        }
    }
}
