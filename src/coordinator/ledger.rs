//! Error ledger: bounded event history, correlation and counters
//!
//! The ledger is the single shared record of error events. It hands out
//! exclusive ownership of an event to one flow at a time (the in-flight set),
//! which is what prevents two flows from incrementing the same attempt count.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::warn;

use crate::config::KindPolicy;
use crate::model::{ErrorEvent, ErrorReport};

/// Aggregate counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorCounts {
    /// Every report received, including correlated repeats
    pub total_reports: u64,
    /// Distinct events opened
    pub events_opened: u64,
    pub by_kind: BTreeMap<String, u64>,
    pub resolved: u64,
    pub escalated: u64,
    /// Reports recorded while the system was not running
    pub suppressed: u64,
    /// Unresolved events still in the history ring
    pub unresolved: usize,
}

/// Event acquired by a flow for processing
#[derive(Debug, Clone)]
pub struct Acquired {
    pub event: ErrorEvent,
    /// True when the report opened a new event rather than matching an open one
    pub opened: bool,
}

#[derive(Debug)]
struct LedgerState {
    events: VecDeque<ErrorEvent>,
    capacity: usize,
    in_flight: HashSet<String>,
    counts: ErrorCounts,
}

impl LedgerState {
    /// Append `event`, evicting the oldest events no flow owns. While every
    /// older event is in flight the ring grows past capacity.
    fn push(&mut self, event: ErrorEvent) {
        self.counts.events_opened += 1;
        self.events.push_back(event);
        while self.events.len() > self.capacity {
            let older = self.events.len() - 1;
            let victim = self
                .events
                .iter()
                .take(older)
                .position(|e| !self.in_flight.contains(&e.id));
            match victim {
                Some(index) => {
                    self.events.remove(index);
                }
                None => break,
            }
        }
    }

    fn find_mut(&mut self, id: &str) -> Option<&mut ErrorEvent> {
        self.events.iter_mut().rev().find(|e| e.id == id)
    }

    fn count_report(&mut self, report: &ErrorReport) {
        self.counts.total_reports += 1;
        *self
            .counts
            .by_kind
            .entry(report.kind.as_str().to_string())
            .or_insert(0) += 1;
    }
}

/// Shared handle to the error history; clones share state
#[derive(Debug, Clone)]
pub struct ErrorLedger {
    inner: Arc<Mutex<LedgerState>>,
}

impl ErrorLedger {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(LedgerState {
                events: VecDeque::with_capacity(capacity.min(4096)),
                capacity: capacity.max(1),
                in_flight: HashSet::new(),
                counts: ErrorCounts::default(),
            })),
        }
    }

    /// Correlate `report` with an open event, or open a new one, and take
    /// exclusive ownership of it.
    ///
    /// An open event already owned by another flow is never shared; the
    /// report opens a fresh event instead.
    pub fn acquire(&self, report: &ErrorReport, policy: KindPolicy) -> Acquired {
        let mut state = self.lock();
        state.count_report(report);

        let fingerprint = report.fingerprint();
        let in_flight = state.in_flight.clone();
        let matched = state
            .events
            .iter_mut()
            .rev()
            .find(|e| e.is_open() && !in_flight.contains(&e.id) && e.fingerprint() == fingerprint);

        let acquired = match matched {
            Some(event) => {
                event.occurrences += 1;
                event.message = report.message.clone();
                event.context.extend(report.context.clone());
                Acquired {
                    event: event.clone(),
                    opened: false,
                }
            }
            None => {
                let event = ErrorEvent::from_report(report, policy.strategy, policy.max_attempts);
                state.push(event.clone());
                Acquired { event, opened: true }
            }
        };

        state.in_flight.insert(acquired.event.id.clone());
        acquired
    }

    /// Record a report without processing it (system not running)
    pub fn record_suppressed(&self, report: &ErrorReport, policy: KindPolicy) -> ErrorEvent {
        let mut state = self.lock();
        state.count_report(report);
        state.counts.suppressed += 1;

        let fingerprint = report.fingerprint();
        if let Some(event) = state
            .events
            .iter_mut()
            .rev()
            .find(|e| e.is_open() && e.fingerprint() == fingerprint)
        {
            event.occurrences += 1;
            return event.clone();
        }

        let event = ErrorEvent::from_report(report, policy.strategy, policy.max_attempts);
        state.push(event.clone());
        event
    }

    /// Insert an already-built event (used for direct escalations and tests)
    pub fn insert(&self, event: ErrorEvent) {
        let mut state = self.lock();
        state.counts.total_reports += 1;
        *state
            .counts
            .by_kind
            .entry(event.kind.as_str().to_string())
            .or_insert(0) += 1;
        state.push(event);
    }

    /// Apply `f` to the event with `id`; returns the updated event
    pub fn update<F>(&self, id: &str, f: F) -> Option<ErrorEvent>
    where
        F: FnOnce(&mut ErrorEvent),
    {
        let mut state = self.lock();
        let event = state.find_mut(id)?;
        f(event);
        Some(event.clone())
    }

    /// Mark an event escalated and link its intervention
    pub fn mark_escalated(&self, id: &str, intervention_id: &str) {
        let mut state = self.lock();
        let newly = match state.find_mut(id) {
            Some(event) if !event.escalated => {
                event.escalated = true;
                event.intervention_id = Some(intervention_id.to_string());
                true
            }
            Some(_) => false,
            None => {
                warn!(error_id = id, intervention_id, "escalated event no longer in history");
                false
            }
        };
        if newly {
            state.counts.escalated += 1;
        }
    }

    /// Mark an event resolved. Returns false if it is unknown or was already resolved.
    pub fn resolve(&self, id: &str) -> bool {
        let mut state = self.lock();
        let newly = match state.find_mut(id) {
            Some(event) if !event.resolved => {
                event.mark_resolved();
                true
            }
            Some(_) => false,
            None => {
                warn!(error_id = id, "resolved event no longer in history");
                false
            }
        };
        if newly {
            state.counts.resolved += 1;
        }
        newly
    }

    /// Give up ownership of an event
    pub fn release(&self, id: &str) {
        self.lock().in_flight.remove(id);
    }

    pub fn is_in_flight(&self, id: &str) -> bool {
        self.lock().in_flight.contains(id)
    }

    pub fn get(&self, id: &str) -> Option<ErrorEvent> {
        self.lock().events.iter().rev().find(|e| e.id == id).cloned()
    }

    /// Most recent `n` events, newest last
    pub fn recent(&self, n: usize) -> Vec<ErrorEvent> {
        let state = self.lock();
        let skip = state.events.len().saturating_sub(n);
        state.events.iter().skip(skip).cloned().collect()
    }

    pub fn unresolved(&self) -> Vec<ErrorEvent> {
        self.lock()
            .events
            .iter()
            .filter(|e| !e.resolved)
            .cloned()
            .collect()
    }

    pub fn counts(&self) -> ErrorCounts {
        let state = self.lock();
        let mut counts = state.counts.clone();
        counts.unresolved = state.events.iter().filter(|e| !e.resolved).count();
        counts
    }

    pub fn len(&self) -> usize {
        self.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ErrorKind, RecoveryStrategy};

    fn policy() -> KindPolicy {
        KindPolicy {
            max_attempts: 3,
            strategy: RecoveryStrategy::ComponentRestart,
        }
    }

    fn offline(device: &str) -> ErrorReport {
        ErrorReport::new(ErrorKind::DeviceOffline, "device-pool", "device went away").with_device(device)
    }

    #[test]
    fn test_repeated_reports_correlate() {
        let ledger = ErrorLedger::new(10);

        let first = ledger.acquire(&offline("d1"), policy());
        assert!(first.opened);
        ledger.release(&first.event.id);

        let second = ledger.acquire(&offline("d1"), policy());
        assert!(!second.opened);
        assert_eq!(second.event.id, first.event.id);
        assert_eq!(second.event.occurrences, 2);
        ledger.release(&second.event.id);

        // different device is a different failure
        let other = ledger.acquire(&offline("d2"), policy());
        assert!(other.opened);
        assert_ne!(other.event.id, first.event.id);
    }

    #[test]
    fn test_in_flight_event_is_not_shared() {
        let ledger = ErrorLedger::new(10);

        let owner = ledger.acquire(&offline("d1"), policy());
        let concurrent = ledger.acquire(&offline("d1"), policy());

        assert!(concurrent.opened);
        assert_ne!(owner.event.id, concurrent.event.id);
        assert!(ledger.is_in_flight(&owner.event.id));
        assert!(ledger.is_in_flight(&concurrent.event.id));
    }

    #[test]
    fn test_resolved_and_escalated_events_are_closed() {
        let ledger = ErrorLedger::new(10);

        let a = ledger.acquire(&offline("d1"), policy());
        ledger.release(&a.event.id);
        assert!(ledger.resolve(&a.event.id));
        assert!(!ledger.resolve(&a.event.id));

        let b = ledger.acquire(&offline("d1"), policy());
        assert!(b.opened);
        ledger.mark_escalated(&b.event.id, "int-1");
        ledger.release(&b.event.id);

        let c = ledger.acquire(&offline("d1"), policy());
        assert!(c.opened);

        let counts = ledger.counts();
        assert_eq!(counts.total_reports, 3);
        assert_eq!(counts.events_opened, 3);
        assert_eq!(counts.resolved, 1);
        assert_eq!(counts.escalated, 1);
        assert_eq!(counts.unresolved, 2);
        assert_eq!(counts.by_kind.get("device-offline"), Some(&3));
    }

    #[test]
    fn test_ring_buffer_evicts_oldest() {
        let ledger = ErrorLedger::new(3);
        let mut ids = Vec::new();
        for i in 0..5 {
            let acquired = ledger.acquire(&offline(&format!("d{}", i)), policy());
            ledger.release(&acquired.event.id);
            ids.push(acquired.event.id);
        }

        assert_eq!(ledger.len(), 3);
        assert!(ledger.get(&ids[0]).is_none());
        assert!(ledger.get(&ids[4]).is_some());

        let recent: Vec<_> = ledger.recent(2).into_iter().map(|e| e.id).collect();
        assert_eq!(recent, vec![ids[3].clone(), ids[4].clone()]);
    }

    #[test]
    fn test_eviction_skips_in_flight_events() {
        let ledger = ErrorLedger::new(2);
        let owned = ledger.acquire(&offline("d0"), policy());

        let mut ids = Vec::new();
        for i in 1..4 {
            let acquired = ledger.acquire(&offline(&format!("d{}", i)), policy());
            ledger.release(&acquired.event.id);
            ids.push(acquired.event.id);
        }

        assert_eq!(ledger.len(), 2);
        assert!(ledger.get(&owned.event.id).is_some());
        assert!(ledger.get(&ids[0]).is_none());
        assert!(ledger.get(&ids[2]).is_some());

        // the owning flow can still finish its event
        assert!(ledger.resolve(&owned.event.id));
        ledger.release(&owned.event.id);
        assert_eq!(ledger.counts().resolved, 1);
    }

    #[test]
    fn test_suppressed_reports_do_not_take_ownership() {
        let ledger = ErrorLedger::new(10);

        let event = ledger.record_suppressed(&offline("d1"), policy());
        assert_eq!(event.attempt_count, 0);
        assert!(!ledger.is_in_flight(&event.id));

        let again = ledger.record_suppressed(&offline("d1"), policy());
        assert_eq!(again.id, event.id);
        assert_eq!(again.occurrences, 2);
        assert_eq!(ledger.counts().suppressed, 2);
    }
}
