use std::{
    fmt::Display,
    num::NonZeroU64,
    sync::atomic::{AtomicU64, Ordering},
};

use chrono::{DateTime, Local};
use serde::Serialize;

use crate::{
    error::Error,
    measure::Measure,
    provider::{Interval, ProviderId},
};

/// Opaque handle to a running tracking session.
///
/// References are allocated from a process-wide counter and never reused, so a stale
/// reference can never resolve to a newer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SessionRef(NonZeroU64);

static NEXT_REF: AtomicU64 = AtomicU64::new(1);

impl SessionRef {
    fn allocate() -> Self {
        let raw = NEXT_REF.fetch_add(1, Ordering::Relaxed);
        // The counter starts at 1 and would need 2^64 sessions to wrap.
        Self(NonZeroU64::new(raw).unwrap_or(NonZeroU64::MIN))
    }

    pub fn as_raw(self) -> u64 {
        self.0.get()
    }
}

impl Display for SessionRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Created,
    Running,
    Stopped,
}

/// A snapshot of a live session, for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub reference: SessionRef,
    pub measures: Vec<Measure>,
    pub state: SessionState,
    pub started_at: DateTime<Local>,
}

/// Runtime state of one tracking session between start and stop.
pub(crate) struct TrackingSession {
    pub(crate) measures: Vec<Measure>,
    /// Open intervals, one per continuously sampling provider.
    pub(crate) intervals: Vec<(ProviderId, Vec<Measure>, Box<dyn Interval>)>,
    /// Measures of instantaneous providers, read again at stop.
    pub(crate) deferred: Vec<(ProviderId, Vec<Measure>)>,
    pub(crate) state: SessionState,
    pub(crate) started_at: DateTime<Local>,
}

impl TrackingSession {
    pub(crate) fn new(measures: Vec<Measure>) -> Self {
        Self {
            measures,
            intervals: Vec::new(),
            deferred: Vec::new(),
            state: SessionState::Created,
            started_at: Local::now(),
        }
    }
}

/// The table of live sessions, shared by every caller of a [`Tracker`](crate::Tracker).
///
/// Entries are locked individually, so starting or stopping one session never waits on
/// unrelated ones.
pub(crate) struct SessionTable {
    live: scc::HashMap<SessionRef, TrackingSession>,
}

impl SessionTable {
    pub(crate) fn new() -> Self {
        Self {
            live: scc::HashMap::default(),
        }
    }

    /// Registers the session as running and hands out its reference.
    pub(crate) fn register(&self, mut session: TrackingSession) -> SessionRef {
        let previous = std::mem::replace(&mut session.state, SessionState::Running);
        loop {
            let reference = SessionRef::allocate();
            match self.live.insert(reference, session) {
                Ok(()) => {
                    log::trace!("session {reference}: {previous:?} -> Running");
                    return reference;
                }
                // Only reachable if the counter wrapped around.
                Err((_, rejected)) => session = rejected,
            }
        }
    }

    /// Removes the session; a reference resolves at most once.
    pub(crate) fn take(&self, reference: SessionRef) -> Result<TrackingSession, Error> {
        self.live
            .remove(&reference)
            .map(|(_, session)| session)
            .ok_or(Error::UnknownSession(reference))
    }

    pub(crate) fn len(&self) -> usize {
        self.live.len()
    }

    pub(crate) fn snapshot(&self) -> Vec<SessionInfo> {
        let mut infos = Vec::with_capacity(self.live.len());
        self.live.scan(|reference, session| {
            infos.push(SessionInfo {
                reference: *reference,
                measures: session.measures.clone(),
                state: session.state,
                started_at: session.started_at,
            });
        });
        infos.sort_by_key(|info| info.reference);
        infos
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn references_are_unique() {
        let table = SessionTable::new();
        let a = table.register(TrackingSession::new(vec![Measure::OsName]));
        let b = table.register(TrackingSession::new(vec![Measure::OsName]));
        assert_ne!(a, b);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn take_resolves_once() {
        let table = SessionTable::new();
        let reference = table.register(TrackingSession::new(vec![Measure::GitBranch]));
        let session = table.take(reference).unwrap();
        assert_eq!(session.measures, vec![Measure::GitBranch]);
        assert_eq!(session.state, SessionState::Running);
        assert!(matches!(
            table.take(reference),
            Err(Error::UnknownSession(r)) if r == reference
        ));
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn snapshot_lists_running_sessions() {
        let table = SessionTable::new();
        let a = table.register(TrackingSession::new(vec![Measure::OsName]));
        let b = table.register(TrackingSession::new(vec![Measure::OsKernel]));
        let infos = table.snapshot();
        assert_eq!(
            infos.iter().map(|i| i.reference).collect::<Vec<_>>(),
            vec![a, b]
        );
        assert!(infos.iter().all(|i| i.state == SessionState::Running));
    }
}
