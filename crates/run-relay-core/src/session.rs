//! Per-session event log with replay-then-live fan-out.

use std::{
    collections::BTreeMap,
    sync::{
        Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

use tokio::sync::mpsc;

use crate::{
    event::{Frame, RunEvent},
    traits::{RunState, SessionId},
};

/// Identifier of one attached observer within a session.
pub type ObserverId = u64;

struct Inner {
    state: RunState,
    log: Vec<RunEvent>,
    // Ids are handed out in increasing order, so map order is attach order.
    observers: BTreeMap<ObserverId, mpsc::UnboundedSender<Frame>>,
}

impl Inner {
    /// Push `frame` to every observer, dropping the ones whose connection is gone.
    fn fan_out(&mut self, frame: &Frame) -> usize {
        let before = self.observers.len();
        self.observers.retain(|_, tx| tx.send(frame.clone()).is_ok());
        before - self.observers.len()
    }
}

/// Receiving side of a freshly attached observer.
///
/// The channel already holds the full replay when this is returned.
#[derive(Debug)]
pub struct Attached {
    pub observer: ObserverId,
    pub frames: mpsc::UnboundedReceiver<Frame>,
    pub replayed: usize,
}

/// One run's identity, event log, and observer set.
///
/// Log, observers, and state sit behind a single mutex held across every
/// emit, attach, and detach, so a new observer gets exactly the replayed
/// prefix followed by exactly the events emitted after it.
pub struct Session {
    id: SessionId,
    inner: Mutex<Inner>,
    next_observer: AtomicU64,
}

impl Session {
    /// Create an empty, pending session.
    #[must_use]
    pub fn new(id: SessionId) -> Self {
        Self {
            id,
            inner: Mutex::new(Inner {
                state: RunState::Pending,
                log: Vec::with_capacity(32),
                observers: BTreeMap::new(),
            }),
            next_observer: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Every critical section leaves `Inner` consistent, so a poisoned
        // lock still guards valid data.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub const fn id(&self) -> SessionId {
        self.id
    }

    #[must_use]
    pub fn state(&self) -> RunState {
        self.lock().state
    }

    /// Whether the run has resolved, successfully or not.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.lock().state.is_terminal()
    }

    #[must_use]
    pub fn observer_count(&self) -> usize {
        self.lock().observers.len()
    }

    /// Completed and unobserved.
    #[must_use]
    pub fn is_reclaimable(&self) -> bool {
        let inner = self.lock();
        inner.state.is_terminal() && inner.observers.is_empty()
    }

    /// Copy of the log so far.
    #[must_use]
    pub fn snapshot(&self) -> Vec<RunEvent> {
        self.lock().log.clone()
    }

    /// `Pending -> Running`. Returns `false` from any other state.
    pub fn mark_running(&self) -> bool {
        let mut inner = self.lock();
        if inner.state == RunState::Pending {
            inner.state = RunState::Running;
            true
        } else {
            false
        }
    }

    /// Append a non-terminal event and push it to every observer.
    ///
    /// Returns `false` without touching the log if the event is terminal
    /// (use [`Session::finish`]) or the run has already resolved.
    pub fn emit(&self, event: RunEvent) -> bool {
        if event.kind.is_terminal() {
            tracing::warn!(
                session_id = %self.id,
                kind = event.kind.as_str(),
                "terminal event passed to emit"
            );
            return false;
        }

        let mut inner = self.lock();
        if inner.state.is_terminal() {
            tracing::warn!(session_id = %self.id, "event emitted after run resolved, dropping");
            return false;
        }
        Self::append(&mut inner, self.id, event);
        true
    }

    /// Append the terminal event for `outcome` and mark the run completed.
    ///
    /// Happens at most once; later calls return `false` and change nothing.
    pub fn finish(&self, outcome: Result<(), String>) -> bool {
        let mut inner = self.lock();
        if inner.state.is_terminal() {
            return false;
        }

        let (event, state) = match outcome {
            Ok(()) => (RunEvent::complete(), RunState::Succeeded),
            Err(message) => (RunEvent::error(message), RunState::Failed),
        };
        Self::append(&mut inner, self.id, event);
        inner.state = state;
        true
    }

    fn append(inner: &mut Inner, id: SessionId, event: RunEvent) {
        let frame = Frame::Event(event.clone());
        inner.log.push(event);
        let dropped = inner.fan_out(&frame);
        if dropped > 0 {
            tracing::debug!(session_id = %id, dropped, "dropped dead observers during emit");
        }
    }

    /// Add an observer, replaying the whole log into its channel first.
    #[must_use]
    pub fn attach(&self) -> Attached {
        let (tx, frames) = mpsc::unbounded_channel();
        let observer = self.next_observer.fetch_add(1, Ordering::Relaxed);

        let mut inner = self.lock();
        for event in &inner.log {
            // The receiver is still in our hands, so this cannot fail.
            let _ = tx.send(Frame::Event(event.clone()));
        }
        let replayed = inner.log.len();
        inner.observers.insert(observer, tx);

        tracing::debug!(
            session_id = %self.id,
            observer,
            replayed,
            replay_bytes = inner.log.iter().map(RunEvent::approx_bytes).sum::<usize>(),
            "observer attached"
        );

        Attached {
            observer,
            frames,
            replayed,
        }
    }

    /// Remove an observer. Returns `false` if it was not attached.
    pub fn detach(&self, observer: ObserverId) -> bool {
        self.lock().observers.remove(&observer).is_some()
    }

    /// Send a keep-alive frame to every observer.
    ///
    /// Observers whose connection is gone are detached; returns how many.
    pub fn keep_alive(&self) -> usize {
        let mut inner = self.lock();
        if inner.observers.is_empty() {
            return 0;
        }
        inner.fan_out(&Frame::KeepAlive)
    }

    /// Drop every observer, ending their streams.
    pub fn close_observers(&self) -> usize {
        let mut inner = self.lock();
        let count = inner.observers.len();
        inner.observers.clear();
        count
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &inner.state)
            .field("events", &inner.log.len())
            .field("observers", &inner.observers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use uuid::Uuid;

    use super::*;
    use crate::event::EventKind;

    fn drain(frames: &mut mpsc::UnboundedReceiver<Frame>) -> Vec<Frame> {
        let mut out = Vec::new();
        while let Ok(frame) = frames.try_recv() {
            out.push(frame);
        }
        out
    }

    fn numbered(n: u64) -> RunEvent {
        RunEvent::item(json!({ "n": n }))
    }

    #[test]
    fn replay_then_live_without_gaps() {
        let session = Session::new(Uuid::new_v4());
        session.mark_running();
        session.emit(numbered(1));
        session.emit(numbered(2));

        let mut attached = session.attach();
        assert_eq!(attached.replayed, 2);

        session.emit(numbered(3));
        assert!(session.finish(Ok(())));

        let frames = drain(&mut attached.frames);
        let expected: Vec<Frame> = vec![numbered(1), numbered(2), numbered(3), RunEvent::complete()]
            .into_iter()
            .map(Frame::Event)
            .collect();
        assert_eq!(frames, expected);
    }

    #[test]
    fn attach_before_first_event_sees_everything_live() {
        let session = Session::new(Uuid::new_v4());
        let mut attached = session.attach();
        assert_eq!(attached.replayed, 0);

        session.emit(RunEvent::status(true));
        session.emit(numbered(1));
        session.finish(Err("disk full".into()));

        let kinds: Vec<EventKind> = drain(&mut attached.frames)
            .iter()
            .filter_map(|f| f.as_event().map(|e| e.kind))
            .collect();
        assert_eq!(kinds, [EventKind::Status, EventKind::Item, EventKind::Error]);
    }

    #[test]
    fn finish_happens_once() {
        let session = Session::new(Uuid::new_v4());
        assert!(session.finish(Err("disk full".into())));
        assert!(!session.finish(Ok(())));
        assert_eq!(session.state(), RunState::Failed);

        let errors = session
            .snapshot()
            .iter()
            .filter(|e| e.kind == EventKind::Error)
            .count();
        assert_eq!(errors, 1);
    }

    #[test]
    fn emit_after_completion_is_rejected() {
        let session = Session::new(Uuid::new_v4());
        session.finish(Ok(()));
        assert!(!session.emit(numbered(1)));
        assert_eq!(session.snapshot(), vec![RunEvent::complete()]);
    }

    #[test]
    fn emit_refuses_terminal_events() {
        let session = Session::new(Uuid::new_v4());
        assert!(!session.emit(RunEvent::complete()));
        assert!(session.snapshot().is_empty());
        assert!(!session.is_completed());
    }

    #[test]
    fn keep_alive_is_not_logged_or_replayed() {
        let session = Session::new(Uuid::new_v4());
        let mut first = session.attach();
        session.emit(numbered(1));
        assert_eq!(session.keep_alive(), 0);

        assert_eq!(
            drain(&mut first.frames),
            vec![Frame::Event(numbered(1)), Frame::KeepAlive]
        );

        let mut second = session.attach();
        assert_eq!(drain(&mut second.frames), vec![Frame::Event(numbered(1))]);
        assert_eq!(session.snapshot().len(), 1);
    }

    #[test]
    fn dead_observer_is_pruned_by_keep_alive() {
        let session = Session::new(Uuid::new_v4());
        let attached = session.attach();
        let _live = session.attach();
        drop(attached.frames);

        assert_eq!(session.keep_alive(), 1);
        assert_eq!(session.observer_count(), 1);
    }

    #[test]
    fn detach_twice_is_noop() {
        let session = Session::new(Uuid::new_v4());
        let attached = session.attach();
        assert!(session.detach(attached.observer));
        assert!(!session.detach(attached.observer));
        assert_eq!(session.observer_count(), 0);
    }

    #[test]
    fn reclaimable_only_when_completed_and_unobserved() {
        let session = Session::new(Uuid::new_v4());
        let attached = session.attach();
        assert!(!session.is_reclaimable());

        session.finish(Ok(()));
        assert!(!session.is_reclaimable());

        session.detach(attached.observer);
        assert!(session.is_reclaimable());
    }
}
