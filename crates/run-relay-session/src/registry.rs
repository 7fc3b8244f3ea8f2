//! Process-wide registry of live sessions.

use std::{
    collections::HashMap,
    pin::Pin,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError, Weak,
        atomic::{AtomicBool, Ordering},
    },
    task::{Context, Poll},
    time::Duration,
};

use futures::Stream;
use run_relay_core::{Frame, ObserverId, Session, SessionId};
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_stream::wrappers::UnboundedReceiverStream;
use uuid::Uuid;

/// Attach error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AttachError {
    #[error("Session not found: {0}")]
    NotFound(SessionId),
}

/// Returned once the registry has been closed for shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Session registry is closed")]
pub struct RegistryClosed;

#[derive(Default)]
struct RegistryInner {
    sessions: Mutex<HashMap<SessionId, Arc<Session>>>,
    // Only flipped while the map lock is held.
    closed: AtomicBool,
}

/// Mapping from session id to session; the only owner of sessions.
///
/// A session is inserted on admission and removed once it is both completed
/// and unobserved. Lock order is registry map, then session.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

impl SessionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<SessionId, Arc<Session>>> {
        self.inner
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Allocate a fresh pending session and register it.
    ///
    /// # Errors
    /// Returns [`RegistryClosed`] after [`SessionRegistry::close`].
    pub fn create_session(&self) -> Result<Arc<Session>, RegistryClosed> {
        let mut sessions = self.sessions();
        if self.is_closed() {
            return Err(RegistryClosed);
        }
        let mut id = Uuid::new_v4();
        while sessions.contains_key(&id) {
            id = Uuid::new_v4();
        }
        let session = Arc::new(Session::new(id));
        sessions.insert(id, Arc::clone(&session));
        tracing::info!(session_id = %id, live = sessions.len(), "session created");
        Ok(session)
    }

    /// Look up a live session.
    #[must_use]
    pub fn get(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions().get(&id).cloned()
    }

    #[must_use]
    pub fn contains(&self, id: SessionId) -> bool {
        self.sessions().contains_key(&id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions().is_empty()
    }

    /// Attach a new observer to a live session.
    ///
    /// The map lock is held across the attach so a session cannot be
    /// reclaimed between lookup and attach.
    ///
    /// # Errors
    /// Returns [`AttachError::NotFound`] if the id is unknown, reclaimed, or
    /// the registry is closed.
    pub fn attach(&self, id: SessionId) -> Result<Subscription, AttachError> {
        let sessions = self.sessions();
        if self.is_closed() {
            return Err(AttachError::NotFound(id));
        }
        let session = sessions.get(&id).ok_or(AttachError::NotFound(id))?;
        let attached = session.attach();
        tracing::info!(
            session_id = %id,
            observer = attached.observer,
            replayed = attached.replayed,
            "observer attached"
        );

        Ok(Subscription {
            registry: self.clone(),
            session: Arc::clone(session),
            observer: attached.observer,
            replayed: attached.replayed,
            frames: UnboundedReceiverStream::new(attached.frames),
        })
    }

    /// Remove an observer, then reclaim the session if that made it eligible.
    pub fn detach(&self, session: &Session, observer: ObserverId) {
        if session.detach(observer) {
            tracing::info!(session_id = %session.id(), observer, "observer detached");
        }
        self.reclaim(session);
    }

    /// Remove `session` if it is completed and unobserved.
    ///
    /// Returns `true` only when this call removed it.
    pub fn reclaim(&self, session: &Session) -> bool {
        let mut sessions = self.sessions();
        let registered = sessions
            .get(&session.id())
            .is_some_and(|s| std::ptr::eq(Arc::as_ptr(s), session));
        if !registered || !session.is_reclaimable() {
            return false;
        }
        sessions.remove(&session.id());
        tracing::info!(session_id = %session.id(), live = sessions.len(), "session reclaimed");
        true
    }

    /// Send one keep-alive to every observer of every session.
    ///
    /// Dead observers are detached. Returns how many were dropped.
    pub fn keep_alive_all(&self) -> usize {
        let sessions: Vec<Arc<Session>> = self.sessions().values().cloned().collect();
        let mut dropped = 0;
        for session in sessions {
            let pruned = session.keep_alive();
            if pruned > 0 {
                tracing::debug!(
                    session_id = %session.id(),
                    pruned,
                    "keep-alive dropped dead observers"
                );
                dropped += pruned;
                self.reclaim(&session);
            }
        }
        dropped
    }

    /// Spawn the keep-alive loop. It stops once the registry is dropped.
    #[must_use]
    pub fn spawn_heartbeat(&self, interval: Duration) -> JoinHandle<()> {
        let registry: Weak<RegistryInner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(inner) = registry.upgrade() else {
                    break;
                };
                Self { inner }.keep_alive_all();
            }
        })
    }

    /// Refuse new sessions, drop every session and end every observer stream.
    ///
    /// Returns the number of sessions dropped.
    pub fn close(&self) -> usize {
        let drained: Vec<Arc<Session>> = {
            let mut sessions = self.sessions();
            self.inner.closed.store(true, Ordering::Release);
            sessions.drain().map(|(_, s)| s).collect()
        };
        for session in &drained {
            let observers = session.close_observers();
            tracing::debug!(session_id = %session.id(), observers, "session dropped at shutdown");
        }
        drained.len()
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("sessions", &self.len())
            .finish()
    }
}

/// An attached observer: replayed log followed by live frames.
///
/// Dropping it detaches the observer and lets the registry reclaim the session.
pub struct Subscription {
    registry: SessionRegistry,
    session: Arc<Session>,
    observer: ObserverId,
    replayed: usize,
    frames: UnboundedReceiverStream<Frame>,
}

impl Subscription {
    #[must_use]
    pub fn session_id(&self) -> SessionId {
        self.session.id()
    }

    #[must_use]
    pub const fn observer(&self) -> ObserverId {
        self.observer
    }

    /// Number of events replayed at attach time.
    #[must_use]
    pub const fn replayed(&self) -> usize {
        self.replayed
    }
}

impl Stream for Subscription {
    type Item = Frame;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Frame>> {
        Pin::new(&mut self.frames).poll_next(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.registry.detach(&self.session, self.observer);
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("session_id", &self.session.id())
            .field("observer", &self.observer)
            .field("replayed", &self.replayed)
            .finish_non_exhaustive()
    }
}
