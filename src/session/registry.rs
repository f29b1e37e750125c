//! Combined session store and transport registry.
//!
//! A session record and its live transport are kept in one entry so callers
//! can never observe one without the other. Mutation is atomic per key via
//! the sharded map's entry API; unrelated sessions do not contend on a
//! global lock.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::{mapref::entry::Entry, DashMap};
use tracing::{debug, error};

use crate::auth::Identity;
use crate::engine::{TransportEngine, TransportEvents};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// One logical client conversation.
#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: String,
    pub identity: Option<Identity>,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
}

struct Binding {
    session: Session,
    transport: Arc<dyn TransportEngine>,
}

pub struct SessionRegistry {
    bindings: DashMap<String, Binding>,
    stale_after: Duration,
    clock: Arc<dyn Clock>,
}

impl SessionRegistry {
    pub fn new(stale_timeout_ms: u64, clock: Arc<dyn Clock>) -> Self {
        Self {
            bindings: DashMap::new(),
            stale_after: Duration::milliseconds(stale_timeout_ms as i64),
            clock,
        }
    }

    /// Registers a session together with its transport. If a concurrent
    /// caller already bound the same id, the live existing transport is
    /// returned with a refreshed access time and `inserted` is false; the
    /// caller must discard its own instance. A stale existing entry is
    /// evicted and replaced instead.
    pub fn bind(
        &self,
        session_id: &str,
        identity: Option<Identity>,
        transport: Arc<dyn TransportEngine>,
    ) -> (Arc<dyn TransportEngine>, bool) {
        let now = self.clock.now();
        let fresh = |identity: Option<Identity>| Binding {
            session: Session {
                session_id: session_id.to_string(),
                identity,
                created_at: now,
                last_accessed_at: now,
            },
            transport: transport.clone(),
        };
        match self.bindings.entry(session_id.to_string()) {
            Entry::Occupied(mut entry) => {
                let binding = entry.get_mut();
                let stale = now.signed_duration_since(binding.session.last_accessed_at)
                    > self.stale_after;
                if stale {
                    debug!(session_id, "evicting stale session on rebind");
                    let old = std::mem::replace(binding, fresh(identity));
                    self.spawn_close(old.transport);
                    (transport, true)
                } else {
                    binding.session.last_accessed_at = now;
                    (binding.transport.clone(), false)
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(fresh(identity));
                (transport, true)
            }
        }
    }

    /// Returns the live transport for a valid session, refreshing its
    /// `last_accessed_at`. `None` covers missing, stale (evicted as a side
    /// effect), and identity-mismatched sessions alike.
    pub fn resolve(
        &self,
        session_id: &str,
        presented: Option<&Identity>,
    ) -> Option<Arc<dyn TransportEngine>> {
        self.check(session_id, presented, true)
    }

    /// Validity check without refreshing the access time.
    pub fn is_valid_for_identity(&self, session_id: &str, presented: Option<&Identity>) -> bool {
        self.check(session_id, presented, false).is_some()
    }

    fn check(
        &self,
        session_id: &str,
        presented: Option<&Identity>,
        touch: bool,
    ) -> Option<Arc<dyn TransportEngine>> {
        let now = self.clock.now();
        {
            let mut entry = self.bindings.get_mut(session_id)?;
            let binding = entry.value_mut();
            let stale = now.signed_duration_since(binding.session.last_accessed_at)
                > self.stale_after;
            if !stale {
                let permitted = binding
                    .session
                    .identity
                    .as_ref()
                    .map_or(true, |bound| bound.permits(presented));
                if !permitted {
                    debug!(session_id, "identity mismatch for live session");
                    return None;
                }
                if touch {
                    binding.session.last_accessed_at = now;
                }
                return Some(binding.transport.clone());
            }
        }

        // The guard must be released before removal.
        if let Some((_, binding)) = self.bindings.remove(session_id) {
            debug!(session_id, "evicting stale session");
            self.spawn_close(binding.transport);
        }
        None
    }

    /// Removes the session and closes its transport. Terminating an unknown
    /// id is a no-op.
    pub async fn terminate(&self, session_id: &str) {
        if let Some((_, binding)) = self.bindings.remove(session_id) {
            binding.transport.close().await;
        }
    }

    /// Engine-initiated removal: the transport is already closing itself, so
    /// only the mapping is dropped.
    pub fn unbind(&self, session_id: &str) {
        self.bindings.remove(session_id);
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    fn spawn_close(&self, transport: Arc<dyn TransportEngine>) {
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move { transport.close().await });
        }
    }
}

impl TransportEvents for SessionRegistry {
    fn on_closed(&self, session_id: &str) {
        self.unbind(session_id);
    }

    fn on_error(&self, session_id: &str, message: &str) {
        error!(session_id, error = %message, "transport engine reported an error");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    use axum::response::{IntoResponse, Response};
    use serde_json::{json, Value};

    use crate::errors::AppError;

    use super::*;

    struct ManualClock {
        now: Mutex<DateTime<Utc>>,
    }

    impl ManualClock {
        fn new() -> Self {
            Self {
                now: Mutex::new(Utc::now()),
            }
        }

        fn advance_ms(&self, ms: i64) {
            let mut now = self.now.lock().expect("clock lock");
            *now += Duration::milliseconds(ms);
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.now.lock().expect("clock lock")
        }
    }

    struct FakeTransport {
        closed: AtomicBool,
    }

    impl FakeTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                closed: AtomicBool::new(false),
            })
        }
    }

    #[async_trait::async_trait]
    impl TransportEngine for FakeTransport {
        async fn handle_request(&self, _payload: Value) -> Result<Option<Value>, AppError> {
            Ok(Some(json!({})))
        }

        async fn open_event_stream(&self) -> Result<Response, AppError> {
            Ok(().into_response())
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    fn registry(stale_timeout_ms: u64) -> (SessionRegistry, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        (
            SessionRegistry::new(stale_timeout_ms, clock.clone()),
            clock,
        )
    }

    fn identity(tenant: &str) -> Identity {
        Identity {
            tenant: Some(tenant.to_string()),
            client_id: None,
            subject: None,
        }
    }

    #[tokio::test]
    async fn bind_then_resolve_returns_transport() {
        let (registry, _clock) = registry(60_000);
        let transport = FakeTransport::new();
        let (_, inserted) = registry.bind("s1", None, transport);
        assert!(inserted);
        assert!(registry.resolve("s1", None).is_some());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn bind_existing_id_reuses_winner() {
        let (registry, _clock) = registry(60_000);
        let winner = FakeTransport::new();
        let loser = FakeTransport::new();
        let (_, inserted) = registry.bind("s1", None, winner.clone());
        assert!(inserted);

        let (resolved, inserted) = registry.bind("s1", None, loser.clone());
        assert!(!inserted);
        let winner_dyn: Arc<dyn TransportEngine> = winner;
        assert!(Arc::ptr_eq(&resolved, &winner_dyn));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn bind_existing_live_id_refreshes_access_time() {
        let (registry, clock) = registry(10_000);
        registry.bind("s1", None, FakeTransport::new());

        clock.advance_ms(9_000);
        let (_, inserted) = registry.bind("s1", None, FakeTransport::new());
        assert!(!inserted);

        // Staleness now counts from the rebind, not the original creation.
        clock.advance_ms(9_000);
        assert!(registry.is_valid_for_identity("s1", None));
    }

    #[tokio::test]
    async fn bind_over_stale_entry_replaces_it() {
        let (registry, clock) = registry(10_000);
        let old = FakeTransport::new();
        registry.bind("s1", Some(identity("acme")), old.clone());

        clock.advance_ms(10_001);
        let fresh = FakeTransport::new();
        let (resolved, inserted) = registry.bind("s1", Some(identity("globex")), fresh.clone());
        assert!(inserted, "a stale entry must not count as a concurrent winner");
        let fresh_dyn: Arc<dyn TransportEngine> = fresh;
        assert!(Arc::ptr_eq(&resolved, &fresh_dyn));

        // The new owner can use the id it was handed; the old one cannot.
        assert!(registry.resolve("s1", Some(&identity("globex"))).is_some());
        assert!(registry.resolve("s1", Some(&identity("acme"))).is_none());

        tokio::task::yield_now().await;
        assert!(old.closed.load(Ordering::SeqCst), "stale transport must be closed");
    }

    #[tokio::test]
    async fn terminate_invalidates_and_closes() {
        let (registry, _clock) = registry(60_000);
        let transport = FakeTransport::new();
        registry.bind("s1", None, transport.clone());

        registry.terminate("s1").await;
        assert!(!registry.is_valid_for_identity("s1", None));
        assert!(transport.closed.load(Ordering::SeqCst));

        // Idempotent for unknown ids.
        registry.terminate("s1").await;
        registry.terminate("never-existed").await;
    }

    #[tokio::test]
    async fn identity_mismatch_is_invalid_but_session_stays_live() {
        let (registry, _clock) = registry(60_000);
        registry.bind("s1", Some(identity("acme")), FakeTransport::new());

        assert!(!registry.is_valid_for_identity("s1", Some(&identity("globex"))));
        assert!(!registry.is_valid_for_identity("s1", None));
        assert!(registry.is_valid_for_identity("s1", Some(&identity("acme"))));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn identity_free_session_matches_any_caller() {
        let (registry, _clock) = registry(60_000);
        registry.bind("s1", None, FakeTransport::new());

        assert!(registry.is_valid_for_identity("s1", Some(&identity("acme"))));
        assert!(registry.is_valid_for_identity("s1", None));
    }

    #[tokio::test]
    async fn staleness_boundary_is_exclusive() {
        let (registry, clock) = registry(10_000);
        registry.bind("s1", None, FakeTransport::new());

        clock.advance_ms(9_999);
        assert!(registry.is_valid_for_identity("s1", None));

        clock.advance_ms(2);
        assert!(!registry.is_valid_for_identity("s1", None));
        assert_eq!(registry.len(), 0, "stale session must be evicted");
    }

    #[tokio::test]
    async fn resolve_refreshes_access_time() {
        let (registry, clock) = registry(10_000);
        registry.bind("s1", None, FakeTransport::new());

        clock.advance_ms(9_000);
        assert!(registry.resolve("s1", None).is_some());

        // Staleness now counts from the refreshed access, not creation.
        clock.advance_ms(9_000);
        assert!(registry.is_valid_for_identity("s1", None));
    }

    #[tokio::test]
    async fn unbind_drops_mapping_without_closing() {
        let (registry, _clock) = registry(60_000);
        let transport = FakeTransport::new();
        registry.bind("s1", None, transport.clone());

        registry.unbind("s1");
        assert!(registry.is_empty());
        assert!(!transport.closed.load(Ordering::SeqCst));
    }
}
