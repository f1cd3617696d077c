//! Session directory: join codes mapped to one presenter and its listeners.
//!
//! All state lives behind one `parking_lot` mutex that is never held across
//! an `.await`. Every connection belongs to at most one session; joining or
//! creating a new one drops the previous membership first.
//!
//! A [`SessionStore`] is optional. When present, every state change is
//! queued to a single writer task, so records land in the order the changes
//! happened and a slow or broken store never delays dispatch.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use parley_core::protocol::SettingsPatch;
use parley_core::{ConnectionId, RelayError, Role, SessionCode, SessionSettings};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::metrics::{SESSIONS_ACTIVE, SESSIONS_CREATED_TOTAL, SESSIONS_EXPIRED_TOTAL};
use crate::store::{SessionRecord, SessionStore, elapsed_since};

type CodeSource = Box<dyn Fn() -> SessionCode + Send + Sync>;

/// A listener's entry in a session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListenerInfo {
    /// Target language.
    pub language_code: String,
    /// Optional display name.
    pub display_name: Option<String>,
}

/// One session.
#[derive(Clone, Debug)]
pub struct Session {
    /// Join code.
    pub code: SessionCode,
    /// Live presenter, if attached.
    pub presenter_id: Option<ConnectionId>,
    /// Stable presenter identity used for reattachment.
    pub presenter_key: Option<String>,
    /// Presenter language.
    pub source_language: String,
    /// Presenter-owned settings.
    pub settings: SessionSettings,
    /// Listeners and their languages.
    pub listeners: HashMap<ConnectionId, ListenerInfo>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// When the presenter left, while detached.
    pub presenter_disconnected_at: Option<DateTime<Utc>>,
}

impl Session {
    fn new(
        code: SessionCode,
        presenter_id: ConnectionId,
        source_language: String,
        presenter_key: Option<String>,
    ) -> Self {
        Self {
            code,
            presenter_id: Some(presenter_id),
            presenter_key,
            source_language,
            settings: SessionSettings::default(),
            listeners: HashMap::new(),
            created_at: Utc::now(),
            presenter_disconnected_at: None,
        }
    }

    /// Whether a presenter is currently attached.
    pub fn has_presenter(&self) -> bool {
        self.presenter_id.is_some()
    }

    /// Listener ids grouped by language, in language order.
    pub fn listeners_by_language(&self) -> BTreeMap<String, Vec<ConnectionId>> {
        let mut groups: BTreeMap<String, Vec<ConnectionId>> = BTreeMap::new();
        for (id, info) in &self.listeners {
            groups
                .entry(info.language_code.clone())
                .or_default()
                .push(id.clone());
        }
        groups
    }

    fn is_expired_at(&self, now: DateTime<Utc>, grace: Duration) -> bool {
        self.presenter_id.is_none()
            && self
                .presenter_disconnected_at
                .is_some_and(|gone| elapsed_since(gone, now) >= grace)
    }

    fn within_grace(&self, now: DateTime<Utc>, grace: Duration) -> bool {
        self.presenter_id.is_none() && !self.is_expired_at(now, grace)
    }

    fn attach(&mut self, presenter_id: ConnectionId) {
        self.presenter_id = Some(presenter_id);
        self.presenter_disconnected_at = None;
    }

    fn to_record(&self) -> SessionRecord {
        SessionRecord {
            code: self.code.clone(),
            presenter_key: self.presenter_key.clone(),
            source_language: self.source_language.clone(),
            settings: self.settings.clone(),
            listener_count: self.listeners.len(),
            created_at: self.created_at,
            presenter_disconnected_at: self.presenter_disconnected_at,
            updated_at: Utc::now(),
        }
    }
}

/// What a connection's departure changed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LeaveOutcome {
    /// The connection was in no session.
    NotMember,
    /// A presenter detached; the session waits out the grace period.
    PresenterLeft {
        /// Session the presenter owned.
        code: SessionCode,
    },
    /// A listener left.
    ListenerLeft {
        /// Session the listener was in.
        code: SessionCode,
        /// Listeners still present.
        remaining: usize,
        /// Presenter to notify, if attached.
        presenter_id: Option<ConnectionId>,
    },
}

/// Result of resuming a session by code.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Resumed {
    /// The resumed session.
    pub code: SessionCode,
    /// Presenter socket that held the session until now. Its membership is
    /// already gone; the caller should close it.
    pub displaced: Option<ConnectionId>,
}

/// Result of a successful join.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Joined {
    /// Listeners after the join.
    pub listener_count: usize,
    /// Presenter of the session.
    pub presenter_id: ConnectionId,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Membership {
    Presenter(SessionCode),
    Listener(SessionCode),
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<SessionCode, Session>,
    members: HashMap<ConnectionId, Membership>,
}

impl Inner {
    /// Drop `id`'s membership. Returns the outcome plus the record to persist.
    fn leave(&mut self, id: &ConnectionId) -> (LeaveOutcome, Option<SessionRecord>) {
        let Some(membership) = self.members.remove(id) else {
            return (LeaveOutcome::NotMember, None);
        };
        match membership {
            Membership::Presenter(code) => match self.sessions.get_mut(&code) {
                Some(session) if session.presenter_id.as_ref() == Some(id) => {
                    session.presenter_id = None;
                    session.presenter_disconnected_at = Some(Utc::now());
                    let record = session.to_record();
                    (LeaveOutcome::PresenterLeft { code }, Some(record))
                }
                _ => (LeaveOutcome::NotMember, None),
            },
            Membership::Listener(code) => match self.sessions.get_mut(&code) {
                Some(session) => {
                    if session.listeners.remove(id).is_none() {
                        return (LeaveOutcome::NotMember, None);
                    }
                    let outcome = LeaveOutcome::ListenerLeft {
                        code,
                        remaining: session.listeners.len(),
                        presenter_id: session.presenter_id.clone(),
                    };
                    (outcome, Some(session.to_record()))
                }
                None => (LeaveOutcome::NotMember, None),
            },
        }
    }
}

enum StoreOp {
    Save(SessionRecord),
    Flush(oneshot::Sender<()>),
}

/// Feeds one writer task. The task is spawned on first use and respawned
/// if the runtime it lived on has gone away.
struct StoreWriter {
    store: Arc<dyn SessionStore>,
    tx: Mutex<Option<mpsc::UnboundedSender<StoreOp>>>,
}

impl StoreWriter {
    fn new(store: Arc<dyn SessionStore>) -> Self {
        Self {
            store,
            tx: Mutex::new(None),
        }
    }

    fn submit(&self, op: StoreOp) -> bool {
        let mut tx = self.tx.lock();
        let op = match tx.as_ref() {
            Some(sender) => match sender.send(op) {
                Ok(()) => return true,
                Err(mpsc::error::SendError(op)) => op,
            },
            None => op,
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            *tx = None;
            return false;
        };
        let (sender, rx) = mpsc::unbounded_channel();
        drop(handle.spawn(run_store_writer(Arc::clone(&self.store), rx)));
        let sent = sender.send(op).is_ok();
        *tx = Some(sender);
        sent
    }
}

async fn run_store_writer(
    store: Arc<dyn SessionStore>,
    mut rx: mpsc::UnboundedReceiver<StoreOp>,
) {
    while let Some(op) = rx.recv().await {
        match op {
            StoreOp::Save(record) => {
                if let Err(e) = store.save(&record).await {
                    warn!(session_code = %record.code, error = %e, "failed to persist session");
                }
            }
            StoreOp::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}

/// Join-code directory.
pub struct SessionDirectory {
    inner: Mutex<Inner>,
    code_source: CodeSource,
    max_attempts: u32,
    writer: Option<StoreWriter>,
}

impl SessionDirectory {
    /// Directory drawing random codes, giving up after `max_attempts`
    /// collisions.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            code_source: Box::new(SessionCode::random),
            max_attempts: max_attempts.max(1),
            writer: None,
        }
    }

    /// Replace the code generator.
    #[must_use]
    pub fn with_code_source<F>(mut self, source: F) -> Self
    where
        F: Fn() -> SessionCode + Send + Sync + 'static,
    {
        self.code_source = Box::new(source);
        self
    }

    /// Attach a persistence collaborator.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.writer = Some(StoreWriter::new(store));
        self
    }

    /// The persistence collaborator, if any.
    pub fn store(&self) -> Option<&Arc<dyn SessionStore>> {
        self.writer.as_ref().map(|w| &w.store)
    }

    /// Wait until every record queued so far has reached the store.
    pub async fn flush_store(&self) {
        let Some(writer) = &self.writer else {
            return;
        };
        let (done, wait) = oneshot::channel();
        if writer.submit(StoreOp::Flush(done)) {
            let _ = wait.await;
        }
    }

    /// Mint a code and create a session owned by `presenter_id`.
    ///
    /// Any previous membership of `presenter_id` is dropped first.
    pub fn create_session(
        &self,
        presenter_id: &ConnectionId,
        source_language: &str,
        presenter_key: Option<String>,
    ) -> Result<SessionCode, RelayError> {
        let (code, record, previous) = {
            let mut inner = self.inner.lock();
            let code = self.mint_code(&inner)?;
            let (_, previous) = inner.leave(presenter_id);
            let session = Session::new(
                code.clone(),
                presenter_id.clone(),
                source_language.to_owned(),
                presenter_key,
            );
            let record = session.to_record();
            let _ = inner.sessions.insert(code.clone(), session);
            let _ = inner
                .members
                .insert(presenter_id.clone(), Membership::Presenter(code.clone()));
            metrics::gauge!(SESSIONS_ACTIVE).set(inner.sessions.len() as f64);
            (code, record, previous)
        };
        metrics::counter!(SESSIONS_CREATED_TOTAL).increment(1);
        info!(session_code = %code, presenter_id = %presenter_id, "session created");
        self.persist_opt(previous);
        self.persist(record);
        Ok(code)
    }

    fn mint_code(&self, inner: &Inner) -> Result<SessionCode, RelayError> {
        for attempt in 1..=self.max_attempts {
            let code = (self.code_source)();
            if !inner.sessions.contains_key(&code) {
                return Ok(code);
            }
            debug!(attempt, session_code = %code, "session code collision");
        }
        warn!(attempts = self.max_attempts, "session code generation exhausted");
        Err(RelayError::CodeGenerationExhausted {
            attempts: self.max_attempts,
        })
    }

    /// Add a listener to a session that has a live presenter.
    pub fn join_session(
        &self,
        code: &SessionCode,
        listener_id: &ConnectionId,
        language_code: &str,
        display_name: Option<String>,
    ) -> Result<Joined, RelayError> {
        let (joined, record, previous) = {
            let mut inner = self.inner.lock();
            match inner.sessions.get(code) {
                Some(session) if session.has_presenter() => {}
                _ => return Err(RelayError::session_not_found(code.as_str())),
            }
            let (_, previous) = inner.leave(listener_id);
            let Some(session) = inner.sessions.get_mut(code) else {
                return Err(RelayError::session_not_found(code.as_str()));
            };
            let Some(presenter_id) = session.presenter_id.clone() else {
                return Err(RelayError::session_not_found(code.as_str()));
            };
            let _ = session.listeners.insert(
                listener_id.clone(),
                ListenerInfo {
                    language_code: language_code.to_owned(),
                    display_name,
                },
            );
            let joined = Joined {
                listener_count: session.listeners.len(),
                presenter_id,
            };
            let record = session.to_record();
            let _ = inner
                .members
                .insert(listener_id.clone(), Membership::Listener(code.clone()));
            (joined, record, previous)
        };
        debug!(
            session_code = %code,
            listener_id = %listener_id,
            language = language_code,
            listeners = joined.listener_count,
            "listener joined"
        );
        self.persist_opt(previous);
        self.persist(record);
        Ok(joined)
    }

    /// Remove a connection from whatever session it is in.
    ///
    /// Idempotent: a second call returns [`LeaveOutcome::NotMember`].
    pub fn leave_session(&self, id: &ConnectionId) -> LeaveOutcome {
        let (outcome, record) = self.inner.lock().leave(id);
        match &outcome {
            LeaveOutcome::PresenterLeft { code } => {
                info!(session_code = %code, presenter_id = %id, "presenter detached");
            }
            LeaveOutcome::ListenerLeft {
                code, remaining, ..
            } => {
                debug!(session_code = %code, listener_id = %id, remaining, "listener left");
            }
            LeaveOutcome::NotMember => {}
        }
        self.persist_opt(record);
        outcome
    }

    /// Resume the most recently detached session whose presenter key is
    /// `presenter_key`, if it is still within `grace`.
    pub fn reattach_presenter(
        &self,
        presenter_id: &ConnectionId,
        presenter_key: &str,
        grace: Duration,
    ) -> Option<SessionCode> {
        let now = Utc::now();
        let (code, record, previous) = {
            let mut inner = self.inner.lock();
            let code = inner
                .sessions
                .values()
                .filter(|s| s.presenter_key.as_deref() == Some(presenter_key))
                .filter(|s| s.within_grace(now, grace))
                .max_by_key(|s| s.presenter_disconnected_at)
                .map(|s| s.code.clone())?;
            let (_, previous) = inner.leave(presenter_id);
            let session = inner.sessions.get_mut(&code)?;
            session.attach(presenter_id.clone());
            let record = session.to_record();
            let _ = inner
                .members
                .insert(presenter_id.clone(), Membership::Presenter(code.clone()));
            (code, record, previous)
        };
        info!(session_code = %code, presenter_id = %presenter_id, "presenter reattached");
        self.persist_opt(previous);
        self.persist(record);
        Some(code)
    }

    /// Resume a specific in-memory session by code.
    ///
    /// Returns `Ok(None)` when the code is unknown or expired. A keyed
    /// session, live or detached, only accepts the same presenter key. A
    /// session without a key can be resumed by anyone while detached but
    /// never taken over while live. Anything else is forbidden.
    pub fn reattach_by_code(
        &self,
        code: &SessionCode,
        presenter_id: &ConnectionId,
        presenter_key: Option<&str>,
        grace: Duration,
    ) -> Result<Option<Resumed>, RelayError> {
        let now = Utc::now();
        let (record, previous, displaced) = {
            let mut inner = self.inner.lock();
            let Some(session) = inner.sessions.get(code) else {
                return Ok(None);
            };
            if session.is_expired_at(now, grace) {
                return Ok(None);
            }
            let current = session.presenter_id.clone();
            if current.as_ref() == Some(presenter_id) {
                return Ok(Some(Resumed {
                    code: code.clone(),
                    displaced: None,
                }));
            }
            let key_ok = match session.presenter_key.as_deref() {
                Some(stored) => presenter_key == Some(stored),
                None => current.is_none(),
            };
            if !key_ok {
                return Err(RelayError::forbidden(if current.is_some() {
                    format!("session {code} already has a presenter")
                } else {
                    format!("presenter key does not match session {code}")
                }));
            }
            if let Some(current) = &current {
                let _ = inner.members.remove(current);
                debug!(session_code = %code, displaced = %current, "presenter displaced");
            }
            let (_, previous) = inner.leave(presenter_id);
            let Some(session) = inner.sessions.get_mut(code) else {
                return Ok(None);
            };
            session.attach(presenter_id.clone());
            if session.presenter_key.is_none() {
                session.presenter_key = presenter_key.map(str::to_owned);
            }
            let record = session.to_record();
            let _ = inner
                .members
                .insert(presenter_id.clone(), Membership::Presenter(code.clone()));
            (record, previous, current)
        };
        info!(session_code = %code, presenter_id = %presenter_id, "presenter resumed session");
        self.persist_opt(previous);
        self.persist(record);
        Ok(Some(Resumed {
            code: code.clone(),
            displaced,
        }))
    }

    /// Rebuild a session from a persisted record (cold start).
    ///
    /// Returns `None` when the code is already live in memory, the record is
    /// expired, or its presenter key does not match.
    pub fn restore_session(
        &self,
        record: SessionRecord,
        presenter_id: &ConnectionId,
        presenter_key: Option<&str>,
        grace: Duration,
    ) -> Option<SessionCode> {
        if record.is_expired_at(Utc::now(), grace) {
            return None;
        }
        if let (Some(stored), Some(given)) = (record.presenter_key.as_deref(), presenter_key) {
            if stored != given {
                return None;
            }
        }
        let code = record.code.clone();
        let (saved, previous) = {
            let mut inner = self.inner.lock();
            if inner.sessions.contains_key(&code) {
                return None;
            }
            let (_, previous) = inner.leave(presenter_id);
            let session = Session {
                code: code.clone(),
                presenter_id: Some(presenter_id.clone()),
                presenter_key: record
                    .presenter_key
                    .or_else(|| presenter_key.map(str::to_owned)),
                source_language: record.source_language,
                settings: record.settings,
                listeners: HashMap::new(),
                created_at: record.created_at,
                presenter_disconnected_at: None,
            };
            let saved = session.to_record();
            let _ = inner.sessions.insert(code.clone(), session);
            let _ = inner
                .members
                .insert(presenter_id.clone(), Membership::Presenter(code.clone()));
            metrics::gauge!(SESSIONS_ACTIVE).set(inner.sessions.len() as f64);
            (saved, previous)
        };
        info!(session_code = %code, presenter_id = %presenter_id, "session restored from store");
        self.persist_opt(previous);
        self.persist(saved);
        Some(code)
    }

    /// Codes of sessions whose presenter has been gone at least `grace`.
    pub fn find_expired(&self, grace: Duration) -> Vec<SessionCode> {
        self.find_expired_at(Utc::now(), grace)
    }

    /// [`find_expired`](Self::find_expired) against an explicit clock.
    pub fn find_expired_at(&self, now: DateTime<Utc>, grace: Duration) -> Vec<SessionCode> {
        let mut codes: Vec<_> = self
            .inner
            .lock()
            .sessions
            .values()
            .filter(|s| s.is_expired_at(now, grace))
            .map(|s| s.code.clone())
            .collect();
        codes.sort();
        codes
    }

    /// Delete a session along with every membership in it. Connections
    /// that were members stay registered but no longer belong anywhere, so
    /// a later session minted under the same code never reaches them.
    pub fn remove_session(&self, code: &SessionCode) -> Option<Session> {
        let mut inner = self.inner.lock();
        let removed = inner.sessions.remove(code)?;
        for member in removed.presenter_id.iter().chain(removed.listeners.keys()) {
            let _ = inner.members.remove(member);
        }
        metrics::gauge!(SESSIONS_ACTIVE).set(inner.sessions.len() as f64);
        Some(removed)
    }

    /// Remove every expired session. Returns the removed codes.
    pub fn expire(&self, grace: Duration) -> Vec<SessionCode> {
        let expired = self.find_expired(grace);
        let mut removed = Vec::with_capacity(expired.len());
        for code in expired {
            if let Some(session) = self.remove_session(&code) {
                info!(
                    session_code = %code,
                    orphaned_listeners = session.listeners.len(),
                    "session expired"
                );
                removed.push(code);
            }
        }
        if !removed.is_empty() {
            metrics::counter!(SESSIONS_EXPIRED_TOTAL).increment(removed.len() as u64);
        }
        removed
    }

    /// Apply a settings patch to a session. Returns the effective settings.
    pub fn update_settings(
        &self,
        code: &SessionCode,
        patch: &SettingsPatch,
    ) -> Option<SessionSettings> {
        let (settings, record) = {
            let mut inner = self.inner.lock();
            let session = inner.sessions.get_mut(code)?;
            let changed = session.settings.apply(patch);
            (session.settings.clone(), changed.then(|| session.to_record()))
        };
        self.persist_opt(record);
        Some(settings)
    }

    /// Record the presenter's current language.
    pub fn set_source_language(&self, code: &SessionCode, language: &str) -> bool {
        let record = {
            let mut inner = self.inner.lock();
            let Some(session) = inner.sessions.get_mut(code) else {
                return false;
            };
            if session.source_language == language {
                return true;
            }
            language.clone_into(&mut session.source_language);
            session.to_record()
        };
        self.persist(record);
        true
    }

    /// Snapshot of one session.
    pub fn session(&self, code: &SessionCode) -> Option<Session> {
        self.inner.lock().sessions.get(code).cloned()
    }

    /// Whether `code` names a session in memory.
    pub fn contains(&self, code: &SessionCode) -> bool {
        self.inner.lock().sessions.contains_key(code)
    }

    /// Session settings, if the session exists.
    pub fn settings(&self, code: &SessionCode) -> Option<SessionSettings> {
        self.inner
            .lock()
            .sessions
            .get(code)
            .map(|s| s.settings.clone())
    }

    /// Listener count, if the session exists.
    pub fn listener_count(&self, code: &SessionCode) -> Option<usize> {
        self.inner
            .lock()
            .sessions
            .get(code)
            .map(|s| s.listeners.len())
    }

    /// Role and session of a connection, if it is a member.
    pub fn membership(&self, id: &ConnectionId) -> Option<(Role, SessionCode)> {
        self.inner.lock().members.get(id).map(|m| match m {
            Membership::Presenter(code) => (Role::Presenter, code.clone()),
            Membership::Listener(code) => (Role::Listener, code.clone()),
        })
    }

    /// Number of sessions in memory.
    pub fn len(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    /// Whether the directory is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().sessions.is_empty()
    }

    fn persist_opt(&self, record: Option<SessionRecord>) {
        if let Some(record) = record {
            self.persist(record);
        }
    }

    fn persist(&self, record: SessionRecord) {
        let Some(writer) = &self.writer else {
            return;
        };
        let code = record.code.clone();
        if !writer.submit(StoreOp::Save(record)) {
            debug!(session_code = %code, "no runtime, session record not persisted");
        }
    }
}

impl std::fmt::Debug for SessionDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionDirectory")
            .field("sessions", &self.len())
            .field("max_attempts", &self.max_attempts)
            .field("store", &self.writer.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parley_core::TranslationMode;

    use crate::store::MemorySessionStore;

    const GRACE: Duration = Duration::from_secs(300);

    fn id(s: &str) -> ConnectionId {
        ConnectionId::from(s)
    }

    fn code(s: &str) -> SessionCode {
        SessionCode::parse(s).unwrap()
    }

    fn scripted(codes: &'static [&'static str]) -> impl Fn() -> SessionCode + Send + Sync {
        let next = AtomicUsize::new(0);
        move || {
            let i = next.fetch_add(1, Ordering::SeqCst);
            code(codes[i.min(codes.len() - 1)])
        }
    }

    #[test]
    fn created_codes_are_unique_and_well_formed() {
        let dir = SessionDirectory::new(10);
        let mut seen = HashSet::new();
        for i in 0..200 {
            let code = dir
                .create_session(&id(&format!("p{i}")), "en-US", None)
                .unwrap();
            assert!(SessionCode::is_valid(code.as_str()));
            assert!(seen.insert(code));
        }
        assert_eq!(dir.len(), 200);
    }

    #[test]
    fn collision_retries_then_succeeds() {
        let dir = SessionDirectory::new(3).with_code_source(scripted(&["AAAAAA", "AAAAAA", "BBBBBB"]));
        assert_eq!(dir.create_session(&id("p1"), "en", None).unwrap(), code("AAAAAA"));
        assert_eq!(dir.create_session(&id("p2"), "en", None).unwrap(), code("BBBBBB"));
    }

    #[test]
    fn collision_exhaustion_fails_create() {
        let dir = SessionDirectory::new(3).with_code_source(|| SessionCode::parse("AAAAAA").unwrap());
        let _ = dir.create_session(&id("p1"), "en", None).unwrap();
        let err = dir.create_session(&id("p2"), "en", None).unwrap_err();
        assert_eq!(err, RelayError::CodeGenerationExhausted { attempts: 3 });
        assert!(dir.membership(&id("p2")).is_none());
        assert_eq!(dir.len(), 1);
    }

    #[test]
    fn join_unknown_code_fails() {
        let dir = SessionDirectory::new(10);
        let err = dir
            .join_session(&code("ZZZ999"), &id("l1"), "es-ES", None)
            .unwrap_err();
        assert_eq!(err.code(), "SESSION_NOT_FOUND");
    }

    #[test]
    fn join_requires_live_presenter() {
        let dir = SessionDirectory::new(10);
        let c = dir.create_session(&id("p1"), "en-US", None).unwrap();
        let _ = dir.leave_session(&id("p1"));
        let err = dir.join_session(&c, &id("l1"), "es-ES", None).unwrap_err();
        assert_eq!(err.code(), "SESSION_NOT_FOUND");
    }

    #[test]
    fn join_groups_listeners_by_language() {
        let dir = SessionDirectory::new(10);
        let c = dir.create_session(&id("p1"), "en-US", None).unwrap();
        let joined = dir.join_session(&c, &id("l1"), "es-ES", None).unwrap();
        assert_eq!(joined.listener_count, 1);
        assert_eq!(joined.presenter_id, id("p1"));
        let _ = dir.join_session(&c, &id("l2"), "es-ES", Some("Ana".into())).unwrap();
        let _ = dir.join_session(&c, &id("l3"), "fr-FR", None).unwrap();

        let groups = dir.session(&c).unwrap().listeners_by_language();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups["es-ES"].len(), 2);
        assert_eq!(groups["fr-FR"], vec![id("l3")]);
        assert_eq!(dir.membership(&id("l3")), Some((Role::Listener, c)));
    }

    #[test]
    fn leave_is_idempotent() {
        let dir = SessionDirectory::new(10);
        let c = dir.create_session(&id("p1"), "en-US", None).unwrap();
        let _ = dir.join_session(&c, &id("l1"), "es-ES", None).unwrap();

        assert_eq!(
            dir.leave_session(&id("l1")),
            LeaveOutcome::ListenerLeft {
                code: c.clone(),
                remaining: 0,
                presenter_id: Some(id("p1")),
            }
        );
        assert_eq!(dir.leave_session(&id("l1")), LeaveOutcome::NotMember);
        assert_eq!(dir.leave_session(&id("p1")), LeaveOutcome::PresenterLeft { code: c.clone() });
        let after_first = dir.session(&c).unwrap();
        assert_eq!(dir.leave_session(&id("p1")), LeaveOutcome::NotMember);
        let after_second = dir.session(&c).unwrap();
        assert_eq!(
            after_first.presenter_disconnected_at,
            after_second.presenter_disconnected_at
        );
    }

    #[test]
    fn presenter_leave_marks_disconnect() {
        let dir = SessionDirectory::new(10);
        let c = dir.create_session(&id("p1"), "en-US", None).unwrap();
        let _ = dir.leave_session(&id("p1"));
        let session = dir.session(&c).unwrap();
        assert!(session.presenter_id.is_none());
        assert!(session.presenter_disconnected_at.is_some());
    }

    #[test]
    fn reattach_by_presenter_key_within_grace() {
        let dir = SessionDirectory::new(10);
        let c = dir
            .create_session(&id("p1"), "en-US", Some("teacher-7".into()))
            .unwrap();
        let _ = dir.leave_session(&id("p1"));

        assert_eq!(dir.reattach_presenter(&id("p2"), "teacher-7", GRACE), Some(c.clone()));
        let session = dir.session(&c).unwrap();
        assert_eq!(session.presenter_id, Some(id("p2")));
        assert!(session.presenter_disconnected_at.is_none());
        assert_eq!(dir.membership(&id("p2")), Some((Role::Presenter, c)));
    }

    #[test]
    fn reattach_ignores_live_and_foreign_sessions() {
        let dir = SessionDirectory::new(10);
        let _ = dir
            .create_session(&id("p1"), "en-US", Some("teacher-7".into()))
            .unwrap();
        assert_eq!(dir.reattach_presenter(&id("p2"), "teacher-7", GRACE), None);
        let _ = dir.leave_session(&id("p1"));
        assert_eq!(dir.reattach_presenter(&id("p2"), "someone-else", GRACE), None);
    }

    #[test]
    fn reattach_fails_after_grace() {
        let dir = SessionDirectory::new(10);
        let _ = dir
            .create_session(&id("p1"), "en-US", Some("teacher-7".into()))
            .unwrap();
        let _ = dir.leave_session(&id("p1"));
        assert_eq!(dir.reattach_presenter(&id("p2"), "teacher-7", Duration::ZERO), None);
    }

    #[test]
    fn reattach_by_code_rules() {
        let dir = SessionDirectory::new(10);
        let c = dir
            .create_session(&id("p1"), "en-US", Some("k1".into()))
            .unwrap();

        let err = dir
            .reattach_by_code(&c, &id("intruder"), None, GRACE)
            .unwrap_err();
        assert_eq!(err.code(), "FORBIDDEN");

        // same key takes over a session whose old socket is not yet reaped
        assert_eq!(
            dir.reattach_by_code(&c, &id("p2"), Some("k1"), GRACE).unwrap(),
            Some(Resumed {
                code: c.clone(),
                displaced: Some(id("p1")),
            })
        );
        assert!(dir.membership(&id("p1")).is_none());
        assert_eq!(dir.leave_session(&id("p1")), LeaveOutcome::NotMember);
        assert_eq!(dir.session(&c).unwrap().presenter_id, Some(id("p2")));

        // asking again from the attached socket changes nothing
        assert_eq!(
            dir.reattach_by_code(&c, &id("p2"), Some("k1"), GRACE).unwrap(),
            Some(Resumed {
                code: c.clone(),
                displaced: None,
            })
        );

        let _ = dir.leave_session(&id("p2"));
        assert_eq!(
            dir.reattach_by_code(&c, &id("p3"), Some("k1"), GRACE).unwrap(),
            Some(Resumed {
                code: c.clone(),
                displaced: None,
            })
        );
        assert_eq!(
            dir.reattach_by_code(&code("ZZZ999"), &id("p4"), None, GRACE).unwrap(),
            None
        );
    }

    #[test]
    fn detached_keyed_session_rejects_other_keys() {
        let dir = SessionDirectory::new(10);
        let c = dir
            .create_session(&id("p1"), "en-US", Some("secret-key".into()))
            .unwrap();
        let _ = dir.join_session(&c, &id("l1"), "es-ES", None).unwrap();
        let _ = dir.leave_session(&id("p1"));

        for key in [Some("other-key"), None] {
            let err = dir.reattach_by_code(&c, &id("l1"), key, GRACE).unwrap_err();
            assert_eq!(err.code(), "FORBIDDEN");
        }
        let session = dir.session(&c).unwrap();
        assert!(session.presenter_id.is_none());
        assert_eq!(session.presenter_key.as_deref(), Some("secret-key"));
        assert_eq!(dir.membership(&id("l1")), Some((Role::Listener, c.clone())));

        let resumed = dir
            .reattach_by_code(&c, &id("p2"), Some("secret-key"), GRACE)
            .unwrap()
            .unwrap();
        assert_eq!(resumed.code, c);
        assert_eq!(dir.session(&c).unwrap().presenter_id, Some(id("p2")));
    }

    #[test]
    fn keyless_session_resumes_only_while_detached() {
        let dir = SessionDirectory::new(10);
        let c = dir.create_session(&id("p1"), "en-US", None).unwrap();
        let err = dir.reattach_by_code(&c, &id("p2"), None, GRACE).unwrap_err();
        assert_eq!(err.code(), "FORBIDDEN");

        let _ = dir.leave_session(&id("p1"));
        let resumed = dir
            .reattach_by_code(&c, &id("p2"), Some("k2"), GRACE)
            .unwrap()
            .unwrap();
        assert_eq!(resumed.displaced, None);
        // the first key to resume claims the session
        assert_eq!(dir.session(&c).unwrap().presenter_key.as_deref(), Some("k2"));
    }

    #[test]
    fn find_expired_respects_grace() {
        let dir = SessionDirectory::new(10);
        let live = dir.create_session(&id("p1"), "en-US", None).unwrap();
        let gone = dir.create_session(&id("p2"), "en-US", None).unwrap();
        let _ = dir.leave_session(&id("p2"));

        let now = Utc::now();
        assert!(dir.find_expired_at(now, GRACE).is_empty());
        let later = now + chrono::Duration::seconds(301);
        assert_eq!(dir.find_expired_at(later, GRACE), vec![gone]);
        assert!(!dir.find_expired_at(later, GRACE).contains(&live));
    }

    #[test]
    fn expire_drops_listener_memberships() {
        let dir = SessionDirectory::new(10);
        let c = dir.create_session(&id("p1"), "en-US", None).unwrap();
        let _ = dir.join_session(&c, &id("l1"), "es-ES", None).unwrap();
        let _ = dir.leave_session(&id("p1"));

        assert_eq!(dir.expire(Duration::ZERO), vec![c.clone()]);
        assert!(dir.session(&c).is_none());
        assert!(dir.membership(&id("l1")).is_none());
        assert_eq!(dir.leave_session(&id("l1")), LeaveOutcome::NotMember);
    }

    #[test]
    fn reminted_code_starts_without_old_listeners() {
        let dir = SessionDirectory::new(10).with_code_source(scripted(&["SAME01"]));
        let c = dir.create_session(&id("p1"), "en-US", None).unwrap();
        let _ = dir.join_session(&c, &id("l1"), "es-ES", None).unwrap();
        let _ = dir.leave_session(&id("p1"));
        let _ = dir.expire(Duration::ZERO);

        assert_eq!(dir.create_session(&id("p2"), "en-US", None).unwrap(), c);
        assert!(dir.membership(&id("l1")).is_none());
        assert_eq!(dir.listener_count(&c), Some(0));
    }

    #[test]
    fn rejoin_moves_listener() {
        let dir = SessionDirectory::new(10);
        let a = dir.create_session(&id("p1"), "en-US", None).unwrap();
        let b = dir.create_session(&id("p2"), "en-US", None).unwrap();
        let _ = dir.join_session(&a, &id("l1"), "es-ES", None).unwrap();
        let _ = dir.join_session(&b, &id("l1"), "de-DE", None).unwrap();
        assert_eq!(dir.listener_count(&a), Some(0));
        assert_eq!(dir.listener_count(&b), Some(1));
    }

    #[test]
    fn update_settings_applies_patch() {
        let dir = SessionDirectory::new(10);
        let c = dir.create_session(&id("p1"), "en-US", None).unwrap();
        let settings = dir
            .update_settings(
                &c,
                &SettingsPatch {
                    translation_mode: Some(TranslationMode::Manual),
                    tts_enabled: Some(false),
                },
            )
            .unwrap();
        assert_eq!(settings.translation_mode, TranslationMode::Manual);
        assert!(!settings.tts_enabled);
        assert_eq!(dir.settings(&c), Some(settings));
        assert!(dir.update_settings(&code("ZZZ999"), &SettingsPatch::default()).is_none());
    }

    #[tokio::test]
    async fn writes_reach_the_store() {
        let store = Arc::new(MemorySessionStore::new());
        let dir = SessionDirectory::new(10).with_store(store.clone());
        let c = dir.create_session(&id("p1"), "en-US", Some("k".into())).unwrap();
        let _ = dir.leave_session(&id("p1"));

        for _ in 0..50 {
            if let Some(record) = store.find_by_code(&c).await.unwrap() {
                if record.presenter_disconnected_at.is_some() {
                    return;
                }
            }
            tokio::task::yield_now().await;
        }
        panic!("session record never persisted");
    }

    #[tokio::test]
    async fn store_sees_changes_in_order() {
        let store = Arc::new(MemorySessionStore::new());
        let dir = SessionDirectory::new(10).with_store(store.clone());
        let c = dir.create_session(&id("p1"), "en-US", Some("k".into())).unwrap();
        for round in 0..20 {
            let _ = dir.leave_session(&id(&format!("p{}", round + 1)));
            let _ = dir.reattach_presenter(&id(&format!("p{}", round + 2)), "k", GRACE);
        }
        dir.flush_store().await;

        let record = store.find_by_code(&c).await.unwrap().unwrap();
        assert!(record.presenter_disconnected_at.is_none());
        assert_eq!(dir.session(&c).unwrap().presenter_id, Some(id("p21")));
    }

    #[tokio::test]
    async fn flush_without_store_returns() {
        SessionDirectory::new(10).flush_store().await;
    }

    #[test]
    fn restore_from_record() {
        let dir = SessionDirectory::new(10);
        let mut record = crate::store::sample_record("REST01");
        record.settings.translation_mode = TranslationMode::Manual;
        record.presenter_disconnected_at = Some(Utc::now());

        assert!(
            dir.restore_session(record.clone(), &id("p1"), Some("other"), GRACE)
                .is_none()
        );
        let restored = dir
            .restore_session(record.clone(), &id("p1"), Some("teacher-1"), GRACE)
            .unwrap();
        assert_eq!(restored, record.code);
        assert_eq!(
            dir.settings(&restored).unwrap().translation_mode,
            TranslationMode::Manual
        );
        // already live in memory
        assert!(dir.restore_session(record, &id("p2"), None, GRACE).is_none());
    }
}
