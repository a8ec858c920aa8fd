//! Token Store: the single owner of the live session.
//!
//! Every authenticated request reads the session through [`TokenStore`], and
//! login/logout/invalidation all write through it. Persistence to a
//! [`SessionStorage`] backend is best effort: writes run on the blocking pool
//! when a tokio runtime is available, failures are logged, and neither ever
//! reaches the request path.

use std::sync::{Arc, Mutex, PoisonError, RwLock};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use time::{Duration, OffsetDateTime};
use tokio::sync::watch;

/// Lifetime the backend gives access tokens; used when the token carries no
/// readable `exp` claim.
pub const DEFAULT_ACCESS_TOKEN_TTL: Duration = Duration::minutes(30);

type StorageResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// Access/refresh token pair with an estimated expiry.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    access_token: String,
    refresh_token: String,
    #[serde(with = "time::serde::timestamp")]
    expires_at: OffsetDateTime,
}

impl Session {
    /// Creates a session, estimating `expires_at` from the access token's
    /// `exp` claim.
    #[must_use]
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        let access_token = access_token.into();
        let expires_at = estimate_expiry(&access_token, OffsetDateTime::now_utc());
        Self {
            access_token,
            refresh_token: refresh_token.into(),
            expires_at,
        }
    }

    #[must_use]
    pub fn with_expires_at(mut self, expires_at: OffsetDateTime) -> Self {
        self.expires_at = expires_at;
        self
    }

    #[must_use]
    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    #[must_use]
    pub fn refresh_token(&self) -> &str {
        &self.refresh_token
    }

    #[must_use]
    pub fn expires_at(&self) -> OffsetDateTime {
        self.expires_at
    }

    #[must_use]
    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        now >= self.expires_at
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Reads the `exp` claim from a JWT payload without verifying it.
///
/// Falls back to `now + DEFAULT_ACCESS_TOKEN_TTL` for anything that is not a
/// readable JWT.
#[must_use]
pub fn estimate_expiry(access_token: &str, now: OffsetDateTime) -> OffsetDateTime {
    read_exp_claim(access_token).unwrap_or(now + DEFAULT_ACCESS_TOKEN_TTL)
}

fn read_exp_claim(token: &str) -> Option<OffsetDateTime> {
    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() != 3 {
        return None;
    }
    let payload = URL_SAFE_NO_PAD
        .decode(parts[1].trim_end_matches('='))
        .ok()?;
    let claims: JsonValue = serde_json::from_slice(&payload).ok()?;
    let exp = claims.get("exp")?.as_i64()?;
    OffsetDateTime::from_unix_timestamp(exp).ok()
}

/// Durable key-value backing for the session.
///
/// Implementations must treat `clear` on an empty store as success.
pub trait SessionStorage: Send + Sync {
    fn load(&self) -> StorageResult<Option<Session>>;

    fn save(&self, session: &Session) -> StorageResult<()>;

    fn clear(&self) -> StorageResult<()>;
}

/// Non-durable storage, for tests and short-lived clients.
#[derive(Debug, Default)]
pub struct MemorySessionStorage {
    slot: Mutex<Option<Session>>,
}

impl MemorySessionStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populated storage, as if a previous run had saved `session`.
    #[must_use]
    pub fn with_session(session: Session) -> Self {
        Self {
            slot: Mutex::new(Some(session)),
        }
    }
}

impl SessionStorage for MemorySessionStorage {
    fn load(&self) -> StorageResult<Option<Session>> {
        Ok(self.slot.lock().unwrap_or_else(PoisonError::into_inner).clone())
    }

    fn save(&self, session: &Session) -> StorageResult<()> {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(session.clone());
        Ok(())
    }

    fn clear(&self) -> StorageResult<()> {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = None;
        Ok(())
    }
}

/// JSON file storage. The file is created with owner-only permissions on Unix.
#[cfg(feature = "persist")]
#[derive(Debug, Clone)]
pub struct FileSessionStorage {
    path: std::path::PathBuf,
}

#[cfg(feature = "persist")]
impl FileSessionStorage {
    #[must_use]
    pub fn new(path: impl Into<std::path::PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

#[cfg(feature = "persist")]
impl SessionStorage for FileSessionStorage {
    fn load(&self) -> StorageResult<Option<Session>> {
        match std::fs::read(&self.path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, session: &Session) -> StorageResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let bytes = serde_json::to_vec(session)?;
        std::fs::write(&self.path, bytes)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }

    fn clear(&self) -> StorageResult<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[derive(Debug, Default)]
struct StoreState {
    session: Option<Session>,
    /// Bumped on every change of `session`.
    epoch: u64,
}

/// Consistent view of the store taken under one lock.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub epoch: u64,
    pub session: Option<Session>,
}

impl SessionSnapshot {
    #[must_use]
    pub fn access_token(&self) -> Option<&str> {
        self.session.as_ref().map(Session::access_token)
    }
}

/// Applies session changes to a [`SessionStorage`] in epoch order.
struct Persistence {
    storage: Box<dyn SessionStorage>,
    /// Epoch of the last applied change. Held for the duration of a write.
    applied: Mutex<u64>,
    written: watch::Sender<u64>,
}

impl Persistence {
    fn new(storage: Box<dyn SessionStorage>, epoch: u64) -> Self {
        let (written, _) = watch::channel(epoch);
        Self {
            storage,
            applied: Mutex::new(epoch),
            written,
        }
    }

    /// Writes `session` (or clears storage for `None`) unless a newer change
    /// already landed.
    fn apply(&self, epoch: u64, session: Option<&Session>) {
        let mut applied = self.applied.lock().unwrap_or_else(PoisonError::into_inner);
        if epoch <= *applied {
            return;
        }
        match session {
            Some(session) => {
                if let Err(e) = self.storage.save(session) {
                    tracing::warn!(epoch, error = %e, "Failed to persist session");
                }
            }
            None => {
                if let Err(e) = self.storage.clear() {
                    tracing::warn!(epoch, error = %e, "Failed to clear persisted session");
                }
            }
        }
        *applied = epoch;
        self.written.send_replace(epoch);
    }
}

/// Holds at most one live [`Session`] per client.
pub struct TokenStore {
    state: RwLock<StoreState>,
    storage: Option<Arc<Persistence>>,
}

impl Default for TokenStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenStore {
    /// In-memory store with no durable backing.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: RwLock::new(StoreState::default()),
            storage: None,
        }
    }

    /// Store backed by `storage`, resuming any session it holds.
    ///
    /// A persisted session that has already expired is discarded.
    #[must_use]
    pub fn with_storage(storage: impl SessionStorage + 'static) -> Self {
        let resumed = match storage.load() {
            Ok(Some(session)) if session.is_expired_at(OffsetDateTime::now_utc()) => {
                tracing::debug!("Discarding expired persisted session");
                if let Err(e) = storage.clear() {
                    tracing::warn!(error = %e, "Failed to clear expired persisted session");
                }
                None
            }
            Ok(session) => session,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to load persisted session");
                None
            }
        };

        let epoch = u64::from(resumed.is_some());
        Self {
            state: RwLock::new(StoreState {
                session: resumed,
                epoch,
            }),
            storage: Some(Arc::new(Persistence::new(Box::new(storage), epoch))),
        }
    }

    /// Replaces the live session (login or refresh). Returns the new epoch.
    pub fn set_session(&self, session: Session) -> u64 {
        let epoch = {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            state.session = Some(session.clone());
            state.epoch += 1;
            state.epoch
        };
        self.persist(epoch, Some(session));
        epoch
    }

    #[must_use]
    pub fn access_token(&self) -> Option<String> {
        self.read(|state| state.session.as_ref().map(|s| s.access_token.clone()))
    }

    #[must_use]
    pub fn session(&self) -> Option<Session> {
        self.read(|state| state.session.clone())
    }

    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        self.read(|state| SessionSnapshot {
            epoch: state.epoch,
            session: state.session.clone(),
        })
    }

    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.read(|state| state.epoch)
    }

    #[must_use]
    pub fn has_session(&self) -> bool {
        self.read(|state| state.session.is_some())
    }

    /// Drops the live session. Idempotent; succeeds with no session.
    pub fn clear(&self) {
        let cleared = {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            if state.session.take().is_some() {
                state.epoch += 1;
                Some(state.epoch)
            } else {
                None
            }
        };
        if let Some(epoch) = cleared {
            self.persist(epoch, None);
        }
    }

    /// Clears the session only if it is still the one observed at `epoch`.
    ///
    /// Returns `true` when this call removed a session. A later login (new
    /// epoch) is never wiped by a 401 that belonged to an older session.
    pub fn invalidate_if_current(&self, epoch: u64) -> bool {
        let invalidated = {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            if state.epoch == epoch && state.session.is_some() {
                state.session = None;
                state.epoch += 1;
                Some(state.epoch)
            } else {
                None
            }
        };
        if let Some(epoch) = invalidated {
            self.persist(epoch, None);
        }
        invalidated.is_some()
    }

    /// Waits until every change made so far has reached storage.
    ///
    /// Returns immediately for a store without storage.
    pub async fn flush(&self) {
        let Some(persistence) = &self.storage else {
            return;
        };
        let target = self.epoch();
        let mut written = persistence.written.subscribe();
        // The sender lives in `self`, so this only ends once `target` is written.
        let _ = written.wait_for(|epoch| *epoch >= target).await;
    }

    /// Hands the change to the blocking pool, or applies it inline when no
    /// runtime is running.
    fn persist(&self, epoch: u64, session: Option<Session>) {
        let Some(persistence) = &self.storage else {
            return;
        };
        let persistence = Arc::clone(persistence);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn_blocking(move || persistence.apply(epoch, session.as_ref()));
            }
            Err(_) => persistence.apply(epoch, session.as_ref()),
        }
    }

    fn read<T>(&self, f: impl FnOnce(&StoreState) -> T) -> T {
        f(&self.state.read().unwrap_or_else(PoisonError::into_inner))
    }
}

impl std::fmt::Debug for TokenStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.snapshot();
        f.debug_struct("TokenStore")
            .field("epoch", &snapshot.epoch)
            .field("has_session", &snapshot.session.is_some())
            .field("persistent", &self.storage.is_some())
            .finish()
    }
}

/// Storage whose writes take `delay`, backed by a shared in-memory slot.
#[cfg(test)]
pub(crate) struct SlowStorage {
    pub(crate) delay: std::time::Duration,
    pub(crate) inner: Arc<MemorySessionStorage>,
}

#[cfg(test)]
impl SessionStorage for SlowStorage {
    fn load(&self) -> StorageResult<Option<Session>> {
        self.inner.load()
    }

    fn save(&self, session: &Session) -> StorageResult<()> {
        std::thread::sleep(self.delay);
        self.inner.save(session)
    }

    fn clear(&self) -> StorageResult<()> {
        std::thread::sleep(self.delay);
        self.inner.clear()
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration as StdDuration, Instant};

    use super::*;
    use serde_json::json;

    fn jwt_with_exp(exp: i64) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
        let payload = URL_SAFE_NO_PAD.encode(
            serde_json::to_vec(&json!({"sub": "alice", "type": "access", "exp": exp})).unwrap(),
        );
        format!("{header}.{payload}.signature")
    }

    #[test]
    fn expiry_is_read_from_exp_claim() {
        let now = OffsetDateTime::now_utc();
        let exp = now.unix_timestamp() + 600;
        let session = Session::new(jwt_with_exp(exp), "refresh");
        assert_eq!(session.expires_at().unix_timestamp(), exp);
    }

    #[test]
    fn opaque_token_gets_default_ttl() {
        let now = OffsetDateTime::UNIX_EPOCH;
        assert_eq!(estimate_expiry("opaque-token", now), now + DEFAULT_ACCESS_TOKEN_TTL);
        assert_eq!(estimate_expiry("a.!!!.c", now), now + DEFAULT_ACCESS_TOKEN_TTL);
    }

    #[test]
    fn debug_redacts_tokens() {
        let session = Session::new("secret-access", "secret-refresh");
        let rendered = format!("{session:?}");
        assert!(!rendered.contains("secret-access"));
        assert!(!rendered.contains("secret-refresh"));
    }

    #[test]
    fn set_and_read_session() {
        let store = TokenStore::new();
        assert_eq!(store.access_token(), None);

        let epoch = store.set_session(Session::new("access-1", "refresh-1"));
        assert_eq!(store.access_token().as_deref(), Some("access-1"));
        assert_eq!(store.epoch(), epoch);

        let newer = store.set_session(Session::new("access-2", "refresh-2"));
        assert!(newer > epoch);
        assert_eq!(store.access_token().as_deref(), Some("access-2"));
    }

    #[test]
    fn clear_is_idempotent() {
        let store = TokenStore::new();
        store.clear();
        store.set_session(Session::new("access", "refresh"));
        store.clear();
        store.clear();
        assert!(!store.has_session());
    }

    #[test]
    fn invalidation_only_hits_the_observed_session() {
        let store = TokenStore::new();
        let old = store.set_session(Session::new("old", "refresh"));
        let new = store.set_session(Session::new("new", "refresh"));

        assert!(!store.invalidate_if_current(old));
        assert_eq!(store.access_token().as_deref(), Some("new"));

        assert!(store.invalidate_if_current(new));
        assert!(!store.invalidate_if_current(new));
        assert!(!store.has_session());
    }

    #[test]
    fn storage_is_resumed_and_cleared() {
        let session = Session::new("persisted", "refresh");
        let store = TokenStore::with_storage(MemorySessionStorage::with_session(session));
        assert_eq!(store.access_token().as_deref(), Some("persisted"));

        store.clear();
        assert!(!store.has_session());
    }

    #[test]
    fn expired_persisted_session_is_dropped() {
        let expired = Session::new("stale", "refresh")
            .with_expires_at(OffsetDateTime::now_utc() - Duration::minutes(1));
        let store = TokenStore::with_storage(MemorySessionStorage::with_session(expired));
        assert!(!store.has_session());
    }

    struct BrokenStorage;

    impl SessionStorage for BrokenStorage {
        fn load(&self) -> StorageResult<Option<Session>> {
            Err("disk on fire".into())
        }

        fn save(&self, _session: &Session) -> StorageResult<()> {
            Err("disk on fire".into())
        }

        fn clear(&self) -> StorageResult<()> {
            Err("disk on fire".into())
        }
    }

    #[test]
    fn storage_failures_never_surface() {
        let store = TokenStore::with_storage(BrokenStorage);
        store.set_session(Session::new("access", "refresh"));
        assert_eq!(store.access_token().as_deref(), Some("access"));
        store.clear();
        assert!(!store.has_session());
    }

    #[tokio::test]
    async fn slow_storage_never_blocks_the_caller() {
        let saved = Arc::new(MemorySessionStorage::new());
        let store = TokenStore::with_storage(SlowStorage {
            delay: StdDuration::from_millis(500),
            inner: saved.clone(),
        });

        let timer = tokio::spawn(async {
            let started = Instant::now();
            tokio::time::sleep(StdDuration::from_millis(50)).await;
            started.elapsed()
        });
        tokio::task::yield_now().await;

        let started = Instant::now();
        let epoch = store.set_session(Session::new("first", "refresh"));
        assert!(store.invalidate_if_current(epoch));
        store.set_session(Session::new("second", "refresh"));
        assert!(started.elapsed() < StdDuration::from_millis(200));
        assert_eq!(store.access_token().as_deref(), Some("second"));

        // Other tasks on this runtime keep running while storage is busy.
        assert!(timer.await.unwrap() < StdDuration::from_millis(400));

        store.flush().await;
        let persisted = saved.load().unwrap().unwrap();
        assert_eq!(persisted.access_token(), "second");
    }

    #[tokio::test]
    async fn flush_waits_for_the_last_clear() {
        let saved = Arc::new(MemorySessionStorage::with_session(Session::new("old", "refresh")));
        let store = TokenStore::with_storage(SlowStorage {
            delay: StdDuration::from_millis(50),
            inner: saved.clone(),
        });

        store.set_session(Session::new("new", "refresh"));
        store.clear();
        store.flush().await;
        assert_eq!(saved.load().unwrap(), None);
    }

    #[cfg(feature = "persist")]
    #[test]
    fn file_storage_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("session.json");

        let store = TokenStore::with_storage(FileSessionStorage::new(&path));
        store.set_session(Session::new("file-access", "file-refresh"));
        assert!(path.exists());

        let resumed = TokenStore::with_storage(FileSessionStorage::new(&path));
        assert_eq!(resumed.access_token().as_deref(), Some("file-access"));

        resumed.clear();
        assert!(!path.exists());
        FileSessionStorage::new(&path).clear().unwrap();
    }
}
