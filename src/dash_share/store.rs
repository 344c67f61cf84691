// dash_share - Shareable view-state links for weather dashboards
//
// Copyright 2022 Nick Pillitteri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
//

use crate::backend::{Backend, BackendError};
use crate::snapshot::{decode_record, encode_record, RecordError, StateSnapshot};
use crate::token::{InvalidToken, ShareToken};
use std::error;
use std::fmt;
use std::sync::Arc;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

#[derive(Debug)]
pub enum SaveError {
    Encode(serde_json::Error),
    Backend(BackendError),
    RetriesExhausted(u32),
}

impl fmt::Display for SaveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Encode(e) => write!(f, "unable to encode snapshot: {}", e),
            Self::Backend(e) => write!(f, "{}", e),
            Self::RetriesExhausted(n) => write!(f, "share token collisions after {} attempts", n),
        }
    }
}

impl error::Error for SaveError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::Encode(e) => Some(e),
            Self::Backend(e) => Some(e),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub enum LoadError {
    InvalidToken(InvalidToken),
    NotFound(ShareToken),
    CorruptRecord(ShareToken, RecordError),
    Backend(ShareToken, BackendError),
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidToken(e) => write!(f, "{}", e),
            Self::NotFound(t) => write!(f, "no shared view {}", t),
            Self::CorruptRecord(t, e) => write!(f, "shared view {} unreadable: {}", t, e),
            Self::Backend(t, e) => write!(f, "shared view {} unavailable: {}", t, e),
        }
    }
}

impl error::Error for LoadError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::InvalidToken(e) => Some(e),
            Self::CorruptRecord(_, e) => Some(e),
            Self::Backend(_, e) => Some(e),
            Self::NotFound(_) => None,
        }
    }
}

/// How the snapshot returned by `ShareStateStore::restore` was chosen.
#[derive(Debug)]
pub enum RestoreStatus {
    /// No token was requested.
    Default,
    Restored(ShareToken),
    /// A token was requested but could not be restored, the default was used instead.
    Fallback(LoadError),
}

#[derive(Debug)]
pub struct Restored {
    pub snapshot: StateSnapshot,
    pub status: RestoreStatus,
}

type TokenSource = Arc<dyn Fn() -> ShareToken + Send + Sync>;

/// Persist dashboard view state under generated tokens and resolve tokens back to it.
///
/// The store keeps no state of its own between calls. Durability and uniqueness are
/// delegated to the `Backend`: `save` relies on the backend's create-only `put` to
/// detect a token that is already taken and retries with a new one, up to the configured
/// number of attempts.
#[derive(Clone)]
pub struct ShareStateStore {
    backend: Arc<dyn Backend>,
    max_attempts: u32,
    tokens: TokenSource,
}

impl ShareStateStore {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        ShareStateStore {
            backend,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            tokens: Arc::new(ShareToken::generate),
        }
    }

    /// Set the number of tokens tried before `save` gives up. Values below one are treated as one.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Replace the random token generator.
    pub fn with_token_source<F>(mut self, tokens: F) -> Self
    where
        F: Fn() -> ShareToken + Send + Sync + 'static,
    {
        self.tokens = Arc::new(tokens);
        self
    }

    /// Persist a snapshot and return the token that names it.
    pub fn save(&self, snapshot: &StateSnapshot) -> Result<ShareToken, SaveError> {
        let bytes = encode_record(snapshot).map_err(SaveError::Encode)?;

        for attempt in 1..=self.max_attempts {
            let token = (self.tokens)();
            match self.backend.put(&token, &bytes) {
                Ok(_) => {
                    tracing::debug!(message = "saved shared view", token = %token, num_bytes = bytes.len());
                    return Ok(token);
                }
                Err(BackendError::Collision) => {
                    tracing::warn!(message = "share token collision, retrying", token = %token, attempt = attempt);
                }
                Err(e) => return Err(SaveError::Backend(e)),
            }
        }

        Err(SaveError::RetriesExhausted(self.max_attempts))
    }

    /// Resolve an untrusted token string to the snapshot it names.
    ///
    /// The string is validated before the backend is touched.
    pub fn load(&self, raw: &str) -> Result<StateSnapshot, LoadError> {
        let token = ShareToken::parse(raw).map_err(LoadError::InvalidToken)?;
        self.load_token(token)
    }

    fn load_token(&self, token: ShareToken) -> Result<StateSnapshot, LoadError> {
        let bytes = match self.backend.get(&token) {
            Ok(b) => b,
            Err(BackendError::NotFound) => return Err(LoadError::NotFound(token)),
            Err(e) => return Err(LoadError::Backend(token, e)),
        };

        decode_record(&bytes).map_err(|e| LoadError::CorruptRecord(token, e))
    }

    /// Pick the snapshot to render for a page load.
    ///
    /// `raw` is the value of the `state` query parameter, if any. Every load failure is
    /// logged and replaced with `default`, this method never fails.
    pub fn restore(&self, raw: Option<&str>, default: &StateSnapshot) -> Restored {
        let raw = match raw {
            Some(r) => r,
            None => {
                return Restored {
                    snapshot: default.clone(),
                    status: RestoreStatus::Default,
                }
            }
        };

        let res = ShareToken::parse(raw)
            .map_err(LoadError::InvalidToken)
            .and_then(|token| self.load_token(token.clone()).map(|snapshot| (token, snapshot)));

        match res {
            Ok((token, snapshot)) => {
                tracing::debug!(message = "restored shared view", token = %token);
                Restored {
                    snapshot,
                    status: RestoreStatus::Restored(token),
                }
            }
            Err(e) => {
                match &e {
                    LoadError::InvalidToken(reason) => {
                        tracing::info!(message = "rejected invalid share token", reason = %reason);
                    }
                    LoadError::NotFound(token) => {
                        tracing::info!(message = "shared view not found", token = %token);
                    }
                    LoadError::CorruptRecord(token, reason) => {
                        tracing::warn!(message = "corrupt shared view record", token = %token, error = %reason);
                    }
                    LoadError::Backend(token, reason) => {
                        tracing::error!(message = "unable to read shared view", token = %token, error = %reason);
                    }
                }

                Restored {
                    snapshot: default.clone(),
                    status: RestoreStatus::Fallback(e),
                }
            }
        }
    }
}

impl fmt::Debug for ShareStateStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShareStateStore")
            .field("backend", &self.backend)
            .field("max_attempts", &self.max_attempts)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{FileBackend, MemoryBackend};
    use serde_json::{json, Value};
    use std::collections::HashSet;
    use std::fs;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn snapshot(value: Value) -> StateSnapshot {
        serde_json::from_value(value).unwrap()
    }

    fn sample() -> StateSnapshot {
        snapshot(json!({
            "station": "KBOS",
            "start": "2023-06-01",
            "end": "2023-08-31",
            "tab": "temperature",
            "variables": ["tmax", "tmin", "prcp"],
        }))
    }

    /// Backend that counts every call made to it.
    #[derive(Debug, Default)]
    struct CountingBackend {
        inner: MemoryBackend,
        calls: AtomicUsize,
    }

    impl Backend for CountingBackend {
        fn put(&self, token: &ShareToken, bytes: &[u8]) -> Result<(), BackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.put(token, bytes)
        }

        fn get(&self, token: &ShareToken) -> Result<Vec<u8>, BackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.get(token)
        }
    }

    #[derive(Debug)]
    struct BrokenBackend;

    impl Backend for BrokenBackend {
        fn put(&self, _token: &ShareToken, _bytes: &[u8]) -> Result<(), BackendError> {
            Err(BackendError::Unavailable(io::Error::new(io::ErrorKind::Other, "disk on fire")))
        }

        fn get(&self, _token: &ShareToken) -> Result<Vec<u8>, BackendError> {
            Err(BackendError::Unavailable(io::Error::new(io::ErrorKind::Other, "disk on fire")))
        }
    }

    fn sequence(tokens: &[&str]) -> impl Fn() -> ShareToken + Send + Sync + 'static {
        let tokens: Vec<ShareToken> = tokens.iter().map(|t| ShareToken::parse(t).unwrap()).collect();
        let next = Mutex::new(0);
        move || {
            let mut i = next.lock().unwrap();
            let t = tokens[(*i).min(tokens.len() - 1)].clone();
            *i += 1;
            t
        }
    }

    #[test]
    fn save_then_load_memory() {
        let store = ShareStateStore::new(Arc::new(MemoryBackend::new()));
        let token = store.save(&sample()).unwrap();
        assert_eq!(sample(), store.load(token.as_str()).unwrap());
    }

    #[test]
    fn save_then_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = ShareStateStore::new(Arc::new(FileBackend::new(dir.path()).unwrap()));
        let token = store.save(&sample()).unwrap();

        assert!(dir.path().join(format!("{}.json", token)).is_file());
        assert_eq!(sample(), store.load(token.as_str()).unwrap());
    }

    #[test]
    fn save_empty_snapshot() {
        let store = ShareStateStore::new(Arc::new(MemoryBackend::new()));
        let token = store.save(&StateSnapshot::default()).unwrap();
        assert_eq!(StateSnapshot::default(), store.load(token.as_str()).unwrap());
    }

    #[test]
    fn saved_tokens_pass_validation() {
        let store = ShareStateStore::new(Arc::new(MemoryBackend::new()));
        for _ in 0..50 {
            let token = store.save(&sample()).unwrap();
            assert!(ShareToken::parse(token.as_str()).is_ok());
        }
    }

    #[test]
    fn load_is_idempotent() {
        let store = ShareStateStore::new(Arc::new(MemoryBackend::new()));
        let token = store.save(&sample()).unwrap();

        let first = store.load(token.as_str()).unwrap();
        for _ in 0..5 {
            assert_eq!(first, store.load(token.as_str()).unwrap());
        }
    }

    #[test]
    fn load_rejects_injection_without_backend_access() {
        let backend = Arc::new(CountingBackend::default());
        let store = ShareStateStore::new(backend.clone());

        for raw in ["../../etc/passwd", "a/b", "a b", "", "abc.json", "%2e%2e"] {
            assert!(matches!(store.load(raw), Err(LoadError::InvalidToken(_))), "{:?}", raw);
        }

        assert_eq!(0, backend.calls.load(Ordering::SeqCst));
    }

    #[test]
    fn load_missing_token() {
        let store = ShareStateStore::new(Arc::new(MemoryBackend::new()));
        assert!(matches!(store.load("does-not-exist"), Err(LoadError::NotFound(_))));
    }

    #[test]
    fn load_truncated_record_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(FileBackend::new(dir.path()).unwrap());
        let store = ShareStateStore::new(backend.clone());
        let token = store.save(&sample()).unwrap();

        let path = backend.record_path(&token);
        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() - 5]).unwrap();

        assert!(matches!(store.load(token.as_str()), Err(LoadError::CorruptRecord(_, _))));
    }

    #[test]
    fn save_retries_on_collision() {
        let backend = Arc::new(MemoryBackend::new());
        let first = ShareStateStore::new(backend.clone()).with_token_source(sequence(&["taken"]));
        first.save(&snapshot(json!({"station": "KBOS"}))).unwrap();

        let store = ShareStateStore::new(backend.clone()).with_token_source(sequence(&["taken", "taken", "fresh"]));
        let token = store.save(&snapshot(json!({"station": "KORD"}))).unwrap();

        assert_eq!("fresh", token.as_str());
        assert_eq!(snapshot(json!({"station": "KBOS"})), store.load("taken").unwrap());
        assert_eq!(snapshot(json!({"station": "KORD"})), store.load("fresh").unwrap());
    }

    #[test]
    fn save_gives_up_after_max_attempts() {
        let backend = Arc::new(MemoryBackend::new());
        let store = ShareStateStore::new(backend.clone())
            .with_max_attempts(3)
            .with_token_source(sequence(&["taken"]));

        store.save(&snapshot(json!({"station": "KBOS"}))).unwrap();
        let res = store.save(&snapshot(json!({"station": "KORD"})));

        assert!(matches!(res, Err(SaveError::RetriesExhausted(3))));
        assert_eq!(snapshot(json!({"station": "KBOS"})), store.load("taken").unwrap());
        assert_eq!(1, backend.len());
    }

    #[test]
    fn save_surfaces_backend_failure() {
        let store = ShareStateStore::new(Arc::new(BrokenBackend));
        assert!(matches!(store.save(&sample()), Err(SaveError::Backend(_))));
    }

    #[test]
    fn concurrent_saves_yield_distinct_tokens() {
        let dir = tempfile::tempdir().unwrap();
        let store = ShareStateStore::new(Arc::new(FileBackend::new(dir.path()).unwrap()));

        let saved: Vec<(ShareToken, StateSnapshot)> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..10)
                .map(|t| {
                    let store = &store;
                    scope.spawn(move || {
                        (0..100)
                            .map(|i| {
                                let s = snapshot(json!({"thread": t, "index": i}));
                                (store.save(&s).unwrap(), s)
                            })
                            .collect::<Vec<_>>()
                    })
                })
                .collect();

            handles.into_iter().flat_map(|h| h.join().unwrap()).collect()
        });

        let distinct: HashSet<&ShareToken> = saved.iter().map(|(t, _)| t).collect();
        assert_eq!(1000, distinct.len());

        for (token, s) in &saved {
            assert_eq!(s, &store.load(token.as_str()).unwrap());
        }
    }

    #[test]
    fn concurrent_saves_with_colliding_tokens_never_overwrite() {
        let backend = Arc::new(MemoryBackend::new());
        let counter = Arc::new(AtomicUsize::new(0));
        let source = counter.clone();
        // Every token is handed out twice so concurrent writers race for the same names.
        let store = ShareStateStore::new(backend.clone())
            .with_max_attempts(10)
            .with_token_source(move || {
                let n = source.fetch_add(1, Ordering::SeqCst) / 2;
                ShareToken::parse(&format!("t-{}", n)).unwrap()
            });

        let saved: Vec<(ShareToken, StateSnapshot)> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..4)
                .map(|t| {
                    let store = &store;
                    scope.spawn(move || {
                        (0..50)
                            .map(|i| {
                                let s = snapshot(json!({"thread": t, "index": i}));
                                (store.save(&s).unwrap(), s)
                            })
                            .collect::<Vec<_>>()
                    })
                })
                .collect();

            handles.into_iter().flat_map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(200, backend.len());
        for (token, s) in &saved {
            assert_eq!(s, &store.load(token.as_str()).unwrap());
        }
    }

    #[test]
    fn restore_without_token_uses_default() {
        let store = ShareStateStore::new(Arc::new(MemoryBackend::new()));
        let default = snapshot(json!({"station": "KBOS", "tab": "overview"}));

        let restored = store.restore(None, &default);
        assert_eq!(default, restored.snapshot);
        assert!(matches!(restored.status, RestoreStatus::Default));
    }

    #[test]
    fn restore_with_token() {
        let store = ShareStateStore::new(Arc::new(MemoryBackend::new()));
        let token = store.save(&sample()).unwrap();

        let restored = store.restore(Some(token.as_str()), &StateSnapshot::default());
        assert_eq!(sample(), restored.snapshot);
        assert!(matches!(restored.status, RestoreStatus::Restored(t) if t == token));
    }

    #[test]
    fn restore_falls_back_on_any_failure() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(FileBackend::new(dir.path()).unwrap());
        let store = ShareStateStore::new(backend.clone());
        let default = snapshot(json!({"tab": "overview"}));

        let token = store.save(&sample()).unwrap();
        fs::write(backend.record_path(&token), b"{\"station\": \"KB").unwrap();

        for raw in ["../../etc/passwd", "missing-token", token.as_str()] {
            let restored = store.restore(Some(raw), &default);
            assert_eq!(default, restored.snapshot);
            assert!(matches!(restored.status, RestoreStatus::Fallback(_)));
        }

        let broken = ShareStateStore::new(Arc::new(BrokenBackend));
        let restored = broken.restore(Some("abc"), &default);
        assert!(matches!(restored.status, RestoreStatus::Fallback(LoadError::Backend(_, _))));
    }
}
