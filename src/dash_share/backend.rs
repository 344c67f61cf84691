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

use crate::token::ShareToken;
use std::collections::HashMap;
use std::error;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use uuid::Uuid;

#[derive(Debug)]
pub enum BackendError {
    NotFound,
    Collision,
    Unavailable(io::Error),
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "record not found"),
            Self::Collision => write!(f, "record already exists"),
            Self::Unavailable(e) => write!(f, "storage unavailable: {}", e),
        }
    }
}

impl error::Error for BackendError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::Unavailable(e) => Some(e),
            _ => None,
        }
    }
}

/// Durable keyed storage for share records.
///
/// Records are create-only: `put` must fail with `BackendError::Collision` rather than
/// replace an existing record, and a record must become visible to `get` all at once.
pub trait Backend: fmt::Debug + Send + Sync {
    fn put(&self, token: &ShareToken, bytes: &[u8]) -> Result<(), BackendError>;

    fn get(&self, token: &ShareToken) -> Result<Vec<u8>, BackendError>;
}

/// Records stored as `<root>/<token>.json`.
///
/// Writes go to a hidden temporary file in the same directory which is then hard linked
/// to the final name. Linking fails if the final name exists, so publishing a record is
/// atomic and never replaces another record. Temporary names contain a `.` which no
/// token can, so they never collide with a record name.
#[derive(Debug)]
pub struct FileBackend {
    root: PathBuf,
}

impl FileBackend {
    /// Create a backend rooted at `root`, creating the directory if needed.
    pub fn new<P: Into<PathBuf>>(root: P) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(FileBackend { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn record_path(&self, token: &ShareToken) -> PathBuf {
        self.root.join(format!("{}.json", token))
    }

    fn temp_path(&self, token: &ShareToken) -> PathBuf {
        self.root.join(format!(".{}.{}.tmp", token, Uuid::new_v4().simple()))
    }

    fn write_temp(path: &Path, bytes: &[u8]) -> io::Result<()> {
        let mut file = File::create(path)?;
        file.write_all(bytes)?;
        file.sync_all()
    }
}

impl Backend for FileBackend {
    fn put(&self, token: &ShareToken, bytes: &[u8]) -> Result<(), BackendError> {
        let path = self.record_path(token);
        let tmp = self.temp_path(token);

        let res = Self::write_temp(&tmp, bytes).and_then(|_| fs::hard_link(&tmp, &path));
        if let Err(e) = fs::remove_file(&tmp) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!(message = "unable to remove temporary record", path = %tmp.display(), error = %e);
            }
        }

        match res {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Err(BackendError::Collision),
            Err(e) => Err(BackendError::Unavailable(e)),
        }
    }

    fn get(&self, token: &ShareToken) -> Result<Vec<u8>, BackendError> {
        match fs::read(self.record_path(token)) {
            Ok(b) => Ok(b),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(BackendError::NotFound),
            Err(e) => Err(BackendError::Unavailable(e)),
        }
    }
}

/// Records held in process memory, lost on exit.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    records: Mutex<HashMap<ShareToken, Vec<u8>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records, zero if the lock is poisoned.
    pub fn len(&self) -> usize {
        match self.records.lock() {
            Ok(r) => r.len(),
            Err(_) => {
                tracing::error!(message = "memory backend lock poisoned, unable to count records");
                0
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn poisoned() -> BackendError {
        BackendError::Unavailable(io::Error::new(io::ErrorKind::Other, "memory backend lock poisoned"))
    }
}

impl Backend for MemoryBackend {
    fn put(&self, token: &ShareToken, bytes: &[u8]) -> Result<(), BackendError> {
        let mut records = self.records.lock().map_err(|_| Self::poisoned())?;
        if records.contains_key(token) {
            return Err(BackendError::Collision);
        }

        records.insert(token.clone(), bytes.to_vec());
        Ok(())
    }

    fn get(&self, token: &ShareToken) -> Result<Vec<u8>, BackendError> {
        let records = self.records.lock().map_err(|_| Self::poisoned())?;
        records.get(token).cloned().ok_or(BackendError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(raw: &str) -> ShareToken {
        ShareToken::parse(raw).unwrap()
    }

    #[test]
    fn file_put_then_get() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::new(dir.path()).unwrap();

        backend.put(&token("abc"), b"{\"a\":1}").unwrap();
        assert_eq!(b"{\"a\":1}".to_vec(), backend.get(&token("abc")).unwrap());
        assert_eq!(dir.path().join("abc.json"), backend.record_path(&token("abc")));
    }

    #[test]
    fn file_new_creates_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("nested").join("share");
        let backend = FileBackend::new(&root).unwrap();

        assert!(root.is_dir());
        assert_eq!(root.as_path(), backend.root());
    }

    #[test]
    fn file_get_missing() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::new(dir.path()).unwrap();

        assert!(matches!(backend.get(&token("missing")), Err(BackendError::NotFound)));
    }

    #[test]
    fn file_put_existing_is_collision() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::new(dir.path()).unwrap();

        backend.put(&token("abc"), b"first").unwrap();
        assert!(matches!(backend.put(&token("abc"), b"second"), Err(BackendError::Collision)));
        assert_eq!(b"first".to_vec(), backend.get(&token("abc")).unwrap());
    }

    #[test]
    fn file_put_leaves_no_temporary_files() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::new(dir.path()).unwrap();

        backend.put(&token("abc"), b"first").unwrap();
        let _ = backend.put(&token("abc"), b"second");

        let names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(vec!["abc.json".to_owned()], names);
    }

    #[test]
    fn memory_put_then_get() {
        let backend = MemoryBackend::new();
        assert!(backend.is_empty());

        backend.put(&token("abc"), b"data").unwrap();
        assert_eq!(b"data".to_vec(), backend.get(&token("abc")).unwrap());
        assert_eq!(1, backend.len());
    }

    #[test]
    fn memory_put_existing_is_collision() {
        let backend = MemoryBackend::new();

        backend.put(&token("abc"), b"first").unwrap();
        assert!(matches!(backend.put(&token("abc"), b"second"), Err(BackendError::Collision)));
        assert_eq!(b"first".to_vec(), backend.get(&token("abc")).unwrap());
    }

    #[test]
    fn memory_poisoned_lock_is_unavailable() {
        let backend = MemoryBackend::new();
        backend.put(&token("abc"), b"data").unwrap();

        let res = std::thread::scope(|scope| {
            scope
                .spawn(|| {
                    let _guard = backend.records.lock().unwrap();
                    panic!("poison the lock");
                })
                .join()
        });
        assert!(res.is_err());

        assert_eq!(0, backend.len());
        assert!(matches!(backend.get(&token("abc")), Err(BackendError::Unavailable(_))));
        assert!(matches!(backend.put(&token("def"), b"data"), Err(BackendError::Unavailable(_))));
    }

    #[test]
    fn memory_get_missing() {
        let backend = MemoryBackend::new();
        assert!(matches!(backend.get(&token("missing")), Err(BackendError::NotFound)));
    }
}
