//! Refresh-token persistence.
//!
//! The refresh token is the only durable credential: it survives restarts so
//! the device can renew its access token without user interaction. The store
//! treats anything it cannot read back cleanly (missing file, oversized
//! file, stray bytes) as absent rather than erroring, so a corrupted record
//! degrades to "authorize again" instead of wedging startup.

use std::{fs, io, path::PathBuf};

/// Durable storage for the OAuth2 refresh token.
pub trait TokenStore: Send + Sync {
    /// Returns the stored token, or `None` when absent or unreadable.
    fn load(&self) -> Option<String>;

    fn save(&self, token: &str) -> io::Result<()>;

    fn clear(&self) -> io::Result<()>;
}

/// File-backed store holding the token as a single line.
#[derive(Clone, Debug)]
pub struct FileTokenStore {
    path: PathBuf,
}

impl FileTokenStore {
    /// Anything larger than this is not a refresh token.
    const MAX_SIZE: u64 = 1024;

    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl TokenStore for FileTokenStore {
    fn load(&self) -> Option<String> {
        let attributes = fs::metadata(&self.path).ok()?;
        if attributes.len() > Self::MAX_SIZE {
            warn!("ignoring oversized token record at {}", self.path.display());
            return None;
        }

        let contents = fs::read_to_string(&self.path).ok()?;
        let token = contents.trim();
        if token.is_empty() || !token.chars().all(|chr| chr.is_ascii_graphic()) {
            return None;
        }

        Some(token.to_owned())
    }

    fn save(&self, token: &str) -> io::Result<()> {
        fs::write(&self.path, token)
    }

    fn clear(&self) -> io::Result<()> {
        match fs::remove_file(&self.path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

/// In-memory store for tests and ephemeral runs.
#[derive(Debug, Default)]
pub struct MemoryTokenStore(std::sync::Mutex<Option<String>>);

impl TokenStore for MemoryTokenStore {
    fn load(&self) -> Option<String> {
        self.0.lock().ok()?.clone()
    }

    fn save(&self, token: &str) -> io::Result<()> {
        *self.0.lock().map_err(|e| io::Error::other(e.to_string()))? = Some(token.to_owned());
        Ok(())
    }

    fn clear(&self) -> io::Result<()> {
        *self.0.lock().map_err(|e| io::Error::other(e.to_string()))? = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_in(dir: &tempfile::TempDir) -> FileTokenStore {
        FileTokenStore::new(dir.path().join("refresh_token"))
    }

    #[test]
    fn round_trips_a_token() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        store.save("AQDnx7...long-opaque-value").unwrap();
        assert_eq!(store.load().as_deref(), Some("AQDnx7...long-opaque-value"));
    }

    #[test]
    fn clear_then_load_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        store.save("token").unwrap();
        store.clear().unwrap();
        assert_eq!(store.load(), None);

        // Clearing an already-absent record is not an error.
        store.clear().unwrap();
    }

    #[test]
    fn missing_file_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(store_in(&dir).load(), None);
    }

    #[test]
    fn corrupted_record_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        fs::write(dir.path().join("refresh_token"), b"tok\xffen\0").unwrap();
        assert_eq!(store.load(), None);

        fs::write(dir.path().join("refresh_token"), vec![b'a'; 2048]).unwrap();
        assert_eq!(store.load(), None);
    }
}
