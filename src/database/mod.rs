//! Credential store: a fixed pool of backend handles used to verify
//! login and registration forms.
//!
//! Worker threads call [`CredentialPool::verify`], which checks a handle out
//! of the pool for the duration of one lookup. When every handle is in use,
//! `acquire` blocks on a counting condition; if none frees up within the
//! configured timeout the caller gets [`CredentialError::Unavailable`] and the
//! request is answered with a 503 rather than tearing the process down.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;

/// Errors from the credential store.
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("no credential backend became available")]
    Unavailable,
}

/// One connection-like handle onto the user table.
pub trait CredentialBackend: Send {
    /// Returns the stored password for `username`, if the user exists.
    fn lookup(&mut self, username: &str) -> Result<Option<String>, CredentialError>;

    /// Stores a new user.
    fn insert(&mut self, username: &str, password: &str) -> Result<(), CredentialError>;
}

/// In-memory user table. Clones share the same rows, so several pool handles
/// can be created from one table.
#[derive(Debug, Clone, Default)]
pub struct MemoryUserTable {
    rows: Arc<Mutex<HashMap<String, String>>>,
}

impl MemoryUserTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a table holding the given `(username, password)` rows.
    pub fn with_users<I, U, P>(users: I) -> Self
    where
        I: IntoIterator<Item = (U, P)>,
        U: Into<String>,
        P: Into<String>,
    {
        let rows = users
            .into_iter()
            .map(|(u, p)| (u.into(), p.into()))
            .collect();
        Self {
            rows: Arc::new(Mutex::new(rows)),
        }
    }

    /// Number of stored users.
    pub fn len(&self) -> usize {
        self.rows().len()
    }

    /// Returns `true` if no user is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn rows(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.rows.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl CredentialBackend for MemoryUserTable {
    fn lookup(&mut self, username: &str) -> Result<Option<String>, CredentialError> {
        Ok(self.rows().get(username).cloned())
    }

    fn insert(&mut self, username: &str, password: &str) -> Result<(), CredentialError> {
        self.rows()
            .insert(username.to_owned(), password.to_owned());
        Ok(())
    }
}

type BoxedBackend = Box<dyn CredentialBackend>;

/// Fixed-size pool of credential backends.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use rttpd::database::{CredentialPool, MemoryUserTable};
///
/// let table = MemoryUserTable::with_users([("alice", "secret")]);
/// let pool = CredentialPool::in_memory(&table, 2, Duration::from_millis(100));
///
/// assert!(pool.verify("alice", "secret", true).unwrap());
/// assert!(!pool.verify("alice", "wrong", true).unwrap());
/// assert!(pool.verify("bob", "pw", false).unwrap());
/// assert_eq!(table.len(), 2);
/// ```
pub struct CredentialPool {
    free: Mutex<Vec<BoxedBackend>>,
    available: Condvar,
    size: usize,
    acquire_timeout: Duration,
}

impl CredentialPool {
    /// Builds a pool from ready-made backends.
    pub fn new(backends: Vec<BoxedBackend>, acquire_timeout: Duration) -> Self {
        let size = backends.len();
        Self {
            free: Mutex::new(backends),
            available: Condvar::new(),
            size,
            acquire_timeout,
        }
    }

    /// A pool of `size` handles onto the same in-memory table.
    pub fn in_memory(table: &MemoryUserTable, size: usize, acquire_timeout: Duration) -> Self {
        let backends = (0..size)
            .map(|_| Box::new(table.clone()) as BoxedBackend)
            .collect();
        Self::new(backends, acquire_timeout)
    }

    /// Total number of handles the pool was built with.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Handles currently checked in.
    pub fn free_count(&self) -> usize {
        self.lock_free().len()
    }

    /// Checks a handle out, blocking up to the acquire timeout.
    ///
    /// The handle returns to the pool when the guard is dropped.
    pub fn acquire(&self) -> Result<PooledBackend<'_>, CredentialError> {
        if self.size == 0 {
            return Err(CredentialError::Unavailable);
        }
        let guard = self.lock_free();
        let (mut free, _) = self
            .available
            .wait_timeout_while(guard, self.acquire_timeout, |free| free.is_empty())
            .unwrap_or_else(PoisonError::into_inner);
        let backend = free.pop().ok_or(CredentialError::Unavailable)?;
        Ok(PooledBackend {
            pool: self,
            backend: Some(backend),
        })
    }

    /// Returns a handle to the pool and wakes one waiter.
    pub fn release(&self, backend: BoxedBackend) {
        self.lock_free().push(backend);
        self.available.notify_one();
    }

    /// Checks a form submission against the user table.
    ///
    /// In login mode the stored password must match. In register mode the
    /// name must be unused, and is then inserted. An empty username or
    /// password never verifies.
    pub fn verify(
        &self,
        username: &str,
        password: &str,
        is_login: bool,
    ) -> Result<bool, CredentialError> {
        if username.is_empty() || password.is_empty() {
            return Ok(false);
        }
        let mut backend = self.acquire()?;
        let verified = match backend.lookup(username)? {
            Some(stored) => is_login && stored == password,
            None if is_login => false,
            None => {
                backend.insert(username, password)?;
                true
            }
        };
        tracing::debug!(user = username, is_login, verified, "credential check");
        Ok(verified)
    }

    fn lock_free(&self) -> MutexGuard<'_, Vec<BoxedBackend>> {
        self.free.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for CredentialPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialPool")
            .field("size", &self.size)
            .field("free", &self.free_count())
            .field("acquire_timeout", &self.acquire_timeout)
            .finish()
    }
}

/// A checked-out backend; derefs to the handle and releases it on drop.
pub struct PooledBackend<'a> {
    pool: &'a CredentialPool,
    backend: Option<BoxedBackend>,
}

impl Deref for PooledBackend<'_> {
    type Target = dyn CredentialBackend;

    fn deref(&self) -> &Self::Target {
        match &self.backend {
            Some(b) => b.as_ref(),
            None => unreachable!("backend taken before drop"),
        }
    }
}

impl DerefMut for PooledBackend<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match &mut self.backend {
            Some(b) => b.as_mut(),
            None => unreachable!("backend taken before drop"),
        }
    }
}

impl Drop for PooledBackend<'_> {
    fn drop(&mut self) {
        if let Some(backend) = self.backend.take() {
            self.pool.release(backend);
        }
    }
}
