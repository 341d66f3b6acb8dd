//! the opaque vault-driver boundary and the per-request unlock/search/lock
//! orchestration built on top of it
//!
//! modeled on `ghettobox::realm::Realm`: a small `Send + Sync` trait that
//! hides the concrete backend, plus a software test double
//! (`MockVaultDriver`, the analogue of `ghettobox::realm::software::SoftwareRealm`).

use std::sync::Mutex;

use crate::error::{Error, Result};
use crate::secret::SecretCell;

/// opaque handle returned by `unlock`, passed back to `list` and `lock`.
/// the broker never inspects its contents.
#[derive(Debug, Clone)]
pub struct VaultSessionHandle(pub String);

/// one item as listed by the vault driver
#[derive(Debug, Clone)]
pub struct VaultListItem {
    pub item_type: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// the external vault backend. production will likely swap implementations;
/// the broker must not embed any backend-specific parsing beyond "find the
/// first login item with both username and password populated" (see
/// `VaultOrchestrator::fetch`).
pub trait VaultDriver: Send + Sync {
    /// unlock the vault with the master secret. `Err(Error::WrongMaster)`
    /// signals a rejected password; any other `Err` is a driver failure.
    fn unlock(&self, master_secret: &[u8]) -> Result<VaultSessionHandle>;

    /// list items matching `search` within an unlocked session
    fn list(&self, search: &str, session: &VaultSessionHandle) -> Result<Vec<VaultListItem>>;

    /// lock the vault. always invoked exactly once per successful unlock,
    /// even when `list` failed or the caller is unwinding.
    fn lock(&self, session: &VaultSessionHandle) -> Result<()>;
}

/// outcome of a single `VaultOrchestrator::fetch` call. the credential
/// itself is never a bare `String`: it is wrapped in `SecretCell` the
/// instant it leaves the driver, exactly like the master secret, so it
/// can't linger unscrubbed in broker memory after the response is sent.
#[derive(Debug)]
pub enum VaultOutcome {
    Credential { username: SecretCell, password: SecretCell },
    NotFound,
    WrongMaster,
    DriverError { kind: String },
}

/// validate a domain per spec: alphanumerics, dots, hyphens, length <=253,
/// normalized lowercase. returns the normalized form.
pub fn normalize_domain(domain: &str) -> Option<String> {
    if domain.is_empty() || domain.len() > 253 {
        return None;
    }
    if !domain
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
    {
        return None;
    }
    Some(domain.to_ascii_lowercase())
}

/// serializes access to the vault driver: only one unlock/list/lock
/// transaction may be in flight at a time (spec §5's "second mutex distinct
/// from the registry lock").
pub struct VaultOrchestrator<D: VaultDriver> {
    driver: D,
    inflight: Mutex<()>,
}

impl<D: VaultDriver> VaultOrchestrator<D> {
    pub fn new(driver: D) -> Self {
        Self {
            driver,
            inflight: Mutex::new(()),
        }
    }

    /// unlock -> search -> lock, with `lock` guaranteed to run exactly once
    /// for every successful `unlock`, regardless of how `list` concludes.
    pub fn fetch(&self, domain: &str, master_secret_cell: &SecretCell) -> Result<VaultOutcome> {
        let _serialize = self.inflight.lock().unwrap_or_else(|e| e.into_inner());

        let normalized = match normalize_domain(domain) {
            Some(d) => d,
            None => {
                return Ok(VaultOutcome::DriverError {
                    kind: "invalid domain".into(),
                })
            }
        };

        let master_secret = master_secret_cell.borrow()?;

        let handle = match self.driver.unlock(master_secret) {
            Ok(handle) => handle,
            Err(Error::WrongMaster) => return Ok(VaultOutcome::WrongMaster),
            Err(e) => {
                return Ok(VaultOutcome::DriverError {
                    kind: e.to_string(),
                })
            }
        };

        // the lock guard runs on every exit from here on, success or error.
        let guard = LockGuard {
            driver: &self.driver,
            handle: Some(handle.clone()),
        };

        let items = self.driver.list(&normalized, &handle);
        drop(guard);

        match items {
            Ok(items) => {
                let found = items
                    .into_iter()
                    .find(|i| i.item_type == "login" && i.username.is_some() && i.password.is_some());
                match found {
                    // `into_bytes()` reuses the `String`'s own buffer, so the
                    // credential is moved straight into its cell with no
                    // intermediate unscrubbed copy.
                    Some(item) => Ok(VaultOutcome::Credential {
                        username: SecretCell::new(item.username.unwrap().into_bytes()),
                        password: SecretCell::new(item.password.unwrap().into_bytes()),
                    }),
                    None => Ok(VaultOutcome::NotFound),
                }
            }
            Err(e) => Ok(VaultOutcome::DriverError {
                kind: e.to_string(),
            }),
        }
    }
}

/// ties a `lock` call to the scope of an unlock, so that no return path —
/// success, error, or panic unwind — can leave the vault unlocked.
struct LockGuard<'a, D: VaultDriver> {
    driver: &'a D,
    handle: Option<VaultSessionHandle>,
}

impl<'a, D: VaultDriver> Drop for LockGuard<'a, D> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(e) = self.driver.lock(&handle) {
                tracing::warn!(error = %e, "vault lock failed after unlock");
            }
        }
    }
}

/// in-memory vault test double, modeled on
/// `ghettobox::realm::software::SoftwareRealm`
pub mod mock {
    use super::*;
    use std::collections::HashMap;
    use std::sync::{Mutex as StdMutex, RwLock};

    pub struct MockVaultDriver {
        pub expected_master: Vec<u8>,
        pub items: RwLock<HashMap<String, VaultListItem>>,
        pub locked: StdMutex<bool>,
    }

    impl MockVaultDriver {
        pub fn new(expected_master: impl Into<Vec<u8>>) -> Self {
            Self {
                expected_master: expected_master.into(),
                items: RwLock::new(HashMap::new()),
                locked: StdMutex::new(true),
            }
        }

        pub fn with_login(self, domain: &str, username: &str, password: &str) -> Self {
            self.items.write().unwrap().insert(
                domain.to_string(),
                VaultListItem {
                    item_type: "login".into(),
                    username: Some(username.to_string()),
                    password: Some(password.to_string()),
                },
            );
            self
        }

        pub fn is_locked(&self) -> bool {
            *self.locked.lock().unwrap()
        }
    }

    impl VaultDriver for MockVaultDriver {
        fn unlock(&self, master_secret: &[u8]) -> Result<VaultSessionHandle> {
            if master_secret != self.expected_master.as_slice() {
                return Err(Error::WrongMaster);
            }
            *self.locked.lock().unwrap() = false;
            Ok(VaultSessionHandle("mock-session".into()))
        }

        fn list(&self, search: &str, _session: &VaultSessionHandle) -> Result<Vec<VaultListItem>> {
            Ok(self
                .items
                .read()
                .unwrap()
                .get(search)
                .cloned()
                .into_iter()
                .collect())
        }

        fn lock(&self, _session: &VaultSessionHandle) -> Result<()> {
            *self.locked.lock().unwrap() = true;
            Ok(())
        }
    }
}
