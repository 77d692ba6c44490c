//! Durable account list. A single JSON document holding every imported
//! credential plus its mutable runtime state; every mutation rewrites the
//! file through a temp-file rename so a crash can lose at most the latest
//! update, never the document.

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TokenState {
    #[default]
    Unknown,
    Working,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AccountCredential {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub email_password: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub two_factor_secret: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountState {
    #[serde(flatten)]
    pub credential: AccountCredential,
    #[serde(default)]
    pub token_state: TokenState,
    #[serde(default)]
    pub failed_login: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failed_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limited_until: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_proxy: Option<String>,
}

impl AccountState {
    pub fn fresh(credential: AccountCredential) -> Self {
        Self {
            credential,
            token_state: TokenState::Unknown,
            failed_login: false,
            last_used: None,
            last_failed_at: None,
            rate_limited_until: None,
            assigned_proxy: None,
        }
    }

    pub fn username(&self) -> &str {
        &self.credential.username
    }
}

pub struct AccountStore {
    path: PathBuf,
    inner: Mutex<Vec<AccountState>>,
}

impl AccountStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let accounts = if path.exists() {
            let raw = fs::read_to_string(&path)
                .with_context(|| format!("failed to read account state {}", path.display()))?;
            serde_json::from_str::<Vec<AccountState>>(&raw)
                .with_context(|| format!("account state {} is not valid JSON", path.display()))?
        } else {
            Vec::new()
        };
        Ok(Self {
            path,
            inner: Mutex::new(accounts),
        })
    }

    /// Idempotent by username: an existing entry is left untouched.
    /// Returns the number of newly added accounts.
    pub fn add(&self, records: Vec<AccountCredential>) -> Result<usize> {
        let mut guard = self.inner.lock().expect("account store lock poisoned");
        let existing: HashSet<String> = guard.iter().map(|s| s.username().to_string()).collect();
        let mut added = 0;
        for record in records {
            if record.username.is_empty() || existing.contains(&record.username) {
                continue;
            }
            guard.push(AccountState::fresh(record));
            added += 1;
        }
        if added > 0 {
            self.persist(&guard)?;
        }
        Ok(added)
    }

    pub fn delete(&self, username: &str) -> Result<bool> {
        let mut guard = self.inner.lock().expect("account store lock poisoned");
        let before = guard.len();
        guard.retain(|s| s.username() != username);
        let removed = guard.len() != before;
        if removed {
            self.persist(&guard)?;
        }
        Ok(removed)
    }

    pub fn snapshot(&self) -> Vec<AccountState> {
        self.inner
            .lock()
            .expect("account store lock poisoned")
            .clone()
    }

    pub fn get(&self, username: &str) -> Option<AccountState> {
        self.inner
            .lock()
            .expect("account store lock poisoned")
            .iter()
            .find(|s| s.username() == username)
            .cloned()
    }

    /// Load-mutate-persist. Returns false when the username is unknown.
    pub fn update(&self, username: &str, mutator: impl FnOnce(&mut AccountState)) -> Result<bool> {
        let mut guard = self.inner.lock().expect("account store lock poisoned");
        let Some(state) = guard.iter_mut().find(|s| s.username() == username) else {
            return Ok(false);
        };
        mutator(state);
        self.persist(&guard)?;
        Ok(true)
    }

    /// Apply a mutator to every account and persist once.
    pub fn update_all(&self, mut mutator: impl FnMut(&mut AccountState)) -> Result<()> {
        let mut guard = self.inner.lock().expect("account store lock poisoned");
        for state in guard.iter_mut() {
            mutator(state);
        }
        self.persist(&guard)
    }

    fn persist(&self, accounts: &[AccountState]) -> Result<()> {
        let serialized = serde_json::to_string_pretty(accounts)?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, serialized)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to replace {}", self.path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credential(username: &str) -> AccountCredential {
        AccountCredential {
            username: username.to_string(),
            password: "pw".to_string(),
            email: format!("{username}@example.com"),
            email_password: "ep".to_string(),
            auth_token: None,
            two_factor_secret: None,
        }
    }

    #[test]
    fn add_is_idempotent_by_username() {
        let dir = tempfile::tempdir().unwrap();
        let store = AccountStore::open(dir.path().join("accounts.json")).unwrap();
        assert_eq!(store.add(vec![credential("alice")]).unwrap(), 1);
        assert_eq!(store.add(vec![credential("alice")]).unwrap(), 0);
        assert_eq!(store.snapshot().len(), 1);
    }

    #[test]
    fn update_persists_and_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("accounts.json");
        {
            let store = AccountStore::open(&path).unwrap();
            store.add(vec![credential("alice")]).unwrap();
            store
                .update("alice", |s| {
                    s.token_state = TokenState::Working;
                    s.last_used = Some(1234);
                })
                .unwrap();
        }
        let reopened = AccountStore::open(&path).unwrap();
        let state = reopened.get("alice").unwrap();
        assert_eq!(state.token_state, TokenState::Working);
        assert_eq!(state.last_used, Some(1234));
    }

    #[test]
    fn delete_removes_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store = AccountStore::open(dir.path().join("accounts.json")).unwrap();
        store.add(vec![credential("alice"), credential("bob")]).unwrap();
        assert!(store.delete("alice").unwrap());
        assert!(!store.delete("alice").unwrap());
        assert_eq!(store.snapshot().len(), 1);
    }

    #[test]
    fn update_unknown_username_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let store = AccountStore::open(dir.path().join("accounts.json")).unwrap();
        assert!(!store.update("ghost", |_| {}).unwrap());
    }

    #[test]
    fn missing_file_opens_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = AccountStore::open(dir.path().join("missing.json")).unwrap();
        assert!(store.snapshot().is_empty());
    }
}
