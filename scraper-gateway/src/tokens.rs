//! Downstream bearer tokens. A single JSON document of opaque issued
//! tokens; the request middleware only ever asks "is this value known" and
//! stamps `last_used` on the way through.

use crate::store::now_ms;
use anyhow::{Context, Result};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use uuid::Uuid;

const TOKEN_VALUE_LEN: usize = 32;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuedToken {
    pub id: String,
    pub name: String,
    pub value: String,
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used: Option<i64>,
}

pub struct TokenStore {
    path: PathBuf,
    inner: Mutex<Vec<IssuedToken>>,
}

impl TokenStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let tokens = if path.exists() {
            let raw = fs::read_to_string(&path)
                .with_context(|| format!("failed to read token db {}", path.display()))?;
            serde_json::from_str::<Vec<IssuedToken>>(&raw)
                .with_context(|| format!("token db {} is not valid JSON", path.display()))?
        } else {
            Vec::new()
        };
        Ok(Self {
            path,
            inner: Mutex::new(tokens),
        })
    }

    pub fn issue(&self, name: &str) -> Result<IssuedToken> {
        let value: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(TOKEN_VALUE_LEN)
            .map(char::from)
            .collect();
        let token = IssuedToken {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            value,
            created_at: now_ms(),
            last_used: None,
        };
        let mut guard = self.inner.lock().expect("token store lock poisoned");
        guard.push(token.clone());
        self.persist(&guard)?;
        Ok(token)
    }

    pub fn validate(&self, value: &str) -> bool {
        self.inner
            .lock()
            .expect("token store lock poisoned")
            .iter()
            .any(|t| t.value == value)
    }

    pub fn touch(&self, value: &str) {
        let mut guard = self.inner.lock().expect("token store lock poisoned");
        let Some(token) = guard.iter_mut().find(|t| t.value == value) else {
            return;
        };
        token.last_used = Some(now_ms());
        // Usage stamps are best-effort; a lost write only loses freshness.
        let _ = self.persist(&guard);
    }

    pub fn list(&self) -> Vec<IssuedToken> {
        self.inner
            .lock()
            .expect("token store lock poisoned")
            .clone()
    }

    pub fn revoke(&self, id: &str) -> Result<bool> {
        let mut guard = self.inner.lock().expect("token store lock poisoned");
        let before = guard.len();
        guard.retain(|t| t.id != id);
        let removed = guard.len() != before;
        if removed {
            self.persist(&guard)?;
        }
        Ok(removed)
    }

    fn persist(&self, tokens: &[IssuedToken]) -> Result<()> {
        let serialized = serde_json::to_string_pretty(tokens)?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, serialized)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to replace {}", self.path.display()))?;
        Ok(())
    }
}
