//! API Key Authority
//!
//! Issues, validates and revokes scoped API keys. Secrets are shown once,
//! at issuance; only their SHA-256 digests are kept in memory and on disk.
//!
//! Scope rules:
//! - `Admin` covers every scope and is held only by the admin key
//! - `ManageAll` covers every `ManageServer(alias)`
//! - a new key's scopes must all be covered by the issuer's scopes

pub mod store;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;
use thiserror::Error;

use crate::utils::current_timestamp;
pub use store::{JsonKeyStore, KeyStorage, MemoryKeyStore, StorageError, StoredKey};

/// Length of the public key id (hex chars of the secret's digest).
const KEY_ID_LEN: usize = 12;

/// Minimum seconds between two auth-failure warnings.
const AUTH_FAIL_LOG_INTERVAL_SECS: u64 = 30;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("invalid API key")]
    Unauthorized,

    #[error("API key lacks the required permission")]
    Forbidden,

    #[error("permission denied: {0}")]
    Permission(String),

    #[error("API key not found")]
    KeyNotFound,

    #[error("an API key named '{0}' already exists")]
    DuplicateOwner(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl AuthError {
    fn permission(reason: impl Into<String>) -> Self {
        AuthError::Permission(reason.into())
    }
}

// ─── Scope ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Scope {
    Admin,
    IssueKeys,
    ManageAll,
    ManageServer(String),
}

impl Scope {
    /// Whether holding `self` satisfies a requirement of `required`.
    pub fn covers(&self, required: &Scope) -> bool {
        match (self, required) {
            (Scope::Admin, _) => true,
            (Scope::ManageAll, Scope::ManageServer(_)) => true,
            (held, required) => held == required,
        }
    }

    pub fn manage(alias: &str) -> Self {
        Scope::ManageServer(alias.to_string())
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Admin => f.write_str("admin"),
            Scope::IssueKeys => f.write_str("issue_keys"),
            Scope::ManageAll => f.write_str("manage_all"),
            Scope::ManageServer(alias) => write!(f, "manage_server:{}", alias),
        }
    }
}

impl FromStr for Scope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "admin" => Ok(Scope::Admin),
            "issue_keys" => Ok(Scope::IssueKeys),
            "manage_all" => Ok(Scope::ManageAll),
            other => match other.strip_prefix("manage_server:") {
                Some(alias) if !alias.is_empty() => Ok(Scope::ManageServer(alias.to_string())),
                _ => Err(format!("unknown scope '{}'", other)),
            },
        }
    }
}

impl TryFrom<String> for Scope {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Scope> for String {
    fn from(scope: Scope) -> Self {
        scope.to_string()
    }
}

fn scopes_cover(held: &BTreeSet<Scope>, required: &Scope) -> bool {
    held.iter().any(|s| s.covers(required))
}

fn admin_scopes() -> BTreeSet<Scope> {
    [Scope::Admin, Scope::IssueKeys, Scope::ManageAll].into_iter().collect()
}

// ─── Key values ──────────────────────────────────────────────

/// Public metadata of a key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApiKey {
    pub id: String,
    pub owner: String,
    pub created_at: u64,
    pub scopes: BTreeSet<Scope>,
    pub admin: bool,
}

impl ApiKey {
    pub fn allows(&self, required: &Scope) -> bool {
        scopes_cover(&self.scopes, required)
    }
}

impl From<&StoredKey> for ApiKey {
    fn from(record: &StoredKey) -> Self {
        Self {
            id: record.id.clone(),
            owner: record.owner.clone(),
            created_at: record.created_at,
            scopes: record.scopes.clone(),
            admin: record.admin,
        }
    }
}

/// A freshly created key. `secret` is not recoverable afterwards.
#[derive(Debug, Clone, Serialize)]
pub struct IssuedKey {
    pub secret: String,
    pub key: ApiKey,
}

/// Result of `generate_admin_key`.
#[derive(Debug, Clone)]
pub enum AdminKey {
    Generated(IssuedKey),
    /// An admin key already exists; its secret cannot be shown again.
    Existing(ApiKey),
}

impl AdminKey {
    pub fn key(&self) -> &ApiKey {
        match self {
            AdminKey::Generated(issued) => &issued.key,
            AdminKey::Existing(key) => key,
        }
    }

    pub fn secret(&self) -> Option<&str> {
        match self {
            AdminKey::Generated(issued) => Some(&issued.secret),
            AdminKey::Existing(_) => None,
        }
    }
}

// ─── Authority ───────────────────────────────────────────────

struct KeyEntry {
    digest: [u8; 32],
    record: StoredKey,
}

impl KeyEntry {
    fn from_record(record: StoredKey) -> Option<Self> {
        let bytes = hex::decode(&record.hash).ok()?;
        let digest: [u8; 32] = bytes.try_into().ok()?;
        Some(Self { digest, record })
    }
}

pub struct KeyAuthority {
    store: Box<dyn KeyStorage>,
    keys: Mutex<Vec<KeyEntry>>,
    fail_last_log: Mutex<Option<Instant>>,
    fail_suppressed: AtomicU64,
}

impl KeyAuthority {
    /// Load all keys from `store`. Storage failure here is fatal to the caller.
    pub fn load(store: Box<dyn KeyStorage>) -> Result<Self, StorageError> {
        let records = store.load()?;
        let total = records.len();
        let entries: Vec<KeyEntry> = records
            .into_iter()
            .filter_map(|record| {
                let id = record.id.clone();
                let entry = KeyEntry::from_record(record);
                if entry.is_none() {
                    tracing::warn!("Skipping key {} with malformed hash", id);
                }
                entry
            })
            .collect();

        tracing::info!("Loaded {} API keys ({} skipped)", entries.len(), total - entries.len());
        Ok(Self {
            store,
            keys: Mutex::new(entries),
            fail_last_log: Mutex::new(None),
            fail_suppressed: AtomicU64::new(0),
        })
    }

    /// Create the admin key on first boot. Later calls return the existing one.
    pub fn generate_admin_key(&self) -> Result<AdminKey, AuthError> {
        let mut keys = self.keys.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = keys.iter().find(|k| k.record.admin) {
            return Ok(AdminKey::Existing(ApiKey::from(&existing.record)));
        }

        let (secret, entry) = new_entry("admin", admin_scopes(), true);
        let key = ApiKey::from(&entry.record);
        keys.push(entry);
        self.persist(&mut keys)?;

        tracing::info!("Generated admin API key {}", key.id);
        Ok(AdminKey::Generated(IssuedKey { secret, key }))
    }

    /// Resolve a secret to its key, without any scope requirement.
    pub fn authenticate(&self, secret: &str) -> Result<ApiKey, AuthError> {
        let digest = digest_of(secret);
        let keys = self.keys.lock().unwrap_or_else(|e| e.into_inner());
        match find_by_digest(&keys, &digest) {
            Some(index) => Ok(ApiKey::from(&keys[index].record)),
            None => {
                drop(keys);
                self.log_failure(&digest, "unknown key");
                Err(AuthError::Unauthorized)
            }
        }
    }

    pub fn authorize(&self, secret: &str, required: &Scope) -> Result<ApiKey, AuthError> {
        let key = self.authenticate(secret)?;
        if key.allows(required) {
            Ok(key)
        } else {
            tracing::warn!("API key {} denied: requires {}", key.id, required);
            Err(AuthError::Forbidden)
        }
    }

    pub fn issue(
        &self,
        requester: &str,
        owner: &str,
        scopes: BTreeSet<Scope>,
    ) -> Result<IssuedKey, AuthError> {
        let issuer = self.authenticate(requester)?;
        if !issuer.allows(&Scope::IssueKeys) {
            return Err(AuthError::permission("requester cannot issue keys"));
        }
        if scopes.contains(&Scope::Admin) {
            return Err(AuthError::permission("the admin scope cannot be issued"));
        }
        if let Some(excess) = scopes.iter().find(|s| !issuer.allows(s)) {
            return Err(AuthError::permission(format!(
                "scope '{}' exceeds the requester's scopes",
                excess
            )));
        }

        let (secret, entry) = new_entry(owner, scopes, false);
        let key = ApiKey::from(&entry.record);
        {
            let mut keys = self.keys.lock().unwrap_or_else(|e| e.into_inner());
            // owner 라벨은 키 목록에서 식별자로 쓰이므로 중복 불가
            if keys.iter().any(|k| k.record.owner == owner) {
                return Err(AuthError::DuplicateOwner(owner.to_string()));
            }
            keys.push(entry);
            self.persist(&mut keys)?;
        }

        tracing::info!(
            "API key {} issued to '{}' by {} with scopes [{}]",
            key.id,
            key.owner,
            issuer.id,
            join_scopes(&key.scopes)
        );
        Ok(IssuedKey { secret, key })
    }

    /// Revoke the key whose secret is `target`.
    pub fn revoke(&self, requester: &str, target: &str) -> Result<ApiKey, AuthError> {
        let digest = digest_of(target);
        self.revoke_where(requester, |keys| find_by_digest(keys, &digest))
    }

    /// Revoke by public key id.
    pub fn revoke_by_id(&self, requester: &str, key_id: &str) -> Result<ApiKey, AuthError> {
        self.revoke_where(requester, |keys| keys.iter().position(|k| k.record.id == key_id))
    }

    fn revoke_where<F>(&self, requester: &str, locate: F) -> Result<ApiKey, AuthError>
    where
        F: Fn(&[KeyEntry]) -> Option<usize>,
    {
        // admin 키는 요청자와 관계없이 폐기 불가
        {
            let keys = self.keys.lock().unwrap_or_else(|e| e.into_inner());
            if locate(&keys).is_some_and(|i| keys[i].record.admin) {
                return Err(AuthError::permission("the admin key cannot be revoked"));
            }
        }

        let revoker = self.authenticate(requester)?;
        if !revoker.allows(&Scope::IssueKeys) {
            return Err(AuthError::permission("requester cannot revoke keys"));
        }

        let mut keys = self.keys.lock().unwrap_or_else(|e| e.into_inner());
        let index = locate(&keys).ok_or(AuthError::KeyNotFound)?;
        let target = &keys[index].record;
        if target.admin {
            return Err(AuthError::permission("the admin key cannot be revoked"));
        }
        if !target.scopes.iter().all(|s| revoker.allows(s)) {
            return Err(AuthError::permission("target key holds scopes the requester lacks"));
        }

        let removed = keys.remove(index);
        if let Err(e) = self.save_locked(&keys) {
            keys.insert(index, removed);
            return Err(e.into());
        }
        drop(keys);

        let revoked = ApiKey::from(&removed.record);
        tracing::info!("API key {} ('{}') revoked by {}", revoked.id, revoked.owner, revoker.id);
        Ok(revoked)
    }

    /// Metadata of every key. Requires `IssueKeys`.
    pub fn list(&self, requester: &str) -> Result<Vec<ApiKey>, AuthError> {
        self.authorize(requester, &Scope::IssueKeys)?;
        let keys = self.keys.lock().unwrap_or_else(|e| e.into_inner());
        Ok(keys.iter().map(|k| ApiKey::from(&k.record)).collect())
    }

    /// Save after a push; the pushed entry is dropped again if saving fails.
    fn persist(&self, keys: &mut Vec<KeyEntry>) -> Result<(), AuthError> {
        if let Err(e) = self.save_locked(keys) {
            keys.pop();
            tracing::error!("Failed to persist API keys: {}", e);
            return Err(e.into());
        }
        Ok(())
    }

    fn save_locked(&self, keys: &[KeyEntry]) -> Result<(), StorageError> {
        let records: Vec<StoredKey> = keys.iter().map(|k| k.record.clone()).collect();
        self.store.save(&records)
    }

    fn log_failure(&self, digest: &[u8; 32], reason: &str) {
        let should_log = {
            let mut last = self.fail_last_log.lock().unwrap_or_else(|e| e.into_inner());
            match *last {
                Some(t) if t.elapsed().as_secs() < AUTH_FAIL_LOG_INTERVAL_SECS => false,
                _ => {
                    *last = Some(Instant::now());
                    true
                }
            }
        };
        if should_log {
            let suppressed = self.fail_suppressed.swap(0, Ordering::Relaxed);
            tracing::warn!(
                "API key rejected ({}, id {}, {} similar failures suppressed)",
                reason,
                &hex::encode(digest)[..KEY_ID_LEN],
                suppressed
            );
        } else {
            self.fail_suppressed.fetch_add(1, Ordering::Relaxed);
        }
    }
}

fn generate_secret() -> String {
    let mut bytes = [0u8; 32];
    bytes[..16].copy_from_slice(uuid::Uuid::new_v4().as_bytes());
    bytes[16..].copy_from_slice(uuid::Uuid::new_v4().as_bytes());
    URL_SAFE_NO_PAD.encode(bytes)
}

fn digest_of(secret: &str) -> [u8; 32] {
    Sha256::digest(secret.as_bytes()).into()
}

fn new_entry(owner: &str, scopes: BTreeSet<Scope>, admin: bool) -> (String, KeyEntry) {
    let secret = generate_secret();
    let digest = digest_of(&secret);
    let hash = hex::encode(digest);
    let record = StoredKey {
        id: hash[..KEY_ID_LEN].to_string(),
        hash,
        owner: owner.to_string(),
        created_at: current_timestamp(),
        scopes,
        admin,
    };
    (secret, KeyEntry { digest, record })
}

/// Compares against every entry without early exit.
fn find_by_digest(keys: &[KeyEntry], digest: &[u8; 32]) -> Option<usize> {
    let mut found = None;
    for (index, entry) in keys.iter().enumerate() {
        let diff = entry
            .digest
            .iter()
            .zip(digest.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b));
        if diff == 0 && found.is_none() {
            found = Some(index);
        }
    }
    found
}

fn join_scopes(scopes: &BTreeSet<Scope>) -> String {
    scopes.iter().map(|s| s.to_string()).collect::<Vec<_>>().join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn scopes(list: &[Scope]) -> BTreeSet<Scope> {
        list.iter().cloned().collect()
    }

    fn authority() -> (KeyAuthority, String) {
        let auth = KeyAuthority::load(Box::new(MemoryKeyStore::new())).unwrap();
        let admin = auth.generate_admin_key().unwrap();
        let secret = admin.secret().unwrap().to_string();
        (auth, secret)
    }

    #[test]
    fn test_scope_parse_and_display() {
        for scope in [
            Scope::Admin,
            Scope::IssueKeys,
            Scope::ManageAll,
            Scope::manage("survival"),
        ] {
            assert_eq!(scope.to_string().parse::<Scope>().unwrap(), scope);
        }
        assert!("manage_server:".parse::<Scope>().is_err());
        assert!("root".parse::<Scope>().is_err());
    }

    #[test]
    fn test_scope_coverage() {
        assert!(Scope::Admin.covers(&Scope::IssueKeys));
        assert!(Scope::ManageAll.covers(&Scope::manage("a")));
        assert!(!Scope::ManageAll.covers(&Scope::IssueKeys));
        assert!(!Scope::manage("a").covers(&Scope::manage("b")));
        assert!(!Scope::IssueKeys.covers(&Scope::manage("a")));
    }

    #[test]
    fn test_admin_key_is_idempotent() {
        let (auth, secret) = authority();
        match auth.generate_admin_key().unwrap() {
            AdminKey::Existing(key) => assert!(key.admin),
            AdminKey::Generated(_) => panic!("admin key regenerated"),
        }
        let key = auth.authorize(&secret, &Scope::manage("anything")).unwrap();
        assert!(key.scopes.contains(&Scope::Admin));
    }

    #[test]
    fn test_authorize_unknown_and_forbidden() {
        let (auth, admin) = authority();
        assert!(matches!(auth.authorize("nope", &Scope::IssueKeys), Err(AuthError::Unauthorized)));

        let issued = auth.issue(&admin, "bot", scopes(&[Scope::manage("a")])).unwrap();
        assert!(auth.authorize(&issued.secret, &Scope::manage("a")).is_ok());
        assert!(matches!(
            auth.authorize(&issued.secret, &Scope::manage("b")),
            Err(AuthError::Forbidden)
        ));
        assert!(matches!(
            auth.authorize(&issued.secret, &Scope::IssueKeys),
            Err(AuthError::Forbidden)
        ));
    }

    #[test]
    fn test_issue_is_bounded_by_issuer() {
        let (auth, admin) = authority();
        let delegate = auth
            .issue(&admin, "ops", scopes(&[Scope::IssueKeys, Scope::manage("a")]))
            .unwrap();

        // 부분집합은 허용
        assert!(auth.issue(&delegate.secret, "bot", scopes(&[Scope::manage("a")])).is_ok());
        assert!(matches!(
            auth.issue(&delegate.secret, "bot-b", scopes(&[Scope::manage("b")])),
            Err(AuthError::Permission(_))
        ));
        assert!(matches!(
            auth.issue(&delegate.secret, "bot-all", scopes(&[Scope::ManageAll])),
            Err(AuthError::Permission(_))
        ));
        assert!(matches!(
            auth.issue(&admin, "x", scopes(&[Scope::Admin])),
            Err(AuthError::Permission(_))
        ));

        let plain = auth.issue(&admin, "plain", scopes(&[Scope::ManageAll])).unwrap();
        assert!(matches!(
            auth.issue(&plain.secret, "bot2", scopes(&[])),
            Err(AuthError::Permission(_))
        ));
    }

    #[test]
    fn test_owner_labels_are_unique() {
        let (auth, admin) = authority();
        let first = auth.issue(&admin, "bot", scopes(&[Scope::manage("a")])).unwrap();

        assert!(matches!(
            auth.issue(&admin, "bot", scopes(&[Scope::manage("b")])),
            Err(AuthError::DuplicateOwner(owner)) if owner == "bot"
        ));
        assert!(matches!(
            auth.issue(&admin, "admin", scopes(&[])),
            Err(AuthError::DuplicateOwner(_))
        ));
        assert_eq!(auth.list(&admin).unwrap().len(), 2);

        // 폐기하면 같은 이름을 다시 쓸 수 있음
        auth.revoke(&admin, &first.secret).unwrap();
        let again = auth.issue(&admin, "bot", scopes(&[Scope::manage("b")])).unwrap();
        assert_ne!(again.key.id, first.key.id);
    }

    #[test]
    fn test_admin_key_cannot_be_revoked() {
        let (auth, admin) = authority();
        assert!(matches!(auth.revoke(&admin, &admin), Err(AuthError::Permission(_))));
        assert!(matches!(auth.revoke("unknown", &admin), Err(AuthError::Permission(_))));

        let admin_id = auth.authenticate(&admin).unwrap().id;
        assert!(matches!(auth.revoke_by_id(&admin, &admin_id), Err(AuthError::Permission(_))));
        assert!(auth.authenticate(&admin).is_ok());
    }

    #[test]
    fn test_revoke() {
        let (auth, admin) = authority();
        let bot = auth.issue(&admin, "bot", scopes(&[Scope::manage("a")])).unwrap();
        let other = auth.issue(&admin, "other", scopes(&[Scope::manage("a")])).unwrap();

        // IssueKeys 없는 키로는 폐기 불가
        assert!(matches!(auth.revoke(&bot.secret, &other.secret), Err(AuthError::Permission(_))));

        let revoked = auth.revoke(&admin, &bot.secret).unwrap();
        assert_eq!(revoked.id, bot.key.id);
        assert!(matches!(auth.authenticate(&bot.secret), Err(AuthError::Unauthorized)));
        assert!(matches!(auth.revoke(&admin, &bot.secret), Err(AuthError::KeyNotFound)));

        auth.revoke_by_id(&admin, &other.key.id).unwrap();
        assert_eq!(auth.list(&admin).unwrap().len(), 1);
    }

    #[test]
    fn test_revoke_requires_covering_scopes() {
        let (auth, admin) = authority();
        let delegate = auth
            .issue(&admin, "ops", scopes(&[Scope::IssueKeys, Scope::manage("a")]))
            .unwrap();
        let wide = auth.issue(&admin, "wide", scopes(&[Scope::ManageAll])).unwrap();
        assert!(matches!(
            auth.revoke(&delegate.secret, &wide.secret),
            Err(AuthError::Permission(_))
        ));
    }

    #[test]
    fn test_list_requires_issue_keys() {
        let (auth, admin) = authority();
        let bot = auth.issue(&admin, "bot", scopes(&[Scope::ManageAll])).unwrap();
        assert!(matches!(auth.list(&bot.secret), Err(AuthError::Forbidden)));
        let keys = auth.list(&admin).unwrap();
        assert_eq!(keys.len(), 2);
        assert!(keys.iter().all(|k| k.id.len() == KEY_ID_LEN));
    }

    #[test]
    fn test_failed_save_rolls_back() {
        let store = Arc::new(MemoryKeyStore::new());
        let auth = KeyAuthority::load(Box::new(store.clone())).unwrap();
        let admin = auth.generate_admin_key().unwrap().secret().unwrap().to_string();

        store.set_fail_saves(true);
        assert!(matches!(
            auth.issue(&admin, "bot", scopes(&[Scope::ManageAll])),
            Err(AuthError::Storage(_))
        ));
        store.set_fail_saves(false);
        assert_eq!(auth.list(&admin).unwrap().len(), 1);
        assert_eq!(store.snapshot().len(), 1);
    }

    #[test]
    fn test_keys_survive_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.json");

        let (admin, issued) = {
            let auth = KeyAuthority::load(Box::new(JsonKeyStore::new(&path))).unwrap();
            let admin = auth.generate_admin_key().unwrap().secret().unwrap().to_string();
            let issued = auth.issue(&admin, "bot", scopes(&[Scope::manage("a")])).unwrap();
            (admin, issued)
        };

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(!raw.contains(&admin));
        assert!(!raw.contains(&issued.secret));

        let auth = KeyAuthority::load(Box::new(JsonKeyStore::new(&path))).unwrap();
        assert!(matches!(auth.generate_admin_key().unwrap(), AdminKey::Existing(_)));
        assert!(auth.authorize(&admin, &Scope::Admin).is_ok());
        assert!(auth.authorize(&issued.secret, &Scope::manage("a")).is_ok());
    }

    #[test]
    fn test_secrets_are_distinct() {
        let a = generate_secret();
        let b = generate_secret();
        assert_ne!(a, b);
        assert_eq!(a.len(), 43);
    }
}
