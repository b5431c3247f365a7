//! Policy store collaborator
//!
//! The engine consumes rules, blacklist entries and the enforcement mode
//! from a record store. The store is an external collaborator: this module
//! defines the narrow interface the engine needs ([`PolicyStore`]) plus two
//! implementations — an in-memory store for tests and a JSON-document store
//! persisted with the atomic temp-file + rename pattern and a SHA-256
//! integrity sidecar.
//!
//! No relational schema details leak into the engine; everything is simple
//! query/insert/update calls over the records in `core::rule`.

use crate::core::error::{Error, Result};
use crate::core::rule::{BlacklistEntry, MAX_RULES, Mode, Rule};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;

/// The record-store interface the engine depends on.
pub trait PolicyStore: Send + Sync {
    /// All rules with the active flag set.
    fn active_rules(&self) -> Result<Vec<Rule>>;

    /// Looks up a rule by its unique name, active or not.
    fn find_rule(&self, name: &str) -> Result<Option<Rule>>;

    /// Inserts a new rule. Names are unique; duplicates are rejected.
    fn insert_rule(&self, rule: Rule) -> Result<()>;

    /// Replaces an existing rule record (matched by id).
    fn update_rule(&self, rule: Rule) -> Result<()>;

    /// Marks a rule inactive. Returns whether it existed and was active.
    fn deactivate_rule(&self, name: &str) -> Result<bool>;

    /// All blacklist entries with the active flag set.
    fn active_blacklist(&self) -> Result<Vec<BlacklistEntry>>;

    /// Inserts a blacklist entry, or reactivates an existing one for the
    /// same address. Idempotent by address.
    fn upsert_blacklist(&self, entry: BlacklistEntry) -> Result<()>;

    /// Marks the entry for an address inactive (entries are never
    /// hard-deleted). Returns whether an active entry existed.
    fn deactivate_blacklist(&self, address: &IpNetwork) -> Result<bool>;

    /// The current enforcement mode.
    fn mode(&self) -> Result<Mode>;

    /// Persists a new enforcement mode.
    fn set_mode(&self, mode: Mode) -> Result<()>;
}

/// The single persisted policy document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyDocument {
    #[serde(default)]
    pub mode: Mode,
    #[serde(default)]
    pub rules: Vec<Rule>,
    #[serde(default)]
    pub blacklist: Vec<BlacklistEntry>,
}

fn apply_insert_rule(doc: &mut PolicyDocument, rule: Rule) -> Result<()> {
    if doc.rules.len() >= MAX_RULES {
        return Err(Error::Storage(format!(
            "rule limit reached ({MAX_RULES} rules)"
        )));
    }
    if doc.rules.iter().any(|r| r.name == rule.name) {
        return Err(Error::Storage(format!(
            "a rule named '{}' already exists",
            rule.name
        )));
    }
    doc.rules.push(rule);
    Ok(())
}

fn apply_update_rule(doc: &mut PolicyDocument, rule: Rule) -> Result<()> {
    match doc.rules.iter_mut().find(|r| r.id == rule.id) {
        Some(existing) => {
            *existing = rule;
            Ok(())
        }
        None => Err(Error::Storage(format!("no rule with id {}", rule.id))),
    }
}

fn apply_deactivate_rule(doc: &mut PolicyDocument, name: &str) -> bool {
    match doc.rules.iter_mut().find(|r| r.name == name && r.active) {
        Some(rule) => {
            rule.active = false;
            rule.touch();
            true
        }
        None => false,
    }
}

fn apply_upsert_blacklist(doc: &mut PolicyDocument, entry: BlacklistEntry) {
    match doc
        .blacklist
        .iter_mut()
        .find(|e| e.address == entry.address)
    {
        Some(existing) => {
            existing.active = true;
            if entry.description.is_some() {
                existing.description = entry.description;
            }
        }
        None => doc.blacklist.push(entry),
    }
}

fn apply_deactivate_blacklist(doc: &mut PolicyDocument, address: &IpNetwork) -> bool {
    match doc
        .blacklist
        .iter_mut()
        .find(|e| e.address == *address && e.active)
    {
        Some(entry) => {
            entry.active = false;
            true
        }
        None => false,
    }
}

/// In-memory store, used by tests and as the model for the JSON store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<PolicyDocument>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_document(doc: PolicyDocument) -> Self {
        Self {
            inner: Mutex::new(doc),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, PolicyDocument>> {
        self.inner
            .lock()
            .map_err(|_| Error::Storage("policy store lock poisoned".to_string()))
    }
}

impl PolicyStore for MemoryStore {
    fn active_rules(&self) -> Result<Vec<Rule>> {
        Ok(self.lock()?.rules.iter().filter(|r| r.active).cloned().collect())
    }

    fn find_rule(&self, name: &str) -> Result<Option<Rule>> {
        Ok(self.lock()?.rules.iter().find(|r| r.name == name).cloned())
    }

    fn insert_rule(&self, rule: Rule) -> Result<()> {
        apply_insert_rule(&mut *self.lock()?, rule)
    }

    fn update_rule(&self, rule: Rule) -> Result<()> {
        apply_update_rule(&mut *self.lock()?, rule)
    }

    fn deactivate_rule(&self, name: &str) -> Result<bool> {
        Ok(apply_deactivate_rule(&mut *self.lock()?, name))
    }

    fn active_blacklist(&self) -> Result<Vec<BlacklistEntry>> {
        Ok(self
            .lock()?
            .blacklist
            .iter()
            .filter(|e| e.active)
            .cloned()
            .collect())
    }

    fn upsert_blacklist(&self, entry: BlacklistEntry) -> Result<()> {
        apply_upsert_blacklist(&mut *self.lock()?, entry);
        Ok(())
    }

    fn deactivate_blacklist(&self, address: &IpNetwork) -> Result<bool> {
        Ok(apply_deactivate_blacklist(&mut *self.lock()?, address))
    }

    fn mode(&self) -> Result<Mode> {
        Ok(self.lock()?.mode)
    }

    fn set_mode(&self, mode: Mode) -> Result<()> {
        self.lock()?.mode = mode;
        Ok(())
    }
}

/// File-backed store holding one JSON policy document.
///
/// Every mutation rewrites the whole document atomically (temp file in the
/// same directory, fsync, rename) with mode 0600 and refreshes the SHA-256
/// sidecar. A sidecar mismatch on load is reported as a warning, not an
/// error, so manually edited documents remain loadable.
#[derive(Debug)]
pub struct JsonStore {
    path: PathBuf,
    inner: Mutex<PolicyDocument>,
}

impl JsonStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let doc = match std::fs::read_to_string(&path) {
            Ok(json) => {
                verify_sidecar(&path, &json);
                serde_json::from_str(&json)?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => PolicyDocument::default(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            inner: Mutex::new(doc),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, PolicyDocument>> {
        self.inner
            .lock()
            .map_err(|_| Error::Storage("policy store lock poisoned".to_string()))
    }

    fn persist(&self, doc: &PolicyDocument) -> Result<()> {
        let json = serde_json::to_string_pretty(doc)?;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut temp = tempfile::NamedTempFile::new_in(
            self.path.parent().unwrap_or_else(|| Path::new(".")),
        )?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(temp.path(), std::fs::Permissions::from_mode(0o600))?;
        }

        use std::io::Write;
        temp.write_all(json.as_bytes())?;
        temp.as_file().sync_all()?;
        temp.persist(&self.path).map_err(|e| Error::Io(e.error))?;

        std::fs::write(sidecar_path(&self.path), checksum(&json))?;
        Ok(())
    }

    /// Runs a mutation against the in-memory document and persists the
    /// result only when the mutation succeeded.
    fn mutate<T>(
        &self,
        apply: impl FnOnce(&mut PolicyDocument) -> Result<T>,
    ) -> Result<T> {
        let mut doc = self.lock()?;
        let value = apply(&mut doc)?;
        self.persist(&doc)?;
        Ok(value)
    }
}

impl PolicyStore for JsonStore {
    fn active_rules(&self) -> Result<Vec<Rule>> {
        Ok(self.lock()?.rules.iter().filter(|r| r.active).cloned().collect())
    }

    fn find_rule(&self, name: &str) -> Result<Option<Rule>> {
        Ok(self.lock()?.rules.iter().find(|r| r.name == name).cloned())
    }

    fn insert_rule(&self, rule: Rule) -> Result<()> {
        self.mutate(|doc| apply_insert_rule(doc, rule))
    }

    fn update_rule(&self, rule: Rule) -> Result<()> {
        self.mutate(|doc| apply_update_rule(doc, rule))
    }

    fn deactivate_rule(&self, name: &str) -> Result<bool> {
        self.mutate(|doc| Ok(apply_deactivate_rule(doc, name)))
    }

    fn active_blacklist(&self) -> Result<Vec<BlacklistEntry>> {
        Ok(self
            .lock()?
            .blacklist
            .iter()
            .filter(|e| e.active)
            .cloned()
            .collect())
    }

    fn upsert_blacklist(&self, entry: BlacklistEntry) -> Result<()> {
        self.mutate(|doc| {
            apply_upsert_blacklist(doc, entry);
            Ok(())
        })
    }

    fn deactivate_blacklist(&self, address: &IpNetwork) -> Result<bool> {
        self.mutate(|doc| Ok(apply_deactivate_blacklist(doc, address)))
    }

    fn mode(&self) -> Result<Mode> {
        Ok(self.lock()?.mode)
    }

    fn set_mode(&self, mode: Mode) -> Result<()> {
        self.mutate(|doc| {
            doc.mode = mode;
            Ok(())
        })
    }
}

fn sidecar_path(path: &Path) -> PathBuf {
    let mut sidecar = path.as_os_str().to_owned();
    sidecar.push(".sha256");
    PathBuf::from(sidecar)
}

fn checksum(contents: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(contents.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn verify_sidecar(path: &Path, json: &str) {
    if let Ok(expected) = std::fs::read_to_string(sidecar_path(path)) {
        let actual = checksum(json);
        if expected.trim() != actual {
            warn!(
                path = %path.display(),
                "policy document checksum mismatch (manual edit?)"
            );
        }
    }
}
