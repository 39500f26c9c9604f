//! Per-transaction annotations: contact link, free-text note, up to two tags.
//!
//! Keyed by the backend transaction id. Persisted as one JSON object at
//! `{data_dir}/transaction_metadata.json`; the file is only created on the
//! first write.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::config::{read_json_or_default, write_json};
use crate::error::{WalletError, WalletResult};

pub const MAX_TAGS: usize = 2;
pub const MAX_NOTE_CHARS: usize = 500;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionMetadata {
    #[serde(default, alias = "contactId")]
    pub contact_id: Option<String>,
    #[serde(default, alias = "customNote")]
    pub custom_note: String,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Unix ms
    #[serde(default, alias = "updatedAt")]
    pub updated_at: i64,
}

/// Write side used by automated flows (auto-withdraw) to annotate what they did.
pub trait MetadataSink: Send + Sync {
    fn add_tag(&self, tx_id: &str, tag: &str) -> WalletResult<()>;
    fn set_note(&self, tx_id: &str, note: &str) -> WalletResult<()>;
}

pub struct TransactionMetadataStore {
    path: Option<PathBuf>,
    entries: Mutex<BTreeMap<String, TransactionMetadata>>,
}

impl TransactionMetadataStore {
    /// Load from `path` if it exists; an unreadable file starts empty.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = read_json_or_default(&path);
        Self { path: Some(path), entries: Mutex::new(entries) }
    }

    /// Never touches disk.
    pub fn in_memory() -> Self {
        Self { path: None, entries: Mutex::new(BTreeMap::new()) }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn get(&self, tx_id: &str) -> Option<TransactionMetadata> {
        self.lock().get(tx_id).cloned()
    }

    pub fn tags(&self, tx_id: &str) -> Vec<String> {
        self.lock().get(tx_id).map(|m| m.tags.clone()).unwrap_or_default()
    }

    pub fn note(&self, tx_id: &str) -> String {
        self.lock().get(tx_id).map(|m| m.custom_note.clone()).unwrap_or_default()
    }

    pub fn set_contact(&self, tx_id: &str, contact_id: Option<&str>) -> WalletResult<TransactionMetadata> {
        self.update(tx_id, |meta| {
            meta.contact_id = contact_id.map(str::to_string);
            Ok(())
        })
    }

    /// Trimmed and cut at [`MAX_NOTE_CHARS`]; an empty note clears it.
    pub fn set_note(&self, tx_id: &str, note: &str) -> WalletResult<TransactionMetadata> {
        self.update(tx_id, |meta| {
            meta.custom_note = note.trim().chars().take(MAX_NOTE_CHARS).collect();
            Ok(())
        })
    }

    /// Adding a tag the transaction already has is a no-op.
    pub fn add_tag(&self, tx_id: &str, tag: &str) -> WalletResult<TransactionMetadata> {
        let tag = tag.trim();
        if tag.is_empty() {
            return Err(WalletError::validation("tag", "Tag must not be empty"));
        }
        self.update(tx_id, |meta| {
            if meta.tags.iter().any(|t| t == tag) {
                return Ok(());
            }
            if meta.tags.len() >= MAX_TAGS {
                return Err(WalletError::validation("tags", "Maximum 2 tags allowed per transaction"));
            }
            meta.tags.push(tag.to_string());
            Ok(())
        })
    }

    pub fn remove_tag(&self, tx_id: &str, tag: &str) -> WalletResult<TransactionMetadata> {
        self.update(tx_id, |meta| {
            meta.tags.retain(|t| t != tag);
            Ok(())
        })
    }

    pub fn clear(&self, tx_id: &str) -> WalletResult<()> {
        check_id(tx_id)?;
        let mut entries = self.lock();
        if entries.remove(tx_id).is_some() {
            self.persist(&entries)?;
        }
        Ok(())
    }

    /// Unlink a deleted contact everywhere it was referenced.
    pub fn clear_contact(&self, contact_id: &str) -> WalletResult<()> {
        let mut entries = self.lock();
        let now = now_ms();
        let mut changed = false;
        for meta in entries.values_mut() {
            if meta.contact_id.as_deref() == Some(contact_id) {
                meta.contact_id = None;
                meta.updated_at = now;
                changed = true;
            }
        }
        if changed {
            self.persist(&entries)?;
        }
        Ok(())
    }

    pub fn transactions_with_tag(&self, tag: &str) -> Vec<String> {
        self.lock()
            .iter()
            .filter(|(_, m)| m.tags.iter().any(|t| t == tag))
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn transactions_for_contact(&self, contact_id: &str) -> Vec<String> {
        self.lock()
            .iter()
            .filter(|(_, m)| m.contact_id.as_deref() == Some(contact_id))
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Every tag in use, sorted and unique.
    pub fn all_tags(&self) -> Vec<String> {
        let tags: BTreeSet<String> = self.lock().values().flat_map(|m| m.tags.iter().cloned()).collect();
        tags.into_iter().collect()
    }

    pub fn export(&self) -> BTreeMap<String, TransactionMetadata> {
        self.lock().clone()
    }

    /// Merge a backup over current entries; imported ids win. Returns how many were imported.
    pub fn import(&self, backup: BTreeMap<String, TransactionMetadata>) -> WalletResult<usize> {
        let count = backup.len();
        let mut entries = self.lock();
        entries.extend(backup);
        self.persist(&entries)?;
        Ok(count)
    }

    fn update(
        &self,
        tx_id: &str,
        apply: impl FnOnce(&mut TransactionMetadata) -> WalletResult<()>,
    ) -> WalletResult<TransactionMetadata> {
        check_id(tx_id)?;
        let mut entries = self.lock();
        let mut meta = entries.get(tx_id).cloned().unwrap_or_default();
        apply(&mut meta)?;
        meta.updated_at = now_ms();
        entries.insert(tx_id.to_string(), meta.clone());
        self.persist(&entries)?;
        Ok(meta)
    }

    fn persist(&self, entries: &BTreeMap<String, TransactionMetadata>) -> WalletResult<()> {
        let Some(path) = &self.path else { return Ok(()) };
        write_json(path, entries).map_err(|e| {
            tracing::warn!(path = %path.display(), error = %e, "saving transaction metadata failed");
            WalletError::Storage("Failed to save transaction metadata".into())
        })
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, TransactionMetadata>> {
        self.entries.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl MetadataSink for TransactionMetadataStore {
    fn add_tag(&self, tx_id: &str, tag: &str) -> WalletResult<()> {
        TransactionMetadataStore::add_tag(self, tx_id, tag).map(|_| ())
    }

    fn set_note(&self, tx_id: &str, note: &str) -> WalletResult<()> {
        TransactionMetadataStore::set_note(self, tx_id, note).map(|_| ())
    }
}

fn check_id(tx_id: &str) -> WalletResult<()> {
    if tx_id.trim().is_empty() {
        return Err(WalletError::validation("tx_id", "Transaction ID is required"));
    }
    Ok(())
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
