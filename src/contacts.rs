//! Address book: named lightning-address and Spark-address contacts.
//!
//! Persisted as a JSON array at `{data_dir}/address_book.json`, created on the
//! first write. Addresses are unique case-insensitively. Entries written by
//! older builds carry only `lightningAddress`; they load as lightning contacts.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, OnceLock};

use rand::distributions::Alphanumeric;
use rand::seq::SliceRandom;
use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::{read_json_or_default, write_json};
use crate::error::{WalletError, WalletResult};

/// Current (`spark1`, `sparkrt1`, ...) then legacy (`sp1`, `tsp1`, `sprt1`) prefixes.
const SPARK_PREFIXES: [&str; 8] = ["spark1", "sparkrt1", "sparkt1", "sparks1", "sparkl1", "sp1", "tsp1", "sprt1"];

pub const COLOR_PALETTE: [&str; 12] = [
    "#3B82F6", "#10B981", "#F59E0B", "#EF4444", "#8B5CF6", "#F97316", "#06B6D4", "#84CC16", "#EC4899", "#6366F1",
    "#14B8A6", "#F43F5E",
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressType {
    #[default]
    Lightning,
    Spark,
}

impl AddressType {
    fn invalid_message(self) -> &'static str {
        match self {
            AddressType::Lightning => "Invalid Lightning address format",
            AddressType::Spark => "Invalid Spark address format",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub address_type: AddressType,
    /// Mirror of `address` for lightning contacts, empty otherwise
    #[serde(default)]
    pub lightning_address: String,
    #[serde(default)]
    pub color: String,
    /// Unix ms
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub updated_at: i64,
}

impl Contact {
    /// The payable address, falling back to the legacy field.
    pub fn payable_address(&self) -> &str {
        if self.address.is_empty() {
            &self.lightning_address
        } else {
            &self.address
        }
    }
}

/// Input for [`AddressBook::add`] and one record of an import.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewContact {
    pub name: String,
    #[serde(default, alias = "lightningAddress")]
    pub address: String,
    /// Detected from the address when absent
    #[serde(default)]
    pub address_type: Option<AddressType>,
    #[serde(default)]
    pub color: Option<String>,
}

impl NewContact {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self { name: name.into(), address: address.into(), ..Default::default() }
    }

    pub fn with_color(mut self, color: impl Into<String>) -> Self {
        self.color = Some(color.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContactUpdate {
    pub name: Option<String>,
    pub address: Option<String>,
    pub address_type: Option<AddressType>,
    pub color: Option<String>,
}

pub struct AddressBook {
    path: Option<PathBuf>,
    entries: Mutex<Vec<Contact>>,
}

impl AddressBook {
    /// Load from `path` if it exists; an unreadable file starts empty.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = read_json_or_default(&path);
        Self { path: Some(path), entries: Mutex::new(entries) }
    }

    pub fn in_memory() -> Self {
        Self { path: None, entries: Mutex::new(Vec::new()) }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Sorted by name, case-insensitively.
    pub fn list(&self) -> Vec<Contact> {
        let mut entries = self.lock().clone();
        entries.sort_by_key(|c| c.name.to_lowercase());
        entries
    }

    /// Name or address contains `query`, case-insensitively. A blank query lists everything.
    pub fn search(&self, query: &str) -> Vec<Contact> {
        let query = query.trim().to_lowercase();
        self.list()
            .into_iter()
            .filter(|c| {
                query.is_empty()
                    || c.name.to_lowercase().contains(&query)
                    || c.payable_address().to_lowercase().contains(&query)
            })
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<Contact> {
        self.lock().iter().find(|c| c.id == id).cloned()
    }

    pub fn by_type(&self, address_type: AddressType) -> Vec<Contact> {
        self.list().into_iter().filter(|c| c.address_type == address_type).collect()
    }

    pub fn add(&self, contact: NewContact) -> WalletResult<Contact> {
        let name = contact.name.trim().to_string();
        if name.is_empty() {
            return Err(WalletError::validation("name", "Name is required"));
        }
        let address = contact.address.trim().to_string();
        let address_type = contact.address_type.unwrap_or_default();
        if !is_valid_address(&address, address_type) {
            return Err(WalletError::validation("address", address_type.invalid_message()));
        }

        let mut entries = self.lock();
        ensure_unique(&entries, &address, None)?;
        let now = now_ms();
        let entry = Contact {
            id: contact_id(),
            name,
            lightning_address: lightning_mirror(&address, address_type),
            address,
            address_type,
            color: contact.color.filter(|c| !c.trim().is_empty()).unwrap_or_else(random_color),
            created_at: now,
            updated_at: now,
        };
        entries.push(entry.clone());
        self.persist(&entries)?;
        tracing::debug!(id = %entry.id, address_type = ?entry.address_type, "contact added");
        Ok(entry)
    }

    pub fn update(&self, id: &str, update: ContactUpdate) -> WalletResult<Contact> {
        let mut entries = self.lock();
        let index = entries
            .iter()
            .position(|c| c.id == id)
            .ok_or_else(|| WalletError::NotFound("Entry not found".into()))?;

        let mut entry = entries[index].clone();
        if let Some(name) = update.name.map(|n| n.trim().to_string()) {
            if name.is_empty() {
                return Err(WalletError::validation("name", "Name is required"));
            }
            entry.name = name;
        }
        if let Some(color) = update.color {
            entry.color = color;
        }
        if let Some(address) = update.address.map(|a| a.trim().to_string()).filter(|a| !a.is_empty()) {
            let address_type = update.address_type.unwrap_or(entry.address_type);
            if !is_valid_address(&address, address_type) {
                return Err(WalletError::validation("address", address_type.invalid_message()));
            }
            ensure_unique(&entries, &address, Some(id))?;
            entry.lightning_address = lightning_mirror(&address, address_type);
            entry.address = address;
            entry.address_type = address_type;
        }
        entry.updated_at = now_ms();

        entries[index] = entry.clone();
        self.persist(&entries)?;
        Ok(entry)
    }

    pub fn remove(&self, id: &str) -> WalletResult<Contact> {
        let mut entries = self.lock();
        let index = entries
            .iter()
            .position(|c| c.id == id)
            .ok_or_else(|| WalletError::NotFound("Entry not found".into()))?;
        let removed = entries.remove(index);
        self.persist(&entries)?;
        Ok(removed)
    }

    pub fn clear(&self) -> WalletResult<()> {
        let mut entries = self.lock();
        entries.clear();
        self.persist(&entries)
    }

    pub fn export(&self) -> Vec<Contact> {
        self.lock().clone()
    }

    /// Adds records that are named, typed (given or detected), valid and not
    /// already present. Everything else is skipped. Returns how many were added.
    pub fn import(&self, records: Vec<NewContact>) -> WalletResult<usize> {
        let mut imported = 0;
        for record in records {
            if record.name.trim().is_empty() || record.address.trim().is_empty() {
                continue;
            }
            let Some(address_type) = record.address_type.or_else(|| detect_address_type(&record.address)) else {
                continue;
            };
            if !is_valid_address(&record.address, address_type) {
                continue;
            }
            if ensure_unique(&self.lock(), record.address.trim(), None).is_err() {
                continue;
            }
            self.add(NewContact { address_type: Some(address_type), ..record })?;
            imported += 1;
        }
        Ok(imported)
    }

    fn persist(&self, entries: &[Contact]) -> WalletResult<()> {
        let Some(path) = &self.path else { return Ok(()) };
        write_json(path, entries).map_err(|e| {
            tracing::warn!(path = %path.display(), error = %e, "saving address book failed");
            WalletError::Storage("Failed to save address book".into())
        })
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Contact>> {
        self.entries.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Spark prefixes win over the lightning-address shape; anything else is `None`.
pub fn detect_address_type(address: &str) -> Option<AddressType> {
    if is_spark_contact_address(address) {
        Some(AddressType::Spark)
    } else if is_lightning_contact_address(address) {
        Some(AddressType::Lightning)
    } else {
        None
    }
}

pub fn is_valid_address(address: &str, address_type: AddressType) -> bool {
    if address.trim().is_empty() {
        return false;
    }
    match address_type {
        AddressType::Lightning => is_lightning_contact_address(address),
        AddressType::Spark => is_spark_contact_address(address),
    }
}

fn is_spark_contact_address(address: &str) -> bool {
    let lower = address.trim().to_lowercase();
    SPARK_PREFIXES.iter().any(|p| lower.starts_with(p))
}

fn is_lightning_contact_address(address: &str) -> bool {
    lightning_address_pattern().is_some_and(|re| re.is_match(address.trim()))
}

fn lightning_address_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$").ok()).as_ref()
}

fn ensure_unique(entries: &[Contact], address: &str, except: Option<&str>) -> WalletResult<()> {
    let taken = entries
        .iter()
        .filter(|c| Some(c.id.as_str()) != except)
        .any(|c| c.payable_address().eq_ignore_ascii_case(address));
    if taken {
        return Err(WalletError::validation("address", "This address already exists in your address book"));
    }
    Ok(())
}

fn lightning_mirror(address: &str, address_type: AddressType) -> String {
    match address_type {
        AddressType::Lightning => address.to_string(),
        AddressType::Spark => String::new(),
    }
}

/// `addr-{unix_ms}-{9 random alphanumerics}`
fn contact_id() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(9)
        .map(|c| char::from(c).to_ascii_lowercase())
        .collect();
    format!("addr-{}-{suffix}", now_ms())
}

fn random_color() -> String {
    COLOR_PALETTE.choose(&mut rand::thread_rng()).copied().unwrap_or(COLOR_PALETTE[0]).to_string()
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
