//! Durable key/value store abstraction
//!
//! Persistent hide rules and the driver-presence scan read a hierarchical
//! store of keys holding typed values, laid out like the Windows registry.
//! Key paths use `\` as separator and are matched case-sensitively.

use anyhow::{Context, anyhow};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Typed value stored under a key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegValue {
    Dword(u32),
    String(String),
}

impl RegValue {
    pub fn as_dword(&self) -> Option<u32> {
        match self {
            RegValue::Dword(v) => Some(*v),
            RegValue::String(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            RegValue::String(s) => Some(s),
            RegValue::Dword(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    #[error("Key not found: {0}")]
    KeyNotFound(String),

    #[error("Value '{name}' not found under {key}")]
    ValueNotFound { key: String, name: String },

    #[error("Value '{name}' under {key} has the wrong type")]
    WrongType { key: String, name: String },

    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

impl StorageError {
    /// True for a missing key or value, as opposed to an unreadable store
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StorageError::KeyNotFound(_) | StorageError::ValueNotFound { .. }
        )
    }
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Hierarchical typed key/value store
pub trait RegistryStore: Send + Sync {
    /// Names (not paths) of the direct children of `path`
    fn subkeys(&self, path: &str) -> StorageResult<Vec<String>>;

    fn read_value(&self, path: &str, name: &str) -> StorageResult<RegValue>;

    /// Write a value under an existing key
    fn write_value(&self, path: &str, name: &str, value: RegValue) -> StorageResult<()>;

    fn read_dword(&self, path: &str, name: &str) -> StorageResult<u32> {
        self.read_value(path, name)?
            .as_dword()
            .ok_or_else(|| StorageError::WrongType {
                key: path.to_string(),
                name: name.to_string(),
            })
    }

    fn read_string(&self, path: &str, name: &str) -> StorageResult<String> {
        match self.read_value(path, name)? {
            RegValue::String(s) => Ok(s),
            RegValue::Dword(_) => Err(StorageError::WrongType {
                key: path.to_string(),
                name: name.to_string(),
            }),
        }
    }
}

/// Join a parent key path and a child name
pub fn join_key(parent: &str, child: &str) -> String {
    if parent.is_empty() {
        child.to_string()
    } else {
        format!("{}\\{}", parent.trim_end_matches('\\'), child)
    }
}

/// In-memory [`RegistryStore`]
///
/// Can be seeded from a TOML document whose (possibly nested) tables are
/// keys and whose scalar entries are values:
///
/// ```toml
/// ["Parameters\\HideRules\\keyboard"]
/// ShouldHide = 1
/// Type = 0
/// VID = 0x046D
/// PID = 0xC52B
/// BCD = 0xFFFFFFFF
/// Class = 0xFFFFFFFF
/// ```
#[derive(Debug, Default)]
pub struct MemoryStore {
    keys: RwLock<BTreeMap<String, BTreeMap<String, RegValue>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create `path` and all of its ancestors
    pub fn create_key(&self, path: &str) {
        let mut keys = self.keys.write();
        let mut current = String::new();
        for part in path.split('\\').filter(|p| !p.is_empty()) {
            current = join_key(&current, part);
            keys.entry(current.clone()).or_default();
        }
    }

    /// Set a value, creating the key if needed
    pub fn set_value(&self, path: &str, name: &str, value: RegValue) {
        self.create_key(path);
        self.keys
            .write()
            .entry(path.to_string())
            .or_default()
            .insert(name.to_string(), value);
    }

    /// Delete `path` and everything below it
    pub fn delete_key(&self, path: &str) {
        let prefix = format!("{}\\", path);
        self.keys
            .write()
            .retain(|key, _| key != path && !key.starts_with(prefix.as_str()));
    }

    pub fn contains_key(&self, path: &str) -> bool {
        self.keys.read().contains_key(path)
    }

    /// Parse a store from TOML
    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let table: toml::Table =
            toml::from_str(content).context("Failed to parse store document")?;
        let store = Self::new();
        store.load_table("", &table)?;
        Ok(store)
    }

    /// Load a store from a TOML file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read store file: {}", path.display()))?;
        let store = Self::from_toml(&content)
            .with_context(|| format!("Failed to load store file: {}", path.display()))?;
        tracing::info!("Loaded key/value store from: {}", path.display());
        Ok(store)
    }

    fn load_table(&self, path: &str, table: &toml::Table) -> anyhow::Result<()> {
        for (name, value) in table {
            let value = match value {
                toml::Value::Table(child) => {
                    let child_path = join_key(path, name);
                    self.create_key(&child_path);
                    self.load_table(&child_path, child)?;
                    continue;
                }
                toml::Value::Integer(v) => RegValue::Dword(
                    u32::try_from(*v)
                        .map_err(|_| anyhow!("Value '{}' under '{}' is not a DWORD", name, path))?,
                ),
                toml::Value::Boolean(b) => RegValue::Dword(u32::from(*b)),
                toml::Value::String(s) => RegValue::String(s.clone()),
                other => {
                    return Err(anyhow!(
                        "Unsupported value type '{}' for '{}' under '{}'",
                        other.type_str(),
                        name,
                        path
                    ));
                }
            };
            if path.is_empty() {
                return Err(anyhow!("Value '{}' is not inside a key", name));
            }
            self.set_value(path, name, value);
        }
        Ok(())
    }
}

impl RegistryStore for MemoryStore {
    fn subkeys(&self, path: &str) -> StorageResult<Vec<String>> {
        let keys = self.keys.read();
        if !keys.contains_key(path) {
            return Err(StorageError::KeyNotFound(path.to_string()));
        }
        let prefix = format!("{}\\", path);
        Ok(keys
            .keys()
            .filter_map(|key| key.strip_prefix(prefix.as_str()))
            .filter(|rest| !rest.contains('\\'))
            .map(str::to_string)
            .collect())
    }

    fn read_value(&self, path: &str, name: &str) -> StorageResult<RegValue> {
        let keys = self.keys.read();
        let values = keys
            .get(path)
            .ok_or_else(|| StorageError::KeyNotFound(path.to_string()))?;
        values
            .get(name)
            .cloned()
            .ok_or_else(|| StorageError::ValueNotFound {
                key: path.to_string(),
                name: name.to_string(),
            })
    }

    fn write_value(&self, path: &str, name: &str, value: RegValue) -> StorageResult<()> {
        let mut keys = self.keys.write();
        let values = keys
            .get_mut(path)
            .ok_or_else(|| StorageError::KeyNotFound(path.to_string()))?;
        values.insert(name.to_string(), value);
        Ok(())
    }
}
