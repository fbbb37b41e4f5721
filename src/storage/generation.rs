//! DB generations
//!
//! A generation is a named sled database holding either blocks or states.
//! Each store kind has its own [`GenerationRegistry`]; exactly one generation
//! per kind is current and ingestion always commits into the current one.

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{CrawlerError, Result};

const OBJECTS_TREE: &str = "objects";
const SLOTS_TREE: &str = "slots";
const META_TREE: &str = "meta";
const META_KEY: &[u8] = b"generation";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    Blocks,
    States,
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreKind::Blocks => write!(f, "blocks"),
            StoreKind::States => write!(f, "states"),
        }
    }
}

/// Persisted description of a generation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationInfo {
    pub name: String,
    pub kind: StoreKind,
    /// Empty for an in-memory generation
    pub path: String,
    /// Chain spec the data belongs to (e.g. "mainnet")
    pub spec: String,
    pub created_at: i64,
}

pub struct DbGeneration {
    info: GenerationInfo,
    db: sled::Db,
    objects: sled::Tree,
    slots: sled::Tree,
}

impl DbGeneration {
    fn open(kind: StoreKind, name: &str, path: &str, spec: &str) -> Result<Self> {
        let db = if path.is_empty() {
            sled::Config::new().temporary(true).open()?
        } else {
            sled::open(path)?
        };
        let objects = db.open_tree(OBJECTS_TREE)?;
        let slots = db.open_tree(SLOTS_TREE)?;
        let meta = db.open_tree(META_TREE)?;

        let info = GenerationInfo {
            name: name.to_string(),
            kind,
            path: path.to_string(),
            spec: spec.to_string(),
            created_at: Utc::now().timestamp(),
        };

        if let Some(bytes) = meta.get(META_KEY)? {
            let existing: GenerationInfo = serde_json::from_slice(&bytes)?;
            if existing.kind != kind {
                return Err(CrawlerError::InvalidState(format!(
                    "database at {} holds {}, not {}",
                    path, existing.kind, kind
                )));
            }
            if existing.spec != spec {
                warn!(
                    "[DB] Reopening {} generation {} with spec {} (was {})",
                    kind, name, spec, existing.spec
                );
            }
        }
        meta.insert(META_KEY, serde_json::to_vec(&info)?)?;

        Ok(Self {
            info,
            db,
            objects,
            slots,
        })
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn info(&self) -> &GenerationInfo {
        &self.info
    }

    /// Store an object under its root and index it by slot.
    /// Returns false when the root was already present.
    pub fn store(&self, root: &[u8; 32], slot: u64, bytes: &[u8]) -> Result<bool> {
        let previous = self.objects.insert(root, bytes)?;
        let mut slot_key = Vec::with_capacity(40);
        slot_key.extend_from_slice(&slot.to_be_bytes());
        slot_key.extend_from_slice(root);
        self.slots.insert(slot_key, Vec::<u8>::new())?;
        Ok(previous.is_none())
    }

    pub fn get(&self, root: &[u8; 32]) -> Result<Option<Vec<u8>>> {
        Ok(self.objects.get(root)?.map(|v| v.to_vec()))
    }

    /// Roots stored for `slot`
    pub fn by_slot(&self, slot: u64) -> Result<Vec<[u8; 32]>> {
        let mut roots = Vec::new();
        for item in self.slots.scan_prefix(slot.to_be_bytes()) {
            let (key, _) = item?;
            if let Ok(root) = <[u8; 32]>::try_from(&key[8..]) {
                roots.push(root);
            }
        }
        Ok(roots)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

struct RegistryState {
    generations: BTreeMap<String, Arc<DbGeneration>>,
    current: Option<String>,
}

/// Named generations of one store kind plus the current pointer.
///
/// Generations and the pointer live under one lock, so a reader always sees a
/// pointer that names a generation it can also fetch, and switches are
/// serialized against each other.
pub struct GenerationRegistry {
    kind: StoreKind,
    state: RwLock<RegistryState>,
}

impl GenerationRegistry {
    pub fn new(kind: StoreKind) -> Self {
        Self {
            kind,
            state: RwLock::new(RegistryState {
                generations: BTreeMap::new(),
                current: None,
            }),
        }
    }

    pub fn kind(&self) -> StoreKind {
        self.kind
    }

    /// Open a new generation. The first generation of a kind becomes current.
    pub fn create(&self, name: &str, path: &str, spec: &str) -> Result<Arc<DbGeneration>> {
        if name.is_empty() {
            return Err(CrawlerError::InvalidState("generation name is empty".to_string()));
        }
        if self.state.read().generations.contains_key(name) {
            return Err(CrawlerError::AlreadyExists(format!("{} generation {}", self.kind, name)));
        }

        // Opening touches disk; keep it outside the write lock
        let generation = Arc::new(DbGeneration::open(self.kind, name, path, spec)?);

        let mut state = self.state.write();
        if state.generations.contains_key(name) {
            return Err(CrawlerError::AlreadyExists(format!("{} generation {}", self.kind, name)));
        }
        state
            .generations
            .insert(name.to_string(), Arc::clone(&generation));
        let became_current = state.current.is_none();
        if became_current {
            state.current = Some(name.to_string());
        }
        drop(state);

        info!(
            kind = %self.kind,
            name,
            path,
            spec,
            current = became_current,
            "[DB] Created generation"
        );
        Ok(generation)
    }

    pub fn switch_current(&self, name: &str) -> Result<()> {
        let mut state = self.state.write();
        if !state.generations.contains_key(name) {
            return Err(CrawlerError::NotFound(format!("{} generation {}", self.kind, name)));
        }
        let previous = state.current.replace(name.to_string());
        drop(state);

        info!(
            kind = %self.kind,
            from = previous.as_deref().unwrap_or("-"),
            to = name,
            "[DB] Switched current generation"
        );
        Ok(())
    }

    pub fn remove(&self, name: &str) -> Result<()> {
        let mut state = self.state.write();
        if state.current.as_deref() == Some(name) {
            return Err(CrawlerError::InvalidState(format!(
                "{} generation {} is current",
                self.kind, name
            )));
        }
        let removed = state
            .generations
            .remove(name)
            .ok_or_else(|| CrawlerError::NotFound(format!("{} generation {}", self.kind, name)))?;
        drop(state);

        if let Err(e) = removed.flush() {
            warn!("[DB] Flush of removed generation {} failed: {}", name, e);
        }
        info!(kind = %self.kind, name, "[DB] Removed generation");
        Ok(())
    }

    pub fn list(&self) -> Vec<String> {
        self.state.read().generations.keys().cloned().collect()
    }

    pub fn current_name(&self) -> Option<String> {
        self.state.read().current.clone()
    }

    /// The current generation, read atomically with its name
    pub fn current(&self) -> Result<Arc<DbGeneration>> {
        let state = self.state.read();
        state
            .current
            .as_ref()
            .and_then(|name| state.generations.get(name))
            .cloned()
            .ok_or_else(|| CrawlerError::InvalidState(format!("no current {} generation", self.kind)))
    }

    pub fn get(&self, name: &str) -> Result<Arc<DbGeneration>> {
        self.state
            .read()
            .generations
            .get(name)
            .cloned()
            .ok_or_else(|| CrawlerError::NotFound(format!("{} generation {}", self.kind, name)))
    }

    pub fn flush_all(&self) {
        let generations: Vec<Arc<DbGeneration>> = self.state.read().generations.values().cloned().collect();
        for generation in generations {
            if let Err(e) = generation.flush() {
                warn!("[DB] Flush of {} failed: {}", generation.name(), e);
            }
        }
    }
}

/// Both registries, addressed by kind
pub struct Generations {
    pub blocks: GenerationRegistry,
    pub states: GenerationRegistry,
}

impl Generations {
    pub fn new() -> Self {
        Self {
            blocks: GenerationRegistry::new(StoreKind::Blocks),
            states: GenerationRegistry::new(StoreKind::States),
        }
    }

    pub fn registry(&self, kind: StoreKind) -> &GenerationRegistry {
        match kind {
            StoreKind::Blocks => &self.blocks,
            StoreKind::States => &self.states,
        }
    }
}

impl Default for Generations {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_duplicate_name_rejected() {
        let registry = GenerationRegistry::new(StoreKind::Blocks);
        registry.create("mainnet", "", "mainnet").unwrap();

        let err = registry.create("mainnet", "", "mainnet").err().unwrap();
        assert!(matches!(err, CrawlerError::AlreadyExists(_)));
        assert_eq!(registry.list(), vec!["mainnet".to_string()]);
    }

    #[test]
    fn test_current_generation_cannot_be_removed() {
        let registry = GenerationRegistry::new(StoreKind::States);
        registry.create("mainnet", "", "mainnet").unwrap();
        registry.create("prater", "", "prater").unwrap();
        registry.switch_current("mainnet").unwrap();

        let err = registry.remove("mainnet").unwrap_err();
        assert!(matches!(err, CrawlerError::InvalidState(_)));

        registry.remove("prater").unwrap();
        assert!(matches!(registry.remove("prater"), Err(CrawlerError::NotFound(_))));
    }

    #[test]
    fn test_switch_to_unknown_fails() {
        let registry = GenerationRegistry::new(StoreKind::Blocks);
        assert!(matches!(registry.switch_current("nope"), Err(CrawlerError::NotFound(_))));
        assert!(registry.current().is_err());
    }

    #[test]
    fn test_first_generation_becomes_current() {
        let registry = GenerationRegistry::new(StoreKind::Blocks);
        registry.create("a", "", "mainnet").unwrap();
        registry.create("b", "", "mainnet").unwrap();
        assert_eq!(registry.current().unwrap().name(), "a");

        registry.switch_current("b").unwrap();
        assert_eq!(registry.current_name().as_deref(), Some("b"));
    }

    #[test]
    fn test_switch_is_atomic_for_readers() {
        let registry = Arc::new(GenerationRegistry::new(StoreKind::Blocks));
        registry.create("x", "", "mainnet").unwrap();
        registry.create("y", "", "mainnet").unwrap();
        let stop = Arc::new(AtomicBool::new(false));

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let stop = Arc::clone(&stop);
                std::thread::spawn(move || {
                    let mut reads = 0u64;
                    while !stop.load(Ordering::Relaxed) {
                        let current = registry.current().unwrap();
                        assert!(current.name() == "x" || current.name() == "y");
                        reads += 1;
                    }
                    reads
                })
            })
            .collect();

        for i in 0..500 {
            registry
                .switch_current(if i % 2 == 0 { "y" } else { "x" })
                .unwrap();
        }
        stop.store(true, Ordering::Relaxed);
        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(registry.current().unwrap().name(), "x");
    }

    #[test]
    fn test_store_and_index_by_slot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blocks");
        let registry = GenerationRegistry::new(StoreKind::Blocks);
        let generation = registry
            .create("mainnet", path.to_str().unwrap(), "mainnet")
            .unwrap();

        assert!(generation.store(&[1; 32], 100, b"block-a").unwrap());
        assert!(!generation.store(&[1; 32], 100, b"block-a").unwrap());
        assert!(generation.store(&[2; 32], 100, b"block-b").unwrap());
        assert!(generation.store(&[3; 32], 101, b"block-c").unwrap());

        assert_eq!(generation.len(), 3);
        assert_eq!(generation.get(&[2; 32]).unwrap().unwrap(), b"block-b");
        let mut roots = generation.by_slot(100).unwrap();
        roots.sort();
        assert_eq!(roots, vec![[1; 32], [2; 32]]);
        assert!(generation.by_slot(102).unwrap().is_empty());
    }
}
