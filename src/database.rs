//! The installed database: which concrete nodes exist, and where.
//!
//! Records live in a [`RecordStore`], keyed by concrete hash. A
//! [`Database`] wraps a store with a process-wide `RwLock` and, for stores
//! backed by a directory, an advisory file lock: readers share it, a writer
//! holds it exclusively for its whole read-modify-write transaction.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use fs4::fs_std::FileExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dag::{ConcreteDag, ConcreteNode};
use crate::layout::Layout;
use crate::spec::{DepTypes, Spec};

const DB_DIR: &str = ".spackle-db";
const INDEX_FILE: &str = "index.json";
const LOCK_FILE: &str = "lock";

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("corrupt database index {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("database lock poisoned")]
    Poisoned,
    #[error("no installed record with hash {0}")]
    NotFound(String),
    #[error("{hash} is still needed by {}", dependents.join(", "))]
    HasDependents { hash: String, dependents: Vec<String> },
}

type Result<T> = std::result::Result<T, DatabaseError>;

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> DatabaseError + '_ {
    move |source| DatabaseError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// A direct dependency of an installed record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyRef {
    pub name: String,
    pub hash: String,
    pub types: DepTypes,
}

impl DependencyRef {
    /// Link and run dependencies keep their target installed.
    fn holds(&self) -> bool {
        self.types.intersects(DepTypes::LINK | DepTypes::RUN)
    }
}

/// One installed node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledRecord {
    pub node: ConcreteNode,
    pub prefix: PathBuf,
    pub dependencies: Vec<DependencyRef>,
    /// Installed on request rather than as a dependency.
    pub explicit: bool,
    /// Installed records that link or run against this one.
    pub ref_count: usize,
    pub installed_at: DateTime<Utc>,
}

impl InstalledRecord {
    pub fn hash(&self) -> &str {
        &self.node.hash
    }
}

/// Key-value storage of installed records.
pub trait RecordStore: Send + Sync {
    fn get(&self, hash: &str) -> Option<&InstalledRecord>;

    fn put(&mut self, record: InstalledRecord);

    fn delete(&mut self, hash: &str) -> Option<InstalledRecord>;

    /// All records, sorted by hash.
    fn list(&self) -> Vec<&InstalledRecord>;

    /// Pick up changes made by other processes.
    fn reload(&mut self) -> Result<()> {
        Ok(())
    }

    /// Make the current contents durable.
    fn persist(&mut self) -> Result<()> {
        Ok(())
    }

    /// File used to serialize access across processes, if any.
    fn lock_path(&self) -> Option<PathBuf> {
        None
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    records: BTreeMap<String, InstalledRecord>,
}

impl RecordStore for MemoryStore {
    fn get(&self, hash: &str) -> Option<&InstalledRecord> {
        self.records.get(hash)
    }

    fn put(&mut self, record: InstalledRecord) {
        self.records.insert(record.hash().to_string(), record);
    }

    fn delete(&mut self, hash: &str) -> Option<InstalledRecord> {
        self.records.remove(hash)
    }

    fn list(&self) -> Vec<&InstalledRecord> {
        self.records.values().collect()
    }
}

/// Records kept in `<root>/.spackle-db/index.json`.
#[derive(Debug)]
pub struct JsonFileStore {
    dir: PathBuf,
    records: BTreeMap<String, InstalledRecord>,
}

#[derive(Serialize, Deserialize)]
struct IndexFile {
    records: Vec<InstalledRecord>,
}

impl JsonFileStore {
    /// Open (creating if needed) the store of installation root `root`.
    pub fn open(root: &Path) -> Result<Self> {
        let dir = root.join(DB_DIR);
        fs::create_dir_all(&dir).map_err(io_error(&dir))?;
        let mut store = Self {
            dir,
            records: BTreeMap::new(),
        };
        store.reload()?;
        Ok(store)
    }

    fn index_path(&self) -> PathBuf {
        self.dir.join(INDEX_FILE)
    }
}

impl RecordStore for JsonFileStore {
    fn get(&self, hash: &str) -> Option<&InstalledRecord> {
        self.records.get(hash)
    }

    fn put(&mut self, record: InstalledRecord) {
        self.records.insert(record.hash().to_string(), record);
    }

    fn delete(&mut self, hash: &str) -> Option<InstalledRecord> {
        self.records.remove(hash)
    }

    fn list(&self) -> Vec<&InstalledRecord> {
        self.records.values().collect()
    }

    fn reload(&mut self) -> Result<()> {
        let path = self.index_path();
        if !path.exists() {
            self.records.clear();
            return Ok(());
        }
        let text = fs::read_to_string(&path).map_err(io_error(&path))?;
        let index: IndexFile = serde_json::from_str(&text).map_err(|source| DatabaseError::Json {
            path: path.clone(),
            source,
        })?;
        self.records = index
            .records
            .into_iter()
            .map(|r| (r.hash().to_string(), r))
            .collect();
        tracing::debug!(path = %path.display(), records = self.records.len(), "loaded installed database");
        Ok(())
    }

    fn persist(&mut self) -> Result<()> {
        let path = self.index_path();
        let tmp = self.dir.join(format!("{INDEX_FILE}.partial"));
        let index = IndexFile {
            records: self.records.values().cloned().collect(),
        };
        let bytes = serde_json::to_vec_pretty(&index).map_err(|source| DatabaseError::Json {
            path: path.clone(),
            source,
        })?;
        {
            let mut file = File::create(&tmp).map_err(io_error(&tmp))?;
            file.write_all(&bytes).map_err(io_error(&tmp))?;
            file.sync_all().map_err(io_error(&tmp))?;
        }
        fs::rename(&tmp, &path).map_err(io_error(&path))?;
        tracing::debug!(path = %path.display(), records = self.records.len(), "wrote installed database");
        Ok(())
    }

    fn lock_path(&self) -> Option<PathBuf> {
        Some(self.dir.join(LOCK_FILE))
    }
}

/// Held advisory lock; released on drop.
struct FileLock {
    file: File,
}

impl FileLock {
    fn acquire(path: &Path, exclusive: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)
            .map_err(io_error(path))?;
        let attempt = if exclusive {
            FileExt::try_lock_exclusive(&file)
        } else {
            FileExt::try_lock_shared(&file)
        };
        if attempt.is_err() {
            tracing::warn!(path = %path.display(), exclusive, "waiting for database lock");
            let locked = if exclusive {
                FileExt::lock_exclusive(&file)
            } else {
                FileExt::lock_shared(&file)
            };
            locked.map_err(io_error(path))?;
        }
        Ok(Self { file })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// A record store shared by threads and processes.
pub struct Database<S> {
    store: RwLock<S>,
    lock_path: Option<PathBuf>,
}

impl Database<MemoryStore> {
    pub fn in_memory() -> Self {
        Self::new(MemoryStore::default())
    }
}

impl Database<JsonFileStore> {
    /// The database of installation root `root`.
    pub fn open(root: &Path) -> Result<Self> {
        Ok(Self::new(JsonFileStore::open(root)?))
    }
}

impl<S: RecordStore> Database<S> {
    pub fn new(store: S) -> Self {
        let lock_path = store.lock_path();
        Self {
            store: RwLock::new(store),
            lock_path,
        }
    }

    fn file_lock(&self, exclusive: bool) -> Result<Option<FileLock>> {
        self.lock_path
            .as_deref()
            .map(|path| FileLock::acquire(path, exclusive))
            .transpose()
    }

    /// Run `f` against a fresh view of the store. Readers run concurrently.
    pub fn read<T>(&self, f: impl FnOnce(&S) -> T) -> Result<T> {
        let _lock = self.file_lock(false)?;
        if self.lock_path.is_some() {
            self.store.write().map_err(|_| DatabaseError::Poisoned)?.reload()?;
        }
        let store = self.store.read().map_err(|_| DatabaseError::Poisoned)?;
        Ok(f(&*store))
    }

    /// Run `f` as one exclusive transaction and persist the result when it
    /// succeeds.
    pub fn write<T>(&self, f: impl FnOnce(&mut S) -> Result<T>) -> Result<T> {
        let _lock = self.file_lock(true)?;
        let mut store = self.store.write().map_err(|_| DatabaseError::Poisoned)?;
        store.reload()?;
        let value = f(&mut *store)?;
        store.persist()?;
        Ok(value)
    }

    pub fn get(&self, hash: &str) -> Result<Option<InstalledRecord>> {
        self.read(|store| store.get(hash).cloned())
    }

    /// Every record, sorted by hash.
    pub fn all(&self) -> Result<Vec<InstalledRecord>> {
        self.read(|store| store.list().into_iter().cloned().collect())
    }

    /// Records whose installed subgraph satisfies `spec`.
    pub fn query(&self, spec: &Spec) -> Result<Vec<InstalledRecord>> {
        self.read(|store| {
            store
                .list()
                .into_iter()
                .filter(|record| spec.name.as_ref().is_none_or(|n| *n == record.node.name))
                .filter(|record| installed_spec(store, record).satisfies(spec))
                .cloned()
                .collect()
        })
    }

    /// Record every node of `dag` installed under `layout`. Nodes already
    /// present are kept; roots are marked explicit when `explicit` is set.
    /// Returns the newly added records.
    pub fn add_dag(&self, dag: &ConcreteDag, layout: &Layout, explicit: bool) -> Result<Vec<InstalledRecord>> {
        let now = Utc::now();
        let root_hashes: Vec<&str> = dag.roots().map(|(_, node)| node.hash.as_str()).collect();
        let added = self.write(|store| {
            let mut added = Vec::new();
            for node in dag.install_order() {
                let is_root = root_hashes.contains(&node.hash.as_str());
                if let Some(existing) = store.get(&node.hash) {
                    if explicit && is_root && !existing.explicit {
                        let mut updated = existing.clone();
                        updated.explicit = true;
                        store.put(updated);
                    }
                    continue;
                }
                let dependencies: Vec<DependencyRef> = dag
                    .dependencies(&node.name)
                    .into_iter()
                    .map(|(child, edge)| DependencyRef {
                        name: child.name.clone(),
                        hash: child.hash.clone(),
                        types: edge.types,
                    })
                    .collect();
                for dep in dependencies.iter().filter(|d| d.holds()) {
                    let mut target = store
                        .get(&dep.hash)
                        .cloned()
                        .ok_or_else(|| DatabaseError::NotFound(dep.hash.clone()))?;
                    target.ref_count += 1;
                    store.put(target);
                }
                let record = InstalledRecord {
                    node: node.clone(),
                    prefix: layout.prefix_for(node),
                    dependencies,
                    explicit: explicit && is_root,
                    ref_count: 0,
                    installed_at: now,
                };
                store.put(record.clone());
                added.push(record);
            }
            Ok(added)
        })?;
        tracing::info!(added = added.len(), nodes = dag.len(), "recorded installation");
        Ok(added)
    }

    /// Forget the record `hash`. Refused while other records link or run
    /// against it.
    pub fn remove(&self, hash: &str) -> Result<InstalledRecord> {
        let removed = self.write(|store| {
            let record = store
                .get(hash)
                .cloned()
                .ok_or_else(|| DatabaseError::NotFound(hash.to_string()))?;
            if record.ref_count > 0 {
                let dependents = store
                    .list()
                    .into_iter()
                    .filter(|r| r.dependencies.iter().any(|d| d.hash == hash && d.holds()))
                    .map(|r| format!("{}/{}", r.node.name, r.node.short_hash()))
                    .collect();
                return Err(DatabaseError::HasDependents {
                    hash: hash.to_string(),
                    dependents,
                });
            }
            for dep in record.dependencies.iter().filter(|d| d.holds()) {
                if let Some(target) = store.get(&dep.hash) {
                    let mut target = target.clone();
                    target.ref_count = target.ref_count.saturating_sub(1);
                    store.put(target);
                }
            }
            store.delete(hash);
            Ok(record)
        })?;
        tracing::info!(package = %removed.node.name, hash = %removed.hash(), "removed installed record");
        Ok(removed)
    }
}

/// The record's node with its installed dependency subgraph as `^`
/// constraints.
fn installed_spec<S: RecordStore + ?Sized>(store: &S, record: &InstalledRecord) -> Spec {
    let mut spec = record.node.to_spec();
    let mut seen = BTreeMap::new();
    let mut stack: Vec<&str> = record.dependencies.iter().map(|d| d.hash.as_str()).collect();
    while let Some(hash) = stack.pop() {
        let Some(dep) = store.get(hash) else {
            continue;
        };
        if seen.insert(dep.node.name.clone(), dep.node.to_spec()).is_none() {
            stack.extend(dep.dependencies.iter().map(|d| d.hash.as_str()));
        }
    }
    spec.dependencies = seen.into_values().collect();
    spec
}
