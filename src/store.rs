//! Persistence boundary and the dedup memo table.
//!
//! [`Store`] is deliberately small: read with an equality condition, insert,
//! patch by id, and an atomic claim. [`JsonStore`] implements it in memory,
//! optionally backed by a JSON file. A file-backed store re-reads the file
//! under an advisory lock for every operation, so processes sharing one file
//! see each other's records.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::error::{FanoutError, Result};
use crate::state_machine::RunState;

/// One row: a JSON object.
pub type Row = serde_json::Map<String, Value>;

/// Table holding [`TaskRecord`]s.
pub const TASKS_TABLE: &str = "tasks";

pub trait Store: Send + Sync {
    /// Rows of `table` whose fields equal every entry of `condition`,
    /// projected onto `select` (all fields when empty). `id` is always kept.
    fn read(&self, table: &str, select: &[&str], condition: &Row) -> Result<Vec<Row>>;

    /// Inserts a row and returns its new id.
    fn insert(&self, table: &str, fields: Row) -> Result<String>;

    /// Merges `patches` into the row with `id`.
    fn update(&self, table: &str, id: &str, patches: Row) -> Result<()>;

    /// Inserts `fields` unless a row matches `condition`, as one atomic step.
    /// A matching row that `replaceable` accepts is overwritten with `fields`
    /// instead; any other matching row is left alone and handed back.
    fn claim(
        &self,
        table: &str,
        condition: &Row,
        fields: Row,
        replaceable: &dyn Fn(&Row) -> bool,
    ) -> Result<Claim>;
}

/// Result of [`Store::claim`].
#[derive(Debug, Clone, PartialEq)]
pub enum Claim {
    /// The row with this id now holds the claimed fields.
    Acquired(String),
    /// A row that could not be replaced.
    Held(Row),
}

type Tables = BTreeMap<String, BTreeMap<String, Row>>;

pub struct JsonStore {
    path: Option<PathBuf>,
    tables: Mutex<Tables>,
}

impl JsonStore {
    pub fn in_memory() -> Self {
        Self {
            path: None,
            tables: Mutex::new(Tables::new()),
        }
    }

    /// Opens (or starts) a store persisted at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let tables = load(&path)?;
        Ok(Self {
            path: Some(path),
            tables: Mutex::new(tables),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| FanoutError::Store("store lock poisoned".into()))
    }

    /// Runs `op` on the current tables. For a file-backed store the file is
    /// locked (exclusively when `write`), re-read first and rewritten after.
    fn transact<T>(&self, write: bool, op: impl FnOnce(&mut Tables) -> Result<T>) -> Result<T> {
        let mut tables = self.lock()?;
        let Some(path) = &self.path else {
            return op(&mut tables);
        };
        let _file_lock = lock_file(path, write)?;
        *tables = load(path)?;
        let out = op(&mut tables)?;
        if write {
            persist(path, &tables)?;
        }
        Ok(out)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

fn load(path: &Path) -> Result<Tables> {
    if !path.exists() {
        return Ok(Tables::new());
    }
    let contents = std::fs::read_to_string(path)?;
    if contents.trim().is_empty() {
        Ok(Tables::new())
    } else {
        Ok(serde_json::from_str(&contents)?)
    }
}

fn persist(path: &Path, tables: &Tables) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_vec_pretty(tables)?)?;
    std::fs::rename(&tmp, path)?;
    debug!(path = %path.display(), "store persisted");
    Ok(())
}

/// Advisory lock on `<path>.lock`, released when the file is dropped.
fn lock_file(path: &Path, exclusive: bool) -> Result<File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let mut name = OsString::from(path.as_os_str());
    name.push(".lock");
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(PathBuf::from(name))?;
    if exclusive {
        FileExt::lock_exclusive(&file)?;
    } else {
        FileExt::lock_shared(&file)?;
    }
    Ok(file)
}

fn matches(row: &Row, condition: &Row) -> bool {
    condition.iter().all(|(k, v)| row.get(k) == Some(v))
}

impl Store for JsonStore {
    fn read(&self, table: &str, select: &[&str], condition: &Row) -> Result<Vec<Row>> {
        self.transact(false, |tables| {
            let Some(rows) = tables.get(table) else {
                return Ok(Vec::new());
            };
            Ok(rows
                .values()
                .filter(|row| matches(row, condition))
                .map(|row| {
                    if select.is_empty() {
                        row.clone()
                    } else {
                        row.iter()
                            .filter(|(k, _)| k.as_str() == "id" || select.contains(&k.as_str()))
                            .map(|(k, v)| (k.clone(), v.clone()))
                            .collect()
                    }
                })
                .collect())
        })
    }

    fn insert(&self, table: &str, mut fields: Row) -> Result<String> {
        self.transact(true, |tables| {
            let id = Uuid::new_v4().to_string();
            fields.insert("id".into(), Value::String(id.clone()));
            tables
                .entry(table.to_string())
                .or_default()
                .insert(id.clone(), fields);
            Ok(id)
        })
    }

    fn update(&self, table: &str, id: &str, patches: Row) -> Result<()> {
        self.transact(true, |tables| {
            let row = tables
                .get_mut(table)
                .and_then(|rows| rows.get_mut(id))
                .ok_or_else(|| FanoutError::Store(format!("no row {id} in {table}")))?;
            for (key, value) in patches {
                if key != "id" {
                    row.insert(key, value);
                }
            }
            Ok(())
        })
    }

    fn claim(
        &self,
        table: &str,
        condition: &Row,
        mut fields: Row,
        replaceable: &dyn Fn(&Row) -> bool,
    ) -> Result<Claim> {
        self.transact(true, |tables| {
            let rows = tables.entry(table.to_string()).or_default();
            if let Some((id, row)) = rows.iter_mut().find(|(_, row)| matches(row, condition)) {
                if !replaceable(row) {
                    return Ok(Claim::Held(row.clone()));
                }
                fields.insert("id".into(), Value::String(id.clone()));
                *row = fields;
                return Ok(Claim::Acquired(id.clone()));
            }
            let id = Uuid::new_v4().to_string();
            fields.insert("id".into(), Value::String(id.clone()));
            rows.insert(id.clone(), fields);
            Ok(Claim::Acquired(id))
        })
    }
}

/// Dedup memo: what a task with this hash produced, or which run is
/// producing it right now.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub hash: String,
    pub outputs: Vec<PathBuf>,
    pub state: RunState,
    /// Run that wrote the record last.
    #[serde(default)]
    pub run_id: Option<String>,
}

impl TaskRecord {
    fn to_row(&self) -> Result<Row> {
        match serde_json::to_value(self)? {
            Value::Object(row) => Ok(row),
            _ => Err(FanoutError::Store("task record is not an object".into())),
        }
    }

    fn from_row(mut row: Row) -> Result<(String, Self)> {
        let id = match row.remove("id") {
            Some(Value::String(id)) => id,
            _ => return Err(FanoutError::Store("task record without id".into())),
        };
        Ok((id, serde_json::from_value(Value::Object(row))?))
    }

    /// Record stored for `hash`, with its row id.
    pub fn find(store: &dyn Store, hash: &str) -> Result<Option<(String, Self)>> {
        let mut condition = Row::new();
        condition.insert("hash".into(), Value::String(hash.to_string()));
        let rows = store.read(
            TASKS_TABLE,
            &["hash", "outputs", "state", "run_id"],
            &condition,
        )?;
        rows.into_iter().next().map(Self::from_row).transpose()
    }

    /// Every stored record.
    pub fn list(store: &dyn Store) -> Result<Vec<Self>> {
        store
            .read(TASKS_TABLE, &[], &Row::new())?
            .into_iter()
            .map(|row| Self::from_row(row).map(|(_, record)| record))
            .collect()
    }

    /// A run owns the hash: nothing may reuse its directory or submit for it.
    pub fn is_in_flight(&self) -> bool {
        !matches!(
            self.state,
            RunState::Completed | RunState::Failed | RunState::RolledBack
        )
    }

    /// Claims `hash` for `run_id` with an in-flight record. A record left
    /// by a failed or rolled back run is taken over. Returns the record that
    /// holds the hash instead when it is completed or still in flight.
    pub fn claim(store: &dyn Store, hash: &str, run_id: &str) -> Result<Option<Self>> {
        let record = TaskRecord {
            hash: hash.to_string(),
            outputs: Vec::new(),
            state: RunState::Created,
            run_id: Some(run_id.to_string()),
        };
        let mut condition = Row::new();
        condition.insert("hash".into(), Value::String(hash.to_string()));
        let replaceable = |row: &Row| {
            Self::from_row(row.clone())
                .map(|(_, held)| !held.is_in_flight() && held.state != RunState::Completed)
                .unwrap_or(false)
        };
        match store.claim(TASKS_TABLE, &condition, record.to_row()?, &replaceable)? {
            Claim::Acquired(_) => Ok(None),
            Claim::Held(row) => Self::from_row(row).map(|(_, held)| Some(held)),
        }
    }

    /// Marks an in-flight record for `hash` rolled back, for runs that died
    /// without cleaning up. Returns whether a record was released.
    pub fn release(store: &dyn Store, hash: &str) -> Result<bool> {
        match Self::find(store, hash)? {
            Some((id, record)) if record.is_in_flight() => {
                let mut patch = Row::new();
                patch.insert("state".into(), serde_json::to_value(RunState::RolledBack)?);
                store.update(TASKS_TABLE, &id, patch)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Inserts the record, or overwrites the one with the same hash.
    pub fn upsert(&self, store: &dyn Store) -> Result<String> {
        let row = self.to_row()?;
        match Self::find(store, &self.hash)? {
            Some((id, _)) => {
                store.update(TASKS_TABLE, &id, row)?;
                Ok(id)
            }
            None => store.insert(TASKS_TABLE, row),
        }
    }
}
