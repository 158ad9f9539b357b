//! Shared CSV results store.
//!
//! One row per canonical SMILES. Writers serialise through an advisory lock
//! on `<store>.lock` and replace the whole file atomically; readers take no
//! lock and may observe a slightly stale view.

use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions, TryLockError};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use tempfile::Builder;
use tracing::{debug, error, info, warn};

use crate::config::LOCK_WAIT_TIMEOUT_SECS;
use crate::domain::{KEY_COLUMN, MoleculeRecord, SCHEMA};
use crate::error::GrimError;

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug)]
pub enum WriteOutcome {
    Inserted,
    Updated,
    Duplicate,
    Failed(GrimError),
}

impl WriteOutcome {
    pub fn is_written(&self) -> bool {
        matches!(self, WriteOutcome::Inserted | WriteOutcome::Updated)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum SchemaCheck {
    Missing,
    Empty,
    Matches,
    Mismatch { found: Vec<String> },
}

impl SchemaCheck {
    pub fn is_compatible(&self) -> bool {
        !matches!(self, SchemaCheck::Mismatch { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub exists: bool,
    pub total_entries: usize,
    pub unique_keys: usize,
    pub file_size_bytes: u64,
    pub columns: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Datastore {
    path: PathBuf,
    lock_timeout: Duration,
}

impl Datastore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock_timeout: Duration::from_secs(LOCK_WAIT_TIMEOUT_SECS),
        }
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lock_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(".lock");
        PathBuf::from(name)
    }

    /// Takes the store's writer lock, waiting at most the configured timeout.
    pub fn lock(&self) -> Result<StoreLock, GrimError> {
        StoreLock::acquire(&self.lock_path(), self.lock_timeout)
    }

    /// All keys currently in the store. Never fails: an absent, empty or
    /// malformed file reads as an empty set, bad rows are skipped.
    pub fn keys(&self) -> BTreeSet<String> {
        let mut keys = BTreeSet::new();
        if !self.has_content() {
            debug!(path = %self.path.display(), "store is absent or empty");
            return keys;
        }

        let mut reader = match csv::ReaderBuilder::new()
            .flexible(true)
            .from_path(&self.path)
        {
            Ok(reader) => reader,
            Err(err) => {
                error!(path = %self.path.display(), "failed to open store: {err}");
                return keys;
            }
        };
        let key_index = match reader.headers() {
            Ok(headers) => headers.iter().position(|header| header.trim() == KEY_COLUMN),
            Err(err) => {
                warn!(path = %self.path.display(), "unreadable store header: {err}");
                return keys;
            }
        };
        let Some(key_index) = key_index else {
            warn!(path = %self.path.display(), "column '{KEY_COLUMN}' not found in store");
            return keys;
        };

        for row in reader.records() {
            match row {
                Ok(row) => {
                    if let Some(key) = row.get(key_index).map(str::trim) {
                        if !key.is_empty() {
                            keys.insert(key.to_string());
                        }
                    }
                }
                Err(err) => debug!("skipping malformed store row: {err}"),
            }
        }
        debug!(count = keys.len(), "read existing keys");
        keys
    }

    pub fn exists(&self, key: &str) -> bool {
        self.keys().contains(key.trim())
    }

    pub fn upsert(&self, record: &MoleculeRecord, overwrite: bool) -> WriteOutcome {
        if overwrite {
            self.update(record)
        } else {
            self.append(record)
        }
    }

    /// Adds `record` unless its key is already present.
    pub fn append(&self, record: &MoleculeRecord) -> WriteOutcome {
        self.write_locked(record, false)
    }

    /// Replaces the row for the record's key, or appends when absent.
    pub fn update(&self, record: &MoleculeRecord) -> WriteOutcome {
        self.write_locked(record, true)
    }

    fn write_locked(&self, record: &MoleculeRecord, overwrite: bool) -> WriteOutcome {
        if let Err(err) = record.validate() {
            error!("{err}");
            return WriteOutcome::Failed(err);
        }

        if let Some(parent) = parent_dir(&self.path) {
            if let Err(err) = fs::create_dir_all(parent) {
                let err = GrimError::Filesystem(err.to_string());
                error!("{err}");
                return WriteOutcome::Failed(err);
            }
        }

        debug!(path = %self.path.display(), "acquiring store lock");
        let _guard = match self.lock() {
            Ok(guard) => guard,
            Err(err) => {
                error!("{err}");
                return WriteOutcome::Failed(err);
            }
        };
        debug!(path = %self.path.display(), "store lock acquired");

        match self.apply(record, overwrite) {
            Ok(outcome) => outcome,
            Err(err) => {
                error!("error while holding store lock: {err}");
                WriteOutcome::Failed(err)
            }
        }
    }

    fn apply(&self, record: &MoleculeRecord, overwrite: bool) -> Result<WriteOutcome, GrimError> {
        let key = record.key();
        let Some(mut table) = self.read_table()? else {
            info!(path = %self.path.display(), "creating new store");
            let table = Table {
                headers: SCHEMA.iter().map(|column| column.to_string()).collect(),
                rows: vec![record.to_row()],
            };
            self.write_table(&table)?;
            info!("saved '{key}' to store");
            return Ok(WriteOutcome::Inserted);
        };

        let key_index = table.key_index().ok_or_else(|| {
            GrimError::Datastore(format!(
                "column '{KEY_COLUMN}' missing in {}",
                self.path.display()
            ))
        })?;
        let matches = table
            .rows
            .iter()
            .enumerate()
            .filter(|(_, row)| row.get(key_index).map(|v| v.trim()) == Some(key))
            .map(|(index, _)| index)
            .collect::<Vec<_>>();

        let outcome = if matches.is_empty() {
            info!("adding new entry '{key}' to store");
            let row = table.row_for(record);
            table.rows.push(row);
            WriteOutcome::Inserted
        } else if overwrite {
            info!("updating existing entry '{key}' in store");
            for index in matches {
                let row = &mut table.rows[index];
                for (column, header) in table.headers.iter().enumerate() {
                    if let Some(value) = record.value_for(header.trim()) {
                        row[column] = value;
                    }
                }
            }
            WriteOutcome::Updated
        } else {
            warn!("'{key}' already exists in store, skipping");
            return Ok(WriteOutcome::Duplicate);
        };

        self.write_table(&table)?;
        info!("saved '{key}' to store");
        Ok(outcome)
    }

    /// Compares the stored header with [`SCHEMA`].
    pub fn check_schema(&self) -> SchemaCheck {
        if !self.path.exists() {
            return SchemaCheck::Missing;
        }
        if !self.has_content() {
            return SchemaCheck::Empty;
        }
        let headers = csv::ReaderBuilder::new()
            .flexible(true)
            .from_path(&self.path)
            .and_then(|mut reader| reader.headers().cloned());
        match headers {
            Ok(headers) => {
                let found = headers
                    .iter()
                    .map(|header| header.trim().to_string())
                    .collect::<Vec<_>>();
                if found.iter().map(String::as_str).eq(SCHEMA.iter().copied()) {
                    SchemaCheck::Matches
                } else {
                    error!(
                        path = %self.path.display(),
                        "store schema mismatch: expected {:?}, found {:?}",
                        SCHEMA,
                        found
                    );
                    SchemaCheck::Mismatch { found }
                }
            }
            Err(err) => {
                error!("failed to read store header: {err}");
                SchemaCheck::Mismatch { found: Vec::new() }
            }
        }
    }

    pub fn stats(&self) -> StoreStats {
        let file_size_bytes = fs::metadata(&self.path).map(|meta| meta.len()).unwrap_or(0);
        let table = match self.read_table() {
            Ok(table) => table,
            Err(err) => {
                error!("failed to read store statistics: {err}");
                None
            }
        };
        let Some(table) = table else {
            return StoreStats {
                exists: self.path.exists(),
                total_entries: 0,
                unique_keys: 0,
                file_size_bytes,
                columns: Vec::new(),
            };
        };
        let unique_keys = table
            .key_index()
            .map(|index| {
                table
                    .rows
                    .iter()
                    .filter_map(|row| row.get(index).map(|v| v.trim()))
                    .filter(|v| !v.is_empty())
                    .collect::<BTreeSet<_>>()
                    .len()
            })
            .unwrap_or(0);
        StoreStats {
            exists: true,
            total_entries: table.rows.len(),
            unique_keys,
            file_size_bytes,
            columns: table.headers,
        }
    }

    /// Every well-formed record, in file order.
    pub fn records(&self) -> Result<Vec<MoleculeRecord>, GrimError> {
        let Some(table) = self.read_table()? else {
            return Ok(Vec::new());
        };
        Ok(table
            .rows
            .iter()
            .filter_map(|row| MoleculeRecord::from_row(&table.headers, row))
            .collect())
    }

    fn has_content(&self) -> bool {
        fs::metadata(&self.path)
            .map(|meta| meta.is_file() && meta.len() > 0)
            .unwrap_or(false)
    }

    fn read_table(&self) -> Result<Option<Table>, GrimError> {
        if !self.has_content() {
            return Ok(None);
        }
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_path(&self.path)
            .map_err(|err| GrimError::Datastore(err.to_string()))?;
        let headers = reader
            .headers()
            .map_err(|err| GrimError::Datastore(err.to_string()))?
            .iter()
            .map(|header| header.trim().to_string())
            .collect::<Vec<_>>();
        if headers.iter().all(|header| header.is_empty()) {
            return Ok(None);
        }

        // Short rows are padded. Long rows are refused so a rewrite never drops cells.
        let mut rows = Vec::new();
        for row in reader.records() {
            let row = row.map_err(|err| GrimError::Datastore(err.to_string()))?;
            if row.len() > headers.len() {
                let line = row.position().map(|pos| pos.line()).unwrap_or_default();
                return Err(GrimError::Datastore(format!(
                    "{} line {line} has {} fields but the header has {}",
                    self.path.display(),
                    row.len(),
                    headers.len()
                )));
            }
            let mut values = row.iter().map(str::to_string).collect::<Vec<_>>();
            values.resize(headers.len(), String::new());
            rows.push(values);
        }
        Ok(Some(Table { headers, rows }))
    }

    fn write_table(&self, table: &Table) -> Result<(), GrimError> {
        let parent = parent_dir(&self.path).unwrap_or_else(|| Path::new("."));
        let mut temp = Builder::new()
            .prefix(".grimperium-store")
            .suffix(".tmp")
            .tempfile_in(parent)
            .map_err(|err| GrimError::Filesystem(err.to_string()))?;
        {
            let mut writer = csv::Writer::from_writer(temp.as_file_mut());
            writer
                .write_record(&table.headers)
                .map_err(|err| GrimError::Datastore(err.to_string()))?;
            for row in &table.rows {
                writer
                    .write_record(row)
                    .map_err(|err| GrimError::Datastore(err.to_string()))?;
            }
            writer
                .flush()
                .map_err(|err| GrimError::Filesystem(err.to_string()))?;
        }
        temp.as_file()
            .sync_all()
            .map_err(|err| GrimError::Filesystem(err.to_string()))?;
        temp.persist(&self.path)
            .map_err(|err| GrimError::Filesystem(err.to_string()))?;
        Ok(())
    }
}

struct Table {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl Table {
    fn key_index(&self) -> Option<usize> {
        self.headers.iter().position(|header| header == KEY_COLUMN)
    }

    fn row_for(&self, record: &MoleculeRecord) -> Vec<String> {
        self.headers
            .iter()
            .map(|header| record.value_for(header).unwrap_or_default())
            .collect()
    }
}

/// Exclusive advisory lock on a store's lock file, released on drop.
#[derive(Debug)]
pub struct StoreLock {
    file: File,
    path: PathBuf,
}

impl StoreLock {
    pub fn acquire(path: &Path, timeout: Duration) -> Result<Self, GrimError> {
        if let Some(parent) = parent_dir(path) {
            fs::create_dir_all(parent).map_err(|err| GrimError::Filesystem(err.to_string()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)
            .map_err(|err| GrimError::Filesystem(format!("open {}: {err}", path.display())))?;

        let started = Instant::now();
        loop {
            match file.try_lock() {
                Ok(()) => break,
                Err(TryLockError::WouldBlock) => {
                    if started.elapsed() >= timeout {
                        return Err(GrimError::LockTimeout {
                            path: path.to_path_buf(),
                            seconds: timeout.as_secs(),
                        });
                    }
                    thread::sleep(LOCK_POLL_INTERVAL);
                }
                Err(TryLockError::Error(err)) => {
                    return Err(GrimError::Filesystem(format!(
                        "lock {}: {err}",
                        path.display()
                    )));
                }
            }
        }

        if let Err(err) = file
            .set_len(0)
            .and_then(|()| writeln!(file, "{}", std::process::id()))
        {
            debug!(path = %path.display(), "could not record lock owner: {err}");
        }
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        if let Err(err) = self.file.unlock() {
            warn!(path = %self.path.display(), "failed to release store lock: {err}");
        } else {
            debug!(path = %self.path.display(), "store lock released");
        }
    }
}

fn parent_dir(path: &Path) -> Option<&Path> {
    path.parent().filter(|parent| !parent.as_os_str().is_empty())
}
