//! Flat-file record storage.
//!
//! Each store is one CSV file with a header row. The file is the single
//! source of truth: every read goes to disk and every write replaces the
//! whole file atomically (temp file in the same directory, fsync, rename),
//! so readers never observe a half-written table.
//!
//! Read-modify-write cycles run inside [`Storage::transaction`], which holds
//! the store's named lock for exactly one load + save.

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::lock::{LockGuard, LockManager};

/// One row, keyed by column name.
pub type Row = BTreeMap<String, String>;

/// An in-memory copy of a store file. Column order is preserved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Table {
    headers: Vec<String>,
    rows: Vec<Row>,
}

impl Table {
    pub fn new<I, S>(headers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            headers: headers.into_iter().map(Into::into).collect(),
            rows: Vec::new(),
        }
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn rows_mut(&mut self) -> &mut [Row] {
        &mut self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.headers.iter().any(|h| h == column)
    }

    /// Append `column` to the header if it is not there yet.
    pub fn ensure_column(&mut self, column: &str) {
        if !self.has_column(column) {
            self.headers.push(column.to_string());
        }
    }

    /// Append a row. Columns it introduces are added to the header.
    pub fn push(&mut self, row: Row) {
        for column in row.keys() {
            self.ensure_column(column);
        }
        self.rows.push(row);
    }

    /// Position of the first row whose `column` equals `value` (trimmed).
    pub fn position(&self, column: &str, value: &str) -> Option<usize> {
        self.rows
            .iter()
            .position(|row| row.get(column).is_some_and(|v| v.trim() == value))
    }

    /// Map of `column` value to row position. Rejects duplicate values.
    ///
    /// Rows with an empty value are skipped.
    pub fn index_by(&self, column: &str, path: &Path) -> Result<HashMap<String, usize>> {
        if !self.has_column(column) {
            return Err(Error::MissingColumn {
                path: path.to_path_buf(),
                column: column.to_string(),
            });
        }
        let mut index = HashMap::with_capacity(self.rows.len());
        for (pos, row) in self.rows.iter().enumerate() {
            let key = row.get(column).map(|v| v.trim()).unwrap_or("");
            if key.is_empty() {
                continue;
            }
            if index.insert(key.to_string(), pos).is_some() {
                return Err(Error::DuplicateKey {
                    path: path.to_path_buf(),
                    key: key.to_string(),
                });
            }
        }
        Ok(index)
    }

    /// Merge `fields` into the row whose `key_column` equals `key`.
    pub fn merge(&mut self, key_column: &str, key: &str, fields: &Row) -> Result<()> {
        let pos = self
            .position(key_column, key)
            .ok_or_else(|| Error::NotFound(key.to_string()))?;
        for column in fields.keys() {
            self.ensure_column(column);
        }
        let row = &mut self.rows[pos];
        for (column, value) in fields {
            row.insert(column.clone(), value.clone());
        }
        Ok(())
    }
}

/// A CSV-backed store at a fixed path, guarded by a named lock.
#[derive(Debug, Clone)]
pub struct Storage {
    path: PathBuf,
    locks: LockManager,
}

impl Storage {
    pub fn new(path: impl Into<PathBuf>, locks: LockManager) -> Self {
        Self {
            path: path.into(),
            locks,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Take this store's named lock.
    ///
    /// Callers composing two stores must lock the task store before the
    /// pool store.
    pub fn lock(&self) -> Result<LockGuard> {
        self.locks.acquire(&self.path)
    }

    /// Parse the whole file. `None` when the file does not exist.
    ///
    /// Does not lock; use [`Storage::transaction`] for consistent reads
    /// that feed a write.
    pub fn load(&self) -> Result<Option<Table>> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .trim(csv::Trim::Headers)
            .from_reader(file);

        let headers: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record?;
            if record.iter().all(|cell| cell.trim().is_empty()) {
                continue;
            }
            // Short rows are padded. Cells past the header would be lost on save.
            if record.iter().skip(headers.len()).any(|cell| !cell.trim().is_empty()) {
                return Err(Error::ExtraCells {
                    path: self.path.clone(),
                    line: record.position().map_or(0, |p| p.line()),
                    width: record.len(),
                    columns: headers.len(),
                });
            }
            let row = headers
                .iter()
                .enumerate()
                .map(|(i, h)| (h.clone(), record.get(i).unwrap_or("").to_string()))
                .collect();
            rows.push(row);
        }

        Ok(Some(Table { headers, rows }))
    }

    /// Replace the file with `table`.
    ///
    /// Writes a sibling temp file, syncs it, then renames it over the target.
    /// A crash at any point leaves either the old file or the new one.
    pub fn save(&self, table: &Table) -> Result<()> {
        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        let mut tmp = tempfile::Builder::new()
            .prefix(".claimq-")
            .suffix(".tmp")
            .tempfile_in(dir)?;

        {
            let mut writer = csv::Writer::from_writer(tmp.as_file_mut());
            if !table.headers.is_empty() {
                writer.write_record(&table.headers)?;
            }
            for row in &table.rows {
                writer.write_record(
                    table
                        .headers
                        .iter()
                        .map(|h| row.get(h).map(String::as_str).unwrap_or("")),
                )?;
            }
            writer.flush()?;
        }

        if let Ok(meta) = std::fs::metadata(&self.path) {
            tmp.as_file().set_permissions(meta.permissions())?;
        }
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| Error::Io(e.error))?;
        Ok(())
    }

    /// Run one locked read-modify-write cycle.
    ///
    /// The closure sees the freshly loaded table (`None` if the file is
    /// absent) and returns whether to save along with its result. The lock
    /// is released when this returns, on success or failure.
    pub fn transaction<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Option<Table>) -> Result<(Commit, T)>,
    {
        let _guard = self.lock()?;
        let mut table = self.load()?;
        let (commit, result) = f(&mut table)?;
        if let (Commit::Save, Some(table)) = (commit, table.as_ref()) {
            self.save(table)?;
        }
        Ok(result)
    }

    /// Merge `fields` into the row keyed by `key`, under the store lock.
    pub fn upsert(&self, key_column: &str, key: &str, fields: &Row) -> Result<()> {
        self.transaction(|table| {
            let table = table
                .as_mut()
                .ok_or_else(|| Error::NotFound(key.to_string()))?;
            table.merge(key_column, key, fields)?;
            Ok((Commit::Save, ()))
        })
    }
}

/// Whether a transaction writes its table back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Commit {
    Save,
    Discard,
}
