//! Container file read/write implementation.
//!
//! # Layout
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ Superblock (64 bytes: magic, version, data end, catalog ptr) │
//! ├──────────────────────────────────────────────────────────────┤
//! │ Data region (zero-filled chunks, appended in any order)      │
//! ├──────────────────────────────────────────────────────────────┤
//! │ Catalog (JSON + crc32, rewritten at each flush)              │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! The catalog maps dataset paths to their dtype, row count, and chunk
//! offsets. Aliases let two group paths share one dataset, which is how a
//! reference table is visible from both of its endpoints. Deleting a
//! subtree drops catalog entries only; dead chunks stay in the file.

use super::dtype::{ref_region_dtype, Dtype};
use crate::error::{FlowError, Result};
use byteorder::{ByteOrder, LittleEndian};
use fs2::FileExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const MAGIC: [u8; 8] = *b"ROWFLOW\0";

/// On-disk format version.
pub const FORMAT_VERSION: u32 = 1;

const SUPERBLOCK_SIZE: u64 = 64;

/// Chunk size used when a dataset is created without an explicit one.
pub const DEFAULT_CHUNK_ROWS: u64 = 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DatasetMeta {
    dtype: Dtype,
    rows: u64,
    chunk_rows: u64,
    /// File offset of each allocated chunk, in row order.
    chunks: Vec<u64>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Catalog {
    datasets: BTreeMap<String, DatasetMeta>,
    /// Alias path -> canonical dataset path.
    aliases: BTreeMap<String, String>,
    /// Group path -> attribute map.
    attrs: BTreeMap<String, BTreeMap<String, serde_json::Value>>,
}

impl Catalog {
    fn resolve<'a>(&'a self, path: &'a str) -> &'a str {
        self.aliases.get(path).map(String::as_str).unwrap_or(path)
    }
}

#[derive(Debug)]
struct FileInner {
    file: File,
    catalog: Catalog,
    /// End of the data region; the catalog is written here on flush.
    data_end: u64,
    closed: bool,
}

/// A self-describing chunked table container.
///
/// All methods take `&self`; internal state is guarded by a single lock so
/// thread-ranks sharing one handle observe every operation atomically.
#[derive(Debug)]
pub struct TableFile {
    path: PathBuf,
    inner: Mutex<FileInner>,
}

impl TableFile {
    /// Create a new container, truncating any existing file.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| FlowError::io(&path, &e))?;
        file.try_lock_exclusive()
            .map_err(|e| FlowError::io(&path, &e))?;

        let this = Self {
            path,
            inner: Mutex::new(FileInner {
                file,
                catalog: Catalog::default(),
                data_end: SUPERBLOCK_SIZE,
                closed: false,
            }),
        };
        this.flush()?;
        Ok(this)
    }

    /// Open an existing container and load its catalog.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| FlowError::io(&path, &e))?;
        file.try_lock_exclusive()
            .map_err(|e| FlowError::io(&path, &e))?;

        let mut sb = [0u8; SUPERBLOCK_SIZE as usize];
        file.seek(SeekFrom::Start(0))
            .and_then(|_| file.read_exact(&mut sb))
            .map_err(|e| FlowError::io(&path, &e))?;
        if sb[..8] != MAGIC {
            return Err(FlowError::Corrupt {
                path,
                cause: "bad magic".to_string(),
            });
        }
        let version = LittleEndian::read_u32(&sb[8..12]);
        if version != FORMAT_VERSION {
            return Err(FlowError::Corrupt {
                path,
                cause: format!("unsupported format version {}", version),
            });
        }
        let data_end = LittleEndian::read_u64(&sb[16..24]);
        let catalog_offset = LittleEndian::read_u64(&sb[24..32]);
        let catalog_len = LittleEndian::read_u64(&sb[32..40]);
        let catalog_crc = LittleEndian::read_u32(&sb[40..44]);

        let mut buf = vec![0u8; catalog_len as usize];
        file.seek(SeekFrom::Start(catalog_offset))
            .and_then(|_| file.read_exact(&mut buf))
            .map_err(|e| FlowError::io(&path, &e))?;
        if crc32fast::hash(&buf) != catalog_crc {
            return Err(FlowError::Corrupt {
                path,
                cause: "catalog checksum mismatch".to_string(),
            });
        }
        let catalog: Catalog = serde_json::from_slice(&buf).map_err(|e| FlowError::Corrupt {
            path: path.clone(),
            cause: format!("catalog decode failed: {}", e),
        })?;

        Ok(Self {
            path,
            inner: Mutex::new(FileInner {
                file,
                catalog,
                data_end,
                closed: false,
            }),
        })
    }

    /// Open `path` if it exists, otherwise create it.
    pub fn open_or_create(path: impl AsRef<Path>) -> Result<Self> {
        if path.as_ref().exists() {
            Self::open(path)
        } else {
            Self::create(path)
        }
    }

    /// Path of the underlying file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> Result<parking_lot::MutexGuard<'_, FileInner>> {
        let inner = self.inner.lock();
        if inner.closed {
            return Err(FlowError::Io {
                path: self.path.clone(),
                cause: "container file is closed".to_string(),
            });
        }
        Ok(inner)
    }

    fn io_err(&self, e: &io::Error) -> FlowError {
        FlowError::io(&self.path, e)
    }

    // ------------------------------------------------------------------
    // Catalog operations
    // ------------------------------------------------------------------

    /// Check whether a dataset (or alias) exists at `path`.
    pub fn dataset_exists(&self, path: &str) -> bool {
        let inner = self.inner.lock();
        let canonical = inner.catalog.resolve(path).to_string();
        inner.catalog.datasets.contains_key(&canonical)
    }

    /// Whether `path` is an alias rather than the canonical dataset path.
    pub fn is_alias(&self, path: &str) -> bool {
        self.inner.lock().catalog.aliases.contains_key(path)
    }

    /// Create a dataset; a no-op if it already exists with the same dtype.
    pub fn create_dataset(&self, path: &str, dtype: &Dtype, chunk_rows: u64) -> Result<()> {
        if dtype.row_size() == 0 {
            return Err(FlowError::TypeMismatch {
                path: path.to_string(),
                expected: "a row type with at least one field".to_string(),
                actual: dtype.describe(),
            });
        }
        let mut inner = self.lock()?;
        let canonical = inner.catalog.resolve(path).to_string();
        if let Some(meta) = inner.catalog.datasets.get(&canonical) {
            if meta.dtype != *dtype {
                return Err(FlowError::AlreadyExistsWithDifferentType {
                    path: path.to_string(),
                    requested: dtype.describe(),
                    actual: meta.dtype.describe(),
                });
            }
            return Ok(());
        }
        inner.catalog.datasets.insert(
            canonical,
            DatasetMeta {
                dtype: dtype.clone(),
                rows: 0,
                chunk_rows: chunk_rows.max(1),
                chunks: Vec::new(),
            },
        );
        Ok(())
    }

    /// Register `alias` as a second path for the dataset at `target`.
    pub fn alias_dataset(&self, alias: &str, target: &str) -> Result<()> {
        let mut inner = self.lock()?;
        let canonical = inner.catalog.resolve(target).to_string();
        if !inner.catalog.datasets.contains_key(&canonical) {
            return Err(FlowError::NotFound {
                path: target.to_string(),
            });
        }
        if let Some(existing) = inner.catalog.aliases.get(alias) {
            if *existing == canonical {
                return Ok(());
            }
            return Err(FlowError::AlreadyExistsWithDifferentType {
                path: alias.to_string(),
                requested: format!("alias of '{}'", canonical),
                actual: format!("alias of '{}'", existing),
            });
        }
        if inner.catalog.datasets.contains_key(alias) {
            return Err(FlowError::AlreadyExistsWithDifferentType {
                path: alias.to_string(),
                requested: format!("alias of '{}'", canonical),
                actual: "dataset".to_string(),
            });
        }
        inner.catalog.aliases.insert(alias.to_string(), canonical);
        Ok(())
    }

    fn meta<'a>(&self, inner: &'a FileInner, path: &str) -> Result<(&'a DatasetMeta, String)> {
        let canonical = inner.catalog.resolve(path).to_string();
        inner
            .catalog
            .datasets
            .get(&canonical)
            .map(|m| (m, canonical.clone()))
            .ok_or_else(|| FlowError::NotFound {
                path: path.to_string(),
            })
    }

    /// Row type of the dataset at `path`.
    pub fn dtype(&self, path: &str) -> Result<Dtype> {
        let inner = self.lock()?;
        Ok(self.meta(&inner, path)?.0.dtype.clone())
    }

    /// Current row count of the dataset at `path`.
    pub fn row_count(&self, path: &str) -> Result<u64> {
        let inner = self.lock()?;
        Ok(self.meta(&inner, path)?.0.rows)
    }

    /// Storage chunk size, in rows, of the dataset at `path`.
    pub fn chunk_rows(&self, path: &str) -> Result<u64> {
        let inner = self.lock()?;
        Ok(self.meta(&inner, path)?.0.chunk_rows)
    }

    /// All canonical dataset paths with their row counts and dtypes.
    pub fn datasets(&self) -> Vec<(String, u64, Dtype)> {
        let inner = self.inner.lock();
        inner
            .catalog
            .datasets
            .iter()
            .map(|(p, m)| (p.clone(), m.rows, m.dtype.clone()))
            .collect()
    }

    /// All aliases as `(alias, canonical)` pairs.
    pub fn aliases(&self) -> Vec<(String, String)> {
        let inner = self.inner.lock();
        inner
            .catalog
            .aliases
            .iter()
            .map(|(a, t)| (a.clone(), t.clone()))
            .collect()
    }

    /// Set one attribute on the group at `path`.
    pub fn set_attr(&self, path: &str, key: &str, value: serde_json::Value) -> Result<()> {
        let mut inner = self.lock()?;
        inner
            .catalog
            .attrs
            .entry(path.to_string())
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    /// Attributes of the group at `path`; empty if none were set.
    pub fn attrs(&self, path: &str) -> BTreeMap<String, serde_json::Value> {
        let inner = self.inner.lock();
        inner.catalog.attrs.get(path).cloned().unwrap_or_default()
    }

    /// Remove the subtree rooted at `path` from the catalog.
    ///
    /// Datasets, aliases into or out of the subtree, and attributes all go;
    /// the chunk bytes stay behind as dead space.
    pub fn delete(&self, path: &str) -> Result<()> {
        let mut inner = self.lock()?;
        let prefix = format!("{}/", path);
        let under = |p: &str| p == path || p.starts_with(&prefix);
        let removed: Vec<String> = inner
            .catalog
            .datasets
            .keys()
            .filter(|p| under(p))
            .cloned()
            .collect();
        for p in &removed {
            inner.catalog.datasets.remove(p);
        }
        inner.catalog.aliases.retain(|alias, target| {
            !under(alias) && !removed.iter().any(|r| r.as_str() == target.as_str())
        });
        inner.catalog.attrs.retain(|group, _| !under(group));
        Ok(())
    }

    // ------------------------------------------------------------------
    // Data operations
    // ------------------------------------------------------------------

    /// Grow the dataset at `path` to at least `target_rows` rows.
    ///
    /// Idempotent with max semantics so that every rank of a collective can
    /// apply the same extension. New chunks are zero-filled.
    pub fn extend_to(&self, path: &str, target_rows: u64) -> Result<()> {
        let mut inner = self.lock()?;
        let (meta, canonical) = self.meta(&inner, path)?;
        if target_rows <= meta.rows {
            return Ok(());
        }
        let row_size = meta.dtype.row_size() as u64;
        let chunk_rows = meta.chunk_rows;
        let chunk_bytes = chunk_rows * row_size;
        let needed_chunks = target_rows.div_ceil(chunk_rows) as usize;

        let mut new_offsets = Vec::new();
        let mut data_end = inner.data_end;
        let existing = inner.catalog.datasets[&canonical].chunks.len();
        if needed_chunks > existing {
            let zeros = vec![0u8; chunk_bytes as usize];
            for _ in existing..needed_chunks {
                inner
                    .file
                    .seek(SeekFrom::Start(data_end))
                    .and_then(|_| inner.file.write_all(&zeros))
                    .map_err(|e| {
                        if e.kind() == io::ErrorKind::StorageFull {
                            FlowError::OutOfSpace {
                                path: self.path.clone(),
                                requested: chunk_bytes,
                            }
                        } else {
                            self.io_err(&e)
                        }
                    })?;
                new_offsets.push(data_end);
                data_end += chunk_bytes;
            }
        }
        inner.data_end = data_end;
        let meta = inner.catalog.datasets.get_mut(&canonical).expect("resolved");
        meta.chunks.extend(new_offsets);
        meta.rows = target_rows;
        Ok(())
    }

    /// Write encoded rows starting at `start_row`.
    ///
    /// The destination must lie inside the dataset's current extent; growth
    /// happens only through [`TableFile::extend_to`].
    pub fn write_rows(&self, path: &str, start_row: u64, data: &[u8]) -> Result<()> {
        let mut inner = self.lock()?;
        let (meta, _) = self.meta(&inner, path)?;
        let row_size = meta.dtype.row_size() as u64;
        if data.len() as u64 % row_size != 0 {
            return Err(FlowError::TypeMismatch {
                path: path.to_string(),
                expected: format!("multiple of {} byte rows", row_size),
                actual: format!("{} bytes", data.len()),
            });
        }
        let n = data.len() as u64 / row_size;
        if start_row + n > meta.rows {
            return Err(FlowError::ShapeMismatch {
                what: format!("write to '{}'", path),
                expected: meta.rows,
                actual: start_row + n,
            });
        }
        let chunk_rows = meta.chunk_rows;
        let chunks = meta.chunks.clone();

        let mut row = start_row;
        let mut cursor = 0usize;
        while row < start_row + n {
            let chunk_idx = (row / chunk_rows) as usize;
            let within = row % chunk_rows;
            let run = (chunk_rows - within).min(start_row + n - row);
            let offset = chunks[chunk_idx] + within * row_size;
            let bytes = (run * row_size) as usize;
            inner
                .file
                .seek(SeekFrom::Start(offset))
                .and_then(|_| inner.file.write_all(&data[cursor..cursor + bytes]))
                .map_err(|e| self.io_err(&e))?;
            row += run;
            cursor += bytes;
        }
        Ok(())
    }

    /// Read a contiguous row range as encoded bytes.
    pub fn read_rows(&self, path: &str, start_row: u64, n: u64) -> Result<Vec<u8>> {
        let mut inner = self.lock()?;
        let (meta, _) = self.meta(&inner, path)?;
        if start_row + n > meta.rows {
            return Err(FlowError::InvalidSelection {
                index: (start_row + n) as i64 - 1,
                len: meta.rows,
            });
        }
        let row_size = meta.dtype.row_size() as u64;
        let chunk_rows = meta.chunk_rows;
        let chunks = meta.chunks.clone();

        let mut out = vec![0u8; (n * row_size) as usize];
        let mut row = start_row;
        let mut cursor = 0usize;
        while row < start_row + n {
            let chunk_idx = (row / chunk_rows) as usize;
            let within = row % chunk_rows;
            let run = (chunk_rows - within).min(start_row + n - row);
            let offset = chunks[chunk_idx] + within * row_size;
            let bytes = (run * row_size) as usize;
            inner
                .file
                .seek(SeekFrom::Start(offset))
                .and_then(|_| inner.file.read_exact(&mut out[cursor..cursor + bytes]))
                .map_err(|e| self.io_err(&e))?;
            row += run;
            cursor += bytes;
        }
        Ok(out)
    }

    /// Gather arbitrary rows by absolute index.
    pub fn read_rows_at(&self, path: &str, indices: &[u64]) -> Result<Vec<u8>> {
        let mut inner = self.lock()?;
        let (meta, _) = self.meta(&inner, path)?;
        let row_size = meta.dtype.row_size() as u64;
        let chunk_rows = meta.chunk_rows;
        let rows = meta.rows;
        let chunks = meta.chunks.clone();

        let mut out = vec![0u8; indices.len() * row_size as usize];
        for (i, &idx) in indices.iter().enumerate() {
            if idx >= rows {
                return Err(FlowError::InvalidSelection {
                    index: idx as i64,
                    len: rows,
                });
            }
            let chunk_idx = (idx / chunk_rows) as usize;
            let within = idx % chunk_rows;
            let offset = chunks[chunk_idx] + within * row_size;
            let at = i * row_size as usize;
            inner
                .file
                .seek(SeekFrom::Start(offset))
                .and_then(|_| inner.file.read_exact(&mut out[at..at + row_size as usize]))
                .map_err(|e| self.io_err(&e))?;
        }
        Ok(out)
    }

    /// Widen region-index entries to cover `[lo, hi)` windows.
    ///
    /// Each update is a read-modify-write done under the file lock: a null
    /// entry becomes `[lo, hi)`, an existing entry becomes
    /// `[min(start, lo), max(stop, hi))`. The merge is commutative and
    /// associative, so any cross-rank interleaving converges to the same
    /// superset window.
    pub fn widen_regions(&self, path: &str, updates: &[(u64, i64, i64)]) -> Result<()> {
        let mut inner = self.lock()?;
        let (meta, _) = self.meta(&inner, path)?;
        if meta.dtype != ref_region_dtype() {
            return Err(FlowError::TypeMismatch {
                path: path.to_string(),
                expected: ref_region_dtype().describe(),
                actual: meta.dtype.describe(),
            });
        }
        let rows = meta.rows;
        let chunk_rows = meta.chunk_rows;
        let chunks = meta.chunks.clone();

        let mut entry = [0u8; 16];
        for &(row, lo, hi) in updates {
            if row >= rows {
                return Err(FlowError::InvalidSelection {
                    index: row as i64,
                    len: rows,
                });
            }
            let chunk_idx = (row / chunk_rows) as usize;
            let within = row % chunk_rows;
            let offset = chunks[chunk_idx] + within * 16;
            inner
                .file
                .seek(SeekFrom::Start(offset))
                .and_then(|_| inner.file.read_exact(&mut entry))
                .map_err(|e| self.io_err(&e))?;
            let start = LittleEndian::read_i64(&entry[..8]);
            let stop = LittleEndian::read_i64(&entry[8..]);
            let (start, stop) = if start == 0 && stop == 0 {
                (lo, hi)
            } else {
                (start.min(lo), stop.max(hi))
            };
            LittleEndian::write_i64(&mut entry[..8], start);
            LittleEndian::write_i64(&mut entry[8..], stop);
            inner
                .file
                .seek(SeekFrom::Start(offset))
                .and_then(|_| inner.file.write_all(&entry))
                .map_err(|e| self.io_err(&e))?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Serialize the catalog and update the superblock.
    pub fn flush(&self) -> Result<()> {
        let mut inner = self.lock()?;
        self.flush_inner(&mut inner)
    }

    fn flush_inner(&self, inner: &mut FileInner) -> Result<()> {
        let catalog = serde_json::to_vec(&inner.catalog).map_err(|e| FlowError::Io {
            path: self.path.clone(),
            cause: format!("catalog encode failed: {}", e),
        })?;
        let crc = crc32fast::hash(&catalog);
        let catalog_offset = inner.data_end;
        inner
            .file
            .seek(SeekFrom::Start(catalog_offset))
            .and_then(|_| inner.file.write_all(&catalog))
            .map_err(|e| self.io_err(&e))?;

        let mut sb = [0u8; SUPERBLOCK_SIZE as usize];
        sb[..8].copy_from_slice(&MAGIC);
        LittleEndian::write_u32(&mut sb[8..12], FORMAT_VERSION);
        LittleEndian::write_u64(&mut sb[16..24], inner.data_end);
        LittleEndian::write_u64(&mut sb[24..32], catalog_offset);
        LittleEndian::write_u64(&mut sb[32..40], catalog.len() as u64);
        LittleEndian::write_u32(&mut sb[40..44], crc);
        inner
            .file
            .seek(SeekFrom::Start(0))
            .and_then(|_| inner.file.write_all(&sb))
            .and_then(|_| inner.file.flush())
            .map_err(|e| self.io_err(&e))?;
        Ok(())
    }

    /// Flush, sync to disk, and mark the handle closed.
    ///
    /// Idempotent: each rank of a shared-file group calls this at finish.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Ok(());
        }
        self.flush_inner(&mut inner)?;
        inner.file.sync_all().map_err(|e| self.io_err(&e))?;
        inner.closed = true;
        Ok(())
    }
}

impl Drop for TableFile {
    fn drop(&mut self) {
        let mut inner = self.inner.lock();
        if !inner.closed {
            let _ = self.flush_inner(&mut inner);
            let _ = inner.file.sync_all();
            inner.closed = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::dtype::{Field, Scalar};
    use tempfile::tempdir;

    fn i64_dtype() -> Dtype {
        Dtype::scalar(Scalar::I64)
    }

    #[test]
    fn create_write_read_roundtrip() {
        let dir = tempdir().unwrap();
        let file = TableFile::create(dir.path().join("t.rfl")).unwrap();
        file.create_dataset("a/data", &i64_dtype(), 4).unwrap();
        file.extend_to("a/data", 10).unwrap();
        assert_eq!(file.row_count("a/data").unwrap(), 10);

        let values: Vec<i64> = (0..10).map(|v| v * 7).collect();
        file.write_rows("a/data", 0, &i64_dtype().pack_i64(&values))
            .unwrap();

        let back = file.read_rows("a/data", 3, 4).unwrap();
        let dtype = i64_dtype();
        let decoded: Vec<i64> = back
            .chunks(8)
            .map(|row| dtype.get_i64(row, "value", 0).unwrap())
            .collect();
        assert_eq!(decoded, vec![21, 28, 35, 42]);
    }

    #[test]
    fn new_rows_are_zero_filled() {
        let dir = tempdir().unwrap();
        let file = TableFile::create(dir.path().join("t.rfl")).unwrap();
        file.create_dataset("r", &ref_region_dtype(), 8).unwrap();
        file.extend_to("r", 5).unwrap();
        let bytes = file.read_rows("r", 0, 5).unwrap();
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn structured_rows_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.rfl");
        let dtype = Dtype::compound(vec![
            Field::scalar("id", Scalar::U32),
            Field::vector("pos", Scalar::F64, vec![2]),
        ]);
        {
            let file = TableFile::create(&path).unwrap();
            file.create_dataset("hits/data", &dtype, 16).unwrap();
            file.extend_to("hits/data", 2).unwrap();
            let mut row = dtype.zero_row();
            dtype.put_i64(&mut row, "id", 0, 42);
            dtype.put_f64(&mut row, "pos", 0, 1.5);
            dtype.put_f64(&mut row, "pos", 1, -2.5);
            file.write_rows("hits/data", 1, &row).unwrap();
            file.set_attr("hits", "classname", serde_json::json!("HitMaker"))
                .unwrap();
            file.close().unwrap();
        }
        let file = TableFile::open(&path).unwrap();
        assert_eq!(file.dtype("hits/data").unwrap(), dtype);
        let row = file.read_rows("hits/data", 1, 1).unwrap();
        assert_eq!(dtype.get_i64(&row, "id", 0), Some(42));
        assert_eq!(dtype.get_f64(&row, "pos", 1), Some(-2.5));
        assert_eq!(
            file.attrs("hits").get("classname"),
            Some(&serde_json::json!("HitMaker"))
        );
    }

    #[test]
    fn conflicting_recreate_is_rejected() {
        let dir = tempdir().unwrap();
        let file = TableFile::create(dir.path().join("t.rfl")).unwrap();
        file.create_dataset("a/data", &i64_dtype(), 4).unwrap();
        // same dtype is idempotent
        file.create_dataset("a/data", &i64_dtype(), 4).unwrap();
        let err = file
            .create_dataset("a/data", &Dtype::scalar(Scalar::F64), 4)
            .unwrap_err();
        assert_eq!(err.code(), "E301");
    }

    #[test]
    fn alias_shares_storage() {
        let dir = tempdir().unwrap();
        let file = TableFile::create(dir.path().join("t.rfl")).unwrap();
        file.create_dataset("a/ref/b/ref", &i64_dtype(), 4).unwrap();
        file.alias_dataset("b/ref/a/ref", "a/ref/b/ref").unwrap();
        file.extend_to("a/ref/b/ref", 3).unwrap();
        file.write_rows("a/ref/b/ref", 0, &i64_dtype().pack_i64(&[1, 2, 3]))
            .unwrap();
        assert_eq!(file.row_count("b/ref/a/ref").unwrap(), 3);
        let row = file.read_rows("b/ref/a/ref", 2, 1).unwrap();
        assert_eq!(i64_dtype().get_i64(&row, "value", 0), Some(3));
        assert!(file.is_alias("b/ref/a/ref"));
        assert!(!file.is_alias("a/ref/b/ref"));
    }

    #[test]
    fn delete_removes_subtree_and_aliases() {
        let dir = tempdir().unwrap();
        let file = TableFile::create(dir.path().join("t.rfl")).unwrap();
        file.create_dataset("tmp/work/data", &i64_dtype(), 4).unwrap();
        file.create_dataset("tmp/work/ref/keep/ref", &i64_dtype(), 4)
            .unwrap();
        file.alias_dataset("keep/ref/tmp/work/ref", "tmp/work/ref/keep/ref")
            .unwrap();
        file.create_dataset("keep/data", &i64_dtype(), 4).unwrap();
        file.set_attr("tmp/work", "note", serde_json::json!(1)).unwrap();

        file.delete("tmp/work").unwrap();
        assert!(!file.dataset_exists("tmp/work/data"));
        assert!(!file.dataset_exists("keep/ref/tmp/work/ref"));
        assert!(file.dataset_exists("keep/data"));
        assert!(file.attrs("tmp/work").is_empty());
    }

    #[test]
    fn widen_regions_unions_windows() {
        let dir = tempdir().unwrap();
        let file = TableFile::create(dir.path().join("t.rfl")).unwrap();
        file.create_dataset("a/ref/b/ref_region", &ref_region_dtype(), 8)
            .unwrap();
        file.extend_to("a/ref/b/ref_region", 3).unwrap();

        file.widen_regions("a/ref/b/ref_region", &[(1, 4, 6)]).unwrap();
        file.widen_regions("a/ref/b/ref_region", &[(1, 2, 5), (2, 0, 1)])
            .unwrap();

        let dtype = ref_region_dtype();
        let rows = file.read_rows("a/ref/b/ref_region", 0, 3).unwrap();
        let entry = |i: usize| {
            let row = &rows[i * 16..(i + 1) * 16];
            (
                dtype.get_i64(row, "start", 0).unwrap(),
                dtype.get_i64(row, "stop", 0).unwrap(),
            )
        };
        assert_eq!(entry(0), (0, 0)); // untouched rows stay null
        assert_eq!(entry(1), (2, 6));
        assert_eq!(entry(2), (0, 1));
    }

    #[test]
    fn corrupt_magic_is_detected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.rfl");
        std::fs::write(&path, vec![0u8; 128]).unwrap();
        let err = TableFile::open(&path).unwrap_err();
        assert_eq!(err.code(), "E305");
    }

    #[test]
    fn write_outside_extent_is_rejected() {
        let dir = tempdir().unwrap();
        let file = TableFile::create(dir.path().join("t.rfl")).unwrap();
        file.create_dataset("a/data", &i64_dtype(), 4).unwrap();
        file.extend_to("a/data", 2).unwrap();
        let err = file
            .write_rows("a/data", 1, &i64_dtype().pack_i64(&[1, 2]))
            .unwrap_err();
        assert_eq!(err.code(), "E202");
    }
}
