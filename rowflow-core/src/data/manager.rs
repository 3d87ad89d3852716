//! The data manager: sole owner and mutator of the container file.
//!
//! Every rank holds one `DataManager` wrapping the shared container and the
//! substrate communicator. Structural operations (dataset creation, row
//! reservation, reference writes, deletion, finish) are collective: all
//! ranks enter them together and apply idempotent updates, so the file
//! state converges no matter which rank executes first. Row writes inside a
//! reserved range are per-rank and uncoordinated.
//!
//! Layout conventions (one group per dataset path `G`):
//!
//! ```text
//! G/data                     one-dimensional row array
//! G/ref/H/ref                shared (parent, child) pair table
//! G/ref/H/ref_region         [start, stop) windows, one per row of G
//! H/ref/G/ref                alias of G/ref/H/ref
//! H/ref/G/ref_region         [start, stop) windows, one per row of H
//! ```

use super::deref::{
    dereference, dereference_chain, dereference_chain_indices, dereference_indices, ChainHop,
    DerefOptions, IndexRect, MaskedRect, Rect, RefDirection, RefSource, RegionSource, RowSource,
    Selection,
};
use crate::comm::Communicator;
use crate::error::{FlowError, Result};
use crate::store::{ref_dtype, ref_region_dtype, Dtype, TableFile, DEFAULT_CHUNK_ROWS};
use std::collections::HashMap;
use std::ops::Range;
use std::path::Path;
use std::sync::Arc;

fn norm(name: &str) -> String {
    name.trim_matches('/').to_string()
}

fn data_path(name: &str) -> String {
    format!("{}/data", norm(name))
}

fn ref_path(parent: &str, child: &str) -> String {
    format!("{}/ref/{}/ref", norm(parent), norm(child))
}

fn region_path(parent: &str, child: &str) -> String {
    format!("{}/ref/{}/ref_region", norm(parent), norm(child))
}

/// Lazy handle to a group's `data` array.
pub struct DsetHandle {
    file: Arc<TableFile>,
    name: String,
    path: String,
    dtype: Dtype,
}

impl DsetHandle {
    /// Group path this handle reads.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current row count (live; re-read from the catalog).
    pub fn rows(&self) -> u64 {
        self.file.row_count(&self.path).unwrap_or(0)
    }

    /// Storage chunk size in rows.
    pub fn chunk_rows(&self) -> u64 {
        self.file.chunk_rows(&self.path).unwrap_or(DEFAULT_CHUNK_ROWS)
    }

    /// Read a contiguous slice of rows.
    pub fn read(&self, range: Range<u64>) -> Result<Rect> {
        let n = range.end.saturating_sub(range.start);
        let buf = self.file.read_rows(&self.path, range.start, n)?;
        Ok(Rect::new(self.dtype.clone(), n as usize, buf))
    }
}

impl RowSource for DsetHandle {
    fn dtype(&self) -> Dtype {
        self.dtype.clone()
    }

    fn len(&self) -> u64 {
        self.rows()
    }

    fn read_rows_at(&self, indices: &[u64]) -> Result<Vec<u8>> {
        self.file.read_rows_at(&self.path, indices)
    }
}

/// Lazy handle to a shared reference table.
pub struct RefHandle {
    file: Arc<TableFile>,
    path: String,
    direction: RefDirection,
}

impl RefHandle {
    /// Direction to use when the requesting side is the source.
    ///
    /// `Forward` when the table is stored under the requesting parent,
    /// `Reverse` when the handle was obtained through the reciprocal path.
    pub fn direction(&self) -> RefDirection {
        self.direction
    }
}

impl RefSource for RefHandle {
    fn len(&self) -> u64 {
        self.file.row_count(&self.path).unwrap_or(0)
    }

    fn read_pairs(&self, range: Range<u64>) -> Result<Vec<(i64, i64)>> {
        let n = range.end.saturating_sub(range.start);
        let bytes = self.file.read_rows(&self.path, range.start, n)?;
        let dtype = ref_dtype();
        let size = dtype.row_size();
        Ok(bytes
            .chunks(size)
            .map(|row| {
                (
                    dtype.get_i64(row, "parent", 0).unwrap_or(0),
                    dtype.get_i64(row, "child", 0).unwrap_or(0),
                )
            })
            .collect())
    }
}

/// Lazy handle to one side's region index.
pub struct RegionHandle {
    file: Arc<TableFile>,
    path: String,
}

impl RegionSource for RegionHandle {
    fn len(&self) -> u64 {
        self.file.row_count(&self.path).unwrap_or(0)
    }

    fn read_regions(&self, rows: &[u64]) -> Result<Vec<(i64, i64)>> {
        let bytes = self.file.read_rows_at(&self.path, rows)?;
        let dtype = ref_region_dtype();
        let size = dtype.row_size();
        Ok(bytes
            .chunks(size)
            .map(|row| {
                (
                    dtype.get_i64(row, "start", 0).unwrap_or(0),
                    dtype.get_i64(row, "stop", 0).unwrap_or(0),
                )
            })
            .collect())
    }
}

/// Coordinates all access to the output container across ranks.
pub struct DataManager {
    file: Arc<TableFile>,
    comm: Arc<dyn Communicator>,
}

impl DataManager {
    /// Open (or create) the output container at `path`.
    pub fn open(path: impl AsRef<Path>, comm: Arc<dyn Communicator>) -> Result<Self> {
        let file = Arc::new(TableFile::open_or_create(path)?);
        Ok(Self { file, comm })
    }

    /// Wrap an already-open container; used when thread-ranks share one handle.
    pub fn with_file(file: Arc<TableFile>, comm: Arc<dyn Communicator>) -> Self {
        Self { file, comm }
    }

    /// The substrate communicator.
    pub fn comm(&self) -> &Arc<dyn Communicator> {
        &self.comm
    }

    /// This rank's index.
    pub fn rank(&self) -> usize {
        self.comm.rank()
    }

    /// Size of the rank group.
    pub fn size(&self) -> usize {
        self.comm.size()
    }

    /// Path of the container file.
    pub fn filepath(&self) -> &Path {
        self.file.path()
    }

    /// Direct access to the container; reserved for inspection tooling.
    pub fn file(&self) -> &Arc<TableFile> {
        &self.file
    }

    // ------------------------------------------------------------------
    // Datasets
    // ------------------------------------------------------------------

    /// Check whether a group's `data` array exists.
    pub fn dset_exists(&self, name: &str) -> bool {
        self.file.dataset_exists(&data_path(name))
    }

    /// Create a group's `data` array. Collective.
    ///
    /// A no-op when it already exists with the same dtype; conflicting
    /// re-creation fails on every rank.
    pub fn create_dset(&self, name: &str, dtype: &Dtype, chunk_rows: Option<u64>) -> Result<()> {
        self.file.create_dataset(
            &data_path(name),
            dtype,
            chunk_rows.unwrap_or(DEFAULT_CHUNK_ROWS),
        )?;
        self.comm.barrier()
    }

    /// Get a read handle for a group's `data` array.
    pub fn get_dset(&self, name: &str) -> Result<DsetHandle> {
        let path = data_path(name);
        if !self.file.dataset_exists(&path) {
            return Err(FlowError::NotFound { path });
        }
        Ok(DsetHandle {
            file: Arc::clone(&self.file),
            name: norm(name),
            dtype: self.file.dtype(&path)?,
            path,
        })
    }

    /// Reserve `n_local` rows at the end of a dataset. Collective.
    ///
    /// An exclusive prefix sum over the gathered per-rank counts assigns
    /// each rank a disjoint range; the dataset is extended by the total.
    /// Offsets are a deterministic function of rank order.
    pub fn reserve_rows(&self, name: &str, n_local: u64) -> Result<Range<u64>> {
        let path = data_path(name);
        let cur = self.file.row_count(&path)?;
        let counts = self.comm.all_gather_u64(n_local)?;
        let start = cur + counts[..self.comm.rank()].iter().sum::<u64>();
        let total: u64 = counts.iter().sum();
        self.file.extend_to(&path, cur + total)?;
        Ok(start..start + n_local)
    }

    /// Write encoded rows into a previously reserved range. Per-rank.
    pub fn write_data(&self, name: &str, start: u64, rows: &[u8]) -> Result<()> {
        self.file.write_rows(&data_path(name), start, rows)
    }

    /// Load a contiguous row slice.
    pub fn load_slice(&self, name: &str, range: Range<u64>) -> Result<Rect> {
        self.get_dset(name)?.read(range)
    }

    // ------------------------------------------------------------------
    // References
    // ------------------------------------------------------------------

    /// Check whether references between two groups exist (either side).
    pub fn ref_exists(&self, parent: &str, child: &str) -> bool {
        self.file.dataset_exists(&ref_path(parent, child))
    }

    /// Create the shared ref table and both region indices. Collective.
    ///
    /// Idempotent; called lazily by [`DataManager::write_ref`].
    pub fn create_ref(&self, parent: &str, child: &str) -> Result<()> {
        for side in [parent, child] {
            if !self.dset_exists(side) {
                return Err(FlowError::NotFound {
                    path: data_path(side),
                });
            }
        }
        let canonical = ref_path(parent, child);
        if !self.file.dataset_exists(&canonical) {
            self.file.create_dataset(&canonical, &ref_dtype(), DEFAULT_CHUNK_ROWS)?;
            self.file.alias_dataset(&ref_path(child, parent), &canonical)?;
        }
        self.file.create_dataset(
            &region_path(parent, child),
            &ref_region_dtype(),
            DEFAULT_CHUNK_ROWS,
        )?;
        self.file.create_dataset(
            &region_path(child, parent),
            &ref_region_dtype(),
            DEFAULT_CHUNK_ROWS,
        )?;
        self.comm.barrier()
    }

    /// Get a handle to the shared ref table as seen from `parent`.
    ///
    /// The returned direction is `Forward` when `parent` is the stored
    /// parent side and `Reverse` when the reciprocal path was used.
    pub fn get_ref(&self, parent: &str, child: &str) -> Result<RefHandle> {
        let path = ref_path(parent, child);
        if !self.file.dataset_exists(&path) {
            return Err(FlowError::NotFound { path });
        }
        let actual = self.file.dtype(&path)?;
        if actual != ref_dtype() {
            return Err(FlowError::TypeMismatch {
                path,
                expected: ref_dtype().describe(),
                actual: actual.describe(),
            });
        }
        let direction = if self.file.is_alias(&path) {
            RefDirection::Reverse
        } else {
            RefDirection::Forward
        };
        Ok(RefHandle {
            file: Arc::clone(&self.file),
            path,
            direction,
        })
    }

    /// Get a handle to `parent`'s region index over the shared ref table.
    pub fn get_ref_region(&self, parent: &str, child: &str) -> Result<RegionHandle> {
        let path = region_path(parent, child);
        if !self.file.dataset_exists(&path) {
            return Err(FlowError::NotFound { path });
        }
        Ok(RegionHandle {
            file: Arc::clone(&self.file),
            path,
        })
    }

    /// Append `(parent_row, child_row)` pairs and maintain both region
    /// indices. Collective.
    ///
    /// Region entries touched by several ranks converge by widening to the
    /// union window, which stays a superset of the true match set.
    pub fn write_ref(&self, parent: &str, child: &str, pairs: &[(u64, u64)]) -> Result<()> {
        self.create_ref(parent, child)?;
        let path = ref_path(parent, child);
        let forward = !self.file.is_alias(&path);

        let cur = self.file.row_count(&path)?;
        let counts = self.comm.all_gather_u64(pairs.len() as u64)?;
        let start = cur + counts[..self.comm.rank()].iter().sum::<u64>();
        let total: u64 = counts.iter().sum();
        self.file.extend_to(&path, cur + total)?;

        let dtype = ref_dtype();
        let size = dtype.row_size();
        let mut buf = vec![0u8; pairs.len() * size];
        for (i, &(p, c)) in pairs.iter().enumerate() {
            let row = &mut buf[i * size..(i + 1) * size];
            let (stored_parent, stored_child) = if forward { (p, c) } else { (c, p) };
            dtype.put_i64(row, "parent", 0, stored_parent as i64);
            dtype.put_i64(row, "child", 0, stored_child as i64);
        }
        self.file.write_rows(&path, start, &buf)?;

        // Region indices track their own side's data population.
        let parent_rows = self.file.row_count(&data_path(parent))?;
        let child_rows = self.file.row_count(&data_path(child))?;
        self.file.extend_to(&region_path(parent, child), parent_rows)?;
        self.file.extend_to(&region_path(child, parent), child_rows)?;

        let window = |keyed: &dyn Fn(&(u64, u64)) -> u64| -> Vec<(u64, i64, i64)> {
            let mut spans: HashMap<u64, (i64, i64)> = HashMap::new();
            for (i, pair) in pairs.iter().enumerate() {
                let pos = (start + i as u64) as i64;
                let entry = spans.entry(keyed(pair)).or_insert((pos, pos + 1));
                entry.0 = entry.0.min(pos);
                entry.1 = entry.1.max(pos + 1);
            }
            let mut updates: Vec<(u64, i64, i64)> =
                spans.into_iter().map(|(row, (lo, hi))| (row, lo, hi)).collect();
            updates.sort_unstable();
            updates
        };
        self.file
            .widen_regions(&region_path(parent, child), &window(&|p| p.0))?;
        self.file
            .widen_regions(&region_path(child, parent), &window(&|p| p.1))?;

        self.comm.barrier()
    }

    // ------------------------------------------------------------------
    // Joins
    // ------------------------------------------------------------------

    fn hop_region(&self, parent: &str, child: &str) -> Result<RegionHandle> {
        let region = self.get_ref_region(parent, child)?;
        let population = self.file.row_count(&data_path(parent))?;
        if region.len() != population {
            return Err(FlowError::ShapeMismatch {
                what: format!("region index {}", region_path(parent, child)),
                expected: population,
                actual: region.len(),
            });
        }
        Ok(region)
    }

    fn check_selection(&self, name: &str, sel: &Range<u64>) -> Result<()> {
        let rows = self.file.row_count(&data_path(name))?;
        if sel.end > rows {
            return Err(FlowError::InvalidSelection {
                index: sel.end as i64 - 1,
                len: rows,
            });
        }
        Ok(())
    }

    /// One-hop masked join: rows of `child` referenced by `sel` in `parent`.
    pub fn deref_range(&self, sel: Range<u64>, parent: &str, child: &str) -> Result<MaskedRect> {
        self.check_selection(parent, &sel)?;
        let refs = self.get_ref(parent, child)?;
        let region = self.hop_region(parent, child)?;
        let target = self.get_dset(child)?;
        let opts = DerefOptions {
            region: Some(&region),
            direction: refs.direction(),
            mask: None,
        };
        dereference(Selection::Range(sel), &refs, &target, &opts)
    }

    /// One-hop join returning child indices only.
    pub fn deref_range_indices(
        &self,
        sel: Range<u64>,
        parent: &str,
        child: &str,
    ) -> Result<IndexRect> {
        self.check_selection(parent, &sel)?;
        let refs = self.get_ref(parent, child)?;
        let region = self.hop_region(parent, child)?;
        let opts = DerefOptions {
            region: Some(&region),
            direction: refs.direction(),
            mask: None,
        };
        dereference_indices(Selection::Range(sel), &refs, &opts)
    }

    /// Multi-hop masked join along `chain` of `(parent, child)` edges.
    pub fn deref_chain_range(
        &self,
        sel: Range<u64>,
        chain: &[(String, String)],
    ) -> Result<MaskedRect> {
        let (refs, regions) = self.chain_handles(&sel, chain)?;
        let hops: Vec<ChainHop<'_>> = refs
            .iter()
            .zip(&regions)
            .map(|(r, g)| ChainHop {
                refs: r,
                region: Some(g),
                direction: r.direction(),
            })
            .collect();
        let target = self.get_dset(&chain.last().expect("non-empty chain").1)?;
        dereference_chain(Selection::Range(sel), &hops, &target, None)
    }

    /// Multi-hop join returning final-table indices only.
    pub fn deref_chain_range_indices(
        &self,
        sel: Range<u64>,
        chain: &[(String, String)],
    ) -> Result<IndexRect> {
        let (refs, regions) = self.chain_handles(&sel, chain)?;
        let hops: Vec<ChainHop<'_>> = refs
            .iter()
            .zip(&regions)
            .map(|(r, g)| ChainHop {
                refs: r,
                region: Some(g),
                direction: r.direction(),
            })
            .collect();
        dereference_chain_indices(Selection::Range(sel), &hops, None)
    }

    fn chain_handles(
        &self,
        sel: &Range<u64>,
        chain: &[(String, String)],
    ) -> Result<(Vec<RefHandle>, Vec<RegionHandle>)> {
        if chain.is_empty() {
            return Err(FlowError::ConfigValue {
                field: "chain".to_string(),
                cause: "dereference chain must have at least one hop".to_string(),
            });
        }
        self.check_selection(&chain[0].0, sel)?;
        let mut refs = Vec::with_capacity(chain.len());
        let mut regions = Vec::with_capacity(chain.len());
        for (parent, child) in chain {
            refs.push(self.get_ref(parent, child)?);
            regions.push(self.hop_region(parent, child)?);
        }
        Ok((refs, regions))
    }

    // ------------------------------------------------------------------
    // Attributes, deletion, lifecycle
    // ------------------------------------------------------------------

    /// Set attributes on a group.
    pub fn set_attrs<I>(&self, name: &str, attrs: I) -> Result<()>
    where
        I: IntoIterator<Item = (String, serde_json::Value)>,
    {
        let group = norm(name);
        for (key, value) in attrs {
            self.file.set_attr(&group, &key, value)?;
        }
        Ok(())
    }

    /// Attributes of a group; empty if none were set.
    pub fn get_attrs(&self, name: &str) -> std::collections::BTreeMap<String, serde_json::Value> {
        self.file.attrs(&norm(name))
    }

    /// Remove a group subtree. Collective.
    pub fn delete(&self, name: &str) -> Result<()> {
        self.file.delete(&norm(name))?;
        self.comm.barrier()
    }

    /// Flush catalog and superblock to disk.
    pub fn flush(&self) -> Result<()> {
        self.file.flush()
    }

    /// Apply the drop list, flush, and close. Collective.
    pub fn finish(&self, drop_list: &[String]) -> Result<()> {
        self.comm.barrier()?;
        for name in drop_list {
            self.file.delete(&norm(name))?;
        }
        self.comm.barrier()?;
        self.file.close()
    }

    /// Close the file without collectives. Abort path only.
    ///
    /// The output is left in whatever state the last successful collective
    /// produced; there is no rollback.
    pub fn abort_close(&self) -> Result<()> {
        self.file.close()
    }
}
