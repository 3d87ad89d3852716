//! Two-level dereferencing engine.
//!
//! Given a selection over one side of a reference table, the engine
//! materializes the matching rows of a target table as a rectangular masked
//! array: one row per selector, one column per match slot, with unused
//! slots masked. An optional region index restricts the reference read to
//! the union of the selectors' `[start, stop)` windows, turning an `O(L)`
//! scan of the reference table into `O(n·w)`.
//!
//! The engine is written against three small source traits so it runs the
//! same way over container-file handles and in-memory arrays. Region
//! windows are supersets of the true match set; the engine always
//! re-filters by equality.

use crate::error::{FlowError, Result};
use crate::store::Dtype;
use std::collections::HashMap;
use std::ops::Range;

/// A reference table: `(parent, child)` row-index pairs.
pub trait RefSource {
    /// Number of stored pairs.
    fn len(&self) -> u64;

    /// Whether the table holds no pairs.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read a contiguous run of pairs in storage order.
    fn read_pairs(&self, range: Range<u64>) -> Result<Vec<(i64, i64)>>;
}

/// A table whose rows can be gathered by absolute index.
pub trait RowSource {
    /// Row type of the table.
    fn dtype(&self) -> Dtype;

    /// Number of rows.
    fn len(&self) -> u64;

    /// Whether the table holds no rows.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Gather rows by absolute index into one contiguous buffer.
    fn read_rows_at(&self, indices: &[u64]) -> Result<Vec<u8>>;
}

/// A region index aligned with one side of a reference table.
pub trait RegionSource {
    /// Number of entries (the source-side population).
    fn len(&self) -> u64;

    /// Whether the index holds no entries.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read `[start, stop)` windows for the given source rows.
    fn read_regions(&self, rows: &[u64]) -> Result<Vec<(i64, i64)>>;
}

/// Which reference column is matched against the selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefDirection {
    /// Column 0 is the source side, column 1 indexes the target.
    Forward,
    /// Column 1 is the source side, column 0 indexes the target.
    Reverse,
}

impl RefDirection {
    /// The source-side value of a stored pair.
    pub fn src(&self, pair: (i64, i64)) -> i64 {
        match self {
            Self::Forward => pair.0,
            Self::Reverse => pair.1,
        }
    }

    /// The target-side value of a stored pair.
    pub fn dst(&self, pair: (i64, i64)) -> i64 {
        match self {
            Self::Forward => pair.1,
            Self::Reverse => pair.0,
        }
    }

    /// The opposite direction.
    pub fn flipped(&self) -> Self {
        match self {
            Self::Forward => Self::Reverse,
            Self::Reverse => Self::Forward,
        }
    }
}

/// A selection over the source side of a reference.
#[derive(Debug, Clone)]
pub enum Selection<'a> {
    /// A contiguous half-open row range.
    Range(Range<u64>),
    /// Explicit row indices.
    Indices(&'a [u64]),
}

impl Selection<'_> {
    /// Number of selectors.
    pub fn len(&self) -> usize {
        match self {
            Self::Range(r) => (r.end.saturating_sub(r.start)) as usize,
            Self::Indices(idx) => idx.len(),
        }
    }

    /// Whether the selection is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn to_indices(&self) -> Vec<u64> {
        match self {
            Self::Range(r) => (r.start..r.end).collect(),
            Self::Indices(idx) => idx.to_vec(),
        }
    }
}

impl From<Range<u64>> for Selection<'_> {
    fn from(r: Range<u64>) -> Self {
        Self::Range(r)
    }
}

impl<'a> From<&'a [u64]> for Selection<'a> {
    fn from(idx: &'a [u64]) -> Self {
        Self::Indices(idx)
    }
}

/// Options for a single dereference hop.
pub struct DerefOptions<'a> {
    /// Region index aligned with the source side; enables windowed reads.
    pub region: Option<&'a dyn RegionSource>,
    /// Which reference column is the source side.
    pub direction: RefDirection,
    /// Per-selector skip mask (`true` = skip); ORed into the result mask.
    pub mask: Option<&'a [bool]>,
}

impl Default for DerefOptions<'_> {
    fn default() -> Self {
        Self {
            region: None,
            direction: RefDirection::Forward,
            mask: None,
        }
    }
}

/// One hop of a dereference chain.
pub struct ChainHop<'a> {
    /// The reference table crossed by this hop.
    pub refs: &'a dyn RefSource,
    /// Optional region index for the hop's source side.
    pub region: Option<&'a dyn RegionSource>,
    /// Which reference column is the hop's source side.
    pub direction: RefDirection,
}

// ---------------------------------------------------------------------------
// Result shapes
// ---------------------------------------------------------------------------

/// A plain contiguous run of rows, e.g. a loaded source slice.
#[derive(Debug, Clone)]
pub struct Rect {
    dtype: Dtype,
    len: usize,
    buf: Vec<u8>,
}

impl Rect {
    /// Wrap encoded rows in a rect.
    pub fn new(dtype: Dtype, len: usize, buf: Vec<u8>) -> Self {
        debug_assert_eq!(buf.len(), len * dtype.row_size());
        Self { dtype, len, buf }
    }

    /// Row type.
    pub fn dtype(&self) -> &Dtype {
        &self.dtype
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the rect holds no rows.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Encoded bytes of row `i`.
    pub fn row(&self, i: usize) -> &[u8] {
        let size = self.dtype.row_size();
        &self.buf[i * size..(i + 1) * size]
    }

    /// Integer field access for row `i`.
    pub fn get_i64(&self, i: usize, field: &str) -> Option<i64> {
        self.dtype.get_i64(self.row(i), field, 0)
    }

    /// Float field access for row `i`.
    pub fn get_f64(&self, i: usize, field: &str) -> Option<f64> {
        self.dtype.get_f64(self.row(i), field, 0)
    }
}

/// A rectangular masked array of rows.
///
/// `shape[0]` is the selection length; further axes are match slots, one
/// per chain hop. `mask[i] == true` marks slot `i` unused. Slot widths are
/// call-local: they are the maximum group size observed in that call and
/// are not stable across calls.
#[derive(Debug, Clone)]
pub struct MaskedRect {
    dtype: Dtype,
    shape: Vec<usize>,
    buf: Vec<u8>,
    mask: Vec<bool>,
}

impl MaskedRect {
    fn from_parts(dtype: Dtype, shape: Vec<usize>, buf: Vec<u8>, mask: Vec<bool>) -> Self {
        debug_assert_eq!(mask.len() * dtype.row_size(), buf.len());
        Self {
            dtype,
            shape,
            buf,
            mask,
        }
    }

    /// A fully masked `(rows, 0)` rect, used when no references exist yet.
    pub fn empty(dtype: Dtype, rows: usize) -> Self {
        Self {
            dtype,
            shape: vec![rows, 0],
            buf: Vec::new(),
            mask: Vec::new(),
        }
    }

    /// Row type of the stored slots.
    pub fn dtype(&self) -> &Dtype {
        &self.dtype
    }

    /// Full shape; `shape()[0]` matches the selection length.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Number of selectors (first axis).
    pub fn rows(&self) -> usize {
        self.shape[0]
    }

    /// Match-slot count of a two-axis rect.
    pub fn cols(&self) -> usize {
        debug_assert_eq!(self.shape.len(), 2);
        self.shape[1]
    }

    /// Total number of slots.
    pub fn flat_len(&self) -> usize {
        self.mask.len()
    }

    /// The boolean mask, flat in row-major order.
    pub fn mask(&self) -> &[bool] {
        &self.mask
    }

    fn flat(&self, i: usize, j: usize) -> usize {
        i * self.shape[1..].iter().product::<usize>() + j
    }

    /// Whether slot `(i, j)` of a two-axis rect is masked.
    pub fn masked(&self, i: usize, j: usize) -> bool {
        self.mask[self.flat(i, j)]
    }

    /// Encoded bytes of slot `(i, j)`, `None` when masked.
    pub fn row(&self, i: usize, j: usize) -> Option<&[u8]> {
        let flat = self.flat(i, j);
        if self.mask[flat] {
            return None;
        }
        let size = self.dtype.row_size();
        Some(&self.buf[flat * size..(flat + 1) * size])
    }

    /// Integer field access for slot `(i, j)`.
    pub fn get_i64(&self, i: usize, j: usize, field: &str) -> Option<i64> {
        self.row(i, j).and_then(|r| self.dtype.get_i64(r, field, 0))
    }

    /// Float field access for slot `(i, j)`.
    pub fn get_f64(&self, i: usize, j: usize, field: &str) -> Option<f64> {
        self.row(i, j).and_then(|r| self.dtype.get_f64(r, field, 0))
    }

    /// Number of unmasked slots.
    pub fn count_unmasked(&self) -> usize {
        self.mask.iter().filter(|m| !**m).count()
    }

    /// Masked equality: same shape, same mask, same unmasked bytes.
    pub fn masked_eq(&self, other: &Self) -> bool {
        if self.shape != other.shape || self.mask != other.mask {
            return false;
        }
        let size = self.dtype.row_size();
        self.mask.iter().enumerate().all(|(flat, masked)| {
            *masked
                || self.buf[flat * size..(flat + 1) * size]
                    == other.buf[flat * size..(flat + 1) * size]
        })
    }
}

/// A rectangular masked array of target indices.
#[derive(Debug, Clone)]
pub struct IndexRect {
    shape: Vec<usize>,
    idx: Vec<u64>,
    mask: Vec<bool>,
}

impl IndexRect {
    /// An unmasked `(n, 1)` rect holding the range itself.
    ///
    /// Used for index-only requirements that resolve 1:1 with the source.
    pub fn from_range(range: Range<u64>) -> Self {
        let idx: Vec<u64> = (range.start..range.end).collect();
        let n = idx.len();
        Self {
            shape: vec![n, 1],
            idx,
            mask: vec![false; n],
        }
    }

    /// Full shape; `shape()[0]` matches the selection length.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Number of selectors (first axis).
    pub fn rows(&self) -> usize {
        self.shape[0]
    }

    /// The boolean mask, flat in row-major order.
    pub fn mask(&self) -> &[bool] {
        &self.mask
    }

    /// Total number of slots.
    pub fn flat_len(&self) -> usize {
        self.mask.len()
    }

    fn flat(&self, i: usize, j: usize) -> usize {
        i * self.shape[1..].iter().product::<usize>() + j
    }

    /// Target index at slot `(i, j)` of a two-axis rect, `None` when masked.
    pub fn get(&self, i: usize, j: usize) -> Option<u64> {
        let flat = self.flat(i, j);
        (!self.mask[flat]).then(|| self.idx[flat])
    }

    /// All unmasked indices of selector `i`, in slot order.
    pub fn row_indices(&self, i: usize) -> Vec<u64> {
        let width = self.shape[1..].iter().product::<usize>();
        (0..width)
            .filter_map(|j| {
                let flat = i * width + j;
                (!self.mask[flat]).then(|| self.idx[flat])
            })
            .collect()
    }

    /// Unmasked `(slot, index)` pairs, flat in row-major order.
    pub fn unmasked(&self) -> Vec<(usize, u64)> {
        self.idx
            .iter()
            .zip(&self.mask)
            .enumerate()
            .filter_map(|(flat, (&idx, &masked))| (!masked).then_some((flat, idx)))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Merge `[start, stop)` windows into disjoint sorted runs.
fn merge_windows(mut windows: Vec<(u64, u64)>) -> Vec<Range<u64>> {
    windows.retain(|(lo, hi)| lo < hi);
    windows.sort_unstable();
    let mut merged: Vec<Range<u64>> = Vec::new();
    for (lo, hi) in windows {
        match merged.last_mut() {
            Some(last) if lo <= last.end => last.end = last.end.max(hi),
            _ => merged.push(lo..hi),
        }
    }
    merged
}

/// Collect, per selector, the target-side indices its references point at.
fn gather_groups(
    sel: &[u64],
    refs: &dyn RefSource,
    region: Option<&dyn RegionSource>,
    direction: RefDirection,
    skip: Option<&[bool]>,
) -> Result<Vec<Vec<u64>>> {
    if let Some(skip) = skip {
        if skip.len() != sel.len() {
            return Err(FlowError::ShapeMismatch {
                what: "input mask".to_string(),
                expected: sel.len() as u64,
                actual: skip.len() as u64,
            });
        }
    }
    let skipped = |i: usize| skip.map(|s| s[i]).unwrap_or(false);
    let active: Vec<u64> = sel
        .iter()
        .enumerate()
        .filter(|(i, _)| !skipped(*i))
        .map(|(_, &s)| s)
        .collect();

    let windows = match region {
        Some(region) => {
            for &s in &active {
                if s >= region.len() {
                    return Err(FlowError::InvalidSelection {
                        index: s as i64,
                        len: region.len(),
                    });
                }
            }
            let entries = region.read_regions(&active)?;
            let ref_len = refs.len();
            merge_windows(
                entries
                    .into_iter()
                    .filter(|(start, stop)| !(*start == 0 && *stop == 0))
                    .map(|(start, stop)| {
                        (start.max(0) as u64, (stop.max(0) as u64).min(ref_len))
                    })
                    .collect(),
            )
        }
        None => vec![0..refs.len()],
    };

    let mut by_src: HashMap<i64, Vec<u64>> = HashMap::new();
    for window in windows {
        for pair in refs.read_pairs(window)? {
            let dst = direction.dst(pair);
            if dst < 0 {
                continue;
            }
            by_src.entry(direction.src(pair)).or_default().push(dst as u64);
        }
    }

    Ok(sel
        .iter()
        .enumerate()
        .map(|(i, &s)| {
            if skipped(i) {
                Vec::new()
            } else {
                by_src.get(&(s as i64)).cloned().unwrap_or_default()
            }
        })
        .collect())
}

fn fill_index_rect(sel_len: usize, groups: Vec<Vec<u64>>, skip: Option<&[bool]>) -> IndexRect {
    let k = groups.iter().map(Vec::len).max().unwrap_or(0);
    let mut idx = vec![0u64; sel_len * k];
    let mut mask = vec![true; sel_len * k];
    for (i, group) in groups.into_iter().enumerate() {
        if skip.map(|s| s[i]).unwrap_or(false) {
            continue;
        }
        for (j, target) in group.into_iter().enumerate() {
            idx[i * k + j] = target;
            mask[i * k + j] = false;
        }
    }
    IndexRect {
        shape: vec![sel_len, k],
        idx,
        mask,
    }
}

/// Resolve a selection to target indices without touching the target table.
pub fn dereference_indices(
    sel: Selection<'_>,
    refs: &dyn RefSource,
    opts: &DerefOptions<'_>,
) -> Result<IndexRect> {
    let sel_idx = sel.to_indices();
    let groups = gather_groups(&sel_idx, refs, opts.region, opts.direction, opts.mask)?;
    Ok(fill_index_rect(sel_idx.len(), groups, opts.mask))
}

/// Gather the target rows behind an index rect with one bulk read.
fn gather_rows(indices: &IndexRect, target: &dyn RowSource) -> Result<MaskedRect> {
    let dtype = target.dtype();
    let size = dtype.row_size();
    let unmasked = indices.unmasked();
    let flat_targets: Vec<u64> = unmasked.iter().map(|(_, idx)| *idx).collect();
    let rows = target.read_rows_at(&flat_targets)?;

    let mut buf = vec![0u8; indices.flat_len() * size];
    for (read_pos, (flat, _)) in unmasked.iter().enumerate() {
        buf[flat * size..(flat + 1) * size]
            .copy_from_slice(&rows[read_pos * size..(read_pos + 1) * size]);
    }
    Ok(MaskedRect::from_parts(
        dtype,
        indices.shape.clone(),
        buf,
        indices.mask.clone(),
    ))
}

/// Materialize the masked join of `sel` through `refs` into `target`.
pub fn dereference(
    sel: Selection<'_>,
    refs: &dyn RefSource,
    target: &dyn RowSource,
    opts: &DerefOptions<'_>,
) -> Result<MaskedRect> {
    let indices = dereference_indices(sel, refs, opts)?;
    gather_rows(&indices, target)
}

/// Compose single hops into a chained index rect.
///
/// The result of each hop is flattened, its mask carried into the next hop
/// as the input mask; the final shape accumulates one axis per hop.
pub fn dereference_chain_indices(
    sel: Selection<'_>,
    hops: &[ChainHop<'_>],
    input_mask: Option<&[bool]>,
) -> Result<IndexRect> {
    let mut flat: Vec<u64> = sel.to_indices();
    let n = flat.len();
    let mut mask: Vec<bool> = match input_mask {
        Some(m) => {
            if m.len() != n {
                return Err(FlowError::ShapeMismatch {
                    what: "input mask".to_string(),
                    expected: n as u64,
                    actual: m.len() as u64,
                });
            }
            m.to_vec()
        }
        None => vec![false; n],
    };
    let mut shape = vec![n];

    for hop in hops {
        let groups = gather_groups(&flat, hop.refs, hop.region, hop.direction, Some(&mask))?;
        let k = groups.iter().map(Vec::len).max().unwrap_or(0);
        let mut next_flat = vec![0u64; flat.len() * k];
        let mut next_mask = vec![true; flat.len() * k];
        for (i, group) in groups.into_iter().enumerate() {
            for (j, target) in group.into_iter().enumerate() {
                next_flat[i * k + j] = target;
                next_mask[i * k + j] = false;
            }
        }
        flat = next_flat;
        mask = next_mask;
        shape.push(k);
    }

    Ok(IndexRect {
        shape,
        idx: flat,
        mask,
    })
}

/// Materialize a chained masked join into `target`.
pub fn dereference_chain(
    sel: Selection<'_>,
    hops: &[ChainHop<'_>],
    target: &dyn RowSource,
    input_mask: Option<&[bool]>,
) -> Result<MaskedRect> {
    let indices = dereference_chain_indices(sel, hops, input_mask)?;
    gather_rows(&indices, target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Scalar;
    use std::cell::RefCell;

    struct MemRefs {
        pairs: Vec<(i64, i64)>,
        touched: RefCell<Vec<Range<u64>>>,
    }

    impl MemRefs {
        fn new(pairs: Vec<(i64, i64)>) -> Self {
            Self {
                pairs,
                touched: RefCell::new(Vec::new()),
            }
        }
    }

    impl RefSource for MemRefs {
        fn len(&self) -> u64 {
            self.pairs.len() as u64
        }

        fn read_pairs(&self, range: Range<u64>) -> Result<Vec<(i64, i64)>> {
            self.touched.borrow_mut().push(range.clone());
            Ok(self.pairs[range.start as usize..range.end as usize].to_vec())
        }
    }

    struct MemRows {
        dtype: Dtype,
        buf: Vec<u8>,
    }

    impl MemRows {
        fn f64s(values: &[f64]) -> Self {
            let dtype = Dtype::scalar(Scalar::F64);
            Self {
                buf: dtype.pack_f64(values),
                dtype,
            }
        }

        fn i64s(values: &[i64]) -> Self {
            let dtype = Dtype::scalar(Scalar::I64);
            Self {
                buf: dtype.pack_i64(values),
                dtype,
            }
        }
    }

    impl RowSource for MemRows {
        fn dtype(&self) -> Dtype {
            self.dtype.clone()
        }

        fn len(&self) -> u64 {
            (self.buf.len() / self.dtype.row_size()) as u64
        }

        fn read_rows_at(&self, indices: &[u64]) -> Result<Vec<u8>> {
            let size = self.dtype.row_size();
            let mut out = Vec::with_capacity(indices.len() * size);
            for &idx in indices {
                if idx >= self.len() {
                    return Err(FlowError::InvalidSelection {
                        index: idx as i64,
                        len: self.len(),
                    });
                }
                out.extend_from_slice(&self.buf[idx as usize * size..(idx as usize + 1) * size]);
            }
            Ok(out)
        }
    }

    struct MemRegions(Vec<(i64, i64)>);

    impl RegionSource for MemRegions {
        fn len(&self) -> u64 {
            self.0.len() as u64
        }

        fn read_regions(&self, rows: &[u64]) -> Result<Vec<(i64, i64)>> {
            rows.iter()
                .map(|&r| {
                    self.0
                        .get(r as usize)
                        .copied()
                        .ok_or(FlowError::InvalidSelection {
                            index: r as i64,
                            len: self.len(),
                        })
                })
                .collect()
        }
    }

    fn scenario_refs() -> MemRefs {
        MemRefs::new(vec![(0, 1), (1, 2)])
    }

    #[test]
    fn basic_join() {
        // Scenario A: /A has 3 rows, /B has 4, ref pairs (0,1) and (1,2).
        let refs = scenario_refs();
        let b = MemRows::f64s(&[1.0, 2.0, 3.0, 4.0]);
        let rect = dereference(
            Selection::Range(0..3),
            &refs,
            &b,
            &DerefOptions::default(),
        )
        .unwrap();
        assert_eq!(rect.shape(), &[3, 1]);
        assert_eq!(rect.get_f64(0, 0, "value"), Some(2.0));
        assert_eq!(rect.get_f64(1, 0, "value"), Some(3.0));
        assert!(rect.masked(2, 0));
        assert_eq!(rect.count_unmasked(), 2);
    }

    #[test]
    fn region_restricts_reference_reads() {
        // Scenario B: same result, but only rows [0, 2) of ref are touched.
        let refs = scenario_refs();
        let b = MemRows::f64s(&[1.0, 2.0, 3.0, 4.0]);
        let region = MemRegions(vec![(0, 1), (1, 2), (0, 0)]);
        let opts = DerefOptions {
            region: Some(&region),
            ..Default::default()
        };
        let rect = dereference(Selection::Range(0..3), &refs, &b, &opts).unwrap();
        assert_eq!(rect.shape(), &[3, 1]);
        assert_eq!(rect.get_f64(0, 0, "value"), Some(2.0));
        assert_eq!(rect.get_f64(1, 0, "value"), Some(3.0));
        assert!(rect.masked(2, 0));
        for touched in refs.touched.borrow().iter() {
            assert!(touched.end <= 2, "read {:?}", touched);
        }
    }

    #[test]
    fn region_and_full_scan_agree() {
        // Property 3 on a denser table.
        let pairs: Vec<(i64, i64)> = (0..40).map(|p| (p % 5, (p * 3) % 7)).collect();
        let mut region = vec![(0i64, 0i64); 5];
        for (pos, pair) in pairs.iter().enumerate() {
            let (start, stop) = &mut region[pair.0 as usize];
            if *start == 0 && *stop == 0 {
                *start = pos as i64;
                *stop = pos as i64 + 1;
            } else {
                *start = (*start).min(pos as i64);
                *stop = (*stop).max(pos as i64 + 1);
            }
        }
        let refs = MemRefs::new(pairs);
        let target = MemRows::i64s(&(0..7).map(|v| v * 11).collect::<Vec<_>>());
        let region = MemRegions(region);

        let plain = dereference(
            Selection::Range(0..5),
            &refs,
            &target,
            &DerefOptions::default(),
        )
        .unwrap();
        let opts = DerefOptions {
            region: Some(&region),
            ..Default::default()
        };
        let windowed = dereference(Selection::Range(0..5), &refs, &target, &opts).unwrap();
        assert!(plain.masked_eq(&windowed));
    }

    #[test]
    fn reverse_direction() {
        // Scenario C: selecting /B rows and walking the reference backwards.
        let refs = scenario_refs();
        let a = MemRows::i64s(&[10, 20, 30]);
        let opts = DerefOptions {
            direction: RefDirection::Reverse,
            ..Default::default()
        };
        let rect = dereference(Selection::Range(0..4), &refs, &a, &opts).unwrap();
        assert_eq!(rect.shape(), &[4, 1]);
        assert!(rect.masked(0, 0));
        assert_eq!(rect.get_i64(1, 0, "value"), Some(10));
        assert_eq!(rect.get_i64(2, 0, "value"), Some(20));
        assert!(rect.masked(3, 0));
    }

    #[test]
    fn direction_symmetry() {
        // Property 4: walking forward then backward recovers the parents.
        let refs = MemRefs::new(vec![(0, 2), (1, 2), (2, 0)]);
        let forward = dereference_indices(
            Selection::Range(0..3),
            &refs,
            &DerefOptions::default(),
        )
        .unwrap();
        let mut matched: Vec<u64> = (0..3).flat_map(|i| forward.row_indices(i)).collect();
        matched.sort_unstable();
        matched.dedup();

        let opts = DerefOptions {
            direction: RefDirection::Reverse,
            ..Default::default()
        };
        let back =
            dereference_indices(Selection::Indices(&matched), &refs, &opts).unwrap();
        let mut parents: Vec<u64> = (0..matched.len())
            .flat_map(|i| back.row_indices(i))
            .collect();
        parents.sort_unstable();
        parents.dedup();
        assert_eq!(parents, vec![0, 1, 2]);
    }

    #[test]
    fn input_mask_skips_and_propagates() {
        let refs = scenario_refs();
        let b = MemRows::f64s(&[1.0, 2.0, 3.0, 4.0]);
        let mask = [false, true, false];
        let opts = DerefOptions {
            mask: Some(&mask),
            ..Default::default()
        };
        let rect = dereference(Selection::Range(0..3), &refs, &b, &opts).unwrap();
        assert_eq!(rect.get_f64(0, 0, "value"), Some(2.0));
        assert!(rect.masked(1, 0)); // skipped selector comes back masked
        assert!(rect.masked(2, 0));
    }

    #[test]
    fn slot_width_is_call_local() {
        let refs = MemRefs::new(vec![(0, 0), (0, 1), (0, 2), (1, 3)]);
        let target = MemRows::i64s(&[0, 1, 2, 3]);
        let wide = dereference(
            Selection::Range(0..2),
            &refs,
            &target,
            &DerefOptions::default(),
        )
        .unwrap();
        assert_eq!(wide.shape(), &[2, 3]);
        let narrow = dereference(
            Selection::Range(1..2),
            &refs,
            &target,
            &DerefOptions::default(),
        )
        .unwrap();
        assert_eq!(narrow.shape(), &[1, 1]);
    }

    #[test]
    fn no_matches_gives_zero_width() {
        let refs = MemRefs::new(vec![(5, 0)]);
        let target = MemRows::i64s(&[1]);
        let rect = dereference(
            Selection::Range(0..3),
            &refs,
            &target,
            &DerefOptions::default(),
        )
        .unwrap();
        assert_eq!(rect.shape(), &[3, 0]);
        assert_eq!(rect.count_unmasked(), 0);
    }

    #[test]
    fn selector_beyond_region_fails() {
        let refs = scenario_refs();
        let region = MemRegions(vec![(0, 1), (1, 2)]);
        let opts = DerefOptions {
            region: Some(&region),
            ..Default::default()
        };
        let err = dereference_indices(Selection::Range(0..3), &refs, &opts).unwrap_err();
        assert_eq!(err.code(), "E201");
    }

    #[test]
    fn chain_matches_manual_composition() {
        // Scenario F: A -> B -> C with the chain engine vs two manual hops.
        let ab = MemRefs::new(vec![(0, 0), (0, 1), (1, 1), (2, 2)]);
        let bc = MemRefs::new(vec![(0, 3), (1, 4), (2, 5), (1, 6)]);
        let c = MemRows::i64s(&[0, 0, 0, 30, 40, 50, 60]);

        let hops = [
            ChainHop {
                refs: &ab,
                region: None,
                direction: RefDirection::Forward,
            },
            ChainHop {
                refs: &bc,
                region: None,
                direction: RefDirection::Forward,
            },
        ];
        let chained = dereference_chain(Selection::Range(0..3), &hops, &c, None).unwrap();
        assert_eq!(chained.shape(), &[3, 2, 2]);

        // Manual composition: hop 1 indices-only, mask carried into hop 2.
        let hop1 = dereference_indices(
            Selection::Range(0..3),
            &ab,
            &DerefOptions::default(),
        )
        .unwrap();
        let flat_sel: Vec<u64> = hop1.idx.clone();
        let opts = DerefOptions {
            mask: Some(&hop1.mask),
            ..Default::default()
        };
        let hop2 = dereference(Selection::Indices(&flat_sel), &bc, &c, &opts).unwrap();

        assert_eq!(hop2.flat_len(), chained.flat_len());
        assert_eq!(hop2.mask(), chained.mask());
        for flat in 0..chained.flat_len() {
            let i = flat / chained.shape()[1..].iter().product::<usize>();
            let rem = flat % chained.shape()[1..].iter().product::<usize>();
            let j = rem / chained.shape()[2];
            let l = rem % chained.shape()[2];
            let manual_i = flat / hop2.shape()[1];
            let manual_j = flat % hop2.shape()[1];
            assert_eq!(
                chained.row(i, j * chained.shape()[2] + l).is_none(),
                hop2.row(manual_i, manual_j).is_none()
            );
        }
    }

    #[test]
    fn chain_values_walk_both_refs() {
        let ab = MemRefs::new(vec![(0, 1)]);
        let bc = MemRefs::new(vec![(1, 2)]);
        let c = MemRows::f64s(&[0.0, 0.0, 7.5]);
        let hops = [
            ChainHop {
                refs: &ab,
                region: None,
                direction: RefDirection::Forward,
            },
            ChainHop {
                refs: &bc,
                region: None,
                direction: RefDirection::Forward,
            },
        ];
        let rect = dereference_chain(Selection::Range(0..2), &hops, &c, None).unwrap();
        assert_eq!(rect.shape(), &[2, 1, 1]);
        assert_eq!(rect.get_f64(0, 0, "value"), Some(7.5));
        assert!(rect.row(1, 0).is_none());
    }
}
