//! Dereferencing through on-disk handles: chains, region equivalence, and
//! persistence across reopen.

use rowflow_core::comm::{Communicator, LocalComm};
use rowflow_core::data::{
    dereference, dereference_indices, DataManager, DerefOptions, Selection,
};
use rowflow_core::store::{Dtype, Field, Scalar, TableFile};
use std::path::Path;
use std::sync::Arc;

fn i64s() -> Dtype {
    Dtype::scalar(Scalar::I64)
}

fn manager(path: &Path) -> DataManager {
    DataManager::open(path, Arc::new(LocalComm::new()) as Arc<dyn Communicator>).unwrap()
}

/// A -> B -> C fixture: each A row references two B rows, each B row
/// references one C row.
fn chained_fixture(dm: &DataManager) {
    dm.create_dset("a", &i64s(), None).unwrap();
    dm.create_dset("b", &i64s(), None).unwrap();
    dm.create_dset("c", &i64s(), None).unwrap();
    let sa = dm.reserve_rows("a", 3).unwrap();
    dm.write_data("a", sa.start, &i64s().pack_i64(&[0, 1, 2])).unwrap();
    let sb = dm.reserve_rows("b", 6).unwrap();
    dm.write_data("b", sb.start, &i64s().pack_i64(&[0, 1, 2, 3, 4, 5]))
        .unwrap();
    let sc = dm.reserve_rows("c", 6).unwrap();
    dm.write_data("c", sc.start, &i64s().pack_i64(&[0, 10, 20, 30, 40, 50]))
        .unwrap();

    let ab: Vec<(u64, u64)> = (0..3).flat_map(|a| [(a, 2 * a), (a, 2 * a + 1)]).collect();
    dm.write_ref("a", "b", &ab).unwrap();
    let bc: Vec<(u64, u64)> = (0..6).map(|b| (b, b)).collect();
    dm.write_ref("b", "c", &bc).unwrap();
}

#[test]
fn chain_equals_manual_composition() {
    // Scenario F: the chain engine against indices-only single hops with
    // mask carry-over.
    let dir = tempfile::tempdir().unwrap();
    let dm = manager(&dir.path().join("out.rfl"));
    chained_fixture(&dm);

    let chain = [
        ("a".to_string(), "b".to_string()),
        ("b".to_string(), "c".to_string()),
    ];
    let chained = dm.deref_chain_range(0..3, &chain).unwrap();
    assert_eq!(chained.shape(), &[3, 2, 1]);

    // manual: hop 1 indices-only, then hop 2 with the carried mask
    let ab = dm.get_ref("a", "b").unwrap();
    let ab_region = dm.get_ref_region("a", "b").unwrap();
    let hop1 = dereference_indices(
        Selection::Range(0..3),
        &ab,
        &DerefOptions {
            region: Some(&ab_region),
            direction: ab.direction(),
            mask: None,
        },
    )
    .unwrap();

    let flat: Vec<u64> = (0..hop1.rows())
        .flat_map(|i| {
            (0..hop1.shape()[1]).map(move |j| (i, j))
        })
        .map(|(i, j)| hop1.get(i, j).unwrap_or(0))
        .collect();
    let bc = dm.get_ref("b", "c").unwrap();
    let c = dm.get_dset("c").unwrap();
    let hop2 = dereference(
        Selection::Indices(&flat),
        &bc,
        &c,
        &DerefOptions {
            region: None,
            direction: bc.direction(),
            mask: Some(hop1.mask()),
        },
    )
    .unwrap();

    assert_eq!(hop2.flat_len(), chained.flat_len());
    assert_eq!(hop2.mask(), chained.mask());
    for a in 0..3 {
        for j in 0..2 {
            let expected = (2 * a as i64 + j as i64) * 10;
            assert_eq!(chained.get_i64(a, j, "value"), Some(expected));
            assert_eq!(hop2.get_i64(a * 2 + j, 0, "value"), Some(expected));
        }
    }
}

#[test]
fn region_and_full_scan_agree_on_disk() {
    // Property 3 against container handles.
    let dir = tempfile::tempdir().unwrap();
    let dm = manager(&dir.path().join("out.rfl"));
    chained_fixture(&dm);

    let refs = dm.get_ref("a", "b").unwrap();
    let region = dm.get_ref_region("a", "b").unwrap();
    let target = dm.get_dset("b").unwrap();

    let plain = dereference(
        Selection::Range(0..3),
        &refs,
        &target,
        &DerefOptions {
            region: None,
            direction: refs.direction(),
            mask: None,
        },
    )
    .unwrap();
    let windowed = dereference(
        Selection::Range(0..3),
        &refs,
        &target,
        &DerefOptions {
            region: Some(&region),
            direction: refs.direction(),
            mask: None,
        },
    )
    .unwrap();
    assert!(plain.masked_eq(&windowed));
}

#[test]
fn structured_rows_roundtrip_across_reopen() {
    // Property 2: reserve + write, close, reopen, read back bit for bit.
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.rfl");
    let dtype = Dtype::compound(vec![
        Field::scalar("ts", Scalar::U64),
        Field::vector("adc", Scalar::I16, vec![4]),
        Field::scalar("q", Scalar::F32),
    ]);

    let mut written = Vec::new();
    {
        let dm = manager(&path);
        dm.create_dset("raw/packets", &dtype, Some(3)).unwrap();
        let sl = dm.reserve_rows("raw/packets", 7).unwrap();
        for i in 0..7i64 {
            let mut row = dtype.zero_row();
            dtype.put_i64(&mut row, "ts", 0, 1_700_000_000 + i);
            for ch in 0..4 {
                dtype.put_i64(&mut row, "adc", ch, i * 10 + ch as i64);
            }
            dtype.put_f64(&mut row, "q", 0, i as f64 * 0.125);
            written.extend_from_slice(&row);
        }
        dm.write_data("raw/packets", sl.start, &written).unwrap();
        dm.finish(&[]).unwrap();
    }

    let file = TableFile::open(&path).unwrap();
    let back = file.read_rows("raw/packets/data", 0, 7).unwrap();
    assert_eq!(back, written);
    assert_eq!(file.dtype("raw/packets/data").unwrap(), dtype);
}

#[test]
fn region_shorter_than_population_is_a_shape_mismatch() {
    // Growing the parent after the last ref write invalidates the region
    // index until the next write_ref refreshes it.
    let dir = tempfile::tempdir().unwrap();
    let dm = manager(&dir.path().join("out.rfl"));
    chained_fixture(&dm);

    let sl = dm.reserve_rows("a", 2).unwrap();
    dm.write_data("a", sl.start, &i64s().pack_i64(&[3, 4])).unwrap();

    let err = dm.deref_range(0..5, "a", "b").unwrap_err();
    assert_eq!(err.code(), "E202");
}
