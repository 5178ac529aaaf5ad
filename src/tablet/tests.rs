// Copyright 2024 Rutile Project Authors. Licensed under Apache-2.0.

//! End-to-end tablet scenarios.

use std::sync::Arc;

use crossbeam_channel::{bounded, Receiver, Sender};

use super::*;
use crate::catalog::{ColumnCatalog, ColumnDesc, Schema};
use crate::types::{DataType, DataValue};

fn test_schema() -> Schema {
    Schema::new(
        vec![
            ColumnCatalog::new(0, "key", ColumnDesc::new(DataType::String, false)),
            ColumnCatalog::new(1, "val", ColumnDesc::new(DataType::Int32, true)),
        ],
        1,
    )
    .unwrap()
}

fn open_test_tablet(dir: &std::path::Path) -> Arc<Tablet> {
    let metadata = TabletMetadata::create_new(dir, "test-tablet", test_schema()).unwrap();
    Tablet::open(
        metadata,
        Arc::new(LogicalClock::new(0)),
        Arc::new(NoopAnchorRegistry),
        TabletOptions::default(),
    )
    .unwrap()
}

fn row(key: &str, val: i32) -> Row {
    Row::new(vec![
        DataValue::String(key.into()),
        DataValue::Int32(val),
    ])
}

fn key_row(key: &str) -> Row {
    Row::new(vec![DataValue::String(key.into())])
}

fn set_val(val: i32) -> RowChangeList {
    RowChangeList::new().set_column(1, DataValue::Int32(val))
}

fn scan(tablet: &Tablet, snapshot: Option<MvccSnapshot>) -> Vec<(String, DataValue)> {
    let mut iter = tablet.new_row_iterator(&[0, 1], snapshot).unwrap();
    let mut rows = Vec::new();
    while let Some((_, row)) = iter.next_row().unwrap() {
        let key = match &row.values()[0] {
            DataValue::String(s) => s.clone(),
            other => panic!("unexpected key value {}", other),
        };
        rows.push((key, row.values()[1].clone()));
    }
    rows
}

#[test]
fn test_insert_and_scan() {
    let dir = tempfile::tempdir().unwrap();
    let tablet = open_test_tablet(dir.path());
    let ts = tablet.insert(row("k1", 10)).unwrap();
    assert_eq!(ts, Timestamp::new(1));
    assert_eq!(
        scan(&tablet, None),
        vec![("k1".to_string(), DataValue::Int32(10))]
    );
}

#[test]
fn test_snapshot_scans_see_their_version() {
    let dir = tempfile::tempdir().unwrap();
    let tablet = open_test_tablet(dir.path());
    tablet.insert(row("k1", 10)).unwrap();
    tablet.mutate(&key_row("k1"), set_val(11)).unwrap();

    let at_1 = scan(&tablet, Some(MvccSnapshot::at(Timestamp::new(1))));
    assert_eq!(at_1, vec![("k1".to_string(), DataValue::Int32(10))]);
    let at_2 = scan(&tablet, Some(MvccSnapshot::at(Timestamp::new(2))));
    assert_eq!(at_2, vec![("k1".to_string(), DataValue::Int32(11))]);
}

#[test]
fn test_flush_then_scan_in_key_order() {
    let dir = tempfile::tempdir().unwrap();
    let tablet = open_test_tablet(dir.path());
    for i in 0..100 {
        tablet.insert(row(&format!("k{:03}", i), i)).unwrap();
    }
    let mrs_before = tablet.current_mrs_id();
    tablet.flush().unwrap();
    assert_eq!(tablet.num_rowsets(), 1);
    assert!(tablet.current_mrs_id() > mrs_before);
    assert_eq!(tablet.mem_row_set_size(), 0);

    tablet.insert(row("k100", 100)).unwrap();
    let rows = scan(&tablet, None);
    assert_eq!(rows.len(), 101);
    let keys: Vec<&str> = rows.iter().map(|(k, _)| k.as_str()).collect();
    let mut sorted = keys.clone();
    sorted.sort_unstable();
    assert_eq!(keys, sorted);
    assert_eq!(rows[100], ("k100".to_string(), DataValue::Int32(100)));
    assert_eq!(tablet.count_rows().unwrap(), 101);
}

#[test]
fn test_empty_flush_is_a_noop() {
    let dir = tempfile::tempdir().unwrap();
    let tablet = open_test_tablet(dir.path());
    let mrs_before = tablet.current_mrs_id();
    tablet.flush().unwrap();
    assert_eq!(tablet.num_rowsets(), 0);
    assert_eq!(tablet.current_mrs_id(), mrs_before);
}

#[test]
fn test_insert_after_flush_is_already_present() {
    let dir = tempfile::tempdir().unwrap();
    let tablet = open_test_tablet(dir.path());
    tablet.insert(row("k1", 10)).unwrap();
    tablet.flush().unwrap();
    let err = tablet.insert(row("k1", 11)).unwrap_err();
    assert!(matches!(err.error(), TabletError::AlreadyPresent(_)));
}

#[test]
fn test_mutate_missing_key_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let tablet = open_test_tablet(dir.path());
    let err = tablet.mutate(&key_row("nope"), set_val(1)).unwrap_err();
    assert!(matches!(err.error(), TabletError::NotFound(..)));
}

#[test]
fn test_mutations_survive_flush_and_compaction() {
    let dir = tempfile::tempdir().unwrap();
    let tablet = open_test_tablet(dir.path());
    tablet.insert(row("k1", 1)).unwrap();
    tablet.mutate(&key_row("k1"), set_val(2)).unwrap();
    tablet.flush().unwrap();
    tablet.mutate(&key_row("k1"), set_val(3)).unwrap();
    tablet.insert(row("k2", 9)).unwrap();
    tablet.flush().unwrap();
    assert_eq!(tablet.num_rowsets(), 2);

    tablet.compact(CompactFlags::ForceCompactAll).unwrap();
    assert_eq!(tablet.num_rowsets(), 1);
    assert_eq!(
        scan(&tablet, None),
        vec![
            ("k1".to_string(), DataValue::Int32(3)),
            ("k2".to_string(), DataValue::Int32(9)),
        ]
    );
}

#[test]
fn test_force_compact_single_rowset_rewrites_it() {
    let dir = tempfile::tempdir().unwrap();
    let tablet = open_test_tablet(dir.path());
    tablet.insert(row("k1", 1)).unwrap();
    tablet.flush().unwrap();
    let before = tablet.estimate_on_disk_size();
    assert!(before > 0);
    tablet.compact(CompactFlags::ForceCompactAll).unwrap();
    assert_eq!(tablet.num_rowsets(), 1);
    assert_eq!(
        scan(&tablet, None),
        vec![("k1".to_string(), DataValue::Int32(1))]
    );
}

#[test]
fn test_delete_hides_row_and_blocks_reinsert() {
    let dir = tempfile::tempdir().unwrap();
    let tablet = open_test_tablet(dir.path());
    tablet.insert(row("k1", 1)).unwrap();
    tablet.insert(row("k2", 2)).unwrap();
    tablet
        .mutate(&key_row("k1"), RowChangeList::new().delete())
        .unwrap();
    assert_eq!(tablet.count_rows().unwrap(), 1);
    // The key still occupies its slot until a compaction reclaims it.
    let err = tablet.insert(row("k1", 3)).unwrap_err();
    assert!(matches!(err.error(), TabletError::AlreadyPresent(_)));

    // Compaction drops the dead row and frees the key.
    tablet.flush().unwrap();
    tablet.compact(CompactFlags::ForceCompactAll).unwrap();
    assert_eq!(tablet.count_rows().unwrap(), 1);
    tablet.insert(row("k1", 3)).unwrap();
    assert_eq!(tablet.count_rows().unwrap(), 2);
}

#[test]
fn test_visible_rows_unchanged_by_compaction() {
    let dir = tempfile::tempdir().unwrap();
    let tablet = open_test_tablet(dir.path());
    for i in 0..20 {
        tablet.insert(row(&format!("k{:02}", i), i)).unwrap();
        if i % 5 == 4 {
            tablet.flush().unwrap();
        }
    }
    tablet.mutate(&key_row("k03"), set_val(-3)).unwrap();
    let before = scan(&tablet, None);

    tablet.compact(CompactFlags::ForceCompactAll).unwrap();
    assert_eq!(scan(&tablet, None), before);
}

#[test]
fn test_concurrent_duplicate_insert_has_one_winner() {
    let dir = tempfile::tempdir().unwrap();
    let tablet = open_test_tablet(dir.path());
    let barrier = Arc::new(std::sync::Barrier::new(2));
    let results: Vec<TabletResult<Timestamp>> = [0, 1]
        .map(|_| {
            let tablet = tablet.clone();
            let barrier = barrier.clone();
            std::thread::spawn(move || {
                barrier.wait();
                tablet.insert(row("k1", 7))
            })
        })
        .into_iter()
        .map(|h| h.join().unwrap())
        .collect();

    let ok = results.iter().filter(|r| r.is_ok()).count();
    let already = results
        .iter()
        .filter(|r| {
            matches!(
                r.as_ref().err().map(|e| e.error()),
                Some(TabletError::AlreadyPresent(_))
            )
        })
        .count();
    assert_eq!((ok, already), (1, 1));
}

#[test]
fn test_per_key_timestamps_follow_lock_order() {
    let dir = tempfile::tempdir().unwrap();
    let tablet = open_test_tablet(dir.path());
    tablet.insert(row("k1", 0)).unwrap();
    let mut handles = Vec::new();
    for i in 0..8 {
        let tablet = tablet.clone();
        handles.push(std::thread::spawn(move || {
            tablet.mutate(&key_row("k1"), set_val(i)).unwrap()
        }));
    }
    let mut timestamps: Vec<Timestamp> =
        handles.into_iter().map(|h| h.join().unwrap()).collect();
    timestamps.sort_unstable();
    timestamps.dedup();
    assert_eq!(timestamps.len(), 8);

    // The mutation chain replays in timestamp order; the scan reflects
    // whichever mutation committed last.
    let rows = scan(&tablet, None);
    assert_eq!(rows.len(), 1);
}

struct PausingHooks {
    reached: Sender<()>,
    release: Receiver<()>,
}

impl FlushCompactHooks for PausingHooks {
    fn post_write_snapshot(&self) -> TabletResult<()> {
        self.reached.send(()).ok();
        self.release.recv().ok();
        Ok(())
    }
}

#[test]
fn test_mutation_during_flush_window_reaches_output() {
    let dir = tempfile::tempdir().unwrap();
    let tablet = open_test_tablet(dir.path());
    tablet.insert(row("k1", 1)).unwrap();

    let (reached_tx, reached_rx) = bounded(1);
    let (release_tx, release_rx) = bounded(1);
    tablet.set_flush_compact_hooks(Arc::new(PausingHooks {
        reached: reached_tx,
        release: release_rx,
    }));

    let flusher = {
        let tablet = tablet.clone();
        std::thread::spawn(move || tablet.flush())
    };
    // The flush has written its output snapshot and is paused; the tablet
    // keeps serving writes, routed through the duplicating rowset.
    reached_rx.recv().unwrap();
    tablet.mutate(&key_row("k1"), set_val(99)).unwrap();
    assert_eq!(
        scan(&tablet, None),
        vec![("k1".to_string(), DataValue::Int32(99))]
    );
    release_tx.send(()).unwrap();
    flusher.join().unwrap().unwrap();

    assert_eq!(tablet.num_rowsets(), 1);
    assert_eq!(
        scan(&tablet, None),
        vec![("k1".to_string(), DataValue::Int32(99))]
    );
}

#[test]
fn test_alter_schema_adds_column_with_default() {
    let dir = tempfile::tempdir().unwrap();
    let tablet = open_test_tablet(dir.path());
    tablet.insert(row("k1", 1)).unwrap();
    tablet.insert(row("k2", 2)).unwrap();

    let prepared = tablet
        .create_prepared_alter_schema(vec![
            ColumnCatalog::new(0, "key", ColumnDesc::new(DataType::String, false)),
            ColumnCatalog::new(1, "val", ColumnDesc::new(DataType::Int32, true)),
            ColumnCatalog::new(
                2,
                "c3",
                ColumnDesc::new(DataType::Int32, false).with_default(DataValue::Int32(0)),
            ),
            ColumnCatalog::new(3, "c4", ColumnDesc::new(DataType::String, true)),
        ])
        .unwrap();
    tablet.alter_schema(prepared).unwrap();
    assert_eq!(tablet.schema().version(), 1);

    // Old rows read back the new columns as default and NULL.
    let mut iter = tablet.new_row_iterator(&[0, 1, 2, 3], None).unwrap();
    let rows = iter.collect_rows().unwrap();
    assert_eq!(rows.len(), 2);
    for row in &rows {
        assert_eq!(row.values()[2], DataValue::Int32(0));
        assert_eq!(row.values()[3], DataValue::Null);
    }

    // New rows carry all four columns.
    tablet
        .insert(Row::new(vec![
            DataValue::String("k3".into()),
            DataValue::Int32(3),
            DataValue::Int32(30),
            DataValue::Null,
        ]))
        .unwrap();
    assert_eq!(tablet.count_rows().unwrap(), 3);
}

#[test]
fn test_write_prepared_before_alter_aborts() {
    let dir = tempfile::tempdir().unwrap();
    let tablet = open_test_tablet(dir.path());
    let prepared_write = tablet.create_prepared_insert(row("k1", 1)).unwrap();

    let prepared_alter = tablet
        .create_prepared_alter_schema(vec![
            ColumnCatalog::new(0, "key", ColumnDesc::new(DataType::String, false)),
            ColumnCatalog::new(1, "val", ColumnDesc::new(DataType::Int32, true)),
            ColumnCatalog::new(2, "c3", ColumnDesc::new(DataType::Int32, true)),
        ])
        .unwrap();
    tablet.alter_schema(prepared_alter).unwrap();

    let mut state = WriteTransactionState::default();
    tablet.start_transaction(&mut state);
    let err = tablet.insert_unlocked(&state, &prepared_write).unwrap_err();
    assert!(matches!(err.error(), TabletError::Aborted(_)));
    tablet.abort_write(&mut state);
}

#[test]
fn test_reopen_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    {
        let tablet = open_test_tablet(dir.path());
        for i in 0..10 {
            tablet.insert(row(&format!("k{}", i), i)).unwrap();
        }
        tablet.flush().unwrap();
        tablet.mutate(&key_row("k3"), set_val(33)).unwrap();
        tablet.flush_biggest_dms().unwrap();
    }

    let metadata = TabletMetadata::load(dir.path()).unwrap();
    let tablet = Tablet::open(
        metadata,
        Arc::new(LogicalClock::new(0)),
        Arc::new(NoopAnchorRegistry),
        TabletOptions::default(),
    )
    .unwrap();
    assert_eq!(tablet.count_rows().unwrap(), 10);
    let rows = scan(&tablet, None);
    assert_eq!(rows[3], ("k3".to_string(), DataValue::Int32(33)));
}

#[test]
fn test_dms_flush_and_minor_compaction() {
    let dir = tempfile::tempdir().unwrap();
    let tablet = open_test_tablet(dir.path());
    for i in 0..5 {
        tablet.insert(row(&format!("k{}", i), i)).unwrap();
    }
    tablet.flush().unwrap();

    tablet.mutate(&key_row("k0"), set_val(100)).unwrap();
    tablet.flush_biggest_dms().unwrap();
    tablet.mutate(&key_row("k1"), set_val(101)).unwrap();
    tablet.flush_biggest_dms().unwrap();
    assert_eq!(tablet.delta_mem_stores_size(), 0);

    tablet.minor_compact_worst_deltas().unwrap();
    let rows = scan(&tablet, None);
    assert_eq!(rows[0].1, DataValue::Int32(100));
    assert_eq!(rows[1].1, DataValue::Int32(101));
}

#[test]
fn test_major_delta_compaction_folds_updates() {
    let dir = tempfile::tempdir().unwrap();
    let tablet = open_test_tablet(dir.path());
    for i in 0..5 {
        tablet.insert(row(&format!("k{}", i), i)).unwrap();
    }
    tablet.flush().unwrap();
    tablet.mutate(&key_row("k2"), set_val(22)).unwrap();
    tablet.flush_biggest_dms().unwrap();

    let rowset = {
        let components = tablet.components.read().clone();
        let rowset = components.rowsets.iter().next().unwrap().clone();
        rowset
    };
    tablet.do_major_delta_compaction(&[1], rowset).unwrap();

    // The update now lives in the base; no delta files remain.
    let components = tablet.components.read().clone();
    let rowset = components.rowsets.iter().next().unwrap();
    assert_eq!(rowset.delta_stats().num_delta_files, 0);
    let rows = scan(&tablet, None);
    assert_eq!(rows[2].1, DataValue::Int32(22));

    // Mutations keep flowing to the rewritten rowset.
    tablet.mutate(&key_row("k2"), set_val(23)).unwrap();
    assert_eq!(scan(&tablet, None)[2].1, DataValue::Int32(23));
}

#[test]
fn test_memory_budget_returns_service_unavailable() {
    let dir = tempfile::tempdir().unwrap();
    let metadata = TabletMetadata::create_new(dir.path(), "tiny", test_schema()).unwrap();
    let tablet = Tablet::open(
        metadata,
        Arc::new(LogicalClock::new(0)),
        Arc::new(NoopAnchorRegistry),
        TabletOptions {
            mem_budget_bytes: 256,
            ..TabletOptions::default()
        },
    )
    .unwrap();

    let mut hit_budget = false;
    for i in 0..100 {
        match tablet.insert(row(&format!("k{:03}", i), i)) {
            Ok(_) => {}
            Err(e) if e.error().is_service_unavailable() => {
                hit_budget = true;
                break;
            }
            Err(e) => panic!("unexpected error: {}", e),
        }
    }
    assert!(hit_budget);

    // A flush recovers the budget.
    tablet.flush().unwrap();
    tablet.insert(row("k999", 999)).unwrap();
}

#[test]
fn test_maintenance_ops_flush_via_manager() {
    let dir = tempfile::tempdir().unwrap();
    let tablet = open_test_tablet(dir.path());
    tablet.insert(row("k1", 1)).unwrap();

    let manager = MaintenanceManager::new(std::time::Duration::from_secs(3600));
    tablet.register_maintenance_ops(&manager);
    assert_eq!(manager.num_ops(), 4);

    manager.tick();
    assert_eq!(tablet.num_rowsets(), 1);
    assert_eq!(tablet.mem_row_set_size(), 0);

    tablet.unregister_maintenance_ops(&manager);
    assert_eq!(manager.num_ops(), 0);
}

#[test]
fn test_scan_holds_components_across_flush() {
    let dir = tempfile::tempdir().unwrap();
    let tablet = open_test_tablet(dir.path());
    for i in 0..10 {
        tablet.insert(row(&format!("k{}", i), i)).unwrap();
    }
    let mut iter = tablet.new_row_iterator(&[0, 1], None).unwrap();
    // The scan captured the pre-flush components; replacing them must not
    // disturb it.
    tablet.flush().unwrap();
    let rows = iter.collect_rows().unwrap();
    assert_eq!(rows.len(), 10);
}
