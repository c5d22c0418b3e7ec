#![forbid(unsafe_code)]

use std::time::{SystemTime, UNIX_EPOCH};

use tandem_contracts::txlog::{
    FileHash, TransactionId, TransactionLogRowInput, TransactionLogUpdate, TransactionState,
};
use tandem_contracts::TimestampNs;
use tandem_storage::{StorageError, TransactionLedgerRepo, TransactionLedgerStore};

fn tx(id: &str) -> TransactionId {
    TransactionId::new(id).unwrap()
}

fn hash(c: char) -> FileHash {
    FileHash::new(c.to_string().repeat(64)).unwrap()
}

fn input(id: &str, h: char, created: u64) -> TransactionLogRowInput {
    TransactionLogRowInput::v1(
        tx(id),
        "import.json".to_string(),
        42,
        hash(h),
        TimestampNs(created),
        TimestampNs(created + 100),
    )
    .unwrap()
}

/// Drives a fresh row through PREPARING -> PREPARED -> COMMITTING -> COMMITTED.
fn commit_row(s: &mut TransactionLedgerStore, id: &str, t: u64) {
    let row = s.transaction_row(&tx(id)).unwrap().clone();
    let row = s
        .apply_transaction_update(
            TransactionLogUpdate::for_row(&row)
                .with_staging_object_key(format!("staging/{id}.json"))
                .with_validated_operations("[{\"op\":\"insert\"}]")
                .transition(TransactionState::Prepared),
            TimestampNs(t),
        )
        .unwrap();
    let row = s
        .apply_transaction_update(
            TransactionLogUpdate::for_row(&row)
                .with_import_result_ref("import-1")
                .transition(TransactionState::Committing),
            TimestampNs(t),
        )
        .unwrap();
    s.apply_transaction_update(
        TransactionLogUpdate::for_row(&row)
            .with_final_object_key(format!("final/{id}.json"))
            .transition(TransactionState::Committed),
        TimestampNs(t),
    )
    .unwrap();
}

fn temp_journal_path(tag: &str) -> std::path::PathBuf {
    let seed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    std::env::temp_dir()
        .join(format!("tandem_ledger_{tag}_{seed}"))
        .join("transaction_log.jsonl")
}

#[test]
fn at_txlog_db_01_insert_is_unique_per_transaction_id() {
    let mut s = TransactionLedgerStore::new_in_memory();
    let row = s.insert_transaction_row(input("tx-1", 'a', 10)).unwrap();
    assert_eq!(row.state, TransactionState::Preparing);
    assert_eq!(row.revision, 1);

    let dup = s.insert_transaction_row(input("tx-1", 'b', 11));
    assert!(matches!(dup, Err(StorageError::DuplicateKey { .. })));
    assert_eq!(s.transaction_rows().len(), 1);
}

#[test]
fn at_txlog_db_02_stale_revision_is_rejected() {
    let mut s = TransactionLedgerStore::new_in_memory();
    let row = s.insert_transaction_row(input("tx-2", 'a', 10)).unwrap();
    let stale = TransactionLogUpdate::for_row(&row).transition(TransactionState::Aborted);

    s.apply_transaction_update(
        TransactionLogUpdate::for_row(&row).with_staging_object_key("staging/tx-2.json"),
        TimestampNs(12),
    )
    .unwrap();

    let err = s
        .apply_transaction_update(stale, TimestampNs(13))
        .unwrap_err();
    assert_eq!(
        err,
        StorageError::StaleRevision {
            transaction_id: tx("tx-2"),
            expected: 1,
            found: 2,
        }
    );
    assert_eq!(
        s.transaction_row(&tx("tx-2")).unwrap().state,
        TransactionState::Preparing
    );
}

#[test]
fn at_txlog_db_03_transitions_follow_table_and_terminal_rows_freeze() {
    let mut s = TransactionLedgerStore::new_in_memory();
    let row = s.insert_transaction_row(input("tx-3", 'a', 10)).unwrap();

    let skip = s.apply_transaction_update(
        TransactionLogUpdate::for_row(&row).transition(TransactionState::Committing),
        TimestampNs(11),
    );
    assert!(matches!(skip, Err(StorageError::IllegalTransition { .. })));

    let aborted = s
        .apply_transaction_update(
            TransactionLogUpdate::for_row(&row).transition(TransactionState::Aborted),
            TimestampNs(11),
        )
        .unwrap();
    assert_eq!(aborted.state, TransactionState::Aborted);

    let reopen = s.apply_transaction_update(
        TransactionLogUpdate::for_row(&aborted).transition(TransactionState::Prepared),
        TimestampNs(12),
    );
    assert!(matches!(
        reopen,
        Err(StorageError::TerminalRowImmutable {
            state: TransactionState::Aborted,
            ..
        })
    ));
}

#[test]
fn at_txlog_db_04_lookup_by_hash_state_and_staging_key() {
    let mut s = TransactionLedgerStore::new_in_memory();
    s.insert_transaction_row(input("tx-old", 'c', 10)).unwrap();
    s.insert_transaction_row(input("tx-new", 'c', 20)).unwrap();
    commit_row(&mut s, "tx-old", 15);
    commit_row(&mut s, "tx-new", 25);

    let hit = s
        .transaction_row_by_hash_and_state(&hash('c'), TransactionState::Committed)
        .unwrap();
    assert_eq!(hit.transaction_id, tx("tx-old"));
    assert!(s
        .transaction_row_by_hash_and_state(&hash('c'), TransactionState::Preparing)
        .is_none());
    assert!(s
        .transaction_row_by_hash_and_state(&hash('d'), TransactionState::Committed)
        .is_none());

    assert_eq!(
        s.transaction_row_by_staging_key("staging/tx-new.json")
            .unwrap()
            .transaction_id,
        tx("tx-new")
    );
    assert!(s.transaction_row_by_staging_key("staging/none.json").is_none());
}

#[test]
fn at_txlog_db_05_timed_out_rows_are_strictly_past_deadline_and_ordered() {
    let mut s = TransactionLedgerStore::new_in_memory();
    s.insert_transaction_row(input("tx-b", 'a', 20)).unwrap();
    s.insert_transaction_row(input("tx-a", 'b', 10)).unwrap();
    s.insert_transaction_row(input("tx-done", 'c', 5)).unwrap();
    commit_row(&mut s, "tx-done", 6);

    // tx-a deadline is 110, tx-b is 120.
    assert!(s.timed_out_transaction_rows(TimestampNs(110)).is_empty());
    let ids: Vec<_> = s
        .timed_out_transaction_rows(TimestampNs(500))
        .into_iter()
        .map(|r| r.transaction_id.clone())
        .collect();
    assert_eq!(ids, vec![tx("tx-a"), tx("tx-b")]);
    assert_eq!(s.count_active_transaction_rows(), 2);
    assert_eq!(
        s.transaction_rows_by_state(TransactionState::Committed).len(),
        1
    );
}

#[test]
fn at_txlog_db_06_retention_only_drops_old_terminal_rows() {
    let mut s = TransactionLedgerStore::new_in_memory();
    s.insert_transaction_row(input("tx-old", 'a', 10)).unwrap();
    s.insert_transaction_row(input("tx-recent", 'b', 10)).unwrap();
    s.insert_transaction_row(input("tx-open", 'c', 10)).unwrap();
    commit_row(&mut s, "tx-old", 20);
    commit_row(&mut s, "tx-recent", 900);

    let removed = s.delete_terminal_rows_older_than(TimestampNs(500)).unwrap();
    assert_eq!(removed, 1);
    assert!(s.transaction_row(&tx("tx-old")).is_none());
    assert!(s.transaction_row(&tx("tx-recent")).is_some());
    assert!(s.transaction_row(&tx("tx-open")).is_some());
    assert!(s.transaction_row_by_staging_key("staging/tx-old.json").is_none());
    assert!(s
        .transaction_row_by_hash_and_state(&hash('a'), TransactionState::Committed)
        .is_none());
}

#[test]
fn at_txlog_db_07_journal_replay_restores_rows_and_indexes() {
    let path = temp_journal_path("replay");
    {
        let mut s = TransactionLedgerStore::open_with_journal(&path).unwrap();
        assert!(s.is_durable());
        s.insert_transaction_row(input("tx-keep", 'a', 10)).unwrap();
        s.insert_transaction_row(input("tx-gone", 'b', 10)).unwrap();
        commit_row(&mut s, "tx-keep", 900);
        commit_row(&mut s, "tx-gone", 20);
        s.delete_terminal_rows_older_than(TimestampNs(500)).unwrap();
    }

    let reopened = TransactionLedgerStore::open_with_journal(&path).unwrap();
    let row = reopened.transaction_row(&tx("tx-keep")).unwrap();
    assert_eq!(row.state, TransactionState::Committed);
    assert_eq!(row.revision, 4);
    assert_eq!(row.final_object_key.as_deref(), Some("final/tx-keep.json"));
    assert!(reopened.transaction_row(&tx("tx-gone")).is_none());
    assert!(reopened
        .transaction_row_by_staging_key("staging/tx-keep.json")
        .is_some());

    if let Some(dir) = path.parent() {
        let _ = std::fs::remove_dir_all(dir);
    }
}

#[test]
fn at_txlog_db_08_repo_trait_delegates_to_store() {
    fn via_repo<R: TransactionLedgerRepo>(repo: &mut R) -> usize {
        repo.insert_transaction_row(input("tx-r", 'e', 10)).unwrap();
        repo.transaction_rows_by_state(TransactionState::Preparing)
            .len()
    }
    let mut s = TransactionLedgerStore::new_in_memory();
    assert_eq!(via_repo(&mut s), 1);
}

fn journal_lines(path: &std::path::Path) -> usize {
    std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .filter(|l| !l.trim().is_empty())
        .count()
}

#[test]
fn at_txlog_db_09_crash_torn_journal_tail_does_not_block_reopen() {
    use std::io::Write;

    let path = temp_journal_path("torn");
    {
        let mut s = TransactionLedgerStore::open_with_journal(&path).unwrap();
        s.insert_transaction_row(input("tx-1", 'a', 10)).unwrap();
    }
    std::fs::OpenOptions::new()
        .append(true)
        .open(&path)
        .unwrap()
        .write_all(b"{\"schema_version\":1,\"entry\":{\"op\":\"ups")
        .unwrap();

    let mut reopened = TransactionLedgerStore::open_with_journal(&path).unwrap();
    assert_eq!(reopened.transaction_rows().len(), 1);
    assert!(std::fs::read_to_string(&path).unwrap().ends_with('\n'));

    reopened.insert_transaction_row(input("tx-2", 'b', 20)).unwrap();
    drop(reopened);
    let again = TransactionLedgerStore::open_with_journal(&path).unwrap();
    assert!(again.transaction_row(&tx("tx-1")).is_some());
    assert!(again.transaction_row(&tx("tx-2")).is_some());

    std::fs::OpenOptions::new()
        .append(true)
        .open(&path)
        .unwrap()
        .write_all(b"garbage\n")
        .unwrap();
    drop(again);
    assert!(matches!(
        TransactionLedgerStore::open_with_journal(&path),
        Err(StorageError::Journal(_))
    ));

    if let Some(dir) = path.parent() {
        let _ = std::fs::remove_dir_all(dir);
    }
}

#[test]
fn at_txlog_db_10_retention_and_reopen_compact_the_journal() {
    let path = temp_journal_path("compact");
    {
        let mut s = TransactionLedgerStore::open_with_journal(&path).unwrap();
        for n in 0..50 {
            let id = format!("tx-old-{n}");
            let row = s.insert_transaction_row(input(&id, 'a', 10)).unwrap();
            let row = s
                .apply_transaction_update(
                    TransactionLogUpdate::for_row(&row).transition(TransactionState::Aborted),
                    TimestampNs(20),
                )
                .unwrap();
            assert_eq!(row.state, TransactionState::Aborted);
        }
        s.insert_transaction_row(input("tx-live", 'b', 900)).unwrap();
        assert_eq!(journal_lines(&path), 101);

        assert_eq!(s.delete_terminal_rows_older_than(TimestampNs(500)).unwrap(), 50);
        assert_eq!(journal_lines(&path), 1);

        let row = s.transaction_row(&tx("tx-live")).unwrap().clone();
        s.apply_transaction_update(
            TransactionLogUpdate::for_row(&row)
                .with_staging_object_key("staging/tx-live.json"),
            TimestampNs(901),
        )
        .unwrap();
        assert_eq!(journal_lines(&path), 2);
    }

    let reopened = TransactionLedgerStore::open_with_journal(&path).unwrap();
    assert_eq!(journal_lines(&path), 1);
    let row = reopened.transaction_row(&tx("tx-live")).unwrap();
    assert_eq!(row.revision, 2);
    assert!(reopened
        .transaction_row_by_staging_key("staging/tx-live.json")
        .is_some());
    assert_eq!(reopened.transaction_rows().len(), 1);

    if let Some(dir) = path.parent() {
        let _ = std::fs::remove_dir_all(dir);
    }
}
