use gridsync_core::{
    block::Block,
    ids::{ClientId, DocPath},
    row_range::decode_row_ranges,
    time::ManualClock,
};
use gridsync_engine::SyncConfig;
use gridsync_harness::{RemoteHub, TestClient};
use serde_json::{Value, json};

type TestResult = Result<(), Box<dyn std::error::Error>>;

const START: u64 = 1_700_000_000_000;

fn config() -> SyncConfig {
    SyncConfig::for_sheet("sheet")
}

fn block_at(hub: &RemoteHub, row: u64) -> Option<Block> {
    hub.docs_in(&DocPath::new("sheet/blocks"))
        .into_iter()
        .filter_map(|(_, doc)| Block::from_value(&doc).ok())
        .find(|block| block.row == row)
}

fn remote_value(hub: &RemoteHub, row: u64, column: &str) -> Option<Value> {
    block_at(hub, row).and_then(|b| b.data.get(column).cloned())
}

// ============================================================================
// Online delivery
// ============================================================================

#[test]
fn online_edit_is_flushed_after_debounce() -> TestResult {
    let hub = RemoteHub::new();
    let clock = ManualClock::new(START);
    let mut a = TestClient::new(&hub, &clock, config())?;
    a.sync.start()?;

    a.set(0, "A", "hello")?;
    assert_eq!(a.sync.buffered_edits(), 1);
    assert!(a.sync.cell(0, "A").unwrap().is_unsaved());

    // Not yet due.
    clock.advance(100);
    assert!(a.tick()?.flushed.is_none());

    let report = a.settle()?;
    let flushed = report.flushed.expect("flush after debounce");
    assert_eq!(flushed.confirmed.len(), 2);
    assert_eq!(a.pending()?, 0);
    assert!(!a.sync.cell(0, "A").unwrap().is_unsaved());

    assert_eq!(remote_value(&hub, 0, "A"), Some(json!("hello")));
    let rows = decode_row_ranges(&hub.doc(&DocPath::new("sheet/meta/rows")).unwrap())?;
    assert!(rows.contains(0));
    Ok(())
}

#[test]
fn coalesced_edits_produce_single_operation() -> TestResult {
    let hub = RemoteHub::new();
    let clock = ManualClock::new(START);
    let mut a = TestClient::new(&hub, &clock, config())?;
    a.sync.start()?;
    a.set(1, "A", "x")?;
    a.settle()?;

    a.go_offline();
    a.set(1, "A", "foo")?;
    clock.advance(100);
    a.set(1, "A", "bar")?;
    a.settle()?;

    let pending = a.sync.pending_ops()?;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].cell_value("A"), Some(Some(json!("bar"))));
    Ok(())
}

// ============================================================================
// Offline queueing and replay
// ============================================================================

#[test]
fn offline_edits_replay_on_reconnect() -> TestResult {
    let hub = RemoteHub::new();
    let clock = ManualClock::new(START);
    let mut a = TestClient::new(&hub, &clock, config())?;
    a.sync.start()?;

    a.go_offline();
    a.set(5, "B", 42)?;
    let flushed = a.settle()?.flushed.expect("flush while offline");
    assert_eq!(flushed.deferred.len(), 2);
    assert_eq!(a.pending()?, 2);
    assert!(a.sync.cell(5, "B").unwrap().is_unsaved());
    assert!(block_at(&hub, 5).is_none());

    a.go_online();
    let replay = a.tick()?.replay.expect("replay after reconnect");
    assert_eq!(replay.replayed, 2);
    assert!(replay.failed.is_empty());
    assert_eq!(a.pending()?, 0);
    assert_eq!(remote_value(&hub, 5, "B"), Some(json!(42)));
    assert!(!a.sync.cell(5, "B").unwrap().is_unsaved());
    Ok(())
}

#[test]
fn forced_offline_defers_like_a_lost_connection() -> TestResult {
    let hub = RemoteHub::new();
    let clock = ManualClock::new(START);
    let mut a = TestClient::new(&hub, &clock, config())?;
    a.sync.start()?;

    a.network.set_forced_offline(true);
    a.set(0, "A", 1)?;
    a.settle()?;
    assert_eq!(a.pending()?, 2);

    a.network.set_forced_offline(false);
    a.tick()?;
    assert_eq!(a.pending()?, 0);
    assert_eq!(remote_value(&hub, 0, "A"), Some(json!(1)));
    Ok(())
}

#[test]
fn pending_operations_survive_restart() -> TestResult {
    let dir = tempfile::tempdir()?;
    let db = dir.path().join("gridsync.db");
    let hub = RemoteHub::new();
    let clock = ManualClock::new(START);
    let client_id = ClientId::new();

    {
        let mut a = TestClient::open(&hub, &clock, config(), client_id, &db)?;
        a.sync.start()?;
        a.go_offline();
        a.set(2, "A", "kept")?;
        a.settle()?;
        assert_eq!(a.pending()?, 2);
    }

    clock.advance(5_000);
    let mut a = TestClient::open(&hub, &clock, config(), client_id, &db)?;
    assert_eq!(a.pending()?, 2);
    let report = a.sync.start()?.expect("online start replays");
    assert_eq!(report.replayed, 2);
    assert_eq!(a.pending()?, 0);
    assert_eq!(remote_value(&hub, 2, "A"), Some(json!("kept")));
    assert!(a.sync.known_rows().iter().any(|r| r.contains(2)));
    Ok(())
}

#[test]
fn offline_viewport_served_from_local_copy() -> TestResult {
    let dir = tempfile::tempdir()?;
    let db = dir.path().join("gridsync.db");
    let hub = RemoteHub::new();
    let clock = ManualClock::new(START);

    let mut writer = TestClient::new(&hub, &clock, config())?;
    writer.sync.start()?;
    writer.set(3, "A", "cached")?;
    writer.settle()?;

    let client_id = ClientId::new();
    {
        let mut reader = TestClient::open(&hub, &clock, config(), client_id, &db)?;
        reader.sync.start()?;
        assert_eq!(reader.load(0, 10)?, 1);
        assert_eq!(reader.value(3, "A"), Some(json!("cached")));
    }

    let mut reader = TestClient::open(&hub, &clock, config(), client_id, &db)?;
    reader.go_offline();
    assert_eq!(reader.load(0, 10)?, 1);
    assert_eq!(reader.value(3, "A"), Some(json!("cached")));
    Ok(())
}

#[test]
fn rejected_write_stays_queued_until_accepted() -> TestResult {
    let hub = RemoteHub::new();
    let clock = ManualClock::new(START);
    let mut a = TestClient::new(&hub, &clock, config())?;
    a.sync.start()?;

    let rows_path = DocPath::new("sheet/meta/rows");
    hub.reject_writes_to(&rows_path, true);
    a.set(0, "A", 1)?;
    let flushed = a.settle()?.flushed.unwrap();
    assert_eq!(flushed.confirmed.len(), 1);
    assert_eq!(flushed.failed.len(), 1);
    assert_eq!(a.pending()?, 1);

    let report = a.replay()?;
    assert_eq!(report.failed.len(), 1);

    hub.reject_writes_to(&rows_path, false);
    let report = a.replay()?;
    assert_eq!(report.replayed, 1);
    assert_eq!(a.pending()?, 0);
    assert!(decode_row_ranges(&hub.doc(&rows_path).unwrap())?.contains(0));
    Ok(())
}

#[test]
fn patch_of_deleted_block_fails_and_can_be_discarded() -> TestResult {
    let hub = RemoteHub::new();
    let clock = ManualClock::new(START);
    let mut a = TestClient::new(&hub, &clock, config())?;
    a.sync.start()?;
    a.set(0, "A", "first")?;
    a.set(1, "A", "other")?;
    a.settle()?;

    a.go_offline();
    a.set(0, "A", "second")?;
    a.set(1, "A", "fine")?;
    a.settle()?;
    assert_eq!(a.pending()?, 2);

    let (path, _) = hub
        .docs_in(&DocPath::new("sheet/blocks"))
        .into_iter()
        .find(|(_, doc)| doc["r"] == json!(0))
        .unwrap();
    hub.delete(&path);

    a.go_online();
    let report = a.tick()?.replay.unwrap();
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.replayed, 1);
    assert_eq!(remote_value(&hub, 1, "A"), Some(json!("fine")));

    let left = a.sync.pending_ops()?;
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].seq, report.failed[0]);
    a.sync.discard(report.failed[0])?;
    assert_eq!(a.pending()?, 0);
    assert!(!a.sync.cell(0, "A").unwrap().is_unsaved());
    Ok(())
}

#[test]
fn periodic_retry_delivers_after_transient_failure() -> TestResult {
    let hub = RemoteHub::new();
    let clock = ManualClock::new(START);
    let mut a = TestClient::new(&hub, &clock, config())?;
    a.sync.start()?;

    // The store drops away while the monitor still reports online.
    a.remote.set_reachable(false);
    a.set(0, "A", "retry")?;
    let flushed = a.settle()?.flushed.unwrap();
    assert_eq!(flushed.deferred.len(), 2);

    a.remote.set_reachable(true);
    clock.advance(a.sync.config().replay_retry_interval_ms);
    let report = a.tick()?.replay.expect("retry is due");
    assert_eq!(report.replayed, 2);
    assert_eq!(remote_value(&hub, 0, "A"), Some(json!("retry")));
    Ok(())
}
