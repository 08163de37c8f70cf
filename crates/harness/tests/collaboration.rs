use gridsync_core::{
    block::Block,
    ids::DocPath,
    presence::{EditRect, decode_presence},
    time::ManualClock,
};
use gridsync_engine::SyncConfig;
use gridsync_harness::{RemoteHub, TestClient, TestNetwork};
use serde_json::json;

type TestResult = Result<(), Box<dyn std::error::Error>>;

const START: u64 = 1_700_000_000_000;

fn presence_path() -> DocPath {
    DocPath::new("sheet/meta/presence")
}

// ============================================================================
// Presence
// ============================================================================

#[test]
fn collaborators_see_each_others_edits() -> TestResult {
    let mut net = TestNetwork::new(SyncConfig::for_sheet("sheet"), START);
    let a = net.add_client()?;
    let b = net.add_client()?;

    net.client_mut(a).set(4, "C", "x")?;
    net.advance(0)?;

    let a_key = net.client(a).client_id.to_string();
    let seen = net.client(b).sync.collaborators();
    assert_eq!(seen.len(), 1);
    let entry = &seen[&a_key];
    assert_eq!(entry.edit_index, 1);
    assert_eq!(entry.last_edit, EditRect::cell(4, 2));

    // b announced itself on its first tick.
    net.advance(0)?;
    let b_key = net.client(b).client_id.to_string();
    assert!(net.client(a).sync.collaborators().contains_key(&b_key));
    assert!(!net.client(a).sync.collaborators().contains_key(&a_key));
    Ok(())
}

#[test]
fn silent_collaborator_is_pruned() -> TestResult {
    let config = SyncConfig::for_sheet("sheet");
    let stale_after = config.presence.stale_after_ms;
    let mut net = TestNetwork::new(config, START);
    let a = net.add_client()?;
    let b = net.add_client()?;
    net.advance(0)?;
    net.advance(0)?;
    let b_key = net.client(b).client_id.to_string();
    assert!(net.client(a).sync.collaborators().contains_key(&b_key));

    net.client(b).go_offline();
    net.advance(stale_after + 1)?;

    assert!(net.client(a).sync.collaborators().is_empty());
    let doc = net.hub.doc(&presence_path()).unwrap();
    let entries = decode_presence(&doc)?;
    assert!(!entries.contains_key(&b_key));
    assert_eq!(entries[&net.client(a).client_id.to_string()].last_ping_at, START + stale_after + 1);
    Ok(())
}

#[test]
fn offline_edits_do_not_publish_presence() -> TestResult {
    let mut net = TestNetwork::new(SyncConfig::for_sheet("sheet"), START);
    let a = net.add_client()?;
    net.client(a).go_offline();
    net.client_mut(a).set(0, "A", 1)?;
    assert!(net.hub.doc(&presence_path()).is_none());
    Ok(())
}

// ============================================================================
// Rows and viewports
// ============================================================================

#[test]
fn reorder_moves_blocks_for_everyone() -> TestResult {
    let hub = RemoteHub::new();
    let clock = ManualClock::new(START);
    let mut a = TestClient::new(&hub, &clock, SyncConfig::for_sheet("sheet"))?;
    a.sync.start()?;
    a.set(0, "A", "first")?;
    a.set(1, "A", "second")?;
    a.settle()?;

    let report = a.sync.reorder_rows(&[(0, 1), (1, 0)])?.expect("blocks moved");
    assert_eq!(report.confirmed.len(), 2);
    assert_eq!(a.value(0, "A"), Some(json!("second")));
    assert_eq!(a.value(1, "A"), Some(json!("first")));

    let moved: Vec<Block> = hub
        .docs_in(&DocPath::new("sheet/blocks"))
        .into_iter()
        .filter_map(|(_, doc)| Block::from_value(&doc).ok())
        .collect();
    let first = moved.iter().find(|b| b.data.get("A") == Some(&json!("first"))).unwrap();
    assert_eq!(first.row, 1);

    let mut b = TestClient::new(&hub, &clock, SyncConfig::for_sheet("sheet"))?;
    b.sync.start()?;
    assert_eq!(b.load(0, 10)?, 2);
    assert_eq!(b.value(0, "A"), Some(json!("second")));
    assert_eq!(b.value(1, "A"), Some(json!("first")));
    Ok(())
}

#[test]
fn reorder_of_empty_rows_sends_nothing() -> TestResult {
    let hub = RemoteHub::new();
    let clock = ManualClock::new(START);
    let mut a = TestClient::new(&hub, &clock, SyncConfig::for_sheet("sheet"))?;
    a.sync.start()?;
    assert!(a.sync.reorder_rows(&[(7, 8)])?.is_none());
    assert_eq!(hub.write_count(), 0);
    Ok(())
}

#[test]
fn resident_rows_are_not_fetched_twice() -> TestResult {
    let hub = RemoteHub::new();
    let clock = ManualClock::new(START);
    let mut writer = TestClient::new(&hub, &clock, SyncConfig::for_sheet("sheet"))?;
    writer.sync.start()?;
    writer.set(20, "A", "far")?;
    writer.settle()?;

    let mut reader = TestClient::new(&hub, &clock, SyncConfig::for_sheet("sheet"))?;
    reader.sync.start()?;
    assert!(reader.sync.known_rows().iter().any(|r| r.contains(20)));
    assert_eq!(reader.load(0, 30)?, 1);
    assert_eq!(reader.load(10, 25)?, 0);
    assert_eq!(reader.value(20, "A"), Some(json!("far")));

    // Later writes reach the reader through its subscription.
    writer.set(20, "A", "farther")?;
    writer.settle()?;
    reader.tick()?;
    assert_eq!(reader.value(20, "A"), Some(json!("farther")));
    Ok(())
}
