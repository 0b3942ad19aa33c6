use super::*;
use crate::codec::{decode_amount, AmountSign};
use crate::compare::{compare, StateSource};
use crate::test_support::{history_record, synthetic_public_key, OldNodeFixture, StubDriver};
use std::path::PathBuf;
use tempfile::{tempdir, TempDir};

const A: &str = "00000000-0000-0000-0000-00000000000a";
const B: &str = "00000000-0000-0000-0000-00000000000b";
const STRANGER: &str = "00000000-0000-0000-0000-0000000000ff";

struct Trees {
    _dir: TempDir,
    old: PathBuf,
    new: PathBuf,
}

fn trees() -> Trees {
    let dir = tempdir().unwrap();
    let old = dir.path().join("old");
    let new = dir.path().join("new");
    std::fs::create_dir_all(&old).unwrap();
    std::fs::create_dir_all(&new).unwrap();
    Trees { _dir: dir, old, new }
}

fn two_connected_nodes(trees: &Trees) {
    OldNodeFixture::new(&trees.old, A)
        .trust_line(B, 1, 100, 40, AmountSign::NonNegative, 10)
        .history(history_record(2, B, &[0x01, 0x02, 0x03]))
        .history(history_record(2, STRANGER, &[0x04]))
        .write();
    OldNodeFixture::new(&trees.old, B)
        .port(2034)
        .trust_line(A, 1, 40, 100, AmountSign::Negative, 10)
        .history(history_record(1, A, &[0x05]))
        .write();
}

fn open_new(trees: &Trees, name: &str) -> NodeStore {
    NodeStore::new(name, &trees.old.join(name), Some(&trees.new.join(name)), false)
}

#[tokio::test]
async fn test_two_nodes_migrate_and_compare_clean() {
    let trees = trees();
    two_connected_nodes(&trees);
    let config = MigrationConfig::for_roots(&trees.old, &trees.new);
    let driver = StubDriver::new();

    let state = migrate(&config, &driver).await.unwrap();
    assert!(!state.has_errors(), "{:?}", state.errors);
    assert_eq!(state.summary.total, 2);
    assert_eq!(state.summary.succeeded, 2);
    assert_eq!(state.summary.failed, 0);
    assert!(!trees.new.join(MIGRATION_ERRORS).exists());
    assert!(trees.new.join(A).join("conf.json").exists());

    let mut store_a = open_new(&trees, A);
    let mut store_b = open_new(&trees, B);
    let contractors_a = store_a.list_contractors().unwrap();
    let contractors_b = store_b.list_contractors().unwrap();
    assert_eq!(contractors_a.len(), 1);
    assert_eq!(contractors_b.len(), 1);
    assert_eq!(contractors_a[0].id, contractors_b[0].id_on_contractor_side);
    assert_eq!(contractors_b[0].id, contractors_a[0].id_on_contractor_side);

    let line_a = store_a.list_trust_lines().unwrap()[0].id;
    let line_b = store_b.list_trust_lines().unwrap()[0].id;
    let keys = store_a.list_contractor_keys(line_a).unwrap();
    assert_eq!(keys.len(), 1);
    assert_eq!(keys[0].public_key, synthetic_public_key(B, line_b));

    // The record toward the stranger is dropped; the others are carried over.
    assert_eq!(store_a.list_history().unwrap().len(), 1);
    assert_eq!(store_b.list_history().unwrap().len(), 1);
    store_a.close().unwrap();
    store_b.close().unwrap();

    let report = compare(&config, StateSource::Store).await.unwrap();
    assert_eq!(report.total, 2);
    assert_eq!(report.pending, 0);
    assert!(report.passed(), "{:?}", report.verdicts);
    let ignored: usize = report.verdicts.iter().map(|v| v.ignored).sum();
    assert_eq!(ignored, 1);
}

#[tokio::test]
async fn test_channel_sides_mirror_each_other() {
    let trees = trees();
    two_connected_nodes(&trees);
    let config = MigrationConfig::for_roots(&trees.old, &trees.new);
    migrate(&config, &StubDriver::new()).await.unwrap();

    let audit_a = open_new(&trees, A).list_audits().unwrap().remove(0);
    let audit_b = open_new(&trees, B).list_audits().unwrap().remove(0);

    let outgoing_a = decode_amount(&audit_a.outgoing_amount).unwrap().to_normalized();
    let incoming_a = decode_amount(&audit_a.incoming_amount).unwrap().to_normalized();
    let outgoing_b = decode_amount(&audit_b.outgoing_amount).unwrap().to_normalized();
    let incoming_b = decode_amount(&audit_b.incoming_amount).unwrap().to_normalized();
    assert_eq!(outgoing_a, "100");
    assert_eq!(incoming_a, "40");
    assert_eq!(outgoing_a, incoming_b);
    assert_eq!(incoming_a, outgoing_b);

    let balance_a = decode_amount(&audit_a.balance).unwrap();
    let balance_b = decode_amount(&audit_b.balance).unwrap();
    assert_eq!(balance_a.sign, AmountSign::NonNegative);
    assert!(balance_a.mirrors(&balance_b));

    // Each side carries the other side's audit key hash.
    assert_eq!(audit_a.contractor_key_hash.as_deref(), Some(audit_b.our_key_hash.as_slice()));
    assert_eq!(audit_b.contractor_key_hash.as_deref(), Some(audit_a.our_key_hash.as_slice()));
}

#[tokio::test]
async fn test_second_run_skips_migrated_nodes() {
    let trees = trees();
    two_connected_nodes(&trees);
    let config = MigrationConfig::for_roots(&trees.old, &trees.new);
    let driver = StubDriver::new();
    migrate(&config, &driver).await.unwrap();
    let runs = driver.runs().len();
    assert!(runs > 0);

    let state = migrate(&config, &driver).await.unwrap();
    assert_eq!(state.summary.skipped, 2);
    assert_eq!(state.summary.succeeded, 0);
    assert_eq!(driver.runs().len(), runs);
    assert!(!state.has_errors());
}

#[tokio::test]
async fn test_errors_are_saved_and_busy_nodes_excluded() {
    let trees = trees();
    two_connected_nodes(&trees);
    let busy = "00000000-0000-0000-0000-00000000000c";
    OldNodeFixture::new(&trees.old, busy)
        .port(2035)
        .pending_transaction("00000000-0000-0000-0000-000000000777")
        .write();
    OldNodeFixture::new(&trees.old, "00000000-0000-0000-0000-00000000000d")
        .port(2036)
        .trust_line(STRANGER, 1, 10, 0, AmountSign::NonNegative, 0)
        .write();
    let config = MigrationConfig::for_roots(&trees.old, &trees.new);

    let state = migrate(&config, &StubDriver::new()).await.unwrap();
    assert_eq!(state.summary.total, 4);
    assert_eq!(state.summary.failed, 1);
    assert_eq!(state.summary.succeeded, 3);
    assert!(!trees.new.join(busy).exists());

    let saved: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(trees.new.join(MIGRATION_ERRORS)).unwrap()).unwrap();
    let entries = saved.as_object().unwrap();
    assert_eq!(entries.len(), 2);
    assert!(entries.values().any(|e| e["node"] == busy));
    assert!(entries.values().any(|e| e["contractor"] == STRANGER));
}

#[tokio::test]
async fn test_base_address_numbers_generated_nodes() {
    let trees = trees();
    two_connected_nodes(&trees);
    let mut config = MigrationConfig::for_roots(&trees.old, &trees.new);
    config.base_address = Some("10.0.0.1:3000".to_string());
    migrate(&config, &StubDriver::new()).await.unwrap();

    let addresses: Vec<String> = [A, B]
        .iter()
        .map(|name| {
            crate::inventory::read_migrated_address(&trees.new.join(name))
                .unwrap()
                .to_string()
        })
        .collect();
    assert_eq!(addresses[0], "10.0.0.1:3000");
    assert_ne!(addresses[0], addresses[1]);
}
