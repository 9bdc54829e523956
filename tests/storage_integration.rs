//! SQLite persistence integration tests.
//!
//! Every test opens its own database in a temporary directory, so nothing
//! touches `~/.scanfill`.

use std::sync::Arc;
use tempfile::TempDir;

use scanfill::fields::{FieldCatalog, FieldDescriptor, FieldRole};
use scanfill::history::{HistoryEntry, ScanHistory};
use scanfill::pattern::PatternType;
use scanfill::prefix::{Prefix, PrefixStore};
use scanfill::rules::{Action, MatchMode, Rule, RuleEngine};
use scanfill::storage::{keys, Persistence, PersistenceExt, SqliteStore};

fn open(dir: &TempDir, namespace: &str) -> Arc<dyn Persistence> {
    let path = dir.path().join("data").join("scanfill.db");
    Arc::new(SqliteStore::open(&path, namespace).unwrap())
}

// =============================================================================
// Raw store
// =============================================================================

#[test]
fn test_values_survive_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let store = open(&dir, "scanfill");
        store.save(keys::MODE, &"on").unwrap();
    }
    let store = open(&dir, "scanfill");
    assert_eq!(store.load(keys::MODE, String::new()), "on");
}

#[test]
fn test_namespaces_are_isolated() {
    let dir = TempDir::new().unwrap();
    let a = open(&dir, "desk-a");
    let b = open(&dir, "desk-b");
    a.save(keys::MODE, &"off").unwrap();

    assert_eq!(b.load(keys::MODE, "standby".to_string()), "standby");
    assert_eq!(a.load(keys::MODE, "standby".to_string()), "off");
}

#[test]
fn test_remove_deletes_key() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("scanfill.db");
    let store = SqliteStore::open(&path, "scanfill").unwrap();
    store.save(keys::MODE, &"on").unwrap();
    store.save(keys::PREFIXES, &Vec::<Prefix>::new()).unwrap();
    assert_eq!(store.keys().unwrap(), vec!["mode", "prefixes"]);

    store.remove(keys::MODE).unwrap();
    assert_eq!(store.keys().unwrap(), vec!["prefixes"]);
    assert!(store.load_value(keys::MODE).unwrap().is_none());
}

#[test]
fn test_unreadable_value_falls_back_to_default() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir, "scanfill");
    store.save(keys::RULES, &serde_json::json!({"not": "a list"})).unwrap();

    let engine = RuleEngine::load(store, MatchMode::FirstMatch);
    assert!(engine.is_empty());
}

// =============================================================================
// Component state across reopen
// =============================================================================

#[test]
fn test_rules_keep_their_order() {
    let dir = TempDir::new().unwrap();
    {
        let engine = RuleEngine::load(open(&dir, "scanfill"), MatchMode::FirstMatch);
        engine
            .add_rule(Rule::new("a", "Asset", PatternType::StartsWith, "P").with_action(Action::set("asset_tag", "${scan}")))
            .unwrap();
        engine
            .add_rule(Rule::new("b", "Serial", PatternType::Regex, r"^S\d+$").with_action(Action::set("serial_number", "${scan}")))
            .unwrap();
        engine.move_rule("b", 0).unwrap();
        engine.set_enabled("a", false).unwrap();
    }

    let engine = RuleEngine::load(open(&dir, "scanfill"), MatchMode::FirstMatch);
    let rules = engine.rules();
    assert_eq!(rules.len(), 2);
    assert_eq!(rules[0].id, "b");
    assert!(!rules[1].enabled);
}

#[test]
fn test_active_prefix_is_restored() {
    let dir = TempDir::new().unwrap();
    {
        let prefixes = PrefixStore::load(open(&dir, "scanfill"));
        prefixes.add(Prefix::new("dept", "Department", "DEPT-")).unwrap();
        prefixes.add(Prefix::new("loc", "Location", "LOC-")).unwrap();
        prefixes.activate("loc").unwrap();
    }

    let prefixes = PrefixStore::load(open(&dir, "scanfill"));
    assert_eq!(prefixes.active().unwrap().id, "loc");
    assert_eq!(prefixes.apply("A1"), "LOC-A1");
}

#[test]
fn test_history_cap_holds_after_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let history = ScanHistory::load(open(&dir, "scanfill"), 100);
        for i in 0..120 {
            let scan = format!("P{:06}", i);
            history.record(HistoryEntry::failed(&scan, &scan, "no field"));
        }
    }

    let history = ScanHistory::load(open(&dir, "scanfill"), 100);
    assert_eq!(history.len(), 100);
    assert_eq!(history.latest().unwrap().scan, "P000119");
    assert_eq!(history.entries().last().unwrap().scan, "P000020");
}

#[test]
fn test_custom_fields_persist_alongside_defaults() {
    let dir = TempDir::new().unwrap();
    {
        let catalog = FieldCatalog::load(open(&dir, "scanfill"));
        catalog
            .add(FieldDescriptor::new("cost_center", "Cost center", &[FieldRole::Read, FieldRole::Write]))
            .unwrap();
        catalog
            .add(FieldDescriptor::new("bay", "Bay", &[FieldRole::Read]))
            .unwrap();
        catalog.remove("bay").unwrap();
        // Built-ins stay put
        assert!(catalog.remove("ticket").is_err());
    }

    let catalog = FieldCatalog::load(open(&dir, "scanfill"));
    assert!(catalog.contains("cost_center"));
    assert!(!catalog.contains("bay"));
    assert!(catalog.contains("ticket"));
    assert_eq!(catalog.keys().len(), 11);
}
