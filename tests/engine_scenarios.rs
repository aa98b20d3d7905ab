mod common;

use common::{engine, engine_with, full_id};
use projctx::{ActionKind, CommitRecord, ReadStatus, SemanticContext, SyncMode, Table};
use serde_json::{json, Value};
use std::fs;
use std::sync::Arc;

fn commit(n: u32, summary: &str) -> CommitRecord {
    CommitRecord {
        commit_id_full: full_id(n),
        summary: summary.to_string(),
        ..CommitRecord::default()
    }
}

#[test]
fn history_keeps_the_newest_max_commits() {
    let t = engine();
    t.engine.create_project("demo", "").expect("create");
    t.engine
        .set_config_value("demo", "commit_history", json!({"max_commits": 3}))
        .expect("config");

    for n in 1..=5 {
        t.engine.append_commit("demo", commit(n, &format!("change {n}"))).expect("append");
    }

    let history = t.engine.commit_history("demo").expect("history");
    assert_eq!(history.history.len(), 3);
    let head = history.last_commit.as_ref().expect("head");
    assert_eq!(head.commit_id_full, full_id(5));
    assert_eq!(head.commit_id, full_id(5)[..7]);
    assert_eq!(Some(&history.history[0]), history.last_commit.as_ref());
    let ids: Vec<_> = history.history.iter().map(|c| c.summary.as_str()).collect();
    assert_eq!(ids, vec!["change 5", "change 4", "change 3"]);
}

#[test]
fn re_appending_a_commit_replaces_it() {
    let t = engine();
    t.engine.create_project("demo", "").expect("create");
    for n in 1..=3 {
        t.engine.append_commit("demo", commit(n, "first")).expect("append");
    }
    t.engine.append_commit("demo", commit(2, "amended")).expect("append");

    let history = t.engine.commit_history("demo").expect("history");
    let summaries: Vec<_> = history.history.iter().map(|c| c.summary.as_str()).collect();
    assert_eq!(summaries, vec!["amended", "first", "first"]);
    assert_eq!(history.history.iter().filter(|c| c.commit_id_full == full_id(2)).count(), 1);
}

#[test]
fn corrupt_memory_loads_as_default_for_the_project() {
    let t = engine();
    let layout = t.engine.create_project("demo", "described").expect("create");
    fs::write(layout.memory(), "{ \"actions\": [ oops").expect("corrupt");

    let outcome = t.engine.memory("demo").expect("memory");

    assert_eq!(outcome.status, ReadStatus::Corrupt);
    assert_eq!(outcome.value.project_name, "demo");
    assert!(outcome.value.actions.is_empty());
    let quarantined = fs::read_dir(layout.state_dir())
        .expect("list")
        .filter_map(|e| e.ok())
        .any(|e| e.file_name().to_string_lossy().starts_with("memory.json.corrupted_"));
    assert!(quarantined);

    // the next write starts from the default and succeeds
    let memory = t
        .engine
        .record_action("demo", &ActionKind::Analyze, "after corruption", None)
        .expect("record");
    assert_eq!(memory.stats.analyses, 1);
}

#[test]
fn bare_project_context_has_null_readme_and_commit() {
    let t = engine();
    t.engine.create_project("bare", "").expect("create");

    let ctx = t.engine.generate_context("bare");

    assert!(ctx.error.is_none());
    let raw: Value = serde_json::to_value(&ctx).expect("encode");
    assert_eq!(raw["readme"]["preview"], Value::Null);
    assert_eq!(raw["commits"]["last_commit"], Value::Null);
    assert_eq!(raw["snapshot"]["status"], "unknown");
}

#[test]
fn indexing_unchanged_context_twice_is_idempotent() {
    let t = engine();
    let layout = t.engine.create_project("demo", "").expect("create");
    t.engine.append_commit("demo", commit(1, "one")).expect("append");
    t.engine.append_commit("demo", commit(2, "two")).expect("append");

    t.engine.generate_context("demo");
    let first = t.engine.indexer().row_count(&layout, Table::Commits).expect("count");
    t.engine.generate_context("demo");
    let second = t.engine.indexer().row_count(&layout, Table::Commits).expect("count");

    assert_eq!(first, 2);
    assert_eq!(second, first);
    assert_eq!(t.engine.indexer().row_count(&layout, Table::Snapshots).expect("count"), 1);
}

#[test]
fn legacy_history_migrates_once() {
    let t = engine();
    let layout = t.engine.create_project("legacy", "").expect("create");
    let lines: String = (1..=4)
        .map(|n| {
            let record = json!({"commit_id": &full_id(n)[..7], "commit_id_full": full_id(n), "summary": format!("old {n}")});
            format!("{record}\n")
        })
        .collect();
    fs::write(layout.legacy_commit_log(), lines).expect("legacy log");
    fs::write(
        layout.legacy_commit_report(),
        json!({"commit_id": &full_id(9)[..7], "commit_id_full": full_id(9), "summary": "report head"}).to_string(),
    )
    .expect("legacy report");

    let migrated = t.engine.migrate_legacy_history("legacy").expect("migrate").expect("migrated");
    assert_eq!(migrated.history.len(), 3);
    assert_eq!(migrated.last_commit.as_ref().map(|c| c.summary.as_str()), Some("report head"));
    assert_eq!(migrated.history[1].summary, "old 4");

    let before = fs::read(layout.commit_history()).expect("history file");
    assert!(t.engine.migrate_legacy_history("legacy").expect("migrate again").is_none());
    assert_eq!(fs::read(layout.commit_history()).expect("history file"), before);
}

#[test]
fn history_follows_the_external_log_when_stale() {
    let t = engine();
    t.engine.create_project("tracked", "").expect("create");
    for n in 1..=4 {
        t.log.push(&full_id(n), &format!("external {n}"), &["src/main.rs"]);
    }

    let history = t.engine.commit_history("tracked").expect("history");
    assert_eq!(history.history.len(), 3);
    assert_eq!(history.last_commit.as_ref().map(|c| c.summary.as_str()), Some("external 4"));
    assert_eq!(history.history[0].timestamp, "2024-03-01T11:00:00.000000Z");

    t.log.push(&full_id(5), "external 5", &[]);
    let history = t.engine.commit_history("tracked").expect("history");
    assert_eq!(history.last_commit.as_ref().map(|c| c.commit_id_full.clone()), Some(full_id(5)));
}

#[test]
fn captured_head_commit_carries_file_previews() {
    let t = engine();
    let layout = t.engine.create_project("capture", "").expect("create");
    fs::create_dir_all(layout.dir().join("src")).expect("src");
    fs::write(layout.dir().join("src/lib.rs"), "pub fn one() {}\npub fn two() {}\npub fn three() {}\npub fn four() {}\n")
        .expect("source");
    t.log.push(&full_id(7), "feat: add functions", &["src/lib.rs", ".projctx/memory.json", "gone.rs"]);

    let record = t.engine.capture_head_commit("capture").expect("capture").expect("head");

    assert_eq!(record.commit_id, full_id(7)[..7]);
    assert_eq!(record.file_contexts.len(), 1);
    assert_eq!(record.file_contexts["src/lib.rs"].lines().count(), 3);
    assert!(record.is_major());
    assert_eq!(t.engine.snapshot("capture").expect("snapshot").last_commit, Some(record.commit_id.clone()));
    assert_eq!(t.engine.recent_events("capture", 1).expect("events")[0].kind, "commit");
    assert_eq!(t.engine.memory("capture").expect("memory").value.stats.commits, 1);
}

#[test]
fn trimmed_context_forces_full_resync() {
    let t = engine_with(|config| config.limits.json_max_size_mb = 0.01);
    let layout = t.engine.create_project("big", "").expect("create");
    t.engine.append_commit("big", commit(1, "one")).expect("append");
    t.engine
        .set_semantic_context(
            "big",
            SemanticContext {
                keywords: (0..2000).map(|i| format!("keyword-{i}")).collect(),
                ..SemanticContext::default()
            },
        )
        .expect("semantic");
    t.engine.generate_context("big");
    let first = t.engine.sync_index("big", false).expect("sync");
    assert_eq!(first.mode_for("context_full.json"), Some(SyncMode::Incremental));

    let report = t.engine.maintain_project("big").expect("maintain");
    assert!(report.unified_trim);
    assert!(report.json_trimmed.iter().any(|f| f == "context_full.json"));
    let pending = t.engine.indexer().sync_state(&layout, "context_full.json").expect("ledger").expect("row");
    assert_eq!(pending.sync_status, "pending");

    let second = t.engine.sync_index("big", false).expect("sync");
    assert_eq!(second.mode_for("context_full.json"), Some(SyncMode::Full));
    let synced = t.engine.indexer().sync_state(&layout, "context_full.json").expect("ledger").expect("row");
    assert_eq!(synced.sync_status, "synced");
    assert!(!synced.needs_full_resync());
    assert_eq!(t.engine.indexer().row_count(&layout, Table::Commits).expect("count"), 1);
}

#[test]
fn rotating_events_log_forces_full_resync() {
    let t = engine();
    let layout = t.engine.create_project("chatty", "").expect("create");
    for i in 0..20 {
        t.engine.log_event("chatty", "note", json!({ "n": i })).expect("event");
    }
    let first = t.engine.sync_index("chatty", false).expect("sync");
    assert_eq!(first.mode_for("events.log"), Some(SyncMode::Incremental));
    assert_eq!(t.engine.indexer().row_count(&layout, Table::Events).expect("count"), 20);

    let dropped = t.engine.maintain(&layout.events_log(), 0.000001, 4).expect("maintain");
    assert!(dropped > 0);
    let pending = t.engine.indexer().sync_state(&layout, "events.log").expect("ledger").expect("row");
    assert_eq!(pending.sync_status, "pending");
    assert_eq!(pending.row_count_before_trim, Some(20));

    let second = t.engine.sync_index("chatty", false).expect("sync");
    assert_eq!(second.mode_for("events.log"), Some(SyncMode::Full));
    let lines = fs::read_to_string(layout.events_log()).expect("events").lines().count();
    assert_eq!(t.engine.indexer().row_count(&layout, Table::Events).expect("count"), lines as i64);
}

#[test]
fn rotating_a_foreign_log_leaves_the_ledger_alone() {
    let t = engine();
    let layout = t.engine.create_project("quiet", "").expect("create");
    let path = t.tmp.path().join("events.log");
    let body: String = (0..50).map(|i| format!("{{\"n\":{i}}}\n")).collect();
    fs::write(&path, body).expect("write");

    assert_eq!(t.engine.maintain(&path, 10.0, 10).expect("maintain"), 45);
    assert!(t.engine.indexer().sync_state(&layout, "events.log").expect("ledger").is_none());
    assert!(!t.tmp.path().join("context.db").exists());
}

#[test]
fn concurrent_producers_lose_no_actions() {
    let t = engine();
    t.engine.create_project("busy", "").expect("create");
    let engine = Arc::new(t.engine);

    let workers: Vec<_> = (0..4)
        .map(|w| {
            let engine = Arc::clone(&engine);
            std::thread::spawn(move || {
                for i in 0..25 {
                    engine
                        .record_action("busy", &ActionKind::Execute, &format!("w{w}-{i}"), None)
                        .expect("record");
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().expect("worker");
    }

    let memory = engine.memory("busy").expect("memory").value;
    assert_eq!(memory.stats.executions, 100);
    assert_eq!(memory.stats.total_actions, 100);
    assert_eq!(memory.actions.len(), 100);
}
