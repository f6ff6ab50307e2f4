//! Integration test for the SQLite local store.
//!
//! Exercises: open (WAL + migration), save/load of the thread collection,
//! tombstones, preferences, reopening the same file, and driving an engine
//! across a restart.

use std::sync::Arc;

use chrono::Utc;
use pinthread_core::store::{LocalStore, SqliteStore};
use pinthread_core::types::{Anchor, Comment, CommentId, RemoteId, Scope, SyncStatus, Thread, ThreadId, ThreadStatus};
use pinthread_core::{Engine, EngineConfig};

fn temp_db_path() -> std::path::PathBuf {
    let dir = tempfile::TempDir::new().unwrap();
    dir.keep().join("pinthread.db")
}

fn sample_thread(id: &str, route: &str) -> Thread {
    Thread {
        id: ThreadId::from(id),
        anchor: Anchor::Selector {
            selector: "main > h1".to_owned(),
            offset: Some((0.25, 0.5)),
        },
        scope: Scope::new(route, "v3"),
        comments: vec![Comment {
            id: CommentId::from(format!("{id}-c1").as_str()),
            author: Some("ana".to_owned()),
            text: "title wraps badly".to_owned(),
            created_at: Utc::now(),
            remote_id: Some(RemoteId::from("501")),
            parent_local_id: None,
            parent_remote_id: None,
            unpushed_edit: false,
        }],
        remote_issue_id: Some(RemoteId::from("12")),
        remote_issue_url: Some("https://tracker.test/issues/12".to_owned()),
        sync_status: SyncStatus::Synced,
        sync_error: None,
        status: ThreadStatus::Open,
        unpushed_status: false,
        created_at: Utc::now(),
    }
}

#[test]
fn full_store_lifecycle() {
    let path = temp_db_path();
    let store = SqliteStore::open(&path).unwrap();
    assert_eq!(store.schema_version().unwrap(), 1, "schema_version should be 1");

    // Verify WAL mode on a second raw connection.
    {
        let raw = rusqlite::Connection::open(&path).unwrap();
        let journal: String = raw.query_row("PRAGMA journal_mode", [], |r| r.get(0)).unwrap();
        assert_eq!(journal, "wal", "journal_mode should be wal");
        let tables: i64 = raw
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'
                 AND name IN ('threads', 'tombstones', 'preferences')",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(tables, 3, "all v1 tables should exist");
    }

    assert!(store.load().unwrap().is_empty(), "fresh store is empty");

    let threads = vec![sample_thread("b", "/pricing"), sample_thread("a", "/about")];
    store.save(&threads).unwrap();
    assert_eq!(store.load().unwrap(), threads, "collection order is preserved");

    // Saving a smaller collection replaces, not appends.
    store.save(&threads[..1]).unwrap();
    assert_eq!(store.load().unwrap().len(), 1);

    store.save_tombstones(&[RemoteId::from("7")]).unwrap();
    store.save_tombstones(&[RemoteId::from("7"), RemoteId::from("8")]).unwrap();
    let mut tombstones = store.load_tombstones().unwrap();
    tombstones.sort();
    assert_eq!(tombstones, vec![RemoteId::from("7"), RemoteId::from("8")]);

    store.set_preference("scope", "/pricing@v3").unwrap();
    store.set_preference("scope", "/about@v3").unwrap();
    assert_eq!(store.preference("scope").unwrap().as_deref(), Some("/about@v3"));
    assert_eq!(store.preference("missing").unwrap(), None);

    drop(store);
    let reopened = SqliteStore::open(&path).unwrap();
    assert_eq!(reopened.load().unwrap(), threads[..1].to_vec(), "threads survive reopen");
    assert_eq!(reopened.load_tombstones().unwrap().len(), 2, "tombstones survive reopen");
    assert_eq!(reopened.schema_version().unwrap(), 1, "migration is idempotent");
}

#[test]
fn unreadable_rows_are_skipped() {
    let path = temp_db_path();
    let store = SqliteStore::open(&path).unwrap();
    store.save(&[sample_thread("good", "/")]).unwrap();
    {
        let raw = rusqlite::Connection::open(&path).unwrap();
        raw.execute(
            "INSERT INTO threads (id, route, version, position, payload) VALUES ('bad', '/', 'v3', 1, 'not json')",
            [],
        )
        .unwrap();
    }
    let loaded = store.load().unwrap();
    assert_eq!(loaded.len(), 1);
    assert_eq!(loaded[0].id, ThreadId::from("good"));
}

#[tokio::test]
async fn engine_state_survives_restart() {
    let path = temp_db_path();
    let scope = Scope::new("/checkout", "v1");

    let (thread_id, comment_id) = {
        let store = Arc::new(SqliteStore::open(&path).unwrap());
        let engine = Engine::new(store, None, EngineConfig::default()).unwrap();
        let thread_id = engine.create_thread(Anchor::position(0.3, 0.7), scope.clone());
        let comment_id = engine.add_comment(&thread_id, "total is off by one", None).unwrap();
        engine.close_thread(&thread_id).unwrap();
        (thread_id, comment_id)
    };

    let store = Arc::new(SqliteStore::open(&path).unwrap());
    let engine = Engine::new(store, None, EngineConfig::default()).unwrap();
    let thread = engine.thread(&thread_id).expect("thread restored");
    assert_eq!(thread.status, ThreadStatus::Closed);
    assert_eq!(thread.sync_status, SyncStatus::Local);
    assert_eq!(thread.comments.len(), 1);
    assert_eq!(thread.comments[0].id, comment_id);
    assert_eq!(engine.threads_for_scope(&scope).len(), 1);

    // Timestamps keep increasing after a restart.
    let next = engine.add_comment(&thread_id, "still off", None).unwrap();
    let thread = engine.thread(&thread_id).unwrap();
    let new_comment = thread.comment(&next).unwrap();
    assert!(new_comment.created_at > thread.comments[0].created_at);
}
