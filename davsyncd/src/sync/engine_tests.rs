use super::*;
use crate::sync::testing::MemoryRemote;
use crate::sync_log::LogLevel;
use filetime::FileTime;
use sqlx::sqlite::SqlitePoolOptions;
use tempfile::{TempDir, tempdir};

struct Fixture {
    dir: TempDir,
    remote: MemoryRemote,
    store: SyncStateStore,
    log: SyncLog,
}

impl Fixture {
    async fn new() -> Self {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = SyncStateStore::from_pool(pool);
        store.init().await.unwrap();
        Self {
            dir: tempdir().unwrap(),
            remote: MemoryRemote::new(),
            store,
            log: SyncLog::default(),
        }
    }

    fn engine(&self) -> SyncEngine<'_> {
        SyncEngine::new(&self.remote, &self.store, self.dir.path(), &self.log)
    }

    fn local(&self, relative: &str) -> std::path::PathBuf {
        local_path_for(self.dir.path(), relative).unwrap()
    }

    fn write_local(&self, relative: &str, data: &[u8], mtime_secs: i64) {
        let path = self.local(relative);
        std::fs::write(&path, data).unwrap();
        filetime::set_file_mtime(&path, FileTime::from_unix_time(mtime_secs, 0)).unwrap();
    }

    fn warnings(&self) -> Vec<String> {
        self.log
            .entries()
            .into_iter()
            .filter(|entry| entry.level == LogLevel::Warning)
            .map(|entry| entry.message)
            .collect()
    }
}

#[tokio::test]
async fn pulls_remote_only_file_and_records_baseline() {
    let fx = Fixture::new().await;
    fx.remote.put_file("/library.json", b"{\"name\":\"Tasks\"}");

    let outcome = fx.engine().sync_directory("/", None, false).await;

    assert_eq!(outcome.actions, 1);
    assert!(outcome.success());
    assert!(outcome.changed.contains("library.json"));
    assert_eq!(
        std::fs::read(fx.local("/library.json")).unwrap(),
        b"{\"name\":\"Tasks\"}"
    );
    let record = fx.store.record("/", "library.json").await.unwrap().unwrap();
    let tag = fx.remote.change_tag("/library.json").await.unwrap();
    assert_eq!(record.etag, tag);
    let mtime = local_fs::modified_at(&fx.local("/library.json")).await.unwrap();
    assert_eq!(record.modified, mtime);
}

#[tokio::test]
async fn unchanged_entries_cause_no_action() {
    let fx = Fixture::new().await;
    fx.remote.put_file("/a.json", b"a");
    fx.engine().sync_directory("/", None, false).await;
    fx.remote.clear_calls();

    let outcome = fx.engine().sync_directory("/", None, false).await;

    assert_eq!(outcome, LevelOutcome::default());
    assert_eq!(fx.remote.calls(), vec!["LIST /".to_string()]);
}

#[tokio::test]
async fn pushes_local_edit_without_pulling() {
    let fx = Fixture::new().await;
    fx.remote.put_file("/a.json", b"old");
    fx.engine().sync_directory("/", None, false).await;

    fx.write_local("/a.json", b"new", 1_800_000_000);
    fx.remote.clear_calls();
    let outcome = fx.engine().sync_directory("/", None, false).await;

    assert_eq!(outcome.actions, 1);
    assert_eq!(fx.remote.file("/a.json").unwrap(), b"new");
    assert!(!fx.remote.calls().iter().any(|call| call.starts_with("GET")));
    let record = fx.store.record("/", "a.json").await.unwrap().unwrap();
    assert_eq!(record.modified, Some(1_800_000_000_000));
    assert_eq!(record.etag, fx.remote.change_tag("/a.json").await.unwrap());
}

#[tokio::test]
async fn remote_wins_when_both_sides_changed() {
    let fx = Fixture::new().await;
    fx.remote.put_file("/a.json", b"v0");
    fx.engine().sync_directory("/", None, false).await;

    fx.write_local("/a.json", b"local edit", 1_800_000_000);
    fx.remote.put_file("/a.json", b"remote edit");
    let remote_tag = fx.remote.change_tag("/a.json").await.unwrap();

    let outcome = fx.engine().sync_directory("/", None, false).await;

    assert_eq!(outcome.actions, 1);
    assert_eq!(std::fs::read(fx.local("/a.json")).unwrap(), b"remote edit");
    assert_eq!(fx.remote.file("/a.json").unwrap(), b"remote edit");
    let record = fx.store.record("/", "a.json").await.unwrap().unwrap();
    assert_eq!(record.etag, remote_tag);
    assert_eq!(
        record.modified,
        local_fs::modified_at(&fx.local("/a.json")).await.unwrap()
    );
    assert!(
        fx.warnings()
            .iter()
            .any(|message| message.contains("changed on both sides"))
    );
}

#[tokio::test]
async fn type_conflict_is_repeated_no_op() {
    let fx = Fixture::new().await;
    std::fs::create_dir(fx.local("/notes")).unwrap();
    fx.remote.put_file("/notes", b"file");

    for _ in 0..2 {
        let outcome = fx.engine().sync_directory("/", None, false).await;
        assert_eq!(outcome.actions, 0);
        assert_eq!(outcome.conflicts, 1);
        assert!(outcome.success());
    }

    assert!(fx.local("/notes").is_dir());
    assert_eq!(fx.remote.file("/notes").unwrap(), b"file");
    assert!(fx.store.record("/", "notes").await.unwrap().is_none());
    assert_eq!(fx.warnings().len(), 2);
}

#[tokio::test]
async fn local_delete_propagates_and_drops_row() {
    let fx = Fixture::new().await;
    fx.remote.put_file("/a.json", b"a");
    fx.engine().sync_directory("/", None, false).await;

    std::fs::remove_file(fx.local("/a.json")).unwrap();
    let outcome = fx.engine().sync_directory("/", None, false).await;

    assert_eq!(outcome.actions, 1);
    assert!(!fx.remote.exists("/a.json"));
    assert!(fx.store.record("/", "a.json").await.unwrap().is_none());
}

#[tokio::test]
async fn remote_delete_of_directory_purges_rows_below_it() {
    let fx = Fixture::new().await;
    fx.remote.mkdir("/2024");
    fx.remote.mkdir("/2024/3");
    fx.remote.put_file("/2024/3/a.json", b"a");
    let engine = fx.engine();
    engine.sync_directory("/", None, false).await;
    engine.sync_directory("/2024", None, false).await;
    engine.sync_directory("/2024/3", None, false).await;
    assert!(fx.local("/2024/3/a.json").exists());

    fx.remote.remove("/2024");
    let outcome = engine.sync_directory("/", None, false).await;

    assert_eq!(outcome.actions, 1);
    assert!(!fx.local("/2024").exists());
    assert!(fx.store.records("/").await.unwrap().is_empty());
    assert!(fx.store.records("/2024").await.unwrap().is_empty());
    assert!(fx.store.records("/2024/3").await.unwrap().is_empty());
}

#[tokio::test]
async fn failed_listing_fails_level_without_touching_local_files() {
    let fx = Fixture::new().await;
    fx.remote.put_file("/a.json", b"a");
    fx.engine().sync_directory("/", None, false).await;

    fx.remote.fail("/");
    let outcome = fx.engine().sync_directory("/", None, false).await;

    assert_eq!(outcome, LevelOutcome::failed());
    assert!(fx.local("/a.json").exists());
    assert!(fx.store.record("/", "a.json").await.unwrap().is_some());
}

#[tokio::test]
async fn failed_entry_does_not_stop_the_level() {
    let fx = Fixture::new().await;
    fx.write_local("/a.json", b"a", 1_700_000_000);
    fx.write_local("/b.json", b"b", 1_700_000_000);
    fx.remote.fail("/a.json");

    let outcome = fx.engine().sync_directory("/", None, false).await;

    assert_eq!(outcome.actions, 1);
    assert_eq!(outcome.failures, 1);
    assert!(fx.remote.exists("/b.json"));
    assert!(fx.store.record("/", "a.json").await.unwrap().is_none());
    assert!(
        fx.warnings()
            .iter()
            .any(|message| message.starts_with("push of /a.json failed")
                && message.ends_with("retrying next run"))
    );
}

#[test]
fn failure_hint_follows_error_class() {
    let status = |status| {
        EngineError::Remote(DavError::Status {
            status,
            body: String::new(),
        })
    };
    assert_eq!(
        failure_hint(&status(davsync_core::StatusCode::UNAUTHORIZED)),
        "; check username and password"
    );
    assert_eq!(
        failure_hint(&status(davsync_core::StatusCode::NOT_FOUND)),
        "; gone on the server"
    );
    assert_eq!(
        failure_hint(&status(davsync_core::StatusCode::TOO_MANY_REQUESTS)),
        "; server is throttling, retrying next run"
    );
    assert_eq!(
        failure_hint(&status(davsync_core::StatusCode::BAD_GATEWAY)),
        "; retrying next run"
    );
    assert_eq!(
        failure_hint(&status(davsync_core::StatusCode::FORBIDDEN)),
        "; check username and password"
    );
    assert_eq!(
        failure_hint(&EngineError::MissingChangeTag("/a.json".into())),
        ""
    );
}

#[tokio::test]
async fn push_only_level_skips_remote_listing() {
    let fx = Fixture::new().await;
    std::fs::create_dir(fx.local("/2024")).unwrap();
    fx.write_local("/2024/a.json", b"a", 1_700_000_000);
    fx.remote.mkdir("/2024");
    fx.remote.put_file("/2024/remote-only.json", b"r");

    let outcome = fx.engine().sync_directory("/2024", None, true).await;

    assert_eq!(outcome.actions, 1);
    assert_eq!(fx.remote.file("/2024/a.json").unwrap(), b"a");
    assert!(!fx.local("/2024/remote-only.json").exists());
    assert!(!fx.remote.calls().iter().any(|call| call.starts_with("LIST")));
}

#[tokio::test]
async fn pushes_new_directory_with_mkcol() {
    let fx = Fixture::new().await;
    std::fs::create_dir(fx.local("/2024")).unwrap();

    let outcome = fx.engine().sync_directory("/", None, false).await;

    assert_eq!(outcome.actions, 1);
    assert!(fx.remote.is_dir("/2024"));
    assert!(fx.remote.calls().contains(&"MKCOL /2024".to_string()));
    let record = fx.store.record("/", "2024").await.unwrap().unwrap();
    assert_eq!(record.etag, fx.remote.change_tag("/2024").await.unwrap());
}

#[tokio::test]
async fn upload_without_etag_falls_back_to_change_tag() {
    let fx = Fixture::new().await;
    fx.remote.omit_upload_etag();
    fx.write_local("/a.json", b"a", 1_700_000_000);

    fx.engine().sync_directory("/", None, false).await;

    let record = fx.store.record("/", "a.json").await.unwrap().unwrap();
    assert!(record.etag.is_some());
    assert_eq!(record.etag, fx.remote.change_tag("/a.json").await.unwrap());
}

#[tokio::test]
async fn refresh_and_invalidate_baseline() {
    let fx = Fixture::new().await;
    fx.remote.mkdir("/2024");
    let engine = fx.engine();
    engine.sync_directory("/", None, false).await;

    fx.remote.put_file("/2024/a.json", b"a");
    engine.refresh_baseline("/2024").await.unwrap();
    let record = fx.store.record("/", "2024").await.unwrap().unwrap();
    assert_eq!(record.etag, fx.remote.change_tag("/2024").await.unwrap());

    engine.invalidate_baseline("/2024").await.unwrap();
    let record = fx.store.record("/", "2024").await.unwrap().unwrap();
    assert_eq!(record.etag, None);
    assert!(record.modified.is_some());
}
