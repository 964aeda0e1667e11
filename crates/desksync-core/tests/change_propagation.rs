//! Two runtimes sharing one database and one broadcast hub behave like two
//! window processes: a mutation in one is observed by the other without any
//! direct coupling.

use std::sync::Arc;
use std::time::Duration;

use desksync_core::coordinator::testing::{MemoryScaffold, RecordingFocus};
use desksync_core::{
    AutoConfirm, Channel, Db, MemoryTransport, Platform, PlatformHooks, Runtime, Settings,
    StaticProbe, ThemeMode, ThemePref, REPO_RESET_EVENT,
};
use serde_json::json;

fn platform(hub: &MemoryTransport) -> Platform {
    Platform {
        transport: Arc::new(hub.clone()),
        hooks: PlatformHooks {
            probe: Arc::new(StaticProbe::alive_all()),
            focus: Arc::new(RecordingFocus::new()),
            scaffold: Arc::new(MemoryScaffold::new()),
            prompt: Arc::new(AutoConfirm(true)),
        },
    }
}

async fn boot(path: &std::path::Path, hub: &MemoryTransport) -> Runtime {
    Runtime::init_with_db(Db::open(path).unwrap(), Settings::default(), platform(hub))
        .await
        .unwrap()
}

#[tokio::test]
async fn theme_change_in_one_window_reaches_the_other() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("app.db");
    let hub = MemoryTransport::new();

    let window_a = boot(&db_path, &hub).await;
    let window_b = boot(&db_path, &hub).await;

    let mut changes = window_b.service().listen_key("light").unwrap();

    ThemePref { mode: ThemeMode::Dark }
        .save(window_a.service(), true)
        .unwrap();

    let payload = tokio::time::timeout(Duration::from_secs(5), changes.recv())
        .await
        .expect("window B never observed the theme change");
    assert_eq!(payload, Some(json!({"key": "light"})));

    assert_eq!(
        ThemePref::load(window_b.service()).unwrap(),
        Some(ThemePref { mode: ThemeMode::Dark })
    );

    window_a.close();
    window_b.close();
}

#[tokio::test]
async fn repository_added_in_one_window_appears_in_the_other() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("app.db");
    let hub = MemoryTransport::new();

    let window_a = boot(&db_path, &hub).await;
    let window_b = boot(&db_path, &hub).await;

    let mut resets = window_b
        .bus()
        .listen(&Channel::local(REPO_RESET_EVENT))
        .unwrap();

    let outcome = window_a
        .coordinator()
        .open_path(std::path::Path::new("/projects/shared-notes"))
        .await
        .unwrap();
    assert_eq!(outcome, desksync_core::OpenOutcome::Opened);

    // B's registry reloads wholesale and announces it.
    let payload = tokio::time::timeout(Duration::from_secs(5), resets.recv())
        .await
        .expect("window B never reloaded its registry");
    assert_eq!(payload, Some(json!({"length": 1})));

    let seen = window_b
        .registry()
        .find_by_path(std::path::Path::new("/projects/shared-notes"))
        .expect("repository missing from window B");
    assert_eq!(seen.name, "shared-notes");
    assert!(seen.owner.is_claimed());

    window_a.close();
    window_b.close();
}

#[tokio::test]
async fn closed_runtime_stops_observing() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("app.db");
    let hub = MemoryTransport::new();

    let window_a = boot(&db_path, &hub).await;
    let window_b = boot(&db_path, &hub).await;

    let mut changes = window_b.service().listen_key("lang").unwrap();
    window_b.close();

    window_a
        .service()
        .upsert_by_key("lang", &json!({"lang": "es"}), true)
        .unwrap();

    match tokio::time::timeout(Duration::from_millis(300), changes.recv()).await {
        Err(_) | Ok(None) => {}
        Ok(Some(payload)) => panic!("closed window still received {payload}"),
    }

    window_a.close();
}
