//! Exclusive-ownership protocol across simulated processes.
//!
//! Each "process" is a full service/registry/coordinator stack with its own
//! pid, sharing the database file and the broadcast hub with the others.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use desksync_core::coordinator::testing::{MemoryScaffold, RecordingFocus};
use desksync_core::{
    AutoConfirm, ConfigService, Db, EventBus, MemoryTransport, OpenOutcome, Owner,
    OwnershipCoordinator, PlatformHooks, ProcessProbe, RepoRegistry, Repository, Settings,
    StaticProbe,
};

const PID_A: u32 = 1001;
const PID_B: u32 = 2002;
const PID_C: u32 = 3003;

struct Window {
    service: Arc<ConfigService>,
    registry: Arc<RepoRegistry>,
    coordinator: OwnershipCoordinator,
    focus: Arc<RecordingFocus>,
}

impl Window {
    fn close(&self) {
        self.registry.close();
        self.service.close();
    }
}

async fn boot(db_path: &Path, hub: &MemoryTransport, probe: &StaticProbe, pid: u32) -> Window {
    let db = Db::open(db_path).unwrap();
    let bus = EventBus::new(Arc::new(hub.clone()));
    let service = ConfigService::start(db, bus, &Settings::default()).unwrap();

    let probe: Arc<dyn ProcessProbe> = Arc::new(probe.clone());
    let registry = RepoRegistry::new(Arc::clone(&service), Arc::clone(&probe), 32);
    registry.start().await.unwrap();

    let focus = Arc::new(RecordingFocus::new());
    let focus_hook: Arc<RecordingFocus> = Arc::clone(&focus);
    let coordinator = OwnershipCoordinator::new(
        Arc::clone(&service),
        Arc::clone(&registry),
        PlatformHooks {
            probe,
            focus: focus_hook,
            scaffold: Arc::new(MemoryScaffold::new()),
            prompt: Arc::new(AutoConfirm(true)),
        },
        pid,
        "0.3.1",
    );

    Window {
        service,
        registry,
        coordinator,
        focus,
    }
}

async fn eventually(what: &str, cond: impl Fn() -> bool) {
    for _ in 0..100 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {what}");
}

fn stored_owner(service: &ConfigService, id: &str) -> Owner {
    let record = service.get_by_id(id).unwrap().unwrap();
    Repository::from_record(&record).unwrap().owner
}

#[tokio::test]
async fn second_process_focuses_the_holder_instead_of_stealing() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("app.db");
    let hub = MemoryTransport::new();
    let probe = StaticProbe::with_live([PID_A, PID_B]);

    let a = boot(&db_path, &hub, &probe, PID_A).await;
    let b = boot(&db_path, &hub, &probe, PID_B).await;

    let project = Path::new("/projects/shared");
    assert_eq!(
        a.coordinator.open_path(project).await.unwrap(),
        OpenOutcome::Opened
    );

    // B hears about the claim through the change ledger.
    let b_registry = Arc::clone(&b.registry);
    eventually("window B to see A's claim", move || {
        b_registry
            .find_by_path(project)
            .is_some_and(|r| r.owner == Owner::ClaimedBy(PID_A))
    })
    .await;

    let outcome = b.coordinator.open_path(project).await.unwrap();
    assert_eq!(outcome, OpenOutcome::Focused { owner: PID_A });

    // Exactly one foreground request went to A, and the claim is untouched.
    assert_eq!(b.focus.calls(), vec![PID_A]);
    let repo = b.registry.find_by_path(project).unwrap();
    assert_eq!(stored_owner(&b.service, &repo.id), Owner::ClaimedBy(PID_A));
    assert!(a.focus.calls().is_empty());

    a.close();
    b.close();
}

#[tokio::test]
async fn crashed_holder_is_reclaimed_without_manual_cleanup() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("app.db");
    let hub = MemoryTransport::new();
    let probe = StaticProbe::with_live([PID_A]);

    let project = Path::new("/projects/solo");
    {
        let a = boot(&db_path, &hub, &probe, PID_A).await;
        assert_eq!(
            a.coordinator.open_path(project).await.unwrap(),
            OpenOutcome::Opened
        );
        a.close();
    }

    // A crashes: its claim is still on disk, but the process is gone.
    probe.mark_dead(PID_A);

    let c = boot(&db_path, &hub, &probe, PID_C).await;

    // The validated boot load already healed the stale claim.
    let repo = c.registry.find_by_path(project).unwrap();
    assert_eq!(repo.owner, Owner::Unclaimed);
    assert_eq!(stored_owner(&c.service, &repo.id), Owner::Unclaimed);

    // And the open proceeds locally, with no focus request to a ghost.
    assert_eq!(
        c.coordinator.open_path(project).await.unwrap(),
        OpenOutcome::Opened
    );
    assert_eq!(stored_owner(&c.service, &repo.id), Owner::ClaimedBy(PID_C));
    assert!(c.focus.calls().is_empty());

    c.close();
}

#[tokio::test]
async fn holder_reopening_its_own_repository_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("app.db");
    let hub = MemoryTransport::new();
    let probe = StaticProbe::with_live([PID_A]);

    let a = boot(&db_path, &hub, &probe, PID_A).await;
    let project = Path::new("/projects/mine");

    assert_eq!(
        a.coordinator.open_path(project).await.unwrap(),
        OpenOutcome::Opened
    );
    assert_eq!(
        a.coordinator.open_path(project).await.unwrap(),
        OpenOutcome::Opened
    );
    assert!(a.focus.calls().is_empty());

    let repo = a.registry.find_by_path(project).unwrap();
    assert_eq!(stored_owner(&a.service, &repo.id), Owner::ClaimedBy(PID_A));

    a.close();
}
