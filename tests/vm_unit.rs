//! Lifecycle scenarios against the scripted engine in `common`.
//!
//! Nothing here boots a VM or needs macOS; every test works in its own
//! temporary VM root.

mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use bisque_vm::VmError;
use bisque_vm::state_machine::session_sm::{SessionState, SessionStatus};
use bisque_vm::vm::controller::{GIB, format_gib};
use bisque_vm::vm::lock::{LockRecord, OwnerKind};
use bisque_vm::vm::{InitOptions, RunState, SettingsUpdate};

use common::{FakeHypervisor, controller, installed_vm, restore_image, small_options};

fn embedded_lock() -> String {
    LockRecord {
        owner: OwnerKind::Embedded,
        pid: std::process::id(),
    }
    .encode()
}

// ---------------------------------------------------------------------------
// init / status / list
// ---------------------------------------------------------------------------

#[tokio::test]
async fn init_then_status_reports_requested_sizes() {
    let tmp = tempfile::tempdir().unwrap();
    let fake = FakeHypervisor::new();
    let vms = controller(tmp.path(), &fake);

    let options = InitOptions {
        cpus: 4,
        memory_bytes: 8 * GIB,
        disk_bytes: 64 * GIB,
        restore_image: restore_image(tmp.path()),
    };
    vms.init("sandbox", &options).await.unwrap();

    let status = vms.status("sandbox").unwrap();
    assert!(!status.installed);
    assert_eq!(status.cpus, 4);
    assert_eq!(format_gib(status.memory_bytes), "8.0 GiB");
    assert_eq!(format_gib(status.disk_bytes), "64.0 GiB");
    assert_eq!(status.state, RunState::Stopped);

    let printed = status.to_string();
    assert!(printed.contains("state:         stopped"));
    assert!(printed.contains("memory:        8.0 GiB"));

    let bundle = tmp.path().join("vms/sandbox");
    for file in ["config.json", "disk.img", "HardwareModel", "MachineIdentifier", "AuxiliaryStorage"] {
        assert!(bundle.join(file).is_file(), "{file} missing");
    }
    assert_eq!(std::fs::metadata(bundle.join("disk.img")).unwrap().len(), 64 * GIB);
}

#[tokio::test]
async fn init_refuses_existing_bundle_and_low_cpus() {
    let tmp = tempfile::tempdir().unwrap();
    let fake = FakeHypervisor::new();
    let vms = controller(tmp.path(), &fake);
    let options = small_options(restore_image(tmp.path()));

    vms.init("sandbox", &options).await.unwrap();
    assert!(matches!(
        vms.init("sandbox", &options).await,
        Err(VmError::Conflict(_))
    ));

    let zero_cpus = InitOptions { cpus: 0, ..options };
    assert!(matches!(
        vms.init("other", &zero_cpus).await,
        Err(VmError::Validation(_))
    ));
    assert!(!tmp.path().join("vms/other").exists());
}

#[tokio::test]
async fn failed_init_leaves_nothing_behind() {
    let tmp = tempfile::tempdir().unwrap();
    let fake = FakeHypervisor::new();
    let vms = controller(tmp.path(), &fake);

    let missing = small_options(tmp.path().join("missing.img"));
    assert!(vms.init("sandbox", &missing).await.is_err());

    let root = tmp.path().join("vms");
    let leftovers: Vec<_> = std::fs::read_dir(&root)
        .map(|entries| entries.filter_map(|e| e.ok()).collect())
        .unwrap_or_default();
    assert!(leftovers.is_empty(), "{leftovers:?}");
}

#[tokio::test]
async fn list_skips_unreadable_bundles() {
    let tmp = tempfile::tempdir().unwrap();
    let fake = FakeHypervisor::new();
    let vms = controller(tmp.path(), &fake);
    let options = small_options(restore_image(tmp.path()));

    vms.init("beta", &options).await.unwrap();
    vms.init("alpha", &options).await.unwrap();
    let broken = tmp.path().join("vms/broken");
    std::fs::create_dir_all(&broken).unwrap();
    std::fs::write(broken.join("config.json"), b"{ not json").unwrap();

    let names: Vec<_> = vms.list_vms().unwrap().into_iter().map(|vm| vm.name).collect();
    assert_eq!(names, ["alpha", "beta"]);
}

// ---------------------------------------------------------------------------
// install / settings / delete
// ---------------------------------------------------------------------------

#[tokio::test]
async fn install_marks_config_and_releases_lock() {
    let tmp = tempfile::tempdir().unwrap();
    let fake = FakeHypervisor::new();
    let vms = controller(tmp.path(), &fake);
    vms.init("sandbox", &small_options(restore_image(tmp.path())))
        .await
        .unwrap();

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let report = vms.install("sandbox", tx).await.unwrap();
    assert_eq!(report.version.as_deref(), Some("fake-1.0"));

    let mut last = None;
    while let Ok(p) = rx.try_recv() {
        last = Some(p.fraction_completed);
    }
    assert_eq!(last, Some(1.0));

    let status = vms.status("sandbox").unwrap();
    assert!(status.installed);
    assert_eq!(status.last_install_version.as_deref(), Some("fake-1.0"));
    assert_eq!(status.last_install_build.as_deref(), Some("F1"));
    assert!(status.last_install_date.is_some());
    assert!(!tmp.path().join("vms/sandbox/vm.lock").exists());
}

#[tokio::test]
async fn install_is_refused_while_running() {
    let tmp = tempfile::tempdir().unwrap();
    let fake = FakeHypervisor::new();
    let vms = controller(tmp.path(), &fake);
    vms.init("sandbox", &small_options(restore_image(tmp.path())))
        .await
        .unwrap();
    let lock = tmp.path().join("vms/sandbox/vm.lock");
    std::fs::write(&lock, embedded_lock()).unwrap();

    let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
    let err = vms.install("sandbox", tx).await.unwrap_err();

    assert!(err.is_already_running(), "{err}");
    assert_eq!(fake.state.installs.load(Ordering::SeqCst), 0);
    assert!(!vms.status("sandbox").unwrap().installed);
    assert_eq!(std::fs::read_to_string(&lock).unwrap(), embedded_lock());
}

#[tokio::test]
async fn settings_are_refused_while_running_and_validated() {
    let tmp = tempfile::tempdir().unwrap();
    let fake = FakeHypervisor::new();
    let vms = controller(tmp.path(), &fake);
    vms.init("sandbox", &small_options(restore_image(tmp.path())))
        .await
        .unwrap();
    let lock = tmp.path().join("vms/sandbox/vm.lock");

    std::fs::write(&lock, embedded_lock()).unwrap();
    let update = SettingsUpdate {
        cpus: Some(3),
        ..Default::default()
    };
    assert!(vms.edit_settings("sandbox", &update).await.unwrap_err().is_already_running());
    std::fs::remove_file(&lock).unwrap();

    let too_small = SettingsUpdate {
        memory_bytes: Some(GIB / 2),
        ..Default::default()
    };
    assert!(matches!(
        vms.edit_settings("sandbox", &too_small).await,
        Err(VmError::Validation(_))
    ));

    let missing_share = SettingsUpdate {
        shared_folder: Some(Some(tmp.path().join("nope"))),
        ..Default::default()
    };
    assert!(matches!(
        vms.edit_settings("sandbox", &missing_share).await,
        Err(VmError::Validation(_))
    ));

    let share = tmp.path().join("share");
    std::fs::create_dir(&share).unwrap();
    let update = SettingsUpdate {
        cpus: Some(3),
        shared_folder: Some(Some(share.clone())),
        shared_folder_read_only: Some(true),
        ..Default::default()
    };
    let status = vms.edit_settings("sandbox", &update).await.unwrap();
    assert_eq!(status.cpus, 3);
    assert_eq!(status.shared_folder.as_deref(), Some(share.as_path()));
    assert!(status.shared_folder_read_only);
}

#[tokio::test]
async fn delete_moves_bundle_to_trash_unless_running() {
    let tmp = tempfile::tempdir().unwrap();
    let fake = FakeHypervisor::new();
    let vms = controller(tmp.path(), &fake);
    let options = small_options(restore_image(tmp.path()));
    vms.init("sandbox", &options).await.unwrap();

    std::fs::write(tmp.path().join("vms/sandbox/vm.lock"), embedded_lock()).unwrap();
    assert!(vms.delete("sandbox").unwrap_err().is_already_running());
    std::fs::remove_file(tmp.path().join("vms/sandbox/vm.lock")).unwrap();

    let first = vms.delete("sandbox").unwrap();
    assert_eq!(first, tmp.path().join("trash/sandbox"));
    assert!(first.join("config.json").is_file());
    assert!(!tmp.path().join("vms/sandbox").exists());

    // A second VM of the same name does not overwrite the trashed one.
    vms.init("sandbox", &options).await.unwrap();
    let second = vms.delete("sandbox").unwrap();
    assert_ne!(second, first);
    assert!(first.exists() && second.exists());
}

// ---------------------------------------------------------------------------
// snapshots
// ---------------------------------------------------------------------------

#[tokio::test]
async fn revert_restores_exact_disk_bytes() {
    let tmp = tempfile::tempdir().unwrap();
    let fake = FakeHypervisor::new();
    let vms = controller(tmp.path(), &fake);
    vms.init("sandbox", &small_options(restore_image(tmp.path())))
        .await
        .unwrap();
    let disk = tmp.path().join("vms/sandbox/disk.img");
    std::fs::write(&disk, vec![7u8; 1 << 20]).unwrap();
    let before = std::fs::read(&disk).unwrap();

    vms.create_snapshot("sandbox", "clean").unwrap();
    let mut mutated = before.clone();
    mutated[..4].copy_from_slice(b"DIRT");
    std::fs::write(&disk, &mutated).unwrap();

    vms.revert_snapshot("sandbox", "clean").unwrap();
    assert_eq!(std::fs::read(&disk).unwrap(), before);

    let snapshots = vms.list_snapshots("sandbox").unwrap();
    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0].name, "clean");
}

#[tokio::test]
async fn snapshots_are_refused_while_running() {
    let tmp = tempfile::tempdir().unwrap();
    let fake = FakeHypervisor::new();
    let vms = controller(tmp.path(), &fake);
    vms.init("sandbox", &small_options(restore_image(tmp.path())))
        .await
        .unwrap();
    vms.create_snapshot("sandbox", "clean").unwrap();

    std::fs::write(tmp.path().join("vms/sandbox/vm.lock"), embedded_lock()).unwrap();
    assert!(vms.create_snapshot("sandbox", "again").unwrap_err().is_already_running());
    assert!(vms.revert_snapshot("sandbox", "clean").unwrap_err().is_already_running());
    assert!(!tmp.path().join("vms/sandbox/snapshots/again").exists());
}

// ---------------------------------------------------------------------------
// sessions
// ---------------------------------------------------------------------------

#[tokio::test]
async fn start_requires_installation() {
    let tmp = tempfile::tempdir().unwrap();
    let fake = FakeHypervisor::new();
    let vms = controller(tmp.path(), &fake);
    vms.init("sandbox", &small_options(restore_image(tmp.path())))
        .await
        .unwrap();

    assert!(matches!(vms.start("sandbox").await, Err(VmError::Validation(_))));
    assert_eq!(fake.state.starts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn start_on_embedded_lock_names_the_embedded_owner() {
    let tmp = tempfile::tempdir().unwrap();
    let fake = FakeHypervisor::new();
    let vms = controller(tmp.path(), &fake);
    installed_vm(&vms, tmp.path(), "sandbox").await;
    let lock = tmp.path().join("vms/sandbox/vm.lock");
    std::fs::write(&lock, embedded_lock()).unwrap();

    let session = vms.session("sandbox").unwrap();
    let err = session.start().await.unwrap_err();

    assert!(err.is_already_running());
    assert!(err.to_string().contains("embedded"), "{err}");
    assert_eq!(session.state(), SessionState::Initialized);
    assert_eq!(fake.state.starts.load(Ordering::SeqCst), 0);
    // The other owner's record is untouched.
    assert_eq!(std::fs::read_to_string(&lock).unwrap(), embedded_lock());
}

#[tokio::test]
async fn start_clears_a_stale_lock() {
    let tmp = tempfile::tempdir().unwrap();
    let fake = FakeHypervisor::new();
    fake.state.halt_on_graceful.store(true, Ordering::SeqCst);
    let vms = controller(tmp.path(), &fake);
    installed_vm(&vms, tmp.path(), "sandbox").await;

    let mut child = std::process::Command::new("true").spawn().unwrap();
    let dead = child.id();
    child.wait().unwrap();
    let lock = tmp.path().join("vms/sandbox/vm.lock");
    std::fs::write(&lock, format!("{dead}\n")).unwrap();

    let session = vms.start("sandbox").await.unwrap();
    assert_eq!(session.state(), SessionState::Running);
    assert_eq!(
        std::fs::read_to_string(&lock).unwrap(),
        format!("{}\n", std::process::id())
    );

    session.request_stop();
    session.wait_until_stopped().await.unwrap();
    assert!(!lock.exists());
}

#[tokio::test]
async fn two_stop_signals_force_once_and_release_once() {
    let tmp = tempfile::tempdir().unwrap();
    let fake = FakeHypervisor::new();
    let vms = controller(tmp.path(), &fake);
    installed_vm(&vms, tmp.path(), "sandbox").await;
    let lock = tmp.path().join("vms/sandbox/vm.lock");

    let session = vms.start("sandbox").await.unwrap();
    assert!(lock.exists());

    session.request_stop();
    session.request_stop();
    session.request_stop();
    tokio::time::timeout(Duration::from_secs(5), session.wait_until_stopped())
        .await
        .expect("session should stop")
        .unwrap();

    assert_eq!(fake.state.force_stops.load(Ordering::SeqCst), 1);
    assert!(fake.state.graceful_stops.load(Ordering::SeqCst) <= 1);
    assert!(!lock.exists());

    // A late duplicate confirmation must not release a lock taken since.
    std::fs::write(&lock, embedded_lock()).unwrap();
    fake.state.observer().unwrap().on_guest_stopped();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(lock.exists());
}

#[tokio::test]
async fn guest_halt_stops_session_and_releases_lock() {
    let tmp = tempfile::tempdir().unwrap();
    let fake = FakeHypervisor::new();
    let vms = controller(tmp.path(), &fake);
    installed_vm(&vms, tmp.path(), "sandbox").await;

    let session = vms.start("sandbox").await.unwrap();
    fake.state.observer().unwrap().on_guest_stopped();
    session.wait_until_stopped().await.unwrap();

    assert_eq!(session.state(), SessionState::Stopped);
    assert_eq!(fake.state.graceful_stops.load(Ordering::SeqCst), 0);
    assert_eq!(vms.status("sandbox").unwrap().state, RunState::Stopped);
}

#[tokio::test]
async fn engine_error_is_surfaced_verbatim() {
    let tmp = tempfile::tempdir().unwrap();
    let fake = FakeHypervisor::new();
    let vms = controller(tmp.path(), &fake);
    installed_vm(&vms, tmp.path(), "sandbox").await;

    let session = vms.start("sandbox").await.unwrap();
    fake.state.observer().unwrap().on_error("guest panicked".into());

    let err = session.wait_until_stopped().await.unwrap_err();
    assert!(matches!(&err, VmError::Engine(msg) if msg == "guest panicked"));
    assert!(!tmp.path().join("vms/sandbox/vm.lock").exists());
}

#[tokio::test]
async fn failed_engine_start_releases_lock() {
    let tmp = tempfile::tempdir().unwrap();
    let fake = FakeHypervisor::new();
    *fake.state.start_failure.lock().unwrap() = Some("no entitlement".into());
    let vms = controller(tmp.path(), &fake);
    installed_vm(&vms, tmp.path(), "sandbox").await;

    let err = vms.start("sandbox").await.err().expect("start should fail");
    assert!(matches!(&err, VmError::Engine(msg) if msg.contains("no entitlement")));
    assert!(!tmp.path().join("vms/sandbox/vm.lock").exists());
}

#[tokio::test]
async fn stop_while_starting_is_delivered_once_running() {
    let tmp = tempfile::tempdir().unwrap();
    let fake = FakeHypervisor::new();
    fake.state.halt_on_graceful.store(true, Ordering::SeqCst);
    *fake.state.start_delay.lock().unwrap() = Duration::from_millis(200);
    let vms = controller(tmp.path(), &fake);
    installed_vm(&vms, tmp.path(), "sandbox").await;

    let session = vms.session("sandbox").unwrap();
    let mut status = session.subscribe();
    let stop_when_starting = async {
        status
            .wait_for(|s| s.state == SessionState::Starting)
            .await
            .unwrap();
        session.request_stop();
    };
    let (started, ()) = tokio::join!(session.start(), stop_when_starting);
    started.unwrap();

    session.wait_until_stopped().await.unwrap();
    assert_eq!(fake.state.graceful_stops.load(Ordering::SeqCst), 1);
    assert_eq!(fake.state.force_stops.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn close_is_deferred_until_stopped() {
    let tmp = tempfile::tempdir().unwrap();
    let fake = FakeHypervisor::new();
    let vms = controller(tmp.path(), &fake);
    installed_vm(&vms, tmp.path(), "sandbox").await;

    let session = vms.start("sandbox").await.unwrap();
    assert!(!session.request_close());

    let mut status = session.subscribe();
    status
        .wait_for(|s| s.state == SessionState::Stopping)
        .await
        .unwrap();
    // A second close while stopping does not escalate.
    assert!(!session.request_close());

    fake.state.observer().unwrap().on_guest_stopped();
    session.wait_until_stopped().await.unwrap();
    assert!(session.request_close());
    assert_eq!(fake.state.force_stops.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn second_start_on_a_live_session_is_a_conflict() {
    let tmp = tempfile::tempdir().unwrap();
    let fake = FakeHypervisor::new();
    fake.state.halt_on_graceful.store(true, Ordering::SeqCst);
    let vms = controller(tmp.path(), &fake);
    installed_vm(&vms, tmp.path(), "sandbox").await;

    let session = vms.start("sandbox").await.unwrap();
    let again = tokio::time::timeout(Duration::from_secs(2), session.start())
        .await
        .expect("second start should return");
    assert!(matches!(again, Err(VmError::Conflict(_))), "{again:?}");
    assert_eq!(fake.state.starts.load(Ordering::SeqCst), 1);
    assert_eq!(session.state(), SessionState::Running);

    session.request_stop();
    session.wait_until_stopped().await.unwrap();
    assert!(matches!(session.start().await, Err(VmError::Conflict(_))));
}

/// Resolves once the session driver has exited and dropped its status sender.
async fn driver_exit(mut status: tokio::sync::watch::Receiver<SessionStatus>) -> SessionState {
    tokio::time::timeout(Duration::from_secs(5), async {
        while status.changed().await.is_ok() {}
    })
    .await
    .expect("session driver should exit");
    let state = status.borrow().state;
    state
}

#[tokio::test]
async fn dropping_a_rejected_session_ends_its_driver() {
    let tmp = tempfile::tempdir().unwrap();
    let fake = FakeHypervisor::new();
    let vms = controller(tmp.path(), &fake);
    installed_vm(&vms, tmp.path(), "sandbox").await;
    let lock = tmp.path().join("vms/sandbox/vm.lock");
    std::fs::write(&lock, embedded_lock()).unwrap();

    for _ in 0..3 {
        let session = vms.session("sandbox").unwrap();
        assert!(session.start().await.unwrap_err().is_already_running());
        let status = session.subscribe();
        drop(session);
        assert_eq!(driver_exit(status).await, SessionState::Stopped);
    }
    assert_eq!(std::fs::read_to_string(&lock).unwrap(), embedded_lock());
}

#[tokio::test]
async fn dropping_a_running_session_stops_the_guest() {
    let tmp = tempfile::tempdir().unwrap();
    let fake = FakeHypervisor::new();
    fake.state.halt_on_graceful.store(true, Ordering::SeqCst);
    let vms = controller(tmp.path(), &fake);
    installed_vm(&vms, tmp.path(), "sandbox").await;

    let session = vms.start("sandbox").await.unwrap();
    let status = session.subscribe();
    drop(session);

    assert_eq!(driver_exit(status).await, SessionState::Stopped);
    assert_eq!(fake.state.graceful_stops.load(Ordering::SeqCst), 1);
    assert_eq!(fake.state.force_stops.load(Ordering::SeqCst), 0);
    assert!(!tmp.path().join("vms/sandbox/vm.lock").exists());
}

#[tokio::test]
async fn failed_graceful_stop_escalates_to_forced_stop() {
    let tmp = tempfile::tempdir().unwrap();
    let fake = FakeHypervisor::new();
    *fake.state.graceful_failure.lock().unwrap() = Some("guest ignored ACPI".into());
    let vms = controller(tmp.path(), &fake);
    installed_vm(&vms, tmp.path(), "sandbox").await;

    let session = vms.start("sandbox").await.unwrap();
    session.request_stop();
    tokio::time::timeout(Duration::from_secs(5), session.wait_until_stopped())
        .await
        .expect("session should stop without a second signal")
        .unwrap();

    assert_eq!(fake.state.graceful_stops.load(Ordering::SeqCst), 1);
    assert_eq!(fake.state.force_stops.load(Ordering::SeqCst), 1);
    assert!(!tmp.path().join("vms/sandbox/vm.lock").exists());
}

#[tokio::test]
async fn engine_helper_pid_is_kept_beside_the_lock_while_running() {
    let tmp = tempfile::tempdir().unwrap();
    let fake = FakeHypervisor::new();
    *fake.state.helper_pid.lock().unwrap() = Some(4242);
    let vms = controller(tmp.path(), &fake);
    installed_vm(&vms, tmp.path(), "sandbox").await;
    let helper = tmp.path().join("vms/sandbox/vm.helper.pid");

    let session = vms.start("sandbox").await.unwrap();
    assert_eq!(std::fs::read_to_string(&helper).unwrap(), "4242\n");

    fake.state.observer().unwrap().on_guest_stopped();
    session.wait_until_stopped().await.unwrap();
    assert!(!helper.exists());
    assert!(!tmp.path().join("vms/sandbox/vm.lock").exists());
}

// ---------------------------------------------------------------------------
// out-of-process stop
// ---------------------------------------------------------------------------

#[tokio::test]
async fn stop_refuses_embedded_owner_and_cleans_stale_lock() {
    let tmp = tempfile::tempdir().unwrap();
    let fake = FakeHypervisor::new();
    let vms = controller(tmp.path(), &fake);
    vms.init("sandbox", &small_options(restore_image(tmp.path())))
        .await
        .unwrap();
    let lock = tmp.path().join("vms/sandbox/vm.lock");

    std::fs::write(&lock, embedded_lock()).unwrap();
    let err = vms.stop("sandbox", Duration::from_secs(1)).await.unwrap_err();
    assert!(err.to_string().contains("embedded"));
    assert!(lock.exists());

    let mut child = std::process::Command::new("true").spawn().unwrap();
    let dead = child.id();
    child.wait().unwrap();
    std::fs::write(&lock, format!("{dead}\n")).unwrap();
    vms.stop("sandbox", Duration::from_secs(1)).await.unwrap();
    assert!(!lock.exists());
}
