//! Session lifecycle tests
//!
//! Tests cover:
//! - Unconfirmed wipe: store, companions and key deleted
//! - Confirmed wipe: backup kept, restored on the next open
//! - Fallback to a fresh store when a restore cannot be used
//! - Restore while the device is locked keeps the backup
//! - A store is never opened or wiped on behalf of another identity
//! - Waiting for in-flight writes before files move

use parley_store::{
    DatabaseLifecycle, DeviceLockState, Error, Identity, KeyAccess, KeyVault, LifecycleState,
    MemoryCredentialStore, ObjectStore, Reader, StoreConfig, StoreFiles, WipeOutcome,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

struct Fixture {
    _dir: TempDir,
    credentials: Arc<MemoryCredentialStore>,
    lifecycle: DatabaseLifecycle,
}

fn fixture() -> Fixture {
    fixture_with_verifier(Arc::new(|_: &Identity| false))
}

fn fixture_with_verifier(verifier: Arc<dyn parley_store::SessionVerifier>) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let credentials = Arc::new(MemoryCredentialStore::new());
    let mut config = StoreConfig::with_root(dir.path());
    config.options.reader_connections = 2;
    let lifecycle = DatabaseLifecycle::new(config, KeyVault::new(credentials.clone()), verifier);
    Fixture {
        _dir: dir,
        credentials,
        lifecycle,
    }
}

fn live_files(lifecycle: &DatabaseLifecycle) -> StoreFiles {
    StoreFiles::new(lifecycle.config().store_path())
}

fn write_messages(store: &ObjectStore, count: usize) {
    store
        .read_write(|tx| {
            for i in 0..count {
                tx.set_string(&format!("message {}", i), &format!("m{}", i), "messages")?;
            }
            Ok(())
        })
        .unwrap();
}

// =============================================================================
// Wipe without backup
// =============================================================================

#[test]
fn test_unconfirmed_wipe_leaves_nothing() {
    let f = fixture();
    let id = Identity::account("0xalice");
    let store = f.lifecycle.open_or_create(&id).unwrap();
    write_messages(&store, 3);
    assert!(live_files(&f.lifecycle).exists());

    let outcome = f.lifecycle.wipe_and_backup(&id, false).unwrap();
    assert_eq!(outcome, WipeOutcome::Deleted);

    assert!(!live_files(&f.lifecycle).any_exists());
    assert!(!f.credentials.contains(&id.key_name()));
    assert!(!f.credentials.contains(&id.backup_key_name()));
    assert!(!f.lifecycle.has_backup(&id));
    assert_eq!(f.lifecycle.vault().access(&id).unwrap(), KeyAccess::Absent);
    assert_eq!(f.lifecycle.state(), LifecycleState::Uninitialized);
    assert!(store.is_closed());
}

#[test]
fn test_wipe_session_asks_the_verifier() {
    let confirmed = Arc::new(AtomicBool::new(false));
    let flag = confirmed.clone();
    let f = fixture_with_verifier(Arc::new(move |_: &Identity| flag.load(Ordering::SeqCst)));
    let id = Identity::account("0xbob");

    f.lifecycle.open_or_create(&id).unwrap();
    assert_eq!(f.lifecycle.wipe_session(&id).unwrap(), WipeOutcome::Deleted);

    let store = f.lifecycle.open_or_create(&id).unwrap();
    write_messages(&store, 1);
    confirmed.store(true, Ordering::SeqCst);
    assert!(matches!(
        f.lifecycle.wipe_session(&id).unwrap(),
        WipeOutcome::BackedUp { .. }
    ));
}

// =============================================================================
// Backup and restore
// =============================================================================

#[test]
fn test_confirmed_wipe_backs_up_and_restores() {
    let f = fixture();
    let id = Identity::account("0xcarol");
    let store = f.lifecycle.open_or_create(&id).unwrap();
    write_messages(&store, 5);

    let outcome = f.lifecycle.wipe_and_backup(&id, true).unwrap();
    let path = match outcome {
        WipeOutcome::BackedUp { path } => path,
        other => panic!("unexpected outcome: {:?}", other),
    };
    assert!(path.exists());
    assert!(f.lifecycle.has_backup(&id));
    assert!(!live_files(&f.lifecycle).any_exists());
    assert!(!f.credentials.contains(&id.key_name()));
    assert!(!f.lifecycle.vault().is_key_accessible(&id));
    assert!(f
        .lifecycle
        .config()
        .backup_dir
        .join("CACHEDIR.TAG")
        .exists());

    let restored = f.lifecycle.open_or_create(&id).unwrap();
    assert_eq!(f.lifecycle.state(), LifecycleState::Ready);
    assert!(!f.lifecycle.has_backup(&id));
    restored
        .read(|s| {
            assert_eq!(s.count("messages").unwrap(), 5);
            assert_eq!(s.get_string("m4", "messages").unwrap().as_deref(), Some("message 4"));
        })
        .unwrap();
}

#[test]
fn test_backup_is_per_identity() {
    let f = fixture();
    let alice = Identity::account("alice");
    let bob = Identity::account("bob");

    let store = f.lifecycle.open_or_create(&alice).unwrap();
    write_messages(&store, 2);
    f.lifecycle.wipe_and_backup(&alice, true).unwrap();

    let store = f.lifecycle.open_or_create(&bob).unwrap();
    assert_eq!(store.read(|s| s.count("messages")).unwrap().unwrap(), 0);
    write_messages(&store, 7);
    f.lifecycle.wipe_and_backup(&bob, true).unwrap();

    let store = f.lifecycle.open_or_create(&alice).unwrap();
    assert_eq!(store.read(|s| s.count("messages")).unwrap().unwrap(), 2);
    assert!(f.lifecycle.has_backup(&bob));
}

#[test]
fn test_restore_while_locked_keeps_backup() {
    let f = fixture();
    let id = Identity::account("heidi");
    let store = f.lifecycle.open_or_create(&id).unwrap();
    write_messages(&store, 2);
    f.lifecycle.wipe_and_backup(&id, true).unwrap();

    f.credentials.set_lock_state(DeviceLockState::BeforeFirstUnlock);
    let err = f.lifecycle.open_or_create(&id).unwrap_err();
    assert!(matches!(err, Error::KeyLocked(_)));
    assert!(matches!(f.lifecycle.state(), LifecycleState::Failed(_)));
    assert!(f.lifecycle.has_backup(&id));
    assert!(!live_files(&f.lifecycle).exists());
    assert!(f.credentials.contains(&id.backup_key_name()));

    f.credentials.set_lock_state(DeviceLockState::Unlocked);
    let store = f.lifecycle.open_or_create(&id).unwrap();
    assert!(!f.lifecycle.has_backup(&id));
    assert_eq!(
        store.read(|s| s.get_string("m1", "messages")).unwrap().unwrap().as_deref(),
        Some("message 1")
    );
}

#[test]
fn test_stale_companions_do_not_survive_restore() {
    let f = fixture();
    let id = Identity::single_account();
    let store = f.lifecycle.open_or_create(&id).unwrap();
    write_messages(&store, 1);
    f.lifecycle.wipe_and_backup(&id, true).unwrap();

    let live = live_files(&f.lifecycle);
    std::fs::create_dir_all(live.wal.parent().unwrap()).unwrap();
    std::fs::write(&live.wal, b"garbage from another session").unwrap();
    std::fs::write(&live.shm, b"garbage").unwrap();

    let store = f.lifecycle.open_or_create(&id).unwrap();
    assert_eq!(store.read(|s| s.count("messages")).unwrap().unwrap(), 1);
}

#[test]
fn test_unusable_backup_falls_back_to_fresh_store() {
    let f = fixture();
    let id = Identity::account("dave");
    let store = f.lifecycle.open_or_create(&id).unwrap();
    write_messages(&store, 4);
    f.lifecycle.wipe_and_backup(&id, true).unwrap();

    // Lose the archived key: the backup can no longer be decrypted
    f.lifecycle.vault().delete_archived_key(&id).unwrap();

    let store = f.lifecycle.open_or_create(&id).unwrap();
    assert_eq!(f.lifecycle.state(), LifecycleState::Ready);
    assert_eq!(store.read(|s| s.count("messages")).unwrap().unwrap(), 0);
    write_messages(&store, 1);
}

#[test]
fn test_confirmed_wipe_without_store_reports_failure() {
    let f = fixture();
    let id = Identity::account("erin");
    let outcome = f.lifecycle.wipe_and_backup(&id, true).unwrap();
    assert!(matches!(outcome, WipeOutcome::BackupFailed { .. }));
    assert!(!f.lifecycle.has_backup(&id));
}

// =============================================================================
// Teardown ordering
// =============================================================================

#[test]
fn test_wipe_waits_for_write_in_flight() {
    let f = fixture();
    let id = Identity::account("frank");
    let store = f.lifecycle.open_or_create(&id).unwrap();

    let writer = store.clone();
    let started = Arc::new(AtomicBool::new(false));
    let flag = started.clone();
    let handle = std::thread::spawn(move || {
        writer.read_write(|tx| {
            flag.store(true, Ordering::SeqCst);
            std::thread::sleep(std::time::Duration::from_millis(200));
            tx.set_string("committed", "last", "messages")
        })
    });
    while !started.load(Ordering::SeqCst) {
        std::thread::yield_now();
    }

    f.lifecycle.wipe_and_backup(&id, true).unwrap();
    handle.join().unwrap().unwrap();

    let store = f.lifecycle.open_or_create(&id).unwrap();
    assert_eq!(
        store.read(|s| s.get_string("last", "messages")).unwrap().unwrap().as_deref(),
        Some("committed")
    );
}

#[test]
fn test_close_keeps_files_and_key() {
    let f = fixture();
    let id = Identity::account("grace");
    let store = f.lifecycle.open_or_create(&id).unwrap();
    write_messages(&store, 2);

    f.lifecycle.close();
    assert_eq!(f.lifecycle.state(), LifecycleState::Uninitialized);
    assert!(f.lifecycle.store().is_none());
    assert!(live_files(&f.lifecycle).exists());
    assert!(f.lifecycle.vault().is_key_accessible(&id));

    let store = f.lifecycle.open_or_create(&id).unwrap();
    assert_eq!(store.read(|s| s.count("messages")).unwrap().unwrap(), 2);
}

// =============================================================================
// Identity scoping
// =============================================================================

#[test]
fn test_wipe_for_other_identity_leaves_open_session() {
    let f = fixture();
    let alice = Identity::account("alice");
    let bob = Identity::account("bob");
    let store = f.lifecycle.open_or_create(&alice).unwrap();
    write_messages(&store, 3);

    for confirmed in [false, true] {
        assert!(matches!(
            f.lifecycle.wipe_and_backup(&bob, confirmed),
            Err(Error::Lifecycle(_))
        ));
    }
    assert_eq!(f.lifecycle.state(), LifecycleState::Ready);
    assert!(!store.is_closed());
    assert_eq!(store.read(|s| s.count("messages")).unwrap().unwrap(), 3);
    assert!(f.lifecycle.vault().is_key_accessible(&alice));
    assert!(!f.lifecycle.has_backup(&bob));
}

#[test]
fn test_closed_store_is_not_replaced_by_other_identity() {
    let f = fixture();
    let alice = Identity::account("alice");
    let bob = Identity::account("bob");
    let store = f.lifecycle.open_or_create(&alice).unwrap();
    write_messages(&store, 4);
    f.lifecycle.close();

    assert!(matches!(f.lifecycle.open_or_create(&bob), Err(Error::Lifecycle(_))));
    assert!(matches!(f.lifecycle.state(), LifecycleState::Failed(_)));
    assert!(live_files(&f.lifecycle).exists());
    assert!(f.lifecycle.owns_live_store(&alice).unwrap());
    assert!(!f.lifecycle.owns_live_store(&bob).unwrap());

    let store = f.lifecycle.open_or_create(&alice).unwrap();
    assert_eq!(store.read(|s| s.count("messages")).unwrap().unwrap(), 4);
}

#[test]
fn test_wipe_of_closed_store_checks_owner() {
    let f = fixture();
    let alice = Identity::account("alice");
    let bob = Identity::account("bob");
    let store = f.lifecycle.open_or_create(&alice).unwrap();
    write_messages(&store, 1);
    f.lifecycle.close();

    assert!(matches!(
        f.lifecycle.wipe_and_backup(&bob, false),
        Err(Error::Lifecycle(_))
    ));
    assert!(live_files(&f.lifecycle).exists());
    assert!(f.lifecycle.vault().is_key_accessible(&alice));

    assert_eq!(f.lifecycle.wipe_and_backup(&alice, false).unwrap(), WipeOutcome::Deleted);
    assert!(!live_files(&f.lifecycle).any_exists());
}
