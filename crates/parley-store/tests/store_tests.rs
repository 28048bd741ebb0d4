//! Object store tests
//!
//! Tests cover:
//! - Round-trip, delete-by-none and enumeration
//! - All-or-nothing visibility of read-write transactions
//! - Reads never block behind held snapshots
//! - Typed accessors and undecodable payloads
//! - Queued writes: ordering and cancellation

use chrono::{DateTime, Utc};
use parley_store::{
    ChangeKind, Database, Decoded, EncryptionKey, Error, ObjectStore, Reader, StoreOptions,
};
use serde::{Deserialize, Serialize};
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

fn open_store() -> (TempDir, ObjectStore) {
    let dir = tempfile::tempdir().unwrap();
    let options = StoreOptions {
        reader_connections: 3,
        ..Default::default()
    };
    let key = EncryptionKey::generate();
    let db = Database::open(dir.path().join("store.sqlite"), &key, &options).unwrap();
    (dir, ObjectStore::open(db, &options).unwrap())
}

fn wait_for<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..500 {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Message {
    thread: String,
    body: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Thread {
    title: String,
    participants: Vec<String>,
}

// =============================================================================
// Basic document access
// =============================================================================

#[test]
fn test_write_read_then_delete_by_none() {
    let (_dir, store) = open_store();

    store
        .read_write(|tx| tx.set_string("hello", "m1", "messages"))
        .unwrap();
    let value = store.read(|s| s.get_string("m1", "messages")).unwrap().unwrap();
    assert_eq!(value.as_deref(), Some("hello"));

    store.read_write(|tx| tx.set(None, "m1", "messages")).unwrap();
    store
        .read(|s| {
            assert_eq!(s.get("m1", "messages").unwrap(), None);
            assert!(!s.has("m1", "messages").unwrap());
            assert_eq!(s.enumerate("messages").unwrap().len(), 0);
        })
        .unwrap();
}

#[test]
fn test_collections_partition_keys() {
    let (_dir, store) = open_store();
    store
        .read_write(|tx| {
            tx.set(Some(b"a".as_slice()), "k", "threads")?;
            tx.set(Some(b"b".as_slice()), "k", "messages")?;
            tx.set(Some(b"c".as_slice()), "k2", "messages")
        })
        .unwrap();

    store
        .read(|s| {
            assert_eq!(s.get("k", "threads").unwrap().unwrap(), b"a");
            assert_eq!(s.get("k", "messages").unwrap().unwrap(), b"b");
            assert_eq!(s.count("messages").unwrap(), 2);
            assert_eq!(s.collections().unwrap(), vec!["messages".to_string(), "threads".to_string()]);

            let mut keys = s.keys("messages").unwrap();
            keys.sort();
            assert_eq!(keys, vec!["k", "k2"]);
        })
        .unwrap();
}

#[test]
fn test_metadata_is_kept_separately() {
    let (_dir, store) = open_store();
    store
        .read_write(|tx| {
            tx.set_with_metadata(Some(b"payload".as_slice()), "m1", "messages", Some(b"meta".as_slice()))
        })
        .unwrap();

    let doc = store
        .read(|s| s.get_document("m1", "messages"))
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(doc.payload, b"payload");
    assert_eq!(doc.metadata.as_deref(), Some(&b"meta"[..]));

    store
        .read_write(|tx| {
            assert!(tx.set_metadata(None, "m1", "messages")?);
            assert!(!tx.set_metadata(Some(b"x".as_slice()), "missing", "messages")?);
            Ok(())
        })
        .unwrap();
    assert_eq!(store.read(|s| s.metadata("m1", "messages")).unwrap().unwrap(), None);
    assert_eq!(
        store.read(|s| s.get("m1", "messages")).unwrap().unwrap().as_deref(),
        Some(&b"payload"[..])
    );
}

// =============================================================================
// Transactions
// =============================================================================

#[test]
fn test_write_sees_its_own_changes() {
    let (_dir, store) = open_store();
    let count = store
        .read_write(|tx| {
            tx.set_int(1, "a", "c")?;
            tx.set_int(2, "b", "c")?;
            tx.count("c")
        })
        .unwrap();
    assert_eq!(count, 2);
}

#[test]
fn test_commit_is_all_or_nothing_for_concurrent_readers() {
    let (_dir, store) = open_store();
    let writer = store.clone();

    let handle = thread::spawn(move || {
        for round in 0..10 {
            writer
                .read_write(|tx| {
                    for i in 0..20 {
                        tx.set_int(round, &format!("k{}", i), "batch")?;
                    }
                    Ok(())
                })
                .unwrap();
        }
    });

    for _ in 0..200 {
        let values: Vec<i64> = store
            .read(|s| {
                s.enumerate_objects::<i64>("batch")
                    .unwrap()
                    .into_iter()
                    .filter_map(|(_, v)| v.ok())
                    .collect()
            })
            .unwrap();
        assert!(values.is_empty() || values.len() == 20, "partial batch: {}", values.len());
        assert!(values.windows(2).all(|w| w[0] == w[1]), "mixed rounds: {:?}", values);
    }
    handle.join().unwrap();
}

#[test]
fn test_error_in_body_discards_every_write() {
    let (_dir, store) = open_store();
    store.read_write(|tx| tx.set_string("keep", "k0", "c")).unwrap();
    let cursor = store.begin_observing();

    let result: parley_store::Result<()> = store.read_write(|tx| {
        tx.remove("k0", "c")?;
        tx.set_string("gone", "k1", "c")?;
        Err(Error::Validation("abort".into()))
    });
    assert!(matches!(result, Err(Error::Validation(_))));

    store
        .read(|s| {
            assert_eq!(s.get_string("k0", "c").unwrap().as_deref(), Some("keep"));
            assert!(!s.has("k1", "c").unwrap());
        })
        .unwrap();
    assert!(cursor.pending().is_empty());
}

#[test]
fn test_snapshot_keeps_its_commit() {
    let (_dir, store) = open_store();
    store.read_write(|tx| tx.set_string("v1", "k", "c")).unwrap();

    let snapshot = store.snapshot().unwrap();
    let seq = snapshot.seq();
    store.read_write(|tx| tx.set_string("v2", "k", "c")).unwrap();
    store.read_write(|tx| tx.remove("k", "c").map(|_| ())).unwrap();

    assert_eq!(snapshot.seq(), seq);
    assert_eq!(snapshot.get_string("k", "c").unwrap().as_deref(), Some("v1"));
    assert!(!store.read(|s| s.has("k", "c")).unwrap().unwrap());
}

#[test]
fn test_change_kinds_are_recorded_in_order() {
    let (_dir, store) = open_store();
    let cursor = store.begin_observing();

    store
        .read_write(|tx| {
            tx.set_string("a", "k1", "c")?;
            tx.set_string("b", "k1", "c")?;
            tx.set_string("x", "k2", "c")?;
            tx.touch("k2", "c")?;
            assert!(!tx.touch("nope", "c")?);
            tx.remove("k1", "c")?;
            assert!(!tx.remove("k1", "c")?);
            Ok(())
        })
        .unwrap();
    store
        .read_write(|tx| {
            tx.set_string("y", "k3", "c")?;
            assert_eq!(tx.remove_all("c")?, 2);
            Ok(())
        })
        .unwrap();

    let pending = cursor.pending();
    assert_eq!(pending.len(), 2);
    assert!(pending[0].seq < pending[1].seq);

    let kinds: Vec<(&str, ChangeKind)> = pending[0]
        .changes
        .iter()
        .map(|c| (c.key.as_str(), c.kind))
        .collect();
    assert_eq!(
        kinds,
        vec![
            ("k1", ChangeKind::Insert),
            ("k1", ChangeKind::Update),
            ("k2", ChangeKind::Insert),
            ("k2", ChangeKind::Update),
            ("k1", ChangeKind::Delete),
        ]
    );
    assert_eq!(pending[1].changes.len(), 3);
    assert!(pending[1].changes[1..].iter().all(|c| c.kind == ChangeKind::Delete));
}

#[test]
fn test_remove_many_counts_existing() {
    let (_dir, store) = open_store();
    store
        .read_write(|tx| {
            for key in ["a", "b", "c"] {
                tx.set_bool(true, key, "flags")?;
            }
            Ok(())
        })
        .unwrap();
    let removed = store
        .read_write(|tx| tx.remove_many(["a", "c", "zzz"], "flags"))
        .unwrap();
    assert_eq!(removed, 2);
    assert_eq!(store.read(|s| s.keys("flags")).unwrap().unwrap(), vec!["b"]);
}

#[test]
fn test_reads_do_not_wait_for_held_snapshots() {
    let (_dir, store) = open_store();
    store
        .read_write(|tx| tx.set_string("hello", "m1", "messages"))
        .unwrap();

    // Every pooled reader is pinned by a long-lived snapshot
    let held: Vec<_> = (0..3).map(|_| store.snapshot().unwrap()).collect();

    let reader = store.clone();
    let (done, result) = std::sync::mpsc::channel();
    thread::spawn(move || {
        let value = reader.read(|s| s.get_string("m1", "messages")).unwrap().unwrap();
        done.send(value).unwrap();
    });
    let value = result.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(value.as_deref(), Some("hello"));

    for snapshot in &held {
        assert_eq!(snapshot.get_string("m1", "messages").unwrap().as_deref(), Some("hello"));
    }
}

// =============================================================================
// Typed accessors
// =============================================================================

#[test]
fn test_typed_accessors() {
    let (_dir, store) = open_store();
    let sent: DateTime<Utc> = DateTime::from_timestamp_millis(1_700_000_123_456).unwrap();
    let thread = Thread {
        title: "Lunch".into(),
        participants: vec!["alice".into(), "bob".into()],
    };

    store
        .read_write(|tx| {
            tx.set_string("Alice", "name", "profile")?;
            tx.set_int(-42, "offset", "profile")?;
            tx.set_bool(true, "verified", "profile")?;
            tx.set_date(&sent, "last_seen", "profile")?;
            tx.set_bytes(&[0, 159, 146, 150], "avatar", "profile")?;
            tx.set_object(&thread, "t1", "threads")
        })
        .unwrap();

    store
        .read(|s| {
            assert_eq!(s.get_string("name", "profile").unwrap().as_deref(), Some("Alice"));
            assert_eq!(s.get_int("offset", "profile").unwrap(), Some(-42));
            assert_eq!(s.get_bool("verified", "profile").unwrap(), Some(true));
            assert_eq!(s.get_date("last_seen", "profile").unwrap(), Some(sent));
            assert_eq!(s.get_bytes("avatar", "profile").unwrap(), Some(vec![0, 159, 146, 150]));
            assert_eq!(
                s.get_object::<Thread>("t1", "threads").unwrap(),
                Some(Decoded::Value(thread.clone()))
            );
            assert_eq!(s.get_int("missing", "profile").unwrap(), None);
        })
        .unwrap();
}

#[test]
fn test_increment_int() {
    let (_dir, store) = open_store();
    let first = store.read_write(|tx| tx.increment_int(1, "unread", "counters")).unwrap();
    assert_eq!(first, 1);

    let last = store
        .read_write(|tx| {
            tx.increment_int(5, "unread", "counters")?;
            tx.increment_int(-2, "unread", "counters")
        })
        .unwrap();
    assert_eq!(last, 4);
    assert_eq!(
        store.read(|s| s.get_int("unread", "counters")).unwrap().unwrap(),
        Some(4)
    );
}

#[test]
fn test_undecodable_payload_does_not_break_reads() {
    let (_dir, store) = open_store();
    store
        .read_write(|tx| {
            tx.set_object(
                &Message {
                    thread: "t1".into(),
                    body: "hi".into(),
                },
                "m1",
                "messages",
            )?;
            tx.set(Some(b"\x00\x01 not json".as_slice()), "m2", "messages")?;
            tx.set_object(
                &Message {
                    thread: "t1".into(),
                    body: "there".into(),
                },
                "m3",
                "messages",
            )
        })
        .unwrap();

    store
        .read(|s| {
            let decoded = s.get_object::<Message>("m2", "messages").unwrap().unwrap();
            assert!(decoded.is_unknown());
            assert_eq!(s.get_string("m2", "messages").unwrap(), None);

            let all = s.enumerate_objects::<Message>("messages").unwrap();
            assert_eq!(all.len(), 3);
            assert_eq!(all.iter().filter(|(_, d)| d.is_unknown()).count(), 1);
        })
        .unwrap();
}

// =============================================================================
// Queued writes
// =============================================================================

#[test]
fn test_queued_writes_commit_in_submission_order() {
    let (_dir, store) = open_store();
    let cursor = store.begin_observing();

    for i in 0..10 {
        store
            .async_read_write(move |tx| tx.set_int(i, "last", "counters"))
            .unwrap();
    }

    assert!(wait_for(|| store.notifier().latest_seq() >= 10));
    assert_eq!(
        store.read(|s| s.get_int("last", "counters")).unwrap().unwrap(),
        Some(9)
    );
    let seqs: Vec<u64> = cursor.pending().iter().map(|s| s.seq).collect();
    assert_eq!(seqs, (1..=10).collect::<Vec<_>>());
}

#[test]
fn test_queued_write_can_be_cancelled_before_it_starts() {
    let (_dir, store) = open_store();
    let queuer = store.clone();

    let (first, second) = store
        .read_write(move |tx| {
            let first = queuer.async_read_write(|tx| tx.set_string("ran", "k1", "c"))?;
            let second = queuer.async_read_write(|tx| tx.set_string("ran", "k2", "c"))?;
            // The writer thread picks up `first` and blocks on this transaction
            assert!(wait_for(|| !first.is_queued()));
            assert!(second.cancel());
            tx.set_string("sync", "k0", "c")?;
            Ok((first, second))
        })
        .unwrap();

    assert!(!first.cancel());
    assert!(second.is_cancelled());
    assert!(wait_for(|| store.read(|s| s.has("k1", "c").unwrap()).unwrap()));
    assert!(!store.read(|s| s.has("k2", "c").unwrap()).unwrap());
}

#[test]
fn test_queued_write_failure_is_rolled_back() {
    let (_dir, store) = open_store();
    store
        .async_read_write(|tx| {
            tx.set_string("partial", "k1", "c")?;
            Err(Error::Validation("nope".into()))
        })
        .unwrap();
    store
        .async_read_write(|tx| tx.set_string("ok", "k2", "c"))
        .unwrap();

    assert!(wait_for(|| store.read(|s| s.has("k2", "c").unwrap()).unwrap()));
    assert!(!store.read(|s| s.has("k1", "c")).unwrap().unwrap());
}

#[test]
fn test_shutdown_rejects_new_work() {
    let (_dir, store) = open_store();
    store.read_write(|tx| tx.set_int(1, "n", "c")).unwrap();
    store.shutdown().unwrap();

    assert!(store.is_closed());
    assert!(matches!(store.read_write(|_| Ok(())), Err(Error::Closed)));
    assert!(matches!(
        store.async_read_write(|tx| tx.set_int(2, "n", "c")),
        Err(Error::Closed)
    ));
    assert!(matches!(store.shutdown(), Err(Error::Closed)));
}
