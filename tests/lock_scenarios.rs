//! End-to-end scheduling scenarios for the reader-writer lock.
//!
//! Each test drives a full acquire/park/release/wake cycle through the
//! public API and checks the admission order the lock promises: writer
//! priority, reader batching, upgradable-seat handover, upgrade-beats-
//! everything, and cancellation without lost wakeups.

mod common;

use common::{poll_once, poll_until_ready};
use coopsync::sync::RwLockError;
use coopsync::test_utils::init_test_logging;
use coopsync::{CancelToken, RwLock};

#[test]
fn writer_excludes_readers_until_release() {
    init_test_logging();
    coopsync::test_phase!("writer_excludes_readers_until_release");
    let token = CancelToken::new();
    let lock = RwLock::new(0_u32);

    let mut w = poll_until_ready(lock.write(&token)).expect("write failed");
    *w = 1;

    let mut r_fut = lock.read(&token);
    assert!(poll_once(&mut r_fut).is_none(), "reader must park behind writer");

    drop(w);

    let guard = poll_once(&mut r_fut)
        .expect("reader woken by release")
        .expect("read failed");
    coopsync::assert_with_log!(*guard == 1, "reader sees the write", 1u32, *guard);
    coopsync::test_complete!("writer_excludes_readers_until_release");
}

#[test]
fn reader_batch_resumes_after_writer_turn() {
    init_test_logging();
    coopsync::test_phase!("reader_batch_resumes_after_writer_turn");
    let token = CancelToken::new();
    let lock = RwLock::new(0_u32);

    // Three readers in, all immediate.
    let r1 = poll_until_ready(lock.read(&token)).expect("read failed");
    let r2 = poll_until_ready(lock.read(&token)).expect("read failed");
    let r3 = poll_until_ready(lock.read(&token)).expect("read failed");

    // A writer queues; a fourth reader must queue behind it.
    let mut w_fut = lock.write(&token);
    assert!(poll_once(&mut w_fut).is_none());
    let mut r4_fut = lock.read(&token);
    assert!(poll_once(&mut r4_fut).is_none());

    // Draining the readers admits the writer, not the fourth reader.
    drop(r1);
    drop(r2);
    assert!(poll_once(&mut w_fut).is_none(), "writer needs all readers out");
    assert!(poll_once(&mut r4_fut).is_none());
    drop(r3);

    let mut w = poll_once(&mut w_fut)
        .expect("writer woken")
        .expect("write failed");
    assert!(
        poll_once(&mut r4_fut).is_none(),
        "reader waits out the writer's turn"
    );
    *w = 7;
    drop(w);

    let r4 = poll_once(&mut r4_fut)
        .expect("reader woken after writer")
        .expect("read failed");
    coopsync::assert_with_log!(*r4 == 7, "late reader sees the write", 7u32, *r4);
    coopsync::test_complete!("reader_batch_resumes_after_writer_turn");
}

#[test]
fn upgradable_seat_hands_over_fifo() {
    init_test_logging();
    coopsync::test_phase!("upgradable_seat_hands_over_fifo");
    let token = CancelToken::new();
    let lock = RwLock::new(());

    let r1 = poll_until_ready(lock.read(&token)).expect("read failed");
    let ur1 = poll_until_ready(lock.upgradable_read(&token)).expect("upgradable failed");

    let mut ur2_fut = lock.upgradable_read(&token);
    assert!(poll_once(&mut ur2_fut).is_none(), "one upgradable at a time");

    drop(r1);
    assert!(
        poll_once(&mut ur2_fut).is_none(),
        "reader release does not free the seat"
    );

    drop(ur1);
    let ur2 = poll_once(&mut ur2_fut).expect("seat handed over");
    assert!(ur2.is_ok());
    coopsync::test_complete!("upgradable_seat_hands_over_fifo");
}

#[test]
fn upgrade_resolves_once_readers_drain() {
    init_test_logging();
    coopsync::test_phase!("upgrade_resolves_once_readers_drain");
    let token = CancelToken::new();
    let lock = RwLock::new(Vec::<u32>::new());

    let mut ur = poll_until_ready(lock.upgradable_read(&token)).expect("upgradable failed");
    let r = poll_until_ready(lock.read(&token)).expect("read failed");

    let mut up_fut = ur.upgrade(&token);
    assert!(poll_once(&mut up_fut).is_none(), "upgrade waits for the reader");

    // While the upgrade waits, the lock admits no new readers.
    assert!(lock.try_read().is_err());

    drop(r);
    let mut w = poll_once(&mut up_fut)
        .expect("upgrade woken by last release")
        .expect("upgrade failed");
    w.push(1);
    drop(w);
    drop(up_fut);

    coopsync::assert_with_log!(ur.len() == 1, "upgradable sees its own write", 1usize, ur.len());
    coopsync::test_complete!("upgrade_resolves_once_readers_drain");
}

#[test]
fn cancellation_excises_waiter_without_phantom_wake() {
    init_test_logging();
    coopsync::test_phase!("cancellation_excises_waiter_without_phantom_wake");
    let token = CancelToken::new();
    let read_token = CancelToken::new();
    let lock = RwLock::new(0_u32);

    let w = poll_until_ready(lock.write(&token)).expect("write failed");

    let mut r_fut = lock.read(&read_token);
    assert!(poll_once(&mut r_fut).is_none());

    read_token.cancel();
    let rejected = poll_once(&mut r_fut).expect("cancellation observed");
    assert_eq!(rejected.unwrap_err(), RwLockError::Cancelled);
    drop(r_fut);

    // The release finds no reader to wake and the lock goes idle.
    drop(w);
    assert!(!lock.is_locked());
    assert!(lock.try_write().is_ok());
    coopsync::test_complete!("cancellation_excises_waiter_without_phantom_wake");
}

#[test]
fn upgrade_beats_writer_queued_during_wait() {
    init_test_logging();
    coopsync::test_phase!("upgrade_beats_writer_queued_during_wait");
    let token = CancelToken::new();
    let lock = RwLock::new(0_u32);

    let mut ur = poll_until_ready(lock.upgradable_read(&token)).expect("upgradable failed");
    let r = poll_until_ready(lock.read(&token)).expect("read failed");

    let mut up_fut = ur.upgrade(&token);
    assert!(poll_once(&mut up_fut).is_none());

    // A writer arriving during the wait parks behind the upgrade.
    let mut w_fut = lock.write(&token);
    assert!(poll_once(&mut w_fut).is_none());

    drop(r);
    let upgraded = poll_once(&mut up_fut).expect("upgrade resolves first");
    assert!(upgraded.is_ok());
    assert!(poll_once(&mut w_fut).is_none(), "writer blocked behind upgrade");

    // Only the upgradable guard's own release lets the writer through.
    drop(upgraded);
    drop(up_fut);
    assert!(poll_once(&mut w_fut).is_none(), "upgradable reader still inside");
    drop(ur);

    let w = poll_once(&mut w_fut).expect("writer admitted last");
    assert!(w.is_ok());
    coopsync::test_complete!("upgrade_beats_writer_queued_during_wait");
}
