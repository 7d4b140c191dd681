//! End-to-end rendezvous scenarios for the async queue.

mod common;

use common::poll_once;
use coopsync::sync::GetError;
use coopsync::test_utils::init_test_logging;
use coopsync::{AsyncQueue, CancelToken};

#[test]
fn rendezvous_in_both_directions() {
    init_test_logging();
    coopsync::test_phase!("rendezvous_in_both_directions");
    let token = CancelToken::new();
    let queue = AsyncQueue::new();

    // Consumer first: get parks, put delivers.
    let mut fut = queue.get(&token);
    assert!(poll_once(&mut fut).is_none());
    queue.put("a");
    assert_eq!(poll_once(&mut fut), Some(Ok("a")));

    // Producer first: put buffers, get resolves immediately.
    queue.put("b");
    assert_eq!(poll_once(&mut queue.get(&token)), Some(Ok("b")));
    coopsync::test_complete!("rendezvous_in_both_directions");
}

#[test]
fn interleaved_puts_and_gets_pair_in_order() {
    init_test_logging();
    coopsync::test_phase!("interleaved_puts_and_gets_pair_in_order");
    let token = CancelToken::new();
    let queue = AsyncQueue::new();

    // g1 parks; p1 binds to g1; p2 buffers; g2 takes p2's value from the
    // buffer; g3 parks; p3 binds to g3. The k-th get always meets the
    // k-th put.
    let mut g1 = queue.get(&token);
    assert!(poll_once(&mut g1).is_none());

    queue.put(1);
    queue.put(2);

    let mut g2 = queue.get(&token);
    assert_eq!(poll_once(&mut g2), Some(Ok(2)));

    let mut g3 = queue.get(&token);
    assert!(poll_once(&mut g3).is_none());
    queue.put(3);

    assert_eq!(poll_once(&mut g1), Some(Ok(1)));
    assert_eq!(poll_once(&mut g3), Some(Ok(3)));

    coopsync::assert_with_log!(queue.size() == 0, "queue drained", 0isize, queue.size());
    coopsync::test_complete!("interleaved_puts_and_gets_pair_in_order");
}

#[test]
fn producers_never_block_under_backlog() {
    init_test_logging();
    coopsync::test_phase!("producers_never_block_under_backlog");
    let token = CancelToken::new();
    let queue = AsyncQueue::new();

    for i in 0..1_000 {
        queue.put(i);
    }
    coopsync::assert_with_log!(queue.len() == 1_000, "backlog buffered", 1_000usize, queue.len());

    for expected in 0..1_000 {
        assert_eq!(poll_once(&mut queue.get(&token)), Some(Ok(expected)));
    }
    assert!(queue.is_empty());
    coopsync::test_complete!("producers_never_block_under_backlog");
}

#[test]
fn cancelled_consumer_does_not_consume_a_value() {
    init_test_logging();
    coopsync::test_phase!("cancelled_consumer_does_not_consume_a_value");
    let get_token = CancelToken::new();
    let token = CancelToken::new();
    let queue = AsyncQueue::new();

    let mut doomed = queue.get(&get_token);
    assert!(poll_once(&mut doomed).is_none());

    get_token.cancel();
    assert_eq!(poll_once(&mut doomed), Some(Err(GetError::Cancelled)));
    drop(doomed);

    // The next put must reach a live consumer.
    let mut live = queue.get(&token);
    assert!(poll_once(&mut live).is_none());
    queue.put(42);
    assert_eq!(poll_once(&mut live), Some(Ok(42)));
    coopsync::test_complete!("cancelled_consumer_does_not_consume_a_value");
}
