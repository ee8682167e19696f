// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use super::*;

use crossbeam_channel::unbounded;

use std::time::Duration;

/// Tests that an already-due task runs promptly.
#[test]
fn runs_immediately() {
    let pool = ThreadPool::new(2);
    let (tx, rx) = unbounded();
    pool.schedule(Instant::now(), move || tx.send(()).unwrap());
    rx.recv_timeout(Duration::from_secs(5)).unwrap();
}

/// Tests that a deferred task does not run before its deadline.
#[test]
fn honors_deadline() {
    let pool = ThreadPool::new(2);
    let (tx, rx) = unbounded();
    let delay = Duration::from_millis(80);
    let scheduled_at = Instant::now();
    pool.schedule(scheduled_at + delay, move || tx.send(Instant::now()).unwrap());
    let ran_at = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(ran_at - scheduled_at >= delay);
}

/// Tests that a later submission with an earlier deadline overtakes the
/// current sleeper.
#[test]
fn earlier_task_overtakes_sleeper() {
    let pool = ThreadPool::new(1);
    let (tx, rx) = unbounded();

    let slow_tx = tx.clone();
    pool.schedule(Instant::now() + Duration::from_millis(300), move || {
        slow_tx.send("slow").unwrap()
    });
    // Give the single worker a moment to start sleeping on the 300ms
    // deadline, then jump the queue.
    thread::sleep(Duration::from_millis(30));
    pool.schedule(Instant::now(), move || tx.send("fast").unwrap());

    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "fast");
    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "slow");
}

/// Tests that due tasks run in deadline order, ties in submission order.
#[test]
fn fifo_for_equal_deadlines() {
    let pool = ThreadPool::new(1);
    let (tx, rx) = unbounded();
    let at = Instant::now() + Duration::from_millis(50);
    for i in 0..8 {
        let tx = tx.clone();
        pool.schedule(at, move || tx.send(i).unwrap());
    }
    for i in 0..8 {
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), i);
    }
}

/// Tests that dropping the pool discards queued work instead of draining
/// it.
#[test]
fn drop_discards_queue() {
    let (tx, rx) = unbounded();
    {
        let pool = ThreadPool::new(1);
        pool.schedule(Instant::now() + Duration::from_secs(3600), move || {
            tx.send(()).unwrap()
        });
    }
    // The pool joined its workers; the far-future task must be gone.
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
}
