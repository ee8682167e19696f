// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! A small pool of worker threads executing tasks at (or after) a given
//! deadline. At most one thread at a time waits with a timeout on the
//! earliest deadline; the rest sleep untimed until the queue changes
//! underneath them. Only the DNS resolver uses this pool.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Instant;

#[cfg(test)]
mod tests;

//==============================================================================
// Constants & Structures
//==============================================================================

type Task = Box<dyn FnOnce() + Send>;

struct Work {
    at: Instant,
    seq: u64,
    task: Task,
}

struct State {
    queue: BinaryHeap<Work>,
    next_seq: u64,
    exit: bool,
    /// Worker id (1-based) of the thread waiting with a timeout on the
    /// earliest deadline, or 0. Everyone else waits untimed.
    sleeper: usize,
}

struct Inner {
    state: Mutex<State>,
    wake: Condvar,
}

/// Priority pool keyed by deadline. Dropping the pool stops the workers
/// after their in-flight tasks; queued tasks are discarded, not drained.
pub struct ThreadPool {
    inner: Arc<Inner>,
    threads: Vec<JoinHandle<()>>,
}

//==============================================================================
// Trait Implementations
//==============================================================================

impl PartialEq for Work {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl Eq for Work {}

impl PartialOrd for Work {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Work {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // `BinaryHeap` is a max-heap; reverse the comparison so `peek()`
        // yields the earliest deadline, ties broken by submission order.
        (other.at, other.seq).cmp(&(self.at, self.seq))
    }
}

//==============================================================================
// Associate Functions
//==============================================================================

/// Associate functions for [ThreadPool].
impl ThreadPool {
    /// Creates a pool with `num_threads` workers.
    pub fn new(num_threads: usize) -> Self {
        let inner = Arc::new(Inner {
            state: Mutex::new(State {
                queue: BinaryHeap::new(),
                next_seq: 0,
                exit: false,
                sleeper: 0,
            }),
            wake: Condvar::new(),
        });
        let threads = (0..num_threads)
            .map(|i| {
                let inner = inner.clone();
                thread::Builder::new()
                    .name(format!("dns-worker-{}", i))
                    .spawn(move || worker(&inner, i + 1))
                    .expect("failed to spawn pool thread")
            })
            .collect();
        Self { inner, threads }
    }

    /// Runs `task` on one of the workers at or after `at`. Callable from
    /// any thread; never blocks.
    pub fn schedule(&self, at: Instant, task: impl FnOnce() + Send + 'static) {
        let mut state = self.inner.state.lock().unwrap();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.queue.push(Work {
            at,
            seq,
            task: Box::new(task),
        });
        // If the new task jumped to the front, whoever sleeps on the old
        // front deadline must recompute it.
        if state.queue.peek().map(|w| w.seq) == Some(seq) {
            state.sleeper = 0;
            self.inner.wake.notify_one();
        }
    }
}

fn worker(inner: &Inner, tid: usize) {
    loop {
        let task = {
            let mut state = inner.state.lock().unwrap();
            loop {
                if state.exit {
                    return;
                }
                if state.queue.is_empty() {
                    state = inner.wake.wait(state).unwrap();
                    continue;
                }
                let now = Instant::now();
                let front_at = state.queue.peek().unwrap().at;
                if front_at <= now {
                    let work = state.queue.pop().unwrap();
                    state.sleeper = 0;
                    if !state.queue.is_empty() {
                        inner.wake.notify_one();
                    }
                    break work.task;
                }
                if state.sleeper != 0 {
                    state = inner.wake.wait(state).unwrap();
                    continue;
                }
                state.sleeper = tid;
                let (next, _) = inner.wake.wait_timeout(state, front_at - now).unwrap();
                state = next;
                if state.sleeper == tid {
                    state.sleeper = 0;
                }
            }
        };
        task();
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

impl Drop for ThreadPool {
    fn drop(&mut self) {
        {
            let mut state = self.inner.state.lock().unwrap();
            state.exit = true;
        }
        self.inner.wake.notify_all();
        for t in self.threads.drain(..) {
            let _ = t.join();
        }
    }
}
