// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Single-threaded readiness-driven event loop. Each loop owns an epoll
//! instance, a wake pipe for cross-thread task submission, and an ordered
//! deadline list so idle handlers can be torn down.
//!
//! Handlers are registered with `add()` and addressed by the returned
//! [Token]. A token is stamped with a generation, so a handler that was
//! removed (possibly by its peer, mid-dispatch) is reliably detected as
//! stale even if its slab slot has been reused.

pub mod epoll;

#[cfg(test)]
mod tests;

use crate::collections::LinkedSlab;
use crate::fail::OrDie;
use crate::sock;

use crossbeam_channel::{Receiver, Sender};

use std::cell::RefCell;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

//==============================================================================
// Constants & Structures
//==============================================================================

/// Cookie reserved for the wake pipe's read end.
const WAKE_COOKIE: u64 = u64::MAX;

static NEXT_TAG: AtomicU64 = AtomicU64::new(0);

thread_local! {
    /// The core of the event loop running on this thread, if any. Set once
    /// by the loop thread at startup; `add`/`remove`/`modify` reach the
    /// core through this slot.
    static CURRENT: RefCell<Option<(u64, Rc<RefCell<LoopCore>>)>> = RefCell::new(None);
}

/// The unit of registration. Handler state lives behind `RefCell`s inside
/// the implementor; the loop only ever takes `&self`.
pub trait EventHandler {
    /// The descriptor this handler is interested in.
    fn fd(&self) -> RawFd;

    /// Called from the loop thread when the descriptor is ready. The loop
    /// holds a reference on the handler for the duration of the call.
    fn on_event(&self, lp: &EventLoop, token: Token, events: u32);

    /// Called from the loop thread when the idle deadline passes without
    /// any event. The loop holds a reference for the duration of the call.
    fn on_timeout(&self, lp: &EventLoop, token: Token);
}

/// Names one live registration. Stale after `remove()`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Token {
    key: usize,
    gen: u64,
}

struct Registration {
    handler: Rc<dyn EventHandler>,
    gen: u64,
    deadline: Instant,
}

/// State owned by the loop thread. The registration slab doubles as the
/// deadline list: list order is deadline order, because every deadline is
/// assigned as `now + timeout` and refreshed entries move to the tail.
struct LoopCore {
    epoll: epoll::Epoll,
    regs: LinkedSlab<Registration>,
    next_gen: u64,
    timeout: Duration,
}

type Task = Box<dyn FnOnce() + Send>;

struct Shared {
    tag: u64,
    thread: ThreadId,
    task_tx: Sender<Task>,
    wake_tx: OwnedFd,
}

/// Cheaply cloneable handle to an event loop. The loop thread itself is
/// spawned by `new()` and runs for the life of the process, like every
/// other piece of per-stage machinery in this proxy.
#[derive(Clone)]
pub struct EventLoop {
    shared: Arc<Shared>,
}

//==============================================================================
// Associate Functions
//==============================================================================

/// Associate functions for [EventLoop].
impl EventLoop {
    /// Spawns the loop thread. `timeout` is both the poll granularity and
    /// the idle limit applied to every handler registered with this loop.
    pub fn new(timeout: Duration) -> Self {
        assert!(timeout > Duration::from_millis(0));
        let (wake_rx, wake_tx) = sock::pipe().or_die("create wake pipe");
        let (task_tx, task_rx) = crossbeam_channel::unbounded();
        let (boot_tx, boot_rx) = crossbeam_channel::bounded::<EventLoop>(1);
        let tag = NEXT_TAG.fetch_add(1, Ordering::Relaxed);
        let join = thread::Builder::new()
            .name(format!("event-loop-{}", tag))
            .spawn(move || {
                let lp = boot_rx.recv().expect("event loop handle lost at startup");
                let core = Rc::new(RefCell::new(LoopCore {
                    epoll: epoll::Epoll::new().or_die("create epoll instance"),
                    regs: LinkedSlab::new(),
                    next_gen: 0,
                    timeout,
                }));
                core.borrow_mut()
                    .epoll
                    .add(wake_rx.as_raw_fd(), epoll::IN, WAKE_COOKIE)
                    .or_die("register wake pipe");
                CURRENT.with(|cur| *cur.borrow_mut() = Some((tag, core.clone())));
                run_loop(&lp, &core, &task_rx, &wake_rx);
            })
            .expect("failed to spawn event loop thread");
        let lp = EventLoop {
            shared: Arc::new(Shared {
                tag,
                thread: join.thread().id(),
                task_tx,
                wake_tx,
            }),
        };
        boot_tx.send(lp.clone()).expect("event loop thread gone at startup");
        lp
    }

    fn is_loop_thread(&self) -> bool {
        thread::current().id() == self.shared.thread
    }

    fn with_core<R>(&self, what: &str, f: impl FnOnce(&mut LoopCore) -> R) -> R {
        let core = CURRENT.with(|cur| match cur.borrow().as_ref() {
            Some((tag, core)) if *tag == self.shared.tag => core.clone(),
            _ => panic!("{}() called off its event loop thread", what),
        });
        let mut core = core.borrow_mut();
        f(&mut core)
    }

    /// Registers a handler with the given readiness mask and arms its idle
    /// deadline. Loop thread only.
    pub fn add(&self, handler: Rc<dyn EventHandler>, events: u32) -> Token {
        self.with_core("add", |core| core.add(handler, events))
    }

    /// Unregisters a handler; its `on_event`/`on_timeout` will not fire
    /// again unless it is re-added. Loop thread only.
    pub fn remove(&self, token: Token) {
        self.with_core("remove", |core| core.remove(token))
    }

    /// Changes the readiness mask only; deadlines are refreshed by the
    /// loop after each serviced event. Loop thread only.
    pub fn modify(&self, token: Token, events: u32) {
        self.with_core("modify", |core| core.modify(token, events))
    }

    /// Pushes a handler's idle deadline out to `now + timeout`. The loop
    /// does this automatically for the handler it dispatched; a handler
    /// that moved data on behalf of a peer refreshes the peer explicitly.
    /// Loop thread only.
    pub fn refresh(&self, token: Token) {
        self.with_core("refresh", |core| {
            if core.is_live(token) {
                core.refresh(token.key);
            }
        })
    }

    /// Number of live registrations. Loop thread only.
    pub fn registered(&self) -> usize {
        self.with_core("registered", |core| core.regs.len())
    }

    /// Runs `f` on the loop thread. Tasks are executed in submission
    /// order, interleaved with I/O dispatch. Must not be called from the
    /// loop thread itself: use `schedule_or_run` there.
    pub fn schedule(&self, f: impl FnOnce() + Send + 'static) {
        debug_assert!(
            !self.is_loop_thread(),
            "schedule() called from its own event loop thread"
        );
        self.shared
            .task_tx
            .send(Box::new(f))
            .expect("event loop task queue closed");
        sock::write(self.shared.wake_tx.as_raw_fd(), &[0]).or_die("wake event loop");
    }

    /// Runs `f` inline when already on the loop thread, otherwise
    /// schedules it.
    pub fn schedule_or_run(&self, f: impl FnOnce() + Send + 'static) {
        if self.is_loop_thread() {
            f();
        } else {
            self.schedule(f);
        }
    }
}

/// Associate functions for [LoopCore].
impl LoopCore {
    fn is_live(&self, token: Token) -> bool {
        self.regs.get(token.key).map_or(false, |reg| reg.gen == token.gen)
    }

    fn add(&mut self, handler: Rc<dyn EventHandler>, events: u32) -> Token {
        let fd = handler.fd();
        let gen = self.next_gen;
        self.next_gen += 1;
        let deadline = Instant::now() + self.timeout;
        let key = self.regs.push_back(Registration {
            handler,
            gen,
            deadline,
        });
        self.epoll.add(fd, events, key as u64).or_die("epoll registration");
        Token { key, gen }
    }

    fn remove(&mut self, token: Token) {
        assert!(self.is_live(token), "remove() with a stale token");
        let fd = self.regs.get(token.key).unwrap().handler.fd();
        self.epoll.remove(fd).or_die("epoll deregistration");
        self.regs.remove(token.key);
    }

    fn modify(&mut self, token: Token, events: u32) {
        assert!(self.is_live(token), "modify() with a stale token");
        let fd = self.regs.get(token.key).unwrap().handler.fd();
        self.epoll
            .modify(fd, events, token.key as u64)
            .or_die("epoll modification");
    }

    fn refresh(&mut self, key: usize) {
        let deadline = Instant::now() + self.timeout;
        if let Some(reg) = self.regs.get_mut(key) {
            reg.deadline = deadline;
            self.regs.move_to_back(key);
        }
    }
}

//==============================================================================
// Loop Thread
//==============================================================================

enum Harvested {
    /// One queued cross-thread task is runnable.
    Wake,
    /// A handler observed readiness. The `Rc` keeps it alive across the
    /// whole batch so a peer-initiated `remove` cannot finalize it while
    /// its own dispatch is still pending.
    Io {
        token: Token,
        handler: Rc<dyn EventHandler>,
        events: u32,
    },
}

fn run_loop(
    lp: &EventLoop,
    core: &Rc<RefCell<LoopCore>>,
    task_rx: &Receiver<Task>,
    wake_rx: &OwnedFd,
) {
    loop {
        {
            let mut core = core.borrow_mut();
            let timeout = core.timeout;
            core.epoll.wait(Some(timeout)).or_die("epoll wait");
        }

        // Take a reference on every ready handler before dispatching any
        // of them, then dispatch. No core borrow is held while handler
        // code runs, so handlers are free to add/remove/modify.
        let batch: Vec<Harvested> = {
            let core = core.borrow();
            core.epoll
                .ready()
                .filter_map(|(cookie, events)| {
                    if cookie == WAKE_COOKIE {
                        return Some(Harvested::Wake);
                    }
                    let key = cookie as usize;
                    core.regs.get(key).map(|reg| Harvested::Io {
                        token: Token { key, gen: reg.gen },
                        handler: reg.handler.clone(),
                        events,
                    })
                })
                .collect()
        };

        for harvested in batch {
            match harvested {
                Harvested::Wake => {
                    let mut byte = [0u8; 1];
                    let n = sock::read(wake_rx.as_raw_fd(), &mut byte).or_die("drain wake pipe");
                    if n == 0 {
                        // Every handle is gone; nothing can reach this
                        // loop anymore.
                        debug!("event loop orphaned, shutting down");
                        return;
                    }
                    if let Ok(task) = task_rx.try_recv() {
                        task();
                    }
                },
                Harvested::Io {
                    token,
                    handler,
                    events,
                } => {
                    if !core.borrow().is_live(token) {
                        continue;
                    }
                    handler.on_event(lp, token, events);
                    if core.borrow().is_live(token) {
                        core.borrow_mut().refresh(token.key);
                    }
                },
            }
        }

        // Tear down handlers whose idle deadline has passed. The list is
        // sorted, so only the head needs checking.
        loop {
            let now = Instant::now();
            let expired = {
                let core = core.borrow();
                match core.regs.front() {
                    Some(key) => {
                        let reg = core.regs.get(key).unwrap();
                        if reg.deadline <= now {
                            Some((Token { key, gen: reg.gen }, reg.handler.clone()))
                        } else {
                            None
                        }
                    },
                    None => None,
                }
            };
            let (token, handler) = match expired {
                Some(pair) => pair,
                None => break,
            };
            handler.on_timeout(lp, token);
            if core.borrow().is_live(token) {
                core.borrow_mut().refresh(token.key);
            }
        }
    }
}
