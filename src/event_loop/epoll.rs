// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Wrapper around the `epoll(7)` facility. Registrations are keyed by file
//! descriptor and carry an opaque 64-bit cookie that comes back with every
//! ready event.

use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

//==============================================================================
// Constants & Structures
//==============================================================================

pub const IN: u32 = libc::EPOLLIN as u32;
pub const OUT: u32 = libc::EPOLLOUT as u32;
pub const ERR: u32 = libc::EPOLLERR as u32;
pub const ET: u32 = libc::EPOLLET as u32;

/// True iff all of `bits` are set in `events`.
pub fn has_bits(events: u32, bits: u32) -> bool {
    events & bits == bits
}

/// Thread-compatible, not thread-safe: lives on its event loop's thread.
pub struct Epoll {
    epfd: OwnedFd,
    events: Vec<libc::epoll_event>,
    registered: usize,
    ready: usize,
}

//==============================================================================
// Associate Functions
//==============================================================================

/// Associate functions for [Epoll].
impl Epoll {
    pub fn new() -> io::Result<Self> {
        let epfd = unsafe { libc::epoll_create1(0) };
        if epfd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            epfd: unsafe { OwnedFd::from_raw_fd(epfd) },
            events: Vec::new(),
            registered: 0,
            ready: 0,
        })
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, events: u32, cookie: u64) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events,
            u64: cookie,
        };
        let ret = unsafe { libc::epoll_ctl(self.epfd.as_raw_fd(), op, fd, &mut ev) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn add(&mut self, fd: RawFd, events: u32, cookie: u64) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, events, cookie)?;
        self.registered += 1;
        Ok(())
    }

    pub fn modify(&mut self, fd: RawFd, events: u32, cookie: u64) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, events, cookie)
    }

    pub fn remove(&mut self, fd: RawFd) -> io::Result<()> {
        debug_assert!(self.registered > 0);
        self.ctl(libc::EPOLL_CTL_DEL, fd, 0, 0)?;
        self.registered -= 1;
        Ok(())
    }

    /// Blocks until at least one registration is ready or the timeout
    /// elapses. `None` waits forever. Invalidates the previous `ready()`
    /// results.
    pub fn wait(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        if self.events.len() < self.registered.max(1) {
            self.events.resize(
                self.registered.max(1),
                libc::epoll_event { events: 0, u64: 0 },
            );
        }
        let ms: libc::c_int = match timeout {
            // Round up so a positive timeout never becomes a busy poll.
            Some(d) => {
                let ms = (d.as_nanos() + 999_999) / 1_000_000;
                ms.min(libc::c_int::max_value() as u128) as libc::c_int
            },
            None => -1,
        };
        loop {
            let ret = unsafe {
                libc::epoll_wait(
                    self.epfd.as_raw_fd(),
                    self.events.as_mut_ptr(),
                    self.events.len() as libc::c_int,
                    ms,
                )
            };
            if ret >= 0 {
                self.ready = ret as usize;
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                return Err(err);
            }
        }
    }

    /// The `(cookie, events)` pairs produced by the last `wait()`.
    pub fn ready(&self) -> impl Iterator<Item = (u64, u32)> + '_ {
        self.events[..self.ready].iter().map(|ev| {
            // `epoll_event` is packed on this target; copy the fields out.
            let cookie = ev.u64;
            let events = ev.events;
            (cookie, events)
        })
    }
}
