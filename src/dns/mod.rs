// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Collapsing DNS cache. Concurrent `resolve()` calls for the same
//! `host:port` share one synchronous lookup; successful results are served
//! from the cache while their TTL lasts, and entries that keep being used
//! are re-resolved in the background so the cache stays warm.
//!
//! The blocking `getaddrinfo` calls run on the timed thread pool; nothing
//! here ever blocks the caller.


use crate::sync::ThreadPool;

use std::collections::HashMap;
use std::mem;
use std::net::{SocketAddr, SocketAddrV4, ToSocketAddrs};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

//==============================================================================
// Constants & Structures
//==============================================================================

#[derive(Clone, Debug)]
pub struct Options {
    /// Number of threads performing synchronous address lookups. Lookups
    /// for different keys run concurrently; lookups for the same key are
    /// collapsed into one.
    pub num_dns_resolution_threads: usize,
    /// How long a successful lookup may be served from the cache.
    pub dns_cache_ttl: Duration,
    /// How often a cached entry is re-resolved in the background.
    pub dns_cache_refresh_period: Duration,
    /// How long after its last use an entry keeps being refreshed.
    pub dns_cache_refresh_duration: Duration,
}

/// Immutable, shared result of one successful lookup: the IPv4 addresses
/// for a `host:port`, in resolver order.
pub type Addrs = Arc<Vec<SocketAddrV4>>;

pub type Callback = Box<dyn FnOnce(Option<Addrs>) + Send>;

type LookupFn = Box<dyn Fn(&str) -> Option<Addrs> + Send + Sync>;

struct Entry {
    /// Non-empty iff a lookup for this key is scheduled or in flight; the
    /// waiters all receive the result of that lookup.
    callbacks: Vec<Callback>,
    addr: Option<Addrs>,
    used_at: Instant,
    resolved_at: Option<Instant>,
    successfully_resolved_at: Option<Instant>,
}

struct Inner {
    opt: Options,
    cache: Mutex<HashMap<String, Entry>>,
    pool: ThreadPool,
    lookup: LookupFn,
}

#[derive(Clone)]
pub struct DnsResolver {
    inner: Arc<Inner>,
}

//==============================================================================
// Associate Functions
//==============================================================================

/// Resolves `host:port` to IPv4 addresses with the system resolver.
/// Returns `None` on a malformed key, a non-numeric port, or a lookup
/// that yields no IPv4 address.
fn system_lookup(host_port: &str) -> Option<Addrs> {
    let colon = match host_port.find(':') {
        Some(ix) => ix,
        None => {
            warn!("malformed host:port: {}", host_port);
            return None;
        },
    };
    let host = &host_port[..colon];
    let port: u16 = match host_port[colon + 1..].parse() {
        Ok(port) => port,
        Err(_) => {
            warn!("bad port in '{}'", host_port);
            return None;
        },
    };
    match (host, port).to_socket_addrs() {
        Ok(addrs) => {
            let v4: Vec<SocketAddrV4> = addrs
                .filter_map(|addr| match addr {
                    SocketAddr::V4(addr) => Some(addr),
                    SocketAddr::V6(_) => None,
                })
                .collect();
            if v4.is_empty() {
                warn!("no IPv4 address for '{}'", host_port);
                None
            } else {
                info!("resolved {} as {}", host_port, v4[0]);
                Some(Arc::new(v4))
            }
        },
        Err(e) => {
            warn!("DNS error for '{}': {}", host_port, e);
            None
        },
    }
}

/// Associate functions for [Entry].
impl Entry {
    fn new(now: Instant) -> Self {
        Self {
            callbacks: Vec::new(),
            addr: None,
            used_at: now,
            resolved_at: None,
            successfully_resolved_at: None,
        }
    }

    fn fresh(&self, ttl: Duration, now: Instant) -> bool {
        self.successfully_resolved_at
            .map_or(false, |at| at + ttl > now)
    }
}

/// Associate functions for [DnsResolver].
impl DnsResolver {
    pub fn new(opt: Options) -> Self {
        Self::with_lookup(opt, Box::new(system_lookup))
    }

    fn with_lookup(opt: Options, lookup: LookupFn) -> Self {
        let pool = ThreadPool::new(opt.num_dns_resolution_threads);
        Self {
            inner: Arc::new(Inner {
                opt,
                cache: Mutex::new(HashMap::new()),
                pool,
                lookup,
            }),
        }
    }

    /// Resolves `host_port` ("host:port" or "ip:port"). The callback runs
    /// exactly once, possibly synchronously on the calling thread, with
    /// `None` on failure. Never blocks.
    pub fn resolve(&self, host_port: &str, cb: Callback) {
        let now = Instant::now();
        let mut cache = self.inner.cache.lock().unwrap();
        if !cache.contains_key(host_port) {
            let mut entry = Entry::new(now);
            entry.callbacks.push(cb);
            cache.insert(host_port.to_owned(), entry);
            drop(cache);
            let weak = Arc::downgrade(&self.inner);
            let key = host_port.to_owned();
            self.inner
                .pool
                .schedule(now, move || process_entry(&weak, key));
            return;
        }
        let entry = cache.get_mut(host_port).unwrap();
        if !entry.callbacks.is_empty() {
            // A lookup is already in flight; wait for its result rather
            // than serving a possibly stale cached address.
            entry.callbacks.push(cb);
            return;
        }
        let addr = if entry.fresh(self.inner.opt.dns_cache_ttl, now) {
            entry.addr.clone()
        } else {
            None
        };
        entry.used_at = entry.used_at.max(now);
        drop(cache);
        cb(addr);
    }

    #[cfg(test)]
    fn cached_entries(&self) -> usize {
        self.inner.cache.lock().unwrap().len()
    }
}

/// One step of an entry's background life cycle: evict it if it has gone
/// unused for the keep-warm window, re-resolve it if waiters are queued or
/// the refresh period has lapsed, then reschedule.
fn process_entry(weak: &Weak<Inner>, key: String) {
    let inner = match weak.upgrade() {
        Some(inner) => inner,
        None => return,
    };
    let opt = &inner.opt;
    let now = Instant::now();
    let mut cache = inner.cache.lock().unwrap();
    let (evict, due) = {
        let entry = match cache.get_mut(&key) {
            Some(entry) => entry,
            None => return,
        };
        let evict =
            entry.callbacks.is_empty() && now >= entry.used_at + opt.dns_cache_refresh_duration;
        let due = !entry.callbacks.is_empty()
            || entry
                .resolved_at
                .map_or(true, |at| now >= at + opt.dns_cache_refresh_period);
        (evict, due)
    };
    if evict {
        cache.remove(&key);
        return;
    }
    drop(cache);
    if due {
        let addr = (inner.lookup)(&key);
        let now = Instant::now();
        let mut cache = inner.cache.lock().unwrap();
        let entry = match cache.get_mut(&key) {
            Some(entry) => entry,
            None => return,
        };
        if !entry.callbacks.is_empty() {
            entry.used_at = now;
        }
        let callbacks = mem::replace(&mut entry.callbacks, Vec::new());
        entry.resolved_at = Some(now);
        if let Some(ref addr) = addr {
            // A failed refresh keeps the previous address; it stays
            // servable until the TTL since the last success lapses.
            entry.addr = Some(addr.clone());
            entry.successfully_resolved_at = Some(now);
        }
        drop(cache);
        for cb in callbacks {
            cb(addr.clone());
        }
    }
    let cache = inner.cache.lock().unwrap();
    let next = match cache.get(&key) {
        Some(entry) => {
            let refresh = entry
                .resolved_at
                .map_or(now, |at| at + opt.dns_cache_refresh_period);
            let expire = entry.used_at + opt.dns_cache_refresh_duration;
            refresh.min(expire)
        },
        None => return,
    };
    drop(cache);
    let weak = weak.clone();
    inner
        .pool
        .schedule(next, move || process_entry(&weak, key));
}

//==============================================================================
// Trait Implementations
//==============================================================================

impl Default for Options {
    fn default() -> Self {
        Self {
            num_dns_resolution_threads: 8,
            dns_cache_ttl: Duration::from_secs(300),
            dns_cache_refresh_period: Duration::from_secs(75),
            dns_cache_refresh_duration: Duration::from_secs(3600),
        }
    }
}
