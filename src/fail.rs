// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use custom_error::custom_error;

use std::io;
use std::process;

custom_error! {#[derive(Clone, PartialEq, Eq)] pub Fail
    Malformed{ details: &'static str } = "malformed request ({details})",
    TooBig{} = "request too big",
    Timeout{} = "operation timed out",
    ResolveFailed{} = "address resolution failed",
    ConnectFailed{} = "connection attempt failed",
    OutOfResources{ details: &'static str } = "out of resources ({details})",
    Unsupported{ details: &'static str } = "unsupported ({details})",
}

/// Errno values that mean the process ran out of descriptors or memory.
/// These are survivable: the current chain is dropped and the proxy keeps
/// serving.
pub fn is_capacity_errno(errno: i32) -> bool {
    errno == libc::EMFILE || errno == libc::ENFILE || errno == libc::ENOBUFS || errno == libc::ENOMEM
}

//==============================================================================
// Trait Implementations
//==============================================================================

/// Fail-fast escape hatch for OS calls that must not fail. Anything the
/// kernel contract says cannot happen (epoll registration on a live fd,
/// close, setsockopt on a fresh socket, ...) aborts the process instead of
/// unwinding a reactor thread.
pub trait OrDie<T> {
    fn or_die(self, what: &str) -> T;
}

impl<T> OrDie<T> for io::Result<T> {
    fn or_die(self, what: &str) -> T {
        match self {
            Ok(v) => v,
            Err(e) => {
                error!("FATAL {}: {}", what, e);
                process::abort();
            },
        }
    }
}
