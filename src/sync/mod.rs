// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

mod thread_pool;

pub use self::thread_pool::ThreadPool;
