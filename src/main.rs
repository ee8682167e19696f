// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use catapult::{Options, Proxy};

use std::process;

fn main() {
    if std::env::args().len() != 1 {
        eprintln!("usage: catapult");
        eprintln!();
        eprintln!("To customize, modify `Options::default()` and recompile.");
        process::exit(1);
    }
    flexi_logger::Logger::with_env_or_str("info")
        .start()
        .expect("failed to initialize logging");
    let proxy = match Proxy::new(Options::default()) {
        Ok(proxy) => proxy,
        Err(e) => {
            eprintln!("startup failed: {}", e);
            process::exit(1);
        },
    };
    proxy.run();
}
