// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use catapult::collections::LinkedSlab;
use criterion::{criterion_group, criterion_main, Criterion};

/// The event loop refreshes one deadline per serviced event; this is the
/// hot path that must stay O(1) with thousands of live registrations.
fn refresh_churn(c: &mut Criterion) {
    let mut list = LinkedSlab::new();
    let keys: Vec<usize> = (0..4096).map(|i| list.push_back(i)).collect();
    let mut i = 0;
    c.bench_function("move_to_back_4k", move |b| {
        b.iter(|| {
            list.move_to_back(keys[i % keys.len()]);
            i += 1;
        })
    });
}

fn push_remove(c: &mut Criterion) {
    c.bench_function("push_remove", |b| {
        let mut list = LinkedSlab::new();
        b.iter(|| {
            let key = list.push_back(0u64);
            list.remove(key);
        })
    });
}

criterion_group!(benches, refresh_churn, push_remove);
criterion_main!(benches);
