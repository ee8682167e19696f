// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use super::*;

fn order<T>(list: &LinkedSlab<T>) -> Vec<usize> {
    list.keys().collect()
}

/// Tests that pushes preserve insertion order from head to tail.
#[test]
fn push_order() {
    let mut list = LinkedSlab::new();
    let a = list.push_back("a");
    let b = list.push_back("b");
    let c = list.push_back("c");
    assert_eq!(order(&list), vec![a, b, c]);
    assert_eq!(list.front(), Some(a));
    assert_eq!(list.len(), 3);
}

/// Tests removal from the head, the middle, and the tail of the chain.
#[test]
fn remove_everywhere() {
    let mut list = LinkedSlab::new();
    let a = list.push_back(1);
    let b = list.push_back(2);
    let c = list.push_back(3);
    let d = list.push_back(4);

    assert_eq!(list.remove(b), Some(2));
    assert_eq!(order(&list), vec![a, c, d]);

    assert_eq!(list.remove(a), Some(1));
    assert_eq!(order(&list), vec![c, d]);
    assert_eq!(list.front(), Some(c));

    assert_eq!(list.remove(d), Some(4));
    assert_eq!(order(&list), vec![c]);

    assert_eq!(list.remove(c), Some(3));
    assert!(list.is_empty());
    assert_eq!(list.front(), None);

    // Double remove is a no-op.
    assert_eq!(list.remove(c), None);
}

/// Tests that refreshing an entry moves it to the tail without changing
/// its key.
#[test]
fn move_to_back_keeps_key() {
    let mut list = LinkedSlab::new();
    let a = list.push_back("a");
    let b = list.push_back("b");
    let c = list.push_back("c");

    list.move_to_back(a);
    assert_eq!(order(&list), vec![b, c, a]);
    assert_eq!(list.get(a), Some(&"a"));

    // Refreshing the tail changes nothing.
    list.move_to_back(a);
    assert_eq!(order(&list), vec![b, c, a]);

    list.move_to_back(c);
    assert_eq!(order(&list), vec![b, a, c]);
}

/// Tests that a single-element list survives a refresh.
#[test]
fn move_to_back_singleton() {
    let mut list = LinkedSlab::new();
    let a = list.push_back(7);
    list.move_to_back(a);
    assert_eq!(order(&list), vec![a]);
    assert_eq!(list.front(), Some(a));
}

/// Tests that slab slots freed by remove may be reused while live keys
/// stay valid.
#[test]
fn key_reuse() {
    let mut list = LinkedSlab::new();
    let a = list.push_back("a");
    let b = list.push_back("b");
    list.remove(a);

    let c = list.push_back("c");
    assert_eq!(list.get(b), Some(&"b"));
    assert_eq!(list.get(c), Some(&"c"));
    assert_eq!(order(&list), vec![b, c]);
}

/// Tests mutable access through a key.
#[test]
fn get_mut() {
    let mut list = LinkedSlab::new();
    let a = list.push_back(10);
    *list.get_mut(a).unwrap() += 5;
    assert_eq!(list.get(a), Some(&15));
    assert!(list.get(a + 100).is_none());
}
