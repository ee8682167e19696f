// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

pub mod linked_slab;

pub use self::linked_slab::LinkedSlab;
