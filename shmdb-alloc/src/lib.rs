// Copyright 2024-Present the shmdb authors.
// SPDX-License-Identifier: Apache-2.0

//! Process-local arena allocators.
//!
//! The database engine proper never allocates process-local memory on hot
//! paths; everything it owns lives inside the shared segment. The pieces
//! around it (query prefetch pages, query argument storage, parser
//! temporaries) want cheap bump allocation with batch free, which is what
//! [ScratchPool] provides: a chain of sub-areas that doubles in size as it
//! grows and is released as a whole when dropped.

mod pool;

pub use pool::*;

// Expose allocator_api2 for our users.
pub use allocator_api2::alloc::{AllocError, Allocator, Global};
