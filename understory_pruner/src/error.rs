// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Errors that cross the API boundary.
//!
//! Only storage growth can fail at runtime. Invalid handles and queries against an
//! uncommitted pruner are caller contract violations and are checked with debug
//! assertions instead.

use alloc::vec::Vec;

use crate::types::Handle;

/// Failure to store one more object in an [`ObjectPool`](crate::ObjectPool).
#[derive(Copy, Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    /// The configured object limit was reached.
    #[error("object pool is full ({capacity} objects)")]
    CapacityExceeded {
        /// The configured limit.
        capacity: usize,
    },
    /// The allocator refused to grow the pool storage.
    #[error("failed to grow object storage by {requested} entries")]
    AllocationFailed {
        /// Number of entries that were requested.
        requested: usize,
    },
}

/// A batch insertion that stopped early.
///
/// Objects in `added` were stored and their handles are valid; the rest of the batch
/// was not touched.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("only {} objects of the batch were added", .added.len())]
pub struct PartialAdd {
    /// Handles of the objects that were stored, in batch order.
    pub added: Vec<Handle>,
    /// Why the next object could not be stored.
    #[source]
    pub error: PoolError,
}
