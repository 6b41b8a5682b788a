// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Pruner configuration.

use crate::builder::{BuildSettings, SplitRule};

/// Rebuild rate hint used when none is configured.
pub const DEFAULT_REBUILD_RATE_HINT: u32 = 100;

/// Free-list capacity of the bucket index used when none is configured.
pub const DEFAULT_BUCKET_FREE_CAPACITY: usize = 16;

/// Tunables for an [`IncrementalPruner`](crate::IncrementalPruner).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PrunerConfig {
    /// Number of [`build_step`](crate::IncrementalPruner::build_step) calls a background
    /// rebuild should take. Must be greater than 3.
    pub rebuild_rate_hint: u32,
    /// Rebuild in the background and keep new objects in the bucket index meanwhile.
    /// When false, every commit after a mutation rebuilds the tree from scratch.
    pub incremental: bool,
    /// Settings for every tree the pruner builds.
    pub build: BuildSettings,
    /// Upper bound on stored objects. `None` grows without limit.
    pub max_objects: Option<usize>,
    /// Entries the bucket index keeps unsorted before it switches to full classification.
    pub bucket_free_capacity: usize,
}

impl Default for PrunerConfig {
    fn default() -> Self {
        Self {
            rebuild_rate_hint: DEFAULT_REBUILD_RATE_HINT,
            incremental: true,
            build: BuildSettings::default(),
            max_objects: None,
            bucket_free_capacity: DEFAULT_BUCKET_FREE_CAPACITY,
        }
    }
}

impl PrunerConfig {
    /// Set the rebuild rate hint.
    pub fn with_rebuild_rate_hint(mut self, hint: u32) -> Self {
        self.rebuild_rate_hint = hint;
        self
    }

    /// Choose between incremental rebuilds and full rebuilds on commit.
    pub fn with_incremental(mut self, incremental: bool) -> Self {
        self.incremental = incremental;
        self
    }

    /// Set the split heuristic.
    pub fn with_split_rule(mut self, rule: SplitRule) -> Self {
        self.build.rule = rule;
        self
    }

    /// Set the maximum number of primitives per leaf.
    pub fn with_leaf_limit(mut self, limit: usize) -> Self {
        self.build.leaf_limit = limit.max(1);
        self
    }

    /// Limit the number of stored objects.
    pub fn with_max_objects(mut self, max: usize) -> Self {
        self.max_objects = Some(max);
        self
    }

    /// Set the bucket index free-list capacity.
    pub fn with_bucket_free_capacity(mut self, capacity: usize) -> Self {
        self.bucket_free_capacity = capacity;
        self
    }
}
