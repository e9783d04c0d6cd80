// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Read-node selection.
//!
//! A selector gets the candidate list and the primary and returns the node
//! reads should go to. Returning the primary (or `None`) means "no replica".
//! A selector never changes which node takes writes.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::NodeAddress;

type SelectFn = dyn Fn(&[NodeAddress], &NodeAddress) -> Option<NodeAddress> + Send + Sync;

#[derive(Clone)]
pub struct ReplicaSelector {
    select: Arc<SelectFn>,
}

impl ReplicaSelector {
    /// Wrap a caller-supplied selection function.
    pub fn new<F>(select: F) -> Self
    where
        F: Fn(&[NodeAddress], &NodeAddress) -> Option<NodeAddress> + Send + Sync + 'static,
    {
        Self {
            select: Arc::new(select),
        }
    }

    /// Uniform random pick from an entropy-seeded generator.
    pub fn random() -> Self {
        Self::seeded(rand::thread_rng().gen())
    }

    /// Uniform random pick, reproducible for a given seed.
    pub fn seeded(seed: u64) -> Self {
        let rng = Mutex::new(StdRng::seed_from_u64(seed));
        Self::new(move |candidates, _primary| {
            if candidates.is_empty() {
                return None;
            }
            let idx = rng.lock().gen_range(0..candidates.len());
            candidates.get(idx).cloned()
        })
    }

    /// Always the first candidate.
    pub fn first() -> Self {
        Self::new(|candidates, _primary| candidates.first().cloned())
    }

    /// Replica to read from, or `None` when reads stay on the primary.
    pub fn choose(&self, candidates: &[NodeAddress], primary: &NodeAddress) -> Option<NodeAddress> {
        if candidates.is_empty() {
            return None;
        }
        (self.select)(candidates, primary).filter(|chosen| chosen != primary)
    }
}

impl Default for ReplicaSelector {
    fn default() -> Self {
        Self::random()
    }
}

impl fmt::Debug for ReplicaSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ReplicaSelector")
    }
}
