// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::atomic::{AtomicU64, AtomicUsize};

use crate::node::{EdgeHandle, NodeRef};

///
/// A frame on the force stack: the node currently evaluating, plus the
/// outgoing edges it has recorded so far, in call order. Only the top frame
/// is ever appended to; the stack as a whole is read when attributing new
/// edges and when checking clean-ancestry assertions.
///
pub(crate) struct Frame {
    pub src: NodeRef,
    pub forces: Vec<EdgeHandle>,
    pub creates: Vec<EdgeHandle>,
}

impl Frame {
    pub(crate) fn new(src: NodeRef) -> Frame {
        Frame {
            src,
            forces: Vec::new(),
            creates: Vec::new(),
        }
    }
}

///
/// Opaque engine counters. The engine increments them; interpreting them is
/// the caller's business (benchmarks, incrementality assertions in tests).
///
#[derive(Default, Debug)]
pub struct Stats {
    /// User bodies run (first evaluations and re-evaluations).
    pub evaluated: AtomicUsize,
    /// Repairs that confirmed a cached value without re-running the body.
    pub cleaned: AtomicUsize,
    /// Edges flipped Clean→Dirty by the dirty propagator.
    pub dirtied: AtomicUsize,
    pub memo_hits: AtomicUsize,
    pub memo_misses: AtomicUsize,
    /// Nodes torn down by reference counting.
    pub destroyed: AtomicUsize,
    /// Memo entries dropped by the eviction policy.
    pub evicted: AtomicUsize,
    /// Bumped on every observable cell change.
    pub sequence: AtomicU64,
}
