// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! An incremental computation engine built around a demanded computation
//! graph (DCG): mutable input cells, memoized suspension thunks, and the
//! force/create edges between them. Mutating a cell dirties the reverse
//! graph lazily; the next force at an affected node repairs it with a
//! truncated in-order walk that re-runs only thunks whose observed
//! dependencies actually changed.

#![deny(warnings)]
// Enable all clippy lints except for many of the pedantic ones. It's a shame this needs to be copied and pasted across crates, but there doesn't appear to be a way to include inner attributes from a common source.
#![deny(
    clippy::all,
    clippy::default_trait_access,
    clippy::expl_impl_clone_on_copy,
    clippy::if_not_else,
    clippy::needless_continue,
    clippy::unseparated_literal_suffix,
    clippy::used_underscore_binding
)]
// It is often more clear to show that nothing is being moved.
#![allow(clippy::match_ref_pats)]
// Subjective style.
#![allow(
    clippy::len_without_is_empty,
    clippy::redundant_field_names,
    clippy::too_many_arguments
)]
// Default isn't as big a deal as people seem to think it is.
#![allow(clippy::new_without_default, clippy::new_ret_no_self)]
// The engine is deliberately single-threaded: shared ownership plus interior
// mutability without Send/Sync is the intended shape.
#![allow(clippy::arc_with_non_send_sync)]

mod context;
mod entry;
mod memo;
mod name;
mod node;

pub use crate::context::Stats;
pub use crate::memo::Mfn;
pub use crate::name::Name;
pub use crate::node::{Art, Data, DcgState, Generation};

use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::mem;
use std::path::Path;
use std::rc::Rc;
use std::sync::atomic;
use std::sync::Arc;

use fixedbitset::FixedBitSet;
use fnv::{FnvHashMap as HashMap, FnvHashSet as HashSet};
use parking_lot::Mutex;
use petgraph::dot;
use petgraph::stable_graph::StableDiGraph;
use petgraph::visit::{EdgeRef, VisitMap, Visitable};
use petgraph::Direction;

use crate::context::Frame;
use crate::node::{
    EdgeHandle, EdgeIx, EdgeKind, EdgeRecord, Flag, Handle, Health, NodeIx, NodeKind, NodeRecord,
    NodeRef, ReleaseQueue, Suspension, Val, ROOT_ID,
};

type PGraph = StableDiGraph<NodeRecord, EdgeRecord, u32>;

///
/// Memo-entry eviction, orthogonal to reference counting: the policy drops
/// memo-table entries, while the node records themselves still die through
/// their reference counts.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EvictionPolicy {
    None,
    Fifo(usize),
    Lru(usize),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EvictionTime {
    OnFlush,
}

///
/// Engine knobs, fixed at instantiation.
///
#[derive(Clone, Debug)]
pub struct Config {
    /// Tear down nodes whose reference count reaches zero.
    pub ref_count: bool,
    /// Obsolete a suspension's previous edges when it re-evaluates; when
    /// off, stale edges linger until the node itself dies (imprecise, for
    /// measurement).
    pub dirty_exactly: bool,
    /// Suppress re-evaluation of a dependent when a re-run dependency
    /// produced an equal value; when off, every dirty edge re-evaluates.
    pub check_receipt: bool,
    /// Defensively re-copy values on the way out of every force.
    pub sanitize_pointers: bool,
    /// Treat nominal calls as generative.
    pub disable_names: bool,
    /// Give structural calls classical (generative) identity.
    pub generative_ids: bool,
    /// Degenerate every memoized call to a fresh cell, for measurement.
    pub disable_mfns: bool,
    /// Check on every new edge that all ancestor frames' edges are Clean.
    pub debug_assert: bool,
    pub eviction_policy: EvictionPolicy,
    pub eviction_time: EvictionTime,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            ref_count: true,
            dirty_exactly: true,
            check_receipt: true,
            sanitize_pointers: false,
            disable_names: false,
            generative_ids: false,
            disable_mfns: false,
            debug_assert: false,
            eviction_policy: EvictionPolicy::None,
            eviction_time: EvictionTime::OnFlush,
        }
    }
}

pub(crate) struct InnerGraph {
    pub pg: PGraph,
    /// Live node id → arena slot. Doubles as the liveness check behind
    /// generational handles.
    ids: HashMap<u64, NodeIx>,
    next_id: u64,
    next_serial: u64,
    /// The force stack. Process-wide mutable state; only the top frame is
    /// appended to.
    pub frames: Vec<Frame>,
    /// Deferred teardowns, keyed by node id.
    undo_buff: HashMap<u64, NodeRef>,
    /// Memo entries in insertion order (touched on hit under LRU).
    pub memo_order: Vec<NodeRef>,
}

impl InnerGraph {
    pub(crate) fn resolve(&self, node: NodeRef) -> Option<&NodeRecord> {
        self.pg
            .node_weight(node.ix)
            .filter(|rec| rec.id == node.id)
    }

    pub(crate) fn resolve_mut(&mut self, node: NodeRef) -> Option<&mut NodeRecord> {
        match self.pg.node_weight_mut(node.ix) {
            Some(rec) if rec.id == node.id => Some(rec),
            _ => None,
        }
    }

    pub(crate) fn edge(&self, eh: EdgeHandle) -> Option<&EdgeRecord> {
        self.pg
            .edge_weight(eh.ix)
            .filter(|e| e.serial == eh.serial)
    }

    pub(crate) fn edge_mut(&mut self, eh: EdgeHandle) -> Option<&mut EdgeRecord> {
        match self.pg.edge_weight_mut(eh.ix) {
            Some(e) if e.serial == eh.serial => Some(e),
            _ => None,
        }
    }

    pub(crate) fn alloc(&mut self, name: Option<Name>, kind: NodeKind) -> NodeRef {
        let id = self.next_id;
        self.next_id += 1;
        let ix = self.pg.add_node(NodeRecord {
            id,
            name,
            refc: 0,
            health: Health::Ok,
            gen: Generation::initial(),
            kind,
        });
        self.ids.insert(id, ix);
        NodeRef { ix, id }
    }

    fn add_edge(
        &mut self,
        src: NodeRef,
        dst: NodeRef,
        kind: EdgeKind,
        flag: Flag,
        observed: Generation,
    ) -> EdgeHandle {
        let serial = self.next_serial;
        self.next_serial += 1;
        let ix = self.pg.add_edge(
            src.ix,
            dst.ix,
            EdgeRecord {
                serial,
                kind,
                flag,
                observed,
            },
        );
        EdgeHandle { ix, serial }
    }

    /// The merge operation on a node's incoming edge set: an equal
    /// pre-existing edge (same dependent, same kind, not Obsolete) is reused
    /// rather than duplicated.
    fn find_edge(&self, src: NodeRef, dst: NodeRef, kind: EdgeKind) -> Option<EdgeHandle> {
        self.pg
            .edges_connecting(src.ix, dst.ix)
            .find(|e| e.weight().kind == kind && e.weight().flag != Flag::Obsolete)
            .map(|e| EdgeHandle {
                ix: e.id(),
                serial: e.weight().serial,
            })
    }

    pub(crate) fn incr_refc(&mut self, node: NodeRef) {
        if let Some(rec) = self.resolve_mut(node) {
            rec.refc += 1;
        }
    }

    ///
    /// The dirty propagator: a breadth-first walk over incoming force edges,
    /// flipping Clean edges to Dirty and enqueueing their dependents. Edges
    /// already Dirty or Obsolete are skipped, which both bounds the work and
    /// guarantees termination on cyclic dependent sets.
    ///
    pub(crate) fn dirty(&mut self, start: NodeIx, stats: &Stats) {
        let mut deque: VecDeque<NodeIx> = VecDeque::new();
        deque.push_back(start);
        let mut walked = self.pg.visit_map();
        while let Some(ix) = deque.pop_front() {
            if !walked.visit(ix) {
                continue;
            }
            let incoming: Vec<(EdgeIx, NodeIx)> = self
                .pg
                .edges_directed(ix, Direction::Incoming)
                .filter(|e| e.weight().kind == EdgeKind::Force && e.weight().flag == Flag::Clean)
                .map(|e| (e.id(), e.source()))
                .collect();
            for (edge_ix, dependent) in incoming {
                if let Some(e) = self.pg.edge_weight_mut(edge_ix) {
                    e.flag = Flag::Dirty;
                }
                stats.dirtied.fetch_add(1, atomic::Ordering::SeqCst);
                deque.push_back(dependent);
            }
        }
    }

    /// Marks a node as unconditionally stale and dirties its dependents.
    pub(crate) fn mark_filthy(&mut self, node: NodeRef, stats: &Stats) {
        if let Some(rec) = self.resolve_mut(node) {
            rec.health = Health::Filthy;
        }
        self.dirty(node.ix, stats);
    }

    fn walk(&self, roots: VecDeque<NodeIx>, direction: Direction) -> Walk<'_> {
        Walk {
            graph: self,
            direction,
            deque: roots,
            walked: self.pg.visit_map(),
        }
    }
}

///
/// A cloneable handle on one demanded computation graph. All public
/// operations go through this handle; clones share the graph.
///
/// The engine is synchronous and single-threaded: user bodies run on the
/// force stack and re-enter it directly. It is not thread-safe and does not
/// claim to be.
///
#[derive(Clone)]
pub struct Dcg {
    pub(crate) inner: Arc<Mutex<InnerGraph>>,
    pub(crate) releases: ReleaseQueue,
    pub(crate) stats: Arc<Stats>,
    pub(crate) config: Arc<Config>,
}

impl Default for Dcg {
    fn default() -> Dcg {
        Dcg::new(Config::default())
    }
}

impl Dcg {
    pub fn new(config: Config) -> Dcg {
        Dcg {
            inner: Arc::new(Mutex::new(InnerGraph {
                pg: PGraph::default(),
                ids: HashMap::default(),
                next_id: ROOT_ID + 1,
                next_serial: 1,
                frames: Vec::new(),
                undo_buff: HashMap::default(),
                memo_order: Vec::new(),
            })),
            releases: Arc::new(Mutex::new(Vec::new())),
            stats: Arc::new(Stats::default()),
            config: Arc::new(config),
        }
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.lock();
        inner.ids.len()
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    ///
    /// Creates a fresh mutable cell. A cell created while a suspension is
    /// evaluating records a create-edge attributing it to that suspension.
    ///
    pub fn cell<T: Data>(&self, name: Name, value: T) -> Art<T> {
        let value = Val::new(value.sanitize());
        let node = {
            let mut inner = self.inner.lock();
            let node = inner.alloc(Some(name), NodeKind::Cell { value });
            self.record_create_edge(&mut inner, node);
            inner.incr_refc(node);
            node
        };
        test_trace_log!("created cell node {}", node.id);
        self.handle(node)
    }

    ///
    /// Overwrites a cell. Forbidden while any computation is running; a
    /// write of a `Data`-equal value is a no-op, otherwise the reverse graph
    /// is dirtied.
    ///
    pub fn set<T: Data>(&self, cell: &Art<T>, value: T) {
        let mut inner = self.inner.lock();
        assert!(
            inner.frames.is_empty(),
            "misuse: cannot set a cell while a computation is running"
        );
        let new = Val::new(value.sanitize());
        let changed = {
            let rec = inner
                .resolve_mut(cell.node)
                .expect("set on a released cell");
            match &mut rec.kind {
                NodeKind::Cell { value: old } => {
                    if *old == new {
                        false
                    } else {
                        *old = new;
                        rec.gen = rec.gen.next();
                        true
                    }
                }
                NodeKind::Susp(_) => panic!("misuse: set on a node that is not a mutable cell"),
            }
        };
        if changed {
            self.stats.sequence.fetch_add(1, atomic::Ordering::SeqCst);
            test_trace_log!("set dirtied node {}", cell.node.id);
            inner.dirty(cell.node.ix, &self.stats);
        }
    }

    ///
    /// Creates an anonymous suspension. The body is not run until the thunk
    /// is first forced.
    ///
    pub fn thunk<T: Data>(&self, name: Name, body: impl Fn(&Dcg) -> T + 'static) -> Art<T> {
        let eval: Rc<node::EvalFn> = Rc::new(move |dcg: &Dcg, _arg: Option<Val>| {
            Val::new(body(dcg))
        });
        let node = {
            let mut inner = self.inner.lock();
            let node = inner.alloc(
                Some(name),
                NodeKind::Susp(Suspension {
                    eval,
                    arg: None,
                    state: None,
                    evict: None,
                }),
            );
            self.record_create_edge(&mut inner, node);
            inner.incr_refc(node);
            node
        };
        test_trace_log!("created thunk node {}", node.id);
        self.handle(node)
    }

    ///
    /// Declares a memoized function. The body takes the recursion handle
    /// plus an argument; `A: Data` is the contract on arguments.
    ///
    pub fn mk_mfn<A: Data, R: Data>(
        &self,
        name: Name,
        body: impl Fn(&Mfn<A, R>, A) -> R + 'static,
    ) -> Mfn<A, R> {
        Mfn::new(self.clone(), name, body)
    }

    ///
    /// Observes a node's value, repairing or evaluating as needed. An
    /// interior force (one happening under a running suspension) records a
    /// dependency edge in that suspension's frame; an external force relies
    /// on the handle's own drop guard for liveness.
    ///
    pub fn force<T: Data>(&self, art: &Art<T>) -> T {
        let (value, gen, state) = entry::force_value(self, art.node);
        {
            let mut inner = self.inner.lock();
            if !inner.frames.is_empty() {
                self.merge_force_edge(&mut inner, art.node, gen, state);
            }
        }
        let value = if self.config.sanitize_pointers {
            value.sanitize()
        } else {
            value
        };
        value
            .downcast::<T>()
            .expect("forced value had an unexpected type")
    }

    ///
    /// Drains pending destructions: reference-count releases from dropped
    /// handles, then deferred teardowns, to a fixed point; finally applies
    /// the memo eviction policy. Idempotent.
    ///
    pub fn flush(&self) {
        loop {
            let pending: Vec<NodeRef> = mem::take(&mut *self.releases.lock());
            let mut inner = self.inner.lock();
            let scheduled: Vec<NodeRef> = inner.undo_buff.drain().map(|(_, node)| node).collect();
            if pending.is_empty() && scheduled.is_empty() {
                break;
            }
            for node in pending {
                self.decr_refc(&mut inner, node, true);
            }
            for node in scheduled {
                self.teardown(&mut inner, node);
            }
        }
        match self.config.eviction_policy {
            EvictionPolicy::None => {}
            EvictionPolicy::Fifo(capacity) | EvictionPolicy::Lru(capacity) => {
                let EvictionTime::OnFlush = self.config.eviction_time;
                let mut inner = self.inner.lock();
                self.apply_eviction(&mut inner, capacity);
            }
        }
    }

    ///
    /// Writes the DCG reachable from the given root in GraphViz DOT format.
    ///
    pub fn visualize<T: 'static>(&self, root: &Art<T>, path: &Path) -> io::Result<()> {
        let inner = self.inner.lock();
        let included: HashSet<NodeIx> = inner
            .walk(VecDeque::from(vec![root.node.ix]), Direction::Outgoing)
            .collect();
        let graph = inner.pg.filter_map(
            |ix, rec| included.contains(&ix).then(|| rec.format()),
            |_, e| Some(format!("{:?} {:?}", e.kind, e.flag)),
        );
        let file = File::create(path)?;
        let mut f = BufWriter::new(file);
        f.write_all(format!("{}", dot::Dot::new(&graph)).as_bytes())?;
        Ok(())
    }

    pub(crate) fn handle<T>(&self, node: NodeRef) -> Art<T> {
        Art::new(
            node,
            Arc::new(Handle {
                node,
                releases: self.releases.clone(),
            }),
        )
    }

    ///
    /// Merges a force edge from the top frame to the given target into the
    /// graph and the frame's record. A new edge counts against the target's
    /// reference count; a merged one already did.
    ///
    pub(crate) fn merge_force_edge(
        &self,
        inner: &mut InnerGraph,
        target: NodeRef,
        gen: Generation,
        state: DcgState,
    ) {
        let Some(frame) = inner.frames.last() else {
            return;
        };
        let src = frame.src;
        if self.config.debug_assert {
            self.check_clean_ancestry(inner);
        }
        let flag = if state == DcgState::Consistent {
            Flag::Clean
        } else {
            Flag::Dirty
        };
        if let Some(eh) = inner.find_edge(src, target, EdgeKind::Force) {
            if let Some(e) = inner.edge_mut(eh) {
                e.flag = flag;
                e.observed = gen;
            }
            let top = inner.frames.last_mut().expect("force stack imbalance");
            if !top.forces.contains(&eh) {
                top.forces.push(eh);
            }
        } else {
            let eh = inner.add_edge(src, target, EdgeKind::Force, flag, gen);
            inner.incr_refc(target);
            let top = inner.frames.last_mut().expect("force stack imbalance");
            top.forces.push(eh);
        }
    }

    /// Attributes a freshly allocated node to the suspension that is
    /// currently evaluating, if any.
    pub(crate) fn record_create_edge(&self, inner: &mut InnerGraph, target: NodeRef) {
        let Some(frame) = inner.frames.last() else {
            return;
        };
        let src = frame.src;
        if self.config.debug_assert {
            self.check_clean_ancestry(inner);
        }
        if let Some(eh) = inner.find_edge(src, target, EdgeKind::Create) {
            let top = inner.frames.last_mut().expect("force stack imbalance");
            if !top.creates.contains(&eh) {
                top.creates.push(eh);
            }
        } else {
            let observed = inner
                .resolve(target)
                .map_or(Generation::initial(), |rec| rec.gen);
            let eh = inner.add_edge(src, target, EdgeKind::Create, Flag::Clean, observed);
            inner.incr_refc(target);
            let top = inner.frames.last_mut().expect("force stack imbalance");
            top.creates.push(eh);
        }
    }

    ///
    /// Obsoletes the previous evaluation's outgoing edges: flags, unlinks,
    /// and schedules the reference-count decrements of their targets.
    ///
    pub(crate) fn obsolete_outgoing(&self, inner: &mut InnerGraph, node: NodeRef) {
        let handles: Vec<EdgeHandle> = match inner.resolve(node).map(|rec| &rec.kind) {
            Some(NodeKind::Susp(susp)) => match &susp.state {
                Some(completed) => completed
                    .forces
                    .iter()
                    .chain(completed.creates.iter())
                    .copied()
                    .collect(),
                None => Vec::new(),
            },
            _ => Vec::new(),
        };
        for eh in handles {
            match inner.edge_mut(eh) {
                Some(e) => e.flag = Flag::Obsolete,
                None => continue,
            }
            let (_, target_ix) = inner
                .pg
                .edge_endpoints(eh.ix)
                .expect("live edge without endpoints");
            let target = NodeRef {
                ix: target_ix,
                id: inner.pg[target_ix].id,
            };
            inner.pg.remove_edge(eh.ix);
            self.decr_refc(inner, target, false);
        }
    }

    ///
    /// Decrements a node's reference count. At zero the node is torn down:
    /// immediately when `undo_now`, else deferred into the undo buffer.
    /// Never-evaluated suspensions are exempt: they have no state to
    /// release yet.
    ///
    pub(crate) fn decr_refc(&self, inner: &mut InnerGraph, node: NodeRef, undo_now: bool) {
        let Some(rec) = inner.resolve_mut(node) else {
            return;
        };
        rec.refc = rec.refc.saturating_sub(1);
        if rec.refc > 0 || !self.config.ref_count {
            return;
        }
        if let NodeKind::Susp(susp) = &rec.kind {
            if susp.state.is_none() {
                return;
            }
        }
        if undo_now {
            self.teardown(inner, node);
        } else {
            inner.undo_buff.insert(node.id, node);
        }
    }

    ///
    /// Destroys a node: removes its memo entry, obsoletes its outgoing edges
    /// (cascading reference-count decrements), and frees its arena slot.
    /// Dependents still holding edge handles observe them as Obsolete.
    ///
    pub(crate) fn teardown(&self, inner: &mut InnerGraph, node: NodeRef) {
        {
            let Some(rec) = inner.resolve_mut(node) else {
                return;
            };
            // Resurrected since it was scheduled.
            if rec.refc > 0 {
                return;
            }
            if let NodeKind::Susp(susp) = &mut rec.kind {
                if susp.state.is_none() {
                    return;
                }
                if let Some(evict) = susp.evict.take() {
                    evict();
                }
            }
        }
        test_trace_log!("destroying node {}", node.id);
        self.stats.destroyed.fetch_add(1, atomic::Ordering::SeqCst);
        let outgoing: Vec<(EdgeIx, NodeRef)> = inner
            .pg
            .edges_directed(node.ix, Direction::Outgoing)
            .map(|e| {
                let target_ix = e.target();
                (
                    e.id(),
                    NodeRef {
                        ix: target_ix,
                        id: inner.pg[target_ix].id,
                    },
                )
            })
            .collect();
        for (edge_ix, target) in outgoing {
            if let Some(e) = inner.pg.edge_weight_mut(edge_ix) {
                e.flag = Flag::Obsolete;
            }
            inner.pg.remove_edge(edge_ix);
            self.decr_refc(inner, target, true);
        }
        inner.ids.remove(&node.id);
        inner.memo_order.retain(|entry| entry.id != node.id);
        inner.pg.remove_node(node.ix);
    }

    ///
    /// Trims live memo entries down to the policy's capacity, oldest first.
    /// Only the table entries are dropped; the nodes die through refc.
    ///
    pub(crate) fn apply_eviction(&self, inner: &mut InnerGraph, capacity: usize) {
        let order = mem::take(&mut inner.memo_order);
        let mut live: Vec<NodeRef> = order
            .into_iter()
            .filter(|node| {
                inner.resolve(*node).is_some_and(|rec| {
                    matches!(&rec.kind, NodeKind::Susp(susp) if susp.evict.is_some())
                })
            })
            .collect();
        while live.len() > capacity {
            let victim = live.remove(0);
            let evict = inner.resolve_mut(victim).and_then(|rec| match &mut rec.kind {
                NodeKind::Susp(susp) => susp.evict.take(),
                NodeKind::Cell { .. } => None,
            });
            if let Some(evict) = evict {
                evict();
                self.stats.evicted.fetch_add(1, atomic::Ordering::SeqCst);
                test_trace_log!("evicted memo entry for node {}", victim.id);
            }
        }
        inner.memo_order = live;
    }

    /// The `debug_assert` configuration check: creating a new edge while any
    /// ancestor frame holds a non-Clean edge indicates name misuse.
    fn check_clean_ancestry(&self, inner: &InnerGraph) {
        for frame in &inner.frames {
            for eh in frame.forces.iter().chain(frame.creates.iter()) {
                match inner.edge(*eh) {
                    Some(e) if e.flag == Flag::Clean => {}
                    _ => panic!(
                        "ancestor frame for node {} holds a non-clean edge at edge creation",
                        frame.src.id
                    ),
                }
            }
        }
    }
}

///
/// Represents the state of a particular walk through the graph. Yields each
/// reachable node once; not necessarily in topological order.
///
struct Walk<'a> {
    graph: &'a InnerGraph,
    direction: Direction,
    deque: VecDeque<NodeIx>,
    walked: FixedBitSet,
}

impl Iterator for Walk<'_> {
    type Item = NodeIx;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(ix) = self.deque.pop_front() {
            if !self.walked.visit(ix) {
                continue;
            }
            self.deque
                .extend(self.graph.pg.neighbors_directed(ix, self.direction));
            return Some(ix);
        }
        None
    }
}

///
/// Logs at trace level, but only in `cfg(test)`.
///
#[macro_export]
macro_rules! test_trace_log {
    ($($arg:tt)+) => {
      #[cfg(test)]
      {
        log::trace!($($arg)+)
      }
    };
}

#[cfg(test)]
mod tests;
