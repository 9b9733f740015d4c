// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::any::Any;
use std::fmt;
use std::hash::Hash;
use std::marker::PhantomData;
use std::rc::Rc;
use std::sync::Arc;

use parking_lot::Mutex;
use petgraph::stable_graph;

use crate::name::Name;
use crate::Dcg;

// 2^32 nodes ought to be more than enough for anyone!
pub(crate) type NodeIx = stable_graph::NodeIndex<u32>;
pub(crate) type EdgeIx = stable_graph::EdgeIndex<u32>;

/// Reserved id of the external context: edges recorded outside any force
/// frame conceptually originate here. No arena slot is allocated for it.
pub(crate) const ROOT_ID: u64 = 0;

///
/// A token that is incremented whenever a node's output value has changed.
/// When a dependent observes a dependency at a particular generation, that
/// generation is recorded on the observing edge, and is later used to decide
/// whether the dependency's value actually changed: repairing the source and
/// comparing generations certifies (or refutes) the cached result above it.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub struct Generation(u32);

impl Generation {
    pub(crate) fn initial() -> Generation {
        Generation(0)
    }

    pub(crate) fn next(self) -> Generation {
        Generation(self.0 + 1)
    }
}

///
/// Consistency classification reported alongside every observed value. A
/// Maybe-inconsistent observation means some transitive dependency edge was
/// still non-Clean when the value was produced, which can only arise from
/// name reuse; consumers record such observations as Dirty edges so that the
/// next repair revisits them.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DcgState {
    Consistent,
    MaybeInconsistent,
}

/// Per-edge dirtiness lattice. DirtyToClean marks an edge whose source is
/// being repaired further down the current descent.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Flag {
    Clean,
    Dirty,
    DirtyToClean,
    Obsolete,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum EdgeKind {
    /// The source node observed the target's value.
    Force,
    /// The target node was allocated while the source was evaluating.
    Create,
}

///
/// An edge record, directed dependent → source: "A forced (or created) B" is
/// an edge A→B, so the incoming edges of a node are its dependents and
/// mutators. The serial uniquely identifies this record for the lifetime of
/// the graph; a handle whose serial mismatches dereferences to nothing.
///
#[derive(Debug)]
pub(crate) struct EdgeRecord {
    pub serial: u64,
    pub kind: EdgeKind,
    pub flag: Flag,
    /// Generation of the target when this edge was last recorded.
    pub observed: Generation,
}

///
/// A generational node handle: the arena reuses slots of removed nodes, so
/// every dereference re-checks the monotone id. A dangling handle is the
/// arena rendition of a dropped weak reference.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub(crate) struct NodeRef {
    pub ix: NodeIx,
    pub id: u64,
}

/// A generational edge handle; same discipline as `NodeRef`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct EdgeHandle {
    pub ix: EdgeIx,
    pub serial: u64,
}

/// Node-level dirtiness. A Filthy node re-evaluates unconditionally on its
/// next repair, regardless of the flags on its outgoing edges.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Health {
    Ok,
    Filthy,
}

///
/// The contract every value stored in a cell or returned from a thunk must
/// satisfy. `sanitize` deep-copies any state that could otherwise be shared
/// with graph internals; for most types the clone is already a deep copy.
///
pub trait Data: Clone + Eq + Hash + fmt::Debug + 'static {
    fn sanitize(&self) -> Self {
        self.clone()
    }
}

macro_rules! impl_data_for {
    ($($ty:ty),* $(,)?) => {
        $(impl Data for $ty {})*
    };
}

impl_data_for!(
    (),
    bool,
    char,
    i8,
    i16,
    i32,
    i64,
    i128,
    isize,
    u8,
    u16,
    u32,
    u64,
    u128,
    usize,
    String,
    &'static str,
);

impl<T: Data> Data for Option<T> {
    fn sanitize(&self) -> Self {
        self.as_ref().map(Data::sanitize)
    }
}

impl<T: Data> Data for Vec<T> {
    fn sanitize(&self) -> Self {
        self.iter().map(Data::sanitize).collect()
    }
}

impl<T: Data> Data for Rc<T> {
    fn sanitize(&self) -> Self {
        Rc::new((**self).sanitize())
    }
}

impl<A: Data, B: Data> Data for (A, B) {
    fn sanitize(&self) -> Self {
        (self.0.sanitize(), self.1.sanitize())
    }
}

impl<A: Data, B: Data, C: Data> Data for (A, B, C) {
    fn sanitize(&self) -> Self {
        (self.0.sanitize(), self.1.sanitize(), self.2.sanitize())
    }
}

///
/// Object-safe mirror of `Data`, so one arena can store heterogeneous values.
/// Typed `Art<T>` handles downcast at the force boundary.
///
pub(crate) trait Object: Any {
    fn obj_clone(&self) -> Box<dyn Object>;
    fn obj_eq(&self, other: &dyn Object) -> bool;
    fn obj_show(&self) -> String;
    fn obj_sanitize(&self) -> Box<dyn Object>;
    fn as_any(&self) -> &dyn Any;
}

impl<T: Data> Object for T {
    fn obj_clone(&self) -> Box<dyn Object> {
        Box::new(self.clone())
    }

    fn obj_eq(&self, other: &dyn Object) -> bool {
        other
            .as_any()
            .downcast_ref::<T>()
            .is_some_and(|other| self == other)
    }

    fn obj_show(&self) -> String {
        format!("{self:?}")
    }

    fn obj_sanitize(&self) -> Box<dyn Object> {
        Box::new(self.sanitize())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A type-erased value crossing the DCG boundary.
pub(crate) struct Val(Box<dyn Object>);

impl Val {
    pub fn new<T: Data>(value: T) -> Val {
        Val(Box::new(value))
    }

    pub fn sanitize(&self) -> Val {
        Val(self.0.obj_sanitize())
    }

    pub fn downcast<T: Data>(&self) -> Option<T> {
        self.0.as_any().downcast_ref::<T>().cloned()
    }

    pub fn show(&self) -> String {
        self.0.obj_show()
    }
}

impl Clone for Val {
    fn clone(&self) -> Val {
        Val(self.0.obj_clone())
    }
}

impl PartialEq for Val {
    fn eq(&self, other: &Val) -> bool {
        self.0.obj_eq(&*other.0)
    }
}

impl Eq for Val {}

impl fmt::Debug for Val {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0.obj_show())
    }
}

/// Re-evaluation entry point stored on a suspension: closes over the body and
/// its memo table, and takes the (type-erased) argument currently stored on
/// the node, so that nominal argument replacement takes effect in place.
pub(crate) type EvalFn = dyn Fn(&Dcg, Option<Val>) -> Val;

/// Removes the owning node's memo-table entry, if it still has one.
pub(crate) type EvictFn = dyn Fn();

pub(crate) struct Suspension {
    pub eval: Rc<EvalFn>,
    pub arg: Option<Val>,
    /// `None` until the first evaluation: an allocated identity with nothing
    /// to release yet.
    pub state: Option<Completed>,
    pub evict: Option<Box<EvictFn>>,
}

///
/// The cached result of a suspension's most recent evaluation, including the
/// outgoing edges it recorded, in call order. These lists hold the edges
/// strongly; the reverse direction is only reachable through the arena.
///
pub(crate) struct Completed {
    pub value: Val,
    pub forces: Vec<EdgeHandle>,
    pub creates: Vec<EdgeHandle>,
}

pub(crate) enum NodeKind {
    Cell { value: Val },
    Susp(Suspension),
}

pub(crate) struct NodeRecord {
    pub id: u64,
    pub name: Option<Name>,
    /// Live incoming edges plus live external handles.
    pub refc: usize,
    pub health: Health,
    pub gen: Generation,
    pub kind: NodeKind,
}

impl NodeRecord {
    pub(crate) fn format(&self) -> String {
        let label = match &self.name {
            Some(name) => format!("{name}"),
            None => format!("#{}", self.id),
        };
        let value = match &self.kind {
            NodeKind::Cell { value } => value.show(),
            NodeKind::Susp(susp) => match &susp.state {
                Some(completed) => completed.value.show(),
                None => "<pending>".to_owned(),
            },
        };
        let value = if value.len() <= 64 {
            value
        } else {
            value.chars().take(64).collect()
        };
        format!("{label} == {value}")
    }
}

/// Pending reference-count releases from dropped external handles, drained at
/// `flush`. Kept apart from the graph lock so that handle drops triggered
/// while the graph is locked cannot re-enter it.
pub(crate) type ReleaseQueue = Arc<Mutex<Vec<NodeRef>>>;

///
/// External drop guard shared by all clones of an `Art`. Releasing the last
/// clone enqueues a reference-count release for the node it kept alive.
///
pub(crate) struct Handle {
    pub node: NodeRef,
    pub releases: ReleaseQueue,
}

impl Drop for Handle {
    fn drop(&mut self) {
        self.releases.lock().push(self.node);
    }
}

///
/// An articulation: the observable handle for a cell or suspension. `Art`s
/// are cheap to clone, compare by node identity, and may themselves be stored
/// inside `Data` values (which is how incremental list links are built).
///
pub struct Art<T> {
    pub(crate) node: NodeRef,
    pub(crate) guard: Arc<Handle>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Art<T> {
    pub(crate) fn new(node: NodeRef, guard: Arc<Handle>) -> Art<T> {
        Art {
            node,
            guard,
            _marker: PhantomData,
        }
    }
}

impl<T> Clone for Art<T> {
    fn clone(&self) -> Art<T> {
        Art {
            node: self.node,
            guard: self.guard.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> PartialEq for Art<T> {
    fn eq(&self, other: &Art<T>) -> bool {
        self.node.id == other.node.id
    }
}

impl<T> Eq for Art<T> {}

impl<T> Hash for Art<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.node.id.hash(state);
    }
}

impl<T> fmt::Debug for Art<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Art#{}", self.node.id)
    }
}

impl<T: 'static> Data for Art<T> {}
