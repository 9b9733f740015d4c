// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::rc::Rc;
use std::sync::atomic::{self, AtomicU64};
use std::sync::Arc;

use fnv::FnvHashMap as HashMap;
use parking_lot::Mutex;
use petgraph::visit::EdgeRef;
use petgraph::Direction;

use crate::name::Name;
use crate::node::{
    Art, Data, EdgeKind, EvalFn, EvictFn, Flag, NodeKind, NodeRef, Suspension, Val,
};
use crate::test_trace_log;
use crate::{Dcg, EvictionPolicy};

///
/// A memo-table key, carrying the identity mode of the call that produced it.
///
/// * `Arg` (structural): calls with equal arguments share a node.
/// * `ArgGen` (generative): equal arguments share a node only when their
///   runtime ids match; fresh ids make every invocation distinct, which is
///   the classical behaviour.
/// * `Name` (nominal): calls with equal names share a node regardless of
///   argument; the stored argument is replaced in place on mismatch.
///
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum MemoKey<A> {
    Arg(A),
    ArgGen(A, u64),
    Name(Name),
}

struct MfnShared<A: Data, R: Data> {
    name: Name,
    body: Box<dyn Fn(&Mfn<A, R>, A) -> R>,
    table: Mutex<HashMap<MemoKey<A>, NodeRef>>,
    generative: AtomicU64,
}

///
/// A memoized function: a recursion handle bundling three entry points that
/// share one table. `data` runs the body directly (pure recursion, no memo);
/// `art` memoizes on the argument; `nart` memoizes on an explicit name.
///
/// The body receives the handle by reference, which is how recursive calls
/// reach the shared table.
///
pub struct Mfn<A: Data, R: Data> {
    dcg: Dcg,
    shared: Arc<MfnShared<A, R>>,
}

impl<A: Data, R: Data> Clone for Mfn<A, R> {
    fn clone(&self) -> Mfn<A, R> {
        Mfn {
            dcg: self.dcg.clone(),
            shared: self.shared.clone(),
        }
    }
}

impl<A: Data, R: Data> Mfn<A, R> {
    pub(crate) fn new(
        dcg: Dcg,
        name: Name,
        body: impl Fn(&Mfn<A, R>, A) -> R + 'static,
    ) -> Mfn<A, R> {
        Mfn {
            dcg,
            shared: Arc::new(MfnShared {
                name,
                body: Box::new(body),
                table: Mutex::new(HashMap::default()),
                generative: AtomicU64::new(0),
            }),
        }
    }

    pub fn name(&self) -> &Name {
        &self.shared.name
    }

    pub fn dcg(&self) -> &Dcg {
        &self.dcg
    }

    /// Pure recursion: runs the body now, building no graph node.
    pub fn data(&self, arg: A) -> R {
        (self.shared.body)(self, arg)
    }

    /// Memoized call with structural identity.
    pub fn art(&self, arg: A) -> Art<R> {
        if self.dcg.config.disable_mfns {
            return self.fresh_cell(arg);
        }
        if self.dcg.config.generative_ids {
            let id = self.fresh_generative_id();
            return self.lookup(MemoKey::ArgGen(arg.sanitize(), id), arg, false);
        }
        self.lookup(MemoKey::Arg(arg.sanitize()), arg, false)
    }

    /// Memoized call with nominal identity.
    pub fn nart(&self, name: Name, arg: A) -> Art<R> {
        if self.dcg.config.disable_mfns {
            return self.fresh_cell(arg);
        }
        if self.dcg.config.disable_names {
            let id = self.fresh_generative_id();
            return self.lookup(MemoKey::ArgGen(arg.sanitize(), id), arg, false);
        }
        self.lookup(MemoKey::Name(name), arg, true)
    }

    fn fresh_generative_id(&self) -> u64 {
        self.shared.generative.fetch_add(1, atomic::Ordering::SeqCst)
    }

    fn lookup(&self, key: MemoKey<A>, arg: A, nominal: bool) -> Art<R> {
        let hit = { self.shared.table.lock().get(&key).copied() };
        match hit {
            Some(node) => self.on_hit(node, arg, nominal),
            None => self.on_miss(key, arg),
        }
    }

    fn on_miss(&self, key: MemoKey<A>, arg: A) -> Art<R> {
        let dcg = &self.dcg;
        let shared = Arc::clone(&self.shared);
        let eval: Rc<EvalFn> = Rc::new(move |dcg: &Dcg, arg: Option<Val>| {
            let arg = arg
                .as_ref()
                .and_then(Val::downcast::<A>)
                .expect("memoized argument had an unexpected type");
            let mfn = Mfn {
                dcg: dcg.clone(),
                shared: Arc::clone(&shared),
            };
            Val::new((shared.body)(&mfn, arg))
        });

        let evict_shared = Arc::downgrade(&self.shared);
        let evict_key = key.clone();
        let evict: Box<EvictFn> = Box::new(move || {
            if let Some(shared) = evict_shared.upgrade() {
                shared.table.lock().remove(&evict_key);
            }
        });

        let label = match &key {
            MemoKey::Name(name) => name.clone(),
            _ => self.shared.name.clone(),
        };

        let node = {
            let mut inner = dcg.inner.lock();
            let node = inner.alloc(
                Some(label),
                NodeKind::Susp(Suspension {
                    eval,
                    arg: Some(Val::new(arg.sanitize())),
                    state: None,
                    evict: Some(evict),
                }),
            );
            dcg.record_create_edge(&mut inner, node);
            inner.incr_refc(node);
            inner.memo_order.push(node);
            node
        };
        dcg.stats.memo_misses.fetch_add(1, atomic::Ordering::SeqCst);
        test_trace_log!("memo miss allocated node {}", node.id);
        self.shared.table.lock().insert(key, node);
        dcg.handle(node)
    }

    fn on_hit(&self, node: NodeRef, arg: A, nominal: bool) -> Art<R> {
        let dcg = &self.dcg;
        dcg.stats.memo_hits.fetch_add(1, atomic::Ordering::SeqCst);
        let mut inner = dcg.inner.lock();

        if nominal {
            let new_arg = Val::new(arg.sanitize());
            let differs = {
                let rec = inner
                    .resolve(node)
                    .expect("memo entry points at a released node");
                match &rec.kind {
                    NodeKind::Susp(susp) => susp
                        .arg
                        .as_ref()
                        .is_none_or(|old| *old != new_arg),
                    NodeKind::Cell { .. } => false,
                }
            };
            if differs {
                // The call site kept its name but changed its argument:
                // everything that created this node must re-run, and the node
                // itself re-evaluates with the new argument.
                let current = inner.frames.last().map(|frame| frame.src.id);
                let creators: Vec<NodeRef> = inner
                    .pg
                    .edges_directed(node.ix, Direction::Incoming)
                    .filter(|e| {
                        e.weight().kind == EdgeKind::Create && e.weight().flag != Flag::Obsolete
                    })
                    .map(|e| {
                        let source_ix = e.source();
                        NodeRef {
                            ix: source_ix,
                            id: inner.pg[source_ix].id,
                        }
                    })
                    .filter(|creator| Some(creator.id) != current)
                    .collect();
                for creator in creators {
                    inner.mark_filthy(creator, &dcg.stats);
                }
                if let Some(rec) = inner.resolve_mut(node) {
                    if let NodeKind::Susp(susp) = &mut rec.kind {
                        susp.arg = Some(new_arg);
                    }
                }
                inner.mark_filthy(node, &dcg.stats);
                test_trace_log!("nominal argument replaced on node {}", node.id);
            }
        }

        dcg.record_create_edge(&mut inner, node);
        inner.incr_refc(node);
        if let EvictionPolicy::Lru(_) = dcg.config.eviction_policy {
            inner.memo_order.retain(|entry| entry.id != node.id);
            inner.memo_order.push(node);
        }
        drop(inner);
        dcg.handle(node)
    }

    ///
    /// The `disable_mfns` degradation: run the body now and store the result
    /// in a fresh cell. No memo entry and no create-edge is recorded, so the
    /// call is invisible to change propagation bookkeeping.
    ///
    fn fresh_cell(&self, arg: A) -> Art<R> {
        let value = self.data(arg);
        let dcg = &self.dcg;
        let mut inner = dcg.inner.lock();
        let node = inner.alloc(
            Some(self.shared.name.clone()),
            NodeKind::Cell {
                value: Val::new(value.sanitize()),
            },
        );
        inner.incr_refc(node);
        drop(inner);
        dcg.handle(node)
    }
}
