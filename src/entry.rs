// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::rc::Rc;
use std::sync::atomic;

use crate::context::Frame;
use crate::node::{
    Completed, DcgState, Flag, Generation, Health, NodeKind, NodeRef, Val,
};
use crate::test_trace_log;
use crate::Dcg;

///
/// Observes a node's value, repairing or evaluating as needed. This is the
/// single entry point the force engine uses for both cells and suspensions.
///
/// Forcing a node that is already on the force stack is a true dependency
/// cycle; a synchronous engine cannot suspend half of one, so it is a
/// programmer error.
///
pub(crate) fn force_value(dcg: &Dcg, node: NodeRef) -> (Val, Generation, DcgState) {
    {
        let inner = dcg.inner.lock();
        if inner.frames.iter().any(|frame| frame.src.id == node.id) {
            let label = inner.resolve(node).and_then(|rec| rec.name.clone());
            panic!(
                "dependency cycle: node {} ({label:?}) is already being evaluated",
                node.id
            );
        }
    }
    repair(dcg, node)
}

/// What the repair walk decided to do about one recorded edge.
enum Action {
    Skip,
    Reevaluate,
    Check { target: NodeRef, observed: Generation },
}

///
/// Repairs a node: either certifies that its cached value still holds, or
/// re-evaluates it. The walk visits the outgoing force edges of the most
/// recent evaluation in recorded order and stops at the first edge whose
/// source produced a changed value.
///
pub(crate) fn repair(dcg: &Dcg, node: NodeRef) -> (Val, Generation, DcgState) {
    let forces = {
        let mut inner = dcg.inner.lock();
        let rec = inner
            .resolve_mut(node)
            .expect("repair: node was released while a handle to it was live");
        match &rec.kind {
            NodeKind::Cell { value } => {
                // Cells are inputs: always consistent, no walk to do.
                return (value.clone(), rec.gen, DcgState::Consistent);
            }
            NodeKind::Susp(susp) => {
                if rec.health == Health::Filthy {
                    rec.health = Health::Ok;
                    drop(inner);
                    return evaluate(dcg, node);
                }
                match &susp.state {
                    // Never evaluated: first force.
                    None => {
                        drop(inner);
                        return evaluate(dcg, node);
                    }
                    Some(completed) => completed.forces.clone(),
                }
            }
        }
    };

    let mut needs_reevaluate = false;
    for eh in forces {
        let action = {
            let mut inner = dcg.inner.lock();
            let probe = inner.edge(eh).map(|e| (e.flag, e.observed));
            match probe {
                // The source of this edge was evicted out from under us.
                None => Action::Reevaluate,
                Some((Flag::Clean, _)) => Action::Skip,
                Some((Flag::Obsolete, _)) => Action::Reevaluate,
                // A DirtyToClean edge found during the walk means a cycle or
                // a concurrent descent reached it first; re-evaluate
                // conservatively.
                Some((Flag::DirtyToClean, _)) => Action::Reevaluate,
                Some((Flag::Dirty, observed)) => {
                    if let Some(e) = inner.edge_mut(eh) {
                        e.flag = Flag::DirtyToClean;
                    }
                    let (_, target_ix) = inner
                        .pg
                        .edge_endpoints(eh.ix)
                        .expect("live edge without endpoints");
                    let target = NodeRef {
                        ix: target_ix,
                        id: inner.pg[target_ix].id,
                    };
                    Action::Check { target, observed }
                }
            }
        };

        match action {
            Action::Skip => {}
            Action::Reevaluate => {
                needs_reevaluate = true;
                break;
            }
            Action::Check { target, observed } => {
                // Recursively repair the source, then compare the generation
                // it settled at against the one this edge observed.
                let (_, source_gen, source_state) = repair(dcg, target);
                let unchanged = dcg.config.check_receipt && source_gen == observed;
                {
                    let mut inner = dcg.inner.lock();
                    if let Some(e) = inner.edge_mut(eh) {
                        e.flag = if source_state == DcgState::MaybeInconsistent {
                            Flag::Dirty
                        } else {
                            Flag::Clean
                        };
                    }
                }
                if !unchanged {
                    needs_reevaluate = true;
                    break;
                }
            }
        }
    }

    if !needs_reevaluate {
        // A nominal rename further down may have marked this node Filthy
        // while we were walking; honour it before certifying the cache.
        let became_filthy = {
            let mut inner = dcg.inner.lock();
            let rec = inner
                .resolve_mut(node)
                .expect("repair: node was released mid-walk");
            if rec.health == Health::Filthy {
                rec.health = Health::Ok;
                true
            } else {
                false
            }
        };
        if !became_filthy {
            let inner = dcg.inner.lock();
            let rec = inner
                .resolve(node)
                .expect("repair: node was released mid-walk");
            let (value, gen, handles) = match &rec.kind {
                NodeKind::Susp(susp) => {
                    let completed = susp
                        .state
                        .as_ref()
                        .expect("repaired suspension lost its state");
                    let handles: Vec<_> = completed
                        .forces
                        .iter()
                        .chain(completed.creates.iter())
                        .copied()
                        .collect();
                    (completed.value.clone(), rec.gen, handles)
                }
                NodeKind::Cell { .. } => unreachable!("cells return before the walk"),
            };
            let mut state = DcgState::Consistent;
            for eh in handles {
                match inner.edge(eh) {
                    Some(e) if e.flag == Flag::Clean => {}
                    _ => state = DcgState::MaybeInconsistent,
                }
            }
            dcg.stats.cleaned.fetch_add(1, atomic::Ordering::SeqCst);
            test_trace_log!("node {} certified clean", node.id);
            return (value, gen, state);
        }
    }

    evaluate(dcg, node)
}

///
/// Runs a suspension's body and installs the result in place. The previous
/// evaluation's edges are obsoleted up front (in exactly-dirty mode), a fresh
/// frame collects the new ones, and the generation bumps only if the new
/// value differs from the old under `Data` equality.
///
pub(crate) fn evaluate(dcg: &Dcg, node: NodeRef) -> (Val, Generation, DcgState) {
    let (eval, arg) = {
        let mut inner = dcg.inner.lock();
        if dcg.config.dirty_exactly {
            dcg.obsolete_outgoing(&mut inner, node);
        }
        let rec = inner
            .resolve_mut(node)
            .expect("evaluate: node was released while a handle to it was live");
        rec.health = Health::Ok;
        let susp = match &rec.kind {
            NodeKind::Susp(susp) => susp,
            NodeKind::Cell { .. } => unreachable!("evaluate called on a cell"),
        };
        let eval_and_arg = (Rc::clone(&susp.eval), susp.arg.clone());
        inner.frames.push(Frame::new(node));
        eval_and_arg
    };

    dcg.stats.evaluated.fetch_add(1, atomic::Ordering::SeqCst);
    test_trace_log!("evaluating node {}", node.id);

    // The body runs with the engine unlocked and re-enters through `force`.
    // The guard unwinds the frame and discards partially recorded edges if
    // the body panics.
    let mut guard = FrameGuard { dcg, armed: true };
    let value = (eval)(dcg, arg).sanitize();
    guard.armed = false;
    drop(guard);

    let mut inner = dcg.inner.lock();
    let frame = inner.frames.pop().expect("force stack imbalance");
    debug_assert_eq!(frame.src.id, node.id, "force stack imbalance");

    let mut all_clean = true;
    for eh in frame.forces.iter().chain(frame.creates.iter()) {
        match inner.edge(*eh) {
            Some(e) if e.flag == Flag::Clean => {}
            _ => all_clean = false,
        }
    }
    if !all_clean {
        log::warn!(
            "evaluation of node {} completed with out-of-date dependencies; \
             was a name reused for distinct arguments?",
            node.id
        );
    }

    let rec = inner
        .resolve_mut(node)
        .expect("evaluate: node was released mid-body");
    let changed = match &rec.kind {
        NodeKind::Susp(susp) => susp
            .state
            .as_ref()
            .is_none_or(|completed| completed.value != value),
        NodeKind::Cell { .. } => unreachable!("evaluate called on a cell"),
    };
    if changed {
        rec.gen = rec.gen.next();
    }
    let gen = rec.gen;
    if let NodeKind::Susp(susp) = &mut rec.kind {
        susp.state = Some(Completed {
            value: value.clone(),
            forces: frame.forces,
            creates: frame.creates,
        });
    }
    let state = if all_clean {
        DcgState::Consistent
    } else {
        DcgState::MaybeInconsistent
    };
    (value, gen, state)
}

struct FrameGuard<'a> {
    dcg: &'a Dcg,
    armed: bool,
}

impl Drop for FrameGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        // The body panicked: pop the frame and discard the partial
        // evaluation before the panic propagates.
        let mut inner = self.dcg.inner.lock();
        if let Some(frame) = inner.frames.pop() {
            for eh in frame.forces.into_iter().chain(frame.creates) {
                let target = inner.edge(eh).map(|_| {
                    let (_, target_ix) = inner
                        .pg
                        .edge_endpoints(eh.ix)
                        .expect("live edge without endpoints");
                    NodeRef {
                        ix: target_ix,
                        id: inner.pg[target_ix].id,
                    }
                });
                if let Some(target) = target {
                    inner.pg.remove_edge(eh.ix);
                    self.dcg.decr_refc(&mut inner, target, false);
                }
            }
        }
    }
}
