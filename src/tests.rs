// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::cell::RefCell;
use std::hash::{Hash, Hasher};
use std::rc::Rc;
use std::sync::atomic::{self, AtomicUsize};
use std::sync::Arc;

use rand::Rng;

use crate::{Art, Config, Data, Dcg, EvictionPolicy, Mfn, Name};

fn engine() -> Dcg {
    let _ = env_logger::builder().is_test(true).try_init();
    Dcg::default()
}

fn engine_with(config: Config) -> Dcg {
    let _ = env_logger::builder().is_test(true).try_init();
    Dcg::new(config)
}

macro_rules! assert_atomic_usize_eq {
    ($actual: expr, $expected: expr) => {{
        assert_eq!($actual.load(atomic::Ordering::SeqCst), $expected);
    }};
}

#[test]
fn cell_create_and_force() {
    let dcg = engine();
    let c = dcg.cell(Name::of_string("c"), 3_u64);
    assert_eq!(dcg.force(&c), 3);
    assert_eq!(dcg.force(&c), 3);
}

#[test]
fn cell_set_then_force() {
    let dcg = engine();
    let c = dcg.cell(Name::of_string("c"), 3_u64);
    dcg.set(&c, 5);
    assert_eq!(dcg.force(&c), 5);
}

#[test]
fn set_without_change_does_not_dirty() {
    let dcg = engine();
    let c = dcg.cell(Name::of_string("c"), 3_u64);
    let t = {
        let c = c.clone();
        dcg.thunk(Name::of_string("t"), move |d| d.force(&c) + 1)
    };
    assert_eq!(dcg.force(&t), 4);

    // Writing back the equal value is a no-op: nothing dirties, nothing
    // re-runs.
    dcg.set(&c, 3);
    assert_atomic_usize_eq!(dcg.stats().dirtied, 0);
    assert_eq!(dcg.force(&t), 4);
    assert_atomic_usize_eq!(dcg.stats().evaluated, 1);
}

#[test]
fn force_is_idempotent() {
    let dcg = engine();
    let runs = Arc::new(AtomicUsize::new(0));
    let c = dcg.cell(Name::of_string("c"), 2_u64);
    let t = {
        let c = c.clone();
        let runs = runs.clone();
        dcg.thunk(Name::of_string("t"), move |d| {
            runs.fetch_add(1, atomic::Ordering::SeqCst);
            d.force(&c) * 10
        })
    };
    assert_eq!(dcg.force(&t), 20);
    assert_eq!(dcg.force(&t), 20);
    assert_atomic_usize_eq!(runs, 1);
}

#[test]
fn thunk_constant() {
    let dcg = engine();
    let t = dcg.thunk(Name::of_string("k"), |_| 42_u64);
    assert_eq!(dcg.force(&t), 42);
    assert_eq!(dcg.force(&t), 42);
    assert_atomic_usize_eq!(dcg.stats().evaluated, 1);
}

#[test]
fn name_algebra() {
    // Forking is deterministic: the same name always splits into the same
    // two children, and the children are distinct names.
    let base = Name::of_string("base");
    let (l1, r1) = base.fork();
    let (l2, r2) = base.fork();
    assert_eq!(l1, l2);
    assert_eq!(r1, r2);
    assert_ne!(l1, r1);
    assert_ne!(l1, base);
    assert_ne!(r1, base);

    // Pairing is stable, order-sensitive, and never collapses into an input.
    let index = Name::of_usize(3);
    let paired = Name::pair(base.clone(), index.clone());
    assert_eq!(paired, Name::pair(base.clone(), index.clone()));
    assert_ne!(paired, Name::pair(index, base.clone()));
    assert_ne!(paired, base);

    // Gensyms are fresh: pairwise unequal, equal only to their own clones.
    let gensyms = [Name::gensym(), Name::gensym(), Name::gensym()];
    for (i, a) in gensyms.iter().enumerate() {
        assert_eq!(a, &a.clone());
        for b in &gensyms[i + 1..] {
            assert_ne!(a, b);
        }
    }
}

#[test]
fn repair_skips_dependents_of_unchanged_values() {
    let dcg = engine();
    let c = dcg.cell(Name::of_string("c"), 1_u64);
    let parity = {
        let c = c.clone();
        dcg.thunk(Name::of_string("parity"), move |d| d.force(&c) % 2)
    };
    let shout = {
        let parity = parity.clone();
        dcg.thunk(Name::of_string("shout"), move |d| d.force(&parity) * 100)
    };
    assert_eq!(dcg.force(&shout), 100);
    assert_atomic_usize_eq!(dcg.stats().evaluated, 2);

    // 1 → 3 flips the cell but not its parity: the lower thunk re-runs and
    // the upper one is certified clean from its cached value.
    dcg.set(&c, 3);
    assert_eq!(dcg.force(&shout), 100);
    assert_atomic_usize_eq!(dcg.stats().evaluated, 3);
    assert!(dcg.stats().cleaned.load(atomic::Ordering::SeqCst) >= 1);
}

#[test]
fn repair_reruns_dependents_of_changed_values() {
    let dcg = engine();
    let c = dcg.cell(Name::of_string("c"), 1_u64);
    let parity = {
        let c = c.clone();
        dcg.thunk(Name::of_string("parity"), move |d| d.force(&c) % 2)
    };
    let shout = {
        let parity = parity.clone();
        dcg.thunk(Name::of_string("shout"), move |d| d.force(&parity) * 100)
    };
    assert_eq!(dcg.force(&shout), 100);

    dcg.set(&c, 2);
    assert_eq!(dcg.force(&shout), 0);
    assert_atomic_usize_eq!(dcg.stats().evaluated, 4);
}

#[test]
fn memo_structural_hit() {
    let dcg = engine();
    let m: Mfn<u64, u64> = dcg.mk_mfn(Name::of_string("double"), |_, x| x * 2);
    let a = m.art(21);
    let b = m.art(21);
    assert_eq!(a, b);
    assert_eq!(dcg.force(&a), 42);
    assert_eq!(dcg.force(&b), 42);
    assert_atomic_usize_eq!(dcg.stats().evaluated, 1);
    assert_atomic_usize_eq!(dcg.stats().memo_misses, 1);
    assert_atomic_usize_eq!(dcg.stats().memo_hits, 1);
}

#[test]
fn memo_structural_recursion_terminates() {
    let dcg = engine();
    let m: Mfn<u64, u64> = dcg.mk_mfn(Name::of_string("sum"), |m, x| {
        if x == 0 {
            0
        } else {
            // Forcing the same argument twice exercises the repeat-argument
            // hit inside a single evaluation.
            let once: u64 = m.dcg().force(&m.art(x - 1));
            let again = m.dcg().force(&m.art(x - 1));
            x + once.min(again)
        }
    });
    let root = m.art(10);
    assert_eq!(dcg.force(&root), 55);
    assert_atomic_usize_eq!(dcg.stats().evaluated, 11);
}

#[test]
fn memo_nominal_hit_ignores_call_position() {
    let dcg = engine();
    let m: Mfn<u64, u64> = dcg.mk_mfn(Name::of_string("double"), |_, x| x * 2);
    let site = Name::of_string("site");
    let a = m.nart(site.clone(), 21);
    assert_eq!(dcg.force(&a), 42);
    let b = m.nart(site, 21);
    assert_eq!(a, b);
    assert_eq!(dcg.force(&b), 42);
    assert_atomic_usize_eq!(dcg.stats().evaluated, 1);
}

#[test]
fn nominal_rename_with_changed_argument_recomputes_and_evicts() {
    let dcg = engine();
    let m: Mfn<u64, u64> = dcg.mk_mfn(Name::of_string("tri"), |m, x| {
        if x == 0 {
            0
        } else {
            x + m.dcg().force(&m.art(x - 1))
        }
    });
    let site = Name::of_string("site");
    let a = m.nart(site.clone(), 5);
    assert_eq!(dcg.force(&a), 15);
    // The nominal node plus the structural chain for 4..=0.
    assert_eq!(dcg.len(), 6);

    // Same name, different argument: the canonical node re-evaluates in
    // place with the new argument.
    let b = m.nart(site, 3);
    assert_eq!(a, b);
    assert_eq!(dcg.force(&b), 6);

    // The 4- and 3-suffix of the old chain is no longer referenced.
    dcg.flush();
    assert_eq!(dcg.len(), 4);
    assert_atomic_usize_eq!(dcg.stats().destroyed, 2);
}

#[test]
fn dropping_handles_releases_nodes_at_flush() {
    let dcg = engine();
    let c = dcg.cell(Name::of_string("c"), 1_u64);
    let t = {
        let c = c.clone();
        dcg.thunk(Name::of_string("t"), move |d| d.force(&c) + 1)
    };
    assert_eq!(dcg.force(&t), 2);
    assert_eq!(dcg.len(), 2);

    drop(t);
    dcg.flush();
    // The thunk dies; the cell is kept alive by its own live handle.
    assert_eq!(dcg.len(), 1);

    drop(c);
    dcg.flush();
    assert_eq!(dcg.len(), 0);
}

#[test]
fn flush_is_idempotent() {
    let dcg = engine();
    let c = dcg.cell(Name::of_string("c"), 1_u64);
    let t = {
        let c = c.clone();
        dcg.thunk(Name::of_string("t"), move |d| d.force(&c) + 1)
    };
    assert_eq!(dcg.force(&t), 2);
    drop(t);
    drop(c);

    dcg.flush();
    let len = dcg.len();
    let destroyed = dcg.stats().destroyed.load(atomic::Ordering::SeqCst);
    dcg.flush();
    assert_eq!(dcg.len(), len);
    assert_atomic_usize_eq!(dcg.stats().destroyed, destroyed);
}

#[test]
fn unevaluated_suspensions_survive_release() {
    let dcg = engine();
    let m: Mfn<u64, u64> = dcg.mk_mfn(Name::of_string("double"), |_, x| x * 2);
    let a = m.art(21);
    drop(a);
    dcg.flush();
    // Never evaluated: the identity is retained, there is no state to
    // release and the memo entry stays.
    assert_eq!(dcg.len(), 1);

    let b = m.art(21);
    assert_eq!(dcg.force(&b), 42);
    assert_atomic_usize_eq!(dcg.stats().memo_hits, 1);
}

#[test]
fn disabled_receipts_reevaluate_every_dirty_edge() {
    let dcg = engine_with(Config {
        check_receipt: false,
        ..Config::default()
    });
    let c = dcg.cell(Name::of_string("c"), 1_u64);
    let parity = {
        let c = c.clone();
        dcg.thunk(Name::of_string("parity"), move |d| d.force(&c) % 2)
    };
    let shout = {
        let parity = parity.clone();
        dcg.thunk(Name::of_string("shout"), move |d| d.force(&parity) * 100)
    };
    assert_eq!(dcg.force(&shout), 100);

    // Parity is unchanged by 1 → 3, but without receipt checking the
    // dependent re-runs anyway.
    dcg.set(&c, 3);
    assert_eq!(dcg.force(&shout), 100);
    assert_atomic_usize_eq!(dcg.stats().evaluated, 4);
}

#[test]
fn generative_identity_never_shares() {
    let dcg = engine_with(Config {
        generative_ids: true,
        ..Config::default()
    });
    let m: Mfn<u64, u64> = dcg.mk_mfn(Name::of_string("double"), |_, x| x * 2);
    let a = m.art(21);
    let b = m.art(21);
    assert_ne!(a, b);
    assert_eq!(dcg.force(&a), 42);
    assert_eq!(dcg.force(&b), 42);
    assert_atomic_usize_eq!(dcg.stats().evaluated, 2);
    assert_atomic_usize_eq!(dcg.stats().memo_misses, 2);
}

#[test]
fn disabled_names_behave_generatively() {
    let dcg = engine_with(Config {
        disable_names: true,
        ..Config::default()
    });
    let m: Mfn<u64, u64> = dcg.mk_mfn(Name::of_string("double"), |_, x| x * 2);
    let site = Name::of_string("site");
    let a = m.nart(site.clone(), 21);
    let b = m.nart(site, 21);
    assert_ne!(a, b);
    assert_eq!(dcg.force(&a), 42);
    assert_eq!(dcg.force(&b), 42);
    assert_atomic_usize_eq!(dcg.stats().evaluated, 2);
}

#[test]
fn disabled_mfns_degenerate_to_fresh_cells() {
    let dcg = engine_with(Config {
        disable_mfns: true,
        ..Config::default()
    });
    let m: Mfn<u64, u64> = dcg.mk_mfn(Name::of_string("double"), |_, x| x * 2);
    let a = m.art(21);
    let b = m.art(21);
    assert_ne!(a, b);
    assert_eq!(dcg.force(&a), 42);
    assert_eq!(dcg.force(&b), 42);
    // The bodies ran eagerly, outside the graph: no suspensions, no memo
    // traffic.
    assert_atomic_usize_eq!(dcg.stats().evaluated, 0);
    assert_atomic_usize_eq!(dcg.stats().memo_misses, 0);
    assert_atomic_usize_eq!(dcg.stats().memo_hits, 0);
}

#[test]
fn fifo_eviction_trims_memo_entries_at_flush() {
    let dcg = engine_with(Config {
        eviction_policy: EvictionPolicy::Fifo(2),
        ..Config::default()
    });
    let m: Mfn<u64, u64> = dcg.mk_mfn(Name::of_string("double"), |_, x| x * 2);
    let arts: Vec<_> = (0..4).map(|x| m.art(x)).collect();
    for art in &arts {
        dcg.force(art);
    }
    dcg.flush();
    assert_atomic_usize_eq!(dcg.stats().evicted, 2);

    // The evicted argument misses again; the node records themselves are
    // still owned by their handles.
    let again = m.art(0);
    assert_ne!(again, arts[0]);
    assert_atomic_usize_eq!(dcg.stats().memo_misses, 5);
}

#[test]
fn lru_eviction_keeps_recently_hit_entries() {
    let dcg = engine_with(Config {
        eviction_policy: EvictionPolicy::Lru(2),
        ..Config::default()
    });
    let m: Mfn<u64, u64> = dcg.mk_mfn(Name::of_string("double"), |_, x| x * 2);
    let arts: Vec<_> = (0..4).map(|x| m.art(x)).collect();
    for art in &arts {
        dcg.force(art);
    }
    // Touch 0, pushing 1 and 2 to the cold end.
    let zero = m.art(0);
    assert_eq!(zero, arts[0]);
    dcg.flush();
    assert_atomic_usize_eq!(dcg.stats().evicted, 2);

    // 0 survived the trim, 1 did not.
    assert_eq!(m.art(0), arts[0]);
    assert_ne!(m.art(1), arts[1]);
}

#[test]
#[should_panic(expected = "misuse")]
fn set_during_computation_panics() {
    let dcg = engine();
    let c = dcg.cell(Name::of_string("c"), 1_u64);
    let t = {
        let c = c.clone();
        dcg.thunk(Name::of_string("t"), move |d| {
            d.set(&c, 9);
            0_u64
        })
    };
    dcg.force(&t);
}

#[test]
#[should_panic(expected = "dependency cycle")]
fn forcing_a_running_node_panics() {
    let dcg = engine();
    let slot: Rc<RefCell<Option<Art<u64>>>> = Rc::new(RefCell::new(None));
    let t = {
        let slot = slot.clone();
        dcg.thunk(Name::of_string("t"), move |d| {
            let me = slot.borrow().clone().expect("slot was filled before forcing");
            d.force(&me)
        })
    };
    *slot.borrow_mut() = Some(t.clone());
    dcg.force(&t);
}

#[test]
fn sanitized_forces_return_copies() {
    let dcg = engine_with(Config {
        sanitize_pointers: true,
        ..Config::default()
    });
    let c = dcg.cell(Name::of_string("c"), vec![1_u64, 2, 3]);
    assert_eq!(dcg.force(&c), vec![1, 2, 3]);
}

#[test]
fn clean_ancestry_check_passes_on_clean_graphs() {
    let dcg = engine_with(Config {
        debug_assert: true,
        ..Config::default()
    });
    let c = dcg.cell(Name::of_string("c"), 1_u64);
    let t = {
        let c = c.clone();
        dcg.thunk(Name::of_string("t"), move |d| d.force(&c) + 1)
    };
    assert_eq!(dcg.force(&t), 2);
    dcg.set(&c, 2);
    assert_eq!(dcg.force(&t), 3);
}

#[test]
fn random_mutation_soak() {
    let dcg = engine();
    let cells: Vec<Art<u64>> = (0..16)
        .map(|i| dcg.cell(Name::of_usize(i), i as u64))
        .collect();
    let m: Mfn<(usize, usize), u64> = {
        let cells = cells.clone();
        dcg.mk_mfn(Name::of_string("segment-sum"), move |m, (lo, hi)| {
            if hi - lo == 1 {
                m.dcg().force(&cells[lo])
            } else {
                let mid = lo + (hi - lo) / 2;
                m.dcg().force(&m.art((lo, mid))) + m.dcg().force(&m.art((mid, hi)))
            }
        })
    };
    let root = m.art((0, 16));
    let mut model: Vec<u64> = (0..16).collect();
    assert_eq!(dcg.force(&root), model.iter().sum::<u64>());

    let mut rng = rand::rng();
    for _ in 0..50 {
        let i = rng.random_range(0..16);
        let v: u64 = rng.random_range(0..1000);
        let before = dcg.stats().evaluated.load(atomic::Ordering::SeqCst);
        dcg.set(&cells[i], v);
        model[i] = v;
        assert_eq!(dcg.force(&root), model.iter().sum::<u64>());
        let after = dcg.stats().evaluated.load(atomic::Ordering::SeqCst);
        // Only the segment chain covering the mutated cell re-runs.
        assert!(
            after - before <= 5,
            "a point mutation re-evaluated {} nodes",
            after - before
        );
    }
}

//
// Incremental list fixtures: cells as links, flags for duplicates.
//

#[derive(Clone, PartialEq, Eq, Hash, Debug)]
enum List {
    Nil,
    Cons(u64, Art<List>),
}

impl Data for List {}

fn build_list(dcg: &Dcg, values: &[u64]) -> (Art<List>, Vec<Art<List>>) {
    let base = Name::of_string("list");
    let mut links: Vec<Art<List>> = Vec::new();
    let mut next = dcg.cell(Name::pair(base.clone(), Name::of_string("nil")), List::Nil);
    links.push(next.clone());
    for (i, value) in values.iter().enumerate().rev() {
        next = dcg.cell(
            Name::pair(base.clone(), Name::of_usize(i)),
            List::Cons(*value, next),
        );
        links.push(next.clone());
    }
    links.reverse();
    (links[0].clone(), links)
}

#[derive(Clone, PartialEq, Eq, Hash, Debug, Default)]
struct Seen(Vec<u64>);

impl Data for Seen {}

impl Seen {
    fn contains(&self, value: u64) -> bool {
        self.0.binary_search(&value).is_ok()
    }

    fn with(&self, value: u64) -> Seen {
        let mut values = self.0.clone();
        if let Err(at) = values.binary_search(&value) {
            values.insert(at, value);
        }
        Seen(values)
    }
}

/// Maps each element to 0 on first occurrence and 1 when it repeats an
/// earlier element.
fn unique_mfn(dcg: &Dcg, runs: Arc<AtomicUsize>) -> Mfn<(Art<List>, Seen), List> {
    dcg.mk_mfn(Name::of_string("unique"), move |m, (list, seen): (Art<List>, Seen)| {
        runs.fetch_add(1, atomic::Ordering::SeqCst);
        match m.dcg().force(&list) {
            List::Nil => List::Nil,
            List::Cons(value, rest) => {
                let dup = seen.contains(value);
                let flag = u64::from(dup);
                let seen = if dup { seen } else { seen.with(value) };
                List::Cons(flag, m.art((rest, seen)))
            }
        }
    })
}

fn read_flags(dcg: &Dcg, mut list: Art<List>) -> Vec<u64> {
    let mut out = Vec::new();
    loop {
        match dcg.force(&list) {
            List::Nil => break,
            List::Cons(value, rest) => {
                out.push(value);
                list = rest;
            }
        }
    }
    out
}

#[test]
fn list_unique_all_distinct() {
    let dcg = engine();
    let (head, _links) = build_list(&dcg, &[0, 1, 2, 3, 4, 5, 6, 7, 8, 9]);
    let m = unique_mfn(&dcg, Arc::new(AtomicUsize::new(0)));
    let out = m.art((head, Seen::default()));
    assert_eq!(read_flags(&dcg, out), vec![0, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
}

#[test]
fn list_unique_alternating() {
    let dcg = engine();
    let (head, _links) = build_list(&dcg, &[0, 1, 0, 2, 0, 3, 0, 4, 0, 5]);
    let m = unique_mfn(&dcg, Arc::new(AtomicUsize::new(0)));
    let out = m.art((head, Seen::default()));
    assert_eq!(read_flags(&dcg, out), vec![0, 0, 1, 0, 1, 0, 1, 0, 1, 0]);
}

#[test]
fn list_unique_empty() {
    let dcg = engine();
    let (head, _links) = build_list(&dcg, &[]);
    let m = unique_mfn(&dcg, Arc::new(AtomicUsize::new(0)));
    let out = m.art((head, Seen::default()));
    assert_eq!(read_flags(&dcg, out), Vec::<u64>::new());
}

#[test]
fn incremental_reread_after_point_mutation() {
    let dcg = engine();
    let (head, links) = build_list(&dcg, &[0, 1, 2, 3, 4, 5, 6, 7, 8, 9]);
    let runs = Arc::new(AtomicUsize::new(0));
    let m = unique_mfn(&dcg, runs.clone());
    let out = m.art((head, Seen::default()));
    assert_eq!(read_flags(&dcg, out.clone()), vec![0; 10]);
    let before = runs.load(atomic::Ordering::SeqCst);

    // Replace element 3 with a duplicate of element 0.
    dcg.set(&links[3], List::Cons(0, links[4].clone()));
    assert_eq!(
        read_flags(&dcg, out),
        vec![0, 0, 0, 1, 0, 0, 0, 0, 0, 0]
    );
    let after = runs.load(atomic::Ordering::SeqCst);
    // Only the affected chain re-evaluates, strictly fewer bodies than the
    // list has elements.
    assert!(
        after - before < 10,
        "a point mutation re-ran {} bodies",
        after - before
    );
}

//
// Geometry fixtures.
//

#[derive(Clone, Copy, Debug)]
struct Pt {
    x: f64,
    y: f64,
}

fn pt(x: f64, y: f64) -> Pt {
    Pt { x, y }
}

impl PartialEq for Pt {
    fn eq(&self, other: &Pt) -> bool {
        self.x.to_bits() == other.x.to_bits() && self.y.to_bits() == other.y.to_bits()
    }
}

impl Eq for Pt {}

impl Hash for Pt {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.x.to_bits().hash(state);
        self.y.to_bits().hash(state);
    }
}

impl Data for Pt {}

#[derive(Clone, PartialEq, Eq, Hash, Debug)]
struct Pts(Vec<Pt>);

impl Data for Pts {}

#[derive(Clone, Copy, Debug)]
struct Dist(f64);

impl PartialEq for Dist {
    fn eq(&self, other: &Dist) -> bool {
        self.0.to_bits() == other.0.to_bits()
    }
}

impl Eq for Dist {}

impl Hash for Dist {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.to_bits().hash(state);
    }
}

impl Data for Dist {}

fn cross(o: Pt, a: Pt, b: Pt) -> f64 {
    (a.x - o.x) * (b.y - o.y) - (a.y - o.y) * (b.x - o.x)
}

/// Points of the hull strictly left of the directed line a→b, in traversal
/// order, exclusive of the endpoints.
fn hull_mfn(dcg: &Dcg) -> Mfn<(Pt, Pt, Pts), Pts> {
    dcg.mk_mfn(Name::of_string("hull"), |m, (a, b, Pts(points))| {
        let above: Vec<Pt> = points
            .iter()
            .copied()
            .filter(|p| cross(a, b, *p) > 0.0)
            .collect();
        let Some(furthest) = above.iter().copied().max_by(|p, q| {
            cross(a, b, *p)
                .partial_cmp(&cross(a, b, *q))
                .expect("degenerate cross product")
        }) else {
            return Pts(Vec::new());
        };
        let left = m.dcg().force(&m.art((a, furthest, Pts(above.clone()))));
        let right = m.dcg().force(&m.art((furthest, b, Pts(above))));
        let mut hull = left.0;
        hull.push(furthest);
        hull.extend(right.0);
        Pts(hull)
    })
}

#[test]
fn quickhull_keeps_only_corners() {
    let dcg = engine();
    let cloud = dcg.cell(
        Name::of_string("cloud"),
        Pts(vec![
            pt(1.0, 1.0),
            pt(2.0, 2.0),
            pt(1.0, 2.0),
            pt(2.0, 1.0),
            pt(1.5, 1.5),
        ]),
    );
    let m = hull_mfn(&dcg);
    let hull = {
        let cloud = cloud.clone();
        let m = m.clone();
        dcg.thunk(Name::of_string("hull-root"), move |d| {
            let Pts(points) = d.force(&cloud);
            let min = points
                .iter()
                .copied()
                .min_by(|p, q| (p.x, p.y).partial_cmp(&(q.x, q.y)).expect("unordered point"))
                .expect("empty cloud");
            let max = points
                .iter()
                .copied()
                .max_by(|p, q| (p.x, p.y).partial_cmp(&(q.x, q.y)).expect("unordered point"))
                .expect("empty cloud");
            let upper = d.force(&m.art((min, max, Pts(points.clone()))));
            let lower = d.force(&m.art((max, min, Pts(points))));
            let mut hull = vec![min];
            hull.extend(upper.0);
            hull.push(max);
            hull.extend(lower.0);
            Pts(hull)
        })
    };

    // The four corners in traversal order; the interior point never appears.
    assert_eq!(
        dcg.force(&hull),
        Pts(vec![
            pt(1.0, 1.0),
            pt(1.0, 2.0),
            pt(2.0, 2.0),
            pt(2.0, 1.0)
        ])
    );

    // Pull the cloud outward; the old far corner falls onto the new
    // diagonal and drops out of the hull.
    dcg.set(
        &cloud,
        Pts(vec![
            pt(1.0, 1.0),
            pt(2.0, 2.0),
            pt(1.0, 2.0),
            pt(2.0, 1.0),
            pt(1.5, 1.5),
            pt(3.0, 3.0),
        ]),
    );
    assert_eq!(
        dcg.force(&hull),
        Pts(vec![
            pt(1.0, 1.0),
            pt(1.0, 2.0),
            pt(3.0, 3.0),
            pt(2.0, 1.0)
        ])
    );
}

#[test]
fn cloud_max_distance() {
    let dcg = engine();
    let a = dcg.cell(
        Name::of_string("cloud-a"),
        Pts(vec![
            pt(1.0, 1.0),
            pt(2.0, 2.0),
            pt(1.0, 2.0),
            pt(2.0, 1.0),
            pt(1.5, 1.5),
        ]),
    );
    let b = dcg.cell(
        Name::of_string("cloud-b"),
        Pts(vec![
            pt(5.0, 5.0),
            pt(6.0, 6.0),
            pt(5.0, 6.0),
            pt(6.0, 5.0),
            pt(5.5, 5.5),
        ]),
    );
    let farthest = {
        let (a, b) = (a.clone(), b.clone());
        dcg.thunk(Name::of_string("max-dist"), move |d| {
            let Pts(left) = d.force(&a);
            let Pts(right) = d.force(&b);
            let mut best = 0.0_f64;
            for p in &left {
                for q in &right {
                    let dx = p.x - q.x;
                    let dy = p.y - q.y;
                    best = best.max(dx * dx + dy * dy);
                }
            }
            Dist(best)
        })
    };
    assert_eq!(dcg.force(&farthest), Dist(50.0));
    assert!((50.0_f64.sqrt() - 7.071_067_8).abs() < 1e-6);

    dcg.set(&b, Pts(vec![pt(7.0, 7.0)]));
    assert_eq!(dcg.force(&farthest), Dist(72.0));
}
