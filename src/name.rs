// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use fnv::FnvHasher;

use crate::node::Data;

///
/// A first-class identity token. Names make memoization hits stable across
/// small edits: a call site keyed by a `Name` refers to the same graph node on
/// every run, even when its argument changes.
///
/// Names are small immutable trees with a precomputed structural hash, so
/// equality is a hash comparison followed by a structural walk, and cloning is
/// a pointer bump.
///
#[derive(Clone)]
pub struct Name {
    hash: u64,
    sym: Rc<Sym>,
}

#[derive(Debug)]
enum Sym {
    Text(String),
    Num(u64),
    Pair(Name, Name),
    ForkL(Name),
    ForkR(Name),
    Gensym(u64),
}

static GENSYM: AtomicU64 = AtomicU64::new(0);

impl Name {
    fn intern(sym: Sym) -> Name {
        let mut hasher = FnvHasher::default();
        match &sym {
            Sym::Text(s) => {
                0_u8.hash(&mut hasher);
                s.hash(&mut hasher);
            }
            Sym::Num(n) => {
                1_u8.hash(&mut hasher);
                n.hash(&mut hasher);
            }
            Sym::Pair(a, b) => {
                2_u8.hash(&mut hasher);
                a.hash.hash(&mut hasher);
                b.hash.hash(&mut hasher);
            }
            Sym::ForkL(n) => {
                3_u8.hash(&mut hasher);
                n.hash.hash(&mut hasher);
            }
            Sym::ForkR(n) => {
                4_u8.hash(&mut hasher);
                n.hash.hash(&mut hasher);
            }
            Sym::Gensym(g) => {
                5_u8.hash(&mut hasher);
                g.hash(&mut hasher);
            }
        }
        Name {
            hash: hasher.finish(),
            sym: Rc::new(sym),
        }
    }

    pub fn of_string(s: &str) -> Name {
        Name::intern(Sym::Text(s.to_owned()))
    }

    pub fn of_usize(n: usize) -> Name {
        Name::intern(Sym::Num(n as u64))
    }

    ///
    /// Combines two names into one. Pairing is the primary way callers derive
    /// distinct stable names from a common prefix.
    ///
    pub fn pair(fst: Name, snd: Name) -> Name {
        Name::intern(Sym::Pair(fst, snd))
    }

    ///
    /// Deterministically splits a name in two. Forking the same name always
    /// yields the same two children.
    ///
    pub fn fork(&self) -> (Name, Name) {
        (
            Name::intern(Sym::ForkL(self.clone())),
            Name::intern(Sym::ForkR(self.clone())),
        )
    }

    ///
    /// A fresh name, unequal to every name produced so far.
    ///
    pub fn gensym() -> Name {
        Name::intern(Sym::Gensym(GENSYM.fetch_add(1, Ordering::SeqCst)))
    }
}

impl PartialEq for Name {
    fn eq(&self, other: &Name) -> bool {
        if self.hash != other.hash {
            return false;
        }
        match (&*self.sym, &*other.sym) {
            (Sym::Text(a), Sym::Text(b)) => a == b,
            (Sym::Num(a), Sym::Num(b)) => a == b,
            (Sym::Pair(a1, a2), Sym::Pair(b1, b2)) => a1 == b1 && a2 == b2,
            (Sym::ForkL(a), Sym::ForkL(b)) => a == b,
            (Sym::ForkR(a), Sym::ForkR(b)) => a == b,
            (Sym::Gensym(a), Sym::Gensym(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Name {}

impl Hash for Name {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &*self.sym {
            Sym::Text(s) => write!(f, "{s}"),
            Sym::Num(n) => write!(f, "{n}"),
            Sym::Pair(a, b) => write!(f, "({a},{b})"),
            Sym::ForkL(n) => write!(f, "{n}.l"),
            Sym::ForkR(n) => write!(f, "{n}.r"),
            Sym::Gensym(g) => write!(f, "#{g}"),
        }
    }
}

impl fmt::Debug for Name {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Name({self})")
    }
}

impl Data for Name {}
