#![allow(dead_code)]

use std::{collections::BTreeSet, sync::Arc};

use strata_store::{EOptionP, Entity, Property, PropertyKindId, PropertyLattice, PropertyStore};

pub fn init_logging() {
    let _ = env_logger::Builder::from_env("STRATA_LOG")
        .format_timestamp(None)
        .is_test(true)
        .try_init();
}

// ---------------------------------------------------------------------
// Integers under the max lattice
// ---------------------------------------------------------------------

#[derive(Debug, PartialEq, Eq)]
pub struct IntProp {
    pub kind: PropertyKindId,
    pub value: i64,
}

impl Property for IntProp {
    fn kind_id(&self) -> PropertyKindId {
        self.kind
    }

    fn as_any(&self) -> &dyn core::any::Any {
        self
    }
}

pub fn int_prop(kind: PropertyKindId, value: i64) -> Arc<dyn Property> {
    Arc::new(IntProp { kind, value })
}

pub fn int_of(eoptp: &EOptionP) -> i64 {
    eoptp
        .ub()
        .expect("no value")
        .downcast_ref::<IntProp>()
        .expect("not an IntProp")
        .value
}

pub struct MaxLattice;

impl PropertyLattice for MaxLattice {
    fn lub(&self, a: &dyn Property, b: &dyn Property) -> Arc<dyn Property> {
        let a = a.downcast_ref::<IntProp>().unwrap();
        let b = b.downcast_ref::<IntProp>().unwrap();
        Arc::new(IntProp {
            kind: a.kind,
            value: a.value.max(b.value),
        })
    }

    fn eq(&self, a: &dyn Property, b: &dyn Property) -> bool {
        a.downcast_ref::<IntProp>() == b.downcast_ref::<IntProp>()
    }
}

// ---------------------------------------------------------------------
// String sets under the union lattice
// ---------------------------------------------------------------------

#[derive(Debug, PartialEq, Eq)]
pub struct SetProp {
    pub kind: PropertyKindId,
    pub items: BTreeSet<String>,
}

impl Property for SetProp {
    fn kind_id(&self) -> PropertyKindId {
        self.kind
    }

    fn as_any(&self) -> &dyn core::any::Any {
        self
    }
}

pub fn set_prop<'a>(
    kind: PropertyKindId,
    items: impl IntoIterator<Item = &'a str>,
) -> Arc<dyn Property> {
    Arc::new(SetProp {
        kind,
        items: items.into_iter().map(str::to_string).collect(),
    })
}

pub fn set_of(eoptp: &EOptionP) -> BTreeSet<String> {
    eoptp
        .ub()
        .expect("no value")
        .downcast_ref::<SetProp>()
        .expect("not a SetProp")
        .items
        .clone()
}

pub struct UnionLattice;

impl PropertyLattice for UnionLattice {
    fn lub(&self, a: &dyn Property, b: &dyn Property) -> Arc<dyn Property> {
        let a = a.downcast_ref::<SetProp>().unwrap();
        let b = b.downcast_ref::<SetProp>().unwrap();
        Arc::new(SetProp {
            kind: a.kind,
            items: a.items.union(&b.items).cloned().collect(),
        })
    }

    fn eq(&self, a: &dyn Property, b: &dyn Property) -> bool {
        a.downcast_ref::<SetProp>() == b.downcast_ref::<SetProp>()
    }
}

// ---------------------------------------------------------------------
// A three-point lattice: Bot < Mid < Top
// ---------------------------------------------------------------------

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Bot,
    Mid,
    Top,
}

#[derive(Debug, PartialEq, Eq)]
pub struct LevelProp {
    pub kind: PropertyKindId,
    pub level: Level,
}

impl Property for LevelProp {
    fn kind_id(&self) -> PropertyKindId {
        self.kind
    }

    fn as_any(&self) -> &dyn core::any::Any {
        self
    }
}

pub fn level_prop(kind: PropertyKindId, level: Level) -> Arc<dyn Property> {
    Arc::new(LevelProp { kind, level })
}

pub fn level_of(eoptp: &EOptionP) -> Level {
    eoptp
        .ub()
        .expect("no value")
        .downcast_ref::<LevelProp>()
        .expect("not a LevelProp")
        .level
}

pub struct LevelLattice;

impl PropertyLattice for LevelLattice {
    fn lub(&self, a: &dyn Property, b: &dyn Property) -> Arc<dyn Property> {
        let a = a.downcast_ref::<LevelProp>().unwrap();
        let b = b.downcast_ref::<LevelProp>().unwrap();
        Arc::new(LevelProp {
            kind: a.kind,
            level: a.level.max(b.level),
        })
    }

    fn eq(&self, a: &dyn Property, b: &dyn Property) -> bool {
        a.downcast_ref::<LevelProp>() == b.downcast_ref::<LevelProp>()
    }
}

// ---------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------

/// The final property of `(e, k)`, which must exist and be final.
pub fn final_eoptp(store: &PropertyStore, e: &Entity, k: PropertyKindId) -> EOptionP {
    let eoptp = store.get(e, k).expect("state not present");
    assert!(eoptp.is_final(), "expected a final value, got {eoptp:?}");
    eoptp
}
