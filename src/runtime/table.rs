//! The table interface: keyed access on boxed variants.
//!
//! Box types that behave like containers implement [`builtin::TABLE_VARIANT`]
//! by embedding a [`TableVariantClass`]. [`Variant`] forwards `index`,
//! `set_index`, `next` and `count` to it.

use crate::error::{Error, Result, fail};
use crate::runtime::Runtime;
use crate::runtime::boxed::BoxRef;
use crate::runtime::class::{ClassStruct, Interface};
use crate::runtime::interface::try_query_interface;
use crate::runtime::types::builtin;
use crate::runtime::variant::Variant;

pub type IndexFn = fn(&Runtime, &BoxRef, &Variant, &mut Variant) -> Result<()>;
pub type SetIndexFn = fn(&Runtime, &BoxRef, &Variant, Variant) -> Result<()>;
/// Advances `key` to the next entry and stores its value. An invalid key
/// starts the iteration; the function leaves `key` invalid when done.
pub type NextFn = fn(&Runtime, &BoxRef, &mut Variant, &mut Variant) -> Result<()>;
pub type CountFn = fn(&BoxRef) -> usize;

/// Interface block of [`builtin::TABLE_VARIANT`].
#[repr(C)]
pub struct TableVariantClass {
    base: Interface,
    pub index: Option<IndexFn>,
    pub set_index: Option<SetIndexFn>,
    pub next: Option<NextFn>,
    pub count: Option<CountFn>,
}

// SAFETY: starts with `Interface`; every slot is a nullable fn pointer.
unsafe impl ClassStruct for TableVariantClass {}

fn slot<F>(boxed: &BoxRef, select: impl Fn(&TableVariantClass) -> Option<F>) -> Option<F> {
    let iface = try_query_interface(boxed.instance(), builtin::TABLE_VARIANT)?;
    iface.dispatch(select).ok()
}

/// Looks `key` up. Boxes without the interface yield an invalid variant.
pub(crate) fn index(rt: &Runtime, boxed: &BoxRef, key: &Variant) -> Result<Variant> {
    let mut out = Variant::invalid();
    if let Some(index) = slot(boxed, |vt| vt.index) {
        index(rt, boxed, key, &mut out)?;
    }
    Ok(out)
}

pub(crate) fn set_index(rt: &Runtime, boxed: &BoxRef, key: &Variant, value: Variant) -> Result<()> {
    match slot(boxed, |vt| vt.set_index) {
        Some(set_index) => set_index(rt, boxed, key, value),
        None => fail(Error::Unimplemented {
            type_name: boxed.type_name().to_string(),
            operation: "set_index",
        }),
    }
}

pub(crate) fn next(rt: &Runtime, boxed: &BoxRef, key: &mut Variant, value: &mut Variant) -> Result<()> {
    match slot(boxed, |vt| vt.next) {
        Some(next) => next(rt, boxed, key, value),
        None => {
            key.destruct();
            value.destruct();
            Ok(())
        }
    }
}

pub(crate) fn count(boxed: &BoxRef) -> usize {
    slot(boxed, |vt| vt.count).map_or(0, |count| count(boxed))
}
