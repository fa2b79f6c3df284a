//! Timer slots and the tables that name them.
//!
//! Every timer lives in one append-only arena and is identified by its index
//! (`SlotId`). Static and function-table slots are registered while the
//! profiler is built, in definition order. User-function and
//! external-function slots are interned on first use into two hash tables,
//! each behind its own lock, and stay until the profiler is dropped.
//!
//! A `SlotId` handed out once is valid for the life of the registry: the
//! arena only grows, and slots are held through `Arc` so growing the vector
//! never moves a slot that a stack is updating.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::Error;

/// Longest timer name accepted, in bytes. Longer names are rejected rather
/// than truncated so that two distinct functions never share a slot.
pub const MAX_NAME_LEN: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize)]
pub struct SlotId(u32);

impl SlotId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// How a function-table entry evaluates its arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TableKind {
    Builtin,
    Special,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(tag = "category", rename_all = "snake_case")]
pub enum Category {
    Static,
    /// `internal` marks entries reached through the internal dispatch table
    /// rather than as primitives.
    FunctionTable {
        kind: TableKind,
        internal: bool,
    },
    UserFunction,
    ExternalFunction,
    SpecialAggregate,
}

impl Category {
    /// Position of the category in raw report order.
    pub(crate) fn rank(self) -> u8 {
        match self {
            Category::Static => 0,
            Category::FunctionTable { .. } => 1,
            Category::UserFunction => 2,
            Category::ExternalFunction => 3,
            Category::SpecialAggregate => 4,
        }
    }

    pub fn is_dynamic(self) -> bool {
        matches!(self, Category::UserFunction | Category::ExternalFunction)
    }
}

/// Categories whose slots are created on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DynamicCategory {
    UserFunction,
    ExternalFunction,
}

impl From<DynamicCategory> for Category {
    fn from(cat: DynamicCategory) -> Self {
        match cat {
            DynamicCategory::UserFunction => Category::UserFunction,
            DynamicCategory::ExternalFunction => Category::ExternalFunction,
        }
    }
}

/// One function-table entry as declared by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionEntry {
    pub name: String,
    pub kind: TableKind,
    pub internal: bool,
}

impl FunctionEntry {
    pub fn builtin(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: TableKind::Builtin,
            internal: false,
        }
    }

    pub fn special(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: TableKind::Special,
            internal: false,
        }
    }

    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }
}

/// Point-in-time copy of a slot's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct SlotCounters {
    pub calls: u64,
    pub aborts: u64,
    pub self_ticks: u64,
    pub total_ticks: u64,
    pub recursive_calls: u64,
    pub has_bytecode: bool,
}

/// A registered timer accumulator.
///
/// Counters are relaxed atomics: each stack updates them from its own
/// thread, and the report reads them only after every stack has drained.
#[derive(Debug)]
pub struct Slot {
    id: SlotId,
    name: Box<str>,
    category: Category,
    /// Position within the category at registration time.
    order: u32,
    calls: AtomicU64,
    aborts: AtomicU64,
    self_ticks: AtomicU64,
    total_ticks: AtomicU64,
    recursive_calls: AtomicU64,
    has_bytecode: AtomicBool,
}

impl Slot {
    fn new(id: SlotId, name: Box<str>, category: Category, order: u32) -> Self {
        Self {
            id,
            name,
            category,
            order,
            calls: AtomicU64::new(0),
            aborts: AtomicU64::new(0),
            self_ticks: AtomicU64::new(0),
            total_ticks: AtomicU64::new(0),
            recursive_calls: AtomicU64::new(0),
            has_bytecode: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> SlotId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn category(&self) -> Category {
        self.category
    }

    pub(crate) fn order(&self) -> u32 {
        self.order
    }

    pub fn counters(&self) -> SlotCounters {
        SlotCounters {
            calls: self.calls.load(Ordering::Relaxed),
            aborts: self.aborts.load(Ordering::Relaxed),
            self_ticks: self.self_ticks.load(Ordering::Relaxed),
            total_ticks: self.total_ticks.load(Ordering::Relaxed),
            recursive_calls: self.recursive_calls.load(Ordering::Relaxed),
            has_bytecode: self.has_bytecode.load(Ordering::Relaxed),
        }
    }

    #[inline]
    pub(crate) fn record_call(&self, recursive: bool) {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if recursive {
            self.recursive_calls.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub(crate) fn add_self(&self, ticks: u64) {
        if ticks != 0 {
            self.self_ticks.fetch_add(ticks, Ordering::Relaxed);
        }
    }

    #[inline]
    pub(crate) fn add_total(&self, ticks: u64) {
        self.total_ticks.fetch_add(ticks, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_abort(&self) {
        self.aborts.fetch_add(1, Ordering::Relaxed);
    }

    /// Sticky. Only user-function slots keep the flag.
    pub(crate) fn mark_bytecode(&self) -> bool {
        if self.category != Category::UserFunction {
            return false;
        }
        self.has_bytecode.store(true, Ordering::Relaxed);
        true
    }
}

pub(crate) fn check_name(name: &str) -> Result<(), Error> {
    if name.len() > MAX_NAME_LEN {
        return Err(Error::NameTooLong {
            name: name.to_owned(),
            len: name.len(),
        });
    }
    if name.contains(['\t', '\n', '\r']) {
        return Err(Error::NameHasControl {
            name: name.to_owned(),
        });
    }
    Ok(())
}

#[derive(Debug, Default)]
pub struct Registry {
    slots: RwLock<Vec<Arc<Slot>>>,
    /// Static id (definition index) -> slot, `None` when disabled.
    statics: Vec<Option<SlotId>>,
    /// Function-table index -> slot.
    table: Vec<SlotId>,
    user: RwLock<HashMap<Box<str>, SlotId>>,
    external: RwLock<HashMap<Box<str>, SlotId>>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn push_slot(&self, name: Box<str>, category: Category, order: u32) -> SlotId {
        let mut slots = self.slots.write();
        let id = SlotId(slots.len() as u32);
        slots.push(Arc::new(Slot::new(id, name, category, order)));
        id
    }

    /// Register the next static timer. `enabled == false` reserves the
    /// static id without creating a slot.
    pub(crate) fn register_static(
        &mut self,
        name: &str,
        enabled: bool,
    ) -> Result<Option<SlotId>, Error> {
        check_name(name)?;
        let slot = if enabled {
            let order = self.statics.iter().flatten().count() as u32;
            Some(self.push_slot(name.into(), Category::Static, order))
        } else {
            None
        };
        self.statics.push(slot);
        Ok(slot)
    }

    pub(crate) fn register_function_table(
        &mut self,
        entry: &FunctionEntry,
    ) -> Result<SlotId, Error> {
        check_name(&entry.name)?;
        let category = Category::FunctionTable {
            kind: entry.kind,
            internal: entry.internal,
        };
        let order = self.table.len() as u32;
        let id = self.push_slot(entry.name.as_str().into(), category, order);
        self.table.push(id);
        Ok(id)
    }

    /// A registry holding only what overhead calibration runs on: an
    /// enclosing static and the timer measured inside it.
    pub(crate) fn calibration() -> (Self, SlotId, SlotId) {
        let registry = Self::new();
        let outer = registry.push_slot("(calibration outer)".into(), Category::Static, 0);
        let timer = registry.push_slot("(calibration)".into(), Category::Static, 1);
        (registry, outer, timer)
    }

    /// Return the slot for `name`, creating it on first use.
    pub fn intern_dynamic(&self, name: &str, category: DynamicCategory) -> Result<SlotId, Error> {
        let table = match category {
            DynamicCategory::UserFunction => &self.user,
            DynamicCategory::ExternalFunction => &self.external,
        };
        if let Some(&id) = table.read().get(name) {
            return Ok(id);
        }
        check_name(name)?;
        let mut map = table.write();
        // Another thread may have interned the name between the two locks.
        if let Some(&id) = map.get(name) {
            return Ok(id);
        }
        let id = self.push_slot(name.into(), category.into(), 0);
        map.insert(name.into(), id);
        tracing::debug!(%id, timer = name, ?category, "interned dynamic timer");
        Ok(id)
    }

    pub fn lookup_dynamic(&self, name: &str, category: DynamicCategory) -> Option<SlotId> {
        let table = match category {
            DynamicCategory::UserFunction => &self.user,
            DynamicCategory::ExternalFunction => &self.external,
        };
        table.read().get(name).copied()
    }

    pub fn slot(&self, id: SlotId) -> Option<Arc<Slot>> {
        self.slots.read().get(id.index()).cloned()
    }

    /// Slot behind a static id, or `None` if the timer is disabled or unknown.
    #[inline]
    pub fn static_slot(&self, index: usize) -> Option<SlotId> {
        self.statics.get(index).copied().flatten()
    }

    pub fn static_count(&self) -> usize {
        self.statics.len()
    }

    #[inline]
    pub fn table_slot(&self, index: usize) -> Option<SlotId> {
        self.table.get(index).copied()
    }

    pub fn table_len(&self) -> usize {
        self.table.len()
    }

    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every registered slot handle, in arena order.
    pub fn slots(&self) -> Vec<Arc<Slot>> {
        self.slots.read().clone()
    }
}
