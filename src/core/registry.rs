//! Global value registry.
//!
//! Maps runtime value handles to the placeholder symbols compiled code uses
//! to reach them. Every handle gets exactly one symbol for the lifetime of
//! the process. While an image is being built, each new symbol also gets a
//! 1-based slot in the global offset table; index 0 means "not in a table".

use hashbrown::HashMap;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Runtime-assigned identity of a value that compiled code refers to.
///
/// The runtime guarantees the handle stays the same across relocation of
/// the underlying object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueHandle(pub u64);

/// Placeholder symbol for a registered value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalSymbol {
    pub name: String,
    /// Position in the global offset table, when persisted.
    pub index: Option<NonZeroU32>,
}

/// Process local storage backing a placeholder symbol.
pub type GlobalSlot = Arc<AtomicUsize>;

/// The in-process execution engine, as far as symbol mapping goes.
pub trait ExecutionEngine: Send {
    /// Resolve `symbol` to `slot` for code running in this process.
    fn add_global_mapping(&mut self, symbol: &str, slot: GlobalSlot);

    fn global_mapping(&self, symbol: &str) -> Option<GlobalSlot>;
}

/// Plain symbol → slot map, used when no JIT is attached.
#[derive(Debug, Default)]
pub struct GlobalMappings {
    slots: HashMap<String, GlobalSlot>,
}

impl GlobalMappings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

impl ExecutionEngine for GlobalMappings {
    fn add_global_mapping(&mut self, symbol: &str, slot: GlobalSlot) {
        self.slots.insert(symbol.to_string(), slot);
    }

    fn global_mapping(&self, symbol: &str) -> Option<GlobalSlot> {
        self.slots.get(symbol).cloned()
    }
}

#[derive(Debug, Clone)]
struct RegistryEntry {
    symbol: String,
    index: u32,
}

/// Handle → symbol table with the ordered list of persisted symbols.
#[derive(Debug, Default)]
pub struct GlobalRegistry {
    entries: HashMap<ValueHandle, RegistryEntry>,
    table: Vec<String>,
    unique: u64,
}

impl GlobalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, handle: ValueHandle) -> Option<GlobalSymbol> {
        self.entries.get(&handle).map(|e| GlobalSymbol {
            name: e.symbol.clone(),
            index: NonZeroU32::new(e.index),
        })
    }

    /// Table index of `handle`, if it was registered while persisting.
    pub fn index_of(&self, handle: ValueHandle) -> Option<NonZeroU32> {
        self.entries
            .get(&handle)
            .and_then(|e| NonZeroU32::new(e.index))
    }

    /// Fresh symbol name; advances the unique counter.
    pub(crate) fn next_name(&mut self, hint: &str) -> String {
        let name = format!("{hint}{}", self.unique);
        self.unique += 1;
        name
    }

    /// Record a new entry. Persisted entries are appended to the table and
    /// receive the next index.
    pub(crate) fn record(&mut self, handle: ValueHandle, symbol: String, persistent: bool) -> GlobalSymbol {
        debug_assert!(!self.entries.contains_key(&handle));
        let index = if persistent {
            self.table.push(symbol.clone());
            self.table.len() as u32
        } else {
            0
        };
        self.entries.insert(
            handle,
            RegistryEntry {
                symbol: symbol.clone(),
                index,
            },
        );
        GlobalSymbol {
            name: symbol,
            index: NonZeroU32::new(index),
        }
    }

    /// Persisted symbols in index order; element `i - 1` has index `i`.
    pub fn table(&self) -> &[String] {
        &self.table
    }

    /// Number of symbols ever handed out.
    pub fn high_water(&self) -> u64 {
        self.unique
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Allocate a zeroed slot, map it, then store the handle into it.
pub(crate) fn bind_slot(engine: &mut dyn ExecutionEngine, symbol: &str, handle: ValueHandle) -> GlobalSlot {
    let slot: GlobalSlot = Arc::new(AtomicUsize::new(0));
    engine.add_global_mapping(symbol, Arc::clone(&slot));
    slot.store(handle.0 as usize, Ordering::Release);
    slot
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_are_unique() {
        let mut reg = GlobalRegistry::new();
        assert_eq!(reg.next_name("jl_global#"), "jl_global#0");
        assert_eq!(reg.next_name("jl_global#"), "jl_global#1");
        assert_eq!(reg.high_water(), 2);
    }

    #[test]
    fn test_persistent_indices_are_one_based() {
        let mut reg = GlobalRegistry::new();
        let a = reg.record(ValueHandle(10), "a".into(), true);
        let b = reg.record(ValueHandle(20), "b".into(), false);
        let c = reg.record(ValueHandle(30), "c".into(), true);

        assert_eq!(a.index.map(NonZeroU32::get), Some(1));
        assert_eq!(b.index, None);
        assert_eq!(c.index.map(NonZeroU32::get), Some(2));
        assert_eq!(reg.table(), &["a".to_string(), "c".to_string()]);
        assert_eq!(reg.index_of(ValueHandle(30)).map(NonZeroU32::get), Some(2));
        assert_eq!(reg.index_of(ValueHandle(20)), None);
        assert_eq!(reg.index_of(ValueHandle(99)), None);
        assert_eq!(reg.lookup(ValueHandle(20)).unwrap().name, "b");
    }

    #[test]
    fn test_bind_slot() {
        let mut engine = GlobalMappings::new();
        let slot = bind_slot(&mut engine, "sym", ValueHandle(0xdead));
        assert_eq!(slot.load(Ordering::Acquire), 0xdead);
        let mapped = engine.global_mapping("sym").unwrap();
        assert!(Arc::ptr_eq(&slot, &mapped));
        assert_eq!(engine.len(), 1);
    }
}
