// This module holds the state of one create-then-emit cycle. A NativeSession owns a
// private clone of the shadow module with every compiled fragment merged into it, the
// ordered global table (registry symbols, remapped by name into the clone), the ordered
// function table and the map from specialization to its table entry. The session is
// produced by the compilation driver and consumed by artifact emission, which destroys
// it. SessionStats records what the driver did: inference and code generation calls,
// cache hits, omissions and the resulting table sizes, with a Display summary for the
// command line driver and logs.

//! Per-build compilation session.

use crate::driver::{ApiFlag, SpecializationId};
use crate::ir::Module;
use hashbrown::HashMap;
use std::fmt;

/// Table slots assigned to one specialization.
///
/// Indices are 1-based positions in the function table; 0 means absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableEntry {
    pub api: ApiFlag,
    pub specialized: u32,
    pub generic: u32,
}

/// Result of [`AotContext::create_session`](crate::AotContext::create_session).
#[derive(Debug)]
pub struct NativeSession {
    pub(crate) module: Module,
    pub(crate) gvars: Vec<String>,
    pub(crate) fvars: Vec<String>,
    pub(crate) fvar_map: HashMap<SpecializationId, TableEntry>,
    pub(crate) persistent: bool,
    pub(crate) stats: SessionStats,
}

impl NativeSession {
    /// The merged module that emission will write.
    pub fn module(&self) -> &Module {
        &self.module
    }

    /// Persisted global symbols in index order.
    pub fn global_table(&self) -> &[String] {
        &self.gvars
    }

    /// Entry point symbols in index order.
    pub fn function_table(&self) -> &[String] {
        &self.fvars
    }

    /// Table indices recorded for `id`, if it was compiled in this session.
    pub fn table_indices_of(&self, id: SpecializationId) -> Option<TableEntry> {
        self.fvar_map.get(&id).copied()
    }

    /// Whether the session was created while persistence was active.
    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }
}

/// What the driver did while building a session.
#[derive(Debug, Default, Clone)]
pub struct SessionStats {
    /// Roots passed to the driver.
    pub roots_requested: usize,

    /// Inference engine invocations.
    pub inference_runs: usize,

    /// Cached inference results reused.
    pub cache_hits: usize,

    /// Code generation invocations.
    pub codegen_runs: usize,

    /// Specializations that failed inference or codegen.
    pub omitted: usize,

    /// Queue entries moved to a later pass.
    pub deferred: usize,

    /// Fragments merged into the session module.
    pub fragments_merged: usize,

    /// Specialized entries that made it into the function table.
    pub specialized_entries: usize,

    pub global_table_len: usize,

    pub function_table_len: usize,
}

impl fmt::Display for SessionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Native Session Statistics:")?;
        writeln!(f, "  Roots requested: {}", self.roots_requested)?;
        writeln!(f, "  Inference runs: {}", self.inference_runs)?;
        writeln!(f, "  Cache hits: {}", self.cache_hits)?;
        writeln!(f, "  Codegen runs: {}", self.codegen_runs)?;
        writeln!(f, "  Fragments merged: {}", self.fragments_merged)?;
        writeln!(f, "  Omitted: {}", self.omitted)?;
        if self.deferred > 0 {
            writeln!(f, "  Deferred to later pass: {}", self.deferred)?;
        }
        writeln!(
            f,
            "  Function table: {} entries ({} specialized)",
            self.function_table_len, self.specialized_entries
        )?;
        writeln!(f, "  Global table: {} entries", self.global_table_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_lookup() {
        let mut fvar_map = HashMap::new();
        fvar_map.insert(
            SpecializationId(7),
            TableEntry {
                api: ApiFlag(1),
                specialized: 1,
                generic: 2,
            },
        );
        let session = NativeSession {
            module: Module::new("native"),
            gvars: Vec::new(),
            fvars: vec!["f_spec_7".into(), "f_generic_7".into()],
            fvar_map,
            persistent: false,
            stats: SessionStats::default(),
        };
        let entry = session.table_indices_of(SpecializationId(7)).unwrap();
        assert_eq!(entry.specialized, 1);
        assert_eq!(entry.generic, 2);
        assert!(session.table_indices_of(SpecializationId(8)).is_none());
    }

    #[test]
    fn test_statistics_display() {
        let stats = SessionStats {
            roots_requested: 2,
            codegen_runs: 3,
            fragments_merged: 3,
            function_table_len: 4,
            specialized_entries: 1,
            ..SessionStats::default()
        };
        let output = stats.to_string();
        assert!(output.contains("Roots requested: 2"));
        assert!(output.contains("Function table: 4 entries (1 specialized)"));
        assert!(!output.contains("Deferred"));
    }
}
