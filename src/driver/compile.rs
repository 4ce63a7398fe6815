// This module is the multi-revision compilation driver. It walks the requested roots
// through the finalized pass and then the in-progress pass, reusing cached inference where
// the runtime has it and running inference otherwise, then hands each specialization to
// code generation at most once per session. Callees discovered by code generation are
// queued and drained to a fixed point after every pass; queue entries not valid at the
// current revision wait for the next pass. Successful fragments are merged into a private
// clone of the shadow module, entry points are appended to the function table in
// compilation order and function definitions are internalized and finalized for the
// target platform. Failed specializations are omitted; a merge collision or inconsistent
// table bookkeeping fails the whole session.

use super::engine::{
    CachedInference, CompileCx, CompiledUnit, InferredCode, InstanceInfo, SpecializationId,
    Toolchain, WorkQueue,
};
use super::world::{CompilePass, Revision, Revisions};
use crate::core::context::Ambient;
use crate::core::error::{AotError, AotResult};
use crate::core::session::{NativeSession, SessionStats, TableEntry};
use crate::ir::{Linkage, Module};
use crate::target::TargetConfig;
use hashbrown::{HashMap, HashSet};
use log::{debug, info, trace};

/// Name given to the session's private module.
pub const SESSION_MODULE_NAME: &str = "native_image";

struct Compiled {
    info: InstanceInfo,
    unit: CompiledUnit,
}

/// Drives one session to completion while the compilation lock is held.
pub(crate) struct NativeDriver<'a, T: ?Sized> {
    ambient: &'a mut Ambient,
    target: &'a TargetConfig,
    toolchain: &'a mut T,
    compiled: Vec<Compiled>,
    done: HashSet<SpecializationId>,
    // failed in the current pass; cleared between passes so the in-progress pass retries
    attempted: HashSet<SpecializationId>,
    seen: HashSet<SpecializationId>,
    stats: SessionStats,
}

impl<'a, T: Toolchain + ?Sized> NativeDriver<'a, T> {
    pub(crate) fn new(ambient: &'a mut Ambient, target: &'a TargetConfig, toolchain: &'a mut T) -> Self {
        Self {
            ambient,
            target,
            toolchain,
            compiled: Vec::new(),
            done: HashSet::new(),
            attempted: HashSet::new(),
            seen: HashSet::new(),
            stats: SessionStats::default(),
        }
    }

    /// Compile `roots` across both passes and build the session.
    pub(crate) fn run(mut self, roots: &[SpecializationId], revisions: Revisions) -> AotResult<NativeSession> {
        self.stats.roots_requested = roots.len();
        let mut deferred = WorkQueue::new();

        for (pass, revision) in revisions.passes() {
            debug!("{:?} pass at {} ({} deferred)", pass, revision, deferred.len());
            let mut queue = std::mem::take(&mut deferred);
            self.attempted.clear();

            for &root in roots {
                self.seen.insert(root);
                let Some(info) = self.toolchain.instance(root) else {
                    continue;
                };
                if info.validity.contains(revision) {
                    self.compile_one(info, pass, revision, &mut queue)?;
                }
            }

            // drain to a fixed point
            while let Some(id) = queue.pop() {
                self.seen.insert(id);
                if self.done.contains(&id) || self.attempted.contains(&id) {
                    continue;
                }
                let Some(info) = self.toolchain.instance(id) else {
                    continue;
                };
                if !info.validity.contains(revision) {
                    if !deferred.contains(id) {
                        trace!("{} not valid at {}, deferring", id, revision);
                        self.stats.deferred += 1;
                        deferred.push(id);
                    }
                    continue;
                }
                self.compile_one(info, pass, revision, &mut queue)?;
            }
        }

        if !deferred.is_empty() {
            debug!("{} queued specializations never became valid", deferred.len());
        }
        self.finish()
    }

    fn compile_one(
        &mut self,
        info: InstanceInfo,
        pass: CompilePass,
        revision: Revision,
        queue: &mut WorkQueue,
    ) -> AotResult<()> {
        let id = info.id;
        if self.done.contains(&id) || self.attempted.contains(&id) {
            return Ok(());
        }

        let Some(code) = self.inferred_code(&info, revision) else {
            debug!("no inferred code for {} ({}), omitting", id, info.name);
            self.attempted.insert(id);
            return Ok(());
        };

        self.stats.codegen_runs += 1;
        let mut cx = CompileCx {
            pass,
            revision,
            target: self.target,
            queue,
            ambient: &mut *self.ambient,
            fault: None,
        };
        let unit = self.toolchain.compile(id, &code, &mut cx);
        cx.take_fault()?;

        match unit {
            Some(unit) => {
                debug!(
                    "compiled {} ({}) in {:?} pass: generic `{}`{}",
                    id,
                    info.name,
                    pass,
                    unit.generic_entry,
                    if unit.specialized_entry.is_some() { ", specialized" } else { "" }
                );
                self.done.insert(id);
                self.compiled.push(Compiled { info, unit });
            }
            None => {
                debug!("code generation failed for {} ({}), omitting", id, info.name);
                self.attempted.insert(id);
            }
        }
        Ok(())
    }

    /// Cached inference when it is usable, a fresh inference run otherwise.
    fn inferred_code(&mut self, info: &InstanceInfo, revision: Revision) -> Option<InferredCode> {
        match &info.cached {
            CachedInference::Code(code) => {
                self.stats.cache_hits += 1;
                return Some(code.clone());
            }
            CachedInference::Compressed(blob) => {
                if let Some(code) = self.toolchain.uncompress(info.id, blob) {
                    self.stats.cache_hits += 1;
                    return Some(code);
                }
                trace!("cached inference for {} is malformed", info.id);
            }
            CachedInference::Nothing | CachedInference::Absent => {}
        }
        self.stats.inference_runs += 1;
        self.toolchain.infer(info.id, revision)
    }

    fn finish(mut self) -> AotResult<NativeSession> {
        let mut module = self.ambient.shadow().clone();
        module.set_name(SESSION_MODULE_NAME);

        let mut fvars: Vec<String> = Vec::new();
        let mut fvar_map: HashMap<SpecializationId, TableEntry> = HashMap::new();

        for Compiled { info, unit } in std::mem::take(&mut self.compiled) {
            module.link_in(unit.module)?;
            self.stats.fragments_merged += 1;

            let mut specialized = 0;
            if let Some(entry) = unit.specialized_entry {
                if unit.return_type == info.return_type {
                    fvars.push(entry);
                    specialized = table_index(&fvars)?;
                    self.stats.specialized_entries += 1;
                } else {
                    debug!(
                        "{}: specialized entry returns {}, inferred {}; generic only",
                        info.id, unit.return_type, info.return_type
                    );
                }
            }
            fvars.push(unit.generic_entry);
            let generic = table_index(&fvars)?;

            let entry = TableEntry {
                api: unit.api,
                specialized,
                generic,
            };
            if fvar_map.insert(info.id, entry).is_some() {
                return Err(AotError::TableInconsistency {
                    reason: format!("{} was assigned table entries twice", info.id),
                });
            }
        }

        for name in &fvars {
            if module.function(name).is_none() {
                return Err(AotError::TableInconsistency {
                    reason: format!("entry point `{name}` is not a function in the merged module"),
                });
            }
        }

        let gvars = self.ambient.registry().table().to_vec();
        for name in &gvars {
            if !module.contains(name) {
                return Err(AotError::TableInconsistency {
                    reason: format!("registered global `{name}` is missing from the session module"),
                });
            }
        }

        let persistent = self.ambient.persistence_active();
        normalize(&mut module, self.ambient, persistent);

        self.stats.omitted = self.seen.len() - self.done.len();
        self.stats.global_table_len = gvars.len();
        self.stats.function_table_len = fvars.len();
        info!(
            "session: {} specializations compiled, {} omitted",
            self.done.len(),
            self.stats.omitted
        );

        Ok(NativeSession {
            module,
            gvars,
            fvars,
            fvar_map,
            persistent,
            stats: self.stats,
        })
    }
}

fn table_index(table: &[String]) -> AotResult<u32> {
    u32::try_from(table.len()).map_err(|_| AotError::TableInconsistency {
        reason: format!("function table overflow at {} entries", table.len()),
    })
}

/// Internalize function definitions and apply the platform policy.
fn normalize(module: &mut Module, ambient: &Ambient, persistent: bool) {
    let policy = ambient.policy();
    let personality = ambient.personality();
    for value in module.values_mut().filter(|v| !v.is_declaration()) {
        if value.is_function() {
            value.set_linkage(Linkage::Internal);
        }
        if persistent {
            policy.finalize(value, personality);
        }
    }
}

/// Run the driver for `roots`; called with the compilation lock held.
pub(crate) fn create_native<T: Toolchain + ?Sized>(
    ambient: &mut Ambient,
    target: &TargetConfig,
    revisions: Revisions,
    roots: &[SpecializationId],
    toolchain: &mut T,
) -> AotResult<NativeSession> {
    NativeDriver::new(ambient, target, toolchain).run(roots, revisions)
}
