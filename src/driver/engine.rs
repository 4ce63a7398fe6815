// This module defines the interface between the image builder and the runtime's own
// compiler. Three collaborators are consumed: a MethodTable that describes specializations
// (validity window, declared return type, cached inference), an InferenceEngine that
// expands cached inference or runs inference for a revision, and a CodegenEngine that
// lowers one specialization into a module fragment with a generic entry point and an
// optional type-specialized entry point. Code generation receives a CompileCx giving it
// the pass revision, the target, the work queue side channel for newly discovered callees
// and access to the global value registry while the compilation lock is held.

//! Collaborator interfaces for the compilation driver.

use super::world::{CompilePass, Revision};
use crate::core::context::Ambient;
use crate::core::error::{AotError, AotResult};
use crate::core::registry::{GlobalSymbol, ValueHandle};
use crate::ir::{IrType, Module};
use crate::target::TargetConfig;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

/// Stable identity of one specialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SpecializationId(pub u64);

impl fmt::Display for SpecializationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Runtime type used to compare return types exactly.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TypeTag(Arc<str>);

impl TypeTag {
    pub fn new(name: &str) -> Self {
        Self(Arc::from(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Calling convention classification reported by code generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ApiFlag(pub u8);

/// Result of type inference, opaque to the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InferredCode {
    pub return_type: TypeTag,
    pub body: Arc<[u8]>,
}

/// What the runtime has cached for a specialization.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CachedInference {
    #[default]
    Absent,
    /// Inference ran and produced nothing usable.
    Nothing,
    /// Serialized form that must be expanded before use.
    Compressed(Arc<[u8]>),
    Code(InferredCode),
}

#[derive(Debug, Clone)]
pub struct InstanceInfo {
    pub id: SpecializationId,
    pub name: String,
    pub validity: super::world::WorldRange,
    /// Return type the runtime inferred for the specialization.
    pub return_type: TypeTag,
    pub cached: CachedInference,
}

/// Output of code generation for one specialization.
#[derive(Debug, Clone)]
pub struct CompiledUnit {
    pub module: Module,
    pub generic_entry: String,
    pub specialized_entry: Option<String>,
    /// Return type declared by the specialized entry.
    pub return_type: TypeTag,
    pub api: ApiFlag,
}

/// Callees discovered during code generation that still need compiling.
#[derive(Debug, Default)]
pub struct WorkQueue {
    items: VecDeque<SpecializationId>,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, id: SpecializationId) {
        self.items.push_back(id);
    }

    pub fn pop(&mut self) -> Option<SpecializationId> {
        self.items.pop_front()
    }

    pub fn contains(&self, id: SpecializationId) -> bool {
        self.items.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl Extend<SpecializationId> for WorkQueue {
    fn extend<T: IntoIterator<Item = SpecializationId>>(&mut self, iter: T) {
        self.items.extend(iter);
    }
}

/// Context handed to code generation for one specialization.
pub struct CompileCx<'a> {
    pub(crate) pass: CompilePass,
    pub(crate) revision: Revision,
    pub(crate) target: &'a TargetConfig,
    pub(crate) queue: &'a mut WorkQueue,
    pub(crate) ambient: &'a mut Ambient,
    pub(crate) fault: Option<AotError>,
}

impl CompileCx<'_> {
    pub fn pass(&self) -> CompilePass {
        self.pass
    }

    pub fn revision(&self) -> Revision {
        self.revision
    }

    pub fn target(&self) -> &TargetConfig {
        self.target
    }

    /// Record a callee that must be compiled in this session.
    pub fn enqueue(&mut self, callee: SpecializationId) {
        self.queue.push(callee);
    }

    /// Obtain the placeholder symbol for a runtime value.
    ///
    /// `None` means the registry rejected the value; the driver fails the
    /// session with the recorded error once code generation returns.
    pub fn intern_global(&mut self, handle: ValueHandle, name_hint: &str, ty: IrType) -> Option<GlobalSymbol> {
        match self.ambient.intern(handle, name_hint, ty) {
            Ok(symbol) => Some(symbol),
            Err(err) => {
                self.fault.get_or_insert(err);
                None
            }
        }
    }

    pub(crate) fn take_fault(&mut self) -> AotResult<()> {
        match self.fault.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

pub trait MethodTable {
    fn instance(&self, id: SpecializationId) -> Option<InstanceInfo>;
}

pub trait InferenceEngine {
    /// Expand a cached serialized inference result.
    fn uncompress(&mut self, id: SpecializationId, blob: &[u8]) -> Option<InferredCode>;

    /// Run inference for `id` at `revision`.
    fn infer(&mut self, id: SpecializationId, revision: Revision) -> Option<InferredCode>;
}

pub trait CodegenEngine {
    /// Lower one specialization. `None` means it could not be compiled and
    /// is left out of the session.
    fn compile(
        &mut self,
        id: SpecializationId,
        code: &InferredCode,
        cx: &mut CompileCx<'_>,
    ) -> Option<CompiledUnit>;
}

/// Everything the driver needs from the runtime.
pub trait Toolchain: MethodTable + InferenceEngine + CodegenEngine {}

impl<T: MethodTable + InferenceEngine + CodegenEngine> Toolchain for T {}
