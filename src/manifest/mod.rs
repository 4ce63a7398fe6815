//! Manifest-driven runtime stand-in.
//!
//! A manifest describes the revisions, registered globals and
//! specializations of a runtime, plus the roots to compile. It lets the
//! `aotc` driver and the tests exercise the whole pipeline without a real
//! inference engine or code generator.
//!
//! # Format
//!
//! ```text
//! ; comments start with a semicolon
//! revision 5
//! inference-revision 6
//! global 0x1000 jl_global#
//! instance 1 main valid=1..* ret=Int64 api=1 calls=2 uses=0x1000 cached=code
//! instance 2 helper valid=1..10 ret=Int64 spec=Int64
//! root 1
//! ```
//!
//! `instance` attributes: `valid=MIN..MAX` (`*` for open-ended), `ret=` the
//! inferred return type, `spec=` the return type of a specialized entry,
//! `api=` the calling convention flag, `calls=` callee ids, `uses=` global
//! handles, `cached=none|code|compressed|nothing|broken`, and `infer=fail`
//! or `codegen=fail` to simulate failures.

pub mod parser;

use crate::core::error::AotResult;
use crate::core::registry::ValueHandle;
use crate::core::AotContext;
use crate::driver::{
    ApiFlag, CachedInference, CodegenEngine, CompileCx, CompiledUnit, InferenceEngine, InferredCode,
    InstanceInfo, MethodTable, Revision, Revisions, SpecializationId, TypeTag, WorldRange,
};
use crate::ir::{CodeReloc, Function, FunctionBody, GlobalVariable, IrType, Linkage, Module, RelocKind};
use hashbrown::HashMap;
use log::{debug, trace};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use target_lexicon::Architecture;
use thiserror::Error;

pub use parser::{parse_manifest, DEFAULT_GLOBAL_HINT};

const COMPRESSED_MAGIC: &[u8] = b"inferred:";
const AARCH64_RET: [u8; 4] = [0xc0, 0x03, 0x5f, 0xd6];

#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("line {line}: instance {id} is declared twice")]
    DuplicateInstance { line: usize, id: SpecializationId },

    #[error("failed to read manifest '{}': {}", .path.display(), .source)]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// How an instance's inference result is cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachedForm {
    None,
    Code,
    Compressed,
    Nothing,
    /// A compressed blob that fails to expand.
    Broken,
}

#[derive(Debug, Clone)]
pub struct GlobalDecl {
    pub handle: ValueHandle,
    pub name_hint: String,
}

#[derive(Debug, Clone)]
pub struct InstanceDecl {
    pub id: SpecializationId,
    pub name: String,
    pub validity: WorldRange,
    pub return_type: TypeTag,
    pub api: ApiFlag,
    pub specialized: Option<TypeTag>,
    pub calls: Vec<SpecializationId>,
    pub uses: Vec<ValueHandle>,
    pub cached: CachedForm,
    pub infer_fails: bool,
    pub codegen_fails: bool,
}

impl InstanceDecl {
    pub fn generic_entry(&self) -> String {
        format!("{}_generic_{}", self.name, self.id.0)
    }

    pub fn specialized_entry(&self) -> String {
        format!("{}_spec_{}", self.name, self.id.0)
    }
}

#[derive(Debug, Clone)]
pub struct Manifest {
    pub revisions: Revisions,
    pub globals: Vec<GlobalDecl>,
    pub instances: Vec<InstanceDecl>,
    pub roots: Vec<SpecializationId>,
}

impl Manifest {
    pub fn parse(text: &str) -> Result<Self, ManifestError> {
        parse_manifest(text)
    }

    pub fn from_path(path: &Path) -> Result<Self, ManifestError> {
        let text = std::fs::read_to_string(path).map_err(|source| ManifestError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }

    pub fn into_runtime(self) -> ManifestRuntime {
        ManifestRuntime::new(self)
    }
}

/// Runtime stand-in implementing the driver's collaborator traits.
#[derive(Debug)]
pub struct ManifestRuntime {
    manifest: Manifest,
    instances: HashMap<SpecializationId, usize>,
    hints: HashMap<ValueHandle, String>,
    inference_calls: HashMap<SpecializationId, usize>,
    codegen_calls: HashMap<SpecializationId, usize>,
}

impl ManifestRuntime {
    pub fn new(manifest: Manifest) -> Self {
        let instances = manifest
            .instances
            .iter()
            .enumerate()
            .map(|(i, decl)| (decl.id, i))
            .collect();
        let hints = manifest
            .globals
            .iter()
            .map(|g| (g.handle, g.name_hint.clone()))
            .collect();
        Self {
            manifest,
            instances,
            hints,
            inference_calls: HashMap::new(),
            codegen_calls: HashMap::new(),
        }
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn roots(&self) -> &[SpecializationId] {
        &self.manifest.roots
    }

    pub fn revisions(&self) -> Revisions {
        self.manifest.revisions
    }

    pub fn decl(&self, id: SpecializationId) -> Option<&InstanceDecl> {
        self.instances.get(&id).map(|&i| &self.manifest.instances[i])
    }

    /// Register every declared global, as earlier JIT activity would have.
    pub fn register_globals(&self, ctx: &AotContext) -> AotResult<()> {
        for global in &self.manifest.globals {
            ctx.intern_global(global.handle, &global.name_hint, IrType::Ptr)?;
        }
        Ok(())
    }

    pub fn inference_calls(&self, id: SpecializationId) -> usize {
        self.inference_calls.get(&id).copied().unwrap_or(0)
    }

    pub fn codegen_calls(&self, id: SpecializationId) -> usize {
        self.codegen_calls.get(&id).copied().unwrap_or(0)
    }

    fn inferred(decl: &InstanceDecl) -> InferredCode {
        InferredCode {
            return_type: decl.return_type.clone(),
            body: Arc::from(decl.name.as_bytes()),
        }
    }

    fn hint(&self, handle: ValueHandle) -> &str {
        self.hints
            .get(&handle)
            .map(String::as_str)
            .unwrap_or(DEFAULT_GLOBAL_HINT)
    }
}

impl MethodTable for ManifestRuntime {
    fn instance(&self, id: SpecializationId) -> Option<InstanceInfo> {
        let decl = self.decl(id)?;
        let cached = match decl.cached {
            CachedForm::None => CachedInference::Absent,
            CachedForm::Nothing => CachedInference::Nothing,
            CachedForm::Code => CachedInference::Code(Self::inferred(decl)),
            CachedForm::Compressed => {
                let mut blob = COMPRESSED_MAGIC.to_vec();
                blob.extend_from_slice(decl.return_type.as_str().as_bytes());
                CachedInference::Compressed(Arc::from(blob))
            }
            CachedForm::Broken => CachedInference::Compressed(Arc::from(&b"\xff\xfe"[..])),
        };
        Some(InstanceInfo {
            id,
            name: decl.name.clone(),
            validity: decl.validity,
            return_type: decl.return_type.clone(),
            cached,
        })
    }
}

impl InferenceEngine for ManifestRuntime {
    fn uncompress(&mut self, id: SpecializationId, blob: &[u8]) -> Option<InferredCode> {
        let ty = blob.strip_prefix(COMPRESSED_MAGIC)?;
        let ty = std::str::from_utf8(ty).ok()?;
        let decl = self.decl(id)?;
        Some(InferredCode {
            return_type: TypeTag::new(ty),
            body: Arc::from(decl.name.as_bytes()),
        })
    }

    fn infer(&mut self, id: SpecializationId, revision: Revision) -> Option<InferredCode> {
        *self.inference_calls.entry(id).or_default() += 1;
        let decl = self.decl(id)?;
        trace!("inferring {} at {}", decl.name, revision);
        if decl.infer_fails {
            return None;
        }
        Some(Self::inferred(decl))
    }
}

impl CodegenEngine for ManifestRuntime {
    fn compile(
        &mut self,
        id: SpecializationId,
        code: &InferredCode,
        cx: &mut CompileCx<'_>,
    ) -> Option<CompiledUnit> {
        *self.codegen_calls.entry(id).or_default() += 1;
        let decl = self.decl(id)?.clone();
        for &callee in &decl.calls {
            cx.enqueue(callee);
        }
        if decl.codegen_fails {
            debug!("codegen for {} fails by request", decl.name);
            return None;
        }

        let x86 = matches!(
            cx.target().triple.architecture,
            Architecture::X86_64 | Architecture::X86_32(_)
        );
        let mut module = Module::new(format!("{}_{}", decl.name, id.0));
        let mut body = FunctionBody::default();

        for &callee in &decl.calls {
            let Some(target) = self.decl(callee).map(InstanceDecl::generic_entry) else {
                continue;
            };
            // a recursive call targets the definition added below
            if callee != id && !module.contains(&target) {
                module.add_function(Function::declaration(target.as_str())).ok()?;
            }
            if x86 {
                // call rel32
                body.relocs.push(CodeReloc {
                    offset: body.code.len() as u32 + 1,
                    target,
                    kind: RelocKind::PcRel32,
                    addend: -4,
                });
                body.code.extend_from_slice(&[0xe8, 0, 0, 0, 0]);
            }
        }

        for &handle in &decl.uses {
            let hint = self.hint(handle).to_string();
            let symbol = cx.intern_global(handle, &hint, IrType::Ptr)?;
            if !module.contains(&symbol.name) {
                module
                    .add_global(GlobalVariable::declaration(symbol.name.as_str(), IrType::Ptr))
                    .ok()?;
            }
            if x86 {
                // mov rax, [rip + rel32]
                body.relocs.push(CodeReloc {
                    offset: body.code.len() as u32 + 3,
                    target: symbol.name,
                    kind: RelocKind::PcRel32,
                    addend: -4,
                });
                body.code.extend_from_slice(&[0x48, 0x8b, 0x05, 0, 0, 0, 0]);
            }
        }
        body.code.extend_from_slice(&ret_sequence(cx.target().triple.architecture));

        let generic_entry = decl.generic_entry();
        let specialized_entry = match &decl.specialized {
            Some(_) => {
                let name = decl.specialized_entry();
                let stub = FunctionBody {
                    code: ret_sequence(cx.target().triple.architecture),
                    relocs: Vec::new(),
                };
                module
                    .add_function(Function::definition(name.as_str(), Linkage::External, stub))
                    .ok()?;
                Some(name)
            }
            None => None,
        };
        module
            .add_function(Function::definition(generic_entry.as_str(), Linkage::External, body))
            .ok()?;

        Some(CompiledUnit {
            module,
            generic_entry,
            specialized_entry,
            return_type: decl.specialized.clone().unwrap_or_else(|| code.return_type.clone()),
            api: decl.api,
        })
    }
}

fn ret_sequence(arch: Architecture) -> Vec<u8> {
    match arch {
        Architecture::X86_64 | Architecture::X86_32(_) => vec![0xc3],
        Architecture::Aarch64(_) => AARCH64_RET.to_vec(),
        _ => Vec::new(),
    }
}
