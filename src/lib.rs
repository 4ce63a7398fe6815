//! aot-image - ahead-of-time native image building.
//!
//! Collects the compiled specializations of a running program into a single
//! relocatable module, assigns stable 1-based indices to every persisted
//! global and entry point, and writes the module as textual IR and as a
//! native object file whose offset tables let a loader rebind everything
//! at startup.
//!
//! # Primary Usage
//!
//! ```ignore
//! use aot_image::{AotConfig, AotContext, EmitOptions, Manifest};
//!
//! let ctx = AotContext::new(AotConfig::default())?;
//! let mut runtime = Manifest::from_path("image.manifest".as_ref())?.into_runtime();
//! runtime.register_globals(&ctx)?;
//!
//! let roots = runtime.roots().to_vec();
//! let session = ctx.create_session(&roots, runtime.revisions(), &mut runtime)?;
//! let report = ctx.emit_artifact(session, &EmitOptions::new().with_object("image.o"))?;
//! ```
//!
//! # Architecture
//!
//! - [`core`] - context, global registry, sessions and errors
//! - [`driver`] - multi-revision compilation of specialization roots
//! - [`emit`] - offset tables, pass pipeline and object writing
//! - [`ir`] - the symbol-level module representation
//! - [`target`] - target machines and per-format symbol policies
//! - [`manifest`] - a file-driven runtime for the `aotc` driver and tests

pub mod core;
pub mod driver;
pub mod emit;
pub mod ir;
pub mod manifest;
pub mod target;

pub use crate::core::{
    AotConfig, AotContext, AotError, AotResult, EmitDiagnostic, GlobalSymbol, NativeSession,
    SessionStats, TableEntry, ValueHandle,
};
pub use crate::driver::{
    ApiFlag, CompileCx, CompiledUnit, InferredCode, InstanceInfo, Revision, Revisions,
    SpecializationId, Toolchain, TypeTag, WorldRange,
};
pub use crate::emit::{EmitOptions, EmitReport, OutputKind, OutputStatus, PersistenceOutcome};
pub use crate::manifest::{Manifest, ManifestError, ManifestRuntime};
pub use crate::target::{OptLevel, TargetConfig};
