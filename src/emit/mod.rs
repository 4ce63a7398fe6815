// This module turns a finished session into files. It derives the artifact target
// machine from the ambient target (native object container, small code model), opens each
// requested destination independently, and assembles a pass pipeline: verifier first, an
// IR writer for the unoptimized form, the optimization passes when optimized IR or an
// object is wanted, a second IR writer, and the object writer last. When the session
// claimed the persistence latch, the offset tables, symbol counter, runtime handle pointer
// and payload are embedded before the pipeline runs. A destination that cannot be opened
// or a target without object support is reported and skipped; the other outputs proceed.

//! Native artifact emission.

pub mod object;
pub mod pipeline;
pub mod tables;

use crate::core::context::AotConfig;
use crate::core::error::{AotResult, EmitDiagnostic};
use crate::core::session::NativeSession;
use crate::target::{policy_for, TargetMachine};
use log::{error, info, warn};
use pipeline::{add_optimization_passes, IrWriterPass, ObjectEmitPass, PassManager, VerifierPass};
use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};
use tables::{emit_global_data, GlobalData};

/// Requested outputs of one emission.
#[derive(Debug, Clone, Default)]
pub struct EmitOptions {
    pub unoptimized_ir: Option<PathBuf>,
    pub optimized_ir: Option<PathBuf>,
    pub object: Option<PathBuf>,
    /// Serialized runtime image to embed next to the tables.
    pub payload: Option<Vec<u8>>,
}

impl EmitOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_unoptimized_ir(mut self, path: impl Into<PathBuf>) -> Self {
        self.unoptimized_ir = Some(path.into());
        self
    }

    pub fn with_optimized_ir(mut self, path: impl Into<PathBuf>) -> Self {
        self.optimized_ir = Some(path.into());
        self
    }

    pub fn with_object(mut self, path: impl Into<PathBuf>) -> Self {
        self.object = Some(path.into());
        self
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = Some(payload);
        self
    }

    fn needs_optimization(&self) -> bool {
        self.optimized_ir.is_some() || self.object.is_some()
    }
}

/// Kinds of output, in pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum OutputKind {
    UnoptimizedIr,
    OptimizedIr,
    Object,
}

impl fmt::Display for OutputKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OutputKind::UnoptimizedIr => "unoptimized IR",
            OutputKind::OptimizedIr => "optimized IR",
            OutputKind::Object => "object",
        })
    }
}

#[derive(Debug)]
pub enum OutputStatus {
    Written,
    Skipped(EmitDiagnostic),
}

#[derive(Debug)]
pub struct OutputReport {
    pub kind: OutputKind,
    pub path: PathBuf,
    pub status: OutputStatus,
}

impl OutputReport {
    fn skipped(kind: OutputKind, path: &Path, diagnostic: EmitDiagnostic) -> Self {
        error!("{}", diagnostic);
        Self {
            kind,
            path: path.to_path_buf(),
            status: OutputStatus::Skipped(diagnostic),
        }
    }

    pub fn is_written(&self) -> bool {
        matches!(self.status, OutputStatus::Written)
    }

    pub fn diagnostic(&self) -> Option<&EmitDiagnostic> {
        match &self.status {
            OutputStatus::Written => None,
            OutputStatus::Skipped(diag) => Some(diag),
        }
    }
}

/// What happened to the offset tables in one emission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistenceOutcome {
    /// The session was not created for a persisted image.
    NotRequested,
    /// Tables were embedded; later emissions will not embed them again.
    Embedded,
    /// A previous emission already embedded the tables.
    AlreadyConsumed,
}

#[derive(Debug)]
pub struct EmitReport {
    /// One entry per requested destination, in pipeline order.
    pub outputs: Vec<OutputReport>,
    pub persistence: PersistenceOutcome,
}

impl EmitReport {
    pub fn output(&self, kind: OutputKind) -> Option<&OutputReport> {
        self.outputs.iter().find(|o| o.kind == kind)
    }

    pub fn all_written(&self) -> bool {
        self.outputs.iter().all(OutputReport::is_written)
    }

    pub fn diagnostics(&self) -> impl Iterator<Item = &EmitDiagnostic> {
        self.outputs.iter().filter_map(OutputReport::diagnostic)
    }
}

fn open_output(kind: OutputKind, path: &Path) -> Result<File, OutputReport> {
    File::create(path).map_err(|source| {
        OutputReport::skipped(
            kind,
            path,
            EmitDiagnostic::OpenOutput {
                kind,
                path: path.to_path_buf(),
                source,
            },
        )
    })
}

/// Run the emission pipeline over `session`, consuming it.
///
/// `embed` is true when this call owns the persistence latch.
pub(crate) fn emit_native(
    config: &AotConfig,
    session: NativeSession,
    options: &EmitOptions,
    embed: bool,
    high_water: u64,
) -> AotResult<EmitReport> {
    let target = TargetMachine::for_native_artifact(&config.target);
    let policy = policy_for(target.triple());
    let mut outputs = Vec::new();

    let mut pm = PassManager::new();
    pm.add(VerifierPass);
    if let Some(path) = &options.unoptimized_ir {
        match open_output(OutputKind::UnoptimizedIr, path) {
            Ok(file) => pm.add(IrWriterPass::new(OutputKind::UnoptimizedIr, path.clone(), file)),
            Err(report) => outputs.push(report),
        }
    }
    if options.needs_optimization() {
        add_optimization_passes(&mut pm, target.opt_level());
    }
    if let Some(path) = &options.optimized_ir {
        match open_output(OutputKind::OptimizedIr, path) {
            Ok(file) => pm.add(IrWriterPass::new(OutputKind::OptimizedIr, path.clone(), file)),
            Err(report) => outputs.push(report),
        }
    }
    if let Some(path) = &options.object {
        if !target.supports_object_emission() {
            outputs.push(OutputReport::skipped(
                OutputKind::Object,
                path,
                EmitDiagnostic::UnsupportedTarget {
                    triple: target.triple().to_string(),
                },
            ));
        } else {
            match open_output(OutputKind::Object, path) {
                Ok(file) => pm.add(ObjectEmitPass::new(path.clone(), file)),
                Err(report) => outputs.push(report),
            }
        }
    }

    let NativeSession {
        mut module,
        gvars,
        fvars,
        persistent,
        ..
    } = session;
    module.set_triple(target.triple().to_string());
    module.set_data_layout(target.data_layout());

    let persistence = if embed {
        let personality = policy
            .requires_explicit_personality()
            .then_some(config.personality_symbol.as_str());
        let data = GlobalData {
            gvars: &gvars,
            fvars: &fvars,
            high_water,
            runtime_handle: &config.runtime_handle_symbol,
            payload: options.payload.as_deref(),
            pointer_bytes: target.pointer_bytes(),
        };
        emit_global_data(&mut module, &data, policy, personality)?;
        PersistenceOutcome::Embedded
    } else if persistent {
        warn!("offset tables were already embedded by an earlier emission; skipping them");
        PersistenceOutcome::AlreadyConsumed
    } else {
        PersistenceOutcome::NotRequested
    };
    if options.payload.is_some() && !embed {
        warn!("image payload ignored: offset tables are not being embedded");
    }

    outputs.extend(pm.run(&mut module, &target)?);
    outputs.sort_by_key(|o| o.kind);

    info!(
        "emitted `{}` for {}: {} of {} outputs written, tables {:?}",
        module.name(),
        target,
        outputs.iter().filter(|o| o.is_written()).count(),
        outputs.len(),
        persistence
    );
    Ok(EmitReport { outputs, persistence })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_output_kind_order_and_names() {
        assert!(OutputKind::UnoptimizedIr < OutputKind::OptimizedIr);
        assert!(OutputKind::OptimizedIr < OutputKind::Object);
        assert_eq!(OutputKind::OptimizedIr.to_string(), "optimized IR");
    }

    #[test]
    fn test_report_queries() {
        let report = EmitReport {
            outputs: vec![
                OutputReport {
                    kind: OutputKind::OptimizedIr,
                    path: PathBuf::from("a.ir"),
                    status: OutputStatus::Written,
                },
                OutputReport {
                    kind: OutputKind::Object,
                    path: PathBuf::from("/nope/a.o"),
                    status: OutputStatus::Skipped(EmitDiagnostic::OpenOutput {
                        kind: OutputKind::Object,
                        path: PathBuf::from("/nope/a.o"),
                        source: io::Error::from(io::ErrorKind::NotFound),
                    }),
                },
            ],
            persistence: PersistenceOutcome::NotRequested,
        };
        assert!(!report.all_written());
        assert!(report.output(OutputKind::OptimizedIr).unwrap().is_written());
        assert!(report.output(OutputKind::UnoptimizedIr).is_none());
        assert_eq!(report.diagnostics().count(), 1);
    }

    #[test]
    fn test_options_builder() {
        let options = EmitOptions::new().with_object("out.o").with_payload(vec![1, 2]);
        assert!(options.needs_optimization());
        assert_eq!(options.payload.as_deref(), Some(&[1u8, 2][..]));
        assert!(!EmitOptions::new().with_unoptimized_ir("u.ir").needs_optimization());
    }
}
