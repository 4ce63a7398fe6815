//! Module pass pipeline run once per emission.
//!
//! Passes run in insertion order over the session module. Writer passes
//! report their outcome as an [`OutputReport`]; a failed write is a soft
//! diagnostic and the remaining passes still run. Any `Err` returned by a
//! pass is an invariant violation and stops the pipeline.

use super::object::write_object;
use super::{OutputKind, OutputReport, OutputStatus};
use crate::core::error::{AotError, AotResult, EmitDiagnostic};
use crate::ir::writer::write_module;
use crate::ir::{Linkage, Module};
use crate::target::{OptLevel, TargetMachine};
use hashbrown::HashSet;
use log::{debug, error, trace};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

pub trait ModulePass {
    fn name(&self) -> &'static str;

    /// Run over `module`. Passes that produce an output return its report.
    fn run(&mut self, module: &mut Module, target: &TargetMachine) -> AotResult<Option<OutputReport>>;
}

#[derive(Default)]
pub struct PassManager {
    passes: Vec<Box<dyn ModulePass>>,
}

impl PassManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, pass: impl ModulePass + 'static) {
        self.passes.push(Box::new(pass));
    }

    pub fn len(&self) -> usize {
        self.passes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.passes.is_empty()
    }

    pub fn pass_names(&self) -> Vec<&'static str> {
        self.passes.iter().map(|p| p.name()).collect()
    }

    pub fn run(&mut self, module: &mut Module, target: &TargetMachine) -> AotResult<Vec<OutputReport>> {
        let mut reports = Vec::new();
        for pass in &mut self.passes {
            trace!("running {} over `{}`", pass.name(), module.name());
            if let Some(report) = pass.run(module, target)? {
                reports.push(report);
            }
        }
        Ok(reports)
    }
}

fn skipped(diagnostic: EmitDiagnostic) -> OutputStatus {
    error!("{}", diagnostic);
    OutputStatus::Skipped(diagnostic)
}

/// Add the optimization passes for `level`.
pub fn add_optimization_passes(pm: &mut PassManager, level: OptLevel) {
    if level >= OptLevel::O2 {
        pm.add(GlobalDce);
    }
    if level >= OptLevel::O1 {
        pm.add(StripDeadDeclarations);
    }
}

/// Writes the textual IR of the module to a file.
pub struct IrWriterPass {
    kind: OutputKind,
    path: PathBuf,
    out: BufWriter<File>,
}

impl IrWriterPass {
    pub fn new(kind: OutputKind, path: PathBuf, file: File) -> Self {
        Self {
            kind,
            path,
            out: BufWriter::new(file),
        }
    }
}

impl ModulePass for IrWriterPass {
    fn name(&self) -> &'static str {
        "ir-writer"
    }

    fn run(&mut self, module: &mut Module, _target: &TargetMachine) -> AotResult<Option<OutputReport>> {
        let result = write_module(module, &mut self.out).and_then(|()| self.out.flush());
        let status = match result {
            Ok(()) => OutputStatus::Written,
            Err(source) => skipped(EmitDiagnostic::WriteOutput {
                kind: self.kind,
                path: self.path.clone(),
                source,
            }),
        };
        Ok(Some(OutputReport {
            kind: self.kind,
            path: self.path.clone(),
            status,
        }))
    }
}

/// Rejects structurally broken modules before anything is written.
pub struct VerifierPass;

impl ModulePass for VerifierPass {
    fn name(&self) -> &'static str {
        "verify"
    }

    fn run(&mut self, module: &mut Module, _target: &TargetMachine) -> AotResult<Option<OutputReport>> {
        module.verify().map_err(AotError::Verification)?;
        Ok(None)
    }
}

/// Removes declarations nothing refers to.
pub struct StripDeadDeclarations;

impl ModulePass for StripDeadDeclarations {
    fn name(&self) -> &'static str {
        "strip-dead-declarations"
    }

    fn run(&mut self, module: &mut Module, _target: &TargetMachine) -> AotResult<Option<OutputReport>> {
        let referenced: HashSet<String> = module
            .values()
            .flat_map(|v| v.references())
            .map(str::to_string)
            .collect();
        let removed = module.retain(|v| !v.is_declaration() || referenced.contains(v.name()));
        if removed > 0 {
            debug!("stripped {} unused declarations", removed);
        }
        Ok(None)
    }
}

/// Removes internal definitions unreachable from externally visible ones.
pub struct GlobalDce;

impl ModulePass for GlobalDce {
    fn name(&self) -> &'static str {
        "globaldce"
    }

    fn run(&mut self, module: &mut Module, _target: &TargetMachine) -> AotResult<Option<OutputReport>> {
        let mut live: HashSet<String> = HashSet::new();
        let mut worklist: Vec<String> = module
            .values()
            .filter(|v| !v.is_declaration() && v.linkage() == Linkage::External)
            .map(|v| v.name().to_string())
            .collect();

        while let Some(name) = worklist.pop() {
            if !live.insert(name.clone()) {
                continue;
            }
            if let Some(value) = module.named_value(&name) {
                worklist.extend(
                    value
                        .references()
                        .into_iter()
                        .filter(|r| !live.contains(*r))
                        .map(str::to_string),
                );
            }
        }

        let removed = module.retain(|v| v.is_declaration() || live.contains(v.name()));
        if removed > 0 {
            debug!("globaldce removed {} unreachable definitions", removed);
        }
        Ok(None)
    }
}

/// Lowers the module to a native object file.
pub struct ObjectEmitPass {
    path: PathBuf,
    file: File,
}

impl ObjectEmitPass {
    pub fn new(path: PathBuf, file: File) -> Self {
        Self { path, file }
    }
}

impl ModulePass for ObjectEmitPass {
    fn name(&self) -> &'static str {
        "object-emit"
    }

    fn run(&mut self, module: &mut Module, target: &TargetMachine) -> AotResult<Option<OutputReport>> {
        let status = match write_object(module, target) {
            Ok(bytes) => match self.file.write_all(&bytes).and_then(|()| self.file.flush()) {
                Ok(()) => OutputStatus::Written,
                Err(source) => skipped(EmitDiagnostic::WriteOutput {
                    kind: OutputKind::Object,
                    path: self.path.clone(),
                    source,
                }),
            },
            Err(diag) => skipped(diag),
        };
        Ok(Some(OutputReport {
            kind: OutputKind::Object,
            path: self.path.clone(),
            status,
        }))
    }
}
