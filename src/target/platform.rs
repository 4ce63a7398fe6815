//! Platform symbol finalization.
//!
//! Each object format has its own rules for merging definitions across
//! translation units and exposing them from a shared image. Those rules are
//! captured by a [`SymbolPolicy`] selected once per target, so the rest of
//! the crate never branches on the platform itself.

use crate::ir::{Comdat, ComdatSelection, DllStorage, GlobalValue};
use target_lexicon::{Architecture, BinaryFormat, Triple};

/// Capability queries for a target's symbol handling.
pub trait SymbolPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Every definition needs its own linkage group so the linker can
    /// resolve duplicates across merged units.
    fn requires_unique_symbol_sections(&self) -> bool;

    /// Functions need an explicit unwind personality to survive
    /// asynchronous interrupts.
    fn requires_explicit_personality(&self) -> bool;

    /// Externally visible definitions must be exported explicitly.
    fn exports_public_symbols(&self) -> bool;

    /// Apply the policy to one value destined for a persisted artifact.
    ///
    /// Declarations are left alone.
    fn finalize(&self, value: &mut GlobalValue, personality: Option<&str>) {
        if value.is_declaration() {
            return;
        }
        if self.requires_unique_symbol_sections() {
            let name = value.name().to_string();
            value.set_comdat(Some(Comdat {
                name,
                selection: ComdatSelection::Any,
            }));
        }
        if self.requires_explicit_personality() {
            if let (GlobalValue::Function(f), Some(personality)) = (&mut *value, personality) {
                f.personality = Some(personality.to_string());
            }
        }
        if self.exports_public_symbols() {
            let storage = if value.linkage().is_external() {
                DllStorage::Export
            } else {
                DllStorage::Default
            };
            value.set_dll_storage(storage);
        }
    }
}

/// ELF: the linker default behaviour is what we want.
#[derive(Debug, Default)]
pub struct ElfPolicy;

impl SymbolPolicy for ElfPolicy {
    fn name(&self) -> &'static str {
        "elf"
    }

    fn requires_unique_symbol_sections(&self) -> bool {
        false
    }

    fn requires_explicit_personality(&self) -> bool {
        false
    }

    fn exports_public_symbols(&self) -> bool {
        false
    }
}

#[derive(Debug, Default)]
pub struct MachOPolicy;

impl SymbolPolicy for MachOPolicy {
    fn name(&self) -> &'static str {
        "macho"
    }

    fn requires_unique_symbol_sections(&self) -> bool {
        false
    }

    fn requires_explicit_personality(&self) -> bool {
        false
    }

    fn exports_public_symbols(&self) -> bool {
        false
    }
}

/// COFF: comdat per definition, explicit exports, and on x86-64 an
/// explicit personality for table based unwinding.
#[derive(Debug, Default)]
pub struct CoffPolicy {
    pub x86_64: bool,
}

impl SymbolPolicy for CoffPolicy {
    fn name(&self) -> &'static str {
        if self.x86_64 {
            "coff-x86_64"
        } else {
            "coff"
        }
    }

    fn requires_unique_symbol_sections(&self) -> bool {
        true
    }

    fn requires_explicit_personality(&self) -> bool {
        self.x86_64
    }

    fn exports_public_symbols(&self) -> bool {
        true
    }
}

static ELF: ElfPolicy = ElfPolicy;
static MACHO: MachOPolicy = MachOPolicy;
static COFF: CoffPolicy = CoffPolicy { x86_64: false };
static COFF_X86_64: CoffPolicy = CoffPolicy { x86_64: true };

/// Select the policy for an artifact triple.
pub fn policy_for(triple: &Triple) -> &'static dyn SymbolPolicy {
    match triple.binary_format {
        BinaryFormat::Coff if triple.architecture == Architecture::X86_64 => &COFF_X86_64,
        BinaryFormat::Coff => &COFF,
        BinaryFormat::Macho => &MACHO,
        _ => &ELF,
    }
}
