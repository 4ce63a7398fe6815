// This module describes the compilation target. TargetConfig is the ambient target the
// runtime compiles for in-process (which may force ELF output for the in-memory loader).
// TargetMachine is derived from it once per emission: it forces the operating system's
// native object container, selects the small code model so offsets between table entries
// fit a signed 32-bit range, picks position independent relocation on Linux and FreeBSD,
// and computes the data layout string stamped onto the emitted module. The platform
// submodule holds the per-format symbol policies.

//! Target description for native image emission.

pub mod platform;

pub use platform::{policy_for, CoffPolicy, ElfPolicy, MachOPolicy, SymbolPolicy};

use std::fmt;
use target_lexicon::{
    Architecture, BinaryFormat, Endianness, OperatingSystem, PointerWidth, Triple,
};

/// Optimization level for the module pass pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum OptLevel {
    O0,
    O1,
    #[default]
    O2,
    O3,
}

impl OptLevel {
    pub fn from_level(level: u8) -> Self {
        match level {
            0 => OptLevel::O0,
            1 => OptLevel::O1,
            2 => OptLevel::O2,
            _ => OptLevel::O3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeModel {
    Small,
    Large,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocModel {
    Default,
    Pic,
}

/// Backend code generation effort.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodegenLevel {
    None,
    Default,
    Aggressive,
}

/// The ambient compilation target.
#[derive(Debug, Clone)]
pub struct TargetConfig {
    pub triple: Triple,
    pub cpu: String,
    pub features: String,
    pub opt_level: OptLevel,
    /// The in-process loader wants ELF regardless of the host format.
    pub force_elf: bool,
}

impl TargetConfig {
    pub fn new(triple: Triple) -> Self {
        Self {
            triple,
            cpu: "generic".to_string(),
            features: String::new(),
            opt_level: OptLevel::default(),
            force_elf: false,
        }
    }

    pub fn host() -> Self {
        Self::new(Triple::host())
    }

    /// Triple used for in-process code, honouring `force_elf`.
    pub fn jit_triple(&self) -> Triple {
        let mut triple = self.triple.clone();
        if self.force_elf {
            triple.binary_format = BinaryFormat::Elf;
        }
        triple
    }
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self::host()
    }
}

/// Target machine used to emit a persisted artifact.
#[derive(Debug, Clone)]
pub struct TargetMachine {
    triple: Triple,
    cpu: String,
    features: String,
    code_model: CodeModel,
    reloc_model: RelocModel,
    codegen_level: CodegenLevel,
    opt_level: OptLevel,
    data_layout: String,
}

impl TargetMachine {
    /// Derive the artifact target machine from the ambient target.
    pub fn for_native_artifact(config: &TargetConfig) -> Self {
        let mut triple = config.triple.clone();
        triple.binary_format = native_binary_format(&triple.operating_system);

        let reloc_model = match triple.operating_system {
            OperatingSystem::Linux | OperatingSystem::Freebsd => RelocModel::Pic,
            _ => RelocModel::Default,
        };
        let data_layout = data_layout_for(&triple);

        Self {
            triple,
            cpu: config.cpu.clone(),
            features: config.features.clone(),
            code_model: CodeModel::Small,
            reloc_model,
            codegen_level: CodegenLevel::Aggressive,
            opt_level: config.opt_level,
            data_layout,
        }
    }

    pub fn triple(&self) -> &Triple {
        &self.triple
    }

    pub fn cpu(&self) -> &str {
        &self.cpu
    }

    pub fn features(&self) -> &str {
        &self.features
    }

    pub fn code_model(&self) -> CodeModel {
        self.code_model
    }

    pub fn reloc_model(&self) -> RelocModel {
        self.reloc_model
    }

    pub fn codegen_level(&self) -> CodegenLevel {
        self.codegen_level
    }

    pub fn opt_level(&self) -> OptLevel {
        self.opt_level
    }

    pub fn data_layout(&self) -> &str {
        &self.data_layout
    }

    pub fn pointer_bytes(&self) -> u8 {
        pointer_bytes(&self.triple)
    }

    pub fn is_little_endian(&self) -> bool {
        !matches!(self.triple.endianness(), Ok(Endianness::Big))
    }

    pub fn binary_format(&self) -> BinaryFormat {
        self.triple.binary_format
    }

    /// Architecture as understood by the object writer, if supported.
    pub fn object_architecture(&self) -> Option<object::Architecture> {
        let arch = match self.triple.architecture {
            Architecture::X86_64 => object::Architecture::X86_64,
            Architecture::X86_32(_) => object::Architecture::I386,
            Architecture::Aarch64(_) => object::Architecture::Aarch64,
            Architecture::Arm(_) => object::Architecture::Arm,
            Architecture::Riscv64(_) => object::Architecture::Riscv64,
            Architecture::Powerpc64le | Architecture::Powerpc64 => object::Architecture::PowerPc64,
            _ => return None,
        };
        Some(arch)
    }

    pub fn object_format(&self) -> Option<object::BinaryFormat> {
        match self.triple.binary_format {
            BinaryFormat::Elf => Some(object::BinaryFormat::Elf),
            BinaryFormat::Coff => Some(object::BinaryFormat::Coff),
            BinaryFormat::Macho => Some(object::BinaryFormat::MachO),
            _ => None,
        }
    }

    /// Whether this target can produce a native object file at all.
    pub fn supports_object_emission(&self) -> bool {
        let (Some(arch), Some(format)) = (self.object_architecture(), self.object_format()) else {
            return false;
        };
        match format {
            // The COFF writer only knows the x86 and Arm families.
            object::BinaryFormat::Coff => matches!(
                arch,
                object::Architecture::X86_64
                    | object::Architecture::I386
                    | object::Architecture::Aarch64
                    | object::Architecture::Arm
            ),
            object::BinaryFormat::MachO => matches!(
                arch,
                object::Architecture::X86_64 | object::Architecture::Aarch64
            ),
            _ => true,
        }
    }
}

impl fmt::Display for TargetMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (cpu {}, {:?} code model, {:?} relocation)",
            self.triple, self.cpu, self.code_model, self.reloc_model
        )
    }
}

/// The object container a platform's own toolchain expects.
pub fn native_binary_format(os: &OperatingSystem) -> BinaryFormat {
    match os {
        OperatingSystem::Windows => BinaryFormat::Coff,
        OperatingSystem::Darwin | OperatingSystem::MacOSX { .. } | OperatingSystem::Ios => {
            BinaryFormat::Macho
        }
        _ => BinaryFormat::Elf,
    }
}

pub fn pointer_bytes(triple: &Triple) -> u8 {
    match triple.pointer_width() {
        Ok(PointerWidth::U16) => 2,
        Ok(PointerWidth::U32) => 4,
        _ => 8,
    }
}

/// Data layout string with the runtime's non-integral address spaces.
fn data_layout_for(triple: &Triple) -> String {
    let endian = match triple.endianness() {
        Ok(Endianness::Big) => "E",
        _ => "e",
    };
    let mangling = match (triple.binary_format, &triple.architecture) {
        (BinaryFormat::Macho, _) => "o",
        (BinaryFormat::Coff, Architecture::X86_32(_)) => "x",
        (BinaryFormat::Coff, _) => "w",
        _ => "e",
    };
    let bits = u32::from(pointer_bytes(triple)) * 8;
    format!("{endian}-m:{mangling}-p:{bits}:{bits}-i64:64-n8:16:32:64-S128-ni:10:11:12")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn config(triple: &str) -> TargetConfig {
        TargetConfig::new(Triple::from_str(triple).unwrap())
    }

    #[test]
    fn test_linux_target_machine() {
        let tm = TargetMachine::for_native_artifact(&config("x86_64-unknown-linux-gnu"));
        assert_eq!(tm.binary_format(), BinaryFormat::Elf);
        assert_eq!(tm.code_model(), CodeModel::Small);
        assert_eq!(tm.reloc_model(), RelocModel::Pic);
        assert_eq!(tm.pointer_bytes(), 8);
        assert!(tm.data_layout().ends_with("-ni:10:11:12"));
        assert!(tm.data_layout().starts_with("e-m:e-p:64:64"));
        assert!(tm.supports_object_emission());
    }

    #[test]
    fn test_forced_elf_is_overridden() {
        let mut cfg = config("x86_64-pc-windows-msvc");
        cfg.force_elf = true;
        assert_eq!(cfg.jit_triple().binary_format, BinaryFormat::Elf);

        let tm = TargetMachine::for_native_artifact(&cfg);
        assert_eq!(tm.binary_format(), BinaryFormat::Coff);
        assert_eq!(tm.reloc_model(), RelocModel::Default);
        assert!(tm.data_layout().contains("m:w"));
    }

    #[test]
    fn test_darwin_uses_macho() {
        let tm = TargetMachine::for_native_artifact(&config("aarch64-apple-darwin"));
        assert_eq!(tm.binary_format(), BinaryFormat::Macho);
        assert_eq!(tm.object_architecture(), Some(object::Architecture::Aarch64));
    }

    #[test]
    fn test_unsupported_architecture() {
        let tm = TargetMachine::for_native_artifact(&config("wasm32-unknown-unknown"));
        assert!(!tm.supports_object_emission());
    }

    #[test]
    fn test_opt_level_from_number() {
        assert_eq!(OptLevel::from_level(0), OptLevel::O0);
        assert_eq!(OptLevel::from_level(9), OptLevel::O3);
        assert!(OptLevel::O1 < OptLevel::O2);
    }
}
