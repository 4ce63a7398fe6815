// This module lowers a finished module into a relocatable object file with the object
// crate's writer. Every global value becomes a symbol; function bodies land in the text
// section and variables in data, read-only data or bss depending on constness and
// initializer. Code relocations become PC relative or absolute object relocations, and
// initializers taking a symbol address become pointer sized absolute relocations, which is
// how the offset tables end up as arrays of addresses. On COFF, definitions carrying a
// comdat get their own subsection and a comdat of that selection, exported definitions get
// dynamic scope, and x86-64 functions with a personality routine get .xdata/.pdata unwind
// entries naming it. Problems are reported as soft emission diagnostics.

//! Native object writer.

use crate::core::error::EmitDiagnostic;
use crate::ir::{
    ComdatSelection, DllStorage, Function, GlobalValue, GlobalVariable, Initializer, IrType,
    Linkage, Module, RelocKind,
};
use crate::target::TargetMachine;
use hashbrown::HashMap;
use log::{debug, trace};
use object::write::{Comdat, Object, Relocation, SectionId, StandardSection, Symbol, SymbolId, SymbolSection};
use object::{
    BinaryFormat, ComdatKind, Endianness, RelocationEncoding, RelocationFlags, RelocationKind,
    SectionKind, SymbolFlags, SymbolKind, SymbolScope,
};

/// UNWIND_INFO version 1 with an exception handler and no unwind codes.
const UNWIND_INFO_EHANDLER: [u8; 4] = [0x09, 0x00, 0x00, 0x00];

const FUNCTION_ALIGN: u64 = 16;

/// Serialize `module` into an object file for `target`.
pub fn write_object(module: &Module, target: &TargetMachine) -> Result<Vec<u8>, EmitDiagnostic> {
    let (Some(format), Some(arch)) = (target.object_format(), target.object_architecture()) else {
        return Err(EmitDiagnostic::UnsupportedTarget {
            triple: target.triple().to_string(),
        });
    };
    if !target.supports_object_emission() {
        return Err(EmitDiagnostic::UnsupportedTarget {
            triple: target.triple().to_string(),
        });
    }
    let endian = if target.is_little_endian() {
        Endianness::Little
    } else {
        Endianness::Big
    };

    let mut writer = ObjectWriter {
        obj: Object::new(format, arch, endian),
        target,
        endian,
        symbols: HashMap::new(),
        unwind: Vec::new(),
    };
    writer.declare_symbols(module);
    for value in module.values() {
        match value {
            GlobalValue::Function(f) if !f.is_declaration() => writer.define_function(f)?,
            GlobalValue::Variable(v) if !v.is_declaration() => writer.define_variable(v)?,
            _ => {}
        }
    }
    writer.write_unwind_info()?;

    let bytes = writer.obj.write().map_err(|err| writer.error(err))?;
    debug!(
        "wrote {} byte {:?} object for `{}` ({} symbols)",
        bytes.len(),
        format,
        module.name(),
        writer.symbols.len()
    );
    Ok(bytes)
}

struct UnwindEntry {
    function: SymbolId,
    size: u64,
    personality: SymbolId,
}

struct ObjectWriter<'a> {
    obj: Object<'static>,
    target: &'a TargetMachine,
    endian: Endianness,
    symbols: HashMap<String, SymbolId>,
    unwind: Vec<UnwindEntry>,
}

impl ObjectWriter<'_> {
    fn error(&self, reason: impl ToString) -> EmitDiagnostic {
        EmitDiagnostic::ObjectWrite {
            triple: self.target.triple().to_string(),
            reason: reason.to_string(),
        }
    }

    fn is_coff(&self) -> bool {
        self.obj.format() == BinaryFormat::Coff
    }

    fn pointer_bytes(&self) -> u8 {
        self.target.pointer_bytes()
    }

    /// Create every symbol up front so relocations can refer forward.
    fn declare_symbols(&mut self, module: &Module) {
        for value in module.values() {
            let kind = if value.is_function() {
                SymbolKind::Text
            } else {
                SymbolKind::Data
            };
            let scope = match (value.is_declaration(), value.linkage(), value.dll_storage()) {
                (true, _, _) => SymbolScope::Linkage,
                (false, Linkage::Internal, _) => SymbolScope::Compilation,
                (false, Linkage::External, DllStorage::Export) => SymbolScope::Dynamic,
                (false, Linkage::External, DllStorage::Default) => SymbolScope::Linkage,
            };
            let id = self.obj.add_symbol(Symbol {
                name: value.name().as_bytes().to_vec(),
                value: 0,
                size: 0,
                kind,
                scope,
                weak: false,
                section: SymbolSection::Undefined,
                flags: SymbolFlags::None,
            });
            self.symbols.insert(value.name().to_string(), id);
        }
    }

    fn symbol(&self, name: &str) -> Result<SymbolId, EmitDiagnostic> {
        self.symbols
            .get(name)
            .copied()
            .ok_or_else(|| self.error(format!("reference to unknown symbol `{name}`")))
    }

    /// Section for a definition, split per symbol when it is in a comdat.
    fn section_for(&mut self, standard: StandardSection, value_name: &str, in_comdat: bool) -> SectionId {
        if in_comdat && self.is_coff() {
            self.obj.add_subsection(standard, value_name.as_bytes())
        } else {
            self.obj.section_id(standard)
        }
    }

    fn add_comdat(&mut self, symbol: SymbolId, section: SectionId, selection: ComdatSelection) {
        if !self.is_coff() {
            return;
        }
        let kind = match selection {
            ComdatSelection::Any => ComdatKind::Any,
            ComdatSelection::NoDuplicates => ComdatKind::NoDuplicates,
        };
        self.obj.add_comdat(Comdat {
            kind,
            symbol,
            sections: vec![section],
        });
    }

    fn relocate(
        &mut self,
        section: SectionId,
        offset: u64,
        target: &str,
        addend: i64,
        kind: RelocationKind,
        size: u8,
    ) -> Result<(), EmitDiagnostic> {
        let symbol = self.symbol(target)?;
        self.obj
            .add_relocation(
                section,
                Relocation {
                    offset,
                    symbol,
                    addend,
                    flags: RelocationFlags::Generic {
                        kind,
                        encoding: RelocationEncoding::Generic,
                        size,
                    },
                },
            )
            .map_err(|err| self.error(err))
    }

    fn define_function(&mut self, f: &Function) -> Result<(), EmitDiagnostic> {
        let Some(body) = &f.body else {
            return Ok(());
        };
        let symbol = self.symbol(&f.name)?;
        let section = self.section_for(StandardSection::Text, &f.name, f.comdat.is_some());
        let offset = self.obj.add_symbol_data(symbol, section, &body.code, FUNCTION_ALIGN);
        trace!("{}: {} bytes at {:#x}", f.name, body.code.len(), offset);

        let pointer_bits = self.pointer_bytes() * 8;
        for reloc in &body.relocs {
            let (kind, size) = match reloc.kind {
                RelocKind::PcRel32 => (RelocationKind::Relative, 32),
                RelocKind::Absolute => (RelocationKind::Absolute, pointer_bits),
            };
            self.relocate(
                section,
                offset + u64::from(reloc.offset),
                &reloc.target,
                reloc.addend,
                kind,
                size,
            )?;
        }

        if let Some(comdat) = &f.comdat {
            self.add_comdat(symbol, section, comdat.selection);
        }
        if let Some(personality) = &f.personality {
            if self.is_coff() && self.obj.architecture() == object::Architecture::X86_64 {
                let personality = self.symbol(personality)?;
                self.unwind.push(UnwindEntry {
                    function: symbol,
                    size: body.code.len() as u64,
                    personality,
                });
            }
        }
        Ok(())
    }

    fn define_variable(&mut self, v: &GlobalVariable) -> Result<(), EmitDiagnostic> {
        let Some(init) = &v.initializer else {
            return Ok(());
        };
        let ptr = self.pointer_bytes();
        let symbol = self.symbol(&v.name)?;
        let align = v.align.unwrap_or_else(|| v.ty.align(ptr));

        let mut data = Vec::new();
        let mut relocs = Vec::new();
        lower_initializer(init, &v.ty, ptr, self.endian, &mut data, &mut relocs)
            .map_err(|reason| self.error(format!("`{}`: {reason}", v.name)))?;

        let zeroed = data.iter().all(|b| *b == 0) && relocs.is_empty();
        let standard = match (v.constant, relocs.is_empty()) {
            (true, false) => StandardSection::ReadOnlyDataWithRel,
            (true, true) => StandardSection::ReadOnlyData,
            (false, _) if zeroed && !data.is_empty() => StandardSection::UninitializedData,
            (false, _) => StandardSection::Data,
        };
        let section = self.section_for(standard, &v.name, v.comdat.is_some());
        let offset = if standard == StandardSection::UninitializedData {
            self.obj.add_symbol_bss(symbol, section, data.len() as u64, align)
        } else {
            self.obj.add_symbol_data(symbol, section, &data, align)
        };

        for (at, target) in relocs {
            self.relocate(
                section,
                offset + at,
                &target,
                0,
                RelocationKind::Absolute,
                ptr * 8,
            )?;
        }
        if let Some(comdat) = &v.comdat {
            self.add_comdat(symbol, section, comdat.selection);
        }
        Ok(())
    }

    /// Emit .xdata/.pdata entries for functions carrying a personality.
    fn write_unwind_info(&mut self) -> Result<(), EmitDiagnostic> {
        if self.unwind.is_empty() {
            return Ok(());
        }
        let xdata = self
            .obj
            .add_section(Vec::new(), b".xdata".to_vec(), SectionKind::ReadOnlyData);
        let pdata = self
            .obj
            .add_section(Vec::new(), b".pdata".to_vec(), SectionKind::ReadOnlyData);
        let xdata_symbol = self.obj.section_symbol(xdata);

        for entry in std::mem::take(&mut self.unwind) {
            let mut info = UNWIND_INFO_EHANDLER.to_vec();
            info.extend_from_slice(&[0; 4]);
            let info_offset = self.obj.append_section_data(xdata, &info, 4);
            self.image_offset(xdata, info_offset + 4, entry.personality, 0)?;

            let func_offset = self.obj.append_section_data(pdata, &[0; 12], 4);
            self.image_offset(pdata, func_offset, entry.function, 0)?;
            self.image_offset(pdata, func_offset + 4, entry.function, entry.size as i64)?;
            self.image_offset(pdata, func_offset + 8, xdata_symbol, info_offset as i64)?;
        }
        Ok(())
    }

    fn image_offset(
        &mut self,
        section: SectionId,
        offset: u64,
        symbol: SymbolId,
        addend: i64,
    ) -> Result<(), EmitDiagnostic> {
        self.obj
            .add_relocation(
                section,
                Relocation {
                    offset,
                    symbol,
                    addend,
                    flags: RelocationFlags::Generic {
                        kind: RelocationKind::ImageOffset,
                        encoding: RelocationEncoding::Generic,
                        size: 32,
                    },
                },
            )
            .map_err(|err| self.error(err))
    }
}

/// Lay out `init` as bytes of type `ty`, collecting address relocations as
/// (offset, symbol) pairs.
fn lower_initializer(
    init: &Initializer,
    ty: &IrType,
    ptr: u8,
    endian: Endianness,
    out: &mut Vec<u8>,
    relocs: &mut Vec<(u64, String)>,
) -> Result<(), String> {
    let size = ty.size(ptr) as usize;
    match init {
        Initializer::Zero | Initializer::Null => out.resize(out.len() + size, 0),
        Initializer::Int(value) => {
            if size > 8 {
                return Err(format!("integer initializer for {size} byte type"));
            }
            match endian {
                Endianness::Little => out.extend_from_slice(&value.to_le_bytes()[..size]),
                Endianness::Big => out.extend_from_slice(&value.to_be_bytes()[8 - size..]),
            }
        }
        Initializer::Bytes(bytes) => {
            if bytes.len() > size {
                return Err(format!("{} initializer bytes for {size} byte type", bytes.len()));
            }
            out.extend_from_slice(bytes);
            out.resize(out.len() + size - bytes.len(), 0);
        }
        Initializer::SymbolAddr(target) => {
            relocs.push((out.len() as u64, target.clone()));
            out.resize(out.len() + usize::from(ptr), 0);
        }
        Initializer::Array(elems) => {
            let IrType::Array(elem_ty, len) = ty else {
                return Err("array initializer for non-array type".to_string());
            };
            if elems.len() as u64 != *len {
                return Err(format!("{} elements for array of {len}", elems.len()));
            }
            for elem in elems {
                lower_initializer(elem, elem_ty, ptr, endian, out, relocs)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{CodeReloc, FunctionBody};
    use crate::target::TargetConfig;
    use object::{Object as _, ObjectSection, ObjectSymbol};

    fn machine(triple: &str) -> TargetMachine {
        TargetMachine::for_native_artifact(&TargetConfig::new(triple.parse().unwrap()))
    }

    fn sample_module() -> Module {
        let mut m = Module::new("sample");
        m.add_global(GlobalVariable::definition("g0", IrType::Ptr, false, Linkage::Internal, Initializer::Null))
            .unwrap();
        m.add_function(Function::definition(
            "f",
            Linkage::Internal,
            FunctionBody {
                code: vec![0x48, 0x8b, 0x05, 0, 0, 0, 0, 0xc3],
                relocs: vec![CodeReloc {
                    offset: 3,
                    target: "g0".into(),
                    kind: RelocKind::PcRel32,
                    addend: -4,
                }],
            },
        ))
        .unwrap();
        m.add_global(GlobalVariable::definition(
            "table",
            IrType::array(IrType::Ptr, 1),
            true,
            Linkage::External,
            Initializer::Array(vec![Initializer::SymbolAddr("f".into())]),
        ))
        .unwrap();
        m
    }

    #[test]
    fn test_lower_integers_and_arrays() {
        let mut out = Vec::new();
        let mut relocs = Vec::new();
        let ty = IrType::array(IrType::Ptr, 2);
        let init = Initializer::Array(vec![
            Initializer::SymbolAddr("a".into()),
            Initializer::SymbolAddr("b".into()),
        ]);
        lower_initializer(&init, &ty, 8, Endianness::Little, &mut out, &mut relocs).unwrap();
        assert_eq!(out.len(), 16);
        assert_eq!(relocs, vec![(0, "a".to_string()), (8, "b".to_string())]);

        let mut out = Vec::new();
        lower_initializer(&Initializer::Int(0x0102), &IrType::Int(32), 8, Endianness::Big, &mut out, &mut relocs)
            .unwrap();
        assert_eq!(out, vec![0, 0, 1, 2]);

        let bad = Initializer::Array(vec![Initializer::Null]);
        assert!(lower_initializer(&bad, &ty, 8, Endianness::Little, &mut out, &mut relocs).is_err());
    }

    #[test]
    fn test_elf_object_symbols() {
        let bytes = write_object(&sample_module(), &machine("x86_64-unknown-linux-gnu")).unwrap();
        let file = object::File::parse(&*bytes).unwrap();
        assert_eq!(file.format(), BinaryFormat::Elf);

        let f = file.symbols().find(|s| s.name().ok() == Some("f")).unwrap();
        assert!(f.is_local());
        assert_eq!(f.size(), 8);
        let table = file.symbols().find(|s| s.name().ok() == Some("table")).unwrap();
        assert!(table.is_global());
        assert_eq!(table.size(), 8);

        let text = file.section_by_name(".text").unwrap();
        assert_eq!(text.relocations().count(), 1);
    }

    #[test]
    fn test_unsupported_target_is_reported() {
        let err = write_object(&sample_module(), &machine("wasm32-unknown-unknown")).unwrap_err();
        assert!(matches!(err, EmitDiagnostic::UnsupportedTarget { .. }));
    }

    #[test]
    fn test_unknown_reference_is_reported() {
        let mut m = Module::new("broken");
        m.add_global(GlobalVariable::definition(
            "p",
            IrType::Ptr,
            true,
            Linkage::External,
            Initializer::SymbolAddr("nowhere".into()),
        ))
        .unwrap();
        let err = write_object(&m, &machine("x86_64-unknown-linux-gnu")).unwrap_err();
        assert!(err.to_string().contains("nowhere"));
    }
}
