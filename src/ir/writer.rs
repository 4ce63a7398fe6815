//! Textual module dump.
//!
//! This is the intermediate form written before and after optimization.
//! The format is line oriented and stable so dumps can be diffed:
//!
//! ```text
//! ; module 'native'
//! target triple = "x86_64-unknown-linux-gnu"
//! @sysimg_fvars = external constant [1 x ptr] [ptr @f_generic_1]
//! define internal @f_generic_1 { code 1 bytes }
//! ```

use super::{
    ComdatSelection, DllStorage, Function, GlobalValue, GlobalVariable, Initializer, IrType,
    Linkage, Module, RelocKind,
};
use std::fmt::{self, Write as _};
use std::io;

/// Write `module` to `out` in the textual dump format.
pub fn write_module(module: &Module, out: &mut impl io::Write) -> io::Result<()> {
    out.write_all(module_to_string(module).as_bytes())
}

pub fn module_to_string(module: &Module) -> String {
    let mut s = String::new();
    // Writing to a String cannot fail.
    let _ = fmt_module(module, &mut s);
    s
}

fn fmt_module(module: &Module, s: &mut String) -> fmt::Result {
    writeln!(s, "; module '{}'", module.name())?;
    if let Some(triple) = module.triple() {
        writeln!(s, "target triple = \"{triple}\"")?;
    }
    if let Some(layout) = module.data_layout() {
        writeln!(s, "target datalayout = \"{layout}\"")?;
    }
    for value in module.values() {
        match value {
            GlobalValue::Variable(v) => fmt_variable(v, s)?,
            GlobalValue::Function(f) => fmt_function(f, s)?,
        }
    }
    Ok(())
}

fn fmt_attrs(linkage: Linkage, storage: DllStorage, s: &mut String) -> fmt::Result {
    match linkage {
        Linkage::External => write!(s, "external")?,
        Linkage::Internal => write!(s, "internal")?,
    }
    if storage == DllStorage::Export {
        write!(s, " dllexport")?;
    }
    Ok(())
}

fn fmt_variable(v: &GlobalVariable, s: &mut String) -> fmt::Result {
    write!(s, "@{} = ", v.name)?;
    fmt_attrs(v.linkage, v.dll_storage, s)?;
    let kind = if v.constant { "constant" } else { "global" };
    write!(s, " {kind} {}", TypeDisplay(&v.ty))?;
    match &v.initializer {
        Some(init) => {
            s.push(' ');
            fmt_init(init, s)?;
        }
        None => write!(s, " ; declaration")?,
    }
    if let Some(comdat) = &v.comdat {
        write!(s, ", comdat({})", comdat.name)?;
    }
    if let Some(align) = v.align {
        write!(s, ", align {align}")?;
    }
    s.push('\n');
    Ok(())
}

fn fmt_init(init: &Initializer, s: &mut String) -> fmt::Result {
    match init {
        Initializer::Zero => write!(s, "zeroinitializer"),
        Initializer::Null => write!(s, "null"),
        Initializer::Int(v) => write!(s, "{v}"),
        Initializer::Bytes(bytes) => {
            write!(s, "c\"")?;
            for b in bytes {
                write!(s, "\\{b:02X}")?;
            }
            write!(s, "\"")
        }
        Initializer::SymbolAddr(name) => write!(s, "ptr @{name}"),
        Initializer::Array(elems) => {
            s.push('[');
            for (i, elem) in elems.iter().enumerate() {
                if i > 0 {
                    s.push_str(", ");
                }
                fmt_init(elem, s)?;
            }
            s.push(']');
            Ok(())
        }
    }
}

fn fmt_function(f: &Function, s: &mut String) -> fmt::Result {
    let Some(body) = &f.body else {
        return writeln!(s, "declare @{}", f.name);
    };
    write!(s, "define ")?;
    fmt_attrs(f.linkage, f.dll_storage, s)?;
    write!(s, " @{}", f.name)?;
    if let Some(comdat) = &f.comdat {
        let selection = match comdat.selection {
            ComdatSelection::Any => "any",
            ComdatSelection::NoDuplicates => "noduplicates",
        };
        write!(s, " comdat({}, {selection})", comdat.name)?;
    }
    if let Some(personality) = &f.personality {
        write!(s, " personality @{personality}")?;
    }
    write!(s, " {{ code {} bytes", body.code.len())?;
    for reloc in &body.relocs {
        let kind = match reloc.kind {
            RelocKind::PcRel32 => "pcrel32",
            RelocKind::Absolute => "abs",
        };
        write!(s, "; {kind} @{}+{}", reloc.target, reloc.addend)?;
        write!(s, " at {}", reloc.offset)?;
    }
    writeln!(s, " }}")
}

struct TypeDisplay<'a>(&'a IrType);

impl fmt::Display for TypeDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            IrType::Int(bits) => write!(f, "i{bits}"),
            IrType::Ptr => write!(f, "ptr"),
            IrType::Array(elem, len) => write!(f, "[{len} x {}]", TypeDisplay(elem)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{CodeReloc, FunctionBody};

    #[test]
    fn test_dump_contains_every_value() {
        let mut m = Module::new("native");
        m.set_triple("x86_64-unknown-linux-gnu");
        m.add_function(Function::declaration("callee")).unwrap();
        m.add_function(Function::definition(
            "caller",
            Linkage::Internal,
            FunctionBody {
                code: vec![0xe8, 0, 0, 0, 0, 0xc3],
                relocs: vec![CodeReloc {
                    offset: 1,
                    target: "callee".into(),
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
            Initializer::Array(vec![Initializer::SymbolAddr("caller".into())]),
        ))
        .unwrap();

        let text = module_to_string(&m);
        assert!(text.starts_with("; module 'native'\n"));
        assert!(text.contains("target triple = \"x86_64-unknown-linux-gnu\""));
        assert!(text.contains("declare @callee"));
        assert!(text.contains("define internal @caller { code 6 bytes; pcrel32 @callee+-4 at 1 }"));
        assert!(text.contains("@table = external constant [1 x ptr] [ptr @caller]"));
    }

    #[test]
    fn test_payload_bytes_are_escaped() {
        let mut m = Module::new("m");
        m.add_global(
            GlobalVariable::definition(
                "data",
                IrType::array(IrType::Int(8), 2),
                false,
                Linkage::External,
                Initializer::Bytes(vec![0x00, 0xAB]),
            )
            .with_align(64),
        )
        .unwrap();
        let text = module_to_string(&m);
        assert!(text.contains("@data = external global [2 x i8] c\"\\00\\AB\", align 64"));
    }
}
