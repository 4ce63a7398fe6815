// This module defines the backend IR that every other part of aot-image manipulates.
// A Module is a flat, name-indexed collection of global values: variables (with an
// optional constant initializer) and functions (with an optional body of machine code
// plus symbolic relocations). Values without an initializer or body are declarations.
// Linkage, DLL storage, comdat membership, alignment and the unwind personality are
// carried per value so the platform policy can annotate them before emission. The
// module supports cloning, linking one module into another, dead value removal and
// verification; the textual writer renders it as the intermediate dump format.

//! Backend IR for native image modules.
//!
//! The IR is intentionally small: it models exactly what the image builder
//! needs to reason about symbols, tables and linkage. Code generation hands
//! over finished machine code with symbolic relocations, so there is no
//! instruction level representation here.

pub mod module;
pub mod writer;

pub use module::{LinkError, Module, VerifyError};

use thiserror::Error;

/// Errors raised while building a module.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IrError {
    #[error("symbol `{0}` already exists in the module")]
    DuplicateSymbol(String),

    #[error("symbol `{0}` not found in the module")]
    UnknownSymbol(String),
}

pub type IrResult<T> = Result<T, IrError>;

/// Value types understood by the layout code.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IrType {
    /// Integer with the given bit width (a multiple of 8).
    Int(u32),
    /// Pointer in the default address space.
    Ptr,
    /// Fixed length array.
    Array(Box<IrType>, u64),
}

impl IrType {
    /// Pointer sized integer for a target with `ptr_bytes` wide pointers.
    pub fn size_type(ptr_bytes: u8) -> Self {
        IrType::Int(u32::from(ptr_bytes) * 8)
    }

    pub fn array(elem: IrType, len: u64) -> Self {
        IrType::Array(Box::new(elem), len)
    }

    /// Allocation size in bytes.
    pub fn size(&self, ptr_bytes: u8) -> u64 {
        match self {
            IrType::Int(bits) => u64::from(bits.div_ceil(8)),
            IrType::Ptr => u64::from(ptr_bytes),
            IrType::Array(elem, len) => elem.size(ptr_bytes) * len,
        }
    }

    /// Natural alignment in bytes.
    pub fn align(&self, ptr_bytes: u8) -> u64 {
        match self {
            IrType::Int(bits) => u64::from(bits.div_ceil(8)).clamp(1, 16).next_power_of_two(),
            IrType::Ptr => u64::from(ptr_bytes),
            IrType::Array(elem, _) => elem.align(ptr_bytes),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Linkage {
    External,
    Internal,
}

impl Linkage {
    /// Whether symbols with this linkage are visible outside the object file.
    pub fn is_external(self) -> bool {
        matches!(self, Linkage::External)
    }
}

/// DLL storage class, only meaningful for COFF targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DllStorage {
    #[default]
    Default,
    Export,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComdatSelection {
    Any,
    NoDuplicates,
}

/// Linkage group a definition belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Comdat {
    pub name: String,
    pub selection: ComdatSelection,
}

/// Constant initializer of a global variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Initializer {
    /// All zero bytes of the variable's type.
    Zero,
    /// Null pointer.
    Null,
    Int(u64),
    Bytes(Vec<u8>),
    /// Address of another global value.
    SymbolAddr(String),
    Array(Vec<Initializer>),
}

impl Initializer {
    /// Collect the names of all symbols whose address this initializer takes.
    pub fn collect_refs<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Initializer::SymbolAddr(name) => out.push(name),
            Initializer::Array(elems) => elems.iter().for_each(|e| e.collect_refs(out)),
            _ => {}
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalVariable {
    pub name: String,
    pub ty: IrType,
    pub constant: bool,
    pub linkage: Linkage,
    pub initializer: Option<Initializer>,
    pub align: Option<u64>,
    pub comdat: Option<Comdat>,
    pub dll_storage: DllStorage,
}

impl GlobalVariable {
    /// External declaration of a variable defined elsewhere.
    pub fn declaration(name: impl Into<String>, ty: IrType) -> Self {
        Self {
            name: name.into(),
            ty,
            constant: false,
            linkage: Linkage::External,
            initializer: None,
            align: None,
            comdat: None,
            dll_storage: DllStorage::Default,
        }
    }

    pub fn definition(
        name: impl Into<String>,
        ty: IrType,
        constant: bool,
        linkage: Linkage,
        initializer: Initializer,
    ) -> Self {
        Self {
            initializer: Some(initializer),
            constant,
            linkage,
            ..Self::declaration(name, ty)
        }
    }

    pub fn with_align(mut self, align: u64) -> Self {
        self.align = Some(align);
        self
    }

    pub fn is_declaration(&self) -> bool {
        self.initializer.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelocKind {
    /// 32-bit PC relative displacement.
    PcRel32,
    /// Pointer sized absolute address.
    Absolute,
}

/// Symbolic relocation inside a function body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeReloc {
    pub offset: u32,
    pub target: String,
    pub kind: RelocKind,
    pub addend: i64,
}

/// Machine code produced by the code generator.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FunctionBody {
    pub code: Vec<u8>,
    pub relocs: Vec<CodeReloc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Function {
    pub name: String,
    pub linkage: Linkage,
    pub body: Option<FunctionBody>,
    pub personality: Option<String>,
    pub comdat: Option<Comdat>,
    pub dll_storage: DllStorage,
}

impl Function {
    pub fn declaration(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            linkage: Linkage::External,
            body: None,
            personality: None,
            comdat: None,
            dll_storage: DllStorage::Default,
        }
    }

    pub fn definition(name: impl Into<String>, linkage: Linkage, body: FunctionBody) -> Self {
        Self {
            linkage,
            body: Some(body),
            ..Self::declaration(name)
        }
    }

    pub fn is_declaration(&self) -> bool {
        self.body.is_none()
    }
}

/// A named entity of a module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GlobalValue {
    Variable(GlobalVariable),
    Function(Function),
}

impl GlobalValue {
    pub fn name(&self) -> &str {
        match self {
            GlobalValue::Variable(v) => &v.name,
            GlobalValue::Function(f) => &f.name,
        }
    }

    pub fn linkage(&self) -> Linkage {
        match self {
            GlobalValue::Variable(v) => v.linkage,
            GlobalValue::Function(f) => f.linkage,
        }
    }

    pub fn set_linkage(&mut self, linkage: Linkage) {
        match self {
            GlobalValue::Variable(v) => v.linkage = linkage,
            GlobalValue::Function(f) => f.linkage = linkage,
        }
    }

    pub fn is_declaration(&self) -> bool {
        match self {
            GlobalValue::Variable(v) => v.is_declaration(),
            GlobalValue::Function(f) => f.is_declaration(),
        }
    }

    pub fn is_function(&self) -> bool {
        matches!(self, GlobalValue::Function(_))
    }

    pub fn comdat(&self) -> Option<&Comdat> {
        match self {
            GlobalValue::Variable(v) => v.comdat.as_ref(),
            GlobalValue::Function(f) => f.comdat.as_ref(),
        }
    }

    pub fn set_comdat(&mut self, comdat: Option<Comdat>) {
        match self {
            GlobalValue::Variable(v) => v.comdat = comdat,
            GlobalValue::Function(f) => f.comdat = comdat,
        }
    }

    pub fn dll_storage(&self) -> DllStorage {
        match self {
            GlobalValue::Variable(v) => v.dll_storage,
            GlobalValue::Function(f) => f.dll_storage,
        }
    }

    pub fn set_dll_storage(&mut self, storage: DllStorage) {
        match self {
            GlobalValue::Variable(v) => v.dll_storage = storage,
            GlobalValue::Function(f) => f.dll_storage = storage,
        }
    }

    /// Names of all symbols this value refers to.
    pub fn references(&self) -> Vec<&str> {
        let mut refs = Vec::new();
        match self {
            GlobalValue::Variable(v) => {
                if let Some(init) = &v.initializer {
                    init.collect_refs(&mut refs);
                }
            }
            GlobalValue::Function(f) => {
                if let Some(body) = &f.body {
                    refs.extend(body.relocs.iter().map(|r| r.target.as_str()));
                }
                if let Some(personality) = &f.personality {
                    refs.push(personality);
                }
            }
        }
        refs
    }
}

impl From<GlobalVariable> for GlobalValue {
    fn from(v: GlobalVariable) -> Self {
        GlobalValue::Variable(v)
    }
}

impl From<Function> for GlobalValue {
    fn from(f: Function) -> Self {
        GlobalValue::Function(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_layout() {
        assert_eq!(IrType::Int(8).size(8), 1);
        assert_eq!(IrType::Ptr.size(4), 4);
        assert_eq!(IrType::size_type(8), IrType::Int(64));
        let table = IrType::array(IrType::Ptr, 3);
        assert_eq!(table.size(8), 24);
        assert_eq!(table.align(8), 8);
        assert_eq!(IrType::array(IrType::Ptr, 0).size(8), 0);
    }

    #[test]
    fn test_references() {
        let table = GlobalVariable::definition(
            "table",
            IrType::array(IrType::Ptr, 2),
            true,
            Linkage::External,
            Initializer::Array(vec![
                Initializer::SymbolAddr("a".into()),
                Initializer::SymbolAddr("b".into()),
            ]),
        );
        assert_eq!(GlobalValue::from(table).references(), vec!["a", "b"]);

        let mut f = Function::definition(
            "f",
            Linkage::Internal,
            FunctionBody {
                code: vec![0xe8, 0, 0, 0, 0, 0xc3],
                relocs: vec![CodeReloc {
                    offset: 1,
                    target: "g".into(),
                    kind: RelocKind::PcRel32,
                    addend: -4,
                }],
            },
        );
        f.personality = Some("pers".into());
        assert_eq!(GlobalValue::from(f).references(), vec!["g", "pers"]);
    }

    #[test]
    fn test_declarations() {
        assert!(GlobalVariable::declaration("x", IrType::Ptr).is_declaration());
        assert!(Function::declaration("f").is_declaration());
        let def = Function::definition("f", Linkage::External, FunctionBody::default());
        assert!(!GlobalValue::from(def).is_declaration());
    }
}
