//! Offset tables and image bookkeeping globals.
//!
//! The tables are plain arrays of symbol addresses. A downstream
//! relocation step rewrites them into image-relative offsets, so element
//! `i - 1` of a table always belongs to the entry with index `i`.

use crate::core::error::{AotError, AotResult};
use crate::ir::{GlobalValue, GlobalVariable, Initializer, IrType, Linkage, Module};
use crate::target::SymbolPolicy;
use log::debug;

/// Global offset table.
pub const GLOBAL_TABLE: &str = "sysimg_gvars";
/// Function offset table.
pub const FUNCTION_TABLE: &str = "sysimg_fvars";
/// First symbol counter value a reloaded image may hand out.
pub const UNIQUE_COUNTER: &str = "sysimg_global_unique";
/// Serialized runtime image.
pub const IMAGE_DATA: &str = "system_image_data";
/// Length of [`IMAGE_DATA`] in bytes.
pub const IMAGE_SIZE: &str = "system_image_size";

/// Alignment of the payload global, one cache line.
pub const IMAGE_DATA_ALIGN: u64 = 64;

/// Name of the global reflecting `handle` back to the loader.
pub fn handle_pointer_name(handle: &str) -> String {
    format!("{handle}_pointer")
}

/// Everything needed to embed the image bookkeeping into a module.
pub struct GlobalData<'a> {
    pub gvars: &'a [String],
    pub fvars: &'a [String],
    /// Registry high water mark at emission time.
    pub high_water: u64,
    pub runtime_handle: &'a str,
    pub payload: Option<&'a [u8]>,
    pub pointer_bytes: u8,
}

/// Emit a constant array of the addresses of `symbols`, in order.
pub fn emit_offset_table(module: &mut Module, symbols: &[String], name: &str) -> AotResult<()> {
    for symbol in symbols {
        if !module.contains(symbol) {
            return Err(AotError::TableInconsistency {
                reason: format!("`{name}` refers to `{symbol}`, which is not in module `{}`", module.name()),
            });
        }
    }
    let elems = symbols
        .iter()
        .map(|s| Initializer::SymbolAddr(s.clone()))
        .collect();
    let table = GlobalVariable::definition(
        name,
        IrType::array(IrType::Ptr, symbols.len() as u64),
        true,
        Linkage::External,
        Initializer::Array(elems),
    );
    module.add_global(table)?;
    debug!("emitted offset table {} with {} entries", name, symbols.len());
    Ok(())
}

/// Embed both offset tables, the symbol counter, the runtime handle pointer
/// and, when present, the payload with its length.
pub fn emit_global_data(
    module: &mut Module,
    data: &GlobalData<'_>,
    policy: &dyn SymbolPolicy,
    personality: Option<&str>,
) -> AotResult<()> {
    emit_offset_table(module, data.gvars, GLOBAL_TABLE)?;
    emit_offset_table(module, data.fvars, FUNCTION_TABLE)?;

    let size_ty = IrType::size_type(data.pointer_bytes);
    let mut extra = vec![GlobalVariable::definition(
        UNIQUE_COUNTER,
        size_ty.clone(),
        true,
        Linkage::External,
        Initializer::Int(data.high_water + 1),
    )];

    if !module.contains(data.runtime_handle) {
        module.add_global(GlobalVariable::declaration(data.runtime_handle, IrType::Ptr))?;
    }
    extra.push(GlobalVariable::definition(
        handle_pointer_name(data.runtime_handle),
        IrType::Ptr,
        true,
        Linkage::External,
        Initializer::SymbolAddr(data.runtime_handle.to_string()),
    ));

    if let Some(payload) = data.payload {
        extra.push(
            GlobalVariable::definition(
                IMAGE_DATA,
                IrType::array(IrType::Int(8), payload.len() as u64),
                false,
                Linkage::External,
                Initializer::Bytes(payload.to_vec()),
            )
            .with_align(IMAGE_DATA_ALIGN),
        );
        extra.push(GlobalVariable::definition(
            IMAGE_SIZE,
            size_ty,
            true,
            Linkage::External,
            Initializer::Int(payload.len() as u64),
        ));
    }

    for var in extra {
        let mut value = GlobalValue::from(var);
        policy.finalize(&mut value, personality);
        module.add(value)?;
    }

    // the tables themselves go through the same finalization
    for name in [GLOBAL_TABLE, FUNCTION_TABLE] {
        if let Some(value) = module.named_value_mut(name) {
            policy.finalize(value, personality);
        }
    }
    Ok(())
}
