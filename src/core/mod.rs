// This module holds the ambient state of the image builder and the bookkeeping shared by
// every session: the error types, the global value registry with its execution engine
// mapping, the context object that owns the shadow module behind the compilation lock,
// and the session produced by the driver and consumed by emission.

//! Core image-building infrastructure.

pub mod context;
pub mod error;
pub mod registry;
pub mod session;

pub use context::{AotConfig, AotContext, Ambient, SHADOW_MODULE_NAME};
pub use error::{AotError, AotResult, EmitDiagnostic};
pub use registry::{ExecutionEngine, GlobalMappings, GlobalRegistry, GlobalSlot, GlobalSymbol, ValueHandle};
pub use session::{NativeSession, SessionStats, TableEntry};
