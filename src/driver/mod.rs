//! Multi-revision compilation driver.
//!
//! Compiles a root set of specializations, together with everything they
//! call, into one [`NativeSession`](crate::NativeSession). See
//! [`AotContext::create_session`](crate::AotContext::create_session).

pub mod compile;
pub mod engine;
pub mod world;

pub use compile::SESSION_MODULE_NAME;
pub(crate) use compile::create_native;
pub use engine::{
    ApiFlag, CachedInference, CodegenEngine, CompileCx, CompiledUnit, InferenceEngine, InferredCode,
    InstanceInfo, MethodTable, SpecializationId, Toolchain, TypeTag, WorkQueue,
};
pub use world::{CompilePass, Revision, Revisions, WorldRange};
