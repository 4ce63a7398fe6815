//! Ambient image-building state and the public entry points.
//!
//! [`AotContext`] owns everything that outlives a single session: the
//! shadow module accumulating symbols destined for the image, the global
//! value registry, the execution engine mapping and the persistence latch.
//! All of it sits behind one lock, the compilation lock, which serializes
//! registry growth and session creation.

use super::error::AotResult;
use super::registry::{bind_slot, ExecutionEngine, GlobalMappings, GlobalRegistry, GlobalSymbol, ValueHandle};
use super::session::NativeSession;
use crate::driver::{self, Revisions, SpecializationId, Toolchain};
use crate::emit::{self, EmitOptions, EmitReport};
use crate::ir::{Function, GlobalValue, GlobalVariable, Initializer, IrType, Linkage, Module};
use crate::target::{policy_for, SymbolPolicy, TargetConfig, TargetMachine};
use log::{debug, info};
use parking_lot::Mutex;
use std::num::NonZeroU32;
use std::sync::atomic::Ordering;

/// Name of the ambient module accumulating persisted symbols.
pub const SHADOW_MODULE_NAME: &str = "shadow_output";

/// Configuration for an image build.
#[derive(Debug, Clone)]
pub struct AotConfig {
    pub target: TargetConfig,
    /// Build a persisted image: register globals in the shadow module and
    /// embed offset tables on the first emission.
    pub persistence: bool,
    /// Unwind personality routine attached where the platform requires one.
    pub personality_symbol: String,
    /// Well-known runtime handle reflected into the image for consistency checks.
    pub runtime_handle_symbol: String,
}

impl Default for AotConfig {
    fn default() -> Self {
        Self {
            target: TargetConfig::host(),
            persistence: false,
            personality_symbol: "__runtime_personality".to_string(),
            runtime_handle_symbol: "rtld_default_handle".to_string(),
        }
    }
}

impl AotConfig {
    pub fn with_target(mut self, target: TargetConfig) -> Self {
        self.target = target;
        self
    }

    pub fn with_persistence(mut self, persistence: bool) -> Self {
        self.persistence = persistence;
        self
    }

    pub fn with_personality_symbol(mut self, symbol: impl Into<String>) -> Self {
        self.personality_symbol = symbol.into();
        self
    }

    pub fn with_runtime_handle_symbol(mut self, symbol: impl Into<String>) -> Self {
        self.runtime_handle_symbol = symbol.into();
        self
    }
}

/// State guarded by the compilation lock.
pub struct Ambient {
    shadow: Module,
    registry: GlobalRegistry,
    engine: Box<dyn ExecutionEngine>,
    persistence: bool,
    policy: &'static dyn SymbolPolicy,
    personality: Option<String>,
}

impl Ambient {
    pub(crate) fn new(config: &AotConfig, engine: Box<dyn ExecutionEngine>) -> AotResult<Self> {
        let artifact = TargetMachine::for_native_artifact(&config.target);
        let policy = policy_for(artifact.triple());

        let mut shadow = Module::new(SHADOW_MODULE_NAME);
        shadow.add_global(GlobalVariable::declaration(
            config.runtime_handle_symbol.as_str(),
            IrType::Ptr,
        ))?;
        let personality = if policy.requires_explicit_personality() {
            shadow.add_function(Function::declaration(config.personality_symbol.as_str()))?;
            Some(config.personality_symbol.clone())
        } else {
            None
        };
        debug!(
            "ambient state for {} using {} symbol policy",
            artifact.triple(),
            policy.name()
        );

        Ok(Self {
            shadow,
            registry: GlobalRegistry::new(),
            engine,
            persistence: config.persistence,
            policy,
            personality,
        })
    }

    /// Placeholder symbol for `handle`, registering it on first use.
    pub fn intern(&mut self, handle: ValueHandle, name_hint: &str, ty: IrType) -> AotResult<GlobalSymbol> {
        if let Some(symbol) = self.registry.lookup(handle) {
            return Ok(symbol);
        }

        let name = self.registry.next_name(name_hint);
        if self.persistence {
            let init = if ty == IrType::Ptr {
                Initializer::Null
            } else {
                Initializer::Zero
            };
            let mut shadow_var: GlobalValue =
                GlobalVariable::definition(name.as_str(), ty, false, Linkage::Internal, init).into();
            self.policy.finalize(&mut shadow_var, self.personality.as_deref());
            self.shadow.add(shadow_var)?;
        }
        bind_slot(self.engine.as_mut(), &name, handle);

        let symbol = self.registry.record(handle, name, self.persistence);
        debug!("registered {:?} as {} (index {:?})", handle, symbol.name, symbol.index);
        Ok(symbol)
    }

    pub fn shadow(&self) -> &Module {
        &self.shadow
    }

    pub fn registry(&self) -> &GlobalRegistry {
        &self.registry
    }

    pub fn persistence_active(&self) -> bool {
        self.persistence
    }

    pub fn policy(&self) -> &'static dyn SymbolPolicy {
        self.policy
    }

    pub fn personality(&self) -> Option<&str> {
        self.personality.as_deref()
    }

    /// Internalize and finalize the definitions of `module`, then merge it
    /// into the shadow module.
    pub(crate) fn add_to_shadow(&mut self, mut module: Module) -> AotResult<()> {
        for value in module.values_mut().filter(|v| !v.is_declaration()) {
            if value.is_function() {
                value.set_linkage(Linkage::Internal);
            }
            if self.persistence {
                self.policy.finalize(value, self.personality.as_deref());
            }
        }
        self.shadow.link_in(module)?;
        Ok(())
    }

    /// Turn persistence off; returns whether it was on.
    fn take_persistence(&mut self) -> bool {
        std::mem::replace(&mut self.persistence, false)
    }

    fn restore_persistence(&mut self) {
        self.persistence = true;
    }
}

/// Process-wide image builder.
pub struct AotContext {
    config: AotConfig,
    state: Mutex<Ambient>,
}

impl AotContext {
    /// Create a context with a plain symbol map as execution engine.
    pub fn new(config: AotConfig) -> AotResult<Self> {
        Self::with_engine(config, Box::new(GlobalMappings::new()))
    }

    pub fn with_engine(config: AotConfig, engine: Box<dyn ExecutionEngine>) -> AotResult<Self> {
        let ambient = Ambient::new(&config, engine)?;
        Ok(Self {
            config,
            state: Mutex::new(ambient),
        })
    }

    pub fn config(&self) -> &AotConfig {
        &self.config
    }

    /// Placeholder symbol for a runtime value.
    ///
    /// Repeated calls with the same handle return the same symbol and never
    /// grow the registry.
    pub fn intern_global(&self, handle: ValueHandle, name_hint: &str, ty: IrType) -> AotResult<GlobalSymbol> {
        self.state.lock().intern(handle, name_hint, ty)
    }

    /// Offset table index of `handle`, if it was registered for persistence.
    pub fn index_of(&self, handle: ValueHandle) -> Option<NonZeroU32> {
        self.state.lock().registry.index_of(handle)
    }

    /// Current value of the process-local slot behind `symbol`.
    pub fn lookup_global_slot(&self, symbol: &str) -> Option<usize> {
        self.state
            .lock()
            .engine
            .global_mapping(symbol)
            .map(|slot| slot.load(Ordering::Acquire))
    }

    /// Number of symbols the registry has handed out.
    pub fn high_water(&self) -> u64 {
        self.state.lock().registry.high_water()
    }

    pub fn persistence_active(&self) -> bool {
        self.state.lock().persistence
    }

    /// Copy of the shadow module as it stands.
    pub fn shadow_snapshot(&self) -> Module {
        self.state.lock().shadow.clone()
    }

    /// Merge an externally compiled module into the shadow module.
    pub fn add_to_shadow(&self, module: Module) -> AotResult<()> {
        self.state.lock().add_to_shadow(module)
    }

    /// Compile `roots` and everything they call into a session.
    pub fn create_session<T: Toolchain + ?Sized>(
        &self,
        roots: &[SpecializationId],
        revisions: Revisions,
        toolchain: &mut T,
    ) -> AotResult<NativeSession> {
        let mut ambient = self.state.lock();
        let session = driver::create_native(&mut ambient, &self.config.target, revisions, roots, toolchain)?;
        info!(
            "created native session: {} functions in table, {} globals",
            session.function_table().len(),
            session.global_table().len()
        );
        Ok(session)
    }

    /// Write the requested outputs for `session` and destroy it.
    ///
    /// Offset tables are embedded only by the first emission of a persistent
    /// session; later requests see [`PersistenceOutcome::AlreadyConsumed`].
    ///
    /// [`PersistenceOutcome::AlreadyConsumed`]: crate::emit::PersistenceOutcome::AlreadyConsumed
    pub fn emit_artifact(&self, session: NativeSession, options: &EmitOptions) -> AotResult<EmitReport> {
        let (embed, high_water) = {
            let mut ambient = self.state.lock();
            let embed = session.is_persistent() && ambient.take_persistence();
            (embed, ambient.registry.high_water())
        };

        let result = emit::emit_native(&self.config, session, options, embed, high_water);
        if result.is_err() && embed {
            self.state.lock().restore_persistence();
        }
        result
    }
}

impl Drop for AotContext {
    fn drop(&mut self) {
        debug!("dropping image context ({} registered globals)", self.state.get_mut().registry.len());
    }
}
