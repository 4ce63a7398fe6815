//! Name-indexed module container.
//!
//! Values keep their insertion order, which the writers rely on for
//! deterministic output. Names are unique within a module.

use super::{Function, GlobalValue, GlobalVariable, IrError, IrResult, Linkage};
use hashbrown::HashMap;
use log::debug;
use thiserror::Error;

/// Failure to link one module into another.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("symbol `{name}` is defined in both `{into}` and `{from}`")]
    DuplicateDefinition {
        name: String,
        into: String,
        from: String,
    },

    #[error("symbol `{name}` is a function in one module and a variable in the other")]
    KindMismatch { name: String },
}

/// Structural problem found by [`Module::verify`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VerifyError {
    #[error("`{from}` refers to undefined symbol `{to}`")]
    UndefinedReference { from: String, to: String },

    #[error("declaration `{0}` is placed in a comdat")]
    ComdatOnDeclaration(String),

    #[error("symbol index for `{0}` is stale")]
    StaleIndex(String),
}

#[derive(Debug, Clone, Default)]
pub struct Module {
    name: String,
    triple: Option<String>,
    data_layout: Option<String>,
    values: Vec<GlobalValue>,
    index: HashMap<String, usize>,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn triple(&self) -> Option<&str> {
        self.triple.as_deref()
    }

    pub fn set_triple(&mut self, triple: impl Into<String>) {
        self.triple = Some(triple.into());
    }

    pub fn data_layout(&self) -> Option<&str> {
        self.data_layout.as_deref()
    }

    pub fn set_data_layout(&mut self, layout: impl Into<String>) {
        self.data_layout = Some(layout.into());
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Add a value, failing if the name is already taken.
    pub fn add(&mut self, value: impl Into<GlobalValue>) -> IrResult<()> {
        let value = value.into();
        if self.index.contains_key(value.name()) {
            return Err(IrError::DuplicateSymbol(value.name().to_string()));
        }
        self.index.insert(value.name().to_string(), self.values.len());
        self.values.push(value);
        Ok(())
    }

    pub fn add_global(&mut self, var: GlobalVariable) -> IrResult<()> {
        self.add(var)
    }

    pub fn add_function(&mut self, func: Function) -> IrResult<()> {
        self.add(func)
    }

    pub fn named_value(&self, name: &str) -> Option<&GlobalValue> {
        self.index.get(name).map(|&i| &self.values[i])
    }

    pub fn named_value_mut(&mut self, name: &str) -> Option<&mut GlobalValue> {
        self.index.get(name).map(|&i| &mut self.values[i])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn function(&self, name: &str) -> Option<&Function> {
        match self.named_value(name)? {
            GlobalValue::Function(f) => Some(f),
            GlobalValue::Variable(_) => None,
        }
    }

    pub fn function_mut(&mut self, name: &str) -> Option<&mut Function> {
        match self.named_value_mut(name)? {
            GlobalValue::Function(f) => Some(f),
            GlobalValue::Variable(_) => None,
        }
    }

    pub fn global(&self, name: &str) -> Option<&GlobalVariable> {
        match self.named_value(name)? {
            GlobalValue::Variable(v) => Some(v),
            GlobalValue::Function(_) => None,
        }
    }

    pub fn global_mut(&mut self, name: &str) -> Option<&mut GlobalVariable> {
        match self.named_value_mut(name)? {
            GlobalValue::Variable(v) => Some(v),
            GlobalValue::Function(_) => None,
        }
    }

    pub fn values(&self) -> impl Iterator<Item = &GlobalValue> {
        self.values.iter()
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut GlobalValue> {
        self.values.iter_mut()
    }

    pub fn functions(&self) -> impl Iterator<Item = &Function> {
        self.values.iter().filter_map(|v| match v {
            GlobalValue::Function(f) => Some(f),
            GlobalValue::Variable(_) => None,
        })
    }

    pub fn functions_mut(&mut self) -> impl Iterator<Item = &mut Function> {
        self.values.iter_mut().filter_map(|v| match v {
            GlobalValue::Function(f) => Some(f),
            GlobalValue::Variable(_) => None,
        })
    }

    pub fn globals(&self) -> impl Iterator<Item = &GlobalVariable> {
        self.values.iter().filter_map(|v| match v {
            GlobalValue::Variable(g) => Some(g),
            GlobalValue::Function(_) => None,
        })
    }

    /// Remove every value for which `keep` returns false.
    pub fn retain(&mut self, mut keep: impl FnMut(&GlobalValue) -> bool) -> usize {
        let before = self.values.len();
        self.values.retain(|v| keep(v));
        self.reindex();
        before - self.values.len()
    }

    pub fn remove(&mut self, name: &str) -> IrResult<GlobalValue> {
        let idx = self
            .index
            .get(name)
            .copied()
            .ok_or_else(|| IrError::UnknownSymbol(name.to_string()))?;
        let value = self.values.remove(idx);
        self.reindex();
        Ok(value)
    }

    fn reindex(&mut self) {
        self.index.clear();
        for (i, v) in self.values.iter().enumerate() {
            self.index.insert(v.name().to_string(), i);
        }
    }

    /// Link `other` into this module.
    ///
    /// Symbols are matched by name. A declaration on either side resolves
    /// against a definition on the other; two definitions of the same name
    /// are a [`LinkError::DuplicateDefinition`]. On error this module may
    /// already contain part of `other`.
    pub fn link_in(&mut self, other: Module) -> Result<(), LinkError> {
        let from = other.name;
        for value in other.values {
            let Some(&idx) = self.index.get(value.name()) else {
                self.index.insert(value.name().to_string(), self.values.len());
                self.values.push(value);
                continue;
            };
            let existing = &mut self.values[idx];
            if existing.is_function() != value.is_function() {
                return Err(LinkError::KindMismatch {
                    name: value.name().to_string(),
                });
            }
            match (existing.is_declaration(), value.is_declaration()) {
                (_, true) => {}
                (true, false) => *existing = value,
                (false, false) => {
                    return Err(LinkError::DuplicateDefinition {
                        name: value.name().to_string(),
                        into: self.name.clone(),
                        from,
                    });
                }
            }
        }
        debug!("linked `{}` into `{}` ({} values)", from, self.name, self.values.len());
        Ok(())
    }

    /// Force every definition to internal linkage.
    pub fn internalize_definitions(&mut self) {
        for value in self.values.iter_mut().filter(|v| !v.is_declaration()) {
            value.set_linkage(Linkage::Internal);
        }
    }

    /// Check the module for dangling references and misplaced comdats.
    pub fn verify(&self) -> Result<(), Vec<VerifyError>> {
        let mut errors = Vec::new();
        for (i, value) in self.values.iter().enumerate() {
            if self.index.get(value.name()) != Some(&i) {
                errors.push(VerifyError::StaleIndex(value.name().to_string()));
            }
            if value.is_declaration() && value.comdat().is_some() {
                errors.push(VerifyError::ComdatOnDeclaration(value.name().to_string()));
            }
            for target in value.references() {
                if !self.contains(target) {
                    errors.push(VerifyError::UndefinedReference {
                        from: value.name().to_string(),
                        to: target.to_string(),
                    });
                }
            }
        }
        if self.index.len() != self.values.len() {
            errors.push(VerifyError::StaleIndex(self.name.clone()));
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
