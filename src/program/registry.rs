//! Semantic → variable table owned by a program
//!
//! Variables live in an arena and are addressed by [`VariableId`]; several
//! semantics may point at the same variable. Kernel modules only see the
//! read-only [`VariableResolver`] side, variable creation goes through
//! [`SemanticBinder`].

use crate::error::{Result, RuntimeError, fail};
use crate::variable::{Variable, VariableId};
use id_arena::Arena;
use indexmap::IndexMap;

/// Registration side of a program
pub trait SemanticBinder {
    /// Take ownership of `variable` and make it reachable as `semantic`
    fn register(&mut self, semantic: &str, variable: Variable) -> Result<VariableId>;

    /// Point `semantic` at an already registered variable
    ///
    /// Returns whether the mapping changed.
    fn connect(&mut self, semantic: &str, id: VariableId) -> Result<bool>;
}

/// Lookup side of a program
pub trait VariableResolver {
    fn resolve_id(&self, semantic: &str) -> Option<VariableId>;

    fn variable(&self, id: VariableId) -> Option<&Variable>;

    fn resolve(&self, semantic: &str) -> Option<&Variable> {
        self.resolve_id(semantic).and_then(|id| self.variable(id))
    }
}

#[derive(Debug, Default)]
pub struct SemanticRegistry {
    arena: Arena<Variable>,
    semantics: IndexMap<String, VariableId>,
}

impl SemanticRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_mut(&mut self, id: VariableId) -> Option<&mut Variable> {
        self.arena.get_mut(id)
    }

    pub fn resolve_mut(&mut self, semantic: &str) -> Option<&mut Variable> {
        let id = *self.semantics.get(semantic)?;
        self.arena.get_mut(id)
    }

    /// Semantics in registration order
    pub fn semantics(&self) -> impl Iterator<Item = (&str, VariableId)> + '_ {
        self.semantics.iter().map(|(name, id)| (name.as_str(), *id))
    }

    /// Every owned variable, including ones no semantic points at anymore
    pub fn iter(&self) -> impl Iterator<Item = (VariableId, &Variable)> + '_ {
        self.arena.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (VariableId, &mut Variable)> + '_ {
        self.arena.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.len() == 0
    }
}

impl SemanticBinder for SemanticRegistry {
    fn register(&mut self, semantic: &str, variable: Variable) -> Result<VariableId> {
        if semantic.is_empty() {
            return fail(RuntimeError::EmptySemantic);
        }
        let id = self.arena.alloc(variable);
        self.connect(semantic, id)?;
        Ok(id)
    }

    fn connect(&mut self, semantic: &str, id: VariableId) -> Result<bool> {
        if semantic.is_empty() {
            return fail(RuntimeError::EmptySemantic);
        }
        let previous = self.semantics.insert(semantic.to_string(), id);
        if previous == Some(id) {
            return Ok(false);
        }
        if let Some(old) = previous.and_then(|old| self.arena.get_mut(old)) {
            old.remove_semantic(semantic);
        }
        if let Some(var) = self.arena.get_mut(id) {
            var.add_semantic(semantic);
        }
        tracing::debug!("Semantic `{}` connected", semantic);
        Ok(true)
    }
}

impl VariableResolver for SemanticRegistry {
    fn resolve_id(&self, semantic: &str) -> Option<VariableId> {
        self.semantics.get(semantic).copied()
    }

    fn variable(&self, id: VariableId) -> Option<&Variable> {
        self.arena.get(id)
    }
}
