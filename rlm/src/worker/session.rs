//! Session state owned by the worker loop.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use rhai::{AST, Dynamic, Scope};

use crate::core::registry::FINAL_VAR;

/// Named buffers and the execution-history log.
///
/// Shared with helper closures through `Rc<RefCell<..>>` because the scope is
/// mutably borrowed by the engine while helpers run.
#[derive(Debug, Default)]
pub struct Scratch {
    pub buffers: BTreeMap<String, String>,
    pub history: Vec<String>,
}

/// Everything that survives between requests on one worker.
///
/// Only the worker loop touches this; the host observes it indirectly through
/// responses.
pub struct SessionState {
    scope: Scope<'static>,
    library: AST,
    scratch: Rc<RefCell<Scratch>>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionState {
    pub fn new() -> Self {
        Self {
            scope: Scope::new(),
            library: AST::empty(),
            scratch: Rc::new(RefCell::new(Scratch::default())),
        }
    }

    /// Set `name`, creating it if needed. Constants are left untouched.
    ///
    /// Returns `false` when `name` is a constant and could not be updated.
    pub fn set(&mut self, name: &str, value: Dynamic) -> bool {
        if self.scope.is_constant(name) == Some(true) {
            return false;
        }
        self.scope.set_value(name.to_string(), value);
        true
    }

    pub fn get(&self, name: &str) -> Option<Dynamic> {
        self.scope.get_value::<Dynamic>(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.scope.contains(name)
    }

    /// Remove every binding of the implicit completion variable.
    ///
    /// Returns the most recent value, if any was set.
    pub fn take_final_var(&mut self) -> Option<Dynamic> {
        let mut latest = None;
        while let Some(value) = self.scope.remove::<Dynamic>(FINAL_VAR) {
            if latest.is_none() {
                latest = Some(value);
            }
        }
        latest
    }

    /// Sorted, de-duplicated names of the session variables.
    pub fn variable_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .scope
            .iter()
            .map(|(name, _, _)| name.to_string())
            .collect();
        names.sort();
        names.dedup();
        names
    }

    pub(crate) fn scope_mut(&mut self) -> &mut Scope<'static> {
        &mut self.scope
    }

    /// Script functions defined by earlier requests.
    pub(crate) fn library(&self) -> &AST {
        &self.library
    }

    /// Keep the function definitions of `ast` for later requests.
    pub(crate) fn remember_functions(&mut self, ast: &AST) {
        self.library = self.library.merge(&ast.clone_functions_only());
    }

    pub(crate) fn scratch(&self) -> Rc<RefCell<Scratch>> {
        Rc::clone(&self.scratch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_get_round_trip() {
        let mut state = SessionState::new();
        assert!(state.set("x", Dynamic::from(3_i64)));
        assert_eq!(state.get("x").and_then(|v| v.as_int().ok()), Some(3));
        assert!(state.set("x", Dynamic::from(4_i64)));
        assert_eq!(state.get("x").and_then(|v| v.as_int().ok()), Some(4));
        assert_eq!(state.variable_names(), vec!["x".to_string()]);
    }

    #[test]
    fn take_final_var_clears_shadowed_bindings() {
        let mut state = SessionState::new();
        state.scope_mut().push(FINAL_VAR, Dynamic::from(1_i64));
        state.scope_mut().push(FINAL_VAR, Dynamic::from(2_i64));

        let latest = state.take_final_var().expect("final var");
        assert_eq!(latest.as_int().ok(), Some(2));
        assert!(!state.contains(FINAL_VAR));
        assert!(state.take_final_var().is_none());
    }

    #[test]
    fn constants_are_not_overwritten() {
        let mut state = SessionState::new();
        state.scope_mut().push_constant("LIMIT", Dynamic::from(10_i64));
        assert!(!state.set("LIMIT", Dynamic::from(1_i64)));
        assert_eq!(state.get("LIMIT").and_then(|v| v.as_int().ok()), Some(10));
    }
}
