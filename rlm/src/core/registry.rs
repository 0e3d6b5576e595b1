//! Name-keyed tool registry with a fixed reserved-name set.
//!
//! Both sides of the protocol use it: the worker records which host tools a
//! request may call, the host maps names to tool implementations.

use std::collections::BTreeMap;

/// Built-in single sub-query tool.
pub const LLM_QUERY: &str = "llm_query";
/// Built-in batched sub-query tool.
pub const LLM_QUERY_BATCHED: &str = "llm_query_batched";
/// Explicit final-output call available to evaluated code.
pub const SUBMIT: &str = "SUBMIT";
/// Session variable that signals completion when left set.
pub const FINAL_VAR: &str = "FINAL_ANSWER";
/// Generic indirection for calling a registered tool by name.
pub const CALL_TOOL: &str = "call_tool";

/// Helpers that are only callable outside the root profile.
pub const HELPER_NAMES: &[&str] = &[
    "peek",
    "grep",
    "split_text",
    "buffer_append",
    "buffer_read",
    "buffer_clear",
    "storage_read",
    "storage_write",
    "log_history",
    "history",
];

const BUILTIN_NAMES: &[&str] = &[
    LLM_QUERY,
    LLM_QUERY_BATCHED,
    SUBMIT,
    CALL_TOOL,
    "print",
    "debug",
];

/// Whether `name` belongs to the runtime and cannot be claimed by a caller tool.
pub fn is_reserved(name: &str) -> bool {
    BUILTIN_NAMES.contains(&name) || HELPER_NAMES.contains(&name)
}

/// Script core functions a per-name tool binding would shadow. Tools with
/// these names stay reachable through [`CALL_TOOL`] only.
const SCRIPT_CORE_NAMES: &[&str] = &[
    "len",
    "type_of",
    "is_def_fn",
    "is_def_var",
    "is_shared",
    "eval",
    "Fn",
    "call",
    "curry",
    "to_string",
    "to_debug",
    "to_int",
    "to_float",
    "to_char",
    "to_array",
    "to_blob",
    "parse_int",
    "parse_float",
    "range",
    "keys",
    "values",
    "push",
    "pop",
    "shift",
    "insert",
    "remove",
    "clear",
    "contains",
    "index_of",
    "split",
    "trim",
    "sub_string",
    "chars",
    "map",
    "filter",
    "reduce",
    "sort",
    "reverse",
    "abs",
    "sign",
    "min",
    "max",
    "sleep",
    "timestamp",
    "tag",
];

/// Whether `name` can be bound directly as a function in evaluated code.
pub fn is_bindable(name: &str) -> bool {
    is_identifier(name) && !SCRIPT_CORE_NAMES.contains(&name)
}

/// Whether `name` can be bound as a function identifier in evaluated code.
pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Outcome of [`ToolRegistry::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Registered,
    /// A previous entry with the same name was replaced.
    Replaced,
    /// The name is reserved; the entry was dropped.
    SkippedReserved,
    /// Empty names are never registered.
    SkippedEmpty,
}

impl Registration {
    pub fn is_active(self) -> bool {
        matches!(self, Registration::Registered | Registration::Replaced)
    }
}

#[derive(Debug, Clone)]
pub struct ToolRegistry<T> {
    entries: BTreeMap<String, T>,
}

impl<T> Default for ToolRegistry<T> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }
}

impl<T> ToolRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `entry` under `name` unless the name is reserved or empty.
    pub fn register(&mut self, name: &str, entry: T) -> Registration {
        let name = name.trim();
        if name.is_empty() {
            return Registration::SkippedEmpty;
        }
        if is_reserved(name) {
            return Registration::SkippedReserved;
        }
        match self.entries.insert(name.to_string(), entry) {
            Some(_) => Registration::Replaced,
            None => Registration::Registered,
        }
    }

    pub fn get(&self, name: &str) -> Option<&T> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Registered names in sorted order.
    pub fn names(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_names_cannot_be_registered() {
        let mut registry = ToolRegistry::new();
        assert_eq!(
            registry.register(LLM_QUERY, ()),
            Registration::SkippedReserved
        );
        assert_eq!(registry.register("print", ()), Registration::SkippedReserved);
        assert_eq!(registry.register("peek", ()), Registration::SkippedReserved);
        assert_eq!(registry.register("  ", ()), Registration::SkippedEmpty);
        assert!(registry.is_empty());
    }

    #[test]
    fn register_and_replace() {
        let mut registry = ToolRegistry::new();
        assert_eq!(registry.register("search", 1), Registration::Registered);
        assert_eq!(registry.register("search", 2), Registration::Replaced);
        assert_eq!(registry.register("fetch", 3), Registration::Registered);
        assert_eq!(registry.get("search"), Some(&2));
        assert_eq!(registry.names(), vec!["fetch".to_string(), "search".to_string()]);
    }

    #[test]
    fn script_core_names_are_not_bindable() {
        assert!(is_bindable("search_docs"));
        assert!(!is_bindable("len"));
        assert!(!is_bindable("type_of"));
        assert!(!is_bindable("my-tool"));
    }

    #[test]
    fn identifier_check() {
        assert!(is_identifier("search_docs"));
        assert!(is_identifier("_x1"));
        assert!(!is_identifier("1x"));
        assert!(!is_identifier("web-search"));
        assert!(!is_identifier(""));
    }
}
