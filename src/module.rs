// File: src/module.rs
//
// Module resolution for `import("name")`.
// The host registers importables in a ModuleMap: raw uGO source (compiled
// recursively) or a ready value (builtin modules). An optional module
// path provides a filesystem fallback for `<dir>/<name>.ugo`.

use crate::value::Value;
use ahash::AHashMap;
use std::fs;
use std::path::PathBuf;

/// Key a builtin module's export map carries so scripts and tooling can
/// recover the module name.
pub const MODULE_NAME_KEY: &str = "__module_name__";

/// What an import resolves to before compilation.
#[derive(Debug, Clone)]
pub enum Importable {
    /// uGO source; the compiler compiles it into a module function.
    Source(Vec<u8>),
    /// A ready value, stored directly in the module cache.
    Value(Value),
}

/// Host-provided module registry with optional filesystem fallback.
#[derive(Debug, Default, Clone)]
pub struct ModuleMap {
    modules: AHashMap<String, Importable>,
    module_path: Option<PathBuf>,
}

impl ModuleMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Directory searched for `<name>.ugo` when no explicit entry exists.
    pub fn with_module_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.module_path = Some(path.into());
        self
    }

    pub fn add_source(&mut self, name: impl Into<String>, source: impl Into<Vec<u8>>) {
        self.modules.insert(name.into(), Importable::Source(source.into()));
    }

    /// Registers a ready module value. Map values get the module name
    /// injected under MODULE_NAME_KEY.
    pub fn add_value(&mut self, name: impl Into<String>, value: Value) {
        let name = name.into();
        if let Value::Map(map) = &value {
            map.lock()
                .unwrap()
                .insert(MODULE_NAME_KEY.to_string(), Value::string(name.as_str()));
        }
        self.modules.insert(name, Importable::Value(value));
    }

    pub fn get(&self, name: &str) -> Option<Importable> {
        if let Some(importable) = self.modules.get(name) {
            return Some(importable.clone());
        }
        let dir = self.module_path.as_ref()?;
        let path = dir.join(format!("{}.ugo", name));
        fs::read(path).ok().map(Importable::Source)
    }
}

/// Kind tag of a compile-time module store entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleKind {
    Source,
    Object,
}

/// Compile-time record of one imported module: where its compiled form or
/// value lives in the constant pool, and its runtime cache slot.
#[derive(Debug, Clone)]
pub struct ModuleStoreItem {
    pub kind: ModuleKind,
    pub constant_index: usize,
    pub module_index: usize,
}

/// One entry per module across the entire compilation, nested imports
/// included.
#[derive(Debug, Default)]
pub struct ModuleStore {
    items: AHashMap<String, ModuleStoreItem>,
}

impl ModuleStore {
    pub fn get(&self, name: &str) -> Option<&ModuleStoreItem> {
        self.items.get(name)
    }

    /// Registers a module, assigning the next runtime cache slot.
    pub fn insert(&mut self, name: &str, kind: ModuleKind, constant_index: usize) -> ModuleStoreItem {
        let item = ModuleStoreItem { kind, constant_index, module_index: self.items.len() };
        self.items.insert(name.to_string(), item.clone());
        item
    }

    pub fn count(&self) -> usize {
        self.items.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_module_gets_name_key() {
        let mut map = ModuleMap::new();
        map.add_value("answers", Value::empty_map());
        let Some(Importable::Value(value)) = map.get("answers") else {
            panic!("expected value importable");
        };
        assert_eq!(
            value.index_get(&Value::string(MODULE_NAME_KEY)).unwrap(),
            Value::string("answers")
        );
    }

    #[test]
    fn test_store_assigns_sequential_slots() {
        let mut store = ModuleStore::default();
        let a = store.insert("a", ModuleKind::Source, 3);
        let b = store.insert("b", ModuleKind::Object, 7);
        assert_eq!(a.module_index, 0);
        assert_eq!(b.module_index, 1);
        assert_eq!(store.count(), 2);
        assert_eq!(store.get("a").unwrap().constant_index, 3);
        assert!(store.get("c").is_none());
    }

    #[test]
    fn test_missing_module() {
        let map = ModuleMap::new();
        assert!(map.get("nope").is_none());
    }
}
