// File: src/symbol_table.rs
//
// Lexical symbol table for the uGO compiler.
// Scopes form a tree: block scopes share their parent's slot counter and
// propagate the high-water mark upward; function scopes reset local slots
// and materialize free symbols for captures that cross them.

use crate::builtins::BuiltinFunction;
use ahash::{AHashMap, AHashSet};

/// Per-function limit on local slots; GetLocal carries a 1-byte operand.
pub const MAX_LOCALS: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolScope {
    Global,
    Local,
    Builtin,
    Free,
}

/// A resolved identifier: where it lives and which slot it occupies.
#[derive(Debug, Clone)]
pub struct Symbol {
    pub name: String,
    pub index: u16,
    pub scope: SymbolScope,
    pub assigned: bool,
    pub constant: bool,
    /// For Free symbols: the symbol in the enclosing function this one
    /// captures. The chain always bottoms out at a Local.
    pub original: Option<Box<Symbol>>,
}

impl Symbol {
    fn new(name: impl Into<String>, index: u16, scope: SymbolScope) -> Self {
        Self {
            name: name.into(),
            index,
            scope,
            assigned: false,
            constant: false,
            original: None,
        }
    }
}

/// One scope in the tree. The compiler owns the current innermost scope
/// and swaps through `enter_block` / `enter_function` / `leave`.
#[derive(Debug, Default)]
pub struct SymbolTable {
    parent: Option<Box<SymbolTable>>,
    /// Block scopes share slots with the enclosing function scope.
    block: bool,
    store: AHashMap<String, Symbol>,
    /// Function scopes only: captured symbols in enclosing-scope view,
    /// ordered by free index.
    free_symbols: Vec<Symbol>,
    next_index: u16,
    max_symbols: u16,
    num_params: u16,
    /// Burned slot indices that next_index must never hand out again:
    /// captured block locals whose cells outlive the block.
    skips: AHashSet<u16>,
    disabled_builtins: AHashSet<String>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub fn in_block(&self) -> bool {
        self.block
    }

    /// Slot count the VM must provision for this function.
    pub fn max_symbols(&self) -> u16 {
        self.max_symbols
    }

    pub fn num_params(&self) -> u16 {
        self.num_params
    }

    pub fn free_symbols(&self) -> &[Symbol] {
        &self.free_symbols
    }

    /// Opens a child block scope, consuming self as the parent.
    pub fn enter_block(self) -> SymbolTable {
        let next_index = self.next_index;
        SymbolTable {
            parent: Some(Box::new(self)),
            block: true,
            next_index,
            ..Default::default()
        }
    }

    /// Opens a child function scope: fresh slots, fresh capture list.
    pub fn enter_function(self) -> SymbolTable {
        SymbolTable {
            parent: Some(Box::new(self)),
            block: false,
            ..Default::default()
        }
    }

    /// Closes the current scope and returns the parent. Block scopes
    /// propagate their slot high-water mark; sibling blocks reuse slots.
    pub fn leave(self) -> Option<SymbolTable> {
        let mut parent = self.parent?;
        if self.block {
            parent.max_symbols = parent.max_symbols.max(self.max_symbols);
        }
        Some(*parent)
    }

    fn is_skipped(&self, index: u16) -> bool {
        if self.skips.contains(&index) {
            return true;
        }
        if self.block {
            if let Some(parent) = &self.parent {
                return parent.is_skipped(index);
            }
        }
        false
    }

    /// Marks a slot as never reusable; bubbles to the owning function
    /// scope so every sibling block sees it.
    fn burn_index(&mut self, index: u16) {
        if self.block {
            if let Some(parent) = &mut self.parent {
                parent.burn_index(index);
                return;
            }
        }
        self.skips.insert(index);
    }

    fn next_index(&mut self) -> u16 {
        loop {
            let index = self.next_index;
            self.next_index += 1;
            if !self.is_skipped(index) {
                self.max_symbols = self.max_symbols.max(self.next_index);
                return index;
            }
        }
    }

    /// Defines (or re-finds) a local in the current scope. Returns the
    /// symbol and whether it already existed here.
    pub fn define_local(&mut self, name: &str) -> Result<(Symbol, bool), String> {
        if let Some(existing) = self.store.get(name) {
            return Ok((existing.clone(), true));
        }
        if self.next_index as usize >= MAX_LOCALS {
            return Err(format!(
                "SymbolLimit: function exceeds {} local symbols",
                MAX_LOCALS
            ));
        }
        let index = self.next_index();
        let symbol = Symbol::new(name, index, SymbolScope::Local);
        self.store.insert(name.to_string(), symbol.clone());
        Ok((symbol, false))
    }

    /// Defines a global name; root scope only, duplicates are an error.
    pub fn define_global(&mut self, name: &str) -> Result<Symbol, String> {
        if !self.is_root() {
            return Err("global declarations are only allowed at the top scope".into());
        }
        if let Some(existing) = self.store.get(name) {
            if existing.scope == SymbolScope::Global {
                return Err(format!("'{}' is redeclared as global", name));
            }
            return Err(format!("'{}' is already declared", name));
        }
        let symbol = Symbol::new(name, 0, SymbolScope::Global);
        self.store.insert(name.to_string(), symbol.clone());
        Ok(symbol)
    }

    /// Registers the function's parameters; the first k locals. May only
    /// run once per function scope, before any local is defined.
    pub fn set_params(&mut self, names: &[String]) -> Result<(), String> {
        if self.num_params != 0 || self.next_index != 0 {
            return Err("multiple param declarations".into());
        }
        if names.len() > MAX_LOCALS {
            return Err(format!(
                "SymbolLimit: function exceeds {} parameters",
                MAX_LOCALS
            ));
        }
        for name in names {
            if self.store.contains_key(name) {
                return Err(format!("'{}' is redeclared as parameter", name));
            }
            let index = self.next_index();
            self.store
                .insert(name.clone(), Symbol::new(name.as_str(), index, SymbolScope::Local));
        }
        self.num_params = names.len() as u16;
        Ok(())
    }

    /// Resolves a name, materializing free symbols at every function
    /// boundary crossed between the reference and the definition.
    pub fn resolve(&mut self, name: &str) -> Option<Symbol> {
        self.resolve_impl(name, false)
    }

    fn resolve_impl(&mut self, name: &str, mut builtins_disabled: bool) -> Option<Symbol> {
        if let Some(symbol) = self.store.get(name) {
            return Some(symbol.clone());
        }
        builtins_disabled = builtins_disabled || self.disabled_builtins.contains(name);
        match self.parent.as_mut() {
            Some(parent) => {
                let outer = parent.resolve_impl(name, builtins_disabled)?;
                match outer.scope {
                    SymbolScope::Local | SymbolScope::Free if !self.block => {
                        if outer.scope == SymbolScope::Local {
                            // The captured slot outlives its block; its
                            // index must never be reused there.
                            parent.burn_index(outer.index);
                        }
                        Some(self.define_free(outer))
                    }
                    _ => Some(outer),
                }
            }
            None => {
                if builtins_disabled {
                    return None;
                }
                BuiltinFunction::lookup(name).map(|b| {
                    Symbol::new(name, b.id() as u16, SymbolScope::Builtin)
                })
            }
        }
    }

    fn define_free(&mut self, original: Symbol) -> Symbol {
        let index = self.free_symbols.len() as u16;
        let mut symbol = Symbol::new(original.name.as_str(), index, SymbolScope::Free);
        symbol.constant = original.constant;
        symbol.assigned = original.assigned;
        symbol.original = Some(Box::new(original.clone()));
        self.free_symbols.push(original);
        self.store.insert(symbol.name.clone(), symbol.clone());
        symbol
    }

    /// Prevents the named builtins from resolving in this scope and any
    /// scope below it.
    pub fn disable_builtin<I, S>(&mut self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for name in names {
            self.disabled_builtins.insert(name.into());
        }
    }

    /// Flags a symbol defined in this scope as constant.
    pub fn mark_constant(&mut self, name: &str) {
        if let Some(symbol) = self.store.get_mut(name) {
            symbol.constant = true;
        }
    }

    /// Flags a symbol defined in this scope as assigned.
    pub fn mark_assigned(&mut self, name: &str) {
        if let Some(symbol) = self.store.get_mut(name) {
            symbol.assigned = true;
        }
    }

    /// Locals defined directly in this scope with their slot indices,
    /// ordered by slot. Synthetic compiler locals (leading ':') are
    /// skipped. Used by the Eval helper to carry locals across fragments.
    pub fn local_names_by_index(&self) -> Vec<(String, u16)> {
        let mut out: Vec<(String, u16)> = self
            .store
            .iter()
            .filter(|(name, symbol)| {
                symbol.scope == SymbolScope::Local && !name.starts_with(':')
            })
            .map(|(name, symbol)| (name.clone(), symbol.index))
            .collect();
        out.sort_by_key(|(_, index)| *index);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_scopes_share_slots() {
        let mut root = SymbolTable::new();
        let (a, _) = root.define_local("a").unwrap();
        assert_eq!(a.index, 0);

        let mut block = root.enter_block();
        let (b, _) = block.define_local("b").unwrap();
        assert_eq!(b.index, 1);

        // A sibling block reuses the slot after the first block exits.
        let mut root = block.leave().unwrap();
        assert_eq!(root.max_symbols(), 2);
        let mut sibling = root.enter_block();
        let (c, _) = sibling.define_local("c").unwrap();
        assert_eq!(c.index, 1);
    }

    #[test]
    fn test_function_scope_resets_slots() {
        let mut root = SymbolTable::new();
        root.define_local("a").unwrap();
        let mut func = root.enter_function();
        let (x, _) = func.define_local("x").unwrap();
        assert_eq!(x.index, 0);
        assert_eq!(x.scope, SymbolScope::Local);
    }

    #[test]
    fn test_capture_materializes_free_symbol() {
        let mut root = SymbolTable::new();
        root.define_local("n").unwrap();
        let mut func = root.enter_function();
        let captured = func.resolve("n").unwrap();
        assert_eq!(captured.scope, SymbolScope::Free);
        assert_eq!(captured.index, 0);
        let original = captured.original.as_ref().unwrap();
        assert_eq!(original.scope, SymbolScope::Local);
        assert_eq!(original.index, 0);
        // De-duplicated on second resolution.
        let again = func.resolve("n").unwrap();
        assert_eq!(again.index, 0);
        assert_eq!(func.free_symbols().len(), 1);
    }

    #[test]
    fn test_nested_capture_chains_originals() {
        let mut root = SymbolTable::new();
        root.define_local("n").unwrap();
        let middle = root.enter_function();
        let mut inner = middle.enter_function();
        let symbol = inner.resolve("n").unwrap();
        assert_eq!(symbol.scope, SymbolScope::Free);
        let original = symbol.original.as_ref().unwrap();
        assert_eq!(original.scope, SymbolScope::Free);
        let root_original = original.original.as_ref().unwrap();
        assert_eq!(root_original.scope, SymbolScope::Local);
    }

    #[test]
    fn test_captured_block_local_burns_slot() {
        let mut root = SymbolTable::new();
        root.define_local("a").unwrap();

        let mut block = root.enter_block();
        let (b, _) = block.define_local("b").unwrap();
        assert_eq!(b.index, 1);

        // An inner closure captures the block local.
        let func = block.enter_function();
        let mut func = func;
        assert_eq!(func.resolve("b").unwrap().scope, SymbolScope::Free);
        let block = func.leave().unwrap();
        let mut root = block.leave().unwrap();

        // The captured slot is burned: a sibling block skips index 1.
        let mut sibling = root.enter_block();
        let (c, _) = sibling.define_local("c").unwrap();
        assert_eq!(c.index, 2);
    }

    #[test]
    fn test_builtin_resolution_and_disable() {
        let mut root = SymbolTable::new();
        let symbol = root.resolve("len").unwrap();
        assert_eq!(symbol.scope, SymbolScope::Builtin);

        root.disable_builtin(["len"]);
        assert!(root.resolve("len").is_none());

        // Disabling is inherited through blocks.
        let mut block = root.enter_block();
        assert!(block.resolve("len").is_none());
        assert!(block.resolve("println").is_some());
    }

    #[test]
    fn test_global_rules() {
        let mut root = SymbolTable::new();
        root.define_global("g").unwrap();
        assert!(root.define_global("g").is_err());
        let mut func = root.enter_function();
        assert!(func.define_global("h").is_err());
        // Globals pass through function boundaries uncaptured.
        assert_eq!(func.resolve("g").unwrap().scope, SymbolScope::Global);
    }

    #[test]
    fn test_symbol_limit() {
        let mut root = SymbolTable::new();
        for i in 0..MAX_LOCALS {
            root.define_local(&format!("v{}", i)).unwrap();
        }
        let err = root.define_local("overflow").unwrap_err();
        assert!(err.contains("SymbolLimit"));
    }

    #[test]
    fn test_params_are_first_locals() {
        let root = SymbolTable::new();
        let mut func = root.enter_function();
        func.set_params(&["a".into(), "b".into()]).unwrap();
        assert_eq!(func.num_params(), 2);
        assert_eq!(func.resolve("a").unwrap().index, 0);
        assert_eq!(func.resolve("b").unwrap().index, 1);
        let (local, _) = func.define_local("c").unwrap();
        assert_eq!(local.index, 2);
        assert!(func.set_params(&["x".into()]).is_err());
    }
}
