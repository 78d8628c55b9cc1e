//! Symbol table with dot-scopes, procedure scopes, and pass discipline.

use std::collections::HashMap;

use crate::value::Value;

/// What created a binding, which fixes its redefinition rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    /// Fixed binding (EQU, DEFINE, `=` in EQU mode). Redefinition is an
    /// error.
    Equ,
    /// Reassignable binding (SET, DEFL, `=` in SET mode).
    Set,
    /// Address label, including procedure names.
    Label,
}

/// One named binding.
#[derive(Debug, Clone)]
pub struct Symbol {
    pub value: Value,
    pub kind: SymbolKind,
    /// Source position of the definition, for same-site checks across
    /// passes: (file id, line, macro expansion instance).
    pub site: (u32, u32, u32),
    /// Pass in which the symbol was last (re)defined.
    pub pass: u32,
    /// How many definitions this pass; more than one EQU/label per pass is
    /// a redefinition.
    pub defs_this_pass: u32,
    /// The defining expression referenced a symbol that was itself not yet
    /// resolved.
    pub unresolved: bool,
    /// The last (re)definition kept the previous value. Address-setting
    /// directives wait for their operands to stabilize before acting.
    pub stable: bool,
}

/// Flat table keyed by fully-qualified name (`Outer.Inner.name`).
#[derive(Debug, Default)]
pub struct SymbolTable {
    map: HashMap<String, Symbol>,
    /// Value changes observed in the current pass, for fixed-point
    /// detection.
    pub changed: bool,
}

/// Scope context for name resolution, innermost procedure first.
pub struct Scope<'a> {
    /// Full names of enclosing procedures, innermost last.
    pub procs: &'a [String],
    /// The current non-dot label, owner of `.name` references.
    pub global: Option<&'a str>,
}

impl SymbolTable {
    pub fn clear(&mut self) {
        self.map.clear();
        self.changed = false;
    }

    pub fn get(&self, qualified: &str) -> Option<&Symbol> {
        self.map.get(qualified)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Symbol)> {
        self.map.iter()
    }

    /// Resolve a reference to its fully-qualified name, or `None` when the
    /// name is not defined anywhere in scope.
    ///
    /// Resolution order: dot names bind to the innermost procedure scope
    /// (else the current global label); qualified names bind exactly;
    /// plain names search enclosing procedure scopes, then the global
    /// scope.
    pub fn resolve(&self, name: &str, scope: &Scope<'_>) -> Option<String> {
        if let Some(stripped) = name.strip_prefix('.') {
            let prefix = scope
                .procs
                .last()
                .map(String::as_str)
                .or(scope.global)?;
            let qualified = format!("{prefix}.{stripped}");
            return self.map.contains_key(&qualified).then_some(qualified);
        }
        if name.contains('.') {
            return self.map.contains_key(name).then(|| name.to_string());
        }
        for proc in scope.procs.iter().rev() {
            let qualified = format!("{proc}.{name}");
            if self.map.contains_key(&qualified) {
                return Some(qualified);
            }
        }
        self.map.contains_key(name).then(|| name.to_string())
    }

    /// Insert or update a binding. Returns an error message on illegal
    /// redefinition.
    pub fn define(
        &mut self,
        qualified: &str,
        value: Value,
        kind: SymbolKind,
        site: (u32, u32, u32),
        pass: u32,
        unresolved: bool,
    ) -> Result<(), String> {
        if let Some(existing) = self.map.get_mut(qualified) {
            let same_pass = existing.pass == pass;
            let redefinable = existing.kind == SymbolKind::Set && kind == SymbolKind::Set;
            if !redefinable {
                if existing.kind != kind {
                    return Err(format!(
                        "symbol {qualified} already defined with a different kind"
                    ));
                }
                if (same_pass && existing.defs_this_pass >= 1) || existing.site != site {
                    return Err(format!("symbol {qualified} redefined"));
                }
            }
            let same_value = existing.value == value;
            if !same_value {
                self.changed = true;
            }
            existing.stable = same_value;
            existing.value = value;
            existing.site = site;
            existing.unresolved = unresolved;
            existing.defs_this_pass = if same_pass { existing.defs_this_pass + 1 } else { 1 };
            existing.pass = pass;
            Ok(())
        } else {
            self.changed = true;
            self.map.insert(
                qualified.to_string(),
                Symbol {
                    value,
                    kind,
                    site,
                    pass,
                    defs_this_pass: 1,
                    unresolved,
                    stable: false,
                },
            );
            Ok(())
        }
    }
}
