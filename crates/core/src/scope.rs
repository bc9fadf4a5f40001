use indexmap::IndexMap;
use rustc_hash::FxHashSet;

use crate::def::DefId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScopeId(pub u32);

/// One symbol table: a name→definition map, a lexical parent, and the scopes
/// whose contents are transitively visible through `import`.
#[derive(Debug)]
pub struct Scope {
    pub parent: Option<ScopeId>,
    pub debug_name: String,
    names: IndexMap<String, DefId>,
    imports: Vec<ScopeId>,
}

/// Outcome of declaring a name in a scope.
pub enum Declared {
    Fresh(DefId),
    /// The name already exists locally; holds the earlier definition.
    Duplicate(DefId),
}

#[derive(Debug, Default)]
pub struct ScopePool {
    scopes: Vec<Scope>,
}

impl ScopePool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&mut self, parent: Option<ScopeId>, debug_name: impl Into<String>) -> ScopeId {
        let id = ScopeId(self.scopes.len() as u32);
        self.scopes.push(Scope {
            parent,
            debug_name: debug_name.into(),
            names: IndexMap::new(),
            imports: Vec::new(),
        });
        id
    }

    pub fn get(&self, id: ScopeId) -> &Scope {
        &self.scopes[id.0 as usize]
    }

    pub fn declare(&mut self, scope: ScopeId, name: &str, def: DefId) -> Declared {
        let scope = &mut self.scopes[scope.0 as usize];
        if let Some(existing) = scope.names.get(name) {
            return Declared::Duplicate(*existing);
        }
        scope.names.insert(name.to_string(), def);
        Declared::Fresh(def)
    }

    /// Idempotent; cycles between scopes are permitted, lookup uses a
    /// visited set.
    pub fn add_import(&mut self, scope: ScopeId, other: ScopeId) {
        let scope = &mut self.scopes[scope.0 as usize];
        if !scope.imports.contains(&other) {
            scope.imports.push(other);
        }
    }

    pub fn find_local(&self, scope: ScopeId, name: &str) -> Option<DefId> {
        self.get(scope).names.get(name).copied()
    }

    /// Local names plus everything reachable through imports. Results are
    /// deduplicated; more than one surviving entry means the name is
    /// ambiguous at this level.
    pub fn find_member(&self, scope: ScopeId, name: &str, out: &mut Vec<DefId>) {
        let mut visited = FxHashSet::default();
        self.collect(scope, name, &mut visited, out);
        out.dedup();
    }

    /// Walk the parent chain; the nearest level with any match wins.
    pub fn find_unqualified(&self, scope: ScopeId, name: &str, out: &mut Vec<DefId>) {
        let mut current = Some(scope);
        while let Some(id) = current {
            self.find_member(id, name, out);
            if !out.is_empty() {
                return;
            }
            current = self.get(id).parent;
        }
    }

    fn collect(
        &self,
        scope: ScopeId,
        name: &str,
        visited: &mut FxHashSet<ScopeId>,
        out: &mut Vec<DefId>,
    ) {
        if !visited.insert(scope) {
            return;
        }
        if let Some(def) = self.get(scope).names.get(name) {
            if !out.contains(def) {
                out.push(*def);
            }
        }
        for import in self.get(scope).imports.clone() {
            self.collect(import, name, visited, out);
        }
    }

    /// Stable iteration over a scope's own names, in declaration order.
    pub fn for_each_local(&self, scope: ScopeId, mut f: impl FnMut(&str, DefId)) {
        for (name, def) in &self.get(scope).names {
            f(name, *def);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn def(n: u32) -> DefId {
        DefId(n)
    }

    #[test]
    fn local_names_shadow_parents() {
        let mut pool = ScopePool::new();
        let outer = pool.create(None, "outer");
        let inner = pool.create(Some(outer), "inner");
        pool.declare(outer, "x", def(0));
        pool.declare(inner, "x", def(1));

        let mut results = Vec::new();
        pool.find_unqualified(inner, "x", &mut results);
        assert_eq!(results, vec![def(1)]);
    }

    #[test]
    fn duplicate_declarations_are_reported() {
        let mut pool = ScopePool::new();
        let scope = pool.create(None, "module");
        assert!(matches!(pool.declare(scope, "x", def(0)), Declared::Fresh(_)));
        assert!(matches!(
            pool.declare(scope, "x", def(1)),
            Declared::Duplicate(d) if d == def(0)
        ));
    }

    #[test]
    fn imports_are_transitive() {
        let mut pool = ScopePool::new();
        let a = pool.create(None, "a");
        let b = pool.create(None, "b");
        let c = pool.create(None, "c");
        pool.declare(c, "deep", def(7));
        pool.add_import(a, b);
        pool.add_import(b, c);

        let mut results = Vec::new();
        pool.find_member(a, "deep", &mut results);
        assert_eq!(results, vec![def(7)]);
    }

    #[test]
    fn import_cycles_terminate() {
        let mut pool = ScopePool::new();
        let a = pool.create(None, "a");
        let b = pool.create(None, "b");
        pool.add_import(a, b);
        pool.add_import(b, a);
        pool.declare(b, "x", def(3));

        let mut results = Vec::new();
        pool.find_member(a, "x", &mut results);
        assert_eq!(results, vec![def(3)]);
    }

    #[test]
    fn distinct_defs_from_diamond_imports_are_ambiguous() {
        let mut pool = ScopePool::new();
        let root = pool.create(None, "root");
        let left = pool.create(None, "left");
        let right = pool.create(None, "right");
        pool.declare(left, "x", def(1));
        pool.declare(right, "x", def(2));
        pool.add_import(root, left);
        pool.add_import(root, right);

        let mut results = Vec::new();
        pool.find_member(root, "x", &mut results);
        assert_eq!(results.len(), 2);
    }

    #[test]
    fn same_def_through_two_paths_is_not_ambiguous() {
        let mut pool = ScopePool::new();
        let root = pool.create(None, "root");
        let shared = pool.create(None, "shared");
        let relay = pool.create(None, "relay");
        pool.declare(shared, "x", def(5));
        pool.add_import(relay, shared);
        pool.add_import(root, shared);
        pool.add_import(root, relay);

        let mut results = Vec::new();
        pool.find_member(root, "x", &mut results);
        assert_eq!(results, vec![def(5)]);
    }

    #[test]
    fn member_lookup_ignores_parent_chain() {
        let mut pool = ScopePool::new();
        let outer = pool.create(None, "outer");
        let inner = pool.create(Some(outer), "inner");
        pool.declare(outer, "hidden", def(9));

        let mut results = Vec::new();
        pool.find_member(inner, "hidden", &mut results);
        assert!(results.is_empty());
    }
}
