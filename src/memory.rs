// (C) 2020 Brandon Lewis
//
// The memory manager: a pool of reusable scopes, the active scope
// stack, the persistent global scope, a weak name->scope index so
// callable bodies can rebind into their defining scope, and a small
// recent-access cache that short-circuits top-of-stack lookups.
//
// Name lookups walk the active list from most recent to oldest and
// fall through to the global scope. Mutations respect the permissions
// of the scope that actually holds the binding. A scope released back
// to the pool is cleared before reuse.
//
// User code is single-threaded, so exclusive access (&mut) is the only
// synchronization this structure needs; the atomic identifier counter
// lives in `ident`.

use std::collections::{HashMap, VecDeque};
use std::rc::{Rc, Weak};

use crate::error::{self, Result};
use crate::ident::DataId;
use crate::scope::{OpMode, Scope, ScopeRef};
use crate::value::{Data, DataRef};

pub const INITIAL_POOL_SIZE: usize = 10;
pub const DEFAULT_SCOPE_PREFIX: &str = "SCOPE-";
pub const GLOBAL_SCOPE: &str = "GlobalScope";
pub const MAIN_SCOPE: &str = "MainScope";


pub struct Memory {
    free: VecDeque<ScopeRef>,
    active: Vec<ScopeRef>,
    named: HashMap<String, Weak<std::cell::RefCell<Scope>>>,
    global: ScopeRef,
    cache: HashMap<String, (DataId, Weak<Data>)>,
    next_default_id: usize,
    pub main_scope_name: String,
}

impl Memory {
    pub fn new() -> Memory {
        let mut mem = Memory {
            free: VecDeque::new(),
            active: Vec::new(),
            named: HashMap::new(),
            global: Rc::new(std::cell::RefCell::new(Scope::new(GLOBAL_SCOPE))),
            cache: HashMap::new(),
            next_default_id: 0,
            main_scope_name: MAIN_SCOPE.to_string(),
        };
        mem.expand_pool(INITIAL_POOL_SIZE);
        mem
    }

    fn expand_pool(&mut self, size: usize) {
        for _ in 0..size {
            self.free
                .push_back(Rc::new(std::cell::RefCell::new(Scope::new(""))));
        }
    }

    // --- scope lifecycle ---------------------------------------------------

    // Take a scope from the pool, name it, push it active, and index
    // it. Anonymous acquisitions get `<prefix><next-default-id>`.
    pub fn acquire_scope(&mut self, prefix: &str, name: Option<&str>) -> ScopeRef {
        if self.free.is_empty() {
            self.expand_pool(INITIAL_POOL_SIZE);
        }
        let scope = self.free.pop_front().expect("pool was just expanded");
        let full_name = match name {
            Some(n) => format!("{}{}", prefix, n),
            None => {
                self.next_default_id += 1;
                format!("{}{}", prefix, self.next_default_id)
            }
        };
        scope.borrow_mut().set_name(&full_name);
        self.named.insert(full_name, Rc::downgrade(&scope));
        self.active.push(scope.clone());
        scope
    }

    // Clear the top scope and return it to the pool.
    pub fn release_top_scope(&mut self) {
        if let Some(scope) = self.active.pop() {
            self.recycle(scope);
        }
    }

    // Clear the given scope wherever it sits in the active list.
    pub fn release_scope(&mut self, target: &ScopeRef) {
        if let Some(pos) = self.active.iter().position(|s| Rc::ptr_eq(s, target)) {
            let scope = self.active.remove(pos);
            self.recycle(scope);
        }
    }

    fn recycle(&mut self, scope: ScopeRef) {
        self.named.remove(&scope.borrow().name().to_string());
        scope.borrow_mut().clear();
        self.cache.clear();
        self.free.push_back(scope);
    }

    // Detach a scope from the active list without clearing it. Used
    // for scopes whose lifetime outlives the block that created them,
    // like extension export scopes.
    pub fn detach_scope(&mut self, target: &ScopeRef) {
        if let Some(pos) = self.active.iter().position(|s| Rc::ptr_eq(s, target)) {
            self.active.remove(pos);
            self.cache.clear();
        }
    }

    pub fn current_scope(&self) -> Option<ScopeRef> {
        self.active.last().cloned()
    }

    pub fn has_active_scope(&self) -> bool {
        !self.active.is_empty()
    }

    pub fn active_scope_count(&self) -> usize {
        self.active.len()
    }

    pub fn free_scope_count(&self) -> usize {
        self.free.len()
    }

    pub fn free_pool_contains(&self, target: &ScopeRef) -> usize {
        self.free.iter().filter(|s| Rc::ptr_eq(s, target)).count()
    }

    pub fn global_scope(&self) -> &ScopeRef {
        &self.global
    }

    pub fn scope_exists(&self, name: &str) -> bool {
        self.find_scope_by_name(name).is_some()
    }

    pub fn find_scope_by_name(&self, name: &str) -> Option<ScopeRef> {
        if name == GLOBAL_SCOPE {
            return Some(self.global.clone());
        }
        self.named.get(name).and_then(|w| w.upgrade())
    }

    // Raise the named scope to the top of the active list, for
    // method-dispatch style rebinding.
    pub fn set_current_scope_by_name(&mut self, name: &str) -> Result<()> {
        let pos = self
            .active
            .iter()
            .position(|s| s.borrow().name() == name)
            .ok_or_else(|| {
                error::Error::new(
                    error::ErrorKind::Memory,
                    error::UNKNOWN,
                    error::UNKNOWN,
                    vec![format!("No active scope is named \"{}\".", name)],
                    vec!["Only scopes on the active list can become current.".to_string()],
                )
            })?;
        let scope = self.active.remove(pos);
        self.active.push(scope);
        self.cache.clear();
        Ok(())
    }

    pub fn clear_all_scopes(&mut self) {
        while let Some(scope) = self.active.pop() {
            self.named.remove(&scope.borrow().name().to_string());
            scope.borrow_mut().clear();
            self.free.push_back(scope);
        }
        self.global.borrow_mut().clear();
        self.cache.clear();
        self.next_default_id = 0;
    }

    // --- data --------------------------------------------------------------

    // Add into the named scope, or the current scope when no name is
    // given.
    pub fn add_data(
        &mut self,
        name: &str,
        data: DataRef,
        scope_name: &str,
    ) -> Result<(DataId, DataRef)> {
        let scope = if scope_name.is_empty() {
            self.current_scope().unwrap_or_else(|| self.global.clone())
        } else {
            self.find_scope_by_name(scope_name).ok_or_else(|| {
                error::Error::new(
                    error::ErrorKind::Memory,
                    error::UNKNOWN,
                    error::UNKNOWN,
                    vec![format!("No scope is named \"{}\".", scope_name)],
                    vec!["Create the scope before adding data into it.".to_string()],
                )
            })?
        };
        self.cache.remove(name);
        let result = scope.borrow_mut().add_by_name(name, data);
        result
    }

    pub fn add_global_data(&mut self, name: &str, data: DataRef) -> Result<(DataId, DataRef)> {
        self.cache.remove(name);
        self.global.borrow_mut().add_by_name(name, data)
    }

    pub fn add_global_data_batch(&mut self, batch: Vec<(&str, DataRef)>) -> Result<()> {
        for (name, data) in batch {
            self.add_global_data(name, data)?;
        }
        Ok(())
    }

    pub fn find_data_by_name(&mut self, name: &str) -> Option<(DataId, DataRef)> {
        let cached = self
            .cache
            .get(name)
            .map(|(id, weak)| (id.clone(), weak.clone()));
        if let Some((id, weak)) = cached {
            if let Some(data) = weak.upgrade() {
                return Some((id, data));
            }
            self.cache.remove(name);
        }
        let found = self.find_uncached(name)?;
        self.cache
            .insert(name.to_string(), (found.0.clone(), Rc::downgrade(&found.1)));
        Some(found)
    }

    fn find_uncached(&self, name: &str) -> Option<(DataId, DataRef)> {
        for scope in self.active.iter().rev() {
            let scope = scope.borrow();
            if !scope.op_permission(OpMode::Find) {
                continue;
            }
            if let Some(found) = scope.find_info_by_name(name) {
                return Some(found);
            }
        }
        self.global.borrow().find_info_by_name(name)
    }

    pub fn find_data_by_id(&self, data_id: &DataId) -> Option<DataRef> {
        let scope = self.find_scope_by_name(data_id.scope_name())?;
        let found = scope.borrow().find_by_id(data_id);
        found
    }

    pub fn update_data_by_id(&mut self, data_id: &DataId, new_data: DataRef) -> Result<bool> {
        self.cache.remove(data_id.name());
        let scope = self
            .find_scope_by_name(data_id.scope_name())
            .ok_or_else(|| error::id_err(data_id.full_string()))?;
        let updated = scope.borrow_mut().update_by_id(data_id, new_data)?;
        Ok(updated)
    }

    // Walk the stack and mutate the first findable, updatable scope
    // that holds the name; fall through to the global scope.
    pub fn update_data_by_name(&mut self, name: &str, new_data: DataRef) -> Result<bool> {
        self.cache.remove(name);
        for scope in self.active.iter().rev() {
            let holds = {
                let s = scope.borrow();
                s.op_permission(OpMode::Find) && s.contains(name)
            };
            if holds {
                return scope.borrow_mut().update_by_name(name, new_data);
            }
        }
        if self.global.borrow().contains(name) {
            return self.global.borrow_mut().update_by_name(name, new_data);
        }
        Ok(false)
    }

    pub fn remove_data_by_id(&mut self, data_id: &DataId) -> Result<bool> {
        self.cache.remove(data_id.name());
        let scope = self
            .find_scope_by_name(data_id.scope_name())
            .ok_or_else(|| error::id_err(data_id.full_string()))?;
        let removed = scope.borrow_mut().remove_by_id(data_id)?;
        Ok(removed)
    }

    pub fn remove_data_by_name(&mut self, name: &str) -> Result<bool> {
        self.cache.remove(name);
        for scope in self.active.iter().rev() {
            let holds = {
                let s = scope.borrow();
                s.op_permission(OpMode::Find) && s.contains(name)
            };
            if holds {
                return scope.borrow_mut().remove_by_name(name);
            }
        }
        if self.global.borrow().contains(name) {
            return self.global.borrow_mut().remove_by_name(name);
        }
        Ok(false)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    fn int(v: i64) -> DataRef {
        Data::new(Value::Int(v))
    }

    #[test]
    fn test_acquire_names_and_pool() {
        let mut mem = Memory::new();
        assert_eq!(mem.free_scope_count(), INITIAL_POOL_SIZE);
        let a = mem.acquire_scope(DEFAULT_SCOPE_PREFIX, None);
        let b = mem.acquire_scope("SRC-", Some("main"));
        assert_eq!(a.borrow().name(), "SCOPE-1");
        assert_eq!(b.borrow().name(), "SRC-main");
        assert_eq!(mem.active_scope_count(), 2);
        assert!(mem.scope_exists("SRC-main"));
    }

    #[test]
    fn test_pool_expands_when_empty() {
        let mut mem = Memory::new();
        for _ in 0..INITIAL_POOL_SIZE + 2 {
            mem.acquire_scope(DEFAULT_SCOPE_PREFIX, None);
        }
        assert_eq!(mem.active_scope_count(), INITIAL_POOL_SIZE + 2);
    }

    #[test]
    fn test_release_clears_and_pools_once() {
        let mut mem = Memory::new();
        let scope = mem.acquire_scope(DEFAULT_SCOPE_PREFIX, None);
        mem.add_data("x", int(1), "").unwrap();
        assert_eq!(scope.borrow().size(), 1);
        mem.release_scope(&scope);
        assert_eq!(scope.borrow().size(), 0);
        assert_eq!(mem.free_pool_contains(&scope), 1);
        assert!(!mem.scope_exists("SCOPE-1"));
    }

    #[test]
    fn test_lookup_walks_stack_then_global() {
        let mut mem = Memory::new();
        mem.add_global_data("g", int(42)).unwrap();
        mem.acquire_scope(DEFAULT_SCOPE_PREFIX, None);
        mem.add_data("x", int(1), "").unwrap();
        mem.acquire_scope(DEFAULT_SCOPE_PREFIX, None);
        mem.add_data("x", int(2), "").unwrap();

        let (_, found) = mem.find_data_by_name("x").unwrap();
        assert_eq!(found.value_str(), "2");
        let (_, found) = mem.find_data_by_name("g").unwrap();
        assert_eq!(found.value_str(), "42");
        assert!(mem.find_data_by_name("missing").is_none());
    }

    #[test]
    fn test_cache_hits_and_invalidation() {
        let mut mem = Memory::new();
        mem.acquire_scope(DEFAULT_SCOPE_PREFIX, None);
        mem.add_data("x", int(1), "").unwrap();
        let (id_a, _) = mem.find_data_by_name("x").unwrap();
        let (id_b, _) = mem.find_data_by_name("x").unwrap();
        assert_eq!(id_a, id_b);

        // A shadowing add must not serve the stale cache entry.
        mem.acquire_scope(DEFAULT_SCOPE_PREFIX, None);
        mem.add_data("x", int(9), "").unwrap();
        let (_, found) = mem.find_data_by_name("x").unwrap();
        assert_eq!(found.value_str(), "9");
    }

    #[test]
    fn test_find_by_id_uses_scope_name() {
        let mut mem = Memory::new();
        mem.acquire_scope("SRC-", Some("main"));
        let (id, _) = mem.add_data("x", int(7), "").unwrap();
        assert_eq!(id.scope_name(), "SRC-main");
        let found = mem.find_data_by_id(&id).unwrap();
        assert_eq!(found.value_str(), "7");
    }

    #[test]
    fn test_update_by_name_mutates_nearest_holder() {
        let mut mem = Memory::new();
        mem.acquire_scope(DEFAULT_SCOPE_PREFIX, None);
        mem.add_data("x", int(1), "").unwrap();
        mem.acquire_scope(DEFAULT_SCOPE_PREFIX, None);
        assert!(mem.update_data_by_name("x", int(5)).unwrap());
        let (_, found) = mem.find_data_by_name("x").unwrap();
        assert_eq!(found.value_str(), "5");
    }

    #[test]
    fn test_quote_style_update_through_id() {
        let mut mem = Memory::new();
        mem.acquire_scope("SRC-", Some("main"));
        let (id, _) = mem.add_data("x", int(1), "").unwrap();
        mem.update_data_by_id(&id, int(3)).unwrap();
        let (_, found) = mem.find_data_by_name("x").unwrap();
        assert_eq!(found.value_str(), "3");

        // Once the defining scope is gone the id no longer resolves.
        let scope = mem.current_scope().unwrap();
        mem.release_scope(&scope);
        assert!(mem.update_data_by_id(&id, int(4)).is_err());
    }

    #[test]
    fn test_set_current_scope_by_name() {
        let mut mem = Memory::new();
        mem.acquire_scope("SRC-", Some("main"));
        mem.add_data("where", Data::new(Value::Str("main".to_string())), "")
            .unwrap();
        mem.acquire_scope(DEFAULT_SCOPE_PREFIX, None);
        mem.add_data("where", Data::new(Value::Str("block".to_string())), "")
            .unwrap();
        mem.set_current_scope_by_name("SRC-main").unwrap();
        let (_, found) = mem.find_data_by_name("where").unwrap();
        assert_eq!(found.value_str(), "main");
        assert!(mem.set_current_scope_by_name("nope").is_err());
    }

    #[test]
    fn test_clear_all_scopes() {
        let mut mem = Memory::new();
        mem.add_global_data("g", int(1)).unwrap();
        mem.acquire_scope(DEFAULT_SCOPE_PREFIX, None);
        mem.add_data("x", int(2), "").unwrap();
        mem.clear_all_scopes();
        assert!(!mem.has_active_scope());
        assert!(mem.global_scope().borrow().is_empty());
    }
}
