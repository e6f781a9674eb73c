// A scope: a named, lifetimed table of bindings with operation
// permissions. Two maps back it: name -> DataId, and the DataId's
// idstring -> value. Scopes are created and destroyed only through the
// memory manager, which pools them for reuse.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::error::{self, Result};
use crate::ident::{DataId, Id, IdKind};
use crate::value::DataRef;

pub type ScopeRef = Rc<RefCell<Scope>>;


#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OpMode {
    Add,
    Delete,
    Remove,
    Update,
    Find,
}

impl OpMode {
    pub fn name(self) -> &'static str {
        match self {
            OpMode::Add => "Add",
            OpMode::Delete => "Delete",
            OpMode::Remove => "Remove",
            OpMode::Update => "Update",
            OpMode::Find => "Find",
        }
    }
}


#[derive(Debug)]
pub struct Scope {
    inst_id: Id,
    name: String,
    name_map: HashMap<String, DataId>,
    data_map: HashMap<String, DataRef>,
    addable: bool,
    updatable: bool,
    deletable: bool,
    findable: bool,
    removable: bool,
}

impl Scope {
    pub fn new(name: &str) -> Scope {
        Scope {
            inst_id: Id::next(IdKind::Instance),
            name: name.to_string(),
            name_map: HashMap::new(),
            data_map: HashMap::new(),
            addable: true,
            updatable: true,
            deletable: true,
            findable: true,
            removable: true,
        }
    }

    pub fn inst_id(&self) -> &Id {
        &self.inst_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: &str) {
        self.name = name.to_string();
    }

    pub fn contains(&self, name: &str) -> bool {
        self.name_map.contains_key(name)
    }

    pub fn size(&self) -> usize {
        self.name_map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.name_map.is_empty()
    }

    pub fn clear(&mut self) {
        self.name_map.clear();
        self.data_map.clear();
        self.addable = true;
        self.updatable = true;
        self.deletable = true;
        self.findable = true;
        self.removable = true;
    }

    // --- permissions -------------------------------------------------------

    pub fn op_permission(&self, mode: OpMode) -> bool {
        match mode {
            OpMode::Add => self.addable,
            OpMode::Delete => self.deletable,
            OpMode::Remove => self.removable,
            OpMode::Update => self.updatable,
            OpMode::Find => self.findable,
        }
    }

    pub fn check_op_permission(&self, mode: OpMode) -> Result<()> {
        if self.op_permission(mode) {
            Ok(())
        } else {
            Err(error::modification(mode.name(), &self.name))
        }
    }

    pub fn set_addable(&mut self, v: bool) {
        self.addable = v;
    }

    pub fn set_updatable(&mut self, v: bool) {
        self.updatable = v;
    }

    pub fn set_deletable(&mut self, v: bool) {
        self.deletable = v;
    }

    pub fn set_findable(&mut self, v: bool) {
        self.findable = v;
    }

    pub fn set_removable(&mut self, v: bool) {
        self.removable = v;
    }

    // --- bindings ----------------------------------------------------------

    pub fn add_by_name(&mut self, name: &str, data: DataRef) -> Result<(DataId, DataRef)> {
        self.check_op_permission(OpMode::Add)?;
        if self.contains(name) {
            return Err(error::duplicate_key(name, &self.name));
        }
        let data_id = DataId::new(name, &self.name);
        self.data_map.insert(data_id.full_string().to_string(), data.clone());
        self.name_map.insert(name.to_string(), data_id.clone());
        Ok((data_id, data))
    }

    pub fn add_by_id(&mut self, data_id: DataId, data: DataRef) -> Result<(DataId, DataRef)> {
        self.check_op_permission(OpMode::Add)?;
        if self.contains(data_id.name()) {
            return Err(error::duplicate_key(data_id.name(), &self.name));
        }
        self.data_map.insert(data_id.full_string().to_string(), data.clone());
        self.name_map.insert(data_id.name().to_string(), data_id.clone());
        Ok((data_id, data))
    }

    pub fn get_data_id_by_name(&self, name: &str) -> Option<&DataId> {
        self.name_map.get(name)
    }

    pub fn find_by_name(&self, name: &str) -> Option<DataRef> {
        self.name_map
            .get(name)
            .and_then(|id| self.data_map.get(id.full_string()))
            .cloned()
    }

    pub fn find_info_by_name(&self, name: &str) -> Option<(DataId, DataRef)> {
        let id = self.name_map.get(name)?;
        let data = self.data_map.get(id.full_string())?;
        Some((id.clone(), data.clone()))
    }

    pub fn find_by_id(&self, data_id: &DataId) -> Option<DataRef> {
        self.data_map.get(data_id.full_string()).cloned()
    }

    pub fn find_by_id_string(&self, idstring: &str) -> Option<DataRef> {
        self.data_map.get(idstring).cloned()
    }

    // Replace the binding's contents. In-place when the kinds are
    // compatible, so aliases observe the change; otherwise the entry
    // is rebound to the new value.
    pub fn update_by_id(&mut self, data_id: &DataId, new_data: DataRef) -> Result<bool> {
        self.check_op_permission(OpMode::Update)?;
        let existing = match self.data_map.get(data_id.full_string()) {
            Some(d) => d.clone(),
            None => return Ok(false),
        };
        if existing.update_from(&new_data).is_err() {
            self.data_map.insert(data_id.full_string().to_string(), new_data);
        }
        Ok(true)
    }

    pub fn update_by_name(&mut self, name: &str, new_data: DataRef) -> Result<bool> {
        let id = match self.name_map.get(name) {
            Some(id) => id.clone(),
            None => return Ok(false),
        };
        self.update_by_id(&id, new_data)
    }

    pub fn remove_by_id(&mut self, data_id: &DataId) -> Result<bool> {
        self.check_op_permission(OpMode::Remove)?;
        let removed = self.data_map.remove(data_id.full_string()).is_some();
        if removed {
            self.name_map.remove(data_id.name());
        }
        Ok(removed)
    }

    pub fn remove_by_name(&mut self, name: &str) -> Result<bool> {
        self.check_op_permission(OpMode::Remove)?;
        let id = match self.name_map.remove(name) {
            Some(id) => id,
            None => return Ok(false),
        };
        self.data_map.remove(id.full_string());
        Ok(true)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{Data, Value};

    fn int(v: i64) -> DataRef {
        Data::new(Value::Int(v))
    }

    #[test]
    fn test_name_and_id_lookup_agree() {
        let mut scope = Scope::new("TestScope");
        scope.add_by_name("a", int(1)).unwrap();
        scope.add_by_name("b", int(2)).unwrap();
        for name in ["a", "b"].iter() {
            let id = scope.get_data_id_by_name(name).unwrap().clone();
            let by_id = scope.find_by_id(&id).unwrap();
            let by_name = scope.find_by_name(name).unwrap();
            assert!(Rc::ptr_eq(&by_id, &by_name));
            assert_eq!(id.scope_name(), "TestScope");
        }
    }

    #[test]
    fn test_duplicate_name_is_rejected() {
        let mut scope = Scope::new("TestScope");
        scope.add_by_name("a", int(1)).unwrap();
        let err = scope.add_by_name("a", int(2)).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Memory);
    }

    #[test]
    fn test_permission_denied_has_repair_tip() {
        let mut scope = Scope::new("Sealed");
        scope.set_addable(false);
        let err = scope.add_by_name("a", int(1)).unwrap_err();
        assert_eq!(err.kind_name, "ModificationError");
        assert!(!err.tips.is_empty());

        scope.set_addable(true);
        scope.add_by_name("a", int(1)).unwrap();
        scope.set_updatable(false);
        assert!(scope.update_by_name("a", int(2)).is_err());
        scope.set_removable(false);
        assert!(scope.remove_by_name("a").is_err());
    }

    #[test]
    fn test_update_in_place_is_visible_to_aliases() {
        let mut scope = Scope::new("TestScope");
        let (_, held) = scope.add_by_name("a", int(1)).unwrap();
        scope.update_by_name("a", int(5)).unwrap();
        assert_eq!(held.value_str(), "5");
    }

    #[test]
    fn test_update_rebinds_on_kind_change() {
        let mut scope = Scope::new("TestScope");
        scope.add_by_name("a", int(1)).unwrap();
        scope
            .update_by_name("a", Data::new(Value::Str("x".to_string())))
            .unwrap();
        assert_eq!(scope.find_by_name("a").unwrap().value_str(), "x");
    }

    #[test]
    fn test_remove_and_clear() {
        let mut scope = Scope::new("TestScope");
        scope.add_by_name("a", int(1)).unwrap();
        assert!(scope.remove_by_name("a").unwrap());
        assert!(!scope.remove_by_name("a").unwrap());
        scope.add_by_name("b", int(2)).unwrap();
        scope.clear();
        assert!(scope.is_empty());
        assert_eq!(scope.size(), 0);
    }
}
