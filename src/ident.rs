// Process-unique identifiers for everything the machine allocates:
// value instances, types, named bindings, instructions, opcodes and
// instruction sets. The counter is atomic so identifier allocation is
// the one thread-safe corner of an otherwise single-threaded core;
// identifiers are never recycled within a process lifetime.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static ID_COUNTER: AtomicU64 = AtomicU64::new(0);
static DATA_INDEX: AtomicU64 = AtomicU64::new(0);

fn next_uid() -> u64 {
    ID_COUNTER.fetch_add(1, Ordering::Relaxed) + 1
}


#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum IdKind {
    Instance,
    Type,
    Data,
    Instruction,
    Opcode,
    InstructionSet,
}

impl IdKind {
    pub fn sign(self) -> char {
        match self {
            IdKind::Instance => 'I',
            IdKind::Type => 'T',
            IdKind::Data => 'D',
            IdKind::Instruction => 'i',
            IdKind::Opcode => 'R',
            IdKind::InstructionSet => 'S',
        }
    }

    pub fn detail(self) -> &'static str {
        match self {
            IdKind::Instance => "Inst",
            IdKind::Type => "Type",
            IdKind::Data => "Data",
            IdKind::Instruction => "Ins",
            IdKind::Opcode => "RI",
            IdKind::InstructionSet => "InsSet",
        }
    }
}


#[derive(Clone, Debug, Eq)]
pub struct Id {
    sign: char,
    uid: u64,
    dis_id: u64,
    kind: IdKind,
}

impl Id {
    pub fn next(kind: IdKind) -> Id {
        let uid = next_uid();
        Id { sign: kind.sign(), uid, dis_id: uid, kind }
    }

    pub fn uid(&self) -> u64 {
        self.uid
    }

    pub fn dis_id(&self) -> u64 {
        self.dis_id
    }

    pub fn sign(&self) -> char {
        self.sign
    }

    pub fn kind(&self) -> IdKind {
        self.kind
    }

    // "Dx000042" — sign, 'x', six-digit zero-padded uid.
    pub fn id_string(&self) -> String {
        format!("{}x{:06}", self.sign, self.uid)
    }

    pub fn to_detail_string(&self, detail: &str) -> String {
        if detail.is_empty() {
            format!("<{}>", self.id_string())
        } else {
            format!("<{}: {}>", detail, self.id_string())
        }
    }
}

// Identity is by uid alone.
impl PartialEq for Id {
    fn eq(&self, other: &Self) -> bool {
        self.uid == other.uid
    }
}

impl std::hash::Hash for Id {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.uid.hash(state);
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.to_detail_string(self.kind.detail()))
    }
}


// The identity of a named binding within a scope. Stable for the
// binding's lifetime; the monotone index disambiguates successive
// bindings of the same name.
#[derive(Clone, Debug, Eq)]
pub struct DataId {
    id: Id,
    name: String,
    scope_name: String,
    index: u64,
    idstring: String,
}

impl DataId {
    pub fn new(name: &str, scope_name: &str) -> DataId {
        let id = Id::next(IdKind::Data);
        let index = DATA_INDEX.fetch_add(1, Ordering::Relaxed) + 1;
        let idstring = format!(
            "{}::{}::{}-{}",
            scope_name,
            name,
            index,
            id.id_string()
        );
        DataId { id, name: name.to_string(), scope_name: scope_name.to_string(), index, idstring }
    }

    pub fn id(&self) -> &Id {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn scope_name(&self) -> &str {
        &self.scope_name
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    // "<scope>::<name>::<index>-Dx000042"
    pub fn full_string(&self) -> &str {
        &self.idstring
    }
}

impl PartialEq for DataId {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl fmt::Display for DataId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "<Data: {}>", self.idstring)
    }
}


// Type identity. The parent chain is a linked spine fixed at
// construction, so it cannot cycle; the ident string is stable across
// modules and is what cross-module type equality compares.
#[derive(Clone, Debug)]
pub struct TypeId {
    id: Id,
    type_name: String,
    parent: Option<std::rc::Rc<TypeId>>,
    ident: String,
}

impl TypeId {
    pub fn new(type_name: &str, parent: Option<std::rc::Rc<TypeId>>) -> TypeId {
        let ident = match &parent {
            Some(p) => format!("{}/{}", p.ident, type_name),
            None => type_name.to_string(),
        };
        TypeId { id: Id::next(IdKind::Type), type_name: type_name.to_string(), parent, ident }
    }

    pub fn id(&self) -> &Id {
        &self.id
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn parent(&self) -> Option<&std::rc::Rc<TypeId>> {
        self.parent.as_ref()
    }

    pub fn ident(&self) -> &str {
        &self.ident
    }

    pub fn top_parent(&self) -> &TypeId {
        let mut cur = self;
        while let Some(p) = cur.parent.as_deref() {
            cur = p;
        }
        cur
    }
}

impl PartialEq for TypeId {
    fn eq(&self, other: &Self) -> bool {
        self.ident == other.ident
    }
}

impl fmt::Display for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "<Type({}): {}>", self.type_name, self.id.id_string())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uids_unique_and_monotone() {
        let ids: Vec<Id> = (0..64).map(|_| Id::next(IdKind::Instance)).collect();
        for pair in ids.windows(2) {
            assert!(pair[0].uid() < pair[1].uid());
        }
    }

    #[test]
    fn test_id_string_form() {
        let id = Id::next(IdKind::Data);
        let s = id.id_string();
        assert!(s.starts_with("Dx"));
        assert_eq!(s.len(), 8);
        assert_eq!(id.to_detail_string("Data"), format!("<Data: {}>", s));
    }

    #[test]
    fn test_data_id_full_string() {
        let a = DataId::new("x", "MainScope");
        let b = DataId::new("x", "MainScope");
        assert_ne!(a, b);
        assert!(a.index() < b.index());
        assert!(a.full_string().starts_with("MainScope::x::"));
    }

    #[test]
    fn test_type_ident_chain() {
        let base = std::rc::Rc::new(TypeId::new("Animal", None));
        let child = TypeId::new("Dog", Some(base.clone()));
        assert_eq!(child.ident(), "Animal/Dog");
        assert_eq!(child.top_parent().type_name(), "Animal");
        let same = TypeId::new("Dog", Some(base));
        assert_eq!(child, same);
    }
}
