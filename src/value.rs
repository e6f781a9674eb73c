// (C) 2020 Brandon Lewis
//
// The value model of the machine.
//
// Every runtime value is one case of a single tagged sum. The set of
// value kinds is closed, so dispatch is a pattern match rather than an
// open class hierarchy.
//
// *Ownership*
//
// Values live on the heap behind reference-counted cells; containers
// hold shared references to their children. A structural copy clones
// the container skeleton but shares children. Quotes do NOT hold a
// strong reference to the value they alias: they carry the DataId of
// the aliased binding and resolve it through the memory manager on
// every access, so an alias never extends its target's lifetime.
//
// *Numerics*
//
// Bool and Char are semantically integers; arithmetic over any numeric
// mixture promotes Int to Float when either operand is Float. Division
// and root by zero are runtime errors. `mod` on Float operands uses
// truncation-remainder semantics.
//
// *Iteration*
//
// Cursor state is NOT stored on the value. Each traversal owns its own
// Cursor, so two nested blocks iterating the same value never see each
// other's position.

use std::cell::{Ref, RefCell, RefMut};
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use enumflags2::{BitFlags, bitflags};

use crate::error::{self, Error, Result};
use crate::ident::{DataId, Id, IdKind, TypeId};
use crate::ins::InsSet;
use crate::scope::ScopeRef;
use crate::util::escape;


// Discriminants, exposed as flags so diagnostics can describe sets of
// acceptable types.
#[bitflags]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum TypeTag {
    Null = 1 << 0,
    Int = 1 << 1,
    Float = 1 << 2,
    Bool = 1 << 3,
    Char = 1 << 4,
    Str = 1 << 5,
    List = 1 << 6,
    Dict = 1 << 7,
    Series = 1 << 8,
    Pair = 1 << 9,
    CmpGroup = 1 << 10,
    Type = 1 << 11,
    Inst = 1 << 12,
    Func = 1 << 13,
    RetFunc = 1 << 14,
    Quote = 1 << 15,
    File = 1 << 16,
    Time = 1 << 17,
    Error = 1 << 18,
    Ext = 1 << 19,
}

pub type TypeSet = BitFlags<TypeTag>;

const NUMERIC: u32 = (1 << 1) | (1 << 2) | (1 << 3) | (1 << 4);

impl TypeTag {
    pub fn is_numeric(self) -> bool {
        (self as u32) & NUMERIC != 0
    }
}


#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Relational {
    RG,
    RGE,
    RNE,
    RE,
    RAE,
    RLE,
    RL,
    RT,
    RF,
    And,
    Or,
}

impl Relational {
    pub fn from_str(s: &str) -> Option<Relational> {
        use Relational::*;
        match s {
            "RG" => Some(RG),
            "RGE" => Some(RGE),
            "RNE" => Some(RNE),
            "RE" => Some(RE),
            "RAE" => Some(RAE),
            "RLE" => Some(RLE),
            "RL" => Some(RL),
            "RT" => Some(RT),
            "RF" => Some(RF),
            "AND" => Some(And),
            "OR" => Some(Or),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        use Relational::*;
        match self {
            RG => "RG",
            RGE => "RGE",
            RNE => "RNE",
            RE => "RE",
            RAE => "RAE",
            RLE => "RLE",
            RL => "RL",
            RT => "RT",
            RF => "RF",
            And => "AND",
            Or => "OR",
        }
    }
}


// A heap cell: the value payload plus the instance identity assigned
// at construction, used for identity comparison and debug display.
#[derive(Debug)]
pub struct Data {
    inst_id: Id,
    cell: RefCell<Value>,
}

pub type DataRef = Rc<Data>;

impl Data {
    pub fn new(value: Value) -> DataRef {
        Rc::new(Data { inst_id: Id::next(IdKind::Instance), cell: RefCell::new(value) })
    }

    pub fn inst_id(&self) -> &Id {
        &self.inst_id
    }

    pub fn value(&self) -> Ref<Value> {
        self.cell.borrow()
    }

    pub fn value_mut(&self) -> RefMut<Value> {
        self.cell.borrow_mut()
    }

    pub fn value_str(&self) -> String {
        self.cell.borrow().value_str()
    }

    pub fn escaped_str(&self) -> String {
        self.cell.borrow().escaped_str()
    }

    pub fn to_bool(&self) -> bool {
        self.cell.borrow().to_bool()
    }

    pub fn type_tag(&self) -> TypeTag {
        self.cell.borrow().type_tag()
    }

    pub fn type_name(&self) -> String {
        self.cell.borrow().type_name()
    }

    // Structural shallow clone: fresh instance identity, container
    // skeleton copied, children shared.
    pub fn copy(&self) -> DataRef {
        Data::new(self.cell.borrow().clone())
    }

    pub fn update_from(&self, other: &DataRef) -> Result<()> {
        if std::ptr::eq(self as *const Data, Rc::as_ptr(other)) {
            return Ok(());
        }
        let new_value = other.cell.borrow().clone();
        self.cell.borrow_mut().update_from(new_value)
    }

    pub fn compare(&self, other: &DataRef, rel: Relational) -> Result<bool> {
        if std::ptr::eq(self as *const Data, Rc::as_ptr(other)) {
            let v = self.cell.borrow();
            return v.compare(&v.clone(), rel);
        }
        self.cell.borrow().compare(&other.cell.borrow(), rel)
    }

    pub fn data_info(&self) -> String {
        format!(
            "{{instID: {}, type: {}, data: '{}'}}",
            self.inst_id,
            self.type_name(),
            self.value_str()
        )
    }
}


// An ordered dictionary. Keys are the escaped string form of whatever
// value was used as a key; the parallel key list preserves insertion
// order, and deletion does not reorder survivors. Entries are Pair
// values so iteration yields key/value pairs.
#[derive(Clone, Debug, Default)]
pub struct Dict {
    keys: Vec<String>,
    map: HashMap<String, DataRef>,
}

impl Dict {
    pub fn new() -> Dict {
        Dict::default()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    pub fn insert(&mut self, key: String, pair: DataRef) {
        if !self.map.contains_key(&key) {
            self.keys.push(key.clone());
        }
        self.map.insert(key, pair);
    }

    pub fn get(&self, key: &str) -> Option<&DataRef> {
        self.map.get(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<DataRef> {
        let removed = self.map.remove(key);
        if removed.is_some() {
            self.keys.retain(|k| k != key);
        }
        removed
    }

    pub fn at(&self, index: usize) -> Option<&DataRef> {
        self.keys.get(index).and_then(|k| self.map.get(k))
    }

    pub fn key_at(&self, index: usize) -> Option<&String> {
        self.keys.get(index)
    }
}


// A user-defined composite type. Fields may only be added here; type
// level field values may only be mutated here; instance field values
// only through an instance. The parent is fixed at construction, so
// the chain is acyclic by construction.
#[derive(Debug)]
pub struct CustomTypeDef {
    pub type_id: TypeId,
    pub parent: Option<TypeRef>,
    pub tp_fields: HashMap<String, DataRef>,
    pub inst_defaults: HashMap<String, DataRef>,
    pub methods: HashSet<String>,
}

pub type TypeRef = Rc<RefCell<CustomTypeDef>>;

impl CustomTypeDef {
    pub fn new(name: &str, parent: Option<TypeRef>) -> TypeRef {
        let parent_tid = parent.as_ref().map(|p| Rc::new(p.borrow().type_id.clone()));
        Rc::new(RefCell::new(CustomTypeDef {
            type_id: TypeId::new(name, parent_tid),
            parent,
            tp_fields: HashMap::new(),
            inst_defaults: HashMap::new(),
            methods: HashSet::new(),
        }))
    }

    pub fn name(&self) -> &str {
        self.type_id.type_name()
    }

    pub fn ident(&self) -> &str {
        self.type_id.ident()
    }

    // Walk leaf-to-root; the callback returns true to stop early.
    pub fn travel_types<F: FnMut(&CustomTypeDef) -> bool>(&self, f: &mut F) {
        if f(self) {
            return;
        }
        let mut cur = self.parent.clone();
        while let Some(t) = cur {
            let next = {
                let b = t.borrow();
                if f(&b) {
                    return;
                }
                b.parent.clone()
            };
            cur = next;
        }
    }

    pub fn has_tp_field(&self, name: &str) -> bool {
        let mut found = false;
        self.travel_types(&mut |t| {
            found = t.tp_fields.contains_key(name);
            found
        });
        found
    }

    pub fn has_inst_field(&self, name: &str) -> bool {
        let mut found = false;
        self.travel_types(&mut |t| {
            found = t.inst_defaults.contains_key(name);
            found
        });
        found
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.has_tp_field(name) || self.has_inst_field(name)
    }

    // Adding a type-level field is unconditional.
    pub fn add_tp_field(&mut self, name: &str, default: DataRef) {
        self.tp_fields.insert(name.to_string(), default);
    }

    // Instance-field defaults seed every future instance creation.
    pub fn add_inst_field(&mut self, name: &str, default: DataRef) {
        self.inst_defaults.insert(name.to_string(), default);
    }

    pub fn add_method(&mut self, name: &str) {
        self.methods.insert(name.to_string());
    }

    pub fn get_tp_field(&self, name: &str) -> Result<DataRef> {
        let mut found = None;
        self.travel_types(&mut |t| {
            found = t.tp_fields.get(name).cloned();
            found.is_some()
        });
        found.ok_or_else(|| error::field_not_found(&format!("[CustomType: {}]", self.name()), name))
    }

    pub fn set_tp_field(&mut self, name: &str, value: DataRef) -> Result<()> {
        if self.tp_fields.contains_key(name) {
            self.tp_fields.insert(name.to_string(), value);
            return Ok(());
        }
        // Owned by an ancestor level.
        let mut owner = self.parent.clone();
        while let Some(t) = owner {
            let next = {
                let mut b = t.borrow_mut();
                if b.tp_fields.contains_key(name) {
                    b.tp_fields.insert(name.to_string(), value);
                    return Ok(());
                }
                b.parent.clone()
            };
            owner = next;
        }
        Err(error::field_not_found(&format!("[CustomType: {}]", self.name()), name))
    }

    pub fn belongs_to(&self, other: &TypeRef) -> bool {
        let target = other.borrow().ident().to_string();
        let mut found = false;
        self.travel_types(&mut |t| {
            found = t.ident() == target;
            found
        });
        found
    }
}


// An instance of a user-defined type. One field map per type in the
// inheritance chain, keyed by that type's identity string. Reads walk
// leaf-to-root; writes target the most specific level declaring the
// field unless an explicit level is given.
#[derive(Clone, Debug)]
pub struct InstData {
    pub custom_type: TypeRef,
    pub fields: HashMap<String, HashMap<String, DataRef>>,
}

impl InstData {
    pub fn new(custom_type: TypeRef) -> InstData {
        let mut fields = HashMap::new();
        custom_type.borrow().travel_types(&mut |t| {
            let level: HashMap<String, DataRef> = t
                .inst_defaults
                .iter()
                .map(|(k, v)| (k.clone(), v.copy()))
                .collect();
            fields.insert(t.ident().to_string(), level);
            false
        });
        InstData { custom_type, fields }
    }

    pub fn type_name(&self) -> String {
        self.custom_type.borrow().name().to_string()
    }

    fn level_for(&self, spec: Option<&TypeRef>, field: &str) -> Result<String> {
        if let Some(t) = spec {
            let ident = t.borrow().ident().to_string();
            if !self.fields.contains_key(&ident) {
                return Err(error::field_not_found(
                    &format!("[CustomInst: {}]", self.type_name()),
                    field,
                ));
            }
            return Ok(ident);
        }
        let mut level = None;
        self.custom_type.borrow().travel_types(&mut |t| {
            if t.inst_defaults.contains_key(field) {
                level = Some(t.ident().to_string());
                return true;
            }
            false
        });
        level.ok_or_else(|| {
            error::field_not_found(&format!("[CustomInst: {}]", self.type_name()), field)
        })
    }

    pub fn get_field(&self, field: &str, spec: Option<&TypeRef>) -> Result<DataRef> {
        let level = self.level_for(spec, field)?;
        self.fields
            .get(&level)
            .and_then(|m| m.get(field))
            .cloned()
            .ok_or_else(|| {
                error::field_not_found(&format!("[CustomInst: {}]", self.type_name()), field)
            })
    }

    pub fn set_field(&mut self, field: &str, value: DataRef, spec: Option<&TypeRef>) -> Result<()> {
        let level = self.level_for(spec, field)?;
        let type_name = self.type_name();
        let map = self.fields.get_mut(&level).ok_or_else(|| {
            error::field_not_found(&format!("[CustomInst: {}]", type_name), field)
        })?;
        map.insert(field.to_string(), value);
        Ok(())
    }
}


#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FileMode {
    Read,
    Write,
    Append,
    ReadWrite,
    ReadAppend,
    WriteAppend,
}

impl FileMode {
    pub fn from_keyword(s: &str) -> Option<FileMode> {
        match s {
            "fl-r" => Some(FileMode::Read),
            "fl-w" => Some(FileMode::Write),
            "fl-ap" => Some(FileMode::Append),
            "fl-rw" => Some(FileMode::ReadWrite),
            "fl-ra" => Some(FileMode::ReadAppend),
            "fl-wa" => Some(FileMode::WriteAppend),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            FileMode::Read => "Read",
            FileMode::Write => "Write",
            FileMode::Append => "Append",
            FileMode::ReadWrite => "ReadWrite",
            FileMode::ReadAppend => "ReadAppend",
            FileMode::WriteAppend => "WriteAppend",
        }
    }

    pub fn readable(self) -> bool {
        matches!(self, FileMode::Read | FileMode::ReadWrite | FileMode::ReadAppend)
    }

    pub fn writable(self) -> bool {
        !matches!(self, FileMode::Read)
    }

    fn appends(self) -> bool {
        matches!(self, FileMode::Append | FileMode::ReadAppend | FileMode::WriteAppend)
    }
}


#[derive(Clone, Debug, PartialEq)]
pub struct FileData {
    pub path: String,
    pub mode: FileMode,
}

impl FileData {
    pub fn new(path: &str, mode: FileMode) -> FileData {
        FileData { path: path.to_string(), mode }
    }

    pub fn read_file(&self) -> Result<String> {
        if !self.mode.readable() {
            return Err(error::file_err(
                &self.path,
                &format!("File mode {} does not permit reading.", self.mode.name()),
            ));
        }
        std::fs::read_to_string(&self.path)
            .map_err(|e| error::file_err(&self.path, &format!("Read failed: {}", e)))
    }

    pub fn read_lines(&self) -> Result<Vec<String>> {
        Ok(self.read_file()?.lines().map(|l| l.to_string()).collect())
    }

    pub fn write_file(&self, content: &str) -> Result<()> {
        if !self.mode.writable() {
            return Err(error::file_err(
                &self.path,
                &format!("File mode {} does not permit writing.", self.mode.name()),
            ));
        }
        use std::io::Write;
        let result = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .append(self.mode.appends())
            .truncate(!self.mode.appends())
            .open(&self.path)
            .and_then(|mut f| f.write_all(content.as_bytes()));
        result.map_err(|e| error::file_err(&self.path, &format!("Write failed: {}", e)))
    }
}


#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TimeFormat {
    Iso,
    Us,
    European,
    Timestamp,
}

impl TimeFormat {
    pub fn from_str(s: &str) -> Option<TimeFormat> {
        match s {
            "ISO" => Some(TimeFormat::Iso),
            "US" => Some(TimeFormat::Us),
            "European" => Some(TimeFormat::European),
            "Timestamp" => Some(TimeFormat::Timestamp),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct TimeData {
    pub year: i64,
    pub month: i64,
    pub day: i64,
    pub hour: i64,
    pub minute: i64,
    pub second: i64,
    pub format: TimeFormat,
}

// Civil <-> day-count conversion, proleptic Gregorian.
fn days_from_civil(y: i64, m: i64, d: i64) -> i64 {
    let y = if m <= 2 { y - 1 } else { y };
    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = y - era * 400;
    let mp = (m + 9) % 12;
    let doy = (153 * mp + 2) / 5 + d - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146097 + doe - 719468
}

fn civil_from_days(z: i64) -> (i64, i64, i64) {
    let z = z + 719468;
    let era = if z >= 0 { z } else { z - 146096 } / 146097;
    let doe = z - era * 146097;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    (if m <= 2 { y + 1 } else { y }, m, d)
}

impl TimeData {
    pub fn new(year: i64, month: i64, day: i64, hour: i64, minute: i64, second: i64) -> TimeData {
        TimeData { year, month, day, hour, minute, second, format: TimeFormat::Iso }
    }

    pub fn now() -> TimeData {
        let secs = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        TimeData::from_timestamp(secs)
    }

    pub fn from_timestamp(secs: i64) -> TimeData {
        let days = secs.div_euclid(86400);
        let rem = secs.rem_euclid(86400);
        let (year, month, day) = civil_from_days(days);
        TimeData {
            year,
            month,
            day,
            hour: rem / 3600,
            minute: rem % 3600 / 60,
            second: rem % 60,
            format: TimeFormat::Iso,
        }
    }

    pub fn timestamp(&self) -> i64 {
        days_from_civil(self.year, self.month, self.day) * 86400
            + self.hour * 3600
            + self.minute * 60
            + self.second
    }

    pub fn add_seconds(&mut self, n: i64) {
        let format = self.format;
        *self = TimeData::from_timestamp(self.timestamp() + n);
        self.format = format;
    }

    pub fn add_minutes(&mut self, n: i64) {
        self.add_seconds(n * 60);
    }

    pub fn add_hours(&mut self, n: i64) {
        self.add_seconds(n * 3600);
    }

    pub fn add_days(&mut self, n: i64) {
        self.add_seconds(n * 86400);
    }

    pub fn add_months(&mut self, n: i64) {
        let total = self.year * 12 + (self.month - 1) + n;
        self.year = total.div_euclid(12);
        self.month = total.rem_euclid(12) + 1;
        self.clamp_day();
    }

    pub fn add_years(&mut self, n: i64) {
        self.year += n;
        self.clamp_day();
    }

    fn clamp_day(&mut self) {
        let days_in_month = match self.month {
            1 | 3 | 5 | 7 | 8 | 10 | 12 => 31,
            4 | 6 | 9 | 11 => 30,
            _ => {
                let leap =
                    self.year % 4 == 0 && (self.year % 100 != 0 || self.year % 400 == 0);
                if leap { 29 } else { 28 }
            }
        };
        if self.day > days_in_month {
            self.day = days_in_month;
        }
    }

    pub fn time_string(&self) -> String {
        match self.format {
            TimeFormat::Iso => format!(
                "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
                self.year, self.month, self.day, self.hour, self.minute, self.second
            ),
            TimeFormat::Us => format!(
                "{:02}/{:02}/{:04} {:02}:{:02}:{:02}",
                self.month, self.day, self.year, self.hour, self.minute, self.second
            ),
            TimeFormat::European => format!(
                "{:02}/{:02}/{:04} {:02}:{:02}:{:02}",
                self.day, self.month, self.year, self.hour, self.minute, self.second
            ),
            TimeFormat::Timestamp => format!("{}", self.timestamp()),
        }
    }
}


#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ExtKind {
    Ra,
    Rsi,
    Unknown,
}

impl ExtKind {
    pub fn from_path(path: &str) -> ExtKind {
        match crate::util::file_ext(path).as_str() {
            "ra" => ExtKind::Ra,
            "rsi" => ExtKind::Rsi,
            _ => ExtKind::Unknown,
        }
    }
}

// A loaded external module: its identity, where it came from, and the
// scope that holds its exported bindings.
#[derive(Clone, Debug)]
pub struct ExtData {
    pub ident: String,
    pub name: String,
    pub path: String,
    pub kind: ExtKind,
    pub scope: ScopeRef,
}


#[derive(Clone, Debug)]
pub struct FuncData {
    pub name: String,
    pub params: Vec<String>,
    pub body: Rc<InsSet>,
}


#[derive(Clone, Debug)]
pub enum Value {
    Null,
    Int(i64),
    Float(f64),
    Bool(bool),
    Char(u8),
    Str(String),
    List(Vec<DataRef>),
    Dict(Dict),
    Series(Vec<DataRef>),
    Pair(DataRef, DataRef),
    CmpGroup(DataId, DataId),
    Type(TypeRef),
    Inst(InstData),
    Func(Rc<FuncData>),
    RetFunc(Rc<FuncData>),
    Quote(DataId),
    File(FileData),
    Time(TimeData),
    ErrVal(Box<Error>),
    Ext(ExtData),
}


// Internal numeric view used by the algebra below.
#[derive(Copy, Clone, Debug)]
enum Num {
    I(i64),
    F(f64),
}

impl Num {
    fn widen(self) -> f64 {
        match self {
            Num::I(v) => v as f64,
            Num::F(v) => v,
        }
    }
}


pub fn expected(expect: TypeSet, got: &Value) -> Error {
    error::type_err(
        vec![
            "This error is caused by a data type mismatch.".to_string(),
            format!("Expected Type: {:?}", expect),
            format!("Got: [Data({}): {}]", got.type_name(), got.value_str()),
        ],
        vec!["Convert the operand to an acceptable type first.".to_string()],
    )
}

fn type_mismatch(a: &Value, b: &Value) -> Error {
    error::type_err(
        vec![
            "This error is caused by a data type mismatch.".to_string(),
            format!("Left: [Data({}): {}]", a.type_name(), a.value_str()),
            format!("Right: [Data({}): {}]", b.type_name(), b.value_str()),
        ],
        vec!["Both operands of a numeric operation must be numeric.".to_string()],
    )
}

fn divided_by_zero(op: &str) -> Error {
    error::runtime(
        vec![
            format!("This error is caused by a zero operand of '{}'.", op),
            "Division or root by zero is undefined.".to_string(),
        ],
        vec!["Guard the operand against zero before the operation.".to_string()],
    )
}

fn immutable_series() -> Error {
    error::type_err(
        vec!["A series is an ordered immutable view; it cannot be mutated.".to_string()],
        vec!["Copy the series into a list before mutating it.".to_string()],
    )
}

fn not_iterable(v: &Value) -> Error {
    expected(
        TypeTag::Str | TypeTag::List | TypeTag::Dict | TypeTag::Series,
        v,
    )
}


// The binary numeric operators share one skeleton: both operands must
// view as numeric, Int pairs stay integral, any Float widens both.
macro_rules! numeric_op {
    ($name:ident, $op:literal, $int:expr, $float:expr) => {
        pub fn $name(&self, other: &Value) -> Result<Value> {
            match (self.as_num(), other.as_num()) {
                (Some(Num::I(a)), Some(Num::I(b))) => $int(a, b),
                (Some(a), Some(b)) => $float(a.widen(), b.widen()),
                _ => Err(type_mismatch(self, other)),
            }
        }
    };
}

impl Value {
    pub fn type_tag(&self) -> TypeTag {
        match self {
            Value::Null => TypeTag::Null,
            Value::Int(_) => TypeTag::Int,
            Value::Float(_) => TypeTag::Float,
            Value::Bool(_) => TypeTag::Bool,
            Value::Char(_) => TypeTag::Char,
            Value::Str(_) => TypeTag::Str,
            Value::List(_) => TypeTag::List,
            Value::Dict(_) => TypeTag::Dict,
            Value::Series(_) => TypeTag::Series,
            Value::Pair(_, _) => TypeTag::Pair,
            Value::CmpGroup(_, _) => TypeTag::CmpGroup,
            Value::Type(_) => TypeTag::Type,
            Value::Inst(_) => TypeTag::Inst,
            Value::Func(_) => TypeTag::Func,
            Value::RetFunc(_) => TypeTag::RetFunc,
            Value::Quote(_) => TypeTag::Quote,
            Value::File(_) => TypeTag::File,
            Value::Time(_) => TypeTag::Time,
            Value::ErrVal(_) => TypeTag::Error,
            Value::Ext(_) => TypeTag::Ext,
        }
    }

    pub fn type_name(&self) -> String {
        match self {
            Value::Null => "null".to_string(),
            Value::Int(_) => "int".to_string(),
            Value::Float(_) => "float".to_string(),
            Value::Bool(_) => "bool".to_string(),
            Value::Char(_) => "char".to_string(),
            Value::Str(_) => "str".to_string(),
            Value::List(_) => "list".to_string(),
            Value::Dict(_) => "dict".to_string(),
            Value::Series(_) => "series".to_string(),
            Value::Pair(_, _) => "pair".to_string(),
            Value::CmpGroup(_, _) => "cmp-group".to_string(),
            Value::Type(t) => t.borrow().name().to_string(),
            Value::Inst(i) => i.type_name(),
            Value::Func(_) => "func".to_string(),
            Value::RetFunc(_) => "ret-func".to_string(),
            Value::Quote(_) => "qot".to_string(),
            Value::File(_) => "file".to_string(),
            Value::Time(_) => "time".to_string(),
            Value::ErrVal(_) => "error".to_string(),
            Value::Ext(_) => "ext".to_string(),
        }
    }

    pub fn value_str(&self) -> String {
        match self {
            Value::Null => "null".to_string(),
            Value::Int(v) => format!("{}", v),
            Value::Float(v) => float_str(*v),
            Value::Bool(v) => format!("{}", v),
            Value::Char(v) => (*v as char).to_string(),
            Value::Str(v) => v.clone(),
            Value::List(items) => {
                let parts: Vec<String> = items.iter().map(|d| d.escaped_str()).collect();
                format!("[{}]", parts.join(", "))
            }
            Value::Series(items) => {
                let parts: Vec<String> = items.iter().map(|d| d.escaped_str()).collect();
                format!("({})", parts.join(", "))
            }
            Value::Dict(dict) => {
                let parts: Vec<String> = dict
                    .keys()
                    .iter()
                    .filter_map(|k| dict.get(k).map(|p| p.value_str()))
                    .collect();
                format!("{{{}}}", parts.join(", "))
            }
            Value::Pair(k, v) => format!("{}: {}", k.escaped_str(), v.escaped_str()),
            Value::CmpGroup(l, r) => {
                format!("[CompareGroup: {} ~ {}]", l.full_string(), r.full_string())
            }
            Value::Type(t) => format!("[CustomType: {}]", t.borrow().name()),
            Value::Inst(i) => format!("[CustomInst: {}]", i.type_name()),
            Value::Func(f) => format!("[Function: {}({})]", f.name, f.params.join(", ")),
            Value::RetFunc(f) => format!("[RetFunction: {}({})]", f.name, f.params.join(", ")),
            Value::Quote(id) => format!("<Quote: {}>", id.full_string()),
            Value::File(f) => format!("[File({}): {}]", f.mode.name(), f.path),
            Value::Time(t) => t.time_string(),
            Value::ErrVal(e) => format!("[Error({}): {}]", e.kind_name, e.info.join("; ")),
            Value::Ext(e) => format!("[Extension({}): {}]", e.ident, e.path),
        }
    }

    pub fn escaped_str(&self) -> String {
        match self {
            Value::Str(v) => format!("\"{}\"", escape(v)),
            Value::Char(v) => format!("'{}'", *v as char),
            Value::Null
            | Value::Int(_)
            | Value::Float(_)
            | Value::Bool(_)
            | Value::List(_)
            | Value::Dict(_)
            | Value::Series(_)
            | Value::Pair(_, _)
            | Value::Time(_) => self.value_str(),
            _ => format!("[Data({}): {}]", self.type_name(), self.value_str()),
        }
    }

    pub fn to_bool(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Int(v) => *v != 0,
            Value::Float(v) => *v != 0.0,
            Value::Bool(v) => *v,
            Value::Char(v) => *v != 0,
            Value::Str(v) => !v.is_empty(),
            Value::List(v) => !v.is_empty(),
            Value::Series(v) => !v.is_empty(),
            Value::Dict(d) => !d.is_empty(),
            _ => true,
        }
    }

    fn as_num(&self) -> Option<Num> {
        match self {
            Value::Int(v) => Some(Num::I(*v)),
            Value::Float(v) => Some(Num::F(*v)),
            Value::Bool(v) => Some(Num::I(*v as i64)),
            Value::Char(v) => Some(Num::I(*v as i64)),
            _ => None,
        }
    }

    numeric_op!(add, "+", |a: i64, b: i64| Ok(Value::Int(a + b)), |a: f64, b: f64| Ok(
        Value::Float(a + b)
    ));

    numeric_op!(sub, "-", |a: i64, b: i64| Ok(Value::Int(a - b)), |a: f64, b: f64| Ok(
        Value::Float(a - b)
    ));

    numeric_op!(mul, "*", |a: i64, b: i64| Ok(Value::Int(a * b)), |a: f64, b: f64| Ok(
        Value::Float(a * b)
    ));

    numeric_op!(
        div,
        "/",
        |a: i64, b: i64| {
            if b == 0 {
                Err(divided_by_zero("/"))
            } else {
                Ok(Value::Int(a / b))
            }
        },
        |a: f64, b: f64| {
            if b == 0.0 {
                Err(divided_by_zero("/"))
            } else {
                Ok(Value::Float(a / b))
            }
        }
    );

    // Float operands use truncation-remainder semantics, which is what
    // `%` on f64 already computes.
    numeric_op!(
        modulo,
        "%",
        |a: i64, b: i64| {
            if b == 0 {
                Err(divided_by_zero("%"))
            } else {
                Ok(Value::Int(a % b))
            }
        },
        |a: f64, b: f64| {
            if b == 0.0 {
                Err(divided_by_zero("%"))
            } else {
                Ok(Value::Float(a % b))
            }
        }
    );

    numeric_op!(
        pow,
        "^",
        |a: i64, b: i64| {
            if b >= 0 && b <= u32::max_value() as i64 {
                Ok(Value::Int(a.pow(b as u32)))
            } else {
                Ok(Value::Float((a as f64).powf(b as f64)))
            }
        },
        |a: f64, b: f64| Ok(Value::Float(a.powf(b)))
    );

    numeric_op!(
        root,
        "~",
        |a: i64, b: i64| {
            if b == 0 {
                Err(divided_by_zero("~"))
            } else {
                Ok(Value::Float((a as f64).powf(1.0 / b as f64)))
            }
        },
        |a: f64, b: f64| {
            if b == 0.0 {
                Err(divided_by_zero("~"))
            } else {
                Ok(Value::Float(a.powf(1.0 / b)))
            }
        }
    );

    pub fn neg(&self) -> Result<Value> {
        match self {
            Value::Bool(v) => Ok(Value::Bool(!v)),
            Value::Int(v) => Ok(Value::Int(-v)),
            Value::Float(v) => Ok(Value::Float(-v)),
            Value::Char(v) => Ok(Value::Int(-(*v as i64))),
            v => Err(expected(
                TypeTag::Int | TypeTag::Float | TypeTag::Bool | TypeTag::Char,
                v,
            )),
        }
    }

    // Value equality. Numeric mixtures compare on the represented
    // number regardless of variant; everything else compares by kind.
    fn equals(&self, other: &Value) -> bool {
        if let (Some(a), Some(b)) = (self.as_num(), other.as_num()) {
            return match (a, b) {
                (Num::I(a), Num::I(b)) => a == b,
                (a, b) => a.widen() == b.widen(),
            };
        }
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) | (Value::Series(a), Value::Series(b)) => {
                a.len() == b.len()
                    && a.iter()
                        .zip(b.iter())
                        .all(|(x, y)| x.value().equals(&y.value()))
            }
            (Value::Dict(a), Value::Dict(b)) => {
                a.len() == b.len()
                    && a.keys().iter().all(|k| match (a.get(k), b.get(k)) {
                        (Some(x), Some(y)) => x.value().equals(&y.value()),
                        _ => false,
                    })
            }
            (Value::Pair(ak, av), Value::Pair(bk, bv)) => {
                ak.value().equals(&bk.value()) && av.value().equals(&bv.value())
            }
            (Value::Type(a), Value::Type(b)) => a.borrow().ident() == b.borrow().ident(),
            (Value::Func(a), Value::Func(b)) => a.name == b.name,
            (Value::RetFunc(a), Value::RetFunc(b)) => a.name == b.name,
            (Value::Quote(a), Value::Quote(b)) => a == b,
            (Value::File(a), Value::File(b)) => a == b,
            (Value::Time(a), Value::Time(b)) => a.timestamp() == b.timestamp(),
            _ => false,
        }
    }

    fn order(&self, other: &Value) -> Result<std::cmp::Ordering> {
        if let (Some(a), Some(b)) = (self.as_num(), other.as_num()) {
            let (a, b) = (a.widen(), b.widen());
            return a
                .partial_cmp(&b)
                .ok_or_else(|| type_mismatch(self, other));
        }
        if let (Value::Str(a), Value::Str(b)) = (self, other) {
            return Ok(a.cmp(b));
        }
        Err(type_mismatch(self, other))
    }

    pub fn compare(&self, other: &Value, rel: Relational) -> Result<bool> {
        use std::cmp::Ordering::*;
        match rel {
            Relational::RT => Ok(self.to_bool()),
            Relational::RF => Ok(!self.to_bool()),
            Relational::And => Ok(self.to_bool() && other.to_bool()),
            Relational::Or => Ok(self.to_bool() || other.to_bool()),
            Relational::RE => Ok(self.equals(other)),
            Relational::RNE => Ok(!self.equals(other)),
            Relational::RAE => Ok(self.type_tag() == other.type_tag() && self.equals(other)),
            Relational::RG => Ok(self.order(other)? == Greater),
            Relational::RGE => Ok(self.order(other)? != Less),
            Relational::RL => Ok(self.order(other)? == Less),
            Relational::RLE => Ok(self.order(other)? != Greater),
        }
    }

    // In-place content replacement. Same kind always succeeds; any
    // numeric kind may replace any other numeric kind; everything else
    // is a type error.
    pub fn update_from(&mut self, other: Value) -> Result<()> {
        let same = self.type_tag() == other.type_tag();
        let numeric = self.type_tag().is_numeric() && other.type_tag().is_numeric();
        if same || numeric {
            *self = other;
            Ok(())
        } else {
            Err(type_mismatch(self, &other))
        }
    }

    // --- iterable contract -------------------------------------------------

    pub fn size(&self) -> Result<usize> {
        match self {
            Value::Str(v) => Ok(v.len()),
            Value::List(v) | Value::Series(v) => Ok(v.len()),
            Value::Dict(d) => Ok(d.len()),
            v => Err(not_iterable(v)),
        }
    }

    pub fn get_at(&self, index: usize) -> Result<DataRef> {
        match self {
            Value::Str(v) => v
                .as_bytes()
                .get(index)
                .map(|b| Data::new(Value::Char(*b)))
                .ok_or_else(|| error::range_err(format!("{}", index), v.len())),
            Value::List(v) | Value::Series(v) => v
                .get(index)
                .cloned()
                .ok_or_else(|| error::range_err(format!("{}", index), v.len())),
            Value::Dict(d) => d
                .at(index)
                .cloned()
                .ok_or_else(|| error::range_err(format!("{}", index), d.len())),
            v => Err(not_iterable(v)),
        }
    }

    pub fn set_at(&mut self, index: usize, data: DataRef) -> Result<()> {
        match self {
            Value::Str(v) => {
                if index >= v.len() {
                    return Err(error::range_err(format!("{}", index), v.len()));
                }
                let ch = match &*data.value() {
                    Value::Char(c) => *c as char,
                    other => return Err(expected(TypeTag::Char.into(), other)),
                };
                let mut bytes = v.clone().into_bytes();
                bytes[index] = ch as u8;
                *v = String::from_utf8_lossy(&bytes).into_owned();
                Ok(())
            }
            Value::List(v) => {
                if index >= v.len() {
                    return Err(error::range_err(format!("{}", index), v.len()));
                }
                v[index] = data;
                Ok(())
            }
            Value::Dict(d) => {
                let key = match d.key_at(index) {
                    Some(k) => k.clone(),
                    None => return Err(error::range_err(format!("{}", index), d.len())),
                };
                let pair = match &*data.value() {
                    Value::Pair(_, _) => data.clone(),
                    other => return Err(expected(TypeTag::Pair.into(), other)),
                };
                d.insert(key, pair);
                Ok(())
            }
            Value::Series(_) => Err(immutable_series()),
            v => Err(not_iterable(v)),
        }
    }

    pub fn insert_at(&mut self, index: usize, data: DataRef) -> Result<()> {
        match self {
            // Strings are byte-indexed; splice at the byte level so an
            // index inside a multi-byte sequence cannot panic.
            Value::Str(v) => {
                if index > v.len() {
                    return Err(error::range_err(format!("{}", index), v.len()));
                }
                let mut bytes = v.clone().into_bytes();
                let inserted = data.value().value_str().into_bytes();
                bytes.splice(index..index, inserted);
                *v = String::from_utf8_lossy(&bytes).into_owned();
                Ok(())
            }
            Value::List(v) => {
                if index > v.len() {
                    return Err(error::range_err(format!("{}", index), v.len()));
                }
                v.insert(index, data);
                Ok(())
            }
            Value::Dict(_) => self.append(data),
            Value::Series(_) => Err(immutable_series()),
            v => Err(not_iterable(v)),
        }
    }

    pub fn erase_at(&mut self, index: usize) -> Result<()> {
        match self {
            Value::Str(v) => {
                if index >= v.len() {
                    return Err(error::range_err(format!("{}", index), v.len()));
                }
                let mut bytes = v.clone().into_bytes();
                bytes.remove(index);
                *v = String::from_utf8_lossy(&bytes).into_owned();
                Ok(())
            }
            Value::List(v) => {
                if index >= v.len() {
                    return Err(error::range_err(format!("{}", index), v.len()));
                }
                v.remove(index);
                Ok(())
            }
            Value::Dict(d) => {
                let key = match d.key_at(index) {
                    Some(k) => k.clone(),
                    None => return Err(error::range_err(format!("{}", index), d.len())),
                };
                d.remove(&key);
                Ok(())
            }
            Value::Series(_) => Err(immutable_series()),
            v => Err(not_iterable(v)),
        }
    }

    pub fn append(&mut self, data: DataRef) -> Result<()> {
        match self {
            Value::Str(v) => {
                v.push_str(&data.value().value_str());
                Ok(())
            }
            Value::List(v) => {
                v.push(data);
                Ok(())
            }
            Value::Dict(d) => {
                let key = match &*data.value() {
                    Value::Pair(k, _) => k.escaped_str(),
                    other => return Err(expected(TypeTag::Pair.into(), other)),
                };
                d.insert(key, data.clone());
                Ok(())
            }
            Value::Series(_) => Err(immutable_series()),
            v => Err(not_iterable(v)),
        }
    }

    pub fn subpart(&self, begin: usize, end: usize) -> Result<Value> {
        let size = self.size()?;
        if begin > end || end > size {
            return Err(error::range_err(format!("{}..{}", begin, end), size));
        }
        match self {
            Value::Str(v) => Ok(Value::Str(
                String::from_utf8_lossy(&v.as_bytes()[begin..end]).into_owned(),
            )),
            Value::List(v) => Ok(Value::List(v[begin..end].to_vec())),
            Value::Series(v) => Ok(Value::Series(v[begin..end].to_vec())),
            Value::Dict(d) => {
                let mut out = Dict::new();
                for key in &d.keys()[begin..end] {
                    if let Some(pair) = d.get(key) {
                        out.insert(key.clone(), pair.clone());
                    }
                }
                Ok(Value::Dict(out))
            }
            v => Err(not_iterable(v)),
        }
    }

    // Concatenate another iterable into self.
    pub fn splice(&mut self, other: &Value) -> Result<()> {
        match (self, other) {
            (Value::Str(a), Value::Str(b)) => {
                a.push_str(b);
                Ok(())
            }
            (Value::List(a), Value::List(b)) | (Value::List(a), Value::Series(b)) => {
                a.extend(b.iter().cloned());
                Ok(())
            }
            (Value::Dict(a), Value::Dict(b)) => {
                for key in b.keys() {
                    if let Some(pair) = b.get(key) {
                        a.insert(key.clone(), pair.clone());
                    }
                }
                Ok(())
            }
            (Value::Series(_), _) => Err(immutable_series()),
            (a, b) => Err(type_mismatch(a, b)),
        }
    }

    pub fn contains(&self, data: &DataRef) -> Result<bool> {
        match self {
            Value::Str(v) => {
                let needle = data.value().value_str();
                Ok(v.contains(&needle))
            }
            Value::List(items) | Value::Series(items) => Ok(items
                .iter()
                .any(|item| item.value().equals(&data.value()))),
            Value::Dict(d) => Ok(d.get(&data.escaped_str()).is_some()),
            v => Err(not_iterable(v)),
        }
    }
}

fn float_str(v: f64) -> String {
    if v.is_finite() && v.fract() == 0.0 && v.abs() < 1e15 {
        format!("{:.1}", v)
    } else {
        format!("{}", v)
    }
}


// Traversal state for one iteration of one iterable. Owned by the
// traversing block, never by the value, so concurrent iteration of the
// same value is well-defined.
#[derive(Clone, Copy, Debug, Default)]
pub struct Cursor {
    pos: usize,
}

impl Cursor {
    pub fn begin() -> Cursor {
        Cursor { pos: 0 }
    }

    pub fn at_end(value: &Value) -> Result<Cursor> {
        Ok(Cursor { pos: value.size()? })
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    // Yield the current element and advance; None once exhausted, and
    // the cursor stays at the end.
    pub fn next(&mut self, value: &Value) -> Result<Option<DataRef>> {
        let size = value.size()?;
        if self.pos >= size {
            self.pos = size;
            return Ok(None);
        }
        let item = value.get_at(self.pos)?;
        self.pos += 1;
        Ok(Some(item))
    }
}


// The identities of the built-in types, allocated once per machine so
// the preset `tp-*` globals and cross-module checks have stable ids.
pub struct Types {
    pub null: Rc<TypeId>,
    pub numeric: Rc<TypeId>,
    pub int: Rc<TypeId>,
    pub float: Rc<TypeId>,
    pub boolean: Rc<TypeId>,
    pub char_: Rc<TypeId>,
    pub iterable: Rc<TypeId>,
    pub string: Rc<TypeId>,
    pub list: Rc<TypeId>,
    pub dict: Rc<TypeId>,
    pub series: Rc<TypeId>,
    pub structure: Rc<TypeId>,
    pub pair: Rc<TypeId>,
    pub cmp_group: Rc<TypeId>,
    pub callable: Rc<TypeId>,
    pub func: Rc<TypeId>,
    pub ret_func: Rc<TypeId>,
    pub quote: Rc<TypeId>,
    pub file: Rc<TypeId>,
    pub time: Rc<TypeId>,
    pub error: Rc<TypeId>,
    pub ext: Rc<TypeId>,
}

impl Types {
    pub fn new() -> Types {
        let numeric = Rc::new(TypeId::new("numeric", None));
        let int = Rc::new(TypeId::new("int", Some(numeric.clone())));
        let iterable = Rc::new(TypeId::new("iterable", None));
        let structure = Rc::new(TypeId::new("structure", None));
        let callable = Rc::new(TypeId::new("callable", None));
        let func = Rc::new(TypeId::new("func", Some(callable.clone())));
        Types {
            null: Rc::new(TypeId::new("null", None)),
            float: Rc::new(TypeId::new("float", Some(numeric.clone()))),
            boolean: Rc::new(TypeId::new("bool", Some(int.clone()))),
            char_: Rc::new(TypeId::new("char", Some(int.clone()))),
            string: Rc::new(TypeId::new("str", Some(iterable.clone()))),
            list: Rc::new(TypeId::new("list", Some(iterable.clone()))),
            dict: Rc::new(TypeId::new("dict", Some(iterable.clone()))),
            series: Rc::new(TypeId::new("series", Some(iterable.clone()))),
            pair: Rc::new(TypeId::new("pair", Some(structure.clone()))),
            cmp_group: Rc::new(TypeId::new("cmp-group", Some(structure.clone()))),
            ret_func: Rc::new(TypeId::new("ret-func", Some(func.clone()))),
            quote: Rc::new(TypeId::new("qot", None)),
            file: Rc::new(TypeId::new("file", None)),
            time: Rc::new(TypeId::new("time", None)),
            error: Rc::new(TypeId::new("error", None)),
            ext: Rc::new(TypeId::new("ext", None)),
            numeric,
            int,
            iterable,
            structure,
            callable,
            func,
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use super::Relational::*;
    use super::Value::*;

    fn d(v: Value) -> DataRef {
        Data::new(v)
    }

    fn s(v: &str) -> Value {
        Str(String::from(v))
    }

    #[test]
    fn test_numeric_promotion() {
        assert!(matches!(Int(2).add(&Int(3)).unwrap(), Int(5)));
        match Int(2).add(&Float(3.0)).unwrap() {
            Float(v) => assert_eq!(v, 5.0),
            other => panic!("expected float, got {:?}", other),
        }
        match Bool(true).add(&Char(b'a')).unwrap() {
            Int(v) => assert_eq!(v, 98),
            other => panic!("expected int, got {:?}", other),
        }
    }

    #[test]
    fn test_divide_by_zero_is_runtime_error() {
        let err = Int(1).div(&Int(0)).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Runtime);
        let err = Float(1.0).root(&Float(0.0)).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Runtime);
    }

    #[test]
    fn test_float_mod_truncation_remainder() {
        match Float(7.5).modulo(&Float(2.0)).unwrap() {
            Float(v) => assert_eq!(v, 1.5),
            other => panic!("expected float, got {:?}", other),
        }
        match Float(-7.5).modulo(&Float(2.0)).unwrap() {
            Float(v) => assert_eq!(v, -1.5),
            other => panic!("expected float, got {:?}", other),
        }
    }

    #[test]
    fn test_arith_rejects_non_numeric() {
        assert!(s("abc").add(&Int(1)).is_err());
        assert!(Int(1).mul(&Null).is_err());
    }

    #[test]
    fn test_numeric_equality_across_variants() {
        let values = [Int(1), Float(1.0), Bool(true), Char(1)];
        for a in &values {
            for b in &values {
                assert!(a.compare(b, RE).unwrap(), "{:?} RE {:?}", a, b);
                assert!(!a.compare(b, RNE).unwrap());
            }
        }
        assert!(Int(1).compare(&Float(1.0), RAE).unwrap() == false);
        assert!(Int(1).compare(&Int(1), RAE).unwrap());
    }

    #[test]
    fn test_ordering_relations() {
        assert!(Int(2).compare(&Float(3.0), RL).unwrap());
        assert!(Float(3.0).compare(&Int(2), RG).unwrap());
        assert!(s("abc").compare(&s("abd"), RL).unwrap());
        assert!(s("abc").compare(&Int(2), RG).is_err());
    }

    #[test]
    fn test_truth_combiners() {
        assert!(Int(5).compare(&Null, RT).unwrap());
        assert!(Null.compare(&Null, RF).unwrap());
        assert!(Int(1).compare(&s("x"), And).unwrap());
        assert!(!Int(0).compare(&s(""), Or).unwrap());
    }

    #[test]
    fn test_dict_insertion_order_survives_deletion() {
        let mut dict = super::Dict::new();
        for key in ["\"a\"", "\"b\"", "\"c\"", "\"d\""].iter() {
            let pair = d(Pair(d(s(key)), d(Int(1))));
            dict.insert(key.to_string(), pair);
        }
        dict.remove("\"b\"");
        assert_eq!(dict.keys(), &["\"a\"", "\"c\"", "\"d\""]);
        // Re-inserting an existing key keeps its slot.
        let pair = d(Pair(d(s("\"a\"")), d(Int(9))));
        dict.insert("\"a\"".to_string(), pair);
        assert_eq!(dict.keys()[0], "\"a\"");
    }

    #[test]
    fn test_update_from_rules() {
        let mut v = Int(1);
        v.update_from(Float(2.5)).unwrap();
        assert!(matches!(v, Float(_)));
        let mut v = s("x");
        assert!(v.update_from(Int(1)).is_err());
        v.update_from(s("y")).unwrap();
        assert_eq!(v.value_str(), "y");
    }

    #[test]
    fn test_series_is_immutable() {
        let mut v = Series(vec![d(Int(1))]);
        assert!(v.append(d(Int(2))).is_err());
        assert!(v.erase_at(0).is_err());
        assert!(v.set_at(0, d(Int(2))).is_err());
        assert!(matches!(v.subpart(0, 1).unwrap(), Series(_)));
    }

    #[test]
    fn test_splice_and_contains() {
        let mut list = List(vec![d(Int(1)), d(Int(2))]);
        list.splice(&List(vec![d(Int(3))])).unwrap();
        assert_eq!(list.size().unwrap(), 3);
        assert!(list.contains(&d(Float(3.0))).unwrap());
        assert!(!list.contains(&d(Int(9))).unwrap());

        let mut text = s("abc");
        text.splice(&s("def")).unwrap();
        assert_eq!(text.value_str(), "abcdef");
        assert!(text.contains(&d(s("cde"))).unwrap());
    }

    #[test]
    fn test_cursor_exhaustion() {
        let list = List(vec![d(Int(1)), d(Int(2))]);
        let mut cur = Cursor::begin();
        assert_eq!(cur.next(&list).unwrap().unwrap().value_str(), "1");
        assert_eq!(cur.next(&list).unwrap().unwrap().value_str(), "2");
        assert!(cur.next(&list).unwrap().is_none());
        assert!(cur.next(&list).unwrap().is_none());
        assert_eq!(cur.pos(), 2);
    }

    #[test]
    fn test_nested_cursors_are_independent() {
        let list = List(vec![d(Int(1)), d(Int(2)), d(Int(3))]);
        let mut outer = Cursor::begin();
        let mut seen = 0;
        while let Some(_) = outer.next(&list).unwrap() {
            let mut inner = Cursor::begin();
            while let Some(_) = inner.next(&list).unwrap() {
                seen += 1;
            }
        }
        assert_eq!(seen, 9);
    }

    #[test]
    fn test_custom_type_field_policy() {
        let animal = CustomTypeDef::new("Animal", None);
        animal.borrow_mut().add_tp_field("population", d(Int(0)));
        animal.borrow_mut().add_inst_field("name", d(Null));
        let dog = CustomTypeDef::new("Dog", Some(animal.clone()));
        dog.borrow_mut().add_inst_field("breed", d(s("unknown")));

        assert!(dog.borrow().has_tp_field("population"));
        assert!(dog.borrow().has_inst_field("name"));
        assert!(dog.borrow().belongs_to(&animal));
        assert!(!animal.borrow().belongs_to(&dog));

        // Writing a parent-declared type field through the child lands
        // on the parent level.
        dog.borrow().get_tp_field("population").unwrap();
        dog.borrow_mut().set_tp_field("population", d(Int(7))).unwrap();
        assert_eq!(animal.borrow().get_tp_field("population").unwrap().value_str(), "7");

        let mut inst = InstData::new(dog.clone());
        assert_eq!(inst.get_field("breed", None).unwrap().value_str(), "unknown");
        inst.set_field("name", d(s("rex")), None).unwrap();
        assert_eq!(inst.get_field("name", None).unwrap().value_str(), "rex");
        assert!(inst.get_field("missing", None).is_err());
    }

    #[test]
    fn test_instance_defaults_are_copies() {
        let t = CustomTypeDef::new("Box", None);
        t.borrow_mut().add_inst_field("size", d(Int(1)));
        let a = InstData::new(t.clone());
        let b = InstData::new(t.clone());
        a.get_field("size", None)
            .unwrap()
            .update_from(&d(Int(9)))
            .unwrap();
        assert_eq!(b.get_field("size", None).unwrap().value_str(), "1");
    }

    #[test]
    fn test_copy_shares_children() {
        let child = d(Int(1));
        let list = d(List(vec![child.clone()]));
        let copied = list.copy();
        assert_ne!(list.inst_id(), copied.inst_id());
        child.update_from(&d(Int(5))).unwrap();
        assert_eq!(copied.value_str(), "[5]");
    }

    #[test]
    fn test_time_arithmetic() {
        let mut t = TimeData::new(2024, 1, 31, 12, 0, 0);
        t.add_months(1);
        assert_eq!((t.year, t.month, t.day), (2024, 2, 29));
        t.add_days(1);
        assert_eq!((t.year, t.month, t.day), (2024, 3, 1));
        let stamp = t.timestamp();
        let back = TimeData::from_timestamp(stamp);
        assert_eq!(back.timestamp(), stamp);
    }

    #[test]
    fn test_value_str_shapes() {
        assert_eq!(Null.value_str(), "null");
        assert_eq!(Float(2.0).value_str(), "2.0");
        assert_eq!(Bool(true).value_str(), "true");
        assert_eq!(Char(b'a').value_str(), "a");
        let list = List(vec![d(Int(1)), d(s("x"))]);
        assert_eq!(list.value_str(), "[1, \"x\"]");
        assert_eq!(s("a\"b").escaped_str(), "\"a\\\"b\"");
    }
}
