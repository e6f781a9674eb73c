// The built-in opcode table: one static entry per opcode, carrying its
// name, whether it opens a scope block in source, whether that scope
// is delayed-release, its arity rule, and the executor. The table
// order is fixed — the binary codec writes opcode indices into it.

use std::collections::HashMap;
use std::rc::Rc;

use crate::engine::{Status, Vm};
use crate::error;
use crate::ins::{keyword_kind, Arg, ArgKind, Ins, InsSet, KeywordKind};
use crate::value::{
    expected, Cursor, CustomTypeDef, Data, DataRef, ExtData, ExtKind, FileData, FileMode,
    FuncData, InstData, Relational, TimeData, TimeFormat, TypeRef, TypeTag, Value,
};
use crate::vmtry;


#[derive(Copy, Clone, Debug)]
pub enum Arity {
    Exact(usize),
    AtLeast(usize),
    Between(usize, usize),
    Any,
}

impl Arity {
    pub fn accepts(&self, n: usize) -> bool {
        match *self {
            Arity::Exact(k) => n == k,
            Arity::AtLeast(k) => n >= k,
            Arity::Between(lo, hi) => n >= lo && n <= hi,
            Arity::Any => true,
        }
    }

    pub fn describe(&self) -> String {
        match *self {
            Arity::Exact(k) => format!("{}", k),
            Arity::AtLeast(k) => format!("{}+", k),
            Arity::Between(lo, hi) => format!("{}..{}", lo, hi),
            Arity::Any => "any".to_string(),
        }
    }
}


pub type Executor = fn(&mut Vm, &InsSet, &Ins, &mut usize) -> Status;

#[derive(Debug)]
pub struct Ri {
    pub name: &'static str,
    pub opens_scope: bool,
    pub delayed_release: bool,
    pub arity: Arity,
    pub exec: Executor,
}

impl Ri {
    pub fn to_display(&self) -> String {
        format!("[RI: {}]", self.name)
    }
}

impl PartialEq for Ri {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}


macro_rules! ri {
    ($name:literal, $opens:expr, $delayed:expr, $arity:expr, $exec:expr) => {
        Ri {
            name: $name,
            opens_scope: $opens,
            delayed_release: $delayed,
            arity: $arity,
            exec: $exec,
        }
    };
}

use Arity::*;

pub static RI_TABLE: &[Ri] = &[
    // data
    ri!("VAR", false, false, Exact(2), exec_var),
    ri!("GLOBAL", false, false, Exact(2), exec_global),
    ri!("DEL", false, false, Exact(1), exec_del),
    ri!("COPY", false, false, Exact(2), exec_copy),
    ri!("QOT", false, false, Exact(2), exec_qot),
    ri!("PAIR", false, false, Exact(3), exec_pair),
    ri!("UNPAIR", false, false, Exact(3), exec_unpair),
    // arithmetic / logic
    ri!("OPT", false, false, Exact(4), exec_opt),
    ri!("NEG", false, false, Exact(2), exec_neg),
    ri!("CMP", false, false, Exact(3), exec_cmp),
    // containers
    ri!("SET_AT", false, false, Exact(3), exec_set_at),
    ri!("GET_AT", false, false, Exact(3), exec_get_at),
    ri!("APPEND", false, false, Exact(2), exec_append),
    ri!("INSERT", false, false, Exact(3), exec_insert),
    ri!("ERASE", false, false, Exact(2), exec_erase),
    ri!("SUB_PART", false, false, Exact(4), exec_sub_part),
    ri!("SPLICE", false, false, Exact(2), exec_splice),
    ri!("CONTAINS", false, false, Exact(3), exec_contains),
    ri!("SIZE", false, false, Exact(2), exec_size),
    // control
    ri!("IF", true, false, Between(2, 3), exec_if),
    ri!("REPEAT", true, false, Exact(1), exec_repeat),
    ri!("UNTIL", true, false, Exact(3), exec_until),
    ri!("ITER_TRAV", true, false, Exact(2), exec_iter_trav),
    ri!("ITER_REV_TRAV", true, false, Exact(2), exec_iter_rev_trav),
    ri!("BREAK", false, false, Exact(0), exec_break),
    ri!("CONT", false, false, Exact(0), exec_cont),
    ri!("JUMP", false, false, Exact(1), exec_jump),
    ri!("SET", false, false, Exact(1), exec_set_label),
    ri!("END", false, false, Between(0, 1), exec_end),
    ri!("EXIT", false, false, Exact(0), exec_exit),
    // callables
    ri!("FUNC", true, false, AtLeast(1), exec_func),
    ri!("RFUNC", true, false, AtLeast(1), exec_rfunc),
    ri!("RET", false, false, Between(0, 1), exec_ret),
    ri!("CALL", false, false, AtLeast(2), exec_call),
    // errors
    ri!("DETECT", true, false, Exact(0), exec_detect),
    ri!("ATMP", true, true, Exact(0), exec_atmp),
    ri!("FINALLY", true, false, Exact(0), exec_finally),
    ri!("THROW", false, false, AtLeast(1), exec_throw),
    ri!("EXPOSE", false, false, Exact(1), exec_expose),
    // scopes and linking
    ri!("SP_NEW", true, false, Exact(0), exec_block),
    ri!("RASM", true, false, Exact(0), exec_block),
    ri!("SRC", true, false, Exact(0), exec_block),
    ri!("LINK", false, false, Exact(1), exec_noop),
    ri!("EXT", false, false, Exact(2), exec_ext),
    ri!("EXT_GET", false, false, Exact(3), exec_ext_get),
    // custom types
    ri!("TP_DEF", false, false, Between(1, 2), exec_tp_def),
    ri!("TP_ADD_TPF", false, false, Between(2, 3), exec_tp_add_tpf),
    ri!("TP_ADD_INSF", false, false, Between(2, 3), exec_tp_add_insf),
    ri!("TP_SET", false, false, Exact(3), exec_tp_set),
    ri!("TP_GET", false, false, Exact(3), exec_tp_get),
    ri!("TP_NEW", false, false, Exact(2), exec_tp_new),
    ri!("INST_SET", false, false, Between(3, 4), exec_inst_set),
    ri!("INST_GET", false, false, Between(3, 4), exec_inst_get),
    ri!("BELONG", false, false, Exact(3), exec_belong),
    // files and time
    ri!("FILE", false, false, Exact(3), exec_file),
    ri!("FILE_READ", false, false, Exact(2), exec_file_read),
    ri!("FILE_WRITE", false, false, Exact(2), exec_file_write),
    ri!("TIME", false, false, Exact(1), exec_time),
    ri!("TIME_ADD", false, false, Exact(3), exec_time_add),
    ri!("TIME_FMT", false, false, Exact(2), exec_time_fmt),
    // io
    ri!("PRINT", false, false, Any, exec_print),
    ri!("PUT", false, false, Any, exec_put),
    ri!("INPUT", false, false, AtLeast(1), exec_input),
];

lazy_static! {
    static ref RI_INDEX: HashMap<&'static str, usize> = {
        let mut m = HashMap::new();
        for (i, ri) in RI_TABLE.iter().enumerate() {
            m.insert(ri.name, i);
        }
        m
    };
}

pub fn ri_by_name(name: &str) -> Option<&'static Ri> {
    RI_INDEX.get(name).map(|&i| &RI_TABLE[i])
}

pub fn ri_index_of(ri: &Ri) -> usize {
    RI_INDEX[ri.name]
}

pub fn ri_at(index: usize) -> Option<&'static Ri> {
    RI_TABLE.get(index)
}


// --- shared helpers --------------------------------------------------------

fn require_identifier(arg: &Arg) -> Result<(), error::Error> {
    if arg.kind == ArgKind::Identifier {
        Ok(())
    } else {
        Err(error::argument(
            format!("Expected an identifier, got {}", arg.to_display()),
            vec!["Names start with a letter or underscore.".to_string()],
        ))
    }
}

// Rebind a creation result: update the nearest holder or add a fresh
// binding, never writing through a quote.
fn bind_name(vm: &mut Vm, arg: &Arg, data: DataRef) -> Result<(), error::Error> {
    require_identifier(arg)?;
    if !vm.memory.update_data_by_name(&arg.text, data.clone())? {
        vm.memory.add_data(&arg.text, data, "")?;
    }
    Ok(())
}

// Mutating a container that is also the operand would alias the same
// cell mutably and immutably; give the operand its own skeleton.
fn detached(container: &DataRef, value: DataRef) -> DataRef {
    if Rc::ptr_eq(container, &value) {
        value.copy()
    } else {
        value
    }
}

// The default value a tp-* keyword denotes when used as an
// initializer.
fn default_of_type_keyword(text: &str) -> Option<Value> {
    match text {
        "tp-int" => Some(Value::Int(0)),
        "tp-float" => Some(Value::Float(0.0)),
        "tp-bool" => Some(Value::Bool(false)),
        "tp-char" => Some(Value::Char(0)),
        "tp-str" => Some(Value::Str(String::new())),
        "tp-list" => Some(Value::List(Vec::new())),
        "tp-dict" => Some(Value::Dict(crate::value::Dict::new())),
        "tp-series" => Some(Value::Series(Vec::new())),
        "tp-pair" => Some(Value::Pair(Data::new(Value::Null), Data::new(Value::Null))),
        "tp-null" => Some(Value::Null),
        "tp-time" => Some(Value::Time(TimeData::new(1970, 1, 1, 0, 0, 0))),
        _ => None,
    }
}

fn initial_value(vm: &mut Vm, arg: &Arg) -> Result<DataRef, error::Error> {
    if arg.kind == ArgKind::Keyword {
        if let Some(default) = default_of_type_keyword(&arg.text) {
            return Ok(Data::new(default));
        }
    }
    Ok(vm.arg_value(arg)?.copy())
}

fn type_ref_of(vm: &mut Vm, arg: &Arg) -> Result<TypeRef, error::Error> {
    let data = vm.arg_value(arg)?;
    let t = match &*data.value() {
        Value::Type(t) => Some(t.clone()),
        _ => None,
    };
    t.ok_or_else(|| expected(TypeTag::Type.into(), &data.value()))
}

fn relational_of(arg: &Arg) -> Result<Relational, error::Error> {
    Relational::from_str(&arg.text).ok_or_else(|| {
        error::value_err(
            vec![format!("Invalid relation: {}", arg.to_display())],
            vec![
                "The relation string contains only 'RG', 'RGE', 'RNE', 'RE', 'RAE', 'RLE', \
                 'RL', 'RT', 'RF', 'AND', 'OR'."
                    .to_string(),
            ],
        )
    })
}


// --- data ------------------------------------------------------------------

fn exec_var(vm: &mut Vm, _set: &InsSet, ins: &Ins, _pc: &mut usize) -> Status {
    vmtry!(require_identifier(&ins.args[0]), ins);
    let value = vmtry!(initial_value(vm, &ins.args[1]), ins);
    vmtry!(vm.memory.add_data(&ins.args[0].text, value, ""), ins);
    Status::Normal
}

fn exec_global(vm: &mut Vm, _set: &InsSet, ins: &Ins, _pc: &mut usize) -> Status {
    vmtry!(require_identifier(&ins.args[0]), ins);
    let value = vmtry!(initial_value(vm, &ins.args[1]), ins);
    vmtry!(vm.memory.add_global_data(&ins.args[0].text, value), ins);
    Status::Normal
}

fn exec_del(vm: &mut Vm, _set: &InsSet, ins: &Ins, _pc: &mut usize) -> Status {
    let removed = vmtry!(vm.memory.remove_data_by_name(&ins.args[0].text), ins);
    if !removed {
        let err = error::Error::new(
            error::ErrorKind::Memory,
            error::UNKNOWN,
            error::UNKNOWN,
            vec![format!("No binding named \"{}\" to delete.", ins.args[0].text)],
            vec!["DEL only removes names that are currently bound.".to_string()],
        );
        return Status::Thrown(err.at(&ins.pos, &ins.raw_code));
    }
    Status::Normal
}

fn exec_copy(vm: &mut Vm, _set: &InsSet, ins: &Ins, _pc: &mut usize) -> Status {
    let src = vmtry!(vm.arg_value(&ins.args[1]), ins);
    vmtry!(vm.write_arg(&ins.args[0], src.copy()), ins);
    Status::Normal
}

fn exec_qot(vm: &mut Vm, _set: &InsSet, ins: &Ins, _pc: &mut usize) -> Status {
    vmtry!(require_identifier(&ins.args[1]), ins);
    let target = match vm.memory.find_data_by_name(&ins.args[1].text) {
        Some((id, _)) => id,
        None => {
            let err = error::Error::new(
                error::ErrorKind::Memory,
                error::UNKNOWN,
                error::UNKNOWN,
                vec![format!("Cannot quote undefined name \"{}\".", ins.args[1].text)],
                vec!["A quote aliases an existing binding.".to_string()],
            );
            return Status::Thrown(err.at(&ins.pos, &ins.raw_code));
        }
    };
    vmtry!(bind_name(vm, &ins.args[0], Data::new(Value::Quote(target))), ins);
    Status::Normal
}

fn exec_pair(vm: &mut Vm, _set: &InsSet, ins: &Ins, _pc: &mut usize) -> Status {
    let key = vmtry!(vm.arg_value(&ins.args[1]), ins);
    let value = vmtry!(vm.arg_value(&ins.args[2]), ins);
    vmtry!(vm.write_arg(&ins.args[0], Data::new(Value::Pair(key, value))), ins);
    Status::Normal
}

fn exec_unpair(vm: &mut Vm, _set: &InsSet, ins: &Ins, _pc: &mut usize) -> Status {
    let pair = vmtry!(vm.arg_value(&ins.args[2]), ins);
    let parts = match &*pair.value() {
        Value::Pair(k, v) => Some((k.clone(), v.clone())),
        _ => None,
    };
    let (k, v) = match parts {
        Some(parts) => parts,
        None => {
            return Status::Thrown(
                expected(TypeTag::Pair.into(), &pair.value()).at(&ins.pos, &ins.raw_code),
            )
        }
    };
    vmtry!(vm.write_arg(&ins.args[0], k), ins);
    vmtry!(vm.write_arg(&ins.args[1], v), ins);
    Status::Normal
}


// --- arithmetic / logic ----------------------------------------------------

fn exec_opt(vm: &mut Vm, _set: &InsSet, ins: &Ins, _pc: &mut usize) -> Status {
    let a = vmtry!(vm.arg_value(&ins.args[1]), ins);
    let b = vmtry!(vm.arg_value(&ins.args[2]), ins);
    let op = &ins.args[3].text;
    let result = if let Some(rel) = Relational::from_str(op) {
        let outcome = vmtry!(a.compare(&b, rel), ins);
        Value::Bool(outcome)
    } else {
        let computed = {
            let left = a.value();
            let right = b.value();
            match op.as_str() {
                "+" => left.add(&right),
                "-" => left.sub(&right),
                "*" => left.mul(&right),
                "/" => left.div(&right),
                "%" => left.modulo(&right),
                "^" => left.pow(&right),
                "~" => left.root(&right),
                _ => Err(error::value_err(
                    vec![format!("Unsupported operator: {}", ins.args[3].to_display())],
                    vec!["Operators are '+', '-', '*', '/', '%', '^', '~', or a relation."
                        .to_string()],
                )),
            }
        };
        vmtry!(computed, ins)
    };
    vmtry!(vm.write_arg(&ins.args[0], Data::new(result)), ins);
    Status::Normal
}

fn exec_neg(vm: &mut Vm, _set: &InsSet, ins: &Ins, _pc: &mut usize) -> Status {
    let a = vmtry!(vm.arg_value(&ins.args[1]), ins);
    let negated = vmtry!(a.value().neg(), ins);
    vmtry!(vm.write_arg(&ins.args[0], Data::new(negated)), ins);
    Status::Normal
}

// Record the identities of two bindings for later comparison.
fn exec_cmp(vm: &mut Vm, _set: &InsSet, ins: &Ins, _pc: &mut usize) -> Status {
    vmtry!(require_identifier(&ins.args[1]), ins);
    vmtry!(require_identifier(&ins.args[2]), ins);
    let left = match vm.memory.find_data_by_name(&ins.args[1].text) {
        Some((id, _)) => id,
        None => return undefined(vm, ins, &ins.args[1]),
    };
    let right = match vm.memory.find_data_by_name(&ins.args[2].text) {
        Some((id, _)) => id,
        None => return undefined(vm, ins, &ins.args[2]),
    };
    vmtry!(bind_name(vm, &ins.args[0], Data::new(Value::CmpGroup(left, right))), ins);
    Status::Normal
}

fn undefined(_vm: &mut Vm, ins: &Ins, arg: &Arg) -> Status {
    let err = error::Error::new(
        error::ErrorKind::Memory,
        error::UNKNOWN,
        error::UNKNOWN,
        vec![format!("No binding is named \"{}\" in any reachable scope.", arg.text)],
        vec!["Define the name with VAR or GLOBAL before using it.".to_string()],
    );
    Status::Thrown(err.at(&ins.pos, &ins.raw_code))
}


// --- containers ------------------------------------------------------------

fn exec_set_at(vm: &mut Vm, _set: &InsSet, ins: &Ins, _pc: &mut usize) -> Status {
    let container = vmtry!(vm.arg_value(&ins.args[0]), ins);
    let key = vmtry!(vm.arg_value(&ins.args[1]), ins);
    let value = detached(&container, vmtry!(vm.arg_value(&ins.args[2]), ins));
    if container.type_tag() == TypeTag::Dict {
        let key_str = key.escaped_str();
        let pair = Data::new(Value::Pair(key, value));
        if let Value::Dict(dict) = &mut *container.value_mut() {
            dict.insert(key_str, pair);
        }
        return Status::Normal;
    }
    let index = vmtry!(vm.int_of(&ins.args[1]), ins);
    if index < 0 {
        return Status::Thrown(
            error::range_err(format!("{}", index), 0).at(&ins.pos, &ins.raw_code),
        );
    }
    vmtry!(container.value_mut().set_at(index as usize, value), ins);
    Status::Normal
}

fn exec_get_at(vm: &mut Vm, _set: &InsSet, ins: &Ins, _pc: &mut usize) -> Status {
    let container = vmtry!(vm.arg_value(&ins.args[1]), ins);
    let tag = container.type_tag();
    let found = match tag {
        TypeTag::Dict => {
            let key = vmtry!(vm.arg_value(&ins.args[2]), ins);
            let key_str = key.escaped_str();
            let pair = {
                let value = container.value();
                match &*value {
                    Value::Dict(d) => d.get(&key_str).cloned(),
                    _ => None,
                }
            };
            let pair = match pair {
                Some(p) => p,
                None => {
                    return Status::Thrown(
                        error::key_err(&key_str).at(&ins.pos, &ins.raw_code),
                    )
                }
            };
            let unwrapped = match &*pair.value() {
                Value::Pair(_, v) => v.clone(),
                _ => pair.clone(),
            };
            unwrapped
        }
        // Field access on a first-class error value.
        TypeTag::Error => {
            let key = vmtry!(vm.arg_value(&ins.args[2]), ins);
            let key_str = key.value_str();
            let picked = {
                let value = container.value();
                match &*value {
                    Value::ErrVal(e) => match key_str.as_str() {
                        "kind" => Some(Value::Str(e.kind_name.clone())),
                        "position" => Some(Value::Str(e.position.clone())),
                        "line" => Some(Value::Str(e.line.clone())),
                        "info" => Some(Value::List(
                            e.info.iter().map(|s| Data::new(Value::Str(s.clone()))).collect(),
                        )),
                        "tips" => Some(Value::List(
                            e.tips.iter().map(|s| Data::new(Value::Str(s.clone()))).collect(),
                        )),
                        _ => None,
                    },
                    _ => None,
                }
            };
            match picked {
                Some(v) => Data::new(v),
                None => {
                    return Status::Thrown(
                        error::key_err(&key_str).at(&ins.pos, &ins.raw_code),
                    )
                }
            }
        }
        _ => {
            let index = vmtry!(vm.int_of(&ins.args[2]), ins);
            if index < 0 {
                return Status::Thrown(
                    error::range_err(format!("{}", index), 0).at(&ins.pos, &ins.raw_code),
                );
            }
            let item = {
                let value = container.value();
                value.get_at(index as usize)
            };
            vmtry!(item, ins)
        }
    };
    vmtry!(vm.write_arg(&ins.args[0], found), ins);
    Status::Normal
}

fn exec_append(vm: &mut Vm, _set: &InsSet, ins: &Ins, _pc: &mut usize) -> Status {
    let container = vmtry!(vm.arg_value(&ins.args[0]), ins);
    let value = detached(&container, vmtry!(vm.arg_value(&ins.args[1]), ins));
    vmtry!(container.value_mut().append(value), ins);
    Status::Normal
}

fn exec_insert(vm: &mut Vm, _set: &InsSet, ins: &Ins, _pc: &mut usize) -> Status {
    let container = vmtry!(vm.arg_value(&ins.args[0]), ins);
    let index = vmtry!(vm.int_of(&ins.args[1]), ins);
    if index < 0 {
        return Status::Thrown(
            error::range_err(format!("{}", index), 0).at(&ins.pos, &ins.raw_code),
        );
    }
    let value = detached(&container, vmtry!(vm.arg_value(&ins.args[2]), ins));
    vmtry!(container.value_mut().insert_at(index as usize, value), ins);
    Status::Normal
}

fn exec_erase(vm: &mut Vm, _set: &InsSet, ins: &Ins, _pc: &mut usize) -> Status {
    let container = vmtry!(vm.arg_value(&ins.args[0]), ins);
    if container.type_tag() == TypeTag::Dict && ins.args[1].kind == ArgKind::Str {
        let key = vmtry!(vm.arg_value(&ins.args[1]), ins);
        let key_str = key.escaped_str();
        let removed = match &mut *container.value_mut() {
            Value::Dict(d) => d.remove(&key_str).is_some(),
            _ => false,
        };
        if !removed {
            return Status::Thrown(error::key_err(&key_str).at(&ins.pos, &ins.raw_code));
        }
        return Status::Normal;
    }
    let index = vmtry!(vm.int_of(&ins.args[1]), ins);
    if index < 0 {
        return Status::Thrown(
            error::range_err(format!("{}", index), 0).at(&ins.pos, &ins.raw_code),
        );
    }
    vmtry!(container.value_mut().erase_at(index as usize), ins);
    Status::Normal
}

fn exec_sub_part(vm: &mut Vm, _set: &InsSet, ins: &Ins, _pc: &mut usize) -> Status {
    let container = vmtry!(vm.arg_value(&ins.args[1]), ins);
    let begin = vmtry!(vm.int_of(&ins.args[2]), ins);
    let end = vmtry!(vm.int_of(&ins.args[3]), ins);
    if begin < 0 || end < 0 {
        return Status::Thrown(
            error::range_err(format!("{}..{}", begin, end), 0).at(&ins.pos, &ins.raw_code),
        );
    }
    let part = {
        let value = container.value();
        value.subpart(begin as usize, end as usize)
    };
    let part = vmtry!(part, ins);
    vmtry!(vm.write_arg(&ins.args[0], Data::new(part)), ins);
    Status::Normal
}

fn exec_splice(vm: &mut Vm, _set: &InsSet, ins: &Ins, _pc: &mut usize) -> Status {
    let container = vmtry!(vm.arg_value(&ins.args[0]), ins);
    let other = vmtry!(vm.arg_value(&ins.args[1]), ins);
    let other_value = other.value().clone();
    vmtry!(container.value_mut().splice(&other_value), ins);
    Status::Normal
}

fn exec_contains(vm: &mut Vm, _set: &InsSet, ins: &Ins, _pc: &mut usize) -> Status {
    let container = vmtry!(vm.arg_value(&ins.args[1]), ins);
    let value = detached(&container, vmtry!(vm.arg_value(&ins.args[2]), ins));
    let holds = {
        let c = container.value();
        c.contains(&value)
    };
    let holds = vmtry!(holds, ins);
    vmtry!(vm.write_arg(&ins.args[0], Data::new(Value::Bool(holds))), ins);
    Status::Normal
}

fn exec_size(vm: &mut Vm, _set: &InsSet, ins: &Ins, _pc: &mut usize) -> Status {
    let container = vmtry!(vm.arg_value(&ins.args[1]), ins);
    let size = {
        let c = container.value();
        c.size()
    };
    let size = vmtry!(size, ins);
    vmtry!(vm.write_arg(&ins.args[0], Data::new(Value::Int(size as i64))), ins);
    Status::Normal
}


// --- control ---------------------------------------------------------------

// IF: a, b, REL — or IF: x, RT / IF: grp, REL over a recorded
// compare group.
fn exec_if(vm: &mut Vm, _set: &InsSet, ins: &Ins, _pc: &mut usize) -> Status {
    let rel_arg = match ins.args.last() {
        Some(arg) => arg,
        None => return Status::Normal,
    };
    let rel = vmtry!(relational_of(rel_arg), ins);
    let holds = if ins.args.len() == 3 {
        let a = vmtry!(vm.arg_value(&ins.args[0]), ins);
        let b = vmtry!(vm.arg_value(&ins.args[1]), ins);
        vmtry!(a.compare(&b, rel), ins)
    } else {
        let operand = vmtry!(vm.arg_value(&ins.args[0]), ins);
        let sides = vmtry!(vm.cmp_group_sides(&operand), ins);
        match sides {
            Some((l, r)) => vmtry!(l.compare(&r, rel), ins),
            None => vmtry!(operand.compare(&operand, rel), ins),
        }
    };
    if holds {
        vm.run_block(ins)
    } else {
        Status::Normal
    }
}

fn exec_repeat(vm: &mut Vm, _set: &InsSet, ins: &Ins, _pc: &mut usize) -> Status {
    let count = vmtry!(vm.int_of(&ins.args[0]), ins);
    for _ in 0..count.max(0) {
        match vm.run_block(ins) {
            Status::Normal | Status::ContinueLoop => {}
            Status::BreakLoop => break,
            other => return other,
        }
    }
    Status::Normal
}

// Run the body, then test; the loop ends once the relation holds.
fn exec_until(vm: &mut Vm, _set: &InsSet, ins: &Ins, _pc: &mut usize) -> Status {
    let rel = vmtry!(relational_of(&ins.args[2]), ins);
    loop {
        match vm.run_block(ins) {
            Status::Normal | Status::ContinueLoop => {}
            Status::BreakLoop => break,
            other => return other,
        }
        let a = vmtry!(vm.arg_value(&ins.args[0]), ins);
        let b = vmtry!(vm.arg_value(&ins.args[1]), ins);
        if vmtry!(a.compare(&b, rel), ins) {
            break;
        }
    }
    Status::Normal
}

fn iter_bind_and_run(vm: &mut Vm, ins: &Ins, item: DataRef) -> Status {
    let child = match &ins.scope_set {
        Some(child) => child.clone(),
        None => return Status::Normal,
    };
    let prefix = format!("{}-", ins.ri.name);
    let scope = vm.memory.acquire_scope(&prefix, None);
    if let Err(e) = scope.borrow_mut().add_by_name(&ins.args[1].text, item) {
        vm.memory.release_scope(&scope);
        return Status::Thrown(e.at(&ins.pos, &ins.raw_code));
    }
    let status = vm.execute_set(&child);
    vm.memory.release_scope(&scope);
    match status {
        Status::Thrown(mut e) => {
            e.add_trace(format!("    at [Scope: {}] ({})", prefix, ins.pos));
            Status::Thrown(e)
        }
        other => other,
    }
}

fn exec_iter_trav(vm: &mut Vm, _set: &InsSet, ins: &Ins, _pc: &mut usize) -> Status {
    vmtry!(require_identifier(&ins.args[1]), ins);
    let container = vmtry!(vm.arg_value(&ins.args[0]), ins);
    let mut cursor = Cursor::begin();
    loop {
        let item = {
            let value = container.value();
            vmtry!(cursor.next(&value), ins)
        };
        let item = match item {
            Some(item) => item,
            None => break,
        };
        match iter_bind_and_run(vm, ins, item) {
            Status::Normal | Status::ContinueLoop => {}
            Status::BreakLoop => break,
            other => return other,
        }
    }
    Status::Normal
}

fn exec_iter_rev_trav(vm: &mut Vm, _set: &InsSet, ins: &Ins, _pc: &mut usize) -> Status {
    vmtry!(require_identifier(&ins.args[1]), ins);
    let container = vmtry!(vm.arg_value(&ins.args[0]), ins);
    let size = {
        let value = container.value();
        vmtry!(value.size(), ins)
    };
    for index in (0..size).rev() {
        let item = {
            let value = container.value();
            vmtry!(value.get_at(index), ins)
        };
        match iter_bind_and_run(vm, ins, item) {
            Status::Normal | Status::ContinueLoop => {}
            Status::BreakLoop => break,
            other => return other,
        }
    }
    Status::Normal
}

fn exec_break(_vm: &mut Vm, _set: &InsSet, _ins: &Ins, _pc: &mut usize) -> Status {
    Status::BreakLoop
}

fn exec_cont(_vm: &mut Vm, _set: &InsSet, _ins: &Ins, _pc: &mut usize) -> Status {
    Status::ContinueLoop
}

fn exec_jump(_vm: &mut Vm, set: &InsSet, ins: &Ins, pc: &mut usize) -> Status {
    let target = vmtry!(set.get_label(&ins.args[0].text), ins);
    *pc = target;
    Status::Jumped
}

// Labels are recorded at parse time; at run time SET is a no-op.
fn exec_set_label(_vm: &mut Vm, _set: &InsSet, _ins: &Ins, _pc: &mut usize) -> Status {
    Status::Normal
}

fn exec_end(_vm: &mut Vm, _set: &InsSet, _ins: &Ins, _pc: &mut usize) -> Status {
    Status::Normal
}

fn exec_exit(_vm: &mut Vm, _set: &InsSet, _ins: &Ins, _pc: &mut usize) -> Status {
    Status::Exit
}


// --- callables -------------------------------------------------------------

fn define_function(vm: &mut Vm, ins: &Ins, returns: bool) -> Status {
    vmtry!(require_identifier(&ins.args[0]), ins);
    let name = ins.args[0].text.clone();
    let mut params = Vec::new();
    for arg in &ins.args[1..] {
        vmtry!(require_identifier(arg), ins);
        params.push(arg.text.clone());
    }
    let body = match &ins.scope_set {
        Some(body) => body.clone(),
        None => Rc::new(InsSet::new("FUNC-")),
    };
    let func = Rc::new(FuncData { name: name.clone(), params, body });
    let value = if returns {
        Value::RetFunc(func)
    } else {
        Value::Func(func)
    };
    vmtry!(bind_name(vm, &ins.args[0], Data::new(value)), ins);
    Status::Normal
}

fn exec_func(vm: &mut Vm, _set: &InsSet, ins: &Ins, _pc: &mut usize) -> Status {
    define_function(vm, ins, false)
}

fn exec_rfunc(vm: &mut Vm, _set: &InsSet, ins: &Ins, _pc: &mut usize) -> Status {
    define_function(vm, ins, true)
}

fn exec_ret(vm: &mut Vm, _set: &InsSet, ins: &Ins, _pc: &mut usize) -> Status {
    let value = match ins.args.get(0) {
        Some(arg) => vmtry!(vm.arg_value(arg), ins),
        None => Data::new(Value::Null),
    };
    Status::Return(value)
}

fn exec_call(vm: &mut Vm, _set: &InsSet, ins: &Ins, _pc: &mut usize) -> Status {
    let callee = vmtry!(vm.arg_value(&ins.args[1]), ins);
    let func = {
        let value = callee.value();
        match &*value {
            Value::Func(f) | Value::RetFunc(f) => f.clone(),
            other => {
                return Status::Thrown(
                    expected(TypeTag::Func | TypeTag::RetFunc, other)
                        .at(&ins.pos, &ins.raw_code),
                )
            }
        }
    };
    let mut call_args = Vec::new();
    for arg in &ins.args[2..] {
        call_args.push(vmtry!(vm.arg_value(arg), ins));
    }
    match vm.call_function(ins, func, call_args) {
        Status::Normal => {}
        other => return other,
    }
    let result = match vm.memory.find_data_by_name("SR") {
        Some((_, data)) => data.copy(),
        None => Data::new(Value::Null),
    };
    vmtry!(vm.write_arg(&ins.args[0], result), ins);
    Status::Normal
}


// --- errors ----------------------------------------------------------------

fn finally_sibling<'a>(set: &'a InsSet, pc: usize) -> Option<&'a Ins> {
    set.ins.get(pc + 1).filter(|next| next.ri.name == "FINALLY")
}

// DETECT installs a handler over its body. A thrown error is bound to
// SE and control transfers to the FINALLY sibling, if any; on a clean
// exit the sibling is skipped.
fn exec_detect(vm: &mut Vm, set: &InsSet, ins: &Ins, pc: &mut usize) -> Status {
    let status = vm.run_block(ins);
    let has_sibling = finally_sibling(set, *pc).is_some();
    match status {
        Status::Thrown(e) => {
            vmtry!(
                vm.memory
                    .update_data_by_name("SE", Data::new(Value::ErrVal(Box::new(e)))),
                ins
            );
            if let Some(sibling) = finally_sibling(set, *pc) {
                match vm.run_block(sibling) {
                    Status::Normal => {}
                    other => return other,
                }
            }
            *pc += if has_sibling { 2 } else { 1 };
            Status::Jumped
        }
        Status::Normal => {
            if has_sibling {
                *pc += 2;
                Status::Jumped
            } else {
                Status::Normal
            }
        }
        other => other,
    }
}

// ATMP is the delayed-release form: its scope survives the block's own
// END so the FINALLY sibling runs inside it, and is released only
// afterwards. Errors in the body are caught and bound like DETECT;
// release happens on every path.
fn exec_atmp(vm: &mut Vm, set: &InsSet, ins: &Ins, pc: &mut usize) -> Status {
    let child = match &ins.scope_set {
        Some(child) => child.clone(),
        None => return Status::Normal,
    };
    let scope = vm.memory.acquire_scope("ATMP-", None);
    let status = vm.execute_set(&child);
    let status = match status {
        Status::Thrown(e) => {
            let bound = vm
                .memory
                .update_data_by_name("SE", Data::new(Value::ErrVal(Box::new(e))));
            if let Err(bind_err) = bound {
                vm.memory.release_scope(&scope);
                return Status::Thrown(bind_err.at(&ins.pos, &ins.raw_code));
            }
            Status::Normal
        }
        other => other,
    };
    match status {
        Status::Normal => {}
        other => {
            vm.memory.release_scope(&scope);
            return other;
        }
    }
    let has_sibling = finally_sibling(set, *pc).is_some();
    if let Some(sibling) = finally_sibling(set, *pc) {
        if let Some(finally_child) = &sibling.scope_set {
            let finally_child = finally_child.clone();
            match vm.execute_set(&finally_child) {
                Status::Normal => {}
                Status::Thrown(mut e) => {
                    vm.memory.release_scope(&scope);
                    e.add_trace(format!("    at [Scope: FINALLY-] ({})", sibling.pos));
                    return Status::Thrown(e);
                }
                other => {
                    vm.memory.release_scope(&scope);
                    return other;
                }
            }
        }
    }
    vm.memory.release_scope(&scope);
    *pc += if has_sibling { 2 } else { 1 };
    Status::Jumped
}

// A FINALLY reached in normal flow was already consumed by its DETECT
// or ATMP partner.
fn exec_finally(_vm: &mut Vm, _set: &InsSet, _ins: &Ins, _pc: &mut usize) -> Status {
    Status::Normal
}

fn exec_throw(vm: &mut Vm, _set: &InsSet, ins: &Ins, _pc: &mut usize) -> Status {
    let mut info = Vec::new();
    for arg in &ins.args {
        let data = vmtry!(vm.arg_value(arg), ins);
        info.push(data.value_str());
    }
    let err = error::Error::custom_named(
        "CustomError",
        error::UNKNOWN,
        error::UNKNOWN,
        info,
        Vec::new(),
    );
    Status::Thrown(err.at(&ins.pos, &ins.raw_code))
}

fn exec_expose(vm: &mut Vm, _set: &InsSet, ins: &Ins, _pc: &mut usize) -> Status {
    let data = vmtry!(vm.arg_value(&ins.args[0]), ins);
    let err = match &*data.value() {
        Value::ErrVal(e) => (**e).clone(),
        other => error::Error::custom_named(
            "CustomError",
            error::UNKNOWN,
            error::UNKNOWN,
            vec![other.value_str()],
            Vec::new(),
        ),
    };
    Status::Thrown(err.at(&ins.pos, &ins.raw_code))
}


// --- scopes and linking ----------------------------------------------------

fn exec_block(vm: &mut Vm, _set: &InsSet, ins: &Ins, _pc: &mut usize) -> Status {
    vm.run_block(ins)
}

// LINK is resolved by the assembler; the spliced program carries no
// LINK instructions at run time.
fn exec_noop(_vm: &mut Vm, _set: &InsSet, _ins: &Ins, _pc: &mut usize) -> Status {
    Status::Normal
}

fn exec_ext(vm: &mut Vm, _set: &InsSet, ins: &Ins, _pc: &mut usize) -> Status {
    vmtry!(require_identifier(&ins.args[0]), ins);
    let ident = ins.args[0].text.clone();
    if ins.args[1].kind != ArgKind::Str {
        return Status::Thrown(
            error::argument(
                format!("EXT expects a path string, got {}", ins.args[1].to_display()),
                vec!["Give the extension's file path as a quoted string.".to_string()],
            )
            .at(&ins.pos, &ins.raw_code),
        );
    }
    let path = ins.args[1].string_content();
    let kind = ExtKind::from_path(&path);
    let module = match kind {
        ExtKind::Ra => crate::parser::parse_file(vm, &path),
        ExtKind::Rsi => crate::codec::load_archive(vm, &path),
        ExtKind::Unknown => Err(error::argument(
            format!("Unsupported extension file: \"{}\"", path),
            vec!["Only 'RA' and 'RSI' files are supported.".to_string()],
        )),
    };
    let module = vmtry!(module, ins);
    let scope = vm.memory.acquire_scope("EXT-", Some(&ident));
    match vm.execute_set(&module) {
        Status::Thrown(mut e) => {
            vm.memory.release_scope(&scope);
            e.add_trace(format!("    at [Extension: {}] ({})", ident, ins.pos));
            return Status::Thrown(e);
        }
        _ => {}
    }
    vm.memory.detach_scope(&scope);
    let ext = ExtData {
        ident: ident.clone(),
        name: crate::util::file_stem(&path),
        path,
        kind,
        scope,
    };
    vmtry!(bind_name(vm, &ins.args[0], Data::new(Value::Ext(ext))), ins);
    Status::Normal
}

fn exec_ext_get(vm: &mut Vm, _set: &InsSet, ins: &Ins, _pc: &mut usize) -> Status {
    let ext = vmtry!(vm.arg_value(&ins.args[1]), ins);
    let scope = match &*ext.value() {
        Value::Ext(e) => e.scope.clone(),
        other => {
            return Status::Thrown(
                expected(TypeTag::Ext.into(), other).at(&ins.pos, &ins.raw_code),
            )
        }
    };
    let name = match ins.args[2].kind {
        ArgKind::Str => ins.args[2].string_content(),
        _ => ins.args[2].text.clone(),
    };
    let found = scope.borrow().find_by_name(&name);
    let found = match found {
        Some(found) => found,
        None => return Status::Thrown(error::key_err(&name).at(&ins.pos, &ins.raw_code)),
    };
    vmtry!(vm.write_arg(&ins.args[0], found), ins);
    Status::Normal
}


// --- custom types ----------------------------------------------------------

fn exec_tp_def(vm: &mut Vm, _set: &InsSet, ins: &Ins, _pc: &mut usize) -> Status {
    vmtry!(require_identifier(&ins.args[0]), ins);
    let parent = match ins.args.get(1) {
        Some(arg) => Some(vmtry!(type_ref_of(vm, arg), ins)),
        None => None,
    };
    let def = CustomTypeDef::new(&ins.args[0].text, parent);
    vmtry!(bind_name(vm, &ins.args[0], Data::new(Value::Type(def))), ins);
    Status::Normal
}

fn field_default(vm: &mut Vm, ins: &Ins, index: usize) -> Result<DataRef, error::Error> {
    match ins.args.get(index) {
        Some(arg) => vm.arg_value(arg),
        None => Ok(Data::new(Value::Null)),
    }
}

fn exec_tp_add_tpf(vm: &mut Vm, _set: &InsSet, ins: &Ins, _pc: &mut usize) -> Status {
    let t = vmtry!(type_ref_of(vm, &ins.args[0]), ins);
    vmtry!(require_identifier(&ins.args[1]), ins);
    let default = vmtry!(field_default(vm, ins, 2), ins);
    t.borrow_mut().add_tp_field(&ins.args[1].text, default);
    Status::Normal
}

fn exec_tp_add_insf(vm: &mut Vm, _set: &InsSet, ins: &Ins, _pc: &mut usize) -> Status {
    let t = vmtry!(type_ref_of(vm, &ins.args[0]), ins);
    vmtry!(require_identifier(&ins.args[1]), ins);
    let default = vmtry!(field_default(vm, ins, 2), ins);
    t.borrow_mut().add_inst_field(&ins.args[1].text, default);
    Status::Normal
}

fn exec_tp_set(vm: &mut Vm, _set: &InsSet, ins: &Ins, _pc: &mut usize) -> Status {
    let t = vmtry!(type_ref_of(vm, &ins.args[0]), ins);
    let value = vmtry!(vm.arg_value(&ins.args[2]), ins);
    vmtry!(t.borrow_mut().set_tp_field(&ins.args[1].text, value), ins);
    Status::Normal
}

fn exec_tp_get(vm: &mut Vm, _set: &InsSet, ins: &Ins, _pc: &mut usize) -> Status {
    let t = vmtry!(type_ref_of(vm, &ins.args[1]), ins);
    let found = {
        let borrowed = t.borrow();
        borrowed.get_tp_field(&ins.args[2].text)
    };
    let found = vmtry!(found, ins);
    vmtry!(vm.write_arg(&ins.args[0], found), ins);
    Status::Normal
}

fn exec_tp_new(vm: &mut Vm, _set: &InsSet, ins: &Ins, _pc: &mut usize) -> Status {
    let t = vmtry!(type_ref_of(vm, &ins.args[1]), ins);
    let inst = InstData::new(t);
    vmtry!(bind_name(vm, &ins.args[0], Data::new(Value::Inst(inst))), ins);
    Status::Normal
}

fn spec_level(vm: &mut Vm, ins: &Ins, index: usize) -> Result<Option<TypeRef>, error::Error> {
    match ins.args.get(index) {
        Some(arg) => Ok(Some(type_ref_of(vm, arg)?)),
        None => Ok(None),
    }
}

fn exec_inst_set(vm: &mut Vm, _set: &InsSet, ins: &Ins, _pc: &mut usize) -> Status {
    let inst = vmtry!(vm.arg_value(&ins.args[0]), ins);
    let value = vmtry!(vm.arg_value(&ins.args[2]), ins);
    let spec = vmtry!(spec_level(vm, ins, 3), ins);
    let result = match &mut *inst.value_mut() {
        Value::Inst(data) => data.set_field(&ins.args[1].text, value, spec.as_ref()),
        other => Err(expected(TypeTag::Inst.into(), other)),
    };
    vmtry!(result, ins);
    Status::Normal
}

fn exec_inst_get(vm: &mut Vm, _set: &InsSet, ins: &Ins, _pc: &mut usize) -> Status {
    let inst = vmtry!(vm.arg_value(&ins.args[1]), ins);
    let spec = vmtry!(spec_level(vm, ins, 3), ins);
    let found = {
        let value = inst.value();
        match &*value {
            Value::Inst(data) => data.get_field(&ins.args[2].text, spec.as_ref()),
            other => Err(expected(TypeTag::Inst.into(), other)),
        }
    };
    let found = vmtry!(found, ins);
    vmtry!(vm.write_arg(&ins.args[0], found), ins);
    Status::Normal
}

fn exec_belong(vm: &mut Vm, _set: &InsSet, ins: &Ins, _pc: &mut usize) -> Status {
    let subject = vmtry!(vm.arg_value(&ins.args[1]), ins);
    let target = vmtry!(type_ref_of(vm, &ins.args[2]), ins);
    let belongs = {
        let value = subject.value();
        match &*value {
            Value::Inst(data) => data.custom_type.borrow().belongs_to(&target),
            Value::Type(t) => t.borrow().belongs_to(&target),
            other => {
                return Status::Thrown(
                    expected(TypeTag::Inst | TypeTag::Type, other)
                        .at(&ins.pos, &ins.raw_code),
                )
            }
        }
    };
    vmtry!(vm.write_arg(&ins.args[0], Data::new(Value::Bool(belongs))), ins);
    Status::Normal
}


// --- files and time --------------------------------------------------------

fn exec_file(vm: &mut Vm, _set: &InsSet, ins: &Ins, _pc: &mut usize) -> Status {
    if ins.args[1].kind != ArgKind::Str {
        return Status::Thrown(
            error::argument(
                format!("FILE expects a path string, got {}", ins.args[1].to_display()),
                vec!["Give the file path as a quoted string.".to_string()],
            )
            .at(&ins.pos, &ins.raw_code),
        );
    }
    let mode = match FileMode::from_keyword(&ins.args[2].text) {
        Some(mode) => mode,
        None => {
            return Status::Thrown(
                error::value_err(
                    vec![format!("Invalid file mode: {}", ins.args[2].to_display())],
                    vec!["File modes are 'fl-r', 'fl-w', 'fl-rw', 'fl-ap', 'fl-ra', 'fl-wa'."
                        .to_string()],
                )
                .at(&ins.pos, &ins.raw_code),
            )
        }
    };
    let file = FileData::new(&ins.args[1].string_content(), mode);
    vmtry!(bind_name(vm, &ins.args[0], Data::new(Value::File(file))), ins);
    Status::Normal
}

fn file_of(data: &DataRef) -> Result<FileData, error::Error> {
    match &*data.value() {
        Value::File(f) => Ok(f.clone()),
        other => Err(expected(TypeTag::File.into(), other)),
    }
}

fn exec_file_read(vm: &mut Vm, _set: &InsSet, ins: &Ins, _pc: &mut usize) -> Status {
    let file = vmtry!(vm.arg_value(&ins.args[1]), ins);
    let file = vmtry!(file_of(&file), ins);
    let content = vmtry!(file.read_file(), ins);
    vmtry!(vm.write_arg(&ins.args[0], Data::new(Value::Str(content))), ins);
    Status::Normal
}

fn exec_file_write(vm: &mut Vm, _set: &InsSet, ins: &Ins, _pc: &mut usize) -> Status {
    let file = vmtry!(vm.arg_value(&ins.args[0]), ins);
    let file = vmtry!(file_of(&file), ins);
    let content = vmtry!(vm.arg_value(&ins.args[1]), ins);
    vmtry!(file.write_file(&content.value_str()), ins);
    Status::Normal
}

fn exec_time(vm: &mut Vm, _set: &InsSet, ins: &Ins, _pc: &mut usize) -> Status {
    vmtry!(bind_name(vm, &ins.args[0], Data::new(Value::Time(TimeData::now()))), ins);
    Status::Normal
}

fn exec_time_add(vm: &mut Vm, _set: &InsSet, ins: &Ins, _pc: &mut usize) -> Status {
    let time = vmtry!(vm.arg_value(&ins.args[0]), ins);
    let amount = vmtry!(vm.int_of(&ins.args[1]), ins);
    let unit = ins.args[2].text.clone();
    let result = match &mut *time.value_mut() {
        Value::Time(t) => {
            match unit.as_str() {
                "years" => t.add_years(amount),
                "months" => t.add_months(amount),
                "days" => t.add_days(amount),
                "hours" => t.add_hours(amount),
                "minutes" => t.add_minutes(amount),
                "seconds" => t.add_seconds(amount),
                _ => {
                    return Status::Thrown(
                        error::value_err(
                            vec![format!("Invalid time unit: \"{}\"", unit)],
                            vec!["Units are 'years', 'months', 'days', 'hours', 'minutes', \
                                  'seconds'."
                                .to_string()],
                        )
                        .at(&ins.pos, &ins.raw_code),
                    )
                }
            }
            Ok(())
        }
        other => Err(expected(TypeTag::Time.into(), other)),
    };
    vmtry!(result, ins);
    Status::Normal
}

fn exec_time_fmt(vm: &mut Vm, _set: &InsSet, ins: &Ins, _pc: &mut usize) -> Status {
    let time = vmtry!(vm.arg_value(&ins.args[0]), ins);
    let format = match TimeFormat::from_str(&ins.args[1].text) {
        Some(format) => format,
        None => {
            return Status::Thrown(
                error::value_err(
                    vec![format!("Invalid time format: {}", ins.args[1].to_display())],
                    vec!["Formats are 'ISO', 'US', 'European', 'Timestamp'.".to_string()],
                )
                .at(&ins.pos, &ins.raw_code),
            )
        }
    };
    let result = match &mut *time.value_mut() {
        Value::Time(t) => {
            t.format = format;
            Ok(())
        }
        other => Err(expected(TypeTag::Time.into(), other)),
    };
    vmtry!(result, ins);
    Status::Normal
}


// --- io --------------------------------------------------------------------

fn render_args(vm: &mut Vm, ins: &Ins) -> Result<String, error::Error> {
    let mut parts = Vec::new();
    for arg in &ins.args {
        let data = vm.arg_value(arg)?;
        parts.push(data.value_str());
    }
    Ok(parts.join(" "))
}

fn exec_print(vm: &mut Vm, _set: &InsSet, ins: &Ins, _pc: &mut usize) -> Status {
    let line = vmtry!(render_args(vm, ins), ins);
    vm.io.write(&line);
    vm.io.write("\n");
    Status::Normal
}

fn exec_put(vm: &mut Vm, _set: &InsSet, ins: &Ins, _pc: &mut usize) -> Status {
    let text = vmtry!(render_args(vm, ins), ins);
    vm.io.write(&text);
    Status::Normal
}

fn input_io_error(e: std::io::Error) -> error::Error {
    error::Error::new(
        error::ErrorKind::Io,
        error::UNKNOWN,
        error::UNKNOWN,
        vec![format!("Reading a line of input failed: {}", e)],
        vec!["Provide input on the reader the machine was given.".to_string()],
    )
}

fn empty_input_cache() -> error::Error {
    error::Error::new(
        error::ErrorKind::Io,
        error::UNKNOWN,
        error::UNKNOWN,
        vec!["This error is due to getting input from an empty cache.".to_string()],
        vec!["Please enter data in the forward cache before getting input data.".to_string()],
    )
}

fn bad_input_number(token: &str) -> error::Error {
    error::value_err(
        vec![format!("Input token does not parse as a number: \"{}\"", token)],
        vec!["Numeric input modes require number-shaped tokens.".to_string()],
    )
}

// The next whitespace-separated token, refilling the cache from the
// reader one line at a time.
fn next_input_token(vm: &mut Vm) -> Result<String, error::Error> {
    if !vm.io.has_next_string() {
        vm.io.read_line_and_split().map_err(input_io_error)?;
    }
    vm.io.next_string().ok_or_else(empty_input_cache)
}

// INPUT: dest [, mode] — 's-l' reads a whole line (the default),
// 's-m' the next token, 's-n' a numeric token, 's-f' a float token;
// 's-unpack' fills several destinations token by token.
fn exec_input(vm: &mut Vm, _set: &InsSet, ins: &Ins, _pc: &mut usize) -> Status {
    let mode = ins.args.last().and_then(|arg| {
        if keyword_kind(&arg.text) == Some(KeywordKind::IoMode) {
            Some(arg.text.clone())
        } else {
            None
        }
    });
    let dest_count = if mode.is_some() { ins.args.len() - 1 } else { ins.args.len() };
    let dests = &ins.args[..dest_count];
    if dests.is_empty() {
        return Status::Thrown(
            error::argument(
                "INPUT needs a destination besides the mode keyword.".to_string(),
                vec!["Name a binding to receive the input.".to_string()],
            )
            .at(&ins.pos, &ins.raw_code),
        );
    }
    let mode = mode.as_deref();
    if mode == Some("s-unpack") {
        for dest in dests {
            let token = vmtry!(next_input_token(vm), ins);
            vmtry!(vm.write_arg(dest, Data::new(Value::Str(token))), ins);
        }
        return Status::Normal;
    }
    if dests.len() != 1 {
        return Status::Thrown(
            error::argument(
                format!("This input mode takes one destination, got {}.", dests.len()),
                vec!["Use 's-unpack' to fill several destinations from one line.".to_string()],
            )
            .at(&ins.pos, &ins.raw_code),
        );
    }
    let value = match mode {
        None | Some("s-l") => {
            let line = match vm.io.read_line() {
                Ok(line) => line,
                Err(e) => {
                    return Status::Thrown(input_io_error(e).at(&ins.pos, &ins.raw_code))
                }
            };
            Value::Str(line)
        }
        Some("s-m") => Value::Str(vmtry!(next_input_token(vm), ins)),
        Some("s-n") => {
            let token = vmtry!(next_input_token(vm), ins);
            if let Ok(v) = token.parse::<i64>() {
                Value::Int(v)
            } else if let Ok(v) = token.parse::<f64>() {
                Value::Float(v)
            } else {
                return Status::Thrown(bad_input_number(&token).at(&ins.pos, &ins.raw_code));
            }
        }
        Some("s-f") => {
            let token = vmtry!(next_input_token(vm), ins);
            match token.parse::<f64>() {
                Ok(v) => Value::Float(v),
                Err(_) => {
                    return Status::Thrown(bad_input_number(&token).at(&ins.pos, &ins.raw_code))
                }
            }
        }
        Some(other) => {
            return Status::Thrown(
                error::value_err(
                    vec![format!("Invalid IO mode: \"{}\"", other)],
                    vec!["IO modes are 's-m', 's-l', 's-f', 's-n', 's-unpack'.".to_string()],
                )
                .at(&ins.pos, &ins.raw_code),
            )
        }
    };
    vmtry!(vm.write_arg(&dests[0], Data::new(value)), ins);
    Status::Normal
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_names_are_unique() {
        let mut seen = std::collections::HashSet::new();
        for ri in RI_TABLE {
            assert!(seen.insert(ri.name), "duplicate opcode {}", ri.name);
        }
    }

    #[test]
    fn test_index_roundtrip() {
        for (i, ri) in RI_TABLE.iter().enumerate() {
            assert_eq!(ri_index_of(ri), i);
            assert!(std::ptr::eq(ri_at(i).unwrap(), ri));
        }
        assert!(ri_at(RI_TABLE.len()).is_none());
        assert!(ri_by_name("NOPE").is_none());
    }

    #[test]
    fn test_scope_opening_flags() {
        for name in [
            "IF",
            "REPEAT",
            "UNTIL",
            "ITER_TRAV",
            "ITER_REV_TRAV",
            "DETECT",
            "ATMP",
            "FINALLY",
            "FUNC",
            "RFUNC",
            "SP_NEW",
            "RASM",
            "SRC",
        ]
        .iter()
        {
            assert!(ri_by_name(name).unwrap().opens_scope, "{} must open a scope", name);
        }
        assert!(ri_by_name("ATMP").unwrap().delayed_release);
        assert!(!ri_by_name("DETECT").unwrap().delayed_release);
        assert!(!ri_by_name("VAR").unwrap().opens_scope);
    }

    #[test]
    fn test_arity_rules() {
        assert!(Arity::Exact(2).accepts(2));
        assert!(!Arity::Exact(2).accepts(3));
        assert!(Arity::AtLeast(1).accepts(4));
        assert!(!Arity::AtLeast(1).accepts(0));
        assert!(Arity::Between(2, 3).accepts(3));
        assert!(!Arity::Between(2, 3).accepts(4));
        assert!(Arity::Any.accepts(0));
        assert_eq!(Arity::Between(2, 3).describe(), "2..3");
    }
}
