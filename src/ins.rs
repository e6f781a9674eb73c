// The instruction model: source positions, classified arguments,
// single instructions, and instruction sets (the unit of execution and
// of serialization: an ordered list plus a label table and an end
// pointer).

use std::collections::HashMap;
use std::rc::Rc;

use regex::Regex;

use crate::error::{self, Error, Result};
use crate::ident::{Id, IdKind};
use crate::opcodes::Ri;
use crate::util::unescape;


#[derive(Clone, Debug, Default, PartialEq)]
pub struct Pos {
    pub line: u32,
    pub column: u32,
    pub filepath: String,
}

impl Pos {
    pub fn new(line: u32, column: u32, filepath: &str) -> Pos {
        Pos { line, column, filepath: filepath.to_string() }
    }
}

impl std::fmt::Display for Pos {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let column = if self.column > 0 { self.column } else { 1 };
        write!(f, "{}:{}:{}, line {}", self.filepath, self.line, column, self.line)?;
        if self.column > 1 {
            write!(f, ", column {}", self.column)?;
        }
        Ok(())
    }
}


// The static keyword registry. Any argument matching one of these is
// classified as a keyword rather than an identifier.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum KeywordKind {
    IoMode,
    Logical,
    MemoryVar,
    DataType,
    FileMode,
    Operator,
}

lazy_static! {
    static ref KEYWORDS: HashMap<&'static str, KeywordKind> = {
        use KeywordKind::*;
        let mut m = HashMap::new();
        for kw in ["s-m", "s-l", "s-f", "s-n", "s-unpack"].iter() {
            m.insert(*kw, IoMode);
        }
        for kw in ["RG", "RGE", "RNE", "RE", "RAE", "RLE", "RL", "RT", "RF", "AND", "OR"].iter() {
            m.insert(*kw, Logical);
        }
        for kw in ["true", "false", "null", "SN", "SE", "SS", "SR"].iter() {
            m.insert(*kw, MemoryVar);
        }
        for kw in [
            "tp", "tp-int", "tp-float", "tp-str", "tp-bool", "tp-null", "tp-char", "tp-list",
            "tp-dict", "tp-series", "tp-pair", "tp-time", "tp-qot", "tp-file", "tp-error",
        ]
        .iter()
        {
            m.insert(*kw, DataType);
        }
        for kw in ["fl-r", "fl-w", "fl-rw", "fl-ap", "fl-ra", "fl-wa"].iter() {
            m.insert(*kw, FileMode);
        }
        for kw in ["+", "-", "*", "/", "%", "^", "~"].iter() {
            m.insert(*kw, Operator);
        }
        m
    };
    static ref IDENT_RE: Regex = Regex::new("^[A-Za-z_][A-Za-z0-9_]*$").unwrap();
    static ref NUMBER_RE: Regex = Regex::new(r"^[+-]?\d+(\.\d+)?$").unwrap();
}

pub fn keyword_kind(text: &str) -> Option<KeywordKind> {
    KEYWORDS.get(text).copied()
}

pub fn is_keyword(text: &str) -> bool {
    KEYWORDS.contains_key(text)
}

pub fn is_valid_identifier(text: &str) -> bool {
    IDENT_RE.is_match(text)
}

pub fn is_valid_number(text: &str) -> bool {
    NUMBER_RE.is_match(text)
}

fn is_quoted(text: &str) -> bool {
    text.len() >= 2 && text.starts_with('"') && text.ends_with('"')
}


#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ArgKind {
    Identifier,
    Keyword,
    Number,
    Str,
    Unknown,
}

impl ArgKind {
    pub fn name(self) -> &'static str {
        match self {
            ArgKind::Identifier => "identifier",
            ArgKind::Keyword => "keyword",
            ArgKind::Number => "number",
            ArgKind::Str => "string",
            ArgKind::Unknown => "unknown",
        }
    }

    pub fn code(self) -> u8 {
        match self {
            ArgKind::Identifier => 0,
            ArgKind::Keyword => 1,
            ArgKind::Number => 2,
            ArgKind::Str => 3,
            ArgKind::Unknown => 4,
        }
    }

    pub fn from_code(code: u8) -> Option<ArgKind> {
        match code {
            0 => Some(ArgKind::Identifier),
            1 => Some(ArgKind::Keyword),
            2 => Some(ArgKind::Number),
            3 => Some(ArgKind::Str),
            4 => Some(ArgKind::Unknown),
            _ => None,
        }
    }
}

pub fn classify_arg(text: &str) -> ArgKind {
    if text.is_empty() {
        ArgKind::Unknown
    } else if is_quoted(text) {
        ArgKind::Str
    } else if is_valid_number(text) {
        ArgKind::Number
    } else if is_keyword(text) {
        ArgKind::Keyword
    } else if is_valid_identifier(text) {
        ArgKind::Identifier
    } else {
        ArgKind::Unknown
    }
}


#[derive(Clone, Debug, PartialEq)]
pub struct Arg {
    pub pos: Pos,
    pub kind: ArgKind,
    pub text: String,
}

impl Arg {
    pub fn new(pos: Pos, text: &str) -> Arg {
        Arg { pos, kind: classify_arg(text), text: text.to_string() }
    }

    pub fn with_kind(pos: Pos, kind: ArgKind, text: &str) -> Arg {
        Arg { pos, kind, text: text.to_string() }
    }

    // The string payload of a string-classified argument, with the
    // outer quotes stripped and escapes resolved.
    pub fn string_content(&self) -> String {
        if is_quoted(&self.text) {
            unescape(&self.text[1..self.text.len() - 1])
        } else {
            unescape(&self.text)
        }
    }

    pub fn to_display(&self) -> String {
        format!("[Arg({}): {}]", self.kind.name(), self.text)
    }
}


#[derive(Debug)]
pub struct Ins {
    pub ins_id: Id,
    pub pos: Pos,
    pub raw_code: String,
    pub ri: &'static Ri,
    pub args: Vec<Arg>,
    pub scope_set: Option<Rc<InsSet>>,
    pub delayed_release: bool,
}

impl Ins {
    pub fn new(pos: Pos, raw_code: &str, ri: &'static Ri, args: Vec<Arg>) -> Ins {
        Ins {
            ins_id: Id::next(IdKind::Instruction),
            pos,
            raw_code: raw_code.to_string(),
            ri,
            args,
            scope_set: None,
            delayed_release: ri.delayed_release,
        }
    }
}


#[derive(Debug)]
pub struct InsSet {
    pub set_id: Id,
    pub prefix: String,
    pub scope_leader: String,
    pub leader_pos: Pos,
    pub ins: Vec<Ins>,
    pub labels: HashMap<String, usize>,
    pub end_pointer: usize,
    pub delayed_release: bool,
}

impl InsSet {
    pub fn new(prefix: &str) -> InsSet {
        InsSet {
            set_id: Id::next(IdKind::InstructionSet),
            prefix: prefix.to_string(),
            scope_leader: String::new(),
            leader_pos: Pos::default(),
            ins: Vec::new(),
            labels: HashMap::new(),
            end_pointer: 0,
            delayed_release: false,
        }
    }

    pub fn len(&self) -> usize {
        self.ins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ins.is_empty()
    }

    pub fn add_ins(&mut self, ins: Ins) {
        self.ins.push(ins);
    }

    pub fn set_scope_leader(&mut self, leader: &str, pos: Pos) {
        self.scope_leader = leader.to_string();
        self.leader_pos = pos;
    }

    pub fn set_label(&mut self, name: &str, index: usize) {
        self.labels.insert(name.to_string(), index);
    }

    pub fn get_label(&self, name: &str) -> Result<usize> {
        self.labels.get(name).copied().ok_or_else(|| {
            Error::new(
                error::ErrorKind::Value,
                error::UNKNOWN,
                error::UNKNOWN,
                vec![format!("No label is named \"{}\" in this instruction set.", name)],
                vec!["Record the label with SET before jumping to it.".to_string()],
            )
        })
    }

    // Splice another set's instructions onto the end of this one,
    // shifting its label table by the current length.
    pub fn insert_ins_set(&mut self, other: InsSet) {
        let base = self.ins.len();
        for (name, index) in other.labels {
            self.labels.insert(name, index + base);
        }
        self.ins.extend(other.ins);
        self.end_pointer = self.ins.len();
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_arg() {
        assert_eq!(classify_arg("abc_1"), ArgKind::Identifier);
        assert_eq!(classify_arg("_x"), ArgKind::Identifier);
        assert_eq!(classify_arg("42"), ArgKind::Number);
        assert_eq!(classify_arg("-3.5"), ArgKind::Number);
        assert_eq!(classify_arg("+7"), ArgKind::Number);
        assert_eq!(classify_arg("\"hi\""), ArgKind::Str);
        assert_eq!(classify_arg("RE"), ArgKind::Keyword);
        assert_eq!(classify_arg("tp-dict"), ArgKind::Keyword);
        assert_eq!(classify_arg("fl-rw"), ArgKind::Keyword);
        assert_eq!(classify_arg("+"), ArgKind::Keyword);
        assert_eq!(classify_arg("true"), ArgKind::Keyword);
        assert_eq!(classify_arg("3."), ArgKind::Unknown);
        assert_eq!(classify_arg(".5"), ArgKind::Unknown);
        assert_eq!(classify_arg("1a"), ArgKind::Unknown);
        assert_eq!(classify_arg(""), ArgKind::Unknown);
    }

    #[test]
    fn test_string_content_unescapes() {
        let arg = Arg::new(Pos::default(), "\"a\\tb\\\"c\"");
        assert_eq!(arg.kind, ArgKind::Str);
        assert_eq!(arg.string_content(), "a\tb\"c");
    }

    #[test]
    fn test_pos_display() {
        let pos = Pos::new(3, 7, "test.ra");
        assert_eq!(format!("{}", pos), "test.ra:3:7, line 3, column 7");
        let pos = Pos::new(3, 1, "test.ra");
        assert_eq!(format!("{}", pos), "test.ra:3:1, line 3");
    }

    #[test]
    fn test_labels_and_splice() {
        let mut a = InsSet::new("SRC-");
        a.set_label("start", 0);
        let ri = crate::opcodes::ri_by_name("SET").unwrap();
        a.add_ins(Ins::new(Pos::default(), "SET: start", ri, vec![]));

        let mut b = InsSet::new("SRC-");
        b.set_label("lib", 0);
        b.add_ins(Ins::new(Pos::default(), "SET: lib", ri, vec![]));
        b.add_ins(Ins::new(Pos::default(), "SET: lib2", ri, vec![]));

        a.insert_ins_set(b);
        assert_eq!(a.get_label("start").unwrap(), 0);
        assert_eq!(a.get_label("lib").unwrap(), 1);
        assert_eq!(a.len(), 3);
        assert!(a.get_label("missing").is_err());
    }
}
