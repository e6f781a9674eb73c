// Typed runtime diagnostics. Every error carries its kind, the source
// position and line it arose from, free-form info lines, repair tips,
// and the trace of frames it unwound through. Rendering follows the
// serialization profile: full block under Debug/Testing, header and
// info only under Release/Minified.

use std::collections::VecDeque;

use thiserror::Error as ThisError;

use crate::codec::Profile;
use crate::ins::Pos;
use crate::util::{list_join, wrap_text};

pub const UNKNOWN: &str = "unknown";

const WIDTH: usize = 80;
const SPACE: usize = 4;


#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Syntax,
    Runtime,
    Io,
    Type,
    Value,
    Range,
    Id,
    Key,
    File,
    Argument,
    Memory,
    Field,
    Recursion,
    Link,
    Unknown,
    Custom,
}

impl ErrorKind {
    pub fn name(self) -> &'static str {
        match self {
            ErrorKind::Syntax => "SyntaxError",
            ErrorKind::Runtime => "RuntimeError",
            ErrorKind::Io => "IOError",
            ErrorKind::Type => "TypeError",
            ErrorKind::Value => "ValueError",
            ErrorKind::Range => "RangeError",
            ErrorKind::Id => "IDError",
            ErrorKind::Key => "KeyError",
            ErrorKind::File => "FileError",
            ErrorKind::Argument => "ArgumentError",
            ErrorKind::Memory => "MemoryError",
            ErrorKind::Field => "FieldError",
            ErrorKind::Recursion => "RecursionError",
            ErrorKind::Link => "LinkError",
            ErrorKind::Unknown => "UnknownError",
            ErrorKind::Custom => "CustomError",
        }
    }
}


#[derive(ThisError, Clone, Debug, PartialEq)]
#[error("{kind_name} at {position}")]
pub struct Error {
    pub kind: ErrorKind,
    pub kind_name: String,
    pub position: String,
    pub line: String,
    pub info: Vec<String>,
    pub tips: Vec<String>,
    pub trace: VecDeque<String>,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn new(
        kind: ErrorKind,
        position: &str,
        line: &str,
        info: Vec<String>,
        tips: Vec<String>,
    ) -> Error {
        Error {
            kind,
            kind_name: kind.name().to_string(),
            position: position.to_string(),
            line: line.to_string(),
            info,
            tips,
            trace: VecDeque::new(),
        }
    }

    // A custom kind carrying its own display name, e.g. ModificationError.
    pub fn custom_named(
        name: &str,
        position: &str,
        line: &str,
        info: Vec<String>,
        tips: Vec<String>,
    ) -> Error {
        let mut e = Error::new(ErrorKind::Custom, position, line, info, tips);
        e.kind_name = name.to_string();
        e
    }

    // Errors raised inside the value layer carry no location; the
    // engine attaches the instruction's position and source line on
    // the way out.
    pub fn at(mut self, pos: &Pos, line: &str) -> Error {
        if self.position == UNKNOWN {
            self.position = pos.to_string();
        }
        if self.line == UNKNOWN {
            self.line = line.to_string();
        }
        self
    }

    // Frames are pushed front-first so printing reads root-to-leaf.
    pub fn add_trace(&mut self, frame: String) {
        self.trace.push_front(frame);
    }

    pub fn title(&self) -> String {
        format!("\n{}[ {} ]{}\n", "=".repeat(20), self.kind_name, "=".repeat(60))
    }

    pub fn info_block(&self) -> String {
        let space = " ".repeat(SPACE);
        let mut out = format!("{}[ Info ] : ", space);
        for (i, line) in self.info.iter().enumerate() {
            out.push_str(&wrap_text(line, WIDTH, SPACE + 10, "~ "));
            if i + 1 < self.info.len() {
                out.push('\n');
                out.push_str(&" ".repeat(SPACE + 9));
                out.push_str("- ");
            }
        }
        out.push_str("\n\n");
        out
    }

    pub fn render(&self, profile: Profile) -> String {
        let mut out = self.title();
        if profile >= Profile::Release {
            out.push_str(&self.info_block());
            return out;
        }
        let space = " ".repeat(SPACE);
        if !self.trace.is_empty() {
            out.push_str(" [ Trace Back ]\n");
            out.push_str(&list_join(self.trace.iter(), "\n"));
            out.push('\n');
        }
        if !self.position.is_empty() && self.position != UNKNOWN {
            out.push_str(&format!(
                "{}[ Line ] : {}\n{}| {}\n\n",
                space,
                wrap_text(&self.position, WIDTH, SPACE + 10, "~ "),
                " ".repeat(SPACE + 9),
                wrap_text(&self.line, WIDTH, SPACE + 9, "| ~ "),
            ));
        }
        if !self.info.is_empty() {
            out.push_str(&self.info_block());
        }
        if !self.tips.is_empty() {
            out.push_str(&format!("{}[ Tips ] : ", space));
            for (i, tip) in self.tips.iter().enumerate() {
                out.push_str(&wrap_text(tip, WIDTH, SPACE + 10, "~ "));
                if i + 1 < self.tips.len() {
                    out.push('\n');
                    out.push_str(&" ".repeat(SPACE + 9));
                    out.push_str("- ");
                }
            }
            out.push('\n');
        }
        out
    }
}


// Constructors for the recurring diagnostics. These mirror the shapes
// the executors raise so info lines and tips stay consistent.

pub fn syntax(position: &str, line: &str, info: Vec<String>, tips: Vec<String>) -> Error {
    Error::new(ErrorKind::Syntax, position, line, info, tips)
}

pub fn runtime(info: Vec<String>, tips: Vec<String>) -> Error {
    Error::new(ErrorKind::Runtime, UNKNOWN, UNKNOWN, info, tips)
}

pub fn type_err(info: Vec<String>, tips: Vec<String>) -> Error {
    Error::new(ErrorKind::Type, UNKNOWN, UNKNOWN, info, tips)
}

pub fn value_err(info: Vec<String>, tips: Vec<String>) -> Error {
    Error::new(ErrorKind::Value, UNKNOWN, UNKNOWN, info, tips)
}

pub fn range_err(index: String, size: usize) -> Error {
    Error::new(
        ErrorKind::Range,
        UNKNOWN,
        UNKNOWN,
        vec![
            "This error is caused by accessing an invalid index position.".to_string(),
            format!("Index: {}", index),
            format!("Container Size: {}", size),
        ],
        vec!["Ensure the index is within the valid range of the container.".to_string()],
    )
}

pub fn id_err(idstring: &str) -> Error {
    Error::new(
        ErrorKind::Id,
        UNKNOWN,
        UNKNOWN,
        vec![
            "This error is caused by resolving an identity that no longer exists.".to_string(),
            format!("Target ID: {}", idstring),
        ],
        vec!["The aliased binding may have gone out of scope.".to_string()],
    )
}

pub fn key_err(key: &str) -> Error {
    Error::new(
        ErrorKind::Key,
        UNKNOWN,
        UNKNOWN,
        vec![
            "This error is caused by the specified key not being found.".to_string(),
            format!("Missing Key: {}", key),
        ],
        vec![
            "When accessing a value by key, ensure the key exists and has a corresponding value."
                .to_string(),
        ],
    )
}

pub fn file_err(path: &str, detail: &str) -> Error {
    Error::new(
        ErrorKind::File,
        UNKNOWN,
        UNKNOWN,
        vec![
            "This error is caused by the non-existence or incorrectness of the file path."
                .to_string(),
            format!("Target File: {}", path),
            detail.to_string(),
        ],
        vec!["Check that the path exists and the file mode permits the operation.".to_string()],
    )
}

pub fn argument(info: String, tips: Vec<String>) -> Error {
    Error::new(
        ErrorKind::Argument,
        UNKNOWN,
        UNKNOWN,
        vec![
            "This error is caused by a mismatch between required and received arguments."
                .to_string(),
            info,
        ],
        tips,
    )
}

pub fn arg_number(ri_name: &str, required: &str, received: usize) -> Error {
    Error::new(
        ErrorKind::Argument,
        UNKNOWN,
        UNKNOWN,
        vec![
            "This error is caused by a mismatch between required and received arguments."
                .to_string(),
            format!("Target RI: [RI: {}]", ri_name),
            format!("Required Arg Number: {}", required),
            format!("Received Arg Number: {}", received),
        ],
        vec![format!("Check the number of arguments provided for [RI: {}].", ri_name)],
    )
}

pub fn duplicate_key(name: &str, scope: &str) -> Error {
    Error::new(
        ErrorKind::Memory,
        UNKNOWN,
        UNKNOWN,
        vec![
            "This error is caused by allocating memory space with a duplicate name.".to_string(),
            format!("Duplicate Name: \"{}\"", name),
            format!("Target Scope: {}", scope),
        ],
        vec!["Choose a fresh name or delete the existing binding first.".to_string()],
    )
}

pub fn modification(op: &str, scope: &str) -> Error {
    Error::custom_named(
        "ModificationError",
        UNKNOWN,
        UNKNOWN,
        vec![
            "This error is caused by an operation the target scope does not permit.".to_string(),
            format!("Denied Operation: {}", op),
            format!("Target Scope: {}", scope),
        ],
        vec![format!("Enable the '{}' permission on the scope before retrying.", op)],
    )
}

pub fn field_not_found(target: &str, field: &str) -> Error {
    Error::new(
        ErrorKind::Field,
        UNKNOWN,
        UNKNOWN,
        vec![
            "This error is caused by accessing an undefined field.".to_string(),
            format!("Target: {}", target),
            format!("Undefined Field: \"{}\"", field),
        ],
        vec!["Declare the field on the type before reading or writing it.".to_string()],
    )
}

pub fn recursion(depth: usize) -> Error {
    Error::new(
        ErrorKind::Recursion,
        UNKNOWN,
        UNKNOWN,
        vec![
            "This error is caused by exceeding the maximum call depth.".to_string(),
            format!("Depth Limit: {}", depth),
        ],
        vec!["Check the terminating condition of the recursive callable.".to_string()],
    )
}

pub fn link(position: &str, line: &str, info: Vec<String>, tips: Vec<String>) -> Error {
    Error::new(ErrorKind::Link, position, line, info, tips)
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names() {
        assert_eq!(ErrorKind::Syntax.name(), "SyntaxError");
        assert_eq!(ErrorKind::Custom.name(), "CustomError");
    }

    #[test]
    fn test_at_fills_unknowns_once() {
        let pos = Pos::new(3, 1, "test.ra");
        let e = runtime(vec!["divided by zero".to_string()], vec![]).at(&pos, "OPT: c, a, b, /");
        assert_eq!(e.position, pos.to_string());
        let other = Pos::new(9, 9, "other.ra");
        let e = e.at(&other, "nope");
        assert_eq!(e.position, pos.to_string());
        assert_eq!(e.line, "OPT: c, a, b, /");
    }

    #[test]
    fn test_trace_reads_root_to_leaf() {
        let mut e = runtime(vec!["boom".to_string()], vec![]);
        e.add_trace("leaf frame".to_string());
        e.add_trace("root frame".to_string());
        let rendered = e.render(Profile::Debug);
        let root = rendered.find("root frame").unwrap();
        let leaf = rendered.find("leaf frame").unwrap();
        assert!(root < leaf);
    }

    #[test]
    fn test_release_render_is_header_and_info() {
        let e = key_err("k");
        let rendered = e.render(Profile::Release);
        assert!(rendered.contains("[ KeyError ]"));
        assert!(rendered.contains("[ Info ]"));
        assert!(!rendered.contains("[ Tips ]"));
        assert!(!rendered.contains("[ Line ]"));
    }
}
