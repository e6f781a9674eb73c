// (C) 2020 Brandon Lewis
//
// The assembler: line-oriented source text in, a tree of instruction
// sets out.
//
// A logical line is `OPCODE : arg1, arg2, ...`. A `;` outside a quoted
// string starts a comment; a line whose first character is `~`
// continues the previous logical line; blank lines vanish. Commas
// split arguments only outside quotes, a backslash escapes the quote
// that follows it, and adjacent quoted pieces merge into one string.
//
// Scope-opening opcodes push a fresh instruction set; END pops it,
// records the end pointer and the end label, and attaches the finished
// set to the instruction that opened it. SET records a label at the
// current tail of the open set. LINK resolves eagerly: a `.ra` path
// re-enters the assembler, a `.rsi` path goes through the codec, and
// the result is spliced in place.

use std::rc::Rc;

use crate::codec;
use crate::engine::Vm;
use crate::error::{self, Result};
use crate::ins::{Arg, ArgKind, Ins, InsSet, Pos};
use crate::opcodes::{ri_by_name, Ri};
use crate::util::{file_ext, file_name, file_stem};


struct LogicalLine {
    text: String,
    row: u32,
    indent: u32,
}

fn strip_comment(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut in_quotes = false;
    let mut escaped = false;
    for c in line.chars() {
        if escaped {
            out.push(c);
            escaped = false;
            continue;
        }
        match c {
            '\\' => {
                out.push(c);
                escaped = true;
            }
            '"' => {
                in_quotes = !in_quotes;
                out.push(c);
            }
            ';' if !in_quotes => break,
            _ => out.push(c),
        }
    }
    out
}

// Collapse physical lines into logical ones: trim, drop blanks and
// comments, splice `~` continuations onto their predecessor.
fn preprocess(code: &str) -> Vec<LogicalLine> {
    let mut out: Vec<LogicalLine> = Vec::new();
    for (i, raw) in code.lines().enumerate() {
        let row = (i + 1) as u32;
        let indent = raw.chars().take_while(|c| *c == ' ' || *c == '\t').count() as u32;
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            continue;
        }
        if trimmed.starts_with('~') {
            let rest = strip_comment(trimmed[1..].trim_start());
            if let Some(last) = out.last_mut() {
                last.text.push_str(rest.trim_end());
            }
            continue;
        }
        let text = strip_comment(trimmed);
        let text = text.trim_end();
        if text.is_empty() {
            continue;
        }
        out.push(LogicalLine { text: text.to_string(), row, indent });
    }
    out
}

// The first colon outside quoted text separates the opcode from its
// arguments.
fn find_opcode_colon(line: &str) -> Option<usize> {
    let mut in_quotes = false;
    let mut escaped = false;
    for (i, c) in line.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            '"' => in_quotes = !in_quotes,
            ':' if !in_quotes => return Some(i),
            _ => {}
        }
    }
    None
}

// Adjacent quoted pieces on one argument merge into a single string
// literal: `"ab" "cd"` reads as `"abcd"`.
fn merge_adjacent_quotes(piece: &str) -> String {
    let mut segments: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut escaped = false;
    let mut all_quoted = true;
    for c in piece.chars() {
        if escaped {
            current.push(c);
            escaped = false;
            continue;
        }
        match c {
            '\\' => {
                current.push(c);
                escaped = true;
            }
            '"' => {
                if in_quotes {
                    segments.push(current.clone());
                    current.clear();
                    in_quotes = false;
                } else {
                    if !current.trim().is_empty() {
                        all_quoted = false;
                    }
                    current.clear();
                    in_quotes = true;
                }
            }
            _ => current.push(c),
        }
    }
    if in_quotes || !current.trim().is_empty() {
        all_quoted = false;
    }
    if all_quoted && segments.len() >= 2 {
        format!("\"{}\"", segments.concat())
    } else {
        piece.to_string()
    }
}

fn split_args(
    params: &str,
    row: u32,
    base_column: u32,
    filepath: &str,
    line: &str,
) -> Result<Vec<Arg>> {
    if params.trim().is_empty() {
        return Ok(Vec::new());
    }
    let mut pieces: Vec<(String, u32)> = Vec::new();
    let mut current = String::new();
    let mut start = base_column;
    let mut column = base_column;
    let mut in_quotes = false;
    let mut escaped = false;
    for c in params.chars() {
        column += 1;
        if escaped {
            current.push(c);
            escaped = false;
            continue;
        }
        match c {
            '\\' => {
                current.push(c);
                escaped = true;
            }
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            ',' if !in_quotes => {
                pieces.push((current.clone(), start));
                current.clear();
                start = column;
            }
            _ => current.push(c),
        }
    }
    if in_quotes {
        return Err(error::syntax(
            &Pos::new(row, base_column, filepath).to_string(),
            line,
            vec!["Unclosed quote in this line.".to_string()],
            vec!["Balance every double quote or escape it with a backslash.".to_string()],
        ));
    }
    pieces.push((current, start));

    let mut args = Vec::new();
    for (piece, col) in pieces {
        let trimmed = piece.trim();
        if trimmed.is_empty() {
            return Err(error::syntax(
                &Pos::new(row, col, filepath).to_string(),
                line,
                vec!["Adjacent delimiters contain only whitespace.".to_string()],
                vec!["Remove the extra comma or provide the missing argument.".to_string()],
            ));
        }
        let merged = merge_adjacent_quotes(trimmed);
        let arg = Arg::new(Pos::new(row, col, filepath), &merged);
        if arg.kind == ArgKind::Unknown {
            return Err(error::syntax(
                &arg.pos.to_string(),
                line,
                vec![
                    "This error is caused by providing an argument of the wrong type.".to_string(),
                    format!("Error Arg: {}", arg.to_display()),
                ],
                vec!["Argument types include only 'identifier', 'string', 'number', 'keyword'."
                    .to_string()],
            ));
        }
        args.push(arg);
    }
    Ok(args)
}


struct Frame {
    set: InsSet,
    parent_open_index: Option<usize>,
}

pub fn parse_file(vm: &mut Vm, path: &str) -> Result<InsSet> {
    let code = std::fs::read_to_string(path)
        .map_err(|e| error::file_err(path, &format!("Read failed: {}", e)))?;
    parse_source(vm, "File", path, &code)
}

pub fn parse_source(vm: &mut Vm, leader_kind: &str, path: &str, code: &str) -> Result<InsSet> {
    let mut root = InsSet::new("SRC-");
    root.set_scope_leader(
        &format!("[{}: {}]", leader_kind, file_name(path)),
        Pos::new(1, 1, path),
    );
    let mut stack = vec![Frame { set: root, parent_open_index: None }];

    for line in preprocess(code) {
        let pos = Pos::new(line.row, 1, path);
        let colon = find_opcode_colon(&line.text).ok_or_else(|| {
            error::syntax(
                &pos.to_string(),
                &line.text,
                vec!["This error is caused by a missing colon in the line.".to_string()],
                vec!["Add the missing colon between the opcode and its arguments.".to_string()],
            )
        })?;
        let opcode = line.text[..colon].trim().to_string();
        let params = &line.text[colon + 1..];
        if !crate::ins::is_valid_identifier(&opcode) {
            return Err(error::syntax(
                &pos.to_string(),
                &line.text,
                vec![format!("Invalid instruction name: \"{}\"", opcode)],
                vec!["Opcode names are plain identifiers.".to_string()],
            ));
        }
        let ri = ri_by_name(&opcode).ok_or_else(|| {
            error::syntax(
                &pos.to_string(),
                &line.text,
                vec![
                    "This error is caused by using an undefined instruction.".to_string(),
                    format!("Unknown RI: [RI: {}]", opcode),
                ],
                vec!["Refer to the instruction documentation for the defined opcodes.".to_string()],
            )
        })?;
        let base_column = line.indent + colon as u32 + 2;
        let args = split_args(params, line.row, base_column, path, &line.text)?;
        if !ri.arity.accepts(args.len()) {
            return Err(error::arg_number(&ri.name, &ri.arity.describe(), args.len())
                .at(&pos, &line.text));
        }

        if ri.opens_scope {
            open_scope(&mut stack, ri, pos, &line.text, args);
        } else if ri.name == "END" {
            close_scope(&mut stack, ri, pos, &line.text, args)?;
        } else if ri.name == "SET" {
            let top = stack.last_mut().expect("stack is never empty");
            let index = top.set.len();
            top.set.set_label(&args[0].text, index);
            top.set.add_ins(Ins::new(pos, &line.text, ri, args));
        } else if ri.name == "LINK" {
            link_module(vm, &mut stack, pos, &line.text, &args)?;
        } else {
            let top = stack.last_mut().expect("stack is never empty");
            top.set.add_ins(Ins::new(pos, &line.text, ri, args));
        }
    }

    if stack.len() != 1 {
        let open = &stack.last().expect("stack is never empty").set;
        return Err(error::syntax(
            &open.leader_pos.to_string(),
            &open.scope_leader,
            vec![format!("Unclosed scope at end of input: {}", open.prefix)],
            vec!["Close every scope-opening instruction with END.".to_string()],
        ));
    }
    let mut root = stack.pop().expect("stack is never empty").set;
    root.end_pointer = root.len();
    Ok(root)
}

fn open_scope(stack: &mut Vec<Frame>, ri: &'static Ri, pos: Pos, raw: &str, args: Vec<Arg>) {
    let leader_pos = pos.clone();
    let top = stack.last_mut().expect("stack is never empty");
    top.set.add_ins(Ins::new(pos, raw, ri, args));
    let open_index = top.set.len() - 1;
    let mut child = InsSet::new(&format!("{}-", ri.name));
    child.delayed_release = ri.delayed_release;
    child.set_scope_leader(raw, leader_pos);
    stack.push(Frame { set: child, parent_open_index: Some(open_index) });
}

fn close_scope(
    stack: &mut Vec<Frame>,
    ri: &'static Ri,
    pos: Pos,
    raw: &str,
    args: Vec<Arg>,
) -> Result<()> {
    if stack.len() < 2 {
        return Err(error::syntax(
            &pos.to_string(),
            raw,
            vec!["END without a matching scope-opening instruction.".to_string()],
            vec!["Every END must close a scope opened earlier in the file.".to_string()],
        ));
    }
    let mut frame = stack.pop().expect("checked above");
    let end_name = match args.get(0) {
        Some(arg) => arg.text.clone(),
        None => "END".to_string(),
    };
    frame.set.end_pointer = frame.set.len();
    let label = format!("{}{}-END", frame.set.prefix, end_name);
    let end_pointer = frame.set.end_pointer;
    frame.set.set_label(&label, end_pointer);
    let mut end_ins = Ins::new(pos, raw, ri, args);
    end_ins.delayed_release = frame.set.delayed_release;
    frame.set.add_ins(end_ins);

    let parent = stack.last_mut().expect("checked above");
    let open_index = frame.parent_open_index.expect("non-root frames record their opener");
    parent.set.ins[open_index].scope_set = Some(Rc::new(frame.set));
    Ok(())
}

fn link_module(
    vm: &mut Vm,
    stack: &mut Vec<Frame>,
    pos: Pos,
    raw: &str,
    args: &[Arg],
) -> Result<()> {
    if args[0].kind != ArgKind::Str {
        return Err(error::argument(
            format!("Error Arg: {}", args[0].to_display()),
            vec![
                "The [RI: LINK] requires an argument to specify the path of the file to be \
                 linked."
                    .to_string(),
                "Only 'RA' and 'RSI' files are supported.".to_string(),
            ],
        )
        .at(&pos, raw));
    }
    let path = args[0].string_content();
    let ident = file_name(&path);
    if vm.linked_modules.contains(&ident) {
        return Ok(());
    }
    vm.linked_modules.insert(ident);
    let ext = file_ext(&path);
    let linked = match ext.as_str() {
        "ra" => parse_file(vm, &path),
        "rsi" => codec::load_archive(vm, &path),
        _ => Err(error::link(
            &pos.to_string(),
            raw,
            vec![
                "This error is caused by an error encountered while statically linking other \
                 files."
                    .to_string(),
                format!("Error Linking File: [File: {}]", path),
            ],
            vec!["Only 'RA' and 'RSI' files are supported.".to_string()],
        )),
    }?;
    if vm.config.precompiled_link && ext == "ra" {
        let out_path = std::path::Path::new(&vm.config.precompiled_link_dir)
            .join(format!("{}.rsi", file_stem(&path)));
        codec::save_archive(
            &out_path.to_string_lossy(),
            &linked,
            vm.config.profile,
            &vm.linked_modules,
        )?;
    }
    let top = stack.last_mut().expect("stack is never empty");
    top.set.insert_ins_set(linked);
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunConfig;
    use std::cell::RefCell;

    fn test_vm() -> (Vm, Rc<RefCell<Vec<String>>>) {
        let captured: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));
        let mut vm = Vm::new(RunConfig::default(), Box::new(captured.clone()));
        vm.initialize("test.ra");
        (vm, captured)
    }

    fn parse(src: &str) -> Result<InsSet> {
        let (mut vm, _) = test_vm();
        parse_source(&mut vm, "File", "test.ra", src)
    }

    #[test]
    fn test_preprocess_comments_and_continuation() {
        let lines = preprocess(
            "; full comment\n\
             \n\
             VAR: a, 1 ; trailing\n\
             PRINT: a,\n\
             ~ a\n\
             PRINT: \"semi ; inside\"\n",
        );
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0].text, "VAR: a, 1");
        assert_eq!(lines[0].row, 3);
        assert_eq!(lines[1].text, "PRINT: a,a");
        assert_eq!(lines[2].text, "PRINT: \"semi ; inside\"");
    }

    #[test]
    fn test_quote_aware_splitting() {
        let args = split_args("a, \"x, y\", 3", 1, 1, "test.ra", "OP: ...").unwrap();
        assert_eq!(args.len(), 3);
        assert_eq!(args[0].text, "a");
        assert_eq!(args[1].text, "\"x, y\"");
        assert_eq!(args[2].text, "3");
    }

    #[test]
    fn test_adjacent_quotes_merge() {
        assert_eq!(merge_adjacent_quotes("\"ab\" \"cd\""), "\"abcd\"");
        assert_eq!(merge_adjacent_quotes("\"ab\""), "\"ab\"");
        assert_eq!(merge_adjacent_quotes("plain"), "plain");
        let args = split_args("\"ab\" \"cd\"", 1, 1, "test.ra", "OP: ...").unwrap();
        assert_eq!(args.len(), 1);
        assert_eq!(args[0].string_content(), "abcd");
    }

    #[test]
    fn test_escaped_quote_stays_literal() {
        let args = split_args("\"say \\\"hi\\\", now\"", 1, 1, "test.ra", "OP: ...").unwrap();
        assert_eq!(args.len(), 1);
        assert_eq!(args[0].string_content(), "say \"hi\", now");
    }

    #[test]
    fn test_structure_and_labels() {
        let set = parse(
            "VAR: i, 0\n\
             REPEAT: 3\n\
               OPT: i, i, 1, +\n\
             END:\n\
             SET: after\n\
             PRINT: i\n",
        )
        .unwrap();
        assert_eq!(set.len(), 4);
        assert_eq!(set.get_label("after").unwrap(), 2);
        let repeat = &set.ins[1];
        assert_eq!(repeat.ri.name, "REPEAT");
        let child = repeat.scope_set.as_ref().unwrap();
        assert_eq!(child.prefix, "REPEAT-");
        assert_eq!(child.len(), 2);
        assert_eq!(child.end_pointer, 1);
        assert_eq!(child.get_label("REPEAT-END-END").unwrap(), 1);
    }

    #[test]
    fn test_missing_colon_is_syntax_error() {
        let err = parse("VAR a, 1\n").unwrap_err();
        assert_eq!(err.kind, error::ErrorKind::Syntax);
    }

    #[test]
    fn test_unknown_opcode_is_syntax_error() {
        let err = parse("NOPE: a\n").unwrap_err();
        assert_eq!(err.kind, error::ErrorKind::Syntax);
        assert!(err.info.iter().any(|l| l.contains("Unknown RI")));
    }

    #[test]
    fn test_bad_argument_is_syntax_error() {
        let err = parse("VAR: a, 3.\n").unwrap_err();
        assert_eq!(err.kind, error::ErrorKind::Syntax);
    }

    #[test]
    fn test_arity_is_checked() {
        let err = parse("VAR: a\n").unwrap_err();
        assert_eq!(err.kind, error::ErrorKind::Argument);
    }

    #[test]
    fn test_unclosed_scope_is_fatal() {
        let err = parse("REPEAT: 3\nPRINT: 1\n").unwrap_err();
        assert_eq!(err.kind, error::ErrorKind::Syntax);
        assert!(err.info.iter().any(|l| l.contains("Unclosed scope")));
    }

    #[test]
    fn test_stray_end_is_syntax_error() {
        let err = parse("END:\n").unwrap_err();
        assert_eq!(err.kind, error::ErrorKind::Syntax);
    }

    fn temp_dir(tag: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("rvm-{}-{}", tag, std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_static_link_and_precompile() {
        let dir = temp_dir("link");
        let lib_path = dir.join("lib.ra");
        std::fs::write(&lib_path, "FUNC: greet\n  PRINT: \"hello from lib\"\nEND:\n").unwrap();

        let src = format!(
            "LINK: \"{}\"\nCALL: x, greet\n",
            lib_path.to_string_lossy().replace('\\', "\\\\")
        );
        let captured: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));
        let mut config = RunConfig::default();
        config.precompiled_link = true;
        config.precompiled_link_dir = dir.to_string_lossy().into_owned();
        let mut vm = Vm::new(config, Box::new(captured.clone()));
        vm.initialize("main.ra");
        let set = parse_source(&mut vm, "File", "main.ra", &src).unwrap();
        assert!(vm.run_root(&set).is_none());
        assert_eq!(captured.borrow().concat(), "hello from lib\n");

        // The precompile side effect landed next to the configured dir.
        let rsi_path = dir.join("lib.rsi");
        assert!(rsi_path.exists());

        // Linking the precompiled archive instead behaves the same.
        let src = format!(
            "LINK: \"{}\"\nCALL: x, greet\n",
            rsi_path.to_string_lossy().replace('\\', "\\\\")
        );
        let captured: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));
        let mut vm = Vm::new(RunConfig::default(), Box::new(captured.clone()));
        vm.initialize("main.ra");
        let set = parse_source(&mut vm, "File", "main.ra", &src).unwrap();
        assert!(vm.run_root(&set).is_none());
        assert_eq!(captured.borrow().concat(), "hello from lib\n");
    }

    #[test]
    fn test_duplicate_link_is_spliced_once() {
        let dir = temp_dir("dup");
        let lib_path = dir.join("once.ra");
        std::fs::write(&lib_path, "VAR: linked_marker, 1\n").unwrap();
        let quoted = lib_path.to_string_lossy().replace('\\', "\\\\");
        let src = format!("LINK: \"{}\"\nLINK: \"{}\"\nPRINT: linked_marker\n", quoted, quoted);
        let (mut vm, _) = test_vm();
        let set = parse_source(&mut vm, "File", "main.ra", &src).unwrap();
        // A second splice would make the VAR a duplicate-name error.
        assert!(vm.run_root(&set).is_none());
        assert_eq!(set.len(), 2);
    }
}
