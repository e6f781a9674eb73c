// (C) 2020 Brandon Lewis
//
// The execution engine.
//
// Execution steps an instruction set with a mutable program counter.
// Every opcode executor returns a Status; control never unwinds
// through the step boundary by panicking or by Err-returning — a
// thrown error is just another Status case, annotated with a trace
// entry at each frame boundary on its way out.
//
// *Frames*
//
// Scope-opening opcodes acquire a fresh scope before running their
// child instruction set and release it on the way out, error or not.
// The one exception is a delayed-release block (ATMP), whose scope
// survives its own END so the matching FINALLY sibling runs inside it;
// error unwind still releases unconditionally.
//
// *Calls*
//
// A callable invocation pushes a FUNC-<name> scope, binds parameters
// positionally, and runs the stored body. A returned value lands in
// the well-known global binding SR before the caller resumes. Call
// depth is bounded; exceeding it raises a RecursionError.

use std::collections::BTreeSet;
use std::rc::Rc;

use crate::config::RunConfig;
use crate::error::{self, Error, Result};
use crate::ins::{Arg, ArgKind, Ins, InsSet, Pos};
use crate::memory::Memory;
use crate::output::Sink;
use crate::value::{Data, DataRef, FuncData, Types, Value};

pub const MAX_CALL_DEPTH: usize = 256;


// The outcome of one dispatched instruction, and the only way control
// information crosses the step boundary.
#[derive(Debug)]
pub enum Status {
    Normal,
    Jumped,
    BreakLoop,
    ContinueLoop,
    Return(DataRef),
    Thrown(Error),
    Exit,
}

#[macro_export]
macro_rules! vmtry {
    ($e:expr, $ins:expr) => {
        match $e {
            Ok(v) => v,
            Err(err) => {
                return $crate::engine::Status::Thrown(err.at(&$ins.pos, &$ins.raw_code))
            }
        }
    };
}


// One machine: its memory, the built-in type identities, the run
// configuration, the output sink, and the bookkeeping the engine
// itself needs. Explicitly constructed, never global, so tests can
// hold several isolated machines at once.
pub struct Vm {
    pub memory: Memory,
    pub types: Types,
    pub config: RunConfig,
    pub io: Box<dyn Sink>,
    pub call_depth: usize,
    pub linked_modules: BTreeSet<String>,
}

impl Vm {
    pub fn new(config: RunConfig, io: Box<dyn Sink>) -> Vm {
        let mut vm = Vm {
            memory: Memory::new(),
            types: Types::new(),
            config,
            io,
            call_depth: 0,
            linked_modules: BTreeSet::new(),
        };
        vm.install_globals();
        vm
    }

    // Reset the machine and enter the main scope for the given entry
    // file. Pending input tokens belong to the previous run and are
    // discarded.
    pub fn initialize(&mut self, entry_path: &str) {
        self.memory.clear_all_scopes();
        self.call_depth = 0;
        self.io.flush_input_cache();
        self.install_globals();
        let main_name = crate::util::file_stem(entry_path);
        self.memory.acquire_scope("SRC-", Some(&main_name));
        self.memory.main_scope_name = format!("SRC-{}", main_name);
    }

    fn install_globals(&mut self) {
        let batch: Vec<(&str, DataRef)> = vec![
            ("SR", Data::new(Value::Null)),
            ("SN", Data::new(Value::Null)),
            ("SE", Data::new(Value::Null)),
            ("SS", Data::new(Value::Null)),
            ("true", Data::new(Value::Bool(true))),
            ("false", Data::new(Value::Bool(false))),
            ("null", Data::new(Value::Null)),
            ("tp-int", Data::new(Value::Str(self.types.int.to_string()))),
            ("tp-float", Data::new(Value::Str(self.types.float.to_string()))),
            ("tp-char", Data::new(Value::Str(self.types.char_.to_string()))),
            ("tp-bool", Data::new(Value::Str(self.types.boolean.to_string()))),
            ("tp-str", Data::new(Value::Str(self.types.string.to_string()))),
            ("tp-null", Data::new(Value::Str(self.types.null.to_string()))),
            ("tp-list", Data::new(Value::Str(self.types.list.to_string()))),
            ("tp-dict", Data::new(Value::Str(self.types.dict.to_string()))),
            ("tp-series", Data::new(Value::Str(self.types.series.to_string()))),
            ("tp-pair", Data::new(Value::Str(self.types.pair.to_string()))),
            ("tp-time", Data::new(Value::Str(self.types.time.to_string()))),
            ("tp-error", Data::new(Value::Str(self.types.error.to_string()))),
            ("tp-qot", Data::new(Value::Str(self.types.quote.to_string()))),
            ("tp-file", Data::new(Value::Str(self.types.file.to_string()))),
        ];
        let _ = self.memory.add_global_data_batch(batch);
    }

    // --- stepping ----------------------------------------------------------

    pub fn execute_set(&mut self, set: &InsSet) -> Status {
        let mut pc = 0;
        while pc < set.ins.len() {
            let ins = &set.ins[pc];
            trace!("{} {} {:?}", pc, ins.ri.name, ins.raw_code);
            let status = (ins.ri.exec)(self, set, ins, &mut pc);
            match status {
                Status::Normal => pc += 1,
                Status::Jumped => {}
                other => return other,
            }
        }
        Status::Normal
    }

    pub fn run_root(&mut self, set: &InsSet) -> Option<Error> {
        let result = match self.execute_set(set) {
            Status::Thrown(e) => {
                let rendered = e.render(self.config.profile);
                self.io.write_error(&rendered);
                Some(e)
            }
            _ => None,
        };
        self.io.flush();
        result
    }

    // --- frames ------------------------------------------------------------

    fn frame_entry(&self, what: &str, pos: &Pos) -> String {
        format!("    at {} ({})", what, pos)
    }

    // Run a scope-opening instruction's child set inside a fresh
    // scope. Release is unconditional: normal exit and error unwind
    // both return the scope to the pool.
    pub fn run_block(&mut self, ins: &Ins) -> Status {
        let child = match &ins.scope_set {
            Some(child) => child.clone(),
            None => return Status::Normal,
        };
        let prefix = format!("{}-", ins.ri.name);
        let scope = self.memory.acquire_scope(&prefix, None);
        let status = self.execute_set(&child);
        self.memory.release_scope(&scope);
        match status {
            Status::Thrown(mut e) => {
                e.add_trace(self.frame_entry(&format!("[Scope: {}]", prefix), &ins.pos));
                Status::Thrown(e)
            }
            other => other,
        }
    }

    // Invoke a callable. The returned value (if any) is stashed in
    // the global SR binding; the caller reads it from there.
    pub fn call_function(&mut self, ins: &Ins, func: Rc<FuncData>, args: Vec<DataRef>) -> Status {
        if self.call_depth >= MAX_CALL_DEPTH {
            return Status::Thrown(
                error::recursion(MAX_CALL_DEPTH).at(&ins.pos, &ins.raw_code),
            );
        }
        if args.len() != func.params.len() {
            return Status::Thrown(
                error::arg_number(&func.name, &format!("{}", func.params.len()), args.len())
                    .at(&ins.pos, &ins.raw_code),
            );
        }
        let scope = self.memory.acquire_scope("FUNC-", Some(&func.name));
        for (param, value) in func.params.iter().zip(args.into_iter()) {
            if let Err(e) = scope.borrow_mut().add_by_name(param, value) {
                self.memory.release_scope(&scope);
                return Status::Thrown(e.at(&ins.pos, &ins.raw_code));
            }
        }
        self.call_depth += 1;
        let status = self.execute_set(&func.body);
        self.call_depth -= 1;
        self.memory.release_scope(&scope);
        match status {
            Status::Return(value) => {
                vmtry!(self.memory.update_data_by_name("SR", value), ins);
                Status::Normal
            }
            Status::Normal => {
                vmtry!(self.memory.update_data_by_name("SR", Data::new(Value::Null)), ins);
                Status::Normal
            }
            // A stray loop escape dies at the call boundary.
            Status::BreakLoop | Status::ContinueLoop => Status::Normal,
            Status::Thrown(mut e) => {
                e.add_trace(self.frame_entry(
                    &format!("[Function: {}({})]", func.name, func.params.join(", ")),
                    &ins.pos,
                ));
                Status::Thrown(e)
            }
            other => other,
        }
    }

    // --- argument resolution -----------------------------------------------

    // Materialize or look up the value an argument denotes. Number and
    // string literals materialize; identifiers and keywords resolve
    // through memory (the preset globals cover true/false/null, the
    // S-registers and the tp-* names). Quotes are transparent: reads
    // follow the alias to the binding it names.
    pub fn arg_value(&mut self, arg: &Arg) -> Result<DataRef> {
        let data = self.arg_binding(arg)?;
        self.deref_quote(data)
    }

    // Same resolution without quote transparency, for opcodes that
    // operate on the alias itself.
    pub fn arg_binding(&mut self, arg: &Arg) -> Result<DataRef> {
        match arg.kind {
            ArgKind::Number => {
                if arg.text.contains('.') {
                    let v = arg.text.parse::<f64>().map_err(|_| bad_number(arg))?;
                    Ok(Data::new(Value::Float(v)))
                } else {
                    let v = arg.text.parse::<i64>().map_err(|_| bad_number(arg))?;
                    Ok(Data::new(Value::Int(v)))
                }
            }
            ArgKind::Str => Ok(Data::new(Value::Str(arg.string_content()))),
            ArgKind::Identifier | ArgKind::Keyword => self
                .memory
                .find_data_by_name(&arg.text)
                .map(|(_, data)| data)
                .ok_or_else(|| undefined_name(arg)),
            ArgKind::Unknown => Err(error::syntax(
                error::UNKNOWN,
                error::UNKNOWN,
                vec![format!("Unclassifiable argument: {}", arg.to_display())],
                vec!["Argument types include only 'identifier', 'string', 'number', 'keyword'."
                    .to_string()],
            )),
        }
    }

    pub fn deref_quote(&mut self, data: DataRef) -> Result<DataRef> {
        let mut current = data;
        for _ in 0..MAX_CALL_DEPTH {
            let quote_target = match &*current.value() {
                Value::Quote(id) => Some(id.clone()),
                _ => None,
            };
            let target = match quote_target {
                Some(id) => id,
                None => return Ok(current),
            };
            current = self
                .memory
                .find_data_by_id(&target)
                .ok_or_else(|| error::id_err(target.full_string()))?;
        }
        Err(error::runtime(
            vec!["Quote resolution did not terminate.".to_string()],
            vec!["Check for a quote that aliases itself.".to_string()],
        ))
    }

    // Bind a result to a destination argument. Writing through a name
    // bound to a Quote updates the aliased binding instead; otherwise
    // the nearest holder is updated, or a fresh binding is added to
    // the current scope.
    pub fn write_arg(&mut self, arg: &Arg, data: DataRef) -> Result<()> {
        if arg.kind != ArgKind::Identifier && arg.kind != ArgKind::Keyword {
            return Err(error::argument(
                format!("Assignment target must be an identifier: {}", arg.to_display()),
                vec!["Only named bindings can receive a value.".to_string()],
            ));
        }
        if let Some((_, existing)) = self.memory.find_data_by_name(&arg.text) {
            let quote_target = match &*existing.value() {
                Value::Quote(id) => Some(id.clone()),
                _ => None,
            };
            return match quote_target {
                Some(id) => {
                    if self.memory.update_data_by_id(&id, data)? {
                        Ok(())
                    } else {
                        Err(error::id_err(id.full_string()))
                    }
                }
                None => {
                    self.memory.update_data_by_name(&arg.text, data)?;
                    Ok(())
                }
            };
        }
        self.memory.add_data(&arg.text, data, "")?;
        Ok(())
    }

    // The recorded sides of a CompareGroup, resolved to live values.
    pub fn cmp_group_sides(&mut self, data: &DataRef) -> Result<Option<(DataRef, DataRef)>> {
        let group = match &*data.value() {
            Value::CmpGroup(l, r) => Some((l.clone(), r.clone())),
            _ => None,
        };
        match group {
            Some((l, r)) => {
                let left = self
                    .memory
                    .find_data_by_id(&l)
                    .ok_or_else(|| error::id_err(l.full_string()))?;
                let right = self
                    .memory
                    .find_data_by_id(&r)
                    .ok_or_else(|| error::id_err(r.full_string()))?;
                Ok(Some((left, right)))
            }
            None => Ok(None),
        }
    }

    pub fn int_of(&mut self, arg: &Arg) -> Result<i64> {
        let data = self.arg_value(arg)?;
        let value = data.value().clone();
        match value {
            Value::Int(v) => Ok(v),
            Value::Bool(v) => Ok(v as i64),
            Value::Char(v) => Ok(v as i64),
            Value::Float(v) if v.fract() == 0.0 => Ok(v as i64),
            other => Err(crate::value::expected(
                crate::value::TypeTag::Int.into(),
                &other,
            )),
        }
    }
}

fn bad_number(arg: &Arg) -> Error {
    error::value_err(
        vec![format!("Numeric literal does not parse: {}", arg.to_display())],
        vec!["Numbers are an optional sign, digits, and at most one dot.".to_string()],
    )
}

fn undefined_name(arg: &Arg) -> Error {
    Error::new(
        error::ErrorKind::Memory,
        error::UNKNOWN,
        error::UNKNOWN,
        vec![format!("No binding is named \"{}\" in any reachable scope.", arg.text)],
        vec!["Define the name with VAR or GLOBAL before using it.".to_string()],
    )
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::VecDeque;

    // A sink fed from a script instead of stdin, for exercising the
    // input modes.
    struct ScriptSink {
        out: Rc<RefCell<Vec<String>>>,
        lines: VecDeque<String>,
        cache: VecDeque<String>,
    }

    impl Sink for ScriptSink {
        fn write(&mut self, s: &str) {
            self.out.borrow_mut().push(s.to_string());
        }

        fn write_error(&mut self, s: &str) {
            self.out.borrow_mut().push(s.to_string());
        }

        fn flush(&mut self) {}

        fn read_line(&mut self) -> std::io::Result<String> {
            if let Some(cached) = self.cache.pop_front() {
                return Ok(cached);
            }
            self.lines.pop_front().ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "script exhausted")
            })
        }

        fn read_line_and_split(&mut self) -> std::io::Result<()> {
            let line = self.lines.pop_front().ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "script exhausted")
            })?;
            for word in line.split_whitespace() {
                self.cache.push_back(word.to_string());
            }
            Ok(())
        }

        fn has_next_string(&self) -> bool {
            !self.cache.is_empty()
        }

        fn next_string(&mut self) -> Option<String> {
            self.cache.pop_front()
        }

        fn flush_input_cache(&mut self) {
            self.cache.clear();
        }
    }

    fn run_in_vm(mut vm: Vm, captured: Rc<RefCell<Vec<String>>>, src: &str) -> (String, Option<Error>) {
        vm.initialize("test.ra");
        let set = match crate::parser::parse_source(&mut vm, "File", "test.ra", src) {
            Ok(set) => set,
            Err(e) => return (String::new(), Some(e)),
        };
        let err = vm.run_root(&set);
        let out = captured.borrow().concat();
        (out, err)
    }

    // Run a source program in a fresh machine, returning everything
    // the program wrote plus the top-level error, if any.
    pub fn run_source(src: &str) -> (String, Option<Error>) {
        let captured: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));
        let vm = Vm::new(RunConfig::default(), Box::new(captured.clone()));
        run_in_vm(vm, captured, src)
    }

    fn run_source_with_input(src: &str, input: &[&str]) -> (String, Option<Error>) {
        let captured: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));
        let sink = ScriptSink {
            out: captured.clone(),
            lines: input.iter().map(|l| l.to_string()).collect(),
            cache: VecDeque::new(),
        };
        let vm = Vm::new(RunConfig::default(), Box::new(sink));
        run_in_vm(vm, captured, src)
    }

    fn expect_stdout(src: &str, expected: &str) {
        let (out, err) = run_source(src);
        assert!(err.is_none(), "unexpected error: {:?}", err);
        assert_eq!(out, expected);
    }

    #[test]
    fn test_arithmetic_and_print() {
        expect_stdout(
            "VAR: a, 2\nVAR: b, 3\nOPT: c, a, b, +\nPRINT: c\n",
            "5\n",
        );
    }

    #[test]
    fn test_loop_with_break() {
        expect_stdout(
            "VAR: i, 0\n\
             REPEAT: 10\n\
               OPT: i, i, 1, +\n\
               IF: i, 5, RE\n\
                 BREAK:\n\
               END:\n\
             END:\n\
             PRINT: i\n",
            "5\n",
        );
    }

    #[test]
    fn test_function_return() {
        expect_stdout(
            "RFUNC: square, x\n\
               OPT: r, x, x, *\n\
               RET: r\n\
             END:\n\
             CALL: r2, square, 7\n\
             PRINT: r2\n",
            "49\n",
        );
    }

    #[test]
    fn test_detect_binds_error_kind() {
        expect_stdout(
            "DETECT:\n\
               VAR: a, 1\n\
               OPT: b, a, 0, /\n\
             END:\n\
             GET_AT: k, SE, \"kind\"\n\
             PRINT: k\n",
            "RuntimeError\n",
        );
    }

    #[test]
    fn test_detect_transfers_to_finally() {
        expect_stdout(
            "DETECT:\n\
               VAR: a, 1\n\
               OPT: b, a, 0, /\n\
               PRINT: \"unreached\"\n\
             END:\n\
             FINALLY:\n\
               PRINT: \"handled\"\n\
             END:\n\
             PRINT: \"after\"\n",
            "handled\nafter\n",
        );
    }

    #[test]
    fn test_atmp_scope_survives_until_finally() {
        expect_stdout(
            "ATMP:\n\
               VAR: kept, 11\n\
             END:\n\
             FINALLY:\n\
               PRINT: kept\n\
             END:\n",
            "11\n",
        );
    }

    #[test]
    fn test_dict_set_get() {
        expect_stdout(
            "VAR: d, tp-dict\n\
             SET_AT: d, \"k\", 42\n\
             GET_AT: v, d, \"k\"\n\
             PRINT: v\n",
            "42\n",
        );
    }

    #[test]
    fn test_uncaught_error_aborts_with_kind() {
        let (out, err) = run_source("VAR: a, 1\nOPT: b, a, 0, /\nPRINT: \"no\"\n");
        let err = err.expect("division by zero must reach the top");
        assert_eq!(err.kind, error::ErrorKind::Runtime);
        assert!(out.contains("RuntimeError"));
        assert!(!out.contains("no"));
    }

    #[test]
    fn test_error_trace_reads_root_to_leaf() {
        let src = "RFUNC: inner, x\n\
                     OPT: r, x, 0, /\n\
                     RET: r\n\
                   END:\n\
                   RFUNC: outer, x\n\
                     CALL: r, inner, x\n\
                     RET: r\n\
                   END:\n\
                   CALL: z, outer, 4\n";
        let (_, err) = run_source(src);
        let err = err.unwrap();
        assert_eq!(err.trace.len(), 2);
        assert!(err.trace[0].contains("outer"));
        assert!(err.trace[1].contains("inner"));
    }

    #[test]
    fn test_recursion_is_bounded() {
        let src = "RFUNC: down, x\n\
                     CALL: y, down, x\n\
                     RET: y\n\
                   END:\n\
                   CALL: z, down, 1\n";
        let (_, err) = run_source(src);
        assert_eq!(err.unwrap().kind, error::ErrorKind::Recursion);
    }

    #[test]
    fn test_quote_transparency() {
        expect_stdout(
            "VAR: a, 1\n\
             QOT: q, a\n\
             OPT: q, q, 10, +\n\
             PRINT: a\n\
             PRINT: q\n",
            "11\n11\n",
        );
    }

    #[test]
    fn test_iter_trav_and_reverse() {
        expect_stdout(
            "VAR: xs, tp-list\n\
             APPEND: xs, 1\n\
             APPEND: xs, 2\n\
             APPEND: xs, 3\n\
             ITER_TRAV: xs, item\n\
               PRINT: item\n\
             END:\n\
             ITER_REV_TRAV: xs, item\n\
               PRINT: item\n\
             END:\n",
            "1\n2\n3\n3\n2\n1\n",
        );
    }

    #[test]
    fn test_nested_iteration_of_same_value() {
        expect_stdout(
            "VAR: xs, tp-list\n\
             APPEND: xs, 1\n\
             APPEND: xs, 2\n\
             ITER_TRAV: xs, a\n\
               ITER_TRAV: xs, b\n\
                 PRINT: b\n\
               END:\n\
             END:\n",
            "1\n2\n1\n2\n",
        );
    }

    #[test]
    fn test_until_loop() {
        expect_stdout(
            "VAR: i, 0\n\
             UNTIL: i, 3, RE\n\
               OPT: i, i, 1, +\n\
             END:\n\
             PRINT: i\n",
            "3\n",
        );
    }

    // Jumps target positions within their own instruction set; a
    // label recorded in an enclosing set is out of reach.
    #[test]
    fn test_jump_and_labels() {
        expect_stdout(
            "VAR: i, 0\n\
             JUMP: skip\n\
             OPT: i, i, 99, +\n\
             SET: skip\n\
             PRINT: i\n",
            "0\n",
        );
        let (_, err) = run_source("JUMP: nowhere\n");
        assert_eq!(err.unwrap().kind, error::ErrorKind::Value);
    }

    #[test]
    fn test_custom_types_end_to_end() {
        expect_stdout(
            "TP_DEF: Animal\n\
             TP_ADD_INSF: Animal, name\n\
             TP_DEF: Dog, Animal\n\
             TP_ADD_INSF: Dog, breed, \"unknown\"\n\
             TP_NEW: rex, Dog\n\
             INST_SET: rex, name, \"rex\"\n\
             INST_GET: n, rex, name\n\
             PRINT: n\n\
             BELONG: b, rex, Animal\n\
             PRINT: b\n",
            "rex\ntrue\n",
        );
    }

    #[test]
    fn test_scenario_continue() {
        expect_stdout(
            "VAR: total, 0\n\
             VAR: i, 0\n\
             REPEAT: 5\n\
               OPT: i, i, 1, +\n\
               IF: i, 3, RE\n\
                 CONT:\n\
               END:\n\
               OPT: total, total, i, +\n\
             END:\n\
             PRINT: total\n",
            "12\n",
        );
    }

    #[test]
    fn test_exit_stops_execution() {
        expect_stdout("PRINT: \"a\"\nEXIT:\nPRINT: \"b\"\n", "a\n");
    }

    #[test]
    fn test_globals_preset() {
        expect_stdout("PRINT: SR\nPRINT: true\nPRINT: null\n", "null\ntrue\nnull\n");
        let (out, err) = run_source("PRINT: tp-int\n");
        assert!(err.is_none());
        assert!(out.starts_with("<Type(int):"));
    }

    #[test]
    fn test_input_line_and_numeric_modes() {
        let (out, err) = run_source_with_input(
            "INPUT: line\n\
             PRINT: line\n\
             INPUT: n, s-n\n\
             OPT: n, n, 1, +\n\
             PRINT: n\n",
            &["hello world", "41"],
        );
        assert!(err.is_none(), "unexpected error: {:?}", err);
        assert_eq!(out, "hello world\n42\n");
    }

    // One line feeds the unpack destinations and leaves its remaining
    // tokens cached for later word-wise reads.
    #[test]
    fn test_input_unpack_splits_one_line() {
        let (out, err) = run_source_with_input(
            "INPUT: a, b, s-unpack\n\
             PRINT: b\n\
             PRINT: a\n\
             INPUT: c, s-m\n\
             PRINT: c\n",
            &["3 4 5"],
        );
        assert!(err.is_none(), "unexpected error: {:?}", err);
        assert_eq!(out, "4\n3\n5\n");
    }

    #[test]
    fn test_input_float_mode() {
        let (out, err) = run_source_with_input("INPUT: x, s-f\nPRINT: x\n", &["2.5"]);
        assert!(err.is_none(), "unexpected error: {:?}", err);
        assert_eq!(out, "2.5\n");
        let (_, err) = run_source_with_input("INPUT: x, s-n\n", &["abc"]);
        assert_eq!(err.unwrap().kind, error::ErrorKind::Value);
    }

    #[test]
    fn test_input_exhausted_reader_is_io_error() {
        let (_, err) = run_source_with_input("INPUT: a, s-m\n", &[]);
        assert_eq!(err.unwrap().kind, error::ErrorKind::Io);
        let (_, err) = run_source_with_input("INPUT: a, b, s-unpack\n", &["only"]);
        assert_eq!(err.unwrap().kind, error::ErrorKind::Io);
    }
}
