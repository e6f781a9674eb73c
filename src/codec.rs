// The binary archive codec.
//
// An archive is: a 12-byte packed header (magic "RSI\x1A", three
// 16-bit version fields, a 16-bit profile), a length-prefixed manifest
// of statically linked module identities, then the root instruction
// set. All integers are little-endian; string length prefixes are
// fixed at 64 bits. The profile decides fidelity: Debug keeps
// positions and raw source lines, Testing drops the source but keeps
// positions, Release keeps neither, and Minified additionally omits
// the header (one is synthesized on read). Labels and structure
// survive every profile.

use std::collections::{BTreeSet, HashMap};
use std::io::Write;
use std::rc::Rc;

use serde::Deserialize;

use crate::engine::Vm;
use crate::error::{self, Error, Result};
use crate::ins::{Arg, ArgKind, Ins, InsSet, Pos};
use crate::opcodes::{ri_at, ri_index_of};

pub const MAGIC: [u8; 4] = [b'R', b'S', b'I', 0x1A];

pub const VERSION_MAJOR: u16 = 0;
pub const VERSION_MINOR: u16 = 1;
pub const VERSION_PATCH: u16 = 0;


#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
pub enum Profile {
    Debug,
    Testing,
    Release,
    Minified,
}

impl Profile {
    pub fn code(self) -> u16 {
        match self {
            Profile::Debug => 0,
            Profile::Testing => 1,
            Profile::Release => 2,
            Profile::Minified => 3,
        }
    }

    pub fn from_code(code: u16) -> Option<Profile> {
        match code {
            0 => Some(Profile::Debug),
            1 => Some(Profile::Testing),
            2 => Some(Profile::Release),
            3 => Some(Profile::Minified),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Profile::Debug => "Debug",
            Profile::Testing => "Testing",
            Profile::Release => "Release",
            Profile::Minified => "Minified",
        }
    }

    fn keeps_positions(self) -> bool {
        self < Profile::Release
    }

    fn keeps_raw_code(self) -> bool {
        self == Profile::Debug
    }
}


#[derive(Clone, Debug, PartialEq)]
pub struct Header {
    pub major: u16,
    pub minor: u16,
    pub patch: u16,
    pub profile: Profile,
}

impl Header {
    pub fn current(profile: Profile) -> Header {
        Header { major: VERSION_MAJOR, minor: VERSION_MINOR, patch: VERSION_PATCH, profile }
    }

    pub fn vm_version_info() -> String {
        format!("RVM version {}.{}.{}", VERSION_MAJOR, VERSION_MINOR, VERSION_PATCH)
    }

    pub fn version_info(&self, path: &str) -> String {
        format!(
            "RSI file \"{}\": version {}.{}.{}, profile {}",
            path,
            self.major,
            self.minor,
            self.patch,
            self.profile.name()
        )
    }

    fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&MAGIC);
        out.extend_from_slice(&self.major.to_le_bytes());
        out.extend_from_slice(&self.minor.to_le_bytes());
        out.extend_from_slice(&self.patch.to_le_bytes());
        out.extend_from_slice(&self.profile.code().to_le_bytes());
    }

    fn read(r: &mut Reader, path: &str) -> Result<Header> {
        let magic = r.bytes(4, path)?;
        if magic != &MAGIC[..] {
            return Err(invalid_format(path, "magic number mismatch"));
        }
        let major = r.u16(path)?;
        let minor = r.u16(path)?;
        let patch = r.u16(path)?;
        let profile = Profile::from_code(r.u16(path)?)
            .ok_or_else(|| invalid_format(path, "unknown serialization profile"))?;
        let header = Header { major, minor, patch, profile };
        header.validate(path)?;
        Ok(header)
    }

    // An archive from a newer machine than this one is fatal.
    pub fn validate(&self, path: &str) -> Result<()> {
        let own = (VERSION_MAJOR, VERSION_MINOR, VERSION_PATCH);
        if (self.major, self.minor, self.patch) > own {
            return Err(Error::new(
                error::ErrorKind::File,
                error::UNKNOWN,
                error::UNKNOWN,
                vec![
                    format!("Unsupported archive version in \"{}\".", path),
                    format!("Archive: {}.{}.{}", self.major, self.minor, self.patch),
                    format!("{}", Header::vm_version_info()),
                ],
                vec!["Rebuild the archive with this machine's version.".to_string()],
            ));
        }
        Ok(())
    }
}

fn invalid_format(path: &str, detail: &str) -> Error {
    Error::new(
        error::ErrorKind::File,
        error::UNKNOWN,
        error::UNKNOWN,
        vec![
            "Invalid file format.".to_string(),
            format!("Target File: {}", path),
            detail.to_string(),
        ],
        vec!["Only archives produced by this machine's codec can be read.".to_string()],
    )
}


// --- byte-level reader -----------------------------------------------------

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Reader<'a> {
        Reader { data, pos: 0 }
    }

    fn bytes(&mut self, n: usize, path: &str) -> Result<&'a [u8]> {
        if self.pos + n > self.data.len() {
            return Err(invalid_format(path, "unexpected end of archive"));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self, path: &str) -> Result<u8> {
        Ok(self.bytes(1, path)?[0])
    }

    fn u16(&mut self, path: &str) -> Result<u16> {
        let b = self.bytes(2, path)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self, path: &str) -> Result<u32> {
        let b = self.bytes(4, path)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self, path: &str) -> Result<u64> {
        let b = self.bytes(8, path)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(u64::from_le_bytes(raw))
    }

    fn string(&mut self, path: &str) -> Result<String> {
        let len = self.u64(path)? as usize;
        let bytes = self.bytes(len, path)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| invalid_format(path, "string payload is not UTF-8"))
    }

    fn starts_with_magic(&self) -> bool {
        self.data.len() >= 4 && self.data[..4] == MAGIC[..]
    }
}

fn w_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn w_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn w_string(out: &mut Vec<u8>, s: &str) {
    w_u64(out, s.len() as u64);
    out.extend_from_slice(s.as_bytes());
}

fn w_pos(out: &mut Vec<u8>, pos: &Pos, profile: Profile) {
    if profile.keeps_positions() {
        w_u32(out, pos.line);
        w_u32(out, pos.column);
        w_string(out, &pos.filepath);
    }
}

fn r_pos(r: &mut Reader, profile: Profile, path: &str) -> Result<Pos> {
    if profile.keeps_positions() {
        let line = r.u32(path)?;
        let column = r.u32(path)?;
        let filepath = r.string(path)?;
        Ok(Pos { line, column, filepath })
    } else {
        Ok(Pos::default())
    }
}


// --- instruction tree ------------------------------------------------------

fn write_set(out: &mut Vec<u8>, set: &InsSet, profile: Profile) {
    w_string(out, &set.prefix);
    if profile.keeps_positions() {
        w_string(out, &set.scope_leader);
        w_pos(out, &set.leader_pos, profile);
    }
    out.push(set.delayed_release as u8);
    w_u64(out, set.ins.len() as u64);
    for ins in &set.ins {
        w_pos(out, &ins.pos, profile);
        if profile.keeps_raw_code() {
            w_string(out, &ins.raw_code);
        }
        w_u32(out, ri_index_of(ins.ri) as u32);
        w_u64(out, ins.args.len() as u64);
        for arg in &ins.args {
            w_pos(out, &arg.pos, profile);
            out.push(arg.kind.code());
            w_string(out, &arg.text);
        }
        out.push(ins.delayed_release as u8);
        match &ins.scope_set {
            Some(child) => {
                out.push(1);
                write_set(out, child, profile);
            }
            None => out.push(0),
        }
    }
    w_u64(out, set.end_pointer as u64);
    let labels: std::collections::BTreeMap<&String, &usize> = set.labels.iter().collect();
    w_u64(out, labels.len() as u64);
    for (name, index) in labels {
        w_string(out, name);
        w_u64(out, *index as u64);
    }
}

fn read_set(r: &mut Reader, profile: Profile, path: &str) -> Result<InsSet> {
    let prefix = r.string(path)?;
    let mut set = InsSet::new(&prefix);
    if profile.keeps_positions() {
        let leader = r.string(path)?;
        let leader_pos = r_pos(r, profile, path)?;
        set.set_scope_leader(&leader, leader_pos);
    }
    set.delayed_release = r.u8(path)? != 0;
    let count = r.u64(path)? as usize;
    for _ in 0..count {
        let pos = r_pos(r, profile, path)?;
        let raw_code = if profile.keeps_raw_code() {
            r.string(path)?
        } else {
            String::new()
        };
        let ri_index = r.u32(path)? as usize;
        let ri = ri_at(ri_index)
            .ok_or_else(|| invalid_format(path, "opcode index out of range"))?;
        let arg_count = r.u64(path)? as usize;
        let mut args = Vec::with_capacity(arg_count);
        for _ in 0..arg_count {
            let arg_pos = r_pos(r, profile, path)?;
            let kind = ArgKind::from_code(r.u8(path)?)
                .ok_or_else(|| invalid_format(path, "unknown argument kind"))?;
            let text = r.string(path)?;
            args.push(Arg::with_kind(arg_pos, kind, &text));
        }
        let mut ins = Ins::new(pos, &raw_code, ri, args);
        ins.delayed_release = r.u8(path)? != 0;
        if r.u8(path)? != 0 {
            ins.scope_set = Some(Rc::new(read_set(r, profile, path)?));
        }
        set.add_ins(ins);
    }
    set.end_pointer = r.u64(path)? as usize;
    let label_count = r.u64(path)? as usize;
    let mut labels = HashMap::new();
    for _ in 0..label_count {
        let name = r.string(path)?;
        let index = r.u64(path)? as usize;
        labels.insert(name, index);
    }
    set.labels = labels;
    Ok(set)
}


// --- manifest --------------------------------------------------------------

fn write_manifest(out: &mut Vec<u8>, manifest: &BTreeSet<String>) {
    w_u64(out, manifest.len() as u64);
    for ident in manifest {
        w_string(out, ident);
    }
}

fn read_manifest(r: &mut Reader, path: &str) -> Result<BTreeSet<String>> {
    let count = r.u64(path)? as usize;
    let mut manifest = BTreeSet::new();
    for _ in 0..count {
        manifest.insert(r.string(path)?);
    }
    Ok(manifest)
}


// --- archives --------------------------------------------------------------

pub fn archive_bytes(set: &InsSet, profile: Profile, manifest: &BTreeSet<String>) -> Vec<u8> {
    let mut out = Vec::new();
    if profile != Profile::Minified {
        Header::current(profile).write(&mut out);
    }
    write_manifest(&mut out, manifest);
    write_set(&mut out, set, profile);
    out
}

// A Minified archive has no header; one is synthesized with the
// current version when the magic is absent.
pub fn parse_archive(bytes: &[u8], path: &str) -> Result<(Header, BTreeSet<String>, InsSet)> {
    let mut r = Reader::new(bytes);
    let header = if r.starts_with_magic() {
        Header::read(&mut r, path)?
    } else {
        Header::current(Profile::Minified)
    };
    let manifest = read_manifest(&mut r, path)?;
    let set = read_set(&mut r, header.profile, path)?;
    Ok((header, manifest, set))
}

pub fn save_archive(
    path: &str,
    set: &InsSet,
    profile: Profile,
    manifest: &BTreeSet<String>,
) -> Result<()> {
    let bytes = archive_bytes(set, profile, manifest);
    let mut file = std::fs::File::create(path)
        .map_err(|e| error::file_err(path, &format!("Create failed: {}", e)))?;
    file.write_all(&bytes)
        .map_err(|e| error::file_err(path, &format!("Write failed: {}", e)))
}

pub fn load_archive(vm: &mut Vm, path: &str) -> Result<InsSet> {
    let bytes =
        std::fs::read(path).map_err(|e| error::file_err(path, &format!("Read failed: {}", e)))?;
    let (_, manifest, set) = parse_archive(&bytes, path)?;
    vm.linked_modules.extend(manifest);
    Ok(set)
}

pub fn read_archive_version(path: &str) -> Result<Header> {
    let bytes =
        std::fs::read(path).map_err(|e| error::file_err(path, &format!("Read failed: {}", e)))?;
    let mut r = Reader::new(&bytes);
    Header::read(&mut r, path)
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunConfig;
    use std::cell::RefCell;

    fn parse_program(src: &str) -> InsSet {
        let mut vm = Vm::new(RunConfig::default(), Box::new(Vec::<String>::new()));
        vm.initialize("test.ra");
        crate::parser::parse_source(&mut vm, "File", "test.ra", src).unwrap()
    }

    // Structural equivalence, ignoring the per-object identities that
    // are unique by construction.
    fn assert_equivalent(a: &InsSet, b: &InsSet, positions: bool, raw: bool) {
        assert_eq!(a.prefix, b.prefix);
        assert_eq!(a.end_pointer, b.end_pointer);
        assert_eq!(a.labels, b.labels);
        assert_eq!(a.delayed_release, b.delayed_release);
        assert_eq!(a.ins.len(), b.ins.len());
        for (x, y) in a.ins.iter().zip(b.ins.iter()) {
            assert_eq!(x.ri.name, y.ri.name);
            assert_eq!(x.delayed_release, y.delayed_release);
            if positions {
                assert_eq!(x.pos, y.pos);
            }
            if raw {
                assert_eq!(x.raw_code, y.raw_code);
            }
            assert_eq!(x.args.len(), y.args.len());
            for (ax, ay) in x.args.iter().zip(y.args.iter()) {
                assert_eq!(ax.kind, ay.kind);
                assert_eq!(ax.text, ay.text);
                if positions {
                    assert_eq!(ax.pos, ay.pos);
                }
            }
            match (&x.scope_set, &y.scope_set) {
                (Some(cx), Some(cy)) => assert_equivalent(cx, cy, positions, raw),
                (None, None) => {}
                _ => panic!("child set mismatch on {}", x.ri.name),
            }
        }
    }

    const PROGRAM: &str = "VAR: i, 0\n\
                           SET: top\n\
                           REPEAT: 3\n\
                             OPT: i, i, 1, +\n\
                             IF: i, 2, RE\n\
                               BREAK:\n\
                             END:\n\
                           END:\n\
                           PRINT: i, \"done\"\n";

    #[test]
    fn test_debug_roundtrip_is_structural_identity() {
        let set = parse_program(PROGRAM);
        let manifest: BTreeSet<String> = ["lib.ra".to_string()].iter().cloned().collect();
        let bytes = archive_bytes(&set, Profile::Debug, &manifest);
        let (header, read_manifest, read_set) = parse_archive(&bytes, "a.rsi").unwrap();
        assert_eq!(header, Header::current(Profile::Debug));
        assert_eq!(read_manifest, manifest);
        assert_equivalent(&set, &read_set, true, true);
    }

    #[test]
    fn test_testing_profile_drops_source_keeps_positions() {
        let set = parse_program(PROGRAM);
        let bytes = archive_bytes(&set, Profile::Testing, &BTreeSet::new());
        let (_, _, read_set) = parse_archive(&bytes, "a.rsi").unwrap();
        assert_equivalent(&set, &read_set, true, false);
        assert_eq!(read_set.ins[0].raw_code, "");
        assert_eq!(read_set.ins[0].pos.line, 1);
    }

    #[test]
    fn test_release_roundtrip_keeps_structure_and_labels() {
        let set = parse_program(PROGRAM);
        let bytes = archive_bytes(&set, Profile::Release, &BTreeSet::new());
        let (_, _, read_set) = parse_archive(&bytes, "a.rsi").unwrap();
        assert_equivalent(&set, &read_set, false, false);
        assert_eq!(read_set.ins[0].pos, Pos::default());
        assert_eq!(read_set.labels, set.labels);
    }

    #[test]
    fn test_minified_has_no_header_and_synthesizes_one() {
        let set = parse_program(PROGRAM);
        let bytes = archive_bytes(&set, Profile::Minified, &BTreeSet::new());
        assert!(bytes[..4] != MAGIC[..]);
        let (header, _, read_set) = parse_archive(&bytes, "a.rsi").unwrap();
        assert_eq!(header, Header::current(Profile::Minified));
        assert_equivalent(&set, &read_set, false, false);
    }

    #[test]
    fn test_magic_mismatch_is_fatal() {
        let set = parse_program(PROGRAM);
        let mut bytes = archive_bytes(&set, Profile::Debug, &BTreeSet::new());
        bytes[0] = b'X';
        // Without the magic the stream reads as headerless Minified
        // and promptly fails to decode.
        assert!(parse_archive(&bytes, "a.rsi").is_err());
    }

    #[test]
    fn test_future_version_is_fatal() {
        let set = parse_program(PROGRAM);
        let mut bytes = archive_bytes(&set, Profile::Debug, &BTreeSet::new());
        bytes[4] = 0xFF;
        bytes[5] = 0xFF;
        let err = parse_archive(&bytes, "a.rsi").unwrap_err();
        assert_eq!(err.kind, error::ErrorKind::File);
        assert!(err.info.iter().any(|l| l.contains("Unsupported archive version")));
    }

    #[test]
    fn test_truncated_archive_is_fatal() {
        let set = parse_program(PROGRAM);
        let bytes = archive_bytes(&set, Profile::Debug, &BTreeSet::new());
        let err = parse_archive(&bytes[..bytes.len() / 2], "a.rsi").unwrap_err();
        assert!(err.info.iter().any(|l| l.contains("Invalid file format")));
    }

    // Scenario: a program serialized under Release re-runs from the
    // archive with identical output.
    #[test]
    fn test_release_archive_reruns_identically() {
        let src = "VAR: d, tp-dict\n\
                   SET_AT: d, \"k\", 42\n\
                   GET_AT: v, d, \"k\"\n\
                   PRINT: v\n";

        let run_set = |set: &InsSet| {
            let captured: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));
            let mut vm = Vm::new(RunConfig::default(), Box::new(captured.clone()));
            vm.initialize("test.ra");
            assert!(vm.run_root(set).is_none());
            let out = captured.borrow().concat();
            out
        };

        let set = parse_program(src);
        let direct = run_set(&set);
        assert_eq!(direct, "42\n");

        let bytes = archive_bytes(&set, Profile::Release, &BTreeSet::new());
        let (_, _, reread) = parse_archive(&bytes, "a.rsi").unwrap();
        assert_eq!(run_set(&reread), direct);
    }
}
